//! One-shot promise with callback registration and blocking wait.
//!
//! State mutations happen under a per-promise lock; the callbacks that a
//! transition triggers are snapshotted under that lock and dispatched only
//! after it is released, so a callback may freely re-enter the promise
//! (register more callbacks, pipe it, read its state).

use super::{
    combinators,
    dispatch::{Affinity, Dispatcher},
    errors::{PoolError, TaskError},
    pipeline::CollectionPromise,
    task::TaskId,
};
use parking_lot::{Condvar, Mutex, ReentrantMutex};
use std::{
    fmt, mem,
    future::Future,
    panic::{catch_unwind, AssertUnwindSafe},
    pin::Pin,
    sync::Arc,
    task::{Context, Poll, Waker},
    time::{Duration, Instant},
};

/// Values that can travel through promises: shared between the settling
/// thread, callback threads and blocked readers.
pub trait Value: Clone + Send + Sync + 'static {}

impl<T: Clone + Send + Sync + 'static> Value for T {}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PromiseState {
    Pending,
    Resolved,
    Rejected,
    Cancelled,
}

impl PromiseState {
    #[inline]
    pub fn is_terminal(self) -> bool {
        !matches!(self, PromiseState::Pending)
    }
}

/// Back-reference from a task-owned promise to whoever can cancel the task.
pub(crate) trait CancelLink: Send + Sync {
    fn cancel(&self, may_interrupt: bool);
}

impl<F> CancelLink for F
where
    F: Fn(bool) + Send + Sync,
{
    fn cancel(&self, may_interrupt: bool) {
        self(may_interrupt)
    }
}

type DoneFn<T> = Box<dyn FnOnce(&T) + Send>;
type FailFn = Box<dyn FnOnce(&TaskError) + Send>;
type ProgressFn<P> = Arc<dyn Fn(&P) + Send + Sync>;
type SignalFn = Box<dyn FnOnce() + Send>;

struct Tagged<F> {
    affinity: Affinity,
    callback: F,
}

struct Callbacks<T, P> {
    done: Vec<Tagged<DoneFn<T>>>,
    fail: Vec<Tagged<FailFn>>,
    progress: Vec<Tagged<ProgressFn<P>>>,
    cancel: Vec<Tagged<SignalFn>>,
    always: Vec<Tagged<SignalFn>>,
}

impl<T, P> Default for Callbacks<T, P> {
    fn default() -> Self {
        Self {
            done: Vec::new(),
            fail: Vec::new(),
            progress: Vec::new(),
            cancel: Vec::new(),
            always: Vec::new(),
        }
    }
}

struct Inner<T, P> {
    state: PromiseState,
    value: Option<Arc<T>>,
    error: Option<TaskError>,
    callbacks: Callbacks<T, P>,
    wakers: Vec<Waker>,
}

impl<T: Value, P> Inner<T, P> {
    fn ensure_pending(&self) -> Result<(), PoolError> {
        match self.state {
            PromiseState::Pending => Ok(()),
            state => Err(PoolError::IllegalPromiseTransition { state }),
        }
    }

    /// Moves to a terminal state and hands back every registered callback.
    fn settle(&mut self, state: PromiseState) -> Callbacks<T, P> {
        self.state = state;
        for waker in self.wakers.drain(..) {
            waker.wake();
        }
        mem::take(&mut self.callbacks)
    }

    fn outcome(&self) -> Result<T, TaskError> {
        match self.state {
            PromiseState::Resolved => match &self.value {
                Some(value) => Ok(T::clone(value)),
                None => Err(TaskError::AbsentValue),
            },
            PromiseState::Rejected => Err(self.error.clone().unwrap_or(TaskError::AbsentValue)),
            PromiseState::Cancelled => Err(TaskError::Cancelled),
            PromiseState::Pending => Err(TaskError::Timeout),
        }
    }
}

struct Shared<T, P> {
    task: Option<TaskId>,
    dispatcher: Dispatcher,
    link: Option<Arc<dyn CancelLink>>,
    inner: Mutex<Inner<T, P>>,
    settled: Condvar,
    progress_order: ReentrantMutex<()>,
}

/// Handle to a one-shot result of type `T` reporting progress values of
/// type `P`. Clones share the same state.
pub struct Promise<T, P = ()> {
    shared: Arc<Shared<T, P>>,
}

impl<T, P> Clone for Promise<T, P> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T: Value, P: Value> Default for Promise<T, P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Value, P: Value> Promise<T, P> {
    /// A pending promise whose callbacks always run inline.
    pub fn new() -> Self {
        Self::with_dispatcher(Dispatcher::inline())
    }

    pub fn with_dispatcher(dispatcher: Dispatcher) -> Self {
        Self::build(dispatcher, None, None)
    }

    pub(crate) fn for_task(
        dispatcher: Dispatcher,
        task: TaskId,
        link: Arc<dyn CancelLink>,
    ) -> Self {
        Self::build(dispatcher, Some(task), Some(link))
    }

    /// A promise whose cancellation is forwarded through `link`.
    pub(crate) fn linked(dispatcher: Dispatcher, link: Arc<dyn CancelLink>) -> Self {
        Self::build(dispatcher, None, Some(link))
    }

    fn build(
        dispatcher: Dispatcher,
        task: Option<TaskId>,
        link: Option<Arc<dyn CancelLink>>,
    ) -> Self {
        let promise = Self {
            shared: Arc::new(Shared {
                task,
                dispatcher,
                link,
                inner: Mutex::new(Inner {
                    state: PromiseState::Pending,
                    value: None,
                    error: None,
                    callbacks: Callbacks::default(),
                    wakers: Vec::new(),
                }),
                settled: Condvar::new(),
                progress_order: ReentrantMutex::new(()),
            }),
        };
        promise.trace_state(PromiseState::Pending);
        promise
    }

    pub fn resolved(value: T) -> Self {
        let promise = Self::new();
        promise.settle_resolved(value);
        promise
    }

    pub fn rejected(error: TaskError) -> Self {
        let promise = Self::new();
        promise.settle_rejected(error);
        promise
    }

    pub(crate) fn dispatcher(&self) -> &Dispatcher {
        &self.shared.dispatcher
    }

    /// Id of the task owning this promise, if any.
    pub fn task_id(&self) -> Option<TaskId> {
        self.shared.task
    }

    pub fn state(&self) -> PromiseState {
        self.shared.inner.lock().state
    }

    pub fn is_pending(&self) -> bool {
        self.state() == PromiseState::Pending
    }

    pub fn is_resolved(&self) -> bool {
        self.state() == PromiseState::Resolved
    }

    pub fn is_rejected(&self) -> bool {
        self.state() == PromiseState::Rejected
    }

    pub fn is_cancelled(&self) -> bool {
        self.state() == PromiseState::Cancelled
    }

    pub fn is_completed(&self) -> bool {
        self.state().is_terminal()
    }

    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    // ---- transitions -------------------------------------------------

    /// Resolves the promise and fires its done and always callbacks.
    ///
    /// Fails with [`PoolError::IllegalPromiseTransition`] if the promise is
    /// no longer pending.
    pub fn resolve(&self, value: T) -> Result<(), PoolError> {
        let (callbacks, value) = {
            let mut inner = self.shared.inner.lock();
            inner.ensure_pending()?;
            let value = Arc::new(value);
            inner.value = Some(Arc::clone(&value));
            let callbacks = inner.settle(PromiseState::Resolved);
            self.shared.settled.notify_all();
            (callbacks, value)
        };
        self.trace_state(PromiseState::Resolved);

        for tagged in callbacks.done {
            self.fire_done(tagged, Arc::clone(&value));
        }
        self.fire_signals(callbacks.always);
        Ok(())
    }

    /// Rejects the promise and fires its fail and always callbacks.
    pub fn reject(&self, error: TaskError) -> Result<(), PoolError> {
        let (callbacks, error) = {
            let mut inner = self.shared.inner.lock();
            inner.ensure_pending()?;
            inner.error = Some(error.clone());
            let callbacks = inner.settle(PromiseState::Rejected);
            self.shared.settled.notify_all();
            (callbacks, error)
        };
        self.trace_state(PromiseState::Rejected);

        for tagged in callbacks.fail {
            self.fire_fail(tagged, error.clone());
        }
        self.fire_signals(callbacks.always);
        Ok(())
    }

    /// Cancels the promise, fires its cancel callbacks and, for a task
    /// promise, forwards the cancellation to the task. The executing thread
    /// is interrupted only when `may_interrupt` is set.
    pub fn cancel(&self, may_interrupt: bool) -> Result<(), PoolError> {
        let callbacks = {
            let mut inner = self.shared.inner.lock();
            inner.ensure_pending()?;
            let callbacks = inner.settle(PromiseState::Cancelled);
            self.shared.settled.notify_all();
            callbacks
        };
        self.trace_state(PromiseState::Cancelled);

        let link = self.shared.link.clone();
        let cancel_callbacks = callbacks.cancel;
        let dispatcher = self.shared.dispatcher.clone();
        let run_in_background = dispatcher.is_ui_thread() && !cancel_callbacks.is_empty();
        let propagate = move || {
            if let Some(link) = link {
                link.cancel(may_interrupt);
            }
            for tagged in cancel_callbacks {
                dispatcher.dispatch(tagged.affinity, tagged.callback);
            }
        };
        if run_in_background {
            self.shared.dispatcher.run_in_background(Box::new(propagate));
        } else {
            propagate();
        }
        Ok(())
    }

    /// Reports progress to the progress callbacks. Only legal while pending.
    pub fn notify_progress(&self, progress: P) -> Result<(), PoolError> {
        let callbacks: Vec<(Affinity, ProgressFn<P>)> = {
            let inner = self.shared.inner.lock();
            inner.ensure_pending()?;
            inner
                .callbacks
                .progress
                .iter()
                .map(|tagged| (tagged.affinity, Arc::clone(&tagged.callback)))
                .collect()
        };
        if callbacks.is_empty() {
            return Ok(());
        }

        // reentrant: a progress callback may report progress on this promise
        let _in_order = self.shared.progress_order.lock();
        let progress = Arc::new(progress);
        for (affinity, callback) in callbacks {
            let progress = Arc::clone(&progress);
            self.shared
                .dispatcher
                .dispatch(affinity, Box::new(move || callback(&*progress)));
        }
        Ok(())
    }

    pub(crate) fn try_resolve(&self, value: T) -> bool {
        self.resolve(value).is_ok()
    }

    pub(crate) fn try_reject(&self, error: TaskError) -> bool {
        self.reject(error).is_ok()
    }

    pub(crate) fn try_cancel(&self, may_interrupt: bool) -> bool {
        self.cancel(may_interrupt).is_ok()
    }

    fn settle_resolved(&self, value: T) {
        if !self.try_resolve(value) {
            tracing::trace!(task = ?self.shared.task, "resolve ignored, promise already settled");
        }
    }

    fn settle_rejected(&self, error: TaskError) {
        if !self.try_reject(error) {
            tracing::trace!(task = ?self.shared.task, "reject ignored, promise already settled");
        }
    }

    // ---- registration ------------------------------------------------

    pub fn done<F>(&self, callback: F) -> &Self
    where
        F: FnOnce(&T) + Send + 'static,
    {
        self.done_with(Affinity::Background, callback)
    }

    /// Registers a done callback. If the promise is already resolved the
    /// callback fires right away.
    pub fn done_with<F>(&self, affinity: Affinity, callback: F) -> &Self
    where
        F: FnOnce(&T) + Send + 'static,
    {
        let tagged = Tagged {
            affinity,
            callback: Box::new(callback) as DoneFn<T>,
        };
        let value = {
            let mut inner = self.shared.inner.lock();
            match inner.state {
                PromiseState::Pending => {
                    inner.callbacks.done.push(tagged);
                    return self;
                }
                PromiseState::Resolved => inner.value.clone(),
                _ => None,
            }
        };
        if let Some(value) = value {
            self.fire_done(tagged, value);
        }
        self
    }

    pub fn fail<F>(&self, callback: F) -> &Self
    where
        F: FnOnce(&TaskError) + Send + 'static,
    {
        self.fail_with(Affinity::Background, callback)
    }

    pub fn fail_with<F>(&self, affinity: Affinity, callback: F) -> &Self
    where
        F: FnOnce(&TaskError) + Send + 'static,
    {
        let tagged = Tagged {
            affinity,
            callback: Box::new(callback) as FailFn,
        };
        let error = {
            let mut inner = self.shared.inner.lock();
            match inner.state {
                PromiseState::Pending => {
                    inner.callbacks.fail.push(tagged);
                    return self;
                }
                PromiseState::Rejected => inner.error.clone(),
                _ => None,
            }
        };
        if let Some(error) = error {
            self.fire_fail(tagged, error);
        }
        self
    }

    /// Progress callbacks are only kept while the promise is pending.
    pub fn progress<F>(&self, callback: F) -> &Self
    where
        F: Fn(&P) + Send + Sync + 'static,
    {
        self.progress_with(Affinity::Background, callback)
    }

    pub fn progress_with<F>(&self, affinity: Affinity, callback: F) -> &Self
    where
        F: Fn(&P) + Send + Sync + 'static,
    {
        let mut inner = self.shared.inner.lock();
        if inner.state == PromiseState::Pending {
            inner.callbacks.progress.push(Tagged {
                affinity,
                callback: Arc::new(callback),
            });
        }
        self
    }

    pub fn on_cancel<F>(&self, callback: F) -> &Self
    where
        F: FnOnce() + Send + 'static,
    {
        self.on_cancel_with(Affinity::Background, callback)
    }

    pub fn on_cancel_with<F>(&self, affinity: Affinity, callback: F) -> &Self
    where
        F: FnOnce() + Send + 'static,
    {
        self.register_signal(affinity, Box::new(callback), |inner, tagged| {
            match inner.state {
                PromiseState::Pending => {
                    inner.callbacks.cancel.push(tagged);
                    None
                }
                PromiseState::Cancelled => Some(tagged),
                _ => None,
            }
        })
    }

    /// Fires once the promise is resolved or rejected (not on cancellation).
    pub fn always<F>(&self, callback: F) -> &Self
    where
        F: FnOnce() + Send + 'static,
    {
        self.always_with(Affinity::Background, callback)
    }

    pub fn always_with<F>(&self, affinity: Affinity, callback: F) -> &Self
    where
        F: FnOnce() + Send + 'static,
    {
        self.register_signal(affinity, Box::new(callback), |inner, tagged| {
            match inner.state {
                PromiseState::Pending => {
                    inner.callbacks.always.push(tagged);
                    None
                }
                PromiseState::Resolved | PromiseState::Rejected => Some(tagged),
                PromiseState::Cancelled => None,
            }
        })
    }

    fn register_signal<R>(&self, affinity: Affinity, callback: SignalFn, route: R) -> &Self
    where
        R: FnOnce(&mut Inner<T, P>, Tagged<SignalFn>) -> Option<Tagged<SignalFn>>,
    {
        let tagged = Tagged { affinity, callback };
        let fire_now = {
            let mut inner = self.shared.inner.lock();
            route(&mut *inner, tagged)
        };
        if let Some(tagged) = fire_now {
            self.shared.dispatcher.dispatch(tagged.affinity, tagged.callback);
        }
        self
    }

    fn fire_done(&self, tagged: Tagged<DoneFn<T>>, value: Arc<T>) {
        let callback = tagged.callback;
        self.shared
            .dispatcher
            .dispatch(tagged.affinity, Box::new(move || callback(&*value)));
    }

    fn fire_fail(&self, tagged: Tagged<FailFn>, error: TaskError) {
        let callback = tagged.callback;
        self.shared
            .dispatcher
            .dispatch(tagged.affinity, Box::new(move || callback(&error)));
    }

    fn fire_signals(&self, callbacks: Vec<Tagged<SignalFn>>) {
        for tagged in callbacks {
            self.shared.dispatcher.dispatch(tagged.affinity, tagged.callback);
        }
    }

    fn trace_state(&self, state: PromiseState) {
        tracing::trace!(task = ?self.shared.task, ?state, "promise state changed");
    }

    // ---- blocking reads ----------------------------------------------

    /// Blocks until the promise settles. Returns the value, the rejection
    /// error, or [`TaskError::Cancelled`].
    pub fn get_result(&self) -> Result<T, TaskError> {
        let mut inner = self.shared.inner.lock();
        while inner.state == PromiseState::Pending {
            self.shared.settled.wait(&mut inner);
        }
        inner.outcome()
    }

    /// Like [`get_result`](Self::get_result) but gives up with
    /// [`TaskError::Timeout`] once `timeout` elapses.
    pub fn get_result_timeout(&self, timeout: Duration) -> Result<T, TaskError> {
        let deadline = Instant::now() + timeout;
        let mut inner = self.shared.inner.lock();
        while inner.state == PromiseState::Pending {
            if self.shared.settled.wait_until(&mut inner, deadline).timed_out() {
                break;
            }
        }
        inner.outcome()
    }

    /// Blocks until the promise settles; any outcome but resolution yields
    /// `default`.
    pub fn get_result_or_default(&self, default: T) -> T {
        self.get_result().unwrap_or(default)
    }

    // ---- composition -------------------------------------------------

    /// Forwards every outcome of this promise into `target`.
    pub fn pipe(&self, target: &Promise<T, P>) -> Promise<T, P> {
        let on_done = target.clone();
        let on_fail = target.clone();
        let on_progress = target.clone();
        let on_cancel = target.clone();
        self.done(move |value| {
            on_done.try_resolve(value.clone());
        })
        .fail(move |error| {
            on_fail.try_reject(error.clone());
        })
        .progress(move |progress| {
            // the target may have been settled on its own meanwhile
            let _ = on_progress.notify_progress(progress.clone());
        })
        .on_cancel(move || {
            on_cancel.try_cancel(false);
        });
        target.clone()
    }

    /// Chains a promise-returning continuation.
    pub fn then<U, F>(&self, next: F) -> Promise<U, P>
    where
        U: Value,
        F: FnOnce(&T) -> Promise<U, P> + Send + 'static,
    {
        let out = Promise::with_dispatcher(self.shared.dispatcher.clone());
        let on_done = out.clone();
        self.forward_failure(&out);
        self.done(move |value| match guarded(|| next(value)) {
            Ok(promise) => {
                promise.pipe(&on_done);
            }
            Err(error) => {
                on_done.try_reject(error);
            }
        });
        out
    }

    /// Maps the resolved value.
    pub fn map_single<U, F>(&self, mapper: F) -> Promise<U, P>
    where
        U: Value,
        F: FnOnce(&T) -> U + Send + 'static,
    {
        let out = Promise::with_dispatcher(self.shared.dispatcher.clone());
        let on_done = out.clone();
        self.forward_failure(&out);
        self.done(move |value| match guarded(|| mapper(value)) {
            Ok(mapped) => {
                on_done.try_resolve(mapped);
            }
            Err(error) => {
                on_done.try_reject(error);
            }
        });
        out
    }

    /// Keeps the resolved value if `filter` accepts it, otherwise rejects
    /// with [`TaskError::AbsentValue`].
    pub fn filter_single<F>(&self, filter: F) -> Promise<T, P>
    where
        F: FnOnce(&T) -> bool + Send + 'static,
    {
        let out = Promise::with_dispatcher(self.shared.dispatcher.clone());
        let on_done = out.clone();
        self.forward_failure(&out);
        self.done(move |value| match guarded(|| filter(value)) {
            Ok(true) => {
                on_done.try_resolve(value.clone());
            }
            Ok(false) => {
                on_done.try_reject(TaskError::AbsentValue);
            }
            Err(error) => {
                on_done.try_reject(error);
            }
        });
        out
    }

    /// Views the single result as a one-element collection.
    pub fn as_collection(&self) -> CollectionPromise<T, P> {
        CollectionPromise::from_promise(self.map_single(|value| vec![value.clone()]))
    }

    /// Resolves with this promise's value, or with `fallback`'s if this one
    /// is rejected.
    pub fn or(&self, fallback: &Promise<T, P>) -> Promise<T, P> {
        combinators::or(self, fallback)
    }

    /// Resolves with both values once both promises resolve.
    pub fn and(&self, other: &Promise<T, P>) -> Promise<Vec<T>, P> {
        combinators::all_of([self.clone(), other.clone()])
    }

    /// Rejections and cancellations of `self` settle `out` the same way.
    pub(crate) fn forward_failure<U: Value>(&self, out: &Promise<U, P>) {
        let on_fail = out.clone();
        let on_cancel = out.clone();
        self.fail(move |error| {
            on_fail.try_reject(error.clone());
        })
        .on_cancel(move || {
            on_cancel.try_cancel(false);
        });
    }
}

impl<T: Value, P: Value> Promise<Vec<T>, P> {
    /// Entry point of the collection pipeline.
    pub fn stream(&self) -> CollectionPromise<T, P> {
        CollectionPromise::from_promise(self.clone())
    }
}

/// Runs user code, turning a panic into a rejection reason.
pub(crate) fn guarded<R>(f: impl FnOnce() -> R) -> Result<R, TaskError> {
    catch_unwind(AssertUnwindSafe(f)).map_err(TaskError::from_panic)
}

impl<T: Value, P: Value> Future for Promise<T, P> {
    type Output = Result<T, TaskError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut inner = self.shared.inner.lock();
        if inner.state == PromiseState::Pending {
            if !inner.wakers.iter().any(|w| w.will_wake(cx.waker())) {
                inner.wakers.push(cx.waker().clone());
            }
            return Poll::Pending;
        }
        Poll::Ready(inner.outcome())
    }
}

impl<T, P> fmt::Debug for Promise<T, P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.shared.inner.lock().state;
        f.debug_struct("Promise")
            .field("task", &self.shared.task)
            .field("state", &state)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn callbacks_fire_in_registration_order() {
        let promise: Promise<i32> = Promise::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..4 {
            let order = Arc::clone(&order);
            promise.done(move |v| order.lock().push((i, *v)));
        }
        promise.resolve(7).unwrap();
        assert_eq!(*order.lock(), vec![(0, 7), (1, 7), (2, 7), (3, 7)]);
    }

    #[test]
    fn callback_registered_from_a_callback_fires() {
        let promise: Promise<i32> = Promise::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let inner_promise = promise.clone();
        let inner_hits = Arc::clone(&hits);
        promise.done(move |_| {
            let hits = Arc::clone(&inner_hits);
            inner_promise.done(move |_| {
                hits.fetch_add(1, Ordering::SeqCst);
            });
        });
        promise.resolve(1).unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn progress_is_rejected_once_settled() {
        let promise: Promise<i32, u8> = Promise::new();
        promise.reject(TaskError::msg("boom")).unwrap();
        assert_eq!(
            promise.notify_progress(3),
            Err(PoolError::IllegalPromiseTransition {
                state: PromiseState::Rejected
            })
        );
    }

    #[test]
    fn timeout_on_pending_promise() {
        let promise: Promise<i32> = Promise::new();
        assert_eq!(
            promise.get_result_timeout(Duration::from_millis(10)),
            Err(TaskError::Timeout)
        );
    }

    #[test]
    fn guarded_reports_panics() {
        let result: Result<(), TaskError> = guarded(|| panic!("bad mapper"));
        assert_eq!(result, Err(TaskError::Panic("bad mapper".into())));
    }
}
