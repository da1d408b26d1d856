use super::{
    dispatch::Dispatcher,
    errors::{PoolError, TaskError},
    model::{QueueId, WorkerId},
    pool::PoolManager,
    promise::{CancelLink, Promise, Value},
};
use parking_lot::Mutex;
use std::{
    any::{Any, TypeId},
    collections::hash_map::DefaultHasher,
    fmt,
    future::Future,
    hash::{Hash, Hasher},
    panic::{catch_unwind, AssertUnwindSafe},
    sync::Arc,
    time::Duration,
};
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(pub(crate) u64);

impl TaskId {
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Scheduling priority. Higher values run first; [`Priority::REAL_TIME`]
/// may bypass the queue entirely.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Priority(i32);

impl Priority {
    pub const LOWEST: Priority = Priority(1);
    pub const LOW: Priority = Priority(2);
    pub const NORMAL: Priority = Priority(3);
    pub const HIGH: Priority = Priority(4);
    pub const REAL_TIME: Priority = Priority(i32::MAX);

    pub const fn new(value: i32) -> Self {
        Priority(value)
    }

    pub const fn value(self) -> i32 {
        self.0
    }

    pub fn is_real_time(self) -> bool {
        self == Priority::REAL_TIME
    }
}

impl Default for Priority {
    fn default() -> Self {
        Priority::NORMAL
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskState {
    Uninitialized,
    NotQueued,
    Queued,
    Running,
    Cancelling,
    Cancelled,
    Finished,
}

trait KeyValue: fmt::Debug + Send + Sync {
    fn as_any(&self) -> &dyn Any;
    fn same_as(&self, other: &dyn KeyValue) -> bool;
}

impl<K> KeyValue for K
where
    K: fmt::Debug + Eq + Send + Sync + 'static,
{
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn same_as(&self, other: &dyn KeyValue) -> bool {
        other.as_any().downcast_ref::<K>() == Some(self)
    }
}

/// Identity used to find an in-flight task equal to a newly submitted one.
/// Two tasks are equal when their keys are equal and they produce the same
/// result and progress types.
#[derive(Debug, Clone)]
pub struct MergeKey {
    types: TypeId,
    hash: u64,
    key: Arc<dyn KeyValue>,
}

impl MergeKey {
    fn of<T: 'static, P: 'static, K>(key: K) -> Self
    where
        K: Hash + Eq + fmt::Debug + Send + Sync + 'static,
    {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        Self {
            types: TypeId::of::<(T, P)>(),
            hash: hasher.finish(),
            key: Arc::new(key),
        }
    }
}

impl PartialEq for MergeKey {
    fn eq(&self, other: &Self) -> bool {
        self.types == other.types && self.hash == other.hash && self.key.same_as(&*other.key)
    }
}

impl Eq for MergeKey {}

impl Hash for MergeKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.types.hash(state);
        self.hash.hash(state);
    }
}

/// How a task execution ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Completion {
    Resolved,
    Rejected,
    Cancelled,
}

type Work<T, P> = Arc<dyn Fn(&TaskContext<P>) -> Result<T, TaskError> + Send + Sync>;
type ProgressSink<P> = Arc<dyn Fn(P) -> Result<(), PoolError> + Send + Sync>;

/// Handed to the work function while it runs.
pub struct TaskContext<P = ()> {
    id: TaskId,
    cancelled: CancellationToken,
    interrupt: CancellationToken,
    progress: ProgressSink<P>,
    runtime: Handle,
}

impl<P> TaskContext<P> {
    pub fn id(&self) -> TaskId {
        self.id
    }

    /// True once the task was cancelled or its thread interrupted. Long
    /// running work is expected to poll this and return early.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.is_cancelled() || self.interrupt.is_cancelled()
    }

    pub fn is_interrupted(&self) -> bool {
        self.interrupt.is_cancelled()
    }

    /// `Err(TaskError::Interrupted)` once the task should stop, for use
    /// with `?`.
    pub fn checkpoint(&self) -> Result<(), TaskError> {
        if self.is_cancelled() {
            return Err(TaskError::Interrupted);
        }
        Ok(())
    }

    pub fn notify_progress(&self, progress: P) -> Result<(), PoolError> {
        (self.progress)(progress)
    }

    /// Sleeps unless the task gets cancelled or interrupted first.
    pub fn sleep(&self, duration: Duration) -> Result<(), TaskError> {
        // the timer has to be created inside the runtime
        self.block_on(async move { tokio::time::sleep(duration).await })
    }

    /// Drives `future` to completion on the pool's timer runtime, giving up
    /// with [`TaskError::Interrupted`] on cancellation.
    ///
    /// The future is only polled inside the runtime, so tokio resources it
    /// needs must be created lazily, e.g. in an `async` block.
    pub fn block_on<F: Future>(&self, future: F) -> Result<F::Output, TaskError> {
        let cancelled = self.cancelled.clone();
        let interrupt = self.interrupt.clone();
        self.runtime.block_on(async move {
            tokio::select! {
                biased;
                _ = interrupt.cancelled() => Err(TaskError::Interrupted),
                _ = cancelled.cancelled() => Err(TaskError::Interrupted),
                output = future => Ok(output),
            }
        })
    }
}

/// What a worker needs to run a task.
pub(crate) struct ExecEnv<'a> {
    pub manager: &'a PoolManager,
    pub interrupt: CancellationToken,
    pub worker: Option<WorkerId>,
}

struct Slot<T, P> {
    state: TaskState,
    id: Option<TaskId>,
    promise: Option<Promise<T, P>>,
    cancelled: CancellationToken,
    queue_timer: Option<CancellationToken>,
    queue_timeout: Option<Duration>,
    execution_timeout: Option<Duration>,
    queue: Option<QueueId>,
    worker: Option<WorkerId>,
}

impl<T, P> Slot<T, P> {
    fn detach(&mut self) {
        if let Some(timer) = self.queue_timer.take() {
            timer.cancel();
        }
        self.queue = None;
        self.worker = None;
    }
}

struct TaskCore<T, P> {
    work: Work<T, P>,
    priority: Priority,
    queue_timeout: Option<Duration>,
    execution_timeout: Option<Duration>,
    merge_key: Option<MergeKey>,
    slot: Mutex<Slot<T, P>>,
}

/// A unit of work producing `T` and reporting progress values of type `P`.
///
/// A task is submitted once per lifecycle; after it finishes it can be
/// [`reset`](Task::reset) and submitted again.
pub struct Task<T, P = ()> {
    core: Arc<TaskCore<T, P>>,
}

impl<T, P> Clone for Task<T, P> {
    fn clone(&self) -> Self {
        Self {
            core: Arc::clone(&self.core),
        }
    }
}

pub struct TaskBuilder<T, P = ()> {
    work: Work<T, P>,
    priority: Priority,
    queue_timeout: Option<Duration>,
    execution_timeout: Option<Duration>,
    merge_key: Option<MergeKey>,
}

impl<T: Value, P: Value> TaskBuilder<T, P> {
    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Time the task may wait in a queue before the policy is told.
    pub fn queue_timeout(mut self, timeout: Duration) -> Self {
        self.queue_timeout = Some(timeout);
        self
    }

    /// Time the task may run before the policy is told.
    pub fn execution_timeout(mut self, timeout: Duration) -> Self {
        self.execution_timeout = Some(timeout);
        self
    }

    /// Makes the task mergeable with in-flight tasks built with an equal key.
    pub fn merge_key<K>(mut self, key: K) -> Self
    where
        K: Hash + Eq + fmt::Debug + Send + Sync + 'static,
    {
        self.merge_key = Some(MergeKey::of::<T, P, K>(key));
        self
    }

    pub fn build(self) -> Task<T, P> {
        Task {
            core: Arc::new(TaskCore {
                work: self.work,
                priority: self.priority,
                queue_timeout: self.queue_timeout,
                execution_timeout: self.execution_timeout,
                merge_key: self.merge_key,
                slot: Mutex::new(Slot {
                    state: TaskState::Uninitialized,
                    id: None,
                    promise: None,
                    cancelled: CancellationToken::new(),
                    queue_timer: None,
                    queue_timeout: None,
                    execution_timeout: None,
                    queue: None,
                    worker: None,
                }),
            }),
        }
    }
}

impl<T: Value, P: Value> Task<T, P> {
    pub fn new<F>(work: F) -> Self
    where
        F: Fn(&TaskContext<P>) -> Result<T, TaskError> + Send + Sync + 'static,
    {
        Self::builder(work).build()
    }

    pub fn builder<F>(work: F) -> TaskBuilder<T, P>
    where
        F: Fn(&TaskContext<P>) -> Result<T, TaskError> + Send + Sync + 'static,
    {
        TaskBuilder {
            work: Arc::new(work),
            priority: Priority::default(),
            queue_timeout: None,
            execution_timeout: None,
            merge_key: None,
        }
    }

    pub fn id(&self) -> Option<TaskId> {
        self.core.slot.lock().id
    }

    pub fn state(&self) -> TaskState {
        self.core.slot.lock().state
    }

    pub fn priority(&self) -> Priority {
        self.core.priority
    }

    /// Promise of the current lifecycle, once submitted.
    pub fn promise(&self) -> Option<Promise<T, P>> {
        self.core.slot.lock().promise.clone()
    }

    /// Makes a finished task submittable again.
    pub fn reset(&self) -> Result<(), PoolError> {
        let mut slot = self.core.slot.lock();
        if slot.state != TaskState::Finished {
            return Err(PoolError::IllegalReuse {
                task: slot.id,
                state: slot.state,
            });
        }
        slot.detach();
        slot.state = TaskState::Uninitialized;
        slot.id = None;
        slot.promise = None;
        slot.cancelled = CancellationToken::new();
        tracing::trace!(state = ?TaskState::Uninitialized, "task reset");
        Ok(())
    }

    /// Assigns the id and the promise of a new lifecycle.
    pub(crate) fn initialize(
        &self,
        id: TaskId,
        dispatcher: Dispatcher,
        link: Arc<dyn CancelLink>,
        defaults: (Option<Duration>, Option<Duration>),
    ) -> Result<(TaskRef, Promise<T, P>), PoolError> {
        let promise = {
            let mut slot = self.core.slot.lock();
            if slot.state != TaskState::Uninitialized {
                return Err(PoolError::IllegalReuse {
                    task: slot.id,
                    state: slot.state,
                });
            }
            let promise = Promise::for_task(dispatcher, id, link);
            slot.state = TaskState::NotQueued;
            slot.id = Some(id);
            slot.promise = Some(promise.clone());
            slot.cancelled = CancellationToken::new();
            slot.queue_timeout = self.core.queue_timeout.or(defaults.0);
            slot.execution_timeout = self.core.execution_timeout.or(defaults.1);
            promise
        };
        tracing::trace!(task = %id, state = ?TaskState::NotQueued, "task initialized");

        let job: Arc<dyn Job> = Arc::clone(&self.core) as Arc<dyn Job>;
        Ok((TaskRef { id, job }, promise))
    }
}

impl<P: Value> Task<(), P> {
    /// A task run for its side effects only.
    pub fn void<F>(work: F) -> Self
    where
        F: Fn(&TaskContext<P>) -> Result<(), TaskError> + Send + Sync + 'static,
    {
        Self::new(work)
    }
}

impl<T, P> fmt::Debug for Task<T, P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let slot = self.core.slot.lock();
        f.debug_struct("Task")
            .field("id", &slot.id)
            .field("state", &slot.state)
            .field("priority", &self.core.priority)
            .finish()
    }
}

/// Type-erased task as seen by queues, workers and the pool.
pub(crate) trait Job: Send + Sync {
    fn priority(&self) -> Priority;
    fn state(&self) -> TaskState;
    fn merge_key(&self) -> Option<MergeKey>;
    fn queue_timeout(&self) -> Option<Duration>;
    fn queue(&self) -> Option<QueueId>;
    fn worker(&self) -> Option<WorkerId>;

    /// NotQueued -> Queued. `queue` is `None` for merged tasks.
    fn mark_queued(
        &self,
        queue: Option<QueueId>,
        timer: Option<CancellationToken>,
    ) -> Result<(), PoolError>;

    fn execute(&self, env: &ExecEnv<'_>) -> Completion;

    /// Flags the task as cancelling and wakes cancel-aware waits in its body.
    fn soft_cancel(&self) -> TaskState;

    /// Final transition for a task that will never run.
    fn finish_cancelled(&self);

    fn cancel_promise(&self, may_interrupt: bool);

    fn can_merge_into(&self, target: &dyn Job) -> bool;

    /// Pipes `target`'s promise into this task's promise.
    fn merge_into(self: Arc<Self>, target: &TaskRef);

    fn as_any(&self) -> &dyn Any;
}

impl<T: Value, P: Value> TaskCore<T, P> {
    fn progress_sink(promise: &Promise<T, P>) -> ProgressSink<P> {
        let promise = promise.clone();
        Arc::new(move |progress: P| promise.notify_progress(progress))
    }
}

impl<T: Value, P: Value> Job for TaskCore<T, P> {
    fn priority(&self) -> Priority {
        self.priority
    }

    fn state(&self) -> TaskState {
        self.slot.lock().state
    }

    fn merge_key(&self) -> Option<MergeKey> {
        self.merge_key.clone()
    }

    fn queue_timeout(&self) -> Option<Duration> {
        self.slot.lock().queue_timeout
    }

    fn queue(&self) -> Option<QueueId> {
        self.slot.lock().queue
    }

    fn worker(&self) -> Option<WorkerId> {
        self.slot.lock().worker
    }

    fn mark_queued(
        &self,
        queue: Option<QueueId>,
        timer: Option<CancellationToken>,
    ) -> Result<(), PoolError> {
        let mut slot = self.slot.lock();
        if slot.state != TaskState::NotQueued {
            if let Some(timer) = timer {
                timer.cancel();
            }
            return Err(PoolError::IllegalReuse {
                task: slot.id,
                state: slot.state,
            });
        }
        slot.state = TaskState::Queued;
        slot.queue = queue;
        slot.queue_timer = timer;
        tracing::trace!(task = ?slot.id, ?queue, state = ?TaskState::Queued, "task queued");
        Ok(())
    }

    fn execute(&self, env: &ExecEnv<'_>) -> Completion {
        let (id, promise, cancelled, execution_timeout) = {
            let mut slot = self.slot.lock();
            let (Some(id), Some(promise)) = (slot.id, slot.promise.clone()) else {
                return Completion::Cancelled;
            };
            match slot.state {
                TaskState::Queued | TaskState::NotQueued => {}
                TaskState::Cancelling => {
                    slot.state = TaskState::Cancelled;
                    slot.detach();
                    tracing::trace!(task = %id, "task cancelled before it started");
                    return Completion::Cancelled;
                }
                state => {
                    tracing::debug!(task = %id, ?state, "task is not runnable");
                    return Completion::Cancelled;
                }
            }
            slot.state = TaskState::Running;
            if let Some(timer) = slot.queue_timer.take() {
                timer.cancel();
            }
            slot.worker = env.worker;
            (id, promise, slot.cancelled.clone(), slot.execution_timeout)
        };
        tracing::trace!(task = %id, worker = ?env.worker, state = ?TaskState::Running, "task running");

        let _execution_timer = execution_timeout
            .map(|timeout| env.manager.arm_execution_timeout(id, timeout).drop_guard());

        let context = TaskContext {
            id,
            cancelled,
            interrupt: env.interrupt.clone(),
            progress: Self::progress_sink(&promise),
            runtime: env.manager.runtime(),
        };
        let result = catch_unwind(AssertUnwindSafe(|| (self.work)(&context)))
            .unwrap_or_else(|payload| Err(TaskError::from_panic(payload)));
        drop(_execution_timer);

        let cancelling = {
            let mut slot = self.slot.lock();
            let cancelling = slot.state == TaskState::Cancelling
                || matches!(result, Err(TaskError::Interrupted));
            slot.state = if cancelling {
                TaskState::Cancelled
            } else {
                TaskState::Finished
            };
            slot.detach();
            cancelling
        };

        if cancelling {
            tracing::trace!(task = %id, state = ?TaskState::Cancelled, "task aborted");
            promise.try_cancel(false);
            return Completion::Cancelled;
        }
        match result {
            Ok(value) => {
                tracing::trace!(task = %id, state = ?TaskState::Finished, "task finished");
                promise.try_resolve(value);
                Completion::Resolved
            }
            Err(error) => {
                tracing::trace!(task = %id, %error, state = ?TaskState::Finished, "task failed");
                promise.try_reject(error);
                Completion::Rejected
            }
        }
    }

    fn soft_cancel(&self) -> TaskState {
        let mut slot = self.slot.lock();
        let prior = slot.state;
        if matches!(
            prior,
            TaskState::NotQueued | TaskState::Queued | TaskState::Running
        ) {
            slot.state = TaskState::Cancelling;
            slot.cancelled.cancel();
            tracing::trace!(task = ?slot.id, state = ?TaskState::Cancelling, "task cancelling");
        }
        prior
    }

    fn finish_cancelled(&self) {
        let mut slot = self.slot.lock();
        if matches!(slot.state, TaskState::Finished | TaskState::Uninitialized) {
            return;
        }
        slot.state = TaskState::Cancelled;
        slot.cancelled.cancel();
        slot.detach();
        tracing::trace!(task = ?slot.id, state = ?TaskState::Cancelled, "task cancelled");
    }

    fn cancel_promise(&self, may_interrupt: bool) {
        let promise = self.slot.lock().promise.clone();
        if let Some(promise) = promise {
            promise.try_cancel(may_interrupt);
        }
    }

    fn can_merge_into(&self, target: &dyn Job) -> bool {
        target.as_any().is::<TaskCore<T, P>>()
    }

    fn merge_into(self: Arc<Self>, target: &TaskRef) {
        let Some(target) = target.job.as_any().downcast_ref::<TaskCore<T, P>>() else {
            return;
        };
        let (Some(source), Some(own)) = (
            target.slot.lock().promise.clone(),
            self.slot.lock().promise.clone(),
        ) else {
            return;
        };

        let finished = Arc::clone(&self);
        let cancelled = Arc::clone(&self);
        own.always(move || {
            let mut slot = finished.slot.lock();
            slot.state = TaskState::Finished;
            slot.detach();
        })
        .on_cancel(move || cancelled.finish_cancelled());
        source.pipe(&own);
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Handle to a submitted task, independent of its result type. This is
/// what pool policies see.
#[derive(Clone)]
pub struct TaskRef {
    id: TaskId,
    job: Arc<dyn Job>,
}

impl TaskRef {
    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn priority(&self) -> Priority {
        self.job.priority()
    }

    pub fn state(&self) -> TaskState {
        self.job.state()
    }

    pub fn merge_key(&self) -> Option<MergeKey> {
        self.job.merge_key()
    }

    /// Queue the task was placed in; cleared once it ends.
    pub fn queue(&self) -> Option<QueueId> {
        self.job.queue()
    }

    /// Worker running the task; `None` on a real-time thread.
    pub fn worker(&self) -> Option<WorkerId> {
        self.job.worker()
    }

    pub(crate) fn job(&self) -> &Arc<dyn Job> {
        &self.job
    }
}

impl PartialEq for TaskRef {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for TaskRef {}

impl fmt::Debug for TaskRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskRef")
            .field("id", &self.id)
            .field("priority", &self.priority())
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priorities_order_numerically() {
        assert!(Priority::REAL_TIME > Priority::HIGH);
        assert!(Priority::HIGH > Priority::NORMAL);
        assert!(Priority::LOW > Priority::LOWEST);
        assert_eq!(Priority::default(), Priority::NORMAL);
        assert!(Priority::REAL_TIME.is_real_time());
    }

    #[test]
    fn merge_keys_depend_on_result_type() {
        assert_eq!(MergeKey::of::<i32, (), _>("a"), MergeKey::of::<i32, (), _>("a"));
        assert_ne!(MergeKey::of::<i32, (), _>("a"), MergeKey::of::<u32, (), _>("a"));
        assert_ne!(MergeKey::of::<i32, (), _>("a"), MergeKey::of::<i32, (), _>("b"));
    }

    /// Hashes every value the same.
    #[derive(Debug, PartialEq, Eq)]
    struct Colliding(u32);

    impl Hash for Colliding {
        fn hash<H: Hasher>(&self, state: &mut H) {
            0u8.hash(state);
        }
    }

    #[test]
    fn merge_keys_compare_full_key_on_hash_collision() {
        let a = MergeKey::of::<i32, (), _>(Colliding(1));
        let b = MergeKey::of::<i32, (), _>(Colliding(2));
        assert_eq!(a.hash, b.hash);
        assert_ne!(a, b);
        assert_eq!(a, MergeKey::of::<i32, (), _>(Colliding(1)));
        // same hash and value type but a different key type
        assert_ne!(
            MergeKey::of::<i32, (), _>(1u32),
            MergeKey::of::<i32, (), _>(1u64)
        );
    }

    #[test]
    fn reset_requires_finished_state() {
        let task: Task<i32> = Task::new(|_| Ok(1));
        assert_eq!(
            task.reset(),
            Err(PoolError::IllegalReuse {
                task: None,
                state: TaskState::Uninitialized
            })
        );
    }
}
