//! Lazy filter/map/for_each over a promised collection.
//!
//! Consecutive single-threaded stages fuse into one per-item chain that runs
//! once, when a terminal operation (`done`, `always`, `get_result*`,
//! `single_or_first`, `force`, awaiting) first touches the last stage.
//! Stages that are never observed never run. Parallel stages split the
//! source round-robin across pool tasks and concatenate the partition
//! outputs in partition order.

use super::{
    combinators,
    dispatch::Affinity,
    errors::{PoolError, TaskError},
    pool::PoolManager,
    promise::{guarded, Promise, PromiseState, Value},
    task::Task,
};
use std::{
    fmt,
    future::IntoFuture,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

type Step<T, U> = Arc<dyn Fn(T) -> Option<U> + Send + Sync>;

/// Items of the chain starter with every fused step applied on the fly.
trait Batch<T>: Send {
    /// Round-robin split into at most `parts` batches sharing the same steps.
    fn split(self: Box<Self>, parts: usize) -> Vec<Box<dyn Batch<T>>>;

    fn drain(self: Box<Self>, emit: &mut dyn FnMut(T));
}

struct Items<T>(Vec<T>);

impl<T: Value> Batch<T> for Items<T> {
    fn split(self: Box<Self>, parts: usize) -> Vec<Box<dyn Batch<T>>> {
        let parts = parts.max(1);
        let mut groups: Vec<Vec<T>> = (0..parts).map(|_| Vec::new()).collect();
        for (index, item) in self.0.into_iter().enumerate() {
            groups[index % parts].push(item);
        }
        groups
            .into_iter()
            .map(|group| Box::new(Items(group)) as Box<dyn Batch<T>>)
            .collect()
    }

    fn drain(self: Box<Self>, emit: &mut dyn FnMut(T)) {
        for item in self.0 {
            emit(item);
        }
    }
}

struct Then<T, U> {
    inner: Box<dyn Batch<T>>,
    step: Step<T, U>,
}

impl<T: Value, U: Value> Batch<U> for Then<T, U> {
    fn split(self: Box<Self>, parts: usize) -> Vec<Box<dyn Batch<U>>> {
        let step = self.step;
        self.inner
            .split(parts)
            .into_iter()
            .map(|inner| {
                Box::new(Then {
                    inner,
                    step: Arc::clone(&step),
                }) as Box<dyn Batch<U>>
            })
            .collect()
    }

    fn drain(self: Box<Self>, emit: &mut dyn FnMut(U)) {
        let step = self.step;
        self.inner.drain(&mut |item| {
            if let Some(out) = step(item) {
                emit(out);
            }
        });
    }
}

type Consumer<T> = Box<dyn FnOnce(Box<dyn Batch<T>>) + Send>;

/// Hands the consumer the chain's batch once the chain starter resolves.
type Subscribe<T> = Arc<dyn Fn(Consumer<T>) + Send + Sync>;

fn extend<T: Value, U: Value>(subscribe: Subscribe<T>, step: Step<T, U>) -> Subscribe<U> {
    Arc::new(move |consumer: Consumer<U>| {
        let step = Arc::clone(&step);
        subscribe(Box::new(move |inner: Box<dyn Batch<T>>| {
            consumer(Box::new(Then { inner, step }));
        }));
    })
}

#[derive(Clone)]
enum Mode {
    Inline,
    Parallel {
        pool: Arc<PoolManager>,
        partitions: usize,
    },
}

struct Lazy<T> {
    subscribe: Subscribe<T>,
    mode: Mode,
    attached: AtomicBool,
}

/// A promised collection with lazily evaluated pipeline stages.
pub struct CollectionPromise<T, P = ()> {
    promise: Promise<Vec<T>, P>,
    lazy: Option<Arc<Lazy<T>>>,
}

impl<T, P> Clone for CollectionPromise<T, P> {
    fn clone(&self) -> Self {
        Self {
            promise: self.promise.clone(),
            lazy: self.lazy.clone(),
        }
    }
}

impl<T: Value, P: Value> CollectionPromise<T, P> {
    pub(crate) fn from_promise(promise: Promise<Vec<T>, P>) -> Self {
        Self {
            promise,
            lazy: None,
        }
    }

    /// Keeps the items accepted by `filter`.
    pub fn filter<F>(&self, filter: F) -> CollectionPromise<T, P>
    where
        F: Fn(&T) -> bool + Send + Sync + 'static,
    {
        self.stage(Arc::new(move |item: T| filter(&item).then_some(item)), false)
    }

    pub fn filter_parallel<F>(&self, filter: F) -> CollectionPromise<T, P>
    where
        F: Fn(&T) -> bool + Send + Sync + 'static,
    {
        self.stage(Arc::new(move |item: T| filter(&item).then_some(item)), true)
    }

    pub fn map<U, F>(&self, mapper: F) -> CollectionPromise<U, P>
    where
        U: Value,
        F: Fn(T) -> U + Send + Sync + 'static,
    {
        self.stage(Arc::new(move |item: T| Some(mapper(item))), false)
    }

    pub fn map_parallel<U, F>(&self, mapper: F) -> CollectionPromise<U, P>
    where
        U: Value,
        F: Fn(T) -> U + Send + Sync + 'static,
    {
        self.stage(Arc::new(move |item: T| Some(mapper(item))), true)
    }

    /// Runs `func` on every item and passes the items on unchanged.
    pub fn for_each<F>(&self, func: F) -> CollectionPromise<T, P>
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        self.stage(
            Arc::new(move |item: T| {
                func(&item);
                Some(item)
            }),
            false,
        )
    }

    pub fn for_each_parallel<F>(&self, func: F) -> CollectionPromise<T, P>
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        self.stage(
            Arc::new(move |item: T| {
                func(&item);
                Some(item)
            }),
            true,
        )
    }

    fn stage<U: Value>(&self, step: Step<T, U>, parallel: bool) -> CollectionPromise<U, P> {
        let subscribe = match &self.lazy {
            Some(lazy) if matches!(lazy.mode, Mode::Inline) && !lazy.is_attached() => {
                extend(Arc::clone(&lazy.subscribe), step)
            }
            _ => extend(self.source(), step),
        };
        let mode = match self.promise.dispatcher().pool() {
            Some(pool) if parallel && pool.config().parallelism > 1 => Mode::Parallel {
                partitions: pool.config().parallelism,
                pool,
            },
            _ => Mode::Inline,
        };

        let promise = Promise::with_dispatcher(self.promise.dispatcher().clone());
        self.promise.forward_failure(&promise);
        CollectionPromise {
            promise,
            lazy: Some(Arc::new(Lazy {
                subscribe,
                mode,
                attached: AtomicBool::new(false),
            })),
        }
    }

    /// Starts a fresh chain from this stage's own output.
    fn source(&self) -> Subscribe<T> {
        let this = self.clone();
        Arc::new(move |consumer: Consumer<T>| {
            this.attach();
            this.promise.done(move |items| consumer(Box::new(Items(items.clone()))));
        })
    }

    fn attach(&self) {
        let Some(lazy) = &self.lazy else {
            return;
        };
        if lazy.attached.swap(true, Ordering::AcqRel) {
            return;
        }

        let out = self.promise.clone();
        match lazy.mode.clone() {
            Mode::Inline => (lazy.subscribe)(Box::new(move |batch: Box<dyn Batch<T>>| {
                let collected = guarded(|| {
                    let mut items = Vec::new();
                    batch.drain(&mut |item| items.push(item));
                    items
                });
                match collected {
                    Ok(items) => {
                        out.try_resolve(items);
                    }
                    Err(error) => {
                        out.try_reject(error);
                    }
                }
            })),
            Mode::Parallel { pool, partitions } => (lazy.subscribe)(Box::new(move |batch: Box<dyn Batch<T>>| {
                if let Err(error) = run_partitions(&pool, batch, partitions, &out) {
                    out.try_reject(TaskError::failure(error));
                }
            })),
        }
    }

    /// Evaluates the pending stages now instead of on first observation.
    pub fn force(&self) -> &Self {
        self.attach();
        self
    }

    /// The underlying promise, with evaluation triggered.
    pub fn promise(&self) -> Promise<Vec<T>, P> {
        self.attach();
        self.promise.clone()
    }

    pub fn state(&self) -> PromiseState {
        self.promise.state()
    }

    pub fn cancel(&self, may_interrupt: bool) -> Result<(), PoolError> {
        self.promise.cancel(may_interrupt)
    }

    pub fn done<F>(&self, callback: F) -> &Self
    where
        F: FnOnce(&Vec<T>) + Send + 'static,
    {
        self.done_with(Affinity::Background, callback)
    }

    pub fn done_with<F>(&self, affinity: Affinity, callback: F) -> &Self
    where
        F: FnOnce(&Vec<T>) + Send + 'static,
    {
        self.attach();
        self.promise.done_with(affinity, callback);
        self
    }

    pub fn fail<F>(&self, callback: F) -> &Self
    where
        F: FnOnce(&TaskError) + Send + 'static,
    {
        self.promise.fail(callback);
        self
    }

    pub fn on_cancel<F>(&self, callback: F) -> &Self
    where
        F: FnOnce() + Send + 'static,
    {
        self.promise.on_cancel(callback);
        self
    }

    pub fn always<F>(&self, callback: F) -> &Self
    where
        F: FnOnce() + Send + 'static,
    {
        self.attach();
        self.promise.always(callback);
        self
    }

    pub fn get_result(&self) -> Result<Vec<T>, TaskError> {
        self.attach();
        self.promise.get_result()
    }

    pub fn get_result_timeout(&self, timeout: Duration) -> Result<Vec<T>, TaskError> {
        self.attach();
        self.promise.get_result_timeout(timeout)
    }

    pub fn get_result_or_default(&self, default: Vec<T>) -> Vec<T> {
        self.attach();
        self.promise.get_result_or_default(default)
    }

    /// First item of the collection; an empty collection rejects with
    /// [`TaskError::AbsentValue`].
    pub fn single_or_first(&self) -> Promise<T, P> {
        self.attach();
        let out = Promise::with_dispatcher(self.promise.dispatcher().clone());
        let on_done = out.clone();
        self.promise.forward_failure(&out);
        self.promise.done(move |items| match items.first() {
            Some(first) => {
                on_done.try_resolve(first.clone());
            }
            None => {
                on_done.try_reject(TaskError::AbsentValue);
            }
        });
        out
    }
}

fn run_partitions<T: Value, P: Value>(
    pool: &Arc<PoolManager>,
    batch: Box<dyn Batch<T>>,
    partitions: usize,
    out: &Promise<Vec<T>, P>,
) -> Result<(), PoolError> {
    let parts = batch.split(partitions);
    tracing::debug!(partitions = parts.len(), "submitting parallel pipeline stage");

    let mut promises = Vec::with_capacity(parts.len());
    for part in parts {
        let slot = parking_lot::Mutex::new(Some(part));
        let task: Task<Vec<T>, P> = Task::new(move |_ctx| {
            let part = slot.lock().take().ok_or(TaskError::AbsentValue)?;
            let mut items = Vec::new();
            part.drain(&mut |item| items.push(item));
            Ok(items)
        });
        promises.push(pool.submit(&task)?);
    }

    let on_done = out.clone();
    let on_fail = out.clone();
    let on_cancel = out.clone();
    combinators::after_all(promises)
        .done(move |results| {
            let mut items = Vec::new();
            for index in 0..results.len() {
                match results.result(index) {
                    Ok(part) => items.extend(part),
                    Err(error) => {
                        on_done.try_reject(error);
                        return;
                    }
                }
            }
            on_done.try_resolve(items);
        })
        .fail(move |error| {
            on_fail.try_reject(error.clone());
        })
        .on_cancel(move || {
            on_cancel.try_cancel(false);
        });
    Ok(())
}

impl<T: Value, P: Value> IntoFuture for CollectionPromise<T, P> {
    type Output = Result<Vec<T>, TaskError>;
    type IntoFuture = Promise<Vec<T>, P>;

    fn into_future(self) -> Self::IntoFuture {
        self.promise()
    }
}

impl<T> Lazy<T> {
    fn is_attached(&self) -> bool {
        self.attached.load(Ordering::Acquire)
    }
}

impl<T, P> fmt::Debug for CollectionPromise<T, P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CollectionPromise")
            .field("promise", &self.promise)
            .field(
                "attached",
                &self.lazy.as_ref().map(|lazy| lazy.attached.load(Ordering::Acquire)),
            )
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_is_round_robin() {
        let batch: Box<dyn Batch<i32>> = Box::new(Items((0..7).collect()));
        let parts: Vec<Vec<i32>> = batch
            .split(3)
            .into_iter()
            .map(|part| {
                let mut items = Vec::new();
                part.drain(&mut |item| items.push(item));
                items
            })
            .collect();
        assert_eq!(parts, vec![vec![0, 3, 6], vec![1, 4], vec![2, 5]]);
    }

    #[test]
    fn fused_steps_apply_in_order() {
        let double: Step<i32, i32> = Arc::new(|x: i32| Some(x * 2));
        let quadruples: Step<i32, String> = Arc::new(|x: i32| (x % 4 == 0).then(|| x.to_string()));
        let batch: Box<dyn Batch<String>> = Box::new(Then {
            inner: Box::new(Then {
                inner: Box::new(Items(vec![1, 2, 3, 4])),
                step: double,
            }),
            step: quadruples,
        });
        let mut items = Vec::new();
        batch.drain(&mut |item| items.push(item));
        assert_eq!(items, vec!["4".to_string(), "8".to_string()]);
    }
}
