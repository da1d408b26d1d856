use super::{
    combinators::{self, MultipleResult},
    dispatch::{run_isolated, Dispatcher, Job as Deferred, UiThread},
    errors::{PoolError, TaskError},
    model::{PoolMetrics, PoolState, QueueId, QueueState, WorkerId, WorkerStatus},
    policy::{LinearWithRealTimePriority, PoolPolicy},
    promise::{CancelLink, Promise, Value},
    queue::TaskQueue,
    task::{Completion, MergeKey, Task, TaskId, TaskRef, TaskState},
    timer::Timer,
    worker::{self, Worker},
};
use parking_lot::Mutex;
use std::{
    collections::{BTreeMap, HashMap},
    fmt, mem,
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
        Arc, Weak,
    },
    time::Duration,
};
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;

/// Thread pool configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Upper bound on workers the default policy keeps per queue.
    pub max_workers: usize,
    /// Partitions used by parallel pipeline stages.
    pub parallelism: usize,
    /// Prefix for every thread the pool spawns.
    pub thread_name: String,
    pub default_queue_timeout: Option<Duration>,
    pub default_execution_timeout: Option<Duration>,
}

impl Default for Config {
    fn default() -> Self {
        let num_cpus = num_cpus::get();
        Self {
            max_workers: num_cpus,
            parallelism: num_cpus,
            thread_name: "promise-pool".into(),
            default_queue_timeout: None,
            default_execution_timeout: None,
        }
    }
}

impl Config {
    pub fn cpu_bound() -> Self {
        Self::default()
    }

    pub fn io_bound() -> Self {
        let num_cpus = num_cpus::get();
        Self {
            max_workers: num_cpus * 2, // I/O-bound tasks mostly wait
            ..Self::default()
        }
    }
}

pub type Pool = Arc<PoolManager>;

#[derive(Clone)]
enum Place {
    /// Handed to the policy, not placed yet.
    Submitted,
    Queued(QueueId),
    RealTime(CancellationToken),
    /// Taken out of its queue after a queue timeout.
    Detached,
}

#[derive(Clone)]
struct InFlight {
    task: TaskRef,
    place: Place,
}

#[derive(Default)]
struct Registry {
    queues: BTreeMap<QueueId, Arc<TaskQueue>>,
    workers: BTreeMap<QueueId, Vec<Worker>>,
    tasks: HashMap<TaskId, InFlight>,
    /// Placed tasks by merge key, oldest first.
    merge_index: HashMap<MergeKey, Vec<TaskRef>>,
    /// Workers told to stop, kept until their threads are joined.
    retired: Vec<Worker>,
    next_worker: u64,
}

impl Registry {
    fn place(&mut self, task: &TaskRef, place: Place) {
        match (&place, task.merge_key()) {
            (Place::Queued(_) | Place::RealTime(_), Some(key)) => {
                let indexed = self.merge_index.entry(key).or_default();
                if !indexed.contains(task) {
                    indexed.push(task.clone());
                }
            }
            (Place::Detached, Some(_)) => self.unindex(task.id()),
            _ => {}
        }
        if let Some(entry) = self.tasks.get_mut(&task.id()) {
            entry.place = place;
        }
    }

    fn unindex(&mut self, id: TaskId) {
        self.merge_index.retain(|_, indexed| {
            indexed.retain(|task| task.id() != id);
            !indexed.is_empty()
        });
    }

    fn forget(&mut self, id: TaskId) -> Option<InFlight> {
        let entry = self.tasks.remove(&id)?;
        if entry.task.merge_key().is_some() {
            self.unindex(id);
        }
        Some(entry)
    }

    /// Moves workers whose thread exited out of the live lists.
    fn reap(&mut self) {
        for workers in self.workers.values_mut() {
            let (dead, live): (Vec<_>, Vec<_>) = mem::take(workers)
                .into_iter()
                .partition(|worker| worker.status() == WorkerStatus::Terminated);
            *workers = live;
            self.retired.extend(dead);
        }
        self.retired
            .retain(|worker| worker.status() != WorkerStatus::Terminated);
    }

    fn snapshot(&self) -> PoolState {
        let queues = self
            .queues
            .iter()
            .map(|(id, queue)| {
                let workers = self
                    .workers
                    .get(id)
                    .map(|workers| workers.iter().map(Worker::state).collect())
                    .unwrap_or_default();
                let state = QueueState {
                    id: *id,
                    depth: queue.len(),
                    waiters: queue.waiters(),
                    workers,
                };
                (*id, state)
            })
            .collect();
        PoolState {
            queues,
            in_flight: self.merge_index.clone(),
            real_time_running: self
                .tasks
                .values()
                .filter(|entry| matches!(entry.place, Place::RealTime(_)))
                .count(),
        }
    }
}

/// Mechanism calls available to [`PoolPolicy`] hooks.
///
/// Work that may run user code (cancelling promises, wiring merged tasks)
/// is deferred until the pool lock is released.
pub struct PoolControl<'a> {
    manager: &'a PoolManager,
    registry: &'a mut Registry,
    deferred: Vec<Deferred>,
}

impl PoolControl<'_> {
    pub fn config(&self) -> &Config {
        &self.manager.config
    }

    /// Fresh snapshot, reflecting the calls made so far.
    pub fn state(&self) -> PoolState {
        self.registry.snapshot()
    }

    pub fn create_queue(&mut self, id: QueueId) -> Result<(), PoolError> {
        if self.registry.queues.contains_key(&id) {
            return Err(PoolError::DuplicateQueue(id));
        }
        self.registry.queues.insert(id, Arc::new(TaskQueue::new(id)));
        self.registry.workers.entry(id).or_default();
        tracing::debug!(queue = %id, "queue created");
        Ok(())
    }

    /// Destroys the queue: its queued tasks are cancelled and its workers
    /// stop once their current task is done.
    pub fn remove_queue(&mut self, id: QueueId) -> Result<(), PoolError> {
        let queue = self
            .registry
            .queues
            .remove(&id)
            .ok_or(PoolError::UnknownQueue(id))?;
        let drained = queue.destroy();
        let cancelled = drained.len();
        for task in drained {
            self.finish_cancelled(&task);
            let job = Arc::clone(task.job());
            self.defer(move || job.cancel_promise(false));
        }
        for worker in self.registry.workers.remove(&id).unwrap_or_default() {
            worker.die();
            self.registry.retired.push(worker);
        }
        tracing::debug!(queue = %id, cancelled, "queue removed");
        Ok(())
    }

    pub fn create_worker(&mut self, queue: QueueId) -> Result<WorkerId, PoolError> {
        let task_queue = self
            .registry
            .queues
            .get(&queue)
            .cloned()
            .ok_or(PoolError::UnknownQueue(queue))?;
        self.registry.next_worker += 1;
        let id = WorkerId(self.registry.next_worker);
        let worker = Worker::spawn(
            id,
            task_queue,
            self.manager.this.clone(),
            &self.manager.config.thread_name,
        )?;
        self.registry.workers.entry(queue).or_default().push(worker);
        tracing::debug!(worker = %id, queue = %queue, "worker created");
        Ok(id)
    }

    /// Stops a worker after its current task, or right away when
    /// `interrupt` is set.
    pub fn remove_worker(
        &mut self,
        queue: QueueId,
        worker: WorkerId,
        interrupt: bool,
    ) -> Result<(), PoolError> {
        let workers = self
            .registry
            .workers
            .get_mut(&queue)
            .ok_or(PoolError::UnknownQueue(queue))?;
        let index = workers
            .iter()
            .position(|w| w.id() == worker)
            .ok_or(PoolError::UnknownWorker(worker))?;
        let removed = workers.remove(index);
        if interrupt {
            removed.interrupt();
        } else {
            removed.die();
        }
        self.registry.retired.push(removed);
        tracing::debug!(worker = %worker, queue = %queue, interrupt, "worker removed");
        Ok(())
    }

    pub fn queue_task(&mut self, queue: QueueId, task: &TaskRef) -> Result<(), PoolError> {
        let task_queue = self
            .registry
            .queues
            .get(&queue)
            .cloned()
            .ok_or(PoolError::UnknownQueue(queue))?;
        if !self.registry.tasks.contains_key(&task.id()) {
            return Err(PoolError::TaskNotInFlight(task.id()));
        }

        let timer = task
            .job()
            .queue_timeout()
            .map(|timeout| self.manager.arm_queue_timeout(task.id(), timeout));
        task.job().mark_queued(Some(queue), timer)?;
        task_queue.insert(task.clone())?;
        self.registry.place(task, Place::Queued(queue));
        tracing::debug!(task = %task.id(), queue = %queue, priority = ?task.priority(), "task queued");
        Ok(())
    }

    /// Runs the task on a dedicated thread that exits afterwards.
    pub fn execute_immediately(&mut self, task: &TaskRef) -> Result<(), PoolError> {
        if !self.registry.tasks.contains_key(&task.id()) {
            return Err(PoolError::TaskNotInFlight(task.id()));
        }
        let token = worker::spawn_real_time(
            task.clone(),
            self.manager.this.clone(),
            &self.manager.config.thread_name,
        )?;
        self.registry.place(task, Place::RealTime(token));
        tracing::debug!(task = %task.id(), "task executing immediately");
        Ok(())
    }

    /// `to_merge` never runs; its promise mirrors `in_flight`'s.
    pub fn merge_task(&mut self, in_flight: &TaskRef, to_merge: &TaskRef) -> Result<(), PoolError> {
        if !to_merge.job().can_merge_into(in_flight.job().as_ref()) {
            return Err(PoolError::MergeMismatch(to_merge.id()));
        }
        to_merge.job().mark_queued(None, None)?;
        self.registry.forget(to_merge.id());
        self.manager.merged.fetch_add(1, Ordering::Relaxed);

        let job = Arc::clone(to_merge.job());
        let target = in_flight.clone();
        self.defer(move || job.merge_into(&target));
        tracing::debug!(task = %to_merge.id(), into = %in_flight.id(), "task merged");
        Ok(())
    }

    /// Cancels the task and its promise. A running task is only
    /// interrupted when `may_interrupt` is set.
    pub fn cancel_task(&mut self, task: &TaskRef, may_interrupt: bool) -> Result<(), PoolError> {
        self.cancel_in_flight(task.id(), may_interrupt);
        let job = Arc::clone(task.job());
        self.defer(move || job.cancel_promise(may_interrupt));
        Ok(())
    }

    fn cancel_in_flight(&mut self, id: TaskId, may_interrupt: bool) {
        let Some(InFlight { task, place }) = self.registry.tasks.get(&id).cloned() else {
            return;
        };
        task.job().soft_cancel();
        match place {
            Place::Queued(queue) => {
                let removed = self
                    .registry
                    .queues
                    .get(&queue)
                    .and_then(|q| q.remove(id))
                    .is_some();
                if removed {
                    self.finish_cancelled(&task);
                } else if may_interrupt {
                    self.interrupt_worker_running(queue, id);
                }
            }
            Place::RealTime(token) => {
                if may_interrupt {
                    tracing::warn!(task = %id, "interrupting real-time task");
                    token.cancel();
                }
            }
            Place::Submitted | Place::Detached => self.finish_cancelled(&task),
        }
    }

    fn interrupt_worker_running(&mut self, queue: QueueId, id: TaskId) {
        let Some(workers) = self.registry.workers.get_mut(&queue) else {
            return;
        };
        let Some(index) = workers.iter().position(|w| w.current() == Some(id)) else {
            return;
        };
        let worker = workers.remove(index);
        worker.interrupt();
        self.registry.retired.push(worker);
    }

    fn finish_cancelled(&mut self, task: &TaskRef) {
        task.job().finish_cancelled();
        self.registry.forget(task.id());
        self.manager.cancelled.fetch_add(1, Ordering::Relaxed);
    }

    fn defer(&mut self, job: impl FnOnce() + Send + 'static) {
        self.deferred.push(Box::new(job));
    }
}

/// Forwards a task promise's cancellation to the pool.
struct TaskLink {
    task: TaskId,
    pool: Weak<PoolManager>,
}

impl CancelLink for TaskLink {
    fn cancel(&self, may_interrupt: bool) {
        if let Some(pool) = self.pool.upgrade() {
            pool.forward_cancel(self.task, may_interrupt);
        }
    }
}

/// Owns queues and workers and executes the decisions of its
/// [`PoolPolicy`].
pub struct PoolManager {
    this: Weak<PoolManager>,
    config: Config,
    policy: Box<dyn PoolPolicy>,
    dispatcher: Dispatcher,
    timer: Timer,
    registry: Mutex<Registry>,
    next_task: AtomicU64,
    submitted: AtomicUsize,
    completed: AtomicUsize,
    failed: AtomicUsize,
    cancelled: AtomicUsize,
    merged: AtomicUsize,
    shut_down: AtomicBool,
}

impl PoolManager {
    /// Default config and the [`LinearWithRealTimePriority`] policy.
    pub fn new() -> Result<Pool, PoolError> {
        Self::with_config(Config::default())
    }

    pub fn with_config(config: Config) -> Result<Pool, PoolError> {
        let policy = LinearWithRealTimePriority::new(config.max_workers);
        Self::build(config, Box::new(policy), None)
    }

    pub fn with_policy<T>(config: Config, policy: T) -> Result<Pool, PoolError>
    where
        T: PoolPolicy + 'static,
    {
        Self::build(config, Box::new(policy), None)
    }

    /// Pool whose UI-affine callbacks are posted through `ui`.
    pub fn with_ui_thread(config: Config, ui: Arc<dyn UiThread>) -> Result<Pool, PoolError> {
        let policy = LinearWithRealTimePriority::new(config.max_workers);
        Self::build(config, Box::new(policy), Some(ui))
    }

    fn build(
        config: Config,
        policy: Box<dyn PoolPolicy>,
        ui: Option<Arc<dyn UiThread>>,
    ) -> Result<Pool, PoolError> {
        let timer =
            Timer::new(&config.thread_name).map_err(|e| PoolError::Spawn(e.to_string()))?;
        let mut spawn_error = None;
        let pool = Arc::new_cyclic(|this: &Weak<PoolManager>| {
            let dispatcher = match Dispatcher::for_pool(ui, &config.thread_name, this.clone()) {
                Ok(dispatcher) => dispatcher,
                Err(error) => {
                    spawn_error = Some(error);
                    Dispatcher::inline()
                }
            };
            PoolManager {
                this: this.clone(),
                config,
                policy,
                dispatcher,
                timer,
                registry: Mutex::new(Registry::default()),
                next_task: AtomicU64::new(0),
                submitted: AtomicUsize::new(0),
                completed: AtomicUsize::new(0),
                failed: AtomicUsize::new(0),
                cancelled: AtomicUsize::new(0),
                merged: AtomicUsize::new(0),
                shut_down: AtomicBool::new(false),
            }
        });
        if let Some(error) = spawn_error {
            return Err(PoolError::Spawn(error.to_string()));
        }

        pool.with_control(|ctl| pool.policy.on_start_up(ctl))?;
        tracing::debug!(
            max_workers = pool.config.max_workers,
            parallelism = pool.config.parallelism,
            "pool started"
        );
        Ok(pool)
    }

    #[inline]
    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub(crate) fn runtime(&self) -> Handle {
        self.timer.handle()
    }

    /// Hands the task to the policy and returns the promise of its result.
    pub fn submit<T, P>(&self, task: &Task<T, P>) -> Result<Promise<T, P>, PoolError>
    where
        T: Value,
        P: Value,
    {
        if self.shut_down.load(Ordering::Acquire) {
            return Err(PoolError::ShutDown);
        }
        let id = TaskId(self.next_task.fetch_add(1, Ordering::Relaxed) + 1);
        let link: Arc<dyn CancelLink> = Arc::new(TaskLink {
            task: id,
            pool: self.this.clone(),
        });
        let defaults = (
            self.config.default_queue_timeout,
            self.config.default_execution_timeout,
        );
        let (task_ref, promise) = task.initialize(id, self.dispatcher.clone(), link, defaults)?;
        self.submitted.fetch_add(1, Ordering::Relaxed);

        let added = self.with_control(|ctl| {
            ctl.registry.tasks.insert(
                id,
                InFlight {
                    task: task_ref.clone(),
                    place: Place::Submitted,
                },
            );
            let state = ctl.registry.snapshot();
            let added = self.policy.on_task_added(ctl, &state, &task_ref);
            if added.is_err() {
                ctl.registry.forget(id);
                task_ref.job().finish_cancelled();
            }
            added
        });
        if let Err(error) = added {
            tracing::warn!(task = %id, %error, "policy refused task");
            promise.try_cancel(false);
            return Err(error);
        }
        Ok(promise)
    }

    /// Cancels an in-flight task through its promise.
    pub fn cancel_task(&self, id: TaskId, may_interrupt: bool) -> Result<(), PoolError> {
        let task = self
            .registry
            .lock()
            .tasks
            .get(&id)
            .map(|entry| entry.task.clone())
            .ok_or(PoolError::TaskNotInFlight(id))?;
        task.job().cancel_promise(may_interrupt);
        Ok(())
    }

    pub(crate) fn forward_cancel(&self, id: TaskId, may_interrupt: bool) {
        self.with_control(|ctl| ctl.cancel_in_flight(id, may_interrupt));
    }

    pub(crate) fn on_task_finished(&self, task: &TaskRef, completion: Completion) {
        let counter = match completion {
            Completion::Resolved => &self.completed,
            Completion::Rejected => &self.failed,
            Completion::Cancelled => &self.cancelled,
        };
        counter.fetch_add(1, Ordering::Relaxed);

        self.with_control(|ctl| {
            ctl.registry.forget(task.id());
            let state = ctl.registry.snapshot();
            if let Err(error) = self.policy.on_task_finished(ctl, &state, task) {
                tracing::warn!(task = %task.id(), %error, "policy failed on task completion");
            }
        });
    }

    pub(crate) fn arm_queue_timeout(&self, id: TaskId, timeout: Duration) -> CancellationToken {
        let this = self.this.clone();
        self.timer.schedule(timeout, move || {
            if let Some(pool) = this.upgrade() {
                pool.on_queue_timeout(id);
            }
        })
    }

    pub(crate) fn arm_execution_timeout(&self, id: TaskId, timeout: Duration) -> CancellationToken {
        let this = self.this.clone();
        self.timer.schedule(timeout, move || {
            if let Some(pool) = this.upgrade() {
                pool.on_execution_timeout(id);
            }
        })
    }

    fn on_queue_timeout(&self, id: TaskId) {
        self.with_control(|ctl| {
            let Some(InFlight {
                task,
                place: Place::Queued(queue),
            }) = ctl.registry.tasks.get(&id).cloned()
            else {
                return;
            };
            let removed = ctl.registry.queues.get(&queue).and_then(|q| q.remove(id));
            if removed.is_none() {
                return;
            }
            ctl.registry.place(&task, Place::Detached);
            tracing::warn!(task = %id, queue = %queue, "task timed out waiting in queue");

            let state = ctl.registry.snapshot();
            if let Err(error) = self.policy.on_task_queue_timeout(ctl, &state, &task) {
                tracing::warn!(task = %id, %error, "policy failed on queue timeout");
            }
        });
    }

    fn on_execution_timeout(&self, id: TaskId) {
        self.with_control(|ctl| {
            let Some(task) = ctl.registry.tasks.get(&id).map(|entry| entry.task.clone()) else {
                return;
            };
            if task.state() != TaskState::Running {
                return;
            }
            tracing::warn!(task = %id, "task exceeded its execution timeout");

            let state = ctl.registry.snapshot();
            if let Err(error) = self.policy.on_task_execution_timeout(ctl, &state, &task) {
                tracing::warn!(task = %id, %error, "policy failed on execution timeout");
            }
        });
    }

    /// Runs `f` under the pool lock, then the work it deferred.
    fn with_control<R>(&self, f: impl FnOnce(&mut PoolControl<'_>) -> R) -> R {
        let (result, deferred) = {
            let mut registry = self.registry.lock();
            registry.reap();
            let mut ctl = PoolControl {
                manager: self,
                registry: &mut *registry,
                deferred: Vec::new(),
            };
            let result = f(&mut ctl);
            (result, ctl.deferred)
        };
        for job in deferred {
            run_isolated(job);
        }
        result
    }

    /// Snapshot of queues, workers and in-flight tasks.
    pub fn state(&self) -> PoolState {
        self.registry.lock().snapshot()
    }

    #[inline]
    pub fn metrics(&self) -> PoolMetrics {
        let (queued, running) = {
            let registry = self.registry.lock();
            let queued = registry.queues.values().map(|q| q.len()).sum();
            let on_workers = registry
                .workers
                .values()
                .flatten()
                .filter(|w| w.current().is_some())
                .count();
            let real_time = registry
                .tasks
                .values()
                .filter(|entry| matches!(entry.place, Place::RealTime(_)))
                .count();
            (queued, on_workers + real_time)
        };
        PoolMetrics {
            submitted: self.submitted.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
            merged: self.merged.load(Ordering::Relaxed),
            queued,
            running,
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    /// Cancels everything still queued, lets running tasks finish and
    /// joins the worker threads. Later submissions fail with
    /// [`PoolError::ShutDown`].
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        let retired = self.with_control(|ctl| {
            let queues: Vec<QueueId> = ctl.registry.queues.keys().copied().collect();
            for queue in queues {
                if let Err(error) = ctl.remove_queue(queue) {
                    tracing::debug!(queue = %queue, %error, "queue already gone");
                }
            }
            mem::take(&mut ctl.registry.retired)
        });
        for worker in retired {
            worker.join();
        }
        tracing::debug!("pool shut down");
    }

    // ---- promise factories -------------------------------------------

    /// An already resolved promise bound to this pool.
    pub fn of<T: Value, P: Value>(&self, value: T) -> Promise<T, P> {
        let promise = self.promise();
        promise.try_resolve(value);
        promise
    }

    /// An already rejected promise carrying [`TaskError::AbsentValue`].
    pub fn absent<T: Value, P: Value>(&self) -> Promise<T, P> {
        let promise = self.promise();
        promise.try_reject(TaskError::AbsentValue);
        promise
    }

    /// A pending promise the caller settles.
    pub fn promise<T: Value, P: Value>(&self) -> Promise<T, P> {
        Promise::with_dispatcher(self.dispatcher.clone())
    }

    pub fn all_of<T, P, I>(&self, promises: I) -> Promise<Vec<T>, P>
    where
        T: Value,
        P: Value,
        I: IntoIterator<Item = Promise<T, P>>,
    {
        combinators::all_of(promises)
    }

    pub fn any_of<T, P, I>(&self, promises: I) -> Promise<T, P>
    where
        T: Value,
        P: Value,
        I: IntoIterator<Item = Promise<T, P>>,
    {
        combinators::any_of(promises)
    }

    pub fn after_all<T, P, I>(&self, promises: I) -> Promise<MultipleResult<T>, P>
    where
        T: Value,
        P: Value,
        I: IntoIterator<Item = Promise<T, P>>,
    {
        combinators::after_all(promises)
    }

    pub fn or<T: Value, P: Value>(&self, main: &Promise<T, P>, fallback: &Promise<T, P>) -> Promise<T, P> {
        combinators::or(main, fallback)
    }
}

impl fmt::Debug for PoolManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolManager")
            .field("config", &self.config)
            .field("metrics", &self.metrics())
            .finish()
    }
}

impl Drop for PoolManager {
    fn drop(&mut self) {
        self.shut_down.store(true, Ordering::Release);
        let registry = self.registry.get_mut();
        for queue in mem::take(&mut registry.queues).into_values() {
            for task in queue.destroy() {
                task.job().finish_cancelled();
                task.job().cancel_promise(false);
            }
        }
        for worker in registry.workers.values().flatten() {
            worker.die();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keyed(id: u64, key: &'static str) -> TaskRef {
        let task: Task<u64> = Task::builder(move |_| Ok(id)).merge_key(key).build();
        let link: Arc<dyn CancelLink> = Arc::new(|_may_interrupt: bool| {});
        let (task, _promise) = task
            .initialize(TaskId(id), Dispatcher::inline(), link, (None, None))
            .unwrap();
        task
    }

    fn track(registry: &mut Registry, task: &TaskRef) {
        registry.tasks.insert(
            task.id(),
            InFlight {
                task: task.clone(),
                place: Place::Submitted,
            },
        );
        registry.place(task, Place::Queued(QueueId(1)));
    }

    #[test]
    fn equal_keys_keep_every_placed_task_indexed() {
        let mut registry = Registry::default();
        let first = keyed(1, "report");
        let second = keyed(2, "report");
        track(&mut registry, &first);
        track(&mut registry, &second);

        registry.forget(second.id());

        let newcomer = keyed(3, "report");
        let state = registry.snapshot();
        assert_eq!(state.equal_task(&newcomer), Some(&first));
        assert_eq!(state.equal_task(&first), None);

        registry.forget(first.id());
        assert!(registry.merge_index.is_empty());
    }

    #[test]
    fn detached_task_is_no_longer_mergeable() {
        let mut registry = Registry::default();
        let first = keyed(1, "report");
        track(&mut registry, &first);
        registry.place(&first, Place::Detached);

        assert_eq!(registry.snapshot().equal_task(&keyed(2, "report")), None);
    }
}
