use super::{
    errors::PoolError,
    model::{QueueId, WorkerId, WorkerState, WorkerStatus},
    pool::PoolManager,
    queue::TaskQueue,
    task::{ExecEnv, TaskId, TaskRef},
};
use parking_lot::Mutex;
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Weak,
    },
    thread,
    time::Instant,
};
use tokio_util::sync::CancellationToken;

/// State a worker shares with its queue and with the pool.
pub(crate) struct WorkerShared {
    id: WorkerId,
    queue: QueueId,
    die: AtomicBool,
    interrupt: CancellationToken,
    current: Mutex<Option<TaskId>>,
    last_active: Mutex<Instant>,
    waiting: AtomicBool,
    started: AtomicBool,
}

impl WorkerShared {
    fn new(id: WorkerId, queue: QueueId) -> Self {
        Self {
            id,
            queue,
            die: AtomicBool::new(false),
            interrupt: CancellationToken::new(),
            current: Mutex::new(None),
            last_active: Mutex::new(Instant::now()),
            waiting: AtomicBool::new(false),
            started: AtomicBool::new(false),
        }
    }

    #[cfg(test)]
    pub(crate) fn detached(queue: QueueId) -> Self {
        Self::new(WorkerId(0), queue)
    }

    pub fn should_stop(&self) -> bool {
        self.die.load(Ordering::Acquire) || self.interrupt.is_cancelled()
    }

    pub fn bind(&self, task: TaskId) {
        *self.current.lock() = Some(task);
        *self.last_active.lock() = Instant::now();
    }

    fn unbind(&self) {
        *self.current.lock() = None;
        *self.last_active.lock() = Instant::now();
    }

    pub fn set_waiting(&self, waiting: bool) {
        self.started.store(true, Ordering::Release);
        self.waiting.store(waiting, Ordering::Release);
    }

    pub fn current(&self) -> Option<TaskId> {
        *self.current.lock()
    }
}

/// One thread draining one queue.
pub(crate) struct Worker {
    shared: Arc<WorkerShared>,
    queue: Arc<TaskQueue>,
    thread: Option<thread::JoinHandle<()>>,
}

impl Worker {
    pub fn spawn(
        id: WorkerId,
        queue: Arc<TaskQueue>,
        manager: Weak<PoolManager>,
        thread_name: &str,
    ) -> Result<Self, PoolError> {
        let shared = Arc::new(WorkerShared::new(id, queue.id()));
        let thread = {
            let shared = Arc::clone(&shared);
            let queue = Arc::clone(&queue);
            thread::Builder::new()
                .name(format!("{thread_name}-{id}"))
                .spawn(move || run(shared, queue, manager))
                .map_err(|e| PoolError::Spawn(e.to_string()))?
        };
        tracing::trace!(worker = %id, queue = %shared.queue, "worker spawned");
        Ok(Self {
            shared,
            queue,
            thread: Some(thread),
        })
    }

    pub fn id(&self) -> WorkerId {
        self.shared.id
    }

    pub fn current(&self) -> Option<TaskId> {
        self.shared.current()
    }

    /// Stop after the current task.
    pub fn die(&self) {
        self.shared.die.store(true, Ordering::Release);
        self.queue.wake_all();
    }

    /// Stop now, signalling the running task's interrupt token. The thread
    /// is not reused afterwards.
    pub fn interrupt(&self) {
        self.shared.die.store(true, Ordering::Release);
        self.shared.interrupt.cancel();
        self.queue.wake_all();
        tracing::warn!(worker = %self.shared.id, task = ?self.current(), "worker interrupted");
    }

    pub fn status(&self) -> WorkerStatus {
        let finished = self
            .thread
            .as_ref()
            .map_or(true, |thread| thread.is_finished());
        if finished {
            WorkerStatus::Terminated
        } else if self.shared.current().is_some() {
            WorkerStatus::Running
        } else if self.shared.waiting.load(Ordering::Acquire) {
            WorkerStatus::WaitingForTask
        } else if self.shared.started.load(Ordering::Acquire) {
            WorkerStatus::Running
        } else {
            WorkerStatus::Starting
        }
    }

    pub fn state(&self) -> WorkerState {
        WorkerState {
            id: self.shared.id,
            status: self.status(),
            current_task: self.shared.current(),
            last_active: *self.shared.last_active.lock(),
        }
    }

    /// Waits for the thread to exit, unless called from that very thread.
    pub fn join(mut self) {
        let Some(thread) = self.thread.take() else {
            return;
        };
        if thread.thread().id() == thread::current().id() {
            return;
        }
        if thread.join().is_err() {
            tracing::error!(worker = %self.shared.id, "worker thread panicked");
        }
    }
}

fn run(shared: Arc<WorkerShared>, queue: Arc<TaskQueue>, manager: Weak<PoolManager>) {
    tracing::trace!(worker = %shared.id, "worker started");
    while let Some(task) = queue.take(&shared) {
        let Some(manager) = manager.upgrade() else {
            break;
        };
        let env = ExecEnv {
            manager: &manager,
            interrupt: shared.interrupt.clone(),
            worker: Some(shared.id),
        };
        let completion = task.job().execute(&env);
        shared.unbind();
        manager.on_task_finished(&task, completion);
        if shared.interrupt.is_cancelled() {
            break;
        }
    }
    tracing::trace!(worker = %shared.id, "worker exiting");
}

/// Runs `task` on its own short-lived thread, bypassing every queue.
/// The returned token interrupts the task.
pub(crate) fn spawn_real_time(
    task: TaskRef,
    manager: Weak<PoolManager>,
    thread_name: &str,
) -> Result<CancellationToken, PoolError> {
    let interrupt = CancellationToken::new();
    let token = interrupt.clone();
    thread::Builder::new()
        .name(format!("{thread_name}-rt-{}", task.id().get()))
        .spawn(move || {
            let Some(manager) = manager.upgrade() else {
                return;
            };
            tracing::trace!(task = %task.id(), "real-time task started");
            let env = ExecEnv {
                manager: &manager,
                interrupt,
                worker: None,
            };
            let completion = task.job().execute(&env);
            manager.on_task_finished(&task, completion);
        })
        .map_err(|e| PoolError::Spawn(e.to_string()))?;
    Ok(token)
}
