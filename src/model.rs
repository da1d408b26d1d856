use super::task::{MergeKey, TaskId, TaskRef};
use std::{
    collections::{BTreeMap, HashMap},
    fmt,
    time::Instant,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QueueId(pub u32);

impl fmt::Display for QueueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "q{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkerId(pub u64);

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "w{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkerStatus {
    /// Thread spawned, not yet blocked on its queue.
    Starting,
    WaitingForTask,
    Running,
    /// Thread exited (asked to die, interrupted, or its queue was destroyed).
    Terminated,
}

#[derive(Debug, Clone)]
pub struct WorkerState {
    pub id: WorkerId,
    pub status: WorkerStatus,
    pub current_task: Option<TaskId>,
    pub last_active: Instant,
}

#[derive(Debug, Clone)]
pub struct QueueState {
    pub id: QueueId,
    /// Tasks waiting in the queue.
    pub depth: usize,
    /// Workers blocked waiting for a task.
    pub waiters: usize,
    pub workers: Vec<WorkerState>,
}

impl QueueState {
    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    pub fn is_idle(&self) -> bool {
        self.depth == 0 && self.workers.iter().all(|w| w.current_task.is_none())
    }
}

/// Read-only view of the pool handed to policy hooks.
#[derive(Debug, Clone, Default)]
pub struct PoolState {
    pub queues: BTreeMap<QueueId, QueueState>,
    /// In-flight tasks by merge key.
    pub(crate) in_flight: HashMap<MergeKey, Vec<TaskRef>>,
    pub real_time_running: usize,
}

impl PoolState {
    pub fn queue(&self, id: QueueId) -> Option<&QueueState> {
        self.queues.get(&id)
    }

    /// An in-flight task equal to `task` (same merge key), other than
    /// `task` itself.
    pub fn equal_task(&self, task: &TaskRef) -> Option<&TaskRef> {
        let key = task.merge_key()?;
        self.in_flight
            .get(&key)?
            .iter()
            .find(|found| found.id() != task.id())
    }

    pub fn worker_count(&self) -> usize {
        self.queues.values().map(QueueState::worker_count).sum()
    }

    pub fn queued_tasks(&self) -> usize {
        self.queues.values().map(|q| q.depth).sum()
    }
}

impl fmt::Display for PoolState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "pool: {} queue(s), {} real-time task(s)",
            self.queues.len(),
            self.real_time_running
        )?;
        for queue in self.queues.values() {
            writeln!(
                f,
                "  {} depth={} waiters={} workers={}",
                queue.id,
                queue.depth,
                queue.waiters,
                queue.workers.len()
            )?;
            for worker in &queue.workers {
                let task = worker
                    .current_task
                    .map(|id| id.to_string())
                    .unwrap_or_else(|| "-".into());
                writeln!(
                    f,
                    "    {} {:?} task={} idle_for={:?}",
                    worker.id,
                    worker.status,
                    task,
                    worker.last_active.elapsed()
                )?;
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolMetrics {
    pub submitted: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub merged: usize,
    pub queued: usize,
    pub running: usize,
}

impl PoolMetrics {
    pub fn finished(&self) -> usize {
        self.completed + self.failed + self.cancelled
    }

    pub fn success_rate(&self) -> f64 {
        let total = self.completed + self.failed;
        if total == 0 {
            return 1.0;
        }
        self.completed as f64 / total as f64
    }
}
