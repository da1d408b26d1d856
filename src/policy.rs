//! Scheduling strategy. A policy decides where submitted work runs and how
//! the pool grows; [`PoolControl`] is the only way it touches the pool.
//!
//! Hooks run while the pool is locked: they must only use the control
//! handle and never block on promises.

use super::{
    errors::PoolError,
    model::{PoolState, QueueId},
    pool::PoolControl,
    task::TaskRef,
};

pub trait PoolPolicy: Send + Sync {
    /// Called once when the pool is created.
    fn on_start_up(&self, _ctl: &mut PoolControl<'_>) -> Result<(), PoolError> {
        Ok(())
    }

    /// A task was submitted. The policy must queue it, run it immediately
    /// or merge it into an equal in-flight task.
    fn on_task_added(
        &self,
        ctl: &mut PoolControl<'_>,
        state: &PoolState,
        task: &TaskRef,
    ) -> Result<(), PoolError>;

    fn on_task_finished(
        &self,
        _ctl: &mut PoolControl<'_>,
        _state: &PoolState,
        _task: &TaskRef,
    ) -> Result<(), PoolError> {
        Ok(())
    }

    /// The task waited too long and was taken out of its queue.
    fn on_task_queue_timeout(
        &self,
        ctl: &mut PoolControl<'_>,
        _state: &PoolState,
        task: &TaskRef,
    ) -> Result<(), PoolError> {
        ctl.cancel_task(task, false)
    }

    /// The task is still running past its execution timeout.
    fn on_task_execution_timeout(
        &self,
        ctl: &mut PoolControl<'_>,
        _state: &PoolState,
        task: &TaskRef,
    ) -> Result<(), PoolError> {
        ctl.cancel_task(task, false)
    }
}

/// One queue, workers grown lazily up to `max_workers`, and real-time
/// tasks run on a dedicated thread when no worker can pick them up right
/// away.
#[derive(Debug, Clone)]
pub struct LinearWithRealTimePriority {
    max_workers: usize,
}

impl LinearWithRealTimePriority {
    pub const QUEUE: QueueId = QueueId(1);

    pub fn new(max_workers: usize) -> Self {
        Self {
            max_workers: max_workers.max(1),
        }
    }

    pub fn max_workers(&self) -> usize {
        self.max_workers
    }
}

impl Default for LinearWithRealTimePriority {
    fn default() -> Self {
        Self::new(num_cpus::get())
    }
}

impl PoolPolicy for LinearWithRealTimePriority {
    fn on_start_up(&self, ctl: &mut PoolControl<'_>) -> Result<(), PoolError> {
        ctl.create_queue(Self::QUEUE)?;
        ctl.create_worker(Self::QUEUE)?;
        Ok(())
    }

    fn on_task_added(
        &self,
        ctl: &mut PoolControl<'_>,
        state: &PoolState,
        task: &TaskRef,
    ) -> Result<(), PoolError> {
        if let Some(in_flight) = state.equal_task(task) {
            return ctl.merge_task(in_flight, task);
        }

        let queue = state
            .queue(Self::QUEUE)
            .ok_or(PoolError::UnknownQueue(Self::QUEUE))?;

        if task.priority().is_real_time() && (queue.depth > 0 || queue.waiters == 0) {
            return ctl.execute_immediately(task);
        }

        if queue.waiters == 0 && queue.worker_count() < self.max_workers {
            ctl.create_worker(Self::QUEUE)?;
        }
        ctl.queue_task(Self::QUEUE, task)
    }
}
