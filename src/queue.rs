use super::{
    errors::PoolError,
    model::QueueId,
    task::{Priority, TaskId, TaskRef},
    worker::WorkerShared,
};
use parking_lot::{Condvar, Mutex};
use std::{
    cmp::Reverse,
    collections::{BTreeMap, HashMap},
    sync::atomic::{AtomicUsize, Ordering},
};

/// Highest priority first, then arrival order.
type Slot = (Reverse<Priority>, u64);

struct Entries {
    ordered: BTreeMap<Slot, TaskRef>,
    index: HashMap<TaskId, Slot>,
    next_seq: u64,
    alive: bool,
}

/// Priority queue shared by the workers of one queue id.
pub(crate) struct TaskQueue {
    id: QueueId,
    entries: Mutex<Entries>,
    available: Condvar,
    waiters: AtomicUsize,
}

impl TaskQueue {
    pub fn new(id: QueueId) -> Self {
        Self {
            id,
            entries: Mutex::new(Entries {
                ordered: BTreeMap::new(),
                index: HashMap::new(),
                next_seq: 0,
                alive: true,
            }),
            available: Condvar::new(),
            waiters: AtomicUsize::new(0),
        }
    }

    pub fn id(&self) -> QueueId {
        self.id
    }

    pub fn len(&self) -> usize {
        self.entries.lock().ordered.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().ordered.is_empty()
    }

    /// Workers currently blocked in [`take`](Self::take).
    pub fn waiters(&self) -> usize {
        self.waiters.load(Ordering::Acquire)
    }

    #[cfg(test)]
    pub fn is_alive(&self) -> bool {
        self.entries.lock().alive
    }

    pub fn insert(&self, task: TaskRef) -> Result<(), PoolError> {
        let mut entries = self.entries.lock();
        if !entries.alive {
            return Err(PoolError::QueueDestroyed(self.id));
        }
        let slot = (Reverse(task.priority()), entries.next_seq);
        entries.next_seq += 1;
        entries.index.insert(task.id(), slot);
        entries.ordered.insert(slot, task);
        drop(entries);
        self.available.notify_one();
        Ok(())
    }

    pub fn remove(&self, id: TaskId) -> Option<TaskRef> {
        let mut entries = self.entries.lock();
        let slot = entries.index.remove(&id)?;
        entries.ordered.remove(&slot)
    }

    /// Blocks until a task is available and binds it to `worker`. Returns
    /// `None` once the worker is told to stop or the queue is destroyed.
    pub fn take(&self, worker: &WorkerShared) -> Option<TaskRef> {
        let mut entries = self.entries.lock();
        loop {
            if !entries.alive || worker.should_stop() {
                // hand the wake-up on to a worker that may still take work
                self.available.notify_one();
                return None;
            }
            if let Some((_, task)) = entries.ordered.pop_first() {
                entries.index.remove(&task.id());
                worker.bind(task.id());
                return Some(task);
            }

            self.waiters.fetch_add(1, Ordering::AcqRel);
            worker.set_waiting(true);
            self.available.wait(&mut entries);
            worker.set_waiting(false);
            self.waiters.fetch_sub(1, Ordering::AcqRel);
        }
    }

    /// Wakes every blocked worker so it can re-check its stop flags.
    pub fn wake_all(&self) {
        let _entries = self.entries.lock();
        self.available.notify_all();
    }

    /// Marks the queue dead and hands back everything still queued.
    pub fn destroy(&self) -> Vec<TaskRef> {
        let drained = {
            let mut entries = self.entries.lock();
            entries.alive = false;
            entries.index.clear();
            std::mem::take(&mut entries.ordered).into_values().collect()
        };
        self.available.notify_all();
        drained
    }
}
