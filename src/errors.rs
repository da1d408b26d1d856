use std::{error::Error as StdError, fmt, sync::Arc};

use super::{
    model::{QueueId, WorkerId},
    promise::PromiseState,
    task::{TaskId, TaskState},
};

/// Contract violations: the caller used the pool, a task or a promise
/// outside of its valid lifecycle. These are returned immediately and are
/// never stored inside a promise.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PoolError {
    #[error("task {task:?} cannot be submitted or reset from state {state:?}")]
    IllegalReuse { task: Option<TaskId>, state: TaskState },
    #[error("promise is already {state:?}")]
    IllegalPromiseTransition { state: PromiseState },
    #[error("task was never submitted to a pool")]
    NotSubmitted,
    #[error("queue {0} already exists")]
    DuplicateQueue(QueueId),
    #[error("queue {0} does not exist")]
    UnknownQueue(QueueId),
    #[error("worker {0} does not exist")]
    UnknownWorker(WorkerId),
    #[error("queue {0} was destroyed")]
    QueueDestroyed(QueueId),
    #[error("task {0} is neither queued nor running")]
    TaskNotInFlight(TaskId),
    #[error("task {0} cannot be merged into a task of a different result type")]
    MergeMismatch(TaskId),
    #[error("pool is shut down")]
    ShutDown,
    #[error("failed to spawn thread: {0}")]
    Spawn(String),
}

/// Reason carried by a rejected promise.
///
/// Cheap to clone: every fail callback and every waiter observes the same
/// error value.
#[derive(Clone, thiserror::Error)]
pub enum TaskError {
    #[error("{0}")]
    Failure(Arc<dyn StdError + Send + Sync>),
    #[error("{0}")]
    Message(String),
    #[error("panic: {0}")]
    Panic(String),
    #[error("interrupted")]
    Interrupted,
    #[error("promise was cancelled")]
    Cancelled,
    #[error("timed out waiting for the promise")]
    Timeout,
    #[error("all {} inputs failed", .0.len())]
    AllInputsFailed(Vec<TaskError>),
    #[error("both branches failed (main: {main}, fallback: {fallback})")]
    BothBranchesFailed {
        main: Box<TaskError>,
        fallback: Box<TaskError>,
    },
    #[error("absent value")]
    AbsentValue,
}

impl TaskError {
    pub fn msg(message: impl Into<String>) -> Self {
        TaskError::Message(message.into())
    }

    pub fn failure<E>(error: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        TaskError::Failure(Arc::new(error))
    }

    pub(crate) fn from_panic(payload: Box<dyn std::any::Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            format!("{:?}", payload)
        };
        TaskError::Panic(message)
    }

    #[inline]
    pub fn is_interrupted(&self) -> bool {
        matches!(self, TaskError::Interrupted)
    }
}

impl fmt::Debug for TaskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskError::Failure(e) => f.debug_tuple("Failure").field(&e.to_string()).finish(),
            TaskError::Message(m) => f.debug_tuple("Message").field(m).finish(),
            TaskError::Panic(m) => f.debug_tuple("Panic").field(m).finish(),
            TaskError::Interrupted => f.write_str("Interrupted"),
            TaskError::Cancelled => f.write_str("Cancelled"),
            TaskError::Timeout => f.write_str("Timeout"),
            TaskError::AllInputsFailed(errors) => {
                f.debug_tuple("AllInputsFailed").field(errors).finish()
            }
            TaskError::BothBranchesFailed { main, fallback } => f
                .debug_struct("BothBranchesFailed")
                .field("main", main)
                .field("fallback", fallback)
                .finish(),
            TaskError::AbsentValue => f.write_str("AbsentValue"),
        }
    }
}

impl PartialEq for TaskError {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (TaskError::Failure(a), TaskError::Failure(b)) => {
                Arc::ptr_eq(a, b) || a.to_string() == b.to_string()
            }
            (TaskError::Message(a), TaskError::Message(b)) => a == b,
            (TaskError::Panic(a), TaskError::Panic(b)) => a == b,
            (TaskError::AllInputsFailed(a), TaskError::AllInputsFailed(b)) => a == b,
            (
                TaskError::BothBranchesFailed { main: m1, fallback: f1 },
                TaskError::BothBranchesFailed { main: m2, fallback: f2 },
            ) => m1 == m2 && f1 == f2,
            (TaskError::Interrupted, TaskError::Interrupted)
            | (TaskError::Cancelled, TaskError::Cancelled)
            | (TaskError::Timeout, TaskError::Timeout)
            | (TaskError::AbsentValue, TaskError::AbsentValue) => true,
            _ => false,
        }
    }
}

impl From<std::io::Error> for TaskError {
    fn from(error: std::io::Error) -> Self {
        TaskError::failure(error)
    }
}

impl From<std::num::ParseIntError> for TaskError {
    fn from(error: std::num::ParseIntError) -> Self {
        TaskError::failure(error)
    }
}

impl From<PoolError> for TaskError {
    fn from(error: PoolError) -> Self {
        TaskError::failure(error)
    }
}

impl From<String> for TaskError {
    fn from(message: String) -> Self {
        TaskError::Message(message)
    }
}

impl From<&str> for TaskError {
    fn from(message: &str) -> Self {
        TaskError::Message(message.to_string())
    }
}

pub type TaskResult<T> = Result<T, TaskError>;
