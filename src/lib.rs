//! Пул потоков с промисами и подключаемой политикой планирования
//!
//! # Features
//! - Промисы с колбэками done/fail/progress/cancel/always и привязкой к UI-потоку
//! - Приоритетные очереди задач, таймауты ожидания и выполнения
//! - Политика пула как отдельная стратегия (`PoolPolicy`)
//! - Слияние одинаковых задач, real-time задачи вне очереди
//! - Комбинаторы `all_of` / `any_of` / `after_all` / `or`
//! - Ленивый конвейер filter/map/for_each с параллельными стадиями
//!
//! ```no_run
//! use promise_pool::{PoolManager, Task};
//!
//! let pool = PoolManager::new()?;
//! let task: Task<u64> = Task::new(|_ctx| Ok(6 * 7));
//! let answer = pool.submit(&task)?.get_result();
//! assert_eq!(answer, Ok(42));
//! # Ok::<(), promise_pool::PoolError>(())
//! ```

pub mod combinators;
pub mod dispatch;
pub mod errors;
pub mod model;
pub mod pipeline;
pub mod policy;
pub mod pool;
pub mod promise;
pub mod task;

mod queue;
mod timer;
mod worker;

pub use combinators::{after_all, all_of, any_of, or, MultipleResult, Outcome};
pub use dispatch::{Affinity, Dispatcher, UiThread};
pub use errors::{PoolError, TaskError, TaskResult};
pub use model::{PoolMetrics, PoolState, QueueId, QueueState, WorkerId, WorkerState, WorkerStatus};
pub use pipeline::CollectionPromise;
pub use policy::{LinearWithRealTimePriority, PoolPolicy};
pub use pool::{Config, Pool, PoolControl, PoolManager};
pub use promise::{Promise, PromiseState, Value};
pub use task::{MergeKey, Priority, Task, TaskBuilder, TaskContext, TaskId, TaskRef, TaskState};
