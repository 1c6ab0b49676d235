//! Scheduling primitives: the recurring-task seam, the sharded pool
//! scheduler and the shared deferred-action queue.

pub mod pool;
pub mod queue;
pub mod recurring;

pub use pool::{PoolSet, PoolSpec, PoolWorker, Retention, TickReport};
pub use queue::{BusyFlag, DeferredQueue, QueuedEntry, SweepReport, Verdict};
pub use recurring::{Job, ManualScheduler, RecurringScheduler, TaskHandle, TokioScheduler};
