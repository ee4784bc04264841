//! Device-side synchronization: the engine, its locks and retry policy,
//! connectivity tracking and the scheduler that drives reconciliation.

mod connectivity;
mod engine;
mod locks;
mod retry;
mod scheduler;
mod typed;

pub use connectivity::ConnectivityMonitor;
pub use engine::{
    CollectionReport, EngineError, EngineSettings, ReconcileReport, SyncEngine, SyncStatus,
};
pub use retry::{CancelFlag, RetryPolicy};
pub use scheduler::{SchedulerError, SyncOutcome, SyncScheduler};
pub use typed::TypedCollection;
