//! Deferred job queue for ledger side effects.
//!
//! Notifications and activity-feed writes triggered by a completion or refund
//! are enqueued here after the ledger transaction commits, with a due time in
//! the future. They run outside the ledger's correctness path: a failing job is
//! dead-lettered and logged, never reported back to the ledger caller.
//!
//! - `Job`: kind, JSON payload, due time; runs at most once
//! - `JobStore`: queue persistence (in-memory for tests/dev)
//! - `JobExecutor`: routes due jobs to handlers, on demand or on a background thread

pub mod executor;
pub mod store;
pub mod types;

pub use executor::{ExecutorStats, JobExecutor, JobExecutorConfig, JobExecutorHandle};
pub use store::{InMemoryJobStore, JobStats, JobStore, JobStoreError};
pub use types::{DeadLetterEntry, Job, JobId, JobKind, JobResult, JobStatus};
