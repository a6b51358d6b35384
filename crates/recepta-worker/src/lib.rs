//! recepta-worker
//!
//! The bounded worker pool. Each worker task leases a batch of jobs and
//! dispatches them by kind: account sync (identification + balances +
//! limits), balance refresh, transaction paging from the account cursor, or
//! consent reconcile. Per-organisation semaphores keep one misbehaving
//! holder from saturating the pool; a job-level deadline aborts hung calls
//! and nacks the job as retryable. On shutdown workers finish their leased
//! batch and exit; unfinished leases expire and return to PENDING.

mod pool;
mod sync;

pub use pool::{WorkerConfig, WorkerPool};
