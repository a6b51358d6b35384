//! Core domain types for the recepta data-collection receptor.
//!
//! This crate defines the shared vocabulary of the workspace:
//! - [`types`] — identifier newtypes and timestamps
//! - [`money`] — fixed-point monetary amounts with explicit currency
//! - [`consent`] — the consent aggregate and its status machine
//! - [`account`] — accounts, balance snapshots and transactions
//! - [`job`] — the durable sync-job record leased by workers
//! - [`event`] — bus events emitted across the pipeline
//! - [`report`] — per-run aggregation (counters, latency histogram)
//! - [`error`] — the closed error taxonomy
//! - [`clock`] — the injectable clock (system + manual for tests)
//! - [`context`] — per-call context (run id, correlation id, deadline)

pub mod account;
pub mod clock;
pub mod consent;
pub mod constants;
pub mod context;
pub mod documents;
pub mod error;
pub mod event;
pub mod job;
pub mod money;
pub mod report;
pub mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use context::Context;
pub use error::{ReceptaError, TransmitterError, TransmitterErrorKind};
pub use money::Money;
pub use types::{AccountId, ClientId, ConsentId, JobId, OrganisationId, RunId, Timestamp};
