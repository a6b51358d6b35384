//! recepta-store
//!
//! Durable partitioned document store backed by sled (pure-Rust, no C
//! dependencies). One named tree per collection; values are bincode-encoded
//! envelopes carrying an optimistic-concurrency version, soft-delete marker
//! and physical-retention deadline. Conditional writes go through sled's
//! `compare_and_swap`, so cross-process writers race safely.
//!
//! Transactional scope is a single document. Cross-document consistency is
//! the writer's job: read, then conditionally write with `expected_version`,
//! retrying the pure transition on [`ReceptaError::Conflict`].

mod retention;
mod store;

pub use retention::consent_retention;
pub use store::{Collection, Page, Store, Versioned};
