//! recepta-consent
//!
//! The consent lifecycle engine: applies status transitions through
//! versioned writes (conflicts replay the pure transition), runs the expiry
//! and reconcile sweeps, validates and executes extensions, and feeds the
//! scheduler via `find_due`. Every status change is published and evicts
//! the hot-consent cache entry.

mod engine;

pub use engine::{ConsentEngine, ExtensionRequest};

/// Rejection codes surfaced by the extension endpoint.
pub mod codes {
    pub const INVALID_STATE: &str = "ESTADO_CONSENTIMENTO_INVALIDO";
    pub const INVALID_EXPIRY: &str = "DATA_EXPIRACAO_INVALIDA";
    pub const MULTIPLE_APPROVAL: &str = "DEPENDE_MULTIPLA_ALCADA";
}
