use serde::{Deserialize, Serialize};
use thiserror::Error;

// ── Transmitter error classification ─────────────────────────────────────────

/// Flat classification of a failed transmitter (or auth/directory) call.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransmitterErrorKind {
    /// 401/403 — the access token was rejected.
    Auth,
    /// 429 — holder asked us to slow down.
    RateLimited,
    /// Circuit open, 503, or the holder is otherwise not taking calls.
    Unavailable,
    /// Any other 4xx — the request itself is wrong; retrying cannot help.
    BadRequest,
    /// 404 — the addressed resource no longer exists at the holder.
    NotFound,
    /// Remaining 5xx.
    ServerError,
    /// Connect/read failure or timeout before a status line arrived.
    Network,
}

impl TransmitterErrorKind {
    /// Whether a fresh attempt against the same holder can succeed.
    /// Auth is special-cased by callers (token refresh then one retry).
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            TransmitterErrorKind::RateLimited
                | TransmitterErrorKind::Unavailable
                | TransmitterErrorKind::ServerError
                | TransmitterErrorKind::Network
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TransmitterErrorKind::Auth => "auth",
            TransmitterErrorKind::RateLimited => "rate_limited",
            TransmitterErrorKind::Unavailable => "unavailable",
            TransmitterErrorKind::BadRequest => "bad_request",
            TransmitterErrorKind::NotFound => "not_found",
            TransmitterErrorKind::ServerError => "server_error",
            TransmitterErrorKind::Network => "network",
        }
    }
}

/// A failed call to a holder institution, carrying enough to decide the
/// retry path without re-parsing anything.
#[derive(Clone, Debug, Error, Serialize, Deserialize)]
#[error("{kind:?} from transmitter (status {status:?}): {message}")]
pub struct TransmitterError {
    pub kind: TransmitterErrorKind,
    /// HTTP status when a response arrived; None for transport failures.
    pub status: Option<u16>,
    pub message: String,
}

impl TransmitterError {
    pub fn new(kind: TransmitterErrorKind, status: Option<u16>, message: impl Into<String>) -> Self {
        Self {
            kind,
            status,
            message: message.into(),
        }
    }

    /// Classify an HTTP status into a kind.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let kind = match status {
            401 | 403 => TransmitterErrorKind::Auth,
            404 => TransmitterErrorKind::NotFound,
            408 => TransmitterErrorKind::Network,
            429 => TransmitterErrorKind::RateLimited,
            400..=499 => TransmitterErrorKind::BadRequest,
            503 => TransmitterErrorKind::Unavailable,
            500..=599 => TransmitterErrorKind::ServerError,
            _ => TransmitterErrorKind::ServerError,
        };
        Self::new(kind, Some(status), message)
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(TransmitterErrorKind::Network, None, message)
    }

    /// Short-circuit result while a breaker is open.
    pub fn circuit_open(org: &str) -> Self {
        Self::new(
            TransmitterErrorKind::Unavailable,
            None,
            format!("circuit open for organisation {org}"),
        )
    }

    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }
}

// ── ReceptaError ─────────────────────────────────────────────────────────────

/// The closed error set of the receptor. Components map everything into one
/// of these; nothing else crosses a crate boundary.
#[derive(Debug, Error)]
pub enum ReceptaError {
    /// Caller-side input is wrong (missing permission, expiry in the past,
    /// malformed document number). Never retried.
    #[error("validation failed [{code}]: {detail}")]
    Validation { code: String, detail: String },

    /// A consent transition or consent-gated operation is illegal in the
    /// consent's current status. Never retried.
    #[error("invalid consent state [{code}]: {detail}")]
    InvalidConsentState { code: String, detail: String },

    /// The addressed entity does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// A transmitter call failed after local policy (retry, breaker) was
    /// applied.
    #[error(transparent)]
    Transmitter(#[from] TransmitterError),

    /// Conditional write lost an optimistic-version race.
    #[error("version conflict on {collection}/{key}: expected {expected}, found {found}")]
    Conflict {
        collection: String,
        key: String,
        expected: u64,
        found: u64,
    },

    #[error("storage error: {0}")]
    Storage(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    /// Event bus delivery failed after retries; envelope went to the DLQ.
    #[error("publish failed: {0}")]
    Publish(String),

    /// Anything unexpected. The job dies, the process keeps running.
    #[error("fatal: {0}")]
    Fatal(String),
}

impl ReceptaError {
    pub fn validation(code: impl Into<String>, detail: impl Into<String>) -> Self {
        ReceptaError::Validation {
            code: code.into(),
            detail: detail.into(),
        }
    }

    pub fn invalid_consent_state(code: impl Into<String>, detail: impl Into<String>) -> Self {
        ReceptaError::InvalidConsentState {
            code: code.into(),
            detail: detail.into(),
        }
    }

    /// Whether a sync job hitting this error should be nacked as retryable.
    pub fn is_retryable(&self) -> bool {
        match self {
            ReceptaError::Transmitter(e) => e.is_retryable(),
            ReceptaError::Conflict { .. } => true,
            ReceptaError::Storage(_) => true,
            ReceptaError::Publish(_) => true,
            ReceptaError::Validation { .. }
            | ReceptaError::InvalidConsentState { .. }
            | ReceptaError::NotFound(_)
            | ReceptaError::Serialization(_)
            | ReceptaError::Fatal(_) => false,
        }
    }

    /// Stable class label used in run reports and DLQ rows.
    pub fn class(&self) -> &'static str {
        match self {
            ReceptaError::Validation { .. } => "validation",
            ReceptaError::InvalidConsentState { .. } => "invalid_consent_state",
            ReceptaError::NotFound(_) => "not_found",
            ReceptaError::Transmitter(e) => e.kind.as_str(),
            ReceptaError::Conflict { .. } => "conflict",
            ReceptaError::Storage(_) => "storage",
            ReceptaError::Serialization(_) => "serialization",
            ReceptaError::Publish(_) => "publish",
            ReceptaError::Fatal(_) => "fatal",
        }
    }
}

// ── Problem document ─────────────────────────────────────────────────────────

/// RFC 7807 problem+json body handed to the public API layer. Internal error
/// classes never leak; only the stable `code` does.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Problem {
    pub code: String,
    pub title: String,
    pub detail: String,
    #[serde(rename = "traceId")]
    pub trace_id: String,
}

impl Problem {
    pub fn from_error(err: &ReceptaError, trace_id: impl Into<String>) -> Self {
        let (code, title) = match err {
            ReceptaError::Validation { code, .. } => (code.clone(), "Validation failed"),
            ReceptaError::InvalidConsentState { code, .. } => {
                (code.clone(), "Invalid consent state")
            }
            ReceptaError::NotFound(_) => ("NAO_ENCONTRADO".to_string(), "Not found"),
            _ => ("ERRO_INTERNO".to_string(), "Internal error"),
        };
        Self {
            code,
            title: title.to_string(),
            detail: err.to_string(),
            trace_id: trace_id.into(),
        }
    }
}
