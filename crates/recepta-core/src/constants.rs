//! Workspace-wide defaults. Components take these as config with these
//! values as the defaults; nothing reads them ad hoc at call sites.

/// Safety margin subtracted from a token's lifetime before it is considered
/// expired (seconds).
pub const TOKEN_EXPIRY_SAFETY_SECS: i64 = 60;

/// TTL for idempotency receipts of incoming consent-create requests.
pub const IDEMPOTENCY_TTL_SECS: i64 = 24 * 3600;

/// TTL for hot consent documents on the read path.
pub const CONSENT_CACHE_TTL_SECS: i64 = 3600;

/// Directory roster refresh interval (seconds).
pub const DIRECTORY_REFRESH_SECS: i64 = 2 * 3600;

/// Retry policy for transmitter calls.
pub const RETRY_MAX_ATTEMPTS: u32 = 3;
pub const RETRY_BASE_DELAY_MS: u64 = 200;
pub const RETRY_MAX_DELAY_MS: u64 = 5_000;

/// Circuit breaker: rolling sample window, trip ratio, open duration and
/// successes required to close again.
pub const BREAKER_WINDOW: usize = 20;
pub const BREAKER_TRIP_RATIO: f64 = 0.5;
pub const BREAKER_OPEN_SECS: i64 = 30;
pub const BREAKER_CLOSE_SUCCESSES: u32 = 2;

/// Queue defaults.
pub const JOB_MAX_ATTEMPTS: u32 = 5;
pub const JOB_BACKOFF_BASE_SECS: i64 = 30;
pub const JOB_BACKOFF_MAX_SECS: i64 = 15 * 60;

/// Scheduler defaults.
pub const SCHEDULER_COOLDOWN_SECS: i64 = 6 * 3600;
pub const SCHEDULER_WINDOW_SECS: i64 = 12 * 3600;
pub const SCHEDULER_INCREMENTAL_SECS: i64 = 5 * 60;
pub const SCHEDULER_PAGE_SIZE: usize = 500;

/// Consent engine sweep cadences.
pub const EXPIRY_SWEEP_SECS: i64 = 3600;
pub const SYNC_SWEEP_SECS: i64 = 30 * 60;
/// AWAITING_AUTHORISATION consents older than this are reconciled against
/// the transmitter by the sync sweep.
pub const SYNC_SWEEP_MIN_AGE_SECS: i64 = 3600;

/// Maximum extension horizon: one year from the request instant.
pub const EXTENSION_MAX_DAYS: i64 = 365;

/// Retention windows.
pub const RETENTION_REJECTED_SECS: i64 = 24 * 3600;
pub const RETENTION_AFTER_EXPIRY_SECS: i64 = 30 * 24 * 3600;
pub const RETENTION_DEFAULT_SECS: i64 = 400 * 24 * 3600;

/// Transaction paging window (days) used when an account has no cursor yet.
pub const TX_BOOTSTRAP_WINDOW_DAYS: i64 = 90;

/// Bounded optimistic-conflict replays before giving up (then nack).
pub const CONFLICT_MAX_REPLAYS: u32 = 3;
