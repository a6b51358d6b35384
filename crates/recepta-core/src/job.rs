//! The durable unit of work dispatched through the queue.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::types::{AccountId, ClientId, ConsentId, JobId, OrganisationId, RunId, Timestamp};

// ── JobKind ──────────────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobKind {
    /// Identification + balances + limits for one account.
    AccountSync,
    /// Balances/limits only (cheap refresh between full syncs).
    BalanceSync,
    /// Transaction pages from the account cursor forward.
    TxSync,
    /// Reconcile one consent's status against the transmitter.
    ConsentSync,
}

impl JobKind {
    pub fn as_str(self) -> &'static str {
        match self {
            JobKind::AccountSync => "ACCOUNT_SYNC",
            JobKind::BalanceSync => "BALANCE_SYNC",
            JobKind::TxSync => "TX_SYNC",
            JobKind::ConsentSync => "CONSENT_SYNC",
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── JobStatus ────────────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    /// Waiting to be leased (possibly not before `next_visible_at`).
    Pending,
    /// Claimed by a node until `lease.until`.
    Leased,
    /// Acked. Never resurrected.
    Done,
    /// Failed non-retryably before exhausting attempts. Terminal.
    Failed,
    /// Retries exhausted. Terminal.
    Dead,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Done | JobStatus::Failed | JobStatus::Dead)
    }
}

// ── Lease ────────────────────────────────────────────────────────────────────

/// Exclusive time-bounded claim on a job by one worker node.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub node: String,
    pub until: Timestamp,
}

// ── SyncJob ──────────────────────────────────────────────────────────────────

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SyncJob {
    pub job_id: JobId,
    pub kind: JobKind,
    pub consent_id: ConsentId,
    #[serde(default)]
    pub account_id: Option<AccountId>,
    pub client_id: ClientId,
    pub organisation_id: OrganisationId,
    /// Higher runs first.
    pub priority: i32,
    /// Incremented only on observed failure, never on lease expiry.
    pub attempts: u32,
    pub max_attempts: u32,
    pub status: JobStatus,
    #[serde(default)]
    pub lease: Option<Lease>,
    /// Earliest instant the job may be leased again after a retryable nack.
    #[serde(default)]
    pub next_visible_at: Option<Timestamp>,
    #[serde(default)]
    pub last_error: Option<String>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
    pub run_id: RunId,
    #[serde(default)]
    pub version: u64,
}

impl SyncJob {
    /// Dedup identity: one non-terminal job per `(kind, consent, account)`.
    pub fn dedup_key(&self) -> String {
        dedup_key(self.kind, &self.consent_id, self.account_id.as_ref())
    }

    /// Whether the job's lease has lapsed at `now`.
    pub fn lease_expired(&self, now: Timestamp) -> bool {
        self.status == JobStatus::Leased
            && matches!(&self.lease, Some(l) if l.until < now)
    }

    /// Whether the job may be leased at `now`.
    pub fn leasable(&self, now: Timestamp) -> bool {
        self.status == JobStatus::Pending
            && match self.next_visible_at {
                None => true,
                Some(at) => at <= now,
            }
    }
}

pub fn dedup_key(kind: JobKind, consent_id: &ConsentId, account_id: Option<&AccountId>) -> String {
    match account_id {
        Some(a) => format!("{}|{}|{}", kind.as_str(), consent_id, a),
        None => format!("{}|{}", kind.as_str(), consent_id),
    }
}
