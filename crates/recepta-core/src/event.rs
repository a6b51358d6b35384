//! Events emitted onto the bus. At-least-once, keyed by aggregate id;
//! consumers must tolerate duplicates.

use serde::{Deserialize, Serialize};

use crate::consent::ConsentStatus;
use crate::report::RunReport;
use crate::types::{AccountId, ClientId, ConsentId, JobId, OrganisationId, RunId, Timestamp};

/// Outcome of one sync job as seen by the run aggregation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncOutcome {
    Success,
    /// The job observed a consent that no longer permits collection and
    /// acked without doing work.
    Skipped,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Event {
    ConsentStatusChanged {
        consent_id: ConsentId,
        client_id: ClientId,
        previous: ConsentStatus,
        new: ConsentStatus,
        at: Timestamp,
    },
    ConsentExtended {
        consent_id: ConsentId,
        client_id: ClientId,
        previous_expires_at: Option<Timestamp>,
        new_expires_at: Timestamp,
        at: Timestamp,
    },
    AccountSynced {
        organisation_id: OrganisationId,
        account_id: AccountId,
        consent_id: ConsentId,
        run_id: RunId,
        outcome: SyncOutcome,
        at: Timestamp,
    },
    BatchStarted {
        run_id: RunId,
        jobs_enqueued: u64,
        at: Timestamp,
    },
    BatchCompleted {
        run_id: RunId,
        report: RunReport,
        at: Timestamp,
    },
    /// Internal: one job terminated successfully (or was skipped). The run
    /// aggregation folds these into the report.
    JobDone {
        job_id: JobId,
        run_id: RunId,
        organisation_id: OrganisationId,
        outcome: SyncOutcome,
        duration_ms: u64,
        at: Timestamp,
    },
    /// Internal: one job terminated in FAILED or DEAD.
    JobDead {
        job_id: JobId,
        run_id: RunId,
        organisation_id: OrganisationId,
        error_class: String,
        duration_ms: u64,
        at: Timestamp,
    },
}

impl Event {
    /// Partition key: the aggregate id.
    pub fn key(&self) -> String {
        match self {
            Event::ConsentStatusChanged { consent_id, .. }
            | Event::ConsentExtended { consent_id, .. } => consent_id.to_string(),
            Event::AccountSynced { account_id, .. } => account_id.to_string(),
            Event::BatchStarted { run_id, .. } | Event::BatchCompleted { run_id, .. } => {
                run_id.to_string()
            }
            Event::JobDone { job_id, .. } | Event::JobDead { job_id, .. } => job_id.to_string(),
        }
    }

    pub fn topic(&self) -> &'static str {
        match self {
            Event::ConsentStatusChanged { .. } | Event::ConsentExtended { .. } => "consent-events",
            Event::AccountSynced { .. } => "account-updates",
            Event::BatchStarted { .. } | Event::BatchCompleted { .. } => "batch-completed",
            Event::JobDone { .. } | Event::JobDead { .. } => "job-events",
        }
    }
}
