use chrono::Duration;

use recepta_core::consent::ConsentStatus;
use recepta_core::constants::{
    RETENTION_AFTER_EXPIRY_SECS, RETENTION_DEFAULT_SECS, RETENTION_REJECTED_SECS,
};
use recepta_core::types::Timestamp;

/// Physical-retention deadline for a consent row (accounts under the consent
/// share it). REJECTED/REVOKED rows go after one day; everything else lives
/// until `expires_at + 30 d`, capped by the collection default.
pub fn consent_retention(
    status: ConsentStatus,
    expires_at: Option<Timestamp>,
    now: Timestamp,
) -> Timestamp {
    match status {
        ConsentStatus::Rejected | ConsentStatus::Revoked => {
            now + Duration::seconds(RETENTION_REJECTED_SECS)
        }
        _ => {
            let cap = now + Duration::seconds(RETENTION_DEFAULT_SECS);
            match expires_at {
                Some(exp) => {
                    let after_expiry = exp + Duration::seconds(RETENTION_AFTER_EXPIRY_SECS);
                    after_expiry.min(cap)
                }
                None => cap,
            }
        }
    }
}
