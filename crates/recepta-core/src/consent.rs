//! The consent aggregate: the customer's authorisation-of-record that gates
//! every downstream data pull.
//!
//! Status machine:
//!   AWAITING_AUTHORISATION → AUTHORISED → (REJECTED | REVOKED | EXPIRED)
//! with REJECTED/EXPIRED also reachable directly from AWAITING_AUTHORISATION
//! (the customer never finished the redirect, or the window lapsed).
//! Terminal statuses are immutable.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

use crate::error::ReceptaError;
use crate::types::{AccountId, ClientId, ConsentId, OrganisationId, Timestamp};

// ── Permission ───────────────────────────────────────────────────────────────

/// Fine-grained entitlement attached to a consent. The wire strings are the
/// Open Finance Brasil enum members.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Permission {
    AccountsRead,
    AccountsBalancesRead,
    AccountsTransactionsRead,
    AccountsOverdraftLimitsRead,
    ResourcesRead,
}

// ── ConsentStatus ────────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConsentStatus {
    AwaitingAuthorisation,
    Authorised,
    Rejected,
    Revoked,
    Expired,
}

impl ConsentStatus {
    /// True if no further transition is possible.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ConsentStatus::Rejected | ConsentStatus::Revoked | ConsentStatus::Expired
        )
    }

    /// AUTHORISED is the only status under which data may be collected.
    pub fn permits_collection(self) -> bool {
        self == ConsentStatus::Authorised
    }

    /// Whether `self → to` is a legal edge of the status machine.
    pub fn can_transition_to(self, to: ConsentStatus) -> bool {
        use ConsentStatus::*;
        matches!(
            (self, to),
            (AwaitingAuthorisation, Authorised)
                | (AwaitingAuthorisation, Rejected)
                | (AwaitingAuthorisation, Expired)
                | (Authorised, Rejected)
                | (Authorised, Revoked)
                | (Authorised, Expired)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ConsentStatus::AwaitingAuthorisation => "AWAITING_AUTHORISATION",
            ConsentStatus::Authorised => "AUTHORISED",
            ConsentStatus::Rejected => "REJECTED",
            ConsentStatus::Revoked => "REVOKED",
            ConsentStatus::Expired => "EXPIRED",
        }
    }
}

impl fmt::Display for ConsentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Rejection info ───────────────────────────────────────────────────────────

/// Why a consent ended up REJECTED/REVOKED, as reported by the holder.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsentRejection {
    pub code: String,
    pub detail: Option<String>,
}

// ── Consent ──────────────────────────────────────────────────────────────────

/// Full consent record as stored. Created by the external consent-creation
/// flow; mutated here by the consent engine (status, expiry) and by sync
/// workers (`last_processed_at`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Consent {
    pub consent_id: ConsentId,
    pub client_id: ClientId,
    pub organisation_id: OrganisationId,
    pub status: ConsentStatus,
    pub created_at: Timestamp,
    pub status_updated_at: Timestamp,
    pub expires_at: Option<Timestamp>,
    pub permissions: BTreeSet<Permission>,
    /// CPF of the customer who granted the consent.
    pub logged_user_id: String,
    /// CNPJ when the consent belongs to a business customer.
    #[serde(default)]
    pub business_entity_id: Option<String>,
    /// Transmitter account ids linked by the customer during authorisation.
    /// Grow-only while AUTHORISED.
    #[serde(default)]
    pub linked_account_ids: BTreeSet<AccountId>,
    /// Transaction history window granted by the customer.
    #[serde(default)]
    pub transaction_from: Option<Timestamp>,
    #[serde(default)]
    pub transaction_to: Option<Timestamp>,
    /// Extensions require fresh approval from every legal representative.
    #[serde(default)]
    pub multiple_approval_required: bool,
    #[serde(default)]
    pub rejection: Option<ConsentRejection>,
    /// Last time a scheduler run picked this consent up.
    #[serde(default)]
    pub last_processed_at: Option<Timestamp>,
    /// Optimistic-concurrency version, echoed into `Store::upsert`.
    #[serde(default)]
    pub version: u64,
}

impl Consent {
    /// Pure transition. Returns the mutated consent or an
    /// `InvalidConsentState` naming the illegal edge.
    pub fn transition(
        mut self,
        to: ConsentStatus,
        rejection: Option<ConsentRejection>,
        at: Timestamp,
    ) -> Result<Consent, ReceptaError> {
        if !self.status.can_transition_to(to) {
            return Err(ReceptaError::invalid_consent_state(
                "ESTADO_CONSENTIMENTO_INVALIDO",
                format!(
                    "consent {} cannot move {} -> {}",
                    self.consent_id, self.status, to
                ),
            ));
        }
        self.status = to;
        self.status_updated_at = at;
        if to == ConsentStatus::Rejected || to == ConsentStatus::Revoked {
            self.rejection = rejection;
        }
        Ok(self)
    }

    /// Link a further account id. Only legal while AUTHORISED; the set never
    /// shrinks.
    pub fn link_account(&mut self, account_id: AccountId) -> Result<(), ReceptaError> {
        if self.status != ConsentStatus::Authorised {
            return Err(ReceptaError::invalid_consent_state(
                "ESTADO_CONSENTIMENTO_INVALIDO",
                format!(
                    "cannot link account to consent {} in status {}",
                    self.consent_id, self.status
                ),
            ));
        }
        self.linked_account_ids.insert(account_id);
        Ok(())
    }

    /// Whether this consent is past its expiry instant.
    pub fn is_expired_at(&self, now: Timestamp) -> bool {
        matches!(self.expires_at, Some(exp) if exp < now)
    }

    /// Whether a scheduler run should pick this consent up.
    pub fn is_due(&self, now: Timestamp, cooldown: chrono::Duration) -> bool {
        self.status.permits_collection()
            && !self.is_expired_at(now)
            && match self.last_processed_at {
                None => true,
                Some(at) => at < now - cooldown,
            }
    }
}

// ── ConsentExtension ─────────────────────────────────────────────────────────

/// Audit record of one renewal of a consent's expiry.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConsentExtension {
    pub id: uuid::Uuid,
    pub consent_id: ConsentId,
    pub previous_expires_at: Option<Timestamp>,
    pub new_expires_at: Timestamp,
    pub requested_at: Timestamp,
    pub logged_user_id: String,
    #[serde(default)]
    pub ip_address: Option<String>,
    #[serde(default)]
    pub user_agent: Option<String>,
}
