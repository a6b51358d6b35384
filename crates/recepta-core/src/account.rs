//! Holder-side accounts and the data we snapshot under them.

use serde::{Deserialize, Serialize};

use crate::error::ReceptaError;
use crate::money::Money;
use crate::types::{AccountId, ClientId, ConsentId, OrganisationId, Timestamp};

// ── AccountStatus ────────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AccountStatus {
    Active,
    /// Set when the transmitter answers 404 for the account: it was closed or
    /// unlinked on the holder side. Inactive accounts are skipped by the
    /// scheduler but retained until consent retention expires.
    Inactive,
}

// ── AccountType ──────────────────────────────────────────────────────────────

/// Open Finance Brasil account types (accounts v2 enum).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AccountType {
    ContaDepositoAVista,
    ContaPoupanca,
    ContaPagamentoPrePaga,
}

// ── Account ──────────────────────────────────────────────────────────────────

/// One holder-side account under a consent.
///
/// `(organisation_id, account_id)` is globally unique; `internal_id` is the
/// stable UUID minted on first ingest and used as the storage key.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Account {
    /// Transmitter-issued id.
    pub account_id: AccountId,
    /// Internal UUID minted on first ingest.
    pub internal_id: uuid::Uuid,
    pub consent_id: ConsentId,
    pub client_id: ClientId,
    pub organisation_id: OrganisationId,
    pub brand: String,
    /// CNPJ of the holder institution.
    pub cnpj: String,
    pub account_type: AccountType,
    #[serde(default)]
    pub subtype: Option<String>,
    /// Central-bank three-digit bank code.
    pub compe_code: String,
    pub branch_code: Option<String>,
    pub number: String,
    pub check_digit: String,
    pub currency: String,
    pub status: AccountStatus,
    #[serde(default)]
    pub last_synced_at: Option<Timestamp>,
    /// Transaction ingestion cursor: the last booking date fully synced.
    /// When unset, the first sync bootstraps from a 90-day window.
    #[serde(default)]
    pub last_booking_date_synced: Option<chrono::NaiveDate>,
    #[serde(default)]
    pub version: u64,
}

// ── BalanceSnapshot ──────────────────────────────────────────────────────────

/// Latest balance + overdraft-limit snapshot for one account. Overwritten on
/// each sync; an older `updated_at` than the stored one never wins.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BalanceSnapshot {
    /// Internal id of the owning account.
    pub account_internal_id: uuid::Uuid,
    pub consent_id: ConsentId,
    pub available_amount: Money,
    pub blocked_amount: Money,
    pub automatically_invested_amount: Money,
    #[serde(default)]
    pub overdraft_contracted_limit: Option<Money>,
    #[serde(default)]
    pub overdraft_used_limit: Option<Money>,
    /// The only amount allowed to be negative.
    #[serde(default)]
    pub unarranged_overdraft_amount: Option<Money>,
    /// Transmitter-reported snapshot instant.
    pub updated_at: Timestamp,
}

impl BalanceSnapshot {
    /// Negative amounts are forbidden everywhere except
    /// `unarranged_overdraft_amount`.
    pub fn validate(&self) -> Result<(), ReceptaError> {
        for (field, m) in [
            ("availableAmount", &self.available_amount),
            ("blockedAmount", &self.blocked_amount),
            (
                "automaticallyInvestedAmount",
                &self.automatically_invested_amount,
            ),
        ] {
            if m.is_negative() {
                return Err(ReceptaError::validation(
                    "SALDO_INVALIDO",
                    format!("{field} must not be negative, got {m}"),
                ));
            }
        }
        for (field, m) in [
            ("overdraftContractedLimit", &self.overdraft_contracted_limit),
            ("overdraftUsedLimit", &self.overdraft_used_limit),
        ] {
            if let Some(m) = m {
                if m.is_negative() {
                    return Err(ReceptaError::validation(
                        "SALDO_INVALIDO",
                        format!("{field} must not be negative, got {m}"),
                    ));
                }
            }
        }
        Ok(())
    }
}

// ── Transaction ──────────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CreditDebit {
    Credito,
    Debito,
}

/// One booked account transaction. Append-only;
/// `(account, external_transaction_id)` is unique.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Transaction {
    pub account_internal_id: uuid::Uuid,
    /// Transmitter-issued transaction id.
    pub external_transaction_id: String,
    pub booked_at: Timestamp,
    pub amount: Money,
    pub credit_debit: CreditDebit,
    pub transaction_name: String,
    #[serde(default)]
    pub transaction_type: Option<String>,
    /// First-ingest instant; idempotent re-ingest must not change it.
    pub created_at: Timestamp,
}
