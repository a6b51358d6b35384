//! Wire payloads of the transmitter APIs and their conversions into domain
//! types. Every response rides the `{data, links, meta}` envelope; amounts
//! arrive as decimal strings with an explicit currency. Conversions are pure
//! functions so they can be tested without HTTP.

use serde::{Deserialize, Serialize};

use recepta_core::account::{
    Account, AccountStatus, AccountType, BalanceSnapshot, CreditDebit, Transaction,
};
use recepta_core::consent::ConsentStatus;
use recepta_core::documents::validate_cnpj;
use recepta_core::error::ReceptaError;
use recepta_core::money::Money;
use recepta_core::types::{AccountId, ClientId, ConsentId, OrganisationId, Timestamp};

// ── Envelope ─────────────────────────────────────────────────────────────────

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Envelope<T> {
    pub data: T,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub links: Option<Links>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<Meta>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Links {
    #[serde(default, rename = "self", skip_serializing_if = "Option::is_none")]
    pub self_link: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prev: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next: Option<String>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Meta {
    #[serde(default)]
    pub total_records: Option<u64>,
    #[serde(default)]
    pub total_pages: Option<u64>,
}

// ── Amounts ──────────────────────────────────────────────────────────────────

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AmountWire {
    pub amount: String,
    pub currency: String,
}

impl AmountWire {
    pub fn to_money(&self) -> Result<Money, ReceptaError> {
        Money::parse(&self.amount, &self.currency)
    }
}

// ── Accounts family ──────────────────────────────────────────────────────────

/// One entry of `GET /accounts` and the body of `GET /accounts/{id}`.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountData {
    pub account_id: String,
    pub brand_name: String,
    pub company_cnpj: String,
    #[serde(rename = "type")]
    pub account_type: AccountType,
    #[serde(default)]
    pub subtype: Option<String>,
    pub compe_code: String,
    #[serde(default)]
    pub branch_code: Option<String>,
    pub number: String,
    pub check_digit: String,
    pub currency: String,
}

impl AccountData {
    /// Promote to the stored form. `internal_id` is minted by the caller on
    /// first ingest and reused afterwards.
    pub fn into_account(
        self,
        internal_id: uuid::Uuid,
        consent_id: ConsentId,
        client_id: ClientId,
        organisation_id: OrganisationId,
    ) -> Result<Account, ReceptaError> {
        let cnpj = validate_cnpj(&self.company_cnpj)?;
        Ok(Account {
            account_id: AccountId::new(self.account_id),
            internal_id,
            consent_id,
            client_id,
            organisation_id,
            brand: self.brand_name,
            cnpj,
            account_type: self.account_type,
            subtype: self.subtype,
            compe_code: self.compe_code,
            branch_code: self.branch_code,
            number: self.number,
            check_digit: self.check_digit,
            currency: self.currency,
            status: AccountStatus::Active,
            last_synced_at: None,
            last_booking_date_synced: None,
            version: 0,
        })
    }
}

/// Body of `GET /accounts/{id}/balances`.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BalancesData {
    pub available_amount: AmountWire,
    pub blocked_amount: AmountWire,
    pub automatically_invested_amount: AmountWire,
    pub update_date_time: Timestamp,
}

/// Body of `GET /accounts/{id}/overdraft-limits`.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OverdraftLimitsData {
    #[serde(default)]
    pub overdraft_contracted_limit: Option<AmountWire>,
    #[serde(default)]
    pub overdraft_used_limit: Option<AmountWire>,
    #[serde(default)]
    pub unarranged_overdraft_amount: Option<AmountWire>,
}

/// Combine balances and limits into the stored snapshot, enforcing the
/// no-negative-amounts rule.
pub fn into_snapshot(
    balances: BalancesData,
    limits: OverdraftLimitsData,
    account_internal_id: uuid::Uuid,
    consent_id: ConsentId,
) -> Result<BalanceSnapshot, ReceptaError> {
    let opt = |a: Option<AmountWire>| -> Result<Option<Money>, ReceptaError> {
        a.map(|w| w.to_money()).transpose()
    };
    let snapshot = BalanceSnapshot {
        account_internal_id,
        consent_id,
        available_amount: balances.available_amount.to_money()?,
        blocked_amount: balances.blocked_amount.to_money()?,
        automatically_invested_amount: balances.automatically_invested_amount.to_money()?,
        overdraft_contracted_limit: opt(limits.overdraft_contracted_limit)?,
        overdraft_used_limit: opt(limits.overdraft_used_limit)?,
        unarranged_overdraft_amount: opt(limits.unarranged_overdraft_amount)?,
        updated_at: balances.update_date_time,
    };
    snapshot.validate()?;
    Ok(snapshot)
}

/// One entry of `GET /accounts/{id}/transactions`.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionData {
    pub transaction_id: String,
    pub transaction_name: String,
    #[serde(rename = "type", default)]
    pub transaction_type: Option<String>,
    pub credit_debit_type: CreditDebit,
    pub amount: AmountWire,
    pub transaction_date_time: Timestamp,
}

impl TransactionData {
    pub fn into_transaction(
        self,
        account_internal_id: uuid::Uuid,
        ingested_at: Timestamp,
    ) -> Result<Transaction, ReceptaError> {
        Ok(Transaction {
            account_internal_id,
            external_transaction_id: self.transaction_id,
            booked_at: self.transaction_date_time,
            amount: self.amount.to_money()?,
            credit_debit: self.credit_debit_type,
            transaction_name: self.transaction_name,
            transaction_type: self.transaction_type,
            created_at: ingested_at,
        })
    }
}

// ── Consents family ──────────────────────────────────────────────────────────

/// Body of `GET /consents/v3/consents/{id}`.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsentData {
    pub consent_id: String,
    pub status: String,
    pub status_update_date_time: Timestamp,
    #[serde(default)]
    pub expiration_date_time: Option<Timestamp>,
    #[serde(default)]
    pub permissions: Vec<String>,
    #[serde(default)]
    pub rejection: Option<ConsentRejectionWire>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsentRejectionWire {
    pub reason_code: String,
    #[serde(default)]
    pub additional_information: Option<String>,
}

impl ConsentData {
    pub fn status_enum(&self) -> Result<ConsentStatus, ReceptaError> {
        parse_consent_status(&self.status)
    }
}

pub fn parse_consent_status(s: &str) -> Result<ConsentStatus, ReceptaError> {
    match s {
        "AWAITING_AUTHORISATION" => Ok(ConsentStatus::AwaitingAuthorisation),
        "AUTHORISED" => Ok(ConsentStatus::Authorised),
        "REJECTED" => Ok(ConsentStatus::Rejected),
        "REVOKED" => Ok(ConsentStatus::Revoked),
        "EXPIRED" => Ok(ConsentStatus::Expired),
        other => Err(ReceptaError::Serialization(format!(
            "unknown consent status {other:?}"
        ))),
    }
}

/// Request body of `POST /consents/v3/consents/{id}/extensions`.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtensionRequestData {
    pub expiration_date_time: Timestamp,
    pub logged_user: LoggedUserWire,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LoggedUserWire {
    pub document: DocumentWire,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DocumentWire {
    pub identification: String,
    /// Document type, `CPF` for natural persons.
    pub rel: String,
}

/// Response body of the extension endpoint.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtensionResponseData {
    pub expiration_date_time: Timestamp,
    #[serde(default)]
    pub request_date_time: Option<Timestamp>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn balances() -> BalancesData {
        BalancesData {
            available_amount: AmountWire {
                amount: "100.00".into(),
                currency: "BRL".into(),
            },
            blocked_amount: AmountWire {
                amount: "0.00".into(),
                currency: "BRL".into(),
            },
            automatically_invested_amount: AmountWire {
                amount: "0.00".into(),
                currency: "BRL".into(),
            },
            update_date_time: Utc::now(),
        }
    }

    #[test]
    fn envelope_parses_ofb_shape() {
        let json = r#"{
            "data": [{
                "accountId": "A1",
                "brandName": "Banco Exemplo",
                "companyCnpj": "11222333000181",
                "type": "CONTA_DEPOSITO_A_VISTA",
                "compeCode": "001",
                "branchCode": "6272",
                "number": "94088392",
                "checkDigit": "4",
                "currency": "BRL"
            }],
            "links": {"self": "https://x/accounts", "next": "https://x/accounts?page=2"},
            "meta": {"totalRecords": 1, "totalPages": 2}
        }"#;
        let env: Envelope<Vec<AccountData>> = serde_json::from_str(json).unwrap();
        assert_eq!(env.data.len(), 1);
        assert_eq!(env.data[0].account_id, "A1");
        assert_eq!(env.data[0].account_type, AccountType::ContaDepositoAVista);
        assert_eq!(env.links.unwrap().next.as_deref(), Some("https://x/accounts?page=2"));
    }

    #[test]
    fn account_promotion_validates_cnpj() {
        let mut data: AccountData = serde_json::from_value(serde_json::json!({
            "accountId": "A1",
            "brandName": "Banco Exemplo",
            "companyCnpj": "11222333000181",
            "type": "CONTA_DEPOSITO_A_VISTA",
            "compeCode": "001",
            "number": "94088392",
            "checkDigit": "4",
            "currency": "BRL"
        }))
        .unwrap();
        let ok = data.clone().into_account(
            uuid::Uuid::new_v4(),
            ConsentId::new("urn:c:1"),
            ClientId::new("cli"),
            OrganisationId::new("org"),
        );
        assert!(ok.is_ok());

        data.company_cnpj = "11222333000199".into();
        let err = data.into_account(
            uuid::Uuid::new_v4(),
            ConsentId::new("urn:c:1"),
            ClientId::new("cli"),
            OrganisationId::new("org"),
        );
        assert!(matches!(err, Err(ReceptaError::Validation { .. })));
    }

    #[test]
    fn snapshot_combines_balances_and_limits() {
        let id = uuid::Uuid::new_v4();
        let snap = into_snapshot(
            balances(),
            OverdraftLimitsData {
                unarranged_overdraft_amount: Some(AmountWire {
                    amount: "-120.50".into(),
                    currency: "BRL".into(),
                }),
                ..Default::default()
            },
            id,
            ConsentId::new("urn:c:1"),
        )
        .unwrap();
        assert_eq!(snap.available_amount.amount.to_string(), "100.00");
        assert!(snap.unarranged_overdraft_amount.unwrap().is_negative());
    }

    #[test]
    fn snapshot_rejects_negative_available() {
        let mut b = balances();
        b.available_amount.amount = "-5.00".into();
        let err = into_snapshot(
            b,
            OverdraftLimitsData::default(),
            uuid::Uuid::new_v4(),
            ConsentId::new("urn:c:1"),
        );
        assert!(err.is_err());
    }

    #[test]
    fn consent_status_parse() {
        assert_eq!(
            parse_consent_status("AUTHORISED").unwrap(),
            ConsentStatus::Authorised
        );
        assert!(parse_consent_status("PENDING").is_err());
    }
}
