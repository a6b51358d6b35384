use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::ReceptaError;

/// Fixed-point monetary amount with explicit currency.
///
/// Transmitters send amounts as decimal strings (`"100.00"`); we parse them
/// into [`rust_decimal::Decimal`] and never touch floating point.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Money {
    pub amount: Decimal,
    /// ISO 4217 code, e.g. `BRL`.
    pub currency: String,
}

impl Money {
    pub fn new(amount: Decimal, currency: impl Into<String>) -> Self {
        Self {
            amount,
            currency: currency.into(),
        }
    }

    /// Parse a wire amount string. Rejects malformed decimals and empty
    /// currency codes.
    pub fn parse(amount: &str, currency: &str) -> Result<Self, ReceptaError> {
        if currency.trim().is_empty() {
            return Err(ReceptaError::validation(
                "PARAMETRO_INVALIDO",
                "currency code must not be empty",
            ));
        }
        let amount = Decimal::from_str(amount).map_err(|e| {
            ReceptaError::validation(
                "PARAMETRO_INVALIDO",
                format!("malformed amount {amount:?}: {e}"),
            )
        })?;
        Ok(Self {
            amount,
            currency: currency.to_string(),
        })
    }

    /// Zero in the given currency.
    pub fn zero(currency: impl Into<String>) -> Self {
        Self {
            amount: Decimal::ZERO,
            currency: currency.into(),
        }
    }

    pub fn is_negative(&self) -> bool {
        self.amount.is_sign_negative() && !self.amount.is_zero()
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.amount, self.currency)
    }
}

impl fmt::Debug for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Money({} {})", self.amount, self.currency)
    }
}
