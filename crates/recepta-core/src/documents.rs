//! Brazilian tax-id (CPF/CNPJ) check-digit validation.
//!
//! Both formats use two trailing verification digits computed as weighted
//! sums mod 11. Inputs are accepted with or without punctuation.

use crate::error::ReceptaError;

fn digits_of(s: &str) -> Vec<u32> {
    s.chars().filter_map(|c| c.to_digit(10)).collect()
}

fn check_digit(digits: &[u32], weights: &[u32]) -> u32 {
    let sum: u32 = digits.iter().zip(weights).map(|(d, w)| d * w).sum();
    match sum % 11 {
        0 | 1 => 0,
        r => 11 - r,
    }
}

/// Validate a CPF (11 digits, natural person). Returns the bare digit string.
pub fn validate_cpf(input: &str) -> Result<String, ReceptaError> {
    let digits = digits_of(input);
    if digits.len() != 11 {
        return Err(ReceptaError::validation(
            "DOCUMENTO_INVALIDO",
            format!("CPF must have 11 digits, got {}", digits.len()),
        ));
    }
    // All-equal CPFs pass the checksum but are not assignable.
    if digits.windows(2).all(|w| w[0] == w[1]) {
        return Err(ReceptaError::validation(
            "DOCUMENTO_INVALIDO",
            "CPF with all identical digits",
        ));
    }
    let w1: Vec<u32> = (2..=10).rev().collect();
    let w2: Vec<u32> = (2..=11).rev().collect();
    if check_digit(&digits[..9], &w1) != digits[9] || check_digit(&digits[..10], &w2) != digits[10]
    {
        return Err(ReceptaError::validation(
            "DOCUMENTO_INVALIDO",
            "CPF check digits do not match",
        ));
    }
    Ok(digits.iter().map(|d| d.to_string()).collect())
}

/// Validate a CNPJ (14 digits, legal entity). Returns the bare digit string.
pub fn validate_cnpj(input: &str) -> Result<String, ReceptaError> {
    let digits = digits_of(input);
    if digits.len() != 14 {
        return Err(ReceptaError::validation(
            "DOCUMENTO_INVALIDO",
            format!("CNPJ must have 14 digits, got {}", digits.len()),
        ));
    }
    let w1 = [5u32, 4, 3, 2, 9, 8, 7, 6, 5, 4, 3, 2];
    let w2 = [6u32, 5, 4, 3, 2, 9, 8, 7, 6, 5, 4, 3, 2];
    if check_digit(&digits[..12], &w1) != digits[12]
        || check_digit(&digits[..13], &w2) != digits[13]
    {
        return Err(ReceptaError::validation(
            "DOCUMENTO_INVALIDO",
            "CNPJ check digits do not match",
        ));
    }
    Ok(digits.iter().map(|d| d.to_string()).collect())
}
