//! Conversion between human-readable USD prices and smallest token units.
//!
//! Route configuration carries prices like `"$0.01"` or `"1,000"`. On the wire
//! and on-chain, amounts are unbounded nonnegative integers in the token's
//! smallest unit (USDC: 10^6 units per dollar). This is the only place in the
//! crate where amounts pass through [`Decimal`] arithmetic; all protocol-level
//! comparisons stay in `U256`.

use alloy::primitives::U256;
use once_cell::sync::Lazy;
use regex::Regex;
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use std::str::FromStr;

use crate::types::TokenAmount;

static NON_NUMERIC: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[^\d\.\-]+").expect("valid regex for numeric cleanup"));

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum MoneyAmountError {
    #[error("Invalid number format")]
    InvalidFormat,
    #[error("Negative value is not allowed")]
    Negative,
    #[error("Amount does not fit the token's unit range")]
    OutOfRange,
}

/// Parses a human-readable USD string into smallest token units.
///
/// Currency symbols and thousands separators are stripped before parsing, so
/// `"$1.00"`, `"1,000"` and `"0.0001"` are all accepted. The result is rounded
/// to the nearest smallest unit at the token's `decimals`.
pub fn parse_usdc_amount(input: &str, decimals: u32) -> Result<TokenAmount, MoneyAmountError> {
    let cleaned = NON_NUMERIC.replace_all(input, "");
    let parsed = Decimal::from_str(&cleaned).map_err(|_| MoneyAmountError::InvalidFormat)?;
    if parsed.is_sign_negative() {
        return Err(MoneyAmountError::Negative);
    }
    let scaled = parsed
        .checked_mul(Decimal::from(10u64.pow(decimals)))
        .ok_or(MoneyAmountError::OutOfRange)?
        .round();
    let units = scaled.to_u128().ok_or(MoneyAmountError::OutOfRange)?;
    Ok(TokenAmount(U256::from(units)))
}

/// Formats smallest token units as a dollar string rounded to whole cents.
///
/// The inverse of [`parse_usdc_amount`] only for whole-cent amounts; smaller
/// residues are lost to the 2-decimal rounding. Amounts beyond [`Decimal`]'s
/// 96-bit range are rejected rather than misrendered.
pub fn format_usdc_amount(amount: &TokenAmount, decimals: u32) -> Result<String, MoneyAmountError> {
    let units: i128 = amount.0.try_into().map_err(|_| MoneyAmountError::OutOfRange)?;
    let dollars = Decimal::try_from_i128_with_scale(units, decimals)
        .map_err(|_| MoneyAmountError::OutOfRange)?
        .round_dp(2);
    Ok(format!("${dollars}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_dollar_prefixed_amount() {
        let amount = parse_usdc_amount("$1.00", 6).unwrap();
        assert_eq!(amount.to_string(), "1000000");
    }

    #[test]
    fn parses_thousands_separator() {
        let amount = parse_usdc_amount("1,000", 6).unwrap();
        assert_eq!(amount.to_string(), "1000000000");
    }

    #[test]
    fn parses_sub_cent_price() {
        let amount = parse_usdc_amount("0.0001", 6).unwrap();
        assert_eq!(amount.to_string(), "100");
    }

    #[test]
    fn rejects_negative() {
        assert_eq!(parse_usdc_amount("-3", 6), Err(MoneyAmountError::Negative));
    }

    #[test]
    fn rejects_non_numeric() {
        assert_eq!(
            parse_usdc_amount("NaN", 6),
            Err(MoneyAmountError::InvalidFormat)
        );
        assert_eq!(
            parse_usdc_amount("", 6),
            Err(MoneyAmountError::InvalidFormat)
        );
    }

    #[test]
    fn rounds_to_nearest_smallest_unit() {
        // 0.0000004 dollars is 0.4 units at 6 decimals
        let amount = parse_usdc_amount("0.0000004", 6).unwrap();
        assert_eq!(amount.to_string(), "0");
        let amount = parse_usdc_amount("0.0000006", 6).unwrap();
        assert_eq!(amount.to_string(), "1");
    }

    #[test]
    fn formats_whole_cents() {
        let amount = TokenAmount(U256::from(1_230_000u64));
        assert_eq!(format_usdc_amount(&amount, 6).unwrap(), "$1.23");
    }

    #[test]
    fn format_rounds_to_cents() {
        let amount = TokenAmount(U256::from(43_700u64)); // $0.0437
        assert_eq!(format_usdc_amount(&amount, 6).unwrap(), "$0.04");
    }

    #[test]
    fn format_rejects_amounts_beyond_decimal_range() {
        assert_eq!(
            format_usdc_amount(&TokenAmount(U256::MAX), 6),
            Err(MoneyAmountError::OutOfRange)
        );
        // Fits i128 but not Decimal's 96-bit mantissa
        let too_large = TokenAmount(U256::from(1u128 << 100));
        assert_eq!(
            format_usdc_amount(&too_large, 6),
            Err(MoneyAmountError::OutOfRange)
        );
    }

    #[test]
    fn whole_cent_amounts_roundtrip() {
        for units in [0u64, 10_000, 1_000_000, 123_450_000] {
            let amount = TokenAmount(U256::from(units));
            let formatted = format_usdc_amount(&amount, 6).unwrap();
            let reparsed = parse_usdc_amount(&formatted, 6).unwrap();
            assert_eq!(reparsed, amount, "roundtrip failed for {formatted}");
        }
    }
}
