//! Human-readable USD price parsing for route configuration.

pub mod money;

pub use money::{MoneyAmountError, format_usdc_amount, parse_usdc_amount};
