// Token descriptors and exact native-unit conversions

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Decimal's scale ceiling; no ledger token we handle goes beyond it.
const MAX_DECIMALS: u32 = 28;

#[derive(Debug, Error, PartialEq)]
pub enum AmountError {
    #[error("amount must not be negative")]
    Negative,
    #[error("amount {0} does not fit the token's native representation")]
    Overflow(String),
    #[error("malformed native amount '{0}'")]
    Malformed(String),
    #[error("unsupported token precision {0}")]
    Precision(u32),
    #[error("amount {amount} is finer than the token's {decimals} decimals")]
    TooPrecise { amount: String, decimals: u32 },
}

/// A fungible resource on the source ledger and its fixed precision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenSpec {
    pub symbol: String,
    pub resource: String,
    pub decimals: u32,
}

impl TokenSpec {
    pub fn new(symbol: impl Into<String>, resource: impl Into<String>, decimals: u32) -> Self {
        Self {
            symbol: symbol.into(),
            resource: resource.into(),
            decimals,
        }
    }

    pub fn to_native(&self, amount: Decimal) -> Result<u128, AmountError> {
        to_native_units(amount, self.decimals)
    }

    pub fn from_native(&self, raw: &str) -> Result<Decimal, AmountError> {
        from_native_units(raw, self.decimals)
    }
}

/// Converts a ledger amount expressed in smallest units (an unsigned integer
/// string) into an exact decimal.
pub fn from_native_units(raw: &str, decimals: u32) -> Result<Decimal, AmountError> {
    if decimals > MAX_DECIMALS {
        return Err(AmountError::Precision(decimals));
    }
    let units: u128 = raw
        .trim()
        .parse()
        .map_err(|_| AmountError::Malformed(raw.to_string()))?;
    let units = i128::try_from(units).map_err(|_| AmountError::Overflow(raw.to_string()))?;
    Decimal::try_from_i128_with_scale(units, decimals)
        .map(|d| d.normalize())
        .map_err(|_| AmountError::Overflow(raw.to_string()))
}

/// Converts an exact decimal into the token's smallest unit. An amount finer
/// than the token's precision is refused rather than rounded, so what gets
/// recorded is always what moves on the ledger.
pub fn to_native_units(amount: Decimal, decimals: u32) -> Result<u128, AmountError> {
    if decimals > MAX_DECIMALS {
        return Err(AmountError::Precision(decimals));
    }
    if amount.is_sign_negative() && !amount.is_zero() {
        return Err(AmountError::Negative);
    }
    let amount = amount.normalize();
    if amount.scale() > decimals {
        return Err(AmountError::TooPrecise {
            amount: amount.to_string(),
            decimals,
        });
    }
    let factor = Decimal::from_i128_with_scale(10_i128.pow(decimals), 0);
    amount
        .checked_mul(factor)
        .and_then(|scaled| scaled.to_u128())
        .ok_or_else(|| AmountError::Overflow(amount.to_string()))
}
