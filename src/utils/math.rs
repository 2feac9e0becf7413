//! Integer and decimal arithmetic for ledger calculations.
//!
//! Ledger quantities are integer base units (`u128`) and every division
//! rounds toward zero. Prices and exchange rates are `Decimal`.

use crate::error::{VaultError, VaultResult};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;

/// 10000 bps = 100%.
pub const BPS_DENOMINATOR: u128 = 10_000;

/// Compute `a * b / denominator`, rounding down.
pub fn mul_div(a: u128, b: u128, denominator: u128) -> VaultResult<u128> {
    if denominator == 0 {
        return Err(VaultError::Arithmetic("division by zero".into()));
    }
    a.checked_mul(b)
        .map(|product| product / denominator)
        .ok_or_else(|| VaultError::Arithmetic(format!("{a} * {b} overflows")))
}

/// Portion of `amount` represented by `bps` basis points, rounding down.
pub fn apply_bps(amount: u128, bps: u32) -> VaultResult<u128> {
    mul_div(amount, u128::from(bps), BPS_DENOMINATOR)
}

/// Lift base units into a `Decimal` for price math.
pub fn to_decimal(units: u128) -> VaultResult<Decimal> {
    u64::try_from(units)
        .map(Decimal::from)
        .map_err(|_| VaultError::Arithmetic(format!("{units} exceeds decimal range")))
}

/// Truncate a non-negative `Decimal` back into base units.
pub fn units_from_decimal(value: Decimal) -> VaultResult<u128> {
    if value.is_sign_negative() && !value.is_zero() {
        return Err(VaultError::Arithmetic(format!("negative quantity {value}")));
    }
    value
        .trunc()
        .to_u64()
        .map(u128::from)
        .ok_or_else(|| VaultError::Arithmetic(format!("{value} exceeds unit range")))
}
