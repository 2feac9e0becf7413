//! Value types shared between the core and its collaborators.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Account or asset identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Address(String);

impl Address {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Address {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Identifier of an option product registered with the minting system.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OTokenId(String);

impl OTokenId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OTokenId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Full identity of an option product.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OptionProduct {
    pub underlying: Address,
    pub strike_asset: Address,
    pub collateral_asset: Address,
    /// Strike in strike-asset terms per unit of underlying
    pub strike_price: Decimal,
    pub expiry: DateTime<Utc>,
    pub is_put: bool,
}

impl OptionProduct {
    /// Conventional ticker, e.g. `oWBTCUSDC/sdCRV-20261026-50000C`.
    pub fn symbol(&self) -> String {
        format!(
            "o{}{}/{}-{}-{}{}",
            self.underlying,
            self.strike_asset,
            self.collateral_asset,
            self.expiry.format("%Y%m%d"),
            self.strike_price.normalize(),
            if self.is_put { "P" } else { "C" }
        )
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expiry
    }
}

/// Counterparty order to buy freshly minted options for a premium.
///
/// The maker signs the order off-chain; the taker is the action that mints
/// and delivers the options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedOrder {
    pub maker: Address,
    pub taker: Address,
    pub option: OTokenId,
    pub option_amount: u128,
    pub premium_asset: Address,
    pub premium_amount: u128,
    pub expiry: DateTime<Utc>,
    pub nonce: u64,
    pub signature: String,
}

impl SignedOrder {
    /// Canonical message covered by the maker signature.
    pub fn message(&self) -> String {
        format!(
            "{}|{}|{}|{}|{}|{}|{}|{}",
            self.maker,
            self.taker,
            self.option,
            self.option_amount,
            self.premium_asset,
            self.premium_amount,
            self.expiry.timestamp(),
            self.nonce
        )
    }
}

/// Outcome of an atomic order fill.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FillReceipt {
    pub options_delivered: u128,
    pub premium_received: u128,
}
