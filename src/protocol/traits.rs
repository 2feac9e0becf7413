//! Capabilities the core consumes from external collaborators.
//!
//! Calls are synchronous and atomic from the core's point of view. Mutating
//! collaborators are [`Journaled`] so the enclosing operation can revert them
//! when a later step fails.

use super::journal::Journaled;
use super::types::{Address, FillReceipt, OTokenId, OptionProduct, SignedOrder};
use crate::error::VaultResult;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

/// Fungible deposit asset (transfer semantics only).
pub trait DepositAsset: Journaled {
    fn transfer(&self, from: &Address, to: &Address, amount: u128) -> VaultResult<()>;

    fn balance_of(&self, holder: &Address) -> u128;
}

/// Converts the deposit asset to and from the vault's internal yield unit.
///
/// The exchange rate is external and may move between calls.
pub trait CollateralWrapper: Journaled {
    /// Consume `amount` of the deposit asset held by `owner` and credit
    /// `owner` with the internal units produced.
    fn wrap(&self, owner: &Address, amount: u128) -> VaultResult<u128>;

    /// Redeem internal units held by `owner`, crediting `owner` with the
    /// deposit asset and returning the amount credited.
    fn unwrap(&self, owner: &Address, units: u128) -> VaultResult<u128>;

    /// Internal units held by `holder`.
    fn balance_of(&self, holder: &Address) -> u128;

    fn transfer(&self, from: &Address, to: &Address, units: u128) -> VaultResult<()>;
}

/// Spot and expiry-settlement price reads.
#[cfg_attr(test, mockall::automock)]
pub trait PriceOracle: Send + Sync {
    fn price(&self, asset: &Address) -> VaultResult<Decimal>;

    fn settlement_price(&self, asset: &Address, expiry: DateTime<Utc>) -> Option<Decimal>;

    fn is_settlement_finalized(&self, asset: &Address, expiry: DateTime<Utc>) -> bool;
}

/// Option minting and margin system.
pub trait OptionsController: Journaled {
    fn create_product(&self, product: OptionProduct) -> VaultResult<OTokenId>;

    fn product(&self, id: &OTokenId) -> Option<OptionProduct>;

    /// Lock `collateral` units from `owner` and mint `options` of `id` to it.
    fn mint(&self, owner: &Address, id: &OTokenId, collateral: u128, options: u128)
        -> VaultResult<()>;

    /// After settlement, release whatever collateral exercise did not consume.
    fn redeem_collateral(&self, owner: &Address, id: &OTokenId) -> VaultResult<u128>;
}

/// Product and collateral permissions of the options system.
#[cfg_attr(test, mockall::automock)]
pub trait Whitelist: Send + Sync {
    fn is_collateral_allowed(&self, asset: &Address) -> bool;

    fn is_product_allowed(
        &self,
        underlying: &Address,
        strike_asset: &Address,
        collateral_asset: &Address,
        is_put: bool,
    ) -> bool;
}

/// Settles signed counterparty orders.
pub trait OrderVenue: Journaled {
    /// Check the maker signature and order freshness without side effects.
    fn verify(&self, order: &SignedOrder) -> VaultResult<()>;

    /// Exchange options held by `taker` for the maker's premium. Either both
    /// legs settle or neither does.
    fn fill(&self, taker: &Address, order: &SignedOrder) -> VaultResult<FillReceipt>;
}

/// Monotonic time source read at call time.
#[cfg_attr(test, mockall::automock)]
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall-clock time.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}
