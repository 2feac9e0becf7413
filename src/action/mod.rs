//! Yield strategies the vault allocates pooled collateral to.
//!
//! An action receives internal units from the vault at rollover, puts them to
//! work, and hands everything back when the vault closes the epoch.
//!
//! ```plain
//!   ┌──────┐ commit_otoken ┌───────────┐ mint_and_sell ┌───────────┐
//!   │ Idle ├──────────────►│ Committed ├──────────────►│ Activated │
//!   └──▲───┘               └─────┬─────┘               └─────┬─────┘
//!      │        close_position   │      close_position       │
//!      └─────────────────────────┴───────────────────────────┘
//! ```

pub mod short_otoken;

pub use short_otoken::{ShortOTokenAction, ShortOTokenCollaborators};

use crate::access::{Capability, CapabilityId};
use crate::error::VaultResult;
use crate::protocol::{Address, Journaled, OTokenId, OptionProduct, SignedOrder};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActionState {
    Idle,
    Committed,
    Activated,
}

impl fmt::Display for ActionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActionState::Idle => write!(f, "Idle"),
            ActionState::Committed => write!(f, "Committed"),
            ActionState::Activated => write!(f, "Activated"),
        }
    }
}

/// Result of a successful mint-and-sell.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SaleReceipt {
    pub otoken: OTokenId,
    pub collateral_locked: u128,
    pub options_sold: u128,
    /// Premium in the deposit asset, as paid by the counterparty
    pub premium_amount: u128,
    /// Premium after wrapping, owed to the vault
    pub premium_units: u128,
}

/// Point-in-time view of an action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionSnapshot {
    pub address: Address,
    pub state: ActionState,
    pub otoken: Option<OTokenId>,
    pub product: Option<OptionProduct>,
    pub commit_timestamp: Option<DateTime<Utc>>,
    pub custody: u128,
    pub locked_asset: u128,
}

/// A strategy slot the vault can fund and close.
///
/// Mutating entry points take the vault's capability and reject any other.
/// Units move through the wrapper: the vault sends custody to the action's
/// address before `receive_collateral`, and the action sends everything it
/// returns back to the vault.
pub trait Action: Journaled {
    fn address(&self) -> &Address;

    /// Vault this action reports to.
    fn vault(&self) -> &CapabilityId;

    fn state(&self) -> ActionState;

    /// Internal units attributable to the vault.
    fn current_value(&self) -> u128;

    /// Whether `close_position` would succeed now.
    fn can_close(&self) -> bool;

    /// Take `units` into custody at rollover.
    fn receive_collateral(&self, vault: &Capability, units: u128) -> VaultResult<()>;

    fn commit_otoken(&self, vault: &Capability, otoken: &OTokenId) -> VaultResult<()>;

    fn mint_and_sell_otoken(
        &self,
        vault: &Capability,
        collateral: u128,
        option_amount: u128,
        order: &SignedOrder,
    ) -> VaultResult<SaleReceipt>;

    /// Settle and return all units held for the vault.
    fn close_position(&self, vault: &Capability) -> VaultResult<u128>;

    fn snapshot(&self) -> ActionSnapshot;
}
