//! Structured vault events.
//!
//! Events are buffered while an operation runs and only emitted once it has
//! committed, so a reverted operation never shows up in the event stream.

use super::VaultState;
use crate::protocol::{Address, OTokenId};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type")]
pub enum VaultEvent {
    Deposit {
        depositor: Address,
        amount: u128,
        units: u128,
        shares: u128,
    },
    Withdraw {
        holder: Address,
        shares: u128,
        entitlement: u128,
        amount_out: u128,
        fee_amount: u128,
        fee_recipient: Address,
    },
    SharesTransferred {
        from: Address,
        to: Address,
        shares: u128,
    },
    Rollover {
        epoch: u64,
        allocations: Vec<(Address, u128)>,
    },
    PositionsClosed {
        epoch: u64,
        returned: u128,
        total_asset: u128,
    },
    OTokenCommitted {
        action: Address,
        otoken: OTokenId,
    },
    OTokenSold {
        action: Address,
        otoken: OTokenId,
        collateral: u128,
        options: u128,
        premium_units: u128,
    },
    ActionsUpdated {
        actions: Vec<Address>,
    },
    WithdrawReserveUpdated {
        bps: u32,
    },
    WithdrawFeeUpdated {
        bps: u32,
    },
    FeeRecipientUpdated {
        recipient: Address,
    },
    AdminTransferred {
        from: Address,
        to: Address,
    },
    Paused {
        from: VaultState,
    },
    Resumed {
        to: VaultState,
    },
}

/// An event stamped with the clock reading of its operation.
#[derive(Debug, Clone, Serialize)]
pub struct EventRecord {
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub event: VaultEvent,
}

impl EventRecord {
    /// Emit as a JSON log line for downstream consumers.
    pub fn emit(&self) {
        let json = serde_json::to_string(self).unwrap_or_default();
        info!(target: "vault_event", "VAULT_EVENT: {}", json);
    }
}
