//! Pooled vault: share ledger, epoch orchestration and action routing.
//!
//! ```plain
//!              roll_over                  close_positions
//!   Unlocked ─────────────► Locked ─────────────────────► Unlocked
//!      │                      │
//!      └──── emergency_pause ─┴──► Emergency ── resume_from_pause ──► (previous)
//! ```
//!
//! Every entry point runs inside [`Vault::transact`]: the operation lock is
//! taken, all participants are checkpointed, and the asset conservation
//! check runs before anything is committed.
//!
//! Privileged entry points take the admin [`Capability`] returned by
//! [`Vault::new`]. Actions only accept calls made with the vault's own
//! capability, which never leaves the vault.

pub mod events;
pub mod ledger;

pub use events::{EventRecord, VaultEvent};
pub use ledger::{ShareBook, ShareLedger};

use crate::access::{Authority, Capability, CapabilityId, OperationLock};
use crate::action::{Action, ActionSnapshot, SaleReceipt};
use crate::config::VaultConfig;
use crate::error::{VaultError, VaultResult};
use crate::protocol::{
    Address, Clock, CollateralWrapper, DepositAsset, Journal, Journaled, OTokenId, SignedOrder,
};
use crate::utils::{apply_bps, mul_div, to_decimal, BPS_DENOMINATOR};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VaultState {
    Emergency,
    Locked,
    Unlocked,
}

impl fmt::Display for VaultState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VaultState::Emergency => write!(f, "Emergency"),
            VaultState::Locked => write!(f, "Locked"),
            VaultState::Unlocked => write!(f, "Unlocked"),
        }
    }
}

/// External systems the vault moves value through.
#[derive(Clone)]
pub struct VaultCollaborators {
    pub asset: Arc<dyn DepositAsset>,
    pub wrapper: Arc<dyn CollateralWrapper>,
    pub clock: Arc<dyn Clock>,
}

/// Breakdown of a prospective withdrawal, in internal units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WithdrawPreview {
    pub entitlement: u128,
    pub fee: u128,
    pub net: u128,
}

/// Serializable picture of the whole vault.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VaultSnapshot {
    pub address: Address,
    pub admin: Address,
    pub state: VaultState,
    pub paused_from: Option<VaultState>,
    pub epoch: u64,
    pub total_asset: u128,
    pub held_balance: u128,
    pub withdraw_reserve_bps: u32,
    pub withdraw_fee_bps: u32,
    pub fee_recipient: Address,
    pub shares: ShareBook,
    pub actions: Vec<ActionSnapshot>,
    pub taken_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct Accounts {
    state: VaultState,
    paused_from: Option<VaultState>,
    /// Units held plus units working in actions
    total_asset: u128,
    withdraw_reserve_bps: u32,
    withdraw_fee_bps: u32,
    fee_recipient: Address,
    epoch: u64,
}

pub struct Vault {
    address: Address,
    key: Capability,
    authority: Authority,
    accounts: Journal<Accounts>,
    shares: ShareLedger,
    actions: Journal<Vec<Arc<dyn Action>>>,
    deps: VaultCollaborators,
    allow_withdraw_in_emergency: bool,
    rounding_tolerance: u128,
    lock: OperationLock,
}

fn check_bps(bps: u32, name: &str) -> VaultResult<()> {
    if u128::from(bps) > BPS_DENOMINATOR {
        return Err(VaultError::Validation(format!(
            "{name} of {bps} bps exceeds {BPS_DENOMINATOR}"
        )));
    }
    Ok(())
}

impl Vault {
    /// Create a vault and the admin capability that controls it.
    pub fn new(
        address: Address,
        config: &VaultConfig,
        deps: VaultCollaborators,
    ) -> VaultResult<(Self, Capability)> {
        check_bps(config.withdraw_fee_bps, "withdraw fee")?;
        check_bps(config.withdraw_reserve_bps, "withdraw reserve")?;
        let (authority, admin) = Authority::new(Address::new(&config.admin));

        info!(
            vault = %address,
            admin = %config.admin,
            fee_bps = config.withdraw_fee_bps,
            reserve_bps = config.withdraw_reserve_bps,
            "Vault initialized"
        );

        let vault = Self {
            key: Capability::issue(address.clone()),
            address,
            authority,
            accounts: Journal::new(Accounts {
                state: VaultState::Unlocked,
                paused_from: None,
                total_asset: 0,
                withdraw_reserve_bps: config.withdraw_reserve_bps,
                withdraw_fee_bps: config.withdraw_fee_bps,
                fee_recipient: Address::new(&config.fee_recipient),
                epoch: 0,
            }),
            shares: ShareLedger::new(),
            actions: Journal::new(Vec::new()),
            deps,
            allow_withdraw_in_emergency: config.allow_withdraw_in_emergency,
            rounding_tolerance: u128::from(config.rounding_tolerance),
            lock: OperationLock::new("vault"),
        };
        Ok((vault, admin))
    }

    // =========================================================================
    // Operation plumbing
    // =========================================================================

    fn checkpoint_all(&self, actions: &[Arc<dyn Action>]) {
        self.authority.checkpoint();
        self.accounts.checkpoint();
        self.shares.checkpoint();
        self.actions.checkpoint();
        self.deps.asset.checkpoint();
        self.deps.wrapper.checkpoint();
        for action in actions {
            action.checkpoint();
        }
    }

    fn commit_all(&self, actions: &[Arc<dyn Action>]) {
        for action in actions.iter().rev() {
            action.commit();
        }
        self.deps.wrapper.commit();
        self.deps.asset.commit();
        self.actions.commit();
        self.shares.commit();
        self.accounts.commit();
        self.authority.commit();
    }

    fn rollback_all(&self, actions: &[Arc<dyn Action>]) {
        for action in actions.iter().rev() {
            action.rollback();
        }
        self.deps.wrapper.rollback();
        self.deps.asset.rollback();
        self.actions.rollback();
        self.shares.rollback();
        self.accounts.rollback();
        self.authority.rollback();
    }

    /// Run `f` as one all-or-nothing operation and publish its events once
    /// it has committed.
    fn transact<R>(
        &self,
        operation: &'static str,
        f: impl FnOnce(&mut Vec<VaultEvent>) -> VaultResult<R>,
    ) -> VaultResult<R> {
        let _guard = self.lock.acquire(operation)?;
        let participants = self.actions.get();
        self.checkpoint_all(&participants);

        let mut events = Vec::new();
        let result = f(&mut events).and_then(|value| {
            self.check_conservation()?;
            Ok(value)
        });

        match result {
            Ok(value) => {
                self.commit_all(&participants);
                let timestamp = self.deps.clock.now();
                for event in events {
                    EventRecord { timestamp, event }.emit();
                }
                Ok(value)
            }
            Err(e) => {
                self.rollback_all(&participants);
                warn!(vault = %self.address, operation, error = %e, "Vault operation reverted");
                Err(e)
            }
        }
    }

    /// `total_asset` must match the vault's wrapper balance plus what
    /// actions report.
    fn check_conservation(&self) -> VaultResult<()> {
        let total = self.total_asset();
        let held = self.held_balance();
        let in_actions: u128 = self.actions.read(|actions| {
            actions.iter().map(|a| a.current_value()).sum()
        });
        let tracked = held + in_actions;
        if total.abs_diff(tracked) > self.rounding_tolerance {
            return Err(VaultError::State(format!(
                "asset conservation violated: total {total}, held {held} + in actions {in_actions}"
            )));
        }
        Ok(())
    }

    fn ensure_not_paused(&self, operation: &str) -> VaultResult<VaultState> {
        let state = self.state();
        if state == VaultState::Emergency {
            return Err(VaultError::State(format!("{operation} rejected while paused")));
        }
        Ok(state)
    }

    fn ensure_state(&self, expected: VaultState, operation: &str) -> VaultResult<()> {
        let state = self.state();
        if state != expected {
            return Err(VaultError::State(format!(
                "{operation} requires {expected}, vault is {state}"
            )));
        }
        Ok(())
    }

    fn action_at(&self, index: usize) -> VaultResult<Arc<dyn Action>> {
        self.actions
            .read(|actions| actions.get(index).cloned())
            .ok_or_else(|| VaultError::Validation(format!("no action at index {index}")))
    }

    /// Unwrap `units` held by the vault and send the proceeds to `to`.
    fn pay_out(&self, to: &Address, units: u128) -> VaultResult<u128> {
        if units == 0 {
            return Ok(0);
        }
        let amount = self.deps.wrapper.unwrap(&self.address, units)?;
        self.deps.asset.transfer(&self.address, to, amount)?;
        Ok(amount)
    }

    // =========================================================================
    // Depositor operations
    // =========================================================================

    /// Deposit `amount` of the deposit asset and mint shares to `caller`.
    pub fn deposit_underlying(
        &self,
        caller: &Address,
        amount: u128,
        min_shares_out: u128,
    ) -> VaultResult<u128> {
        self.transact("deposit_underlying", |events| {
            self.ensure_not_paused("deposit")?;
            if amount == 0 {
                return Err(VaultError::Validation("deposit amount must be positive".into()));
            }
            let total_before = self.total_asset();
            let held_before = self.held_balance();

            self.deps.asset.transfer(caller, &self.address, amount)?;
            self.deps.wrapper.wrap(&self.address, amount)?;
            let units = self.held_balance().saturating_sub(held_before);

            let shares = self.shares_for(units, total_before)?;
            if shares == 0 {
                return Err(VaultError::Validation(format!(
                    "deposit of {amount} mints no shares"
                )));
            }
            if shares < min_shares_out {
                return Err(VaultError::Slippage {
                    minimum: min_shares_out,
                    actual: shares,
                });
            }

            self.shares.mint(caller, shares)?;
            self.accounts.write(|a| a.total_asset += units);

            info!(vault = %self.address, depositor = %caller, amount, units, shares, "Deposit");
            events.push(VaultEvent::Deposit {
                depositor: caller.clone(),
                amount,
                units,
                shares,
            });
            Ok(shares)
        })
    }

    /// Burn `shares` and pay out their value net of the withdrawal fee.
    /// Returns the deposit asset amount sent to `caller`.
    pub fn withdraw_underlying(
        &self,
        caller: &Address,
        shares: u128,
        min_amount_out: u128,
    ) -> VaultResult<u128> {
        self.transact("withdraw_underlying", |events| {
            if self.state() == VaultState::Emergency && !self.allow_withdraw_in_emergency {
                return Err(VaultError::State("withdraw rejected while paused".into()));
            }
            if shares == 0 {
                return Err(VaultError::Validation("share amount must be positive".into()));
            }
            let balance = self.shares.balance_of(caller);
            if balance < shares {
                return Err(VaultError::Validation(format!(
                    "{caller} holds {balance} shares, requested {shares}"
                )));
            }

            let preview = self.preview_withdraw(shares)?;
            if preview.entitlement == 0 {
                return Err(VaultError::Validation(format!(
                    "{shares} shares are worth nothing"
                )));
            }
            let held = self.held_balance();
            if preview.entitlement > held {
                return Err(VaultError::State(format!(
                    "liquid balance {held} cannot cover {}",
                    preview.entitlement
                )));
            }

            self.shares.burn(caller, shares)?;
            self.accounts.write(|a| a.total_asset -= preview.entitlement);

            let amount_out = self.pay_out(caller, preview.net)?;
            let fee_recipient = self.fee_recipient();
            let fee_amount = self.pay_out(&fee_recipient, preview.fee)?;

            if amount_out < min_amount_out {
                return Err(VaultError::Slippage {
                    minimum: min_amount_out,
                    actual: amount_out,
                });
            }

            info!(
                vault = %self.address,
                holder = %caller,
                shares,
                entitlement = preview.entitlement,
                amount_out,
                fee_amount,
                "Withdraw"
            );
            events.push(VaultEvent::Withdraw {
                holder: caller.clone(),
                shares,
                entitlement: preview.entitlement,
                amount_out,
                fee_amount,
                fee_recipient,
            });
            Ok(amount_out)
        })
    }

    /// Move shares to another holder.
    pub fn transfer_shares(&self, caller: &Address, to: &Address, shares: u128) -> VaultResult<()> {
        self.transact("transfer_shares", |events| {
            if shares == 0 {
                return Err(VaultError::Validation("share amount must be positive".into()));
            }
            self.shares.transfer(caller, to, shares)?;
            debug!(vault = %self.address, from = %caller, to = %to, shares, "Shares transferred");
            events.push(VaultEvent::SharesTransferred {
                from: caller.clone(),
                to: to.clone(),
                shares,
            });
            Ok(())
        })
    }

    // =========================================================================
    // Epoch orchestration
    // =========================================================================

    /// Fund every action with its share of total assets and lock the vault.
    pub fn roll_over(&self, admin: &Capability, allocation_bps: &[u32]) -> VaultResult<()> {
        self.transact("roll_over", |events| {
            self.authority.ensure(admin, "roll_over")?;
            self.ensure_state(VaultState::Unlocked, "roll_over")?;

            let actions = self.actions.get();
            if actions.is_empty() {
                return Err(VaultError::State("no actions configured".into()));
            }
            if allocation_bps.len() != actions.len() {
                return Err(VaultError::Validation(format!(
                    "{} allocations for {} actions",
                    allocation_bps.len(),
                    actions.len()
                )));
            }
            let accounts = self.accounts.get();
            let requested: u128 = allocation_bps.iter().map(|bps| u128::from(*bps)).sum();
            if requested + u128::from(accounts.withdraw_reserve_bps) > BPS_DENOMINATOR {
                return Err(VaultError::Validation(format!(
                    "allocations of {requested} bps plus reserve of {} bps exceed {BPS_DENOMINATOR}",
                    accounts.withdraw_reserve_bps
                )));
            }

            let mut allocations = Vec::with_capacity(actions.len());
            for (action, bps) in actions.iter().zip(allocation_bps) {
                let units = apply_bps(accounts.total_asset, *bps)?;
                if units > 0 {
                    self.deps
                        .wrapper
                        .transfer(&self.address, action.address(), units)?;
                    action.receive_collateral(&self.key, units)?;
                }
                allocations.push((action.address().clone(), units));
            }

            let epoch = self.accounts.write(|a| {
                a.state = VaultState::Locked;
                a.epoch += 1;
                a.epoch
            });

            info!(
                vault = %self.address,
                epoch,
                total_asset = accounts.total_asset,
                held = self.held_balance(),
                "Rolled over"
            );
            events.push(VaultEvent::Rollover { epoch, allocations });
            Ok(())
        })
    }

    /// Settle every action, take back what they return and unlock the vault.
    /// Anyone may call this once every action is closable.
    pub fn close_positions(&self, caller: &Address) -> VaultResult<u128> {
        self.transact("close_positions", |events| {
            self.ensure_state(VaultState::Locked, "close_positions")?;

            let actions = self.actions.get();
            let pending: Vec<String> = actions
                .iter()
                .filter(|a| !a.can_close())
                .map(|a| a.address().to_string())
                .collect();
            if !pending.is_empty() {
                return Err(VaultError::State(format!(
                    "actions not ready to close: {}",
                    pending.join(", ")
                )));
            }

            let mut value_before: u128 = 0;
            let mut returned: u128 = 0;
            for action in &actions {
                value_before += action.current_value();
                returned += action.close_position(&self.key)?;
            }

            let (epoch, total_asset) = self.accounts.write(|a| {
                let total = a
                    .total_asset
                    .checked_sub(value_before)
                    .and_then(|t| t.checked_add(returned))
                    .ok_or_else(|| {
                        VaultError::Arithmetic(format!(
                            "cannot reconcile total {} with {value_before} out, {returned} back",
                            a.total_asset
                        ))
                    })?;
                a.total_asset = total;
                a.state = VaultState::Unlocked;
                Ok::<_, VaultError>((a.epoch, total))
            })?;

            info!(
                vault = %self.address,
                %caller,
                epoch,
                value_before,
                returned,
                total_asset,
                "Positions closed"
            );
            events.push(VaultEvent::PositionsClosed {
                epoch,
                returned,
                total_asset,
            });
            Ok(returned)
        })
    }

    // =========================================================================
    // Routed action administration
    // =========================================================================

    pub fn commit_otoken(
        &self,
        admin: &Capability,
        action_index: usize,
        otoken: &OTokenId,
    ) -> VaultResult<()> {
        self.transact("commit_otoken", |events| {
            self.authority.ensure(admin, "commit_otoken")?;
            self.ensure_not_paused("commit_otoken")?;
            let action = self.action_at(action_index)?;
            action.commit_otoken(&self.key, otoken)?;
            events.push(VaultEvent::OTokenCommitted {
                action: action.address().clone(),
                otoken: otoken.clone(),
            });
            Ok(())
        })
    }

    /// Mint and sell through an action; the action forwards the wrapped
    /// premium to the vault's liquid balance.
    pub fn mint_and_sell_otoken(
        &self,
        admin: &Capability,
        action_index: usize,
        collateral: u128,
        option_amount: u128,
        order: &SignedOrder,
    ) -> VaultResult<SaleReceipt> {
        self.transact("mint_and_sell_otoken", |events| {
            self.authority.ensure(admin, "mint_and_sell_otoken")?;
            self.ensure_state(VaultState::Locked, "mint_and_sell_otoken")?;
            let action = self.action_at(action_index)?;

            let receipt =
                action.mint_and_sell_otoken(&self.key, collateral, option_amount, order)?;
            self.accounts.write(|a| a.total_asset += receipt.premium_units);

            info!(
                vault = %self.address,
                action = %action.address(),
                premium_units = receipt.premium_units,
                total_asset = self.total_asset(),
                "Premium credited"
            );
            events.push(VaultEvent::OTokenSold {
                action: action.address().clone(),
                otoken: receipt.otoken.clone(),
                collateral: receipt.collateral_locked,
                options: receipt.options_sold,
                premium_units: receipt.premium_units,
            });
            Ok(receipt)
        })
    }

    // =========================================================================
    // Admin configuration
    // =========================================================================

    /// Replace the action list. Only while unlocked and with every current
    /// action empty.
    pub fn set_actions(
        &self,
        admin: &Capability,
        actions: Vec<Arc<dyn Action>>,
    ) -> VaultResult<()> {
        self.transact("set_actions", |events| {
            self.authority.ensure(admin, "set_actions")?;
            self.ensure_state(VaultState::Unlocked, "set_actions")?;
            if actions.is_empty() {
                return Err(VaultError::Validation("action list is empty".into()));
            }

            let mut seen = HashSet::new();
            for action in &actions {
                if !action.vault().matches(&self.key) {
                    return Err(VaultError::Validation(format!(
                        "action {} reports to {}",
                        action.address(),
                        action.vault()
                    )));
                }
                if !seen.insert(action.address().clone()) {
                    return Err(VaultError::Validation(format!(
                        "action {} listed twice",
                        action.address()
                    )));
                }
            }
            let busy = self
                .actions
                .read(|current| current.iter().any(|a| a.current_value() > 0));
            if busy {
                return Err(VaultError::State("current actions still hold assets".into()));
            }

            let addresses: Vec<Address> = actions.iter().map(|a| a.address().clone()).collect();
            self.actions.write(|current| *current = actions);
            info!(vault = %self.address, count = addresses.len(), "Actions updated");
            events.push(VaultEvent::ActionsUpdated { actions: addresses });
            Ok(())
        })
    }

    pub fn set_withdraw_reserve(&self, admin: &Capability, bps: u32) -> VaultResult<()> {
        self.transact("set_withdraw_reserve", |events| {
            self.authority.ensure(admin, "set_withdraw_reserve")?;
            check_bps(bps, "withdraw reserve")?;
            self.accounts.write(|a| a.withdraw_reserve_bps = bps);
            info!(vault = %self.address, bps, "Withdraw reserve updated");
            events.push(VaultEvent::WithdrawReserveUpdated { bps });
            Ok(())
        })
    }

    pub fn set_withdraw_fee(&self, admin: &Capability, bps: u32) -> VaultResult<()> {
        self.transact("set_withdraw_fee", |events| {
            self.authority.ensure(admin, "set_withdraw_fee")?;
            check_bps(bps, "withdraw fee")?;
            self.accounts.write(|a| a.withdraw_fee_bps = bps);
            info!(vault = %self.address, bps, "Withdraw fee updated");
            events.push(VaultEvent::WithdrawFeeUpdated { bps });
            Ok(())
        })
    }

    pub fn set_fee_recipient(&self, admin: &Capability, recipient: Address) -> VaultResult<()> {
        self.transact("set_fee_recipient", |events| {
            self.authority.ensure(admin, "set_fee_recipient")?;
            self.accounts.write(|a| a.fee_recipient = recipient.clone());
            info!(vault = %self.address, %recipient, "Fee recipient updated");
            events.push(VaultEvent::FeeRecipientUpdated { recipient });
            Ok(())
        })
    }

    /// Hand administration to `new_admin`. `admin` stops working once this
    /// commits; the returned capability replaces it.
    pub fn transfer_admin(&self, admin: &Capability, new_admin: Address) -> VaultResult<Capability> {
        self.transact("transfer_admin", |events| {
            let next = self.authority.transfer(admin, new_admin.clone())?;
            events.push(VaultEvent::AdminTransferred {
                from: admin.holder().clone(),
                to: new_admin,
            });
            Ok(next)
        })
    }

    pub fn emergency_pause(&self, admin: &Capability) -> VaultResult<()> {
        self.transact("emergency_pause", |events| {
            self.authority.ensure(admin, "emergency_pause")?;
            let from = self.ensure_not_paused("emergency_pause")?;
            self.accounts.write(|a| {
                a.paused_from = Some(from);
                a.state = VaultState::Emergency;
            });
            warn!(vault = %self.address, %from, "Vault paused");
            events.push(VaultEvent::Paused { from });
            Ok(())
        })
    }

    pub fn resume_from_pause(&self, admin: &Capability) -> VaultResult<()> {
        self.transact("resume_from_pause", |events| {
            self.authority.ensure(admin, "resume_from_pause")?;
            self.ensure_state(VaultState::Emergency, "resume_from_pause")?;
            let to = self.accounts.write(|a| {
                let to = a.paused_from.take().unwrap_or(VaultState::Unlocked);
                a.state = to;
                to
            });
            info!(vault = %self.address, %to, "Vault resumed");
            events.push(VaultEvent::Resumed { to });
            Ok(())
        })
    }

    // =========================================================================
    // Views
    // =========================================================================

    pub fn address(&self) -> &Address {
        &self.address
    }

    pub fn admin(&self) -> Address {
        self.authority.admin()
    }

    /// Identity actions check vault calls against.
    pub fn capability_id(&self) -> CapabilityId {
        self.key.id()
    }

    pub fn state(&self) -> VaultState {
        self.accounts.read(|a| a.state)
    }

    pub fn epoch(&self) -> u64 {
        self.accounts.read(|a| a.epoch)
    }

    pub fn total_asset(&self) -> u128 {
        self.accounts.read(|a| a.total_asset)
    }

    /// Units in vault custody, as recorded by the wrapper.
    pub fn held_balance(&self) -> u128 {
        self.deps.wrapper.balance_of(&self.address)
    }

    pub fn withdraw_reserve_bps(&self) -> u32 {
        self.accounts.read(|a| a.withdraw_reserve_bps)
    }

    pub fn withdraw_fee_bps(&self) -> u32 {
        self.accounts.read(|a| a.withdraw_fee_bps)
    }

    pub fn fee_recipient(&self) -> Address {
        self.accounts.read(|a| a.fee_recipient.clone())
    }

    pub fn balance_of(&self, holder: &Address) -> u128 {
        self.shares.balance_of(holder)
    }

    pub fn total_supply(&self) -> u128 {
        self.shares.total_supply()
    }

    pub fn actions(&self) -> Vec<Address> {
        self.actions
            .read(|actions| actions.iter().map(|a| a.address().clone()).collect())
    }

    fn shares_for(&self, units: u128, total_before: u128) -> VaultResult<u128> {
        let supply = self.total_supply();
        if supply == 0 {
            return Ok(units);
        }
        if total_before == 0 {
            return Err(VaultError::State(
                "shares outstanding against zero assets".into(),
            ));
        }
        mul_div(units, supply, total_before)
    }

    /// Shares minted for `units` of freshly wrapped collateral right now.
    pub fn preview_deposit(&self, units: u128) -> VaultResult<u128> {
        self.shares_for(units, self.total_asset())
    }

    pub fn preview_withdraw(&self, shares: u128) -> VaultResult<WithdrawPreview> {
        let supply = self.total_supply();
        if shares > supply {
            return Err(VaultError::Validation(format!(
                "{shares} shares exceed supply {supply}"
            )));
        }
        if supply == 0 {
            return Ok(WithdrawPreview {
                entitlement: 0,
                fee: 0,
                net: 0,
            });
        }
        let entitlement = mul_div(shares, self.total_asset(), supply)?;
        let fee = apply_bps(entitlement, self.withdraw_fee_bps())?;
        Ok(WithdrawPreview {
            entitlement,
            fee,
            net: entitlement - fee,
        })
    }

    /// Internal units backing one share; one before the first deposit.
    pub fn share_price(&self) -> VaultResult<Decimal> {
        let supply = self.total_supply();
        if supply == 0 {
            return Ok(Decimal::ONE);
        }
        Ok(to_decimal(self.total_asset())? / to_decimal(supply)?)
    }

    pub fn snapshot(&self) -> VaultSnapshot {
        let accounts = self.accounts.get();
        VaultSnapshot {
            address: self.address.clone(),
            admin: self.admin(),
            state: accounts.state,
            paused_from: accounts.paused_from,
            epoch: accounts.epoch,
            total_asset: accounts.total_asset,
            held_balance: self.held_balance(),
            withdraw_reserve_bps: accounts.withdraw_reserve_bps,
            withdraw_fee_bps: accounts.withdraw_fee_bps,
            fee_recipient: accounts.fee_recipient,
            shares: self.shares.book(),
            actions: self
                .actions
                .read(|actions| actions.iter().map(|a| a.snapshot()).collect()),
            taken_at: self.deps.clock.now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::{ActionState, ShortOTokenAction, ShortOTokenCollaborators};
    use crate::action::short_otoken::ShortOTokenSettings;
    use crate::error::ErrorKind;
    use crate::protocol::mock::{
        FixedRateWrapper, InMemoryAsset, InMemoryController, ManualClock, ManualOracle,
        SimulatedVenue, StaticWhitelist,
    };
    use crate::protocol::signing::sign_order;
    use crate::protocol::{OptionProduct, OptionsController};
    use chrono::{Duration, TimeZone};
    use rust_decimal_macros::dec;
    use std::sync::Weak;

    // =========================================================================
    // Helper functions
    // =========================================================================

    const MAKER_SECRET: &str = "counterparty-secret";

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 16, 8, 0, 0).unwrap()
    }

    fn expiry() -> DateTime<Utc> {
        start() + Duration::days(7)
    }

    fn admin() -> Address {
        Address::new("admin")
    }

    fn treasury() -> Address {
        Address::new("treasury")
    }

    struct Fixture {
        admin: Capability,
        clock: Arc<ManualClock>,
        oracle: Arc<ManualOracle>,
        asset: Arc<InMemoryAsset>,
        wrapper: Arc<FixedRateWrapper>,
        controller: Arc<InMemoryController>,
        venue: Arc<SimulatedVenue>,
        vault: Arc<Vault>,
        action: Arc<ShortOTokenAction>,
        otoken: OTokenId,
        nonce: std::cell::Cell<u64>,
    }

    fn fixture() -> Fixture {
        fixture_with(VaultConfig::default())
    }

    fn fixture_with(config: VaultConfig) -> Fixture {
        let clock = Arc::new(ManualClock::new(start()));
        let oracle = Arc::new(ManualOracle::new());
        let asset = Arc::new(InMemoryAsset::new("WBTC"));
        let wrapper = Arc::new(FixedRateWrapper::new("sdWBTC", asset.clone()));
        let controller = Arc::new(InMemoryController::new(
            "controller",
            wrapper.clone(),
            oracle.clone(),
            clock.clone(),
        ));
        let venue = Arc::new(SimulatedVenue::new(
            asset.clone(),
            controller.clone(),
            clock.clone(),
        ));
        let whitelist = Arc::new(StaticWhitelist::new());
        whitelist.whitelist_collateral(&"sdWBTC".into());
        whitelist.whitelist_product(&"WBTC".into(), &"USDC".into(), &"sdWBTC".into(), false);

        let otoken = controller
            .create_product(OptionProduct {
                underlying: "WBTC".into(),
                strike_asset: "USDC".into(),
                collateral_asset: "sdWBTC".into(),
                strike_price: dec!(50000),
                expiry: expiry(),
                is_put: false,
            })
            .unwrap();

        let (vault, admin) = Vault::new(
            "vault".into(),
            &config,
            VaultCollaborators {
                asset: asset.clone(),
                wrapper: wrapper.clone(),
                clock: clock.clone(),
            },
        )
        .unwrap();
        let vault = Arc::new(vault);
        let action = Arc::new(ShortOTokenAction::new(
            "action-1".into(),
            vault.capability_id(),
            ShortOTokenSettings {
                deposit_asset: "WBTC".into(),
                collateral_asset: "sdWBTC".into(),
                min_commit_period: Duration::hours(18),
            },
            ShortOTokenCollaborators {
                controller: controller.clone(),
                venue: venue.clone(),
                wrapper: wrapper.clone(),
                oracle: oracle.clone(),
                whitelist,
                clock: clock.clone(),
            },
        ));
        vault
            .set_actions(&admin, vec![action.clone() as Arc<dyn Action>])
            .unwrap();

        let maker = Address::new("counterparty");
        venue.register_maker(&maker, MAKER_SECRET);
        asset.mint(&maker, 1_000_000_000);

        Fixture {
            admin,
            clock,
            oracle,
            asset,
            wrapper,
            controller,
            venue,
            vault,
            action,
            otoken,
            nonce: std::cell::Cell::new(0),
        }
    }

    fn deposit(f: &Fixture, who: &str, amount: u128) -> u128 {
        let who = Address::new(who);
        f.asset.mint(&who, amount);
        f.vault.deposit_underlying(&who, amount, 0).unwrap()
    }

    fn order(f: &Fixture, options: u128, premium: u128) -> SignedOrder {
        f.nonce.set(f.nonce.get() + 1);
        sign_order(
            SignedOrder {
                maker: "counterparty".into(),
                taker: "action-1".into(),
                option: f.otoken.clone(),
                option_amount: options,
                premium_asset: "WBTC".into(),
                premium_amount: premium,
                expiry: f.clock.now() + Duration::hours(1),
                nonce: f.nonce.get(),
                signature: String::new(),
            },
            MAKER_SECRET,
        )
    }

    /// Commit, wait out the commit period and roll `bps` into the action.
    fn start_epoch(f: &Fixture, bps: u32) {
        f.vault.commit_otoken(&f.admin, 0, &f.otoken).unwrap();
        f.clock.advance(Duration::hours(18));
        f.vault.roll_over(&f.admin, &[bps]).unwrap();
    }

    /// Sell options against the whole custody of the action.
    fn sell(f: &Fixture, premium: u128) -> SaleReceipt {
        let collateral = f.action.custody();
        let order = order(f, collateral, premium);
        f.vault
            .mint_and_sell_otoken(&f.admin, 0, collateral, collateral, &order)
            .unwrap()
    }

    fn expire(f: &Fixture, settlement: Decimal) {
        f.clock.set(expiry() + Duration::hours(1));
        f.oracle.settle(&"WBTC".into(), expiry(), settlement);
    }

    fn assert_conserved(f: &Fixture) {
        assert_eq!(
            f.vault.total_asset(),
            f.wrapper.balance_of(&"vault".into()) + f.action.current_value()
        );
        assert_eq!(f.wrapper.balance_of(&"action-1".into()), f.action.custody());
        let book = f.vault.snapshot().shares;
        assert_eq!(book.balances.values().sum::<u128>(), book.total_supply);
    }

    // =========================================================================
    // End-to-end epoch
    // =========================================================================

    #[test]
    fn test_three_depositor_epoch() {
        let f = fixture();
        let p1 = Address::new("p1");
        let p2 = Address::new("p2");
        let p3 = Address::new("p3");

        f.vault.set_withdraw_reserve(&f.admin, 1_000).unwrap();
        assert_eq!(deposit(&f, "p1", 1_000_000_000), 1_000_000_000);
        assert_eq!(deposit(&f, "p2", 7_000_000_000), 7_000_000_000);
        assert_eq!(f.vault.total_asset(), 8_000_000_000);

        start_epoch(&f, 9_000);
        assert_eq!(f.vault.state(), VaultState::Locked);
        assert_eq!(f.vault.epoch(), 1);
        assert_eq!(f.action.custody(), 7_200_000_000);
        assert_eq!(f.vault.held_balance(), 800_000_000);

        let receipt = sell(&f, 200_000_000);
        assert_eq!(receipt.premium_units, 200_000_000);
        assert_eq!(f.action.state(), ActionState::Activated);
        assert_eq!(f.action.locked_asset(), 7_200_000_000);
        assert_eq!(f.vault.held_balance(), 1_000_000_000);
        assert_eq!(f.vault.total_asset(), 8_200_000_000);
        assert_eq!(f.controller.option_balance(&"counterparty".into(), &f.otoken), 7_200_000_000);
        assert_conserved(&f);

        // Deposits stay open while locked
        assert_eq!(deposit(&f, "p3", 2_000_000_000), 1_951_219_512);
        assert_eq!(f.vault.total_supply(), 9_951_219_512);
        assert_eq!(f.vault.total_asset(), 10_200_000_000);
        assert_eq!(f.vault.held_balance(), 3_000_000_000);

        // p1 exits from the liquid reserve
        let out = f.vault.withdraw_underlying(&p1, 1_000_000_000, 0).unwrap();
        assert_eq!(out, 1_019_875_000);
        assert_eq!(f.asset.balance_of(&p1), 1_019_875_000);
        assert_eq!(f.asset.balance_of(&treasury()), 5_125_000);
        assert_eq!(f.vault.total_asset(), 9_175_000_000);
        assert_eq!(f.vault.held_balance(), 1_975_000_000);
        assert_conserved(&f);

        expire(&f, dec!(40000));
        let returned = f.vault.close_positions(&p2).unwrap();
        assert_eq!(returned, 7_200_000_000);
        assert_eq!(f.vault.state(), VaultState::Unlocked);
        assert_eq!(f.vault.held_balance(), 9_175_000_000);
        assert_eq!(f.vault.total_asset(), 9_175_000_000);
        assert_eq!(f.action.current_value(), 0);

        let out = f.vault.withdraw_underlying(&p2, 7_000_000_000, 0).unwrap();
        assert_eq!(out, 7_139_125_000); // 7_175_000_000 less 0.5%

        let p3_shares = f.vault.balance_of(&p3);
        let out = f.vault.withdraw_underlying(&p3, p3_shares, 0).unwrap();
        assert_eq!(out, 1_990_000_000);

        assert_eq!(f.vault.total_asset(), 0);
        assert_eq!(f.vault.held_balance(), 0);
        assert_eq!(f.vault.total_supply(), 0);
        assert_eq!(f.wrapper.supply(), 0);
        assert_eq!(f.asset.balance_of(&treasury()), 51_000_000);
        assert_eq!(f.asset.balance_of(f.vault.address()), 0);
    }

    #[test]
    fn test_exercised_epoch_reconciles_loss() {
        let f = fixture();
        deposit(&f, "p1", 1_000_000);
        start_epoch(&f, 10_000);
        sell(&f, 20_000);

        // 1_000_000 * (62_500 - 50_000) / 62_500 = 200_000 exercised
        expire(&f, dec!(62500));
        assert_eq!(f.vault.close_positions(&"keeper".into()).unwrap(), 800_000);
        assert_eq!(f.vault.total_asset(), 820_000);
        assert_eq!(f.vault.held_balance(), 820_000);
        assert_conserved(&f);
    }

    // =========================================================================
    // Deposit and withdraw
    // =========================================================================

    #[test]
    fn test_deposit_rejects_zero_and_enforces_slippage() {
        let f = fixture();
        let p1 = Address::new("p1");
        f.asset.mint(&p1, 1_000);

        assert_eq!(
            f.vault.deposit_underlying(&p1, 0, 0).unwrap_err().kind(),
            ErrorKind::Validation
        );
        let err = f.vault.deposit_underlying(&p1, 1_000, 1_001).unwrap_err();
        assert_eq!(err, VaultError::Slippage { minimum: 1_001, actual: 1_000 });

        // Nothing moved
        assert_eq!(f.asset.balance_of(&p1), 1_000);
        assert_eq!(f.vault.total_supply(), 0);
        assert_eq!(f.wrapper.supply(), 0);
    }

    #[test]
    fn test_withdraw_slippage_reverts_burn() {
        let f = fixture();
        let p1 = Address::new("p1");
        deposit(&f, "p1", 10_000);

        let err = f.vault.withdraw_underlying(&p1, 10_000, 10_000).unwrap_err();
        assert_eq!(err, VaultError::Slippage { minimum: 10_000, actual: 9_950 });
        assert_eq!(f.vault.balance_of(&p1), 10_000);
        assert_eq!(f.vault.total_asset(), 10_000);
        assert_eq!(f.asset.balance_of(&treasury()), 0);
    }

    #[test]
    fn test_withdraw_more_than_balance_fails() {
        let f = fixture();
        deposit(&f, "p1", 10_000);
        assert!(matches!(
            f.vault.withdraw_underlying(&"p1".into(), 10_001, 0),
            Err(VaultError::Validation(_))
        ));
        assert!(matches!(
            f.vault.withdraw_underlying(&"p1".into(), 0, 0),
            Err(VaultError::Validation(_))
        ));
    }

    #[test]
    fn test_withdraw_beyond_liquid_balance_fails() {
        let f = fixture();
        deposit(&f, "p1", 10_000);
        start_epoch(&f, 9_000);

        let err = f
            .vault
            .withdraw_underlying(&"p1".into(), 10_000, 0)
            .unwrap_err();
        assert!(matches!(err, VaultError::State(_)));
        assert_eq!(f.vault.balance_of(&"p1".into()), 10_000);

        // The reserve itself can still be withdrawn
        assert_eq!(f.vault.withdraw_underlying(&"p1".into(), 1_000, 0).unwrap(), 995);
    }

    #[test]
    fn test_fee_paid_at_unwrap_rate() {
        let f = fixture();
        let p1 = Address::new("p1");
        deposit(&f, "p1", 1_000_000_000);
        f.wrapper.set_rates(Decimal::ONE, dec!(0.95));

        let out = f.vault.withdraw_underlying(&p1, 1_000_000_000, 0).unwrap();

        // 995_000_000 units and 5_000_000 fee units, each unwrapped at 0.95
        assert_eq!(out, 945_250_000);
        assert_eq!(f.asset.balance_of(&treasury()), 4_750_000);
        assert_eq!(f.asset.balance_of(f.vault.address()), 0);
        assert_eq!(f.vault.total_asset(), 0);
    }

    #[test]
    fn test_zero_fee_skips_recipient() {
        let f = fixture();
        f.vault.set_withdraw_fee(&f.admin, 0).unwrap();
        deposit(&f, "p1", 5_000);
        assert_eq!(f.vault.withdraw_underlying(&"p1".into(), 5_000, 5_000).unwrap(), 5_000);
        assert_eq!(f.asset.balance_of(&treasury()), 0);
    }

    #[test]
    fn test_transfer_shares() {
        let f = fixture();
        deposit(&f, "p1", 10_000);
        f.vault
            .transfer_shares(&"p1".into(), &"p2".into(), 4_000)
            .unwrap();

        assert_eq!(f.vault.balance_of(&"p1".into()), 6_000);
        assert_eq!(f.vault.balance_of(&"p2".into()), 4_000);
        assert_eq!(f.vault.total_supply(), 10_000);
        assert!(f
            .vault
            .transfer_shares(&"p1".into(), &"p2".into(), 6_001)
            .is_err());
        assert_eq!(f.vault.withdraw_underlying(&"p2".into(), 4_000, 0).unwrap(), 3_980);
    }

    // =========================================================================
    // Epoch orchestration
    // =========================================================================

    #[test]
    fn test_roll_over_validates_allocations() {
        let f = fixture();
        deposit(&f, "p1", 10_000);
        f.vault.set_withdraw_reserve(&f.admin, 1_000).unwrap();

        assert!(matches!(
            f.vault.roll_over(&f.admin, &[5_000, 4_000]),
            Err(VaultError::Validation(_))
        ));
        assert!(matches!(
            f.vault.roll_over(&f.admin, &[9_001]),
            Err(VaultError::Validation(_))
        ));
        assert_eq!(f.vault.state(), VaultState::Unlocked);
        assert_eq!(f.vault.epoch(), 0);

        f.vault.roll_over(&f.admin, &[9_000]).unwrap();
        assert!(matches!(
            f.vault.roll_over(&f.admin, &[9_000]),
            Err(VaultError::State(_))
        ));
    }

    #[test]
    fn test_close_requires_locked_and_expired_positions() {
        let f = fixture();
        deposit(&f, "p1", 10_000);
        assert!(matches!(
            f.vault.close_positions(&"keeper".into()),
            Err(VaultError::State(_))
        ));

        start_epoch(&f, 9_000);
        sell(&f, 100);
        assert!(matches!(
            f.vault.close_positions(&"keeper".into()),
            Err(VaultError::State(_))
        ));

        // Expired but settlement still disputable
        f.clock.set(expiry());
        f.oracle
            .set_expiry_settlement_price(&"WBTC".into(), expiry(), dec!(40000));
        assert!(f.vault.close_positions(&"keeper".into()).is_err());
        assert_eq!(f.vault.state(), VaultState::Locked);
        assert_eq!(f.action.state(), ActionState::Activated);

        f.oracle.finalize(&"WBTC".into(), expiry());
        assert_eq!(f.vault.close_positions(&"keeper".into()).unwrap(), 9_000);
    }

    #[test]
    fn test_close_without_sale_returns_custody() {
        let f = fixture();
        deposit(&f, "p1", 10_000);
        start_epoch(&f, 9_000);

        assert_eq!(f.vault.close_positions(&"keeper".into()).unwrap(), 9_000);
        assert_eq!(f.vault.held_balance(), 10_000);
        assert_eq!(f.action.state(), ActionState::Idle);
    }

    #[test]
    fn test_second_epoch_after_close() {
        let f = fixture();
        deposit(&f, "p1", 10_000);
        start_epoch(&f, 10_000);
        assert_eq!(f.vault.close_positions(&"keeper".into()).unwrap(), 10_000);

        start_epoch(&f, 5_000);
        assert_eq!(f.vault.epoch(), 2);
        assert_eq!(f.action.custody(), 5_000);
    }

    #[test]
    fn test_failed_fill_reverts_vault_and_action() {
        let f = fixture();
        deposit(&f, "p1", 10_000);
        start_epoch(&f, 9_000);
        f.venue.fail_next_fill("counterparty cancelled");

        let order = order(&f, 9_000, 100);
        let err = f
            .vault
            .mint_and_sell_otoken(&f.admin, 0, 9_000, 9_000, &order)
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::ExternalFailure);
        assert_eq!(f.vault.total_asset(), 10_000);
        assert_eq!(f.vault.held_balance(), 1_000);
        assert_eq!(f.action.state(), ActionState::Committed);
        assert_eq!(f.action.custody(), 9_000);
        assert!(f.controller.position(&"action-1".into(), &f.otoken).is_none());
        assert_eq!(f.asset.balance_of(&"counterparty".into()), 1_000_000_000);
    }

    #[test]
    fn test_mint_and_sell_requires_locked() {
        let f = fixture();
        deposit(&f, "p1", 10_000);
        f.vault.commit_otoken(&f.admin, 0, &f.otoken).unwrap();
        f.clock.advance(Duration::hours(18));

        let order = order(&f, 9_000, 100);
        assert!(matches!(
            f.vault.mint_and_sell_otoken(&f.admin, 0, 9_000, 9_000, &order),
            Err(VaultError::State(_))
        ));
        assert!(matches!(
            f.vault.commit_otoken(&f.admin, 3, &f.otoken),
            Err(VaultError::Validation(_))
        ));
    }

    // =========================================================================
    // Authorization and reentrancy
    // =========================================================================

    #[test]
    fn test_admin_operations_reject_strangers() {
        let f = fixture();
        // Same address as the admin, but not the capability the vault issued
        let lookalike = Capability::issue(admin());
        let stranger = Capability::issue("stranger".into());
        deposit(&f, "p1", 10_000);

        for caller in [&lookalike, &stranger] {
            let results = [
                f.vault.roll_over(caller, &[9_000]),
                f.vault.set_withdraw_reserve(caller, 100),
                f.vault.set_withdraw_fee(caller, 100),
                f.vault.set_fee_recipient(caller, "stranger".into()),
                f.vault.emergency_pause(caller),
                f.vault.commit_otoken(caller, 0, &f.otoken),
                f.vault.transfer_admin(caller, "stranger".into()).map(|_| ()),
            ];
            for result in results {
                assert_eq!(result.unwrap_err().kind(), ErrorKind::Authorization);
            }
        }
        assert_eq!(f.vault.withdraw_fee_bps(), 50);
        assert_eq!(f.vault.state(), VaultState::Unlocked);
        assert_eq!(f.vault.admin(), admin());
        assert_eq!(f.action.state(), ActionState::Idle);
    }

    #[test]
    fn test_transfer_admin() {
        let f = fixture();
        let ops = f.vault.transfer_admin(&f.admin, "ops".into()).unwrap();

        assert_eq!(f.vault.admin(), Address::new("ops"));
        assert!(f.vault.set_withdraw_fee(&f.admin, 10).is_err());
        f.vault.set_withdraw_fee(&ops, 10).unwrap();
        assert_eq!(f.vault.withdraw_fee_bps(), 10);
    }

    #[test]
    fn test_reentrant_call_from_wrapper_rejected() {
        let f = fixture();
        deposit(&f, "p1", 10_000);

        let weak: Weak<Vault> = Arc::downgrade(&f.vault);
        f.wrapper.set_wrap_hook(Some(Box::new(move || match weak.upgrade() {
            Some(vault) => vault
                .withdraw_underlying(&Address::new("p1"), 10_000, 0)
                .map(|_| ()),
            None => Ok(()),
        })));

        let p2 = Address::new("p2");
        f.asset.mint(&p2, 5_000);
        let err = f.vault.deposit_underlying(&p2, 5_000, 0).unwrap_err();

        assert_eq!(
            err,
            VaultError::Reentrancy {
                component: "vault",
                operation: "deposit_underlying"
            }
        );
        assert_eq!(f.vault.balance_of(&"p1".into()), 10_000);
        assert_eq!(f.vault.balance_of(&p2), 0);
        assert_eq!(f.asset.balance_of(&p2), 5_000);
        assert_eq!(f.vault.total_asset(), 10_000);

        // The lock is released once the failed operation unwinds
        f.wrapper.set_wrap_hook(None);
        assert_eq!(f.vault.deposit_underlying(&p2, 5_000, 0).unwrap(), 5_000);
    }

    #[test]
    fn test_reentrant_close_during_fill_rejected() {
        let f = fixture();
        deposit(&f, "p1", 10_000);
        start_epoch(&f, 9_000);

        let weak: Weak<Vault> = Arc::downgrade(&f.vault);
        f.venue.set_fill_hook(Some(Box::new(move || match weak.upgrade() {
            Some(vault) => vault.close_positions(&Address::new("keeper")).map(|_| ()),
            None => Ok(()),
        })));

        let order = order(&f, 9_000, 100);
        let err = f
            .vault
            .mint_and_sell_otoken(&f.admin, 0, 9_000, 9_000, &order)
            .unwrap_err();

        assert!(matches!(err, VaultError::Reentrancy { component: "vault", .. }));
        assert_eq!(f.action.state(), ActionState::Committed);
        assert_eq!(f.vault.total_asset(), 10_000);
        assert_eq!(f.vault.state(), VaultState::Locked);
    }

    // =========================================================================
    // Emergency
    // =========================================================================

    #[test]
    fn test_emergency_blocks_operations_and_resumes() {
        let f = fixture();
        deposit(&f, "p1", 10_000);
        start_epoch(&f, 9_000);
        f.vault.emergency_pause(&f.admin).unwrap();
        assert_eq!(f.vault.state(), VaultState::Emergency);

        let p2 = Address::new("p2");
        f.asset.mint(&p2, 1_000);
        assert!(matches!(
            f.vault.deposit_underlying(&p2, 1_000, 0),
            Err(VaultError::State(_))
        ));
        assert!(matches!(
            f.vault.withdraw_underlying(&"p1".into(), 100, 0),
            Err(VaultError::State(_))
        ));
        assert!(matches!(
            f.vault.close_positions(&"keeper".into()),
            Err(VaultError::State(_))
        ));
        assert!(matches!(f.vault.emergency_pause(&f.admin), Err(VaultError::State(_))));

        f.vault.resume_from_pause(&f.admin).unwrap();
        assert_eq!(f.vault.state(), VaultState::Locked);
        assert!(matches!(f.vault.resume_from_pause(&f.admin), Err(VaultError::State(_))));
    }

    #[test]
    fn test_emergency_withdraw_when_allowed() {
        let f = fixture_with(VaultConfig {
            allow_withdraw_in_emergency: true,
            ..VaultConfig::default()
        });
        deposit(&f, "p1", 10_000);
        f.vault.emergency_pause(&f.admin).unwrap();

        assert_eq!(f.vault.withdraw_underlying(&"p1".into(), 10_000, 0).unwrap(), 9_950);
        f.vault.resume_from_pause(&f.admin).unwrap();
        assert_eq!(f.vault.state(), VaultState::Unlocked);
    }

    // =========================================================================
    // Configuration and views
    // =========================================================================

    #[test]
    fn test_set_actions_validation() {
        let f = fixture();
        let foreign = Arc::new(ShortOTokenAction::new(
            "action-2".into(),
            Capability::issue("vault".into()).id(),
            ShortOTokenSettings {
                deposit_asset: "WBTC".into(),
                collateral_asset: "sdWBTC".into(),
                min_commit_period: Duration::hours(18),
            },
            ShortOTokenCollaborators {
                controller: f.controller.clone(),
                venue: f.venue.clone(),
                wrapper: f.wrapper.clone(),
                oracle: f.oracle.clone(),
                whitelist: Arc::new(StaticWhitelist::new()),
                clock: f.clock.clone(),
            },
        ));

        assert!(matches!(
            f.vault.set_actions(&f.admin, vec![foreign as Arc<dyn Action>]),
            Err(VaultError::Validation(_))
        ));
        assert!(matches!(
            f.vault.set_actions(
                &f.admin,
                vec![f.action.clone() as Arc<dyn Action>, f.action.clone()]
            ),
            Err(VaultError::Validation(_))
        ));
        assert!(matches!(
            f.vault.set_actions(&f.admin, Vec::new()),
            Err(VaultError::Validation(_))
        ));

        deposit(&f, "p1", 10_000);
        start_epoch(&f, 9_000);
        assert!(matches!(
            f.vault
                .set_actions(&f.admin, vec![f.action.clone() as Arc<dyn Action>]),
            Err(VaultError::State(_))
        ));
        assert_eq!(f.vault.actions(), vec![Address::new("action-1")]);
    }

    #[test]
    fn test_bps_setters_reject_out_of_range() {
        let f = fixture();
        assert!(f.vault.set_withdraw_reserve(&f.admin, 10_001).is_err());
        assert!(f.vault.set_withdraw_fee(&f.admin, 10_001).is_err());

        f.vault.set_fee_recipient(&f.admin, "dao".into()).unwrap();
        assert_eq!(f.vault.fee_recipient(), Address::new("dao"));
    }

    #[test]
    fn test_previews_track_share_price() {
        let f = fixture();
        assert_eq!(f.vault.share_price().unwrap(), Decimal::ONE);
        deposit(&f, "p1", 8_000);
        start_epoch(&f, 9_000);
        sell(&f, 200);

        assert_eq!(f.vault.share_price().unwrap(), dec!(1.025));
        assert_eq!(f.vault.preview_deposit(2_000).unwrap(), 1_951);
        let preview = f.vault.preview_withdraw(1_000).unwrap();
        assert_eq!(preview.entitlement, 1_025);
        assert_eq!(preview.fee, 5);
        assert_eq!(preview.net, 1_020);
        assert!(f.vault.preview_withdraw(8_001).is_err());
    }

    #[test]
    fn test_snapshot_captures_ledger_and_actions() {
        let f = fixture();
        deposit(&f, "p1", 4_000);
        deposit(&f, "p2", 6_000);
        start_epoch(&f, 5_000);

        let snapshot = f.vault.snapshot();
        assert_eq!(snapshot.state, VaultState::Locked);
        assert_eq!(snapshot.epoch, 1);
        assert_eq!(snapshot.total_asset, 10_000);
        assert_eq!(snapshot.held_balance, 5_000);
        assert_eq!(snapshot.shares.total_supply, 10_000);
        assert_eq!(snapshot.shares.balances.len(), 2);
        assert_eq!(snapshot.actions.len(), 1);
        assert_eq!(snapshot.actions[0].custody, 5_000);
        assert_eq!(snapshot.actions[0].state, ActionState::Committed);
        assert_eq!(snapshot.taken_at, f.clock.now());
    }

    // =========================================================================
    // Conservation guard
    // =========================================================================

    /// Reports twice the custody it was given.
    struct InflatingAction {
        address: Address,
        vault: CapabilityId,
        custody: Journal<u128>,
    }

    impl Journaled for InflatingAction {
        fn checkpoint(&self) {
            self.custody.checkpoint();
        }
        fn commit(&self) {
            self.custody.commit();
        }
        fn rollback(&self) {
            self.custody.rollback();
        }
    }

    impl Action for InflatingAction {
        fn address(&self) -> &Address {
            &self.address
        }
        fn vault(&self) -> &CapabilityId {
            &self.vault
        }
        fn state(&self) -> ActionState {
            ActionState::Idle
        }
        fn current_value(&self) -> u128 {
            self.custody.get() * 2
        }
        fn can_close(&self) -> bool {
            true
        }
        fn receive_collateral(&self, _vault: &Capability, units: u128) -> VaultResult<()> {
            self.custody.write(|c| *c += units);
            Ok(())
        }
        fn commit_otoken(&self, _vault: &Capability, _otoken: &OTokenId) -> VaultResult<()> {
            Ok(())
        }
        fn mint_and_sell_otoken(
            &self,
            _vault: &Capability,
            _collateral: u128,
            _option_amount: u128,
            _order: &SignedOrder,
        ) -> VaultResult<SaleReceipt> {
            Err(VaultError::State("not supported".into()))
        }
        fn close_position(&self, _vault: &Capability) -> VaultResult<u128> {
            Ok(self.custody.write(std::mem::take))
        }
        fn snapshot(&self) -> ActionSnapshot {
            ActionSnapshot {
                address: self.address.clone(),
                state: ActionState::Idle,
                otoken: None,
                product: None,
                commit_timestamp: None,
                custody: self.custody.get(),
                locked_asset: 0,
            }
        }
    }

    #[test]
    fn test_conservation_violation_reverts_rollover() {
        let f = fixture();
        let inflating = Arc::new(InflatingAction {
            address: "inflating".into(),
            vault: f.vault.capability_id(),
            custody: Journal::new(0),
        });
        f.vault
            .set_actions(&f.admin, vec![inflating.clone() as Arc<dyn Action>])
            .unwrap();
        deposit(&f, "p1", 10_000);

        let err = f.vault.roll_over(&f.admin, &[5_000]).unwrap_err();
        assert!(matches!(err, VaultError::State(msg) if msg.contains("conservation")));
        assert_eq!(inflating.custody.get(), 0);
        assert_eq!(f.vault.held_balance(), 10_000);
        assert_eq!(f.wrapper.balance_of(&"inflating".into()), 0);
        assert_eq!(f.vault.state(), VaultState::Unlocked);
    }

    #[test]
    fn test_drained_wrapper_balance_blocks_operations() {
        let f = fixture();
        let p1 = Address::new("p1");
        deposit(&f, "p1", 10_000);

        // Units leave the vault's wrapper account behind its back
        f.wrapper.seize(&"vault".into(), 5_000).unwrap();
        assert_eq!(f.vault.held_balance(), 5_000);
        assert_eq!(f.vault.total_asset(), 10_000);

        let err = f
            .vault
            .transfer_shares(&p1, &"p2".into(), 1_000)
            .unwrap_err();
        assert!(matches!(err, VaultError::State(msg) if msg.contains("conservation")));
        assert_eq!(f.vault.balance_of(&p1), 10_000);

        f.asset.mint(&"p2".into(), 1_000);
        assert!(f.vault.deposit_underlying(&"p2".into(), 1_000, 0).is_err());
        assert_eq!(f.asset.balance_of(&"p2".into()), 1_000);
        assert!(f.vault.withdraw_underlying(&p1, 1_000, 0).is_err());
        assert_eq!(f.asset.balance_of(&p1), 0);
    }

    #[test]
    fn test_units_follow_the_epoch() {
        let f = fixture();
        deposit(&f, "p1", 10_000);
        start_epoch(&f, 9_000);
        assert_eq!(f.wrapper.balance_of(&"vault".into()), 1_000);
        assert_eq!(f.wrapper.balance_of(&"action-1".into()), 9_000);

        sell(&f, 300);
        assert_eq!(f.wrapper.balance_of(&"vault".into()), 1_300);
        assert_eq!(f.wrapper.balance_of(&"action-1".into()), 0);
        assert_eq!(f.wrapper.balance_of(f.controller.address()), 9_000);
        assert_conserved(&f);

        expire(&f, dec!(40000));
        f.vault.close_positions(&"keeper".into()).unwrap();
        assert_eq!(f.wrapper.balance_of(&"vault".into()), 10_300);
        assert_eq!(f.wrapper.balance_of(f.controller.address()), 0);
        assert_eq!(f.wrapper.supply(), f.vault.total_asset());
    }
}
