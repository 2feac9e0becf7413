//! Covered-call seller.
//!
//! Commits to a whitelisted call product, waits out the commit period so
//! depositors can leave, then mints options against its custody and sells
//! them to a counterparty in one atomic step. At expiry the unexercised
//! collateral goes back to the vault.

use super::{Action, ActionSnapshot, ActionState, SaleReceipt};
use crate::access::{Capability, CapabilityId, OperationLock};
use crate::config::ActionConfig;
use crate::error::{Component, VaultError, VaultResult};
use crate::protocol::{
    Address, Clock, CollateralWrapper, Journal, Journaled, OTokenId, OptionProduct,
    OptionsController, OrderVenue, PriceOracle, SignedOrder, Whitelist,
};
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// External systems the action drives.
#[derive(Clone)]
pub struct ShortOTokenCollaborators {
    pub controller: Arc<dyn OptionsController>,
    pub venue: Arc<dyn OrderVenue>,
    pub wrapper: Arc<dyn CollateralWrapper>,
    pub oracle: Arc<dyn PriceOracle>,
    pub whitelist: Arc<dyn Whitelist>,
    pub clock: Arc<dyn Clock>,
}

/// Static parameters of one action.
#[derive(Debug, Clone)]
pub struct ShortOTokenSettings {
    /// Asset premiums are paid in
    pub deposit_asset: Address,
    /// Internal unit the action writes options against
    pub collateral_asset: Address,
    /// Minimum wait between commit and mint
    pub min_commit_period: Duration,
}

impl ShortOTokenSettings {
    pub fn from_config(config: &ActionConfig) -> VaultResult<Self> {
        Ok(Self {
            deposit_asset: Address::new(&config.deposit_asset),
            collateral_asset: Address::new(&config.collateral_asset),
            min_commit_period: commit_period(config.min_commit_period_secs)?,
        })
    }
}

/// Commit period for a configured number of seconds; must be positive and
/// representable.
pub fn commit_period(secs: u64) -> VaultResult<Duration> {
    let period = i64::try_from(secs)
        .ok()
        .and_then(Duration::try_seconds)
        .ok_or_else(|| {
            VaultError::Validation(format!("commit period of {secs}s is out of range"))
        })?;
    if period <= Duration::zero() {
        return Err(VaultError::Validation("commit period must be positive".into()));
    }
    Ok(period)
}

#[derive(Debug, Clone)]
struct Position {
    state: ActionState,
    otoken: Option<OTokenId>,
    product: Option<OptionProduct>,
    commit_timestamp: Option<DateTime<Utc>>,
    custody: u128,
    locked_asset: u128,
}

impl Position {
    fn idle() -> Self {
        Self {
            state: ActionState::Idle,
            otoken: None,
            product: None,
            commit_timestamp: None,
            custody: 0,
            locked_asset: 0,
        }
    }
}

pub struct ShortOTokenAction {
    address: Address,
    vault: CapabilityId,
    settings: ShortOTokenSettings,
    deps: ShortOTokenCollaborators,
    position: Journal<Position>,
    lock: OperationLock,
}

impl ShortOTokenAction {
    pub fn new(
        address: Address,
        vault: CapabilityId,
        settings: ShortOTokenSettings,
        deps: ShortOTokenCollaborators,
    ) -> Self {
        Self {
            address,
            vault,
            settings,
            deps,
            position: Journal::new(Position::idle()),
            lock: OperationLock::new("action"),
        }
    }

    pub fn committed_otoken(&self) -> Option<OTokenId> {
        self.position.read(|p| p.otoken.clone())
    }

    pub fn locked_asset(&self) -> u128 {
        self.position.read(|p| p.locked_asset)
    }

    pub fn custody(&self) -> u128 {
        self.position.read(|p| p.custody)
    }

    fn ensure_vault(&self, capability: &Capability, operation: &str) -> VaultResult<()> {
        if self.vault.matches(capability) {
            return Ok(());
        }
        let caller = capability.holder();
        warn!(action = %self.address, %caller, operation, "Unauthorized action call");
        Err(VaultError::Unauthorized {
            caller: caller.to_string(),
            operation: operation.to_string(),
        })
    }

    /// Run `f` as one all-or-nothing operation.
    fn transact<R>(
        &self,
        operation: &'static str,
        f: impl FnOnce() -> VaultResult<R>,
    ) -> VaultResult<R> {
        let _guard = self.lock.acquire(operation)?;
        self.checkpoint();
        match f() {
            Ok(value) => {
                self.commit();
                Ok(value)
            }
            Err(e) => {
                self.rollback();
                warn!(action = %self.address, operation, error = %e, "Action operation reverted");
                Err(e)
            }
        }
    }

    fn check_product(&self, id: &OTokenId, product: &OptionProduct) -> VaultResult<()> {
        if product.is_put {
            return Err(VaultError::Validation(format!("{id} is a put")));
        }
        if product.collateral_asset != self.settings.collateral_asset {
            return Err(VaultError::Validation(format!(
                "{id} is collateralized in {}, action uses {}",
                product.collateral_asset, self.settings.collateral_asset
            )));
        }
        if !self
            .deps
            .whitelist
            .is_collateral_allowed(&product.collateral_asset)
        {
            return Err(VaultError::Validation(format!(
                "collateral {} is not whitelisted",
                product.collateral_asset
            )));
        }
        if !self.deps.whitelist.is_product_allowed(
            &product.underlying,
            &product.strike_asset,
            &product.collateral_asset,
            product.is_put,
        ) {
            return Err(VaultError::Validation(format!("{id} is not whitelisted")));
        }
        let now = self.deps.clock.now();
        if product.is_expired_at(now) {
            return Err(VaultError::Expiry(format!(
                "{id} expired at {}",
                product.expiry
            )));
        }
        Ok(())
    }

    fn check_order(
        &self,
        position: &Position,
        option_amount: u128,
        order: &SignedOrder,
    ) -> VaultResult<()> {
        let Some(otoken) = position.otoken.as_ref() else {
            return Err(VaultError::State("no oToken committed".into()));
        };
        if &order.option != otoken {
            return Err(VaultError::Validation(format!(
                "order is for {}, committed to {otoken}",
                order.option
            )));
        }
        if order.option_amount != option_amount {
            return Err(VaultError::Validation(format!(
                "order covers {} options, minting {option_amount}",
                order.option_amount
            )));
        }
        if order.taker != self.address {
            return Err(VaultError::Validation(format!(
                "order taker {} is not this action",
                order.taker
            )));
        }
        if order.premium_asset != self.settings.deposit_asset {
            return Err(VaultError::Validation(format!(
                "premium paid in {}, expected {}",
                order.premium_asset, self.settings.deposit_asset
            )));
        }
        let now = self.deps.clock.now();
        if now >= order.expiry {
            return Err(VaultError::Expiry(format!("order expired at {}", order.expiry)));
        }
        if position.product.as_ref().is_some_and(|p| p.is_expired_at(now)) {
            return Err(VaultError::Expiry(format!("{otoken} already expired")));
        }
        self.deps.venue.verify(order)
    }

    fn settlement_ready(&self, product: &OptionProduct) -> VaultResult<()> {
        if !product.is_expired_at(self.deps.clock.now()) {
            return Err(VaultError::Expiry(format!(
                "position expires at {}",
                product.expiry
            )));
        }
        if !self
            .deps
            .oracle
            .is_settlement_finalized(&product.underlying, product.expiry)
        {
            return Err(VaultError::Expiry(format!(
                "settlement price for {} at {} is not finalized",
                product.underlying, product.expiry
            )));
        }
        Ok(())
    }
}

impl Journaled for ShortOTokenAction {
    fn checkpoint(&self) {
        self.position.checkpoint();
        self.deps.controller.checkpoint();
        self.deps.venue.checkpoint();
        self.deps.wrapper.checkpoint();
    }

    fn commit(&self) {
        self.deps.wrapper.commit();
        self.deps.venue.commit();
        self.deps.controller.commit();
        self.position.commit();
    }

    fn rollback(&self) {
        self.deps.wrapper.rollback();
        self.deps.venue.rollback();
        self.deps.controller.rollback();
        self.position.rollback();
    }
}

impl Action for ShortOTokenAction {
    fn address(&self) -> &Address {
        &self.address
    }

    fn vault(&self) -> &CapabilityId {
        &self.vault
    }

    fn state(&self) -> ActionState {
        self.position.read(|p| p.state)
    }

    fn current_value(&self) -> u128 {
        self.position.read(|p| p.custody + p.locked_asset)
    }

    fn can_close(&self) -> bool {
        let position = self.position.get();
        match (position.state, position.product.as_ref()) {
            (ActionState::Activated, Some(product)) => self.settlement_ready(product).is_ok(),
            (ActionState::Activated, None) => false,
            _ => true,
        }
    }

    fn receive_collateral(&self, vault: &Capability, units: u128) -> VaultResult<()> {
        self.transact("receive_collateral", || {
            self.ensure_vault(vault, "receive_collateral")?;
            let held = self.deps.wrapper.balance_of(&self.address);
            let expected = self.custody() + units;
            if held < expected {
                return Err(VaultError::State(format!(
                    "action holds {held} units, custody would be {expected}"
                )));
            }
            self.position.write(|p| {
                p.custody = p
                    .custody
                    .checked_add(units)
                    .ok_or_else(|| VaultError::Arithmetic("custody overflow".into()))?;
                Ok::<(), VaultError>(())
            })?;
            debug!(action = %self.address, units, "Collateral received");
            Ok(())
        })
    }

    fn commit_otoken(&self, vault: &Capability, otoken: &OTokenId) -> VaultResult<()> {
        self.transact("commit_otoken", || {
            self.ensure_vault(vault, "commit_otoken")?;
            let state = self.state();
            if state != ActionState::Idle {
                return Err(VaultError::State(format!(
                    "cannot commit while {state}"
                )));
            }

            let product = self
                .deps
                .controller
                .product(otoken)
                .ok_or_else(|| VaultError::Validation(format!("unknown oToken {otoken}")))?;
            self.check_product(otoken, &product)?;

            let now = self.deps.clock.now();
            self.position.write(|p| {
                p.state = ActionState::Committed;
                p.otoken = Some(otoken.clone());
                p.product = Some(product.clone());
                p.commit_timestamp = Some(now);
            });

            info!(
                action = %self.address,
                otoken = %otoken,
                strike = %product.strike_price,
                expiry = %product.expiry,
                "oToken committed"
            );
            Ok(())
        })
    }

    fn mint_and_sell_otoken(
        &self,
        vault: &Capability,
        collateral: u128,
        option_amount: u128,
        order: &SignedOrder,
    ) -> VaultResult<SaleReceipt> {
        self.transact("mint_and_sell_otoken", || {
            self.ensure_vault(vault, "mint_and_sell_otoken")?;
            let position = self.position.get();
            if position.state != ActionState::Committed {
                return Err(VaultError::State(format!(
                    "cannot mint while {}",
                    position.state
                )));
            }

            let now = self.deps.clock.now();
            let committed_at = position
                .commit_timestamp
                .ok_or_else(|| VaultError::State("missing commit timestamp".into()))?;
            if now - committed_at < self.settings.min_commit_period {
                return Err(VaultError::State(format!(
                    "commit period ends at {}",
                    committed_at + self.settings.min_commit_period
                )));
            }
            if collateral == 0 || collateral > position.custody {
                return Err(VaultError::Validation(format!(
                    "collateral {collateral} must be in (0, {}]",
                    position.custody
                )));
            }
            if option_amount == 0 {
                return Err(VaultError::Validation("option amount must be positive".into()));
            }
            self.check_order(&position, option_amount, order)?;

            let otoken = order.option.clone();
            self.deps
                .controller
                .mint(&self.address, &otoken, collateral, option_amount)?;
            let fill = self.deps.venue.fill(&self.address, order)?;
            if fill.options_delivered != option_amount {
                return Err(VaultError::external(
                    Component::Venue,
                    format!(
                        "venue delivered {} of {option_amount} options",
                        fill.options_delivered
                    ),
                ));
            }
            let premium_units = self
                .deps
                .wrapper
                .wrap(&self.address, fill.premium_received)?;
            self.deps
                .wrapper
                .transfer(&self.address, self.vault.holder(), premium_units)?;

            self.position.write(|p| {
                p.state = ActionState::Activated;
                p.custody -= collateral;
                p.locked_asset = collateral;
            });

            info!(
                action = %self.address,
                otoken = %otoken,
                collateral,
                options = option_amount,
                premium = fill.premium_received,
                premium_units,
                "oToken minted and sold"
            );

            Ok(SaleReceipt {
                otoken,
                collateral_locked: collateral,
                options_sold: option_amount,
                premium_amount: fill.premium_received,
                premium_units,
            })
        })
    }

    fn close_position(&self, vault: &Capability) -> VaultResult<u128> {
        self.transact("close_position", || {
            self.ensure_vault(vault, "close_position")?;
            let position = self.position.get();

            let redeemed = match position.state {
                ActionState::Activated => {
                    let (Some(otoken), Some(product)) =
                        (position.otoken.as_ref(), position.product.as_ref())
                    else {
                        return Err(VaultError::State("activated without a product".into()));
                    };
                    self.settlement_ready(product)?;
                    let redeemed = self
                        .deps
                        .controller
                        .redeem_collateral(&self.address, otoken)?;
                    if redeemed < position.locked_asset {
                        info!(
                            action = %self.address,
                            otoken = %otoken,
                            exercised = position.locked_asset - redeemed,
                            "Options expired in the money"
                        );
                    }
                    redeemed
                }
                ActionState::Idle | ActionState::Committed => 0,
            };

            let returned = redeemed + position.custody;
            if returned > 0 {
                self.deps
                    .wrapper
                    .transfer(&self.address, self.vault.holder(), returned)?;
            }
            self.position.write(|p| *p = Position::idle());

            info!(
                action = %self.address,
                from = %position.state,
                returned,
                "Position closed"
            );
            Ok(returned)
        })
    }

    fn snapshot(&self) -> ActionSnapshot {
        let position = self.position.get();
        ActionSnapshot {
            address: self.address.clone(),
            state: position.state,
            otoken: position.otoken,
            product: position.product,
            commit_timestamp: position.commit_timestamp,
            custody: position.custody,
            locked_asset: position.locked_asset,
        }
    }
}
