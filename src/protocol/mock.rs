//! In-memory collaborators for simulation and tests.
//!
//! Each mutating component keeps its state in a [`Journal`] and cascades
//! checkpoints to the components it moves value through, so an operation that
//! fails after a fill or a wrap leaves no trace behind.

use super::journal::{Journal, Journaled};
use super::signing::verify_message;
use super::traits::{
    Clock, CollateralWrapper, DepositAsset, OptionsController, OrderVenue, PriceOracle, Whitelist,
};
use super::types::{Address, FillReceipt, OTokenId, OptionProduct, SignedOrder};
use crate::error::{Component, VaultError, VaultResult};
use crate::utils::{to_decimal, units_from_decimal};
use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, info};

/// Callback run in the middle of a collaborator call, used to simulate a
/// counterparty that calls back into the core.
pub type CallHook = Box<dyn Fn() -> VaultResult<()> + Send + Sync>;

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// =============================================================================
// Deposit asset
// =============================================================================

/// Token ledger with unrestricted minting.
pub struct InMemoryAsset {
    symbol: Address,
    balances: Journal<HashMap<Address, u128>>,
}

impl InMemoryAsset {
    pub fn new(symbol: impl Into<String>) -> Self {
        Self {
            symbol: Address::new(symbol),
            balances: Journal::new(HashMap::new()),
        }
    }

    pub fn symbol(&self) -> &Address {
        &self.symbol
    }

    /// Credit `holder` out of thin air.
    pub fn mint(&self, holder: &Address, amount: u128) {
        self.balances
            .write(|b| *b.entry(holder.clone()).or_default() += amount);
    }
}

impl Journaled for InMemoryAsset {
    fn checkpoint(&self) {
        self.balances.checkpoint();
    }

    fn commit(&self) {
        self.balances.commit();
    }

    fn rollback(&self) {
        self.balances.rollback();
    }
}

impl DepositAsset for InMemoryAsset {
    fn transfer(&self, from: &Address, to: &Address, amount: u128) -> VaultResult<()> {
        self.balances.write(|balances| {
            let available = balances.get(from).copied().unwrap_or_default();
            if available < amount {
                return Err(VaultError::external(
                    Component::DepositAsset,
                    format!("{from} holds {available} {}, needs {amount}", self.symbol),
                ));
            }
            balances.insert(from.clone(), available - amount);
            *balances.entry(to.clone()).or_default() += amount;
            Ok(())
        })
    }

    fn balance_of(&self, holder: &Address) -> u128 {
        self.balances
            .read(|b| b.get(holder).copied().unwrap_or_default())
    }
}

// =============================================================================
// Collateral wrapper
// =============================================================================

#[derive(Debug, Clone)]
struct WrapperState {
    /// Internal units produced per deposit asset unit
    wrap_rate: Decimal,
    /// Deposit asset returned per internal unit
    unwrap_rate: Decimal,
    balances: HashMap<Address, u128>,
    supply: u128,
    halted: bool,
}

impl WrapperState {
    fn debit(&mut self, holder: &Address, units: u128) -> VaultResult<()> {
        let available = self.balances.get(holder).copied().unwrap_or_default();
        if available < units {
            return Err(VaultError::external(
                Component::Wrapper,
                format!("{holder} holds {available} units, needs {units}"),
            ));
        }
        self.balances.insert(holder.clone(), available - units);
        Ok(())
    }

    fn credit(&mut self, holder: &Address, units: u128) {
        *self.balances.entry(holder.clone()).or_default() += units;
    }
}

/// Wrapper with adjustable exchange rates and a per-holder unit ledger.
pub struct FixedRateWrapper {
    address: Address,
    asset: Arc<InMemoryAsset>,
    state: Journal<WrapperState>,
    wrap_hook: RwLock<Option<CallHook>>,
}

impl FixedRateWrapper {
    pub fn new(address: impl Into<String>, asset: Arc<InMemoryAsset>) -> Self {
        Self {
            address: Address::new(address),
            asset,
            state: Journal::new(WrapperState {
                wrap_rate: Decimal::ONE,
                unwrap_rate: Decimal::ONE,
                balances: HashMap::new(),
                supply: 0,
                halted: false,
            }),
            wrap_hook: RwLock::new(None),
        }
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    pub fn set_rates(&self, wrap_rate: Decimal, unwrap_rate: Decimal) {
        self.state.write(|s| {
            s.wrap_rate = wrap_rate;
            s.unwrap_rate = unwrap_rate;
        });
        debug!(%wrap_rate, %unwrap_rate, "Wrapper rates updated");
    }

    pub fn set_halted(&self, halted: bool) {
        self.state.write(|s| s.halted = halted);
    }

    pub fn set_wrap_hook(&self, hook: Option<CallHook>) {
        *write(&self.wrap_hook) = hook;
    }

    /// Internal units outstanding.
    pub fn supply(&self) -> u128 {
        self.state.read(|s| s.supply)
    }

    /// Burn units out of `holder`'s balance without paying anything out, as
    /// a slashing or exploited wrapper would.
    pub fn seize(&self, holder: &Address, units: u128) -> VaultResult<()> {
        self.state.write(|s| {
            s.debit(holder, units)?;
            s.supply -= units;
            Ok::<(), VaultError>(())
        })?;
        info!(%holder, units, "Wrapper units seized");
        Ok(())
    }

    fn ensure_live(&self) -> VaultResult<WrapperState> {
        let state = self.state.get();
        if state.halted {
            return Err(VaultError::external(Component::Wrapper, "wrapper halted"));
        }
        Ok(state)
    }
}

impl Journaled for FixedRateWrapper {
    fn checkpoint(&self) {
        self.state.checkpoint();
        self.asset.checkpoint();
    }

    fn commit(&self) {
        self.asset.commit();
        self.state.commit();
    }

    fn rollback(&self) {
        self.asset.rollback();
        self.state.rollback();
    }
}

impl CollateralWrapper for FixedRateWrapper {
    fn wrap(&self, owner: &Address, amount: u128) -> VaultResult<u128> {
        let state = self.ensure_live()?;
        if let Some(hook) = read(&self.wrap_hook).as_ref() {
            hook()?;
        }

        self.asset.transfer(owner, &self.address, amount)?;
        let units = units_from_decimal(to_decimal(amount)? * state.wrap_rate)?;
        self.state.write(|s| {
            s.credit(owner, units);
            s.supply += units;
        });

        debug!(%owner, amount, units, "Wrapped deposit asset");
        Ok(units)
    }

    fn unwrap(&self, owner: &Address, units: u128) -> VaultResult<u128> {
        let mut state = self.ensure_live()?;
        state.debit(owner, units)?;
        let amount = units_from_decimal(to_decimal(units)? * state.unwrap_rate)?;

        self.asset.transfer(&self.address, owner, amount)?;
        self.state.write(|s| {
            s.balances = state.balances;
            s.supply -= units;
        });

        debug!(%owner, units, amount, "Unwrapped internal units");
        Ok(amount)
    }

    fn balance_of(&self, holder: &Address) -> u128 {
        self.state
            .read(|s| s.balances.get(holder).copied().unwrap_or_default())
    }

    fn transfer(&self, from: &Address, to: &Address, units: u128) -> VaultResult<()> {
        self.state.write(|s| {
            s.debit(from, units)?;
            s.credit(to, units);
            Ok::<(), VaultError>(())
        })?;
        debug!(%from, %to, units, "Wrapped units transferred");
        Ok(())
    }
}

// =============================================================================
// Oracle
// =============================================================================

#[derive(Debug, Clone, Copy)]
struct SettlementEntry {
    price: Decimal,
    finalized: bool,
}

/// Oracle whose prices are pushed by the test or simulation driver.
#[derive(Default)]
pub struct ManualOracle {
    spot: RwLock<HashMap<Address, Decimal>>,
    settlements: RwLock<HashMap<(Address, i64), SettlementEntry>>,
}

impl ManualOracle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_price(&self, asset: &Address, price: Decimal) {
        write(&self.spot).insert(asset.clone(), price);
    }

    /// Record an expiry price; it stays disputable until [`Self::finalize`].
    pub fn set_expiry_settlement_price(
        &self,
        asset: &Address,
        expiry: DateTime<Utc>,
        price: Decimal,
    ) {
        write(&self.settlements).insert(
            (asset.clone(), expiry.timestamp()),
            SettlementEntry {
                price,
                finalized: false,
            },
        );
        info!(%asset, %expiry, %price, "Expiry price submitted");
    }

    pub fn finalize(&self, asset: &Address, expiry: DateTime<Utc>) {
        if let Some(entry) = write(&self.settlements).get_mut(&(asset.clone(), expiry.timestamp())) {
            entry.finalized = true;
        }
    }

    /// Submit and finalize in one step.
    pub fn settle(&self, asset: &Address, expiry: DateTime<Utc>, price: Decimal) {
        self.set_expiry_settlement_price(asset, expiry, price);
        self.finalize(asset, expiry);
    }
}

impl PriceOracle for ManualOracle {
    fn price(&self, asset: &Address) -> VaultResult<Decimal> {
        read(&self.spot)
            .get(asset)
            .copied()
            .ok_or_else(|| VaultError::external(Component::Oracle, format!("no price for {asset}")))
    }

    fn settlement_price(&self, asset: &Address, expiry: DateTime<Utc>) -> Option<Decimal> {
        read(&self.settlements)
            .get(&(asset.clone(), expiry.timestamp()))
            .map(|e| e.price)
    }

    fn is_settlement_finalized(&self, asset: &Address, expiry: DateTime<Utc>) -> bool {
        read(&self.settlements)
            .get(&(asset.clone(), expiry.timestamp()))
            .is_some_and(|e| e.finalized)
    }
}

// =============================================================================
// Options controller
// =============================================================================

/// Collateral and short options recorded for one owner and product.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MarginPosition {
    pub collateral: u128,
    pub short_options: u128,
}

#[derive(Debug, Clone, Default)]
struct ControllerState {
    products: BTreeMap<OTokenId, OptionProduct>,
    positions: HashMap<(Address, OTokenId), MarginPosition>,
    option_balances: HashMap<(Address, OTokenId), u128>,
    reject_mints: bool,
}

/// Fully collateralized options system.
///
/// Minting pulls collateral units from the writer into the controller's own
/// wrapper balance; redemption pays back what exercise did not consume.
/// Collateral is valued in underlying terms at `collateral_value` underlying
/// units per collateral unit. A call is exercised for
/// `options * (settlement - strike) / settlement` underlying units.
pub struct InMemoryController {
    address: Address,
    wrapper: Arc<dyn CollateralWrapper>,
    oracle: Arc<dyn PriceOracle>,
    clock: Arc<dyn Clock>,
    collateral_value: Decimal,
    state: Journal<ControllerState>,
}

impl InMemoryController {
    pub fn new(
        address: impl Into<String>,
        wrapper: Arc<dyn CollateralWrapper>,
        oracle: Arc<dyn PriceOracle>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            address: Address::new(address),
            wrapper,
            oracle,
            clock,
            collateral_value: Decimal::ONE,
            state: Journal::new(ControllerState::default()),
        }
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    pub fn with_collateral_value(mut self, value: Decimal) -> Self {
        self.collateral_value = value;
        self
    }

    pub fn set_reject_mints(&self, reject: bool) {
        self.state.write(|s| s.reject_mints = reject);
    }

    pub fn position(&self, owner: &Address, id: &OTokenId) -> Option<MarginPosition> {
        self.state
            .read(|s| s.positions.get(&(owner.clone(), id.clone())).copied())
    }

    pub fn option_balance(&self, holder: &Address, id: &OTokenId) -> u128 {
        self.state.read(|s| {
            s.option_balances
                .get(&(holder.clone(), id.clone()))
                .copied()
                .unwrap_or_default()
        })
    }

    /// Move minted options between holders.
    pub fn transfer_options(
        &self,
        from: &Address,
        to: &Address,
        id: &OTokenId,
        amount: u128,
    ) -> VaultResult<()> {
        self.state.write(|s| {
            let from_key = (from.clone(), id.clone());
            let available = s.option_balances.get(&from_key).copied().unwrap_or_default();
            if available < amount {
                return Err(VaultError::external(
                    Component::Controller,
                    format!("{from} holds {available} {id}, needs {amount}"),
                ));
            }
            s.option_balances.insert(from_key, available - amount);
            *s.option_balances.entry((to.clone(), id.clone())).or_default() += amount;
            Ok(())
        })
    }

    fn required_collateral_value(product: &OptionProduct, options: u128) -> VaultResult<Decimal> {
        let options = to_decimal(options)?;
        Ok(if product.is_put {
            options * product.strike_price
        } else {
            options
        })
    }

    fn exercised_collateral(
        &self,
        product: &OptionProduct,
        position: MarginPosition,
        settlement: Decimal,
    ) -> VaultResult<u128> {
        let options = to_decimal(position.short_options)?;
        let payout_value = if product.is_put {
            if settlement < product.strike_price {
                options * (product.strike_price - settlement)
            } else {
                Decimal::ZERO
            }
        } else if settlement > product.strike_price && settlement > Decimal::ZERO {
            options * (settlement - product.strike_price) / settlement
        } else {
            Decimal::ZERO
        };
        let consumed = units_from_decimal(payout_value / self.collateral_value)?;
        Ok(consumed.min(position.collateral))
    }
}

impl Journaled for InMemoryController {
    fn checkpoint(&self) {
        self.state.checkpoint();
        self.wrapper.checkpoint();
    }

    fn commit(&self) {
        self.wrapper.commit();
        self.state.commit();
    }

    fn rollback(&self) {
        self.wrapper.rollback();
        self.state.rollback();
    }
}

impl OptionsController for InMemoryController {
    fn create_product(&self, product: OptionProduct) -> VaultResult<OTokenId> {
        let id = OTokenId::new(product.symbol());
        self.state.write(|s| {
            if s.products.contains_key(&id) {
                return Err(VaultError::external(
                    Component::Controller,
                    format!("product {id} already exists"),
                ));
            }
            s.products.insert(id.clone(), product);
            Ok(())
        })?;
        info!(otoken = %id, "Option product created");
        Ok(id)
    }

    fn product(&self, id: &OTokenId) -> Option<OptionProduct> {
        self.state.read(|s| s.products.get(id).cloned())
    }

    fn mint(
        &self,
        owner: &Address,
        id: &OTokenId,
        collateral: u128,
        options: u128,
    ) -> VaultResult<()> {
        let state = self.state.get();
        if state.reject_mints {
            return Err(VaultError::external(Component::Controller, "minting paused"));
        }
        let product = state
            .products
            .get(id)
            .cloned()
            .ok_or_else(|| VaultError::external(Component::Controller, format!("unknown product {id}")))?;
        if product.is_expired_at(self.clock.now()) {
            return Err(VaultError::external(
                Component::Controller,
                format!("product {id} already expired"),
            ));
        }

        let key = (owner.clone(), id.clone());
        let existing = state.positions.get(&key).copied().unwrap_or_default();
        let total_collateral = existing.collateral + collateral;
        let total_options = existing.short_options + options;
        let collateral_value = to_decimal(total_collateral)? * self.collateral_value;
        if collateral_value < Self::required_collateral_value(&product, total_options)? {
            return Err(VaultError::external(
                Component::Controller,
                format!("{total_collateral} collateral cannot back {total_options} options"),
            ));
        }

        self.wrapper.transfer(owner, &self.address, collateral)?;
        self.state.write(|s| {
            s.positions.insert(
                key.clone(),
                MarginPosition {
                    collateral: total_collateral,
                    short_options: total_options,
                },
            );
            *s.option_balances.entry(key).or_default() += options;
        });

        debug!(%owner, otoken = %id, collateral, options, "Options minted");
        Ok(())
    }

    fn redeem_collateral(&self, owner: &Address, id: &OTokenId) -> VaultResult<u128> {
        let product = self
            .product(id)
            .ok_or_else(|| VaultError::external(Component::Controller, format!("unknown product {id}")))?;
        if !product.is_expired_at(self.clock.now()) {
            return Err(VaultError::external(
                Component::Controller,
                format!("product {id} has not expired"),
            ));
        }
        if !self
            .oracle
            .is_settlement_finalized(&product.underlying, product.expiry)
        {
            return Err(VaultError::external(
                Component::Controller,
                "settlement price not finalized",
            ));
        }
        let settlement = self
            .oracle
            .settlement_price(&product.underlying, product.expiry)
            .ok_or_else(|| VaultError::external(Component::Oracle, "missing settlement price"))?;

        let key = (owner.clone(), id.clone());
        let position = self
            .position(owner, id)
            .ok_or_else(|| VaultError::external(Component::Controller, format!("{owner} has no position in {id}")))?;
        let consumed = self.exercised_collateral(&product, position, settlement)?;
        let returned = position.collateral - consumed;

        self.wrapper.transfer(&self.address, owner, returned)?;
        self.state.write(|s| {
            s.positions.remove(&key);
        });

        info!(%owner, otoken = %id, %settlement, consumed, returned, "Collateral redeemed");
        Ok(returned)
    }
}

// =============================================================================
// Whitelist
// =============================================================================

#[derive(Default)]
struct WhitelistState {
    collaterals: HashSet<Address>,
    products: HashSet<(Address, Address, Address, bool)>,
}

/// Explicit allow-lists.
#[derive(Default)]
pub struct StaticWhitelist {
    state: RwLock<WhitelistState>,
}

impl StaticWhitelist {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn whitelist_collateral(&self, asset: &Address) {
        write(&self.state).collaterals.insert(asset.clone());
    }

    pub fn whitelist_product(
        &self,
        underlying: &Address,
        strike_asset: &Address,
        collateral_asset: &Address,
        is_put: bool,
    ) {
        write(&self.state).products.insert((
            underlying.clone(),
            strike_asset.clone(),
            collateral_asset.clone(),
            is_put,
        ));
    }
}

impl Whitelist for StaticWhitelist {
    fn is_collateral_allowed(&self, asset: &Address) -> bool {
        read(&self.state).collaterals.contains(asset)
    }

    fn is_product_allowed(
        &self,
        underlying: &Address,
        strike_asset: &Address,
        collateral_asset: &Address,
        is_put: bool,
    ) -> bool {
        read(&self.state).products.contains(&(
            underlying.clone(),
            strike_asset.clone(),
            collateral_asset.clone(),
            is_put,
        ))
    }
}

// =============================================================================
// Order venue
// =============================================================================

#[derive(Debug, Clone, Default)]
struct VenueState {
    used_nonces: HashSet<(Address, u64)>,
    fills: u64,
}

/// Venue settling HMAC-signed orders against the in-memory controller and
/// asset ledger.
pub struct SimulatedVenue {
    asset: Arc<InMemoryAsset>,
    controller: Arc<InMemoryController>,
    clock: Arc<dyn Clock>,
    makers: RwLock<HashMap<Address, String>>,
    state: Journal<VenueState>,
    /// Consumed by the next fill even if that fill is reverted
    fail_next_fill: RwLock<Option<String>>,
    fill_hook: RwLock<Option<CallHook>>,
}

impl SimulatedVenue {
    pub fn new(
        asset: Arc<InMemoryAsset>,
        controller: Arc<InMemoryController>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            asset,
            controller,
            clock,
            makers: RwLock::new(HashMap::new()),
            state: Journal::new(VenueState::default()),
            fail_next_fill: RwLock::new(None),
            fill_hook: RwLock::new(None),
        }
    }

    /// Register the signing secret of a counterparty.
    pub fn register_maker(&self, maker: &Address, secret: impl Into<String>) {
        write(&self.makers).insert(maker.clone(), secret.into());
    }

    /// Make the next fill fail after both legs were attempted.
    pub fn fail_next_fill(&self, reason: impl Into<String>) {
        *write(&self.fail_next_fill) = Some(reason.into());
    }

    pub fn set_fill_hook(&self, hook: Option<CallHook>) {
        *write(&self.fill_hook) = hook;
    }

    pub fn fills(&self) -> u64 {
        self.state.read(|s| s.fills)
    }

    fn settle_legs(&self, taker: &Address, order: &SignedOrder) -> VaultResult<()> {
        self.controller
            .transfer_options(taker, &order.maker, &order.option, order.option_amount)?;
        self.asset
            .transfer(&order.maker, taker, order.premium_amount)?;

        if let Some(hook) = read(&self.fill_hook).as_ref() {
            hook()?;
        }
        let injected = write(&self.fail_next_fill).take();
        if let Some(reason) = injected {
            return Err(VaultError::external(Component::Venue, reason));
        }
        Ok(())
    }
}

impl Journaled for SimulatedVenue {
    fn checkpoint(&self) {
        self.state.checkpoint();
        self.asset.checkpoint();
        self.controller.checkpoint();
    }

    fn commit(&self) {
        self.controller.commit();
        self.asset.commit();
        self.state.commit();
    }

    fn rollback(&self) {
        self.controller.rollback();
        self.asset.rollback();
        self.state.rollback();
    }
}

impl OrderVenue for SimulatedVenue {
    fn verify(&self, order: &SignedOrder) -> VaultResult<()> {
        let secret = read(&self.makers).get(&order.maker).cloned().ok_or_else(|| {
            VaultError::Validation(format!("unknown order maker {}", order.maker))
        })?;
        if !verify_message(&secret, &order.message(), &order.signature) {
            return Err(VaultError::Validation("invalid order signature".into()));
        }
        if self.clock.now() >= order.expiry {
            return Err(VaultError::Expiry(format!(
                "order expired at {}",
                order.expiry
            )));
        }
        if self
            .state
            .read(|s| s.used_nonces.contains(&(order.maker.clone(), order.nonce)))
        {
            return Err(VaultError::Validation(format!(
                "order nonce {} already used",
                order.nonce
            )));
        }
        Ok(())
    }

    fn fill(&self, taker: &Address, order: &SignedOrder) -> VaultResult<FillReceipt> {
        self.verify(order)?;
        if taker != &order.taker {
            return Err(VaultError::Validation(format!(
                "order taker {} does not match {taker}",
                order.taker
            )));
        }

        // Both legs settle or neither does
        self.checkpoint();
        match self.settle_legs(taker, order) {
            Ok(()) => {
                self.state.write(|s| {
                    s.used_nonces.insert((order.maker.clone(), order.nonce));
                    s.fills += 1;
                });
                self.commit();
            }
            Err(e) => {
                self.rollback();
                return Err(e);
            }
        }

        info!(
            maker = %order.maker,
            %taker,
            otoken = %order.option,
            options = order.option_amount,
            premium = order.premium_amount,
            "Order filled"
        );

        Ok(FillReceipt {
            options_delivered: order.option_amount,
            premium_received: order.premium_amount,
        })
    }
}

// =============================================================================
// Clock
// =============================================================================

/// Clock advanced explicitly by the driver.
pub struct ManualClock {
    now: RwLock<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: RwLock::new(start),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = write(&self.now);
        *now += by;
    }

    /// Move forward to `at`; never moves backwards.
    pub fn set(&self, at: DateTime<Utc>) {
        let mut now = write(&self.now);
        if at > *now {
            *now = at;
        }
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *read(&self.now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::signing::sign_order;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    // =========================================================================
    // Helper functions
    // =========================================================================

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 16, 8, 0, 0).unwrap()
    }

    fn call_product(expiry: DateTime<Utc>) -> OptionProduct {
        OptionProduct {
            underlying: "WBTC".into(),
            strike_asset: "USDC".into(),
            collateral_asset: "sdWBTC".into(),
            strike_price: dec!(50000),
            expiry,
            is_put: false,
        }
    }

    struct Fixture {
        clock: Arc<ManualClock>,
        oracle: Arc<ManualOracle>,
        asset: Arc<InMemoryAsset>,
        wrapper: Arc<FixedRateWrapper>,
        controller: Arc<InMemoryController>,
        venue: SimulatedVenue,
    }

    fn fixture() -> Fixture {
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
        let venue = SimulatedVenue::new(asset.clone(), controller.clone(), clock.clone());
        Fixture {
            clock,
            oracle,
            asset,
            wrapper,
            controller,
            venue,
        }
    }

    /// Give `owner` wrapped units to write options against.
    fn fund(f: &Fixture, owner: &Address, units: u128) {
        f.asset.mint(owner, units);
        f.wrapper.wrap(owner, units).unwrap();
    }

    fn order(option: &OTokenId, expiry: DateTime<Utc>) -> SignedOrder {
        sign_order(
            SignedOrder {
                maker: "maker".into(),
                taker: "action".into(),
                option: option.clone(),
                option_amount: 100,
                premium_asset: "WBTC".into(),
                premium_amount: 20,
                expiry,
                nonce: 7,
                signature: String::new(),
            },
            "secret",
        )
    }

    // =========================================================================
    // Asset and wrapper
    // =========================================================================

    #[test]
    fn test_asset_transfer_and_rollback() {
        let asset = InMemoryAsset::new("WBTC");
        let alice = Address::new("alice");
        let bob = Address::new("bob");
        asset.mint(&alice, 100);

        asset.checkpoint();
        asset.transfer(&alice, &bob, 40).unwrap();
        assert_eq!(asset.balance_of(&bob), 40);
        asset.rollback();

        assert_eq!(asset.balance_of(&alice), 100);
        assert_eq!(asset.balance_of(&bob), 0);
        assert!(asset.transfer(&alice, &bob, 101).is_err());
    }

    #[test]
    fn test_wrapper_applies_rates() {
        let asset = Arc::new(InMemoryAsset::new("WBTC"));
        let wrapper = FixedRateWrapper::new("wrapper", asset.clone());
        let vault = Address::new("vault");
        asset.mint(&vault, 1_000);
        wrapper.set_rates(dec!(0.95), dec!(0.95));

        let units = wrapper.wrap(&vault, 1_000).unwrap();
        assert_eq!(units, 950);
        assert_eq!(asset.balance_of(&vault), 0);
        assert_eq!(CollateralWrapper::balance_of(&wrapper, &vault), 950);

        let amount = wrapper.unwrap(&vault, 950).unwrap();
        assert_eq!(amount, 902); // 950 * 0.95 = 902.5
        assert_eq!(wrapper.supply(), 0);
        assert_eq!(CollateralWrapper::balance_of(&wrapper, &vault), 0);
    }

    #[test]
    fn test_unwrap_only_spends_own_units() {
        let asset = Arc::new(InMemoryAsset::new("WBTC"));
        let wrapper = FixedRateWrapper::new("wrapper", asset.clone());
        let vault = Address::new("vault");
        let thief = Address::new("thief");
        asset.mint(&vault, 10_000);
        wrapper.wrap(&vault, 10_000).unwrap();

        let err = wrapper.unwrap(&thief, 10_000).unwrap_err();
        assert!(matches!(err, VaultError::External { component: Component::Wrapper, .. }));
        assert_eq!(asset.balance_of(&thief), 0);
        assert_eq!(CollateralWrapper::balance_of(&wrapper, &vault), 10_000);
        assert_eq!(wrapper.supply(), 10_000);

        assert!(CollateralWrapper::transfer(&wrapper, &thief, &vault, 1).is_err());
        CollateralWrapper::transfer(&wrapper, &vault, &thief, 4_000).unwrap();
        assert_eq!(wrapper.unwrap(&thief, 4_000).unwrap(), 4_000);
        assert_eq!(asset.balance_of(&thief), 4_000);

        wrapper.seize(&vault, 1_000).unwrap();
        assert_eq!(CollateralWrapper::balance_of(&wrapper, &vault), 5_000);
        assert_eq!(wrapper.supply(), 5_000);
    }

    #[test]
    fn test_halted_wrapper_rejects() {
        let asset = Arc::new(InMemoryAsset::new("WBTC"));
        let wrapper = FixedRateWrapper::new("wrapper", asset);
        wrapper.set_halted(true);
        let err = wrapper.wrap(&Address::new("vault"), 1).unwrap_err();
        assert!(matches!(err, VaultError::External { component: Component::Wrapper, .. }));
    }

    // =========================================================================
    // Controller
    // =========================================================================

    #[test]
    fn test_mint_requires_full_collateral() {
        let f = fixture();
        let id = f
            .controller
            .create_product(call_product(start() + Duration::days(10)))
            .unwrap();
        let owner = Address::new("action");
        fund(&f, &owner, 100);

        assert!(f.controller.mint(&owner, &id, 99, 100).is_err());
        f.controller.mint(&owner, &id, 100, 100).unwrap();
        assert_eq!(f.controller.option_balance(&owner, &id), 100);
        assert_eq!(f.wrapper.balance_of(&owner), 0);
        assert_eq!(f.wrapper.balance_of(f.controller.address()), 100);
        assert!(f.controller.create_product(call_product(start() + Duration::days(10))).is_err());
    }

    #[test]
    fn test_redeem_after_worthless_expiry() {
        let f = fixture();
        let expiry = start() + Duration::days(10);
        let id = f.controller.create_product(call_product(expiry)).unwrap();
        let owner = Address::new("action");
        fund(&f, &owner, 1_000);
        f.controller.mint(&owner, &id, 1_000, 1_000).unwrap();

        assert!(f.controller.redeem_collateral(&owner, &id).is_err());
        f.clock.set(expiry + Duration::days(1));
        assert!(f.controller.redeem_collateral(&owner, &id).is_err());

        f.oracle.settle(&Address::new("WBTC"), expiry, dec!(40000));
        assert_eq!(f.controller.redeem_collateral(&owner, &id).unwrap(), 1_000);
        assert!(f.controller.position(&owner, &id).is_none());
        assert_eq!(f.wrapper.balance_of(&owner), 1_000);
    }

    #[test]
    fn test_redeem_after_exercise() {
        let f = fixture();
        let expiry = start() + Duration::days(10);
        let id = f.controller.create_product(call_product(expiry)).unwrap();
        let owner = Address::new("action");
        fund(&f, &owner, 1_000);
        f.controller.mint(&owner, &id, 1_000, 1_000).unwrap();

        f.clock.set(expiry);
        f.oracle.settle(&Address::new("WBTC"), expiry, dec!(62500));
        // 1000 * (62500 - 50000) / 62500 = 200 consumed
        assert_eq!(f.controller.redeem_collateral(&owner, &id).unwrap(), 800);
        assert_eq!(f.wrapper.balance_of(&owner), 800);
        assert_eq!(f.wrapper.balance_of(f.controller.address()), 200);
    }

    // =========================================================================
    // Venue
    // =========================================================================

    #[test]
    fn test_fill_moves_both_legs() {
        let f = fixture();
        let expiry = start() + Duration::days(10);
        let id = f.controller.create_product(call_product(expiry)).unwrap();
        let action = Address::new("action");
        let maker = Address::new("maker");
        fund(&f, &action, 100);
        f.controller.mint(&action, &id, 100, 100).unwrap();
        f.asset.mint(&maker, 20);
        f.venue.register_maker(&maker, "secret");

        let order = order(&id, start() + Duration::hours(1));
        let receipt = f.venue.fill(&action, &order).unwrap();

        assert_eq!(receipt.premium_received, 20);
        assert_eq!(f.asset.balance_of(&action), 20);
        assert_eq!(f.controller.option_balance(&maker, &id), 100);
        assert_eq!(f.venue.fills(), 1);

        // Replay is rejected
        assert!(matches!(f.venue.fill(&action, &order), Err(VaultError::Validation(_))));
    }

    #[test]
    fn test_failed_fill_reverts_both_legs() {
        let f = fixture();
        let id = f
            .controller
            .create_product(call_product(start() + Duration::days(10)))
            .unwrap();
        let action = Address::new("action");
        let maker = Address::new("maker");
        fund(&f, &action, 100);
        f.controller.mint(&action, &id, 100, 100).unwrap();
        f.asset.mint(&maker, 20);
        f.venue.register_maker(&maker, "secret");
        f.venue.fail_next_fill("counterparty revoked allowance");

        let err = f
            .venue
            .fill(&action, &order(&id, start() + Duration::hours(1)))
            .unwrap_err();

        assert!(matches!(err, VaultError::External { component: Component::Venue, .. }));
        assert_eq!(f.asset.balance_of(&maker), 20);
        assert_eq!(f.controller.option_balance(&action, &id), 100);
        assert_eq!(f.venue.fills(), 0);
    }

    #[test]
    fn test_verify_rejects_expired_and_unsigned() {
        let f = fixture();
        let id = OTokenId::new("oWBTC");
        f.venue.register_maker(&Address::new("maker"), "secret");

        let expired = order(&id, start());
        assert!(matches!(f.venue.verify(&expired), Err(VaultError::Expiry(_))));

        let mut forged = order(&id, start() + Duration::hours(1));
        forged.premium_amount = 1;
        assert!(matches!(f.venue.verify(&forged), Err(VaultError::Validation(_))));
    }
}
