//! Scripted single-epoch scenario over the in-memory collaborators.
//!
//! The run mirrors a live epoch: configured depositors join, the admin
//! commits to a call product, the commit period elapses, assets are rolled
//! into the action, options are sold for the configured premium, the
//! product expires at the settlement price and everybody withdraws.

use crate::access::Capability;
use crate::action::short_otoken::ShortOTokenSettings;
use crate::action::{Action, ShortOTokenAction, ShortOTokenCollaborators};
use crate::config::Config;
use crate::persistence::{EpochEvent, SnapshotStore};
use crate::protocol::mock::{
    FixedRateWrapper, InMemoryAsset, InMemoryController, ManualClock, ManualOracle,
    SimulatedVenue, StaticWhitelist,
};
use crate::protocol::signing::sign_order;
use crate::protocol::{
    Address, Clock, DepositAsset, OTokenId, OptionProduct, OptionsController, SignedOrder,
};
use crate::utils::{to_decimal, units_from_decimal};
use crate::vault::{Vault, VaultCollaborators, VaultSnapshot};
use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

const VAULT: &str = "vault";
const ACTION: &str = "short-call-action";
const CONTROLLER: &str = "options-controller";
const COUNTERPARTY: &str = "counterparty";
const COUNTERPARTY_SECRET: &str = "simulated-counterparty";
const STRIKE_ASSET: &str = "USDC";

/// Per-depositor result of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepositorOutcome {
    pub address: Address,
    pub deposited: u128,
    pub shares: u128,
    pub withdrawn: u128,
}

impl DepositorOutcome {
    /// Signed gain over the deposit, in deposit asset units.
    pub fn gain(&self) -> i128 {
        self.withdrawn as i128 - self.deposited as i128
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationReport {
    pub otoken: OTokenId,
    pub symbol: String,
    pub allocated: u128,
    pub premium_units: u128,
    pub returned: u128,
    pub share_price_after_sale: Decimal,
    pub fees_collected: u128,
    pub depositors: Vec<DepositorOutcome>,
    /// Vault right after the sale
    pub locked: VaultSnapshot,
    /// Vault after every depositor left
    pub settled: VaultSnapshot,
}

/// Everything a run wires together.
struct World {
    clock: Arc<ManualClock>,
    oracle: Arc<ManualOracle>,
    asset: Arc<InMemoryAsset>,
    controller: Arc<InMemoryController>,
    vault: Vault,
    admin: Capability,
    settings: ShortOTokenSettings,
    action: Arc<ShortOTokenAction>,
    product: OptionProduct,
    otoken: OTokenId,
}

pub struct ScenarioRunner {
    config: Config,
    start: DateTime<Utc>,
}

impl ScenarioRunner {
    pub fn new(config: Config, start: DateTime<Utc>) -> Self {
        Self { config, start }
    }

    fn build(&self) -> Result<World> {
        let sim = &self.config.simulation;
        let deposit_asset = Address::new(&self.config.action.deposit_asset);
        let collateral_asset = Address::new(&self.config.action.collateral_asset);

        let clock = Arc::new(ManualClock::new(self.start));
        let oracle = Arc::new(ManualOracle::new());
        oracle.set_price(&deposit_asset, sim.strike_price);

        let asset = Arc::new(InMemoryAsset::new(deposit_asset.as_str()));
        let wrapper = Arc::new(FixedRateWrapper::new(collateral_asset.as_str(), asset.clone()));
        wrapper.set_rates(sim.wrapper_rate, Decimal::ONE / sim.wrapper_rate);

        let controller = Arc::new(
            InMemoryController::new(CONTROLLER, wrapper.clone(), oracle.clone(), clock.clone())
                .with_collateral_value(Decimal::ONE / sim.wrapper_rate),
        );
        let venue = Arc::new(SimulatedVenue::new(
            asset.clone(),
            controller.clone(),
            clock.clone(),
        ));
        let counterparty = Address::new(COUNTERPARTY);
        venue.register_maker(&counterparty, COUNTERPARTY_SECRET);
        asset.mint(&counterparty, u128::from(sim.premium));

        let whitelist = Arc::new(StaticWhitelist::new());
        whitelist.whitelist_collateral(&collateral_asset);
        whitelist.whitelist_product(
            &deposit_asset,
            &STRIKE_ASSET.into(),
            &collateral_asset,
            false,
        );

        let product = OptionProduct {
            underlying: deposit_asset.clone(),
            strike_asset: STRIKE_ASSET.into(),
            collateral_asset: collateral_asset.clone(),
            strike_price: sim.strike_price,
            expiry: self.start + Duration::days(sim.expiry_days),
            is_put: false,
        };
        let otoken = controller.create_product(product.clone())?;

        let (vault, admin) = Vault::new(
            VAULT.into(),
            &self.config.vault,
            VaultCollaborators {
                asset: asset.clone(),
                wrapper: wrapper.clone(),
                clock: clock.clone(),
            },
        )?;
        let settings = ShortOTokenSettings::from_config(&self.config.action)?;
        let action = Arc::new(ShortOTokenAction::new(
            ACTION.into(),
            vault.capability_id(),
            settings.clone(),
            ShortOTokenCollaborators {
                controller: controller.clone(),
                venue,
                wrapper,
                oracle: oracle.clone(),
                whitelist,
                clock: clock.clone(),
            },
        ));

        vault.set_actions(&admin, vec![action.clone() as Arc<dyn Action>])?;

        Ok(World {
            clock,
            oracle,
            asset,
            controller,
            vault,
            admin,
            settings,
            action,
            product,
            otoken,
        })
    }

    /// Run the scenario, recording epoch boundaries in `store` when given.
    pub fn run(&self, store: Option<&SnapshotStore>) -> Result<SimulationReport> {
        self.config.validate()?;
        let sim = &self.config.simulation;
        let world = self.build()?;
        let vault = &world.vault;
        let admin = &world.admin;
        let fee_recipient = vault.fee_recipient();

        info!(
            otoken = %world.otoken,
            symbol = %world.product.symbol(),
            depositors = sim.deposits.len(),
            "Starting simulation"
        );

        let mut depositors = Vec::with_capacity(sim.deposits.len());
        for (i, amount) in sim.deposits.iter().enumerate() {
            let address = Address::new(format!("depositor-{}", i + 1));
            let amount = u128::from(*amount);
            world.asset.mint(&address, amount);
            let shares = vault
                .deposit_underlying(&address, amount, 0)
                .with_context(|| format!("Deposit of {address} failed"))?;
            depositors.push(DepositorOutcome {
                address,
                deposited: amount,
                shares,
                withdrawn: 0,
            });
        }

        vault.commit_otoken(admin, 0, &world.otoken)?;
        world.clock.advance(world.settings.min_commit_period);
        vault.roll_over(admin, &[sim.allocation_bps])?;
        let allocated = world.action.custody();
        if let Some(store) = store {
            store.record_epoch(EpochEvent::Rollover, &vault.snapshot())?;
        }

        let option_amount = units_from_decimal(to_decimal(allocated)? / sim.wrapper_rate)?;
        let order = sign_order(
            SignedOrder {
                maker: COUNTERPARTY.into(),
                taker: ACTION.into(),
                option: world.otoken.clone(),
                option_amount,
                premium_asset: world.product.underlying.clone(),
                premium_amount: u128::from(sim.premium),
                expiry: world.clock.now() + Duration::hours(1),
                nonce: vault.epoch(),
                signature: String::new(),
            },
            COUNTERPARTY_SECRET,
        );
        let receipt = vault
            .mint_and_sell_otoken(admin, 0, allocated, option_amount, &order)
            .context("Option sale failed")?;
        let share_price_after_sale = vault.share_price()?;
        let locked = vault.snapshot();

        info!(
            options = receipt.options_sold,
            premium_units = receipt.premium_units,
            share_price = %share_price_after_sale,
            counterparty_options = world
                .controller
                .option_balance(&COUNTERPARTY.into(), &world.otoken),
            "Options sold"
        );

        world.clock.set(world.product.expiry + Duration::hours(1));
        world.oracle.settle(
            &world.product.underlying,
            world.product.expiry,
            sim.settlement_price,
        );
        let returned = vault.close_positions(admin.holder())?;
        if let Some(store) = store {
            store.record_epoch(EpochEvent::Close, &vault.snapshot())?;
        }

        for depositor in &mut depositors {
            let shares = vault.balance_of(&depositor.address);
            if shares == 0 {
                continue;
            }
            depositor.withdrawn = vault
                .withdraw_underlying(&depositor.address, shares, 0)
                .with_context(|| format!("Withdraw of {} failed", depositor.address))?;
        }

        let settled = vault.snapshot();
        if let Some(store) = store {
            store.save_snapshot(&settled)?;
        }

        let report = SimulationReport {
            otoken: world.otoken.clone(),
            symbol: world.product.symbol(),
            allocated,
            premium_units: receipt.premium_units,
            returned,
            share_price_after_sale,
            fees_collected: world.asset.balance_of(&fee_recipient),
            depositors,
            locked,
            settled,
        };

        info!(
            returned = report.returned,
            fees = report.fees_collected,
            remaining_assets = report.settled.total_asset,
            "Simulation complete"
        );
        Ok(report)
    }
}
