//! Configuration management for the option vault.
//!
//! Loads settings from an optional `config` file and `OPV__`-prefixed
//! environment variables.

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Main application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Ledger and fee parameters
    #[serde(default)]
    pub vault: VaultConfig,
    /// Option-seller parameters
    #[serde(default)]
    pub action: ActionConfig,
    /// Snapshot storage
    #[serde(default)]
    pub persistence: PersistenceConfig,
    /// Scenario driven by `option-vault simulate`
    #[serde(default)]
    pub simulation: SimulationConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VaultConfig {
    /// Initial administrator
    #[serde(default = "default_admin")]
    pub admin: String,
    /// Receiver of withdrawal fees
    #[serde(default = "default_fee_recipient")]
    pub fee_recipient: String,
    /// Withdrawal fee in bps of the entitlement
    #[serde(default = "default_withdraw_fee_bps")]
    pub withdraw_fee_bps: u32,
    /// Share of total assets kept liquid at rollover, in bps
    #[serde(default = "default_withdraw_reserve_bps")]
    pub withdraw_reserve_bps: u32,
    /// Let holders exit while the vault is paused
    #[serde(default)]
    pub allow_withdraw_in_emergency: bool,
    /// Largest accepted gap between tracked and actual assets, in units
    #[serde(default = "default_rounding_tolerance")]
    pub rounding_tolerance: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionConfig {
    /// Asset depositors bring and premiums are paid in
    #[serde(default = "default_deposit_asset")]
    pub deposit_asset: String,
    /// Wrapped collateral options are written against
    #[serde(default = "default_collateral_asset")]
    pub collateral_asset: String,
    /// Seconds between committing to an oToken and minting it
    #[serde(default = "default_min_commit_period_secs")]
    pub min_commit_period_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistenceConfig {
    #[serde(default = "default_db_path")]
    pub db_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationConfig {
    /// One depositor per entry, amounts in base units
    #[serde(default = "default_deposits")]
    pub deposits: Vec<u64>,
    /// Share of total assets rolled into the action, in bps
    #[serde(default = "default_allocation_bps")]
    pub allocation_bps: u32,
    /// Premium paid by the counterparty, in base units
    #[serde(default = "default_premium")]
    pub premium: u64,
    #[serde(default = "default_strike_price")]
    pub strike_price: Decimal,
    /// Settlement price reported at expiry
    #[serde(default = "default_settlement_price")]
    pub settlement_price: Decimal,
    #[serde(default = "default_expiry_days")]
    pub expiry_days: i64,
    /// Wrapper exchange rate in both directions
    #[serde(default = "default_wrapper_rate")]
    pub wrapper_rate: Decimal,
}

fn default_admin() -> String {
    "admin".to_string()
}

fn default_fee_recipient() -> String {
    "treasury".to_string()
}

fn default_withdraw_fee_bps() -> u32 {
    50 // 0.5%
}

fn default_withdraw_reserve_bps() -> u32 {
    0
}

fn default_rounding_tolerance() -> u64 {
    50
}

fn default_deposit_asset() -> String {
    "WBTC".to_string()
}

fn default_collateral_asset() -> String {
    "sdWBTC".to_string()
}

fn default_min_commit_period_secs() -> u64 {
    18 * 60 * 60
}

/// Longest accepted commit period (30 days)
pub const MAX_COMMIT_PERIOD_SECS: u64 = 30 * 24 * 60 * 60;

/// Longest accepted simulated option life
pub const MAX_EXPIRY_DAYS: i64 = 366;

fn default_db_path() -> String {
    "data/vault_state.db".to_string()
}

fn default_deposits() -> Vec<u64> {
    vec![1_000_000_000, 7_000_000_000, 2_000_000_000]
}

fn default_allocation_bps() -> u32 {
    9_000
}

fn default_premium() -> u64 {
    200_000_000
}

fn default_strike_price() -> Decimal {
    Decimal::new(50_000, 0)
}

fn default_settlement_price() -> Decimal {
    Decimal::new(40_000, 0) // below strike, options expire worthless
}

fn default_expiry_days() -> i64 {
    7
}

fn default_wrapper_rate() -> Decimal {
    Decimal::ONE
}

impl Config {
    /// Load configuration from environment variables and config files.
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = config::Config::builder()
            .add_source(config::File::with_name("config").required(false))
            .add_source(config::Environment::default().separator("__").prefix("OPV"))
            .build()
            .context("Failed to build configuration")?;

        config
            .try_deserialize()
            .context("Failed to deserialize configuration")
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            self.vault.withdraw_fee_bps <= 10_000,
            "withdraw_fee_bps must be at most 10000"
        );

        anyhow::ensure!(
            self.vault.withdraw_reserve_bps <= 10_000,
            "withdraw_reserve_bps must be at most 10000"
        );

        anyhow::ensure!(!self.vault.admin.is_empty(), "admin must be set");

        anyhow::ensure!(
            self.action.deposit_asset != self.action.collateral_asset,
            "deposit_asset and collateral_asset must differ"
        );

        anyhow::ensure!(
            u64::from(self.simulation.allocation_bps) + u64::from(self.vault.withdraw_reserve_bps)
                <= 10_000,
            "allocation_bps plus withdraw_reserve_bps must be at most 10000"
        );

        anyhow::ensure!(
            self.action.min_commit_period_secs > 0
                && self.action.min_commit_period_secs <= MAX_COMMIT_PERIOD_SECS,
            "min_commit_period_secs must be between 1 and {}",
            MAX_COMMIT_PERIOD_SECS
        );

        anyhow::ensure!(
            !self.simulation.deposits.is_empty(),
            "simulation needs at least one deposit"
        );

        anyhow::ensure!(
            self.simulation.expiry_days > 0 && self.simulation.expiry_days <= MAX_EXPIRY_DAYS,
            "expiry_days must be between 1 and {}",
            MAX_EXPIRY_DAYS
        );

        anyhow::ensure!(
            self.simulation.wrapper_rate > Decimal::ZERO,
            "wrapper_rate must be positive"
        );

        Ok(())
    }
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            admin: default_admin(),
            fee_recipient: default_fee_recipient(),
            withdraw_fee_bps: default_withdraw_fee_bps(),
            withdraw_reserve_bps: default_withdraw_reserve_bps(),
            allow_withdraw_in_emergency: false,
            rounding_tolerance: default_rounding_tolerance(),
        }
    }
}

impl Default for ActionConfig {
    fn default() -> Self {
        Self {
            deposit_asset: default_deposit_asset(),
            collateral_asset: default_collateral_asset(),
            min_commit_period_secs: default_min_commit_period_secs(),
        }
    }
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
        }
    }
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            deposits: default_deposits(),
            allocation_bps: default_allocation_bps(),
            premium: default_premium(),
            strike_price: default_strike_price(),
            settlement_price: default_settlement_price(),
            expiry_days: default_expiry_days(),
            wrapper_rate: default_wrapper_rate(),
        }
    }
}
