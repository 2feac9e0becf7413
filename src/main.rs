//! Option Vault - Main Entry Point
//!
//! Runs the scripted epoch simulation and inspects persisted snapshots.

use anyhow::Result;
use chrono::Utc;
use clap::{Parser, Subcommand};
use option_vault::config::Config;
use option_vault::persistence::SnapshotStore;
use option_vault::simulation::{ScenarioRunner, SimulationReport};
use std::path::Path;
use tracing::{info, Level};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::EnvFilter;

/// Option Vault CLI
#[derive(Parser)]
#[command(name = "option-vault")]
#[command(version, about = "Pooled covered-call vault simulator")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one epoch end to end against in-memory collaborators
    Simulate {
        /// Path to SQLite database (defaults to persistence.db_path)
        #[arg(short, long)]
        db: Option<String>,

        /// Print the report as JSON instead of a summary
        #[arg(long)]
        json: bool,
    },

    /// Show the vault snapshot saved by the last simulation
    Status {
        /// Path to SQLite database
        #[arg(short, long, default_value = "data/vault_state.db")]
        db: String,

        /// Number of epoch history rows to show
        #[arg(short, long, default_value = "10")]
        limit: usize,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging()?;

    match cli.command {
        Commands::Simulate { db, json } => run_simulation(db, json),
        Commands::Status { db, limit } => show_status(&db, limit),
    }
}

/// Initialize logging to stdout and an hourly rolling file.
fn init_logging() -> Result<()> {
    use tracing_subscriber::fmt::writer::MakeWriterExt;

    std::fs::create_dir_all("logs")?;

    let file_appender = tracing_appender::rolling::hourly("logs", "option-vault.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    // Leak the guard to keep it alive for the program duration
    Box::leak(Box::new(guard));

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("option_vault=debug".parse()?)
                .add_directive(Level::INFO.into()),
        )
        .with_writer(std::io::stdout.and(file_writer))
        .with_target(true)
        .with_file(true)
        .with_line_number(true)
        .with_span_events(FmtSpan::CLOSE)
        .init();

    Ok(())
}

fn log_config(config: &Config) {
    info!("Configuration:");
    info!("   Admin:             {}", config.vault.admin);
    info!("   Fee Recipient:     {}", config.vault.fee_recipient);
    info!("   Withdraw Fee:      {} bps", config.vault.withdraw_fee_bps);
    info!("   Withdraw Reserve:  {} bps", config.vault.withdraw_reserve_bps);
    info!(
        "   Assets:            {} -> {}",
        config.action.deposit_asset, config.action.collateral_asset
    );
    info!("   Commit Period:     {}s", config.action.min_commit_period_secs);
    info!(
        "   Scenario:          {} deposits, {} bps allocated, strike {}, settle {}",
        config.simulation.deposits.len(),
        config.simulation.allocation_bps,
        config.simulation.strike_price,
        config.simulation.settlement_price
    );
}

fn run_simulation(db: Option<String>, json: bool) -> Result<()> {
    let config = Config::load()?;
    config.validate()?;
    log_config(&config);

    let db_path = db.unwrap_or_else(|| config.persistence.db_path.clone());
    if let Some(parent) = Path::new(&db_path).parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let store = SnapshotStore::new(&db_path)?;

    let report = ScenarioRunner::new(config, Utc::now()).run(Some(&store))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report);
    }
    info!("Snapshot saved to {}", db_path);
    Ok(())
}

fn print_report(report: &SimulationReport) {
    println!("\nEpoch Summary");
    println!("   ├─ Product:          {}", report.symbol);
    println!("   ├─ Allocated:        {}", report.allocated);
    println!("   ├─ Premium (units):  {}", report.premium_units);
    println!("   ├─ Share Price:      {}", report.share_price_after_sale);
    println!("   ├─ Returned:         {}", report.returned);
    println!("   └─ Fees Collected:   {}", report.fees_collected);

    println!("\nDepositors");
    for depositor in &report.depositors {
        println!(
            "   ├─ {:<14} in {:>14}  shares {:>14}  out {:>14}  ({:+})",
            depositor.address.as_str(),
            depositor.deposited,
            depositor.shares,
            depositor.withdrawn,
            depositor.gain()
        );
    }
}

fn show_status(db_path: &str, limit: usize) -> Result<()> {
    if !Path::new(db_path).exists() {
        println!("\nDatabase not found: {}", db_path);
        println!("   Run `option-vault simulate` first, or check the path.");
        return Ok(());
    }

    let store = SnapshotStore::new(db_path)?;

    let Some(snapshot) = store.load_snapshot()? else {
        println!("\nNo saved snapshot found in database.");
        return Ok(());
    };

    println!("\nVault {}", snapshot.address);
    println!("   ├─ State:            {}", snapshot.state);
    if let Some(from) = snapshot.paused_from {
        println!("   ├─ Paused From:      {}", from);
    }
    println!("   ├─ Epoch:            {}", snapshot.epoch);
    println!("   ├─ Admin:            {}", snapshot.admin);
    println!("   ├─ Total Asset:      {}", snapshot.total_asset);
    println!("   ├─ Held Balance:     {}", snapshot.held_balance);
    println!("   ├─ Total Supply:     {}", snapshot.shares.total_supply);
    println!(
        "   ├─ Fee:              {} bps to {}",
        snapshot.withdraw_fee_bps, snapshot.fee_recipient
    );
    println!("   ├─ Reserve:          {} bps", snapshot.withdraw_reserve_bps);
    println!(
        "   └─ Taken At:         {}",
        snapshot.taken_at.format("%Y-%m-%d %H:%M:%S UTC")
    );

    if !snapshot.shares.balances.is_empty() {
        println!("\nShare Balances");
        for (holder, shares) in &snapshot.shares.balances {
            println!("   ├─ {}: {}", holder, shares);
        }
    }

    for action in &snapshot.actions {
        println!("\nAction {}", action.address);
        println!("   ├─ State:            {}", action.state);
        if let Some(otoken) = &action.otoken {
            println!("   ├─ oToken:           {}", otoken);
        }
        println!("   ├─ Custody:          {}", action.custody);
        println!("   └─ Locked:           {}", action.locked_asset);
    }

    let history = store.epoch_history(limit)?;
    if !history.is_empty() {
        println!("\nEpoch History");
        for record in &history {
            println!(
                "   ├─ {} epoch {} {:<8} total {} held {} supply {}",
                record.timestamp.format("%Y-%m-%d %H:%M"),
                record.epoch,
                record.event.to_string(),
                record.total_asset,
                record.held_balance,
                record.total_supply
            );
        }
    }

    Ok(())
}
