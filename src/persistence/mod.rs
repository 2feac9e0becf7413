//! SQLite persistence for vault snapshots.
//!
//! Stores the latest vault snapshot so `option-vault status` can inspect a
//! finished simulation:
//! - Vault ledger totals and configuration
//! - Share balances
//! - Per-action state
//! - Epoch history (one row per rollover and close)
//!
//! Ledger quantities are stored as decimal text since they exceed SQLite's
//! integer range.

use crate::action::{ActionSnapshot, ActionState};
use crate::protocol::{Address, OTokenId, OptionProduct};
use crate::vault::{ShareBook, VaultSnapshot, VaultState};
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use tracing::{debug, info, warn};

/// Epoch boundary recorded in the history table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EpochEvent {
    Rollover,
    Close,
}

impl fmt::Display for EpochEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EpochEvent::Rollover => write!(f, "rollover"),
            EpochEvent::Close => write!(f, "close"),
        }
    }
}

/// One row of epoch history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EpochRecord {
    pub timestamp: DateTime<Utc>,
    pub epoch: u64,
    pub event: EpochEvent,
    pub total_asset: u128,
    pub held_balance: u128,
    pub total_supply: u128,
}

/// SQLite-based snapshot store.
pub struct SnapshotStore {
    conn: Connection,
}

fn parse_units(value: &str, field: &str) -> Result<u128> {
    value
        .parse::<u128>()
        .with_context(|| format!("Invalid {field} value {value:?}"))
}

fn parse_time(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .with_context(|| format!("Invalid timestamp {value:?}"))
}

fn parse_vault_state(value: &str) -> Result<VaultState> {
    match value {
        "Emergency" => Ok(VaultState::Emergency),
        "Locked" => Ok(VaultState::Locked),
        "Unlocked" => Ok(VaultState::Unlocked),
        other => Err(anyhow!("Unknown vault state {other:?}")),
    }
}

fn parse_action_state(value: &str) -> Result<ActionState> {
    match value {
        "Idle" => Ok(ActionState::Idle),
        "Committed" => Ok(ActionState::Committed),
        "Activated" => Ok(ActionState::Activated),
        other => Err(anyhow!("Unknown action state {other:?}")),
    }
}

fn parse_epoch_event(value: &str) -> Result<EpochEvent> {
    match value {
        "rollover" => Ok(EpochEvent::Rollover),
        "close" => Ok(EpochEvent::Close),
        other => Err(anyhow!("Unknown epoch event {other:?}")),
    }
}

type VaultRow = (
    String,
    String,
    String,
    Option<String>,
    i64,
    String,
    String,
    u32,
    u32,
    String,
    String,
    String,
);

type ActionRow = (
    String,
    String,
    Option<String>,
    Option<String>,
    Option<String>,
    String,
    String,
);

impl SnapshotStore {
    /// Open (or create) the store at `db_path`.
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let conn = Connection::open(db_path.as_ref())
            .with_context(|| format!("Failed to open database at {:?}", db_path.as_ref()))?;

        let store = Self { conn };
        store.init_schema()?;

        info!("Snapshot store initialized at {:?}", db_path.as_ref());
        Ok(store)
    }

    fn init_schema(&self) -> Result<()> {
        self.conn.execute_batch(
            r#"
            -- Vault ledger (singleton row)
            CREATE TABLE IF NOT EXISTS vault_state (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                address TEXT NOT NULL,
                admin TEXT NOT NULL,
                state TEXT NOT NULL,
                paused_from TEXT,
                epoch INTEGER NOT NULL,
                total_asset TEXT NOT NULL,
                held_balance TEXT NOT NULL,
                withdraw_reserve_bps INTEGER NOT NULL,
                withdraw_fee_bps INTEGER NOT NULL,
                fee_recipient TEXT NOT NULL,
                total_supply TEXT NOT NULL,
                taken_at TEXT NOT NULL
            );

            -- Share balances
            CREATE TABLE IF NOT EXISTS balances (
                holder TEXT PRIMARY KEY,
                shares TEXT NOT NULL
            );

            -- Actions in vault order
            CREATE TABLE IF NOT EXISTS actions (
                position INTEGER PRIMARY KEY,
                address TEXT NOT NULL,
                state TEXT NOT NULL,
                otoken TEXT,
                product TEXT,
                commit_timestamp TEXT,
                custody TEXT NOT NULL,
                locked_asset TEXT NOT NULL
            );

            -- Epoch boundaries
            CREATE TABLE IF NOT EXISTS epoch_history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp TEXT NOT NULL,
                epoch INTEGER NOT NULL,
                event TEXT NOT NULL,
                total_asset TEXT NOT NULL,
                held_balance TEXT NOT NULL,
                total_supply TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_epoch_history_epoch ON epoch_history(epoch);
            "#,
        )?;

        debug!("Database schema initialized");
        Ok(())
    }

    /// Replace the stored snapshot in one transaction.
    pub fn save_snapshot(&self, snapshot: &VaultSnapshot) -> Result<()> {
        let tx = self.conn.unchecked_transaction()?;

        tx.execute(
            r#"
            INSERT INTO vault_state (id, address, admin, state, paused_from, epoch, total_asset,
                                     held_balance, withdraw_reserve_bps, withdraw_fee_bps,
                                     fee_recipient, total_supply, taken_at)
            VALUES (1, ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
            ON CONFLICT(id) DO UPDATE SET
                address = ?1,
                admin = ?2,
                state = ?3,
                paused_from = ?4,
                epoch = ?5,
                total_asset = ?6,
                held_balance = ?7,
                withdraw_reserve_bps = ?8,
                withdraw_fee_bps = ?9,
                fee_recipient = ?10,
                total_supply = ?11,
                taken_at = ?12
            "#,
            params![
                snapshot.address.as_str(),
                snapshot.admin.as_str(),
                snapshot.state.to_string(),
                snapshot.paused_from.map(|s| s.to_string()),
                snapshot.epoch as i64,
                snapshot.total_asset.to_string(),
                snapshot.held_balance.to_string(),
                snapshot.withdraw_reserve_bps,
                snapshot.withdraw_fee_bps,
                snapshot.fee_recipient.as_str(),
                snapshot.shares.total_supply.to_string(),
                snapshot.taken_at.to_rfc3339(),
            ],
        )?;

        tx.execute("DELETE FROM balances", [])?;
        for (holder, shares) in &snapshot.shares.balances {
            tx.execute(
                "INSERT INTO balances (holder, shares) VALUES (?1, ?2)",
                params![holder.as_str(), shares.to_string()],
            )?;
        }

        tx.execute("DELETE FROM actions", [])?;
        for (position, action) in snapshot.actions.iter().enumerate() {
            let product = action
                .product
                .as_ref()
                .map(serde_json::to_string)
                .transpose()
                .context("Failed to encode option product")?;
            tx.execute(
                r#"
                INSERT INTO actions (position, address, state, otoken, product, commit_timestamp,
                                     custody, locked_asset)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                "#,
                params![
                    position as i64,
                    action.address.as_str(),
                    action.state.to_string(),
                    action.otoken.as_ref().map(|o| o.as_str().to_string()),
                    product,
                    action.commit_timestamp.map(|t| t.to_rfc3339()),
                    action.custody.to_string(),
                    action.locked_asset.to_string(),
                ],
            )?;
        }

        tx.commit()?;

        debug!(
            epoch = snapshot.epoch,
            total_asset = snapshot.total_asset,
            holders = snapshot.shares.balances.len(),
            "Snapshot saved to database"
        );
        Ok(())
    }

    /// Load the stored snapshot, if any.
    pub fn load_snapshot(&self) -> Result<Option<VaultSnapshot>> {
        let row: Option<VaultRow> = self
            .conn
            .query_row(
                r#"
                SELECT address, admin, state, paused_from, epoch, total_asset, held_balance,
                       withdraw_reserve_bps, withdraw_fee_bps, fee_recipient, total_supply, taken_at
                FROM vault_state WHERE id = 1
                "#,
                [],
                |row| {
                    Ok((
                        row.get(0)?,
                        row.get(1)?,
                        row.get(2)?,
                        row.get(3)?,
                        row.get(4)?,
                        row.get(5)?,
                        row.get(6)?,
                        row.get(7)?,
                        row.get(8)?,
                        row.get(9)?,
                        row.get(10)?,
                        row.get(11)?,
                    ))
                },
            )
            .optional()?;

        let Some((
            address,
            admin,
            state,
            paused_from,
            epoch,
            total_asset,
            held_balance,
            withdraw_reserve_bps,
            withdraw_fee_bps,
            fee_recipient,
            total_supply,
            taken_at,
        )) = row
        else {
            return Ok(None);
        };

        let mut stmt = self.conn.prepare("SELECT holder, shares FROM balances")?;
        let balance_rows: Vec<(String, String)> = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<rusqlite::Result<_>>()?;
        let mut balances = BTreeMap::new();
        for (holder, shares) in balance_rows {
            balances.insert(Address::new(holder), parse_units(&shares, "shares")?);
        }

        let mut stmt = self.conn.prepare(
            r#"
            SELECT address, state, otoken, product, commit_timestamp, custody, locked_asset
            FROM actions ORDER BY position
            "#,
        )?;
        let action_rows: Vec<ActionRow> = stmt
            .query_map([], |row| {
                Ok((
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                    row.get(5)?,
                    row.get(6)?,
                ))
            })?
            .collect::<rusqlite::Result<_>>()?;

        let mut actions = Vec::with_capacity(action_rows.len());
        for (address, state, otoken, product, commit_timestamp, custody, locked_asset) in action_rows
        {
            let product: Option<OptionProduct> = product
                .map(|p| serde_json::from_str(&p))
                .transpose()
                .context("Failed to decode option product")?;
            actions.push(ActionSnapshot {
                address: Address::new(address),
                state: parse_action_state(&state)?,
                otoken: otoken.map(OTokenId::new),
                product,
                commit_timestamp: commit_timestamp.as_deref().map(parse_time).transpose()?,
                custody: parse_units(&custody, "custody")?,
                locked_asset: parse_units(&locked_asset, "locked_asset")?,
            });
        }

        let snapshot = VaultSnapshot {
            address: Address::new(address),
            admin: Address::new(admin),
            state: parse_vault_state(&state)?,
            paused_from: paused_from.as_deref().map(parse_vault_state).transpose()?,
            epoch: u64::try_from(epoch).context("Negative epoch")?,
            total_asset: parse_units(&total_asset, "total_asset")?,
            held_balance: parse_units(&held_balance, "held_balance")?,
            withdraw_reserve_bps,
            withdraw_fee_bps,
            fee_recipient: Address::new(fee_recipient),
            shares: ShareBook {
                balances,
                total_supply: parse_units(&total_supply, "total_supply")?,
            },
            actions,
            taken_at: parse_time(&taken_at)?,
        };

        info!(
            epoch = snapshot.epoch,
            state = %snapshot.state,
            total_asset = snapshot.total_asset,
            "Loaded snapshot from database"
        );

        Ok(Some(snapshot))
    }

    /// Append an epoch boundary taken from `snapshot`.
    pub fn record_epoch(&self, event: EpochEvent, snapshot: &VaultSnapshot) -> Result<()> {
        self.conn.execute(
            r#"
            INSERT INTO epoch_history (timestamp, epoch, event, total_asset, held_balance, total_supply)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
            params![
                snapshot.taken_at.to_rfc3339(),
                snapshot.epoch as i64,
                event.to_string(),
                snapshot.total_asset.to_string(),
                snapshot.held_balance.to_string(),
                snapshot.shares.total_supply.to_string(),
            ],
        )?;
        Ok(())
    }

    /// Most recent epoch records, newest first.
    pub fn epoch_history(&self, limit: usize) -> Result<Vec<EpochRecord>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT timestamp, epoch, event, total_asset, held_balance, total_supply
            FROM epoch_history
            ORDER BY id DESC
            LIMIT ?1
            "#,
        )?;

        let rows: Vec<(String, i64, String, String, String, String)> = stmt
            .query_map([limit as i64], |row| {
                Ok((
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                    row.get(5)?,
                ))
            })?
            .collect::<rusqlite::Result<_>>()?;

        rows.into_iter()
            .map(|(timestamp, epoch, event, total_asset, held, supply)| {
                Ok(EpochRecord {
                    timestamp: parse_time(&timestamp)?,
                    epoch: u64::try_from(epoch).context("Negative epoch")?,
                    event: parse_epoch_event(&event)?,
                    total_asset: parse_units(&total_asset, "total_asset")?,
                    held_balance: parse_units(&held, "held_balance")?,
                    total_supply: parse_units(&supply, "total_supply")?,
                })
            })
            .collect()
    }

    pub fn has_snapshot(&self) -> Result<bool> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM vault_state WHERE id = 1",
            [],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Clear all data (for testing or reset).
    pub fn clear_all(&self) -> Result<()> {
        warn!("Clearing all snapshot data");
        self.conn.execute_batch(
            r#"
            DELETE FROM vault_state;
            DELETE FROM balances;
            DELETE FROM actions;
            DELETE FROM epoch_history;
            "#,
        )?;
        Ok(())
    }
}
