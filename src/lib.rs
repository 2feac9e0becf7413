//! # Option Vault
//!
//! A pooled covered-call vault: depositors pool a yield-bearing asset,
//! receive proportional shares, and the vault periodically allocates the
//! pool to actions that write call options and sell them for premium.
//!
//! ## Architecture
//!
//! - `config`: Configuration management and validation
//! - `error`: Error taxonomy shared by every component
//! - `access`: Reentrancy guard and administrator authority
//! - `protocol`: Collaborator traits, value types and in-memory implementations
//! - `vault`: Share ledger, epoch orchestration and events
//! - `action`: Option-seller state machine
//! - `persistence`: SQLite snapshot storage
//! - `simulation`: Scripted epoch over the in-memory collaborators
//! - `utils`: Shared utilities and fixed-point arithmetic

pub mod access;
pub mod action;
pub mod config;
pub mod error;
pub mod persistence;
pub mod protocol;
pub mod simulation;
pub mod utils;
pub mod vault;

pub use config::Config;
pub use error::{VaultError, VaultResult};
pub use vault::Vault;
