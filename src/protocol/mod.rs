//! Collaborator interfaces and shared value types.
//!
//! The vault core only talks to the outside world through the traits in
//! [`traits`]. [`mock`] provides in-memory implementations for tests and the
//! simulator.

pub mod journal;
pub mod mock;
pub mod signing;
pub mod traits;
pub mod types;

pub use journal::{Journal, Journaled};
pub use traits::{
    Clock, CollateralWrapper, DepositAsset, OptionsController, OrderVenue, PriceOracle,
    SystemClock, Whitelist,
};
pub use types::{Address, FillReceipt, OTokenId, OptionProduct, SignedOrder};
