//! Proportional share ledger.

use crate::error::{VaultError, VaultResult};
use crate::protocol::{Address, Journal, Journaled};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Holder balances plus total supply.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShareBook {
    pub balances: BTreeMap<Address, u128>,
    pub total_supply: u128,
}

/// Share balances; `total_supply` always equals the sum of balances.
pub struct ShareLedger {
    book: Journal<ShareBook>,
}

impl ShareLedger {
    pub fn new() -> Self {
        Self::from_book(ShareBook::default())
    }

    pub fn from_book(book: ShareBook) -> Self {
        Self {
            book: Journal::new(book),
        }
    }

    pub fn balance_of(&self, holder: &Address) -> u128 {
        self.book
            .read(|b| b.balances.get(holder).copied().unwrap_or_default())
    }

    pub fn total_supply(&self) -> u128 {
        self.book.read(|b| b.total_supply)
    }

    pub fn book(&self) -> ShareBook {
        self.book.get()
    }

    pub fn mint(&self, holder: &Address, shares: u128) -> VaultResult<()> {
        self.book.write(|b| {
            let supply = b
                .total_supply
                .checked_add(shares)
                .ok_or_else(|| VaultError::Arithmetic("share supply overflow".into()))?;
            *b.balances.entry(holder.clone()).or_default() += shares;
            b.total_supply = supply;
            Ok(())
        })
    }

    pub fn burn(&self, holder: &Address, shares: u128) -> VaultResult<()> {
        self.book.write(|b| {
            let balance = b.balances.get(holder).copied().unwrap_or_default();
            if balance < shares {
                return Err(VaultError::Validation(format!(
                    "{holder} holds {balance} shares, cannot burn {shares}"
                )));
            }
            if balance == shares {
                b.balances.remove(holder);
            } else {
                b.balances.insert(holder.clone(), balance - shares);
            }
            b.total_supply -= shares;
            Ok(())
        })
    }

    /// Move shares between holders; supply is unchanged.
    pub fn transfer(&self, from: &Address, to: &Address, shares: u128) -> VaultResult<()> {
        self.burn(from, shares)?;
        self.mint(to, shares)
    }
}

impl Default for ShareLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl Journaled for ShareLedger {
    fn checkpoint(&self) {
        self.book.checkpoint();
    }

    fn commit(&self) {
        self.book.commit();
    }

    fn rollback(&self) {
        self.book.rollback();
    }
}
