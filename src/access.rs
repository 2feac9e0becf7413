//! Capabilities, admin authorization and reentrancy protection.
//!
//! ```plain
//! OperationLock:
//!
//!      ┌──────┐   acquire    ┌──────────────┐
//!      │ Free ├─────────────►│ Busy(op)     │
//!      └──▲───┘              └──────┬───────┘
//!         │   guard dropped         │ acquire -> Reentrancy
//!         └─────────────────────────┘
//! ```

use crate::error::{VaultError, VaultResult};
use crate::protocol::{Address, Journal, Journaled};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use tracing::{info, warn};

static NEXT_SERIAL: AtomicU64 = AtomicU64::new(1);

/// Unforgeable proof of a role, such as administering a vault or being the
/// vault an action reports to.
///
/// Only this crate issues capabilities and they cannot be cloned. Two
/// capabilities issued to the same address are still distinct.
#[derive(Debug, PartialEq, Eq)]
pub struct Capability {
    holder: Address,
    serial: u64,
}

impl Capability {
    pub(crate) fn issue(holder: Address) -> Self {
        Self {
            holder,
            serial: NEXT_SERIAL.fetch_add(1, Ordering::Relaxed),
        }
    }

    pub fn holder(&self) -> &Address {
        &self.holder
    }

    pub fn id(&self) -> CapabilityId {
        CapabilityId {
            holder: self.holder.clone(),
            serial: self.serial,
        }
    }
}

/// Public identity of a [`Capability`]. Knowing it does not grant anything.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CapabilityId {
    holder: Address,
    serial: u64,
}

impl CapabilityId {
    pub fn holder(&self) -> &Address {
        &self.holder
    }

    pub fn matches(&self, capability: &Capability) -> bool {
        self.serial == capability.serial && self.holder == capability.holder
    }
}

impl fmt::Display for CapabilityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.holder)
    }
}

/// Operation-in-progress flag for one core component.
///
/// Held for the whole duration of an entry point, so a collaborator calling
/// back into the same component mid-operation is rejected.
pub struct OperationLock {
    component: &'static str,
    active: Mutex<Option<&'static str>>,
}

impl OperationLock {
    pub fn new(component: &'static str) -> Self {
        Self {
            component,
            active: Mutex::new(None),
        }
    }

    fn slot(&self) -> MutexGuard<'_, Option<&'static str>> {
        self.active.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Mark `operation` as running until the returned guard is dropped.
    pub fn acquire(&self, operation: &'static str) -> VaultResult<OperationGuard<'_>> {
        let mut active = self.slot();
        if let Some(running) = *active {
            warn!(
                component = self.component,
                running,
                attempted = operation,
                "Reentrant call rejected"
            );
            return Err(VaultError::Reentrancy {
                component: self.component,
                operation: running,
            });
        }
        *active = Some(operation);
        Ok(OperationGuard { lock: self })
    }

    /// Name of the running operation, if any.
    pub fn active(&self) -> Option<&'static str> {
        *self.slot()
    }
}

/// Releases the [`OperationLock`] on drop.
pub struct OperationGuard<'a> {
    lock: &'a OperationLock,
}

impl Drop for OperationGuard<'_> {
    fn drop(&mut self) {
        *self.lock.slot() = None;
    }
}

/// Single administrator allowed to call privileged entry points.
pub struct Authority {
    admin: Journal<CapabilityId>,
}

impl Authority {
    /// Create the authority together with the only capability it accepts.
    pub fn new(admin: Address) -> (Self, Capability) {
        let capability = Capability::issue(admin);
        let authority = Self {
            admin: Journal::new(capability.id()),
        };
        (authority, capability)
    }

    pub fn admin(&self) -> Address {
        self.admin.read(|admin| admin.holder().clone())
    }

    pub fn ensure(&self, capability: &Capability, operation: &str) -> VaultResult<()> {
        if self.admin.read(|admin| admin.matches(capability)) {
            return Ok(());
        }
        warn!(caller = %capability.holder(), operation, "Unauthorized call rejected");
        Err(VaultError::Unauthorized {
            caller: capability.holder().to_string(),
            operation: operation.to_string(),
        })
    }

    /// Hand administration to `new_admin`, revoking `capability`. Only the
    /// current admin may do so.
    pub fn transfer(&self, capability: &Capability, new_admin: Address) -> VaultResult<Capability> {
        self.ensure(capability, "transfer_admin")?;
        let next = Capability::issue(new_admin);
        info!(from = %capability.holder(), to = %next.holder(), "Admin transferred");
        self.admin.write(|admin| *admin = next.id());
        Ok(next)
    }
}

impl Journaled for Authority {
    fn checkpoint(&self) {
        self.admin.checkpoint();
    }

    fn commit(&self) {
        self.admin.commit();
    }

    fn rollback(&self) {
        self.admin.rollback();
    }
}
