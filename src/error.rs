//! Error taxonomy for vault and action operations.
//!
//! Every error aborts the enclosing operation and reverts all of its state
//! changes. Retrying is left to the caller.

use serde::Serialize;
use std::fmt;
use thiserror::Error;

/// Result alias used across the core.
pub type VaultResult<T> = Result<T, VaultError>;

/// External collaborator that produced a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Component {
    DepositAsset,
    Wrapper,
    Oracle,
    Controller,
    Whitelist,
    Venue,
}

impl fmt::Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Component::DepositAsset => write!(f, "deposit asset"),
            Component::Wrapper => write!(f, "collateral wrapper"),
            Component::Oracle => write!(f, "oracle"),
            Component::Controller => write!(f, "options controller"),
            Component::Whitelist => write!(f, "whitelist"),
            Component::Venue => write!(f, "order venue"),
        }
    }
}

/// Coarse error classes callers can branch on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ErrorKind {
    Validation,
    State,
    Slippage,
    Authorization,
    ExternalFailure,
    Expiry,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VaultError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("operation not allowed in current state: {0}")]
    State(String),

    #[error("reentrant call into {component} rejected while {operation} is in progress")]
    Reentrancy {
        component: &'static str,
        operation: &'static str,
    },

    #[error("slippage bound breached: expected at least {minimum}, got {actual}")]
    Slippage { minimum: u128, actual: u128 },

    #[error("caller {caller} is not authorized to {operation}")]
    Unauthorized { caller: String, operation: String },

    #[error("{component} call failed: {reason}")]
    External { component: Component, reason: String },

    #[error("expiry window violated: {0}")]
    Expiry(String),

    #[error("arithmetic error: {0}")]
    Arithmetic(String),
}

impl VaultError {
    /// Taxonomy class of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            VaultError::Validation(_) | VaultError::Arithmetic(_) => ErrorKind::Validation,
            VaultError::State(_) | VaultError::Reentrancy { .. } => ErrorKind::State,
            VaultError::Slippage { .. } => ErrorKind::Slippage,
            VaultError::Unauthorized { .. } => ErrorKind::Authorization,
            VaultError::External { .. } => ErrorKind::ExternalFailure,
            VaultError::Expiry(_) => ErrorKind::Expiry,
        }
    }

    pub fn external(component: Component, reason: impl Into<String>) -> Self {
        VaultError::External {
            component,
            reason: reason.into(),
        }
    }
}
