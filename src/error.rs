//! Error types for the position manager.

use crate::ledger::{Address, ClearingError};
use rust_decimal::Decimal;
use std::fmt;
use thiserror::Error;

/// Privileged roles checked at each entry point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Owner,
    UsdIssuer,
    Rebalancer,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Owner => write!(f, "owner"),
            Role::UsdIssuer => write!(f, "usd issuer"),
            Role::Rebalancer => write!(f, "rebalancer"),
        }
    }
}

/// Every failure a position manager call can end with.
///
/// Any error means the call was reverted as a whole.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum LemmaError {
    #[error("caller {caller} is not the {role}")]
    Unauthorized { caller: Address, role: Role },

    #[error("max position reached: resulting notional {resulting} exceeds cap {cap}")]
    MaxPositionExceeded { resulting: Decimal, cap: Decimal },

    #[error("insufficient collateral: {0}")]
    InsufficientCollateral(String),

    #[error("swap constraint violated: {0}")]
    SwapConstraintViolated(String),

    #[error("external call failed: {0}")]
    ExternalCallFailure(#[source] ClearingError),

    #[error("invalid amount: {0}")]
    InvalidAmount(String),

    #[error("close amount {requested} exceeds open position {open}")]
    ExceedsPosition { requested: Decimal, open: Decimal },

    #[error("malformed rebalance params: {0}")]
    MalformedParams(String),
}

impl From<ClearingError> for LemmaError {
    fn from(err: ClearingError) -> Self {
        match err {
            ClearingError::InsufficientBalance { .. } | ClearingError::InsufficientAllowance { .. } => {
                LemmaError::InsufficientCollateral(err.to_string())
            }
            ClearingError::DeadlineExpired { .. } | ClearingError::PriceLimitExceeded { .. } => {
                LemmaError::SwapConstraintViolated(err.to_string())
            }
            other => LemmaError::ExternalCallFailure(other),
        }
    }
}

pub type LemmaResult<T> = Result<T, LemmaError>;
