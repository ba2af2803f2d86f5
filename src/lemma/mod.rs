//! The PerpLemma position manager.
//!
//! Wraps a perpetual protocol behind exact-collateral open/close calls for
//! a single USD issuer, with a privileged rebalancer and owner-gated
//! settings.

mod access;
mod collateral;
mod controller;
mod rebalancer;

#[cfg(test)]
mod tests;

pub use access::{AccessGuard, LemmaSettings};
pub use collateral::{CollateralBalances, CollateralLedger};
pub use controller::{
    CloseOutcome, ControllerConfig, LeverageReport, OpenOutcome, PerpLemma, PositionSnapshot,
};
pub use rebalancer::RebalanceParams;
