//! # PerpLemma
//!
//! Exact-collateral position manager on top of a perpetual futures protocol.
//!
//! ## Architecture
//!
//! - `lemma`: Collateral ledger, position controller, rebalancer and access guard
//! - `ledger`: Protocol collaborator traits plus an in-memory simulation
//! - `config`: Configuration management and validation
//! - `persistence`: SQLite-based settings and position journal
//! - `error`: Error taxonomy of manager calls
//! - `utils`: Shared utilities and decimal arithmetic

pub mod config;
pub mod error;
pub mod ledger;
pub mod lemma;
pub mod persistence;
pub mod utils;

pub use config::Config;
pub use error::{LemmaError, LemmaResult};
pub use lemma::PerpLemma;
