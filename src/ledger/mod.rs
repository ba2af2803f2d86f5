//! External perpetual protocol surface.
//!
//! ## Traits
//! [`PerpLedger`] groups everything the position manager consumes from the
//! protocol: settlement token, margin vault, clearing house, account
//! balance reader, quoter and transactional snapshots. [`PriceOracle`]
//! covers the Chainlink-style price feed.
//!
//! ## Simulation
//! [`SimulatedLedger`] and [`MockAggregator`] implement those traits in
//! memory for scenarios and tests.

pub mod oracle;
pub mod sim;
mod traits;
mod types;

pub use oracle::MockAggregator;
pub use sim::{SimulatedLedger, SimulatedLedgerConfig};
pub use traits::*;
pub use types::*;
