//! Collaborator traits for the external perpetual protocol.
//!
//! The position manager never touches protocol state directly. Everything
//! it needs (token transfers, margin vault, clearing house, position reads,
//! quoting and transactional snapshots) goes through [`PerpLedger`], so a
//! live protocol client and the in-memory simulator are interchangeable.

use super::types::*;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use thiserror::Error;

/// Failure reported by the external protocol. Carried verbatim to callers.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ClearingError {
    #[error("transfer amount exceeds balance: {account} holds {available}, needs {required}")]
    InsufficientBalance {
        account: Address,
        available: Decimal,
        required: Decimal,
    },

    #[error("transfer amount exceeds allowance: {owner} allows {spender} {approved}, needs {required}")]
    InsufficientAllowance {
        owner: Address,
        spender: Address,
        approved: Decimal,
        required: Decimal,
    },

    #[error("not enough free collateral: {available} available, {required} required")]
    NotEnoughFreeCollateral {
        available: Decimal,
        required: Decimal,
    },

    #[error("transaction too old: deadline {deadline} passed at {now}")]
    DeadlineExpired {
        deadline: DateTime<Utc>,
        now: DateTime<Utc>,
    },

    #[error("price limit {limit} crossed: trade would move price to {price}")]
    PriceLimitExceeded { limit: Decimal, price: Decimal },

    #[error("insufficient liquidity in market {0}")]
    InsufficientLiquidity(Address),

    #[error("unknown market {0}")]
    UnknownMarket(Address),

    #[error("unknown token {0}")]
    UnknownToken(Address),

    #[error("no position in market {0}")]
    NoPosition(Address),

    #[error("unknown snapshot {0}")]
    UnknownSnapshot(SnapshotId),

    #[error("invalid amount: {0}")]
    InvalidAmount(String),

    #[error("call reverted: {0}")]
    Reverted(String),
}

/// Capability set of the external perpetual protocol.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PerpLedger: Send + Sync {
    // Settlement token

    /// Address of the settlement (collateral) token.
    fn settlement_token(&self) -> Address;

    /// Native precision of the settlement token.
    fn collateral_decimals(&self) -> u32;

    async fn balance_of(&self, account: &Address) -> Result<Decimal, ClearingError>;

    async fn transfer(
        &self,
        from: &Address,
        to: &Address,
        amount: Decimal,
    ) -> Result<(), ClearingError>;

    async fn approve(
        &self,
        owner: &Address,
        spender: &Address,
        amount: Decimal,
    ) -> Result<(), ClearingError>;

    async fn allowance(&self, owner: &Address, spender: &Address) -> Result<Decimal, ClearingError>;

    // Margin vault

    fn vault_address(&self) -> Address;

    /// Pull `amount` of `token` from `trader` into the vault.
    async fn deposit(
        &self,
        trader: &Address,
        token: &Address,
        amount: Decimal,
    ) -> Result<(), ClearingError>;

    /// Return `amount` of `token` from the vault to `trader`.
    async fn withdraw(
        &self,
        trader: &Address,
        token: &Address,
        amount: Decimal,
    ) -> Result<(), ClearingError>;

    /// Collateral held by the vault for `trader`, realized PnL included.
    async fn get_balance(&self, trader: &Address) -> Result<Decimal, ClearingError>;

    async fn get_free_collateral(&self, trader: &Address) -> Result<Decimal, ClearingError>;

    // Clearing house

    async fn open_position(
        &self,
        trader: &Address,
        params: OpenPositionParams,
    ) -> Result<PositionChanged, ClearingError>;

    async fn close_position(
        &self,
        trader: &Address,
        params: ClosePositionParams,
    ) -> Result<PositionChanged, ClearingError>;

    // Account balance reader

    async fn get_total_position_size(
        &self,
        trader: &Address,
        base_token: &Address,
    ) -> Result<Decimal, ClearingError>;

    async fn get_total_open_notional(
        &self,
        trader: &Address,
        base_token: &Address,
    ) -> Result<Decimal, ClearingError>;

    /// Current market price in quote per base.
    async fn get_mark_price(&self, base_token: &Address) -> Result<Decimal, ClearingError>;

    // Quoter

    async fn quote(&self, params: QuoteParams) -> Result<SwapQuote, ClearingError>;

    // Transactions

    /// Open a ledger-wide transaction on behalf of `owner`.
    ///
    /// Until it is released or reverted, writes for any other account wait,
    /// as does a second `snapshot`. Transactions do not nest.
    async fn snapshot(&self, owner: &Address) -> Result<SnapshotId, ClearingError>;

    /// Undo everything written since `id` was opened and close it.
    async fn revert_to_snapshot(&self, id: SnapshotId) -> Result<(), ClearingError>;

    /// Commit the transaction `id`.
    async fn release_snapshot(&self, id: SnapshotId) -> Result<(), ClearingError>;
}

/// Chainlink-style price feed.
#[async_trait]
pub trait PriceOracle: Send + Sync {
    async fn get_round_data(&self, round_id: u64) -> Result<RoundData, ClearingError>;

    async fn latest_round_data(&self) -> Result<RoundData, ClearingError>;
}
