//! In-memory perpetual protocol for scenarios and tests.
//!
//! Models just enough of an external perp venue for the position manager to
//! be exercised end to end:
//! - an ERC20-like settlement token with balances and allowances
//! - a margin vault with free-collateral accounting
//! - one constant-product virtual market per base token
//! - ledger-wide transactions (snapshot, then release or revert) so callers
//!   can make multi-step work atomic

use super::traits::{ClearingError, PerpLedger};
use super::types::*;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tracing::{debug, info};

/// Precision of base-token amounts computed by the market.
const BASE_DECIMALS: u32 = 18;

/// Settings for a simulated ledger.
#[derive(Debug, Clone)]
pub struct SimulatedLedgerConfig {
    /// Native precision of the settlement token
    pub collateral_decimals: u32,
    /// Margin required per unit of open notional when exposure grows
    pub initial_margin_ratio: Decimal,
    /// Settlement tokens the vault holds on behalf of makers at start
    pub vault_liquidity: Decimal,
}

impl Default for SimulatedLedgerConfig {
    fn default() -> Self {
        Self {
            collateral_decimals: 6,
            initial_margin_ratio: dec!(0.1),
            vault_liquidity: dec!(1_000_000),
        }
    }
}

/// Constant-product virtual market for one base token.
#[derive(Debug, Clone, PartialEq)]
pub struct VirtualMarket {
    pub base_reserve: Decimal,
    pub quote_reserve: Decimal,
    /// Fee charged on the quote leg (e.g., 0.001 = 0.1%)
    pub fee_ratio: Decimal,
}

impl VirtualMarket {
    /// Quote per base.
    pub fn price(&self) -> Decimal {
        self.quote_reserve / self.base_reserve
    }

    /// Price a trade against the pool without mutating it.
    ///
    /// Returns the trader-signed legs and the market as it would be after
    /// the trade. Fees are charged on the quote leg and leave the pool.
    fn swap(
        &self,
        base_token: &Address,
        is_base_to_quote: bool,
        is_exact_input: bool,
        amount: Decimal,
    ) -> Result<(SwapQuote, VirtualMarket), ClearingError> {
        if amount <= Decimal::ZERO {
            return Err(ClearingError::InvalidAmount(format!(
                "trade amount must be positive, got {amount}"
            )));
        }

        let x = self.base_reserve;
        let y = self.quote_reserve;
        let k = x * y;
        let fee_complement = Decimal::ONE - self.fee_ratio;

        let (base, quote, fee, x_after, y_after) = match (is_base_to_quote, is_exact_input) {
            // Sell exactly `amount` base
            (true, true) => {
                let x_after = x + amount;
                let y_after = k / x_after;
                let gross = (y - y_after).round_dp(BASE_DECIMALS);
                let fee = (gross * self.fee_ratio).round_dp(BASE_DECIMALS);
                (-amount, gross - fee, fee, x_after, y_after)
            }
            // Sell base until exactly `amount` quote is received
            (true, false) => {
                let gross = (amount / fee_complement).round_dp(BASE_DECIMALS);
                if gross >= y {
                    return Err(ClearingError::InsufficientLiquidity(*base_token));
                }
                let y_after = y - gross;
                let x_after = k / y_after;
                let sold = (x_after - x).round_dp(BASE_DECIMALS);
                (-sold, amount, gross - amount, x_after, y_after)
            }
            // Pay exactly `amount` quote for base
            (false, true) => {
                let fee = (amount * self.fee_ratio).round_dp(BASE_DECIMALS);
                let y_after = y + (amount - fee);
                let x_after = k / y_after;
                let bought = (x - x_after).round_dp(BASE_DECIMALS);
                (bought, -amount, fee, x_after, y_after)
            }
            // Buy exactly `amount` base
            (false, false) => {
                if amount >= x {
                    return Err(ClearingError::InsufficientLiquidity(*base_token));
                }
                let x_after = x - amount;
                let y_after = k / x_after;
                let gross = ((y_after - y) / fee_complement).round_dp(BASE_DECIMALS);
                let fee = gross - (y_after - y).round_dp(BASE_DECIMALS);
                (amount, -gross, fee, x_after, y_after)
            }
        };

        let after = VirtualMarket {
            base_reserve: x_after,
            quote_reserve: y_after,
            fee_ratio: self.fee_ratio,
        };
        let quote = SwapQuote {
            exchanged_base: base,
            exchanged_quote: quote,
            fee,
            price_after: after.price(),
        };
        Ok((quote, after))
    }
}

/// Taker position of one trader in one market.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AccountPosition {
    /// Signed base size (long positive)
    pub size: Decimal,
    /// Quote balance of the position (positive for shorts)
    pub open_notional: Decimal,
}

impl AccountPosition {
    /// Apply a fill and return the PnL realized by the reducing part.
    fn apply_fill(&mut self, base: Decimal, quote: Decimal) -> Decimal {
        let increasing = self.size.is_zero() || self.size.is_sign_negative() == base.is_sign_negative();
        if increasing {
            self.size += base;
            self.open_notional += quote;
            return Decimal::ZERO;
        }

        let closing_base = base.abs().min(self.size.abs());
        let ratio = closing_base / self.size.abs();
        let closing_quote = quote * closing_base / base.abs();
        let closed_notional = self.open_notional * ratio;
        let realized = (closing_quote + closed_notional).round_dp(BASE_DECIMALS);

        self.open_notional -= closed_notional;
        if base.is_sign_negative() {
            self.size -= closing_base;
        } else {
            self.size += closing_base;
        }
        if self.size.is_zero() {
            self.open_notional = Decimal::ZERO;
        }

        // Anything beyond the old size opens the opposite side.
        let remainder = base.abs() - closing_base;
        if remainder > Decimal::ZERO {
            self.size += if base.is_sign_negative() { -remainder } else { remainder };
            self.open_notional += quote - closing_quote;
        }

        realized
    }
}

/// Full simulated protocol state.
#[derive(Debug, Clone)]
pub struct LedgerState {
    pub block_timestamp: DateTime<Utc>,
    pub balances: HashMap<Address, Decimal>,
    pub allowances: HashMap<(Address, Address), Decimal>,
    pub vault_balances: HashMap<Address, Decimal>,
    pub markets: HashMap<Address, VirtualMarket>,
    pub positions: HashMap<(Address, Address), AccountPosition>,
    pub events: Vec<LedgerEvent>,
}

impl LedgerState {
    fn new(block_timestamp: DateTime<Utc>) -> Self {
        Self {
            block_timestamp,
            balances: HashMap::new(),
            allowances: HashMap::new(),
            vault_balances: HashMap::new(),
            markets: HashMap::new(),
            positions: HashMap::new(),
            events: Vec::new(),
        }
    }

    /// Copy of everything except the event log, which is rolled back by length.
    fn checkpoint(&self) -> LedgerState {
        LedgerState {
            block_timestamp: self.block_timestamp,
            balances: self.balances.clone(),
            allowances: self.allowances.clone(),
            vault_balances: self.vault_balances.clone(),
            markets: self.markets.clone(),
            positions: self.positions.clone(),
            events: Vec::new(),
        }
    }

    fn balance(&self, account: &Address) -> Decimal {
        self.balances.get(account).copied().unwrap_or(Decimal::ZERO)
    }

    fn transfer(&mut self, from: &Address, to: &Address, amount: Decimal) -> Result<(), ClearingError> {
        let available = self.balance(from);
        if available < amount {
            return Err(ClearingError::InsufficientBalance {
                account: *from,
                available,
                required: amount,
            });
        }
        *self.balances.entry(*from).or_default() -= amount;
        *self.balances.entry(*to).or_default() += amount;
        self.events.push(LedgerEvent::Transfer {
            from: *from,
            to: *to,
            amount,
        });
        Ok(())
    }

    fn check_allowance(&self, owner: &Address, spender: &Address, amount: Decimal) -> Result<(), ClearingError> {
        let approved = self
            .allowances
            .get(&(*owner, *spender))
            .copied()
            .unwrap_or(Decimal::ZERO);
        if approved < amount {
            return Err(ClearingError::InsufficientAllowance {
                owner: *owner,
                spender: *spender,
                approved,
                required: amount,
            });
        }
        Ok(())
    }

    fn spend_allowance(&mut self, owner: &Address, spender: &Address, amount: Decimal) {
        if let Some(approved) = self.allowances.get_mut(&(*owner, *spender)) {
            // Unbounded approvals are never drawn down
            if *approved != Decimal::MAX {
                *approved -= amount;
            }
        }
    }

    fn vault_balance(&self, trader: &Address) -> Decimal {
        self.vault_balances.get(trader).copied().unwrap_or(Decimal::ZERO)
    }

    fn trader_positions<'a>(
        &'a self,
        trader: &'a Address,
    ) -> impl Iterator<Item = (&'a Address, &'a AccountPosition)> + 'a {
        self.positions
            .iter()
            .filter(move |((owner, _), _)| owner == trader)
            .map(|((_, base_token), position)| (base_token, position))
    }

    fn unrealized_pnl(&self, trader: &Address) -> Decimal {
        self.trader_positions(trader)
            .map(|(base_token, position)| {
                let price = self
                    .markets
                    .get(base_token)
                    .map(VirtualMarket::price)
                    .unwrap_or(Decimal::ZERO);
                position.size * price + position.open_notional
            })
            .sum()
    }

    /// Free collateral, possibly negative.
    fn free_collateral(&self, trader: &Address, initial_margin_ratio: Decimal) -> Decimal {
        let collateral = self.vault_balance(trader);
        let account_value = collateral + self.unrealized_pnl(trader);
        let margin_requirement: Decimal = self
            .trader_positions(trader)
            .map(|(_, position)| position.open_notional.abs())
            .sum::<Decimal>()
            * initial_margin_ratio;
        collateral.min(account_value) - margin_requirement
    }

    #[allow(clippy::too_many_arguments)]
    fn trade(
        &mut self,
        trader: &Address,
        base_token: &Address,
        is_base_to_quote: bool,
        is_exact_input: bool,
        amount: Decimal,
        price_limit: Option<Decimal>,
        deadline: Option<DateTime<Utc>>,
        initial_margin_ratio: Decimal,
    ) -> Result<PositionChanged, ClearingError> {
        if let Some(deadline) = deadline {
            if self.block_timestamp > deadline {
                return Err(ClearingError::DeadlineExpired {
                    deadline,
                    now: self.block_timestamp,
                });
            }
        }

        let market = self
            .markets
            .get(base_token)
            .ok_or(ClearingError::UnknownMarket(*base_token))?;
        let (swap, market_after) = market.swap(base_token, is_base_to_quote, is_exact_input, amount)?;

        if let Some(limit) = price_limit.filter(|limit| !limit.is_zero()) {
            let crossed = if is_base_to_quote {
                swap.price_after < limit
            } else {
                swap.price_after > limit
            };
            if crossed {
                return Err(ClearingError::PriceLimitExceeded {
                    limit,
                    price: swap.price_after,
                });
            }
        }

        let key = (*trader, *base_token);
        let previous_market = market.clone();
        let previous_position = self.positions.get(&key).cloned();
        let previous_collateral = self.vault_balance(trader);

        let mut position = previous_position.clone().unwrap_or_default();
        let size_before = position.size;
        let realized_pnl = position.apply_fill(swap.exchanged_base, swap.exchanged_quote);
        let increased_exposure = position.size.abs() > size_before.abs()
            || (!size_before.is_zero()
                && !position.size.is_zero()
                && position.size.is_sign_negative() != size_before.is_sign_negative());

        self.markets.insert(*base_token, market_after);
        self.positions.insert(key, position.clone());
        *self.vault_balances.entry(*trader).or_default() += realized_pnl;

        if increased_exposure {
            let free = self.free_collateral(trader, initial_margin_ratio);
            if free < Decimal::ZERO {
                self.markets.insert(*base_token, previous_market);
                match previous_position {
                    Some(previous) => self.positions.insert(key, previous),
                    None => self.positions.remove(&key),
                };
                self.vault_balances.insert(*trader, previous_collateral);
                return Err(ClearingError::NotEnoughFreeCollateral {
                    available: free + swap.exchanged_quote.abs() * initial_margin_ratio,
                    required: swap.exchanged_quote.abs() * initial_margin_ratio,
                });
            }
        }

        let event = PositionChanged {
            trader: *trader,
            base_token: *base_token,
            exchanged_base: swap.exchanged_base,
            exchanged_quote: swap.exchanged_quote,
            fee: swap.fee,
            open_notional: position.open_notional,
            realized_pnl,
            delta_base_balance: position.size - size_before,
            price_after: swap.price_after,
            timestamp: self.block_timestamp,
        };
        self.events.push(LedgerEvent::PositionChanged(event.clone()));

        info!(
            %trader,
            %base_token,
            exchanged_base = %event.exchanged_base,
            exchanged_quote = %event.exchanged_quote,
            fee = %event.fee,
            realized_pnl = %event.realized_pnl,
            size = %position.size,
            price_after = %event.price_after,
            "Simulated position changed"
        );

        Ok(event)
    }
}

/// Open ledger transaction. Holds the gate until released or reverted.
struct Transaction {
    id: u64,
    owner: Address,
    saved: LedgerState,
    event_count: usize,
    _gate: OwnedMutexGuard<()>,
}

/// In-memory implementation of [`PerpLedger`].
///
/// At most one transaction is open at a time. While one is open, writes
/// on behalf of any other account (and harness writes such as `mint`) wait
/// for it to finish, so a revert only ever undoes the owner's own work.
/// Reads are not gated and may observe uncommitted state.
pub struct SimulatedLedger {
    settlement_token: Address,
    vault: Address,
    config: SimulatedLedgerConfig,
    state: Arc<RwLock<LedgerState>>,
    tx_gate: Arc<Mutex<()>>,
    transaction: Mutex<Option<Transaction>>,
    tx_counter: AtomicU64,
}

impl SimulatedLedger {
    /// Create a ledger with an empty settlement token and a funded vault.
    pub fn new(config: SimulatedLedgerConfig) -> Self {
        let settlement_token = Address::from_label("settlement_token");
        let vault = Address::from_label("vault");

        let mut state = LedgerState::new(Utc::now());
        state.balances.insert(vault, config.vault_liquidity);

        Self {
            settlement_token,
            vault,
            config,
            state: Arc::new(RwLock::new(state)),
            tx_gate: Arc::new(Mutex::new(())),
            transaction: Mutex::new(None),
            tx_counter: AtomicU64::new(1),
        }
    }

    /// Wait out another account's open transaction before writing.
    ///
    /// Returns the gate guard to hold for the write, or `None` when `actor`
    /// owns the open transaction. Harness writes pass `None` and always wait.
    async fn write_gate(&self, actor: Option<&Address>) -> Option<OwnedMutexGuard<()>> {
        let owner = self.transaction.lock().await.as_ref().map(|tx| tx.owner);
        match (owner, actor) {
            (Some(owner), Some(actor)) if owner == *actor => None,
            _ => Some(self.tx_gate.clone().lock_owned().await),
        }
    }

    /// Whether a transaction is currently open.
    pub async fn in_transaction(&self) -> bool {
        self.transaction.lock().await.is_some()
    }

    /// Credit freshly minted settlement tokens.
    pub async fn mint(&self, to: &Address, amount: Decimal) {
        let _gate = self.write_gate(None).await;
        let mut state = self.state.write().await;
        *state.balances.entry(*to).or_default() += amount;
        state.events.push(LedgerEvent::Transfer {
            from: Address::ZERO,
            to: *to,
            amount,
        });
        debug!(%to, %amount, "Minted settlement token");
    }

    /// Register (or replace) the market for `base_token`.
    pub async fn add_market(
        &self,
        base_token: Address,
        base_reserve: Decimal,
        quote_reserve: Decimal,
        fee_ratio: Decimal,
    ) {
        let market = VirtualMarket {
            base_reserve,
            quote_reserve,
            fee_ratio,
        };
        let _gate = self.write_gate(None).await;
        info!(
            %base_token,
            %base_reserve,
            %quote_reserve,
            price = %market.price(),
            %fee_ratio,
            "Simulated market added"
        );
        self.state.write().await.markets.insert(base_token, market);
    }

    pub async fn set_block_timestamp(&self, timestamp: DateTime<Utc>) {
        let _gate = self.write_gate(None).await;
        self.state.write().await.block_timestamp = timestamp;
    }

    pub async fn block_timestamp(&self) -> DateTime<Utc> {
        self.state.read().await.block_timestamp
    }

    pub async fn market(&self, base_token: &Address) -> Option<VirtualMarket> {
        self.state.read().await.markets.get(base_token).cloned()
    }

    /// Every event recorded so far, oldest first.
    pub async fn events(&self) -> Vec<LedgerEvent> {
        self.state.read().await.events.clone()
    }

    pub async fn position_changed_events(&self) -> Vec<PositionChanged> {
        self.state
            .read()
            .await
            .events
            .iter()
            .filter_map(|event| match event {
                LedgerEvent::PositionChanged(changed) => Some(changed.clone()),
                _ => None,
            })
            .collect()
    }

    fn ensure_settlement_token(&self, token: &Address) -> Result<(), ClearingError> {
        if *token != self.settlement_token {
            return Err(ClearingError::UnknownToken(*token));
        }
        Ok(())
    }
}

#[async_trait]
impl PerpLedger for SimulatedLedger {
    fn settlement_token(&self) -> Address {
        self.settlement_token
    }

    fn collateral_decimals(&self) -> u32 {
        self.config.collateral_decimals
    }

    async fn balance_of(&self, account: &Address) -> Result<Decimal, ClearingError> {
        Ok(self.state.read().await.balance(account))
    }

    async fn transfer(&self, from: &Address, to: &Address, amount: Decimal) -> Result<(), ClearingError> {
        if amount.is_sign_negative() {
            return Err(ClearingError::InvalidAmount(format!("negative transfer {amount}")));
        }
        let _gate = self.write_gate(Some(from)).await;
        self.state.write().await.transfer(from, to, amount)
    }

    async fn approve(&self, owner: &Address, spender: &Address, amount: Decimal) -> Result<(), ClearingError> {
        let _gate = self.write_gate(Some(owner)).await;
        let mut state = self.state.write().await;
        state.allowances.insert((*owner, *spender), amount);
        state.events.push(LedgerEvent::Approval {
            owner: *owner,
            spender: *spender,
            amount,
        });
        Ok(())
    }

    async fn allowance(&self, owner: &Address, spender: &Address) -> Result<Decimal, ClearingError> {
        Ok(self
            .state
            .read()
            .await
            .allowances
            .get(&(*owner, *spender))
            .copied()
            .unwrap_or(Decimal::ZERO))
    }

    fn vault_address(&self) -> Address {
        self.vault
    }

    async fn deposit(&self, trader: &Address, token: &Address, amount: Decimal) -> Result<(), ClearingError> {
        self.ensure_settlement_token(token)?;
        if amount <= Decimal::ZERO {
            return Err(ClearingError::InvalidAmount(format!("deposit must be positive, got {amount}")));
        }

        let _gate = self.write_gate(Some(trader)).await;
        let mut state = self.state.write().await;
        state.check_allowance(trader, &self.vault, amount)?;
        state.transfer(trader, &self.vault, amount)?;
        state.spend_allowance(trader, &self.vault, amount);
        *state.vault_balances.entry(*trader).or_default() += amount;
        state.events.push(LedgerEvent::Deposited {
            token: *token,
            trader: *trader,
            amount,
        });

        debug!(%trader, %amount, "Vault deposit");
        Ok(())
    }

    async fn withdraw(&self, trader: &Address, token: &Address, amount: Decimal) -> Result<(), ClearingError> {
        self.ensure_settlement_token(token)?;
        if amount <= Decimal::ZERO {
            return Err(ClearingError::InvalidAmount(format!("withdrawal must be positive, got {amount}")));
        }

        let _gate = self.write_gate(Some(trader)).await;
        let mut state = self.state.write().await;
        let free = state.free_collateral(trader, self.config.initial_margin_ratio);
        if free < amount {
            return Err(ClearingError::NotEnoughFreeCollateral {
                available: free.max(Decimal::ZERO),
                required: amount,
            });
        }
        let vault = self.vault;
        state.transfer(&vault, trader, amount)?;
        *state.vault_balances.entry(*trader).or_default() -= amount;
        state.events.push(LedgerEvent::Withdrawn {
            token: *token,
            trader: *trader,
            amount,
        });

        debug!(%trader, %amount, "Vault withdrawal");
        Ok(())
    }

    async fn get_balance(&self, trader: &Address) -> Result<Decimal, ClearingError> {
        Ok(self.state.read().await.vault_balance(trader))
    }

    async fn get_free_collateral(&self, trader: &Address) -> Result<Decimal, ClearingError> {
        Ok(self
            .state
            .read()
            .await
            .free_collateral(trader, self.config.initial_margin_ratio)
            .max(Decimal::ZERO))
    }

    async fn open_position(
        &self,
        trader: &Address,
        params: OpenPositionParams,
    ) -> Result<PositionChanged, ClearingError> {
        let _gate = self.write_gate(Some(trader)).await;
        self.state.write().await.trade(
            trader,
            &params.base_token,
            params.is_base_to_quote,
            params.is_exact_input,
            params.amount,
            params.price_limit,
            params.deadline,
            self.config.initial_margin_ratio,
        )
    }

    async fn close_position(
        &self,
        trader: &Address,
        params: ClosePositionParams,
    ) -> Result<PositionChanged, ClearingError> {
        let _gate = self.write_gate(Some(trader)).await;
        let mut state = self.state.write().await;
        let size = state
            .positions
            .get(&(*trader, params.base_token))
            .map(|position| position.size)
            .unwrap_or(Decimal::ZERO);
        if size.is_zero() {
            return Err(ClearingError::NoPosition(params.base_token));
        }

        let amount = params.amount.unwrap_or_else(|| size.abs());
        if amount <= Decimal::ZERO || amount > size.abs() {
            return Err(ClearingError::InvalidAmount(format!(
                "close amount {amount} outside (0, {}]",
                size.abs()
            )));
        }

        // Shorts buy back exact base; longs sell exact base.
        let is_base_to_quote = size > Decimal::ZERO;
        state.trade(
            trader,
            &params.base_token,
            is_base_to_quote,
            is_base_to_quote,
            amount,
            params.price_limit,
            params.deadline,
            self.config.initial_margin_ratio,
        )
    }

    async fn get_total_position_size(&self, trader: &Address, base_token: &Address) -> Result<Decimal, ClearingError> {
        Ok(self
            .state
            .read()
            .await
            .positions
            .get(&(*trader, *base_token))
            .map(|position| position.size)
            .unwrap_or(Decimal::ZERO))
    }

    async fn get_total_open_notional(&self, trader: &Address, base_token: &Address) -> Result<Decimal, ClearingError> {
        Ok(self
            .state
            .read()
            .await
            .positions
            .get(&(*trader, *base_token))
            .map(|position| position.open_notional)
            .unwrap_or(Decimal::ZERO))
    }

    async fn get_mark_price(&self, base_token: &Address) -> Result<Decimal, ClearingError> {
        self.state
            .read()
            .await
            .markets
            .get(base_token)
            .map(VirtualMarket::price)
            .ok_or(ClearingError::UnknownMarket(*base_token))
    }

    async fn quote(&self, params: QuoteParams) -> Result<SwapQuote, ClearingError> {
        let state = self.state.read().await;
        let market = state
            .markets
            .get(&params.base_token)
            .ok_or(ClearingError::UnknownMarket(params.base_token))?;
        market
            .swap(
                &params.base_token,
                params.is_base_to_quote,
                params.is_exact_input,
                params.amount,
            )
            .map(|(quote, _)| quote)
    }

    async fn snapshot(&self, owner: &Address) -> Result<SnapshotId, ClearingError> {
        let gate = self.tx_gate.clone().lock_owned().await;
        let state = self.state.read().await;
        let id = self.tx_counter.fetch_add(1, Ordering::SeqCst);
        *self.transaction.lock().await = Some(Transaction {
            id,
            owner: *owner,
            saved: state.checkpoint(),
            event_count: state.events.len(),
            _gate: gate,
        });
        debug!(snapshot = id, %owner, "Ledger transaction opened");
        Ok(SnapshotId(id))
    }

    async fn revert_to_snapshot(&self, id: SnapshotId) -> Result<(), ClearingError> {
        let mut state = self.state.write().await;
        let tx = self.take_transaction(id).await?;
        let events = std::mem::take(&mut state.events);
        *state = tx.saved;
        state.events = events;
        state.events.truncate(tx.event_count);
        debug!(snapshot = id.0, "Ledger transaction reverted");
        Ok(())
    }

    async fn release_snapshot(&self, id: SnapshotId) -> Result<(), ClearingError> {
        self.take_transaction(id).await?;
        debug!(snapshot = id.0, "Ledger transaction released");
        Ok(())
    }
}

impl SimulatedLedger {
    /// Close the open transaction if it is `id`.
    async fn take_transaction(&self, id: SnapshotId) -> Result<Transaction, ClearingError> {
        let mut open = self.transaction.lock().await;
        match open.take() {
            Some(tx) if tx.id == id.0 => Ok(tx),
            other => {
                *open = other;
                Err(ClearingError::UnknownSnapshot(id))
            }
        }
    }
}
