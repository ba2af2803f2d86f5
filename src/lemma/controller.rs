//! Exact-collateral position controller.

use super::access::{AccessGuard, LemmaSettings};
use super::collateral::{CollateralBalances, CollateralLedger};
use crate::error::{LemmaError, LemmaResult, Role};
use crate::ledger::{
    Address, ClearingError, ClosePositionParams, OpenPositionParams, PerpLedger, PositionChanged,
    PositionSide, PriceOracle, QuoteParams, ReferrerCode, SnapshotId,
};
use crate::utils::decimal::{safe_div, within_tolerance};
use rust_decimal::Decimal;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// Precision used for notional amounts sent to the clearing house.
const NOTIONAL_DECIMALS: u32 = 18;

/// Static parameters fixed when the manager is deployed.
#[derive(Debug, Clone, PartialEq)]
pub struct ControllerConfig {
    /// Account the manager trades from
    pub address: Address,
    pub base_token: Address,
    /// Side taken by exact-collateral opens
    pub direction: PositionSide,
    /// Position notional per unit of collateral value
    pub target_leverage: Decimal,
}

/// Result of an exact-collateral open.
#[derive(Debug, Clone, Serialize)]
pub struct OpenOutcome {
    pub event: PositionChanged,
    pub collateral_deployed: Decimal,
    pub notional: Decimal,
}

/// Result of a (partial) close.
#[derive(Debug, Clone, Serialize)]
pub struct CloseOutcome {
    pub event: PositionChanged,
    pub collateral_released: Decimal,
}

/// Current position as reported by the account balance reader.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PositionSnapshot {
    pub size: Decimal,
    pub open_notional: Decimal,
    /// Vault collateral not backing open notional
    pub free_collateral: Decimal,
}

impl PositionSnapshot {
    pub fn side(&self) -> Option<PositionSide> {
        if self.size > Decimal::ZERO {
            Some(PositionSide::Long)
        } else if self.size < Decimal::ZERO {
            Some(PositionSide::Short)
        } else {
            None
        }
    }
}

/// Position value relative to deployed collateral value.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LeverageReport {
    pub deployed_collateral: Decimal,
    pub collateral_price: Decimal,
    pub position_size: Decimal,
    pub mark_price: Decimal,
    /// `|size| × mark / (deployed × collateral_price)`
    pub leverage: Decimal,
}

impl LeverageReport {
    pub fn is_within(&self, target: Decimal, tolerance: Decimal) -> bool {
        within_tolerance(self.leverage, target, tolerance)
    }
}

/// Position manager that turns collateral into a leveraged perp position.
///
/// Every ledger-touching operation runs inside one ledger snapshot and is
/// reverted as a whole on failure.
pub struct PerpLemma {
    pub(super) config: ControllerConfig,
    pub(super) ledger: Arc<dyn PerpLedger>,
    pub(super) oracle: Arc<dyn PriceOracle>,
    pub(super) guard: AccessGuard,
    pub(super) collateral: CollateralLedger,
    pub(super) tx_lock: Mutex<()>,
}

impl PerpLemma {
    /// Create a manager trading from `config.address`.
    pub fn new(
        config: ControllerConfig,
        settings: LemmaSettings,
        ledger: Arc<dyn PerpLedger>,
        oracle: Arc<dyn PriceOracle>,
    ) -> Self {
        info!(
            address = %config.address,
            base_token = %config.base_token,
            owner = %settings.owner,
            usd_issuer = %settings.usd_issuer,
            direction = %config.direction,
            target_leverage = %config.target_leverage,
            "Position manager initialized"
        );
        let collateral = CollateralLedger::new(config.address, ledger.clone());
        Self {
            config,
            ledger,
            oracle,
            guard: AccessGuard::new(settings),
            collateral,
            tx_lock: Mutex::new(()),
        }
    }

    pub fn address(&self) -> Address {
        self.config.address
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    pub fn collateral(&self) -> &CollateralLedger {
        &self.collateral
    }

    pub async fn settings(&self) -> LemmaSettings {
        self.guard.settings().await
    }

    // Configuration

    pub async fn set_usd_issuer(&self, caller: &Address, usd_issuer: Address) -> LemmaResult<()> {
        self.guard.set_usd_issuer(caller, usd_issuer).await
    }

    pub async fn set_rebalancer(&self, caller: &Address, rebalancer: Address) -> LemmaResult<()> {
        self.guard.set_rebalancer(caller, rebalancer).await
    }

    pub async fn set_referrer_code(&self, caller: &Address, code: ReferrerCode) -> LemmaResult<()> {
        self.guard.set_referrer_code(caller, code).await
    }

    pub async fn set_max_position(&self, caller: &Address, max_position: Decimal) -> LemmaResult<()> {
        self.guard.set_max_position(caller, max_position).await
    }

    pub async fn transfer_ownership(&self, caller: &Address, new_owner: Address) -> LemmaResult<()> {
        self.guard.transfer_ownership(caller, new_owner).await
    }

    /// Approve the vault to pull any amount of settlement token. Callable by anyone.
    pub async fn reset_approvals(&self) -> LemmaResult<()> {
        let vault = self.ledger.vault_address();
        let _tx = self.tx_lock.lock().await;
        let current = self.ledger.allowance(&self.config.address, &vault).await?;
        if current == Decimal::MAX {
            debug!(%vault, "Vault approval already unlimited");
            return Ok(());
        }
        self.ledger
            .approve(&self.config.address, &vault, Decimal::MAX)
            .await?;
        debug!(%vault, previous = %current, "Vault approval reset");
        Ok(())
    }

    // Position control

    /// Deposit `collateral_amount` and open a position of the collateral-implied notional.
    ///
    /// Fails with `MaxPositionExceeded` when the resulting open notional
    /// would exceed the configured cap. Nothing is committed on failure.
    pub async fn open_with_exact_collateral(
        &self,
        caller: &Address,
        collateral_amount: Decimal,
    ) -> LemmaResult<OpenOutcome> {
        self.guard.ensure(caller, Role::UsdIssuer).await?;
        let amount = self.collateral.normalize(collateral_amount);
        if amount <= Decimal::ZERO {
            return Err(LemmaError::InvalidAmount(format!(
                "collateral amount must be positive, got {collateral_amount}"
            )));
        }

        let _tx = self.tx_lock.lock().await;
        let snapshot = self.ledger.snapshot(&self.config.address).await?;
        let result = self.open_in_snapshot(amount).await;
        self.commit_or_revert(snapshot, result, "open").await
    }

    async fn open_in_snapshot(&self, amount: Decimal) -> LemmaResult<OpenOutcome> {
        let settings = self.guard.settings().await;
        let collateral_price = self.collateral_price().await?;
        let notional = amount
            .checked_mul(collateral_price)
            .and_then(|value| value.checked_mul(self.config.target_leverage))
            .ok_or_else(|| overflow("open notional", amount))?
            .round_dp(NOTIONAL_DECIMALS);

        let current = self
            .ledger
            .get_total_open_notional(&self.config.address, &self.config.base_token)
            .await?
            .abs();
        let resulting = current
            .checked_add(notional)
            .ok_or_else(|| overflow("resulting open notional", amount))?;
        if resulting > settings.max_position {
            warn!(
                %amount,
                %resulting,
                cap = %settings.max_position,
                "Open rejected: max position reached"
            );
            return Err(LemmaError::MaxPositionExceeded {
                resulting,
                cap: settings.max_position,
            });
        }

        self.collateral.deploy(amount).await?;

        // The quote leg is pinned to `notional` on both sides.
        let (is_base_to_quote, is_exact_input) = match self.config.direction {
            PositionSide::Short => (true, false),
            PositionSide::Long => (false, true),
        };
        let event = self
            .ledger
            .open_position(
                &self.config.address,
                OpenPositionParams {
                    base_token: self.config.base_token,
                    is_base_to_quote,
                    is_exact_input,
                    amount: notional,
                    price_limit: None,
                    deadline: None,
                    referral_code: settings.referrer_code,
                },
            )
            .await?;

        info!(
            collateral = %amount,
            %notional,
            exchanged_base = %event.exchanged_base,
            open_notional = %event.open_notional,
            direction = %self.config.direction,
            "Opened with exact collateral"
        );

        Ok(OpenOutcome {
            event,
            collateral_deployed: amount,
            notional,
        })
    }

    /// Close `amount` of base size and pull the freed collateral back.
    ///
    /// The released share is `deployed × amount / |size|`, so closing half
    /// twice releases what closing the whole position once would.
    pub async fn close_with_exact_collateral(
        &self,
        caller: &Address,
        amount: Decimal,
    ) -> LemmaResult<CloseOutcome> {
        self.guard.ensure(caller, Role::UsdIssuer).await?;
        if amount <= Decimal::ZERO {
            return Err(LemmaError::InvalidAmount(format!(
                "close amount must be positive, got {amount}"
            )));
        }

        let _tx = self.tx_lock.lock().await;
        let snapshot = self.ledger.snapshot(&self.config.address).await?;
        let result = self.close_in_snapshot(amount).await;
        self.commit_or_revert(snapshot, result, "close").await
    }

    async fn close_in_snapshot(&self, amount: Decimal) -> LemmaResult<CloseOutcome> {
        let size = self
            .ledger
            .get_total_position_size(&self.config.address, &self.config.base_token)
            .await?;
        if amount > size.abs() {
            return Err(LemmaError::ExceedsPosition {
                requested: amount,
                open: size.abs(),
            });
        }

        let settings = self.guard.settings().await;
        let event = self
            .ledger
            .close_position(
                &self.config.address,
                ClosePositionParams {
                    base_token: self.config.base_token,
                    amount: Some(amount),
                    price_limit: None,
                    deadline: None,
                    referral_code: settings.referrer_code,
                },
            )
            .await?;

        let deployed = self.collateral.deployed().await?;
        let share = if amount == size.abs() {
            deployed
        } else {
            deployed
                .checked_mul(amount)
                .and_then(|value| value.checked_div(size.abs()))
                .ok_or_else(|| overflow("released collateral share", amount))?
        };
        let free = self
            .ledger
            .get_free_collateral(&self.config.address)
            .await?;
        let release = self.collateral.normalize(share.min(free));
        if release > Decimal::ZERO {
            self.collateral.reclaim(release).await?;
        }

        info!(
            %amount,
            exchanged_quote = %event.exchanged_quote,
            realized_pnl = %event.realized_pnl,
            collateral_released = %release,
            "Closed with exact collateral"
        );

        Ok(CloseOutcome {
            event,
            collateral_released: release,
        })
    }

    /// Send un-deployed collateral out of the manager.
    pub async fn release_collateral(
        &self,
        caller: &Address,
        to: &Address,
        amount: Decimal,
    ) -> LemmaResult<()> {
        self.guard.ensure(caller, Role::UsdIssuer).await?;
        let amount = self.collateral.normalize(amount);
        if amount <= Decimal::ZERO {
            return Err(LemmaError::InvalidAmount(format!(
                "release amount must be positive, got {amount}"
            )));
        }
        let _tx = self.tx_lock.lock().await;
        self.collateral.send(to, amount).await
    }

    // Reads

    pub async fn position(&self) -> LemmaResult<PositionSnapshot> {
        let size = self
            .ledger
            .get_total_position_size(&self.config.address, &self.config.base_token)
            .await?;
        let open_notional = self
            .ledger
            .get_total_open_notional(&self.config.address, &self.config.base_token)
            .await?;
        let free_collateral = self
            .ledger
            .get_free_collateral(&self.config.address)
            .await?;
        Ok(PositionSnapshot {
            size,
            open_notional,
            free_collateral,
        })
    }

    pub async fn collateral_balances(&self) -> LemmaResult<CollateralBalances> {
        self.collateral.balances().await
    }

    pub async fn leverage(&self) -> LemmaResult<LeverageReport> {
        let deployed_collateral = self.collateral.deployed().await?;
        let collateral_price = self.collateral_price().await?;
        let position_size = self
            .ledger
            .get_total_position_size(&self.config.address, &self.config.base_token)
            .await?;
        let mark_price = self.ledger.get_mark_price(&self.config.base_token).await?;
        let position_value = position_size
            .abs()
            .checked_mul(mark_price)
            .ok_or_else(|| overflow("position value", position_size))?;
        let collateral_value = deployed_collateral
            .checked_mul(collateral_price)
            .ok_or_else(|| overflow("deployed collateral value", deployed_collateral))?;
        let leverage = safe_div(position_value, collateral_value);
        Ok(LeverageReport {
            deployed_collateral,
            collateral_price,
            position_size,
            mark_price,
            leverage,
        })
    }

    /// Collateral matching a base amount at the current pool price.
    ///
    /// `is_short = true` prices selling `base_amount` (opening a short);
    /// `false` prices buying it back.
    pub async fn get_collateral_amount_given_underlying_asset_amount(
        &self,
        base_amount: Decimal,
        is_short: bool,
    ) -> LemmaResult<Decimal> {
        if base_amount <= Decimal::ZERO {
            return Err(LemmaError::InvalidAmount(format!(
                "base amount must be positive, got {base_amount}"
            )));
        }
        let quote = self
            .ledger
            .quote(QuoteParams {
                base_token: self.config.base_token,
                is_base_to_quote: is_short,
                is_exact_input: is_short,
                amount: base_amount,
            })
            .await?;
        let collateral_price = self.collateral_price().await?;
        let collateral = quote
            .exchanged_quote
            .abs()
            .checked_div(collateral_price)
            .and_then(|value| value.checked_div(self.config.target_leverage))
            .ok_or_else(|| overflow("collateral for base amount", base_amount))?;
        Ok(self.collateral.normalize(collateral))
    }

    pub(super) async fn collateral_price(&self) -> LemmaResult<Decimal> {
        let round = self.oracle.latest_round_data().await?;
        if round.answer <= Decimal::ZERO {
            return Err(LemmaError::ExternalCallFailure(ClearingError::Reverted(format!(
                "oracle round {} answered non-positive price {}",
                round.round_id, round.answer
            ))));
        }
        Ok(round.answer)
    }

    /// Release the snapshot on success, revert to it on failure.
    pub(super) async fn commit_or_revert<T>(
        &self,
        snapshot: SnapshotId,
        result: LemmaResult<T>,
        operation: &'static str,
    ) -> LemmaResult<T> {
        match result {
            Ok(value) => {
                self.ledger.release_snapshot(snapshot).await?;
                Ok(value)
            }
            Err(err) => {
                warn!(operation, error = %err, "Reverting ledger to snapshot");
                if let Err(revert_err) = self.ledger.revert_to_snapshot(snapshot).await {
                    error!(operation, error = %revert_err, "CRITICAL: ledger revert failed");
                }
                Err(err)
            }
        }
    }
}

fn overflow(what: &str, input: Decimal) -> LemmaError {
    LemmaError::InvalidAmount(format!("{what} out of range for input {input}"))
}
