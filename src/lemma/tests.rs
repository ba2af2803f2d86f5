//! End-to-end scenarios for the position manager on the simulated ledger.

use super::*;
use crate::error::{LemmaError, Role};
use crate::ledger::{
    Address, ClearingError, MockAggregator, MockPerpLedger, PerpLedger, PositionSide,
    SimulatedLedger, SimulatedLedgerConfig, SnapshotId,
};
use chrono::{Duration, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::Arc;

const LEVERAGE_TOLERANCE: Decimal = dec!(0.031);

struct Harness {
    ledger: Arc<SimulatedLedger>,
    oracle: Arc<MockAggregator>,
    lemma: PerpLemma,
    owner: Address,
    usd_lemma: Address,
    rebalancer: Address,
}

impl Harness {
    async fn new() -> Self {
        Self::with(PositionSide::Short, Decimal::ONE).await
    }

    async fn with(direction: PositionSide, target_leverage: Decimal) -> Self {
        let ledger = Arc::new(SimulatedLedger::new(SimulatedLedgerConfig::default()));
        let base_token = Address::from_label("vETH");
        ledger
            .add_market(base_token, dec!(10000), dec!(1000000), dec!(0.001))
            .await;
        let oracle = Arc::new(MockAggregator::new(Decimal::ONE));

        let owner = Address::from_label("owner");
        let usd_lemma = Address::from_label("usd_lemma");
        let rebalancer = Address::from_label("rebalancer");

        let lemma = PerpLemma::new(
            ControllerConfig {
                address: Address::from_label("perp_lemma"),
                base_token,
                direction,
                target_leverage,
            },
            LemmaSettings::new(owner, usd_lemma),
            ledger.clone(),
            oracle.clone(),
        );
        lemma.reset_approvals().await.unwrap();
        lemma.set_rebalancer(&owner, rebalancer).await.unwrap();
        ledger.mint(&usd_lemma, dec!(10000)).await;

        Self {
            ledger,
            oracle,
            lemma,
            owner,
            usd_lemma,
            rebalancer,
        }
    }

    /// USD issuer hands collateral to the manager.
    async fn fund(&self, amount: Decimal) {
        self.lemma
            .collateral()
            .receive(&self.usd_lemma, amount)
            .await
            .unwrap();
    }

    async fn open(&self, amount: Decimal) -> OpenOutcome {
        self.fund(amount).await;
        self.lemma
            .open_with_exact_collateral(&self.usd_lemma, amount)
            .await
            .unwrap()
    }
}

/// Short 1x manager on a shared ledger, funded by `usd_lemma`.
async fn manager_on(ledger: &Arc<SimulatedLedger>, label: &str, usd_lemma: Address) -> Arc<PerpLemma> {
    let lemma = PerpLemma::new(
        ControllerConfig {
            address: Address::from_label(label),
            base_token: Address::from_label("vETH"),
            direction: PositionSide::Short,
            target_leverage: Decimal::ONE,
        },
        LemmaSettings::new(Address::from_label("owner"), usd_lemma),
        ledger.clone(),
        Arc::new(MockAggregator::new(Decimal::ONE)),
    );
    lemma.reset_approvals().await.unwrap();
    Arc::new(lemma)
}

#[tokio::test]
async fn test_reset_approvals_grants_unlimited_vault_allowance() {
    let h = Harness::new().await;
    let vault = h.ledger.vault_address();
    assert_eq!(
        h.ledger.allowance(&h.lemma.address(), &vault).await.unwrap(),
        Decimal::MAX
    );

    // Already unlimited: no second approval
    let before = h.ledger.events().await.len();
    h.lemma.reset_approvals().await.unwrap();
    assert_eq!(h.ledger.events().await.len(), before);

    // Spent-down allowance is restored
    h.ledger
        .approve(&h.lemma.address(), &vault, dec!(5))
        .await
        .unwrap();
    h.lemma.reset_approvals().await.unwrap();
    assert_eq!(
        h.ledger.allowance(&h.lemma.address(), &vault).await.unwrap(),
        Decimal::MAX
    );
}

#[tokio::test]
async fn test_owner_settings_round_trip() {
    let h = Harness::new().await;
    let signer1 = Address::from_label("signer1");

    h.lemma.set_usd_issuer(&h.owner, signer1).await.unwrap();
    h.lemma
        .set_referrer_code(&h.owner, "Hello World".parse().unwrap())
        .await
        .unwrap();

    let settings = h.lemma.settings().await;
    assert_eq!(settings.usd_issuer, signer1);
    assert_eq!(settings.referrer_code.as_string(), "Hello World");

    let err = h.lemma.set_usd_issuer(&signer1, signer1).await.unwrap_err();
    assert!(err.to_string().contains("is not the owner"));
}

#[tokio::test]
async fn test_max_position_cap() {
    let h = Harness::new().await;
    h.lemma.set_max_position(&h.owner, dec!(1)).await.unwrap();

    h.open(dec!(1)).await;
    h.fund(dec!(1)).await;
    let before = h.lemma.collateral_balances().await.unwrap();
    let position_before = h.lemma.position().await.unwrap();

    let err = h
        .lemma
        .open_with_exact_collateral(&h.usd_lemma, dec!(1))
        .await
        .unwrap_err();
    assert_eq!(
        err,
        LemmaError::MaxPositionExceeded {
            resulting: dec!(2),
            cap: dec!(1)
        }
    );
    assert!(err.to_string().contains("max position reached"));

    assert_eq!(h.lemma.collateral_balances().await.unwrap(), before);
    assert_eq!(h.lemma.position().await.unwrap(), position_before);
}

#[tokio::test]
async fn test_open_emits_position_changed() {
    let h = Harness::new().await;
    let outcome = h.open(dec!(100)).await;

    assert_eq!(outcome.collateral_deployed, dec!(100));
    assert_eq!(outcome.notional, dec!(100));
    assert_eq!(outcome.event.trader, h.lemma.address());
    assert_eq!(outcome.event.exchanged_quote, dec!(100));
    assert!(outcome.event.exchanged_base < Decimal::ZERO);

    let events = h.ledger.position_changed_events().await;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0], outcome.event);

    let balances = h.lemma.collateral_balances().await.unwrap();
    assert_eq!(balances.undeployed, Decimal::ZERO);
    assert_eq!(balances.deployed, dec!(100));
}

#[tokio::test]
async fn test_open_notional_follows_collateral_price() {
    let h = Harness::new().await;
    h.oracle.set_price(dec!(2)).await;
    assert_eq!(h.open(dec!(10)).await.notional, dec!(20));

    // The round written last prices the next open, even with a lower id
    let now = Utc::now();
    h.oracle.set_latest_round_data(3, dec!(3), now, now, 3).await;
    h.oracle.set_latest_round_data(0, dec!(1.5), now, now, 0).await;
    assert_eq!(h.open(dec!(10)).await.notional, dec!(15));
}

#[tokio::test]
async fn test_oversized_open_is_rejected_not_panicking() {
    let h = Harness::new().await;
    h.oracle.set_price(dec!(100)).await;

    let err = h
        .lemma
        .open_with_exact_collateral(&h.usd_lemma, Decimal::MAX / dec!(10))
        .await
        .unwrap_err();
    assert!(matches!(err, LemmaError::InvalidAmount(_)), "{err:?}");
    assert!(!h.ledger.in_transaction().await);

    // The manager stays usable afterwards
    h.oracle.set_price(Decimal::ONE).await;
    assert_eq!(h.open(dec!(1)).await.notional, dec!(1));
}

#[tokio::test]
async fn test_open_lands_at_target_leverage() {
    for direction in [PositionSide::Short, PositionSide::Long] {
        let h = Harness::with(direction, Decimal::ONE).await;
        h.open(dec!(1000)).await;

        let report = h.lemma.leverage().await.unwrap();
        assert!(
            report.is_within(Decimal::ONE, LEVERAGE_TOLERANCE),
            "{direction} leverage {}",
            report.leverage
        );
        let side = h.lemma.position().await.unwrap().side();
        assert_eq!(side, Some(direction));
    }
}

#[tokio::test]
async fn test_open_without_collateral_fails() {
    let h = Harness::new().await;
    h.fund(dec!(50)).await;

    let err = h
        .lemma
        .open_with_exact_collateral(&h.usd_lemma, dec!(100))
        .await
        .unwrap_err();
    assert!(matches!(err, LemmaError::InsufficientCollateral(_)));
    assert_eq!(h.lemma.collateral().undeployed().await.unwrap(), dec!(50));
    assert!(h.ledger.position_changed_events().await.is_empty());
}

#[tokio::test]
async fn test_rejected_trade_reverts_deposit() {
    // 20x on a 10% initial margin ratio cannot be opened
    let h = Harness::with(PositionSide::Short, dec!(20)).await;
    h.fund(dec!(100)).await;

    let err = h
        .lemma
        .open_with_exact_collateral(&h.usd_lemma, dec!(100))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        LemmaError::ExternalCallFailure(ClearingError::NotEnoughFreeCollateral { .. })
    ));

    let balances = h.lemma.collateral_balances().await.unwrap();
    assert_eq!(balances.undeployed, dec!(100));
    assert_eq!(balances.deployed, Decimal::ZERO);
}

#[tokio::test]
async fn test_only_usd_issuer_opens_and_closes() {
    let h = Harness::new().await;
    h.open(dec!(10)).await;

    let err = h
        .lemma
        .open_with_exact_collateral(&h.owner, dec!(1))
        .await
        .unwrap_err();
    assert_eq!(
        err,
        LemmaError::Unauthorized {
            caller: h.owner,
            role: Role::UsdIssuer
        }
    );
    assert!(h
        .lemma
        .close_with_exact_collateral(&h.rebalancer, dec!(0.01))
        .await
        .is_err());
    assert!(h
        .lemma
        .release_collateral(&h.owner, &h.owner, dec!(1))
        .await
        .is_err());
}

#[tokio::test]
async fn test_full_close_returns_collateral() {
    let h = Harness::new().await;
    h.open(dec!(100)).await;
    let size = h.lemma.position().await.unwrap().size.abs();

    let outcome = h
        .lemma
        .close_with_exact_collateral(&h.usd_lemma, size)
        .await
        .unwrap();

    assert_eq!(h.lemma.position().await.unwrap().size, Decimal::ZERO);
    assert_eq!(outcome.event.exchanged_base, size);
    // Round trip pays two fees plus slippage
    assert!(outcome.collateral_released > dec!(99.5));
    assert!(outcome.collateral_released < dec!(100));
    assert_eq!(
        h.lemma.collateral().undeployed().await.unwrap(),
        outcome.collateral_released
    );
}

#[tokio::test]
async fn test_half_then_remainder_close_matches_full_close() {
    let whole = Harness::new().await;
    whole.open(dec!(100)).await;
    let size = whole.lemma.position().await.unwrap().size.abs();
    let full = whole
        .lemma
        .close_with_exact_collateral(&whole.usd_lemma, size)
        .await
        .unwrap();

    let halves = Harness::new().await;
    halves.open(dec!(100)).await;
    let first = halves
        .lemma
        .close_with_exact_collateral(&halves.usd_lemma, size / dec!(2))
        .await
        .unwrap();
    let rest = halves.lemma.position().await.unwrap().size.abs();
    let second = halves
        .lemma
        .close_with_exact_collateral(&halves.usd_lemma, rest)
        .await
        .unwrap();

    let total = first.collateral_released + second.collateral_released;
    assert!(
        (total - full.collateral_released).abs() <= dec!(0.01),
        "halves {total} vs full {}",
        full.collateral_released
    );
    assert_eq!(halves.lemma.position().await.unwrap().size, Decimal::ZERO);
}

#[tokio::test]
async fn test_two_exact_half_closes_match_one_full_close() {
    let whole = Harness::new().await;
    whole.open(dec!(100)).await;
    let size = whole.lemma.position().await.unwrap().size.abs();
    let full = whole
        .lemma
        .close_with_exact_collateral(&whole.usd_lemma, size)
        .await
        .unwrap();

    let halves = Harness::new().await;
    halves.open(dec!(100)).await;
    let half = size / dec!(2);
    assert_eq!(half * dec!(2), size);
    let mut released = Decimal::ZERO;
    for _ in 0..2 {
        let outcome = halves
            .lemma
            .close_with_exact_collateral(&halves.usd_lemma, half)
            .await
            .unwrap();
        assert_eq!(outcome.event.exchanged_base, half);
        released += outcome.collateral_released;
    }

    assert_eq!(halves.lemma.position().await.unwrap().size, Decimal::ZERO);
    assert!(
        (released - full.collateral_released).abs() <= dec!(0.01),
        "halves {released} vs full {}",
        full.collateral_released
    );
}

#[tokio::test]
async fn test_close_more_than_open_fails() {
    let h = Harness::new().await;
    h.open(dec!(100)).await;
    let size = h.lemma.position().await.unwrap().size.abs();

    let err = h
        .lemma
        .close_with_exact_collateral(&h.usd_lemma, size + dec!(1))
        .await
        .unwrap_err();
    assert!(matches!(err, LemmaError::ExceedsPosition { .. }));

    let err = h
        .lemma
        .close_with_exact_collateral(&h.usd_lemma, Decimal::ZERO)
        .await
        .unwrap_err();
    assert!(matches!(err, LemmaError::InvalidAmount(_)));
}

#[tokio::test]
async fn test_rebalance_moves_size_by_signed_amount() {
    let h = Harness::new().await;
    h.open(dec!(1000)).await;
    let aux = RebalanceParams::unbounded().encode();

    let before = h.lemma.position().await.unwrap().size;
    let event = h
        .lemma
        .rebalance(&h.usd_lemma, &h.rebalancer, dec!(0.5), &aux)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event.exchanged_base, dec!(0.5));
    let after_buy = h.lemma.position().await.unwrap().size;
    assert_eq!(after_buy, before + dec!(0.5));

    let event = h
        .lemma
        .rebalance(&h.rebalancer, &h.rebalancer, dec!(-0.25), &aux)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event.exchanged_base, dec!(-0.25));
    assert_eq!(h.lemma.position().await.unwrap().size, after_buy - dec!(0.25));
}

#[tokio::test]
async fn test_zero_rebalance_is_noop() {
    let h = Harness::new().await;
    h.open(dec!(100)).await;
    let events_before = h.ledger.events().await.len();

    let result = h
        .lemma
        .rebalance(
            &h.rebalancer,
            &h.rebalancer,
            Decimal::ZERO,
            &RebalanceParams::unbounded().encode(),
        )
        .await
        .unwrap();
    assert!(result.is_none());
    assert_eq!(h.ledger.events().await.len(), events_before);
}

#[tokio::test]
async fn test_rebalance_authorization() {
    let h = Harness::new().await;
    h.open(dec!(100)).await;
    let aux = RebalanceParams::unbounded().encode();
    let stranger = Address::from_label("stranger");

    let err = h
        .lemma
        .rebalance(&stranger, &h.rebalancer, dec!(0.1), &aux)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        LemmaError::Unauthorized {
            role: Role::Rebalancer,
            ..
        }
    ));
    assert!(h
        .lemma
        .rebalance(&h.usd_lemma, &stranger, dec!(0.1), &aux)
        .await
        .is_err());
}

#[tokio::test]
async fn test_rebalance_expired_deadline_reverts() {
    let h = Harness::new().await;
    h.open(dec!(100)).await;
    let now = Utc::now();
    h.ledger.set_block_timestamp(now).await;
    let aux = RebalanceParams::new(None, Some(now - Duration::hours(1)))
        .unwrap()
        .encode();
    let before = h.lemma.position().await.unwrap();

    let err = h
        .lemma
        .rebalance(&h.rebalancer, &h.rebalancer, dec!(0.1), &aux)
        .await
        .unwrap_err();
    assert!(matches!(err, LemmaError::SwapConstraintViolated(_)));
    assert_eq!(h.lemma.position().await.unwrap(), before);
}

#[tokio::test]
async fn test_rebalance_price_limit() {
    let h = Harness::new().await;
    h.open(dec!(100)).await;
    // Buying pushes the price above 99
    let aux = RebalanceParams::new(Some(dec!(99)), None).unwrap().encode();

    let err = h
        .lemma
        .rebalance(&h.rebalancer, &h.rebalancer, dec!(0.1), &aux)
        .await
        .unwrap_err();
    assert!(matches!(err, LemmaError::SwapConstraintViolated(_)));
}

#[tokio::test]
async fn test_malformed_rebalance_params() {
    let h = Harness::new().await;
    let err = h
        .lemma
        .rebalance(&h.rebalancer, &h.rebalancer, dec!(0.1), &[1, 2, 3])
        .await
        .unwrap_err();
    assert!(matches!(err, LemmaError::MalformedParams(_)));
}

#[tokio::test]
async fn test_release_collateral() {
    let h = Harness::new().await;
    h.fund(dec!(40)).await;
    let treasury = Address::from_label("treasury");

    h.lemma
        .release_collateral(&h.usd_lemma, &treasury, dec!(15))
        .await
        .unwrap();
    assert_eq!(h.ledger.balance_of(&treasury).await.unwrap(), dec!(15));
    assert_eq!(h.lemma.collateral().undeployed().await.unwrap(), dec!(25));
}

#[tokio::test]
async fn test_collateral_quote_is_read_only() {
    let h = Harness::new().await;
    let before = h.ledger.events().await.len();

    let to_open = h
        .lemma
        .get_collateral_amount_given_underlying_asset_amount(dec!(1), true)
        .await
        .unwrap();
    let to_close = h
        .lemma
        .get_collateral_amount_given_underlying_asset_amount(dec!(1), false)
        .await
        .unwrap();

    // Selling receives less than buying pays
    assert!(to_open < dec!(100));
    assert!(to_close > dec!(100));
    assert_eq!(h.ledger.events().await.len(), before);
}

#[tokio::test]
async fn test_ledger_failure_reverts_snapshot() {
    let mut ledger = MockPerpLedger::new();
    ledger.expect_collateral_decimals().return_const(6u32);
    ledger
        .expect_settlement_token()
        .return_const(Address::from_label("settlement_token"));
    ledger.expect_snapshot().times(1).returning(|_| Ok(SnapshotId(7)));
    ledger
        .expect_get_total_open_notional()
        .returning(|_, _| Ok(Decimal::ZERO));
    ledger.expect_balance_of().returning(|_| Ok(dec!(100)));
    ledger.expect_deposit().times(1).returning(|_, _, _| Ok(()));
    ledger
        .expect_open_position()
        .times(1)
        .returning(|_, _| Err(ClearingError::Reverted("CH_NEFCI".to_string())));
    ledger
        .expect_revert_to_snapshot()
        .with(mockall::predicate::eq(SnapshotId(7)))
        .times(1)
        .returning(|_| Ok(()));
    ledger.expect_release_snapshot().never();

    let owner = Address::from_label("owner");
    let usd_lemma = Address::from_label("usd_lemma");
    let lemma = PerpLemma::new(
        ControllerConfig {
            address: Address::from_label("perp_lemma"),
            base_token: Address::from_label("vETH"),
            direction: PositionSide::Short,
            target_leverage: Decimal::ONE,
        },
        LemmaSettings::new(owner, usd_lemma),
        Arc::new(ledger),
        Arc::new(MockAggregator::new(Decimal::ONE)),
    );

    let err = lemma
        .open_with_exact_collateral(&usd_lemma, dec!(100))
        .await
        .unwrap_err();
    assert_eq!(
        err,
        LemmaError::ExternalCallFailure(ClearingError::Reverted("CH_NEFCI".to_string()))
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_failing_manager_does_not_undo_another_on_same_ledger() {
    const OPENS: usize = 20;
    let ledger = Arc::new(SimulatedLedger::new(SimulatedLedgerConfig::default()));
    ledger
        .add_market(Address::from_label("vETH"), dec!(10000), dec!(1000000), dec!(0.001))
        .await;
    let usd_lemma = Address::from_label("usd_lemma");
    ledger.mint(&usd_lemma, dec!(100)).await;

    let funded = manager_on(&ledger, "perp_lemma_funded", usd_lemma).await;
    let unfunded = manager_on(&ledger, "perp_lemma_unfunded", usd_lemma).await;
    funded
        .collateral()
        .receive(&usd_lemma, Decimal::from(OPENS))
        .await
        .unwrap();

    let spawn_opens = move |lemma: Arc<PerpLemma>| {
        tokio::spawn(async move {
            let mut results = Vec::with_capacity(OPENS);
            for _ in 0..OPENS {
                results.push(lemma.open_with_exact_collateral(&usd_lemma, Decimal::ONE).await);
                tokio::task::yield_now().await;
            }
            results
        })
    };
    let opening = spawn_opens(funded.clone());
    let failing = spawn_opens(unfunded.clone());
    let opened = opening.await.unwrap();
    let failed = failing.await.unwrap();

    assert!(opened.iter().all(Result::is_ok), "{opened:?}");
    assert!(
        failed
            .iter()
            .all(|result| matches!(result, Err(LemmaError::InsufficientCollateral(_)))),
        "{failed:?}"
    );
    assert_eq!(funded.collateral().deployed().await.unwrap(), Decimal::from(OPENS));
    assert_eq!(
        funded.position().await.unwrap().open_notional.abs(),
        Decimal::from(OPENS)
    );
    assert_eq!(ledger.position_changed_events().await.len(), OPENS);
    assert!(!ledger.in_transaction().await);
}
