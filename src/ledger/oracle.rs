//! Settable price aggregator for simulations and tests.

use super::traits::{ClearingError, PriceOracle};
use super::types::RoundData;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::BTreeMap;
use tokio::sync::RwLock;
use tracing::debug;

#[derive(Debug, Default)]
struct AggregatorState {
    rounds: BTreeMap<u64, RoundData>,
    /// Round most recently written, whatever its id
    latest_round: u64,
}

/// Aggregator whose rounds are written by the test or scenario driver.
pub struct MockAggregator {
    state: RwLock<AggregatorState>,
}

impl MockAggregator {
    /// Create an aggregator with round 0 answering `price`.
    pub fn new(price: Decimal) -> Self {
        let now = Utc::now();
        let mut rounds = BTreeMap::new();
        rounds.insert(
            0,
            RoundData {
                round_id: 0,
                answer: price,
                started_at: now,
                updated_at: now,
                answered_in_round: 0,
            },
        );
        Self {
            state: RwLock::new(AggregatorState {
                rounds,
                latest_round: 0,
            }),
        }
    }

    /// Record a round and make it the latest, even if its id is lower.
    pub async fn set_latest_round_data(
        &self,
        round_id: u64,
        answer: Decimal,
        started_at: DateTime<Utc>,
        updated_at: DateTime<Utc>,
        answered_in_round: u64,
    ) {
        debug!(round_id, %answer, "Aggregator round updated");
        let mut state = self.state.write().await;
        state.rounds.insert(
            round_id,
            RoundData {
                round_id,
                answer,
                started_at,
                updated_at,
                answered_in_round,
            },
        );
        state.latest_round = round_id;
    }

    /// Publish `price` as the round after the current latest.
    pub async fn set_price(&self, price: Decimal) {
        let round_id = self.state.read().await.latest_round.saturating_add(1);
        let now = Utc::now();
        self.set_latest_round_data(round_id, price, now, now, round_id).await;
    }
}

#[async_trait]
impl PriceOracle for MockAggregator {
    async fn get_round_data(&self, round_id: u64) -> Result<RoundData, ClearingError> {
        self.state
            .read()
            .await
            .rounds
            .get(&round_id)
            .copied()
            .ok_or_else(|| ClearingError::Reverted(format!("no data for round {round_id}")))
    }

    async fn latest_round_data(&self) -> Result<RoundData, ClearingError> {
        let state = self.state.read().await;
        state
            .rounds
            .get(&state.latest_round)
            .copied()
            .ok_or_else(|| ClearingError::Reverted("aggregator has no rounds".to_string()))
    }
}
