//! Privileged signed-delta position adjustment.

use super::controller::PerpLemma;
use crate::error::{LemmaError, LemmaResult};
use crate::ledger::{Address, OpenPositionParams, PositionChanged};
use crate::utils::decimal::{price_to_sqrt_price_x96, sqrt_price_x96_to_price};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use tracing::{debug, info};

const WORD: usize = 32;

/// Swap bounds carried by a rebalance call.
///
/// Encoded as the ABI tuple `(uint160 sqrtPriceLimitX96, uint256 deadline)`.
/// A zero price limit and an all-ones deadline mean "no bound".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RebalanceParams {
    pub sqrt_price_limit_x96: u128,
    pub deadline: Option<DateTime<Utc>>,
}

impl RebalanceParams {
    pub const ENCODED_LEN: usize = 2 * WORD;

    pub fn unbounded() -> Self {
        Self {
            sqrt_price_limit_x96: 0,
            deadline: None,
        }
    }

    /// Build params from a plain price limit (quote per base).
    pub fn new(price_limit: Option<Decimal>, deadline: Option<DateTime<Utc>>) -> LemmaResult<Self> {
        let sqrt_price_limit_x96 = match price_limit {
            Some(price) => price_to_sqrt_price_x96(price).ok_or_else(|| {
                LemmaError::MalformedParams(format!("price limit {price} cannot be encoded"))
            })?,
            None => 0,
        };
        Ok(Self {
            sqrt_price_limit_x96,
            deadline,
        })
    }

    /// Price limit in quote per base, if one is set.
    pub fn price_limit(&self) -> Option<Decimal> {
        (self.sqrt_price_limit_x96 != 0).then(|| sqrt_price_x96_to_price(self.sqrt_price_limit_x96))
    }

    /// Decode the 64-byte ABI tuple.
    ///
    /// Any `uint160` price limit is accepted; values of 2^128 or more
    /// saturate to `u128::MAX`, which no reachable pool price crosses.
    /// A deadline beyond `u64` seconds decodes as no deadline.
    pub fn decode(data: &[u8]) -> LemmaResult<Self> {
        if data.len() != Self::ENCODED_LEN {
            return Err(LemmaError::MalformedParams(format!(
                "expected {} bytes, got {}",
                Self::ENCODED_LEN,
                data.len()
            )));
        }
        let (price_word, deadline_word) = data.split_at(WORD);

        // uint160 leaves the top 12 bytes clear
        if price_word[..12].iter().any(|b| *b != 0) {
            return Err(LemmaError::MalformedParams(
                "price limit does not fit in uint160".to_string(),
            ));
        }
        // Limits at or above 2^128 are past any price the pool can reach.
        let sqrt_price_limit_x96 = if price_word[12..16].iter().any(|b| *b != 0) {
            u128::MAX
        } else {
            let mut low = [0u8; 16];
            low.copy_from_slice(&price_word[16..]);
            u128::from_be_bytes(low)
        };

        let deadline = if deadline_word.iter().all(|b| *b == 0xff)
            || deadline_word[..24].iter().any(|b| *b != 0)
        {
            None
        } else {
            let mut secs = [0u8; 8];
            secs.copy_from_slice(&deadline_word[24..]);
            i64::try_from(u64::from_be_bytes(secs))
                .ok()
                .and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0))
        };

        Ok(Self {
            sqrt_price_limit_x96,
            deadline,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = vec![0u8; Self::ENCODED_LEN];
        out[16..WORD].copy_from_slice(&self.sqrt_price_limit_x96.to_be_bytes());
        match self.deadline {
            Some(deadline) => {
                let secs = deadline.timestamp().max(0) as u64;
                out[WORD + 24..].copy_from_slice(&secs.to_be_bytes());
            }
            None => out[WORD..].fill(0xff),
        }
        out
    }
}

impl PerpLemma {
    /// Adjust the position by `signed_amount` base.
    ///
    /// Positive buys exactly that much base, negative sells exactly `|amount|`,
    /// zero is a no-op returning `None`. `actor` must be the configured
    /// rebalancer; `caller` is the rebalancer itself or the USD issuer
    /// relaying for it.
    pub async fn rebalance(
        &self,
        caller: &Address,
        actor: &Address,
        signed_amount: Decimal,
        aux_params: &[u8],
    ) -> LemmaResult<Option<PositionChanged>> {
        self.guard.ensure_rebalance(caller, actor).await?;
        let params = RebalanceParams::decode(aux_params)?;

        if signed_amount.is_zero() {
            debug!(%actor, "Zero rebalance, nothing to do");
            return Ok(None);
        }

        let buy = signed_amount > Decimal::ZERO;
        let settings = self.guard.settings().await;
        let open = OpenPositionParams {
            base_token: self.config.base_token,
            is_base_to_quote: !buy,
            is_exact_input: !buy,
            amount: signed_amount.abs(),
            price_limit: params.price_limit(),
            deadline: params.deadline,
            referral_code: settings.referrer_code,
        };

        let _tx = self.tx_lock.lock().await;
        let snapshot = self.ledger.snapshot(&self.config.address).await?;
        let result = self
            .ledger
            .open_position(&self.config.address, open)
            .await
            .map_err(LemmaError::from);
        let event = self.commit_or_revert(snapshot, result, "rebalance").await?;

        info!(
            %actor,
            %signed_amount,
            exchanged_quote = %event.exchanged_quote,
            price_after = %event.price_after,
            "Rebalanced"
        );
        Ok(Some(event))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    #[test]
    fn test_unbounded_encoding() {
        let encoded = RebalanceParams::unbounded().encode();
        assert_eq!(encoded.len(), 64);
        assert!(encoded[..32].iter().all(|b| *b == 0));
        assert!(encoded[32..].iter().all(|b| *b == 0xff));
        assert_eq!(
            RebalanceParams::decode(&encoded).unwrap(),
            RebalanceParams::unbounded()
        );
    }

    #[test]
    fn test_decode_deadline_and_limit() {
        let deadline = Utc.with_ymd_and_hms(2030, 1, 1, 0, 0, 0).unwrap();
        let params = RebalanceParams::new(Some(dec!(100)), Some(deadline)).unwrap();
        let decoded = RebalanceParams::decode(&params.encode()).unwrap();

        assert_eq!(decoded.deadline, Some(deadline));
        let limit = decoded.price_limit().unwrap();
        assert!((limit - dec!(100)).abs() < dec!(0.000001));
    }

    #[test]
    fn test_wrong_length_is_malformed() {
        let err = RebalanceParams::decode(&[0u8; 40]).unwrap_err();
        assert!(matches!(err, LemmaError::MalformedParams(_)));
    }

    #[test]
    fn test_dirty_uint160_padding_is_malformed() {
        let mut data = RebalanceParams::unbounded().encode();
        data[0] = 1;
        assert!(matches!(
            RebalanceParams::decode(&data),
            Err(LemmaError::MalformedParams(_))
        ));
    }

    #[test]
    fn test_huge_deadline_means_unbounded() {
        let mut data = vec![0u8; 64];
        data[40] = 1;
        assert_eq!(RebalanceParams::decode(&data).unwrap().deadline, None);
    }

    #[test]
    fn test_zero_limit_has_no_price_limit() {
        assert_eq!(RebalanceParams::unbounded().price_limit(), None);
    }

    #[test]
    fn test_max_uint160_limit_saturates() {
        // Uniswap's MAX_SQRT_RATIO, the usual "no limit" for buys
        let max_sqrt_ratio = hex::decode("fffd8963efd1fc6a506488495d951d5263988d26").unwrap();
        let mut data = RebalanceParams::unbounded().encode();
        data[12..32].copy_from_slice(&max_sqrt_ratio);

        let decoded = RebalanceParams::decode(&data).unwrap();
        assert_eq!(decoded.sqrt_price_limit_x96, u128::MAX);
        assert_eq!(decoded.deadline, None);
        assert!(decoded.price_limit().unwrap() > dec!(1000000000000));
    }
}
