//! Type definitions for the external perpetual protocol surface.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

/// 20-byte account identifier on the external ledger.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Address([u8; 20]);

impl Address {
    pub const ZERO: Address = Address([0u8; 20]);

    pub fn from_bytes(bytes: [u8; 20]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    /// Derive a deterministic address from a human-readable label.
    ///
    /// Uses the first 20 bytes of the label's SHA-256 digest, so the same
    /// label always names the same account across runs.
    pub fn from_label(label: &str) -> Self {
        let digest = Sha256::digest(label.as_bytes());
        let mut bytes = [0u8; 20];
        bytes.copy_from_slice(&digest[..20]);
        Self(bytes)
    }

    /// Parse a `0x`-prefixed hex address, falling back to label derivation.
    pub fn parse_or_label(value: &str) -> Self {
        value.parse().unwrap_or_else(|_| Self::from_label(value))
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({})", self)
    }
}

impl FromStr for Address {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let digits = s
            .strip_prefix("0x")
            .ok_or_else(|| format!("address {s:?} is missing the 0x prefix"))?;
        let raw = hex::decode(digits).map_err(|e| format!("address {s:?}: {e}"))?;
        let bytes: [u8; 20] = raw
            .try_into()
            .map_err(|raw: Vec<u8>| format!("address {s:?} has {} bytes, expected 20", raw.len()))?;
        Ok(Self(bytes))
    }
}

impl Serialize for Address {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// 32-byte referral code attached to every clearing house call.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ReferrerCode([u8; 32]);

impl ReferrerCode {
    pub const EMPTY: ReferrerCode = ReferrerCode([0u8; 32]);

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Text content up to the first zero byte.
    pub fn as_string(&self) -> String {
        let end = self.0.iter().position(|b| *b == 0).unwrap_or(32);
        String::from_utf8_lossy(&self.0[..end]).into_owned()
    }
}

impl FromStr for ReferrerCode {
    type Err = String;

    /// Pack a string into 32 bytes, keeping the last byte as a terminator.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = s.as_bytes();
        if raw.len() > 31 {
            return Err(format!("referrer code {s:?} is longer than 31 bytes"));
        }
        let mut bytes = [0u8; 32];
        bytes[..raw.len()].copy_from_slice(raw);
        Ok(Self(bytes))
    }
}

impl fmt::Display for ReferrerCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_string())
    }
}

impl fmt::Debug for ReferrerCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ReferrerCode(0x{})", hex::encode(self.0))
    }
}

impl Serialize for ReferrerCode {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Direction of a perpetual position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PositionSide {
    Long,
    Short,
}

impl fmt::Display for PositionSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PositionSide::Long => write!(f, "long"),
            PositionSide::Short => write!(f, "short"),
        }
    }
}

/// Parameters for a clearing house trade.
///
/// `is_base_to_quote` selects the direction (true = short), `is_exact_input`
/// selects which leg `amount` fixes:
///
/// | base_to_quote | exact_input | `amount` is             |
/// |---------------|-------------|-------------------------|
/// | true          | true        | base sold               |
/// | true          | false       | quote received          |
/// | false         | true        | quote paid              |
/// | false         | false       | base bought             |
#[derive(Debug, Clone, PartialEq)]
pub struct OpenPositionParams {
    pub base_token: Address,
    pub is_base_to_quote: bool,
    pub is_exact_input: bool,
    pub amount: Decimal,
    /// Pool price (quote per base) the trade must not cross
    pub price_limit: Option<Decimal>,
    /// Latest ledger timestamp at which the trade may execute
    pub deadline: Option<DateTime<Utc>>,
    pub referral_code: ReferrerCode,
}

/// Parameters for reducing an existing position.
#[derive(Debug, Clone, PartialEq)]
pub struct ClosePositionParams {
    pub base_token: Address,
    /// Base size to close; `None` closes the whole position
    pub amount: Option<Decimal>,
    pub price_limit: Option<Decimal>,
    pub deadline: Option<DateTime<Utc>>,
    pub referral_code: ReferrerCode,
}

/// Read-only quote request against a market.
#[derive(Debug, Clone, PartialEq)]
pub struct QuoteParams {
    pub base_token: Address,
    pub is_base_to_quote: bool,
    pub is_exact_input: bool,
    pub amount: Decimal,
}

/// Result of a quote or a swap: trader-signed legs.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SwapQuote {
    /// Base received (positive) or given (negative) by the trader
    pub exchanged_base: Decimal,
    /// Quote received (positive) or paid (negative) by the trader
    pub exchanged_quote: Decimal,
    pub fee: Decimal,
    pub price_after: Decimal,
}

/// Emitted by the clearing house for every trade.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PositionChanged {
    pub trader: Address,
    pub base_token: Address,
    pub exchanged_base: Decimal,
    pub exchanged_quote: Decimal,
    pub fee: Decimal,
    /// Open notional after the trade
    pub open_notional: Decimal,
    pub realized_pnl: Decimal,
    pub delta_base_balance: Decimal,
    pub price_after: Decimal,
    pub timestamp: DateTime<Utc>,
}

/// Everything the simulated ledger records, in order.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LedgerEvent {
    Transfer {
        from: Address,
        to: Address,
        amount: Decimal,
    },
    Approval {
        owner: Address,
        spender: Address,
        amount: Decimal,
    },
    Deposited {
        token: Address,
        trader: Address,
        amount: Decimal,
    },
    Withdrawn {
        token: Address,
        trader: Address,
        amount: Decimal,
    },
    PositionChanged(PositionChanged),
}

/// Oracle round as returned by a Chainlink-style aggregator.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RoundData {
    pub round_id: u64,
    pub answer: Decimal,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub answered_in_round: u64,
}

/// Handle returned by `PerpLedger::snapshot`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SnapshotId(pub u64);

impl fmt::Display for SnapshotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
