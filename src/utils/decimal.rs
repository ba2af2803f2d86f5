//! Decimal arithmetic utilities for financial calculations.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, MathematicalOps, RoundingStrategy};

/// Fixed-point scale of the `sqrtPriceX96` encoding is 2^96; conversions
/// go through 2^48 so intermediate values stay inside `Decimal`'s range.
const HALF_Q96_SHIFT: u32 = 48;

/// Round down to a token's native precision (e.g. 6 for USDC).
pub fn truncate_to_decimals(value: Decimal, decimals: u32) -> Decimal {
    value.round_dp_with_strategy(decimals, RoundingStrategy::ToZero)
}

/// Safe division that returns zero if divisor is zero.
pub fn safe_div(numerator: Decimal, denominator: Decimal) -> Decimal {
    if denominator == Decimal::ZERO {
        Decimal::ZERO
    } else {
        numerator / denominator
    }
}

/// True when `actual` is within `tolerance` (absolute) of `expected`.
pub fn within_tolerance(actual: Decimal, expected: Decimal, tolerance: Decimal) -> bool {
    (actual - expected).abs() <= tolerance
}

/// Encode a price (quote per base) as a Uniswap-style `sqrtPriceX96`.
///
/// Returns `None` for negative prices or prices too large to encode.
pub fn price_to_sqrt_price_x96(price: Decimal) -> Option<u128> {
    if price.is_sign_negative() {
        return None;
    }
    let scaled = price
        .sqrt()?
        .checked_mul(Decimal::from(1u64 << HALF_Q96_SHIFT))?
        .trunc()
        .to_u128()?;
    scaled.checked_mul(1u128 << HALF_Q96_SHIFT)
}

/// Decode a `sqrtPriceX96` into a price (quote per base).
///
/// The low 48 bits of the fixed-point value are dropped; the relative error
/// is below 1e-14 for any realistic price.
pub fn sqrt_price_x96_to_price(sqrt_price_x96: u128) -> Decimal {
    let high = (sqrt_price_x96 >> HALF_Q96_SHIFT) as i128;
    let sqrt_price =
        Decimal::from_i128_with_scale(high, 0) / Decimal::from(1u64 << HALF_Q96_SHIFT);
    sqrt_price.checked_mul(sqrt_price).unwrap_or(Decimal::MAX)
}
