//! Values are published as signed mantissas with a fixed exponent of -6.

/// Decimal exponent of every published price field.
pub const PRICE_EXPONENT: i32 = -6;

const SCALE: f64 = 1_000_000.0;

/// Rounds to the nearest integer, halves towards positive infinity.
pub fn round_half_up(x: f64) -> f64 {
    (x + 0.5).floor()
}

/// Scaled integer representation, `None` for NaN and infinities.
pub fn mantissa(x: f64) -> Option<i64> {
    if !x.is_finite() {
        return None;
    }
    let scaled = round_half_up(x * SCALE);
    if scaled >= i64::MAX as f64 || scaled <= i64::MIN as f64 {
        return None;
    }
    Some(scaled as i64)
}
