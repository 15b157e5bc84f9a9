//! Differential encoding for track arrays.
//!
//! Arrays are stored as the first fixed-point value followed by successive
//! deltas, which keeps wire payloads small for slowly-varying series like
//! coordinates and timestamps. Encoding is lossless apart from the
//! fixed-point rounding at the chosen multiplier.

/// Fixed-point multiplier used for latitude/longitude (~1 m resolution).
pub const COORD_MULTIPLIER: f64 = 1e5;

/// Delta-encodes `values` scaled by `multiplier`.
///
/// The first element is the rounded scaled value itself; every following
/// element is the delta to its predecessor. Deltas are clamped to the
/// signed 32-bit range, or to `[0, u32::MAX]` when `signed` is false —
/// the unsigned form is used for timestamps, which must never regress.
pub fn diff_encode(values: &[f64], multiplier: f64, signed: bool) -> Vec<i64> {
    let mut out = Vec::with_capacity(values.len());
    let mut previous: i64 = 0;
    for (i, value) in values.iter().enumerate() {
        let scaled = (value * multiplier).round() as i64;
        if i == 0 {
            out.push(scaled);
        } else {
            let delta = scaled - previous;
            let clamped = if signed {
                delta.clamp(i32::MIN as i64, i32::MAX as i64)
            } else {
                delta.clamp(0, u32::MAX as i64)
            };
            out.push(clamped);
        }
        previous = scaled;
    }
    out
}

/// Inverse of [`diff_encode`]: cumulative sum, then scale back down.
pub fn diff_decode(deltas: &[i64], multiplier: f64) -> Vec<f64> {
    let mut out = Vec::with_capacity(deltas.len());
    let mut current: i64 = 0;
    for (i, delta) in deltas.iter().enumerate() {
        current = if i == 0 { *delta } else { current + delta };
        out.push(current as f64 / multiplier);
    }
    out
}

/// Convenience for integer series (timestamps).
pub fn diff_encode_i64(values: &[i64], signed: bool) -> Vec<i64> {
    let as_f64: Vec<f64> = values.iter().map(|&v| v as f64).collect();
    diff_encode(&as_f64, 1.0, signed)
}

pub fn diff_decode_i64(deltas: &[i64]) -> Vec<i64> {
    diff_decode(deltas, 1.0).iter().map(|&v| v as i64).collect()
}
