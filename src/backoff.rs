//! Reconnect backoff.
//!
//! For attempt `n` (1-based, counted from the last successful open):
//!
//! ```text
//! base   = min(delayMax, delayMin * reconnectExponent^(n-1))
//! jitter = base * randomizationFactor * (uniform(0,1) * 2 - 1)
//! delay  = clamp(base + jitter, delayMin, delayMax)
//! ```

use std::time::Duration;

use crate::options::ConnectionOptions;

/// Delay before reconnect attempt `attempt`, given a uniform sample in `[0, 1)`.
///
/// Attempt `0` is treated as `1`. The result always lies within
/// `[delayMin, delayMax]`.
pub fn reconnect_delay(options: &ConnectionOptions, attempt: u32, unit: f64) -> Duration {
    let min = options.delay_min as f64;
    let max = options.delay_max as f64;
    let exponent = i32::try_from(attempt.max(1) - 1).unwrap_or(i32::MAX);
    let base = (min * options.reconnect_exponent.powi(exponent)).min(max);
    let spread = unit.clamp(0.0, 1.0) * 2.0 - 1.0;
    let jitter = base * options.randomization_factor * spread;
    let delay = (base + jitter).max(min).min(max);
    Duration::from_millis(delay.round() as u64)
}

/// [`reconnect_delay`] with a fresh random sample.
pub fn jittered_delay(options: &ConnectionOptions, attempt: u32) -> Duration {
    reconnect_delay(options, attempt, rand::random::<f64>())
}
