//! Adaptive rate control
//!
//! Workers sleep a per-record delay set by the monitor. Each tick compares
//! the observed throughput to the target and moves the delay proportionally:
//! by `gain_down` (as a share of the ideal per-record time) while over the
//! target, and by `gain_up` (as a share of the current delay) while under
//! it. Separate gains keep the ramp asymmetric.

use std::time::Duration;

/// Upper bound of the per-record delay
pub const MAX_DELAY: Duration = Duration::from_secs(1);

/// Next per-record delay for a worker moving `observed_bps` against a
/// target of `target_bps`
pub fn adjust_delay(
    current: Duration,
    observed_bps: f64,
    target_bps: u64,
    block_size: u64,
    gain_up: f64,
    gain_down: f64,
) -> Duration {
    if target_bps == 0 || block_size == 0 || !observed_bps.is_finite() {
        return current;
    }
    let target = target_bps as f64;
    let ratio = observed_bps.max(0.0) / target;
    let current_s = current.as_secs_f64();

    let next = if ratio > 1.0 {
        let ideal = block_size as f64 / target;
        current_s + gain_down * ideal * (ratio - 1.0)
    } else {
        current_s * (1.0 - gain_up * (1.0 - ratio))
    };
    Duration::from_secs_f64(next.clamp(0.0, MAX_DELAY.as_secs_f64()))
}
