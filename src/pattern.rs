use crate::config::Pattern;
use rand::Rng;

/// Width of the bell envelope as a fraction of the run. With the peak in the
/// middle the envelope starts and ends at about 0.4% of the maximum.
pub const BELL_SIGMA: f64 = 0.15;

/// Target bandwidth in Mbps for the point `elapsed_fraction` of the way
/// through a run. Always within `[0, max_bandwidth_mbps]`.
///
/// `Random` draws a fresh uniform sample on every call. There is no smoothing
/// between calls; the jitter is the point of that pattern.
pub fn evaluate(
    pattern: Pattern,
    elapsed_fraction: f64,
    max_bandwidth_mbps: f64,
    bell_peak_ratio: f64,
) -> f64 {
    if max_bandwidth_mbps.is_nan() || max_bandwidth_mbps <= 0.0 {
        return 0.0;
    }
    let f = if elapsed_fraction.is_nan() {
        0.0
    } else {
        elapsed_fraction.clamp(0.0, 1.0)
    };

    match pattern {
        Pattern::Constant => max_bandwidth_mbps,
        Pattern::Bell => {
            let d = f - bell_peak_ratio;
            let height = (-(d * d) / (2.0 * BELL_SIGMA * BELL_SIGMA)).exp();
            (max_bandwidth_mbps * height).clamp(0.0, max_bandwidth_mbps)
        }
        Pattern::Random => rand::thread_rng().gen_range(0.0..=max_bandwidth_mbps),
    }
}
