//! Clock slaving math.
//!
//! Maps render timestamps expressed on the pipeline (external) clock into
//! this sink's internal timeline, and implements the skew estimator that
//! nudges the calibration by whole segments when the averaged clock skew
//! drifts past half a segment. The functions are pure; the sink owns the
//! clocks and the state they update.

use super::clocks::Calibration;

#[inline]
fn scale(value: u64, num: u64, denom: u64) -> u64 {
    ((value as u128 * num as u128) / denom as u128) as u64
}

/// Bring an external (pipeline) timestamp into the internal timeline through
/// the calibration, then compensate for the upstream latency present when
/// slaving started. Both steps saturate at zero.
pub fn convert_external(external: u64, calibration: &Calibration, us_latency: u64) -> u64 {
    let (rate_num, rate_denom) = calibration.rate();

    let internal = if external >= calibration.external {
        let delta = scale(external - calibration.external, rate_denom, rate_num);
        calibration.internal.saturating_add(delta)
    } else {
        let delta = scale(calibration.external - external, rate_denom, rate_num);
        calibration.internal.saturating_sub(delta)
    };

    internal.saturating_sub(us_latency)
}

/// Outcome of one skew observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SkewAdjust {
    pub calibration: Calibration,
    pub avg_skew: i64,
    /// The playout pointer must resync because the last alignment worked
    /// against (or beyond) the correction.
    pub resync: bool,
    /// The calibration changed and must be written back to the clock.
    pub corrected: bool,
}

/// Fold one skew sample into the running average and decide whether the
/// external anchor must jump by a segment. `avg_skew` of −1 means no
/// observation was made since the last resync.
pub fn skew_update(
    calibration: Calibration,
    avg_skew: i64,
    skew: i64,
    segtime_ns: i64,
    samples_per_seg: i64,
    last_align: i64,
) -> SkewAdjust {
    let mut avg = if avg_skew == -1 {
        // first observation
        skew
    } else {
        // next observations use a moving average
        (31 * avg_skew + skew) / 32
    };

    let half = segtime_ns / 2;
    let mut calibration = calibration;
    let mut resync = false;
    let mut corrected = false;

    if avg > half {
        // master is running slower, move the internal time forward
        tracing::warn!("correcting clock skew {} > {}", avg, half);
        calibration.external = calibration.external.saturating_sub(segtime_ns as u64);
        avg -= segtime_ns;
        resync = last_align < 0 || last_align > samples_per_seg;
        corrected = true;
    } else if avg < -half {
        // master is running faster, move the external time forward
        tracing::warn!("correcting clock skew {} < {}", avg, -half);
        calibration.external = calibration.external.saturating_add(segtime_ns as u64);
        avg += segtime_ns;
        resync = last_align > 0 || -last_align > samples_per_seg;
        corrected = true;
    }

    SkewAdjust {
        calibration,
        avg_skew: avg,
        resync,
        corrected,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SEGTIME: i64 = 10_000_000;

    #[test]
    fn test_convert_identity() {
        let calibration = Calibration::default();
        assert_eq!(convert_external(0, &calibration, 0), 0);
        assert_eq!(convert_external(123_456, &calibration, 0), 123_456);
    }

    #[test]
    fn test_convert_round_trip_at_unit_rate() {
        // inverse of the internal→external adjustment when rates match and
        // there is no upstream latency
        let calibration = Calibration {
            internal: 5_000,
            external: 12_000,
            rate_num: 3,
            rate_denom: 3,
        };
        for t in [0u64, 11_999, 12_000, 90_000, 1 << 40] {
            let internal = convert_external(t, &calibration, 0);
            let back = if internal >= calibration.internal {
                calibration.external + (internal - calibration.internal)
            } else {
                calibration.external - (calibration.internal - internal)
            };
            if t >= calibration.external - calibration.internal {
                assert_eq!(back, t, "round trip failed for {t}");
            }
        }
    }

    #[test]
    fn test_convert_applies_rate() {
        let calibration = Calibration {
            internal: 0,
            external: 0,
            rate_num: 2,
            rate_denom: 1,
        };
        // external runs twice as fast, internal distance halves
        assert_eq!(convert_external(1_000, &calibration, 0), 500);
    }

    #[test]
    fn test_convert_saturates_below_anchor() {
        let calibration = Calibration {
            internal: 100,
            external: 1_000,
            ..Default::default()
        };
        assert_eq!(convert_external(0, &calibration, 0), 0);
        assert_eq!(convert_external(950, &calibration, 0), 50);
    }

    #[test]
    fn test_convert_subtracts_us_latency() {
        let calibration = Calibration::default();
        assert_eq!(convert_external(10_000, &calibration, 4_000), 6_000);
        assert_eq!(convert_external(1_000, &calibration, 4_000), 0);
    }

    #[test]
    fn test_skew_first_observation_seeds_average() {
        let adjust = skew_update(Calibration::default(), -1, 1_000, SEGTIME, 480, 0);
        assert_eq!(adjust.avg_skew, 1_000);
        assert!(!adjust.corrected);
        assert!(!adjust.resync);
    }

    #[test]
    fn test_skew_ema_converges() {
        // constant injected skew below the correction threshold
        let target = SEGTIME * 2 / 5;
        let mut avg = -1i64;
        // ⌈32·ln(1/ε)⌉ observations for ε = 1%
        for _ in 0..148 {
            let adjust = skew_update(Calibration::default(), avg, target, SEGTIME, 480, 0);
            assert!(!adjust.corrected);
            avg = adjust.avg_skew;
        }
        let epsilon = SEGTIME / 100;
        assert!((avg - target).abs() <= epsilon, "avg {avg} target {target}");
    }

    #[test]
    fn test_skew_slow_master_moves_internal_forward() {
        let calibration = Calibration {
            external: 50_000_000,
            ..Default::default()
        };
        let adjust = skew_update(calibration, -1, SEGTIME, SEGTIME, 480, 0);
        assert!(adjust.corrected);
        assert_eq!(adjust.calibration.external, 40_000_000);
        assert_eq!(adjust.avg_skew, 0);
        // aligned forward within a segment: no resync needed
        assert!(!adjust.resync);
    }

    #[test]
    fn test_skew_slow_master_resyncs_on_backward_align() {
        let adjust = skew_update(Calibration::default(), -1, SEGTIME, SEGTIME, 480, -10);
        assert!(adjust.corrected);
        assert!(adjust.resync);
    }

    #[test]
    fn test_skew_fast_master_moves_external_forward() {
        let calibration = Calibration::default();
        let adjust = skew_update(calibration, -1, -SEGTIME, SEGTIME, 480, 0);
        assert!(adjust.corrected);
        assert_eq!(adjust.calibration.external, SEGTIME as u64);
        assert_eq!(adjust.avg_skew, 0);
        assert!(!adjust.resync);
    }

    #[test]
    fn test_skew_fast_master_resyncs_on_forward_align() {
        let adjust = skew_update(Calibration::default(), -1, -SEGTIME, SEGTIME, 480, 10);
        assert!(adjust.corrected);
        assert!(adjust.resync);
    }

    #[test]
    fn test_skew_resyncs_on_oversized_align() {
        // aligning more than a segment's worth always forces a resync
        let adjust = skew_update(Calibration::default(), -1, SEGTIME, SEGTIME, 480, 481);
        assert!(adjust.resync);
    }
}
