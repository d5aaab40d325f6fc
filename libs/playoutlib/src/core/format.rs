//! Sample format description for the ring buffer and the time/sample
//! conversions used throughout the sink.
//!
//! All conversions go through 128-bit intermediates and truncate toward
//! zero, so positions stay exact for any realistic rate and stream length.

use super::{Result, SinkError};

pub const NSECS_PER_SEC: u64 = 1_000_000_000;
pub const USECS_PER_SEC: u64 = 1_000_000;

/// Convert a duration in nanoseconds to a sample count at `rate`.
#[inline]
pub fn ns_to_samples(ns: u64, rate: u32) -> u64 {
    ((ns as u128 * rate as u128) / NSECS_PER_SEC as u128) as u64
}

/// Convert a sample count at `rate` to a duration in nanoseconds.
#[inline]
pub fn samples_to_ns(samples: u64, rate: u32) -> u64 {
    ((samples as u128 * NSECS_PER_SEC as u128) / rate as u128) as u64
}

/// Format and geometry of an acquired ring buffer.
///
/// `rate` of 0 means the spec has not been bound to a format yet.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RingBufferSpec {
    /// Sample rate in Hz.
    pub rate: u32,

    pub channels: u32,

    /// Bytes in one frame across all channels.
    pub bytes_per_sample: u32,

    /// Size of one segment in bytes.
    pub segsize: u32,

    /// Number of segments in the ring.
    pub segtotal: u32,

    /// Segments of headroom counted into our own latency.
    pub seglatency: u32,

    /// Total device buffer duration in microseconds.
    pub buffer_time: i64,

    /// Duration of one segment in microseconds.
    pub latency_time: i64,
}

impl RingBufferSpec {
    pub fn samples_per_seg(&self) -> u64 {
        if self.bytes_per_sample == 0 {
            return 0;
        }
        (self.segsize / self.bytes_per_sample) as u64
    }

    pub fn ns_to_samples(&self, ns: u64) -> u64 {
        ns_to_samples(ns, self.rate)
    }

    pub fn samples_to_ns(&self, samples: u64) -> u64 {
        samples_to_ns(samples, self.rate)
    }

    /// Duration of one segment in nanoseconds.
    pub fn segment_time_ns(&self) -> u64 {
        self.latency_time as u64 * 1000
    }

    /// Derive the segment geometry from the configured buffer and latency
    /// times. Called before acquire; the device may still adjust segsize and
    /// segtotal to its own granularity.
    pub fn derive_segments(&mut self) -> Result<()> {
        if self.rate == 0 || self.bytes_per_sample == 0 {
            return Err(SinkError::Configuration(
                "spec has no format, cannot size segments".into(),
            ));
        }
        let bytes_per_sec = self.rate as u128 * self.bytes_per_sample as u128;
        let mut segsize =
            ((self.latency_time as u128 * bytes_per_sec) / USECS_PER_SEC as u128) as u32;
        // keep segments frame aligned
        segsize -= segsize % self.bytes_per_sample;
        if segsize == 0 {
            segsize = self.bytes_per_sample;
        }
        self.segsize = segsize;
        self.segtotal = ((self.buffer_time + self.latency_time - 1) / self.latency_time) as u32;
        if self.segtotal < 2 {
            self.segtotal = 2;
        }
        self.seglatency = self.segtotal;
        Ok(())
    }

    /// Recompute the actual buffer and latency times from the geometry the
    /// device really gave us.
    pub fn update_actual_times(&mut self) {
        let bytes_per_sec = self.rate as u128 * self.bytes_per_sample as u128;
        self.latency_time =
            ((self.segsize as u128 * USECS_PER_SEC as u128) / bytes_per_sec) as i64;
        self.buffer_time = self.segtotal as i64 * self.latency_time;
    }

    /// True once the spec describes a playable format.
    pub fn is_valid(&self) -> bool {
        self.rate > 0
            && self.bytes_per_sample > 0
            && self.segsize > 0
            && self.segsize % self.bytes_per_sample == 0
            && self.segtotal > 0
    }
}

/// Raw audio format fields as negotiated with the peer. Unset fields are
/// filled by [`AudioCaps::fixate`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AudioCaps {
    pub rate: Option<u32>,
    pub channels: Option<u32>,
    /// Sample width in bits.
    pub width: Option<u32>,
    /// Significant bits, at most `width`.
    pub depth: Option<u32>,
    pub signed: Option<bool>,
    pub big_endian: Option<bool>,
}

fn round_up_8(value: u32) -> u32 {
    (value + 7) & !7
}

impl AudioCaps {
    /// Fill every unset field with the preferred default: 44.1kHz stereo,
    /// 16-bit signed host-endian.
    pub fn fixate(&mut self) {
        self.rate.get_or_insert(44_100);
        self.channels.get_or_insert(2);
        let width = *self.width.get_or_insert(16);
        self.depth.get_or_insert(round_up_8(width));
        self.signed.get_or_insert(true);
        self.big_endian.get_or_insert(cfg!(target_endian = "big"));
    }

    /// Map fixed caps into `spec`. Fails when a field is missing or the
    /// combination is not representable.
    pub fn fill_spec(&self, spec: &mut RingBufferSpec) -> Result<()> {
        let rate = self
            .rate
            .filter(|r| *r > 0)
            .ok_or_else(|| SinkError::ParseCaps("no rate".into()))?;
        let channels = self
            .channels
            .filter(|c| *c > 0)
            .ok_or_else(|| SinkError::ParseCaps("no channels".into()))?;
        let width = self
            .width
            .ok_or_else(|| SinkError::ParseCaps("no width".into()))?;
        if width == 0 || width % 8 != 0 {
            return Err(SinkError::ParseCaps(format!(
                "width {width} is not a whole number of bytes"
            )));
        }
        if let Some(depth) = self.depth {
            if depth > width {
                return Err(SinkError::ParseCaps(format!(
                    "depth {depth} exceeds width {width}"
                )));
            }
        }
        spec.rate = rate;
        spec.channels = channels;
        spec.bytes_per_sample = channels * (width / 8);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec_48k() -> RingBufferSpec {
        RingBufferSpec {
            rate: 48_000,
            channels: 2,
            bytes_per_sample: 4,
            segsize: 1920,
            segtotal: 10,
            seglatency: 10,
            buffer_time: 100_000,
            latency_time: 10_000,
        }
    }

    #[test]
    fn test_ns_sample_round_trip() {
        let spec = spec_48k();
        assert_eq!(spec.ns_to_samples(20_000_000), 960);
        assert_eq!(spec.samples_to_ns(960), 20_000_000);
        // truncation toward zero
        assert_eq!(spec.ns_to_samples(1), 0);
    }

    #[test]
    fn test_conversions_do_not_overflow() {
        // a week of audio at 192kHz still fits through the 128-bit path
        let ns = 7 * 24 * 3600 * NSECS_PER_SEC;
        let samples = ns_to_samples(ns, 192_000);
        assert_eq!(samples, 7 * 24 * 3600 * 192_000);
        assert_eq!(samples_to_ns(samples, 192_000), ns);
    }

    #[test]
    fn test_samples_per_seg() {
        assert_eq!(spec_48k().samples_per_seg(), 480);
    }

    #[test]
    fn test_derive_and_update_times() {
        let mut spec = RingBufferSpec {
            rate: 48_000,
            channels: 2,
            bytes_per_sample: 4,
            buffer_time: 200_000,
            latency_time: 10_000,
            ..Default::default()
        };
        spec.derive_segments().unwrap();
        assert_eq!(spec.segsize, 1920);
        assert_eq!(spec.segtotal, 20);
        assert!(spec.is_valid());

        spec.update_actual_times();
        assert_eq!(spec.latency_time, 10_000);
        assert_eq!(spec.buffer_time, 200_000);
    }

    #[test]
    fn test_fixate_defaults() {
        let mut caps = AudioCaps::default();
        caps.fixate();
        assert_eq!(caps.rate, Some(44_100));
        assert_eq!(caps.channels, Some(2));
        assert_eq!(caps.width, Some(16));
        assert_eq!(caps.depth, Some(16));
        assert_eq!(caps.signed, Some(true));
    }

    #[test]
    fn test_fixate_rounds_depth_up() {
        let mut caps = AudioCaps {
            width: Some(24),
            ..Default::default()
        };
        caps.fixate();
        assert_eq!(caps.depth, Some(24));

        let mut caps = AudioCaps {
            width: Some(20),
            ..Default::default()
        };
        caps.fixate();
        assert_eq!(caps.depth, Some(24));
    }

    #[test]
    fn test_caps_fill_spec() {
        let mut caps = AudioCaps::default();
        caps.fixate();
        let mut spec = RingBufferSpec::default();
        caps.fill_spec(&mut spec).unwrap();
        assert_eq!(spec.rate, 44_100);
        assert_eq!(spec.bytes_per_sample, 4);
    }

    #[test]
    fn test_caps_reject_bad_width() {
        let caps = AudioCaps {
            rate: Some(48_000),
            channels: Some(2),
            width: Some(12),
            ..Default::default()
        };
        let mut spec = RingBufferSpec::default();
        assert!(matches!(
            caps.fill_spec(&mut spec),
            Err(SinkError::ParseCaps(_))
        ));
    }
}
