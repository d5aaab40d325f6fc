//! Active playback window.
//!
//! The segment is configured by the upstream peer through a new-segment
//! event. Buffers are clipped against it and their clipped timestamps are
//! mapped to running time before syncing against the pipeline clock.

/// A time window `[start, stop)` with a playback rate and the running time
/// accumulated by earlier segments.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Segment {
    pub rate: f64,

    /// Stream time where this segment begins, nanoseconds.
    pub start: u64,

    /// Exclusive end of the segment; `None` for an open-ended stream.
    pub stop: Option<u64>,

    /// Stream time corresponding to `start`.
    pub time: u64,

    /// Running time already elapsed when this segment was activated.
    pub base: u64,
}

impl Default for Segment {
    fn default() -> Self {
        Self {
            rate: 1.0,
            start: 0,
            stop: None,
            time: 0,
            base: 0,
        }
    }
}

impl Segment {
    /// Intersect `[start, stop)` with the segment window. Returns the clipped
    /// interval, or `None` when nothing of the buffer falls inside the
    /// segment (a zero-length touch at the boundary counts as outside).
    pub fn clip(&self, start: u64, stop: u64) -> Option<(u64, u64)> {
        if stop <= self.start {
            return None;
        }
        if let Some(segment_stop) = self.stop {
            if start >= segment_stop {
                return None;
            }
        }
        let cstart = start.max(self.start);
        let cstop = match self.stop {
            Some(segment_stop) => stop.min(segment_stop),
            None => stop,
        };
        Some((cstart, cstop))
    }

    /// Convert a stream position inside the segment to running time.
    ///
    /// For reverse playback the running time counts down from `stop`, which
    /// must be set for a reverse segment to be valid.
    pub fn to_running_time(&self, position: u64) -> Option<u64> {
        if self.rate == 0.0 {
            return None;
        }
        let abs_rate = self.rate.abs();
        let distance = if self.rate > 0.0 {
            position.checked_sub(self.start)?
        } else {
            self.stop?.checked_sub(position)?
        };
        let scaled = if abs_rate == 1.0 {
            distance
        } else {
            (distance as f64 / abs_rate) as u64
        };
        Some(self.base + scaled)
    }
}
