//! Playout clock (sample-accurate)
//!
//! Reports how much audio the device has actually played, derived from the
//! ring buffer's consumed-sample counter minus the samples still queued in
//! the device. The clock carries an affine calibration against an external
//! timeline and can optionally be mastered by another clock, in which case
//! periodic observations regress the calibration rate.

use super::Clock;
use crate::core::format::samples_to_ns;
use crate::core::ringbuffer::RingBuffer;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering, fence};
use std::sync::{Arc, Weak};

/// Affine mapping between this clock's internal timeline and an external
/// one: external = cexternal + (internal − cinternal) · rate_num/rate_denom.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Calibration {
    pub internal: u64,
    pub external: u64,
    pub rate_num: u64,
    pub rate_denom: u64,
}

impl Default for Calibration {
    fn default() -> Self {
        Self {
            internal: 0,
            external: 0,
            rate_num: 1,
            rate_denom: 1,
        }
    }
}

impl Calibration {
    /// Effective rate, mapping a zero numerator to identity.
    pub fn rate(&self) -> (u64, u64) {
        if self.rate_num == 0 || self.rate_denom == 0 {
            (1, 1)
        } else {
            (self.rate_num, self.rate_denom)
        }
    }
}

/// Sequence-counter snapshot of the calibration quadruple. Readers never
/// block; writers are serialized by the tracker mutex in [`AudioClock`].
struct CalibrationCell {
    seq: AtomicU64,
    internal: AtomicU64,
    external: AtomicU64,
    rate_num: AtomicU64,
    rate_denom: AtomicU64,
}

impl CalibrationCell {
    fn new(calibration: Calibration) -> Self {
        Self {
            seq: AtomicU64::new(0),
            internal: AtomicU64::new(calibration.internal),
            external: AtomicU64::new(calibration.external),
            rate_num: AtomicU64::new(calibration.rate_num),
            rate_denom: AtomicU64::new(calibration.rate_denom),
        }
    }

    fn read(&self) -> Calibration {
        loop {
            let begin = self.seq.load(Ordering::Acquire);
            if begin & 1 == 1 {
                std::hint::spin_loop();
                continue;
            }
            let snapshot = Calibration {
                internal: self.internal.load(Ordering::Relaxed),
                external: self.external.load(Ordering::Relaxed),
                rate_num: self.rate_num.load(Ordering::Relaxed),
                rate_denom: self.rate_denom.load(Ordering::Relaxed),
            };
            fence(Ordering::Acquire);
            if self.seq.load(Ordering::Relaxed) == begin {
                return snapshot;
            }
        }
    }

    /// Caller must hold the writer lock.
    fn write(&self, calibration: Calibration) {
        self.seq.fetch_add(1, Ordering::Relaxed);
        fence(Ordering::Release);
        self.internal.store(calibration.internal, Ordering::Relaxed);
        self.external.store(calibration.external, Ordering::Relaxed);
        self.rate_num.store(calibration.rate_num, Ordering::Relaxed);
        self.rate_denom
            .store(calibration.rate_denom, Ordering::Relaxed);
        self.seq.fetch_add(1, Ordering::Release);
    }
}

/// Observations kept while another clock masters this one.
struct MasterTracking {
    master: Option<Arc<dyn Clock>>,
    window: VecDeque<(u64, u64)>,
}

const MASTER_WINDOW: usize = 32;
const MASTER_MIN_SAMPLES: usize = 4;

pub struct AudioClock {
    description: String,

    calibration: CalibrationCell,

    /// Serializes calibration writers and master bookkeeping.
    tracker: Mutex<MasterTracking>,

    /// Non-owning handle to the ring buffer the position is read from.
    position_source: Mutex<Option<Weak<dyn RingBuffer>>>,

    /// Upstream latency folded into the reported position, nanoseconds.
    us_latency: AtomicU64,

    /// Highest time handed out so far, so observers never see time move
    /// backwards across device restarts.
    last_time: AtomicU64,
}

impl AudioClock {
    pub fn new(description: String) -> Self {
        Self {
            description,
            calibration: CalibrationCell::new(Calibration::default()),
            tracker: Mutex::new(MasterTracking {
                master: None,
                window: VecDeque::with_capacity(MASTER_WINDOW),
            }),
            position_source: Mutex::new(None),
            us_latency: AtomicU64::new(0),
            last_time: AtomicU64::new(0),
        }
    }

    pub fn set_position_source(&self, ringbuffer: &Arc<dyn RingBuffer>) {
        *self.position_source.lock() = Some(Arc::downgrade(ringbuffer));
    }

    pub fn clear_position_source(&self) {
        *self.position_source.lock() = None;
    }

    /// Raw playout position: played samples converted to time plus the
    /// upstream latency. `None` without a ring buffer or before a format is
    /// bound.
    pub fn internal_time_ns(&self) -> Option<u64> {
        let ringbuffer = self.position_source.lock().as_ref()?.upgrade()?;
        let spec = ringbuffer.spec();
        if spec.rate == 0 {
            return None;
        }
        let raw = ringbuffer.samples_done();
        let delay = ringbuffer.delay() as u64;
        let samples = raw.saturating_sub(delay);
        let time = samples_to_ns(samples, spec.rate) + self.us_latency.load(Ordering::Acquire);
        tracing::trace!(
            "playout position: raw {} delay {} real {} time {}ns",
            raw,
            delay,
            samples,
            time
        );
        Some(time)
    }

    pub fn calibration(&self) -> Calibration {
        self.calibration.read()
    }

    pub fn set_calibration(&self, calibration: Calibration) {
        let _tracker = self.tracker.lock();
        self.calibration.write(calibration);
    }

    pub fn us_latency(&self) -> u64 {
        self.us_latency.load(Ordering::Acquire)
    }

    pub fn set_us_latency(&self, latency_ns: u64) {
        self.us_latency.store(latency_ns, Ordering::Release);
    }

    /// Install or remove a master clock. While mastered, calls to
    /// [`observe_master`](Self::observe_master) drive the calibration rate.
    pub fn set_master(&self, master: Option<Arc<dyn Clock>>) {
        let mut tracker = self.tracker.lock();
        if master.is_some() {
            tracing::debug!("{}: slaving to master clock", self.description);
        } else if tracker.master.is_some() {
            tracing::debug!("{}: released from master clock", self.description);
        }
        tracker.master = master;
        tracker.window.clear();
    }

    pub fn is_mastered(&self) -> bool {
        self.tracker.lock().master.is_some()
    }

    /// Take one (master time, internal time) observation and refresh the
    /// calibration rate by linear regression over the recent window.
    pub fn observe_master(&self) {
        let mut tracker = self.tracker.lock();
        let Some(master) = tracker.master.clone() else {
            return;
        };
        let (Some(external), Some(internal)) = (master.now_ns(), self.internal_time_ns()) else {
            return;
        };
        if tracker.window.len() == MASTER_WINDOW {
            tracker.window.pop_front();
        }
        tracker.window.push_back((internal, external));
        if tracker.window.len() < MASTER_MIN_SAMPLES {
            return;
        }

        let Some((rate_num, rate_denom, internal_mean, external_mean)) =
            regress(tracker.window.make_contiguous())
        else {
            return;
        };

        let calibration = Calibration {
            internal: internal_mean,
            external: external_mean,
            rate_num,
            rate_denom,
        };
        tracing::trace!(
            "master regression: internal {} external {} rate {}/{}",
            calibration.internal,
            calibration.external,
            rate_num,
            rate_denom
        );
        self.calibration.write(calibration);
    }
}

/// Least-squares slope of external over internal plus the window means.
/// Returns `None` while the window carries no usable spread.
fn regress(window: &[(u64, u64)]) -> Option<(u64, u64, u64, u64)> {
    let n = window.len() as i128;
    let sum_internal: i128 = window.iter().map(|(i, _)| *i as i128).sum();
    let sum_external: i128 = window.iter().map(|(_, e)| *e as i128).sum();
    let internal_mean = sum_internal / n;
    let external_mean = sum_external / n;

    let mut covariance: i128 = 0;
    let mut variance: i128 = 0;
    for (internal, external) in window {
        let di = *internal as i128 - internal_mean;
        let de = *external as i128 - external_mean;
        covariance += di * de;
        variance += di * di;
    }
    if variance <= 0 || covariance <= 0 {
        return None;
    }
    // the rate only needs the ratio, keep both terms in u64 range
    while covariance > u64::MAX as i128 || variance > u64::MAX as i128 {
        covariance >>= 4;
        variance >>= 4;
    }
    if variance == 0 || covariance == 0 {
        return None;
    }
    Some((
        covariance as u64,
        variance as u64,
        internal_mean as u64,
        external_mean as u64,
    ))
}

impl Clock for AudioClock {
    fn now_ns(&self) -> Option<u64> {
        let internal = self.internal_time_ns()?;
        let calibration = self.calibration.read();
        let (rate_num, rate_denom) = calibration.rate();

        let adjusted = if internal >= calibration.internal {
            let delta = internal - calibration.internal;
            calibration.external
                .saturating_add(((delta as u128 * rate_num as u128) / rate_denom as u128) as u64)
        } else {
            let delta = calibration.internal - internal;
            calibration.external
                .saturating_sub(((delta as u128 * rate_num as u128) / rate_denom as u128) as u64)
        };

        // never report time going backwards
        let previous = self.last_time.fetch_max(adjusted, Ordering::AcqRel);
        Some(previous.max(adjusted))
    }

    fn description(&self) -> &str {
        &self.description
    }
}
