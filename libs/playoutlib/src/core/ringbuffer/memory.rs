//! Software ring buffer.
//!
//! Backs the [`RingBuffer`] contract with an in-memory byte area. There is
//! no real device: a driver loop (tests, an offline consumer, or a bridge to
//! a hardware callback) calls [`MemoryRingBuffer::render_segments`] to
//! consume audio, which advances `segdone`/`samples_done` and wakes
//! producers blocked on a full ring.

use super::{RingBuffer, RingBufferCallback};
use crate::core::format::RingBufferSpec;
use crate::core::{Result, SinkError};
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};

/// Fixed-point bits for the source position accumulator in `commit_full`.
const ACCUM_SHIFT: u32 = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RingState {
    Stopped,
    Paused,
    Started,
}

struct Inner {
    device_open: bool,
    acquired: bool,
    state: RingState,
    spec: RingBufferSpec,
    data: Vec<u8>,
    callback: Option<RingBufferCallback>,
}

pub struct MemoryRingBuffer {
    inner: Mutex<Inner>,
    /// Signalled when the reader advances, on flush and on state changes.
    space_cond: Condvar,
    segdone: AtomicI64,
    segbase: AtomicI64,
    samples_done: AtomicU64,
    flushing: AtomicBool,
    start_allowed: AtomicBool,
}

impl MemoryRingBuffer {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                device_open: false,
                acquired: false,
                state: RingState::Stopped,
                spec: RingBufferSpec::default(),
                data: Vec::new(),
                callback: None,
            }),
            space_cond: Condvar::new(),
            segdone: AtomicI64::new(0),
            segbase: AtomicI64::new(0),
            samples_done: AtomicU64::new(0),
            flushing: AtomicBool::new(false),
            start_allowed: AtomicBool::new(false),
        }
    }

    /// Consume `count` segments as the device would: fill from the pull
    /// callback when one is installed, account the samples as played, reset
    /// the segment to silence and advance the reader.
    ///
    /// The callback runs without the ring lock held; it is allowed to call
    /// back into the ring (the EOS path does).
    pub fn render_segments(&self, count: u32) {
        for _ in 0..count {
            let mut inner = self.inner.lock();
            if !inner.acquired || inner.state != RingState::Started {
                return;
            }
            let spec = inner.spec.clone();
            let segsize = spec.segsize as usize;
            let segtotal = spec.segtotal as i64;
            let seg = self.segdone.load(Ordering::Acquire) - self.segbase.load(Ordering::Acquire);
            let ring_seg = (seg % segtotal) as usize;

            if let Some(mut callback) = inner.callback.take() {
                let mut scratch = vec![0u8; segsize];
                drop(inner);
                callback(&mut scratch);
                inner = self.inner.lock();
                if inner.callback.is_none() {
                    inner.callback = Some(callback);
                }
                if !inner.acquired || inner.state != RingState::Started {
                    return;
                }
                inner.data[ring_seg * segsize..(ring_seg + 1) * segsize]
                    .copy_from_slice(&scratch);
            }

            self.samples_done
                .fetch_add(spec.samples_per_seg(), Ordering::AcqRel);
            inner.data[ring_seg * segsize..(ring_seg + 1) * segsize].fill(0);
            self.segdone.fetch_add(1, Ordering::AcqRel);
            self.space_cond.notify_all();
        }
    }

    fn interrupted(&self) -> bool {
        self.flushing.load(Ordering::Acquire)
    }
}

impl Default for MemoryRingBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl RingBuffer for MemoryRingBuffer {
    fn open_device(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.device_open {
            return Err(SinkError::OpenFailed("device already open".into()));
        }
        inner.device_open = true;
        tracing::debug!("memory ring buffer: device open");
        Ok(())
    }

    fn close_device(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.device_open = false;
        Ok(())
    }

    fn acquire(&self, spec: RingBufferSpec) -> Result<()> {
        let mut inner = self.inner.lock();
        if !inner.device_open {
            return Err(SinkError::AcquireFailed("device not open".into()));
        }
        if inner.acquired {
            return Err(SinkError::AcquireFailed("already acquired".into()));
        }
        if !spec.is_valid() {
            return Err(SinkError::AcquireFailed(format!(
                "unusable spec: rate {} bps {} segsize {} segtotal {}",
                spec.rate, spec.bytes_per_sample, spec.segsize, spec.segtotal
            )));
        }
        let mut spec = spec;
        // report the latency the ring actually provides
        spec.update_actual_times();
        tracing::debug!(
            "acquired ring: rate {} segsize {} segtotal {} ({}us/segment)",
            spec.rate,
            spec.segsize,
            spec.segtotal,
            spec.latency_time
        );
        inner.data = vec![0; spec.segsize as usize * spec.segtotal as usize];
        inner.spec = spec;
        inner.acquired = true;
        inner.state = RingState::Stopped;
        self.segdone.store(0, Ordering::Release);
        self.segbase.store(0, Ordering::Release);
        self.samples_done.store(0, Ordering::Release);
        Ok(())
    }

    fn release(&self) -> Result<()> {
        // unblock any producer before tearing the ring down
        self.flushing.store(true, Ordering::Release);
        self.space_cond.notify_all();
        let mut inner = self.inner.lock();
        if !inner.acquired {
            self.flushing.store(false, Ordering::Release);
            return Ok(());
        }
        inner.acquired = false;
        inner.state = RingState::Stopped;
        inner.spec = RingBufferSpec::default();
        inner.data = Vec::new();
        self.flushing.store(false, Ordering::Release);
        tracing::debug!("memory ring buffer: released");
        Ok(())
    }

    fn start(&self) -> bool {
        let mut inner = self.inner.lock();
        if !inner.acquired {
            return false;
        }
        if !self.start_allowed.load(Ordering::Acquire) {
            tracing::debug!("start delayed, not allowed yet");
            return true;
        }
        if inner.state != RingState::Started {
            tracing::debug!("memory ring buffer: started");
            inner.state = RingState::Started;
            self.space_cond.notify_all();
        }
        true
    }

    fn pause(&self) -> bool {
        let mut inner = self.inner.lock();
        if !inner.acquired {
            return false;
        }
        if inner.state == RingState::Started {
            inner.state = RingState::Paused;
            self.space_cond.notify_all();
        }
        true
    }

    fn set_flushing(&self, flushing: bool) {
        self.flushing.store(flushing, Ordering::Release);
        self.space_cond.notify_all();
        if flushing {
            let mut inner = self.inner.lock();
            if inner.state == RingState::Started {
                inner.state = RingState::Paused;
            }
            inner.data.fill(0);
        }
    }

    fn may_start(&self, allowed: bool) {
        self.start_allowed.store(allowed, Ordering::Release);
    }

    fn is_acquired(&self) -> bool {
        self.inner.lock().acquired
    }

    fn is_started(&self) -> bool {
        self.inner.lock().state == RingState::Started
    }

    fn spec(&self) -> RingBufferSpec {
        self.inner.lock().spec.clone()
    }

    fn samples_done(&self) -> u64 {
        self.samples_done.load(Ordering::Acquire)
    }

    fn delay(&self) -> u32 {
        // nothing sits between the ring and the notional output
        0
    }

    fn segdone(&self) -> i64 {
        self.segdone.load(Ordering::Acquire)
    }

    fn segbase(&self) -> i64 {
        self.segbase.load(Ordering::Acquire)
    }

    fn commit_full(
        &self,
        sample_offset: &mut u64,
        data: &[u8],
        in_samples: u64,
        out_samples: i64,
        accum: &mut i64,
    ) -> u64 {
        if in_samples == 0 {
            return 0;
        }
        if out_samples == 0 {
            // zero span, the source cannot be placed anywhere
            return in_samples;
        }
        let reverse = out_samples < 0;
        let out_total = out_samples.unsigned_abs();

        let mut inner = self.inner.lock();
        if !inner.acquired {
            return 0;
        }
        if inner.state != RingState::Started && self.start_allowed.load(Ordering::Acquire) {
            tracing::debug!("memory ring buffer: started by commit");
            inner.state = RingState::Started;
        }
        let spec = inner.spec.clone();
        let bps = spec.bytes_per_sample as usize;
        let sps = spec.samples_per_seg();
        let segtotal = spec.segtotal as i64;
        let ring_samples = sps * spec.segtotal as u64;
        debug_assert!(data.len() >= in_samples as usize * bps);

        let step = ((in_samples as i128) << ACCUM_SHIFT) / out_total as i128;
        let mut position_accum = *accum as i128;
        let mut produced: u64 = 0;

        'outer: while produced < out_total {
            let position = *sample_offset + produced;
            let writeseg = (position / sps) as i64;

            // wait until the write segment is within a full ring of the reader
            loop {
                if self.interrupted() {
                    tracing::debug!("commit interrupted at {} of {}", produced, out_total);
                    break 'outer;
                }
                let segdone_rel = self.segdone.load(Ordering::Acquire)
                    - self.segbase.load(Ordering::Acquire);
                if writeseg - segdone_rel < segtotal {
                    break;
                }
                // a reader that is not running will never free a segment:
                // start it if we may, otherwise hand control back
                if inner.state != RingState::Started {
                    if self.start_allowed.load(Ordering::Acquire) {
                        tracing::debug!("memory ring buffer: started by waiting producer");
                        inner.state = RingState::Started;
                    } else {
                        tracing::debug!("ring full while not allowed to start, leaving commit");
                        break 'outer;
                    }
                }
                tracing::trace!("ring full, waiting (writeseg {writeseg} segdone {segdone_rel})");
                self.space_cond.wait(&mut inner);
                if !inner.acquired {
                    break 'outer;
                }
            }

            // copy at most up to the end of the current segment
            let seg_end = (writeseg as u64 + 1) * sps;
            let chunk = (out_total - produced).min(seg_end - position);
            for k in 0..chunk {
                let src_index =
                    ((position_accum >> ACCUM_SHIFT) as u64).min(in_samples - 1);
                let src_sample = if reverse {
                    in_samples - 1 - src_index
                } else {
                    src_index
                };
                let src_byte = src_sample as usize * bps;
                let dst_byte = ((position + k) % ring_samples) as usize * bps;
                inner.data[dst_byte..dst_byte + bps]
                    .copy_from_slice(&data[src_byte..src_byte + bps]);
                position_accum += step;
            }
            produced += chunk;
        }

        *sample_offset += produced;
        let consumed = ((position_accum >> ACCUM_SHIFT) as u64).min(in_samples);
        *accum = (position_accum - ((consumed as i128) << ACCUM_SHIFT)) as i64;
        if produced == out_total {
            // the full span was placed, the whole source is spoken for
            in_samples
        } else {
            consumed
        }
    }

    fn set_callback(&self, callback: Option<RingBufferCallback>) {
        self.inner.lock().callback = callback;
    }

    fn clear_all(&self) {
        self.inner.lock().data.fill(0);
    }
}
