//! Device-facing ring buffer contract.
//!
//! The sink drives a fixed-size ring of `segtotal` equal segments shared
//! with the audio device: the streaming thread commits samples at absolute
//! sample positions, the device consumes segment by segment and advances
//! `segdone`. Implementations own the device handle between `open_device`
//! and `close_device`; [`MemoryRingBuffer`] is the in-memory implementation
//! used when there is no hardware in the loop.

mod memory;

pub use memory::MemoryRingBuffer;

use super::Result;
use super::format::RingBufferSpec;

/// Producer installed for pull mode. The ring buffer calls it from the
/// device thread with the segment that must be filled next.
pub type RingBufferCallback = Box<dyn FnMut(&mut [u8]) + Send>;

pub trait RingBuffer: Send + Sync {
    /// Take the device. Called once on NULL→READY; no format is bound yet.
    fn open_device(&self) -> Result<()>;

    /// Return the device. Idempotent.
    fn close_device(&self) -> Result<()>;

    /// Bind a format and allocate the ring. `spec` has the geometry derived
    /// from the configured buffer/latency times; the implementation may
    /// adjust it to the device granularity.
    fn acquire(&self, spec: RingBufferSpec) -> Result<()>;

    /// Free the ring and unbind the format. Idempotent; unblocks any waiting
    /// producer first.
    fn release(&self) -> Result<()>;

    /// Start playback. A start while `may_start(false)` is in effect is
    /// remembered as allowed but does nothing yet.
    fn start(&self) -> bool;

    fn pause(&self) -> bool;

    /// While flushing, all blocking calls return immediately and the ring is
    /// cleared to silence.
    fn set_flushing(&self, flushing: bool);

    /// Gate for `start`; the sink keeps this false until the element is
    /// allowed to roll.
    fn may_start(&self, allowed: bool);

    fn is_acquired(&self) -> bool;

    fn is_started(&self) -> bool;

    /// Snapshot of the bound format. `spec().rate == 0` until acquired.
    fn spec(&self) -> RingBufferSpec;

    /// Total samples consumed by the device since acquire. Monotonic.
    fn samples_done(&self) -> u64;

    /// Samples handed to the device but not yet audible.
    fn delay(&self) -> u32;

    /// Segment counter of the device reader.
    fn segdone(&self) -> i64;

    /// Base to subtract from `segdone` after a restart.
    fn segbase(&self) -> i64;

    /// Write `in_samples` source samples so they play back at the absolute
    /// sample position `*sample_offset`, stretched or compressed to span
    /// `out_samples.abs()` positions. A negative `out_samples` writes the
    /// source in reverse order (reverse-rate segments).
    ///
    /// Blocks while the ring is full; flushing or stopping interrupts the
    /// wait. Returns the number of source samples actually written, which is
    /// less than `in_samples` only when interrupted. `*sample_offset` is
    /// advanced by the output samples produced and `*accum` carries the
    /// resampler phase between calls.
    fn commit_full(
        &self,
        sample_offset: &mut u64,
        data: &[u8],
        in_samples: u64,
        out_samples: i64,
        accum: &mut i64,
    ) -> u64;

    /// Install or clear the pull-mode producer.
    fn set_callback(&self, callback: Option<RingBufferCallback>);

    /// Reset every segment to silence.
    fn clear_all(&self);
}
