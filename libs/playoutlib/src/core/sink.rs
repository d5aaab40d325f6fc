//! The audio sink synchronization engine.
//!
//! Owns the ring buffer and the playout clock and keeps three moving parts
//! in agreement: the absolute sample position committed to the ring, the
//! buffer timestamps arriving from upstream, and the pipeline clock the
//! element was told to sync against. The streaming thread calls
//! [`AudioBaseSink::render`]; the pipeline drives the state machine through
//! [`AudioBaseSink::set_state`].

use super::buffers::AudioBuffer;
use super::clocks::{AudioClock, Calibration, Clock};
use super::config::{SinkConfig, SlaveMethod};
use super::error::{FlowError, FlowResult, Result, SinkError};
use super::format::{AudioCaps, RingBufferSpec, samples_to_ns};
use super::messages::{MessageDomain, SinkMessage};
use super::ringbuffer::RingBuffer;
use super::segment::Segment;
use super::slaving::{convert_external, skew_update};
use parking_lot::Mutex;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ElementState {
    Null,
    Ready,
    Paused,
    Playing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateChange {
    NullToReady,
    ReadyToPaused,
    PausedToPlaying,
    PlayingToPaused,
    PausedToReady,
    ReadyToNull,
}

/// Events arriving on the sink pad.
#[derive(Debug, Clone, PartialEq)]
pub enum SinkEvent {
    FlushStart,
    FlushStop,
    NewSegment(Segment),
    Eos,
}

/// Upstream latency as answered by the peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerLatency {
    pub is_live: bool,
    pub upstream_live: bool,
    pub min_ns: u64,
    /// `None` means the peer can buffer an unbounded amount.
    pub max_ns: Option<u64>,
}

/// Latency reported by this sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Latency {
    pub live: bool,
    pub min_ns: u64,
    pub max_ns: Option<u64>,
}

/// Result of pulling a range from the upstream peer in pull mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PullError {
    Eos,
    Flow(FlowError),
}

/// The pipeline surface the sink calls up to. One implementation per
/// embedding; everything has a workable default except the clock.
pub trait PipelineContext: Send + Sync {
    /// Clock selected for the pipeline, possibly the one this sink provides.
    fn clock(&self) -> Option<Arc<dyn Clock>>;

    fn base_time(&self) -> u64 {
        0
    }

    /// Configured pipeline latency added before syncing.
    fn latency(&self) -> u64 {
        0
    }

    /// Upstream latency query. `None` when the query failed.
    fn peer_latency(&self) -> Option<PeerLatency> {
        None
    }

    /// Block until preroll completes or the element winds down. Called when
    /// a commit was interrupted.
    fn wait_preroll(&self) -> FlowResult {
        Ok(())
    }

    /// Block until `running_time` elapsed on the pipeline clock. Cancellable
    /// by flushing and state changes.
    fn wait_eos(&self, running_time: u64) -> FlowResult {
        let _ = running_time;
        Ok(())
    }

    /// Pull `length` bytes at `offset` from the peer (pull mode only).
    fn pull_range(&self, offset: u64, length: u32) -> std::result::Result<Vec<u8>, PullError> {
        let _ = (offset, length);
        Err(PullError::Flow(FlowError::Error))
    }

    fn post_message(&self, message: SinkMessage);
}

/// Creates the device ring buffer during NULL→READY. The returned object is
/// owned by the sink for the rest of its life.
pub type RingBufferFactory = Box<dyn Fn() -> Arc<dyn RingBuffer> + Send + Sync>;

struct Shared {
    config: SinkConfig,
    state: ElementState,
    ringbuffer: Option<Arc<dyn RingBuffer>>,
    segment: Segment,
    /// Sample index one past the last committed sample; −1 forces a resync.
    next_sample: i64,
    /// Moving average of the clock skew in ns; −1 until the first
    /// observation.
    avg_skew: i64,
    /// Samples the last alignment moved the playout pointer by, signed.
    last_align: i64,
    /// Read position of the pull-mode producer, bytes.
    pull_offset: u64,
}

pub struct AudioBaseSink {
    context: Arc<dyn PipelineContext>,
    factory: RingBufferFactory,
    provided_clock: Arc<AudioClock>,
    shared: Mutex<Shared>,
}

impl AudioBaseSink {
    pub fn new(
        config: SinkConfig,
        factory: RingBufferFactory,
        context: Arc<dyn PipelineContext>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            context,
            factory,
            provided_clock: Arc::new(AudioClock::new("playout-clock".to_string())),
            shared: Mutex::new(Shared {
                config,
                state: ElementState::Null,
                ringbuffer: None,
                segment: Segment::default(),
                next_sample: -1,
                avg_skew: -1,
                last_align: 0,
                pull_offset: 0,
            }),
        })
    }

    pub fn config(&self) -> SinkConfig {
        self.shared.lock().config.clone()
    }

    pub fn set_config(&self, config: SinkConfig) -> Result<()> {
        config.validate()?;
        self.shared.lock().config = config;
        Ok(())
    }

    pub fn state(&self) -> ElementState {
        self.shared.lock().state
    }

    /// Sample index one past the last committed sample, −1 after a resync.
    pub fn next_sample(&self) -> i64 {
        self.shared.lock().next_sample
    }

    pub fn last_align(&self) -> i64 {
        self.shared.lock().last_align
    }

    pub fn avg_skew(&self) -> i64 {
        self.shared.lock().avg_skew
    }

    pub fn ringbuffer(&self) -> Option<Arc<dyn RingBuffer>> {
        self.shared.lock().ringbuffer.clone()
    }

    /// The playout clock this sink maintains.
    pub fn provided_clock(&self) -> &Arc<AudioClock> {
        &self.provided_clock
    }

    /// The clock this sink offers the pipeline: available once a format is
    /// bound, unless providing was disabled.
    pub fn provide_clock(&self) -> Option<Arc<dyn Clock>> {
        let shared = self.shared.lock();
        let ringbuffer = shared.ringbuffer.as_ref()?;
        if !ringbuffer.is_acquired() {
            tracing::debug!("ring buffer not acquired, no clock to provide");
            return None;
        }
        if !shared.config.provide_clock {
            tracing::debug!("clock provide disabled");
            return None;
        }
        Some(Arc::clone(&self.provided_clock) as Arc<dyn Clock>)
    }

    fn is_provided_clock(&self, clock: &Arc<dyn Clock>) -> bool {
        std::ptr::addr_eq(Arc::as_ptr(clock), Arc::as_ptr(&self.provided_clock))
    }

    /// Apply the default format choices to any caps field the peer left
    /// open.
    pub fn fixate_caps(&self, caps: &mut AudioCaps) {
        caps.fixate();
    }

    /// Bind a new format: release any previous ring, size the segments from
    /// the configured times, acquire, and read back the latency the device
    /// actually provides.
    pub fn set_caps(&self, caps: &AudioCaps) -> Result<()> {
        let (ringbuffer, config) = {
            let shared = self.shared.lock();
            let ringbuffer = shared
                .ringbuffer
                .clone()
                .ok_or_else(|| SinkError::StateChange("no ring buffer yet".into()))?;
            (ringbuffer, shared.config.clone())
        };

        tracing::debug!("release old ring buffer");
        ringbuffer.release()?;

        let mut spec = RingBufferSpec {
            buffer_time: config.buffer_time_us,
            latency_time: config.latency_time_us,
            ..Default::default()
        };

        tracing::debug!("parse caps");
        if let Err(error) = caps.fill_spec(&mut spec) {
            self.context.post_message(SinkMessage::Error {
                domain: MessageDomain::StreamFormat,
                text: "cannot parse audio format".into(),
                debug: error.to_string(),
            });
            return Err(error);
        }
        spec.derive_segments()?;

        tracing::debug!("acquire new ring buffer");
        ringbuffer.acquire(spec)?;

        let actual = ringbuffer.spec();
        tracing::debug!(
            "acquired: rate {} segsize {} segtotal {} latency {}us buffer {}us",
            actual.rate,
            actual.segsize,
            actual.segtotal,
            actual.latency_time,
            actual.buffer_time
        );
        Ok(())
    }

    /// Walk the state machine one transition at a time until `target`.
    pub fn set_state(&self, target: ElementState) -> Result<()> {
        loop {
            let current = self.shared.lock().state;
            let transition = match (current.cmp(&target), current) {
                (std::cmp::Ordering::Equal, _) => return Ok(()),
                (std::cmp::Ordering::Less, ElementState::Null) => StateChange::NullToReady,
                (std::cmp::Ordering::Less, ElementState::Ready) => StateChange::ReadyToPaused,
                (std::cmp::Ordering::Less, ElementState::Paused) => StateChange::PausedToPlaying,
                (std::cmp::Ordering::Greater, ElementState::Playing) => {
                    StateChange::PlayingToPaused
                }
                (std::cmp::Ordering::Greater, ElementState::Paused) => StateChange::PausedToReady,
                (std::cmp::Ordering::Greater, ElementState::Ready) => StateChange::ReadyToNull,
                _ => return Err(SinkError::StateChange(format!(
                    "no path from {current:?} to {target:?}"
                ))),
            };
            self.change_state(transition)?;
        }
    }

    pub fn change_state(&self, transition: StateChange) -> Result<()> {
        tracing::debug!("state change {:?}", transition);
        match transition {
            StateChange::NullToReady => {
                let ringbuffer = {
                    let mut shared = self.shared.lock();
                    match &shared.ringbuffer {
                        Some(ringbuffer) => Arc::clone(ringbuffer),
                        None => {
                            let ringbuffer = (self.factory)();
                            self.provided_clock.set_position_source(&ringbuffer);
                            shared.ringbuffer = Some(Arc::clone(&ringbuffer));
                            ringbuffer
                        }
                    }
                };
                // the subclass posts the detailed message on failure
                ringbuffer.open_device()?;
                self.shared.lock().state = ElementState::Ready;
            }
            StateChange::ReadyToPaused => {
                let mut shared = self.shared.lock();
                shared.next_sample = -1;
                shared.last_align = -1;
                if let Some(ringbuffer) = shared.ringbuffer.clone() {
                    ringbuffer.set_flushing(false);
                    ringbuffer.may_start(false);
                }
                shared.state = ElementState::Paused;
            }
            StateChange::PausedToPlaying => {
                let mut shared = self.shared.lock();
                self.async_play_locked(&mut shared)?;
                shared.state = ElementState::Playing;
            }
            StateChange::PlayingToPaused => {
                {
                    let mut shared = self.shared.lock();
                    if let Some(ringbuffer) = shared.ringbuffer.clone() {
                        ringbuffer.may_start(false);
                        ringbuffer.pause();
                    }
                    shared.state = ElementState::Paused;
                }
                // stop slaving ourselves to the master, if any
                self.provided_clock.set_master(None);
            }
            StateChange::PausedToReady => {
                // unblock the streaming thread before committing the state
                let ringbuffer = self.shared.lock().ringbuffer.clone();
                if let Some(ringbuffer) = &ringbuffer {
                    ringbuffer.set_flushing(true);
                }
                self.shared.lock().state = ElementState::Ready;
                if let Some(ringbuffer) = &ringbuffer {
                    ringbuffer.release()?;
                }
            }
            StateChange::ReadyToNull => {
                // the acquire happens on caps, which may have landed after
                // the PAUSED→READY release: release again before closing
                let ringbuffer = self.shared.lock().ringbuffer.clone();
                if let Some(ringbuffer) = &ringbuffer {
                    ringbuffer.release()?;
                    ringbuffer.close_device()?;
                }
                self.shared.lock().state = ElementState::Null;
            }
        }
        Ok(())
    }

    /// Allow the ring buffer to roll and, when slaved, seed the calibration
    /// with the current clock pair. Called on PAUSED→PLAYING and by the base
    /// sink when an async state change completes.
    pub fn async_play(&self) -> Result<()> {
        let mut shared = self.shared.lock();
        self.async_play_locked(&mut shared)
    }

    fn async_play_locked(&self, shared: &mut Shared) -> Result<()> {
        let ringbuffer = shared
            .ringbuffer
            .clone()
            .ok_or_else(|| SinkError::StateChange("no ring buffer yet".into()))?;

        tracing::debug!("ring buffer may start now");
        ringbuffer.may_start(true);

        let Some(clock) = self.context.clock() else {
            return Ok(());
        };
        // we provided the global clock, nothing special to do
        if self.is_provided_clock(&clock) {
            return Ok(());
        }

        let external = clock.now_ns().unwrap_or(0);
        let internal = self.provided_clock.internal_time_ns().unwrap_or(0);

        shared.avg_skew = -1;
        shared.next_sample = -1;

        tracing::debug!("slaved start: internal {internal}ns external {external}ns");

        let calibration = self.provided_clock.calibration();
        self.provided_clock.set_calibration(Calibration {
            internal,
            external,
            rate_num: calibration.rate_num,
            rate_denom: calibration.rate_denom,
        });

        if shared.config.slave_method == SlaveMethod::Resample {
            tracing::debug!("setting pipeline clock as master");
            self.provided_clock.set_master(Some(clock));
        }

        // start right away so slaving can begin observing
        ringbuffer.start();
        Ok(())
    }

    fn not_negotiated(&self) -> FlowError {
        tracing::debug!("ring buffer not negotiated");
        self.context.post_message(SinkMessage::Error {
            domain: MessageDomain::StreamFormat,
            text: "sink not negotiated".into(),
            debug: String::new(),
        });
        FlowError::NotNegotiated
    }

    /// Nothing plays during preroll; the buffer only proves negotiation
    /// happened.
    pub fn preroll(&self, _buffer: &AudioBuffer) -> FlowResult {
        let acquired = self
            .shared
            .lock()
            .ringbuffer
            .as_ref()
            .is_some_and(|ringbuffer| ringbuffer.is_acquired());
        if !acquired {
            return Err(self.not_negotiated());
        }
        Ok(())
    }

    /// A write position that playback cannot have passed yet, for buffers
    /// rendered without sync.
    fn asap_offset(next_sample: i64, ringbuffer: &dyn RingBuffer, spec: &RingBufferSpec) -> u64 {
        // assume we can append to the previous sample
        let mut sample = next_sample.max(0) as u64;
        let samples_per_seg = spec.samples_per_seg();
        let writeseg = (sample / samples_per_seg) as i64;
        let segdone = ringbuffer.segdone() - ringbuffer.segbase();
        if writeseg < segdone {
            // would land behind the reader, bump to the next playable spot
            sample = (segdone + 1) as u64 * samples_per_seg;
        }
        sample
    }

    fn none_slaving(&self, render_start: u64, render_stop: u64) -> (u64, u64) {
        let calibration = self.provided_clock.calibration();
        let us_latency = self.provided_clock.us_latency();
        (
            convert_external(render_start, &calibration, us_latency),
            convert_external(render_stop, &calibration, us_latency),
        )
    }

    fn resample_slaving(&self, render_start: u64, render_stop: u64) -> (u64, u64) {
        // the master observer keeps the calibration rate current
        self.provided_clock.observe_master();
        let calibration = self.provided_clock.calibration();
        let (rate_num, rate_denom) = calibration.rate();
        tracing::debug!(
            "resample slaving: internal {} external {} rate {}/{}",
            calibration.internal,
            calibration.external,
            rate_num,
            rate_denom
        );
        let us_latency = self.provided_clock.us_latency();
        (
            convert_external(render_start, &calibration, us_latency),
            convert_external(render_stop, &calibration, us_latency),
        )
    }

    fn skew_slaving(
        &self,
        shared: &mut Shared,
        spec: &RingBufferSpec,
        clock: &Arc<dyn Clock>,
        render_start: u64,
        render_stop: u64,
    ) -> (u64, u64) {
        let calibration = self.provided_clock.calibration();

        // sample both clocks relative to their anchors
        let external = clock
            .now_ns()
            .unwrap_or(0)
            .saturating_sub(calibration.external);
        let internal = self
            .provided_clock
            .internal_time_ns()
            .unwrap_or(0)
            .saturating_sub(calibration.internal);
        let skew = internal as i64 - external as i64;

        let adjust = skew_update(
            calibration,
            shared.avg_skew,
            skew,
            spec.segment_time_ns() as i64,
            spec.samples_per_seg() as i64,
            shared.last_align,
        );
        tracing::debug!(
            "skew: internal {internal} external {external} skew {skew} avg {}",
            adjust.avg_skew
        );
        shared.avg_skew = adjust.avg_skew;
        if adjust.corrected {
            if adjust.resync {
                tracing::debug!(
                    "last align {} worked against the correction, resyncing",
                    shared.last_align
                );
                shared.next_sample = -1;
            }
            self.provided_clock.set_calibration(adjust.calibration);
        }

        let us_latency = self.provided_clock.us_latency();
        (
            convert_external(render_start, &adjust.calibration, us_latency),
            convert_external(render_stop, &adjust.calibration, us_latency),
        )
    }

    fn handle_slaving(
        &self,
        shared: &mut Shared,
        spec: &RingBufferSpec,
        clock: &Arc<dyn Clock>,
        render_start: u64,
        render_stop: u64,
    ) -> (u64, u64) {
        match shared.config.slave_method {
            SlaveMethod::Resample => self.resample_slaving(render_start, render_stop),
            SlaveMethod::Skew => {
                self.skew_slaving(shared, spec, clock, render_start, render_stop)
            }
            SlaveMethod::None => self.none_slaving(render_start, render_stop),
        }
    }

    pub fn render(&self, buffer: &AudioBuffer) -> FlowResult {
        let mut shared = self.shared.lock();

        let Some(ringbuffer) = shared.ringbuffer.clone() else {
            return Err(self.not_negotiated());
        };
        if !ringbuffer.is_acquired() {
            return Err(self.not_negotiated());
        }

        let spec = ringbuffer.spec();
        let bps = spec.bytes_per_sample as u64;
        let size = buffer.byte_size() as u64;
        if size % bps != 0 {
            tracing::debug!("wrong size: {size} bytes with {bps} bytes per sample");
            self.context.post_message(SinkMessage::Error {
                domain: MessageDomain::StreamWrongType,
                text: "sink received buffer of wrong size".into(),
                debug: format!("{size} bytes is not a multiple of {bps}"),
            });
            return Err(FlowError::Error);
        }

        let mut samples = size / bps;
        let mut data = buffer.data();

        let segment = shared.segment;
        let forward = segment.rate >= 0.0;
        let sync_clock = if shared.config.sync {
            self.context.clock()
        } else {
            None
        };

        let render_start_samples: i64;
        let render_stop_samples: i64;
        let out_samples: i64;
        let mut buffer_stop: Option<u64> = None;

        'positioned: {
            let Some(time) = buffer.timestamp_ns else {
                let start = Self::asap_offset(shared.next_sample, &*ringbuffer, &spec);
                tracing::debug!(
                    "buffer of {samples} samples has no time, rendering at {start}"
                );
                render_start_samples = start as i64;
                render_stop_samples = start as i64 + samples as i64;
                out_samples = samples as i64;
                break 'positioned;
            };

            // derive stop from the sample count rather than trusting the
            // buffer duration
            let stop = time.saturating_add(spec.samples_to_ns(samples));
            let Some((ctime, cstop)) = segment.clip(time, stop) else {
                tracing::debug!(
                    "dropping buffer out of segment: time {time} segment start {}",
                    segment.start
                );
                return Ok(());
            };
            let head = ctime - time;
            if head > 0 {
                let clipped = spec.ns_to_samples(head);
                tracing::debug!("clipping {clipped} samples off the start");
                samples -= clipped;
                data = &data[(clipped * bps) as usize..];
            }
            let tail = stop - cstop;
            if tail > 0 {
                let clipped = spec.ns_to_samples(tail);
                tracing::debug!("clipping {clipped} samples off the end");
                samples -= clipped;
            }
            buffer_stop = Some(cstop);

            let Some(clock) = &sync_clock else {
                // no sync possible or wanted, play as soon as we can
                let start = Self::asap_offset(shared.next_sample, &*ringbuffer, &spec);
                tracing::debug!("no sync needed, rendering at {start}");
                render_start_samples = start as i64;
                render_stop_samples = start as i64 + samples as i64;
                out_samples = samples as i64;
                break 'positioned;
            };

            let running_start = segment.to_running_time(ctime).unwrap_or(0);
            let running_stop = segment.to_running_time(cstop).unwrap_or(0);
            tracing::debug!("running: start {running_start} stop {running_stop}");

            // sync against the pipeline clock: base time plus the configured
            // latency bring us into its timeline
            let base_time = self.context.base_time();
            let latency = self.context.latency();
            let mut render_start = running_start
                .saturating_add(base_time)
                .saturating_add(latency);
            let mut render_stop = running_stop
                .saturating_add(base_time)
                .saturating_add(latency);

            let slaved = !self.is_provided_clock(clock);
            (render_start, render_stop) = if slaved {
                self.handle_slaving(&mut shared, &spec, clock, render_start, render_stop)
            } else {
                // no slaving, but the calibration still applies
                self.none_slaving(render_start, render_stop)
            };
            tracing::debug!("after slaving: start {render_start} stop {render_stop}");

            let mut start_samples = spec.ns_to_samples(render_start) as i64;
            let mut stop_samples = spec.ns_to_samples(render_stop) as i64;

            // alignment against the previous buffer's tail
            if buffer.discont {
                tracing::debug!("resync after discont");
                shared.last_align = 0;
            } else if shared.next_sample == -1 {
                tracing::debug!("no align possible: no previous sample position known");
                shared.last_align = 0;
            } else {
                let reference = if forward { start_samples } else { stop_samples };
                let diff = (reference - shared.next_sample).unsigned_abs();

                // half a second of drift is taken to be rounding error and
                // absorbed; beyond it the stream has genuinely jumped
                let align = if diff < spec.rate as u64 / 2 {
                    let align = shared.next_sample - reference;
                    tracing::debug!("aligning with previous sample, moving {align}");
                    align
                } else {
                    let drift = spec.samples_to_ns(diff);
                    tracing::warn!("unexpected timestamp discontinuity of {drift}ns, resyncing");
                    self.context.post_message(SinkMessage::Warning {
                        domain: MessageDomain::CoreClock,
                        text: "Compensating for audio synchronisation problems".into(),
                        debug: format!(
                            "Unexpected discontinuity in audio timestamps of more \
                             than half a second ({drift}ns), resyncing"
                        ),
                    });
                    0
                };
                shared.last_align = align;
                start_samples += align;
                if slaved && shared.config.slave_method == SlaveMethod::Resample {
                    // the stop position is the resampler target, leave it
                    tracing::debug!("no stop time align needed: we are slaved");
                } else {
                    stop_samples += align;
                }
            }

            render_start_samples = start_samples;
            render_stop_samples = stop_samples;
            out_samples = stop_samples - start_samples;
        }

        // first or last sample first, depending on playback direction
        let first_sample = if forward {
            render_start_samples
        } else {
            render_stop_samples
        };
        let mut sample_offset = first_sample.max(0) as u64;

        // release the sink lock: the commit can block and must stay
        // cancellable by flush and state changes
        drop(shared);

        tracing::debug!("rendering at {sample_offset} {samples}/{out_samples}");

        let mut accum = 0i64;
        let mut align_next = true;
        loop {
            let written =
                ringbuffer.commit_full(&mut sample_offset, data, samples, out_samples, &mut accum);
            tracing::debug!("wrote {written} of {samples}");
            if written == samples {
                break;
            }
            if written == 0 && !ringbuffer.is_acquired() {
                // a released ring can make no progress
                return Err(FlowError::WrongState);
            }

            // something interrupted the commit, wait for preroll or shutdown
            self.context.wait_preroll()?;

            // the interruption broke continuity with the next buffer
            align_next = false;
            samples -= written;
            data = &data[(written * bps) as usize..];
        }

        let mut shared = self.shared.lock();
        shared.next_sample = if align_next { sample_offset as i64 } else { -1 };
        tracing::debug!("next sample expected at {}", shared.next_sample);
        drop(shared);

        // when the content ends before the device buffer fills, playback
        // must still start
        if let (Some(stop), Some(segment_stop)) = (buffer_stop, segment.stop) {
            if stop >= segment_stop {
                tracing::debug!("start playback because we are at the end of segment");
                ringbuffer.start();
            }
        }

        Ok(())
    }

    pub fn event(&self, event: SinkEvent) {
        match event {
            SinkEvent::FlushStart => {
                if let Some(ringbuffer) = self.shared.lock().ringbuffer.clone() {
                    ringbuffer.set_flushing(true);
                }
            }
            SinkEvent::FlushStop => {
                // always resync after a flush
                let mut shared = self.shared.lock();
                shared.avg_skew = -1;
                shared.next_sample = -1;
                if let Some(ringbuffer) = shared.ringbuffer.clone() {
                    ringbuffer.set_flushing(false);
                }
            }
            SinkEvent::NewSegment(segment) => {
                tracing::debug!("new segment rate {}", segment.rate);
                self.shared.lock().segment = segment;
            }
            SinkEvent::Eos => {
                self.drain();
            }
        }
    }

    /// Block until everything committed so far has been played out. No-op
    /// when there is nothing pending; cancellable through the pipeline's
    /// `wait_eos`.
    pub fn drain(&self) {
        let shared = self.shared.lock();
        let Some(ringbuffer) = shared.ringbuffer.clone() else {
            return;
        };
        let spec = ringbuffer.spec();
        if spec.rate == 0 {
            return;
        }

        // playback must be running before it can drain; the content may have
        // been shorter than the device buffer
        if ringbuffer.is_acquired() {
            ringbuffer.start();
        }

        let next_sample = shared.next_sample;
        drop(shared);

        if next_sample != -1 {
            let time = samples_to_ns(next_sample as u64, spec.rate);
            tracing::debug!("draining until sample {next_sample}, time {time}ns");

            // our time includes the base time, wait_eos wants running time
            let running_time = time.saturating_sub(self.context.base_time());
            let _ = self.context.wait_eos(running_time);

            self.shared.lock().next_sample = -1;
        }
    }

    /// Combined latency of the device buffer and the upstream peer. `None`
    /// until a format is negotiated.
    pub fn query_latency(&self) -> Option<Latency> {
        let spec = {
            let shared = self.shared.lock();
            let ringbuffer = shared.ringbuffer.as_ref()?;
            ringbuffer.spec()
        };
        if spec.rate == 0 {
            tracing::debug!("not yet negotiated, can't report latency");
            return None;
        }

        let peer = self.context.peer_latency()?;
        if peer.is_live && peer.upstream_live {
            self.provided_clock.set_us_latency(peer.min_ns);

            let ours = ((spec.seglatency as u128 * spec.segsize as u128
                * super::format::NSECS_PER_SEC as u128)
                / (spec.rate as u128 * spec.bytes_per_sample as u128)) as u64;
            // we cannot go lower than the device buffer plus the peer
            let min_ns = ours + peer.min_ns;
            let max_ns = peer.max_ns.map(|max| min_ns + max);
            tracing::debug!("latency: peer min {} our min {}", peer.min_ns, min_ns);
            Some(Latency {
                live: true,
                min_ns,
                max_ns,
            })
        } else {
            tracing::debug!("peer or we are not live, don't care about latency");
            Some(Latency {
                live: peer.is_live,
                min_ns: 0,
                max_ns: None,
            })
        }
    }

    /// Switch the sink into or out of pull mode: the ring buffer then asks
    /// us for data and we pull it from the peer.
    pub fn activate_pull(self: &Arc<Self>, active: bool) -> bool {
        let Some(ringbuffer) = self.shared.lock().ringbuffer.clone() else {
            return false;
        };
        if active {
            self.shared.lock().pull_offset = 0;
            let sink = Arc::clone(self);
            ringbuffer.set_callback(Some(Box::new(move |segment: &mut [u8]| {
                sink.pull_into(segment);
            })));
            ringbuffer.may_start(true);
            ringbuffer.start()
        } else {
            ringbuffer.set_callback(None);
            ringbuffer.release().is_ok()
        }
    }

    fn pull_into(&self, segment: &mut [u8]) {
        let offset = self.shared.lock().pull_offset;
        let length = segment.len() as u32;
        tracing::trace!("pulling {length} bytes at offset {offset} to fill audio buffer");

        match self.context.pull_range(offset, length) {
            Ok(bytes) => {
                let copied = bytes.len().min(segment.len());
                if copied < segment.len() {
                    tracing::debug!("short read pulling from peer: {copied}<{}", segment.len());
                }
                segment[..copied].copy_from_slice(&bytes[..copied]);
                self.shared.lock().pull_offset = offset + copied as u64;
            }
            Err(PullError::Eos) => {
                tracing::debug!("eos while pulling, draining");
                self.context.post_message(SinkMessage::Eos);
                self.drain();
            }
            Err(PullError::Flow(error)) => {
                tracing::warn!("got flow error pulling but can't return it: {error}");
            }
        }
    }
}
