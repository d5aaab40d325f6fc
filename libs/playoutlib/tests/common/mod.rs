//! Shared fixture for the integration tests: a scripted pipeline context, a
//! sink wired to a memory ring buffer, and a device pump thread.
#![allow(dead_code)]

use parking_lot::Mutex;
use playoutlib::core::{
    AudioBaseSink, AudioBuffer, AudioCaps, Clock, FlowResult, MemoryRingBuffer, MessageBus,
    PeerLatency, PipelineContext, PullError, RingBuffer, SinkConfig, SinkMessage,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

/// Pipeline context whose answers are all scripted by the test.
pub struct TestPipeline {
    pub bus: MessageBus,
    pub clock: Mutex<Option<Arc<dyn Clock>>>,
    pub base_time: AtomicU64,
    pub latency: AtomicU64,
    pub peer_latency: Mutex<Option<PeerLatency>>,
    pub preroll_result: Mutex<FlowResult>,
    /// Running times handed to `wait_eos`.
    pub eos_waits: Mutex<Vec<u64>>,
    /// Bytes served to `pull_range`; `Eos` past the end.
    pub pull_data: Mutex<Option<Vec<u8>>>,
}

impl TestPipeline {
    pub fn new() -> Self {
        Self {
            bus: MessageBus::new(),
            clock: Mutex::new(None),
            base_time: AtomicU64::new(0),
            latency: AtomicU64::new(0),
            peer_latency: Mutex::new(None),
            preroll_result: Mutex::new(Ok(())),
            eos_waits: Mutex::new(Vec::new()),
            pull_data: Mutex::new(None),
        }
    }

    pub fn warnings(&self) -> Vec<SinkMessage> {
        self.bus
            .drain()
            .into_iter()
            .filter(|message| matches!(message, SinkMessage::Warning { .. }))
            .collect()
    }
}

impl PipelineContext for TestPipeline {
    fn clock(&self) -> Option<Arc<dyn Clock>> {
        self.clock.lock().clone()
    }

    fn base_time(&self) -> u64 {
        self.base_time.load(Ordering::Acquire)
    }

    fn latency(&self) -> u64 {
        self.latency.load(Ordering::Acquire)
    }

    fn peer_latency(&self) -> Option<PeerLatency> {
        *self.peer_latency.lock()
    }

    fn wait_preroll(&self) -> FlowResult {
        *self.preroll_result.lock()
    }

    fn wait_eos(&self, running_time: u64) -> FlowResult {
        self.eos_waits.lock().push(running_time);
        Ok(())
    }

    fn pull_range(&self, offset: u64, length: u32) -> Result<Vec<u8>, PullError> {
        let guard = self.pull_data.lock();
        let Some(data) = guard.as_ref() else {
            return Err(PullError::Flow(playoutlib::core::FlowError::Error));
        };
        let offset = offset as usize;
        if offset >= data.len() {
            return Err(PullError::Eos);
        }
        let end = (offset + length as usize).min(data.len());
        Ok(data[offset..end].to_vec())
    }

    fn post_message(&self, message: SinkMessage) {
        self.bus.post(message);
    }
}

pub struct Harness {
    pub sink: Arc<AudioBaseSink>,
    pub ring: Arc<MemoryRingBuffer>,
    pub pipeline: Arc<TestPipeline>,
}

pub fn harness(config: SinkConfig) -> Harness {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let pipeline = Arc::new(TestPipeline::new());
    let ring = Arc::new(MemoryRingBuffer::new());
    let ring_for_factory = Arc::clone(&ring);
    let sink = AudioBaseSink::new(
        config,
        Box::new(move || Arc::clone(&ring_for_factory) as Arc<dyn RingBuffer>),
        Arc::clone(&pipeline) as Arc<dyn PipelineContext>,
    )
    .expect("valid config");
    Harness {
        sink: Arc::new(sink),
        ring,
        pipeline,
    }
}

/// Config giving a 10 x 10ms segment ring at 48kHz.
pub fn small_ring_config() -> SinkConfig {
    SinkConfig {
        buffer_time_us: 100_000,
        ..Default::default()
    }
}

pub fn caps_48k() -> AudioCaps {
    AudioCaps {
        rate: Some(48_000),
        channels: Some(2),
        width: Some(16),
        ..Default::default()
    }
}

/// NULL→READY plus format negotiation.
pub fn negotiate(harness: &Harness, caps: &AudioCaps) {
    harness
        .sink
        .set_state(playoutlib::core::ElementState::Ready)
        .expect("to ready");
    harness.sink.set_caps(caps).expect("caps accepted");
}

/// READY→PLAYING.
pub fn roll(harness: &Harness) {
    harness
        .sink
        .set_state(playoutlib::core::ElementState::Playing)
        .expect("to playing");
}

/// Make the pipeline run on the sink's own clock.
pub fn use_provided_clock(harness: &Harness) {
    let clock = harness.sink.provide_clock().expect("clock provided");
    *harness.pipeline.clock.lock() = Some(clock);
}

/// A buffer of `samples` frames at 4 bytes per frame, timestamped in ms.
pub fn buffer_at_ms(timestamp_ms: u64, samples: usize) -> AudioBuffer {
    AudioBuffer::with_timestamp(vec![0x11; samples * 4], timestamp_ms * 1_000_000)
}

/// Consumes one segment every few hundred microseconds, like a device would.
pub struct Pump {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Pump {
    pub fn start(ring: Arc<MemoryRingBuffer>) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stop);
        let handle = std::thread::spawn(move || {
            while !stop_flag.load(Ordering::Acquire) {
                ring.render_segments(1);
                std::thread::sleep(Duration::from_micros(200));
            }
        });
        Self {
            stop,
            handle: Some(handle),
        }
    }
}

impl Drop for Pump {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
