
pub mod buffers;
pub mod clocks;
pub mod config;
pub mod error;
pub mod format;
pub mod messages;
pub mod ringbuffer;
pub mod segment;
pub mod sink;
pub mod slaving;

pub use buffers::AudioBuffer;
pub use clocks::{AudioClock, Calibration, Clock, ManualClock};
pub use config::{DEFAULT_BUFFER_TIME_US, DEFAULT_LATENCY_TIME_US, SinkConfig, SlaveMethod};
pub use error::{FlowError, FlowResult, Result, SinkError};
pub use format::{AudioCaps, NSECS_PER_SEC, RingBufferSpec, ns_to_samples, samples_to_ns};
pub use messages::{MessageBus, MessageDomain, SinkMessage};
pub use ringbuffer::{MemoryRingBuffer, RingBuffer, RingBufferCallback};
pub use segment::Segment;
pub use sink::{
    AudioBaseSink, ElementState, Latency, PeerLatency, PipelineContext, PullError,
    RingBufferFactory, SinkEvent, StateChange,
};
