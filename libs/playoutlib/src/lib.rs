//! Sample-accurate audio playout synchronization for media pipelines.
//!
//! The heart of the crate is [`AudioBaseSink`]: it takes timestamped audio
//! buffers from an upstream producer and commits them to a device ring
//! buffer at the exact sample position their timestamps call for, while
//! keeping its own playout clock reconciled with whatever clock the
//! pipeline selected as master (by offset jumps, by rate resampling, or not
//! at all).
//!
//! The actual audio device stays out of the picture: a [`RingBuffer`]
//! implementation is created through a factory handed to the sink, and
//! [`MemoryRingBuffer`] serves when no hardware is involved. The embedding
//! pipeline supplies the other half of the world (its clock, base time,
//! preroll and EOS waits) through [`PipelineContext`].

pub mod core;

pub use crate::core::{
    AudioBaseSink, AudioBuffer, AudioCaps, AudioClock, Calibration, Clock, ElementState,
    FlowError, FlowResult, Latency, ManualClock, MemoryRingBuffer, MessageBus, MessageDomain,
    PeerLatency, PipelineContext, PullError, Result, RingBuffer, RingBufferCallback,
    RingBufferFactory, RingBufferSpec, Segment, SinkConfig, SinkError, SinkEvent, SinkMessage,
    SlaveMethod, StateChange,
};
