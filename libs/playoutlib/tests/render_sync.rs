//! Render-path synchronization: sample alignment, resync, clipping.

mod common;

use common::*;
use playoutlib::core::{AudioBuffer, AudioCaps, FlowError, MessageDomain, Segment, SinkEvent,
    SinkMessage};

#[test]
fn test_contiguous_stream_stays_aligned() {
    let harness = harness(small_ring_config());
    negotiate(&harness, &caps_48k());
    use_provided_clock(&harness);
    roll(&harness);

    for (index, timestamp_ms) in [0u64, 20, 40].iter().enumerate() {
        harness
            .sink
            .render(&buffer_at_ms(*timestamp_ms, 960))
            .unwrap();
        assert_eq!(
            harness.sink.next_sample(),
            (index as i64 + 1) * 960,
            "tail after buffer {index}"
        );
    }
    assert!(harness.pipeline.warnings().is_empty());
}

#[test]
fn test_discont_skips_alignment() {
    let harness = harness(small_ring_config());
    negotiate(&harness, &caps_48k());
    use_provided_clock(&harness);
    roll(&harness);
    let _pump = Pump::start(harness.ring.clone());

    for timestamp_ms in [0u64, 20, 40] {
        harness.sink.render(&buffer_at_ms(timestamp_ms, 960)).unwrap();
    }

    // one second in: a genuine gap, flagged as such
    let buffer = buffer_at_ms(1_000, 960).mark_discont();
    harness.sink.render(&buffer).unwrap();

    // placed at the timestamp's own position, no alignment, no complaint
    assert_eq!(harness.sink.next_sample(), 48_000 + 960);
    assert_eq!(harness.sink.last_align(), 0);
    assert!(harness.pipeline.warnings().is_empty());
}

#[test]
fn test_small_drift_is_absorbed() {
    let harness = harness(small_ring_config());
    negotiate(&harness, &caps_48k());
    use_provided_clock(&harness);
    roll(&harness);

    for timestamp_ms in [0u64, 20, 40] {
        harness.sink.render(&buffer_at_ms(timestamp_ms, 960)).unwrap();
    }
    assert_eq!(harness.sink.next_sample(), 2_880);

    // 1ms early relative to the contiguous position: 48 samples of drift
    harness.sink.render(&buffer_at_ms(59, 960)).unwrap();

    assert_eq!(harness.sink.last_align(), 48);
    // still contiguous with the previous tail
    assert_eq!(harness.sink.next_sample(), 2_880 + 960);
    assert!(harness.pipeline.warnings().is_empty());
}

#[test]
fn test_large_drift_resyncs_with_warning() {
    let harness = harness(small_ring_config());
    negotiate(&harness, &caps_48k());
    use_provided_clock(&harness);
    roll(&harness);
    let _pump = Pump::start(harness.ring.clone());

    for timestamp_ms in [0u64, 20, 40] {
        harness.sink.render(&buffer_at_ms(timestamp_ms, 960)).unwrap();
    }

    // more than half a second away from the expected position
    harness.sink.render(&buffer_at_ms(600, 960)).unwrap();

    assert_eq!(harness.sink.last_align(), 0);
    // the buffer plays at its own timestamp
    assert_eq!(harness.sink.next_sample(), 28_800 + 960);

    let warnings = harness.pipeline.warnings();
    assert_eq!(warnings.len(), 1);
    assert!(matches!(
        &warnings[0],
        SinkMessage::Warning {
            domain: MessageDomain::CoreClock,
            ..
        }
    ));
}

#[test]
fn test_fully_clipped_buffer_is_dropped_silently() {
    let harness = harness(small_ring_config());
    let caps = AudioCaps {
        rate: Some(44_100),
        channels: Some(2),
        width: Some(16),
        ..Default::default()
    };
    negotiate(&harness, &caps);
    use_provided_clock(&harness);
    roll(&harness);

    harness.sink.event(SinkEvent::NewSegment(Segment {
        start: 100_000_000,
        ..Default::default()
    }));

    // 20ms of audio ending exactly at the segment boundary
    let buffer = AudioBuffer::with_timestamp(vec![0x22; 882 * 4], 80_000_000);
    assert_eq!(harness.sink.render(&buffer), Ok(()));

    // nothing was committed
    assert_eq!(harness.sink.next_sample(), -1);
    assert!(harness.pipeline.bus.drain().is_empty());
}

#[test]
fn test_partially_clipped_head_is_trimmed() {
    let harness = harness(small_ring_config());
    negotiate(&harness, &caps_48k());
    use_provided_clock(&harness);
    roll(&harness);

    harness.sink.event(SinkEvent::NewSegment(Segment {
        start: 10_000_000,
        ..Default::default()
    }));

    // [0ms, 20ms) against a segment starting at 10ms: first 480 samples go
    harness.sink.render(&buffer_at_ms(0, 960)).unwrap();

    // running time of the clipped start is 0, so the tail lands at 480
    assert_eq!(harness.sink.next_sample(), 480);
}

#[test]
fn test_wrong_size_buffer_is_an_error() {
    let harness = harness(small_ring_config());
    negotiate(&harness, &caps_48k());
    use_provided_clock(&harness);
    roll(&harness);

    let buffer = AudioBuffer::with_timestamp(vec![0; 6], 0);
    assert_eq!(harness.sink.render(&buffer), Err(FlowError::Error));
    assert!(matches!(
        harness.pipeline.bus.drain().as_slice(),
        [SinkMessage::Error {
            domain: MessageDomain::StreamWrongType,
            ..
        }]
    ));
}

#[test]
fn test_buffer_without_timestamp_appends() {
    let harness = harness(small_ring_config());
    negotiate(&harness, &caps_48k());
    use_provided_clock(&harness);
    roll(&harness);

    harness.sink.render(&buffer_at_ms(0, 960)).unwrap();
    assert_eq!(harness.sink.next_sample(), 960);

    harness
        .sink
        .render(&AudioBuffer::new(vec![0x33; 480 * 4]))
        .unwrap();
    assert_eq!(harness.sink.next_sample(), 960 + 480);
}

#[test]
fn test_sync_disabled_plays_asap() {
    let mut config = small_ring_config();
    config.sync = false;
    let harness = harness(config);
    negotiate(&harness, &caps_48k());
    use_provided_clock(&harness);
    roll(&harness);

    // a timestamp far in the future is ignored without sync
    harness.sink.render(&buffer_at_ms(10_000, 960)).unwrap();
    assert_eq!(harness.sink.next_sample(), 960);
    assert!(harness.pipeline.warnings().is_empty());
}
