//! Input buffer type consumed by the render path.

/// A block of interleaved audio samples handed to the sink by the upstream
/// peer. Timestamps are pipeline stream time in nanoseconds; a buffer without
/// a timestamp is played as soon as possible.
#[derive(Debug, Clone)]
pub struct AudioBuffer {
    data: Vec<u8>,

    pub timestamp_ns: Option<u64>,

    pub duration_ns: Option<u64>,

    /// Source offset in samples, when the producer tracks one.
    pub offset: Option<u64>,

    /// Set when this buffer is not contiguous with the previous one.
    pub discont: bool,
}

impl AudioBuffer {
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            data,
            timestamp_ns: None,
            duration_ns: None,
            offset: None,
            discont: false,
        }
    }

    pub fn with_timestamp(data: Vec<u8>, timestamp_ns: u64) -> Self {
        let mut buffer = Self::new(data);
        buffer.timestamp_ns = Some(timestamp_ns);
        buffer
    }

    pub fn mark_discont(mut self) -> Self {
        self.discont = true;
        self
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn byte_size(&self) -> usize {
        self.data.len()
    }
}
