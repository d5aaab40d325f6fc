use super::{Result, SinkError};

pub const DEFAULT_BUFFER_TIME_US: i64 = 200_000;
pub const DEFAULT_LATENCY_TIME_US: i64 = 10_000;

/// Algorithm used to match the rate of the master clock when the pipeline
/// selected a clock other than the one this sink provides.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SlaveMethod {
    /// Adjust playback rate through clock mastering; sample positions are
    /// only offset-corrected, the ring buffer stretches the payload.
    Resample,
    /// Periodically observe the clock skew and jump the playout pointer by
    /// whole segments when the averaged skew exceeds half a segment.
    Skew,
    /// Apply the calibration offset only, no rate correction.
    None,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct SinkConfig {
    /// Size of the device buffer in microseconds.
    pub buffer_time_us: i64,

    /// Duration of one device segment in microseconds.
    pub latency_time_us: i64,

    /// Whether this sink advertises its playout clock to the pipeline.
    pub provide_clock: bool,

    pub slave_method: SlaveMethod,

    /// Render against the pipeline clock. When false every buffer is written
    /// at the next safe position instead.
    pub sync: bool,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            buffer_time_us: DEFAULT_BUFFER_TIME_US,
            latency_time_us: DEFAULT_LATENCY_TIME_US,
            provide_clock: true,
            slave_method: SlaveMethod::Skew,
            sync: true,
        }
    }
}

impl SinkConfig {
    pub fn validate(&self) -> Result<()> {
        if self.buffer_time_us < 1 {
            return Err(SinkError::Configuration(format!(
                "buffer-time must be at least 1us, got {}",
                self.buffer_time_us
            )));
        }
        if self.latency_time_us < 1 {
            return Err(SinkError::Configuration(format!(
                "latency-time must be at least 1us, got {}",
                self.latency_time_us
            )));
        }
        Ok(())
    }
}
