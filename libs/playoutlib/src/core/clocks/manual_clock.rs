
use super::Clock;
use std::sync::atomic::{AtomicU64, Ordering};

/// A clock whose time only moves when told to. Useful as a deterministic
/// pipeline clock in tests and offline processing.
pub struct ManualClock {
    time_ns: AtomicU64,
    description: String,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::with_description("Manual Clock".to_string())
    }

    pub fn with_description(description: String) -> Self {
        Self {
            time_ns: AtomicU64::new(0),
            description,
        }
    }

    pub fn set_time(&self, time_ns: u64) {
        self.time_ns.store(time_ns, Ordering::Release);
    }

    pub fn advance(&self, delta_ns: u64) {
        self.time_ns.fetch_add(delta_ns, Ordering::AcqRel);
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now_ns(&self) -> Option<u64> {
        Some(self.time_ns.load(Ordering::Acquire))
    }

    fn description(&self) -> &str {
        &self.description
    }
}
