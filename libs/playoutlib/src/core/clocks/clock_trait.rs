
use std::time::Duration;

pub trait Clock: Send + Sync {
    /// Current time on this clock in nanoseconds, or `None` while the clock
    /// has no defined time yet (e.g. a playout clock without a format).
    fn now_ns(&self) -> Option<u64>;

    fn now(&self) -> Option<Duration> {
        self.now_ns().map(Duration::from_nanos)
    }

    fn description(&self) -> &str;
}
