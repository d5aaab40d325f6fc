pub mod audio_clock;
pub mod clock_trait;
pub mod manual_clock;

pub use audio_clock::{AudioClock, Calibration};
pub use clock_trait::Clock;
pub use manual_clock::ManualClock;
