//! Timers: hashed wheel, periodic driver, monotonic clock.

mod driver;
mod wheel;

pub use driver::TimerDriver;
pub use wheel::{TimeoutHandle, TimingWheel};

use std::sync::OnceLock;
use std::time::Instant;

static EPOCH: OnceLock<Instant> = OnceLock::new();

/// Milliseconds on a process-local monotonic clock.
///
/// All deadlines and session stamps use this, never wall time: wall
/// clocks jump, and a jump must not expire or resurrect timeouts.
pub fn monotonic_ms() -> u64 {
    EPOCH.get_or_init(Instant::now).elapsed().as_millis() as u64
}
