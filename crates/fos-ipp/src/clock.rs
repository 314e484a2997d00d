//! Wall-clock source
//!
//! Token expiration and try-again-after times are absolute timestamps issued
//! by the remote service, so comparisons use wall time rather than a
//! monotonic clock.

use std::time::SystemTime;

/// Source of the current time
pub trait Clock: Send + Sync {
    /// Current wall-clock time
    fn now(&self) -> SystemTime;
}

/// Clock backed by the operating system
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> SystemTime {
        SystemTime::now()
    }
}
