//! Wall-clock abstraction.
//!
//! Rate-limit deadlines reported by the remote service are absolute Unix
//! timestamps, so the REST crate needs wall-clock time rather than a
//! monotonic instant. Keeping it behind a trait lets tests substitute a
//! clock that follows tokio's paused time.

use std::time::{SystemTime, UNIX_EPOCH};

/// Source of the current wall-clock time in milliseconds since the Unix epoch.
pub trait Clock: Send + Sync + std::fmt::Debug {
    fn now_millis(&self) -> u64;
}

/// Clock backed by [`SystemTime::now`].
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
            // Clock set before 1970; treat as epoch so every deadline looks pending.
            .unwrap_or(0)
    }
}
