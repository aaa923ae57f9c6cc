//! Raw clock sources
//!
//! A raw source is what the operating system reports. Its monotonic reading
//! is only meaningful within one continuous execution: after a restore it may
//! have stood still for the whole freeze, or restart from an unrelated origin
//! on another host. Nothing outside the compensator should read it directly.

use std::time::Instant;

use stasis_core::{duration_to_nanos, WallTime};

/// Uncompensated clock readings
pub trait ClockSource: Send + Sync {
    /// Raw monotonic nanoseconds from an arbitrary origin
    fn raw_monotonic(&self) -> i64;

    /// Raw wall clock
    fn raw_wall_clock(&self) -> WallTime;
}

/// Operating system clocks (`Instant` and `SystemTime`)
#[derive(Debug, Clone, Copy)]
pub struct SystemClockSource {
    origin: Instant,
}

impl SystemClockSource {
    /// Create a source whose monotonic origin is now
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClockSource {
    fn default() -> Self {
        Self::new()
    }
}

impl ClockSource for SystemClockSource {
    #[inline]
    fn raw_monotonic(&self) -> i64 {
        duration_to_nanos(self.origin.elapsed()).unwrap_or(i64::MAX)
    }

    #[inline]
    fn raw_wall_clock(&self) -> WallTime {
        WallTime::now()
    }
}
