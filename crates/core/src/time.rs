//! Nanosecond-precision time values
//!
//! Two distinct timelines exist in a checkpointable process:
//!
//! - [`MonotonicTime`]: the *virtual* monotonic timeline. Raw monotonic clock
//!   sources are meaningless across a restore (the image may resume on another
//!   host, or after the source stood still while frozen), so every value of this
//!   type has already been compensated.
//! - [`WallTime`]: real wall-clock time since the Unix epoch.
//!
//! Both are signed 64-bit nanosecond counts. Arithmetic that feeds clock
//! compensation is checked; callers turn `None` into `OffsetOverflow`.
//!
//! ```
//! use stasis_core::{MonotonicTime, WallTime};
//! use std::time::Duration;
//!
//! let t = MonotonicTime::from_nanos(1_000);
//! assert_eq!(t.checked_add(Duration::from_nanos(500)), Some(MonotonicTime::from_nanos(1_500)));
//!
//! let w = WallTime::from_millis(2_000);
//! assert_eq!(w.as_millis(), 2_000);
//! ```

use chrono::{SecondsFormat, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Convert a duration to signed nanoseconds, `None` if it does not fit in `i64`.
#[inline]
pub fn duration_to_nanos(duration: Duration) -> Option<i64> {
    i64::try_from(duration.as_nanos()).ok()
}

/// Convert non-negative signed nanoseconds to a duration (negative clamps to zero).
#[inline]
pub fn nanos_to_duration(nanos: i64) -> Duration {
    Duration::from_nanos(nanos.max(0) as u64)
}

// ============================================================================
// MonotonicTime
// ============================================================================

/// A point on the compensated monotonic timeline, in nanoseconds.
///
/// ## Invariants
///
/// - Values handed out by the clock compensator never decrease over the
///   process lifetime, including across a restore.
/// - The origin is arbitrary; only differences are meaningful.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MonotonicTime(i64);

impl MonotonicTime {
    /// Origin of the timeline
    pub const ZERO: MonotonicTime = MonotonicTime(0);

    /// Largest representable instant
    pub const MAX: MonotonicTime = MonotonicTime(i64::MAX);

    /// Create from raw nanoseconds
    #[inline]
    pub const fn from_nanos(nanos: i64) -> Self {
        MonotonicTime(nanos)
    }

    /// Raw nanoseconds
    #[inline]
    pub const fn as_nanos(&self) -> i64 {
        self.0
    }

    /// Add a duration, `None` on overflow
    pub fn checked_add(&self, duration: Duration) -> Option<Self> {
        let nanos = duration_to_nanos(duration)?;
        self.0.checked_add(nanos).map(MonotonicTime)
    }

    /// Add a duration, saturating at [`MonotonicTime::MAX`]
    pub fn saturating_add(&self, duration: Duration) -> Self {
        self.checked_add(duration).unwrap_or(MonotonicTime::MAX)
    }

    /// Signed distance `self - earlier`, `None` on overflow
    #[inline]
    pub fn nanos_since(&self, earlier: MonotonicTime) -> Option<i64> {
        self.0.checked_sub(earlier.0)
    }

    /// Duration since an earlier instant, `None` if `earlier` is later
    pub fn duration_since(&self, earlier: MonotonicTime) -> Option<Duration> {
        match self.nanos_since(earlier) {
            Some(n) if n >= 0 => Some(Duration::from_nanos(n as u64)),
            _ => None,
        }
    }

    /// Duration since an earlier instant, zero if `earlier` is later
    pub fn saturating_duration_since(&self, earlier: MonotonicTime) -> Duration {
        self.duration_since(earlier).unwrap_or_default()
    }
}

impl Default for MonotonicTime {
    fn default() -> Self {
        MonotonicTime::ZERO
    }
}

impl std::fmt::Display for MonotonicTime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}ns", self.0)
    }
}

// ============================================================================
// WallTime
// ============================================================================

/// Wall-clock time as nanoseconds since the Unix epoch.
///
/// Negative values are instants before the epoch. After a restore, wall-clock
/// reads reflect real elapsed time, not the frozen image's stale age.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct WallTime(i64);

impl WallTime {
    /// Unix epoch (1970-01-01 00:00:00 UTC)
    pub const EPOCH: WallTime = WallTime(0);

    // =========================================================================
    // Constructors
    // =========================================================================

    /// Read the operating system wall clock
    pub fn now() -> Self {
        match SystemTime::now().duration_since(UNIX_EPOCH) {
            Ok(after) => WallTime(duration_to_nanos(after).unwrap_or(i64::MAX)),
            Err(before) => WallTime(-duration_to_nanos(before.duration()).unwrap_or(i64::MAX)),
        }
    }

    /// Create from nanoseconds since epoch
    #[inline]
    pub const fn from_nanos(nanos: i64) -> Self {
        WallTime(nanos)
    }

    /// Create from milliseconds since epoch
    #[inline]
    pub const fn from_millis(millis: i64) -> Self {
        WallTime(millis.saturating_mul(1_000_000))
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    /// Nanoseconds since epoch
    #[inline]
    pub const fn as_nanos(&self) -> i64 {
        self.0
    }

    /// Milliseconds since epoch (floors toward negative infinity)
    #[inline]
    pub const fn as_millis(&self) -> i64 {
        self.0.div_euclid(1_000_000)
    }

    // =========================================================================
    // Duration Operations
    // =========================================================================

    /// Add a duration, `None` on overflow
    pub fn checked_add(&self, duration: Duration) -> Option<Self> {
        let nanos = duration_to_nanos(duration)?;
        self.0.checked_add(nanos).map(WallTime)
    }

    /// Signed distance `self - earlier`, `None` on overflow
    #[inline]
    pub fn nanos_since(&self, earlier: WallTime) -> Option<i64> {
        self.0.checked_sub(earlier.0)
    }

    /// Duration since an earlier instant, `None` if `earlier` is later
    pub fn duration_since(&self, earlier: WallTime) -> Option<Duration> {
        match self.nanos_since(earlier) {
            Some(n) if n >= 0 => Some(Duration::from_nanos(n as u64)),
            _ => None,
        }
    }

    /// Duration since an earlier instant, zero if `earlier` is later
    pub fn saturating_duration_since(&self, earlier: WallTime) -> Duration {
        self.duration_since(earlier).unwrap_or_default()
    }

    /// Render as RFC 3339 with millisecond precision
    pub fn to_rfc3339(&self) -> String {
        Utc.timestamp_nanos(self.0)
            .to_rfc3339_opts(SecondsFormat::Millis, true)
    }
}

impl std::fmt::Display for WallTime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_rfc3339())
    }
}

impl From<SystemTime> for WallTime {
    fn from(time: SystemTime) -> Self {
        match time.duration_since(UNIX_EPOCH) {
            Ok(after) => WallTime(duration_to_nanos(after).unwrap_or(i64::MAX)),
            Err(before) => WallTime(-duration_to_nanos(before.duration()).unwrap_or(i64::MAX)),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
