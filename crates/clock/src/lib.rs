//! Clock compensation for Stasis
//!
//! This crate answers "what time is it" for a process that may be frozen to
//! an image and resumed later, possibly on another host:
//! - ClockSource: raw OS clocks (`SystemClockSource`) behind a trait
//! - ClockCompensator: epoch pair, restore record, compensation offset
//! - TimeSource: the consumer-side trait every clock call site reads through
//! - MonotonicReader: hot-path reader with a cached, revalidated offset
//! - testing: `ManualClockSource` for deterministic restores in tests

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod compensator;
pub mod source;
pub mod testing;

pub use compensator::{ClockCompensator, MonotonicReader, TimeSource};
pub use source::{ClockSource, SystemClockSource};
