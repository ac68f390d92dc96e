//! Conversion between wall-clock durations and integer tick counters.
//!
//! RTP sender clocks run at codec-specific rates (90 kHz for H.264, 48 kHz
//! for Opus). These conversions compute the full 128-bit intermediate product
//! so no precision is lost at any representable rate, and round to nearest
//! with ties away from zero.

use std::time::Duration;

const NANOS_PER_SEC: u128 = 1_000_000_000;

/// Converts a duration to a tick count at `rate` ticks per second.
#[must_use]
pub fn to_ticks(t: Duration, rate: u64) -> u64 {
    let product = t.as_nanos() * u128::from(rate);
    let (ticks, rem) = (product / NANOS_PER_SEC, product % NANOS_PER_SEC);
    let rounded = if rem * 2 >= NANOS_PER_SEC {
        ticks + 1
    } else {
        ticks
    };
    rounded as u64
}

/// Converts a tick count at `rate` ticks per second to a duration.
#[must_use]
pub fn from_ticks(ts: u64, rate: u64) -> Duration {
    let rate = u128::from(rate);
    let product = u128::from(ts) * NANOS_PER_SEC;
    let (nanos, rem) = (product / rate, product % rate);
    let rounded = if rem * 2 >= rate { nanos + 1 } else { nanos };
    Duration::from_nanos(rounded as u64)
}

/// Converts a sequence of wrapping 32-bit sender timestamps into a
/// monotonically non-decreasing duration starting from zero.
///
/// The fractional remainder of each division is carried over to the next
/// call, so the accumulated duration never drifts from the tick stream.
#[derive(Debug)]
pub struct RelativeConverter {
    rate: u64,
    base: Duration,
    rem: u64,
    last: Option<u32>,
}

impl RelativeConverter {
    #[must_use]
    pub fn new(rate: u64) -> Self {
        Self {
            rate,
            base: Duration::ZERO,
            rem: 0,
            last: None,
        }
    }

    /// Feeds the next sender timestamp and returns the accumulated duration.
    ///
    /// The first sample maps to zero. Wrapping subtraction handles the 32-bit
    /// rollover of the sender clock.
    pub fn convert(&mut self, ts: u32) -> Duration {
        let last = self.last.unwrap_or(ts);
        self.last = Some(ts);
        let delta = u64::from(ts.wrapping_sub(last));
        let lo = delta * NANOS_PER_SEC as u64 + self.rem;
        self.rem = lo % self.rate;
        self.base += Duration::from_nanos(lo / self.rate);
        self.base
    }
}
