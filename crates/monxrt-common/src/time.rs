//! Monotonic clock helpers.
//!
//! All timing in the service is expressed in nanoseconds on a process-local
//! monotonic timeline. The epoch is captured the first time the clock is
//! read, so early reads are small positive values rather than zero.

use std::sync::OnceLock;
use std::time::Instant;

/// One millisecond in nanoseconds.
pub const MS_IN_NS: u64 = 1_000_000;

/// Half a millisecond in nanoseconds.
pub const HALF_MS_IN_NS: u64 = 500_000;

/// One second in nanoseconds.
pub const S_IN_NS: u64 = 1_000_000_000;

static EPOCH: OnceLock<Instant> = OnceLock::new();

/// Current monotonic time in nanoseconds since the process epoch.
pub fn monotonic_ns() -> u64 {
    let epoch = *EPOCH.get_or_init(Instant::now);
    epoch.elapsed().as_nanos() as u64
}

/// Convert nanoseconds to fractional milliseconds, for log output.
pub fn ns_to_ms_f(t: u64) -> f64 {
    (t / 1_000) as f64 / 1_000.0
}

/// A whole-percent fraction of a duration in nanoseconds.
pub fn percent_of(time_ns: u64, percent: u32) -> u64 {
    (time_ns as u128 * percent as u128 / 100) as u64
}

/// True if `l` and `r` are within `range` of each other.
pub fn is_within(l: u64, r: u64, range: u64) -> bool {
    let t = l as i64 - r as i64;
    -(range as i64) < t && t < range as i64
}

/// True if `l` and `r` are within half a millisecond of each other.
pub fn is_within_half_ms(l: u64, r: u64) -> bool {
    is_within(l, r, HALF_MS_IN_NS)
}
