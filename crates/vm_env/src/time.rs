//! Reference time.
//!
//! Language code sees time as integer milliseconds since
//! 1970-01-01T00:00:00 UTC. These conversions do not depend on any engine,
//! so every engine computes the same deadline for the same input.

use std::time::{Duration, Instant};

use chrono::{DateTime, TimeDelta, Utc};

/// The reference epoch, 1970-01-01T00:00:00 UTC.
#[must_use]
pub fn epoch() -> DateTime<Utc> {
    DateTime::<Utc>::UNIX_EPOCH
}

/// The current time as milliseconds since [`epoch`].
#[must_use]
pub fn reference_time() -> i64 {
    datetime_to_reference_time(Utc::now())
}

/// Convert a calendar time to milliseconds since [`epoch`].
#[must_use]
pub fn datetime_to_reference_time(time: DateTime<Utc>) -> i64 {
    time.timestamp_millis()
}

/// Convert milliseconds since [`epoch`] to a calendar time. Returns `None`
/// outside the representable range.
#[must_use]
pub fn reference_time_to_datetime(millis: i64) -> Option<DateTime<Utc>> {
    epoch().checked_add_signed(TimeDelta::try_milliseconds(millis)?)
}

/// Map an absolute reference time onto the monotonic clock. Times in the
/// past map to now.
#[must_use]
pub fn reference_time_to_instant(millis: i64) -> Instant {
    let now = Instant::now();
    let delay = millis.saturating_sub(reference_time());
    match u64::try_from(delay) {
        Ok(delay) => now + Duration::from_millis(delay),
        Err(_) => now,
    }
}
