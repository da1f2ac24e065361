#![forbid(unsafe_code)]

use std::time::{Duration, SystemTime, UNIX_EPOCH};

fn since_epoch() -> Duration {
	SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default()
}

/// Envelope timestamps are Unix milliseconds.
#[inline]
pub fn unix_ms_now() -> i64 {
	i64::try_from(since_epoch().as_millis()).unwrap_or(i64::MAX)
}

/// Token expiry is compared in whole seconds.
#[inline]
pub fn unix_secs_now() -> u64 {
	since_epoch().as_secs()
}
