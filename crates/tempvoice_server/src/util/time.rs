#![forbid(unsafe_code)]

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::time::Instant;

/// Roughly 30 years; used when a deadline would overflow `Instant`.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// `now + after`, saturating at a far-future deadline instead of panicking.
pub fn deadline_after(now: Instant, after: Duration) -> Instant {
	now.checked_add(after)
		.or_else(|| now.checked_add(FAR_FUTURE))
		.unwrap_or(now)
}

/// Current Unix time in milliseconds.
#[inline]
pub fn unix_ms_now() -> i64 {
	unix_ms(SystemTime::now())
}

/// Unix milliseconds of a wall-clock timestamp (0 before the epoch).
#[inline]
pub fn unix_ms(t: SystemTime) -> i64 {
	t.duration_since(UNIX_EPOCH).unwrap_or(Duration::from_secs(0)).as_millis() as i64
}

/// `HH:MM:SS` (UTC) of a wall-clock timestamp, for human-readable audit lines.
pub fn clock_utc(t: SystemTime) -> String {
	let secs = unix_ms(t) / 1000;
	let day = secs.rem_euclid(86_400);
	format!("{:02}:{:02}:{:02}", day / 3600, (day % 3600) / 60, day % 60)
}
