//! Quota period arithmetic.
//!
//! Periods are not stored anywhere: the active window is a pure function of
//! the anchor, the interval and the wall clock. Crossing a boundary simply
//! changes which window usage is summed over.

use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};

const NANOS_PER_SEC: i128 = 1_000_000_000;

/// Start of the period containing `now`.
///
/// Returns `anchor + k * interval` for the largest integer `k` with
/// `anchor + k * interval <= now`. `k` is negative when the anchor lies in the
/// future. A zero interval (or an out-of-range result) yields the anchor.
pub fn current_period_start(
    anchor: DateTime<Utc>,
    interval: Duration,
    now: DateTime<Utc>,
) -> DateTime<Utc> {
    let Ok(interval_ns) = i128::try_from(interval.as_nanos()) else {
        return anchor;
    };
    if interval_ns == 0 {
        return anchor;
    }

    let elapsed = now.signed_duration_since(anchor);
    let elapsed_ns =
        i128::from(elapsed.num_seconds()) * NANOS_PER_SEC + i128::from(elapsed.subsec_nanos());
    let offset_ns = elapsed_ns.div_euclid(interval_ns) * interval_ns;

    shift(anchor, offset_ns).unwrap_or(anchor)
}

fn shift(anchor: DateTime<Utc>, offset_ns: i128) -> Option<DateTime<Utc>> {
    let secs = i64::try_from(offset_ns.div_euclid(NANOS_PER_SEC)).ok()?;
    let nanos = i64::try_from(offset_ns.rem_euclid(NANOS_PER_SEC)).ok()?;
    let delta = TimeDelta::try_seconds(secs)?.checked_add(&TimeDelta::nanoseconds(nanos))?;
    anchor.checked_add_signed(delta)
}

/// Serde adapter encoding a [`Duration`] as integer nanoseconds.
pub mod duration_nanos {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        let nanos = u64::try_from(value.as_nanos()).unwrap_or(u64::MAX);
        serializer.serialize_u64(nanos)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let nanos = u64::deserialize(deserializer)?;
        Ok(Duration::from_nanos(nanos))
    }
}
