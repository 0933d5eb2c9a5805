//! Time helpers shared by the model.
//!
//! Durations travel as integer nanoseconds and a handful of timestamps are
//! stored as Unix nanoseconds, matching what the state store persists.

use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};

/// Converts a timestamp to Unix nanoseconds, saturating outside the
/// representable range.
pub fn unix_nanos(t: DateTime<Utc>) -> i64 {
    t.timestamp_nanos_opt().unwrap_or(i64::MAX)
}

/// Converts Unix nanoseconds to a timestamp.
pub fn from_unix_nanos(nanos: i64) -> DateTime<Utc> {
    Utc.timestamp_nanos(nanos)
}

/// Returns the zero timestamp (Unix epoch) used as "unset".
pub fn zero_time() -> DateTime<Utc> {
    Utc.timestamp_nanos(0)
}

/// Returns true for the unset timestamp.
pub fn is_zero_time(t: &DateTime<Utc>) -> bool {
    t.timestamp_nanos_opt() == Some(0)
}

/// Adds a std duration to a timestamp, saturating at the maximum.
pub fn add_duration(t: DateTime<Utc>, d: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(d)
        .ok()
        .and_then(|delta| t.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Returns the nanoseconds in a duration, saturating at `i64::MAX`.
pub fn duration_nanos(d: Duration) -> i64 {
    i64::try_from(d.as_nanos()).unwrap_or(i64::MAX)
}

/// Renders a duration the way operators write them (`1h30m0s`, `250ms`).
pub fn format_duration(d: Duration) -> String {
    let total = d.as_nanos();
    if total == 0 {
        return "0s".to_string();
    }
    if total < 1_000_000_000 {
        let ms = d.as_millis();
        if ms > 0 && total % 1_000_000 == 0 {
            return format!("{ms}ms");
        }
        return format!("{total}ns");
    }
    let secs = d.as_secs();
    let (h, m, s) = (secs / 3600, (secs % 3600) / 60, secs % 60);
    let frac = d.subsec_millis();
    let seconds = if frac > 0 {
        format!("{s}.{frac:03}s")
    } else {
        format!("{s}s")
    };
    match (h, m) {
        (0, 0) => seconds,
        (0, m) => format!("{m}m{seconds}"),
        (h, m) => format!("{h}h{m}m{seconds}"),
    }
}

/// Serde adapter storing a [`Duration`] as integer nanoseconds.
pub mod duration_nanos_serde {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(u64::try_from(d.as_nanos()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_nanos(u64::deserialize(d)?))
    }
}

/// Serde adapter storing an optional [`Duration`] as integer nanoseconds.
pub mod option_duration_nanos_serde {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match d {
            Some(d) => s.serialize_some(&u64::try_from(d.as_nanos()).unwrap_or(u64::MAX)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(d)?.map(Duration::from_nanos))
    }
}
