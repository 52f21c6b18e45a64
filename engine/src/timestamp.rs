//! Timestamps, watermarks and pull windows.
//!
//! Every timestamp that crosses the wire is UTC with microsecond precision and
//! rendered as `2024-01-31T10:00:00.000000Z`. Because the textual form has a
//! fixed width, lexicographic order equals chronological order, which lets the
//! local store compare timestamps as plain text.

use crate::{error::Result, Error};
use chrono::{DateTime, Duration, FixedOffset, NaiveDateTime, SubsecRound, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// A point in time, always UTC.
pub type Timestamp = DateTime<Utc>;

/// Canonical textual form used on the wire and in the local store.
pub const WIRE_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6fZ";

const NAIVE_FORMATS: &[&str] = &["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"];
const OFFSET_FORMATS: &[&str] = &["%Y-%m-%d %H:%M:%S%.f%:z", "%Y-%m-%d %H:%M:%S%.f%#z"];

/// Drop anything below microsecond precision.
pub fn truncate(ts: Timestamp) -> Timestamp {
    ts.trunc_subsecs(6)
}

/// Current wall-clock time at wire precision.
pub fn now() -> Timestamp {
    truncate(Utc::now())
}

/// Render a timestamp in the canonical wire format.
pub fn format(ts: &Timestamp) -> String {
    ts.format(WIRE_FORMAT).to_string()
}

/// Parse a timestamp leniently.
///
/// Accepts RFC 3339 with any offset, `YYYY-MM-DD HH:MM:SS[.f][offset]`, and
/// offset-less forms which are taken to be UTC already.
pub fn parse(input: &str) -> Result<Timestamp> {
    let trimmed = input.trim();

    if let Ok(ts) = DateTime::parse_from_rfc3339(trimmed) {
        return Ok(truncate(ts.with_timezone(&Utc)));
    }

    for fmt in OFFSET_FORMATS {
        if let Ok(ts) = DateTime::<FixedOffset>::parse_from_str(trimmed, fmt) {
            return Ok(truncate(ts.with_timezone(&Utc)));
        }
    }

    for fmt in NAIVE_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(trimmed, fmt) {
            return Ok(truncate(Utc.from_utc_datetime(&naive)));
        }
    }

    Err(Error::InvalidTimestamp(input.to_string()))
}

/// Serde adapter for a required wire timestamp.
pub mod wire {
    use super::Timestamp;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(ts: &Timestamp, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&super::format(ts))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Timestamp, D::Error> {
        let raw = String::deserialize(deserializer)?;
        super::parse(&raw).map_err(serde::de::Error::custom)
    }
}

/// Serde adapter for a nullable wire timestamp.
pub mod wire_opt {
    use super::Timestamp;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        ts: &Option<Timestamp>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match ts {
            Some(ts) => serializer.serialize_str(&super::format(ts)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Timestamp>, D::Error> {
        match Option::<String>::deserialize(deserializer)? {
            Some(raw) if raw.trim().is_empty() => Ok(None),
            Some(raw) => super::parse(&raw)
                .map(Some)
                .map_err(serde::de::Error::custom),
            None => Ok(None),
        }
    }
}

/// True when `ts` is strictly after the watermark. A missing watermark means
/// "never synced" and sorts before every timestamp.
pub fn is_after(ts: Timestamp, watermark: Option<Timestamp>) -> bool {
    match watermark {
        Some(mark) => ts > mark,
        None => true,
    }
}

/// The set of rows a pull returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PullWindow {
    /// First sync: every live row up to `upto`.
    Bootstrap { upto: Timestamp },
    /// Steady state: every row, tombstones included, in `(after, upto]`.
    Incremental { after: Timestamp, upto: Timestamp },
}

impl PullWindow {
    /// Build the window for a request carrying `prior` and answered as of `upto`.
    pub fn new(prior: Option<Timestamp>, upto: Timestamp) -> Self {
        match prior {
            Some(after) => PullWindow::Incremental { after, upto },
            None => PullWindow::Bootstrap { upto },
        }
    }

    pub fn is_bootstrap(&self) -> bool {
        matches!(self, PullWindow::Bootstrap { .. })
    }

    pub fn upto(&self) -> Timestamp {
        match self {
            PullWindow::Bootstrap { upto } | PullWindow::Incremental { upto, .. } => *upto,
        }
    }

    /// Whether a row with these sync columns belongs in the pull.
    pub fn includes(&self, last_modified: Timestamp, is_deleted: bool) -> bool {
        match self {
            PullWindow::Bootstrap { upto } => !is_deleted && last_modified <= *upto,
            PullWindow::Incremental { after, upto } => {
                last_modified > *after && last_modified <= *upto
            }
        }
    }
}

/// Issues strictly increasing as-of timestamps for the reconciliation service.
///
/// If the wall clock stalls or steps backwards, the next value is the previous
/// one plus one microsecond, so consecutive pull windows never overlap or
/// collapse.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerClock {
    last_issued: Option<Timestamp>,
}

impl ServerClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resume from a previously issued value.
    pub fn resume(last_issued: Option<Timestamp>) -> Self {
        Self { last_issued }
    }

    pub fn last_issued(&self) -> Option<Timestamp> {
        self.last_issued
    }

    /// Issue the next as-of timestamp given the current wall clock.
    pub fn issue(&mut self, wall: Timestamp) -> Timestamp {
        let wall = truncate(wall);
        let next = match self.last_issued {
            Some(last) if wall <= last => last + Duration::microseconds(1),
            _ => wall,
        };
        self.last_issued = Some(next);
        next
    }
}
