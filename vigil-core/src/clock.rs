//! Wall-clock helpers. Every protocol operation takes `now` explicitly so tests can drive a
//! synthetic clock; only the runtime loops read the real one.

use std::time::Duration;

use chrono::Utc;

/// Milliseconds since the Unix epoch.
pub type Millis = i64;

/// Current wall-clock time in milliseconds.
#[must_use]
pub fn now_millis() -> Millis {
    Utc::now().timestamp_millis()
}

/// Converts a configuration duration into protocol milliseconds, saturating on overflow.
#[must_use]
pub fn duration_millis(duration: Duration) -> Millis {
    Millis::try_from(duration.as_millis()).unwrap_or(Millis::MAX)
}
