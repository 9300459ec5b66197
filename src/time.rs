use chrono::{DateTime, SecondsFormat, Utc};

use crate::model::Ms;

/// Layouts tried after strict RFC3339, for clients that drop seconds or use
/// a space instead of `T`.
const FALLBACK_LAYOUTS: [&str; 2] = ["%Y-%m-%dT%H:%M%:z", "%Y-%m-%d %H:%M:%S%:z"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidInstant(pub String);

impl std::fmt::Display for InvalidInstant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "invalid RFC3339 time: {}", self.0)
    }
}

impl std::error::Error for InvalidInstant {}

/// Normalize an RFC3339 instant to Unix milliseconds.
pub fn parse_instant(s: &str) -> Result<Ms, InvalidInstant> {
    let s = s.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.timestamp_millis());
    }
    // `%:z` does not accept a bare `Z`.
    let zoned = match s.strip_suffix('Z').or_else(|| s.strip_suffix('z')) {
        Some(head) => format!("{head}+00:00"),
        None => s.to_string(),
    };
    for layout in FALLBACK_LAYOUTS {
        if let Ok(dt) = DateTime::parse_from_str(&zoned, layout) {
            return Ok(dt.timestamp_millis());
        }
    }
    Err(InvalidInstant(s.to_string()))
}

/// Render Unix milliseconds as RFC3339 UTC. Sub-second digits appear only
/// when present.
pub fn format_instant(ms: Ms) -> String {
    match DateTime::<Utc>::from_timestamp_millis(ms) {
        Some(dt) => dt.to_rfc3339_opts(SecondsFormat::AutoSi, true),
        None => ms.to_string(),
    }
}

pub fn now_ms() -> Ms {
    Utc::now().timestamp_millis()
}
