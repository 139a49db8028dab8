//! `SOURCE_DATE_EPOCH` handling.
//!
//! When the environment variable is set, every timestamp the tool writes
//! (image config, history entries, generated layer tars) is clamped to it
//! so that output is reproducible.

use anyhow::{Context, Result};
use chrono::{DateTime, TimeZone, Utc};

use crate::Error;

/// Name of the standard reproducible-builds environment variable.
pub const SOURCE_DATE_EPOCH: &str = "SOURCE_DATE_EPOCH";

/// Parse `SOURCE_DATE_EPOCH` if set (decimal seconds since the Unix epoch,
/// interpreted as UTC).
pub fn source_date_epoch() -> Result<Option<DateTime<Utc>>> {
    let Some(v) = std::env::var_os(SOURCE_DATE_EPOCH) else {
        return Ok(None);
    };
    let v = v
        .to_str()
        .ok_or_else(|| Error::invalid(format!("{SOURCE_DATE_EPOCH} is not UTF-8")))?;
    let secs: i64 = v
        .parse()
        .map_err(|e| Error::invalid(format!("parsing {SOURCE_DATE_EPOCH}={v:?}: {e}")))?;
    let dt = Utc
        .timestamp_opt(secs, 0)
        .single()
        .ok_or_else(|| Error::invalid(format!("{SOURCE_DATE_EPOCH}={v:?} out of range")))?;
    Ok(Some(dt))
}

/// The current time, clamped to `SOURCE_DATE_EPOCH` when that is set.
pub fn now() -> Result<DateTime<Utc>> {
    Ok(source_date_epoch()?.unwrap_or_else(Utc::now))
}

/// Clamp a file timestamp (seconds) to `epoch` if one is configured.
pub fn clamp_secs(secs: i64, epoch: Option<&DateTime<Utc>>) -> i64 {
    match epoch {
        Some(e) => secs.min(e.timestamp()),
        None => secs,
    }
}

/// Format a timestamp the way image configs expect (RFC 3339, UTC, `Z`).
pub fn format_rfc3339(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
}

/// Parse an RFC 3339 timestamp from user input.
pub fn parse_rfc3339(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .with_context(|| format!("parsing timestamp {s:?}"))
}
