//! Decide whether a stored value still satisfies its effective spec.

use chrono::{DateTime, SecondsFormat, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::debug;

use crate::{spec::EffectiveSpec, Error, Result};

/// Secret data keys; the 61 char cap keeps `Z<field>Z` within the 63 char
/// annotation name limit.
static FIELD_NAME: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[-._a-zA-Z0-9]{1,61}$").expect("static regex"));

/// Signed sequence of whole amounts with `ns`, `us`, `µs`, `ms`, `s`, `m` or `h`
/// units, or a bare `0`. Longer humantime units (days, weeks, months) are refused.
static TTL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^([-+]?)(0|(?:[0-9]+(?:ns|us|µs|ms|s|m|h))+)$").expect("static regex"));

/// Why a stored value was (not) reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Validity {
    Valid,
    Missing,
    /// TTL set but no timestamp recorded.
    Unstamped,
    Expired,
    LengthMismatch,
    AlphabetMismatch,
}

impl Validity {
    pub fn is_valid(self) -> bool {
        matches!(self, Validity::Valid)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Validity::Valid => "valid",
            Validity::Missing => "missing",
            Validity::Unstamped => "unstamped",
            Validity::Expired => "expired",
            Validity::LengthMismatch => "length mismatch",
            Validity::AlphabetMismatch => "alphabet mismatch",
        }
    }
}

pub fn check_field_name(name: &str) -> Result<()> {
    if FIELD_NAME.is_match(name) { Ok(()) } else { Err(Error::InvalidFieldName(name.to_string())) }
}

pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Parse a TTL such as `30s`, `1h30m` or `720h`. Negative TTLs are accepted
/// and make every stored value expired.
pub fn parse_ttl(field: &str, ttl: &str) -> Result<chrono::Duration> {
    let malformed = |reason: String| Error::Duration { field: field.to_string(), value: ttl.to_string(), reason };
    let caps = TTL
        .captures(ttl)
        .ok_or_else(|| malformed("expected amounts with ns, us, ms, s, m or h units".to_string()))?;
    let body = &caps[2];
    let magnitude = if body == "0" {
        std::time::Duration::ZERO
    } else {
        humantime::parse_duration(&body.replace("µs", "us")).map_err(|e| malformed(e.to_string()))?
    };
    let magnitude = chrono::Duration::from_std(magnitude).map_err(|e| malformed(e.to_string()))?;
    Ok(if &caps[1] == "-" { -magnitude } else { magnitude })
}

pub fn parse_timestamp(s: &str) -> std::result::Result<DateTime<Utc>, chrono::ParseError> {
    DateTime::parse_from_rfc3339(s).map(|dt| dt.with_timezone(&Utc))
}

/// Validate the stored value of `field` against `spec` at time `now`.
///
/// Malformed timestamps or TTLs are errors, not "invalid": the caller is
/// expected to abort rather than silently regenerate.
pub fn validate(
    field: &str,
    stored: Option<&[u8]>,
    stored_ts: Option<&str>,
    spec: &EffectiveSpec,
    now: DateTime<Utc>,
) -> Result<Validity> {
    let Some(value) = stored else { return Ok(Validity::Missing) };

    if let Some(ttl) = spec.ttl.as_deref().filter(|t| !t.is_empty()) {
        let Some(ts) = stored_ts.filter(|t| !t.is_empty()) else { return Ok(Validity::Unstamped) };
        let generated = parse_timestamp(ts)
            .map_err(|source| Error::Timestamp { field: field.to_string(), value: ts.to_string(), source })?;
        let ttl = parse_ttl(field, ttl)?;
        if now - generated > ttl {
            debug!(field, generated = %ts, "stored value expired");
            return Ok(Validity::Expired);
        }
    }

    if value.len() != spec.length {
        debug!(field, have = value.len(), want = spec.length, "stored value length mismatch");
        return Ok(Validity::LengthMismatch);
    }
    if !spec.binary {
        let alphabet = spec.alphabet.as_bytes();
        if !value.iter().all(|b| alphabet.contains(b)) {
            debug!(field, "stored value alphabet mismatch");
            return Ok(Validity::AlphabetMismatch);
        }
    }
    Ok(Validity::Valid)
}
