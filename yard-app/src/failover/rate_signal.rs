//! Turns the raw timing hints of a rate-limit rejection into an absolute
//! resume time.

use chrono::{DateTime, Duration, Utc};
use yard_llm::RateLimitInfo;

/// Integers at or above this are unix epoch seconds rather than deltas.
const EPOCH_SECONDS_MIN: f64 = 1_000_000_000.0;

/// Latest resume time implied by any hint in `info`, or `None` when no hint parses.
pub fn resume_at(now: DateTime<Utc>, info: &RateLimitInfo) -> Option<DateTime<Utc>> {
    [
        info.retry_after.as_deref().and_then(|v| parse_retry_after(now, v)),
        info.requests_reset.as_deref().and_then(|v| parse_reset(now, v)),
        info.tokens_reset.as_deref().and_then(|v| parse_reset(now, v)),
    ]
    .into_iter()
    .flatten()
    .max()
}

/// `Retry-After` is either delta seconds or an HTTP date.
fn parse_retry_after(now: DateTime<Utc>, raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(seconds) = raw.parse::<f64>() {
        return offset(now, seconds);
    }
    parse_timestamp(raw)
}

/// Reset headers come as epoch seconds, delta seconds, Go-style durations
/// (`6m0s`, `250ms`) or timestamps depending on the provider.
fn parse_reset(now: DateTime<Utc>, raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(value) = raw.parse::<f64>() {
        if value >= EPOCH_SECONDS_MIN {
            return DateTime::from_timestamp(value.trunc() as i64, 0);
        }
        return offset(now, value);
    }
    if let Some(delta) = parse_duration(raw) {
        return now.checked_add_signed(delta);
    }
    parse_timestamp(raw)
}

fn offset(now: DateTime<Utc>, seconds: f64) -> Option<DateTime<Utc>> {
    if !seconds.is_finite() || seconds < 0.0 {
        return None;
    }
    let millis = (seconds * 1000.0).round();
    if millis > i64::MAX as f64 {
        return None;
    }
    now.checked_add_signed(Duration::milliseconds(millis as i64))
}

fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc2822(raw)
        .or_else(|_| DateTime::parse_from_rfc3339(raw))
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

/// Parses `1h2m3.5s`, `250ms`, `6m0s`. Every number must carry a unit.
/// Hand-rolled because `humantime` rejects fractional values such as `1.5s`,
/// which provider reset headers send routinely.
fn parse_duration(raw: &str) -> Option<Duration> {
    if raw.is_empty() {
        return None;
    }
    let mut total_ms = 0f64;
    let mut rest = raw;
    while !rest.is_empty() {
        let number_len = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(rest.len());
        if number_len == 0 {
            return None;
        }
        let value: f64 = rest[..number_len].parse().ok()?;
        rest = &rest[number_len..];

        let unit_len = rest
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(rest.len());
        let scale_ms = match &rest[..unit_len] {
            "h" => 3_600_000.0,
            "m" => 60_000.0,
            "s" => 1_000.0,
            "ms" => 1.0,
            "us" | "µs" => 0.001,
            "ns" => 0.000_001,
            _ => return None,
        };
        rest = &rest[unit_len..];
        total_ms += value * scale_ms;
    }
    Some(Duration::milliseconds(total_ms.round() as i64))
}
