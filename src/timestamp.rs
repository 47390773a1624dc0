//! HL7 `TS`/`DTM` values to UTC.

use chrono::{DateTime, Duration, FixedOffset, NaiveDate, NaiveDateTime, TimeZone, Utc};

const EXACT_FORMAT: &str = "%Y%m%d%H%M%S";
const EXACT_LEN: usize = 14;

const GENERIC_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M:%S",
];

/// Parses `yyyyMMddHHmmss[.ffff][±ZZZZ]`, falling back to a handful of generic layouts.
///
/// Without an explicit offset the time is taken to be UTC already.
pub fn parse(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }
    parse_exact(value).or_else(|| parse_generic(value))
}

/// Like [`parse`], but substitutes the current time for absent or unreadable values.
pub fn to_utc_or_now(value: Option<&str>) -> DateTime<Utc> {
    value.and_then(parse).unwrap_or_else(Utc::now)
}

fn parse_exact(value: &str) -> Option<DateTime<Utc>> {
    let head = value.get(..EXACT_LEN)?;
    if !head.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let naive = NaiveDateTime::parse_from_str(head, EXACT_FORMAT).ok()?;
    let rest = &value[EXACT_LEN..];
    let naive = naive + fraction(rest);

    match offset(rest) {
        Some(offset) => offset
            .from_local_datetime(&naive)
            .single()
            .map(|local| local.with_timezone(&Utc)),
        None => Some(Utc.from_utc_datetime(&naive)),
    }
}

fn fraction(rest: &str) -> Duration {
    let Some(digits) = rest.strip_prefix('.') else {
        return Duration::zero();
    };
    let digits: String = digits.chars().take_while(char::is_ascii_digit).take(9).collect();
    if digits.is_empty() {
        return Duration::zero();
    }
    let scale = 10_i64.pow(9 - digits.len() as u32);
    digits
        .parse::<i64>()
        .map(|n| Duration::nanoseconds(n * scale))
        .unwrap_or_else(|_| Duration::zero())
}

fn offset(rest: &str) -> Option<FixedOffset> {
    let sign_at = rest.find(['+', '-'])?;
    let sign = if rest[sign_at..].starts_with('-') { -1 } else { 1 };
    let digits = rest.get(sign_at + 1..sign_at + 5)?;
    if !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let hours: i32 = digits[..2].parse().ok()?;
    let minutes: i32 = digits[2..].parse().ok()?;
    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60))
}

fn parse_generic(value: &str) -> Option<DateTime<Utc>> {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(value) {
        return Some(parsed.with_timezone(&Utc));
    }
    if let Some(naive) = GENERIC_FORMATS
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(value, format).ok())
    {
        return Some(Utc.from_utc_datetime(&naive));
    }
    if let Some(date) = NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
    {
        return Some(Utc.from_utc_datetime(&date));
    }
    reduced_precision(value)
}

/// HL7 allows `yyyyMMdd`, `yyyyMMddHH` and `yyyyMMddHHmm`; pad them out to whole seconds.
fn reduced_precision(value: &str) -> Option<DateTime<Utc>> {
    let digits = value.bytes().take_while(u8::is_ascii_digit).count();
    if !matches!(digits, 8 | 10 | 12) {
        return None;
    }
    let padded = format!(
        "{}{}{}",
        &value[..digits],
        &"000000"[..EXACT_LEN - digits],
        &value[digits..]
    );
    parse_exact(&padded)
}
