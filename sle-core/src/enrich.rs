//! Line enrichment: leading-timestamp detection and log-level extraction.
//!
//! `enrich` is a pure function; watchers call it once per record before the
//! record enters the queue. A second pass over the stripped text finds no
//! prefix, so enrichment is idempotent.

use chrono::{DateTime, Datelike, NaiveDate, TimeZone, Utc};
use once_cell::sync::Lazy;
use regex::Regex;

/// How many characters past the timestamp are scanned for a level token.
const LEVEL_SCAN_WINDOW: usize = 64;

/// ISO-8601 with optional fractional seconds and offset or `Z`, optionally
/// wrapped in a leading `[`.
static ISO_TS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^\[?(\d{4}-\d{2}-\d{2}T\d{2}:\d{2}:\d{2}(?:\.\d{1,9})?(?:Z|[+-]\d{2}:?\d{2})?)\]?\s*",
    )
    .expect("iso timestamp pattern")
});

/// Space-separated variant of the above, no timezone.
static SPACED_TS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\[?(\d{4}-\d{2}-\d{2} \d{2}:\d{2}:\d{2}(?:\.\d{1,9})?)\]?\s*")
        .expect("spaced timestamp pattern")
});

/// Syslog RFC-3164 `Mon D HH:MM:SS`; the year is inferred from `now`.
static SYSLOG_TS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\[?([A-Z][a-z]{2}) {1,2}(\d{1,2}) (\d{2}):(\d{2}):(\d{2})\]?\s*")
        .expect("syslog timestamp pattern")
});

/// Epoch seconds or milliseconds, 10 or 13 digits at line start.
static EPOCH_TS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\[?(\d{13}|\d{10})\]?(?:\s+|$)").expect("epoch timestamp pattern"));

/// Level token bounded by non-alphanumeric characters. Longer variants come
/// first so `WARNING` wins over `WARN` at the same position.
static LEVEL_TOKEN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)(?:^|[^0-9A-Za-z])(TRACE|DEBUG|INFO|NOTICE|WARNING|WARN|ERROR|ERR|CRITICAL|CRIT|FATAL|ALERT|EMERGENCY)(?:[^0-9A-Za-z]|$)",
    )
    .expect("level token pattern")
});

const MONTHS: [&str; 12] = [
    "Jan", "Feb", "Mar", "Apr", "May", "Jun", "Jul", "Aug", "Sep", "Oct", "Nov", "Dec",
];

/// Result of enriching one raw line.
#[derive(Debug, Clone, PartialEq)]
pub struct Enriched {
    /// The line with any detected leading timestamp/level stripped.
    /// Never empty: stripping that would consume the whole line is undone.
    pub text: String,
    /// Extracted instant, or `now` when no prefix matched.
    pub timestamp: DateTime<Utc>,
    /// Normalized severity token, when one was found.
    pub level: Option<String>,
}

/// Extract a leading timestamp and a level token from `raw`.
pub fn enrich(raw: &str, now: DateTime<Utc>) -> Enriched {
    let (prefix_len, timestamp) = match detect_timestamp(raw, now) {
        Some((len, ts)) => (len, ts),
        None => (0, now),
    };
    let stripped = &raw[prefix_len..];

    let (text, level) = extract_level(stripped);

    if text.trim().is_empty() {
        // Stripping consumed the whole line; keep it verbatim and attach no
        // level so a replayed pass yields the same result.
        return Enriched {
            text: raw.to_string(),
            timestamp,
            level: None,
        };
    }

    Enriched {
        text,
        timestamp,
        level,
    }
}

/// Try each timestamp pattern in order; both the regex and the parse must
/// succeed for a pattern to win. Returns the matched prefix length (including
/// trailing `]` and whitespace) and the parsed instant.
fn detect_timestamp(line: &str, now: DateTime<Utc>) -> Option<(usize, DateTime<Utc>)> {
    if let Some(caps) = ISO_TS.captures(line) {
        if let Some(ts) = parse_iso(caps.get(1).expect("capture").as_str()) {
            return Some((caps.get(0).expect("match").end(), ts));
        }
    }
    if let Some(caps) = SPACED_TS.captures(line) {
        let text = caps.get(1).expect("capture").as_str();
        if let Ok(naive) = chrono::NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S%.f") {
            return Some((
                caps.get(0).expect("match").end(),
                Utc.from_utc_datetime(&naive),
            ));
        }
    }
    if let Some(caps) = SYSLOG_TS.captures(line) {
        if let Some(ts) = parse_syslog(&caps, now) {
            return Some((caps.get(0).expect("match").end(), ts));
        }
    }
    if let Some(caps) = EPOCH_TS.captures(line) {
        let digits = caps.get(1).expect("capture").as_str();
        let ts = if digits.len() == 13 {
            digits
                .parse::<i64>()
                .ok()
                .and_then(DateTime::<Utc>::from_timestamp_millis)
        } else {
            digits
                .parse::<i64>()
                .ok()
                .and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0))
        };
        if let Some(ts) = ts {
            return Some((caps.get(0).expect("match").end(), ts));
        }
    }
    None
}

fn parse_iso(text: &str) -> Option<DateTime<Utc>> {
    // Offset form first; chrono's %z accepts both +0200 and +02:00.
    if let Ok(dt) = DateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S%.f%z") {
        return Some(dt.with_timezone(&Utc));
    }
    // `Z` suffix or no zone at all: parse naive, assume UTC.
    let naive = text.strip_suffix(['Z', 'z']).unwrap_or(text);
    chrono::NaiveDateTime::parse_from_str(naive, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|n| Utc.from_utc_datetime(&n))
}

fn parse_syslog(caps: &regex::Captures<'_>, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let month = MONTHS
        .iter()
        .position(|m| *m == &caps[1])
        .map(|idx| idx as u32 + 1)?;
    let day: u32 = caps[2].parse().ok()?;
    let hour: u32 = caps[3].parse().ok()?;
    let minute: u32 = caps[4].parse().ok()?;
    let second: u32 = caps[5].parse().ok()?;

    let date = NaiveDate::from_ymd_opt(now.year(), month, day)?;
    let naive = date.and_hms_opt(hour, minute, second)?;
    Some(Utc.from_utc_datetime(&naive))
}

/// Scan the first [`LEVEL_SCAN_WINDOW`] characters for a bounded level token.
/// On a hit the token is removed from the text and returned normalized.
fn extract_level(text: &str) -> (String, Option<String>) {
    let window_end = text
        .char_indices()
        .nth(LEVEL_SCAN_WINDOW)
        .map(|(idx, _)| idx)
        .unwrap_or(text.len());

    let caps = match LEVEL_TOKEN.captures(&text[..window_end]) {
        Some(caps) => caps,
        None => return (text.to_string(), None),
    };
    let token = caps.get(1).expect("capture");
    let level = normalize_level(token.as_str());

    let mut out = String::with_capacity(text.len());
    out.push_str(&text[..token.start()]);
    let mut rest = &text[token.end()..];
    // Eat the separating whitespace run when the token sat between spaces or
    // at line start, so "INFO Complete!" strips to "Complete!".
    let at_boundary = text[..token.start()]
        .chars()
        .next_back()
        .map_or(true, |c| c.is_whitespace());
    if at_boundary {
        rest = rest.trim_start_matches([' ', '\t']);
    }
    out.push_str(rest);
    (out.trim_start().to_string(), Some(level))
}

fn normalize_level(token: &str) -> String {
    let upper = token.to_uppercase();
    match upper.as_str() {
        "ERR" => "ERROR".to_string(),
        "CRIT" => "CRITICAL".to_string(),
        "WARNING" => "WARN".to_string(),
        _ => upper,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 10, 17, 12, 0, 0).unwrap()
    }

    #[test]
    fn iso_with_numeric_offset() {
        let e = enrich("2025-10-17T02:26:16+0200 INFO Complete!", now());
        assert_eq!(e.text, "Complete!");
        assert_eq!(e.level.as_deref(), Some("INFO"));
        assert_eq!(
            e.timestamp.timestamp_nanos_opt().unwrap(),
            1_760_660_776_000_000_000
        );
    }

    #[test]
    fn iso_with_colon_offset_and_fraction() {
        let e = enrich("2025-10-17T02:26:16.125+02:00 ok", now());
        assert_eq!(e.text, "ok");
        assert_eq!(
            e.timestamp.timestamp_nanos_opt().unwrap(),
            1_760_660_776_125_000_000
        );
    }

    #[test]
    fn iso_zulu_and_bracket() {
        let e = enrich("[2025-10-17T00:26:16Z] hello", now());
        assert_eq!(e.text, "hello");
        assert_eq!(e.timestamp.timestamp(), 1_760_660_776);
    }

    #[test]
    fn spaced_variant() {
        let e = enrich("2025-10-17 00:26:16 hello", now());
        assert_eq!(e.text, "hello");
        assert_eq!(e.timestamp.timestamp(), 1_760_660_776);
    }

    #[test]
    fn syslog_inherits_current_year() {
        let e = enrich("Oct  5 02:26:16 sshd[123]: accepted", now());
        assert_eq!(e.timestamp.year(), 2025);
        assert_eq!(e.timestamp.month(), 10);
        assert_eq!(e.timestamp.day(), 5);
        assert!(e.text.starts_with("sshd[123]"));
    }

    #[test]
    fn epoch_seconds_and_millis() {
        let e = enrich("1760660776 hello", now());
        assert_eq!(e.timestamp.timestamp(), 1_760_660_776);
        assert_eq!(e.text, "hello");

        let e = enrich("1760660776125 hello", now());
        assert_eq!(e.timestamp.timestamp_millis(), 1_760_660_776_125);
        assert_eq!(e.text, "hello");
    }

    #[test]
    fn long_number_is_not_a_timestamp() {
        let e = enrich("1234567890123456 is an id", now());
        assert_eq!(e.timestamp, now());
        assert_eq!(e.text, "1234567890123456 is an id");
    }

    #[test]
    fn no_timestamp_uses_now() {
        let e = enrich("plain line", now());
        assert_eq!(e.timestamp, now());
        assert_eq!(e.text, "plain line");
        assert_eq!(e.level, None);
    }

    #[test]
    fn level_normalization() {
        assert_eq!(enrich("err: disk full", now()).level.as_deref(), Some("ERROR"));
        assert_eq!(enrich("CRIT power", now()).level.as_deref(), Some("CRITICAL"));
        assert_eq!(enrich("warning: high", now()).level.as_deref(), Some("WARN"));
        assert_eq!(enrich("NOTICE listening", now()).level.as_deref(), Some("NOTICE"));
    }

    #[test]
    fn level_must_be_bounded() {
        let e = enrich("INFORMATION systems", now());
        assert_eq!(e.level, None);
        assert_eq!(e.text, "INFORMATION systems");
    }

    #[test]
    fn level_outside_window_is_ignored() {
        let padding = "x".repeat(80);
        let line = format!("{padding} ERROR late");
        let e = enrich(&line, now());
        assert_eq!(e.level, None);
        assert_eq!(e.text, line);
    }

    #[test]
    fn never_strips_to_empty() {
        let e = enrich("INFO", now());
        assert_eq!(e.text, "INFO");
        assert_eq!(e.level, None);

        let e = enrich("2025-10-17T00:26:16Z", now());
        assert_eq!(e.text, "2025-10-17T00:26:16Z");
        assert_eq!(e.level, None);
        assert_eq!(e.timestamp.timestamp(), 1_760_660_776);
    }

    #[test]
    fn idempotent() {
        for line in [
            "2025-10-17T02:26:16+0200 INFO Complete!",
            "Oct  5 02:26:16 kernel: WARN thermal",
            "no prefix at all",
            "ERROR",
        ] {
            let first = enrich(line, now());
            let second = enrich(&first.text, now());
            assert_eq!(second.text, first.text, "line: {line}");
            assert_eq!(second.level, None, "line: {line}");
        }
    }
}
