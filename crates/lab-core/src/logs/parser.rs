//! Parsing of raw service output into [`LogLine`]s.
//!
//! Escape sequences are stripped before matching. Formats are tried in
//! priority order:
//! 1. logfmt-style `key=value` pairs carrying a timestamp and a level
//! 2. a bracketed `[LEVEL][timestamp] message` prefix
//! 3. a keyword scan, defaulting to INFO

use chrono::{DateTime, NaiveDateTime, Utc};
use lab_proto::{LogLevel, LogLine};
use regex::Regex;
use std::collections::HashMap;
use std::sync::LazyLock;

static LOGFMT_PAIR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"([A-Za-z_][\w.\-]*)=("(?:[^"\\]|\\.)*"|\S*)"#).expect("valid logfmt regex")
});

static BRACKETED: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*\[([A-Za-z]+)\]\s*\[([^\]]+)\]\s*(.*)$").expect("valid bracket regex")
});

static ERROR_WORD: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:error|fatal|panic)\b").expect("valid error keyword regex")
});

static WARN_WORD: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bwarn(?:ing)?\b").expect("valid warn keyword regex"));

static DEBUG_WORD: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bdebug\b").expect("valid debug keyword regex"));

const TIME_KEYS: [&str; 3] = ["time", "ts", "timestamp"];
const LEVEL_KEYS: [&str; 3] = ["level", "lvl", "severity"];
const MESSAGE_KEYS: [&str; 2] = ["msg", "message"];

/// Parses one raw line of output from `service`.
///
/// Never fails: unrecognized lines become INFO lines stamped with the
/// current time. `raw` is kept verbatim.
pub fn parse_line(service: &str, raw: &str) -> LogLine {
    let clean = strip_ansi_escapes::strip_str(raw);
    let clean = clean.trim_end_matches(['\r', '\n']);

    let (timestamp, level, message) = parse_logfmt(clean)
        .or_else(|| parse_bracketed(clean))
        .unwrap_or_else(|| (Utc::now(), scan_level(clean), clean.to_string()));

    LogLine {
        service: service.to_string(),
        timestamp,
        level,
        message,
        raw: raw.to_string(),
    }
}

fn parse_logfmt(line: &str) -> Option<(DateTime<Utc>, LogLevel, String)> {
    let pairs: HashMap<String, String> = LOGFMT_PAIR
        .captures_iter(line)
        .map(|c| (c[1].to_ascii_lowercase(), unquote(&c[2])))
        .collect();

    let time = TIME_KEYS.iter().find_map(|k| pairs.get(*k))?;
    let level = LEVEL_KEYS
        .iter()
        .find_map(|k| pairs.get(*k))
        .and_then(|l| LogLevel::parse(l))?;
    let message = MESSAGE_KEYS
        .iter()
        .find_map(|k| pairs.get(*k))
        .cloned()
        .unwrap_or_else(|| line.to_string());

    Some((parse_timestamp(time).unwrap_or_else(Utc::now), level, message))
}

fn parse_bracketed(line: &str) -> Option<(DateTime<Utc>, LogLevel, String)> {
    let caps = BRACKETED.captures(line)?;
    let level = LogLevel::parse(&caps[1])?;
    let timestamp = parse_timestamp(caps[2].trim()).unwrap_or_else(Utc::now);
    Some((timestamp, level, caps[3].to_string()))
}

/// Whole-word keyword match, so "panicked" or "no errors" stay INFO.
fn scan_level(line: &str) -> LogLevel {
    if ERROR_WORD.is_match(line) {
        LogLevel::Error
    } else if WARN_WORD.is_match(line) {
        LogLevel::Warn
    } else if DEBUG_WORD.is_match(line) {
        LogLevel::Debug
    } else {
        LogLevel::Info
    }
}

fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(s) {
        return Some(ts.with_timezone(&Utc));
    }
    ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f", "%Y/%m/%d %H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
        .map(|naive| naive.and_utc())
}

fn unquote(value: &str) -> String {
    match value.strip_prefix('"').and_then(|v| v.strip_suffix('"')) {
        Some(inner) => inner.replace("\\\"", "\"").replace("\\\\", "\\"),
        None => value.to_string(),
    }
}
