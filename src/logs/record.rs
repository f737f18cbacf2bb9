//! Structured records parsed from the daemon's logfmt output.
//!
//! The daemon writes one record per line as space separated `key=value`
//! tokens, for example:
//!
//! ```text
//! t=2024-05-01T10:00:00+0000 lvl=info msg="starting web service" obj=web addr=127.0.0.1:4040
//! ```
//!
//! Parsing is best effort. A line that is not entirely made of tokens is kept
//! as a raw record so nothing the daemon prints is lost.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use chrono::{DateTime, FixedOffset};
use regex::Regex;
use serde::Serialize;

static TOKEN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"([A-Za-z_][A-Za-z0-9_.\-]*)=("(?:[^"\\]|\\.)*"|\S*)"#)
        .expect("logfmt token pattern is valid")
});

/// Severity reported by the daemon.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
    Crit,
}

impl LogLevel {
    /// Whether this level is at or above [`LogLevel::Error`].
    #[must_use]
    pub fn is_error(self) -> bool {
        self >= Self::Error
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Debug => "DEBUG",
            Self::Info => "INFO",
            Self::Warn => "WARN",
            Self::Error => "ERROR",
            Self::Crit => "CRIT",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when a level token is not recognised.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("Unknown log level: {0}")]
pub struct UnknownLevel(pub String);

impl FromStr for LogLevel {
    type Err = UnknownLevel;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // The daemon abbreviates some levels to four letters.
        match s.to_ascii_lowercase().as_str() {
            "dbug" | "debug" => Ok(Self::Debug),
            "info" => Ok(Self::Info),
            "warn" | "warning" => Ok(Self::Warn),
            "eror" | "error" => Ok(Self::Error),
            "crit" | "critical" => Ok(Self::Crit),
            _ => Err(UnknownLevel(s.to_string())),
        }
    }
}

/// A single line of daemon output.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogRecord {
    /// Time the daemon stamped on the line, if it could be parsed.
    pub timestamp: Option<DateTime<FixedOffset>>,
    pub level: Option<LogLevel>,
    pub message: Option<String>,
    /// The line exactly as read from the stream.
    pub raw: String,
    /// Every token other than `t`, `lvl` and `msg`.
    pub fields: BTreeMap<String, String>,
}

impl LogRecord {
    /// Build a record that carries only the raw line.
    #[must_use]
    pub fn unparsed(raw: impl Into<String>) -> Self {
        Self {
            timestamp: None,
            level: None,
            message: None,
            raw: raw.into(),
            fields: BTreeMap::new(),
        }
    }

    /// Parse one line of logfmt output.
    ///
    /// Never fails: lines that are not fully tokenised come back from
    /// [`LogRecord::unparsed`].
    #[must_use]
    pub fn parse(line: &str) -> Self {
        let raw = line.trim_end_matches(['\r', '\n']);
        let Some(tokens) = tokenize(raw) else {
            return Self::unparsed(raw);
        };

        let mut record = Self::unparsed(raw);
        for (key, value) in tokens {
            match key.as_str() {
                "t" => record.timestamp = parse_timestamp(&value),
                "lvl" => record.level = value.parse().ok(),
                "msg" => record.message = Some(value),
                _ => {
                    record.fields.insert(key, value);
                }
            }
        }
        record
    }

    /// Whether the line was recognised as logfmt.
    #[must_use]
    pub fn is_parsed(&self) -> bool {
        self.level.is_some() || self.message.is_some() || !self.fields.is_empty()
    }

    #[must_use]
    pub fn field(&self, key: &str) -> Option<&str> {
        self.fields.get(key).map(String::as_str)
    }

    /// Address the daemon bound, present on listener announcements.
    #[must_use]
    pub fn addr(&self) -> Option<&str> {
        self.field("addr")
    }

    /// Error detail attached to failure lines.
    #[must_use]
    pub fn err(&self) -> Option<&str> {
        self.field("err")
    }

    #[must_use]
    pub fn obj(&self) -> Option<&str> {
        self.field("obj")
    }

    #[must_use]
    pub fn url(&self) -> Option<&str> {
        self.field("url")
    }

    /// Message text, or an empty string for raw records.
    #[must_use]
    pub fn message_text(&self) -> &str {
        self.message.as_deref().unwrap_or_default()
    }
}

impl fmt::Display for LogRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// Split a line into `key=value` pairs.
///
/// Returns `None` when anything other than whitespace sits between tokens,
/// or when there are no tokens at all.
fn tokenize(line: &str) -> Option<Vec<(String, String)>> {
    let mut tokens = Vec::new();
    let mut cursor = 0;

    for caps in TOKEN.captures_iter(line) {
        let whole = caps.get(0)?;
        if !line[cursor..whole.start()].chars().all(char::is_whitespace) {
            return None;
        }
        // A token glued to the previous one (`a=1b=2`) is not logfmt.
        if cursor > 0 && whole.start() == cursor {
            return None;
        }
        cursor = whole.end();

        let key = caps[1].to_string();
        let value = unquote(&caps[2]);
        tokens.push((key, value));
    }

    if tokens.is_empty() || !line[cursor..].chars().all(char::is_whitespace) {
        return None;
    }
    Some(tokens)
}

fn unquote(value: &str) -> String {
    let Some(inner) = value
        .strip_prefix('"')
        .and_then(|v| v.strip_suffix('"'))
    else {
        return value.to_string();
    };

    let mut out = String::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some(other) => out.push(other),
            None => out.push('\\'),
        }
    }
    out
}

fn parse_timestamp(value: &str) -> Option<DateTime<FixedOffset>> {
    DateTime::parse_from_rfc3339(value)
        .or_else(|_| DateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%z"))
        .or_else(|_| DateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f%z"))
        .ok()
}
