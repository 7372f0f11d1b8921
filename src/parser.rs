use chrono::{DateTime, Datelike, NaiveDateTime, TimeZone, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

use crate::config::ConfigError;

pub const CONTENT: &str = "CONTENT";
pub const LEVEL: &str = "LEVEL";

/// Fields consulted, in order, when looking for the record timestamp.
const TIME_FIELDS: [&str; 3] = ["TIMESTAMP", "DATETIME", "TIME"];

// Optional severity keyword within the first few tokens, remainder is the content.
const DEFAULT_PATTERN: &str = r"^(?:(?:\S+\s+){0,6}?[\[<]?(?P<LEVEL>TRACE|DEBUG|INFO|NOTICE|WARN|WARNING|ERROR|SEVERE|FATAL|CRITICAL)\b[\]>:]*\s+)?(?P<CONTENT>.*\S.*)$";

static RE_HEADER: Lazy<Regex> = Lazy::new(|| Regex::new(r"<([A-Za-z_][A-Za-z0-9_]*)>").unwrap());
static RE_WHITESPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").unwrap());
static RE_WORD: Lazy<Regex> = Lazy::new(|| Regex::new(r"\w").unwrap());

/// How a raw line is split into named fields. `CONTENT` is mandatory in every form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "pattern", rename_all = "lowercase")]
pub enum LineFormat {
    /// Header template such as `<DATE> <TIME> <LEVEL> <COMPONENT>: <CONTENT>`.
    Headers(String),
    /// Regular expression with named groups.
    Regex(String),
    /// Grok expression; aliases become field names, e.g. `%{LOGLEVEL:LEVEL} %{GREEDYDATA:CONTENT}`.
    Grok(String),
}

impl Default for LineFormat {
    fn default() -> Self {
        LineFormat::Regex(DEFAULT_PATTERN.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("line {line_number}: does not match the configured format")]
    NoMatch { line_number: usize },
    #[error("line {line_number}: field {field} is missing")]
    MissingField { line_number: usize, field: &'static str },
    #[error("line {line_number}: field {field} is empty")]
    EmptyField { line_number: usize, field: &'static str },
    #[error("line {line_number}: content has no word characters")]
    NoWords { line_number: usize },
}

impl ParseError {
    pub fn line_number(&self) -> usize {
        match self {
            ParseError::NoMatch { line_number }
            | ParseError::MissingField { line_number, .. }
            | ParseError::EmptyField { line_number, .. }
            | ParseError::NoWords { line_number } => *line_number,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ParseError::NoMatch { .. } => "no_match",
            ParseError::MissingField { .. } => "missing_field",
            ParseError::EmptyField { .. } => "empty_field",
            ParseError::NoWords { .. } => "no_words",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ParsedLine {
    pub line_number: usize,
    pub line: String,
    pub content: String,
    pub level: Option<String>,
    pub timestamp: Option<DateTime<Utc>>,
    pub fields: BTreeMap<String, String>,
}

enum Compiled {
    Regex { re: Regex, names: Vec<String> },
    Grok(grok::Pattern),
}

pub struct LineParser {
    compiled: Compiled,
}

impl std::fmt::Debug for LineParser {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self.compiled {
            Compiled::Regex { .. } => "regex",
            Compiled::Grok(_) => "grok",
        };
        f.debug_struct("LineParser").field("kind", &kind).finish()
    }
}

impl LineParser {
    pub fn new(format: &LineFormat) -> Result<Self, ConfigError> {
        let compiled = match format {
            LineFormat::Headers(template) => compile_regex(&headers_to_regex(template)?)?,
            LineFormat::Regex(pattern) => compile_regex(pattern)?,
            LineFormat::Grok(pattern) => {
                if !pattern.contains(":CONTENT}") {
                    return Err(ConfigError::InvalidFormat(format!(
                        "grok pattern must alias a CONTENT field: {pattern}"
                    )));
                }
                let mut g = grok::Grok::with_patterns();
                let compiled = g
                    .compile(pattern, true)
                    .map_err(|e| ConfigError::InvalidFormat(format!("{pattern}: {e}")))?;
                Compiled::Grok(compiled)
            }
        };
        Ok(Self { compiled })
    }

    pub fn parse(&self, line: &str, line_number: usize) -> Result<ParsedLine, ParseError> {
        let line = line.trim_end_matches(&['\n', '\r'][..]);
        let mut fields = BTreeMap::new();
        match &self.compiled {
            Compiled::Regex { re, names } => {
                let caps = re.captures(line).ok_or(ParseError::NoMatch { line_number })?;
                for name in names {
                    if let Some(m) = caps.name(name) {
                        fields.insert(name.clone(), m.as_str().to_string());
                    }
                }
            }
            Compiled::Grok(pattern) => {
                let matches = pattern.match_against(line).ok_or(ParseError::NoMatch { line_number })?;
                for (name, value) in matches.iter() {
                    fields.insert(name.to_string(), value.to_string());
                }
            }
        }

        let content = fields
            .get(CONTENT)
            .cloned()
            .ok_or(ParseError::MissingField { line_number, field: CONTENT })?;
        if !RE_WORD.is_match(&content) {
            return Err(ParseError::NoWords { line_number });
        }

        let level = match fields.get(LEVEL) {
            None => None,
            Some(raw) => {
                let level = normalize_level(raw);
                if level.is_empty() {
                    return Err(ParseError::EmptyField { line_number, field: LEVEL });
                }
                Some(level)
            }
        };

        let timestamp = timestamp_from_fields(&fields).or_else(|| detect_timestamp_in_text(line));

        Ok(ParsedLine { line_number, line: line.to_string(), content, level, timestamp, fields })
    }
}

fn compile_regex(pattern: &str) -> Result<Compiled, ConfigError> {
    let re = Regex::new(pattern).map_err(|e| ConfigError::InvalidFormat(e.to_string()))?;
    let names: Vec<String> = re.capture_names().flatten().map(str::to_string).collect();
    if !names.iter().any(|n| n == CONTENT) {
        return Err(ConfigError::InvalidFormat(format!("pattern has no CONTENT group: {pattern}")));
    }
    Ok(Compiled::Regex { re, names })
}

/// Convert a header template into an anchored regex. Literal whitespace matches any run of
/// whitespace; two headers with nothing between them are separated by whitespace.
pub fn headers_to_regex(template: &str) -> Result<String, ConfigError> {
    let headers: Vec<_> = RE_HEADER.captures_iter(template).collect();
    if headers.is_empty() {
        return Err(ConfigError::InvalidFormat(format!("no <FIELD> headers in: {template}")));
    }
    let mut out = String::from("^");
    let mut last = 0;
    for (i, cap) in headers.iter().enumerate() {
        let Some(whole) = cap.get(0) else { continue };
        let literal = &template[last..whole.start()];
        if i > 0 && literal.is_empty() {
            out.push_str(r"\s+");
        } else {
            out.push_str(&literal_to_regex(literal));
        }
        let name = &cap[1];
        if i + 1 == headers.len() {
            out.push_str(&format!("(?P<{name}>.*)"));
        } else {
            out.push_str(&format!("(?P<{name}>.+?)"));
        }
        last = whole.end();
    }
    out.push_str(&literal_to_regex(&template[last..]));
    out.push('$');
    Ok(out)
}

fn literal_to_regex(literal: &str) -> String {
    RE_WHITESPACE.split(literal).map(regex::escape).collect::<Vec<_>>().join(r"\s+")
}

fn normalize_level(raw: &str) -> String {
    raw.trim_matches(|c: char| !c.is_alphanumeric()).to_uppercase()
}

fn timestamp_from_fields(fields: &BTreeMap<String, String>) -> Option<DateTime<Utc>> {
    if let (Some(date), Some(time)) = (fields.get("DATE"), fields.get("TIME")) {
        if let Some(t) = parse_ts_candidate(&format!("{date} {time}")) {
            return Some(t);
        }
    }
    TIME_FIELDS
        .iter()
        .chain(std::iter::once(&"DATE"))
        .filter_map(|k| fields.get(*k))
        .find_map(|v| parse_ts_candidate(v))
}

fn parse_ts_candidate(s: &str) -> Option<DateTime<Utc>> {
    let s = s.trim_matches(|c| c == '[' || c == ']');
    parse_ts_string(s).or_else(|| parse_ts_number_string(s))
}

fn parse_ts_string(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    let fmts = [
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%d %H:%M:%S",
        "%Y-%m-%dT%H:%M:%S%.f",
        "%Y/%m/%d %H:%M:%S",
        // BGL style: 2005-06-03-15.42.50.675872
        "%Y-%m-%d-%H.%M.%S%.f",
        // HDFS style: 081109 203615
        "%y%m%d %H%M%S",
    ];
    fmts.iter()
        .find_map(|f| NaiveDateTime::parse_from_str(s, f).ok())
        .map(|ndt| Utc.from_utc_datetime(&ndt))
}

fn parse_ts_number_string(s: &str) -> Option<DateTime<Utc>> {
    if s.is_empty() || !s.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    let n: i64 = s.parse().ok()?;
    match s.len() {
        10 => DateTime::<Utc>::from_timestamp(n, 0),
        13 => DateTime::<Utc>::from_timestamp(n / 1000, ((n % 1000) * 1_000_000) as u32),
        16 => DateTime::<Utc>::from_timestamp(n / 1_000_000, ((n % 1_000_000) * 1_000) as u32),
        _ => None,
    }
}

pub fn detect_timestamp_in_text(s: &str) -> Option<DateTime<Utc>> {
    static RE_ISO_ANY: Lazy<Regex> = Lazy::new(|| {
        Regex::new(r"\b\d{4}-\d{2}-\d{2}[T ]\d{2}:\d{2}:\d{2}(?:\.\d{1,9})?(?:Z|[+-]\d{2}:?\d{2})?").unwrap()
    });
    static RE_SYSLOG: Lazy<Regex> = Lazy::new(|| {
        Regex::new(r"\b(Jan|Feb|Mar|Apr|May|Jun|Jul|Aug|Sep|Oct|Nov|Dec)\s+\d{1,2}\s+\d{2}:\d{2}:\d{2}\b").unwrap()
    });
    if let Some(m) = RE_ISO_ANY.find(s) {
        let mstr = m.as_str();
        if let Some(t) = parse_ts_string(mstr) {
            return Some(t);
        }
        if let Ok(dt) = DateTime::parse_from_str(mstr, "%Y-%m-%d %H:%M:%S%.f%z")
            .or_else(|_| DateTime::parse_from_str(mstr, "%Y-%m-%dT%H:%M:%S%.f%z"))
        {
            return Some(dt.with_timezone(&Utc));
        }
    }
    if let Some(m) = RE_SYSLOG.find(s) {
        let candidate = format!("{} {}", Utc::now().year(), m.as_str());
        if let Ok(naive) = NaiveDateTime::parse_from_str(&candidate, "%Y %b %d %H:%M:%S") {
            return Some(Utc.from_utc_datetime(&naive));
        }
    }
    None
}

/// Read one line without its terminator, replacing invalid UTF-8 with U+FFFD so a
/// corrupt byte never ends the stream. `None` at end of input.
pub fn read_line_lossy<R: std::io::BufRead>(reader: &mut R, buf: &mut Vec<u8>) -> std::io::Result<Option<String>> {
    buf.clear();
    if reader.read_until(b'\n', buf)? == 0 {
        return Ok(None);
    }
    if buf.last() == Some(&b'\n') {
        buf.pop();
        if buf.last() == Some(&b'\r') {
            buf.pop();
        }
    }
    Ok(Some(String::from_utf8_lossy(buf).into_owned()))
}
