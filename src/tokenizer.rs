//! Turns parsed lines into [`LogRecord`]s carrying their routing tokens.
//!
//! Word classification stands in for a part-of-speech tagger: only open-class,
//! non-numeric tokens take part in routing.

use ahash::AHashSet;
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::BTreeMap;

use crate::parser::ParsedLine;

static RE_NON_WORD: Lazy<Regex> = Lazy::new(|| Regex::new(r"\W+").unwrap());

static CLOSED_CLASS: Lazy<AHashSet<&'static str>> = Lazy::new(|| {
    [
        // determiners
        "a", "an", "the", "this", "that", "these", "those", "each", "every", "some", "any", "no",
        "all", "both", "either", "neither",
        // pronouns
        "i", "me", "my", "we", "us", "our", "you", "your", "he", "him", "his", "she", "her", "it",
        "its", "they", "them", "their", "who", "whom", "whose", "which", "what",
        // prepositions
        "at", "by", "for", "from", "in", "into", "of", "on", "onto", "to", "with", "without",
        "about", "after", "before", "between", "during", "over", "under", "via", "per", "than",
        "through", "upon", "within",
        // conjunctions
        "and", "or", "but", "nor", "so", "yet", "if", "because", "while", "when", "where",
        "whether", "as",
        // auxiliaries and particles
        "is", "are", "was", "were", "be", "been", "being", "am", "do", "does", "did", "has",
        "have", "had", "can", "could", "will", "would", "shall", "should", "may", "might", "must",
        "not", "up", "out", "off",
    ]
    .into_iter()
    .collect()
});

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WordClass {
    Open,
    Closed,
    Numeric,
}

/// Word-class oracle for single tokens.
pub trait TokenClassifier: Send + Sync {
    fn classify(&self, token: &str) -> WordClass;
}

/// Dictionary based classifier: a fixed closed-class word list plus a digit heuristic.
#[derive(Debug, Clone, Copy, Default)]
pub struct LexicalClassifier;

impl TokenClassifier for LexicalClassifier {
    fn classify(&self, token: &str) -> WordClass {
        if is_numeric(token) {
            WordClass::Numeric
        } else if CLOSED_CLASS.contains(token.to_ascii_lowercase().as_str()) {
            WordClass::Closed
        } else {
            WordClass::Open
        }
    }
}

/// Leading digit, or at least half of the characters are digits.
fn is_numeric(token: &str) -> bool {
    match token.chars().next() {
        None => return false,
        Some(c) if c.is_ascii_digit() => return true,
        Some(_) => {}
    }
    let total = token.chars().count();
    let digits = token.chars().filter(|c| c.is_ascii_digit()).count();
    digits * 2 >= total
}

/// One input line after parsing and tokenization.
#[derive(Debug, Clone)]
pub struct LogRecord {
    pub id: u64,
    pub line: String,
    pub content: String,
    pub level: Option<String>,
    pub timestamp: Option<DateTime<Utc>>,
    pub fields: BTreeMap<String, String>,
    /// Open-class, non-numeric tokens of `content`, in order.
    pub routing_tokens: Vec<String>,
}

impl LogRecord {
    /// Tokens used for template math: the content split on single spaces.
    pub fn content_tokens(&self) -> Vec<&str> {
        self.content.split(' ').collect()
    }
}

pub struct Tokenizer {
    classifier: Box<dyn TokenClassifier>,
}

impl std::fmt::Debug for Tokenizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tokenizer").finish_non_exhaustive()
    }
}

impl Default for Tokenizer {
    fn default() -> Self {
        Self::new(Box::new(LexicalClassifier))
    }
}

impl Tokenizer {
    pub fn new(classifier: Box<dyn TokenClassifier>) -> Self {
        Self { classifier }
    }

    pub fn routing_tokens(&self, content: &str) -> Vec<String> {
        RE_NON_WORD
            .split(content)
            .filter(|t| !t.is_empty())
            .filter(|t| self.classifier.classify(t) == WordClass::Open)
            .map(str::to_string)
            .collect()
    }

    pub fn record(&self, parsed: ParsedLine) -> LogRecord {
        let routing_tokens = self.routing_tokens(&parsed.content);
        LogRecord {
            id: parsed.line_number as u64,
            line: parsed.line,
            content: parsed.content,
            level: parsed.level,
            timestamp: parsed.timestamp,
            fields: parsed.fields,
            routing_tokens,
        }
    }

    /// Build a record straight from content, bypassing line parsing.
    pub fn record_from_content(&self, id: u64, content: &str, level: Option<&str>) -> LogRecord {
        LogRecord {
            id,
            line: content.to_string(),
            content: content.to_string(),
            level: level.map(str::to_uppercase),
            timestamp: None,
            fields: BTreeMap::new(),
            routing_tokens: self.routing_tokens(content),
        }
    }
}
