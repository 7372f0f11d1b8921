use ahash::AHashSet;
use chrono::{DateTime, Utc};
use itertools::Itertools;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::num::NonZeroUsize;

use crate::cache::RecencyCache;
use crate::feedback::FeedBack;
use crate::matcher::MatchKind;
use crate::tokenizer::LogRecord;
use crate::trie::NodeId;

/// Placeholder standing in for a variable field of a template.
pub const WILDCARD: &str = "<*>";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClusterId(pub u64);

impl std::fmt::Display for ClusterId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "c{}", self.0)
    }
}

/// Lines sharing one template, plus the template itself and its review state.
#[derive(Debug)]
pub struct LogCluster {
    id: ClusterId,
    owner: NodeId,
    tokens: Vec<String>,
    template: String,
    // None when the template is too large to compile; such a cluster only matches partially
    pattern: Option<Regex>,
    /// Recent raw contents keyed by record id.
    messages: RecencyCache<u64, String>,
    hits: u64,
    created_at: DateTime<Utc>,
    last_used_at: DateTime<Utc>,
    feedback: FeedBack,
    rarity: Option<f64>,
}

impl LogCluster {
    /// An empty cluster; the first inserted record becomes its template.
    pub fn new(id: ClusterId, owner: NodeId, message_capacity: NonZeroUsize) -> Self {
        let now = Utc::now();
        Self {
            id,
            owner,
            tokens: Vec::new(),
            template: String::new(),
            pattern: None,
            messages: RecencyCache::with_capacity(message_capacity),
            hits: 0,
            created_at: now,
            last_used_at: now,
            feedback: FeedBack::unknown(),
            rarity: None,
        }
    }

    pub fn id(&self) -> ClusterId {
        self.id
    }

    pub fn owner(&self) -> NodeId {
        self.owner
    }

    pub(crate) fn set_owner(&mut self, owner: NodeId) {
        self.owner = owner;
    }

    pub fn template(&self) -> &str {
        &self.template
    }

    pub fn tokens(&self) -> &[String] {
        &self.tokens
    }

    pub fn wildcard_count(&self) -> usize {
        self.tokens.iter().filter(|t| *t == WILDCARD).count()
    }

    /// Number of messages currently held in the recency cache.
    pub fn size(&self) -> usize {
        self.messages.len()
    }

    /// Total records ever routed into this cluster.
    pub fn hits(&self) -> u64 {
        self.hits
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn last_used_at(&self) -> DateTime<Utc> {
        self.last_used_at
    }

    pub fn feedback(&self) -> &FeedBack {
        &self.feedback
    }

    pub fn set_feedback(&mut self, feedback: FeedBack) {
        self.feedback = feedback;
    }

    pub fn rarity(&self) -> Option<f64> {
        self.rarity
    }

    pub(crate) fn set_rarity(&mut self, tp: f64) {
        self.rarity = Some(tp);
    }

    /// Up to `n` cached messages, oldest first.
    pub fn samples(&self, n: usize) -> Vec<String> {
        self.messages.values_oldest_first().take(n).cloned().collect()
    }

    pub fn matches_exactly(&self, content: &str) -> bool {
        self.pattern.as_ref().is_some_and(|re| re.is_match(content))
    }

    pub fn insert_and_update(&mut self, record: &LogRecord, kind: MatchKind) {
        self.last_used_at = Utc::now();
        self.hits += 1;
        self.messages.put(record.id, record.content.clone());
        if kind == MatchKind::Exact && !self.tokens.is_empty() {
            return;
        }
        let incoming = record.content_tokens();
        if self.tokens.is_empty() {
            // a new cluster starts from the content verbatim, empty tokens included
            self.set_tokens(incoming.iter().map(|t| t.to_string()).collect());
            return;
        }
        let extracted = extract_template(&incoming, &self.tokens);
        self.set_tokens(merge_wildcards(extracted));
    }

    pub(crate) fn set_tokens(&mut self, tokens: Vec<String>) {
        self.template = tokens.join(" ");
        self.pattern = exact_pattern(&tokens);
        self.tokens = tokens;
    }
}

/// Generalize `template` against `incoming`: keep the longer sequence and replace every
/// position whose token is not shared by both sides with [`WILDCARD`].
pub fn extract_template(incoming: &[&str], template: &[String]) -> Vec<String> {
    let incoming_set: AHashSet<&str> = incoming.iter().copied().collect();
    let common: AHashSet<&str> = template
        .iter()
        .map(String::as_str)
        .filter(|t| !t.is_empty() && incoming_set.contains(t))
        .collect();
    let base: Vec<&str> = if incoming.len() > template.len() {
        incoming.to_vec()
    } else {
        template.iter().map(String::as_str).collect()
    };
    base.into_iter()
        .map(|t| if common.contains(t) { t.to_string() } else { WILDCARD.to_string() })
        .collect()
}

/// Collapse runs of wildcards, including runs separated only by whitespace tokens.
pub fn merge_wildcards(tokens: Vec<String>) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(tokens.len());
    for token in tokens {
        if token == WILDCARD {
            if let Some(i) = out.iter().rposition(|t| !t.trim().is_empty()) {
                if out[i] == WILDCARD {
                    out.truncate(i + 1);
                    continue;
                }
            }
        }
        out.push(token);
    }
    out
}

/// Anchored pattern: literals escaped, each wildcard matching anything.
pub fn exact_pattern(tokens: &[String]) -> Option<Regex> {
    let body = tokens
        .iter()
        .map(|t| if t == WILDCARD { ".*".to_string() } else { regex::escape(t) })
        .join(" ");
    Regex::new(&format!("(?s)^{body}$")).ok()
}
