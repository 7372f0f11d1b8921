//! Decides whether an incoming record extends an existing cluster of a leaf.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::cluster::{ClusterId, LogCluster};

static RE_SEPARATOR: Lazy<Regex> = Lazy::new(|| Regex::new(r"[\W_]+").unwrap());

// Bounds the quadratic character comparison on pathological lines.
const MAX_COMPARED_CHARS: usize = 2048;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MatchKind {
    Exact,
    Partial,
    NoMatch,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MatchOutcome {
    Exact(ClusterId),
    Partial { cluster: ClusterId, score: f64 },
    NoMatch,
}

impl MatchOutcome {
    pub fn kind(&self) -> MatchKind {
        match self {
            MatchOutcome::Exact(_) => MatchKind::Exact,
            MatchOutcome::Partial { .. } => MatchKind::Partial,
            MatchOutcome::NoMatch => MatchKind::NoMatch,
        }
    }
}

/// Match `content` against the clusters owned by one leaf, given in insertion order.
///
/// Exact matches are tried from the fewest wildcards up, so a specific template wins over
/// a generic one; ties keep insertion order. Only when nothing matches exactly is the
/// best-scoring template accepted as a partial match, provided it reaches `threshold`.
pub fn match_record(candidates: &[&LogCluster], content: &str, threshold: f64) -> MatchOutcome {
    let mut ordered: Vec<&LogCluster> = candidates.to_vec();
    ordered.sort_by_key(|c| c.wildcard_count());
    if let Some(c) = ordered.iter().find(|c| c.matches_exactly(content)) {
        return MatchOutcome::Exact(c.id());
    }

    let mut best: Option<(ClusterId, f64)> = None;
    for c in candidates {
        let score = similarity(c.template(), content);
        if best.map_or(true, |(_, b)| score > b) {
            best = Some((c.id(), score));
        }
    }
    match best {
        Some((cluster, score)) if score >= threshold => MatchOutcome::Partial { cluster, score },
        _ => MatchOutcome::NoMatch,
    }
}

/// Symmetric token-set similarity on a 0-100 scale.
///
/// Both sides are lower-cased and split into distinct alphanumeric tokens. The sorted
/// intersection is compared with each side's "intersection + remainder" string and the
/// two remainders with each other; the best character ratio wins.
pub fn similarity(a: &str, b: &str) -> f64 {
    let ta = token_set(a);
    let tb = token_set(b);
    if ta.is_empty() || tb.is_empty() {
        return 0.0;
    }
    let common = ta.intersection(&tb).map(String::as_str).collect::<Vec<_>>().join(" ");
    let only_a = ta.difference(&tb).map(String::as_str).collect::<Vec<_>>().join(" ");
    let only_b = tb.difference(&ta).map(String::as_str).collect::<Vec<_>>().join(" ");
    let with_a = join_nonempty(&common, &only_a);
    let with_b = join_nonempty(&common, &only_b);

    ratio(&common, &with_a).max(ratio(&common, &with_b)).max(ratio(&with_a, &with_b))
}

fn token_set(s: &str) -> BTreeSet<String> {
    RE_SEPARATOR
        .split(&s.to_lowercase())
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

fn join_nonempty(a: &str, b: &str) -> String {
    match (a.is_empty(), b.is_empty()) {
        (true, _) => b.to_string(),
        (_, true) => a.to_string(),
        _ => format!("{a} {b}"),
    }
}

/// `200 * lcs / (|a| + |b|)`: the indel similarity of two strings, 0-100.
fn ratio(a: &str, b: &str) -> f64 {
    let a: Vec<char> = a.chars().take(MAX_COMPARED_CHARS).collect();
    let b: Vec<char> = b.chars().take(MAX_COMPARED_CHARS).collect();
    let total = a.len() + b.len();
    if total == 0 {
        return 0.0;
    }
    200.0 * lcs_len(&a, &b) as f64 / total as f64
}

fn lcs_len(a: &[char], b: &[char]) -> usize {
    let mut prev = vec![0usize; b.len() + 1];
    let mut curr = vec![0usize; b.len() + 1];
    for ca in a {
        for (j, cb) in b.iter().enumerate() {
            curr[j + 1] = if ca == cb { prev[j] + 1 } else { prev[j + 1].max(curr[j]) };
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    prev[b.len()]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_strings_score_full() {
        assert_eq!(similarity("Node card is OK", "node card is ok"), 100.0);
    }

    #[test]
    fn disjoint_strings_score_low() {
        assert!(similarity("alpha beta", "gamma delta") < 50.0);
    }

    #[test]
    fn lcs_counts_common_subsequence() {
        let a: Vec<char> = "kitten".chars().collect();
        let b: Vec<char> = "sitting".chars().collect();
        assert_eq!(lcs_len(&a, &b), 4);
    }
}
