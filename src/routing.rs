//! Routing-key extraction: which trie edges a record follows on its way to a leaf.

use ahash::AHashMap;
use itertools::Itertools;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::tokenizer::LogRecord;
use crate::trie::NodeKind;

/// Edge used when a strategy has nothing to emit for a record.
pub const SENTINEL: &str = "<DEFAULT>";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StrategyKind {
    DomainKnowledge,
    FrequentToken,
    PrefixToken,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoutingStrategy {
    /// The record's severity level.
    DomainKnowledge,
    /// Up to `k` globally frequent tokens of the record, joined into one edge.
    FrequentToken { k: usize },
    /// The first `max` routing tokens, one edge each.
    PrefixToken { max: usize },
}

impl RoutingStrategy {
    pub fn from_kind(kind: StrategyKind, k: usize, max: usize) -> Self {
        match kind {
            StrategyKind::DomainKnowledge => RoutingStrategy::DomainKnowledge,
            StrategyKind::FrequentToken => RoutingStrategy::FrequentToken { k },
            StrategyKind::PrefixToken => RoutingStrategy::PrefixToken { max },
        }
    }

    /// Insert-time order: domain knowledge, frequent tokens, prefix tokens.
    pub fn standard(k: usize, max: usize) -> Vec<Self> {
        vec![
            RoutingStrategy::DomainKnowledge,
            RoutingStrategy::FrequentToken { k },
            RoutingStrategy::PrefixToken { max },
        ]
    }

    pub fn node_kind(&self) -> NodeKind {
        match self {
            RoutingStrategy::DomainKnowledge => NodeKind::DomainKnowledge,
            RoutingStrategy::FrequentToken { .. } => NodeKind::FrequentToken,
            RoutingStrategy::PrefixToken { .. } => NodeKind::PrefixToken,
        }
    }

    pub fn emit(&self, ctx: &RoutingContext, record: &LogRecord) -> Vec<String> {
        match *self {
            RoutingStrategy::DomainKnowledge => record.level.iter().cloned().collect(),
            RoutingStrategy::FrequentToken { k } => {
                let joined = record
                    .routing_tokens
                    .iter()
                    .filter_map(|t| ctx.rank(t).map(|r| (r, t.as_str())))
                    .unique_by(|(r, _)| *r)
                    .sorted_by_key(|(r, _)| *r)
                    .take(k)
                    .map(|(_, t)| t)
                    .join(", ");
                if joined.is_empty() {
                    Vec::new()
                } else {
                    vec![joined]
                }
            }
            RoutingStrategy::PrefixToken { max } => record.routing_tokens.iter().take(max).cloned().collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingKey {
    pub kind: NodeKind,
    pub token: String,
}

/// Run `strategies` in order; a strategy that emits nothing contributes [`SENTINEL`].
pub fn extract_routing_keys(strategies: &[RoutingStrategy], ctx: &RoutingContext, record: &LogRecord) -> Vec<RoutingKey> {
    let mut keys = Vec::new();
    for strategy in strategies {
        let kind = strategy.node_kind();
        let mut tokens = strategy.emit(ctx, record);
        if tokens.is_empty() {
            tokens.push(SENTINEL.to_string());
        }
        keys.extend(tokens.into_iter().map(|token| RoutingKey { kind, token }));
    }
    keys
}

/// Global token frequency table, frozen after the sampling phase.
#[derive(Debug, Clone, Default)]
pub struct RoutingContext {
    ranks: AHashMap<String, usize>,
    ranked: Vec<(String, usize)>,
}

impl RoutingContext {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Count routing tokens over `records` and rank them by descending frequency.
    pub fn from_records(records: &[LogRecord], limit: Option<usize>) -> Self {
        let counts = records
            .par_iter()
            .fold(AHashMap::new, |mut acc: AHashMap<String, usize>, r| {
                for t in &r.routing_tokens {
                    *acc.entry(t.clone()).or_insert(0) += 1;
                }
                acc
            })
            .reduce(AHashMap::new, |mut a, b| {
                for (t, n) in b {
                    *a.entry(t).or_insert(0) += n;
                }
                a
            });
        Self::from_counts(counts, limit)
    }

    /// Ties are ranked alphabetically so the table does not depend on hash order.
    pub fn from_counts(counts: AHashMap<String, usize>, limit: Option<usize>) -> Self {
        let ranked: Vec<(String, usize)> = counts
            .into_iter()
            .sorted_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)))
            .take(limit.unwrap_or(usize::MAX))
            .collect();
        let ranks = ranked.iter().enumerate().map(|(i, (t, _))| (t.clone(), i)).collect();
        Self { ranks, ranked }
    }

    /// 0 is the most frequent token.
    pub fn rank(&self, token: &str) -> Option<usize> {
        self.ranks.get(token).copied()
    }

    pub fn top(&self, n: usize) -> &[(String, usize)] {
        &self.ranked[..n.min(self.ranked.len())]
    }

    pub fn len(&self) -> usize {
        self.ranked.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranked.is_empty()
    }
}
