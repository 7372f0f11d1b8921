//! Read-only, serializable views of the engine state.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;

use crate::cluster::{ClusterId, LogCluster};
use crate::feedback::{Decision, FeedBack};
use crate::trie::{NodeId, NodeKind, RoutingNode};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FeedbackView {
    pub decision: Decision,
    pub ep: f64,
    pub tp: f64,
    pub p: Option<f64>,
    pub reason: String,
    pub committer: String,
}

impl From<&FeedBack> for FeedbackView {
    fn from(f: &FeedBack) -> Self {
        Self {
            decision: f.decision,
            ep: f.ep,
            tp: f.tp,
            p: f.p(),
            reason: f.reason.clone(),
            committer: f.committer.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ClusterView {
    pub id: ClusterId,
    pub template: String,
    /// Messages currently cached.
    pub size: usize,
    pub hits: u64,
    pub created_at: DateTime<Utc>,
    pub last_used_at: DateTime<Utc>,
    pub owner: NodeId,
    pub metadata: BTreeMap<String, String>,
    pub samples: Vec<String>,
    pub feedback: FeedbackView,
    /// Latest batch-relative tail probability, if the cluster was ever scored.
    pub rarity: Option<f64>,
}

impl ClusterView {
    pub fn new(cluster: &LogCluster, metadata: BTreeMap<String, String>, samples: usize) -> Self {
        Self {
            id: cluster.id(),
            template: cluster.template().to_string(),
            size: cluster.size(),
            hits: cluster.hits(),
            created_at: cluster.created_at(),
            last_used_at: cluster.last_used_at(),
            owner: cluster.owner(),
            metadata,
            samples: cluster.samples(samples),
            feedback: cluster.feedback().into(),
            rarity: cluster.rarity(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct NodeView {
    pub id: NodeId,
    pub name: String,
    pub kind: NodeKind,
    pub depth: usize,
    pub is_leaf: bool,
    pub children: Vec<String>,
    pub clusters: Vec<ClusterId>,
}

impl From<&RoutingNode> for NodeView {
    fn from(n: &RoutingNode) -> Self {
        Self {
            id: n.id,
            name: n.name.clone(),
            kind: n.kind,
            depth: n.depth,
            is_leaf: n.is_leaf,
            children: n.children.keys().cloned().collect(),
            clusters: n.clusters.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RecordView {
    pub id: u64,
    pub line: String,
    pub cluster_id: ClusterId,
    pub template: Option<String>,
    pub decision: Decision,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Summary {
    pub total_lines: u64,
    pub parse_errors: u64,
    pub sampling: bool,
    pub clusters: usize,
    pub nodes: usize,
    pub active: usize,
    pub anomalies: usize,
    pub normals: usize,
    pub unknown: usize,
}
