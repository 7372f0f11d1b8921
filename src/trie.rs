use ahash::AHashMap;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::num::NonZeroUsize;
use tracing::{debug, info};

use crate::cluster::{ClusterId, LogCluster};
use crate::matcher::{match_record, MatchKind, MatchOutcome};
use crate::routing::{extract_routing_keys, RoutingContext, RoutingKey, RoutingStrategy, SENTINEL};
use crate::tokenizer::{LogRecord, Tokenizer};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub u64);

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "n{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NodeKind {
    Root,
    DomainKnowledge,
    FrequentToken,
    PrefixToken,
}

impl NodeKind {
    pub fn label(self) -> &'static str {
        match self {
            NodeKind::Root => "root",
            NodeKind::DomainKnowledge => "domain-knowledge",
            NodeKind::FrequentToken => "frequent-token",
            NodeKind::PrefixToken => "prefix-token",
        }
    }
}

#[derive(Debug, Clone)]
pub struct RoutingNode {
    pub id: NodeId,
    /// The routing token on the edge into this node.
    pub name: String,
    pub kind: NodeKind,
    pub depth: usize,
    pub children: BTreeMap<String, NodeId>,
    pub is_leaf: bool,
    /// Clusters owned by this node, in creation order.
    pub clusters: Vec<ClusterId>,
    pub parent: Option<NodeId>,
}

impl RoutingNode {
    fn new(id: NodeId, name: &str, kind: NodeKind, depth: usize, parent: Option<NodeId>) -> Self {
        Self {
            id,
            name: name.to_string(),
            kind,
            depth,
            children: BTreeMap::new(),
            is_leaf: false,
            clusters: Vec::new(),
            parent,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TrieSettings {
    /// Partial-match threshold, 0-100.
    pub similarity_threshold: f64,
    pub message_capacity: NonZeroUsize,
}

/// Where one record ended up.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Placement {
    pub record_id: u64,
    pub leaf: NodeId,
    pub cluster: ClusterId,
    pub kind: MatchKind,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReconstructReport {
    /// Nodes whose subtrees were rebuilt.
    pub rebuilt: usize,
    /// Descendant nodes discarded.
    pub removed: usize,
    /// Clusters re-routed.
    pub clusters: usize,
}

/// Routing trie owning every cluster. Nodes and clusters live in arenas keyed by id;
/// a cluster only remembers the id of the node that owns it.
#[derive(Debug)]
pub struct ClusterTrie {
    nodes: AHashMap<NodeId, RoutingNode>,
    clusters: AHashMap<ClusterId, LogCluster>,
    root: NodeId,
    next_node: u64,
    next_cluster: u64,
    strategies: Vec<RoutingStrategy>,
    settings: TrieSettings,
}

impl ClusterTrie {
    pub fn new(strategies: Vec<RoutingStrategy>, settings: TrieSettings) -> Self {
        let root = NodeId(0);
        let mut nodes = AHashMap::new();
        nodes.insert(root, RoutingNode::new(root, "root", NodeKind::Root, 0, None));
        Self { nodes, clusters: AHashMap::new(), root, next_node: 1, next_cluster: 0, strategies, settings }
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    pub fn node(&self, id: NodeId) -> Option<&RoutingNode> {
        self.nodes.get(&id)
    }

    pub fn cluster(&self, id: ClusterId) -> Option<&LogCluster> {
        self.clusters.get(&id)
    }

    pub fn cluster_mut(&mut self, id: ClusterId) -> Option<&mut LogCluster> {
        self.clusters.get_mut(&id)
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn cluster_count(&self) -> usize {
        self.clusters.len()
    }

    /// All clusters ordered by id.
    pub fn clusters(&self) -> Vec<&LogCluster> {
        let mut all: Vec<&LogCluster> = self.clusters.values().collect();
        all.sort_by_key(|c| c.id());
        all
    }

    /// Route `record` to a leaf and match it against the clusters the leaf owns.
    pub fn insert(&mut self, ctx: &RoutingContext, record: &LogRecord) -> Placement {
        let keys = extract_routing_keys(&self.strategies, ctx, record);
        let leaf = self.descend(self.root, &keys);

        let outcome = match self.nodes.get(&leaf) {
            Some(node) => {
                let candidates: Vec<&LogCluster> =
                    node.clusters.iter().filter_map(|id| self.clusters.get(id)).collect();
                match_record(&candidates, &record.content, self.settings.similarity_threshold)
            }
            None => MatchOutcome::NoMatch,
        };

        let cluster = match outcome {
            MatchOutcome::Exact(id) | MatchOutcome::Partial { cluster: id, .. } => id,
            MatchOutcome::NoMatch => self.new_cluster(leaf),
        };
        let kind = outcome.kind();
        if let Some(c) = self.clusters.get_mut(&cluster) {
            c.insert_and_update(record, kind);
        }
        debug!(record = record.id, %leaf, %cluster, ?kind, "placed record");
        Placement { record_id: record.id, leaf, cluster, kind }
    }

    /// Clusters owned by `node` and everything beneath it, depth first.
    pub fn search_clusters_recursive(&self, node: NodeId) -> Vec<ClusterId> {
        let mut out = Vec::new();
        let mut stack = vec![node];
        while let Some(id) = stack.pop() {
            let Some(n) = self.nodes.get(&id) else { continue };
            out.extend(n.clusters.iter().copied());
            // reversed so the smallest edge is visited first
            stack.extend(n.children.values().rev().copied());
        }
        out
    }

    /// Nodes exactly `depth` levels below `node`; 0 yields `node` itself.
    pub fn search_nodes_at_depth(&self, node: NodeId, depth: usize) -> Vec<NodeId> {
        if !self.nodes.contains_key(&node) {
            return Vec::new();
        }
        let mut frontier = vec![node];
        for _ in 0..depth {
            frontier = frontier
                .iter()
                .filter_map(|id| self.nodes.get(id))
                .flat_map(|n| n.children.values().copied())
                .collect();
        }
        frontier
    }

    /// Rebuild every subtree rooted `depth` levels below the root.
    ///
    /// The clusters under each such node are collected, the subtree is discarded and each
    /// cluster is routed again below the node with `strategies`, using a record synthesized
    /// from its template. Templates, caches and feedback are carried over untouched.
    pub fn reconstruct(
        &mut self,
        ctx: &RoutingContext,
        tokenizer: &Tokenizer,
        depth: usize,
        strategies: &[RoutingStrategy],
    ) -> ReconstructReport {
        let mut report = ReconstructReport::default();
        for target in self.search_nodes_at_depth(self.root, depth) {
            let gathered: Vec<(ClusterId, Option<String>)> = self
                .search_clusters_recursive(target)
                .into_iter()
                .map(|id| (id, self.domain_level(id)))
                .collect();

            report.removed += self.remove_descendants(target);
            if let Some(n) = self.nodes.get_mut(&target) {
                n.children.clear();
                n.clusters.clear();
                n.is_leaf = false;
            }

            for (id, level) in gathered {
                let Some(template) = self.clusters.get(&id).map(|c| c.template().to_string()) else { continue };
                let synthetic = tokenizer.record_from_content(0, &template, level.as_deref());
                let keys = extract_routing_keys(strategies, ctx, &synthetic);
                let leaf = self.descend(target, &keys);
                if let Some(n) = self.nodes.get_mut(&leaf) {
                    n.clusters.push(id);
                }
                if let Some(c) = self.clusters.get_mut(&id) {
                    c.set_owner(leaf);
                }
                report.clusters += 1;
            }
            report.rebuilt += 1;
        }
        info!(depth, rebuilt = report.rebuilt, removed = report.removed, clusters = report.clusters, "trie reconstructed");
        report
    }

    /// Routing context of a cluster: node kind label to the names on the path from the
    /// root to its owner, several names of one kind joined with ", ".
    pub fn metadata(&self, cluster: ClusterId) -> BTreeMap<String, String> {
        let mut out: BTreeMap<String, String> = BTreeMap::new();
        let Some(c) = self.clusters.get(&cluster) else { return out };
        for node in self.path_to(c.owner()) {
            out.entry(node.kind.label().to_string())
                .and_modify(|v| {
                    v.push_str(", ");
                    v.push_str(&node.name);
                })
                .or_insert_with(|| node.name.clone());
        }
        out
    }

    /// Non-root nodes from just below the root down to `node`.
    fn path_to(&self, node: NodeId) -> Vec<&RoutingNode> {
        let mut path = Vec::new();
        let mut current = self.nodes.get(&node);
        while let Some(n) = current {
            if n.kind != NodeKind::Root {
                path.push(n);
            }
            current = n.parent.and_then(|p| self.nodes.get(&p));
        }
        path.reverse();
        path
    }

    fn domain_level(&self, cluster: ClusterId) -> Option<String> {
        let c = self.clusters.get(&cluster)?;
        self.path_to(c.owner())
            .into_iter()
            .find(|n| n.kind == NodeKind::DomainKnowledge && n.name != SENTINEL)
            .map(|n| n.name.clone())
    }

    fn new_cluster(&mut self, leaf: NodeId) -> ClusterId {
        let id = ClusterId(self.next_cluster);
        self.next_cluster += 1;
        self.clusters.insert(id, LogCluster::new(id, leaf, self.settings.message_capacity));
        if let Some(n) = self.nodes.get_mut(&leaf) {
            n.clusters.push(id);
        }
        id
    }

    /// Follow (creating as needed) one edge per key from `from`; the last node becomes a leaf.
    fn descend(&mut self, from: NodeId, keys: &[RoutingKey]) -> NodeId {
        let mut current = from;
        for key in keys {
            current = self.child_or_insert(current, key);
        }
        if let Some(n) = self.nodes.get_mut(&current) {
            n.is_leaf = true;
        }
        current
    }

    fn child_or_insert(&mut self, parent: NodeId, key: &RoutingKey) -> NodeId {
        let Some(p) = self.nodes.get(&parent) else { return parent };
        if let Some(&child) = p.children.get(&key.token) {
            return child;
        }
        let depth = p.depth + 1;
        let id = NodeId(self.next_node);
        self.next_node += 1;
        self.nodes.insert(id, RoutingNode::new(id, &key.token, key.kind, depth, Some(parent)));
        if let Some(p) = self.nodes.get_mut(&parent) {
            p.children.insert(key.token.clone(), id);
        }
        id
    }

    fn remove_descendants(&mut self, node: NodeId) -> usize {
        let mut queue: VecDeque<NodeId> =
            self.nodes.get(&node).map(|n| n.children.values().copied().collect()).unwrap_or_default();
        let mut removed = 0;
        while let Some(id) = queue.pop_front() {
            if let Some(n) = self.nodes.remove(&id) {
                queue.extend(n.children.values().copied());
                removed += 1;
            }
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trie() -> ClusterTrie {
        let settings = TrieSettings { similarity_threshold: 70.0, message_capacity: NonZeroUsize::new(4).unwrap() };
        ClusterTrie::new(RoutingStrategy::standard(3, 1), settings)
    }

    #[test]
    fn root_is_the_only_node_of_an_empty_trie() {
        let t = trie();
        assert_eq!(t.node_count(), 1);
        assert_eq!(t.search_nodes_at_depth(t.root(), 0), vec![t.root()]);
        assert!(t.search_clusters_recursive(t.root()).is_empty());
    }

    #[test]
    fn unknown_node_has_no_descendants() {
        let t = trie();
        assert!(t.search_nodes_at_depth(NodeId(99), 1).is_empty());
    }
}
