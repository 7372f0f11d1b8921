use std::collections::BTreeSet;
use std::num::NonZeroUsize;

use scalead::cluster::ClusterId;
use scalead::matcher::MatchKind;
use scalead::routing::{RoutingContext, RoutingStrategy, SENTINEL};
use scalead::tokenizer::Tokenizer;
use scalead::trie::{ClusterTrie, NodeKind, TrieSettings};

fn trie(prefix: usize) -> ClusterTrie {
    let settings = TrieSettings { similarity_threshold: 70.0, message_capacity: NonZeroUsize::new(300).unwrap() };
    ClusterTrie::new(RoutingStrategy::standard(3, prefix), settings)
}

#[test]
fn similar_lines_share_a_cluster_and_generalize() {
    let t = Tokenizer::default();
    let ctx = RoutingContext::empty();
    let mut trie = trie(1);

    let p1 = trie.insert(&ctx, &t.record_from_content(1, "CE sym 2, at 0x0b85eee0, mask 0x05", None));
    let p2 = trie.insert(&ctx, &t.record_from_content(2, "CE sym 27, at 0x11b3f3c0, mask 0x10", None));
    let p3 = trie.insert(&ctx, &t.record_from_content(3, "CE sym 9, at 0x00000001, mask 0x02", None));

    assert_eq!((p1.kind, p2.kind, p3.kind), (MatchKind::NoMatch, MatchKind::Partial, MatchKind::Exact));
    assert_eq!(p1.cluster, p2.cluster);
    assert_eq!(p2.cluster, p3.cluster);
    assert_eq!(p1.leaf, p3.leaf);
    assert_eq!(p3.record_id, 3);
    assert_eq!(trie.cluster_count(), 1);

    let c = trie.cluster(p1.cluster).unwrap();
    assert_eq!(c.template(), "CE sym <*> at <*> mask <*>");
    assert_eq!(c.owner(), p1.leaf);
    assert_eq!(c.size(), 3);
}

#[test]
fn leaf_sits_below_one_node_per_routing_key() {
    let t = Tokenizer::default();
    let ctx = RoutingContext::empty();
    let mut trie = trie(1);
    let p = trie.insert(&ctx, &t.record_from_content(1, "disk sda failed", Some("ERROR")));

    let leaf = trie.node(p.leaf).unwrap();
    assert!(leaf.is_leaf);
    assert_eq!(leaf.depth, 3);
    assert_eq!(leaf.kind, NodeKind::PrefixToken);
    assert_eq!(leaf.name, "disk");
    assert_eq!(leaf.clusters, vec![p.cluster]);
    // root, level, frequent-token sentinel, prefix
    assert_eq!(trie.node_count(), 4);

    let root = trie.node(trie.root()).unwrap();
    assert!(!root.is_leaf);
    assert!(root.clusters.is_empty());
}

#[test]
fn different_levels_route_apart() {
    let t = Tokenizer::default();
    let ctx = RoutingContext::empty();
    let mut trie = trie(1);
    let a = trie.insert(&ctx, &t.record_from_content(1, "disk sda failed", Some("INFO")));
    let b = trie.insert(&ctx, &t.record_from_content(2, "disk sda failed", Some("ERROR")));
    assert_ne!(a.cluster, b.cluster);
    assert_eq!(b.kind, MatchKind::NoMatch);

    let level_nodes = trie.search_nodes_at_depth(trie.root(), 1);
    let names: Vec<&str> = level_nodes.iter().map(|id| trie.node(*id).unwrap().name.as_str()).collect();
    assert_eq!(names, vec!["ERROR", "INFO"]);
}

#[test]
fn dissimilar_lines_in_one_leaf_get_their_own_clusters() {
    let t = Tokenizer::default();
    let ctx = RoutingContext::empty();
    let mut trie = trie(1);
    let a = trie.insert(&ctx, &t.record_from_content(1, "user alice logged in", None));
    let b = trie.insert(&ctx, &t.record_from_content(2, "user quota exceeded on volume home", None));
    assert_eq!(a.leaf, b.leaf);
    assert_ne!(a.cluster, b.cluster);
    assert_eq!(trie.node(a.leaf).unwrap().clusters, vec![a.cluster, b.cluster]);
}

#[test]
fn recursive_search_finds_every_cluster() {
    let t = Tokenizer::default();
    let ctx = RoutingContext::empty();
    let mut trie = trie(1);
    for (i, (line, level)) in [
        ("disk sda failed", "ERROR"),
        ("user alice logged in", "INFO"),
        ("service started", "INFO"),
        ("fan speed low", "WARN"),
    ]
    .iter()
    .enumerate()
    {
        trie.insert(&ctx, &t.record_from_content(i as u64, line, Some(level)));
    }
    let all: BTreeSet<ClusterId> = trie.search_clusters_recursive(trie.root()).into_iter().collect();
    assert_eq!(all.len(), 4);
    assert_eq!(all.len(), trie.cluster_count());

    let info = trie
        .search_nodes_at_depth(trie.root(), 1)
        .into_iter()
        .find(|id| trie.node(*id).unwrap().name == "INFO")
        .unwrap();
    assert_eq!(trie.search_clusters_recursive(info).len(), 2);
}

#[test]
fn depth_zero_is_the_node_itself() {
    let t = Tokenizer::default();
    let ctx = RoutingContext::empty();
    let mut trie = trie(1);
    trie.insert(&ctx, &t.record_from_content(1, "disk sda failed", Some("ERROR")));
    assert_eq!(trie.search_nodes_at_depth(trie.root(), 0), vec![trie.root()]);
    assert_eq!(trie.search_nodes_at_depth(trie.root(), 3).len(), 1);
    assert!(trie.search_nodes_at_depth(trie.root(), 4).is_empty());
}

#[test]
fn metadata_collects_names_per_node_kind() {
    let t = Tokenizer::default();
    let sample = [t.record_from_content(1, "CE sym mask", None)];
    let ctx = RoutingContext::from_records(&sample, None);
    let mut trie = trie(2);
    let p = trie.insert(&ctx, &t.record_from_content(1, "CE sym 2, at 0x0b85eee0, mask 0x05", Some("INFO")));

    let meta = trie.metadata(p.cluster);
    assert_eq!(meta.get("domain-knowledge").map(String::as_str), Some("INFO"));
    assert_eq!(meta.get("frequent-token").map(String::as_str), Some("CE, mask, sym"));
    assert_eq!(meta.get("prefix-token").map(String::as_str), Some("CE, sym"));
    assert!(!meta.contains_key("root"));
}

#[test]
fn metadata_names_follow_routing_order() {
    let t = Tokenizer::default();
    let mut trie = trie(2);
    let p = trie.insert(&RoutingContext::empty(), &t.record_from_content(1, "zone alpha offline", None));
    let meta = trie.metadata(p.cluster);
    assert_eq!(meta.get("prefix-token").map(String::as_str), Some("zone, alpha"));
}

#[test]
fn missing_level_shows_the_sentinel() {
    let t = Tokenizer::default();
    let mut trie = trie(1);
    let p = trie.insert(&RoutingContext::empty(), &t.record_from_content(1, "fan speed low", None));
    let meta = trie.metadata(p.cluster);
    assert_eq!(meta.get("domain-knowledge").map(String::as_str), Some(SENTINEL));
    assert_eq!(meta.get("frequent-token").map(String::as_str), Some(SENTINEL));
}

#[test]
fn reconstruction_moves_clusters_wholesale() {
    let t = Tokenizer::default();
    let ctx = RoutingContext::empty();
    let mut trie = trie(1);
    let lines = [
        ("CE sym 2, at 0x0b85eee0, mask 0x05", "INFO"),
        ("CE sym 27, at 0x11b3f3c0, mask 0x10", "INFO"),
        ("disk sda failed", "ERROR"),
        ("fan speed low", "ERROR"),
    ];
    for (i, (line, level)) in lines.iter().enumerate() {
        trie.insert(&ctx, &t.record_from_content(i as u64, line, Some(level)));
    }
    let before: BTreeSet<ClusterId> = trie.search_clusters_recursive(trie.root()).into_iter().collect();
    let hits_before: Vec<u64> = before.iter().map(|id| trie.cluster(*id).unwrap().hits()).collect();
    let nodes_before = trie.node_count();

    let report = trie.reconstruct(&ctx, &t, 1, &[RoutingStrategy::PrefixToken { max: 1 }]);
    assert_eq!(report.rebuilt, 2);
    assert_eq!(report.clusters, 3);
    assert!(report.removed > 0);

    let after: BTreeSet<ClusterId> = trie.search_clusters_recursive(trie.root()).into_iter().collect();
    assert_eq!(before, after);
    let hits_after: Vec<u64> = after.iter().map(|id| trie.cluster(*id).unwrap().hits()).collect();
    assert_eq!(hits_before, hits_after);
    assert!(trie.node_count() < nodes_before);

    for id in &after {
        let c = trie.cluster(*id).unwrap();
        let owner = trie.node(c.owner()).unwrap();
        assert_eq!(owner.kind, NodeKind::PrefixToken);
        assert_eq!(owner.depth, 2);
        assert!(owner.is_leaf);
        assert!(owner.clusters.contains(id));
        assert!(!trie.metadata(*id).contains_key("frequent-token"));
    }

    let ce = after.iter().find(|id| trie.cluster(**id).unwrap().template().starts_with("CE")).unwrap();
    let meta = trie.metadata(*ce);
    assert_eq!(meta.get("domain-knowledge").map(String::as_str), Some("INFO"));
    assert_eq!(meta.get("prefix-token").map(String::as_str), Some("CE"));

    for id in trie.search_nodes_at_depth(trie.root(), 1) {
        let n = trie.node(id).unwrap();
        assert!(!n.is_leaf);
        assert!(n.clusters.is_empty());
    }
}

#[test]
fn reconstruction_below_the_tree_is_a_no_op() {
    let t = Tokenizer::default();
    let ctx = RoutingContext::empty();
    let mut trie = trie(1);
    trie.insert(&ctx, &t.record_from_content(1, "disk sda failed", Some("ERROR")));
    let report = trie.reconstruct(&ctx, &t, 7, &[RoutingStrategy::PrefixToken { max: 1 }]);
    assert_eq!(report.rebuilt, 0);
    assert_eq!(report.clusters, 0);
    assert_eq!(trie.node_count(), 4);
}

#[test]
fn reconstruction_from_the_root_rebuilds_the_whole_tree() {
    let t = Tokenizer::default();
    let ctx = RoutingContext::empty();
    let mut trie = trie(1);
    trie.insert(&ctx, &t.record_from_content(1, "disk sda failed", Some("ERROR")));
    trie.insert(&ctx, &t.record_from_content(2, "fan speed low", Some("WARN")));
    let strategies = [RoutingStrategy::DomainKnowledge, RoutingStrategy::PrefixToken { max: 1 }];
    let report = trie.reconstruct(&ctx, &t, 0, &strategies);
    assert_eq!(report.rebuilt, 1);
    assert_eq!(report.clusters, 2);
    // root, two levels, two prefixes
    assert_eq!(trie.node_count(), 5);
    for c in trie.clusters() {
        assert_eq!(trie.node(c.owner()).unwrap().depth, 2);
    }
}
