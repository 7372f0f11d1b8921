use ahash::AHashMap;

use scalead::routing::{extract_routing_keys, RoutingContext, RoutingStrategy, SENTINEL};
use scalead::tokenizer::{LogRecord, Tokenizer};
use scalead::trie::NodeKind;

fn records(lines: &[&str]) -> Vec<LogRecord> {
    let t = Tokenizer::default();
    lines.iter().enumerate().map(|(i, l)| t.record_from_content(i as u64 + 1, l, None)).collect()
}

fn sample_context() -> RoutingContext {
    RoutingContext::from_records(&records(&["alpha beta gamma", "alpha beta", "alpha delta"]), None)
}

fn tokens(keys: &[scalead::routing::RoutingKey]) -> Vec<&str> {
    keys.iter().map(|k| k.token.as_str()).collect()
}

#[test]
fn vocabulary_is_ranked_by_frequency_then_alphabetically() {
    let ctx = sample_context();
    assert_eq!(ctx.len(), 4);
    assert_eq!(ctx.rank("alpha"), Some(0));
    assert_eq!(ctx.rank("beta"), Some(1));
    assert_eq!(ctx.rank("delta"), Some(2));
    assert_eq!(ctx.rank("gamma"), Some(3));
    assert_eq!(ctx.rank("omega"), None);
    assert_eq!(ctx.top(2), &[("alpha".to_string(), 3), ("beta".to_string(), 2)]);
    assert_eq!(ctx.top(10).len(), 4);
}

#[test]
fn vocabulary_limit_keeps_top_tokens_only() {
    let ctx = RoutingContext::from_records(&records(&["alpha beta gamma", "alpha beta", "alpha delta"]), Some(2));
    assert_eq!(ctx.len(), 2);
    assert_eq!(ctx.rank("beta"), Some(1));
    assert_eq!(ctx.rank("delta"), None);
}

#[test]
fn only_routing_tokens_are_counted() {
    let ctx = RoutingContext::from_records(&records(&["the disk 42 failed", "a disk is ok"]), None);
    assert_eq!(ctx.rank("disk"), Some(0));
    assert_eq!(ctx.rank("the"), None);
    assert_eq!(ctx.rank("42"), None);
}

#[test]
fn frequent_tokens_form_one_composite_edge() {
    let ctx = sample_context();
    let r = Tokenizer::default().record_from_content(9, "gamma beta alpha zeta", None);
    assert_eq!(RoutingStrategy::FrequentToken { k: 3 }.emit(&ctx, &r), vec!["alpha, beta, gamma"]);
    assert_eq!(RoutingStrategy::FrequentToken { k: 2 }.emit(&ctx, &r), vec!["alpha, beta"]);
}

#[test]
fn repeated_tokens_appear_once_in_the_composite() {
    let ctx = sample_context();
    let r = Tokenizer::default().record_from_content(9, "beta alpha beta alpha", None);
    assert_eq!(RoutingStrategy::FrequentToken { k: 3 }.emit(&ctx, &r), vec!["alpha, beta"]);
}

#[test]
fn keys_follow_strategy_order() {
    let ctx = sample_context();
    let r = Tokenizer::default().record_from_content(9, "gamma beta alpha", Some("error"));
    let keys = extract_routing_keys(&RoutingStrategy::standard(3, 1), &ctx, &r);
    assert_eq!(tokens(&keys), vec!["ERROR", "alpha, beta, gamma", "gamma"]);
    let kinds: Vec<NodeKind> = keys.iter().map(|k| k.kind).collect();
    assert_eq!(kinds, vec![NodeKind::DomainKnowledge, NodeKind::FrequentToken, NodeKind::PrefixToken]);
}

#[test]
fn prefix_tokens_are_separate_edges() {
    let ctx = RoutingContext::empty();
    let r = Tokenizer::default().record_from_content(1, "Receiving block blk_1 src dest", Some("INFO"));
    let keys = extract_routing_keys(&RoutingStrategy::standard(3, 2), &ctx, &r);
    assert_eq!(tokens(&keys), vec!["INFO", SENTINEL, "Receiving", "block"]);
}

#[test]
fn empty_strategies_emit_the_sentinel() {
    let ctx = sample_context();
    let r = Tokenizer::default().record_from_content(1, "12 34 0x56", None);
    assert!(r.routing_tokens.is_empty());
    let keys = extract_routing_keys(&RoutingStrategy::standard(3, 1), &ctx, &r);
    assert_eq!(tokens(&keys), vec![SENTINEL, SENTINEL, SENTINEL]);

    let zero_k = RoutingStrategy::FrequentToken { k: 0 };
    let r = Tokenizer::default().record_from_content(2, "alpha beta", None);
    assert_eq!(tokens(&extract_routing_keys(&[zero_k], &ctx, &r)), vec![SENTINEL]);
}

#[test]
fn routing_is_deterministic() {
    let ctx = sample_context();
    let r = Tokenizer::default().record_from_content(3, "delta gamma beta alpha", Some("WARN"));
    let strategies = RoutingStrategy::standard(3, 2);
    let first = extract_routing_keys(&strategies, &ctx, &r);
    for _ in 0..10 {
        assert_eq!(extract_routing_keys(&strategies, &ctx, &r), first);
    }
}

#[test]
fn tables_built_from_equal_counts_agree() {
    let mut a = AHashMap::new();
    let mut b = AHashMap::new();
    for (t, n) in [("x", 2), ("y", 2), ("z", 5)] {
        a.insert(t.to_string(), n);
    }
    for (t, n) in [("z", 5), ("y", 2), ("x", 2)] {
        b.insert(t.to_string(), n);
    }
    let a = RoutingContext::from_counts(a, None);
    let b = RoutingContext::from_counts(b, None);
    assert_eq!(a.top(3), b.top(3));
    assert_eq!(a.rank("x"), Some(1));
}
