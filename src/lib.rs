pub mod config;
pub mod parser;
pub mod tokenizer;
pub mod routing;
pub mod cache;
pub mod cluster;
pub mod matcher;
pub mod trie;
pub mod anomaly;
pub mod feedback;
pub mod oracle;
pub mod engine;
pub mod query;
