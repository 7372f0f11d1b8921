use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::parser::{LineFormat, LineParser};
use crate::routing::StrategyKind;

/// Environment variable naming a TOML config file used when no path is given.
pub const CONFIG_ENV: &str = "SCALEAD_CONFIG";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cache `{name}` must have a positive capacity (got {capacity})")]
    NonPositiveCapacity { name: &'static str, capacity: usize },
    #[error("`{name}` must be within [{min}, {max}] (got {value})")]
    OutOfRange { name: &'static str, value: f64, min: f64, max: f64 },
    #[error("`{name}` must be positive (got {value})")]
    NonPositive { name: &'static str, value: f64 },
    #[error("`{name}` must be a finite number")]
    NotFinite { name: &'static str },
    #[error("invalid line format: {0}")]
    InvalidFormat(String),
    #[error("cannot read config file {path}: {source}")]
    Read { path: String, source: std::io::Error },
    #[error("cannot parse config file {path}: {source}")]
    Parse { path: String, source: toml::de::Error },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub input: InputConfig,
    pub routing: RoutingConfig,
    pub matching: MatchingConfig,
    pub cache: CacheConfig,
    pub scoring: ScoringConfig,
    pub maintenance: MaintenanceConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InputConfig {
    pub format: LineFormat,
    /// Free-text description of where the logs come from, forwarded to the oracle.
    pub environment: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingConfig {
    /// Records sampled before the frequent-token table is frozen.
    pub sample_size: usize,
    pub frequent_tokens: usize,
    pub prefix_tokens: usize,
    /// Keep only this many top-ranked tokens in the frequency table.
    pub vocabulary_limit: Option<usize>,
    pub reconstruct_strategy: Vec<StrategyKind>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MatchingConfig {
    /// Partial-match threshold on a 0-100 scale.
    pub similarity_threshold: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub cluster_messages: usize,
    pub active_clusters: usize,
    pub history: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScoreScope {
    /// Only the recently active clusters.
    Active,
    All,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringConfig {
    /// Pause between scoring passes.
    pub interval_ms: u64,
    pub shape: f64,
    pub loc: f64,
    pub scale: f64,
    pub exponent: f64,
    pub query_threshold: f64,
    pub max_samples: usize,
    pub oracle_timeout_ms: u64,
    pub scope: ScoreScope,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MaintenanceConfig {
    pub reconstruct_depth: Option<usize>,
    /// Run the reconstruction every this many scoring passes; 0 disables it.
    pub reconstruct_every: u32,
}

impl Default for InputConfig {
    fn default() -> Self {
        Self { format: LineFormat::default(), environment: "unspecified system".to_string() }
    }
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            sample_size: 1000,
            frequent_tokens: 3,
            prefix_tokens: 1,
            vocabulary_limit: None,
            reconstruct_strategy: vec![StrategyKind::PrefixToken],
        }
    }
}

impl Default for MatchingConfig {
    fn default() -> Self {
        Self { similarity_threshold: 70.0 }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { cluster_messages: 300, active_clusters: 200, history: 10_000 }
    }
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            interval_ms: 5_000,
            shape: -0.5,
            loc: 0.0,
            scale: 1.0,
            exponent: 10.0,
            query_threshold: 0.8,
            max_samples: 10,
            oracle_timeout_ms: 30_000,
            scope: ScoreScope::Active,
        }
    }
}

impl Config {
    /// Load configuration.
    /// Priority: explicit path > `SCALEAD_CONFIG` (when the file exists) > defaults.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        if let Some(p) = path {
            return Self::from_file(p);
        }
        match std::env::var(CONFIG_ENV) {
            Ok(p) if Path::new(&p).exists() => {
                tracing::info!("Loading configuration from: {}", p);
                Self::from_file(Path::new(&p))
            }
            _ => Ok(Self::default()),
        }
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        toml::from_str(s).map_err(|source| ConfigError::Parse { path: "<inline>".to_string(), source })
    }

    /// Reject settings that would make ingestion or scoring meaningless.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, capacity) in [
            ("cluster_messages", self.cache.cluster_messages),
            ("active_clusters", self.cache.active_clusters),
            ("history", self.cache.history),
        ] {
            if capacity == 0 {
                return Err(ConfigError::NonPositiveCapacity { name, capacity });
            }
        }
        check_range("similarity_threshold", self.matching.similarity_threshold, 0.0, 100.0)?;
        check_range("query_threshold", self.scoring.query_threshold, 0.0, 1.0)?;
        check_positive("scale", self.scoring.scale)?;
        check_positive("exponent", self.scoring.exponent)?;
        check_positive("prefix_tokens", self.routing.prefix_tokens as f64)?;
        check_positive("interval_ms", self.scoring.interval_ms as f64)?;
        check_positive("oracle_timeout_ms", self.scoring.oracle_timeout_ms as f64)?;
        for (name, value) in [("shape", self.scoring.shape), ("loc", self.scoring.loc)] {
            if !value.is_finite() {
                return Err(ConfigError::NotFinite { name });
            }
        }
        LineParser::new(&self.input.format)?;
        Ok(())
    }
}

fn check_range(name: &'static str, value: f64, min: f64, max: f64) -> Result<(), ConfigError> {
    if !(min..=max).contains(&value) {
        return Err(ConfigError::OutOfRange { name, value, min, max });
    }
    Ok(())
}

fn check_positive(name: &'static str, value: f64) -> Result<(), ConfigError> {
    if value <= 0.0 || !value.is_finite() {
        return Err(ConfigError::NonPositive { name, value });
    }
    Ok(())
}
