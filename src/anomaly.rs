//! Rarity scoring over cluster activity and selection of clusters for review.

use serde::Serialize;
use std::collections::BTreeMap;

use crate::cluster::ClusterId;
use crate::feedback::Decision;

/// Generalized extreme value distribution, with the shape sign convention where a
/// negative shape gives a lower-bounded support.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Gev {
    pub shape: f64,
    pub loc: f64,
    pub scale: f64,
}

impl Default for Gev {
    fn default() -> Self {
        Self { shape: -0.5, loc: 0.0, scale: 1.0 }
    }
}

impl Gev {
    pub fn new(shape: f64, loc: f64, scale: f64) -> Self {
        Self { shape, loc, scale }
    }

    pub fn cdf(&self, x: f64) -> f64 {
        let y = (x - self.loc) / self.scale;
        if self.shape == 0.0 {
            return (-(-y).exp()).exp();
        }
        let t = 1.0 - self.shape * y;
        if t <= 0.0 {
            // outside the support
            return if self.shape > 0.0 { 1.0 } else { 0.0 };
        }
        (-t.powf(1.0 / self.shape)).exp()
    }
}

/// Batch-relative tail probabilities: `cdf_i^T / sum_j cdf_j^T`.
///
/// Values sum to 1 over the batch, or are all 0 when every CDF underflows.
pub fn tail_probabilities(sizes: &[usize], gev: &Gev, exponent: f64) -> Vec<f64> {
    let powered: Vec<f64> = sizes.iter().map(|&s| gev.cdf(s as f64).powf(exponent)).collect();
    let total: f64 = powered.iter().sum();
    if total <= 0.0 || !total.is_finite() {
        return vec![0.0; sizes.len()];
    }
    powered.iter().map(|p| p / total).collect()
}

/// What the scorer needs to know about one cluster, copied out of the trie.
#[derive(Debug, Clone, Serialize)]
pub struct ClusterSample {
    pub id: ClusterId,
    pub size: usize,
    pub decision: Decision,
    pub template: String,
    pub samples: Vec<String>,
    pub metadata: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoringParams {
    pub gev: Gev,
    pub exponent: f64,
    pub query_threshold: f64,
}

impl Default for ScoringParams {
    fn default() -> Self {
        Self { gev: Gev::default(), exponent: 10.0, query_threshold: 0.8 }
    }
}

#[derive(Debug, Clone)]
pub struct Candidate {
    pub sample: ClusterSample,
    pub tp: f64,
}

/// Score a batch. Returns every cluster's tail probability and the still-undecided
/// clusters whose tail probability exceeds the query threshold.
pub fn select_candidates(batch: Vec<ClusterSample>, params: &ScoringParams) -> (Vec<(ClusterId, f64)>, Vec<Candidate>) {
    let sizes: Vec<usize> = batch.iter().map(|s| s.size).collect();
    let tps = tail_probabilities(&sizes, &params.gev, params.exponent);
    let scores = batch.iter().zip(&tps).map(|(s, &tp)| (s.id, tp)).collect();
    let candidates = batch
        .into_iter()
        .zip(tps)
        .filter(|(s, tp)| s.decision == Decision::Unknown && *tp > params.query_threshold)
        .map(|(sample, tp)| Candidate { sample, tp })
        .collect();
    (scores, candidates)
}
