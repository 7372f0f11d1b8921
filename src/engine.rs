//! Shared engine state and the two activities that use it: per-line ingestion and the
//! periodic scoring pass.

use std::collections::VecDeque;
use std::io::{self, BufRead};
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::anomaly::{select_candidates, Candidate, ClusterSample, Gev, ScoringParams};
use crate::cache::RecencyCache;
use crate::cluster::ClusterId;
use crate::config::{Config, ConfigError, MaintenanceConfig, ScoreScope};
use crate::feedback::{Decision, FeedBack};
use crate::oracle::{judge_with_timeout, Oracle, OracleQuery, OracleVerdict, QueryMetadata};
use crate::parser::{read_line_lossy, LineParser, ParseError};
use crate::query::{ClusterView, NodeView, RecordView, Summary};
use crate::routing::{RoutingContext, RoutingStrategy, SENTINEL};
use crate::tokenizer::{LogRecord, Tokenizer};
use crate::trie::{ClusterTrie, Placement, ReconstructReport, TrieSettings};

const TOP_TOKENS_IN_QUERY: usize = 5;

#[derive(Debug, Clone)]
struct EngineSettings {
    sample_size: usize,
    vocabulary_limit: Option<usize>,
    reconstruct_strategies: Vec<RoutingStrategy>,
    scoring: ScoringParams,
    scope: ScoreScope,
    max_samples: usize,
    oracle_timeout: Duration,
    interval: Duration,
    environment: String,
    maintenance: MaintenanceConfig,
}

/// One ingested record and the cluster it landed in.
#[derive(Debug, Clone)]
pub struct ProcessedRecord {
    pub id: u64,
    pub line: String,
    pub cluster: ClusterId,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ScoringReport {
    pub scored: usize,
    pub candidates: usize,
    pub queried: usize,
    pub decided: usize,
    pub failed: usize,
}

#[derive(Debug)]
struct EngineState {
    sampling: bool,
    warmup: Vec<LogRecord>,
    routing: RoutingContext,
    trie: ClusterTrie,
    active: RecencyCache<ClusterId>,
    history: VecDeque<ProcessedRecord>,
    history_capacity: usize,
    records: u64,
    parse_errors: u64,
}

impl EngineState {
    fn place(&mut self, record: LogRecord) -> Placement {
        let placement = self.trie.insert(&self.routing, &record);
        // eviction only stops scoring; the cluster stays in the trie
        if let Some(evicted) = self.active.insert(placement.cluster) {
            debug!(cluster = %evicted, "cluster left the active set");
        }
        if self.history.len() >= self.history_capacity {
            self.history.pop_front();
        }
        self.history.push_back(ProcessedRecord { id: record.id, line: record.line, cluster: placement.cluster });
        placement
    }

    fn freeze(&mut self, limit: Option<usize>) -> Vec<Placement> {
        let buffered = std::mem::take(&mut self.warmup);
        self.routing = RoutingContext::from_records(&buffered, limit);
        self.sampling = false;
        info!(records = buffered.len(), vocabulary = self.routing.len(), "frequent-token table frozen");
        buffered.into_iter().map(|r| self.place(r)).collect()
    }
}

/// Trie, caches and history behind one lock, shared by ingestion and scoring.
#[derive(Debug)]
pub struct Engine {
    tokenizer: Tokenizer,
    settings: EngineSettings,
    state: Mutex<EngineState>,
}

impl Engine {
    pub fn new(config: &Config) -> Result<Self, ConfigError> {
        Self::with_tokenizer(config, Tokenizer::default())
    }

    pub fn with_tokenizer(config: &Config, tokenizer: Tokenizer) -> Result<Self, ConfigError> {
        config.validate()?;
        let routing = &config.routing;
        let message_capacity = NonZeroUsize::new(config.cache.cluster_messages).ok_or(
            ConfigError::NonPositiveCapacity { name: "cluster_messages", capacity: config.cache.cluster_messages },
        )?;
        let trie = ClusterTrie::new(
            RoutingStrategy::standard(routing.frequent_tokens, routing.prefix_tokens),
            TrieSettings { similarity_threshold: config.matching.similarity_threshold, message_capacity },
        );
        let scoring = &config.scoring;
        let settings = EngineSettings {
            sample_size: routing.sample_size,
            vocabulary_limit: routing.vocabulary_limit,
            reconstruct_strategies: routing
                .reconstruct_strategy
                .iter()
                .map(|&k| RoutingStrategy::from_kind(k, routing.frequent_tokens, routing.prefix_tokens))
                .collect(),
            scoring: ScoringParams {
                gev: Gev::new(scoring.shape, scoring.loc, scoring.scale),
                exponent: scoring.exponent,
                query_threshold: scoring.query_threshold,
            },
            scope: scoring.scope,
            max_samples: scoring.max_samples,
            oracle_timeout: Duration::from_millis(scoring.oracle_timeout_ms),
            interval: Duration::from_millis(scoring.interval_ms),
            environment: config.input.environment.clone(),
            maintenance: config.maintenance.clone(),
        };
        let state = EngineState {
            sampling: routing.sample_size > 0,
            warmup: Vec::new(),
            routing: RoutingContext::empty(),
            trie,
            active: RecencyCache::new(config.cache.active_clusters)?,
            history: VecDeque::new(),
            history_capacity: config.cache.history,
            records: 0,
            parse_errors: 0,
        };
        Ok(Self { tokenizer, settings, state: Mutex::new(state) })
    }

    fn lock(&self) -> MutexGuard<'_, EngineState> {
        // state stays consistent between statements, so a panicked holder is not fatal
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn tokenizer(&self) -> &Tokenizer {
        &self.tokenizer
    }

    pub fn scoring_interval(&self) -> Duration {
        self.settings.interval
    }

    pub fn is_sampling(&self) -> bool {
        self.lock().sampling
    }

    /// Insert one record. While the frequent-token table is still being sampled the record
    /// is buffered and nothing is returned; the record completing the sample releases
    /// the whole buffer.
    pub fn ingest(&self, record: LogRecord) -> Vec<Placement> {
        let mut guard = self.lock();
        let state = &mut *guard;
        state.records += 1;
        if state.sampling {
            state.warmup.push(record);
            if state.warmup.len() < self.settings.sample_size {
                return Vec::new();
            }
            return state.freeze(self.settings.vocabulary_limit);
        }
        vec![state.place(record)]
    }

    /// Freeze the table from whatever has been sampled so far and place the buffer.
    pub fn finish_sampling(&self) -> Vec<Placement> {
        let mut guard = self.lock();
        if !guard.sampling {
            return Vec::new();
        }
        guard.freeze(self.settings.vocabulary_limit)
    }

    pub(crate) fn note_parse_error(&self) {
        self.lock().parse_errors += 1;
    }

    /// Score the configured batch and consult `oracle` for rare, undecided clusters.
    ///
    /// The lock is released while the oracle is thinking; a verdict is applied only if its
    /// cluster still exists and is still undecided.
    pub fn score_pass(&self, oracle: Option<&Arc<dyn Oracle>>) -> ScoringReport {
        let (batch, top_tokens) = self.snapshot();
        let (scores, candidates) = select_candidates(batch, &self.settings.scoring);
        let mut report = ScoringReport { scored: scores.len(), candidates: candidates.len(), ..Default::default() };
        {
            let mut state = self.lock();
            for (id, tp) in &scores {
                if let Some(c) = state.trie.cluster_mut(*id) {
                    c.set_rarity(*tp);
                }
            }
        }

        let Some(oracle) = oracle else {
            debug!(scored = report.scored, candidates = report.candidates, "scoring pass without oracle");
            return report;
        };
        let committer = oracle.name();
        for candidate in candidates {
            report.queried += 1;
            let id = candidate.sample.id;
            let tp = candidate.tp;
            let query = self.build_query(candidate, &top_tokens);
            match judge_with_timeout(Arc::clone(oracle), query, self.settings.oracle_timeout) {
                Ok(verdict) => {
                    if self.apply_verdict(id, &verdict, tp, &committer) {
                        report.decided += 1;
                    }
                }
                Err(e) => {
                    warn!(cluster = %id, error = %e, "oracle query failed; cluster stays undecided");
                    report.failed += 1;
                }
            }
        }
        report
    }

    fn snapshot(&self) -> (Vec<ClusterSample>, Vec<String>) {
        let state = self.lock();
        let ids: Vec<ClusterId> = match self.settings.scope {
            ScoreScope::Active => state.active.to_list(),
            ScoreScope::All => state.trie.clusters().iter().map(|c| c.id()).collect(),
        };
        let batch = ids
            .into_iter()
            .filter_map(|id| {
                let c = state.trie.cluster(id)?;
                Some(ClusterSample {
                    id,
                    size: c.size(),
                    decision: c.feedback().decision,
                    template: c.template().to_string(),
                    samples: c.samples(self.settings.max_samples),
                    metadata: state.trie.metadata(id),
                })
            })
            .collect();
        let top = state.routing.top(TOP_TOKENS_IN_QUERY).iter().map(|(t, _)| t.clone()).collect();
        (batch, top)
    }

    fn build_query(&self, candidate: Candidate, top_tokens: &[String]) -> OracleQuery {
        let sample = candidate.sample;
        let level = sample.metadata.get("domain-knowledge").filter(|l| l.as_str() != SENTINEL).cloned();
        OracleQuery {
            cluster_id: sample.id,
            template: sample.template,
            samples: sample.samples,
            metadata: QueryMetadata {
                environment: self.settings.environment.clone(),
                level,
                top_tokens: top_tokens.to_vec(),
            },
            tail_probability: candidate.tp,
        }
    }

    fn apply_verdict(&self, id: ClusterId, verdict: &OracleVerdict, tp: f64, committer: &str) -> bool {
        let mut state = self.lock();
        let Some(cluster) = state.trie.cluster_mut(id) else { return false };
        if cluster.feedback().decision.is_known() {
            return false;
        }
        let decision = if verdict.anomalous { Decision::Anomaly } else { Decision::Normal };
        let feedback = FeedBack::new(decision, verdict.confidence, tp, verdict.reason.clone(), committer);
        info!(cluster = %id, ?decision, ep = feedback.ep, tp = feedback.tp, p = ?feedback.p(), "oracle decision applied");
        cluster.set_feedback(feedback);
        true
    }

    /// Rebuild the trie below every node at `depth` with the reconstruction strategies.
    pub fn reconstruct(&self, depth: usize) -> ReconstructReport {
        let mut guard = self.lock();
        let state = &mut *guard;
        state.trie.reconstruct(&state.routing, &self.tokenizer, depth, &self.settings.reconstruct_strategies)
    }

    /// Scheduled reconstruction, due every `reconstruct_every` scoring passes.
    pub fn maintain(&self, pass: u32) -> Option<ReconstructReport> {
        let m = &self.settings.maintenance;
        let depth = m.reconstruct_depth?;
        if m.reconstruct_every == 0 || pass % m.reconstruct_every != 0 {
            return None;
        }
        Some(self.reconstruct(depth))
    }

    pub fn clusters(&self) -> Vec<ClusterView> {
        let state = self.lock();
        state
            .trie
            .clusters()
            .into_iter()
            .map(|c| ClusterView::new(c, state.trie.metadata(c.id()), self.settings.max_samples))
            .collect()
    }

    pub fn cluster(&self, id: ClusterId) -> Option<ClusterView> {
        let state = self.lock();
        let c = state.trie.cluster(id)?;
        Some(ClusterView::new(c, state.trie.metadata(id), self.settings.max_samples))
    }

    /// Trie nodes `depth` levels below the root.
    pub fn nodes_at_depth(&self, depth: usize) -> Vec<NodeView> {
        let state = self.lock();
        state
            .trie
            .search_nodes_at_depth(state.trie.root(), depth)
            .into_iter()
            .filter_map(|id| state.trie.node(id).map(NodeView::from))
            .collect()
    }

    /// Recently processed records, oldest first, with their cluster's current decision.
    pub fn records(&self) -> Vec<RecordView> {
        let state = self.lock();
        state
            .history
            .iter()
            .map(|r| {
                let c = state.trie.cluster(r.cluster);
                let feedback = c.map(|c| c.feedback().clone()).unwrap_or_default();
                RecordView {
                    id: r.id,
                    line: r.line.clone(),
                    cluster_id: r.cluster,
                    template: c.map(|c| c.template().to_string()),
                    decision: feedback.decision,
                    reason: feedback.reason,
                }
            })
            .collect()
    }

    /// Clusters in the active set, least recently used first.
    pub fn active_clusters(&self) -> Vec<ClusterId> {
        self.lock().active.to_list()
    }

    pub fn summary(&self) -> Summary {
        let state = self.lock();
        let mut summary = Summary {
            total_lines: state.records + state.parse_errors,
            parse_errors: state.parse_errors,
            sampling: state.sampling,
            clusters: state.trie.cluster_count(),
            nodes: state.trie.node_count(),
            active: state.active.len(),
            ..Default::default()
        };
        for c in state.trie.clusters() {
            match c.feedback().decision {
                Decision::Anomaly => summary.anomalies += 1,
                Decision::Normal => summary.normals += 1,
                Decision::Unknown => summary.unknown += 1,
            }
        }
        summary
    }
}

/// Run scoring passes every scoring interval until `running` is cleared.
pub fn spawn_scoring_loop(
    engine: Arc<Engine>,
    oracle: Option<Arc<dyn Oracle>>,
    running: Arc<AtomicBool>,
) -> io::Result<JoinHandle<()>> {
    let interval = engine.scoring_interval();
    thread::Builder::new().name("scalead-scoring".to_string()).spawn(move || {
        let mut pass: u32 = 0;
        while running.load(Ordering::SeqCst) {
            let deadline = Instant::now() + interval;
            while running.load(Ordering::SeqCst) {
                let now = Instant::now();
                if now >= deadline {
                    break;
                }
                thread::sleep((deadline - now).min(Duration::from_millis(100)));
            }
            if !running.load(Ordering::SeqCst) {
                break;
            }
            pass = pass.wrapping_add(1);
            let report = engine.score_pass(oracle.as_ref());
            debug!(pass, ?report, "scoring pass finished");
            if let Some(r) = engine.maintain(pass) {
                debug!(pass, ?r, "scheduled reconstruction finished");
            }
        }
    })
}

/// Per-line ingestion: parse, tokenize, insert. A line that fails to parse is reported
/// and skipped; it never stops the stream.
#[derive(Debug)]
pub struct Pipeline {
    parser: LineParser,
    engine: Arc<Engine>,
    line_number: usize,
}

impl Pipeline {
    pub fn new(config: &Config) -> Result<Self, ConfigError> {
        let engine = Arc::new(Engine::new(config)?);
        Self::with_engine(config, engine)
    }

    pub fn with_engine(config: &Config, engine: Arc<Engine>) -> Result<Self, ConfigError> {
        Ok(Self { parser: LineParser::new(&config.input.format)?, engine, line_number: 0 })
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    pub fn process_line(&mut self, line: &str) -> Result<Vec<Placement>, ParseError> {
        self.line_number += 1;
        match self.parser.parse(line, self.line_number) {
            Ok(parsed) => {
                let record = self.engine.tokenizer().record(parsed);
                Ok(self.engine.ingest(record))
            }
            Err(e) => {
                self.engine.note_parse_error();
                debug!(line = e.line_number(), kind = e.kind(), "skipping line");
                Err(e)
            }
        }
    }

    /// Process every line of `reader`. Undecodable bytes are replaced and parse failures
    /// are counted and skipped; only an I/O error stops the read. Returns lines read.
    pub fn feed<R: BufRead>(&mut self, mut reader: R) -> io::Result<usize> {
        let mut buf = Vec::new();
        let mut lines = 0;
        while let Some(line) = read_line_lossy(&mut reader, &mut buf)? {
            lines += 1;
            let _ = self.process_line(&line);
        }
        Ok(lines)
    }

    /// End of input: place whatever is still buffered for sampling.
    pub fn finish(&mut self) -> Vec<Placement> {
        self.engine.finish_sampling()
    }
}
