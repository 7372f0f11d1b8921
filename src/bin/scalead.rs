use anyhow::{bail, Context};
use clap::Parser;
use std::fs::File;
use std::io::{self, BufReader};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Once};
use std::time::{Duration, Instant};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use scalead::config::{Config, ScoreScope};
use scalead::engine::{spawn_scoring_loop, Engine, Pipeline, ScoringReport};
use scalead::oracle::{CommandOracle, ConsoleOracle, Oracle};
use scalead::parser::{read_line_lossy, LineFormat};
use scalead::query::{ClusterView, NodeView, RecordView, Summary};

fn init_parallelism() {
    static START: Once = Once::new();
    START.call_once(|| {
        let n = num_cpus::get();
        let _ = rayon::ThreadPoolBuilder::new().num_threads(n).build_global();
    });
}

fn init_logging() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "scalead=info".into()))
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .init();
}

#[derive(Parser, Debug)]
#[command(name = "scalead", version, about = "Online log template mining with rarity-driven anomaly review")]
struct Cli {
    /// Input files (`-` for stdin). May be repeated.
    #[arg(required = false)]
    input: Vec<String>,

    /// TOML configuration file (falls back to $SCALEAD_CONFIG)
    #[arg(long = "config", short = 'c')]
    config: Option<PathBuf>,

    // Line format overrides
    #[arg(long = "headers", conflicts_with_all = ["regex", "grok"])] headers: Option<String>,
    #[arg(long = "regex", conflicts_with = "grok")] regex: Option<String>,
    #[arg(long = "grok")] grok: Option<String>,
    /// Free-text description of the log source, shown to the oracle
    #[arg(long = "environment")] environment: Option<String>,

    // Engine overrides
    #[arg(long = "sample-size")] sample_size: Option<usize>,
    #[arg(long = "threshold")] similarity_threshold: Option<f64>,
    #[arg(long = "query-threshold")] query_threshold: Option<f64>,
    /// Scoring batch: active | all
    #[arg(long = "scope")] scope: Option<String>,
    /// Scoring interval seconds (follow mode)
    #[arg(long = "interval")] interval_secs: Option<u64>,

    /// Oracle consulted for rare clusters: none | console | command
    #[arg(long = "oracle", default_value = "none")] oracle: String,
    /// Program (with arguments) run by the command oracle
    #[arg(long = "oracle-command")] oracle_command: Option<String>,

    /// Rebuild the trie below this depth before scoring (batch mode)
    #[arg(long = "reconstruct")] reconstruct: Option<usize>,

    /// Print only a specific section: clusters | records | nodes | summary
    #[arg(long = "only")] only: Option<String>,
    /// Trie depth listed by `--only nodes`
    #[arg(long = "depth", default_value_t = 1)] depth: usize,
    /// Output format: json | table (default: table on a terminal, json otherwise)
    #[arg(long = "format")] format: Option<String>,

    /// Follow stdin, scoring in the background until interrupted
    #[arg(long = "follow", default_value_t = false)] follow: bool,
}

fn main() -> anyhow::Result<()> {
    init_logging();
    init_parallelism();
    let cli = Cli::parse();

    let input_files = if cli.input.is_empty() { vec!["-".to_string()] } else { cli.input.clone() };
    let reads_stdin = cli.follow || input_files.iter().any(|p| p == "-");

    let config = load_config(&cli)?;
    let oracle = build_oracle(&cli, reads_stdin)?;
    let pipeline = Pipeline::new(&config).context("invalid configuration")?;

    if cli.follow {
        return run_follow(pipeline, oracle, &cli);
    }

    let mut pipeline = pipeline;
    for p in &input_files {
        if p == "-" {
            pipeline.feed(io::stdin().lock())?;
        } else {
            let f = File::open(p).with_context(|| format!("cannot open {p}"))?;
            pipeline.feed(BufReader::new(f)).with_context(|| format!("cannot read {p}"))?;
        }
    }
    pipeline.finish();

    let engine = Arc::clone(pipeline.engine());
    if let Some(depth) = cli.reconstruct {
        let r = engine.reconstruct(depth);
        info!(depth, rebuilt = r.rebuilt, clusters = r.clusters, "reconstruction requested on the command line");
    }
    let report = engine.score_pass(oracle.as_ref());
    print_output(&engine, &report, &cli)
}

fn load_config(cli: &Cli) -> anyhow::Result<Config> {
    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(h) = &cli.headers {
        config.input.format = LineFormat::Headers(h.clone());
    }
    if let Some(r) = &cli.regex {
        config.input.format = LineFormat::Regex(r.clone());
    }
    if let Some(g) = &cli.grok {
        config.input.format = LineFormat::Grok(g.clone());
    }
    if let Some(e) = &cli.environment {
        config.input.environment = e.clone();
    }
    if let Some(n) = cli.sample_size {
        config.routing.sample_size = n;
    }
    if let Some(t) = cli.similarity_threshold {
        config.matching.similarity_threshold = t;
    }
    if let Some(q) = cli.query_threshold {
        config.scoring.query_threshold = q;
    }
    if let Some(s) = cli.interval_secs {
        config.scoring.interval_ms = s.saturating_mul(1_000);
    }
    match cli.scope.as_deref() {
        None => {}
        Some("active") => config.scoring.scope = ScoreScope::Active,
        Some("all") => config.scoring.scope = ScoreScope::All,
        Some(other) => bail!("unknown scope `{other}` (expected active | all)"),
    }
    config.validate()?;
    Ok(config)
}

fn build_oracle(cli: &Cli, reads_stdin: bool) -> anyhow::Result<Option<Arc<dyn Oracle>>> {
    match cli.oracle.as_str() {
        "none" => Ok(None),
        "console" => {
            if reads_stdin {
                bail!("the console oracle needs stdin for answers; pass log files instead of reading stdin");
            }
            let oracle: Arc<dyn Oracle> = Arc::new(ConsoleOracle::default());
            Ok(Some(oracle))
        }
        "command" => {
            let line = cli.oracle_command.as_deref().unwrap_or_default();
            let Some(command) = CommandOracle::from_command_line(line) else {
                bail!("--oracle command requires --oracle-command");
            };
            let oracle: Arc<dyn Oracle> = Arc::new(command);
            Ok(Some(oracle))
        }
        other => bail!("unknown oracle `{other}` (expected none | console | command)"),
    }
}

fn run_follow(mut pipeline: Pipeline, oracle: Option<Arc<dyn Oracle>>, cli: &Cli) -> anyhow::Result<()> {
    let running = Arc::new(AtomicBool::new(true));
    {
        let r = running.clone();
        let _ = ctrlc::set_handler(move || { r.store(false, Ordering::SeqCst); });
    }
    let engine = Arc::clone(pipeline.engine());
    let scorer = spawn_scoring_loop(Arc::clone(&engine), oracle, running.clone())?;
    let interval = engine.scoring_interval().max(Duration::from_secs(1));

    let mut reader = io::stdin().lock();
    let mut buf = Vec::new();
    let mut last_emit = Instant::now();
    while running.load(Ordering::SeqCst) {
        match read_line_lossy(&mut reader, &mut buf) {
            Ok(Some(line)) => {
                let _ = pipeline.process_line(&line);
            }
            Ok(None) => std::thread::sleep(Duration::from_millis(200)),
            Err(e) => {
                warn!(error = %e, "stdin read failed");
                std::thread::sleep(Duration::from_millis(200));
            }
        }
        if last_emit.elapsed() >= interval {
            let s = engine.summary();
            eprintln!("[follow] lines={} clusters={} active={} anomalies={}", s.total_lines, s.clusters, s.active, s.anomalies);
            last_emit = Instant::now();
        }
    }
    pipeline.finish();
    let _ = scorer.join();
    print_output(&engine, &ScoringReport::default(), cli)
}

fn print_output(engine: &Engine, report: &ScoringReport, cli: &Cli) -> anyhow::Result<()> {
    let table = match cli.format.as_deref() {
        Some("table") => true,
        Some("json") => false,
        Some(other) => bail!("unknown format `{other}` (expected json | table)"),
        None => atty::is(atty::Stream::Stdout),
    };
    match cli.only.as_deref() {
        Some("clusters") => {
            let clusters = engine.clusters();
            if table { print_clusters_table(&clusters) } else { println!("{}", serde_json::to_string_pretty(&clusters)?) }
        }
        Some("records") => {
            let records = engine.records();
            if table { print_records_table(&records) } else { println!("{}", serde_json::to_string_pretty(&records)?) }
        }
        Some("nodes") => {
            let nodes = engine.nodes_at_depth(cli.depth);
            if table { print_nodes_table(&nodes) } else { println!("{}", serde_json::to_string_pretty(&nodes)?) }
        }
        Some("summary") => {
            let summary = engine.summary();
            if table { print_summary(&summary, report) } else { println!("{}", serde_json::to_string_pretty(&summary)?) }
        }
        Some(other) => bail!("unknown section `{other}` (expected clusters | records | nodes | summary)"),
        None => {
            let summary = engine.summary();
            let clusters = engine.clusters();
            if table {
                print_summary(&summary, report);
                println!();
                print_clusters_table(&clusters);
            } else {
                let out = serde_json::json!({ "summary": summary, "scoring": report, "clusters": clusters });
                println!("{}", serde_json::to_string_pretty(&out)?);
            }
        }
    }
    Ok(())
}

fn print_summary(s: &Summary, r: &ScoringReport) {
    println!("lines={} parse_errors={} clusters={} nodes={} active={}", s.total_lines, s.parse_errors, s.clusters, s.nodes, s.active);
    println!("anomalies={} normals={} unknown={}", s.anomalies, s.normals, s.unknown);
    println!("scored={} queried={} decided={} failed={}", r.scored, r.queried, r.decided, r.failed);
}

fn print_clusters_table(clusters: &[ClusterView]) {
    let mut sorted: Vec<&ClusterView> = clusters.iter().collect();
    sorted.sort_by(|a, b| b.size.cmp(&a.size).then_with(|| a.template.cmp(&b.template)));
    println!("{:<6} {:<6} {:<8} {:<8} {:<6} {}", "Id", "Size", "Rarity", "Decision", "P", "Template");
    for c in sorted {
        let rarity = c.rarity.map(|r| format!("{r:.4}")).unwrap_or_else(|| "-".into());
        let p = c.feedback.p.map(|p| format!("{p:.2}")).unwrap_or_else(|| "-".into());
        println!("{:<6} {:<6} {:<8} {:<8} {:<6} {}", c.id.to_string(), c.size, rarity, c.feedback.decision.label(), p, c.template);
    }
}

fn print_records_table(records: &[RecordView]) {
    println!("{:<8} {:<6} {:<8} {}", "Record", "Cluster", "Decision", "Line");
    for r in records {
        println!("{:<8} {:<6} {:<8} {}", r.id, r.cluster_id.to_string(), r.decision.label(), r.line);
    }
}

fn print_nodes_table(nodes: &[NodeView]) {
    println!("{:<6} {:<18} {:<6} {:<8} {}", "Node", "Kind", "Leaf", "Clusters", "Name");
    for n in nodes {
        println!("{:<6} {:<18} {:<6} {:<8} {}", n.id.to_string(), n.kind.label(), n.is_leaf, n.clusters.len(), n.name);
    }
}
