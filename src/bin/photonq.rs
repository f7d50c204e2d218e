//! PhotonDB query core command-line driver
//!
//! Loads JSON documents into in-memory indexes and runs scan plans over
//! them: plain range scans, dynamic IN lists, parallel branches and
//! aggregates, either computed by group operators or pushed into the index.
//!
//! # Examples
//!
//! ```bash
//! # Scan documents whose `v` is 2, 3 or 7
//! photonq scan --input docs.json --keys v --in '[7, 2, 3, 2]'
//!
//! # MAX(v) over four parallel branches, with an execution profile
//! photonq scan --input docs.json --keys v --union 4 --aggregate max --profile
//!
//! # COUNT(v) computed by two indexes and merged
//! photonq scan --input docs.json --keys v --union 2 --aggregate count --pushdown
//!
//! # Effective configuration
//! photonq config --config photonq.toml
//! ```

use anyhow::{bail, Context as _};
use clap::{Args, Parser, Subcommand};
use photon_query::algebra::{new_aggregate, AggregateId, AggregateOp, Expression};
use photon_query::datastore::{Inclusion, IndexAggregate, IndexProjection, MemoryIndex};
use photon_query::execution::{run_plan, Context};
use photon_query::metrics::{gather_metrics, init_metrics};
use photon_query::plan::{
    GroupPhase, GroupPlan, IndexGroupAggregatesPlan, IndexScanPlan, KeyspaceTerm, PlanNode,
    PlanRange, PlanSpan, UnionAllPlan,
};
use photon_query::{AnnotatedValue, ExecConfig, Value};
use std::collections::HashMap;
use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// PhotonDB query execution core
#[derive(Parser, Debug)]
#[command(name = "photonq")]
#[command(version = photon_query::VERSION)]
#[command(about = "Run index scan plans over JSON documents", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// TOML configuration file; `PHOTONQ_*` variables apply when absent
    #[arg(long, global = true, env = "PHOTONQ_CONFIG")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "warn", env = "RUST_LOG")]
    log_level: String,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,

    /// Disable colored output
    #[arg(long, global = true)]
    no_color: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Scan an in-memory index built from JSON documents
    Scan(ScanArgs),

    /// Print the effective configuration
    Config,
}

#[derive(Args, Debug)]
struct ScanArgs {
    /// JSON array of documents, `-` for stdin
    #[arg(short, long, default_value = "-")]
    input: String,

    /// Comma separated index key paths, relative to the document
    #[arg(short, long, default_value = "v")]
    keys: String,

    /// Keyspace alias
    #[arg(long, default_value = "d")]
    alias: String,

    /// Inclusive lower bound on the first key, as JSON
    #[arg(long)]
    low: Option<String>,

    /// Inclusive upper bound on the first key, as JSON
    #[arg(long)]
    high: Option<String>,

    /// JSON array; first key IN this list, expanded at run time
    #[arg(long = "in", conflicts_with_all = ["low", "high"])]
    in_list: Option<String>,

    /// Split documents round-robin across this many parallel scans
    #[arg(long, default_value = "1")]
    union: usize,

    /// Aggregate over the first key (count, max, min, sum)
    #[arg(short, long)]
    aggregate: Option<AggregateOp>,

    /// Let the index compute the aggregate
    #[arg(long, requires = "aggregate")]
    pushdown: bool,

    /// Scan in descending key order
    #[arg(long)]
    reverse: bool,

    /// Print the operator profile after the rows
    #[arg(long)]
    profile: bool,

    /// Print Prometheus metrics after the run
    #[arg(long)]
    metrics: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    setup_logging(&cli);
    init_metrics();

    let config = match &cli.config {
        Some(path) => ExecConfig::load(path)
            .with_context(|| format!("loading configuration from {}", path.display()))?,
        None => ExecConfig::from_env(),
    };
    debug!(?config, "Configuration loaded");

    match cli.command {
        Commands::Scan(args) => scan_command(config, args).await,
        Commands::Config => {
            print!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

fn setup_logging(cli: &Cli) {
    let log_level = cli
        .log_level
        .parse::<tracing::Level>()
        .unwrap_or(tracing::Level::WARN);
    let filter = EnvFilter::from_default_env().add_directive(log_level.into());

    if cli.json_logs {
        tracing_subscriber::registry()
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .with(filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(
                fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_ansi(!cli.no_color),
            )
            .with(filter)
            .init();
    }
}

async fn scan_command(config: ExecConfig, args: ScanArgs) -> anyhow::Result<()> {
    if args.union == 0 {
        bail!("--union must be at least 1");
    }

    let docs = read_documents(&args.input)?;
    let range_key: Vec<Expression> = args
        .keys
        .split(',')
        .map(str::trim)
        .filter(|k| !k.is_empty())
        .map(|k| Expression::path(&format!("{}.{}", args.alias, k)))
        .collect();
    if range_key.is_empty() {
        bail!("--keys names no index key");
    }

    let indexes = load_indexes(&docs, &args.alias, &range_key, args.union)?;
    info!(
        documents = docs.len(),
        indexes = indexes.len(),
        "Loaded in-memory indexes"
    );

    let mut named_args = HashMap::new();
    let span = match &args.in_list {
        Some(list) => {
            named_args.insert("list".to_string(), parse_json(list)?);
            PlanSpan::new(vec![PlanRange::dynamic_in(Expression::param("list"))])
        }
        None => {
            let low = args.low.as_deref().map(parse_json).transpose()?;
            let high = args.high.as_deref().map(parse_json).transpose()?;
            PlanSpan::new(vec![PlanRange::new(
                low.map(Expression::Constant),
                high.map(Expression::Constant),
                Inclusion::Both,
            )])
        }
    };

    let term = KeyspaceTerm::new("documents", args.alias.as_str());
    let first_key = range_key[0].clone();
    let aggregate = args
        .aggregate
        .map(|op| new_aggregate(op, Some(first_key.clone()), AggregateId(0)));

    let scans: Vec<PlanNode> = indexes
        .iter()
        .map(|index| -> PlanNode {
            let scan = IndexScanPlan::new(index.clone(), term.clone(), vec![span.clone()])
                .with_reverse(args.reverse);
            match (&aggregate, args.pushdown) {
                // The index returns a partial per branch, merged by the final group
                (Some(agg), true) => scan
                    .with_group_aggs(IndexGroupAggregatesPlan {
                        name: args.alias.clone(),
                        aggregates: vec![IndexAggregate {
                            operation: agg.op(),
                            entry_key_id: 0,
                            key_pos: Some(0),
                            expr: None,
                            distinct: false,
                        }],
                        depends_on_index_keys: vec![0],
                        partial: true,
                        ..Default::default()
                    })
                    .with_covers(vec![Expression::Aggregate(agg.clone())])
                    .with_projection(IndexProjection {
                        entry_keys: vec![0],
                        primary_key: false,
                    })
                    .into(),
                (Some(agg), false) => GroupPlan::new(GroupPhase::Initial, scan.with_index_covers().into())
                    .with_aggregates(vec![agg.clone()])
                    .into(),
                (None, _) => scan.with_index_covers().into(),
            }
        })
        .collect();
    let root = if scans.len() == 1 {
        scans.into_iter().next().context("no scan built")?
    } else {
        UnionAllPlan::new(scans).into()
    };
    let plan: PlanNode = match &aggregate {
        Some(agg) => GroupPlan::new(GroupPhase::Final, root)
            .with_aggregates(vec![agg.clone()])
            .into(),
        None => root,
    };

    let ctx = Arc::new(Context::new(config).with_named_args(named_args));
    let result = run_plan(&plan, ctx.clone()).await;

    for row in &result.rows {
        let out = match &aggregate {
            Some(agg) => {
                let mut out = serde_json::Map::new();
                out.insert(agg.text(), serde_json::Value::from(agg.evaluate(row)?));
                serde_json::Value::Object(out)
            }
            None => row_json(row),
        };
        println!("{}", out);
    }
    if args.profile {
        println!("{}", serde_json::to_string_pretty(&result.profile)?);
    }
    if args.metrics {
        print!("{}", gather_metrics());
    }

    if !result.success {
        for err in &result.errors {
            eprintln!("error: {}", err);
        }
        bail!("query {} failed", ctx.request_id());
    }
    Ok(())
}

fn read_documents(input: &str) -> anyhow::Result<Vec<Value>> {
    let text = if input == "-" {
        let mut buf = String::new();
        std::io::stdin().read_to_string(&mut buf)?;
        buf
    } else {
        std::fs::read_to_string(input).with_context(|| format!("reading {}", input))?
    };
    match serde_json::from_str::<serde_json::Value>(&text)? {
        serde_json::Value::Array(docs) => Ok(docs.into_iter().map(Value::from).collect()),
        _ => bail!("expected a JSON array of documents"),
    }
}

fn parse_json(s: &str) -> anyhow::Result<Value> {
    let json: serde_json::Value =
        serde_json::from_str(s).with_context(|| format!("invalid JSON: {}", s))?;
    Ok(Value::from(json))
}

/// Index every document under its `id` field, or its position when it has
/// none.
fn load_indexes(
    docs: &[Value],
    alias: &str,
    range_key: &[Expression],
    count: usize,
) -> anyhow::Result<Vec<Arc<MemoryIndex>>> {
    let indexes: Vec<MemoryIndex> = (0..count)
        .map(|i| MemoryIndex::new(&format!("docs_{}", i), "documents", range_key.to_vec()))
        .collect();
    let no_args: HashMap<String, Value> = HashMap::new();

    for (pos, doc) in docs.iter().enumerate() {
        let mut row = AnnotatedValue::default();
        row.set_field(alias, doc.clone())?;
        let key = range_key
            .iter()
            .map(|expr| expr.evaluate(&row, &no_args))
            .collect::<photon_query::error::Result<Vec<_>>>()?;
        let id = match doc.field("id").0 {
            Value::String(s) => s,
            Value::Missing => format!("{:08}", pos),
            other => other.to_string(),
        };
        indexes[pos % count].insert(key, id);
    }

    Ok(indexes.into_iter().map(Arc::new).collect())
}

fn row_json(row: &AnnotatedValue) -> serde_json::Value {
    let covers: serde_json::Map<String, serde_json::Value> = row
        .covers()
        .iter()
        .map(|(k, v)| (k.clone(), serde_json::Value::from(v.clone())))
        .collect();
    serde_json::json!({
        "id": serde_json::Value::from(row.meta_id()),
        "covers": covers,
    })
}
