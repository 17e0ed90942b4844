//! Faultline command-line interface
//!
//! ```text
//! faultline test  [--memory | --compose-file FILE] [--nemesis partition,kill] ...
//! faultline check <NAME> [RUN]
//! faultline serve [--addr 127.0.0.1:8080]
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use clap::{Args, Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;

use faultline::api::results_http;
use faultline::client::{Client, Database, HttpClient, NoopDatabase};
use faultline::config::FaultKind;
use faultline::nemesis::docker::{
    DockerCluster, DockerNemesis, DEFAULT_CONTAINER_PREFIX, DEFAULT_READY_PATH,
};
use faultline::nemesis::{Nemesis, NoopNemesis};
use faultline::testing::{MemoryCluster, Replication};
use faultline::{Checker, Model, RunStore, Test, TestConfig, Verdict};

/// Fault-injection testing for distributed stores
#[derive(Parser, Debug)]
#[command(name = "faultline")]
#[command(version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a test and check its history
    Test(TestArgs),

    /// Re-check a stored run without re-running it
    Check {
        /// Test name
        name: String,
        /// Run directory name; defaults to the latest run
        run: Option<String>,
        /// Root of the run store
        #[arg(long, default_value = "store")]
        store: PathBuf,
        /// Override the model the run was configured with
        #[arg(long, value_enum)]
        model: Option<ModelArg>,
        /// Per-key search budget
        #[arg(long)]
        max_states: Option<usize>,
        /// Overwrite the stored verdict with the new one
        #[arg(long)]
        write: bool,
    },

    /// Browse stored runs as JSON over HTTP
    Serve {
        #[arg(long, default_value = "store")]
        store: PathBuf,
        #[arg(long, default_value = "127.0.0.1:8080")]
        addr: SocketAddr,
    },
}

#[derive(Args, Debug)]
struct TestArgs {
    /// JSON configuration file; flags override its values
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    name: Option<String>,
    /// Comma-separated node addresses (host:port)
    #[arg(long, value_delimiter = ',')]
    nodes: Option<Vec<String>>,
    #[arg(long)]
    concurrency: Option<usize>,
    /// Active phase length in seconds
    #[arg(long)]
    time_limit: Option<u64>,
    /// Per-operation timeout in milliseconds
    #[arg(long)]
    op_timeout: Option<u64>,
    #[arg(long, value_enum)]
    model: Option<ModelArg>,
    /// Comma-separated keys
    #[arg(long, value_delimiter = ',')]
    keys: Option<Vec<String>>,
    /// Comma-separated fault kinds: partition, kill, clock-skew
    #[arg(long, value_delimiter = ',')]
    nemesis: Option<Vec<FaultKind>>,
    /// Seconds between a fault and its heal
    #[arg(long)]
    nemesis_interval: Option<u64>,
    /// Stop after this many client operations
    #[arg(long)]
    op_limit: Option<u64>,
    /// Per-key search budget
    #[arg(long)]
    max_states: Option<usize>,
    /// Root of the run store
    #[arg(long)]
    store: Option<PathBuf>,
    /// Bring up a Docker Compose cluster and inject faults into it
    #[arg(long, conflicts_with = "memory")]
    compose_file: Option<PathBuf>,
    /// With --compose-file: node i runs in container <prefix><i>
    #[arg(long, default_value = DEFAULT_CONTAINER_PREFIX)]
    container_prefix: String,
    /// With --compose-file: path every node must answer before the run starts
    #[arg(long, default_value = DEFAULT_READY_PATH)]
    ready_path: String,
    /// With --compose-file: seconds to wait for the cluster to become ready
    #[arg(long, default_value_t = 30)]
    ready_timeout: u64,
    /// Test the built-in in-memory store
    #[arg(long)]
    memory: bool,
    /// With --memory: let partitioned minorities keep accepting writes
    #[arg(long, requires = "memory")]
    split_brain: bool,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum ModelArg {
    Register,
    Set,
    Counter,
}

impl From<ModelArg> for Model {
    fn from(arg: ModelArg) -> Self {
        match arg {
            ModelArg::Register => Model::Register { initial: None },
            ModelArg::Set => Model::Set,
            ModelArg::Counter => Model::Counter,
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let result = match cli.command {
        Command::Test(args) => run_test(args).await,
        Command::Check {
            name,
            run,
            store,
            model,
            max_states,
            write,
        } => check_run(&store, &name, run.as_deref(), model, max_states, write),
        Command::Serve { store, addr } => serve(store, addr).await,
    };

    match result {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::from(1),
        Err(e) => {
            eprintln!("error: {:#}", e);
            ExitCode::from(2)
        }
    }
}

fn build_config(args: &TestArgs) -> anyhow::Result<TestConfig> {
    let mut config = match &args.config {
        Some(path) => TestConfig::load(path)?,
        None => TestConfig::default(),
    };
    if let Some(name) = &args.name {
        config = config.with_name(name.clone());
    }
    if let Some(nodes) = &args.nodes {
        config = config.with_nodes(nodes.clone());
    }
    if let Some(n) = args.concurrency {
        config = config.with_concurrency(n);
    }
    if let Some(secs) = args.time_limit {
        config = config.with_time_limit(Duration::from_secs(secs));
    }
    if let Some(ms) = args.op_timeout {
        config = config.with_op_timeout(Duration::from_millis(ms));
    }
    if let Some(model) = args.model {
        config = config.with_model(model.into());
    }
    if let Some(keys) = &args.keys {
        config = config.with_keys(keys.clone());
    }
    if let Some(n) = args.op_limit {
        config = config.with_op_limit(n);
    }
    if let Some(n) = args.max_states {
        config = config.with_max_states(n);
    }
    if let Some(dir) = &args.store {
        config = config.with_store_dir(dir.clone());
    }
    Ok(config)
}

/// What a `test` run talks to
struct Target {
    client: Arc<dyn Client>,
    database: Arc<dyn Database>,
    nemesis: Box<dyn Nemesis>,
}

/// Fault schedule for `nodes` from the requested kinds
fn schedule(config: TestConfig, kinds: &[FaultKind], interval: Option<u64>) -> TestConfig {
    if kinds.is_empty() {
        return config;
    }
    let faults = kinds.iter().filter_map(|kind| kind.instantiate(&config.nodes)).collect();
    let interval = interval.map_or(config.nemesis.interval, Duration::from_secs);
    config.with_faults(faults, interval)
}

async fn run_test(args: TestArgs) -> anyhow::Result<bool> {
    let mut config = build_config(&args)?;
    let kinds = args.nemesis.clone().unwrap_or_default();

    let target = if args.memory {
        let replication = if args.split_brain {
            Replication::SplitBrain
        } else {
            Replication::Quorum
        };
        let cluster = MemoryCluster::new(config.nodes.len(), config.model.clone(), replication);
        config = config.with_nodes(cluster.nodes());
        Target {
            client: Arc::new(cluster.clone()),
            database: Arc::new(cluster.clone()),
            nemesis: Box::new(cluster.nemesis()),
        }
    } else if let Some(compose) = &args.compose_file {
        let cluster = DockerCluster::new(compose.display().to_string(), config.nodes.len())
            .with_ready_check(args.ready_path.clone(), Duration::from_secs(args.ready_timeout));
        config = config.with_nodes(cluster.node_addrs());
        Target {
            client: Arc::new(HttpClient::new(config.nodes.clone(), config.op_timeout)),
            database: Arc::new(cluster),
            nemesis: Box::new(DockerNemesis::new(args.container_prefix.clone())),
        }
    } else {
        if !kinds.is_empty() {
            tracing::warn!("no control plane for faults without --memory or --compose-file, faults will be no-ops");
        }
        Target {
            client: Arc::new(HttpClient::new(config.nodes.clone(), config.op_timeout)),
            database: Arc::new(NoopDatabase),
            nemesis: Box::new(NoopNemesis),
        }
    };
    let config = schedule(config, &kinds, args.nemesis_interval);

    let report = Test::new(config.clone(), target.client)
        .with_database(target.database)
        .with_nemesis(target.nemesis)
        .with_interrupts()
        .run()
        .await?;

    let store = RunStore::new(&config.store_dir);
    let dir = store
        .save(&config, &report.history, &report.verdict)
        .context("storing run")?;

    print_verdict(&report.verdict);
    println!("run stored in {} ({:.1?})", dir.display(), report.duration);
    Ok(report.passed())
}

fn check_run(
    root: &std::path::Path,
    name: &str,
    run: Option<&str>,
    model: Option<ModelArg>,
    max_states: Option<usize>,
    write: bool,
) -> anyhow::Result<bool> {
    let store = RunStore::new(root);
    let dir = store.resolve(name, run)?;
    let config = store.load_config(&dir)?;
    let history = store.load_history(&dir)?;
    let previous = store.load_verdict(&dir).ok();

    let mut checker_config = config.checker.clone();
    if let Some(n) = max_states {
        checker_config.max_states = n;
    }
    let model = model.map_or(config.model.clone(), Model::from);

    let verdict = Checker::new(model).with_config(checker_config).check(&history)?;
    // Harness records belong to the run, not to the check
    let verdict = match previous {
        Some(previous) => verdict.with_harness(previous.harness_faults, previous.harness_warnings),
        None => verdict,
    };
    if write {
        store.save_verdict(&dir, &verdict)?;
    }

    print_verdict(&verdict);
    Ok(verdict.passed())
}

async fn serve(root: PathBuf, addr: SocketAddr) -> anyhow::Result<bool> {
    results_http::serve(RunStore::new(root), addr)
        .await
        .context("results server failed")?;
    Ok(true)
}

fn print_verdict(verdict: &Verdict) {
    let stats = &verdict.stats;
    println!("validity: {:?}", verdict.validity);
    println!(
        "events: {} (ok {}, fail {}, info {}, faults {})",
        stats.events, stats.ok, stats.fail, stats.info, stats.faults
    );
    for key in &verdict.keys {
        println!("  key {}: {:?} ({} ops, {} states)", key.key, key.validity, key.ops, key.states);
    }
    for anomaly in &verdict.anomalies {
        println!("anomaly on {} ({:?}): {}", anomaly.key, anomaly.kind, anomaly.explanation);
        for op in &anomaly.ops {
            println!("    {}", op);
        }
        for fault in &anomaly.faults {
            println!("    during {}", fault);
        }
    }
    for fault in &verdict.harness_faults {
        println!("harness fault: {:?}", fault);
    }
    for warning in &verdict.harness_warnings {
        println!("harness warning: {:?}", warning);
    }
}
