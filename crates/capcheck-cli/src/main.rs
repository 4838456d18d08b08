//! capcheck command line
//!
//! Exit codes: 0 on a completed run or clean diff, 1 on a halted run or a
//! diff that needs review, 2 on infrastructure errors.

use anyhow::{Context, Result};
use capcheck_core::{
    ExternalRuntimeControl, HttpClientFactory, Orchestrator, OrchestratorConfig,
    ProcessRuntimeControl, RuntimeControl, VerifyMode,
};
use capcheck_diff::{AllowList, Comparator};
use capcheck_store::{
    read_document, write_atomic, BaselineManager, JsonFileStore, ProgressStats, ProgressStore,
};
use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

const EXIT_OK: i32 = 0;
const EXIT_REVIEW: i32 = 1;
const EXIT_INFRASTRUCTURE: i32 = 2;

/// Config file picked up from the working directory when `--config` is absent
const DEFAULT_CONFIG: &str = "capcheck.toml";

/// Progress document field that only carries scheduling state
const BATCH_NUMBER_FIELD: &str = "batch_number";

fn cli() -> Command {
    Command::new("capcheck")
        .version(capcheck_core::VERSION)
        .about("Exhaustive mutation testing of a runtime's reflected type capabilities")
        .subcommand_required(true)
        .arg(
            Arg::new("config")
                .long("config")
                .global(true)
                .value_parser(value_parser!(PathBuf))
                .help("Configuration file (defaults to ./capcheck.toml when present)"),
        )
        .arg(
            Arg::new("json-logs")
                .long("json-logs")
                .global(true)
                .action(ArgAction::SetTrue)
                .help("Emit logs as JSON lines"),
        )
        .arg(
            Arg::new("host")
                .long("host")
                .global(true)
                .help("Host the runtime instances listen on"),
        )
        .arg(
            Arg::new("base-port")
                .long("base-port")
                .global(true)
                .value_parser(value_parser!(u16))
                .help("Port of the first worker's runtime instance"),
        )
        .arg(
            Arg::new("store")
                .long("store")
                .global(true)
                .value_parser(value_parser!(PathBuf))
                .help("Progress store file"),
        )
        .subcommand(
            Command::new("run-batch")
                .about("Run pending batches against the runtime fleet")
                .arg(
                    Arg::new("size")
                        .required(true)
                        .value_parser(value_parser!(usize))
                        .help("Types per batch"),
                )
                .arg(
                    Arg::new("workers")
                        .long("workers")
                        .value_parser(value_parser!(usize))
                        .help("Number of workers (sized to the batch when omitted)"),
                )
                .arg(
                    Arg::new("types-per-worker")
                        .long("types-per-worker")
                        .value_parser(value_parser!(usize))
                        .help("Types assigned to each worker"),
                )
                .arg(
                    Arg::new("max-batches")
                        .long("max-batches")
                        .value_parser(value_parser!(usize))
                        .help("Stop after this many batches have advanced"),
                )
                .arg(
                    Arg::new("call-budget")
                        .long("call-budget")
                        .value_parser(value_parser!(usize))
                        .help("Remote calls each worker may make per dispatch"),
                )
                .arg(
                    Arg::new("read-back")
                        .long("read-back")
                        .action(ArgAction::SetTrue)
                        .help("Verify every mutation by reading the value back"),
                )
                .arg(
                    Arg::new("json")
                        .long("json")
                        .action(ArgAction::SetTrue)
                        .help("Print the run summary as JSON"),
                ),
        )
        .subcommand(
            Command::new("snapshot")
                .about("Fetch the capability snapshot and write it to a file")
                .arg(
                    Arg::new("out")
                        .value_parser(value_parser!(PathBuf))
                        .help("Output file (defaults to the configured snapshot path)"),
                ),
        )
        .subcommand(
            Command::new("promote-baseline")
                .about("Copy the progress store over the baseline, keeping an archive copy"),
        )
        .subcommand(
            Command::new("compare")
                .about("Compare two snapshots or progress documents")
                .arg(
                    Arg::new("baseline")
                        .required(true)
                        .value_parser(value_parser!(PathBuf)),
                )
                .arg(
                    Arg::new("current")
                        .required(true)
                        .value_parser(value_parser!(PathBuf)),
                )
                .arg(
                    Arg::new("allow-list")
                        .long("allow-list")
                        .value_parser(value_parser!(PathBuf))
                        .help("Extra expected-change rules (.toml or .json)"),
                )
                .arg(
                    Arg::new("progress")
                        .long("progress")
                        .action(ArgAction::SetTrue)
                        .help("Inputs are progress documents; ignore scheduling fields"),
                )
                .arg(
                    Arg::new("ignore")
                        .long("ignore")
                        .action(ArgAction::Append)
                        .help("Object key to skip at any depth"),
                )
                .arg(
                    Arg::new("json")
                        .long("json")
                        .action(ArgAction::SetTrue)
                        .help("Output as JSON"),
                ),
        )
        .subcommand(
            Command::new("stats")
                .about("Summarize a progress document")
                .arg(
                    Arg::new("file")
                        .value_parser(value_parser!(PathBuf))
                        .help("Progress document (defaults to the store)"),
                )
                .arg(
                    Arg::new("json")
                        .long("json")
                        .action(ArgAction::SetTrue)
                        .help("Output as JSON"),
                ),
        )
        .subcommand(
            Command::new("reset")
                .about("Return records to untested")
                .arg(
                    Arg::new("failed-only")
                        .long("failed-only")
                        .action(ArgAction::SetTrue)
                        .help("Only reset records carrying a failure"),
                ),
        )
}

#[tokio::main]
async fn main() {
    let matches = cli().get_matches();
    init_logging(matches.get_flag("json-logs"));

    let code = match execute(&matches).await {
        Ok(code) => code,
        Err(e) => {
            tracing::error!("{e:#}");
            eprintln!("error: {e:#}");
            EXIT_INFRASTRUCTURE
        }
    };
    std::process::exit(code);
}

/// Logs go to stderr so JSON output on stdout stays parseable
fn init_logging(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(fmt::layer().compact().with_writer(std::io::stderr))
            .init();
    }
}

async fn execute(matches: &ArgMatches) -> Result<i32> {
    let config = load_config(matches)?;
    match matches.subcommand() {
        Some(("run-batch", args)) => run_batch(config, args).await,
        Some(("snapshot", args)) => snapshot(config, args).await,
        Some(("promote-baseline", _)) => promote_baseline(&config),
        Some(("compare", args)) => compare(args),
        Some(("stats", args)) => stats(&config, args),
        Some(("reset", args)) => reset(&config, args),
        _ => Ok(EXIT_OK),
    }
}

fn load_config(matches: &ArgMatches) -> Result<OrchestratorConfig> {
    let mut config = match matches.get_one::<PathBuf>("config") {
        Some(path) => OrchestratorConfig::load(path)?,
        None if Path::new(DEFAULT_CONFIG).exists() => {
            OrchestratorConfig::load(Path::new(DEFAULT_CONFIG))?
        }
        None => OrchestratorConfig::new(),
    };
    if let Some(host) = matches.get_one::<String>("host") {
        config.host.clone_from(host);
    }
    if let Some(port) = matches.get_one::<u16>("base-port") {
        config.base_port = *port;
    }
    if let Some(store) = matches.get_one::<PathBuf>("store") {
        config.store_path.clone_from(store);
    }
    Ok(config)
}

fn build_orchestrator(config: OrchestratorConfig) -> Result<Orchestrator> {
    let control: Arc<dyn RuntimeControl> = if config.runtime.program.is_some() {
        Arc::new(ProcessRuntimeControl::new(
            config.runtime.clone(),
            config.host.clone(),
        ))
    } else {
        Arc::new(ExternalRuntimeControl::new(config.host.clone()))
    };
    let store = Arc::new(JsonFileStore::new(&config.store_path));
    let clients = Arc::new(HttpClientFactory::new(config.host.clone()));
    Ok(Orchestrator::new(config, store, clients, control)?)
}

async fn run_batch(mut config: OrchestratorConfig, args: &ArgMatches) -> Result<i32> {
    config = config.with_batch_size(
        args.get_one::<usize>("size")
            .copied()
            .context("batch size is required")?,
    );
    if let Some(types_per_worker) = args.get_one::<usize>("types-per-worker") {
        config = config.with_types_per_worker(*types_per_worker);
    }
    match args.get_one::<usize>("workers") {
        Some(workers) => config = config.with_workers(*workers),
        None if config.worker_count * config.types_per_worker < config.batch_size => {
            config = config.fit_workers_to_batch();
            tracing::info!("Sized fleet to {} workers", config.worker_count);
        }
        None => {}
    }
    if let Some(calls) = args.get_one::<usize>("call-budget") {
        config = config.with_call_budget(*calls);
    }
    if args.get_flag("read-back") {
        config = config.with_verify(VerifyMode::ReadBack);
    }
    let max_batches = args.get_one::<usize>("max-batches").copied();

    let mut orchestrator = build_orchestrator(config)?;
    let summary = orchestrator.run(max_batches).await?;

    if args.get_flag("json") {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        println!("{summary}");
    }
    Ok(if summary.status.is_success() {
        EXIT_OK
    } else {
        EXIT_REVIEW
    })
}

async fn snapshot(config: OrchestratorConfig, args: &ArgMatches) -> Result<i32> {
    let out = args
        .get_one::<PathBuf>("out")
        .cloned()
        .unwrap_or_else(|| config.snapshot_path.clone());
    let orchestrator = build_orchestrator(config)?;
    let snapshot = orchestrator.fetch_snapshot().await?;
    write_atomic(&out, &serde_json::to_vec_pretty(&snapshot)?)?;
    println!("Wrote {} types to {}", snapshot.len(), out.display());
    Ok(EXIT_OK)
}

fn promote_baseline(config: &OrchestratorConfig) -> Result<i32> {
    let manager = BaselineManager::new(&config.baseline_path, &config.archive_dir);
    let promotion = manager.promote(&config.store_path, chrono::Utc::now())?;
    println!(
        "Promoted {} types to {} (archived as {})",
        promotion.types,
        promotion.baseline.display(),
        promotion.archive.display()
    );
    Ok(EXIT_OK)
}

fn compare(args: &ArgMatches) -> Result<i32> {
    let baseline_path = args
        .get_one::<PathBuf>("baseline")
        .context("baseline path is required")?;
    let current_path = args
        .get_one::<PathBuf>("current")
        .context("current path is required")?;

    let mut allow = AllowList::builtin()?;
    if let Some(path) = args.get_one::<PathBuf>("allow-list") {
        allow.extend(load_allow_list(path)?.rules().cloned())?;
    }
    let mut comparator = Comparator::new(allow);
    if args.get_flag("progress") {
        comparator = comparator.ignore_field(BATCH_NUMBER_FIELD);
    }
    for field in args.get_many::<String>("ignore").into_iter().flatten() {
        comparator = comparator.ignore_field(field.as_str());
    }

    let baseline = std::fs::read(baseline_path)
        .with_context(|| format!("reading {}", baseline_path.display()))?;
    let current = std::fs::read(current_path)
        .with_context(|| format!("reading {}", current_path.display()))?;
    let report = comparator.compare_bytes(&baseline, &current)?;

    if args.get_flag("json") {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("{report}");
    }
    Ok(if report.requires_review() {
        EXIT_REVIEW
    } else {
        EXIT_OK
    })
}

fn load_allow_list(path: &Path) -> Result<AllowList> {
    let input = std::fs::read_to_string(path)
        .with_context(|| format!("reading allow-list {}", path.display()))?;
    let list = if path.extension().is_some_and(|ext| ext == "json") {
        AllowList::from_json_str(&input)?
    } else {
        AllowList::from_toml_str(&input)?
    };
    tracing::info!("Loaded {} rules from {}", list.len(), path.display());
    Ok(list)
}

fn stats(config: &OrchestratorConfig, args: &ArgMatches) -> Result<i32> {
    let path = args
        .get_one::<PathBuf>("file")
        .unwrap_or(&config.store_path);
    let document = read_document(path)?;
    let stats = ProgressStats::compute(&document, &config.excluded());
    if args.get_flag("json") {
        println!("{}", serde_json::to_string_pretty(&stats)?);
    } else {
        println!("{stats}");
    }
    Ok(EXIT_OK)
}

fn reset(config: &OrchestratorConfig, args: &ArgMatches) -> Result<i32> {
    let failed_only = args.get_flag("failed-only");
    let store = JsonFileStore::new(&config.store_path);
    let mut document = store.load()?;
    let count = document.reset(failed_only);
    document.clear_batch_numbers();
    store.save(&document)?;
    println!(
        "Reset {count} {}types in {}",
        if failed_only { "failed " } else { "" },
        store.location()
    );
    Ok(EXIT_OK)
}
