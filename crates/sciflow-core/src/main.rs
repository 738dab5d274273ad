//! `sciflow` command-line entry point

use anyhow::{bail, Context, Result};
use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use sciflow_core::{Dataset, FlowConfig, FlowMode, FlowRequest, HttpGenerator, ScientificFlow};
use sciflow_memory::{JsonFileStore, WorkingMemory};
use sciflow_sandbox::{prune_orphans, DockerCliBackend, SandboxBackend, SandboxPool};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

fn cli() -> Command {
    Command::new("sciflow")
        .version(sciflow_core::VERSION)
        .about("Sandboxed, self-correcting data analysis from natural-language requests")
        .subcommand_required(true)
        .arg(
            Arg::new("config")
                .long("config")
                .global(true)
                .env("SCIFLOW_CONFIG")
                .value_parser(value_parser!(PathBuf))
                .help("TOML configuration file"),
        )
        .arg(
            Arg::new("log-json")
                .long("log-json")
                .global(true)
                .action(ArgAction::SetTrue)
                .help("Emit logs as JSON"),
        )
        .subcommand(
            Command::new("run")
                .about("Plan, generate and execute an analysis")
                .arg(
                    Arg::new("data")
                        .long("data")
                        .required(true)
                        .value_parser(value_parser!(PathBuf))
                        .help("CSV dataset with a header row"),
                )
                .arg(
                    Arg::new("mode")
                        .long("mode")
                        .default_value("fast")
                        .value_parser(["planning", "fast"])
                        .help("Stop after planning, or plan and execute"),
                )
                .arg(
                    Arg::new("confirmed-plan")
                        .long("confirmed-plan")
                        .action(ArgAction::SetTrue)
                        .help("The instruction is an already-approved plan"),
                )
                .arg(
                    Arg::new("json")
                        .long("json")
                        .action(ArgAction::SetTrue)
                        .help("Print the full response as JSON"),
                )
                .arg(
                    Arg::new("image-out")
                        .long("image-out")
                        .value_parser(value_parser!(PathBuf))
                        .help("Write a produced figure to this PNG file"),
                )
                .arg(
                    Arg::new("instruction")
                        .required(true)
                        .num_args(1..)
                        .help("What to analyze"),
                ),
        )
        .subcommand(Command::new("prune").about("Remove sandboxes left behind by a crashed run"))
        .subcommand(
            Command::new("memory")
                .about("Inspect working memory")
                .subcommand_required(true)
                .subcommand(
                    Command::new("search")
                        .about("Past interactions relevant to a query")
                        .arg(Arg::new("query").required(true).num_args(1..))
                        .arg(
                            Arg::new("limit")
                                .long("limit")
                                .default_value("5")
                                .value_parser(value_parser!(usize)),
                        ),
                ),
        )
        .subcommand(Command::new("config").about("Print the effective configuration as TOML"))
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn joined(args: &ArgMatches, id: &str) -> String {
    args.get_many::<String>(id)
        .map(|v| v.cloned().collect::<Vec<_>>().join(" "))
        .unwrap_or_default()
}

async fn open_memory(config: &FlowConfig) -> Result<WorkingMemory> {
    let store = JsonFileStore::open(&config.memory_path)
        .await
        .with_context(|| format!("opening memory file {}", config.memory_path.display()))?;
    Ok(WorkingMemory::open(Arc::new(store))
        .await
        .context("loading working memory")?
        .with_context_limit(config.memory_context_limit))
}

async fn run(config: FlowConfig, args: &ArgMatches) -> Result<()> {
    let data = args
        .get_one::<PathBuf>("data")
        .context("--data is required")?;
    let mode: FlowMode = args
        .get_one::<String>("mode")
        .map_or("fast", String::as_str)
        .parse()?;
    let instruction = joined(args, "instruction");
    if instruction.trim().is_empty() {
        bail!("instruction must not be empty");
    }

    let file = std::fs::File::open(data).with_context(|| format!("opening {}", data.display()))?;
    let dataset = Dataset::from_csv_reader(file).with_context(|| format!("parsing {}", data.display()))?;

    let backend = Arc::new(DockerCliBackend::new(config.sandbox.image.clone()));
    let pool = SandboxPool::initialize(backend, config.sandbox.pool_config()?).await;
    let memory = Arc::new(open_memory(&config).await?);
    let coder = Arc::new(HttpGenerator::new(config.model.clone(), config.generation_timeout())?);
    let flow = ScientificFlow::new(config, coder, pool.clone(), memory);

    let request = FlowRequest::new(instruction, Arc::new(dataset))
        .with_mode(mode)
        .confirmed(args.get_flag("confirmed-plan"));

    let token = CancellationToken::new();
    let outcome = tokio::select! {
        res = flow.run_cancellable(request, &token) => res,
        _ = tokio::signal::ctrl_c() => {
            token.cancel();
            Err(sciflow_core::FlowError::Cancelled)
        }
    };
    pool.shutdown().await;
    let response = outcome?;

    if let (Some(path), Some(bytes)) = (args.get_one::<PathBuf>("image-out"), response.image_bytes()?) {
        std::fs::write(path, bytes).with_context(|| format!("writing {}", path.display()))?;
        tracing::info!(path = %path.display(), "figure written");
    }

    if args.get_flag("json") {
        println!("{}", serde_json::to_string_pretty(&response)?);
        return Ok(());
    }
    if let Some(thought) = &response.thought {
        println!("Thought:\n{thought}\n");
    }
    println!("Status: {}\n", response.status);
    println!("{}", response.result);
    if !response.code.is_empty() {
        println!("\nCode:\n{}", response.code);
    }
    Ok(())
}

async fn prune(config: &FlowConfig) -> Result<()> {
    let backend = DockerCliBackend::new(config.sandbox.image.clone());
    backend.ping().await.context("sandbox backend unreachable")?;
    let label = config.sandbox.pool_config()?.owner_label;
    let removed = prune_orphans(&backend, &label).await?;
    println!("Removed {removed} orphaned sandbox(es) labeled {label}");
    Ok(())
}

async fn memory_search(config: &FlowConfig, args: &ArgMatches) -> Result<()> {
    let memory = open_memory(config).await?;
    let limit = args.get_one::<usize>("limit").copied().unwrap_or(5);
    let hits = memory.search(&joined(args, "query"), limit).await;
    if hits.is_empty() {
        println!("No relevant interactions.");
    }
    for entry in hits {
        println!("[{}] {}", entry.timestamp.to_rfc3339(), entry.instruction);
        println!("  {}", entry.key_finding(sciflow_memory::working::KEY_FINDING_CHARS));
    }
    Ok(())
}

fn load_config(path: Option<&Path>) -> Result<FlowConfig> {
    Ok(FlowConfig::load(path)?)
}

#[tokio::main]
async fn main() -> Result<()> {
    let matches = cli().get_matches();
    init_tracing(matches.get_flag("log-json"));
    let config = load_config(matches.get_one::<PathBuf>("config").map(PathBuf::as_path))?;

    match matches.subcommand() {
        Some(("run", args)) => run(config, args).await,
        Some(("prune", _)) => prune(&config).await,
        Some(("memory", args)) => match args.subcommand() {
            Some(("search", args)) => memory_search(&config, args).await,
            _ => bail!("unknown memory command"),
        },
        Some(("config", _)) => {
            print!("{}", config.to_toml()?);
            Ok(())
        }
        _ => bail!("unknown command"),
    }
}
