//! idt - image description toolkit command line
//!
//! Thin driver over the idt-core library: resolves configuration, scans the input
//! directory, runs the stage sequencer and writes `records.json` for report
//! writers.
//!
//! Exit status: 0 when every item succeeded, 2 when the run completed with item
//! failures, 1 when the run aborted or could not start.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use idt_common::config::{load_config, resolve_geocode_cache_path, IdtConfig};
use idt_common::{EventBus, MetadataRecord, ProviderConfig, ProviderKind, RunContext, Stage, StatusEvent};
use idt_core::services::{FileScanner, GeocodeCache, NominatimGeocoder, ProviderGateway, StageSequencer};
use idt_core::{ImageTask, WorkflowRun};

#[derive(Parser, Debug)]
#[command(name = "idt")]
#[command(about = "Describe a directory of images with an AI vision model")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run (or resume) a description workflow
    Run(RunArgs),
}

#[derive(clap::Args, Debug)]
struct RunArgs {
    /// Directory of input images
    input_dir: PathBuf,

    /// Run output directory (ledger, status stream, records)
    #[arg(short, long)]
    output: PathBuf,

    /// TOML configuration file
    #[arg(short, long, env = "IDT_CONFIG")]
    config: Option<PathBuf>,

    /// Provider: ollama, openai or claude
    #[arg(long)]
    provider: Option<String>,

    /// Model name
    #[arg(long)]
    model: Option<String>,

    /// Prompt style (detailed, concise, narrative, artistic, technical, colorful, simple)
    #[arg(long)]
    prompt: Option<String>,

    /// Worker pool size per stage
    #[arg(short, long)]
    workers: Option<usize>,

    /// JSON sidecar mapping image paths to metadata records
    #[arg(long)]
    metadata: Option<PathBuf>,

    /// Shared geocode cache file
    #[arg(long)]
    geocode_cache: Option<PathBuf>,

    /// Skip the geocode stage
    #[arg(long)]
    no_geocode: bool,

    /// Re-run a stage for every item (repeatable)
    #[arg(long = "force", value_name = "STAGE")]
    force: Vec<String>,

    /// Run name (defaults to the input directory name)
    #[arg(long)]
    name: Option<String>,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "idt=info,idt_core=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let result = match cli.command {
        Command::Run(args) => run(args).await,
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::from(1)
        }
    }
}

async fn run(args: RunArgs) -> Result<ExitCode> {
    let config = build_config(&args)?;
    let workers = args.workers.unwrap_or(config.run.workers);

    let mut stages = config.run.stages.clone();
    if args.no_geocode || !config.geocode.enabled {
        stages.retain(|s| *s != Stage::Geocode);
    }
    let force = args
        .force
        .iter()
        .map(|s| s.parse::<Stage>().map_err(anyhow::Error::msg))
        .collect::<Result<Vec<_>>>()?;

    let name = args.name.clone().unwrap_or_else(|| {
        args.input_dir
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "run".to_string())
    });
    let run = WorkflowRun::new(name, stages)?.with_force_rerun(force);

    let ctx = RunContext::new(
        &args.output,
        resolve_geocode_cache_path(args.geocode_cache.as_deref(), config.geocode.cache_path.as_deref()),
    );

    let tasks = collect_tasks(&args.input_dir, args.metadata.as_deref())?;
    info!(input = %args.input_dir.display(), images = tasks.len(), "Input scanned");

    let gateway = Arc::new(ProviderGateway::new(config.provider.clone())?);

    let geocoder = if run.stages().contains(&Stage::Geocode) {
        let nominatim = NominatimGeocoder::new(config.geocode.endpoint.as_deref(), &config.geocode.user_agent)?;
        let cache = GeocodeCache::open(
            ctx.geocode_cache_path.clone(),
            Arc::new(nominatim),
            Duration::from_millis(config.geocode.min_interval_ms),
        )
        .await?;
        Some(cache)
    } else {
        None
    };

    let bus = EventBus::new(256);
    tokio::spawn(log_progress(bus.subscribe(), tasks.len()));

    let cancel = CancellationToken::new();
    tokio::spawn(cancel_on_interrupt(cancel.clone()));

    let records_path = ctx.records_path();
    let sequencer = StageSequencer::open(ctx, run, gateway, geocoder, Some(bus), workers).await?;
    let summary = sequencer.execute(tasks, &cancel).await?;

    let json = serde_json::to_vec_pretty(&summary.records).context("Failed to encode records")?;
    std::fs::write(&records_path, json)
        .with_context(|| format!("Failed to write {}", records_path.display()))?;

    info!(
        succeeded = summary.succeeded(),
        failed = summary.failed(),
        pending = summary.pending(),
        records = %records_path.display(),
        "Run finished"
    );

    Ok(ExitCode::from(summary.exit_code()))
}

/// TOML config (if any) with command-line overrides applied
fn build_config(args: &RunArgs) -> Result<IdtConfig> {
    let provider_kind = args
        .provider
        .as_deref()
        .map(str::parse::<ProviderKind>)
        .transpose()?;

    let mut config = match &args.config {
        Some(path) => load_config(path)?,
        None => {
            let model = args
                .model
                .clone()
                .context("--model is required when no --config file is given")?;
            IdtConfig {
                provider: ProviderConfig::new(provider_kind.unwrap_or(ProviderKind::Ollama), model),
                geocode: Default::default(),
                run: Default::default(),
            }
        }
    };

    if let Some(kind) = provider_kind {
        config.provider.provider = kind;
    }
    if let Some(model) = &args.model {
        config.provider.model = model.clone();
    }
    if let Some(prompt) = &args.prompt {
        config.provider.prompt_style = prompt.clone();
    }
    Ok(config)
}

/// Scan the input directory and attach sidecar metadata
fn collect_tasks(input_dir: &Path, metadata_path: Option<&Path>) -> Result<Vec<ImageTask>> {
    let metadata: HashMap<String, MetadataRecord> = match metadata_path {
        Some(path) => {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read metadata file {}", path.display()))?;
            serde_json::from_str(&content)
                .with_context(|| format!("Invalid metadata file {}", path.display()))?
        }
        None => HashMap::new(),
    };

    let files = FileScanner::new()
        .scan(input_dir)
        .with_context(|| format!("Failed to scan {}", input_dir.display()))?;

    let mut tasks = Vec::with_capacity(files.len());
    for file in files {
        let record = lookup_metadata(&metadata, input_dir, &file);
        match ImageTask::from_path(&file, record) {
            Ok(task) => tasks.push(task),
            Err(e) => warn!(path = %file.display(), error = %e, "Skipping unreadable file"),
        }
    }
    Ok(tasks)
}

/// Sidecar keys may be absolute paths, paths relative to the input dir, or bare file names
fn lookup_metadata(
    metadata: &HashMap<String, MetadataRecord>,
    input_dir: &Path,
    file: &Path,
) -> Option<MetadataRecord> {
    let relative = file.strip_prefix(input_dir).ok();
    let candidates = [
        Some(file.to_string_lossy().to_string()),
        relative.map(|p| p.to_string_lossy().to_string()),
        file.file_name().map(|n| n.to_string_lossy().to_string()),
    ];
    candidates
        .into_iter()
        .flatten()
        .find_map(|key| metadata.get(&key).cloned())
}

async fn log_progress(mut rx: tokio::sync::broadcast::Receiver<StatusEvent>, total: usize) {
    use tokio::sync::broadcast::error::RecvError;

    let mut finished = 0usize;
    loop {
        match rx.recv().await {
            Ok(StatusEvent::ItemOutcome {
                path, stage, outcome, ..
            }) => {
                finished += 1;
                info!("[{}] {}/{} {} {}", stage, finished, total, outcome.label(), path);
            }
            Ok(StatusEvent::StageStarted { .. }) => finished = 0,
            Ok(_) => {}
            Err(RecvError::Lagged(missed)) => finished += missed as usize,
            Err(RecvError::Closed) => break,
        }
    }
}

async fn cancel_on_interrupt(cancel: CancellationToken) {
    match signal::ctrl_c().await {
        Ok(()) => {
            warn!("Interrupt received; finishing in-flight items, then stopping");
            cancel.cancel();
        }
        Err(e) => warn!(error = %e, "Failed to install Ctrl+C handler"),
    }
}
