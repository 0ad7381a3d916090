use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use slideq::config::AppConfig;
use slideq::core::{
    ConcurrencyLimit, HttpTransport, JobPayload, JobStatus, Operation, Scheduler,
    SimulatedTransport, SourceFile, TracingObserver, TransportClient,
};
use slideq::logging::{self, LogConfig};
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "slideq")]
#[command(about = "Queue slide images for server-side reconstruction", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[command(flatten)]
    global: GlobalArgs,
}

#[derive(Subcommand)]
enum Commands {
    /// Process image files as one batch
    Run(RunArgs),
    /// Rebuild slides from source/background image pairs
    Combine(CombineArgs),
    /// Print the effective configuration as TOML
    Config,
}

/// Flags that override the configuration file and environment. Only flags
/// that were given are serialized.
#[derive(Args, Serialize)]
struct GlobalArgs {
    /// Configuration file (default: ./slideq.toml if present)
    #[serde(skip)]
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long, global = true)]
    server_url: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long, global = true)]
    max_concurrent: Option<usize>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long, global = true)]
    job_timeout_secs: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long, global = true, num_args = 0..=1, default_missing_value = "true")]
    simulation: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long, global = true, num_args = 0..=1, default_missing_value = "true")]
    verbose: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long, global = true, num_args = 0..=1, default_missing_value = "true")]
    json_logs: Option<bool>,
}

#[derive(Args)]
struct RunArgs {
    #[arg(required = true)]
    files: Vec<PathBuf>,

    /// reconstruct, remove-text, remove-text-ai or extract-text
    #[arg(long, default_value = "reconstruct")]
    operation: Operation,

    /// Request the combined batch presentation once the batch settles
    #[arg(long)]
    export: bool,
}

#[derive(Args)]
struct CombineArgs {
    /// SOURCE=BACKGROUND image pair, repeatable
    #[arg(long = "pair", required = true, value_parser = parse_pair)]
    pairs: Vec<(PathBuf, PathBuf)>,

    #[arg(long)]
    export: bool,
}

fn parse_pair(raw: &str) -> Result<(PathBuf, PathBuf), String> {
    match raw.split_once('=') {
        Some((source, background)) if !source.is_empty() && !background.is_empty() => {
            Ok((PathBuf::from(source), PathBuf::from(background)))
        }
        _ => Err(format!("expected SOURCE=BACKGROUND, got {:?}", raw)),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = AppConfig::new(cli.global.config.as_deref(), Some(&cli.global))?;
    logging::init(LogConfig::from(&config));

    match cli.command {
        Commands::Config => {
            print!("{}", config.to_toml()?);
            Ok(())
        }
        Commands::Run(args) => {
            let payloads = load_single(&args.files, args.operation).await?;
            run_batch(&config, payloads, args.export)
                .await
                .context("Batch run failed")
        }
        Commands::Combine(args) => {
            let payloads = load_pairs(&args.pairs).await?;
            run_batch(&config, payloads, args.export)
                .await
                .context("Combine run failed")
        }
    }
}

async fn load_single(paths: &[PathBuf], operation: Operation) -> Result<Vec<JobPayload>> {
    let mut payloads = Vec::with_capacity(paths.len());
    for path in paths {
        let file = SourceFile::from_path(path).await?;
        if !file.is_image() {
            warn!(file = %path.display(), "Skipping non-image file");
            continue;
        }
        payloads.push(JobPayload::Single { operation, file });
    }
    Ok(payloads)
}

async fn load_pairs(pairs: &[(PathBuf, PathBuf)]) -> Result<Vec<JobPayload>> {
    let mut payloads = Vec::with_capacity(pairs.len());
    for (source, background) in pairs {
        payloads.push(JobPayload::Paired {
            source: SourceFile::from_path(source).await?,
            background: SourceFile::from_path(background).await?,
        });
    }
    Ok(payloads)
}

fn build_transport(config: &AppConfig) -> Result<Arc<dyn TransportClient>> {
    if config.simulation {
        info!("Simulation mode: no requests leave this process");
        return Ok(Arc::new(SimulatedTransport::default()));
    }
    let transport = HttpTransport::new(&config.server_url, config.connect_timeout())
        .context("Failed to build HTTP client")?;
    Ok(Arc::new(transport))
}

async fn run_batch(config: &AppConfig, payloads: Vec<JobPayload>, export: bool) -> Result<()> {
    if payloads.is_empty() {
        bail!("No image files to process");
    }

    let scheduler = Scheduler::new(
        build_transport(config)?,
        ConcurrencyLimit::new(config.max_concurrent),
        Arc::new(TracingObserver::default()),
        config.job_timeout(),
    );

    let jobs = scheduler.submit_batch(payloads, config.processing.clone());
    if let Some(batch) = scheduler.latest_batch() {
        info!(
            batch = %batch,
            jobs = jobs.len(),
            max_concurrent = config.max_concurrent,
            "Batch submitted"
        );
    }

    let stopper = scheduler.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling remaining jobs (Ctrl-C again to exit now)");
            stopper.stop();
            if tokio::signal::ctrl_c().await.is_ok() {
                std::process::exit(130);
            }
        }
    });

    scheduler.wait_idle().await;
    print_summary(&scheduler);

    if export {
        let exported = scheduler
            .export_latest_batch()
            .await
            .context("Batch export failed")?;
        println!(
            "Batch presentation: {}{} ({})",
            config.server_url.trim_end_matches('/'),
            exported.download_url,
            exported.filename
        );
    }

    let stats = scheduler.queue_stats();
    if stats.error > 0 {
        bail!("{} of {} jobs failed", stats.error, stats.total);
    }
    Ok(())
}

fn print_summary(scheduler: &Scheduler) {
    for job in scheduler.jobs() {
        let detail = match job.status {
            JobStatus::Complete => job
                .result
                .as_ref()
                .and_then(|r| {
                    r.pptx_url
                        .clone()
                        .or_else(|| r.html_url.clone())
                        .or_else(|| r.bg_url.clone())
                        .or_else(|| r.text.clone())
                })
                .unwrap_or_default(),
            _ => job.error.clone().unwrap_or_default(),
        };
        println!("{:<10} {:<40} {}", job.status.as_str(), job.label, detail);
    }

    let stats = scheduler.queue_stats();
    println!(
        "{}/{} finished ({} complete, {} failed, {} cancelled)",
        stats.finished(),
        stats.total,
        stats.complete,
        stats.error,
        stats.cancelled
    );
}
