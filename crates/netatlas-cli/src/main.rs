use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use netatlas_harvest::{load_descriptors, load_variant_config, HarvestConfig, HarvestDriver};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "netatlas")]
#[command(about = "YOK Atlas net-table harvester")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch every descriptor's table and append new rows to the per-variant
    /// output files.
    Harvest(HarvestArgs),
}

#[derive(Debug, clap::Args)]
struct HarvestArgs {
    /// Two-column CSV of program name and table URL.
    #[arg(long, default_value = "programs.csv")]
    descriptors: PathBuf,

    /// Directory receiving the per-variant CSV/Parquet outputs.
    #[arg(long, default_value = "out")]
    out_dir: PathBuf,

    /// Optional YAML override for the per-variant required-field sets.
    #[arg(long)]
    variants: Option<PathBuf>,

    /// Worker pool width; 1 processes descriptors sequentially.
    #[arg(long, default_value_t = 1)]
    workers: usize,

    #[arg(long, default_value_t = 3)]
    max_retries: usize,

    #[arg(long, default_value_t = 2000)]
    initial_wait_ms: u64,

    #[arg(long, default_value_t = 10)]
    timeout_secs: u64,

    /// Courtesy delay range between descriptors, in milliseconds.
    #[arg(long, default_value_t = 1000)]
    min_delay_ms: u64,
    #[arg(long, default_value_t = 3000)]
    max_delay_ms: u64,

    #[arg(long)]
    user_agent: Option<String>,
}

impl Default for HarvestArgs {
    fn default() -> Self {
        Self {
            descriptors: PathBuf::from("programs.csv"),
            out_dir: PathBuf::from("out"),
            variants: None,
            workers: 1,
            max_retries: 3,
            initial_wait_ms: 2000,
            timeout_secs: 10,
            min_delay_ms: 1000,
            max_delay_ms: 3000,
            user_agent: None,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    match cli.command {
        Some(Commands::Harvest(args)) => harvest(args).await,
        None => harvest(HarvestArgs::default()).await,
    }
}

async fn harvest(args: HarvestArgs) -> Result<()> {
    // A missing descriptor list is the one condition that fails the whole
    // process; per-descriptor failures only show up in the report.
    let descriptors = load_descriptors(&args.descriptors)
        .with_context(|| format!("loading descriptors from {}", args.descriptors.display()))?;
    let variants = load_variant_config(args.variants.as_deref())?;

    let config = HarvestConfig {
        output_dir: args.out_dir,
        user_agent: args
            .user_agent
            .unwrap_or_else(|| netatlas_harvest::DEFAULT_USER_AGENT.to_string()),
        timeout: Duration::from_secs(args.timeout_secs),
        max_retries: args.max_retries,
        initial_wait: Duration::from_millis(args.initial_wait_ms),
        delay_min: Duration::from_millis(args.min_delay_ms),
        delay_max: Duration::from_millis(args.max_delay_ms),
        workers: args.workers.max(1),
    };

    let driver = HarvestDriver::new(config, variants)?;
    let report = driver.run(&descriptors).await?;

    println!(
        "harvest complete: run_id={} processed={} succeeded={} failed={} written={} skipped_duplicate={}",
        report.run_id,
        report.processed,
        report.succeeded,
        report.failed,
        report.written,
        report.skipped_duplicate
    );
    for (variant, rows) in &report.rows_by_variant {
        println!("  {variant}: {rows} rows");
    }
    for (stage, count) in &report.failures_by_stage {
        println!("  failed at {stage}: {count}");
    }

    Ok(())
}
