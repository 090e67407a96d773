//! CRM extraction CLI.
//!
//! Reads credentials from the environment (`API_ORG_ID` / `API_API_KEY`),
//! runs the enrichment pipeline for the requested account types, and writes
//! the CSV exports.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::Parser;

use crm_extract::accounts::UserType;
use crm_extract::client::{CrmApi, CrmClient};
use crm_extract::config::CrmConfig;
use crm_extract::pipeline;

#[derive(Parser)]
#[command(name = "crm-extract")]
#[command(version)]
#[command(about = "Extract enriched account data from the CRM to CSV", long_about = None)]
struct Cli {
    /// Directory for the CSV exports
    #[arg(short, long, default_value = ".")]
    output_dir: PathBuf,

    /// Only extract one account type (INDIVIDUAL or COMPANY)
    #[arg(short, long)]
    user_type: Option<UserType>,

    /// Worker-pool size for per-account fan-out
    #[arg(long)]
    concurrency: Option<usize>,

    /// Minimum per-call duration in milliseconds
    #[arg(long)]
    pacing_ms: Option<u64>,

    /// Page size for listing endpoints
    #[arg(long)]
    page_size: Option<u32>,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .init();

    let mut cfg = CrmConfig::from_env().context("loading CRM credentials")?;
    if let Some(concurrency) = cli.concurrency {
        cfg.max_concurrency = concurrency;
    }
    if let Some(pacing_ms) = cli.pacing_ms {
        cfg.pacing_ms = pacing_ms;
    }
    if let Some(page_size) = cli.page_size {
        cfg.page_size = page_size;
    }

    let user_types: Vec<UserType> = match cli.user_type {
        Some(user_type) => vec![user_type],
        None => vec![UserType::Individual, UserType::Company],
    };

    let api: Arc<dyn CrmApi> = Arc::new(CrmClient::new(&cfg)?);

    let started = Instant::now();
    log::info!("extraction started");
    pipeline::run(api, &cfg, &user_types, &cli.output_dir)
        .await
        .context("extraction failed")?;
    log::info!("extraction finished in {:.1}s", started.elapsed().as_secs_f64());

    Ok(())
}
