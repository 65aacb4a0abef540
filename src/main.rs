mod config;
mod fallback;
mod loader;
mod models;
mod pipeline;
mod scheduler;
mod scraper;
mod server;
mod storage;
mod utils;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

use crate::config::AppConfig;
use crate::loader::{load_distributions, load_fallback_table};
use crate::models::{normalise_ticker, BatchProgressEvent};
use crate::pipeline::Pipeline;
use crate::scheduler::{run_scheduled, Scheduler};
use crate::scraper::http_client::HttpBrowser;
use crate::server::{AppState, TriggerResponse};
use crate::storage::Repository;

#[derive(Parser)]
#[command(name = "etf-price-engine", about = "ETF price scraper with fallback prices", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Command {
    /// Scrape every tracked ticker now and print the result envelope
    Scrape {
        /// Print the full JSON envelope instead of a summary line
        #[arg(long)]
        json: bool,
    },

    /// Run the wall-clock scheduler in the foreground
    Schedule,

    /// Serve the HTTP trigger + read API (and the scheduler, if enabled)
    Serve {
        /// Overrides server.bind_addr
        #[arg(short, long, env = "ETF_BIND_ADDR")]
        bind: Option<String>,
    },

    /// Show the latest stored prices
    Prices {
        /// Only this ticker
        ticker: Option<String>,
    },

    /// Verify every tracked ticker has a fallback entry
    Check,

    /// Load distribution amounts (CSV `ticker,distribution`; defaults to the fallback table)
    ImportDistributions {
        #[arg(short, long)]
        file: Option<PathBuf>,
    },

    /// Delete a ticker's stored price and distribution.
    ///
    /// The ticker stays tracked while it is in `tracking.tickers` or the
    /// fallback table, so it shows as pending and the next run stores it again.
    Remove { ticker: String },

    /// Show store statistics and recent runs
    Stats,

    /// Apply schema migrations
    Migrate,
}

fn open_repo(config: &AppConfig) -> Result<Arc<Repository>> {
    let repo = Repository::open(&config.storage.db_path)?;
    if config.storage.run_migrations {
        repo.run_migrations()?;
    }
    Ok(Arc::new(repo))
}

fn build_pipeline(config: &AppConfig) -> Result<Arc<Pipeline>> {
    let fallback = load_fallback_table(&config.tracking.fallback_path)
        .context("Fallback table is required")?;
    let repo = open_repo(config)?;
    let browser = Arc::new(HttpBrowser::new(&config.scraper));
    Ok(Arc::new(Pipeline::new(config.clone(), browser, Arc::new(fallback), repo)))
}

/// Log progress events as they arrive, independent of persistence.
fn spawn_progress_logger(pipeline: &Pipeline) {
    tokio::spawn(log_progress(pipeline.subscribe()));
}

/// Drains the channel until every sender is gone. Returns the number of
/// events logged.
async fn log_progress(mut rx: broadcast::Receiver<BatchProgressEvent>) -> usize {
    let mut logged = 0;
    loop {
        let event = match rx.recv().await {
            Ok(event) => event,
            Err(RecvError::Lagged(skipped)) => {
                warn!("progress: logger fell behind, {} events skipped", skipped);
                continue;
            }
            Err(RecvError::Closed) => return logged,
        };
        match event {
            BatchProgressEvent::TickerFallback { ticker, message, .. } => {
                debug!("progress: {} fell back ({})", ticker, message)
            }
            BatchProgressEvent::RunFinished { results, errors } => {
                debug!("progress: finished, {} quotes, {} errors", results, errors)
            }
            other => debug!("progress: {:?}", other),
        }
        logged += 1;
    }
}

/// Configured tickers, or the fallback table's tickers when none are configured.
fn tracked_tickers(config: &AppConfig) -> Result<Vec<String>> {
    if !config.tracking.tickers.is_empty() {
        return Ok(config.tracking.tickers.iter().map(|t| normalise_ticker(t)).collect());
    }
    Ok(load_fallback_table(&config.tracking.fallback_path)?.tickers())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => "etf_price_engine=info,warn",
        1 => "etf_price_engine=debug,tower_http=debug,info",
        _ => "trace",
    };

    tracing_subscriber::registry()
        .with(fmt::layer().compact().with_target(false))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .init();

    let config = AppConfig::load()?;

    match cli.command {
        Command::Scrape { json } => {
            let _t = utils::Timer::start("Manual scrape");
            let pipeline = build_pipeline(&config)?;
            spawn_progress_logger(&pipeline);

            let outcome = pipeline.run().await;
            let (_, envelope) = TriggerResponse::from_outcome(&outcome);
            if json {
                println!("{}", serde_json::to_string_pretty(&envelope)?);
            } else if let Some(msg) = &envelope.message {
                println!("{}", msg);
                if let Some(summary) = &envelope.summary {
                    for e in &summary.result.errors {
                        println!("  fallback  {:<8} {}", e.ticker, e.message);
                    }
                }
            }
            if let Err(e) = outcome {
                bail!("Scrape failed: {}", e);
            }
        }

        Command::Schedule => {
            let pipeline = build_pipeline(&config)?;
            spawn_progress_logger(&pipeline);
            let scheduler = Scheduler::from_config(&config.schedule)?;
            for job in scheduler.jobs() {
                info!("Scheduled: {}", job);
            }
            scheduler
                .run(|| run_scheduled(pipeline.clone()))
                .await;
        }

        Command::Serve { bind } => {
            let pipeline = build_pipeline(&config)?;
            spawn_progress_logger(&pipeline);

            if config.schedule.enabled {
                let scheduler = Scheduler::from_config(&config.schedule)?;
                let p = pipeline.clone();
                tokio::spawn(async move {
                    scheduler.run(|| run_scheduled(p.clone())).await;
                });
            } else {
                info!("Scheduler disabled; manual triggers only");
            }

            let bind = bind.unwrap_or_else(|| config.server.bind_addr.clone());
            server::serve(AppState { pipeline }, &bind).await?;
        }

        Command::Prices { ticker } => {
            let repo = open_repo(&config)?;
            let records = match ticker {
                Some(t) => repo.latest_price(&t)?.into_iter().collect(),
                None => repo.latest_prices(&tracked_tickers(&config)?)?,
            };
            if records.is_empty() {
                println!("No prices — run `etf-price-engine scrape` first.");
            }
            for r in &records {
                println!(
                    "  {:<8} {:>12}  {:<8}  dist {:>8}  {}",
                    r.ticker,
                    r.price.to_string(),
                    r.source.map(|s| s.to_string()).unwrap_or("—".into()),
                    r.distribution.map(|d| format!("{:.4}", d)).unwrap_or("—".into()),
                    r.timestamp.map(|t| t.to_rfc3339()).unwrap_or_default(),
                );
            }
        }

        Command::Check => {
            let table = load_fallback_table(&config.tracking.fallback_path)?;
            if table.is_empty() {
                warn!("Fallback table {:?} is empty", config.tracking.fallback_path);
            }
            let tracked = if config.tracking.tickers.is_empty() {
                table.tickers()
            } else {
                tracked_tickers(&config)?
            };
            let missing = table.missing(&tracked);
            if missing.is_empty() {
                println!("OK: all {} tracked tickers have fallback prices.", tracked.len());
            } else {
                for m in &missing {
                    warn!("{} has no fallback entry", m);
                }
                bail!("{} of {} tracked tickers lack a fallback: {:?}", missing.len(), tracked.len(), missing);
            }
        }

        Command::ImportDistributions { file } => {
            let repo = open_repo(&config)?;
            let rows = match file {
                Some(path) => load_distributions(&path)?,
                None => load_fallback_table(&config.tracking.fallback_path)?
                    .entries()
                    .iter()
                    .map(|e| (e.ticker.clone(), e.distribution))
                    .collect(),
            };
            let n = repo.upsert_distributions(&rows)?;
            println!("{} distributions stored.", n);
        }

        Command::Remove { ticker } => {
            let repo = open_repo(&config)?;
            let ticker = normalise_ticker(&ticker);
            if repo.remove_ticker(&ticker)? {
                println!("Removed {}.", ticker);
            } else {
                println!("{} was not stored.", ticker);
            }
            match tracked_tickers(&config) {
                Ok(tracked) if tracked.contains(&ticker) => {
                    warn!("{} is still tracked and will be stored again by the next run", ticker)
                }
                Ok(_) => {}
                Err(e) => warn!("Could not check whether {} is still tracked: {:#}", ticker, e),
            }
        }

        Command::Stats => {
            let repo = open_repo(&config)?;
            println!("─────────────────────────────────");
            println!("  ETF prices — Store Stats");
            println!("─────────────────────────────────");
            println!("  Quotes    : {}", utils::fmt_number(repo.quote_count()?));
            println!("  Fallbacks : {}", utils::fmt_number(repo.fallback_quote_count()?));
            println!("─────────────────────────────────");
            for run in repo.recent_runs(5)? {
                println!(
                    "  #{:<4} {}  {:<8} {} quotes, {} fallback, {} write errors{}",
                    run.id,
                    run.started_at.format("%Y-%m-%d %H:%M"),
                    run.status,
                    run.quotes,
                    run.fallbacks,
                    run.write_errors,
                    run.error.map(|e| format!(" ({})", e)).unwrap_or_default(),
                );
            }
        }

        Command::Migrate => {
            Repository::open(&config.storage.db_path)?.run_migrations()?;
            println!("Migrations applied.");
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_progress_logger_survives_lag() {
        let (tx, rx) = broadcast::channel(2);
        for i in 0..5 {
            tx.send(BatchProgressEvent::RunStarted { tickers: i, batches: 1 }).unwrap();
        }
        let logger = tokio::spawn(log_progress(rx));
        tokio::task::yield_now().await;
        tx.send(BatchProgressEvent::RunFinished { results: 1, errors: 0 }).ok();
        drop(tx);

        // Two buffered events survive the lag, plus whatever arrives after it
        assert!(logger.await.unwrap() >= 2);
    }

    #[test]
    fn test_configured_tickers_win_over_fallback_table() {
        let mut config = AppConfig::default();
        config.tracking.tickers = vec!["QYLD".into()];
        config.tracking.fallback_path = "does/not/exist.json".into();
        assert_eq!(tracked_tickers(&config).unwrap(), vec!["QYLD"]);

        config.tracking.tickers.clear();
        assert!(tracked_tickers(&config).is_err());
    }
}
