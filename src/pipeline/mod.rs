//! Pipeline orchestrator: ties batch scraper → storage together.
//!
//! `run()` is the single entry point for both the scheduler and manual
//! triggers:
//!   1. Scrape every tracked ticker (live price or fallback)
//!   2. Upsert each quote into the store; a failed write is logged and
//!      counted, the remaining quotes are still written
//!   3. Record the run in `scrape_runs`
//!
//! A run that aborts in step 1 persists nothing. Only one run is in flight
//! at a time; a second trigger is rejected with `RunError::AlreadyRunning`.

pub mod batch;

use crate::config::AppConfig;
use crate::fallback::FallbackTable;
use crate::models::{normalise_ticker, BatchProgressEvent, PriceQuote, ScrapeBatchResult};
use crate::scraper::{Browser, PageFetcher};
use crate::storage::{PriceSink, Repository, RunRecord};
use anyhow::Result;
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, Mutex};
use tracing::{error, info, warn};

use self::batch::{BatchScraper, Pacer, ScrapeError, TokioPacer};

#[derive(Debug, Error)]
pub enum RunError {
    #[error("a scrape run is already in progress")]
    AlreadyRunning,
    #[error(transparent)]
    Scrape(#[from] ScrapeError),
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Serialize)]
pub struct PersistStats {
    pub persisted: usize,
    pub write_errors: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    /// `None` when the run could not be recorded in the run log.
    pub run_id: Option<i64>,
    pub tickers: usize,
    pub primary: usize,
    pub fallback: usize,
    pub persisted: usize,
    pub write_errors: usize,
    pub result: ScrapeBatchResult,
}

impl RunSummary {
    pub fn message(&self) -> String {
        format!(
            "Scraped {} tickers ({} live, {} fallback); {} saved, {} write errors",
            self.tickers, self.primary, self.fallback, self.persisted, self.write_errors
        )
    }
}

/// Write every quote; one failure never stops the rest.
pub fn persist_all(sink: &dyn PriceSink, quotes: &[PriceQuote]) -> PersistStats {
    let mut stats = PersistStats::default();
    for quote in quotes {
        match sink.persist(quote) {
            Ok(()) => stats.persisted += 1,
            Err(e) => {
                warn!("{}", e);
                stats.write_errors += 1;
            }
        }
    }
    stats
}

pub struct Pipeline {
    config: AppConfig,
    browser: Arc<dyn Browser>,
    fallback: Arc<FallbackTable>,
    repo: Arc<Repository>,
    pacer: Arc<dyn Pacer>,
    events: broadcast::Sender<BatchProgressEvent>,
    in_flight: Mutex<()>,
}

impl Pipeline {
    pub fn new(
        config: AppConfig,
        browser: Arc<dyn Browser>,
        fallback: Arc<FallbackTable>,
        repo: Arc<Repository>,
    ) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            config,
            browser,
            fallback,
            repo,
            pacer: Arc::new(TokioPacer),
            events,
            in_flight: Mutex::new(()),
        }
    }

    pub fn with_pacer(mut self, pacer: Arc<dyn Pacer>) -> Self {
        self.pacer = pacer;
        self
    }

    pub fn repo(&self) -> &Repository {
        &self.repo
    }

    /// Configured tickers, or every fallback ticker when none are configured.
    pub fn tracked_tickers(&self) -> Vec<String> {
        if self.config.tracking.tickers.is_empty() {
            self.fallback.tickers()
        } else {
            self.config.tracking.tickers.iter().map(|t| normalise_ticker(t)).collect()
        }
    }

    /// Progress events of every run started after subscribing.
    pub fn subscribe(&self) -> broadcast::Receiver<BatchProgressEvent> {
        self.events.subscribe()
    }

    pub async fn run(&self) -> Result<RunSummary, RunError> {
        let _guard = self.in_flight.try_lock().map_err(|_| RunError::AlreadyRunning)?;

        let tickers = self.tracked_tickers();
        let missing = self.fallback.missing(&tickers);
        if !missing.is_empty() {
            warn!("No fallback for {:?}; a failed fetch for these aborts the run", missing);
        }

        let fetcher = PageFetcher::new(&self.config.scraper)
            .map_err(|e| ScrapeError::Fatal(format!("{:#}", e)))?;
        let mut scraper = BatchScraper::new(fetcher, self.config.batch.clone(), self.pacer.clone())
            .with_events(self.events.clone());

        let run_id = match self.repo.begin_scrape_run() {
            Ok(id) => Some(id),
            Err(e) => {
                warn!("Could not record run start: {:#}", e);
                None
            }
        };

        let result = match scraper.run(self.browser.as_ref(), &tickers, &self.fallback).await {
            Ok(r) => r,
            Err(e) => {
                error!("Run failed, nothing persisted: {}", e);
                let message = e.to_string();
                self.record_finish(run_id, &RunRecord { error: Some(&message), ..Default::default() });
                return Err(e.into());
            }
        };

        let stats = persist_all(self.repo.as_ref(), &result.results);
        let summary = RunSummary {
            run_id,
            tickers: result.results.len(),
            primary: result.primary_count(),
            fallback: result.fallback_count(),
            persisted: stats.persisted,
            write_errors: stats.write_errors,
            result,
        };

        self.record_finish(
            run_id,
            &RunRecord {
                quotes: summary.persisted,
                fallbacks: summary.fallback,
                write_errors: summary.write_errors,
                error: None,
            },
        );

        info!("=== Run complete: {} ===", summary.message());
        Ok(summary)
    }

    fn record_finish(&self, run_id: Option<i64>, record: &RunRecord<'_>) {
        let Some(id) = run_id else { return };
        if let Err(e) = self.repo.finish_scrape_run(id, record) {
            warn!("Could not record outcome of run {}: {:#}", id, e);
        }
    }
}
