//! Sequential batch scraper.
//!
//! Tickers are processed one at a time, in list order, in fixed-size batches:
//!
//!   fetch → on failure substitute the fallback → inter-request pause
//!   … end of batch → inter-batch pause (not after the last batch)
//!
//! One browser session is opened per run and closed on every exit path.
//! A ticker whose fetch fails and that has no fallback aborts the whole run;
//! nothing collected so far is returned.

use crate::config::BatchConfig;
use crate::fallback::FallbackTable;
use crate::models::{
    normalise_ticker, BatchProgressEvent, PriceQuote, ScrapeBatchResult, Source, TickerError,
};
use crate::scraper::{Browser, FetchError, PageFetcher, QuotePage};
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

const EVENT_CAPACITY: usize = 256;

// ── Errors / state ────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ScrapeError {
    #[error("no fallback price for {ticker} (live fetch failed: {cause})")]
    FallbackMissing { ticker: String, cause: FetchError },
    #[error("fatal: {0}")]
    Fatal(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Idle,
    Running { batch_index: usize, ticker_index: usize },
    Completed,
    Fatal,
}

// ── Pacing ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PauseKind {
    BetweenRequests,
    BetweenBatches,
}

/// Where the scraper sleeps. Swapped out in tests.
#[async_trait]
pub trait Pacer: Send + Sync {
    async fn pause(&self, kind: PauseKind, delay: Duration);
}

pub struct TokioPacer;

#[async_trait]
impl Pacer for TokioPacer {
    async fn pause(&self, kind: PauseKind, delay: Duration) {
        debug!("{:?}: sleeping {:?}", kind, delay);
        tokio::time::sleep(delay).await;
    }
}

/// Uniform delay in `[min_ms, max_ms]`.
fn request_delay(cfg: &BatchConfig) -> Duration {
    let span = cfg.request_delay_max_ms.saturating_sub(cfg.request_delay_min_ms);
    let jitter = if span == 0 { 0 } else { rand::random::<u64>() % (span + 1) };
    Duration::from_millis(cfg.request_delay_min_ms + jitter)
}

/// Drop duplicates, keep first occurrence and order.
fn dedupe(tickers: &[String]) -> Vec<String> {
    let mut seen = HashSet::new();
    tickers
        .iter()
        .map(|t| normalise_ticker(t))
        .filter(|t| !t.is_empty() && seen.insert(t.clone()))
        .collect()
}

// ── Scraper ───────────────────────────────────────────────────────────────────

pub struct BatchScraper {
    fetcher: PageFetcher,
    config: BatchConfig,
    pacer: Arc<dyn Pacer>,
    events: broadcast::Sender<BatchProgressEvent>,
    state: RunState,
}

impl BatchScraper {
    pub fn new(fetcher: PageFetcher, mut config: BatchConfig, pacer: Arc<dyn Pacer>) -> Self {
        config.batch_size = config.batch_size.max(1);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self { fetcher, config, pacer, events, state: RunState::Idle }
    }

    /// Publish progress on an existing channel instead of a private one.
    pub fn with_events(mut self, events: broadcast::Sender<BatchProgressEvent>) -> Self {
        self.events = events;
        self
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BatchProgressEvent> {
        self.events.subscribe()
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    fn emit(&self, event: BatchProgressEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    pub async fn run(
        &mut self,
        browser: &dyn Browser,
        tickers: &[String],
        fallback: &FallbackTable,
    ) -> Result<ScrapeBatchResult, ScrapeError> {
        let tickers = dedupe(tickers);
        let batches = tickers.len().div_ceil(self.config.batch_size);
        self.state = RunState::Running { batch_index: 0, ticker_index: 0 };
        self.emit(BatchProgressEvent::RunStarted { tickers: tickers.len(), batches });
        info!("Scraping {} tickers in {} batches of ≤{}", tickers.len(), batches, self.config.batch_size);

        let mut session = match browser.launch().await {
            Ok(s) => s,
            Err(e) => {
                error!("Browser launch failed: {:#}", e);
                self.state = RunState::Fatal;
                return Err(ScrapeError::Fatal(format!("browser launch failed: {:#}", e)));
            }
        };

        let outcome = match session.new_page().await {
            Ok(mut page) => self.scrape_all(page.as_mut(), &tickers, fallback).await,
            Err(e) => Err(ScrapeError::Fatal(format!("could not open page: {:#}", e))),
        };
        session.close().await;

        match outcome {
            Ok(result) => {
                self.state = RunState::Completed;
                self.emit(BatchProgressEvent::RunFinished {
                    results: result.results.len(),
                    errors: result.errors.len(),
                });
                info!(
                    "Batch run complete: {} quotes ({} fallback)",
                    result.results.len(),
                    result.errors.len()
                );
                Ok(result)
            }
            Err(e) => {
                error!("Batch run aborted: {}", e);
                self.state = RunState::Fatal;
                Err(e)
            }
        }
    }

    async fn scrape_all(
        &mut self,
        page: &mut dyn QuotePage,
        tickers: &[String],
        fallback: &FallbackTable,
    ) -> Result<ScrapeBatchResult, ScrapeError> {
        let mut out = ScrapeBatchResult::default();
        let total = tickers.len();
        let batch_count = total.div_ceil(self.config.batch_size);
        let mut processed = 0usize;

        for (batch_index, batch) in tickers.chunks(self.config.batch_size).enumerate() {
            debug!("Batch {}/{}: {:?}", batch_index + 1, batch_count, batch);

            for (ticker_index, ticker) in batch.iter().enumerate() {
                self.state = RunState::Running { batch_index, ticker_index };

                match self.fetcher.fetch_price(ticker, page).await {
                    Ok(price) => {
                        info!("{}: {:.2}", ticker, price);
                        out.results.push(PriceQuote::new(ticker, price, Source::Primary));
                        self.emit(BatchProgressEvent::TickerDone {
                            batch_index,
                            ticker_index,
                            ticker: ticker.clone(),
                            price,
                        });
                    }
                    Err(cause) => {
                        let entry = match fallback.lookup(ticker) {
                            Ok(entry) => entry,
                            Err(_) => {
                                return Err(ScrapeError::FallbackMissing {
                                    ticker: ticker.clone(),
                                    cause,
                                });
                            }
                        };
                        let message = cause.to_string();
                        warn!("{}: {} — using fallback {:.2}", ticker, message, entry.price);
                        out.results.push(PriceQuote::new(ticker, entry.price, Source::Fallback));
                        out.errors.push(TickerError { ticker: ticker.clone(), message: message.clone() });
                        self.emit(BatchProgressEvent::TickerFallback {
                            batch_index,
                            ticker_index,
                            ticker: ticker.clone(),
                            price: entry.price,
                            message,
                        });
                    }
                }

                processed += 1;
                if processed < total {
                    self.pacer
                        .pause(PauseKind::BetweenRequests, request_delay(&self.config))
                        .await;
                }
            }

            if batch_index + 1 < batch_count {
                let delay = self.config.batch_delay();
                info!("Batch {} done, pausing {:?}", batch_index + 1, delay);
                self.emit(BatchProgressEvent::BatchPaused { batch_index, delay });
                self.pacer.pause(PauseKind::BetweenBatches, delay).await;
            }
        }

        Ok(out)
    }
}

// ── Test pacer ────────────────────────────────────────────────────────────────

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::Mutex;

    /// Records pauses instead of sleeping.
    #[derive(Default)]
    pub struct RecordingPacer {
        pub pauses: Mutex<Vec<(PauseKind, Duration)>>,
    }

    impl RecordingPacer {
        pub fn count(&self, kind: PauseKind) -> usize {
            self.pauses.lock().unwrap().iter().filter(|(k, _)| *k == kind).count()
        }
    }

    #[async_trait]
    impl Pacer for RecordingPacer {
        async fn pause(&self, kind: PauseKind, delay: Duration) {
            self.pauses.lock().unwrap().push((kind, delay));
        }
    }
}
