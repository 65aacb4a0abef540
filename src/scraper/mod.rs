pub mod cleaner;
pub mod http_client;
pub mod parsers;

use crate::config::ScraperConfig;
use crate::models::normalise_ticker;
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;
use url::Url;

use self::cleaner::parse_price;

// ── Errors ────────────────────────────────────────────────────────────────────

/// Per-ticker, recoverable: the caller substitutes a fallback.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum FetchError {
    #[error("empty ticker")]
    EmptyTicker,
    #[error("navigation to {url} failed: {reason}")]
    Navigation { url: String, reason: String },
    #[error("navigation to {url} timed out after {after:?}")]
    NavigationTimeout { url: String, after: Duration },
    #[error("price element not found within {after:?}")]
    ElementNotFound { after: Duration },
    #[error("invalid price text '{raw}'")]
    InvalidPrice { raw: String },
    #[error("bad selector {0}")]
    BadSelector(String),
}

// ── Browser abstraction ───────────────────────────────────────────────────────

/// A single tab. Owned by the batch scraper, borrowed by the fetcher.
#[async_trait]
pub trait QuotePage: Send {
    async fn goto(&mut self, url: &str, timeout: Duration) -> Result<(), FetchError>;

    /// Wait until one of `selectors` has text, returning it.
    async fn wait_for_text(
        &mut self,
        selectors: &[String],
        timeout: Duration,
    ) -> Result<String, FetchError>;
}

/// A live browser process / session. Closed explicitly by its owner.
#[async_trait]
pub trait BrowserSession: Send {
    async fn new_page(&mut self) -> Result<Box<dyn QuotePage>>;
    async fn close(&mut self);
}

/// Launches one session per batch run.
#[async_trait]
pub trait Browser: Send + Sync {
    async fn launch(&self) -> Result<Box<dyn BrowserSession>>;
}

// ── Page fetcher ──────────────────────────────────────────────────────────────

pub struct PageFetcher {
    base_url: Url,
    selectors: Vec<String>,
    navigation_timeout: Duration,
    element_timeout: Duration,
}

impl PageFetcher {
    pub fn new(config: &ScraperConfig) -> Result<Self> {
        let base_url = Url::parse(&config.base_url)
            .with_context(|| format!("Invalid base URL '{}'", config.base_url))?;
        if base_url.cannot_be_a_base() {
            anyhow::bail!("Base URL '{}' cannot carry a path", config.base_url);
        }
        Ok(Self {
            base_url,
            selectors: config.price_selectors.clone(),
            navigation_timeout: config.navigation_timeout(),
            element_timeout: config.element_timeout(),
        })
    }

    /// e.g. JEPI → https://finance.yahoo.com/quote/JEPI
    pub fn quote_url(&self, ticker: &str) -> String {
        let mut url = self.base_url.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.pop_if_empty().push("quote").push(ticker);
        }
        url.to_string()
    }

    /// Navigate `page` to the ticker's quote page and read its price.
    /// No retries here; the batch scraper decides what a failure means.
    pub async fn fetch_price(&self, ticker: &str, page: &mut dyn QuotePage) -> Result<f64, FetchError> {
        let ticker = normalise_ticker(ticker);
        if ticker.is_empty() {
            return Err(FetchError::EmptyTicker);
        }

        let url = self.quote_url(&ticker);
        debug!("{}: navigating to {}", ticker, url);
        page.goto(&url, self.navigation_timeout).await?;

        let raw = page.wait_for_text(&self.selectors, self.element_timeout).await?;
        let price = parse_price(&raw)?;
        debug!("{}: raw '{}' → {}", ticker, raw, price);
        Ok(price)
    }
}

// ── Scripted browser for tests ────────────────────────────────────────────────

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    /// What the page shows for a ticker.
    #[derive(Debug, Clone)]
    pub enum Scripted {
        Text(String),
        Fail(FetchError),
    }

    #[derive(Clone, Default)]
    pub struct MockBrowser {
        script: Arc<HashMap<String, Scripted>>,
        pub fail_launch: bool,
        pub fail_new_page: bool,
        pub launches: Arc<AtomicUsize>,
        pub closed: Arc<AtomicBool>,
        pub visits: Arc<Mutex<Vec<String>>>,
    }

    impl MockBrowser {
        pub fn new(script: &[(&str, Scripted)]) -> Self {
            Self {
                script: Arc::new(script.iter().map(|(t, s)| (t.to_string(), s.clone())).collect()),
                ..Default::default()
            }
        }

        pub fn failing_launch() -> Self {
            Self { fail_launch: true, ..Default::default() }
        }

        pub fn failing_new_page() -> Self {
            Self { fail_new_page: true, ..Default::default() }
        }

        pub fn visited(&self) -> Vec<String> {
            self.visits.lock().unwrap().clone()
        }
    }

    pub fn text(s: &str) -> Scripted {
        Scripted::Text(s.to_string())
    }

    pub fn timeout() -> Scripted {
        Scripted::Fail(FetchError::ElementNotFound { after: Duration::from_secs(10) })
    }

    struct MockSession {
        browser: MockBrowser,
    }

    struct MockPage {
        browser: MockBrowser,
        current: Option<String>,
    }

    #[async_trait]
    impl Browser for MockBrowser {
        async fn launch(&self) -> Result<Box<dyn BrowserSession>> {
            if self.fail_launch {
                anyhow::bail!("could not start browser");
            }
            self.launches.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(MockSession { browser: self.clone() }))
        }
    }

    #[async_trait]
    impl BrowserSession for MockSession {
        async fn new_page(&mut self) -> Result<Box<dyn QuotePage>> {
            if self.browser.fail_new_page {
                anyhow::bail!("page crashed");
            }
            Ok(Box::new(MockPage { browser: self.browser.clone(), current: None }))
        }

        async fn close(&mut self) {
            self.browser.closed.store(true, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl QuotePage for MockPage {
        async fn goto(&mut self, url: &str, _timeout: Duration) -> Result<(), FetchError> {
            self.browser.visits.lock().unwrap().push(url.to_string());
            let ticker = url.rsplit('/').next().unwrap_or_default().to_string();
            if let Some(Scripted::Fail(e @ FetchError::NavigationTimeout { .. })) =
                self.browser.script.get(&ticker)
            {
                return Err(e.clone());
            }
            self.current = Some(ticker);
            Ok(())
        }

        async fn wait_for_text(
            &mut self,
            _selectors: &[String],
            timeout: Duration,
        ) -> Result<String, FetchError> {
            let ticker = self.current.clone().unwrap_or_default();
            match self.browser.script.get(&ticker) {
                Some(Scripted::Text(t)) => Ok(t.clone()),
                Some(Scripted::Fail(e)) => Err(e.clone()),
                None => Err(FetchError::ElementNotFound { after: timeout }),
            }
        }
    }
}
