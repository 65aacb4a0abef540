//! HTTP-backed browser session: a cookie-keeping client with browser-like
//! headers, and pages that reload until the price element shows up.

use super::{parsers, Browser, BrowserSession, FetchError, QuotePage};
use crate::config::ScraperConfig;
use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, ACCEPT_LANGUAGE, CACHE_CONTROL};
use std::time::Duration;
use tokio::time::{sleep, timeout, Instant};
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::Retry;
use tracing::{debug, info, warn};

pub struct HttpBrowser {
    config: ScraperConfig,
}

impl HttpBrowser {
    pub fn new(config: &ScraperConfig) -> Self {
        Self { config: config.clone() }
    }

    fn build_client(&self) -> Result<reqwest::Client> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_str(&self.config.accept)?);
        headers.insert(ACCEPT_LANGUAGE, HeaderValue::from_str(&self.config.accept_language)?);
        headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));

        reqwest::Client::builder()
            .user_agent(&self.config.user_agent)
            .default_headers(headers)
            .timeout(self.config.navigation_timeout())
            .gzip(true)
            // Consent / session cookies from the landing page are needed on quote pages
            .cookie_store(true)
            .build()
            .context("Failed to build HTTP client")
    }
}

#[async_trait]
impl Browser for HttpBrowser {
    /// Build the client and visit the landing page to pick up cookies.
    /// Only a client that cannot be built fails the launch. An unreachable
    /// vendor surfaces later as per-ticker navigation errors.
    async fn launch(&self) -> Result<Box<dyn BrowserSession>> {
        let client = self.build_client()?;
        let landing = self.config.base_url.clone();

        let strategy = ExponentialBackoff::from_millis(2)
            .factor(250)
            .max_delay(Duration::from_secs(5))
            .map(jitter)
            .take(self.config.launch_attempts.saturating_sub(1));

        let (client_ref, landing_ref) = (&client, landing.as_str());
        let warm_up = Retry::spawn(strategy, move || async move {
            let resp = client_ref.get(landing_ref).send().await.map_err(|e| {
                debug!("Session warm-up attempt failed: {}", e);
                e
            })?;
            debug!("Warm-up {} → {}", landing_ref, resp.status());
            Ok::<_, reqwest::Error>(())
        })
        .await;

        match warm_up {
            Ok(()) => info!("Browser session ready ({})", landing),
            Err(e) => warn!("Session warm-up against {} failed, continuing without cookies: {}", landing, e),
        }

        Ok(Box::new(HttpSession {
            client: Some(client),
            poll_interval: self.config.poll_interval(),
        }))
    }
}

pub struct HttpSession {
    client: Option<reqwest::Client>,
    poll_interval: Duration,
}

#[async_trait]
impl BrowserSession for HttpSession {
    async fn new_page(&mut self) -> Result<Box<dyn QuotePage>> {
        let client = self
            .client
            .clone()
            .context("Session already closed")?;
        Ok(Box::new(HttpPage {
            client,
            poll_interval: self.poll_interval,
            url: None,
            body: None,
        }))
    }

    async fn close(&mut self) {
        if self.client.take().is_some() {
            debug!("Browser session closed");
        }
    }
}

pub struct HttpPage {
    client: reqwest::Client,
    poll_interval: Duration,
    url: Option<String>,
    body: Option<String>,
}

impl HttpPage {
    async fn load(&mut self, url: &str, budget: Duration) -> Result<(), FetchError> {
        let nav_err = |reason: String| FetchError::Navigation { url: url.to_string(), reason };

        let request = async {
            let resp = self.client.get(url).send().await.map_err(|e| nav_err(e.to_string()))?;
            let status = resp.status();
            if !status.is_success() {
                return Err(nav_err(format!("HTTP {}", status)));
            }
            resp.text().await.map_err(|e| nav_err(e.to_string()))
        };

        let body = timeout(budget, request)
            .await
            .map_err(|_| FetchError::NavigationTimeout { url: url.to_string(), after: budget })??;

        self.url = Some(url.to_string());
        self.body = Some(body);
        Ok(())
    }
}

#[async_trait]
impl QuotePage for HttpPage {
    async fn goto(&mut self, url: &str, timeout: Duration) -> Result<(), FetchError> {
        self.body = None;
        self.load(url, timeout).await
    }

    async fn wait_for_text(
        &mut self,
        selectors: &[String],
        timeout: Duration,
    ) -> Result<String, FetchError> {
        let deadline = Instant::now() + timeout;

        loop {
            if let Some(body) = &self.body {
                if let Some(text) = parsers::first_text(body, selectors)? {
                    return Ok(text);
                }
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(FetchError::ElementNotFound { after: timeout });
            }
            sleep(self.poll_interval.min(deadline - now)).await;

            let remaining = deadline.saturating_duration_since(Instant::now());
            let Some(url) = self.url.clone() else {
                return Err(FetchError::ElementNotFound { after: timeout });
            };
            if remaining.is_zero() {
                continue;
            }
            if let Err(e) = self.load(&url, remaining).await {
                debug!("Reload of {} while waiting failed: {}", url, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unreachable_vendor_still_opens_session() {
        let cfg = ScraperConfig {
            base_url: "http://127.0.0.1:9".into(),
            navigation_timeout_secs: 2,
            launch_attempts: 1,
            ..Default::default()
        };
        let mut session = HttpBrowser::new(&cfg).launch().await.unwrap();
        let mut page = session.new_page().await.unwrap();

        let err = page.goto("http://127.0.0.1:9/quote/AAA", Duration::from_secs(2)).await.unwrap_err();
        assert!(matches!(
            err,
            FetchError::Navigation { .. } | FetchError::NavigationTimeout { .. }
        ));
        session.close().await;
    }

    #[tokio::test]
    async fn test_closed_session_has_no_pages() {
        let browser = HttpBrowser::new(&ScraperConfig::default());
        let client = browser.build_client().unwrap();
        let mut session = HttpSession { client: Some(client), poll_interval: Duration::from_millis(1) };
        assert!(session.new_page().await.is_ok());
        session.close().await;
        assert!(session.new_page().await.is_err());
    }

    #[tokio::test]
    async fn test_wait_without_navigation_times_out() {
        let client = HttpBrowser::new(&ScraperConfig::default()).build_client().unwrap();
        let mut page = HttpPage {
            client,
            poll_interval: Duration::from_millis(5),
            url: None,
            body: None,
        };
        let err = page
            .wait_for_text(&["span".to_string()], Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::ElementNotFound { .. }));
    }

    #[tokio::test]
    async fn test_wait_reads_loaded_body() {
        let client = HttpBrowser::new(&ScraperConfig::default()).build_client().unwrap();
        let mut page = HttpPage {
            client,
            poll_interval: Duration::from_millis(5),
            url: Some("http://localhost/quote/AAA".into()),
            body: Some(r#"<span data-testid="qsp-price">12.34</span>"#.into()),
        };
        let text = page
            .wait_for_text(&[r#"[data-testid="qsp-price"]"#.to_string()], Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(text, "12.34");
    }
}
