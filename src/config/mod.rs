use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Top-level application configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct AppConfig {
    #[serde(default)]
    pub scraper: ScraperConfig,
    #[serde(default)]
    pub batch: BatchConfig,
    #[serde(default)]
    pub tracking: TrackingConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub schedule: ScheduleConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

/// Page fetcher / browser session configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ScraperConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Tried in order; the first one present on the page wins.
    #[serde(default = "default_price_selectors")]
    pub price_selectors: Vec<String>,

    #[serde(default = "default_navigation_timeout_secs")]
    pub navigation_timeout_secs: u64,

    #[serde(default = "default_element_timeout_secs")]
    pub element_timeout_secs: u64,

    /// How often the page is reloaded while waiting for the price element.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    #[serde(default = "default_accept")]
    pub accept: String,

    #[serde(default = "default_accept_language")]
    pub accept_language: String,

    /// Warm-up attempts against the landing page when a session opens.
    #[serde(default = "default_launch_attempts")]
    pub launch_attempts: usize,
}

/// Batch scraper pacing
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BatchConfig {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    #[serde(default = "default_request_delay_min_ms")]
    pub request_delay_min_ms: u64,

    #[serde(default = "default_request_delay_max_ms")]
    pub request_delay_max_ms: u64,

    #[serde(default = "default_batch_delay_ms")]
    pub batch_delay_ms: u64,
}

/// Which tickers are refreshed and where their fallbacks live
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TrackingConfig {
    /// Empty means "every ticker in the fallback table".
    #[serde(default)]
    pub tickers: Vec<String>,

    #[serde(default = "default_fallback_path")]
    pub fallback_path: PathBuf,
}

/// Storage configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StorageConfig {
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    #[serde(default = "default_true")]
    pub run_migrations: bool,
}

/// Wall-clock triggers, evaluated in the process local time zone
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ScheduleConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_crons")]
    pub crons: Vec<String>,
}

/// HTTP trigger / read API
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
}

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("element wait ({element}s) must not exceed the navigation timeout ({navigation}s)")]
    ElementWaitExceedsNavigation { element: u64, navigation: u64 },
    #[error("batch size must be at least 1")]
    ZeroBatchSize,
    #[error("request delay min ({min}ms) is greater than max ({max}ms)")]
    InvertedRequestDelay { min: u64, max: u64 },
    #[error("at least one price selector is required")]
    NoSelectors,
}

// ── Defaults ─────────────────────────────────────────────────────────────────

fn default_base_url() -> String {
    "https://finance.yahoo.com".to_string()
}
fn default_price_selectors() -> Vec<String> {
    vec![
        r#"[data-testid="qsp-price"]"#.to_string(),
        r#"fin-streamer[data-field="regularMarketPrice"]"#.to_string(),
    ]
}
fn default_navigation_timeout_secs() -> u64 {
    60
}
fn default_element_timeout_secs() -> u64 {
    10
}
fn default_poll_interval_ms() -> u64 {
    2000
}
fn default_user_agent() -> String {
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) \
     Chrome/120.0.0.0 Safari/537.36"
        .to_string()
}
fn default_accept() -> String {
    "text/html,application/xhtml+xml,application/xml;q=0.9,image/webp,*/*;q=0.8".to_string()
}
fn default_accept_language() -> String {
    "en-US,en;q=0.9".to_string()
}
fn default_launch_attempts() -> usize {
    3
}
fn default_batch_size() -> usize {
    5
}
fn default_request_delay_min_ms() -> u64 {
    1000
}
fn default_request_delay_max_ms() -> u64 {
    2000
}
fn default_batch_delay_ms() -> u64 {
    5000
}
fn default_fallback_path() -> PathBuf {
    PathBuf::from("config/fallback.json")
}
fn default_db_path() -> PathBuf {
    PathBuf::from("data/prices.duckdb")
}
fn default_true() -> bool {
    true
}
fn default_crons() -> Vec<String> {
    vec!["31 9 * * 1-5".to_string(), "1 16 * * 1-5".to_string()]
}
fn default_bind_addr() -> String {
    "127.0.0.1:8080".to_string()
}

impl Default for ScraperConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            price_selectors: default_price_selectors(),
            navigation_timeout_secs: default_navigation_timeout_secs(),
            element_timeout_secs: default_element_timeout_secs(),
            poll_interval_ms: default_poll_interval_ms(),
            user_agent: default_user_agent(),
            accept: default_accept(),
            accept_language: default_accept_language(),
            launch_attempts: default_launch_attempts(),
        }
    }
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            request_delay_min_ms: default_request_delay_min_ms(),
            request_delay_max_ms: default_request_delay_max_ms(),
            batch_delay_ms: default_batch_delay_ms(),
        }
    }
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self {
            tickers: Vec::new(),
            fallback_path: default_fallback_path(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            run_migrations: true,
        }
    }
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            crons: default_crons(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
        }
    }
}

impl ScraperConfig {
    pub fn navigation_timeout(&self) -> Duration {
        Duration::from_secs(self.navigation_timeout_secs)
    }

    pub fn element_timeout(&self) -> Duration {
        Duration::from_secs(self.element_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl BatchConfig {
    pub fn batch_delay(&self) -> Duration {
        Duration::from_millis(self.batch_delay_ms)
    }
}

// ── Loader ───────────────────────────────────────────────────────────────────

impl AppConfig {
    /// Load configuration from file + environment overrides
    pub fn load() -> Result<Self> {
        dotenv::dotenv().ok();

        let cfg = config::Config::builder()
            .add_source(
                config::File::with_name("config/default")
                    .required(false)
                    .format(config::FileFormat::Toml),
            )
            .add_source(
                config::File::with_name("config/local")
                    .required(false)
                    .format(config::FileFormat::Toml),
            )
            .add_source(config::Environment::with_prefix("ETF").separator("__"))
            .build()?;

        let app_cfg: AppConfig = cfg.try_deserialize()?;
        app_cfg.validate()?;
        Ok(app_cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let s = &self.scraper;
        if s.element_timeout_secs > s.navigation_timeout_secs {
            return Err(ConfigError::ElementWaitExceedsNavigation {
                element: s.element_timeout_secs,
                navigation: s.navigation_timeout_secs,
            });
        }
        if s.price_selectors.is_empty() {
            return Err(ConfigError::NoSelectors);
        }
        let b = &self.batch;
        if b.batch_size == 0 {
            return Err(ConfigError::ZeroBatchSize);
        }
        if b.request_delay_min_ms > b.request_delay_max_ms {
            return Err(ConfigError::InvertedRequestDelay {
                min: b.request_delay_min_ms,
                max: b.request_delay_max_ms,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.validate(), Ok(()));
        assert_eq!(cfg.scraper.navigation_timeout(), Duration::from_secs(60));
        assert_eq!(cfg.scraper.element_timeout(), Duration::from_secs(10));
        assert_eq!(cfg.batch.batch_size, 5);
        assert_eq!(cfg.batch.batch_delay(), Duration::from_secs(5));
        assert_eq!(cfg.schedule.crons, vec!["31 9 * * 1-5", "1 16 * * 1-5"]);
    }

    #[test]
    fn test_element_wait_cannot_exceed_navigation() {
        let mut cfg = AppConfig::default();
        cfg.scraper.element_timeout_secs = 90;
        assert_eq!(
            cfg.validate(),
            Err(ConfigError::ElementWaitExceedsNavigation { element: 90, navigation: 60 })
        );
    }

    #[test]
    fn test_rejects_zero_batch_and_inverted_delay() {
        let mut cfg = AppConfig::default();
        cfg.batch.batch_size = 0;
        assert_eq!(cfg.validate(), Err(ConfigError::ZeroBatchSize));

        let mut cfg = AppConfig::default();
        cfg.batch.request_delay_min_ms = 3000;
        assert!(matches!(cfg.validate(), Err(ConfigError::InvertedRequestDelay { .. })));
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let cfg: AppConfig = config::Config::builder()
            .add_source(config::File::from_str(
                "[batch]\nbatch_size = 3\n[tracking]\ntickers = [\"spy\"]\n",
                config::FileFormat::Toml,
            ))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();
        assert_eq!(cfg.batch.batch_size, 3);
        assert_eq!(cfg.batch.batch_delay_ms, 5000);
        assert_eq!(cfg.tracking.tickers, vec!["spy"]);
        assert_eq!(cfg.scraper.base_url, "https://finance.yahoo.com");
    }
}
