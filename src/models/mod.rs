use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

// ── Provenance ────────────────────────────────────────────────────────────────

/// Where a quote's price came from.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    /// Live fetch from the vendor quote page.
    Primary,
    /// Curated value from the fallback table.
    Fallback,
}

impl Source {
    pub fn as_str(&self) -> &'static str {
        match self {
            Source::Primary => "primary",
            Source::Fallback => "fallback",
        }
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Source {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "primary" => Ok(Source::Primary),
            "fallback" => Ok(Source::Fallback),
            other => Err(format!("unknown quote source '{}'", other)),
        }
    }
}

// ── Quote ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PriceQuote {
    pub ticker: String,
    pub price: f64,
    pub timestamp: DateTime<Utc>,
    pub source: Source,
}

impl PriceQuote {
    pub fn new(ticker: &str, price: f64, source: Source) -> Self {
        Self {
            ticker: normalise_ticker(ticker),
            price,
            timestamp: Utc::now(),
            source,
        }
    }
}

// ── Fallback ──────────────────────────────────────────────────────────────────

/// Manually curated last-known-good values for one ticker.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FallbackEntry {
    pub ticker: String,
    pub price: f64,
    #[serde(default)]
    pub distribution: f64,
}

// ── Batch result ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TickerError {
    pub ticker: String,
    pub message: String,
}

/// Outcome of one completed batch run, in processing order.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ScrapeBatchResult {
    pub results: Vec<PriceQuote>,
    pub errors: Vec<TickerError>,
}

impl ScrapeBatchResult {
    pub fn primary_count(&self) -> usize {
        self.results.iter().filter(|q| q.source == Source::Primary).count()
    }

    pub fn fallback_count(&self) -> usize {
        self.results.iter().filter(|q| q.source == Source::Fallback).count()
    }
}

// ── Progress ──────────────────────────────────────────────────────────────────

/// Emitted by the batch scraper while a run is in flight.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum BatchProgressEvent {
    RunStarted {
        tickers: usize,
        batches: usize,
    },
    TickerDone {
        batch_index: usize,
        ticker_index: usize,
        ticker: String,
        price: f64,
    },
    TickerFallback {
        batch_index: usize,
        ticker_index: usize,
        ticker: String,
        price: f64,
        message: String,
    },
    BatchPaused {
        batch_index: usize,
        #[serde(with = "millis")]
        delay: Duration,
    },
    RunFinished {
        results: usize,
        errors: usize,
    },
}

mod millis {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }
}

// ── Read side ─────────────────────────────────────────────────────────────────

/// A price as shown to readers. Replaces "TBD" / "N/A" string sentinels.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(tag = "status", content = "value", rename_all = "lowercase")]
pub enum Price {
    Known(f64),
    /// Tracked, but no quote has been stored yet.
    Pending,
    /// Stored value is not a usable price.
    Unavailable,
}

impl Price {
    pub fn from_stored(value: Option<f64>) -> Self {
        match value {
            Some(v) if v.is_finite() && v > 0.0 => Price::Known(v),
            Some(_) => Price::Unavailable,
            None => Price::Pending,
        }
    }
}

impl fmt::Display for Price {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Price::Known(v) => write!(f, "{:.2}", v),
            Price::Pending => f.write_str("pending"),
            Price::Unavailable => f.write_str("unavailable"),
        }
    }
}

/// Latest stored quote for a ticker, joined with its distribution.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PriceRecord {
    pub ticker: String,
    pub price: Price,
    pub timestamp: Option<DateTime<Utc>>,
    pub source: Option<Source>,
    pub distribution: Option<f64>,
}

pub fn normalise_ticker(s: &str) -> String {
    s.trim().to_uppercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_roundtrips_through_str() {
        assert_eq!("primary".parse::<Source>(), Ok(Source::Primary));
        assert_eq!(" Fallback ".parse::<Source>(), Ok(Source::Fallback));
        assert!("yahoo".parse::<Source>().is_err());
        assert_eq!(Source::Fallback.to_string(), "fallback");
    }

    #[test]
    fn test_quote_serialises_lowercase_source() {
        let q = PriceQuote::new(" spy ", 512.3, Source::Primary);
        assert_eq!(q.ticker, "SPY");
        let json = serde_json::to_value(&q).unwrap();
        assert_eq!(json["source"], "primary");
        assert_eq!(json["ticker"], "SPY");
    }

    #[test]
    fn test_price_from_stored() {
        assert_eq!(Price::from_stored(Some(12.5)), Price::Known(12.5));
        assert_eq!(Price::from_stored(Some(0.0)), Price::Unavailable);
        assert_eq!(Price::from_stored(Some(f64::NAN)), Price::Unavailable);
        assert_eq!(Price::from_stored(None), Price::Pending);
        assert_eq!(Price::Pending.to_string(), "pending");
        assert_eq!(Price::Known(17.2).to_string(), "17.20");
    }

    #[test]
    fn test_batch_result_counts() {
        let r = ScrapeBatchResult {
            results: vec![
                PriceQuote::new("AAA", 1.0, Source::Primary),
                PriceQuote::new("BBB", 2.0, Source::Fallback),
                PriceQuote::new("CCC", 3.0, Source::Primary),
            ],
            errors: vec![],
        };
        assert_eq!(r.primary_count(), 2);
        assert_eq!(r.fallback_count(), 1);
    }
}
