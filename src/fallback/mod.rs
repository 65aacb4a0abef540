//! Last-known-good prices, consulted when a live fetch fails.

use crate::models::{normalise_ticker, FallbackEntry};
use std::collections::HashMap;
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum FallbackError {
    #[error("no fallback entry for {0}")]
    NotFound(String),
    #[error("fallback price for {ticker} must be positive, got {price}")]
    NonPositivePrice { ticker: String, price: f64 },
    #[error("duplicate fallback entry for {0}")]
    Duplicate(String),
}

/// Read-only ticker → fallback mapping. Keeps insertion order.
#[derive(Debug, Clone, Default)]
pub struct FallbackTable {
    entries: Vec<FallbackEntry>,
    index: HashMap<String, usize>,
}

impl FallbackTable {
    pub fn new(entries: impl IntoIterator<Item = FallbackEntry>) -> Result<Self, FallbackError> {
        let mut table = Self::default();
        for mut entry in entries {
            entry.ticker = normalise_ticker(&entry.ticker);
            if !(entry.price.is_finite() && entry.price > 0.0) {
                return Err(FallbackError::NonPositivePrice {
                    ticker: entry.ticker,
                    price: entry.price,
                });
            }
            if table.index.contains_key(&entry.ticker) {
                return Err(FallbackError::Duplicate(entry.ticker));
            }
            table.index.insert(entry.ticker.clone(), table.entries.len());
            table.entries.push(entry);
        }
        Ok(table)
    }

    pub fn lookup(&self, ticker: &str) -> Result<&FallbackEntry, FallbackError> {
        let key = normalise_ticker(ticker);
        self.index
            .get(&key)
            .map(|&i| &self.entries[i])
            .ok_or(FallbackError::NotFound(key))
    }

    pub fn tickers(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.ticker.clone()).collect()
    }

    pub fn entries(&self) -> &[FallbackEntry] {
        &self.entries
    }

    /// Tracked tickers that would have nothing to fall back to.
    pub fn missing<'a>(&self, tracked: &'a [String]) -> Vec<&'a str> {
        tracked
            .iter()
            .filter(|t| self.lookup(t).is_err())
            .map(|t| t.as_str())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
