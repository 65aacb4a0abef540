//! Loaders for the fallback table (JSON or CSV) and the distribution dataset.

use crate::fallback::FallbackTable;
use crate::models::{normalise_ticker, FallbackEntry};
use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::Path;
use tracing::{debug, info, warn};

#[derive(Debug, Deserialize)]
struct JsonFallback {
    price: f64,
    #[serde(default)]
    distribution: f64,
}

/// Load the fallback table, picking the format from the file extension.
pub fn load_fallback_table(path: &Path) -> Result<FallbackTable> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default();

    let entries = match ext.as_str() {
        "json" => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read {:?}", path))?;
            parse_fallback_json(&text).with_context(|| format!("Bad fallback JSON in {:?}", path))?
        }
        "csv" => {
            let reader = csv::ReaderBuilder::new()
                .has_headers(true)
                .flexible(true)
                .trim(csv::Trim::All)
                .from_path(path)
                .with_context(|| format!("Failed to open {:?}", path))?;
            parse_fallback_csv(reader)?
        }
        other => bail!("Unsupported fallback format '{}' for {:?}", other, path),
    };

    let table = FallbackTable::new(entries)?;
    info!("Loaded {} fallback entries from {:?}", table.len(), path);
    Ok(table)
}

/// `{ "TICKER": { "price": 10.0, "distribution": 0.1 }, ... }`, in file order.
pub fn parse_fallback_json(text: &str) -> Result<Vec<FallbackEntry>> {
    let raw: serde_json::Map<String, serde_json::Value> = serde_json::from_str(text)?;
    raw.into_iter()
        .map(|(ticker, value)| {
            let f: JsonFallback = serde_json::from_value(value)
                .with_context(|| format!("Fallback entry {}", ticker))?;
            Ok(FallbackEntry { ticker, price: f.price, distribution: f.distribution })
        })
        .collect()
}

/// `ticker,price,distribution`; the distribution column is optional.
pub fn parse_fallback_csv<R: std::io::Read>(mut reader: csv::Reader<R>) -> Result<Vec<FallbackEntry>> {
    let mut entries = Vec::new();
    for (i, record) in reader.records().enumerate() {
        let record = record.with_context(|| format!("Fallback row {}", i + 1))?;
        let ticker = record.get(0).unwrap_or("").to_string();
        if ticker.is_empty() {
            warn!("Fallback row {} has no ticker, skipping", i + 1);
            continue;
        }
        let price: f64 = record
            .get(1)
            .unwrap_or("")
            .parse()
            .with_context(|| format!("Fallback row {} ({}): bad price", i + 1, ticker))?;
        let distribution: f64 = match record.get(2) {
            Some(s) if !s.is_empty() => s
                .parse()
                .with_context(|| format!("Fallback row {} ({}): bad distribution", i + 1, ticker))?,
            _ => 0.0,
        };
        entries.push(FallbackEntry { ticker, price, distribution });
    }
    Ok(entries)
}

/// Distribution dataset CSV: `ticker,distribution`. Malformed rows are skipped.
pub fn load_distributions(path: &Path) -> Result<Vec<(String, f64)>> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_path(path)
        .with_context(|| format!("Failed to open {:?}", path))?;

    let mut rows = Vec::new();
    for (i, result) in reader.records().enumerate() {
        let record = match result {
            Ok(r) => r,
            Err(e) => {
                warn!("Row {} in {:?}: {}", i + 1, path, e);
                continue;
            }
        };
        let ticker = normalise_ticker(record.get(0).unwrap_or(""));
        let amount = record.get(1).and_then(|s| s.parse::<f64>().ok());
        match amount {
            Some(a) if !ticker.is_empty() && a.is_finite() && a >= 0.0 => rows.push((ticker, a)),
            _ => debug!("Row {} in {:?}: unusable distribution row", i + 1, path),
        }
    }

    info!("{:?}: {} distributions loaded", path, rows.len());
    Ok(rows)
}
