use crate::models::{normalise_ticker, Price, PriceQuote, PriceRecord, Source};
use anyhow::{anyhow, Context, Result};
use chrono::{NaiveDateTime, Utc};
use duckdb::{params, Connection};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;
use tracing::info;

// ── Schema ────────────────────────────────────────────────────────────────────

const DDL: &str = r#"
CREATE TABLE IF NOT EXISTS prices (
    ticker      VARCHAR   PRIMARY KEY,
    price       DOUBLE    NOT NULL,
    captured_at TIMESTAMP NOT NULL,
    -- 'primary' | 'fallback'
    source      VARCHAR   NOT NULL
);

CREATE TABLE IF NOT EXISTS distributions (
    ticker      VARCHAR   PRIMARY KEY,
    amount      DOUBLE    NOT NULL,
    updated_at  TIMESTAMP NOT NULL
);

CREATE SEQUENCE IF NOT EXISTS scrape_run_ids START 1;

CREATE TABLE IF NOT EXISTS scrape_runs (
    id              BIGINT PRIMARY KEY DEFAULT nextval('scrape_run_ids'),
    started_at      TIMESTAMP NOT NULL,
    finished_at     TIMESTAMP,
    status          VARCHAR NOT NULL DEFAULT 'running',
    quotes          BIGINT DEFAULT 0,
    fallbacks       BIGINT DEFAULT 0,
    write_errors    BIGINT DEFAULT 0,
    error_msg       VARCHAR
);

CREATE TABLE IF NOT EXISTS schema_version (
    version     INTEGER PRIMARY KEY,
    applied_at  TIMESTAMP NOT NULL
);
"#;

// ── Sink ──────────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
#[error("write of {ticker} failed: {reason}")]
pub struct WriteError {
    pub ticker: String,
    pub reason: String,
}

/// Last-value-wins store keyed by ticker.
pub trait PriceSink: Send + Sync {
    fn persist(&self, quote: &PriceQuote) -> Result<(), WriteError>;
}

/// Finished-run bookkeeping for `scrape_runs`.
#[derive(Debug, Clone, Default)]
pub struct RunRecord<'a> {
    pub quotes: usize,
    pub fallbacks: usize,
    pub write_errors: usize,
    pub error: Option<&'a str>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunLogEntry {
    pub id: i64,
    pub started_at: NaiveDateTime,
    pub finished_at: Option<NaiveDateTime>,
    pub status: String,
    pub quotes: i64,
    pub fallbacks: i64,
    pub write_errors: i64,
    pub error: Option<String>,
}

// ── Repository ────────────────────────────────────────────────────────────────

pub struct Repository {
    conn: Mutex<Connection>,
}

impl Repository {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Could not create dir {:?}", parent))?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open DuckDB at {:?}", path))?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    pub fn open_in_memory() -> Result<Self> {
        Ok(Self { conn: Mutex::new(Connection::open_in_memory()?) })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| anyhow!("DuckDB connection mutex poisoned"))
    }

    pub fn run_migrations(&self) -> Result<()> {
        info!("Running migrations…");
        let conn = self.conn()?;
        conn.execute_batch(DDL).context("DDL failed")?;
        conn.execute(
            "INSERT OR IGNORE INTO schema_version (version, applied_at) VALUES (1, ?)",
            params![Utc::now().naive_utc()],
        )?;
        info!("Migrations done.");
        Ok(())
    }

    // ── Prices ────────────────────────────────────────────────────────────────

    /// Overwrites whatever was stored for the ticker.
    pub fn upsert_quote(&self, quote: &PriceQuote) -> Result<()> {
        self.conn()?
            .execute(
                r#"INSERT INTO prices (ticker, price, captured_at, source)
                   VALUES (?, ?, ?, ?)
                   ON CONFLICT (ticker) DO UPDATE SET
                       price       = excluded.price,
                       captured_at = excluded.captured_at,
                       source      = excluded.source"#,
                params![
                    quote.ticker,
                    quote.price,
                    quote.timestamp.naive_utc(),
                    quote.source.as_str(),
                ],
            )
            .with_context(|| format!("upsert quote {}", quote.ticker))?;
        Ok(())
    }

    pub fn latest_price(&self, ticker: &str) -> Result<Option<PriceRecord>> {
        let ticker = normalise_ticker(ticker);
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            r#"SELECT p.ticker, p.price, p.captured_at, p.source, d.amount
               FROM prices p LEFT JOIN distributions d ON d.ticker = p.ticker
               WHERE p.ticker = ?"#,
        )?;
        let mut rows = stmt.query_map(params![ticker], row_to_record)?;
        match rows.next() {
            Some(r) => Ok(Some(r?)),
            None => Ok(None),
        }
    }

    /// Every stored quote, plus a `Pending` record for each tracked ticker
    /// that has never been stored. Sorted by ticker.
    pub fn latest_prices(&self, tracked: &[String]) -> Result<Vec<PriceRecord>> {
        let mut records: Vec<PriceRecord> = {
            let conn = self.conn()?;
            let mut stmt = conn.prepare(
                r#"SELECT p.ticker, p.price, p.captured_at, p.source, d.amount
                   FROM prices p LEFT JOIN distributions d ON d.ticker = p.ticker
                   ORDER BY p.ticker"#,
            )?;
            let rows = stmt.query_map([], row_to_record)?;
            rows.collect::<Result<_, _>>()?
        };

        for ticker in tracked {
            let ticker = normalise_ticker(ticker);
            if records.iter().any(|r| r.ticker == ticker) {
                continue;
            }
            let distribution = self.distribution(&ticker)?;
            records.push(PriceRecord {
                ticker,
                price: Price::Pending,
                timestamp: None,
                source: None,
                distribution,
            });
        }

        records.sort_by(|a, b| a.ticker.cmp(&b.ticker));
        Ok(records)
    }

    /// Stop tracking a ticker entirely. Returns whether anything was removed.
    pub fn remove_ticker(&self, ticker: &str) -> Result<bool> {
        let ticker = normalise_ticker(ticker);
        let conn = self.conn()?;
        let n = conn.execute("DELETE FROM prices WHERE ticker = ?", params![ticker])?;
        let m = conn.execute("DELETE FROM distributions WHERE ticker = ?", params![ticker])?;
        Ok(n + m > 0)
    }

    pub fn quote_count(&self) -> Result<i64> {
        let conn = self.conn()?;
        let mut s = conn.prepare("SELECT COUNT(*) FROM prices")?;
        Ok(s.query_row([], |r| r.get(0))?)
    }

    pub fn fallback_quote_count(&self) -> Result<i64> {
        let conn = self.conn()?;
        let mut s = conn.prepare("SELECT COUNT(*) FROM prices WHERE source = 'fallback'")?;
        Ok(s.query_row([], |r| r.get(0))?)
    }

    // ── Distributions ─────────────────────────────────────────────────────────

    pub fn upsert_distributions(&self, rows: &[(String, f64)]) -> Result<usize> {
        if rows.is_empty() {
            return Ok(0);
        }
        let conn = self.conn()?;
        let tx = conn.unchecked_transaction()?;
        let now = Utc::now().naive_utc();
        for (ticker, amount) in rows {
            tx.execute(
                r#"INSERT INTO distributions (ticker, amount, updated_at) VALUES (?, ?, ?)
                   ON CONFLICT (ticker) DO UPDATE SET
                       amount = excluded.amount,
                       updated_at = excluded.updated_at"#,
                params![normalise_ticker(ticker), amount, now],
            )
            .with_context(|| format!("upsert distribution {}", ticker))?;
        }
        tx.commit()?;
        Ok(rows.len())
    }

    pub fn distribution(&self, ticker: &str) -> Result<Option<f64>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT amount FROM distributions WHERE ticker = ?")?;
        let mut rows = stmt.query_map(params![normalise_ticker(ticker)], |r| r.get::<_, f64>(0))?;
        match rows.next() {
            Some(r) => Ok(Some(r?)),
            None => Ok(None),
        }
    }

    // ── Scrape run log ────────────────────────────────────────────────────────

    pub fn begin_scrape_run(&self) -> Result<i64> {
        let conn = self.conn()?;
        let id: i64 = conn.query_row(
            "INSERT INTO scrape_runs (started_at, status) VALUES (?, 'running') RETURNING id",
            params![Utc::now().naive_utc()],
            |r| r.get(0),
        )?;
        Ok(id)
    }

    pub fn finish_scrape_run(&self, run_id: i64, record: &RunRecord<'_>) -> Result<()> {
        self.conn()?.execute(
            r#"UPDATE scrape_runs SET
               finished_at = ?, status = ?,
               quotes = ?, fallbacks = ?, write_errors = ?, error_msg = ?
               WHERE id = ?"#,
            params![
                Utc::now().naive_utc(),
                if record.error.is_none() { "success" } else { "error" },
                record.quotes as i64,
                record.fallbacks as i64,
                record.write_errors as i64,
                record.error,
                run_id,
            ],
        )?;
        Ok(())
    }

    pub fn recent_runs(&self, limit: usize) -> Result<Vec<RunLogEntry>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            r#"SELECT id, started_at, finished_at, status, quotes, fallbacks, write_errors, error_msg
               FROM scrape_runs ORDER BY id DESC LIMIT ?"#,
        )?;
        let rows = stmt.query_map(params![limit as i64], |r| {
            Ok(RunLogEntry {
                id: r.get(0)?,
                started_at: r.get(1)?,
                finished_at: r.get(2)?,
                status: r.get(3)?,
                quotes: r.get(4)?,
                fallbacks: r.get(5)?,
                write_errors: r.get(6)?,
                error: r.get(7)?,
            })
        })?;
        Ok(rows.collect::<Result<_, _>>()?)
    }
}

fn row_to_record(r: &duckdb::Row<'_>) -> duckdb::Result<PriceRecord> {
    let price: Option<f64> = r.get(1)?;
    let captured_at: Option<NaiveDateTime> = r.get(2)?;
    let source: Option<String> = r.get(3)?;
    Ok(PriceRecord {
        ticker: r.get(0)?,
        price: Price::from_stored(price),
        timestamp: captured_at.map(|t| t.and_utc()),
        source: source.and_then(|s| s.parse::<Source>().ok()),
        distribution: r.get(4)?,
    })
}

impl PriceSink for Repository {
    fn persist(&self, quote: &PriceQuote) -> Result<(), WriteError> {
        self.upsert_quote(quote).map_err(|e| WriteError {
            ticker: quote.ticker.clone(),
            reason: format!("{:#}", e),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn repo() -> Repository {
        let repo = Repository::open_in_memory().unwrap();
        repo.run_migrations().unwrap();
        repo
    }

    #[test]
    fn test_migrations_are_idempotent() {
        let repo = repo();
        repo.run_migrations().unwrap();
        assert_eq!(repo.quote_count().unwrap(), 0);
    }

    #[test]
    fn test_persist_twice_keeps_one_record() {
        let repo = repo();
        let q = PriceQuote::new("AAA", 12.34, Source::Primary);
        repo.persist(&q).unwrap();
        repo.persist(&q).unwrap();
        assert_eq!(repo.quote_count().unwrap(), 1);

        let rec = repo.latest_price("aaa").unwrap().unwrap();
        assert_eq!(rec.price, Price::Known(12.34));
        assert_eq!(rec.source, Some(Source::Primary));
        assert_eq!(rec.timestamp.map(|t| t.timestamp()), Some(q.timestamp.timestamp()));
    }

    #[test]
    fn test_last_write_wins() {
        let repo = repo();
        repo.persist(&PriceQuote::new("AAA", 12.34, Source::Primary)).unwrap();
        repo.persist(&PriceQuote::new("AAA", 10.00, Source::Fallback)).unwrap();

        let rec = repo.latest_price("AAA").unwrap().unwrap();
        assert_eq!(rec.price, Price::Known(10.0));
        assert_eq!(rec.source, Some(Source::Fallback));
        assert_eq!(repo.fallback_quote_count().unwrap(), 1);
    }

    #[test]
    fn test_latest_prices_joins_distributions_and_pending() {
        let repo = repo();
        repo.persist(&PriceQuote::new("QYLD", 17.2, Source::Primary)).unwrap();
        repo.upsert_distributions(&[("QYLD".into(), 0.17), ("JEPI".into(), 0.39)]).unwrap();

        let tracked = vec!["QYLD".to_string(), "jepi".to_string()];
        let records = repo.latest_prices(&tracked).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].ticker, "JEPI");
        assert_eq!(records[0].price, Price::Pending);
        assert_eq!(records[0].distribution, Some(0.39));
        assert_eq!(records[1].ticker, "QYLD");
        assert_eq!(records[1].distribution, Some(0.17));
        assert!(repo.latest_price("JEPI").unwrap().is_none());
    }

    #[test]
    fn test_remove_ticker() {
        let repo = repo();
        repo.persist(&PriceQuote::new("AAA", 1.0, Source::Primary)).unwrap();
        assert!(repo.remove_ticker("aaa").unwrap());
        assert!(!repo.remove_ticker("aaa").unwrap());
        assert_eq!(repo.quote_count().unwrap(), 0);
    }

    #[test]
    fn test_scrape_run_log() {
        let repo = repo();
        let first = repo.begin_scrape_run().unwrap();
        let second = repo.begin_scrape_run().unwrap();
        assert!(second > first);

        repo.finish_scrape_run(first, &RunRecord { quotes: 3, fallbacks: 1, ..Default::default() })
            .unwrap();
        repo.finish_scrape_run(
            second,
            &RunRecord { error: Some("no fallback price for ZZZ"), ..Default::default() },
        )
        .unwrap();

        let runs = repo.recent_runs(10).unwrap();
        assert_eq!(runs.len(), 2);
        assert_eq!(runs[0].id, second);
        assert_eq!(runs[0].status, "error");
        assert_eq!(runs[1].status, "success");
        assert_eq!(runs[1].quotes, 3);
        assert_eq!(runs[1].fallbacks, 1);
        assert!(runs[1].finished_at.is_some());
    }
}
