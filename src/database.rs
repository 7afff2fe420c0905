use crate::error::BacktestError;
use crate::models::PriceBar;
use anyhow::{anyhow, Context, Result};
use chrono::NaiveDate;
use log::{debug, error};
use std::collections::{BTreeMap, HashMap, HashSet};
use tokio_postgres::{Client, NoTls};

const SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS bars (
    symbol TEXT NOT NULL,
    date DATE NOT NULL,
    open DOUBLE PRECISION NOT NULL,
    high DOUBLE PRECISION NOT NULL,
    low DOUBLE PRECISION NOT NULL,
    close DOUBLE PRECISION NOT NULL,
    volume BIGINT NOT NULL,
    PRIMARY KEY (symbol, date)
);
CREATE INDEX IF NOT EXISTS bars_date_idx ON bars (date);
CREATE TABLE IF NOT EXISTS settings (
    setting_key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
";

/// Durable bar storage keyed by `(date, symbol)`.
#[allow(async_fn_in_trait)]
pub trait BarStore {
    /// Replaces every stored bar of `symbol` with `bars`. Running it twice with
    /// the same input leaves the store unchanged.
    ///
    /// Every bar must belong to `symbol` and dates must be unique; otherwise
    /// nothing is written.
    async fn replace_bars(&mut self, symbol: &str, bars: &[PriceBar]) -> Result<usize>;

    /// Bars with `start <= date <= end`, ordered by `(date, symbol)`.
    async fn read_bars(&self, start: NaiveDate, end: NaiveDate) -> Result<Vec<PriceBar>>;
}

fn check_replacement_bars(symbol: &str, bars: &[PriceBar]) -> Result<()> {
    let mut dates = HashSet::with_capacity(bars.len());
    for bar in bars {
        if bar.symbol != symbol {
            return Err(anyhow!(
                "Refusing to store a {} bar under symbol {}",
                bar.symbol,
                symbol
            ));
        }
        if !dates.insert(bar.date) {
            return Err(BacktestError::DuplicateBar {
                symbol: symbol.to_string(),
                date: bar.date,
            }
            .into());
        }
    }
    Ok(())
}

pub struct Database {
    client: Client,
}

impl Database {
    pub async fn new<S: AsRef<str>>(database_url: S) -> Result<Self> {
        let database_url = database_url.as_ref().to_string();
        let (client, connection) = tokio_postgres::connect(&database_url, NoTls)
            .await
            .with_context(|| format!("failed to connect to PostgreSQL at {}", database_url))?;

        tokio::spawn(async move {
            if let Err(err) = connection.await {
                error!("PostgreSQL connection error: {}", err);
            }
        });

        Ok(Self { client })
    }

    /// Creates the `bars` and `settings` tables when they are missing.
    pub async fn apply_schema(&self) -> Result<()> {
        self.client
            .batch_execute(SCHEMA_SQL)
            .await
            .context("failed to apply database schema")?;
        Ok(())
    }

    pub async fn get_all_settings(&self) -> Result<HashMap<String, String>> {
        let rows = self
            .client
            .query("SELECT setting_key, value FROM settings", &[])
            .await?;
        let mut settings = HashMap::with_capacity(rows.len());
        for row in rows {
            settings.insert(row.get::<_, String>(0), row.get::<_, String>(1));
        }
        Ok(settings)
    }

    pub async fn get_bar_date_range(&self) -> Result<Option<(NaiveDate, NaiveDate)>> {
        let row = self
            .client
            .query_one("SELECT MIN(date), MAX(date) FROM bars", &[])
            .await?;
        let min: Option<NaiveDate> = row.get(0);
        let max: Option<NaiveDate> = row.get(1);
        Ok(min.zip(max))
    }
}

impl BarStore for Database {
    async fn replace_bars(&mut self, symbol: &str, bars: &[PriceBar]) -> Result<usize> {
        check_replacement_bars(symbol, bars)?;

        let tx = self.client.transaction().await?;
        let removed = tx
            .execute("DELETE FROM bars WHERE symbol = $1", &[&symbol])
            .await
            .with_context(|| format!("failed to clear stored bars for {}", symbol))?;

        let stmt = tx
            .prepare(
                "INSERT INTO bars (symbol, date, open, high, low, close, volume)
                 VALUES ($1, $2, $3, $4, $5, $6, $7)",
            )
            .await?;

        let mut inserted = 0u64;
        for bar in bars {
            inserted += tx
                .execute(
                    &stmt,
                    &[
                        &bar.symbol,
                        &bar.date,
                        &bar.open,
                        &bar.high,
                        &bar.low,
                        &bar.close,
                        &bar.volume,
                    ],
                )
                .await
                .with_context(|| format!("failed to insert {} bar for {}", bar.date, symbol))?;
        }

        tx.commit().await?;
        debug!(
            "Replaced {} stored bars for {} with {}",
            removed, symbol, inserted
        );
        Ok(inserted as usize)
    }

    async fn read_bars(&self, start: NaiveDate, end: NaiveDate) -> Result<Vec<PriceBar>> {
        let rows = self
            .client
            .query(
                "SELECT symbol, date, open, high, low, close, volume
                 FROM bars
                 WHERE date BETWEEN $1 AND $2
                 ORDER BY date, symbol",
                &[&start, &end],
            )
            .await?;

        let mut bars = Vec::with_capacity(rows.len());
        for row in rows {
            bars.push(PriceBar {
                symbol: row.get(0),
                date: row.get(1),
                open: row.get(2),
                high: row.get(3),
                low: row.get(4),
                close: row.get(5),
                volume: row.get(6),
            });
        }

        Ok(bars)
    }
}

/// Process-local store for offline runs and tests.
#[derive(Debug, Default, Clone)]
pub struct MemoryBarStore {
    bars_by_symbol: BTreeMap<String, Vec<PriceBar>>,
}

impl MemoryBarStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn symbol_count(&self) -> usize {
        self.bars_by_symbol.len()
    }

    pub fn bar_count(&self) -> usize {
        self.bars_by_symbol.values().map(Vec::len).sum()
    }
}

impl BarStore for MemoryBarStore {
    async fn replace_bars(&mut self, symbol: &str, bars: &[PriceBar]) -> Result<usize> {
        check_replacement_bars(symbol, bars)?;
        if bars.is_empty() {
            self.bars_by_symbol.remove(symbol);
            return Ok(0);
        }
        let mut stored = bars.to_vec();
        stored.sort_by_key(|bar| bar.date);
        let count = stored.len();
        self.bars_by_symbol.insert(symbol.to_string(), stored);
        Ok(count)
    }

    async fn read_bars(&self, start: NaiveDate, end: NaiveDate) -> Result<Vec<PriceBar>> {
        let mut bars: Vec<PriceBar> = self
            .bars_by_symbol
            .values()
            .flat_map(|bars| bars.iter())
            .filter(|bar| bar.date >= start && bar.date <= end)
            .cloned()
            .collect();
        bars.sort_by(|a, b| a.date.cmp(&b.date).then_with(|| a.symbol.cmp(&b.symbol)));
        Ok(bars)
    }
}
