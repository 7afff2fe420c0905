use crate::database::BarStore;
use crate::error::BacktestError;
use crate::models::PriceBar;
use anyhow::{anyhow, Context, Result};
use chrono::prelude::*;
use log::info;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;
use std::sync::Arc;

const MARKET_DATA_SNAPSHOT_VERSION: u32 = 1;
const SNAPSHOT_ALLOWED_SETTINGS: [&str; 10] = crate::config::ENGINE_SETTING_KEYS;

#[derive(Serialize, Deserialize)]
struct MarketDataSnapshot {
    version: u32,
    generated_at: DateTime<Utc>,
    symbols: Vec<String>,
    unique_dates: Vec<NaiveDate>,
    bars: Vec<PriceBar>,
    #[serde(default)]
    settings: HashMap<String, String>,
}

fn scrub_snapshot_settings(settings: &HashMap<String, String>) -> HashMap<String, String> {
    settings
        .iter()
        .filter(|(key, _)| SNAPSHOT_ALLOWED_SETTINGS.contains(&key.as_str()))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect()
}

/// Validated, date-ordered bar universe shared by signal generation and execution.
///
/// Bars keep their original relative order within a date, which is the order
/// the engine uses when `SymbolOrder::DataOrder` is configured.
#[derive(Clone)]
pub struct MarketData {
    all_bars: Arc<Vec<PriceBar>>,
    unique_dates: Arc<Vec<NaiveDate>>,
    symbols: Arc<Vec<String>>,
    bars_by_symbol_indices: Arc<HashMap<String, Vec<usize>>>,
    settings: Arc<HashMap<String, String>>,
}

impl MarketData {
    pub fn from_bars(bars: Vec<PriceBar>, settings: HashMap<String, String>) -> Result<Self> {
        if bars.is_empty() {
            return Err(BacktestError::EmptyDataset.into());
        }

        let mut all_bars = bars;
        // stable: keeps the provider/store order within each date
        all_bars.sort_by_key(|bar| bar.date);

        let mut seen: HashSet<(NaiveDate, &str)> = HashSet::with_capacity(all_bars.len());
        let mut symbols: Vec<String> = Vec::new();
        let mut known_symbols: HashSet<&str> = HashSet::new();
        let mut unique_date_set = BTreeSet::new();
        for bar in &all_bars {
            if !seen.insert((bar.date, bar.symbol.as_str())) {
                return Err(BacktestError::DuplicateBar {
                    symbol: bar.symbol.clone(),
                    date: bar.date,
                }
                .into());
            }
            if known_symbols.insert(bar.symbol.as_str()) {
                symbols.push(bar.symbol.clone());
            }
            unique_date_set.insert(bar.date);
        }
        let unique_dates: Vec<NaiveDate> = unique_date_set.into_iter().collect();

        let bars_by_symbol_indices = Self::build_bar_index(&all_bars);

        Ok(Self {
            all_bars: Arc::new(all_bars),
            unique_dates: Arc::new(unique_dates),
            symbols: Arc::new(symbols),
            bars_by_symbol_indices: Arc::new(bars_by_symbol_indices),
            settings: Arc::new(settings),
        })
    }

    /// Reads the `[start, end]` range from a store. An empty range is `EmptyDataset`.
    pub async fn load<S: BarStore>(
        store: &S,
        start_date: NaiveDate,
        end_date: NaiveDate,
        settings: HashMap<String, String>,
    ) -> Result<Self> {
        if start_date > end_date {
            return Err(anyhow!(
                "Invalid market data date range: {} is after {}",
                start_date,
                end_date
            ));
        }

        info!(
            "Loading bars from {} to {}...",
            start_date.format("%Y-%m-%d"),
            end_date.format("%Y-%m-%d")
        );
        let bars = store.read_bars(start_date, end_date).await?;
        let market = Self::from_bars(bars, settings)?;
        info!(
            "Loaded {} bars for {} symbols across {} unique dates",
            market.all_bars.len(),
            market.symbols.len(),
            market.unique_dates.len()
        );
        Ok(market)
    }

    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!("Loading market data snapshot from {}", path.display());
        let file = File::open(path).with_context(|| {
            format!("Failed to open market data snapshot at {}", path.display())
        })?;
        let reader = BufReader::new(file);
        let snapshot: MarketDataSnapshot =
            bincode::deserialize_from(reader).context("Snapshot decode failed")?;

        if snapshot.version != MARKET_DATA_SNAPSHOT_VERSION {
            return Err(anyhow!(
                "Market data snapshot version mismatch (found {}, expected {})",
                snapshot.version,
                MARKET_DATA_SNAPSHOT_VERSION
            ));
        }

        let market = Self::from_bars(snapshot.bars, snapshot.settings)?;
        if market.symbols.len() != snapshot.symbols.len()
            || market.unique_dates.len() != snapshot.unique_dates.len()
        {
            return Err(anyhow!(
                "Market data snapshot header does not match its bars ({} symbols / {} dates declared, {} / {} found)",
                snapshot.symbols.len(),
                snapshot.unique_dates.len(),
                market.symbols.len(),
                market.unique_dates.len()
            ));
        }
        Ok(market)
    }

    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create snapshot directory {}", parent.display())
                })?;
            }
        }

        let file = File::create(path).with_context(|| {
            format!(
                "Unable to create market data snapshot at {}",
                path.display()
            )
        })?;
        let mut writer = BufWriter::new(file);
        let snapshot = MarketDataSnapshot {
            version: MARKET_DATA_SNAPSHOT_VERSION,
            generated_at: Utc::now(),
            symbols: self.symbols.as_ref().clone(),
            unique_dates: self.unique_dates.as_ref().clone(),
            bars: self.all_bars.as_ref().clone(),
            settings: scrub_snapshot_settings(self.settings.as_ref()),
        };
        bincode::serialize_into(&mut writer, &snapshot)
            .context("Failed to serialize market data snapshot")?;
        writer
            .flush()
            .context("Failed to flush market data snapshot to disk")?;
        Ok(())
    }

    fn build_bar_index(bars: &[PriceBar]) -> HashMap<String, Vec<usize>> {
        let mut bars_by_symbol_indices: HashMap<String, Vec<usize>> = HashMap::new();
        for (index, bar) in bars.iter().enumerate() {
            bars_by_symbol_indices
                .entry(bar.symbol.clone())
                .or_default()
                .push(index);
        }
        for indices in bars_by_symbol_indices.values_mut() {
            indices.sort_by_key(|&idx| bars[idx].date);
        }
        bars_by_symbol_indices
    }

    pub fn symbols(&self) -> &[String] {
        self.symbols.as_slice()
    }

    pub fn unique_dates(&self) -> &[NaiveDate] {
        self.unique_dates.as_slice()
    }

    pub fn all_bars(&self) -> &[PriceBar] {
        self.all_bars.as_slice()
    }

    pub fn settings(&self) -> &HashMap<String, String> {
        self.settings.as_ref()
    }

    pub fn with_settings(mut self, settings: HashMap<String, String>) -> Self {
        self.settings = Arc::new(settings);
        self
    }

    /// Date-ordered copy of one symbol's bars; empty for an unknown symbol.
    pub fn bars_for_symbol(&self, symbol: &str) -> Vec<PriceBar> {
        let all = self.all_bars();
        self.bars_by_symbol_indices
            .get(symbol)
            .map(|indices| indices.iter().map(|&idx| all[idx].clone()).collect())
            .unwrap_or_default()
    }

    /// Bars grouped per date, ascending, each group in its original order.
    pub fn bars_by_date(&self) -> Vec<(NaiveDate, &[PriceBar])> {
        let all = self.all_bars();
        let mut groups = Vec::with_capacity(self.unique_dates.len());
        let mut start = 0;
        for end in 1..=all.len() {
            if end == all.len() || all[end].date != all[start].date {
                groups.push((all[start].date, &all[start..end]));
                start = end;
            }
        }
        groups
    }

    pub fn restrict_to_symbols(self, allowed_symbols: &HashSet<String>) -> Result<Self> {
        if allowed_symbols.is_empty() {
            return Err(anyhow!(
                "Symbol filtering requires at least one allowed symbol"
            ));
        }

        let filtered: Vec<PriceBar> = self
            .all_bars
            .iter()
            .filter(|bar| allowed_symbols.contains(&bar.symbol))
            .cloned()
            .collect();

        if filtered.is_empty() {
            return Err(anyhow!(
                "Restricting the market data to {} symbol(s) removed all bars",
                allowed_symbols.len()
            ));
        }

        Self::from_bars(filtered, self.settings.as_ref().clone())
    }

    pub fn restrict_to_date_range(
        self,
        start_date: Option<NaiveDate>,
        end_date: Option<NaiveDate>,
    ) -> Result<Self> {
        if start_date.is_none() && end_date.is_none() {
            return Ok(self);
        }

        if let (Some(start), Some(end)) = (start_date, end_date) {
            if start > end {
                return Err(anyhow!(
                    "Invalid market data date range: {} is after {}",
                    start,
                    end
                ));
            }
        }

        let range_description = match (start_date, end_date) {
            (Some(start), Some(end)) => {
                format!("{} - {}", start.format("%Y-%m-%d"), end.format("%Y-%m-%d"))
            }
            (Some(start), None) => format!("{} onward", start.format("%Y-%m-%d")),
            (None, Some(end)) => format!("through {}", end.format("%Y-%m-%d")),
            _ => "entire dataset".to_string(),
        };

        let filtered: Vec<PriceBar> = self
            .all_bars
            .iter()
            .filter(|bar| {
                if let Some(start) = start_date {
                    if bar.date < start {
                        return false;
                    }
                }
                if let Some(end) = end_date {
                    if bar.date > end {
                        return false;
                    }
                }
                true
            })
            .cloned()
            .collect();

        if filtered.is_empty() {
            return Err(BacktestError::EmptyDataset).with_context(|| {
                format!("No bar data remains after restricting to {}", range_description)
            });
        }

        let before_dates = self.unique_dates.len();
        let restricted = Self::from_bars(filtered, self.settings.as_ref().clone())?;
        info!(
            "Restricted market data to {} ({} dates -> {})",
            range_description,
            before_dates,
            restricted.unique_dates.len()
        );
        Ok(restricted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn bar(symbol: &str, day: i64, close: f64) -> PriceBar {
        PriceBar {
            date: NaiveDate::from_ymd_opt(2023, 1, 2).unwrap() + Duration::days(day),
            symbol: symbol.to_string(),
            open: close,
            high: close,
            low: close,
            close,
            volume: 10_000,
        }
    }

    #[test]
    fn keeps_data_order_within_each_date() {
        let market = MarketData::from_bars(
            vec![
                bar("2603.TW", 1, 10.0),
                bar("2330.TW", 0, 500.0),
                bar("2603.TW", 0, 9.0),
                bar("2330.TW", 1, 505.0),
            ],
            HashMap::new(),
        )
        .unwrap();

        assert_eq!(market.unique_dates().len(), 2);
        assert_eq!(market.symbols(), &["2330.TW".to_string(), "2603.TW".to_string()]);

        let groups = market.bars_by_date();
        assert_eq!(groups.len(), 2);
        let day_zero: Vec<&str> = groups[0].1.iter().map(|b| b.symbol.as_str()).collect();
        let day_one: Vec<&str> = groups[1].1.iter().map(|b| b.symbol.as_str()).collect();
        assert_eq!(day_zero, vec!["2330.TW", "2603.TW"]);
        assert_eq!(day_one, vec!["2603.TW", "2330.TW"]);

        let tsmc = market.bars_for_symbol("2330.TW");
        assert_eq!(tsmc.len(), 2);
        assert!(tsmc[0].date < tsmc[1].date);
        assert!(market.bars_for_symbol("0000.TW").is_empty());
    }

    #[test]
    fn rejects_empty_and_duplicate_universes() {
        let empty = MarketData::from_bars(Vec::new(), HashMap::new()).err().unwrap();
        assert_eq!(
            empty.downcast_ref::<BacktestError>(),
            Some(&BacktestError::EmptyDataset)
        );

        let duplicate = MarketData::from_bars(
            vec![bar("2330.TW", 0, 500.0), bar("2330.TW", 0, 501.0)],
            HashMap::new(),
        )
        .err()
        .unwrap();
        assert!(matches!(
            duplicate.downcast_ref::<BacktestError>(),
            Some(BacktestError::DuplicateBar { .. })
        ));
    }

    #[test]
    fn date_restriction_to_an_empty_window_is_an_empty_dataset() {
        let market =
            MarketData::from_bars(vec![bar("2330.TW", 0, 500.0)], HashMap::new()).unwrap();
        let start = NaiveDate::from_ymd_opt(2030, 1, 1).unwrap();
        let err = market
            .restrict_to_date_range(Some(start), None)
            .err()
            .unwrap();
        assert_eq!(
            err.downcast_ref::<BacktestError>(),
            Some(&BacktestError::EmptyDataset)
        );
    }

    #[test]
    fn snapshot_file_round_trip_preserves_bars_and_scrubs_settings() {
        let mut settings = HashMap::new();
        settings.insert("SELL_TAX_RATE".to_string(), "0.0015".to_string());
        settings.insert("DATABASE_PASSWORD".to_string(), "secret".to_string());
        let market = MarketData::from_bars(
            vec![bar("2330.TW", 0, 500.0), bar("2330.TW", 1, 505.0)],
            settings,
        )
        .unwrap();

        let path = std::env::temp_dir().join(format!(
            "band-backtest-snapshot-{}.bin",
            uuid::Uuid::new_v4()
        ));
        market.save_to_file(&path).unwrap();
        let restored = MarketData::load_from_file(&path).unwrap();
        let _ = fs::remove_file(&path);

        assert_eq!(restored.all_bars(), market.all_bars());
        assert_eq!(
            restored.settings().get("SELL_TAX_RATE").map(String::as_str),
            Some("0.0015")
        );
        assert!(restored.settings().get("DATABASE_PASSWORD").is_none());
    }
}
