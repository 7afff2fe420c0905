use crate::aggregation::{HalfYearKey, MonthKey};
use crate::config::{BandConfig, EngineConfig};
use crate::models::{DailySnapshot, DataWarning, Fill, PeriodSummary, SignalSkip};
use crate::performance::PerformanceSummary;
use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::Path;
use uuid::Uuid;

/// Engine and band parameters a report was produced with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportSettings {
    pub initial_capital: f64,
    pub lot_size: u64,
    pub buy_fee_rate: f64,
    pub sell_fee_rate: f64,
    pub sell_tax_rate: f64,
    pub lot_sizing: String,
    pub valuation_gap: String,
    pub symbol_order: String,
    pub band_period: usize,
    pub band_std_multiplier: f64,
}

impl ReportSettings {
    pub fn new(engine: &EngineConfig, bands: &BandConfig) -> Self {
        Self {
            initial_capital: engine.initial_capital,
            lot_size: engine.lot_size,
            buy_fee_rate: engine.buy_fee_rate,
            sell_fee_rate: engine.sell_fee_rate,
            sell_tax_rate: engine.sell_tax_rate,
            lot_sizing: engine.lot_sizing.label().to_string(),
            valuation_gap: engine.valuation_gap.label().to_string(),
            symbol_order: engine.symbol_order.label().to_string(),
            band_period: bands.period,
            band_std_multiplier: bands.std_multiplier,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BacktestReport {
    pub id: Uuid,
    pub generated_at: DateTime<Utc>,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub symbols: Vec<String>,
    pub settings: ReportSettings,
    pub performance: PerformanceSummary,
    pub daily: Vec<DailySnapshot>,
    pub monthly: Vec<PeriodSummary<MonthKey>>,
    pub semiannual: Vec<PeriodSummary<HalfYearKey>>,
    pub fills: Vec<Fill>,
    pub skips: Vec<SignalSkip>,
    pub warnings: Vec<DataWarning>,
}

impl BacktestReport {
    pub fn write_json<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create report directory {}", parent.display())
                })?;
            }
        }

        let file = File::create(path)
            .with_context(|| format!("Unable to create report at {}", path.display()))?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer_pretty(&mut writer, self).context("Failed to serialize report")?;
        writer
            .flush()
            .with_context(|| format!("Failed to flush report to {}", path.display()))?;
        Ok(())
    }
}
