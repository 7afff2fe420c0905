use crate::backtester::run_backtest;
use crate::commands::market_data_snapshot::ensure_market_data_file;
use crate::config::{BandConfig, EngineConfig};
use crate::context::{AppContext, MarketDataFilters};
use crate::models::{Fill, SignalSkip};
use crate::report::BacktestReport;
use anyhow::Result;
use log::{debug, info};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;

/// Command-line overrides. Each one is written into the settings map under the
/// same key the database and environment use, so validation is shared.
#[derive(Debug, Default, Clone)]
pub struct BacktestOverrides {
    pub initial_capital: Option<f64>,
    pub lot_size: Option<u64>,
    pub lot_sizing: Option<String>,
    pub valuation_gap: Option<String>,
    pub symbol_order: Option<String>,
    pub band_period: Option<usize>,
    pub band_std_multiplier: Option<f64>,
}

impl BacktestOverrides {
    fn apply(&self, settings: &mut HashMap<String, String>) {
        let mut set = |key: &str, value: Option<String>| {
            if let Some(value) = value {
                settings.insert(key.to_string(), value);
            }
        };
        set(
            "BACKTEST_INITIAL_CAPITAL",
            self.initial_capital.map(|v| v.to_string()),
        );
        set("BACKTEST_LOT_SIZE", self.lot_size.map(|v| v.to_string()));
        set("LOT_SIZING", self.lot_sizing.clone());
        set("VALUATION_GAP_POLICY", self.valuation_gap.clone());
        set("SYMBOL_ORDER", self.symbol_order.clone());
        set("BAND_PERIOD", self.band_period.map(|v| v.to_string()));
        set(
            "BAND_STD_MULTIPLIER",
            self.band_std_multiplier.map(|v| v.to_string()),
        );
    }
}

pub struct BacktestArgs {
    pub filters: MarketDataFilters,
    pub data_file: Option<PathBuf>,
    pub output: Option<PathBuf>,
    pub symbols: Vec<String>,
    pub overrides: BacktestOverrides,
}

pub async fn run(app: &AppContext, args: BacktestArgs) -> Result<()> {
    let mut market_data = match args.data_file.as_deref() {
        Some(path) => {
            ensure_market_data_file(path).await?;
            app.market_data_from_file(path, args.filters)?
        }
        None => app.market_data_from_database(args.filters).await?,
    };

    if !args.symbols.is_empty() {
        let allowed: HashSet<String> = args
            .symbols
            .iter()
            .filter_map(|symbol| crate::bar_utils::normalize_symbol(symbol))
            .collect();
        market_data = market_data.restrict_to_symbols(&allowed)?;
    }

    let mut settings = market_data.settings().clone();
    args.overrides.apply(&mut settings);
    let engine_config = EngineConfig::from_settings_map(&settings)?;
    let band_config = BandConfig::from_settings_map(&settings)?;
    info!(
        "Backtesting {} symbols: capital {:.0}, lot {}, sizing {}, gaps {}, order {}, bands {}x{}",
        market_data.symbols().len(),
        engine_config.initial_capital,
        engine_config.lot_size,
        engine_config.lot_sizing.label(),
        engine_config.valuation_gap.label(),
        engine_config.symbol_order.label(),
        band_config.period,
        band_config.std_multiplier
    );

    let report = run_backtest(&market_data, &engine_config, &band_config)?;
    log_report(&report);

    if let Some(output) = args.output.as_deref() {
        report.write_json(output)?;
        info!("Report {} written to {}", report.id, output.display());
    }

    Ok(())
}

fn log_report(report: &BacktestReport) {
    for fill in &report.fills {
        debug!("{}", format_fill(fill));
    }
    for skip in &report.skips {
        debug!("{}", format_skip(skip));
    }

    info!("Monthly:");
    for month in &report.monthly {
        info!(
            "  {}  cash {:>16.2}  positions {:>16.2}  total {:>16.2}  pnl {}",
            month.period,
            month.cash,
            month.positions_value,
            month.total_value,
            format_pnl(month.period_pnl)
        );
    }

    info!("Semiannual:");
    for half in &report.semiannual {
        let holdings = half
            .positions
            .iter()
            .map(|(symbol, position)| format!("{}x{}", symbol, position.shares))
            .collect::<Vec<_>>()
            .join(" ");
        info!(
            "  {}  total {:>16.2}  pnl {}  holdings [{}]",
            half.period,
            half.total_value,
            format_pnl(half.period_pnl),
            holdings
        );
    }

    let performance = &report.performance;
    info!(
        "Final value {:.2} ({:+.2}%), CAGR {:.2}%, max drawdown {:.2}%, Sharpe {:.2}",
        performance.final_value,
        performance.total_return_percent,
        performance.cagr * 100.0,
        performance.max_drawdown_percent,
        performance.sharpe_ratio
    );
    info!(
        "{} buys, {} sells, {} skipped signals, fees {:.2}, taxes {:.2}",
        performance.buy_count,
        performance.sell_count,
        report.skips.len(),
        performance.total_fees,
        performance.total_taxes
    );
}

fn format_fill(fill: &Fill) -> String {
    format!(
        "{} {:<4} {} x{} @ {:.2} fee {:.2} tax {:.2} cash {:.2}",
        fill.date,
        fill.side.as_str(),
        fill.symbol,
        fill.shares,
        fill.price,
        fill.fee,
        fill.tax,
        fill.cash_after
    )
}

fn format_skip(skip: &SignalSkip) -> String {
    format!(
        "{} skipped {} {}: {}{}",
        skip.date,
        skip.action.as_str(),
        skip.symbol,
        skip.reason.as_str(),
        skip.details
            .as_deref()
            .map(|details| format!(" ({})", details))
            .unwrap_or_default()
    )
}

fn format_pnl(pnl: Option<f64>) -> String {
    match pnl {
        Some(value) => format!("{:+.2}", value),
        None => "n/a".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{FillSide, SignalAction, SkipReason};

    #[test]
    fn overrides_replace_stored_settings() {
        let mut settings = HashMap::new();
        settings.insert("SYMBOL_ORDER".to_string(), "DATA_ORDER".to_string());
        settings.insert("SELL_TAX_RATE".to_string(), "0.0015".to_string());

        BacktestOverrides {
            lot_size: Some(100),
            symbol_order: Some("LEXICOGRAPHIC".to_string()),
            ..BacktestOverrides::default()
        }
        .apply(&mut settings);

        assert_eq!(settings["SYMBOL_ORDER"], "LEXICOGRAPHIC");
        assert_eq!(settings["BACKTEST_LOT_SIZE"], "100");
        assert_eq!(settings["SELL_TAX_RATE"], "0.0015");
        assert!(!settings.contains_key("LOT_SIZING"));
    }

    #[test]
    fn trade_lines_name_side_and_action() {
        let date = chrono::NaiveDate::from_ymd_opt(2023, 6, 9).unwrap();
        let fill = Fill {
            date,
            symbol: "2330.TW".to_string(),
            side: FillSide::Sell,
            shares: 11_000,
            price: 115.0,
            gross: 1_265_000.0,
            fee: 1_800.0,
            tax: 3_795.0,
            cash_before: 8_589.25,
            cash_after: 1_267_994.25,
        };
        assert_eq!(
            format_fill(&fill),
            "2023-06-09 sell 2330.TW x11000 @ 115.00 fee 1800.00 tax 3795.00 cash 1267994.25"
        );

        let skip = SignalSkip {
            date,
            symbol: "2603.TW".to_string(),
            action: SignalAction::Sell,
            reason: SkipReason::NoPosition,
            details: None,
        };
        assert_eq!(
            format_skip(&skip),
            format!("2023-06-09 skipped sell 2603.TW: {}", SkipReason::NoPosition.as_str())
        );
    }

    #[test]
    fn format_pnl_marks_the_first_period() {
        assert_eq!(format_pnl(None), "n/a");
        assert_eq!(format_pnl(Some(12.5)), "+12.50");
        assert_eq!(format_pnl(Some(-3.0)), "-3.00");
    }
}
