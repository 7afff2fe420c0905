use crate::aggregation::{monthly, semiannual};
use crate::bar_utils::group_all_bars_by_symbol;
use crate::config::{BandConfig, EngineConfig};
use crate::data_context::MarketData;
use crate::engine::{build_trading_days, Engine};
use crate::error::BacktestError;
use crate::models::DataWarning;
use crate::performance::PerformanceCalculator;
use crate::report::{BacktestReport, ReportSettings};
use crate::signals::generate_universe_signals;
use anyhow::Result;
use chrono::Utc;
use log::{info, warn};
use std::time::Instant;
use uuid::Uuid;

/// Symbols with too few bars to ever form a band. They stay in the universe
/// (they can still be valued) but can never produce a signal.
fn coverage_warnings(market: &MarketData, bands: &BandConfig) -> Vec<DataWarning> {
    let grouped = group_all_bars_by_symbol(market.all_bars());
    market
        .symbols()
        .iter()
        .filter_map(|symbol| {
            let count = grouped.get(symbol).map(Vec::len).unwrap_or(0);
            // one extra bar is needed for the crossover comparison
            if count > bands.period {
                return None;
            }
            Some(DataWarning {
                symbol: symbol.clone(),
                message: format!(
                    "only {} bar{} in range; a {}-day band needs at least {} to signal",
                    count,
                    if count == 1 { "" } else { "s" },
                    bands.period,
                    bands.period + 1
                ),
            })
        })
        .collect()
}

/// Runs the full pipeline over `market`: bands, signals, execution, rollups
/// and the performance summary. Any precondition failure aborts with no report.
pub fn run_backtest(
    market: &MarketData,
    engine_config: &EngineConfig,
    band_config: &BandConfig,
) -> Result<BacktestReport> {
    let (Some(&start_date), Some(&end_date)) =
        (market.unique_dates().first(), market.unique_dates().last())
    else {
        return Err(BacktestError::EmptyDataset.into());
    };

    let engine = Engine::new(engine_config.clone())?;
    let started = Instant::now();

    let warnings = coverage_warnings(market, band_config);
    for warning in &warnings {
        warn!("{}: {}", warning.symbol, warning.message);
    }

    let signals = generate_universe_signals(market, band_config)?;
    let days = build_trading_days(market, &signals)?;
    let run = engine.run(&days)?;

    let monthly = monthly(&run.snapshots);
    let semiannual = semiannual(&run.snapshots);
    let performance =
        PerformanceCalculator::summarize(engine_config.initial_capital, &run.snapshots, &run.fills);

    info!(
        "Backtest {} - {} finished in {:.2}s: final value {:.2} ({:+.2}%), {} months, {} half-years",
        start_date,
        end_date,
        started.elapsed().as_secs_f64(),
        performance.final_value,
        performance.total_return_percent,
        monthly.len(),
        semiannual.len()
    );

    Ok(BacktestReport {
        id: Uuid::new_v4(),
        generated_at: Utc::now(),
        start_date,
        end_date,
        symbols: market.symbols().to_vec(),
        settings: ReportSettings::new(engine_config, band_config),
        performance,
        daily: run.snapshots,
        monthly,
        semiannual,
        fills: run.fills,
        skips: run.skips,
        warnings,
    })
}
