use log::{debug, info};
use rayon::prelude::*;

use crate::config::BandConfig;
use crate::data_context::MarketData;
use crate::error::BacktestError;
use crate::indicators::annotate_bars;
use crate::models::{GeneratedSignal, IndicatorRow, SignalAction};

/// Band crossover between two consecutive rows of the same symbol.
///
/// Only the bar that crosses a band fires; a close that stays outside the band
/// on the following bar is a `Hold`. Rows without defined bands never fire.
pub fn crossover_action(previous: &IndicatorRow, current: &IndicatorRow) -> SignalAction {
    let (Some((prev_lower, prev_upper)), Some((lower, upper))) =
        (previous.bands(), current.bands())
    else {
        return SignalAction::Hold;
    };

    let prev_close = previous.close();
    let close = current.close();

    if close > upper && prev_close <= prev_upper {
        SignalAction::Sell
    } else if close < lower && prev_close >= prev_lower {
        SignalAction::Buy
    } else {
        SignalAction::Hold
    }
}

/// Builds a `GeneratedSignal` when the action is tradable.
pub fn maybe_create_generated_signal(
    row: &IndicatorRow,
    action: SignalAction,
) -> Option<GeneratedSignal> {
    if !action.is_tradable() {
        return None;
    }

    Some(GeneratedSignal {
        date: row.date(),
        symbol: row.bar.symbol.clone(),
        action,
        close: row.close(),
    })
}

/// Emits the tradable signals of one symbol's strictly date-ascending rows.
pub fn generate_signals(rows: &[IndicatorRow]) -> Result<Vec<GeneratedSignal>, BacktestError> {
    let mut signals = Vec::new();

    for window in rows.windows(2) {
        let (previous, current) = (&window[0], &window[1]);
        if current.date() <= previous.date() {
            return Err(BacktestError::UnsortedDates {
                symbol: current.bar.symbol.clone(),
                previous: previous.date(),
                current: current.date(),
            });
        }

        let action = crossover_action(previous, current);
        if let Some(signal) = maybe_create_generated_signal(current, action) {
            signals.push(signal);
        }
    }

    Ok(signals)
}

/// Annotates and evaluates every symbol in parallel, then merges the result by
/// `(date, symbol)` so execution can start from a complete, ordered signal set.
pub fn generate_universe_signals(
    market: &MarketData,
    bands: &BandConfig,
) -> Result<Vec<GeneratedSignal>, BacktestError> {
    let per_symbol: Vec<Vec<GeneratedSignal>> = market
        .symbols()
        .par_iter()
        .map(|symbol| {
            let bars = market.bars_for_symbol(symbol);
            let rows = annotate_bars(&bars, bands);
            let signals = generate_signals(&rows)?;
            debug!(
                "Evaluated {} bars for {}; {} signal{}",
                rows.len(),
                symbol,
                signals.len(),
                if signals.len() == 1 { "" } else { "s" }
            );
            Ok(signals)
        })
        .collect::<Result<_, BacktestError>>()?;

    let mut merged: Vec<GeneratedSignal> = per_symbol.into_iter().flatten().collect();
    merged.sort_by(|a, b| a.date.cmp(&b.date).then_with(|| a.symbol.cmp(&b.symbol)));

    let buys = merged
        .iter()
        .filter(|signal| signal.action == SignalAction::Buy)
        .count();
    info!(
        "Generated {} signals ({} buy / {} sell) across {} symbols",
        merged.len(),
        buys,
        merged.len() - buys,
        market.symbols().len()
    );

    Ok(merged)
}
