use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One daily OHLCV bar. `(date, symbol)` is unique across the bar universe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceBar {
    pub date: NaiveDate,
    pub symbol: String,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: i64,
}

/// A price bar annotated with its rolling statistics and Bollinger bands.
///
/// The statistics are `None` until the rolling window is full.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndicatorRow {
    pub bar: PriceBar,
    pub sma: Option<f64>,
    pub stddev: Option<f64>,
    pub upper_band: Option<f64>,
    pub lower_band: Option<f64>,
}

impl IndicatorRow {
    pub fn date(&self) -> NaiveDate {
        self.bar.date
    }

    pub fn close(&self) -> f64 {
        self.bar.close
    }

    /// Returns `(lower, upper)` once both bands are defined.
    pub fn bands(&self) -> Option<(f64, f64)> {
        match (self.lower_band, self.upper_band) {
            (Some(lower), Some(upper)) if lower.is_finite() && upper.is_finite() => {
                Some((lower, upper))
            }
            _ => None,
        }
    }
}

/// Trade intent for a (date, symbol) pair. `Hold` means no trade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SignalAction {
    Buy,
    Sell,
    Hold,
}

impl SignalAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalAction::Buy => "buy",
            SignalAction::Sell => "sell",
            SignalAction::Hold => "hold",
        }
    }

    pub fn is_tradable(&self) -> bool {
        matches!(self, SignalAction::Buy | SignalAction::Sell)
    }
}

/// A tradable signal, carrying the close of the bar it fired on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneratedSignal {
    pub date: NaiveDate,
    pub symbol: String,
    pub action: SignalAction,
    pub close: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PositionValuation {
    pub shares: u64,
    pub price: f64,
    pub value: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DailySnapshot {
    pub date: NaiveDate,
    pub cash: f64,
    pub positions_value: f64,
    pub total_value: f64,
    pub positions: BTreeMap<String, PositionValuation>,
}

/// The last snapshot of a calendar period plus the change against the previous period.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeriodSummary<K> {
    pub period: K,
    pub date: NaiveDate,
    pub cash: f64,
    pub positions_value: f64,
    pub total_value: f64,
    pub positions: BTreeMap<String, PositionValuation>,
    pub period_pnl: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FillSide {
    Buy,
    Sell,
}

impl FillSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            FillSide::Buy => "buy",
            FillSide::Sell => "sell",
        }
    }
}

/// An executed transaction and the cash movement it caused.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Fill {
    pub date: NaiveDate,
    pub symbol: String,
    pub side: FillSide,
    pub shares: u64,
    pub price: f64,
    pub gross: f64,
    pub fee: f64,
    pub tax: f64,
    pub cash_before: f64,
    pub cash_after: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SkipReason {
    InsufficientCapital,
    NoPosition,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkipReason::InsufficientCapital => "insufficient_capital",
            SkipReason::NoPosition => "no_position",
        }
    }
}

/// A signal that was recognised but not executed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalSkip {
    pub date: NaiveDate,
    pub symbol: String,
    pub action: SignalAction,
    pub reason: SkipReason,
    pub details: Option<String>,
}

/// Non-fatal data problem surfaced to the caller, e.g. a provider returning no bars.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataWarning {
    pub symbol: String,
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(lower: Option<f64>, upper: Option<f64>) -> IndicatorRow {
        IndicatorRow {
            bar: PriceBar {
                date: NaiveDate::from_ymd_opt(2024, 1, 2).unwrap(),
                symbol: "2330".to_string(),
                open: 1.0,
                high: 1.0,
                low: 1.0,
                close: 1.0,
                volume: 0,
            },
            sma: None,
            stddev: None,
            upper_band: upper,
            lower_band: lower,
        }
    }

    #[test]
    fn bands_require_both_sides() {
        assert_eq!(row(Some(1.0), Some(2.0)).bands(), Some((1.0, 2.0)));
        assert_eq!(row(None, Some(2.0)).bands(), None);
        assert_eq!(row(Some(f64::NAN), Some(2.0)).bands(), None);
    }
}
