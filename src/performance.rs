use crate::models::{DailySnapshot, Fill, FillSide};
use serde::{Deserialize, Serialize};
use statrs::statistics::Statistics;

const TRADING_DAYS_PER_YEAR: f64 = 252.0;
const RISK_FREE_RATE: f64 = 0.02;
const DAYS_PER_YEAR: f64 = 365.25;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PerformanceSummary {
    pub initial_capital: f64,
    pub final_value: f64,
    pub total_return: f64,
    pub total_return_percent: f64,
    pub cagr: f64,
    pub max_drawdown: f64,
    pub max_drawdown_percent: f64,
    pub sharpe_ratio: f64,
    pub buy_count: usize,
    pub sell_count: usize,
    pub total_fees: f64,
    pub total_taxes: f64,
}

struct DrawdownInfo {
    max_drawdown: f64,
    max_drawdown_percent: f64,
}

pub struct PerformanceCalculator;

impl PerformanceCalculator {
    pub fn summarize(
        initial_capital: f64,
        snapshots: &[DailySnapshot],
        fills: &[Fill],
    ) -> PerformanceSummary {
        let final_value = snapshots
            .last()
            .map(|snapshot| snapshot.total_value)
            .filter(|value| value.is_finite())
            .unwrap_or(initial_capital);

        let total_return = final_value - initial_capital;
        let total_return_percent = if initial_capital > 0.0 {
            total_return / initial_capital * 100.0
        } else {
            0.0
        };

        let drawdown = Self::calculate_max_drawdown(snapshots);

        let buy_count = fills.iter().filter(|fill| fill.side == FillSide::Buy).count();
        let total_fees = fills.iter().map(|fill| fill.fee).sum();
        let total_taxes = fills.iter().map(|fill| fill.tax).sum();

        PerformanceSummary {
            initial_capital,
            final_value,
            total_return,
            total_return_percent,
            cagr: Self::calculate_cagr(initial_capital, final_value, snapshots),
            max_drawdown: drawdown.max_drawdown,
            max_drawdown_percent: drawdown.max_drawdown_percent,
            sharpe_ratio: Self::calculate_sharpe_ratio(snapshots),
            buy_count,
            sell_count: fills.len() - buy_count,
            total_fees,
            total_taxes,
        }
    }

    /// Compound annual growth between the first and last snapshot dates.
    fn calculate_cagr(initial_capital: f64, final_value: f64, snapshots: &[DailySnapshot]) -> f64 {
        let (Some(first), Some(last)) = (snapshots.first(), snapshots.last()) else {
            return 0.0;
        };
        if initial_capital <= 0.0 || !final_value.is_finite() {
            return 0.0;
        }

        let years = (last.date - first.date).num_days() as f64 / DAYS_PER_YEAR;
        if years <= 0.0 {
            return 0.0;
        }

        let ratio = final_value / initial_capital;
        if ratio <= 0.0 {
            return -1.0;
        }

        ratio.powf(1.0 / years) - 1.0
    }

    pub fn calculate_sharpe_ratio(snapshots: &[DailySnapshot]) -> f64 {
        if snapshots.len() < 2 {
            return 0.0;
        }

        let returns: Vec<f64> = snapshots
            .windows(2)
            .map(|window| {
                let previous = window[0].total_value;
                if previous > 0.0 {
                    (window[1].total_value - previous) / previous
                } else {
                    0.0
                }
            })
            .collect();

        let mean_return = returns.iter().mean();
        let std_dev = returns.iter().std_dev();
        if !std_dev.is_finite() || std_dev == 0.0 {
            return 0.0;
        }

        let annualized_return = mean_return * TRADING_DAYS_PER_YEAR;
        let annualized_volatility = std_dev * TRADING_DAYS_PER_YEAR.sqrt();
        (annualized_return - RISK_FREE_RATE) / annualized_volatility
    }

    fn calculate_max_drawdown(snapshots: &[DailySnapshot]) -> DrawdownInfo {
        let mut info = DrawdownInfo {
            max_drawdown: 0.0,
            max_drawdown_percent: 0.0,
        };
        let Some(first) = snapshots.first() else {
            return info;
        };

        let mut peak = first.total_value;
        for snapshot in snapshots {
            if snapshot.total_value > peak {
                peak = snapshot.total_value;
                continue;
            }
            let drawdown = peak - snapshot.total_value;
            let drawdown_percent = if peak > 0.0 {
                drawdown / peak * 100.0
            } else {
                0.0
            };
            info.max_drawdown = info.max_drawdown.max(drawdown);
            info.max_drawdown_percent = info.max_drawdown_percent.max(drawdown_percent);
        }

        info
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use std::collections::BTreeMap;

    fn snapshot(date: NaiveDate, total: f64) -> DailySnapshot {
        DailySnapshot {
            date,
            cash: total,
            positions_value: 0.0,
            total_value: total,
            positions: BTreeMap::new(),
        }
    }

    fn fill(side: FillSide, fee: f64, tax: f64) -> Fill {
        Fill {
            date: NaiveDate::from_ymd_opt(2021, 3, 1).unwrap(),
            symbol: "2330.TW".to_string(),
            side,
            shares: 1_000,
            price: 100.0,
            gross: 100_000.0,
            fee,
            tax,
            cash_before: 0.0,
            cash_after: 0.0,
        }
    }

    #[test]
    fn summarizes_returns_cagr_and_frictions() {
        let start = NaiveDate::from_ymd_opt(2020, 1, 1).unwrap();
        let end = NaiveDate::from_ymd_opt(2022, 1, 1).unwrap();
        let snapshots = vec![snapshot(start, 100_000.0), snapshot(end, 121_000.0)];
        let fills = vec![
            fill(FillSide::Buy, 142.5, 0.0),
            fill(FillSide::Sell, 142.5, 300.0),
        ];

        let summary = PerformanceCalculator::summarize(100_000.0, &snapshots, &fills);
        assert!((summary.total_return - 21_000.0).abs() < 1e-9);
        assert!((summary.total_return_percent - 21.0).abs() < 1e-9);
        let years = (end - start).num_days() as f64 / 365.25;
        let expected_cagr = 1.21_f64.powf(1.0 / years) - 1.0;
        assert!((summary.cagr - expected_cagr).abs() < 1e-12);
        assert_eq!(summary.buy_count, 1);
        assert_eq!(summary.sell_count, 1);
        assert!((summary.total_fees - 285.0).abs() < 1e-9);
        assert!((summary.total_taxes - 300.0).abs() < 1e-9);
    }

    #[test]
    fn tracks_the_deepest_drawdown() {
        let base = NaiveDate::from_ymd_opt(2021, 1, 4).unwrap();
        let values = [100.0, 120.0, 90.0, 110.0, 130.0, 117.0];
        let snapshots: Vec<DailySnapshot> = values
            .iter()
            .enumerate()
            .map(|(i, &v)| snapshot(base + chrono::Duration::days(i as i64), v))
            .collect();

        let summary = PerformanceCalculator::summarize(100.0, &snapshots, &[]);
        assert!((summary.max_drawdown - 30.0).abs() < 1e-9);
        assert!((summary.max_drawdown_percent - 25.0).abs() < 1e-9);
    }

    #[test]
    fn flat_or_short_histories_have_zero_sharpe() {
        let day = NaiveDate::from_ymd_opt(2021, 1, 4).unwrap();
        assert_eq!(
            PerformanceCalculator::calculate_sharpe_ratio(&[snapshot(day, 100.0)]),
            0.0
        );
        let flat = vec![
            snapshot(day, 100.0),
            snapshot(day + chrono::Duration::days(1), 100.0),
            snapshot(day + chrono::Duration::days(2), 100.0),
        ];
        assert_eq!(PerformanceCalculator::calculate_sharpe_ratio(&flat), 0.0);

        let empty = PerformanceCalculator::summarize(50.0, &[], &[]);
        assert_eq!(empty.final_value, 50.0);
        assert_eq!(empty.cagr, 0.0);
    }
}
