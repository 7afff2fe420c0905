use crate::config::BandConfig;
use crate::models::{IndicatorRow, PriceBar};

/// Rolling arithmetic mean; `None` until `period` values have been seen.
pub fn calculate_sma(prices: &[f64], period: usize) -> Vec<Option<f64>> {
    if prices.is_empty() {
        return Vec::new();
    }
    if period == 0 || prices.len() < period {
        return vec![None; prices.len()];
    }

    let mut sma_values = Vec::with_capacity(prices.len());
    for _ in 0..period - 1 {
        sma_values.push(None);
    }

    let mut window_sum: f64 = prices[..period].iter().sum();
    sma_values.push(Some(window_sum / period as f64));
    for i in period..prices.len() {
        window_sum += prices[i] - prices[i - period];
        sma_values.push(Some(window_sum / period as f64));
    }

    sma_values
}

/// Rolling sample standard deviation (n - 1 denominator), aligned with `calculate_sma`.
pub fn calculate_rolling_std(prices: &[f64], period: usize) -> Vec<Option<f64>> {
    if prices.is_empty() {
        return Vec::new();
    }
    if period < 2 || prices.len() < period {
        return vec![None; prices.len()];
    }

    let mut std_values = vec![None; prices.len()];
    let start = period - 1;
    for i in start..prices.len() {
        let window = &prices[i + 1 - period..=i];
        let mean = window.iter().sum::<f64>() / period as f64;
        let variance =
            window.iter().map(|&val| (val - mean).powi(2)).sum::<f64>() / (period - 1) as f64;
        std_values[i] = Some(variance.sqrt());
    }

    std_values
}

/// Returns `(upper, middle, lower)` Bollinger bands aligned to `prices`.
pub fn calculate_bollinger_bands(
    prices: &[f64],
    period: usize,
    std_multiplier: f64,
) -> (Vec<Option<f64>>, Vec<Option<f64>>, Vec<Option<f64>>) {
    let middle = calculate_sma(prices, period);
    let deviations = calculate_rolling_std(prices, period);

    let mut upper = Vec::with_capacity(prices.len());
    let mut lower = Vec::with_capacity(prices.len());
    for (mean, std) in middle.iter().zip(deviations.iter()) {
        match (mean, std) {
            (Some(mean), Some(std)) => {
                upper.push(Some(mean + std_multiplier * std));
                lower.push(Some(mean - std_multiplier * std));
            }
            _ => {
                upper.push(None);
                lower.push(None);
            }
        }
    }

    (upper, middle, lower)
}

/// Annotates one symbol's date-ordered bars with rolling statistics and bands.
pub fn annotate_bars(bars: &[PriceBar], bands: &BandConfig) -> Vec<IndicatorRow> {
    let closes: Vec<f64> = bars.iter().map(|bar| bar.close).collect();
    let (upper, middle, lower) =
        calculate_bollinger_bands(&closes, bands.period, bands.std_multiplier);
    let deviations = calculate_rolling_std(&closes, bands.period);

    bars.iter()
        .enumerate()
        .map(|(i, bar)| IndicatorRow {
            bar: bar.clone(),
            sma: middle[i],
            stddev: deviations[i],
            upper_band: upper[i],
            lower_band: lower[i],
        })
        .collect()
}
