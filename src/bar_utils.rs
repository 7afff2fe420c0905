use crate::models::PriceBar;
use std::collections::HashMap;

/// Groups bars (by reference) keyed by symbol, each group date-ascending.
pub fn group_all_bars_by_symbol(bars: &[PriceBar]) -> HashMap<String, Vec<&PriceBar>> {
    let mut grouped: HashMap<String, Vec<&PriceBar>> = HashMap::new();
    for bar in bars {
        grouped.entry(bar.symbol.clone()).or_default().push(bar);
    }
    for values in grouped.values_mut() {
        values.sort_by(|a, b| a.date.cmp(&b.date));
    }
    grouped
}

/// Normalizes a symbol string by trimming whitespace and uppercasing.
pub fn normalize_symbol(value: &str) -> Option<String> {
    let normalized = value.trim().to_uppercase();
    if normalized.is_empty() {
        None
    } else {
        Some(normalized)
    }
}

#[cfg(test)]
mod tests {
    use super::{group_all_bars_by_symbol, normalize_symbol};
    use crate::models::PriceBar;
    use chrono::{Duration, NaiveDate};

    fn bar(symbol: &str, date: NaiveDate, close: f64) -> PriceBar {
        PriceBar {
            date,
            symbol: symbol.to_string(),
            open: close,
            high: close,
            low: close,
            close,
            volume: 1_000,
        }
    }

    #[test]
    fn groups_and_sorts_per_symbol() {
        let base = NaiveDate::from_ymd_opt(2020, 1, 2).unwrap();
        let bars = vec![
            bar("2330.TW", base + Duration::days(1), 104.0),
            bar("2330.TW", base, 101.0),
            bar("0050.TW", base, 50.5),
        ];

        let grouped = group_all_bars_by_symbol(&bars);
        assert_eq!(grouped.len(), 2);
        assert!(grouped.get("2454.TW").is_none());

        let tsmc = grouped.get("2330.TW").expect("2330.TW data missing");
        assert_eq!(tsmc.len(), 2);
        assert!(tsmc[0].date < tsmc[1].date);
        assert_eq!(grouped["0050.TW"].len(), 1);
    }

    #[test]
    fn normalizes_symbols() {
        assert_eq!(normalize_symbol(" 2330.tw "), Some("2330.TW".to_string()));
        assert_eq!(normalize_symbol("   "), None);
    }
}
