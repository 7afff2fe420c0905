use crate::bar_utils::normalize_symbol;
use crate::database::BarStore;
use crate::models::{DataWarning, PriceBar};
use crate::provider::BarProvider;
use crate::retry::retry_store_operation;
use anyhow::{anyhow, Context, Result};
use chrono::NaiveDate;
use futures::stream::{self, StreamExt};
use indicatif::{ProgressBar, ProgressStyle};
use log::{info, warn};
use std::collections::HashSet;

const MAX_CONCURRENT_FETCHES: usize = 8;

#[derive(Debug, Default, Clone, PartialEq)]
pub struct IngestSummary {
    pub requested_symbols: usize,
    pub stored_symbols: usize,
    pub stored_bars: usize,
    pub warnings: Vec<DataWarning>,
}

fn fetch_concurrency(symbol_count: usize) -> usize {
    let limit = std::cmp::min(MAX_CONCURRENT_FETCHES, std::cmp::max(1, num_cpus::get() * 2));
    std::cmp::max(1, std::cmp::min(symbol_count, limit))
}

fn unique_symbols(symbols: &[String]) -> Vec<String> {
    let mut seen = HashSet::new();
    symbols
        .iter()
        .filter_map(|raw| normalize_symbol(raw))
        .filter(|symbol| seen.insert(symbol.clone()))
        .collect()
}

/// Fetches every symbol from `provider` and replaces its stored history.
///
/// A symbol that yields no bars (or whose fetch keeps failing) is reported as a
/// `DataWarning` and leaves its stored bars untouched. Store failures abort.
pub async fn ingest_symbols<P, S>(
    provider: &P,
    store: &mut S,
    symbols: &[String],
    start: NaiveDate,
    end: NaiveDate,
) -> Result<IngestSummary>
where
    P: BarProvider,
    S: BarStore,
{
    if start > end {
        return Err(anyhow!(
            "Invalid ingest date range: {} is after {}",
            start,
            end
        ));
    }

    let symbols = unique_symbols(symbols);
    if symbols.is_empty() {
        return Err(anyhow!("No symbols to ingest"));
    }

    info!(
        "Ingesting {} symbol{} from {} to {}",
        symbols.len(),
        if symbols.len() == 1 { "" } else { "s" },
        start.format("%Y-%m-%d"),
        end.format("%Y-%m-%d")
    );

    let pb = ProgressBar::new(symbols.len() as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")
            .context("invalid progress bar template")?
            .progress_chars("#>-"),
    );

    let mut summary = IngestSummary {
        requested_symbols: symbols.len(),
        ..IngestSummary::default()
    };

    let mut fetches = stream::iter(symbols.iter().cloned())
        .map(|symbol| async move {
            let fetched: Result<Vec<PriceBar>> = retry_store_operation!(
                format!("fetching {}", symbol),
                provider.fetch_bars(&symbol, start, end)
            );
            (symbol, fetched)
        })
        .buffer_unordered(fetch_concurrency(symbols.len()));

    while let Some((symbol, fetched)) = fetches.next().await {
        pb.set_message(symbol.clone());
        let bars = match fetched {
            Ok(bars) if bars.is_empty() => {
                let warning = DataWarning {
                    symbol: symbol.clone(),
                    message: format!("no bars between {} and {}", start, end),
                };
                warn!("Data unavailable for {}: {}", warning.symbol, warning.message);
                summary.warnings.push(warning);
                pb.inc(1);
                continue;
            }
            Ok(bars) => bars,
            Err(err) => {
                let warning = DataWarning {
                    symbol: symbol.clone(),
                    message: format!("fetch failed: {:#}", err),
                };
                warn!("Data unavailable for {}: {}", warning.symbol, warning.message);
                summary.warnings.push(warning);
                pb.inc(1);
                continue;
            }
        };

        let stored = retry_store_operation!(
            format!("storing bars for {}", symbol),
            store.replace_bars(&symbol, &bars)
        )
        .with_context(|| format!("failed to store bars for {}", symbol))?;

        summary.stored_symbols += 1;
        summary.stored_bars += stored;
        pb.inc(1);
    }

    pb.finish_and_clear();
    info!(
        "Stored {} bars for {}/{} symbols ({} warning{})",
        summary.stored_bars,
        summary.stored_symbols,
        summary.requested_symbols,
        summary.warnings.len(),
        if summary.warnings.len() == 1 { "" } else { "s" }
    );

    Ok(summary)
}
