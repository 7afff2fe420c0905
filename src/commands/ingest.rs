use crate::context::AppContext;
use crate::ingest::ingest_symbols;
use crate::provider::YahooChartProvider;
use anyhow::{anyhow, Result};
use chrono::NaiveDate;
use log::{info, warn};

pub async fn run(
    app: &AppContext,
    symbols: &[String],
    start: NaiveDate,
    end: NaiveDate,
) -> Result<()> {
    if symbols.is_empty() {
        return Err(anyhow!("At least one symbol is required"));
    }

    let mut db = app.database().await?;
    let provider = YahooChartProvider::new()?;

    let summary = ingest_symbols(&provider, &mut db, symbols, start, end).await?;
    if !summary.warnings.is_empty() {
        warn!(
            "{} symbol(s) returned no data: {}",
            summary.warnings.len(),
            summary
                .warnings
                .iter()
                .map(|warning| warning.symbol.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        );
    }
    info!(
        "Ingest complete: {} bars stored for {} symbol(s)",
        summary.stored_bars, summary.stored_symbols
    );

    Ok(())
}
