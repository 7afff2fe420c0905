use crate::context::{AppContext, MarketDataFilters};
use anyhow::Result;
use log::info;
use std::path::Path;

pub async fn run(app: &AppContext, output_path: &Path, filters: MarketDataFilters) -> Result<()> {
    info!(
        "Generating market data snapshot at {}",
        output_path.display()
    );

    let market_data = app.market_data_from_database(filters).await?;

    market_data.save_to_file(output_path)?;
    info!(
        "Market data snapshot with {} bars successfully written to {}",
        market_data.all_bars().len(),
        output_path.display()
    );

    Ok(())
}
