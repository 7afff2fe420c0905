use anyhow::{anyhow, Result};
use std::path::Path;
use tokio::fs;

/// Fails early with a hint when an offline run points at a missing snapshot.
pub async fn ensure_market_data_file(path: &Path) -> Result<()> {
    if fs::metadata(path).await.is_ok() {
        return Ok(());
    }

    Err(anyhow!(
        "Market data snapshot not found at {}. Generate it with `export-market-data` or drop --data-file to read bars from the database.",
        path.display()
    ))
}
