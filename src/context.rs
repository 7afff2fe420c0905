use crate::config::merge_env_overrides;
use crate::data_context::MarketData;
use crate::database::Database;
use crate::error::BacktestError;
use anyhow::{anyhow, Result};
use chrono::NaiveDate;
use log::{info, warn};
use std::collections::HashMap;
use std::path::Path;

#[derive(Clone)]
pub struct AppContext {
    database_url: Option<String>,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct MarketDataFilters {
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
}

impl MarketDataFilters {
    pub fn is_empty(&self) -> bool {
        self.start_date.is_none() && self.end_date.is_none()
    }
}

impl AppContext {
    pub fn initialize(database_url: Option<String>) -> Self {
        let database_url = database_url.filter(|url| !url.trim().is_empty());
        Self { database_url }
    }

    /// Connects and makes sure the schema exists.
    pub async fn database(&self) -> Result<Database> {
        let Some(database_url) = self.database_url.as_deref() else {
            return Err(anyhow!(
                "DATABASE_URL must be set to use database-backed commands."
            ));
        };
        let db = Database::new(database_url).await?;
        db.apply_schema().await?;
        Ok(db)
    }

    /// Stored settings overlaid with environment overrides.
    pub async fn settings(&self, db: Option<&Database>) -> Result<HashMap<String, String>> {
        let mut settings = match db {
            Some(db) => db.get_all_settings().await?,
            None => HashMap::new(),
        };
        merge_env_overrides(&mut settings);
        Ok(settings)
    }

    /// Loads the bar universe from the database for the filtered window.
    /// An open-ended window is closed with the stored bar range.
    pub async fn market_data_from_database(
        &self,
        filters: MarketDataFilters,
    ) -> Result<MarketData> {
        let db = self.database().await?;
        let settings = self.settings(Some(&db)).await?;
        let Some((stored_start, stored_end)) = db.get_bar_date_range().await? else {
            return Err(BacktestError::EmptyDataset.into());
        };
        let start = filters.start_date.unwrap_or(stored_start);
        let end = filters.end_date.unwrap_or(stored_end);
        MarketData::load(&db, start, end, settings).await
    }

    /// Loads a bincode snapshot and applies the filters. Environment overrides
    /// are layered over the settings captured in the snapshot.
    pub fn market_data_from_file<P: AsRef<Path>>(
        &self,
        data_file: P,
        filters: MarketDataFilters,
    ) -> Result<MarketData> {
        if self.database_url.is_some() {
            warn!("Using the local market data snapshot; the database is not read for bars.");
        }
        let market_data = MarketData::load_from_file(data_file)?;
        let market_data = if filters.is_empty() {
            market_data
        } else {
            market_data.restrict_to_date_range(filters.start_date, filters.end_date)?
        };

        let mut settings = market_data.settings().clone();
        merge_env_overrides(&mut settings);
        info!(
            "Loaded {} symbols across {} dates from snapshot",
            market_data.symbols().len(),
            market_data.unique_dates().len()
        );
        Ok(market_data.with_settings(settings))
    }
}
