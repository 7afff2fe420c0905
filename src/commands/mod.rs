pub mod backtest;
pub mod export_market_data;
pub mod ingest;
pub mod market_data_snapshot;
