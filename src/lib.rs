pub mod aggregation;
pub mod backtester;
pub mod bar_utils;
pub mod commands;
pub mod config;
pub mod context;
pub mod data_context;
pub mod database;
pub mod engine;
pub mod error;
pub mod indicators;
pub mod ingest;
pub mod models;
pub mod performance;
pub mod provider;
pub mod report;
pub(crate) mod retry;
pub mod signals;
