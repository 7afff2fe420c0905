use chrono::NaiveDate;
use thiserror::Error;

/// Fatal conditions that abort a backtest run before any report is produced.
#[derive(Debug, Error, PartialEq)]
pub enum BacktestError {
    #[error("no price bars available for the requested backtest range")]
    EmptyDataset,

    #[error("bars for {symbol} are not in ascending date order ({previous} followed by {current})")]
    UnsortedDates {
        symbol: String,
        previous: NaiveDate,
        current: NaiveDate,
    },

    #[error("duplicate bar for {symbol} on {date}")]
    DuplicateBar { symbol: String, date: NaiveDate },

    #[error("signal for {symbol} on {date} has no matching price bar")]
    UnknownSignal { symbol: String, date: NaiveDate },

    #[error("invalid engine configuration: {0}")]
    InvalidConfig(String),
}
