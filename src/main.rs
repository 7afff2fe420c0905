use anyhow::{anyhow, Result};
use band_backtest::{
    commands::{
        backtest::{self, BacktestArgs, BacktestOverrides},
        export_market_data, ingest,
    },
    config::parse_date_arg,
    context::{AppContext, MarketDataFilters},
};
use chrono::NaiveDate;
use clap::{Args, Parser, Subcommand};
use log::info;
use std::env;
use std::path::PathBuf;

const DEFAULT_MARKET_DATA_FILE: &str = "data/market-data.bin";

#[derive(Parser)]
#[command(name = "band-backtest")]
#[command(about = "Bollinger band crossover backtester with board-lot execution")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Clone, Default)]
struct DateRange {
    /// First date to include (YYYY-MM-DD)
    #[arg(long, value_parser = parse_date_arg)]
    start: Option<NaiveDate>,
    /// Last date to include (YYYY-MM-DD)
    #[arg(long, value_parser = parse_date_arg)]
    end: Option<NaiveDate>,
}

impl From<DateRange> for MarketDataFilters {
    fn from(range: DateRange) -> Self {
        Self {
            start_date: range.start,
            end_date: range.end,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Download daily bars and replace the stored history of each symbol
    Ingest {
        /// Symbols to fetch, e.g. 2330.TW
        #[arg(value_delimiter = ',', num_args = 1.., required = true)]
        symbols: Vec<String>,
        /// First date to fetch (YYYY-MM-DD)
        #[arg(long, value_parser = parse_date_arg)]
        start: NaiveDate,
        /// Last date to fetch (YYYY-MM-DD)
        #[arg(long, value_parser = parse_date_arg)]
        end: NaiveDate,
    },
    /// Run the band strategy over stored bars and report monthly and semiannual results
    Backtest {
        #[command(flatten)]
        range: DateRange,
        /// Read bars from a market data snapshot instead of the database
        #[arg(long = "data-file", value_name = "PATH")]
        data_file: Option<PathBuf>,
        /// Write the full report as JSON
        #[arg(short, long, value_name = "PATH")]
        output: Option<PathBuf>,
        /// Restrict the universe to these symbols
        #[arg(long, value_delimiter = ',')]
        symbols: Vec<String>,
        #[arg(long)]
        initial_capital: Option<f64>,
        #[arg(long)]
        lot_size: Option<u64>,
        /// GROSS_PRICE or FEE_INCLUSIVE
        #[arg(long)]
        lot_sizing: Option<String>,
        /// ZERO or CARRY_FORWARD
        #[arg(long)]
        valuation_gap: Option<String>,
        /// DATA_ORDER or LEXICOGRAPHIC
        #[arg(long)]
        symbol_order: Option<String>,
        #[arg(long)]
        band_period: Option<usize>,
        #[arg(long)]
        band_std_multiplier: Option<f64>,
    },
    /// Export stored bars and settings to a snapshot for offline backtests
    ExportMarketData {
        #[command(flatten)]
        range: DateRange,
        /// Destination file for the snapshot
        #[arg(short, long = "output", value_name = "PATH")]
        output: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    let Cli { command } = cli;

    let database_url = env::var("DATABASE_URL").ok();
    if database_url.is_none() && command_requires_database(&command) {
        return Err(anyhow!(
            "DATABASE_URL must be set for this command. For offline backtests, pass --data-file."
        ));
    }
    let app_context = AppContext::initialize(database_url);
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    info!("Starting band-backtest. Simulated results only; not financial advice.");

    match command {
        Commands::Ingest {
            symbols,
            start,
            end,
        } => {
            ingest::run(&app_context, &symbols, start, end).await?;
        }
        Commands::Backtest {
            range,
            data_file,
            output,
            symbols,
            initial_capital,
            lot_size,
            lot_sizing,
            valuation_gap,
            symbol_order,
            band_period,
            band_std_multiplier,
        } => {
            let args = BacktestArgs {
                filters: range.into(),
                data_file,
                output,
                symbols,
                overrides: BacktestOverrides {
                    initial_capital,
                    lot_size,
                    lot_sizing,
                    valuation_gap,
                    symbol_order,
                    band_period,
                    band_std_multiplier,
                },
            };
            backtest::run(&app_context, args).await?;
        }
        Commands::ExportMarketData { range, output } => {
            let output_path = resolve_market_data_path(output);
            export_market_data::run(&app_context, &output_path, range.into()).await?;
        }
    }

    Ok(())
}

fn resolve_market_data_path(cli_value: Option<PathBuf>) -> PathBuf {
    cli_value.unwrap_or_else(|| PathBuf::from(DEFAULT_MARKET_DATA_FILE))
}

fn command_requires_database(command: &Commands) -> bool {
    match command {
        Commands::Backtest { data_file, .. } => data_file.is_none(),
        Commands::Ingest { .. } | Commands::ExportMarketData { .. } => true,
    }
}
