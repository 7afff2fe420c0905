use anyhow::{anyhow, Result};
use band_backtest::aggregation::MonthKey;
use band_backtest::backtester::run_backtest;
use band_backtest::config::{BandConfig, EngineConfig, ValuationGapPolicy};
use band_backtest::data_context::MarketData;
use band_backtest::database::{BarStore, Database, MemoryBarStore};
use band_backtest::error::BacktestError;
use band_backtest::ingest::ingest_symbols;
use band_backtest::models::{FillSide, PriceBar, SignalAction, SkipReason};
use band_backtest::provider::BarProvider;
use band_backtest::report::BacktestReport;
use chrono::{Duration, NaiveDate};
use std::collections::HashMap;
use std::sync::Once;
use tokio_postgres::Client;

const TOTAL_DAYS: i64 = 200;
const INITIAL_CAPITAL: f64 = 1_000_000.0;
const TEST_DATABASE_ENV_VAR: &str = "BAND_BACKTEST_TEST_DATABASE_URL";
const TEST_DB_NAME: &str = "band_backtest_test_pipeline";

fn ensure_test_env() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = env_logger::builder().is_test(true).try_init();
    });
}

fn start_date() -> NaiveDate {
    NaiveDate::from_ymd_opt(2023, 5, 1).unwrap()
}

fn day(offset: i64) -> NaiveDate {
    start_date() + Duration::days(offset)
}

/// Quiet alternating prices around 100 with scripted breakouts.
///
/// 2330.TW drops through its lower band on day 30, has no bars on days 45-46,
/// and spikes through its upper band on day 60. 2603.TW drops on day 40 and
/// spikes on day 100 without ever being held.
fn scripted_close(symbol: &str, offset: i64) -> Option<f64> {
    let quiet = if offset % 2 == 0 { 100.5 } else { 99.5 };
    match (symbol, offset) {
        ("2330.TW", 30) => Some(90.0),
        ("2330.TW", 45) | ("2330.TW", 46) => None,
        ("2330.TW", 60) => Some(115.0),
        ("2603.TW", 40) => Some(90.0),
        ("2603.TW", 100) => Some(115.0),
        _ => Some(quiet),
    }
}

fn scripted_bars(symbol: &str) -> Vec<PriceBar> {
    (0..TOTAL_DAYS)
        .filter_map(|offset| {
            scripted_close(symbol, offset).map(|close| PriceBar {
                date: day(offset),
                symbol: symbol.to_string(),
                open: close,
                high: close + 0.5,
                low: close - 0.5,
                close,
                volume: 2_500_000,
            })
        })
        .collect()
}

struct ScriptedProvider {
    bars: HashMap<String, Vec<PriceBar>>,
}

impl ScriptedProvider {
    fn new() -> Self {
        let mut bars = HashMap::new();
        for symbol in ["2330.TW", "2603.TW"] {
            bars.insert(symbol.to_string(), scripted_bars(symbol));
        }
        Self { bars }
    }
}

impl BarProvider for ScriptedProvider {
    async fn fetch_bars(
        &self,
        symbol: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<PriceBar>> {
        Ok(self
            .bars
            .get(symbol)
            .map(|bars| {
                bars.iter()
                    .filter(|bar| bar.date >= start && bar.date <= end)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }
}

fn universe() -> Vec<String> {
    ["2330.TW", "2603.TW", "0000.TW"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

async fn ingest_into<S: BarStore>(store: &mut S) -> Result<usize> {
    let summary = ingest_symbols(
        &ScriptedProvider::new(),
        store,
        &universe(),
        start_date(),
        day(TOTAL_DAYS - 1),
    )
    .await?;
    assert_eq!(summary.stored_symbols, 2);
    assert_eq!(summary.warnings.len(), 1);
    assert_eq!(summary.warnings[0].symbol, "0000.TW");
    Ok(summary.stored_bars)
}

fn engine_config(valuation_gap: ValuationGapPolicy) -> EngineConfig {
    EngineConfig {
        initial_capital: INITIAL_CAPITAL,
        valuation_gap,
        ..EngineConfig::default()
    }
}

fn assert_report_invariants(report: &BacktestReport, market: &MarketData) {
    assert_eq!(report.daily.len(), market.unique_dates().len());
    assert!(report.daily.windows(2).all(|w| w[0].date < w[1].date));

    for fill in &report.fills {
        assert_eq!(fill.shares % 1_000, 0, "fractional lot in {:?}", fill);
        let expected_after = match fill.side {
            FillSide::Buy => fill.cash_before - fill.gross - fill.fee,
            FillSide::Sell => fill.cash_before + fill.gross - fill.fee - fill.tax,
        };
        assert!((fill.cash_after - expected_after).abs() < 1e-6);
        assert!(fill.cash_after >= 0.0);
    }
    for snapshot in &report.daily {
        assert!(snapshot.cash >= 0.0);
        assert!(snapshot.positions.values().all(|p| p.shares > 0));
    }

    assert_eq!(report.monthly.first().and_then(|m| m.period_pnl), None);
    for (index, month) in report.monthly.iter().enumerate() {
        let last_of_month = report
            .daily
            .iter()
            .filter(|s| MonthKey::of(s.date) == month.period)
            .max_by_key(|s| s.date)
            .unwrap();
        assert_eq!(month.date, last_of_month.date);
        assert_eq!(month.total_value, last_of_month.total_value);
        if index > 0 {
            let previous = report.monthly[index - 1].total_value;
            assert_eq!(month.period_pnl, Some(month.total_value - previous));
        }
    }
}

#[tokio::test]
async fn in_memory_pipeline_trades_the_scripted_breakouts() -> Result<()> {
    ensure_test_env();
    let mut store = MemoryBarStore::new();
    let stored = ingest_into(&mut store).await?;
    assert_eq!(stored, (TOTAL_DAYS as usize) * 2 - 2);

    let market = MarketData::load(&store, start_date(), day(TOTAL_DAYS - 1), HashMap::new()).await?;
    let report = run_backtest(
        &market,
        &engine_config(ValuationGapPolicy::Zero),
        &BandConfig::default(),
    )?;
    assert_report_invariants(&report, &market);

    assert_eq!(report.fills.len(), 2);
    let buy = &report.fills[0];
    assert_eq!((buy.side, buy.symbol.as_str(), buy.date), (FillSide::Buy, "2330.TW", day(30)));
    assert_eq!(buy.shares, 11_000);
    assert!((buy.cash_after - 8_589.25).abs() < 1e-6);

    let sell = &report.fills[1];
    assert_eq!((sell.side, sell.date), (FillSide::Sell, day(60)));
    assert_eq!(sell.shares, 11_000);
    assert!((sell.tax - 3_795.0).abs() < 1e-6);
    assert!((sell.fee - 1_802.625).abs() < 1e-6);
    assert!((sell.cash_after - 1_267_991.625).abs() < 1e-6);

    let skipped: Vec<(SignalAction, SkipReason, NaiveDate)> = report
        .skips
        .iter()
        .map(|skip| (skip.action, skip.reason, skip.date))
        .collect();
    assert_eq!(
        skipped,
        vec![
            (SignalAction::Buy, SkipReason::InsufficientCapital, day(40)),
            (SignalAction::Sell, SkipReason::NoPosition, day(100)),
        ]
    );

    // 2330.TW is held but has no bar on day 45
    let gap = report.daily.iter().find(|s| s.date == day(45)).unwrap();
    assert_eq!(gap.positions["2330.TW"].price, 0.0);
    assert!((gap.total_value - 8_589.25).abs() < 1e-6);

    let final_snapshot = report.daily.last().unwrap();
    assert!(final_snapshot.positions.is_empty());
    assert!((report.performance.final_value - 1_267_991.625).abs() < 1e-6);
    assert_eq!(report.performance.buy_count, 1);
    assert_eq!(report.performance.sell_count, 1);

    let halves: Vec<String> = report.semiannual.iter().map(|h| h.period.to_string()).collect();
    assert_eq!(halves, vec!["2023-H1", "2023-H2"]);
    assert_eq!(report.monthly.len(), 7);

    Ok(())
}

#[tokio::test]
async fn carry_forward_values_gap_days_at_the_last_close() -> Result<()> {
    ensure_test_env();
    let mut store = MemoryBarStore::new();
    ingest_into(&mut store).await?;
    let market = MarketData::load(&store, start_date(), day(TOTAL_DAYS - 1), HashMap::new()).await?;

    let report = run_backtest(
        &market,
        &engine_config(ValuationGapPolicy::CarryForward),
        &BandConfig::default(),
    )?;
    assert_report_invariants(&report, &market);

    for offset in [45, 46] {
        let gap = report.daily.iter().find(|s| s.date == day(offset)).unwrap();
        assert_eq!(gap.positions["2330.TW"].price, 100.5);
        assert!((gap.positions_value - 1_105_500.0).abs() < 1e-6);
    }
    Ok(())
}

#[tokio::test]
async fn empty_window_is_an_empty_dataset() -> Result<()> {
    ensure_test_env();
    let mut store = MemoryBarStore::new();
    ingest_into(&mut store).await?;

    let far_future = NaiveDate::from_ymd_opt(2030, 1, 1).unwrap();
    let err = match MarketData::load(&store, far_future, far_future, HashMap::new()).await {
        Ok(_) => return Err(anyhow!("expected an empty dataset")),
        Err(err) => err,
    };
    assert_eq!(
        err.downcast_ref::<BacktestError>(),
        Some(&BacktestError::EmptyDataset)
    );
    Ok(())
}

#[tokio::test]
async fn snapshot_file_and_json_report_round_trip() -> Result<()> {
    ensure_test_env();
    let mut store = MemoryBarStore::new();
    ingest_into(&mut store).await?;
    let market = MarketData::load(&store, start_date(), day(TOTAL_DAYS - 1), HashMap::new()).await?;

    let dir = std::env::temp_dir().join(format!("band-backtest-{}", uuid::Uuid::new_v4()));
    let snapshot_path = dir.join("market-data.bin");
    market.save_to_file(&snapshot_path)?;
    let restored = MarketData::load_from_file(&snapshot_path)?;

    let config = engine_config(ValuationGapPolicy::Zero);
    let original = run_backtest(&market, &config, &BandConfig::default())?;
    let replayed = run_backtest(&restored, &config, &BandConfig::default())?;
    assert_eq!(original.daily, replayed.daily);
    assert_eq!(original.fills, replayed.fills);

    let report_path = dir.join("report.json");
    original.write_json(&report_path)?;
    let parsed: BacktestReport = serde_json::from_str(&std::fs::read_to_string(&report_path)?)?;
    assert_eq!(parsed.id, original.id);
    assert_eq!(parsed.monthly, original.monthly);
    assert_eq!(parsed.skips, original.skips);

    std::fs::remove_dir_all(&dir).ok();
    Ok(())
}

/// Runs against a real PostgreSQL server when one is configured; skipped otherwise.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn postgres_store_round_trip() -> Result<()> {
    ensure_test_env();
    dotenvy::dotenv().ok();
    let Ok(root_url) = std::env::var(TEST_DATABASE_ENV_VAR) else {
        eprintln!("{} not set; skipping PostgreSQL round trip", TEST_DATABASE_ENV_VAR);
        return Ok(());
    };
    let root = root_url.trim_end_matches('/');
    let admin = connect(&format!("{}/postgres", root)).await?;
    drop_database(&admin, TEST_DB_NAME).await?;
    admin
        .batch_execute(&format!("CREATE DATABASE {} TEMPLATE template0", TEST_DB_NAME))
        .await?;

    let outcome = async {
        let mut db = Database::new(format!("{}/{}", root, TEST_DB_NAME)).await?;
        db.apply_schema().await?;
        let stored = ingest_into(&mut db).await?;
        // second ingest replaces rather than duplicates
        assert_eq!(ingest_into(&mut db).await?, stored);

        let from_db =
            MarketData::load(&db, start_date(), day(TOTAL_DAYS - 1), HashMap::new()).await?;
        let mut memory = MemoryBarStore::new();
        ingest_into(&mut memory).await?;
        let from_memory =
            MarketData::load(&memory, start_date(), day(TOTAL_DAYS - 1), HashMap::new()).await?;
        assert_eq!(from_db.all_bars(), from_memory.all_bars());
        Ok::<(), anyhow::Error>(())
    }
    .await;

    drop_database(&admin, TEST_DB_NAME).await?;
    outcome
}

async fn connect(url: &str) -> Result<Client> {
    let (client, connection) = tokio_postgres::connect(url, tokio_postgres::NoTls).await?;
    tokio::spawn(async move {
        if let Err(err) = connection.await {
            eprintln!("postgres error: {}", err);
        }
    });
    Ok(client)
}

async fn drop_database(client: &Client, db_name: &str) -> Result<()> {
    client
        .execute(
            "SELECT pg_terminate_backend(pid)
             FROM pg_stat_activity
             WHERE datname = $1 AND pid <> pg_backend_pid()",
            &[&db_name],
        )
        .await
        .ok();
    client
        .batch_execute(&format!("DROP DATABASE IF EXISTS {}", db_name))
        .await?;
    Ok(())
}
