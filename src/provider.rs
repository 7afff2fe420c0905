use crate::models::PriceBar;
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, NaiveDate};
use log::debug;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::time::Duration;
use tokio::time::sleep;

const DEFAULT_CHART_BASE_URL: &str = "https://query2.finance.yahoo.com/v8/finance/chart";
const REQUEST_DELAY: Duration = Duration::from_millis(250);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Source of daily bars for one symbol.
///
/// An empty result is valid: the symbol may be unknown or may simply have no
/// trading days in the requested range.
#[allow(async_fn_in_trait)]
pub trait BarProvider {
    async fn fetch_bars(&self, symbol: &str, start: NaiveDate, end: NaiveDate)
        -> Result<Vec<PriceBar>>;
}

#[derive(Debug, Deserialize)]
struct ChartResponse {
    chart: ChartResult,
}

#[derive(Debug, Deserialize)]
struct ChartResult {
    result: Option<Vec<ChartData>>,
    error: Option<ChartError>,
}

#[derive(Debug, Deserialize)]
struct ChartError {
    code: String,
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChartData {
    meta: Option<ChartMeta>,
    timestamp: Option<Vec<i64>>,
    indicators: Indicators,
}

#[derive(Debug, Deserialize)]
struct ChartMeta {
    gmtoffset: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct Indicators {
    quote: Vec<QuoteData>,
}

#[derive(Debug, Default, Deserialize)]
struct QuoteData {
    #[serde(default)]
    open: Vec<Option<f64>>,
    #[serde(default)]
    high: Vec<Option<f64>>,
    #[serde(default)]
    low: Vec<Option<f64>>,
    #[serde(default)]
    close: Vec<Option<f64>>,
    #[serde(default)]
    volume: Vec<Option<i64>>,
}

/// Daily bars from the Yahoo v8 chart endpoint.
pub struct YahooChartProvider {
    http: Client,
    base_url: String,
}

impl YahooChartProvider {
    pub fn new() -> Result<Self> {
        Self::with_base_url(DEFAULT_CHART_BASE_URL)
    }

    pub fn with_base_url(base_url: &str) -> Result<Self> {
        let http = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .user_agent("Mozilla/5.0 (X11; Linux x86_64) band-backtest")
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn chart_query(start: NaiveDate, end: NaiveDate) -> Result<[(&'static str, String); 3]> {
        let start_ts = start
            .and_hms_opt(0, 0, 0)
            .ok_or_else(|| anyhow!("invalid start date {}", start))?
            .and_utc()
            .timestamp();
        let end_ts = end
            .and_hms_opt(23, 59, 59)
            .ok_or_else(|| anyhow!("invalid end date {}", end))?
            .and_utc()
            .timestamp();
        Ok([
            ("period1", start_ts.to_string()),
            ("period2", end_ts.to_string()),
            ("interval", "1d".to_string()),
        ])
    }
}

impl BarProvider for YahooChartProvider {
    async fn fetch_bars(
        &self,
        symbol: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<PriceBar>> {
        sleep(REQUEST_DELAY).await;
        let url = format!("{}/{}", self.base_url, symbol);
        let response = self
            .http
            .get(&url)
            .query(&Self::chart_query(start, end)?)
            .send()
            .await
            .with_context(|| format!("GET {} failed", url))?;

        if response.status() == StatusCode::NOT_FOUND {
            debug!("Chart endpoint has no data for {}", symbol);
            return Ok(Vec::new());
        }

        let response = response
            .error_for_status()
            .with_context(|| format!("GET {} returned error", url))?;
        let chart = response
            .json::<ChartResponse>()
            .await
            .with_context(|| format!("failed to parse chart response for {}", symbol))?;

        parse_chart(symbol, chart, start, end)
    }
}

/// Turns a chart payload into bars. Rows with every field null are market
/// holidays and are dropped; rows without a close cannot be traded and are
/// dropped too.
fn parse_chart(
    symbol: &str,
    response: ChartResponse,
    start: NaiveDate,
    end: NaiveDate,
) -> Result<Vec<PriceBar>> {
    let Some(results) = response.chart.result else {
        return match response.chart.error {
            Some(err) if err.code == "Not Found" => Ok(Vec::new()),
            Some(err) => Err(anyhow!(
                "chart API error for {}: {} {}",
                symbol,
                err.code,
                err.description.unwrap_or_default()
            )),
            None => Err(anyhow!(
                "chart API returned neither result nor error for {}",
                symbol
            )),
        };
    };

    let Some(data) = results.into_iter().next() else {
        return Ok(Vec::new());
    };
    let Some(timestamps) = data.timestamp else {
        return Ok(Vec::new());
    };
    let offset = data.meta.and_then(|meta| meta.gmtoffset).unwrap_or(0);
    let quote = data.indicators.quote.into_iter().next().unwrap_or_default();

    let mut bars = Vec::with_capacity(timestamps.len());
    for (i, &ts) in timestamps.iter().enumerate() {
        let date = DateTime::from_timestamp(ts + offset, 0)
            .map(|dt| dt.naive_utc().date())
            .ok_or_else(|| anyhow!("invalid timestamp {} for {}", ts, symbol))?;
        if date < start || date > end {
            continue;
        }

        let open = quote.open.get(i).copied().flatten();
        let high = quote.high.get(i).copied().flatten();
        let low = quote.low.get(i).copied().flatten();
        let close = quote.close.get(i).copied().flatten();
        let volume = quote.volume.get(i).copied().flatten();

        let Some(close) = close.filter(|value| value.is_finite() && *value > 0.0) else {
            continue;
        };

        bars.push(PriceBar {
            date,
            symbol: symbol.to_string(),
            open: open.unwrap_or(close),
            high: high.unwrap_or(close),
            low: low.unwrap_or(close),
            close,
            volume: volume.unwrap_or(0),
        });
    }

    // intraday refreshes can repeat the last session
    bars.dedup_by_key(|bar| bar.date);
    Ok(bars)
}
