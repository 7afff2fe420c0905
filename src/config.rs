use crate::error::BacktestError;
use anyhow::{anyhow, Result};
use chrono::NaiveDate;
use std::collections::HashMap;

pub const DEFAULT_INITIAL_CAPITAL: f64 = 10_000_000.0;
pub const DEFAULT_LOT_SIZE: u64 = 1000;
pub const DEFAULT_FEE_RATE: f64 = 0.001425;
pub const DEFAULT_SELL_TAX_RATE: f64 = 0.003;
pub const DEFAULT_BAND_PERIOD: usize = 20;
pub const DEFAULT_BAND_STD_MULTIPLIER: f64 = 2.0;

/// Settings keys understood by the engine, in the order they are reported.
pub const ENGINE_SETTING_KEYS: [&str; 10] = [
    "BACKTEST_INITIAL_CAPITAL",
    "BACKTEST_LOT_SIZE",
    "BUY_FEE_RATE",
    "SELL_FEE_RATE",
    "SELL_TAX_RATE",
    "LOT_SIZING",
    "VALUATION_GAP_POLICY",
    "SYMBOL_ORDER",
    "BAND_PERIOD",
    "BAND_STD_MULTIPLIER",
];

/// How the number of board lots for a buy is sized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LotSizing {
    /// `floor(cash / (price * lot))`, then rejected if the fee no longer fits.
    GrossPrice,
    /// `floor(cash / (price * lot * (1 + fee)))`, so the fee always fits.
    FeeInclusive,
}

impl LotSizing {
    pub fn parse(raw: &str) -> Result<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "gross" | "gross_price" => Ok(Self::GrossPrice),
            "fee_inclusive" | "net" => Ok(Self::FeeInclusive),
            other => Err(anyhow!(
                "LOT_SIZING must be GROSS_PRICE or FEE_INCLUSIVE (value: {})",
                other
            )),
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::GrossPrice => "gross price",
            Self::FeeInclusive => "fee inclusive",
        }
    }
}

/// Price used to value a held symbol that has no bar on the snapshot date.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValuationGapPolicy {
    Zero,
    CarryForward,
}

impl ValuationGapPolicy {
    pub fn parse(raw: &str) -> Result<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "zero" => Ok(Self::Zero),
            "carry_forward" | "carry-forward" | "last" => Ok(Self::CarryForward),
            other => Err(anyhow!(
                "VALUATION_GAP_POLICY must be ZERO or CARRY_FORWARD (value: {})",
                other
            )),
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Zero => "zero",
            Self::CarryForward => "carry forward",
        }
    }
}

/// Order in which symbols with signals on the same day are executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolOrder {
    /// Order of appearance in that day's bars.
    DataOrder,
    Lexicographic,
}

impl SymbolOrder {
    pub fn parse(raw: &str) -> Result<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "data" | "data_order" => Ok(Self::DataOrder),
            "lexicographic" | "symbol" => Ok(Self::Lexicographic),
            other => Err(anyhow!(
                "SYMBOL_ORDER must be DATA_ORDER or LEXICOGRAPHIC (value: {})",
                other
            )),
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::DataOrder => "data order",
            Self::Lexicographic => "lexicographic",
        }
    }
}

/// Bollinger band parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BandConfig {
    pub period: usize,
    pub std_multiplier: f64,
}

impl Default for BandConfig {
    fn default() -> Self {
        Self {
            period: DEFAULT_BAND_PERIOD,
            std_multiplier: DEFAULT_BAND_STD_MULTIPLIER,
        }
    }
}

impl BandConfig {
    pub fn from_settings_map(settings: &HashMap<String, String>) -> Result<Self> {
        let defaults = Self::default();
        let period = optional_setting_usize(settings, "BAND_PERIOD", 2)?.unwrap_or(defaults.period);
        let std_multiplier =
            optional_setting_f64(settings, "BAND_STD_MULTIPLIER", Some(0.0), None)?
                .unwrap_or(defaults.std_multiplier);
        Ok(Self {
            period,
            std_multiplier,
        })
    }
}

/// Capital, lot and friction parameters of the execution engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub initial_capital: f64,
    pub lot_size: u64,
    pub buy_fee_rate: f64,
    pub sell_fee_rate: f64,
    pub sell_tax_rate: f64,

    pub lot_sizing: LotSizing,
    pub valuation_gap: ValuationGapPolicy,
    pub symbol_order: SymbolOrder,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            initial_capital: DEFAULT_INITIAL_CAPITAL,
            lot_size: DEFAULT_LOT_SIZE,
            buy_fee_rate: DEFAULT_FEE_RATE,
            sell_fee_rate: DEFAULT_FEE_RATE,
            sell_tax_rate: DEFAULT_SELL_TAX_RATE,
            lot_sizing: LotSizing::GrossPrice,
            valuation_gap: ValuationGapPolicy::Zero,
            symbol_order: SymbolOrder::DataOrder,
        }
    }
}

impl EngineConfig {
    /// Builds a config from a settings map, falling back to defaults for absent keys.
    pub fn from_settings_map(settings: &HashMap<String, String>) -> Result<Self> {
        let defaults = Self::default();

        let initial_capital =
            optional_setting_f64(settings, "BACKTEST_INITIAL_CAPITAL", Some(0.0), None)?
                .unwrap_or(defaults.initial_capital);
        let lot_size = optional_setting_usize(settings, "BACKTEST_LOT_SIZE", 1)?
            .map(|value| value as u64)
            .unwrap_or(defaults.lot_size);
        let buy_fee_rate = optional_setting_f64(settings, "BUY_FEE_RATE", Some(0.0), Some(1.0))?
            .unwrap_or(defaults.buy_fee_rate);
        let sell_fee_rate = optional_setting_f64(settings, "SELL_FEE_RATE", Some(0.0), Some(1.0))?
            .unwrap_or(defaults.sell_fee_rate);
        let sell_tax_rate = optional_setting_f64(settings, "SELL_TAX_RATE", Some(0.0), Some(1.0))?
            .unwrap_or(defaults.sell_tax_rate);
        let lot_sizing = match optional_setting(settings, "LOT_SIZING") {
            Some(raw) => LotSizing::parse(raw)?,
            None => defaults.lot_sizing,
        };
        let valuation_gap = match optional_setting(settings, "VALUATION_GAP_POLICY") {
            Some(raw) => ValuationGapPolicy::parse(raw)?,
            None => defaults.valuation_gap,
        };
        let symbol_order = match optional_setting(settings, "SYMBOL_ORDER") {
            Some(raw) => SymbolOrder::parse(raw)?,
            None => defaults.symbol_order,
        };

        let config = Self {
            initial_capital,
            lot_size,
            buy_fee_rate,
            sell_fee_rate,
            sell_tax_rate,
            lot_sizing,
            valuation_gap,
            symbol_order,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), BacktestError> {
        if !self.initial_capital.is_finite() || self.initial_capital <= 0.0 {
            return Err(BacktestError::InvalidConfig(format!(
                "initial capital must be positive (value: {})",
                self.initial_capital
            )));
        }
        if self.lot_size == 0 {
            return Err(BacktestError::InvalidConfig(
                "lot size must be at least 1".to_string(),
            ));
        }
        for (name, rate) in [
            ("buy fee rate", self.buy_fee_rate),
            ("sell fee rate", self.sell_fee_rate),
            ("sell tax rate", self.sell_tax_rate),
        ] {
            if !rate.is_finite() || !(0.0..1.0).contains(&rate) {
                return Err(BacktestError::InvalidConfig(format!(
                    "{} must be within [0, 1) (value: {})",
                    name, rate
                )));
            }
        }
        Ok(())
    }
}

/// Overlays process environment variables onto settings loaded from storage.
pub fn merge_env_overrides(settings: &mut HashMap<String, String>) {
    for key in ENGINE_SETTING_KEYS {
        if let Ok(value) = std::env::var(key) {
            if !value.trim().is_empty() {
                settings.insert(key.to_string(), value);
            }
        }
    }
}

fn optional_setting<'a>(settings: &'a HashMap<String, String>, key: &str) -> Option<&'a str> {
    settings
        .get(key)
        .map(|value| value.trim())
        .filter(|value| !value.is_empty())
}

pub fn parse_date_arg(raw: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d")
        .map_err(|_| anyhow!("Date must be in YYYY-MM-DD format (value: {})", raw))
}

fn optional_setting_f64(
    settings: &HashMap<String, String>,
    key: &str,
    min: Option<f64>,
    max: Option<f64>,
) -> Result<Option<f64>> {
    let Some(raw) = optional_setting(settings, key) else {
        return Ok(None);
    };
    let value = raw
        .parse::<f64>()
        .map_err(|_| anyhow!("Setting {} must be a number (value: {})", key, raw))?;
    if !value.is_finite() {
        return Err(anyhow!("Setting {} must be finite (value: {})", key, raw));
    }
    if let Some(min_value) = min {
        if value < min_value {
            return Err(anyhow!(
                "Setting {} must be >= {} (value: {})",
                key,
                min_value,
                raw
            ));
        }
    }
    if let Some(max_value) = max {
        if value > max_value {
            return Err(anyhow!(
                "Setting {} must be <= {} (value: {})",
                key,
                max_value,
                raw
            ));
        }
    }
    Ok(Some(value))
}

fn optional_setting_usize(
    settings: &HashMap<String, String>,
    key: &str,
    min: usize,
) -> Result<Option<usize>> {
    let Some(raw) = optional_setting(settings, key) else {
        return Ok(None);
    };
    let value = raw
        .parse::<f64>()
        .map_err(|_| anyhow!("Setting {} must be a number (value: {})", key, raw))?;
    if !value.is_finite() {
        return Err(anyhow!("Setting {} must be finite (value: {})", key, raw));
    }
    if value.fract() != 0.0 {
        return Err(anyhow!(
            "Setting {} must be an integer (value: {})",
            key,
            raw
        ));
    }
    if value < min as f64 {
        return Err(anyhow!(
            "Setting {} must be >= {} (value: {})",
            key,
            min,
            raw
        ));
    }
    Ok(Some(value as usize))
}
