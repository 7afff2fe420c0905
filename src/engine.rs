use crate::config::{EngineConfig, LotSizing, SymbolOrder, ValuationGapPolicy};
use crate::data_context::MarketData;
use crate::error::BacktestError;
use crate::models::{
    DailySnapshot, Fill, FillSide, GeneratedSignal, PositionValuation, PriceBar, SignalAction,
    SignalSkip, SkipReason,
};
use chrono::NaiveDate;
use log::{debug, info};
use std::collections::{BTreeMap, HashMap, HashSet};

const PRICE_EPSILON: f64 = 1e-9;

/// Cash and holdings carried from one trading day to the next.
#[derive(Debug, Clone, PartialEq)]
pub struct PortfolioState {
    pub cash: f64,
    /// Symbol to share count; every count is a positive multiple of the lot size.
    pub holdings: BTreeMap<String, u64>,
    /// Most recent close seen per symbol, used by `ValuationGapPolicy::CarryForward`.
    pub last_prices: BTreeMap<String, f64>,
}

impl PortfolioState {
    pub fn new(initial_capital: f64) -> Self {
        Self {
            cash: initial_capital,
            holdings: BTreeMap::new(),
            last_prices: BTreeMap::new(),
        }
    }

    pub fn shares(&self, symbol: &str) -> u64 {
        self.holdings.get(symbol).copied().unwrap_or(0)
    }
}

/// Every bar and signal of one date. Bars keep their data order.
#[derive(Debug, Clone, PartialEq)]
pub struct TradingDay {
    pub date: NaiveDate,
    pub bars: Vec<PriceBar>,
    pub signals: Vec<GeneratedSignal>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DayOutcome {
    pub snapshot: DailySnapshot,
    pub fills: Vec<Fill>,
    pub skips: Vec<SignalSkip>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EngineRun {
    pub snapshots: Vec<DailySnapshot>,
    pub fills: Vec<Fill>,
    pub skips: Vec<SignalSkip>,
    pub final_state: PortfolioState,
}

#[derive(Debug, PartialEq)]
enum BuySignalOutcome {
    Executed(Fill),
    Skipped {
        reason: SkipReason,
        details: Option<String>,
    },
}

#[derive(Debug, PartialEq)]
enum SellSignalOutcome {
    Executed(Fill),
    Skipped { reason: SkipReason },
}

/// Day-by-day lot-based execution of band signals at the signal bar's close.
pub struct Engine {
    config: EngineConfig,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Result<Self, BacktestError> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn initial_state(&self) -> PortfolioState {
        PortfolioState::new(self.config.initial_capital)
    }

    /// Folds `step` over `days`, which must be strictly date-ascending.
    pub fn run(&self, days: &[TradingDay]) -> Result<EngineRun, BacktestError> {
        let mut state = self.initial_state();
        let mut snapshots = Vec::with_capacity(days.len());
        let mut fills = Vec::new();
        let mut skips = Vec::new();

        for window in days.windows(2) {
            if window[1].date <= window[0].date {
                return Err(BacktestError::UnsortedDates {
                    symbol: window[1]
                        .bars
                        .first()
                        .map(|bar| bar.symbol.clone())
                        .unwrap_or_default(),
                    previous: window[0].date,
                    current: window[1].date,
                });
            }
        }

        for day in days {
            let (next_state, outcome) = self.step(state, day)?;
            state = next_state;
            snapshots.push(outcome.snapshot);
            fills.extend(outcome.fills);
            skips.extend(outcome.skips);
        }

        info!(
            "Engine processed {} trading days: {} fills, {} skipped signals, final cash {:.2}",
            snapshots.len(),
            fills.len(),
            skips.len(),
            state.cash
        );

        Ok(EngineRun {
            snapshots,
            fills,
            skips,
            final_state: state,
        })
    }

    /// Applies one date's signals (buys first, then sells) and values the result.
    pub fn step(
        &self,
        mut state: PortfolioState,
        day: &TradingDay,
    ) -> Result<(PortfolioState, DayOutcome), BacktestError> {
        let closes = Self::index_day_bars(day)?;
        let (buys, sells) = self.ordered_signals(day, &closes)?;

        let mut fills = Vec::new();
        let mut skips = Vec::new();

        for signal in buys {
            match self.execute_buy_signal(&mut state, signal) {
                BuySignalOutcome::Executed(fill) => fills.push(fill),
                BuySignalOutcome::Skipped { reason, details } => {
                    info!(
                        "Skipped buy of {} on {}: {}{}",
                        signal.symbol,
                        signal.date,
                        reason.as_str(),
                        details
                            .as_deref()
                            .map(|d| format!(" ({})", d))
                            .unwrap_or_default()
                    );
                    skips.push(SignalSkip {
                        date: signal.date,
                        symbol: signal.symbol.clone(),
                        action: signal.action,
                        reason,
                        details,
                    });
                }
            }
        }

        for signal in sells {
            match self.execute_sell_signal(&mut state, signal) {
                SellSignalOutcome::Executed(fill) => fills.push(fill),
                SellSignalOutcome::Skipped { reason } => {
                    debug!(
                        "Skipped sell of {} on {}: {}",
                        signal.symbol,
                        signal.date,
                        reason.as_str()
                    );
                    skips.push(SignalSkip {
                        date: signal.date,
                        symbol: signal.symbol.clone(),
                        action: signal.action,
                        reason,
                        details: None,
                    });
                }
            }
        }

        state.holdings.retain(|_, shares| *shares > 0);
        for (symbol, close) in &closes {
            state.last_prices.insert((*symbol).to_string(), close.1);
        }

        let snapshot = self.value_portfolio(&state, day.date, &closes);
        Ok((
            state,
            DayOutcome {
                snapshot,
                fills,
                skips,
            },
        ))
    }

    /// Maps each symbol of the day to `(data order index, close)`.
    fn index_day_bars(day: &TradingDay) -> Result<HashMap<&str, (usize, f64)>, BacktestError> {
        let mut closes = HashMap::with_capacity(day.bars.len());
        for (position, bar) in day.bars.iter().enumerate() {
            if bar.date != day.date {
                return Err(BacktestError::UnsortedDates {
                    symbol: bar.symbol.clone(),
                    previous: day.date,
                    current: bar.date,
                });
            }
            if closes
                .insert(bar.symbol.as_str(), (position, bar.close))
                .is_some()
            {
                return Err(BacktestError::DuplicateBar {
                    symbol: bar.symbol.clone(),
                    date: bar.date,
                });
            }
        }
        Ok(closes)
    }

    /// Validates the day's signals against its bars and splits them into
    /// buys and sells, each sorted by the configured symbol order.
    fn ordered_signals<'d>(
        &self,
        day: &'d TradingDay,
        closes: &HashMap<&str, (usize, f64)>,
    ) -> Result<(Vec<&'d GeneratedSignal>, Vec<&'d GeneratedSignal>), BacktestError> {
        let mut seen: HashSet<&str> = HashSet::new();
        let mut buys = Vec::new();
        let mut sells = Vec::new();

        for signal in &day.signals {
            let unknown = || BacktestError::UnknownSignal {
                symbol: signal.symbol.clone(),
                date: signal.date,
            };
            if signal.date != day.date {
                return Err(unknown());
            }
            let Some(&(_, close)) = closes.get(signal.symbol.as_str()) else {
                return Err(unknown());
            };
            if (close - signal.close).abs() > PRICE_EPSILON * close.abs().max(1.0) {
                return Err(unknown());
            }
            if !signal.action.is_tradable() {
                continue;
            }
            if !seen.insert(signal.symbol.as_str()) {
                return Err(unknown());
            }
            match signal.action {
                SignalAction::Buy => buys.push(signal),
                SignalAction::Sell => sells.push(signal),
                SignalAction::Hold => {}
            }
        }

        match self.config.symbol_order {
            SymbolOrder::DataOrder => {
                let position = |signal: &GeneratedSignal| {
                    closes
                        .get(signal.symbol.as_str())
                        .map(|entry| entry.0)
                        .unwrap_or(usize::MAX)
                };
                buys.sort_by_key(|signal| position(signal));
                sells.sort_by_key(|signal| position(signal));
            }
            SymbolOrder::Lexicographic => {
                buys.sort_by(|a, b| a.symbol.cmp(&b.symbol));
                sells.sort_by(|a, b| a.symbol.cmp(&b.symbol));
            }
        }

        Ok((buys, sells))
    }

    /// Largest whole-lot share count `cash` can pay for, or `None` when the
    /// count does not fit in a `u64`.
    fn shares_affordable(&self, cash: f64, price: f64) -> Option<u64> {
        let lot_cost = price * self.config.lot_size as f64;
        let unit_cost = match self.config.lot_sizing {
            LotSizing::GrossPrice => lot_cost,
            LotSizing::FeeInclusive => lot_cost * (1.0 + self.config.buy_fee_rate),
        };
        if unit_cost <= 0.0 || !unit_cost.is_finite() {
            return Some(0);
        }
        let lots = (cash / unit_cost).floor().max(0.0);
        if lots >= u64::MAX as f64 {
            return None;
        }
        (lots as u64).checked_mul(self.config.lot_size)
    }

    fn execute_buy_signal(
        &self,
        state: &mut PortfolioState,
        signal: &GeneratedSignal,
    ) -> BuySignalOutcome {
        let price = signal.close;
        let lot_cost = price * self.config.lot_size as f64;
        if state.cash < lot_cost {
            return BuySignalOutcome::Skipped {
                reason: SkipReason::InsufficientCapital,
                details: Some(format!(
                    "one lot costs {:.2}, have {:.2}",
                    lot_cost, state.cash
                )),
            };
        }

        let held = state.shares(&signal.symbol);
        let Some(shares) = self
            .shares_affordable(state.cash, price)
            .filter(|shares| held.checked_add(*shares).is_some())
        else {
            return BuySignalOutcome::Skipped {
                reason: SkipReason::InsufficientCapital,
                details: Some(format!(
                    "share count for {:.2} at {} overflows",
                    state.cash, price
                )),
            };
        };
        if shares == 0 {
            return BuySignalOutcome::Skipped {
                reason: SkipReason::InsufficientCapital,
                details: Some(format!(
                    "no whole lot fits {:.2} including fees",
                    state.cash
                )),
            };
        }

        let gross = price * shares as f64;
        let fee = gross * self.config.buy_fee_rate;
        let total = gross + fee;
        if state.cash < total {
            return BuySignalOutcome::Skipped {
                reason: SkipReason::InsufficientCapital,
                details: Some(format!(
                    "need {:.2} for {} shares, have {:.2}",
                    total, shares, state.cash
                )),
            };
        }

        let cash_before = state.cash;
        state.cash -= total;
        state.holdings.insert(signal.symbol.clone(), held + shares);

        BuySignalOutcome::Executed(Fill {
            date: signal.date,
            symbol: signal.symbol.clone(),
            side: FillSide::Buy,
            shares,
            price,
            gross,
            fee,
            tax: 0.0,
            cash_before,
            cash_after: state.cash,
        })
    }

    fn execute_sell_signal(
        &self,
        state: &mut PortfolioState,
        signal: &GeneratedSignal,
    ) -> SellSignalOutcome {
        let shares = state.shares(&signal.symbol);
        if shares == 0 {
            return SellSignalOutcome::Skipped {
                reason: SkipReason::NoPosition,
            };
        }

        let price = signal.close;
        let gross = price * shares as f64;
        let tax = gross * self.config.sell_tax_rate;
        let fee = gross * self.config.sell_fee_rate;

        let cash_before = state.cash;
        state.cash += gross - tax - fee;
        state.holdings.insert(signal.symbol.clone(), 0);

        SellSignalOutcome::Executed(Fill {
            date: signal.date,
            symbol: signal.symbol.clone(),
            side: FillSide::Sell,
            shares,
            price,
            gross,
            fee,
            tax,
            cash_before,
            cash_after: state.cash,
        })
    }

    fn value_portfolio(
        &self,
        state: &PortfolioState,
        date: NaiveDate,
        closes: &HashMap<&str, (usize, f64)>,
    ) -> DailySnapshot {
        let mut positions = BTreeMap::new();
        let mut positions_value = 0.0;

        for (symbol, &shares) in &state.holdings {
            let price = match closes.get(symbol.as_str()) {
                Some(&(_, close)) => close,
                None => {
                    let fallback = match self.config.valuation_gap {
                        ValuationGapPolicy::Zero => 0.0,
                        ValuationGapPolicy::CarryForward => {
                            state.last_prices.get(symbol).copied().unwrap_or(0.0)
                        }
                    };
                    debug!(
                        "No bar for held {} on {}; valued at {:.4} ({})",
                        symbol,
                        date,
                        fallback,
                        self.config.valuation_gap.label()
                    );
                    fallback
                }
            };
            let value = price * shares as f64;
            positions_value += value;
            positions.insert(
                symbol.clone(),
                PositionValuation {
                    shares,
                    price,
                    value,
                },
            );
        }

        DailySnapshot {
            date,
            cash: state.cash,
            positions_value,
            total_value: state.cash + positions_value,
            positions,
        }
    }
}

/// Groups the market's bars and the merged signal list into date-ordered
/// trading days. A signal whose `(date, symbol)` has no bar is rejected.
pub fn build_trading_days(
    market: &MarketData,
    signals: &[GeneratedSignal],
) -> Result<Vec<TradingDay>, BacktestError> {
    let mut days: Vec<TradingDay> = market
        .bars_by_date()
        .into_iter()
        .map(|(date, bars)| TradingDay {
            date,
            bars: bars.to_vec(),
            signals: Vec::new(),
        })
        .collect();

    let day_index: HashMap<NaiveDate, usize> = days
        .iter()
        .enumerate()
        .map(|(index, day)| (day.date, index))
        .collect();

    for signal in signals {
        let unknown = || BacktestError::UnknownSignal {
            symbol: signal.symbol.clone(),
            date: signal.date,
        };
        let index = *day_index.get(&signal.date).ok_or_else(unknown)?;
        let day = &mut days[index];
        if !day.bars.iter().any(|bar| bar.symbol == signal.symbol) {
            return Err(unknown());
        }
        day.signals.push(signal.clone());
    }

    Ok(days)
}
