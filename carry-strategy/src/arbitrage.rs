use crate::{
    detector::{ArbitrageDetector, ArbitrageOpportunity},
    funding::FundingCalculator,
    inventory::{InventoryManager, RebalanceAction},
    sizer::{PositionSizer, SizingInputs},
};
use carry_data::event::FundingRate;
use carry_instrument::{exchange::ExchangeId, symbol::Symbol};
use chrono::{DateTime, NaiveDate, Utc};
use fnv::FnvHashMap;
use rust_decimal::{Decimal, prelude::ToPrimitive};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tracing::{debug, info};

/// Configuration of the [`ArbitrageStrategy`].
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ArbitrageConfig {
    pub symbols: Vec<Symbol>,
    /// Existing inventory is closed once the best live spread decays below this.
    pub min_spread_to_hold: f64,
    /// Risk-free rate used in the rolling Sharpe.
    pub risk_free: f64,
}

impl Default for ArbitrageConfig {
    fn default() -> Self {
        Self {
            symbols: vec![Symbol::new("BTC/USDT:USDT")],
            min_spread_to_hold: 0.05,
            risk_free: 0.02,
        }
    }
}

/// Kind of advice carried by a [`TradeSignal`].
#[derive(
    Debug, Copy, Clone, Eq, PartialEq, Deserialize, Serialize, derive_more::Display,
)]
#[serde(rename_all = "snake_case")]
pub enum SignalType {
    Open,
    Close,
    Rebalance,
}

/// One ordered piece of strategy advice handed to the risk gate and executor.
#[derive(Debug, Clone, PartialEq)]
pub struct TradeSignal {
    pub id: u64,
    pub signal_type: SignalType,
    pub symbol: Symbol,
    pub opportunity: Option<ArbitrageOpportunity>,
    pub rebalance_actions: Vec<RebalanceAction>,
    /// Per-leg quantity for an `Open` signal, already sized and capped.
    pub sized_quantity: Option<Decimal>,
    /// Advice strength in `[0, 1]`.
    pub strength: f64,
    pub reason: String,
    pub generated_at: DateTime<Utc>,
    pub valid_until: Option<DateTime<Utc>>,
}

/// Portfolio context for one strategy tick.
#[derive(Debug, Clone)]
pub struct TickContext {
    pub now: DateTime<Utc>,
    pub equity: Decimal,
    pub current_drawdown: f64,
    pub current_volatility: f64,
    pub available_margin: Decimal,
    pub mark_prices: FnvHashMap<Symbol, Decimal>,
}

/// Rolling daily-performance window (one year of daily returns).
#[derive(Debug, Default)]
struct DailyPerformance {
    date: Option<NaiveDate>,
    day_start_equity: Decimal,
    returns: VecDeque<f64>,
    sharpe: Option<f64>,
}

const DAILY_RETURN_WINDOW: usize = 365;
const MIN_SHARPE_SAMPLES: usize = 30;
const TRADING_DAYS: f64 = 252.0;

/// The funding-rate arbitrage strategy: one state machine shared by backtest and live modes.
#[derive(Debug)]
pub struct ArbitrageStrategy {
    config: ArbitrageConfig,
    pub funding: FundingCalculator,
    pub inventory: InventoryManager,
    pub sizer: PositionSizer,
    pub detector: ArbitrageDetector,
    running: bool,
    paused: bool,
    performance: DailyPerformance,
    signal_counter: u64,
}

impl ArbitrageStrategy {
    pub fn new(
        config: ArbitrageConfig,
        funding: FundingCalculator,
        inventory: InventoryManager,
        sizer: PositionSizer,
        detector: ArbitrageDetector,
    ) -> Self {
        Self {
            config,
            funding,
            inventory,
            sizer,
            detector,
            running: false,
            paused: false,
            performance: DailyPerformance::default(),
            signal_counter: 0,
        }
    }

    pub fn start(&mut self) {
        self.running = true;
        info!(symbols = ?self.config.symbols, "arbitrage strategy started");
    }

    pub fn stop(&mut self) {
        self.running = false;
    }

    pub fn pause(&mut self) {
        self.paused = true;
    }

    pub fn resume(&mut self) {
        self.paused = false;
    }

    pub fn is_running(&self) -> bool {
        self.running && !self.paused
    }

    /// Annualized Sharpe of the rolling daily-return window, available once 30 samples exist.
    pub fn sharpe(&self) -> Option<f64> {
        self.performance.sharpe
    }

    /// Fold a normalised funding record into the per-venue calculator.
    pub fn on_funding(
        &mut self,
        exchange: ExchangeId,
        symbol: &Symbol,
        funding: &FundingRate,
        time: DateTime<Utc>,
    ) {
        self.funding.update(exchange, symbol, funding, time);
    }

    /// Run one decision cycle over every configured symbol.
    pub fn tick(&mut self, context: &TickContext) -> Vec<TradeSignal> {
        if !self.is_running() {
            return vec![];
        }

        self.record_daily_performance(context.now, context.equity);

        let mut signals = Vec::new();
        let symbols = self.config.symbols.clone();
        for symbol in &symbols {
            self.tick_symbol(symbol, context, &mut signals);
        }
        signals
    }

    fn tick_symbol(
        &mut self,
        symbol: &Symbol,
        context: &TickContext,
        signals: &mut Vec<TradeSignal>,
    ) {
        let total = self.inventory.total_inventory(symbol);
        let has_inventory = !total.total_notional.is_zero();

        // Portfolio risk limits breached: unwind and stand down
        if self.sizer.check_risk_limits(context.current_drawdown) {
            if has_inventory {
                signals.push(self.signal(
                    SignalType::Close,
                    symbol,
                    None,
                    vec![],
                    1.0,
                    "portfolio risk limits breached".to_owned(),
                    context.now,
                    None,
                ));
            }
            return;
        }

        // Rebalance takes precedence over opening this tick
        if self.inventory.needs_rebalance(symbol, context.now) {
            let actions = self
                .inventory
                .generate_rebalance_actions(symbol, context.now);
            if !actions.is_empty() {
                signals.push(self.signal(
                    SignalType::Rebalance,
                    symbol,
                    None,
                    actions,
                    0.8,
                    "inventory imbalance".to_owned(),
                    context.now,
                    None,
                ));
            }
            return;
        }

        let opportunities = self.detector.detect(symbol, &self.funding, context.now);

        if opportunities.is_empty() {
            // Close decayed inventory: the spread no longer pays for the risk
            if has_inventory
                && self
                    .funding
                    .max_spread(symbol)
                    .is_none_or(|spread| spread < self.config.min_spread_to_hold)
            {
                signals.push(self.signal(
                    SignalType::Close,
                    symbol,
                    None,
                    vec![],
                    1.0,
                    "spread decayed below hold threshold".to_owned(),
                    context.now,
                    None,
                ));
            }
            return;
        }

        let Some(best) = opportunities.into_iter().next() else {
            return;
        };

        if !self.sizer.can_open_position(context.now) {
            debug!(%symbol, "daily trade budget exhausted");
            return;
        }
        if !self.inventory.can_open_position(symbol, context.equity) {
            debug!(%symbol, "inventory ratio gate denied open");
            return;
        }

        let Some(mark_price) = context.mark_prices.get(symbol).copied() else {
            return;
        };

        let exchange_notional = total
            .exchanges
            .values()
            .map(|leg| leg.notional)
            .max()
            .unwrap_or(Decimal::ZERO);
        let sizing = self.sizer.calculate(
            &best,
            &SizingInputs {
                equity: context.equity,
                mark_price,
                current_volatility: context.current_volatility,
                current_drawdown: context.current_drawdown,
                available_margin: context.available_margin,
                pair_notional: total.total_notional,
                exchange_notional,
                total_notional: total.total_notional,
            },
        );

        if sizing.suggested_notional.is_zero() {
            debug!(%symbol, reason = ?sizing.adjustment_reason, "sizing produced zero notional");
            return;
        }

        let strength = best.suggested_size;
        let valid_until = best.valid_until;
        let reason = format!(
            "funding spread {:.1}%, expected return {:.1}%",
            best.spread_annualized * 100.0,
            best.expected_return * 100.0
        );
        let mut signal = self.signal(
            SignalType::Open,
            symbol,
            Some(best),
            vec![],
            strength,
            reason,
            context.now,
            Some(valid_until),
        );
        signal.sized_quantity = Some(sizing.suggested_quantity);
        signals.push(signal);
    }

    /// Archive daily returns on date change and refresh the rolling Sharpe.
    fn record_daily_performance(&mut self, now: DateTime<Utc>, equity: Decimal) {
        let today = now.date_naive();
        let performance = &mut self.performance;

        match performance.date {
            None => {
                performance.date = Some(today);
                performance.day_start_equity = equity;
            }
            Some(date) if date != today => {
                if performance.day_start_equity > Decimal::ZERO {
                    let daily_return = ((equity - performance.day_start_equity)
                        / performance.day_start_equity)
                        .to_f64()
                        .unwrap_or(0.0);
                    performance.returns.push_back(daily_return);
                    while performance.returns.len() > DAILY_RETURN_WINDOW {
                        performance.returns.pop_front();
                    }
                }
                performance.date = Some(today);
                performance.day_start_equity = equity;

                if performance.returns.len() >= MIN_SHARPE_SAMPLES {
                    performance.sharpe =
                        annualized_sharpe(&performance.returns, self.config.risk_free);
                }
            }
            Some(_) => {}
        }
    }

    fn signal(
        &mut self,
        signal_type: SignalType,
        symbol: &Symbol,
        opportunity: Option<ArbitrageOpportunity>,
        rebalance_actions: Vec<RebalanceAction>,
        strength: f64,
        reason: String,
        now: DateTime<Utc>,
        valid_until: Option<DateTime<Utc>>,
    ) -> TradeSignal {
        self.signal_counter += 1;
        TradeSignal {
            id: self.signal_counter,
            signal_type,
            symbol: symbol.clone(),
            opportunity,
            rebalance_actions,
            sized_quantity: None,
            strength,
            reason,
            generated_at: now,
            valid_until,
        }
    }
}

/// Annualized Sharpe over daily returns: `(mean - rf_daily) / stdev * sqrt(252)`.
fn annualized_sharpe(returns: &VecDeque<f64>, risk_free: f64) -> Option<f64> {
    let n = returns.len() as f64;
    if n < 2.0 {
        return None;
    }
    let mean = returns.iter().sum::<f64>() / n;
    let variance = returns.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / (n - 1.0);
    let stdev = variance.sqrt();
    if stdev < f64::EPSILON {
        return None;
    }
    let daily_risk_free = risk_free / TRADING_DAYS;
    Some((mean - daily_risk_free) / stdev * TRADING_DAYS.sqrt())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        detector::DetectorConfig,
        funding::FundingConfig,
        inventory::InventoryConfig,
        sizer::SizerConfig,
    };
    use carry_instrument::PositionSide;
    use chrono::Duration as ChronoDuration;
    use rust_decimal_macros::dec;

    fn symbol() -> Symbol {
        Symbol::new("BTC/USDT:USDT")
    }

    fn strategy() -> ArbitrageStrategy {
        let mut strategy = ArbitrageStrategy::new(
            ArbitrageConfig::default(),
            FundingCalculator::new(FundingConfig::default()),
            InventoryManager::new(InventoryConfig::default()),
            PositionSizer::new(SizerConfig::default()),
            ArbitrageDetector::new(DetectorConfig::default()),
        );
        strategy.start();
        strategy
    }

    fn seed_spread(strategy: &mut ArbitrageStrategy) {
        // Binance ~ +20% annualized, OKX ~ -5%
        for _ in 0..10 {
            strategy.on_funding(
                ExchangeId::Binance,
                &symbol(),
                &FundingRate {
                    rate: dec!(0.000183),
                    predicted_rate: None,
                    mark_price: None,
                    next_funding_time: None,
                },
                Utc::now(),
            );
            strategy.on_funding(
                ExchangeId::Okx,
                &symbol(),
                &FundingRate {
                    rate: dec!(-0.0000457),
                    predicted_rate: None,
                    mark_price: None,
                    next_funding_time: None,
                },
                Utc::now(),
            );
        }
    }

    fn context(equity: Decimal) -> TickContext {
        let mut mark_prices = FnvHashMap::default();
        mark_prices.insert(symbol(), dec!(25000));
        TickContext {
            now: Utc::now(),
            equity,
            current_drawdown: 0.0,
            current_volatility: 0.02,
            available_margin: equity,
            mark_prices,
        }
    }

    #[test]
    fn test_open_signal_for_wide_spread() {
        let mut strategy = strategy();
        seed_spread(&mut strategy);

        let signals = strategy.tick(&context(dec!(10000)));
        assert_eq!(signals.len(), 1);

        let signal = &signals[0];
        assert_eq!(signal.signal_type, SignalType::Open);
        let opportunity = signal.opportunity.as_ref().unwrap();
        assert_eq!(opportunity.long_exchange, ExchangeId::Okx);
        assert_eq!(opportunity.short_exchange, ExchangeId::Binance);
        assert_eq!(signal.valid_until, Some(opportunity.valid_until));
    }

    #[test]
    fn test_no_signals_when_stopped_or_paused() {
        let mut strategy = strategy();
        seed_spread(&mut strategy);

        strategy.pause();
        assert!(strategy.tick(&context(dec!(10000))).is_empty());

        strategy.resume();
        strategy.stop();
        assert!(strategy.tick(&context(dec!(10000))).is_empty());
    }

    #[test]
    fn test_risk_limit_breach_emits_close() {
        let mut strategy = strategy();
        seed_spread(&mut strategy);
        strategy.inventory.update_position(
            ExchangeId::Okx,
            &symbol(),
            PositionSide::Long,
            dec!(1),
            dec!(25000),
            dec!(3),
        );

        let mut breached = context(dec!(10000));
        breached.current_drawdown = 0.12;

        let signals = strategy.tick(&breached);
        assert_eq!(signals.len(), 1);
        assert_eq!(signals[0].signal_type, SignalType::Close);
    }

    #[test]
    fn test_rebalance_takes_precedence_over_open() {
        let mut strategy = strategy();
        seed_spread(&mut strategy);
        // Imbalanced inventory: long 2 on OKX vs short 1 on Binance
        strategy.inventory.update_position(
            ExchangeId::Okx,
            &symbol(),
            PositionSide::Long,
            dec!(2),
            dec!(25000),
            dec!(3),
        );
        strategy.inventory.update_position(
            ExchangeId::Binance,
            &symbol(),
            PositionSide::Short,
            dec!(1),
            dec!(25000),
            dec!(3),
        );

        let signals = strategy.tick(&context(dec!(1000000)));
        assert_eq!(signals.len(), 1);
        assert_eq!(signals[0].signal_type, SignalType::Rebalance);
        assert_eq!(signals[0].rebalance_actions.len(), 1);
    }

    #[test]
    fn test_decayed_spread_closes_inventory() {
        let mut strategy = strategy();
        // Narrow spread (~1% annualized) below both open and hold thresholds
        for _ in 0..10 {
            strategy.on_funding(
                ExchangeId::Binance,
                &symbol(),
                &FundingRate {
                    rate: dec!(0.00001),
                    predicted_rate: None,
                    mark_price: None,
                    next_funding_time: None,
                },
                Utc::now(),
            );
            strategy.on_funding(
                ExchangeId::Okx,
                &symbol(),
                &FundingRate {
                    rate: dec!(0.000005),
                    predicted_rate: None,
                    mark_price: None,
                    next_funding_time: None,
                },
                Utc::now(),
            );
        }
        // Balanced legs so no rebalance takes precedence
        strategy.inventory.update_position(
            ExchangeId::Okx,
            &symbol(),
            PositionSide::Long,
            dec!(0.1),
            dec!(25000),
            dec!(3),
        );
        strategy.inventory.update_position(
            ExchangeId::Binance,
            &symbol(),
            PositionSide::Short,
            dec!(0.1),
            dec!(25000),
            dec!(3),
        );

        let signals = strategy.tick(&context(dec!(100000)));
        assert_eq!(signals.len(), 1);
        assert_eq!(signals[0].signal_type, SignalType::Close);
    }

    #[test]
    fn test_daily_returns_archive_and_sharpe() {
        let mut strategy = strategy();
        let base = Utc::now();

        // 35 days of alternating +0.6% / +0.2% daily growth
        let mut equity = 10000.0f64;
        for day in 0..35 {
            let mut context = context(Decimal::from_f64_retain(equity).unwrap());
            context.now = base + ChronoDuration::days(day);
            strategy.tick(&context);
            equity *= if day % 2 == 0 { 1.006 } else { 1.002 };
        }

        let sharpe = strategy.sharpe();
        assert!(sharpe.is_some(), "sharpe requires >= 30 daily samples");
        // Constant positive returns with near-zero dispersion produce a large Sharpe
        assert!(sharpe.unwrap() > 1.0);
    }
}
