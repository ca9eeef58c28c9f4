use crate::backtest::{BacktestEvent, LiquidationEvent, OrderFillEvent};
use carry_data::event::{DataKind, DepthUpdate, FundingRate, Kline, MarkPriceUpdate, MarketEvent, PublicTrade};
use carry_execution::order::OrderRequest;
use indexmap::IndexMap;
use rust_decimal::Decimal;
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, error};

/// Request to modify a resting order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModifyOrder {
    pub order_id: u64,
    pub new_price: Option<Decimal>,
    pub new_quantity: Option<Decimal>,
}

/// Orders a strategy wants executed in response to an event. Merged across strategies by
/// concatenation, in dispatch order.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Action {
    pub orders: Vec<OrderRequest>,
    pub cancel_orders: Vec<u64>,
    pub modify_orders: Vec<ModifyOrder>,
}

impl Action {
    pub fn is_empty(&self) -> bool {
        self.orders.is_empty() && self.cancel_orders.is_empty() && self.modify_orders.is_empty()
    }

    pub fn merge(&mut self, other: Action) {
        self.orders.extend(other.orders);
        self.cancel_orders.extend(other.cancel_orders);
        self.modify_orders.extend(other.modify_orders);
    }
}

/// Failure raised by a strategy callback.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("strategy error: {0}")]
pub struct StrategyError(pub String);

impl From<String> for StrategyError {
    fn from(message: String) -> Self {
        Self(message)
    }
}

impl From<&str> for StrategyError {
    fn from(message: &str) -> Self {
        Self(message.to_owned())
    }
}

/// A trading strategy: event callbacks with default no-op implementations.
pub trait Strategy: Send {
    fn on_init(&mut self) -> Result<(), StrategyError> {
        Ok(())
    }

    fn on_trade(
        &mut self,
        event: &MarketEvent,
        trade: &PublicTrade,
    ) -> Result<Option<Action>, StrategyError> {
        let _ = (event, trade);
        Ok(None)
    }

    fn on_depth(
        &mut self,
        event: &MarketEvent,
        depth: &DepthUpdate,
    ) -> Result<Option<Action>, StrategyError> {
        let _ = (event, depth);
        Ok(None)
    }

    fn on_funding(
        &mut self,
        event: &MarketEvent,
        funding: &FundingRate,
    ) -> Result<Option<Action>, StrategyError> {
        let _ = (event, funding);
        Ok(None)
    }

    fn on_mark_price(
        &mut self,
        event: &MarketEvent,
        mark_price: &MarkPriceUpdate,
    ) -> Result<Option<Action>, StrategyError> {
        let _ = (event, mark_price);
        Ok(None)
    }

    fn on_kline(
        &mut self,
        event: &MarketEvent,
        kline: &Kline,
    ) -> Result<Option<Action>, StrategyError> {
        let _ = (event, kline);
        Ok(None)
    }

    fn on_order_filled(
        &mut self,
        fill: &OrderFillEvent,
    ) -> Result<Option<Action>, StrategyError> {
        let _ = fill;
        Ok(None)
    }

    fn on_liquidation(
        &mut self,
        liquidation: &LiquidationEvent,
    ) -> Result<Option<Action>, StrategyError> {
        let _ = liquidation;
        Ok(None)
    }

    fn on_destroy(&mut self) {}
}

/// Per-callback timing and error counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallbackStats {
    pub calls: u64,
    pub errors: u64,
    pub total_micros: u64,
}

/// Indexed counter struct - one slot per callback kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StrategyCounters {
    pub on_trade: CallbackStats,
    pub on_depth: CallbackStats,
    pub on_funding: CallbackStats,
    pub on_mark_price: CallbackStats,
    pub on_kline: CallbackStats,
    pub on_order_filled: CallbackStats,
    pub on_liquidation: CallbackStats,
}

/// Host registration / dispatch failures.
#[derive(Debug, Error)]
pub enum HostError {
    #[error("strategy name already registered: {0}")]
    DuplicateName(String),

    #[error("strategy '{name}' failed to initialise: {source}")]
    Init {
        name: String,
        source: StrategyError,
    },
}

struct Entry {
    strategy: Box<dyn Strategy>,
    enabled: bool,
    counters: StrategyCounters,
}

impl std::fmt::Debug for Entry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Entry")
            .field("enabled", &self.enabled)
            .field("counters", &self.counters)
            .finish()
    }
}

/// Owns registered strategies and fans events out to them in insertion order.
///
/// With `catch_errors` set (the default), a failing strategy is isolated: its error counter
/// increments and dispatch continues with the remaining strategies; otherwise the error
/// propagates and halts the run.
#[derive(Debug)]
pub struct StrategyHost {
    entries: IndexMap<String, Entry>,
    catch_errors: bool,
}

impl Default for StrategyHost {
    fn default() -> Self {
        Self {
            entries: IndexMap::new(),
            catch_errors: true,
        }
    }
}

impl StrategyHost {
    pub fn new(catch_errors: bool) -> Self {
        Self {
            entries: IndexMap::new(),
            catch_errors,
        }
    }

    /// Register a strategy under a unique name, invoking `on_init`.
    pub fn register(
        &mut self,
        name: impl Into<String>,
        mut strategy: Box<dyn Strategy>,
    ) -> Result<(), HostError> {
        let name = name.into();
        if self.entries.contains_key(&name) {
            return Err(HostError::DuplicateName(name));
        }
        strategy
            .on_init()
            .map_err(|source| HostError::Init {
                name: name.clone(),
                source,
            })?;
        self.entries.insert(
            name,
            Entry {
                strategy,
                enabled: true,
                counters: StrategyCounters::default(),
            },
        );
        Ok(())
    }

    /// Unregister a strategy, invoking `on_destroy`. Returns whether it existed.
    pub fn unregister(&mut self, name: &str) -> bool {
        match self.entries.shift_remove(name) {
            Some(mut entry) => {
                entry.strategy.on_destroy();
                true
            }
            None => false,
        }
    }

    /// Hot-replace: destroy the existing strategy under `name` (if any) and register the
    /// replacement in its slot.
    pub fn replace(
        &mut self,
        name: impl Into<String>,
        mut strategy: Box<dyn Strategy>,
    ) -> Result<(), HostError> {
        let name = name.into();
        strategy
            .on_init()
            .map_err(|source| HostError::Init {
                name: name.clone(),
                source,
            })?;

        // IndexMap keeps the slot position when inserting over an existing key
        if let Some(mut previous) = self.entries.insert(
            name,
            Entry {
                strategy,
                enabled: true,
                counters: StrategyCounters::default(),
            },
        ) {
            previous.strategy.on_destroy();
        }
        Ok(())
    }

    /// Enable or disable dispatch to one strategy. Returns whether it exists.
    pub fn set_enabled(&mut self, name: &str, enabled: bool) -> bool {
        match self.entries.get_mut(name) {
            Some(entry) => {
                entry.enabled = enabled;
                true
            }
            None => false,
        }
    }

    pub fn counters(&self, name: &str) -> Option<StrategyCounters> {
        self.entries.get(name).map(|entry| entry.counters)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Invoke `on_destroy` for every registered strategy (end of run).
    pub fn destroy_all(&mut self) {
        for entry in self.entries.values_mut() {
            entry.strategy.on_destroy();
        }
    }

    /// Fan one event out to every enabled strategy, merging returned actions by
    /// concatenation in dispatch order.
    pub fn dispatch(&mut self, event: &BacktestEvent) -> Result<Action, StrategyError> {
        let mut merged = Action::default();

        for (name, entry) in self.entries.iter_mut() {
            if !entry.enabled {
                continue;
            }

            let started = Instant::now();
            let (stats, result) = match event {
                BacktestEvent::Market(market) => match &market.kind {
                    DataKind::Trade(trade) => (
                        &mut entry.counters.on_trade,
                        entry.strategy.on_trade(market, trade),
                    ),
                    DataKind::Depth(depth) => (
                        &mut entry.counters.on_depth,
                        entry.strategy.on_depth(market, depth),
                    ),
                    DataKind::Funding(funding) => (
                        &mut entry.counters.on_funding,
                        entry.strategy.on_funding(market, funding),
                    ),
                    DataKind::MarkPrice(mark_price) => (
                        &mut entry.counters.on_mark_price,
                        entry.strategy.on_mark_price(market, mark_price),
                    ),
                    DataKind::Kline(kline) => (
                        &mut entry.counters.on_kline,
                        entry.strategy.on_kline(market, kline),
                    ),
                    DataKind::Ticker(_) => continue,
                },
                BacktestEvent::OrderFilled(fill) => (
                    &mut entry.counters.on_order_filled,
                    entry.strategy.on_order_filled(fill),
                ),
                BacktestEvent::Liquidation(liquidation) => (
                    &mut entry.counters.on_liquidation,
                    entry.strategy.on_liquidation(liquidation),
                ),
            };

            stats.calls += 1;
            stats.total_micros += started.elapsed().as_micros() as u64;

            match result {
                Ok(Some(action)) => {
                    debug!(strategy = %name, "strategy produced action");
                    merged.merge(action);
                }
                Ok(None) => {}
                Err(strategy_error) => {
                    stats.errors += 1;
                    if self.catch_errors {
                        error!(strategy = %name, error = %strategy_error, "strategy error isolated");
                    } else {
                        return Err(strategy_error);
                    }
                }
            }
        }

        Ok(merged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use carry_instrument::{Side, exchange::ExchangeId, symbol::Symbol};
    use chrono::Utc;
    use rust_decimal_macros::dec;

    fn trade_event() -> BacktestEvent {
        BacktestEvent::Market(MarketEvent {
            time_exchange: Utc::now(),
            time_received: Utc::now(),
            exchange: ExchangeId::Binance,
            symbol: Symbol::new("BTC/USDT:USDT"),
            kind: DataKind::Trade(PublicTrade {
                id: "1".into(),
                price: dec!(100),
                amount: dec!(1),
                side: Side::Buy,
            }),
        })
    }

    fn order_request() -> OrderRequest {
        OrderRequest {
            exchange: ExchangeId::Binance,
            symbol: Symbol::new("BTC/USDT:USDT"),
            side: Side::Buy,
            kind: carry_execution::order::OrderKind::Market,
            quantity: dec!(1),
            price: None,
            post_only: false,
            reduce_only: false,
            client_order_id: None,
            account_id: None,
            timeout: None,
        }
    }

    /// Emits one buy order per trade event.
    struct BuyEveryTrade;

    impl Strategy for BuyEveryTrade {
        fn on_trade(
            &mut self,
            _event: &MarketEvent,
            _trade: &PublicTrade,
        ) -> Result<Option<Action>, StrategyError> {
            Ok(Some(Action {
                orders: vec![order_request()],
                ..Action::default()
            }))
        }
    }

    /// Always fails its trade callback.
    struct Faulty;

    impl Strategy for Faulty {
        fn on_trade(
            &mut self,
            _event: &MarketEvent,
            _trade: &PublicTrade,
        ) -> Result<Option<Action>, StrategyError> {
            Err("boom".into())
        }
    }

    #[test]
    fn test_register_rejects_duplicate_names() {
        let mut host = StrategyHost::default();
        host.register("alpha", Box::new(BuyEveryTrade)).unwrap();
        assert!(matches!(
            host.register("alpha", Box::new(BuyEveryTrade)),
            Err(HostError::DuplicateName(_))
        ));
        assert_eq!(host.len(), 1);
    }

    #[test]
    fn test_dispatch_merges_actions_in_insertion_order() {
        let mut host = StrategyHost::default();
        host.register("alpha", Box::new(BuyEveryTrade)).unwrap();
        host.register("beta", Box::new(BuyEveryTrade)).unwrap();

        let action = host.dispatch(&trade_event()).unwrap();
        assert_eq!(action.orders.len(), 2);

        let counters = host.counters("alpha").unwrap();
        assert_eq!(counters.on_trade.calls, 1);
        assert_eq!(counters.on_trade.errors, 0);
    }

    #[test]
    fn test_disabled_strategy_is_skipped() {
        let mut host = StrategyHost::default();
        host.register("alpha", Box::new(BuyEveryTrade)).unwrap();
        assert!(host.set_enabled("alpha", false));

        let action = host.dispatch(&trade_event()).unwrap();
        assert!(action.is_empty());
        assert_eq!(host.counters("alpha").unwrap().on_trade.calls, 0);
        assert!(!host.set_enabled("missing", false));
    }

    #[test]
    fn test_error_isolation_with_catch_errors() {
        let mut host = StrategyHost::default();
        host.register("faulty", Box::new(Faulty)).unwrap();
        host.register("healthy", Box::new(BuyEveryTrade)).unwrap();

        // Faulty is isolated; healthy still contributes
        let action = host.dispatch(&trade_event()).unwrap();
        assert_eq!(action.orders.len(), 1);
        assert_eq!(host.counters("faulty").unwrap().on_trade.errors, 1);
    }

    #[test]
    fn test_error_propagates_without_catch_errors() {
        let mut host = StrategyHost::new(false);
        host.register("faulty", Box::new(Faulty)).unwrap();

        assert!(host.dispatch(&trade_event()).is_err());
    }

    #[test]
    fn test_hot_replace_keeps_slot_and_resets_counters() {
        let mut host = StrategyHost::default();
        host.register("alpha", Box::new(Faulty)).unwrap();
        host.register("beta", Box::new(BuyEveryTrade)).unwrap();

        host.dispatch(&trade_event()).unwrap();
        assert_eq!(host.counters("alpha").unwrap().on_trade.errors, 1);

        host.replace("alpha", Box::new(BuyEveryTrade)).unwrap();
        assert_eq!(host.counters("alpha").unwrap().on_trade.errors, 0);

        // Slot order preserved: alpha still dispatches before beta
        let first = host.entries.get_index(0).map(|(name, _)| name.clone());
        assert_eq!(first.as_deref(), Some("alpha"));

        let action = host.dispatch(&trade_event()).unwrap();
        assert_eq!(action.orders.len(), 2);
    }

    #[test]
    fn test_unregister() {
        let mut host = StrategyHost::default();
        host.register("alpha", Box::new(BuyEveryTrade)).unwrap();
        assert!(host.unregister("alpha"));
        assert!(!host.unregister("alpha"));
        assert!(host.is_empty());
    }
}
