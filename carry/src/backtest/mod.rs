use crate::{
    Timed,
    backtest::{
        broker::{BrokerConfig, ClosedTrade, SimBroker},
        matching::{Fill, MatchingConfig, MatchingEngine},
        queue::EventQueue,
    },
    statistic::{self, PerformanceSummary},
    strategy::{Action, StrategyError, StrategyHost},
};
use carry_data::event::{DataKind, MarketEvent};
use carry_instrument::{Side, exchange::ExchangeId, symbol::Symbol};
use chrono::{DateTime, Utc};
use rust_decimal::{Decimal, prelude::ToPrimitive};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Simulated broker: cash, positions and the closed-trade log.
pub mod broker;

/// Limit-order matching against per-market L2 books.
pub mod matching;

/// Time-ordered, stable-tiebreak event queue.
pub mod queue;

/// Execution synthesized by the matching engine, re-entering the replay stream.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct OrderFillEvent {
    pub timestamp: u64,
    pub exchange: ExchangeId,
    pub symbol: Symbol,
    pub order_id: u64,
    pub fill_price: Decimal,
    pub fill_quantity: Decimal,
    pub fee: Decimal,
    pub is_maker: bool,
}

impl From<&Fill> for OrderFillEvent {
    fn from(fill: &Fill) -> Self {
        Self {
            timestamp: fill.timestamp,
            exchange: fill.exchange,
            symbol: fill.symbol.clone(),
            order_id: fill.order_id,
            fill_price: fill.price,
            fill_quantity: fill.quantity,
            fee: fill.fee,
            is_maker: fill.is_maker,
        }
    }
}

/// Forced position close synthesized when a position breaches its liquidation price.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct LiquidationEvent {
    pub timestamp: u64,
    pub exchange: ExchangeId,
    pub symbol: Symbol,
    pub side: Side,
    pub quantity: Decimal,
    pub liquidation_price: Decimal,
    pub loss: Decimal,
}

/// Replay stream item: either recorded market data or a synthesized engine event.
#[derive(Debug, Clone, PartialEq)]
pub enum BacktestEvent {
    Market(MarketEvent),
    OrderFilled(OrderFillEvent),
    Liquidation(LiquidationEvent),
}

impl BacktestEvent {
    /// Event time as epoch milliseconds - the ordering key of the queue.
    pub fn timestamp_ms(&self) -> u64 {
        match self {
            BacktestEvent::Market(event) => event.timestamp_ms(),
            BacktestEvent::OrderFilled(fill) => fill.timestamp,
            BacktestEvent::Liquidation(liquidation) => liquidation.timestamp,
        }
    }
}

/// Backtest configuration.
#[derive(Debug, Clone, Default)]
pub struct BacktestConfig {
    pub matching: MatchingConfig,
    pub broker: BrokerConfig,
    pub risk_free: f64,
}

/// Result of a completed backtest run.
#[derive(Debug, Clone)]
pub struct BacktestSummary {
    pub performance: PerformanceSummary,
    pub final_equity: f64,
    pub closed_trades: Vec<ClosedTrade>,
    pub equity_curve: Vec<Timed<f64>>,
}

/// Single-threaded, deterministic event-time backtest.
///
/// One loop over the queue: each dequeued event updates the matching engine and broker,
/// fans out to strategies, and any resulting actions execute immediately with their fills
/// re-entering the queue at the current timestamp. No wall-clock reads influence replay.
#[derive(Debug)]
pub struct Backtest {
    queue: EventQueue,
    matching: MatchingEngine,
    broker: SimBroker,
    host: StrategyHost,
    equity_curve: Vec<Timed<f64>>,
    risk_free: f64,
}

impl Backtest {
    pub fn new(config: BacktestConfig, host: StrategyHost) -> Self {
        let risk_free = if config.risk_free == 0.0 {
            statistic::DEFAULT_RISK_FREE
        } else {
            config.risk_free
        };
        Self {
            queue: EventQueue::new(),
            matching: MatchingEngine::new(config.matching),
            broker: SimBroker::new(config.broker),
            host,
            equity_curve: Vec::new(),
            risk_free,
        }
    }

    /// Seed the queue with sorted historical market events.
    pub fn load<Iter>(&mut self, events: Iter)
    where
        Iter: IntoIterator<Item = MarketEvent>,
    {
        self.queue.extend(events.into_iter().map(BacktestEvent::Market));
    }

    pub fn broker(&self) -> &SimBroker {
        &self.broker
    }

    /// Drain the queue to completion and summarise.
    pub fn run(mut self) -> Result<BacktestSummary, StrategyError> {
        while let Some(event) = self.queue.pop() {
            let timestamp = self.queue.current_time();
            self.matching.set_time(timestamp);

            if let BacktestEvent::Market(market) = &event {
                self.apply_market_event(market, timestamp);
            }

            let action = self.host.dispatch(&event)?;
            self.apply_action(action, timestamp);

            self.record_equity(timestamp);
        }

        self.host.destroy_all();

        let performance = statistic::summarize(
            &self.equity_curve,
            self.broker.closed_trades(),
            self.risk_free,
        );
        Ok(BacktestSummary {
            performance,
            final_equity: self
                .equity_curve
                .last()
                .map(|point| point.value)
                .unwrap_or(0.0),
            closed_trades: self.broker.closed_trades().to_vec(),
            equity_curve: self.equity_curve,
        })
    }

    /// Update books, prices and funding from a market event, filling any crossed resting
    /// orders.
    fn apply_market_event(&mut self, event: &MarketEvent, timestamp: u64) {
        let fills = match &event.kind {
            DataKind::Trade(trade) => {
                self.broker
                    .update_price(event.exchange, &event.symbol, trade.price);
                self.matching
                    .on_trade(event.exchange, &event.symbol, trade, timestamp)
            }
            DataKind::Depth(update) => {
                self.matching
                    .on_depth(event.exchange, &event.symbol, update, timestamp)
            }
            DataKind::MarkPrice(mark) => {
                self.broker
                    .update_price(event.exchange, &event.symbol, mark.mark_price);
                vec![]
            }
            DataKind::Kline(kline) => {
                self.broker
                    .update_price(event.exchange, &event.symbol, kline.close);
                vec![]
            }
            DataKind::Funding(funding) => {
                if let Some(mark_price) = funding.mark_price {
                    self.broker.apply_funding(
                        event.exchange,
                        &event.symbol,
                        funding.rate,
                        mark_price,
                    );
                }
                vec![]
            }
            DataKind::Ticker(ticker) => {
                self.broker
                    .update_price(event.exchange, &event.symbol, ticker.last_price);
                vec![]
            }
        };

        self.settle_fills(fills);
    }

    /// Execute a merged strategy action against the matching engine and broker.
    fn apply_action(&mut self, action: Action, _timestamp: u64) {
        for cancel in action.cancel_orders {
            self.matching.cancel_order(cancel);
        }
        for modify in action.modify_orders {
            if let Err(error) =
                self.matching
                    .modify_order(modify.order_id, modify.new_price, modify.new_quantity)
            {
                warn!(%error, order_id = modify.order_id, "modify refused");
            }
        }
        for request in action.orders {
            let position = self
                .broker
                .position(request.exchange, &request.symbol)
                .cloned();
            let (order, fills) = self.matching.submit_order(request, position.as_ref());
            if order.status == carry_execution::order::OrderStatus::Rejected {
                warn!(
                    order_id = order.id,
                    reason = order.reject_reason.as_deref().unwrap_or("unknown"),
                    "order rejected"
                );
            }
            self.settle_fills(fills);
        }
    }

    /// Apply fills to the broker and re-enter them as `OrderFilled` events.
    fn settle_fills(&mut self, fills: Vec<Fill>) {
        for fill in fills {
            if let Err(error) = self.broker.apply_fill(&fill) {
                warn!(%error, order_id = fill.order_id, "broker refused fill");
                continue;
            }
            self.queue
                .push(BacktestEvent::OrderFilled(OrderFillEvent::from(&fill)));
        }
    }

    fn record_equity(&mut self, timestamp: u64) {
        let time = DateTime::<Utc>::from_timestamp_millis(timestamp as i64).unwrap_or_default();
        let equity = self.broker.equity().to_f64().unwrap_or(0.0);
        match self.equity_curve.last_mut() {
            // One point per timestamp: replace within the same instant
            Some(point) if point.time == time => point.value = equity,
            _ => self.equity_curve.push(Timed::new(equity, time)),
        }
    }
}
