use crate::{
    config::{StrategyKind, SystemConfig},
    engine::buffer::{DEFAULT_BUFFER_CAPACITY, EventBuffer},
};
use async_trait::async_trait;
use carry_data::{
    engine::{MarketDataConfig, MarketDataEngine},
    error::DataError,
    event::{DataKind, MarketEvent},
    exchange::Channel,
};
use carry_execution::{
    client::VenueAdapter,
    error::ExecutionError,
    executor::{AccountConfig, ExecutorConfig, OrderExecutor},
    order::{AccountId, AccountState, OrderKind, OrderRequest, Position},
};
use carry_instrument::{PositionSide, Side, exchange::ExchangeId, symbol::Symbol};
use carry_risk::{ExecutorControl, RiskManager};
use carry_strategy::{
    arbitrage::{ArbitrageConfig, ArbitrageStrategy, SignalType, TickContext, TradeSignal},
    detector::{ArbitrageDetector, DetectorConfig},
    funding::{FundingCalculator, FundingConfig},
    inventory::{InventoryConfig, InventoryManager},
    sizer::{PositionSizer, SizerConfig},
};
use chrono::Utc;
use fnv::FnvHashMap;
use parking_lot::RwLock;
use rust_decimal::{Decimal, prelude::ToPrimitive};
use std::{collections::VecDeque, sync::Arc, time::Duration};
use thiserror::Error;
use tracing::{error, info, warn};

/// Bounded event buffer between market-data fan-out and the strategy loop.
pub mod buffer;

/// Engine startup / runtime failures.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("market data error: {0}")]
    Data(#[from] DataError),

    #[error("execution error: {0}")]
    Execution(#[from] ExecutionError),

    #[error("no strategy of a supported kind is enabled")]
    NoSupportedStrategy,
}

/// Bridges the risk manager's minimal executor seam onto the concrete executor and the
/// engine-owned position snapshot.
struct ExecutorBridge {
    executor: Arc<OrderExecutor>,
    positions: Arc<RwLock<Vec<Position>>>,
}

impl std::fmt::Debug for ExecutorBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutorBridge").finish()
    }
}

#[async_trait]
impl ExecutorControl for ExecutorBridge {
    fn pause_all(&self) {
        self.executor.pause_all();
    }

    fn resume_all(&self) {
        self.executor.resume_all();
    }

    async fn emergency_close_all(&self) -> usize {
        let positions = self.positions.read().clone();
        let results = self.executor.emergency_close_all(&positions).await;
        let submitted = results.iter().filter(|result| result.is_ok()).count();
        if submitted < results.len() {
            error!(
                failed = results.len() - submitted,
                "emergency close left positions open - operator intervention required"
            );
        }
        submitted
    }

    async fn reduce_position(
        &self,
        exchange: ExchangeId,
        symbol: &Symbol,
        ratio: Decimal,
    ) -> bool {
        let position = self
            .positions
            .read()
            .iter()
            .find(|position| position.exchange == exchange && &position.symbol == symbol)
            .cloned();
        match position {
            Some(position) => self.executor.close_position(&position, ratio).await.is_ok(),
            None => false,
        }
    }
}

/// Rolling mark-price returns used for the sizing volatility adjustment.
#[derive(Debug, Default)]
struct VolatilityWindow {
    last_price: Option<f64>,
    returns: VecDeque<f64>,
}

impl VolatilityWindow {
    const CAPACITY: usize = 300;

    fn observe(&mut self, price: f64) {
        if let Some(last) = self.last_price
            && last > 0.0
        {
            self.returns.push_back(price / last - 1.0);
            while self.returns.len() > Self::CAPACITY {
                self.returns.pop_front();
            }
        }
        self.last_price = Some(price);
    }

    /// Annualized realized volatility from per-tick returns (1s cadence).
    fn annualized(&self) -> f64 {
        let returns = self.returns.iter().copied().collect::<Vec<_>>();
        let per_tick = crate::statistic::sample_stdev(&returns);
        per_tick * (86_400.0 * 365.0f64).sqrt()
    }
}

/// Live-mode orchestrator: market data -> strategy -> risk -> executor, with inventory and
/// risk feedback.
///
/// The strategy/risk/executor pipeline runs on this single task, so inventory and risk state
/// need no locking beyond the snapshots shared with the risk bridge.
#[derive(Debug)]
pub struct TradingEngine {
    config: SystemConfig,
    market_data: MarketDataEngine,
    executor: Arc<OrderExecutor>,
    risk: Arc<RiskManager>,
    strategy: ArbitrageStrategy,
    positions: Arc<RwLock<Vec<Position>>>,
    account: AccountState,
    mark_prices: FnvHashMap<Symbol, Decimal>,
    volatility: FnvHashMap<Symbol, VolatilityWindow>,
    buffer: EventBuffer,
    shutdown: Arc<tokio::sync::Notify>,
}

/// Paper-trading opening balance.
const PAPER_BALANCE: u32 = 10_000;

impl TradingEngine {
    /// Assemble the engine from a validated configuration and a venue adapter.
    pub fn new(
        config: SystemConfig,
        adapter: Arc<dyn VenueAdapter>,
    ) -> Result<Self, EngineError> {
        let entry = config
            .strategies
            .iter()
            .find(|strategy| strategy.enabled && strategy.kind == StrategyKind::FundingArbitrage)
            .ok_or(EngineError::NoSupportedStrategy)?;

        let market_data = MarketDataEngine::new(MarketDataConfig {
            exchanges: config.exchange_ids(),
            ..MarketDataConfig::default()
        });

        let accounts = config
            .exchanges
            .iter()
            .map(|exchange| AccountConfig {
                id: AccountId::new(format!("{}-main", exchange.exchange)),
                exchange: exchange.exchange,
                weight: 1.0,
                enabled: true,
            })
            .collect();
        let executor = Arc::new(OrderExecutor::new(
            adapter,
            accounts,
            ExecutorConfig {
                max_parallel_orders: config.executor.max_concurrent_executions,
                max_retries: config.executor.max_retries,
                ..ExecutorConfig::default()
            },
        ));

        let positions = Arc::new(RwLock::new(Vec::new()));
        let risk = Arc::new(RiskManager::new(
            config.risk.clone(),
            Arc::new(ExecutorBridge {
                executor: Arc::clone(&executor),
                positions: Arc::clone(&positions),
            }),
        ));

        let strategy = ArbitrageStrategy::new(
            ArbitrageConfig {
                symbols: entry.symbols.clone(),
                min_spread_to_hold: entry.params.min_spread_to_hold,
                ..ArbitrageConfig::default()
            },
            FundingCalculator::new(FundingConfig::default()),
            InventoryManager::new(InventoryConfig::default()),
            PositionSizer::new(SizerConfig {
                kelly_fraction: entry.params.kelly_fraction,
                ..SizerConfig::default()
            }),
            ArbitrageDetector::new(DetectorConfig {
                min_spread_annualized: entry.params.min_spread_annualized,
                max_risk_score: entry.params.max_risk_score,
                ..DetectorConfig::default()
            }),
        );

        Ok(Self {
            config,
            market_data,
            executor,
            risk,
            strategy,
            positions,
            account: AccountState {
                balance: Decimal::from(PAPER_BALANCE),
                available_balance: Decimal::from(PAPER_BALANCE),
                ..AccountState::default()
            },
            mark_prices: FnvHashMap::default(),
            volatility: FnvHashMap::default(),
            buffer: EventBuffer::new(DEFAULT_BUFFER_CAPACITY),
            shutdown: Arc::new(tokio::sync::Notify::new()),
        })
    }

    /// Handle that requests a graceful stop of [`TradingEngine::run`].
    pub fn shutdown_handle(&self) -> Arc<tokio::sync::Notify> {
        Arc::clone(&self.shutdown)
    }

    /// Connect venues, subscribe the configured universe and start the supporting timers.
    pub fn start(&mut self) -> Result<(), EngineError> {
        self.market_data.start();

        let symbols = self.config.symbols();
        let channels = [
            Channel::Ticker,
            Channel::Depth5,
            Channel::Trades,
            Channel::MarkPrice,
            Channel::Funding,
        ];
        for exchange in self.config.exchange_ids() {
            self.market_data.subscribe(exchange, &symbols, &channels)?;
        }

        self.strategy.start();
        self.risk.spawn_timers();
        info!(?symbols, "TradingEngine started");
        Ok(())
    }

    /// Main loop: consume normalised events, tick the strategy each second, publish stats on
    /// the configured cadence, and stop gracefully on shutdown.
    pub async fn run(&mut self) -> Result<(), EngineError> {
        let mut events = self.market_data.events();
        let mut strategy_tick = tokio::time::interval(Duration::from_secs(1));
        strategy_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut metrics_tick = tokio::time::interval(Duration::from_secs(
            self.config.monitor.metrics_interval.max(1),
        ));
        metrics_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        let shutdown = Arc::clone(&self.shutdown);
        loop {
            tokio::select! {
                _ = shutdown.notified() => {
                    info!("shutdown requested");
                    break;
                }
                received = events.recv() => match received {
                    Ok(event) => {
                        self.buffer.push(event);
                        while let Some(event) = self.buffer.pop() {
                            self.process_event(event);
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "market event consumer lagged");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                        warn!("market data stream closed");
                        break;
                    }
                },
                _ = strategy_tick.tick() => {
                    self.on_strategy_tick().await;
                }
                _ = metrics_tick.tick() => {
                    self.publish_stats();
                }
            }
        }

        self.stop().await;
        Ok(())
    }

    /// Graceful stop: halt the strategy, cancel/park execution, unsubscribe and disconnect.
    pub async fn stop(&mut self) {
        self.strategy.stop();
        self.executor.pause_all();

        let symbols = self.config.symbols();
        let channels = [
            Channel::Ticker,
            Channel::Depth5,
            Channel::Trades,
            Channel::MarkPrice,
            Channel::Funding,
        ];
        for exchange in self.config.exchange_ids() {
            if let Err(data_error) = self.market_data.unsubscribe(exchange, &symbols, &channels) {
                warn!(%data_error, "unsubscribe failed during shutdown");
            }
        }
        self.market_data.stop();
        info!("TradingEngine stopped");
    }

    /// Route one normalised event into the books, risk inputs and strategy state.
    fn process_event(&mut self, event: MarketEvent) {
        match &event.kind {
            DataKind::Depth(update) => {
                self.executor.update_book(event.exchange, &event.symbol, update);
            }
            DataKind::MarkPrice(mark) => {
                self.mark_prices.insert(event.symbol.clone(), mark.mark_price);
                if event.symbol.base() == "BTC" {
                    self.risk.update_btc_price(event.time_exchange, mark.mark_price);
                }
                if let Some(price) = mark.mark_price.to_f64() {
                    self.volatility
                        .entry(event.symbol.clone())
                        .or_default()
                        .observe(price);
                }
            }
            DataKind::Ticker(ticker) => {
                self.mark_prices
                    .entry(event.symbol.clone())
                    .or_insert(ticker.last_price);
            }
            DataKind::Funding(funding) => {
                self.strategy
                    .on_funding(event.exchange, &event.symbol, funding, event.time_exchange);
            }
            DataKind::Trade(_) | DataKind::Kline(_) => {}
        }
    }

    /// One second of the strategy/risk/executor pipeline.
    async fn on_strategy_tick(&mut self) {
        let now = Utc::now();

        // Mark-to-market the shared position snapshot, then read it for the risk checks.
        // Liquidation estimates are maintained by the risk manager's own 1s timer.
        let mut unrealized = Decimal::ZERO;
        {
            let mut shared = self.positions.write();
            for position in shared.iter_mut() {
                if let Some(mark) = self.mark_prices.get(&position.symbol) {
                    position.update_unrealized(*mark);
                }
                unrealized += position.unrealized_pnl;
            }
        }
        self.account.unrealized_pnl_total = unrealized;
        let positions = self.positions.read().clone();

        let risk_events = self
            .risk
            .evaluate(&self.account, &positions, &self.mark_prices)
            .await;
        if !risk_events.is_empty() {
            warn!(?risk_events, "risk events raised");
        }

        let state = self.risk.state();
        let primary_symbol = self.config.symbols().into_iter().next();
        let volatility = primary_symbol
            .and_then(|symbol| self.volatility.get(&symbol))
            .map(|window| window.annualized())
            .filter(|volatility| *volatility > 0.0)
            .unwrap_or(0.02);

        let signals = self.strategy.tick(&TickContext {
            now,
            equity: self.account.equity(),
            current_drawdown: state.daily_drawdown,
            current_volatility: volatility,
            available_margin: self.account.available_balance,
            mark_prices: self.mark_prices.clone(),
        });

        for signal in signals {
            self.execute_signal(signal).await;
        }
    }

    /// Risk-gate and execute one strategy signal.
    async fn execute_signal(&mut self, signal: TradeSignal) {
        match signal.signal_type {
            SignalType::Open => {
                if self.config.executor.enable_risk_check && !self.risk.can_open_position() {
                    info!(signal = signal.id, "open signal refused by risk gate");
                    return;
                }
                let (Some(opportunity), Some(quantity)) =
                    (signal.opportunity.as_ref(), signal.sized_quantity)
                else {
                    return;
                };

                let legs = [
                    (opportunity.long_exchange, Side::Buy, PositionSide::Long),
                    (opportunity.short_exchange, Side::Sell, PositionSide::Short),
                ];
                for (exchange, side, direction) in legs {
                    match self
                        .executor
                        .execute(market_order(exchange, &signal.symbol, side, quantity, false))
                        .await
                    {
                        Ok(result) if !result.filled_quantity.is_zero() => {
                            self.strategy.inventory.update_position(
                                exchange,
                                &signal.symbol,
                                direction,
                                result.filled_quantity,
                                result.avg_price,
                                Decimal::from(3u32),
                            );
                            self.upsert_position(
                                exchange,
                                &signal.symbol,
                                direction,
                                result.filled_quantity,
                                result.avg_price,
                            );
                            self.account.total_fee += result.fee;
                        }
                        Ok(_) => {}
                        Err(execution_error) => {
                            warn!(%execution_error, %exchange, "open leg failed");
                        }
                    }
                }
                self.strategy.sizer.record_trade(signal.generated_at);
            }
            SignalType::Close => {
                let positions = self
                    .positions
                    .read()
                    .iter()
                    .filter(|position| position.symbol == signal.symbol)
                    .cloned()
                    .collect::<Vec<_>>();
                for position in positions {
                    match self.executor.close_position(&position, Decimal::ONE).await {
                        Ok(_) => {
                            self.strategy.inventory.update_position(
                                position.exchange,
                                &signal.symbol,
                                PositionSide::None,
                                Decimal::ZERO,
                                position.entry_price,
                                position.leverage,
                            );
                            self.remove_position(position.exchange, &signal.symbol);
                        }
                        Err(execution_error) => {
                            warn!(%execution_error, "close leg failed");
                        }
                    }
                }
            }
            SignalType::Rebalance => {
                for action in &signal.rebalance_actions {
                    let request = OrderRequest {
                        exchange: action.exchange,
                        symbol: action.symbol.clone(),
                        side: action.side,
                        kind: OrderKind::Market,
                        quantity: action.quantity,
                        price: None,
                        post_only: false,
                        reduce_only: true,
                        client_order_id: None,
                        account_id: None,
                        timeout: None,
                    };
                    if let Err(execution_error) = self.executor.execute(request).await {
                        warn!(%execution_error, "rebalance leg failed");
                    }
                }
            }
        }
    }

    fn upsert_position(
        &mut self,
        exchange: ExchangeId,
        symbol: &Symbol,
        direction: PositionSide,
        quantity: Decimal,
        price: Decimal,
    ) {
        let mut positions = self.positions.write();
        match positions
            .iter_mut()
            .find(|position| position.exchange == exchange && &position.symbol == symbol)
        {
            Some(position) => {
                let old_notional = position.entry_price * position.quantity;
                position.quantity += quantity;
                if !position.quantity.is_zero() {
                    position.entry_price =
                        (old_notional + price * quantity) / position.quantity;
                }
                position.side = direction;
            }
            None => positions.push(Position::new(
                exchange,
                symbol.clone(),
                direction,
                quantity,
                price,
                Decimal::from(3u32),
            )),
        }
    }

    fn remove_position(&mut self, exchange: ExchangeId, symbol: &Symbol) {
        self.positions
            .write()
            .retain(|position| !(position.exchange == exchange && &position.symbol == symbol));
    }

    fn publish_stats(&self) {
        let stats = self.market_data.stats();
        let state = self.risk.state();
        info!(
            messages_total = stats.messages_total,
            messages_per_sec = format!("{:.1}", stats.messages_per_sec),
            avg_latency_us = format!("{:.0}", stats.avg_processing_latency_us),
            equity = %state.current_equity,
            daily_drawdown = format!("{:.4}", state.daily_drawdown),
            strategies_paused = state.strategies_paused,
            sharpe = ?self.strategy.sharpe(),
            "engine statistics"
        );
    }
}

fn market_order(
    exchange: ExchangeId,
    symbol: &Symbol,
    side: Side,
    quantity: Decimal,
    reduce_only: bool,
) -> OrderRequest {
    OrderRequest {
        exchange,
        symbol: symbol.clone(),
        side,
        kind: OrderKind::Market,
        quantity,
        price: None,
        post_only: false,
        reduce_only,
        client_order_id: None,
        account_id: None,
        timeout: None,
    }
}
