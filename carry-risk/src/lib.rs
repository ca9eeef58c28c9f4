#![forbid(unsafe_code)]
#![warn(
    unused,
    clippy::cognitive_complexity,
    unused_crate_dependencies,
    unused_extern_crates,
    clippy::unused_self,
    clippy::useless_let_if_seq,
    missing_debug_implementations,
    rust_2018_idioms,
    rust_2024_compatibility
)]
#![allow(clippy::type_complexity, clippy::too_many_arguments, type_alias_bounds)]

//! # Carry-Risk
//! Real-time risk manager for the Carry perpetual-futures trading ecosystem.
//!
//! A single [`RiskManager`] handle owns the process-wide [`RiskState`](state::RiskState)
//! (explicitly constructed at engine start and threaded through dependants - no hidden
//! globals). On every account/position update the ordered checks run - margin,
//! concentration, BTC crash, daily drawdown, liquidation distance - each behind its own
//! re-fire cooldown. Emergency actions reach execution only through the minimal
//! [`ExecutorControl`] seam.

use async_trait::async_trait;
use carry_execution::order::{AccountState, Position};
use carry_instrument::{exchange::ExchangeId, symbol::Symbol};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use fnv::FnvHashMap;
use parking_lot::{Mutex, RwLock};
use rust_decimal::{Decimal, prelude::ToPrimitive};
use serde::{Deserialize, Serialize};
use std::{collections::VecDeque, sync::Arc, time::Duration};
use tracing::{error, info, warn};

pub mod state;

use state::RiskState;

/// Minimal execution surface the risk manager may act on.
///
/// Kept deliberately small to break the engine/executor/risk reference cycle.
#[async_trait]
pub trait ExecutorControl: Send + Sync {
    fn pause_all(&self);
    fn resume_all(&self);
    /// Close every open position, best-effort. Returns the number of close orders submitted.
    async fn emergency_close_all(&self) -> usize;
    /// Reduce one position by `ratio` (1 = full close), best-effort.
    async fn reduce_position(&self, exchange: ExchangeId, symbol: &Symbol, ratio: Decimal)
    -> bool;
}

/// Risk-check thresholds. Defaults follow the production configuration.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct RiskConfig {
    /// Emergency-close floor for `total_equity / total_notional`.
    pub min_margin_ratio: Decimal,
    /// Per-base-asset concentration alert threshold, as a fraction of equity.
    pub max_position_ratio: Decimal,
    /// Peak-to-current BTC drop triggering the crash response.
    pub btc_crash_threshold: f64,
    /// Lookback window for the BTC crash check.
    pub btc_crash_window: Duration,
    /// Fraction by which every non-BTC position is reduced on a crash.
    pub altcoin_reduce_ratio: Decimal,
    /// Daily drawdown triggering emergency close.
    pub max_daily_drawdown: f64,
    /// Liquidation-distance warning threshold as a fraction of current price.
    pub liquidation_distance_threshold: Decimal,
    pub maintenance_margin_rate: Decimal,
    /// Minimum interval before the same check may re-fire.
    pub cooldown_period: Duration,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            min_margin_ratio: Decimal::new(35, 2),              // 0.35
            max_position_ratio: Decimal::new(12, 2),            // 0.12
            btc_crash_threshold: 0.06,
            btc_crash_window: Duration::from_secs(600),
            altcoin_reduce_ratio: Decimal::new(70, 2),          // 0.70
            max_daily_drawdown: 0.07,
            liquidation_distance_threshold: Decimal::new(5, 2), // 0.05
            maintenance_margin_rate: Decimal::new(5, 3),        // 0.005
            cooldown_period: Duration::from_secs(300),
        }
    }
}

/// Risk event emitted towards the engine and operators.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub enum RiskEvent {
    /// Margin breached the emergency floor: strategies paused, positions closing.
    MarginCall { margin_ratio: Decimal },
    /// A base asset concentrates too much of the portfolio. Warning only.
    PositionAlert { base: String, ratio: Decimal },
    /// BTC dropped sharply inside the window; non-BTC positions are being reduced.
    BtcCrash { drop: f64 },
    /// Daily drawdown breached the limit: strategies paused, positions closing.
    DrawdownLimit { drawdown: f64 },
    /// A position trades within the critical distance of its liquidation price.
    LiquidationWarning {
        exchange: ExchangeId,
        symbol: Symbol,
        distance: Decimal,
    },
    /// Strategies resumed after margin recovery on date rollover.
    StrategiesResumed,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
enum CheckKind {
    Margin,
    Concentration,
    BtcCrash,
    Drawdown,
    LiquidationDistance,
}

/// Single-writer process-wide risk manager.
pub struct RiskManager {
    config: RiskConfig,
    executor: Arc<dyn ExecutorControl>,
    state: RwLock<RiskState>,
    cooldowns: Mutex<FnvHashMap<CheckKind, DateTime<Utc>>>,
    btc_history: Mutex<VecDeque<(DateTime<Utc>, Decimal)>>,
    /// Latest position snapshot, refreshed by [`RiskManager::evaluate`] and consumed by the
    /// liquidation-price timer.
    positions_cache: RwLock<Vec<Position>>,
    marks_cache: RwLock<FnvHashMap<Symbol, Decimal>>,
    events_tx: tokio::sync::broadcast::Sender<RiskEvent>,
}

impl std::fmt::Debug for RiskManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RiskManager")
            .field("config", &self.config)
            .field("state", &*self.state.read())
            .finish()
    }
}

impl RiskManager {
    pub fn new(config: RiskConfig, executor: Arc<dyn ExecutorControl>) -> Self {
        let (events_tx, _) = tokio::sync::broadcast::channel(256);
        Self {
            config,
            executor,
            state: RwLock::new(RiskState::new(Utc::now())),
            cooldowns: Mutex::new(FnvHashMap::default()),
            btc_history: Mutex::new(VecDeque::new()),
            positions_cache: RwLock::new(Vec::new()),
            marks_cache: RwLock::new(FnvHashMap::default()),
            events_tx,
        }
    }

    /// Atomic snapshot of the current [`RiskState`].
    pub fn state(&self) -> RiskState {
        self.state.read().clone()
    }

    /// New broadcast receiver of [`RiskEvent`]s.
    pub fn events(&self) -> tokio::sync::broadcast::Receiver<RiskEvent> {
        self.events_tx.subscribe()
    }

    /// Record a BTC mark-price observation for the crash window.
    pub fn update_btc_price(&self, time: DateTime<Utc>, price: Decimal) {
        let window = ChronoDuration::from_std(self.config.btc_crash_window)
            .unwrap_or_else(|_| ChronoDuration::seconds(600));
        let mut history = self.btc_history.lock();
        history.push_back((time, price));
        while let Some((oldest, _)) = history.front() {
            if time.signed_duration_since(*oldest) > window {
                history.pop_front();
            } else {
                break;
            }
        }
    }

    /// Run the ordered risk checks against the latest account and position snapshot.
    ///
    /// Emergency actions (pause + close, crash reduction) are triggered internally; the
    /// returned events mirror what was broadcast.
    pub async fn evaluate(
        &self,
        account: &AccountState,
        positions: &[Position],
        mark_prices: &FnvHashMap<Symbol, Decimal>,
    ) -> Vec<RiskEvent> {
        let equity = account.equity();
        let total_notional: Decimal = positions
            .iter()
            .filter(|position| !position.is_flat())
            .map(Position::notional)
            .sum();
        let margin_ratio = (!total_notional.is_zero()).then(|| equity / total_notional);

        {
            let mut state = self.state.write();
            state.observe_equity(equity);
            state.total_margin_ratio = margin_ratio;
            if !state.enabled {
                return vec![];
            }
        }

        // Keep the timer-facing snapshot current
        *self.positions_cache.write() = positions.to_vec();
        *self.marks_cache.write() = mark_prices.clone();

        let mut events = Vec::new();
        self.check_margin(margin_ratio, &mut events).await;
        self.check_concentration(equity, positions, &mut events);
        self.check_btc_crash(positions, &mut events).await;
        self.check_drawdown(&mut events).await;
        self.check_liquidation_distance(positions, mark_prices, &mut events);

        for event in &events {
            let _ = self.events_tx.send(event.clone());
        }
        events
    }

    /// Atomic snapshot of the cached positions, with their latest liquidation estimates.
    pub fn positions_snapshot(&self) -> Vec<Position> {
        self.positions_cache.read().clone()
    }

    /// Open-position gate consulted by strategies before sizing a new entry.
    pub fn can_open_position(&self) -> bool {
        let state = self.state.read();
        if state.strategies_paused {
            return false;
        }
        if let Some(margin_ratio) = state.total_margin_ratio
            && margin_ratio < self.config.min_margin_ratio * Decimal::new(15, 1)
        {
            return false;
        }
        state.daily_drawdown < 0.8 * self.config.max_daily_drawdown
    }

    /// Recompute liquidation-price estimates for the provided positions.
    pub fn refresh_liquidation_prices(&self, positions: &mut [Position]) {
        for position in positions.iter_mut().filter(|position| !position.is_flat()) {
            position.liquidation_price =
                position.estimate_liquidation_price(self.config.maintenance_margin_rate);
        }
    }

    /// One pass of the 1-second timer: refresh the cached positions' liquidation estimates
    /// and raise (cooldown-gated) distance warnings against the latest marks.
    fn refresh_liquidation_estimates(&self) {
        let mut events = Vec::new();
        {
            let mut positions = self.positions_cache.write();
            self.refresh_liquidation_prices(&mut positions);
            let marks = self.marks_cache.read();
            self.check_liquidation_distance(&positions, &marks, &mut events);
        }
        for event in events {
            let _ = self.events_tx.send(event);
        }
    }

    /// Check for a UTC date change; driven by the 60-second timer.
    ///
    /// On rollover: snapshot the daily opening equity, reset the peak, and resume strategies
    /// if margin has recovered.
    pub fn check_date_rollover(&self, now: DateTime<Utc>) {
        let mut state = self.state.write();
        let today = now.date_naive();
        if state.current_date == today {
            return;
        }

        info!(%today, "risk date rollover");
        state.roll_date(today);

        let margin_recovered = state
            .total_margin_ratio
            .is_none_or(|ratio| ratio >= self.config.min_margin_ratio);
        if state.strategies_paused && margin_recovered {
            state.strategies_paused = false;
            state.pause_reason = None;
            drop(state);
            self.executor.resume_all();
            let _ = self.events_tx.send(RiskEvent::StrategiesResumed);
            info!("strategies resumed after margin recovery");
        }
    }

    /// Spawn the periodic timers: liquidation-price refresher (1s) and date-change
    /// checker (60s). Tasks exit when the manager is dropped.
    pub fn spawn_timers(self: &Arc<Self>) {
        let manager = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(1));
            loop {
                ticker.tick().await;
                let Some(manager) = manager.upgrade() else {
                    return;
                };
                manager.refresh_liquidation_estimates();
            }
        });

        let manager = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(60));
            loop {
                ticker.tick().await;
                let Some(manager) = manager.upgrade() else {
                    return;
                };
                manager.check_date_rollover(Utc::now());
            }
        });
    }

    /// Reset all state. Exists solely to support tests.
    pub fn reset(&self) {
        *self.state.write() = RiskState::new(Utc::now());
        self.cooldowns.lock().clear();
        self.btc_history.lock().clear();
        self.positions_cache.write().clear();
        self.marks_cache.write().clear();
    }

    async fn check_margin(&self, margin_ratio: Option<Decimal>, events: &mut Vec<RiskEvent>) {
        let Some(margin_ratio) = margin_ratio else {
            return;
        };
        if margin_ratio >= self.config.min_margin_ratio || !self.fire(CheckKind::Margin) {
            return;
        }

        error!(%margin_ratio, "margin below emergency floor - pausing and closing all");
        self.pause("margin_call");
        let closed = self.executor.emergency_close_all().await;
        warn!(closed, "emergency close submitted");
        events.push(RiskEvent::MarginCall { margin_ratio });
    }

    fn check_concentration(
        &self,
        equity: Decimal,
        positions: &[Position],
        events: &mut Vec<RiskEvent>,
    ) {
        if equity <= Decimal::ZERO {
            return;
        }

        let mut notional_by_base: FnvHashMap<String, Decimal> = FnvHashMap::default();
        for position in positions.iter().filter(|position| !position.is_flat()) {
            *notional_by_base
                .entry(position.symbol.base().to_owned())
                .or_default() += position.notional();
        }

        for (base, notional) in notional_by_base {
            let ratio = notional / equity;
            if ratio > self.config.max_position_ratio && self.fire(CheckKind::Concentration) {
                warn!(%base, %ratio, "position concentration alert");
                events.push(RiskEvent::PositionAlert { base, ratio });
            }
        }
    }

    async fn check_btc_crash(&self, positions: &[Position], events: &mut Vec<RiskEvent>) {
        let drop = {
            let history = self.btc_history.lock();
            let Some(max) = history.iter().map(|(_, price)| *price).max() else {
                return;
            };
            let Some((_, current)) = history.back() else {
                return;
            };
            if max.is_zero() {
                return;
            }
            ((max - current) / max).to_f64().unwrap_or(0.0)
        };

        if drop < self.config.btc_crash_threshold || !self.fire(CheckKind::BtcCrash) {
            return;
        }

        error!(drop, "BTC crash detected - reducing altcoin exposure");
        for position in positions
            .iter()
            .filter(|position| !position.is_flat() && position.symbol.base() != "BTC")
        {
            let reduced = self
                .executor
                .reduce_position(
                    position.exchange,
                    &position.symbol,
                    self.config.altcoin_reduce_ratio,
                )
                .await;
            if !reduced {
                warn!(
                    exchange = %position.exchange,
                    symbol = %position.symbol,
                    "crash reduction failed"
                );
            }
        }
        events.push(RiskEvent::BtcCrash { drop });
    }

    async fn check_drawdown(&self, events: &mut Vec<RiskEvent>) {
        let drawdown = self.state.read().daily_drawdown;
        if drawdown < self.config.max_daily_drawdown || !self.fire(CheckKind::Drawdown) {
            return;
        }

        error!(drawdown, "daily drawdown limit breached - pausing and closing all");
        self.pause("daily_drawdown");
        let closed = self.executor.emergency_close_all().await;
        warn!(closed, "emergency close submitted");
        events.push(RiskEvent::DrawdownLimit { drawdown });
    }

    fn check_liquidation_distance(
        &self,
        positions: &[Position],
        mark_prices: &FnvHashMap<Symbol, Decimal>,
        events: &mut Vec<RiskEvent>,
    ) {
        for position in positions.iter().filter(|position| !position.is_flat()) {
            let Some(current) = mark_prices.get(&position.symbol).copied() else {
                continue;
            };
            if current.is_zero() {
                continue;
            }
            let Some(liquidation) = position
                .liquidation_price
                .or_else(|| position.estimate_liquidation_price(self.config.maintenance_margin_rate))
            else {
                continue;
            };

            let distance = (liquidation - current).abs() / current;
            if distance < self.config.liquidation_distance_threshold
                && self.fire(CheckKind::LiquidationDistance)
            {
                error!(
                    exchange = %position.exchange,
                    symbol = %position.symbol,
                    %distance,
                    "position critically close to liquidation"
                );
                events.push(RiskEvent::LiquidationWarning {
                    exchange: position.exchange,
                    symbol: position.symbol.clone(),
                    distance,
                });
            }
        }
    }

    fn pause(&self, reason: &str) {
        {
            let mut state = self.state.write();
            state.strategies_paused = true;
            state.pause_reason = Some(reason.to_owned());
            state.last_trigger_time = Some(Utc::now());
            state.trigger_count += 1;
        }
        self.executor.pause_all();
    }

    /// Cooldown gate: returns whether the check may fire, recording the trigger time if so.
    fn fire(&self, kind: CheckKind) -> bool {
        let cooldown = ChronoDuration::from_std(self.config.cooldown_period)
            .unwrap_or_else(|_| ChronoDuration::seconds(300));
        let now = Utc::now();
        let mut cooldowns = self.cooldowns.lock();
        match cooldowns.get(&kind) {
            Some(last) if now.signed_duration_since(*last) < cooldown => false,
            _ => {
                cooldowns.insert(kind, now);
                true
            }
        }
    }
}
