use crate::backtest::matching::Fill;
use carry_execution::order::{AccountState, Position};
use carry_instrument::{PositionSide, exchange::ExchangeId, symbol::Symbol};
#[cfg(test)]
use carry_instrument::Side;
use fnv::FnvHashMap;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

/// Simulated broker configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct BrokerConfig {
    pub initial_cash: Decimal,
    pub default_leverage: Decimal,
    /// With margin enabled, opening locks `notional / leverage`; otherwise the full notional.
    pub margin_enabled: bool,
    pub allow_short: bool,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            initial_cash: Decimal::from(10_000u32),
            default_leverage: Decimal::ONE,
            margin_enabled: true,
            allow_short: true,
        }
    }
}

/// A completed round trip appended on every position reduction.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ClosedTrade {
    pub id: u64,
    pub exchange: ExchangeId,
    pub symbol: Symbol,
    /// Direction of the closed position.
    pub side: PositionSide,
    pub quantity: Decimal,
    pub entry_price: Decimal,
    pub exit_price: Decimal,
    pub entry_time_ms: u64,
    pub exit_time_ms: u64,
    pub pnl: Decimal,
    pub pnl_percent: Decimal,
    pub commission: Decimal,
    pub net_pnl: Decimal,
}

/// Broker-level failures surfaced to the backtest runner.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BrokerError {
    #[error("short selling is disabled")]
    ShortNotAllowed,

    #[error("insufficient cash: need {required}, have {available}")]
    InsufficientCash {
        required: Decimal,
        available: Decimal,
    },
}

#[derive(Debug, Clone)]
struct Holding {
    position: Position,
    opened_at_ms: u64,
}

/// Simulated broker: cash, positions, realized/unrealized P&L and the closed-trade log.
#[derive(Debug)]
pub struct SimBroker {
    config: BrokerConfig,
    cash: Decimal,
    positions: FnvHashMap<(ExchangeId, Symbol), Holding>,
    closed_trades: Vec<ClosedTrade>,
    trade_counter: u64,
    total_fee: Decimal,
    total_funding_fee: Decimal,
    price_cache: FnvHashMap<(ExchangeId, Symbol), Decimal>,
}

impl SimBroker {
    pub fn new(config: BrokerConfig) -> Self {
        let cash = config.initial_cash;
        Self {
            config,
            cash,
            positions: FnvHashMap::default(),
            closed_trades: Vec::new(),
            trade_counter: 0,
            total_fee: Decimal::ZERO,
            total_funding_fee: Decimal::ZERO,
            price_cache: FnvHashMap::default(),
        }
    }

    pub fn cash(&self) -> Decimal {
        self.cash
    }

    pub fn position(&self, exchange: ExchangeId, symbol: &Symbol) -> Option<&Position> {
        self.positions
            .get(&(exchange, symbol.clone()))
            .map(|holding| &holding.position)
    }

    pub fn positions(&self) -> impl Iterator<Item = &Position> {
        self.positions.values().map(|holding| &holding.position)
    }

    pub fn closed_trades(&self) -> &[ClosedTrade] {
        &self.closed_trades
    }

    /// Cache the latest traded/mark price and refresh unrealized P&L.
    pub fn update_price(&mut self, exchange: ExchangeId, symbol: &Symbol, price: Decimal) {
        self.price_cache.insert((exchange, symbol.clone()), price);
        if let Some(holding) = self.positions.get_mut(&(exchange, symbol.clone())) {
            holding.position.update_unrealized(price);
        }
    }

    /// Apply an execution to cash and positions per the open/add/reduce rules.
    pub fn apply_fill(&mut self, fill: &Fill) -> Result<(), BrokerError> {
        self.total_fee += fill.fee;
        self.cash -= fill.fee;

        let key = (fill.exchange, fill.symbol.clone());
        let fill_direction = PositionSide::from(fill.side);

        match self.positions.get(&key).map(|holding| holding.position.side) {
            // Open: no existing position
            None => self.open_position(fill, fill_direction)?,
            Some(existing) if existing == fill_direction => self.add_to_position(fill),
            // Reduce/close, possibly flipping into the remainder
            Some(_) => {
                let remainder = self.reduce_position(fill);
                if !remainder.is_zero() {
                    if fill.reduce_only {
                        warn!(
                            order_id = fill.order_id,
                            %remainder,
                            "reduce-only remainder discarded"
                        );
                    } else {
                        let mut opening = fill.clone();
                        opening.quantity = remainder;
                        // Fee already charged for the whole fill
                        opening.fee = Decimal::ZERO;
                        self.open_position(&opening, fill_direction)?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Apply a funding settlement: longs pay positive rates, shorts receive them.
    pub fn apply_funding(
        &mut self,
        exchange: ExchangeId,
        symbol: &Symbol,
        rate: Decimal,
        mark_price: Decimal,
    ) {
        let Some(holding) = self.positions.get_mut(&(exchange, symbol.clone())) else {
            return;
        };
        let position = &mut holding.position;
        if position.is_flat() {
            return;
        }

        let notional = position.quantity * mark_price;
        let fee = match position.side {
            PositionSide::Long => notional * rate,
            PositionSide::Short => -(notional * rate),
            PositionSide::None => Decimal::ZERO,
        };
        position.funding_fee += fee;
        self.total_funding_fee += fee;
        self.cash -= fee;
    }

    /// Aggregate account snapshot: `equity = balance + unrealized`.
    pub fn account_state(&self) -> AccountState {
        let used_margin: Decimal = self
            .positions
            .values()
            .map(|holding| margin_for(&self.config, holding.position.notional()))
            .sum();
        let unrealized: Decimal = self
            .positions
            .values()
            .map(|holding| holding.position.unrealized_pnl)
            .sum();
        let realized: Decimal = self.closed_trades.iter().map(|trade| trade.pnl).sum();

        AccountState {
            balance: self.cash + used_margin,
            available_balance: self.cash,
            used_margin,
            unrealized_pnl_total: unrealized,
            realized_pnl_total: realized,
            total_fee: self.total_fee,
            total_funding_fee: self.total_funding_fee,
        }
    }

    pub fn equity(&self) -> Decimal {
        let account = self.account_state();
        account.equity()
    }

    fn open_position(
        &mut self,
        fill: &Fill,
        direction: PositionSide,
    ) -> Result<(), BrokerError> {
        if direction == PositionSide::Short && !self.config.allow_short {
            return Err(BrokerError::ShortNotAllowed);
        }

        let margin = margin_for(&self.config, fill.price * fill.quantity);
        if margin > self.cash {
            return Err(BrokerError::InsufficientCash {
                required: margin,
                available: self.cash,
            });
        }
        self.cash -= margin;

        let mut position = Position::new(
            fill.exchange,
            fill.symbol.clone(),
            direction,
            fill.quantity,
            fill.price,
            self.config.default_leverage,
        );
        if let Some(price) = self.price_cache.get(&(fill.exchange, fill.symbol.clone())) {
            position.update_unrealized(*price);
        }
        self.positions.insert(
            (fill.exchange, fill.symbol.clone()),
            Holding {
                position,
                opened_at_ms: fill.timestamp,
            },
        );
        Ok(())
    }

    fn add_to_position(&mut self, fill: &Fill) {
        let margin = margin_for(&self.config, fill.price * fill.quantity);
        self.cash -= margin;

        let Some(holding) = self
            .positions
            .get_mut(&(fill.exchange, fill.symbol.clone()))
        else {
            return;
        };
        let position = &mut holding.position;

        let old_notional = position.entry_price * position.quantity;
        position.quantity += fill.quantity;
        position.entry_price = (old_notional + fill.price * fill.quantity) / position.quantity;
    }

    /// Reduce the position by up to the fill quantity, returning any unapplied remainder.
    fn reduce_position(&mut self, fill: &Fill) -> Decimal {
        let key = (fill.exchange, fill.symbol.clone());
        let Some(holding) = self.positions.get_mut(&key) else {
            return fill.quantity;
        };
        let position = &mut holding.position;

        let close_quantity = position.quantity.min(fill.quantity);
        let remainder = fill.quantity - close_quantity;

        let pnl = match position.side {
            PositionSide::Long => (fill.price - position.entry_price) * close_quantity,
            PositionSide::Short => (position.entry_price - fill.price) * close_quantity,
            PositionSide::None => Decimal::ZERO,
        };

        // Return the margin held for the closed quantity, plus the realized P&L
        let released_margin = margin_for(&self.config, position.entry_price * close_quantity);
        self.cash += released_margin + pnl;

        let entry_notional = position.entry_price * close_quantity;
        self.trade_counter += 1;
        self.closed_trades.push(ClosedTrade {
            id: self.trade_counter,
            exchange: fill.exchange,
            symbol: fill.symbol.clone(),
            side: position.side,
            quantity: close_quantity,
            entry_price: position.entry_price,
            exit_price: fill.price,
            entry_time_ms: holding.opened_at_ms,
            exit_time_ms: fill.timestamp,
            pnl,
            pnl_percent: if entry_notional.is_zero() {
                Decimal::ZERO
            } else {
                pnl / entry_notional
            },
            commission: fill.fee,
            net_pnl: pnl - fill.fee,
        });

        position.quantity -= close_quantity;
        if position.quantity.is_zero() {
            self.positions.remove(&key);
        }
        remainder
    }

}

fn margin_for(config: &BrokerConfig, notional: Decimal) -> Decimal {
    if config.margin_enabled && !config.default_leverage.is_zero() {
        notional / config.default_leverage
    } else {
        notional
    }
}
