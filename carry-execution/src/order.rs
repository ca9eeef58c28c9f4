use carry_instrument::{PositionSide, Side, exchange::ExchangeId, symbol::Symbol};
use chrono::{DateTime, Utc};
use derive_more::Display;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use std::time::Duration;

/// Venue-assigned order identifier.
#[derive(Debug, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Deserialize, Serialize, Display)]
pub struct OrderId(pub SmolStr);

impl OrderId {
    pub fn new<S>(id: S) -> Self
    where
        S: Into<SmolStr>,
    {
        Self(id.into())
    }
}

/// Client-assigned order identifier, unique per executor.
#[derive(Debug, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Deserialize, Serialize, Display)]
pub struct ClientOrderId(pub SmolStr);

impl ClientOrderId {
    pub fn new<S>(id: S) -> Self
    where
        S: Into<SmolStr>,
    {
        Self(id.into())
    }
}

/// Trading account identifier.
#[derive(Debug, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Deserialize, Serialize, Display)]
pub struct AccountId(pub SmolStr);

impl AccountId {
    pub fn new<S>(id: S) -> Self
    where
        S: Into<SmolStr>,
    {
        Self(id.into())
    }
}

#[derive(
    Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Deserialize, Serialize, Display,
)]
#[serde(rename_all = "snake_case")]
pub enum OrderKind {
    Market,
    Limit,
}

/// Order lifecycle status.
///
/// Transitions are monotonic along `Pending -> Partial -> Filled`, with the terminal
/// exceptions `Pending -> Cancelled`, `Pending -> Rejected` and `Partial -> Cancelled`.
#[derive(
    Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Deserialize, Serialize, Display,
)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Pending,
    Partial,
    Filled,
    Cancelled,
    Rejected,
}

impl OrderStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Filled | OrderStatus::Cancelled | OrderStatus::Rejected
        )
    }

    /// Whether the state chart permits moving from `self` to `next`.
    pub fn can_transition_to(&self, next: OrderStatus) -> bool {
        matches!(
            (self, next),
            (OrderStatus::Pending, OrderStatus::Partial)
                | (OrderStatus::Pending, OrderStatus::Filled)
                | (OrderStatus::Pending, OrderStatus::Cancelled)
                | (OrderStatus::Pending, OrderStatus::Rejected)
                | (OrderStatus::Partial, OrderStatus::Partial)
                | (OrderStatus::Partial, OrderStatus::Filled)
                | (OrderStatus::Partial, OrderStatus::Cancelled)
        )
    }
}

/// Immutable order submission request.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct OrderRequest {
    pub exchange: ExchangeId,
    pub symbol: Symbol,
    pub side: Side,
    pub kind: OrderKind,
    pub quantity: Decimal,
    pub price: Option<Decimal>,
    #[serde(default)]
    pub post_only: bool,
    #[serde(default)]
    pub reduce_only: bool,
    #[serde(default)]
    pub client_order_id: Option<ClientOrderId>,
    #[serde(default)]
    pub account_id: Option<AccountId>,
    /// End-to-end execution deadline; defaults to [`OrderRequest::DEFAULT_TIMEOUT`].
    #[serde(default)]
    pub timeout: Option<Duration>,
}

impl OrderRequest {
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(300);

    pub fn timeout(&self) -> Duration {
        self.timeout.unwrap_or(Self::DEFAULT_TIMEOUT)
    }

    /// Basic parameter validation shared by the matching engine and the live executor.
    pub fn validate(
        &self,
        min_quantity: Decimal,
        max_quantity: Decimal,
    ) -> Result<(), ValidationError> {
        if self.quantity <= Decimal::ZERO {
            return Err(ValidationError::Quantity(self.quantity));
        }
        if self.quantity < min_quantity || self.quantity > max_quantity {
            return Err(ValidationError::QuantityOutOfRange {
                quantity: self.quantity,
                min: min_quantity,
                max: max_quantity,
            });
        }
        match (self.kind, self.price) {
            (OrderKind::Limit, None) => Err(ValidationError::LimitRequiresPrice),
            (_, Some(price)) if price <= Decimal::ZERO => Err(ValidationError::Price(price)),
            _ => Ok(()),
        }
    }
}

/// Order parameter validation failure. Never retried.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("quantity must be positive, got {0}")]
    Quantity(Decimal),

    #[error("quantity {quantity} outside [{min}, {max}]")]
    QuantityOutOfRange {
        quantity: Decimal,
        min: Decimal,
        max: Decimal,
    },

    #[error("limit order requires a price")]
    LimitRequiresPrice,

    #[error("price must be positive, got {0}")]
    Price(Decimal),

    #[error("reduce_only requires an opposing position of at least the order quantity")]
    ReduceOnlyWithoutPosition,
}

/// A live order: an accepted [`OrderRequest`] plus its mutable fill state.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Order {
    /// System-assigned identifier, monotonic per broker.
    pub id: u64,
    pub request: OrderRequest,
    pub status: OrderStatus,
    pub filled_quantity: Decimal,
    pub avg_fill_price: Decimal,
    pub total_fee: Decimal,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub reject_reason: Option<String>,
}

impl Order {
    pub fn new(id: u64, request: OrderRequest, time: DateTime<Utc>) -> Self {
        Self {
            id,
            request,
            status: OrderStatus::Pending,
            filled_quantity: Decimal::ZERO,
            avg_fill_price: Decimal::ZERO,
            total_fee: Decimal::ZERO,
            created_at: time,
            updated_at: time,
            reject_reason: None,
        }
    }

    pub fn remaining_quantity(&self) -> Decimal {
        self.request.quantity - self.filled_quantity
    }

    /// Apply a fill, maintaining `filled_quantity <= quantity` and the
    /// `Filled <=> filled_quantity == quantity` invariant.
    pub fn apply_fill(&mut self, quantity: Decimal, price: Decimal, fee: Decimal, time: DateTime<Utc>) {
        debug_assert!(quantity <= self.remaining_quantity());

        let previous_notional = self.avg_fill_price * self.filled_quantity;
        self.filled_quantity += quantity;
        if !self.filled_quantity.is_zero() {
            self.avg_fill_price = (previous_notional + price * quantity) / self.filled_quantity;
        }
        self.total_fee += fee;
        self.status = if self.filled_quantity == self.request.quantity {
            OrderStatus::Filled
        } else {
            OrderStatus::Partial
        };
        self.updated_at = time;
    }

    /// Move to `next` if the state chart permits it, returning whether a transition occurred.
    pub fn transition(&mut self, next: OrderStatus, time: DateTime<Utc>) -> bool {
        if self.status.can_transition_to(next) {
            self.status = next;
            self.updated_at = time;
            true
        } else {
            false
        }
    }

    pub fn reject(&mut self, reason: impl Into<String>, time: DateTime<Utc>) {
        self.status = OrderStatus::Rejected;
        self.reject_reason = Some(reason.into());
        self.updated_at = time;
    }
}

/// Margin mode of a perpetual position.
#[derive(
    Debug, Copy, Clone, Eq, PartialEq, Default, Deserialize, Serialize, Display,
)]
#[serde(rename_all = "snake_case")]
pub enum MarginMode {
    #[default]
    Cross,
    Isolated,
}

/// An open perpetual position on one venue.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Position {
    pub exchange: ExchangeId,
    pub symbol: Symbol,
    pub side: PositionSide,
    pub quantity: Decimal,
    pub entry_price: Decimal,
    pub unrealized_pnl: Decimal,
    pub realized_pnl: Decimal,
    pub leverage: Decimal,
    pub margin_mode: MarginMode,
    pub isolated_margin: Decimal,
    pub liquidation_price: Option<Decimal>,
    pub funding_fee: Decimal,
}

impl Position {
    pub fn new(
        exchange: ExchangeId,
        symbol: Symbol,
        side: PositionSide,
        quantity: Decimal,
        entry_price: Decimal,
        leverage: Decimal,
    ) -> Self {
        Self {
            exchange,
            symbol,
            side,
            quantity,
            entry_price,
            unrealized_pnl: Decimal::ZERO,
            realized_pnl: Decimal::ZERO,
            leverage,
            margin_mode: MarginMode::default(),
            isolated_margin: Decimal::ZERO,
            liquidation_price: None,
            funding_fee: Decimal::ZERO,
        }
    }

    pub fn notional(&self) -> Decimal {
        self.entry_price * self.quantity
    }

    pub fn is_flat(&self) -> bool {
        self.side == PositionSide::None
    }

    /// Mark-to-market the position.
    pub fn update_unrealized(&mut self, mark_price: Decimal) {
        self.unrealized_pnl = match self.side {
            PositionSide::Long => (mark_price - self.entry_price) * self.quantity,
            PositionSide::Short => (self.entry_price - mark_price) * self.quantity,
            PositionSide::None => Decimal::ZERO,
        };
    }

    /// Estimated liquidation price under the provided maintenance-margin rate.
    ///
    /// Long: `entry * (1 - 1/leverage + mmr)`; short: `entry * (1 + 1/leverage - mmr)`.
    pub fn estimate_liquidation_price(&self, maintenance_margin_rate: Decimal) -> Option<Decimal> {
        if self.leverage.is_zero() {
            return None;
        }
        let inverse_leverage = Decimal::ONE / self.leverage;
        match self.side {
            PositionSide::Long => Some(
                self.entry_price * (Decimal::ONE - inverse_leverage + maintenance_margin_rate),
            ),
            PositionSide::Short => Some(
                self.entry_price * (Decimal::ONE + inverse_leverage - maintenance_margin_rate),
            ),
            PositionSide::None => None,
        }
    }
}

/// Aggregate account state.
#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize, Serialize)]
pub struct AccountState {
    pub balance: Decimal,
    pub available_balance: Decimal,
    pub used_margin: Decimal,
    pub unrealized_pnl_total: Decimal,
    pub realized_pnl_total: Decimal,
    pub total_fee: Decimal,
    pub total_funding_fee: Decimal,
}

impl AccountState {
    /// `balance + unrealized_pnl_total`.
    pub fn equity(&self) -> Decimal {
        self.balance + self.unrealized_pnl_total
    }

    /// `used_margin / equity`, zero when equity is non-positive.
    pub fn margin_ratio(&self) -> Decimal {
        let equity = self.equity();
        if equity <= Decimal::ZERO {
            Decimal::ZERO
        } else {
            self.used_margin / equity
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn request(kind: OrderKind, quantity: Decimal, price: Option<Decimal>) -> OrderRequest {
        OrderRequest {
            exchange: ExchangeId::Binance,
            symbol: Symbol::new("BTC/USDT:USDT"),
            side: Side::Buy,
            kind,
            quantity,
            price,
            post_only: false,
            reduce_only: false,
            client_order_id: None,
            account_id: None,
            timeout: None,
        }
    }

    #[test]
    fn test_request_validation() {
        struct TestCase {
            request: OrderRequest,
            valid: bool,
        }

        let tests = vec![
            TestCase {
                // TC0: valid market order
                request: request(OrderKind::Market, dec!(1), None),
                valid: true,
            },
            TestCase {
                // TC1: zero quantity
                request: request(OrderKind::Market, dec!(0), None),
                valid: false,
            },
            TestCase {
                // TC2: limit without price
                request: request(OrderKind::Limit, dec!(1), None),
                valid: false,
            },
            TestCase {
                // TC3: non-positive price
                request: request(OrderKind::Limit, dec!(1), Some(dec!(0))),
                valid: false,
            },
            TestCase {
                // TC4: quantity above max
                request: request(OrderKind::Market, dec!(1000), None),
                valid: false,
            },
        ];

        for (index, test) in tests.into_iter().enumerate() {
            assert_eq!(
                test.request.validate(dec!(0.001), dec!(100)).is_ok(),
                test.valid,
                "TC{index} failed"
            );
        }
    }

    #[test]
    fn test_order_status_transitions() {
        struct TestCase {
            from: OrderStatus,
            to: OrderStatus,
            allowed: bool,
        }

        let tests = vec![
            TestCase {
                // TC0
                from: OrderStatus::Pending,
                to: OrderStatus::Partial,
                allowed: true,
            },
            TestCase {
                // TC1
                from: OrderStatus::Pending,
                to: OrderStatus::Cancelled,
                allowed: true,
            },
            TestCase {
                // TC2
                from: OrderStatus::Partial,
                to: OrderStatus::Filled,
                allowed: true,
            },
            TestCase {
                // TC3: filled is terminal
                from: OrderStatus::Filled,
                to: OrderStatus::Cancelled,
                allowed: false,
            },
            TestCase {
                // TC4: cancelled is terminal
                from: OrderStatus::Cancelled,
                to: OrderStatus::Partial,
                allowed: false,
            },
            TestCase {
                // TC5: no un-filling
                from: OrderStatus::Filled,
                to: OrderStatus::Partial,
                allowed: false,
            },
            TestCase {
                // TC6: a partial order cannot be rejected
                from: OrderStatus::Partial,
                to: OrderStatus::Rejected,
                allowed: false,
            },
        ];

        for (index, test) in tests.into_iter().enumerate() {
            assert_eq!(
                test.from.can_transition_to(test.to),
                test.allowed,
                "TC{index} failed"
            );
        }
    }

    #[test]
    fn test_apply_fill_accumulates_vwap_and_status() {
        let mut order = Order::new(1, request(OrderKind::Limit, dec!(3), Some(dec!(100))), Utc::now());

        order.apply_fill(dec!(1), dec!(100), dec!(0.02), Utc::now());
        assert_eq!(order.status, OrderStatus::Partial);
        assert_eq!(order.filled_quantity, dec!(1));
        assert_eq!(order.avg_fill_price, dec!(100));

        order.apply_fill(dec!(2), dec!(101), dec!(0.04), Utc::now());
        assert_eq!(order.status, OrderStatus::Filled);
        assert_eq!(order.filled_quantity, dec!(3));
        // (1*100 + 2*101) / 3
        assert_eq!(order.avg_fill_price, dec!(302) / dec!(3));
        assert_eq!(order.total_fee, dec!(0.06));
        assert!(order.filled_quantity <= order.request.quantity);
    }

    #[test]
    fn test_position_liquidation_price() {
        let mut long = Position::new(
            ExchangeId::Binance,
            Symbol::new("BTC/USDT:USDT"),
            PositionSide::Long,
            dec!(1),
            dec!(100),
            dec!(10),
        );
        // 100 * (1 - 0.1 + 0.005)
        assert_eq!(
            long.estimate_liquidation_price(dec!(0.005)),
            Some(dec!(90.5))
        );

        long.side = PositionSide::Short;
        // 100 * (1 + 0.1 - 0.005)
        assert_eq!(
            long.estimate_liquidation_price(dec!(0.005)),
            Some(dec!(109.5))
        );
    }

    #[test]
    fn test_account_equity_and_margin_ratio() {
        let account = AccountState {
            balance: dec!(1000),
            available_balance: dec!(700),
            used_margin: dec!(300),
            unrealized_pnl_total: dec!(-100),
            ..AccountState::default()
        };
        assert_eq!(account.equity(), dec!(900));
        assert_eq!(account.margin_ratio(), dec!(300) / dec!(900));
    }
}
