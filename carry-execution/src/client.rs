use crate::{
    error::AdapterError,
    order::{AccountId, OrderId, OrderRequest, OrderStatus},
};
use async_trait::async_trait;
use carry_data::event::DepthUpdate;
use carry_instrument::{exchange::ExchangeId, symbol::Symbol};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Acknowledgement of an order submission.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct SubmitAck {
    pub order_id: OrderId,
    pub status: OrderStatus,
}

/// Venue-reported order state.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct OrderStatusReport {
    pub status: OrderStatus,
    pub filled_quantity: Decimal,
    pub avg_price: Decimal,
    pub fee: Decimal,
}

/// Contract of a concrete venue trading adapter, consumed by the
/// [`OrderExecutor`](crate::executor::OrderExecutor).
///
/// Implementations own authentication, request signing and transport; failures surface as
/// [`AdapterError`]s whose [`code`](AdapterError::code) drives retry classification.
#[async_trait]
pub trait VenueAdapter: Send + Sync {
    async fn submit_order(
        &self,
        account: &AccountId,
        request: &OrderRequest,
        nonce: u64,
    ) -> Result<SubmitAck, AdapterError>;

    async fn cancel_order(
        &self,
        account: &AccountId,
        exchange: ExchangeId,
        symbol: &Symbol,
        order_id: &OrderId,
    ) -> Result<bool, AdapterError>;

    async fn get_order_status(
        &self,
        account: &AccountId,
        exchange: ExchangeId,
        symbol: &Symbol,
        order_id: &OrderId,
    ) -> Result<OrderStatusReport, AdapterError>;

    async fn get_order_book(
        &self,
        exchange: ExchangeId,
        symbol: &Symbol,
        depth: usize,
    ) -> Result<DepthUpdate, AdapterError>;
}

/// Scriptable [`VenueAdapter`] test double.
///
/// Submission outcomes and status reports are consumed FIFO; calls are recorded for
/// assertion.
#[derive(Debug, Default)]
pub struct MockVenue {
    state: parking_lot::Mutex<MockVenueState>,
}

#[derive(Debug, Default)]
struct MockVenueState {
    submit_results: std::collections::VecDeque<Result<SubmitAck, AdapterError>>,
    status_results: std::collections::VecDeque<Result<OrderStatusReport, AdapterError>>,
    cancel_results: std::collections::VecDeque<Result<bool, AdapterError>>,
    book: Option<DepthUpdate>,
    submitted_nonces: Vec<u64>,
    submitted_requests: Vec<OrderRequest>,
    cancelled_orders: Vec<OrderId>,
    status_queries: usize,
    in_flight: usize,
    max_in_flight: usize,
}

impl MockVenue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_submit(&self, result: Result<SubmitAck, AdapterError>) {
        self.state.lock().submit_results.push_back(result);
    }

    pub fn push_status(&self, result: Result<OrderStatusReport, AdapterError>) {
        self.state.lock().status_results.push_back(result);
    }

    pub fn push_cancel(&self, result: Result<bool, AdapterError>) {
        self.state.lock().cancel_results.push_back(result);
    }

    pub fn set_book(&self, book: DepthUpdate) {
        self.state.lock().book = Some(book);
    }

    pub fn submitted_nonces(&self) -> Vec<u64> {
        self.state.lock().submitted_nonces.clone()
    }

    pub fn submitted_requests(&self) -> Vec<OrderRequest> {
        self.state.lock().submitted_requests.clone()
    }

    pub fn cancelled_orders(&self) -> Vec<OrderId> {
        self.state.lock().cancelled_orders.clone()
    }

    pub fn status_queries(&self) -> usize {
        self.state.lock().status_queries
    }

    /// Highest number of concurrently in-flight submissions observed.
    pub fn max_in_flight_submissions(&self) -> usize {
        self.state.lock().max_in_flight
    }
}

#[async_trait]
impl VenueAdapter for MockVenue {
    async fn submit_order(
        &self,
        _account: &AccountId,
        request: &OrderRequest,
        nonce: u64,
    ) -> Result<SubmitAck, AdapterError> {
        {
            let mut state = self.state.lock();
            state.submitted_nonces.push(nonce);
            state.submitted_requests.push(request.clone());
            state.in_flight += 1;
            state.max_in_flight = state.max_in_flight.max(state.in_flight);
        }

        // Yield so overlapping submissions are observable
        tokio::task::yield_now().await;

        let mut state = self.state.lock();
        state.in_flight -= 1;
        state.submit_results.pop_front().unwrap_or_else(|| {
            Ok(SubmitAck {
                order_id: OrderId::new(format!("mock-{nonce}")),
                status: OrderStatus::Pending,
            })
        })
    }

    async fn cancel_order(
        &self,
        _account: &AccountId,
        _exchange: ExchangeId,
        _symbol: &Symbol,
        order_id: &OrderId,
    ) -> Result<bool, AdapterError> {
        let mut state = self.state.lock();
        state.cancelled_orders.push(order_id.clone());
        state.cancel_results.pop_front().unwrap_or(Ok(true))
    }

    async fn get_order_status(
        &self,
        _account: &AccountId,
        _exchange: ExchangeId,
        _symbol: &Symbol,
        _order_id: &OrderId,
    ) -> Result<OrderStatusReport, AdapterError> {
        let mut state = self.state.lock();
        state.status_queries += 1;
        state.status_results.pop_front().unwrap_or_else(|| {
            Ok(OrderStatusReport {
                status: OrderStatus::Pending,
                filled_quantity: Decimal::ZERO,
                avg_price: Decimal::ZERO,
                fee: Decimal::ZERO,
            })
        })
    }

    async fn get_order_book(
        &self,
        _exchange: ExchangeId,
        _symbol: &Symbol,
        _depth: usize,
    ) -> Result<DepthUpdate, AdapterError> {
        self.state
            .lock()
            .book
            .clone()
            .ok_or_else(|| AdapterError::new(None, "no mock book configured"))
    }
}
