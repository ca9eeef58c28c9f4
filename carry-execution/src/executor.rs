use crate::{
    client::{OrderStatusReport, SubmitAck, VenueAdapter},
    error::{ApiErrorCode, ExecutionError},
    order::{
        AccountId, OrderId, OrderKind, OrderRequest, OrderStatus, Position,
    },
};
use carry_data::{books::OrderBook, event::DepthUpdate};
use carry_instrument::{Side, exchange::ExchangeId, symbol::Symbol};
use chrono::Utc;
use fnv::FnvHashMap;
use rand::Rng;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Configuration of the [`OrderExecutor`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutorConfig {
    /// Upper bound on concurrently executing requests across all accounts.
    pub max_parallel_orders: usize,
    /// Limit-order status polling cadence.
    pub poll_interval: Duration,
    /// Retry budget for retryable failures.
    pub max_retries: u32,
    /// Wait applied after a RATE_LIMIT classification.
    pub rate_limit_wait: Duration,
    /// Short wait applied after a NONCE_CONFLICT classification.
    pub nonce_retry_wait: Duration,
    /// Post-only price adjustment distance away from the opposite best, as a fraction.
    pub self_trade_distance: Decimal,
    pub min_quantity: Decimal,
    pub max_quantity: Decimal,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_parallel_orders: 10,
            poll_interval: Duration::from_millis(50),
            max_retries: 3,
            rate_limit_wait: Duration::from_secs(1),
            nonce_retry_wait: Duration::from_millis(100),
            self_trade_distance: Decimal::new(1, 4), // 0.01%
            min_quantity: Decimal::new(1, 6),
            max_quantity: Decimal::from(1_000_000u32),
        }
    }
}

/// Static configuration of one trading account.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct AccountConfig {
    pub id: AccountId,
    pub exchange: ExchangeId,
    /// Weight for random account selection among enabled accounts of the venue.
    pub weight: f64,
    pub enabled: bool,
}

/// Per-account runtime: the serialization latch and the nonce counter.
#[derive(Debug)]
struct AccountRuntime {
    config: AccountConfig,
    latch: tokio::sync::Mutex<()>,
    nonce: AtomicU64,
}

impl AccountRuntime {
    /// Allocate the next nonce: `max(current + 1, now_ms)`, strictly monotonic per account.
    fn next_nonce(&self) -> u64 {
        let now_ms = Utc::now().timestamp_millis().max(0) as u64;
        let previous = self
            .nonce
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |current| {
                Some(current.saturating_add(1).max(now_ms))
            })
            .unwrap_or(now_ms);
        previous.saturating_add(1).max(now_ms)
    }
}

/// Entry of the live own-order ledger, consulted by the self-trade guard.
#[derive(Debug, Clone, PartialEq, Eq)]
struct OwnOrder {
    order_id: OrderId,
    side: Side,
    price: Decimal,
    quantity: Decimal,
    account: AccountId,
}

/// Final outcome of one executed request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionResult {
    pub order_id: OrderId,
    pub status: OrderStatus,
    pub filled_quantity: Decimal,
    pub avg_price: Decimal,
    pub fee: Decimal,
    pub attempts: u32,
}

type MarketKey = (ExchangeId, Symbol);

enum CompletionOutcome {
    Completed(ExecutionResult),
    /// Deadline expired with no fill after a cancel attempt; retryable.
    TimedOutNoFill,
}

/// Risk-disciplined order executor.
///
/// Submissions on one account are strictly serialized behind that account's latch (the only
/// lock intentionally held across suspension points - released by guard on every path);
/// inter-account parallelism is bounded by `max_parallel_orders`.
pub struct OrderExecutor {
    adapter: Arc<dyn VenueAdapter>,
    config: ExecutorConfig,
    accounts: Vec<Arc<AccountRuntime>>,
    parallel: Arc<tokio::sync::Semaphore>,
    own_orders: parking_lot::Mutex<FnvHashMap<MarketKey, Vec<OwnOrder>>>,
    books: parking_lot::RwLock<FnvHashMap<MarketKey, OrderBook>>,
    paused: AtomicBool,
}

impl std::fmt::Debug for OrderExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrderExecutor")
            .field("config", &self.config)
            .field("accounts", &self.accounts.len())
            .field("paused", &self.paused.load(Ordering::Relaxed))
            .finish()
    }
}

impl OrderExecutor {
    pub fn new(
        adapter: Arc<dyn VenueAdapter>,
        accounts: Vec<AccountConfig>,
        config: ExecutorConfig,
    ) -> Self {
        let parallel = Arc::new(tokio::sync::Semaphore::new(config.max_parallel_orders));
        Self {
            adapter,
            config,
            accounts: accounts
                .into_iter()
                .map(|config| {
                    Arc::new(AccountRuntime {
                        config,
                        latch: tokio::sync::Mutex::new(()),
                        nonce: AtomicU64::new(0),
                    })
                })
                .collect(),
            parallel,
            own_orders: parking_lot::Mutex::new(FnvHashMap::default()),
            books: parking_lot::RwLock::new(FnvHashMap::default()),
            paused: AtomicBool::new(false),
        }
    }

    /// Stop accepting new opening orders. Reduce-only orders still pass, so emergency closes
    /// work while paused.
    pub fn pause_all(&self) {
        self.paused.store(true, Ordering::Relaxed);
        info!("OrderExecutor paused");
    }

    pub fn resume_all(&self) {
        self.paused.store(false, Ordering::Relaxed);
        info!("OrderExecutor resumed");
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Relaxed)
    }

    /// Update the cached book for `(exchange, symbol)` from a market-data fan-out.
    pub fn update_book(&self, exchange: ExchangeId, symbol: &Symbol, update: &DepthUpdate) {
        self.books
            .write()
            .entry((exchange, symbol.clone()))
            .or_default()
            .apply(update, Utc::now());
    }

    /// Refresh the cached book on demand via the venue adapter.
    pub async fn refresh_book(
        &self,
        exchange: ExchangeId,
        symbol: &Symbol,
        depth: usize,
    ) -> Result<(), ExecutionError> {
        let update = self
            .adapter
            .get_order_book(exchange, symbol, depth)
            .await
            .map_err(|source| ExecutionError::Api {
                code: source.code(),
                attempts: 1,
                source,
            })?;
        self.update_book(exchange, symbol, &update);
        Ok(())
    }

    /// Execute one order request end-to-end per the execution protocol.
    pub async fn execute(
        &self,
        mut request: OrderRequest,
    ) -> Result<ExecutionResult, ExecutionError> {
        if self.is_paused() && !request.reduce_only {
            return Err(ExecutionError::Paused);
        }
        request.validate(self.config.min_quantity, self.config.max_quantity)?;

        let _permit = self
            .parallel
            .acquire()
            .await
            .map_err(|_| ExecutionError::Paused)?;

        let account = self.select_account(&request)?;
        // Per-account latch: serializes submission and nonce allocation on this account
        let _latch = account.latch.lock().await;

        self.self_trade_guard(&mut request)?;

        let deadline_budget = request.timeout();
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            let nonce = account.next_nonce();
            let deadline = Instant::now() + deadline_budget;

            let submitted = tokio::time::timeout_at(
                deadline,
                self.adapter
                    .submit_order(&account.config.id, &request, nonce),
            )
            .await;

            match submitted {
                Err(_elapsed) => {
                    warn!(attempts, "order submission timed out");
                    if attempts <= self.config.max_retries {
                        continue;
                    }
                    return Err(ExecutionError::Timeout { attempts });
                }
                Ok(Err(source)) => {
                    let code = source.code();
                    if code.is_retryable() && attempts <= self.config.max_retries {
                        debug!(%code, attempts, "retryable venue error");
                        match code {
                            ApiErrorCode::RateLimit => {
                                tokio::time::sleep(self.config.rate_limit_wait).await
                            }
                            ApiErrorCode::NonceConflict => {
                                tokio::time::sleep(self.config.nonce_retry_wait).await
                            }
                            _ => {}
                        }
                        continue;
                    }
                    return Err(ExecutionError::Api {
                        code,
                        attempts,
                        source,
                    });
                }
                Ok(Ok(ack)) => {
                    if request.kind == OrderKind::Limit {
                        self.track_own_order(&request, &ack, &account.config.id);
                    }

                    let outcome = self.await_completion(&account, &request, &ack, deadline).await;
                    self.clear_own_order(&request, &ack.order_id);

                    match outcome {
                        Ok(CompletionOutcome::Completed(mut result)) => {
                            result.attempts = attempts;
                            return Ok(result);
                        }
                        Ok(CompletionOutcome::TimedOutNoFill) => {
                            if attempts <= self.config.max_retries {
                                continue;
                            }
                            return Err(ExecutionError::Timeout { attempts });
                        }
                        Err(error) => return Err(error),
                    }
                }
            }
        }
    }

    /// Close every open position with reduce-only market orders. Best-effort: each failure is
    /// reported, none aborts the sweep.
    pub async fn emergency_close_all(
        &self,
        positions: &[Position],
    ) -> Vec<Result<ExecutionResult, ExecutionError>> {
        let mut results = Vec::new();
        for position in positions.iter().filter(|position| !position.is_flat()) {
            results.push(self.close_position(position, Decimal::ONE).await);
        }
        results
    }

    /// Reduce one position by `ratio` (1 = full close) with a reduce-only market order.
    pub async fn close_position(
        &self,
        position: &Position,
        ratio: Decimal,
    ) -> Result<ExecutionResult, ExecutionError> {
        let Some(exit_side) = position.side.exit_side() else {
            return Err(ExecutionError::Rejected {
                reason: "position already flat".to_owned(),
            });
        };

        self.execute(OrderRequest {
            exchange: position.exchange,
            symbol: position.symbol.clone(),
            side: exit_side,
            kind: OrderKind::Market,
            quantity: position.quantity * ratio,
            price: None,
            post_only: false,
            reduce_only: true,
            client_order_id: None,
            account_id: None,
            timeout: None,
        })
        .await
    }

    /// Count of live tracked own-orders, exposed for observability.
    pub fn live_own_orders(&self) -> usize {
        self.own_orders.lock().values().map(Vec::len).sum()
    }

    /// Select `request.account_id`, or a weighted-random enabled account for the venue.
    fn select_account(
        &self,
        request: &OrderRequest,
    ) -> Result<Arc<AccountRuntime>, ExecutionError> {
        if let Some(requested) = &request.account_id {
            return self
                .accounts
                .iter()
                .find(|account| {
                    &account.config.id == requested && account.config.exchange == request.exchange
                })
                .cloned()
                .ok_or(ExecutionError::NoAccount(request.exchange));
        }

        let candidates = self
            .accounts
            .iter()
            .filter(|account| account.config.enabled && account.config.exchange == request.exchange)
            .collect::<Vec<_>>();

        let total_weight: f64 = candidates.iter().map(|account| account.config.weight).sum();
        if candidates.is_empty() || total_weight <= 0.0 {
            return Err(ExecutionError::NoAccount(request.exchange));
        }

        let mut pick = rand::rng().random_range(0.0..total_weight);
        for account in &candidates {
            pick -= account.config.weight;
            if pick <= 0.0 {
                return Ok(Arc::clone(account));
            }
        }
        Ok(Arc::clone(candidates[candidates.len() - 1]))
    }

    /// Reject (or, for post-only, re-price) a request that would cross a live own-order on the
    /// same market.
    fn self_trade_guard(&self, request: &mut OrderRequest) -> Result<(), ExecutionError> {
        let key = (request.exchange, request.symbol.clone());

        let crossing = {
            let ledger = self.own_orders.lock();
            let Some(own_orders) = ledger.get(&key) else {
                return Ok(());
            };
            own_orders
                .iter()
                .filter(|own| own.side == request.side.opposite())
                .any(|own| match (request.kind, request.price) {
                    (OrderKind::Market, _) => true,
                    (OrderKind::Limit, Some(price)) => match request.side {
                        Side::Buy => price >= own.price,
                        Side::Sell => price <= own.price,
                    },
                    (OrderKind::Limit, None) => false,
                })
        };

        if !crossing {
            return Ok(());
        }

        if request.post_only {
            // Re-price a passive order just inside the opposite best from the cached book
            let books = self.books.read();
            let adjusted = books.get(&key).and_then(|book| match request.side {
                Side::Buy => book
                    .best_ask()
                    .map(|ask| ask.price * (Decimal::ONE - self.config.self_trade_distance)),
                Side::Sell => book
                    .best_bid()
                    .map(|bid| bid.price * (Decimal::ONE + self.config.self_trade_distance)),
            });

            if let Some(price) = adjusted {
                debug!(%price, "post-only self-trade adjustment applied");
                request.price = Some(price);
                return Ok(());
            }
        }

        Err(ExecutionError::SelfTradeRisk {
            exchange: request.exchange,
            symbol: request.symbol.to_string(),
        })
    }

    fn track_own_order(&self, request: &OrderRequest, ack: &SubmitAck, account: &AccountId) {
        let Some(price) = request.price else { return };
        self.own_orders
            .lock()
            .entry((request.exchange, request.symbol.clone()))
            .or_default()
            .push(OwnOrder {
                order_id: ack.order_id.clone(),
                side: request.side,
                price,
                quantity: request.quantity,
                account: account.clone(),
            });
    }

    fn clear_own_order(&self, request: &OrderRequest, order_id: &OrderId) {
        let mut ledger = self.own_orders.lock();
        if let Some(own_orders) = ledger.get_mut(&(request.exchange, request.symbol.clone())) {
            own_orders.retain(|own| &own.order_id != order_id);
            if own_orders.is_empty() {
                ledger.remove(&(request.exchange, request.symbol.clone()));
            }
        }
    }

    async fn await_completion(
        &self,
        account: &AccountRuntime,
        request: &OrderRequest,
        ack: &SubmitAck,
        deadline: Instant,
    ) -> Result<CompletionOutcome, ExecutionError> {
        // Market orders and immediate fills: one status query and done
        if request.kind == OrderKind::Market || ack.status == OrderStatus::Filled {
            let report = self.query_status(account, request, &ack.order_id).await?;
            return Ok(CompletionOutcome::Completed(result_from(ack, &report)));
        }

        loop {
            if Instant::now() >= deadline {
                return self.cancel_at_deadline(account, request, ack).await;
            }

            tokio::time::sleep(self.config.poll_interval).await;

            match self
                .adapter
                .get_order_status(&account.config.id, request.exchange, &request.symbol, &ack.order_id)
                .await
            {
                Ok(report) => match report.status {
                    OrderStatus::Filled | OrderStatus::Cancelled => {
                        return Ok(CompletionOutcome::Completed(result_from(ack, &report)));
                    }
                    OrderStatus::Rejected => {
                        return Err(ExecutionError::Rejected {
                            reason: "order rejected during polling".to_owned(),
                        });
                    }
                    OrderStatus::Pending | OrderStatus::Partial => continue,
                },
                Err(error) => {
                    // Transient status-query failures are retried until the deadline
                    debug!(%error, "order status query failed");
                    continue;
                }
            }
        }
    }

    async fn cancel_at_deadline(
        &self,
        account: &AccountRuntime,
        request: &OrderRequest,
        ack: &SubmitAck,
    ) -> Result<CompletionOutcome, ExecutionError> {
        if let Err(error) = self
            .adapter
            .cancel_order(&account.config.id, request.exchange, &request.symbol, &ack.order_id)
            .await
        {
            warn!(%error, "deadline cancel failed");
        }

        let report = self.query_status(account, request, &ack.order_id).await?;
        if report.filled_quantity > Decimal::ZERO {
            // Partial fill before the deadline: a success, not a retry
            let mut result = result_from(ack, &report);
            if !result.status.is_terminal() {
                result.status = OrderStatus::Partial;
            }
            return Ok(CompletionOutcome::Completed(result));
        }

        Ok(CompletionOutcome::TimedOutNoFill)
    }

    async fn query_status(
        &self,
        account: &AccountRuntime,
        request: &OrderRequest,
        order_id: &OrderId,
    ) -> Result<OrderStatusReport, ExecutionError> {
        self.adapter
            .get_order_status(&account.config.id, request.exchange, &request.symbol, order_id)
            .await
            .map_err(|source| ExecutionError::Api {
                code: source.code(),
                attempts: 1,
                source,
            })
    }
}

fn result_from(ack: &SubmitAck, report: &OrderStatusReport) -> ExecutionResult {
    ExecutionResult {
        order_id: ack.order_id.clone(),
        status: report.status,
        filled_quantity: report.filled_quantity,
        avg_price: report.avg_price,
        fee: report.fee,
        attempts: 0,
    }
}
