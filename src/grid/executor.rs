//! Exchange abstraction for grid trading - enables mocking for tests
//!
//! The engine talks to the exchange only through [`OrderGateway`]. Transport,
//! signing and response parsing live in the implementor; every call returns
//! a [`GridResult`] whose error kind drives the shared [`RetryPolicy`].

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::warn;

use super::backoff::ExponentialBackoff;
use super::config::{GridConfig, InstrumentMeta};
use super::errors::{GridError, GridResult};
use super::types::{Balance, CancelOutcome, FeeRates, OrderAck, PlaceOrderRequest, RemoteOrder};

/// Exchange operations trait - can be mocked for testing
#[async_trait]
pub trait OrderGateway: Send + Sync {
    /// Place a limit order
    async fn place_order(&self, request: &PlaceOrderRequest) -> GridResult<OrderAck>;

    /// Cancel an order; orders already filled or gone report `AlreadyTerminal`
    async fn cancel_order(&self, symbol: &str, order_id: &str) -> GridResult<CancelOutcome>;

    /// Open orders plus recently closed ones
    async fn query_open_and_recent(&self, symbol: &str) -> GridResult<Vec<RemoteOrder>>;

    /// Look up a single order, `None` if the exchange has no record of it
    async fn query_order(&self, symbol: &str, order_id: &str) -> GridResult<Option<RemoteOrder>>;

    async fn query_balance(&self, asset: &str) -> GridResult<Balance>;

    async fn query_instrument(&self, symbol: &str) -> GridResult<InstrumentMeta>;

    async fn query_fee_rates(&self, symbol: &str) -> GridResult<FeeRates>;

    /// Last traded price
    async fn query_price(&self, symbol: &str) -> GridResult<f64>;
}

/// Uniform retry for gateway calls: only transient errors are retried,
/// with delay `base * 2^(attempt - 1)`.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(2000),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    pub fn from_config(config: &GridConfig) -> Self {
        Self {
            max_attempts: config.max_order_retries.max(1),
            base_delay: Duration::from_millis(config.retry_base_delay_ms),
            ..Self::default()
        }
    }

    /// Run `operation` until it succeeds, fails permanently, or runs out of attempts
    pub async fn run<T, F, Fut>(&self, name: &str, operation: F) -> GridResult<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = GridResult<T>>,
    {
        let backoff = ExponentialBackoff::new(self.base_delay, self.max_delay, 0.0);
        let mut attempts = 0;

        loop {
            match operation().await {
                Ok(result) => return Ok(result),
                Err(e) if !e.is_retryable() => return Err(e),
                Err(e) => {
                    attempts += 1;
                    if attempts >= self.max_attempts {
                        return Err(GridError::RetriesExhausted {
                            operation: name.to_string(),
                            attempts,
                            reason: e.to_string(),
                        });
                    }
                    let delay = backoff.delay_for(attempts - 1);
                    warn!(
                        "{} failed (attempt {}/{}), retrying in {}ms: {}",
                        name,
                        attempts,
                        self.max_attempts,
                        delay.as_millis(),
                        e
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

// ============================================================================
// Mock Implementation for Testing
// ============================================================================

/// Mock gateway for exercising engines without an exchange connection.
pub mod mock {
    use super::*;
    use crate::grid::types::{OrderSide, OrderStatus};
    use std::collections::{HashMap, HashSet};
    use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
    use tokio::sync::Mutex;

    /// Scriptable in-memory exchange
    pub struct MockGateway {
        pub placed: Arc<Mutex<Vec<PlaceOrderRequest>>>,
        pub cancelled: Arc<Mutex<Vec<String>>>,
        pub orders: Arc<Mutex<HashMap<String, RemoteOrder>>>,
        quantities: Arc<Mutex<HashMap<String, f64>>>,
        pub balances: Arc<Mutex<HashMap<String, Balance>>>,
        pub price: Arc<Mutex<f64>>,
        pub instrument: Arc<Mutex<InstrumentMeta>>,
        pub fees: Arc<Mutex<FeeRates>>,
        /// Orders omitted from `query_open_and_recent` but still queryable
        pub hidden: Arc<Mutex<HashSet<String>>>,
        /// Fill every order at its limit price as soon as it is placed
        pub auto_fill: Arc<Mutex<bool>>,
        /// Fill only orders that cross the current price on placement
        pub fill_marketable: Arc<Mutex<bool>>,
        /// Next N placements fail with a transient error
        pub transient_failures: AtomicU32,
        /// Next N placements are rejected
        pub rejections: AtomicU32,
        /// Every placement fails with a transient error
        pub should_fail: Arc<Mutex<bool>>,
        pub place_calls: AtomicU32,
        next_oid: AtomicU64,
    }

    impl MockGateway {
        pub fn new(price: f64) -> Self {
            Self {
                placed: Arc::new(Mutex::new(Vec::new())),
                cancelled: Arc::new(Mutex::new(Vec::new())),
                orders: Arc::new(Mutex::new(HashMap::new())),
                quantities: Arc::new(Mutex::new(HashMap::new())),
                balances: Arc::new(Mutex::new(HashMap::new())),
                price: Arc::new(Mutex::new(price)),
                instrument: Arc::new(Mutex::new(InstrumentMeta::new(
                    0.01, 0.001, 0.001, "BTC", "USDT",
                ))),
                fees: Arc::new(Mutex::new(FeeRates::default())),
                hidden: Arc::new(Mutex::new(HashSet::new())),
                auto_fill: Arc::new(Mutex::new(false)),
                fill_marketable: Arc::new(Mutex::new(false)),
                transient_failures: AtomicU32::new(0),
                rejections: AtomicU32::new(0),
                should_fail: Arc::new(Mutex::new(false)),
                place_calls: AtomicU32::new(0),
                next_oid: AtomicU64::new(1),
            }
        }

        pub async fn set_price(&self, price: f64) {
            *self.price.lock().await = price;
        }

        pub async fn set_balance(&self, asset: &str, available: f64) {
            self.balances.lock().await.insert(
                asset.to_string(),
                Balance {
                    total: available,
                    available,
                    locked: 0.0,
                },
            );
        }

        pub async fn balance(&self, asset: &str) -> f64 {
            self.balances
                .lock()
                .await
                .get(asset)
                .map(|b| b.available)
                .unwrap_or(0.0)
        }

        pub async fn set_should_fail(&self, fail: bool) {
            *self.should_fail.lock().await = fail;
        }

        pub async fn set_auto_fill(&self, enabled: bool) {
            *self.auto_fill.lock().await = enabled;
        }

        pub async fn set_fill_marketable(&self, enabled: bool) {
            *self.fill_marketable.lock().await = enabled;
        }

        pub fn fail_next(&self, transient: u32) {
            self.transient_failures.store(transient, Ordering::SeqCst);
        }

        pub fn reject_next(&self, count: u32) {
            self.rejections.store(count, Ordering::SeqCst);
        }

        pub async fn placed_count(&self) -> usize {
            self.placed.lock().await.len()
        }

        pub async fn last_placed(&self) -> Option<PlaceOrderRequest> {
            self.placed.lock().await.last().cloned()
        }

        /// Ids of orders still open on the mock book
        pub async fn open_order_ids(&self) -> Vec<String> {
            let mut ids: Vec<String> = self
                .orders
                .lock()
                .await
                .values()
                .filter(|o| !o.status.is_terminal())
                .map(|o| o.order_id.clone())
                .collect();
            ids.sort();
            ids
        }

        /// Fill an order (fully when `qty` is `None`) and settle balances
        pub async fn fill_order(&self, order_id: &str, qty: Option<f64>) -> Option<RemoteOrder> {
            let full_qty = self.quantities.lock().await.get(order_id).copied();
            let filled = {
                let mut orders = self.orders.lock().await;
                let order = orders.get_mut(order_id)?;
                order.filled_qty = qty.or(full_qty).unwrap_or(order.filled_qty);
                order.status = OrderStatus::Filled;
                order.clone()
            };
            self.settle(&filled).await;
            Some(filled)
        }

        /// Report a partial execution without closing the order
        pub async fn partially_fill(&self, order_id: &str, qty: f64) {
            if let Some(order) = self.orders.lock().await.get_mut(order_id) {
                order.filled_qty = qty;
                order.status = OrderStatus::PartiallyFilled;
            }
        }

        /// Cancel an order on the exchange side
        pub async fn cancel_remote(&self, order_id: &str) {
            if let Some(order) = self.orders.lock().await.get_mut(order_id) {
                order.status = OrderStatus::Cancelled;
            }
        }

        /// Keep an order queryable but leave it out of listings
        pub async fn hide(&self, order_id: &str) {
            self.hidden.lock().await.insert(order_id.to_string());
        }

        /// Drop every trace of an order
        pub async fn forget(&self, order_id: &str) {
            self.orders.lock().await.remove(order_id);
            self.hidden.lock().await.insert(order_id.to_string());
        }

        async fn settle(&self, order: &RemoteOrder) {
            let (base, quote) = {
                let meta = self.instrument.lock().await;
                (meta.base_asset.clone(), meta.quote_asset.clone())
            };
            let notional = order.price * order.filled_qty;
            let mut balances = self.balances.lock().await;
            let (credit, debit, credit_amt, debit_amt) = match order.side {
                OrderSide::Buy => (base, quote, order.filled_qty, notional),
                OrderSide::Sell => (quote, base, notional, order.filled_qty),
            };
            let d = balances.entry(debit).or_default();
            d.available = (d.available - debit_amt).max(0.0);
            d.total = d.available;
            let c = balances.entry(credit).or_default();
            c.available += credit_amt;
            c.total = c.available;
        }
    }

    #[async_trait]
    impl OrderGateway for MockGateway {
        async fn place_order(&self, request: &PlaceOrderRequest) -> GridResult<OrderAck> {
            self.place_calls.fetch_add(1, Ordering::SeqCst);
            if *self.should_fail.lock().await {
                return Err(GridError::Exchange("Mock failure".into()));
            }
            if self
                .transient_failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(GridError::Exchange("Mock transient failure".into()));
            }
            if self
                .rejections
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(GridError::Rejected("Mock rejection".into()));
            }

            self.placed.lock().await.push(request.clone());
            let order_id = self.next_oid.fetch_add(1, Ordering::SeqCst).to_string();
            let order = RemoteOrder {
                order_id: order_id.clone(),
                status: OrderStatus::New,
                filled_qty: 0.0,
                price: request.price,
                side: request.side,
            };
            self.orders.lock().await.insert(order_id.clone(), order);
            self.quantities
                .lock()
                .await
                .insert(order_id.clone(), request.quantity);

            let crosses = match request.side {
                OrderSide::Buy => request.price >= *self.price.lock().await,
                OrderSide::Sell => request.price <= *self.price.lock().await,
            };
            if *self.auto_fill.lock().await || (crosses && *self.fill_marketable.lock().await) {
                self.fill_order(&order_id, Some(request.quantity)).await;
            }

            Ok(OrderAck { order_id })
        }

        async fn cancel_order(&self, _symbol: &str, order_id: &str) -> GridResult<CancelOutcome> {
            self.cancelled.lock().await.push(order_id.to_string());
            let mut orders = self.orders.lock().await;
            match orders.get_mut(order_id) {
                Some(order) if !order.status.is_terminal() => {
                    order.status = OrderStatus::Cancelled;
                    Ok(CancelOutcome::Cancelled)
                }
                _ => Ok(CancelOutcome::AlreadyTerminal),
            }
        }

        async fn query_open_and_recent(&self, _symbol: &str) -> GridResult<Vec<RemoteOrder>> {
            let hidden = self.hidden.lock().await;
            Ok(self
                .orders
                .lock()
                .await
                .values()
                .filter(|o| !hidden.contains(&o.order_id))
                .cloned()
                .collect())
        }

        async fn query_order(&self, _symbol: &str, order_id: &str) -> GridResult<Option<RemoteOrder>> {
            Ok(self.orders.lock().await.get(order_id).cloned())
        }

        async fn query_balance(&self, asset: &str) -> GridResult<Balance> {
            Ok(self
                .balances
                .lock()
                .await
                .get(asset)
                .copied()
                .unwrap_or_default())
        }

        async fn query_instrument(&self, _symbol: &str) -> GridResult<InstrumentMeta> {
            Ok(self.instrument.lock().await.clone())
        }

        async fn query_fee_rates(&self, _symbol: &str) -> GridResult<FeeRates> {
            Ok(*self.fees.lock().await)
        }

        async fn query_price(&self, _symbol: &str) -> GridResult<f64> {
            Ok(*self.price.lock().await)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::mock::MockGateway;
    use super::*;
    use crate::grid::types::OrderSide;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn request() -> PlaceOrderRequest {
        PlaceOrderRequest {
            symbol: "BTCUSDT".into(),
            side: OrderSide::Buy,
            price: 100.0,
            quantity: 0.25,
            client_order_id: "GRID-B0-test".into(),
        }
    }

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    #[tokio::test]
    async fn test_retry_recovers_from_transient_errors() {
        let gateway = MockGateway::new(100.0);
        gateway.fail_next(2);
        let req = request();

        let ack = fast_policy(3)
            .run("place", || gateway.place_order(&req))
            .await
            .unwrap();
        assert_eq!(ack.order_id, "1");
        assert_eq!(gateway.place_calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_gives_up_after_ceiling() {
        let gateway = MockGateway::new(100.0);
        gateway.set_should_fail(true).await;
        let req = request();

        let err = fast_policy(3)
            .run("place", || gateway.place_order(&req))
            .await
            .unwrap_err();
        assert!(matches!(err, GridError::RetriesExhausted { attempts: 3, .. }));
        assert_eq!(gateway.place_calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_rejections_are_not_retried() {
        let gateway = MockGateway::new(100.0);
        gateway.reject_next(1);
        let req = request();

        let err = fast_policy(5)
            .run("place", || gateway.place_order(&req))
            .await
            .unwrap_err();
        assert!(matches!(err, GridError::Rejected(_)));
        assert_eq!(gateway.place_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retry_policy_with_plain_closure() {
        let calls = AtomicU32::new(0);
        let result: GridResult<u32> = fast_policy(4)
            .run("count", || async {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                if n < 4 {
                    Err(GridError::Timeout("slow".into()))
                } else {
                    Ok(n)
                }
            })
            .await;
        assert_eq!(result.unwrap(), 4);
    }

    #[tokio::test]
    async fn test_mock_fill_settles_balances() {
        let gateway = MockGateway::new(100.0);
        gateway.set_balance("USDT", 100.0).await;
        let ack = gateway.place_order(&request()).await.unwrap();
        gateway.fill_order(&ack.order_id, None).await.unwrap();

        assert!((gateway.balance("BTC").await - 0.25).abs() < 1e-12);
        assert!((gateway.balance("USDT").await - 75.0).abs() < 1e-9);
        assert_eq!(
            gateway.cancel_order("BTCUSDT", &ack.order_id).await.unwrap(),
            CancelOutcome::AlreadyTerminal
        );
    }
}
