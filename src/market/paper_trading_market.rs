//! Paper Trading Market Implementation
//!
//! A simulated spot exchange that implements [`OrderGateway`]. Prices follow
//! a random walk; resting limit orders fill when the price crosses their
//! limit and marketable orders fill on placement. Every status change and
//! price tick is broadcast so a [`PaperFeed`] can serve it as a push stream.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{self, BoxStream, StreamExt};
use log::{debug, info, warn};
use rand::Rng;
use tokio::sync::{broadcast, watch, Mutex};

use crate::config::PaperConfig;
use crate::grid::config::InstrumentMeta;
use crate::grid::errors::{GridError, GridResult};
use crate::grid::executor::OrderGateway;
use crate::grid::reconcile::OrderUpdate;
use crate::grid::stream::{PushChannel, StreamMessage};
use crate::grid::types::{
    Balance, CancelOutcome, FeeRates, OrderAck, OrderSide, OrderStatus, PlaceOrderRequest,
    RemoteOrder,
};

const QUOTE_ASSETS: [&str; 4] = ["USDT", "USDC", "BUSD", "USD"];

/// Split "BTCUSDT" or "BTC/USDT" into base and quote
pub fn split_symbol(symbol: &str) -> (String, String) {
    if let Some((base, quote)) = symbol.split_once('/') {
        return (base.to_string(), quote.to_string());
    }
    for quote in QUOTE_ASSETS {
        if let Some(base) = symbol.strip_suffix(quote) {
            if !base.is_empty() {
                return (base.to_string(), quote.to_string());
            }
        }
    }
    (symbol.to_string(), "USDT".to_string())
}

/// Internal order tracking for paper trading
#[derive(Debug, Clone)]
struct PaperOrder {
    remote: RemoteOrder,
    quantity: f64,
}

impl PaperOrder {
    /// Check if this order should be filled at the given price
    fn should_fill(&self, price: f64) -> bool {
        if self.remote.status.is_terminal() {
            return false;
        }
        match self.remote.side {
            // Buy order fills when price <= limit price
            OrderSide::Buy => price <= self.remote.price,
            // Sell order fills when price >= limit price
            OrderSide::Sell => price >= self.remote.price,
        }
    }
}

#[derive(Debug, Default)]
struct Book {
    price: f64,
    balances: HashMap<String, Balance>,
    orders: HashMap<String, PaperOrder>,
}

impl Book {
    fn balance_mut(&mut self, asset: &str) -> &mut Balance {
        self.balances.entry(asset.to_string()).or_default()
    }
}

/// Simulated spot exchange for one symbol
pub struct PaperExchange {
    symbol: String,
    meta: InstrumentMeta,
    fees: FeeRates,
    book: Mutex<Book>,
    next_id: AtomicU64,
    updates: broadcast::Sender<StreamMessage>,
}

impl PaperExchange {
    pub fn new(symbol: impl Into<String>, config: &PaperConfig) -> Self {
        let symbol = symbol.into();
        let (base, quote) = split_symbol(&symbol);
        let meta = InstrumentMeta::new(
            config.price_step,
            config.quantity_step,
            config.min_quantity,
            base.clone(),
            quote.clone(),
        );
        let mut book = Book {
            price: config.start_price,
            ..Book::default()
        };
        for (asset, amount) in [(quote, config.initial_quote), (base, config.initial_base)] {
            *book.balance_mut(&asset) = Balance {
                total: amount,
                available: amount,
                locked: 0.0,
            };
        }
        let (updates, _) = broadcast::channel(1024);
        Self {
            symbol,
            meta,
            fees: FeeRates {
                maker: config.maker_fee,
                taker: config.taker_fee,
            },
            book: Mutex::new(book),
            next_id: AtomicU64::new(1),
            updates,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StreamMessage> {
        self.updates.subscribe()
    }

    pub fn instrument(&self) -> &InstrumentMeta {
        &self.meta
    }

    pub async fn price(&self) -> f64 {
        self.book.lock().await.price
    }

    pub async fn balance(&self, asset: &str) -> Balance {
        self.book
            .lock()
            .await
            .balances
            .get(asset)
            .copied()
            .unwrap_or_default()
    }

    fn check_symbol(&self, symbol: &str) -> GridResult<()> {
        if symbol == self.symbol {
            Ok(())
        } else {
            Err(GridError::Rejected(format!("unknown symbol {}", symbol)))
        }
    }

    fn publish(&self, message: StreamMessage) {
        // No subscribers is fine
        let _ = self.updates.send(message);
    }

    /// Move the price and execute every resting order it crosses
    pub async fn set_price(&self, price: f64) {
        let filled = {
            let mut book = self.book.lock().await;
            book.price = price;
            let crossed: Vec<String> = book
                .orders
                .iter()
                .filter(|(_, order)| order.should_fill(price))
                .map(|(id, _)| id.clone())
                .collect();
            crossed
                .into_iter()
                .filter_map(|id| self.execute(&mut book, &id, self.fees.maker))
                .collect::<Vec<_>>()
        };
        self.publish(StreamMessage::Price(price));
        for update in filled {
            self.publish(StreamMessage::Order(update));
        }
    }

    /// Fill an order completely at its limit price and settle balances
    fn execute(&self, book: &mut Book, order_id: &str, fee_rate: f64) -> Option<OrderUpdate> {
        let order = book.orders.get_mut(order_id)?;
        order.remote.status = OrderStatus::Filled;
        order.remote.filled_qty = order.quantity;
        let (side, price, quantity) = (order.remote.side, order.remote.price, order.quantity);
        let update = OrderUpdate::from(order.remote.clone());

        let notional = price * quantity;
        let fee = notional * fee_rate;
        let (base, quote) = (self.meta.base_asset.as_str(), self.meta.quote_asset.as_str());
        match side {
            OrderSide::Buy => {
                let q = book.balance_mut(quote);
                q.locked = (q.locked - notional).max(0.0);
                q.available = (q.available - fee).max(0.0);
                q.total = q.available + q.locked;
                let b = book.balance_mut(base);
                b.available += quantity;
                b.total = b.available + b.locked;
            }
            OrderSide::Sell => {
                let b = book.balance_mut(base);
                b.locked = (b.locked - quantity).max(0.0);
                b.total = b.available + b.locked;
                let q = book.balance_mut(quote);
                q.available += notional - fee;
                q.total = q.available + q.locked;
            }
        }
        info!(
            "[PAPER] {} {} {} @ {} filled (fee {:.6})",
            side.as_str(),
            quantity,
            base,
            price,
            fee
        );
        Some(update)
    }

    /// Random-walk the price until shutdown
    pub async fn run_price_walk(
        self: Arc<Self>,
        volatility_percent: f64,
        tick: Duration,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        let mut timer = tokio::time::interval(tick.max(Duration::from_millis(1)));
        loop {
            tokio::select! {
                _ = timer.tick() => {
                    let current = self.price().await;
                    let step = rand::thread_rng().gen_range(-1.0..=1.0) * volatility_percent / 100.0;
                    let next = self.meta.round_price(current * (1.0 + step)).max(self.meta.price_step);
                    debug!("[PAPER] price {} -> {}", current, next);
                    self.set_price(next).await;
                }
                _ = shutdown_rx.changed() => {
                    info!("[PAPER] price walk stopped");
                    return;
                }
            }
        }
    }
}

#[async_trait]
impl OrderGateway for PaperExchange {
    async fn place_order(&self, request: &PlaceOrderRequest) -> GridResult<OrderAck> {
        self.check_symbol(&request.symbol)?;
        if request.quantity < self.meta.min_quantity || request.price <= 0.0 {
            return Err(GridError::Rejected(format!(
                "invalid order {} @ {}",
                request.quantity, request.price
            )));
        }

        let (update, ack) = {
            let mut book = self.book.lock().await;
            let (asset, amount) = match request.side {
                OrderSide::Buy => (self.meta.quote_asset.as_str(), request.price * request.quantity),
                OrderSide::Sell => (self.meta.base_asset.as_str(), request.quantity),
            };
            let balance = book.balance_mut(asset);
            if balance.available + 1e-12 < amount {
                return Err(GridError::InsufficientBalance {
                    required: amount,
                    available: balance.available,
                });
            }
            balance.available = (balance.available - amount).max(0.0);
            balance.locked += amount;

            let order_id = self.next_id.fetch_add(1, Ordering::SeqCst).to_string();
            let order = PaperOrder {
                remote: RemoteOrder {
                    order_id: order_id.clone(),
                    status: OrderStatus::New,
                    filled_qty: 0.0,
                    price: request.price,
                    side: request.side,
                },
                quantity: request.quantity,
            };
            let marketable = order.should_fill(book.price);
            let resting = OrderUpdate::from(order.remote.clone());
            book.orders.insert(order_id.clone(), order);
            debug!(
                "[PAPER] {} {} @ {} accepted as {} ({})",
                request.side.as_str(),
                request.quantity,
                request.price,
                order_id,
                request.client_order_id
            );

            let update = if marketable {
                self.execute(&mut book, &order_id, self.fees.taker)
            } else {
                Some(resting)
            };
            (update, OrderAck { order_id })
        };
        if let Some(update) = update {
            self.publish(StreamMessage::Order(update));
        }
        Ok(ack)
    }

    async fn cancel_order(&self, symbol: &str, order_id: &str) -> GridResult<CancelOutcome> {
        self.check_symbol(symbol)?;
        let update = {
            let mut book = self.book.lock().await;
            let Some(order) = book.orders.get_mut(order_id) else {
                return Ok(CancelOutcome::AlreadyTerminal);
            };
            if order.remote.status.is_terminal() {
                return Ok(CancelOutcome::AlreadyTerminal);
            }
            order.remote.status = OrderStatus::Cancelled;
            let update = OrderUpdate::from(order.remote.clone());
            let (asset, amount) = match order.remote.side {
                OrderSide::Buy => (self.meta.quote_asset.clone(), order.remote.price * order.quantity),
                OrderSide::Sell => (self.meta.base_asset.clone(), order.quantity),
            };
            let balance = book.balance_mut(&asset);
            balance.locked = (balance.locked - amount).max(0.0);
            balance.available += amount;
            update
        };
        self.publish(StreamMessage::Order(update));
        Ok(CancelOutcome::Cancelled)
    }

    async fn query_open_and_recent(&self, symbol: &str) -> GridResult<Vec<RemoteOrder>> {
        self.check_symbol(symbol)?;
        Ok(self
            .book
            .lock()
            .await
            .orders
            .values()
            .map(|o| o.remote.clone())
            .collect())
    }

    async fn query_order(&self, symbol: &str, order_id: &str) -> GridResult<Option<RemoteOrder>> {
        self.check_symbol(symbol)?;
        Ok(self
            .book
            .lock()
            .await
            .orders
            .get(order_id)
            .map(|o| o.remote.clone()))
    }

    async fn query_balance(&self, asset: &str) -> GridResult<Balance> {
        Ok(self.balance(asset).await)
    }

    async fn query_instrument(&self, symbol: &str) -> GridResult<InstrumentMeta> {
        self.check_symbol(symbol)?;
        Ok(self.meta.clone())
    }

    async fn query_fee_rates(&self, symbol: &str) -> GridResult<FeeRates> {
        self.check_symbol(symbol)?;
        Ok(self.fees)
    }

    async fn query_price(&self, symbol: &str) -> GridResult<f64> {
        self.check_symbol(symbol)?;
        Ok(self.price().await)
    }
}

/// Which part of the paper exchange broadcast a feed carries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedKind {
    Prices,
    Orders,
}

/// Push channel backed by the paper exchange broadcast
pub struct PaperFeed {
    exchange: Arc<PaperExchange>,
    kind: FeedKind,
}

impl PaperFeed {
    pub fn new(exchange: Arc<PaperExchange>, kind: FeedKind) -> Self {
        Self { exchange, kind }
    }
}

#[async_trait]
impl PushChannel for PaperFeed {
    fn name(&self) -> &str {
        match self.kind {
            FeedKind::Prices => "paper-prices",
            FeedKind::Orders => "paper-orders",
        }
    }

    async fn connect(&self) -> GridResult<BoxStream<'static, GridResult<StreamMessage>>> {
        let rx = self.exchange.subscribe();
        let kind = self.kind;
        let messages = stream::unfold(rx, move |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok(message) => {
                        let wanted = matches!(
                            (kind, &message),
                            (FeedKind::Prices, StreamMessage::Price(_))
                                | (FeedKind::Orders, StreamMessage::Order(_))
                        );
                        if wanted {
                            return Some((Ok(message), rx));
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("[PAPER] feed lagged, {} messages skipped", skipped);
                        return Some((
                            Err(GridError::Stream(format!("{} messages skipped", skipped))),
                            rx,
                        ));
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });
        Ok(messages.boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_exchange() -> PaperExchange {
        let config = PaperConfig {
            initial_quote: 1000.0,
            ..PaperConfig::default()
        };
        PaperExchange::new("BTCUSDT", &config)
    }

    fn request(side: OrderSide, price: f64, quantity: f64) -> PlaceOrderRequest {
        PlaceOrderRequest {
            symbol: "BTCUSDT".into(),
            side,
            price,
            quantity,
            client_order_id: "GRID-B0-test".into(),
        }
    }

    #[test]
    fn test_split_symbol() {
        assert_eq!(split_symbol("BTCUSDT"), ("BTC".into(), "USDT".into()));
        assert_eq!(split_symbol("ETH/USDC"), ("ETH".into(), "USDC".into()));
    }

    #[tokio::test]
    async fn test_resting_buy_locks_and_fills_on_cross() {
        let exchange = create_test_exchange();
        let ack = exchange
            .place_order(&request(OrderSide::Buy, 98.0, 1.0))
            .await
            .unwrap();

        let usdt = exchange.balance("USDT").await;
        assert_eq!(usdt.locked, 98.0);
        assert_eq!(usdt.available, 902.0);

        exchange.set_price(97.5).await;
        let order = exchange.query_order("BTCUSDT", &ack.order_id).await.unwrap().unwrap();
        assert_eq!(order.status, OrderStatus::Filled);
        assert_eq!(order.filled_qty, 1.0);
        assert_eq!(exchange.balance("BTC").await.available, 1.0);
        let usdt = exchange.balance("USDT").await;
        assert_eq!(usdt.locked, 0.0);
        assert!((usdt.available - (902.0 - 98.0 * 0.001)).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_marketable_order_fills_immediately() {
        let exchange = create_test_exchange();
        let ack = exchange
            .place_order(&request(OrderSide::Buy, 100.5, 2.0))
            .await
            .unwrap();
        let order = exchange.query_order("BTCUSDT", &ack.order_id).await.unwrap().unwrap();
        assert_eq!(order.status, OrderStatus::Filled);
        assert_eq!(exchange.balance("BTC").await.available, 2.0);
    }

    #[tokio::test]
    async fn test_insufficient_balance_and_cancel() {
        let exchange = create_test_exchange();
        let err = exchange
            .place_order(&request(OrderSide::Sell, 110.0, 1.0))
            .await
            .unwrap_err();
        assert!(matches!(err, GridError::InsufficientBalance { .. }));

        let ack = exchange
            .place_order(&request(OrderSide::Buy, 90.0, 1.0))
            .await
            .unwrap();
        assert_eq!(
            exchange.cancel_order("BTCUSDT", &ack.order_id).await.unwrap(),
            CancelOutcome::Cancelled
        );
        assert_eq!(exchange.balance("USDT").await.available, 1000.0);
        assert_eq!(
            exchange.cancel_order("BTCUSDT", &ack.order_id).await.unwrap(),
            CancelOutcome::AlreadyTerminal
        );
    }

    #[tokio::test]
    async fn test_feed_streams_order_updates() {
        let exchange = Arc::new(create_test_exchange());
        let feed = PaperFeed::new(exchange.clone(), FeedKind::Orders);
        let mut stream = feed.connect().await.unwrap();

        exchange.set_price(101.0).await;
        let ack = exchange
            .place_order(&request(OrderSide::Buy, 95.0, 1.0))
            .await
            .unwrap();

        // Price ticks are filtered out of the order feed
        match stream.next().await {
            Some(Ok(StreamMessage::Order(update))) => {
                assert_eq!(update.order_id, ack.order_id);
                assert_eq!(update.status, OrderStatus::New);
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }
}
