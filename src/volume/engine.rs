//! Volume cycler - sequential buy-then-sell round trips
//!
//! One round trip is in flight at a time. Each leg walks an execution
//! ladder: a passive order outside the price, optionally a tighter passive
//! retry, then an order crossing the price to guarantee progress. A
//! governor halts the cycler on a loss ceiling, a volume target or a run of
//! failed cycles.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, RwLock};
use uuid::Uuid;

use super::config::VolumeConfig;
use crate::events::EventBus;
use crate::grid::config::InstrumentMeta;
use crate::grid::errors::{GridError, GridResult};
use crate::grid::executor::{OrderGateway, RetryPolicy};
use crate::grid::types::{
    Balance, CancelOutcome, EngineStatus, FeeRates, OrderSide, OrderStatus, PlaceOrderRequest,
};

/// Rung of the execution ladder
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Tier {
    /// Full offset, resting outside the price
    Maker,
    /// Half offset, half timeout
    Conservative,
    /// Crosses the price
    Taker,
}

#[derive(Debug, Clone, Copy)]
struct Rung {
    tier: Tier,
    offset: f64,
    timeout: Duration,
}

impl Rung {
    /// Passive rungs buy below and sell above the price; the taker rung
    /// does the opposite.
    fn limit_price(&self, side: OrderSide, price: f64) -> f64 {
        let passive = self.tier != Tier::Taker;
        match (side, passive) {
            (OrderSide::Buy, true) | (OrderSide::Sell, false) => price * (1.0 - self.offset),
            (OrderSide::Sell, true) | (OrderSide::Buy, false) => price * (1.0 + self.offset),
        }
    }
}

/// Executed leg of a round trip
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LegFill {
    pub side: OrderSide,
    pub price: f64,
    pub quantity: f64,
    pub tier: Tier,
}

/// Completed round trip
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RoundTrip {
    pub buy: LegFill,
    pub sell: LegFill,
    pub fees: f64,
    /// Price difference minus fees; usually negative
    pub profit: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HaltReason {
    MaxLoss,
    MaxVolume,
    ConsecutiveErrors,
}

/// Cumulative cycling statistics
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VolumeStats {
    pub started_at: DateTime<Utc>,
    pub cycles: u32,
    pub failed_cycles: u32,
    pub consecutive_errors: u32,
    pub buy_volume: f64,
    pub sell_volume: f64,
    pub total_volume: f64,
    pub total_fees: f64,
    /// Fees plus (buy volume - sell volume) over completed cycles
    pub net_loss: f64,
    pub halt_reason: Option<HaltReason>,
}

impl Default for VolumeStats {
    fn default() -> Self {
        Self {
            started_at: Utc::now(),
            cycles: 0,
            failed_cycles: 0,
            consecutive_errors: 0,
            buy_volume: 0.0,
            sell_volume: 0.0,
            total_volume: 0.0,
            total_fees: 0.0,
            net_loss: 0.0,
            halt_reason: None,
        }
    }
}

impl VolumeStats {
    fn record_leg(&mut self, side: OrderSide, volume: f64, fee: f64) {
        match side {
            OrderSide::Buy => self.buy_volume += volume,
            OrderSide::Sell => self.sell_volume += volume,
        }
        self.total_volume += volume;
        self.total_fees += fee;
    }

    fn record_failure(&mut self) {
        self.failed_cycles += 1;
        self.consecutive_errors += 1;
    }

    pub fn runtime_secs(&self) -> i64 {
        (Utc::now() - self.started_at).num_seconds()
    }

    pub fn log_report(&self) {
        info!("=== Volume cycling report ===");
        info!("  Runtime:      {}s", self.runtime_secs());
        info!("  Round trips:  {} ({} failed)", self.cycles, self.failed_cycles);
        info!(
            "  Volume:       {:.2} (buy {:.2}, sell {:.2})",
            self.total_volume, self.buy_volume, self.sell_volume
        );
        info!("  Fees:         {:.4}", self.total_fees);
        info!("  Net loss:     {:.4}", self.net_loss);
    }
}

/// Latest cycling statistics shared with readers such as the status server
pub type SharedVolumeStats = Arc<RwLock<Option<VolumeStats>>>;

enum FillWait {
    Filled(f64),
    Closed(OrderStatus),
    TimedOut,
}

pub struct VolumeCycler<G: OrderGateway + ?Sized> {
    config: VolumeConfig,
    gateway: Arc<G>,
    retry: RetryPolicy,
    meta: InstrumentMeta,
    fees: FeeRates,
    stats: VolumeStats,
    status: EngineStatus,
    events: EventBus,
    shared: Option<SharedVolumeStats>,
}

impl<G: OrderGateway + ?Sized> VolumeCycler<G> {
    pub fn new(config: VolumeConfig, gateway: Arc<G>, events: EventBus) -> GridResult<Self> {
        config.validate()?;
        Ok(Self {
            retry: RetryPolicy {
                max_attempts: config.max_order_retries.max(1),
                base_delay: Duration::from_millis(config.retry_base_delay_ms),
                ..RetryPolicy::default()
            },
            meta: InstrumentMeta::default(),
            fees: FeeRates::default(),
            stats: VolumeStats::default(),
            status: EngineStatus::Idle,
            shared: None,
            config,
            gateway,
            events,
        })
    }

    /// Builder: publish statistics after every round trip
    pub fn with_shared_stats(mut self, shared: SharedVolumeStats) -> Self {
        self.shared = Some(shared);
        self
    }

    pub fn config(&self) -> &VolumeConfig {
        &self.config
    }

    pub fn status(&self) -> EngineStatus {
        self.status
    }

    pub fn stats(&self) -> &VolumeStats {
        &self.stats
    }

    fn ladder(&self) -> Vec<Rung> {
        let offset = self.config.offset_fraction();
        let timeout = self.config.order_timeout();
        if !self.config.maker_mode {
            return vec![Rung {
                tier: Tier::Taker,
                offset,
                timeout,
            }];
        }
        let mut ladder = vec![Rung {
            tier: Tier::Maker,
            offset,
            timeout,
        }];
        if self.config.adaptive {
            ladder.push(Rung {
                tier: Tier::Conservative,
                offset: offset * 0.5,
                timeout: timeout / 2,
            });
            ladder.push(Rung {
                tier: Tier::Taker,
                offset: self.config.taker_fallback_offset_percent / 100.0,
                timeout: self.config.taker_fallback_timeout(),
            });
        }
        ladder
    }

    fn fee_rate(&self, tier: Tier) -> f64 {
        match tier {
            Tier::Taker => self.fees.taker,
            Tier::Maker | Tier::Conservative => self.fees.maker,
        }
    }

    async fn fetch_price(&self) -> GridResult<f64> {
        let symbol = &self.config.symbol;
        self.retry
            .run("query_price", || self.gateway.query_price(symbol))
            .await
    }

    async fn fetch_balance(&self, asset: &str) -> GridResult<Balance> {
        self.retry
            .run("query_balance", || self.gateway.query_balance(asset))
            .await
    }

    /// Load trading rules and fees, reset statistics
    pub async fn start(&mut self) -> GridResult<()> {
        if self.status == EngineStatus::Running {
            return Err(GridError::InvalidState {
                current_state: "volume cycling already running".into(),
            });
        }
        let symbol = self.config.symbol.clone();
        self.meta = self
            .retry
            .run("query_instrument", || self.gateway.query_instrument(&symbol))
            .await?;
        self.fees = match self.gateway.query_fee_rates(&symbol).await {
            Ok(fees) => fees,
            Err(e) => {
                warn!("Fee query failed, using defaults: {}", e);
                FeeRates::default()
            }
        };

        self.stats = VolumeStats::default();
        self.status = EngineStatus::Running;

        let offset = self.config.price_offset_percent;
        let (rate, spread) = if self.config.maker_mode {
            (self.fees.maker, -offset * 2.0)
        } else {
            (self.fees.taker, offset * 2.0)
        };
        let cost_percent = rate * 2.0 * 100.0 + spread;
        self.events.success(format!(
            "Volume cycling started on {}: {} mode, offset {}%, estimated cost {:.3}% per round trip",
            symbol,
            if self.config.maker_mode { "maker" } else { "taker" },
            offset,
            cost_percent
        ));
        info!(
            "Limits: max loss {}, max volume {}, every {}s",
            self.config.max_loss, self.config.max_volume, self.config.interval_secs
        );
        Ok(())
    }

    pub fn stop(&mut self) {
        if self.status == EngineStatus::Running {
            self.status = EngineStatus::Stopped;
        }
        self.stats.log_report();
        self.events.info(format!(
            "Volume cycling {:?} after {} round trips",
            self.status, self.stats.cycles
        ));
    }

    /// Which ceiling, if any, has been reached
    pub fn governor(&self) -> Option<HaltReason> {
        if self.stats.net_loss >= self.config.max_loss {
            Some(HaltReason::MaxLoss)
        } else if self.stats.total_volume >= self.config.max_volume {
            Some(HaltReason::MaxVolume)
        } else if self.config.stop_on_error
            && self.stats.consecutive_errors >= self.config.max_consecutive_errors
        {
            Some(HaltReason::ConsecutiveErrors)
        } else {
            None
        }
    }

    fn halt(&mut self, reason: HaltReason) {
        self.status = EngineStatus::Halted;
        self.stats.halt_reason = Some(reason);
        match reason {
            HaltReason::MaxVolume => self.events.success(format!(
                "Volume target {} reached, stopping",
                self.config.max_volume
            )),
            HaltReason::MaxLoss => self.events.error(format!(
                "Loss ceiling {} reached ({:.4}), stopping",
                self.config.max_loss, self.stats.net_loss
            )),
            HaltReason::ConsecutiveErrors => self.events.error(format!(
                "{} consecutive failed round trips, stopping",
                self.stats.consecutive_errors
            )),
        }
        self.stats.log_report();
    }

    /// Run one round trip and apply the governor. Returns the halt reason
    /// once the cycler has stopped.
    pub async fn step(&mut self) -> Option<HaltReason> {
        if self.status != EngineStatus::Running {
            return self.stats.halt_reason;
        }
        if let Err(e) = self.run_cycle().await {
            self.stats.record_failure();
            self.events.error(format!(
                "Round trip failed ({} in a row): {}",
                self.stats.consecutive_errors, e
            ));
        }
        if let Some(shared) = &self.shared {
            *shared.write().await = Some(self.stats.clone());
        }
        let reason = self.governor()?;
        self.halt(reason);
        Some(reason)
    }

    /// Cycle until halted or shut down
    pub async fn run(&mut self, mut shutdown_rx: watch::Receiver<bool>) -> GridResult<VolumeStats> {
        if self.status != EngineStatus::Running {
            self.start().await?;
        }
        loop {
            if self.step().await.is_some() {
                break;
            }
            debug!("Next round trip in {}s", self.config.interval_secs);
            tokio::select! {
                _ = tokio::time::sleep(self.config.interval()) => {}
                _ = shutdown_rx.changed() => {
                    info!("Shutdown requested");
                    self.stop();
                    break;
                }
            }
        }
        if let Some(shared) = &self.shared {
            *shared.write().await = Some(self.stats.clone());
        }
        Ok(self.stats.clone())
    }

    /// Buy with the configured share of quote, then sell the credited base
    pub async fn run_cycle(&mut self) -> GridResult<RoundTrip> {
        info!("Round trip #{} starting", self.stats.cycles + 1);
        let ladder = self.ladder();

        let quote = self.meta.quote_asset.clone();
        let available = self.fetch_balance(&quote).await?.available;
        if available <= 0.0 {
            return Err(GridError::InsufficientBalance {
                required: 0.0,
                available,
            });
        }
        let budget = available * self.config.capital_percent / 100.0;

        // Size against the highest price any rung may pay
        let price = self.fetch_price().await?;
        let highest = ladder
            .iter()
            .map(|r| r.limit_price(OrderSide::Buy, price))
            .fold(0.0, f64::max);
        let quantity = self.meta.floor_quantity(budget / highest);
        if quantity < self.meta.min_quantity {
            return Err(GridError::Rejected(format!(
                "buy quantity {} below minimum {}",
                quantity, self.meta.min_quantity
            )));
        }

        let buy = self.execute_leg(OrderSide::Buy, quantity, &ladder).await?;
        let buy_volume = buy.price * buy.quantity;
        let buy_fee = buy_volume * self.fee_rate(buy.tier);
        self.stats.record_leg(OrderSide::Buy, buy_volume, buy_fee);
        info!("Bought {} @ {} ({:?})", buy.quantity, buy.price, buy.tier);

        tokio::time::sleep(self.config.settle_delay()).await;
        let base = self.meta.base_asset.clone();
        let held = self.fetch_balance(&base).await?.available;
        if held <= 0.0 {
            return Err(GridError::InsufficientBalance {
                required: buy.quantity,
                available: held,
            });
        }
        let sell_quantity = self.meta.floor_quantity(held);
        if sell_quantity < self.meta.min_quantity {
            return Err(GridError::Rejected(format!(
                "sell quantity {} below minimum {}",
                sell_quantity, self.meta.min_quantity
            )));
        }

        let sell = self.execute_leg(OrderSide::Sell, sell_quantity, &ladder).await?;
        let sell_volume = sell.price * sell.quantity;
        let sell_fee = sell_volume * self.fee_rate(sell.tier);
        self.stats.record_leg(OrderSide::Sell, sell_volume, sell_fee);

        let fees = buy_fee + sell_fee;
        let profit = (sell_volume - buy_volume) - fees;
        self.stats.net_loss += fees + (buy_volume - sell_volume);
        self.stats.cycles += 1;
        self.stats.consecutive_errors = 0;

        let message = format!(
            "Round trip #{} done: {:+.4} (fees {:.4}), volume {:.2}",
            self.stats.cycles, profit, fees, self.stats.total_volume
        );
        if profit >= 0.0 {
            self.events.success(message);
        } else {
            self.events.info(message);
        }

        Ok(RoundTrip {
            buy,
            sell,
            fees,
            profit,
        })
    }

    async fn execute_leg(&self, side: OrderSide, quantity: f64, ladder: &[Rung]) -> GridResult<LegFill> {
        for (step, rung) in ladder.iter().enumerate() {
            let price = self.fetch_price().await?;
            let limit = self.meta.round_price(rung.limit_price(side, price));
            let request = PlaceOrderRequest {
                symbol: self.config.symbol.clone(),
                side,
                price: limit,
                quantity,
                client_order_id: format!(
                    "CYCLE-{}{}-{}",
                    &side.as_str()[..1],
                    step,
                    &Uuid::new_v4().simple().to_string()[..16]
                ),
            };
            let ack = self
                .retry
                .run("place_order", || self.gateway.place_order(&request))
                .await?;
            debug!(
                "{} {} @ {} placed as {} ({:?})",
                side.as_str(),
                quantity,
                limit,
                ack.order_id,
                rung.tier
            );

            match self.wait_for_fill(&ack.order_id, quantity, rung.timeout).await {
                FillWait::Filled(filled) => {
                    return Ok(LegFill {
                        side,
                        price: limit,
                        quantity: filled,
                        tier: rung.tier,
                    })
                }
                FillWait::Closed(status) => {
                    warn!("{} order {} ended {:?} unfilled", side.as_str(), ack.order_id, status);
                }
                FillWait::TimedOut => {
                    if let Some(filled) = self.cancel_resting(&ack.order_id, quantity).await? {
                        return Ok(LegFill {
                            side,
                            price: limit,
                            quantity: filled,
                            tier: rung.tier,
                        });
                    }
                }
            }

            if let Some(next) = ladder.get(step + 1) {
                self.events.warning(format!(
                    "{} leg not filled at {} ({:?}), trying {:?}",
                    side.as_str(),
                    limit,
                    rung.tier,
                    next.tier
                ));
            }
        }
        Err(GridError::Timeout(format!(
            "{} leg of {} not filled",
            side.as_str(),
            quantity
        )))
    }

    async fn wait_for_fill(&self, order_id: &str, quantity: f64, timeout: Duration) -> FillWait {
        let started = tokio::time::Instant::now();
        loop {
            match self.gateway.query_order(&self.config.symbol, order_id).await {
                Ok(Some(order)) if order.status == OrderStatus::Filled => {
                    let filled = if order.filled_qty > 0.0 {
                        order.filled_qty
                    } else {
                        quantity
                    };
                    return FillWait::Filled(filled);
                }
                Ok(Some(order)) if order.status.is_terminal() => {
                    return FillWait::Closed(order.status)
                }
                Ok(Some(_)) => {}
                Ok(None) => debug!("Order {} not visible yet", order_id),
                Err(e) => warn!("Status query for {} failed: {}", order_id, e),
            }
            if started.elapsed() >= timeout {
                return FillWait::TimedOut;
            }
            tokio::time::sleep(self.config.fill_poll_interval()).await;
        }
    }

    /// Cancel a timed-out order. Returns the filled quantity when it
    /// completed before the cancel landed.
    async fn cancel_resting(&self, order_id: &str, quantity: f64) -> GridResult<Option<f64>> {
        let symbol = &self.config.symbol;
        let outcome = self
            .retry
            .run("cancel_order", || self.gateway.cancel_order(symbol, order_id))
            .await?;
        if outcome == CancelOutcome::Cancelled {
            return Ok(None);
        }
        let remote = self.gateway.query_order(symbol, order_id).await?;
        Ok(remote
            .filter(|o| o.status == OrderStatus::Filled)
            .map(|o| if o.filled_qty > 0.0 { o.filled_qty } else { quantity }))
    }
}
