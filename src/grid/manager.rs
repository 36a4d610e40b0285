//! Grid engine - ties levels, funds, stop-loss and reconciliation together
//!
//! The engine owns every table it mutates (levels, tracked orders, funds,
//! statistics) and is driven by a single scheduler task, so each method runs
//! to completion before the next one starts. Gateway calls are the only
//! suspension points.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use log::{debug, info, warn};

use super::config::{GridConfig, InstrumentMeta};
use super::errors::{ErrorKind, GridError, GridResult};
use super::executor::{OrderGateway, RetryPolicy};
use super::funds::FundManager;
use super::level::{GridLevel, LevelTiming};
use super::reconcile::{collect_poll_updates, OrderRecord, OrderTable, OrderUpdate, Resolution};
use super::state::GridSnapshot;
use super::stats::{TradingStats, UnrealizedPnl};
use super::stoploss::StopLossController;
use super::strategy::{GridParams, GridStrategy};
use super::types::{
    client_order_id, Balance, CancelOutcome, EngineStatus, LevelRef, LevelState, OrderAck,
    OrderKind, OrderSide, OrderStatus, PlaceOrderRequest,
};
use crate::events::EventBus;

/// Share of a level's position that must be credited before selling
const MIN_CREDITED_FRACTION: f64 = 0.1;

/// Balance reads while waiting for liquidation funds to settle
const EMERGENCY_BALANCE_ATTEMPTS: u32 = 3;

/// What one check pass did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub skipped: bool,
    pub stoploss_triggered: bool,
    pub halted: bool,
    pub sells_placed: usize,
    pub buys_placed: usize,
    pub failures: usize,
}

async fn pace(ms: u64) {
    if ms > 0 {
        tokio::time::sleep(Duration::from_millis(ms)).await;
    }
}

/// Spot grid engine
pub struct GridEngine<G: OrderGateway + ?Sized> {
    config: GridConfig,
    /// Capital from the configuration; zero means derive from the balance
    preset_capital: f64,
    gateway: Arc<G>,
    retry: RetryPolicy,
    strategy: GridStrategy,
    meta: InstrumentMeta,
    params: Option<GridParams>,
    levels: Vec<GridLevel>,
    orders: OrderTable,
    funds: FundManager,
    stats: TradingStats,
    stoploss: StopLossController,
    status: EngineStatus,
    last_price: f64,
    events: EventBus,
}

impl<G: OrderGateway + ?Sized> GridEngine<G> {
    pub fn new(config: GridConfig, gateway: Arc<G>, events: EventBus) -> GridResult<Self> {
        config.validate()?;
        Ok(Self {
            preset_capital: config.total_capital,
            retry: RetryPolicy::from_config(&config),
            funds: FundManager::new(config.total_capital, config.reserve_ratio),
            stats: TradingStats::new(config.taker_fee_rate),
            stoploss: StopLossController::from_config(&config),
            strategy: GridStrategy,
            meta: InstrumentMeta::default(),
            params: None,
            levels: Vec::new(),
            orders: OrderTable::new(),
            status: EngineStatus::Idle,
            last_price: 0.0,
            config,
            gateway,
            events,
        })
    }

    pub fn config(&self) -> &GridConfig {
        &self.config
    }

    pub fn status(&self) -> EngineStatus {
        self.status
    }

    pub fn levels(&self) -> &[GridLevel] {
        &self.levels
    }

    pub fn level(&self, index: usize) -> GridResult<&GridLevel> {
        self.levels
            .iter()
            .find(|l| l.index == index)
            .ok_or(GridError::LevelNotFound(index))
    }

    fn level_mut(&mut self, index: usize) -> GridResult<&mut GridLevel> {
        self.levels
            .iter_mut()
            .find(|l| l.index == index)
            .ok_or(GridError::LevelNotFound(index))
    }

    pub fn orders(&self) -> &OrderTable {
        &self.orders
    }

    pub fn funds(&self) -> &FundManager {
        &self.funds
    }

    pub fn stats(&self) -> &TradingStats {
        &self.stats
    }

    pub fn params(&self) -> Option<&GridParams> {
        self.params.as_ref()
    }

    pub fn instrument(&self) -> &InstrumentMeta {
        &self.meta
    }

    pub fn last_price(&self) -> f64 {
        self.last_price
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn unrealized(&self) -> UnrealizedPnl {
        UnrealizedPnl::from_levels(&self.levels, self.last_price)
    }

    /// Record a price pushed by the tick stream
    pub fn on_price_tick(&mut self, price: f64) {
        if price > 0.0 {
            self.last_price = price;
        }
    }

    // ------------------------------------------------------------------
    // Gateway calls
    // ------------------------------------------------------------------

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

    async fn submit(&self, request: &PlaceOrderRequest) -> GridResult<OrderAck> {
        self.retry
            .run("place_order", || self.gateway.place_order(request))
            .await
    }

    async fn cancel(&self, order_id: &str) -> GridResult<CancelOutcome> {
        let symbol = &self.config.symbol;
        self.retry
            .run("cancel_order", || self.gateway.cancel_order(symbol, order_id))
            .await
    }

    /// Place an order and start tracking it
    async fn place_tracked(
        &mut self,
        kind: OrderKind,
        side: OrderSide,
        level: LevelRef,
        price: f64,
        quantity: f64,
        cost_basis: f64,
    ) -> GridResult<String> {
        let request = PlaceOrderRequest {
            symbol: self.config.symbol.clone(),
            side,
            price,
            quantity,
            client_order_id: client_order_id(kind, side, level),
        };
        let ack = self.submit(&request).await?;
        self.orders.insert(OrderRecord {
            order_id: ack.order_id.clone(),
            client_order_id: request.client_order_id,
            level,
            side,
            kind,
            price,
            quantity,
            cost_basis,
            status: OrderStatus::New,
            filled_qty: 0.0,
            placed_at: Utc::now(),
        });
        Ok(ack.order_id)
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Fetch trading rules, resolve capital and lay out the grid
    pub async fn start(&mut self) -> GridResult<()> {
        if self.status.is_active() {
            return Err(GridError::InvalidState {
                current_state: format!("{:?}", self.status),
            });
        }
        if self.status == EngineStatus::Halted {
            info!("Manual restart after halt, stop-loss latch re-armed");
            self.stoploss = StopLossController::from_config(&self.config);
        }

        let symbol = self.config.symbol.clone();
        self.meta = self
            .retry
            .run("query_instrument", || self.gateway.query_instrument(&symbol))
            .await?;
        info!(
            "Instrument {}: price step {}, quantity step {}, min quantity {}",
            symbol, self.meta.price_step, self.meta.quantity_step, self.meta.min_quantity
        );

        match self.gateway.query_fee_rates(&symbol).await {
            // Every fill is costed at the taker rate so realized profit is never overstated
            Ok(fees) => self.stats.set_fee_rate(fees.taker),
            Err(e) => warn!(
                "Fee query failed, using {:.4}: {}",
                self.config.taker_fee_rate, e
            ),
        }

        self.rebuild(None).await?;
        self.status = EngineStatus::Running;
        self.events.success(format!(
            "Grid started on {}: {} levels, capital {:.2} {}",
            symbol,
            self.levels.len(),
            self.funds.total_capital(),
            self.meta.quote_asset
        ));
        Ok(())
    }

    async fn resolve_capital(&self) -> GridResult<f64> {
        let quote = &self.meta.quote_asset;
        let balance = self.fetch_balance(quote).await?;
        let from_balance = balance.available * self.config.capital_percent / 100.0;

        // A preset amount is a ceiling; the grid never commits more than the account holds
        let capital = if self.preset_capital > 0.0 {
            if from_balance < self.preset_capital * 0.5 {
                self.events.warning(format!(
                    "Configured capital {:.2} but only {:.2} {} available",
                    self.preset_capital, from_balance, quote
                ));
            }
            self.preset_capital.min(from_balance)
        } else {
            from_balance
        };

        if capital <= 0.0 {
            return Err(GridError::InsufficientBalance {
                required: self.config.min_order_value,
                available: balance.available,
            });
        }
        Ok(capital)
    }

    /// Resync capital and recompute levels around `center` (or the live price)
    async fn rebuild(&mut self, center: Option<f64>) -> GridResult<()> {
        let capital = self.resolve_capital().await?;
        let center = match center {
            Some(price) => price,
            None => self.fetch_price().await?,
        };
        self.last_price = center;

        self.config.total_capital = capital;
        let params = self.strategy.calculate_params(&self.config, &self.meta, center);
        let plans = self.strategy.calculate_levels(&self.config, &self.meta, &params);
        if plans.is_empty() {
            return Err(GridError::InvalidConfig(format!(
                "no usable levels around {} with capital {:.2}",
                center, capital
            )));
        }

        self.funds.reset(capital);
        self.levels = self
            .strategy
            .build_levels(&plans, LevelTiming::from(&self.config));
        self.params = Some(params);

        info!(
            "Grid centered at {}: range {} - {}, interval {}, {} levels x {:.2}",
            center,
            params.lower_price,
            params.upper_price,
            params.interval,
            self.levels.len(),
            params.capital_per_level
        );
        Ok(())
    }

    /// Stop the engine: optionally cancel orders, report, reset to idle
    pub async fn stop(&mut self, cancel_orders: bool) -> GridResult<()> {
        let halted = self.status == EngineStatus::Halted;
        self.status = EngineStatus::Stopping;

        if cancel_orders {
            let cancelled = self.cancel_all_orders().await;
            info!("Cancelled {} orders on stop", cancelled);
        }

        // Liquidation orders are not tied to the grid and stay tracked
        let grid_orders: Vec<String> = self
            .orders
            .iter()
            .filter(|r| r.level != LevelRef::Unassigned)
            .map(|r| r.order_id.clone())
            .collect();
        for order_id in grid_orders {
            self.orders.remove(&order_id);
        }

        let unrealized = self.unrealized();
        if unrealized.position_count > 0 {
            warn!(
                "Releasing {} positions ({} base, unrealized {:.4}) from tracking",
                unrealized.position_count, unrealized.total_quantity, unrealized.pnl
            );
        }
        for level in &mut self.levels {
            level.reset();
        }
        self.funds.reset(self.funds.total_capital());
        self.stats.log_report();

        self.status = if halted {
            EngineStatus::Halted
        } else {
            EngineStatus::Stopped
        };
        self.events.info(format!("Grid {:?}", self.status));
        Ok(())
    }

    async fn halt(&mut self, reason: String) -> GridResult<()> {
        self.events.error(format!(
            "Total stop-loss: {}. Halting, manual restart required",
            reason
        ));
        self.status = EngineStatus::Halted;
        self.stop(true).await
    }

    // ------------------------------------------------------------------
    // Check cycle
    // ------------------------------------------------------------------

    /// One pass: stop-loss checks, then pending sells, then new buys
    pub async fn run_check_cycle(&mut self) -> GridResult<CycleReport> {
        let mut report = CycleReport::default();
        if self.status != EngineStatus::Running {
            report.skipped = true;
            return Ok(report);
        }

        let price = self.fetch_price().await?;
        self.last_price = price;

        if self.check_stop_loss(price, &mut report).await? {
            info!("Stop-loss fired this pass, buy/sell placement skipped");
            return Ok(report);
        }

        self.place_pending_sells(Instant::now(), &mut report).await;
        self.place_pending_buys(price, &mut report).await;

        if report.buys_placed > 0 || report.sells_placed > 0 {
            let funds = self.funds.snapshot();
            info!(
                "Pass @ {}: {} buys, {} sells | available {:.2}, in buys {:.2}, in positions {:.2}",
                price,
                report.buys_placed,
                report.sells_placed,
                funds.available,
                funds.locked_in_buy_orders,
                funds.locked_in_positions
            );
        }
        Ok(report)
    }

    fn has_stoploss_sell(&self, level: &GridLevel) -> bool {
        level
            .sell_order_id()
            .and_then(|id| self.orders.get(id))
            .is_some_and(|r| r.kind == OrderKind::StopLoss)
    }

    /// Returns true when either rule fired
    async fn check_stop_loss(&mut self, price: f64, report: &mut CycleReport) -> GridResult<bool> {
        let unrealized = self.unrealized();
        let realized = self.stats.realized_profit();
        if self.stoploss.check_total(realized, unrealized.pnl) {
            report.stoploss_triggered = true;
            report.halted = true;
            self.halt(format!(
                "realized {:.4} + unrealized {:.4} below -{}",
                realized, unrealized.pnl, self.config.total_stoploss_limit
            ))
            .await?;
            return Ok(true);
        }

        let triggers = self.stoploss.level_triggers(
            self.levels.iter().filter(|l| !self.has_stoploss_sell(l)),
            price,
        );
        let Some(trigger) = triggers.first().copied() else {
            return Ok(false);
        };

        report.stoploss_triggered = true;
        self.events.warning(format!(
            "Stop-loss on level {}: {:.2}% ({:.4})",
            trigger.index,
            trigger.loss_fraction * 100.0,
            -trigger.loss_amount
        ));
        if triggers.len() > 1 {
            info!("{} more levels past stop-loss, next pass", triggers.len() - 1);
        }
        if let Err(e) = self.execute_stoploss_sell(trigger.index, price).await {
            report.failures += 1;
            self.events
                .error(format!("Stop-loss sell for level {} failed: {}", trigger.index, e));
        }
        Ok(true)
    }

    async fn execute_stoploss_sell(&mut self, index: usize, price: f64) -> GridResult<()> {
        let active_sell = self.level(index)?.sell_order_id().map(str::to_string);
        if let Some(order_id) = active_sell {
            debug!("Cancelling sell {} of level {} before stop-loss", order_id, index);
            self.cancel_tracked(&order_id).await?;
            pace(self.config.stoploss_pacing_ms).await;
        }
        if !self.level(index)?.state().needs_sell() {
            info!("Level {} closed while cancelling, stop-loss not needed", index);
            return Ok(());
        }

        let base = self.meta.base_asset.clone();
        let available = self.meta.floor_quantity(self.fetch_balance(&base).await?.available);
        let (quantity, cost_basis) = {
            let level = self.level_mut(index)?;
            level.clamp_filled_quantity(available);
            (level.filled_quantity(), level.cost_basis())
        };
        let quantity = self.meta.floor_quantity(quantity);
        if quantity < self.meta.min_quantity {
            return Err(GridError::InsufficientBalance {
                required: self.meta.min_quantity,
                available: quantity,
            });
        }

        let sell_price = self.meta.round_price(price * self.config.stoploss_price_factor);
        if !self.level_mut(index)?.prepare_for_forced_sell(Instant::now()) {
            return Err(GridError::Inconsistent(format!(
                "level {} cannot take a forced sell",
                index
            )));
        }
        let placed = self
            .place_tracked(
                OrderKind::StopLoss,
                OrderSide::Sell,
                LevelRef::Grid(index),
                sell_price,
                quantity,
                cost_basis,
            )
            .await;
        match placed {
            Ok(order_id) => {
                self.level_mut(index)?.sell_order_placed(order_id.clone())?;
                self.events.warning(format!(
                    "Stop-loss sell {} for level {}: {} @ {}",
                    order_id, index, quantity, sell_price
                ));
                Ok(())
            }
            Err(e) => {
                self.level_mut(index)?.sell_order_failed();
                Err(e)
            }
        }
    }

    async fn place_pending_sells(&mut self, now: Instant, report: &mut CycleReport) {
        let ready: Vec<usize> = self
            .levels
            .iter()
            .filter(|l| l.can_attempt_sell(now))
            .map(|l| l.index)
            .collect();

        for index in ready {
            match self.place_sell(index, now).await {
                Ok(true) => report.sells_placed += 1,
                Ok(false) => {}
                Err(e) => {
                    report.failures += 1;
                    warn!("Sell for level {} not placed: {}", index, e);
                }
            }
            pace(self.config.sell_pacing_ms).await;
        }
    }

    async fn place_sell(&mut self, index: usize, now: Instant) -> GridResult<bool> {
        let (held, sell_price, cost_basis) = {
            let level = self.level_mut(index)?;
            if !level.prepare_for_sell(now) {
                return Ok(false);
            }
            (level.filled_quantity(), level.sell_price, level.cost_basis())
        };

        match self.submit_level_sell(index, held, sell_price, cost_basis).await {
            Ok(order_id) => {
                self.level_mut(index)?.sell_order_placed(order_id.clone())?;
                debug!("Sell {} placed for level {} @ {}", order_id, index, sell_price);
                Ok(true)
            }
            Err(e) => {
                if self.level_mut(index)?.sell_order_failed() == LevelState::Stuck {
                    self.events.error(format!(
                        "Level {} stuck, position kept for a later sell",
                        index
                    ));
                }
                Err(e)
            }
        }
    }

    /// Size the sell from the credited base balance and place it
    async fn submit_level_sell(
        &mut self,
        index: usize,
        held: f64,
        price: f64,
        cost_basis: f64,
    ) -> GridResult<String> {
        let base = self.meta.base_asset.clone();
        let available = self.fetch_balance(&base).await?.available;
        if available < held * MIN_CREDITED_FRACTION {
            return Err(GridError::InsufficientBalance {
                required: held,
                available,
            });
        }

        let mut quantity = held;
        if available < held {
            let level = self.level_mut(index)?;
            level.clamp_filled_quantity(available);
            quantity = level.filled_quantity();
        }
        let quantity = self.meta.floor_quantity(quantity);
        if quantity < self.meta.min_quantity || quantity * price < self.config.min_order_value {
            return Err(GridError::Rejected(format!(
                "sell {} @ {} below exchange minimums",
                quantity, price
            )));
        }

        self.place_tracked(
            OrderKind::Grid,
            OrderSide::Sell,
            LevelRef::Grid(index),
            price,
            quantity,
            cost_basis,
        )
        .await
    }

    async fn place_pending_buys(&mut self, price: f64, report: &mut CycleReport) {
        let trigger = price * self.config.buy_trigger_discount;
        let mut candidates: Vec<(usize, f64)> = self
            .levels
            .iter()
            .filter(|l| l.state() == LevelState::Idle && l.buy_price < trigger)
            .map(|l| (l.index, l.buy_price))
            .collect();
        candidates.sort_by(|a, b| a.1.total_cmp(&b.1));

        for (index, _) in candidates {
            match self.place_buy(index).await {
                Ok(true) => report.buys_placed += 1,
                Ok(false) => {}
                Err(e) if e.kind() == ErrorKind::Insufficient => {
                    debug!("Buys paused for this pass: {}", e);
                    break;
                }
                Err(e) => {
                    report.failures += 1;
                    warn!("Buy for level {} not placed: {}", index, e);
                }
            }
            pace(self.config.buy_pacing_ms).await;
        }
    }

    async fn place_buy(&mut self, index: usize) -> GridResult<bool> {
        let (amount, price, quantity) = {
            let level = self.level(index)?;
            if level.state() != LevelState::Idle {
                return Ok(false);
            }
            // Quantity is rounded to the nearest step, so the order can cost
            // slightly more or less than the level's allocation
            (level.buy_price * level.target_quantity, level.buy_price, level.target_quantity)
        };

        if !self.funds.lock_for_buy(amount) {
            return Err(GridError::InsufficientBalance {
                required: amount,
                available: self.funds.available_for_orders(),
            });
        }
        self.level_mut(index)?.prepare_for_buy(amount);

        let placed = self
            .place_tracked(
                OrderKind::Grid,
                OrderSide::Buy,
                LevelRef::Grid(index),
                price,
                quantity,
                0.0,
            )
            .await;
        match placed {
            Ok(order_id) => {
                self.level_mut(index)?.buy_order_placed(order_id.clone())?;
                debug!("Buy {} placed for level {} @ {} x {}", order_id, index, price, quantity);
                Ok(true)
            }
            Err(e) => {
                let released = self.level_mut(index)?.buy_order_failed();
                self.funds.unlock_from_buy(released);
                Err(e)
            }
        }
    }

    // ------------------------------------------------------------------
    // Reconciliation
    // ------------------------------------------------------------------

    /// Fold an order update from the stream or a poll into the engine.
    /// Returns true when a tracked order reached a terminal status.
    pub fn apply_update(&mut self, update: &OrderUpdate) -> bool {
        match self.orders.resolve(update) {
            Resolution::Untracked => {
                debug!("Update for untracked order {} ignored", update.order_id);
                false
            }
            Resolution::Progress => false,
            Resolution::Terminal {
                record,
                status,
                filled_qty,
            } => {
                if let Err(e) = self.apply_terminal(&record, status, filled_qty) {
                    self.events.error(format!(
                        "Order {} ({:?} {:?}) discarded: {}",
                        record.order_id, record.kind, record.side, e
                    ));
                }
                true
            }
        }
    }

    fn apply_terminal(
        &mut self,
        record: &OrderRecord,
        status: OrderStatus,
        filled_qty: f64,
    ) -> GridResult<()> {
        let index = match record.level {
            LevelRef::Grid(index) => index,
            LevelRef::Unassigned => {
                if record.side == OrderSide::Sell && filled_qty > 0.0 {
                    self.stats.record_unassigned_sell(record.price, filled_qty);
                    self.events.info(format!(
                        "Liquidation sell {} done: {} @ {}",
                        record.order_id, filled_qty, record.price
                    ));
                }
                return Ok(());
            }
        };

        let level = self
            .levels
            .iter_mut()
            .find(|l| l.index == index)
            .ok_or(GridError::LevelNotFound(index))?;

        match record.side {
            OrderSide::Buy => {
                if level.buy_order_id() != Some(record.order_id.as_str()) {
                    return Err(GridError::Inconsistent(format!(
                        "level {} does not own buy {}",
                        index, record.order_id
                    )));
                }
                let executed = if status == OrderStatus::Filled && filled_qty <= 0.0 {
                    record.quantity
                } else {
                    filled_qty
                };
                if executed > 0.0 {
                    let fill = level.buy_filled(executed, Instant::now())?;
                    self.funds.buy_filled(fill.cost_basis.min(fill.locked));
                    self.funds
                        .unlock_from_buy((fill.locked - fill.cost_basis).max(0.0));
                    self.stats.record_buy(record.price, executed);
                    self.events.success(format!(
                        "Buy filled at level {}: {} @ {}",
                        index, executed, record.price
                    ));
                } else {
                    let released = level.buy_order_failed();
                    self.funds.unlock_from_buy(released);
                    info!(
                        "Buy {} at level {} {:?}, released {:.4}",
                        record.order_id, index, status, released
                    );
                }
            }
            OrderSide::Sell => {
                if level.sell_order_id() != Some(record.order_id.as_str()) {
                    return Err(GridError::Inconsistent(format!(
                        "level {} does not own sell {}",
                        index, record.order_id
                    )));
                }
                if status == OrderStatus::Filled {
                    let executed = if filled_qty > 0.0 {
                        filled_qty
                    } else {
                        record.quantity
                    };
                    let cost = level.cost_basis();
                    let buy_price = level.buy_price;
                    let gross = level.sell_filled()?;
                    let profit = self.funds.sell_filled(cost, record.price * executed);
                    let net = self.stats.record_sell(record.price, executed, buy_price);
                    if record.kind == OrderKind::StopLoss {
                        self.stats.record_stoploss();
                        self.events.warning(format!(
                            "Stop-loss sell filled at level {}: {:.4}",
                            index, profit
                        ));
                    } else {
                        self.events.success(format!(
                            "Sell filled at level {}: +{:.4} (net {:.4})",
                            index, gross, net
                        ));
                    }
                } else {
                    if filled_qty > 0.0 {
                        let cost = level.sell_partially_filled(filled_qty);
                        self.funds.sell_filled(cost, record.price * filled_qty);
                        self.stats
                            .record_sell(record.price, filled_qty, level.buy_price);
                    }
                    if level.filled_quantity() <= 0.0 {
                        level.reset();
                    } else {
                        let state = level.sell_order_failed();
                        info!(
                            "Sell {} at level {} {:?}, level back to {:?}",
                            record.order_id, index, status, state
                        );
                    }
                }
            }
        }
        Ok(())
    }

    /// Look an order up by id and apply whatever the exchange reports
    async fn resolve_order_now(&mut self, order_id: &str) -> GridResult<()> {
        let symbol = &self.config.symbol;
        let remote = self
            .retry
            .run("query_order", || self.gateway.query_order(symbol, order_id))
            .await?;
        let update = match remote {
            Some(order) if order.status.is_terminal() => order.into(),
            Some(order) => {
                warn!("Order {} still {:?}, left for the next poll", order_id, order.status);
                return Ok(());
            }
            None => OrderUpdate {
                order_id: order_id.to_string(),
                status: OrderStatus::Cancelled,
                filled_qty: 0.0,
            },
        };
        self.apply_update(&update);
        Ok(())
    }

    /// Cancel a tracked order and apply the outcome
    async fn cancel_tracked(&mut self, order_id: &str) -> GridResult<CancelOutcome> {
        let outcome = self.cancel(order_id).await?;
        match outcome {
            CancelOutcome::Cancelled => {
                self.apply_update(&OrderUpdate {
                    order_id: order_id.to_string(),
                    status: OrderStatus::Cancelled,
                    filled_qty: 0.0,
                });
            }
            // Filled or gone in the meantime; find out which
            CancelOutcome::AlreadyTerminal => self.resolve_order_now(order_id).await?,
        }
        Ok(outcome)
    }

    /// Poll fallback for missed stream messages. Returns the number of
    /// terminal updates applied.
    pub async fn poll_reconcile(&mut self) -> GridResult<usize> {
        let outcome = collect_poll_updates(
            self.gateway.as_ref(),
            &self.retry,
            &self.config.symbol,
            &self.orders,
        )
        .await?;
        if outcome.gaps_checked > 0 {
            debug!(
                "Poll: {} gaps checked, {} unknown to exchange",
                outcome.gaps_checked, outcome.not_found
            );
        }

        let mut applied = 0;
        for update in &outcome.updates {
            if self.apply_update(update) {
                applied += 1;
            }
        }
        Ok(applied)
    }

    /// Cancel every tracked order with pacing. Returns how many were cancelled.
    pub async fn cancel_all_orders(&mut self) -> usize {
        let ids = self.orders.ids();
        if ids.is_empty() {
            return 0;
        }
        info!("Cancelling {} orders", ids.len());

        let mut cancelled = 0;
        for order_id in ids {
            match self.cancel_tracked(&order_id).await {
                Ok(CancelOutcome::Cancelled) => cancelled += 1,
                Ok(CancelOutcome::AlreadyTerminal) => {}
                Err(e) => warn!("Cancel of {} failed: {}", order_id, e),
            }
            pace(self.config.cancel_pacing_ms).await;
        }
        cancelled
    }

    // ------------------------------------------------------------------
    // Rebalancing
    // ------------------------------------------------------------------

    /// Recenter if price drifted past the threshold. `price` comes from the
    /// tick stream when available.
    pub async fn check_rebalance(&mut self, price: Option<f64>) -> GridResult<bool> {
        if self.status != EngineStatus::Running || !self.config.auto_rebalance {
            return Ok(false);
        }
        let price = match price {
            Some(p) => p,
            None => self.fetch_price().await?,
        };
        self.last_price = price;

        let Some(center) = self.params.map(|p| p.center_price) else {
            return Ok(false);
        };
        if !self.strategy.should_rebalance(&self.config, center, price) {
            return Ok(false);
        }
        info!(
            "Price {} drifted {:.2}% from center {}",
            price,
            (price - center) / center * 100.0,
            center
        );
        self.rebalance(Some(price)).await?;
        Ok(true)
    }

    /// Manual recenter around the live price
    pub async fn force_rebalance(&mut self) -> GridResult<()> {
        if self.status != EngineStatus::Running {
            return Err(GridError::InvalidState {
                current_state: format!("{:?}", self.status),
            });
        }
        self.rebalance(None).await
    }

    async fn rebalance(&mut self, center: Option<f64>) -> GridResult<()> {
        self.status = EngineStatus::Rebalancing;
        self.events.info("Rebalancing grid");

        let cancelled = self.cancel_all_orders().await;
        let unrealized = self.unrealized();
        if unrealized.position_count > 0 {
            warn!(
                "{} positions ({} base) carried over untracked",
                unrealized.position_count, unrealized.total_quantity
            );
        }

        if let Err(e) = self.rebuild(center).await {
            self.status = EngineStatus::Running;
            self.events
                .error(format!("Rebalance failed, keeping current grid: {}", e));
            return Err(e);
        }

        if !self.orders.is_empty() {
            warn!(
                "{} orders could not be cancelled and are no longer tracked",
                self.orders.len()
            );
        }
        self.orders.clear();
        self.stats.record_rebalance();

        tokio::time::sleep(self.config.rebalance_cooldown()).await;
        self.status = EngineStatus::Running;
        self.events.success(format!(
            "Rebalanced: {} orders cancelled, new center {}",
            cancelled, self.last_price
        ));
        Ok(())
    }

    // ------------------------------------------------------------------
    // Emergency liquidation
    // ------------------------------------------------------------------

    /// Cancel everything, sell the whole base balance below market, then stop
    pub async fn emergency_sell_all(&mut self) -> GridResult<Option<String>> {
        if self.status == EngineStatus::Idle {
            return Err(GridError::InvalidState {
                current_state: "engine never started".into(),
            });
        }
        self.events.warning("Emergency liquidation requested");
        self.cancel_all_orders().await;
        tokio::time::sleep(self.config.emergency_settle()).await;

        let base = self.meta.base_asset.clone();
        let mut available = 0.0;
        for attempt in 1..=EMERGENCY_BALANCE_ATTEMPTS {
            available = self.fetch_balance(&base).await?.available;
            if available > 0.0 {
                break;
            }
            if attempt < EMERGENCY_BALANCE_ATTEMPTS {
                debug!("No {} credited yet, attempt {}", base, attempt);
                tokio::time::sleep(self.config.emergency_settle()).await;
            }
        }

        let quantity = self.meta.floor_quantity(available);
        let price = self
            .meta
            .round_price(self.fetch_price().await? * self.config.emergency_price_factor);
        if quantity < self.meta.min_quantity || quantity * price < self.config.min_order_value {
            self.events.warning(format!(
                "Nothing to liquidate: {} {} below exchange minimums",
                quantity, base
            ));
            self.stop(false).await?;
            return Ok(None);
        }

        let order_id = self
            .place_tracked(
                OrderKind::Emergency,
                OrderSide::Sell,
                LevelRef::Unassigned,
                price,
                quantity,
                0.0,
            )
            .await?;
        self.events.warning(format!(
            "Liquidation sell {} placed: {} {} @ {}",
            order_id, quantity, base, price
        ));
        self.stop(false).await?;
        Ok(Some(order_id))
    }

    pub fn snapshot(&self) -> GridSnapshot {
        let now = Instant::now();
        let mut open_orders: Vec<OrderRecord> = self.orders.iter().cloned().collect();
        open_orders.sort_by(|a, b| a.placed_at.cmp(&b.placed_at));
        GridSnapshot {
            symbol: self.config.symbol.clone(),
            status: self.status,
            last_price: self.last_price,
            params: self.params,
            levels: self.levels.iter().map(|l| l.snapshot(now)).collect(),
            funds: self.funds.snapshot(),
            stats: self.stats.snapshot(),
            unrealized: self.unrealized(),
            open_orders,
            stoploss_latched: self.stoploss.is_latched(),
            updated_at: Utc::now(),
        }
    }
}
