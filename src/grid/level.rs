//! Per-level order lifecycle
//!
//! Each level owns at most one order at a time. A buy fill turns the level
//! into a position with a cost basis; the position is only released by a
//! sell fill or an explicit reset. Sell attempts are throttled because the
//! bought asset is credited some time after the fill is reported.

use std::time::{Duration, Instant};

use log::{debug, warn};
use serde::{Deserialize, Serialize};

use super::config::GridConfig;
use super::errors::{GridError, GridResult};
use super::types::LevelState;

/// Sell throttling parameters shared by all levels of a grid
#[derive(Debug, Clone, Copy)]
pub struct LevelTiming {
    pub sell_dwell: Duration,
    pub sell_retry_backoff: Duration,
    pub max_sell_retries: u32,
}

impl From<&GridConfig> for LevelTiming {
    fn from(config: &GridConfig) -> Self {
        Self {
            sell_dwell: config.sell_dwell(),
            sell_retry_backoff: config.sell_retry_backoff(),
            max_sell_retries: config.max_sell_retries,
        }
    }
}

/// Funds to move when a buy fills
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BuyFill {
    /// Capital that was locked for the order
    pub locked: f64,
    /// Actual cost of the filled quantity
    pub cost_basis: f64,
}

/// A single grid level
#[derive(Debug, Clone)]
pub struct GridLevel {
    pub index: usize,
    pub buy_price: f64,
    pub sell_price: f64,
    pub target_quantity: f64,
    pub capital_allocated: f64,
    state: LevelState,
    buy_order_id: Option<String>,
    sell_order_id: Option<String>,
    filled_quantity: f64,
    cost_basis: f64,
    locked_amount: f64,
    sell_retry_count: u32,
    buy_filled_at: Option<Instant>,
    last_sell_attempt_at: Option<Instant>,
    timing: LevelTiming,
}

/// Serializable view of a level for display
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LevelSnapshot {
    pub index: usize,
    pub buy_price: f64,
    pub sell_price: f64,
    pub target_quantity: f64,
    pub capital_allocated: f64,
    pub state: LevelState,
    pub buy_order_id: Option<String>,
    pub sell_order_id: Option<String>,
    pub filled_quantity: f64,
    pub cost_basis: f64,
    pub sell_retry_count: u32,
    pub secs_since_buy_fill: Option<u64>,
}

impl GridLevel {
    pub fn new(
        index: usize,
        buy_price: f64,
        sell_price: f64,
        target_quantity: f64,
        capital_allocated: f64,
        timing: LevelTiming,
    ) -> Self {
        Self {
            index,
            buy_price,
            sell_price,
            target_quantity,
            capital_allocated,
            state: LevelState::Idle,
            buy_order_id: None,
            sell_order_id: None,
            filled_quantity: 0.0,
            cost_basis: 0.0,
            locked_amount: 0.0,
            sell_retry_count: 0,
            buy_filled_at: None,
            last_sell_attempt_at: None,
            timing,
        }
    }

    pub fn state(&self) -> LevelState {
        self.state
    }

    pub fn buy_order_id(&self) -> Option<&str> {
        self.buy_order_id.as_deref()
    }

    pub fn sell_order_id(&self) -> Option<&str> {
        self.sell_order_id.as_deref()
    }

    pub fn filled_quantity(&self) -> f64 {
        self.filled_quantity
    }

    pub fn cost_basis(&self) -> f64 {
        self.cost_basis
    }

    pub fn locked_amount(&self) -> f64 {
        self.locked_amount
    }

    pub fn sell_retry_count(&self) -> u32 {
        self.sell_retry_count
    }

    pub fn is_holding(&self) -> bool {
        self.state.is_holding()
    }

    fn invalid(&self, op: &str) -> GridError {
        GridError::InvalidState {
            current_state: format!("level {} is {:?}, cannot {}", self.index, self.state, op),
        }
    }

    /// Reserve the level for a buy backed by `locked` capital.
    /// No-op returning false unless the level is idle.
    pub fn prepare_for_buy(&mut self, locked: f64) -> bool {
        if self.state != LevelState::Idle {
            return false;
        }
        self.state = LevelState::PlacingBuy;
        self.locked_amount = locked;
        true
    }

    /// The exchange accepted the buy order
    pub fn buy_order_placed(&mut self, order_id: impl Into<String>) -> GridResult<()> {
        if self.state != LevelState::PlacingBuy {
            return Err(self.invalid("record a buy order"));
        }
        self.state = LevelState::BuyActive;
        self.buy_order_id = Some(order_id.into());
        Ok(())
    }

    /// Placement failed or the resting buy was cancelled/rejected.
    /// Returns the capital to unlock.
    pub fn buy_order_failed(&mut self) -> f64 {
        if !matches!(self.state, LevelState::PlacingBuy | LevelState::BuyActive) {
            return 0.0;
        }
        let released = self.locked_amount;
        self.state = LevelState::Idle;
        self.buy_order_id = None;
        self.locked_amount = 0.0;
        released
    }

    /// Record a buy fill. `actual_qty` may be below target on partial fills;
    /// a non-positive value falls back to the target quantity.
    pub fn buy_filled(&mut self, actual_qty: f64, now: Instant) -> GridResult<BuyFill> {
        if !matches!(self.state, LevelState::PlacingBuy | LevelState::BuyActive) {
            return Err(self.invalid("fill a buy"));
        }
        let qty = if actual_qty > 0.0 {
            actual_qty
        } else {
            self.target_quantity
        };
        let fill = BuyFill {
            locked: self.locked_amount,
            cost_basis: self.buy_price * qty,
        };
        self.state = LevelState::Bought;
        self.buy_order_id = None;
        self.filled_quantity = qty;
        self.cost_basis = fill.cost_basis;
        self.locked_amount = 0.0;
        self.buy_filled_at = Some(now);
        self.last_sell_attempt_at = None;
        self.sell_retry_count = 0;
        Ok(fill)
    }

    /// Whether the dwell/backoff guards allow a sell attempt now
    pub fn can_attempt_sell(&self, now: Instant) -> bool {
        if !self.state.needs_sell() {
            return false;
        }
        match self.last_sell_attempt_at {
            Some(last) => now.saturating_duration_since(last) >= self.timing.sell_retry_backoff,
            None => match self.buy_filled_at {
                Some(filled) => now.saturating_duration_since(filled) >= self.timing.sell_dwell,
                None => true,
            },
        }
    }

    /// Move to PlacingSell if the guards allow it
    pub fn prepare_for_sell(&mut self, now: Instant) -> bool {
        if !self.can_attempt_sell(now) {
            return false;
        }
        self.state = LevelState::PlacingSell;
        self.last_sell_attempt_at = Some(now);
        self.sell_retry_count += 1;
        debug!(
            "Level {} sell attempt #{}",
            self.index, self.sell_retry_count
        );
        true
    }

    /// Stop-loss path: skip dwell/backoff. An active sell must be cancelled first.
    pub fn prepare_for_forced_sell(&mut self, now: Instant) -> bool {
        if !self.state.needs_sell() {
            return false;
        }
        self.state = LevelState::PlacingSell;
        self.last_sell_attempt_at = Some(now);
        true
    }

    /// The exchange accepted the sell order
    pub fn sell_order_placed(&mut self, order_id: impl Into<String>) -> GridResult<()> {
        if self.state != LevelState::PlacingSell {
            return Err(self.invalid("record a sell order"));
        }
        self.state = LevelState::SellActive;
        self.sell_order_id = Some(order_id.into());
        self.sell_retry_count = 0;
        Ok(())
    }

    /// Sell placement failed or the resting sell went away unfilled.
    /// The position is kept either way.
    pub fn sell_order_failed(&mut self) -> LevelState {
        if !matches!(self.state, LevelState::PlacingSell | LevelState::SellActive) {
            return self.state;
        }
        self.sell_order_id = None;
        self.state = if self.sell_retry_count >= self.timing.max_sell_retries {
            warn!(
                "Level {} stuck after {} sell attempts, holding {} at cost {:.4}",
                self.index, self.sell_retry_count, self.filled_quantity, self.cost_basis
            );
            LevelState::Stuck
        } else {
            LevelState::Bought
        };
        self.state
    }

    /// An active sell was cancelled on purpose; back to Bought without
    /// touching the retry state.
    pub fn sell_order_cancelled(&mut self) {
        if self.state == LevelState::SellActive {
            self.sell_order_id = None;
            self.state = LevelState::Bought;
        }
    }

    /// Close the round trip, returning (sell - buy) * quantity
    pub fn sell_filled(&mut self) -> GridResult<f64> {
        if !matches!(self.state, LevelState::PlacingSell | LevelState::SellActive) {
            return Err(self.invalid("fill a sell"));
        }
        let profit = (self.sell_price - self.buy_price) * self.filled_quantity;
        self.clear();
        Ok(profit)
    }

    /// Part of the position sold before the sell order went away.
    /// Returns the share of cost basis that left with the sold quantity.
    pub fn sell_partially_filled(&mut self, sold_qty: f64) -> f64 {
        if !self.is_holding() || sold_qty <= 0.0 || self.filled_quantity <= 0.0 {
            return 0.0;
        }
        if sold_qty >= self.filled_quantity {
            let cost = self.cost_basis;
            self.filled_quantity = 0.0;
            self.cost_basis = 0.0;
            return cost;
        }
        let released = self.cost_basis * sold_qty / self.filled_quantity;
        self.filled_quantity -= sold_qty;
        self.cost_basis -= released;
        released
    }

    /// Shrink the held quantity to what the account actually holds.
    /// Cost basis is kept so the loss is booked against the full cost.
    pub fn clamp_filled_quantity(&mut self, available: f64) {
        if self.is_holding() && available > 0.0 && available < self.filled_quantity {
            warn!(
                "Level {} holds {} but only {} is available",
                self.index, self.filled_quantity, available
            );
            self.filled_quantity = available;
        }
    }

    /// Drop back to Idle from any state. Returns buy capital still locked.
    pub fn reset(&mut self) -> f64 {
        let released = if matches!(self.state, LevelState::PlacingBuy | LevelState::BuyActive) {
            self.locked_amount
        } else {
            0.0
        };
        self.clear();
        released
    }

    fn clear(&mut self) {
        self.state = LevelState::Idle;
        self.buy_order_id = None;
        self.sell_order_id = None;
        self.filled_quantity = 0.0;
        self.cost_basis = 0.0;
        self.locked_amount = 0.0;
        self.sell_retry_count = 0;
        self.buy_filled_at = None;
        self.last_sell_attempt_at = None;
    }

    /// Mark-to-market P&L of the held position
    pub fn unrealized_pnl(&self, price: f64) -> f64 {
        if !self.is_holding() || self.filled_quantity <= 0.0 || self.cost_basis <= 0.0 {
            return 0.0;
        }
        self.filled_quantity * price - self.cost_basis
    }

    /// Loss/gain as a fraction of cost, `None` when not holding
    pub fn pnl_fraction(&self, price: f64) -> Option<f64> {
        if !self.is_holding() || self.filled_quantity <= 0.0 || self.cost_basis <= 0.0 {
            return None;
        }
        Some(self.unrealized_pnl(price) / self.cost_basis)
    }

    pub fn snapshot(&self, now: Instant) -> LevelSnapshot {
        LevelSnapshot {
            index: self.index,
            buy_price: self.buy_price,
            sell_price: self.sell_price,
            target_quantity: self.target_quantity,
            capital_allocated: self.capital_allocated,
            state: self.state,
            buy_order_id: self.buy_order_id.clone(),
            sell_order_id: self.sell_order_id.clone(),
            filled_quantity: self.filled_quantity,
            cost_basis: self.cost_basis,
            sell_retry_count: self.sell_retry_count,
            secs_since_buy_fill: self
                .buy_filled_at
                .map(|t| now.saturating_duration_since(t).as_secs()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn timing() -> LevelTiming {
        LevelTiming {
            sell_dwell: Duration::from_secs(15),
            sell_retry_backoff: Duration::from_secs(10),
            max_sell_retries: 20,
        }
    }

    fn create_test_level() -> GridLevel {
        GridLevel::new(0, 100.0, 102.0, 0.25, 25.0, timing())
    }

    fn assert_single_order(level: &GridLevel) {
        assert!(level.buy_order_id().is_none() || level.sell_order_id().is_none());
    }

    #[test]
    fn test_full_round_trip() {
        let mut level = create_test_level();
        let t0 = Instant::now();

        assert!(level.prepare_for_buy(25.0));
        assert!(!level.prepare_for_buy(25.0));
        level.buy_order_placed("b1").unwrap();
        assert_eq!(level.state(), LevelState::BuyActive);
        assert_single_order(&level);

        let fill = level.buy_filled(0.25, t0).unwrap();
        assert_eq!(fill.locked, 25.0);
        assert!((fill.cost_basis - 25.0).abs() < 1e-9);
        assert_eq!(level.state(), LevelState::Bought);

        // Dwell not yet elapsed
        assert!(!level.prepare_for_sell(t0 + Duration::from_secs(5)));
        assert!(level.prepare_for_sell(t0 + Duration::from_secs(15)));
        level.sell_order_placed("s1").unwrap();
        assert_eq!(level.state(), LevelState::SellActive);
        assert_single_order(&level);

        let profit = level.sell_filled().unwrap();
        assert!((profit - 0.5).abs() < 1e-9);
        assert_eq!(level.state(), LevelState::Idle);
        assert_eq!(level.filled_quantity(), 0.0);
        assert_eq!(level.cost_basis(), 0.0);
        assert_eq!(level.sell_retry_count(), 0);
        assert!(level.buy_order_id().is_none() && level.sell_order_id().is_none());
    }

    #[test]
    fn test_partial_fill_sets_cost_from_actual_quantity() {
        let mut level = create_test_level();
        level.prepare_for_buy(25.0);
        level.buy_order_placed("b1").unwrap();
        let fill = level.buy_filled(0.1, Instant::now()).unwrap();
        assert!((fill.cost_basis - 10.0).abs() < 1e-9);
        assert!((level.filled_quantity() - 0.1).abs() < 1e-12);
    }

    #[test]
    fn test_buy_failure_releases_lock() {
        let mut level = create_test_level();
        level.prepare_for_buy(25.0);
        level.buy_order_placed("b1").unwrap();
        assert_eq!(level.buy_order_failed(), 25.0);
        assert_eq!(level.state(), LevelState::Idle);
        // Second cancel notification changes nothing
        assert_eq!(level.buy_order_failed(), 0.0);
    }

    #[test]
    fn test_retry_backoff_between_sell_attempts() {
        let mut level = create_test_level();
        let t0 = Instant::now();
        level.prepare_for_buy(25.0);
        level.buy_order_placed("b1").unwrap();
        level.buy_filled(0.25, t0).unwrap();

        let t1 = t0 + Duration::from_secs(20);
        assert!(level.prepare_for_sell(t1));
        assert_eq!(level.sell_order_failed(), LevelState::Bought);
        assert!(!level.prepare_for_sell(t1 + Duration::from_secs(9)));
        assert!(level.prepare_for_sell(t1 + Duration::from_secs(10)));
        assert_eq!(level.sell_retry_count(), 2);
    }

    #[test]
    fn test_stuck_after_retry_ceiling_keeps_position() {
        let mut level = create_test_level();
        let t0 = Instant::now();
        level.prepare_for_buy(25.0);
        level.buy_order_placed("b1").unwrap();
        level.buy_filled(0.25, t0).unwrap();

        let mut now = t0 + Duration::from_secs(15);
        for attempt in 1..=20 {
            assert!(level.prepare_for_sell(now), "attempt {} blocked", attempt);
            let state = level.sell_order_failed();
            if attempt < 20 {
                assert_eq!(state, LevelState::Bought);
            } else {
                assert_eq!(state, LevelState::Stuck);
            }
            now += Duration::from_secs(10);
        }
        assert!((level.cost_basis() - 25.0).abs() < 1e-9);
        assert!((level.filled_quantity() - 0.25).abs() < 1e-12);

        // A stuck level still sells and books the right profit
        assert!(level.prepare_for_sell(now));
        level.sell_order_placed("s-final").unwrap();
        let profit = level.sell_filled().unwrap();
        assert!((profit - (102.0 - 100.0) * 0.25).abs() < 1e-9);
        assert_eq!(level.state(), LevelState::Idle);
    }

    #[test]
    fn test_forced_sell_bypasses_dwell() {
        let mut level = create_test_level();
        let t0 = Instant::now();
        level.prepare_for_buy(25.0);
        level.buy_order_placed("b1").unwrap();
        level.buy_filled(0.25, t0).unwrap();

        assert!(!level.prepare_for_sell(t0));
        assert!(level.prepare_for_forced_sell(t0));
        assert_eq!(level.state(), LevelState::PlacingSell);
    }

    #[test]
    fn test_invalid_transitions_are_rejected() {
        let mut level = create_test_level();
        assert!(level.buy_order_placed("x").is_err());
        assert!(level.sell_order_placed("x").is_err());
        assert!(level.sell_filled().is_err());
        assert!(level.buy_filled(1.0, Instant::now()).is_err());
        assert!(!level.prepare_for_sell(Instant::now()));
        assert_eq!(level.state(), LevelState::Idle);
    }

    #[test]
    fn test_reset_returns_buy_lock_only() {
        let mut level = create_test_level();
        level.prepare_for_buy(25.0);
        level.buy_order_placed("b1").unwrap();
        assert_eq!(level.reset(), 25.0);

        level.prepare_for_buy(25.0);
        level.buy_order_placed("b2").unwrap();
        level.buy_filled(0.25, Instant::now()).unwrap();
        assert_eq!(level.reset(), 0.0);
        assert_eq!(level.state(), LevelState::Idle);
    }

    #[test]
    fn test_partial_sell_and_clamp_keep_cost_consistent() {
        let mut level = create_test_level();
        level.prepare_for_buy(25.0);
        level.buy_order_placed("b1").unwrap();
        level.buy_filled(0.25, Instant::now()).unwrap();

        let released = level.sell_partially_filled(0.05);
        assert!((released - 5.0).abs() < 1e-9);
        assert!((level.filled_quantity() - 0.2).abs() < 1e-12);
        assert!((level.cost_basis() - 20.0).abs() < 1e-9);

        level.clamp_filled_quantity(0.15);
        assert!((level.filled_quantity() - 0.15).abs() < 1e-12);
        assert!((level.cost_basis() - 20.0).abs() < 1e-9);

        // Clamping never grows the position
        level.clamp_filled_quantity(1.0);
        assert!((level.filled_quantity() - 0.15).abs() < 1e-12);
    }

    #[test]
    fn test_unrealized_pnl() {
        let mut level = create_test_level();
        assert_eq!(level.unrealized_pnl(90.0), 0.0);
        level.prepare_for_buy(25.0);
        level.buy_order_placed("b1").unwrap();
        level.buy_filled(0.25, Instant::now()).unwrap();
        assert!((level.unrealized_pnl(94.0) - (-1.5)).abs() < 1e-9);
        assert!((level.pnl_fraction(94.0).unwrap() - (-0.06)).abs() < 1e-9);
    }
}
