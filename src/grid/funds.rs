//! Capital bookkeeping for the grid
//!
//! Tracks how the committed quote capital is split between free funds,
//! funds locked behind resting buy orders and funds tied up in positions.
//! Mutated only from the engine's single scheduler task.

use log::{debug, warn};
use serde::{Deserialize, Serialize};

/// Capital split between free, buy-locked and position-locked funds
#[derive(Debug, Clone)]
pub struct FundManager {
    total_capital: f64,
    initial_capital: f64,
    locked_in_buy_orders: f64,
    locked_in_positions: f64,
    available: f64,
    reserve_ratio: f64,
}

/// Point-in-time view of the fund manager
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FundSnapshot {
    pub total_capital: f64,
    pub initial_capital: f64,
    pub available: f64,
    pub available_for_orders: f64,
    pub locked_in_buy_orders: f64,
    pub locked_in_positions: f64,
    pub usage_percent: f64,
    pub profit: f64,
}

impl FundManager {
    pub fn new(total_capital: f64, reserve_ratio: f64) -> Self {
        let total = total_capital.max(0.0);
        Self {
            total_capital: total,
            initial_capital: total,
            locked_in_buy_orders: 0.0,
            locked_in_positions: 0.0,
            available: total,
            reserve_ratio,
        }
    }

    fn recompute_available(&mut self) {
        let locked = self.locked_in_buy_orders + self.locked_in_positions;
        self.available = (self.total_capital - locked).max(0.0);
    }

    /// Free funds minus the reserve withheld from allocation
    pub fn available_for_orders(&self) -> f64 {
        (self.available - self.total_capital * self.reserve_ratio).max(0.0)
    }

    /// Lock funds for a buy order. All or nothing.
    pub fn lock_for_buy(&mut self, amount: f64) -> bool {
        if amount <= 0.0 || amount > self.available_for_orders() {
            debug!(
                "Lock of {:.4} refused, {:.4} available for orders",
                amount,
                self.available_for_orders()
            );
            return false;
        }
        self.locked_in_buy_orders += amount;
        self.recompute_available();
        true
    }

    /// Release a buy lock. Releasing more than is locked clamps at zero.
    pub fn unlock_from_buy(&mut self, amount: f64) {
        if amount > self.locked_in_buy_orders + 1e-9 {
            warn!(
                "Unlock of {:.4} exceeds buy locks {:.4}, clamping",
                amount, self.locked_in_buy_orders
            );
        }
        self.locked_in_buy_orders = (self.locked_in_buy_orders - amount).max(0.0);
        self.recompute_available();
    }

    /// Move a filled buy's lock into positions
    pub fn buy_filled(&mut self, amount: f64) {
        let moved = amount.min(self.locked_in_buy_orders).max(0.0);
        self.locked_in_buy_orders -= moved;
        self.locked_in_positions += moved;
        self.recompute_available();
    }

    /// Book a filled sell and return the realized profit
    pub fn sell_filled(&mut self, cost_basis: f64, proceeds: f64) -> f64 {
        let released = cost_basis.min(self.locked_in_positions).max(0.0);
        self.locked_in_positions -= released;
        let profit = proceeds - cost_basis;
        self.total_capital = (self.total_capital + profit).max(0.0);
        // A large loss can shrink total below what is still locked
        let locked = self.locked_in_buy_orders + self.locked_in_positions;
        if locked > self.total_capital {
            self.total_capital = locked;
        }
        self.recompute_available();
        profit
    }

    /// Reinitialize around a new capital base
    pub fn reset(&mut self, new_total: f64) {
        let total = new_total.max(0.0);
        self.total_capital = total;
        self.initial_capital = total;
        self.locked_in_buy_orders = 0.0;
        self.locked_in_positions = 0.0;
        self.available = total;
    }

    pub fn total_capital(&self) -> f64 {
        self.total_capital
    }

    pub fn available(&self) -> f64 {
        self.available
    }

    pub fn locked_in_buy_orders(&self) -> f64 {
        self.locked_in_buy_orders
    }

    pub fn locked_in_positions(&self) -> f64 {
        self.locked_in_positions
    }

    pub fn snapshot(&self) -> FundSnapshot {
        let locked = self.locked_in_buy_orders + self.locked_in_positions;
        let usage_percent = if self.total_capital > 0.0 {
            locked / self.total_capital * 100.0
        } else {
            0.0
        };
        FundSnapshot {
            total_capital: self.total_capital,
            initial_capital: self.initial_capital,
            available: self.available,
            available_for_orders: self.available_for_orders(),
            locked_in_buy_orders: self.locked_in_buy_orders,
            locked_in_positions: self.locked_in_positions,
            usage_percent,
            profit: self.total_capital - self.initial_capital,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_invariants(fm: &FundManager) {
        assert!(fm.available() >= 0.0);
        assert!(fm.locked_in_buy_orders() >= 0.0);
        assert!(fm.locked_in_positions() >= 0.0);
        assert!(fm.locked_in_buy_orders() + fm.locked_in_positions() <= fm.total_capital() + 1e-9);
    }

    #[test]
    fn test_reserve_blocks_second_lock() {
        let mut fm = FundManager::new(100.0, 0.05);
        assert!((fm.available_for_orders() - 95.0).abs() < 1e-9);

        assert!(fm.lock_for_buy(30.0));
        // 70 free minus 5 reserve leaves 65
        assert!(!fm.lock_for_buy(80.0));
        assert!((fm.locked_in_buy_orders() - 30.0).abs() < 1e-9);
        assert!((fm.available() - 70.0).abs() < 1e-9);
        assert_invariants(&fm);
    }

    #[test]
    fn test_double_unlock_is_clamped() {
        let mut fm = FundManager::new(100.0, 0.05);
        assert!(fm.lock_for_buy(20.0));
        fm.unlock_from_buy(20.0);
        fm.unlock_from_buy(20.0);
        assert_eq!(fm.locked_in_buy_orders(), 0.0);
        assert!((fm.available() - 100.0).abs() < 1e-9);
        assert_invariants(&fm);
    }

    #[test]
    fn test_round_trip_books_profit() {
        let mut fm = FundManager::new(100.0, 0.05);
        assert!(fm.lock_for_buy(25.0));
        fm.buy_filled(25.0);
        assert_eq!(fm.locked_in_buy_orders(), 0.0);
        assert!((fm.locked_in_positions() - 25.0).abs() < 1e-9);

        let profit = fm.sell_filled(25.0, 25.5);
        assert!((profit - 0.5).abs() < 1e-9);
        assert!((fm.total_capital() - 100.5).abs() < 1e-9);
        assert!((fm.snapshot().profit - 0.5).abs() < 1e-9);
        assert_eq!(fm.locked_in_positions(), 0.0);
        assert_invariants(&fm);
    }

    #[test]
    fn test_invariants_hold_over_mixed_sequence() {
        let mut fm = FundManager::new(200.0, 0.05);
        let ops: [(u8, f64); 12] = [
            (0, 50.0),
            (0, 60.0),
            (2, 50.0),
            (0, 100.0),
            (1, 60.0),
            (1, 60.0),
            (3, 50.0),
            (0, 40.0),
            (2, 70.0),
            (3, 10.0),
            (1, 500.0),
            (0, 1000.0),
        ];
        for (op, amount) in ops {
            match op {
                0 => {
                    fm.lock_for_buy(amount);
                }
                1 => fm.unlock_from_buy(amount),
                2 => fm.buy_filled(amount),
                _ => {
                    fm.sell_filled(amount, amount * 0.9);
                }
            }
            assert_invariants(&fm);
        }
    }

    #[test]
    fn test_loss_never_leaves_locks_above_total() {
        let mut fm = FundManager::new(10.0, 0.0);
        assert!(fm.lock_for_buy(5.0));
        fm.buy_filled(5.0);
        assert!(fm.lock_for_buy(5.0));
        fm.buy_filled(5.0);
        // Sell one position at a total loss
        fm.sell_filled(5.0, 0.0);
        assert_invariants(&fm);
    }

    #[test]
    fn test_reset() {
        let mut fm = FundManager::new(100.0, 0.05);
        fm.lock_for_buy(40.0);
        fm.reset(250.0);
        let snap = fm.snapshot();
        assert_eq!(snap.locked_in_buy_orders, 0.0);
        assert_eq!(snap.total_capital, 250.0);
        assert_eq!(snap.profit, 0.0);
        assert_eq!(snap.usage_percent, 0.0);
    }
}
