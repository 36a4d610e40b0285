//! Stop-loss evaluation
//!
//! Two independent rules: a per-level rule that forces a sell of a losing
//! position, and an aggregate rule over realized plus unrealized P&L that
//! latches once and halts the whole engine.

use log::{debug, error, warn};

use super::config::GridConfig;
use super::level::GridLevel;

/// A losing level that must be sold
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LevelTrigger {
    pub index: usize,
    /// Negative fraction, e.g. -0.06 for a 6% loss
    pub loss_fraction: f64,
    pub loss_amount: f64,
}

/// Stop-loss thresholds and the aggregate latch
#[derive(Debug, Clone)]
pub struct StopLossController {
    grid_enabled: bool,
    grid_threshold: f64,
    total_enabled: bool,
    total_limit: f64,
    latched: bool,
}

impl StopLossController {
    pub fn new(grid_enabled: bool, grid_percent: f64, total_enabled: bool, total_limit: f64) -> Self {
        Self {
            grid_enabled,
            grid_threshold: grid_percent / 100.0,
            total_enabled,
            total_limit,
            latched: false,
        }
    }

    pub fn from_config(config: &GridConfig) -> Self {
        Self::new(
            config.grid_stoploss_enabled,
            config.grid_stoploss_percent,
            config.total_stoploss_enabled,
            config.total_stoploss_limit,
        )
    }

    /// Levels whose loss exceeds the per-level threshold, worst first
    pub fn level_triggers<'a>(
        &self,
        levels: impl IntoIterator<Item = &'a GridLevel>,
        price: f64,
    ) -> Vec<LevelTrigger> {
        if !self.grid_enabled || price <= 0.0 {
            return Vec::new();
        }
        let mut triggers: Vec<LevelTrigger> = levels
            .into_iter()
            .filter_map(|level| {
                let fraction = level.pnl_fraction(price)?;
                if fraction < -self.grid_threshold {
                    warn!(
                        "Level {} stop-loss: cost {:.4}, value {:.4}, {:.2}%",
                        level.index,
                        level.cost_basis(),
                        level.filled_quantity() * price,
                        fraction * 100.0
                    );
                    Some(LevelTrigger {
                        index: level.index,
                        loss_fraction: fraction,
                        loss_amount: -level.unrealized_pnl(price),
                    })
                } else {
                    None
                }
            })
            .collect();
        triggers.sort_by(|a, b| a.loss_fraction.total_cmp(&b.loss_fraction));
        triggers
    }

    /// Evaluate the aggregate rule. Returns true exactly once, when the latch trips.
    pub fn check_total(&mut self, realized: f64, unrealized: f64) -> bool {
        if !self.total_enabled || self.latched {
            return false;
        }
        let total = realized + unrealized;
        if total < -self.total_limit * 0.8 {
            warn!(
                "Total P&L {:.4} (realized {:.4}, unrealized {:.4}) approaching limit -{}",
                total, realized, unrealized, self.total_limit
            );
        } else {
            debug!("Total P&L {:.4}, limit -{}", total, self.total_limit);
        }
        if total < -self.total_limit {
            error!(
                "Total stop-loss triggered: P&L {:.4} below -{}",
                total, self.total_limit
            );
            self.latched = true;
            return true;
        }
        false
    }

    /// Whether the aggregate stop has fired this session
    pub fn is_latched(&self) -> bool {
        self.latched
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::level::LevelTiming;
    use std::time::{Duration, Instant};

    fn bought_level(index: usize, buy: f64, qty: f64) -> GridLevel {
        let timing = LevelTiming {
            sell_dwell: Duration::from_secs(15),
            sell_retry_backoff: Duration::from_secs(10),
            max_sell_retries: 20,
        };
        let mut level = GridLevel::new(index, buy, buy * 1.02, qty, buy * qty, timing);
        level.prepare_for_buy(buy * qty);
        level.buy_order_placed(format!("b{}", index)).unwrap();
        level.buy_filled(qty, Instant::now()).unwrap();
        level
    }

    #[test]
    fn test_six_percent_loss_triggers_at_five() {
        let controller = StopLossController::new(true, 5.0, true, 10.0);
        let level = bought_level(0, 100.0, 1.0);
        let triggers = controller.level_triggers([&level], 94.0);
        assert_eq!(triggers.len(), 1);
        assert_eq!(triggers[0].index, 0);
        assert!((triggers[0].loss_fraction + 0.06).abs() < 1e-9);
        assert!((triggers[0].loss_amount - 6.0).abs() < 1e-9);

        // 4% loss stays below the threshold
        assert!(controller.level_triggers([&level], 96.0).is_empty());
    }

    #[test]
    fn test_disabled_grid_rule_never_triggers() {
        let controller = StopLossController::new(false, 5.0, true, 10.0);
        let level = bought_level(0, 100.0, 1.0);
        assert!(controller.level_triggers([&level], 50.0).is_empty());
    }

    #[test]
    fn test_worst_level_first() {
        let controller = StopLossController::new(true, 5.0, false, 10.0);
        let a = bought_level(0, 100.0, 1.0);
        let b = bought_level(1, 110.0, 1.0);
        let triggers = controller.level_triggers([&a, &b], 90.0);
        assert_eq!(triggers.iter().map(|t| t.index).collect::<Vec<_>>(), vec![1, 0]);
    }

    #[test]
    fn test_total_latch_fires_once() {
        let mut controller = StopLossController::new(true, 5.0, true, 10.0);
        assert!(!controller.check_total(2.0, -11.0));
        assert!(controller.check_total(-2.0, -8.5));
        assert!(controller.is_latched());
        // Never re-arms within the session
        assert!(!controller.check_total(-50.0, 0.0));
        assert!(controller.is_latched());
    }
}
