//! Running trade statistics
//!
//! Derived bookkeeping only: every number here can be rebuilt from the
//! fills the engine has processed.

use std::time::Duration;

use chrono::{DateTime, Utc};
use log::info;
use serde::{Deserialize, Serialize};

use super::level::GridLevel;

/// Cumulative volume, fees and realized profit
#[derive(Debug, Clone)]
pub struct TradingStats {
    fee_rate: f64,
    started_at: DateTime<Utc>,
    buy_volume: f64,
    sell_volume: f64,
    total_fees: f64,
    realized_profit: f64,
    buy_count: u32,
    sell_count: u32,
    round_trips: u32,
    stoploss_count: u32,
    rebalance_count: u32,
}

/// Aggregate mark-to-market of all held positions
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct UnrealizedPnl {
    pub total_cost: f64,
    pub current_value: f64,
    pub pnl: f64,
    pub pnl_percent: f64,
    pub position_count: usize,
    pub total_quantity: f64,
}

impl UnrealizedPnl {
    pub fn from_levels<'a>(levels: impl IntoIterator<Item = &'a GridLevel>, price: f64) -> Self {
        let mut out = Self::default();
        for level in levels {
            if level.pnl_fraction(price).is_none() {
                continue;
            }
            out.total_cost += level.cost_basis();
            out.current_value += level.filled_quantity() * price;
            out.total_quantity += level.filled_quantity();
            out.position_count += 1;
        }
        out.pnl = out.current_value - out.total_cost;
        out.pnl_percent = if out.total_cost > 0.0 {
            out.pnl / out.total_cost * 100.0
        } else {
            0.0
        };
        out
    }
}

/// Serializable statistics view
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub started_at: DateTime<Utc>,
    pub runtime_secs: u64,
    pub buy_volume: f64,
    pub sell_volume: f64,
    pub total_volume: f64,
    pub total_fees: f64,
    pub realized_profit: f64,
    pub buy_count: u32,
    pub sell_count: u32,
    pub round_trips: u32,
    pub stoploss_count: u32,
    pub rebalance_count: u32,
}

impl TradingStats {
    pub fn new(fee_rate: f64) -> Self {
        Self {
            fee_rate,
            started_at: Utc::now(),
            buy_volume: 0.0,
            sell_volume: 0.0,
            total_fees: 0.0,
            realized_profit: 0.0,
            buy_count: 0,
            sell_count: 0,
            round_trips: 0,
            stoploss_count: 0,
            rebalance_count: 0,
        }
    }

    pub fn set_fee_rate(&mut self, fee_rate: f64) {
        self.fee_rate = fee_rate;
    }

    pub fn fee_rate(&self) -> f64 {
        self.fee_rate
    }

    /// Record a buy fill; returns the fee charged
    pub fn record_buy(&mut self, price: f64, quantity: f64) -> f64 {
        let volume = price * quantity;
        let fee = volume * self.fee_rate;
        self.buy_volume += volume;
        self.total_fees += fee;
        self.buy_count += 1;
        fee
    }

    /// Record a sell fill closing a level; returns the net profit after
    /// both legs' fees
    pub fn record_sell(&mut self, sell_price: f64, quantity: f64, buy_price: f64) -> f64 {
        let sell_volume = sell_price * quantity;
        let buy_volume = buy_price * quantity;
        let sell_fee = sell_volume * self.fee_rate;
        let buy_fee = buy_volume * self.fee_rate;
        let net = (sell_volume - buy_volume) - (buy_fee + sell_fee);

        self.sell_volume += sell_volume;
        self.total_fees += sell_fee;
        self.realized_profit += net;
        self.sell_count += 1;
        self.round_trips += 1;
        net
    }

    /// Record a sell not tied to a level (liquidation); volume and fee only
    pub fn record_unassigned_sell(&mut self, price: f64, quantity: f64) {
        let volume = price * quantity;
        self.sell_volume += volume;
        self.total_fees += volume * self.fee_rate;
        self.sell_count += 1;
    }

    pub fn record_stoploss(&mut self) {
        self.stoploss_count += 1;
    }

    pub fn record_rebalance(&mut self) {
        self.rebalance_count += 1;
    }

    pub fn realized_profit(&self) -> f64 {
        self.realized_profit
    }

    pub fn rebalance_count(&self) -> u32 {
        self.rebalance_count
    }

    pub fn stoploss_count(&self) -> u32 {
        self.stoploss_count
    }

    pub fn runtime(&self) -> Duration {
        (Utc::now() - self.started_at).to_std().unwrap_or_default()
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            started_at: self.started_at,
            runtime_secs: self.runtime().as_secs(),
            buy_volume: self.buy_volume,
            sell_volume: self.sell_volume,
            total_volume: self.buy_volume + self.sell_volume,
            total_fees: self.total_fees,
            realized_profit: self.realized_profit,
            buy_count: self.buy_count,
            sell_count: self.sell_count,
            round_trips: self.round_trips,
            stoploss_count: self.stoploss_count,
            rebalance_count: self.rebalance_count,
        }
    }

    /// Log a human-readable summary
    pub fn log_report(&self) {
        let s = self.snapshot();
        let mins = s.runtime_secs / 60;
        info!("===== Trading report =====");
        info!("Runtime: {}h {}m", mins / 60, mins % 60);
        info!(
            "Fills: {} buys, {} sells, {} round trips",
            s.buy_count, s.sell_count, s.round_trips
        );
        info!(
            "Volume: {:.2} (buy {:.2} / sell {:.2})",
            s.total_volume, s.buy_volume, s.sell_volume
        );
        info!("Fees: {:.4}", s.total_fees);
        info!("Realized profit: {:.4}", s.realized_profit);
        info!(
            "Stop-losses: {}, rebalances: {}",
            s.stoploss_count, s.rebalance_count
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::level::LevelTiming;
    use std::time::Instant;

    #[test]
    fn test_round_trip_profit_net_of_fees() {
        let mut stats = TradingStats::new(0.001);
        let buy_fee = stats.record_buy(100.0, 1.0);
        assert!((buy_fee - 0.1).abs() < 1e-12);

        let net = stats.record_sell(102.0, 1.0, 100.0);
        // 2.0 gross - 0.1 - 0.102
        assert!((net - 1.798).abs() < 1e-9);

        let snap = stats.snapshot();
        assert!((snap.total_volume - 202.0).abs() < 1e-9);
        assert!((snap.total_fees - 0.202).abs() < 1e-9);
        assert_eq!(snap.round_trips, 1);
        assert!((snap.realized_profit - 1.798).abs() < 1e-9);
    }

    #[test]
    fn test_unassigned_sell_does_not_touch_profit() {
        let mut stats = TradingStats::new(0.001);
        stats.record_unassigned_sell(50.0, 2.0);
        let snap = stats.snapshot();
        assert_eq!(snap.realized_profit, 0.0);
        assert_eq!(snap.round_trips, 0);
        assert!((snap.sell_volume - 100.0).abs() < 1e-9);
    }

    #[test]
    fn test_unrealized_pnl_over_holding_levels() {
        let timing = LevelTiming {
            sell_dwell: Duration::ZERO,
            sell_retry_backoff: Duration::ZERO,
            max_sell_retries: 3,
        };
        let mut held = GridLevel::new(0, 100.0, 102.0, 1.0, 100.0, timing);
        held.prepare_for_buy(100.0);
        held.buy_order_placed("b").unwrap();
        held.buy_filled(1.0, Instant::now()).unwrap();
        let idle = GridLevel::new(1, 98.0, 99.96, 1.0, 100.0, timing);

        let pnl = UnrealizedPnl::from_levels([&held, &idle], 90.0);
        assert_eq!(pnl.position_count, 1);
        assert!((pnl.pnl + 10.0).abs() < 1e-9);
        assert!((pnl.pnl_percent + 10.0).abs() < 1e-9);
    }
}
