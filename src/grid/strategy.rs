//! Grid strategy - level calculation and the recentering trigger

use log::{debug, warn};
use serde::{Deserialize, Serialize};

use super::config::{GridConfig, InstrumentMeta};
use super::level::{GridLevel, LevelTiming};

/// Price range derived from a center price
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GridParams {
    pub center_price: f64,
    pub upper_price: f64,
    pub lower_price: f64,
    pub interval: f64,
    pub capital_per_level: f64,
}

/// One computed level before it becomes a live [`GridLevel`]
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LevelPlan {
    pub index: usize,
    pub buy_price: f64,
    pub sell_price: f64,
    pub quantity: f64,
    pub capital: f64,
}

/// Fixed-spread grid centered on a price
#[derive(Debug, Clone, Copy, Default)]
pub struct GridStrategy;

impl GridStrategy {
    /// Range and spacing for a grid centered on `center_price`
    ///
    /// Half range r = profit * count / 2; the grid spans [P(1-r), P(1+r)]
    /// split into `grid_count` equal intervals.
    pub fn calculate_params(
        &self,
        config: &GridConfig,
        meta: &InstrumentMeta,
        center_price: f64,
    ) -> GridParams {
        let range = config.range_fraction();
        let upper = center_price * (1.0 + range);
        let lower = center_price * (1.0 - range);
        let interval = (upper - lower) / config.grid_count as f64;

        debug!(
            "Grid params: {}% x {} levels = +/-{:.2}%",
            config.profit_percent,
            config.grid_count,
            range * 100.0
        );

        GridParams {
            center_price,
            upper_price: meta.round_price(upper),
            lower_price: meta.round_price(lower),
            interval: meta.round_price(interval),
            capital_per_level: config.capital_per_level(),
        }
    }

    /// Buy/sell prices and quantities of every usable level
    ///
    /// Levels whose sell price would exceed the upper bound, or whose
    /// quantity rounds to zero, are skipped. Indices keep their grid
    /// position, so skipped levels leave gaps.
    pub fn calculate_levels(
        &self,
        config: &GridConfig,
        meta: &InstrumentMeta,
        params: &GridParams,
    ) -> Vec<LevelPlan> {
        let multiplier = 1.0 + config.profit_fraction();
        let mut plans = Vec::with_capacity(config.grid_count as usize);

        for i in 0..config.grid_count as usize {
            let buy_price = meta.round_price(params.lower_price + params.interval * i as f64);
            let sell_price = meta.round_price(buy_price * multiplier);

            if sell_price > params.upper_price {
                warn!(
                    "Level {} sell price {} above upper bound {}, skipped",
                    i, sell_price, params.upper_price
                );
                continue;
            }

            if buy_price <= 0.0 {
                continue;
            }

            let quantity = meta.round_quantity(params.capital_per_level / buy_price);
            if quantity <= 0.0 {
                warn!("Level {} quantity rounds to zero, skipped", i);
                continue;
            }

            plans.push(LevelPlan {
                index: i,
                buy_price,
                sell_price,
                quantity,
                capital: params.capital_per_level,
            });
        }

        plans
    }

    /// Turn plans into fresh idle levels
    pub fn build_levels(&self, plans: &[LevelPlan], timing: LevelTiming) -> Vec<GridLevel> {
        plans
            .iter()
            .map(|p| GridLevel::new(p.index, p.buy_price, p.sell_price, p.quantity, p.capital, timing))
            .collect()
    }

    /// Whether price has drifted far enough from the center to recenter
    pub fn should_rebalance(&self, config: &GridConfig, center_price: f64, current_price: f64) -> bool {
        if center_price <= 0.0 || current_price <= 0.0 {
            return false;
        }
        (current_price - center_price).abs() / center_price > config.rebalance_threshold()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta() -> InstrumentMeta {
        InstrumentMeta::new(0.01, 0.001, 0.001, "BTC", "USDT")
    }

    #[test]
    fn test_center_100_two_percent_four_levels() {
        let config = GridConfig::new("BTCUSDT", 2.0, 4).with_total_capital(100.0);
        let strategy = GridStrategy;
        let params = strategy.calculate_params(&config, &meta(), 100.0);

        assert!((params.upper_price - 104.0).abs() < 1e-9);
        assert!((params.lower_price - 96.0).abs() < 1e-9);
        assert!((params.interval - 2.0).abs() < 1e-9);
        assert!((params.capital_per_level - 25.0).abs() < 1e-9);

        let plans = strategy.calculate_levels(&config, &meta(), &params);
        let buys: Vec<f64> = plans.iter().map(|p| p.buy_price).collect();
        // 102 * 1.02 = 104.04 exceeds the 104 upper bound
        assert_eq!(buys, vec![96.0, 98.0, 100.0]);
        for plan in &plans {
            assert!((plan.sell_price - meta().round_price(plan.buy_price * 1.02)).abs() < 1e-9);
            assert!(plan.sell_price <= params.upper_price);
        }
        assert!((plans[0].quantity - 0.26).abs() < 1e-9);
    }

    #[test]
    fn test_calculation_is_deterministic() {
        let config = GridConfig::new("ETHUSDT", 1.3, 12).with_total_capital(873.0);
        let strategy = GridStrategy;
        let a = strategy.calculate_levels(
            &config,
            &meta(),
            &strategy.calculate_params(&config, &meta(), 2413.77),
        );
        let b = strategy.calculate_levels(
            &config,
            &meta(),
            &strategy.calculate_params(&config, &meta(), 2413.77),
        );
        assert_eq!(a, b);
        assert!(!a.is_empty());
    }

    #[test]
    fn test_zero_quantity_levels_dropped() {
        let config = GridConfig::new("BTCUSDT", 1.0, 4).with_total_capital(1.0);
        let coarse = InstrumentMeta::new(0.01, 1.0, 1.0, "BTC", "USDT");
        let strategy = GridStrategy;
        let params = strategy.calculate_params(&config, &coarse, 50_000.0);
        assert!(strategy.calculate_levels(&config, &coarse, &params).is_empty());
    }

    #[test]
    fn test_should_rebalance() {
        let config = GridConfig::new("BTCUSDT", 2.0, 4).with_rebalance(15.0, true);
        let strategy = GridStrategy;
        assert!(!strategy.should_rebalance(&config, 100.0, 114.9));
        assert!(!strategy.should_rebalance(&config, 100.0, 85.1));
        assert!(strategy.should_rebalance(&config, 100.0, 115.1));
        assert!(strategy.should_rebalance(&config, 100.0, 84.0));
        assert!(!strategy.should_rebalance(&config, 0.0, 84.0));
    }

    #[test]
    fn test_build_levels_are_idle() {
        let config = GridConfig::new("BTCUSDT", 2.0, 4).with_total_capital(100.0);
        let strategy = GridStrategy;
        let params = strategy.calculate_params(&config, &meta(), 100.0);
        let plans = strategy.calculate_levels(&config, &meta(), &params);
        let levels = strategy.build_levels(&plans, LevelTiming::from(&config));
        assert_eq!(levels.len(), plans.len());
        assert!(levels.iter().all(|l| l.state() == crate::grid::types::LevelState::Idle));
        assert_eq!(levels[2].index, 2);
    }
}
