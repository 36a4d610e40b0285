//! Grid trading configuration

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::errors::{GridError, GridResult};

/// Trading rules of one instrument, fetched from the exchange
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstrumentMeta {
    /// Minimum price increment (tick size)
    pub price_step: f64,
    /// Minimum quantity increment
    pub quantity_step: f64,
    /// Smallest quantity the exchange accepts
    pub min_quantity: f64,
    /// Base asset of the pair, e.g. "BTC" for "BTCUSDT"
    pub base_asset: String,
    /// Quote asset of the pair, e.g. "USDT"
    pub quote_asset: String,
}

impl InstrumentMeta {
    pub fn new(
        price_step: f64,
        quantity_step: f64,
        min_quantity: f64,
        base_asset: impl Into<String>,
        quote_asset: impl Into<String>,
    ) -> Self {
        Self {
            price_step,
            quantity_step,
            min_quantity,
            base_asset: base_asset.into(),
            quote_asset: quote_asset.into(),
        }
    }

    /// Decimal places implied by a step, e.g. 0.001 -> 3
    pub fn step_decimals(step: f64) -> u32 {
        if step <= 0.0 || step >= 1.0 {
            return 0;
        }
        let decimals = (-step.log10() - 1e-9).ceil();
        decimals.clamp(0.0, 12.0) as u32
    }

    /// Round a price to the nearest tick
    pub fn round_price(&self, price: f64) -> f64 {
        round_to_step(price, self.price_step, false)
    }

    /// Round a quantity to the nearest step
    pub fn round_quantity(&self, quantity: f64) -> f64 {
        round_to_step(quantity, self.quantity_step, false)
    }

    /// Round a quantity down to the step so it never exceeds what is held
    pub fn floor_quantity(&self, quantity: f64) -> f64 {
        round_to_step(quantity, self.quantity_step, true)
    }

    pub fn price_decimals(&self) -> u32 {
        Self::step_decimals(self.price_step)
    }

    pub fn quantity_decimals(&self) -> u32 {
        Self::step_decimals(self.quantity_step)
    }
}

impl Default for InstrumentMeta {
    fn default() -> Self {
        Self::new(0.01, 0.001, 0.001, "BASE", "USDT")
    }
}

fn round_to_step(value: f64, step: f64, floor: bool) -> f64 {
    if step <= 0.0 {
        return value;
    }
    let steps = value / step;
    // Absorb float noise such as 2.9999999999 steps before flooring
    let steps = if floor {
        (steps + 1e-9).floor()
    } else {
        steps.round()
    };
    let factor = 10f64.powi(InstrumentMeta::step_decimals(step) as i32);
    (steps * step * factor).round() / factor
}

/// Grid bot configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GridConfig {
    /// Trading pair (e.g., "BTCUSDT")
    pub symbol: String,

    /// Target spread per level in percent; sell = buy * (1 + profit_percent / 100)
    pub profit_percent: f64,

    /// Number of grid levels
    pub grid_count: u32,

    /// Share of the available quote balance committed to the grid, in percent
    #[serde(default = "default_capital_percent")]
    pub capital_percent: f64,

    /// Capital committed to the grid, resolved from the balance at start
    #[serde(default)]
    pub total_capital: f64,

    /// Recenter once price drifts this many percent from the center
    #[serde(default = "default_rebalance_threshold")]
    pub rebalance_threshold_percent: f64,

    #[serde(default = "default_true")]
    pub auto_rebalance: bool,

    #[serde(default = "default_true")]
    pub grid_stoploss_enabled: bool,

    /// Per-level loss in percent that forces a sell
    #[serde(default = "default_grid_stoploss_percent")]
    pub grid_stoploss_percent: f64,

    #[serde(default = "default_true")]
    pub total_stoploss_enabled: bool,

    /// Aggregate loss in quote units that halts the engine
    #[serde(default = "default_total_stoploss_limit")]
    pub total_stoploss_limit: f64,

    /// Fraction of total capital never allocated to buy orders
    #[serde(default = "default_reserve_ratio")]
    pub reserve_ratio: f64,

    /// Minimum wait after a buy fill before the first sell attempt
    #[serde(default = "default_sell_dwell")]
    pub sell_dwell_secs: u64,

    /// Minimum wait between successive sell attempts
    #[serde(default = "default_sell_retry_backoff")]
    pub sell_retry_backoff_secs: u64,

    /// Failed sell attempts before a level is marked stuck
    #[serde(default = "default_max_sell_retries")]
    pub max_sell_retries: u32,

    /// Only levels with buy price below price * discount get a buy order
    #[serde(default = "default_buy_trigger_discount")]
    pub buy_trigger_discount: f64,

    #[serde(default = "default_stoploss_price_factor")]
    pub stoploss_price_factor: f64,

    #[serde(default = "default_emergency_price_factor")]
    pub emergency_price_factor: f64,

    /// Smallest order notional the exchange accepts
    #[serde(default = "default_min_order_value")]
    pub min_order_value: f64,

    #[serde(default = "default_check_interval")]
    pub check_interval_secs: u64,

    #[serde(default = "default_price_monitor_interval")]
    pub price_monitor_interval_secs: u64,

    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    #[serde(default = "default_first_check_delay")]
    pub first_check_delay_ms: u64,

    #[serde(default = "default_rebalance_cooldown")]
    pub rebalance_cooldown_ms: u64,

    #[serde(default = "default_sell_pacing")]
    pub sell_pacing_ms: u64,

    #[serde(default = "default_buy_pacing")]
    pub buy_pacing_ms: u64,

    #[serde(default = "default_cancel_pacing")]
    pub cancel_pacing_ms: u64,

    #[serde(default = "default_stoploss_pacing")]
    pub stoploss_pacing_ms: u64,

    /// Wait after cancelling everything before liquidating the base balance
    #[serde(default = "default_emergency_settle")]
    pub emergency_settle_ms: u64,

    /// Maximum retry attempts for transient gateway errors
    #[serde(default = "default_max_retries")]
    pub max_order_retries: u32,

    /// Base delay for exponential backoff (milliseconds)
    #[serde(default = "default_retry_base_delay")]
    pub retry_base_delay_ms: u64,

    /// Fallback taker fee when the fee query fails
    #[serde(default = "default_taker_fee_rate")]
    pub taker_fee_rate: f64,

    /// Snapshot persistence file path
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot_file: Option<PathBuf>,
}

fn default_true() -> bool {
    true
}

fn default_capital_percent() -> f64 {
    100.0
}

fn default_rebalance_threshold() -> f64 {
    15.0
}

fn default_grid_stoploss_percent() -> f64 {
    5.0
}

fn default_total_stoploss_limit() -> f64 {
    10.0
}

fn default_reserve_ratio() -> f64 {
    0.05
}

fn default_sell_dwell() -> u64 {
    15
}

fn default_sell_retry_backoff() -> u64 {
    10
}

fn default_max_sell_retries() -> u32 {
    20
}

fn default_buy_trigger_discount() -> f64 {
    0.998
}

fn default_stoploss_price_factor() -> f64 {
    0.99
}

fn default_emergency_price_factor() -> f64 {
    0.995
}

fn default_min_order_value() -> f64 {
    5.0
}

fn default_check_interval() -> u64 {
    10
}

fn default_price_monitor_interval() -> u64 {
    10
}

fn default_poll_interval() -> u64 {
    15
}

fn default_first_check_delay() -> u64 {
    2000
}

fn default_rebalance_cooldown() -> u64 {
    1000
}

fn default_sell_pacing() -> u64 {
    500
}

fn default_buy_pacing() -> u64 {
    400
}

fn default_cancel_pacing() -> u64 {
    300
}

fn default_stoploss_pacing() -> u64 {
    1000
}

fn default_emergency_settle() -> u64 {
    2000
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_base_delay() -> u64 {
    2000
}

fn default_taker_fee_rate() -> f64 {
    0.001
}

impl GridConfig {
    /// Create a new grid configuration with required parameters
    ///
    /// # Arguments
    /// * `symbol` - Trading pair (e.g., "BTCUSDT")
    /// * `profit_percent` - Spread between buy and sell of one level, in percent
    /// * `grid_count` - Number of grid levels
    pub fn new(symbol: impl Into<String>, profit_percent: f64, grid_count: u32) -> Self {
        Self {
            symbol: symbol.into(),
            profit_percent,
            grid_count,
            capital_percent: default_capital_percent(),
            total_capital: 0.0,
            rebalance_threshold_percent: default_rebalance_threshold(),
            auto_rebalance: true,
            grid_stoploss_enabled: true,
            grid_stoploss_percent: default_grid_stoploss_percent(),
            total_stoploss_enabled: true,
            total_stoploss_limit: default_total_stoploss_limit(),
            reserve_ratio: default_reserve_ratio(),
            sell_dwell_secs: default_sell_dwell(),
            sell_retry_backoff_secs: default_sell_retry_backoff(),
            max_sell_retries: default_max_sell_retries(),
            buy_trigger_discount: default_buy_trigger_discount(),
            stoploss_price_factor: default_stoploss_price_factor(),
            emergency_price_factor: default_emergency_price_factor(),
            min_order_value: default_min_order_value(),
            check_interval_secs: default_check_interval(),
            price_monitor_interval_secs: default_price_monitor_interval(),
            poll_interval_secs: default_poll_interval(),
            first_check_delay_ms: default_first_check_delay(),
            rebalance_cooldown_ms: default_rebalance_cooldown(),
            sell_pacing_ms: default_sell_pacing(),
            buy_pacing_ms: default_buy_pacing(),
            cancel_pacing_ms: default_cancel_pacing(),
            stoploss_pacing_ms: default_stoploss_pacing(),
            emergency_settle_ms: default_emergency_settle(),
            max_order_retries: default_max_retries(),
            retry_base_delay_ms: default_retry_base_delay(),
            taker_fee_rate: default_taker_fee_rate(),
            snapshot_file: None,
        }
    }

    /// Builder: preset the committed capital instead of deriving it from the balance
    pub fn with_total_capital(mut self, capital: f64) -> Self {
        self.total_capital = capital;
        self
    }

    /// Builder: set the share of the balance to commit
    pub fn with_capital_percent(mut self, percent: f64) -> Self {
        self.capital_percent = percent;
        self
    }

    /// Builder: set rebalance threshold and toggle
    pub fn with_rebalance(mut self, threshold_percent: f64, enabled: bool) -> Self {
        self.rebalance_threshold_percent = threshold_percent;
        self.auto_rebalance = enabled;
        self
    }

    /// Builder: configure the per-level stop-loss
    pub fn with_grid_stoploss(mut self, enabled: bool, percent: f64) -> Self {
        self.grid_stoploss_enabled = enabled;
        self.grid_stoploss_percent = percent;
        self
    }

    /// Builder: configure the aggregate stop-loss
    pub fn with_total_stoploss(mut self, enabled: bool, limit: f64) -> Self {
        self.total_stoploss_enabled = enabled;
        self.total_stoploss_limit = limit;
        self
    }

    /// Builder: set sell settlement timings and the stuck threshold
    pub fn with_sell_timing(mut self, dwell_secs: u64, backoff_secs: u64, max_retries: u32) -> Self {
        self.sell_dwell_secs = dwell_secs;
        self.sell_retry_backoff_secs = backoff_secs;
        self.max_sell_retries = max_retries;
        self
    }

    /// Builder: zero every pacing and cooldown delay
    pub fn without_pacing(mut self) -> Self {
        self.first_check_delay_ms = 0;
        self.rebalance_cooldown_ms = 0;
        self.sell_pacing_ms = 0;
        self.buy_pacing_ms = 0;
        self.cancel_pacing_ms = 0;
        self.stoploss_pacing_ms = 0;
        self.emergency_settle_ms = 0;
        self.retry_base_delay_ms = 0;
        self
    }

    /// Builder: persist snapshots to the given path
    pub fn with_snapshot_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.snapshot_file = Some(path.into());
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> GridResult<()> {
        if self.symbol.is_empty() {
            return Err(GridError::InvalidConfig("symbol cannot be empty".into()));
        }

        if self.profit_percent <= 0.0 || self.profit_percent >= 100.0 {
            return Err(GridError::InvalidConfig(
                "profit_percent must be between 0 and 100".into(),
            ));
        }

        if self.grid_count < 1 {
            return Err(GridError::InvalidConfig(
                "grid_count must be at least 1".into(),
            ));
        }

        // The range must stay above zero: lower = center * (1 - f * n / 2)
        if self.range_fraction() >= 1.0 {
            return Err(GridError::InvalidConfig(format!(
                "profit_percent {} x grid_count {} spans more than the whole price",
                self.profit_percent, self.grid_count
            )));
        }

        if self.capital_percent <= 0.0 || self.capital_percent > 100.0 {
            return Err(GridError::InvalidConfig(
                "capital_percent must be in (0, 100]".into(),
            ));
        }

        if self.total_capital < 0.0 {
            return Err(GridError::InvalidConfig(
                "total_capital cannot be negative".into(),
            ));
        }

        if !(0.0..1.0).contains(&self.reserve_ratio) {
            return Err(GridError::InvalidConfig(
                "reserve_ratio must be in [0, 1)".into(),
            ));
        }

        if self.rebalance_threshold_percent <= 0.0 {
            return Err(GridError::InvalidConfig(
                "rebalance_threshold_percent must be positive".into(),
            ));
        }

        if self.grid_stoploss_enabled && self.grid_stoploss_percent <= 0.0 {
            return Err(GridError::InvalidConfig(
                "grid_stoploss_percent must be positive".into(),
            ));
        }

        if self.total_stoploss_enabled && self.total_stoploss_limit <= 0.0 {
            return Err(GridError::InvalidConfig(
                "total_stoploss_limit must be positive".into(),
            ));
        }

        if self.max_sell_retries == 0 {
            return Err(GridError::InvalidConfig(
                "max_sell_retries must be at least 1".into(),
            ));
        }

        if self.max_order_retries == 0 {
            return Err(GridError::InvalidConfig(
                "max_order_retries must be at least 1".into(),
            ));
        }

        Ok(())
    }

    /// Spread of one level as a fraction
    pub fn profit_fraction(&self) -> f64 {
        self.profit_percent / 100.0
    }

    /// Half-width of the grid as a fraction of the center price
    pub fn range_fraction(&self) -> f64 {
        self.profit_fraction() * self.grid_count as f64 / 2.0
    }

    pub fn rebalance_threshold(&self) -> f64 {
        self.rebalance_threshold_percent / 100.0
    }

    /// Quote capital allocated to each level
    pub fn capital_per_level(&self) -> f64 {
        self.total_capital / self.grid_count as f64
    }

    pub fn sell_dwell(&self) -> Duration {
        Duration::from_secs(self.sell_dwell_secs)
    }

    pub fn sell_retry_backoff(&self) -> Duration {
        Duration::from_secs(self.sell_retry_backoff_secs)
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs)
    }

    pub fn price_monitor_interval(&self) -> Duration {
        Duration::from_secs(self.price_monitor_interval_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn first_check_delay(&self) -> Duration {
        Duration::from_millis(self.first_check_delay_ms)
    }

    pub fn rebalance_cooldown(&self) -> Duration {
        Duration::from_millis(self.rebalance_cooldown_ms)
    }

    pub fn emergency_settle(&self) -> Duration {
        Duration::from_millis(self.emergency_settle_ms)
    }

    /// Load config from JSON file
    pub fn load_from_file(path: impl AsRef<std::path::Path>) -> GridResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Save config to JSON file
    pub fn save_to_file(&self, path: impl AsRef<std::path::Path>) -> GridResult<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_validation() {
        let config = GridConfig::new("BTCUSDT", 2.0, 10);
        assert!(config.validate().is_ok());

        // Invalid: empty symbol
        let config = GridConfig::new("", 2.0, 10);
        assert!(config.validate().is_err());

        // Invalid: zero grids
        let config = GridConfig::new("BTCUSDT", 2.0, 0);
        assert!(config.validate().is_err());

        // Invalid: range wider than the price itself (2.5% x 80 / 2 = 100%)
        let config = GridConfig::new("BTCUSDT", 2.5, 80);
        assert!(config.validate().is_err());

        // Invalid: reserve ratio of 1 would block every buy
        let mut config = GridConfig::new("BTCUSDT", 2.0, 10);
        config.reserve_ratio = 1.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_defaults_from_partial_json() {
        let json = r#"{ "symbol": "ETHUSDT", "profit_percent": 1.5, "grid_count": 8 }"#;
        let config: GridConfig = serde_json::from_str(json).unwrap();

        assert_eq!(config.max_sell_retries, 20);
        assert_eq!(config.sell_dwell_secs, 15);
        assert_eq!(config.sell_retry_backoff_secs, 10);
        assert!((config.reserve_ratio - 0.05).abs() < 1e-12);
        assert!((config.rebalance_threshold_percent - 15.0).abs() < 1e-12);
        assert!(config.auto_rebalance);
        assert!(config.snapshot_file.is_none());
    }

    #[test]
    fn test_range_and_capital_per_level() {
        let config = GridConfig::new("BTCUSDT", 2.0, 4).with_total_capital(1000.0);
        assert!((config.range_fraction() - 0.04).abs() < 1e-12);
        assert!((config.capital_per_level() - 250.0).abs() < 1e-9);
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let path = std::env::temp_dir().join(format!("grid_cfg_{}.json", uuid::Uuid::new_v4()));
        let config = GridConfig::new("SOLUSDT", 1.0, 6).with_grid_stoploss(false, 5.0);
        config.save_to_file(&path).unwrap();

        let loaded = GridConfig::load_from_file(&path).unwrap();
        assert_eq!(loaded.symbol, "SOLUSDT");
        assert!(!loaded.grid_stoploss_enabled);
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_step_rounding() {
        let meta = InstrumentMeta::new(0.01, 0.001, 0.001, "BTC", "USDT");
        assert_eq!(meta.price_decimals(), 2);
        assert_eq!(meta.quantity_decimals(), 3);
        assert!((meta.round_price(96.0849) - 96.08).abs() < 1e-12);
        assert!((meta.round_quantity(1.23456) - 1.235).abs() < 1e-12);
        assert!((meta.floor_quantity(1.23456) - 1.234).abs() < 1e-12);

        // 0.3 / 0.1 is 2.9999999999999996 in floating point
        let coarse = InstrumentMeta::new(0.1, 0.1, 0.1, "X", "USDT");
        assert!((coarse.floor_quantity(0.3) - 0.3).abs() < 1e-12);
        assert_eq!(InstrumentMeta::step_decimals(1.0), 0);
    }
}
