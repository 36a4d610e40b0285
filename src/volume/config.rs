//! Volume cycling configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::grid::errors::{GridError, GridResult};

/// Configuration for back-to-back buy/sell round trips
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeConfig {
    /// Trading pair (e.g., "BTCUSDT")
    pub symbol: String,

    /// Pause between round trips
    #[serde(default = "default_interval")]
    pub interval_secs: u64,

    /// Share of the available quote balance used per round trip
    #[serde(default = "default_capital_percent")]
    pub capital_percent: f64,

    /// Distance from the live price, in percent
    #[serde(default = "default_price_offset")]
    pub price_offset_percent: f64,

    /// Rest passively outside the price (true) or cross it (false)
    #[serde(default = "default_true")]
    pub maker_mode: bool,

    /// How long a leg may rest before it is cancelled
    #[serde(default = "default_order_timeout")]
    pub order_timeout_secs: u64,

    /// On maker timeout: retry at half the offset, then cross as taker
    #[serde(default = "default_true")]
    pub adaptive: bool,

    /// Offset of the last-resort taker order, in percent
    #[serde(default = "default_taker_fallback_offset")]
    pub taker_fallback_offset_percent: f64,

    #[serde(default = "default_taker_fallback_timeout")]
    pub taker_fallback_timeout_secs: u64,

    /// Halt once fees plus price slippage reach this amount of quote
    #[serde(default = "default_max_loss")]
    pub max_loss: f64,

    /// Halt once traded notional reaches this amount of quote
    #[serde(default = "default_max_volume")]
    pub max_volume: f64,

    #[serde(default = "default_true")]
    pub stop_on_error: bool,

    #[serde(default = "default_max_consecutive_errors")]
    pub max_consecutive_errors: u32,

    /// Order status polling period while waiting for a fill
    #[serde(default = "default_fill_poll_interval")]
    pub fill_poll_interval_ms: u64,

    /// Wait after the buy fill before reading the base balance
    #[serde(default = "default_settle_delay")]
    pub settle_delay_ms: u64,

    #[serde(default = "default_max_retries")]
    pub max_order_retries: u32,

    #[serde(default = "default_retry_base_delay")]
    pub retry_base_delay_ms: u64,
}

fn default_true() -> bool {
    true
}

fn default_interval() -> u64 {
    6
}

fn default_capital_percent() -> f64 {
    100.0
}

fn default_price_offset() -> f64 {
    0.08
}

fn default_order_timeout() -> u64 {
    45
}

fn default_taker_fallback_offset() -> f64 {
    0.03
}

fn default_taker_fallback_timeout() -> u64 {
    10
}

fn default_max_loss() -> f64 {
    50.0
}

fn default_max_volume() -> f64 {
    100_000.0
}

fn default_max_consecutive_errors() -> u32 {
    5
}

fn default_fill_poll_interval() -> u64 {
    2000
}

fn default_settle_delay() -> u64 {
    10_000
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_base_delay() -> u64 {
    2000
}

impl VolumeConfig {
    pub fn new(symbol: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            interval_secs: default_interval(),
            capital_percent: default_capital_percent(),
            price_offset_percent: default_price_offset(),
            maker_mode: true,
            order_timeout_secs: default_order_timeout(),
            adaptive: true,
            taker_fallback_offset_percent: default_taker_fallback_offset(),
            taker_fallback_timeout_secs: default_taker_fallback_timeout(),
            max_loss: default_max_loss(),
            max_volume: default_max_volume(),
            stop_on_error: true,
            max_consecutive_errors: default_max_consecutive_errors(),
            fill_poll_interval_ms: default_fill_poll_interval(),
            settle_delay_ms: default_settle_delay(),
            max_order_retries: default_max_retries(),
            retry_base_delay_ms: default_retry_base_delay(),
        }
    }

    /// Builder: price offset and execution style
    pub fn with_offset(mut self, percent: f64, maker_mode: bool) -> Self {
        self.price_offset_percent = percent;
        self.maker_mode = maker_mode;
        self
    }

    /// Builder: leg timeouts and the adaptive ladder
    pub fn with_timeouts(mut self, order_timeout_secs: u64, taker_fallback_secs: u64, adaptive: bool) -> Self {
        self.order_timeout_secs = order_timeout_secs;
        self.taker_fallback_timeout_secs = taker_fallback_secs;
        self.adaptive = adaptive;
        self
    }

    /// Builder: governor ceilings
    pub fn with_limits(mut self, max_loss: f64, max_volume: f64, max_consecutive_errors: u32) -> Self {
        self.max_loss = max_loss;
        self.max_volume = max_volume;
        self.max_consecutive_errors = max_consecutive_errors;
        self
    }

    /// Builder: zero the inter-cycle pause, settle wait and retry delays
    pub fn without_delays(mut self) -> Self {
        self.interval_secs = 0;
        self.settle_delay_ms = 0;
        self.fill_poll_interval_ms = 1;
        self.retry_base_delay_ms = 0;
        self
    }

    pub fn validate(&self) -> GridResult<()> {
        if self.symbol.is_empty() {
            return Err(GridError::InvalidConfig("symbol cannot be empty".into()));
        }
        if self.capital_percent <= 0.0 || self.capital_percent > 100.0 {
            return Err(GridError::InvalidConfig(
                "capital_percent must be in (0, 100]".into(),
            ));
        }
        if self.price_offset_percent < 0.0 || self.price_offset_percent >= 10.0 {
            return Err(GridError::InvalidConfig(
                "price_offset_percent must be in [0, 10)".into(),
            ));
        }
        if self.max_loss <= 0.0 || self.max_volume <= 0.0 {
            return Err(GridError::InvalidConfig(
                "max_loss and max_volume must be positive".into(),
            ));
        }
        if self.max_consecutive_errors == 0 || self.max_order_retries == 0 {
            return Err(GridError::InvalidConfig(
                "error and retry ceilings must be at least 1".into(),
            ));
        }
        Ok(())
    }

    pub fn offset_fraction(&self) -> f64 {
        self.price_offset_percent / 100.0
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn order_timeout(&self) -> Duration {
        Duration::from_secs(self.order_timeout_secs)
    }

    pub fn taker_fallback_timeout(&self) -> Duration {
        Duration::from_secs(self.taker_fallback_timeout_secs)
    }

    pub fn fill_poll_interval(&self) -> Duration {
        Duration::from_millis(self.fill_poll_interval_ms)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = VolumeConfig::new("BTCUSDT");
        assert_eq!(config.interval_secs, 6);
        assert_eq!(config.price_offset_percent, 0.08);
        assert!(config.maker_mode && config.adaptive && config.stop_on_error);
        assert_eq!(config.order_timeout(), Duration::from_secs(45));
        assert_eq!(config.max_loss, 50.0);
        assert_eq!(config.max_volume, 100_000.0);
        assert_eq!(config.max_consecutive_errors, 5);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_missing_fields_take_defaults() {
        let config: VolumeConfig =
            serde_json::from_str(r#"{"symbol": "ETHUSDT", "maker_mode": false}"#).unwrap();
        assert!(!config.maker_mode);
        assert_eq!(config.settle_delay(), Duration::from_secs(10));
        assert_eq!(config.fill_poll_interval(), Duration::from_secs(2));
    }

    #[test]
    fn test_validation() {
        assert!(VolumeConfig::new("").validate().is_err());
        let mut config = VolumeConfig::new("BTCUSDT");
        config.capital_percent = 0.0;
        assert!(config.validate().is_err());
        let config = VolumeConfig::new("BTCUSDT").with_limits(0.0, 1000.0, 5);
        assert!(config.validate().is_err());
    }
}
