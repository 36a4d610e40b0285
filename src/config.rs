use config::{Config, File, FileFormat};
pub use config::ConfigError;
use serde::Deserialize;

use crate::grid::config::GridConfig;
use crate::session::TradingMode;
use crate::volume::config::VolumeConfig;

/// Main configuration struct
#[derive(Debug, Deserialize)]
pub struct Settings {
    /// Which engine to run: "grid" or "volume"
    #[serde(default)]
    pub mode: TradingMode,
    /// Grid engine configuration, required in grid mode
    #[serde(default)]
    pub grid: Option<GridConfig>,
    /// Volume cycling configuration, required in volume mode
    #[serde(default)]
    pub volume: Option<VolumeConfig>,
    /// Simulated exchange
    #[serde(default)]
    pub paper: PaperConfig,
    /// Logging configuration
    #[serde(default)]
    pub log: LogConfig,
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PaperConfig {
    /// Starting quote balance (e.g., USDT)
    #[serde(default = "default_initial_quote")]
    pub initial_quote: f64,
    /// Starting base balance
    #[serde(default)]
    pub initial_base: f64,
    #[serde(default = "default_start_price")]
    pub start_price: f64,
    /// Standard deviation of one random-walk step, in percent
    #[serde(default = "default_volatility")]
    pub volatility_percent: f64,
    /// Milliseconds between simulated price ticks
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,
    #[serde(default = "default_fee_rate")]
    pub maker_fee: f64,
    #[serde(default = "default_fee_rate")]
    pub taker_fee: f64,
    #[serde(default = "default_price_step")]
    pub price_step: f64,
    #[serde(default = "default_quantity_step")]
    pub quantity_step: f64,
    #[serde(default = "default_quantity_step")]
    pub min_quantity: f64,
}

impl Default for PaperConfig {
    fn default() -> Self {
        Self {
            initial_quote: default_initial_quote(),
            initial_base: 0.0,
            start_price: default_start_price(),
            volatility_percent: default_volatility(),
            tick_ms: default_tick_ms(),
            maker_fee: default_fee_rate(),
            taker_fee: default_fee_rate(),
            price_step: default_price_step(),
            quantity_step: default_quantity_step(),
            min_quantity: default_quantity_step(),
        }
    }
}

fn default_initial_quote() -> f64 {
    10_000.0
}

fn default_start_price() -> f64 {
    100.0
}

fn default_volatility() -> f64 {
    0.05
}

fn default_tick_ms() -> u64 {
    1000
}

fn default_fee_rate() -> f64 {
    0.001
}

fn default_price_step() -> f64 {
    0.01
}

fn default_quantity_step() -> f64 {
    0.001
}

#[derive(Debug, Deserialize, Default)]
pub struct LogConfig {
    /// Log level: "error", "warn", "info", "debug", "trace"
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Enable local status server
    #[serde(default = "default_server_enabled")]
    pub enabled: bool,
    /// Server port (default 3000)
    #[serde(default = "default_server_port")]
    pub port: u16,
    /// Server host (default 127.0.0.1)
    #[serde(default = "default_server_host")]
    pub host: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            enabled: default_server_enabled(),
            port: default_server_port(),
            host: default_server_host(),
        }
    }
}

fn default_server_enabled() -> bool {
    false
}

fn default_server_port() -> u16 {
    3000
}

fn default_server_host() -> String {
    "127.0.0.1".to_string()
}

impl Settings {
    /// Load settings from a configuration file
    pub fn new(config_path: &str) -> Result<Self, ConfigError> {
        Self::build(File::with_name(config_path))
    }

    /// Load settings from an in-memory document
    pub fn from_str(contents: &str, format: FileFormat) -> Result<Self, ConfigError> {
        Self::build(File::from_str(contents, format))
    }

    fn build<S>(source: S) -> Result<Self, ConfigError>
    where
        S: config::Source + Send + Sync + 'static,
    {
        let s = Config::builder()
            .add_source(source)
            // Add environment variables (overrides file)
            // e.g. APP__GRID__GRID_COUNT=20
            .add_source(
                config::Environment::with_prefix("APP")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let settings: Self = s.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Check that the section for the selected mode is present and valid
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self.mode {
            TradingMode::Grid => {
                let grid = self
                    .grid
                    .as_ref()
                    .ok_or_else(|| ConfigError::Message("grid mode needs a [grid] section".into()))?;
                grid.validate()
                    .map_err(|e| ConfigError::Message(e.to_string()))?;
            }
            TradingMode::Volume => {
                let volume = self.volume.as_ref().ok_or_else(|| {
                    ConfigError::Message("volume mode needs a [volume] section".into())
                })?;
                volume
                    .validate()
                    .map_err(|e| ConfigError::Message(e.to_string()))?;
            }
        }
        if self.paper.start_price <= 0.0 || self.paper.initial_quote < 0.0 {
            return Err(ConfigError::Message(
                "paper start_price must be positive and balances non-negative".into(),
            ));
        }
        Ok(())
    }

    /// Symbol traded by the selected mode
    pub fn symbol(&self) -> Option<&str> {
        match self.mode {
            TradingMode::Grid => self.grid.as_ref().map(|g| g.symbol.as_str()),
            TradingMode::Volume => self.volume.as_ref().map(|v| v.symbol.as_str()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_grid_settings_from_toml() {
        let settings = Settings::from_str(
            r#"
            [grid]
            symbol = "BTCUSDT"
            profit_percent = 1.5
            grid_count = 12

            [server]
            enabled = true
            "#,
            FileFormat::Toml,
        )
        .unwrap();

        assert_eq!(settings.mode, TradingMode::Grid);
        let grid = settings.grid.as_ref().unwrap();
        assert_eq!(grid.grid_count, 12);
        assert_eq!(grid.capital_percent, 100.0);
        assert!(settings.server.enabled);
        assert_eq!(settings.server.port, 3000);
        assert_eq!(settings.log.level, "info");
        assert_eq!(settings.paper.start_price, 100.0);
        assert_eq!(settings.symbol(), Some("BTCUSDT"));
    }

    #[test]
    fn test_volume_settings_from_toml() {
        let settings = Settings::from_str(
            r#"
            mode = "volume"

            [volume]
            symbol = "ETHUSDT"
            maker_mode = false

            [paper]
            initial_quote = 500.0
            "#,
            FileFormat::Toml,
        )
        .unwrap();

        assert_eq!(settings.mode, TradingMode::Volume);
        let volume = settings.volume.as_ref().unwrap();
        assert!(!volume.maker_mode);
        assert_eq!(volume.max_loss, 50.0);
        assert_eq!(settings.paper.initial_quote, 500.0);
        assert!(settings.grid.is_none());
    }

    #[test]
    fn test_missing_mode_section_rejected() {
        let result = Settings::from_str(
            r#"
            mode = "volume"

            [grid]
            symbol = "BTCUSDT"
            profit_percent = 1.0
            grid_count = 10
            "#,
            FileFormat::Toml,
        );
        assert!(result.is_err());
    }
}
