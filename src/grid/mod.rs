//! Spot grid trading engine
//!
//! # Architecture
//!
//! The grid module is organized into several sub-modules:
//!
//! - [`config`] - Grid configuration, instrument rules and validation
//! - [`types`] - Core data types (OrderSide, LevelState, EngineStatus, etc.)
//! - [`errors`] - Error types and their retry classification
//! - [`funds`] - Capital ledger (available, locked, pending)
//! - [`level`] - Per-level order lifecycle state machine
//! - [`strategy`] - Grid range and level price calculation
//! - [`stoploss`] - Per-level and cumulative stop-loss rules
//! - [`executor`] - Exchange abstraction and retry policy (mockable for testing)
//! - [`reconcile`] - Order table and poll-based reconciliation
//! - [`stream`] - Push-channel supervision with reconnect
//! - [`stats`] - Trading statistics
//! - [`manager`] - The grid engine
//! - [`runner`] - Main execution loop
//! - [`state`] - Snapshots with JSON persistence
//!
//! # Example Usage
//!
//! ```rust,ignore
//! use spot_grid_engine::events::EventBus;
//! use spot_grid_engine::grid::{GridConfig, GridEngine, GridRunner, RunnerConfig, SnapshotPublisher};
//!
//! // 1% between levels, 10 levels, half the quote balance
//! let config = GridConfig::new("BTCUSDT", 1.0, 10)
//!     .with_capital_percent(50.0)
//!     .with_grid_stoploss(true, 5.0);
//!
//! let engine = GridEngine::new(config, gateway, EventBus::default())?;
//! let publisher = SnapshotPublisher::new(shared, None, Duration::from_secs(30));
//! let mut runner = GridRunner::new(engine, publisher, RunnerConfig::default())
//!     .with_channel(order_feed, StreamConfig::orders());
//!
//! runner.run(shutdown_rx).await?;
//! ```
//!
//! # Testing
//!
//! [`executor::mock::MockGateway`] scripts fills, failures and balances
//! without an exchange:
//!
//! ```rust,ignore
//! let gateway = Arc::new(MockGateway::new(100.0));
//! gateway.set_balance("USDT", 1000.0).await;
//! gateway.fill_order("1", None).await;
//! ```

pub mod backoff;
pub mod config;
pub mod errors;
pub mod executor;
pub mod funds;
pub mod level;
pub mod manager;
pub mod reconcile;
pub mod runner;
pub mod state;
pub mod stats;
pub mod stoploss;
pub mod stream;
pub mod strategy;
pub mod types;

// Re-export commonly used types
pub use config::{GridConfig, InstrumentMeta};
pub use errors::{ErrorKind, GridError, GridResult};
pub use executor::{OrderGateway, RetryPolicy};
pub use funds::{FundManager, FundSnapshot};
pub use level::{GridLevel, LevelSnapshot};
pub use manager::{CycleReport, GridEngine};
pub use reconcile::{OrderRecord, OrderTable, OrderUpdate};
pub use runner::{GridRunner, RunnerConfig};
pub use state::{GridSnapshot, SharedSnapshot, SnapshotPublisher};
pub use stats::{StatsSnapshot, TradingStats, UnrealizedPnl};
pub use stoploss::StopLossController;
pub use stream::{PushChannel, StreamConfig, StreamEvent, StreamMessage};
pub use strategy::{GridParams, GridStrategy};
pub use types::{
    CancelOutcome, EngineStatus, LevelState, OrderKind, OrderSide, OrderStatus, PlaceOrderRequest,
};
