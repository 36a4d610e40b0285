use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use log::{error, info, warn};
use tokio::sync::{watch, RwLock};

use crate::config::{ConfigError, Settings};
use crate::events::EventBus;
use crate::grid::config::GridConfig;
use crate::grid::manager::GridEngine;
use crate::grid::runner::{GridRunner, RunnerConfig};
use crate::grid::state::{SharedSnapshot, SnapshotPublisher};
use crate::grid::stream::StreamConfig;
use crate::grid::types::EngineStatus;
use crate::market::{FeedKind, PaperExchange, PaperFeed};
use crate::server::{start_server, ServerState};
use crate::session::{TradingMode, TradingSession};
use crate::volume::{SharedVolumeStats, VolumeConfig, VolumeCycler};

/// Wires settings, the paper exchange, the selected engine and the
/// status server into one process
pub struct BotRunner {
    settings: Settings,
    session: TradingSession,
}

impl BotRunner {
    /// Create a new runner from a configuration file
    pub fn new(config_path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = config_path.as_ref().to_string_lossy().into_owned();
        Ok(Self::from_settings(Settings::new(&path)?))
    }

    pub fn from_settings(settings: Settings) -> Self {
        Self {
            settings,
            session: TradingSession::new(),
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Run the selected mode until ctrl-c, a halt or a fatal error
    pub async fn run(self) -> Result<(), Box<dyn std::error::Error>> {
        // 1. Setup Logging
        env_logger::Builder::from_env(
            env_logger::Env::default().default_filter_or(self.settings.log.level.as_str()),
        )
        .try_init()
        .ok();

        info!("Starting BotRunner in {} mode...", self.settings.mode);

        let symbol = self
            .settings
            .symbol()
            .ok_or_else(|| format!("no configuration for {} mode", self.settings.mode))?
            .to_string();

        // 2. Paper exchange and its price walk
        let paper = &self.settings.paper;
        let exchange = Arc::new(PaperExchange::new(&symbol, paper));
        info!(
            "[PAPER] {} starting at {} with {} {}",
            symbol,
            paper.start_price,
            paper.initial_quote,
            exchange.instrument().quote_asset
        );

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let walk = tokio::spawn(exchange.clone().run_price_walk(
            paper.volatility_percent,
            Duration::from_millis(paper.tick_ms),
            shutdown_rx.clone(),
        ));

        let ctrl_c_tx = shutdown_tx.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Ctrl-C received, shutting down");
                let _ = ctrl_c_tx.send(true);
            }
        });

        // 3. Status server
        let grid_shared: SharedSnapshot = Arc::new(RwLock::new(None));
        let volume_shared: SharedVolumeStats = Arc::new(RwLock::new(None));
        let server = if self.settings.server.enabled {
            let state = ServerState {
                session: self.session.clone(),
                grid: grid_shared.clone(),
                volume: volume_shared.clone(),
            };
            let host = self.settings.server.host.clone();
            let port = self.settings.server.port;
            let server_rx = shutdown_rx.clone();
            Some(tokio::spawn(async move {
                if let Err(e) = start_server(state, &host, port, server_rx).await {
                    error!("Status server failed: {}", e);
                }
            }))
        } else {
            None
        };

        // 4. Selected engine
        let result = match self.settings.mode {
            TradingMode::Grid => match self.settings.grid.clone() {
                Some(config) => {
                    self.run_grid(config, exchange, grid_shared, shutdown_rx)
                        .await
                }
                None => Err("grid mode needs a [grid] section".into()),
            },
            TradingMode::Volume => match self.settings.volume.clone() {
                Some(config) => {
                    self.run_volume(config, exchange, volume_shared, shutdown_rx)
                        .await
                }
                None => Err("volume mode needs a [volume] section".into()),
            },
        };

        let _ = shutdown_tx.send(true);
        if let Err(e) = walk.await {
            warn!("Price walk task failed: {}", e);
        }
        if let Some(server) = server {
            if let Err(e) = server.await {
                warn!("Status server task failed: {}", e);
            }
        }
        info!("BotRunner finished");
        result
    }

    async fn run_grid(
        &self,
        config: GridConfig,
        exchange: Arc<PaperExchange>,
        shared: SharedSnapshot,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Result<(), Box<dyn std::error::Error>> {
        let _guard = self.session.acquire(TradingMode::Grid)?;

        let publisher =
            SnapshotPublisher::new(shared, config.snapshot_file.clone(), Duration::from_secs(30));
        let engine = GridEngine::new(config, exchange.clone(), EventBus::default())?;
        let mut runner = GridRunner::new(engine, publisher, RunnerConfig::default())
            .with_channel(
                Arc::new(PaperFeed::new(exchange.clone(), FeedKind::Prices)),
                StreamConfig::price(),
            )
            .with_channel(
                Arc::new(PaperFeed::new(exchange, FeedKind::Orders)),
                StreamConfig::orders(),
            );

        runner.run(shutdown_rx).await?;
        if runner.engine().status() == EngineStatus::Halted {
            warn!("Grid halted by the total stop-loss; open positions remain");
        }
        Ok(())
    }

    async fn run_volume(
        &self,
        config: VolumeConfig,
        exchange: Arc<PaperExchange>,
        shared: SharedVolumeStats,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Result<(), Box<dyn std::error::Error>> {
        let _guard = self.session.acquire(TradingMode::Volume)?;

        let mut cycler =
            VolumeCycler::new(config, exchange, EventBus::default())?.with_shared_stats(shared);
        let stats = cycler.run(shutdown_rx).await?;
        if let Some(reason) = stats.halt_reason {
            warn!("Volume cycling halted: {:?}", reason);
        }
        Ok(())
    }
}
