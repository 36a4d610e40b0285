//! Grid runner - the scheduler loop
//!
//! One task owns the [`GridEngine`] and multiplexes the check cycle, the
//! rebalance monitor, the poll fallback, push-stream events and shutdown
//! with `tokio::select!`. A pass always runs to completion before the next
//! timer is serviced, so passes never overlap.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, interval_at, Instant, MissedTickBehavior};

use super::errors::{GridError, GridResult};
use super::executor::OrderGateway;
use super::manager::GridEngine;
use super::state::SnapshotPublisher;
use super::stream::{run_stream, PushChannel, StreamConfig, StreamEvent};
use super::types::EngineStatus;

/// Grid runner configuration
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    pub state_save_interval_secs: u64,
    pub max_consecutive_errors: u32,
    /// Cancel open orders when shutting down
    pub cancel_on_shutdown: bool,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            state_save_interval_secs: 30,
            max_consecutive_errors: 5,
            cancel_on_shutdown: true,
        }
    }
}

fn delayed_interval(delay: Duration, period: Duration) -> tokio::time::Interval {
    let period = period.max(Duration::from_millis(1));
    let mut timer = interval_at(Instant::now() + delay, period);
    timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
    timer
}

/// Drives one grid engine until shutdown, halt or too many errors
pub struct GridRunner<G: OrderGateway + ?Sized + 'static> {
    engine: GridEngine<G>,
    publisher: SnapshotPublisher,
    channels: Vec<(Arc<dyn PushChannel>, StreamConfig)>,
    runner_config: RunnerConfig,
    /// Latest tick from the price stream, consumed by the rebalance monitor
    pending_tick: Option<f64>,
}

impl<G: OrderGateway + ?Sized + 'static> GridRunner<G> {
    pub fn new(engine: GridEngine<G>, publisher: SnapshotPublisher, runner_config: RunnerConfig) -> Self {
        Self {
            engine,
            publisher,
            channels: Vec::new(),
            runner_config,
            pending_tick: None,
        }
    }

    /// Add a push channel supervised for the lifetime of [`run`](Self::run)
    pub fn with_channel(mut self, channel: Arc<dyn PushChannel>, config: StreamConfig) -> Self {
        self.channels.push((channel, config));
        self
    }

    pub fn engine(&self) -> &GridEngine<G> {
        &self.engine
    }

    pub fn engine_mut(&mut self) -> &mut GridEngine<G> {
        &mut self.engine
    }

    pub async fn run(&mut self, mut shutdown_rx: watch::Receiver<bool>) -> GridResult<()> {
        info!("Starting grid runner for {}", self.engine.config().symbol);
        if !self.engine.status().is_active() {
            self.engine.start().await?;
        }
        self.publisher.force_publish(self.engine.snapshot()).await?;

        let (event_tx, mut event_rx) = mpsc::channel(256);
        let (stream_stop_tx, stream_stop_rx) = watch::channel(false);
        let handles: Vec<JoinHandle<GridResult<()>>> = self
            .channels
            .iter()
            .map(|(channel, config)| {
                tokio::spawn(run_stream(
                    channel.clone(),
                    *config,
                    event_tx.clone(),
                    stream_stop_rx.clone(),
                ))
            })
            .collect();
        drop(event_tx);
        let mut streams_open = !handles.is_empty();

        let config = self.engine.config().clone();
        let mut check_timer = delayed_interval(config.first_check_delay(), config.check_interval());
        let mut monitor_timer =
            delayed_interval(config.price_monitor_interval(), config.price_monitor_interval());
        let mut poll_timer = delayed_interval(config.poll_interval(), config.poll_interval());
        let mut save_timer = interval(Duration::from_secs(
            self.runner_config.state_save_interval_secs.max(1),
        ));
        let mut consecutive_errors = 0u32;
        let mut result = Ok(());

        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    info!("Shutdown requested");
                    break;
                }
                _ = check_timer.tick() => {
                    match self.engine.run_check_cycle().await {
                        Ok(report) => {
                            consecutive_errors = 0;
                            if report.failures > 0 {
                                debug!("Pass finished with {} level failures", report.failures);
                            }
                        }
                        Err(e) => {
                            error!("Check cycle failed: {}", e);
                            consecutive_errors += 1;
                        }
                    }
                }
                _ = monitor_timer.tick() => {
                    match self.engine.check_rebalance(self.pending_tick.take()).await {
                        Ok(true) => {
                            consecutive_errors = 0;
                            check_timer = delayed_interval(config.first_check_delay(), config.check_interval());
                        }
                        Ok(false) => {}
                        Err(e) => {
                            error!("Rebalance check failed: {}", e);
                            consecutive_errors += 1;
                        }
                    }
                }
                _ = poll_timer.tick() => {
                    self.reconcile("periodic poll").await;
                }
                event = event_rx.recv(), if streams_open => {
                    match event {
                        Some(event) => self.handle_stream_event(event).await,
                        None => {
                            warn!("All push channels closed, relying on polling");
                            streams_open = false;
                        }
                    }
                }
                _ = save_timer.tick() => {
                    if let Err(e) = self.publisher.force_publish(self.engine.snapshot()).await {
                        warn!("Failed to save snapshot: {}", e);
                    }
                }
            }

            if let Err(e) = self.publisher.publish(self.engine.snapshot()).await {
                warn!("Failed to publish snapshot: {}", e);
            }

            match self.engine.status() {
                EngineStatus::Halted => {
                    error!("Engine halted, waiting for a manual restart");
                    break;
                }
                EngineStatus::Stopped => {
                    info!("Engine stopped");
                    break;
                }
                _ => {}
            }

            if consecutive_errors >= self.runner_config.max_consecutive_errors {
                error!("Too many consecutive errors, shutting down");
                result = Err(GridError::Exchange(format!(
                    "{} consecutive errors",
                    consecutive_errors
                )));
                break;
            }
        }

        let _ = stream_stop_tx.send(true);
        for handle in handles {
            match handle.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("Stream task ended with error: {}", e),
                Err(e) => warn!("Stream task panicked: {}", e),
            }
        }

        if self.engine.status().is_active() {
            self.engine.stop(self.runner_config.cancel_on_shutdown).await?;
        }
        self.publisher.force_publish(self.engine.snapshot()).await?;
        result
    }

    async fn handle_stream_event(&mut self, event: StreamEvent) {
        match event {
            StreamEvent::Order(update) => {
                self.engine.apply_update(&update);
            }
            StreamEvent::Price(price) => {
                self.engine.on_price_tick(price);
                self.pending_tick = Some(price);
            }
            StreamEvent::Connected { channel } => info!("Push channel {} connected", channel),
            StreamEvent::Disconnected { channel, reason } => {
                warn!("Push channel {} dropped: {}", channel, reason);
                // Updates may have been missed while the channel was down
                self.reconcile("stream gap").await;
            }
        }
    }

    async fn reconcile(&mut self, reason: &str) {
        match self.engine.poll_reconcile().await {
            Ok(0) => {}
            Ok(applied) => info!("{}: {} order updates applied", reason, applied),
            Err(e) => warn!("{} failed: {}", reason, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;
    use crate::grid::config::GridConfig;
    use crate::grid::executor::mock::MockGateway;
    use crate::grid::reconcile::OrderUpdate;
    use crate::grid::state::SharedSnapshot;
    use crate::grid::stream::StreamMessage;
    use crate::grid::types::{LevelState, OrderStatus};
    use async_trait::async_trait;
    use futures_util::stream::{self, BoxStream, StreamExt};
    use tokio::sync::RwLock;

    /// Emits its messages after a delay, then stays silent
    struct DelayedChannel {
        delay: Duration,
        messages: Vec<StreamMessage>,
    }

    #[async_trait]
    impl PushChannel for DelayedChannel {
        fn name(&self) -> &str {
            "orders"
        }

        async fn connect(&self) -> GridResult<BoxStream<'static, GridResult<StreamMessage>>> {
            let delay = self.delay;
            let messages = self.messages.clone();
            let delayed = stream::once(async move {
                tokio::time::sleep(delay).await;
                stream::iter(messages.into_iter().map(Ok::<_, GridError>))
            })
            .flatten();
            Ok(delayed.chain(stream::pending()).boxed())
        }
    }

    async fn create_test_runner() -> (GridRunner<MockGateway>, Arc<MockGateway>, SharedSnapshot) {
        let gateway = Arc::new(MockGateway::new(100.0));
        gateway.set_balance("USDT", 100.0).await;
        let config = GridConfig::new("BTCUSDT", 2.0, 4).without_pacing();
        let engine = GridEngine::new(config, gateway.clone(), EventBus::default()).unwrap();
        let shared: SharedSnapshot = Arc::new(RwLock::new(None));
        let publisher = SnapshotPublisher::new(shared.clone(), None, Duration::from_secs(30));
        (
            GridRunner::new(engine, publisher, RunnerConfig::default()),
            gateway,
            shared,
        )
    }

    #[tokio::test]
    async fn test_runner_places_orders_and_cleans_up_on_shutdown() {
        let (mut runner, gateway, shared) = create_test_runner().await;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let task = tokio::spawn(async move {
            let result = runner.run(shutdown_rx).await;
            (runner, result)
        });
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(gateway.placed_count().await, 2);

        shutdown_tx.send(true).unwrap();
        let (runner, result) = task.await.unwrap();
        result.unwrap();

        assert_eq!(runner.engine().status(), EngineStatus::Stopped);
        assert!(gateway.open_order_ids().await.is_empty());
        let snapshot = shared.read().await.clone().unwrap();
        assert_eq!(snapshot.status, EngineStatus::Stopped);
        assert_eq!(snapshot.levels.len(), 3);
    }

    #[tokio::test]
    async fn test_runner_applies_stream_fills() {
        let (runner, gateway, _) = create_test_runner().await;
        // Order "1" is the first buy placed by the initial pass
        let channel = DelayedChannel {
            delay: Duration::from_millis(100),
            messages: vec![
                StreamMessage::Price(100.5),
                StreamMessage::Order(OrderUpdate {
                    order_id: "1".into(),
                    status: OrderStatus::Filled,
                    filled_qty: 0.26,
                }),
            ],
        };
        let mut runner = runner.with_channel(Arc::new(channel), StreamConfig::orders());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let task = tokio::spawn(async move {
            let result = runner.run(shutdown_rx).await;
            (runner, result)
        });
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(gateway.placed_count().await, 2);

        shutdown_tx.send(true).unwrap();
        let (runner, result) = task.await.unwrap();
        result.unwrap();

        let stats = runner.engine().stats().snapshot();
        assert_eq!(stats.buy_count, 1);
        assert_eq!(runner.engine().last_price(), 100.5);
        assert!(runner
            .engine()
            .levels()
            .iter()
            .all(|l| l.state() == LevelState::Idle));
    }
}
