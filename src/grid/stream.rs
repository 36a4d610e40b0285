//! Push-stream supervision
//!
//! A [`PushChannel`] yields a stream of order updates and price ticks for
//! one connection. [`run_stream`] owns the connection lifecycle: it
//! subscribes, forwards messages to the scheduler, treats a silent stream
//! as dropped after the heartbeat timeout, and reconnects with capped
//! exponential backoff until shutdown.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use log::{debug, info, warn};
use tokio::sync::{mpsc, watch};

use super::backoff::ExponentialBackoff;
use super::errors::GridResult;
use super::reconcile::OrderUpdate;

/// Message delivered by a connected channel
#[derive(Debug, Clone, PartialEq)]
pub enum StreamMessage {
    Order(OrderUpdate),
    Price(f64),
    /// Keep-alive reply; proves the connection is alive
    Heartbeat,
}

/// Event forwarded to the scheduler
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Connected { channel: String },
    Disconnected { channel: String, reason: String },
    Order(OrderUpdate),
    Price(f64),
}

/// A subscribable push channel (order status or price ticks)
#[async_trait]
pub trait PushChannel: Send + Sync {
    fn name(&self) -> &str;

    /// Open a connection and subscribe; the stream ends when it drops
    async fn connect(&self) -> GridResult<BoxStream<'static, GridResult<StreamMessage>>>;
}

/// Reconnect and liveness parameters
#[derive(Debug, Clone, Copy)]
pub struct StreamConfig {
    pub reconnect_base: Duration,
    pub reconnect_max: Duration,
    /// Fraction of each reconnect delay that is randomized
    pub reconnect_jitter: f64,
    /// A connection with no message for this long is considered dead
    pub heartbeat_timeout: Duration,
}

impl StreamConfig {
    /// Price ticks: reconnect from 1s
    pub fn price() -> Self {
        Self {
            reconnect_base: Duration::from_millis(1000),
            reconnect_max: Duration::from_secs(30),
            reconnect_jitter: 0.1,
            heartbeat_timeout: Duration::from_secs(45),
        }
    }

    /// Order updates: reconnect from 5s
    pub fn orders() -> Self {
        Self {
            reconnect_base: Duration::from_millis(5000),
            reconnect_max: Duration::from_secs(30),
            reconnect_jitter: 0.1,
            heartbeat_timeout: Duration::from_secs(45),
        }
    }

    /// Backoff for this channel's reconnects
    pub fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff::new(self.reconnect_base, self.reconnect_max, self.reconnect_jitter)
    }
}

enum SessionEnd {
    Shutdown,
    ReceiverGone,
    Dropped(String),
}

/// Keep a channel connected until shutdown, forwarding events to `tx`
pub async fn run_stream<C: PushChannel + ?Sized>(
    channel: Arc<C>,
    config: StreamConfig,
    tx: mpsc::Sender<StreamEvent>,
    mut shutdown_rx: watch::Receiver<bool>,
) -> GridResult<()> {
    let name = channel.name().to_string();
    let mut backoff = config.backoff();

    loop {
        if *shutdown_rx.borrow() {
            info!("Shutdown requested, closing {} stream", name);
            return Ok(());
        }

        let reason = match channel.connect().await {
            Ok(stream) => {
                backoff.reset();
                info!("{} stream connected", name);
                if tx
                    .send(StreamEvent::Connected {
                        channel: name.clone(),
                    })
                    .await
                    .is_err()
                {
                    return Ok(());
                }
                match run_session(stream, &config, &tx, &mut shutdown_rx).await {
                    SessionEnd::Shutdown => return Ok(()),
                    SessionEnd::ReceiverGone => return Ok(()),
                    SessionEnd::Dropped(reason) => reason,
                }
            }
            Err(e) => e.to_string(),
        };

        let delay = backoff.next_delay();
        warn!(
            "{} stream down ({}), reconnect #{} in {}ms",
            name,
            reason,
            backoff.attempt(),
            delay.as_millis()
        );
        if tx
            .send(StreamEvent::Disconnected {
                channel: name.clone(),
                reason,
            })
            .await
            .is_err()
        {
            return Ok(());
        }

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    return Ok(());
                }
            }
        }
    }
}

async fn run_session(
    mut stream: BoxStream<'static, GridResult<StreamMessage>>,
    config: &StreamConfig,
    tx: &mpsc::Sender<StreamEvent>,
    shutdown_rx: &mut watch::Receiver<bool>,
) -> SessionEnd {
    loop {
        tokio::select! {
            biased;

            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    return SessionEnd::Shutdown;
                }
            }

            next = tokio::time::timeout(config.heartbeat_timeout, stream.next()) => {
                let event = match next {
                    Err(_) => return SessionEnd::Dropped("heartbeat timeout".into()),
                    Ok(None) => return SessionEnd::Dropped("stream closed".into()),
                    Ok(Some(Err(e))) => return SessionEnd::Dropped(e.to_string()),
                    Ok(Some(Ok(StreamMessage::Heartbeat))) => {
                        debug!("heartbeat");
                        continue;
                    }
                    Ok(Some(Ok(StreamMessage::Order(update)))) => StreamEvent::Order(update),
                    Ok(Some(Ok(StreamMessage::Price(price)))) => StreamEvent::Price(price),
                };
                if tx.send(event).await.is_err() {
                    return SessionEnd::ReceiverGone;
                }
            }
        }
    }
}
