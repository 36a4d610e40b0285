//! Severity-tagged engine events for collaborators (UI, dashboard, tests)
//!
//! Every event is also written to the log at the matching level, so a
//! process without subscribers loses nothing.

use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Severity {
    Debug,
    Info,
    Success,
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineEvent {
    pub severity: Severity,
    pub message: String,
    pub at: DateTime<Utc>,
}

/// Broadcast fan-out of [`EngineEvent`]s
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<EngineEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, severity: Severity, message: impl Into<String>) {
        let message = message.into();
        match severity {
            Severity::Debug => debug!("{}", message),
            Severity::Info | Severity::Success => info!("{}", message),
            Severity::Warning => warn!("{}", message),
            Severity::Error => error!("{}", message),
        }
        // No receivers is fine
        let _ = self.tx.send(EngineEvent {
            severity,
            message,
            at: Utc::now(),
        });
    }

    pub fn info(&self, message: impl Into<String>) {
        self.emit(Severity::Info, message);
    }

    pub fn success(&self, message: impl Into<String>) {
        self.emit(Severity::Success, message);
    }

    pub fn warning(&self, message: impl Into<String>) {
        self.emit(Severity::Warning, message);
    }

    pub fn error(&self, message: impl Into<String>) {
        self.emit(Severity::Error, message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscribers_receive_events() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();
        bus.success("Buy filled at level 2");
        bus.warning("Stop-loss at level 1");

        let first = rx.recv().await.unwrap();
        assert_eq!(first.severity, Severity::Success);
        assert_eq!(first.message, "Buy filled at level 2");
        assert_eq!(rx.recv().await.unwrap().severity, Severity::Warning);
    }

    #[test]
    fn test_emit_without_subscribers() {
        EventBus::default().error("nobody listening");
    }
}
