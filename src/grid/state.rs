//! Engine snapshots for display and JSON persistence

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use log::debug;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use super::errors::GridResult;
use super::funds::FundSnapshot;
use super::level::LevelSnapshot;
use super::reconcile::OrderRecord;
use super::stats::{StatsSnapshot, UnrealizedPnl};
use super::strategy::GridParams;
use super::types::{EngineStatus, LevelState};

/// Point-in-time view of a grid engine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GridSnapshot {
    pub symbol: String,
    pub status: EngineStatus,
    pub last_price: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<GridParams>,
    pub levels: Vec<LevelSnapshot>,
    pub funds: FundSnapshot,
    pub stats: StatsSnapshot,
    pub unrealized: UnrealizedPnl,
    pub open_orders: Vec<OrderRecord>,
    pub stoploss_latched: bool,
    pub updated_at: DateTime<Utc>,
}

impl GridSnapshot {
    pub fn count_in_state(&self, state: LevelState) -> usize {
        self.levels.iter().filter(|l| l.state == state).count()
    }

    pub fn holding_count(&self) -> usize {
        self.levels.iter().filter(|l| l.state.is_holding()).count()
    }

    pub fn load_from_file(path: impl AsRef<Path>) -> GridResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Save snapshot to file atomically (write to temp, then rename)
    pub fn save_to_file_atomic(&self, path: impl AsRef<Path>) -> GridResult<()> {
        let path = path.as_ref();
        let temp_path = path.with_extension("tmp");

        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(&temp_path, content)?;
        std::fs::rename(&temp_path, path)?;

        Ok(())
    }
}

/// Latest snapshot shared with readers such as the status server
pub type SharedSnapshot = Arc<RwLock<Option<GridSnapshot>>>;

/// Publishes snapshots to readers and throttles writes to disk
pub struct SnapshotPublisher {
    shared: SharedSnapshot,
    save_path: Option<PathBuf>,
    save_interval: Duration,
    last_save: Option<Instant>,
}

impl SnapshotPublisher {
    pub fn new(shared: SharedSnapshot, save_path: Option<PathBuf>, save_interval: Duration) -> Self {
        Self {
            shared,
            save_path,
            save_interval,
            last_save: None,
        }
    }

    pub fn shared(&self) -> SharedSnapshot {
        self.shared.clone()
    }

    /// Replace the shared snapshot, saving it if the interval elapsed
    pub async fn publish(&mut self, snapshot: GridSnapshot) -> GridResult<()> {
        let due = self
            .last_save
            .map_or(true, |t| t.elapsed() >= self.save_interval);
        if due {
            self.save(&snapshot)?;
        }
        *self.shared.write().await = Some(snapshot);
        Ok(())
    }

    /// Publish and save regardless of the interval
    pub async fn force_publish(&mut self, snapshot: GridSnapshot) -> GridResult<()> {
        self.save(&snapshot)?;
        *self.shared.write().await = Some(snapshot);
        Ok(())
    }

    fn save(&mut self, snapshot: &GridSnapshot) -> GridResult<()> {
        if let Some(path) = &self.save_path {
            snapshot.save_to_file_atomic(path)?;
            debug!("Snapshot saved to {:?}", path);
        }
        self.last_save = Some(Instant::now());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::funds::FundManager;
    use crate::grid::stats::TradingStats;

    fn create_test_snapshot() -> GridSnapshot {
        GridSnapshot {
            symbol: "BTCUSDT".into(),
            status: EngineStatus::Running,
            last_price: 100.0,
            params: None,
            levels: vec![LevelSnapshot {
                index: 0,
                buy_price: 96.0,
                sell_price: 97.92,
                target_quantity: 0.26,
                capital_allocated: 25.0,
                state: LevelState::Bought,
                buy_order_id: None,
                sell_order_id: None,
                filled_quantity: 0.26,
                cost_basis: 24.96,
                sell_retry_count: 0,
                secs_since_buy_fill: Some(3),
            }],
            funds: FundManager::new(100.0, 0.05).snapshot(),
            stats: TradingStats::new(0.001).snapshot(),
            unrealized: UnrealizedPnl::default(),
            open_orders: Vec::new(),
            stoploss_latched: false,
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_snapshot_file_roundtrip() {
        let path = std::env::temp_dir().join(format!("grid_snap_{}.json", uuid::Uuid::new_v4()));
        let snapshot = create_test_snapshot();
        snapshot.save_to_file_atomic(&path).unwrap();

        let loaded = GridSnapshot::load_from_file(&path).unwrap();
        assert_eq!(loaded.symbol, "BTCUSDT");
        assert_eq!(loaded.holding_count(), 1);
        assert_eq!(loaded.count_in_state(LevelState::Idle), 0);
        assert!(!path.with_extension("tmp").exists());
        std::fs::remove_file(&path).ok();
    }

    #[tokio::test]
    async fn test_publisher_updates_shared_view() {
        let shared: SharedSnapshot = Arc::new(RwLock::new(None));
        let mut publisher = SnapshotPublisher::new(shared.clone(), None, Duration::from_secs(30));
        publisher.publish(create_test_snapshot()).await.unwrap();

        let guard = shared.read().await;
        assert_eq!(guard.as_ref().map(|s| s.levels.len()), Some(1));
    }
}
