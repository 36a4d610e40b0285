//! Local status server
//!
//! Read-only JSON views over the latest published grid snapshot and volume
//! statistics.

use std::net::SocketAddr;

use axum::{extract::State, http::StatusCode, response::Json, routing::get, Router};
use log::info;
use serde_json::{json, Value};
use tokio::sync::watch;

use crate::grid::errors::{GridError, GridResult};
use crate::grid::level::LevelSnapshot;
use crate::grid::state::SharedSnapshot;
use crate::session::TradingSession;
use crate::volume::SharedVolumeStats;

/// Handles shared with the trading workers
#[derive(Clone)]
pub struct ServerState {
    pub session: TradingSession,
    pub grid: SharedSnapshot,
    pub volume: SharedVolumeStats,
}

pub fn router(state: ServerState) -> Router {
    Router::new()
        .route("/api/status", get(status_handler))
        .route("/api/levels", get(levels_handler))
        .route("/api/stats", get(stats_handler))
        .with_state(state)
}

/// Serve until shutdown is signalled
pub async fn start_server(
    state: ServerState,
    host: &str,
    port: u16,
    mut shutdown_rx: watch::Receiver<bool>,
) -> GridResult<()> {
    let addr: SocketAddr = format!("{}:{}", host, port)
        .parse()
        .map_err(|e| GridError::InvalidConfig(format!("server address: {}", e)))?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| GridError::Exchange(format!("bind {}: {}", addr, e)))?;

    info!("Status server running on http://{}", addr);

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            let _ = shutdown_rx.changed().await;
        })
        .await
        .map_err(|e| GridError::Exchange(format!("server: {}", e)))
}

async fn status_handler(State(state): State<ServerState>) -> Json<Value> {
    let grid = state.grid.read().await;
    let volume = state.volume.read().await;
    Json(json!({
        "mode": state.session.active(),
        "grid": grid.as_ref().map(|s| json!({
            "symbol": s.symbol,
            "status": s.status,
            "last_price": s.last_price,
            "holding": s.holding_count(),
            "open_orders": s.open_orders.len(),
            "stoploss_latched": s.stoploss_latched,
            "updated_at": s.updated_at,
        })),
        "volume": *volume,
    }))
}

async fn levels_handler(
    State(state): State<ServerState>,
) -> Result<Json<Vec<LevelSnapshot>>, StatusCode> {
    let grid = state.grid.read().await;
    let snapshot = grid.as_ref().ok_or(StatusCode::NOT_FOUND)?;
    Ok(Json(snapshot.levels.clone()))
}

async fn stats_handler(State(state): State<ServerState>) -> Result<Json<Value>, StatusCode> {
    let grid = state.grid.read().await;
    let volume = state.volume.read().await;
    if grid.is_none() && volume.is_none() {
        return Err(StatusCode::NOT_FOUND);
    }
    Ok(Json(json!({
        "grid": grid.as_ref().map(|s| json!({
            "stats": s.stats,
            "funds": s.funds,
            "unrealized": s.unrealized,
        })),
        "volume": *volume,
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;
    use crate::grid::config::GridConfig;
    use crate::grid::executor::mock::MockGateway;
    use crate::grid::manager::GridEngine;
    use crate::session::TradingMode;
    use crate::volume::VolumeStats;
    use std::sync::Arc;
    use tokio::sync::RwLock;

    fn create_test_state() -> ServerState {
        ServerState {
            session: TradingSession::new(),
            grid: Arc::new(RwLock::new(None)),
            volume: Arc::new(RwLock::new(None)),
        }
    }

    #[tokio::test]
    async fn test_empty_state() {
        let state = create_test_state();
        assert_eq!(
            levels_handler(State(state.clone())).await.unwrap_err(),
            StatusCode::NOT_FOUND
        );
        assert!(stats_handler(State(state.clone())).await.is_err());

        let Json(status) = status_handler(State(state)).await;
        assert!(status["mode"].is_null());
        assert!(status["grid"].is_null());
    }

    #[tokio::test]
    async fn test_grid_snapshot_is_served() {
        let state = create_test_state();
        let _guard = state.session.acquire(TradingMode::Grid).unwrap();

        let gateway = Arc::new(MockGateway::new(100.0));
        gateway.set_balance("USDT", 100.0).await;
        let config = GridConfig::new("BTCUSDT", 2.0, 4).without_pacing();
        let mut engine = GridEngine::new(config, gateway, EventBus::default()).unwrap();
        engine.start().await.unwrap();
        *state.grid.write().await = Some(engine.snapshot());

        let Json(levels) = levels_handler(State(state.clone())).await.unwrap();
        assert_eq!(levels.len(), 3);

        let Json(status) = status_handler(State(state.clone())).await;
        assert_eq!(status["mode"], "grid");
        assert_eq!(status["grid"]["symbol"], "BTCUSDT");

        let Json(stats) = stats_handler(State(state)).await.unwrap();
        assert!(stats["grid"]["stats"].is_object());
        assert!(stats["volume"].is_null());
    }

    #[tokio::test]
    async fn test_volume_stats_are_served() {
        let state = create_test_state();
        *state.volume.write().await = Some(VolumeStats {
            cycles: 3,
            ..VolumeStats::default()
        });
        let Json(stats) = stats_handler(State(state)).await.unwrap();
        assert_eq!(stats["volume"]["cycles"], 3);
    }
}
