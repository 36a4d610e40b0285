//! Core data types for grid trading

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Order side
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    /// Convert to exchange side string
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderSide::Buy => "Buy",
            OrderSide::Sell => "Sell",
        }
    }
}

/// Engine execution status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EngineStatus {
    /// Created, levels not yet computed
    Idle,
    /// Normal grid operation
    Running,
    /// Tearing down and rebuilding levels around a new center
    Rebalancing,
    /// Shutting down
    Stopping,
    /// Fully stopped, can be started again
    Stopped,
    /// Aggregate stop-loss fired; requires a manual restart
    Halted,
}

impl EngineStatus {
    /// Check if the engine is in an active trading state
    pub fn is_active(&self) -> bool {
        matches!(self, EngineStatus::Running | EngineStatus::Rebalancing)
    }
}

/// State of a single grid level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LevelState {
    /// No order, no position
    Idle,
    /// Buy request in flight
    PlacingBuy,
    /// Buy order resting on the book
    BuyActive,
    /// Buy filled, holding the position
    Bought,
    /// Sell request in flight
    PlacingSell,
    /// Sell order resting on the book
    SellActive,
    /// Position whose sell keeps failing; kept with its cost basis
    Stuck,
}

impl LevelState {
    /// States in which the level owns base asset
    pub fn is_holding(&self) -> bool {
        matches!(
            self,
            LevelState::Bought | LevelState::PlacingSell | LevelState::SellActive | LevelState::Stuck
        )
    }

    /// States that need a sell placed
    pub fn needs_sell(&self) -> bool {
        matches!(self, LevelState::Bought | LevelState::Stuck)
    }
}

/// Exchange-side order status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus {
    New,
    PartiallyFilled,
    Filled,
    Cancelled,
    Rejected,
}

impl OrderStatus {
    /// Terminal statuses remove the order from tracking
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Filled | OrderStatus::Cancelled | OrderStatus::Rejected
        )
    }
}

/// Why an order was placed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderKind {
    /// Regular grid buy or sell
    Grid,
    /// Forced sell from the per-level stop-loss
    StopLoss,
    /// Liquidation sell not tied to any level
    Emergency,
}

impl OrderKind {
    fn prefix(&self) -> &'static str {
        match self {
            OrderKind::Grid => "GRID",
            OrderKind::StopLoss => "STOPLOSS",
            OrderKind::Emergency => "EMERGENCY",
        }
    }
}

/// Which level an order belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LevelRef {
    Grid(usize),
    Unassigned,
}

/// Build a client order id, unique per placement
pub fn client_order_id(kind: OrderKind, side: OrderSide, level: LevelRef) -> String {
    let tag = match level {
        LevelRef::Grid(index) => index.to_string(),
        LevelRef::Unassigned => "X".to_string(),
    };
    let id = Uuid::new_v4().simple().to_string();
    format!("{}-{}{}-{}", kind.prefix(), &side.as_str()[..1], tag, &id[..16])
}

/// Order request sent to the gateway
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlaceOrderRequest {
    pub symbol: String,
    pub side: OrderSide,
    pub price: f64,
    pub quantity: f64,
    pub client_order_id: String,
}

/// Acknowledgement of an accepted order
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderAck {
    pub order_id: String,
}

/// Result of a cancel request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CancelOutcome {
    Cancelled,
    /// Order was already filled or cancelled on the exchange
    AlreadyTerminal,
}

/// Order state as reported by the exchange
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteOrder {
    pub order_id: String,
    pub status: OrderStatus,
    pub filled_qty: f64,
    pub price: f64,
    pub side: OrderSide,
}

/// Asset balance
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Balance {
    pub total: f64,
    pub available: f64,
    pub locked: f64,
}

/// Maker/taker fee rates as fractions
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FeeRates {
    pub maker: f64,
    pub taker: f64,
}

impl Default for FeeRates {
    fn default() -> Self {
        Self {
            maker: 0.001,
            taker: 0.001,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_statuses() {
        assert!(OrderStatus::Filled.is_terminal());
        assert!(OrderStatus::Cancelled.is_terminal());
        assert!(!OrderStatus::New.is_terminal());
        assert!(OrderStatus::Rejected.is_terminal());
        assert!(!OrderStatus::PartiallyFilled.is_terminal());
    }

    #[test]
    fn test_holding_states() {
        assert!(LevelState::Stuck.is_holding());
        assert!(LevelState::SellActive.is_holding());
        assert!(!LevelState::BuyActive.is_holding());
        assert!(LevelState::Bought.needs_sell());
        assert!(!LevelState::SellActive.needs_sell());
    }

    #[test]
    fn test_client_order_id_is_unique_and_tagged() {
        let a = client_order_id(OrderKind::StopLoss, OrderSide::Sell, LevelRef::Grid(3));
        let b = client_order_id(OrderKind::StopLoss, OrderSide::Sell, LevelRef::Grid(3));
        assert!(a.starts_with("STOPLOSS-S3-"));
        assert_ne!(a, b);
        assert!(a.len() <= 36);
    }
}
