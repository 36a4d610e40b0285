//! Order tracking and poll-based reconciliation
//!
//! The [`OrderTable`] mirrors every order the engine placed. Updates arrive
//! from the push stream and from periodic polls; a terminal update removes
//! the record, so a duplicate of the same update finds nothing to act on.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use super::errors::GridResult;
use super::executor::{OrderGateway, RetryPolicy};
use super::types::{LevelRef, OrderKind, OrderSide, OrderStatus, RemoteOrder};

/// Engine-local mirror of an exchange order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRecord {
    pub order_id: String,
    pub client_order_id: String,
    pub level: LevelRef,
    pub side: OrderSide,
    pub kind: OrderKind,
    pub price: f64,
    pub quantity: f64,
    /// Cost basis of the position being sold, 0 for buys
    pub cost_basis: f64,
    pub status: OrderStatus,
    pub filled_qty: f64,
    pub placed_at: DateTime<Utc>,
}

/// Status change reported by the stream or a poll
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderUpdate {
    pub order_id: String,
    pub status: OrderStatus,
    /// Cumulative executed quantity
    pub filled_qty: f64,
}

impl From<RemoteOrder> for OrderUpdate {
    fn from(order: RemoteOrder) -> Self {
        Self {
            order_id: order.order_id,
            status: order.status,
            filled_qty: order.filled_qty,
        }
    }
}

/// What applying an update to the table produced
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// Not tracked (never placed by us, or already resolved)
    Untracked,
    /// Still open; status/fill progress recorded
    Progress,
    /// Reached a terminal status and was removed from tracking
    Terminal {
        record: OrderRecord,
        status: OrderStatus,
        filled_qty: f64,
    },
}

/// Tracked orders keyed by exchange order id
#[derive(Debug, Default)]
pub struct OrderTable {
    orders: HashMap<String, OrderRecord>,
}

impl OrderTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, record: OrderRecord) {
        debug!(
            "Tracking {:?} {:?} order {} @ {} x {}",
            record.kind, record.side, record.order_id, record.price, record.quantity
        );
        self.orders.insert(record.order_id.clone(), record);
    }

    pub fn get(&self, order_id: &str) -> Option<&OrderRecord> {
        self.orders.get(order_id)
    }

    pub fn remove(&mut self, order_id: &str) -> Option<OrderRecord> {
        self.orders.remove(order_id)
    }

    pub fn contains(&self, order_id: &str) -> bool {
        self.orders.contains_key(order_id)
    }

    pub fn len(&self) -> usize {
        self.orders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.orders.is_empty()
    }

    pub fn clear(&mut self) {
        self.orders.clear();
    }

    /// Ids sorted for deterministic iteration
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.orders.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn iter(&self) -> impl Iterator<Item = &OrderRecord> {
        self.orders.values()
    }

    /// Fold an update into the table
    pub fn resolve(&mut self, update: &OrderUpdate) -> Resolution {
        let Some(record) = self.orders.get_mut(&update.order_id) else {
            return Resolution::Untracked;
        };

        if !update.status.is_terminal() {
            if update.filled_qty > record.filled_qty {
                debug!(
                    "Order {} partially filled: {} / {}",
                    update.order_id, update.filled_qty, record.quantity
                );
                record.filled_qty = update.filled_qty;
            }
            record.status = update.status;
            return Resolution::Progress;
        }

        let filled_qty = if update.filled_qty > 0.0 {
            update.filled_qty
        } else {
            record.filled_qty
        };
        match self.orders.remove(&update.order_id) {
            Some(record) => Resolution::Terminal {
                record,
                status: update.status,
                filled_qty,
            },
            None => Resolution::Untracked,
        }
    }
}

/// Result of one poll pass
#[derive(Debug, Default)]
pub struct PollOutcome {
    /// Updates to apply, in deterministic order
    pub updates: Vec<OrderUpdate>,
    /// Tracked orders missing from the listing that had to be looked up
    pub gaps_checked: usize,
    /// Gaps the exchange had no record of; resolved as cancelled
    pub not_found: usize,
}

/// Compare tracked orders with the exchange listing
///
/// Orders listed remotely produce an update when their status or fill
/// differs from the local record. Orders tracked locally but absent from
/// the listing are queried one by one; unknown ones resolve as cancelled.
/// Lookups that fail leave the order tracked for the next poll.
pub async fn collect_poll_updates<G: OrderGateway + ?Sized>(
    gateway: &G,
    retry: &RetryPolicy,
    symbol: &str,
    table: &OrderTable,
) -> GridResult<PollOutcome> {
    let mut outcome = PollOutcome::default();
    if table.is_empty() {
        return Ok(outcome);
    }

    let remote = retry
        .run("query_open_and_recent", || gateway.query_open_and_recent(symbol))
        .await?;

    let mut seen = HashSet::new();
    let mut listed: Vec<RemoteOrder> = remote
        .into_iter()
        .filter(|o| table.contains(&o.order_id))
        .collect();
    listed.sort_by(|a, b| a.order_id.cmp(&b.order_id));

    for order in listed {
        seen.insert(order.order_id.clone());
        let Some(record) = table.get(&order.order_id) else {
            continue;
        };
        if order.status != record.status || order.filled_qty > record.filled_qty {
            outcome.updates.push(order.into());
        }
    }

    for order_id in table.ids() {
        if seen.contains(&order_id) {
            continue;
        }
        outcome.gaps_checked += 1;
        match gateway.query_order(symbol, &order_id).await {
            Ok(Some(order)) => {
                info!("Order {} missing from listing, exchange reports {:?}", order_id, order.status);
                outcome.updates.push(order.into());
            }
            Ok(None) => {
                warn!("Order {} unknown to exchange, treating as cancelled", order_id);
                outcome.not_found += 1;
                outcome.updates.push(OrderUpdate {
                    order_id,
                    status: OrderStatus::Cancelled,
                    filled_qty: 0.0,
                });
            }
            Err(e) => {
                warn!("Lookup of order {} failed, will retry next poll: {}", order_id, e);
            }
        }
    }

    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::executor::mock::MockGateway;
    use crate::grid::types::{OrderAck, PlaceOrderRequest};
    use std::time::Duration;

    fn record(order_id: &str, side: OrderSide) -> OrderRecord {
        OrderRecord {
            order_id: order_id.to_string(),
            client_order_id: format!("c-{}", order_id),
            level: LevelRef::Grid(0),
            side,
            kind: OrderKind::Grid,
            price: 100.0,
            quantity: 1.0,
            cost_basis: 0.0,
            status: OrderStatus::New,
            filled_qty: 0.0,
            placed_at: Utc::now(),
        }
    }

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 1,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    async fn place(gateway: &MockGateway, side: OrderSide) -> OrderAck {
        gateway
            .place_order(&PlaceOrderRequest {
                symbol: "BTCUSDT".into(),
                side,
                price: 100.0,
                quantity: 1.0,
                client_order_id: "c".into(),
            })
            .await
            .unwrap()
    }

    #[test]
    fn test_terminal_update_applies_once() {
        let mut table = OrderTable::new();
        table.insert(record("7", OrderSide::Buy));
        let update = OrderUpdate {
            order_id: "7".into(),
            status: OrderStatus::Filled,
            filled_qty: 1.0,
        };

        assert!(matches!(table.resolve(&update), Resolution::Terminal { filled_qty, .. } if filled_qty == 1.0));
        assert_eq!(table.resolve(&update), Resolution::Untracked);
        assert!(table.is_empty());
    }

    #[test]
    fn test_partial_fill_keeps_tracking() {
        let mut table = OrderTable::new();
        table.insert(record("8", OrderSide::Buy));
        let partial = OrderUpdate {
            order_id: "8".into(),
            status: OrderStatus::PartiallyFilled,
            filled_qty: 0.4,
        };
        assert_eq!(table.resolve(&partial), Resolution::Progress);
        assert_eq!(table.get("8").unwrap().filled_qty, 0.4);

        // A cancel after a partial fill carries the executed quantity
        let cancel = OrderUpdate {
            order_id: "8".into(),
            status: OrderStatus::Cancelled,
            filled_qty: 0.0,
        };
        match table.resolve(&cancel) {
            Resolution::Terminal { filled_qty, status, .. } => {
                assert_eq!(status, OrderStatus::Cancelled);
                assert_eq!(filled_qty, 0.4);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_poll_reports_changes_and_gaps() {
        let gateway = MockGateway::new(100.0);
        let a = place(&gateway, OrderSide::Buy).await;
        let b = place(&gateway, OrderSide::Buy).await;
        let c = place(&gateway, OrderSide::Sell).await;
        let d = place(&gateway, OrderSide::Sell).await;

        let mut table = OrderTable::new();
        for ack in [&a, &b, &c, &d] {
            table.insert(record(&ack.order_id, OrderSide::Buy));
        }

        gateway.fill_order(&a.order_id, None).await;
        // b stays open and unchanged
        gateway.cancel_remote(&c.order_id).await;
        gateway.hide(&c.order_id).await;
        gateway.forget(&d.order_id).await;

        let outcome = collect_poll_updates(&gateway, &fast_retry(), "BTCUSDT", &table)
            .await
            .unwrap();

        assert_eq!(outcome.gaps_checked, 2);
        assert_eq!(outcome.not_found, 1);
        let statuses: Vec<(String, OrderStatus)> = outcome
            .updates
            .iter()
            .map(|u| (u.order_id.clone(), u.status))
            .collect();
        assert!(statuses.contains(&(a.order_id.clone(), OrderStatus::Filled)));
        assert!(statuses.contains(&(c.order_id.clone(), OrderStatus::Cancelled)));
        assert!(statuses.contains(&(d.order_id.clone(), OrderStatus::Cancelled)));
        assert!(!statuses.iter().any(|(id, _)| *id == b.order_id));
    }

    #[tokio::test]
    async fn test_poll_with_empty_table_skips_gateway() {
        let gateway = MockGateway::new(100.0);
        gateway.set_should_fail(true).await;
        let outcome = collect_poll_updates(&gateway, &fast_retry(), "BTCUSDT", &OrderTable::new())
            .await
            .unwrap();
        assert!(outcome.updates.is_empty());
    }
}
