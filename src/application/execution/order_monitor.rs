use crate::domain::events::EventType;
use crate::domain::orders::{ManagedOrder, OrderKind, OrderStatus, RejectReason};
use crate::domain::ports::BrokerAdapter;
use crate::infrastructure::event_bus::EventBus;
use crate::payload;
use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};
use uuid::Uuid;

/// Tracks live orders: publishes fills, cancels on timeout, retries
/// retryable rejects up to each order's budget, and fails terminally
/// rejected orders without retry.
pub struct OrderMonitor {
    broker: Arc<dyn BrokerAdapter>,
    bus: Arc<EventBus>,
    orders: RwLock<HashMap<Uuid, ManagedOrder>>,
}

impl OrderMonitor {
    pub fn new(broker: Arc<dyn BrokerAdapter>, bus: Arc<EventBus>) -> Self {
        Self {
            broker,
            bus,
            orders: RwLock::new(HashMap::new()),
        }
    }

    pub async fn track(&self, order: ManagedOrder) {
        self.orders.write().await.insert(order.order_id, order);
    }

    pub async fn active_count(&self) -> usize {
        self.orders
            .read()
            .await
            .values()
            .filter(|o| !o.status.is_terminal())
            .count()
    }

    /// One monitoring pass. Mutations are published as events; position
    /// state reacts on the next tick, never mid-tick.
    pub async fn poll(&self, now: DateTime<Utc>) {
        let snapshot: Vec<ManagedOrder> = {
            let orders = self.orders.read().await;
            orders
                .values()
                .filter(|o| !o.status.is_terminal())
                .cloned()
                .collect()
        };

        for order in snapshot {
            let Ok(ticket) = self.broker.order_status(order.order_id).await else {
                continue;
            };
            match ticket.status {
                OrderStatus::Filled => {
                    self.set_status(order.order_id, OrderStatus::Filled).await;
                    self.bus
                        .publish(
                            EventType::OrderFilled,
                            payload! {
                                "orderId" => order.order_id.to_string(),
                                "symbol" => order.symbol.clone(),
                                "quantity" => ticket.filled_quantity,
                                "price" => ticket.avg_fill_price.to_f64().unwrap_or(0.0),
                                "strategyId" => order.strategy_id.clone(),
                            },
                            "order_monitor",
                        )
                        .await;
                }
                OrderStatus::Rejected => {
                    let retryable = ticket
                        .reject_reason
                        .as_ref()
                        .is_some_and(RejectReason::is_retryable);
                    if retryable && order.can_retry() {
                        self.resubmit(&order, now).await;
                    } else {
                        self.fail(&order, ticket.reject_reason.as_ref()).await;
                    }
                }
                _ if order.is_timed_out(now) => {
                    warn!(order = %order.order_id, "order timed out, cancelling");
                    let _ = self.broker.cancel(order.order_id).await;
                    if order.can_retry() {
                        self.resubmit(&order, now).await;
                    } else {
                        self.fail(&order, None).await;
                    }
                }
                _ => {}
            }
        }
    }

    async fn resubmit(&self, order: &ManagedOrder, now: DateTime<Utc>) {
        let result = match (order.kind, order.limit_price) {
            (OrderKind::Limit, Some(limit)) => {
                self.broker
                    .limit_order(&order.symbol, order.quantity, limit, &order.strategy_id)
                    .await
            }
            _ => {
                self.broker
                    .market_order(&order.symbol, order.quantity, &order.strategy_id)
                    .await
            }
        };
        self.set_status(order.order_id, OrderStatus::Cancelled).await;
        match result {
            Ok(ticket) => {
                info!(
                    order = %order.order_id,
                    retry = order.retry_count + 1,
                    "order resubmitted"
                );
                let mut retried = order.clone();
                retried.order_id = ticket.order_id;
                retried.broker_order_id = ticket.broker_order_id.clone();
                retried.status = OrderStatus::Submitted;
                retried.submitted_at = now;
                retried.retry_count += 1;
                self.track(retried).await;
            }
            Err(err) => {
                warn!(order = %order.order_id, %err, "resubmission failed");
                self.fail(order, None).await;
            }
        }
    }

    async fn fail(&self, order: &ManagedOrder, reason: Option<&RejectReason>) {
        self.set_status(order.order_id, OrderStatus::Failed).await;
        self.bus
            .publish(
                EventType::OrderFailure,
                payload! {
                    "orderId" => order.order_id.to_string(),
                    "symbol" => order.symbol.clone(),
                    "strategyId" => order.strategy_id.clone(),
                    "reason" => format!("{reason:?}"),
                    "retries" => order.retry_count,
                },
                "order_monitor",
            )
            .await;
    }

    async fn set_status(&self, order_id: Uuid, status: OrderStatus) {
        if let Some(order) = self.orders.write().await.get_mut(&order_id) {
            order.status = status;
        }
    }
}
