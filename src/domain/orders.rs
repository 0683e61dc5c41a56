use crate::domain::options::ContractRef;
use crate::domain::positions::LegRole;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderStatus {
    Pending,
    Submitted,
    Filled,
    PartiallyFilled,
    Cancelled,
    Rejected,
    Failed,
}

impl OrderStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Filled | OrderStatus::Cancelled | OrderStatus::Rejected | OrderStatus::Failed
        )
    }
}

/// Why the broker rejected an order. Terminal reasons are never retried.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RejectReason {
    InsufficientFunds,
    InvalidSymbol,
    Network,
    Transient(String),
}

impl RejectReason {
    pub fn is_retryable(&self) -> bool {
        matches!(self, RejectReason::Network | RejectReason::Transient(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderSide {
    Buy,
    Sell,
}

/// One leg of a combo order. Quantity is per unit of the combo and signed:
/// positive buys, negative sells.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderLeg {
    pub contract: ContractRef,
    pub quantity: i64,
    pub role: LegRole,
    pub limit_price: Option<Decimal>,
}

impl OrderLeg {
    pub fn new(contract: ContractRef, quantity: i64, role: LegRole) -> Self {
        Self {
            contract,
            quantity,
            role,
            limit_price: None,
        }
    }

    pub fn side(&self) -> OrderSide {
        if self.quantity >= 0 {
            OrderSide::Buy
        } else {
            OrderSide::Sell
        }
    }
}

/// Broker acknowledgement of a submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderTicket {
    pub order_id: Uuid,
    pub broker_order_id: String,
    pub symbol: String,
    pub status: OrderStatus,
    pub filled_quantity: i64,
    pub avg_fill_price: Decimal,
    pub reject_reason: Option<RejectReason>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderKind {
    Market,
    Limit,
    Combo,
}

/// A live order under monitoring.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagedOrder {
    pub order_id: Uuid,
    pub broker_order_id: String,
    pub symbol: String,
    pub kind: OrderKind,
    pub side: OrderSide,
    pub quantity: i64,
    pub limit_price: Option<Decimal>,
    pub stop_price: Option<Decimal>,
    pub status: OrderStatus,
    pub submitted_at: DateTime<Utc>,
    pub timeout_minutes: i64,
    pub retry_count: u32,
    pub max_retries: u32,
    pub max_slippage: Decimal,
    pub strategy_id: String,
}

impl ManagedOrder {
    pub fn is_timed_out(&self, now: DateTime<Utc>) -> bool {
        (now - self.submitted_at).num_minutes() >= self.timeout_minutes
    }

    pub fn can_retry(&self) -> bool {
        self.retry_count < self.max_retries
    }
}
