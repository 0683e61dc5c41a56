use crate::domain::events::EventType;
use crate::domain::orders::{OrderLeg, OrderStatus, OrderTicket};
use crate::domain::ports::BrokerAdapter;
use crate::infrastructure::event_bus::EventBus;
use crate::payload;
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use std::sync::Arc;
use tracing::{error, info, warn};

/// One leg's submission result.
#[derive(Debug, Clone)]
pub struct LegFill {
    pub leg: OrderLeg,
    pub ticket: OrderTicket,
    pub fill_price: Decimal,
}

/// All-or-nothing execution of multi-leg orders. A failed attempt leaves no
/// residual legs: the combo path is natively atomic, and the sequential
/// fallback reverses already-filled legs with opposing market orders.
pub struct AtomicExecutor {
    broker: Arc<dyn BrokerAdapter>,
    bus: Arc<EventBus>,
}

impl AtomicExecutor {
    pub fn new(broker: Arc<dyn BrokerAdapter>, bus: Arc<EventBus>) -> Self {
        Self { broker, bus }
    }

    /// Submit all legs as one unit. Returns the per-leg fills on success,
    /// None after a clean unwind on any failure.
    pub async fn execute_atomic(
        &self,
        legs: &[OrderLeg],
        quantity: i64,
        tag: &str,
    ) -> Option<Vec<LegFill>> {
        if legs.is_empty() || quantity <= 0 {
            return None;
        }
        let fills = if self.broker.supports_combo() {
            self.submit_combo(legs, quantity, tag).await?
        } else {
            self.submit_sequential(legs, quantity, tag).await?
        };
        for fill in &fills {
            self.bus
                .publish(
                    EventType::OrderFilled,
                    payload! {
                        "orderId" => fill.ticket.order_id.to_string(),
                        "symbol" => fill.leg.contract.symbol(),
                        "quantity" => fill.leg.quantity * quantity,
                        "price" => fill.fill_price.to_f64().unwrap_or(0.0),
                        "tag" => tag,
                    },
                    "atomic_executor",
                )
                .await;
        }
        Some(fills)
    }

    async fn submit_combo(
        &self,
        legs: &[OrderLeg],
        quantity: i64,
        tag: &str,
    ) -> Option<Vec<LegFill>> {
        let ticket = match self.broker.combo_order(legs, quantity, tag).await {
            Ok(ticket) => ticket,
            Err(err) => {
                warn!(tag, %err, "combo submission failed, no legs remain");
                return None;
            }
        };
        if ticket.status != OrderStatus::Filled {
            warn!(tag, status = ?ticket.status, reason = ?ticket.reject_reason, "combo not filled");
            return None;
        }
        Some(
            legs.iter()
                .map(|leg| LegFill {
                    leg: leg.clone(),
                    ticket: ticket.clone(),
                    fill_price: leg.limit_price.unwrap_or(ticket.avg_fill_price),
                })
                .collect(),
        )
    }

    /// Independent-leg fallback: buy protective legs first, then sell
    /// premium legs; unwind everything filled so far on the first failure.
    async fn submit_sequential(
        &self,
        legs: &[OrderLeg],
        quantity: i64,
        tag: &str,
    ) -> Option<Vec<LegFill>> {
        let mut ordered: Vec<&OrderLeg> = legs.iter().collect();
        ordered.sort_by_key(|leg| leg.quantity < 0);

        let mut fills: Vec<LegFill> = Vec::new();
        for leg in ordered {
            let symbol = leg.contract.symbol();
            let result = self
                .broker
                .market_order(&symbol, leg.quantity * quantity, tag)
                .await;
            let failed = match &result {
                Ok(ticket) => ticket.status != OrderStatus::Filled,
                Err(_) => true,
            };
            if failed {
                warn!(tag, %symbol, "leg failed, reversing {} filled legs", fills.len());
                self.reverse(&fills, tag).await;
                return None;
            }
            let ticket = result.expect("checked above");
            let fill_price = if ticket.avg_fill_price.is_zero() {
                leg.limit_price.unwrap_or(ticket.avg_fill_price)
            } else {
                ticket.avg_fill_price
            };
            fills.push(LegFill {
                leg: leg.clone(),
                ticket,
                fill_price,
            });
        }
        info!(tag, legs = fills.len(), "sequential multi-leg complete");
        Some(fills)
    }

    async fn reverse(&self, fills: &[LegFill], tag: &str) {
        for fill in fills.iter().rev() {
            let symbol = fill.leg.contract.symbol();
            let reverse_qty = -fill.ticket.filled_quantity;
            if let Err(err) = self
                .broker
                .market_order(&symbol, reverse_qty, &format!("{tag}_reverse"))
                .await
            {
                // Residual exposure; operators must intervene.
                error!(%symbol, %err, "reversal order failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::options::{ContractRef, OptionRight};
    use crate::domain::orders::RejectReason;
    use crate::domain::positions::LegRole;
    use crate::infrastructure::mock::MockBroker;
    use chrono::NaiveDate;
    use rust_decimal_macros::dec;

    fn condor_legs() -> Vec<OrderLeg> {
        let expiry = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
        vec![
            OrderLeg::new(
                ContractRef::new("SPY", dec!(442), expiry, OptionRight::Put),
                1,
                LegRole::LongPut,
            ),
            OrderLeg::new(
                ContractRef::new("SPY", dec!(458), expiry, OptionRight::Call),
                1,
                LegRole::LongCall,
            ),
            OrderLeg::new(
                ContractRef::new("SPY", dec!(447), expiry, OptionRight::Put),
                -1,
                LegRole::ShortPut,
            ),
            OrderLeg::new(
                ContractRef::new("SPY", dec!(453), expiry, OptionRight::Call),
                -1,
                LegRole::ShortCall,
            ),
        ]
    }

    #[tokio::test]
    async fn combo_path_fills_all_legs() {
        let broker = Arc::new(MockBroker::new());
        let executor = AtomicExecutor::new(broker.clone(), Arc::new(EventBus::new()));
        let legs = condor_legs();
        let fills = executor.execute_atomic(&legs, 1, "ic").await.unwrap();
        assert_eq!(fills.len(), 4);
        for leg in &legs {
            assert_eq!(broker.net_quantity(&leg.contract.symbol()).await, leg.quantity);
        }
    }

    #[tokio::test]
    async fn sequential_buys_before_sells() {
        let broker = Arc::new(MockBroker::with_combo_support(false));
        let executor = AtomicExecutor::new(broker.clone(), Arc::new(EventBus::new()));
        let fills = executor.execute_atomic(&condor_legs(), 1, "ic").await.unwrap();
        assert_eq!(fills.len(), 4);
        assert!(fills[0].leg.quantity > 0);
        assert!(fills[1].leg.quantity > 0);
        assert!(fills[2].leg.quantity < 0);
        assert!(fills[3].leg.quantity < 0);
    }

    #[tokio::test]
    async fn failed_leg_reverses_to_net_zero() {
        let broker = Arc::new(MockBroker::with_combo_support(false));
        let legs = condor_legs();
        // Third submission (first short leg) is rejected.
        broker
            .script_reject(&legs[2].contract.symbol(), RejectReason::InvalidSymbol)
            .await;
        let executor = AtomicExecutor::new(broker.clone(), Arc::new(EventBus::new()));

        let result = executor.execute_atomic(&legs, 1, "ic").await;
        assert!(result.is_none());
        for leg in &legs {
            assert_eq!(
                broker.net_quantity(&leg.contract.symbol()).await,
                0,
                "residual leg on {}",
                leg.contract.symbol()
            );
        }
    }

    #[tokio::test]
    async fn combo_reject_leaves_nothing() {
        let broker = Arc::new(MockBroker::new());
        let legs = condor_legs();
        broker
            .script_reject(&legs[0].contract.symbol(), RejectReason::InsufficientFunds)
            .await;
        let executor = AtomicExecutor::new(broker.clone(), Arc::new(EventBus::new()));
        assert!(executor.execute_atomic(&legs, 1, "ic").await.is_none());
        for leg in &legs {
            assert_eq!(broker.net_quantity(&leg.contract.symbol()).await, 0);
        }
    }

    #[tokio::test]
    async fn empty_legs_refused() {
        let broker = Arc::new(MockBroker::new());
        let executor = AtomicExecutor::new(broker, Arc::new(EventBus::new()));
        assert!(executor.execute_atomic(&[], 1, "x").await.is_none());
    }
}
