use crate::application::coordinator::{ExecutionPriority, ExecutionWindow};
use crate::application::position_manager::StructurePredicate;
use crate::application::strategies::{expiry_in_range, is_monthly_anchor, nearest_by_delta};
use crate::application::strategy_base::{
    EntryPlan, StrategyContext, StrategyLogic, default_place_entry, default_place_exit,
};
use crate::domain::options::OptionRight;
use crate::domain::orders::OrderLeg;
use crate::domain::positions::LegRole;
use async_trait::async_trait;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

const MIN_DTE: i64 = 100;
const MAX_DTE: i64 = 120;
const DEBIT_LONG_DELTA: f64 = 0.25;
const DEBIT_SHORT_DELTA: f64 = 0.20;
const NAKED_DELTA: f64 = 0.05;

/// Long-duration 1-1-2 put structure: one debit put spread plus two naked
/// puts, entered monthly on the anchor day at 100-120 DTE. Profit at 50%
/// of the credit, defended unconditionally at 21 DTE.
pub struct Lt112Strategy;

impl Lt112Strategy {
    pub fn new() -> Self {
        Self
    }
}

impl Default for Lt112Strategy {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StrategyLogic for Lt112Strategy {
    fn name(&self) -> &'static str {
        "lt112"
    }

    fn underlying(&self) -> &'static str {
        "SPY"
    }

    fn priority(&self) -> ExecutionPriority {
        ExecutionPriority::Medium
    }

    fn window(&self) -> Option<ExecutionWindow> {
        None
    }

    fn is_credit(&self) -> bool {
        true
    }

    fn profit_target(&self) -> f64 {
        0.50
    }

    fn stop_loss(&self) -> Option<f64> {
        None
    }

    fn structure_predicate(&self) -> StructurePredicate {
        Arc::new(|position| {
            position
                .components_with_role(LegRole::DebitLongPut)
                .iter()
                .any(|c| c.is_open())
                && position
                    .components_with_role(LegRole::DebitShortPut)
                    .iter()
                    .any(|c| c.is_open())
                && position
                    .components_with_role(LegRole::NakedPut)
                    .iter()
                    .any(|c| c.is_open())
        })
    }

    async fn check_entry_conditions(
        &self,
        ctx: &StrategyContext,
    ) -> Result<Option<EntryPlan>, String> {
        let services = &ctx.services;
        if !is_monthly_anchor(ctx.today) {
            return Ok(None);
        }
        if !services.positions.positions_for(self.name()).await.is_empty() {
            debug!("lt112 already deployed this cycle");
            return Ok(None);
        }

        let Ok(chain) = services.market.option_chain(self.underlying(), ctx.today).await else {
            return Ok(None);
        };
        let Some(expiry) = expiry_in_range(&chain, ctx.today, MIN_DTE, MAX_DTE) else {
            return Ok(None);
        };

        let Some(debit_long) = nearest_by_delta(&chain, OptionRight::Put, expiry, DEBIT_LONG_DELTA)
        else {
            return Ok(None);
        };
        let Some(debit_short) =
            nearest_by_delta(&chain, OptionRight::Put, expiry, DEBIT_SHORT_DELTA)
        else {
            return Ok(None);
        };
        let Some(naked) = nearest_by_delta(&chain, OptionRight::Put, expiry, NAKED_DELTA) else {
            return Ok(None);
        };
        if debit_long.contract.strike == debit_short.contract.strike {
            return Ok(None);
        }

        let mut long_leg = OrderLeg::new(debit_long.contract.clone(), 1, LegRole::DebitLongPut);
        long_leg.limit_price = Some(debit_long.mid());
        let mut short_leg = OrderLeg::new(debit_short.contract.clone(), -1, LegRole::DebitShortPut);
        short_leg.limit_price = Some(debit_short.mid());
        let mut naked_leg = OrderLeg::new(naked.contract.clone(), -2, LegRole::NakedPut);
        naked_leg.limit_price = Some(naked.mid());

        let delta_estimate = (debit_long.delta.unwrap_or(0.0)
            - debit_short.delta.unwrap_or(0.0)
            - 2.0 * naked.delta.unwrap_or(0.0))
            * 100.0;
        // Stress one naked put at a 10% drawdown for sizing purposes.
        let max_loss = naked.contract.strike * dec!(0.10) * Decimal::from(100);

        Ok(Some(EntryPlan {
            legs: vec![long_leg, short_leg, naked_leg],
            quantity: 1,
            delta_estimate,
            max_loss_per_contract: max_loss,
            target_position: None,
            tag: "lt112_entry".to_string(),
        }))
    }

    async fn place_entry_orders(
        &self,
        ctx: &StrategyContext,
        plan: &EntryPlan,
        quantity: i64,
    ) -> Result<Option<Uuid>, String> {
        default_place_entry(ctx, self.name(), self.underlying(), plan, quantity).await
    }

    async fn place_exit_orders(
        &self,
        ctx: &StrategyContext,
        position_id: Uuid,
    ) -> Result<bool, String> {
        default_place_exit(ctx, position_id, "lt112_exit").await
    }
}
