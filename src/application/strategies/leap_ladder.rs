use crate::application::coordinator::{ExecutionPriority, ExecutionWindow};
use crate::application::position_manager::StructurePredicate;
use crate::application::strategies::{
    close_component_at_market, is_quarterly_anchor, short_decay_fraction,
};
use crate::application::strategy_base::{
    EntryPlan, ManageAction, StrategyContext, StrategyLogic, default_place_entry,
    default_place_exit,
};
use crate::domain::options::OptionRight;
use crate::domain::orders::OrderLeg;
use crate::domain::positions::{LegRole, MultiLegPosition};
use async_trait::async_trait;
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

const MIN_DTE: i64 = 365;
const MAX_DTE: i64 = 800;
/// Rung distances below spot, nearest first.
const RUNG_OTM_FRACS: [f64; 3] = [0.10, 0.15, 0.20];
const PER_RUNG_PROFIT_TARGET: f64 = 0.30;

/// Quarterly ladder of long-dated short puts at escalating distances.
/// Each rung banks independently at 30% of its credit.
pub struct LeapLadderStrategy;

impl LeapLadderStrategy {
    pub fn new() -> Self {
        Self
    }
}

impl Default for LeapLadderStrategy {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StrategyLogic for LeapLadderStrategy {
    fn name(&self) -> &'static str {
        "leap_ladder"
    }

    fn underlying(&self) -> &'static str {
        "SPY"
    }

    fn priority(&self) -> ExecutionPriority {
        ExecutionPriority::Low
    }

    fn window(&self) -> Option<ExecutionWindow> {
        None
    }

    fn is_credit(&self) -> bool {
        true
    }

    fn profit_target(&self) -> f64 {
        PER_RUNG_PROFIT_TARGET
    }

    fn stop_loss(&self) -> Option<f64> {
        None
    }

    fn structure_predicate(&self) -> StructurePredicate {
        Arc::new(|position| {
            position
                .components_with_role(LegRole::LadderRung)
                .iter()
                .filter(|c| c.is_open())
                .count()
                >= RUNG_OTM_FRACS.len()
        })
    }

    async fn check_entry_conditions(
        &self,
        ctx: &StrategyContext,
    ) -> Result<Option<EntryPlan>, String> {
        let services = &ctx.services;
        if !is_quarterly_anchor(ctx.today) {
            return Ok(None);
        }
        if !services.positions.positions_for(self.name()).await.is_empty() {
            return Ok(None);
        }

        let spot = services
            .market
            .price(self.underlying())
            .await
            .map_err(|e| e.to_string())?
            .to_f64()
            .unwrap_or(0.0);
        if spot <= 0.0 {
            return Ok(None);
        }

        let Ok(chain) = services.market.option_chain(self.underlying(), ctx.today).await else {
            return Ok(None);
        };
        let long_dated: Vec<_> = chain
            .iter()
            .filter(|entry| {
                let dte = entry.contract.dte(ctx.today);
                entry.contract.right == OptionRight::Put && dte >= MIN_DTE && dte <= MAX_DTE
            })
            .collect();
        if long_dated.is_empty() {
            return Ok(None);
        }

        let mut legs = Vec::new();
        let mut credit = Decimal::ZERO;
        let mut delta_estimate = 0.0;
        for otm in RUNG_OTM_FRACS {
            let target = spot * (1.0 - otm);
            let Some(rung) = long_dated.iter().min_by(|a, b| {
                let da = (a.contract.strike.to_f64().unwrap_or(0.0) - target).abs();
                let db = (b.contract.strike.to_f64().unwrap_or(0.0) - target).abs();
                da.total_cmp(&db)
            }) else {
                return Ok(None);
            };
            if legs
                .iter()
                .any(|leg: &OrderLeg| leg.contract.strike == rung.contract.strike)
            {
                debug!("chain too coarse for distinct rungs");
                continue;
            }
            let mut leg = OrderLeg::new(rung.contract.clone(), -1, LegRole::LadderRung);
            leg.limit_price = Some(rung.mid());
            credit += rung.mid();
            delta_estimate -= rung.delta.unwrap_or(-0.10) * 100.0;
            legs.push(leg);
        }
        if legs.len() < RUNG_OTM_FRACS.len() {
            return Ok(None);
        }
        info!(rungs = legs.len(), %credit, "ladder candidate assembled");

        Ok(Some(EntryPlan {
            legs,
            quantity: 1,
            delta_estimate,
            // Deepest rung stressed at a 10% drawdown.
            max_loss_per_contract: Decimal::from_f64_retain(spot * 0.10 * 100.0)
                .unwrap_or(Decimal::ONE),
            target_position: None,
            tag: "ladder_entry".to_string(),
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
        default_place_exit(ctx, position_id, "ladder_exit").await
    }

    /// Bank each rung independently once it decays 30%.
    async fn manage_position(
        &self,
        ctx: &StrategyContext,
        position: &MultiLegPosition,
    ) -> Result<ManageAction, String> {
        let services = &ctx.services;
        let ripe: Vec<_> = position
            .open_components()
            .filter(|c| c.role == LegRole::LadderRung)
            .filter(|c| short_decay_fraction(c) >= PER_RUNG_PROFIT_TARGET)
            .cloned()
            .collect();
        for rung in ripe {
            info!(rung = %rung.contract, "ladder rung at profit target");
            close_component_at_market(services, position, &rung, "ladder_rung_profit").await?;
        }
        Ok(ManageAction::Hold)
    }
}
