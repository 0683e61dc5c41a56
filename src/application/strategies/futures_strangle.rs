use crate::application::coordinator::{ExecutionPriority, ExecutionWindow};
use crate::application::position_manager::StructurePredicate;
use crate::application::strategies::{close_component_at_market, expiry_in_range, nearest_by_delta};
use crate::application::strategy_base::{
    EntryPlan, ManageAction, StrategyContext, StrategyLogic, default_place_entry,
    default_place_exit,
};
use crate::domain::options::{ChainEntry, ContractRef, OptionRight};
use crate::domain::orders::OrderLeg;
use crate::domain::positions::{ComponentStatus, LegRole, MultiLegPosition, PositionComponent};
use async_trait::async_trait;
use chrono::{Datelike, NaiveTime, Utc, Weekday};
use rust_decimal::Decimal;
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

const MIN_DTE: i64 = 45;
const MAX_DTE: i64 = 60;
const SHORT_DELTA: f64 = 0.16;
/// A short strike within this fraction of spot counts as tested.
const TESTED_PROXIMITY: f64 = 0.02;
/// Rolled strikes land this far out of the money.
const ROLL_OTM_FRAC: f64 = 0.20;

/// Short 16-delta strangle on /ES, entered Mondays and Thursdays at 45-60
/// DTE. Profit at 25% of the credit, stop at 100%, 21-DTE defense, tested
/// side rolled to 20% OTM.
pub struct FuturesStrangleStrategy;

impl FuturesStrangleStrategy {
    pub fn new() -> Self {
        Self
    }

    fn tested_side(position: &MultiLegPosition, spot: f64) -> Option<LegRole> {
        for component in position.open_components() {
            let strike = component.contract.strike.to_f64().unwrap_or(0.0);
            if strike <= 0.0 || spot <= 0.0 {
                continue;
            }
            if (spot - strike).abs() / spot <= TESTED_PROXIMITY {
                return Some(component.role);
            }
        }
        None
    }
}

impl Default for FuturesStrangleStrategy {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StrategyLogic for FuturesStrangleStrategy {
    fn name(&self) -> &'static str {
        "futures_strangle"
    }

    fn underlying(&self) -> &'static str {
        "/ES"
    }

    fn priority(&self) -> ExecutionPriority {
        ExecutionPriority::Medium
    }

    fn window(&self) -> Option<ExecutionWindow> {
        Some(ExecutionWindow {
            start: NaiveTime::from_hms_opt(10, 0, 0).expect("valid time"),
            end: NaiveTime::from_hms_opt(16, 0, 0).expect("valid time"),
        })
    }

    fn is_credit(&self) -> bool {
        true
    }

    fn profit_target(&self) -> f64 {
        0.25
    }

    fn stop_loss(&self) -> Option<f64> {
        Some(1.00)
    }

    fn structure_predicate(&self) -> StructurePredicate {
        Arc::new(|position| {
            position
                .components_with_role(LegRole::ShortCall)
                .iter()
                .any(|c| c.is_open())
                && position
                    .components_with_role(LegRole::ShortPut)
                    .iter()
                    .any(|c| c.is_open())
        })
    }

    async fn check_entry_conditions(
        &self,
        ctx: &StrategyContext,
    ) -> Result<Option<EntryPlan>, String> {
        let services = &ctx.services;
        if !matches!(ctx.today.weekday(), Weekday::Mon | Weekday::Thu) {
            return Ok(None);
        }
        if !services.positions.positions_for(self.name()).await.is_empty() {
            return Ok(None);
        }

        let Ok(chain) = services.market.option_chain(self.underlying(), ctx.today).await else {
            return Ok(None);
        };
        let Some(expiry) = expiry_in_range(&chain, ctx.today, MIN_DTE, MAX_DTE) else {
            return Ok(None);
        };
        let Some(call) = nearest_by_delta(&chain, OptionRight::Call, expiry, SHORT_DELTA) else {
            return Ok(None);
        };
        let Some(put) = nearest_by_delta(&chain, OptionRight::Put, expiry, SHORT_DELTA) else {
            return Ok(None);
        };

        let mut call_leg = OrderLeg::new(call.contract.clone(), -1, LegRole::ShortCall);
        call_leg.limit_price = Some(call.mid());
        let mut put_leg = OrderLeg::new(put.contract.clone(), -1, LegRole::ShortPut);
        put_leg.limit_price = Some(put.mid());

        let credit = call.mid() + put.mid();
        let multiplier = Decimal::from(call.contract.multiplier);
        let delta_estimate = (-call.delta.unwrap_or(SHORT_DELTA)
            - put.delta.unwrap_or(-SHORT_DELTA))
            * call.contract.multiplier as f64;
        debug!(%credit, call = %call.contract, put = %put.contract, "strangle candidate");

        Ok(Some(EntryPlan {
            legs: vec![call_leg, put_leg],
            quantity: 2,
            delta_estimate,
            // The stop caps the loss near the collected credit.
            max_loss_per_contract: credit * multiplier,
            target_position: None,
            tag: "strangle_entry".to_string(),
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
        default_place_exit(ctx, position_id, "strangle_exit").await
    }

    async fn manage_position(
        &self,
        ctx: &StrategyContext,
        position: &MultiLegPosition,
    ) -> Result<ManageAction, String> {
        let spot = ctx
            .services
            .market
            .price(self.underlying())
            .await
            .map_err(|e| e.to_string())?
            .to_f64()
            .unwrap_or(0.0);
        if Self::tested_side(position, spot).is_some() {
            return Ok(ManageAction::Adjust);
        }
        Ok(ManageAction::Hold)
    }

    /// Roll the tested side: buy it back, sell the same right again at 20%
    /// OTM on the same expiry.
    async fn adjust_position(
        &self,
        ctx: &StrategyContext,
        position_id: Uuid,
    ) -> Result<(), String> {
        let services = &ctx.services;
        let Some(position) = services.positions.get(position_id).await else {
            return Ok(());
        };
        let spot = services
            .market
            .price(self.underlying())
            .await
            .map_err(|e| e.to_string())?
            .to_f64()
            .unwrap_or(0.0);
        let Some(tested_role) = Self::tested_side(&position, spot) else {
            return Ok(());
        };
        let Some(tested) = position
            .open_components()
            .find(|c| c.role == tested_role)
            .cloned()
        else {
            return Ok(());
        };

        info!(side = %tested_role, %spot, "rolling tested strangle side");
        close_component_at_market(services, &position, &tested, "strangle_roll_close").await?;

        let right = tested.contract.right;
        let target_strike = match right {
            OptionRight::Call => spot * (1.0 + ROLL_OTM_FRAC),
            OptionRight::Put => spot * (1.0 - ROLL_OTM_FRAC),
        };
        let chain = services
            .market
            .option_chain(self.underlying(), ctx.today)
            .await
            .map_err(|e| e.to_string())?;
        let replacement = chain
            .iter()
            .filter(|entry| {
                entry.contract.right == right && entry.contract.expiry == tested.contract.expiry
            })
            .min_by(|a, b| {
                let da = (a.contract.strike.to_f64().unwrap_or(0.0) - target_strike).abs();
                let db = (b.contract.strike.to_f64().unwrap_or(0.0) - target_strike).abs();
                da.total_cmp(&db)
            })
            .cloned()
            .unwrap_or_else(|| synthetic_replacement(&tested.contract, target_strike));

        let ticket = services
            .broker
            .market_order(&replacement.contract.symbol(), tested.quantity, "strangle_roll_open")
            .await
            .map_err(|e| e.to_string())?;
        let mut component = PositionComponent::new(
            self.name(),
            tested.role,
            replacement.contract.clone(),
            tested.quantity,
            replacement.mid(),
        );
        component.status = ComponentStatus::Open;
        component.order_link = Some(ticket.order_id);
        component.filled_at = Some(Utc::now());
        services
            .positions
            .add_component(position_id, component)
            .await
            .map_err(|e| e.to_string())?;
        Ok(())
    }
}

fn synthetic_replacement(old: &ContractRef, target_strike: f64) -> ChainEntry {
    let strike = Decimal::from_f64(target_strike.round()).unwrap_or(old.strike);
    ChainEntry {
        contract: ContractRef::new(&old.underlying, strike, old.expiry, old.right),
        bid: Decimal::ZERO,
        ask: Decimal::ZERO,
        last: Decimal::ZERO,
        implied_volatility: None,
        delta: None,
    }
}
