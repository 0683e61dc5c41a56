use crate::application::coordinator::{ExecutionPriority, ExecutionWindow};
use crate::application::position_manager::StructurePredicate;
use crate::application::strategies::{
    close_component_at_market, is_monthly_anchor, nearest_by_delta, short_decay_fraction,
};
use crate::application::strategy_base::{
    EntryPlan, ManageAction, StrategyContext, StrategyLogic, default_place_entry,
    default_place_exit,
};
use crate::domain::options::{ChainEntry, OptionRight};
use crate::domain::orders::OrderLeg;
use crate::domain::positions::{ComponentStatus, LegRole, MultiLegPosition, PositionComponent};
use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

const LEAP_MIN_DTE: i64 = 365;
const LEAP_DELTA: f64 = 0.80;
const WEEKLY_MIN_DTE: i64 = 7;
const WEEKLY_MAX_DTE: i64 = 14;
const WEEKLY_DELTA: f64 = 0.30;
const WEEKLY_PROFIT_TARGET: f64 = 0.20;
const WEEKLY_ROLL_DTE: i64 = 7;
const EARLY_CLOSE_VIX: f64 = 40.0;

/// In-perpetuity monthly covered calls: a deep-ITM LEAP call stands in for
/// stock while short weekly calls are written against it. Dual entry path:
/// attach a fresh weekly to a held LEAP, or atomically open LEAP plus
/// weekly when no position exists.
///
/// The weekly is covered, so the 21-DTE defense does not govern it; the
/// strategy rolls at 7 DTE instead and closes on assignment risk.
pub struct IpmccStrategy;

impl IpmccStrategy {
    pub fn new() -> Self {
        Self
    }

    fn weekly_entry<'a>(
        chain: &'a [ChainEntry],
        today: NaiveDate,
        above_strike: Decimal,
    ) -> Option<&'a ChainEntry> {
        let candidates: Vec<ChainEntry> = chain
            .iter()
            .filter(|entry| {
                let dte = entry.contract.dte(today);
                entry.contract.right == OptionRight::Call
                    && entry.contract.strike > above_strike
                    && (WEEKLY_MIN_DTE..=WEEKLY_MAX_DTE).contains(&dte)
            })
            .cloned()
            .collect();
        let expiry = candidates.first().map(|entry| entry.contract.expiry)?;
        let pick = nearest_by_delta(&candidates, OptionRight::Call, expiry, WEEKLY_DELTA)?;
        chain.iter().find(|entry| entry.contract == pick.contract)
    }

    fn open_leap(position: &MultiLegPosition) -> Option<&PositionComponent> {
        position
            .components_with_role(LegRole::LeapCall)
            .into_iter()
            .find(|c| c.is_open())
    }

    fn open_weekly(position: &MultiLegPosition) -> Option<&PositionComponent> {
        position
            .components_with_role(LegRole::WeeklyCall)
            .into_iter()
            .find(|c| c.is_open())
    }
}

impl Default for IpmccStrategy {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StrategyLogic for IpmccStrategy {
    fn name(&self) -> &'static str {
        "ipmcc"
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
        false
    }

    fn profit_target(&self) -> f64 {
        // The structure is managed per weekly; the whole-position target is
        // effectively unreachable by design.
        10.0
    }

    fn stop_loss(&self) -> Option<f64> {
        None
    }

    fn defensive_exit_applies(&self) -> bool {
        false
    }

    fn structure_predicate(&self) -> StructurePredicate {
        Arc::new(|position| {
            IpmccStrategy::open_leap(position).is_some()
                && IpmccStrategy::open_weekly(position).is_some()
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

        let Ok(chain) = services.market.option_chain(self.underlying(), ctx.today).await else {
            return Ok(None);
        };

        // Path 1: a LEAP is already held; only the weekly is written.
        let held = services.positions.positions_for(self.name()).await;
        if let Some(position) = held.first() {
            let Some(leap) = Self::open_leap(position) else {
                return Ok(None);
            };
            if Self::open_weekly(position).is_some() {
                debug!("weekly already written against the LEAP");
                return Ok(None);
            }
            let Some(weekly) = Self::weekly_entry(&chain, ctx.today, leap.contract.strike) else {
                return Ok(None);
            };
            let mut weekly_leg = OrderLeg::new(weekly.contract.clone(), -1, LegRole::WeeklyCall);
            weekly_leg.limit_price = Some(weekly.mid());
            info!(weekly = %weekly.contract, "attaching weekly to held LEAP");
            return Ok(Some(EntryPlan {
                legs: vec![weekly_leg],
                quantity: 1,
                delta_estimate: -weekly.delta.unwrap_or(WEEKLY_DELTA) * 100.0,
                max_loss_per_contract: weekly.mid() * Decimal::from(100),
                target_position: Some(position.id),
                tag: "ipmcc_weekly".to_string(),
            }));
        }

        // Path 2: open LEAP plus weekly atomically.
        let leap_candidates: Vec<ChainEntry> = chain
            .iter()
            .filter(|entry| {
                entry.contract.right == OptionRight::Call
                    && entry.contract.dte(ctx.today) >= LEAP_MIN_DTE
            })
            .cloned()
            .collect();
        let leap_expiry = leap_candidates.first().map(|entry| entry.contract.expiry);
        let Some(leap) = leap_expiry
            .and_then(|expiry| nearest_by_delta(&leap_candidates, OptionRight::Call, expiry, LEAP_DELTA))
        else {
            return Ok(None);
        };
        let Some(weekly) = Self::weekly_entry(&chain, ctx.today, leap.contract.strike) else {
            return Ok(None);
        };

        let mut leap_leg = OrderLeg::new(leap.contract.clone(), 1, LegRole::LeapCall);
        leap_leg.limit_price = Some(leap.mid());
        let mut weekly_leg = OrderLeg::new(weekly.contract.clone(), -1, LegRole::WeeklyCall);
        weekly_leg.limit_price = Some(weekly.mid());

        let delta_estimate = (leap.delta.unwrap_or(LEAP_DELTA)
            - weekly.delta.unwrap_or(WEEKLY_DELTA))
            * 100.0;
        // Sizing stress: a 20% drawdown on the LEAP debit.
        let max_loss = leap.mid() * Decimal::from(100) * Decimal::from_f64_retain(0.20)
            .unwrap_or(Decimal::ONE);

        Ok(Some(EntryPlan {
            legs: vec![leap_leg, weekly_leg],
            quantity: 1,
            delta_estimate,
            max_loss_per_contract: max_loss.max(Decimal::ONE),
            target_position: None,
            tag: "ipmcc_open".to_string(),
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
        default_place_exit(ctx, position_id, "ipmcc_exit").await
    }

    async fn manage_position(
        &self,
        ctx: &StrategyContext,
        position: &MultiLegPosition,
    ) -> Result<ManageAction, String> {
        let services = &ctx.services;

        // Panic-vol early close takes the whole structure off.
        if services.vix.current_vix().await > EARLY_CLOSE_VIX {
            info!("VIX above early-close level, exiting IPMCC");
            return Ok(ManageAction::Exit(
                crate::domain::states::TransitionTrigger::TimeWindowEnd,
            ));
        }

        let Some(weekly) = Self::open_weekly(position) else {
            return Ok(ManageAction::Hold);
        };

        // Assignment risk: the weekly has gone in the money.
        let spot = services
            .market
            .price(self.underlying())
            .await
            .map_err(|e| e.to_string())?;
        if spot >= weekly.contract.strike {
            info!(strike = %weekly.contract.strike, %spot, "assignment risk, buying weekly back");
            close_component_at_market(services, position, weekly, "ipmcc_assignment").await?;
            return Ok(ManageAction::Hold);
        }

        // 20% decay banks the weekly; 7 DTE rolls it.
        if short_decay_fraction(weekly) >= WEEKLY_PROFIT_TARGET {
            info!("weekly at profit target, closing");
            close_component_at_market(services, position, weekly, "ipmcc_weekly_profit").await?;
            return Ok(ManageAction::Hold);
        }
        if weekly.dte(ctx.today) <= WEEKLY_ROLL_DTE {
            return Ok(ManageAction::Adjust);
        }
        Ok(ManageAction::Hold)
    }

    /// Roll: buy the expiring weekly back, write the next one above the
    /// LEAP strike.
    async fn adjust_position(
        &self,
        ctx: &StrategyContext,
        position_id: Uuid,
    ) -> Result<(), String> {
        let services = &ctx.services;
        let Some(position) = services.positions.get(position_id).await else {
            return Ok(());
        };
        let Some(leap) = Self::open_leap(&position) else {
            return Ok(());
        };
        let leap_strike = leap.contract.strike;

        if let Some(weekly) = Self::open_weekly(&position) {
            close_component_at_market(services, &position, weekly, "ipmcc_roll_close").await?;
        }

        let chain = services
            .market
            .option_chain(self.underlying(), ctx.today)
            .await
            .map_err(|e| e.to_string())?;
        let Some(next_weekly) = Self::weekly_entry(&chain, ctx.today, leap_strike) else {
            debug!("no weekly candidate to roll into");
            return Ok(());
        };
        let ticket = services
            .broker
            .market_order(&next_weekly.contract.symbol(), -1, "ipmcc_roll_open")
            .await
            .map_err(|e| e.to_string())?;

        let mut component = PositionComponent::new(
            self.name(),
            LegRole::WeeklyCall,
            next_weekly.contract.clone(),
            -1,
            next_weekly.mid(),
        );
        component.status = ComponentStatus::Open;
        component.order_link = Some(ticket.order_id);
        component.filled_at = Some(Utc::now());
        services
            .positions
            .add_component(position_id, component)
            .await
            .map_err(|e| e.to_string())?;
        info!(weekly = %next_weekly.contract, "weekly rolled");
        Ok(())
    }
}
