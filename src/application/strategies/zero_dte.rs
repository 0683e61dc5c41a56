use crate::application::coordinator::{ExecutionPriority, ExecutionWindow};
use crate::application::position_manager::StructurePredicate;
use crate::application::strategies::nearest_by_delta;
use crate::application::strategy_base::{
    EntryPlan, StrategyContext, StrategyLogic, default_place_entry, default_place_exit,
};
use crate::domain::options::{ChainEntry, OptionRight};
use crate::domain::orders::OrderLeg;
use crate::domain::positions::LegRole;
use async_trait::async_trait;
use chrono::{Datelike, NaiveTime, Weekday};
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

const SHORT_DELTA: f64 = 0.16;
const LIGHT_SHORT_DELTA: f64 = 0.10;
const LONG_DELTA: f64 = 0.05;

/// Structure chosen from the pre-10:30 move.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CondorStructure {
    IronCondor,
    /// Full condor with the given side sold lighter (0.10 delta).
    BiasedIronCondor(OptionRight),
    PutSpreadOnly,
    CallSpreadOnly,
}

impl CondorStructure {
    /// Morning-move selection: flat opens trade the full condor, moderate
    /// moves lighten the side the market is running at, larger moves drop
    /// the threatened side entirely.
    pub fn select(move_frac: f64) -> Self {
        if move_frac >= 0.005 {
            CondorStructure::PutSpreadOnly
        } else if move_frac <= -0.005 {
            CondorStructure::CallSpreadOnly
        } else if move_frac >= 0.002 {
            CondorStructure::BiasedIronCondor(OptionRight::Call)
        } else if move_frac <= -0.002 {
            CondorStructure::BiasedIronCondor(OptionRight::Put)
        } else {
            CondorStructure::IronCondor
        }
    }

    fn wants_puts(&self) -> bool {
        !matches!(self, CondorStructure::CallSpreadOnly)
    }

    fn wants_calls(&self) -> bool {
        !matches!(self, CondorStructure::PutSpreadOnly)
    }

    fn short_delta(&self, right: OptionRight) -> f64 {
        match self {
            CondorStructure::BiasedIronCondor(light) if *light == right => LIGHT_SHORT_DELTA,
            _ => SHORT_DELTA,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ZeroDteConfig {
    pub max_contracts: i64,
    pub profit_target: f64,
    pub stop_loss: f64,
}

impl Default for ZeroDteConfig {
    fn default() -> Self {
        Self {
            max_contracts: 5,
            profit_target: 0.50,
            stop_loss: 2.00,
        }
    }
}

/// Friday same-day-expiry index condor. Entries after 10:30 with VIX above
/// the 0DTE floor; the 15:30 hard exit rides the same-day defense cutoff.
pub struct ZeroDteStrategy {
    config: ZeroDteConfig,
}

impl ZeroDteStrategy {
    pub fn new(config: ZeroDteConfig) -> Self {
        Self { config }
    }

    fn spread_legs(
        &self,
        chain: &[ChainEntry],
        structure: CondorStructure,
        right: OptionRight,
        expiry: chrono::NaiveDate,
    ) -> Option<(OrderLeg, OrderLeg)> {
        let short = nearest_by_delta(chain, right, expiry, structure.short_delta(right))?;
        let long = nearest_by_delta(chain, right, expiry, LONG_DELTA)?;
        if short.contract.strike == long.contract.strike {
            return None;
        }
        let (short_role, long_role) = match right {
            OptionRight::Put => (LegRole::ShortPut, LegRole::LongPut),
            OptionRight::Call => (LegRole::ShortCall, LegRole::LongCall),
        };
        let mut short_leg = OrderLeg::new(short.contract.clone(), -1, short_role);
        short_leg.limit_price = Some(short.mid());
        let mut long_leg = OrderLeg::new(long.contract.clone(), 1, long_role);
        long_leg.limit_price = Some(long.mid());
        Some((short_leg, long_leg))
    }
}

impl Default for ZeroDteStrategy {
    fn default() -> Self {
        Self::new(ZeroDteConfig::default())
    }
}

#[async_trait]
impl StrategyLogic for ZeroDteStrategy {
    fn name(&self) -> &'static str {
        "zero_dte"
    }

    fn underlying(&self) -> &'static str {
        "SPY"
    }

    fn priority(&self) -> ExecutionPriority {
        ExecutionPriority::High
    }

    fn window(&self) -> Option<ExecutionWindow> {
        Some(ExecutionWindow {
            start: NaiveTime::from_hms_opt(10, 30, 0).expect("valid time"),
            end: NaiveTime::from_hms_opt(15, 45, 0).expect("valid time"),
        })
    }

    fn is_credit(&self) -> bool {
        true
    }

    fn profit_target(&self) -> f64 {
        self.config.profit_target
    }

    fn stop_loss(&self) -> Option<f64> {
        Some(self.config.stop_loss)
    }

    fn structure_predicate(&self) -> StructurePredicate {
        Arc::new(|position| {
            let open = position.open_components().count();
            open >= 2 && position.components.values().all(|c| c.is_open())
        })
    }

    async fn check_entry_conditions(
        &self,
        ctx: &StrategyContext,
    ) -> Result<Option<EntryPlan>, String> {
        let services = &ctx.services;
        if ctx.today.weekday() != Weekday::Fri {
            return Ok(None);
        }
        if !services.positions.positions_for(self.name()).await.is_empty() {
            return Ok(None);
        }
        if !services.vix.zero_dte_tradable().await {
            debug!("VIX below the 0DTE floor");
            return Ok(None);
        }

        let spot = services
            .market
            .price(self.underlying())
            .await
            .map_err(|e| e.to_string())?;
        let open = services
            .market
            .session_open(self.underlying())
            .await
            .map_err(|e| e.to_string())?;
        let move_frac = if open.is_zero() {
            0.0
        } else {
            ((spot - open) / open).to_f64().unwrap_or(0.0)
        };
        let structure = CondorStructure::select(move_frac);
        info!(
            move_pct = move_frac * 100.0,
            ?structure,
            "0DTE morning analysis"
        );

        let Ok(chain) = services.market.option_chain(self.underlying(), ctx.today).await else {
            debug!("no SPY chain available");
            return Ok(None);
        };
        let same_day: Vec<ChainEntry> = chain
            .into_iter()
            .filter(|entry| entry.contract.expiry == ctx.today)
            .collect();
        if same_day.is_empty() {
            return Ok(None);
        }

        let mut legs = Vec::new();
        if structure.wants_puts() {
            let Some((short, long)) =
                self.spread_legs(&same_day, structure, OptionRight::Put, ctx.today)
            else {
                return Ok(None);
            };
            legs.push(short);
            legs.push(long);
        }
        if structure.wants_calls() {
            let Some((short, long)) =
                self.spread_legs(&same_day, structure, OptionRight::Call, ctx.today)
            else {
                return Ok(None);
            };
            legs.push(short);
            legs.push(long);
        }

        let credit: Decimal = legs
            .iter()
            .map(|leg| {
                -leg.limit_price.unwrap_or_default() * Decimal::from(leg.quantity)
            })
            .sum();
        let width = widest_spread(&legs);
        let max_loss = ((width - credit).max(Decimal::ZERO) * Decimal::from(100)).max(Decimal::ONE);
        let delta_estimate: f64 = legs
            .iter()
            .map(|leg| leg.quantity as f64)
            .zip(legs.iter().map(|leg| leg_delta(&same_day, leg)))
            .map(|(qty, delta)| qty * delta * 100.0)
            .sum();

        Ok(Some(EntryPlan {
            legs,
            quantity: self.config.max_contracts,
            delta_estimate,
            max_loss_per_contract: max_loss,
            target_position: None,
            tag: "zero_dte_condor".to_string(),
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
        default_place_exit(ctx, position_id, "zero_dte_exit").await
    }
}

fn widest_spread(legs: &[OrderLeg]) -> Decimal {
    let put_width = side_width(legs, OptionRight::Put);
    let call_width = side_width(legs, OptionRight::Call);
    put_width.max(call_width)
}

fn side_width(legs: &[OrderLeg], right: OptionRight) -> Decimal {
    let strikes: Vec<Decimal> = legs
        .iter()
        .filter(|leg| leg.contract.right == right)
        .map(|leg| leg.contract.strike)
        .collect();
    match (strikes.iter().max(), strikes.iter().min()) {
        (Some(max), Some(min)) => *max - *min,
        _ => Decimal::ZERO,
    }
}

fn leg_delta(chain: &[ChainEntry], leg: &OrderLeg) -> f64 {
    chain
        .iter()
        .find(|entry| entry.contract == leg.contract)
        .and_then(|entry| entry.delta)
        .unwrap_or(0.0)
}
