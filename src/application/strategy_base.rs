use crate::application::coordinator::{CoordinatedStrategy, ExecutionPriority, ExecutionWindow};
use crate::application::execution::AtomicExecutor;
use crate::application::greeks_service::GreeksService;
use crate::application::performance::PerformanceTracker;
use crate::application::position_manager::{PositionStateManager, StructurePredicate};
use crate::application::risk::concentration::ConcentrationPlugin;
use crate::application::risk::correlation::DEFENSE_DTE;
use crate::application::risk::{PositionRequest, UnifiedRiskManager};
use crate::application::sizer::PositionSizer;
use crate::application::state_machine::{ALL_STATES, StateMachine};
use crate::application::vix_manager::VixManager;
use crate::domain::orders::OrderLeg;
use crate::domain::positions::{ComponentStatus, MultiLegPosition, PositionComponent};
use crate::domain::states::{StrategyState, TransitionTrigger};
use crate::infrastructure::cache::UnifiedCache;
use crate::infrastructure::event_bus::EventBus;
use crate::domain::ports::{BrokerAdapter, MarketDataAdapter};
use async_trait::async_trait;
use chrono::{NaiveDate, NaiveDateTime, NaiveTime, Utc};
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use serde_json::{Value, json};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Same-day expiries defend at this wall-clock cutoff instead of at entry.
pub fn same_day_defense_cutoff() -> NaiveTime {
    NaiveTime::from_hms_opt(15, 30, 0).expect("valid cutoff")
}

/// Everything a strategy needs, passed explicitly instead of reaching into
/// a global host.
pub struct StrategyServices {
    pub bus: Arc<EventBus>,
    pub cache: Arc<UnifiedCache>,
    pub market: Arc<dyn MarketDataAdapter>,
    pub broker: Arc<dyn BrokerAdapter>,
    pub vix: Arc<VixManager>,
    pub greeks: Arc<GreeksService>,
    pub positions: Arc<PositionStateManager>,
    pub risk: Arc<UnifiedRiskManager>,
    pub executor: Arc<AtomicExecutor>,
    pub sizer: Arc<PositionSizer>,
    pub performance: Arc<PerformanceTracker>,
    pub concentration: Arc<ConcentrationPlugin>,
}

#[derive(Clone)]
pub struct StrategyContext {
    pub services: Arc<StrategyServices>,
    pub now: NaiveDateTime,
    pub today: NaiveDate,
}

/// A prepared entry: the legs to submit and how the position is shaped.
#[derive(Debug, Clone)]
pub struct EntryPlan {
    pub legs: Vec<OrderLeg>,
    pub quantity: i64,
    /// Net delta one unit of the structure adds, for risk and allocation.
    pub delta_estimate: f64,
    pub max_loss_per_contract: Decimal,
    /// Attach to this position instead of opening a new one.
    pub target_position: Option<Uuid>,
    pub tag: String,
}

/// What a strategy wants done with an open position this tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManageAction {
    Hold,
    Exit(TransitionTrigger),
    Adjust,
}

/// Strategy behaviour behind the shared FSM runner. Implementations supply
/// the entry conditions and order placement; the runner owns the lifecycle,
/// the risk gates, and the universal defensive exit.
#[async_trait]
pub trait StrategyLogic: Send + Sync {
    fn name(&self) -> &'static str;
    fn underlying(&self) -> &'static str;
    fn priority(&self) -> ExecutionPriority;
    /// Entry window in market time, when the strategy has one.
    fn window(&self) -> Option<ExecutionWindow>;
    fn is_credit(&self) -> bool;
    /// Profit target as a fraction of the entry credit (or debit).
    fn profit_target(&self) -> f64;
    /// Stop as a fraction of the entry credit (or debit), when the
    /// strategy uses one.
    fn stop_loss(&self) -> Option<f64>;
    fn structure_predicate(&self) -> StructurePredicate;

    /// Whether the 21-DTE defense governs this strategy's short legs.
    /// Covered structures that roll their short leg by design (IPMCC) opt
    /// out and manage the roll themselves.
    fn defensive_exit_applies(&self) -> bool {
        true
    }

    async fn check_entry_conditions(
        &self,
        ctx: &StrategyContext,
    ) -> Result<Option<EntryPlan>, String>;

    async fn place_entry_orders(
        &self,
        ctx: &StrategyContext,
        plan: &EntryPlan,
        quantity: i64,
    ) -> Result<Option<Uuid>, String>;

    async fn place_exit_orders(
        &self,
        ctx: &StrategyContext,
        position_id: Uuid,
    ) -> Result<bool, String>;

    async fn manage_position(
        &self,
        _ctx: &StrategyContext,
        _position: &MultiLegPosition,
    ) -> Result<ManageAction, String> {
        Ok(ManageAction::Hold)
    }

    async fn adjust_position(
        &self,
        _ctx: &StrategyContext,
        _position_id: Uuid,
    ) -> Result<(), String> {
        Ok(())
    }

    async fn cleanup_after_close(&self, ctx: &StrategyContext) -> Result<(), String> {
        ctx.services.concentration.release_allocation(self.name()).await;
        Ok(())
    }
}

/// Install the lifecycle every strategy shares, including the universal
/// escape edges to Error and Suspended.
pub fn install_base_transitions(machine: &mut StateMachine) {
    use StrategyState::*;
    use TransitionTrigger::*;

    machine.add_transition(Initializing, MarketOpen, Ready);
    machine.add_transition(Ready, TimeWindowStart, Analyzing);
    machine.add_transition(Analyzing, EntryConditionsMet, Entering);
    machine.add_transition(Analyzing, EntryConditionsFailed, Ready);
    machine.add_transition(Entering, OrderFilled, PositionOpen);
    machine.add_transition(Entering, OrderRejected, Analyzing);
    machine.add_transition(PositionOpen, MarketOpen, Managing);
    machine.add_transition(Managing, TimeWindowEnd, Exiting);
    machine.add_transition(Managing, ProfitTargetHit, Exiting);
    machine.add_transition(Managing, StopLossHit, Exiting);
    machine.add_transition(Managing, DefensiveExitDte, Exiting);
    machine.add_transition(Managing, AdjustmentNeeded, Adjusting);
    machine.add_transition(Adjusting, OrderFilled, Managing);
    machine.add_transition(Exiting, OrderFilled, Closed);
    machine.add_transition(Closed, MarketOpen, Ready);
    machine.add_transition(Suspended, MarketOpen, Ready);
    // Recovery out of Error is explicit: only the runner fires it, and only
    // while the error budget allows.
    machine.add_guarded_transition(
        Error,
        MarketOpen,
        Ready,
        Arc::new(|data: &Value| data.get("recovered").and_then(Value::as_bool).unwrap_or(false)),
    );

    for state in ALL_STATES {
        if state != Error {
            machine.add_transition(state, SystemError, Error);
        }
        if state != Suspended && state != Error {
            machine.add_transition(state, EmergencyExit, Suspended);
        }
    }
    // Margin and volatility pressure stop NEW risk. They never interrupt a
    // strategy that is already managing or unwinding exposure: the 21-DTE
    // defensive exit outranks both.
    for state in [Initializing, Ready, Analyzing, PendingEntry, Closed] {
        machine.add_transition(state, MarginCall, Suspended);
        machine.add_transition(state, VixSpike, Suspended);
    }
}

struct RunnerState {
    pending: Option<(EntryPlan, i64)>,
    position_id: Option<Uuid>,
}

/// Composes a `StrategyLogic` with the FSM engine and drives the lifecycle
/// each tick. One runner per strategy; the machine itself is owned by the
/// unified state manager's registry.
pub struct StrategyRunner {
    logic: Arc<dyn StrategyLogic>,
    machine: Arc<Mutex<StateMachine>>,
    services: Arc<StrategyServices>,
    state: tokio::sync::Mutex<RunnerState>,
}

impl StrategyRunner {
    pub fn new(logic: Arc<dyn StrategyLogic>, services: Arc<StrategyServices>) -> Self {
        let mut machine = StateMachine::new(logic.name());
        install_base_transitions(&mut machine);
        Self {
            logic,
            machine: Arc::new(Mutex::new(machine)),
            services,
            state: tokio::sync::Mutex::new(RunnerState {
                pending: None,
                position_id: None,
            }),
        }
    }

    /// Wire the structure predicate into the position manager. Call once at
    /// startup.
    pub async fn init(&self) {
        self.services
            .positions
            .register_structure(self.logic.name(), self.logic.structure_predicate())
            .await;
    }

    pub fn machine(&self) -> Arc<Mutex<StateMachine>> {
        self.machine.clone()
    }

    pub fn logic(&self) -> Arc<dyn StrategyLogic> {
        self.logic.clone()
    }

    pub fn current_state(&self) -> StrategyState {
        self.machine.lock().expect("machine lock poisoned").state()
    }

    fn fire(&self, trigger: TransitionTrigger, data: Value) -> bool {
        self.machine
            .lock()
            .expect("machine lock poisoned")
            .trigger(trigger, &data)
    }

    async fn context(&self, now: NaiveDateTime) -> StrategyContext {
        StrategyContext {
            services: self.services.clone(),
            now,
            today: now.date(),
        }
    }

    async fn active_position(&self) -> Option<MultiLegPosition> {
        let held = self.state.lock().await.position_id;
        if let Some(id) = held {
            if let Some(position) = self.services.positions.get(id).await {
                return Some(position);
            }
        }
        // Recover after restart: adopt the first live position we own.
        let mine = self.services.positions.positions_for(self.logic.name()).await;
        let adopted = mine.into_iter().next();
        if let Some(position) = &adopted {
            self.state.lock().await.position_id = Some(position.id);
        }
        adopted
    }

    async fn step_ready(&self, ctx: &StrategyContext) {
        let in_window = self
            .logic
            .window()
            .is_none_or(|w| w.contains(ctx.now.time()));
        if in_window && self.services.market.is_market_open(self.logic.underlying()).await {
            self.fire(TransitionTrigger::TimeWindowStart, Value::Null);
        }
    }

    /// Analyze: entry conditions, then the non-negotiable gates in order:
    /// unanimous risk vote, concentration allocation, VIX-adjusted sizing.
    async fn step_analyzing(&self, ctx: &StrategyContext) -> Result<(), String> {
        let Some(plan) = self.logic.check_entry_conditions(ctx).await? else {
            self.fire(TransitionTrigger::EntryConditionsFailed, Value::Null);
            return Ok(());
        };

        let account = self.services.broker.account().await;
        let sized = self
            .services
            .sizer
            .recommended_contracts(self.logic.name(), plan.max_loss_per_contract, &account)
            .await;
        let quantity = plan.quantity.min(sized);
        if quantity <= 0 {
            debug!(strategy = self.logic.name(), "sized to zero, standing down");
            self.fire(TransitionTrigger::EntryConditionsFailed, Value::Null);
            return Ok(());
        }

        let min_dte = plan
            .legs
            .iter()
            .map(|leg| leg.contract.dte(ctx.today))
            .min();
        let request = PositionRequest {
            strategy_id: self.logic.name().to_string(),
            symbol: self.logic.underlying().to_string(),
            quantity,
            delta: plan.delta_estimate * quantity as f64,
            dte: min_dte,
            is_short_option: plan.legs.iter().any(|leg| leg.quantity < 0),
            account: account.clone(),
            today: ctx.today,
        };

        if self.services.concentration.covers(self.logic.underlying()) {
            let granted = self
                .services
                .concentration
                .request_allocation(
                    self.logic.name(),
                    &plan.tag,
                    plan.delta_estimate * quantity as f64,
                    quantity,
                    Utc::now(),
                )
                .await;
            if !granted {
                info!(strategy = self.logic.name(), "concentration allocation refused");
                self.fire(TransitionTrigger::EntryConditionsFailed, Value::Null);
                return Ok(());
            }
        }

        let vote = self.services.risk.can_open_position(&request).await;
        if let Some(reason) = vote.reason() {
            // Risk veto never raises; the strategy simply stands down.
            info!(strategy = self.logic.name(), reason, "risk veto");
            self.services
                .concentration
                .release_allocation(self.logic.name())
                .await;
            self.fire(TransitionTrigger::EntryConditionsFailed, Value::Null);
            return Ok(());
        }

        self.state.lock().await.pending = Some((plan, quantity));
        self.fire(TransitionTrigger::EntryConditionsMet, Value::Null);
        Ok(())
    }

    async fn step_entering(&self, ctx: &StrategyContext) -> Result<(), String> {
        let Some((plan, quantity)) = self.state.lock().await.pending.take() else {
            self.fire(TransitionTrigger::OrderRejected, Value::Null);
            return Ok(());
        };
        match self.logic.place_entry_orders(ctx, &plan, quantity).await? {
            Some(position_id) => {
                self.state.lock().await.position_id = Some(position_id);
                if let Some(position) = self.services.positions.get(position_id).await {
                    self.services.risk.on_position_opened(&position).await;
                }
                self.fire(TransitionTrigger::OrderFilled, Value::Null);
            }
            None => {
                warn!(strategy = self.logic.name(), "entry failed, no residual legs");
                self.services
                    .concentration
                    .release_allocation(self.logic.name())
                    .await;
                self.fire(TransitionTrigger::OrderRejected, Value::Null);
            }
        }
        Ok(())
    }

    async fn step_managing(&self, ctx: &StrategyContext) -> Result<(), String> {
        let Some(position) = self.active_position().await else {
            // Nothing left to manage; treat as done.
            self.fire(TransitionTrigger::TimeWindowEnd, Value::Null);
            return Ok(());
        };

        // Defensive exit first: it overrides margin pressure, correlation
        // state, profit, everything.
        if self.logic.defensive_exit_applies()
            && let Some(short_dte) = position
            .open_components()
            .filter(|c| c.is_short())
            .map(|c| c.dte(ctx.today))
            .min()
        {
            let due = short_dte > 0 || ctx.now.time() >= same_day_defense_cutoff();
            if short_dte <= DEFENSE_DTE && due {
                info!(
                    strategy = self.logic.name(),
                    short_dte, "defensive exit triggered"
                );
                self.fire(TransitionTrigger::DefensiveExitDte, json!({"dte": short_dte}));
                return Ok(());
            }
        }

        if let Some(trigger) = self.profit_stop_trigger(&position) {
            self.fire(trigger, Value::Null);
            return Ok(());
        }

        match self.logic.manage_position(ctx, &position).await? {
            ManageAction::Hold => {}
            ManageAction::Exit(trigger) => {
                self.fire(trigger, Value::Null);
            }
            ManageAction::Adjust => {
                self.fire(TransitionTrigger::AdjustmentNeeded, Value::Null);
            }
        }
        Ok(())
    }

    /// Credit hit: (credit - cost)/credit >= target. Debit mirrors it on
    /// the position's value instead of its cost.
    fn profit_stop_trigger(&self, position: &MultiLegPosition) -> Option<TransitionTrigger> {
        let entry = position.entry_premium().to_f64().unwrap_or(0.0);
        let close_cost = position.current_close_cost().to_f64().unwrap_or(0.0);
        let (basis, pnl_frac) = if self.logic.is_credit() {
            let credit = entry;
            (credit, (credit - close_cost) / credit.abs().max(f64::EPSILON))
        } else {
            let debit = -entry;
            let value = -close_cost;
            (debit, (value - debit) / debit.abs().max(f64::EPSILON))
        };
        if basis <= 0.0 {
            return None;
        }
        if pnl_frac >= self.logic.profit_target() {
            return Some(TransitionTrigger::ProfitTargetHit);
        }
        if let Some(stop) = self.logic.stop_loss() {
            if -pnl_frac >= stop.abs() {
                return Some(TransitionTrigger::StopLossHit);
            }
        }
        None
    }

    async fn step_exiting(&self, ctx: &StrategyContext) -> Result<(), String> {
        let Some(position) = self.active_position().await else {
            self.fire(TransitionTrigger::OrderFilled, Value::Null);
            return Ok(());
        };
        if !self.logic.place_exit_orders(ctx, position.id).await? {
            return Err("exit orders failed".to_string());
        }
        let pnl = position.total_pnl();
        self.services.risk.on_position_closed(&position, pnl).await;
        self.services
            .performance
            .record_trade(self.logic.name(), pnl, Utc::now())
            .await;
        self.state.lock().await.position_id = None;
        self.fire(TransitionTrigger::OrderFilled, Value::Null);
        self.logic.cleanup_after_close(ctx).await?;
        Ok(())
    }

    /// Resume only once every suspension cause has cleared: emergency flag,
    /// volatility spike, and margin pressure.
    async fn step_suspended(&self, _ctx: &StrategyContext) {
        let vix = self.services.vix.current_vix().await;
        let account = self.services.broker.account().await;
        if !self.services.risk.is_emergency() && vix <= 35.0 && account.margin_ratio() <= 0.80 {
            self.fire(TransitionTrigger::MarketOpen, Value::Null);
        }
    }

    fn step_error(&self) {
        let mut machine = self.machine.lock().expect("machine lock poisoned");
        if machine.is_recoverable() {
            machine.trigger(TransitionTrigger::MarketOpen, &json!({"recovered": true}));
        }
    }
}

#[async_trait]
impl CoordinatedStrategy for StrategyRunner {
    fn name(&self) -> &str {
        self.logic.name()
    }

    /// One lifecycle step, dispatched on the current state. Errors surface
    /// as `SystemError` transitions, never as panics.
    async fn execute(&self, now: NaiveDateTime) -> Result<(), String> {
        let ctx = self.context(now).await;
        let state = self.current_state();
        let result = match state {
            StrategyState::Initializing => {
                if self.services.market.is_market_open(self.logic.underlying()).await {
                    self.fire(TransitionTrigger::MarketOpen, Value::Null);
                }
                Ok(())
            }
            StrategyState::Ready => {
                self.step_ready(&ctx).await;
                Ok(())
            }
            StrategyState::Analyzing => self.step_analyzing(&ctx).await,
            StrategyState::PendingEntry | StrategyState::Entering => {
                self.step_entering(&ctx).await
            }
            StrategyState::PositionOpen => {
                self.fire(TransitionTrigger::MarketOpen, Value::Null);
                Ok(())
            }
            StrategyState::Managing => self.step_managing(&ctx).await,
            StrategyState::Adjusting => {
                let position_id = self.state.lock().await.position_id;
                if let Some(position_id) = position_id {
                    self.logic.adjust_position(&ctx, position_id).await?;
                }
                self.fire(TransitionTrigger::OrderFilled, Value::Null);
                Ok(())
            }
            StrategyState::PendingExit | StrategyState::Exiting => self.step_exiting(&ctx).await,
            StrategyState::Closed => Ok(()),
            StrategyState::Suspended => {
                self.step_suspended(&ctx).await;
                Ok(())
            }
            StrategyState::Error => {
                self.step_error();
                Ok(())
            }
        };
        if let Err(reason) = &result {
            warn!(strategy = self.logic.name(), reason, "lifecycle step failed");
            self.fire(TransitionTrigger::SystemError, json!({"reason": reason}));
        }
        result
    }
}

/// Shared entry placement: submit atomically, then record the components
/// under a new position (or attach to `target_position`).
pub async fn default_place_entry(
    ctx: &StrategyContext,
    strategy_id: &str,
    underlying: &str,
    plan: &EntryPlan,
    quantity: i64,
) -> Result<Option<Uuid>, String> {
    let services = &ctx.services;
    let Some(fills) = services
        .executor
        .execute_atomic(&plan.legs, quantity, &plan.tag)
        .await
    else {
        return Ok(None);
    };

    let components: Vec<PositionComponent> = fills
        .iter()
        .map(|fill| {
            let mut component = PositionComponent::new(
                strategy_id,
                fill.leg.role,
                fill.leg.contract.clone(),
                fill.leg.quantity * quantity,
                fill.fill_price,
            );
            component.status = ComponentStatus::Open;
            component.order_link = Some(fill.ticket.order_id);
            component.filled_at = Some(Utc::now());
            component
        })
        .collect();

    let position_id = match plan.target_position {
        Some(position_id) => {
            for component in components {
                services
                    .positions
                    .add_component(position_id, component)
                    .await
                    .map_err(|e| e.to_string())?;
            }
            position_id
        }
        None => {
            services
                .positions
                .open_position(strategy_id, underlying, components)
                .await
        }
    };
    Ok(Some(position_id))
}

/// Shared exit placement: reverse every open leg atomically, then close the
/// position record.
pub async fn default_place_exit(
    ctx: &StrategyContext,
    position_id: Uuid,
    tag: &str,
) -> Result<bool, String> {
    let services = &ctx.services;
    let Some(position) = services.positions.get(position_id).await else {
        return Ok(true);
    };
    let legs: Vec<OrderLeg> = position
        .open_components()
        .map(|component| OrderLeg {
            contract: component.contract.clone(),
            quantity: -component.quantity,
            role: component.role,
            limit_price: Some(component.current_price),
        })
        .collect();
    if !legs.is_empty()
        && services
            .executor
            .execute_atomic(&legs, 1, tag)
            .await
            .is_none()
    {
        return Ok(false);
    }
    services
        .positions
        .close_position(position_id)
        .await
        .map_err(|e| e.to_string())?;
    Ok(true)
}
