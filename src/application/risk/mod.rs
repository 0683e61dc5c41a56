pub mod circuit_breaker;
pub mod concentration;
pub mod correlation;

use crate::domain::events::{RiskEvent, RiskLevel};
use crate::domain::ports::{AccountSnapshot, BrokerAdapter};
use crate::domain::positions::MultiLegPosition;
use crate::infrastructure::event_bus::EventBus;
use crate::payload;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde_json::{Map, Value};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use tokio::sync::{Mutex, RwLock};
use tracing::{error, info, warn};

/// Callback failures count toward a plugin's disable budget.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct PluginError(pub String);

/// Errors before a plugin is disabled and its vote forced to reject.
const PLUGIN_ERROR_BUDGET: u32 = 10;

/// One position attempt, as presented to every plugin.
#[derive(Debug, Clone)]
pub struct PositionRequest {
    pub strategy_id: String,
    pub symbol: String,
    pub quantity: i64,
    /// Estimated net delta the position would add.
    pub delta: f64,
    pub dte: Option<i64>,
    pub is_short_option: bool,
    pub account: AccountSnapshot,
    pub today: NaiveDate,
}

/// Verdict from a single plugin. Any rejection is final and carries a reason.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PluginVote {
    Approve,
    Reject(String),
}

impl PluginVote {
    pub fn is_approved(&self) -> bool {
        matches!(self, PluginVote::Approve)
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            PluginVote::Approve => None,
            PluginVote::Reject(reason) => Some(reason),
        }
    }
}

/// Shared inputs for periodic checks and reset decisions.
#[derive(Debug, Clone)]
pub struct RiskCheckContext {
    pub account: AccountSnapshot,
    pub positions: Vec<MultiLegPosition>,
    pub vix: f64,
    pub now: DateTime<Utc>,
    pub today: NaiveDate,
}

/// A pluggable risk policy. Plugins hold no references to each other; they
/// communicate only through the event bus.
#[async_trait]
pub trait RiskPlugin: Send + Sync {
    fn name(&self) -> &str;

    fn version(&self) -> &str {
        "1.0.0"
    }

    async fn initialize(&self, _bus: Arc<EventBus>) -> Result<(), PluginError> {
        Ok(())
    }

    async fn can_open_position(&self, request: &PositionRequest) -> Result<PluginVote, PluginError>;

    async fn on_position_opened(&self, _position: &MultiLegPosition) -> Result<(), PluginError> {
        Ok(())
    }

    async fn on_position_closed(
        &self,
        _position: &MultiLegPosition,
        _pnl: Decimal,
    ) -> Result<(), PluginError> {
        Ok(())
    }

    async fn on_market_data(&self, _symbol: &str, _price: Decimal) -> Result<(), PluginError> {
        Ok(())
    }

    async fn periodic_check(&self, _ctx: &RiskCheckContext) -> Result<Vec<RiskEvent>, PluginError> {
        Ok(Vec::new())
    }

    /// Whether this plugin's recovery conditions allow an emergency reset.
    async fn can_reset(&self, _ctx: &RiskCheckContext) -> bool {
        true
    }

    /// Clear internal trip state after a granted reset.
    async fn reset_emergency(&self) {}

    async fn risk_metrics(&self) -> Map<String, Value> {
        Map::new()
    }

    async fn shutdown(&self) {}
}

struct PluginSlot {
    plugin: Arc<dyn RiskPlugin>,
    errors: AtomicU32,
    disabled: AtomicBool,
}

impl PluginSlot {
    fn note_error(&self, err: &PluginError) {
        let count = self.errors.fetch_add(1, Ordering::SeqCst) + 1;
        warn!(plugin = self.plugin.name(), %err, count, "plugin callback failed");
        if count >= PLUGIN_ERROR_BUDGET && !self.disabled.swap(true, Ordering::SeqCst) {
            error!(plugin = self.plugin.name(), "plugin disabled after repeated failures");
        }
    }

    fn is_disabled(&self) -> bool {
        self.disabled.load(Ordering::SeqCst)
    }
}

/// Authoritative go/no-go oracle for every position attempt. Approval
/// requires a unanimous plugin vote; the first rejection is propagated.
pub struct UnifiedRiskManager {
    plugins: RwLock<Vec<PluginSlot>>,
    emergency: AtomicBool,
    emergency_reason: Mutex<Option<String>>,
    bus: Arc<EventBus>,
    broker: Arc<dyn BrokerAdapter>,
}

impl UnifiedRiskManager {
    pub fn new(bus: Arc<EventBus>, broker: Arc<dyn BrokerAdapter>) -> Self {
        Self {
            plugins: RwLock::new(Vec::new()),
            emergency: AtomicBool::new(false),
            emergency_reason: Mutex::new(None),
            bus,
            broker,
        }
    }

    pub async fn register_plugin(&self, plugin: Arc<dyn RiskPlugin>) -> Result<(), PluginError> {
        plugin.initialize(self.bus.clone()).await?;
        info!(plugin = plugin.name(), version = plugin.version(), "risk plugin registered");
        self.plugins.write().await.push(PluginSlot {
            plugin,
            errors: AtomicU32::new(0),
            disabled: AtomicBool::new(false),
        });
        Ok(())
    }

    pub fn is_emergency(&self) -> bool {
        self.emergency.load(Ordering::SeqCst)
    }

    pub async fn plugin_count(&self) -> usize {
        self.plugins.read().await.len()
    }

    /// Unanimous vote over every registered plugin. A disabled plugin votes
    /// reject (fail-safe); a throwing plugin is counted and votes reject.
    pub async fn can_open_position(&self, request: &PositionRequest) -> PluginVote {
        if self.is_emergency() {
            let reason = self
                .emergency_reason
                .lock()
                .await
                .clone()
                .unwrap_or_else(|| "unspecified".to_string());
            return PluginVote::Reject(format!("Emergency mode active: {reason}"));
        }

        let plugins = self.plugins.read().await;
        for slot in plugins.iter() {
            if slot.is_disabled() {
                return PluginVote::Reject("plugin disabled".to_string());
            }
            match slot.plugin.can_open_position(request).await {
                Ok(PluginVote::Approve) => {}
                Ok(PluginVote::Reject(reason)) => {
                    warn!(
                        plugin = slot.plugin.name(),
                        strategy = %request.strategy_id,
                        symbol = %request.symbol,
                        reason,
                        "position vetoed"
                    );
                    return PluginVote::Reject(reason);
                }
                Err(err) => {
                    slot.note_error(&err);
                    return PluginVote::Reject(format!("plugin error: {err}"));
                }
            }
        }
        PluginVote::Approve
    }

    pub async fn on_position_opened(&self, position: &MultiLegPosition) {
        let plugins = self.plugins.read().await;
        for slot in plugins.iter().filter(|s| !s.is_disabled()) {
            if let Err(err) = slot.plugin.on_position_opened(position).await {
                slot.note_error(&err);
            }
        }
    }

    pub async fn on_position_closed(&self, position: &MultiLegPosition, pnl: Decimal) {
        let plugins = self.plugins.read().await;
        for slot in plugins.iter().filter(|s| !s.is_disabled()) {
            if let Err(err) = slot.plugin.on_position_closed(position, pnl).await {
                slot.note_error(&err);
            }
        }
    }

    pub async fn on_market_data(&self, symbol: &str, price: Decimal) {
        let plugins = self.plugins.read().await;
        for slot in plugins.iter().filter(|s| !s.is_disabled()) {
            if let Err(err) = slot.plugin.on_market_data(symbol, price).await {
                slot.note_error(&err);
            }
        }
    }

    /// Run every plugin's periodic check; Emergency-level events drive the
    /// manager into emergency handling.
    pub async fn perform_periodic_checks(&self, ctx: &RiskCheckContext) -> Vec<RiskEvent> {
        let mut events = Vec::new();
        {
            let plugins = self.plugins.read().await;
            for slot in plugins.iter().filter(|s| !s.is_disabled()) {
                match slot.plugin.periodic_check(ctx).await {
                    Ok(mut plugin_events) => events.append(&mut plugin_events),
                    Err(err) => slot.note_error(&err),
                }
            }
        }
        for event in &events {
            self.bus
                .publish(
                    event.kind.event_type(),
                    payload! {
                        "reason" => event.message.clone(),
                        "level" => format!("{:?}", event.level),
                        "metrics" => Value::Object(event.data.clone()),
                    },
                    "risk_manager",
                )
                .await;
            if event.level == RiskLevel::Emergency {
                self.enter_emergency(&event.message, &ctx.positions).await;
            }
        }
        events
    }

    /// Operator-facing reset. Grants only when every plugin's recovery
    /// conditions are met.
    pub async fn reset_emergency_mode(&self, reason: &str, ctx: &RiskCheckContext) -> bool {
        let plugins = self.plugins.read().await;
        for slot in plugins.iter().filter(|s| !s.is_disabled()) {
            if !slot.plugin.can_reset(ctx).await {
                warn!(
                    plugin = slot.plugin.name(),
                    "emergency reset refused: recovery conditions not met"
                );
                return false;
            }
        }
        for slot in plugins.iter() {
            slot.plugin.reset_emergency().await;
        }
        drop(plugins);

        self.emergency.store(false, Ordering::SeqCst);
        *self.emergency_reason.lock().await = None;
        info!(reason, "emergency mode reset");
        self.bus
            .publish(
                crate::domain::events::EventType::RecoveryConditionsMet,
                payload! {"reason" => reason},
                "risk_manager",
            )
            .await;
        true
    }

    pub async fn risk_metrics(&self) -> Map<String, Value> {
        let mut combined = Map::new();
        let plugins = self.plugins.read().await;
        for slot in plugins.iter() {
            let mut metrics = slot.plugin.risk_metrics().await;
            metrics.insert(
                "errors".to_string(),
                Value::from(slot.errors.load(Ordering::SeqCst)),
            );
            metrics.insert("disabled".to_string(), Value::from(slot.is_disabled()));
            combined.insert(slot.plugin.name().to_string(), Value::Object(metrics));
        }
        combined.insert("emergency".to_string(), Value::from(self.is_emergency()));
        combined
    }

    pub async fn shutdown(&self) {
        let plugins = self.plugins.read().await;
        for slot in plugins.iter() {
            slot.plugin.shutdown().await;
        }
    }

    /// Set the emergency flag, cancel pending orders, and close every
    /// position holding an open short option (unlimited-risk first).
    async fn enter_emergency(&self, reason: &str, positions: &[MultiLegPosition]) {
        if self.emergency.swap(true, Ordering::SeqCst) {
            return; // already handling
        }
        *self.emergency_reason.lock().await = Some(reason.to_string());
        error!(reason, "EMERGENCY: halting new risk, liquidating short options");

        for ticket in self.broker.open_orders().await {
            if let Err(err) = self.broker.cancel(ticket.order_id).await {
                warn!(order = %ticket.order_id, %err, "cancel failed during emergency");
            }
        }
        for position in positions {
            if !position.has_open_short_option() {
                continue;
            }
            for component in position.open_components() {
                if !component.is_short() {
                    continue;
                }
                let symbol = component.contract.symbol();
                if let Err(err) = self
                    .broker
                    .market_order(&symbol, -component.quantity, "emergency_close")
                    .await
                {
                    error!(%symbol, %err, "emergency close failed");
                }
            }
        }
        self.bus
            .publish(
                crate::domain::events::EventType::EmergencyHalt,
                payload! {"reason" => reason},
                "risk_manager",
            )
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::mock::MockBroker;
    use rust_decimal_macros::dec;

    struct AlwaysApprove;

    #[async_trait]
    impl RiskPlugin for AlwaysApprove {
        fn name(&self) -> &str {
            "approve"
        }

        async fn can_open_position(
            &self,
            _request: &PositionRequest,
        ) -> Result<PluginVote, PluginError> {
            Ok(PluginVote::Approve)
        }
    }

    struct AlwaysReject;

    #[async_trait]
    impl RiskPlugin for AlwaysReject {
        fn name(&self) -> &str {
            "reject"
        }

        async fn can_open_position(
            &self,
            _request: &PositionRequest,
        ) -> Result<PluginVote, PluginError> {
            Ok(PluginVote::Reject("position limit".to_string()))
        }
    }

    struct AlwaysError;

    #[async_trait]
    impl RiskPlugin for AlwaysError {
        fn name(&self) -> &str {
            "broken"
        }

        async fn can_open_position(
            &self,
            _request: &PositionRequest,
        ) -> Result<PluginVote, PluginError> {
            Err(PluginError("boom".to_string()))
        }
    }

    fn request() -> PositionRequest {
        PositionRequest {
            strategy_id: "zero_dte".to_string(),
            symbol: "SPY".to_string(),
            quantity: 1,
            delta: 5.0,
            dte: Some(0),
            is_short_option: true,
            account: AccountSnapshot {
                portfolio_value: dec!(100000),
                cash: dec!(50000),
                margin_used: dec!(20000),
                margin_remaining: dec!(30000),
                buying_power: dec!(60000),
            },
            today: chrono::NaiveDate::from_ymd_opt(2024, 3, 1).unwrap(),
        }
    }

    fn manager() -> UnifiedRiskManager {
        UnifiedRiskManager::new(Arc::new(EventBus::new()), Arc::new(MockBroker::new()))
    }

    #[tokio::test]
    async fn unanimous_vote_approves() {
        let risk = manager();
        risk.register_plugin(Arc::new(AlwaysApprove)).await.unwrap();
        risk.register_plugin(Arc::new(AlwaysApprove)).await.unwrap();
        assert!(risk.can_open_position(&request()).await.is_approved());
    }

    #[tokio::test]
    async fn single_rejection_is_final() {
        let risk = manager();
        risk.register_plugin(Arc::new(AlwaysApprove)).await.unwrap();
        risk.register_plugin(Arc::new(AlwaysReject)).await.unwrap();
        let vote = risk.can_open_position(&request()).await;
        assert_eq!(vote.reason(), Some("position limit"));
    }

    #[tokio::test]
    async fn plugin_disables_after_error_budget() {
        let risk = manager();
        risk.register_plugin(Arc::new(AlwaysError)).await.unwrap();
        for _ in 0..PLUGIN_ERROR_BUDGET {
            let vote = risk.can_open_position(&request()).await;
            assert!(!vote.is_approved());
            assert!(vote.reason().unwrap().starts_with("plugin error"));
        }
        // Disabled now: fail-safe vote.
        let vote = risk.can_open_position(&request()).await;
        assert_eq!(vote.reason(), Some("plugin disabled"));
    }

    #[tokio::test]
    async fn metrics_include_plugin_health() {
        let risk = manager();
        risk.register_plugin(Arc::new(AlwaysApprove)).await.unwrap();
        let metrics = risk.risk_metrics().await;
        let plugin = metrics.get("approve").unwrap().as_object().unwrap();
        assert_eq!(plugin.get("errors").unwrap().as_u64(), Some(0));
        assert_eq!(plugin.get("disabled").unwrap().as_bool(), Some(false));
    }
}
