use crate::application::risk::{
    PluginError, PluginVote, PositionRequest, RiskCheckContext, RiskPlugin,
};
use crate::domain::events::{RiskEvent, RiskEventKind, RiskLevel};
use crate::domain::positions::MultiLegPosition;
use crate::domain::vix::AccountPhase;
use async_trait::async_trait;
use rust_decimal::Decimal;
use serde_json::{Map, Value, json};
use std::collections::{HashMap, HashSet};
use tokio::sync::RwLock;
use uuid::Uuid;

/// The 21-DTE defense rule is absolute: it overrides margin pressure,
/// correlation state, and unrealised profit.
pub const DEFENSE_DTE: i64 = 21;

/// Inputs to the defense decision. Only `dte` matters.
#[derive(Debug, Clone, Copy)]
pub struct DefenseInfo {
    pub dte: i64,
    pub margin_ratio: f64,
    pub unrealized_pnl_pct: f64,
}

#[derive(Debug, Clone)]
pub struct CorrelationGroup {
    pub name: &'static str,
    pub symbols: HashSet<&'static str>,
}

fn default_groups() -> Vec<CorrelationGroup> {
    vec![
        CorrelationGroup {
            name: "equity_index",
            symbols: ["SPY", "QQQ", "IWM", "SPX", "XSP", "/ES", "/MES", "/NQ", "ES", "MES", "NQ"]
                .into_iter()
                .collect(),
        },
        CorrelationGroup {
            name: "metals",
            symbols: ["GLD", "SLV", "/GC", "/SI", "GC", "SI"].into_iter().collect(),
        },
        CorrelationGroup {
            name: "energy",
            symbols: ["USO", "XLE", "/CL", "CL"].into_iter().collect(),
        },
        CorrelationGroup {
            name: "bonds",
            symbols: ["TLT", "/ZB", "ZB"].into_iter().collect(),
        },
    ]
}

/// Maximum concurrent positions inside one correlation group, by phase.
fn group_cap(phase: AccountPhase) -> usize {
    match phase {
        AccountPhase::BelowMinimum => 0,
        AccountPhase::Phase1 => 2,
        AccountPhase::Phase2 => 3,
        AccountPhase::Phase3 => 4,
        AccountPhase::Phase4 => 5,
    }
}

/// Rejects positions whose addition would overfill a correlation group for
/// the current account phase.
pub struct CorrelationPlugin {
    groups: Vec<CorrelationGroup>,
    open_by_group: RwLock<HashMap<&'static str, HashSet<Uuid>>>,
}

impl CorrelationPlugin {
    pub fn new() -> Self {
        Self {
            groups: default_groups(),
            open_by_group: RwLock::new(HashMap::new()),
        }
    }

    fn group_of(&self, symbol: &str) -> Option<&'static str> {
        self.groups
            .iter()
            .find(|g| g.symbols.contains(symbol))
            .map(|g| g.name)
    }

    /// Absolute defense rule: defend any short option at or under 21 DTE,
    /// regardless of every other input.
    pub fn should_defend(&self, info: &DefenseInfo) -> bool {
        info.dte <= DEFENSE_DTE
    }
}

impl Default for CorrelationPlugin {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RiskPlugin for CorrelationPlugin {
    fn name(&self) -> &str {
        "correlation"
    }

    async fn can_open_position(&self, request: &PositionRequest) -> Result<PluginVote, PluginError> {
        let Some(group) = self.group_of(&request.symbol) else {
            return Ok(PluginVote::Approve);
        };
        let phase = AccountPhase::from_portfolio_value(request.account.portfolio_value);
        let cap = group_cap(phase);
        let current = self
            .open_by_group
            .read()
            .await
            .get(group)
            .map_or(0, HashSet::len);
        if current + 1 > cap {
            return Ok(PluginVote::Reject(format!(
                "correlation group {group} at {current}/{cap} positions for {phase:?}"
            )));
        }
        Ok(PluginVote::Approve)
    }

    async fn on_position_opened(&self, position: &MultiLegPosition) -> Result<(), PluginError> {
        if let Some(group) = self.group_of(&position.underlying) {
            self.open_by_group
                .write()
                .await
                .entry(group)
                .or_default()
                .insert(position.id);
        }
        Ok(())
    }

    async fn on_position_closed(
        &self,
        position: &MultiLegPosition,
        _pnl: Decimal,
    ) -> Result<(), PluginError> {
        if let Some(group) = self.group_of(&position.underlying) {
            if let Some(set) = self.open_by_group.write().await.get_mut(group) {
                set.remove(&position.id);
            }
        }
        Ok(())
    }

    async fn periodic_check(&self, ctx: &RiskCheckContext) -> Result<Vec<RiskEvent>, PluginError> {
        let phase = AccountPhase::from_portfolio_value(ctx.account.portfolio_value);
        let cap = group_cap(phase);
        let counts = self.open_by_group.read().await;
        let mut events = Vec::new();
        for (group, positions) in counts.iter() {
            if positions.len() > cap {
                events.push(
                    RiskEvent::new(
                        RiskEventKind::CorrelationLimitExceeded,
                        RiskLevel::Warning,
                        format!("correlation group {group} over cap: {}/{cap}", positions.len()),
                    )
                    .with_data("group", json!(group))
                    .with_data("count", json!(positions.len())),
                );
            }
        }
        Ok(events)
    }

    async fn risk_metrics(&self) -> Map<String, Value> {
        let counts = self.open_by_group.read().await;
        let mut metrics = Map::new();
        for (group, positions) in counts.iter() {
            metrics.insert(group.to_string(), Value::from(positions.len()));
        }
        metrics
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ports::AccountSnapshot;
    use chrono::NaiveDate;
    use rust_decimal_macros::dec;

    fn request(symbol: &str, portfolio_value: Decimal) -> PositionRequest {
        PositionRequest {
            strategy_id: "s".to_string(),
            symbol: symbol.to_string(),
            quantity: 1,
            delta: 0.0,
            dte: None,
            is_short_option: true,
            account: AccountSnapshot {
                portfolio_value,
                cash: dec!(10000),
                margin_used: dec!(0),
                margin_remaining: dec!(0),
                buying_power: dec!(10000),
            },
            today: NaiveDate::from_ymd_opt(2024, 3, 1).unwrap(),
        }
    }

    #[tokio::test]
    async fn group_cap_rejects_at_phase1_limit() {
        let plugin = CorrelationPlugin::new();
        // Phase 1 account: cap of 2 per group.
        let value = dec!(40000);

        let spy = MultiLegPosition::new("a", "SPY");
        let qqq = MultiLegPosition::new("b", "QQQ");
        plugin.on_position_opened(&spy).await.unwrap();
        plugin.on_position_opened(&qqq).await.unwrap();

        let vote = plugin.can_open_position(&request("/ES", value)).await.unwrap();
        assert!(!vote.is_approved());
        assert!(vote.reason().unwrap().contains("equity_index"));

        // A different group is unaffected.
        let vote = plugin.can_open_position(&request("GLD", value)).await.unwrap();
        assert!(vote.is_approved());
    }

    #[tokio::test]
    async fn closing_frees_group_capacity() {
        let plugin = CorrelationPlugin::new();
        let value = dec!(40000);
        let spy = MultiLegPosition::new("a", "SPY");
        let qqq = MultiLegPosition::new("b", "QQQ");
        plugin.on_position_opened(&spy).await.unwrap();
        plugin.on_position_opened(&qqq).await.unwrap();
        plugin.on_position_closed(&qqq, dec!(0)).await.unwrap();

        let vote = plugin.can_open_position(&request("/ES", value)).await.unwrap();
        assert!(vote.is_approved());
    }

    #[tokio::test]
    async fn higher_phase_raises_cap() {
        let plugin = CorrelationPlugin::new();
        let spy = MultiLegPosition::new("a", "SPY");
        let qqq = MultiLegPosition::new("b", "QQQ");
        plugin.on_position_opened(&spy).await.unwrap();
        plugin.on_position_opened(&qqq).await.unwrap();

        // Phase 4 cap is 5.
        let vote = plugin
            .can_open_position(&request("/ES", dec!(150000)))
            .await
            .unwrap();
        assert!(vote.is_approved());
    }

    #[tokio::test]
    async fn unknown_symbol_is_ungrouped() {
        let plugin = CorrelationPlugin::new();
        let vote = plugin
            .can_open_position(&request("AAPL", dec!(40000)))
            .await
            .unwrap();
        assert!(vote.is_approved());
    }

    #[test]
    fn defense_rule_is_absolute() {
        let plugin = CorrelationPlugin::new();
        // 21 DTE with heavy margin pressure and a healthy profit: defend.
        assert!(plugin.should_defend(&DefenseInfo {
            dte: 21,
            margin_ratio: 0.85,
            unrealized_pnl_pct: 0.10,
        }));
        assert!(plugin.should_defend(&DefenseInfo {
            dte: 5,
            margin_ratio: 0.0,
            unrealized_pnl_pct: -0.50,
        }));
        assert!(!plugin.should_defend(&DefenseInfo {
            dte: 22,
            margin_ratio: 0.99,
            unrealized_pnl_pct: 0.0,
        }));
    }
}
