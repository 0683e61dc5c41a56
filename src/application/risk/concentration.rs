use crate::application::risk::{
    PluginError, PluginVote, PositionRequest, RiskCheckContext, RiskPlugin,
};
use crate::domain::events::{RiskEvent, RiskEventKind, RiskLevel};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde_json::{Map, Value, json};
use std::collections::{HashMap, HashSet};
use tokio::sync::RwLock;
use tracing::{info, warn};

/// Allocations untouched this long are reclaimed as crashed/inactive.
const STALE_ALLOCATION: Duration = Duration::hours(24);

#[derive(Debug, Clone)]
pub struct ConcentrationConfig {
    /// Total absolute delta allocatable across strategies.
    pub max_total_delta: f64,
    /// Total contracts allocatable across strategies.
    pub max_total_contracts: i64,
}

impl Default for ConcentrationConfig {
    fn default() -> Self {
        Self {
            max_total_delta: 100.0,
            max_total_contracts: 40,
        }
    }
}

#[derive(Debug, Clone)]
struct Allocation {
    kind: String,
    delta: f64,
    contracts: i64,
    last_touch: DateTime<Utc>,
}

/// Tracks delta and contract budget allocated per strategy across the
/// SPY/ES complex. Strategies must request before entry and release on
/// exit; stale allocations are reclaimed by the periodic cleanup.
pub struct ConcentrationPlugin {
    config: ConcentrationConfig,
    complex: HashSet<&'static str>,
    allocations: RwLock<HashMap<String, Allocation>>,
}

impl ConcentrationPlugin {
    pub fn new(config: ConcentrationConfig) -> Self {
        Self {
            config,
            complex: ["SPY", "SPX", "XSP", "/ES", "/MES", "ES", "MES"]
                .into_iter()
                .collect(),
            allocations: RwLock::new(HashMap::new()),
        }
    }

    pub fn covers(&self, symbol: &str) -> bool {
        self.complex.contains(symbol)
    }

    /// Reserve delta/contract budget for a strategy. Rejected when the
    /// combined totals would exceed the caps.
    pub async fn request_allocation(
        &self,
        strategy_id: &str,
        kind: &str,
        delta: f64,
        contracts: i64,
        now: DateTime<Utc>,
    ) -> bool {
        let mut allocations = self.allocations.write().await;
        let (mut total_delta, mut total_contracts) = (0.0, 0i64);
        for (name, alloc) in allocations.iter() {
            if name != strategy_id {
                total_delta += alloc.delta.abs();
                total_contracts += alloc.contracts;
            }
        }
        let existing = allocations.get(strategy_id);
        let new_delta = existing.map_or(0.0, |a| a.delta.abs()) + delta.abs();
        let new_contracts = existing.map_or(0, |a| a.contracts) + contracts;

        if total_delta + new_delta > self.config.max_total_delta
            || total_contracts + new_contracts > self.config.max_total_contracts
        {
            warn!(
                strategy = strategy_id,
                delta, contracts, "concentration allocation refused"
            );
            return false;
        }
        allocations.insert(
            strategy_id.to_string(),
            Allocation {
                kind: kind.to_string(),
                delta: new_delta,
                contracts: new_contracts,
                last_touch: now,
            },
        );
        true
    }

    pub async fn release_allocation(&self, strategy_id: &str) {
        if self.allocations.write().await.remove(strategy_id).is_some() {
            info!(strategy = strategy_id, "concentration allocation released");
        }
    }

    /// Reclaim allocations from strategies that stopped touching them.
    pub async fn reclaim_stale(&self, now: DateTime<Utc>) -> usize {
        let mut allocations = self.allocations.write().await;
        let before = allocations.len();
        allocations.retain(|strategy, alloc| {
            let stale = now - alloc.last_touch > STALE_ALLOCATION;
            if stale {
                warn!(strategy, kind = %alloc.kind, "reclaiming stale concentration allocation");
            }
            !stale
        });
        before - allocations.len()
    }

    async fn touch(&self, strategy_id: &str, now: DateTime<Utc>) {
        if let Some(alloc) = self.allocations.write().await.get_mut(strategy_id) {
            alloc.last_touch = now;
        }
    }
}

impl Default for ConcentrationPlugin {
    fn default() -> Self {
        Self::new(ConcentrationConfig::default())
    }
}

#[async_trait]
impl RiskPlugin for ConcentrationPlugin {
    fn name(&self) -> &str {
        "concentration"
    }

    async fn can_open_position(&self, request: &PositionRequest) -> Result<PluginVote, PluginError> {
        if !self.covers(&request.symbol) {
            return Ok(PluginVote::Approve);
        }
        let allocations = self.allocations.read().await;
        match allocations.get(&request.strategy_id) {
            Some(alloc) if alloc.contracts >= request.quantity => {
                drop(allocations);
                self.touch(&request.strategy_id, Utc::now()).await;
                Ok(PluginVote::Approve)
            }
            Some(alloc) => Ok(PluginVote::Reject(format!(
                "concentration allocation too small for {}: {} < {}",
                request.strategy_id, alloc.contracts, request.quantity
            ))),
            None => Ok(PluginVote::Reject(format!(
                "no concentration allocation for {}",
                request.strategy_id
            ))),
        }
    }

    async fn periodic_check(&self, ctx: &RiskCheckContext) -> Result<Vec<RiskEvent>, PluginError> {
        let reclaimed = self.reclaim_stale(ctx.now).await;
        if reclaimed == 0 {
            return Ok(Vec::new());
        }
        Ok(vec![
            RiskEvent::new(
                RiskEventKind::ConcentrationLimitExceeded,
                RiskLevel::Info,
                format!("reclaimed {reclaimed} stale allocations"),
            )
            .with_data("reclaimed", json!(reclaimed)),
        ])
    }

    async fn risk_metrics(&self) -> Map<String, Value> {
        let allocations = self.allocations.read().await;
        let total_delta: f64 = allocations.values().map(|a| a.delta.abs()).sum();
        let total_contracts: i64 = allocations.values().map(|a| a.contracts).sum();
        let mut metrics = Map::new();
        metrics.insert("allocated_delta".to_string(), json!(total_delta));
        metrics.insert("allocated_contracts".to_string(), json!(total_contracts));
        metrics.insert("strategies".to_string(), json!(allocations.len()));
        metrics
    }
}
