use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::debug;

/// Per-strategy trade statistics.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StrategyStats {
    pub trades: u32,
    pub wins: u32,
    pub losses: u32,
    pub consecutive_losses: u32,
    pub realized_pnl: Decimal,
    pub gross_wins: Decimal,
    pub gross_losses: Decimal,
    pub last_trade_at: Option<DateTime<Utc>>,
}

impl StrategyStats {
    pub fn win_rate(&self) -> Option<f64> {
        if self.trades == 0 {
            return None;
        }
        Some(self.wins as f64 / self.trades as f64)
    }

    /// Average win and average loss in absolute dollars.
    pub fn avg_win_loss(&self) -> Option<(f64, f64)> {
        if self.wins == 0 || self.losses == 0 {
            return None;
        }
        let avg_win = (self.gross_wins / Decimal::from(self.wins))
            .to_f64()
            .unwrap_or(0.0);
        let avg_loss = (self.gross_losses / Decimal::from(self.losses))
            .to_f64()
            .unwrap_or(0.0)
            .abs();
        Some((avg_win, avg_loss))
    }
}

/// Per-strategy trade log feeding the position sizer (win rate, win/loss
/// magnitudes) and the state manager's persisted statistics.
pub struct PerformanceTracker {
    stats: RwLock<HashMap<String, StrategyStats>>,
}

impl PerformanceTracker {
    pub fn new() -> Self {
        Self {
            stats: RwLock::new(HashMap::new()),
        }
    }

    pub async fn record_trade(&self, strategy_id: &str, pnl: Decimal, at: DateTime<Utc>) {
        let mut stats = self.stats.write().await;
        let entry = stats.entry(strategy_id.to_string()).or_default();
        entry.trades += 1;
        entry.realized_pnl += pnl;
        entry.last_trade_at = Some(at);
        if pnl >= Decimal::ZERO {
            entry.wins += 1;
            entry.gross_wins += pnl;
            entry.consecutive_losses = 0;
        } else {
            entry.losses += 1;
            entry.gross_losses += pnl;
            entry.consecutive_losses += 1;
        }
        debug!(
            strategy = strategy_id,
            %pnl,
            trades = entry.trades,
            "trade recorded"
        );
    }

    pub async fn stats_for(&self, strategy_id: &str) -> Option<StrategyStats> {
        self.stats.read().await.get(strategy_id).cloned()
    }

    pub async fn total_realized_pnl(&self) -> Decimal {
        self.stats.read().await.values().map(|s| s.realized_pnl).sum()
    }

    /// Snapshot for the persisted state layout.
    pub async fn snapshot(&self) -> Value {
        let stats = self.stats.read().await;
        let mut map = serde_json::Map::new();
        for (strategy, entry) in stats.iter() {
            map.insert(
                strategy.clone(),
                serde_json::to_value(entry).unwrap_or(Value::Null),
            );
        }
        json!(map)
    }

    pub async fn restore(&self, snapshot: &Value) {
        let Some(map) = snapshot.as_object() else {
            return;
        };
        let mut stats = self.stats.write().await;
        for (strategy, value) in map {
            if let Ok(entry) = serde_json::from_value::<StrategyStats>(value.clone()) {
                stats.insert(strategy.clone(), entry);
            }
        }
    }
}

impl Default for PerformanceTracker {
    fn default() -> Self {
        Self::new()
    }
}
