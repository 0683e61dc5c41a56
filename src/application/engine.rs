use crate::application::coordinator::{CoordinatedStrategy, StrategyCoordinator};
use crate::application::execution::OrderMonitor;
use crate::application::optimizer::OnDataOptimizer;
use crate::application::risk::{RiskCheckContext, UnifiedRiskManager};
use crate::application::strategy_base::{StrategyRunner, StrategyServices};
use crate::application::system_state::UnifiedStateManager;
use crate::domain::events::{RiskEventKind, RiskLevel};
use crate::domain::ports::ObjectStore;
use crate::domain::states::TransitionTrigger;
use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

const DEFAULT_SAVE_INTERVAL_SECS: i64 = 300;

/// The per-tick pipeline: optimiser filter, system-state refresh, global
/// trigger checks, priority-ordered strategy execution, periodic risk
/// checks, order monitoring, periodic persistence.
pub struct TradingEngine {
    services: Arc<StrategyServices>,
    coordinator: Arc<StrategyCoordinator>,
    state_manager: Arc<UnifiedStateManager>,
    optimizer: Arc<OnDataOptimizer>,
    monitor: Arc<OrderMonitor>,
    risk: Arc<UnifiedRiskManager>,
    store: Arc<dyn ObjectStore>,
    runners: Vec<Arc<StrategyRunner>>,
    strategy_handles: Vec<Arc<dyn CoordinatedStrategy>>,
    last_save: Mutex<Option<DateTime<Utc>>>,
    save_interval: Duration,
}

impl TradingEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        services: Arc<StrategyServices>,
        coordinator: Arc<StrategyCoordinator>,
        state_manager: Arc<UnifiedStateManager>,
        optimizer: Arc<OnDataOptimizer>,
        monitor: Arc<OrderMonitor>,
        risk: Arc<UnifiedRiskManager>,
        store: Arc<dyn ObjectStore>,
        runners: Vec<Arc<StrategyRunner>>,
    ) -> Self {
        let strategy_handles: Vec<Arc<dyn CoordinatedStrategy>> = runners
            .iter()
            .map(|runner| runner.clone() as Arc<dyn CoordinatedStrategy>)
            .collect();
        Self {
            services,
            coordinator,
            state_manager,
            optimizer,
            monitor,
            risk,
            store,
            runners,
            strategy_handles,
            last_save: Mutex::new(None),
            save_interval: Duration::seconds(DEFAULT_SAVE_INTERVAL_SECS),
        }
    }

    pub fn runners(&self) -> &[Arc<StrategyRunner>] {
        &self.runners
    }

    /// Drive one tick of market data through the whole pipeline.
    pub async fn on_tick(&self, prices: &HashMap<String, Decimal>) {
        let market_time = self.services.market.market_time().await;
        let today = market_time.date();
        let now_utc = DateTime::<Utc>::from_naive_utc_and_offset(market_time, Utc);

        // 1. Event-driven filter: insignificant ticks skip recomputation
        //    but never the state machinery below.
        let significant = self.optimizer.on_data(prices, now_utc, today).await;
        if significant {
            for (symbol, price) in prices {
                self.risk.on_market_data(symbol, *price).await;
            }
            self.services.positions.update_prices(prices).await;
        }

        // 2. System state and global triggers.
        self.state_manager.update_system_state().await;
        self.state_manager.run_global_checks().await;

        // 3. Strategies in priority order.
        self.coordinator
            .execute_strategies(&self.strategy_handles, market_time)
            .await;

        // 4. Periodic risk checks; correlation breaches feed the global
        //    trigger path.
        let ctx = self.risk_context(now_utc).await;
        let events = self.risk.perform_periodic_checks(&ctx).await;
        for event in &events {
            if event.kind == RiskEventKind::CorrelationLimitExceeded
                && event.level >= RiskLevel::Warning
            {
                self.state_manager
                    .broadcast_trigger(
                        TransitionTrigger::CorrelationLimit,
                        json!({"reason": event.message}),
                    )
                    .await;
            }
        }

        // 5. Order monitoring.
        self.monitor.poll(now_utc).await;

        // 6. Periodic persistence.
        self.maybe_save(now_utc).await;
    }

    pub async fn risk_context(&self, now: DateTime<Utc>) -> RiskCheckContext {
        RiskCheckContext {
            account: self.services.broker.account().await,
            positions: self.services.positions.all_positions().await,
            vix: self.services.vix.current_vix().await,
            now,
            today: now.date_naive(),
        }
    }

    pub async fn save_states(&self) {
        if let Err(err) = self.state_manager.save_all_states(self.store.as_ref()).await {
            warn!(%err, "state snapshot failed");
        }
        if let Err(err) = self.services.positions.save_to(self.store.as_ref()).await {
            warn!(%err, "position snapshot failed");
        }
    }

    pub async fn restore_states(&self) {
        if self.store.has(crate::application::system_state::STATE_STORE_KEY).await {
            if let Err(err) = self.state_manager.load_all_states(self.store.as_ref()).await {
                warn!(%err, "state snapshot restore failed");
            }
        }
        if self
            .store
            .has(crate::application::position_manager::POSITIONS_STORE_KEY)
            .await
        {
            if let Err(err) = self.services.positions.load_from(self.store.as_ref()).await {
                warn!(%err, "position snapshot restore failed");
            }
        }
    }

    async fn maybe_save(&self, now: DateTime<Utc>) {
        let due = {
            let mut last = self.last_save.lock().await;
            let due = last.is_none_or(|t| now - t >= self.save_interval);
            if due {
                *last = Some(now);
            }
            due
        };
        if due {
            debug!("periodic state snapshot");
            self.save_states().await;
        }
    }
}
