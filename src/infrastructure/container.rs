use crate::application::coordinator::StrategyCoordinator;
use crate::application::engine::TradingEngine;
use crate::application::execution::{AtomicExecutor, OrderMonitor};
use crate::application::greeks_service::GreeksService;
use crate::application::optimizer::OnDataOptimizer;
use crate::application::performance::PerformanceTracker;
use crate::application::position_manager::PositionStateManager;
use crate::application::risk::circuit_breaker::{CircuitBreakerConfig, CircuitBreakerPlugin};
use crate::application::risk::concentration::{ConcentrationConfig, ConcentrationPlugin};
use crate::application::risk::correlation::CorrelationPlugin;
use crate::application::risk::UnifiedRiskManager;
use crate::application::sizer::PositionSizer;
use crate::application::strategies::{
    FuturesStrangleStrategy, IpmccStrategy, LeapLadderStrategy, Lt112Strategy, ZeroDteConfig,
    ZeroDteStrategy,
};
use crate::application::strategy_base::{StrategyLogic, StrategyRunner, StrategyServices};
use crate::application::system_state::UnifiedStateManager;
use crate::application::vix_manager::{VixCacheProfile, VixManager};
use crate::domain::errors::BootstrapError;
use crate::domain::options::OptionRight;
use crate::domain::ports::{BrokerAdapter, MarketDataAdapter, ObjectStore};
use crate::infrastructure::cache::{CacheKind, UnifiedCache};
use crate::infrastructure::event_bus::EventBus;
use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tracing::{error, info, warn};

pub type ProbeFuture = Pin<Box<dyn Future<Output = Result<(), String>> + Send>>;
pub type Probe = Arc<dyn Fn() -> ProbeFuture + Send + Sync>;

fn probe<F, Fut>(f: F) -> Probe
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), String>> + Send + 'static,
{
    Arc::new(move || Box::pin(f()))
}

/// One manager's startup contract: its dependencies and a readiness probe.
/// The types already guarantee the methods exist; the probe checks the
/// wiring behind them.
pub struct ManagerConfig {
    pub name: &'static str,
    pub dependencies: Vec<&'static str>,
    pub critical: bool,
    probe: Probe,
}

/// Dependency-ordered startup validation. Managers are probed in
/// topological order; a critical failure aborts startup, a non-critical
/// failure poisons every dependant.
pub struct StartupValidator {
    configs: Vec<ManagerConfig>,
}

impl StartupValidator {
    pub fn new() -> Self {
        Self {
            configs: Vec::new(),
        }
    }

    pub fn register(
        &mut self,
        name: &'static str,
        dependencies: &[&'static str],
        critical: bool,
        probe: Probe,
    ) {
        self.configs.push(ManagerConfig {
            name,
            dependencies: dependencies.to_vec(),
            critical,
            probe,
        });
    }

    /// Kahn topological sort over the declared dependencies.
    fn initialization_order(&self) -> Result<Vec<&'static str>, BootstrapError> {
        let known: HashSet<&'static str> = self.configs.iter().map(|c| c.name).collect();
        let mut indegree: HashMap<&'static str, usize> = HashMap::new();
        let mut dependants: HashMap<&'static str, Vec<&'static str>> = HashMap::new();
        for config in &self.configs {
            indegree.entry(config.name).or_insert(0);
            for dep in &config.dependencies {
                if !known.contains(dep) {
                    return Err(BootstrapError::UnknownDependency {
                        name: config.name.to_string(),
                        dependency: dep.to_string(),
                    });
                }
                *indegree.entry(config.name).or_insert(0) += 1;
                dependants.entry(dep).or_default().push(config.name);
            }
        }

        let mut queue: VecDeque<&'static str> = {
            let mut roots: Vec<&'static str> = indegree
                .iter()
                .filter(|(_, d)| **d == 0)
                .map(|(n, _)| *n)
                .collect();
            roots.sort();
            roots.into_iter().collect()
        };
        let mut order = Vec::new();
        while let Some(name) = queue.pop_front() {
            order.push(name);
            for dependant in dependants.get(name).cloned().unwrap_or_default() {
                let d = indegree.get_mut(dependant).expect("known manager");
                *d -= 1;
                if *d == 0 {
                    queue.push_back(dependant);
                }
            }
        }
        if order.len() != self.configs.len() {
            let stuck = self
                .configs
                .iter()
                .find(|c| !order.contains(&c.name))
                .map(|c| c.name.to_string())
                .unwrap_or_default();
            return Err(BootstrapError::DependencyCycle { name: stuck });
        }
        Ok(order)
    }

    /// Probe every manager in dependency order.
    pub async fn run(&self) -> Result<(), BootstrapError> {
        let order = self.initialization_order()?;
        let by_name: HashMap<&'static str, &ManagerConfig> =
            self.configs.iter().map(|c| (c.name, c)).collect();

        let mut failed: HashSet<&'static str> = HashSet::new();
        for name in order {
            let config = by_name[name];
            let poisoned_by = config
                .dependencies
                .iter()
                .find(|dep| failed.contains(*dep))
                .copied();
            let result = match poisoned_by {
                Some(dep) => Err(format!("dependency '{dep}' failed")),
                None => (config.probe)().await,
            };
            match result {
                Ok(()) => info!(manager = name, "validated"),
                Err(reason) if config.critical => {
                    error!(manager = name, reason, "critical manager failed validation");
                    return Err(BootstrapError::CriticalFailure {
                        name: name.to_string(),
                        reason,
                    });
                }
                Err(reason) => {
                    warn!(manager = name, reason, "non-critical manager failed validation");
                    failed.insert(name);
                }
            }
        }
        Ok(())
    }

    /// Final pass over the hand-picked hot-path managers; any failure here
    /// is fatal regardless of the critical flag.
    pub async fn validate_hot_paths(&self, names: &[&str]) -> Result<(), BootstrapError> {
        for name in names {
            let Some(config) = self.configs.iter().find(|c| c.name == *name) else {
                return Err(BootstrapError::HotPathFailure {
                    name: name.to_string(),
                    reason: "not registered".to_string(),
                });
            };
            if let Err(reason) = (config.probe)().await {
                return Err(BootstrapError::HotPathFailure {
                    name: name.to_string(),
                    reason,
                });
            }
        }
        info!(count = names.len(), "hot-path validation passed");
        Ok(())
    }
}

impl Default for StartupValidator {
    fn default() -> Self {
        Self::new()
    }
}

/// The explicit service graph, built tier by tier. Strategies receive this
/// (through `StrategyServices`) instead of reaching into a global host.
pub struct ServiceContainer {
    pub bus: Arc<EventBus>,
    pub cache: Arc<UnifiedCache>,
    pub market: Arc<dyn MarketDataAdapter>,
    pub broker: Arc<dyn BrokerAdapter>,
    pub store: Arc<dyn ObjectStore>,
    pub vix: Arc<VixManager>,
    pub greeks: Arc<GreeksService>,
    pub positions: Arc<PositionStateManager>,
    pub performance: Arc<PerformanceTracker>,
    pub sizer: Arc<PositionSizer>,
    pub risk: Arc<UnifiedRiskManager>,
    pub circuit_breaker: Arc<CircuitBreakerPlugin>,
    pub correlation: Arc<CorrelationPlugin>,
    pub concentration: Arc<ConcentrationPlugin>,
    pub state_manager: Arc<UnifiedStateManager>,
    pub coordinator: Arc<StrategyCoordinator>,
    pub executor: Arc<AtomicExecutor>,
    pub monitor: Arc<OrderMonitor>,
    pub optimizer: Arc<OnDataOptimizer>,
    pub services: Arc<StrategyServices>,
    pub engine: Arc<TradingEngine>,
}

/// Tiered, dependency-ordered startup with default strategy tuning.
pub async fn bootstrap(
    market: Arc<dyn MarketDataAdapter>,
    broker: Arc<dyn BrokerAdapter>,
    store: Arc<dyn ObjectStore>,
    profile: VixCacheProfile,
) -> Result<ServiceContainer, BootstrapError> {
    bootstrap_with(market, broker, store, profile, ZeroDteConfig::default()).await
}

/// Tiered, dependency-ordered startup. Construction runs leaves first;
/// validation re-walks the declared graph and aborts before the first
/// trading tick if anything is miswired.
pub async fn bootstrap_with(
    market: Arc<dyn MarketDataAdapter>,
    broker: Arc<dyn BrokerAdapter>,
    store: Arc<dyn ObjectStore>,
    profile: VixCacheProfile,
    zero_dte: ZeroDteConfig,
) -> Result<ServiceContainer, BootstrapError> {
    // Tier 1: bus and cache.
    let bus = Arc::new(EventBus::new());
    let cache = Arc::new(UnifiedCache::new());

    // Tier 2: market-facing services and the position record.
    let vix = Arc::new(VixManager::new(market.clone(), bus.clone(), profile));
    let greeks = Arc::new(GreeksService::new(
        market.clone(),
        cache.clone(),
        bus.clone(),
    ));
    let positions = Arc::new(PositionStateManager::new(broker.clone(), bus.clone()));
    let performance = Arc::new(PerformanceTracker::new());

    // Tier 3: sizing, risk plugins, risk manager, state manager.
    let sizer = Arc::new(PositionSizer::new(vix.clone(), performance.clone()));
    let circuit_breaker = Arc::new(CircuitBreakerPlugin::new(CircuitBreakerConfig::default()));
    let correlation = Arc::new(CorrelationPlugin::new());
    let concentration = Arc::new(ConcentrationPlugin::new(ConcentrationConfig::default()));
    let risk = Arc::new(UnifiedRiskManager::new(bus.clone(), broker.clone()));
    for plugin in [
        circuit_breaker.clone() as Arc<dyn crate::application::risk::RiskPlugin>,
        correlation.clone() as Arc<dyn crate::application::risk::RiskPlugin>,
        concentration.clone() as Arc<dyn crate::application::risk::RiskPlugin>,
    ] {
        risk.register_plugin(plugin)
            .await
            .map_err(|e| BootstrapError::CriticalFailure {
                name: "risk_manager".to_string(),
                reason: e.to_string(),
            })?;
    }
    let state_manager = Arc::new(UnifiedStateManager::new(
        market.clone(),
        broker.clone(),
        vix.clone(),
        positions.clone(),
        performance.clone(),
        bus.clone(),
    ));

    // Tier 4: coordination and execution.
    let coordinator = Arc::new(StrategyCoordinator::new());
    let executor = Arc::new(AtomicExecutor::new(broker.clone(), bus.clone()));
    let monitor = Arc::new(OrderMonitor::new(broker.clone(), bus.clone()));

    // Tier 5: the OnData optimiser and the strategies.
    let optimizer = Arc::new(OnDataOptimizer::new(
        bus.clone(),
        cache.clone(),
        positions.clone(),
        greeks.clone(),
        broker.clone(),
    ));
    let services = Arc::new(StrategyServices {
        bus: bus.clone(),
        cache: cache.clone(),
        market: market.clone(),
        broker: broker.clone(),
        vix: vix.clone(),
        greeks: greeks.clone(),
        positions: positions.clone(),
        risk: risk.clone(),
        executor: executor.clone(),
        sizer: sizer.clone(),
        performance: performance.clone(),
        concentration: concentration.clone(),
    });

    let logics: Vec<Arc<dyn StrategyLogic>> = vec![
        Arc::new(ZeroDteStrategy::new(zero_dte)),
        Arc::new(Lt112Strategy::new()),
        Arc::new(IpmccStrategy::new()),
        Arc::new(FuturesStrangleStrategy::new()),
        Arc::new(LeapLadderStrategy::new()),
    ];
    let mut runners = Vec::new();
    for logic in logics {
        let runner = Arc::new(StrategyRunner::new(logic.clone(), services.clone()));
        runner.init().await;
        coordinator.register_strategy(logic.name(), logic.priority());
        if let Some(window) = logic.window() {
            coordinator.set_window(logic.name(), window.start, window.end);
        }
        state_manager
            .register_strategy(logic.name(), runner.machine())
            .await
            .map_err(|e| BootstrapError::CriticalFailure {
                name: "state_manager".to_string(),
                reason: e.to_string(),
            })?;
        runners.push(runner);
    }
    // SPY put sellers step on each other's strikes; never run them
    // concurrently.
    coordinator.set_conflicts("lt112", &["leap_ladder"]);
    coordinator.set_conflicts("leap_ladder", &["lt112"]);

    let engine = Arc::new(TradingEngine::new(
        services.clone(),
        coordinator.clone(),
        state_manager.clone(),
        optimizer.clone(),
        monitor.clone(),
        risk.clone(),
        store.clone(),
        runners.clone(),
    ));

    let container = ServiceContainer {
        bus,
        cache,
        market,
        broker,
        store,
        vix,
        greeks,
        positions,
        performance,
        sizer,
        risk,
        circuit_breaker,
        correlation,
        concentration,
        state_manager,
        coordinator,
        executor,
        monitor,
        optimizer,
        services,
        engine,
    };

    let validator = build_validator(&container);
    validator.run().await?;
    validator
        .validate_hot_paths(&[
            "vix_manager",
            "state_manager",
            "coordinator",
            "risk_manager",
            "greeks_service",
            "cache",
        ])
        .await?;
    info!("bootstrap complete");
    Ok(container)
}

fn build_validator(container: &ServiceContainer) -> StartupValidator {
    let mut validator = StartupValidator::new();

    {
        let bus = container.bus.clone();
        validator.register("event_bus", &[], true, probe(move || {
            let bus = bus.clone();
            async move {
                let _stats = bus.stats();
                Ok(())
            }
        }));
    }
    {
        let cache = container.cache.clone();
        validator.register("cache", &["event_bus"], true, probe(move || {
            let cache = cache.clone();
            async move {
                let value: u32 = cache
                    .get("bootstrap:probe", CacheKind::General, None, || async { 7u32 })
                    .await;
                if value == 7 {
                    Ok(())
                } else {
                    Err("cache roundtrip mismatch".to_string())
                }
            }
        }));
    }
    {
        let vix = container.vix.clone();
        validator.register("vix_manager", &["event_bus"], true, probe(move || {
            let vix = vix.clone();
            async move {
                let value = vix.current_vix().await;
                if value.is_finite() && value > 0.0 {
                    Ok(())
                } else {
                    Err(format!("implausible VIX {value}"))
                }
            }
        }));
    }
    {
        validator.register("greeks_service", &["event_bus", "cache"], true, probe(move || async move {
            let greeks = crate::application::greeks_service::black_scholes_greeks(
                450.0,
                450.0,
                30.0,
                0.20,
                0.05,
                OptionRight::Call,
            );
            if greeks.delta > 0.0 && greeks.delta < 1.0 {
                Ok(())
            } else {
                Err("Black-Scholes sanity check failed".to_string())
            }
        }));
    }
    {
        let positions = container.positions.clone();
        validator.register("position_state", &["event_bus"], true, probe(move || {
            let positions = positions.clone();
            async move {
                positions.invested_hash().await;
                Ok(())
            }
        }));
    }
    {
        let performance = container.performance.clone();
        validator.register("performance_tracker", &[], false, probe(move || {
            let performance = performance.clone();
            async move {
                performance.snapshot().await;
                Ok(())
            }
        }));
    }
    {
        validator.register(
            "position_sizer",
            &["vix_manager", "performance_tracker"],
            false,
            probe(move || async move { Ok(()) }),
        );
    }
    {
        let risk = container.risk.clone();
        validator.register(
            "risk_manager",
            &["event_bus", "position_state"],
            true,
            probe(move || {
                let risk = risk.clone();
                async move {
                    let plugins = risk.plugin_count().await;
                    if plugins >= 3 {
                        Ok(())
                    } else {
                        Err(format!("only {plugins} risk plugins registered"))
                    }
                }
            }),
        );
    }
    {
        let state_manager = container.state_manager.clone();
        validator.register(
            "state_manager",
            &["event_bus", "vix_manager", "position_state"],
            true,
            probe(move || {
                let state_manager = state_manager.clone();
                async move {
                    state_manager.system_state().await;
                    Ok(())
                }
            }),
        );
    }
    {
        let coordinator = container.coordinator.clone();
        validator.register("coordinator", &[], true, probe(move || {
            let coordinator = coordinator.clone();
            async move {
                let registered = coordinator.registered_count();
                if registered >= 5 {
                    Ok(())
                } else {
                    Err(format!("only {registered} strategies registered"))
                }
            }
        }));
    }
    {
        validator.register(
            "atomic_executor",
            &["event_bus"],
            true,
            probe(move || async move { Ok(()) }),
        );
        validator.register(
            "order_monitor",
            &["event_bus"],
            true,
            probe(move || async move { Ok(()) }),
        );
    }
    {
        let optimizer = container.optimizer.clone();
        validator.register(
            "ondata_optimizer",
            &["cache", "greeks_service", "position_state"],
            false,
            probe(move || {
                let optimizer = optimizer.clone();
                async move {
                    optimizer.metrics();
                    Ok(())
                }
            }),
        );
    }
    {
        validator.register(
            "strategies",
            &["coordinator", "risk_manager", "atomic_executor"],
            true,
            probe(move || async move { Ok(()) }),
        );
    }
    validator
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::mock::{MockBroker, MockMarketData};
    use crate::infrastructure::persistence::InMemoryStore;
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn bootstrap_builds_and_validates() {
        let market = Arc::new(MockMarketData::new());
        market.set_price("VIX", dec!(18)).await;
        market.set_price("SPY", dec!(450)).await;
        let container = bootstrap(
            market,
            Arc::new(MockBroker::new()),
            Arc::new(InMemoryStore::new()),
            VixCacheProfile::Backtest,
        )
        .await
        .expect("bootstrap succeeds");
        assert_eq!(container.coordinator.registered_count(), 5);
        assert_eq!(container.risk.plugin_count().await, 3);
    }

    #[test]
    fn cycle_detection() {
        let mut validator = StartupValidator::new();
        validator.register("a", &["b"], true, probe(|| async { Ok(()) }));
        validator.register("b", &["a"], true, probe(|| async { Ok(()) }));
        let err = validator.initialization_order().unwrap_err();
        assert!(matches!(err, BootstrapError::DependencyCycle { .. }));
    }

    #[test]
    fn unknown_dependency_is_fatal() {
        let mut validator = StartupValidator::new();
        validator.register("a", &["ghost"], true, probe(|| async { Ok(()) }));
        let err = validator.initialization_order().unwrap_err();
        assert!(matches!(err, BootstrapError::UnknownDependency { .. }));
    }

    #[tokio::test]
    async fn critical_failure_aborts() {
        let mut validator = StartupValidator::new();
        validator.register("a", &[], true, probe(|| async { Err("broken".to_string()) }));
        let err = validator.run().await.unwrap_err();
        assert!(matches!(err, BootstrapError::CriticalFailure { .. }));
    }

    #[tokio::test]
    async fn non_critical_failure_poisons_dependants() {
        let mut validator = StartupValidator::new();
        validator.register("a", &[], false, probe(|| async { Err("broken".to_string()) }));
        validator.register("b", &["a"], false, probe(|| async { Ok(()) }));
        // Neither failure is critical, so startup proceeds.
        validator.run().await.unwrap();
        // But the hot-path pass on the poisoned root still fails.
        let err = validator.validate_hot_paths(&["a"]).await.unwrap_err();
        assert!(matches!(err, BootstrapError::HotPathFailure { .. }));
    }
}
