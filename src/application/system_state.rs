use crate::application::performance::PerformanceTracker;
use crate::application::position_manager::PositionStateManager;
use crate::application::state_machine::StateMachine;
use crate::application::vix_manager::VixManager;
use crate::domain::errors::{PersistenceError, StateError};
use crate::domain::events::EventType;
use crate::domain::ports::{BrokerAdapter, MarketDataAdapter, ObjectStore};
use crate::domain::states::{StrategyState, SystemState, TransitionTrigger};
use crate::infrastructure::event_bus::EventBus;
use crate::payload;
use chrono::{Duration, NaiveTime, Utc};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::RwLock;
use tracing::{error, info, warn};

pub const STATE_STORE_KEY: &str = "state_machines";

/// VIX level above which every machine receives `VixSpike`.
const VIX_SPIKE_LEVEL: f64 = 35.0;
/// Margin-used over portfolio-value ratio that broadcasts `MarginCall`.
const MARGIN_CALL_RATIO: f64 = 0.80;
/// Quote age that counts as stale data.
const STALE_QUOTE_SECS: i64 = 600;

#[derive(Debug, Default)]
pub struct SystemStats {
    pub error_entries: AtomicU64,
    pub suspensions: AtomicU64,
}

/// System-level coordination across all strategy machines: state
/// derivation, global trigger broadcast, halt, persistence.
///
/// The state manager exclusively owns every registered machine.
pub struct UnifiedStateManager {
    system_state: RwLock<SystemState>,
    emergency: AtomicBool,
    machines: RwLock<HashMap<String, Arc<Mutex<StateMachine>>>>,
    stats: Arc<SystemStats>,
    market: Arc<dyn MarketDataAdapter>,
    broker: Arc<dyn BrokerAdapter>,
    vix: Arc<VixManager>,
    positions: Arc<PositionStateManager>,
    performance: Arc<PerformanceTracker>,
    bus: Arc<EventBus>,
}

impl UnifiedStateManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        market: Arc<dyn MarketDataAdapter>,
        broker: Arc<dyn BrokerAdapter>,
        vix: Arc<VixManager>,
        positions: Arc<PositionStateManager>,
        performance: Arc<PerformanceTracker>,
        bus: Arc<EventBus>,
    ) -> Self {
        Self {
            system_state: RwLock::new(SystemState::Initializing),
            emergency: AtomicBool::new(false),
            machines: RwLock::new(HashMap::new()),
            stats: Arc::new(SystemStats::default()),
            market,
            broker,
            vix,
            positions,
            performance,
            bus,
        }
    }

    pub async fn system_state(&self) -> SystemState {
        *self.system_state.read().await
    }

    pub fn is_emergency(&self) -> bool {
        self.emergency.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> &SystemStats {
        &self.stats
    }

    /// Register a machine and hook Error/Suspended entries into the system
    /// statistics.
    pub async fn register_strategy(
        &self,
        name: &str,
        machine: Arc<Mutex<StateMachine>>,
    ) -> Result<(), StateError> {
        let mut machines = self.machines.write().await;
        if machines.contains_key(name) {
            return Err(StateError::AlreadyRegistered {
                name: name.to_string(),
            });
        }
        {
            let mut locked = machine.lock().expect("machine lock poisoned");
            let stats = self.stats.clone();
            locked.on_enter(
                StrategyState::Error,
                Arc::new(move |_| {
                    stats.error_entries.fetch_add(1, Ordering::SeqCst);
                }),
            );
            let stats = self.stats.clone();
            locked.on_enter(
                StrategyState::Suspended,
                Arc::new(move |_| {
                    stats.suspensions.fetch_add(1, Ordering::SeqCst);
                }),
            );
        }
        machines.insert(name.to_string(), machine);
        info!(name, "strategy machine registered");
        Ok(())
    }

    /// Derive the system state from market hours and the emergency flag,
    /// and drive the global edges on entry.
    pub async fn update_system_state(&self) -> SystemState {
        let current = *self.system_state.read().await;
        if current == SystemState::Halted {
            return current;
        }

        let next = if self.is_emergency() {
            SystemState::Emergency
        } else if self.market.is_market_open("SPY").await {
            SystemState::MarketOpen
        } else {
            let time = self.market.market_time().await.time();
            let pre_open = NaiveTime::from_hms_opt(7, 0, 0).expect("valid time");
            let open = NaiveTime::from_hms_opt(9, 30, 0).expect("valid time");
            if time >= pre_open && time < open {
                SystemState::PreMarket
            } else {
                SystemState::MarketClosed
            }
        };

        if next != current {
            *self.system_state.write().await = next;
            info!(from = %current, to = %next, "system state change");
            self.bus
                .publish(
                    EventType::SystemStateChanged,
                    payload! {"from" => current.to_string(), "to" => next.to_string()},
                    "state_manager",
                )
                .await;
            match next {
                SystemState::MarketOpen => {
                    self.broadcast_trigger(TransitionTrigger::MarketOpen, Value::Null)
                        .await;
                }
                SystemState::MarketClosed => {
                    self.broadcast_trigger(TransitionTrigger::MarketClose, Value::Null)
                        .await;
                }
                SystemState::Emergency => {
                    self.trigger_on_exposed(TransitionTrigger::EmergencyExit).await;
                }
                _ => {}
            }
        }
        next
    }

    /// Fire a trigger on every machine that can accept it. Returns the
    /// number of machines that transitioned.
    pub async fn broadcast_trigger(&self, trigger: TransitionTrigger, data: Value) -> usize {
        let machines = self.machines.read().await;
        let mut fired = 0;
        for machine in machines.values() {
            let mut locked = machine.lock().expect("machine lock poisoned");
            if locked.can_fire(trigger, &data) && locked.trigger(trigger, &data) {
                fired += 1;
            }
        }
        fired
    }

    /// Run the global trigger checks: VIX spike, margin pressure, stale
    /// data. Each truthy check broadcasts its trigger.
    pub async fn run_global_checks(&self) {
        let vix = self.vix.current_vix().await;
        if vix > VIX_SPIKE_LEVEL {
            warn!(vix, "VIX spike, broadcasting");
            self.broadcast_trigger(TransitionTrigger::VixSpike, json!({"vix": vix}))
                .await;
        }

        let account = self.broker.account().await;
        let margin_ratio = account.margin_ratio();
        if margin_ratio > MARGIN_CALL_RATIO {
            warn!(margin_ratio, "margin threshold exceeded, broadcasting");
            self.broadcast_trigger(
                TransitionTrigger::MarginCall,
                json!({"margin_ratio": margin_ratio}),
            )
            .await;
            self.bus
                .publish(
                    EventType::MarginThresholdExceeded,
                    payload! {"margin_ratio" => margin_ratio},
                    "state_manager",
                )
                .await;
        }

        if let Ok(quote) = self.market.quote("SPY").await {
            let now = self.market.market_time().await;
            let age = now - quote.as_of;
            if age > Duration::seconds(STALE_QUOTE_SECS) {
                warn!(age_secs = age.num_seconds(), "stale market data, broadcasting");
                self.broadcast_trigger(
                    TransitionTrigger::DataStale,
                    json!({"age_secs": age.num_seconds()}),
                )
                .await;
                self.bus
                    .publish(
                        EventType::DataStaleDetected,
                        payload! {"age_secs" => age.num_seconds()},
                        "state_manager",
                    )
                    .await;
            }
        }
    }

    /// Emergency stop: broadcast `EmergencyExit` and pin the system in
    /// `Halted` until an operator reset.
    pub async fn halt_all_trading(&self, reason: &str) {
        error!(reason, "halting all trading");
        self.emergency.store(true, Ordering::SeqCst);
        self.trigger_on_exposed(TransitionTrigger::EmergencyExit).await;
        *self.system_state.write().await = SystemState::Halted;
        self.bus
            .publish(
                EventType::EmergencyHalt,
                payload! {"reason" => reason},
                "state_manager",
            )
            .await;
    }

    /// Operator reset out of `Halted`.
    pub async fn resume_from_halt(&self) {
        self.emergency.store(false, Ordering::SeqCst);
        *self.system_state.write().await = SystemState::Initializing;
        info!("resumed from halt");
    }

    /// Persisted layout: `{timestamp, system_state, emergency_mode,
    /// strategies: {name: {current_state, error_count, statistics}}}`.
    pub async fn save_all_states(&self, store: &dyn ObjectStore) -> Result<(), PersistenceError> {
        let machines = self.machines.read().await;
        let mut strategies = serde_json::Map::new();
        let statistics = self.performance.snapshot().await;
        for (name, machine) in machines.iter() {
            let locked = machine.lock().expect("machine lock poisoned");
            strategies.insert(
                name.clone(),
                json!({
                    "current_state": locked.state(),
                    "error_count": locked.error_count(),
                    "statistics": statistics.get(name).cloned().unwrap_or(Value::Null),
                }),
            );
        }
        let snapshot = json!({
            "timestamp": Utc::now().to_rfc3339(),
            "system_state": *self.system_state.read().await,
            "emergency_mode": self.is_emergency(),
            "strategies": strategies,
        });
        store
            .save(STATE_STORE_KEY, snapshot.to_string().as_bytes())
            .await
    }

    pub async fn load_all_states(&self, store: &dyn ObjectStore) -> Result<(), PersistenceError> {
        let bytes = store.read(STATE_STORE_KEY).await?;
        let snapshot: Value =
            serde_json::from_slice(&bytes).map_err(|e| PersistenceError::Corrupt {
                key: STATE_STORE_KEY.to_string(),
                reason: e.to_string(),
            })?;

        if let Some(state) = snapshot
            .get("system_state")
            .and_then(|v| serde_json::from_value(v.clone()).ok())
        {
            *self.system_state.write().await = state;
        }
        self.emergency.store(
            snapshot
                .get("emergency_mode")
                .and_then(Value::as_bool)
                .unwrap_or(false),
            Ordering::SeqCst,
        );

        let machines = self.machines.read().await;
        if let Some(strategies) = snapshot.get("strategies").and_then(Value::as_object) {
            for (name, entry) in strategies {
                let Some(machine) = machines.get(name) else {
                    warn!(name, "snapshot references unknown strategy");
                    continue;
                };
                let state = entry
                    .get("current_state")
                    .and_then(|v| serde_json::from_value(v.clone()).ok())
                    .unwrap_or(StrategyState::Initializing);
                let error_count = entry
                    .get("error_count")
                    .and_then(Value::as_u64)
                    .unwrap_or(0) as u32;
                machine
                    .lock()
                    .expect("machine lock poisoned")
                    .restore_state(state, error_count);
            }
        }
        info!("state machines restored from snapshot");
        Ok(())
    }

    pub async fn machine_state(&self, name: &str) -> Option<StrategyState> {
        let machines = self.machines.read().await;
        machines
            .get(name)
            .map(|m| m.lock().expect("machine lock poisoned").state())
    }

    /// Fire `EmergencyExit` on every strategy that still has exposure.
    async fn trigger_on_exposed(&self, trigger: TransitionTrigger) {
        let machines = self.machines.read().await;
        for (name, machine) in machines.iter() {
            let has_positions = !self.positions.positions_for(name).await.is_empty();
            let mut locked = machine.lock().expect("machine lock poisoned");
            if has_positions || locked.state().has_exposure() {
                locked.trigger(trigger, &Value::Null);
            }
        }
    }
}
