use async_trait::async_trait;
use chrono::{Duration, NaiveDateTime, NaiveTime};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

const HISTORY_LIMIT: usize = 200;
const DEFAULT_MIN_INTERVAL_SECS: i64 = 300;
const DEFAULT_LOCK_STALE_SECS: i64 = 300;

/// Execution priority: Critical runs first and may preempt conflicts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ExecutionPriority {
    Critical,
    High,
    Medium,
    Low,
    Idle,
}

/// Coarse advisory locks shared between strategies. Holding one only stops
/// the coordinator from granting it again; it does not block the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SharedResource {
    OrderPlacement,
    OptionChain,
    Margin,
    SpyPositions,
    VixData,
}

#[derive(Debug, Clone, Copy)]
pub struct ExecutionWindow {
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl ExecutionWindow {
    pub fn contains(&self, at: NaiveTime) -> bool {
        at >= self.start && at <= self.end
    }
}

#[derive(Debug, Clone)]
pub enum ExecutionOutcome {
    Success,
    Failed(String),
    Throttled,
}

#[derive(Debug, Clone)]
pub struct ExecutionRecord {
    pub strategy: String,
    pub at: NaiveDateTime,
    pub outcome: ExecutionOutcome,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionRefusal {
    NotRegistered,
    OutOfWindow,
    Conflict(String),
    ExclusiveHeld(String),
}

#[derive(Debug)]
struct Registration {
    priority: ExecutionPriority,
    window: Option<ExecutionWindow>,
    conflicts: HashSet<String>,
    last_run: Option<NaiveDateTime>,
    min_interval: Duration,
}

#[derive(Debug)]
struct LockInfo {
    owner: String,
    acquired_at: NaiveDateTime,
}

#[derive(Debug)]
struct Inner {
    registered: HashMap<String, Registration>,
    active: HashSet<String>,
    blocked: HashSet<String>,
    locks: HashMap<SharedResource, LockInfo>,
    history: VecDeque<ExecutionRecord>,
    conflict_log: Vec<String>,
    exclusive: Option<String>,
}

/// A strategy as the coordinator drives it each tick.
#[async_trait]
pub trait CoordinatedStrategy: Send + Sync {
    fn name(&self) -> &str;
    async fn execute(&self, now: NaiveDateTime) -> Result<(), String>;
}

/// Priority-ordered execution with mutual exclusion, advisory resource
/// locks, time-window gating and per-strategy throttling.
pub struct StrategyCoordinator {
    inner: Arc<Mutex<Inner>>,
}

impl StrategyCoordinator {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                registered: HashMap::new(),
                active: HashSet::new(),
                blocked: HashSet::new(),
                locks: HashMap::new(),
                history: VecDeque::new(),
                conflict_log: Vec::new(),
                exclusive: None,
            })),
        }
    }

    /// Idempotent per process: a second registration under the same name is
    /// a no-op returning false.
    pub fn register_strategy(&self, name: &str, priority: ExecutionPriority) -> bool {
        let mut inner = self.inner.lock().expect("coordinator lock poisoned");
        if inner.registered.contains_key(name) {
            debug!(name, "strategy already registered");
            return false;
        }
        inner.registered.insert(
            name.to_string(),
            Registration {
                priority,
                window: None,
                conflicts: HashSet::new(),
                last_run: None,
                min_interval: Duration::seconds(DEFAULT_MIN_INTERVAL_SECS),
            },
        );
        info!(name, ?priority, "strategy registered");
        true
    }

    pub fn set_window(&self, name: &str, start: NaiveTime, end: NaiveTime) {
        let mut inner = self.inner.lock().expect("coordinator lock poisoned");
        if let Some(reg) = inner.registered.get_mut(name) {
            reg.window = Some(ExecutionWindow { start, end });
        }
    }

    pub fn set_conflicts(&self, name: &str, conflicts: &[&str]) {
        let mut inner = self.inner.lock().expect("coordinator lock poisoned");
        if let Some(reg) = inner.registered.get_mut(name) {
            reg.conflicts = conflicts.iter().map(|s| s.to_string()).collect();
        }
    }

    pub fn set_min_interval(&self, name: &str, interval: Duration) {
        let mut inner = self.inner.lock().expect("coordinator lock poisoned");
        if let Some(reg) = inner.registered.get_mut(name) {
            reg.min_interval = interval;
        }
    }

    pub fn registered_count(&self) -> usize {
        self.inner
            .lock()
            .expect("coordinator lock poisoned")
            .registered
            .len()
    }

    pub fn is_active(&self, name: &str) -> bool {
        self.inner
            .lock()
            .expect("coordinator lock poisoned")
            .active
            .contains(name)
    }

    pub fn is_blocked(&self, name: &str) -> bool {
        self.inner
            .lock()
            .expect("coordinator lock poisoned")
            .blocked
            .contains(name)
    }

    /// Priority-ascending execution order over in-window, unblocked
    /// strategies.
    pub fn get_execution_order(&self, now: NaiveDateTime) -> Vec<String> {
        let inner = self.inner.lock().expect("coordinator lock poisoned");
        let mut eligible: Vec<(&String, &Registration)> = inner
            .registered
            .iter()
            .filter(|(name, reg)| {
                !inner.blocked.contains(*name)
                    && reg.window.is_none_or(|w| w.contains(now.time()))
            })
            .collect();
        eligible.sort_by(|a, b| a.1.priority.cmp(&b.1.priority).then(a.0.cmp(b.0)));
        eligible.into_iter().map(|(name, _)| name.clone()).collect()
    }

    /// Gate one execution: window, conflicts, exclusivity. Critical
    /// priority preempts and pauses conflicting strategies. The returned
    /// guard restores every paused strategy and the active mark on all exit
    /// paths.
    pub fn begin_execution(
        &self,
        name: &str,
        now: NaiveDateTime,
        exclusive: bool,
    ) -> Result<ExecutionGuard, ExecutionRefusal> {
        let mut inner = self.inner.lock().expect("coordinator lock poisoned");

        let Some(reg) = inner.registered.get(name) else {
            return Err(ExecutionRefusal::NotRegistered);
        };
        if let Some(window) = reg.window {
            if !window.contains(now.time()) {
                return Err(ExecutionRefusal::OutOfWindow);
            }
        }
        if let Some(holder) = &inner.exclusive {
            if holder != name {
                return Err(ExecutionRefusal::ExclusiveHeld(holder.clone()));
            }
        }

        let priority = reg.priority;
        let conflicts: Vec<String> = reg
            .conflicts
            .iter()
            .filter(|c| inner.active.contains(*c))
            .cloned()
            .collect();

        let mut paused = Vec::new();
        if !conflicts.is_empty() {
            if priority == ExecutionPriority::Critical {
                for conflict in conflicts {
                    inner.conflict_log.push(format!(
                        "{now}: {name} (critical) preempted {conflict}"
                    ));
                    // A paused strategy is never simultaneously active.
                    inner.active.remove(&conflict);
                    inner.blocked.insert(conflict.clone());
                    paused.push(conflict);
                }
            } else {
                return Err(ExecutionRefusal::Conflict(conflicts[0].clone()));
            }
        }

        if exclusive {
            let others: Vec<String> = inner
                .active
                .iter()
                .filter(|other| {
                    *other != name
                        && inner
                            .registered
                            .get(*other)
                            .is_none_or(|r| r.priority != ExecutionPriority::Critical)
                })
                .cloned()
                .collect();
            for other in others {
                inner.active.remove(&other);
                inner.blocked.insert(other.clone());
                paused.push(other);
            }
            inner.exclusive = Some(name.to_string());
        }

        inner.active.insert(name.to_string());
        Ok(ExecutionGuard {
            inner: Arc::clone(&self.inner),
            name: name.to_string(),
            paused,
            exclusive,
        })
    }

    /// Acquire an advisory resource lock, breaking stale holders.
    pub fn acquire_resource_lock(
        &self,
        resource: SharedResource,
        owner: &str,
        now: NaiveDateTime,
    ) -> Option<ResourceLockGuard> {
        let mut inner = self.inner.lock().expect("coordinator lock poisoned");
        if let Some(lock) = inner.locks.get(&resource) {
            if lock.owner != owner {
                let age = now - lock.acquired_at;
                if age < Duration::seconds(DEFAULT_LOCK_STALE_SECS) {
                    return None;
                }
                warn!(
                    ?resource,
                    stale_owner = %lock.owner,
                    new_owner = owner,
                    "breaking stale resource lock"
                );
            }
        }
        inner.locks.insert(
            resource,
            LockInfo {
                owner: owner.to_string(),
                acquired_at: now,
            },
        );
        Some(ResourceLockGuard {
            inner: Arc::clone(&self.inner),
            resource,
            owner: owner.to_string(),
        })
    }

    pub fn lock_owner(&self, resource: SharedResource) -> Option<String> {
        self.inner
            .lock()
            .expect("coordinator lock poisoned")
            .locks
            .get(&resource)
            .map(|l| l.owner.clone())
    }

    /// Drive every eligible strategy once, in priority order. A throttled
    /// strategy is skipped silently; an execution error never halts the
    /// remainder.
    pub async fn execute_strategies(
        &self,
        strategies: &[Arc<dyn CoordinatedStrategy>],
        now: NaiveDateTime,
    ) {
        let by_name: HashMap<&str, &Arc<dyn CoordinatedStrategy>> =
            strategies.iter().map(|s| (s.name(), s)).collect();

        for name in self.get_execution_order(now) {
            let Some(strategy) = by_name.get(name.as_str()) else {
                continue;
            };
            if self.throttled(&name, now) {
                debug!(name, "throttled, skipping");
                self.record(&name, now, ExecutionOutcome::Throttled);
                continue;
            }
            let guard = match self.begin_execution(&name, now, false) {
                Ok(guard) => guard,
                Err(refusal) => {
                    debug!(name, ?refusal, "execution refused");
                    continue;
                }
            };
            let outcome = match strategy.execute(now).await {
                Ok(()) => ExecutionOutcome::Success,
                Err(reason) => {
                    warn!(name, reason, "strategy execution failed");
                    ExecutionOutcome::Failed(reason)
                }
            };
            drop(guard);
            self.note_run(&name, now);
            self.record(&name, now, outcome);
        }
    }

    pub fn recent_history(&self, limit: usize) -> Vec<ExecutionRecord> {
        let inner = self.inner.lock().expect("coordinator lock poisoned");
        inner.history.iter().rev().take(limit).rev().cloned().collect()
    }

    pub fn conflict_log(&self) -> Vec<String> {
        self.inner
            .lock()
            .expect("coordinator lock poisoned")
            .conflict_log
            .clone()
    }

    fn throttled(&self, name: &str, now: NaiveDateTime) -> bool {
        let inner = self.inner.lock().expect("coordinator lock poisoned");
        inner
            .registered
            .get(name)
            .and_then(|reg| reg.last_run.map(|last| now - last < reg.min_interval))
            .unwrap_or(false)
    }

    fn note_run(&self, name: &str, now: NaiveDateTime) {
        let mut inner = self.inner.lock().expect("coordinator lock poisoned");
        if let Some(reg) = inner.registered.get_mut(name) {
            reg.last_run = Some(now);
        }
    }

    fn record(&self, name: &str, now: NaiveDateTime, outcome: ExecutionOutcome) {
        let mut inner = self.inner.lock().expect("coordinator lock poisoned");
        inner.history.push_back(ExecutionRecord {
            strategy: name.to_string(),
            at: now,
            outcome,
        });
        while inner.history.len() > HISTORY_LIMIT {
            inner.history.pop_front();
        }
    }
}

impl Default for StrategyCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

/// Active-execution marker; restores paused strategies on drop.
#[derive(Debug)]
pub struct ExecutionGuard {
    inner: Arc<Mutex<Inner>>,
    name: String,
    paused: Vec<String>,
    exclusive: bool,
}

impl Drop for ExecutionGuard {
    fn drop(&mut self) {
        let mut inner = self.inner.lock().expect("coordinator lock poisoned");
        inner.active.remove(&self.name);
        for paused in &self.paused {
            inner.blocked.remove(paused);
        }
        if self.exclusive && inner.exclusive.as_deref() == Some(self.name.as_str()) {
            inner.exclusive = None;
        }
    }
}

/// Scoped resource lock; releases on every exit path.
pub struct ResourceLockGuard {
    inner: Arc<Mutex<Inner>>,
    resource: SharedResource,
    owner: String,
}

impl Drop for ResourceLockGuard {
    fn drop(&mut self) {
        let mut inner = self.inner.lock().expect("coordinator lock poisoned");
        if inner
            .locks
            .get(&self.resource)
            .is_some_and(|l| l.owner == self.owner)
        {
            inner.locks.remove(&self.resource);
        }
    }
}
