use crate::domain::states::{StrategyState, TransitionTrigger};
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tracing::debug;

const HISTORY_LIMIT: usize = 100;
/// An Error state is recoverable below this count.
pub const MAX_RECOVERABLE_ERRORS: u32 = 3;

pub const ALL_STATES: [StrategyState; 13] = [
    StrategyState::Initializing,
    StrategyState::Ready,
    StrategyState::Analyzing,
    StrategyState::PendingEntry,
    StrategyState::Entering,
    StrategyState::PositionOpen,
    StrategyState::Managing,
    StrategyState::Adjusting,
    StrategyState::PendingExit,
    StrategyState::Exiting,
    StrategyState::Closed,
    StrategyState::Suspended,
    StrategyState::Error,
];

pub type Guard = Arc<dyn Fn(&Value) -> bool + Send + Sync>;
pub type StateHook = Arc<dyn Fn(StrategyState) + Send + Sync>;

struct Transition {
    to: StrategyState,
    guard: Option<Guard>,
}

#[derive(Debug, Clone)]
pub struct TransitionRecord {
    pub from: StrategyState,
    pub to: StrategyState,
    pub trigger: TransitionTrigger,
    pub at: DateTime<Utc>,
}

/// Generic finite-state automaton: a transition table with optional guards,
/// per-state enter/exit hooks, an error counter, and a bounded history ring.
pub struct StateMachine {
    name: String,
    state: StrategyState,
    transitions: HashMap<(StrategyState, TransitionTrigger), Transition>,
    on_enter: HashMap<StrategyState, Vec<StateHook>>,
    on_exit: HashMap<StrategyState, Vec<StateHook>>,
    error_count: u32,
    history: VecDeque<TransitionRecord>,
}

impl StateMachine {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            state: StrategyState::Initializing,
            transitions: HashMap::new(),
            on_enter: HashMap::new(),
            on_exit: HashMap::new(),
            error_count: 0,
            history: VecDeque::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> StrategyState {
        self.state
    }

    pub fn error_count(&self) -> u32 {
        self.error_count
    }

    pub fn is_recoverable(&self) -> bool {
        self.error_count < MAX_RECOVERABLE_ERRORS
    }

    pub fn add_transition(
        &mut self,
        from: StrategyState,
        trigger: TransitionTrigger,
        to: StrategyState,
    ) {
        self.transitions.insert((from, trigger), Transition { to, guard: None });
    }

    pub fn add_guarded_transition(
        &mut self,
        from: StrategyState,
        trigger: TransitionTrigger,
        to: StrategyState,
        guard: Guard,
    ) {
        self.transitions
            .insert((from, trigger), Transition { to, guard: Some(guard) });
    }

    pub fn on_enter(&mut self, state: StrategyState, hook: StateHook) {
        self.on_enter.entry(state).or_default().push(hook);
    }

    pub fn on_exit(&mut self, state: StrategyState, hook: StateHook) {
        self.on_exit.entry(state).or_default().push(hook);
    }

    /// Whether a trigger would move the machine, guards included.
    pub fn can_fire(&self, trigger: TransitionTrigger, data: &Value) -> bool {
        self.transitions
            .get(&(self.state, trigger))
            .map(|t| t.guard.as_ref().is_none_or(|g| g(data)))
            .unwrap_or(false)
    }

    /// Fire a trigger. Returns true iff a transition occurred. A trigger
    /// with no edge from the current state is logged and ignored.
    pub fn trigger(&mut self, trigger: TransitionTrigger, data: &Value) -> bool {
        let Some(transition) = self.transitions.get(&(self.state, trigger)) else {
            debug!(
                machine = %self.name,
                state = %self.state,
                %trigger,
                "no edge for trigger, staying put"
            );
            return false;
        };
        if let Some(guard) = &transition.guard {
            if !guard(data) {
                debug!(machine = %self.name, state = %self.state, %trigger, "guard rejected transition");
                return false;
            }
        }
        let from = self.state;
        let to = transition.to;

        if let Some(hooks) = self.on_exit.get(&from) {
            for hook in hooks.clone() {
                hook(from);
            }
        }
        self.state = to;
        if to == StrategyState::Error {
            self.error_count += 1;
        }
        if let Some(hooks) = self.on_enter.get(&to) {
            for hook in hooks.clone() {
                hook(to);
            }
        }

        self.history.push_back(TransitionRecord {
            from,
            to,
            trigger,
            at: Utc::now(),
        });
        while self.history.len() > HISTORY_LIMIT {
            self.history.pop_front();
        }
        debug!(machine = %self.name, %from, %to, %trigger, "transition");
        true
    }

    /// Clear the error budget after a successful recovery pass.
    pub fn reset_errors(&mut self) {
        self.error_count = 0;
    }

    /// Restore a persisted state without firing hooks; used only when
    /// loading a snapshot.
    pub fn restore_state(&mut self, state: StrategyState, error_count: u32) {
        self.state = state;
        self.error_count = error_count;
    }

    pub fn history(&self) -> impl Iterator<Item = &TransitionRecord> {
        self.history.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn machine() -> StateMachine {
        let mut m = StateMachine::new("test");
        m.add_transition(
            StrategyState::Initializing,
            TransitionTrigger::MarketOpen,
            StrategyState::Ready,
        );
        m.add_transition(
            StrategyState::Ready,
            TransitionTrigger::TimeWindowStart,
            StrategyState::Analyzing,
        );
        m
    }

    #[test]
    fn basic_transition() {
        let mut m = machine();
        assert!(m.trigger(TransitionTrigger::MarketOpen, &Value::Null));
        assert_eq!(m.state(), StrategyState::Ready);
    }

    #[test]
    fn missing_edge_is_a_noop() {
        let mut m = machine();
        assert!(!m.trigger(TransitionTrigger::OrderFilled, &Value::Null));
        assert_eq!(m.state(), StrategyState::Initializing);
        assert_eq!(m.history().count(), 0);
    }

    #[test]
    fn guard_blocks_transition() {
        let mut m = StateMachine::new("guarded");
        m.add_guarded_transition(
            StrategyState::Initializing,
            TransitionTrigger::MarketOpen,
            StrategyState::Ready,
            Arc::new(|data: &Value| data.get("go").and_then(Value::as_bool).unwrap_or(false)),
        );
        assert!(!m.trigger(TransitionTrigger::MarketOpen, &json!({"go": false})));
        assert_eq!(m.state(), StrategyState::Initializing);
        assert!(m.trigger(TransitionTrigger::MarketOpen, &json!({"go": true})));
        assert_eq!(m.state(), StrategyState::Ready);
    }

    #[test]
    fn hooks_fire_in_order() {
        let exits = Arc::new(AtomicUsize::new(0));
        let enters = Arc::new(AtomicUsize::new(0));
        let mut m = machine();
        let exits_clone = exits.clone();
        m.on_exit(StrategyState::Initializing, Arc::new(move |_| {
            exits_clone.fetch_add(1, Ordering::SeqCst);
        }));
        let enters_clone = enters.clone();
        m.on_enter(StrategyState::Ready, Arc::new(move |_| {
            enters_clone.fetch_add(1, Ordering::SeqCst);
        }));

        m.trigger(TransitionTrigger::MarketOpen, &Value::Null);
        assert_eq!(exits.load(Ordering::SeqCst), 1);
        assert_eq!(enters.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn error_entries_count_toward_recovery_budget() {
        let mut m = StateMachine::new("err");
        m.add_transition(
            StrategyState::Initializing,
            TransitionTrigger::SystemError,
            StrategyState::Error,
        );
        m.add_transition(
            StrategyState::Error,
            TransitionTrigger::MarketOpen,
            StrategyState::Initializing,
        );
        for _ in 0..MAX_RECOVERABLE_ERRORS {
            assert!(m.is_recoverable());
            m.trigger(TransitionTrigger::SystemError, &Value::Null);
            m.trigger(TransitionTrigger::MarketOpen, &Value::Null);
        }
        assert!(!m.is_recoverable());
    }

    #[test]
    fn history_is_bounded() {
        let mut m = StateMachine::new("ring");
        m.add_transition(
            StrategyState::Initializing,
            TransitionTrigger::MarketOpen,
            StrategyState::Ready,
        );
        m.add_transition(
            StrategyState::Ready,
            TransitionTrigger::MarketClose,
            StrategyState::Initializing,
        );
        for _ in 0..120 {
            m.trigger(TransitionTrigger::MarketOpen, &Value::Null);
            m.trigger(TransitionTrigger::MarketClose, &Value::Null);
        }
        assert_eq!(m.history().count(), 100);
    }
}
