use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle state of a single strategy's state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StrategyState {
    Initializing,
    Ready,
    Analyzing,
    PendingEntry,
    Entering,
    PositionOpen,
    Managing,
    Adjusting,
    PendingExit,
    Exiting,
    Closed,
    Suspended,
    Error,
}

impl StrategyState {
    /// States in which the strategy holds (or is building) market exposure.
    pub fn has_exposure(&self) -> bool {
        matches!(
            self,
            StrategyState::Entering
                | StrategyState::PositionOpen
                | StrategyState::Managing
                | StrategyState::Adjusting
                | StrategyState::PendingExit
                | StrategyState::Exiting
        )
    }
}

impl fmt::Display for StrategyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Triggers that drive strategy state transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransitionTrigger {
    MarketOpen,
    MarketClose,
    TimeWindowStart,
    TimeWindowEnd,
    EntryConditionsMet,
    EntryConditionsFailed,
    OrderFilled,
    OrderRejected,
    ProfitTargetHit,
    StopLossHit,
    DefensiveExitDte,
    AdjustmentNeeded,
    EmergencyExit,
    VixSpike,
    MarginCall,
    CorrelationLimit,
    DataStale,
    SystemError,
}

impl fmt::Display for TransitionTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// System-level state shared across all strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SystemState {
    Initializing,
    MarketClosed,
    PreMarket,
    MarketOpen,
    Emergency,
    Halted,
    ShuttingDown,
}

impl fmt::Display for SystemState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}
