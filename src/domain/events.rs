use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use uuid::Uuid;

/// Default hop budget for a chained publication.
pub const DEFAULT_MAX_HOPS: u32 = 10;

/// Every event kind the bus routes between managers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    MarketDataUpdated,
    PositionOpened,
    PositionClosed,
    PositionUpdated,
    OrderFilled,
    OrderFailure,
    GreeksCalculated,
    GreeksCalculationRequest,
    GreeksCalculationResponse,
    PerformanceThresholdBreach,
    CircuitBreakerTriggered,
    CorrelationLimitExceeded,
    ConcentrationLimitExceeded,
    MarginThresholdExceeded,
    VixRegimeChange,
    VixEmergency,
    RecoveryConditionsMet,
    SystemStateChanged,
    EmergencyHalt,
    CircularDependencyDetected,
    CacheMaintenanceRequest,
    DataStaleDetected,
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// A single event on the bus. The chain records every `(type, source)` hop
/// since the root publication so the bus can refuse cyclic republication.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub event_type: EventType,
    pub payload: Map<String, Value>,
    pub source: String,
    pub timestamp: DateTime<Utc>,
    pub correlation_id: Option<Uuid>,
    pub hops: u32,
    pub chain: Vec<(EventType, String)>,
    pub max_hops: u32,
}

impl Event {
    pub fn new(event_type: EventType, payload: Map<String, Value>, source: &str) -> Self {
        Self {
            event_type,
            payload,
            source: source.to_string(),
            timestamp: Utc::now(),
            correlation_id: None,
            hops: 0,
            chain: vec![(event_type, source.to_string())],
            max_hops: DEFAULT_MAX_HOPS,
        }
    }

    /// Derive a child event that inherits the parent's chain and correlation.
    pub fn child(&self, event_type: EventType, payload: Map<String, Value>, source: &str) -> Self {
        let mut chain = self.chain.clone();
        chain.push((event_type, source.to_string()));
        Self {
            event_type,
            payload,
            source: source.to_string(),
            timestamp: Utc::now(),
            correlation_id: self.correlation_id,
            hops: self.hops + 1,
            chain,
            max_hops: self.max_hops,
        }
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(Value::as_str)
    }

    pub fn get_f64(&self, key: &str) -> Option<f64> {
        self.payload.get(key).and_then(Value::as_f64)
    }
}

/// Severity attached to a risk event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum RiskLevel {
    Info,
    Warning,
    Critical,
    Emergency,
}

/// Kind of a risk event produced by plugins or the risk manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RiskEventKind {
    CircuitBreakerTriggered,
    CorrelationLimitExceeded,
    ConcentrationLimitExceeded,
    MarginThresholdExceeded,
    VixEmergency,
    RecoveryConditionsMet,
}

impl RiskEventKind {
    pub fn event_type(&self) -> EventType {
        match self {
            RiskEventKind::CircuitBreakerTriggered => EventType::CircuitBreakerTriggered,
            RiskEventKind::CorrelationLimitExceeded => EventType::CorrelationLimitExceeded,
            RiskEventKind::ConcentrationLimitExceeded => EventType::ConcentrationLimitExceeded,
            RiskEventKind::MarginThresholdExceeded => EventType::MarginThresholdExceeded,
            RiskEventKind::VixEmergency => EventType::VixEmergency,
            RiskEventKind::RecoveryConditionsMet => EventType::RecoveryConditionsMet,
        }
    }
}

/// A risk observation, emitted by plugins from `periodic_check`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskEvent {
    pub kind: RiskEventKind,
    pub level: RiskLevel,
    pub message: String,
    pub data: Map<String, Value>,
    pub timestamp: DateTime<Utc>,
}

impl RiskEvent {
    pub fn new(kind: RiskEventKind, level: RiskLevel, message: impl Into<String>) -> Self {
        Self {
            kind,
            level,
            message: message.into(),
            data: Map::new(),
            timestamp: Utc::now(),
        }
    }

    pub fn with_data(mut self, key: &str, value: Value) -> Self {
        self.data.insert(key.to_string(), value);
        self
    }
}

/// Convenience constructor for event payload maps.
#[macro_export]
macro_rules! payload {
    ($($key:expr => $value:expr),* $(,)?) => {{
        let mut map = serde_json::Map::new();
        $(map.insert($key.to_string(), serde_json::json!($value));)*
        map
    }};
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn child_extends_chain_and_hops() {
        let root = Event::new(EventType::MarketDataUpdated, Map::new(), "feed");
        let child = root.child(EventType::GreeksCalculated, Map::new(), "greeks");
        assert_eq!(child.hops, 1);
        assert_eq!(child.chain.len(), 2);
        assert_eq!(child.chain[0], (EventType::MarketDataUpdated, "feed".to_string()));
        assert_eq!(child.chain[1], (EventType::GreeksCalculated, "greeks".to_string()));
    }

    #[test]
    fn risk_level_ordering() {
        assert!(RiskLevel::Emergency > RiskLevel::Critical);
        assert!(RiskLevel::Warning > RiskLevel::Info);
    }

    #[test]
    fn payload_macro_builds_map() {
        let p = payload! {"symbol" => "SPY", "price" => 450.25};
        assert_eq!(p.get("symbol").unwrap().as_str(), Some("SPY"));
        assert_eq!(p.get("price").unwrap().as_f64(), Some(450.25));
    }
}
