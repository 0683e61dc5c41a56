use rust_decimal::Decimal;
use thiserror::Error;

/// Errors related to order placement and position bookkeeping
#[derive(Debug, Error)]
pub enum TradingError {
    #[error("Insufficient funds: need ${need}, available ${available}")]
    InsufficientFunds { need: Decimal, available: Decimal },

    #[error("Invalid symbol: {symbol}")]
    InvalidSymbol { symbol: String },

    #[error("Order rejected: {reason}")]
    OrderRejected { reason: String },

    #[error("Order not found: {order_id}")]
    OrderNotFound { order_id: uuid::Uuid },

    #[error("Position not found: {position_id}")]
    PositionNotFound { position_id: uuid::Uuid },

    #[error("Component not found: {component_id}")]
    ComponentNotFound { component_id: uuid::Uuid },

    #[error("Broker unavailable: {reason}")]
    BrokerUnavailable { reason: String },
}

/// Errors related to market data access
#[derive(Debug, Error)]
pub enum MarketDataError {
    #[error("No price available for {symbol}")]
    NoPrice { symbol: String },

    #[error("Stale data for {symbol}: age {age_secs}s > limit {limit_secs}s")]
    StaleData {
        symbol: String,
        age_secs: i64,
        limit_secs: i64,
    },

    #[error("Empty option chain for {underlying}")]
    EmptyChain { underlying: String },
}

/// Errors raised by the event bus
#[derive(Debug, Error)]
pub enum EventError {
    #[error("Payload rejected: {reason}")]
    InvalidPayload { reason: String },

    #[error("Handler '{handler}' failed: {reason}")]
    HandlerFailed { handler: String, reason: String },

    #[error("Request timed out after {timeout_ms}ms")]
    RequestTimeout { timeout_ms: u64 },

    #[error("Publication refused: circular event chain")]
    CircularChain,
}

/// Errors raised by state machines and the system state manager
#[derive(Debug, Error)]
pub enum StateError {
    #[error("Strategy already registered: {name}")]
    AlreadyRegistered { name: String },

    #[error("Unknown strategy: {name}")]
    UnknownStrategy { name: String },

    #[error("Snapshot malformed: {reason}")]
    MalformedSnapshot { reason: String },
}

/// Errors raised by the persistence port
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("Key not found: {key}")]
    NotFound { key: String },

    #[error("Store I/O failed: {reason}")]
    Io { reason: String },

    #[error("Corrupt payload under {key}: {reason}")]
    Corrupt { key: String, reason: String },
}

/// Errors raised during tiered bootstrap
#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error("Dependency cycle involving manager '{name}'")]
    DependencyCycle { name: String },

    #[error("Unknown dependency '{dependency}' declared by '{name}'")]
    UnknownDependency { name: String, dependency: String },

    #[error("Critical manager '{name}' failed validation: {reason}")]
    CriticalFailure { name: String, reason: String },

    #[error("Manager '{name}' not ready: {reason}")]
    NotReady { name: String, reason: String },

    #[error("Hot-path validation failed for '{name}': {reason}")]
    HotPathFailure { name: String, reason: String },
}
