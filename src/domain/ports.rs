use crate::domain::errors::{MarketDataError, PersistenceError, TradingError};
use crate::domain::options::ChainEntry;
use crate::domain::orders::{OrderLeg, OrderTicket};
use async_trait::async_trait;
use chrono::{NaiveDate, NaiveDateTime};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// One holding as the brokerage reports it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Holding {
    pub symbol: String,
    pub quantity: i64,
    pub average_price: Decimal,
    pub market_value: Decimal,
}

/// Account snapshot consumed by risk and sizing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountSnapshot {
    pub portfolio_value: Decimal,
    pub cash: Decimal,
    pub margin_used: Decimal,
    pub margin_remaining: Decimal,
    pub buying_power: Decimal,
}

impl AccountSnapshot {
    pub fn margin_ratio(&self) -> f64 {
        use rust_decimal::prelude::ToPrimitive;
        if self.portfolio_value.is_zero() {
            return 0.0;
        }
        (self.margin_used / self.portfolio_value).to_f64().unwrap_or(0.0)
    }
}

/// Brokerage adapter. The core treats every call as synchronous-with-cache;
/// live implementations are out of scope, mocks live in infrastructure.
#[async_trait]
pub trait BrokerAdapter: Send + Sync {
    async fn market_order(
        &self,
        symbol: &str,
        quantity: i64,
        tag: &str,
    ) -> Result<OrderTicket, TradingError>;

    async fn limit_order(
        &self,
        symbol: &str,
        quantity: i64,
        limit: Decimal,
        tag: &str,
    ) -> Result<OrderTicket, TradingError>;

    async fn combo_order(
        &self,
        legs: &[OrderLeg],
        quantity: i64,
        tag: &str,
    ) -> Result<OrderTicket, TradingError>;

    async fn cancel(&self, order_id: Uuid) -> Result<(), TradingError>;

    async fn open_orders(&self) -> Vec<OrderTicket>;

    async fn order_status(&self, order_id: Uuid) -> Result<OrderTicket, TradingError>;

    async fn portfolio(&self) -> HashMap<String, Holding>;

    async fn account(&self) -> AccountSnapshot;

    /// Whether the broker accepts native combo orders. When false the
    /// atomic executor falls back to leg-by-leg submission with reversal.
    fn supports_combo(&self) -> bool {
        true
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Quote {
    pub symbol: String,
    pub bid: Decimal,
    pub ask: Decimal,
    pub last: Decimal,
    pub as_of: NaiveDateTime,
}

/// Market-data adapter. Times are wall-clock in the market timezone
/// (America/New_York); the adapter owns the clock so backtests can drive it.
#[async_trait]
pub trait MarketDataAdapter: Send + Sync {
    async fn price(&self, symbol: &str) -> Result<Decimal, MarketDataError>;

    /// Today's session open, for morning-move analysis.
    async fn session_open(&self, symbol: &str) -> Result<Decimal, MarketDataError>;

    async fn quote(&self, symbol: &str) -> Result<Quote, MarketDataError>;

    async fn option_chain(
        &self,
        underlying: &str,
        as_of: NaiveDate,
    ) -> Result<Vec<ChainEntry>, MarketDataError>;

    async fn is_market_open(&self, symbol: &str) -> bool;

    /// Current wall-clock time in the market timezone.
    async fn market_time(&self) -> NaiveDateTime;
}

/// Opaque key/value object store. The core uses two keys:
/// `state_machines` and `positions`.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn has(&self, key: &str) -> bool;

    async fn read(&self, key: &str) -> Result<Vec<u8>, PersistenceError>;

    async fn save(&self, key: &str, bytes: &[u8]) -> Result<(), PersistenceError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn margin_ratio() {
        let account = AccountSnapshot {
            portfolio_value: dec!(100000),
            cash: dec!(40000),
            margin_used: dec!(85000),
            margin_remaining: dec!(15000),
            buying_power: dec!(30000),
        };
        assert!((account.margin_ratio() - 0.85).abs() < 1e-9);
    }
}
