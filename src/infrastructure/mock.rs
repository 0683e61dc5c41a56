use crate::domain::errors::{MarketDataError, TradingError};
use crate::domain::options::{ChainEntry, ContractRef, OptionRight};
use crate::domain::orders::{OrderLeg, OrderStatus, OrderTicket, RejectReason};
use crate::domain::ports::{AccountSnapshot, BrokerAdapter, Holding, MarketDataAdapter, Quote};
use async_trait::async_trait;
use chrono::{Duration, NaiveDate, NaiveDateTime};
use rust_decimal::Decimal;
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal_macros::dec;
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Scripted market-data adapter with a controllable clock. Backs the test
/// scenarios and the paper binary.
pub struct MockMarketData {
    inner: RwLock<MarketDataState>,
}

struct MarketDataState {
    prices: HashMap<String, Decimal>,
    session_opens: HashMap<String, Decimal>,
    chains: HashMap<String, Vec<ChainEntry>>,
    now: NaiveDateTime,
    market_open: bool,
    quote_age: Duration,
}

impl MockMarketData {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(MarketDataState {
                prices: HashMap::new(),
                session_opens: HashMap::new(),
                chains: HashMap::new(),
                now: NaiveDate::from_ymd_opt(2024, 3, 1)
                    .unwrap()
                    .and_hms_opt(9, 30, 0)
                    .unwrap(),
                market_open: true,
                quote_age: Duration::zero(),
            }),
        }
    }

    pub async fn set_price(&self, symbol: &str, price: Decimal) {
        let mut state = self.inner.write().await;
        state
            .session_opens
            .entry(symbol.to_string())
            .or_insert(price);
        state.prices.insert(symbol.to_string(), price);
    }

    pub async fn set_session_open(&self, symbol: &str, open: Decimal) {
        self.inner
            .write()
            .await
            .session_opens
            .insert(symbol.to_string(), open);
    }

    pub async fn set_time(&self, now: NaiveDateTime) {
        self.inner.write().await.now = now;
    }

    pub async fn advance(&self, delta: Duration) {
        self.inner.write().await.now += delta;
    }

    pub async fn set_market_open(&self, open: bool) {
        self.inner.write().await.market_open = open;
    }

    pub async fn set_quote_age(&self, age: Duration) {
        self.inner.write().await.quote_age = age;
    }

    pub async fn set_chain(&self, underlying: &str, chain: Vec<ChainEntry>) {
        self.inner
            .write()
            .await
            .chains
            .insert(underlying.to_string(), chain);
    }

    /// Build a synthetic chain around `spot`: integer strikes within +/-12%,
    /// crude distance-based deltas, flat IV. Enough for delta-targeted
    /// strike selection in tests.
    pub async fn seed_synthetic_chain(&self, underlying: &str, spot: Decimal, expiry: NaiveDate) {
        let spot_f = spot.to_f64().unwrap_or(0.0);
        let step = (spot_f * 0.01).max(1.0).round();
        let mut chain = Vec::new();
        let mut strike = (spot_f * 0.88 / step).floor() * step;
        while strike <= spot_f * 1.12 {
            for right in [OptionRight::Put, OptionRight::Call] {
                let distance = (strike - spot_f) / spot_f;
                let delta = match right {
                    // Crude monotone delta by moneyness, adequate for tests.
                    OptionRight::Call => (0.5 - distance * 6.0).clamp(0.01, 0.99),
                    OptionRight::Put => (-0.5 - distance * 6.0).clamp(-0.99, -0.01),
                };
                let intrinsic = match right {
                    OptionRight::Call => (spot_f - strike).max(0.0),
                    OptionRight::Put => (strike - spot_f).max(0.0),
                };
                let premium = Decimal::from_f64(intrinsic + spot_f * 0.004 * delta.abs() * 10.0)
                    .unwrap_or(dec!(0.05))
                    .round_dp(2)
                    .max(dec!(0.05));
                let strike_dec = Decimal::from_f64(strike).unwrap_or_default().normalize();
                chain.push(ChainEntry {
                    contract: ContractRef::new(underlying, strike_dec, expiry, right),
                    bid: (premium - dec!(0.05)).max(dec!(0.01)),
                    ask: premium + dec!(0.05),
                    last: premium,
                    implied_volatility: Some(0.22),
                    delta: Some(delta),
                });
            }
            strike += step;
        }
        self.set_chain(underlying, chain).await;
    }
}

impl Default for MockMarketData {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MarketDataAdapter for MockMarketData {
    async fn price(&self, symbol: &str) -> Result<Decimal, MarketDataError> {
        self.inner
            .read()
            .await
            .prices
            .get(symbol)
            .copied()
            .ok_or_else(|| MarketDataError::NoPrice {
                symbol: symbol.to_string(),
            })
    }

    async fn session_open(&self, symbol: &str) -> Result<Decimal, MarketDataError> {
        self.inner
            .read()
            .await
            .session_opens
            .get(symbol)
            .copied()
            .ok_or_else(|| MarketDataError::NoPrice {
                symbol: symbol.to_string(),
            })
    }

    async fn quote(&self, symbol: &str) -> Result<Quote, MarketDataError> {
        let state = self.inner.read().await;
        let last = state
            .prices
            .get(symbol)
            .copied()
            .ok_or_else(|| MarketDataError::NoPrice {
                symbol: symbol.to_string(),
            })?;
        Ok(Quote {
            symbol: symbol.to_string(),
            bid: last - dec!(0.01),
            ask: last + dec!(0.01),
            last,
            as_of: state.now - state.quote_age,
        })
    }

    async fn option_chain(
        &self,
        underlying: &str,
        _as_of: NaiveDate,
    ) -> Result<Vec<ChainEntry>, MarketDataError> {
        let state = self.inner.read().await;
        state
            .chains
            .get(underlying)
            .cloned()
            .filter(|c| !c.is_empty())
            .ok_or_else(|| MarketDataError::EmptyChain {
                underlying: underlying.to_string(),
            })
    }

    async fn is_market_open(&self, _symbol: &str) -> bool {
        self.inner.read().await.market_open
    }

    async fn market_time(&self) -> NaiveDateTime {
        self.inner.read().await.now
    }
}

/// Scripted brokerage: immediate fills, per-symbol scripted rejects, net
/// quantity bookkeeping for atomicity assertions.
pub struct MockBroker {
    inner: RwLock<BrokerState>,
    supports_combo: bool,
}

struct BrokerState {
    account: AccountSnapshot,
    holdings: HashMap<String, Holding>,
    tickets: HashMap<Uuid, OrderTicket>,
    fill_prices: HashMap<String, Decimal>,
    scripted_rejects: HashMap<String, RejectReason>,
    cancelled: Vec<Uuid>,
}

impl MockBroker {
    pub fn new() -> Self {
        Self::with_combo_support(true)
    }

    pub fn with_combo_support(supports_combo: bool) -> Self {
        Self {
            inner: RwLock::new(BrokerState {
                account: AccountSnapshot {
                    portfolio_value: dec!(100000),
                    cash: dec!(60000),
                    margin_used: dec!(20000),
                    margin_remaining: dec!(40000),
                    buying_power: dec!(80000),
                },
                holdings: HashMap::new(),
                tickets: HashMap::new(),
                fill_prices: HashMap::new(),
                scripted_rejects: HashMap::new(),
                cancelled: Vec::new(),
            }),
            supports_combo,
        }
    }

    pub async fn set_account(&self, account: AccountSnapshot) {
        self.inner.write().await.account = account;
    }

    pub async fn set_portfolio_value(&self, value: Decimal) {
        self.inner.write().await.account.portfolio_value = value;
    }

    pub async fn set_fill_price(&self, symbol: &str, price: Decimal) {
        self.inner
            .write()
            .await
            .fill_prices
            .insert(symbol.to_string(), price);
    }

    pub async fn script_reject(&self, symbol: &str, reason: RejectReason) {
        self.inner
            .write()
            .await
            .scripted_rejects
            .insert(symbol.to_string(), reason);
    }

    pub async fn net_quantity(&self, symbol: &str) -> i64 {
        self.inner
            .read()
            .await
            .holdings
            .get(symbol)
            .map_or(0, |h| h.quantity)
    }

    pub async fn cancelled_orders(&self) -> Vec<Uuid> {
        self.inner.read().await.cancelled.clone()
    }

    pub async fn set_holding(&self, symbol: &str, quantity: i64, average_price: Decimal) {
        let mut state = self.inner.write().await;
        state.holdings.insert(
            symbol.to_string(),
            Holding {
                symbol: symbol.to_string(),
                quantity,
                average_price,
                market_value: average_price * Decimal::from(quantity),
            },
        );
    }

    fn filled_ticket(symbol: &str, quantity: i64, price: Decimal) -> OrderTicket {
        let id = Uuid::new_v4();
        OrderTicket {
            order_id: id,
            broker_order_id: format!("mock-{id}"),
            symbol: symbol.to_string(),
            status: OrderStatus::Filled,
            filled_quantity: quantity,
            avg_fill_price: price,
            reject_reason: None,
        }
    }

    fn rejected_ticket(symbol: &str, reason: RejectReason) -> OrderTicket {
        let id = Uuid::new_v4();
        OrderTicket {
            order_id: id,
            broker_order_id: format!("mock-{id}"),
            symbol: symbol.to_string(),
            status: OrderStatus::Rejected,
            filled_quantity: 0,
            avg_fill_price: Decimal::ZERO,
            reject_reason: Some(reason),
        }
    }

    async fn fill(&self, symbol: &str, quantity: i64) -> OrderTicket {
        let mut state = self.inner.write().await;
        if let Some(reason) = state.scripted_rejects.get(symbol).cloned() {
            let ticket = Self::rejected_ticket(symbol, reason);
            state.tickets.insert(ticket.order_id, ticket.clone());
            return ticket;
        }
        let price = state.fill_prices.get(symbol).copied().unwrap_or(Decimal::ZERO);
        let holding = state
            .holdings
            .entry(symbol.to_string())
            .or_insert_with(|| Holding {
                symbol: symbol.to_string(),
                quantity: 0,
                average_price: price,
                market_value: Decimal::ZERO,
            });
        holding.quantity += quantity;
        holding.average_price = price;
        let ticket = Self::filled_ticket(symbol, quantity, price);
        state.tickets.insert(ticket.order_id, ticket.clone());
        ticket
    }
}

impl Default for MockBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BrokerAdapter for MockBroker {
    async fn market_order(
        &self,
        symbol: &str,
        quantity: i64,
        _tag: &str,
    ) -> Result<OrderTicket, TradingError> {
        Ok(self.fill(symbol, quantity).await)
    }

    async fn limit_order(
        &self,
        symbol: &str,
        quantity: i64,
        _limit: Decimal,
        _tag: &str,
    ) -> Result<OrderTicket, TradingError> {
        Ok(self.fill(symbol, quantity).await)
    }

    async fn combo_order(
        &self,
        legs: &[OrderLeg],
        quantity: i64,
        _tag: &str,
    ) -> Result<OrderTicket, TradingError> {
        // Atomic: reject the whole combo if any leg is scripted to fail.
        {
            let state = self.inner.read().await;
            for leg in legs {
                if let Some(reason) = state.scripted_rejects.get(&leg.contract.symbol()) {
                    return Ok(Self::rejected_ticket(&leg.contract.symbol(), reason.clone()));
                }
            }
        }
        let mut last = None;
        for leg in legs {
            last = Some(self.fill(&leg.contract.symbol(), leg.quantity * quantity).await);
        }
        Ok(last.unwrap_or_else(|| Self::filled_ticket("combo", 0, Decimal::ZERO)))
    }

    async fn cancel(&self, order_id: Uuid) -> Result<(), TradingError> {
        let mut state = self.inner.write().await;
        state.cancelled.push(order_id);
        if let Some(ticket) = state.tickets.get_mut(&order_id) {
            if !ticket.status.is_terminal() {
                ticket.status = OrderStatus::Cancelled;
            }
        }
        Ok(())
    }

    async fn open_orders(&self) -> Vec<OrderTicket> {
        self.inner
            .read()
            .await
            .tickets
            .values()
            .filter(|t| !t.status.is_terminal())
            .cloned()
            .collect()
    }

    async fn order_status(&self, order_id: Uuid) -> Result<OrderTicket, TradingError> {
        self.inner
            .read()
            .await
            .tickets
            .get(&order_id)
            .cloned()
            .ok_or(TradingError::OrderNotFound { order_id })
    }

    async fn portfolio(&self) -> HashMap<String, Holding> {
        self.inner.read().await.holdings.clone()
    }

    async fn account(&self) -> AccountSnapshot {
        self.inner.read().await.account.clone()
    }

    fn supports_combo(&self) -> bool {
        self.supports_combo
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::positions::LegRole;

    #[tokio::test]
    async fn scripted_reject_blocks_combo_atomically() {
        let broker = MockBroker::new();
        let expiry = NaiveDate::from_ymd_opt(2024, 3, 15).unwrap();
        let good = ContractRef::new("SPY", dec!(440), expiry, OptionRight::Put);
        let bad = ContractRef::new("SPY", dec!(445), expiry, OptionRight::Put);
        broker.script_reject(&bad.symbol(), RejectReason::InvalidSymbol).await;

        let legs = vec![
            OrderLeg::new(good.clone(), 1, LegRole::LongPut),
            OrderLeg::new(bad.clone(), -1, LegRole::ShortPut),
        ];
        let ticket = broker.combo_order(&legs, 1, "test").await.unwrap();
        assert_eq!(ticket.status, OrderStatus::Rejected);
        assert_eq!(broker.net_quantity(&good.symbol()).await, 0);
        assert_eq!(broker.net_quantity(&bad.symbol()).await, 0);
    }

    #[tokio::test]
    async fn market_order_updates_net_quantity() {
        let broker = MockBroker::new();
        broker.market_order("SPY", 5, "t").await.unwrap();
        broker.market_order("SPY", -2, "t").await.unwrap();
        assert_eq!(broker.net_quantity("SPY").await, 3);
    }

    #[tokio::test]
    async fn synthetic_chain_has_both_rights() {
        let md = MockMarketData::new();
        let expiry = NaiveDate::from_ymd_opt(2024, 3, 15).unwrap();
        md.seed_synthetic_chain("SPY", dec!(450), expiry).await;
        let chain = md.option_chain("SPY", expiry.pred_opt().unwrap()).await.unwrap();
        assert!(chain.iter().any(|e| e.contract.right == OptionRight::Call));
        assert!(chain.iter().any(|e| e.contract.right == OptionRight::Put));
        assert!(chain.iter().all(|e| e.delta.is_some()));
    }
}
