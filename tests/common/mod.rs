#![allow(dead_code)]

use chrono::{NaiveDate, NaiveDateTime};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::HashMap;
use std::sync::Arc;
use wingspan::application::vix_manager::VixCacheProfile;
use wingspan::domain::options::{ChainEntry, ContractRef, OptionRight};
use wingspan::infrastructure::container::{ServiceContainer, bootstrap};
use wingspan::infrastructure::mock::{MockBroker, MockMarketData};
use wingspan::infrastructure::persistence::InMemoryStore;

pub struct Harness {
    pub container: ServiceContainer,
    pub market: Arc<MockMarketData>,
    pub broker: Arc<MockBroker>,
}

/// Bootstrapped core over scripted adapters: SPY at 450, calm VIX, an open
/// market, throttles removed so every tick advances each strategy a step.
pub async fn harness() -> Harness {
    harness_with_broker(Arc::new(MockBroker::new())).await
}

pub async fn harness_with_broker(broker: Arc<MockBroker>) -> Harness {
    let market = Arc::new(MockMarketData::new());
    market.set_price("VIX", dec!(18)).await;
    market.set_price("SPY", dec!(450)).await;

    let container = bootstrap(
        market.clone(),
        broker.clone(),
        Arc::new(InMemoryStore::new()),
        VixCacheProfile::Backtest,
    )
    .await
    .expect("bootstrap");

    for name in ["zero_dte", "lt112", "ipmcc", "futures_strangle", "leap_ladder"] {
        container
            .coordinator
            .set_min_interval(name, chrono::Duration::zero());
    }
    Harness {
        container,
        market,
        broker,
    }
}

pub fn at(date: NaiveDate, h: u32, m: u32) -> NaiveDateTime {
    date.and_hms_opt(h, m, 0).expect("valid time")
}

pub fn chain_entry(
    underlying: &str,
    strike: Decimal,
    expiry: NaiveDate,
    right: OptionRight,
    delta: f64,
    mid: Decimal,
) -> ChainEntry {
    ChainEntry {
        contract: ContractRef::new(underlying, strike, expiry, right),
        bid: mid - dec!(0.05),
        ask: mid + dec!(0.05),
        last: mid,
        implied_volatility: Some(0.22),
        delta: Some(delta),
    }
}

pub async fn tick(harness: &Harness, spy: Decimal) {
    let mut prices = HashMap::new();
    prices.insert("SPY".to_string(), spy);
    harness.container.engine.on_tick(&prices).await;
}

/// The four-leg Friday chain used by the 0DTE scenarios: 0.16-delta shorts
/// at 447/453, 0.05-delta wings at 442/458, plus in-between strikes so the
/// delta targeting has something to reject.
pub async fn seed_friday_chain(harness: &Harness, expiry: NaiveDate) {
    let chain = vec![
        chain_entry("SPY", dec!(447), expiry, OptionRight::Put, -0.16, dec!(1.20)),
        chain_entry("SPY", dec!(445), expiry, OptionRight::Put, -0.11, dec!(0.85)),
        chain_entry("SPY", dec!(442), expiry, OptionRight::Put, -0.05, dec!(0.40)),
        chain_entry("SPY", dec!(453), expiry, OptionRight::Call, 0.16, dec!(1.10)),
        chain_entry("SPY", dec!(455), expiry, OptionRight::Call, 0.11, dec!(0.75)),
        chain_entry("SPY", dec!(458), expiry, OptionRight::Call, 0.05, dec!(0.35)),
    ];
    harness.market.set_chain("SPY", chain).await;
}
