//! Restart recovery: strategy states and positions written by one core
//! instance come back byte-faithful in a fresh instance over the same
//! object store.

mod common;

use chrono::NaiveDate;
use common::{at, harness, seed_friday_chain, tick};
use rust_decimal_macros::dec;
use std::sync::Arc;
use wingspan::application::coordinator::CoordinatedStrategy;
use wingspan::application::vix_manager::VixCacheProfile;
use wingspan::domain::states::StrategyState;
use wingspan::infrastructure::container::bootstrap;
use wingspan::infrastructure::mock::{MockBroker, MockMarketData};
use wingspan::infrastructure::persistence::InMemoryStore;

#[tokio::test]
async fn states_and_positions_survive_restart() {
    // Run a condor entry so there is real state to persist.
    let h = harness().await;
    let friday = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
    h.market.set_time(at(friday, 10, 30)).await;
    h.market.set_price("VIX", dec!(24)).await;
    h.market.set_session_open("SPY", dec!(449.55)).await;
    h.market.set_price("SPY", dec!(450)).await;
    seed_friday_chain(&h, friday).await;

    for minutes in [0i64, 5, 10, 15] {
        h.market
            .set_time(at(friday, 10, 30) + chrono::Duration::minutes(minutes))
            .await;
        tick(&h, dec!(450)).await;
    }
    let runner = h
        .container
        .engine
        .runners()
        .iter()
        .find(|r| r.name() == "zero_dte")
        .unwrap()
        .clone();
    assert_eq!(runner.current_state(), StrategyState::Managing);
    let before = h.container.positions.positions_for("zero_dte").await;
    assert_eq!(before.len(), 1);

    h.container.engine.save_states().await;
    let snapshot_store = h.container.store.clone();

    // Cold start over the same store.
    let market = Arc::new(MockMarketData::new());
    market.set_price("VIX", dec!(24)).await;
    market.set_price("SPY", dec!(450)).await;
    let restarted = bootstrap(
        market,
        Arc::new(MockBroker::new()),
        snapshot_store,
        VixCacheProfile::Backtest,
    )
    .await
    .expect("bootstrap after restart");
    restarted.engine.restore_states().await;

    let restored_runner = restarted
        .engine
        .runners()
        .iter()
        .find(|r| r.name() == "zero_dte")
        .unwrap();
    assert_eq!(restored_runner.current_state(), StrategyState::Managing);

    let after = restarted.positions.positions_for("zero_dte").await;
    assert_eq!(after.len(), 1);
    assert_eq!(after[0].id, before[0].id);
    assert_eq!(after[0].components.len(), before[0].components.len());
    for (id, component) in &before[0].components {
        let restored = &after[0].components[id];
        assert_eq!(restored.quantity, component.quantity);
        assert_eq!(restored.entry_price, component.entry_price);
        assert_eq!(restored.status, component.status);
        assert_eq!(restored.order_link, component.order_link);
    }
}

#[tokio::test]
async fn fresh_store_restores_nothing() {
    let store = Arc::new(InMemoryStore::new());
    let market = Arc::new(MockMarketData::new());
    market.set_price("VIX", dec!(18)).await;
    market.set_price("SPY", dec!(450)).await;
    let container = bootstrap(
        market,
        Arc::new(MockBroker::new()),
        store,
        VixCacheProfile::Backtest,
    )
    .await
    .unwrap();
    container.engine.restore_states().await;
    for runner in container.engine.runners() {
        assert_eq!(runner.current_state(), StrategyState::Initializing);
    }
}
