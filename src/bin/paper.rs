//! Paper-trading session against the mock adapters: exercises bootstrap,
//! the tick pipeline, and persistence without touching a live broker.

use anyhow::Result;
use chrono::{Duration, NaiveDate};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;
use wingspan::application::coordinator::CoordinatedStrategy;
use wingspan::config::Config;
use wingspan::application::strategies::ZeroDteConfig;
use wingspan::infrastructure::container::bootstrap_with;
use wingspan::infrastructure::mock::{MockBroker, MockMarketData};
use wingspan::infrastructure::persistence::FileStore;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = Config::from_env()?;
    info!(mode = ?config.mode, "starting paper session");

    let market = Arc::new(MockMarketData::new());
    let broker = Arc::new(MockBroker::new());
    let store = Arc::new(FileStore::new(&config.state_dir));

    // A Friday morning with tradable 0DTE volatility.
    let session_date = NaiveDate::from_ymd_opt(2024, 3, 1).expect("valid date");
    market
        .set_time(session_date.and_hms_opt(9, 30, 0).expect("valid time"))
        .await;
    market.set_price("VIX", dec!(24)).await;
    market.set_price("SPY", dec!(450)).await;
    market.set_price("/ES", dec!(5100)).await;
    market
        .seed_synthetic_chain("SPY", dec!(450), session_date)
        .await;

    let zero_dte = ZeroDteConfig {
        max_contracts: config.strategy.zero_dte_max_contracts,
        profit_target: config.strategy.zero_dte_profit_target,
        stop_loss: config.strategy.zero_dte_stop_loss,
    };
    let container = bootstrap_with(
        market.clone(),
        broker.clone(),
        store,
        config.mode.vix_profile(),
        zero_dte,
    )
    .await
    .map_err(|e| anyhow::anyhow!("bootstrap failed: {e}"))?;
    container.engine.restore_states().await;

    // Walk the session in five-minute ticks with a gentle drift.
    let mut spy = dec!(450);
    for tick in 0..78 {
        market.advance(Duration::minutes(5)).await;
        spy += Decimal::from(tick % 3) * dec!(0.25) - dec!(0.25);
        market.set_price("SPY", spy).await;

        let mut prices = HashMap::new();
        prices.insert("SPY".to_string(), spy);
        prices.insert("VIX".to_string(), dec!(24));
        container.engine.on_tick(&prices).await;
    }

    container.engine.save_states().await;
    let metrics = container.optimizer.metrics();
    info!(
        processed = metrics.events_processed,
        skipped = metrics.events_skipped,
        savings_ms = metrics.computational_savings_ms,
        "session complete"
    );
    for runner in container.engine.runners() {
        info!(
            strategy = runner.name(),
            state = %runner.current_state(),
            "final strategy state"
        );
    }
    Ok(())
}
