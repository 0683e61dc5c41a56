//! Scenario: the 21-DTE defensive exit fires even with margin pressure at
//! 0.85 and the position sitting on a profit. Nothing intercepts it.

mod common;

use chrono::{Duration, NaiveDate};
use common::{at, harness, tick};
use rust_decimal_macros::dec;
use serde_json::Value;
use wingspan::application::coordinator::CoordinatedStrategy;
use wingspan::domain::options::{ContractRef, OptionRight};
use wingspan::domain::ports::AccountSnapshot;
use wingspan::domain::positions::{ComponentStatus, LegRole, PositionComponent};
use wingspan::domain::states::{StrategyState, TransitionTrigger};

#[tokio::test]
async fn defensive_exit_overrides_margin_pressure() {
    let h = harness().await;
    let today = NaiveDate::from_ymd_opt(2024, 3, 4).unwrap(); // Monday
    h.market.set_time(at(today, 11, 0)).await;

    // Margin used at 85% of portfolio value.
    h.broker
        .set_account(AccountSnapshot {
            portfolio_value: dec!(100000),
            cash: dec!(5000),
            margin_used: dec!(85000),
            margin_remaining: dec!(5000),
            buying_power: dec!(10000),
        })
        .await;

    // A short put at exactly 21 DTE, 10% in profit.
    let expiry = today + Duration::days(21);
    let contract = ContractRef::new("SPY", dec!(440), expiry, OptionRight::Put);
    let symbol = contract.symbol();
    let mut short_put =
        PositionComponent::new("lt112", LegRole::NakedPut, contract, -2, dec!(3.00));
    short_put.status = ComponentStatus::Open;
    short_put.current_price = dec!(2.70);
    short_put.recompute_pnl();
    let position_id = h
        .container
        .positions
        .open_position("lt112", "SPY", vec![short_put])
        .await;

    // Put the owning strategy into Managing.
    let runner = h
        .container
        .engine
        .runners()
        .iter()
        .find(|r| r.name() == "lt112")
        .unwrap()
        .clone();
    {
        let machine = runner.machine();
        let mut machine = machine.lock().unwrap();
        for trigger in [
            TransitionTrigger::MarketOpen,
            TransitionTrigger::TimeWindowStart,
            TransitionTrigger::EntryConditionsMet,
            TransitionTrigger::OrderFilled,
            TransitionTrigger::MarketOpen,
        ] {
            machine.trigger(trigger, &Value::Null);
        }
        assert_eq!(machine.state(), StrategyState::Managing);
    }

    // The margin broadcast happens on this tick too; it must not suspend a
    // managing strategy, and the defensive exit must fire.
    tick(&h, dec!(450)).await;
    assert_eq!(runner.current_state(), StrategyState::Exiting);

    h.market.set_time(at(today, 11, 5)).await;
    tick(&h, dec!(450)).await;
    assert_eq!(runner.current_state(), StrategyState::Closed);
    assert!(h.container.positions.get(position_id).await.is_none());
    assert_eq!(h.broker.net_quantity(&symbol).await, 2, "short put bought back");
}

#[tokio::test]
async fn margin_pressure_still_suspends_idle_strategies() {
    let h = harness().await;
    let today = NaiveDate::from_ymd_opt(2024, 3, 4).unwrap();
    h.market.set_time(at(today, 11, 0)).await;
    h.broker
        .set_account(AccountSnapshot {
            portfolio_value: dec!(100000),
            cash: dec!(5000),
            margin_used: dec!(85000),
            margin_remaining: dec!(5000),
            buying_power: dec!(10000),
        })
        .await;

    let runner = h
        .container
        .engine
        .runners()
        .iter()
        .find(|r| r.name() == "leap_ladder")
        .unwrap()
        .clone();

    tick(&h, dec!(450)).await;
    // A strategy without exposure is parked by the margin-call broadcast.
    assert_eq!(runner.current_state(), StrategyState::Suspended);
}
