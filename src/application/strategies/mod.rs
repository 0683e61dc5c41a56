mod futures_strangle;
mod ipmcc;
mod leap_ladder;
mod lt112;
mod zero_dte;

pub use futures_strangle::FuturesStrangleStrategy;
pub use ipmcc::IpmccStrategy;
pub use leap_ladder::LeapLadderStrategy;
pub use lt112::Lt112Strategy;
pub use zero_dte::{CondorStructure, ZeroDteConfig, ZeroDteStrategy};

use crate::application::strategy_base::StrategyServices;
use crate::domain::options::{ChainEntry, OptionRight};
use crate::domain::positions::{MultiLegPosition, PositionComponent};
use chrono::{Datelike, NaiveDate, Weekday};
use rust_decimal::prelude::ToPrimitive;
use std::sync::Arc;
use tracing::warn;

/// Chain entry whose quoted delta is closest to `target` (absolute).
pub(crate) fn nearest_by_delta<'a>(
    chain: &'a [ChainEntry],
    right: OptionRight,
    expiry: NaiveDate,
    target: f64,
) -> Option<&'a ChainEntry> {
    chain
        .iter()
        .filter(|entry| entry.contract.right == right && entry.contract.expiry == expiry)
        .filter_map(|entry| {
            entry
                .delta
                .map(|delta| (entry, (delta.abs() - target.abs()).abs()))
        })
        .min_by(|a, b| a.1.total_cmp(&b.1))
        .map(|(entry, _)| entry)
}

/// First expiry in the chain whose DTE falls inside `[min_dte, max_dte]`.
pub(crate) fn expiry_in_range(
    chain: &[ChainEntry],
    today: NaiveDate,
    min_dte: i64,
    max_dte: i64,
) -> Option<NaiveDate> {
    let mut expiries: Vec<NaiveDate> = chain
        .iter()
        .map(|entry| entry.contract.expiry)
        .filter(|expiry| {
            let dte = (*expiry - today).num_days();
            dte >= min_dte && dte <= max_dte
        })
        .collect();
    expiries.sort();
    expiries.dedup();
    expiries.first().copied()
}

/// First occurrence of `weekday` in the month containing `today`.
pub(crate) fn first_weekday_of_month(today: NaiveDate, weekday: Weekday) -> NaiveDate {
    let mut day = NaiveDate::from_ymd_opt(today.year(), today.month(), 1).expect("first of month");
    while day.weekday() != weekday {
        day = day.succ_opt().expect("in-month day");
    }
    day
}

/// Monthly entry anchor: the first Wednesday.
pub(crate) fn is_monthly_anchor(today: NaiveDate) -> bool {
    today == first_weekday_of_month(today, Weekday::Wed)
}

/// Quarterly anchor: the monthly anchor of January, April, July, October.
pub(crate) fn is_quarterly_anchor(today: NaiveDate) -> bool {
    matches!(today.month(), 1 | 4 | 7 | 10) && is_monthly_anchor(today)
}

/// Buy back (or sell out) one component at market and close its record.
pub(crate) async fn close_component_at_market(
    services: &Arc<StrategyServices>,
    position: &MultiLegPosition,
    component: &PositionComponent,
    tag: &str,
) -> Result<(), String> {
    let symbol = component.contract.symbol();
    services
        .broker
        .market_order(&symbol, -component.quantity, tag)
        .await
        .map_err(|e| e.to_string())?;
    services
        .positions
        .close_component(position.id, component.id)
        .await
        .map_err(|e| e.to_string())?;
    Ok(())
}

/// Fraction of the entry premium a short component has decayed, positive
/// when profitable.
pub(crate) fn short_decay_fraction(component: &PositionComponent) -> f64 {
    let entry = component.entry_price.to_f64().unwrap_or(0.0);
    let current = component.current_price.to_f64().unwrap_or(0.0);
    if entry <= 0.0 {
        warn!(symbol = %component.contract.symbol(), "component without entry price");
        return 0.0;
    }
    (entry - current) / entry
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::options::ContractRef;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    fn entry(strike: Decimal, right: OptionRight, expiry: NaiveDate, delta: f64) -> ChainEntry {
        ChainEntry {
            contract: ContractRef::new("SPY", strike, expiry, right),
            bid: dec!(1.00),
            ask: dec!(1.10),
            last: dec!(1.05),
            implied_volatility: Some(0.22),
            delta: Some(delta),
        }
    }

    #[test]
    fn nearest_delta_picks_closest() {
        let expiry = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
        let chain = vec![
            entry(dec!(447), OptionRight::Put, expiry, -0.17),
            entry(dec!(445), OptionRight::Put, expiry, -0.12),
            entry(dec!(442), OptionRight::Put, expiry, -0.05),
        ];
        let pick = nearest_by_delta(&chain, OptionRight::Put, expiry, 0.16).unwrap();
        assert_eq!(pick.contract.strike, dec!(447));
        let pick = nearest_by_delta(&chain, OptionRight::Put, expiry, 0.05).unwrap();
        assert_eq!(pick.contract.strike, dec!(442));
    }

    #[test]
    fn expiry_range_filters_dte() {
        let today = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
        let near = NaiveDate::from_ymd_opt(2024, 3, 15).unwrap();
        let target = NaiveDate::from_ymd_opt(2024, 6, 21).unwrap();
        let chain = vec![
            entry(dec!(440), OptionRight::Put, near, -0.2),
            entry(dec!(440), OptionRight::Put, target, -0.2),
        ];
        assert_eq!(expiry_in_range(&chain, today, 100, 120), Some(target));
        assert_eq!(expiry_in_range(&chain, today, 200, 300), None);
    }

    #[test]
    fn anchors() {
        // March 2024: the 6th is the first Wednesday.
        assert!(is_monthly_anchor(NaiveDate::from_ymd_opt(2024, 3, 6).unwrap()));
        assert!(!is_monthly_anchor(NaiveDate::from_ymd_opt(2024, 3, 13).unwrap()));
        // April 3rd 2024 is a quarterly anchor; March 6th is not.
        assert!(is_quarterly_anchor(NaiveDate::from_ymd_opt(2024, 4, 3).unwrap()));
        assert!(!is_quarterly_anchor(NaiveDate::from_ymd_opt(2024, 3, 6).unwrap()));
    }
}
