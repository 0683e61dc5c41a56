use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OptionRight {
    Call,
    Put,
}

impl fmt::Display for OptionRight {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OptionRight::Call => write!(f, "C"),
            OptionRight::Put => write!(f, "P"),
        }
    }
}

/// Contract multiplier by underlying: /ES 50, /MES 5, equity options 100.
pub fn multiplier_for(underlying: &str) -> u32 {
    match underlying {
        "/ES" | "ES" => 50,
        "/MES" | "MES" => 5,
        _ => 100,
    }
}

/// Reference to a single option contract.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContractRef {
    pub underlying: String,
    pub strike: Decimal,
    pub expiry: NaiveDate,
    pub right: OptionRight,
    pub multiplier: u32,
}

impl ContractRef {
    pub fn new(underlying: &str, strike: Decimal, expiry: NaiveDate, right: OptionRight) -> Self {
        Self {
            underlying: underlying.to_string(),
            strike,
            expiry,
            right,
            multiplier: multiplier_for(underlying),
        }
    }

    /// Calendar days to expiry; negative once expired.
    pub fn dte(&self, today: NaiveDate) -> i64 {
        (self.expiry - today).num_days()
    }

    /// Canonical contract symbol, used as the price-map and cache key.
    pub fn symbol(&self) -> String {
        format!(
            "{} {}{}{}",
            self.underlying,
            self.expiry.format("%y%m%d"),
            self.right,
            self.strike.normalize()
        )
    }
}

impl fmt::Display for ContractRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.symbol())
    }
}

/// One row of an option chain as the market-data adapter serves it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainEntry {
    pub contract: ContractRef,
    pub bid: Decimal,
    pub ask: Decimal,
    pub last: Decimal,
    pub implied_volatility: Option<f64>,
    /// Delta as quoted by the data provider, when available.
    pub delta: Option<f64>,
}

impl ChainEntry {
    pub fn mid(&self) -> Decimal {
        (self.bid + self.ask) / Decimal::TWO
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn multiplier_table() {
        assert_eq!(multiplier_for("SPY"), 100);
        assert_eq!(multiplier_for("/ES"), 50);
        assert_eq!(multiplier_for("/MES"), 5);
    }

    #[test]
    fn dte_counts_calendar_days() {
        let c = ContractRef::new(
            "SPY",
            dec!(450),
            NaiveDate::from_ymd_opt(2024, 3, 15).unwrap(),
            OptionRight::Put,
        );
        let today = NaiveDate::from_ymd_opt(2024, 2, 23).unwrap();
        assert_eq!(c.dte(today), 21);
    }

    #[test]
    fn contract_symbol_is_stable() {
        let c = ContractRef::new(
            "SPY",
            dec!(450),
            NaiveDate::from_ymd_opt(2024, 3, 15).unwrap(),
            OptionRight::Call,
        );
        assert_eq!(c.symbol(), "SPY 240315C450");
    }
}
