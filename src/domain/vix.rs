use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Volatility regime, totally ordered from calm to panic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum VixRegime {
    Low,
    Normal,
    Elevated,
    High,
    Extreme,
    Crisis,
    Historic,
}

impl VixRegime {
    /// Classify a VIX level. Bounds are upper-inclusive:
    /// 16 / 20 / 25 / 30 / 35 / 50, above 50 is Historic.
    pub fn classify(vix: f64) -> Self {
        if vix <= 16.0 {
            VixRegime::Low
        } else if vix <= 20.0 {
            VixRegime::Normal
        } else if vix <= 25.0 {
            VixRegime::Elevated
        } else if vix <= 30.0 {
            VixRegime::High
        } else if vix <= 35.0 {
            VixRegime::Extreme
        } else if vix <= 50.0 {
            VixRegime::Crisis
        } else {
            VixRegime::Historic
        }
    }
}

impl fmt::Display for VixRegime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Account phase indexed by portfolio value. Below Phase1 no new risk
/// is allowed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum AccountPhase {
    BelowMinimum,
    Phase1,
    Phase2,
    Phase3,
    Phase4,
}

impl AccountPhase {
    pub fn from_portfolio_value(value: Decimal) -> Self {
        let v = value.to_f64().unwrap_or(0.0);
        if v >= 95_250.0 {
            AccountPhase::Phase4
        } else if v >= 76_200.0 {
            AccountPhase::Phase3
        } else if v >= 50_800.0 {
            AccountPhase::Phase2
        } else if v >= 38_100.0 {
            AccountPhase::Phase1
        } else {
            AccountPhase::BelowMinimum
        }
    }
}

/// Maximum buying-power utilisation by {regime x phase}.
pub fn max_bp_usage(regime: VixRegime, phase: AccountPhase) -> f64 {
    let row: [f64; 4] = match regime {
        VixRegime::Low => [0.45, 0.50, 0.55, 0.60],
        VixRegime::Normal => [0.50, 0.60, 0.65, 0.70],
        VixRegime::Elevated => [0.40, 0.50, 0.55, 0.60],
        VixRegime::High => [0.30, 0.35, 0.40, 0.45],
        VixRegime::Extreme => [0.60, 0.70, 0.75, 0.80],
        VixRegime::Crisis => [0.20, 0.25, 0.30, 0.35],
        VixRegime::Historic => [0.15, 0.20, 0.25, 0.30],
    };
    match phase {
        AccountPhase::BelowMinimum => 0.0,
        AccountPhase::Phase1 => row[0],
        AccountPhase::Phase2 => row[1],
        AccountPhase::Phase3 => row[2],
        AccountPhase::Phase4 => row[3],
    }
}

/// Position-size multiplier by VIX level: full size at or below Elevated,
/// linear ramp down to 0.5 at the Extreme bound, 0.25 beyond.
pub fn position_size_adjustment(vix: f64) -> f64 {
    const ELEVATED: f64 = 25.0;
    const EXTREME: f64 = 35.0;
    if vix <= ELEVATED {
        1.0
    } else if vix <= EXTREME {
        1.0 - 0.5 * (vix - ELEVATED) / (EXTREME - ELEVATED)
    } else {
        0.25
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn regime_classification_bounds() {
        assert_eq!(VixRegime::classify(12.0), VixRegime::Low);
        assert_eq!(VixRegime::classify(16.0), VixRegime::Low);
        assert_eq!(VixRegime::classify(16.1), VixRegime::Normal);
        assert_eq!(VixRegime::classify(25.0), VixRegime::Elevated);
        assert_eq!(VixRegime::classify(30.0), VixRegime::High);
        assert_eq!(VixRegime::classify(35.0), VixRegime::Extreme);
        assert_eq!(VixRegime::classify(50.0), VixRegime::Crisis);
        assert_eq!(VixRegime::classify(65.73), VixRegime::Historic);
    }

    #[test]
    fn regimes_are_ordered() {
        assert!(VixRegime::Low < VixRegime::Normal);
        assert!(VixRegime::Crisis < VixRegime::Historic);
    }

    #[test]
    fn bp_table_spot_checks() {
        assert_eq!(max_bp_usage(VixRegime::Crisis, AccountPhase::Phase1), 0.20);
        assert_eq!(max_bp_usage(VixRegime::Normal, AccountPhase::Phase2), 0.60);
        assert_eq!(max_bp_usage(VixRegime::Historic, AccountPhase::Phase4), 0.30);
        assert_eq!(max_bp_usage(VixRegime::Low, AccountPhase::BelowMinimum), 0.0);
    }

    #[test]
    fn phase_bands() {
        assert_eq!(
            AccountPhase::from_portfolio_value(dec!(30000)),
            AccountPhase::BelowMinimum
        );
        assert_eq!(
            AccountPhase::from_portfolio_value(dec!(40000)),
            AccountPhase::Phase1
        );
        assert_eq!(
            AccountPhase::from_portfolio_value(dec!(60000)),
            AccountPhase::Phase2
        );
        assert_eq!(
            AccountPhase::from_portfolio_value(dec!(80000)),
            AccountPhase::Phase3
        );
        assert_eq!(
            AccountPhase::from_portfolio_value(dec!(100000)),
            AccountPhase::Phase4
        );
    }

    #[test]
    fn size_adjustment_ramp() {
        assert_eq!(position_size_adjustment(20.0), 1.0);
        assert_eq!(position_size_adjustment(25.0), 1.0);
        let mid = position_size_adjustment(30.0);
        assert!((mid - 0.75).abs() < 1e-9);
        assert_eq!(position_size_adjustment(35.0), 0.5);
        assert_eq!(position_size_adjustment(40.0), 0.25);
    }
}
