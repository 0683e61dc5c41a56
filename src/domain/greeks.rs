use serde::{Deserialize, Serialize};
use std::ops::{Add, AddAssign};

/// First-order option sensitivities. Theta is daily; vega and rho are per
/// one percentage point.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Greeks {
    pub delta: f64,
    pub gamma: f64,
    pub theta: f64,
    pub vega: f64,
    pub rho: f64,
}

impl Greeks {
    pub fn scale(&self, factor: f64) -> Greeks {
        Greeks {
            delta: self.delta * factor,
            gamma: self.gamma * factor,
            theta: self.theta * factor,
            vega: self.vega * factor,
            rho: self.rho * factor,
        }
    }
}

impl Add for Greeks {
    type Output = Greeks;

    fn add(self, rhs: Greeks) -> Greeks {
        Greeks {
            delta: self.delta + rhs.delta,
            gamma: self.gamma + rhs.gamma,
            theta: self.theta + rhs.theta,
            vega: self.vega + rhs.vega,
            rho: self.rho + rhs.rho,
        }
    }
}

impl AddAssign for Greeks {
    fn add_assign(&mut self, rhs: Greeks) {
        *self = *self + rhs;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum GreekSeverity {
    Safe,
    Warning,
    Critical,
}

/// Portfolio alert thresholds: |delta| 50/100, |gamma| 10/20,
/// theta -200/-500, |vega| 500/1000.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct GreekThresholds {
    pub delta_warning: f64,
    pub delta_critical: f64,
    pub gamma_warning: f64,
    pub gamma_critical: f64,
    pub theta_warning: f64,
    pub theta_critical: f64,
    pub vega_warning: f64,
    pub vega_critical: f64,
}

impl Default for GreekThresholds {
    fn default() -> Self {
        Self {
            delta_warning: 50.0,
            delta_critical: 100.0,
            gamma_warning: 10.0,
            gamma_critical: 20.0,
            theta_warning: -200.0,
            theta_critical: -500.0,
            vega_warning: 500.0,
            vega_critical: 1000.0,
        }
    }
}

/// Per-Greek classification plus a blended score in [0, 1].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskAnalysis {
    pub delta: GreekSeverity,
    pub gamma: GreekSeverity,
    pub theta: GreekSeverity,
    pub vega: GreekSeverity,
    pub score: f64,
}

impl RiskAnalysis {
    pub fn classify(greeks: &Greeks, thresholds: &GreekThresholds) -> Self {
        let delta = band(greeks.delta.abs(), thresholds.delta_warning, thresholds.delta_critical);
        let gamma = band(greeks.gamma.abs(), thresholds.gamma_warning, thresholds.gamma_critical);
        // Theta thresholds are negative: more negative is worse.
        let theta = band(-greeks.theta, -thresholds.theta_warning, -thresholds.theta_critical);
        let vega = band(greeks.vega.abs(), thresholds.vega_warning, thresholds.vega_critical);
        let score = [delta, gamma, theta, vega]
            .iter()
            .map(|s| match s {
                GreekSeverity::Safe => 0.0,
                GreekSeverity::Warning => 0.5,
                GreekSeverity::Critical => 1.0,
            })
            .sum::<f64>()
            / 4.0;
        Self {
            delta,
            gamma,
            theta,
            vega,
            score,
        }
    }

    pub fn worst(&self) -> GreekSeverity {
        [self.delta, self.gamma, self.theta, self.vega]
            .into_iter()
            .max()
            .unwrap_or(GreekSeverity::Safe)
    }
}

fn band(value: f64, warning: f64, critical: f64) -> GreekSeverity {
    if value >= critical {
        GreekSeverity::Critical
    } else if value >= warning {
        GreekSeverity::Warning
    } else {
        GreekSeverity::Safe
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aggregation_adds_fieldwise() {
        let a = Greeks { delta: 10.0, gamma: 1.0, theta: -20.0, vega: 50.0, rho: 5.0 };
        let b = Greeks { delta: -4.0, gamma: 0.5, theta: -10.0, vega: 25.0, rho: 1.0 };
        let sum = a + b;
        assert_eq!(sum.delta, 6.0);
        assert_eq!(sum.theta, -30.0);
    }

    #[test]
    fn classification_bands() {
        let thresholds = GreekThresholds::default();
        let safe = Greeks { delta: 20.0, gamma: 2.0, theta: -50.0, vega: 100.0, rho: 0.0 };
        let analysis = RiskAnalysis::classify(&safe, &thresholds);
        assert_eq!(analysis.worst(), GreekSeverity::Safe);
        assert_eq!(analysis.score, 0.0);

        let hot = Greeks { delta: -120.0, gamma: 12.0, theta: -600.0, vega: 400.0, rho: 0.0 };
        let analysis = RiskAnalysis::classify(&hot, &thresholds);
        assert_eq!(analysis.delta, GreekSeverity::Critical);
        assert_eq!(analysis.gamma, GreekSeverity::Warning);
        assert_eq!(analysis.theta, GreekSeverity::Critical);
        assert_eq!(analysis.vega, GreekSeverity::Safe);
        assert_eq!(analysis.worst(), GreekSeverity::Critical);
    }
}
