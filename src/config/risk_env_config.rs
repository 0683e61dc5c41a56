use crate::config::parse_env;
use anyhow::Result;

/// Risk thresholds, overridable from the environment.
#[derive(Debug, Clone)]
pub struct RiskEnvConfig {
    pub max_daily_loss_pct: f64,
    pub max_weekly_loss_pct: f64,
    pub max_monthly_loss_pct: f64,
    pub max_intraday_drawdown_pct: f64,
    pub consecutive_loss_limit: usize,
    pub margin_call_ratio: f64,
}

impl RiskEnvConfig {
    pub fn from_env() -> Result<Self> {
        let config = Self {
            max_daily_loss_pct: parse_env("RISK_MAX_DAILY_LOSS_PCT", 0.05)?,
            max_weekly_loss_pct: parse_env("RISK_MAX_WEEKLY_LOSS_PCT", 0.10)?,
            max_monthly_loss_pct: parse_env("RISK_MAX_MONTHLY_LOSS_PCT", 0.15)?,
            max_intraday_drawdown_pct: parse_env("RISK_MAX_INTRADAY_DRAWDOWN_PCT", 0.03)?,
            consecutive_loss_limit: parse_env("RISK_CONSECUTIVE_LOSS_LIMIT", 3)?,
            margin_call_ratio: parse_env("RISK_MARGIN_CALL_RATIO", 0.80)?,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("RISK_MAX_DAILY_LOSS_PCT", self.max_daily_loss_pct),
            ("RISK_MAX_WEEKLY_LOSS_PCT", self.max_weekly_loss_pct),
            ("RISK_MAX_MONTHLY_LOSS_PCT", self.max_monthly_loss_pct),
            ("RISK_MAX_INTRADAY_DRAWDOWN_PCT", self.max_intraday_drawdown_pct),
            ("RISK_MARGIN_CALL_RATIO", self.margin_call_ratio),
        ] {
            if !(0.0..=1.0).contains(&value) {
                anyhow::bail!("{} must be within [0, 1], got {}", name, value);
            }
        }
        if self.max_daily_loss_pct >= self.max_weekly_loss_pct {
            anyhow::bail!("daily loss limit must be tighter than weekly");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let config = RiskEnvConfig {
            max_daily_loss_pct: 0.05,
            max_weekly_loss_pct: 0.10,
            max_monthly_loss_pct: 0.15,
            max_intraday_drawdown_pct: 0.03,
            consecutive_loss_limit: 3,
            margin_call_ratio: 0.80,
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn inverted_limits_rejected() {
        let config = RiskEnvConfig {
            max_daily_loss_pct: 0.20,
            max_weekly_loss_pct: 0.10,
            max_monthly_loss_pct: 0.15,
            max_intraday_drawdown_pct: 0.03,
            consecutive_loss_limit: 3,
            margin_call_ratio: 0.80,
        };
        assert!(config.validate().is_err());
    }
}
