use crate::config::parse_env;
use anyhow::Result;

/// Per-strategy tuning knobs, overridable from the environment.
#[derive(Debug, Clone)]
pub struct StrategyEnvConfig {
    pub zero_dte_max_contracts: i64,
    pub zero_dte_profit_target: f64,
    pub zero_dte_stop_loss: f64,
    pub strangle_profit_target: f64,
    pub strangle_stop_loss: f64,
    pub throttle_secs: i64,
}

impl StrategyEnvConfig {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            zero_dte_max_contracts: parse_env("ZERO_DTE_MAX_CONTRACTS", 5)?,
            zero_dte_profit_target: parse_env("ZERO_DTE_PROFIT_TARGET", 0.50)?,
            zero_dte_stop_loss: parse_env("ZERO_DTE_STOP_LOSS", 2.00)?,
            strangle_profit_target: parse_env("STRANGLE_PROFIT_TARGET", 0.25)?,
            strangle_stop_loss: parse_env("STRANGLE_STOP_LOSS", 1.00)?,
            throttle_secs: parse_env("STRATEGY_THROTTLE_SECS", 300)?,
        })
    }
}
