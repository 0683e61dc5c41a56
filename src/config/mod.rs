//! Environment-driven configuration, organized by domain: engine, risk,
//! and strategy tuning.

mod risk_env_config;
mod strategy_config;

pub use risk_env_config::RiskEnvConfig;
pub use strategy_config::StrategyEnvConfig;

use crate::application::vix_manager::VixCacheProfile;
use anyhow::{Context, Result};
use std::env;
use std::str::FromStr;

/// Runtime mode; controls cache TTLs and persistence targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Backtest,
    Paper,
    Live,
}

impl Mode {
    pub fn vix_profile(&self) -> VixCacheProfile {
        match self {
            Mode::Backtest => VixCacheProfile::Backtest,
            Mode::Paper | Mode::Live => VixCacheProfile::Live,
        }
    }
}

impl FromStr for Mode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "backtest" => Ok(Mode::Backtest),
            "paper" => Ok(Mode::Paper),
            "live" => Ok(Mode::Live),
            _ => anyhow::bail!("Invalid MODE: {}. Must be 'backtest', 'paper', or 'live'", s),
        }
    }
}

/// Main application configuration, aggregated from the per-domain env
/// configs.
#[derive(Debug, Clone)]
pub struct Config {
    pub mode: Mode,
    pub state_dir: String,
    pub save_interval_secs: i64,
    pub risk: RiskEnvConfig,
    pub strategy: StrategyEnvConfig,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        let mode = env::var("MODE")
            .unwrap_or_else(|_| "paper".to_string())
            .parse()
            .context("parsing MODE")?;
        let state_dir = env::var("STATE_DIR").unwrap_or_else(|_| "./state".to_string());
        let save_interval_secs = parse_env("SAVE_INTERVAL_SECS", 300)?;
        Ok(Self {
            mode,
            state_dir,
            save_interval_secs,
            risk: RiskEnvConfig::from_env()?,
            strategy: StrategyEnvConfig::from_env()?,
        })
    }
}

pub(crate) fn parse_env<T: FromStr>(key: &str, default: T) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid {}: {} ({})", key, raw, e)),
        Err(_) => Ok(default),
    }
}
