use crate::application::performance::PerformanceTracker;
use crate::application::vix_manager::VixManager;
use crate::domain::ports::AccountSnapshot;
use crate::domain::vix::AccountPhase;
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use std::sync::Arc;
use tracing::debug;

/// Fractional Kelly: run at a quarter of full Kelly.
const KELLY_FRACTION: f64 = 0.25;
/// Single-position cap before the fractional damp.
const KELLY_CAP: f64 = 0.25;
/// Risk fraction used while a strategy has no trade history yet.
const COLD_START_FRACTION: f64 = 0.05;
const MAX_CONTRACTS: i64 = 10;

/// Kelly position size as a fraction of the account.
/// `(p*b - q) / b`, floored at zero, capped, then damped.
pub fn kelly_fraction(win_rate: f64, avg_win: f64, avg_loss: f64) -> f64 {
    if avg_loss <= 0.0 || win_rate <= 0.0 || win_rate >= 1.0 {
        return 0.0;
    }
    let ratio = avg_win / avg_loss;
    let kelly = (win_rate * ratio - (1.0 - win_rate)) / ratio;
    kelly.max(0.0).min(KELLY_CAP) * KELLY_FRACTION
}

/// Contract sizing from fractional Kelly, clamped by the VIX-regime BP cap
/// and scaled by the regime size adjustment.
pub struct PositionSizer {
    vix: Arc<VixManager>,
    performance: Arc<PerformanceTracker>,
}

impl PositionSizer {
    pub fn new(vix: Arc<VixManager>, performance: Arc<PerformanceTracker>) -> Self {
        Self { vix, performance }
    }

    /// Recommended contract count for one entry given the worst-case loss
    /// per contract. Returns zero when the account phase allows no risk.
    pub async fn recommended_contracts(
        &self,
        strategy_id: &str,
        max_loss_per_contract: Decimal,
        account: &AccountSnapshot,
    ) -> i64 {
        let portfolio = account.portfolio_value.to_f64().unwrap_or(0.0);
        let per_contract = max_loss_per_contract.to_f64().unwrap_or(0.0);
        if portfolio <= 0.0 || per_contract <= 0.0 {
            return 0;
        }

        let phase = AccountPhase::from_portfolio_value(account.portfolio_value);
        let bp_cap = self.vix.max_bp_usage(phase).await;
        if bp_cap == 0.0 {
            return 0;
        }

        let kelly = match self
            .performance
            .stats_for(strategy_id)
            .await
            .and_then(|s| Some((s.win_rate()?, s.avg_win_loss()?)))
        {
            Some((win_rate, (avg_win, avg_loss))) => kelly_fraction(win_rate, avg_win, avg_loss),
            None => COLD_START_FRACTION,
        };

        let adjustment = self.vix.position_size_adjustment().await;
        let risk_fraction = kelly.min(bp_cap) * adjustment;
        let contracts = ((portfolio * risk_fraction) / per_contract).floor() as i64;
        let contracts = contracts.clamp(0, MAX_CONTRACTS);
        debug!(
            strategy = strategy_id,
            kelly, bp_cap, adjustment, contracts, "position sized"
        );
        contracts
    }
}
