use crate::application::risk::{
    PluginError, PluginVote, PositionRequest, RiskCheckContext, RiskPlugin,
};
use crate::domain::events::{RiskEvent, RiskEventKind, RiskLevel};
use async_trait::async_trait;
use chrono::{DateTime, Datelike, Duration, NaiveDate, Utc};
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use serde_json::{Map, Value, json};
use tokio::sync::RwLock;
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    pub max_daily_loss_pct: f64,
    pub max_weekly_loss_pct: f64,
    pub max_monthly_loss_pct: f64,
    pub max_intraday_drawdown_pct: f64,
    pub consecutive_loss_limit: usize,
    /// Minimum hours since the trip before a reset can be granted.
    pub recovery_hours: i64,
    /// Required recovery off the post-trip low, as a fraction of the
    /// daily start value.
    pub recovery_pct: f64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            max_daily_loss_pct: 0.05,
            max_weekly_loss_pct: 0.10,
            max_monthly_loss_pct: 0.15,
            max_intraday_drawdown_pct: 0.03,
            consecutive_loss_limit: 3,
            recovery_hours: 24,
            recovery_pct: 0.02,
        }
    }
}

#[derive(Debug, Clone)]
struct Trip {
    at: DateTime<Utc>,
    reason: String,
    daily_start: Decimal,
    low_since: Decimal,
}

#[derive(Debug, Default)]
struct BreakerState {
    daily_start: Option<Decimal>,
    daily_date: Option<NaiveDate>,
    weekly_start: Option<Decimal>,
    weekly_anchor: Option<NaiveDate>,
    monthly_start: Option<Decimal>,
    monthly_anchor: Option<(i32, u32)>,
    intraday_peak: Option<Decimal>,
    consecutive_losses: usize,
    tripped: Option<Trip>,
}

/// Threshold-based emergency halt: daily 5%, weekly 10%, monthly 15%,
/// intraday drawdown 3%, three consecutive losses. Recovery needs both the
/// cool-down and a genuine bounce off the post-trip low.
pub struct CircuitBreakerPlugin {
    config: CircuitBreakerConfig,
    state: RwLock<BreakerState>,
}

impl CircuitBreakerPlugin {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            state: RwLock::new(BreakerState::default()),
        }
    }

    fn loss_pct(start: Decimal, current: Decimal) -> f64 {
        if start.is_zero() {
            return 0.0;
        }
        ((start - current) / start).to_f64().unwrap_or(0.0)
    }

    fn roll_anchors(state: &mut BreakerState, today: NaiveDate, value: Decimal) {
        if state.daily_date != Some(today) {
            state.daily_date = Some(today);
            state.daily_start = Some(value);
            state.intraday_peak = Some(value);
        }
        let week_anchor = today - Duration::days(today.weekday().num_days_from_monday() as i64);
        if state.weekly_anchor != Some(week_anchor) {
            state.weekly_anchor = Some(week_anchor);
            state.weekly_start = Some(value);
        }
        let month = (today.year(), today.month());
        if state.monthly_anchor != Some(month) {
            state.monthly_anchor = Some(month);
            state.monthly_start = Some(value);
        }
    }

    fn find_breach(&self, state: &BreakerState, value: Decimal) -> Option<String> {
        let daily = Self::loss_pct(state.daily_start.unwrap_or(value), value);
        if daily > self.config.max_daily_loss_pct {
            return Some(format!(
                "daily loss {:.1}% > {:.1}%",
                daily * 100.0,
                self.config.max_daily_loss_pct * 100.0
            ));
        }
        let weekly = Self::loss_pct(state.weekly_start.unwrap_or(value), value);
        if weekly > self.config.max_weekly_loss_pct {
            return Some(format!(
                "weekly loss {:.1}% > {:.1}%",
                weekly * 100.0,
                self.config.max_weekly_loss_pct * 100.0
            ));
        }
        let monthly = Self::loss_pct(state.monthly_start.unwrap_or(value), value);
        if monthly > self.config.max_monthly_loss_pct {
            return Some(format!(
                "monthly loss {:.1}% > {:.1}%",
                monthly * 100.0,
                self.config.max_monthly_loss_pct * 100.0
            ));
        }
        let drawdown = Self::loss_pct(state.intraday_peak.unwrap_or(value), value);
        if drawdown > self.config.max_intraday_drawdown_pct {
            return Some(format!(
                "intraday drawdown {:.1}% > {:.1}%",
                drawdown * 100.0,
                self.config.max_intraday_drawdown_pct * 100.0
            ));
        }
        if state.consecutive_losses >= self.config.consecutive_loss_limit {
            return Some(format!(
                "consecutive losses {} >= {}",
                state.consecutive_losses, self.config.consecutive_loss_limit
            ));
        }
        None
    }
}

impl Default for CircuitBreakerPlugin {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}

#[async_trait]
impl RiskPlugin for CircuitBreakerPlugin {
    fn name(&self) -> &str {
        "circuit_breaker"
    }

    async fn can_open_position(&self, _request: &PositionRequest) -> Result<PluginVote, PluginError> {
        let state = self.state.read().await;
        if let Some(trip) = &state.tripped {
            return Ok(PluginVote::Reject(format!(
                "Emergency mode active: {}",
                trip.reason
            )));
        }
        Ok(PluginVote::Approve)
    }

    async fn on_position_closed(
        &self,
        _position: &crate::domain::positions::MultiLegPosition,
        pnl: Decimal,
    ) -> Result<(), PluginError> {
        let mut state = self.state.write().await;
        if pnl < Decimal::ZERO {
            state.consecutive_losses += 1;
        } else {
            state.consecutive_losses = 0;
        }
        Ok(())
    }

    async fn periodic_check(&self, ctx: &RiskCheckContext) -> Result<Vec<RiskEvent>, PluginError> {
        let value = ctx.account.portfolio_value;
        let mut state = self.state.write().await;
        Self::roll_anchors(&mut state, ctx.today, value);

        if let Some(peak) = state.intraday_peak {
            if value > peak {
                state.intraday_peak = Some(value);
            }
        }

        if let Some(trip) = &mut state.tripped {
            if value < trip.low_since {
                trip.low_since = value;
            }
            return Ok(Vec::new());
        }

        let Some(reason) = self.find_breach(&state, value) else {
            return Ok(Vec::new());
        };

        warn!(reason, %value, "circuit breaker tripped");
        state.tripped = Some(Trip {
            at: ctx.now,
            reason: reason.clone(),
            daily_start: state.daily_start.unwrap_or(value),
            low_since: value,
        });

        let event = RiskEvent::new(
            RiskEventKind::CircuitBreakerTriggered,
            RiskLevel::Emergency,
            reason,
        )
        .with_data("portfolio_value", json!(value.to_f64()))
        .with_data("daily_start", json!(state.daily_start.map(|d| d.to_f64())))
        .with_data("consecutive_losses", json!(state.consecutive_losses));
        Ok(vec![event])
    }

    async fn can_reset(&self, ctx: &RiskCheckContext) -> bool {
        let state = self.state.read().await;
        let Some(trip) = &state.tripped else {
            return true;
        };
        let cooled = ctx.now - trip.at >= Duration::hours(self.config.recovery_hours);
        let recovery_floor = trip.low_since
            + trip.daily_start
                * Decimal::try_from(self.config.recovery_pct).unwrap_or_default();
        let recovered = ctx.account.portfolio_value >= recovery_floor;
        cooled && recovered
    }

    async fn reset_emergency(&self) {
        let mut state = self.state.write().await;
        if state.tripped.take().is_some() {
            info!("circuit breaker reset");
        }
        state.consecutive_losses = 0;
    }

    async fn risk_metrics(&self) -> Map<String, Value> {
        let state = self.state.read().await;
        let mut metrics = Map::new();
        metrics.insert("tripped".to_string(), Value::from(state.tripped.is_some()));
        metrics.insert(
            "consecutive_losses".to_string(),
            Value::from(state.consecutive_losses),
        );
        if let Some(trip) = &state.tripped {
            metrics.insert("trip_reason".to_string(), Value::from(trip.reason.clone()));
        }
        metrics
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ports::AccountSnapshot;
    use rust_decimal_macros::dec;

    fn ctx(value: Decimal, now: DateTime<Utc>) -> RiskCheckContext {
        RiskCheckContext {
            account: AccountSnapshot {
                portfolio_value: value,
                cash: value / dec!(2),
                margin_used: dec!(10000),
                margin_remaining: dec!(10000),
                buying_power: value / dec!(2),
            },
            positions: Vec::new(),
            vix: 20.0,
            now,
            today: now.date_naive(),
        }
    }

    fn request() -> PositionRequest {
        PositionRequest {
            strategy_id: "s".to_string(),
            symbol: "SPY".to_string(),
            quantity: 1,
            delta: 0.0,
            dte: None,
            is_short_option: false,
            account: AccountSnapshot {
                portfolio_value: dec!(100000),
                cash: dec!(50000),
                margin_used: dec!(0),
                margin_remaining: dec!(0),
                buying_power: dec!(50000),
            },
            today: NaiveDate::from_ymd_opt(2024, 3, 1).unwrap(),
        }
    }

    #[tokio::test]
    async fn daily_loss_trips_at_emergency_level() {
        let breaker = CircuitBreakerPlugin::default();
        let t0 = Utc::now();
        assert!(breaker.periodic_check(&ctx(dec!(100000), t0)).await.unwrap().is_empty());

        let events = breaker
            .periodic_check(&ctx(dec!(94500), t0 + Duration::hours(2)))
            .await
            .unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].level, RiskLevel::Emergency);
        assert_eq!(events[0].message, "daily loss 5.5% > 5.0%");

        let vote = breaker.can_open_position(&request()).await.unwrap();
        assert_eq!(
            vote.reason(),
            Some("Emergency mode active: daily loss 5.5% > 5.0%")
        );
    }

    #[tokio::test]
    async fn intraday_drawdown_uses_peak() {
        let breaker = CircuitBreakerPlugin::default();
        let t0 = Utc::now();
        breaker.periodic_check(&ctx(dec!(100000), t0)).await.unwrap();
        // Rally to 104k, then fall 3.5% off the peak while staying above
        // the daily loss line.
        breaker
            .periodic_check(&ctx(dec!(104000), t0 + Duration::hours(1)))
            .await
            .unwrap();
        let events = breaker
            .periodic_check(&ctx(dec!(100360), t0 + Duration::hours(2)))
            .await
            .unwrap();
        assert_eq!(events.len(), 1);
        assert!(events[0].message.starts_with("intraday drawdown"));
    }

    #[tokio::test]
    async fn consecutive_losses_trip() {
        let breaker = CircuitBreakerPlugin::default();
        let position = crate::domain::positions::MultiLegPosition::new("s", "SPY");
        for _ in 0..3 {
            breaker.on_position_closed(&position, dec!(-100)).await.unwrap();
        }
        let events = breaker
            .periodic_check(&ctx(dec!(100000), Utc::now()))
            .await
            .unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].message, "consecutive losses 3 >= 3");
    }

    #[tokio::test]
    async fn win_resets_loss_streak() {
        let breaker = CircuitBreakerPlugin::default();
        let position = crate::domain::positions::MultiLegPosition::new("s", "SPY");
        breaker.on_position_closed(&position, dec!(-100)).await.unwrap();
        breaker.on_position_closed(&position, dec!(-100)).await.unwrap();
        breaker.on_position_closed(&position, dec!(250)).await.unwrap();
        let events = breaker
            .periodic_check(&ctx(dec!(100000), Utc::now()))
            .await
            .unwrap();
        assert!(events.is_empty());
    }

    #[tokio::test]
    async fn reset_requires_cooldown_and_recovery() {
        let breaker = CircuitBreakerPlugin::default();
        let t0 = Utc::now();
        breaker.periodic_check(&ctx(dec!(100000), t0)).await.unwrap();
        breaker
            .periodic_check(&ctx(dec!(94500), t0 + Duration::hours(1)))
            .await
            .unwrap();
        // Dip further: the low anchors the recovery requirement.
        breaker
            .periodic_check(&ctx(dec!(94000), t0 + Duration::hours(2)))
            .await
            .unwrap();

        // Recovered but too soon.
        assert!(!breaker.can_reset(&ctx(dec!(96000), t0 + Duration::hours(3))).await);
        // Cooled down but not recovered: needs low + 2% of daily start.
        assert!(
            !breaker
                .can_reset(&ctx(dec!(95000), t0 + Duration::hours(26)))
                .await
        );
        // Both conditions met: 94,000 + 2,000 = 96,000.
        assert!(
            breaker
                .can_reset(&ctx(dec!(96000), t0 + Duration::hours(26)))
                .await
        );

        breaker.reset_emergency().await;
        assert!(
            breaker
                .can_open_position(&request())
                .await
                .unwrap()
                .is_approved()
        );
    }
}
