use crate::domain::events::EventType;
use crate::domain::greeks::{GreekSeverity, GreekThresholds, Greeks, RiskAnalysis};
use crate::domain::options::{ContractRef, OptionRight};
use crate::domain::ports::MarketDataAdapter;
use crate::domain::positions::{MultiLegPosition, PositionComponent};
use crate::infrastructure::cache::{CacheKind, UnifiedCache};
use crate::infrastructure::event_bus::EventBus;
use crate::payload;
use chrono::NaiveDate;
use rust_decimal::prelude::ToPrimitive;
use serde_json::json;
use statrs::distribution::{Continuous, ContinuousCDF, Normal};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::warn;

const DAYS_PER_YEAR: f64 = 365.0;
const MIN_YEARS: f64 = 1e-4;

/// Black-Scholes Greeks for one contract. Theta is daily, vega and rho per
/// one percentage point. Returns zeros on degenerate inputs.
pub fn black_scholes_greeks(
    spot: f64,
    strike: f64,
    dte_days: f64,
    iv: f64,
    rate: f64,
    right: OptionRight,
) -> Greeks {
    if spot <= 0.0 || strike <= 0.0 || iv <= 0.0 || dte_days < 0.0 {
        warn!(spot, strike, dte_days, iv, "degenerate Black-Scholes inputs, returning zeros");
        return Greeks::default();
    }
    let t = (dte_days / DAYS_PER_YEAR).max(MIN_YEARS);
    let sqrt_t = t.sqrt();
    let d1 = ((spot / strike).ln() + (rate + 0.5 * iv * iv) * t) / (iv * sqrt_t);
    let d2 = d1 - iv * sqrt_t;
    let normal = Normal::new(0.0, 1.0).expect("unit normal");
    let pdf_d1 = normal.pdf(d1);
    let discount = (-rate * t).exp();

    let (delta, theta_annual, rho) = match right {
        OptionRight::Call => {
            let nd1 = normal.cdf(d1);
            let nd2 = normal.cdf(d2);
            let theta = -spot * pdf_d1 * iv / (2.0 * sqrt_t) - rate * strike * discount * nd2;
            (nd1, theta, strike * t * discount * nd2 / 100.0)
        }
        OptionRight::Put => {
            let nd1 = normal.cdf(d1);
            let n_neg_d2 = normal.cdf(-d2);
            let theta = -spot * pdf_d1 * iv / (2.0 * sqrt_t) + rate * strike * discount * n_neg_d2;
            (nd1 - 1.0, theta, -strike * t * discount * n_neg_d2 / 100.0)
        }
    };

    Greeks {
        delta,
        gamma: pdf_d1 / (spot * iv * sqrt_t),
        theta: theta_annual / DAYS_PER_YEAR,
        vega: spot * pdf_d1 * sqrt_t / 100.0,
        rho,
    }
}

/// Fallback IV from moneyness and DTE when the chain carries none.
/// Clamped to [0.20, 0.80].
pub fn estimate_iv(spot: f64, strike: f64, dte_days: f64) -> f64 {
    if spot <= 0.0 || strike <= 0.0 {
        return 0.20;
    }
    let moneyness = (strike / spot).ln().abs();
    let dte_bump = if dte_days < 7.0 { 0.10 } else if dte_days < 30.0 { 0.05 } else { 0.0 };
    (0.20 + moneyness * 1.5 + dte_bump).clamp(0.20, 0.80)
}

/// Portfolio aggregate with by-underlying and by-expiry breakdowns.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct PortfolioGreeks {
    pub total: Greeks,
    pub by_underlying: HashMap<String, Greeks>,
    pub by_expiry: BTreeMap<NaiveDate, Greeks>,
    /// Equity holdings contribute one delta per share.
    pub equity_delta: HashMap<String, f64>,
}

/// Portfolio-level Greeks on Black-Scholes, aggressively cached and
/// invalidated by spot moves and position changes. Never raises: bad
/// computations degrade to zeros with a logged warning.
pub struct GreeksService {
    market: Arc<dyn MarketDataAdapter>,
    cache: Arc<UnifiedCache>,
    bus: Arc<EventBus>,
    thresholds: GreekThresholds,
    risk_free_rate: f64,
    last_severity: RwLock<Option<GreekSeverity>>,
}

impl GreeksService {
    pub fn new(
        market: Arc<dyn MarketDataAdapter>,
        cache: Arc<UnifiedCache>,
        bus: Arc<EventBus>,
    ) -> Self {
        Self {
            market,
            cache,
            bus,
            thresholds: GreekThresholds::default(),
            risk_free_rate: 0.05,
            last_severity: RwLock::new(None),
        }
    }

    pub fn thresholds(&self) -> &GreekThresholds {
        &self.thresholds
    }

    /// Greeks for one contract, cached on (spot, strike, dte, iv, right, rate).
    pub async fn contract_greeks(
        &self,
        contract: &ContractRef,
        iv: Option<f64>,
        today: NaiveDate,
    ) -> Greeks {
        let spot = match self.market.price(&contract.underlying).await {
            Ok(price) => price.to_f64().unwrap_or(0.0),
            Err(err) => {
                warn!(%err, underlying = %contract.underlying, "no spot for Greeks, returning zeros");
                return Greeks::default();
            }
        };
        let strike = contract.strike.to_f64().unwrap_or(0.0);
        let dte = contract.dte(today) as f64;
        let iv = iv.unwrap_or_else(|| estimate_iv(spot, strike, dte));
        let rate = self.risk_free_rate;
        let right = contract.right;

        let key = format!(
            "greeks:{}:{:.2}:{}:{}:{:.3}:{}:{:.4}",
            contract.underlying, spot, strike, dte as i64, iv, right, rate
        );
        self.cache
            .get(&key, CacheKind::Greeks, Some(&contract.underlying), || async move {
                black_scholes_greeks(spot, strike, dte, iv, rate, right)
            })
            .await
    }

    /// Per-leg Greeks scaled by signed quantity and multiplier. The
    /// quantity sign applies the short-flip conventions in one step.
    pub async fn leg_greeks(&self, component: &PositionComponent, today: NaiveDate) -> Greeks {
        let unit = self.contract_greeks(&component.contract, None, today).await;
        unit.scale(component.quantity as f64 * component.multiplier as f64)
    }

    /// Aggregate over open legs plus equity delta-per-share contributions.
    pub async fn portfolio_greeks(
        &self,
        positions: &[MultiLegPosition],
        equity_shares: &HashMap<String, i64>,
        today: NaiveDate,
    ) -> PortfolioGreeks {
        let mut aggregate = PortfolioGreeks::default();
        for position in positions {
            for component in position.open_components() {
                let leg = self.leg_greeks(component, today).await;
                aggregate.total += leg;
                *aggregate
                    .by_underlying
                    .entry(component.underlying.clone())
                    .or_default() += leg;
                *aggregate
                    .by_expiry
                    .entry(component.contract.expiry)
                    .or_default() += leg;
            }
        }
        for (symbol, shares) in equity_shares {
            let delta = *shares as f64;
            aggregate.total.delta += delta;
            aggregate.equity_delta.insert(symbol.clone(), delta);
            aggregate.by_underlying.entry(symbol.clone()).or_default().delta += delta;
        }
        aggregate
    }

    /// Classify the aggregate, publish `GreeksCalculated`, and raise the
    /// severity alert on upward crossings.
    pub async fn analyze_and_publish(&self, portfolio: &PortfolioGreeks) -> RiskAnalysis {
        let analysis = RiskAnalysis::classify(&portfolio.total, &self.thresholds);
        let worst = analysis.worst();

        let crossed_up = {
            let mut last = self.last_severity.write().await;
            let crossed = last.map_or(worst > GreekSeverity::Safe, |prev| worst > prev);
            *last = Some(worst);
            crossed
        };
        if crossed_up {
            warn!(severity = ?worst, score = analysis.score, "portfolio Greeks threshold crossed");
        }

        self.bus
            .publish(
                EventType::GreeksCalculated,
                payload! {
                    "greeks" => json!({
                        "delta": portfolio.total.delta,
                        "gamma": portfolio.total.gamma,
                        "theta": portfolio.total.theta,
                        "vega": portfolio.total.vega,
                        "rho": portfolio.total.rho,
                    }),
                    "riskAnalysis" => serde_json::to_value(&analysis).unwrap_or_default(),
                },
                "greeks_service",
            )
            .await;
        analysis
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::positions::LegRole;
    use crate::infrastructure::mock::MockMarketData;
    use rust_decimal_macros::dec;

    #[test]
    fn atm_call_delta_near_half() {
        let greeks = black_scholes_greeks(450.0, 450.0, 30.0, 0.20, 0.05, OptionRight::Call);
        assert!(greeks.delta > 0.5 && greeks.delta < 0.60, "delta {}", greeks.delta);
        assert!(greeks.gamma > 0.0);
        assert!(greeks.theta < 0.0);
        assert!(greeks.vega > 0.0);
    }

    #[test]
    fn put_call_delta_parity() {
        let call = black_scholes_greeks(450.0, 450.0, 30.0, 0.20, 0.05, OptionRight::Call);
        let put = black_scholes_greeks(450.0, 450.0, 30.0, 0.20, 0.05, OptionRight::Put);
        assert!((call.delta - put.delta - 1.0).abs() < 1e-9);
        assert!((call.gamma - put.gamma).abs() < 1e-12);
        assert!((call.vega - put.vega).abs() < 1e-12);
    }

    #[test]
    fn degenerate_inputs_return_zeros() {
        let greeks = black_scholes_greeks(0.0, 450.0, 30.0, 0.20, 0.05, OptionRight::Call);
        assert_eq!(greeks, Greeks::default());
        let greeks = black_scholes_greeks(450.0, 450.0, 30.0, 0.0, 0.05, OptionRight::Put);
        assert_eq!(greeks, Greeks::default());
    }

    #[test]
    fn iv_estimate_is_clamped() {
        assert_eq!(estimate_iv(450.0, 450.0, 60.0), 0.20);
        assert_eq!(estimate_iv(450.0, 900.0, 3.0), 0.80);
        let otm = estimate_iv(450.0, 420.0, 45.0);
        assert!(otm > 0.20 && otm < 0.80);
    }

    #[tokio::test]
    async fn short_leg_flips_signs() {
        let market = Arc::new(MockMarketData::new());
        market.set_price("SPY", dec!(450)).await;
        let service = GreeksService::new(
            market,
            Arc::new(UnifiedCache::new()),
            Arc::new(EventBus::new()),
        );
        let today = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
        let contract = ContractRef::new(
            "SPY",
            dec!(440),
            NaiveDate::from_ymd_opt(2024, 4, 19).unwrap(),
            OptionRight::Put,
        );
        let mut component =
            PositionComponent::new("test", LegRole::ShortPut, contract, -1, dec!(3.00));
        component.status = crate::domain::positions::ComponentStatus::Open;

        let leg = service.leg_greeks(&component, today).await;
        // Short put: positive delta, negative gamma, positive theta.
        assert!(leg.delta > 0.0, "delta {}", leg.delta);
        assert!(leg.gamma < 0.0);
        assert!(leg.theta > 0.0);
    }

    #[tokio::test]
    async fn equity_shares_count_as_delta() {
        let market = Arc::new(MockMarketData::new());
        let service = GreeksService::new(
            market,
            Arc::new(UnifiedCache::new()),
            Arc::new(EventBus::new()),
        );
        let mut shares = HashMap::new();
        shares.insert("SPY".to_string(), 200i64);
        let today = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
        let aggregate = service.portfolio_greeks(&[], &shares, today).await;
        assert_eq!(aggregate.total.delta, 200.0);
        assert_eq!(aggregate.equity_delta.get("SPY"), Some(&200.0));
    }

    #[tokio::test]
    async fn analyze_publishes_greeks_event() {
        let market = Arc::new(MockMarketData::new());
        let bus = Arc::new(EventBus::new());
        let service = GreeksService::new(market, Arc::new(UnifiedCache::new()), bus.clone());
        let aggregate = PortfolioGreeks::default();
        let analysis = service.analyze_and_publish(&aggregate).await;
        assert_eq!(analysis.worst(), GreekSeverity::Safe);
        let history = bus.recent_history(5);
        assert!(history
            .iter()
            .any(|e| e.event_type == EventType::GreeksCalculated));
    }
}
