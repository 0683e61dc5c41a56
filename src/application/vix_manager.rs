use crate::domain::ports::MarketDataAdapter;
use crate::domain::vix::{AccountPhase, VixRegime, max_bp_usage, position_size_adjustment};
use crate::infrastructure::event_bus::EventBus;
use crate::payload;
use crate::domain::events::EventType;
use chrono::{Duration, NaiveDateTime};
use rust_decimal::prelude::ToPrimitive;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{error, info};

/// Emergency fallback when the VIX feed is missing.
const FALLBACK_VIX: f64 = 20.0;
/// Hard floor for zero-DTE entries.
const ZERO_DTE_VIX_FLOOR: f64 = 22.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VixCacheProfile {
    /// 5-minute cache, for backtests.
    Backtest,
    /// 1-minute cache, for live sessions.
    Live,
}

impl VixCacheProfile {
    fn ttl(&self) -> Duration {
        match self {
            VixCacheProfile::Backtest => Duration::minutes(5),
            VixCacheProfile::Live => Duration::minutes(1),
        }
    }
}

struct VixSlot {
    value: f64,
    fetched_at: NaiveDateTime,
    regime: VixRegime,
}

/// Low-latency cached VIX access with regime classification and
/// buying-power caps. Emits `VixRegimeChange` on regime transitions.
pub struct VixManager {
    market: Arc<dyn MarketDataAdapter>,
    bus: Arc<EventBus>,
    profile: VixCacheProfile,
    slot: RwLock<Option<VixSlot>>,
}

impl VixManager {
    pub fn new(
        market: Arc<dyn MarketDataAdapter>,
        bus: Arc<EventBus>,
        profile: VixCacheProfile,
    ) -> Self {
        Self {
            market,
            bus,
            profile,
            slot: RwLock::new(None),
        }
    }

    /// Current VIX, served from the cache slot inside the profile TTL.
    /// A missing feed falls back to 20.0 with a logged error.
    pub async fn current_vix(&self) -> f64 {
        let now = self.market.market_time().await;
        {
            let slot = self.slot.read().await;
            if let Some(slot) = slot.as_ref() {
                if now - slot.fetched_at < self.profile.ttl() {
                    return slot.value;
                }
            }
        }
        self.refresh(now).await
    }

    pub async fn regime(&self) -> VixRegime {
        let vix = self.current_vix().await;
        VixRegime::classify(vix)
    }

    pub async fn max_bp_usage(&self, phase: AccountPhase) -> f64 {
        max_bp_usage(self.regime().await, phase)
    }

    /// Tom King rule: zero-DTE structures need VIX above 22.
    pub async fn zero_dte_tradable(&self) -> bool {
        self.current_vix().await > ZERO_DTE_VIX_FLOOR
    }

    pub async fn position_size_adjustment(&self) -> f64 {
        position_size_adjustment(self.current_vix().await)
    }

    async fn refresh(&self, now: NaiveDateTime) -> f64 {
        let value = match self.market.price("VIX").await {
            Ok(price) => price.to_f64().unwrap_or(FALLBACK_VIX),
            Err(err) => {
                error!(%err, fallback = FALLBACK_VIX, "VIX feed missing, using fallback");
                FALLBACK_VIX
            }
        };
        let regime = VixRegime::classify(value);

        let old_regime = {
            let mut slot = self.slot.write().await;
            let old = slot.as_ref().map(|s| s.regime);
            *slot = Some(VixSlot {
                value,
                fetched_at: now,
                regime,
            });
            old
        };

        if let Some(old) = old_regime {
            if old != regime {
                info!(%old, new = %regime, vix = value, "VIX regime change");
                self.bus
                    .publish(
                        EventType::VixRegimeChange,
                        payload! {
                            "old" => old.to_string(),
                            "new" => regime.to_string(),
                            "value" => value,
                        },
                        "vix_manager",
                    )
                    .await;
            }
        }
        value
    }
}
