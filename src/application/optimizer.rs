use crate::application::greeks_service::GreeksService;
use crate::application::position_manager::PositionStateManager;
use crate::domain::events::EventType;
use crate::domain::ports::BrokerAdapter;
use crate::infrastructure::cache::{SPOT_MOVE_THRESHOLD, UnifiedCache};
use crate::infrastructure::event_bus::EventBus;
use crate::payload;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Mutex;
use tracing::debug;

/// Pending Greeks recomputation flushes at this batch size.
const GREEKS_BATCH_SIZE: usize = 5;
/// ...or after this long since the last flush.
const GREEKS_BATCH_MAX_AGE_SECS: i64 = 30;
/// Cache maintenance triggers.
const MAINTENANCE_HIT_RATE_FLOOR: f64 = 0.70;
const MAINTENANCE_MEMORY_BYTES: usize = 500 * 1024 * 1024;
const MAINTENANCE_FILL_LEVEL: f64 = 0.90;
/// Rough cost of one skipped full recomputation pass.
const SKIP_SAVINGS_MS: u64 = 5;

#[derive(Debug, Clone, Default)]
pub struct OptimizerMetrics {
    pub events_processed: u64,
    pub events_skipped: u64,
    pub computational_savings_ms: u64,
    pub unnecessary_calculations_avoided: u64,
    pub greeks_batches: u64,
}

struct OptimizerState {
    last_prices: HashMap<String, Decimal>,
    pending_greeks: HashSet<String>,
    last_batch: Option<DateTime<Utc>>,
    last_position_hash: u64,
}

/// Demand-driven replacement for per-tick polling: insignificant ticks are
/// dropped, Greeks recomputation is batched, cache maintenance runs only
/// when the cache is actually degrading.
pub struct OnDataOptimizer {
    bus: Arc<EventBus>,
    cache: Arc<UnifiedCache>,
    positions: Arc<PositionStateManager>,
    greeks: Arc<GreeksService>,
    broker: Arc<dyn BrokerAdapter>,
    state: Mutex<OptimizerState>,
    events_processed: AtomicU64,
    events_skipped: AtomicU64,
    savings_ms: AtomicU64,
    avoided: AtomicU64,
    batches: AtomicU64,
}

impl OnDataOptimizer {
    pub fn new(
        bus: Arc<EventBus>,
        cache: Arc<UnifiedCache>,
        positions: Arc<PositionStateManager>,
        greeks: Arc<GreeksService>,
        broker: Arc<dyn BrokerAdapter>,
    ) -> Self {
        Self {
            bus,
            cache,
            positions,
            greeks,
            broker,
            state: Mutex::new(OptimizerState {
                last_prices: HashMap::new(),
                pending_greeks: HashSet::new(),
                last_batch: None,
                last_position_hash: 0,
            }),
            events_processed: AtomicU64::new(0),
            events_skipped: AtomicU64::new(0),
            savings_ms: AtomicU64::new(0),
            avoided: AtomicU64::new(0),
            batches: AtomicU64::new(0),
        }
    }

    /// Process one data tick. Returns false when the tick was insignificant
    /// and skipped entirely.
    pub async fn on_data(
        &self,
        prices: &HashMap<String, Decimal>,
        now: DateTime<Utc>,
        today: NaiveDate,
    ) -> bool {
        let position_hash = self.positions.invested_hash().await;
        let mut state = self.state.lock().await;
        let position_changed = position_hash != state.last_position_hash;

        let mut changed: Vec<(String, Decimal, f64)> = Vec::new();
        for (symbol, price) in prices {
            match state.last_prices.get(symbol) {
                Some(previous) if !previous.is_zero() => {
                    let prev = previous.to_f64().unwrap_or(0.0);
                    let cur = price.to_f64().unwrap_or(0.0);
                    let change = (cur - prev) / prev;
                    if change.abs() >= SPOT_MOVE_THRESHOLD {
                        changed.push((symbol.clone(), *price, change));
                    }
                }
                _ => changed.push((symbol.clone(), *price, 0.0)),
            }
        }

        if changed.is_empty() && !position_changed {
            self.events_skipped.fetch_add(1, Ordering::SeqCst);
            self.savings_ms.fetch_add(SKIP_SAVINGS_MS, Ordering::SeqCst);
            return false;
        }
        self.events_processed.fetch_add(1, Ordering::SeqCst);

        for (symbol, price, change) in &changed {
            state.last_prices.insert(symbol.clone(), *price);
            state.pending_greeks.insert(symbol.clone());
            self.cache.update_spot(symbol, *price).await;
            self.bus
                .publish(
                    EventType::MarketDataUpdated,
                    payload! {
                        "symbol" => symbol.clone(),
                        "price" => price.to_f64().unwrap_or(0.0),
                        "changePct" => change * 100.0,
                    },
                    "ondata_optimizer",
                )
                .await;
        }

        if position_changed {
            state.last_position_hash = position_hash;
            self.cache.note_position_change(position_hash).await;
        }

        let batch_due = state.pending_greeks.len() >= GREEKS_BATCH_SIZE
            || position_changed
            || state
                .last_batch
                .is_none_or(|last| now - last >= Duration::seconds(GREEKS_BATCH_MAX_AGE_SECS));
        if batch_due && !state.pending_greeks.is_empty() {
            let batch_size = state.pending_greeks.len();
            state.pending_greeks.clear();
            state.last_batch = Some(now);
            drop(state);
            self.flush_greeks(today).await;
            self.batches.fetch_add(1, Ordering::SeqCst);
            debug!(batch_size, "greeks batch flushed");
        } else {
            self.avoided
                .fetch_add(changed.len() as u64, Ordering::SeqCst);
            drop(state);
        }

        self.maybe_maintain_cache().await;
        true
    }

    pub fn metrics(&self) -> OptimizerMetrics {
        OptimizerMetrics {
            events_processed: self.events_processed.load(Ordering::SeqCst),
            events_skipped: self.events_skipped.load(Ordering::SeqCst),
            computational_savings_ms: self.savings_ms.load(Ordering::SeqCst),
            unnecessary_calculations_avoided: self.avoided.load(Ordering::SeqCst),
            greeks_batches: self.batches.load(Ordering::SeqCst),
        }
    }

    async fn flush_greeks(&self, today: NaiveDate) {
        let positions = self.positions.all_positions().await;
        let equities: HashMap<String, i64> = self
            .broker
            .portfolio()
            .await
            .into_iter()
            .filter(|(symbol, _)| !symbol.contains(' '))
            .map(|(symbol, holding)| (symbol, holding.quantity))
            .collect();
        let aggregate = self.greeks.portfolio_greeks(&positions, &equities, today).await;
        self.greeks.analyze_and_publish(&aggregate).await;
    }

    async fn maybe_maintain_cache(&self) {
        let stats = self.cache.stats().await;
        if stats.hit_rate() < MAINTENANCE_HIT_RATE_FLOOR
            || stats.approx_bytes > MAINTENANCE_MEMORY_BYTES
            || stats.fill_level() > MAINTENANCE_FILL_LEVEL
        {
            let freed = self.cache.periodic_maintenance().await;
            debug!(freed, "conditional cache maintenance ran");
        }
    }
}
