use crate::domain::errors::{PersistenceError, TradingError};
use crate::domain::events::EventType;
use crate::domain::ports::{BrokerAdapter, ObjectStore};
use crate::domain::positions::{
    ComponentStatus, MultiLegPosition, PositionComponent, PositionStatus, invested_set_hash,
};
use crate::infrastructure::event_bus::EventBus;
use crate::payload;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const POSITIONS_STORE_KEY: &str = "positions";
const SNAPSHOT_VERSION: u32 = 2;

/// Structural-completeness predicate, one per strategy.
pub type StructurePredicate = Arc<dyn Fn(&MultiLegPosition) -> bool + Send + Sync>;

/// Authoritative record of every multi-leg position. Components exist only
/// inside positions; strategies mutate through this service, never directly.
pub struct PositionStateManager {
    positions: RwLock<HashMap<Uuid, MultiLegPosition>>,
    predicates: RwLock<HashMap<String, StructurePredicate>>,
    broker: Arc<dyn BrokerAdapter>,
    bus: Arc<EventBus>,
}

impl PositionStateManager {
    pub fn new(broker: Arc<dyn BrokerAdapter>, bus: Arc<EventBus>) -> Self {
        Self {
            positions: RwLock::new(HashMap::new()),
            predicates: RwLock::new(HashMap::new()),
            broker,
            bus,
        }
    }

    /// Register the completeness predicate for a strategy. Positions with no
    /// registered predicate are complete once every component is open.
    pub async fn register_structure(&self, strategy_id: &str, predicate: StructurePredicate) {
        self.predicates
            .write()
            .await
            .insert(strategy_id.to_string(), predicate);
    }

    /// Atomically attach all components under a new position.
    pub async fn open_position(
        &self,
        strategy_id: &str,
        underlying: &str,
        components: Vec<PositionComponent>,
    ) -> Uuid {
        let mut position = MultiLegPosition::new(strategy_id, underlying);
        for component in components {
            position.attach(component);
        }
        self.refresh_status(&mut position).await;
        let id = position.id;
        let symbol = position.underlying.clone();
        self.positions.write().await.insert(id, position);
        self.bus
            .publish(
                EventType::PositionOpened,
                payload! {
                    "positionId" => id.to_string(),
                    "strategyId" => strategy_id,
                    "symbol" => symbol,
                    "timestamp" => Utc::now().to_rfc3339(),
                },
                "position_state",
            )
            .await;
        id
    }

    /// Attach one more component to an existing position (e.g. a new weekly
    /// call against a held LEAP).
    pub async fn add_component(
        &self,
        position_id: Uuid,
        component: PositionComponent,
    ) -> Result<Uuid, TradingError> {
        let component_id = {
            let mut positions = self.positions.write().await;
            let position = positions
                .get_mut(&position_id)
                .ok_or(TradingError::PositionNotFound { position_id })?;
            position.attach(component)
        };
        self.refresh_stored_status(position_id).await?;
        Ok(component_id)
    }

    /// Record a fill on a pending component.
    pub async fn mark_component_open(
        &self,
        position_id: Uuid,
        component_id: Uuid,
        fill_price: Decimal,
        order_link: Option<Uuid>,
        filled_at: DateTime<Utc>,
    ) -> Result<(), TradingError> {
        {
            let mut positions = self.positions.write().await;
            let position = positions
                .get_mut(&position_id)
                .ok_or(TradingError::PositionNotFound { position_id })?;
            let component = position
                .components
                .get_mut(&component_id)
                .ok_or(TradingError::ComponentNotFound { component_id })?;
            component.status = ComponentStatus::Open;
            component.entry_price = fill_price;
            component.current_price = fill_price;
            component.order_link = order_link;
            component.filled_at = Some(filled_at);
            component.recompute_pnl();
        }
        self.refresh_stored_status(position_id).await
    }

    /// Transition one component to Closed and refresh the position status.
    pub async fn close_component(
        &self,
        position_id: Uuid,
        component_id: Uuid,
    ) -> Result<(), TradingError> {
        let fully_closed = {
            let mut positions = self.positions.write().await;
            let position = positions
                .get_mut(&position_id)
                .ok_or(TradingError::PositionNotFound { position_id })?;
            let component = position
                .components
                .get_mut(&component_id)
                .ok_or(TradingError::ComponentNotFound { component_id })?;
            component.status = ComponentStatus::Closed;
            position.all_closed()
        };
        self.refresh_stored_status(position_id).await?;
        if fully_closed {
            self.dissolve(position_id).await;
        }
        Ok(())
    }

    pub async fn close_position(&self, position_id: Uuid) -> Result<(), TradingError> {
        let component_ids: Vec<Uuid> = {
            let positions = self.positions.read().await;
            let position = positions
                .get(&position_id)
                .ok_or(TradingError::PositionNotFound { position_id })?;
            position.components.keys().copied().collect()
        };
        for component_id in component_ids {
            self.close_component(position_id, component_id).await?;
        }
        Ok(())
    }

    /// Refresh current prices (keyed by contract symbol) and recompute
    /// sign-aware P&L.
    pub async fn update_prices(&self, prices: &HashMap<String, Decimal>) {
        let mut positions = self.positions.write().await;
        for position in positions.values_mut() {
            for component in position.components.values_mut() {
                if let Some(price) = prices.get(&component.contract.symbol()) {
                    component.current_price = *price;
                    component.recompute_pnl();
                }
            }
        }
    }

    /// Minimum DTE across a position's open components.
    pub async fn position_dte(&self, position_id: Uuid, today: NaiveDate) -> Option<i64> {
        self.positions
            .read()
            .await
            .get(&position_id)
            .and_then(|p| p.min_dte(today))
    }

    pub async fn positions_for(&self, strategy_id: &str) -> Vec<MultiLegPosition> {
        self.positions
            .read()
            .await
            .values()
            .filter(|p| p.strategy_id == strategy_id)
            .cloned()
            .collect()
    }

    pub async fn all_positions(&self) -> Vec<MultiLegPosition> {
        self.positions.read().await.values().cloned().collect()
    }

    pub async fn get(&self, position_id: Uuid) -> Option<MultiLegPosition> {
        self.positions.read().await.get(&position_id).cloned()
    }

    /// Hash of the invested option set, the cache's position fingerprint.
    pub async fn invested_hash(&self) -> u64 {
        let positions = self.positions.read().await;
        invested_set_hash(positions.values().flat_map(|p| p.components.values()))
    }

    /// Walk broker holdings and log quantity/price discrepancies. Never
    /// auto-corrects; reconciliation is an operator action. Returns the
    /// discrepancy count.
    pub async fn sync_with_broker(&self) -> usize {
        let holdings = self.broker.portfolio().await;
        let positions = self.positions.read().await;

        let mut ours: HashMap<String, i64> = HashMap::new();
        for position in positions.values() {
            for component in position.open_components() {
                *ours.entry(component.contract.symbol()).or_insert(0) += component.quantity;
            }
        }

        let mut discrepancies = 0usize;
        for (symbol, holding) in &holdings {
            let tracked = ours.get(symbol).copied().unwrap_or(0);
            if tracked != holding.quantity {
                warn!(
                    symbol,
                    tracked,
                    broker = holding.quantity,
                    "position quantity mismatch against broker"
                );
                discrepancies += 1;
            }
        }
        for (symbol, quantity) in &ours {
            if *quantity != 0 && !holdings.contains_key(symbol) {
                warn!(symbol, quantity, "tracked position missing from broker holdings");
                discrepancies += 1;
            }
        }
        if discrepancies == 0 {
            debug!("broker sync clean");
        }
        discrepancies
    }

    /// Snapshot in the persisted layout:
    /// `{positions: {id: {...}}, metadata: {last_updated, version}}`.
    pub async fn serialize_state(&self) -> Value {
        let positions = self.positions.read().await;
        let mut by_id = serde_json::Map::new();
        for (id, position) in positions.iter() {
            by_id.insert(
                id.to_string(),
                serde_json::to_value(position).unwrap_or(Value::Null),
            );
        }
        json!({
            "positions": by_id,
            "metadata": {
                "last_updated": Utc::now().to_rfc3339(),
                "version": SNAPSHOT_VERSION,
            },
        })
    }

    pub async fn deserialize_state(&self, snapshot: &Value) -> Result<usize, PersistenceError> {
        let entries = snapshot
            .get("positions")
            .and_then(Value::as_object)
            .ok_or_else(|| PersistenceError::Corrupt {
                key: POSITIONS_STORE_KEY.to_string(),
                reason: "missing positions object".to_string(),
            })?;
        let mut restored = HashMap::new();
        for (id, value) in entries {
            let position: MultiLegPosition =
                serde_json::from_value(value.clone()).map_err(|e| PersistenceError::Corrupt {
                    key: POSITIONS_STORE_KEY.to_string(),
                    reason: e.to_string(),
                })?;
            let id = id.parse().map_err(|_| PersistenceError::Corrupt {
                key: POSITIONS_STORE_KEY.to_string(),
                reason: format!("bad position id {id}"),
            })?;
            restored.insert(id, position);
        }
        let count = restored.len();
        *self.positions.write().await = restored;
        info!(count, "restored positions from snapshot");
        Ok(count)
    }

    pub async fn save_to(&self, store: &dyn ObjectStore) -> Result<(), PersistenceError> {
        let snapshot = self.serialize_state().await;
        store
            .save(POSITIONS_STORE_KEY, snapshot.to_string().as_bytes())
            .await
    }

    pub async fn load_from(&self, store: &dyn ObjectStore) -> Result<usize, PersistenceError> {
        let bytes = store.read(POSITIONS_STORE_KEY).await?;
        let snapshot: Value =
            serde_json::from_slice(&bytes).map_err(|e| PersistenceError::Corrupt {
                key: POSITIONS_STORE_KEY.to_string(),
                reason: e.to_string(),
            })?;
        self.deserialize_state(&snapshot).await
    }

    async fn refresh_stored_status(&self, position_id: Uuid) -> Result<(), TradingError> {
        let mut position = self
            .get(position_id)
            .await
            .ok_or(TradingError::PositionNotFound { position_id })?;
        self.refresh_status(&mut position).await;
        self.positions.write().await.insert(position_id, position);
        Ok(())
    }

    async fn refresh_status(&self, position: &mut MultiLegPosition) {
        let predicates = self.predicates.read().await;
        let complete = predicates
            .get(&position.strategy_id)
            .map(|p| p(position))
            .unwrap_or_else(|| position.components.values().all(|c| c.is_open()));

        position.status = if position.all_closed() {
            PositionStatus::Closed
        } else if position
            .components
            .values()
            .any(|c| c.status == ComponentStatus::Closed)
        {
            PositionStatus::PartiallyClosed
        } else if complete {
            PositionStatus::Active
        } else {
            PositionStatus::Building
        };
    }

    async fn dissolve(&self, position_id: Uuid) {
        let removed = self.positions.write().await.remove(&position_id);
        if let Some(position) = removed {
            let pnl = position.total_pnl();
            self.bus
                .publish(
                    EventType::PositionClosed,
                    payload! {
                        "positionId" => position_id.to_string(),
                        "strategyId" => position.strategy_id,
                        "symbol" => position.underlying,
                        "pnl" => pnl.to_f64().unwrap_or(0.0),
                        "timestamp" => Utc::now().to_rfc3339(),
                    },
                    "position_state",
                )
                .await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::options::{ContractRef, OptionRight};
    use crate::domain::positions::LegRole;
    use crate::infrastructure::mock::MockBroker;
    use crate::infrastructure::persistence::InMemoryStore;
    use rust_decimal_macros::dec;

    fn make_manager() -> (PositionStateManager, Arc<MockBroker>) {
        let broker = Arc::new(MockBroker::new());
        let bus = Arc::new(EventBus::new());
        (PositionStateManager::new(broker.clone(), bus), broker)
    }

    fn leg(role: LegRole, right: OptionRight, strike: Decimal, qty: i64) -> PositionComponent {
        let contract = ContractRef::new(
            "SPY",
            strike,
            NaiveDate::from_ymd_opt(2024, 6, 21).unwrap(),
            right,
        );
        let mut c = PositionComponent::new("lt112", role, contract, qty, dec!(2.00));
        c.status = ComponentStatus::Open;
        c
    }

    fn lt112_predicate() -> StructurePredicate {
        Arc::new(|p: &MultiLegPosition| {
            !p.components_with_role(LegRole::DebitLongPut).is_empty()
                && !p.components_with_role(LegRole::DebitShortPut).is_empty()
                && !p.components_with_role(LegRole::NakedPut).is_empty()
        })
    }

    #[tokio::test]
    async fn position_active_when_structure_complete() {
        let (manager, _) = make_manager();
        manager.register_structure("lt112", lt112_predicate()).await;
        let id = manager
            .open_position(
                "lt112",
                "SPY",
                vec![
                    leg(LegRole::DebitLongPut, OptionRight::Put, dec!(440), 1),
                    leg(LegRole::DebitShortPut, OptionRight::Put, dec!(430), -1),
                    leg(LegRole::NakedPut, OptionRight::Put, dec!(410), -2),
                ],
            )
            .await;
        let position = manager.get(id).await.unwrap();
        assert_eq!(position.status, PositionStatus::Active);
    }

    #[tokio::test]
    async fn incomplete_structure_stays_building() {
        let (manager, _) = make_manager();
        manager.register_structure("lt112", lt112_predicate()).await;
        let id = manager
            .open_position(
                "lt112",
                "SPY",
                vec![leg(LegRole::DebitLongPut, OptionRight::Put, dec!(440), 1)],
            )
            .await;
        assert_eq!(manager.get(id).await.unwrap().status, PositionStatus::Building);
    }

    #[tokio::test]
    async fn closing_all_components_dissolves_position() {
        let (manager, _) = make_manager();
        let id = manager
            .open_position(
                "lt112",
                "SPY",
                vec![
                    leg(LegRole::NakedPut, OptionRight::Put, dec!(410), -2),
                    leg(LegRole::DebitLongPut, OptionRight::Put, dec!(440), 1),
                ],
            )
            .await;
        manager.close_position(id).await.unwrap();
        assert!(manager.get(id).await.is_none());
    }

    #[tokio::test]
    async fn partial_close_is_partially_closed() {
        let (manager, _) = make_manager();
        let id = manager
            .open_position(
                "lt112",
                "SPY",
                vec![
                    leg(LegRole::NakedPut, OptionRight::Put, dec!(410), -2),
                    leg(LegRole::DebitLongPut, OptionRight::Put, dec!(440), 1),
                ],
            )
            .await;
        let first = manager
            .get(id)
            .await
            .unwrap()
            .components
            .keys()
            .next()
            .copied()
            .unwrap();
        manager.close_component(id, first).await.unwrap();
        assert_eq!(
            manager.get(id).await.unwrap().status,
            PositionStatus::PartiallyClosed
        );
    }

    #[tokio::test]
    async fn update_prices_recomputes_pnl() {
        let (manager, _) = make_manager();
        let short = leg(LegRole::NakedPut, OptionRight::Put, dec!(410), -2);
        let symbol = short.contract.symbol();
        let id = manager.open_position("lt112", "SPY", vec![short]).await;

        let mut prices = HashMap::new();
        prices.insert(symbol, dec!(1.00));
        manager.update_prices(&prices).await;

        let position = manager.get(id).await.unwrap();
        // Short 2 at 2.00, now 1.00: (1 - 2) * -2 * 100 = +200
        assert_eq!(position.total_pnl(), dec!(200));
    }

    #[tokio::test]
    async fn serialize_roundtrip_is_identity() {
        let (manager, _) = make_manager();
        manager.register_structure("lt112", lt112_predicate()).await;
        let id = manager
            .open_position(
                "lt112",
                "SPY",
                vec![
                    leg(LegRole::DebitLongPut, OptionRight::Put, dec!(440), 1),
                    leg(LegRole::DebitShortPut, OptionRight::Put, dec!(430), -1),
                    leg(LegRole::NakedPut, OptionRight::Put, dec!(410), -2),
                ],
            )
            .await;
        let before = manager.get(id).await.unwrap();

        let store = InMemoryStore::new();
        manager.save_to(&store).await.unwrap();

        let (restored, _) = make_manager();
        restored.load_from(&store).await.unwrap();
        let after = restored.get(id).await.unwrap();

        assert_eq!(before.id, after.id);
        assert_eq!(before.status, after.status);
        assert_eq!(before.components.len(), after.components.len());
        for (component_id, component) in &before.components {
            let restored_component = &after.components[component_id];
            assert_eq!(component.quantity, restored_component.quantity);
            assert_eq!(component.entry_price, restored_component.entry_price);
            assert_eq!(component.order_link, restored_component.order_link);
            assert_eq!(component.role, restored_component.role);
        }
    }

    #[tokio::test]
    async fn broker_sync_logs_discrepancies_without_correcting() {
        let (manager, broker) = make_manager();
        let short = leg(LegRole::NakedPut, OptionRight::Put, dec!(410), -2);
        let symbol = short.contract.symbol();
        let id = manager.open_position("lt112", "SPY", vec![short]).await;

        // Broker reports only -1 contract.
        broker.set_holding(&symbol, -1, dec!(2.00)).await;
        let discrepancies = manager.sync_with_broker().await;
        assert_eq!(discrepancies, 1);
        // Not auto-corrected.
        let position = manager.get(id).await.unwrap();
        let component = position.components.values().next().unwrap();
        assert_eq!(component.quantity, -2);
    }

    #[tokio::test]
    async fn invested_hash_tracks_changes() {
        let (manager, _) = make_manager();
        let h0 = manager.invested_hash().await;
        manager
            .open_position(
                "lt112",
                "SPY",
                vec![leg(LegRole::NakedPut, OptionRight::Put, dec!(410), -2)],
            )
            .await;
        let h1 = manager.invested_hash().await;
        assert_ne!(h0, h1);
    }
}
