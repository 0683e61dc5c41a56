use crate::domain::options::ContractRef;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};
use uuid::Uuid;

/// Role a leg plays inside its structure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LegRole {
    LeapCall,
    WeeklyCall,
    DebitLongPut,
    DebitShortPut,
    NakedPut,
    ShortPut,
    ShortCall,
    LongPut,
    LongCall,
    LadderRung,
}

impl fmt::Display for LegRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ComponentStatus {
    Pending,
    Open,
    PartiallyFilled,
    Closed,
    Cancelled,
    Assigned,
}

/// A single leg of a multi-leg position. Quantity is signed: positive long,
/// negative short.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionComponent {
    pub id: Uuid,
    pub strategy_id: String,
    pub underlying: String,
    pub role: LegRole,
    pub contract: ContractRef,
    pub quantity: i64,
    pub entry_price: Decimal,
    pub current_price: Decimal,
    pub commission: Decimal,
    pub multiplier: u32,
    pub status: ComponentStatus,
    pub order_link: Option<Uuid>,
    pub filled_at: Option<DateTime<Utc>>,
    pub pnl: Decimal,
}

impl PositionComponent {
    pub fn new(
        strategy_id: &str,
        role: LegRole,
        contract: ContractRef,
        quantity: i64,
        entry_price: Decimal,
    ) -> Self {
        let multiplier = contract.multiplier;
        Self {
            id: Uuid::new_v4(),
            strategy_id: strategy_id.to_string(),
            underlying: contract.underlying.clone(),
            role,
            contract,
            quantity,
            entry_price,
            current_price: entry_price,
            commission: Decimal::ZERO,
            multiplier,
            status: ComponentStatus::Pending,
            order_link: None,
            filled_at: None,
            pnl: Decimal::ZERO,
        }
    }

    pub fn is_short(&self) -> bool {
        self.quantity < 0
    }

    pub fn is_open(&self) -> bool {
        matches!(
            self.status,
            ComponentStatus::Open | ComponentStatus::PartiallyFilled
        )
    }

    pub fn dte(&self, today: NaiveDate) -> i64 {
        self.contract.dte(today)
    }

    /// Sign-aware P&L: a short leg profits when the price falls.
    pub fn recompute_pnl(&mut self) {
        let per_contract = self.current_price - self.entry_price;
        self.pnl = per_contract * Decimal::from(self.quantity) * Decimal::from(self.multiplier)
            - self.commission;
    }

    /// Absolute cost to carry this leg at current prices (premium terms).
    pub fn current_cost(&self) -> Decimal {
        self.current_price * Decimal::from(self.quantity.abs()) * Decimal::from(self.multiplier)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PositionStatus {
    Building,
    Active,
    PartiallyClosed,
    Closed,
}

/// A multi-leg position owned by exactly one strategy. Components are held
/// only inside positions; the ordered map preserves leg insertion order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MultiLegPosition {
    pub id: Uuid,
    pub strategy_id: String,
    pub underlying: String,
    pub components: BTreeMap<Uuid, PositionComponent>,
    pub opened_at: DateTime<Utc>,
    pub metadata: serde_json::Map<String, serde_json::Value>,
    pub status: PositionStatus,
}

impl MultiLegPosition {
    pub fn new(strategy_id: &str, underlying: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            strategy_id: strategy_id.to_string(),
            underlying: underlying.to_string(),
            components: BTreeMap::new(),
            opened_at: Utc::now(),
            metadata: serde_json::Map::new(),
            status: PositionStatus::Building,
        }
    }

    pub fn attach(&mut self, component: PositionComponent) -> Uuid {
        let id = component.id;
        self.components.insert(id, component);
        id
    }

    pub fn total_pnl(&self) -> Decimal {
        self.components.values().map(|c| c.pnl).sum()
    }

    /// Net premium at entry: positive for net credit, negative for net debit.
    pub fn entry_premium(&self) -> Decimal {
        self.components
            .values()
            .map(|c| {
                -c.entry_price * Decimal::from(c.quantity) * Decimal::from(c.multiplier)
            })
            .sum()
    }

    /// Cost to close all open legs at current prices, signed the same way.
    pub fn current_close_cost(&self) -> Decimal {
        self.components
            .values()
            .filter(|c| c.is_open())
            .map(|c| {
                -c.current_price * Decimal::from(c.quantity) * Decimal::from(c.multiplier)
            })
            .sum()
    }

    pub fn min_dte(&self, today: NaiveDate) -> Option<i64> {
        self.components
            .values()
            .filter(|c| c.is_open())
            .map(|c| c.dte(today))
            .min()
    }

    pub fn open_components(&self) -> impl Iterator<Item = &PositionComponent> {
        self.components.values().filter(|c| c.is_open())
    }

    pub fn has_open_short_option(&self) -> bool {
        self.components.values().any(|c| c.is_open() && c.is_short())
    }

    pub fn all_closed(&self) -> bool {
        !self.components.is_empty()
            && self
                .components
                .values()
                .all(|c| c.status == ComponentStatus::Closed)
    }

    pub fn components_with_role(&self, role: LegRole) -> Vec<&PositionComponent> {
        self.components.values().filter(|c| c.role == role).collect()
    }
}

/// Order-independent hash of the invested option set (symbol, quantity).
/// Used by the cache as the position-sensitive fingerprint.
pub fn invested_set_hash<'a>(
    components: impl Iterator<Item = &'a PositionComponent>,
) -> u64 {
    let mut entries: Vec<(String, i64)> = components
        .filter(|c| c.is_open())
        .map(|c| (c.contract.symbol(), c.quantity))
        .collect();
    entries.sort();
    let mut hasher = DefaultHasher::new();
    entries.hash(&mut hasher);
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::options::OptionRight;
    use rust_decimal_macros::dec;

    fn put(strike: Decimal, qty: i64, entry: Decimal) -> PositionComponent {
        let contract = ContractRef::new(
            "SPY",
            strike,
            NaiveDate::from_ymd_opt(2024, 6, 21).unwrap(),
            OptionRight::Put,
        );
        PositionComponent::new("lt112", LegRole::NakedPut, contract, qty, entry)
    }

    #[test]
    fn short_leg_pnl_is_sign_aware() {
        let mut c = put(dec!(440), -2, dec!(3.50));
        c.current_price = dec!(1.75);
        c.recompute_pnl();
        // Short 2 contracts, premium halved: (1.75 - 3.50) * -2 * 100 = +350
        assert_eq!(c.pnl, dec!(350));
    }

    #[test]
    fn long_leg_pnl() {
        let mut c = put(dec!(440), 1, dec!(3.50));
        c.current_price = dec!(5.00);
        c.recompute_pnl();
        assert_eq!(c.pnl, dec!(150));
    }

    #[test]
    fn position_pnl_is_component_sum() {
        let mut pos = MultiLegPosition::new("lt112", "SPY");
        let mut a = put(dec!(440), -2, dec!(3.50));
        a.status = ComponentStatus::Open;
        a.current_price = dec!(1.75);
        a.recompute_pnl();
        let mut b = put(dec!(430), 1, dec!(2.00));
        b.status = ComponentStatus::Open;
        b.current_price = dec!(1.00);
        b.recompute_pnl();
        pos.attach(a);
        pos.attach(b);
        assert_eq!(pos.total_pnl(), dec!(250));
    }

    #[test]
    fn entry_premium_sign_convention() {
        let mut pos = MultiLegPosition::new("strangle", "SPY");
        let mut short = put(dec!(440), -1, dec!(3.00));
        short.status = ComponentStatus::Open;
        pos.attach(short);
        // Short one put at 3.00: credit of 300
        assert_eq!(pos.entry_premium(), dec!(300));
    }

    #[test]
    fn invested_hash_changes_with_quantity() {
        let mut a = put(dec!(440), -2, dec!(3.50));
        a.status = ComponentStatus::Open;
        let mut b = a.clone();
        b.quantity = -1;
        let ha = invested_set_hash([&a].into_iter());
        let hb = invested_set_hash([&b].into_iter());
        assert_ne!(ha, hb);
    }

    #[test]
    fn min_dte_over_open_legs() {
        let mut pos = MultiLegPosition::new("lt112", "SPY");
        let mut near = put(dec!(440), -1, dec!(3.00));
        near.status = ComponentStatus::Open;
        near.contract.expiry = NaiveDate::from_ymd_opt(2024, 3, 15).unwrap();
        let mut far = put(dec!(430), -1, dec!(2.00));
        far.status = ComponentStatus::Open;
        far.contract.expiry = NaiveDate::from_ymd_opt(2024, 6, 21).unwrap();
        pos.attach(near);
        pos.attach(far);
        let today = NaiveDate::from_ymd_opt(2024, 2, 23).unwrap();
        assert_eq!(pos.min_dte(today), Some(21));
    }
}
