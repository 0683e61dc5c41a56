//! Scenario: a Greeks -> performance -> Greeks event cycle is refused by
//! the bus on the repeated publication.

use async_trait::async_trait;
use serde_json::Map;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use wingspan::domain::errors::EventError;
use wingspan::domain::events::{Event, EventType};
use wingspan::infrastructure::event_bus::{EventBus, EventHandler};

/// On GreeksCalculated, flags a performance breach.
struct PerformanceWatcher {
    bus: Arc<EventBus>,
}

#[async_trait]
impl EventHandler for PerformanceWatcher {
    async fn handle(&self, event: &Event) -> Result<(), EventError> {
        self.bus
            .publish_with_loop_detection(
                EventType::PerformanceThresholdBreach,
                Map::new(),
                "performance_tracker",
                Some(event),
            )
            .await;
        Ok(())
    }
}

/// On a performance breach, asks for fresh Greeks, which the computing
/// handler answers by publishing GreeksCalculated again: the cycle.
struct BreachResponder {
    bus: Arc<EventBus>,
}

#[async_trait]
impl EventHandler for BreachResponder {
    async fn handle(&self, event: &Event) -> Result<(), EventError> {
        self.bus
            .publish_with_loop_detection(
                EventType::GreeksCalculationRequest,
                Map::new(),
                "performance_tracker",
                Some(event),
            )
            .await;
        Ok(())
    }
}

struct GreeksComputer {
    bus: Arc<EventBus>,
    refused: Arc<AtomicUsize>,
}

#[async_trait]
impl EventHandler for GreeksComputer {
    async fn handle(&self, event: &Event) -> Result<(), EventError> {
        let published = self
            .bus
            .publish_with_loop_detection(
                EventType::GreeksCalculated,
                Map::new(),
                "greeks_service",
                Some(event),
            )
            .await;
        if !published {
            self.refused.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

struct Counter {
    count: Arc<AtomicUsize>,
}

#[async_trait]
impl EventHandler for Counter {
    async fn handle(&self, _event: &Event) -> Result<(), EventError> {
        self.count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[tokio::test]
async fn greeks_performance_cycle_is_broken() {
    let bus = Arc::new(EventBus::new());
    let refused = Arc::new(AtomicUsize::new(0));
    let circular_events = Arc::new(AtomicUsize::new(0));

    bus.subscribe(
        EventType::GreeksCalculated,
        Arc::new(PerformanceWatcher { bus: bus.clone() }),
        "performance_tracker",
        0,
    )
    .await;
    bus.subscribe(
        EventType::PerformanceThresholdBreach,
        Arc::new(BreachResponder { bus: bus.clone() }),
        "performance_tracker",
        0,
    )
    .await;
    bus.subscribe(
        EventType::GreeksCalculationRequest,
        Arc::new(GreeksComputer {
            bus: bus.clone(),
            refused: refused.clone(),
        }),
        "greeks_service",
        0,
    )
    .await;
    bus.subscribe(
        EventType::CircularDependencyDetected,
        Arc::new(Counter {
            count: circular_events.clone(),
        }),
        "audit",
        0,
    )
    .await;

    // Seed the chain with a root Greeks publication.
    bus.publish(EventType::GreeksCalculated, Map::new(), "greeks_service")
        .await;

    // The second GreeksCalculated from the same source was refused: the
    // chain already contains (GreeksCalculated, greeks_service).
    assert_eq!(refused.load(Ordering::SeqCst), 1);
    assert_eq!(bus.loops_prevented(), 1);
    assert_eq!(circular_events.load(Ordering::SeqCst), 1);
}
