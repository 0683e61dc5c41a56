use crate::domain::errors::EventError;
use crate::domain::events::{Event, EventType};
use crate::payload;
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::{RwLock, oneshot};
use tracing::{debug, error, warn};
use uuid::Uuid;

/// Default deadline for a request/response round trip.
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 5_000;

const HISTORY_LIMIT: usize = 500;
const MAX_PAYLOAD_DEPTH: usize = 16;
/// Window scanned for an indirectly repeated `(type, source)` pair.
const INDIRECT_CYCLE_WINDOW: usize = 3;

/// A subscriber to one event type.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: &Event) -> Result<(), EventError>;
}

struct Subscription {
    handler: std::sync::Arc<dyn EventHandler>,
    source: String,
    priority: i32,
    seq: u64,
    failures: std::sync::Arc<AtomicU64>,
}

struct PendingRequest {
    response_type: EventType,
    sender: oneshot::Sender<Event>,
    deadline: Instant,
}

#[derive(Debug, Clone, Default)]
pub struct BusStats {
    pub published: u64,
    pub loops_prevented: u64,
    pub handler_failures: u64,
}

/// Priority-ordered publish/subscribe with correlation-preserving
/// request/response and active event-loop prevention.
///
/// Fan-out is synchronous within the tick: the publisher's stack unwinds
/// before the next publication, and publications from inside a handler are
/// nested and depth-bounded by the loop detector.
pub struct EventBus {
    subscriptions: RwLock<HashMap<EventType, Vec<Subscription>>>,
    pending: Mutex<HashMap<Uuid, PendingRequest>>,
    history: Mutex<VecDeque<Event>>,
    published: AtomicU64,
    loops_prevented: AtomicU64,
    handler_failures: AtomicU64,
    seq: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            subscriptions: RwLock::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            history: Mutex::new(VecDeque::new()),
            published: AtomicU64::new(0),
            loops_prevented: AtomicU64::new(0),
            handler_failures: AtomicU64::new(0),
            seq: AtomicU64::new(0),
        }
    }

    /// Register a handler. Handlers for one event type run in descending
    /// priority order; insertion order breaks ties.
    pub async fn subscribe(
        &self,
        event_type: EventType,
        handler: std::sync::Arc<dyn EventHandler>,
        source: &str,
        priority: i32,
    ) {
        let seq = self.seq.fetch_add(1, Ordering::SeqCst);
        let mut subs = self.subscriptions.write().await;
        let list = subs.entry(event_type).or_default();
        list.push(Subscription {
            handler,
            source: source.to_string(),
            priority,
            seq,
            failures: std::sync::Arc::new(AtomicU64::new(0)),
        });
        list.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.seq.cmp(&b.seq)));
    }

    pub async fn subscriber_count(&self, event_type: EventType) -> usize {
        self.subscriptions
            .read()
            .await
            .get(&event_type)
            .map_or(0, Vec::len)
    }

    /// Publish a root event. Returns true iff the payload was accepted and
    /// every handler succeeded.
    pub async fn publish(
        &self,
        event_type: EventType,
        payload: Map<String, Value>,
        source: &str,
    ) -> bool {
        if let Err(err) = validate_payload(&payload) {
            error!(%event_type, source, %err, "payload rejected");
            return false;
        }
        let event = Event::new(event_type, payload, source);
        self.dispatch(event).await
    }

    /// Publish an event derived from `parent`, refusing cyclic chains.
    ///
    /// Refusal conditions: the chain is at its hop cap, the `(type, source)`
    /// pair already appears anywhere in the chain, or it appears within the
    /// trailing indirect-cycle window. A refusal emits
    /// `CircularDependencyDetected` and bumps `loops_prevented`.
    pub async fn publish_with_loop_detection(
        &self,
        event_type: EventType,
        payload: Map<String, Value>,
        source: &str,
        parent: Option<&Event>,
    ) -> bool {
        let Some(parent) = parent else {
            return self.publish(event_type, payload, source).await;
        };
        if let Err(err) = validate_payload(&payload) {
            error!(%event_type, source, %err, "payload rejected");
            return false;
        }

        let pair = (event_type, source.to_string());
        let at_hop_cap = parent.hops + 1 >= parent.max_hops;
        let in_chain = parent.chain.contains(&pair);
        let in_window = parent
            .chain
            .iter()
            .rev()
            .take(INDIRECT_CYCLE_WINDOW)
            .any(|entry| *entry == pair);

        if at_hop_cap || in_chain || in_window {
            self.loops_prevented.fetch_add(1, Ordering::SeqCst);
            warn!(
                %event_type,
                source,
                hops = parent.hops,
                chain_len = parent.chain.len(),
                "publication refused: circular event chain"
            );
            let detail = payload! {
                "refused_type" => event_type.to_string(),
                "source" => source,
                "hops" => parent.hops,
                "chain" => parent
                    .chain
                    .iter()
                    .map(|(t, s)| format!("{t}<-{s}"))
                    .collect::<Vec<_>>(),
            };
            self.dispatch(Event::new(EventType::CircularDependencyDetected, detail, "event_bus"))
                .await;
            return false;
        }

        self.dispatch(parent.child(event_type, payload, source)).await
    }

    /// Publish `request_type` and await the matching-correlation response of
    /// `response_type`. Stale pending requests are reaped on every publish.
    pub async fn request(
        &self,
        request_type: EventType,
        response_type: EventType,
        mut payload: Map<String, Value>,
        source: &str,
        timeout: Duration,
    ) -> Result<Event, EventError> {
        if let Err(err) = validate_payload(&payload) {
            return Err(err);
        }
        let correlation_id = Uuid::new_v4();
        payload.insert("correlation_id".to_string(), Value::String(correlation_id.to_string()));
        payload.insert("response_type".to_string(), Value::String(response_type.to_string()));

        let (sender, receiver) = oneshot::channel();
        {
            let mut pending = self.pending.lock().expect("pending lock poisoned");
            pending.insert(
                correlation_id,
                PendingRequest {
                    response_type,
                    sender,
                    deadline: Instant::now() + timeout,
                },
            );
        }

        let mut event = Event::new(request_type, payload, source);
        event.correlation_id = Some(correlation_id);
        self.dispatch(event).await;

        match tokio::time::timeout(timeout, receiver).await {
            Ok(Ok(response)) => Ok(response),
            _ => {
                self.pending
                    .lock()
                    .expect("pending lock poisoned")
                    .remove(&correlation_id);
                debug!(%request_type, "request timed out, callback dropped");
                Err(EventError::RequestTimeout {
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
        }
    }

    /// Publish a response to `request`, preserving its correlation id and
    /// chain. The response type is taken from the request payload.
    pub async fn respond(
        &self,
        request: &Event,
        payload: Map<String, Value>,
        source: &str,
    ) -> bool {
        let Some(response_type) = request
            .get_str("response_type")
            .and_then(|s| parse_event_type(s))
        else {
            warn!(source, "respond called on a request without response_type");
            return false;
        };
        self.publish_with_loop_detection(response_type, payload, source, Some(request))
            .await
    }

    pub fn loops_prevented(&self) -> u64 {
        self.loops_prevented.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> BusStats {
        BusStats {
            published: self.published.load(Ordering::SeqCst),
            loops_prevented: self.loops_prevented.load(Ordering::SeqCst),
            handler_failures: self.handler_failures.load(Ordering::SeqCst),
        }
    }

    /// Most recent events, newest last.
    pub fn recent_history(&self, limit: usize) -> Vec<Event> {
        let history = self.history.lock().expect("history lock poisoned");
        history.iter().rev().take(limit).rev().cloned().collect()
    }

    async fn dispatch(&self, event: Event) -> bool {
        self.published.fetch_add(1, Ordering::SeqCst);
        {
            let mut history = self.history.lock().expect("history lock poisoned");
            history.push_back(event.clone());
            while history.len() > HISTORY_LIMIT {
                history.pop_front();
            }
        }
        self.reap_stale_requests();
        self.route_response(&event);

        // Snapshot outside the lock: handlers may publish nested events.
        let handlers: Vec<(std::sync::Arc<dyn EventHandler>, String, std::sync::Arc<AtomicU64>)> = {
            let subs = self.subscriptions.read().await;
            subs.get(&event.event_type)
                .map(|list| {
                    list.iter()
                        .map(|s| (s.handler.clone(), s.source.clone(), s.failures.clone()))
                        .collect()
                })
                .unwrap_or_default()
        };

        let mut all_ok = true;
        for (handler, source, failures) in handlers {
            if let Err(err) = handler.handle(&event).await {
                failures.fetch_add(1, Ordering::SeqCst);
                self.handler_failures.fetch_add(1, Ordering::SeqCst);
                warn!(%event.event_type, handler = %source, %err, "handler failed");
                all_ok = false;
            }
        }
        all_ok
    }

    fn route_response(&self, event: &Event) {
        let Some(correlation_id) = event.correlation_id else {
            return;
        };
        let entry = {
            let mut pending = self.pending.lock().expect("pending lock poisoned");
            match pending.get(&correlation_id) {
                Some(p) if p.response_type == event.event_type => pending.remove(&correlation_id),
                _ => None,
            }
        };
        if let Some(entry) = entry {
            let _ = entry.sender.send(event.clone());
        }
    }

    fn reap_stale_requests(&self) {
        let now = Instant::now();
        let mut pending = self.pending.lock().expect("pending lock poisoned");
        pending.retain(|_, p| p.deadline > now);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

fn validate_payload(payload: &Map<String, Value>) -> Result<(), EventError> {
    for value in payload.values() {
        check_depth(value, 1)?;
    }
    Ok(())
}

fn check_depth(value: &Value, depth: usize) -> Result<(), EventError> {
    if depth > MAX_PAYLOAD_DEPTH {
        return Err(EventError::InvalidPayload {
            reason: format!("nesting exceeds {MAX_PAYLOAD_DEPTH} levels"),
        });
    }
    match value {
        Value::Object(map) => {
            for v in map.values() {
                check_depth(v, depth + 1)?;
            }
        }
        Value::Array(items) => {
            for v in items {
                check_depth(v, depth + 1)?;
            }
        }
        _ => {}
    }
    Ok(())
}

fn parse_event_type(s: &str) -> Option<EventType> {
    serde_json::from_value(Value::String(s.to_string())).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;

    struct CountingHandler {
        count: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl EventHandler for CountingHandler {
        async fn handle(&self, _event: &Event) -> Result<(), EventError> {
            self.count.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct FailingHandler;

    #[async_trait]
    impl EventHandler for FailingHandler {
        async fn handle(&self, _event: &Event) -> Result<(), EventError> {
            Err(EventError::HandlerFailed {
                handler: "failing".to_string(),
                reason: "boom".to_string(),
            })
        }
    }

    struct RecordingHandler {
        label: &'static str,
        order: Arc<Mutex<Vec<&'static str>>>,
    }

    #[async_trait]
    impl EventHandler for RecordingHandler {
        async fn handle(&self, _event: &Event) -> Result<(), EventError> {
            self.order.lock().unwrap().push(self.label);
            Ok(())
        }
    }

    #[tokio::test]
    async fn publish_reaches_all_subscribers() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        bus.subscribe(
            EventType::MarketDataUpdated,
            Arc::new(CountingHandler { count: count.clone() }),
            "test",
            0,
        )
        .await;
        bus.subscribe(
            EventType::MarketDataUpdated,
            Arc::new(CountingHandler { count: count.clone() }),
            "test2",
            0,
        )
        .await;

        let ok = bus
            .publish(EventType::MarketDataUpdated, payload! {"symbol" => "SPY"}, "feed")
            .await;
        assert!(ok);
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn handlers_run_in_priority_order() {
        let bus = EventBus::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        bus.subscribe(
            EventType::OrderFilled,
            Arc::new(RecordingHandler { label: "low", order: order.clone() }),
            "low",
            1,
        )
        .await;
        bus.subscribe(
            EventType::OrderFilled,
            Arc::new(RecordingHandler { label: "high", order: order.clone() }),
            "high",
            10,
        )
        .await;

        bus.publish(EventType::OrderFilled, Map::new(), "broker").await;
        assert_eq!(*order.lock().unwrap(), vec!["high", "low"]);
    }

    #[tokio::test]
    async fn handler_failure_is_isolated() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        bus.subscribe(EventType::OrderFilled, Arc::new(FailingHandler), "bad", 10).await;
        bus.subscribe(
            EventType::OrderFilled,
            Arc::new(CountingHandler { count: count.clone() }),
            "good",
            0,
        )
        .await;

        let ok = bus.publish(EventType::OrderFilled, Map::new(), "broker").await;
        assert!(!ok, "publisher must see the failure");
        assert_eq!(count.load(Ordering::SeqCst), 1, "siblings still run");
        assert_eq!(bus.stats().handler_failures, 1);
    }

    #[tokio::test]
    async fn direct_cycle_is_refused() {
        let bus = EventBus::new();
        let root = Event::new(EventType::GreeksCalculated, Map::new(), "greeks");
        let ok = bus
            .publish_with_loop_detection(EventType::GreeksCalculated, Map::new(), "greeks", Some(&root))
            .await;
        assert!(!ok);
        assert_eq!(bus.loops_prevented(), 1);
    }

    #[tokio::test]
    async fn refusal_emits_circular_dependency_event() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        bus.subscribe(
            EventType::CircularDependencyDetected,
            Arc::new(CountingHandler { count: count.clone() }),
            "audit",
            0,
        )
        .await;
        let root = Event::new(EventType::GreeksCalculated, Map::new(), "greeks");
        bus.publish_with_loop_detection(EventType::GreeksCalculated, Map::new(), "greeks", Some(&root))
            .await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn hop_cap_is_enforced() {
        let bus = EventBus::new();
        let mut event = Event::new(EventType::MarketDataUpdated, Map::new(), "feed");
        // Walk the chain to one hop short of the cap with distinct sources.
        for i in 0..(event.max_hops - 1) {
            event = event.child(EventType::MarketDataUpdated, Map::new(), &format!("hop{i}"));
        }
        let ok = bus
            .publish_with_loop_detection(EventType::MarketDataUpdated, Map::new(), "final", Some(&event))
            .await;
        assert!(!ok);
        assert_eq!(bus.loops_prevented(), 1);
    }

    #[tokio::test]
    async fn deep_payload_is_rejected() {
        let bus = EventBus::new();
        let mut value = Value::Bool(true);
        for _ in 0..20 {
            let mut map = Map::new();
            map.insert("nested".to_string(), value);
            value = Value::Object(map);
        }
        let mut payload = Map::new();
        payload.insert("deep".to_string(), value);
        let ok = bus.publish(EventType::MarketDataUpdated, payload, "feed").await;
        assert!(!ok);
    }

    struct Responder {
        bus: Arc<EventBus>,
    }

    #[async_trait]
    impl EventHandler for Responder {
        async fn handle(&self, event: &Event) -> Result<(), EventError> {
            self.bus
                .respond(event, payload! {"answer" => 42}, "responder")
                .await;
            Ok(())
        }
    }

    #[tokio::test]
    async fn request_response_roundtrip() {
        let bus = Arc::new(EventBus::new());
        bus.subscribe(
            EventType::GreeksCalculationRequest,
            Arc::new(Responder { bus: bus.clone() }),
            "responder",
            0,
        )
        .await;

        let response = bus
            .request(
                EventType::GreeksCalculationRequest,
                EventType::GreeksCalculationResponse,
                payload! {"symbol" => "SPY"},
                "strategy",
                Duration::from_millis(500),
            )
            .await
            .expect("response should arrive");
        assert_eq!(response.event_type, EventType::GreeksCalculationResponse);
        assert_eq!(response.get_f64("answer"), Some(42.0));
    }

    #[tokio::test]
    async fn request_times_out_without_responder() {
        let bus = EventBus::new();
        let err = bus
            .request(
                EventType::GreeksCalculationRequest,
                EventType::GreeksCalculationResponse,
                Map::new(),
                "strategy",
                Duration::from_millis(50),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, EventError::RequestTimeout { .. }));
    }

    #[tokio::test]
    async fn history_is_bounded() {
        let bus = EventBus::new();
        for _ in 0..(HISTORY_LIMIT + 50) {
            bus.publish(EventType::MarketDataUpdated, Map::new(), "feed").await;
        }
        assert_eq!(bus.recent_history(usize::MAX).len(), HISTORY_LIMIT);
    }
}
