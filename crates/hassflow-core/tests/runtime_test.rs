#![allow(clippy::unwrap_used)]
// Runtime lifecycle and dispatch tests against an in-memory `Connection`.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_core::future::BoxFuture;
use futures_util::{FutureExt, StreamExt};
use pretty_assertions::assert_eq;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use url::Url;

use hassflow_core::{
    Connection, ConnectionConfig, CoreError, EntityDefinition, EntityState, Runtime,
    RuntimeState, ServiceCall, ServiceDefinition, ServiceTarget, Snapshot, SnapshotFeed,
    StateValue, ValueType,
};

// ── Mock connection ─────────────────────────────────────────────────

struct MockConnection {
    feed: Mutex<Option<SnapshotFeed>>,
    calls: Arc<Mutex<Vec<ServiceCall>>>,
    closed: Arc<AtomicUsize>,
}

impl Connection for MockConnection {
    fn subscribe_entities(&self) -> BoxFuture<'_, Result<SnapshotFeed, CoreError>> {
        let feed = self.feed.lock().unwrap().take();
        async move { feed.ok_or(CoreError::Disconnected) }.boxed()
    }

    fn call_service(&self, call: ServiceCall) -> BoxFuture<'_, Result<Value, CoreError>> {
        self.calls.lock().unwrap().push(call);
        async { Ok(json!({ "context": { "id": "01HX" } })) }.boxed()
    }

    fn close(&self) -> BoxFuture<'_, Result<(), CoreError>> {
        self.closed.fetch_add(1, Ordering::SeqCst);
        async { Ok(()) }.boxed()
    }
}

struct Harness {
    runtime: Runtime,
    tx: mpsc::UnboundedSender<Arc<Snapshot>>,
    calls: Arc<Mutex<Vec<ServiceCall>>>,
    closed: Arc<AtomicUsize>,
}

impl Harness {
    fn new(entities: EntityDefinition) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let calls = Arc::new(Mutex::new(Vec::new()));
        let closed = Arc::new(AtomicUsize::new(0));
        let connection = MockConnection {
            feed: Mutex::new(Some(UnboundedReceiverStream::new(rx).boxed())),
            calls: Arc::clone(&calls),
            closed: Arc::clone(&closed),
        };
        let runtime = Runtime::with_connector(entities, ServiceDefinition::new(), move |_| {
            async move { Ok(connection) }
        });
        Self {
            runtime,
            tx,
            calls,
            closed,
        }
    }

    /// Push a snapshot and wait until the pump has ingested and
    /// dispatched it.
    async fn push(&self, snapshot: Snapshot) {
        let snapshot = Arc::new(snapshot);
        self.tx.send(Arc::clone(&snapshot)).unwrap();
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if self
                    .runtime
                    .snapshot(false)
                    .is_ok_and(|current| Arc::ptr_eq(&current, &snapshot))
                {
                    return;
                }
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
    }
}

fn definitions() -> EntityDefinition {
    EntityDefinition::new()
        .with_entity("sensor.temp", ValueType::Number)
        .with_entity("light.kitchen", ValueType::String)
        .with_attribute("light.kitchen", "brightness", ValueType::Number)
}

fn temp(state: &str) -> Snapshot {
    Snapshot::new().with(EntityState::new("sensor.temp", state))
}

type Recorded<T> = Arc<Mutex<Vec<(T, T)>>>;

fn record_states(runtime: &Runtime, entity_id: &str) -> Recorded<StateValue> {
    let seen: Recorded<StateValue> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let _remover = runtime.on_state_change(entity_id, move |value, change| {
        sink.lock().unwrap().push((value, change.prev_state));
    });
    seen
}

// ── Lifecycle ───────────────────────────────────────────────────────

#[tokio::test]
async fn becomes_ready_on_first_snapshot() {
    let h = Harness::new(definitions());
    assert_eq!(h.runtime.state(), RuntimeState::Connecting);
    assert!(matches!(
        h.runtime.get_entity_state("sensor.temp", false),
        Err(CoreError::NotReady)
    ));

    h.push(temp("20")).await;
    h.runtime.wait_ready().await.unwrap();
    assert_eq!(h.runtime.state(), RuntimeState::Ready);
    assert_eq!(
        h.runtime.get_entity_state("sensor.temp", false).unwrap(),
        StateValue::Number(20.0)
    );
}

#[tokio::test]
async fn connect_rejects_missing_token_before_connecting() {
    let config = ConnectionConfig::new(
        Url::parse("http://homeassistant.local:8123").unwrap(),
        String::new().into(),
    );
    let err = Runtime::connect(config, definitions(), ServiceDefinition::new()).unwrap_err();
    assert!(matches!(err, CoreError::ConfigMissing { field } if field == "token"));
}

#[tokio::test]
async fn failed_connector_surfaces_from_wait_ready_and_call_service() {
    let runtime = Runtime::with_connector(definitions(), ServiceDefinition::new(), |_| async {
        Err::<MockConnection, _>(CoreError::AuthenticationFailed {
            message: "Invalid access token or password".into(),
        })
    });

    let err = runtime.wait_ready().await.unwrap_err();
    assert!(matches!(err, CoreError::AuthenticationFailed { .. }));
    assert!(matches!(runtime.state(), RuntimeState::Failed(_)));

    let err = runtime
        .call_service("light.turn_on", None, None)
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::AuthenticationFailed { .. }));
}

#[tokio::test]
async fn close_closes_the_connection_once() {
    let h = Harness::new(definitions());
    h.push(temp("20")).await;

    h.runtime.close().await.unwrap();
    h.runtime.close().await.unwrap();
    assert_eq!(h.closed.load(Ordering::SeqCst), 1);
    assert_eq!(h.runtime.state(), RuntimeState::Closed);
}

#[tokio::test]
async fn feed_ending_marks_runtime_failed() {
    let h = Harness::new(definitions());
    h.push(temp("20")).await;
    let mut states = h.runtime.subscribe_state();
    drop(h.tx);

    tokio::time::timeout(
        Duration::from_secs(5),
        states.wait_for(|s| matches!(s, RuntimeState::Failed(_))),
    )
    .await
    .unwrap()
    .unwrap();
}

// ── State listeners ─────────────────────────────────────────────────

#[tokio::test]
async fn state_change_fires_with_previous_value() {
    let h = Harness::new(definitions());
    h.push(temp("20")).await;
    let seen = record_states(&h.runtime, "sensor.temp");

    h.push(temp("25")).await;
    assert_eq!(
        *seen.lock().unwrap(),
        vec![(StateValue::Number(25.0), StateValue::Number(20.0))]
    );

    // Same value again: no edge.
    h.push(temp("25")).await;
    assert_eq!(seen.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn identical_snapshot_after_registration_fires_nothing() {
    let h = Harness::new(definitions());
    h.push(temp("20")).await;
    let seen = record_states(&h.runtime, "sensor.temp");

    h.push(temp("20")).await;
    h.push(temp("20.0")).await;
    assert!(seen.lock().unwrap().is_empty());
}

#[tokio::test]
async fn registrations_before_ready_are_seeded_from_first_snapshot() {
    let h = Harness::new(definitions());
    let seen = record_states(&h.runtime, "sensor.temp");

    h.push(temp("20")).await;
    assert!(seen.lock().unwrap().is_empty());

    h.push(temp("21")).await;
    assert_eq!(
        *seen.lock().unwrap(),
        vec![(StateValue::Number(21.0), StateValue::Number(20.0))]
    );
}

#[tokio::test]
async fn listeners_on_one_entity_fire_in_registration_order() {
    let h = Harness::new(definitions());
    h.push(temp("20")).await;

    let order = Arc::new(Mutex::new(Vec::new()));
    let mut removers = Vec::new();
    for tag in ["first", "second", "third"] {
        let order = Arc::clone(&order);
        removers.push(h.runtime.on_state_change("sensor.temp", move |_, _| {
            order.lock().unwrap().push(tag);
        }));
    }

    h.push(temp("30")).await;
    assert_eq!(*order.lock().unwrap(), vec!["first", "second", "third"]);
}

#[tokio::test]
async fn remover_detaches_only_its_own_listener() {
    let h = Harness::new(definitions());
    h.push(temp("20")).await;

    let kept = record_states(&h.runtime, "sensor.temp");
    let removed = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&removed);
    let remover = h.runtime.on_state_change("sensor.temp", move |_, _| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    remover.remove();
    remover.remove();
    h.push(temp("21")).await;

    assert_eq!(removed.load(Ordering::SeqCst), 0);
    assert_eq!(kept.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn previous_snapshot_is_readable_inside_handlers() {
    let h = Harness::new(definitions());
    h.push(temp("20")).await;

    let observed = Arc::new(Mutex::new(None));
    let sink = Arc::clone(&observed);
    let reader = h.runtime.clone();
    let _remover = h.runtime.on_state_change("sensor.temp", move |_, _| {
        *sink.lock().unwrap() = Some((
            reader.get_entity_state("sensor.temp", false).unwrap(),
            reader.get_entity_state("sensor.temp", true).unwrap(),
        ));
    });

    h.push(temp("22")).await;
    assert_eq!(
        *observed.lock().unwrap(),
        Some((StateValue::Number(22.0), StateValue::Number(20.0)))
    );
}

#[tokio::test]
async fn unconvertible_state_is_skipped_not_fatal() {
    let h = Harness::new(definitions());
    h.push(temp("20")).await;
    let seen = record_states(&h.runtime, "sensor.temp");

    h.push(temp("unavailable")).await;
    h.push(temp("23")).await;
    assert_eq!(
        *seen.lock().unwrap(),
        vec![(StateValue::Number(23.0), StateValue::Number(20.0))]
    );
    assert!(matches!(
        h.runtime.get_entity_state("sensor.temp", true),
        Err(CoreError::Conversion { .. })
    ));
}

// ── Attribute listeners ─────────────────────────────────────────────

fn light(state: &str, brightness: u64, color: &str) -> Snapshot {
    Snapshot::new().with(
        EntityState::new("light.kitchen", state)
            .with_attribute("brightness", brightness)
            .with_attribute("color_name", color),
    )
}

#[tokio::test]
async fn attribute_listeners_are_isolated() {
    let h = Harness::new(definitions());
    h.push(light("on", 80, "red")).await;

    let brightness: Recorded<Value> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&brightness);
    let _b = h
        .runtime
        .on_entity_attribute_change("light.kitchen", "brightness", move |value, change| {
            sink.lock().unwrap().push((value, change.prev_state));
        });
    let colour_hits = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&colour_hits);
    let _c = h
        .runtime
        .on_entity_attribute_change("light.kitchen", "color_name", move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

    h.push(light("on", 120, "red")).await;
    assert_eq!(*brightness.lock().unwrap(), vec![(json!(120), json!(80))]);
    assert_eq!(colour_hits.load(Ordering::SeqCst), 0);

    // A state change alone touches neither attribute listener.
    h.push(light("off", 120, "red")).await;
    assert_eq!(brightness.lock().unwrap().len(), 1);
    assert_eq!(colour_hits.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn disappearing_attribute_reads_as_null() {
    let h = Harness::new(definitions());
    h.push(light("on", 80, "red")).await;

    let seen: Recorded<Value> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let _r = h
        .runtime
        .on_entity_attribute_change("light.kitchen", "brightness", move |value, change| {
            sink.lock().unwrap().push((value, change.prev_state));
        });

    h.push(Snapshot::new().with(EntityState::new("light.kitchen", "off")))
        .await;
    assert_eq!(*seen.lock().unwrap(), vec![(Value::Null, json!(80))]);
    assert!(matches!(
        h.runtime
            .get_entity_attribute_state("light.kitchen", "brightness", false),
        Err(CoreError::UnknownAttribute { .. })
    ));
}

// ── Services ────────────────────────────────────────────────────────

#[tokio::test]
async fn call_service_forwards_domain_service_and_payload() {
    let h = Harness::new(definitions());
    h.push(temp("20")).await;

    let result = h
        .runtime
        .call_service(
            "light.turn_on",
            Some(json!({ "brightness": 80 })),
            Some(ServiceTarget::entity("light.kitchen")),
        )
        .await
        .unwrap();
    assert_eq!(result["context"]["id"], "01HX");

    let calls = h.calls.lock().unwrap();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].domain, "light");
    assert_eq!(calls[0].service, "turn_on");
    assert_eq!(calls[0].data, Some(json!({ "brightness": 80 })));
    assert_eq!(
        calls[0].target.as_ref().unwrap().entity_id,
        vec!["light.kitchen".to_string()]
    );
}

#[tokio::test]
async fn malformed_action_id_never_reaches_the_connection() {
    let h = Harness::new(definitions());
    let err = h
        .runtime
        .call_service("lightturn_on", None, None)
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::MalformedActionId { action_id } if action_id == "lightturn_on"));
    assert!(h.calls.lock().unwrap().is_empty());
}

#[tokio::test]
async fn detached_runtime_cannot_call_services() {
    let runtime = Runtime::new(definitions(), ServiceDefinition::new());
    runtime.ingest(temp("20"));
    let err = runtime
        .call_service("light.turn_on", None, None)
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::Config { .. }));
}
