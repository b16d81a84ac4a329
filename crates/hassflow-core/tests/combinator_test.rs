#![allow(clippy::unwrap_used)]
// Multi-predicate combinator and `with_predicate` over a detached runtime.

use std::sync::{Arc, Mutex};

use pretty_assertions::assert_eq;
use serde_json::{Value, json};

use hassflow_core::{
    EntityDefinition, EntityState, PredicateValue, Runtime, ServiceDefinition, Snapshot,
    StateValue, ValueType, multi_predicate, with_predicate,
};

fn runtime() -> Runtime {
    Runtime::new(
        EntityDefinition::new()
            .with_entity("sensor.a", ValueType::Number)
            .with_entity("sensor.b", ValueType::Number)
            .with_entity("light.porch", ValueType::String),
        ServiceDefinition::new(),
    )
}

fn ab(a: &str, b: &str) -> Snapshot {
    Snapshot::new()
        .with(EntityState::new("sensor.a", a))
        .with(EntityState::new("sensor.b", b))
}

type Calls = Arc<Mutex<Vec<(&'static str, Vec<PredicateValue>)>>>;

fn recorder(calls: &Calls, tag: &'static str) -> impl FnMut(&[PredicateValue]) + Send + 'static {
    let calls = Arc::clone(calls);
    move |values: &[PredicateValue]| calls.lock().unwrap().push((tag, values.to_vec()))
}

fn numbers(a: f64, b: f64) -> Vec<PredicateValue> {
    vec![
        PredicateValue::State(StateValue::Number(a)),
        PredicateValue::State(StateValue::Number(b)),
    ]
}

fn above(limit: f64) -> impl Fn(&StateValue) -> bool + Send + Sync + 'static {
    move |v| v.as_f64().is_some_and(|n| n > limit)
}

fn below(limit: f64) -> impl Fn(&StateValue) -> bool + Send + Sync + 'static {
    move |v| v.as_f64().is_some_and(|n| n < limit)
}

#[test]
fn on_fires_when_last_clause_becomes_true_and_off_when_any_drops() {
    let rt = runtime();
    rt.ingest(ab("0", "5"));

    let calls: Calls = Arc::new(Mutex::new(Vec::new()));
    let _remover = multi_predicate(&rt)
        .with("sensor.a", above(5.0))
        .with("sensor.b", below(3.0))
        .then_else(recorder(&calls, "on"), recorder(&calls, "off"));

    rt.ingest(ab("10", "5"));
    assert!(calls.lock().unwrap().is_empty());

    rt.ingest(ab("10", "1"));
    assert_eq!(*calls.lock().unwrap(), vec![("on", numbers(10.0, 1.0))]);

    rt.ingest(ab("2", "1"));
    assert_eq!(
        *calls.lock().unwrap(),
        vec![("on", numbers(10.0, 1.0)), ("off", numbers(2.0, 1.0))]
    );

    // Still false: nothing more.
    rt.ingest(ab("1", "0"));
    assert_eq!(calls.lock().unwrap().len(), 2);
}

#[test]
fn simultaneous_changes_fire_on_once() {
    let rt = runtime();
    rt.ingest(ab("0", "5"));

    let calls: Calls = Arc::new(Mutex::new(Vec::new()));
    let _remover = multi_predicate(&rt)
        .with("sensor.a", above(5.0))
        .with("sensor.b", below(3.0))
        .then(recorder(&calls, "on"));

    rt.ingest(ab("10", "1"));
    assert_eq!(*calls.lock().unwrap(), vec![("on", numbers(10.0, 1.0))]);
}

#[test]
fn already_satisfied_combinator_waits_for_a_fresh_transition() {
    let rt = runtime();
    rt.ingest(ab("10", "1"));

    let calls: Calls = Arc::new(Mutex::new(Vec::new()));
    let _remover = multi_predicate(&rt)
        .with("sensor.a", above(5.0))
        .with("sensor.b", below(3.0))
        .then_else(recorder(&calls, "on"), recorder(&calls, "off"));

    // Moves, but stays satisfied.
    rt.ingest(ab("11", "1"));
    assert!(calls.lock().unwrap().is_empty());

    rt.ingest(ab("2", "1"));
    rt.ingest(ab("12", "1"));
    let tags: Vec<&str> = calls.lock().unwrap().iter().map(|(tag, _)| *tag).collect();
    assert_eq!(tags, vec!["off", "on"]);
}

#[test]
fn builder_values_are_independent_templates() {
    let rt = runtime();
    rt.ingest(ab("0", "5"));

    let base = multi_predicate(&rt).with("sensor.a", above(5.0));
    let narrow = base.with("sensor.b", below(3.0));
    assert_eq!(base.len(), 1);
    assert_eq!(narrow.len(), 2);

    let calls: Calls = Arc::new(Mutex::new(Vec::new()));
    let _wide = base.then(recorder(&calls, "wide"));
    let _narrow = narrow.then(recorder(&calls, "narrow"));

    rt.ingest(ab("10", "5"));
    let tags: Vec<&str> = calls.lock().unwrap().iter().map(|(tag, _)| *tag).collect();
    assert_eq!(tags, vec!["wide"]);
}

#[test]
fn attribute_clauses_use_raw_values() {
    let rt = runtime();
    let porch = |state: &str, brightness: Value| {
        Snapshot::new()
            .with(EntityState::new("light.porch", state).with_attribute("brightness", brightness))
            .with(EntityState::new("sensor.a", "0"))
    };
    rt.ingest(porch("off", json!(0)));

    let calls: Calls = Arc::new(Mutex::new(Vec::new()));
    let _remover = multi_predicate(&rt)
        .with("light.porch", |s| *s == "on")
        .with_attr("light.porch", "brightness", |b| {
            b.as_u64().is_some_and(|b| b > 100)
        })
        .then(recorder(&calls, "bright"));

    rt.ingest(porch("on", json!(50)));
    assert!(calls.lock().unwrap().is_empty());

    rt.ingest(porch("on", json!(200)));
    assert_eq!(
        *calls.lock().unwrap(),
        vec![(
            "bright",
            vec![
                PredicateValue::State(StateValue::from("on")),
                PredicateValue::Attribute(json!(200)),
            ]
        )]
    );
}

#[test]
fn unconvertible_clause_counts_as_unsatisfied() {
    let rt = runtime();
    rt.ingest(ab("0", "5"));

    let calls: Calls = Arc::new(Mutex::new(Vec::new()));
    let _remover = multi_predicate(&rt)
        .with("sensor.a", above(5.0))
        .with("sensor.b", below(3.0))
        .then_else(recorder(&calls, "on"), recorder(&calls, "off"));

    rt.ingest(ab("10", "1"));
    rt.ingest(ab("unavailable", "1"));
    rt.ingest(ab("unavailable", "5"));

    let unavailable = vec![
        PredicateValue::State(StateValue::Text("unavailable".into())),
        PredicateValue::State(StateValue::Number(1.0)),
    ];
    assert_eq!(
        *calls.lock().unwrap(),
        vec![("on", numbers(10.0, 1.0)), ("off", unavailable)]
    );

    // Recovery is a fresh transition.
    rt.ingest(ab("10", "1"));
    let tags: Vec<&str> = calls.lock().unwrap().iter().map(|(tag, _)| *tag).collect();
    assert_eq!(tags, vec!["on", "off", "on"]);
}

#[test]
fn removing_the_aggregate_detaches_every_clause() {
    let rt = runtime();
    rt.ingest(ab("0", "5"));

    let calls: Calls = Arc::new(Mutex::new(Vec::new()));
    let remover = multi_predicate(&rt)
        .with("sensor.a", above(5.0))
        .with("sensor.b", below(3.0))
        .then(recorder(&calls, "on"));
    assert_eq!(rt.listener_count(), 2);

    remover.remove();
    assert_eq!(rt.listener_count(), 0);

    rt.ingest(ab("10", "1"));
    assert!(calls.lock().unwrap().is_empty());
}

#[test]
fn with_predicate_wraps_state_handlers() {
    let rt = runtime();
    rt.ingest(ab("20", "0"));

    let warm = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&warm);
    let _remover = rt.on_state_change(
        "sensor.a",
        with_predicate(above(25.0), move |value: StateValue, _| {
            sink.lock().unwrap().push(value);
        }),
    );

    for a in ["24", "26", "27", "22", "30"] {
        rt.ingest(ab(a, "0"));
    }
    assert_eq!(
        *warm.lock().unwrap(),
        vec![StateValue::Number(26.0), StateValue::Number(30.0)]
    );
}
