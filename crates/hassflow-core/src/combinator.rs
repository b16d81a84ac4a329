// ── Multi-predicate combinator ──
//
// An edge-triggered AND over several entity/attribute predicates. The
// builder is persistent: `with`/`with_attr` return a new value, so a
// partially built combinator can be reused as a template.

use std::sync::{Arc, Mutex, PoisonError};

use serde_json::Value;
use tracing::warn;

use crate::error::CoreError;
use crate::listener::Remover;
use crate::model::{PredicateValue, StateValue};
use crate::runtime::{Runtime, WeakRuntime};

type StatePredicate = Arc<dyn Fn(&StateValue) -> bool + Send + Sync>;
type AttributePredicate = Arc<dyn Fn(&Value) -> bool + Send + Sync>;
type Handler = Box<dyn FnMut(&[PredicateValue]) + Send>;

#[derive(Clone)]
enum ClauseSource {
    State(StatePredicate),
    Attribute {
        name: String,
        predicate: AttributePredicate,
    },
}

#[derive(Clone)]
struct Clause {
    entity_id: String,
    source: ClauseSource,
}

impl Clause {
    /// Current (or previous-tick) value and whether it satisfies the
    /// predicate.
    fn check(
        &self,
        runtime: &Runtime,
        use_previous: bool,
    ) -> Result<(PredicateValue, bool), CoreError> {
        match &self.source {
            ClauseSource::State(predicate) => {
                let value = runtime.get_entity_state(&self.entity_id, use_previous)?;
                let satisfied = predicate(&value);
                Ok((PredicateValue::State(value), satisfied))
            }
            ClauseSource::Attribute { name, predicate } => {
                let value = match runtime.get_entity_attribute_state(
                    &self.entity_id,
                    name,
                    use_previous,
                ) {
                    Err(CoreError::UnknownAttribute { .. }) => Value::Null,
                    other => other?,
                };
                let satisfied = predicate(&value);
                Ok((PredicateValue::Attribute(value), satisfied))
            }
        }
    }

    /// Stand-in value handed to `on`/`off` when `check` failed.
    fn placeholder(&self, err: &CoreError) -> PredicateValue {
        match (&self.source, err) {
            (ClauseSource::State(_), CoreError::Conversion { raw, .. }) => {
                PredicateValue::State(StateValue::Text(raw.clone()))
            }
            (ClauseSource::State(_), _) => PredicateValue::State(StateValue::Text(String::new())),
            (ClauseSource::Attribute { .. }, _) => PredicateValue::Attribute(Value::Null),
        }
    }

    /// State clauses wake on raw changes so a value turning unconvertible
    /// still re-evaluates the aggregate.
    fn register(
        &self,
        runtime: &Runtime,
        mut on_change: impl FnMut() + Send + 'static,
    ) -> Remover {
        match &self.source {
            ClauseSource::State(_) => runtime.on_raw_state_change(&self.entity_id, on_change),
            ClauseSource::Attribute { name, .. } => {
                runtime.on_entity_attribute_change(&self.entity_id, name, move |_, _| on_change())
            }
        }
    }
}

/// Builder for an AND-condition over several entities.
///
/// ```no_run
/// # use hassflow_core::{Runtime, multi_predicate};
/// # fn demo(runtime: &Runtime) {
/// let remover = multi_predicate(runtime)
///     .with("binary_sensor.motion", |s| *s == "on")
///     .with("sensor.lux", |s| s.as_f64().is_some_and(|lux| lux < 40.0))
///     .then_else(
///         |_| println!("dark and occupied"),
///         |_| println!("condition cleared"),
///     );
/// # let _ = remover;
/// # }
/// ```
#[derive(Clone)]
pub struct MultiPredicate {
    runtime: Runtime,
    clauses: Vec<Clause>,
}

impl MultiPredicate {
    pub fn new(runtime: &Runtime) -> Self {
        Self {
            runtime: runtime.clone(),
            clauses: Vec::new(),
        }
    }

    /// Append a predicate over an entity's converted state.
    #[must_use]
    pub fn with<P>(&self, entity_id: &str, predicate: P) -> Self
    where
        P: Fn(&StateValue) -> bool + Send + Sync + 'static,
    {
        self.push(Clause {
            entity_id: entity_id.to_owned(),
            source: ClauseSource::State(Arc::new(predicate)),
        })
    }

    /// Append a predicate over a raw attribute value (`null` when absent).
    #[must_use]
    pub fn with_attr<P>(&self, entity_id: &str, attribute: &str, predicate: P) -> Self
    where
        P: Fn(&Value) -> bool + Send + Sync + 'static,
    {
        self.push(Clause {
            entity_id: entity_id.to_owned(),
            source: ClauseSource::Attribute {
                name: attribute.to_owned(),
                predicate: Arc::new(predicate),
            },
        })
    }

    fn push(&self, clause: Clause) -> Self {
        let mut clauses = self.clauses.clone();
        clauses.push(clause);
        Self {
            runtime: self.runtime.clone(),
            clauses,
        }
    }

    pub fn len(&self) -> usize {
        self.clauses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clauses.is_empty()
    }

    /// Register `on`, called with every clause's value (in declaration
    /// order) each time the combined condition becomes true.
    pub fn then<F>(&self, on: F) -> Remover
    where
        F: FnMut(&[PredicateValue]) + Send + 'static,
    {
        self.install(Box::new(on), None)
    }

    /// Like [`MultiPredicate::then`], plus `off` whenever the combined
    /// condition stops holding.
    pub fn then_else<F, G>(&self, on: F, off: G) -> Remover
    where
        F: FnMut(&[PredicateValue]) + Send + 'static,
        G: FnMut(&[PredicateValue]) + Send + 'static,
    {
        self.install(Box::new(on), Some(Box::new(off)))
    }

    fn install(&self, on: Handler, off: Option<Handler>) -> Remover {
        let shared = Arc::new(Shared {
            runtime: self.runtime.downgrade(),
            clauses: self.clauses.clone(),
            aggregate: Mutex::new(Aggregate {
                satisfied: None,
                on,
                off,
            }),
        });

        let removers: Vec<Remover> = self
            .clauses
            .iter()
            .map(|clause| {
                let shared = Arc::clone(&shared);
                clause.register(&self.runtime, move || shared.evaluate())
            })
            .collect();
        Remover::combine(removers)
    }
}

/// Start a combinator over `runtime`.
pub fn multi_predicate(runtime: &Runtime) -> MultiPredicate {
    MultiPredicate::new(runtime)
}

// ── Evaluation ───────────────────────────────────────────────────────

struct Aggregate {
    /// `None` until the first evaluation.
    satisfied: Option<bool>,
    on: Handler,
    off: Option<Handler>,
}

struct Shared {
    runtime: WeakRuntime,
    clauses: Vec<Clause>,
    aggregate: Mutex<Aggregate>,
}

impl Shared {
    /// Re-check every clause after any one of them changed.
    fn evaluate(&self) {
        let Some(runtime) = self.runtime.upgrade() else {
            return;
        };
        let mut guard = self
            .aggregate
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let aggregate = &mut *guard;

        let was = *aggregate.satisfied.get_or_insert_with(|| {
            self.clauses
                .iter()
                .all(|clause| clause.check(&runtime, true).is_ok_and(|(_, ok)| ok))
        });

        let mut values = Vec::with_capacity(self.clauses.len());
        let mut all = true;
        for clause in &self.clauses {
            match clause.check(&runtime, false) {
                Ok((value, satisfied)) => {
                    all &= satisfied;
                    values.push(value);
                }
                Err(e) => {
                    warn!(
                        entity_id = %clause.entity_id,
                        error = %e,
                        "clause unreadable, treating as unsatisfied"
                    );
                    all = false;
                    values.push(clause.placeholder(&e));
                }
            }
        }

        if all && !was {
            aggregate.satisfied = Some(true);
            (aggregate.on)(&values);
        } else if !all && was {
            aggregate.satisfied = Some(false);
            if let Some(off) = aggregate.off.as_mut() {
                off(&values);
            }
        }
    }
}
