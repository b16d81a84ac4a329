// hassflow-core: Reactive entity-state runtime between hassflow-api and automations.

pub mod combinator;
pub mod config;
pub mod connection;
pub mod edge;
pub mod error;
pub mod model;
pub mod predicate;
pub mod runtime;
pub mod store;

mod listener;

// ── Primary re-exports ──────────────────────────────────────────────
pub use combinator::{MultiPredicate, multi_predicate};
pub use config::{ConnectionConfig, TlsVerification};
pub use connection::{Connection, HassConnection, ServiceCall, ServiceTarget, SnapshotFeed};
pub use edge::{ChangeEdgeDetector, Edge};
pub use error::CoreError;
pub use listener::Remover;
pub use predicate::with_predicate;
pub use runtime::{Runtime, RuntimeState};
pub use store::SnapshotStore;
pub use hassflow_api::ReconnectConfig;

// Re-export model types at the crate root for ergonomics.
pub use model::{
    EntityDefinition, EntitySpec, EntityState, PredicateValue, ServiceDefinition, ServiceSpec,
    Snapshot, StateChange, StateValue, ValueType,
};
