// ── Entity-state domain model ──
//
// Definitions (declared types), raw snapshots as the runtime stores them,
// and the converted values handed to application callbacks.

pub mod definition;
pub mod snapshot;
pub mod value;

// ── Re-exports ──────────────────────────────────────────────────────

pub use definition::{EntityDefinition, EntitySpec, ServiceDefinition, ServiceSpec, ValueType};
pub use snapshot::{EntityState, Snapshot};
pub use value::{PredicateValue, StateChange, StateValue};
