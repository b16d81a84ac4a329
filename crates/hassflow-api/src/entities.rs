// ── Entity state model + compressed subscription format ──
//
// `subscribe_entities` pushes compressed diffs instead of full states.
// `EntityCache` folds them into an ordered map so the session can publish
// a complete snapshot after every event.

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Full entity map, in the order the server first reported each entity.
pub type EntityMap = IndexMap<String, HassEntity>;

/// One entity as Home Assistant describes it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HassEntity {
    pub entity_id: String,
    /// Raw state string; numeric sensors still report e.g. `"21.5"`.
    pub state: String,
    #[serde(default)]
    pub attributes: Map<String, Value>,
    pub last_changed: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
    #[serde(default)]
    pub context: Option<Context>,
}

/// Origin of the most recent state write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Context {
    pub id: String,
    #[serde(default)]
    pub parent_id: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
}

// ── Compressed wire format ───────────────────────────────────────────

/// One `subscribe_entities` event payload.
///
/// `a` carries full (compressed) states for new entities, `c` carries
/// per-entity diffs, `r` lists removed entity ids.
#[derive(Debug, Default, Deserialize)]
pub struct EntityEvent {
    #[serde(default, rename = "a")]
    pub added: IndexMap<String, CompressedState>,
    #[serde(default, rename = "c")]
    pub changed: IndexMap<String, CompressedDiff>,
    #[serde(default, rename = "r")]
    pub removed: Vec<String>,
}

/// The server sends a bare context id unless parent/user are set.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum CompressedContext {
    Id(String),
    Full(Context),
}

impl From<CompressedContext> for Context {
    fn from(ctx: CompressedContext) -> Self {
        match ctx {
            CompressedContext::Id(id) => Self {
                id,
                parent_id: None,
                user_id: None,
            },
            CompressedContext::Full(ctx) => ctx,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct CompressedState {
    #[serde(rename = "s")]
    pub state: String,
    #[serde(default, rename = "a")]
    pub attributes: Map<String, Value>,
    #[serde(default, rename = "c")]
    pub context: Option<CompressedContext>,
    /// Seconds since the UNIX epoch.
    #[serde(rename = "lc")]
    pub last_changed: f64,
    /// Omitted when equal to `lc`.
    #[serde(default, rename = "lu")]
    pub last_updated: Option<f64>,
}

#[derive(Debug, Default, Deserialize)]
pub struct CompressedDiff {
    #[serde(default, rename = "+")]
    pub additions: Option<PartialState>,
    #[serde(default, rename = "-")]
    pub removals: Option<Removals>,
}

#[derive(Debug, Default, Deserialize)]
pub struct PartialState {
    #[serde(default, rename = "s")]
    pub state: Option<String>,
    #[serde(default, rename = "a")]
    pub attributes: Option<Map<String, Value>>,
    #[serde(default, rename = "c")]
    pub context: Option<CompressedContext>,
    #[serde(default, rename = "lc")]
    pub last_changed: Option<f64>,
    #[serde(default, rename = "lu")]
    pub last_updated: Option<f64>,
}

#[derive(Debug, Default, Deserialize)]
pub struct Removals {
    /// Attribute names to delete.
    #[serde(default, rename = "a")]
    pub attributes: Vec<String>,
}

// ── EntityCache ──────────────────────────────────────────────────────

/// Folds compressed events into a full, ordered entity map.
#[derive(Debug, Default)]
pub struct EntityCache {
    entities: EntityMap,
}

impl EntityCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one event: additions first, then removals, then diffs.
    pub fn apply(&mut self, event: EntityEvent) {
        for (entity_id, compressed) in event.added {
            let last_changed = timestamp(compressed.last_changed);
            let entity = HassEntity {
                entity_id: entity_id.clone(),
                state: compressed.state,
                attributes: compressed.attributes,
                last_changed,
                last_updated: compressed.last_updated.map_or(last_changed, timestamp),
                context: compressed.context.map(Context::from),
            };
            self.entities.insert(entity_id, entity);
        }

        for entity_id in &event.removed {
            self.entities.shift_remove(entity_id);
        }

        for (entity_id, diff) in event.changed {
            let Some(entity) = self.entities.get_mut(&entity_id) else {
                tracing::warn!(entity_id = %entity_id, "diff for unknown entity, skipping");
                continue;
            };
            apply_diff(entity, diff);
        }
    }

    /// Clone the current map. Cheap enough per event for the entity
    /// counts a single instance carries.
    pub fn snapshot(&self) -> EntityMap {
        self.entities.clone()
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    /// Drop everything (a new subscription starts with a full `a` payload).
    pub fn clear(&mut self) {
        self.entities.clear();
    }
}

fn apply_diff(entity: &mut HassEntity, diff: CompressedDiff) {
    if let Some(add) = diff.additions {
        if let Some(state) = add.state {
            entity.state = state;
        }
        if let Some(ctx) = add.context {
            entity.context = Some(ctx.into());
        }
        // A new `lc` moves both timestamps; `lu` alone only the update time.
        if let Some(lc) = add.last_changed {
            let ts = timestamp(lc);
            entity.last_changed = ts;
            entity.last_updated = ts;
        } else if let Some(lu) = add.last_updated {
            entity.last_updated = timestamp(lu);
        }
        if let Some(attrs) = add.attributes {
            entity.attributes.extend(attrs);
        }
    }

    if let Some(removals) = diff.removals {
        for name in &removals.attributes {
            entity.attributes.remove(name);
        }
    }
}

/// Convert fractional UNIX seconds to a UTC timestamp (microsecond precision).
#[allow(clippy::cast_possible_truncation, clippy::as_conversions)]
fn timestamp(secs: f64) -> DateTime<Utc> {
    let micros = (secs * 1_000_000.0).round() as i64;
    DateTime::from_timestamp_micros(micros).unwrap_or_default()
}

// ── Tests ────────────────────────────────────────────────────────────
