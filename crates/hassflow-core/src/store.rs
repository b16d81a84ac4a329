// ── Snapshot store ──
//
// Holds the latest and previous full snapshots. Reads are lock-free
// (`arc-swap`); the runtime's ingestion path is the only writer.

use std::sync::Arc;

use arc_swap::ArcSwapOption;
use serde_json::Value;

use crate::error::CoreError;
use crate::model::{EntityState, Snapshot};

#[derive(Debug, Default)]
pub struct SnapshotStore {
    current: ArcSwapOption<Snapshot>,
    previous: ArcSwapOption<Snapshot>,
}

impl SnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> Option<Arc<Snapshot>> {
        self.current.load_full()
    }

    pub fn previous(&self) -> Option<Arc<Snapshot>> {
        self.previous.load_full()
    }

    pub fn is_ready(&self) -> bool {
        self.current.load().is_some()
    }

    /// Current or previous snapshot, `NotReady` before the first ingestion.
    pub fn select(&self, use_previous: bool) -> Result<Arc<Snapshot>, CoreError> {
        let slot = if use_previous {
            &self.previous
        } else {
            &self.current
        };
        slot.load_full().ok_or(CoreError::NotReady)
    }

    pub fn get(&self, entity_id: &str, use_previous: bool) -> Result<EntityState, CoreError> {
        self.select(use_previous)?
            .get(entity_id)
            .cloned()
            .ok_or_else(|| CoreError::UnknownEntity {
                entity_id: entity_id.to_owned(),
            })
    }

    pub fn get_attribute(
        &self,
        entity_id: &str,
        attribute: &str,
        use_previous: bool,
    ) -> Result<Value, CoreError> {
        let snapshot = self.select(use_previous)?;
        let entity = snapshot
            .get(entity_id)
            .ok_or_else(|| CoreError::UnknownEntity {
                entity_id: entity_id.to_owned(),
            })?;
        entity
            .attribute(attribute)
            .cloned()
            .ok_or_else(|| CoreError::UnknownAttribute {
                entity_id: entity_id.to_owned(),
                attribute: attribute.to_owned(),
            })
    }

    /// Rotate `current` into `previous` and install `snapshot`.
    ///
    /// On the very first ingestion `previous` is seeded with the same
    /// snapshot. Returns `true` for that first ingestion.
    pub fn ingest(&self, snapshot: Arc<Snapshot>) -> bool {
        match self.current.swap(Some(Arc::clone(&snapshot))) {
            Some(prior) => {
                self.previous.store(Some(prior));
                false
            }
            None => {
                self.previous.store(Some(snapshot));
                true
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    fn snap(temp: &str) -> Arc<Snapshot> {
        Arc::new(Snapshot::new().with(
            EntityState::new("sensor.temp", temp).with_attribute("unit_of_measurement", "°C"),
        ))
    }

    #[test]
    fn empty_store_is_not_ready() {
        let store = SnapshotStore::new();
        assert!(!store.is_ready());
        assert!(matches!(store.get("sensor.temp", false), Err(CoreError::NotReady)));
        assert!(matches!(store.get("sensor.temp", true), Err(CoreError::NotReady)));
    }

    #[test]
    fn first_ingestion_seeds_previous() {
        let store = SnapshotStore::new();
        assert!(store.ingest(snap("20")));
        assert_eq!(store.get("sensor.temp", false).unwrap().state, "20");
        assert_eq!(store.get("sensor.temp", true).unwrap().state, "20");
    }

    #[test]
    fn later_ingestions_rotate() {
        let store = SnapshotStore::new();
        store.ingest(snap("20"));
        assert!(!store.ingest(snap("25")));
        store.ingest(snap("30"));
        assert_eq!(store.get("sensor.temp", false).unwrap().state, "30");
        assert_eq!(store.get("sensor.temp", true).unwrap().state, "25");
    }

    #[test]
    fn lookups_distinguish_missing_entity_and_attribute() {
        let store = SnapshotStore::new();
        store.ingest(snap("20"));
        assert!(matches!(
            store.get("sensor.ghost", false),
            Err(CoreError::UnknownEntity { .. })
        ));
        assert!(matches!(
            store.get_attribute("sensor.temp", "battery", false),
            Err(CoreError::UnknownAttribute { .. })
        ));
        assert_eq!(
            store.get_attribute("sensor.temp", "unit_of_measurement", false).unwrap(),
            json!("°C")
        );
    }
}
