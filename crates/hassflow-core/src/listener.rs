// ── Listener registrations ──
//
// Per-entity ordered listener lists plus the `Remover` token handed back
// to application code.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use dashmap::DashMap;

use crate::model::EntityState;

type UpdateFn = Box<dyn FnMut(&EntityState) + Send>;

/// One attached callback. Owns its edge memory inside `update`.
pub(crate) struct Listener {
    id: u64,
    update: Mutex<UpdateFn>,
}

impl Listener {
    pub(crate) fn new(id: u64, update: impl FnMut(&EntityState) + Send + 'static) -> Self {
        Self {
            id,
            update: Mutex::new(Box::new(update)),
        }
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    /// A panic in a previous call poisons the mutex; the edge memory is
    /// still consistent, so keep going.
    pub(crate) fn dispatch(&self, state: &EntityState) {
        let mut update = self.update.lock().unwrap_or_else(PoisonError::into_inner);
        (*update)(state);
    }
}

/// entity id → listeners in registration order.
#[derive(Default)]
pub(crate) struct ListenerTable {
    by_entity: DashMap<String, Vec<Arc<Listener>>>,
}

impl ListenerTable {
    pub(crate) fn attach(&self, entity_id: &str, listener: Arc<Listener>) {
        self.by_entity
            .entry(entity_id.to_owned())
            .or_default()
            .push(listener);
    }

    pub(crate) fn detach(&self, entity_id: &str, listener_id: u64) {
        let now_empty = self.by_entity.get_mut(entity_id).is_some_and(|mut list| {
            list.retain(|l| l.id() != listener_id);
            list.is_empty()
        });
        if now_empty {
            self.by_entity.remove_if(entity_id, |_, list| list.is_empty());
        }
    }

    /// Copy of the current list, so dispatch holds no map lock while
    /// callbacks run (and removals take effect next cycle).
    pub(crate) fn listeners(&self, entity_id: &str) -> Vec<Arc<Listener>> {
        self.by_entity
            .get(entity_id)
            .map(|list| list.value().clone())
            .unwrap_or_default()
    }

    pub(crate) fn len(&self) -> usize {
        self.by_entity.iter().map(|entry| entry.value().len()).sum()
    }
}

// ── Remover ──────────────────────────────────────────────────────────

type DetachFn = Box<dyn FnOnce() + Send>;

/// Token returned by every registration. Removing is idempotent and only
/// ever detaches the registration(s) this token was created for.
///
/// Clones share state: removing through any clone removes for all.
#[derive(Clone)]
pub struct Remover {
    inner: Arc<RemoverInner>,
}

struct RemoverInner {
    removed: AtomicBool,
    detach: Mutex<Option<DetachFn>>,
}

impl Remover {
    pub(crate) fn new(detach: impl FnOnce() + Send + 'static) -> Self {
        Self {
            inner: Arc::new(RemoverInner {
                removed: AtomicBool::new(false),
                detach: Mutex::new(Some(Box::new(detach))),
            }),
        }
    }

    /// One token that removes every given registration.
    pub fn combine(removers: impl IntoIterator<Item = Remover>) -> Self {
        let removers: Vec<Remover> = removers.into_iter().collect();
        Self::new(move || {
            for remover in &removers {
                remover.remove();
            }
        })
    }

    pub fn remove(&self) {
        if self.inner.removed.swap(true, Ordering::AcqRel) {
            return;
        }
        let detach = self
            .inner
            .detach
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(detach) = detach {
            detach();
        }
    }

    pub fn is_removed(&self) -> bool {
        self.inner.removed.load(Ordering::Acquire)
    }
}

impl fmt::Debug for Remover {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Remover")
            .field("removed", &self.is_removed())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counting_listener(id: u64, hits: &Arc<AtomicUsize>) -> Arc<Listener> {
        let hits = Arc::clone(hits);
        Arc::new(Listener::new(id, move |_| {
            hits.fetch_add(1, Ordering::SeqCst);
        }))
    }

    #[test]
    fn remover_runs_detach_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let remover = Remover::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let clone = remover.clone();
        remover.remove();
        remover.remove();
        clone.remove();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(clone.is_removed());
    }

    #[test]
    fn combined_remover_removes_all() {
        let calls = Arc::new(AtomicUsize::new(0));
        let parts: Vec<Remover> = (0..3)
            .map(|_| {
                let counter = Arc::clone(&calls);
                Remover::new(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                })
            })
            .collect();
        let first = parts[0].clone();

        Remover::combine(parts).remove();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(first.is_removed());
    }

    #[test]
    fn table_detaches_only_the_given_listener() {
        let table = ListenerTable::default();
        let hits = Arc::new(AtomicUsize::new(0));
        table.attach("sensor.temp", counting_listener(1, &hits));
        table.attach("sensor.temp", counting_listener(2, &hits));

        table.detach("sensor.temp", 1);
        let remaining = table.listeners("sensor.temp");
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].id(), 2);

        table.detach("sensor.temp", 2);
        assert_eq!(table.len(), 0);
    }

    #[test]
    fn dispatch_survives_poisoned_listener() {
        let listener = Arc::new(Listener::new(7, |state: &EntityState| {
            assert_ne!(state.state, "boom", "handler failure");
        }));
        let boom = EntityState::new("sensor.x", "boom");
        let ok = EntityState::new("sensor.x", "fine");

        let caught = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            listener.dispatch(&boom);
        }));
        assert!(caught.is_err());
        listener.dispatch(&ok);
    }
}
