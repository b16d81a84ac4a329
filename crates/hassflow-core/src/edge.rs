// ── Change edge detection ──
//
// One detector per tracked value. Turns a stream of raw observations into
// discrete "changed" events: a transition is reported only when the new
// value differs from the last one seen.

/// A detected transition.
#[derive(Debug, Clone, PartialEq)]
pub struct Edge<T> {
    pub current: T,
    pub previous: T,
}

/// Reports `(new, last_seen)` exactly once per inequality.
#[derive(Debug, Clone)]
pub struct ChangeEdgeDetector<T> {
    last_seen: T,
}

impl<T: PartialEq + Clone> ChangeEdgeDetector<T> {
    pub fn new(initial: T) -> Self {
        Self { last_seen: initial }
    }

    /// Feed the next observation. `last_seen` is updated either way.
    pub fn feed(&mut self, value: T) -> Option<Edge<T>> {
        if value == self.last_seen {
            self.last_seen = value;
            return None;
        }
        let previous = std::mem::replace(&mut self.last_seen, value.clone());
        Some(Edge {
            current: value,
            previous,
        })
    }

    pub fn last_seen(&self) -> &T {
        &self.last_seen
    }
}

/// Per-listener edge memory, created lazily.
///
/// A listener registered before its entity exists (or whose seed value
/// could not be converted) starts uninitialised; the first observation
/// becomes the baseline without firing.
#[derive(Debug, Clone)]
pub(crate) struct EdgeState<T> {
    detector: Option<ChangeEdgeDetector<T>>,
}

impl<T: PartialEq + Clone> EdgeState<T> {
    pub(crate) fn seeded(initial: Option<T>) -> Self {
        Self {
            detector: initial.map(ChangeEdgeDetector::new),
        }
    }

    pub(crate) fn observe(&mut self, value: T) -> Option<Edge<T>> {
        match &mut self.detector {
            Some(detector) => detector.feed(value),
            None => {
                self.detector = Some(ChangeEdgeDetector::new(value));
                None
            }
        }
    }
}
