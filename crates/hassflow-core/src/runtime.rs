// ── Entity runtime ──
//
// Owns the snapshot store, the listener tables and the connection. One
// ingestion path (the pump task, or `ingest()` for detached runtimes)
// mutates the store and then dispatches synchronously to listeners in
// registration order.

use std::any::Any;
use std::fmt;
use std::future::Future;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use futures_util::StreamExt;
use serde_json::Value;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::ConnectionConfig;
use crate::connection::{Connection, HassConnection, ServiceCall, ServiceTarget};
use crate::edge::{Edge, EdgeState};
use crate::error::CoreError;
use crate::listener::{Listener, ListenerTable, Remover};
use crate::model::{
    EntityDefinition, EntityState, ServiceDefinition, Snapshot, StateChange, StateValue,
};
use crate::store::SnapshotStore;

/// Lifecycle of a [`Runtime`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuntimeState {
    /// Waiting for the first snapshot. Queries fail with `NotReady`;
    /// registrations are queued.
    Connecting,
    Ready,
    /// Terminal. Further snapshots are ignored.
    Closed,
    /// The connection could not be established or was lost for good.
    Failed(String),
}

impl fmt::Display for RuntimeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connecting => f.write_str("connecting"),
            Self::Ready => f.write_str("ready"),
            Self::Closed => f.write_str("closed"),
            Self::Failed(reason) => write!(f, "failed: {reason}"),
        }
    }
}

enum ConnectionSlot {
    /// Connector future still running.
    Pending,
    /// Built with `Runtime::new`; snapshots arrive through `ingest()`.
    Detached,
    Open(Arc<dyn Connection>),
    Failed(CoreError),
    Closed,
}

// ── Registration gate ────────────────────────────────────────────────

type ListenerFactory = Box<dyn FnOnce(Option<&EntityState>) -> Listener + Send>;

struct PendingRegistration {
    id: u64,
    entity_id: String,
    factory: ListenerFactory,
}

/// Registrations made before the first snapshot wait here and are
/// resolved once, in order, when the gate opens.
enum Gate {
    Pending(Vec<PendingRegistration>),
    Open,
}

struct RuntimeInner {
    entities: EntityDefinition,
    services: ServiceDefinition,
    store: SnapshotStore,
    listeners: ListenerTable,
    gate: Mutex<Gate>,
    next_listener: AtomicU64,
    state: watch::Sender<RuntimeState>,
    connection: watch::Sender<ConnectionSlot>,
    cancel: CancellationToken,
}

/// Reactive view over a Home Assistant instance.
///
/// Cheap to clone; all clones share one store, one listener table and one
/// connection.
#[derive(Clone)]
pub struct Runtime {
    inner: Arc<RuntimeInner>,
}

impl Runtime {
    // ── Construction ─────────────────────────────────────────────────

    /// Detached runtime. Snapshots are supplied with [`Runtime::ingest`];
    /// `call_service` is unavailable.
    pub fn new(entities: EntityDefinition, services: ServiceDefinition) -> Self {
        Self::build(entities, services, ConnectionSlot::Detached)
    }

    /// Validate `config` and start connecting in the background.
    ///
    /// Missing URL or token fails here, before any network activity. Must
    /// be called from within a Tokio runtime.
    pub fn connect(
        config: ConnectionConfig,
        entities: EntityDefinition,
        services: ServiceDefinition,
    ) -> Result<Self, CoreError> {
        config.validate()?;
        Ok(Self::with_connector(entities, services, move |cancel| async move {
            HassConnection::connect(&config, cancel).await
        }))
    }

    /// Start a runtime over any `Connection`-producing future.
    ///
    /// The connector receives a token that is cancelled when the runtime
    /// closes or is dropped.
    pub fn with_connector<F, Fut, C>(
        entities: EntityDefinition,
        services: ServiceDefinition,
        connector: F,
    ) -> Self
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = Result<C, CoreError>> + Send + 'static,
        C: Connection + 'static,
    {
        let runtime = Self::build(entities, services, ConnectionSlot::Pending);
        let cancel = runtime.inner.cancel.clone();
        let connecting = connector(cancel.child_token());
        tokio::spawn(pump(Arc::downgrade(&runtime.inner), cancel, connecting));
        runtime
    }

    fn build(
        entities: EntityDefinition,
        services: ServiceDefinition,
        slot: ConnectionSlot,
    ) -> Self {
        let (state, _) = watch::channel(RuntimeState::Connecting);
        let (connection, _) = watch::channel(slot);
        Self {
            inner: Arc::new(RuntimeInner {
                entities,
                services,
                store: SnapshotStore::new(),
                listeners: ListenerTable::default(),
                gate: Mutex::new(Gate::Pending(Vec::new())),
                next_listener: AtomicU64::new(1),
                state,
                connection,
                cancel: CancellationToken::new(),
            }),
        }
    }

    /// Connect, wait for the first snapshot, run `f`, then close.
    ///
    /// The wait is bounded by `config.timeout`. The runtime is closed
    /// whether or not `f` succeeds.
    pub async fn oneshot<F, Fut, T>(
        config: ConnectionConfig,
        entities: EntityDefinition,
        services: ServiceDefinition,
        f: F,
    ) -> Result<T, CoreError>
    where
        F: FnOnce(Runtime) -> Fut,
        Fut: Future<Output = Result<T, CoreError>>,
    {
        let timeout = config.timeout;
        let runtime = Self::connect(config, entities, services)?;

        let ready = match tokio::time::timeout(timeout, runtime.wait_ready()).await {
            Ok(ready) => ready,
            Err(_) => Err(CoreError::Timeout {
                timeout_secs: timeout.as_secs(),
            }),
        };
        let outcome = match ready {
            Ok(()) => f(runtime.clone()).await,
            Err(e) => Err(e),
        };

        let closed = runtime.close().await;
        let value = outcome?;
        closed?;
        Ok(value)
    }

    // ── Lifecycle ────────────────────────────────────────────────────

    pub fn state(&self) -> RuntimeState {
        self.inner.state.borrow().clone()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<RuntimeState> {
        self.inner.state.subscribe()
    }

    pub fn is_ready(&self) -> bool {
        *self.inner.state.borrow() == RuntimeState::Ready
    }

    /// Resolve once the first snapshot has been ingested.
    pub async fn wait_ready(&self) -> Result<(), CoreError> {
        let mut rx = self.inner.state.subscribe();
        let state = rx
            .wait_for(|state| *state != RuntimeState::Connecting)
            .await
            .map_err(|_| CoreError::Disconnected)?
            .clone();
        match state {
            RuntimeState::Ready => Ok(()),
            RuntimeState::Failed(reason) => Err(self.inner.failure(reason)),
            RuntimeState::Closed | RuntimeState::Connecting => Err(CoreError::Disconnected),
        }
    }

    /// Close the connection. Safe to call more than once; only the first
    /// call does anything.
    pub async fn close(&self) -> Result<(), CoreError> {
        let before = self.inner.state.send_replace(RuntimeState::Closed);
        if before == RuntimeState::Closed {
            return Ok(());
        }
        info!(state = %before, "closing runtime");
        self.inner.cancel.cancel();

        let connection = {
            let mut rx = self.inner.connection.subscribe();
            let slot = rx
                .wait_for(|slot| !matches!(slot, ConnectionSlot::Pending))
                .await
                .map_err(|_| CoreError::Disconnected)?;
            match &*slot {
                ConnectionSlot::Open(connection) => Some(Arc::clone(connection)),
                _ => None,
            }
        };
        self.inner.connection.send_replace(ConnectionSlot::Closed);

        if let Some(connection) = connection {
            connection.close().await?;
        }
        Ok(())
    }

    // ── Ingestion ────────────────────────────────────────────────────

    /// Feed a full snapshot and dispatch to listeners.
    ///
    /// Not re-entrant: do not call from inside a change handler.
    pub fn ingest(&self, snapshot: Snapshot) {
        self.inner.ingest(Arc::new(snapshot));
    }

    pub fn ingest_shared(&self, snapshot: Arc<Snapshot>) {
        self.inner.ingest(snapshot);
    }

    // ── Registration ─────────────────────────────────────────────────

    /// Call `handler(new, prev)` whenever the converted state of
    /// `entity_id` changes.
    ///
    /// The baseline is the state at registration time (or at the first
    /// snapshot, if registered earlier), so a steady value never fires.
    pub fn on_state_change<H>(&self, entity_id: &str, mut handler: H) -> Remover
    where
        H: FnMut(StateValue, StateChange<StateValue>) + Send + 'static,
    {
        let value_type = self.inner.entities.state_type(entity_id);
        self.register(entity_id, move |seed| {
            let initial = seed.and_then(|s| value_type.convert(&s.entity_id, &s.state).ok());
            let mut edge = EdgeState::seeded(initial);
            move |state: &EntityState| match value_type.convert(&state.entity_id, &state.state) {
                Ok(value) => {
                    if let Some(Edge { current, previous }) = edge.observe(value) {
                        handler(current, StateChange {
                            prev_state: previous,
                        });
                    }
                }
                Err(e) => {
                    warn!(entity_id = %state.entity_id, error = %e, "skipping unconvertible state");
                }
            }
        })
    }

    /// Attribute-level variant of [`Runtime::on_state_change`]. Values are
    /// compared raw; an absent attribute reads as `null`.
    pub fn on_entity_attribute_change<H>(
        &self,
        entity_id: &str,
        attribute: &str,
        mut handler: H,
    ) -> Remover
    where
        H: FnMut(Value, StateChange<Value>) + Send + 'static,
    {
        let attribute = attribute.to_owned();
        self.register(entity_id, move |seed| {
            let mut edge = EdgeState::seeded(seed.map(|s| attribute_value(s, &attribute)));
            move |state: &EntityState| {
                if let Some(Edge { current, previous }) =
                    edge.observe(attribute_value(state, &attribute))
                {
                    handler(current, StateChange {
                        prev_state: previous,
                    });
                }
            }
        })
    }

    /// Call `handler` whenever the raw state string of `entity_id` changes,
    /// including into and out of values the declared type rejects.
    pub(crate) fn on_raw_state_change<H>(&self, entity_id: &str, mut handler: H) -> Remover
    where
        H: FnMut() + Send + 'static,
    {
        self.register(entity_id, move |seed| {
            let mut edge = EdgeState::seeded(seed.map(|s| s.state.clone()));
            move |state: &EntityState| {
                if edge.observe(state.state.clone()).is_some() {
                    handler();
                }
            }
        })
    }

    fn register<M, U>(&self, entity_id: &str, make: M) -> Remover
    where
        M: FnOnce(Option<&EntityState>) -> U + Send + 'static,
        U: FnMut(&EntityState) + Send + 'static,
    {
        let id = self.inner.next_listener.fetch_add(1, Ordering::Relaxed);
        let build = move |seed: Option<&EntityState>| Listener::new(id, make(seed));

        {
            let mut gate = self.inner.gate.lock().unwrap_or_else(PoisonError::into_inner);
            match &mut *gate {
                Gate::Pending(queue) => {
                    debug!(entity_id, listener = id, "queueing listener until first snapshot");
                    queue.push(PendingRegistration {
                        id,
                        entity_id: entity_id.to_owned(),
                        factory: Box::new(build),
                    });
                }
                Gate::Open => {
                    let current = self.inner.store.current();
                    let seed = current.as_deref().and_then(|s| s.get(entity_id));
                    self.inner.listeners.attach(entity_id, Arc::new(build(seed)));
                }
            }
        }

        let weak = Arc::downgrade(&self.inner);
        let entity_id = entity_id.to_owned();
        Remover::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.detach(&entity_id, id);
            }
        })
    }

    /// Handle that does not keep the runtime alive. Used by listeners
    /// that need to query the runtime they are registered on.
    pub(crate) fn downgrade(&self) -> WeakRuntime {
        WeakRuntime {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Number of attached listeners (queued ones excluded).
    pub fn listener_count(&self) -> usize {
        self.inner.listeners.len()
    }

    // ── Queries ──────────────────────────────────────────────────────

    /// Converted state of `entity_id` from the current (or previous)
    /// snapshot.
    pub fn get_entity_state(
        &self,
        entity_id: &str,
        use_previous: bool,
    ) -> Result<StateValue, CoreError> {
        let entity = self.inner.store.get(entity_id, use_previous)?;
        self.inner.entities.convert(entity_id, &entity.state)
    }

    /// Raw attribute value. Missing attributes are `UnknownAttribute`.
    pub fn get_entity_attribute_state(
        &self,
        entity_id: &str,
        attribute: &str,
        use_previous: bool,
    ) -> Result<Value, CoreError> {
        self.inner
            .store
            .get_attribute(entity_id, attribute, use_previous)
    }

    /// Full unconverted record.
    pub fn entity(&self, entity_id: &str, use_previous: bool) -> Result<EntityState, CoreError> {
        self.inner.store.get(entity_id, use_previous)
    }

    pub fn snapshot(&self, use_previous: bool) -> Result<Arc<Snapshot>, CoreError> {
        self.inner.store.select(use_previous)
    }

    pub fn entities(&self) -> &EntityDefinition {
        &self.inner.entities
    }

    pub fn services(&self) -> &ServiceDefinition {
        &self.inner.services
    }

    // ── Services ─────────────────────────────────────────────────────

    /// Invoke `"domain.service"`. Waits for the connection if it is still
    /// being established. The payload is forwarded unchecked.
    pub async fn call_service(
        &self,
        action_id: &str,
        data: Option<Value>,
        target: Option<ServiceTarget>,
    ) -> Result<Value, CoreError> {
        let call = ServiceCall::parse(action_id, data, target)?;
        let connection = self.connection().await?;
        debug!(action = %call.action_id(), "calling service");
        connection.call_service(call).await
    }

    async fn connection(&self) -> Result<Arc<dyn Connection>, CoreError> {
        let mut rx = self.inner.connection.subscribe();
        let slot = rx
            .wait_for(|slot| !matches!(slot, ConnectionSlot::Pending))
            .await
            .map_err(|_| CoreError::Disconnected)?;
        match &*slot {
            ConnectionSlot::Open(connection) => Ok(Arc::clone(connection)),
            ConnectionSlot::Failed(err) => Err(err.clone()),
            ConnectionSlot::Detached => Err(CoreError::Config {
                message: "runtime has no connection; it was created without one".into(),
            }),
            ConnectionSlot::Pending | ConnectionSlot::Closed => Err(CoreError::Disconnected),
        }
    }
}

#[derive(Clone)]
pub(crate) struct WeakRuntime {
    inner: Weak<RuntimeInner>,
}

impl WeakRuntime {
    pub(crate) fn upgrade(&self) -> Option<Runtime> {
        self.inner.upgrade().map(|inner| Runtime { inner })
    }
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("state", &*self.inner.state.borrow())
            .field("entities", &self.inner.entities.len())
            .field("listeners", &self.inner.listeners.len())
            .finish_non_exhaustive()
    }
}

// ── Inner ────────────────────────────────────────────────────────────

impl RuntimeInner {
    fn ingest(&self, snapshot: Arc<Snapshot>) {
        if *self.state.borrow() == RuntimeState::Closed {
            debug!("runtime closed, dropping snapshot");
            return;
        }

        {
            let mut gate = self.gate.lock().unwrap_or_else(PoisonError::into_inner);
            if self.store.ingest(Arc::clone(&snapshot)) {
                self.open_gate(&mut gate, &snapshot);
            }
        }

        self.dispatch(&snapshot);
    }

    fn open_gate(&self, gate: &mut Gate, snapshot: &Snapshot) {
        let Gate::Pending(queue) = std::mem::replace(gate, Gate::Open) else {
            return;
        };
        let queued = queue.len();
        for registration in queue {
            let seed = snapshot.get(&registration.entity_id);
            let listener = (registration.factory)(seed);
            self.listeners
                .attach(&registration.entity_id, Arc::new(listener));
        }
        self.state.send_if_modified(|state| {
            if *state == RuntimeState::Connecting {
                *state = RuntimeState::Ready;
                true
            } else {
                false
            }
        });
        info!(
            entities = snapshot.len(),
            listeners = queued,
            "first snapshot received, runtime ready"
        );
    }

    /// Entities in snapshot order, listeners in registration order. A
    /// panicking handler is logged and skipped.
    fn dispatch(&self, snapshot: &Snapshot) {
        for (entity_id, state) in snapshot.iter() {
            for listener in self.listeners.listeners(entity_id) {
                let outcome = catch_unwind(AssertUnwindSafe(|| listener.dispatch(state)));
                if let Err(panic) = outcome {
                    let fault = CoreError::HandlerFault {
                        entity_id: entity_id.to_owned(),
                        message: panic_message(panic.as_ref()),
                    };
                    error!(
                        entity_id,
                        listener = listener.id(),
                        error = %fault,
                        "change handler failed"
                    );
                }
            }
        }
    }

    fn detach(&self, entity_id: &str, listener_id: u64) {
        {
            let mut gate = self.gate.lock().unwrap_or_else(PoisonError::into_inner);
            if let Gate::Pending(queue) = &mut *gate {
                queue.retain(|registration| registration.id != listener_id);
            }
        }
        self.listeners.detach(entity_id, listener_id);
        debug!(entity_id, listener = listener_id, "listener removed");
    }

    fn fail(&self, err: CoreError, connect_failed: bool) {
        let reason = err.to_string();
        if connect_failed {
            self.connection.send_replace(ConnectionSlot::Failed(err));
        }
        self.state.send_if_modified(|state| {
            if *state == RuntimeState::Closed {
                false
            } else {
                *state = RuntimeState::Failed(reason);
                true
            }
        });
    }

    /// Typed error behind a `Failed` state.
    fn failure(&self, reason: String) -> CoreError {
        match &*self.connection.borrow() {
            ConnectionSlot::Failed(err) => err.clone(),
            _ => CoreError::ConnectionFailed {
                url: String::new(),
                reason,
            },
        }
    }
}

impl Drop for RuntimeInner {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn attribute_value(state: &EntityState, attribute: &str) -> Value {
    state.attribute(attribute).cloned().unwrap_or(Value::Null)
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}

// ── Pump ─────────────────────────────────────────────────────────────

/// Await the connector, subscribe, and ingest snapshots until the feed
/// ends or the runtime is cancelled. Holds only a weak reference so a
/// dropped runtime winds the task down.
async fn pump<Fut, C>(weak: Weak<RuntimeInner>, cancel: CancellationToken, connecting: Fut)
where
    Fut: Future<Output = Result<C, CoreError>> + Send,
    C: Connection + 'static,
{
    let result = tokio::select! {
        biased;
        () = cancel.cancelled() => None,
        result = connecting => Some(result),
    };

    let connection: Arc<dyn Connection> = {
        let Some(inner) = weak.upgrade() else {
            return;
        };
        match result {
            None => {
                inner.connection.send_replace(ConnectionSlot::Closed);
                return;
            }
            Some(Err(e)) => {
                warn!(error = %e, "connection failed");
                inner.fail(e, true);
                return;
            }
            Some(Ok(connection)) => {
                let connection: Arc<dyn Connection> = Arc::new(connection);
                inner
                    .connection
                    .send_replace(ConnectionSlot::Open(Arc::clone(&connection)));
                info!("connected to Home Assistant");
                connection
            }
        }
    };

    let feed = tokio::select! {
        biased;
        () = cancel.cancelled() => return,
        feed = connection.subscribe_entities() => feed,
    };
    let mut feed = match feed {
        Ok(feed) => feed,
        Err(e) => {
            warn!(error = %e, "entity subscription failed");
            if let Some(inner) = weak.upgrade() {
                inner.fail(e, false);
            }
            return;
        }
    };

    loop {
        let next = tokio::select! {
            biased;
            () = cancel.cancelled() => return,
            next = feed.next() => next,
        };
        let Some(snapshot) = next else { break };
        let Some(inner) = weak.upgrade() else {
            return;
        };
        inner.ingest(snapshot);
    }

    if !cancel.is_cancelled() {
        warn!("entity feed ended");
        if let Some(inner) = weak.upgrade() {
            inner.fail(CoreError::Disconnected, false);
        }
    }
}
