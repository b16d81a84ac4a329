//! Home Assistant WebSocket session with auto-reconnect.
//!
//! [`HassSocket::connect`] performs the `auth_required` → `auth` →
//! `auth_ok` handshake, then hands the stream to a background task that
//! multiplexes commands (matched to results by id) and folds
//! `subscribe_entities` events into full entity snapshots. Dropped
//! connections are re-established with exponential backoff + jitter, and
//! an active subscription is re-issued on the fresh session.
//!
//! # Example
//!
//! ```rust,ignore
//! use hassflow_api::websocket::{HassSocket, SocketConfig};
//! use tokio_util::sync::CancellationToken;
//!
//! let url = "ws://homeassistant.local:8123/api/websocket".parse()?;
//! let config = SocketConfig::new(url, token);
//! let socket = HassSocket::connect(config, CancellationToken::new()).await?;
//!
//! let mut feed = socket.subscribe_entities().await?;
//! while let Some(snapshot) = feed.next().await {
//!     println!("{} entities", snapshot.len());
//! }
//! ```

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream, StreamExt};
use futures_util::SinkExt;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::{Map, Value, json};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::entities::{EntityCache, EntityEvent, EntityMap, HassEntity};
use crate::error::Error;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;

// ── Broadcast channel capacity ───────────────────────────────────────

// Every message is a full snapshot, so a lagging receiver only needs the
// newest one; a small buffer is enough.
const SNAPSHOT_CHANNEL_CAPACITY: usize = 64;

// ── ReconnectConfig ──────────────────────────────────────────────────

/// Exponential backoff configuration for WebSocket reconnection.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Delay before the first reconnection attempt. Default: 1s.
    pub initial_delay: Duration,

    /// Upper bound on backoff delay. Default: 30s.
    pub max_delay: Duration,

    /// Maximum reconnection attempts before giving up.
    /// `None` means retry forever.
    pub max_retries: Option<u32>,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            max_retries: None,
        }
    }
}

// ── SocketConfig ─────────────────────────────────────────────────────

/// Everything needed to open (and reopen) a session.
#[derive(Debug, Clone)]
pub struct SocketConfig {
    /// Full WebSocket endpoint, e.g. `ws://host:8123/api/websocket`.
    pub url: Url,
    /// Long-lived access token.
    pub token: SecretString,
    /// Bound on the handshake and on each command round-trip.
    pub timeout: Duration,
    pub reconnect: ReconnectConfig,
}

impl SocketConfig {
    pub fn new(url: Url, token: SecretString) -> Self {
        Self {
            url,
            token,
            timeout: Duration::from_secs(30),
            reconnect: ReconnectConfig::default(),
        }
    }
}

// ── HassSocket ───────────────────────────────────────────────────────

/// Handle to a running Home Assistant session.
///
/// Cheap to clone. The background task stops when [`close`](Self::close)
/// is called, when the cancellation token passed to `connect` fires, when
/// reconnection gives up, or when every handle has been dropped.
#[derive(Clone)]
pub struct HassSocket {
    request_tx: mpsc::UnboundedSender<Command>,
    shared: Arc<Shared>,
    ha_version: Arc<str>,
    timeout: Duration,
    cancel: CancellationToken,
}

/// Snapshot publication state, shared between the task and handles.
struct Shared {
    snapshot_tx: broadcast::Sender<Arc<EntityMap>>,
    latest: Mutex<Option<Arc<EntityMap>>>,
}

enum Command {
    Call {
        payload: Map<String, Value>,
        response_tx: oneshot::Sender<Result<Value, Error>>,
    },
    SubscribeEntities {
        response_tx: oneshot::Sender<Result<(), Error>>,
    },
}

impl HassSocket {
    /// Connect, authenticate, and spawn the session task.
    ///
    /// The first connection is made inline so that a bad URL or a rejected
    /// token surfaces here instead of inside the reconnect loop.
    pub async fn connect(config: SocketConfig, cancel: CancellationToken) -> Result<Self, Error> {
        let (ws, ha_version) = open_session(&config).await?;
        tracing::info!(url = %config.url, ha_version = %ha_version, "Home Assistant session authenticated");

        let (request_tx, request_rx) = mpsc::unbounded_channel();
        let (snapshot_tx, _) = broadcast::channel(SNAPSHOT_CHANNEL_CAPACITY);
        let shared = Arc::new(Shared {
            snapshot_tx,
            latest: Mutex::new(None),
        });

        let cancel = cancel.child_token();
        let timeout = config.timeout;
        let task = SessionTask {
            config,
            shared: Arc::clone(&shared),
            request_rx,
            cancel: cancel.clone(),
            cache: EntityCache::new(),
            subscribed: false,
            next_id: 1,
        };
        tokio::spawn(task.run(ws));

        Ok(Self {
            request_tx,
            shared,
            ha_version: ha_version.into(),
            timeout,
            cancel,
        })
    }

    /// Version string reported in `auth_ok`.
    pub fn ha_version(&self) -> &str {
        &self.ha_version
    }

    /// Send a raw command (everything except `id`) and await its result.
    pub async fn request(&self, command: Map<String, Value>) -> Result<Value, Error> {
        let (response_tx, response_rx) = oneshot::channel();
        self.request_tx
            .send(Command::Call {
                payload: command,
                response_tx,
            })
            .map_err(|_| Error::Disconnected)?;

        match tokio::time::timeout(self.timeout, response_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(Error::Disconnected),
            Err(_) => Err(Error::Timeout {
                timeout_secs: self.timeout.as_secs(),
            }),
        }
    }

    /// `call_service` command.
    pub async fn call_service(
        &self,
        domain: &str,
        service: &str,
        service_data: Option<Value>,
        target: Option<Value>,
    ) -> Result<Value, Error> {
        let mut call = command("call_service");
        call.insert("domain".into(), json!(domain));
        call.insert("service".into(), json!(service));
        if let Some(data) = service_data {
            call.insert("service_data".into(), data);
        }
        if let Some(target) = target {
            call.insert("target".into(), target);
        }

        tracing::debug!(domain, service, "calling service");
        self.request(call).await
    }

    /// `get_states`: every entity in the REST shape.
    pub async fn get_states(&self) -> Result<Vec<HassEntity>, Error> {
        let value = self.request(command("get_states")).await?;
        serde_json::from_value(value.clone()).map_err(|e| Error::Deserialization {
            message: e.to_string(),
            body: value.to_string(),
        })
    }

    /// `get_services`: domain → service → description.
    pub async fn get_services(&self) -> Result<Value, Error> {
        self.request(command("get_services")).await
    }

    /// Start (or join) the entity subscription.
    ///
    /// The returned feed yields the latest known snapshot first, if one
    /// exists, and then every snapshot published afterwards.
    pub async fn subscribe_entities(&self) -> Result<EntityFeed, Error> {
        let (response_tx, response_rx) = oneshot::channel();
        self.request_tx
            .send(Command::SubscribeEntities { response_tx })
            .map_err(|_| Error::Disconnected)?;
        response_rx.await.map_err(|_| Error::Disconnected)??;

        // Read `latest` and subscribe under the same lock as `publish`, so
        // no snapshot falls between the two.
        let latest = self
            .shared
            .latest
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let rx = self.shared.snapshot_tx.subscribe();

        Ok(EntityFeed {
            initial: latest.clone(),
            rx,
            cancel: self.cancel.clone(),
        })
    }

    /// Stop the session task and send a close frame. Pending commands fail
    /// with `Disconnected`.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

fn command(kind: &str) -> Map<String, Value> {
    let mut command = Map::new();
    command.insert("type".into(), json!(kind));
    command
}

// ── EntityFeed ───────────────────────────────────────────────────────

/// Stream of full entity snapshots from one subscription.
pub struct EntityFeed {
    initial: Option<Arc<EntityMap>>,
    rx: broadcast::Receiver<Arc<EntityMap>>,
    cancel: CancellationToken,
}

impl EntityFeed {
    /// Next snapshot, or `None` once the session has shut down.
    pub async fn next(&mut self) -> Option<Arc<EntityMap>> {
        if let Some(initial) = self.initial.take() {
            return Some(initial);
        }

        loop {
            tokio::select! {
                biased;
                () = self.cancel.cancelled() => return None,
                received = self.rx.recv() => match received {
                    Ok(snapshot) => return Some(snapshot),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        // Snapshots are complete, so skipping is lossless
                        // apart from intermediate transitions.
                        tracing::warn!(skipped, "entity feed lagged, skipping to newest snapshot");
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        }
    }
}

// ── Handshake ────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum AuthMessage {
    AuthRequired {
        #[serde(default)]
        ha_version: Option<String>,
    },
    AuthOk {
        #[serde(default)]
        ha_version: Option<String>,
    },
    AuthInvalid {
        #[serde(default)]
        message: Option<String>,
    },
}

/// Connect and authenticate one session. Returns the stream and HA version.
async fn open_session(config: &SocketConfig) -> Result<(WsStream, String), Error> {
    let handshake = async {
        tracing::debug!(url = %config.url, "Connecting to WebSocket");
        let (mut ws, _response) = tokio_tungstenite::connect_async(config.url.as_str())
            .await
            .map_err(|e| Error::WebSocketConnect(e.to_string()))?;

        match read_auth(&mut ws).await? {
            AuthMessage::AuthRequired { .. } => {}
            other => {
                return Err(Error::Protocol(format!(
                    "expected auth_required, got {other:?}"
                )));
            }
        }

        let auth = json!({ "type": "auth", "access_token": config.token.expose_secret() });
        ws.send(Message::text(auth.to_string()))
            .await
            .map_err(|e| Error::WebSocketConnect(e.to_string()))?;

        match read_auth(&mut ws).await? {
            AuthMessage::AuthOk { ha_version } => Ok((ws, ha_version.unwrap_or_default())),
            AuthMessage::AuthInvalid { message } => Err(Error::Authentication {
                message: message.unwrap_or_else(|| "access token rejected".into()),
            }),
            AuthMessage::AuthRequired { .. } => {
                Err(Error::Protocol("auth_required sent twice".into()))
            }
        }
    };

    tokio::time::timeout(config.timeout, handshake)
        .await
        .map_err(|_| Error::Timeout {
            timeout_secs: config.timeout.as_secs(),
        })?
}

async fn read_auth(ws: &mut WsStream) -> Result<AuthMessage, Error> {
    loop {
        match ws.next().await {
            Some(Ok(Message::Text(text))) => {
                return serde_json::from_str(text.as_str()).map_err(|e| {
                    Error::Protocol(format!("unexpected handshake message: {e}"))
                });
            }
            Some(Ok(Message::Close(frame))) => {
                let (code, reason) = frame.map_or((1005, String::new()), |cf| {
                    (u16::from(cf.code), cf.reason.to_string())
                });
                return Err(Error::WebSocketClosed { code, reason });
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => return Err(Error::WebSocketConnect(e.to_string())),
            None => return Err(Error::Disconnected),
        }
    }
}

// ── Session messages ─────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ServerMessage {
    Result {
        id: u64,
        success: bool,
        #[serde(default)]
        result: Option<Value>,
        #[serde(default)]
        error: Option<CommandError>,
    },
    Event {
        id: u64,
        event: Value,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Deserialize)]
struct CommandError {
    code: Value,
    message: String,
}

fn command_error(error: Option<CommandError>) -> Error {
    match error {
        Some(CommandError { code, message }) => Error::Command {
            code: code.as_str().map_or_else(|| code.to_string(), String::from),
            message,
        },
        None => Error::Command {
            code: "unknown_error".into(),
            message: "command failed without an error payload".into(),
        },
    }
}

/// A command awaiting its `result` frame.
enum Pending {
    Call(oneshot::Sender<Result<Value, Error>>),
    /// `None` when the task re-subscribes on its own after a reconnect.
    Subscribe(Option<oneshot::Sender<Result<(), Error>>>),
}

impl Pending {
    fn fail(self, error: Error) {
        match self {
            Self::Call(tx) => {
                let _ = tx.send(Err(error));
            }
            Self::Subscribe(Some(tx)) => {
                let _ = tx.send(Err(error));
            }
            Self::Subscribe(None) => {}
        }
    }

    /// The caller stopped waiting (timed out or dropped the future).
    /// Subscriptions are kept: their result still records the id.
    fn is_abandoned(&self) -> bool {
        match self {
            Self::Call(tx) => tx.is_closed(),
            Self::Subscribe(_) => false,
        }
    }
}

/// Drop waiters nobody will read; a timed-out request never gets its id
/// removed by a `result` frame.
fn prune_abandoned(pending: &mut HashMap<u64, Pending>) {
    pending.retain(|_, waiter| !waiter.is_abandoned());
}

enum SessionEnd {
    Cancelled,
    Closed,
}

// ── Background session task ──────────────────────────────────────────

struct SessionTask {
    config: SocketConfig,
    shared: Arc<Shared>,
    request_rx: mpsc::UnboundedReceiver<Command>,
    cancel: CancellationToken,
    cache: EntityCache,
    /// Whether a subscription was requested; survives reconnects.
    subscribed: bool,
    next_id: u64,
}

impl SessionTask {
    /// Main loop: drive session → on drop, backoff → reconnect.
    async fn run(mut self, first: WsStream) {
        let mut stream = Some(first);
        let mut attempt: u32 = 0;

        loop {
            let ws = match stream.take() {
                Some(ws) => ws,
                None => match self.reconnect(&mut attempt).await {
                    Some(ws) => ws,
                    None => break,
                },
            };
            attempt = 0;

            match self.drive(ws).await {
                Ok(SessionEnd::Cancelled) => break,
                Ok(SessionEnd::Closed) => {
                    tracing::info!("WebSocket disconnected, reconnecting");
                }
                Err(e) => {
                    tracing::warn!(error = %e, "WebSocket error, reconnecting");
                }
            }
        }

        self.cancel.cancel();
        tracing::debug!("WebSocket session task exiting");
    }

    /// Backoff and reopen until a session is established. `None` means
    /// give up: cancelled, retry limit reached, or token rejected.
    async fn reconnect(&mut self, attempt: &mut u32) -> Option<WsStream> {
        loop {
            if let Some(max) = self.config.reconnect.max_retries {
                if *attempt >= max {
                    tracing::error!(
                        max_retries = max,
                        "WebSocket reconnection limit reached, giving up"
                    );
                    return None;
                }
            }

            let delay = calculate_backoff(*attempt, &self.config.reconnect);
            tracing::info!(
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                attempt,
                "Waiting before reconnect"
            );
            if !self.idle(delay).await {
                return None;
            }
            *attempt += 1;

            let opened = tokio::select! {
                biased;
                () = self.cancel.cancelled() => return None,
                opened = open_session(&self.config) => opened,
            };
            match opened {
                Ok((ws, ha_version)) => {
                    tracing::info!(ha_version = %ha_version, "WebSocket reconnected");
                    return Some(ws);
                }
                Err(e) if e.is_auth_error() => {
                    tracing::error!(error = %e, "access token rejected on reconnect, giving up");
                    return None;
                }
                Err(e) => {
                    tracing::warn!(error = %e, attempt, "reconnect attempt failed");
                }
            }
        }
    }

    /// Sleep for `delay` while answering commands that cannot be sent.
    /// Returns `false` if cancelled.
    async fn idle(&mut self, delay: Duration) -> bool {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);

        loop {
            tokio::select! {
                biased;
                () = self.cancel.cancelled() => return false,
                () = &mut sleep => return true,
                Some(command) = self.request_rx.recv() => match command {
                    Command::Call { response_tx, .. } => {
                        let _ = response_tx.send(Err(Error::Disconnected));
                    }
                    // Picked up by `drive` once the next session opens.
                    Command::SubscribeEntities { response_tx } => {
                        self.subscribed = true;
                        let _ = response_tx.send(Ok(()));
                    }
                },
            }
        }
    }

    /// Run one authenticated session until it drops or is cancelled.
    async fn drive(&mut self, ws: WsStream) -> Result<SessionEnd, Error> {
        let (mut write, mut read) = ws.split();
        let mut pending: HashMap<u64, Pending> = HashMap::new();

        let result = self.pump(&mut write, &mut read, &mut pending).await;
        if matches!(result, Ok(SessionEnd::Cancelled)) {
            let _ = write.send(Message::Close(None)).await;
        }

        for (_, waiter) in pending.drain() {
            waiter.fail(Error::Disconnected);
        }
        result
    }

    async fn pump(
        &mut self,
        write: &mut WsSink,
        read: &mut WsSource,
        pending: &mut HashMap<u64, Pending>,
    ) -> Result<SessionEnd, Error> {
        let mut subscription: Option<u64> = None;

        if self.subscribed {
            // The new subscription opens with a full `a` payload.
            self.cache.clear();
            let id = self.send_subscribe(write).await?;
            pending.insert(id, Pending::Subscribe(None));
        }

        loop {
            tokio::select! {
                biased;
                () = self.cancel.cancelled() => return Ok(SessionEnd::Cancelled),
                command = self.request_rx.recv() => {
                    let Some(command) = command else {
                        tracing::debug!("all socket handles dropped");
                        return Ok(SessionEnd::Cancelled);
                    };
                    self.dispatch(command, write, pending).await?;
                }
                frame = read.next() => match frame {
                    Some(Ok(Message::Text(text))) => {
                        self.handle_text(text.as_str(), pending, &mut subscription);
                    }
                    Some(Ok(Message::Close(frame))) => {
                        if let Some(ref cf) = frame {
                            tracing::info!(
                                code = %cf.code,
                                reason = %cf.reason,
                                "WebSocket close frame received"
                            );
                        }
                        return Ok(SessionEnd::Closed);
                    }
                    Some(Ok(_)) => {
                        // Ping/Pong/Binary: tungstenite answers pings itself.
                    }
                    Some(Err(e)) => return Err(Error::WebSocketConnect(e.to_string())),
                    None => {
                        tracing::info!("WebSocket stream ended");
                        return Ok(SessionEnd::Closed);
                    }
                }
            }
        }
    }

    fn allocate_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    async fn send_subscribe(&mut self, write: &mut WsSink) -> Result<u64, Error> {
        let id = self.allocate_id();
        let frame = json!({ "id": id, "type": "subscribe_entities" });
        send_json(write, &frame).await?;
        tracing::debug!(id, "subscribed to entities");
        Ok(id)
    }

    async fn dispatch(
        &mut self,
        command: Command,
        write: &mut WsSink,
        pending: &mut HashMap<u64, Pending>,
    ) -> Result<(), Error> {
        match command {
            Command::Call {
                mut payload,
                response_tx,
            } => {
                let id = self.allocate_id();
                payload.insert("id".into(), json!(id));
                prune_abandoned(pending);
                pending.insert(id, Pending::Call(response_tx));
                send_json(write, &Value::Object(payload)).await
            }
            Command::SubscribeEntities { response_tx } => {
                if self.subscribed {
                    let _ = response_tx.send(Ok(()));
                    return Ok(());
                }
                self.subscribed = true;
                let id = self.send_subscribe(write).await?;
                pending.insert(id, Pending::Subscribe(Some(response_tx)));
                Ok(())
            }
        }
    }

    fn handle_text(
        &mut self,
        text: &str,
        pending: &mut HashMap<u64, Pending>,
        subscription: &mut Option<u64>,
    ) {
        let message: ServerMessage = match serde_json::from_str(text) {
            Ok(m) => m,
            Err(e) => {
                tracing::debug!(error = %e, "Failed to parse WebSocket message");
                return;
            }
        };

        match message {
            ServerMessage::Result {
                id,
                success,
                result,
                error,
            } => match pending.remove(&id) {
                Some(Pending::Call(tx)) => {
                    let outcome = if success {
                        Ok(result.unwrap_or(Value::Null))
                    } else {
                        Err(command_error(error))
                    };
                    let _ = tx.send(outcome);
                }
                Some(Pending::Subscribe(tx)) => {
                    let outcome = if success {
                        *subscription = Some(id);
                        Ok(())
                    } else {
                        self.subscribed = false;
                        let err = command_error(error);
                        tracing::error!(error = %err, "subscribe_entities rejected");
                        Err(err)
                    };
                    if let Some(tx) = tx {
                        let _ = tx.send(outcome);
                    }
                }
                None => tracing::debug!(id, "result for unknown request id"),
            },
            ServerMessage::Event { id, event } => {
                let ours = *subscription == Some(id)
                    || matches!(pending.get(&id), Some(Pending::Subscribe(_)));
                if !ours {
                    tracing::trace!(id, "event for unknown subscription");
                    return;
                }
                match serde_json::from_value::<EntityEvent>(event) {
                    Ok(event) => {
                        self.cache.apply(event);
                        self.publish();
                    }
                    Err(e) => tracing::warn!(error = %e, "malformed entity event"),
                }
            }
            ServerMessage::Unknown => tracing::trace!("ignoring unrecognised message"),
        }
    }

    fn publish(&self) {
        let snapshot = Arc::new(self.cache.snapshot());
        let mut latest = self
            .shared
            .latest
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        *latest = Some(Arc::clone(&snapshot));
        // No receivers is fine; `latest` still seeds the next feed.
        let _ = self.shared.snapshot_tx.send(snapshot);
    }
}

async fn send_json(write: &mut WsSink, frame: &Value) -> Result<(), Error> {
    write
        .send(Message::text(frame.to_string()))
        .await
        .map_err(|e| Error::WebSocketConnect(e.to_string()))
}

// ── Backoff calculation ──────────────────────────────────────────────

/// Exponential backoff with jitter.
///
/// `delay = min(initial * 2^attempt, max) * (1 ± 0.25)`
fn calculate_backoff(attempt: u32, config: &ReconnectConfig) -> Duration {
    let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
    let base = config.initial_delay.as_secs_f64() * 2.0_f64.powi(exponent);
    let capped = base.min(config.max_delay.as_secs_f64());

    // Deterministic jitter seeded from the attempt number.
    let jitter_factor = 1.0 + 0.25 * (f64::from(attempt) * 7.3).sin();
    let with_jitter = (capped * jitter_factor).max(0.0);

    Duration::from_secs_f64(with_jitter)
}

// ── Tests ────────────────────────────────────────────────────────────
