// ── Core error types ──
//
// User-facing errors from hassflow-core. Consumers never see WebSocket
// frames or JSON parse failures directly; the `From<hassflow_api::Error>`
// impl translates transport-layer errors into runtime-level variants.

use thiserror::Error;

/// Unified error type for the core crate.
#[derive(Debug, Clone, Error)]
pub enum CoreError {
    // ── Configuration errors ─────────────────────────────────────────
    /// A required connection setting is absent. Raised before any
    /// connection attempt.
    #[error("Missing configuration: {field} is not set")]
    ConfigMissing { field: String },

    #[error("Configuration error: {message}")]
    Config { message: String },

    // ── Query errors ─────────────────────────────────────────────────
    /// No snapshot has been ingested yet.
    #[error("No state available yet")]
    NotReady,

    #[error("Entity {entity_id} not found")]
    UnknownEntity { entity_id: String },

    #[error("Entity {entity_id} has no attribute {attribute}")]
    UnknownAttribute { entity_id: String, attribute: String },

    /// A raw state did not match the declared type (e.g. `"unavailable"`
    /// for a numeric sensor).
    #[error("Cannot convert state {raw:?} of {entity_id} to a number")]
    Conversion { entity_id: String, raw: String },

    // ── Dispatch errors ──────────────────────────────────────────────
    /// A change handler panicked. Logged by the runtime, never returned.
    #[error("Handler for {entity_id} panicked: {message}")]
    HandlerFault { entity_id: String, message: String },

    // ── Service errors ───────────────────────────────────────────────
    #[error("Malformed service id {action_id:?} (expected \"domain.service\")")]
    MalformedActionId { action_id: String },

    #[error("Service call failed ({code}): {message}")]
    ServiceFailed { code: String, message: String },

    // ── Connection errors ────────────────────────────────────────────
    #[error("Cannot connect to Home Assistant at {url}: {reason}")]
    ConnectionFailed { url: String, reason: String },

    #[error("Authentication failed: {message}")]
    AuthenticationFailed { message: String },

    #[error("Home Assistant disconnected")]
    Disconnected,

    #[error("Timed out after {timeout_secs}s")]
    Timeout { timeout_secs: u64 },

    /// Non-success status from the REST API.
    #[error("API error (HTTP {status}): {message}")]
    Api { status: u16, message: String },

    // ── Internal errors ──────────────────────────────────────────────
    #[error("Internal error: {0}")]
    Internal(String),
}

impl CoreError {
    /// Errors that a retry with the same configuration cannot fix.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::ConfigMissing { .. } | Self::Config { .. } | Self::AuthenticationFailed { .. }
        )
    }
}

// ── Conversion from transport-layer errors ───────────────────────────

impl From<hassflow_api::Error> for CoreError {
    fn from(err: hassflow_api::Error) -> Self {
        match err {
            hassflow_api::Error::Authentication { message } => {
                CoreError::AuthenticationFailed { message }
            }
            hassflow_api::Error::InvalidToken => CoreError::AuthenticationFailed {
                message: "Invalid access token".into(),
            },
            hassflow_api::Error::Transport(ref e) => {
                if e.is_timeout() {
                    CoreError::Timeout { timeout_secs: 0 }
                } else {
                    CoreError::ConnectionFailed {
                        url: e
                            .url()
                            .map_or_else(|| "<unknown>".into(), ToString::to_string),
                        reason: e.to_string(),
                    }
                }
            }
            hassflow_api::Error::InvalidUrl(e) => CoreError::Config {
                message: format!("Invalid URL: {e}"),
            },
            hassflow_api::Error::Timeout { timeout_secs } => CoreError::Timeout { timeout_secs },
            hassflow_api::Error::Tls(msg) => CoreError::ConnectionFailed {
                url: String::new(),
                reason: format!("TLS error: {msg}"),
            },
            hassflow_api::Error::Api { status, message } => CoreError::Api { status, message },
            hassflow_api::Error::WebSocketConnect(reason) => CoreError::ConnectionFailed {
                url: String::new(),
                reason: format!("WebSocket connection failed: {reason}"),
            },
            hassflow_api::Error::WebSocketClosed { code, reason } => CoreError::ConnectionFailed {
                url: String::new(),
                reason: format!("WebSocket closed (code {code}): {reason}"),
            },
            hassflow_api::Error::Disconnected => CoreError::Disconnected,
            hassflow_api::Error::Command { code, message } => {
                CoreError::ServiceFailed { code, message }
            }
            hassflow_api::Error::Protocol(msg) => {
                CoreError::Internal(format!("Protocol error: {msg}"))
            }
            hassflow_api::Error::Deserialization { message, body: _ } => {
                CoreError::Internal(format!("Deserialization error: {message}"))
            }
        }
    }
}
