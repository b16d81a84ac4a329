//! CLI error types with miette diagnostics.
//!
//! Maps `CoreError` and `ConfigError` into user-facing errors with
//! actionable help text.

use miette::Diagnostic;
use thiserror::Error;

use hassflow_config::ConfigError;
use hassflow_core::CoreError;

/// Process exit codes.
pub mod exit_code {
    pub const GENERAL: i32 = 1;
    pub const USAGE: i32 = 2;
    pub const AUTH: i32 = 3;
    pub const NOT_FOUND: i32 = 4;
    pub const CONNECTION: i32 = 7;
    pub const TIMEOUT: i32 = 8;
}

#[derive(Debug, Error, Diagnostic)]
pub enum CliError {
    // ── Connection ───────────────────────────────────────────────────
    #[error("Could not connect to Home Assistant at {url}")]
    #[diagnostic(
        code(hassflow::connection_failed),
        help(
            "Check that Home Assistant is running and reachable.\n\
             URL: {url}\n\
             Try: hassflow check --url {url}"
        )
    )]
    ConnectionFailed {
        url: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("Home Assistant closed the connection")]
    #[diagnostic(
        code(hassflow::disconnected),
        help("The instance restarted or dropped the session. Run the command again.")
    )]
    Disconnected,

    // ── Authentication ───────────────────────────────────────────────
    #[error("Authentication failed: {message}")]
    #[diagnostic(
        code(hassflow::auth_failed),
        help(
            "Create a long-lived access token under your Home Assistant user profile\n\
             and pass it with --token or HOME_ASSISTANT_TOKEN."
        )
    )]
    AuthFailed { message: String },

    #[error("No access token configured for profile '{profile}'")]
    #[diagnostic(
        code(hassflow::no_credentials),
        help(
            "Set HOME_ASSISTANT_TOKEN, pass --token, or add token_env to the profile:\n\
             hassflow config init --instance-url <URL> --token-env <VAR>"
        )
    )]
    NoCredentials { profile: String },

    // ── Entities & services ──────────────────────────────────────────
    #[error("{resource_type} '{identifier}' not found")]
    #[diagnostic(
        code(hassflow::not_found),
        help("Run: hassflow {list_command} to see what is available")
    )]
    NotFound {
        resource_type: String,
        identifier: String,
        list_command: String,
    },

    #[error("State '{raw}' of {entity_id} is not a number")]
    #[diagnostic(
        code(hassflow::conversion),
        help("The definitions file declares {entity_id} as a number. Fix its state_type.")
    )]
    Conversion { entity_id: String, raw: String },

    #[error("Service call failed ({code}): {message}")]
    #[diagnostic(code(hassflow::service_failed))]
    ServiceFailed { code: String, message: String },

    #[error("API error (HTTP {status}): {message}")]
    #[diagnostic(code(hassflow::api_error))]
    ApiError { status: u16, message: String },

    // ── Validation ───────────────────────────────────────────────────
    #[error("Invalid value for {field}: {reason}")]
    #[diagnostic(code(hassflow::validation))]
    Validation { field: String, reason: String },

    // ── Configuration ────────────────────────────────────────────────
    #[error("Profile '{name}' not found in configuration")]
    #[diagnostic(
        code(hassflow::profile_not_found),
        help(
            "Available profiles: {available}\n\
             Create one with: hassflow config init --name {name} --instance-url <URL>"
        )
    )]
    ProfileNotFound { name: String, available: String },

    #[error("No Home Assistant URL configured for profile '{profile}'")]
    #[diagnostic(
        code(hassflow::no_url),
        help(
            "Pass --url, set HOME_ASSISTANT_URL, or create a profile:\n\
             hassflow config init --instance-url http://homeassistant.local:8123\n\
             Config file: {path}"
        )
    )]
    NoUrl { profile: String, path: String },

    #[error(transparent)]
    #[diagnostic(code(hassflow::config))]
    Config(Box<ConfigError>),

    // ── Timeout ──────────────────────────────────────────────────────
    #[error("Timed out after {seconds}s")]
    #[diagnostic(
        code(hassflow::timeout),
        help("Increase timeout with --timeout or check that the instance is responsive.")
    )]
    Timeout { seconds: u64 },

    // ── Internal ─────────────────────────────────────────────────────
    #[error("{0}")]
    #[diagnostic(code(hassflow::internal))]
    Internal(String),

    // ── IO / Serialization ───────────────────────────────────────────
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("Invalid JSON payload: {0}")]
    #[diagnostic(
        code(hassflow::json),
        help("Pass service data as a JSON object, e.g. --data '{{\"brightness\": 80}}'")
    )]
    Json(#[from] serde_json::Error),
}

impl CliError {
    /// Map this error to an exit code for process termination.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::ConnectionFailed { .. } | Self::Disconnected => exit_code::CONNECTION,
            Self::AuthFailed { .. } | Self::NoCredentials { .. } => exit_code::AUTH,
            Self::NotFound { .. } => exit_code::NOT_FOUND,
            Self::Timeout { .. } => exit_code::TIMEOUT,
            Self::Validation { .. }
            | Self::Json(_)
            | Self::ProfileNotFound { .. }
            | Self::NoUrl { .. } => exit_code::USAGE,
            _ => exit_code::GENERAL,
        }
    }
}

// ── CoreError → CliError mapping ─────────────────────────────────────

impl From<CoreError> for CliError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::ConfigMissing { field } => CliError::Validation {
                field,
                reason: "required but not set".into(),
            },

            CoreError::Config { message } => CliError::Validation {
                field: "connection".into(),
                reason: message,
            },

            CoreError::NotReady => CliError::Disconnected,

            CoreError::UnknownEntity { entity_id } => CliError::NotFound {
                resource_type: "entity".into(),
                identifier: entity_id,
                list_command: "states".into(),
            },

            CoreError::UnknownAttribute {
                entity_id,
                attribute,
            } => CliError::NotFound {
                resource_type: "attribute".into(),
                list_command: format!("get {entity_id}"),
                identifier: attribute,
            },

            CoreError::Conversion { entity_id, raw } => CliError::Conversion { entity_id, raw },

            CoreError::MalformedActionId { action_id } => CliError::Validation {
                field: "service".into(),
                reason: format!("expected \"domain.service\", got \"{action_id}\""),
            },

            CoreError::ServiceFailed { code, message } => CliError::ServiceFailed { code, message },

            CoreError::ConnectionFailed { url, reason } => CliError::ConnectionFailed {
                url,
                source: reason.into(),
            },

            CoreError::AuthenticationFailed { message } => CliError::AuthFailed { message },

            CoreError::Disconnected => CliError::Disconnected,

            CoreError::Timeout { timeout_secs } => CliError::Timeout {
                seconds: timeout_secs,
            },

            CoreError::Api { status, message } => CliError::ApiError { status, message },

            CoreError::HandlerFault { entity_id, message } => {
                CliError::Internal(format!("handler for {entity_id} failed: {message}"))
            }

            CoreError::Internal(message) => CliError::Internal(message),
        }
    }
}

// ── ConfigError → CliError mapping ───────────────────────────────────

impl From<ConfigError> for CliError {
    fn from(err: ConfigError) -> Self {
        match err {
            ConfigError::Validation { field, reason } => CliError::Validation { field, reason },
            ConfigError::NoCredentials { profile } => CliError::NoCredentials { profile },
            ConfigError::Missing { profile, .. } => CliError::NoUrl {
                profile,
                path: hassflow_config::config_path().display().to_string(),
            },
            other => CliError::Config(Box::new(other)),
        }
    }
}
