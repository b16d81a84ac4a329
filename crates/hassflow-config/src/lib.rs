//! Shared configuration for hassflow tools.
//!
//! TOML profiles layered with environment overrides, token resolution
//! (env + plaintext), definition files, and translation to
//! `hassflow_core::ConnectionConfig`. The CLI adds flag-aware wrappers on
//! top.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use hassflow_core::{ConnectionConfig, EntityDefinition, ServiceDefinition, TlsVerification};

/// Token fallback shared with other Home Assistant tooling.
pub const TOKEN_ENV: &str = "HOME_ASSISTANT_TOKEN";
/// URL fallback shared with other Home Assistant tooling.
pub const URL_ENV: &str = "HOME_ASSISTANT_URL";

// ── Error ───────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid {field}: {reason}")]
    Validation { field: String, reason: String },

    #[error("{field} is not configured for profile '{profile}'")]
    Missing { field: String, profile: String },

    #[error("no access token configured for profile '{profile}'")]
    NoCredentials { profile: String },

    #[error("failed to read definitions from {}: {reason}", path.display())]
    Definitions { path: PathBuf, reason: String },

    #[error("failed to serialize config: {0}")]
    Serialization(#[from] toml::ser::Error),

    #[error("config loading failed: {0}")]
    Figment(Box<figment::Error>),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        Self::Figment(Box::new(err))
    }
}

// ── TOML config structs ─────────────────────────────────────────────

/// Top-level TOML configuration.
#[derive(Debug, Deserialize, Serialize)]
pub struct Config {
    /// Default profile name.
    pub default_profile: Option<String>,

    #[serde(default)]
    pub defaults: Defaults,

    /// Named instance profiles.
    #[serde(default)]
    pub profiles: BTreeMap<String, Profile>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            default_profile: Some("default".into()),
            defaults: Defaults::default(),
            profiles: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize)]
pub struct Defaults {
    #[serde(default = "default_output")]
    pub output: String,

    #[serde(default)]
    pub insecure: bool,

    #[serde(default = "default_timeout")]
    pub timeout: u64,
}

impl Default for Defaults {
    fn default() -> Self {
        Self {
            output: default_output(),
            insecure: false,
            timeout: default_timeout(),
        }
    }
}

fn default_output() -> String {
    "table".into()
}
fn default_timeout() -> u64 {
    30
}

/// A named Home Assistant instance.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Profile {
    /// Instance base URL (e.g., "http://homeassistant.local:8123").
    pub url: Option<String>,

    /// Long-lived access token (plaintext; prefer `token_env`).
    pub token: Option<String>,

    /// Environment variable name containing the token.
    pub token_env: Option<String>,

    /// Path to custom CA certificate.
    pub ca_cert: Option<PathBuf>,

    /// Override insecure TLS setting.
    pub insecure: Option<bool>,

    /// Override timeout (seconds).
    pub timeout: Option<u64>,

    /// Entity/service definitions file for this instance.
    pub definitions: Option<PathBuf>,
}

// ── Config file path ────────────────────────────────────────────────

/// Resolve the config file path via XDG / platform conventions.
pub fn config_path() -> PathBuf {
    ProjectDirs::from("org", "hassflow", "hassflow").map_or_else(
        || {
            let mut p = dirs_fallback();
            p.push("config.toml");
            p
        },
        |dirs| dirs.config_dir().join("config.toml"),
    )
}

fn dirs_fallback() -> PathBuf {
    let mut p = PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| ".".into()));
    p.push(".config");
    p.push("hassflow");
    p
}

// ── Config loading ──────────────────────────────────────────────────

/// Load the full Config from the canonical file + environment.
pub fn load_config() -> Result<Config, ConfigError> {
    load_config_from(&config_path())
}

/// Defaults, then `path` (if present), then `HASSFLOW_*` variables
/// (`__` separates nesting, e.g. `HASSFLOW_PROFILES__HOME__URL`).
pub fn load_config_from(path: &Path) -> Result<Config, ConfigError> {
    let figment = Figment::new()
        .merge(Serialized::defaults(Config::default()))
        .merge(Toml::file(path))
        .merge(Env::prefixed("HASSFLOW_").split("__"));

    let config: Config = figment.extract()?;
    tracing::debug!(path = %path.display(), profiles = config.profiles.len(), "configuration loaded");
    Ok(config)
}

/// Load config, returning a default if it cannot be read.
pub fn load_config_or_default() -> Config {
    load_config().unwrap_or_else(|err| {
        tracing::warn!(error = %err, "ignoring unreadable configuration");
        Config::default()
    })
}

/// Profile name to use: explicit choice, then `default_profile`, then
/// `"default"`.
pub fn active_profile_name(requested: Option<&str>, config: &Config) -> String {
    requested
        .map(ToOwned::to_owned)
        .or_else(|| config.default_profile.clone())
        .unwrap_or_else(|| "default".into())
}

// ── Credential resolution ───────────────────────────────────────────

/// Resolve the access token: the profile's `token_env` variable, then
/// `HOME_ASSISTANT_TOKEN`, then the plaintext `token`.
pub fn resolve_token(profile: &Profile, profile_name: &str) -> Result<SecretString, ConfigError> {
    if let Some(env_name) = profile.token_env.as_deref() {
        if let Some(value) = non_empty_env(env_name) {
            return Ok(SecretString::from(value));
        }
        tracing::debug!(variable = env_name, "token_env is unset or empty");
    }

    if let Some(value) = non_empty_env(TOKEN_ENV) {
        return Ok(SecretString::from(value));
    }

    if let Some(token) = profile.token.as_deref().filter(|t| !t.trim().is_empty()) {
        return Ok(SecretString::from(token.to_owned()));
    }

    Err(ConfigError::NoCredentials {
        profile: profile_name.into(),
    })
}

/// Resolve the instance URL: profile, then `HOME_ASSISTANT_URL`.
pub fn resolve_url(profile: &Profile, profile_name: &str) -> Result<url::Url, ConfigError> {
    let raw = profile
        .url
        .clone()
        .filter(|u| !u.trim().is_empty())
        .or_else(|| non_empty_env(URL_ENV))
        .ok_or_else(|| ConfigError::Missing {
            field: "url".into(),
            profile: profile_name.into(),
        })?;
    parse_url(&raw)
}

pub fn parse_url(raw: &str) -> Result<url::Url, ConfigError> {
    raw.parse().map_err(|_| ConfigError::Validation {
        field: "url".into(),
        reason: format!("invalid URL: {raw}"),
    })
}

fn non_empty_env(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

/// TLS choice for a profile. `insecure` wins over `ca_cert`.
pub fn profile_tls(profile: &Profile, insecure_override: bool) -> TlsVerification {
    if insecure_override || profile.insecure.unwrap_or(false) {
        TlsVerification::DangerAcceptInvalid
    } else if let Some(ref ca_path) = profile.ca_cert {
        TlsVerification::CustomCa(ca_path.clone())
    } else {
        TlsVerification::SystemDefaults
    }
}

/// Build a `ConnectionConfig` from a profile, no flag overrides.
pub fn profile_to_connection_config(
    profile: &Profile,
    profile_name: &str,
) -> Result<ConnectionConfig, ConfigError> {
    let url = resolve_url(profile, profile_name)?;
    let token = resolve_token(profile, profile_name)?;

    let mut config = ConnectionConfig::new(url, token);
    config.tls = profile_tls(profile, false);
    config.timeout = Duration::from_secs(profile.timeout.unwrap_or_else(default_timeout));
    Ok(config)
}

// ── Definitions ─────────────────────────────────────────────────────

/// Declared entities and services, as read from a definitions file.
///
/// ```toml
/// [entities."sensor.temp"]
/// state_type = "number"
/// attributes = { unit_of_measurement = "string" }
///
/// [services."light.turn_on"]
/// fields = ["brightness", "color_name"]
/// ```
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct Definitions {
    #[serde(default)]
    pub entities: EntityDefinition,
    #[serde(default)]
    pub services: ServiceDefinition,
}

impl Definitions {
    pub fn parse(source: &str, path: &Path) -> Result<Self, ConfigError> {
        toml::from_str(source).map_err(|e| ConfigError::Definitions {
            path: path.to_path_buf(),
            reason: e.message().to_owned(),
        })
    }

    pub fn into_parts(self) -> (EntityDefinition, ServiceDefinition) {
        (self.entities, self.services)
    }
}

pub fn load_definitions(path: &Path) -> Result<Definitions, ConfigError> {
    let source = std::fs::read_to_string(path).map_err(|e| ConfigError::Definitions {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;
    let definitions = Definitions::parse(&source, path)?;
    tracing::debug!(
        path = %path.display(),
        entities = definitions.entities.len(),
        services = definitions.services.len(),
        "definitions loaded"
    );
    Ok(definitions)
}

// ── Display ─────────────────────────────────────────────────────────

/// Render config as TOML with tokens masked.
pub fn format_config_redacted(cfg: &Config) -> String {
    let mut out = String::new();

    if let Some(ref default) = cfg.default_profile {
        let _ = writeln!(out, "default_profile = \"{default}\"");
    }
    let _ = writeln!(out);
    let _ = writeln!(out, "[defaults]");
    let _ = writeln!(out, "output = \"{}\"", cfg.defaults.output);
    let _ = writeln!(out, "insecure = {}", cfg.defaults.insecure);
    let _ = writeln!(out, "timeout = {}", cfg.defaults.timeout);

    for (name, p) in &cfg.profiles {
        let _ = writeln!(out);
        let _ = writeln!(out, "[profiles.{name}]");
        if let Some(ref url) = p.url {
            let _ = writeln!(out, "url = \"{url}\"");
        }
        if p.token.is_some() {
            let _ = writeln!(out, "token = \"****\"");
        }
        if let Some(ref env) = p.token_env {
            let _ = writeln!(out, "token_env = \"{env}\"");
        }
        if let Some(ref ca) = p.ca_cert {
            let _ = writeln!(out, "ca_cert = \"{}\"", ca.display());
        }
        if let Some(insecure) = p.insecure {
            let _ = writeln!(out, "insecure = {insecure}");
        }
        if let Some(timeout) = p.timeout {
            let _ = writeln!(out, "timeout = {timeout}");
        }
        if let Some(ref definitions) = p.definitions {
            let _ = writeln!(out, "definitions = \"{}\"", definitions.display());
        }
    }

    out
}

// ── Config saving ───────────────────────────────────────────────────

/// Serialize config to TOML and write it to `path`.
pub fn save_config_to(cfg: &Config, path: &Path) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let toml_str = toml::to_string_pretty(cfg)?;
    std::fs::write(path, toml_str)?;
    Ok(())
}
