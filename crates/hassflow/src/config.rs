//! Flag-aware configuration: layers `GlobalOpts` over the profile loaded
//! by hassflow-config and produces a ready `ConnectionConfig`.

use std::time::Duration;

use secrecy::SecretString;

use hassflow_config::{Config, Definitions, Profile};
use hassflow_core::ConnectionConfig;

use crate::cli::GlobalOpts;
use crate::error::CliError;

/// Everything a command needs to reach one instance.
#[derive(Debug)]
pub struct Resolved {
    pub profile: String,
    pub connection: ConnectionConfig,
    pub definitions: Definitions,
}

/// Resolve the active profile name: `--profile`, then config default.
pub fn active_profile_name(global: &GlobalOpts, cfg: &Config) -> String {
    hassflow_config::active_profile_name(global.profile.as_deref(), cfg)
}

/// Build the connection from config file, profile, and CLI overrides.
///
/// Flags win over the profile; the profile wins over `[defaults]`. A
/// missing profile is only an error when it was asked for by name.
pub fn resolve_connection(global: &GlobalOpts) -> Result<Resolved, CliError> {
    let cfg = hassflow_config::load_config_or_default();
    let profile_name = active_profile_name(global, &cfg);

    let profile = match cfg.profiles.get(&profile_name) {
        Some(profile) => profile.clone(),
        None if global.profile.is_some() => {
            return Err(CliError::ProfileNotFound {
                name: profile_name,
                available: available_profiles(&cfg),
            });
        }
        None => Profile::default(),
    };

    let url = match global.url.as_deref() {
        Some(raw) => hassflow_config::parse_url(raw)?,
        None => hassflow_config::resolve_url(&profile, &profile_name)?,
    };

    let token = match global.token.as_deref().filter(|t| !t.trim().is_empty()) {
        Some(token) => SecretString::from(token.to_owned()),
        None => hassflow_config::resolve_token(&profile, &profile_name)?,
    };

    let mut connection = ConnectionConfig::new(url, token);
    let insecure = global.insecure || cfg.defaults.insecure;
    connection.tls = hassflow_config::profile_tls(&profile, insecure);
    connection.timeout = Duration::from_secs(
        global
            .timeout
            .or(profile.timeout)
            .unwrap_or(cfg.defaults.timeout),
    );

    let definitions = match global.definitions.as_ref().or(profile.definitions.as_ref()) {
        Some(path) => hassflow_config::load_definitions(path)?,
        None => Definitions::default(),
    };

    Ok(Resolved {
        profile: profile_name,
        connection,
        definitions,
    })
}

pub fn available_profiles(cfg: &Config) -> String {
    if cfg.profiles.is_empty() {
        "(none)".into()
    } else {
        cfg.profiles.keys().cloned().collect::<Vec<_>>().join(", ")
    }
}
