// ── Runtime connection configuration ──
//
// These types describe *how* to reach a Home Assistant instance. They carry
// the access token and connection tuning but never touch disk or the
// process environment; hassflow-config (or the embedding application)
// builds a `ConnectionConfig` and hands it in.

use std::path::PathBuf;
use std::time::Duration;

use hassflow_api::{ReconnectConfig, RestClient, SocketConfig, TlsMode, TransportConfig};
use secrecy::{ExposeSecret, SecretString};
use url::Url;

use crate::error::CoreError;

/// TLS verification strategy.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum TlsVerification {
    /// System CA store (strict).
    #[default]
    SystemDefaults,
    /// Custom CA certificate file.
    CustomCa(PathBuf),
    /// Skip verification (self-signed local instances). REST only; the
    /// WebSocket always verifies against bundled roots.
    DangerAcceptInvalid,
}

/// Configuration for connecting to a single Home Assistant instance.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Instance base URL (e.g., `http://homeassistant.local:8123`).
    pub url: Url,
    /// Long-lived access token.
    pub token: SecretString,
    pub tls: TlsVerification,
    /// Handshake and request timeout.
    pub timeout: Duration,
    /// WebSocket reconnection backoff.
    pub reconnect: ReconnectConfig,
}

impl ConnectionConfig {
    pub fn new(url: Url, token: SecretString) -> Self {
        Self {
            url,
            token,
            tls: TlsVerification::default(),
            timeout: Duration::from_secs(30),
            reconnect: ReconnectConfig::default(),
        }
    }

    /// Reject configurations that cannot possibly connect.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.url.host_str().is_none_or(str::is_empty) {
            return Err(CoreError::ConfigMissing { field: "url".into() });
        }
        if self.token.expose_secret().trim().is_empty() {
            return Err(CoreError::ConfigMissing {
                field: "token".into(),
            });
        }
        websocket_scheme(self.url.scheme())?;
        Ok(())
    }

    /// `http(s)://host[/prefix]` → `ws(s)://host[/prefix]/api/websocket`.
    pub fn websocket_url(&self) -> Result<Url, CoreError> {
        let mut url = self.url.clone();
        let scheme = websocket_scheme(url.scheme())?;
        url.set_scheme(scheme).map_err(|()| CoreError::Config {
            message: format!("cannot use scheme {scheme} for {}", self.url),
        })?;

        let base = url.path().trim_end_matches('/').to_owned();
        let path = if base.ends_with("/api/websocket") {
            base
        } else {
            format!("{base}/api/websocket")
        };
        url.set_path(&path);
        url.set_query(None);
        url.set_fragment(None);
        Ok(url)
    }

    /// HTTP transport settings for the REST client.
    pub fn transport(&self) -> TransportConfig {
        let tls = match &self.tls {
            TlsVerification::SystemDefaults => TlsMode::System,
            TlsVerification::CustomCa(path) => TlsMode::CustomCa(path.clone()),
            TlsVerification::DangerAcceptInvalid => TlsMode::DangerAcceptInvalid,
        };
        TransportConfig {
            tls,
            timeout: self.timeout,
        }
    }

    pub fn socket_config(&self) -> Result<SocketConfig, CoreError> {
        Ok(SocketConfig {
            url: self.websocket_url()?,
            token: self.token.clone(),
            timeout: self.timeout,
            reconnect: self.reconnect.clone(),
        })
    }

    pub fn rest_client(&self) -> Result<RestClient, CoreError> {
        self.validate()?;
        Ok(RestClient::new(
            self.url.clone(),
            &self.token,
            &self.transport(),
        )?)
    }
}

fn websocket_scheme(scheme: &str) -> Result<&'static str, CoreError> {
    match scheme {
        "http" | "ws" => Ok("ws"),
        "https" | "wss" => Ok("wss"),
        other => Err(CoreError::Config {
            message: format!("unsupported URL scheme {other:?} (expected http or https)"),
        }),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn config(url: &str, token: &str) -> ConnectionConfig {
        ConnectionConfig::new(Url::parse(url).unwrap(), SecretString::from(token.to_string()))
    }

    #[test]
    fn websocket_url_maps_scheme_and_path() {
        let cfg = config("http://homeassistant.local:8123", "t");
        assert_eq!(
            cfg.websocket_url().unwrap().as_str(),
            "ws://homeassistant.local:8123/api/websocket"
        );

        let cfg = config("https://example.org/ha/", "t");
        assert_eq!(
            cfg.websocket_url().unwrap().as_str(),
            "wss://example.org/ha/api/websocket"
        );
    }

    #[test]
    fn websocket_url_is_left_alone_when_already_complete() {
        let cfg = config("ws://10.0.0.2:8123/api/websocket", "t");
        assert_eq!(
            cfg.websocket_url().unwrap().as_str(),
            "ws://10.0.0.2:8123/api/websocket"
        );
    }

    #[test]
    fn empty_token_is_missing() {
        let err = config("http://ha.local:8123", "  ").validate().unwrap_err();
        assert!(matches!(err, CoreError::ConfigMissing { field } if field == "token"));
    }

    #[test]
    fn unsupported_scheme_is_rejected() {
        let err = config("ftp://ha.local", "t").validate().unwrap_err();
        assert!(matches!(err, CoreError::Config { .. }));
    }

    #[test]
    fn transport_mirrors_tls_choice() {
        let mut cfg = config("https://ha.local", "t");
        cfg.tls = TlsVerification::DangerAcceptInvalid;
        assert!(matches!(cfg.transport().tls, TlsMode::DangerAcceptInvalid));
    }
}
