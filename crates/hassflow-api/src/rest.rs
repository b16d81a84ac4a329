// REST API client
//
// Thin wrapper over `reqwest::Client` for the handful of REST endpoints the
// WebSocket API does not cover well: the liveness check and the instance
// configuration. Everything stateful goes through the WebSocket session.

use secrecy::SecretString;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tracing::debug;
use url::Url;

use crate::error::Error;
use crate::transport::TransportConfig;

/// Response body of `GET /api/`.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiStatus {
    pub message: String,
}

/// Subset of `GET /api/config` used for diagnostics.
#[derive(Debug, Clone, Deserialize)]
pub struct InstanceConfig {
    pub version: String,
    #[serde(default)]
    pub location_name: String,
    #[serde(default)]
    pub time_zone: String,
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default)]
    pub components: Vec<String>,
    #[serde(default)]
    pub unit_system: serde_json::Map<String, serde_json::Value>,
}

/// HTTP client for the Home Assistant REST API.
pub struct RestClient {
    http: reqwest::Client,
    base_url: Url,
}

impl RestClient {
    /// `base_url` is the instance root, e.g. `http://homeassistant.local:8123`.
    pub fn new(
        base_url: Url,
        token: &SecretString,
        transport: &TransportConfig,
    ) -> Result<Self, Error> {
        let http = transport.build_client(token)?;
        Ok(Self::with_client(http, base_url))
    }

    /// Use a pre-built client (must already carry the bearer header).
    pub fn with_client(http: reqwest::Client, mut base_url: Url) -> Self {
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }
        Self { http, base_url }
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// `GET /api/`: succeeds with `"API running."` when the token is valid.
    pub async fn check(&self) -> Result<ApiStatus, Error> {
        self.get("api/").await
    }

    /// `GET /api/config`.
    pub async fn config(&self) -> Result<InstanceConfig, Error> {
        self.get("api/config").await
    }

    // ── Request helpers ──────────────────────────────────────────────

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, Error> {
        let url = self.base_url.join(path)?;
        debug!("GET {}", url);

        let resp = self.http.get(url).send().await.map_err(Error::Transport)?;

        parse_response(resp).await
    }
}

async fn parse_response<T: DeserializeOwned>(resp: reqwest::Response) -> Result<T, Error> {
    let status = resp.status();

    if status == reqwest::StatusCode::UNAUTHORIZED {
        return Err(Error::InvalidToken);
    }

    let body = resp.text().await.map_err(Error::Transport)?;

    if !status.is_success() {
        return Err(Error::Api {
            status: status.as_u16(),
            message: error_message(&body),
        });
    }

    serde_json::from_str(&body).map_err(|e| Error::Deserialization {
        message: e.to_string(),
        body,
    })
}

/// Home Assistant errors are usually `{"message": "..."}`; fall back to
/// the raw body.
fn error_message(body: &str) -> String {
    serde_json::from_str::<ApiStatus>(body).map_or_else(|_| body.trim().to_owned(), |s| s.message)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn base_url_gets_trailing_slash() {
        let client = RestClient::with_client(
            reqwest::Client::new(),
            Url::parse("http://ha.local:8123/proxy").unwrap(),
        );
        assert_eq!(client.base_url().as_str(), "http://ha.local:8123/proxy/");
    }

    #[test]
    fn error_message_prefers_json_message() {
        assert_eq!(error_message(r#"{"message": "Entity not found."}"#), "Entity not found.");
        assert_eq!(error_message("502 Bad Gateway\n"), "502 Bad Gateway");
    }
}
