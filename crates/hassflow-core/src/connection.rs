// ── Connection seam ──
//
// The runtime only talks to its transport through `Connection`. The live
// implementation wraps `hassflow_api::HassSocket`; tests and replay tools
// provide their own.

use std::sync::Arc;

use futures_core::future::BoxFuture;
use futures_core::stream::BoxStream;
use futures_util::{FutureExt, StreamExt};
use hassflow_api::HassSocket;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::config::ConnectionConfig;
use crate::error::CoreError;
use crate::model::Snapshot;

/// Push stream of full snapshots. The first item is the complete current
/// state; the stream ends when the connection is gone for good.
pub type SnapshotFeed = BoxStream<'static, Arc<Snapshot>>;

/// Transport as seen by the runtime.
pub trait Connection: Send + Sync {
    fn subscribe_entities(&self) -> BoxFuture<'_, Result<SnapshotFeed, CoreError>>;

    /// Returns the opaque JSON result of the remote call.
    fn call_service(&self, call: ServiceCall) -> BoxFuture<'_, Result<Value, CoreError>>;

    fn close(&self) -> BoxFuture<'_, Result<(), CoreError>>;
}

// ── ServiceCall ──────────────────────────────────────────────────────

/// A parsed `"domain.service"` invocation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServiceCall {
    pub domain: String,
    pub service: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<ServiceTarget>,
}

impl ServiceCall {
    /// Split `action_id` on `.`; anything other than two non-empty
    /// segments is `MalformedActionId`. The payload is not validated.
    pub fn parse(
        action_id: &str,
        data: Option<Value>,
        target: Option<ServiceTarget>,
    ) -> Result<Self, CoreError> {
        let mut segments = action_id.split('.');
        match (segments.next(), segments.next(), segments.next()) {
            (Some(domain), Some(service), None) if !domain.is_empty() && !service.is_empty() => {
                Ok(Self {
                    domain: domain.to_owned(),
                    service: service.to_owned(),
                    data,
                    target,
                })
            }
            _ => Err(CoreError::MalformedActionId {
                action_id: action_id.to_owned(),
            }),
        }
    }

    pub fn action_id(&self) -> String {
        format!("{}.{}", self.domain, self.service)
    }
}

/// Targets of a service call. Empty lists are omitted on the wire.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceTarget {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub entity_id: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub device_id: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub area_id: Vec<String>,
}

impl ServiceTarget {
    pub fn entity(entity_id: impl Into<String>) -> Self {
        Self {
            entity_id: vec![entity_id.into()],
            ..Self::default()
        }
    }

    pub fn entities<I, S>(entity_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            entity_id: entity_ids.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    pub fn with_device(mut self, device_id: impl Into<String>) -> Self {
        self.device_id.push(device_id.into());
        self
    }

    pub fn with_area(mut self, area_id: impl Into<String>) -> Self {
        self.area_id.push(area_id.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.entity_id.is_empty() && self.device_id.is_empty() && self.area_id.is_empty()
    }
}

// ── HassConnection ───────────────────────────────────────────────────

/// `Connection` over a live Home Assistant WebSocket session.
pub struct HassConnection {
    socket: HassSocket,
}

impl HassConnection {
    /// Validate `config`, then connect and authenticate.
    pub async fn connect(
        config: &ConnectionConfig,
        cancel: CancellationToken,
    ) -> Result<Self, CoreError> {
        config.validate()?;
        let socket = HassSocket::connect(config.socket_config()?, cancel)
            .await
            .map_err(|e| match CoreError::from(e) {
                CoreError::ConnectionFailed { url, reason } if url.is_empty() => {
                    CoreError::ConnectionFailed {
                        url: config.url.to_string(),
                        reason,
                    }
                }
                other => other,
            })?;
        Ok(Self { socket })
    }

    pub fn from_socket(socket: HassSocket) -> Self {
        Self { socket }
    }

    pub fn socket(&self) -> &HassSocket {
        &self.socket
    }

    pub fn ha_version(&self) -> &str {
        self.socket.ha_version()
    }
}

impl Connection for HassConnection {
    fn subscribe_entities(&self) -> BoxFuture<'_, Result<SnapshotFeed, CoreError>> {
        async move {
            let feed = self.socket.subscribe_entities().await?;
            let snapshots = futures_util::stream::unfold(feed, |mut feed| async move {
                let entities = feed.next().await?;
                Some((Arc::new(Snapshot::from(entities.as_ref())), feed))
            });
            Ok(snapshots.boxed())
        }
        .boxed()
    }

    fn call_service(&self, call: ServiceCall) -> BoxFuture<'_, Result<Value, CoreError>> {
        async move {
            let target = match call.target {
                Some(target) if !target.is_empty() => Some(
                    serde_json::to_value(target)
                        .map_err(|e| CoreError::Internal(format!("service target: {e}")))?,
                ),
                _ => None,
            };
            let result = self
                .socket
                .call_service(&call.domain, &call.service, call.data, target)
                .await?;
            Ok(result)
        }
        .boxed()
    }

    fn close(&self) -> BoxFuture<'_, Result<(), CoreError>> {
        async move {
            self.socket.close();
            Ok(())
        }
        .boxed()
    }
}
