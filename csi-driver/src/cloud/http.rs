//! HTTP/JSON implementation of [`ControlPlane`].
//!
//! Endpoints (relative to the configured API URL):
//! - `POST   /v1/volumes`               create a volume
//! - `DELETE /v1/volumes/{id}`          delete a volume
//! - `GET    /v1/instances/{node}`      resolve a node name or ID
//! - `POST   /v1/volumes/{id}/attach`   attach to an instance
//! - `POST   /v1/volumes/{id}/detach`   detach from the current instance

use std::time::Duration;

use reqwest::{Client, ClientBuilder, RequestBuilder, Response, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{ControlPlane, ControlPlaneError, CreatedVolume, Result};
use crate::metrics;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Serialize)]
struct CreateVolumeBody<'a> {
    name: &'a str,
    size_gb: i64,
}

#[derive(Deserialize)]
struct VolumeBody {
    id: String,
    #[serde(default)]
    size_gb: i64,
}

#[derive(Deserialize)]
struct InstanceBody {
    id: String,
}

#[derive(Serialize)]
struct AttachBody<'a> {
    instance_id: &'a str,
    device: &'a str,
}

#[derive(Deserialize)]
struct ErrorBody {
    message: Option<String>,
    error: Option<String>,
}

/// Extract a human-readable message from an error response body.
fn error_message(status: StatusCode, body: &str) -> String {
    if let Ok(parsed) = serde_json::from_str::<ErrorBody>(body)
        && let Some(message) = parsed.message.or(parsed.error)
        && !message.is_empty()
    {
        return message;
    }

    let body = body.trim();
    if body.is_empty() {
        status
            .canonical_reason()
            .unwrap_or("unknown error")
            .to_string()
    } else {
        body.to_string()
    }
}

/// Client for the control-plane REST API.
#[derive(Debug, Clone)]
pub struct HttpControlPlane {
    base_url: Url,
    api_key: Option<String>,
    client: Client,
}

impl HttpControlPlane {
    /// Create a client rooted at `api_url`.
    ///
    /// When `api_key` is non-empty every request carries it as a bearer token.
    pub fn new(api_url: &str, api_key: Option<String>) -> Result<Self> {
        let client = ClientBuilder::new()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(REQUEST_TIMEOUT)
            .build()?;

        Self::new_with_client(api_url, api_key, client)
    }

    /// Create a client that sends requests through a preconfigured
    /// [`reqwest::Client`].
    pub fn new_with_client(api_url: &str, api_key: Option<String>, client: Client) -> Result<Self> {
        let base_url =
            Url::parse(api_url).map_err(|_| ControlPlaneError::InvalidUrl(api_url.to_string()))?;
        if base_url.cannot_be_a_base() {
            return Err(ControlPlaneError::InvalidUrl(api_url.to_string()));
        }

        Ok(Self {
            base_url,
            api_key: api_key.filter(|k| !k.is_empty()),
            client,
        })
    }

    /// Build a URL under the API root; each segment is percent-encoded.
    fn url(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| ControlPlaneError::InvalidUrl(self.base_url.to_string()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    /// Send a request, mapping non-2xx responses to errors.
    async fn send(&self, operation: &'static str, request: RequestBuilder) -> Result<Response> {
        let request = match &self.api_key {
            Some(key) => request.bearer_auth(key),
            None => request,
        };

        let response = match request.send().await {
            Ok(r) => r,
            Err(e) => {
                warn!(operation, error = %e, "Control plane request failed");
                metrics::record_control_plane_request(operation, "error");
                return Err(e.into());
            }
        };

        let status = response.status();
        metrics::record_control_plane_request(operation, status.as_str());
        debug!(operation, status = %status, "Control plane responded");

        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        let message = error_message(status, &body);
        if status == StatusCode::NOT_FOUND {
            Err(ControlPlaneError::NotFound(message))
        } else {
            Err(ControlPlaneError::Api {
                status: status.as_u16(),
                message,
            })
        }
    }

    /// Decode a JSON success body.
    async fn decode<T: DeserializeOwned>(response: Response) -> Result<T> {
        let body = response.text().await?;
        serde_json::from_str(&body).map_err(|e| ControlPlaneError::InvalidResponse(e.to_string()))
    }
}

#[tonic::async_trait]
impl ControlPlane for HttpControlPlane {
    async fn create_volume(&self, name: &str, size_gb: i64) -> Result<CreatedVolume> {
        debug!(name = %name, size_gb, "Creating volume");

        let url = self.url(&["v1", "volumes"])?;
        let request = self
            .client
            .post(url)
            .json(&CreateVolumeBody { name, size_gb });
        let response = self.send("create_volume", request).await?;
        let volume: VolumeBody = Self::decode(response).await?;

        if volume.id.is_empty() {
            return Err(ControlPlaneError::InvalidResponse(
                "created volume has an empty id".to_string(),
            ));
        }

        Ok(CreatedVolume {
            volume_id: volume.id,
            size_gb: volume.size_gb,
        })
    }

    async fn delete_volume(&self, volume_id: &str) -> Result<()> {
        debug!(volume_id = %volume_id, "Deleting volume");

        let url = self.url(&["v1", "volumes", volume_id])?;
        self.send("delete_volume", self.client.delete(url)).await?;
        Ok(())
    }

    async fn get_instance(&self, node: &str) -> Result<String> {
        debug!(node = %node, "Resolving instance");

        let url = self.url(&["v1", "instances", node])?;
        let response = self.send("get_instance", self.client.get(url)).await?;
        let instance: InstanceBody = Self::decode(response).await?;

        if instance.id.is_empty() {
            return Err(ControlPlaneError::InvalidResponse(format!(
                "instance '{}' has an empty id",
                node
            )));
        }

        Ok(instance.id)
    }

    async fn attach_volume(&self, volume_id: &str, instance_id: &str, device: &str) -> Result<()> {
        debug!(
            volume_id = %volume_id,
            instance_id = %instance_id,
            device = %device,
            "Attaching volume"
        );

        let url = self.url(&["v1", "volumes", volume_id, "attach"])?;
        let request = self
            .client
            .post(url)
            .json(&AttachBody { instance_id, device });
        self.send("attach_volume", request).await?;
        Ok(())
    }

    async fn detach_volume(&self, volume_id: &str) -> Result<()> {
        debug!(volume_id = %volume_id, "Detaching volume");

        let url = self.url(&["v1", "volumes", volume_id, "detach"])?;
        self.send("detach_volume", self.client.post(url)).await?;
        Ok(())
    }
}
