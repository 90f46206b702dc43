//! Remote transport
//!
//! Defines the transport trait the engine talks to and the REST
//! implementation used against the order backend.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{header, StatusCode};
use serde_json::Value;

use super::error::TransportError;
use super::types::{EntityType, ServerEntity};

/// Remote collaborator that owns the authoritative copy of every entity
#[async_trait]
pub trait SyncTransport: Send + Sync {
    /// Get the server's current value of an entity
    async fn fetch(&self, entity_type: EntityType, id: &str) -> Result<ServerEntity, TransportError>;

    /// Create an entity; the server assigns its id and first version
    async fn create(&self, entity_type: EntityType, payload: &Value) -> Result<ServerEntity, TransportError>;

    /// Replace an entity, checked against `base_version` unless it is `None`
    async fn update(
        &self,
        entity_type: EntityType,
        id: &str,
        payload: &Value,
        base_version: Option<u64>,
    ) -> Result<ServerEntity, TransportError>;

    /// Delete an entity, checked against `base_version` unless it is `None`
    async fn delete(
        &self,
        entity_type: EntityType,
        id: &str,
        base_version: Option<u64>,
    ) -> Result<(), TransportError>;
}

/// REST transport: `/{collection}` and `/{collection}/{id}` with `If-Match`
pub struct HttpTransport {
    client: reqwest::Client,
    base_url: String,
}

impl HttpTransport {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TransportError::Network(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn collection_url(&self, entity_type: EntityType) -> String {
        format!("{}/{}", self.base_url, entity_type.collection())
    }

    fn entity_url(&self, entity_type: EntityType, id: &str) -> String {
        format!(
            "{}/{}",
            self.collection_url(entity_type),
            urlencoding::encode(id)
        )
    }

    fn with_version(
        request: reqwest::RequestBuilder,
        base_version: Option<u64>,
    ) -> reqwest::RequestBuilder {
        match base_version {
            Some(version) => request.header(header::IF_MATCH, version.to_string()),
            None => request,
        }
    }
}

#[async_trait]
impl SyncTransport for HttpTransport {
    async fn fetch(&self, entity_type: EntityType, id: &str) -> Result<ServerEntity, TransportError> {
        let response = self
            .client
            .get(self.entity_url(entity_type, id))
            .send()
            .await
            .map_err(send_error)?;

        read_entity(response, id).await
    }

    async fn create(&self, entity_type: EntityType, payload: &Value) -> Result<ServerEntity, TransportError> {
        let response = self
            .client
            .post(self.collection_url(entity_type))
            .json(payload)
            .send()
            .await
            .map_err(send_error)?;

        read_entity(response, entity_type.collection()).await
    }

    async fn update(
        &self,
        entity_type: EntityType,
        id: &str,
        payload: &Value,
        base_version: Option<u64>,
    ) -> Result<ServerEntity, TransportError> {
        let request = self.client.put(self.entity_url(entity_type, id)).json(payload);
        let response = Self::with_version(request, base_version)
            .send()
            .await
            .map_err(send_error)?;

        read_entity(response, id).await
    }

    async fn delete(
        &self,
        entity_type: EntityType,
        id: &str,
        base_version: Option<u64>,
    ) -> Result<(), TransportError> {
        let request = self.client.delete(self.entity_url(entity_type, id));
        let response = Self::with_version(request, base_version)
            .send()
            .await
            .map_err(send_error)?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(status_error(status, id, body))
    }
}

fn send_error(e: reqwest::Error) -> TransportError {
    if e.is_timeout() {
        TransportError::Timeout
    } else {
        TransportError::Network(e.to_string())
    }
}

async fn read_entity(response: reqwest::Response, target: &str) -> Result<ServerEntity, TransportError> {
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(status_error(status, target, body));
    }

    response
        .json::<ServerEntity>()
        .await
        .map_err(|e| TransportError::Network(format!("Invalid response body: {}", e)))
}

/// Map a non-success HTTP status onto the transport error taxonomy
fn status_error(status: StatusCode, target: &str, body: String) -> TransportError {
    match status {
        StatusCode::CONFLICT | StatusCode::PRECONDITION_FAILED => TransportError::VersionMismatch,
        StatusCode::NOT_FOUND => TransportError::NotFound(target.to_string()),
        StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY => {
            TransportError::Validation(if body.is_empty() {
                status.to_string()
            } else {
                body
            })
        }
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => TransportError::Timeout,
        _ => TransportError::Network(format!("Server returned {}", status)),
    }
}
