//! Custom-resource response documents and how they reach CloudFormation.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{LifecycleError, Result};
use crate::event::LifecycleEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResponseStatus {
    Success,
    Failed,
}

/// The document `PUT` to an event's `ResponseURL`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ResponseDocument {
    pub status: ResponseStatus,
    pub reason: String,
    pub physical_resource_id: String,
    pub stack_id: String,
    pub request_id: String,
    pub logical_resource_id: String,
    pub no_echo: bool,
    /// Always present, possibly empty.
    pub data: BTreeMap<String, String>,
}

impl ResponseDocument {
    pub fn success(
        event: &LifecycleEvent,
        physical_resource_id: impl Into<String>,
        data: BTreeMap<String, String>,
    ) -> Self {
        Self::build(
            event,
            ResponseStatus::Success,
            "OK".to_string(),
            physical_resource_id.into(),
            data,
        )
    }

    /// A `FAILED` document; `message` is both the reason and `Data.Message`.
    pub fn failed(event: &LifecycleEvent, message: impl Into<String>) -> Self {
        let message = message.into();
        let physical_resource_id = event
            .physical_resource_id
            .clone()
            .unwrap_or_else(|| event.logical_resource_id.clone());
        let data = BTreeMap::from([("Message".to_string(), message.clone())]);
        Self::build(
            event,
            ResponseStatus::Failed,
            message,
            physical_resource_id,
            data,
        )
    }

    fn build(
        event: &LifecycleEvent,
        status: ResponseStatus,
        reason: String,
        physical_resource_id: String,
        data: BTreeMap<String, String>,
    ) -> Self {
        Self {
            status,
            reason,
            physical_resource_id,
            stack_id: event.stack_id.clone(),
            request_id: event.request_id.clone(),
            logical_resource_id: event.logical_resource_id.clone(),
            no_echo: false,
            data,
        }
    }
}

/// Delivers response documents.
#[async_trait]
pub trait ResponseSender: Send + Sync {
    async fn send(&self, response_url: &str, document: &ResponseDocument) -> Result<()>;
}

/// Sends responses with an HTTP `PUT` to the pre-signed URL.
pub struct HttpResponseSender {
    http_client: reqwest::Client,
}

impl HttpResponseSender {
    pub fn new() -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .user_agent(concat!("c9-bootstrap/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self { http_client })
    }
}

#[async_trait]
impl ResponseSender for HttpResponseSender {
    async fn send(&self, response_url: &str, document: &ResponseDocument) -> Result<()> {
        let body = serde_json::to_vec(document)?;
        debug!(bytes = body.len(), "sending custom-resource response");

        // pre-signed S3 URLs are signed without a content type
        let response = self
            .http_client
            .put(response_url)
            .header(reqwest::header::CONTENT_TYPE, "")
            .body(body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(LifecycleError::Callback {
                status: status.as_u16(),
                body,
            });
        }

        info!(status = ?document.status, request_id = %document.request_id, "custom-resource response sent");
        Ok(())
    }
}
