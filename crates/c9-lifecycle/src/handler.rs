//! Turns custom-resource events into provisioning runs and responses.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{info, instrument, warn};

use c9_provision::{CancelSignal, CloudApi, ProvisionConfig, ProvisionOutcome, Provisioner};

use crate::error::Result;
use crate::event::{LifecycleEvent, RequestType};
use crate::response::{ResponseDocument, ResponseSender};

/// Handles `Create`, `Update` and `Delete` requests for the bootstrap resource.
pub struct LifecycleHandler {
    backend: Backend,
    sender: Arc<dyn ResponseSender>,
}

enum Backend {
    Ready {
        api: Arc<dyn CloudApi>,
        base_config: ProvisionConfig,
    },
    /// Setup failed; `Create` is answered with this reason.
    Unavailable(String),
}

impl LifecycleHandler {
    pub fn new(
        api: Arc<dyn CloudApi>,
        base_config: ProvisionConfig,
        sender: Arc<dyn ResponseSender>,
    ) -> Self {
        Self {
            backend: Backend::Ready { api, base_config },
            sender,
        }
    }

    /// A handler that can still answer every event when no provisioning
    /// backend could be set up. `Create` fails with `reason`; `Update` and
    /// `Delete` succeed as usual since they make no calls.
    pub fn without_backend(sender: Arc<dyn ResponseSender>, reason: impl Into<String>) -> Self {
        Self {
            backend: Backend::Unavailable(reason.into()),
            sender,
        }
    }

    /// Parse `raw` and handle it.
    ///
    /// A malformed event that still names a `ResponseURL` is answered
    /// (`FAILED`, or `SUCCESS` for `Delete` so stack teardown is not
    /// blocked). Only an event with no usable `ResponseURL` is an error.
    pub async fn handle_raw(&self, raw: &str, cancel: CancelSignal) -> Result<ResponseDocument> {
        let err = match LifecycleEvent::parse(raw) {
            Ok(event) => return self.handle(&event, cancel).await,
            Err(err) => err,
        };
        let Some(event) = LifecycleEvent::recover(raw) else {
            return Err(err);
        };

        warn!(error = %err, request_id = %event.request_id, "answering malformed custom-resource event");
        let document = match event.request_type {
            RequestType::Delete => {
                ResponseDocument::success(&event, existing_physical_id(&event), BTreeMap::new())
            }
            RequestType::Create | RequestType::Update => {
                ResponseDocument::failed(&event, err.to_string())
            }
        };
        self.sender.send(&event.response_url, &document).await?;
        Ok(document)
    }

    /// Work out the response and deliver it to the event's `ResponseURL`.
    ///
    /// Provisioning failures become a `FAILED` document; only a failure to
    /// deliver the document is returned as an error.
    pub async fn handle(
        &self,
        event: &LifecycleEvent,
        cancel: CancelSignal,
    ) -> Result<ResponseDocument> {
        let document = self.respond(event, cancel).await;
        self.sender.send(&event.response_url, &document).await?;
        Ok(document)
    }

    /// The response document for `event`, without sending it.
    #[instrument(skip_all, fields(request_type = ?event.request_type, request_id = %event.request_id))]
    pub async fn respond(&self, event: &LifecycleEvent, cancel: CancelSignal) -> ResponseDocument {
        match event.request_type {
            RequestType::Create => self.create(event, cancel).await,
            RequestType::Update => {
                info!("update requested; environment is left unchanged");
                ResponseDocument::success(event, existing_physical_id(event), BTreeMap::new())
            }
            RequestType::Delete => {
                info!("delete requested; provisioned resources are kept");
                ResponseDocument::success(event, existing_physical_id(event), BTreeMap::new())
            }
        }
    }

    async fn create(&self, event: &LifecycleEvent, cancel: CancelSignal) -> ResponseDocument {
        let (api, base_config) = match &self.backend {
            Backend::Ready { api, base_config } => (api, base_config),
            Backend::Unavailable(reason) => {
                warn!(reason = %reason, "no provisioning backend");
                return ResponseDocument::failed(
                    event,
                    format!("provisioning backend unavailable: {reason}"),
                );
            }
        };
        let config = event.resource_properties.apply(base_config.clone());

        let provisioner = match Provisioner::new(api.clone(), config) {
            Ok(provisioner) => provisioner,
            Err(err) => {
                warn!(error = %err, "rejecting resource properties");
                return ResponseDocument::failed(event, err.to_string());
            }
        };

        match provisioner.run(cancel).await.into_result() {
            Ok(outcome) => {
                ResponseDocument::success(event, outcome.environment_id.as_str(), outcome_data(&outcome))
            }
            Err(err) => ResponseDocument::failed(event, err.to_string()),
        }
    }
}

fn existing_physical_id(event: &LifecycleEvent) -> String {
    event
        .physical_resource_id
        .clone()
        .unwrap_or_else(|| event.logical_resource_id.clone())
}

fn outcome_data(outcome: &ProvisionOutcome) -> BTreeMap<String, String> {
    BTreeMap::from([
        (
            "EnvironmentId".to_string(),
            outcome.environment_id.to_string(),
        ),
        ("InstanceId".to_string(), outcome.instance_id.to_string()),
        ("CommandId".to_string(), outcome.command_id.to_string()),
    ])
}
