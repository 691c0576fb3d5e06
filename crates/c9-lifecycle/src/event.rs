//! CloudFormation custom-resource request events.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use c9_provision::ProvisionConfig;

use crate::error::{LifecycleError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestType {
    Create,
    Update,
    Delete,
}

/// A custom-resource request as delivered by CloudFormation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct LifecycleEvent {
    pub request_type: RequestType,
    #[serde(rename = "ResponseURL")]
    pub response_url: String,
    pub stack_id: String,
    pub request_id: String,
    pub logical_resource_id: String,
    /// Present on `Update` and `Delete`.
    #[serde(default)]
    pub physical_resource_id: Option<String>,
    #[serde(default)]
    pub resource_type: Option<String>,
    #[serde(default)]
    pub resource_properties: ResourceProperties,
}

impl LifecycleEvent {
    /// Parse and check an event document.
    pub fn parse(json: &str) -> Result<Self> {
        let event: LifecycleEvent = serde_json::from_str(json)
            .map_err(|e| LifecycleError::InvalidEvent(e.to_string()))?;
        event.validate()?;
        Ok(event)
    }

    /// Salvage enough of a malformed event to answer it.
    ///
    /// Returns `None` unless the document is a JSON object with a non-empty
    /// `ResponseURL`. Missing identifiers come back empty, an unreadable
    /// `RequestType` as `Create` and the properties as defaults.
    pub fn recover(json: &str) -> Option<Self> {
        let value: Value = serde_json::from_str(json).ok()?;
        let object = value.as_object()?;
        let text = |key: &str| {
            object
                .get(key)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string()
        };

        let response_url = text("ResponseURL");
        if response_url.trim().is_empty() {
            return None;
        }

        let request_type = object
            .get("RequestType")
            .cloned()
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or(RequestType::Create);

        Some(Self {
            request_type,
            response_url,
            stack_id: text("StackId"),
            request_id: text("RequestId"),
            logical_resource_id: text("LogicalResourceId"),
            physical_resource_id: object
                .get("PhysicalResourceId")
                .and_then(Value::as_str)
                .map(str::to_string),
            resource_type: object
                .get("ResourceType")
                .and_then(Value::as_str)
                .map(str::to_string),
            resource_properties: ResourceProperties::default(),
        })
    }

    pub fn validate(&self) -> Result<()> {
        for (field, value) in [
            ("ResponseURL", &self.response_url),
            ("StackId", &self.stack_id),
            ("RequestId", &self.request_id),
            ("LogicalResourceId", &self.logical_resource_id),
        ] {
            if value.trim().is_empty() {
                return Err(LifecycleError::InvalidEvent(format!("{field} is empty")));
            }
        }
        Ok(())
    }
}

/// Template-supplied overrides. Unknown keys such as `ServiceToken` are ignored.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ResourceProperties {
    pub environment_name: Option<String>,
    pub description: Option<String>,
    pub instance_type: Option<String>,
    pub role_name: Option<String>,
    pub profile_name: Option<String>,
}

impl ResourceProperties {
    /// Layer these overrides on top of `base`.
    ///
    /// A new environment name re-derives the role, profile and tag names the
    /// same way [`ProvisionConfig::named`] does; explicit role and profile
    /// names still win.
    pub fn apply(&self, base: ProvisionConfig) -> ProvisionConfig {
        let mut config = match &self.environment_name {
            Some(name) => {
                let derived = ProvisionConfig::named(name);
                let mut config = base;
                config.environment.name = derived.environment.name;
                config.environment.tag = derived.environment.tag;
                config.identity.role_name = derived.identity.role_name;
                config.identity.profile_name = derived.identity.profile_name;
                config
            }
            None => base,
        };

        if let Some(description) = &self.description {
            config.environment.description = description.clone();
        }
        if let Some(instance_type) = &self.instance_type {
            config.environment.instance_type = instance_type.clone();
        }
        if let Some(role_name) = &self.role_name {
            config.identity.role_name = role_name.clone();
        }
        if let Some(profile_name) = &self.profile_name {
            config.identity.profile_name = profile_name.clone();
        }
        config
    }
}
