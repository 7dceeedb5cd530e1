//! Desired-property documents received from the update service

use serde::{Deserialize, Serialize};

use crate::errors::AgentError;
use crate::model::action::UpdateAction;

/// The `workflow` block of a desired document.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowProperties {
    /// Requested update action
    pub action: UpdateAction,

    /// Deployment id, unique per deployment
    pub id: String,

    /// Service-issued nonce forcing a replay when changed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_timestamp: Option<String>,
}

/// A desired document written by the service to the `service` sub-property.
///
/// `update_manifest` is carried as an embedded JSON string and parsed
/// separately; `update_manifest_signature` and `file_urls` are opaque here
/// and redacted before the document is echoed back as an acknowledgement.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceRequest {
    pub workflow: WorkflowProperties,

    #[serde(default)]
    pub update_manifest: Option<String>,

    #[serde(default)]
    pub update_manifest_signature: Option<serde_json::Value>,

    #[serde(default)]
    pub file_urls: Option<serde_json::Value>,
}

impl ServiceRequest {
    /// Parse and validate a desired-property value.
    pub fn from_value(value: &serde_json::Value) -> Result<Self, AgentError> {
        let request: ServiceRequest = serde_json::from_value(value.clone())?;
        if request.workflow.id.is_empty() {
            return Err(AgentError::WorkflowError(
                "desired document has an empty workflow id".to_string(),
            ));
        }
        Ok(request)
    }

    /// The effective action, with legacy phase actions flattened.
    pub fn action(&self) -> UpdateAction {
        self.workflow.action.normalize()
    }
}

/// Identity of an update in the service catalog.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateId {
    pub provider: String,
    pub name: String,
    pub version: String,
}

/// One step of the manifest's instruction list.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestStep {
    #[serde(rename = "type", default)]
    pub step_type: Option<String>,

    /// Handler update-type for this step; falls back to the manifest's
    /// top-level update type when absent.
    #[serde(default)]
    pub handler: Option<String>,

    #[serde(default)]
    pub files: Vec<String>,

    #[serde(default)]
    pub handler_properties: Option<serde_json::Value>,
}

impl ManifestStep {
    /// Step-local installed criteria from handler properties, if any.
    pub fn installed_criteria(&self) -> Option<&str> {
        self.handler_properties
            .as_ref()
            .and_then(|p| p.get("installedCriteria"))
            .and_then(|v| v.as_str())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Instructions {
    #[serde(default)]
    pub steps: Vec<ManifestStep>,
}

/// The update manifest embedded in a desired document.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateManifest {
    #[serde(default)]
    pub update_id: Option<UpdateId>,

    pub update_type: String,

    #[serde(default)]
    pub installed_criteria: Option<String>,

    #[serde(default)]
    pub instructions: Option<Instructions>,

    /// File metadata keyed by file id; opaque to the engine.
    #[serde(default)]
    pub files: Option<serde_json::Value>,
}

impl UpdateManifest {
    /// Parse the manifest from the embedded JSON string.
    pub fn from_json(manifest: &str) -> Result<Self, AgentError> {
        let parsed: UpdateManifest = serde_json::from_str(manifest)?;
        if parsed.update_type.is_empty() {
            return Err(AgentError::WorkflowError(
                "update manifest has an empty updateType".to_string(),
            ));
        }
        Ok(parsed)
    }

    pub fn steps(&self) -> &[ManifestStep] {
        self.instructions
            .as_ref()
            .map(|i| i.steps.as_slice())
            .unwrap_or(&[])
    }

    /// The installed criteria for the deployment: the manifest-level value,
    /// or the first step's handler property.
    pub fn effective_installed_criteria(&self) -> Option<&str> {
        self.installed_criteria
            .as_deref()
            .filter(|s| !s.is_empty())
            .or_else(|| self.steps().iter().find_map(|s| s.installed_criteria()))
    }
}
