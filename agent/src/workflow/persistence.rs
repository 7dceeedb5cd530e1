//! Cross-restart persistence of in-flight workflows
//!
//! A single record is written (atomically, temp file + rename) before any
//! operation that may be interrupted by a reboot or agent restart, and
//! removed on terminal transition. On startup the engine loads it to
//! resume the deployment.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::AgentError;
use crate::filesys::file::File;
use crate::model::state::UpdateState;

/// Snapshot of a workflow sufficient to resume it after a restart.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedWorkflow {
    pub workflow_id: String,

    #[serde(default)]
    pub retry_timestamp: Option<String>,

    pub update_type: String,

    pub installed_criteria: String,

    pub work_folder: PathBuf,

    /// State the machine was in when the record was written
    pub current_state: UpdateState,

    /// Last state reported to the service
    pub last_reported_state: UpdateState,

    /// Reported document to reuse for the startup-idle report
    pub reporting_json: String,

    pub persisted_at: DateTime<Utc>,
}

/// Single-writer store for the persisted workflow record.
#[derive(Debug, Clone)]
pub struct PersistenceStore {
    file: File,
}

impl PersistenceStore {
    pub fn new(file: File) -> Self {
        Self { file }
    }

    /// Write the record atomically.
    pub async fn save(&self, record: &PersistedWorkflow) -> Result<(), AgentError> {
        self.file.write_json_atomic(record).await
    }

    /// Load the record. `Ok(None)` when no record exists; an error when a
    /// record exists but cannot be restored.
    pub async fn load(&self) -> Result<Option<PersistedWorkflow>, AgentError> {
        if !self.file.exists().await {
            return Ok(None);
        }

        match self.file.read_json::<PersistedWorkflow>().await {
            Ok(record) => Ok(Some(record)),
            Err(e) => Err(AgentError::PersistenceError(format!(
                "unreadable workflow record: {}",
                e
            ))),
        }
    }

    /// Remove the record if present.
    pub async fn remove(&self) -> Result<(), AgentError> {
        self.file.delete().await
    }

    /// Whether a record exists on disk.
    pub async fn exists(&self) -> bool {
        self.file.exists().await
    }
}
