//! Workflow object: the parsed manifest tree for one deployment

use std::path::{Path, PathBuf};

use crate::model::action::UpdateAction;
use crate::model::desired::{ServiceRequest, UpdateManifest};
use crate::model::result::UpdateResult;
use crate::model::state::UpdateState;

/// One child step of a workflow, typically one handler operation on one
/// content artifact. Steps are addressed by zero-based index.
#[derive(Debug, Clone)]
pub struct Step {
    /// Handler update-type for this step
    pub handler: String,

    /// File ids this step consumes
    pub files: Vec<String>,

    /// Step-local installed criteria override
    pub installed_criteria: Option<String>,

    /// Result of the most recent phase run against this step
    pub result: Option<UpdateResult>,
}

/// The root workflow for one deployment.
///
/// Owns its working directory for the lifetime of the deployment and holds
/// the mutable per-node state the engine drives. Children are referenced by
/// index only.
#[derive(Debug, Clone)]
pub struct Workflow {
    id: String,
    retry_timestamp: Option<String>,
    update_type: String,
    installed_criteria: String,
    work_folder: PathBuf,
    current_action: UpdateAction,
    last_reported_state: UpdateState,
    result: UpdateResult,
    cancel_requested: bool,
    current_step: usize,
    steps: Vec<Step>,
}

impl Workflow {
    /// Build a workflow from an accepted deployment request and its parsed
    /// manifest.
    pub fn from_request(
        request: &ServiceRequest,
        manifest: &UpdateManifest,
        work_folder: PathBuf,
    ) -> Self {
        let steps = manifest
            .steps()
            .iter()
            .map(|step| Step {
                handler: step
                    .handler
                    .clone()
                    .unwrap_or_else(|| manifest.update_type.clone()),
                files: step.files.clone(),
                installed_criteria: step.installed_criteria().map(str::to_string),
                result: None,
            })
            .collect();

        Self {
            id: request.workflow.id.clone(),
            retry_timestamp: request.workflow.retry_timestamp.clone(),
            update_type: manifest.update_type.clone(),
            installed_criteria: manifest
                .effective_installed_criteria()
                .unwrap_or_default()
                .to_string(),
            work_folder,
            current_action: request.action(),
            last_reported_state: UpdateState::Idle,
            result: UpdateResult::default(),
            cancel_requested: false,
            current_step: 0,
            steps,
        }
    }

    /// Rehydrate a workflow from a persisted record. Step state is not
    /// persisted; the record's reporting document carries the step results.
    pub fn from_persisted(
        id: String,
        retry_timestamp: Option<String>,
        update_type: String,
        installed_criteria: String,
        work_folder: PathBuf,
        last_reported_state: UpdateState,
    ) -> Self {
        Self {
            id,
            retry_timestamp,
            update_type,
            installed_criteria,
            work_folder,
            current_action: UpdateAction::ApplyDeployment,
            last_reported_state,
            result: UpdateResult::default(),
            cancel_requested: false,
            current_step: 0,
            steps: Vec::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn retry_timestamp(&self) -> Option<&str> {
        self.retry_timestamp.as_deref()
    }

    pub fn update_type(&self) -> &str {
        &self.update_type
    }

    pub fn installed_criteria(&self) -> &str {
        &self.installed_criteria
    }

    pub fn work_folder(&self) -> &Path {
        &self.work_folder
    }

    pub fn current_action(&self) -> UpdateAction {
        self.current_action
    }

    pub fn last_reported_state(&self) -> UpdateState {
        self.last_reported_state
    }

    pub fn set_last_reported_state(&mut self, state: UpdateState) {
        self.last_reported_state = state;
    }

    pub fn result(&self) -> &UpdateResult {
        &self.result
    }

    pub fn set_result(&mut self, result: UpdateResult) {
        self.result = result;
    }

    pub fn request_cancel(&mut self) {
        self.cancel_requested = true;
    }

    pub fn cancel_requested(&self) -> bool {
        self.cancel_requested
    }

    pub fn current_step(&self) -> usize {
        self.current_step
    }

    pub fn set_current_step(&mut self, index: usize) {
        self.current_step = index;
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub fn set_step_result(&mut self, index: usize, result: UpdateResult) {
        if let Some(step) = self.steps.get_mut(index) {
            step.result = Some(result);
        }
    }

    /// Drop all step results. Each phase records fresh results for the
    /// steps it actually reaches, so a step skipped after a failure
    /// carries no stale result from an earlier phase.
    pub fn clear_step_results(&mut self) {
        for step in &mut self.steps {
            step.result = None;
        }
    }

    /// Whether this workflow matches an incoming `(id, retryTimestamp)` pair.
    pub fn matches(&self, id: &str, retry_timestamp: Option<&str>) -> bool {
        self.id == id && self.retry_timestamp.as_deref() == retry_timestamp
    }

    /// Whether any step (or the root, for a stepless workflow) requested a
    /// device reboot during apply.
    pub fn reboot_requested(&self) -> bool {
        self.result.requires_reboot() || self.steps.iter().any(|s| {
            s.result
                .as_ref()
                .map(UpdateResult::requires_reboot)
                .unwrap_or(false)
        })
    }

    /// Whether any step (or the root) requested an agent restart during apply.
    pub fn agent_restart_requested(&self) -> bool {
        self.result.requires_agent_restart() || self.steps.iter().any(|s| {
            s.result
                .as_ref()
                .map(UpdateResult::requires_agent_restart)
                .unwrap_or(false)
        })
    }

    /// Aggregate step results into the root result: the first failing
    /// step's codes, or the last run step's codes when all succeeded.
    pub fn aggregate_result(&self) -> UpdateResult {
        let run: Vec<&UpdateResult> = self
            .steps
            .iter()
            .filter_map(|s| s.result.as_ref())
            .collect();

        if run.is_empty() {
            return self.result.clone();
        }

        if let Some(failed) = run.iter().find(|r| r.is_failure()) {
            return (*failed).clone();
        }

        run.last()
            .map(|r| (*r).clone())
            .unwrap_or_else(|| self.result.clone())
    }
}
