//! Deployment workflow engine
//!
//! The state machine at the heart of the agent. It ingests desired update
//! actions from the twin channel, drives the content handler through the
//! download, install and apply phases, persists state around reboots, and
//! reports progress and terminal results.
//!
//! The engine is owned by a single task; desired-property events and work
//! ticks are delivered to it one at a time in arrival order. Handler
//! operations are expected to be short or to return an in-progress code,
//! so every `do_work` tick stays bounded.

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::capabilities::Capabilities;
use crate::filesys::dir::Dir;
use crate::handlers::{ContentHandler, HandlerRegistry};
use crate::model::action::UpdateAction;
use crate::model::desired::{ServiceRequest, UpdateManifest};
use crate::model::result::{code, erc, UpdateResult};
use crate::model::state::UpdateState;
use crate::storage::layout::StorageLayout;
use crate::storage::settings::Settings;
use crate::twin::{self, startup, TwinChannel};
use crate::workflow::object::Workflow;
use crate::workflow::orchestration::{self, AdoptDecision, CompletedDeployment};
use crate::workflow::persistence::{PersistedWorkflow, PersistenceStore};
use crate::workflow::report;

/// One long-running phase of a deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Download,
    Install,
    Apply,
}

impl Phase {
    fn started_state(&self) -> UpdateState {
        match self {
            Phase::Download => UpdateState::DownloadStarted,
            Phase::Install => UpdateState::InstallStarted,
            Phase::Apply => UpdateState::ApplyStarted,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Phase::Download => "download",
            Phase::Install => "install",
            Phase::Apply => "apply",
        }
    }

    /// Result codes this phase may legitimately return.
    fn recognizes(&self, result_code: i32) -> bool {
        match self {
            Phase::Download => matches!(
                result_code,
                code::DOWNLOAD_SUCCESS | code::DOWNLOAD_IN_PROGRESS | code::DOWNLOAD_SKIPPED
            ),
            Phase::Install => matches!(
                result_code,
                code::INSTALL_SUCCESS | code::INSTALL_IN_PROGRESS | code::INSTALL_SKIPPED
            ),
            Phase::Apply => matches!(
                result_code,
                code::APPLY_SUCCESS
                    | code::APPLY_IN_PROGRESS
                    | code::APPLY_SUCCESS_REBOOT_REQUIRED
                    | code::APPLY_SUCCESS_AGENT_RESTART_REQUIRED
            ),
        }
    }
}

/// Kind of restart an apply result requested.
#[derive(Debug, Clone, Copy)]
enum RestartKind {
    Reboot,
    Agent,
}

impl RestartKind {
    fn failure_code(&self) -> i32 {
        match self {
            RestartKind::Reboot => erc::REBOOT_FAILED,
            RestartKind::Agent => erc::AGENT_RESTART_FAILED,
        }
    }
}

impl std::fmt::Display for RestartKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RestartKind::Reboot => write!(f, "reboot"),
            RestartKind::Agent => write!(f, "agent restart"),
        }
    }
}

/// Side effect applied once a reported document is accepted by the
/// transport. Keeps state advancement tied to successful delivery: a
/// failed send is retried on the next tick and mutates nothing.
enum ReportEffect {
    None,
    SetState(UpdateState),
    Complete(CompletedDeployment),
}

struct OutboundReport {
    payload: Vec<u8>,
    effect: ReportEffect,
}

/// The deployment workflow engine.
pub struct WorkflowEngine {
    twin: Arc<dyn TwinChannel>,
    registry: HandlerRegistry,
    capabilities: Capabilities,
    settings: Settings,
    layout: StorageLayout,
    store: PersistenceStore,
    workflow: Option<Workflow>,
    handler: Option<Box<dyn ContentHandler>>,
    last_completed: Option<CompletedDeployment>,
    outbox: VecDeque<OutboundReport>,
}

impl WorkflowEngine {
    pub fn new(
        twin: Arc<dyn TwinChannel>,
        registry: HandlerRegistry,
        capabilities: Capabilities,
        settings: Settings,
        layout: StorageLayout,
    ) -> Self {
        let store = PersistenceStore::new(layout.persistence_file());
        Self {
            twin,
            registry,
            capabilities,
            settings,
            layout,
            store,
            workflow: None,
            handler: None,
            last_completed: None,
            outbox: VecDeque::new(),
        }
    }

    /// The active workflow, if a deployment is in flight.
    pub fn active_workflow(&self) -> Option<&Workflow> {
        self.workflow.as_ref()
    }

    /// The last deployment that reached a terminal state.
    pub fn last_completed(&self) -> Option<&CompletedDeployment> {
        self.last_completed.as_ref()
    }

    // ------------------------------------------------------------------
    // Exposed operations, called by the twin transport glue
    // ------------------------------------------------------------------

    /// Invoked once the transport is ready. Resumes a persisted workflow
    /// if one survived a restart, then emits the startup report.
    pub async fn on_connected(&mut self) {
        info!("Twin transport connected");

        if let Some(workflow) = self.workflow.as_ref() {
            // Reconnect mid-deployment: re-report the in-flight state with
            // the startup message merged in. Delivery is at-least-once, so
            // repeating the current state is safe.
            let mut doc = report::reporting_value(
                Some(workflow),
                workflow.last_reported_state(),
                None,
                None,
            );
            startup::merge_into(&mut doc, &startup::startup_message(&self.settings));
            self.send_report(doc, ReportEffect::None).await;
            return;
        }

        match self.store.load().await {
            Ok(Some(record)) => self.resume_persisted(record).await,
            Ok(None) => self.report_startup_idle(None).await,
            Err(e) => {
                error!("Discarding unusable workflow record: {}", e);
                if let Err(e) = self.store.remove().await {
                    warn!("Failed to remove workflow record: {}", e);
                }
                let result = UpdateResult::failure(
                    erc::PERSISTENCE_CORRUPT,
                    "persisted workflow record could not be restored",
                );
                self.report_startup_idle(Some(result)).await;
            }
        }
    }

    /// Ingest a desired-property document from the service.
    pub async fn on_desired_property(&mut self, value: Value, version: i64) {
        debug!("Desired property update, version {}", version);

        let request = match ServiceRequest::from_value(&value) {
            Ok(request) => request,
            Err(e) => {
                warn!("Malformed desired document (version {}): {}", version, e);
                self.send_ack(&value, twin::ACK_STATUS_BAD_REQUEST, version).await;
                return;
            }
        };

        match request.action() {
            UpdateAction::Cancel => {
                self.send_ack(&value, twin::ACK_STATUS_SUCCESS, version).await;
                self.handle_cancel_request(&request).await;
            }
            UpdateAction::ApplyDeployment => {
                let manifest = match request
                    .update_manifest
                    .as_deref()
                    .ok_or_else(|| "desired document has no updateManifest".to_string())
                    .and_then(|m| UpdateManifest::from_json(m).map_err(|e| e.to_string()))
                {
                    Ok(manifest) => manifest,
                    Err(e) => {
                        warn!(
                            "Rejecting deployment '{}': {}",
                            request.workflow.id, e
                        );
                        self.send_ack(&value, twin::ACK_STATUS_BAD_REQUEST, version).await;
                        return;
                    }
                };

                self.send_ack(&value, twin::ACK_STATUS_SUCCESS, version).await;
                self.handle_deployment(&request, manifest).await;
            }
            other => {
                // normalize() folds the legacy phase actions away
                warn!("Unexpected update action {:?}, ignoring", other);
            }
        }
    }

    /// Cooperative tick from the host loop; advances at most one phase
    /// step.
    pub async fn do_work(&mut self) {
        if !self.flush_outbox().await {
            return;
        }

        let Some(workflow) = self.workflow.as_ref() else {
            return;
        };

        if workflow.cancel_requested() {
            self.process_cancel().await;
            return;
        }

        match workflow.last_reported_state() {
            UpdateState::DeploymentInProgress => self.begin_phase(Phase::Download).await,
            UpdateState::DownloadStarted => self.continue_phase(Phase::Download).await,
            UpdateState::DownloadSucceeded => self.begin_phase(Phase::Install).await,
            UpdateState::InstallStarted => self.continue_phase(Phase::Install).await,
            UpdateState::InstallSucceeded => self.begin_phase(Phase::Apply).await,
            UpdateState::ApplyStarted => self.continue_phase(Phase::Apply).await,
            UpdateState::Idle | UpdateState::Failed => {}
        }
    }

    /// Best-effort shutdown: flush what can be flushed and release the
    /// handler. Persistence guarantees resume for restart-phase workflows.
    pub async fn on_destroy(&mut self) {
        info!("Update agent stopping");
        let _ = self.flush_outbox().await;
        self.handler = None;
    }

    // ------------------------------------------------------------------
    // Startup and resume
    // ------------------------------------------------------------------

    async fn report_startup_idle(&mut self, failure: Option<UpdateResult>) {
        let result = failure.unwrap_or_default();
        let mut doc = report::reporting_value(None, UpdateState::Idle, Some(&result), None);
        startup::merge_into(&mut doc, &startup::startup_message(&self.settings));
        self.send_report(doc, ReportEffect::None).await;
    }

    async fn resume_persisted(&mut self, record: PersistedWorkflow) {
        info!(
            "Resuming workflow '{}' persisted at {}",
            record.workflow_id, record.persisted_at
        );

        let workflow = Workflow::from_persisted(
            record.workflow_id.clone(),
            record.retry_timestamp.clone(),
            record.update_type.clone(),
            record.installed_criteria.clone(),
            record.work_folder.clone(),
            record.last_reported_state,
        );
        self.workflow = Some(workflow);
        self.handler = None;

        let verification = match self.ensure_handler() {
            Ok(()) => {
                let (Some(handler), Some(workflow)) = (&self.handler, &self.workflow) else {
                    return;
                };
                handler.is_installed(workflow).await
            }
            Err(failure) => failure,
        };

        if verification.code == code::IS_INSTALLED_INSTALLED {
            info!(
                "Workflow '{}' verified installed after restart",
                record.workflow_id
            );
            let result = UpdateResult::success(code::APPLY_SUCCESS);
            let mut doc = match report::startup_value(&record.reporting_json, &result) {
                Ok(doc) => doc,
                Err(e) => {
                    warn!("Persisted reporting document unusable, rebuilding: {}", e);
                    report::reporting_value(
                        self.workflow.as_ref(),
                        UpdateState::Idle,
                        Some(&result),
                        Some(&record.installed_criteria),
                    )
                }
            };
            startup::merge_into(&mut doc, &startup::startup_message(&self.settings));
            let completed = CompletedDeployment {
                id: record.workflow_id,
                retry_timestamp: record.retry_timestamp,
                state: UpdateState::Idle,
                result,
                installed_update_id: Some(record.installed_criteria),
                reported_doc: doc.clone(),
            };
            self.send_report(doc, ReportEffect::Complete(completed)).await;
        } else {
            error!(
                "Workflow '{}' not installed after restart (verification code {})",
                record.workflow_id, verification.code
            );
            let result = UpdateResult::failure(
                erc::BOOT_VALIDATION_FAILED,
                verification
                    .details
                    .unwrap_or_else(|| "update not installed after restart".to_string()),
            );
            if let Some(workflow) = self.workflow.as_mut() {
                workflow.set_result(result.clone());
            }
            let mut doc = report::reporting_value(
                self.workflow.as_ref(),
                UpdateState::Failed,
                Some(&result),
                None,
            );
            startup::merge_into(&mut doc, &startup::startup_message(&self.settings));
            let completed = CompletedDeployment {
                id: record.workflow_id,
                retry_timestamp: record.retry_timestamp,
                state: UpdateState::Failed,
                result,
                installed_update_id: None,
                reported_doc: doc.clone(),
            };
            self.send_report(doc, ReportEffect::Complete(completed)).await;
        }
    }

    // ------------------------------------------------------------------
    // Action resolution
    // ------------------------------------------------------------------

    async fn handle_cancel_request(&mut self, request: &ServiceRequest) {
        match self.workflow.as_mut() {
            Some(workflow) if workflow.id() == request.workflow.id => {
                info!("Cancel requested for workflow '{}'", request.workflow.id);
                workflow.request_cancel();
            }
            Some(workflow) => {
                warn!(
                    "Cancel for workflow '{}' does not match active '{}', ignoring",
                    request.workflow.id,
                    workflow.id()
                );
            }
            None => {
                info!("Cancel received with no deployment in flight, reporting idle");
                let result = UpdateResult {
                    code: code::CANCEL_NOT_STARTED,
                    extended_code: erc::NONE,
                    details: Some("no deployment in progress".to_string()),
                };
                let doc = report::idle_answer_value(&request.workflow, &result);
                self.send_report(doc, ReportEffect::None).await;
            }
        }
    }

    async fn handle_deployment(&mut self, request: &ServiceRequest, manifest: UpdateManifest) {
        let id = request.workflow.id.as_str();
        let retry = request.workflow.retry_timestamp.as_deref();

        match orchestration::adopt_decision(
            self.workflow.as_ref(),
            self.last_completed.as_ref(),
            id,
            retry,
        ) {
            AdoptDecision::DuplicateInFlight => {
                debug!("Deployment '{}' already in flight, ignoring redelivery", id);
            }
            AdoptDecision::ReplayTerminal => {
                info!(
                    "Replay of completed deployment '{}', re-reporting terminal outcome",
                    id
                );
                if let Some(completed) = self.last_completed.as_ref() {
                    let doc = completed.reported_doc.clone();
                    self.send_report(doc, ReportEffect::None).await;
                }
            }
            AdoptDecision::RejectConflict => {
                let active = self
                    .workflow
                    .as_ref()
                    .map(|w| w.id().to_string())
                    .unwrap_or_default();
                error!(
                    "Rejecting deployment '{}': workflow '{}' is still in progress",
                    id, active
                );
                let result = UpdateResult::failure(
                    erc::WORKFLOW_CONFLICT,
                    format!("deployment '{}' is still in progress", active),
                );
                let state = self
                    .workflow
                    .as_ref()
                    .map(|w| w.last_reported_state())
                    .unwrap_or(UpdateState::Idle);
                let doc =
                    report::reporting_value(self.workflow.as_ref(), state, Some(&result), None);
                self.send_report(doc, ReportEffect::None).await;
            }
            AdoptDecision::AdoptNew => self.adopt(request, manifest).await,
        }
    }

    async fn adopt(&mut self, request: &ServiceRequest, manifest: UpdateManifest) {
        info!(
            "Adopting deployment '{}' (updateType '{}', {} steps)",
            request.workflow.id,
            manifest.update_type,
            manifest.steps().len()
        );

        let work_folder = self.layout.work_folder(&request.workflow.id);
        let workflow =
            Workflow::from_request(request, &manifest, work_folder.path().to_path_buf());
        self.workflow = Some(workflow);
        self.handler = None;

        if let Err(e) = work_folder.create().await {
            error!("Failed to create work folder {:?}: {}", work_folder.path(), e);
            let result = UpdateResult::failure(
                erc::WORK_FOLDER_FAILED,
                format!("cannot create work folder: {}", e),
            );
            self.complete(UpdateState::Failed, result, None).await;
            return;
        }

        // DeploymentInProgress is reported exactly once on adoption; the
        // download phase entry follows on the next tick.
        let result = UpdateResult::success(code::DEPLOYMENT_IN_PROGRESS_SUCCESS);
        if let Some(workflow) = self.workflow.as_mut() {
            workflow.set_result(result.clone());
        }
        let doc = report::reporting_value(
            self.workflow.as_ref(),
            UpdateState::DeploymentInProgress,
            Some(&result),
            None,
        );
        self.send_report(doc, ReportEffect::SetState(UpdateState::DeploymentInProgress))
            .await;
    }

    // ------------------------------------------------------------------
    // Phase driving
    // ------------------------------------------------------------------

    async fn begin_phase(&mut self, phase: Phase) {
        let Some(workflow) = self.workflow.as_ref() else {
            return;
        };
        let started = phase.started_state();
        debug!("Entering {} phase for workflow '{}'", phase.name(), workflow.id());

        if orchestration::should_report(workflow.last_reported_state(), started) {
            let doc = report::reporting_value(Some(workflow), started, None, None);
            if !self.send_report(doc, ReportEffect::SetState(started)).await {
                return;
            }
        }

        self.continue_phase(phase).await;
    }

    async fn continue_phase(&mut self, phase: Phase) {
        let outcome = self.run_phase(phase).await;

        if outcome.is_in_progress() {
            debug!("{} phase in progress", phase.name());
            return;
        }

        if outcome.is_cancelled() {
            self.process_cancel().await;
            return;
        }

        if outcome.is_failure() {
            // run_phase returns the first failing step's result, so the
            // outcome already is the aggregate the root must carry.
            error!(
                "{} phase failed: code {}, extended {:#010x}",
                phase.name(),
                outcome.code,
                outcome.extended_code
            );
            self.complete(UpdateState::Failed, outcome, None).await;
            return;
        }

        match phase {
            Phase::Download | Phase::Install => {
                let succeeded = match phase {
                    Phase::Download => UpdateState::DownloadSucceeded,
                    _ => UpdateState::InstallSucceeded,
                };
                info!("{} phase succeeded", phase.name());
                let Some(workflow) = self.workflow.as_ref() else {
                    return;
                };
                let doc = report::reporting_value(Some(workflow), succeeded, None, None);
                self.send_report(doc, ReportEffect::SetState(succeeded)).await;
            }
            Phase::Apply => self.finish_apply().await,
        }
    }

    /// Run one bounded slice of a phase: the remaining steps in order, or
    /// the root operation for a stepless workflow. Returns an in-progress
    /// result when the handler parked the current step.
    async fn run_phase(&mut self, phase: Phase) -> UpdateResult {
        if let Err(failure) = self.ensure_handler() {
            return failure;
        }

        let step_count = self.workflow.as_ref().map(|w| w.steps().len()).unwrap_or(0);

        if step_count == 0 {
            let (Some(handler), Some(workflow)) = (self.handler.as_mut(), self.workflow.as_ref())
            else {
                return UpdateResult::failure(erc::NONE, "no workflow");
            };
            let result = dispatch(handler.as_mut(), phase, workflow).await;
            let result = normalize_handler_result(phase, result);
            if let Some(workflow) = self.workflow.as_mut() {
                if !result.is_in_progress() {
                    workflow.set_result(result.clone());
                }
            }
            return result;
        }

        let start = self
            .workflow
            .as_ref()
            .map(Workflow::current_step)
            .unwrap_or(0);

        if start == 0 {
            // Fresh phase entry: results from the previous phase are
            // superseded step by step as this phase reaches them.
            if let Some(workflow) = self.workflow.as_mut() {
                workflow.clear_step_results();
            }
        }

        for index in start..step_count {
            let cancel = self
                .workflow
                .as_ref()
                .map(Workflow::cancel_requested)
                .unwrap_or(false);
            if cancel {
                return UpdateResult::cancelled(format!(
                    "cancelled during {} at step {}",
                    phase.name(),
                    index
                ));
            }

            if let Some(workflow) = self.workflow.as_mut() {
                workflow.set_current_step(index);
            }

            let (Some(handler), Some(workflow)) = (self.handler.as_mut(), self.workflow.as_ref())
            else {
                return UpdateResult::failure(erc::NONE, "no workflow");
            };
            let result = dispatch(handler.as_mut(), phase, workflow).await;
            let result = normalize_handler_result(phase, result);

            if result.is_in_progress() {
                // The same step is polled again on the next tick.
                return result;
            }

            if let Some(workflow) = self.workflow.as_mut() {
                workflow.set_step_result(index, result.clone());
            }

            if result.is_failure() {
                return result;
            }
        }

        if let Some(workflow) = self.workflow.as_mut() {
            workflow.set_current_step(0);
            let aggregate = workflow.aggregate_result();
            workflow.set_result(aggregate.clone());
            aggregate
        } else {
            UpdateResult::failure(erc::NONE, "no workflow")
        }
    }

    async fn finish_apply(&mut self) {
        let Some(workflow) = self.workflow.as_ref() else {
            return;
        };

        if workflow.reboot_requested() {
            self.suspend_for(RestartKind::Reboot).await;
        } else if workflow.agent_restart_requested() {
            self.suspend_for(RestartKind::Agent).await;
        } else {
            info!("apply phase succeeded");
            let result = workflow.aggregate_result();
            let installed = workflow.installed_criteria().to_string();
            self.complete(UpdateState::Idle, result, Some(installed)).await;
        }
    }

    /// Persist the workflow, then hand control to the platform. The
    /// deployment concludes after the restart, when `on_connected` verifies
    /// the installed criteria.
    async fn suspend_for(&mut self, kind: RestartKind) {
        let Some(workflow) = self.workflow.as_ref() else {
            return;
        };

        let installed = workflow.installed_criteria().to_string();
        let terminal_result = UpdateResult::success(code::APPLY_SUCCESS);
        let idle_doc = report::reporting_value(
            Some(workflow),
            UpdateState::Idle,
            Some(&terminal_result),
            Some(&installed),
        );

        let record = PersistedWorkflow {
            workflow_id: workflow.id().to_string(),
            retry_timestamp: workflow.retry_timestamp().map(str::to_string),
            update_type: workflow.update_type().to_string(),
            installed_criteria: installed,
            work_folder: workflow.work_folder().to_path_buf(),
            current_state: UpdateState::ApplyStarted,
            last_reported_state: workflow.last_reported_state(),
            reporting_json: idle_doc.to_string(),
            persisted_at: Utc::now(),
        };

        if let Err(e) = self.store.save(&record).await {
            error!("Failed to persist workflow before {}: {}", kind, e);
            let result = UpdateResult::failure(
                erc::PERSISTENCE_WRITE_FAILED,
                format!("cannot persist workflow before {}: {}", kind, e),
            );
            self.complete(UpdateState::Failed, result, None).await;
            return;
        }

        info!(
            "Workflow '{}' persisted, requesting {}",
            record.workflow_id, kind
        );

        let status = match kind {
            RestartKind::Reboot => (self.capabilities.reboot_system)(),
            RestartKind::Agent => (self.capabilities.restart_agent)(),
        };

        if status != 0 {
            error!("{} request failed with status {}", kind, status);
            if let Err(e) = self.store.remove().await {
                warn!("Failed to remove workflow record: {}", e);
            }
            let result = UpdateResult::failure(
                kind.failure_code(),
                format!("{} command returned {}", kind, status),
            );
            self.complete(UpdateState::Failed, result, None).await;
            return;
        }

        // The process is about to go away; the persisted record carries the
        // deployment across the restart.
        self.workflow = None;
        self.handler = None;
    }

    // ------------------------------------------------------------------
    // Cancellation
    // ------------------------------------------------------------------

    async fn process_cancel(&mut self) {
        let Some(workflow) = self.workflow.as_ref() else {
            return;
        };
        let state = workflow.last_reported_state();

        if state == UpdateState::DeploymentInProgress {
            info!(
                "Deployment '{}' cancelled before any phase began",
                workflow.id()
            );
            let result = UpdateResult {
                code: code::CANCEL_NOT_STARTED,
                extended_code: erc::NONE,
                details: Some("cancelled before download".to_string()),
            };
            self.complete(UpdateState::Idle, result, None).await;
            return;
        }

        info!("Cancelling deployment '{}' during {}", workflow.id(), state);

        if self.ensure_handler().is_ok() {
            if let (Some(handler), Some(workflow)) = (self.handler.as_mut(), self.workflow.as_ref())
            {
                let cancel_result = handler.cancel(workflow).await;
                if cancel_result.is_failure() {
                    warn!(
                        "Handler cancel failed: code {}, extended {:#010x}",
                        cancel_result.code, cancel_result.extended_code
                    );
                }
            }
        }

        let result = UpdateResult::cancelled(format!("deployment cancelled during {}", state));
        self.complete(UpdateState::Failed, result, None).await;
    }

    // ------------------------------------------------------------------
    // Completion and reporting
    // ------------------------------------------------------------------

    async fn complete(
        &mut self,
        state: UpdateState,
        result: UpdateResult,
        installed_update_id: Option<String>,
    ) {
        if let Some(workflow) = self.workflow.as_mut() {
            workflow.set_result(result.clone());
        }
        let Some(workflow) = self.workflow.as_ref() else {
            return;
        };

        let doc = report::reporting_value(
            Some(workflow),
            state,
            Some(&result),
            installed_update_id.as_deref(),
        );
        let completed = CompletedDeployment {
            id: workflow.id().to_string(),
            retry_timestamp: workflow.retry_timestamp().map(str::to_string),
            state,
            result,
            installed_update_id,
            reported_doc: doc.clone(),
        };

        self.send_report(doc, ReportEffect::Complete(completed)).await;
    }

    fn ensure_handler(&mut self) -> Result<(), UpdateResult> {
        if self.handler.is_some() {
            return Ok(());
        }

        let Some(update_type) = self.workflow.as_ref().map(|w| w.update_type().to_string())
        else {
            return Err(UpdateResult::failure(erc::NONE, "no workflow"));
        };

        match self.registry.lookup(&update_type) {
            Some(handler) => {
                debug!("Instantiated content handler for '{}'", update_type);
                self.handler = Some(handler);
                Ok(())
            }
            None => Err(UpdateResult::failure(
                erc::UNKNOWN_HANDLER,
                format!("no content handler for update type '{}'", update_type),
            )),
        }
    }

    async fn send_ack(&mut self, desired: &Value, status: u16, version: i64) {
        let reflected = orchestration::redact_ack(desired);
        let payload = twin::wrap_service_ack(&reflected, status, version)
            .to_string()
            .into_bytes();

        // Acks are not retried; the service redelivers desired state on
        // reconnect if it needs to.
        match self.twin.send_reported(&payload).await {
            Ok(code) if (200..300).contains(&code) => {}
            Ok(code) => warn!("Acknowledgement rejected with status {}", code),
            Err(e) => warn!("Failed to send acknowledgement: {}", e),
        }
    }

    /// Queue a reported document and try to drain the outbox. Returns true
    /// when the document (and everything queued before it) was delivered.
    async fn send_report(&mut self, doc: Value, effect: ReportEffect) -> bool {
        let payload = twin::wrap_agent_report(&doc).to_string().into_bytes();
        self.outbox.push_back(OutboundReport { payload, effect });
        self.flush_outbox().await
    }

    /// Drain queued reports in order. Stops at the first transport
    /// failure; the remainder is retried on the next tick.
    async fn flush_outbox(&mut self) -> bool {
        while let Some(front) = self.outbox.front() {
            match self.twin.send_reported(&front.payload).await {
                Ok(status) if (200..300).contains(&status) => {
                    if let Some(sent) = self.outbox.pop_front() {
                        self.apply_effect(sent.effect).await;
                    }
                }
                Ok(status) => {
                    warn!("Report rejected with status {}, will retry", status);
                    return false;
                }
                Err(e) => {
                    warn!("Failed to send report, will retry: {}", e);
                    return false;
                }
            }
        }
        true
    }

    async fn apply_effect(&mut self, effect: ReportEffect) {
        match effect {
            ReportEffect::None => {}
            ReportEffect::SetState(state) => {
                if let Some(workflow) = self.workflow.as_mut() {
                    workflow.set_last_reported_state(state);
                }
            }
            ReportEffect::Complete(completed) => {
                if let Some(workflow) = self.workflow.take() {
                    let folder = Dir::new(workflow.work_folder());
                    if let Err(e) = folder.delete().await {
                        warn!(
                            "Failed to remove work folder {:?}: {}",
                            workflow.work_folder(),
                            e
                        );
                    }
                }
                self.handler = None;
                if let Err(e) = self.store.remove().await {
                    warn!("Failed to remove workflow record: {}", e);
                }
                info!(
                    "Deployment '{}' finished with state {}",
                    completed.id, completed.state
                );
                self.last_completed = Some(completed);
            }
        }
    }
}

async fn dispatch(
    handler: &mut dyn ContentHandler,
    phase: Phase,
    workflow: &Workflow,
) -> UpdateResult {
    match phase {
        Phase::Download => handler.download(workflow).await,
        Phase::Install => handler.install(workflow).await,
        Phase::Apply => handler.apply(workflow).await,
    }
}

/// Coerce unrecognized handler result codes to failure, preserving the
/// extended result code verbatim.
fn normalize_handler_result(phase: Phase, result: UpdateResult) -> UpdateResult {
    if result.is_failure() || phase.recognizes(result.code) {
        return result;
    }

    warn!(
        "Handler returned unrecognized {} result code {}, treating as failure",
        phase.name(),
        result.code
    );
    UpdateResult {
        code: code::FAILURE,
        extended_code: result.extended_code,
        details: result
            .details
            .or_else(|| Some(format!("unrecognized {} result code", phase.name()))),
    }
}
