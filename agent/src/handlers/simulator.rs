//! Simulator content handler
//!
//! A built-in handler whose per-phase results are scriptable. Used for
//! end-to-end dry runs and by the agent's own tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tracing::info;

use crate::handlers::{ContentHandler, HandlerFactory};
use crate::model::result::{code, UpdateResult};
use crate::workflow::object::Workflow;

/// Update type the simulator registers under
pub const SIMULATOR_UPDATE_TYPE: &str = "sim/noop:1";

/// Shared simulator state, surviving handler re-instantiation.
///
/// The installed flag outlives individual handler instances so that a
/// deployment resumed after a simulated reboot can verify its outcome.
#[derive(Default)]
pub struct SimulatorState {
    installed: AtomicBool,
    download_results: Mutex<VecDeque<UpdateResult>>,
    install_results: Mutex<VecDeque<UpdateResult>>,
    apply_results: Mutex<VecDeque<UpdateResult>>,
    cancel_results: Mutex<VecDeque<UpdateResult>>,
}

impl SimulatorState {
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Queue a result returned by the next download call
    pub fn script_download(&self, result: UpdateResult) {
        self.download_results
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(result);
    }

    /// Queue a result returned by the next install call
    pub fn script_install(&self, result: UpdateResult) {
        self.install_results
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(result);
    }

    /// Queue a result returned by the next apply call
    pub fn script_apply(&self, result: UpdateResult) {
        self.apply_results
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(result);
    }

    /// Queue a result returned by the next cancel call
    pub fn script_cancel(&self, result: UpdateResult) {
        self.cancel_results
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(result);
    }

    pub fn set_installed(&self, installed: bool) {
        self.installed.store(installed, Ordering::SeqCst);
    }

    pub fn is_installed(&self) -> bool {
        self.installed.load(Ordering::SeqCst)
    }

    fn next(queue: &Mutex<VecDeque<UpdateResult>>, default_code: i32) -> UpdateResult {
        queue
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
            .unwrap_or_else(|| UpdateResult::success(default_code))
    }
}

/// The simulator handler. Performs no real work; each phase returns the
/// next scripted result, defaulting to the phase's success code.
pub struct SimulatorHandler {
    state: Arc<SimulatorState>,
}

impl SimulatorHandler {
    pub fn new(state: Arc<SimulatorState>) -> Self {
        Self { state }
    }
}

/// Factory registering the simulator against a shared state
pub fn factory(state: Arc<SimulatorState>) -> HandlerFactory {
    Box::new(move || Box::new(SimulatorHandler::new(state.clone())))
}

#[async_trait]
impl ContentHandler for SimulatorHandler {
    async fn download(&mut self, workflow: &Workflow) -> UpdateResult {
        info!(
            "Simulating download for '{}' into {:?}",
            workflow.id(),
            workflow.work_folder()
        );
        SimulatorState::next(&self.state.download_results, code::DOWNLOAD_SUCCESS)
    }

    async fn install(&mut self, workflow: &Workflow) -> UpdateResult {
        info!("Simulating install for '{}'", workflow.id());
        SimulatorState::next(&self.state.install_results, code::INSTALL_SUCCESS)
    }

    async fn apply(&mut self, workflow: &Workflow) -> UpdateResult {
        info!("Simulating apply for '{}'", workflow.id());
        let result = SimulatorState::next(&self.state.apply_results, code::APPLY_SUCCESS);
        if result.is_success() {
            self.state.set_installed(true);
        }
        result
    }

    async fn cancel(&mut self, workflow: &Workflow) -> UpdateResult {
        info!("Simulating cancel for '{}'", workflow.id());
        SimulatorState::next(&self.state.cancel_results, code::CANCEL_SUCCESS)
    }

    async fn is_installed(&self, workflow: &Workflow) -> UpdateResult {
        if self.state.is_installed() {
            UpdateResult::success(code::IS_INSTALLED_INSTALLED)
        } else {
            let mut result = UpdateResult::success(code::IS_INSTALLED_NOT_INSTALLED);
            result.details = Some(format!(
                "installed criteria '{}' does not hold",
                workflow.installed_criteria()
            ));
            result
        }
    }
}
