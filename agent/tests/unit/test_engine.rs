//! Workflow engine end-to-end tests
//!
//! Drives the engine directly (events and ticks in order, as the engine
//! worker would) against a recording twin channel and the simulator
//! handler.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{json, Value};

use otagent::capabilities::Capabilities;
use otagent::errors::AgentError;
use otagent::filesys::dir::Dir;
use otagent::handlers::simulator::{self, SimulatorState, SIMULATOR_UPDATE_TYPE};
use otagent::handlers::HandlerRegistry;
use otagent::model::result::{code, erc, extended_code, facility, UpdateResult};
use otagent::model::state::UpdateState;
use otagent::storage::layout::StorageLayout;
use otagent::storage::settings::Settings;
use otagent::twin::TwinChannel;
use otagent::workflow::engine::WorkflowEngine;

// ---------------------------------------------------------------------
// Test doubles
// ---------------------------------------------------------------------

/// Twin channel recording every send with the status it resolved to.
#[derive(Default)]
struct RecordingTwin {
    sent: Mutex<Vec<(u16, Value)>>,
    responses: Mutex<VecDeque<u16>>,
}

impl RecordingTwin {
    /// Script the status returned for the next send.
    fn respond_next(&self, status: u16) {
        self.responses.lock().unwrap().push_back(status);
    }

    /// Delivered agent documents, in order.
    fn agent_docs(&self) -> Vec<Value> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|(status, _)| (200..300).contains(status))
            .filter_map(|(_, value)| value.pointer("/deviceUpdate/agent").cloned())
            .collect()
    }

    /// Delivered acknowledgements, in order.
    fn acks(&self) -> Vec<Value> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|(status, _)| (200..300).contains(status))
            .filter_map(|(_, value)| value.pointer("/deviceUpdate/service").cloned())
            .collect()
    }

    /// Reported state values, in order.
    fn states(&self) -> Vec<i64> {
        self.agent_docs()
            .iter()
            .filter_map(|doc| doc.get("state").and_then(Value::as_i64))
            .collect()
    }

    fn last_agent_doc(&self) -> Value {
        self.agent_docs().last().cloned().expect("no agent document sent")
    }
}

#[async_trait]
impl TwinChannel for RecordingTwin {
    async fn send_reported(&self, payload: &[u8]) -> Result<u16, AgentError> {
        let value: Value = serde_json::from_slice(payload)?;
        let status = self.responses.lock().unwrap().pop_front().unwrap_or(200);
        self.sent.lock().unwrap().push((status, value));
        Ok(status)
    }
}

struct Rig {
    engine: WorkflowEngine,
    twin: Arc<RecordingTwin>,
    sim: Arc<SimulatorState>,
    layout: StorageLayout,
    reboots: Arc<AtomicU32>,
    restarts: Arc<AtomicU32>,
    scratch: Dir,
}

fn registry_with(sim: &Arc<SimulatorState>) -> HandlerRegistry {
    let mut registry = HandlerRegistry::new();
    registry.register(SIMULATOR_UPDATE_TYPE, simulator::factory(sim.clone()));
    registry
}

fn capabilities_counting(
    counter: &Arc<AtomicU32>,
    status: i32,
    other: &Arc<AtomicU32>,
    other_status: i32,
) -> Capabilities {
    let reboot_counter = counter.clone();
    let restart_counter = other.clone();
    Capabilities::new(
        Box::new(move || {
            reboot_counter.fetch_add(1, Ordering::SeqCst);
            status
        }),
        Box::new(move || {
            restart_counter.fetch_add(1, Ordering::SeqCst);
            other_status
        }),
    )
}

async fn rig() -> Rig {
    rig_with_reboot_status(0).await
}

async fn rig_with_reboot_status(reboot_status: i32) -> Rig {
    let scratch = Dir::create_temp_dir("otagent-engine-test").await.unwrap();
    let layout = StorageLayout::new(scratch.path());
    layout.setup().await.unwrap();

    let twin = Arc::new(RecordingTwin::default());
    let sim = SimulatorState::shared();
    let reboots = Arc::new(AtomicU32::new(0));
    let restarts = Arc::new(AtomicU32::new(0));

    let engine = WorkflowEngine::new(
        twin.clone(),
        registry_with(&sim),
        capabilities_counting(&reboots, reboot_status, &restarts, 0),
        Settings::default(),
        layout.clone(),
    );

    Rig {
        engine,
        twin,
        sim,
        layout,
        reboots,
        restarts,
        scratch,
    }
}

/// A second engine over the same storage and simulator state, as after a
/// device reboot or agent restart.
fn reborn_engine(rig: &Rig) -> (WorkflowEngine, Arc<RecordingTwin>) {
    let twin = Arc::new(RecordingTwin::default());
    let reboots = Arc::new(AtomicU32::new(0));
    let restarts = Arc::new(AtomicU32::new(0));
    let engine = WorkflowEngine::new(
        twin.clone(),
        registry_with(&rig.sim),
        capabilities_counting(&reboots, 0, &restarts, 0),
        Settings::default(),
        rig.layout.clone(),
    );
    (engine, twin)
}

async fn ticks(engine: &mut WorkflowEngine, count: usize) {
    for _ in 0..count {
        engine.do_work().await;
    }
}

fn desired_doc(id: &str, retry: Option<&str>, step_count: usize) -> Value {
    let mut manifest = json!({
        "updateType": SIMULATOR_UPDATE_TYPE,
        "installedCriteria": "v2",
    });
    if step_count > 0 {
        let steps: Vec<Value> = (0..step_count)
            .map(|i| {
                json!({
                    "handler": SIMULATOR_UPDATE_TYPE,
                    "files": [format!("f{}", i)],
                })
            })
            .collect();
        manifest["instructions"] = json!({ "steps": steps });
    }

    let mut workflow = json!({ "action": 3, "id": id });
    if let Some(retry) = retry {
        workflow["retryTimestamp"] = retry.into();
    }

    json!({
        "workflow": workflow,
        "updateManifest": manifest.to_string(),
        "updateManifestSignature": "signature-bytes",
        "fileUrls": { "f0": "http://updates.example/f0" }
    })
}

fn cancel_doc(id: &str) -> Value {
    json!({ "workflow": { "action": 255, "id": id } })
}

fn assert_valid_state_path(states: &[i64]) {
    for pair in states.windows(2) {
        let from = UpdateState::from_i32(pair[0] as i32).unwrap();
        let to = UpdateState::from_i32(pair[1] as i32).unwrap();
        assert!(
            from == to || from.can_transition_to(to),
            "illegal reported transition {} -> {}",
            from,
            to
        );
    }
}

// ---------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------

#[tokio::test]
async fn test_happy_path_without_reboot() {
    let mut rig = rig().await;
    rig.engine.on_connected().await;

    rig.engine
        .on_desired_property(desired_doc("w1", Some("t1"), 1), 1)
        .await;
    ticks(&mut rig.engine, 5).await;

    // Startup idle, then the full deployment path.
    assert_eq!(rig.twin.states(), vec![0, 3, 4, 5, 6, 7, 8, 0]);
    assert_valid_state_path(&rig.twin.states());

    let terminal = rig.twin.last_agent_doc();
    assert_eq!(terminal["state"], 0);
    assert_eq!(terminal["installedUpdateId"], "v2");
    assert_eq!(terminal["workflow"]["id"], "w1");
    assert_eq!(terminal["workflow"]["retryTimestamp"], "t1");
    assert_eq!(
        terminal["lastInstallResult"]["resultCode"],
        code::APPLY_SUCCESS
    );

    // Workflow released, nothing persisted, work folder cleaned up.
    assert!(rig.engine.active_workflow().is_none());
    assert!(!rig.layout.persistence_file().exists().await);
    assert!(!rig.layout.work_folder("w1").exists().await);
    assert_eq!(rig.reboots.load(Ordering::SeqCst), 0);
    assert_eq!(rig.restarts.load(Ordering::SeqCst), 0);

    rig.scratch.delete().await.unwrap();
}

#[tokio::test]
async fn test_exactly_one_terminal_idle_with_installed_update_id() {
    let mut rig = rig().await;
    rig.engine.on_connected().await;
    rig.engine
        .on_desired_property(desired_doc("w1", Some("t1"), 2), 1)
        .await;
    ticks(&mut rig.engine, 6).await;

    let terminal_idles = rig
        .twin
        .agent_docs()
        .iter()
        .filter(|doc| doc["state"] == 0 && doc.get("installedUpdateId").is_some())
        .count();
    assert_eq!(terminal_idles, 1);

    rig.scratch.delete().await.unwrap();
}

#[tokio::test]
async fn test_cancel_mid_download() {
    let mut rig = rig().await;
    rig.engine.on_connected().await;

    // Park the download so the cancel lands mid-phase.
    rig.sim
        .script_download(UpdateResult::success(code::DOWNLOAD_IN_PROGRESS));

    rig.engine
        .on_desired_property(desired_doc("w1", Some("t1"), 1), 1)
        .await;
    ticks(&mut rig.engine, 1).await;
    assert_eq!(
        rig.engine.active_workflow().unwrap().last_reported_state(),
        UpdateState::DownloadStarted
    );

    rig.engine.on_desired_property(cancel_doc("w1"), 2).await;
    ticks(&mut rig.engine, 1).await;

    let terminal = rig.twin.last_agent_doc();
    assert_eq!(terminal["state"], 255);
    assert_eq!(
        terminal["lastInstallResult"]["resultCode"],
        code::FAILURE_CANCELLED
    );
    assert!(terminal.get("installedUpdateId").is_none());
    assert!(rig.engine.active_workflow().is_none());
    assert_valid_state_path(&rig.twin.states());

    rig.scratch.delete().await.unwrap();
}

#[tokio::test]
async fn test_cancel_before_any_phase_reports_idle() {
    let mut rig = rig().await;
    rig.engine.on_connected().await;

    rig.engine
        .on_desired_property(desired_doc("w1", None, 1), 1)
        .await;
    // No tick yet: the deployment was adopted but no phase began.
    rig.engine.on_desired_property(cancel_doc("w1"), 2).await;
    ticks(&mut rig.engine, 1).await;

    let terminal = rig.twin.last_agent_doc();
    assert_eq!(terminal["state"], 0);
    assert!(terminal.get("installedUpdateId").is_none());
    assert!(rig.engine.active_workflow().is_none());

    rig.scratch.delete().await.unwrap();
}

#[tokio::test]
async fn test_cancel_with_no_deployment_reports_idle() {
    let mut rig = rig().await;
    rig.engine.on_connected().await;

    rig.engine.on_desired_property(cancel_doc("w9"), 3).await;

    let doc = rig.twin.last_agent_doc();
    assert_eq!(doc["state"], 0);
    assert_eq!(doc["workflow"]["id"], "w9");
    assert_eq!(doc["workflow"]["action"], 255);
    assert_eq!(
        doc["lastInstallResult"]["resultCode"],
        code::CANCEL_NOT_STARTED
    );

    rig.scratch.delete().await.unwrap();
}

#[tokio::test]
async fn test_reboot_required_apply_resumes_after_boot() {
    let mut rig = rig().await;
    rig.engine.on_connected().await;

    rig.sim
        .script_apply(UpdateResult::success(code::APPLY_SUCCESS_REBOOT_REQUIRED));

    rig.engine
        .on_desired_property(desired_doc("w1", Some("t1"), 1), 1)
        .await;
    ticks(&mut rig.engine, 4).await;

    // The engine persisted, invoked reboot and released the workflow; no
    // terminal state was reported yet.
    assert_eq!(rig.reboots.load(Ordering::SeqCst), 1);
    assert_eq!(*rig.twin.states().last().unwrap(), 8);
    assert!(rig.engine.active_workflow().is_none());
    assert!(rig.layout.persistence_file().exists().await);

    // Simulated next boot: fresh engine, same storage, update installed.
    let (mut rebooted, twin) = reborn_engine(&rig);
    rebooted.on_connected().await;

    let doc = twin.last_agent_doc();
    assert_eq!(doc["state"], 0);
    assert_eq!(doc["installedUpdateId"], "v2");
    assert!(!rig.layout.persistence_file().exists().await);
    assert!(rebooted.active_workflow().is_none());

    rig.scratch.delete().await.unwrap();
}

#[tokio::test]
async fn test_agent_restart_required_apply() {
    let mut rig = rig().await;
    rig.engine.on_connected().await;

    rig.sim.script_apply(UpdateResult::success(
        code::APPLY_SUCCESS_AGENT_RESTART_REQUIRED,
    ));

    rig.engine
        .on_desired_property(desired_doc("w1", None, 0), 1)
        .await;
    ticks(&mut rig.engine, 4).await;

    assert_eq!(rig.restarts.load(Ordering::SeqCst), 1);
    assert_eq!(rig.reboots.load(Ordering::SeqCst), 0);
    assert!(rig.layout.persistence_file().exists().await);

    rig.scratch.delete().await.unwrap();
}

#[tokio::test]
async fn test_boot_validation_failure_reports_failed() {
    let mut rig = rig().await;
    rig.engine.on_connected().await;

    rig.sim
        .script_apply(UpdateResult::success(code::APPLY_SUCCESS_REBOOT_REQUIRED));
    rig.engine
        .on_desired_property(desired_doc("w1", None, 1), 1)
        .await;
    ticks(&mut rig.engine, 4).await;
    assert!(rig.layout.persistence_file().exists().await);

    // The update did not survive the reboot.
    rig.sim.set_installed(false);

    let (mut rebooted, twin) = reborn_engine(&rig);
    rebooted.on_connected().await;

    let doc = twin.last_agent_doc();
    assert_eq!(doc["state"], 255);
    assert_eq!(
        doc["lastInstallResult"]["extendedResultCode"],
        erc::BOOT_VALIDATION_FAILED
    );
    assert!(doc.get("installedUpdateId").is_none());
    assert!(!rig.layout.persistence_file().exists().await);

    rig.scratch.delete().await.unwrap();
}

#[tokio::test]
async fn test_failed_reboot_command_fails_the_deployment() {
    let mut rig = rig_with_reboot_status(1).await;
    rig.engine.on_connected().await;

    rig.sim
        .script_apply(UpdateResult::success(code::APPLY_SUCCESS_REBOOT_REQUIRED));
    rig.engine
        .on_desired_property(desired_doc("w1", None, 0), 1)
        .await;
    ticks(&mut rig.engine, 4).await;

    assert_eq!(rig.reboots.load(Ordering::SeqCst), 1);
    let terminal = rig.twin.last_agent_doc();
    assert_eq!(terminal["state"], 255);
    assert_eq!(
        terminal["lastInstallResult"]["extendedResultCode"],
        erc::REBOOT_FAILED
    );
    // The record must not linger after the failed reboot request.
    assert!(!rig.layout.persistence_file().exists().await);

    rig.scratch.delete().await.unwrap();
}

#[tokio::test]
async fn test_replay_with_new_retry_timestamp_reruns_deployment() {
    let mut rig = rig().await;
    rig.engine.on_connected().await;

    rig.engine
        .on_desired_property(desired_doc("w1", Some("t1"), 1), 1)
        .await;
    ticks(&mut rig.engine, 5).await;
    let first_run_states = rig.twin.states();
    assert_eq!(first_run_states, vec![0, 3, 4, 5, 6, 7, 8, 0]);

    rig.engine
        .on_desired_property(desired_doc("w1", Some("t2"), 1), 2)
        .await;
    ticks(&mut rig.engine, 5).await;

    let states = rig.twin.states();
    assert_eq!(states[8..], [3, 4, 5, 6, 7, 8, 0]);
    let terminal = rig.twin.last_agent_doc();
    assert_eq!(terminal["installedUpdateId"], "v2");
    assert_eq!(terminal["workflow"]["retryTimestamp"], "t2");

    rig.scratch.delete().await.unwrap();
}

#[tokio::test]
async fn test_replay_of_same_pair_re_reports_terminal() {
    let mut rig = rig().await;
    rig.engine.on_connected().await;

    rig.engine
        .on_desired_property(desired_doc("w1", Some("t1"), 1), 1)
        .await;
    ticks(&mut rig.engine, 5).await;
    let first_terminal = rig.twin.last_agent_doc();
    let reports_before = rig.twin.agent_docs().len();

    // Identical pair redelivered after terminal: idempotent outcome, no
    // re-execution.
    rig.engine
        .on_desired_property(desired_doc("w1", Some("t1"), 1), 2)
        .await;
    ticks(&mut rig.engine, 2).await;

    let docs = rig.twin.agent_docs();
    assert_eq!(docs.len(), reports_before + 1);
    assert_eq!(docs.last().unwrap()["installedUpdateId"], first_terminal["installedUpdateId"]);
    assert_eq!(docs.last().unwrap()["state"], 0);

    rig.scratch.delete().await.unwrap();
}

#[tokio::test]
async fn test_malformed_desired_document() {
    let mut rig = rig().await;
    rig.engine.on_connected().await;
    let reports_before = rig.twin.agent_docs().len();

    let missing_id = json!({
        "workflow": { "action": 3 },
        "updateManifest": "{\"updateType\":\"sim/noop:1\"}"
    });
    rig.engine.on_desired_property(missing_id, 7).await;

    let acks = rig.twin.acks();
    assert_eq!(acks.len(), 1);
    assert_eq!(acks[0]["ac"], 400);
    assert_eq!(acks[0]["av"], 7);

    // No state transition, no persistence write.
    assert_eq!(rig.twin.agent_docs().len(), reports_before);
    assert!(rig.engine.active_workflow().is_none());
    assert!(!rig.layout.persistence_file().exists().await);

    rig.scratch.delete().await.unwrap();
}

#[tokio::test]
async fn test_multi_step_aggregation_on_failure() {
    let mut rig = rig().await;
    rig.engine.on_connected().await;

    let extended = extended_code(facility::HANDLER, 42);
    rig.sim
        .script_install(UpdateResult::success(code::INSTALL_SUCCESS));
    rig.sim
        .script_install(UpdateResult::failure(extended, "step 1 exploded"));

    rig.engine
        .on_desired_property(desired_doc("w1", Some("t1"), 3), 1)
        .await;
    ticks(&mut rig.engine, 3).await;

    let terminal = rig.twin.last_agent_doc();
    assert_eq!(terminal["state"], 255);
    assert_eq!(terminal["lastInstallResult"]["resultCode"], code::FAILURE);
    assert_eq!(
        terminal["lastInstallResult"]["extendedResultCode"],
        extended
    );

    let steps = terminal["lastInstallResult"]["stepResults"]
        .as_object()
        .unwrap();
    assert_eq!(steps.len(), 2);
    assert_eq!(steps["step_0"]["resultCode"], code::INSTALL_SUCCESS);
    assert_eq!(steps["step_1"]["resultCode"], code::FAILURE);
    assert_eq!(steps["step_1"]["extendedResultCode"], extended);
    assert!(!steps.contains_key("step_2"));

    rig.scratch.delete().await.unwrap();
}

// ---------------------------------------------------------------------
// Policies and edge cases
// ---------------------------------------------------------------------

#[tokio::test]
async fn test_acks_are_redacted() {
    let mut rig = rig().await;
    rig.engine.on_connected().await;
    rig.engine
        .on_desired_property(desired_doc("w1", Some("t1"), 1), 1)
        .await;
    ticks(&mut rig.engine, 5).await;

    let acks = rig.twin.acks();
    assert!(!acks.is_empty());
    for ack in &acks {
        assert!(
            ack["value"]["updateManifestSignature"].is_null(),
            "updateManifestSignature must be redacted"
        );
        assert!(ack["value"]["fileUrls"].is_null(), "fileUrls must be redacted");
        assert_eq!(ack["ac"], 200);
        assert_eq!(ack["av"], 1);
    }

    rig.scratch.delete().await.unwrap();
}

#[tokio::test]
async fn test_step_results_null_in_early_states() {
    let mut rig = rig().await;
    rig.engine.on_connected().await;
    rig.engine
        .on_desired_property(desired_doc("w1", Some("t1"), 2), 1)
        .await;
    ticks(&mut rig.engine, 6).await;

    for doc in rig.twin.agent_docs() {
        let Some(state) = doc.get("state").and_then(Value::as_i64) else {
            continue;
        };
        if state == 3 || state == 4 {
            assert!(
                doc["lastInstallResult"]["stepResults"].is_null(),
                "stepResults must be null in state {}",
                state
            );
        }
    }

    rig.scratch.delete().await.unwrap();
}

#[tokio::test]
async fn test_unknown_update_type_fails_deployment() {
    let mut rig = rig().await;
    rig.engine.on_connected().await;

    let manifest = json!({ "updateType": "vendor/unknown:9" }).to_string();
    let desired = json!({
        "workflow": { "action": 3, "id": "w1" },
        "updateManifest": manifest
    });
    rig.engine.on_desired_property(desired, 1).await;
    ticks(&mut rig.engine, 1).await;

    let terminal = rig.twin.last_agent_doc();
    assert_eq!(terminal["state"], 255);
    assert_eq!(
        terminal["lastInstallResult"]["extendedResultCode"],
        erc::UNKNOWN_HANDLER
    );
    assert!(rig.engine.active_workflow().is_none());

    rig.scratch.delete().await.unwrap();
}

#[tokio::test]
async fn test_conflicting_deployment_is_rejected() {
    let mut rig = rig().await;
    rig.engine.on_connected().await;

    // Park the first deployment in its download phase.
    rig.sim
        .script_download(UpdateResult::success(code::DOWNLOAD_IN_PROGRESS));
    rig.engine
        .on_desired_property(desired_doc("w1", Some("t1"), 1), 1)
        .await;
    ticks(&mut rig.engine, 1).await;

    rig.engine
        .on_desired_property(desired_doc("w2", Some("t1"), 1), 2)
        .await;

    let doc = rig.twin.last_agent_doc();
    assert_eq!(
        doc["lastInstallResult"]["extendedResultCode"],
        erc::WORKFLOW_CONFLICT
    );
    // The active deployment is untouched.
    assert_eq!(rig.engine.active_workflow().unwrap().id(), "w1");
    assert_eq!(doc["workflow"]["id"], "w1");

    rig.scratch.delete().await.unwrap();
}

#[tokio::test]
async fn test_duplicate_redelivery_is_ignored() {
    let mut rig = rig().await;
    rig.engine.on_connected().await;

    rig.sim
        .script_download(UpdateResult::success(code::DOWNLOAD_IN_PROGRESS));
    rig.engine
        .on_desired_property(desired_doc("w1", Some("t1"), 1), 1)
        .await;
    ticks(&mut rig.engine, 1).await;
    let reports_before = rig.twin.agent_docs().len();

    rig.engine
        .on_desired_property(desired_doc("w1", Some("t1"), 1), 2)
        .await;

    // Only the ack went out; no new state report, no restart of the phase.
    assert_eq!(rig.twin.agent_docs().len(), reports_before);
    assert_eq!(
        rig.engine.active_workflow().unwrap().last_reported_state(),
        UpdateState::DownloadStarted
    );

    rig.scratch.delete().await.unwrap();
}

#[tokio::test]
async fn test_transient_send_failure_retries_without_losing_state() {
    let mut rig = rig().await;
    rig.engine.on_connected().await;

    rig.engine
        .on_desired_property(desired_doc("w1", Some("t1"), 1), 1)
        .await;

    // The DownloadStarted report bounces once.
    rig.twin.respond_next(500);
    ticks(&mut rig.engine, 1).await;
    assert_eq!(
        rig.engine.active_workflow().unwrap().last_reported_state(),
        UpdateState::DeploymentInProgress
    );

    // Retry succeeds on the next ticks and the deployment completes.
    ticks(&mut rig.engine, 5).await;
    assert_eq!(rig.twin.states(), vec![0, 3, 4, 5, 6, 7, 8, 0]);
    assert_valid_state_path(&rig.twin.states());

    rig.scratch.delete().await.unwrap();
}

#[tokio::test]
async fn test_reconnect_mid_deployment_re_reports_state() {
    let mut rig = rig().await;
    rig.engine.on_connected().await;

    // Park the deployment in its download phase.
    rig.sim
        .script_download(UpdateResult::success(code::DOWNLOAD_IN_PROGRESS));
    rig.engine
        .on_desired_property(desired_doc("w1", Some("t1"), 1), 1)
        .await;
    ticks(&mut rig.engine, 1).await;

    // Transport drops and reconnects while the workflow is in flight.
    rig.engine.on_connected().await;

    let doc = rig.twin.last_agent_doc();
    assert_eq!(doc["state"], 4);
    assert_eq!(doc["workflow"]["id"], "w1");
    assert_eq!(doc["workflow"]["retryTimestamp"], "t1");
    // Still a startup report: device properties are merged in.
    assert!(doc["deviceProperties"].is_object());
    assert!(doc["compatPropertyNames"].is_string());
    // The null-stepResults rule holds on the reconnect report too.
    assert!(doc["lastInstallResult"]["stepResults"].is_null());
    assert_valid_state_path(&rig.twin.states());

    // The deployment carries on and completes normally.
    ticks(&mut rig.engine, 4).await;
    let terminal = rig.twin.last_agent_doc();
    assert_eq!(terminal["state"], 0);
    assert_eq!(terminal["installedUpdateId"], "v2");
    assert!(rig.engine.active_workflow().is_none());

    rig.scratch.delete().await.unwrap();
}

#[tokio::test]
async fn test_in_progress_download_polls_across_ticks() {
    let mut rig = rig().await;
    rig.engine.on_connected().await;

    rig.sim
        .script_download(UpdateResult::success(code::DOWNLOAD_IN_PROGRESS));
    rig.sim
        .script_download(UpdateResult::success(code::DOWNLOAD_IN_PROGRESS));

    rig.engine
        .on_desired_property(desired_doc("w1", Some("t1"), 1), 1)
        .await;
    ticks(&mut rig.engine, 2).await;

    // Two polls, still in the download phase, reported only once.
    let download_started_reports = rig
        .twin
        .states()
        .iter()
        .filter(|state| **state == 4)
        .count();
    assert_eq!(download_started_reports, 1);
    assert_eq!(
        rig.engine.active_workflow().unwrap().last_reported_state(),
        UpdateState::DownloadStarted
    );

    // Third poll drains the queue and the deployment completes.
    ticks(&mut rig.engine, 3).await;
    assert_eq!(*rig.twin.states().last().unwrap(), 0);

    rig.scratch.delete().await.unwrap();
}
