//! Orchestration policies
//!
//! Small, side-effect-free decisions the engine consults: how to treat an
//! incoming deployment, which state transitions are promoted to the twin,
//! acknowledgement redaction and step-result key naming.

use serde_json::Value;

use crate::model::result::UpdateResult;
use crate::model::state::UpdateState;
use crate::workflow::object::Workflow;

/// A finished deployment the engine remembers after releasing the
/// workflow, so service-initiated replays can be answered idempotently.
#[derive(Debug, Clone)]
pub struct CompletedDeployment {
    pub id: String,
    pub retry_timestamp: Option<String>,
    pub state: UpdateState,
    pub result: UpdateResult,
    pub installed_update_id: Option<String>,
    /// The terminal document as reported, re-sent verbatim on replay
    pub reported_doc: Value,
}

impl CompletedDeployment {
    pub fn matches(&self, id: &str, retry_timestamp: Option<&str>) -> bool {
        self.id == id && self.retry_timestamp.as_deref() == retry_timestamp
    }
}

/// How the engine should treat an incoming `ApplyDeployment`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdoptDecision {
    /// No matching workflow; adopt and run the deployment
    AdoptNew,

    /// The active workflow has the same `(id, retryTimestamp)` pair;
    /// at-least-once redelivery, nothing to do
    DuplicateInFlight,

    /// The pair matches a deployment already reported terminal;
    /// re-report the remembered outcome
    ReplayTerminal,

    /// A different deployment is still in flight; reject with a
    /// service-visible error
    RejectConflict,
}

/// Resolve an incoming deployment against the active workflow and the
/// last completed one.
///
/// A changed `retryTimestamp` with the same id never matches, so it lands
/// on `AdoptNew` and re-runs from the download phase.
pub fn adopt_decision(
    active: Option<&Workflow>,
    last_completed: Option<&CompletedDeployment>,
    id: &str,
    retry_timestamp: Option<&str>,
) -> AdoptDecision {
    if let Some(workflow) = active {
        if workflow.matches(id, retry_timestamp) {
            return AdoptDecision::DuplicateInFlight;
        }
        return AdoptDecision::RejectConflict;
    }

    if let Some(completed) = last_completed {
        if completed.matches(id, retry_timestamp) {
            return AdoptDecision::ReplayTerminal;
        }
    }

    AdoptDecision::AdoptNew
}

/// Whether a transition should be promoted to the twin. Re-entering the
/// current state (intra-phase progress polling) is not reported.
pub fn should_report(last_reported: UpdateState, next: UpdateState) -> bool {
    last_reported != next
}

/// Reflect a desired document for acknowledgement with the bulky fields
/// nulled out to bound twin size.
pub fn redact_ack(desired: &Value) -> Value {
    let mut reflected = desired.clone();
    if let Some(obj) = reflected.as_object_mut() {
        if obj.contains_key("updateManifestSignature") {
            obj.insert("updateManifestSignature".to_string(), Value::Null);
        }
        if obj.contains_key("fileUrls") {
            obj.insert("fileUrls".to_string(), Value::Null);
        }
    }
    reflected
}

/// Reported key for the step at `index`. Twin map keys disallow some
/// punctuation (':', '-'), so steps are keyed by plain decimal index.
pub fn step_key(index: usize) -> String {
    format!("step_{}", index)
}
