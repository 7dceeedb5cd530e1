//! Reporting serializer
//!
//! Builds the reported-property documents the engine sends through the
//! twin channel. Document shape:
//!
//! ```json
//! {
//!     "state": 8,
//!     "workflow": { "action": 3, "id": "...", "retryTimestamp": "..." },
//!     "installedUpdateId": "...",
//!     "lastInstallResult": {
//!         "resultCode": 700,
//!         "extendedResultCode": 0,
//!         "resultDetails": null,
//!         "stepResults": {
//!             "step_0": { "resultCode": 700, "extendedResultCode": 0, "resultDetails": null }
//!         }
//!     }
//! }
//! ```

use serde_json::{json, Value};

use crate::errors::AgentError;
use crate::model::desired::WorkflowProperties;
use crate::model::result::UpdateResult;
use crate::model::state::UpdateState;
use crate::utils::nonempty;
use crate::workflow::object::Workflow;
use crate::workflow::orchestration::step_key;

fn result_object(result: &UpdateResult) -> Value {
    json!({
        "resultCode": result.code,
        "extendedResultCode": result.extended_code,
        "resultDetails": result.details,
    })
}

/// Build a reported document for a state transition.
///
/// - The `workflow` block is omitted when no workflow id is set (startup
///   idle with no deployment).
/// - `stepResults` is null for `DownloadStarted` and
///   `DeploymentInProgress`, clearing any previous install results;
///   otherwise it is present iff the workflow has steps, keyed
///   `step_0 … step_N` over the steps that have run.
/// - `installedUpdateId` is included only when the caller passes one,
///   i.e. on terminal `Idle` after a successful apply.
pub fn reporting_value(
    workflow: Option<&Workflow>,
    state: UpdateState,
    result: Option<&UpdateResult>,
    installed_update_id: Option<&str>,
) -> Value {
    let mut root = json!({ "state": state.as_i32() });

    if let Some(wf) = workflow {
        if !wf.id().is_empty() {
            let mut block = json!({
                "action": wf.current_action().as_i32(),
                "id": wf.id(),
            });
            if let Some(retry) = nonempty(wf.retry_timestamp()) {
                block["retryTimestamp"] = retry.into();
            }
            root["workflow"] = block;
        }
    }

    if let Some(update_id) = installed_update_id {
        root["installedUpdateId"] = update_id.into();
    }

    let root_result = match (result, workflow) {
        (Some(result), _) => result.clone(),
        (None, Some(wf)) => wf.result().clone(),
        (None, None) => UpdateResult::default(),
    };
    let mut last_install = result_object(&root_result);

    if matches!(
        state,
        UpdateState::DownloadStarted | UpdateState::DeploymentInProgress
    ) {
        last_install["stepResults"] = Value::Null;
    } else if let Some(wf) = workflow {
        if !wf.steps().is_empty() {
            let mut steps = serde_json::Map::new();
            for (index, step) in wf.steps().iter().enumerate() {
                if let Some(result) = &step.result {
                    steps.insert(step_key(index), result_object(result));
                }
            }
            last_install["stepResults"] = Value::Object(steps);
        }
    }

    root["lastInstallResult"] = last_install;
    root
}

/// Idle document answering a request that has no workflow to act on,
/// echoing the request's workflow identity so state and id stay
/// consistent.
pub fn idle_answer_value(properties: &WorkflowProperties, result: &UpdateResult) -> Value {
    let mut block = json!({
        "action": properties.action.as_i32(),
        "id": properties.id,
    });
    if let Some(retry) = nonempty(properties.retry_timestamp.as_deref()) {
        block["retryTimestamp"] = retry.into();
    }

    json!({
        "state": UpdateState::Idle.as_i32(),
        "workflow": block,
        "lastInstallResult": result_object(result),
    })
}

/// Rewrite the result codes inside an existing reported document's
/// `lastInstallResult`.
pub fn update_last_install_result(
    root: &mut Value,
    result: &UpdateResult,
) -> Result<(), AgentError> {
    let last_install = root
        .get_mut("lastInstallResult")
        .and_then(Value::as_object_mut)
        .ok_or_else(|| {
            AgentError::WorkflowError("reporting document has no lastInstallResult".to_string())
        })?;

    last_install.insert("resultCode".to_string(), result.code.into());
    last_install.insert("extendedResultCode".to_string(), result.extended_code.into());
    Ok(())
}

/// Build the startup-idle document from a persisted reporting document,
/// updating only the just-computed terminal result.
///
/// The persisted string is parsed into a fresh buffer and left untouched;
/// the returned document is the only one the caller serializes.
pub fn startup_value(reporting_json: &str, result: &UpdateResult) -> Result<Value, AgentError> {
    let mut root: Value = serde_json::from_str(reporting_json)?;
    update_last_install_result(&mut root, result)?;
    Ok(root)
}
