//! Device twin channel abstraction
//!
//! The agent communicates with the update service through one twin
//! component with two sub-properties: the service writes desired state to
//! `service`, the agent reports through `agent`. The transport itself is
//! behind the [`TwinChannel`] trait.

pub mod startup;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use crate::errors::AgentError;

/// Twin component name the agent registers for
pub const COMPONENT_NAME: &str = "deviceUpdate";

/// Cloud-to-device sub-property carrying desired update actions
pub const PROPERTY_SERVICE: &str = "service";

/// Device-to-cloud sub-property carrying reported agent state
pub const PROPERTY_AGENT: &str = "agent";

/// Acknowledgement status for an accepted desired document
pub const ACK_STATUS_SUCCESS: u16 = 200;

/// Acknowledgement status for a malformed desired document
pub const ACK_STATUS_BAD_REQUEST: u16 = 400;

/// Inputs delivered to the engine task by the transport glue, in arrival
/// order.
#[derive(Debug, Clone)]
pub enum TwinEvent {
    /// The transport is connected and ready
    Connected,

    /// The service wrote the desired sub-property
    DesiredProperty { value: Value, version: i64 },
}

/// Abstract transport for reported-property documents.
///
/// `send_reported` resolves to an HTTP-style status code; 2xx means the
/// service accepted the document. Delivery is at-least-once, so consumers
/// must be idempotent on `workflow.id` + `state`.
#[async_trait]
pub trait TwinChannel: Send + Sync {
    async fn send_reported(&self, payload: &[u8]) -> Result<u16, AgentError>;
}

/// Wrap an agent report in the component/property envelope.
pub fn wrap_agent_report(doc: &Value) -> Value {
    json!({ COMPONENT_NAME: { PROPERTY_AGENT: doc } })
}

/// Wrap an acknowledgement of a desired document: the reflected value plus
/// a status code and the desired document's version.
pub fn wrap_service_ack(value: &Value, status: u16, version: i64) -> Value {
    json!({
        COMPONENT_NAME: {
            PROPERTY_SERVICE: {
                "value": value,
                "ac": status,
                "av": version
            }
        }
    })
}

/// Development transport: logs reported payloads instead of sending them.
/// Lets the agent run end-to-end without a cloud connection.
#[derive(Debug, Default)]
pub struct EchoTwinChannel;

#[async_trait]
impl TwinChannel for EchoTwinChannel {
    async fn send_reported(&self, payload: &[u8]) -> Result<u16, AgentError> {
        debug!("Reported: {}", String::from_utf8_lossy(payload));
        Ok(ACK_STATUS_SUCCESS)
    }
}
