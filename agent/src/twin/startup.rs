//! Startup message reported once on connect

use serde_json::{json, Value};

use crate::storage::settings::Settings;
use crate::utils::version_info;

/// Compatibility properties advertised when the config does not override
/// them
pub const DEFAULT_COMPAT_PROPERTY_NAMES: &str = "manufacturer,model";

/// Twin interface the agent implements
pub const INTERFACE_ID: &str = "dtmi:otagent:deviceUpdate;1";

/// Build the startup message: device properties and the compatibility
/// property names the service matches deployments against.
pub fn startup_message(settings: &Settings) -> Value {
    let mut device_properties = json!({
        "manufacturer": settings.manufacturer,
        "model": settings.model,
        "interfaceId": INTERFACE_ID,
    });

    if settings.telemetry_versions {
        device_properties["agentVersion"] = Value::String(version_info().version);
    }

    json!({
        "deviceProperties": device_properties,
        "compatPropertyNames": settings
            .compat_property_names
            .as_deref()
            .filter(|s| !s.is_empty())
            .unwrap_or(DEFAULT_COMPAT_PROPERTY_NAMES),
    })
}

/// Merge the startup message's top-level fields into a reported document.
pub fn merge_into(report: &mut Value, startup: &Value) {
    if let (Some(report_obj), Some(startup_obj)) = (report.as_object_mut(), startup.as_object()) {
        for (key, value) in startup_obj {
            report_obj.insert(key.clone(), value.clone());
        }
    }
}
