//! Settings file management

use serde::{Deserialize, Serialize};

use crate::logs::LogLevel;

/// Agent settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Log level
    #[serde(default)]
    pub log_level: LogLevel,

    /// Device manufacturer reported in the startup message
    #[serde(default = "default_manufacturer")]
    pub manufacturer: String,

    /// Device model reported in the startup message
    #[serde(default = "default_model")]
    pub model: String,

    /// Compatibility property names advertised to the service.
    /// When absent, "manufacturer,model" is used.
    #[serde(default)]
    pub compat_property_names: Option<String>,

    /// Include agent version properties in the startup message
    #[serde(default)]
    pub telemetry_versions: bool,

    /// Engine work-tick interval in milliseconds
    #[serde(default = "default_work_interval_ms")]
    pub work_interval_ms: u64,

    /// Command invoked when an update requests a device reboot
    #[serde(default = "default_reboot_command")]
    pub reboot_command: String,

    /// Command invoked when an update requests an agent restart
    #[serde(default = "default_restart_command")]
    pub restart_command: String,
}

fn default_manufacturer() -> String {
    "unknown".to_string()
}

fn default_model() -> String {
    "unknown".to_string()
}

fn default_work_interval_ms() -> u64 {
    500
}

fn default_reboot_command() -> String {
    "/sbin/shutdown -r now".to_string()
}

fn default_restart_command() -> String {
    "systemctl restart otagent".to_string()
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_level: LogLevel::Info,
            manufacturer: default_manufacturer(),
            model: default_model(),
            compat_property_names: None,
            telemetry_versions: false,
            work_interval_ms: default_work_interval_ms(),
            reboot_command: default_reboot_command(),
            restart_command: default_restart_command(),
        }
    }
}
