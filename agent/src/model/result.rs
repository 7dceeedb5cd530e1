//! Result codes for workflow phases

use serde::{Deserialize, Serialize};

/// Top-level result codes. Positive values signal success, zero and
/// negative values signal failure.
pub mod code {
    pub const FAILURE: i32 = 0;
    pub const FAILURE_CANCELLED: i32 = -1;

    pub const SUCCESS: i32 = 1;

    pub const DEPLOYMENT_IN_PROGRESS_SUCCESS: i32 = 300;

    pub const DOWNLOAD_SUCCESS: i32 = 500;
    pub const DOWNLOAD_IN_PROGRESS: i32 = 501;
    pub const DOWNLOAD_SKIPPED: i32 = 502;

    pub const INSTALL_SUCCESS: i32 = 600;
    pub const INSTALL_IN_PROGRESS: i32 = 601;
    pub const INSTALL_SKIPPED: i32 = 603;

    pub const APPLY_SUCCESS: i32 = 700;
    pub const APPLY_IN_PROGRESS: i32 = 701;
    pub const APPLY_SUCCESS_REBOOT_REQUIRED: i32 = 705;
    pub const APPLY_SUCCESS_AGENT_RESTART_REQUIRED: i32 = 707;

    pub const CANCEL_SUCCESS: i32 = 800;
    pub const CANCEL_NOT_STARTED: i32 = 801;

    pub const IS_INSTALLED_INSTALLED: i32 = 900;
    pub const IS_INSTALLED_NOT_INSTALLED: i32 = 901;
}

/// Facility identifiers packed into the top byte of an extended result
/// code, locating the component that produced the error.
pub mod facility {
    pub const ENGINE: u8 = 1;
    pub const PARSING: u8 = 2;
    pub const PERSISTENCE: u8 = 3;
    pub const HANDLER: u8 = 4;
    pub const PLATFORM: u8 = 5;
}

/// Pack a facility and an error value into an extended result code.
pub const fn extended_code(facility: u8, value: u32) -> i32 {
    ((facility as i32) << 24) | (value as i32 & 0x00ff_ffff)
}

/// Extract the facility byte from an extended result code.
pub const fn extended_facility(extended: i32) -> u8 {
    ((extended >> 24) & 0xff) as u8
}

/// Well-known extended result codes.
pub mod erc {
    use super::{extended_code, facility};

    pub const NONE: i32 = 0;

    /// Desired document could not be parsed or failed validation.
    pub const PARSE_FAILURE: i32 = extended_code(facility::PARSING, 1);
    /// Update manifest was missing or malformed.
    pub const MANIFEST_INVALID: i32 = extended_code(facility::PARSING, 2);

    /// A non-terminal deployment is active and cannot be replaced.
    pub const WORKFLOW_CONFLICT: i32 = extended_code(facility::ENGINE, 1);
    /// No handler is registered for the workflow's update type.
    pub const UNKNOWN_HANDLER: i32 = extended_code(facility::ENGINE, 2);
    /// The deployment was cancelled by the service.
    pub const DEPLOYMENT_CANCELLED: i32 = extended_code(facility::ENGINE, 3);

    /// Persisted workflow record was present but unreadable.
    pub const PERSISTENCE_CORRUPT: i32 = extended_code(facility::PERSISTENCE, 1);
    /// Post-reboot verification found the update not installed.
    pub const BOOT_VALIDATION_FAILED: i32 = extended_code(facility::PERSISTENCE, 2);
    /// The workflow record could not be written before a restart.
    pub const PERSISTENCE_WRITE_FAILED: i32 = extended_code(facility::PERSISTENCE, 3);

    /// The reboot capability returned a non-zero status.
    pub const REBOOT_FAILED: i32 = extended_code(facility::PLATFORM, 1);
    /// The agent-restart capability returned a non-zero status.
    pub const AGENT_RESTART_FAILED: i32 = extended_code(facility::PLATFORM, 2);
    /// The deployment work folder could not be created.
    pub const WORK_FOLDER_FAILED: i32 = extended_code(facility::PLATFORM, 3);
}

/// Outcome of a workflow phase: a top-level code, a structured extended
/// code identifying component and cause, and optional human-readable
/// details.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateResult {
    pub code: i32,
    pub extended_code: i32,
    pub details: Option<String>,
}

impl UpdateResult {
    pub fn success(code: i32) -> Self {
        Self {
            code,
            extended_code: erc::NONE,
            details: None,
        }
    }

    pub fn failure(extended_code: i32, details: impl Into<String>) -> Self {
        Self {
            code: code::FAILURE,
            extended_code,
            details: Some(details.into()),
        }
    }

    pub fn cancelled(details: impl Into<String>) -> Self {
        Self {
            code: code::FAILURE_CANCELLED,
            extended_code: erc::DEPLOYMENT_CANCELLED,
            details: Some(details.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.code > 0
    }

    pub fn is_failure(&self) -> bool {
        self.code <= 0
    }

    pub fn is_cancelled(&self) -> bool {
        self.code == code::FAILURE_CANCELLED
    }

    pub fn is_in_progress(&self) -> bool {
        matches!(
            self.code,
            code::DOWNLOAD_IN_PROGRESS | code::INSTALL_IN_PROGRESS | code::APPLY_IN_PROGRESS
        )
    }

    /// Whether this apply result asks for a device reboot.
    pub fn requires_reboot(&self) -> bool {
        self.code == code::APPLY_SUCCESS_REBOOT_REQUIRED
    }

    /// Whether this apply result asks for an agent process restart.
    pub fn requires_agent_restart(&self) -> bool {
        self.code == code::APPLY_SUCCESS_AGENT_RESTART_REQUIRED
    }
}

impl Default for UpdateResult {
    fn default() -> Self {
        Self {
            code: code::SUCCESS,
            extended_code: erc::NONE,
            details: None,
        }
    }
}
