//! System capabilities injected into the engine
//!
//! Production assembly shells out to the platform; tests inject fakes.
//! Which record is provided decides the assembly, there are no hidden
//! globals or compile-time overrides.

use std::process::Command;

use tracing::{error, info};

use crate::storage::settings::Settings;

/// A system operation returning a process-style exit code (0 = success)
pub type SystemCommandFn = Box<dyn Fn() -> i32 + Send + Sync>;

/// Function-like values the engine receives on construction. Both are
/// invoked only between persisted phases.
pub struct Capabilities {
    /// Reboot the device
    pub reboot_system: SystemCommandFn,

    /// Restart the agent process
    pub restart_agent: SystemCommandFn,
}

impl Capabilities {
    pub fn new(reboot_system: SystemCommandFn, restart_agent: SystemCommandFn) -> Self {
        Self {
            reboot_system,
            restart_agent,
        }
    }

    /// Production capabilities running the configured platform commands
    pub fn from_settings(settings: &Settings) -> Self {
        let reboot_command = settings.reboot_command.clone();
        let restart_command = settings.restart_command.clone();
        Self {
            reboot_system: Box::new(move || run_command("reboot", &reboot_command)),
            restart_agent: Box::new(move || run_command("agent restart", &restart_command)),
        }
    }
}

fn run_command(label: &str, command: &str) -> i32 {
    info!("Invoking {} command: {}", label, command);
    match Command::new("sh").arg("-c").arg(command).status() {
        Ok(status) => status.code().unwrap_or(-1),
        Err(e) => {
            error!("Failed to invoke {} command: {}", label, e);
            -1
        }
    }
}
