//! Storage layout configuration

use std::path::PathBuf;

use crate::filesys::dir::Dir;
use crate::filesys::file::File;

/// Storage layout for the agent
#[derive(Debug, Clone)]
pub struct StorageLayout {
    /// Base directory for all storage
    pub base_dir: PathBuf,
}

impl StorageLayout {
    /// Create a new storage layout
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    /// Get the settings file path
    pub fn settings_file(&self) -> File {
        File::new(self.base_dir.join("settings.json"))
    }

    /// Get the persisted workflow record path
    pub fn persistence_file(&self) -> File {
        File::new(self.base_dir.join("workflow_state.json"))
    }

    /// Get the downloads directory holding per-deployment work folders
    pub fn downloads_dir(&self) -> Dir {
        Dir::new(self.base_dir.join("downloads"))
    }

    /// Get the work folder for one deployment. The folder is exclusively
    /// owned by that workflow for the lifetime of the deployment.
    pub fn work_folder(&self, workflow_id: &str) -> Dir {
        self.downloads_dir().subdir(workflow_id)
    }

    /// Setup the storage layout (create directories)
    pub async fn setup(&self) -> Result<(), crate::errors::AgentError> {
        self.downloads_dir().create().await?;
        Ok(())
    }
}

impl Default for StorageLayout {
    fn default() -> Self {
        // System state directory on Linux; a dot directory under the user's
        // home elsewhere (falling back to the working directory).
        if cfg!(target_os = "linux") {
            return Self::new("/var/lib/otagent");
        }

        let home = std::env::var_os("HOME")
            .or_else(|| std::env::var_os("USERPROFILE"))
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));
        Self::new(home.join(".otagent"))
    }
}
