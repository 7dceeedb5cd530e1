//! Application options

use std::time::Duration;

use crate::storage::layout::StorageLayout;
use crate::storage::settings::Settings;
use crate::workers::engine;

/// Lifecycle options
#[derive(Debug, Clone)]
pub struct LifecycleOptions {
    /// Maximum time to wait for workers during shutdown
    pub max_shutdown_delay: Duration,
}

impl Default for LifecycleOptions {
    fn default() -> Self {
        Self {
            max_shutdown_delay: Duration::from_secs(10),
        }
    }
}

/// Top-level application options
#[derive(Debug, Clone, Default)]
pub struct AppOptions {
    /// Agent settings
    pub settings: Settings,

    /// Storage layout
    pub layout: StorageLayout,

    /// Engine worker options
    pub engine_worker: engine::Options,

    /// Lifecycle options
    pub lifecycle: LifecycleOptions,
}
