//! Content handler contract and registry

pub mod simulator;

use std::collections::HashMap;

use async_trait::async_trait;
use tracing::debug;

use crate::model::result::UpdateResult;
use crate::workflow::object::Workflow;

/// Pluggable implementation of the update phases for one update type.
///
/// Operations must be short, or drive a bounded-duration step per call and
/// return an in-progress code; blocking indefinitely stalls the engine.
/// An instance belongs to one workflow and is dropped with it.
#[async_trait]
pub trait ContentHandler: Send + Sync {
    /// Fetch and verify all files referenced by the manifest into the
    /// workflow's work folder.
    async fn download(&mut self, workflow: &Workflow) -> UpdateResult;

    /// Apply content to a staging area without committing.
    async fn install(&mut self, workflow: &Workflow) -> UpdateResult;

    /// Commit the update. May request a reboot or agent restart through a
    /// result-code variant.
    async fn apply(&mut self, workflow: &Workflow) -> UpdateResult;

    /// Roll back any pending work. Safe to call at any time, best-effort.
    async fn cancel(&mut self, workflow: &Workflow) -> UpdateResult;

    /// Report whether the workflow's installed criteria already holds on
    /// the device. Used for post-reboot verification and idempotence.
    async fn is_installed(&self, workflow: &Workflow) -> UpdateResult;
}

/// Factory producing one handler instance per workflow.
pub type HandlerFactory = Box<dyn Fn() -> Box<dyn ContentHandler> + Send + Sync>;

/// Maps update-type strings to handler factories. Lookup is exact-match.
#[derive(Default)]
pub struct HandlerRegistry {
    factories: HashMap<String, HandlerFactory>,
}

impl HandlerRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in simulator handler registered
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        let state = simulator::SimulatorState::shared();
        registry.register(simulator::SIMULATOR_UPDATE_TYPE, simulator::factory(state));
        registry
    }

    /// Register a handler factory for an update type
    pub fn register(&mut self, update_type: &str, factory: HandlerFactory) {
        debug!("Registering content handler for '{}'", update_type);
        self.factories.insert(update_type.to_string(), factory);
    }

    /// Instantiate a handler for an update type
    pub fn lookup(&self, update_type: &str) -> Option<Box<dyn ContentHandler>> {
        self.factories.get(update_type).map(|factory| factory())
    }

    /// Whether a handler is registered for an update type
    pub fn contains(&self, update_type: &str) -> bool {
        self.factories.contains_key(update_type)
    }
}
