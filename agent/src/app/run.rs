//! Main application run loop

use std::future::Future;
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::app::options::{AppOptions, LifecycleOptions};
use crate::capabilities::Capabilities;
use crate::errors::AgentError;
use crate::handlers::HandlerRegistry;
use crate::twin::{TwinChannel, TwinEvent};
use crate::workers::engine as engine_worker;
use crate::workflow::engine::WorkflowEngine;

/// Run the update agent until the shutdown signal resolves.
///
/// The twin channel and event receiver come from the transport glue; tests
/// and the development assembly inject their own.
pub async fn run(
    options: AppOptions,
    twin: Arc<dyn TwinChannel>,
    events: mpsc::Receiver<TwinEvent>,
    shutdown_signal: impl Future<Output = ()> + Send + 'static,
) -> Result<(), AgentError> {
    info!("Initializing update agent...");

    options.layout.setup().await?;

    let registry = HandlerRegistry::with_defaults();
    let capabilities = Capabilities::from_settings(&options.settings);
    let engine = WorkflowEngine::new(
        twin,
        registry,
        capabilities,
        options.settings.clone(),
        options.layout.clone(),
    );

    // Create shutdown channel
    let (shutdown_tx, _shutdown_rx): (broadcast::Sender<()>, _) = broadcast::channel(1);
    let mut shutdown_manager = ShutdownManager::new(shutdown_tx.clone(), options.lifecycle.clone());

    init_engine_worker(
        options.engine_worker.clone(),
        engine,
        events,
        &mut shutdown_manager,
        shutdown_tx.subscribe(),
    )?;

    shutdown_signal.await;
    info!("Shutdown signal received, shutting down...");

    drop(shutdown_tx);
    shutdown_manager.shutdown().await
}

fn init_engine_worker(
    options: engine_worker::Options,
    engine: WorkflowEngine,
    events: mpsc::Receiver<TwinEvent>,
    shutdown_manager: &mut ShutdownManager,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), AgentError> {
    info!("Initializing engine worker...");

    let engine_handle = tokio::spawn(async move {
        engine_worker::run(
            &options,
            engine,
            events,
            |wait| tokio::time::sleep(wait),
            Box::pin(async move {
                let _ = shutdown_rx.recv().await;
            }),
        )
        .await;
    });

    shutdown_manager.with_engine_worker_handle(engine_handle)
}

// ================================= SHUTDOWN ===================================== //

struct ShutdownManager {
    shutdown_tx: broadcast::Sender<()>,
    lifecycle_options: LifecycleOptions,
    engine_worker_handle: Option<JoinHandle<()>>,
}

impl ShutdownManager {
    pub fn new(shutdown_tx: broadcast::Sender<()>, lifecycle_options: LifecycleOptions) -> Self {
        Self {
            shutdown_tx,
            lifecycle_options,
            engine_worker_handle: None,
        }
    }

    pub fn with_engine_worker_handle(&mut self, handle: JoinHandle<()>) -> Result<(), AgentError> {
        if self.engine_worker_handle.is_some() {
            return Err(AgentError::ShutdownError("engine_handle already set".to_string()));
        }
        self.engine_worker_handle = Some(handle);
        Ok(())
    }

    pub async fn shutdown(&mut self) -> Result<(), AgentError> {
        let _ = self.shutdown_tx.send(());

        match tokio::time::timeout(
            self.lifecycle_options.max_shutdown_delay,
            self.shutdown_impl(),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => {
                error!(
                    "Shutdown timed out after {:?}, forcing shutdown...",
                    self.lifecycle_options.max_shutdown_delay
                );
                std::process::exit(1);
            }
        }
    }

    async fn shutdown_impl(&mut self) -> Result<(), AgentError> {
        info!("Shutting down update agent...");

        if let Some(handle) = self.engine_worker_handle.take() {
            handle.await.map_err(|e| AgentError::ShutdownError(e.to_string()))?;
        }

        info!("Shutdown complete");
        Ok(())
    }
}
