//! Engine worker
//!
//! Owns the workflow engine exclusively. Twin events and work ticks are
//! interleaved on this one task, so the engine processes inputs one at a
//! time in arrival order.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::info;

use crate::twin::TwinEvent;
use crate::workflow::engine::WorkflowEngine;

/// Engine worker options
#[derive(Debug, Clone)]
pub struct Options {
    /// Interval between work ticks
    pub tick_interval: Duration,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_millis(500),
        }
    }
}

/// Run the engine worker
pub async fn run<S, F>(
    options: &Options,
    mut engine: WorkflowEngine,
    mut events: mpsc::Receiver<TwinEvent>,
    sleep_fn: S,
    mut shutdown_signal: Pin<Box<dyn Future<Output = ()> + Send>>,
) where
    S: Fn(Duration) -> F,
    F: Future<Output = ()>,
{
    info!("Engine worker starting...");

    loop {
        tokio::select! {
            _ = &mut shutdown_signal => {
                info!("Engine worker shutting down...");
                engine.on_destroy().await;
                return;
            }
            event = events.recv() => match event {
                Some(TwinEvent::Connected) => {
                    engine.on_connected().await;
                }
                Some(TwinEvent::DesiredProperty { value, version }) => {
                    engine.on_desired_property(value, version).await;
                }
                None => {
                    info!("Twin event channel closed, shutting down...");
                    engine.on_destroy().await;
                    return;
                }
            },
            _ = sleep_fn(options.tick_interval) => {
                engine.do_work().await;
            }
        }
    }
}
