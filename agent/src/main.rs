//! Update Agent - Entry Point
//!
//! A device-side update agent. Receives deployment instructions from the
//! update service, drives them through pluggable content handlers, and
//! reports progress and results back.

use std::collections::HashMap;
use std::env;
use std::sync::Arc;
use std::time::Duration;

use otagent::app::options::AppOptions;
use otagent::app::run::run;
use otagent::logs::{init_logging, LogOptions};
use otagent::storage::layout::StorageLayout;
use otagent::storage::settings::Settings;
use otagent::twin::{EchoTwinChannel, TwinEvent};
use otagent::utils::version_info;
use otagent::workers::engine;

use tokio::sync::mpsc;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() {
    // Parse command line arguments
    let args: Vec<String> = env::args().collect();
    let mut cli_args: HashMap<String, String> = HashMap::new();

    for arg in args.iter().skip(1) {
        if let Some((key, value)) = arg.split_once('=') {
            // Handle --key=value format
            let clean_key = key.trim_start_matches('-');
            cli_args.insert(clean_key.to_string(), value.to_string());
        } else if arg.starts_with("--") {
            // Handle standalone flags like --version
            let clean_key = arg.trim_start_matches('-');
            cli_args.insert(clean_key.to_string(), "true".to_string());
        }
    }

    // Print version and exit
    let version = version_info();
    if cli_args.contains_key("version") {
        println!("{}", serde_json::to_string_pretty(&version).unwrap());
        return;
    }

    // Retrieve the settings file; a missing or unreadable file falls back
    // to defaults so a bare device still comes up.
    let layout = match cli_args.get("storage") {
        Some(dir) => StorageLayout::new(dir.clone()),
        None => StorageLayout::default(),
    };
    let settings_file = layout.settings_file();
    let settings = match settings_file.read_json::<Settings>().await {
        Ok(settings) => settings,
        Err(e) => {
            warn!("Unable to read settings file ({}), using defaults", e);
            Settings::default()
        }
    };

    // Initialize logging
    let log_options = LogOptions {
        log_level: settings.log_level,
        ..Default::default()
    };
    if let Err(e) = init_logging(log_options) {
        println!("Failed to initialize logging: {e}");
    }

    // Development transport: the echo channel logs reported documents.
    // A production deployment replaces this with the cloud transport glue.
    let twin = Arc::new(EchoTwinChannel);
    let (events_tx, events_rx) = mpsc::channel(16);
    if events_tx.send(TwinEvent::Connected).await.is_err() {
        error!("Failed to queue the connected event");
        return;
    }

    let options = AppOptions {
        engine_worker: engine::Options {
            tick_interval: Duration::from_millis(settings.work_interval_ms),
        },
        settings,
        layout,
        ..Default::default()
    };

    info!("Running update agent with options: {:?}", options);
    let result = run(options, twin, events_rx, await_shutdown_signal()).await;
    if let Err(e) = result {
        error!("Failed to run the agent: {e}");
    }

    drop(events_tx);
}

async fn await_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).unwrap();
        let mut sigint = signal(SignalKind::interrupt()).unwrap();

        tokio::select! {
            _ = sigterm.recv() => {
                info!("SIGTERM received, shutting down...");
            }
            _ = sigint.recv() => {
                info!("SIGINT received, shutting down...");
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Ctrl+C received, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.expect("Failed to listen for Ctrl+C");
        info!("Ctrl+C received, shutting down...");
    }
}
