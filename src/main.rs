mod bluetooth;
mod config;
mod dispatcher;
mod error;
mod models;
mod protocol;
mod registry;
mod session;
mod utils;

use log::{error, info, warn};

use bluetooth::{open_adapter, scan_for_devices, BluerTransport};
use config::LoggerConfig;
use dispatcher::{work_queue, SessionProber};
use registry::DeviceRegistry;

async fn run(config: LoggerConfig) -> Result<(), Box<dyn std::error::Error>> {
    info!("Starting Govee sensor logger");

    let adapter = open_adapter().await?;
    let mut registry = DeviceRegistry::new(config.devices.clone());
    let (queue, dispatcher) = work_queue();
    let prober = SessionProber::new(BluerTransport::new(adapter.clone()), &config);

    // Probing starts as soon as the first sensor is queued, while discovery continues
    let discovery = async {
        let result = scan_for_devices(&adapter, config.scan_duration, &mut registry, &queue).await;
        queue.finish();
        result
    };
    let (scan_result, reports) = tokio::join!(discovery, dispatcher.run(&prober));
    if let Err(e) = scan_result {
        error!("Scan failed: {}", e);
    }

    // Warning if nothing was found
    if registry.is_empty() {
        warn!("No supported sensors found during the scan!");
    }
    info!(
        "Probed {} of {} sensors successfully",
        reports.len(),
        registry.len()
    );

    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .format_timestamp_secs()
        .init();

    // Load configuration
    let config = match LoggerConfig::new() {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            return Err(e.into());
        }
    };

    // Handle Ctrl+C gracefully
    let (tx, mut rx) = tokio::sync::oneshot::channel();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                let _ = tx.send(());
            }
            Err(e) => {
                error!("Failed to listen for Ctrl+C: {}", e);
                // Keep the sender alive so the run is not mistaken for an interrupt
                std::future::pending::<()>().await;
            }
        }
    });

    // Run until done or until the user interrupts
    tokio::select! {
        result = run(config) => {
            match result {
                Ok(_) => info!("Program completed successfully"),
                Err(e) => {
                    error!("Fatal error: {}", e);
                    return Err(e);
                }
            }
        }
        _ = &mut rx => {
            info!("Program terminated by user. Exiting gracefully.");
        }
    }

    Ok(())
}
