// src/main.rs - Print job host: HTTP API in front of the SD card streamer
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;

use krusty_sdcard::capture::ShellCaptureDevice;
use krusty_sdcard::config;
use krusty_sdcard::gcode::HostDispatcher;
use krusty_sdcard::machine::TrackedMachine;
use krusty_sdcard::notify::{JobEventNotifier, NoopNotifier, RemoteLogNotifier};
use krusty_sdcard::print_job::{JobContext, PrintJobController};
use krusty_sdcard::print_stats::PrintStats;
use krusty_sdcard::timelapse::FileSettingsSource;
use krusty_sdcard::web;

/// Print job host
#[derive(Parser, Debug)]
#[command(name = "printer-host", about = "Streams G-code files from storage to the printer.")]
struct Cli {
    /// Path to the TOML config file
    #[arg(default_value = "printer.toml")]
    config: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync + 'static>> {
    let cli = Cli::parse();

    let config = match config::load_config(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            tracing_subscriber::fmt().with_max_level(tracing::Level::INFO).init();
            tracing::error!("Failed to load config from '{}': {}", cli.config, e);
            tracing::error!("Please ensure the configuration file exists and is properly formatted");
            return Err(e.into());
        }
    };

    // Initialize logging
    tracing_subscriber::fmt()
        .with_max_level(config.logging.max_level())
        .init();

    tracing::info!("Starting printer host {}", env!("CARGO_PKG_VERSION"));
    tracing::info!("Loaded configuration from: {}", cli.config);
    tracing::info!("Print files: {}", config.virtual_sdcard.path.display());
    tracing::info!(
        "Crash resume: {} (every {} lines)",
        config.resume.enabled,
        config.resume.checkpoint_interval
    );

    let machine = Arc::new(TrackedMachine::new());
    let dispatcher = Arc::new(HostDispatcher::new(machine.clone()));
    let stats = Arc::new(PrintStats::new());
    let notifier: Arc<dyn JobEventNotifier> = match RemoteLogNotifier::new(&config.notify) {
        Ok(notifier) => Arc::new(notifier),
        Err(e) => {
            tracing::warn!("Job notifications disabled: {}", e);
            Arc::new(NoopNotifier)
        }
    };

    let ctx = JobContext::new(&config, dispatcher.clone(), stats.clone())
        .with_machine(machine)
        .with_camera(Arc::new(ShellCaptureDevice::new(config.timelapse.clone())))
        .with_timelapse_settings(Arc::new(FileSettingsSource::new(
            config.timelapse.settings_path.clone(),
        )))
        .with_notifier(notifier);
    let controller = PrintJobController::new(ctx);
    dispatcher.attach(controller.clone());

    // Periodic host stats while printing.
    let stats_controller = controller.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(1));
        loop {
            interval.tick().await;
            let (active, line) = stats_controller.stats().await;
            if active {
                tracing::debug!("Stats: {}", line);
            }
        }
    });

    let app = web::api::create_router(web::api::AppState {
        controller: controller.clone(),
        dispatcher,
        stats,
    });

    let listener = tokio::net::TcpListener::bind(&config.web.listen).await?;
    tracing::info!("Web API listening on http://{}", listener.local_addr()?);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for shutdown signal: {}", e);
            }
            tracing::info!("Shutting down");
            controller.handle_shutdown().await;
        })
        .await?;

    Ok(())
}
