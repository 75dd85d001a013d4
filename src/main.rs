//! MatchRes Daemon - switches the display resolution while a game match runs.
//!
//! The daemon watches the game's processes and CPU load, learns an idle
//! baseline, applies the game resolution once a match is confirmed, and
//! restores the desktop resolution when the match ends.

mod baseline;
mod config;
mod core_logic;
mod display_control;
mod error;
mod ipc_server;
mod logging;
mod monitor;
mod notifier;
mod process_probe;
mod resolution;
mod sampler;
mod stability;

use config::ConfigManager;
use display_control::{CommandDisplayController, DisplayManager};
use error::DaemonError;
use ipc_server::DaemonState;
use monitor::{EngineHandle, MonitorEngine};
use notifier::StatusBoard;
use process_probe::SystemProbe;
use resolution::ResolutionConfig;
use sampler::Sampler;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

/// Pause before rebinding the control socket after a failure.
const IPC_RESTART_SECS: u64 = 5;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let _log_guard = logging::init_logging().map_err(|e| {
        eprintln!("Failed to initialize logging: {}", e);
        DaemonError::from(e)
    })?;

    info!(version = env!("CARGO_PKG_VERSION"), "MatchRes daemon starting");

    let result = run_daemon().await;

    match &result {
        Ok(()) => info!("MatchRes daemon shut down gracefully"),
        Err(e) => error!(error = %e, "MatchRes daemon error"),
    }

    result.map_err(Into::into)
}

async fn run_daemon() -> Result<(), DaemonError> {
    let config_path = ConfigManager::default_path();
    let config_manager = Arc::new(ConfigManager::load_or_default(&config_path)?);
    let config = config_manager.get();
    info!(path = %config_manager.path().display(), "Configuration loaded");

    let probe = Arc::new(SystemProbe::new());
    let cores = config.cpu_cores.unwrap_or_else(process_probe::logical_cores);
    let sampler = Sampler::new(probe.clone(), probe, cores);

    let controller = Arc::new(CommandDisplayController::new(
        config.display_command.clone(),
        config.display_timeout(),
    ));
    let display = Arc::new(DisplayManager::new(controller));
    let board = Arc::new(StatusBoard::new());
    let resolutions = Arc::new(ResolutionConfig::new(config.resolution_pair()));

    let engine = MonitorEngine::new(
        sampler,
        display,
        board.clone(),
        resolutions,
        config.monitor_settings(),
    );
    let (handle, engine_task) = engine.spawn();
    info!(
        cores,
        program = %config.display_command.program,
        "Monitoring engine ready"
    );

    if config.autostart {
        handle.start(None).await?;
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    tokio::spawn(async move {
        if let Err(e) = wait_for_signal().await {
            error!(error = %e, "Signal handler error");
        }
        let _ = shutdown_tx.send(true);
    });

    let state = Arc::new(DaemonState::new(handle.clone(), config_manager, board));
    let ipc_task = tokio::spawn(run_ipc_server(state, shutdown_rx.clone()));

    let mut shutdown = shutdown_rx;
    shutdown.changed().await.ok();
    info!("Shutdown signal received, stopping monitoring");

    stop_engine(&handle, config.shutdown_timeout()).await;
    let _ = tokio::time::timeout(Duration::from_secs(1), ipc_task).await;

    drop(handle);
    engine_task.abort();
    Ok(())
}

/// Stop monitoring so the desktop resolution is restored before exit.
async fn stop_engine(handle: &EngineHandle, timeout: Duration) {
    match tokio::time::timeout(timeout, handle.stop()).await {
        Ok(Ok(())) => info!("Monitoring stopped"),
        Ok(Err(e)) => warn!(error = %e, "Engine already gone at shutdown"),
        Err(_) => warn!(
            timeout_ms = timeout.as_millis() as u64,
            "Timed out stopping monitoring"
        ),
    }
}

/// Wait for SIGTERM or SIGINT.
#[cfg(unix)]
async fn wait_for_signal() -> Result<(), std::io::Error> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    tokio::select! {
        _ = sigterm.recv() => info!("Received SIGTERM"),
        _ = sigint.recv() => info!("Received SIGINT"),
    }
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_signal() -> Result<(), std::io::Error> {
    tokio::signal::ctrl_c().await?;
    info!("Received Ctrl+C");
    Ok(())
}

/// Serve the control socket until shutdown, rebinding after failures.
async fn run_ipc_server(state: Arc<DaemonState>, mut shutdown_rx: watch::Receiver<bool>) {
    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    info!("IPC server shutting down");
                    break;
                }
            }
            result = serve_ipc(Arc::clone(&state)) => {
                match result {
                    Ok(()) => break,
                    Err(e) => {
                        error!(error = %e, retry_secs = IPC_RESTART_SECS, "IPC server error, restarting");
                        tokio::time::sleep(Duration::from_secs(IPC_RESTART_SECS)).await;
                    }
                }
            }
        }
    }
}

#[cfg(unix)]
async fn serve_ipc(state: Arc<DaemonState>) -> Result<(), error::IpcError> {
    let server = ipc_server::IpcServer::new(ipc_server::DEFAULT_SOCKET_PATH).await?;
    info!(path = %server.socket_path().display(), "IPC server listening");
    server.run(state).await
}

#[cfg(not(unix))]
async fn serve_ipc(_state: Arc<DaemonState>) -> Result<(), error::IpcError> {
    warn!("Control socket not available on this platform");
    std::future::pending::<()>().await;
    Ok(())
}
