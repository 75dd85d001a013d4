//! IPC Server module for the control socket.
//!
//! Clients send newline-delimited JSON commands over a Unix Domain Socket and
//! receive one JSON response line per command.

use crate::config::ConfigManager;
use crate::error::IpcError;
use crate::monitor::{EngineHandle, EngineStatus};
use crate::notifier::StatusBoard;
use crate::resolution::{Resolution, ResolutionPair};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

#[cfg(unix)]
use std::path::{Path, PathBuf};
#[cfg(unix)]
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
#[cfg(unix)]
use tokio::net::{UnixListener, UnixStream};

/// Default socket path for IPC communication.
pub const DEFAULT_SOCKET_PATH: &str = "/tmp/match-res.sock";

/// Commands that can be received via IPC.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(tag = "command")]
pub enum IpcCommand {
    /// Start monitoring; either resolution may override the configured one.
    Start {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        game: Option<Resolution>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        desktop: Option<Resolution>,
    },
    Stop,
    /// Hot-swap and persist both resolutions.
    UpdateResolutions {
        game: Resolution,
        desktop: Resolution,
    },
    /// Apply a resolution right away.
    SetResolution {
        resolution: Resolution,
    },
    GetStatus,
}

/// Status response sent to clients.
#[derive(Debug, Serialize, Clone, PartialEq)]
pub struct StatusResponse {
    #[serde(flatten)]
    pub engine: EngineStatus,
    pub last_status: Option<String>,
    pub ui_visible: bool,
}

/// Shared daemon state accessible by the IPC server.
pub struct DaemonState {
    pub engine: EngineHandle,
    pub config_manager: Arc<ConfigManager>,
    pub board: Arc<StatusBoard>,
}

impl DaemonState {
    pub fn new(
        engine: EngineHandle,
        config_manager: Arc<ConfigManager>,
        board: Arc<StatusBoard>,
    ) -> Self {
        Self {
            engine,
            config_manager,
            board,
        }
    }

    pub async fn get_status(&self) -> Result<StatusResponse, IpcError> {
        let engine = self.engine.status().await?;
        Ok(StatusResponse {
            engine,
            last_status: self.board.last_status(),
            ui_visible: self.board.is_visible(),
        })
    }
}

fn failure(error: impl std::fmt::Display) -> serde_json::Value {
    serde_json::json!({ "success": false, "error": error.to_string() })
}

fn success(message: impl Into<String>) -> serde_json::Value {
    serde_json::json!({ "success": true, "message": message.into() })
}

/// Handle a single IPC command and return the response.
pub async fn handle_command(command: IpcCommand, state: &DaemonState) -> serde_json::Value {
    match command {
        IpcCommand::Start { game, desktop } => {
            let resolutions = if game.is_some() || desktop.is_some() {
                let configured = state.config_manager.get().resolution_pair();
                Some(ResolutionPair::new(
                    game.unwrap_or(configured.game),
                    desktop.unwrap_or(configured.desktop),
                ))
            } else {
                None
            };
            match state.engine.start(resolutions).await {
                Ok(()) => {
                    info!("Monitoring started via IPC");
                    success("Monitoring started")
                }
                Err(e) => failure(e),
            }
        }

        IpcCommand::Stop => match state.engine.stop().await {
            Ok(()) => {
                info!("Monitoring stopped via IPC");
                success("Monitoring stopped")
            }
            Err(e) => failure(e),
        },

        IpcCommand::UpdateResolutions { game, desktop } => {
            let pair = ResolutionPair::new(game, desktop);
            if let Err(e) = state.config_manager.update_resolutions(pair) {
                warn!(error = %e, "Failed to persist resolutions");
                return failure(e);
            }
            match state.engine.update_resolutions(pair).await {
                Ok(()) => success(format!("Resolutions set: game {}, desktop {}", game, desktop)),
                Err(e) => failure(e),
            }
        }

        IpcCommand::SetResolution { resolution } => {
            match state.engine.set_resolution_now(resolution).await {
                Ok(()) => success(format!("Resolution changed to {}", resolution)),
                Err(e) => {
                    warn!(%resolution, error = %e, "Manual resolution change failed via IPC");
                    failure(e)
                }
            }
        }

        IpcCommand::GetStatus => match state.get_status().await {
            Ok(status) => serde_json::to_value(status).unwrap_or_else(|e| {
                serde_json::json!({ "error": format!("Failed to serialize status: {}", e) })
            }),
            Err(e) => failure(e),
        },
    }
}

/// Unix Domain Socket server for IPC.
#[cfg(unix)]
pub struct IpcServer {
    socket_path: PathBuf,
    listener: UnixListener,
}

#[cfg(unix)]
impl IpcServer {
    /// Bind at `path`, replacing any stale socket file.
    pub async fn new(path: &str) -> Result<Self, IpcError> {
        let socket_path = PathBuf::from(path);

        Self::cleanup_socket(&socket_path)?;

        let listener = UnixListener::bind(&socket_path).map_err(|e| IpcError::SocketBindFailed {
            path: path.to_string(),
            source: e,
        })?;

        Ok(Self {
            socket_path,
            listener,
        })
    }

    fn cleanup_socket(path: &Path) -> Result<(), IpcError> {
        if path.exists() {
            std::fs::remove_file(path).map_err(|e| IpcError::SocketBindFailed {
                path: path.display().to_string(),
                source: e,
            })?;
        }
        Ok(())
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Accept connections forever, one task per client.
    pub async fn run(&self, state: Arc<DaemonState>) -> Result<(), IpcError> {
        loop {
            match self.listener.accept().await {
                Ok((stream, _addr)) => {
                    let state = Arc::clone(&state);
                    tokio::spawn(async move {
                        if let Err(e) = Self::handle_connection(stream, state).await {
                            warn!(error = %e, "Error handling IPC connection");
                        }
                    });
                }
                Err(e) => {
                    tracing::error!(error = %e, "Error accepting IPC connection");
                }
            }
        }
    }

    async fn handle_connection(stream: UnixStream, state: Arc<DaemonState>) -> Result<(), IpcError> {
        let (reader, mut writer) = stream.into_split();
        let mut reader = BufReader::new(reader);
        let mut line = String::new();

        while reader.read_line(&mut line).await? > 0 {
            let trimmed = line.trim();
            if trimmed.is_empty() {
                line.clear();
                continue;
            }

            let response = match serde_json::from_str::<IpcCommand>(trimmed) {
                Ok(command) => handle_command(command, &state).await,
                Err(e) => {
                    let err = IpcError::InvalidCommand(e.to_string());
                    serde_json::json!({ "error": err.to_string() })
                }
            };

            let response_str = serde_json::to_string(&response)?;
            writer.write_all(response_str.as_bytes()).await?;
            writer.write_all(b"\n").await?;
            writer.flush().await?;

            line.clear();
        }

        Ok(())
    }
}

#[cfg(unix)]
impl Drop for IpcServer {
    fn drop(&mut self) {
        if self.socket_path.exists() {
            let _ = std::fs::remove_file(&self.socket_path);
        }
    }
}
