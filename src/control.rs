//! Control socket for communicating with the running supervisor.
//!
//! This module provides IPC between the warden CLI and the daemon via
//! a Unix domain socket carrying newline-delimited JSON.

use crate::app::InstanceStatus;
use crate::error::{Error, Result};
use crate::manager::{self, AppManager, AppSummary};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// File name of the control socket inside the runtime directory.
pub const CONTROL_SOCKET_NAME: &str = "control.sock";

/// Default path for the control socket.
pub fn default_socket_path() -> PathBuf {
    manager::default_runtime_dir().join(CONTROL_SOCKET_NAME)
}

/// Commands that can be sent to the supervisor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ControlCommand {
    /// Start an app
    Start { name: String },
    /// Gracefully stop an app
    Stop { name: String },
    /// Restart an app under its current descriptor
    Restart { name: String },
    /// Re-read the config file and restart an app under the fresh descriptor
    Reload { name: String },
    /// Get per-instance status of an app
    Status { name: String },
    /// List all registered apps
    List,
    /// Shut the supervisor down
    Shutdown,
    /// Check whether the supervisor is responding
    Ping,
}

/// Response from the supervisor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ControlResponse {
    /// Command succeeded
    Success { message: String },
    /// Command failed
    Error { message: String },
    /// Per-instance status for one app
    Status {
        app: String,
        instances: Vec<InstanceStatus>,
    },
    /// Registered apps
    AppList { apps: Vec<AppSummary> },
    /// Pong response
    Pong,
}

/// Execute a control command against the manager.
pub async fn dispatch(
    manager: &AppManager,
    shutdown: &broadcast::Sender<()>,
    command: ControlCommand,
) -> ControlResponse {
    match command {
        ControlCommand::Start { name } => match manager.start(&name).await {
            Ok(count) => ControlResponse::Success {
                message: format!("Started {} ({} instance(s))", name, count),
            },
            Err(e) => ControlResponse::Error {
                message: e.to_string(),
            },
        },
        ControlCommand::Stop { name } => match manager.stop(&name).await {
            Ok(()) => ControlResponse::Success {
                message: format!("Stopped {}", name),
            },
            Err(e) => ControlResponse::Error {
                message: e.to_string(),
            },
        },
        ControlCommand::Restart { name } => match manager.restart(&name).await {
            Ok(()) => ControlResponse::Success {
                message: format!("Restarted {}", name),
            },
            Err(e) => ControlResponse::Error {
                message: e.to_string(),
            },
        },
        ControlCommand::Reload { name } => match manager.reload(&name).await {
            Ok(()) => ControlResponse::Success {
                message: format!("Reloaded {}", name),
            },
            Err(e) => ControlResponse::Error {
                message: e.to_string(),
            },
        },
        ControlCommand::Status { name } => match manager.status(&name).await {
            Ok(instances) => ControlResponse::Status {
                app: name,
                instances,
            },
            Err(e) => ControlResponse::Error {
                message: e.to_string(),
            },
        },
        ControlCommand::List => ControlResponse::AppList {
            apps: manager.list().await,
        },
        ControlCommand::Shutdown => {
            info!("Shutdown requested over control socket");
            let _ = shutdown.send(());
            ControlResponse::Success {
                message: "Shutting down".to_string(),
            }
        }
        ControlCommand::Ping => ControlResponse::Pong,
    }
}

/// Control socket server (runs in the daemon).
pub struct ControlServer {
    socket_path: PathBuf,
    listener: Option<UnixListener>,
}

impl ControlServer {
    /// Create a new control server.
    pub fn new(socket_path: impl AsRef<Path>) -> Self {
        Self {
            socket_path: socket_path.as_ref().to_path_buf(),
            listener: None,
        }
    }

    /// Start listening for connections.
    pub async fn start(&mut self) -> Result<()> {
        if let Some(parent) = self.socket_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        // Remove a stale socket from a previous run.
        if self.socket_path.exists() {
            std::fs::remove_file(&self.socket_path)?;
        }

        let listener = UnixListener::bind(&self.socket_path)?;
        info!(path = %self.socket_path.display(), "Control socket listening");

        self.listener = Some(listener);
        Ok(())
    }

    /// Accept a single connection.
    pub async fn accept(&self) -> Result<UnixStream> {
        let listener = self
            .listener
            .as_ref()
            .ok_or_else(|| Error::Other("Control server not started".to_string()))?;

        let (stream, _addr) = listener.accept().await?;
        debug!("Accepted control connection");
        Ok(stream)
    }

    /// Read a command from a stream.
    pub async fn read_command(stream: &mut UnixStream) -> Result<ControlCommand> {
        let mut reader = BufReader::new(stream);
        let mut line = String::new();
        reader.read_line(&mut line).await?;

        let command: ControlCommand = serde_json::from_str(line.trim())
            .map_err(|e| Error::Other(format!("Failed to parse command: {}", e)))?;

        debug!(command = ?command, "Received control command");
        Ok(command)
    }

    /// Write a response to a stream.
    pub async fn write_response(stream: &mut UnixStream, response: &ControlResponse) -> Result<()> {
        let json = serde_json::to_string(response)
            .map_err(|e| Error::Other(format!("Failed to serialize response: {}", e)))?;

        stream.write_all(json.as_bytes()).await?;
        stream.write_all(b"\n").await?;
        stream.flush().await?;
        Ok(())
    }

    /// Get the socket path.
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }
}

impl Drop for ControlServer {
    fn drop(&mut self) {
        if self.socket_path.exists() {
            if let Err(e) = std::fs::remove_file(&self.socket_path) {
                warn!(error = %e, "Failed to remove control socket");
            }
        }
    }
}

/// Control socket client (used by the warden CLI).
pub struct ControlClient {
    socket_path: PathBuf,
}

impl ControlClient {
    /// Create a new control client.
    pub fn new(socket_path: impl AsRef<Path>) -> Self {
        Self {
            socket_path: socket_path.as_ref().to_path_buf(),
        }
    }

    /// Create with the default socket path.
    pub fn with_default_path() -> Self {
        Self::new(default_socket_path())
    }

    /// Connect to the supervisor.
    pub async fn connect(&self) -> Result<UnixStream> {
        if !self.socket_path.exists() {
            return Err(Error::Other(format!(
                "Control socket not found at {}. Is the supervisor running?",
                self.socket_path.display()
            )));
        }

        let stream = UnixStream::connect(&self.socket_path).await.map_err(|e| {
            Error::Other(format!(
                "Failed to connect to control socket: {}. Is the supervisor running?",
                e
            ))
        })?;

        Ok(stream)
    }

    /// Send a command and receive a response.
    pub async fn send_command(&self, command: ControlCommand) -> Result<ControlResponse> {
        let mut stream = self.connect().await?;

        let json = serde_json::to_string(&command)
            .map_err(|e| Error::Other(format!("Failed to serialize command: {}", e)))?;

        stream.write_all(json.as_bytes()).await?;
        stream.write_all(b"\n").await?;
        stream.flush().await?;

        let mut reader = BufReader::new(&mut stream);
        let mut line = String::new();
        reader.read_line(&mut line).await?;

        let response: ControlResponse = serde_json::from_str(line.trim())
            .map_err(|e| Error::Other(format!("Failed to parse response: {}", e)))?;

        Ok(response)
    }

    /// Convenience: is the supervisor up?
    pub async fn ping(&self) -> bool {
        matches!(
            self.send_command(ControlCommand::Ping).await,
            Ok(ControlResponse::Pong)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_serialization() {
        let cmd = ControlCommand::Start {
            name: "web".to_string(),
        };
        let json = serde_json::to_string(&cmd).unwrap();
        let parsed: ControlCommand = serde_json::from_str(&json).unwrap();

        match parsed {
            ControlCommand::Start { name } => assert_eq!(name, "web"),
            _ => panic!("Wrong command type"),
        }
    }

    #[test]
    fn test_response_serialization() {
        let resp = ControlResponse::Success {
            message: "Started web".to_string(),
        };
        let json = serde_json::to_string(&resp).unwrap();
        let parsed: ControlResponse = serde_json::from_str(&json).unwrap();

        match parsed {
            ControlResponse::Success { message } => assert_eq!(message, "Started web"),
            _ => panic!("Wrong response type"),
        }
    }

    #[test]
    fn test_summary_serialization() {
        let summary = AppSummary {
            name: "web".to_string(),
            state: crate::app::AppState::Running,
            mode: crate::app::ExecMode::Cluster,
            instances: 2,
            running: 2,
            restarts: 0,
        };
        let json = serde_json::to_string(&summary).unwrap();
        let parsed: AppSummary = serde_json::from_str(&json).unwrap();

        assert_eq!(parsed.name, "web");
        assert_eq!(parsed.state, crate::app::AppState::Running);
        assert_eq!(parsed.instances, 2);
    }
}
