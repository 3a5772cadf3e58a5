//! Readiness notification socket.
//!
//! Apps started with `wait_ready` get a `NOTIFY_SOCKET` environment
//! variable naming a Unix datagram socket; writing `READY=1` to it
//! (the sd_notify wire convention) completes the startup phase before
//! the listen deadline.

use crate::error::Result;
use std::path::{Path, PathBuf};
use tokio::net::UnixDatagram;
use tracing::warn;

/// Server end of one instance's readiness socket.
pub struct ReadinessSocket {
    socket: UnixDatagram,
    path: PathBuf,
}

impl ReadinessSocket {
    /// Bind the readiness socket for an instance under `runtime_dir`.
    pub fn bind(runtime_dir: &Path, app: &str, instance: u32) -> Result<Self> {
        std::fs::create_dir_all(runtime_dir)?;
        let path = runtime_dir.join(format!("{}-{}.ready", app, instance));
        if path.exists() {
            std::fs::remove_file(&path)?;
        }
        let socket = UnixDatagram::bind(&path)?;
        Ok(Self { socket, path })
    }

    /// Path handed to the child as `NOTIFY_SOCKET`.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Resolve once a `READY=1` datagram arrives. Never resolves
    /// otherwise; the caller races this against the listen deadline.
    pub async fn ready(&self) {
        let mut buf = [0u8; 256];
        loop {
            match self.socket.recv(&mut buf).await {
                Ok(len) => {
                    let payload = String::from_utf8_lossy(&buf[..len]);
                    if payload.lines().any(|line| line.trim() == "READY=1") {
                        return;
                    }
                }
                Err(error) => {
                    warn!(path = %self.path.display(), %error, "Readiness socket read failed");
                    // Leave the startup decision to the listen deadline.
                    std::future::pending::<()>().await;
                }
            }
        }
    }
}

impl Drop for ReadinessSocket {
    fn drop(&mut self) {
        if let Err(error) = std::fs::remove_file(&self.path) {
            if error.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %self.path.display(), %error, "Failed to remove readiness socket");
            }
        }
    }
}
