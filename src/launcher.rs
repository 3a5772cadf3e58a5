//! Process launcher - turns a descriptor into a running child process.

use crate::app::AppDescriptor;
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use std::path::Path;
use std::process::Stdio;
use tokio::process::{Child, ChildStderr, ChildStdout, Command};

/// A freshly spawned child with its output pipes still attached.
#[derive(Debug)]
pub struct SpawnedChild {
    /// The child handle used for waiting and killing
    pub child: Child,
    /// OS process ID
    pub pid: u32,
    /// Spawn timestamp, the basis for uptime tracking
    pub started_at: DateTime<Utc>,
    /// Piped stdout, to be owned by the log multiplexer
    pub stdout: ChildStdout,
    /// Piped stderr, to be owned by the log multiplexer
    pub stderr: ChildStderr,
}

/// Build the command for one instance of an app.
///
/// The child inherits the ambient environment; descriptor keys are
/// applied on top and win on conflict. The supervisor adds `WARDEN_APP`
/// and `WARDEN_INSTANCE`, plus `NOTIFY_SOCKET` when readiness
/// notification is expected.
pub fn build_command(
    descriptor: &AppDescriptor,
    instance: u32,
    notify_path: Option<&Path>,
) -> Command {
    let mut command = match &descriptor.interpreter {
        Some(interpreter) => {
            let mut command = Command::new(interpreter);
            command.arg(&descriptor.script);
            command
        }
        None => Command::new(&descriptor.script),
    };

    command.args(&descriptor.args);
    command.envs(&descriptor.env);
    command.env("WARDEN_APP", &descriptor.name);
    command.env("WARDEN_INSTANCE", instance.to_string());
    if let Some(path) = notify_path {
        command.env("NOTIFY_SOCKET", path);
    }
    if let Some(cwd) = &descriptor.cwd {
        command.current_dir(cwd);
    }

    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    command
}

/// Spawn one instance of an app.
///
/// Failures to resolve or execute the command surface as `LaunchError`;
/// the restart policy decides whether to retry.
pub fn launch(
    descriptor: &AppDescriptor,
    instance: u32,
    notify_path: Option<&Path>,
) -> Result<SpawnedChild> {
    let mut child = build_command(descriptor, instance, notify_path)
        .spawn()
        .map_err(|e| Error::LaunchError {
            app: descriptor.name.clone(),
            reason: e.to_string(),
        })?;

    let pid = child.id().ok_or_else(|| Error::LaunchError {
        app: descriptor.name.clone(),
        reason: "child exited before a pid could be read".to_string(),
    })?;
    let stdout = child.stdout.take().ok_or_else(|| Error::LaunchError {
        app: descriptor.name.clone(),
        reason: "stdout pipe missing".to_string(),
    })?;
    let stderr = child.stderr.take().ok_or_else(|| Error::LaunchError {
        app: descriptor.name.clone(),
        reason: "stderr pipe missing".to_string(),
    })?;

    Ok(SpawnedChild {
        child,
        pid,
        started_at: Utc::now(),
        stdout,
        stderr,
    })
}
