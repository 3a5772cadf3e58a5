//! App manager - the supervisor registry and control-plane operations.
//!
//! One `AppManager` owns every registered app. It is an explicit object
//! passed around by `Arc`, never ambient state; instance actors hold no
//! reference back to it.

use crate::app::{AppDescriptor, AppState, ExecMode, InstanceStatus};
use crate::error::{Error, Result};
use crate::loaders;
use crate::supervisor::{spawn_instance, InstanceCommand, InstanceHandle, SupervisorContext};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::sync::RwLock;
use tracing::{error, info, warn};

/// Manager configuration.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// App configuration document
    pub config_path: PathBuf,
    /// Directory for readiness sockets and the control socket
    pub runtime_dir: PathBuf,
    /// Directory for default log files
    pub log_dir: PathBuf,
}

impl ManagerConfig {
    /// Create a config with default runtime and log directories.
    pub fn new(config_path: impl Into<PathBuf>) -> Self {
        Self {
            config_path: config_path.into(),
            runtime_dir: default_runtime_dir(),
            log_dir: default_log_dir(),
        }
    }
}

/// Default directory for sockets: `$XDG_RUNTIME_DIR/warden`, falling
/// back to `/run/warden`.
pub fn default_runtime_dir() -> PathBuf {
    match std::env::var_os("XDG_RUNTIME_DIR") {
        Some(dir) => PathBuf::from(dir).join("warden"),
        None => PathBuf::from("/run/warden"),
    }
}

/// Default directory for log files: `$HOME/.warden/logs`, falling back
/// to `/var/log/warden`.
pub fn default_log_dir() -> PathBuf {
    match std::env::var_os("HOME") {
        Some(home) => PathBuf::from(home).join(".warden").join("logs"),
        None => PathBuf::from("/var/log/warden"),
    }
}

/// One registered app: its descriptor plus the instance handles.
struct AppEntry {
    descriptor: AppDescriptor,
    instances: Vec<InstanceHandle>,
}

impl AppEntry {
    fn any_active(&self) -> bool {
        self.instances.iter().any(|handle| !handle.is_finished())
    }
}

/// Compact per-app row for listings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppSummary {
    pub name: String,
    pub state: AppState,
    pub mode: ExecMode,
    /// Configured instance count
    pub instances: u32,
    /// Instances currently running
    pub running: u32,
    /// Crash-loop restarts across instances
    pub restarts: u32,
}

/// The supervisor registry, keyed by app name.
pub struct AppManager {
    config: ManagerConfig,
    apps: RwLock<HashMap<String, AppEntry>>,
}

impl AppManager {
    /// Create an empty manager.
    pub fn new(config: ManagerConfig) -> Self {
        Self {
            config,
            apps: RwLock::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    fn context(&self) -> SupervisorContext {
        SupervisorContext {
            runtime_dir: self.config.runtime_dir.clone(),
            log_dir: self.config.log_dir.clone(),
        }
    }

    /// Load (or refresh) app descriptors from the configuration file.
    ///
    /// Names are immutable once registered: a known name keeps its
    /// entry and only the descriptor definition is refreshed; running
    /// instances keep the descriptor they were launched with.
    pub async fn load_apps(&self) -> Result<usize> {
        let descriptors = loaders::load_config(&self.config.config_path)?;

        let mut apps = self.apps.write().await;
        for descriptor in descriptors {
            match apps.get_mut(&descriptor.name) {
                Some(entry) => entry.descriptor = descriptor,
                None => {
                    apps.insert(
                        descriptor.name.clone(),
                        AppEntry {
                            descriptor,
                            instances: Vec::new(),
                        },
                    );
                }
            }
        }
        Ok(apps.len())
    }

    /// Start every registered app that is not already running.
    pub async fn start_all(&self) {
        for name in self.app_names().await {
            match self.start(&name).await {
                Ok(count) => info!(app = %name, instances = count, "Started"),
                Err(Error::AlreadyRunning(_)) => {}
                Err(e) => error!(app = %name, error = %e, "Failed to start"),
            }
        }
    }

    /// Start an app. Returns the number of instances launched.
    pub async fn start(&self, name: &str) -> Result<u32> {
        let mut apps = self.apps.write().await;
        let entry = apps
            .get_mut(name)
            .ok_or_else(|| Error::UnknownApp(name.to_string()))?;

        if entry.any_active() {
            return Err(Error::AlreadyRunning(name.to_string()));
        }

        let context = self.context();
        entry.instances = (0..entry.descriptor.instances)
            .map(|i| spawn_instance(entry.descriptor.clone(), i, context.clone()))
            .collect();
        Ok(entry.descriptor.instances)
    }

    /// Gracefully stop an app and wait for every instance to reach a
    /// terminal state (bounded by each instance's kill deadline).
    pub async fn stop(&self, name: &str) -> Result<()> {
        let mut apps = self.apps.write().await;
        let entry = apps
            .get_mut(name)
            .ok_or_else(|| Error::UnknownApp(name.to_string()))?;

        if !entry.any_active() {
            return Err(Error::NotRunning(name.to_string()));
        }

        for handle in &entry.instances {
            handle.send(InstanceCommand::Stop).await;
        }
        for handle in &mut entry.instances {
            handle.wait().await;
        }
        info!(app = %name, "Stopped");
        Ok(())
    }

    /// Restart an app: cycle live instances, respawn terminal ones.
    /// Starts the app if nothing is running.
    pub async fn restart(&self, name: &str) -> Result<()> {
        let mut apps = self.apps.write().await;
        let entry = apps
            .get_mut(name)
            .ok_or_else(|| Error::UnknownApp(name.to_string()))?;

        let context = self.context();
        if entry.any_active() {
            for handle in entry.instances.iter_mut() {
                if handle.is_finished() {
                    let instance = handle.snapshot().await.instance;
                    *handle = spawn_instance(entry.descriptor.clone(), instance, context.clone());
                } else {
                    handle.send(InstanceCommand::Restart).await;
                }
            }
        } else {
            entry.instances = (0..entry.descriptor.instances)
                .map(|i| spawn_instance(entry.descriptor.clone(), i, context.clone()))
                .collect();
        }
        info!(app = %name, "Restarted");
        Ok(())
    }

    /// Reload an app: re-read its descriptor from the configuration
    /// file, stop the running instances, and start fresh under the new
    /// definition.
    pub async fn reload(&self, name: &str) -> Result<()> {
        let descriptors = loaders::load_config(&self.config.config_path)?;
        let fresh = descriptors
            .into_iter()
            .find(|d| d.name == name)
            .ok_or_else(|| Error::UnknownApp(name.to_string()))?;

        let mut apps = self.apps.write().await;
        let entry = apps
            .get_mut(name)
            .ok_or_else(|| Error::UnknownApp(name.to_string()))?;
        entry.descriptor = fresh;

        for handle in &entry.instances {
            handle.send(InstanceCommand::Stop).await;
        }
        for handle in &mut entry.instances {
            handle.wait().await;
        }

        let context = self.context();
        entry.instances = (0..entry.descriptor.instances)
            .map(|i| spawn_instance(entry.descriptor.clone(), i, context.clone()))
            .collect();
        info!(app = %name, "Reloaded");
        Ok(())
    }

    /// Per-instance status for one app.
    pub async fn status(&self, name: &str) -> Result<Vec<InstanceStatus>> {
        let apps = self.apps.read().await;
        let entry = apps
            .get(name)
            .ok_or_else(|| Error::UnknownApp(name.to_string()))?;

        let mut statuses = Vec::with_capacity(entry.instances.len());
        for handle in &entry.instances {
            statuses.push(handle.snapshot().await);
        }
        Ok(statuses)
    }

    /// Summaries for every registered app, sorted by name.
    pub async fn list(&self) -> Vec<AppSummary> {
        let apps = self.apps.read().await;
        let mut summaries = Vec::with_capacity(apps.len());
        for (name, entry) in apps.iter() {
            let mut statuses = Vec::with_capacity(entry.instances.len());
            for handle in &entry.instances {
                statuses.push(handle.snapshot().await);
            }
            summaries.push(AppSummary {
                name: name.clone(),
                state: aggregate_state(&statuses),
                mode: entry.descriptor.exec_mode,
                instances: entry.descriptor.instances,
                running: statuses
                    .iter()
                    .filter(|s| s.state == AppState::Running)
                    .count() as u32,
                restarts: statuses.iter().map(|s| s.restart_count).sum(),
            });
        }
        summaries.sort_by(|a, b| a.name.cmp(&b.name));
        summaries
    }

    /// Registered app names, sorted.
    pub async fn app_names(&self) -> Vec<String> {
        let apps = self.apps.read().await;
        let mut names: Vec<String> = apps.keys().cloned().collect();
        names.sort();
        names
    }

    /// Stop every running app; used during daemon shutdown.
    pub async fn stop_all(&self) {
        for name in self.app_names().await {
            match self.stop(&name).await {
                Ok(()) | Err(Error::NotRunning(_)) => {}
                Err(e) => warn!(app = %name, error = %e, "Failed to stop"),
            }
        }
    }
}

/// Collapse instance states into one app-level state for listings.
fn aggregate_state(statuses: &[InstanceStatus]) -> AppState {
    if statuses.is_empty() {
        return AppState::Stopped;
    }
    for preferred in [
        AppState::Running,
        AppState::Listening,
        AppState::Starting,
        AppState::Stopping,
        AppState::Crashed,
    ] {
        if statuses.iter().any(|s| s.state == preferred) {
            return preferred;
        }
    }
    AppState::Stopped
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status_with(state: AppState) -> InstanceStatus {
        let mut status = InstanceStatus::new("svc", 0);
        status.state = state;
        status
    }

    #[test]
    fn test_aggregate_state_prefers_liveness() {
        assert_eq!(aggregate_state(&[]), AppState::Stopped);
        assert_eq!(
            aggregate_state(&[status_with(AppState::Stopped), status_with(AppState::Running)]),
            AppState::Running
        );
        assert_eq!(
            aggregate_state(&[status_with(AppState::Crashed), status_with(AppState::Starting)]),
            AppState::Starting
        );
        assert_eq!(
            aggregate_state(&[status_with(AppState::Stopped), status_with(AppState::Crashed)]),
            AppState::Crashed
        );
    }
}
