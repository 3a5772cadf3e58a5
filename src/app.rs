//! App descriptor types and states for the supervisor.

use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

/// Execution model for an app.
///
/// The supervisor has no in-process worker model, so `cluster` spawns
/// `instances` independent children exactly like `fork`; each child
/// receives `WARDEN_INSTANCE` so the app can shard itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ExecMode {
    /// One or more independent single processes
    #[default]
    Fork,
    /// Instance-sharded processes (process-level only)
    Cluster,
}

impl std::fmt::Display for ExecMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecMode::Fork => f.pad("fork"),
            ExecMode::Cluster => f.pad("cluster"),
        }
    }
}

/// Current state of a supervised instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AppState {
    /// Child spawned, readiness deadline pending
    Starting,
    /// Readiness confirmed or deadline elapsed without requirement
    Listening,
    /// Alive and under supervision
    Running,
    /// Graceful-termination signal delivered, kill deadline pending
    Stopping,
    /// Terminal: exited on request or completed normally
    #[default]
    Stopped,
    /// Exited unexpectedly; restart policy is being evaluated
    Crashed,
}

impl AppState {
    /// Whether the instance is live or on its way up/down.
    pub fn is_active(&self) -> bool {
        !matches!(self, AppState::Stopped | AppState::Crashed)
    }
}

impl std::fmt::Display for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AppState::Starting => f.pad("starting"),
            AppState::Listening => f.pad("listening"),
            AppState::Running => f.pad("running"),
            AppState::Stopping => f.pad("stopping"),
            AppState::Stopped => f.pad("stopped"),
            AppState::Crashed => f.pad("crashed"),
        }
    }
}

/// App descriptor - describes how to launch and supervise one app.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppDescriptor {
    /// Unique name of the app (supplied by the config table key)
    #[serde(default)]
    pub name: String,
    /// Script or executable to run
    pub script: String,
    /// Interpreter to run the script with (e.g. "python3")
    #[serde(default)]
    pub interpreter: Option<String>,
    /// Arguments passed to the script
    #[serde(default)]
    pub args: Vec<String>,
    /// Number of instances to keep running
    #[serde(default = "default_instances")]
    pub instances: u32,
    /// Execution mode
    #[serde(default)]
    pub exec_mode: ExecMode,
    /// Working directory for the child
    #[serde(default)]
    pub cwd: Option<PathBuf>,
    /// Environment variables, merged over the ambient environment
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// File receiving stdout lines
    #[serde(default)]
    pub out_file: Option<PathBuf>,
    /// File receiving stderr lines
    #[serde(default)]
    pub error_file: Option<PathBuf>,
    /// File receiving both streams interleaved in arrival order
    #[serde(default)]
    pub log_file: Option<PathBuf>,
    /// Timestamp format for log line prefixes (chrono format string)
    #[serde(default = "default_time_format")]
    pub time_format: String,
    /// Route both streams into `log_file` only
    #[serde(default)]
    pub merge_logs: bool,
    /// Whether to restart the app after an unexpected exit
    #[serde(default = "default_autorestart")]
    pub autorestart: bool,
    /// Resident-memory ceiling; exceeding it forces a deliberate restart
    #[serde(default)]
    #[serde(with = "opt_size_str")]
    pub max_memory_restart: Option<u64>,
    /// Crash-loop quota: restarts attempted before giving up
    #[serde(default = "default_max_restarts")]
    pub max_restarts: u32,
    /// Uptime below which an exit counts against the crash-loop quota
    #[serde(default = "default_min_uptime")]
    #[serde(with = "duration_str")]
    pub min_uptime: Duration,
    /// Startup deadline in milliseconds
    #[serde(default = "default_listen_timeout")]
    #[serde(with = "duration_ms")]
    pub listen_timeout: Duration,
    /// Shutdown deadline in milliseconds before escalating to SIGKILL
    #[serde(default = "default_kill_timeout")]
    #[serde(with = "duration_ms")]
    pub kill_timeout: Duration,
    /// Require an explicit READY=1 notification before the startup deadline
    #[serde(default)]
    pub wait_ready: bool,
    /// Graceful-termination signal name
    #[serde(default = "default_stop_signal")]
    pub stop_signal: String,
    /// Fixed delay between a crash and the next launch, in milliseconds
    #[serde(default = "default_restart_delay")]
    #[serde(with = "duration_ms")]
    pub restart_delay: Duration,
    /// Initial exponential-backoff delay in milliseconds; doubles per
    /// consecutive rapid crash, capped at 15s, reset by a stable run
    #[serde(default)]
    #[serde(with = "opt_duration_ms")]
    pub exp_backoff_restart_delay: Option<Duration>,
}

fn default_instances() -> u32 {
    1
}

fn default_time_format() -> String {
    "%Y-%m-%d %H:%M:%S %z".to_string()
}

fn default_autorestart() -> bool {
    true
}

fn default_max_restarts() -> u32 {
    16
}

fn default_min_uptime() -> Duration {
    Duration::from_millis(1000)
}

fn default_listen_timeout() -> Duration {
    Duration::from_millis(3000)
}

fn default_kill_timeout() -> Duration {
    Duration::from_millis(1600)
}

fn default_stop_signal() -> String {
    "SIGTERM".to_string()
}

fn default_restart_delay() -> Duration {
    Duration::ZERO
}

/// Module for millisecond duration serialization.
mod duration_ms {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let ms = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(ms))
    }
}

/// Module for optional millisecond duration serialization.
mod opt_duration_ms {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match duration {
            Some(d) => serializer.serialize_some(&(d.as_millis() as u64)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let opt: Option<u64> = Option::deserialize(deserializer)?;
        Ok(opt.map(Duration::from_millis))
    }
}

/// Module for duration-string serialization ("10s", "500ms", bare ms).
mod duration_str {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format!("{}ms", duration.as_millis()))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        super::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}

/// Module for optional size-string serialization ("500M").
mod opt_size_str {
    use serde::{self, Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(size: &Option<u64>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match size {
            Some(bytes) => serializer.serialize_some(&bytes.to_string()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<u64>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let opt: Option<String> = Option::deserialize(deserializer)?;
        opt.map(|s| super::parse_size(&s).map_err(serde::de::Error::custom))
            .transpose()
    }
}

/// Parse a duration string: "10s", "5m", "1h", "500ms", or bare milliseconds.
pub fn parse_duration(input: &str) -> std::result::Result<Duration, String> {
    let s = input.trim();
    if s.is_empty() {
        return Err("empty duration".to_string());
    }

    let (digits, unit) = match s.find(|c: char| !c.is_ascii_digit()) {
        Some(pos) => s.split_at(pos),
        None => (s, ""),
    };

    let value: u64 = digits
        .parse()
        .map_err(|_| format!("invalid duration '{}'", input))?;

    match unit.trim() {
        "" | "ms" => Ok(Duration::from_millis(value)),
        "s" => Ok(Duration::from_secs(value)),
        "m" => Ok(Duration::from_secs(value * 60)),
        "h" => Ok(Duration::from_secs(value * 3600)),
        other => Err(format!("unknown duration unit '{}' in '{}'", other, input)),
    }
}

/// Parse a size string: "500M", "1G", "512K", or bare bytes.
pub fn parse_size(input: &str) -> std::result::Result<u64, String> {
    let s = input.trim();
    if s.is_empty() {
        return Err("empty size".to_string());
    }

    let (digits, unit) = match s.find(|c: char| !c.is_ascii_digit()) {
        Some(pos) => s.split_at(pos),
        None => (s, ""),
    };

    let value: u64 = digits
        .parse()
        .map_err(|_| format!("invalid size '{}'", input))?;

    let multiplier = match unit.trim() {
        "" | "B" => 1,
        "K" | "KB" => 1024,
        "M" | "MB" => 1024 * 1024,
        "G" | "GB" => 1024 * 1024 * 1024,
        other => return Err(format!("unknown size unit '{}' in '{}'", other, input)),
    };

    Ok(value * multiplier)
}

impl AppDescriptor {
    /// Create a descriptor with minimal configuration.
    pub fn new(name: impl Into<String>, script: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            script: script.into(),
            interpreter: None,
            args: Vec::new(),
            instances: default_instances(),
            exec_mode: ExecMode::default(),
            cwd: None,
            env: HashMap::new(),
            out_file: None,
            error_file: None,
            log_file: None,
            time_format: default_time_format(),
            merge_logs: false,
            autorestart: default_autorestart(),
            max_memory_restart: None,
            max_restarts: default_max_restarts(),
            min_uptime: default_min_uptime(),
            listen_timeout: default_listen_timeout(),
            kill_timeout: default_kill_timeout(),
            wait_ready: false,
            stop_signal: default_stop_signal(),
            restart_delay: default_restart_delay(),
            exp_backoff_restart_delay: None,
        }
    }

    /// Validate required fields and field shapes.
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::ConfigError("app name must not be empty".to_string()));
        }
        if self.name.contains(|c: char| c.is_whitespace() || c == '/') {
            return Err(Error::ConfigError(format!(
                "app name '{}' must not contain whitespace or '/'",
                self.name
            )));
        }
        if self.script.is_empty() {
            return Err(Error::ConfigError(format!(
                "app '{}' is missing required field 'script'",
                self.name
            )));
        }
        if self.instances == 0 {
            return Err(Error::ConfigError(format!(
                "app '{}': instances must be at least 1",
                self.name
            )));
        }
        let mut items = chrono::format::StrftimeItems::new(&self.time_format);
        if items.any(|item| matches!(item, chrono::format::Item::Error)) {
            return Err(Error::ConfigError(format!(
                "app '{}': invalid time_format '{}'",
                self.name, self.time_format
            )));
        }
        self.parsed_stop_signal()?;
        Ok(())
    }

    /// The graceful-termination signal, parsed.
    pub fn parsed_stop_signal(&self) -> Result<nix::sys::signal::Signal> {
        nix::sys::signal::Signal::from_str(&self.stop_signal).map_err(|_| {
            Error::ConfigError(format!(
                "app '{}': unknown stop signal '{}'",
                self.name, self.stop_signal
            ))
        })
    }
}

/// Runtime information about one supervised instance.
///
/// Updated exclusively by the instance's controller task and shared by
/// reference with the manager for status reporting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceStatus {
    /// Unique instance ID
    pub id: Uuid,
    /// App name
    pub app: String,
    /// Instance number within the app (0-based)
    pub instance: u32,
    /// Current state
    pub state: AppState,
    /// OS process ID (if running)
    pub pid: Option<u32>,
    /// Time when the current child was started
    pub started_at: Option<DateTime<Utc>>,
    /// Time when the instance stopped
    pub stopped_at: Option<DateTime<Utc>>,
    /// Exit code of the last child (if exited)
    pub exit_code: Option<i32>,
    /// Signal that killed the last child (if signal-terminated)
    pub exit_signal: Option<i32>,
    /// Crash-loop restart counter
    pub restart_count: u32,
    /// Why the instance reached a terminal failure, if it did
    pub failure_reason: Option<String>,
}

impl InstanceStatus {
    /// Create a fresh status record.
    pub fn new(app: impl Into<String>, instance: u32) -> Self {
        Self {
            id: Uuid::new_v4(),
            app: app.into(),
            instance,
            state: AppState::Stopped,
            pid: None,
            started_at: None,
            stopped_at: None,
            exit_code: None,
            exit_signal: None,
            restart_count: 0,
            failure_reason: None,
        }
    }

    /// Uptime of the current child, if one is running.
    pub fn uptime(&self) -> Option<Duration> {
        self.started_at.map(|start| {
            let duration = Utc::now().signed_duration_since(start);
            Duration::from_secs(duration.num_seconds().max(0) as u64)
        })
    }
}

/// Get resident memory for a process from /proc/{pid}/statm.
pub fn resident_memory(pid: u32) -> Option<u64> {
    let statm_path = format!("/proc/{}/statm", pid);
    let content = std::fs::read_to_string(statm_path).ok()?;
    let mut parts = content.split_whitespace();

    // Second field is resident set size in pages
    let rss_pages: u64 = parts.nth(1)?.parse().ok()?;
    let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if page_size <= 0 {
        return None;
    }
    Some(rss_pages * page_size as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_duration_units() {
        assert_eq!(parse_duration("10s").unwrap(), Duration::from_secs(10));
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
        assert_eq!(parse_duration("250").unwrap(), Duration::from_millis(250));
    }

    #[test]
    fn test_parse_duration_rejects_garbage() {
        assert!(parse_duration("").is_err());
        assert!(parse_duration("10 fortnights").is_err());
        assert!(parse_duration("s10").is_err());
    }

    #[test]
    fn test_parse_size_units() {
        assert_eq!(parse_size("512").unwrap(), 512);
        assert_eq!(parse_size("512K").unwrap(), 512 * 1024);
        assert_eq!(parse_size("500M").unwrap(), 500 * 1024 * 1024);
        assert_eq!(parse_size("1G").unwrap(), 1024 * 1024 * 1024);
    }

    #[test]
    fn test_parse_size_rejects_garbage() {
        assert!(parse_size("").is_err());
        assert!(parse_size("lots").is_err());
        assert!(parse_size("10T").is_err());
    }

    #[test]
    fn test_validate_requires_script() {
        let mut desc = AppDescriptor::new("svc", "main.py");
        assert!(desc.validate().is_ok());

        desc.script = String::new();
        assert!(desc.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_bad_names() {
        assert!(AppDescriptor::new("", "main.py").validate().is_err());
        assert!(AppDescriptor::new("a b", "main.py").validate().is_err());
        assert!(AppDescriptor::new("a/b", "main.py").validate().is_err());
    }

    #[test]
    fn test_validate_rejects_unknown_stop_signal() {
        let mut desc = AppDescriptor::new("svc", "main.py");
        desc.stop_signal = "SIGWHATEVER".to_string();
        assert!(desc.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_bad_time_format() {
        let mut desc = AppDescriptor::new("svc", "main.py");
        desc.time_format = "%Q".to_string();
        assert!(desc.validate().is_err());

        desc.time_format = "%Y-%m-%d %H:%M:%S".to_string();
        assert!(desc.validate().is_ok());
    }

    #[test]
    fn test_state_activity() {
        assert!(AppState::Running.is_active());
        assert!(AppState::Stopping.is_active());
        assert!(!AppState::Stopped.is_active());
        assert!(!AppState::Crashed.is_active());
    }
}
