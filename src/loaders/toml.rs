//! TOML app configuration loader.
//!
//! This is the native configuration format for warden. Apps are declared
//! as `[apps.<name>]` tables:
//!
//! ```toml
//! [apps.web]
//! interpreter = "python3"
//! script = "main.py"
//! env = { PORT = "3030" }
//! max_restarts = 10
//! min_uptime = "10s"
//! ```

use crate::app::AppDescriptor;
use crate::error::{Error, Result};
use std::path::Path;
use tracing::warn;

/// Keys the schema recognizes on an app table. Anything else is
/// tolerated but logged as a warning.
const RECOGNIZED_KEYS: &[&str] = &[
    "name",
    "script",
    "interpreter",
    "args",
    "instances",
    "exec_mode",
    "cwd",
    "env",
    "out_file",
    "error_file",
    "log_file",
    "time_format",
    "merge_logs",
    "autorestart",
    "max_memory_restart",
    "max_restarts",
    "min_uptime",
    "listen_timeout",
    "kill_timeout",
    "wait_ready",
    "stop_signal",
    "restart_delay",
    "exp_backoff_restart_delay",
];

/// Loader for TOML app configuration files.
pub struct TomlLoader;

impl super::ConfigLoader for TomlLoader {
    fn load(&self, path: &Path) -> Result<Vec<AppDescriptor>> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::ConfigError(format!("Failed to read {}: {}", path.display(), e)))?;

        let doc: toml::Table = toml::from_str(&content).map_err(|e| {
            Error::ConfigError(format!("Failed to parse TOML {}: {}", path.display(), e))
        })?;

        let apps = doc
            .get("apps")
            .ok_or_else(|| Error::ConfigError("missing [apps] table".to_string()))?
            .as_table()
            .ok_or_else(|| Error::ConfigError("'apps' must be a table".to_string()))?;

        if apps.is_empty() {
            return Err(Error::ConfigError("config defines no apps".to_string()));
        }

        let mut descriptors = Vec::with_capacity(apps.len());
        for (name, value) in apps {
            let table = value
                .as_table()
                .ok_or_else(|| Error::ConfigError(format!("app '{}' must be a table", name)))?;

            for key in table.keys() {
                if !RECOGNIZED_KEYS.contains(&key.as_str()) {
                    warn!(app = %name, key = %key, "Ignoring unrecognized config key");
                }
            }

            let mut descriptor: AppDescriptor = value
                .clone()
                .try_into()
                .map_err(|e| Error::ConfigError(format!("app '{}': {}", name, e)))?;
            // The table key is authoritative for the name.
            descriptor.name = name.clone();
            descriptor.validate()?;
            descriptors.push(descriptor);
        }

        Ok(descriptors)
    }

    fn supports_extension(&self, ext: &str) -> bool {
        ext == "toml"
    }

    fn name(&self) -> &'static str {
        "TOML"
    }
}

impl TomlLoader {
    /// Create a new TOML loader.
    pub fn new() -> Self {
        Self
    }
}

impl Default for TomlLoader {
    fn default() -> Self {
        Self::new()
    }
}
