//! warden - a single-node process supervisor.
//!
//! Warden loads a declarative TOML document describing apps
//! (interpreter/script, environment, log targets, restart thresholds),
//! launches them as child OS processes, and keeps them alive under a
//! bounded crash-loop policy.
//!
//! # Overview
//!
//! - [`loaders`]: configuration parsing into [`app::AppDescriptor`]
//! - [`launcher`]: child spawning with merged environment and piped stdio
//! - [`supervisor`]: per-instance state machine, restart quota, memory
//!   ceiling, and startup/shutdown deadlines
//! - [`logs`]: stdout/stderr multiplexing into timestamped files
//! - [`manager`]: the registry and control-plane operations
//! - [`control`]: Unix-socket IPC between the CLI and the daemon
//! - [`notify`]: sd_notify-style readiness for `wait_ready` apps
//!
//! The control plane is a cooperative tokio event loop; true
//! parallelism exists only at the supervised-process level.

pub mod app;
pub mod control;
pub mod error;
pub mod launcher;
pub mod loaders;
pub mod logs;
pub mod manager;
pub mod notify;
pub mod supervisor;

pub use app::{AppDescriptor, AppState, ExecMode, InstanceStatus};
pub use control::{ControlClient, ControlCommand, ControlResponse, ControlServer};
pub use error::{Error, Result};
pub use manager::{AppManager, AppSummary, ManagerConfig};
pub use supervisor::{InstanceCommand, InstanceHandle, SupervisorContext};
