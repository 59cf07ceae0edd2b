//! Core engine for kubeguard, a user-space daemon that switches the active
//! kubectl context back to a configured safe default after a period of
//! inactivity.
//!
//! The daemon binary (`kubeguardd`) and the CLI (`kubeguard`) are thin
//! shells over this crate: path resolution, configuration, the durable
//! activity record, the single-instance guard, the kubectl adapter, the
//! optional kubeconfig watcher, and the timeout engine all live here.

pub mod config;
pub mod daemon;
pub mod kubectl;
pub mod logging;
pub mod paths;
pub mod pidfile;
pub mod safety;
pub mod state;
pub mod watcher;

pub use config::{Config, ConfigError, UNCONFIGURED_CONTEXT};
pub use daemon::Daemon;
pub use kubectl::{ContextSwitcher, ContextTool, KubectlTool, ToolError};
pub use pidfile::{PidFile, PidFileError, PidGuard};
pub use safety::{SafetyError, SafetyPolicy};
pub use state::{ActivityRecord, ActivityStore, StateError};
