//! XDG-style resolution of the configuration, state, and kubeconfig paths.
//!
//! Every function returns an absolute path. When the home directory cannot
//! be determined the resolver logs a warning and falls back to a prefix
//! under the system temporary directory instead of failing.

use std::env;
use std::ffi::OsString;
use std::path::PathBuf;
use tracing::warn;

const APP_DIR: &str = "kubeguard";

/// Configuration directory: `$XDG_CONFIG_HOME/kubeguard`, otherwise
/// `~/.config/kubeguard`.
pub fn config_dir() -> PathBuf {
    resolve_dir(env_override("XDG_CONFIG_HOME"), &[".config"])
}

/// State directory: `$XDG_STATE_HOME/kubeguard`, otherwise
/// `~/.local/state/kubeguard`.
pub fn state_dir() -> PathBuf {
    resolve_dir(env_override("XDG_STATE_HOME"), &[".local", "state"])
}

/// Kubeconfig file: the first entry of `$KUBECONFIG` if set, otherwise
/// `~/.kube/config`.
pub fn kubeconfig_path() -> PathBuf {
    if let Some(raw) = env::var_os("KUBECONFIG") {
        if let Some(first) = first_kubeconfig_entry(&raw) {
            return first;
        }
    }

    match dirs::home_dir() {
        Some(home) => home.join(".kube").join("config"),
        None => fallback_dir().join("config"),
    }
}

pub fn config_path() -> PathBuf {
    config_dir().join("config.yaml")
}

pub fn state_path() -> PathBuf {
    state_dir().join("state.json")
}

pub fn pid_path() -> PathBuf {
    state_dir().join("kubeguardd.pid")
}

pub fn log_path(basename: &str) -> PathBuf {
    state_dir().join(basename)
}

fn resolve_dir(override_dir: Option<PathBuf>, home_suffix: &[&str]) -> PathBuf {
    if let Some(dir) = override_dir {
        return dir.join(APP_DIR);
    }

    match dirs::home_dir() {
        Some(home) => {
            let mut dir = home;
            for part in home_suffix {
                dir.push(part);
            }
            dir.join(APP_DIR)
        }
        None => fallback_dir(),
    }
}

/// Reads an environment override, ignoring empty and relative values so the
/// resolver never hands out a path that depends on the working directory.
fn env_override(key: &str) -> Option<PathBuf> {
    let raw = env::var_os(key)?;
    if raw.is_empty() {
        return None;
    }
    let path = PathBuf::from(raw);
    path.is_absolute().then_some(path)
}

fn first_kubeconfig_entry(raw: &OsString) -> Option<PathBuf> {
    env::split_paths(raw).find(|entry| !entry.as_os_str().is_empty())
}

fn fallback_dir() -> PathBuf {
    let dir = env::temp_dir().join(APP_DIR);
    warn!(
        "home directory could not be determined, falling back to {}",
        dir.display()
    );
    dir
}
