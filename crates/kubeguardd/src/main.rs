use anyhow::{Context, Result};
use clap::Parser;
use kubeguard_core::config::Config;
use kubeguard_core::daemon::Daemon;
use kubeguard_core::kubectl::KubectlTool;
use kubeguard_core::logging::{self, LogConfig};
use kubeguard_core::paths;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Debug, Parser)]
#[command(
    name = "kubeguardd",
    version,
    about = "Inactivity guard that switches kubectl back to a safe context"
)]
struct Args {
    /// Configuration file (default: XDG config directory).
    #[arg(long)]
    config: Option<PathBuf>,
    /// Activity record file (default: XDG state directory).
    #[arg(long)]
    state: Option<PathBuf>,
    /// Instance pid file (default: XDG state directory).
    #[arg(long)]
    pid_file: Option<PathBuf>,
    /// Log to stderr only, without the daemon log file.
    #[arg(long)]
    no_log_file: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();
    let config_path = args.config.unwrap_or_else(paths::config_path);
    let state_path = args.state.unwrap_or_else(paths::state_path);
    let pid_path = args.pid_file.unwrap_or_else(paths::pid_path);

    let tool = Arc::new(KubectlTool::new());
    let config = Config::load(&config_path, tool.as_ref())
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;

    let log_file = if args.no_log_file || config.daemon.log_file.is_empty() {
        None
    } else {
        Some(paths::log_path(&config.daemon.log_file))
    };
    logging::init(&LogConfig {
        level: config.daemon.log_level.as_str().to_string(),
        file: log_file,
        max_size_mib: config.daemon.log_max_size,
        max_backups: config.daemon.log_max_backups,
    })
    .context("failed to initialize logging")?;

    let daemon = Daemon::with_config(config_path, config, state_path, pid_path, tool)?;
    daemon.run()
}
