use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use kubeguard_core::config::{format_duration, Config};
use kubeguard_core::kubectl::{ContextTool, KubectlTool};
use kubeguard_core::paths;
use kubeguard_core::state::ActivityStore;
use serde_json::json;
use std::path::{Path, PathBuf};

#[derive(Debug, Parser)]
#[command(
    name = "kubeguard",
    version,
    about = "Safety net that returns idle kubectl sessions to a safe context"
)]
struct Cli {
    /// Configuration file (default: XDG config directory).
    #[arg(long)]
    config: Option<PathBuf>,
    /// Activity record file (default: XDG state directory).
    #[arg(long)]
    state: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Record kubectl activity for the current context. Installed as the
    /// shell integration hook, so failures never break the kubectl workflow.
    RecordActivity,
    /// Show the recorded activity and the effective timeout.
    Status {
        #[arg(long, default_value_t = false)]
        json: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config_path = cli.config.unwrap_or_else(paths::config_path);
    let state_path = cli.state.unwrap_or_else(paths::state_path);

    match cli.command {
        Commands::RecordActivity => cmd_record_activity(&state_path),
        Commands::Status { json } => cmd_status(&config_path, &state_path, json),
    }
}

fn cmd_record_activity(state_path: &Path) -> Result<()> {
    let store = match ActivityStore::open(state_path) {
        Ok(store) => store,
        Err(err) => {
            eprintln!("kubeguard: failed to open activity record: {err}");
            return Ok(());
        }
    };

    let tool = KubectlTool::new();
    let context = tool
        .current_context()
        .unwrap_or_else(|_| "unknown".to_string());
    if let Err(err) = store.record_activity(&context) {
        eprintln!("kubeguard: failed to record activity: {err}");
    }
    Ok(())
}

fn cmd_status(config_path: &Path, state_path: &Path, as_json: bool) -> Result<()> {
    let tool = KubectlTool::new();
    let config = Config::load(config_path, &tool)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;

    // Independent read-only snapshot; the daemon keeps the writer half.
    let store = ActivityStore::open(state_path)?;
    let record = store.load()?;
    let elapsed = store.time_since()?;
    let current = tool.current_context().ok();
    let effective_timeout = current
        .as_deref()
        .map(|context| config.effective_timeout(context));

    if as_json {
        let payload = json!({
            "current_context": current,
            "recorded_context": record.context,
            "last_activity": record.last_activity,
            "inactive_for": format_duration(elapsed),
            "default_context": config.default_context,
            "effective_timeout": effective_timeout.map(format_duration),
        });
        println!("{}", serde_json::to_string_pretty(&payload)?);
        return Ok(());
    }

    match current.as_deref() {
        Some(context) => println!("current context:  {context}"),
        None => println!("current context:  (unavailable)"),
    }
    if record.context.is_empty() {
        println!("recorded context: (none)");
    } else {
        println!("recorded context: {}", record.context);
    }
    match record.last_activity {
        Some(timestamp) => println!(
            "last activity:    {} ({} ago)",
            timestamp.to_rfc3339(),
            format_duration(elapsed)
        ),
        None => println!("last activity:    (never)"),
    }
    println!("default context:  {}", config.default_context);
    if let Some(timeout) = effective_timeout {
        println!("effective timeout: {}", format_duration(timeout));
    }
    Ok(())
}
