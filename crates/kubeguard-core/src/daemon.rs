//! The timeout engine and the supervisor around it.
//!
//! The supervisor wires the paths, configuration, activity record, instance
//! guard, kubectl adapter, and kubeconfig watcher together, then drives a
//! periodic tick: read elapsed inactivity, read the current context, apply
//! the safety filters, and switch back to the safe default when the timeout
//! has passed. A successful switch records activity for the new context
//! before the tick returns, which is what keeps the next tick from
//! attempting a duplicate switch.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tracing::{debug, error, info, warn};

use crate::config::{format_duration, Config};
use crate::kubectl::{ContextSwitcher, ContextTool, KubectlTool};
use crate::paths;
use crate::pidfile::PidFile;
use crate::safety::{validate_default, SafetyPolicy};
use crate::state::ActivityStore;
use crate::watcher::KubeconfigWatcher;

// Signal flags, set by the handlers and drained by the ticker loop.
static SHUTDOWN_REQUESTED: AtomicBool = AtomicBool::new(false);
static RELOAD_REQUESTED: AtomicBool = AtomicBool::new(false);

extern "C" fn on_shutdown_signal(_signal: libc::c_int) {
    SHUTDOWN_REQUESTED.store(true, Ordering::Release);
}

extern "C" fn on_reload_signal(_signal: libc::c_int) {
    RELOAD_REQUESTED.store(true, Ordering::Release);
}

fn install_signal_handlers() {
    #[cfg(unix)]
    unsafe {
        libc::signal(libc::SIGINT, on_shutdown_signal as libc::sighandler_t);
        libc::signal(libc::SIGTERM, on_shutdown_signal as libc::sighandler_t);
        libc::signal(libc::SIGHUP, on_reload_signal as libc::sighandler_t);
    }
}

/// Outcome of one tick of the timeout engine.
#[derive(Debug, Clone, PartialEq)]
pub struct TickDecision {
    pub elapsed: Duration,
    pub current: String,
    pub threshold: Duration,
    pub action: TickAction,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TickAction {
    NoOp(NoOpReason),
    /// The timeout had passed but the switch is due and not yet performed;
    /// only produced by [`Daemon::evaluate`], never returned from a tick.
    SwitchDue,
    /// The timeout had passed but a safety filter refused the switch.
    Blocked(String),
    Switched,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoOpReason {
    /// Current context is in the never-switch-from list.
    ProtectedContext,
    /// Already on the safe default.
    AlreadyDefault,
    /// Activity is recent enough.
    WithinTimeout,
}

pub struct Daemon {
    config: RwLock<Arc<Config>>,
    config_path: PathBuf,
    kubeconfig_path: PathBuf,
    store: Arc<ActivityStore>,
    tool: Arc<dyn ContextTool>,
    switcher: ContextSwitcher,
    pid_file: PidFile,
    running: Arc<AtomicBool>,
}

impl Daemon {
    pub fn new(config_path: PathBuf, state_path: PathBuf, pid_path: PathBuf) -> Result<Self> {
        Self::with_tool(config_path, state_path, pid_path, Arc::new(KubectlTool::new()))
    }

    pub fn with_tool(
        config_path: PathBuf,
        state_path: PathBuf,
        pid_path: PathBuf,
        tool: Arc<dyn ContextTool>,
    ) -> Result<Self> {
        let config = Config::load(&config_path, tool.as_ref())
            .with_context(|| format!("failed to load config from {}", config_path.display()))?;
        Self::with_config(config_path, config, state_path, pid_path, tool)
    }

    pub fn with_config(
        config_path: PathBuf,
        config: Config,
        state_path: PathBuf,
        pid_path: PathBuf,
        tool: Arc<dyn ContextTool>,
    ) -> Result<Self> {
        config.ensure_usable().with_context(|| {
            format!(
                "edit {} to set a default context",
                config_path.display()
            )
        })?;
        let store = ActivityStore::open(state_path)?;

        Ok(Self {
            config: RwLock::new(Arc::new(config)),
            config_path,
            kubeconfig_path: paths::kubeconfig_path(),
            store: Arc::new(store),
            switcher: ContextSwitcher::new(tool.clone()),
            tool,
            pid_file: PidFile::new(pid_path),
            running: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn config_snapshot(&self) -> Arc<Config> {
        self.config
            .read()
            .unwrap_or_else(|err| err.into_inner())
            .clone()
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    /// Runs the daemon until an interrupt or terminate signal arrives.
    pub fn run(&self) -> Result<()> {
        let config = self.config_snapshot();
        if !config.daemon.enabled {
            info!("daemon is disabled in configuration");
            return Ok(());
        }

        // Handlers go in before anything else so an early SIGHUP cannot hit
        // the default terminate action.
        SHUTDOWN_REQUESTED.store(false, Ordering::Release);
        RELOAD_REQUESTED.store(false, Ordering::Release);
        install_signal_handlers();

        let pid_guard = self
            .pid_file
            .acquire()
            .context("failed to acquire instance lock")?;
        info!(
            "starting kubeguard daemon (pid {}, check interval {}, default timeout {})",
            std::process::id(),
            format_duration(config.timeout.check_interval),
            format_duration(config.timeout.default)
        );

        self.reconcile_startup_state()
            .context("failed to reconcile startup state")?;

        self.running.store(true, Ordering::SeqCst);

        let watcher = KubeconfigWatcher::new(
            self.kubeconfig_path.clone(),
            self.store.clone(),
            self.tool.clone(),
            self.running.clone(),
        );
        let watcher_handle = watcher.handle();
        let watcher_thread = thread::Builder::new()
            .name("kubeconfig-watch".to_string())
            .spawn(move || watcher.watch())
            .context("failed to start kubeconfig watcher thread")?;

        let mut next_check = Instant::now() + config.timeout.check_interval;
        while self.running.load(Ordering::SeqCst) {
            if SHUTDOWN_REQUESTED.load(Ordering::Acquire) {
                info!("received shutdown signal, stopping");
                break;
            }
            if RELOAD_REQUESTED.swap(false, Ordering::AcqRel) {
                info!("received hangup signal, reloading configuration");
                match self.reload_config() {
                    Ok(()) => {
                        info!("configuration reloaded from {}", self.config_path.display());
                        next_check = Instant::now() + self.config_snapshot().timeout.check_interval;
                    }
                    Err(err) => {
                        warn!("failed to reload configuration, keeping previous snapshot: {err:#}");
                    }
                }
            }
            if Instant::now() >= next_check {
                if let Err(err) = self.tick() {
                    warn!("timeout check failed: {err:#}");
                }
                next_check = Instant::now() + self.config_snapshot().timeout.check_interval;
            }
            thread::sleep(Duration::from_millis(100));
        }

        self.running.store(false, Ordering::SeqCst);
        watcher_handle.interrupt();
        let _ = watcher_thread.join();
        pid_guard.release();
        info!("daemon shutdown complete");
        Ok(())
    }

    /// Brings the activity record in line with reality after downtime. The
    /// countdown restarts instead of firing immediately: a stale timestamp
    /// only proves the daemon was away, not that the user was.
    pub fn reconcile_startup_state(&self) -> Result<()> {
        let current = match self.tool.current_context() {
            Ok(current) => current,
            Err(err) => {
                warn!("skipping startup reconciliation, current context unavailable: {err}");
                return Ok(());
            }
        };

        let record = self.store.load().context("failed to load activity record")?;
        let config = self.config_snapshot();

        let Some(last_activity) = record.last_activity else {
            info!("no previous activity recorded, starting countdown in context '{current}'");
            return self
                .store
                .record_activity(&current)
                .context("failed to record initial activity");
        };

        if !record.context.is_empty() && record.context != current {
            info!(
                "context changed from '{}' to '{current}' while the daemon was down, restarting countdown",
                record.context
            );
            return self
                .store
                .record_activity(&current)
                .context("failed to record activity");
        }

        let elapsed = (chrono::Utc::now() - last_activity)
            .to_std()
            .unwrap_or(Duration::ZERO);
        let threshold = config.effective_timeout(&current);
        if elapsed > threshold {
            info!(
                "daemon was down for {} (longer than timeout {}), restarting countdown for context '{current}'",
                format_duration(elapsed),
                format_duration(threshold)
            );
            return self
                .store
                .record_activity(&current)
                .context("failed to record activity");
        }

        Ok(())
    }

    /// One pass of the timeout engine. Every per-tick failure is contained
    /// here or in the caller's log line; the ticker always keeps running.
    pub fn tick(&self) -> Result<TickDecision> {
        let config = self.config_snapshot();
        let mut decision = self.evaluate(&config)?;

        if decision.action == TickAction::SwitchDue {
            info!(
                "inactivity timeout exceeded for context '{}' (inactive for {}, timeout {})",
                decision.current,
                format_duration(decision.elapsed),
                format_duration(decision.threshold)
            );

            let policy = SafetyPolicy::from_config(&config.safety);
            if let Err(err) = policy.ensure_switch_to(&config.default_context) {
                error!("refusing context switch: {err}");
                decision.action = TickAction::Blocked(err.to_string());
                return Ok(decision);
            }
            if config.safety.validate_default_context {
                let available = self
                    .tool
                    .list_contexts()
                    .context("failed to list contexts")?;
                if let Err(err) = validate_default(&config.default_context, &available) {
                    error!("refusing context switch: {err}");
                    decision.action = TickAction::Blocked(err.to_string());
                    return Ok(decision);
                }
            }

            self.switcher
                .switch_context(&config.default_context, &self.running)
                .with_context(|| {
                    format!(
                        "failed to switch from '{}' to '{}'",
                        decision.current, config.default_context
                    )
                })?;
            info!(
                "switched context from '{}' to '{}'",
                decision.current, config.default_context
            );
            self.notify_switch(&decision.current, &config);

            // Closing the loop: without this write the next tick would see
            // the same elapsed time and switch again.
            self.store
                .record_activity(&config.default_context)
                .context("failed to record activity after switch")?;
            decision.action = TickAction::Switched;
        }

        Ok(decision)
    }

    /// The pure half of a tick: gathers elapsed time, the current context,
    /// and the effective threshold, and decides without acting.
    pub fn evaluate(&self, config: &Config) -> Result<TickDecision> {
        let elapsed = self
            .store
            .time_since()
            .context("failed to determine time since last activity")?;
        let current = self
            .tool
            .current_context()
            .context("failed to read current context")?;
        let threshold = config.effective_timeout(&current);

        let policy = SafetyPolicy::from_config(&config.safety);
        let action = if !policy.can_switch_from(&current) {
            debug!("context '{current}' is in never_switch_from, skipping timeout check");
            TickAction::NoOp(NoOpReason::ProtectedContext)
        } else if current == config.default_context {
            TickAction::NoOp(NoOpReason::AlreadyDefault)
        } else if elapsed < threshold {
            TickAction::NoOp(NoOpReason::WithinTimeout)
        } else {
            TickAction::SwitchDue
        };

        Ok(TickDecision {
            elapsed,
            current,
            threshold,
            action,
        })
    }

    /// Reloads from the path loaded at startup. On failure the previous
    /// snapshot stays in effect.
    pub fn reload_config(&self) -> Result<()> {
        let config = Config::load(&self.config_path, self.tool.as_ref())
            .with_context(|| format!("failed to load config from {}", self.config_path.display()))?;
        config.ensure_usable()?;
        let mut slot = self.config.write().unwrap_or_else(|err| err.into_inner());
        *slot = Arc::new(config);
        Ok(())
    }

    fn notify_switch(&self, from: &str, config: &Config) {
        if !config.notifications.enabled {
            return;
        }
        let template = config
            .notifications
            .message
            .as_deref()
            .unwrap_or("kubeguard switched context from {from} to {to}");
        let message = template
            .replace("{from}", from)
            .replace("{to}", &config.default_context);
        info!(method = %config.notifications.method, "{message}");
    }
}
