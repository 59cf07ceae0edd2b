//! Optional kubeconfig change watcher.
//!
//! File events come from an OS-level watch subprocess (`fswatch` on macOS,
//! `inotifywait` on Linux) behind the [`EventSource`] seam, so a native
//! mechanism can be slotted in later. When no mechanism is available the
//! watcher logs once and exits; the periodic timeout engine keeps running.

use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

use crate::kubectl::{wait_while_running, ContextTool};
use crate::state::ActivityStore;

/// Minimum spacing between handled events; bursts inside the window coalesce.
pub const DEBOUNCE: Duration = Duration::from_millis(500);

/// Pause before restarting a watch subprocess that exited unexpectedly.
const RESTART_DELAY: Duration = Duration::from_secs(5);

/// A host mechanism that can stream change events for a file. The spawned
/// child must write one event per line on stdout and keep running until
/// killed.
pub trait EventSource: Send + Sync {
    fn name(&self) -> &'static str;
    fn command(&self, path: &Path) -> Command;
}

/// `fswatch` over the FSEvents API; the `-l` latency flag debounces bursts
/// at the source.
struct FsWatchSource;

impl EventSource for FsWatchSource {
    fn name(&self) -> &'static str {
        "fswatch"
    }

    fn command(&self, path: &Path) -> Command {
        let mut command = Command::new("fswatch");
        command
            .arg("--event")
            .arg("Created")
            .arg("--event")
            .arg("Updated")
            .arg("--event")
            .arg("Renamed")
            .arg("-l")
            .arg("0.5")
            .arg(path);
        command
    }
}

/// `inotifywait` watching the parent directory, because the kubeconfig is
/// usually replaced by rename and a watch on the file itself would go stale.
struct InotifySource;

impl EventSource for InotifySource {
    fn name(&self) -> &'static str {
        "inotifywait"
    }

    fn command(&self, path: &Path) -> Command {
        let dir = path.parent().unwrap_or_else(|| Path::new("."));
        let mut command = Command::new("inotifywait");
        command
            .arg("-m")
            .arg("-q")
            .arg("-e")
            .arg("modify")
            .arg("-e")
            .arg("create")
            .arg("-e")
            .arg("moved_to")
            .arg("-e")
            .arg("close_write")
            .arg("--format")
            .arg("%w%f")
            .arg(dir);
        command
    }
}

/// Probes the host for a usable watch mechanism.
pub fn detect_event_source() -> Option<Box<dyn EventSource>> {
    if binary_available("fswatch") {
        return Some(Box::new(FsWatchSource));
    }
    if binary_available("inotifywait") {
        return Some(Box::new(InotifySource));
    }
    None
}

fn binary_available(bin: &str) -> bool {
    Command::new(bin)
        .arg("--help")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .output()
        .is_ok()
}

/// Handle the supervisor keeps to interrupt a blocked watcher read.
#[derive(Clone)]
pub struct WatcherHandle {
    child: Arc<Mutex<Option<Child>>>,
}

impl WatcherHandle {
    /// Kills the current watch subprocess, if any, so the watcher thread's
    /// blocking read returns and the thread can observe cancellation.
    pub fn interrupt(&self) {
        let mut slot = self.child.lock().unwrap_or_else(|err| err.into_inner());
        if let Some(child) = slot.as_mut() {
            let _ = child.kill();
        }
    }
}

pub struct KubeconfigWatcher {
    kubeconfig: PathBuf,
    store: Arc<ActivityStore>,
    tool: Arc<dyn ContextTool>,
    running: Arc<AtomicBool>,
    child: Arc<Mutex<Option<Child>>>,
}

impl KubeconfigWatcher {
    pub fn new(
        kubeconfig: PathBuf,
        store: Arc<ActivityStore>,
        tool: Arc<dyn ContextTool>,
        running: Arc<AtomicBool>,
    ) -> Self {
        Self {
            kubeconfig,
            store,
            tool,
            running,
            child: Arc::new(Mutex::new(None)),
        }
    }

    pub fn handle(&self) -> WatcherHandle {
        WatcherHandle {
            child: self.child.clone(),
        }
    }

    /// Blocks until shutdown, feeding kubeconfig change events into the
    /// activity record. Exits early (successfully) when no watch mechanism
    /// or no kubeconfig file is available.
    pub fn watch(&self) {
        self.watch_with(detect_event_source().as_deref());
    }

    fn watch_with(&self, source: Option<&dyn EventSource>) {
        let Some(source) = source else {
            info!("no file watch mechanism found, kubeconfig monitoring disabled");
            return;
        };
        if !self.kubeconfig.exists() {
            info!(
                "kubeconfig not found at {}, file monitoring disabled",
                self.kubeconfig.display()
            );
            return;
        }

        info!(
            "watching {} for context changes via {}",
            self.kubeconfig.display(),
            source.name()
        );

        let mut last_handled = None;
        while self.running.load(Ordering::SeqCst) {
            if let Err(err) = self.run_stream(source, &mut last_handled) {
                warn!("kubeconfig watch stream failed: {err:#}");
            }
            if !self.running.load(Ordering::SeqCst) {
                break;
            }
            warn!(
                "watch subprocess exited, restarting in {}s",
                RESTART_DELAY.as_secs()
            );
            if !wait_while_running(RESTART_DELAY, &self.running) {
                break;
            }
        }
        debug!("kubeconfig watcher stopped");
    }

    /// Runs one watch subprocess to completion, handling its events.
    fn run_stream(
        &self,
        source: &dyn EventSource,
        last_handled: &mut Option<Instant>,
    ) -> Result<()> {
        let mut command = source.command(&self.kubeconfig);
        let mut child = command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .with_context(|| format!("failed to start {}", source.name()))?;
        let stdout = child
            .stdout
            .take()
            .context("watch subprocess has no stdout")?;
        {
            let mut slot = self.child.lock().unwrap_or_else(|err| err.into_inner());
            *slot = Some(child);
        }

        let reader = BufReader::new(stdout);
        for line in reader.lines() {
            let line = line.context("failed to read watch events")?;
            if !self.running.load(Ordering::SeqCst) {
                break;
            }
            if !event_matches(&line, &self.kubeconfig) {
                continue;
            }
            if !should_handle(last_handled, DEBOUNCE) {
                continue;
            }
            self.handle_change();
        }

        let mut slot = self.child.lock().unwrap_or_else(|err| err.into_inner());
        if let Some(mut child) = slot.take() {
            let _ = child.kill();
            let _ = child.wait();
        }
        Ok(())
    }

    /// A kubeconfig change is evidence of recent human attention: record
    /// activity whether or not the context actually changed. An unreadable
    /// current context (e.g. mid-write) drops the event.
    fn handle_change(&self) {
        let current = match self.tool.current_context() {
            Ok(current) => current,
            Err(err) => {
                debug!("ignoring kubeconfig event, current context unreadable: {err}");
                return;
            }
        };

        let previous = match self.store.last_activity() {
            Ok((_, context)) => context,
            Err(err) => {
                warn!("failed to read last recorded context: {err}");
                String::new()
            }
        };

        if !previous.is_empty() && previous != current {
            info!("detected context switch from '{previous}' to '{current}' via file monitoring");
        } else {
            debug!("kubeconfig modified while in context '{current}', extending timeout");
        }

        if let Err(err) = self.store.record_activity(&current) {
            warn!("failed to record activity for context '{current}': {err}");
        }
    }
}

/// Watch subprocesses report paths; only events for the kubeconfig file
/// itself count.
fn event_matches(line: &str, kubeconfig: &Path) -> bool {
    let line = line.trim();
    if line.is_empty() {
        return false;
    }
    Path::new(line).file_name() == kubeconfig.file_name()
}

fn should_handle(last_handled: &mut Option<Instant>, debounce: Duration) -> bool {
    if let Some(last) = last_handled {
        if last.elapsed() < debounce {
            return false;
        }
    }
    *last_handled = Some(Instant::now());
    true
}
