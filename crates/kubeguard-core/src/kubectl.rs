//! Narrow adapter over the external `kubectl` binary.
//!
//! Exactly three operations are exposed: list contexts, read the current
//! context, and switch to a named context. Arguments always travel as a
//! discrete argument vector, never through a shell, and every invocation is
//! bounded by a wall-clock timeout.

use std::io::{self, Read};
use std::process::{Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, info, warn};

const KUBECTL_BIN: &str = "kubectl";

/// Upper bound for a single kubectl invocation.
pub const SUBPROCESS_TIMEOUT: Duration = Duration::from_secs(5);

const MAX_SWITCH_ATTEMPTS: u32 = 3;
const RETRY_DELAY: Duration = Duration::from_secs(1);

/// Safe-context name fragments, scanned in priority order.
const SAFE_PATTERNS: &[&str] = &[
    "local",
    "docker-desktop",
    "minikube",
    "kind-",
    "dev",
    "development",
    "test",
];

/// Fragments that mark a context as dangerous regardless of safe matches.
const DANGEROUS_PATTERNS: &[&str] = &["prod", "production", "stage", "staging", "prd"];

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("failed to run {command}: {source}")]
    Spawn { command: String, source: io::Error },
    #[error("{command} did not finish within {timeout:?}")]
    Timeout { command: String, timeout: Duration },
    #[error("{command} failed ({status}): {stderr}")]
    Failed {
        command: String,
        status: ExitStatus,
        stderr: String,
    },
    #[error("no current context is set")]
    NoCurrentContext,
    #[error("context '{0}' does not exist")]
    UnknownContext(String),
    #[error("context name '{0}' contains unsupported characters")]
    InvalidName(String),
    #[error("context switch cancelled by shutdown")]
    Cancelled,
}

/// The three operations the daemon needs from the context tool. Implemented
/// by [`KubectlTool`] in production and by in-memory fakes in tests.
pub trait ContextTool: Send + Sync {
    fn list_contexts(&self) -> Result<Vec<String>, ToolError>;
    fn current_context(&self) -> Result<String, ToolError>;
    fn use_context(&self, name: &str) -> Result<(), ToolError>;
}

#[derive(Debug, Clone)]
pub struct KubectlTool {
    timeout: Duration,
}

impl KubectlTool {
    pub fn new() -> Self {
        Self {
            timeout: SUBPROCESS_TIMEOUT,
        }
    }
}

impl Default for KubectlTool {
    fn default() -> Self {
        Self::new()
    }
}

impl ContextTool for KubectlTool {
    fn list_contexts(&self) -> Result<Vec<String>, ToolError> {
        let output = run_kubectl(&["config", "get-contexts", "-o", "name"], self.timeout)?;
        Ok(output
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(ToString::to_string)
            .collect())
    }

    fn current_context(&self) -> Result<String, ToolError> {
        let output = run_kubectl(&["config", "current-context"], self.timeout)?;
        let context = output.trim();
        if context.is_empty() {
            return Err(ToolError::NoCurrentContext);
        }
        Ok(context.to_string())
    }

    fn use_context(&self, name: &str) -> Result<(), ToolError> {
        let output = run_kubectl(&["config", "use-context", name], self.timeout)?;
        debug!("kubectl output: {}", output.trim());
        Ok(())
    }
}

/// Spawns kubectl with discrete arguments and waits for it with a deadline.
/// On expiry the child is killed and the invocation reported as timed out.
fn run_kubectl(args: &[&str], timeout: Duration) -> Result<String, ToolError> {
    let command = format!("{KUBECTL_BIN} {}", args.join(" "));
    let mut child = Command::new(KUBECTL_BIN)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|source| ToolError::Spawn {
            command: command.clone(),
            source,
        })?;

    let deadline = Instant::now() + timeout;
    let status = loop {
        match child.try_wait() {
            Ok(Some(status)) => break status,
            Ok(None) => {
                if Instant::now() >= deadline {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(ToolError::Timeout { command, timeout });
                }
                thread::sleep(Duration::from_millis(20));
            }
            Err(source) => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(ToolError::Spawn { command, source });
            }
        }
    };

    let stdout = read_pipe(child.stdout.take());
    if !status.success() {
        let stderr = read_pipe(child.stderr.take());
        return Err(ToolError::Failed {
            command,
            status,
            stderr: stderr.trim().to_string(),
        });
    }
    Ok(stdout)
}

fn read_pipe(pipe: Option<impl Read>) -> String {
    let mut buffer = String::new();
    if let Some(mut pipe) = pipe {
        let _ = pipe.read_to_string(&mut buffer);
    }
    buffer
}

/// Syntactic gate applied before any subprocess sees a candidate name.
/// Shell metacharacters, control characters, and `..` path segments are
/// rejected outright; everything else is validated by membership in the
/// context list.
pub fn is_valid_context_name(name: &str) -> bool {
    if name.is_empty() {
        return false;
    }
    if name.chars().any(char::is_control) {
        return false;
    }
    if name
        .chars()
        .any(|ch| matches!(ch, ';' | '|' | '&' | '`' | '$' | '\'' | '"' | '\\' | '<' | '>'))
    {
        return false;
    }
    if name.split('/').any(|segment| segment == "..") {
        return false;
    }
    true
}

/// Scans the available contexts for an obviously safe default. A candidate
/// must match a safe pattern and no dangerous pattern.
pub fn detect_safe_default(contexts: &[String]) -> Option<String> {
    for pattern in SAFE_PATTERNS {
        for context in contexts {
            let lower = context.to_lowercase();
            if lower.contains(pattern)
                && !DANGEROUS_PATTERNS
                    .iter()
                    .any(|danger| lower.contains(danger))
            {
                return Some(context.clone());
            }
        }
    }
    None
}

/// Validated, retry-aware context switching on top of a [`ContextTool`].
pub struct ContextSwitcher {
    tool: Arc<dyn ContextTool>,
    max_attempts: u32,
    retry_delay: Duration,
}

impl ContextSwitcher {
    pub fn new(tool: Arc<dyn ContextTool>) -> Self {
        Self {
            tool,
            max_attempts: MAX_SWITCH_ATTEMPTS,
            retry_delay: RETRY_DELAY,
        }
    }

    #[cfg(test)]
    fn with_retry(tool: Arc<dyn ContextTool>, max_attempts: u32, retry_delay: Duration) -> Self {
        Self {
            tool,
            max_attempts,
            retry_delay,
        }
    }

    /// Checks that `name` is syntactically acceptable and present in the
    /// context list. The syntactic gate runs before any subprocess spawns.
    pub fn validate_context(&self, name: &str) -> Result<(), ToolError> {
        if !is_valid_context_name(name) {
            return Err(ToolError::InvalidName(name.to_string()));
        }
        let contexts = self.tool.list_contexts()?;
        if contexts.iter().any(|context| context == name) {
            Ok(())
        } else {
            Err(ToolError::UnknownContext(name.to_string()))
        }
    }

    /// Switches to `target` with up to three attempts and a constant
    /// back-off. Already being on `target` is a no-op. The `running` flag is
    /// observed between attempts so shutdown is never delayed by retries.
    pub fn switch_context(&self, target: &str, running: &AtomicBool) -> Result<(), ToolError> {
        let current = self.tool.current_context()?;
        if current == target {
            debug!("already on context '{target}', no switch needed");
            return Ok(());
        }

        self.validate_context(target)?;

        let mut last_error = None;
        for attempt in 1..=self.max_attempts {
            if !running.load(Ordering::SeqCst) {
                return Err(ToolError::Cancelled);
            }
            info!(
                "switching context from '{current}' to '{target}' (attempt {attempt}/{})",
                self.max_attempts
            );
            match self.tool.use_context(target) {
                Ok(()) => return Ok(()),
                Err(err) => {
                    warn!("context switch attempt {attempt} failed: {err}");
                    last_error = Some(err);
                }
            }
            if attempt < self.max_attempts && !wait_while_running(self.retry_delay, running) {
                return Err(ToolError::Cancelled);
            }
        }
        Err(last_error.unwrap_or(ToolError::Cancelled))
    }
}

/// Sleeps for `duration` in small slices, returning false as soon as
/// `running` is cleared.
pub(crate) fn wait_while_running(duration: Duration, running: &AtomicBool) -> bool {
    let deadline = Instant::now() + duration;
    while Instant::now() < deadline {
        if !running.load(Ordering::SeqCst) {
            return false;
        }
        thread::sleep(Duration::from_millis(50));
    }
    running.load(Ordering::SeqCst)
}
