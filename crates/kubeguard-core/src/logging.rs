//! Logging setup shared by the daemon and the CLI.
//!
//! Built on `tracing`: a stderr layer for whatever supervisor captures the
//! process output, plus an optional file layer writing through a size-based
//! rotating writer. Log files are created 0600 inside a 0700 directory.
//! Secrets, environment contents, and full command lines are never logged.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock};

use thiserror::Error;
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

use crate::state::ensure_private_dir;

#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;

static LOGGING_INITIALIZED: OnceLock<bool> = OnceLock::new();

#[derive(Debug, Error)]
pub enum LogError {
    #[error("logging already initialized")]
    AlreadyInitialized,
    #[error("failed to open log file: {0}")]
    FileOpen(#[from] io::Error),
    #[error("failed to set global subscriber: {0}")]
    SetSubscriber(#[from] tracing::subscriber::SetGlobalDefaultError),
}

#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Level filter; `RUST_LOG` overrides it when set.
    pub level: String,
    /// Optional log file; `None` logs to stderr only.
    pub file: Option<PathBuf>,
    /// Rotation threshold in MiB.
    pub max_size_mib: u64,
    /// Rotated files kept as `<file>.1` .. `<file>.N`.
    pub max_backups: usize,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
            max_size_mib: 10,
            max_backups: 5,
        }
    }
}

/// Installs the global subscriber. Call once at startup; a second call
/// reports [`LogError::AlreadyInitialized`].
pub fn init(config: &LogConfig) -> Result<(), LogError> {
    if LOGGING_INITIALIZED.get().is_some() {
        return Err(LogError::AlreadyInitialized);
    }

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.clone()));

    let stderr_layer = fmt::layer()
        .with_writer(io::stderr)
        .with_target(false)
        .with_ansi(false);

    if let Some(path) = &config.file {
        let writer = RotatingWriter::open(
            path,
            config.max_size_mib.saturating_mul(1024 * 1024),
            config.max_backups,
        )?;
        let file_layer = fmt::layer()
            .with_writer(writer)
            .with_target(false)
            .with_ansi(false);
        tracing::subscriber::set_global_default(
            tracing_subscriber::registry()
                .with(env_filter)
                .with(stderr_layer)
                .with(file_layer),
        )?;
    } else {
        tracing::subscriber::set_global_default(
            tracing_subscriber::registry()
                .with(env_filter)
                .with(stderr_layer),
        )?;
    }

    let _ = LOGGING_INITIALIZED.set(true);
    Ok(())
}

/// Append-only log writer that rotates `path` to `path.1` .. `path.N` once
/// the current file would exceed the size limit. A zero backup count
/// truncates in place instead of keeping rotated files.
#[derive(Clone)]
pub struct RotatingWriter {
    inner: Arc<Mutex<RotateState>>,
}

struct RotateState {
    path: PathBuf,
    file: File,
    written: u64,
    max_size: u64,
    max_backups: usize,
}

impl RotatingWriter {
    pub fn open(path: &Path, max_size: u64, max_backups: usize) -> io::Result<Self> {
        if let Some(dir) = path.parent() {
            ensure_private_dir(dir)?;
        }
        let file = open_log_file(path)?;
        let written = file.metadata()?.len();
        Ok(Self {
            inner: Arc::new(Mutex::new(RotateState {
                path: path.to_path_buf(),
                file,
                written,
                max_size,
                max_backups,
            })),
        })
    }
}

impl RotateState {
    fn rotate(&mut self) -> io::Result<()> {
        self.file.flush()?;
        if self.max_backups == 0 {
            fs::remove_file(&self.path)?;
        } else {
            for index in (1..self.max_backups).rev() {
                let from = backup_path(&self.path, index);
                if from.exists() {
                    fs::rename(&from, backup_path(&self.path, index + 1))?;
                }
            }
            fs::rename(&self.path, backup_path(&self.path, 1))?;
        }
        self.file = open_log_file(&self.path)?;
        self.written = 0;
        Ok(())
    }
}

impl io::Write for RotatingWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut state = self
            .inner
            .lock()
            .unwrap_or_else(|err| err.into_inner());
        if state.max_size > 0
            && state.written > 0
            && state.written + buf.len() as u64 > state.max_size
        {
            state.rotate()?;
        }
        state.file.write_all(buf)?;
        state.written += buf.len() as u64;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        let mut state = self
            .inner
            .lock()
            .unwrap_or_else(|err| err.into_inner());
        state.file.flush()
    }
}

impl<'a> fmt::MakeWriter<'a> for RotatingWriter {
    type Writer = Self;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

fn open_log_file(path: &Path) -> io::Result<File> {
    let existed = path.exists();
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    #[cfg(unix)]
    if !existed {
        fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
    }
    Ok(file)
}

fn backup_path(path: &Path, index: usize) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(format!(".{index}"));
    PathBuf::from(name)
}
