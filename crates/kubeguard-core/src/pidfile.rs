//! Single-instance guard backed by a PID file.
//!
//! Acquisition probes the recorded process with a zero signal: a live holder
//! fails the acquire, a dead or unreadable one is reclaimed. The returned
//! guard removes the file when dropped so abnormal exit paths release too.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::debug;

use crate::state::ensure_private_dir;

#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;

#[derive(Debug, Error)]
pub enum PidFileError {
    #[error("daemon is already running (pid {0})")]
    AlreadyRunning(i32),
    #[error("failed to {op} pid file {path}: {source}")]
    Io {
        op: &'static str,
        path: PathBuf,
        source: io::Error,
    },
    #[error("pid file {path} does not contain a pid")]
    Malformed { path: PathBuf },
}

pub struct PidFile {
    path: PathBuf,
}

/// Ownership token for the PID file; removing the file on drop releases it.
#[derive(Debug)]
pub struct PidGuard {
    path: PathBuf,
}

impl PidFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Claims single-instance ownership. Fails when the recorded pid denotes
    /// a live process; stale and unreadable tokens are reclaimed.
    pub fn acquire(&self) -> Result<PidGuard, PidFileError> {
        if let Some(dir) = self.path.parent() {
            ensure_private_dir(dir).map_err(|source| PidFileError::Io {
                op: "create directory for",
                path: self.path.clone(),
                source,
            })?;
        }

        if self.path.exists() {
            match self.read_pid() {
                Ok(pid) if process_exists(pid) => {
                    return Err(PidFileError::AlreadyRunning(pid));
                }
                Ok(pid) => {
                    debug!("reclaiming stale pid file (pid {pid} is gone)");
                }
                Err(err) => {
                    debug!("reclaiming unreadable pid file: {err}");
                }
            }
            let _ = fs::remove_file(&self.path);
        }

        let pid = std::process::id();
        fs::write(&self.path, format!("{pid}\n")).map_err(|source| PidFileError::Io {
            op: "write",
            path: self.path.clone(),
            source,
        })?;
        #[cfg(unix)]
        fs::set_permissions(&self.path, fs::Permissions::from_mode(0o600)).map_err(|source| {
            PidFileError::Io {
                op: "chmod",
                path: self.path.clone(),
                source,
            }
        })?;

        Ok(PidGuard {
            path: self.path.clone(),
        })
    }

    pub fn read_pid(&self) -> Result<i32, PidFileError> {
        let raw = fs::read_to_string(&self.path).map_err(|source| PidFileError::Io {
            op: "read",
            path: self.path.clone(),
            source,
        })?;
        raw.trim()
            .parse()
            .map_err(|_| PidFileError::Malformed {
                path: self.path.clone(),
            })
    }
}

impl PidGuard {
    /// Explicit release; a missing file is not an error.
    pub fn release(self) {
        // Drop does the removal.
    }
}

impl Drop for PidGuard {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

/// Zero-signal probe. `EPERM` means the process exists but belongs to
/// another user, which still counts as running.
#[cfg(unix)]
fn process_exists(pid: i32) -> bool {
    if pid <= 0 {
        return false;
    }
    let result = unsafe { libc::kill(pid, 0) };
    result == 0 || io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
fn process_exists(_pid: i32) -> bool {
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command;

    fn pid_file() -> (tempfile::TempDir, PidFile) {
        let dir = tempfile::TempDir::new().expect("failed to create temp dir");
        let pid_file = PidFile::new(dir.path().join("run").join("kubeguardd.pid"));
        (dir, pid_file)
    }

    fn reaped_pid() -> i32 {
        let mut child = Command::new("true").spawn().expect("spawn true");
        let pid = child.id() as i32;
        child.wait().expect("wait for true");
        pid
    }

    #[test]
    fn acquire_writes_own_pid_and_release_removes_it() {
        let (_dir, pid_file) = pid_file();
        let guard = pid_file.acquire().unwrap();
        assert_eq!(pid_file.read_pid().unwrap(), std::process::id() as i32);
        guard.release();
        assert!(!pid_file.path().exists());
    }

    #[test]
    fn second_acquire_fails_while_holder_is_alive() {
        let (_dir, pid_file) = pid_file();
        let _guard = pid_file.acquire().unwrap();
        let err = pid_file.acquire().unwrap_err();
        match err {
            PidFileError::AlreadyRunning(pid) => {
                assert_eq!(pid, std::process::id() as i32);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn stale_pid_file_is_reclaimed() {
        let (_dir, pid_file) = pid_file();
        if let Some(dir) = pid_file.path().parent() {
            fs::create_dir_all(dir).unwrap();
        }
        fs::write(pid_file.path(), format!("{}\n", reaped_pid())).unwrap();

        let _guard = pid_file.acquire().unwrap();
        assert_eq!(pid_file.read_pid().unwrap(), std::process::id() as i32);
    }

    #[test]
    fn malformed_pid_file_is_reclaimed() {
        let (_dir, pid_file) = pid_file();
        if let Some(dir) = pid_file.path().parent() {
            fs::create_dir_all(dir).unwrap();
        }
        fs::write(pid_file.path(), "not-a-pid\n").unwrap();

        let _guard = pid_file.acquire().unwrap();
        assert_eq!(pid_file.read_pid().unwrap(), std::process::id() as i32);
    }

    #[test]
    fn drop_releases_even_without_explicit_release() {
        let (_dir, pid_file) = pid_file();
        {
            let _guard = pid_file.acquire().unwrap();
            assert!(pid_file.path().exists());
        }
        assert!(!pid_file.path().exists());
    }

    #[cfg(unix)]
    #[test]
    fn pid_file_is_private() {
        let (_dir, pid_file) = pid_file();
        let _guard = pid_file.acquire().unwrap();
        let mode = fs::metadata(pid_file.path()).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);
    }

    #[test]
    fn read_pid_on_missing_file_is_an_io_error() {
        let (_dir, pid_file) = pid_file();
        assert!(matches!(
            pid_file.read_pid(),
            Err(PidFileError::Io { op: "read", .. })
        ));
    }
}
