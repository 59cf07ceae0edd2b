//! Durable record of the last observed kubectl activity.
//!
//! The record is a small JSON document replaced atomically: every save
//! serializes into a sibling temporary file and renames it over the target,
//! so readers never observe a torn write. In-process writers serialize on a
//! mutex; cross-process exclusivity is the instance guard's job.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use thiserror::Error;

#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;

pub const STATE_VERSION: u32 = 1;

/// Reported elapsed time when no activity has ever been recorded, so a fresh
/// record immediately counts as "inactive for a long time".
pub const STALE_ACTIVITY: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Error)]
pub enum StateError {
    #[error("failed to {op} activity record {path}: {source}")]
    Io {
        op: &'static str,
        path: PathBuf,
        source: io::Error,
    },
    #[error("failed to parse activity record {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("activity record version {found} is newer than supported version {supported}")]
    UnsupportedVersion { found: u32, supported: u32 },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityRecord {
    pub version: u32,
    /// RFC-3339 UTC timestamp of the last activity, or `null` before the
    /// first recorded activity.
    pub last_activity: Option<DateTime<Utc>>,
    /// Context that was current when the activity was recorded.
    pub context: String,
}

impl ActivityRecord {
    pub fn empty() -> Self {
        Self {
            version: STATE_VERSION,
            last_activity: None,
            context: String::new(),
        }
    }
}

/// Owns the on-disk activity record at a fixed path.
pub struct ActivityStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl ActivityStore {
    /// Opens the store, creating the containing directory (mode 0700) if it
    /// does not exist yet.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StateError> {
        let path = path.into();
        if let Some(dir) = path.parent() {
            ensure_private_dir(dir).map_err(|source| StateError::Io {
                op: "create directory for",
                path: path.clone(),
                source,
            })?;
        }
        Ok(Self {
            path,
            write_lock: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the current record, or the empty default when no record has
    /// been written yet. Corrupted content is an error, never silently
    /// replaced with defaults.
    pub fn load(&self) -> Result<ActivityRecord, StateError> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Ok(ActivityRecord::empty());
            }
            Err(source) => {
                return Err(StateError::Io {
                    op: "read",
                    path: self.path.clone(),
                    source,
                });
            }
        };

        let record: ActivityRecord =
            serde_json::from_str(&raw).map_err(|source| StateError::Parse {
                path: self.path.clone(),
                source,
            })?;
        if record.version > STATE_VERSION {
            return Err(StateError::UnsupportedVersion {
                found: record.version,
                supported: STATE_VERSION,
            });
        }
        Ok(record)
    }

    /// Atomically replaces the record: serialize into a sibling temporary
    /// file, fix permissions to 0600, then rename over the target.
    pub fn save(&self, record: &ActivityRecord) -> Result<(), StateError> {
        let _guard = self
            .write_lock
            .lock()
            .unwrap_or_else(|err| err.into_inner());

        let mut record = record.clone();
        record.version = STATE_VERSION;
        let data = serde_json::to_string_pretty(&record).map_err(|source| StateError::Parse {
            path: self.path.clone(),
            source,
        })?;

        let dir = self.path.parent().unwrap_or_else(|| Path::new("."));
        let io_err = |op, source| StateError::Io {
            op,
            path: self.path.clone(),
            source,
        };

        let mut tmp = NamedTempFile::new_in(dir).map_err(|e| io_err("stage", e))?;
        tmp.write_all(data.as_bytes())
            .map_err(|e| io_err("write", e))?;
        #[cfg(unix)]
        tmp.as_file()
            .set_permissions(fs::Permissions::from_mode(0o600))
            .map_err(|e| io_err("chmod", e))?;
        tmp.persist(&self.path)
            .map_err(|e| io_err("replace", e.error))?;
        Ok(())
    }

    /// Stamps the record with "now" and the given context.
    pub fn record_activity(&self, context: &str) -> Result<(), StateError> {
        let mut record = self.load()?;
        record.last_activity = Some(Utc::now());
        record.context = context.to_string();
        self.save(&record)
    }

    /// Last activity timestamp and the context observed with it.
    pub fn last_activity(&self) -> Result<(Option<DateTime<Utc>>, String), StateError> {
        let record = self.load()?;
        Ok((record.last_activity, record.context))
    }

    /// Time elapsed since the last recorded activity. A record with no
    /// activity yet reports [`STALE_ACTIVITY`].
    pub fn time_since(&self) -> Result<Duration, StateError> {
        let (last_activity, _) = self.last_activity()?;
        match last_activity {
            None => Ok(STALE_ACTIVITY),
            Some(timestamp) => Ok((Utc::now() - timestamp)
                .to_std()
                .unwrap_or(Duration::ZERO)),
        }
    }
}

/// Creates `dir` if needed and restricts a newly created directory to the
/// owning user.
pub(crate) fn ensure_private_dir(dir: &Path) -> io::Result<()> {
    if dir.as_os_str().is_empty() {
        return Ok(());
    }
    let existed = dir.exists();
    fs::create_dir_all(dir)?;
    #[cfg(unix)]
    if !existed {
        fs::set_permissions(dir, fs::Permissions::from_mode(0o700))?;
    }
    Ok(())
}
