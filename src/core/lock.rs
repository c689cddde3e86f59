//! Durable-file mutex with stale takeover.
//!
//! A lock is an exclusively-created JSON file carrying holder metadata. When
//! acquisition collides with an existing file whose mtime is older than the
//! staleness budget, the holder is presumed dead: the file is unlinked and
//! creation retried exactly once.

use crate::core::error::LanekeeperError;
use crate::core::time;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

/// The Lane A orchestrate lock goes stale after 30 minutes.
pub const ORCHESTRATE_STALE_MS: u64 = 30 * 60 * 1000;

#[derive(Debug, Serialize, Deserialize)]
struct LockInfo {
    pid: u32,
    hostname: String,
    started_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    metadata: Option<Value>,
}

/// Held lock handle. Released on [`FileLock::release`] or on drop (best effort).
#[derive(Debug)]
pub struct FileLock {
    path: PathBuf,
    released: bool,
}

fn hostname() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.trim().is_empty())
        .unwrap_or_else(|| "unknown".to_string())
}

fn try_create(path: &Path, metadata: Option<&Value>) -> Result<bool, LanekeeperError> {
    match OpenOptions::new().write(true).create_new(true).open(path) {
        Ok(mut file) => {
            let info = LockInfo {
                pid: std::process::id(),
                hostname: hostname(),
                started_at: time::now_rfc3339(),
                metadata: metadata.cloned(),
            };
            let body = serde_json::to_string_pretty(&info)?;
            file.write_all(body.as_bytes())?;
            Ok(true)
        }
        Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(false),
        Err(e) => Err(LanekeeperError::IoError(e)),
    }
}

fn is_stale(path: &Path, stale_ms: u64) -> bool {
    let Ok(meta) = fs::metadata(path) else {
        // Vanished between the collision and this check.
        return true;
    };
    let Ok(mtime) = meta.modified() else {
        return false;
    };
    match SystemTime::now().duration_since(mtime) {
        Ok(age) => age.as_millis() > u128::from(stale_ms),
        Err(_) => false,
    }
}

impl FileLock {
    /// Acquire the lock at `path`, taking over a holder older than `stale_ms`.
    pub fn acquire(
        path: &Path,
        stale_ms: u64,
        metadata: Option<Value>,
    ) -> Result<FileLock, LanekeeperError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        if try_create(path, metadata.as_ref())? {
            return Ok(FileLock {
                path: path.to_path_buf(),
                released: false,
            });
        }

        if is_stale(path, stale_ms) {
            let _ = fs::remove_file(path);
            if try_create(path, metadata.as_ref())? {
                return Ok(FileLock {
                    path: path.to_path_buf(),
                    released: false,
                });
            }
        }

        let holder = fs::read_to_string(path).unwrap_or_default();
        Err(LanekeeperError::LockError(format!(
            "lock held at {} (holder: {})",
            path.display(),
            holder.trim()
        )))
    }

    /// Remove the lock file. A missing file counts as success.
    pub fn release(mut self) -> Result<(), LanekeeperError> {
        self.released = true;
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(LanekeeperError::IoError(e)),
        }
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        if !self.released {
            let _ = fs::remove_file(&self.path);
        }
    }
}
