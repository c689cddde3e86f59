//! Atomic filesystem primitives.
//!
//! All durable artifacts go through [`write_atomic`]: bytes land in a
//! process-unique temp file next to the target and are renamed over it, so
//! readers never observe a partial document. JSONL appends use append-mode
//! opens, which keeps event-log writes O(1) and lock-free.

use crate::core::error::LanekeeperError;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

static TMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Write `bytes` to `path` atomically (`tmp -> rename`).
///
/// The parent directory is created first. On failure the temp file is
/// removed; the target is never left partially written.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), LanekeeperError> {
    let parent = path.parent().ok_or_else(|| {
        LanekeeperError::PathError(format!("no parent directory for {}", path.display()))
    })?;
    fs::create_dir_all(parent)?;

    let counter = TMP_COUNTER.fetch_add(1, Ordering::SeqCst);
    let tmp = path.with_file_name(format!(
        "{}.tmp.{}.{:x}",
        path.file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "artifact".to_string()),
        std::process::id(),
        counter
    ));

    let write_result = fs::write(&tmp, bytes).and_then(|_| fs::rename(&tmp, path));
    if write_result.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    write_result.map_err(LanekeeperError::IoError)
}

/// Serialize `value` as pretty JSON with a trailing newline and write atomically.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), LanekeeperError> {
    let mut body = serde_json::to_string_pretty(value)?;
    body.push('\n');
    write_atomic(path, body.as_bytes())
}

/// Append one single-line JSON object to a JSONL file (created if absent).
pub fn append_jsonl<T: Serialize>(path: &Path, value: &T) -> Result<(), LanekeeperError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let line = serde_json::to_string(value)?;
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    file.write_all(line.as_bytes())?;
    file.write_all(b"\n")?;
    Ok(())
}

/// Load and deserialize a JSON document, tagging parse failures with the path.
pub fn load_json<T: DeserializeOwned>(path: &Path) -> Result<T, LanekeeperError> {
    let raw = fs::read_to_string(path)?;
    serde_json::from_str(&raw).map_err(|e| {
        LanekeeperError::Malformed(format!("{}: {}", path.display(), e))
    })
}

/// Load a JSON document if it exists; `Ok(None)` when absent.
pub fn load_json_opt<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, LanekeeperError> {
    if !path.exists() {
        return Ok(None);
    }
    load_json(path).map(Some)
}

/// Read a JSONL file into values, one per non-empty line.
///
/// Lines that fail to parse are returned as warnings, never errors; external
/// producers share these files and a bad line must not poison the log.
pub fn read_jsonl_lenient(
    path: &Path,
) -> Result<(Vec<serde_json::Value>, Vec<String>), LanekeeperError> {
    let raw = fs::read_to_string(path)?;
    let mut values = Vec::new();
    let mut warnings = Vec::new();
    for (idx, line) in raw.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<serde_json::Value>(line) {
            Ok(v) => values.push(v),
            Err(e) => warnings.push(format!("{}:{}: {}", path.display(), idx + 1, e)),
        }
    }
    Ok((values, warnings))
}
