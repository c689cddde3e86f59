//! Output-path confinement for bundle writes.
//!
//! Bundle output roots are caller-supplied; every candidate path must equal
//! or be a strict descendant of the allowed base after resolving whatever
//! prefix of it already exists on disk (so symlinked ancestors cannot smuggle
//! a write outside the base).

use crate::core::error::LanekeeperError;
use std::path::{Component, Path, PathBuf};

/// Resolve the longest existing ancestor of `path` via `canonicalize`, then
/// re-append the not-yet-created tail.
fn resolve_existing_prefix(path: &Path) -> Result<PathBuf, LanekeeperError> {
    if !path.is_absolute() {
        return Err(LanekeeperError::PathError(format!(
            "sandbox candidate must be absolute: {}",
            path.display()
        )));
    }
    let mut existing = path.to_path_buf();
    let mut tail: Vec<std::ffi::OsString> = Vec::new();
    loop {
        if existing.exists() {
            break;
        }
        match existing.file_name() {
            Some(name) => {
                tail.push(name.to_os_string());
                existing.pop();
            }
            None => break,
        }
    }
    let mut resolved = existing.canonicalize()?;
    for part in tail.iter().rev() {
        resolved.push(part);
    }
    Ok(resolved)
}

/// Validate that `candidate` equals or lies strictly under `base`.
///
/// `..` components in the unresolved tail are rejected outright; symlink
/// resolution rejects candidates whose resolved target escapes the base.
pub fn ensure_within(base: &Path, candidate: &Path) -> Result<PathBuf, LanekeeperError> {
    if candidate
        .components()
        .any(|c| matches!(c, Component::ParentDir))
    {
        return Err(LanekeeperError::PathError(format!(
            "path contains '..': {}",
            candidate.display()
        )));
    }

    let base_resolved = resolve_existing_prefix(base)?;
    let cand_resolved = resolve_existing_prefix(candidate)?;

    if cand_resolved == base_resolved || cand_resolved.starts_with(&base_resolved) {
        Ok(cand_resolved)
    } else {
        Err(LanekeeperError::PathError(format!(
            "path escapes allowed base {}: {}",
            base_resolved.display(),
            candidate.display()
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_descendant_accepted() {
        let tmp = tempdir().expect("tempdir");
        let base = tmp.path().join("bundles");
        std::fs::create_dir_all(&base).unwrap();
        let candidate = base.join("system/sha256-ab/content/x.json");
        assert!(ensure_within(&base, &candidate).is_ok());
    }

    #[test]
    fn test_base_itself_accepted() {
        let tmp = tempdir().expect("tempdir");
        let base = tmp.path().join("bundles");
        std::fs::create_dir_all(&base).unwrap();
        assert!(ensure_within(&base, &base).is_ok());
    }

    #[test]
    fn test_sibling_rejected() {
        let tmp = tempdir().expect("tempdir");
        let base = tmp.path().join("bundles");
        std::fs::create_dir_all(&base).unwrap();
        let outside = tmp.path().join("elsewhere/out.json");
        assert!(ensure_within(&base, &outside).is_err());
    }

    #[test]
    fn test_parent_dir_component_rejected() {
        let tmp = tempdir().expect("tempdir");
        let base = tmp.path().join("bundles");
        std::fs::create_dir_all(&base).unwrap();
        let sneaky = base.join("../elsewhere");
        assert!(ensure_within(&base, &sneaky).is_err());
    }

    #[cfg(unix)]
    #[test]
    fn test_symlink_escape_rejected() {
        let tmp = tempdir().expect("tempdir");
        let base = tmp.path().join("bundles");
        let outside = tmp.path().join("outside");
        std::fs::create_dir_all(&base).unwrap();
        std::fs::create_dir_all(&outside).unwrap();
        std::os::unix::fs::symlink(&outside, base.join("link")).unwrap();
        let candidate = base.join("link/escape.json");
        assert!(ensure_within(&base, &candidate).is_err());
    }
}
