//! Knowledge version pointer: monotone `vMAJOR[.MINOR[.PATCH]]`.
//!
//! The pointer lives under Lane A; a compact mirror (last 50 history
//! entries) is refreshed into the knowledge root after every change.

use crate::core::error::LanekeeperError;
use crate::core::fsio;
use crate::core::layout::{KnowledgePaths, OpsPaths};
use crate::core::lock::{FileLock, ORCHESTRATE_STALE_MS};
use crate::core::time;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::OnceLock;

const MIRROR_LIMIT: usize = 50;

pub fn version_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^v\d+(\.\d+){0,2}$").unwrap())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BumpKind {
    Major,
    Minor,
    Patch,
}

impl BumpKind {
    pub fn parse(raw: &str) -> Result<BumpKind, LanekeeperError> {
        match raw {
            "bump_major" | "major" => Ok(BumpKind::Major),
            "bump_minor" | "minor" => Ok(BumpKind::Minor),
            "bump_patch" | "patch" => Ok(BumpKind::Patch),
            other => Err(LanekeeperError::ContractViolation(format!(
                "unknown bump kind '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionHistoryEntry {
    pub v: String,
    pub at: String,
    pub reason: String,
    pub scope: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnowledgeVersion {
    #[serde(default = "default_version")]
    pub version: u32,
    pub current: String,
    #[serde(default)]
    pub history: Vec<VersionHistoryEntry>,
}

fn default_version() -> u32 {
    1
}

impl Default for KnowledgeVersion {
    fn default() -> Self {
        KnowledgeVersion {
            version: 1,
            current: "v0".to_string(),
            history: vec![],
        }
    }
}

pub fn parse_version(raw: &str) -> Result<Vec<u64>, LanekeeperError> {
    if !version_regex().is_match(raw) {
        return Err(LanekeeperError::ContractViolation(format!(
            "version '{}' does not match v<int>[.int[.int]]",
            raw
        )));
    }
    raw[1..]
        .split('.')
        .map(|seg| {
            seg.parse::<u64>().map_err(|e| {
                LanekeeperError::ContractViolation(format!("version segment '{}': {}", seg, e))
            })
        })
        .collect()
}

fn render(segments: &[u64]) -> String {
    format!(
        "v{}",
        segments
            .iter()
            .map(u64::to_string)
            .collect::<Vec<_>>()
            .join(".")
    )
}

/// Apply bump semantics to a version string.
///
/// - `Major`: `vM[...] -> v(M+1)`
/// - `Minor`: `vM -> vM.1`; `vM.N[...] -> vM.(N+1)` (deeper segments dropped)
/// - `Patch`: `vM -> vM.0.1`; otherwise increment the last segment
pub fn bump_version(current: &str, kind: BumpKind) -> Result<String, LanekeeperError> {
    let segs = parse_version(current)?;
    let next = match kind {
        BumpKind::Major => vec![segs[0] + 1],
        BumpKind::Minor => {
            if segs.len() == 1 {
                vec![segs[0], 1]
            } else {
                vec![segs[0], segs[1] + 1]
            }
        }
        BumpKind::Patch => {
            if segs.len() == 1 {
                vec![segs[0], 0, 1]
            } else {
                let mut out = segs.clone();
                let last = out.len() - 1;
                out[last] += 1;
                out
            }
        }
    };
    Ok(render(&next))
}

/// Dotted-tuple comparison; a strict prefix orders before its extension.
pub fn compare_versions(a: &str, b: &str) -> Result<std::cmp::Ordering, LanekeeperError> {
    Ok(parse_version(a)?.cmp(&parse_version(b)?))
}

pub fn load(ops: &OpsPaths) -> Result<KnowledgeVersion, LanekeeperError> {
    Ok(fsio::load_json_opt(&ops.knowledge_version_path())?.unwrap_or_default())
}

fn persist(
    ops: &OpsPaths,
    knowledge: &KnowledgePaths,
    record: &KnowledgeVersion,
) -> Result<(), LanekeeperError> {
    fsio::write_json_atomic(&ops.knowledge_version_path(), record)?;
    refresh_mirror(knowledge, record)
}

/// Compact mirror: last 50 entries, JSON + markdown.
fn refresh_mirror(
    knowledge: &KnowledgePaths,
    record: &KnowledgeVersion,
) -> Result<(), LanekeeperError> {
    let tail: Vec<&VersionHistoryEntry> = record
        .history
        .iter()
        .rev()
        .take(MIRROR_LIMIT)
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();
    let mirror = json!({
        "version": 1,
        "current": &record.current,
        "history": &tail,
    });
    fsio::write_json_atomic(&knowledge.version_mirror_json(), &mirror)?;

    let mut md = String::new();
    md.push_str("# Knowledge Version\n\n");
    md.push_str(&format!("Current: **{}**\n\n", record.current));
    md.push_str("| version | at | scope | reason |\n|---|---|---|---|\n");
    for entry in tail.iter().rev() {
        md.push_str(&format!(
            "| {} | {} | {} | {} |\n",
            entry.v, entry.at, entry.scope, entry.reason
        ));
    }
    fsio::write_atomic(&knowledge.version_mirror_md(), md.as_bytes())
}

/// Bump the pointer; serialized by the orchestrate lock.
pub fn bump(
    ops: &OpsPaths,
    knowledge: &KnowledgePaths,
    kind: BumpKind,
    reason: &str,
    scope: &str,
) -> Result<KnowledgeVersion, LanekeeperError> {
    let lock = FileLock::acquire(
        &ops.orchestrate_lock_path(),
        ORCHESTRATE_STALE_MS,
        Some(json!({"operation": "version_bump"})),
    )?;
    let mut record = load(ops)?;
    let next = bump_version(&record.current, kind)?;
    record.history.push(VersionHistoryEntry {
        v: next.clone(),
        at: time::now_rfc3339(),
        reason: reason.to_string(),
        scope: scope.to_string(),
        notes: None,
    });
    record.current = next;
    persist(ops, knowledge, &record)?;
    lock.release()?;
    Ok(record)
}

/// Set the pointer to an explicit version, recording the transition.
pub fn set_explicit(
    ops: &OpsPaths,
    knowledge: &KnowledgePaths,
    to_version: &str,
    reason: &str,
    scope: &str,
) -> Result<KnowledgeVersion, LanekeeperError> {
    parse_version(to_version)?;
    let lock = FileLock::acquire(
        &ops.orchestrate_lock_path(),
        ORCHESTRATE_STALE_MS,
        Some(json!({"operation": "version_set"})),
    )?;
    let mut record = load(ops)?;
    let notes = if record.current != to_version {
        Some(format!("from={}", record.current))
    } else {
        None
    };
    record.history.push(VersionHistoryEntry {
        v: to_version.to_string(),
        at: time::now_rfc3339(),
        reason: reason.to_string(),
        scope: scope.to_string(),
        notes,
    });
    record.current = to_version.to_string();
    persist(ops, knowledge, &record)?;
    lock.release()?;
    Ok(record)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cmp::Ordering;

    #[test]
    fn test_bump_minor_cases() {
        assert_eq!(bump_version("v1", BumpKind::Minor).unwrap(), "v1.1");
        assert_eq!(bump_version("v1.2", BumpKind::Minor).unwrap(), "v1.3");
        assert_eq!(bump_version("v1.2.3", BumpKind::Minor).unwrap(), "v1.3");
    }

    #[test]
    fn test_bump_patch_cases() {
        assert_eq!(bump_version("v1", BumpKind::Patch).unwrap(), "v1.0.1");
        assert_eq!(bump_version("v1.0.1", BumpKind::Patch).unwrap(), "v1.0.2");
        assert_eq!(bump_version("v1.2", BumpKind::Patch).unwrap(), "v1.3");
    }

    #[test]
    fn test_bump_major_drops_deeper_segments() {
        assert_eq!(bump_version("v1.2.3", BumpKind::Major).unwrap(), "v2");
        assert_eq!(bump_version("v0", BumpKind::Major).unwrap(), "v1");
    }

    #[test]
    fn test_bumps_are_strictly_increasing() {
        let mut current = "v0".to_string();
        for kind in [
            BumpKind::Patch,
            BumpKind::Patch,
            BumpKind::Minor,
            BumpKind::Patch,
            BumpKind::Minor,
            BumpKind::Major,
            BumpKind::Minor,
        ] {
            let next = bump_version(&current, kind).unwrap();
            assert_eq!(
                compare_versions(&current, &next).unwrap(),
                Ordering::Less,
                "{} -> {}",
                current,
                next
            );
            current = next;
        }
    }

    #[test]
    fn test_chain_patch_minor_major_reaches_v1() {
        let a = bump_version("v0", BumpKind::Patch).unwrap();
        assert_eq!(a, "v0.0.1");
        let b = bump_version(&a, BumpKind::Minor).unwrap();
        assert_eq!(b, "v0.1");
        let c = bump_version(&b, BumpKind::Major).unwrap();
        assert_eq!(c, "v1");
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!(parse_version("1.2").is_err());
        assert!(parse_version("v1.2.3.4").is_err());
        assert!(parse_version("v").is_err());
        assert!(parse_version("va").is_err());
    }

    #[test]
    fn test_prefix_orders_before_extension() {
        assert_eq!(compare_versions("v1", "v1.0").unwrap(), Ordering::Less);
        assert_eq!(compare_versions("v1.0", "v1.0.1").unwrap(), Ordering::Less);
    }
}
