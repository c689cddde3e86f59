//! Evidence refs and facts.
//!
//! An evidence ref is a stable citation `(repo_id, commit_sha, file_path,
//! line_range)` with a content-derived id. Facts are claims backed by one or
//! more refs. Evidence building fails closed: a single unreadable path aborts
//! the whole build so no fact can cite bytes that cannot be reproduced.

use crate::core::error::LanekeeperError;
use crate::core::fsio;
use crate::core::git;
use crate::core::time;
use crate::knowledge::indexer::{RepoFingerprints, RepoIndex};
use rustc_hash::FxHashSet;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::Path;

/// Evidence windows never exceed this many lines from the top of the file.
pub const MAX_EVIDENCE_LINES: usize = 200;

/// Per-list cap when collecting candidate paths from the index.
const SAMPLE_CAP: usize = 50;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvidenceRef {
    pub evidence_id: String,
    pub repo_id: String,
    pub file_path: String,
    pub commit_sha: String,
    pub start_line: usize,
    pub end_line: usize,
    pub extractor: String,
    pub captured_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fact {
    pub fact_id: String,
    pub claim: String,
    pub evidence_ids: Vec<String>,
}

/// `EVID_` + first 12 hex chars of the sha256 over the citation parts.
pub fn evidence_id(
    repo_id: &str,
    commit_sha: &str,
    file_path: &str,
    start_line: usize,
    end_line: usize,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(repo_id.as_bytes());
    hasher.update(b"\n");
    hasher.update(commit_sha.as_bytes());
    hasher.update(b"\n");
    hasher.update(file_path.as_bytes());
    hasher.update(b"\n");
    hasher.update(format!("{}:{}", start_line, end_line).as_bytes());
    let digest = format!("{:x}", hasher.finalize());
    format!("EVID_{}", &digest[..12])
}

/// `F_` + first 10 hex chars of the sha256 over `prefix` and ordered parts.
pub fn fact_id(prefix: &str, parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(prefix.as_bytes());
    for part in parts {
        hasher.update(b"\n");
        hasher.update(part.as_bytes());
    }
    let digest = format!("{:x}", hasher.finalize());
    format!("F_{}", &digest[..10])
}

/// Validate and normalize a repo-relative citation path.
pub fn sanitize_rel_path(raw: &str) -> Result<String, LanekeeperError> {
    let path = raw.trim();
    if path.is_empty() {
        return Err(LanekeeperError::ContractViolation(
            "evidence path is empty".to_string(),
        ));
    }
    if path.starts_with('/') {
        return Err(LanekeeperError::ContractViolation(format!(
            "evidence path must be relative: {}",
            path
        )));
    }
    if path.contains('\\') {
        return Err(LanekeeperError::ContractViolation(format!(
            "evidence path must not contain backslashes: {}",
            path
        )));
    }
    if path.split('/').any(|seg| seg == "..") {
        return Err(LanekeeperError::ContractViolation(format!(
            "evidence path must not contain '..': {}",
            path
        )));
    }
    Ok(path.to_string())
}

/// Sorted-unique candidate paths an evidence build will cite, drawn from the
/// index (entrypoints, hotspots, api surface samples, migrations, build
/// evidence, cross-repo refs) plus every fingerprint key.
pub fn collect_evidence_file_paths(
    index: &RepoIndex,
    fingerprints: &RepoFingerprints,
) -> Result<Vec<String>, LanekeeperError> {
    let mut seen: FxHashSet<String> = FxHashSet::default();
    let mut out: Vec<String> = Vec::new();
    let mut push = |raw: &str| -> Result<(), LanekeeperError> {
        let path = sanitize_rel_path(raw)?;
        if seen.insert(path.clone()) {
            out.push(path);
        }
        Ok(())
    };

    for p in &index.entrypoints {
        push(p)?;
    }
    for h in &index.hotspots {
        push(&h.file_path)?;
    }
    for p in &index.api_surface.openapi_files {
        push(p)?;
    }
    for p in index.api_surface.routes_controllers.iter().take(SAMPLE_CAP) {
        push(p)?;
    }
    for p in index.api_surface.events_topics.iter().take(SAMPLE_CAP) {
        push(p)?;
    }
    for p in index.migrations_schema.iter().take(SAMPLE_CAP) {
        push(p)?;
    }
    for p in &index.build_commands.evidence_files {
        push(p)?;
    }
    for dep in &index.cross_repo_dependencies {
        for p in &dep.evidence_refs {
            push(p)?;
        }
    }
    for entry in &fingerprints.files {
        push(&entry.path)?;
    }

    out.sort();
    Ok(out)
}

/// Number of evidence-addressable lines in a blob. A zero-byte file counts
/// as one empty line so the `1 <= start <= end` invariant holds.
fn line_count(bytes: &[u8]) -> usize {
    let text = String::from_utf8_lossy(bytes);
    text.lines().count().max(1)
}

/// Build refs over the head window of each path at `commit_sha`.
///
/// Any unreadable path fails the whole build (`evidence_missing`): this is
/// what guarantees referential integrity for every fact downstream.
pub fn build_evidence_refs(
    repo_abs: &Path,
    repo_id: &str,
    commit_sha: &str,
    paths: &[String],
) -> Result<Vec<EvidenceRef>, LanekeeperError> {
    let captured_at = time::now_rfc3339();
    let mut refs = Vec::with_capacity(paths.len());
    for path in paths {
        let bytes = git::show_file_at_ref(repo_abs, commit_sha, path).map_err(|e| {
            LanekeeperError::EvidenceMissing(format!(
                "{}@{}:{}: {}",
                repo_id, commit_sha, path, e
            ))
        })?;
        let end_line = line_count(&bytes).min(MAX_EVIDENCE_LINES);
        refs.push(EvidenceRef {
            evidence_id: evidence_id(repo_id, commit_sha, path, 1, end_line),
            repo_id: repo_id.to_string(),
            file_path: path.clone(),
            commit_sha: commit_sha.to_string(),
            start_line: 1,
            end_line,
            extractor: "git_show_head_window".to_string(),
            captured_at: captured_at.clone(),
        });
    }
    refs.sort_by(|a, b| a.file_path.cmp(&b.file_path));
    Ok(refs)
}

/// Check that every fact cites at least one evidence id and that every cited
/// id exists in the sibling ref set.
pub fn check_fact_closure(facts: &[Fact], refs: &[EvidenceRef]) -> Result<(), LanekeeperError> {
    let known: FxHashSet<&str> = refs.iter().map(|r| r.evidence_id.as_str()).collect();
    for fact in facts {
        if fact.evidence_ids.is_empty() {
            return Err(LanekeeperError::ContractViolation(format!(
                "fact {} ('{}') cites no evidence",
                fact.fact_id, fact.claim
            )));
        }
        for id in &fact.evidence_ids {
            if !known.contains(id.as_str()) {
                return Err(LanekeeperError::ContractViolation(format!(
                    "fact {} cites unknown evidence id {}",
                    fact.fact_id, id
                )));
            }
        }
    }
    Ok(())
}

/// Serialize refs as one JSON object per line.
pub fn write_refs_jsonl(path: &Path, refs: &[EvidenceRef]) -> Result<(), LanekeeperError> {
    let mut body = String::new();
    for r in refs {
        body.push_str(&serde_json::to_string(r)?);
        body.push('\n');
    }
    fsio::write_atomic(path, body.as_bytes())
}

pub fn load_refs_jsonl(path: &Path) -> Result<Vec<EvidenceRef>, LanekeeperError> {
    let raw = std::fs::read_to_string(path)?;
    let mut refs = Vec::new();
    for (idx, line) in raw.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let r: EvidenceRef = serde_json::from_str(line).map_err(|e| {
            LanekeeperError::Malformed(format!("{}:{}: {}", path.display(), idx + 1, e))
        })?;
        refs.push(r);
    }
    Ok(refs)
}
