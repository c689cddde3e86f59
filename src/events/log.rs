//! Merge-event producer (Lane B side of the event log).
//!
//! Segments are `YYYYMMDD-HHMMSS.jsonl` files (UTC, from the producer's
//! `now`), one JSON object per line, append-only. Appends are O(1) via
//! append-mode opens and need no lock.

use crate::core::error::LanekeeperError;
use crate::core::fsio;
use crate::core::git;
use crate::core::layout::OpsPaths;
use crate::core::time;
use crate::knowledge::registry::repo_id_regex;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrRef {
    pub number: u64,
    pub owner: String,
    pub repo: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_branch: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub head_branch: Option<String>,
}

/// One merge event, as written to the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeEvent {
    pub version: u32,
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub repo_id: String,
    pub pr_number: u64,
    pub merge_commit_sha: String,
    pub base_branch: String,
    pub affected_paths: Vec<String>,
    pub timestamp: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub work_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pr: Option<PrRef>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub merge_sha: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub changed_paths: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub obligations: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub risk_level: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub qa_waiver: Option<Value>,
}

/// Producer input before id assignment and path normalization.
#[derive(Debug, Clone)]
pub struct MergeEventInput {
    pub repo_id: String,
    pub pr_number: u64,
    pub merge_commit_sha: String,
    pub base_branch: String,
    pub affected_paths: Vec<String>,
    pub timestamp: String,
    pub work_id: Option<String>,
    pub pr: Option<PrRef>,
    pub risk_level: Option<String>,
}

/// Validate the wire shape of a merge-event line.
pub fn validate_merge_event(value: &Value) -> Result<MergeEvent, LanekeeperError> {
    let event: MergeEvent = serde_json::from_value(value.clone())
        .map_err(|e| LanekeeperError::Malformed(format!("merge event: {}", e)))?;
    if event.event_type != "merge" {
        return Err(LanekeeperError::Malformed(format!(
            "event type '{}' is not 'merge'",
            event.event_type
        )));
    }
    if event.pr_number == 0 {
        return Err(LanekeeperError::Malformed(
            "pr_number must be > 0".to_string(),
        ));
    }
    if event.merge_commit_sha.len() < 7 {
        return Err(LanekeeperError::Malformed(format!(
            "merge_commit_sha '{}' is shorter than 7 chars",
            event.merge_commit_sha
        )));
    }
    if !repo_id_regex().is_match(&event.repo_id) {
        return Err(LanekeeperError::Malformed(format!(
            "repo_id '{}' does not match the repo-id grammar",
            event.repo_id
        )));
    }
    time::parse_rfc3339(&event.timestamp)?;
    Ok(event)
}

pub fn segment_path(ops: &OpsPaths, now: &DateTime<Utc>) -> PathBuf {
    ops.lane_a_events_segments()
        .join(format!("{}.jsonl", time::segment_stamp(now)))
}

fn rand8() -> String {
    let ulid = ulid::Ulid::new().to_string().to_ascii_lowercase();
    ulid[ulid.len() - 8..].to_string()
}

/// Outcome of a producer append.
#[derive(Debug)]
pub struct LoggedEvent {
    pub event: MergeEvent,
    pub segment: PathBuf,
    pub dry_run: bool,
}

/// Append one merge event to the segment for `now`.
pub fn log_merge_event(
    ops: &OpsPaths,
    input: MergeEventInput,
    now: &DateTime<Utc>,
    dry_run: bool,
) -> Result<LoggedEvent, LanekeeperError> {
    let mut affected: Vec<String> = input.affected_paths;
    affected.sort();
    affected.dedup();

    let event = MergeEvent {
        version: 1,
        id: format!(
            "EV-{}-{}-{}",
            input.repo_id,
            time::segment_stamp(now),
            rand8()
        ),
        event_type: "merge".to_string(),
        repo_id: input.repo_id,
        pr_number: input.pr_number,
        merge_commit_sha: input.merge_commit_sha,
        base_branch: input.base_branch,
        affected_paths: affected,
        timestamp: input.timestamp,
        work_id: input.work_id,
        pr: input.pr,
        merge_sha: None,
        changed_paths: None,
        obligations: None,
        risk_level: input.risk_level,
        qa_waiver: None,
    };
    // Shape check on our own output keeps producer and consumer honest
    // about the same contract.
    validate_merge_event(&serde_json::to_value(&event)?)?;

    let segment = segment_path(ops, now);
    if !dry_run {
        fsio::append_jsonl(&segment, &event)?;
    }
    Ok(LoggedEvent {
        event,
        segment,
        dry_run,
    })
}

/// Best-effort affected-path derivation: GitHub listing first, local
/// diff-tree as fallback, empty with `source:"none"` when neither works.
pub fn derive_affected_paths(
    repo_abs: &Path,
    merge_sha: &str,
    pr: Option<&PrRef>,
) -> (Vec<String>, &'static str) {
    if let Some(pr) = pr {
        if let Ok(paths) = gh_pr_files(pr) {
            return (paths, "github_api");
        }
    }
    if let Ok(paths) = git::diff_tree_names(repo_abs, merge_sha) {
        return (paths, "diff_tree");
    }
    (Vec::new(), "none")
}

fn gh_pr_files(pr: &PrRef) -> Result<Vec<String>, LanekeeperError> {
    let endpoint = format!("repos/{}/{}/pulls/{}/files", pr.owner, pr.repo, pr.number);
    let child = Command::new("gh")
        .args(["api", &endpoint, "--jq", ".[].filename"])
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| LanekeeperError::GhFailed(format!("failed to launch gh: {}", e)))?;
    let output = git::wait_with_deadline(child, "gh", git::EXTERNAL_TIMEOUT_MS)?;
    if !output.ok {
        return Err(LanekeeperError::GhFailed(output.stderr.trim().to_string()));
    }
    Ok(output
        .stdout_text()
        .lines()
        .map(|l| l.trim().to_string())
        .filter(|l| !l.is_empty())
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;
    use tempfile::tempdir;

    fn input(repo: &str, pr: u64, ts: &str) -> MergeEventInput {
        MergeEventInput {
            repo_id: repo.to_string(),
            pr_number: pr,
            merge_commit_sha: "deadbeefcafe".to_string(),
            base_branch: "main".to_string(),
            affected_paths: vec!["b.rs".to_string(), "a.rs".to_string(), "b.rs".to_string()],
            timestamp: ts.to_string(),
            work_id: None,
            pr: None,
            risk_level: None,
        }
    }

    #[test]
    fn test_log_merge_event_appends_one_line() {
        let tmp = tempdir().expect("tempdir");
        let ops = OpsPaths::new(&tmp.path().join("ops")).unwrap();
        let now = Utc.with_ymd_and_hms(2026, 2, 10, 0, 0, 0).unwrap();

        let logged =
            log_merge_event(&ops, input("repo-a", 1, "2026-02-10T00:00:00Z"), &now, false)
                .unwrap();
        assert!(logged.segment.ends_with("20260210-000000.jsonl"));
        assert!(logged.event.id.starts_with("EV-repo-a-20260210-000000-"));
        assert_eq!(
            logged.event.affected_paths,
            vec!["a.rs".to_string(), "b.rs".to_string()]
        );

        let raw = std::fs::read_to_string(&logged.segment).unwrap();
        assert_eq!(raw.lines().count(), 1);
        let parsed: Value = serde_json::from_str(raw.lines().next().unwrap()).unwrap();
        assert!(validate_merge_event(&parsed).is_ok());
    }

    #[test]
    fn test_dry_run_writes_nothing() {
        let tmp = tempdir().expect("tempdir");
        let ops = OpsPaths::new(&tmp.path().join("ops")).unwrap();
        let now = Utc.with_ymd_and_hms(2026, 2, 10, 0, 0, 0).unwrap();
        let logged =
            log_merge_event(&ops, input("repo-a", 1, "2026-02-10T00:00:00Z"), &now, true).unwrap();
        assert!(!logged.segment.exists());
    }

    #[test]
    fn test_validate_rejects_bad_shapes() {
        let good = json!({
            "version": 1, "id": "EV-a-x-y", "type": "merge", "repo_id": "a",
            "pr_number": 1, "merge_commit_sha": "deadbee", "base_branch": "main",
            "affected_paths": [], "timestamp": "2026-02-10T00:00:00Z"
        });
        assert!(validate_merge_event(&good).is_ok());

        let mut zero_pr = good.clone();
        zero_pr["pr_number"] = json!(0);
        assert!(validate_merge_event(&zero_pr).is_err());

        let mut short_sha = good.clone();
        short_sha["merge_commit_sha"] = json!("abc");
        assert!(validate_merge_event(&short_sha).is_err());

        let mut not_merge = good.clone();
        not_merge["type"] = json!("deploy");
        assert!(validate_merge_event(&not_merge).is_err());

        let mut bad_ts = good.clone();
        bad_ts["timestamp"] = json!("noon");
        assert!(validate_merge_event(&bad_ts).is_err());
    }
}
