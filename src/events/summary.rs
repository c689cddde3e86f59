//! Merge-event consumers (Lane A side): summary and checkpoints.
//!
//! Segments are read in ascending filename order, which equals time order
//! because the name encodes UTC. Lines that fail the shape check become
//! warnings, never failures; one bad producer must not blind the policy
//! layer to every other merge.

use crate::core::error::LanekeeperError;
use crate::core::fsio;
use crate::core::layout::{KnowledgePaths, OpsPaths};
use crate::core::time;
use crate::events::log::{self, MergeEvent};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepoLatest {
    pub repo_id: String,
    pub latest_merge_commit: String,
    pub latest_pr_number: u64,
    pub latest_timestamp: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventsSummary {
    pub version: u32,
    pub generated_at: String,
    pub merge_events: Vec<RepoLatest>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub version: u32,
    pub consumer: String,
    pub last_read_segment: String,
    pub last_read_offset: u64,
    pub updated_at: String,
}

/// Segment files in ascending (= chronological) filename order.
pub fn list_segments(ops: &OpsPaths) -> Result<Vec<PathBuf>, LanekeeperError> {
    let dir = ops.lane_a_events_segments();
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut segments: Vec<PathBuf> = fs::read_dir(&dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.extension().and_then(|e| e.to_str()) == Some("jsonl"))
        .collect();
    segments.sort();
    Ok(segments)
}

/// Every valid merge event across all segments, in append order within a
/// segment and segment order across them. Invalid lines come back as
/// warnings.
pub fn read_all_events(
    ops: &OpsPaths,
) -> Result<(Vec<MergeEvent>, Vec<String>), LanekeeperError> {
    let mut events = Vec::new();
    let mut warnings = Vec::new();
    for segment in list_segments(ops)? {
        let (values, mut line_warnings) = fsio::read_jsonl_lenient(&segment)?;
        warnings.append(&mut line_warnings);
        for value in values {
            match log::validate_merge_event(&value) {
                Ok(event) => events.push(event),
                Err(e) => warnings.push(format!("{}: skipped line: {}", segment.display(), e)),
            }
        }
    }
    Ok((events, warnings))
}

/// Fold one event into a latest-per-repo map. Tie-break: greater timestamp,
/// then greater id (lexicographic).
pub fn merge_latest(latest: &mut BTreeMap<String, (MergeEvent, RepoLatest)>, event: MergeEvent) {
    let candidate = RepoLatest {
        repo_id: event.repo_id.clone(),
        latest_merge_commit: event.merge_commit_sha.clone(),
        latest_pr_number: event.pr_number,
        latest_timestamp: event.timestamp.clone(),
    };
    match latest.get(&event.repo_id) {
        Some((current, _))
            if (current.timestamp.as_str(), current.id.as_str())
                >= (event.timestamp.as_str(), event.id.as_str()) => {}
        _ => {
            latest.insert(event.repo_id.clone(), (event, candidate));
        }
    }
}

#[derive(Debug)]
pub struct SummaryOutcome {
    pub summary: EventsSummary,
    pub warnings: Vec<String>,
}

/// Build the latest-per-repo summary and write it to both the Lane A events
/// tree and the knowledge root, atomically.
pub fn run_events_summary(
    ops: &OpsPaths,
    knowledge: &KnowledgePaths,
) -> Result<SummaryOutcome, LanekeeperError> {
    let (events, warnings) = read_all_events(ops)?;
    let mut latest: BTreeMap<String, (MergeEvent, RepoLatest)> = BTreeMap::new();
    for event in events {
        merge_latest(&mut latest, event);
    }

    let summary = EventsSummary {
        version: 1,
        generated_at: time::now_rfc3339(),
        merge_events: latest.into_values().map(|(_, row)| row).collect(),
    };

    fsio::write_json_atomic(&ops.lane_a_events_summary(), &summary)?;
    fsio::write_json_atomic(&knowledge.events_summary_path(), &summary)?;

    Ok(SummaryOutcome { summary, warnings })
}

/// Merge events for one repo strictly after `after` (exclusive).
pub fn events_for_repo_after(
    ops: &OpsPaths,
    repo_id: &str,
    after: &DateTime<Utc>,
) -> Result<Vec<MergeEvent>, LanekeeperError> {
    let (events, _) = read_all_events(ops)?;
    let mut out = Vec::new();
    for event in events {
        if event.repo_id != repo_id {
            continue;
        }
        let ts = time::parse_rfc3339(&event.timestamp)?;
        if ts > *after {
            out.push(event);
        }
    }
    Ok(out)
}

fn checkpoint_path(ops: &OpsPaths, consumer: &str) -> PathBuf {
    ops.lane_a_events_checkpoints()
        .join(format!("{}.json", consumer))
}

pub fn load_checkpoint(
    ops: &OpsPaths,
    consumer: &str,
) -> Result<Option<Checkpoint>, LanekeeperError> {
    fsio::load_json_opt(&checkpoint_path(ops, consumer))
}

pub fn store_checkpoint(
    ops: &OpsPaths,
    consumer: &str,
    last_read_segment: &str,
    last_read_offset: u64,
) -> Result<Checkpoint, LanekeeperError> {
    let checkpoint = Checkpoint {
        version: 1,
        consumer: consumer.to_string(),
        last_read_segment: last_read_segment.to_string(),
        last_read_offset,
        updated_at: time::now_rfc3339(),
    };
    fsio::write_json_atomic(&checkpoint_path(ops, consumer), &checkpoint)?;
    Ok(checkpoint)
}

/// Events beyond a consumer's checkpoint, with the position that would
/// become its next checkpoint.
pub fn events_since_checkpoint(
    ops: &OpsPaths,
    consumer: &str,
) -> Result<(Vec<MergeEvent>, Option<(String, u64)>), LanekeeperError> {
    let checkpoint = load_checkpoint(ops, consumer)?;
    let mut out = Vec::new();
    let mut position: Option<(String, u64)> = None;

    for segment in list_segments(ops)? {
        let name = segment
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let skip_before = match &checkpoint {
            Some(cp) if name < cp.last_read_segment => continue,
            Some(cp) if name == cp.last_read_segment => cp.last_read_offset,
            _ => 0,
        };

        let (values, _) = fsio::read_jsonl_lenient(&segment)?;
        let mut offset = 0u64;
        for value in values {
            offset += 1;
            if offset <= skip_before {
                continue;
            }
            if let Ok(event) = log::validate_merge_event(&value) {
                out.push(event);
            }
        }
        position = Some((name, offset));
    }
    Ok((out, position))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::log::MergeEventInput;
    use chrono::TimeZone;
    use tempfile::tempdir;

    fn input(repo: &str, pr: u64, ts: &str) -> MergeEventInput {
        MergeEventInput {
            repo_id: repo.to_string(),
            pr_number: pr,
            merge_commit_sha: format!("sha{}{}", repo, pr).repeat(3),
            base_branch: "main".to_string(),
            affected_paths: vec![],
            timestamp: ts.to_string(),
            work_id: None,
            pr: None,
            risk_level: None,
        }
    }

    #[test]
    fn test_summary_latest_per_repo() {
        let tmp = tempdir().expect("tempdir");
        let ops = OpsPaths::new(&tmp.path().join("ops")).unwrap();
        let knowledge = KnowledgePaths::new(tmp.path().join("knowledge"));
        let now = Utc.with_ymd_and_hms(2026, 2, 10, 0, 0, 0).unwrap();

        log::log_merge_event(&ops, input("repo-a", 1, "2026-02-10T00:00:00Z"), &now, false)
            .unwrap();
        log::log_merge_event(&ops, input("repo-a", 2, "2026-02-10T01:00:00Z"), &now, false)
            .unwrap();
        log::log_merge_event(&ops, input("repo-b", 3, "2026-02-10T02:00:00Z"), &now, false)
            .unwrap();

        let outcome = run_events_summary(&ops, &knowledge).unwrap();
        assert!(outcome.warnings.is_empty());
        let rows = &outcome.summary.merge_events;
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].repo_id, "repo-a");
        assert_eq!(rows[0].latest_pr_number, 2);
        assert_eq!(rows[1].repo_id, "repo-b");
        assert_eq!(rows[1].latest_pr_number, 3);

        assert!(ops.lane_a_events_summary().exists());
        assert!(knowledge.events_summary_path().exists());
    }

    #[test]
    fn test_invalid_lines_become_warnings() {
        let tmp = tempdir().expect("tempdir");
        let ops = OpsPaths::new(&tmp.path().join("ops")).unwrap();
        let knowledge = KnowledgePaths::new(tmp.path().join("knowledge"));
        let now = Utc.with_ymd_and_hms(2026, 2, 10, 0, 0, 0).unwrap();

        log::log_merge_event(&ops, input("repo-a", 1, "2026-02-10T00:00:00Z"), &now, false)
            .unwrap();
        let segment = log::segment_path(&ops, &now);
        let mut raw = fs::read_to_string(&segment).unwrap();
        raw.push_str("{\"type\":\"deploy\"}\nnot json at all\n");
        fs::write(&segment, raw).unwrap();

        let outcome = run_events_summary(&ops, &knowledge).unwrap();
        assert_eq!(outcome.summary.merge_events.len(), 1);
        assert_eq!(outcome.warnings.len(), 2);
    }

    #[test]
    fn test_tie_break_on_equal_timestamp_prefers_greater_id() {
        let mut latest = BTreeMap::new();
        let mut first = log::log_merge_event(
            &OpsPaths::new(std::path::Path::new("/tmp/ops")).unwrap(),
            input("repo-a", 1, "2026-02-10T00:00:00Z"),
            &Utc.with_ymd_and_hms(2026, 2, 10, 0, 0, 0).unwrap(),
            true,
        )
        .unwrap()
        .event;
        first.id = "EV-repo-a-20260210-000000-aaaaaaaa".to_string();
        let mut second = first.clone();
        second.id = "EV-repo-a-20260210-000000-zzzzzzzz".to_string();
        second.pr_number = 9;

        merge_latest(&mut latest, second.clone());
        merge_latest(&mut latest, first);
        assert_eq!(latest["repo-a"].1.latest_pr_number, 9);
    }

    #[test]
    fn test_checkpoint_round_trip_and_resume() {
        let tmp = tempdir().expect("tempdir");
        let ops = OpsPaths::new(&tmp.path().join("ops")).unwrap();
        let now = Utc.with_ymd_and_hms(2026, 2, 10, 0, 0, 0).unwrap();

        log::log_merge_event(&ops, input("repo-a", 1, "2026-02-10T00:00:00Z"), &now, false)
            .unwrap();
        log::log_merge_event(&ops, input("repo-a", 2, "2026-02-10T01:00:00Z"), &now, false)
            .unwrap();

        let (events, position) = events_since_checkpoint(&ops, "staleness").unwrap();
        assert_eq!(events.len(), 2);
        let (segment, offset) = position.unwrap();
        store_checkpoint(&ops, "staleness", &segment, offset).unwrap();

        let (events, _) = events_since_checkpoint(&ops, "staleness").unwrap();
        assert!(events.is_empty());

        log::log_merge_event(&ops, input("repo-a", 3, "2026-02-10T02:00:00Z"), &now, false)
            .unwrap();
        let (events, _) = events_since_checkpoint(&ops, "staleness").unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].pr_number, 3);
    }

    #[test]
    fn test_events_for_repo_after_filters_strictly() {
        let tmp = tempdir().expect("tempdir");
        let ops = OpsPaths::new(&tmp.path().join("ops")).unwrap();
        let now = Utc.with_ymd_and_hms(2026, 2, 10, 0, 0, 0).unwrap();

        log::log_merge_event(&ops, input("repo-a", 1, "2026-02-10T00:00:00Z"), &now, false)
            .unwrap();
        log::log_merge_event(&ops, input("repo-a", 2, "2026-02-10T01:00:00Z"), &now, false)
            .unwrap();
        log::log_merge_event(&ops, input("repo-b", 3, "2026-02-10T02:00:00Z"), &now, false)
            .unwrap();

        let after = Utc.with_ymd_and_hms(2026, 2, 10, 0, 0, 0).unwrap();
        let events = events_for_repo_after(&ops, "repo-a", &after).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].pr_number, 2);
    }
}
