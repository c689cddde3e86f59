//! Freshness & Staleness policy.
//!
//! A repo scope is stale when its branch head moved since the last scan,
//! when merge events landed after the scan, or when any fingerprinted file
//! drifted. System scope is stale iff any active repo is. The policy only
//! degrades to hard-stale past a configured grace (time or merge count);
//! guards that refuse on staleness record a decision packet and a ledger
//! line, and never mutate knowledge.

use crate::core::error::LanekeeperError;
use crate::core::fsio;
use crate::core::git;
use crate::core::layout::{KnowledgePaths, OpsPaths, scope_file_component};
use crate::core::ledger::{self, LedgerLine};
use crate::core::time;
use crate::events::summary;
use crate::knowledge::indexer;
use crate::knowledge::registry::{Repo, RepoRegistry};
use crate::knowledge::scan;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;
use std::path::Path;

/// Grace thresholds separating soft from hard staleness.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StalenessConfig {
    /// Head/fingerprint drift older than this degrades to hard-stale.
    pub grace_ms: i64,
    /// More than this many post-scan merges degrades to hard-stale.
    pub soft_merge_limit: usize,
}

impl Default for StalenessConfig {
    fn default() -> Self {
        StalenessConfig {
            grace_ms: 24 * 60 * 60 * 1000,
            soft_merge_limit: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScopeStaleness {
    pub scope: String,
    pub stale: bool,
    pub hard_stale: bool,
    pub reasons: Vec<String>,
    pub stale_repos: Vec<String>,
}

impl ScopeStaleness {
    fn fresh(scope: &str) -> ScopeStaleness {
        ScopeStaleness {
            scope: scope.to_string(),
            stale: false,
            hard_stale: false,
            reasons: vec![],
            stale_repos: vec![],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StalenessView {
    pub version: u32,
    pub generated_at: String,
    pub scopes: BTreeMap<String, ScopeStaleness>,
}

/// Explicit override for a staleness guard refusal.
#[derive(Debug, Clone)]
pub struct StaleOverride {
    pub by: String,
    pub reason: String,
}

/// Evaluate one repo scope.
pub fn evaluate_repo(
    ops: &OpsPaths,
    knowledge: &KnowledgePaths,
    repo: &Repo,
    repo_abs: &Path,
    config: &StalenessConfig,
) -> Result<ScopeStaleness, LanekeeperError> {
    let scope = format!("repo:{}", repo.repo_id);
    let mut out = ScopeStaleness::fresh(&scope);

    let scan = match scan::load_scan(knowledge, &repo.repo_id) {
        Ok(scan) => scan,
        Err(LanekeeperError::MissingInput(_)) => {
            out.stale = true;
            out.hard_stale = true;
            out.reasons.push(format!("{}:never_scanned", repo.repo_id));
            out.stale_repos.push(repo.repo_id.clone());
            return Ok(out);
        }
        Err(e) => return Err(e),
    };
    let scanned_at = time::parse_rfc3339(&scan.scanned_at)?;
    let scan_age_ms = (Utc::now() - scanned_at).num_milliseconds();
    let past_grace = scan_age_ms > config.grace_ms;

    // (a) head moved
    let mut drift = false;
    match indexer::resolve_index_ref(repo_abs, &repo.active_branch) {
        Ok(reference) => {
            let head = git::rev_list_one(repo_abs, &reference)?;
            if head != scan.head_sha {
                drift = true;
                out.reasons.push(format!("{}:head_moved", repo.repo_id));
            } else {
                // (c) fingerprint drift; only reachable while the head is
                // unchanged, where it catches ref rewrites in place.
                let (_, fingerprints) = indexer::load_index_artifacts(knowledge, &repo.repo_id)?;
                for entry in &fingerprints.files {
                    let current = git::show_file_at_ref(repo_abs, &reference, &entry.path)
                        .map(|bytes| indexer::sha256_hex(&bytes))
                        .unwrap_or_default();
                    if current != entry.sha256 {
                        drift = true;
                        out.reasons
                            .push(format!("{}:fingerprint_drift:{}", repo.repo_id, entry.path));
                    }
                }
            }
        }
        Err(_) => {
            drift = true;
            out.reasons.push(format!("{}:branch_unresolvable", repo.repo_id));
        }
    }

    // (b) merges after the last refresh
    let merges = summary::events_for_repo_after(ops, &repo.repo_id, &scanned_at)?;
    if !merges.is_empty() {
        out.reasons
            .push(format!("{}:merge_after_last_refresh", repo.repo_id));
    }

    if drift || !merges.is_empty() {
        out.stale = true;
        out.stale_repos.push(repo.repo_id.clone());
        out.hard_stale = (drift && past_grace) || merges.len() > config.soft_merge_limit;
    }
    Ok(out)
}

/// Evaluate a scope (`system` or `repo:<id>`), aggregating repo results for
/// the system scope.
pub fn evaluate_scope(
    ops: &OpsPaths,
    knowledge: &KnowledgePaths,
    registry: &RepoRegistry,
    repos_root: &Path,
    scope: &str,
    config: &StalenessConfig,
) -> Result<ScopeStaleness, LanekeeperError> {
    if let Some(repo_id) = scope.strip_prefix("repo:") {
        let repo = registry.require_active(repo_id)?;
        return evaluate_repo(ops, knowledge, repo, &repo.abs_path(repos_root), config);
    }
    if scope != "system" {
        return Err(LanekeeperError::ContractViolation(format!(
            "unknown scope '{}'",
            scope
        )));
    }

    let mut out = ScopeStaleness::fresh("system");
    for repo in registry.active_repos() {
        let repo_result =
            evaluate_repo(ops, knowledge, repo, &repo.abs_path(repos_root), config)?;
        if repo_result.stale {
            out.stale = true;
            out.hard_stale |= repo_result.hard_stale;
            out.reasons.extend(repo_result.reasons);
            out.stale_repos.extend(repo_result.stale_repos);
        }
    }
    out.stale_repos.sort();
    out.reasons.sort();
    Ok(out)
}

/// Evaluate the system scope and every active repo scope, persist the
/// authoritative `staleness.json`, and refresh per-scope hints.
pub fn run_staleness(
    ops: &OpsPaths,
    knowledge: &KnowledgePaths,
    registry: &RepoRegistry,
    repos_root: &Path,
    config: &StalenessConfig,
) -> Result<StalenessView, LanekeeperError> {
    let mut scopes = BTreeMap::new();
    for repo in registry.active_repos() {
        let scope = format!("repo:{}", repo.repo_id);
        let result = evaluate_scope(ops, knowledge, registry, repos_root, &scope, config)?;
        write_refresh_hint(ops, &result)?;
        scopes.insert(scope, result);
    }
    let system = evaluate_scope(ops, knowledge, registry, repos_root, "system", config)?;
    write_refresh_hint(ops, &system)?;
    scopes.insert("system".to_string(), system);

    let view = StalenessView {
        version: 1,
        generated_at: time::now_rfc3339(),
        scopes,
    };
    fsio::write_json_atomic(&ops.staleness_path(), &view)?;
    Ok(view)
}

/// Per-scope refresh hint (`RH-*.json`): stale scopes carry the commands an
/// operator should run; fresh scopes clear the hint.
fn write_refresh_hint(ops: &OpsPaths, result: &ScopeStaleness) -> Result<(), LanekeeperError> {
    let path = ops
        .lane_a_refresh_hints()
        .join(format!("RH-{}.json", scope_file_component(&result.scope)));
    if !result.stale {
        if path.exists() {
            std::fs::remove_file(&path)?;
        }
        return Ok(());
    }
    let suggested: Vec<String> = result
        .stale_repos
        .iter()
        .flat_map(|id| {
            [
                format!("lanekeeper index --repo-id {}", id),
                format!("lanekeeper scan --repo-id {}", id),
            ]
        })
        .collect();
    let hint = json!({
        "version": 1,
        "scope": &result.scope,
        "hard_stale": result.hard_stale,
        "reasons": &result.reasons,
        "suggested_commands": suggested,
        "updated_at": time::now_rfc3339(),
    });
    fsio::write_json_atomic(&path, &hint)
}

/// Write a decision packet (`DP-*.{json,md}`) recording a blocking state.
pub fn write_decision_packet(
    ops: &OpsPaths,
    scope: &str,
    blocking_state: &str,
    trigger: &str,
    context_summary: &str,
) -> Result<String, LanekeeperError> {
    let stamp = time::fs_safe_stamp(&Utc::now());
    let decision_id = format!(
        "DP-{}__{}__{}",
        stamp,
        scope_file_component(scope),
        blocking_state
    );
    let packet = json!({
        "version": 1,
        "decision_id": &decision_id,
        "scope": scope,
        "blocking_state": blocking_state,
        "trigger": trigger,
        "context_summary": context_summary,
        "question": format!("Proceed despite {} for scope {}?", blocking_state, scope),
        "expected_answer_type": "approve_or_refresh",
        "constraints": ["knowledge must not be mutated by this guard"],
        "blocks": [trigger],
        "assumptions_if_unanswered": ["operation remains blocked"],
        "created_at": time::now_rfc3339(),
        "status": "open",
    });
    let dir = ops.lane_a_decision_packets();
    fsio::write_json_atomic(&dir.join(format!("{}.json", decision_id)), &packet)?;

    let md = format!(
        "# {}\n\nScope: `{}`\nBlocking state: `{}`\nTrigger: `{}`\n\n{}\n\n\
         Answer by refreshing the scope or recording an explicit override.\n",
        decision_id, scope, blocking_state, trigger, context_summary
    );
    fsio::write_atomic(&dir.join(format!("{}.md", decision_id)), md.as_bytes())?;
    Ok(decision_id)
}

/// Staleness guard shared by bundle and sufficiency-confirming operations.
///
/// Fresh scopes pass. Stale scopes refuse with `knowledge_stale` and write a
/// decision packet, unless an explicit override is supplied; the override is
/// audit-logged to the Lane A ledger.
pub fn guard_scope(
    ops: &OpsPaths,
    knowledge: &KnowledgePaths,
    registry: &RepoRegistry,
    repos_root: &Path,
    scope: &str,
    config: &StalenessConfig,
    trigger: &str,
    stale_override: Option<&StaleOverride>,
) -> Result<ScopeStaleness, LanekeeperError> {
    let result = evaluate_scope(ops, knowledge, registry, repos_root, scope, config)?;
    if !result.stale {
        return Ok(result);
    }

    if let Some(ovr) = stale_override {
        ledger::append(
            &ops.lane_a_ledger(),
            &LedgerLine::new(&ovr.by, "stale_override")
                .with_scope(scope)
                .with_details(json!({
                    "trigger": trigger,
                    "reason": &ovr.reason,
                    "reasons": &result.reasons,
                })),
        )?;
        return Ok(result);
    }

    write_decision_packet(
        ops,
        scope,
        "knowledge_stale",
        trigger,
        &format!("refresh required: {}", result.reasons.join("; ")),
    )?;
    Err(LanekeeperError::KnowledgeStale(format!(
        "scope {} is stale ({})",
        scope,
        result.reasons.join("; ")
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_values() {
        let config = StalenessConfig::default();
        assert_eq!(config.grace_ms, 86_400_000);
        assert_eq!(config.soft_merge_limit, 3);
    }

    #[test]
    fn test_decision_packet_written_with_open_status() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let ops = OpsPaths::new(&tmp.path().join("ops")).unwrap();
        let id = write_decision_packet(&ops, "repo:a", "knowledge_stale", "bundle", "ctx").unwrap();
        assert!(id.starts_with("DP-"));
        assert!(id.contains("repo-a"));

        let json_path = ops.lane_a_decision_packets().join(format!("{}.json", id));
        let md_path = ops.lane_a_decision_packets().join(format!("{}.md", id));
        assert!(json_path.exists());
        assert!(md_path.exists());
        let packet: serde_json::Value = fsio::load_json(&json_path).unwrap();
        assert_eq!(packet["status"], "open");
        assert_eq!(packet["blocking_state"], "knowledge_stale");
    }
}
