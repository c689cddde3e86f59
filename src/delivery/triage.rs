//! Intake triage: turn an inbox file into repo-scoped work items.
//!
//! Lane A-origin intakes pass through the governance gate first; a failing
//! gate always leaves a triage-failure artifact and a ledger line before
//! returning, and produces no triaged items. For `repo:<id>` scope the item
//! set is narrowed to exactly that repo even when keyword rules would fan
//! out wider.

use crate::core::error::LanekeeperError;
use crate::core::fsio;
use crate::core::layout::{KnowledgePaths, OpsPaths};
use crate::core::ledger::{self, LedgerLine};
use crate::core::time;
use crate::delivery::gate;
use crate::delivery::intake::{self, Scope};
use crate::knowledge::registry::{Repo, RepoRegistry};
use crate::knowledge::staleness::StalenessConfig;
use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize)]
pub struct TriagedItem {
    pub version: u32,
    pub work_id: String,
    pub repo_id: String,
    pub scope: String,
    pub origin: String,
    pub intake_file: String,
    pub title: String,
    pub created_at: String,
}

#[derive(Debug)]
pub enum TriageOutcome {
    Triaged { items: Vec<TriagedItem> },
    Failed { reason_code: String, detail: String },
}

fn intake_title(body: &str) -> String {
    body.lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .unwrap_or("untitled intake")
        .chars()
        .take(120)
        .collect()
}

/// Resolve which repos an intake fans out to.
///
/// Keyword match against the registry; an intake matching nothing goes to
/// every active repo (someone has to look at it). A repo scope pins the set.
fn resolve_repos<'a>(
    registry: &'a RepoRegistry,
    scope: Option<&Scope>,
    body: &str,
) -> Result<Vec<&'a Repo>, LanekeeperError> {
    if let Some(Scope::Repo(repo_id)) = scope {
        return Ok(vec![registry.require_active(repo_id)?]);
    }
    let lower = body.to_ascii_lowercase();
    let matched: Vec<&Repo> = registry
        .active_repos()
        .into_iter()
        .filter(|r| {
            r.keywords
                .iter()
                .any(|k| !k.is_empty() && lower.contains(&k.to_ascii_lowercase()))
                || lower.contains(&r.repo_id)
        })
        .collect();
    if matched.is_empty() {
        Ok(registry.active_repos())
    } else {
        Ok(matched)
    }
}

fn write_failure_artifacts(
    ops: &OpsPaths,
    intake_path: &Path,
    reason_code: &str,
    detail: &str,
) -> Result<(), LanekeeperError> {
    let stamp = time::fs_safe_stamp(&Utc::now());
    let triage_dir = ops.lane_b_triage();
    let intake_name = intake_path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();

    let artifact = json!({
        "version": 1,
        "intake_file": &intake_name,
        "reason_code": reason_code,
        "detail": detail,
        "created_at": time::now_rfc3339(),
    });
    fsio::write_json_atomic(
        &triage_dir.join(format!("TRIAGE_FAILED-{}.json", stamp)),
        &artifact,
    )?;

    let md = format!(
        "# Triage failed\n\nIntake: `{}`\nReason: `{}`\n\n{}\n",
        intake_name, reason_code, detail
    );
    fsio::write_atomic(
        &triage_dir.join(format!("TRIAGE_FAILED-{}.md", stamp)),
        md.as_bytes(),
    )?;

    ledger::append(
        &ops.lane_b_ledger(),
        &LedgerLine::new("lane_b", "triage_failed")
            .with_reason_code(reason_code)
            .with_details(json!({"intake_file": intake_name, "detail": detail})),
    )
}

/// Triage one intake file.
pub fn triage_intake(
    ops: &OpsPaths,
    knowledge: &KnowledgePaths,
    registry: &RepoRegistry,
    repos_root: &Path,
    intake_path: &Path,
    config: &StalenessConfig,
) -> Result<TriageOutcome, LanekeeperError> {
    let text = fs::read_to_string(intake_path).map_err(|e| {
        LanekeeperError::MissingInput(format!("intake {}: {}", intake_path.display(), e))
    })?;
    let header = intake::parse_intake(&text);

    let gate_scope = if header.is_lane_a() {
        match gate::check_lane_a_governance(ops, knowledge, registry, repos_root, &header, config)
        {
            Ok(pass) => Some(pass.scope),
            Err(e) => {
                let reason_code = e.reason_code().to_string();
                let detail = format!("{}", e);
                write_failure_artifacts(ops, intake_path, &reason_code, &detail)?;
                return Ok(TriageOutcome::Failed {
                    reason_code,
                    detail,
                });
            }
        }
    } else {
        // Non-governed intakes may still carry an advisory scope.
        match header.scope.as_deref().map(Scope::parse) {
            Some(Ok(scope)) => Some(scope),
            _ => None,
        }
    };

    let repos = match resolve_repos(registry, gate_scope.as_ref(), &header.body) {
        Ok(repos) => repos,
        Err(e) => {
            let reason_code = e.reason_code().to_string();
            let detail = format!("{}", e);
            write_failure_artifacts(ops, intake_path, &reason_code, &detail)?;
            return Ok(TriageOutcome::Failed {
                reason_code,
                detail,
            });
        }
    };

    let title = intake_title(&header.body);
    let origin = header.origin.clone().unwrap_or_else(|| "human".to_string());
    let scope_label = gate_scope
        .as_ref()
        .map(Scope::to_string)
        .unwrap_or_else(|| "system".to_string());
    let intake_name = intake_path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let stem = intake_path
        .file_stem()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "intake".to_string());

    let mut items = Vec::with_capacity(repos.len());
    for repo in repos {
        let item = TriagedItem {
            version: 1,
            work_id: format!("WI-{}", ulid::Ulid::new().to_string().to_ascii_lowercase()),
            repo_id: repo.repo_id.clone(),
            scope: scope_label.clone(),
            origin: origin.clone(),
            intake_file: intake_name.clone(),
            title: title.clone(),
            created_at: time::now_rfc3339(),
        };
        fsio::write_json_atomic(
            &ops
                .lane_b_inbox_triaged()
                .join(format!("{}__{}.json", stem, repo.repo_id)),
            &item,
        )?;
        items.push(item);
    }

    mark_processed(ops, intake_path, &text)?;
    ledger::append(
        &ops.lane_b_ledger(),
        &LedgerLine::new("lane_b", "triage_ok")
            .with_scope(&scope_label)
            .with_details(json!({
                "intake_file": intake_name,
                "items": items.len(),
            })),
    )?;

    Ok(TriageOutcome::Triaged { items })
}

/// Move a consumed intake into the processed directory (copy for intakes
/// living outside the inbox).
fn mark_processed(
    ops: &OpsPaths,
    intake_path: &Path,
    text: &str,
) -> Result<(), LanekeeperError> {
    let name = intake_path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "intake.md".to_string());
    let target = ops.lane_b_inbox_processed().join(&name);
    fsio::write_atomic(&target, text.as_bytes())?;
    if intake_path.starts_with(ops.lane_b_inbox()) && intake_path.exists() {
        fs::remove_file(intake_path)?;
    }
    Ok(())
}

/// Triage every file sitting in the Lane B inbox.
pub fn triage_inbox(
    ops: &OpsPaths,
    knowledge: &KnowledgePaths,
    registry: &RepoRegistry,
    repos_root: &Path,
    config: &StalenessConfig,
) -> Result<Vec<(PathBuf, TriageOutcome)>, LanekeeperError> {
    let inbox = ops.lane_b_inbox();
    if !inbox.exists() {
        return Ok(Vec::new());
    }
    let mut intakes: Vec<PathBuf> = fs::read_dir(&inbox)?
        .filter_map(|e| e.ok().map(|e| e.path()))
        .filter(|p| p.is_file())
        .collect();
    intakes.sort();

    let mut outcomes = Vec::new();
    for path in intakes {
        let outcome = triage_intake(ops, knowledge, registry, repos_root, &path, config)?;
        outcomes.push((path, outcome));
    }
    Ok(outcomes)
}
