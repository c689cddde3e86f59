//! On-disk layout: the OPS root, the Knowledge root, and project config.
//!
//! Lane A owns every write under `<ops>/ai/lane_a/**` and (through the bundle
//! and knowledge writers) `<knowledge_root>`; Lane B's writers own
//! `<ops>/ai/lane_b/**`. Components never hold references across that
//! boundary; cross-lane coupling is by reading files.

use crate::core::error::LanekeeperError;
use crate::core::fsio;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Environment variable naming the OPS root (absolute, ending in `/ops`).
pub const PROJECT_ROOT_ENV: &str = "AI_PROJECT_ROOT";

/// Project-level configuration from `<ops>/config/PROJECT.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectConfig {
    #[serde(default = "default_version")]
    pub version: u32,
    pub project_code: String,
    /// Root containing the portfolio's working clones. Relative paths
    /// resolve against the OPS root's parent.
    pub repos_root: String,
    /// Root of the System-of-Record. Same resolution rule as `repos_root`.
    pub knowledge_root: String,
}

fn default_version() -> u32 {
    1
}

/// Resolved OPS root with accessors for every lane directory.
#[derive(Debug, Clone)]
pub struct OpsPaths {
    pub ops_root: PathBuf,
}

impl OpsPaths {
    pub fn new(ops_root: &Path) -> Result<OpsPaths, LanekeeperError> {
        if !ops_root.is_absolute() {
            return Err(LanekeeperError::PathError(format!(
                "OPS root must be absolute: {}",
                ops_root.display()
            )));
        }
        if ops_root.file_name().and_then(|n| n.to_str()) != Some("ops") {
            return Err(LanekeeperError::PathError(format!(
                "OPS root must end in /ops (not /ops/ai): {}",
                ops_root.display()
            )));
        }
        Ok(OpsPaths {
            ops_root: ops_root.to_path_buf(),
        })
    }

    pub fn from_env() -> Result<OpsPaths, LanekeeperError> {
        let raw = std::env::var(PROJECT_ROOT_ENV).map_err(|_| {
            LanekeeperError::MissingInput(format!(
                "{} is not set; export it as the absolute path to the project's ops directory",
                PROJECT_ROOT_ENV
            ))
        })?;
        Self::new(Path::new(&raw))
    }

    /// Parent of the OPS root; relative config paths resolve against this.
    pub fn project_root(&self) -> PathBuf {
        self.ops_root
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.ops_root.clone())
    }

    pub fn resolve(&self, configured: &str) -> PathBuf {
        let p = Path::new(configured);
        if p.is_absolute() {
            p.to_path_buf()
        } else {
            self.project_root().join(p)
        }
    }

    pub fn config_dir(&self) -> PathBuf {
        self.ops_root.join("config")
    }

    pub fn project_config_path(&self) -> PathBuf {
        self.config_dir().join("PROJECT.json")
    }

    pub fn repos_config_path(&self) -> PathBuf {
        self.config_dir().join("REPOS.json")
    }

    pub fn load_project_config(&self) -> Result<ProjectConfig, LanekeeperError> {
        let path = self.project_config_path();
        if !path.exists() {
            return Err(LanekeeperError::MissingInput(format!(
                "project config not found at {}",
                path.display()
            )));
        }
        fsio::load_json(&path)
    }

    // ---- Lane A ----

    pub fn lane_a(&self) -> PathBuf {
        self.ops_root.join("ai").join("lane_a")
    }

    pub fn lane_a_locks(&self) -> PathBuf {
        self.lane_a().join("locks")
    }

    pub fn orchestrate_lock_path(&self) -> PathBuf {
        self.lane_a_locks().join("lane-a-orchestrate.lock.json")
    }

    pub fn lane_a_blockers(&self) -> PathBuf {
        self.lane_a().join("blockers")
    }

    pub fn lane_a_refresh_hints(&self) -> PathBuf {
        self.lane_a().join("refresh_hints")
    }

    pub fn lane_a_decision_packets(&self) -> PathBuf {
        self.lane_a().join("decision_packets")
    }

    pub fn lane_a_sufficiency(&self) -> PathBuf {
        self.lane_a().join("sufficiency")
    }

    pub fn lane_a_intake_approvals_processed(&self) -> PathBuf {
        self.lane_a().join("intake_approvals").join("processed")
    }

    pub fn lane_a_events_segments(&self) -> PathBuf {
        self.lane_a().join("events").join("segments")
    }

    pub fn lane_a_events_checkpoints(&self) -> PathBuf {
        self.lane_a().join("events").join("checkpoints")
    }

    pub fn lane_a_events_summary(&self) -> PathBuf {
        self.lane_a()
            .join("events")
            .join("summary")
            .join("events-summary.json")
    }

    pub fn lane_a_bundles(&self) -> PathBuf {
        self.lane_a().join("bundles")
    }

    pub fn lane_a_bundles_latest(&self) -> PathBuf {
        self.lane_a_bundles().join("LATEST.json")
    }

    pub fn lane_a_ledger(&self) -> PathBuf {
        self.lane_a().join("ledger.jsonl")
    }

    pub fn knowledge_version_path(&self) -> PathBuf {
        self.lane_a().join("knowledge_version.json")
    }

    pub fn staleness_path(&self) -> PathBuf {
        self.lane_a().join("staleness.json")
    }

    // ---- Lane B ----

    pub fn lane_b(&self) -> PathBuf {
        self.ops_root.join("ai").join("lane_b")
    }

    pub fn lane_b_inbox(&self) -> PathBuf {
        self.lane_b().join("inbox")
    }

    pub fn lane_b_inbox_processed(&self) -> PathBuf {
        self.lane_b_inbox().join(".processed")
    }

    pub fn lane_b_inbox_triaged(&self) -> PathBuf {
        self.lane_b_inbox().join("triaged")
    }

    pub fn lane_b_triage(&self) -> PathBuf {
        self.lane_b().join("triage")
    }

    pub fn lane_b_ledger(&self) -> PathBuf {
        self.lane_b().join("ledger.jsonl")
    }
}

/// Resolved Knowledge root with accessors for the SSOT layout.
#[derive(Debug, Clone)]
pub struct KnowledgePaths {
    pub root: PathBuf,
}

impl KnowledgePaths {
    pub fn new(root: PathBuf) -> KnowledgePaths {
        KnowledgePaths { root }
    }

    pub fn from_config(ops: &OpsPaths, cfg: &ProjectConfig) -> KnowledgePaths {
        KnowledgePaths::new(ops.resolve(&cfg.knowledge_root))
    }

    pub fn ssot_system(&self) -> PathBuf {
        self.root.join("ssot").join("system")
    }

    pub fn ssot_repo(&self, repo_id: &str) -> PathBuf {
        self.root.join("ssot").join("repos").join(repo_id)
    }

    pub fn views(&self) -> PathBuf {
        self.root.join("views")
    }

    pub fn views_system(&self) -> PathBuf {
        self.views().join("system")
    }

    pub fn views_teams(&self) -> PathBuf {
        self.views().join("teams")
    }

    pub fn views_repo(&self, repo_id: &str) -> PathBuf {
        self.views().join("repos").join(repo_id)
    }

    pub fn integration_map_path(&self) -> PathBuf {
        self.views().join("integration_map.json")
    }

    pub fn evidence_dir(&self) -> PathBuf {
        self.root.join("evidence")
    }

    pub fn evidence_repo_dir(&self, repo_id: &str) -> PathBuf {
        self.evidence_dir().join("repos").join(repo_id)
    }

    pub fn evidence_index_repo_dir(&self, repo_id: &str) -> PathBuf {
        self.evidence_dir()
            .join("index")
            .join("repos")
            .join(repo_id)
    }

    pub fn repo_index_path(&self, repo_id: &str) -> PathBuf {
        self.evidence_index_repo_dir(repo_id).join("repo_index.json")
    }

    pub fn repo_fingerprints_path(&self, repo_id: &str) -> PathBuf {
        self.evidence_index_repo_dir(repo_id)
            .join("repo_fingerprints.json")
    }

    pub fn scan_path(&self, repo_id: &str) -> PathBuf {
        self.evidence_repo_dir(repo_id).join("scan.json")
    }

    pub fn evidence_refs_path(&self, repo_id: &str) -> PathBuf {
        self.evidence_repo_dir(repo_id).join("evidence_refs.jsonl")
    }

    pub fn scan_report_path(&self, repo_id: &str) -> PathBuf {
        self.evidence_repo_dir(repo_id).join("SCAN_REPORT.md")
    }

    pub fn integration_path(&self) -> PathBuf {
        self.ssot_system().join("integration.json")
    }

    pub fn gaps_path(&self) -> PathBuf {
        self.ssot_system().join("gaps.json")
    }

    pub fn integration_md_path(&self) -> PathBuf {
        self.views_system().join("integration.md")
    }

    pub fn dependency_graph_path(&self) -> PathBuf {
        self.views_system().join("dependency_graph.json")
    }

    pub fn dependency_graph_override_path(&self) -> PathBuf {
        self.views_system().join("dependency_graph.override.json")
    }

    pub fn events_summary_path(&self) -> PathBuf {
        self.root.join("events_summary.json")
    }

    pub fn qa_dir(&self) -> PathBuf {
        self.root.join("qa")
    }

    pub fn version_mirror_json(&self) -> PathBuf {
        self.root.join("VERSION.json")
    }

    pub fn version_mirror_md(&self) -> PathBuf {
        self.root.join("VERSION.md")
    }
}

/// Scope directory component: `system` or `repo/<id>`.
pub fn scope_dir(scope: &str) -> String {
    match scope.strip_prefix("repo:") {
        Some(id) => format!("repo/{}", id),
        None => scope.to_string(),
    }
}

/// Filesystem-safe scope for filenames: `repo:a` becomes `repo-a`.
pub fn scope_file_component(scope: &str) -> String {
    scope.replace(':', "-")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ops_root_must_end_in_ops() {
        assert!(OpsPaths::new(Path::new("/proj/ops")).is_ok());
        assert!(OpsPaths::new(Path::new("/proj/ops/ai")).is_err());
        assert!(OpsPaths::new(Path::new("relative/ops")).is_err());
    }

    #[test]
    fn test_relative_config_paths_resolve_against_project_root() {
        let ops = OpsPaths::new(Path::new("/proj/ops")).unwrap();
        assert_eq!(ops.resolve("repos"), PathBuf::from("/proj/repos"));
        assert_eq!(ops.resolve("/abs/repos"), PathBuf::from("/abs/repos"));
    }

    #[test]
    fn test_lane_layout() {
        let ops = OpsPaths::new(Path::new("/proj/ops")).unwrap();
        assert_eq!(
            ops.orchestrate_lock_path(),
            PathBuf::from("/proj/ops/ai/lane_a/locks/lane-a-orchestrate.lock.json")
        );
        assert_eq!(
            ops.lane_b_ledger(),
            PathBuf::from("/proj/ops/ai/lane_b/ledger.jsonl")
        );
    }

    #[test]
    fn test_scope_dir_mapping() {
        assert_eq!(scope_dir("system"), "system");
        assert_eq!(scope_dir("repo:billing-svc"), "repo/billing-svc");
        assert_eq!(scope_file_component("repo:billing-svc"), "repo-billing-svc");
    }
}
