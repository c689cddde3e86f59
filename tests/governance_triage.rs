//! Lane B triage against the Lane A governance gate: failures leave
//! artifacts and ledger lines with precise reason codes; passes narrow the
//! item set to the governed scope.

use lanekeeper::core::fsio;
use lanekeeper::core::layout::{KnowledgePaths, OpsPaths};
use lanekeeper::delivery::gate::IntakeApproval;
use lanekeeper::delivery::triage::{self, TriageOutcome};
use lanekeeper::knowledge::graph;
use lanekeeper::knowledge::indexer;
use lanekeeper::knowledge::registry::{Repo, RepoRegistry, RepoStatus};
use lanekeeper::knowledge::scan;
use lanekeeper::knowledge::staleness::StalenessConfig;
use lanekeeper::knowledge::sufficiency;
use lanekeeper::knowledge::version;
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::tempdir;

fn sh_git(dir: &Path, args: &[&str]) {
    let status = Command::new("git")
        .args(args)
        .current_dir(dir)
        .status()
        .expect("git");
    assert!(status.success());
}

struct Fixture {
    _tmp: tempfile::TempDir,
    ops: OpsPaths,
    knowledge: KnowledgePaths,
    repos_root: PathBuf,
    registry: RepoRegistry,
}

fn fixture_with_repo(repo_id: &str) -> Fixture {
    let tmp = tempdir().expect("tempdir");
    let ops = OpsPaths::new(&tmp.path().join("ops")).unwrap();
    let knowledge = KnowledgePaths::new(tmp.path().join("knowledge"));
    let repos_root = tmp.path().join("repos");

    let repo_abs = repos_root.join(repo_id);
    fs::create_dir_all(&repo_abs).unwrap();
    sh_git(&repo_abs, &["init", "-q", "-b", "main"]);
    sh_git(&repo_abs, &["config", "user.email", "t@example.com"]);
    sh_git(&repo_abs, &["config", "user.name", "t"]);
    fs::write(repo_abs.join("package.json"), "{\"name\":\"x\"}\n").unwrap();
    sh_git(&repo_abs, &["add", "."]);
    sh_git(&repo_abs, &["commit", "-q", "-m", "fixture"]);

    let registry = RepoRegistry {
        version: 1,
        repos: vec![Repo {
            repo_id: repo_id.to_string(),
            path: repo_id.to_string(),
            active_branch: "main".to_string(),
            team_id: "core".to_string(),
            status: RepoStatus::Active,
            keywords: vec![],
        }],
    };

    Fixture {
        _tmp: tmp,
        ops,
        knowledge,
        repos_root,
        registry,
    }
}

fn write_ia(ops: &OpsPaths, id: &str, scope: &str, knowledge_version: &str) {
    let ia = IntakeApproval {
        id: id.to_string(),
        scope: scope.to_string(),
        knowledge_version: knowledge_version.to_string(),
        sufficiency_override: false,
        approved_by: "operator".to_string(),
        approved_at: "2026-02-01T00:00:00Z".to_string(),
    };
    fsio::write_json_atomic(
        &ops
            .lane_a_intake_approvals_processed()
            .join(format!("{}.json", id)),
        &ia,
    )
    .unwrap();
}

fn write_intake(dir: &Path, name: &str, text: &str) -> PathBuf {
    fs::create_dir_all(dir).unwrap();
    let path = dir.join(name);
    fs::write(&path, text).unwrap();
    path
}

#[test]
fn version_mismatch_fails_triage_with_artifacts_and_no_items() {
    let fx = fixture_with_repo("x");
    write_ia(&fx.ops, "IA-1", "repo:x", "v1.1");

    let intake = write_intake(
        &fx.ops.lane_b_inbox(),
        "intake-001.md",
        "origin: lane_a\nscope: repo:x\nintake_approval_id: IA-1\nknowledge_version: v1.2\n\nFix rounding\n",
    );

    let outcome = triage::triage_intake(
        &fx.ops,
        &fx.knowledge,
        &fx.registry,
        &fx.repos_root,
        &intake,
        &StalenessConfig::default(),
    )
    .unwrap();

    match outcome {
        TriageOutcome::Failed { reason_code, .. } => {
            assert_eq!(reason_code, "knowledge_version_mismatch");
        }
        TriageOutcome::Triaged { .. } => panic!("triage must fail"),
    }

    // No triaged items.
    let triaged_dir = fx.ops.lane_b_inbox_triaged();
    assert!(
        !triaged_dir.exists() || fs::read_dir(&triaged_dir).unwrap().next().is_none()
    );

    // Failure artifacts on disk.
    let triage_files: Vec<String> = fs::read_dir(fx.ops.lane_b_triage())
        .unwrap()
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().to_string())
        .collect();
    assert!(triage_files.iter().any(|n| n.starts_with("TRIAGE_FAILED-") && n.ends_with(".json")));
    assert!(triage_files.iter().any(|n| n.starts_with("TRIAGE_FAILED-") && n.ends_with(".md")));

    // Ledger line with the reason code.
    let ledger = fs::read_to_string(fx.ops.lane_b_ledger()).unwrap();
    let line: Value = serde_json::from_str(ledger.lines().next().unwrap()).unwrap();
    assert_eq!(line["action"], "triage_failed");
    assert_eq!(line["reason_code"], "knowledge_version_mismatch");
}

#[test]
fn governed_intake_passes_and_narrows_to_scoped_repo() {
    let fx = fixture_with_repo("x");

    // Bring knowledge to a governed state: index, approve graph, scan,
    // set the pointer, record sufficiency for the repo scope.
    let repo = fx.registry.require_active("x").unwrap();
    let repo_abs = repo.abs_path(&fx.repos_root);
    indexer::index_repo(repo, &repo_abs, &fx.knowledge, &["x".to_string()]).unwrap();
    graph::approve(&fx.knowledge, "operator").unwrap();
    scan::scan_repo(&fx.knowledge, repo, &repo_abs).unwrap();
    version::set_explicit(&fx.ops, &fx.knowledge, "v1.2", "pin for test", "system").unwrap();
    sufficiency::approve(&fx.ops, "repo:x", "v1.2", "operator").unwrap();
    write_ia(&fx.ops, "IA-2", "repo:x", "v1.2");

    let intake = write_intake(
        &fx.ops.lane_b_inbox(),
        "intake-002.md",
        "origin: lane_a\nscope: repo:x\nintake_approval_id: IA-2\nknowledge_version: v1.2\n\nShip the fix\n",
    );

    let outcome = triage::triage_intake(
        &fx.ops,
        &fx.knowledge,
        &fx.registry,
        &fx.repos_root,
        &intake,
        &StalenessConfig::default(),
    )
    .unwrap();

    let items = match outcome {
        TriageOutcome::Triaged { items } => items,
        TriageOutcome::Failed { reason_code, detail } => {
            panic!("triage failed: {} {}", reason_code, detail)
        }
    };
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].repo_id, "x");
    assert_eq!(items[0].scope, "repo:x");
    assert_eq!(items[0].origin, "lane_a");
    assert!(items[0].work_id.starts_with("WI-"));

    // Item file written, intake consumed into .processed.
    assert!(fx.ops.lane_b_inbox_triaged().join("intake-002__x.json").exists());
    assert!(fx.ops.lane_b_inbox_processed().join("intake-002.md").exists());
    assert!(!intake.exists());

    let ledger = fs::read_to_string(fx.ops.lane_b_ledger()).unwrap();
    assert!(ledger.contains("triage_ok"));
}

#[test]
fn missing_ia_file_is_governance_violation() {
    let fx = fixture_with_repo("x");
    let intake = write_intake(
        &fx.ops.lane_b_inbox(),
        "intake-003.md",
        "origin: lane_a\nscope: repo:x\nintake_approval_id: IA-GONE\nknowledge_version: v0\n\nbody\n",
    );
    let outcome = triage::triage_intake(
        &fx.ops,
        &fx.knowledge,
        &fx.registry,
        &fx.repos_root,
        &intake,
        &StalenessConfig::default(),
    )
    .unwrap();
    match outcome {
        TriageOutcome::Failed { reason_code, .. } => {
            assert_eq!(reason_code, "lane_a_governance_violation");
        }
        TriageOutcome::Triaged { .. } => panic!("must fail"),
    }
}

#[test]
fn stale_scope_fails_gate_with_knowledge_stale() {
    let fx = fixture_with_repo("x");
    // Never scanned: the scope is stale by definition.
    write_ia(&fx.ops, "IA-4", "repo:x", "v0");
    let intake = write_intake(
        &fx.ops.lane_b_inbox(),
        "intake-004.md",
        "origin: lane_a\nscope: repo:x\nintake_approval_id: IA-4\nknowledge_version: v0\n\nbody\n",
    );
    let outcome = triage::triage_intake(
        &fx.ops,
        &fx.knowledge,
        &fx.registry,
        &fx.repos_root,
        &intake,
        &StalenessConfig::default(),
    )
    .unwrap();
    match outcome {
        TriageOutcome::Failed { reason_code, .. } => {
            assert_eq!(reason_code, "knowledge_stale");
        }
        TriageOutcome::Triaged { .. } => panic!("must fail"),
    }
}

#[test]
fn non_governed_intake_fans_out_without_gate() {
    let fx = fixture_with_repo("x");
    let intake = write_intake(
        &fx.ops.lane_b_inbox(),
        "intake-005.md",
        "origin: human\n\nPlease fix something\n",
    );
    let outcome = triage::triage_intake(
        &fx.ops,
        &fx.knowledge,
        &fx.registry,
        &fx.repos_root,
        &intake,
        &StalenessConfig::default(),
    )
    .unwrap();
    let items = match outcome {
        TriageOutcome::Triaged { items } => items,
        TriageOutcome::Failed { reason_code, detail } => {
            panic!("must pass: {} {}", reason_code, detail)
        }
    };
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].origin, "human");
}
