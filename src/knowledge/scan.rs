//! Knowledge Scan: evidence-bounded facts per repo.
//!
//! A scan validates the index against the working ref (any fingerprint
//! mismatch is fatal, since stale byte ranges must never be evidenced), builds
//! evidence refs over the collected paths, derives facts by pattern rules,
//! and emits `scan.json`, `evidence_refs.jsonl`, and `SCAN_REPORT.md`
//! atomically. Repos scan in parallel under the bounded pool; one repo's
//! failure never interrupts the others.

use crate::core::error::LanekeeperError;
use crate::core::fsio;
use crate::core::git;
use crate::core::layout::{KnowledgePaths, OpsPaths};
use crate::core::lock::{FileLock, ORCHESTRATE_STALE_MS};
use crate::core::pool;
use crate::core::time;
use crate::knowledge::evidence::{self, EvidenceRef, Fact};
use crate::knowledge::graph;
use crate::knowledge::indexer::{self, FileCategory, RepoIndex};
use crate::knowledge::registry::{Repo, RepoRegistry};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExternalKnowledge {
    pub project_code: String,
    pub repo_id: String,
    pub bundle_id: String,
    pub path: String,
    pub loaded_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Coverage {
    pub files_seen: usize,
    pub files_indexed: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnowledgeScan {
    pub version: u32,
    pub repo_id: String,
    pub scanned_at: String,
    pub scan_version: u64,
    pub head_sha: String,
    pub git_ref: String,
    #[serde(default)]
    pub external_knowledge: Vec<ExternalKnowledge>,
    pub facts: Vec<Fact>,
    #[serde(default)]
    pub unknowns: Vec<String>,
    #[serde(default)]
    pub contradictions: Vec<String>,
    pub coverage: Coverage,
}

/// Deterministic positive integer over `(repo_id, index version, sorted
/// evidence ids)`. An empty evidence set yields `1`.
pub fn derive_scan_version(repo_id: &str, index_version: u64, evidence_ids: &[String]) -> u64 {
    if evidence_ids.is_empty() {
        return 1;
    }
    let mut sorted = evidence_ids.to_vec();
    sorted.sort();
    let mut hasher = Sha256::new();
    hasher.update(repo_id.as_bytes());
    hasher.update(b"\n");
    hasher.update(index_version.to_string().as_bytes());
    for id in &sorted {
        hasher.update(b"\n");
        hasher.update(id.as_bytes());
    }
    let digest = hasher.finalize();
    let n = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]) & 0x7fff_ffff;
    u64::from(n).max(1)
}

/// Options for a scan run.
#[derive(Debug)]
pub struct ScanOptions {
    /// Restrict the run to exactly one repo.
    pub repo_id: Option<String>,
    pub jobs: usize,
    /// Bypass the dependency-graph approval gate.
    pub force_deps: bool,
}

impl Default for ScanOptions {
    fn default() -> Self {
        ScanOptions {
            repo_id: None,
            jobs: pool::DEFAULT_JOBS,
            force_deps: false,
        }
    }
}

#[derive(Debug)]
pub struct RepoScanReport {
    pub repo_id: String,
    pub result: Result<KnowledgeScan, LanekeeperError>,
}

/// Scan the portfolio (or one repo). Holds the Lane A orchestrate lock for
/// the duration since every output lands in the knowledge root.
pub fn run_knowledge_scan(
    ops: &OpsPaths,
    knowledge: &KnowledgePaths,
    registry: &RepoRegistry,
    repos_root: &Path,
    opts: &ScanOptions,
    cancel: &AtomicBool,
) -> Result<Vec<RepoScanReport>, LanekeeperError> {
    graph::ensure_approved(ops, knowledge, opts.force_deps)?;

    let targets: Vec<&Repo> = match &opts.repo_id {
        Some(id) => vec![registry.require_active(id)?],
        None => registry.active_repos(),
    };

    let lock = FileLock::acquire(
        &ops.orchestrate_lock_path(),
        ORCHESTRATE_STALE_MS,
        Some(json!({"operation": "knowledge_scan"})),
    )?;

    let results = pool::run_pool(&targets, opts.jobs, cancel, |repo, _| RepoScanReport {
        repo_id: repo.repo_id.clone(),
        result: scan_repo(knowledge, repo, &repo.abs_path(repos_root)),
    });

    lock.release()?;

    Ok(results
        .into_iter()
        .zip(targets)
        .map(|(slot, repo)| {
            slot.unwrap_or_else(|| RepoScanReport {
                repo_id: repo.repo_id.clone(),
                result: Err(LanekeeperError::Timeout(
                    "scan cancelled before this repo was reached".to_string(),
                )),
            })
        })
        .collect())
}

/// Scan one repo. The caller must have run the indexer first.
pub fn scan_repo(
    knowledge: &KnowledgePaths,
    repo: &Repo,
    repo_abs: &Path,
) -> Result<KnowledgeScan, LanekeeperError> {
    let (index, fingerprints) = indexer::load_index_artifacts(knowledge, &repo.repo_id)?;

    let reference = indexer::resolve_index_ref(repo_abs, &repo.active_branch)?;
    let head_sha = git::rev_list_one(repo_abs, &reference)?;

    // Freshness check: any drift between stored fingerprints and the bytes
    // at the working ref means the index must be rebuilt before evidencing.
    for entry in &fingerprints.files {
        let bytes = git::show_file_at_ref(repo_abs, &reference, &entry.path).map_err(|e| {
            LanekeeperError::IndexOutOfDate(format!(
                "{}: fingerprinted path '{}' unreadable at {}: {}",
                repo.repo_id, entry.path, reference, e
            ))
        })?;
        let current = indexer::sha256_hex(&bytes);
        if current != entry.sha256 {
            return Err(LanekeeperError::IndexOutOfDate(format!(
                "{}: fingerprint mismatch for '{}' at {}; re-run `lanekeeper index --repo-id {}`",
                repo.repo_id, entry.path, reference, repo.repo_id
            )));
        }
    }

    let paths = evidence::collect_evidence_file_paths(&index, &fingerprints)?;
    let refs = evidence::build_evidence_refs(repo_abs, &repo.repo_id, &head_sha, &paths)?;

    let facts = derive_facts(&index, &refs);
    evidence::check_fact_closure(&facts, &refs)?;

    let unknowns = detect_unknowns(&repo.repo_id, &facts, &refs);
    let contradictions = detect_contradictions(&facts);

    let evidence_ids: Vec<String> = refs.iter().map(|r| r.evidence_id.clone()).collect();
    let scan_version = derive_scan_version(&repo.repo_id, index.version, &evidence_ids);

    let files_seen = git::ls_tree_names(repo_abs, &reference)?.len();
    let external_knowledge = load_external_knowledge(&index)?;

    let scan = KnowledgeScan {
        version: 1,
        repo_id: repo.repo_id.clone(),
        scanned_at: time::now_rfc3339(),
        scan_version,
        head_sha,
        git_ref: reference,
        external_knowledge,
        facts,
        unknowns,
        contradictions,
        coverage: Coverage {
            files_seen,
            files_indexed: fingerprints.files.len(),
        },
    };

    fsio::write_json_atomic(&knowledge.scan_path(&repo.repo_id), &scan)?;
    evidence::write_refs_jsonl(&knowledge.evidence_refs_path(&repo.repo_id), &refs)?;
    fsio::write_atomic(
        &knowledge.scan_report_path(&repo.repo_id),
        render_scan_report(&scan).as_bytes(),
    )?;

    Ok(scan)
}

/// Derive facts from the index by pattern rules. Every fact cites evidence
/// ids drawn from the sibling ref set.
fn derive_facts(index: &RepoIndex, refs: &[EvidenceRef]) -> Vec<Fact> {
    let by_path: FxHashMap<&str, &str> = refs
        .iter()
        .map(|r| (r.file_path.as_str(), r.evidence_id.as_str()))
        .collect();
    let mut facts: Vec<Fact> = Vec::new();
    let mut seen_ids: rustc_hash::FxHashSet<String> = rustc_hash::FxHashSet::default();

    let mut push = |prefix: &str, claim: String, ids: Vec<String>| {
        if ids.is_empty() {
            return;
        }
        let id_refs: Vec<&str> = ids.iter().map(String::as_str).collect();
        let mut parts = vec![claim.as_str()];
        parts.extend(id_refs);
        let fact_id = evidence::fact_id(prefix, &parts);
        if seen_ids.insert(fact_id.clone()) {
            facts.push(Fact {
                fact_id,
                claim,
                evidence_ids: ids,
            });
        }
    };

    let single = |path: &str| -> Vec<String> {
        by_path
            .get(path)
            .map(|id| vec![(*id).to_string()])
            .unwrap_or_default()
    };

    for p in &index.entrypoints {
        push("entrypoint", format!("Entrypoint: {}", p), single(p));
    }
    for p in &index.api_surface.openapi_files {
        push("api_contract", format!("API contract file: {}", p), single(p));
    }
    for p in index.api_surface.routes_controllers.iter().take(50) {
        push("route", format!("Route/controller file: {}", p), single(p));
    }
    for p in index.api_surface.events_topics.iter().take(50) {
        push("event_topic", format!("Event/topic file: {}", p), single(p));
    }
    for p in index.migrations_schema.iter().take(50) {
        push("migration", format!("Migration path: {}", p), single(p));
    }

    let build_evidence: Vec<String> = index
        .build_commands
        .evidence_files
        .iter()
        .filter_map(|p| by_path.get(p.as_str()).map(|id| (*id).to_string()))
        .collect();
    for (kind, cmds) in [
        ("install", &index.build_commands.install),
        ("lint", &index.build_commands.lint),
        ("build", &index.build_commands.build),
        ("test", &index.build_commands.test),
    ] {
        for cmd in cmds {
            push(
                "build_command",
                format!("Build command ({}): {}", kind, cmd),
                build_evidence.clone(),
            );
        }
    }

    for dep in &index.cross_repo_dependencies {
        // Only evidence paths that really resolved may back the claim.
        let ids: Vec<String> = dep
            .evidence_refs
            .iter()
            .filter_map(|p| by_path.get(p.as_str()).map(|id| (*id).to_string()))
            .collect();
        push(
            "cross_repo",
            format!("Cross-repo dependency ({}): {}", dep.dep_type, dep.target),
            ids,
        );
    }

    for h in &index.hotspots {
        push(
            "hotspot",
            format!("Hotspot: {} ({})", h.file_path, h.reason),
            single(&h.file_path),
        );
    }

    for path in index.fingerprints.keys() {
        let (prefix, label) = match indexer::classify_path(path) {
            FileCategory::Manifest => ("fingerprint_manifest", "Manifest file"),
            FileCategory::Lockfile => ("fingerprint_lockfile", "Lockfile"),
            FileCategory::Contract => ("api_contract", "API contract file"),
            FileCategory::Infra => ("fingerprint_infra", "Infra file"),
            FileCategory::Migration => ("migration", "Migration path"),
            FileCategory::Other => continue,
        };
        push(prefix, format!("{}: {}", label, path), single(path));
    }

    facts
}

fn detect_unknowns(repo_id: &str, facts: &[Fact], refs: &[EvidenceRef]) -> Vec<String> {
    let mut unknowns = Vec::new();
    let has_contract = facts.iter().any(|f| f.claim.starts_with("API contract file: "));
    if !has_contract && !facts.is_empty() {
        let first_evidence = refs
            .first()
            .map(|r| r.evidence_id.clone())
            .unwrap_or_default();
        unknowns.push(format!(
            "No API contract file detected for repo '{}'; its API surface is unverified (see {})",
            repo_id, first_evidence
        ));
    }
    unknowns
}

/// Trivial contradiction: the same claim text backed by disjoint evidence.
fn detect_contradictions(facts: &[Fact]) -> Vec<String> {
    let mut by_claim: FxHashMap<&str, &Fact> = FxHashMap::default();
    let mut out = Vec::new();
    for fact in facts {
        if let Some(prev) = by_claim.get(fact.claim.as_str()) {
            let overlaps = prev
                .evidence_ids
                .iter()
                .any(|id| fact.evidence_ids.contains(id));
            if !overlaps {
                out.push(format!(
                    "claim '{}' is asserted by {} and {} with disjoint evidence",
                    fact.claim, prev.fact_id, fact.fact_id
                ));
            }
        } else {
            by_claim.insert(fact.claim.as_str(), fact);
        }
    }
    out
}

/// Cross-project loads: every declared dependency must expose a readable
/// bundle summary under its knowledge root.
fn load_external_knowledge(index: &RepoIndex) -> Result<Vec<ExternalKnowledge>, LanekeeperError> {
    let mut out = Vec::new();
    for dep in &index.dependencies.depends_on {
        let root = PathBuf::from(&dep.knowledge_abs_path);
        let expected = [
            root.join("evidence")
                .join("repos")
                .join(&dep.repo_id)
                .join("scan.json"),
            root.join("evidence")
                .join("repos")
                .join(&dep.repo_id)
                .join("evidence_refs.jsonl"),
            root.join("evidence")
                .join("index")
                .join("repos")
                .join(&dep.repo_id)
                .join("repo_index.json"),
            root.join("evidence")
                .join("index")
                .join("repos")
                .join(&dep.repo_id)
                .join("repo_fingerprints.json"),
        ];
        let missing: Vec<String> = expected
            .iter()
            .filter(|p| !p.exists())
            .map(|p| p.display().to_string())
            .collect();
        if !missing.is_empty() {
            return Err(LanekeeperError::ExternalDependencyBundleMissing(format!(
                "project '{}' repo '{}' has no knowledge bundle (missing: {}); run \
                 `lanekeeper index --repo-id {}` and `lanekeeper scan --repo-id {}` in that project",
                dep.project_code,
                dep.repo_id,
                missing.join(", "),
                dep.repo_id,
                dep.repo_id
            )));
        }

        let mut hasher = Sha256::new();
        for path in &expected {
            hasher.update(std::fs::read(path)?);
        }
        out.push(ExternalKnowledge {
            project_code: dep.project_code.clone(),
            repo_id: dep.repo_id.clone(),
            bundle_id: format!("sha256-{:x}", hasher.finalize()),
            path: dep.knowledge_abs_path.clone(),
            loaded_at: time::now_rfc3339(),
        });
    }
    Ok(out)
}

fn render_scan_report(scan: &KnowledgeScan) -> String {
    let mut md = String::new();
    md.push_str(&format!("# Scan Report: {}\n\n", scan.repo_id));
    md.push_str(&format!("- Scanned: {}\n", scan.scanned_at));
    md.push_str(&format!("- Ref: {} @ {}\n", scan.git_ref, scan.head_sha));
    md.push_str(&format!("- Scan version: {}\n", scan.scan_version));
    md.push_str(&format!(
        "- Coverage: {} of {} files fingerprinted\n\n",
        scan.coverage.files_indexed, scan.coverage.files_seen
    ));

    md.push_str(&format!("## Facts ({})\n\n", scan.facts.len()));
    for fact in &scan.facts {
        md.push_str(&format!(
            "- `{}` {} [{}]\n",
            fact.fact_id,
            fact.claim,
            fact.evidence_ids.join(", ")
        ));
    }

    if !scan.unknowns.is_empty() {
        md.push_str(&format!("\n## Unknowns ({})\n\n", scan.unknowns.len()));
        for u in &scan.unknowns {
            md.push_str(&format!("- {}\n", u));
        }
    }
    if !scan.contradictions.is_empty() {
        md.push_str(&format!(
            "\n## Contradictions ({})\n\n",
            scan.contradictions.len()
        ));
        for c in &scan.contradictions {
            md.push_str(&format!("- {}\n", c));
        }
    }
    if !scan.external_knowledge.is_empty() {
        md.push_str("\n## External knowledge\n\n");
        for e in &scan.external_knowledge {
            md.push_str(&format!(
                "- {}/{}: {} ({})\n",
                e.project_code, e.repo_id, e.bundle_id, e.path
            ));
        }
    }
    md.push('\n');
    md
}

/// Load a persisted scan, erroring precisely when the scan has not run.
pub fn load_scan(
    knowledge: &KnowledgePaths,
    repo_id: &str,
) -> Result<KnowledgeScan, LanekeeperError> {
    let path = knowledge.scan_path(repo_id);
    if !path.exists() {
        return Err(LanekeeperError::MissingInput(format!(
            "no scan for repo '{}'; run `lanekeeper scan --repo-id {}` first",
            repo_id, repo_id
        )));
    }
    fsio::load_json(&path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::knowledge::indexer::{
        ApiSurface, BuildCommands, RepoDependencies, RepoIndex,
    };
    use std::collections::BTreeMap;

    fn sample_ref(path: &str) -> EvidenceRef {
        EvidenceRef {
            evidence_id: evidence::evidence_id("a", "deadbee", path, 1, 5),
            repo_id: "a".to_string(),
            file_path: path.to_string(),
            commit_sha: "deadbee".to_string(),
            start_line: 1,
            end_line: 5,
            extractor: "git_show_head_window".to_string(),
            captured_at: "2026-01-01T00:00:00Z".to_string(),
        }
    }

    fn sample_index(fingerprints: BTreeMap<String, String>) -> RepoIndex {
        RepoIndex {
            version: 1,
            repo_id: "a".to_string(),
            scanned_at: "2026-01-01T00:00:00Z".to_string(),
            git_ref: "main".to_string(),
            head_sha: "deadbee".to_string(),
            entrypoints: vec!["src/main.rs".to_string()],
            api_surface: ApiSurface::default(),
            migrations_schema: vec![],
            hotspots: vec![],
            build_commands: BuildCommands {
                build: vec!["cargo build".to_string()],
                evidence_files: vec!["Cargo.toml".to_string()],
                ..BuildCommands::default()
            },
            cross_repo_dependencies: vec![],
            dependencies: RepoDependencies::default(),
            fingerprints,
        }
    }

    #[test]
    fn test_scan_version_empty_evidence_is_one() {
        assert_eq!(derive_scan_version("a", 1, &[]), 1);
    }

    #[test]
    fn test_scan_version_deterministic_and_order_insensitive() {
        let ids_a = vec!["EVID_b".to_string(), "EVID_a".to_string()];
        let ids_b = vec!["EVID_a".to_string(), "EVID_b".to_string()];
        let v1 = derive_scan_version("a", 2, &ids_a);
        let v2 = derive_scan_version("a", 2, &ids_b);
        assert_eq!(v1, v2);
        assert!(v1 >= 1);
        assert_ne!(v1, derive_scan_version("a", 3, &ids_a));
    }

    #[test]
    fn test_derive_facts_closure_holds() {
        let fingerprints: BTreeMap<String, String> = [
            ("Cargo.toml".to_string(), "x".to_string()),
            ("Dockerfile".to_string(), "y".to_string()),
        ]
        .into();
        let index = sample_index(fingerprints);
        let refs = vec![
            sample_ref("Cargo.toml"),
            sample_ref("Dockerfile"),
            sample_ref("src/main.rs"),
        ];
        let facts = derive_facts(&index, &refs);
        assert!(evidence::check_fact_closure(&facts, &refs).is_ok());

        assert!(facts.iter().any(|f| f.claim == "Entrypoint: src/main.rs"));
        assert!(facts.iter().any(|f| f.claim == "Manifest file: Cargo.toml"));
        assert!(facts.iter().any(|f| f.claim == "Infra file: Dockerfile"));
        assert!(
            facts
                .iter()
                .any(|f| f.claim == "Build command (build): cargo build")
        );
    }

    #[test]
    fn test_no_contract_yields_exactly_one_unknown() {
        let fingerprints: BTreeMap<String, String> =
            [("Cargo.toml".to_string(), "x".to_string())].into();
        let index = sample_index(fingerprints);
        let refs = vec![sample_ref("Cargo.toml"), sample_ref("src/main.rs")];
        let facts = derive_facts(&index, &refs);
        let unknowns = detect_unknowns("a", &facts, &refs);
        assert_eq!(unknowns.len(), 1);
        assert!(unknowns[0].starts_with("No API contract file detected"));
        assert!(unknowns[0].contains(&refs[0].evidence_id));
    }

    #[test]
    fn test_contract_present_yields_no_unknown() {
        let fingerprints: BTreeMap<String, String> =
            [("api/openapi.yaml".to_string(), "x".to_string())].into();
        let index = sample_index(fingerprints);
        let refs = vec![sample_ref("api/openapi.yaml"), sample_ref("src/main.rs")];
        let facts = derive_facts(&index, &refs);
        assert!(detect_unknowns("a", &facts, &refs).is_empty());
    }

    #[test]
    fn test_detect_contradictions_on_disjoint_evidence() {
        let facts = vec![
            Fact {
                fact_id: "F_1".to_string(),
                claim: "Entrypoint: src/main.rs".to_string(),
                evidence_ids: vec!["EVID_a".to_string()],
            },
            Fact {
                fact_id: "F_2".to_string(),
                claim: "Entrypoint: src/main.rs".to_string(),
                evidence_ids: vec!["EVID_b".to_string()],
            },
        ];
        let out = detect_contradictions(&facts);
        assert_eq!(out.len(), 1);
        assert!(out[0].contains("F_1"));
    }
}
