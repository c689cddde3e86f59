//! Knowledge bundles: normalized, hash-addressed, manifest-sealed snapshots.
//!
//! A bundle's identity is the sha256 of its canonical manifest; rebuilding
//! over unchanged Knowledge must reproduce the identical `bundle_id`. All
//! volatile timestamps are normalized away before hashing, file order is
//! `logical_path` lexical, and every output path is confined to the bundles
//! root.

use crate::core::canonical;
use crate::core::error::LanekeeperError;
use crate::core::fsio;
use crate::core::git;
use crate::core::layout::{KnowledgePaths, OpsPaths, scope_dir};
use crate::core::lock::{FileLock, ORCHESTRATE_STALE_MS};
use crate::core::sandbox;
use crate::core::time;
use crate::knowledge::evidence;
use crate::knowledge::registry::RepoRegistry;
use crate::knowledge::staleness::{self, StaleOverride, StalenessConfig};
use crate::knowledge::version;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

/// Required system core set for repo-scope bundles.
const SYSTEM_CORE_FILES: [&str; 6] = [
    "PROJECT_SNAPSHOT.json",
    "minimum.json",
    "integration.json",
    "gaps.json",
    "assumptions.json",
    "milestones.json",
];

const TEXT_EXTENSIONS: [&str; 13] = [
    "md", "txt", "jsonl", "yml", "yaml", "graphql", "proto", "js", "ts", "tsx", "jsx", "css",
    "html",
];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestFile {
    pub logical_path: String,
    pub source_path: String,
    pub sha256: String,
    pub bytes: u64,
}

#[derive(Debug)]
pub struct BundleOutcome {
    pub bundle_id: String,
    pub manifest_sha256: String,
    pub dir: PathBuf,
    pub file_count: usize,
}

#[derive(Debug, Default)]
pub struct BundleOptions {
    /// Output base; must lie within `<lane_a>/bundles`. Defaults to it.
    pub out_base: Option<PathBuf>,
    pub stale_override: Option<StaleOverride>,
}

/// One file staged for inclusion: normalized content plus origin labels.
struct StagedFile {
    logical_path: String,
    source_path: String,
    content: Vec<u8>,
}

fn is_text_extension(path: &str) -> bool {
    path.rsplit('.')
        .next()
        .map(|ext| TEXT_EXTENSIONS.contains(&ext))
        .unwrap_or(false)
}

/// Normalize content per extension: `.json` goes through the canonicalizer,
/// text-ish files get CRLF to LF and a trailing newline, the rest pass through.
fn normalize_content(logical_path: &str, bytes: &[u8]) -> Result<Vec<u8>, LanekeeperError> {
    if logical_path.ends_with(".json") {
        let value: Value = serde_json::from_slice(bytes).map_err(|e| {
            LanekeeperError::Malformed(format!("bundle input {}: {}", logical_path, e))
        })?;
        return Ok(canonical::canonical_bytes(&value, logical_path));
    }
    if is_text_extension(logical_path) {
        let text = String::from_utf8_lossy(bytes).replace("\r\n", "\n");
        let mut out = text.into_bytes();
        if !out.ends_with(b"\n") {
            out.push(b'\n');
        }
        return Ok(out);
    }
    Ok(bytes.to_vec())
}

/// Recursively collect files under `dir`, logical paths relative to `root`.
fn collect_tree(
    root: &Path,
    dir: &Path,
    out: &mut Vec<(String, PathBuf)>,
) -> Result<(), LanekeeperError> {
    if !dir.exists() {
        return Ok(());
    }
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            collect_tree(root, &path, out)?;
        } else if path.is_file() {
            let rel = path
                .strip_prefix(root)
                .map_err(|_| {
                    LanekeeperError::PathError(format!(
                        "{} escapes knowledge root",
                        path.display()
                    ))
                })?
                .to_string_lossy()
                .replace('\\', "/");
            out.push((rel, path));
        }
    }
    Ok(())
}

fn stage_knowledge_file(
    logical_path: &str,
    abs: &Path,
) -> Result<StagedFile, LanekeeperError> {
    let bytes = fs::read(abs)?;
    Ok(StagedFile {
        logical_path: logical_path.to_string(),
        source_path: logical_path.to_string(),
        content: normalize_content(logical_path, &bytes)?,
    })
}

fn include_list(
    knowledge: &KnowledgePaths,
    scope: &str,
) -> Result<Vec<(String, PathBuf)>, LanekeeperError> {
    let root = &knowledge.root;
    let mut files: Vec<(String, PathBuf)> = Vec::new();
    match scope.strip_prefix("repo:") {
        None => {
            collect_tree(root, &knowledge.ssot_system(), &mut files)?;
            collect_tree(root, &knowledge.views_teams(), &mut files)?;
            collect_tree(root, &knowledge.views_system(), &mut files)?;
            let map = knowledge.integration_map_path();
            if map.exists() {
                files.push(("views/integration_map.json".to_string(), map));
            }
            collect_tree(root, &knowledge.evidence_dir(), &mut files)?;
        }
        Some(repo_id) => {
            for name in SYSTEM_CORE_FILES {
                let abs = knowledge.ssot_system().join(name);
                if !abs.exists() {
                    return Err(LanekeeperError::MissingInput(format!(
                        "repo-scope bundle requires ssot/system/{} (missing)",
                        name
                    )));
                }
                files.push((format!("ssot/system/{}", name), abs));
            }
            collect_tree(root, &knowledge.ssot_system().join("sections"), &mut files)?;
            collect_tree(root, &knowledge.ssot_repo(repo_id), &mut files)?;
            collect_tree(root, &knowledge.views_repo(repo_id), &mut files)?;
            collect_tree(root, &knowledge.evidence_index_repo_dir(repo_id), &mut files)?;
            collect_tree(root, &knowledge.evidence_repo_dir(repo_id), &mut files)?;
        }
    }
    files.sort_by(|a, b| a.0.cmp(&b.0));
    files.dedup_by(|a, b| a.0 == b.0);
    Ok(files)
}

/// Open decision packets whose recorded scope matches the bundle scope.
fn staged_decision_packets(
    ops: &OpsPaths,
    scope: &str,
) -> Result<Vec<StagedFile>, LanekeeperError> {
    let dir = ops.lane_a_decision_packets();
    let mut out = Vec::new();
    if !dir.exists() {
        return Ok(out);
    }
    let mut paths: Vec<PathBuf> = fs::read_dir(&dir)?
        .filter_map(|e| e.ok().map(|e| e.path()))
        .filter(|p| p.extension().and_then(|e| e.to_str()) == Some("json"))
        .collect();
    paths.sort();
    for path in paths {
        let packet: Value = match fsio::load_json(&path) {
            Ok(v) => v,
            Err(_) => continue,
        };
        let open = packet.get("status").and_then(Value::as_str) == Some("open");
        let matches = packet.get("scope").and_then(Value::as_str) == Some(scope);
        if !(open && matches) {
            continue;
        }
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let logical = format!("decision_packets/{}", name);
        let bytes = fs::read(&path)?;
        out.push(StagedFile {
            logical_path: logical.clone(),
            source_path: format!("lane_a/decision_packets/{}", name),
            content: normalize_content(&logical, &bytes)?,
        });
    }
    Ok(out)
}

/// Derived evidence-excerpt bundle for a repo scope.
fn build_evidence_bundle(
    knowledge: &KnowledgePaths,
    repo_id: &str,
    repo_abs: &Path,
) -> Result<StagedFile, LanekeeperError> {
    let refs_path = knowledge.evidence_refs_path(repo_id);
    if !refs_path.exists() {
        return Err(LanekeeperError::MissingInput(format!(
            "no evidence_refs.jsonl for repo '{}'; run `lanekeeper scan --repo-id {}` first",
            repo_id, repo_id
        )));
    }
    let refs = evidence::load_refs_jsonl(&refs_path)?;
    let mut excerpts = Vec::with_capacity(refs.len());
    for r in &refs {
        if r.repo_id != repo_id {
            return Err(LanekeeperError::ContractViolation(format!(
                "evidence ref {} belongs to repo '{}', not bundle scope '{}'",
                r.evidence_id, r.repo_id, repo_id
            )));
        }
        let bytes = git::show_file_at_ref(repo_abs, &r.commit_sha, &r.file_path).map_err(|e| {
            LanekeeperError::EvidenceMissing(format!(
                "{}@{}:{}: {}",
                repo_id, r.commit_sha, r.file_path, e
            ))
        })?;
        let text = String::from_utf8_lossy(&bytes);
        let slice: Vec<&str> = text
            .lines()
            .skip(r.start_line.saturating_sub(1))
            .take(r.end_line.saturating_sub(r.start_line) + 1)
            .collect();
        excerpts.push(json!({
            "evidence_id": r.evidence_id,
            "file_path": r.file_path,
            "commit_sha": r.commit_sha,
            "start_line": r.start_line,
            "end_line": r.end_line,
            "excerpt": format!("{}\n", slice.join("\n")),
        }));
    }
    let doc = json!({
        "version": 1,
        "repo_id": repo_id,
        "evidence": excerpts,
    });
    let logical = "bundle/evidence_bundle.json".to_string();
    Ok(StagedFile {
        content: canonical::canonical_bytes(&doc, &logical),
        logical_path: logical,
        source_path: "derived/evidence_bundle".to_string(),
    })
}

/// Build a bundle for `scope` and publish it under the bundles root.
pub fn build_bundle(
    ops: &OpsPaths,
    knowledge: &KnowledgePaths,
    registry: &RepoRegistry,
    repos_root: &Path,
    scope: &str,
    config: &StalenessConfig,
    opts: &BundleOptions,
) -> Result<BundleOutcome, LanekeeperError> {
    staleness::guard_scope(
        ops,
        knowledge,
        registry,
        repos_root,
        scope,
        config,
        "bundle",
        opts.stale_override.as_ref(),
    )?;

    let bundles_root = ops.lane_a_bundles();
    fs::create_dir_all(&bundles_root)?;
    let out_base = match &opts.out_base {
        Some(base) => sandbox::ensure_within(&bundles_root, base)?,
        None => bundles_root.clone(),
    };

    let lock = FileLock::acquire(
        &ops.orchestrate_lock_path(),
        ORCHESTRATE_STALE_MS,
        Some(json!({"operation": "bundle", "scope": scope})),
    )?;

    let mut staged: Vec<StagedFile> = Vec::new();
    for (logical, abs) in include_list(knowledge, scope)? {
        staged.push(stage_knowledge_file(&logical, &abs)?);
    }
    staged.extend(staged_decision_packets(ops, scope)?);

    if let Some(repo_id) = scope.strip_prefix("repo:") {
        let repo = registry.require_active(repo_id)?;
        staged.push(build_evidence_bundle(
            knowledge,
            repo_id,
            &repo.abs_path(repos_root),
        )?);
    }

    staged.sort_by(|a, b| a.logical_path.cmp(&b.logical_path));

    let records: Vec<ManifestFile> = staged
        .iter()
        .map(|f| {
            let mut hasher = Sha256::new();
            hasher.update(&f.content);
            ManifestFile {
                logical_path: f.logical_path.clone(),
                source_path: f.source_path.clone(),
                sha256: format!("{:x}", hasher.finalize()),
                bytes: f.content.len() as u64,
            }
        })
        .collect();

    let total_bytes: u64 = records.iter().map(|r| r.bytes).sum();
    let manifest = json!({
        "version": 1,
        "scope": scope,
        "generated_at": time::now_rfc3339(),
        "files": &records,
    });
    let manifest_bytes = canonical::canonical_bytes(&manifest, "manifest.json");
    let mut hasher = Sha256::new();
    hasher.update(&manifest_bytes);
    let manifest_sha = format!("{:x}", hasher.finalize());
    let bundle_id = format!("sha256-{}", manifest_sha);

    let scope_rel = scope_dir(scope);
    let bundle_dir = out_base.join(&scope_rel).join(&bundle_id);
    sandbox::ensure_within(&bundles_root, &bundle_dir)?;

    fsio::write_atomic(&bundle_dir.join("manifest.json"), &manifest_bytes)?;

    let knowledge_version = version::load(ops)?.current;
    let bundle_doc = json!({
        "version": 1,
        "bundle_id": bundle_id.as_str(),
        "scope": scope,
        "knowledge_version": knowledge_version.as_str(),
        "created_at": time::now_rfc3339(),
        "file_count": records.len(),
        "total_bytes": total_bytes,
        "manifest_sha256": manifest_sha.as_str(),
    });
    fsio::write_json_atomic(&bundle_dir.join("BUNDLE.json"), &bundle_doc)?;
    fsio::write_atomic(
        &bundle_dir.join("BUNDLE.md"),
        render_bundle_md(scope, &bundle_id, &knowledge_version, &records).as_bytes(),
    )?;

    for f in &staged {
        let target = bundle_dir.join("content").join(&f.logical_path);
        sandbox::ensure_within(&bundles_root, &target)?;
        fsio::write_atomic(&target, &f.content)?;
    }

    update_latest(&out_base, scope, &bundle_id, &manifest_sha, &scope_rel)?;

    lock.release()?;
    Ok(BundleOutcome {
        bundle_id,
        manifest_sha256: manifest_sha,
        dir: bundle_dir,
        file_count: records.len(),
    })
}

/// Read-modify-write of `LATEST.json`, serialized by the orchestrate lock
/// held by the caller.
fn update_latest(
    out_base: &Path,
    scope: &str,
    bundle_id: &str,
    manifest_sha: &str,
    scope_rel: &str,
) -> Result<(), LanekeeperError> {
    let latest_path = out_base.join("LATEST.json");
    let mut latest: BTreeMap<String, Value> = fsio::load_json_opt::<Value>(&latest_path)?
        .and_then(|v| {
            v.get("scopes")
                .and_then(Value::as_object)
                .map(|m| m.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
        })
        .unwrap_or_default();
    latest.insert(
        scope.to_string(),
        json!({
            "bundle_id": bundle_id,
            "manifest_sha256": manifest_sha,
            "path": format!("{}/{}", scope_rel, bundle_id),
        }),
    );
    fsio::write_json_atomic(
        &latest_path,
        &json!({
            "version": 1,
            "updated_at": time::now_rfc3339(),
            "scopes": latest,
        }),
    )
}

fn render_bundle_md(
    scope: &str,
    bundle_id: &str,
    knowledge_version: &str,
    records: &[ManifestFile],
) -> String {
    let mut md = String::new();
    md.push_str(&format!("# Knowledge Bundle: {}\n\n", scope));
    md.push_str(&format!("- Bundle: `{}`\n", bundle_id));
    md.push_str(&format!("- Knowledge version: {}\n", knowledge_version));
    md.push_str(&format!("- Files: {}\n\n", records.len()));
    md.push_str("| logical path | sha256 | bytes |\n|---|---|---|\n");
    for r in records {
        md.push_str(&format!(
            "| {} | {} | {} |\n",
            r.logical_path,
            &r.sha256[..12.min(r.sha256.len())],
            r.bytes
        ));
    }
    md
}
