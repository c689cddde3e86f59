//! Repo Indexer: fingerprints and structural discovery at a pinned ref.
//!
//! The indexer never reads the working tree. Every byte it hashes comes from
//! `git show <ref>:<path>`, so a concurrently dirty checkout cannot leak
//! into fingerprints. The set of fingerprint keys it emits is authoritative
//! for what evidence a later scan may cite.

use crate::core::error::LanekeeperError;
use crate::core::fsio;
use crate::core::git;
use crate::core::layout::KnowledgePaths;
use crate::core::time;
use crate::knowledge::registry::Repo;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::Path;

/// Declared cross-project dependency, read from `.depends_on.json` at the ref.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DependsOnEntry {
    pub project_code: String,
    pub repo_id: String,
    pub knowledge_abs_path: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RepoDependencies {
    #[serde(default)]
    pub depends_on: Vec<DependsOnEntry>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ApiSurface {
    #[serde(default)]
    pub openapi_files: Vec<String>,
    #[serde(default)]
    pub routes_controllers: Vec<String>,
    #[serde(default)]
    pub events_topics: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Hotspot {
    pub file_path: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BuildCommands {
    #[serde(default)]
    pub install: Vec<String>,
    #[serde(default)]
    pub lint: Vec<String>,
    #[serde(default)]
    pub build: Vec<String>,
    #[serde(default)]
    pub test: Vec<String>,
    #[serde(default)]
    pub evidence_files: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrossRepoDependency {
    #[serde(rename = "type")]
    pub dep_type: String,
    pub target: String,
    #[serde(default)]
    pub evidence_refs: Vec<String>,
}

/// One repo's structural index at one commit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepoIndex {
    pub version: u64,
    pub repo_id: String,
    pub scanned_at: String,
    /// Ref the index was computed against (e.g. `origin/main`).
    pub git_ref: String,
    pub head_sha: String,
    pub entrypoints: Vec<String>,
    pub api_surface: ApiSurface,
    #[serde(default)]
    pub migrations_schema: Vec<String>,
    #[serde(default)]
    pub hotspots: Vec<Hotspot>,
    pub build_commands: BuildCommands,
    #[serde(default)]
    pub cross_repo_dependencies: Vec<CrossRepoDependency>,
    #[serde(default)]
    pub dependencies: RepoDependencies,
    /// path -> sha256 at `head_sha`.
    pub fingerprints: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FingerprintEntry {
    pub path: String,
    pub sha256: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepoFingerprints {
    #[serde(default = "default_version")]
    pub version: u32,
    pub repo_id: String,
    pub files: Vec<FingerprintEntry>,
}

fn default_version() -> u32 {
    1
}

/// Content-agnostic path rules for fingerprint-worthy files.
///
/// Basenames: manifests, lockfiles, container/build definitions.
/// Prefixes: infra trees, CI workflows, migration trees of several
/// ecosystems. Suffixes: API contract formats.
pub fn is_fingerprint_worthy(path: &str) -> bool {
    const BASENAMES: [&str; 19] = [
        "package.json",
        "package-lock.json",
        "yarn.lock",
        "pnpm-lock.yaml",
        "Cargo.toml",
        "Cargo.lock",
        "go.mod",
        "go.sum",
        "requirements.txt",
        "poetry.lock",
        "Pipfile.lock",
        "composer.json",
        "composer.lock",
        "Gemfile.lock",
        "Dockerfile",
        "docker-compose.yml",
        "docker-compose.yaml",
        "Makefile",
        ".depends_on.json",
    ];
    const DIR_PREFIXES: [&str; 8] = [
        "helm/",
        "k8s/",
        "kubernetes/",
        ".github/workflows/",
        "migrations/",
        "db/migrations/",
        "prisma/migrations/",
        "alembic/",
    ];
    const SUFFIXES: [&str; 4] = [".proto", ".graphql", ".tf", "schema.prisma"];

    let basename = path.rsplit('/').next().unwrap_or(path);
    if BASENAMES.contains(&basename) {
        return true;
    }
    if DIR_PREFIXES.iter().any(|p| path.starts_with(p)) {
        return true;
    }
    if SUFFIXES.iter().any(|s| path.ends_with(s)) {
        return true;
    }
    is_openapi_name(basename)
}

fn is_openapi_name(basename: &str) -> bool {
    let lower = basename.to_ascii_lowercase();
    (lower.starts_with("openapi") || lower.starts_with("swagger"))
        && (lower.ends_with(".yaml") || lower.ends_with(".yml") || lower.ends_with(".json"))
}

/// Broad file category used for fact derivation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileCategory {
    Manifest,
    Lockfile,
    Contract,
    Infra,
    Migration,
    Other,
}

pub fn classify_path(path: &str) -> FileCategory {
    let basename = path.rsplit('/').next().unwrap_or(path);
    match basename {
        "package.json" | "Cargo.toml" | "go.mod" | "requirements.txt" | "composer.json"
        | "Makefile" => return FileCategory::Manifest,
        "package-lock.json" | "yarn.lock" | "pnpm-lock.yaml" | "Cargo.lock" | "go.sum"
        | "poetry.lock" | "Pipfile.lock" | "composer.lock" | "Gemfile.lock" => {
            return FileCategory::Lockfile;
        }
        _ => {}
    }
    if path.ends_with(".proto") || path.ends_with(".graphql") || is_openapi_name(basename) {
        return FileCategory::Contract;
    }
    if path.starts_with("migrations/")
        || path.starts_with("db/migrations/")
        || path.starts_with("prisma/migrations/")
        || path.starts_with("alembic/")
        || basename == "schema.prisma"
    {
        return FileCategory::Migration;
    }
    if basename == "Dockerfile"
        || basename.starts_with("docker-compose.")
        || path.starts_with("helm/")
        || path.starts_with("k8s/")
        || path.starts_with("kubernetes/")
        || path.starts_with(".github/workflows/")
        || path.ends_with(".tf")
    {
        return FileCategory::Infra;
    }
    FileCategory::Other
}

const ENTRYPOINT_CANDIDATES: [&str; 10] = [
    "src/main.rs",
    "src/index.ts",
    "src/index.js",
    "src/main.ts",
    "main.py",
    "app.py",
    "cmd/main.go",
    "server.js",
    "index.js",
    "main.go",
];

/// Outcome of indexing one repo.
#[derive(Debug)]
pub struct IndexOutcome {
    pub index: RepoIndex,
    pub fingerprints: RepoFingerprints,
    pub files_seen: usize,
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Resolve the indexing ref for a repo, failing precisely when the declared
/// branch does not exist locally.
pub fn resolve_index_ref(repo_abs: &Path, active_branch: &str) -> Result<String, LanekeeperError> {
    match git::resolve_ref(repo_abs, active_branch)? {
        Some(reference) => Ok(reference),
        None => Err(LanekeeperError::GitFailed(format!(
            "branch '{}' not found locally in {} (neither refs/remotes/origin nor refs/heads)",
            active_branch,
            repo_abs.display()
        ))),
    }
}

/// Index one repo at its active branch head and persist the artifacts.
///
/// `sibling_ids` is the rest of the registry; a fingerprinted path that
/// names a sibling repo id as a component becomes a `path_reference`
/// cross-repo dependency (content-agnostic, deterministic).
pub fn index_repo(
    repo: &Repo,
    repo_abs: &Path,
    knowledge: &KnowledgePaths,
    sibling_ids: &[String],
) -> Result<IndexOutcome, LanekeeperError> {
    let reference = resolve_index_ref(repo_abs, &repo.active_branch)?;
    let head_sha = git::rev_list_one(repo_abs, &reference)?;
    let tree = git::ls_tree_names(repo_abs, &reference)?;

    let mut fingerprints: BTreeMap<String, String> = BTreeMap::new();
    for path in tree.iter().filter(|p| is_fingerprint_worthy(p)) {
        let bytes = git::show_file_at_ref(repo_abs, &reference, path)?;
        fingerprints.insert(path.clone(), sha256_hex(&bytes));
    }

    let mut entrypoints: Vec<String> = ENTRYPOINT_CANDIDATES
        .iter()
        .filter(|c| tree.iter().any(|p| p == *c))
        .map(|c| (*c).to_string())
        .collect();
    entrypoints.sort();

    let api_surface = discover_api_surface(&tree);
    let migrations_schema = discover_migrations(&tree);
    let hotspots = discover_hotspots(&fingerprints);
    let build_commands = derive_build_commands(&fingerprints);
    let cross_repo_dependencies =
        discover_cross_repo_deps(&repo.repo_id, &fingerprints, sibling_ids);
    let dependencies = load_declared_dependencies(repo_abs, &reference)?;

    let previous: Option<RepoIndex> =
        fsio::load_json_opt(&knowledge.repo_index_path(&repo.repo_id))?;
    let version = next_index_version(previous.as_ref(), &head_sha, &fingerprints);

    let index = RepoIndex {
        version,
        repo_id: repo.repo_id.clone(),
        scanned_at: time::now_rfc3339(),
        git_ref: reference,
        head_sha,
        entrypoints,
        api_surface,
        migrations_schema,
        hotspots,
        build_commands,
        cross_repo_dependencies,
        dependencies,
        fingerprints: fingerprints.clone(),
    };

    let fp_doc = RepoFingerprints {
        version: 1,
        repo_id: repo.repo_id.clone(),
        files: fingerprints
            .iter()
            .map(|(path, sha256)| FingerprintEntry {
                path: path.clone(),
                sha256: sha256.clone(),
            })
            .collect(),
    };

    fsio::write_json_atomic(&knowledge.repo_index_path(&repo.repo_id), &index)?;
    fsio::write_json_atomic(&knowledge.repo_fingerprints_path(&repo.repo_id), &fp_doc)?;

    Ok(IndexOutcome {
        index,
        fingerprints: fp_doc,
        files_seen: tree.len(),
    })
}

/// Re-indexing at an unchanged head keeps the version; any drift bumps it.
fn next_index_version(
    previous: Option<&RepoIndex>,
    head_sha: &str,
    fingerprints: &BTreeMap<String, String>,
) -> u64 {
    match previous {
        Some(prev) if prev.head_sha == head_sha && prev.fingerprints == *fingerprints => {
            prev.version
        }
        Some(prev) => prev.version + 1,
        None => 1,
    }
}

fn discover_api_surface(tree: &[String]) -> ApiSurface {
    let mut openapi_files = Vec::new();
    let mut routes_controllers = Vec::new();
    let mut events_topics = Vec::new();
    for path in tree {
        let basename = path.rsplit('/').next().unwrap_or(path);
        if is_openapi_name(basename) || path.ends_with(".graphql") || path.ends_with(".proto") {
            openapi_files.push(path.clone());
        }
        if path.contains("routes/")
            || path.contains("controllers/")
            || path.contains("handlers/")
            || basename.ends_with("_controller.rb")
        {
            routes_controllers.push(path.clone());
        }
        if path.contains("events/") || path.contains("topics/") || path.contains("consumers/") {
            events_topics.push(path.clone());
        }
    }
    openapi_files.sort();
    routes_controllers.sort();
    events_topics.sort();
    ApiSurface {
        openapi_files,
        routes_controllers,
        events_topics,
    }
}

fn discover_migrations(tree: &[String]) -> Vec<String> {
    let mut out: Vec<String> = tree
        .iter()
        .filter(|p| classify_path(p) == FileCategory::Migration)
        .cloned()
        .collect();
    out.sort();
    out
}

fn discover_hotspots(fingerprints: &BTreeMap<String, String>) -> Vec<Hotspot> {
    let mut out = Vec::new();
    for path in fingerprints.keys() {
        let basename = path.rsplit('/').next().unwrap_or(path);
        if basename == "Dockerfile" || basename.starts_with("docker-compose.") {
            out.push(Hotspot {
                file_path: path.clone(),
                reason: "container build definition".to_string(),
            });
        } else if path.starts_with(".github/workflows/") {
            out.push(Hotspot {
                file_path: path.clone(),
                reason: "ci workflow".to_string(),
            });
        }
    }
    out
}

fn derive_build_commands(fingerprints: &BTreeMap<String, String>) -> BuildCommands {
    let mut cmds = BuildCommands::default();
    let has = |name: &str| fingerprints.keys().any(|p| p == name);

    if has("package.json") {
        cmds.install.push("npm install".to_string());
        cmds.lint.push("npm run lint".to_string());
        cmds.build.push("npm run build".to_string());
        cmds.test.push("npm test".to_string());
        cmds.evidence_files.push("package.json".to_string());
    }
    if has("Cargo.toml") {
        cmds.build.push("cargo build".to_string());
        cmds.lint.push("cargo clippy".to_string());
        cmds.test.push("cargo test".to_string());
        cmds.evidence_files.push("Cargo.toml".to_string());
    }
    if has("go.mod") {
        cmds.build.push("go build ./...".to_string());
        cmds.test.push("go test ./...".to_string());
        cmds.evidence_files.push("go.mod".to_string());
    }
    if has("requirements.txt") {
        cmds.install.push("pip install -r requirements.txt".to_string());
        cmds.evidence_files.push("requirements.txt".to_string());
    }
    if has("Makefile") {
        cmds.build.push("make".to_string());
        cmds.evidence_files.push("Makefile".to_string());
    }
    cmds
}

fn discover_cross_repo_deps(
    repo_id: &str,
    fingerprints: &BTreeMap<String, String>,
    sibling_ids: &[String],
) -> Vec<CrossRepoDependency> {
    let mut out: Vec<CrossRepoDependency> = Vec::new();
    for sibling in sibling_ids {
        if sibling == repo_id {
            continue;
        }
        let mut refs: Vec<String> = fingerprints
            .keys()
            .filter(|p| p.split('/').any(|component| component == sibling))
            .cloned()
            .collect();
        if refs.is_empty() {
            continue;
        }
        refs.sort();
        out.push(CrossRepoDependency {
            dep_type: "path_reference".to_string(),
            target: sibling.clone(),
            evidence_refs: refs,
        });
    }
    out.sort_by(|a, b| a.target.cmp(&b.target));
    out
}

fn load_declared_dependencies(
    repo_abs: &Path,
    reference: &str,
) -> Result<RepoDependencies, LanekeeperError> {
    match git::show_file_at_ref(repo_abs, reference, ".depends_on.json") {
        Ok(bytes) => serde_json::from_slice::<RepoDependencies>(&bytes).map_err(|e| {
            LanekeeperError::Malformed(format!(".depends_on.json at {}: {}", reference, e))
        }),
        // Absence of a declaration is the common case, not an error.
        Err(_) => Ok(RepoDependencies::default()),
    }
}

/// Load both index artifacts, erroring precisely when the indexer has not run.
pub fn load_index_artifacts(
    knowledge: &KnowledgePaths,
    repo_id: &str,
) -> Result<(RepoIndex, RepoFingerprints), LanekeeperError> {
    let index_path = knowledge.repo_index_path(repo_id);
    let fp_path = knowledge.repo_fingerprints_path(repo_id);
    if !index_path.exists() || !fp_path.exists() {
        return Err(LanekeeperError::MissingInput(format!(
            "repo '{}' has no index artifacts; run `lanekeeper index --repo-id {}` first",
            repo_id, repo_id
        )));
    }
    let index: RepoIndex = fsio::load_json(&index_path)?;
    let fingerprints: RepoFingerprints = fsio::load_json(&fp_path)?;
    if index.repo_id != repo_id || fingerprints.repo_id != repo_id {
        return Err(LanekeeperError::ContractViolation(format!(
            "index artifacts under '{}' belong to a different repo",
            repo_id
        )));
    }
    Ok((index, fingerprints))
}
