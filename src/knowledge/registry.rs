//! Active-repo registry (`<ops>/config/REPOS.json`).

use crate::core::error::LanekeeperError;
use crate::core::fsio;
use crate::core::layout::OpsPaths;
use regex::Regex;
use rustc_hash::FxHashSet;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

pub fn repo_id_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[a-z0-9_\-]+$").unwrap())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RepoStatus {
    Active,
    Archived,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Repo {
    pub repo_id: String,
    /// Relative to the project-configured `repos_root`.
    pub path: String,
    pub active_branch: String,
    pub team_id: String,
    pub status: RepoStatus,
    #[serde(default)]
    pub keywords: Vec<String>,
}

impl Repo {
    pub fn abs_path(&self, repos_root: &Path) -> PathBuf {
        repos_root.join(&self.path)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepoRegistry {
    #[serde(default = "default_version")]
    pub version: u32,
    pub repos: Vec<Repo>,
}

fn default_version() -> u32 {
    1
}

impl RepoRegistry {
    /// Load and validate `REPOS.json`: ids must match the repo-id grammar
    /// and be unique; paths must be relative.
    pub fn load(ops: &OpsPaths) -> Result<RepoRegistry, LanekeeperError> {
        let path = ops.repos_config_path();
        if !path.exists() {
            return Err(LanekeeperError::MissingInput(format!(
                "repo registry not found at {}",
                path.display()
            )));
        }
        let registry: RepoRegistry = fsio::load_json(&path)?;
        registry.validate()?;
        Ok(registry)
    }

    pub fn validate(&self) -> Result<(), LanekeeperError> {
        let mut seen: FxHashSet<&str> = FxHashSet::default();
        for repo in &self.repos {
            if !repo_id_regex().is_match(&repo.repo_id) {
                return Err(LanekeeperError::ContractViolation(format!(
                    "repo_id '{}' does not match ^[a-z0-9_\\-]+$",
                    repo.repo_id
                )));
            }
            if !seen.insert(repo.repo_id.as_str()) {
                return Err(LanekeeperError::ContractViolation(format!(
                    "duplicate repo_id '{}' in registry",
                    repo.repo_id
                )));
            }
            if Path::new(&repo.path).is_absolute() {
                return Err(LanekeeperError::ContractViolation(format!(
                    "repo '{}' path must be relative to repos_root",
                    repo.repo_id
                )));
            }
        }
        Ok(())
    }

    pub fn active_repos(&self) -> Vec<&Repo> {
        self.repos
            .iter()
            .filter(|r| r.status == RepoStatus::Active)
            .collect()
    }

    pub fn find(&self, repo_id: &str) -> Option<&Repo> {
        self.repos.iter().find(|r| r.repo_id == repo_id)
    }

    /// Find an *active* repo or explain what went wrong.
    pub fn require_active(&self, repo_id: &str) -> Result<&Repo, LanekeeperError> {
        match self.find(repo_id) {
            Some(repo) if repo.status == RepoStatus::Active => Ok(repo),
            Some(_) => Err(LanekeeperError::ContractViolation(format!(
                "repo '{}' is archived",
                repo_id
            ))),
            None => Err(LanekeeperError::MissingInput(format!(
                "repo '{}' is not in the registry",
                repo_id
            ))),
        }
    }
}
