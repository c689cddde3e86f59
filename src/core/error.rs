//! Error types for lanekeeper operations.
//!
//! This module defines the canonical error type used throughout the crate.
//! All subsystems return `Result<T, LanekeeperError>` for error handling.

use std::env;
use std::io;
use thiserror::Error;

/// Canonical error type for all lanekeeper operations.
///
/// Uses `thiserror` for automatic `Display` and `Error` trait implementations.
/// Governance variants map to the closed reason-code set via [`LanekeeperError::reason_code`];
/// those codes are what ledger lines and failure artifacts record.
#[derive(Error, Debug)]
pub enum LanekeeperError {
    /// I/O error (auto-converts from `std::io::Error`)
    #[error("I/O error: {0}")]
    IoError(#[from] io::Error),

    /// JSON encode/decode error (auto-converts from `serde_json::Error`)
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    /// Environment variable error (auto-converts from `std::env::VarError`)
    #[error("Environment variable error: {0}")]
    EnvVarError(#[from] env::VarError),

    /// A required artifact is absent; the caller must run a prior step first
    #[error("Missing input: {0}")]
    MissingInput(String),

    /// A loaded document fails its schema or invariants
    #[error("Contract violation: {0}")]
    ContractViolation(String),

    /// A cited path cannot be read at the pinned ref
    #[error("Evidence missing: {0}")]
    EvidenceMissing(String),

    /// Stored fingerprint no longer matches the content at the working ref
    #[error("Index out of date: {0}")]
    IndexOutOfDate(String),

    /// Knowledge for the scope is stale and the operation was not overridden
    #[error("Knowledge stale: {0}")]
    KnowledgeStale(String),

    /// Declared knowledge version does not match the current pointer
    #[error("Knowledge version mismatch: {0}")]
    KnowledgeVersionMismatch(String),

    /// Effective dependency graph has not been approved
    #[error("Dependency graph not approved: {0}")]
    DepsNotApproved(String),

    /// Lane A governance check failed at the Lane B boundary
    #[error("Lane A governance violation: {0}")]
    GovernanceViolation(String),

    /// A declared cross-project dependency has no readable knowledge bundle
    #[error("External dependency bundle missing: {0}")]
    ExternalDependencyBundleMissing(String),

    /// git subprocess exited non-zero or could not be launched
    #[error("git failed: {0}")]
    GitFailed(String),

    /// gh subprocess exited non-zero or could not be launched
    #[error("gh failed: {0}")]
    GhFailed(String),

    /// Subprocess exceeded its per-call deadline
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Invalid JSON/JSONL input from an external producer
    #[error("Malformed input: {0}")]
    Malformed(String),

    /// Path resolution or sandbox violation
    #[error("Path error: {0}")]
    PathError(String),

    /// Lock acquisition failure (held and not stale)
    #[error("Lock error: {0}")]
    LockError(String),
}

impl LanekeeperError {
    /// Stable machine-readable code for ledger lines and failure artifacts.
    pub fn reason_code(&self) -> &'static str {
        match self {
            Self::IoError(_) => "io_error",
            Self::JsonError(_) => "json_error",
            Self::EnvVarError(_) => "env_error",
            Self::MissingInput(_) => "missing_input",
            Self::ContractViolation(_) => "contract_violation",
            Self::EvidenceMissing(_) => "evidence_missing",
            Self::IndexOutOfDate(_) => "index_out_of_date",
            Self::KnowledgeStale(_) => "knowledge_stale",
            Self::KnowledgeVersionMismatch(_) => "knowledge_version_mismatch",
            Self::DepsNotApproved(_) => "deps_not_approved",
            Self::GovernanceViolation(_) => "lane_a_governance_violation",
            Self::ExternalDependencyBundleMissing(_) => "external_dependency_bundle_missing",
            Self::GitFailed(_) => "git_failed",
            Self::GhFailed(_) => "gh_failed",
            Self::Timeout(_) => "timeout",
            Self::Malformed(_) => "malformed",
            Self::PathError(_) => "path_error",
            Self::LockError(_) => "lock_error",
        }
    }
}
