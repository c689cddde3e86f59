//! Sufficiency records per `(scope, knowledge_version)`.
//!
//! `sufficient` is only reached through a deliberate approval step, never as
//! a side effect of a scan or synthesize. Records are monotone per key: a
//! status may not be lowered once recorded.

use crate::core::error::LanekeeperError;
use crate::core::fsio;
use crate::core::layout::{OpsPaths, scope_file_component};
use crate::core::time;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SufficiencyStatus {
    Insufficient,
    Partial,
    Sufficient,
}

impl SufficiencyStatus {
    pub fn parse(raw: &str) -> Result<SufficiencyStatus, LanekeeperError> {
        match raw {
            "insufficient" => Ok(SufficiencyStatus::Insufficient),
            "partial" => Ok(SufficiencyStatus::Partial),
            "sufficient" => Ok(SufficiencyStatus::Sufficient),
            other => Err(LanekeeperError::ContractViolation(format!(
                "unknown sufficiency status '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SufficiencyRecord {
    #[serde(default = "default_version")]
    pub version: u32,
    pub scope: String,
    pub knowledge_version: String,
    pub status: SufficiencyStatus,
    pub captured_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasons: Option<Vec<String>>,
}

fn default_version() -> u32 {
    1
}

fn record_path(ops: &OpsPaths, scope: &str, knowledge_version: &str) -> PathBuf {
    ops.lane_a_sufficiency().join(format!(
        "{}__{}.json",
        scope_file_component(scope),
        knowledge_version
    ))
}

pub fn load(
    ops: &OpsPaths,
    scope: &str,
    knowledge_version: &str,
) -> Result<Option<SufficiencyRecord>, LanekeeperError> {
    fsio::load_json_opt(&record_path(ops, scope, knowledge_version))
}

/// Record a status for `(scope, knowledge_version)`.
///
/// Setting `sufficient` must come from the explicit approval path; use
/// [`approve`] for that. Downgrades are rejected.
pub fn set_status(
    ops: &OpsPaths,
    scope: &str,
    knowledge_version: &str,
    status: SufficiencyStatus,
    reasons: Option<Vec<String>>,
) -> Result<SufficiencyRecord, LanekeeperError> {
    if let Some(existing) = load(ops, scope, knowledge_version)? {
        if status < existing.status {
            return Err(LanekeeperError::ContractViolation(format!(
                "sufficiency for ({}, {}) is already '{:?}'; downgrades are not allowed",
                scope, knowledge_version, existing.status
            )));
        }
    }
    let record = SufficiencyRecord {
        version: 1,
        scope: scope.to_string(),
        knowledge_version: knowledge_version.to_string(),
        status,
        captured_at: time::now_rfc3339(),
        reasons,
    };
    fsio::write_json_atomic(&record_path(ops, scope, knowledge_version), &record)?;
    Ok(record)
}

/// The deliberate approval step that makes a scope sufficient.
pub fn approve(
    ops: &OpsPaths,
    scope: &str,
    knowledge_version: &str,
    approved_by: &str,
) -> Result<SufficiencyRecord, LanekeeperError> {
    set_status(
        ops,
        scope,
        knowledge_version,
        SufficiencyStatus::Sufficient,
        Some(vec![format!("approved_by={}", approved_by)]),
    )
}

pub fn is_sufficient(
    ops: &OpsPaths,
    scope: &str,
    knowledge_version: &str,
) -> Result<bool, LanekeeperError> {
    Ok(load(ops, scope, knowledge_version)?
        .map(|r| r.status == SufficiencyStatus::Sufficient)
        .unwrap_or(false))
}

/// Lane B accepts delivery when the system scope is sufficient at the
/// current version, or the requested repo scope is.
pub fn delivery_acceptable(
    ops: &OpsPaths,
    scope: &str,
    knowledge_version: &str,
) -> Result<bool, LanekeeperError> {
    if is_sufficient(ops, "system", knowledge_version)? {
        return Ok(true);
    }
    if scope != "system" && is_sufficient(ops, scope, knowledge_version)? {
        return Ok(true);
    }
    Ok(false)
}
