//! Lane A governance gate, enforced at the Lane B boundary.
//!
//! Invoked when a triaged intake declares `origin: lane_a`. All five checks
//! must pass: header completeness, IA file match, version lock, freshness,
//! sufficiency. The gate never mutates knowledge; it only returns a verdict
//! with a reason code from the closed set.

use crate::core::error::LanekeeperError;
use crate::core::fsio;
use crate::core::layout::{KnowledgePaths, OpsPaths};
use crate::core::ledger::{self, LedgerLine};
use crate::delivery::intake::{IntakeHeader, Scope};
use crate::knowledge::registry::RepoRegistry;
use crate::knowledge::staleness::{self, StalenessConfig};
use crate::knowledge::sufficiency;
use crate::knowledge::version::{self, version_regex};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::path::Path;

/// Intake Approval (IA) record, from the processed approvals directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntakeApproval {
    pub id: String,
    pub scope: String,
    pub knowledge_version: String,
    #[serde(default)]
    pub sufficiency_override: bool,
    pub approved_by: String,
    pub approved_at: String,
}

/// Everything a passing gate hands to triage.
#[derive(Debug)]
pub struct GatePass {
    pub scope: Scope,
    pub knowledge_version: String,
    pub approval: IntakeApproval,
    pub sufficiency_overridden: bool,
}

/// Run all governance checks for a Lane A-origin intake.
pub fn check_lane_a_governance(
    ops: &OpsPaths,
    knowledge: &KnowledgePaths,
    registry: &RepoRegistry,
    repos_root: &Path,
    header: &IntakeHeader,
    config: &StalenessConfig,
) -> Result<GatePass, LanekeeperError> {
    // 1. Metadata completeness.
    let approval_id = header.intake_approval_id.as_deref().ok_or_else(|| {
        LanekeeperError::GovernanceViolation(
            "lane_a intake is missing intake_approval_id".to_string(),
        )
    })?;
    let scope_raw = header.scope.as_deref().ok_or_else(|| {
        LanekeeperError::GovernanceViolation("lane_a intake is missing scope".to_string())
    })?;
    let scope = Scope::parse(scope_raw)
        .map_err(|e| LanekeeperError::GovernanceViolation(format!("{}", e)))?;
    let header_version = header.knowledge_version.as_deref().ok_or_else(|| {
        LanekeeperError::GovernanceViolation(
            "lane_a intake is missing knowledge_version".to_string(),
        )
    })?;
    if !version_regex().is_match(header_version) {
        return Err(LanekeeperError::GovernanceViolation(format!(
            "knowledge_version '{}' does not match v<int>[.int[.int]]",
            header_version
        )));
    }

    // 2. IA file present and matching verbatim.
    let ia_path = ops
        .lane_a_intake_approvals_processed()
        .join(format!("{}.json", approval_id));
    if !ia_path.exists() {
        return Err(LanekeeperError::GovernanceViolation(format!(
            "intake approval '{}' not found under processed approvals",
            approval_id
        )));
    }
    let approval: IntakeApproval = fsio::load_json(&ia_path)?;
    if approval.id != approval_id {
        return Err(LanekeeperError::GovernanceViolation(format!(
            "intake approval file id '{}' does not match header '{}'",
            approval.id, approval_id
        )));
    }
    if approval.scope != scope_raw {
        return Err(LanekeeperError::GovernanceViolation(format!(
            "intake approval scope '{}' does not match header '{}'",
            approval.scope, scope_raw
        )));
    }
    if approval.knowledge_version != header_version {
        return Err(LanekeeperError::KnowledgeVersionMismatch(format!(
            "intake approval pins {} but header declares {}",
            approval.knowledge_version, header_version
        )));
    }

    // 3. Version lock against the current pointer.
    let current = version::load(ops)?.current;
    if header_version != current {
        return Err(LanekeeperError::KnowledgeVersionMismatch(format!(
            "header declares {} but current knowledge version is {}",
            header_version, current
        )));
    }

    // 4. Freshness.
    let result = staleness::evaluate_scope(
        ops,
        knowledge,
        registry,
        repos_root,
        scope_raw,
        config,
    )?;
    if result.stale {
        return Err(LanekeeperError::KnowledgeStale(format!(
            "scope {} is stale ({})",
            scope_raw,
            result.reasons.join("; ")
        )));
    }

    // 5. Sufficiency, or an IA-carried override (audit-logged).
    let overridden = approval.sufficiency_override || header.sufficiency_override;
    if !sufficiency::delivery_acceptable(ops, scope_raw, header_version)? {
        if overridden {
            ledger::append(
                &ops.lane_a_ledger(),
                &LedgerLine::new(&approval.approved_by, "sufficiency_override")
                    .with_scope(scope_raw)
                    .with_details(json!({
                        "intake_approval_id": &approval.id,
                        "knowledge_version": header_version,
                    })),
            )?;
        } else {
            return Err(LanekeeperError::GovernanceViolation(format!(
                "knowledge at ({}, {}) is not sufficient and no override was approved",
                scope_raw, header_version
            )));
        }
    }

    Ok(GatePass {
        scope,
        knowledge_version: header_version.to_string(),
        approval,
        sufficiency_overridden: overridden,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delivery::intake::parse_intake;
    use crate::knowledge::registry::RepoRegistry;
    use tempfile::tempdir;

    fn setup(tmp: &Path) -> (OpsPaths, KnowledgePaths, RepoRegistry) {
        let ops = OpsPaths::new(&tmp.join("ops")).unwrap();
        let knowledge = KnowledgePaths::new(tmp.join("knowledge"));
        let registry = RepoRegistry {
            version: 1,
            repos: vec![],
        };
        (ops, knowledge, registry)
    }

    fn write_ia(ops: &OpsPaths, id: &str, scope: &str, version: &str) {
        let ia = IntakeApproval {
            id: id.to_string(),
            scope: scope.to_string(),
            knowledge_version: version.to_string(),
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

    #[test]
    fn test_missing_metadata_is_governance_violation() {
        let tmp = tempdir().expect("tempdir");
        let (ops, knowledge, registry) = setup(tmp.path());
        let header = parse_intake("origin: lane_a\n\nbody");
        let err = check_lane_a_governance(
            &ops,
            &knowledge,
            &registry,
            tmp.path(),
            &header,
            &StalenessConfig::default(),
        )
        .unwrap_err();
        assert_eq!(err.reason_code(), "lane_a_governance_violation");
    }

    #[test]
    fn test_ia_version_mismatch_reason_code() {
        let tmp = tempdir().expect("tempdir");
        let (ops, knowledge, registry) = setup(tmp.path());
        write_ia(&ops, "IA-7", "system", "v1.1");
        let header = parse_intake(
            "origin: lane_a\nscope: system\nintake_approval_id: IA-7\nknowledge_version: v1.2\n\nbody",
        );
        let err = check_lane_a_governance(
            &ops,
            &knowledge,
            &registry,
            tmp.path(),
            &header,
            &StalenessConfig::default(),
        )
        .unwrap_err();
        assert_eq!(err.reason_code(), "knowledge_version_mismatch");
    }

    #[test]
    fn test_version_lock_against_current_pointer() {
        let tmp = tempdir().expect("tempdir");
        let (ops, knowledge, registry) = setup(tmp.path());
        write_ia(&ops, "IA-1", "system", "v9");
        // current pointer defaults to v0
        let header = parse_intake(
            "origin: lane_a\nscope: system\nintake_approval_id: IA-1\nknowledge_version: v9\n\nbody",
        );
        let err = check_lane_a_governance(
            &ops,
            &knowledge,
            &registry,
            tmp.path(),
            &header,
            &StalenessConfig::default(),
        )
        .unwrap_err();
        assert_eq!(err.reason_code(), "knowledge_version_mismatch");
    }

    #[test]
    fn test_pass_with_sufficiency_approved() {
        let tmp = tempdir().expect("tempdir");
        let (ops, knowledge, registry) = setup(tmp.path());
        write_ia(&ops, "IA-2", "system", "v0");
        sufficiency::approve(&ops, "system", "v0", "operator").unwrap();
        let header = parse_intake(
            "origin: lane_a\nscope: system\nintake_approval_id: IA-2\nknowledge_version: v0\n\nbody",
        );
        let pass = check_lane_a_governance(
            &ops,
            &knowledge,
            &registry,
            tmp.path(),
            &header,
            &StalenessConfig::default(),
        )
        .unwrap();
        assert_eq!(pass.scope, Scope::System);
        assert!(!pass.sufficiency_overridden);
    }

    #[test]
    fn test_insufficient_without_override_fails() {
        let tmp = tempdir().expect("tempdir");
        let (ops, knowledge, registry) = setup(tmp.path());
        write_ia(&ops, "IA-3", "system", "v0");
        let header = parse_intake(
            "origin: lane_a\nscope: system\nintake_approval_id: IA-3\nknowledge_version: v0\n\nbody",
        );
        let err = check_lane_a_governance(
            &ops,
            &knowledge,
            &registry,
            tmp.path(),
            &header,
            &StalenessConfig::default(),
        )
        .unwrap_err();
        assert_eq!(err.reason_code(), "lane_a_governance_violation");
    }

    #[test]
    fn test_ia_override_passes_and_is_ledgered() {
        let tmp = tempdir().expect("tempdir");
        let (ops, knowledge, registry) = setup(tmp.path());
        let ia = IntakeApproval {
            id: "IA-4".to_string(),
            scope: "system".to_string(),
            knowledge_version: "v0".to_string(),
            sufficiency_override: true,
            approved_by: "operator".to_string(),
            approved_at: "2026-02-01T00:00:00Z".to_string(),
        };
        fsio::write_json_atomic(
            &ops.lane_a_intake_approvals_processed().join("IA-4.json"),
            &ia,
        )
        .unwrap();
        let header = parse_intake(
            "origin: lane_a\nscope: system\nintake_approval_id: IA-4\nknowledge_version: v0\n\nbody",
        );
        let pass = check_lane_a_governance(
            &ops,
            &knowledge,
            &registry,
            tmp.path(),
            &header,
            &StalenessConfig::default(),
        )
        .unwrap();
        assert!(pass.sufficiency_overridden);

        let ledger_raw = std::fs::read_to_string(ops.lane_a_ledger()).unwrap();
        assert!(ledger_raw.contains("sufficiency_override"));
    }
}
