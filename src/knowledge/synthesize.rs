//! Knowledge Synthesize: roll per-repo scans into the system view.
//!
//! Fails closed when any active repo has no scan. The integration map is
//! derived purely from fact claims with stable prefixes, so the roll-up
//! stays decoupled from how facts were discovered.

use crate::core::error::LanekeeperError;
use crate::core::fsio;
use crate::core::layout::{KnowledgePaths, OpsPaths};
use crate::core::lock::{FileLock, ORCHESTRATE_STALE_MS};
use crate::core::time;
use crate::knowledge::scan::{self, KnowledgeScan};
use crate::knowledge::registry::RepoRegistry;
use serde::{Deserialize, Serialize};
use serde_json::json;

const ENTRYPOINT_PREFIX: &str = "Entrypoint: ";
const CONTRACT_PREFIX: &str = "API contract file: ";
const INFRA_PREFIX: &str = "Infra file: ";
const CROSS_REPO_PREFIX: &str = "Cross-repo dependency ";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntegrationInput {
    pub repo_id: String,
    pub scanned_at: String,
    pub scan_version: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepoIntegration {
    pub repo_id: String,
    pub entrypoints: Vec<String>,
    pub api_contract_files: Vec<String>,
    pub infra_files: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntegrationMap {
    pub repos: Vec<RepoIntegration>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Integration {
    pub version: u32,
    pub scope: String,
    pub generated_at: String,
    pub inputs: Vec<IntegrationInput>,
    pub integration_map: IntegrationMap,
    #[serde(default)]
    pub cross_repo_contracts: Vec<String>,
    #[serde(default)]
    pub known_unknowns: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Gap {
    pub gap_id: String,
    pub repo_id: String,
    pub kind: String,
    pub detail: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GapsDoc {
    pub version: u32,
    pub scope: String,
    pub generated_at: String,
    pub gaps: Vec<Gap>,
}

fn claims_with_prefix(scan: &KnowledgeScan, prefix: &str) -> Vec<String> {
    let mut out: Vec<String> = scan
        .facts
        .iter()
        .filter_map(|f| f.claim.strip_prefix(prefix).map(str::to_string))
        .collect();
    out.sort();
    out.dedup();
    out
}

/// Roll all active repo scans into `integration.json`, `gaps.json`, the
/// integration map view, and a rendered `integration.md`.
pub fn run_synthesize(
    ops: &OpsPaths,
    knowledge: &KnowledgePaths,
    registry: &RepoRegistry,
) -> Result<(Integration, GapsDoc), LanekeeperError> {
    let mut missing = Vec::new();
    let mut scans = Vec::new();
    for repo in registry.active_repos() {
        match scan::load_scan(knowledge, &repo.repo_id) {
            Ok(s) => scans.push(s),
            Err(LanekeeperError::MissingInput(_)) => missing.push(repo.repo_id.clone()),
            Err(e) => return Err(e),
        }
    }
    if !missing.is_empty() {
        return Err(LanekeeperError::MissingInput(format!(
            "run `lanekeeper scan` first; repos without a scan: {}",
            missing.join(", ")
        )));
    }
    scans.sort_by(|a, b| a.repo_id.cmp(&b.repo_id));

    let lock = FileLock::acquire(
        &ops.orchestrate_lock_path(),
        ORCHESTRATE_STALE_MS,
        Some(json!({"operation": "knowledge_synthesize"})),
    )?;

    let inputs: Vec<IntegrationInput> = scans
        .iter()
        .map(|s| IntegrationInput {
            repo_id: s.repo_id.clone(),
            scanned_at: s.scanned_at.clone(),
            scan_version: s.scan_version,
        })
        .collect();

    let repos: Vec<RepoIntegration> = scans
        .iter()
        .map(|s| RepoIntegration {
            repo_id: s.repo_id.clone(),
            entrypoints: claims_with_prefix(s, ENTRYPOINT_PREFIX),
            api_contract_files: claims_with_prefix(s, CONTRACT_PREFIX),
            infra_files: claims_with_prefix(s, INFRA_PREFIX),
        })
        .collect();

    let mut cross_repo_contracts: Vec<String> = scans
        .iter()
        .flat_map(|s| {
            s.facts
                .iter()
                .filter(|f| f.claim.starts_with(CROSS_REPO_PREFIX))
                .map(|f| format!("{}: {}", s.repo_id, f.claim))
        })
        .collect();
    cross_repo_contracts.sort();

    let mut known_unknowns: Vec<String> = scans
        .iter()
        .flat_map(|s| s.unknowns.iter().cloned())
        .collect();
    known_unknowns.sort();

    let integration = Integration {
        version: 1,
        scope: "system".to_string(),
        generated_at: time::now_rfc3339(),
        inputs,
        integration_map: IntegrationMap { repos },
        cross_repo_contracts,
        known_unknowns,
    };

    // Baseline gap generator: a repo whose scan shows no contract file has
    // a missing-contract gap.
    let gaps: Vec<Gap> = integration
        .integration_map
        .repos
        .iter()
        .filter(|r| r.api_contract_files.is_empty())
        .map(|r| Gap {
            gap_id: format!("GAP-{}-missing-contract", r.repo_id),
            repo_id: r.repo_id.clone(),
            kind: "missing contract".to_string(),
            detail: format!(
                "repo '{}' exposes no API contract file; its interface is undocumented",
                r.repo_id
            ),
        })
        .collect();
    let gaps_doc = GapsDoc {
        version: 1,
        scope: "system".to_string(),
        generated_at: time::now_rfc3339(),
        gaps,
    };

    fsio::write_json_atomic(&knowledge.integration_path(), &integration)?;
    fsio::write_json_atomic(&knowledge.gaps_path(), &gaps_doc)?;
    fsio::write_json_atomic(&knowledge.integration_map_path(), &integration.integration_map)?;
    fsio::write_atomic(
        &knowledge.integration_md_path(),
        render_integration_md(&integration, &gaps_doc).as_bytes(),
    )?;

    lock.release()?;
    Ok((integration, gaps_doc))
}

fn render_integration_md(integration: &Integration, gaps: &GapsDoc) -> String {
    let mut md = String::new();
    md.push_str("# System Integration\n\n");
    md.push_str(&format!("Generated: {}\n\n", integration.generated_at));

    md.push_str("## Inputs\n\n");
    for input in &integration.inputs {
        md.push_str(&format!(
            "- {} (scan v{}, {})\n",
            input.repo_id, input.scan_version, input.scanned_at
        ));
    }

    md.push_str("\n## Repos\n\n");
    for repo in &integration.integration_map.repos {
        md.push_str(&format!("### {}\n\n", repo.repo_id));
        if !repo.entrypoints.is_empty() {
            md.push_str(&format!("- Entrypoints: {}\n", repo.entrypoints.join(", ")));
        }
        if !repo.api_contract_files.is_empty() {
            md.push_str(&format!(
                "- Contracts: {}\n",
                repo.api_contract_files.join(", ")
            ));
        }
        if !repo.infra_files.is_empty() {
            md.push_str(&format!("- Infra: {}\n", repo.infra_files.join(", ")));
        }
        md.push('\n');
    }

    if !integration.cross_repo_contracts.is_empty() {
        md.push_str("## Cross-repo contracts\n\n");
        for c in &integration.cross_repo_contracts {
            md.push_str(&format!("- {}\n", c));
        }
        md.push('\n');
    }

    md.push_str(&format!("## Gaps ({})\n\n", gaps.gaps.len()));
    for gap in &gaps.gaps {
        md.push_str(&format!("- `{}` {}\n", gap.gap_id, gap.detail));
    }

    if !integration.known_unknowns.is_empty() {
        md.push_str(&format!(
            "\n## Known unknowns ({})\n\n",
            integration.known_unknowns.len()
        ));
        for u in &integration.known_unknowns {
            md.push_str(&format!("- {}\n", u));
        }
    }
    md.push('\n');
    md
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::knowledge::evidence::Fact;
    use crate::knowledge::scan::Coverage;

    fn scan_with_facts(repo_id: &str, claims: &[&str]) -> KnowledgeScan {
        KnowledgeScan {
            version: 1,
            repo_id: repo_id.to_string(),
            scanned_at: "2026-02-01T00:00:00Z".to_string(),
            scan_version: 7,
            head_sha: "deadbee".to_string(),
            git_ref: "main".to_string(),
            external_knowledge: vec![],
            facts: claims
                .iter()
                .enumerate()
                .map(|(i, c)| Fact {
                    fact_id: format!("F_{}", i),
                    claim: (*c).to_string(),
                    evidence_ids: vec![format!("EVID_{}", i)],
                })
                .collect(),
            unknowns: vec![],
            contradictions: vec![],
            coverage: Coverage {
                files_seen: 10,
                files_indexed: 2,
            },
        }
    }

    #[test]
    fn test_claims_with_prefix_sorted_unique() {
        let scan = scan_with_facts(
            "a",
            &[
                "Entrypoint: src/main.rs",
                "Entrypoint: cmd/main.go",
                "Entrypoint: src/main.rs",
                "Infra file: Dockerfile",
            ],
        );
        assert_eq!(
            claims_with_prefix(&scan, ENTRYPOINT_PREFIX),
            vec!["cmd/main.go".to_string(), "src/main.rs".to_string()]
        );
        assert_eq!(
            claims_with_prefix(&scan, INFRA_PREFIX),
            vec!["Dockerfile".to_string()]
        );
    }

    #[test]
    fn test_render_integration_md_mentions_gaps() {
        let integration = Integration {
            version: 1,
            scope: "system".to_string(),
            generated_at: "2026-02-01T00:00:00Z".to_string(),
            inputs: vec![],
            integration_map: IntegrationMap { repos: vec![] },
            cross_repo_contracts: vec![],
            known_unknowns: vec![],
        };
        let gaps = GapsDoc {
            version: 1,
            scope: "system".to_string(),
            generated_at: "2026-02-01T00:00:00Z".to_string(),
            gaps: vec![Gap {
                gap_id: "GAP-a-missing-contract".to_string(),
                repo_id: "a".to_string(),
                kind: "missing contract".to_string(),
                detail: "repo 'a' exposes no API contract file".to_string(),
            }],
        };
        let md = render_integration_md(&integration, &gaps);
        assert!(md.contains("GAP-a-missing-contract"));
        assert!(md.contains("## Gaps (1)"));
    }
}
