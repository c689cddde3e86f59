//! QA-pack invariant merge (downstream consumer of the knowledge root).
//!
//! Committee outputs under `qa/committee/*.json` each carry an `invariants`
//! array. The merge folds them into `qa/invariants.json`, deduplicated and
//! sorted by id. A content-hash short-circuit makes re-runs with no new
//! committee outputs report `committed = false` without touching the pack.

use crate::core::error::LanekeeperError;
use crate::core::fsio;
use crate::core::layout::KnowledgePaths;
use crate::core::time;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QaInvariant {
    pub id: String,
    pub statement: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

#[derive(Debug)]
pub struct QaPackUpdate {
    pub committed: bool,
    pub invariant_count: usize,
}

fn state_path(knowledge: &KnowledgePaths) -> std::path::PathBuf {
    knowledge.qa_dir().join(".qa_pack_state.json")
}

/// Merge committee invariant outputs into `qa/invariants.json`.
pub fn run_qa_pack_update(knowledge: &KnowledgePaths) -> Result<QaPackUpdate, LanekeeperError> {
    let committee_dir = knowledge.qa_dir().join("committee");
    let mut inputs: Vec<std::path::PathBuf> = if committee_dir.exists() {
        fs::read_dir(&committee_dir)?
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| p.extension().and_then(|e| e.to_str()) == Some("json"))
            .collect()
    } else {
        Vec::new()
    };
    inputs.sort();

    let mut hasher = Sha256::new();
    let mut merged: BTreeMap<String, QaInvariant> = BTreeMap::new();
    for path in &inputs {
        let bytes = fs::read(path)?;
        hasher.update(&bytes);
        let doc: Value = serde_json::from_slice(&bytes).map_err(|e| {
            LanekeeperError::Malformed(format!("{}: {}", path.display(), e))
        })?;
        let Some(items) = doc.get("invariants").and_then(Value::as_array) else {
            continue;
        };
        for item in items {
            let inv: QaInvariant = serde_json::from_value(item.clone()).map_err(|e| {
                LanekeeperError::Malformed(format!("{}: invariant: {}", path.display(), e))
            })?;
            merged.insert(inv.id.clone(), inv);
        }
    }
    let input_hash = format!("{:x}", hasher.finalize());

    let previous: Option<Value> = fsio::load_json_opt(&state_path(knowledge))?;
    let unchanged = previous
        .as_ref()
        .and_then(|v| v.get("last_input_hash"))
        .and_then(Value::as_str)
        == Some(input_hash.as_str());
    if unchanged {
        return Ok(QaPackUpdate {
            committed: false,
            invariant_count: merged.len(),
        });
    }

    let invariants: Vec<&QaInvariant> = merged.values().collect();
    fsio::write_json_atomic(
        &knowledge.qa_dir().join("invariants.json"),
        &json!({
            "version": 1,
            "generated_at": time::now_rfc3339(),
            "invariants": invariants,
        }),
    )?;
    fsio::write_json_atomic(
        &state_path(knowledge),
        &json!({
            "version": 1,
            "last_input_hash": input_hash,
            "updated_at": time::now_rfc3339(),
        }),
    )?;

    Ok(QaPackUpdate {
        committed: true,
        invariant_count: merged.len(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_second_run_without_new_inputs_does_not_commit() {
        let tmp = tempdir().expect("tempdir");
        let knowledge = KnowledgePaths::new(tmp.path().join("knowledge"));
        let committee = knowledge.qa_dir().join("committee");
        fs::create_dir_all(&committee).unwrap();
        fs::write(
            committee.join("alpha.json"),
            r#"{"invariants":[{"id":"INV-1","statement":"bundles are reproducible"}]}"#,
        )
        .unwrap();

        let first = run_qa_pack_update(&knowledge).unwrap();
        assert!(first.committed);
        assert_eq!(first.invariant_count, 1);
        assert!(knowledge.qa_dir().join("invariants.json").exists());

        let second = run_qa_pack_update(&knowledge).unwrap();
        assert!(!second.committed);

        fs::write(
            committee.join("beta.json"),
            r#"{"invariants":[{"id":"INV-2","statement":"event log is append-only"}]}"#,
        )
        .unwrap();
        let third = run_qa_pack_update(&knowledge).unwrap();
        assert!(third.committed);
        assert_eq!(third.invariant_count, 2);
    }

    #[test]
    fn test_duplicate_ids_are_merged() {
        let tmp = tempdir().expect("tempdir");
        let knowledge = KnowledgePaths::new(tmp.path().join("knowledge"));
        let committee = knowledge.qa_dir().join("committee");
        fs::create_dir_all(&committee).unwrap();
        fs::write(
            committee.join("a.json"),
            r#"{"invariants":[{"id":"INV-1","statement":"old"}]}"#,
        )
        .unwrap();
        fs::write(
            committee.join("b.json"),
            r#"{"invariants":[{"id":"INV-1","statement":"new"}]}"#,
        )
        .unwrap();
        let update = run_qa_pack_update(&knowledge).unwrap();
        assert!(update.committed);
        assert_eq!(update.invariant_count, 1);
    }
}
