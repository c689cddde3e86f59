//! System dependency graph, human override, and the pre-scan approval gate.
//!
//! The base graph is produced elsewhere; this module only derives the
//! effective graph (base with the override applied, deterministically
//! sorted) and enforces that scans run over an approved view.

use crate::core::error::LanekeeperError;
use crate::core::fsio;
use crate::core::layout::{KnowledgePaths, OpsPaths};
use crate::core::time;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeSet;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphEdge {
    pub from: String,
    pub to: String,
    #[serde(rename = "type")]
    pub edge_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub contract: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    #[serde(default)]
    pub evidence_refs: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExternalProject {
    pub project_code: String,
    pub knowledge_abs_path: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DependencyGraph {
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default)]
    pub nodes: Vec<String>,
    #[serde(default)]
    pub edges: Vec<GraphEdge>,
    #[serde(default)]
    pub external_projects: Vec<ExternalProject>,
}

fn default_version() -> u32 {
    1
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverrideStatus {
    Pending,
    Approved,
}

/// Key used by the override's `remove_edges` list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EdgeKey {
    pub from: String,
    pub to: String,
    #[serde(rename = "type")]
    pub edge_type: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphOverride {
    #[serde(default = "default_version")]
    pub version: u32,
    pub status: OverrideStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub approved_by: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub approved_at: Option<String>,
    #[serde(default)]
    pub add_edges: Vec<GraphEdge>,
    #[serde(default)]
    pub remove_edges: Vec<EdgeKey>,
    #[serde(default)]
    pub pin_external_projects: Vec<ExternalProject>,
}

/// Base graph with the override applied, deterministically sorted.
pub fn effective_graph(base: &DependencyGraph, ovr: Option<&GraphOverride>) -> DependencyGraph {
    let mut edges = base.edges.clone();
    let mut external = base.external_projects.clone();

    if let Some(ovr) = ovr {
        edges.retain(|e| {
            !ovr.remove_edges.iter().any(|k| {
                k.from == e.from && k.to == e.to && k.edge_type == e.edge_type
            })
        });
        for added in &ovr.add_edges {
            if !edges
                .iter()
                .any(|e| e.from == added.from && e.to == added.to && e.edge_type == added.edge_type)
            {
                edges.push(added.clone());
            }
        }
        for pinned in &ovr.pin_external_projects {
            if !external
                .iter()
                .any(|p| p.project_code == pinned.project_code)
            {
                external.push(pinned.clone());
            }
        }
    }

    edges.sort_by(|a, b| {
        (a.from.as_str(), a.to.as_str(), a.edge_type.as_str())
            .cmp(&(b.from.as_str(), b.to.as_str(), b.edge_type.as_str()))
    });
    external.sort_by(|a, b| a.project_code.cmp(&b.project_code));

    let nodes: BTreeSet<String> = base
        .nodes
        .iter()
        .cloned()
        .chain(edges.iter().flat_map(|e| [e.from.clone(), e.to.clone()]))
        .collect();

    DependencyGraph {
        version: 1,
        nodes: nodes.into_iter().collect(),
        edges,
        external_projects: external,
    }
}

pub fn load_base(knowledge: &KnowledgePaths) -> Result<DependencyGraph, LanekeeperError> {
    Ok(fsio::load_json_opt(&knowledge.dependency_graph_path())?.unwrap_or_default())
}

pub fn load_override(
    knowledge: &KnowledgePaths,
) -> Result<Option<GraphOverride>, LanekeeperError> {
    fsio::load_json_opt(&knowledge.dependency_graph_override_path())
}

/// The one pre-scan gate: refuse unless the override is `approved`, writing
/// a blocker document under Lane A blockers. `force` bypasses the refusal
/// but never marks the graph approved.
pub fn ensure_approved(
    ops: &OpsPaths,
    knowledge: &KnowledgePaths,
    force: bool,
) -> Result<DependencyGraph, LanekeeperError> {
    let base = load_base(knowledge)?;
    let ovr = load_override(knowledge)?;
    let effective = effective_graph(&base, ovr.as_ref());

    let approved = matches!(
        ovr.as_ref().map(|o| o.status),
        Some(OverrideStatus::Approved)
    );
    if approved || force {
        return Ok(effective);
    }

    let blocker_path = ops.lane_a_blockers().join("DEPS_NOT_APPROVED.json");
    let blocker = json!({
        "version": 1,
        "blocker": "deps_not_approved",
        "created_at": time::now_rfc3339(),
        "override_status": ovr.as_ref().map(|o| match o.status {
            OverrideStatus::Pending => "pending",
            OverrideStatus::Approved => "approved",
        }),
        "detail": "effective dependency graph requires approval before scanning",
        "suggestion": "review dependency_graph.override.json and run `lanekeeper graph approve --by <operator>`",
    });
    fsio::write_json_atomic(&blocker_path, &blocker)?;

    Err(LanekeeperError::DepsNotApproved(
        "dependency graph override is not approved; pass --force-deps to bypass".to_string(),
    ))
}

/// Mark the override approved (creating an empty one when absent).
pub fn approve(knowledge: &KnowledgePaths, by: &str) -> Result<GraphOverride, LanekeeperError> {
    let mut ovr = load_override(knowledge)?.unwrap_or(GraphOverride {
        version: 1,
        status: OverrideStatus::Pending,
        approved_by: None,
        approved_at: None,
        add_edges: vec![],
        remove_edges: vec![],
        pin_external_projects: vec![],
    });
    ovr.status = OverrideStatus::Approved;
    ovr.approved_by = Some(by.to_string());
    ovr.approved_at = Some(time::now_rfc3339());
    fsio::write_json_atomic(&knowledge.dependency_graph_override_path(), &ovr)?;
    Ok(ovr)
}
