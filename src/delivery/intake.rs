//! Intake header grammar.
//!
//! An intake file starts with `key: value` header lines (case-insensitive
//! keys, trimmed values) terminated by the first blank or non-matching
//! line; everything after is free-form body text.

use crate::core::error::LanekeeperError;
use crate::knowledge::registry::repo_id_regex;
use std::collections::BTreeMap;
use std::fmt;

/// Header keys the grammar gives meaning to; anything else lands in `extra`.
pub const RECOGNIZED_KEYS: [&str; 5] = [
    "origin",
    "scope",
    "intake_approval_id",
    "knowledge_version",
    "sufficiency_override",
];

/// Governance scope: the granularity of every governance decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Scope {
    System,
    Repo(String),
}

impl Scope {
    pub fn parse(raw: &str) -> Result<Scope, LanekeeperError> {
        if raw == "system" {
            return Ok(Scope::System);
        }
        if let Some(id) = raw.strip_prefix("repo:") {
            if repo_id_regex().is_match(id) {
                return Ok(Scope::Repo(id.to_string()));
            }
        }
        Err(LanekeeperError::ContractViolation(format!(
            "scope '{}' is neither 'system' nor 'repo:<id>'",
            raw
        )))
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scope::System => write!(f, "system"),
            Scope::Repo(id) => write!(f, "repo:{}", id),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct IntakeHeader {
    pub origin: Option<String>,
    pub scope: Option<String>,
    pub intake_approval_id: Option<String>,
    pub knowledge_version: Option<String>,
    pub sufficiency_override: bool,
    /// Unrecognized keys, preserved for diagnostics.
    pub extra: BTreeMap<String, String>,
    /// Free-form text after the header block.
    pub body: String,
}

impl IntakeHeader {
    pub fn is_lane_a(&self) -> bool {
        self.origin.as_deref() == Some("lane_a")
    }
}

/// Parse the header block at the top of an intake file.
pub fn parse_intake(text: &str) -> IntakeHeader {
    let mut header = IntakeHeader::default();
    let mut body_lines: Vec<&str> = Vec::new();
    let mut in_header = true;

    for line in text.lines() {
        if in_header {
            let trimmed = line.trim();
            if trimmed.is_empty() {
                in_header = false;
                continue;
            }
            if let Some((raw_key, raw_value)) = trimmed.split_once(':') {
                let key = raw_key.trim().to_ascii_lowercase();
                let value = raw_value.trim().to_string();
                match key.as_str() {
                    "origin" => header.origin = Some(value),
                    "scope" => header.scope = Some(value),
                    "intake_approval_id" => header.intake_approval_id = Some(value),
                    "knowledge_version" => header.knowledge_version = Some(value),
                    "sufficiency_override" => {
                        header.sufficiency_override = value.eq_ignore_ascii_case("true")
                    }
                    _ => {
                        header.extra.insert(key, value);
                    }
                }
                continue;
            }
            in_header = false;
        }
        body_lines.push(line);
    }
    header.body = body_lines.join("\n");
    header
}
