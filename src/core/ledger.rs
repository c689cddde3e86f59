//! Append-only lane ledgers.
//!
//! Both lanes keep an audit trail as single-line JSON records. Guards write
//! a ledger line for every refusal and every override; the ledger is never
//! rewritten in place.

use crate::core::error::LanekeeperError;
use crate::core::fsio;
use crate::core::time;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerLine {
    pub version: u32,
    pub ts: String,
    pub actor: String,
    pub action: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl LedgerLine {
    pub fn new(actor: &str, action: &str) -> LedgerLine {
        LedgerLine {
            version: 1,
            ts: time::now_rfc3339(),
            actor: actor.to_string(),
            action: action.to_string(),
            scope: None,
            reason_code: None,
            details: None,
        }
    }

    pub fn with_scope(mut self, scope: &str) -> LedgerLine {
        self.scope = Some(scope.to_string());
        self
    }

    pub fn with_reason_code(mut self, code: &str) -> LedgerLine {
        self.reason_code = Some(code.to_string());
        self
    }

    pub fn with_details(mut self, details: Value) -> LedgerLine {
        self.details = Some(details);
        self
    }
}

/// Append a ledger line at `ledger_path` (resolved absolute, under the ops root).
pub fn append(ledger_path: &Path, line: &LedgerLine) -> Result<(), LanekeeperError> {
    fsio::append_jsonl(ledger_path, line)
}
