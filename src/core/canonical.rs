//! Deterministic JSON canonicalization.
//!
//! This is the only serializer used for bundle inputs and manifests, so that
//! content hashes are stable across runs: keys are sorted lexicographically,
//! volatile timestamp keys are rewritten to a fixed epoch constant, and the
//! output is 2-space-indented JSON with a trailing newline.

use serde_json::{Map, Value};

/// Closed set of keys whose values are rewritten before hashing.
const VOLATILE_TS_KEYS: [&str; 7] = [
    "generated_at",
    "captured_at",
    "scanned_at",
    "updated_at",
    "last_seen_at",
    "run_at",
    "created_at",
];

const EPOCH_RFC3339: &str = "1970-01-01T00:00:00.000Z";
/// `scanned_at` inside a `scan.json` uses the compact stamp format.
const EPOCH_COMPACT: &str = "19700101_000000000";

/// Canonicalize `value` for the document at `logical_path`.
///
/// Returns the canonical text: sorted keys, volatile timestamps pinned,
/// 2-space indent, trailing newline.
pub fn canonicalize_json(value: &Value, logical_path: &str) -> String {
    let scan_style = logical_path.ends_with("/scan.json") || logical_path == "scan.json";
    let normalized = normalize(value, scan_style);
    let mut out = serde_json::to_string_pretty(&normalized)
        .unwrap_or_else(|_| "null".to_string());
    out.push('\n');
    out
}

/// Canonical bytes of `value`, suitable for hashing.
pub fn canonical_bytes(value: &Value, logical_path: &str) -> Vec<u8> {
    canonicalize_json(value, logical_path).into_bytes()
}

fn normalize(value: &Value, scan_style: bool) -> Value {
    match value {
        Value::Object(obj) => {
            // serde_json's default Map is a BTreeMap, so rebuilding the
            // object also yields lexicographically sorted keys.
            let mut sorted = Map::new();
            for (key, val) in obj {
                let replaced = if VOLATILE_TS_KEYS.contains(&key.as_str()) {
                    if key == "scanned_at" && scan_style {
                        Value::String(EPOCH_COMPACT.to_string())
                    } else {
                        Value::String(EPOCH_RFC3339.to_string())
                    }
                } else {
                    normalize(val, scan_style)
                };
                sorted.insert(key.clone(), replaced);
            }
            Value::Object(sorted)
        }
        Value::Array(items) => {
            Value::Array(items.iter().map(|v| normalize(v, scan_style)).collect())
        }
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_keys_sorted_and_indented() {
        let v = json!({"zeta": 1, "alpha": {"m": 2, "a": 3}});
        let out = canonicalize_json(&v, "x.json");
        let expected = "{\n  \"alpha\": {\n    \"a\": 3,\n    \"m\": 2\n  },\n  \"zeta\": 1\n}\n";
        assert_eq!(out, expected);
    }

    #[test]
    fn test_volatile_timestamps_pinned() {
        let v = json!({"generated_at": "2026-02-10T12:00:00Z", "name": "m"});
        let out = canonicalize_json(&v, "views/integration_map.json");
        assert!(out.contains("\"1970-01-01T00:00:00.000Z\""));
        assert!(!out.contains("2026-02-10"));
    }

    #[test]
    fn test_scanned_at_compact_only_for_scan_json() {
        let v = json!({"scanned_at": "2026-02-10T12:00:00Z"});
        let scan = canonicalize_json(&v, "evidence/repos/a/scan.json");
        assert!(scan.contains("\"19700101_000000000\""));
        let other = canonicalize_json(&v, "evidence/repos/a/repo_index.json");
        assert!(other.contains("\"1970-01-01T00:00:00.000Z\""));
    }

    #[test]
    fn test_nested_volatile_keys_rewritten() {
        let v = json!({"inputs": [{"repo_id": "a", "captured_at": "2026-01-01T00:00:00Z"}]});
        let out = canonicalize_json(&v, "x.json");
        assert!(!out.contains("2026-01-01"));
    }

    #[test]
    fn test_canonicalize_parse_round_trip_is_idempotent() {
        let v = json!({
            "b": [3, 1, {"updated_at": "2025-12-31T23:59:59Z", "k": null}],
            "a": "text"
        });
        let once = canonicalize_json(&v, "doc.json");
        let reparsed: Value = serde_json::from_str(&once).unwrap();
        let twice = canonicalize_json(&reparsed, "doc.json");
        assert_eq!(once, twice);
    }

    #[test]
    fn test_trailing_newline() {
        let out = canonicalize_json(&json!({}), "x.json");
        assert!(out.ends_with("}\n"));
    }
}
