//! Deterministic cache-key derivation for Tier 2.
//!
//! Parameters are normalized to a canonical form before hashing so that
//! logically equal parameter bags produce the same key. Normalization is an
//! explicit stage returning `Normalized | Rejected`; key construction is
//! total on `Normalized`.

use chrono::{DateTime, Utc};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::error::{GlobalIndexError, Result};

const MAX_DEPTH: usize = 32;

/// Canonicalized parameter bag, ready for hashing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedParams(String);

impl NormalizedParams {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Normalize a parameter object:
/// - maps are serialized with keys sorted, values normalized recursively,
/// - arrays tagged as sets must be pre-sorted by the caller (see
///   [`sorted_string_set`]), other arrays keep their order,
/// - timestamps must arrive as ISO 8601 strings (see [`iso8601`]).
///
/// Rejected shapes (non-cacheable): a non-object top level, non-string map
/// keys (impossible in JSON but kept for completeness), and nesting deeper
/// than an internal bound.
pub fn normalize_params(params: &Value) -> Result<NormalizedParams> {
    if !params.is_object() {
        return Err(GlobalIndexError::Cache(
            "query params must be a key/value map".into(),
        ));
    }
    let mut out = String::new();
    write_canonical(params, &mut out, 0)?;
    Ok(NormalizedParams(out))
}

fn write_canonical(value: &Value, out: &mut String, depth: usize) -> Result<()> {
    if depth > MAX_DEPTH {
        return Err(GlobalIndexError::Cache(format!(
            "params nested deeper than {MAX_DEPTH} levels"
        )));
    }
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        Value::Number(n) => {
            // serde_json numbers are always finite; canonical text form.
            out.push_str(&n.to_string());
        }
        Value::String(s) => {
            out.push('"');
            out.push_str(s);
            out.push('"');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out, depth + 1)?;
            }
            out.push(']');
        }
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push('"');
                out.push_str(key);
                out.push_str("\":");
                write_canonical(&map[key.as_str()], out, depth + 1)?;
            }
            out.push('}');
        }
    }
    Ok(())
}

/// Derive the cache key: `<query_type>:<first 16 hex of sha256(normalized)>`.
pub fn derive_cache_key(query_type: &str, params: &Value) -> Result<String> {
    let normalized = normalize_params(params)?;
    let mut hasher = Sha256::new();
    hasher.update(normalized.as_str().as_bytes());
    let digest = hasher.finalize();
    let hex: String = digest.iter().take(8).map(|b| format!("{b:02x}")).collect();
    Ok(format!("{query_type}:{hex}"))
}

/// Canonical form for set-valued parameters: sorted, deduplicated.
pub fn sorted_string_set<I, S>(items: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let mut v: Vec<String> = items.into_iter().map(Into::into).collect();
    v.sort();
    v.dedup();
    v
}

/// Canonical timestamp form for parameter bags.
pub fn iso8601(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn key_is_deterministic_across_field_order() {
        let a = json!({"pattern": "foo", "projects": ["a", "b"], "fuzzy": false});
        let b = json!({"fuzzy": false, "projects": ["a", "b"], "pattern": "foo"});
        assert_eq!(normalize_params(&a).unwrap(), normalize_params(&b).unwrap());
        assert_eq!(
            derive_cache_key("cross_project_search", &a).unwrap(),
            derive_cache_key("cross_project_search", &b).unwrap()
        );
    }

    #[test]
    fn key_format_is_type_colon_16hex() {
        let key = derive_cache_key("dashboard", &json!({})).unwrap();
        let (prefix, hex) = key.split_once(':').unwrap();
        assert_eq!(prefix, "dashboard");
        assert_eq!(hex.len(), 16);
        assert!(hex.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn different_params_different_keys() {
        let a = derive_cache_key("search", &json!({"q": "alpha"})).unwrap();
        let b = derive_cache_key("search", &json!({"q": "beta"})).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn nested_maps_sorted_recursively() {
        let a = json!({"outer": {"z": 1, "a": 2}});
        let b = json!({"outer": {"a": 2, "z": 1}});
        assert_eq!(normalize_params(&a).unwrap(), normalize_params(&b).unwrap());
    }

    #[test]
    fn non_object_params_rejected() {
        assert!(normalize_params(&json!("just a string")).is_err());
        assert!(normalize_params(&json!([1, 2, 3])).is_err());
    }

    #[test]
    fn deep_nesting_rejected() {
        let mut v = json!({});
        for _ in 0..40 {
            v = json!({ "k": v });
        }
        assert!(normalize_params(&v).is_err());
    }

    #[test]
    fn set_helper_sorts_and_dedups() {
        assert_eq!(sorted_string_set(["b", "a", "b"]), vec!["a", "b"]);
    }

    #[test]
    fn timestamps_canonicalize_through_iso8601() {
        use chrono::TimeZone;
        let dt = Utc.with_ymd_and_hms(2026, 3, 1, 12, 30, 0).unwrap();
        let a = json!({"since": iso8601(dt)});
        let b = json!({"since": "2026-03-01T12:30:00+00:00"});
        assert_eq!(
            derive_cache_key("search", &a).unwrap(),
            derive_cache_key("search", &b).unwrap()
        );
    }
}
