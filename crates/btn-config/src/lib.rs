//! btn-config
//!
//! Ruleset loading and identification, plus process settings.
//!
//! A ruleset is authored as one or more YAML layers. Layers are deep-merged in
//! order (earlier = base, later = override), converted to JSON, serialized in
//! canonical form and hashed with sha256. The hex digest is the `rules_hash`
//! that every persisted snapshot carries.

mod rules;
mod settings;

use anyhow::{Context, Result};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fs;

pub use rules::{RulesConfig, RulesError, Ruleset};
pub use settings::{Role, ServiceSettings, ENV_DATABASE_URL};

#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub config_hash: String,
    pub canonical_json: String,
    pub config_json: Value,
}

pub fn load_layered_yaml(paths: &[&str]) -> Result<LoadedConfig> {
    let mut docs: Vec<String> = Vec::new();
    for p in paths {
        let raw =
            fs::read_to_string(p).with_context(|| format!("failed to read yaml path: {p}"))?;
        docs.push(raw);
    }

    let doc_refs: Vec<&str> = docs.iter().map(|s| s.as_str()).collect();
    load_layered_yaml_from_strings(&doc_refs)
}

pub fn load_layered_yaml_from_strings(yaml_docs: &[&str]) -> Result<LoadedConfig> {
    let mut merged = serde_json::json!({});
    for raw in yaml_docs {
        let v_yaml: serde_yaml::Value = serde_yaml::from_str(raw).context("invalid yaml")?;
        let v_json = serde_json::to_value(v_yaml).context("yaml->json conversion failed")?;
        merged = deep_merge(merged, v_json);
    }

    let canonical_json = canonicalize_json(&merged)?;
    let config_hash = sha256_hex(canonical_json.as_bytes());
    Ok(LoadedConfig {
        config_hash,
        canonical_json,
        config_json: merged,
    })
}

/// Load, merge, validate and hash a ruleset from YAML layers on disk.
pub fn load_ruleset(paths: &[&str]) -> Result<Ruleset> {
    Ruleset::from_loaded(&load_layered_yaml(paths)?)
}

/// Same as [`load_ruleset`] but from in-memory YAML documents.
pub fn load_ruleset_from_strings(yaml_docs: &[&str]) -> Result<Ruleset> {
    Ruleset::from_loaded(&load_layered_yaml_from_strings(yaml_docs)?)
}

/// Hash an already-merged JSON document the same way layered YAML is hashed.
pub fn hash_json(v: &Value) -> Result<String> {
    Ok(sha256_hex(canonicalize_json(v)?.as_bytes()))
}

fn deep_merge(a: Value, b: Value) -> Value {
    match (a, b) {
        (Value::Object(mut a_map), Value::Object(b_map)) => {
            for (k, b_val) in b_map {
                let a_val = a_map.remove(&k).unwrap_or(Value::Null);
                a_map.insert(k, deep_merge(a_val, b_val));
            }
            Value::Object(a_map)
        }
        (_, b_other) => b_other,
    }
}

fn canonicalize_json(v: &Value) -> Result<String> {
    // serde_json::Map is BTreeMap-backed (no `preserve_order` in this workspace),
    // so object keys serialize sorted and the output is independent of the
    // key order in the source YAML.
    let s = serde_json::to_string(v).context("canonical json serialize failed")?;
    Ok(s)
}

fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    let out = hasher.finalize();
    hex::encode(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deep_merge_overrides_leaves_and_keeps_siblings() {
        let base = serde_json::json!({"a": {"x": 1, "y": 2}, "b": 3});
        let over = serde_json::json!({"a": {"y": 20}});
        let merged = deep_merge(base, over);
        assert_eq!(merged, serde_json::json!({"a": {"x": 1, "y": 20}, "b": 3}));
    }

    #[test]
    fn arrays_are_replaced_not_merged() {
        let base = serde_json::json!({"thresholds": [0.2, 0.5, 0.8]});
        let over = serde_json::json!({"thresholds": [0.3, 0.6, 0.9]});
        let merged = deep_merge(base, over);
        assert_eq!(merged["thresholds"], serde_json::json!([0.3, 0.6, 0.9]));
    }

    #[test]
    fn hash_json_matches_yaml_pipeline() {
        let loaded = load_layered_yaml_from_strings(&["b: 2\na: 1\n"]).unwrap();
        let direct = hash_json(&serde_json::json!({"a": 1, "b": 2})).unwrap();
        assert_eq!(loaded.config_hash, direct);
        assert_eq!(loaded.canonical_json, r#"{"a":1,"b":2}"#);
    }
}
