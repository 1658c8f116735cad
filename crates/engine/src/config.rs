use std::path::PathBuf;

use serde::Deserialize;
use tracing::warn;

use defsmith_schema::DEFAULT_SCHEMA_PREFIX;

/// Engine knobs. Every field has a `DEFSMITH_*` environment override.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EngineConfig {
    /// Inserted between the capability type and the owner name of schema artifacts.
    pub schema_prefix: String,
    /// Bound on conditional-update retries per reconciliation step.
    pub max_conflict_retries: u32,
    /// Namespace searched when a definition is not found in the requested one.
    pub system_namespace: String,
    pub db_path: Option<PathBuf>,
    /// Capacity of the coalescing reconcile queue.
    pub queue_cap: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            schema_prefix: DEFAULT_SCHEMA_PREFIX.to_string(),
            max_conflict_retries: 5,
            system_namespace: "vela-system".to_string(),
            db_path: None,
            queue_cap: 2048,
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|k| std::env::var(k).ok())
    }

    /// Build from an arbitrary variable source; unparsable values keep the default.
    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Self {
        let mut cfg = Self::default();
        if let Some(p) = get("DEFSMITH_SCHEMA_PREFIX") {
            cfg.schema_prefix = p;
        }
        if let Some(ns) = get("DEFSMITH_SYSTEM_NAMESPACE").filter(|s| !s.is_empty()) {
            cfg.system_namespace = ns;
        }
        if let Some(p) = get("DEFSMITH_DB_PATH").filter(|s| !s.is_empty()) {
            cfg.db_path = Some(PathBuf::from(p));
        }
        cfg.max_conflict_retries = parse_or(&get, "DEFSMITH_MAX_CONFLICT_RETRIES", cfg.max_conflict_retries).max(1);
        cfg.queue_cap = parse_or(&get, "DEFSMITH_QUEUE_CAP", cfg.queue_cap).max(1);
        cfg
    }
}

fn parse_or<T: std::str::FromStr + Copy + std::fmt::Display>(get: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T {
    match get(key) {
        None => default,
        Some(raw) => match raw.trim().parse::<T>() {
            Ok(v) => v,
            Err(_) => {
                warn!(key, value = %raw, default = %default, "config: invalid value; using default");
                default
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let m: HashMap<String, String> = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |k| m.get(k).cloned()
    }

    #[test]
    fn defaults_without_env() {
        let cfg = EngineConfig::from_lookup(|_| None);
        assert_eq!(cfg, EngineConfig::default());
        assert_eq!(cfg.schema_prefix, "schema-");
        assert_eq!(cfg.max_conflict_retries, 5);
        assert_eq!(cfg.queue_cap, 2048);
    }

    #[test]
    fn env_overrides_and_bad_values() {
        let cfg = EngineConfig::from_lookup(lookup(&[
            ("DEFSMITH_SCHEMA_PREFIX", ""),
            ("DEFSMITH_MAX_CONFLICT_RETRIES", "many"),
            ("DEFSMITH_QUEUE_CAP", "64"),
            ("DEFSMITH_DB_PATH", "/tmp/d.db"),
        ]));
        assert_eq!(cfg.schema_prefix, "");
        assert_eq!(cfg.max_conflict_retries, 5);
        assert_eq!(cfg.queue_cap, 64);
        assert_eq!(cfg.db_path, Some(PathBuf::from("/tmp/d.db")));
    }

    #[test]
    fn deserializes_partial_documents() {
        let cfg: EngineConfig = serde_json::from_value(serde_json::json!({ "schemaPrefix": "s-" })).unwrap();
        assert_eq!(cfg.schema_prefix, "s-");
        assert_eq!(cfg.queue_cap, 2048);
    }
}
