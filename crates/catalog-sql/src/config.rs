//! Catalog service configuration.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Deployment-level knobs consulted by the introspector and DDL layer.
/// All fields default sensibly so an empty document is a valid config.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CatalogConfig {
    /// Refuse to load (or create) a relation without a primary key.
    pub require_primary_keys: bool,
    /// Drop the reserved storage schema and the database's own catalog
    /// schema from the introspected model.
    pub hide_internal_schemas: bool,
    /// Schema names treated as internal when hiding is enabled.
    pub internal_schemas: Vec<String>,
    /// Type names columns may not use.
    pub disallowed_types: BTreeSet<String>,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        CatalogConfig {
            require_primary_keys: true,
            hide_internal_schemas: true,
            internal_schemas: vec![crate::STORAGE_SCHEMA.to_string(), "pg_catalog".to_string()],
            disallowed_types: BTreeSet::new(),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn defaults() {
        let config: CatalogConfig = serde_json::from_str("{}").unwrap();
        assert!(config.require_primary_keys);
        assert!(config.hide_internal_schemas);
        assert_eq!(config.internal_schemas, vec!["_ermcat", "pg_catalog"]);
        assert!(config.disallowed_types.is_empty());
    }

    #[test]
    fn overrides() {
        let config: CatalogConfig = serde_json::from_value(serde_json::json!({
            "require_primary_keys": false,
            "disallowed_types": ["money"],
        }))
        .unwrap();
        assert!(!config.require_primary_keys);
        assert!(config.disallowed_types.contains("money"));

        assert!(serde_json::from_value::<CatalogConfig>(serde_json::json!({"bogus": 1})).is_err());
    }
}
