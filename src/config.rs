use std::env;

use serde::Deserialize;

use crate::models::EntityType;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct GraphConfig {
    /// Deployment prefix for generated refcodes (`prefix:identifier`).
    pub refcode_prefix: String,
    /// Kinds dropped from the global graph unless they feed at least one edge.
    pub leaf_types: Vec<EntityType>,
    /// Default for queries that do not say whether to show collection links.
    pub hide_collections: bool,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            refcode_prefix: "elab".to_string(),
            leaf_types: vec![EntityType::StartingMaterials, EntityType::Equipment],
            hide_collections: true,
        }
    }
}

impl GraphConfig {
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(prefix) = env::var("ELAB_REFCODE_PREFIX") {
            let prefix = prefix.trim();
            if !prefix.is_empty() {
                config.refcode_prefix = prefix.to_string();
            }
        }
        if let Ok(raw) = env::var("ELAB_GRAPH_LEAF_TYPES") {
            config.leaf_types = parse_leaf_types(&raw);
        }
        if env_flag("ELAB_GRAPH_SHOW_COLLECTIONS") {
            config.hide_collections = false;
        }
        config
    }
}

fn parse_leaf_types(raw: &str) -> Vec<EntityType> {
    raw.split(',')
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .filter_map(|value| match value.parse::<EntityType>() {
            Ok(kind) => Some(kind),
            Err(_) => {
                tracing::warn!(value, "ignoring unknown leaf type in ELAB_GRAPH_LEAF_TYPES");
                None
            }
        })
        .collect()
}

pub fn env_flag(name: &str) -> bool {
    match env::var(name) {
        Ok(value) => {
            let normalized = value.trim().to_ascii_lowercase();
            normalized == "1" || normalized == "true" || normalized == "yes"
        }
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn leaf_types_skip_unknown_entries() {
        assert_eq!(
            parse_leaf_types("starting_materials, bogus,,cells"),
            vec![EntityType::StartingMaterials, EntityType::Cells]
        );
    }

    #[test]
    fn default_hides_collections() {
        let config = GraphConfig::default();
        assert!(config.hide_collections);
        assert_eq!(config.refcode_prefix, "elab");
    }
}
