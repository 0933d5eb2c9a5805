//! Node pools: named partitions of the fleet.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use fleet_id::is_valid_name;

use crate::error::ValidationErrors;
use crate::hash::ContentHash;

pub const NODE_POOL_ALL: &str = "all";
pub const NODE_POOL_DEFAULT: &str = "default";

/// Longest description a pool may carry.
pub const MAX_NODE_POOL_DESCRIPTION_LENGTH: usize = 256;

/// Scheduler settings a pool overrides.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodePoolSchedulerConfiguration {
    /// `binpack` or `spread`; empty inherits the cluster setting.
    #[serde(default)]
    pub scheduler_algorithm: String,
    /// `None` inherits the cluster setting.
    #[serde(default)]
    pub memory_oversubscription_enabled: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodePool {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub meta: BTreeMap<String, String>,
    #[serde(default)]
    pub scheduler_configuration: Option<NodePoolSchedulerConfiguration>,
    /// Replication hash, see [`NodePool::set_hash`].
    #[serde(default)]
    pub hash: String,
    #[serde(default)]
    pub create_index: u64,
    #[serde(default)]
    pub modify_index: u64,
}

#[derive(Serialize)]
struct HashFields<'a> {
    name: &'a str,
    description: &'a str,
    scheduler_algorithm: Option<&'a str>,
    memory_oversubscription_enabled: Option<bool>,
    meta: &'a BTreeMap<String, String>,
}

impl NodePool {
    /// Pool that contains every node.
    pub fn all() -> Self {
        Self {
            name: NODE_POOL_ALL.to_string(),
            description: "Node pool with all nodes in the cluster.".to_string(),
            ..Self::default()
        }
    }

    /// Pool nodes join when they name none.
    pub fn default_pool() -> Self {
        Self {
            name: NODE_POOL_DEFAULT.to_string(),
            description: "Default node pool.".to_string(),
            ..Self::default()
        }
    }

    /// Returns true for the pools that always exist and cannot be deleted.
    pub fn is_built_in(&self) -> bool {
        is_built_in_node_pool(&self.name)
    }

    pub fn validate(&self) -> Result<(), ValidationErrors> {
        let mut errs = ValidationErrors::new();
        if !is_valid_name(&self.name) {
            errs.push(format!("invalid name {:?}", self.name));
        }
        if self.description.chars().count() > MAX_NODE_POOL_DESCRIPTION_LENGTH {
            errs.push(format!(
                "description longer than {MAX_NODE_POOL_DESCRIPTION_LENGTH}"
            ));
        }
        if let Some(config) = &self.scheduler_configuration {
            match config.scheduler_algorithm.as_str() {
                "" | "binpack" | "spread" => {}
                other => errs.push(format!("invalid scheduler algorithm {other:?}")),
            }
        }
        errs.into_result()
    }

    /// Memory oversubscription setting, falling back to the cluster value.
    pub fn memory_oversubscription_enabled(&self, cluster: bool) -> bool {
        self.scheduler_configuration
            .as_ref()
            .and_then(|c| c.memory_oversubscription_enabled)
            .unwrap_or(cluster)
    }

    /// Recomputes [`NodePool::hash`] over name, description, scheduler
    /// overrides and meta.
    pub fn set_hash(&mut self) -> Result<(), serde_json::Error> {
        let config = self.scheduler_configuration.as_ref();
        let fields = HashFields {
            name: &self.name,
            description: &self.description,
            scheduler_algorithm: config
                .map(|c| c.scheduler_algorithm.as_str())
                .filter(|a| !a.is_empty()),
            memory_oversubscription_enabled: config
                .and_then(|c| c.memory_oversubscription_enabled),
            meta: &self.meta,
        };
        self.hash = ContentHash::of(&fields)?.to_string();
        Ok(())
    }
}

/// Returns true for `all` and `default`.
pub fn is_built_in_node_pool(name: &str) -> bool {
    name == NODE_POOL_ALL || name == NODE_POOL_DEFAULT
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_built_in_pools() {
        assert!(NodePool::all().is_built_in());
        assert!(NodePool::default_pool().is_built_in());
        assert!(NodePool::all().validate().is_ok());
        let custom = NodePool {
            name: "gpu".into(),
            ..NodePool::default()
        };
        assert!(!custom.is_built_in());
    }

    #[rstest]
    #[case("dev-pool_1", true)]
    #[case("", false)]
    #[case("has space", false)]
    #[case("dot.name", false)]
    fn test_pool_names(#[case] name: &str, #[case] ok: bool) {
        let pool = NodePool {
            name: name.into(),
            ..NodePool::default()
        };
        assert_eq!(pool.validate().is_ok(), ok);
    }

    #[test]
    fn test_description_and_algorithm() {
        let pool = NodePool {
            name: "batch".into(),
            description: "x".repeat(MAX_NODE_POOL_DESCRIPTION_LENGTH + 1),
            scheduler_configuration: Some(NodePoolSchedulerConfiguration {
                scheduler_algorithm: "random".into(),
                memory_oversubscription_enabled: None,
            }),
            ..NodePool::default()
        };
        let errs = pool.validate().unwrap_err();
        assert!(errs.contains("description longer than 256"));
        assert!(errs.contains("invalid scheduler algorithm \"random\""));
    }

    #[test]
    fn test_hash_tracks_fields() {
        let mut a = NodePool {
            name: "batch".into(),
            meta: BTreeMap::from([("team".into(), "data".into()), ("env".into(), "prod".into())]),
            ..NodePool::default()
        };
        let mut b = a.clone();
        a.set_hash().unwrap();
        b.modify_index = 42;
        b.set_hash().unwrap();
        assert_eq!(a.hash, b.hash);

        b.scheduler_configuration = Some(NodePoolSchedulerConfiguration {
            scheduler_algorithm: "spread".into(),
            memory_oversubscription_enabled: Some(true),
        });
        b.set_hash().unwrap();
        assert_ne!(a.hash, b.hash);
        assert!(b.memory_oversubscription_enabled(false));
        assert!(!a.memory_oversubscription_enabled(false));
    }
}
