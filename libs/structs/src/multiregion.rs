//! Multiregion deployment configuration.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::ValidationErrors;

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MultiregionStrategy {
    /// Regions deploying at once; zero means all.
    pub max_parallel: u32,
    /// `fail_all`, `fail_local`, or empty.
    #[serde(default)]
    pub on_failure: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MultiregionRegion {
    pub name: String,
    pub count: u32,
    #[serde(default)]
    pub datacenters: Vec<String>,
    #[serde(default)]
    pub node_pool: String,
    #[serde(default)]
    pub meta: BTreeMap<String, String>,
}

/// Deploys one job across several regions in lockstep.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Multiregion {
    pub strategy: Option<MultiregionStrategy>,
    #[serde(default)]
    pub regions: Vec<MultiregionRegion>,
}

impl Multiregion {
    pub fn validate(&self) -> Result<(), ValidationErrors> {
        let mut errs = ValidationErrors::new();
        let mut seen = BTreeMap::new();
        for (idx, region) in self.regions.iter().enumerate() {
            if region.name.is_empty() {
                errs.push(format!("Multiregion region {} missing name", idx + 1));
                continue;
            }
            if let Some(first) = seen.insert(region.name.as_str(), idx + 1) {
                errs.push(format!(
                    "Multiregion region {} redefines {:?} from region {}",
                    idx + 1,
                    region.name,
                    first
                ));
            }
        }
        if let Some(strategy) = &self.strategy {
            match strategy.on_failure.as_str() {
                "" | "fail_all" | "fail_local" => {}
                other => errs.push(format!(
                    "Multiregion on_failure must be fail_all or fail_local (got {other:?})"
                )),
            }
        }
        errs.into_result()
    }

    /// Looks up a region by name.
    pub fn region(&self, name: &str) -> Option<&MultiregionRegion> {
        self.regions.iter().find(|r| r.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn region(name: &str) -> MultiregionRegion {
        MultiregionRegion {
            name: name.to_string(),
            count: 1,
            ..MultiregionRegion::default()
        }
    }

    #[test]
    fn test_unique_regions() {
        let mr = Multiregion {
            strategy: None,
            regions: vec![region("east"), region("west"), region("east"), region("")],
        };
        let errs = mr.validate().unwrap_err();
        assert!(errs.contains("Multiregion region 3 redefines \"east\" from region 1"));
        assert!(errs.contains("Multiregion region 4 missing name"));
        assert_eq!(errs.len(), 2);
    }

    #[test]
    fn test_on_failure() {
        let mut mr = Multiregion {
            strategy: Some(MultiregionStrategy {
                max_parallel: 1,
                on_failure: "fail_all".into(),
            }),
            regions: vec![region("east")],
        };
        assert!(mr.validate().is_ok());
        assert!(mr.region("east").is_some());
        mr.strategy = Some(MultiregionStrategy {
            max_parallel: 1,
            on_failure: "retry".into(),
        });
        assert!(mr.validate().is_err());
    }
}
