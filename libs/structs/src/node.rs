//! Client nodes.
//!
//! Two nodes that differ only in per-instance values (`unique.` attributes and
//! meta) share a computed class, which feasibility checks use as a cache key.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use fleet_id::{NodeId, SigningKeyId};

use crate::hash::ContentHash;
use crate::job::DEFAULT_NODE_POOL;
use crate::resources::{ComparableResources, NodeReservedResources, NodeResources};
use crate::time::{add_duration, from_unix_nanos};

/// Prefix of attribute and meta keys excluded from the computed class.
pub const UNIQUE_NAMESPACE: &str = "unique.";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    #[default]
    Initializing,
    Ready,
    Maintenance,
    Drain,
    /// Missed heartbeats but inside the disconnect window of its allocations.
    Disconnected,
    Down,
}

impl NodeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initializing => "initializing",
            Self::Ready => "ready",
            Self::Maintenance => "maintenance",
            Self::Drain => "drain",
            Self::Disconnected => "disconnected",
            Self::Down => "down",
        }
    }

    /// Returns true if the status is final.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Down)
    }
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SchedulingEligibility {
    #[default]
    Eligible,
    Ineligible,
}

/// A schedulable client.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub datacenter: String,
    pub name: String,
    #[serde(default)]
    pub http_addr: String,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
    #[serde(default)]
    pub links: BTreeMap<String, String>,
    #[serde(default)]
    pub meta: BTreeMap<String, String>,
    #[serde(default)]
    pub node_class: String,
    #[serde(default)]
    pub node_pool: String,
    #[serde(default)]
    pub node_resources: Option<NodeResources>,
    #[serde(default)]
    pub reserved_resources: Option<NodeReservedResources>,
    /// Hash of the scheduling-relevant fields, see [`Node::compute_class`].
    #[serde(default)]
    pub computed_class: String,
    #[serde(default)]
    pub drain: bool,
    #[serde(default)]
    pub scheduling_eligibility: SchedulingEligibility,
    #[serde(default)]
    pub status: NodeStatus,
    #[serde(default)]
    pub status_description: String,
    /// Unix seconds of the last status change.
    #[serde(default)]
    pub status_updated_at: i64,
    /// Key that signed the node's current identity.
    #[serde(default)]
    pub identity_signing_key_id: SigningKeyId,
    /// Unix nanoseconds at which the node's identity expires; zero if none.
    #[serde(default)]
    pub identity_expiry: i64,
    #[serde(default)]
    pub create_index: u64,
    #[serde(default)]
    pub modify_index: u64,
}

/// Projection of the fields that decide feasibility.
#[derive(Serialize)]
struct ClassFields<'a> {
    datacenter: &'a str,
    attributes: BTreeMap<&'a str, &'a str>,
    meta: BTreeMap<&'a str, &'a str>,
    node_class: &'a str,
    node_pool: &'a str,
    node_resources: &'a Option<NodeResources>,
}

fn without_unique(map: &BTreeMap<String, String>) -> BTreeMap<&str, &str> {
    map.iter()
        .filter(|(k, _)| !k.starts_with(UNIQUE_NAMESPACE))
        .map(|(k, v)| (k.as_str(), v.as_str()))
        .collect()
}

impl Node {
    /// Fills defaults for fields older clients do not send.
    pub fn canonicalize(&mut self) {
        if self.node_pool.is_empty() {
            self.node_pool = DEFAULT_NODE_POOL.to_string();
        }
        if self.drain {
            self.scheduling_eligibility = SchedulingEligibility::Ineligible;
        }
    }

    /// Recomputes [`Node::computed_class`].
    pub fn compute_class(&mut self) -> Result<(), serde_json::Error> {
        let fields = ClassFields {
            datacenter: &self.datacenter,
            attributes: without_unique(&self.attributes),
            meta: without_unique(&self.meta),
            node_class: &self.node_class,
            node_pool: &self.node_pool,
            node_resources: &self.node_resources,
        };
        self.computed_class = ContentHash::of(&fields)?.to_string();
        Ok(())
    }

    /// Returns true if the node can receive new placements.
    pub fn ready(&self) -> bool {
        self.status == NodeStatus::Ready
            && !self.drain
            && self.scheduling_eligibility == SchedulingEligibility::Eligible
    }

    pub fn terminal_status(&self) -> bool {
        self.status.is_terminal()
    }

    /// Resources left for workloads once the operator reservation is taken
    /// out.
    pub fn comparable_available(&self) -> ComparableResources {
        let mut available = self
            .node_resources
            .as_ref()
            .map(NodeResources::comparable)
            .unwrap_or_default();
        if let Some(reserved) = &self.reserved_resources {
            available.subtract(&reserved.comparable());
        }
        available
    }

    /// Expiry of the node's identity, if it has one.
    pub fn identity_expiry(&self) -> Option<DateTime<Utc>> {
        (self.identity_expiry != 0).then(|| from_unix_nanos(self.identity_expiry))
    }

    /// Returns true if a node that last heartbeated at `last_heartbeat` has
    /// outlived `grace` by `now`.
    pub fn heartbeat_expired(
        last_heartbeat: DateTime<Utc>,
        grace: Duration,
        now: DateTime<Utc>,
    ) -> bool {
        add_duration(last_heartbeat, grace) <= now
    }
}
