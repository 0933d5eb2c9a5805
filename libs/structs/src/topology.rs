//! Processor topology of a client node.
//!
//! Topology discovery happens on the client; the core only consumes the
//! result. Older clients report a flat [`LegacyNodeCpuResources`] which is
//! upgraded into a single NUMA node topology on read.

use serde::{Deserialize, Serialize};

/// Performance class of a core.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoreGrade {
    #[default]
    Performance,
    Efficiency,
}

/// A single schedulable core.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Core {
    /// Socket the core sits on.
    pub socket_id: u8,
    /// NUMA node the core belongs to.
    pub node_id: u8,
    /// Core ID, unique across the node.
    pub id: u16,
    pub grade: CoreGrade,
    /// Withheld from scheduling (not in the reservable set).
    pub disable: bool,
    /// Base frequency in MHz.
    pub base_speed: u64,
    pub max_speed: u64,
    /// Speed was estimated rather than read from the hardware.
    pub guess_speed: bool,
}

/// NUMA-aware layout of the node's processors.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Topology {
    /// NUMA node IDs present on the host.
    pub nodes: Vec<u8>,
    /// SLIT distance matrix indexed by NUMA node.
    pub distances: Vec<Vec<u16>>,
    pub cores: Vec<Core>,
    /// Operator override of the total compute, in MHz.
    pub override_total_compute: u64,
    /// Operator override of the compute withheld from scheduling, in MHz.
    pub override_witheld_compute: u64,
}

impl Topology {
    /// Total compute in MHz, before withholding.
    pub fn total_compute(&self) -> u64 {
        if self.override_total_compute > 0 {
            return self.override_total_compute;
        }
        self.cores.iter().map(|c| c.base_speed).sum()
    }

    /// Compute available to workloads in MHz.
    pub fn usable_compute(&self) -> u64 {
        let withheld = if self.override_witheld_compute > 0 {
            self.override_witheld_compute
        } else {
            self.cores
                .iter()
                .filter(|c| c.disable)
                .map(|c| c.base_speed)
                .sum()
        };
        self.total_compute().saturating_sub(withheld)
    }

    /// IDs of the cores available for reservation.
    pub fn usable_cores(&self) -> Vec<u16> {
        self.cores
            .iter()
            .filter(|c| !c.disable)
            .map(|c| c.id)
            .collect()
    }

    /// Number of cores, including withheld ones.
    pub fn num_cores(&self) -> usize {
        self.cores.len()
    }

    /// Number of NUMA nodes.
    pub fn numa_nodes(&self) -> usize {
        self.nodes.len()
    }

    /// NUMA node hosting the given core.
    pub fn numa_node_of(&self, core_id: u16) -> Option<u8> {
        self.cores.iter().find(|c| c.id == core_id).map(|c| c.node_id)
    }
}

/// Processor resources of a node.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeProcessorResources {
    pub topology: Topology,
}

impl NodeProcessorResources {
    /// Total compute in MHz.
    pub fn total_compute(&self) -> u64 {
        self.topology.total_compute()
    }
}

/// CPU resources as reported by clients that predate topology reporting.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LegacyNodeCpuResources {
    /// Total compute in MHz.
    pub cpu_shares: u64,
    pub total_cpu_cores: u16,
    /// Cores the operator allows workloads to reserve. Empty means all.
    pub reservable_cpu_cores: Vec<u16>,
}

impl LegacyNodeCpuResources {
    /// Synthesizes a single NUMA node topology from the flat report.
    ///
    /// Cores outside the reservable set are withheld and the reported shares
    /// become the total compute override.
    pub fn upgrade(&self) -> NodeProcessorResources {
        let count = u64::from(self.total_cpu_cores.max(1));
        let speed = self.cpu_shares / count;
        let cores = (0..self.total_cpu_cores)
            .map(|id| Core {
                socket_id: 0,
                node_id: 0,
                id,
                grade: CoreGrade::Performance,
                disable: !self.reservable_cpu_cores.is_empty()
                    && !self.reservable_cpu_cores.contains(&id),
                base_speed: speed,
                max_speed: speed,
                guess_speed: true,
            })
            .collect();

        NodeProcessorResources {
            topology: Topology {
                nodes: vec![0],
                distances: vec![vec![10]],
                cores,
                override_total_compute: self.cpu_shares,
                override_witheld_compute: 0,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn legacy() -> LegacyNodeCpuResources {
        LegacyNodeCpuResources {
            cpu_shares: 4000,
            total_cpu_cores: 4,
            reservable_cpu_cores: vec![1, 2, 3],
        }
    }

    #[test]
    fn test_upgrade_builds_single_node_topology() {
        let procs = legacy().upgrade();
        assert_eq!(procs.topology.numa_nodes(), 1);
        assert_eq!(procs.topology.num_cores(), 4);
        assert_eq!(procs.total_compute(), 4000);
        assert!(procs.topology.cores.iter().all(|c| c.node_id == 0));
    }

    #[test]
    fn test_upgrade_withholds_unreservable_cores() {
        let procs = legacy().upgrade();
        assert_eq!(procs.topology.usable_cores(), vec![1, 2, 3]);
        assert_eq!(procs.topology.usable_compute(), 3000);
    }

    #[test]
    fn test_upgrade_empty_reservable_means_all() {
        let mut cpu = legacy();
        cpu.reservable_cpu_cores.clear();
        let procs = cpu.upgrade();
        assert_eq!(procs.topology.usable_cores().len(), 4);
        assert_eq!(procs.topology.usable_compute(), 4000);
    }

    #[test]
    fn test_witheld_override_wins() {
        let mut procs = legacy().upgrade();
        procs.topology.override_witheld_compute = 500;
        assert_eq!(procs.topology.usable_compute(), 3500);
    }

    #[test]
    fn test_numa_node_of() {
        let procs = legacy().upgrade();
        assert_eq!(procs.topology.numa_node_of(2), Some(0));
        assert_eq!(procs.topology.numa_node_of(9), None);
    }
}
