//! Resource model: requested, allocated and node resources.
//!
//! ## Design Principles
//!
//! - Requests (`Resources`) are what a task asks for
//! - Allocations (`AllocatedResources`) are what the scheduler granted
//! - `ComparableResources` flattens either side so fit checks are simple
//!   element-wise comparisons
//! - Networks are matched by device when named, otherwise by CIDR

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::constraint::Constraint;
use crate::error::{StructsError, ValidationErrors};
use crate::topology::NodeProcessorResources;

// =============================================================================
// Networks
// =============================================================================

/// A port request or assignment.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Port {
    pub label: String,
    /// Host port; zero for a dynamic port that is not yet assigned.
    pub value: u16,
    /// Port inside the workload's network namespace; `-1` maps to `value`.
    pub to: i32,
    pub host_network: String,
}

/// A network request or assignment on a device.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NetworkResource {
    pub mode: String,
    pub device: String,
    pub cidr: String,
    pub ip: String,
    pub hostname: String,
    /// Bandwidth in megabits.
    pub mbits: u64,
    pub reserved_ports: Vec<Port>,
    pub dynamic_ports: Vec<Port>,
}

impl NetworkResource {
    /// Returns true if `other` describes the same network.
    pub fn same_network(&self, other: &NetworkResource) -> bool {
        if !self.device.is_empty() || !other.device.is_empty() {
            return self.device == other.device;
        }
        self.cidr == other.cidr
    }

    /// Adds bandwidth and reserved ports of `delta`.
    pub fn add(&mut self, delta: &NetworkResource) {
        self.mbits = self.mbits.saturating_add(delta.mbits);
        self.reserved_ports.extend(delta.reserved_ports.iter().cloned());
        self.dynamic_ports.extend(delta.dynamic_ports.iter().cloned());
    }

    /// Maps every port label to its host port value.
    pub fn port_labels(&self) -> BTreeMap<String, u16> {
        self.reserved_ports
            .iter()
            .chain(self.dynamic_ports.iter())
            .map(|p| (p.label.clone(), p.value))
            .collect()
    }
}

fn net_index(networks: &[NetworkResource], n: &NetworkResource) -> Option<usize> {
    networks.iter().position(|existing| existing.same_network(n))
}

fn merge_networks(
    networks: &mut Vec<NetworkResource>,
    delta: &[NetworkResource],
) -> Result<(), StructsError> {
    for n in delta {
        match net_index(networks, n) {
            None => networks.push(n.clone()),
            Some(idx) => {
                let existing = &mut networks[idx];
                if existing.cidr != n.cidr {
                    return Err(StructsError::NetworkMismatch {
                        device: existing.device.clone(),
                        existing: existing.cidr.clone(),
                        delta: n.cidr.clone(),
                    });
                }
                existing.add(n);
            }
        }
    }
    Ok(())
}

// =============================================================================
// NUMA
// =============================================================================

/// How strictly a task's cores must share a NUMA node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NumaAffinity {
    None,
    Prefer,
    Require,
}

impl NumaAffinity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Prefer => "prefer",
            Self::Require => "require",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "none" => Some(Self::None),
            "prefer" => Some(Self::Prefer),
            "require" => Some(Self::Require),
            _ => None,
        }
    }
}

impl std::fmt::Display for NumaAffinity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// NUMA placement request of a task.
///
/// The affinity is kept as submitted so validation can report unknown values.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Numa {
    pub affinity: String,
    /// Devices that must share the NUMA node of the reserved cores.
    #[serde(default)]
    pub devices: Vec<String>,
}

impl Default for Numa {
    fn default() -> Self {
        Self {
            affinity: NumaAffinity::None.as_str().to_string(),
            devices: Vec::new(),
        }
    }
}

impl Numa {
    /// Parsed affinity; `None` when the submitted value is unknown.
    pub fn affinity(&self) -> Option<NumaAffinity> {
        NumaAffinity::parse(&self.affinity)
    }

    /// Returns true if the task asked for NUMA-aware placement.
    pub fn is_aware(&self) -> bool {
        matches!(
            self.affinity(),
            Some(NumaAffinity::Prefer | NumaAffinity::Require)
        )
    }

    pub fn validate(&self) -> Result<(), ValidationErrors> {
        let mut errs = ValidationErrors::new();
        match self.affinity() {
            Some(NumaAffinity::None) if !self.devices.is_empty() => {
                errs.push("numa device affinity requires affinity of prefer or require");
            }
            Some(_) => {}
            None => errs.push(format!(
                "numa affinity must be one of none, prefer, or require (got {:?})",
                self.affinity
            )),
        }

        let mut seen = BTreeSet::new();
        for device in &self.devices {
            if !seen.insert(device.as_str()) {
                errs.push(format!("numa device {device:?} listed more than once"));
            }
        }
        errs.into_result()
    }
}

// =============================================================================
// Devices
// =============================================================================

/// A request for devices such as GPUs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestedDevice {
    /// `type`, `vendor/type` or `vendor/type/name`.
    pub name: String,
    pub count: u64,
    #[serde(default)]
    pub constraints: Vec<Constraint>,
}

impl RequestedDevice {
    pub fn validate(&self) -> Result<(), ValidationErrors> {
        let mut errs = ValidationErrors::new();
        if self.name.is_empty() {
            errs.push(
                "device name must be given as one of the following: type, vendor/type, or vendor/type/name",
            );
        }
        if self.count == 0 {
            errs.push("device count must be at least 1");
        }
        for (idx, constr) in self.constraints.iter().enumerate() {
            errs.nest(
                format!("constraint {} validation failed", idx + 1),
                constr.validate_device(),
            );
        }
        errs.into_result()
    }
}

// =============================================================================
// Requested Resources
// =============================================================================

/// Resources requested by a task.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Resources {
    /// Compute in MHz.
    pub cpu: u64,
    /// Whole cores to reserve; exclusive with `cpu`.
    pub cores: u32,
    pub memory_mb: u64,
    /// Oversubscription ceiling; zero when unset.
    pub memory_max_mb: u64,
    pub disk_mb: u64,
    pub iops: u64,
    #[serde(default)]
    pub networks: Vec<NetworkResource>,
    #[serde(default)]
    pub devices: Vec<RequestedDevice>,
    #[serde(default)]
    pub numa: Option<Numa>,
}

impl Resources {
    /// Resources given to a task that does not declare any.
    pub fn default_resources() -> Self {
        Self {
            cpu: 100,
            memory_mb: 300,
            ..Self::default()
        }
    }

    /// Minimum resources a task may ask for.
    pub fn min_resources() -> Self {
        Self {
            cpu: 1,
            memory_mb: 10,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), ValidationErrors> {
        let mut errs = ValidationErrors::new();
        let min = Self::min_resources();

        if self.cores > 0 && self.cpu > 0 {
            errs.push("Task can only ask for 'cpu' or 'cores' resource, not both.");
        }
        if self.cores == 0 && self.cpu < min.cpu {
            errs.push(format!(
                "minimum CPU value is {}; got {}",
                min.cpu, self.cpu
            ));
        }
        if self.memory_mb < min.memory_mb {
            errs.push(format!(
                "minimum MemoryMB value is {}; got {}",
                min.memory_mb, self.memory_mb
            ));
        }
        if self.memory_max_mb != 0 && self.memory_max_mb < self.memory_mb {
            errs.push(format!(
                "MemoryMaxMB value ({}) should be larger than MemoryMB value ({})",
                self.memory_max_mb, self.memory_mb
            ));
        }
        if self.disk_mb > 0 {
            errs.push(
                "Task can't ask for disk resources, they have to be specified at the task group level.",
            );
        }
        for (idx, device) in self.devices.iter().enumerate() {
            errs.nest(format!("device {} failed validation", idx + 1), device.validate());
        }
        if let Some(numa) = &self.numa {
            if numa.is_aware() && self.cores == 0 {
                errs.push("numa affinity requires reserved cores");
            }
            errs.merge(numa.validate());
        }
        errs.into_result()
    }

    /// Names the first dimension in which `self` cannot cover `other`.
    pub fn exhausted_dimension(&self, other: &Resources) -> Option<String> {
        if self.cpu < other.cpu {
            return Some("cpu".to_string());
        }
        if self.cores < other.cores {
            return Some("cores".to_string());
        }
        if self.memory_mb < other.memory_mb {
            return Some("memory".to_string());
        }
        if self.disk_mb < other.disk_mb {
            return Some("disk".to_string());
        }
        if self.iops < other.iops {
            return Some("iops".to_string());
        }
        for n in &other.networks {
            let Some(idx) = net_index(&self.networks, n) else {
                return Some(format!("network: {} missing", n.cidr));
            };
            let ours = &self.networks[idx];
            if ours.cidr != n.cidr {
                return Some(format!("network: {} cidr mismatch", n.device));
            }
            if ours.mbits < n.mbits {
                return Some("network: bandwidth exceeded".to_string());
            }
        }
        None
    }

    /// Element-wise `>=` over cpu, cores, memory, disk, iops and networks.
    pub fn superset(&self, other: &Resources) -> bool {
        self.exhausted_dimension(other).is_none()
    }

    /// Adds `delta` into `self`.
    ///
    /// Networks on the same device are merged; a CIDR disagreement is an error
    /// and leaves the scalar dimensions already added.
    pub fn add(&mut self, delta: &Resources) -> Result<(), StructsError> {
        self.cpu = self.cpu.saturating_add(delta.cpu);
        self.cores = self.cores.saturating_add(delta.cores);
        self.memory_mb = self.memory_mb.saturating_add(delta.memory_mb);
        self.memory_max_mb = self.memory_max_mb.saturating_add(delta.memory_max_mb);
        self.disk_mb = self.disk_mb.saturating_add(delta.disk_mb);
        self.iops = self.iops.saturating_add(delta.iops);
        merge_networks(&mut self.networks, &delta.networks)
    }
}

// =============================================================================
// Allocated Resources
// =============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AllocatedCpuResources {
    pub cpu_shares: u64,
    #[serde(default)]
    pub reserved_cores: Vec<u16>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AllocatedMemoryResources {
    pub memory_mb: u64,
    pub memory_max_mb: u64,
}

/// A device instance granted to a task.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AllocatedDeviceResource {
    pub vendor: String,
    #[serde(rename = "type")]
    pub device_type: String,
    pub name: String,
    pub device_ids: Vec<String>,
}

/// Resources granted to a single task.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AllocatedTaskResources {
    pub cpu: AllocatedCpuResources,
    pub memory: AllocatedMemoryResources,
    #[serde(default)]
    pub networks: Vec<NetworkResource>,
    #[serde(default)]
    pub devices: Vec<AllocatedDeviceResource>,
}

impl AllocatedTaskResources {
    /// Adds `delta` into `self`. Reserved cores are unioned.
    pub fn add(&mut self, delta: &AllocatedTaskResources) -> Result<(), StructsError> {
        self.cpu.cpu_shares = self.cpu.cpu_shares.saturating_add(delta.cpu.cpu_shares);
        for core in &delta.cpu.reserved_cores {
            if !self.cpu.reserved_cores.contains(core) {
                self.cpu.reserved_cores.push(*core);
            }
        }
        self.cpu.reserved_cores.sort_unstable();
        self.memory.memory_mb = self.memory.memory_mb.saturating_add(delta.memory.memory_mb);
        self.memory.memory_max_mb = self.memory.memory_max_mb.saturating_add(delta.memory.memory_max_mb);
        self.devices.extend(delta.devices.iter().cloned());
        merge_networks(&mut self.networks, &delta.networks)
    }

    /// Removes `delta` from `self`, saturating at zero.
    pub fn subtract(&mut self, delta: &AllocatedTaskResources) {
        self.cpu.cpu_shares = self.cpu.cpu_shares.saturating_sub(delta.cpu.cpu_shares);
        self.cpu
            .reserved_cores
            .retain(|core| !delta.cpu.reserved_cores.contains(core));
        self.memory.memory_mb = self.memory.memory_mb.saturating_sub(delta.memory.memory_mb);
        self.memory.memory_max_mb = self
            .memory
            .memory_max_mb
            .saturating_sub(delta.memory.memory_max_mb);
        for n in &delta.networks {
            if let Some(idx) = net_index(&self.networks, n) {
                let ours = &mut self.networks[idx];
                ours.mbits = ours.mbits.saturating_sub(n.mbits);
            }
        }
    }
}

/// Resources granted at the group level and shared by all tasks.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AllocatedSharedResources {
    pub disk_mb: u64,
    #[serde(default)]
    pub networks: Vec<NetworkResource>,
}

/// Everything granted to an allocation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AllocatedResources {
    pub tasks: BTreeMap<String, AllocatedTaskResources>,
    pub shared: AllocatedSharedResources,
}

impl AllocatedResources {
    /// Flattens the per-task grants into a single comparable value.
    pub fn comparable(&self) -> ComparableResources {
        let mut flattened = AllocatedTaskResources::default();
        for task in self.tasks.values() {
            // Per-task networks of one alloc never disagree on CIDR.
            let _ = flattened.add(task);
        }
        let _ = merge_networks(&mut flattened.networks, &self.shared.networks);
        ComparableResources {
            flattened,
            shared: AllocatedSharedResources {
                disk_mb: self.shared.disk_mb,
                networks: Vec::new(),
            },
        }
    }
}

/// Flattened resources used for fit checks.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ComparableResources {
    pub flattened: AllocatedTaskResources,
    pub shared: AllocatedSharedResources,
}

impl ComparableResources {
    pub fn add(&mut self, delta: &ComparableResources) -> Result<(), StructsError> {
        self.shared.disk_mb = self.shared.disk_mb.saturating_add(delta.shared.disk_mb);
        self.flattened.add(&delta.flattened)
    }

    pub fn subtract(&mut self, delta: &ComparableResources) {
        self.shared.disk_mb = self.shared.disk_mb.saturating_sub(delta.shared.disk_mb);
        self.flattened.subtract(&delta.flattened);
    }

    /// Names the first dimension in which `self` cannot cover `other`.
    pub fn exhausted_dimension(&self, other: &ComparableResources) -> Option<String> {
        if self.flattened.cpu.cpu_shares < other.flattened.cpu.cpu_shares {
            return Some("cpu".to_string());
        }
        let missing_core = other
            .flattened
            .cpu
            .reserved_cores
            .iter()
            .any(|core| !self.flattened.cpu.reserved_cores.contains(core));
        if missing_core {
            return Some("cores".to_string());
        }
        if self.flattened.memory.memory_mb < other.flattened.memory.memory_mb {
            return Some("memory".to_string());
        }
        if self.shared.disk_mb < other.shared.disk_mb {
            return Some("disk".to_string());
        }
        None
    }

    pub fn superset(&self, other: &ComparableResources) -> bool {
        self.exhausted_dimension(other).is_none()
    }
}

// =============================================================================
// Node Resources
// =============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeMemoryResources {
    pub memory_mb: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeDiskResources {
    pub disk_mb: u64,
}

/// One instance of a device on a node.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeDevice {
    pub id: String,
    pub healthy: bool,
    pub health_description: String,
    /// PCI bus the device hangs off, used for NUMA locality.
    pub pci_bus_id: Option<String>,
}

/// A group of identical devices on a node.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeDeviceResource {
    pub vendor: String,
    #[serde(rename = "type")]
    pub device_type: String,
    pub name: String,
    pub instances: Vec<NodeDevice>,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
}

impl NodeDeviceResource {
    /// `vendor/type/name` identifier of the device group.
    pub fn id(&self) -> String {
        format!("{}/{}/{}", self.vendor, self.device_type, self.name)
    }
}

/// Everything a node offers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeResources {
    pub processors: NodeProcessorResources,
    pub memory: NodeMemoryResources,
    pub disk: NodeDiskResources,
    #[serde(default)]
    pub networks: Vec<NetworkResource>,
    #[serde(default)]
    pub devices: Vec<NodeDeviceResource>,
    pub min_dynamic_port: u16,
    pub max_dynamic_port: u16,
}

impl NodeResources {
    pub fn comparable(&self) -> ComparableResources {
        ComparableResources {
            flattened: AllocatedTaskResources {
                cpu: AllocatedCpuResources {
                    cpu_shares: self.processors.topology.usable_compute(),
                    reserved_cores: self.processors.topology.usable_cores(),
                },
                memory: AllocatedMemoryResources {
                    memory_mb: self.memory.memory_mb,
                    memory_max_mb: 0,
                },
                networks: self.networks.clone(),
                devices: Vec::new(),
            },
            shared: AllocatedSharedResources {
                disk_mb: self.disk.disk_mb,
                networks: Vec::new(),
            },
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeReservedCpuResources {
    pub cpu_shares: u64,
    #[serde(default)]
    pub reserved_cpu_cores: Vec<u16>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeReservedNetworkResources {
    /// Port list such as `22,80,8000-8100`.
    pub reserved_host_ports: String,
}

/// Resources an operator withholds from scheduling.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeReservedResources {
    pub cpu: NodeReservedCpuResources,
    pub memory: NodeMemoryResources,
    pub disk: NodeDiskResources,
    pub networks: NodeReservedNetworkResources,
}

impl NodeReservedResources {
    pub fn comparable(&self) -> ComparableResources {
        ComparableResources {
            flattened: AllocatedTaskResources {
                cpu: AllocatedCpuResources {
                    cpu_shares: self.cpu.cpu_shares,
                    reserved_cores: self.cpu.reserved_cpu_cores.clone(),
                },
                memory: AllocatedMemoryResources {
                    memory_mb: self.memory.memory_mb,
                    memory_max_mb: 0,
                },
                networks: Vec::new(),
                devices: Vec::new(),
            },
            shared: AllocatedSharedResources {
                disk_mb: self.disk.disk_mb,
                networks: Vec::new(),
            },
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn net(device: &str, cidr: &str, mbits: u64) -> NetworkResource {
        NetworkResource {
            device: device.to_string(),
            cidr: cidr.to_string(),
            mbits,
            ..NetworkResource::default()
        }
    }

    fn res(cpu: u64, mem: u64, disk: u64) -> Resources {
        Resources {
            cpu,
            memory_mb: mem,
            disk_mb: disk,
            ..Resources::default()
        }
    }

    #[test]
    fn test_superset_scalar_dimensions() {
        let big = res(2000, 2048, 10000);
        let small = res(1000, 1024, 5000);
        assert!(big.superset(&small));
        assert!(!small.superset(&big));
        assert_eq!(small.exhausted_dimension(&big).as_deref(), Some("cpu"));
    }

    #[test]
    fn test_superset_iops() {
        let mut a = res(1, 1, 1);
        let mut b = res(1, 1, 1);
        a.iops = 10;
        b.iops = 20;
        assert_eq!(a.exhausted_dimension(&b).as_deref(), Some("iops"));
    }

    #[test]
    fn test_superset_missing_network_breaks() {
        let mut a = res(1000, 1000, 0);
        let mut b = a.clone();
        b.networks.push(net("eth0", "10.0.0.0/8", 100));
        assert!(!a.superset(&b));
        a.networks.push(net("eth0", "10.0.0.0/8", 50));
        assert_eq!(
            a.exhausted_dimension(&b).as_deref(),
            Some("network: bandwidth exceeded")
        );
        a.networks[0].mbits = 100;
        assert!(a.superset(&b));
    }

    #[test]
    fn test_add_merges_networks() {
        let mut a = res(1000, 512, 0);
        a.networks.push(NetworkResource {
            reserved_ports: vec![Port {
                label: "http".into(),
                value: 80,
                ..Port::default()
            }],
            ..net("eth0", "10.0.0.0/8", 100)
        });
        let mut b = res(500, 256, 0);
        b.networks.push(NetworkResource {
            reserved_ports: vec![Port {
                label: "https".into(),
                value: 443,
                ..Port::default()
            }],
            ..net("eth0", "10.0.0.0/8", 50)
        });

        a.add(&b).unwrap();
        assert_eq!(a.cpu, 1500);
        assert_eq!(a.memory_mb, 768);
        assert_eq!(a.networks.len(), 1);
        assert_eq!(a.networks[0].mbits, 150);
        assert_eq!(a.networks[0].reserved_ports.len(), 2);
    }

    #[test]
    fn test_add_appends_new_network() {
        let mut a = res(1, 1, 0);
        let mut b = res(1, 1, 0);
        b.networks.push(net("eth1", "192.168.0.0/16", 10));
        a.add(&b).unwrap();
        assert_eq!(a.networks.len(), 1);
    }

    #[test]
    fn test_add_cidr_mismatch_is_error() {
        let mut a = res(1, 1, 0);
        a.networks.push(net("eth0", "10.0.0.0/8", 10));
        let mut b = res(1, 1, 0);
        b.networks.push(net("eth0", "192.168.0.0/16", 10));
        let err = a.add(&b).unwrap_err();
        assert!(matches!(err, StructsError::NetworkMismatch { .. }));
    }

    #[test]
    fn test_validate_minimums() {
        let errs = res(0, 5, 0).validate().unwrap_err();
        assert!(errs.contains("minimum CPU value is 1; got 0"));
        assert!(errs.contains("minimum MemoryMB value is 10; got 5"));
    }

    #[test]
    fn test_validate_cpu_and_cores_exclusive() {
        let mut r = Resources::default_resources();
        r.cores = 2;
        let errs = r.validate().unwrap_err();
        assert!(errs.contains("not both"));
        r.cpu = 0;
        assert!(r.validate().is_ok());
    }

    #[test]
    fn test_validate_task_disk_rejected() {
        let mut r = Resources::default_resources();
        r.disk_mb = 100;
        assert!(r.validate().unwrap_err().contains("task group level"));
    }

    #[test]
    fn test_validate_memory_max() {
        let mut r = Resources::default_resources();
        r.memory_max_mb = 100;
        assert!(r.validate().unwrap_err().contains("MemoryMaxMB"));
        r.memory_max_mb = 1000;
        assert!(r.validate().is_ok());
    }

    #[test]
    fn test_numa_validate() {
        for ok in ["none", "prefer", "require"] {
            let numa = Numa {
                affinity: ok.to_string(),
                devices: vec![],
            };
            assert!(numa.validate().is_ok(), "{ok}");
        }
        let bad = Numa {
            affinity: "sometimes".to_string(),
            devices: vec![],
        };
        assert!(bad.validate().unwrap_err().contains("none, prefer, or require"));
    }

    #[test]
    fn test_numa_duplicate_devices() {
        let numa = Numa {
            affinity: "require".to_string(),
            devices: vec!["nvidia/gpu".into(), "nvidia/gpu".into()],
        };
        assert!(numa.validate().unwrap_err().contains("listed more than once"));
    }

    #[test]
    fn test_numa_requires_cores() {
        let mut r = Resources::default_resources();
        r.numa = Some(Numa {
            affinity: "require".to_string(),
            devices: vec![],
        });
        assert!(r.validate().unwrap_err().contains("requires reserved cores"));
    }

    #[test]
    fn test_comparable_flattens_tasks() {
        let mut allocated = AllocatedResources::default();
        allocated.tasks.insert(
            "web".into(),
            AllocatedTaskResources {
                cpu: AllocatedCpuResources {
                    cpu_shares: 500,
                    reserved_cores: vec![],
                },
                memory: AllocatedMemoryResources {
                    memory_mb: 256,
                    memory_max_mb: 0,
                },
                ..AllocatedTaskResources::default()
            },
        );
        allocated.tasks.insert(
            "sidecar".into(),
            AllocatedTaskResources {
                cpu: AllocatedCpuResources {
                    cpu_shares: 100,
                    reserved_cores: vec![2],
                },
                memory: AllocatedMemoryResources {
                    memory_mb: 64,
                    memory_max_mb: 0,
                },
                ..AllocatedTaskResources::default()
            },
        );
        allocated.shared.disk_mb = 150;

        let c = allocated.comparable();
        assert_eq!(c.flattened.cpu.cpu_shares, 600);
        assert_eq!(c.flattened.cpu.reserved_cores, vec![2]);
        assert_eq!(c.flattened.memory.memory_mb, 320);
        assert_eq!(c.shared.disk_mb, 150);
    }

    #[test]
    fn test_comparable_subtract_saturates() {
        let mut a = ComparableResources::default();
        a.flattened.cpu.cpu_shares = 10;
        let mut b = ComparableResources::default();
        b.flattened.cpu.cpu_shares = 20;
        a.subtract(&b);
        assert_eq!(a.flattened.cpu.cpu_shares, 0);
    }

    #[test]
    fn test_add_saturates() {
        let mut a = res(u64::MAX - 1, u64::MAX, 1);
        a.networks.push(net("eth0", "10.0.0.0/8", u64::MAX));
        let mut b = res(10, 10, u64::MAX);
        b.networks.push(net("eth0", "10.0.0.0/8", 10));
        a.add(&b).unwrap();
        assert_eq!(a.cpu, u64::MAX);
        assert_eq!(a.memory_mb, u64::MAX);
        assert_eq!(a.disk_mb, u64::MAX);
        assert_eq!(a.networks[0].mbits, u64::MAX);

        let mut c = ComparableResources::default();
        c.flattened.cpu.cpu_shares = u64::MAX;
        c.flattened.memory.memory_mb = u64::MAX;
        c.shared.disk_mb = u64::MAX;
        let d = c.clone();
        c.add(&d).unwrap();
        assert_eq!(c.flattened.cpu.cpu_shares, u64::MAX);
        assert_eq!(c.flattened.memory.memory_mb, u64::MAX);
        assert_eq!(c.shared.disk_mb, u64::MAX);
    }

    #[test]
    fn test_comparable_superset_cores() {
        let mut node = ComparableResources::default();
        node.flattened.cpu.reserved_cores = vec![0, 1];
        let mut ask = ComparableResources::default();
        ask.flattened.cpu.reserved_cores = vec![1];
        assert!(node.superset(&ask));
        ask.flattened.cpu.reserved_cores = vec![3];
        assert_eq!(node.exhausted_dimension(&ask).as_deref(), Some("cores"));
    }

    fn arb_resources() -> impl Strategy<Value = Resources> {
        (0u64..10_000, 0u32..8, 0u64..65_536, 0u64..100_000, 0u64..1000).prop_map(
            |(cpu, cores, memory_mb, disk_mb, iops)| Resources {
                cpu,
                cores,
                memory_mb,
                disk_mb,
                iops,
                ..Resources::default()
            },
        )
    }

    proptest! {
        #[test]
        fn prop_superset_is_reflexive(r in arb_resources()) {
            prop_assert!(r.superset(&r));
        }

        #[test]
        fn prop_mutual_superset_means_equal(a in arb_resources(), b in arb_resources()) {
            if a.superset(&b) && b.superset(&a) {
                prop_assert_eq!(a.cpu, b.cpu);
                prop_assert_eq!(a.cores, b.cores);
                prop_assert_eq!(a.memory_mb, b.memory_mb);
                prop_assert_eq!(a.disk_mb, b.disk_mb);
                prop_assert_eq!(a.iops, b.iops);
            }
        }

        #[test]
        fn prop_sum_is_superset_of_parts(a in arb_resources(), b in arb_resources()) {
            let mut sum = a.clone();
            sum.add(&b).unwrap();
            prop_assert!(sum.superset(&a));
            prop_assert!(sum.superset(&b));
        }
    }
}
