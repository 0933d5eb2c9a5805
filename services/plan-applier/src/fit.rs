//! Node fit checks for proposed allocation sets.

use std::collections::{BTreeMap, BTreeSet};

use fleet_structs::resources::NetworkResource;
use fleet_structs::{Allocation, ComparableResources, Node};

/// Decides whether a set of allocations can run together on a node.
pub trait FitChecker: Send + Sync {
    /// Returns the rejection reason when `proposed` does not fit `node`.
    fn fits(&self, node: &Node, proposed: &[Allocation]) -> Result<(), String>;
}

/// Compares summed allocation resources against what the node offers once
/// its operator reservation is removed, then checks network bandwidth and
/// port collisions.
#[derive(Debug, Clone, Copy, Default)]
pub struct ResourceFitChecker;

impl FitChecker for ResourceFitChecker {
    fn fits(&self, node: &Node, proposed: &[Allocation]) -> Result<(), String> {
        let mut used = ComparableResources::default();
        let mut cores = BTreeSet::new();
        let mut ports = PortIndex::for_node(node)?;

        for alloc in proposed.iter().filter(|a| !a.client_terminal_status()) {
            let resources = alloc.comparable_resources();
            for core in &resources.flattened.cpu.reserved_cores {
                if !cores.insert(*core) {
                    return Err("cores".to_string());
                }
            }
            for network in &resources.flattened.networks {
                ports.add(network)?;
            }
            used.add(&resources)
                .map_err(|err| format!("network: {err}"))?;
        }

        let available = node.comparable_available();
        if let Some(dimension) = available.exhausted_dimension(&used) {
            return Err(dimension);
        }
        bandwidth_fits(&available.flattened.networks, &used.flattened.networks)
    }
}

fn bandwidth_fits(available: &[NetworkResource], used: &[NetworkResource]) -> Result<(), String> {
    for network in used.iter().filter(|n| n.mbits > 0) {
        let capacity = available
            .iter()
            .find(|offered| offered.same_network(network))
            .map_or(0, |offered| offered.mbits);
        if network.mbits > capacity {
            return Err("bandwidth exceeded".to_string());
        }
    }
    Ok(())
}

/// Host ports in use, keyed by address.
struct PortIndex {
    /// Ports withheld by the operator on every address.
    reserved: BTreeSet<u16>,
    used: BTreeMap<String, BTreeSet<u16>>,
}

impl PortIndex {
    fn for_node(node: &Node) -> Result<Self, String> {
        let spec = node
            .reserved_resources
            .as_ref()
            .map(|r| r.networks.reserved_host_ports.as_str())
            .unwrap_or_default();
        let reserved = parse_port_list(spec)
            .map_err(|err| format!("reserved node port collision: {err}"))?;
        Ok(Self {
            reserved,
            used: BTreeMap::new(),
        })
    }

    fn add(&mut self, network: &NetworkResource) -> Result<(), String> {
        let address = if network.ip.is_empty() {
            network.device.clone()
        } else {
            network.ip.clone()
        };
        let used = self.used.entry(address).or_default();
        for port in network.reserved_ports.iter().chain(&network.dynamic_ports) {
            if port.value == 0 {
                continue;
            }
            if self.reserved.contains(&port.value) || !used.insert(port.value) {
                return Err(format!(
                    "reserved alloc port collision: port {} already in use",
                    port.value
                ));
            }
        }
        Ok(())
    }
}

/// Parses a port list such as `22,80,8000-8100`.
pub fn parse_port_list(spec: &str) -> Result<BTreeSet<u16>, String> {
    let mut ports = BTreeSet::new();
    for part in spec.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let parse = |s: &str| {
            s.trim()
                .parse::<u16>()
                .map_err(|_| format!("invalid port {s:?}"))
        };
        match part.split_once('-') {
            Some((lo, hi)) => {
                let (lo, hi) = (parse(lo)?, parse(hi)?);
                if lo > hi {
                    return Err(format!("invalid port range {part:?}"));
                }
                ports.extend(lo..=hi);
            }
            None => {
                ports.insert(parse(part)?);
            }
        }
    }
    Ok(ports)
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_structs::resources::{
        AllocatedCpuResources, AllocatedMemoryResources, AllocatedResources,
        AllocatedSharedResources, AllocatedTaskResources, NodeDiskResources,
        NodeMemoryResources, NodeReservedNetworkResources, NodeReservedResources, Port,
    };
    use fleet_structs::topology::LegacyNodeCpuResources;
    use fleet_structs::{ClientStatus, NodeResources};
    use rstest::rstest;

    fn node() -> Node {
        Node {
            node_resources: Some(NodeResources {
                processors: LegacyNodeCpuResources {
                    cpu_shares: 2000,
                    total_cpu_cores: 2,
                    reservable_cpu_cores: vec![0, 1],
                }
                .upgrade(),
                memory: NodeMemoryResources { memory_mb: 2048 },
                disk: NodeDiskResources { disk_mb: 10_000 },
                networks: vec![NetworkResource {
                    device: "eth0".into(),
                    cidr: "10.0.0.1/32".into(),
                    ip: "10.0.0.1".into(),
                    mbits: 100,
                    ..NetworkResource::default()
                }],
                ..NodeResources::default()
            }),
            reserved_resources: Some(NodeReservedResources {
                networks: NodeReservedNetworkResources {
                    reserved_host_ports: "22".into(),
                },
                ..NodeReservedResources::default()
            }),
            ..Node::default()
        }
    }

    fn alloc(cpu: u64, memory_mb: u64, mbits: u64, port: u16) -> Allocation {
        let network = NetworkResource {
            device: "eth0".into(),
            cidr: "10.0.0.1/32".into(),
            ip: "10.0.0.1".into(),
            mbits,
            dynamic_ports: vec![Port {
                label: "http".into(),
                value: port,
                ..Port::default()
            }],
            ..NetworkResource::default()
        };
        let task = AllocatedTaskResources {
            cpu: AllocatedCpuResources {
                cpu_shares: cpu,
                reserved_cores: Vec::new(),
            },
            memory: AllocatedMemoryResources {
                memory_mb,
                memory_max_mb: 0,
            },
            networks: vec![network],
            devices: Vec::new(),
        };
        Allocation {
            allocated_resources: Some(AllocatedResources {
                tasks: [("web".to_string(), task)].into_iter().collect(),
                shared: AllocatedSharedResources {
                    disk_mb: 100,
                    networks: Vec::new(),
                },
            }),
            ..Allocation::default()
        }
    }

    #[test]
    fn test_fits() {
        let proposed = vec![alloc(500, 512, 10, 20000), alloc(500, 512, 10, 20001)];
        assert_eq!(ResourceFitChecker.fits(&node(), &proposed), Ok(()));
    }

    #[rstest]
    #[case(vec![alloc(1500, 256, 10, 20000), alloc(1000, 256, 10, 20001)], "cpu")]
    #[case(vec![alloc(100, 1500, 10, 20000), alloc(100, 1000, 10, 20001)], "memory")]
    #[case(vec![alloc(100, 256, 60, 20000), alloc(100, 256, 60, 20001)], "bandwidth exceeded")]
    fn test_exhausted(#[case] proposed: Vec<Allocation>, #[case] reason: &str) {
        assert_eq!(
            ResourceFitChecker.fits(&node(), &proposed),
            Err(reason.to_string())
        );
    }

    #[test]
    fn test_port_collisions() {
        let err = ResourceFitChecker
            .fits(&node(), &[alloc(100, 64, 1, 20000), alloc(100, 64, 1, 20000)])
            .unwrap_err();
        assert!(err.starts_with("reserved alloc port collision"), "{err}");

        let err = ResourceFitChecker
            .fits(&node(), &[alloc(100, 64, 1, 22)])
            .unwrap_err();
        assert!(err.starts_with("reserved alloc port collision"), "{err}");
    }

    #[test]
    fn test_client_terminal_allocs_ignored() {
        let mut done = alloc(1900, 2000, 90, 20000);
        done.client_status = ClientStatus::Complete;
        let proposed = vec![done, alloc(500, 512, 10, 20000)];
        assert_eq!(ResourceFitChecker.fits(&node(), &proposed), Ok(()));
    }

    #[rstest]
    #[case("", &[])]
    #[case("22", &[22])]
    #[case("22, 80,8000-8002", &[22, 80, 8000, 8001, 8002])]
    fn test_parse_port_list(#[case] spec: &str, #[case] expected: &[u16]) {
        let ports = parse_port_list(spec).unwrap();
        assert_eq!(ports.into_iter().collect::<Vec<_>>(), expected);
    }

    #[rstest]
    #[case("abc")]
    #[case("90-80")]
    #[case("70000")]
    fn test_parse_port_list_invalid(#[case] spec: &str) {
        assert!(parse_port_list(spec).is_err());
    }
}
