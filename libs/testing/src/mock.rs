//! Mock jobs, nodes, allocations and deployments.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use fleet_id::{AllocId, EvalId, JobId, NodeId, DEFAULT_NAMESPACE, GLOBAL_REGION};
use fleet_structs::constraint::Constraint;
use fleet_structs::resources::{
    AllocatedCpuResources, AllocatedMemoryResources, AllocatedSharedResources,
    AllocatedTaskResources, NetworkResource, NodeDiskResources, NodeMemoryResources,
    NodeReservedCpuResources, NodeReservedNetworkResources, NodeReservedResources, Port,
};
use fleet_structs::service::Service;
use fleet_structs::task_group::EphemeralDisk;
use fleet_structs::time::unix_nanos;
use fleet_structs::topology::LegacyNodeCpuResources;
use fleet_structs::update::UpdateStrategy;
use fleet_structs::{
    AllocatedResources, Allocation, ClientStatus, Deployment, DeploymentState, DesiredStatus,
    Job, JobType, Node, NodeResources, NodeStatus, Resources, Task, TaskGroup,
};

/// Device and address every mock node exposes.
pub const NODE_DEVICE: &str = "eth0";
pub const NODE_CIDR: &str = "192.168.0.100/32";
pub const NODE_IP: &str = "192.168.0.100";

fn uuid_suffix() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// A ready linux node with 4000 MHz over four cores and 8 GiB of memory.
pub fn node() -> Node {
    let mut node = Node {
        id: NodeId::generate(),
        datacenter: "dc1".to_string(),
        name: "foobar".to_string(),
        http_addr: "127.0.0.1:4646".to_string(),
        attributes: BTreeMap::from([
            ("kernel.name".to_string(), "linux".to_string()),
            ("arch".to_string(), "x86".to_string()),
            ("driver.exec".to_string(), "1".to_string()),
            ("driver.mock_driver".to_string(), "1".to_string()),
            ("unique.hostname".to_string(), "foobar".to_string()),
        ]),
        meta: BTreeMap::from([
            ("pci-dss".to_string(), "true".to_string()),
            ("database".to_string(), "mysql".to_string()),
        ]),
        node_class: "linux-medium-pci".to_string(),
        node_resources: Some(NodeResources {
            processors: LegacyNodeCpuResources {
                cpu_shares: 4000,
                total_cpu_cores: 4,
                reservable_cpu_cores: Vec::new(),
            }
            .upgrade(),
            memory: NodeMemoryResources { memory_mb: 8192 },
            disk: NodeDiskResources {
                disk_mb: 100 * 1024,
            },
            networks: vec![NetworkResource {
                mode: "host".to_string(),
                device: NODE_DEVICE.to_string(),
                cidr: NODE_CIDR.to_string(),
                ip: NODE_IP.to_string(),
                mbits: 1000,
                ..NetworkResource::default()
            }],
            devices: Vec::new(),
            min_dynamic_port: 20000,
            max_dynamic_port: 32000,
        }),
        reserved_resources: Some(NodeReservedResources {
            cpu: NodeReservedCpuResources {
                cpu_shares: 100,
                reserved_cpu_cores: Vec::new(),
            },
            memory: NodeMemoryResources { memory_mb: 256 },
            disk: NodeDiskResources { disk_mb: 4 * 1024 },
            networks: NodeReservedNetworkResources {
                reserved_host_ports: "22".to_string(),
            },
        }),
        status: NodeStatus::Ready,
        status_updated_at: Utc::now().timestamp(),
        ..Node::default()
    };
    node.canonicalize();
    node.compute_class().expect("mock node class");
    node
}

fn web_task() -> Task {
    Task {
        name: "web".to_string(),
        driver: "exec".to_string(),
        config: BTreeMap::from([(
            "command".to_string(),
            serde_json::Value::from("/bin/date"),
        )]),
        env: BTreeMap::from([("FOO".to_string(), "bar".to_string())]),
        services: vec![
            Service {
                name: "web-frontend".to_string(),
                port_label: "http".to_string(),
                tags: vec!["pci:true".to_string(), "datacenter:dc1".to_string()],
                ..Service::default()
            },
            Service {
                name: "web-admin".to_string(),
                port_label: "admin".to_string(),
                tags: vec!["secure".to_string()],
                ..Service::default()
            },
        ],
        resources: Some(Resources {
            cpu: 500,
            memory_mb: 256,
            networks: vec![NetworkResource {
                mbits: 50,
                dynamic_ports: vec![
                    Port {
                        label: "http".to_string(),
                        ..Port::default()
                    },
                    Port {
                        label: "admin".to_string(),
                        ..Port::default()
                    },
                ],
                ..NetworkResource::default()
            }],
            ..Resources::default()
        }),
        meta: BTreeMap::from([("foo".to_string(), "bar".to_string())]),
        ..Task::default()
    }
}

/// A canonicalized service job with one group of ten `exec` tasks.
pub fn job() -> Job {
    let mut job = Job {
        region: GLOBAL_REGION.to_string(),
        namespace: DEFAULT_NAMESPACE.to_string(),
        id: JobId::new(format!("mock-service-{}", uuid_suffix())),
        name: "my-job".to_string(),
        job_type: JobType::Service,
        priority: 50,
        datacenters: vec!["dc1".to_string()],
        constraints: vec![Constraint::new("${attr.kernel.name}", "=", "linux")],
        task_groups: vec![TaskGroup {
            name: "web".to_string(),
            count: 10,
            ephemeral_disk: Some(EphemeralDisk {
                size_mb: 150,
                ..EphemeralDisk::default()
            }),
            update: Some(UpdateStrategy::default()),
            tasks: vec![web_task()],
            meta: BTreeMap::from([("elb_check_type".to_string(), "http".to_string())]),
            ..TaskGroup::default()
        }],
        meta: BTreeMap::from([("owner".to_string(), "armon".to_string())]),
        create_index: 42,
        modify_index: 99,
        job_modify_index: 99,
        ..Job::default()
    };
    job.canonicalize();
    job
}

/// A canonicalized batch job with one group of ten tasks.
pub fn batch_job() -> Job {
    let mut job = job();
    job.id = JobId::new(format!("mock-batch-{}", uuid_suffix()));
    job.name = "batch-job".to_string();
    job.job_type = JobType::Batch;
    job.priority = 50;
    for tg in &mut job.task_groups {
        tg.update = None;
        tg.migrate = None;
        tg.restart_policy = None;
        tg.reschedule_policy = None;
        for task in &mut tg.tasks {
            task.driver = "mock_driver".to_string();
            task.services.clear();
            if let Some(resources) = &mut task.resources {
                resources.networks.clear();
            }
        }
    }
    job.canonicalize();
    job
}

/// A canonicalized system job with one task per node.
pub fn system_job() -> Job {
    let mut job = job();
    job.id = JobId::new(format!("mock-system-{}", uuid_suffix()));
    job.name = "my-job".to_string();
    job.job_type = JobType::System;
    job.priority = 100;
    for tg in &mut job.task_groups {
        tg.count = 1;
        tg.update = None;
        tg.migrate = None;
        tg.restart_policy = None;
        tg.reschedule_policy = None;
        for task in &mut tg.tasks {
            task.services.clear();
            task.kill_timeout = Duration::ZERO;
        }
    }
    job.canonicalize();
    job
}

/// Resources granted to the first task of [`job`] on [`node`].
pub fn allocated_resources() -> AllocatedResources {
    AllocatedResources {
        tasks: BTreeMap::from([(
            "web".to_string(),
            AllocatedTaskResources {
                cpu: AllocatedCpuResources {
                    cpu_shares: 500,
                    reserved_cores: Vec::new(),
                },
                memory: AllocatedMemoryResources {
                    memory_mb: 256,
                    memory_max_mb: 0,
                },
                networks: vec![NetworkResource {
                    device: NODE_DEVICE.to_string(),
                    cidr: NODE_CIDR.to_string(),
                    ip: NODE_IP.to_string(),
                    mbits: 50,
                    reserved_ports: vec![Port {
                        label: "admin".to_string(),
                        value: 5000,
                        to: 0,
                        host_network: String::new(),
                    }],
                    dynamic_ports: vec![Port {
                        label: "http".to_string(),
                        value: 9876,
                        to: 0,
                        host_network: String::new(),
                    }],
                    ..NetworkResource::default()
                }],
                devices: Vec::new(),
            },
        )]),
        shared: AllocatedSharedResources {
            disk_mb: 150,
            networks: Vec::new(),
        },
    }
}

/// A pending allocation of the `web` group of a fresh [`job`].
pub fn alloc() -> Allocation {
    alloc_for_job(Arc::new(job()))
}

/// A pending allocation of the first group of `job`.
pub fn alloc_for_job(job: Arc<Job>) -> Allocation {
    let task_group = job
        .task_groups
        .first()
        .map(|tg| tg.name.clone())
        .unwrap_or_default();
    let now = unix_nanos(Utc::now());
    Allocation {
        id: AllocId::generate(),
        namespace: job.namespace.clone(),
        eval_id: EvalId::generate(),
        name: format!("{}.{}[0]", job.name, task_group),
        node_id: NodeId::from("12345678-abcd-efab-cdef-123456789abc"),
        node_name: "foobar".to_string(),
        job_id: job.id.clone(),
        task_group,
        allocated_resources: Some(allocated_resources()),
        desired_status: DesiredStatus::Run,
        client_status: ClientStatus::Pending,
        job: Some(job),
        create_time: now,
        modify_time: now,
        ..Allocation::default()
    }
}

/// A running deployment of a fresh [`job`] expecting ten allocations.
pub fn deployment() -> Deployment {
    let job = job();
    let mut deployment = Deployment::new(&job, 50, unix_nanos(Utc::now()));
    deployment.task_groups.insert(
        "web".to_string(),
        DeploymentState {
            desired_total: 10,
            progress_deadline: Duration::from_secs(10 * 60),
            ..DeploymentState::default()
        },
    );
    deployment.create_index = 23;
    deployment.modify_index = 23;
    deployment
}
