//! Task groups: the unit of placement.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::constraint::Constraint;
use crate::disconnect::DisconnectStrategy;
use crate::error::ValidationErrors;
use crate::job::{Job, JobType};
use crate::reschedule::ReschedulePolicy;
use crate::resources::NetworkResource;
use crate::restart::RestartPolicy;
use crate::service::Service;
use crate::string_enum;
use crate::task::{Task, DEFAULT_KILL_TIMEOUT};
use crate::time::option_duration_nanos_serde;
use crate::update::{MigrateStrategy, UpdateStrategy};

/// Smallest ephemeral disk a group may request, in MB.
pub const MIN_EPHEMERAL_DISK_MB: u64 = 10;

/// Scratch disk shared by the tasks of an allocation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EphemeralDisk {
    /// Prefer placing replacements on the same node.
    #[serde(default)]
    pub sticky: bool,
    /// Copy the data to a replacement on another node.
    #[serde(default)]
    pub migrate: bool,
    pub size_mb: u64,
}

impl Default for EphemeralDisk {
    fn default() -> Self {
        Self {
            sticky: false,
            migrate: false,
            size_mb: 300,
        }
    }
}

impl EphemeralDisk {
    pub fn validate(&self) -> Result<(), ValidationErrors> {
        if self.size_mb < MIN_EPHEMERAL_DISK_MB {
            return Err(ValidationErrors::single(format!(
                "minimum DiskMB value is {MIN_EPHEMERAL_DISK_MB}; got {}",
                self.size_mb
            )));
        }
        Ok(())
    }
}

string_enum! {
    pub enum VolumeType {
        Host => "host",
        Csi => "csi",
    }
}

/// A volume requested by a task group and mounted by its tasks.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VolumeRequest {
    pub name: String,
    #[serde(rename = "type")]
    pub volume_type: VolumeType,
    pub source: String,
    #[serde(default)]
    pub read_only: bool,
    /// CSI access mode, e.g. `single-node-writer`.
    #[serde(default)]
    pub access_mode: String,
    /// CSI attachment mode, `file-system` or `block-device`.
    #[serde(default)]
    pub attachment_mode: String,
    /// Suffix the source with the allocation index.
    #[serde(default)]
    pub per_alloc: bool,
}

impl VolumeRequest {
    fn validate(&self, name: &str, job_type: &JobType, can_update: bool) -> ValidationErrors {
        let mut errs = ValidationErrors::new();
        if self.source.is_empty() {
            errs.push(format!("Volume {name} has an empty source"));
        }
        match &self.volume_type {
            VolumeType::Host => {
                if !self.access_mode.is_empty() || !self.attachment_mode.is_empty() {
                    errs.push(format!(
                        "Volume {name} host volumes cannot have an access mode or attachment mode"
                    ));
                }
            }
            VolumeType::Csi => {
                if self.access_mode.is_empty() {
                    errs.push(format!("Volume {name} CSI volumes must have an access mode"));
                }
                if self.attachment_mode.is_empty() {
                    errs.push(format!("Volume {name} CSI volumes must have an attachment mode"));
                }
                if self.per_alloc && can_update {
                    errs.push(format!(
                        "Volume {name} cannot be per_alloc when canaries are in use"
                    ));
                }
            }
            VolumeType::Unknown(t) => {
                errs.push(format!("Volume {name} has unrecognised type {t}"));
            }
        }
        if self.per_alloc && *job_type == JobType::System {
            errs.push(format!("Volume {name} cannot be per_alloc for system jobs"));
        }
        errs
    }
}

/// A set of tasks placed together on one node.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskGroup {
    pub name: String,
    pub count: i32,
    #[serde(default)]
    pub constraints: Vec<Constraint>,
    #[serde(default)]
    pub tasks: Vec<Task>,
    pub ephemeral_disk: Option<EphemeralDisk>,
    pub restart_policy: Option<RestartPolicy>,
    pub reschedule_policy: Option<ReschedulePolicy>,
    #[serde(default)]
    pub update: Option<UpdateStrategy>,
    #[serde(default)]
    pub migrate: Option<MigrateStrategy>,
    #[serde(default)]
    pub disconnect: Option<DisconnectStrategy>,
    /// Legacy form of `disconnect.lost_after`.
    #[serde(default, with = "option_duration_nanos_serde")]
    pub max_client_disconnect: Option<Duration>,
    /// Legacy form of `disconnect.stop_on_client_after`.
    #[serde(default, with = "option_duration_nanos_serde")]
    pub stop_after_client_disconnect: Option<Duration>,
    /// Do not replace allocations whose node went down.
    #[serde(default)]
    pub prevent_reschedule_on_lost: bool,
    #[serde(default)]
    pub services: Vec<Service>,
    #[serde(default)]
    pub networks: Vec<NetworkResource>,
    #[serde(default)]
    pub volumes: BTreeMap<String, VolumeRequest>,
    #[serde(default)]
    pub meta: BTreeMap<String, String>,
    #[serde(default, with = "option_duration_nanos_serde")]
    pub shutdown_delay: Option<Duration>,
}

impl TaskGroup {
    /// Fills defaults that depend on the job type.
    pub fn canonicalize(&mut self, job_type: &JobType) {
        if self.restart_policy.is_none() {
            self.restart_policy = Some(match job_type {
                JobType::Batch | JobType::SysBatch => RestartPolicy::default_batch(),
                _ => RestartPolicy::default_service(),
            });
        }
        if self.reschedule_policy.is_none() {
            self.reschedule_policy = match job_type {
                JobType::Service => Some(ReschedulePolicy::default_service()),
                JobType::Batch => Some(ReschedulePolicy::default_batch()),
                _ => None,
            };
        }
        if *job_type == JobType::Service && self.migrate.is_none() {
            self.migrate = Some(MigrateStrategy::default());
        }
        if self.ephemeral_disk.is_none() {
            self.ephemeral_disk = Some(EphemeralDisk::default());
        }
        for svc in &mut self.services {
            if let Some(wi) = &mut svc.identity {
                wi.canonicalize();
            }
        }
        for task in &mut self.tasks {
            task.canonicalize();
        }
    }

    pub fn validate(&self, job: &Job) -> Result<(), ValidationErrors> {
        let mut errs = ValidationErrors::new();
        if self.name.is_empty() {
            errs.push("Missing task group name");
        }
        if self.count < 0 {
            errs.push("Task group count can't be negative");
        }
        if self.tasks.is_empty() {
            errs.push("Missing tasks for task group");
        }
        for (idx, constr) in self.constraints.iter().enumerate() {
            errs.nest(
                format!("Constraint {} validation failed", idx + 1),
                constr.validate(),
            );
        }

        match &self.restart_policy {
            Some(policy) => errs.merge(policy.validate()),
            None => errs.push(format!(
                "Task Group {} should have a restart policy",
                self.name
            )),
        }

        match (&job.job_type, &self.reschedule_policy) {
            (JobType::System | JobType::SysBatch, Some(_)) => {
                errs.push("System jobs should not have a reschedule policy");
            }
            (JobType::System | JobType::SysBatch, None) => {}
            (_, Some(policy)) => errs.merge(policy.validate()),
            (_, None) => errs.push(format!(
                "Task Group {} should have a reschedule policy",
                self.name
            )),
        }

        match &self.ephemeral_disk {
            Some(disk) => errs.merge(disk.validate()),
            None => errs.push(format!(
                "Task Group {} should have an ephemeral disk object",
                self.name
            )),
        }

        if let Some(update) = &self.update {
            if !matches!(job.job_type, JobType::Service | JobType::System) {
                errs.push(format!(
                    "Job type {:?} does not allow update block",
                    job.job_type.as_str()
                ));
            }
            errs.merge(update.validate());
        }

        match (&job.job_type, &self.migrate) {
            (JobType::Service, Some(migrate)) => errs.merge(migrate.validate()),
            (_, Some(_)) => errs.push(format!(
                "Job type {:?} does not allow migrate block",
                job.job_type.as_str()
            )),
            (_, None) => {}
        }

        errs.merge(self.validate_disconnect());

        let mut tasks: BTreeMap<&str, usize> = BTreeMap::new();
        let mut leaders = 0;
        for (idx, task) in self.tasks.iter().enumerate() {
            if task.name.is_empty() {
                errs.push(format!("Task {} missing name", idx + 1));
            } else if let Some(existing) = tasks.get(task.name.as_str()) {
                errs.push(format!(
                    "Task {} redefines '{}' from task {}",
                    idx + 1,
                    task.name,
                    existing + 1
                ));
            } else {
                tasks.insert(task.name.as_str(), idx);
            }
            if task.leader {
                leaders += 1;
            }
        }
        if leaders > 1 {
            errs.push("Only one task may be marked as leader");
        }

        let can_update = self.update.as_ref().is_some_and(|u| u.canary > 0);
        for (name, volume) in &self.volumes {
            errs.extend(volume.validate(name, &job.job_type, can_update));
        }

        if let Err(inner) = self.validate_networks() {
            errs.nest("Task group network validation failed", Err(inner));
        }
        if let Err(inner) = self.validate_services() {
            errs.nest("Task group service validation failed", Err(inner));
        }

        for task in &self.tasks {
            for (idx, mount) in task.volume_mounts.iter().enumerate() {
                if mount.volume.is_empty() {
                    errs.push(format!(
                        "Task {} has a volume mount ({idx}) referencing an empty volume",
                        task.name
                    ));
                } else if !self.volumes.contains_key(&mount.volume) {
                    errs.push(format!(
                        "Task {} has a volume mount ({idx}) referencing undefined volume {}",
                        task.name, mount.volume
                    ));
                }
            }
            errs.nest(
                format!("Task {} validation failed", task.name),
                task.validate(self.ephemeral_disk.as_ref(), &job.job_type),
            );
        }
        errs.into_result()
    }

    fn validate_disconnect(&self) -> Result<(), ValidationErrors> {
        let mut errs = ValidationErrors::new();
        if let Some(disconnect) = &self.disconnect {
            if self.max_client_disconnect.is_some() && disconnect.lost_after.is_some() {
                errs.push("using both lost_after and max_client_disconnect is not allowed");
            }
            if self.stop_after_client_disconnect.is_some()
                && disconnect.stop_on_client_after.is_some()
            {
                errs.push(
                    "using both stop_on_client_after and stop_after_client_disconnect is not allowed",
                );
            }
            errs.nest("Disconnect validation failed", disconnect.validate());
        }
        if self.max_client_disconnect.is_some() && self.stop_after_client_disconnect.is_some() {
            errs.push(
                "max_client_disconnect and stop_after_client_disconnect cannot both be set",
            );
        }
        errs.into_result()
    }

    /// Checks for label, static port and mapped port collisions across the
    /// group network and the task networks.
    fn validate_networks(&self) -> Result<(), ValidationErrors> {
        let mut errs = ValidationErrors::new();
        let mut labels: BTreeMap<String, String> = BTreeMap::new();
        let mut static_ports: BTreeMap<(String, u16), String> = BTreeMap::new();
        let mut mapped: BTreeMap<i32, String> = BTreeMap::new();

        for net in &self.networks {
            for port in net.reserved_ports.iter().chain(&net.dynamic_ports) {
                match labels.get(&port.label) {
                    Some(other) => errs.push(format!(
                        "Port label {} already in use by {other}",
                        port.label
                    )),
                    None => {
                        labels.insert(port.label.clone(), "taskgroup network".to_string());
                    }
                }
                if port.value != 0 {
                    let key = (port.host_network.clone(), port.value);
                    match static_ports.get(&key) {
                        Some(other) => errs.push(format!(
                            "Static port {} already reserved by {other}",
                            port.value
                        )),
                        None => {
                            static_ports.insert(key, format!("taskgroup network:{}", port.label));
                        }
                    }
                }
                if port.to > 0 {
                    match mapped.get(&port.to) {
                        Some(other) => errs.push(format!(
                            "Port mapped to {} already in use by {other}",
                            port.to
                        )),
                        None => {
                            mapped.insert(port.to, format!("taskgroup network:{}", port.label));
                        }
                    }
                } else if port.to < -1 {
                    errs.push(format!(
                        "Port {:?} cannot be mapped to negative value {}",
                        port.label, port.to
                    ));
                }
            }
        }

        for task in &self.tasks {
            let Some(resources) = &task.resources else {
                continue;
            };
            for net in &resources.networks {
                for port in net.reserved_ports.iter().chain(&net.dynamic_ports) {
                    if let Some(other) = labels.get(&port.label) {
                        errs.push(format!(
                            "Port label {} already in use by {other}",
                            port.label
                        ));
                    }
                    if port.value != 0 {
                        let key = (port.host_network.clone(), port.value);
                        match static_ports.get(&key) {
                            Some(other) => errs.push(format!(
                                "Static port {} already reserved by {other}",
                                port.value
                            )),
                            None => {
                                static_ports.insert(key, format!("{}:{}", task.name, port.label));
                            }
                        }
                    }
                }
            }
        }
        errs.into_result()
    }

    fn validate_services(&self) -> Result<(), ValidationErrors> {
        let mut errs = ValidationErrors::new();
        let mut known = BTreeSet::new();
        for task in &self.tasks {
            for svc in &task.services {
                if !known.insert((svc.name.clone(), svc.port_label.clone())) {
                    errs.push(format!("Service {} is duplicate", svc.name));
                }
            }
        }
        for (idx, svc) in self.services.iter().enumerate() {
            if let Err(inner) = svc.validate() {
                errs.push(format!("Service[{idx}] {} validation failed: {inner}", svc.name));
                continue;
            }
            if !known.insert((svc.name.clone(), svc.port_label.clone())) {
                errs.push(format!("Service {} is duplicate", svc.name));
            }
        }

        let providers: BTreeSet<&str> = self
            .services
            .iter()
            .chain(self.tasks.iter().flat_map(|t| t.services.iter()))
            .map(|s| s.provider.as_str())
            .collect();
        if providers.len() > 1 {
            errs.push(
                "Multiple service providers used: task group services must use the same provider",
            );
        }
        errs.into_result()
    }

    /// Non-fatal findings about dubious settings.
    pub fn warnings(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        if let Some(update) = &self.update {
            if update.max_parallel > self.count {
                warnings.push(format!(
                    "Update max parallel count is greater than task group count ({} > {}). \
                     A destructive change would result in the simultaneous replacement of all allocations.",
                    update.max_parallel, self.count
                ));
            }
        }
        if self.max_client_disconnect.is_some() || self.stop_after_client_disconnect.is_some() {
            warnings.push(
                "max_client_disconnect and stop_after_client_disconnect are deprecated, use the disconnect block"
                    .to_string(),
            );
        }
        for task in &self.tasks {
            for warning in task.warnings() {
                warnings.push(format!("Task {:?}: {warning}", task.name));
            }
        }
        warnings
    }

    pub fn lookup_task(&self, name: &str) -> Option<&Task> {
        self.tasks.iter().find(|t| t.name == name)
    }

    /// Returns true if any group service joins the mesh.
    pub fn uses_connect(&self) -> bool {
        self.services.iter().any(Service::uses_connect)
    }

    /// Window an allocation may stay `unknown`, preferring the disconnect
    /// block over the legacy field.
    pub fn disconnect_lost_after(&self) -> Option<Duration> {
        self.disconnect
            .as_ref()
            .and_then(|d| d.lost_after)
            .or(self.max_client_disconnect)
            .filter(|d| !d.is_zero())
    }

    /// Window the client keeps allocations running after losing contact,
    /// preferring the disconnect block over the legacy field.
    pub fn disconnect_stop_on_client_after(&self) -> Option<Duration> {
        self.disconnect
            .as_ref()
            .and_then(|d| d.stop_on_client_after)
            .or(self.stop_after_client_disconnect)
            .filter(|d| !d.is_zero())
    }

    /// Whether a replacement is placed for an `unknown` allocation.
    pub fn replace_on_disconnect(&self) -> bool {
        self.disconnect
            .as_ref()
            .map_or(true, DisconnectStrategy::should_replace)
    }

    /// Largest kill timeout of the group's tasks, floored at the default.
    pub fn max_kill_timeout(&self) -> Duration {
        self.tasks
            .iter()
            .map(|t| t.kill_timeout)
            .fold(DEFAULT_KILL_TIMEOUT, Duration::max)
    }
}
