//! # Jobs
//!
//! A job is the scope of a scheduling request: a set of task groups placed
//! together under one namespace and id.
//!
//! ## Design Principles
//!
//! - `canonicalize()` fills defaults; `validate()` never mutates
//! - Validation reports every violation, naming groups and constraints by
//!   position or name
//! - Server-managed fields (status, version, indices) never count as a
//!   specification change

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};

use fleet_id::{is_valid_name, JobId, JobTuple, NamespacedId, DEFAULT_NAMESPACE};

use crate::constraint::Constraint;
use crate::error::ValidationErrors;
use crate::hash::ContentHash;
use crate::multiregion::Multiregion;
use crate::periodic::{ParameterizedJobConfig, PeriodicConfig};
use crate::string_enum;
use crate::task_group::TaskGroup;
use crate::update::UpdateStrategy;
use crate::workload_identity::WIHandle;

pub const JOB_MIN_PRIORITY: i32 = 1;
pub const JOB_DEFAULT_PRIORITY: i32 = 50;
pub const JOB_MAX_PRIORITY: i32 = 100;

/// Node pool a job lands in when it names none.
pub const DEFAULT_NODE_POOL: &str = "default";

string_enum! {
    /// Scheduler that handles a job.
    pub enum JobType {
        Service => "service",
        Batch => "batch",
        System => "system",
        SysBatch => "sysbatch",
    }
}

impl Default for JobType {
    fn default() -> Self {
        Self::Unknown(String::new())
    }
}

/// Lifecycle status of a job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    #[default]
    Pending,
    Running,
    Dead,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Dead => "dead",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub region: String,
    pub namespace: String,
    pub id: JobId,
    /// Set on dispatched and periodic children.
    #[serde(default)]
    pub parent_id: JobId,
    pub name: String,
    #[serde(rename = "type")]
    pub job_type: JobType,
    pub priority: i32,
    /// Commit the whole plan or nothing.
    #[serde(default)]
    pub all_at_once: bool,
    #[serde(default)]
    pub datacenters: Vec<String>,
    #[serde(default)]
    pub node_pool: String,
    #[serde(default)]
    pub constraints: Vec<Constraint>,
    #[serde(default)]
    pub task_groups: Vec<TaskGroup>,
    /// Job-level update block, copied into groups that declare none.
    #[serde(default)]
    pub update: Option<UpdateStrategy>,
    #[serde(default)]
    pub multiregion: Option<Multiregion>,
    #[serde(default)]
    pub periodic: Option<PeriodicConfig>,
    #[serde(default)]
    pub parameterized_job: Option<ParameterizedJobConfig>,
    /// Set on jobs created by dispatching a parameterized job.
    #[serde(default)]
    pub dispatched: bool,
    #[serde(default)]
    pub payload: Vec<u8>,
    #[serde(default)]
    pub meta: BTreeMap<String, String>,
    /// Marked for stopping; allocations are stopped but the job is kept.
    #[serde(default)]
    pub stop: bool,

    // Server-managed fields
    #[serde(default)]
    pub status: JobStatus,
    #[serde(default)]
    pub status_description: String,
    /// The version ran a deployment to completion.
    #[serde(default)]
    pub stable: bool,
    #[serde(default)]
    pub version: u64,
    /// Unix nanoseconds.
    #[serde(default)]
    pub submit_time: i64,
    #[serde(default)]
    pub create_index: u64,
    #[serde(default)]
    pub modify_index: u64,
    /// Index of the last change to the specification itself.
    #[serde(default)]
    pub job_modify_index: u64,
}

impl Job {
    /// Fills defaults before validation.
    pub fn canonicalize(&mut self) {
        if self.namespace.is_empty() {
            self.namespace = DEFAULT_NAMESPACE.to_string();
        }
        if self.priority == 0 {
            self.priority = JOB_DEFAULT_PRIORITY;
        }
        if self.node_pool.is_empty() {
            self.node_pool = DEFAULT_NODE_POOL.to_string();
        }
        let job_type = self.job_type.clone();
        for tg in &mut self.task_groups {
            if tg.update.is_none() {
                if let Some(update) = &self.update {
                    if !update.is_empty() && matches!(job_type, JobType::Service | JobType::System) {
                        tg.update = Some(update.clone());
                    }
                }
            }
            tg.canonicalize(&job_type);
        }
    }

    pub fn validate(&self) -> Result<(), ValidationErrors> {
        let mut errs = ValidationErrors::new();
        if self.region.is_empty() {
            errs.push("Missing job region");
        }
        if let Err(err) = self.id.validate() {
            errs.push(err.to_string());
        }
        if self.name.is_empty() {
            errs.push("Missing job name");
        }
        if self.namespace.is_empty() {
            errs.push("Job must be in a namespace");
        }
        if self.job_type.is_unset() {
            errs.push("Missing job type");
        } else if !self.job_type.is_known() {
            errs.push(format!("Invalid job type: {:?}", self.job_type.as_str()));
        }
        if !(JOB_MIN_PRIORITY..=JOB_MAX_PRIORITY).contains(&self.priority) {
            errs.push(format!(
                "Job priority must be between [{JOB_MIN_PRIORITY}, {JOB_MAX_PRIORITY}]"
            ));
        }
        if self.datacenters.is_empty() {
            errs.push("Missing job datacenters");
        } else if self.datacenters.iter().any(String::is_empty) {
            errs.push("Job datacenter must be non-empty string");
        }
        if !self.node_pool.is_empty() && !is_valid_name(&self.node_pool) {
            errs.push(format!("invalid node pool {:?}", self.node_pool));
        }
        if self.task_groups.is_empty() {
            errs.push("Missing job task groups");
        }
        for (idx, constr) in self.constraints.iter().enumerate() {
            errs.nest(
                format!("Constraint {} validation failed", idx + 1),
                constr.validate(),
            );
        }

        let mut groups: BTreeMap<&str, usize> = BTreeMap::new();
        for (idx, tg) in self.task_groups.iter().enumerate() {
            if tg.name.is_empty() {
                errs.push(format!("Job task group {} missing name", idx + 1));
            } else if let Some(existing) = groups.get(tg.name.as_str()) {
                errs.push(format!(
                    "Job task group {} redefines '{}' from group {}",
                    idx + 1,
                    tg.name,
                    existing + 1
                ));
            } else {
                groups.insert(tg.name.as_str(), idx);
            }
            if self.job_type == JobType::System && tg.count > 1 {
                errs.push(format!(
                    "Job task group {} has count {}. Count cannot exceed 1 with system scheduler",
                    tg.name, tg.count
                ));
            }
        }

        for tg in &self.task_groups {
            errs.nest(
                format!("Task group {} validation failed", tg.name),
                tg.validate(self),
            );
        }

        if let Some(periodic) = self.periodic.as_ref().filter(|p| p.enabled) {
            if self.job_type != JobType::Batch {
                errs.push("Periodic can only be used with \"batch\" scheduler");
            }
            errs.merge(periodic.validate());
        }

        if let Some(parameterized) = &self.parameterized_job {
            if self.job_type != JobType::Batch {
                errs.push("Parameterized job can only be used with \"batch\" scheduler");
            }
            errs.merge(parameterized.validate());
        }

        if !self.payload.is_empty() && !self.dispatched {
            errs.push("Job can't be submitted with a payload, only dispatched");
        }

        if let Some(multiregion) = &self.multiregion {
            if matches!(self.job_type, JobType::System | JobType::SysBatch) {
                errs.push("Multiregion jobs cannot be used with system or sysbatch scheduler");
            }
            errs.merge(multiregion.validate());
        }
        errs.into_result()
    }

    /// Non-fatal findings about dubious settings.
    pub fn warnings(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        let mut auto_promote = 0;
        for tg in &self.task_groups {
            let group_warnings = tg.warnings();
            if !group_warnings.is_empty() {
                warnings.push(format!(
                    "Group {:?} has warnings: {}",
                    tg.name,
                    group_warnings.join("; ")
                ));
            }
            if tg.update.as_ref().is_some_and(|u| u.auto_promote) {
                auto_promote += 1;
            }
        }
        if auto_promote > 0 && auto_promote < self.task_groups.len() {
            warnings.push(
                "auto_promote must be true for all groups to enable automatic promotion"
                    .to_string(),
            );
        }
        warnings
    }

    pub fn lookup_task_group(&self, name: &str) -> Option<&TaskGroup> {
        self.task_groups.iter().find(|tg| tg.name == name)
    }

    pub fn namespaced_id(&self) -> NamespacedId {
        NamespacedId::new(self.namespace.clone(), self.id.as_str())
    }

    pub fn tuple(&self) -> JobTuple {
        JobTuple::new(self.namespace.clone(), self.id.clone(), self.version)
    }

    /// Returns true if the job is marked for stopping.
    pub fn stopped(&self) -> bool {
        self.stop
    }

    pub fn is_periodic(&self) -> bool {
        self.periodic.is_some()
    }

    /// Returns true if the periodic launcher should track the job.
    pub fn is_periodic_active(&self) -> bool {
        self.periodic.as_ref().is_some_and(|p| p.enabled)
            && !self.stopped()
            && !self.is_parameterized()
    }

    /// Returns true for a parameterized template, false for its dispatched
    /// children.
    pub fn is_parameterized(&self) -> bool {
        self.parameterized_job.is_some() && !self.dispatched
    }

    pub fn is_multiregion(&self) -> bool {
        self.multiregion
            .as_ref()
            .is_some_and(|m| !m.regions.is_empty())
    }

    /// Copy with the server-managed fields cleared, leaving only what the
    /// submitter controls.
    fn user_spec(&self) -> Job {
        Job {
            status: JobStatus::default(),
            status_description: String::new(),
            stable: false,
            version: 0,
            submit_time: 0,
            create_index: 0,
            modify_index: 0,
            job_modify_index: 0,
            ..self.clone()
        }
    }

    /// Returns true if `other` differs from this job in anything the
    /// submitter controls.
    pub fn spec_changed(&self, other: &Job) -> bool {
        self.user_spec() != other.user_spec()
    }

    /// Content hash over the submitter-controlled fields.
    pub fn spec_hash(&self) -> Result<ContentHash, serde_json::Error> {
        ContentHash::of(&self.user_spec())
    }

    /// Every identity the servers must sign for an allocation of `group`:
    /// task identities (default and alternates) and service identities.
    pub fn required_signing_identities(&self, group: &str) -> Vec<WIHandle> {
        let Some(tg) = self.lookup_task_group(group) else {
            return Vec::new();
        };
        let mut handles = Vec::new();
        let mut seen = HashSet::new();
        let mut add = |handle: WIHandle| {
            if seen.insert(handle.clone()) {
                handles.push(handle);
            }
        };
        for task in &tg.tasks {
            for wi in task.identity.iter().chain(task.identities.iter()) {
                add(WIHandle::task(task.name.clone(), wi.name.clone()));
            }
            for svc in &task.services {
                if let Some(wi) = &svc.identity {
                    add(WIHandle::service(svc.identity_handle_name(), wi.name.clone()));
                }
            }
        }
        for svc in &tg.services {
            if let Some(wi) = &svc.identity {
                add(WIHandle::service(svc.identity_handle_name(), wi.name.clone()));
            }
        }
        handles
    }
}
