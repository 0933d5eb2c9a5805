//! # Deployments
//!
//! Per-job rolling update state: one [`DeploymentState`] per task group tracks
//! canaries, promotion and health counts.
//!
//! Status descriptions double as machine-readable reasons; the rollback
//! helpers append a trailer to a base description so readers can still match
//! on the prefix.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use fleet_id::{AllocId, DeploymentId, JobId};

use crate::job::Job;
use crate::time::duration_nanos_serde;

pub const DEPLOYMENT_STATUS_DESCRIPTION_RUNNING: &str = "Deployment is running";
pub const DEPLOYMENT_STATUS_DESCRIPTION_RUNNING_NEEDS_PROMOTION: &str =
    "Deployment is running but requires manual promotion";
pub const DEPLOYMENT_STATUS_DESCRIPTION_RUNNING_AUTO_PROMOTION: &str =
    "Deployment is running pending automatic promotion";
pub const DEPLOYMENT_STATUS_DESCRIPTION_INITIALIZING: &str = "Deployment is initializing";
pub const DEPLOYMENT_STATUS_DESCRIPTION_PAUSED: &str = "Deployment is paused";
pub const DEPLOYMENT_STATUS_DESCRIPTION_PENDING_FOR_PEER: &str =
    "Deployment is pending, waiting for peer region";
pub const DEPLOYMENT_STATUS_DESCRIPTION_BLOCKED: &str =
    "Deployment is complete but waiting for peer region";
pub const DEPLOYMENT_STATUS_DESCRIPTION_UNBLOCKING: &str = "Deployment is unblocking remaining regions";
pub const DEPLOYMENT_STATUS_DESCRIPTION_SUCCESSFUL: &str = "Deployment completed successfully";
pub const DEPLOYMENT_STATUS_DESCRIPTION_STOPPED_JOB: &str = "Cancelled because job is stopped";
pub const DEPLOYMENT_STATUS_DESCRIPTION_NEWER_JOB: &str = "Cancelled due to newer version of job";
pub const DEPLOYMENT_STATUS_DESCRIPTION_FAILED_ALLOCATIONS: &str =
    "Failed due to unhealthy allocations";
pub const DEPLOYMENT_STATUS_DESCRIPTION_PROGRESS_DEADLINE: &str = "Failed due to progress deadline";
pub const DEPLOYMENT_STATUS_DESCRIPTION_FAILED_BY_USER: &str = "Deployment marked as failed";

/// Description of a deployment that rolls the job back to `job_version`.
pub fn deployment_status_description_rollback(base: &str, job_version: u64) -> String {
    format!("{base} - rolling back to job version {job_version}")
}

/// Description of a deployment that would roll back to a version with the
/// same specification as the current one.
pub fn deployment_status_description_rollback_noop(base: &str, job_version: u64) -> String {
    format!(
        "{base} - not rolling back to stable job version {job_version} as current job has same specification"
    )
}

/// Description of a deployment that wants to auto-revert but has no stable
/// version to go to.
pub fn deployment_status_description_no_rollback_target(base: &str) -> String {
    format!("{base} - no stable job version to auto revert to")
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeploymentStatus {
    /// Multiregion deployment waiting for its peers to be created.
    Initializing,
    Pending,
    #[default]
    Running,
    Paused,
    /// Finished locally, waiting on peer regions.
    Blocked,
    Unblocking,
    Successful,
    Failed,
    Cancelled,
}

impl DeploymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initializing => "initializing",
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Blocked => "blocked",
            Self::Unblocking => "unblocking",
            Self::Successful => "successful",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Returns true while the deployment may still make progress.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            Self::Initializing
                | Self::Pending
                | Self::Running
                | Self::Paused
                | Self::Blocked
                | Self::Unblocking
        )
    }
}

impl std::fmt::Display for DeploymentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Deployment progress of one task group.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentState {
    #[serde(default)]
    pub auto_revert: bool,
    #[serde(default)]
    pub auto_promote: bool,
    #[serde(default, with = "duration_nanos_serde")]
    pub progress_deadline: Duration,
    /// Deadline for the next allocation to turn healthy.
    #[serde(default)]
    pub require_progress_by: Option<DateTime<Utc>>,
    #[serde(default)]
    pub promoted: bool,
    #[serde(default)]
    pub placed_canaries: Vec<AllocId>,
    #[serde(default)]
    pub desired_canaries: u32,
    #[serde(default)]
    pub desired_total: u32,
    #[serde(default)]
    pub placed_allocs: u32,
    #[serde(default)]
    pub healthy_allocs: u32,
    #[serde(default)]
    pub unhealthy_allocs: u32,
}

impl DeploymentState {
    pub fn copy(&self) -> DeploymentState {
        self.clone()
    }

    /// Returns true if the group waits on canaries that are not promoted yet.
    pub fn awaiting_promotion(&self) -> bool {
        self.desired_canaries > 0 && !self.promoted
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Deployment {
    pub id: DeploymentId,
    pub namespace: String,
    pub job_id: JobId,
    pub job_version: u64,
    /// Modify index of the tracked job.
    #[serde(default)]
    pub job_modify_index: u64,
    /// Job modify index of the tracked job; changes only with the spec.
    #[serde(default)]
    pub job_spec_modify_index: u64,
    /// Lets a stopped and re-run job hide deployments of its earlier life.
    #[serde(default)]
    pub job_create_index: u64,
    #[serde(default)]
    pub is_multiregion: bool,
    #[serde(default)]
    pub task_groups: BTreeMap<String, DeploymentState>,
    pub status: DeploymentStatus,
    #[serde(default)]
    pub status_description: String,
    /// Priority of the evaluation that created the deployment.
    #[serde(default)]
    pub eval_priority: i32,
    #[serde(default)]
    pub create_index: u64,
    #[serde(default)]
    pub modify_index: u64,
    /// Unix nanoseconds.
    #[serde(default)]
    pub create_time: i64,
    /// Unix nanoseconds.
    #[serde(default)]
    pub modify_time: i64,
}

impl Deployment {
    /// Starts a deployment for the current version of `job`.
    pub fn new(job: &Job, eval_priority: i32, now: i64) -> Self {
        let is_multiregion = job.is_multiregion();
        let (status, description) = if is_multiregion {
            (
                DeploymentStatus::Initializing,
                DEPLOYMENT_STATUS_DESCRIPTION_INITIALIZING,
            )
        } else {
            (
                DeploymentStatus::Running,
                DEPLOYMENT_STATUS_DESCRIPTION_RUNNING,
            )
        };
        Self {
            id: DeploymentId::generate(),
            namespace: job.namespace.clone(),
            job_id: job.id.clone(),
            job_version: job.version,
            job_modify_index: job.modify_index,
            job_spec_modify_index: job.job_modify_index,
            job_create_index: job.create_index,
            is_multiregion,
            task_groups: BTreeMap::new(),
            status,
            status_description: description.to_string(),
            eval_priority,
            create_index: 0,
            modify_index: 0,
            create_time: now,
            modify_time: now,
        }
    }

    pub fn copy(&self) -> Deployment {
        self.clone()
    }

    /// ID of an optional deployment, empty when there is none.
    pub fn get_id(deployment: Option<&Deployment>) -> DeploymentId {
        deployment.map(|d| d.id.clone()).unwrap_or_default()
    }

    /// Create index of an optional deployment, zero when there is none.
    pub fn get_create_index(deployment: Option<&Deployment>) -> u64 {
        deployment.map_or(0, |d| d.create_index)
    }

    pub fn active(&self) -> bool {
        self.status.is_active()
    }

    pub fn has_placed_canaries(&self) -> bool {
        self.task_groups
            .values()
            .any(|state| !state.placed_canaries.is_empty())
    }

    /// Returns true if a running deployment waits on manual or automatic
    /// promotion of some group.
    pub fn requires_promotion(&self) -> bool {
        self.status == DeploymentStatus::Running
            && self.task_groups.values().any(DeploymentState::awaiting_promotion)
    }

    /// Returns true if every group with canaries promotes automatically.
    pub fn has_auto_promote(&self) -> bool {
        !self.task_groups.is_empty()
            && self
                .task_groups
                .values()
                .filter(|state| state.desired_canaries > 0)
                .all(|state| state.auto_promote)
    }

    /// Status update that moves this deployment to `status`.
    pub fn status_update(
        &self,
        status: DeploymentStatus,
        description: impl Into<String>,
    ) -> DeploymentStatusUpdate {
        DeploymentStatusUpdate {
            deployment_id: self.id.clone(),
            status,
            status_description: description.into(),
        }
    }
}

/// Change of a deployment's status carried in plans.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentStatusUpdate {
    pub deployment_id: DeploymentId,
    pub status: DeploymentStatus,
    #[serde(default)]
    pub status_description: String,
}
