//! # Allocations
//!
//! An allocation places one task group of one job on one node. It carries a
//! snapshot of the job taken at placement time, the per-task states reported
//! by the client, and the histories the scheduler consults when deciding
//! whether and when to replace it.
//!
//! ## Design Principles
//!
//! - The job snapshot is shared between plain clones and deep-copied by
//!   [`Allocation::copy`]; the live job never leaks into stored allocations
//! - `alloc_states` and the reschedule tracker are append-only; readers scan
//!   from the tail for the most recent entry of interest
//! - Every time-dependent decision takes `now` explicitly

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use fleet_id::{AllocId, DeploymentId, EvalId, JobId, NamespacedId, NodeId, SigningKeyId};

use crate::job::{Job, JobType};
use crate::reschedule::{DelayFunction, LastRescheduleStatus, ReschedulePolicy, RescheduleTracker};
use crate::resources::{
    AllocatedCpuResources, AllocatedMemoryResources, AllocatedResources, AllocatedSharedResources,
    AllocatedTaskResources, ComparableResources, Resources,
};
use crate::task::Task;
use crate::task_group::TaskGroup;
use crate::time::{add_duration, duration_nanos, from_unix_nanos, unix_nanos, zero_time};
use crate::update::MigrateStrategy;

/// Task event type recorded when a client reconnects.
pub const TASK_CLIENT_RECONNECTED: &str = "Reconnected";

// =============================================================================
// Statuses
// =============================================================================

/// What the servers want the allocation to do.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DesiredStatus {
    #[default]
    Run,
    Stop,
    Evict,
}

impl DesiredStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Run => "run",
            Self::Stop => "stop",
            Self::Evict => "evict",
        }
    }

    /// Returns true for `stop` and `evict`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Stop | Self::Evict)
    }
}

impl std::fmt::Display for DesiredStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the client reports the allocation is doing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClientStatus {
    #[default]
    Pending,
    Running,
    Complete,
    Failed,
    Lost,
    /// The node stopped heartbeating and the group tolerates disconnects.
    Unknown,
}

impl ClientStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Complete => "complete",
            Self::Failed => "failed",
            Self::Lost => "lost",
            Self::Unknown => "unknown",
        }
    }

    /// Returns true for `complete`, `failed` and `lost`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Failed | Self::Lost)
    }
}

impl std::fmt::Display for ClientStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Task State
// =============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStateKind {
    #[default]
    Pending,
    Running,
    Dead,
}

/// An event in the life of a task.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    /// Unix nanoseconds.
    pub time: i64,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub display_message: String,
    #[serde(default)]
    pub details: BTreeMap<String, String>,
}

impl TaskEvent {
    pub fn new(event_type: impl Into<String>, time: DateTime<Utc>) -> Self {
        Self {
            event_type: event_type.into(),
            time: unix_nanos(time),
            ..Self::default()
        }
    }
}

/// Client-reported state of one task.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskState {
    pub state: TaskStateKind,
    #[serde(default)]
    pub failed: bool,
    #[serde(default)]
    pub restarts: u64,
    #[serde(default)]
    pub last_restart: Option<DateTime<Utc>>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    /// Set when the task went dead and will not start again.
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub events: Vec<TaskEvent>,
}

impl TaskState {
    /// Returns true if the task finished and did not fail.
    ///
    /// This is narrower than [`Allocation::terminated`], which also counts
    /// failed and lost allocations.
    pub fn successful(&self) -> bool {
        self.state == TaskStateKind::Dead && !self.failed
    }
}

// =============================================================================
// Transitions and Deployment Status
// =============================================================================

/// Transitions the servers want applied to an allocation. Unset fields leave
/// the current behaviour alone.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DesiredTransition {
    #[serde(default)]
    pub migrate: Option<bool>,
    /// Marks the allocation eligible for rescheduling when it would not be
    /// automatically, e.g. inside a deployment.
    #[serde(default)]
    pub reschedule: Option<bool>,
    /// Reschedule even if the policy says no.
    #[serde(default)]
    pub force_reschedule: Option<bool>,
    /// Skip the shutdown delay when stopping.
    #[serde(default)]
    pub no_shutdown_delay: Option<bool>,
}

impl DesiredTransition {
    /// Merges `other` into `self`, preferring the values set in `other`.
    pub fn merge(&mut self, other: &DesiredTransition) {
        if other.migrate.is_some() {
            self.migrate = other.migrate;
        }
        if other.reschedule.is_some() {
            self.reschedule = other.reschedule;
        }
        if other.force_reschedule.is_some() {
            self.force_reschedule = other.force_reschedule;
        }
        if other.no_shutdown_delay.is_some() {
            self.no_shutdown_delay = other.no_shutdown_delay;
        }
    }

    pub fn should_migrate(&self) -> bool {
        self.migrate == Some(true)
    }

    pub fn should_reschedule(&self) -> bool {
        self.reschedule == Some(true)
    }

    pub fn should_force_reschedule(&self) -> bool {
        self.force_reschedule == Some(true)
    }

    pub fn should_ignore_shutdown_delay(&self) -> bool {
        self.no_shutdown_delay == Some(true)
    }
}

/// Health of an allocation inside a deployment.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AllocDeploymentStatus {
    /// `None` until health is determined.
    #[serde(default)]
    pub healthy: Option<bool>,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub canary: bool,
    #[serde(default)]
    pub modify_index: u64,
}

impl AllocDeploymentStatus {
    pub fn has_health(&self) -> bool {
        self.healthy.is_some()
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy == Some(true)
    }

    pub fn is_unhealthy(&self) -> bool {
        self.healthy == Some(false)
    }

    pub fn is_canary(&self) -> bool {
        self.canary
    }
}

// =============================================================================
// State History
// =============================================================================

/// Field whose transitions are recorded in [`Allocation::alloc_states`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllocStateField {
    ClientStatus,
}

/// One recorded transition.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AllocState {
    pub field: AllocStateField,
    pub value: String,
    pub time: DateTime<Utc>,
}

// =============================================================================
// Allocation
// =============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Allocation {
    pub id: AllocId,
    pub namespace: String,
    pub eval_id: EvalId,
    /// `<job>.<group>[<index>]`.
    pub name: String,
    pub node_id: NodeId,
    #[serde(default)]
    pub node_name: String,
    pub job_id: JobId,
    /// Snapshot of the job at placement time. Stripped from plan updates.
    #[serde(default)]
    pub job: Option<Arc<Job>>,
    pub task_group: String,

    /// Legacy total resources.
    #[serde(default)]
    pub resources: Option<Resources>,
    /// Legacy group-level resources.
    #[serde(default)]
    pub shared_resources: Option<Resources>,
    /// Legacy per-task resources.
    #[serde(default)]
    pub task_resources: BTreeMap<String, Resources>,
    #[serde(default)]
    pub allocated_resources: Option<AllocatedResources>,

    #[serde(default)]
    pub desired_status: DesiredStatus,
    #[serde(default)]
    pub desired_description: String,
    #[serde(default)]
    pub desired_transition: DesiredTransition,
    #[serde(default)]
    pub client_status: ClientStatus,
    #[serde(default)]
    pub client_description: String,
    #[serde(default)]
    pub task_states: BTreeMap<String, TaskState>,
    #[serde(default)]
    pub alloc_states: Vec<AllocState>,

    #[serde(default)]
    pub previous_allocation: AllocId,
    #[serde(default)]
    pub next_allocation: AllocId,
    #[serde(default)]
    pub deployment_id: DeploymentId,
    #[serde(default)]
    pub deployment_status: Option<AllocDeploymentStatus>,
    #[serde(default)]
    pub reschedule_tracker: Option<RescheduleTracker>,
    /// Evaluation that will replace this allocation later.
    #[serde(default)]
    pub followup_eval_id: EvalId,
    #[serde(default)]
    pub preempted_allocations: Vec<AllocId>,
    #[serde(default)]
    pub preempted_by_allocation: AllocId,

    /// Signed workload identities keyed by task, stripped before the
    /// allocation is handed back to clients.
    #[serde(default)]
    pub signed_identities: BTreeMap<String, String>,
    #[serde(default)]
    pub signing_key_id: SigningKeyId,

    #[serde(default)]
    pub create_index: u64,
    #[serde(default)]
    pub modify_index: u64,
    /// Index of the last server-side change.
    #[serde(default)]
    pub alloc_modify_index: u64,
    /// Unix nanoseconds.
    #[serde(default)]
    pub create_time: i64,
    /// Unix nanoseconds.
    #[serde(default)]
    pub modify_time: i64,
}

impl Allocation {
    /// Deep copy including the job snapshot.
    pub fn copy(&self) -> Allocation {
        let mut alloc = self.clone();
        alloc.job = self.job.as_ref().map(|job| Arc::new(Job::clone(job)));
        alloc
    }

    /// Copy that keeps sharing the job snapshot.
    pub fn copy_skip_job(&self) -> Allocation {
        self.clone()
    }

    /// Upgrades legacy resource fields written by older servers.
    pub fn canonicalize(&mut self) {
        if self.allocated_resources.is_none() && !self.task_resources.is_empty() {
            let tasks = self
                .task_resources
                .iter()
                .map(|(name, res)| (name.clone(), legacy_task_resources(res)))
                .collect();
            let shared = self
                .shared_resources
                .as_ref()
                .map(|res| AllocatedSharedResources {
                    disk_mb: res.disk_mb,
                    networks: res.networks.clone(),
                })
                .unwrap_or_default();
            self.allocated_resources = Some(AllocatedResources { tasks, shared });
        }
    }

    /// Index of the allocation within its group, parsed from the name.
    pub fn index(&self) -> u32 {
        self.name
            .strip_suffix(']')
            .and_then(|rest| rest.rsplit_once('['))
            .and_then(|(_, num)| num.parse().ok())
            .unwrap_or(0)
    }

    pub fn job_namespaced_id(&self) -> NamespacedId {
        NamespacedId::new(self.namespace.clone(), self.job_id.as_str())
    }

    // -------------------------------------------------------------------------
    // Status predicates
    // -------------------------------------------------------------------------

    /// Desired or client status is terminal.
    pub fn terminal_status(&self) -> bool {
        self.server_terminal_status() || self.client_terminal_status()
    }

    pub fn server_terminal_status(&self) -> bool {
        self.desired_status.is_terminal()
    }

    pub fn client_terminal_status(&self) -> bool {
        self.client_status.is_terminal()
    }

    /// Returns true if the client finished with the allocation, successfully
    /// or not.
    pub fn terminated(&self) -> bool {
        self.client_status.is_terminal()
    }

    /// Returns true if every task ran to completion without failing.
    pub fn ran_successfully(&self) -> bool {
        !self.task_states.is_empty() && self.task_states.values().all(TaskState::successful)
    }

    // -------------------------------------------------------------------------
    // Job lookups
    // -------------------------------------------------------------------------

    pub fn task_group_spec(&self) -> Option<&TaskGroup> {
        self.job.as_ref()?.lookup_task_group(&self.task_group)
    }

    pub fn lookup_task(&self, name: &str) -> Option<&Task> {
        self.task_group_spec()?.lookup_task(name)
    }

    pub fn reschedule_policy(&self) -> Option<&ReschedulePolicy> {
        self.task_group_spec()?.reschedule_policy.as_ref()
    }

    /// Migrate strategy of the group, if any.
    pub fn migrate_strategy(&self) -> Option<&MigrateStrategy> {
        self.task_group_spec()?.migrate.as_ref()
    }

    /// Returns true if the allocation's data should follow it to its
    /// replacement.
    pub fn should_migrate(&self) -> bool {
        if self.previous_allocation.is_empty() || self.server_terminal_status() {
            return false;
        }
        self.task_group_spec()
            .and_then(|tg| tg.ephemeral_disk.as_ref())
            .is_some_and(|disk| disk.migrate && disk.sticky)
    }

    // -------------------------------------------------------------------------
    // Rescheduling
    // -------------------------------------------------------------------------

    /// Returns true if a failed allocation may be replaced under `policy`.
    pub fn should_reschedule(
        &self,
        policy: Option<&ReschedulePolicy>,
        fail_time: DateTime<Utc>,
    ) -> bool {
        if self.server_terminal_status() {
            return false;
        }
        match self.client_status {
            ClientStatus::Failed => self.reschedule_eligible(policy, fail_time),
            _ => false,
        }
    }

    /// Returns true if the tracker leaves room for another attempt inside the
    /// window ending at `fail_time`.
    pub fn reschedule_eligible(
        &self,
        policy: Option<&ReschedulePolicy>,
        fail_time: DateTime<Utc>,
    ) -> bool {
        let Some(policy) = policy else {
            return false;
        };
        if !policy.enabled() {
            return false;
        }
        if policy.unlimited {
            return true;
        }
        let tracker = match &self.reschedule_tracker {
            Some(tracker) if !tracker.events.is_empty() => tracker,
            _ => return policy.attempts > 0,
        };
        tracker.attempts_within(unix_nanos(fail_time), policy.interval) < policy.attempts
    }

    /// Time of the last task finish, falling back to the allocation's modify
    /// time.
    pub fn last_event_time(&self) -> DateTime<Utc> {
        self.task_states
            .values()
            .filter_map(|s| s.finished_at)
            .max()
            .unwrap_or_else(|| from_unix_nanos(self.modify_time))
    }

    /// Returns true if the last reschedule attempt could not be placed.
    pub fn last_reschedule_failed(&self) -> bool {
        self.reschedule_tracker
            .as_ref()
            .is_some_and(|t| t.last_reschedule == LastRescheduleStatus::FailedToPlace)
    }

    /// Returns `(attempted, allowed)` for the window ending at the last event.
    pub fn reschedule_info(&self) -> (u32, u32) {
        let Some(policy) = self.reschedule_policy() else {
            return (0, 0);
        };
        let attempted = match &self.reschedule_tracker {
            Some(tracker) if policy.attempts > 0 => {
                tracker.attempts_within(unix_nanos(self.last_event_time()), policy.interval)
            }
            _ => 0,
        };
        (attempted, policy.attempts)
    }

    /// When the allocation may next be replaced, and whether that replacement
    /// is still within the policy.
    pub fn next_reschedule_time(&self) -> (DateTime<Utc>, bool) {
        let Some(policy) = self.reschedule_policy() else {
            return (zero_time(), false);
        };
        if policy.attempts == 0 && !policy.unlimited {
            return (zero_time(), false);
        }
        if self.desired_status == DesiredStatus::Stop && !self.last_reschedule_failed() {
            return (zero_time(), false);
        }
        let batch_transition = self
            .job
            .as_ref()
            .is_some_and(|job| job.job_type == JobType::Batch)
            && self.desired_transition.should_reschedule();
        if !batch_transition
            && !matches!(self.client_status, ClientStatus::Failed | ClientStatus::Lost)
        {
            return (zero_time(), false);
        }
        self.next_reschedule_time_from(self.last_event_time(), policy)
    }

    /// Like [`Allocation::next_reschedule_time`] but measured from `from`,
    /// used for allocations that went `unknown` rather than failed.
    pub fn next_reschedule_time_by_time(&self, from: DateTime<Utc>) -> (DateTime<Utc>, bool) {
        match self.reschedule_policy() {
            Some(policy) => self.next_reschedule_time_from(from, policy),
            None => (zero_time(), false),
        }
    }

    fn next_reschedule_time_from(
        &self,
        fail_time: DateTime<Utc>,
        policy: &ReschedulePolicy,
    ) -> (DateTime<Utc>, bool) {
        let delay = self.next_delay();
        let next = add_duration(fail_time, delay);
        let eligible = match &self.reschedule_tracker {
            Some(tracker) if policy.attempts > 0 && !tracker.events.is_empty() => {
                let attempted = tracker.attempts_within(unix_nanos(fail_time), policy.interval);
                attempted < policy.attempts && delay < policy.interval
            }
            _ => policy.unlimited || policy.attempts > 0,
        };
        (next, eligible)
    }

    /// Delay before the next replacement, following the policy's delay
    /// function over the tracker history.
    pub fn next_delay(&self) -> Duration {
        let Some(policy) = self.reschedule_policy() else {
            return Duration::ZERO;
        };
        let events = match &self.reschedule_tracker {
            Some(tracker) if !tracker.events.is_empty() => &tracker.events,
            _ => return policy.delay,
        };
        let mut delay = match policy.delay_function {
            DelayFunction::Exponential => events
                .last()
                .map_or(policy.delay, |e| e.delay.saturating_mul(2)),
            DelayFunction::Fibonacci => match events.as_slice() {
                [.., n2, n1] if n2.delay == policy.max_delay && n1.delay == policy.delay => {
                    n1.delay
                }
                [.., n2, n1] => n1.delay.saturating_add(n2.delay),
                _ => policy.delay,
            },
            _ => return policy.delay,
        };
        if !policy.max_delay.is_zero() && delay > policy.max_delay {
            delay = policy.max_delay;
            if let Some(last) = events.last() {
                let since_last =
                    i128::from(unix_nanos(self.last_event_time())) - i128::from(last.reschedule_time);
                if since_last > i128::from(duration_nanos(delay)) {
                    delay = policy.delay;
                }
            }
        }
        delay
    }

    // -------------------------------------------------------------------------
    // Disconnects
    // -------------------------------------------------------------------------

    /// Time at which an allocation disconnected at `now` is considered lost.
    /// Returns `now` when the group does not tolerate disconnects.
    pub fn disconnect_timeout(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        match self.task_group_spec().and_then(TaskGroup::disconnect_lost_after) {
            Some(timeout) => add_duration(now, timeout),
            None => now,
        }
    }

    /// Returns true if the client should stop the allocation on its own after
    /// losing contact.
    pub fn should_client_stop(&self) -> bool {
        self.task_group_spec()
            .and_then(TaskGroup::disconnect_stop_on_client_after)
            .is_some()
    }

    /// When the servers may assume a disconnected client stopped the
    /// allocation: first lost transition + stop window + longest kill timeout.
    pub fn wait_client_stop(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let Some(tg) = self.task_group_spec() else {
            return now;
        };
        let first_lost = self
            .alloc_states
            .iter()
            .find(|s| {
                s.field == AllocStateField::ClientStatus && s.value == ClientStatus::Lost.as_str()
            })
            .map_or(now, |s| s.time);
        let stop_after = tg.disconnect_stop_on_client_after().unwrap_or_default();
        add_duration(first_lost, stop_after.saturating_add(tg.max_kill_timeout()))
    }

    /// Returns false when the group asks not to replace `unknown`
    /// allocations.
    pub fn replace_on_disconnect(&self) -> bool {
        self.task_group_spec()
            .map_or(true, TaskGroup::replace_on_disconnect)
    }

    /// Most recent transition to `unknown`.
    pub fn last_unknown(&self) -> Option<DateTime<Utc>> {
        self.alloc_states
            .iter()
            .filter(|s| {
                s.field == AllocStateField::ClientStatus
                    && s.value == ClientStatus::Unknown.as_str()
            })
            .map(|s| s.time)
            .max()
    }

    /// Returns true if an `unknown` allocation outlived its lost-after
    /// window.
    pub fn expired(&self, now: DateTime<Utc>) -> bool {
        if self.client_status != ClientStatus::Unknown {
            return false;
        }
        let Some(last_unknown) = self.last_unknown() else {
            return false;
        };
        let Some(timeout) = self
            .task_group_spec()
            .and_then(TaskGroup::disconnect_lost_after)
        else {
            return false;
        };
        add_duration(last_unknown, timeout) <= now
    }

    /// Returns true if the latest client status transition is to `unknown`.
    pub fn needs_to_reconnect(&self) -> bool {
        self.alloc_states
            .iter()
            .rev()
            .find(|s| s.field == AllocStateField::ClientStatus)
            .is_some_and(|s| s.value == ClientStatus::Unknown.as_str())
    }

    /// Returns `(reconnected, expired)`: whether a task recorded a reconnect
    /// and whether that happened after the allocation expired.
    pub fn reconnected(&self) -> (bool, bool) {
        let last_reconnect = self
            .task_states
            .values()
            .flat_map(|s| s.events.iter())
            .filter(|e| e.event_type == TASK_CLIENT_RECONNECTED)
            .map(|e| e.time)
            .max();
        match last_reconnect {
            Some(time) => (true, self.expired(from_unix_nanos(time))),
            None => (false, false),
        }
    }

    /// The follow-up evaluation to run when a client that was `unknown`
    /// reports back with `update`.
    pub fn followup_eval_for_reconnect(&self, update: ClientStatus) -> Option<&EvalId> {
        let reported = matches!(
            update,
            ClientStatus::Running | ClientStatus::Complete | ClientStatus::Failed
        );
        (reported && self.needs_to_reconnect() && !self.followup_eval_id.is_empty())
            .then_some(&self.followup_eval_id)
    }

    /// Records a transition at the current time.
    pub fn append_state(&mut self, field: AllocStateField, value: impl Into<String>) {
        self.append_state_at(field, value, Utc::now());
    }

    pub fn append_state_at(
        &mut self,
        field: AllocStateField,
        value: impl Into<String>,
        time: DateTime<Utc>,
    ) {
        self.alloc_states.push(AllocState {
            field,
            value: value.into(),
            time,
        });
    }

    // -------------------------------------------------------------------------
    // Projections
    // -------------------------------------------------------------------------

    /// Resources of the allocation for fit checks, upgrading legacy fields.
    pub fn comparable_resources(&self) -> ComparableResources {
        if let Some(allocated) = &self.allocated_resources {
            return allocated.comparable();
        }
        let resources = match &self.resources {
            Some(resources) => resources.clone(),
            None => {
                let mut total = self.shared_resources.clone().unwrap_or_default();
                for (task, res) in &self.task_resources {
                    if let Err(err) = total.add(res) {
                        warn!(alloc_id = %self.id, task = %task, error = %err, "Skipping task network");
                    }
                }
                total
            }
        };
        ComparableResources {
            flattened: legacy_task_resources(&resources),
            shared: AllocatedSharedResources {
                disk_mb: resources.disk_mb,
                networks: Vec::new(),
            },
        }
    }

    /// Copy safe to return to clients: signed identities removed.
    pub fn sanitize(&self) -> Allocation {
        let mut alloc = self.copy_skip_job();
        alloc.signed_identities.clear();
        alloc
    }

    pub fn stub(&self) -> AllocListStub {
        AllocListStub {
            id: self.id.clone(),
            eval_id: self.eval_id.clone(),
            name: self.name.clone(),
            namespace: self.namespace.clone(),
            node_id: self.node_id.clone(),
            node_name: self.node_name.clone(),
            job_id: self.job_id.clone(),
            job_type: self
                .job
                .as_ref()
                .map(|j| j.job_type.clone())
                .unwrap_or_default(),
            job_version: self.job.as_ref().map_or(0, |j| j.version),
            task_group: self.task_group.clone(),
            desired_status: self.desired_status,
            desired_description: self.desired_description.clone(),
            desired_transition: self.desired_transition.clone(),
            client_status: self.client_status,
            client_description: self.client_description.clone(),
            task_states: self.task_states.clone(),
            deployment_status: self.deployment_status.clone(),
            followup_eval_id: self.followup_eval_id.clone(),
            reschedule_tracker: self.reschedule_tracker.clone(),
            preempted_allocations: self.preempted_allocations.clone(),
            preempted_by_allocation: self.preempted_by_allocation.clone(),
            create_index: self.create_index,
            modify_index: self.modify_index,
            create_time: self.create_time,
            modify_time: self.modify_time,
        }
    }
}

fn legacy_task_resources(res: &Resources) -> AllocatedTaskResources {
    AllocatedTaskResources {
        cpu: AllocatedCpuResources {
            cpu_shares: res.cpu,
            reserved_cores: Vec::new(),
        },
        memory: AllocatedMemoryResources {
            memory_mb: res.memory_mb,
            memory_max_mb: res.memory_max_mb,
        },
        networks: res.networks.clone(),
        devices: Vec::new(),
    }
}

/// Lightweight projection of an allocation used in list responses.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AllocListStub {
    pub id: AllocId,
    pub eval_id: EvalId,
    pub name: String,
    pub namespace: String,
    pub node_id: NodeId,
    pub node_name: String,
    pub job_id: JobId,
    pub job_type: JobType,
    pub job_version: u64,
    pub task_group: String,
    pub desired_status: DesiredStatus,
    pub desired_description: String,
    pub desired_transition: DesiredTransition,
    pub client_status: ClientStatus,
    pub client_description: String,
    pub task_states: BTreeMap<String, TaskState>,
    pub deployment_status: Option<AllocDeploymentStatus>,
    pub followup_eval_id: EvalId,
    pub reschedule_tracker: Option<RescheduleTracker>,
    pub preempted_allocations: Vec<AllocId>,
    pub preempted_by_allocation: AllocId,
    pub create_index: u64,
    pub modify_index: u64,
    pub create_time: i64,
    pub modify_time: i64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disconnect::DisconnectStrategy;
    use crate::reschedule::RescheduleEvent;
    use chrono::TimeZone;
    use proptest::prelude::*;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
    }

    fn secs(n: u64) -> Duration {
        Duration::from_secs(n)
    }

    fn job_with(policy: ReschedulePolicy, job_type: JobType) -> Job {
        let mut job = Job {
            region: "global".into(),
            id: JobId::new("web"),
            name: "web".into(),
            job_type: job_type.clone(),
            datacenters: vec!["dc1".into()],
            task_groups: vec![TaskGroup {
                name: "web".into(),
                count: 1,
                tasks: vec![Task {
                    name: "server".into(),
                    driver: "exec".into(),
                    ..Task::default()
                }],
                reschedule_policy: Some(policy),
                ..TaskGroup::default()
            }],
            ..Job::default()
        };
        job.canonicalize();
        job
    }

    fn failed_alloc(job: Job, finished_at: DateTime<Utc>) -> Allocation {
        Allocation {
            id: AllocId::generate(),
            namespace: "default".into(),
            name: "web.web[0]".into(),
            node_id: NodeId::generate(),
            job_id: job.id.clone(),
            task_group: "web".into(),
            job: Some(Arc::new(job)),
            client_status: ClientStatus::Failed,
            task_states: BTreeMap::from([(
                "server".to_string(),
                TaskState {
                    state: TaskStateKind::Dead,
                    failed: true,
                    finished_at: Some(finished_at),
                    ..TaskState::default()
                },
            )]),
            ..Allocation::default()
        }
    }

    fn constant_policy() -> ReschedulePolicy {
        ReschedulePolicy {
            attempts: 2,
            interval: secs(3600),
            delay: secs(120),
            delay_function: DelayFunction::Constant,
            max_delay: Duration::ZERO,
            unlimited: false,
        }
    }

    fn event(at: DateTime<Utc>, delay: Duration) -> RescheduleEvent {
        RescheduleEvent::new(unix_nanos(at), AllocId::generate(), NodeId::generate(), delay)
    }

    #[test]
    fn test_reschedule_window() {
        let job = job_with(constant_policy(), JobType::Service);
        let mut alloc = failed_alloc(job, t0());
        assert_eq!(alloc.next_reschedule_time(), (t0() + chrono::Duration::minutes(2), true));

        alloc.reschedule_tracker = Some(RescheduleTracker {
            events: vec![
                event(t0() - chrono::Duration::minutes(30), secs(120)),
                event(t0() - chrono::Duration::minutes(10), secs(120)),
            ],
            last_reschedule: LastRescheduleStatus::Success,
        });
        let (_, eligible) = alloc.next_reschedule_time();
        assert!(!eligible);
        assert!(!alloc.should_reschedule(alloc.reschedule_policy(), t0()));
        assert_eq!(alloc.reschedule_info(), (2, 2));
    }

    #[test]
    fn test_events_outside_window_do_not_count() {
        let job = job_with(constant_policy(), JobType::Service);
        let mut alloc = failed_alloc(job, t0());
        alloc.reschedule_tracker = Some(RescheduleTracker {
            events: vec![
                event(t0() - chrono::Duration::hours(3), secs(120)),
                event(t0() - chrono::Duration::minutes(10), secs(120)),
            ],
            last_reschedule: LastRescheduleStatus::Success,
        });
        assert!(alloc.next_reschedule_time().1);
        assert!(alloc.should_reschedule(alloc.reschedule_policy(), t0()));
    }

    #[test]
    fn test_disabled_policy_never_reschedules() {
        let policy = ReschedulePolicy {
            attempts: 0,
            unlimited: false,
            ..constant_policy()
        };
        let alloc = failed_alloc(job_with(policy, JobType::Service), t0());
        assert_eq!(alloc.next_reschedule_time(), (zero_time(), false));
        assert!(!alloc.should_reschedule(alloc.reschedule_policy(), t0()));
    }

    #[test]
    fn test_stopped_alloc_only_after_failed_placement() {
        let mut alloc = failed_alloc(job_with(constant_policy(), JobType::Service), t0());
        alloc.desired_status = DesiredStatus::Stop;
        assert!(!alloc.next_reschedule_time().1);
        alloc.reschedule_tracker = Some(RescheduleTracker {
            events: vec![event(t0() - chrono::Duration::minutes(5), secs(120))],
            last_reschedule: LastRescheduleStatus::FailedToPlace,
        });
        assert!(alloc.next_reschedule_time().1);
    }

    #[test]
    fn test_batch_reschedule_transition() {
        let mut alloc = failed_alloc(job_with(constant_policy(), JobType::Batch), t0());
        alloc.client_status = ClientStatus::Complete;
        assert!(!alloc.next_reschedule_time().1);
        alloc.desired_transition.reschedule = Some(true);
        assert!(alloc.next_reschedule_time().1);
    }

    #[test]
    fn test_exponential_delay_clamped() {
        let policy = ReschedulePolicy {
            attempts: 0,
            interval: Duration::ZERO,
            delay: secs(30),
            delay_function: DelayFunction::Exponential,
            max_delay: secs(100),
            unlimited: true,
        };
        let mut alloc = failed_alloc(job_with(policy, JobType::Service), t0());
        assert_eq!(alloc.next_delay(), secs(30));
        alloc.reschedule_tracker = Some(RescheduleTracker {
            events: vec![event(t0() - chrono::Duration::seconds(10), secs(30))],
            ..RescheduleTracker::default()
        });
        assert_eq!(alloc.next_delay(), secs(60));
        alloc.reschedule_tracker = Some(RescheduleTracker {
            events: vec![event(t0() - chrono::Duration::seconds(10), secs(80))],
            ..RescheduleTracker::default()
        });
        assert_eq!(alloc.next_delay(), secs(100));
    }

    #[test]
    fn test_delay_series_resets_after_quiet_period() {
        let policy = ReschedulePolicy {
            attempts: 0,
            interval: Duration::ZERO,
            delay: secs(30),
            delay_function: DelayFunction::Exponential,
            max_delay: secs(100),
            unlimited: true,
        };
        let mut alloc = failed_alloc(job_with(policy, JobType::Service), t0());
        alloc.reschedule_tracker = Some(RescheduleTracker {
            events: vec![event(t0() - chrono::Duration::hours(2), secs(80))],
            ..RescheduleTracker::default()
        });
        assert_eq!(alloc.next_delay(), secs(30));
    }

    #[test]
    fn test_fibonacci_delay() {
        let policy = ReschedulePolicy {
            attempts: 0,
            interval: Duration::ZERO,
            delay: secs(5),
            delay_function: DelayFunction::Fibonacci,
            max_delay: secs(50),
            unlimited: true,
        };
        let mut alloc = failed_alloc(job_with(policy, JobType::Service), t0());
        let at = t0() - chrono::Duration::seconds(1);
        alloc.reschedule_tracker = Some(RescheduleTracker {
            events: vec![event(at, secs(5))],
            ..RescheduleTracker::default()
        });
        assert_eq!(alloc.next_delay(), secs(5));
        alloc.reschedule_tracker = Some(RescheduleTracker {
            events: vec![event(at, secs(5)), event(at, secs(8)), event(at, secs(13))],
            ..RescheduleTracker::default()
        });
        assert_eq!(alloc.next_delay(), secs(21));
        alloc.reschedule_tracker = Some(RescheduleTracker {
            events: vec![event(at, secs(50)), event(at, secs(5))],
            ..RescheduleTracker::default()
        });
        assert_eq!(alloc.next_delay(), secs(5));
    }

    #[test]
    fn test_last_event_time_falls_back_to_modify_time() {
        let mut alloc = failed_alloc(job_with(constant_policy(), JobType::Service), t0());
        assert_eq!(alloc.last_event_time(), t0());
        alloc.task_states.clear();
        alloc.modify_time = unix_nanos(t0() + chrono::Duration::seconds(5));
        assert_eq!(alloc.last_event_time(), t0() + chrono::Duration::seconds(5));
    }

    fn disconnecting_alloc(disconnect: DisconnectStrategy, kill_timeout: Duration) -> Allocation {
        let mut job = job_with(constant_policy(), JobType::Service);
        job.task_groups[0].disconnect = Some(disconnect);
        job.task_groups[0].tasks[0].kill_timeout = kill_timeout;
        let mut alloc = failed_alloc(job, t0());
        alloc.client_status = ClientStatus::Unknown;
        alloc
    }

    #[test]
    fn test_disconnect_expiry() {
        let mut alloc = disconnecting_alloc(
            DisconnectStrategy {
                lost_after: Some(secs(5)),
                ..DisconnectStrategy::default()
            },
            secs(5),
        );
        assert!(!alloc.expired(t0()));
        alloc.append_state_at(AllocStateField::ClientStatus, "unknown", t0());
        assert!(!alloc.expired(t0() + chrono::Duration::seconds(3)));
        assert!(alloc.expired(t0() + chrono::Duration::seconds(5)));
        assert!(alloc.expired(t0() + chrono::Duration::seconds(6)));
        assert_eq!(alloc.disconnect_timeout(t0()), t0() + chrono::Duration::seconds(5));
    }

    #[test]
    fn test_stop_on_client_wait() {
        let mut alloc = disconnecting_alloc(
            DisconnectStrategy {
                stop_on_client_after: Some(secs(2)),
                ..DisconnectStrategy::default()
            },
            secs(5),
        );
        assert!(alloc.should_client_stop());
        assert_eq!(alloc.wait_client_stop(t0()), t0() + chrono::Duration::seconds(7));

        let lost_at = t0() - chrono::Duration::seconds(30);
        alloc.append_state_at(AllocStateField::ClientStatus, "lost", lost_at);
        alloc.append_state_at(AllocStateField::ClientStatus, "lost", t0());
        assert_eq!(alloc.wait_client_stop(t0()), lost_at + chrono::Duration::seconds(7));
    }

    #[test]
    fn test_unconfigured_disconnect() {
        let mut alloc = failed_alloc(job_with(constant_policy(), JobType::Service), t0());
        alloc.client_status = ClientStatus::Unknown;
        alloc.append_state_at(AllocStateField::ClientStatus, "unknown", t0());
        assert_eq!(alloc.disconnect_timeout(t0()), t0());
        assert!(!alloc.should_client_stop());
        assert!(!alloc.expired(t0() + chrono::Duration::days(1)));
    }

    #[test]
    fn test_reconnect_followup() {
        let mut alloc = disconnecting_alloc(
            DisconnectStrategy {
                lost_after: Some(secs(60)),
                ..DisconnectStrategy::default()
            },
            secs(5),
        );
        alloc.followup_eval_id = EvalId::from("eval-7");
        alloc.append_state_at(AllocStateField::ClientStatus, "running", t0());
        assert!(!alloc.needs_to_reconnect());
        alloc.append_state_at(AllocStateField::ClientStatus, "unknown", t0());
        assert!(alloc.needs_to_reconnect());
        assert_eq!(
            alloc.followup_eval_for_reconnect(ClientStatus::Running),
            Some(&EvalId::from("eval-7"))
        );
        assert_eq!(alloc.followup_eval_for_reconnect(ClientStatus::Pending), None);
    }

    #[test]
    fn test_reconnected_before_expiry() {
        let mut alloc = disconnecting_alloc(
            DisconnectStrategy {
                lost_after: Some(secs(60)),
                ..DisconnectStrategy::default()
            },
            secs(5),
        );
        assert_eq!(alloc.reconnected(), (false, false));
        alloc.append_state_at(AllocStateField::ClientStatus, "unknown", t0());
        if let Some(state) = alloc.task_states.get_mut("server") {
            state.events.push(TaskEvent::new(
                TASK_CLIENT_RECONNECTED,
                t0() + chrono::Duration::seconds(30),
            ));
        }
        assert_eq!(alloc.reconnected(), (true, false));
    }

    #[test]
    fn test_copy_is_deep() {
        let job = job_with(constant_policy(), JobType::Service);
        let alloc = failed_alloc(job, t0());
        let mut copy = alloc.copy();
        assert_eq!(copy, alloc);
        assert!(!Arc::ptr_eq(
            copy.job.as_ref().unwrap(),
            alloc.job.as_ref().unwrap()
        ));
        let shallow = alloc.copy_skip_job();
        assert!(Arc::ptr_eq(
            shallow.job.as_ref().unwrap(),
            alloc.job.as_ref().unwrap()
        ));

        if let Some(job) = copy.job.as_mut() {
            Arc::make_mut(job).task_groups[0].count = 9;
        }
        copy.task_states.get_mut("server").unwrap().restarts = 4;
        copy.preempted_allocations.push(AllocId::generate());
        assert_eq!(alloc.task_group_spec().unwrap().count, 1);
        assert_eq!(alloc.task_states["server"].restarts, 0);
        assert!(alloc.preempted_allocations.is_empty());
    }

    #[test]
    fn test_index_from_name() {
        let mut alloc = Allocation {
            name: "example.cache[12]".into(),
            ..Allocation::default()
        };
        assert_eq!(alloc.index(), 12);
        alloc.name = "weird".into();
        assert_eq!(alloc.index(), 0);
    }

    #[test]
    fn test_ran_successfully_vs_terminated() {
        let mut alloc = failed_alloc(job_with(constant_policy(), JobType::Batch), t0());
        assert!(alloc.terminated());
        assert!(!alloc.ran_successfully());
        alloc.client_status = ClientStatus::Lost;
        assert!(alloc.terminated());
        alloc.client_status = ClientStatus::Complete;
        if let Some(state) = alloc.task_states.get_mut("server") {
            state.failed = false;
        }
        assert!(alloc.ran_successfully());
        alloc.task_states.clear();
        assert!(!alloc.ran_successfully());
    }

    #[test]
    fn test_should_migrate_requires_sticky_migrate() {
        let mut job = job_with(constant_policy(), JobType::Service);
        if let Some(disk) = job.task_groups[0].ephemeral_disk.as_mut() {
            disk.sticky = true;
            disk.migrate = true;
        }
        let mut alloc = failed_alloc(job, t0());
        assert!(!alloc.should_migrate());
        alloc.previous_allocation = AllocId::generate();
        assert!(alloc.should_migrate());
        alloc.desired_status = DesiredStatus::Evict;
        assert!(!alloc.should_migrate());
    }

    #[test]
    fn test_legacy_resources_upgrade() {
        let mut alloc = Allocation {
            task_resources: BTreeMap::from([(
                "web".to_string(),
                Resources {
                    cpu: 500,
                    memory_mb: 256,
                    ..Resources::default()
                },
            )]),
            shared_resources: Some(Resources {
                disk_mb: 150,
                ..Resources::default()
            }),
            ..Allocation::default()
        };
        let legacy = alloc.comparable_resources();
        assert_eq!(legacy.flattened.cpu.cpu_shares, 500);
        assert_eq!(legacy.shared.disk_mb, 150);

        alloc.canonicalize();
        let upgraded = alloc.allocated_resources.as_ref().unwrap();
        assert_eq!(upgraded.tasks["web"].memory.memory_mb, 256);
        assert_eq!(alloc.comparable_resources(), legacy);
    }

    #[test]
    fn test_sanitize_strips_identities() {
        let mut alloc = failed_alloc(job_with(constant_policy(), JobType::Service), t0());
        alloc.signed_identities.insert("server".into(), "jwt".into());
        assert!(alloc.sanitize().signed_identities.is_empty());
        assert_eq!(alloc.signed_identities.len(), 1);
    }

    #[test]
    fn test_stub_projection() {
        let alloc = failed_alloc(job_with(constant_policy(), JobType::Batch), t0());
        let stub = alloc.stub();
        assert_eq!(stub.id, alloc.id);
        assert_eq!(stub.job_type, JobType::Batch);
        assert_eq!(stub.client_status, ClientStatus::Failed);
    }

    #[test]
    fn test_desired_transition_merge() {
        let mut dt = DesiredTransition {
            migrate: Some(true),
            ..DesiredTransition::default()
        };
        dt.merge(&DesiredTransition {
            reschedule: Some(true),
            ..DesiredTransition::default()
        });
        assert!(dt.should_migrate());
        assert!(dt.should_reschedule());
        assert!(!dt.should_force_reschedule());
    }

    #[test]
    fn test_deployment_status_health() {
        let mut status = AllocDeploymentStatus::default();
        assert!(!status.has_health());
        assert!(!status.is_healthy() && !status.is_unhealthy());
        status.healthy = Some(false);
        assert!(status.is_unhealthy());
    }

    fn desired() -> impl Strategy<Value = DesiredStatus> {
        prop_oneof![
            Just(DesiredStatus::Run),
            Just(DesiredStatus::Stop),
            Just(DesiredStatus::Evict)
        ]
    }

    fn client() -> impl Strategy<Value = ClientStatus> {
        prop_oneof![
            Just(ClientStatus::Pending),
            Just(ClientStatus::Running),
            Just(ClientStatus::Complete),
            Just(ClientStatus::Failed),
            Just(ClientStatus::Lost),
            Just(ClientStatus::Unknown)
        ]
    }

    proptest! {
        #[test]
        fn prop_terminal_is_disjunction(d in desired(), c in client()) {
            let alloc = Allocation {
                desired_status: d,
                client_status: c,
                ..Allocation::default()
            };
            prop_assert_eq!(
                alloc.terminal_status(),
                alloc.server_terminal_status() || alloc.client_terminal_status()
            );
        }

        #[test]
        fn prop_not_failed_or_lost_never_eligible(
            c in client(),
            events in 0usize..4,
        ) {
            prop_assume!(!matches!(c, ClientStatus::Failed | ClientStatus::Lost));
            let mut alloc = failed_alloc(job_with(constant_policy(), JobType::Service), t0());
            alloc.client_status = c;
            alloc.reschedule_tracker = Some(RescheduleTracker {
                events: (0..events).map(|_| event(t0(), secs(120))).collect(),
                last_reschedule: LastRescheduleStatus::Success,
            });
            prop_assert!(!alloc.next_reschedule_time().1);
        }
    }
}
