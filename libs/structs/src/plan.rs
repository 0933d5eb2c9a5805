//! # Plans
//!
//! A scheduler worker proposes allocation changes as a [`Plan`]; the applier
//! commits what still fits and answers with a [`PlanResult`].
//!
//! ## Design Principles
//!
//! - Plans bind to a job revision through a [`JobTuple`]; allocation bodies
//!   are reduced to stubs before they go on the wire and re-hydrated by the
//!   applier from its own state
//! - Every change is keyed by node so the applier can commit per node
//! - The `append_*` builders clone their input; the worker's snapshot is
//!   never mutated

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use fleet_id::{AllocId, EvalId, JobTuple, NodeId};

use crate::allocation::{AllocListStub, AllocStateField, Allocation, ClientStatus, DesiredStatus};
use crate::deployment::{Deployment, DeploymentStatusUpdate};
use crate::job::Job;

/// Allocations keyed by the node they live on.
pub type NodeAllocations = BTreeMap<NodeId, Vec<Allocation>>;

/// Desired description of an allocation evicted to make room.
pub fn preempted_description(preempting: &AllocId) -> String {
    format!("Preempted by alloc ID {preempting}")
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub eval_id: EvalId,
    /// Guards against two leaders processing the same evaluation.
    #[serde(default)]
    pub eval_token: String,
    pub priority: i32,
    /// Commit everything or nothing.
    #[serde(default)]
    pub all_at_once: bool,
    #[serde(default)]
    pub job_tuple: Option<JobTuple>,
    /// Allocations to stop or evict.
    #[serde(default)]
    pub node_update: NodeAllocations,
    /// Allocations to create or update in place.
    #[serde(default)]
    pub node_allocation: NodeAllocations,
    /// Allocations of lower-priority jobs evicted for this plan.
    #[serde(default)]
    pub node_preemptions: NodeAllocations,
    #[serde(default)]
    pub deployment: Option<Deployment>,
    #[serde(default)]
    pub deployment_updates: Vec<DeploymentStatusUpdate>,
    /// The applier waits for its state to reach this index before
    /// evaluating the plan.
    #[serde(default)]
    pub snapshot_index: u64,
    #[serde(default)]
    pub annotations: Option<PlanAnnotations>,
}

impl Plan {
    /// Marks `alloc` for stopping.
    pub fn append_stopped_alloc(
        &mut self,
        alloc: &Allocation,
        desired_description: &str,
        client_status: Option<ClientStatus>,
        followup_eval_id: Option<EvalId>,
    ) {
        let mut stopped = alloc.copy_skip_job();
        if self.job_tuple.is_none() {
            if let Some(job) = &alloc.job {
                self.job_tuple = Some(job.tuple());
            }
        }
        stopped.job = None;
        stopped.resources = None;
        stopped.desired_status = DesiredStatus::Stop;
        stopped.desired_description = desired_description.to_string();
        if let Some(status) = client_status {
            stopped.client_status = status;
            stopped.append_state(AllocStateField::ClientStatus, status.as_str());
        }
        if let Some(eval_id) = followup_eval_id.filter(|id| !id.is_empty()) {
            stopped.followup_eval_id = eval_id;
        }
        self.node_update
            .entry(alloc.node_id.clone())
            .or_default()
            .push(stopped);
    }

    /// Records the eviction of `alloc` in favour of `preempting`. Resources
    /// are kept so the applier can count the capacity they free.
    pub fn append_preempted_alloc(&mut self, alloc: &Allocation, preempting: &AllocId) {
        let mut stub = Allocation {
            id: alloc.id.clone(),
            job_id: alloc.job_id.clone(),
            namespace: alloc.namespace.clone(),
            node_id: alloc.node_id.clone(),
            desired_status: DesiredStatus::Evict,
            desired_description: preempted_description(preempting),
            preempted_by_allocation: preempting.clone(),
            ..Allocation::default()
        };
        if alloc.allocated_resources.is_some() {
            stub.allocated_resources = alloc.allocated_resources.clone();
        } else {
            stub.task_resources = alloc.task_resources.clone();
            stub.shared_resources = alloc.shared_resources.clone();
        }
        self.node_preemptions
            .entry(alloc.node_id.clone())
            .or_default()
            .push(stub);
    }

    /// Records a status change of an allocation on a disconnected node.
    pub fn append_unknown_alloc(&mut self, mut alloc: Allocation) {
        alloc.resources = None;
        self.node_allocation
            .entry(alloc.node_id.clone())
            .or_default()
            .push(alloc);
    }

    /// Adds a placement or in-place update. `job` may differ from the plan's
    /// tuple when in-place and destructive updates are mixed.
    pub fn append_alloc(&mut self, mut alloc: Allocation, job: Option<Arc<Job>>) {
        alloc.job = job;
        self.node_allocation
            .entry(alloc.node_id.clone())
            .or_default()
            .push(alloc);
    }

    /// Undoes the last [`Plan::append_stopped_alloc`] for `alloc`.
    pub fn pop_update(&mut self, alloc: &Allocation) {
        let Some(updates) = self.node_update.get_mut(&alloc.node_id) else {
            return;
        };
        if updates.last().is_some_and(|last| last.id == alloc.id) {
            updates.pop();
            if updates.is_empty() {
                self.node_update.remove(&alloc.node_id);
            }
        }
    }

    pub fn is_no_op(&self) -> bool {
        self.node_update.is_empty()
            && self.node_allocation.is_empty()
            && self.node_preemptions.is_empty()
            && self.deployment.is_none()
            && self.deployment_updates.is_empty()
    }

    /// Reduces stopped and preempted allocations to the fields the applier
    /// cannot look up itself.
    pub fn normalize_allocations(&mut self) {
        for allocs in self.node_update.values_mut() {
            for alloc in allocs.iter_mut() {
                *alloc = Allocation {
                    id: std::mem::take(&mut alloc.id),
                    desired_description: std::mem::take(&mut alloc.desired_description),
                    client_status: alloc.client_status,
                    followup_eval_id: std::mem::take(&mut alloc.followup_eval_id),
                    reschedule_tracker: alloc.reschedule_tracker.take(),
                    ..Allocation::default()
                };
            }
        }
        for allocs in self.node_preemptions.values_mut() {
            for alloc in allocs.iter_mut() {
                *alloc = Allocation {
                    id: std::mem::take(&mut alloc.id),
                    preempted_by_allocation: std::mem::take(&mut alloc.preempted_by_allocation),
                    ..Allocation::default()
                };
            }
        }
    }

    /// Number of allocations proposed across all nodes.
    pub fn placement_count(&self) -> usize {
        self.node_allocation.values().map(Vec::len).sum()
    }
}

/// What the applier committed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlanResult {
    #[serde(default)]
    pub node_update: NodeAllocations,
    #[serde(default)]
    pub node_allocation: NodeAllocations,
    #[serde(default)]
    pub node_preemptions: NodeAllocations,
    #[serde(default)]
    pub deployment: Option<Deployment>,
    #[serde(default)]
    pub deployment_updates: Vec<DeploymentStatusUpdate>,
    /// Nodes the worker should avoid for the rest of this evaluation.
    #[serde(default)]
    pub rejected_nodes: Vec<NodeId>,
    /// Nodes the applier keeps rejecting; the worker should stop proposing
    /// against them.
    #[serde(default)]
    pub ineligible_nodes: Vec<NodeId>,
    /// Index the worker must refresh to before retrying; non-zero when some
    /// of the plan was rejected.
    #[serde(default)]
    pub refresh_index: u64,
    /// Index at which the result was written.
    #[serde(default)]
    pub alloc_index: u64,
}

impl PlanResult {
    pub fn is_no_op(&self) -> bool {
        self.node_update.is_empty()
            && self.node_allocation.is_empty()
            && self.node_preemptions.is_empty()
            && self.deployment.is_none()
            && self.deployment_updates.is_empty()
    }

    /// Returns `(all_committed, expected, actual)` counted over the plan's
    /// placements.
    pub fn full_commit(&self, plan: &Plan) -> (bool, usize, usize) {
        let mut expected = 0;
        let mut actual = 0;
        for (node, allocs) in &plan.node_allocation {
            expected += allocs.len();
            actual += self.node_allocation.get(node).map_or(0, Vec::len);
        }
        (expected == actual, expected, actual)
    }
}

/// Scheduler decisions attached to a plan for operators.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlanAnnotations {
    #[serde(default)]
    pub desired_tg_updates: BTreeMap<String, DesiredUpdates>,
    #[serde(default)]
    pub preempted_allocs: Vec<AllocListStub>,
}

/// Changes the scheduler wants for one task group, capacity permitting.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DesiredUpdates {
    pub ignore: u64,
    pub place: u64,
    pub migrate: u64,
    pub stop: u64,
    pub in_place_update: u64,
    pub destructive_update: u64,
    pub canary: u64,
    pub preemptions: u64,
    pub reschedule_now: u64,
    pub reschedule_later: u64,
    pub disconnect: u64,
    pub reconnect: u64,
}

impl std::fmt::Display for DesiredUpdates {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "(place {}) (inplace {}) (destructive {}) (stop {}) (migrate {}) (ignore {}) (canary {})",
            self.place,
            self.in_place_update,
            self.destructive_update,
            self.stop,
            self.migrate,
            self.ignore,
            self.canary
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocation::TaskState;
    use crate::resources::{AllocatedResources, Resources};
    use crate::reschedule::RescheduleTracker;

    fn alloc_on(node: &str) -> Allocation {
        let job = Job {
            namespace: "default".into(),
            id: fleet_id::JobId::new("web"),
            version: 3,
            ..Job::default()
        };
        Allocation {
            id: AllocId::generate(),
            namespace: "default".into(),
            node_id: NodeId::from(node),
            job_id: job.id.clone(),
            job: Some(Arc::new(job)),
            task_group: "web".into(),
            resources: Some(Resources::default_resources()),
            allocated_resources: Some(AllocatedResources::default()),
            task_states: BTreeMap::from([("server".to_string(), TaskState::default())]),
            client_status: ClientStatus::Running,
            ..Allocation::default()
        }
    }

    #[test]
    fn test_append_stopped_alloc_sets_tuple() {
        let mut plan = Plan::default();
        let alloc = alloc_on("n1");
        plan.append_stopped_alloc(&alloc, "dead", Some(ClientStatus::Failed), None);

        assert_eq!(plan.job_tuple, Some(JobTuple::new("default", "web", 3)));
        let stopped = &plan.node_update[&NodeId::from("n1")][0];
        assert!(stopped.job.is_none());
        assert!(stopped.resources.is_none());
        assert_eq!(stopped.desired_status, DesiredStatus::Stop);
        assert_eq!(stopped.client_status, ClientStatus::Failed);
        assert_eq!(stopped.alloc_states.len(), 1);
        assert_eq!(alloc.desired_status, DesiredStatus::Run);
    }

    #[test]
    fn test_normalize_stopped() {
        let mut plan = Plan::default();
        let mut alloc = alloc_on("n1");
        alloc.reschedule_tracker = Some(RescheduleTracker::default());
        plan.append_stopped_alloc(
            &alloc,
            "dead",
            Some(ClientStatus::Failed),
            Some(EvalId::from("eval-7")),
        );
        plan.normalize_allocations();

        let stub = &plan.node_update[&NodeId::from("n1")][0];
        let expected = Allocation {
            id: alloc.id.clone(),
            desired_description: "dead".into(),
            client_status: ClientStatus::Failed,
            followup_eval_id: EvalId::from("eval-7"),
            reschedule_tracker: Some(RescheduleTracker::default()),
            ..Allocation::default()
        };
        assert_eq!(stub, &expected);
        assert!(stub.task_states.is_empty());
        assert!(stub.allocated_resources.is_none());
    }

    #[test]
    fn test_preempted_keeps_resources_until_normalized() {
        let mut plan = Plan::default();
        let victim = alloc_on("n2");
        let preemptor = AllocId::from("a-new");
        plan.append_preempted_alloc(&victim, &preemptor);

        let stub = &plan.node_preemptions[&NodeId::from("n2")][0];
        assert_eq!(stub.desired_status, DesiredStatus::Evict);
        assert_eq!(stub.desired_description, "Preempted by alloc ID a-new");
        assert!(stub.allocated_resources.is_some());
        assert!(stub.job.is_none());

        plan.normalize_allocations();
        let stub = &plan.node_preemptions[&NodeId::from("n2")][0];
        assert_eq!(stub.preempted_by_allocation, preemptor);
        assert!(stub.allocated_resources.is_none());
    }

    #[test]
    fn test_pop_update() {
        let mut plan = Plan::default();
        let a = alloc_on("n1");
        let b = alloc_on("n1");
        plan.append_stopped_alloc(&a, "x", None, None);
        plan.append_stopped_alloc(&b, "x", None, None);

        plan.pop_update(&a);
        assert_eq!(plan.node_update[&NodeId::from("n1")].len(), 2);
        plan.pop_update(&b);
        plan.pop_update(&a);
        assert!(plan.node_update.is_empty());
        assert!(plan.is_no_op());
    }

    #[test]
    fn test_append_alloc_and_unknown() {
        let mut plan = Plan::default();
        let alloc = alloc_on("n1");
        let job = alloc.job.clone();
        plan.append_alloc(alloc.copy_skip_job(), job);
        plan.append_unknown_alloc(alloc_on("n3"));
        assert_eq!(plan.placement_count(), 2);
        assert!(plan.node_allocation[&NodeId::from("n1")][0].job.is_some());
        assert!(plan.node_allocation[&NodeId::from("n3")][0].resources.is_none());
        assert!(!plan.is_no_op());
    }

    #[test]
    fn test_full_commit() {
        let mut plan = Plan::default();
        plan.append_alloc(alloc_on("n1"), None);
        plan.append_alloc(alloc_on("n2"), None);

        let mut result = PlanResult::default();
        assert!(result.is_no_op());
        result.node_allocation.insert(
            NodeId::from("n1"),
            plan.node_allocation[&NodeId::from("n1")].clone(),
        );
        assert_eq!(result.full_commit(&plan), (false, 2, 1));
        result.node_allocation.insert(
            NodeId::from("n2"),
            plan.node_allocation[&NodeId::from("n2")].clone(),
        );
        assert_eq!(result.full_commit(&plan), (true, 2, 2));
    }

    #[test]
    fn test_desired_updates_display() {
        let updates = DesiredUpdates {
            place: 3,
            canary: 1,
            ..DesiredUpdates::default()
        };
        assert_eq!(
            updates.to_string(),
            "(place 3) (inplace 0) (destructive 0) (stop 0) (migrate 0) (ignore 0) (canary 1)"
        );
    }
}
