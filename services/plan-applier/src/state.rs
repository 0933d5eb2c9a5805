//! In-memory state store with an index watch.
//!
//! Every write bumps a single monotonic index and publishes it on a
//! `tokio::sync::watch` channel, which is what blocking queries and the
//! applier's snapshot wait observe. Readers work on immutable snapshots.

use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tracing::{debug, instrument, warn};

use fleet_id::{AllocId, DeploymentId, NamespacedId, NodeId};
use fleet_structs::plan::preempted_description;
use fleet_structs::time::unix_nanos;
use fleet_structs::{
    AllocStateField, Allocation, ClientStatus, Deployment, DesiredStatus, Job, Node, PlanResult,
};

use crate::error::{ApplierError, ApplierResult};

/// Point-in-time view of the store.
#[derive(Debug, Clone, Default)]
pub struct StateSnapshot {
    index: u64,
    nodes: BTreeMap<NodeId, Arc<Node>>,
    jobs: BTreeMap<NamespacedId, Arc<Job>>,
    allocs: BTreeMap<AllocId, Arc<Allocation>>,
    deployments: BTreeMap<DeploymentId, Arc<Deployment>>,
}

impl StateSnapshot {
    /// Index of the last write visible in this snapshot.
    pub fn index(&self) -> u64 {
        self.index
    }

    pub fn node_by_id(&self, id: &NodeId) -> Option<&Arc<Node>> {
        self.nodes.get(id)
    }

    pub fn job_by_id(&self, key: &NamespacedId) -> Option<&Arc<Job>> {
        self.jobs.get(key)
    }

    pub fn alloc_by_id(&self, id: &AllocId) -> Option<&Arc<Allocation>> {
        self.allocs.get(id)
    }

    pub fn deployment_by_id(&self, id: &DeploymentId) -> Option<&Arc<Deployment>> {
        self.deployments.get(id)
    }

    /// Allocations placed on `node`, optionally including terminal ones.
    pub fn allocs_by_node(&self, node: &NodeId, include_terminal: bool) -> Vec<Arc<Allocation>> {
        self.allocs
            .values()
            .filter(|a| &a.node_id == node)
            .filter(|a| include_terminal || !a.terminal_status())
            .cloned()
            .collect()
    }

    pub fn allocs(&self) -> impl Iterator<Item = &Arc<Allocation>> {
        self.allocs.values()
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Arc<Node>> {
        self.nodes.values()
    }
}

/// The store shared by the applier and readers.
pub struct StateStore {
    tables: RwLock<StateSnapshot>,
    index_tx: watch::Sender<u64>,
}

impl Default for StateStore {
    fn default() -> Self {
        Self::new()
    }
}

impl StateStore {
    pub fn new() -> Self {
        let (index_tx, _) = watch::channel(0);
        Self {
            tables: RwLock::new(StateSnapshot::default()),
            index_tx,
        }
    }

    pub fn latest_index(&self) -> u64 {
        *self.index_tx.borrow()
    }

    /// Subscribes to index changes.
    pub fn watch_index(&self) -> watch::Receiver<u64> {
        self.index_tx.subscribe()
    }

    pub fn snapshot(&self) -> StateSnapshot {
        self.tables
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Waits until the store has applied `index`, then snapshots it.
    #[instrument(skip(self))]
    pub async fn snapshot_min_index(
        &self,
        index: u64,
        timeout: Duration,
    ) -> ApplierResult<StateSnapshot> {
        let mut rx = self.watch_index();
        let reached = tokio::time::timeout(timeout, rx.wait_for(|latest| *latest >= index)).await;
        match reached {
            Ok(Ok(_)) => Ok(self.snapshot()),
            // The sender lives in `self`; it cannot close while we borrow it.
            Ok(Err(_)) => Ok(self.snapshot()),
            Err(_) => {
                let latest = self.latest_index();
                warn!(index, latest, "Timed out waiting for snapshot index");
                Err(ApplierError::SnapshotTimeout {
                    index,
                    latest,
                    waited: timeout,
                })
            }
        }
    }

    /// Runs `write` against the tables at the next index and publishes it.
    fn write<R>(&self, write: impl FnOnce(&mut StateSnapshot, u64) -> R) -> (u64, R) {
        let mut tables = self.tables.write().unwrap_or_else(PoisonError::into_inner);
        let index = tables.index + 1;
        let out = write(&mut tables, index);
        tables.index = index;
        drop(tables);
        self.index_tx.send_replace(index);
        (index, out)
    }

    pub fn upsert_node(&self, mut node: Node) -> u64 {
        self.write(|tables, index| {
            node.create_index = tables
                .nodes
                .get(&node.id)
                .map_or(index, |existing| existing.create_index);
            node.modify_index = index;
            tables.nodes.insert(node.id.clone(), Arc::new(node));
        })
        .0
    }

    pub fn upsert_job(&self, mut job: Job) -> u64 {
        self.write(|tables, index| {
            let key = job.namespaced_id();
            match tables.jobs.get(&key) {
                Some(existing) => {
                    job.create_index = existing.create_index;
                    if existing.spec_changed(&job) {
                        job.version = existing.version + 1;
                        job.job_modify_index = index;
                    } else {
                        job.version = existing.version;
                        job.job_modify_index = existing.job_modify_index;
                    }
                }
                None => {
                    job.create_index = index;
                    job.job_modify_index = index;
                }
            }
            job.modify_index = index;
            tables.jobs.insert(key, Arc::new(job));
        })
        .0
    }

    /// Writes allocations as reported, e.g. by a client.
    pub fn upsert_allocs(&self, allocs: Vec<Allocation>) -> u64 {
        self.write(|tables, index| {
            for mut alloc in allocs {
                alloc.create_index = tables
                    .allocs
                    .get(&alloc.id)
                    .map_or(index, |existing| existing.create_index);
                alloc.modify_index = index;
                tables.allocs.insert(alloc.id.clone(), Arc::new(alloc));
            }
        })
        .0
    }

    pub fn upsert_deployment(&self, deployment: Deployment) -> u64 {
        self.write(|tables, index| upsert_deployment(tables, deployment, index))
            .0
    }

    /// Commits what the applier accepted. Stopped and preempted entries are
    /// normalized stubs and are re-hydrated from the stored allocations.
    #[instrument(skip_all, fields(placements = result.node_allocation.len()))]
    pub fn upsert_plan_results(&self, result: &PlanResult, now: DateTime<Utc>) -> u64 {
        let now_nanos = unix_nanos(now);
        let (index, ()) = self.write(|tables, index| {
            for stub in result.node_update.values().flatten() {
                let Some(existing) = tables.allocs.get(&stub.id) else {
                    warn!(alloc_id = %stub.id, "Stopped allocation not found");
                    continue;
                };
                let mut alloc = existing.copy_skip_job();
                alloc.desired_status = DesiredStatus::Stop;
                alloc.desired_description = stub.desired_description.clone();
                if stub.client_status != ClientStatus::Pending
                    && stub.client_status != alloc.client_status
                {
                    alloc.client_status = stub.client_status;
                    alloc.append_state_at(
                        AllocStateField::ClientStatus,
                        stub.client_status.as_str(),
                        now,
                    );
                }
                if !stub.followup_eval_id.is_empty() {
                    alloc.followup_eval_id = stub.followup_eval_id.clone();
                }
                if stub.reschedule_tracker.is_some() {
                    alloc.reschedule_tracker = stub.reschedule_tracker.clone();
                }
                touch(&mut alloc, index, now_nanos);
                tables.allocs.insert(alloc.id.clone(), Arc::new(alloc));
            }

            for stub in result.node_preemptions.values().flatten() {
                let Some(existing) = tables.allocs.get(&stub.id) else {
                    warn!(alloc_id = %stub.id, "Preempted allocation not found");
                    continue;
                };
                let mut alloc = existing.copy_skip_job();
                alloc.desired_status = DesiredStatus::Evict;
                alloc.desired_description = preempted_description(&stub.preempted_by_allocation);
                alloc.preempted_by_allocation = stub.preempted_by_allocation.clone();
                touch(&mut alloc, index, now_nanos);
                tables.allocs.insert(alloc.id.clone(), Arc::new(alloc));
            }

            for placed in result.node_allocation.values().flatten() {
                let mut alloc = placed.clone();
                match tables.allocs.get(&alloc.id) {
                    Some(existing) => {
                        alloc.create_index = existing.create_index;
                        alloc.create_time = existing.create_time;
                        if alloc.job.is_none() {
                            alloc.job = existing.job.clone();
                        }
                    }
                    None => {
                        alloc.create_index = index;
                        alloc.create_time = now_nanos;
                    }
                }
                if alloc.job.is_none() {
                    alloc.job = tables.jobs.get(&alloc.job_namespaced_id()).cloned();
                }
                touch(&mut alloc, index, now_nanos);
                tables.allocs.insert(alloc.id.clone(), Arc::new(alloc));
            }

            if let Some(deployment) = &result.deployment {
                upsert_deployment(tables, deployment.clone(), index);
            }
            for update in &result.deployment_updates {
                let Some(existing) = tables.deployments.get(&update.deployment_id) else {
                    warn!(deployment_id = %update.deployment_id, "Deployment update for unknown deployment");
                    continue;
                };
                let mut deployment = existing.copy();
                deployment.status = update.status;
                deployment.status_description = update.status_description.clone();
                deployment.modify_index = index;
                deployment.modify_time = now_nanos;
                tables
                    .deployments
                    .insert(deployment.id.clone(), Arc::new(deployment));
            }
        });
        debug!(index, "Plan results committed");
        index
    }
}

fn touch(alloc: &mut Allocation, index: u64, now_nanos: i64) {
    alloc.modify_index = index;
    alloc.alloc_modify_index = index;
    alloc.modify_time = now_nanos;
}

fn upsert_deployment(tables: &mut StateSnapshot, mut deployment: Deployment, index: u64) {
    deployment.create_index = tables
        .deployments
        .get(&deployment.id)
        .map_or(index, |existing| existing.create_index);
    deployment.modify_index = index;
    tables
        .deployments
        .insert(deployment.id.clone(), Arc::new(deployment));
}
