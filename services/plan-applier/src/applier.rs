//! # Plan applier
//!
//! ## Overview
//!
//! Scheduler workers submit plans through a [`PlanQueue`]. A single
//! [`PlanApplier`] drains the queue in order, so committed allocation
//! changes are totally ordered. For each plan it:
//!
//! 1. Checks that the submitting worker still owns the evaluation
//! 2. Waits for the store to reach the plan's snapshot index
//! 3. Evaluates every node the plan touches against that snapshot
//! 4. Commits what fits and answers with the [`PlanResult`]
//!
//! ## Design Principles
//!
//! - Evaluation is a pure function of a snapshot and a plan
//! - A node either commits all of its changes or none of them
//! - Workers learn about rejected capacity through `refresh_index`
//!   rather than through errors

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::Utc;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, instrument, warn};

use fleet_id::{AllocId, EvalId, NodeId};
use fleet_rpc::RpcError;
use fleet_structs::{Allocation, ClientStatus, NodeStatus, Plan, PlanResult, SchedulingEligibility};

use crate::bad_nodes::{BadNodeTracker, BadNodeTrackerConfig};
use crate::config::PlanApplierConfig;
use crate::error::{ApplierError, ApplierResult};
use crate::fit::{FitChecker, ResourceFitChecker};
use crate::state::{StateSnapshot, StateStore};

// =============================================================================
// Queue
// =============================================================================

/// A submitted plan waiting for its result.
pub struct PlanRequest {
    pub plan: Plan,
    reply: oneshot::Sender<ApplierResult<PlanResult>>,
}

/// Submission side of the plan queue. Cheap to clone into every worker.
#[derive(Clone)]
pub struct PlanQueue {
    tx: mpsc::Sender<PlanRequest>,
}

impl PlanQueue {
    /// Creates a queue holding at most `depth` pending plans.
    pub fn new(depth: usize) -> (Self, mpsc::Receiver<PlanRequest>) {
        let (tx, rx) = mpsc::channel(depth.max(1));
        (Self { tx }, rx)
    }

    /// Submits `plan` and waits for the applier's answer.
    pub async fn submit(&self, plan: Plan) -> ApplierResult<PlanResult> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(PlanRequest { plan, reply })
            .await
            .map_err(|_| ApplierError::QueueClosed)?;
        rx.await.map_err(|_| ApplierError::ReplyDropped)?
    }
}

// =============================================================================
// Evaluation tokens
// =============================================================================

/// Tokens of the evaluations currently handed out to workers.
#[derive(Debug, Default)]
pub struct EvalTokens {
    tokens: Mutex<HashMap<EvalId, String>>,
}

impl EvalTokens {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records that `token` owns `eval_id`, replacing any previous owner.
    pub fn register(&self, eval_id: EvalId, token: impl Into<String>) {
        self.tokens
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(eval_id, token.into());
    }

    pub fn deregister(&self, eval_id: &EvalId) {
        self.tokens
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(eval_id);
    }

    /// Fails unless the plan's token owns its evaluation.
    pub fn check(&self, plan: &Plan) -> Result<(), RpcError> {
        let tokens = self.tokens.lock().unwrap_or_else(PoisonError::into_inner);
        match tokens.get(&plan.eval_id) {
            Some(token) if *token == plan.eval_token => Ok(()),
            _ => Err(RpcError::EvalTokenMismatch),
        }
    }
}

// =============================================================================
// Applier
// =============================================================================

pub struct PlanApplier {
    store: Arc<StateStore>,
    queue: mpsc::Receiver<PlanRequest>,
    evals: Arc<EvalTokens>,
    fit: Box<dyn FitChecker>,
    bad_nodes: BadNodeTracker,
    config: PlanApplierConfig,
}

impl PlanApplier {
    pub fn new(
        store: Arc<StateStore>,
        queue: mpsc::Receiver<PlanRequest>,
        evals: Arc<EvalTokens>,
        config: PlanApplierConfig,
        bad_nodes: BadNodeTrackerConfig,
    ) -> Self {
        Self {
            store,
            queue,
            evals,
            fit: Box::new(ResourceFitChecker),
            bad_nodes: BadNodeTracker::new(bad_nodes),
            config,
        }
    }

    /// Replaces the default resource fit check.
    pub fn with_fit_checker(mut self, fit: impl FitChecker + 'static) -> Self {
        self.fit = Box::new(fit);
        self
    }

    /// Applies queued plans one at a time until shutdown is signaled or
    /// every submitter is gone.
    #[instrument(skip(self, shutdown))]
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(
            queue_depth = self.config.queue_depth,
            snapshot_wait_ms = self.config.snapshot_wait.as_millis() as u64,
            "Starting plan applier"
        );

        loop {
            tokio::select! {
                request = self.queue.recv() => {
                    let Some(PlanRequest { plan, reply }) = request else {
                        info!("Plan queue closed, stopping applier");
                        break;
                    };
                    let eval_id = plan.eval_id.clone();
                    let outcome = self.apply(plan).await;
                    if let Err(e) = &outcome {
                        error!(eval_id = %eval_id, error = %e, "Failed to apply plan");
                    }
                    if reply.send(outcome).is_err() {
                        warn!(eval_id = %eval_id, "Plan submitter went away before the result");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Plan applier shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Evaluates and commits a single plan.
    #[instrument(skip(self, plan), fields(eval_id = %plan.eval_id, snapshot_index = plan.snapshot_index))]
    pub async fn apply(&mut self, plan: Plan) -> ApplierResult<PlanResult> {
        self.evals.check(&plan)?;

        let snapshot = self
            .store
            .snapshot_min_index(plan.snapshot_index, self.config.snapshot_wait)
            .await?;

        let mut result = evaluate_plan(&snapshot, &plan, self.fit.as_ref());

        let now = Utc::now();
        for node in &result.rejected_nodes {
            if self.bad_nodes.add(node, now) {
                result.ineligible_nodes.push(node.clone());
            }
        }

        if result.is_no_op() {
            debug!(
                rejected = result.rejected_nodes.len(),
                "Plan has nothing to commit"
            );
            return Ok(result);
        }

        result.alloc_index = self.store.upsert_plan_results(&result, now);

        let (_, expected, actual) = result.full_commit(&plan);
        info!(
            alloc_index = result.alloc_index,
            expected,
            actual,
            refresh_index = result.refresh_index,
            "Plan applied"
        );
        Ok(result)
    }
}

// =============================================================================
// Evaluation
// =============================================================================

/// Decides which parts of `plan` can be committed on top of `snapshot`.
pub fn evaluate_plan(snapshot: &StateSnapshot, plan: &Plan, fit: &dyn FitChecker) -> PlanResult {
    let mut result = PlanResult {
        deployment: plan.deployment.clone(),
        deployment_updates: plan.deployment_updates.clone(),
        ..PlanResult::default()
    };

    let nodes: BTreeSet<&NodeId> = plan
        .node_update
        .keys()
        .chain(plan.node_allocation.keys())
        .collect();

    let mut partial_commit = false;
    for node_id in nodes {
        if let Err(reason) = evaluate_node(snapshot, plan, node_id, fit) {
            debug!(node_id = %node_id, reason = %reason, "Plan for node rejected");
            partial_commit = true;
            result.rejected_nodes.push(node_id.clone());

            if plan.all_at_once {
                result.node_update.clear();
                result.node_allocation.clear();
                result.node_preemptions.clear();
                result.deployment = None;
                result.deployment_updates.clear();
                break;
            }
            continue;
        }

        if let Some(updates) = plan.node_update.get(node_id).filter(|u| !u.is_empty()) {
            result.node_update.insert(node_id.clone(), updates.clone());
        }
        if let Some(placed) = plan.node_allocation.get(node_id).filter(|p| !p.is_empty()) {
            result.node_allocation.insert(node_id.clone(), placed.clone());
        }
        if let Some(preempted) = plan.node_preemptions.get(node_id) {
            let live: Vec<Allocation> = preempted
                .iter()
                .filter(|stub| {
                    snapshot
                        .alloc_by_id(&stub.id)
                        .is_some_and(|alloc| !alloc.terminal_status())
                })
                .cloned()
                .collect();
            if !live.is_empty() {
                result.node_preemptions.insert(node_id.clone(), live);
            }
        }
    }

    if partial_commit {
        result.refresh_index = snapshot.index().max(1);
        prune_unplaced_canaries(&mut result);
    }
    result
}

/// Checks one node's share of the plan.
fn evaluate_node(
    snapshot: &StateSnapshot,
    plan: &Plan,
    node_id: &NodeId,
    fit: &dyn FitChecker,
) -> Result<(), String> {
    let placements = plan
        .node_allocation
        .get(node_id)
        .map(Vec::as_slice)
        .unwrap_or_default();
    if placements.is_empty() {
        return Ok(());
    }

    let Some(node) = snapshot.node_by_id(node_id) else {
        return Err("node does not exist".to_string());
    };
    match node.status {
        NodeStatus::Disconnected => {
            return if placements
                .iter()
                .all(|alloc| alloc.client_status == ClientStatus::Unknown)
            {
                Ok(())
            } else {
                Err("node is disconnected and contains invalid updates".to_string())
            };
        }
        NodeStatus::Ready => {}
        _ => return Err("node is not ready for placements".to_string()),
    }

    let existing = snapshot.allocs_by_node(node_id, false);
    let existing_ids: HashSet<&AllocId> = existing.iter().map(|a| &a.id).collect();
    if placements.iter().all(|alloc| existing_ids.contains(&alloc.id)) {
        return Ok(());
    }
    if node.scheduling_eligibility == SchedulingEligibility::Ineligible {
        return Err("node is not eligible".to_string());
    }

    let removed: HashSet<&AllocId> = [&plan.node_update, &plan.node_preemptions, &plan.node_allocation]
        .into_iter()
        .filter_map(|by_node| by_node.get(node_id))
        .flatten()
        .map(|alloc| &alloc.id)
        .collect();
    let proposed: Vec<Allocation> = existing
        .iter()
        .filter(|alloc| !removed.contains(&alloc.id))
        .map(|alloc| Allocation::clone(alloc))
        .chain(placements.iter().cloned())
        .collect();

    fit.fits(node, &proposed)
}

/// Drops canaries from the deployment that did not make it into the result.
fn prune_unplaced_canaries(result: &mut PlanResult) {
    let Some(deployment) = result.deployment.as_mut() else {
        return;
    };
    if !deployment.has_placed_canaries() {
        return;
    }
    let placed: HashSet<&AllocId> = result
        .node_allocation
        .values()
        .flatten()
        .map(|alloc| &alloc.id)
        .collect();
    for state in deployment.task_groups.values_mut() {
        state.placed_canaries.retain(|id| placed.contains(id));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use fleet_structs::resources::Port;
    use fleet_testing::mock;
    use rstest::rstest;

    /// A mock alloc on `node` whose ports do not clash with its siblings.
    fn alloc_on(node: &NodeId, slot: u16) -> Allocation {
        let mut alloc = mock::alloc();
        alloc.node_id = node.clone();
        if let Some(resources) = alloc.allocated_resources.as_mut() {
            for task in resources.tasks.values_mut() {
                for network in &mut task.networks {
                    network.reserved_ports = vec![Port {
                        label: "admin".into(),
                        value: 5000 + slot,
                        ..Port::default()
                    }];
                    network.dynamic_ports = vec![Port {
                        label: "http".into(),
                        value: 20000 + slot,
                        ..Port::default()
                    }];
                }
            }
        }
        alloc
    }

    fn store_with_node() -> (StateStore, NodeId) {
        let store = StateStore::new();
        let node = mock::node();
        let id = node.id.clone();
        store.upsert_node(node);
        (store, id)
    }

    fn plan_placing(allocs: Vec<Allocation>) -> Plan {
        let mut plan = Plan {
            eval_id: EvalId::generate(),
            eval_token: "token".into(),
            ..Plan::default()
        };
        for alloc in allocs {
            plan.node_allocation
                .entry(alloc.node_id.clone())
                .or_default()
                .push(alloc);
        }
        plan
    }

    #[test]
    fn test_evaluate_plan_fits() {
        let (store, node) = store_with_node();
        let plan = plan_placing(vec![alloc_on(&node, 0), alloc_on(&node, 1)]);
        let result = evaluate_plan(&store.snapshot(), &plan, &ResourceFitChecker);
        assert_eq!(result.full_commit(&plan), (true, 2, 2));
        assert!(result.rejected_nodes.is_empty());
        assert_eq!(result.refresh_index, 0);
    }

    #[test]
    fn test_evaluate_plan_missing_node() {
        let store = StateStore::new();
        let plan = plan_placing(vec![alloc_on(&NodeId::from("missing"), 0)]);
        let result = evaluate_plan(&store.snapshot(), &plan, &ResourceFitChecker);
        assert_eq!(result.rejected_nodes, vec![NodeId::from("missing")]);
        assert!(result.node_allocation.is_empty());
        assert_eq!(result.refresh_index, 1);
    }

    #[rstest]
    #[case(NodeStatus::Down, SchedulingEligibility::Eligible, false)]
    #[case(NodeStatus::Initializing, SchedulingEligibility::Eligible, false)]
    #[case(NodeStatus::Ready, SchedulingEligibility::Ineligible, false)]
    #[case(NodeStatus::Ready, SchedulingEligibility::Eligible, true)]
    fn test_evaluate_node_status(
        #[case] status: NodeStatus,
        #[case] eligibility: SchedulingEligibility,
        #[case] fits: bool,
    ) {
        let store = StateStore::new();
        let mut node = mock::node();
        node.status = status;
        node.scheduling_eligibility = eligibility;
        let id = node.id.clone();
        store.upsert_node(node);

        let plan = plan_placing(vec![alloc_on(&id, 0)]);
        let snapshot = store.snapshot();
        assert_eq!(
            evaluate_node(&snapshot, &plan, &id, &ResourceFitChecker).is_ok(),
            fits
        );
    }

    #[test]
    fn test_evict_only_always_fits() {
        let store = StateStore::new();
        let mut plan = plan_placing(Vec::new());
        let stopped = alloc_on(&NodeId::from("gone"), 0);
        plan.node_update
            .insert(NodeId::from("gone"), vec![stopped]);
        let result = evaluate_plan(&store.snapshot(), &plan, &ResourceFitChecker);
        assert!(result.rejected_nodes.is_empty());
        assert_eq!(result.node_update.len(), 1);
    }

    #[test]
    fn test_disconnected_node_accepts_only_unknown() {
        let store = StateStore::new();
        let mut node = mock::node();
        node.status = NodeStatus::Disconnected;
        let id = node.id.clone();
        store.upsert_node(node);

        let mut unknown = alloc_on(&id, 0);
        unknown.client_status = ClientStatus::Unknown;
        let snapshot = store.snapshot();
        let plan = plan_placing(vec![unknown.clone()]);
        assert_eq!(evaluate_node(&snapshot, &plan, &id, &ResourceFitChecker), Ok(()));

        let plan = plan_placing(vec![unknown, alloc_on(&id, 1)]);
        assert_eq!(
            evaluate_node(&snapshot, &plan, &id, &ResourceFitChecker),
            Err("node is disconnected and contains invalid updates".to_string())
        );
    }

    #[test]
    fn test_in_place_update_on_ineligible_node() {
        let store = StateStore::new();
        let mut node = mock::node();
        node.scheduling_eligibility = SchedulingEligibility::Ineligible;
        let id = node.id.clone();
        store.upsert_node(node);
        let existing = alloc_on(&id, 0);
        store.upsert_allocs(vec![existing.clone()]);

        let plan = plan_placing(vec![existing]);
        assert_eq!(
            evaluate_node(&store.snapshot(), &plan, &id, &ResourceFitChecker),
            Ok(())
        );
    }

    #[test]
    fn test_stops_and_preemptions_free_capacity() {
        let (store, node) = store_with_node();
        // 3900 usable MHz hold seven 500 MHz allocations.
        let existing: Vec<Allocation> = (0..7).map(|slot| alloc_on(&node, slot)).collect();
        store.upsert_allocs(existing.clone());

        let newcomer = alloc_on(&node, 10);
        let plan = plan_placing(vec![newcomer.clone()]);
        let snapshot = store.snapshot();
        assert_eq!(
            evaluate_node(&snapshot, &plan, &node, &ResourceFitChecker),
            Err("cpu".to_string())
        );

        let mut plan = plan_placing(vec![newcomer.clone()]);
        plan.append_preempted_alloc(&existing[0], &newcomer.id);
        assert_eq!(evaluate_node(&snapshot, &plan, &node, &ResourceFitChecker), Ok(()));

        let result = evaluate_plan(&snapshot, &plan, &ResourceFitChecker);
        assert_eq!(result.node_preemptions[&node].len(), 1);
    }

    #[test]
    fn test_terminal_preemptions_dropped() {
        let (store, node) = store_with_node();
        let mut done = alloc_on(&node, 0);
        done.client_status = ClientStatus::Complete;
        store.upsert_allocs(vec![done.clone()]);

        let newcomer = alloc_on(&node, 1);
        let mut plan = plan_placing(vec![newcomer.clone()]);
        plan.append_preempted_alloc(&done, &newcomer.id);
        let result = evaluate_plan(&store.snapshot(), &plan, &ResourceFitChecker);
        assert!(result.node_preemptions.is_empty());
        assert_eq!(result.full_commit(&plan), (true, 1, 1));
    }

    #[test]
    fn test_all_at_once_clears_result() {
        let (store, node) = store_with_node();
        let mut plan = plan_placing(vec![
            alloc_on(&node, 0),
            alloc_on(&NodeId::from("missing"), 1),
        ]);
        plan.all_at_once = true;
        plan.deployment = Some(mock::deployment());

        let result = evaluate_plan(&store.snapshot(), &plan, &ResourceFitChecker);
        assert!(result.is_no_op());
        assert_eq!(result.rejected_nodes.len(), 1);
        assert!(result.refresh_index > 0);
    }

    #[test]
    fn test_partial_commit_prunes_canaries() {
        let (store, node) = store_with_node();
        let placed = alloc_on(&node, 0);
        let lost = alloc_on(&NodeId::from("missing"), 1);
        let mut deployment = mock::deployment();
        if let Some(state) = deployment.task_groups.get_mut("web") {
            state.desired_canaries = 2;
            state.placed_canaries = vec![placed.id.clone(), lost.id.clone()];
        }
        let mut plan = plan_placing(vec![placed.clone(), lost]);
        plan.deployment = Some(deployment);

        let result = evaluate_plan(&store.snapshot(), &plan, &ResourceFitChecker);
        assert_eq!(result.full_commit(&plan), (false, 2, 1));
        assert_eq!(result.refresh_index, store.latest_index());
        let canaries = &result.deployment.as_ref().unwrap().task_groups["web"].placed_canaries;
        assert_eq!(canaries, &vec![placed.id]);
    }

    fn applier(store: Arc<StateStore>, evals: Arc<EvalTokens>, threshold: usize) -> (PlanApplier, PlanQueue) {
        let (queue, rx) = PlanQueue::new(8);
        let applier = PlanApplier::new(
            store,
            rx,
            evals,
            PlanApplierConfig {
                queue_depth: 8,
                snapshot_wait: Duration::from_millis(100),
            },
            BadNodeTrackerConfig {
                threshold,
                window: Duration::from_secs(60),
            },
        );
        (applier, queue)
    }

    #[tokio::test]
    async fn test_apply_rejects_stale_token() {
        let store = Arc::new(StateStore::new());
        let evals = Arc::new(EvalTokens::new());
        let (mut applier, _queue) = applier(store, evals.clone(), 0);

        let plan = plan_placing(Vec::new());
        evals.register(plan.eval_id.clone(), "other");
        let err = applier.apply(plan).await.unwrap_err();
        assert!(err.is_token_mismatch());
    }

    #[tokio::test]
    async fn test_apply_marks_repeatedly_rejected_node() {
        let store = Arc::new(StateStore::new());
        let evals = Arc::new(EvalTokens::new());
        let (mut applier, _queue) = applier(store, evals.clone(), 2);

        let missing = NodeId::from("missing");
        for attempt in 0..2 {
            let plan = plan_placing(vec![alloc_on(&missing, 0)]);
            evals.register(plan.eval_id.clone(), "token");
            let result = applier.apply(plan).await.unwrap();
            assert_eq!(result.rejected_nodes, vec![missing.clone()]);
            if attempt == 0 {
                assert!(result.ineligible_nodes.is_empty());
            } else {
                assert_eq!(result.ineligible_nodes, vec![missing.clone()]);
            }
        }
    }

    #[tokio::test]
    async fn test_run_serves_queue_until_shutdown() {
        let store = Arc::new(StateStore::new());
        let node = mock::node();
        let node_id = node.id.clone();
        store.upsert_node(node);
        let evals = Arc::new(EvalTokens::new());
        let (applier, queue) = applier(store.clone(), evals.clone(), 0);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(applier.run(shutdown_rx));

        let plan = plan_placing(vec![alloc_on(&node_id, 0)]);
        evals.register(plan.eval_id.clone(), "token");
        let result = queue.submit(plan).await.unwrap();
        assert_eq!(result.alloc_index, 2);
        assert_eq!(store.snapshot().allocs_by_node(&node_id, false).len(), 1);

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
        assert!(matches!(
            queue.submit(Plan::default()).await,
            Err(ApplierError::QueueClosed)
        ));
    }
}
