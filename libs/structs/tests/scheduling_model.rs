use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};

use fleet_structs::allocation::TaskState;
use fleet_structs::disconnect::DisconnectStrategy;
use fleet_structs::message::{self, RawMessageType};
use fleet_structs::reschedule::{DelayFunction, ReschedulePolicy};
use fleet_structs::time::add_duration;
use fleet_structs::{
    AllocStateField, ClientStatus, DeploymentStatus, DesiredStatus, JobType, MessageType, Plan,
    PlanResult,
};
use fleet_testing::mock;

#[test]
fn test_mock_fixtures_validate() {
    mock::job().validate().unwrap();
    mock::batch_job().validate().unwrap();
    mock::system_job().validate().unwrap();
}

#[test]
fn test_mock_alloc_fits_mock_node() {
    let node = mock::node();
    let alloc = mock::alloc();
    assert!(node.ready());
    assert!(node.comparable_available().superset(&alloc.comparable_resources()));
}

#[test]
fn test_alloc_copy_does_not_share_job() {
    let alloc = mock::alloc();
    let mut copy = alloc.copy();
    let job = Arc::make_mut(copy.job.as_mut().unwrap());
    job.priority = 99;

    assert_eq!(alloc.job.as_ref().unwrap().priority, 50);
    assert_eq!(copy.job.as_ref().unwrap().priority, 99);
}

#[test]
fn test_failed_service_alloc_is_rescheduled_with_delay() {
    let mut alloc = mock::alloc();
    let fail_time = Utc.with_ymd_and_hms(2026, 1, 1, 12, 0, 0).unwrap();
    alloc.client_status = ClientStatus::Failed;
    alloc.task_states.insert(
        "web".to_string(),
        TaskState {
            failed: true,
            finished_at: Some(fail_time),
            ..TaskState::default()
        },
    );
    let job = Arc::make_mut(alloc.job.as_mut().unwrap());
    job.task_groups[0].reschedule_policy = Some(ReschedulePolicy {
        attempts: 0,
        interval: Duration::ZERO,
        delay: Duration::from_secs(5),
        delay_function: DelayFunction::Constant,
        max_delay: Duration::ZERO,
        unlimited: true,
    });

    let (when, eligible) = alloc.next_reschedule_time();
    assert!(eligible);
    assert_eq!(when, add_duration(fail_time, Duration::from_secs(5)));
}

#[test]
fn test_disconnected_alloc_expires_after_lost_after() {
    let mut alloc = mock::alloc();
    let job = Arc::make_mut(alloc.job.as_mut().unwrap());
    job.task_groups[0].disconnect = Some(DisconnectStrategy {
        lost_after: Some(Duration::from_secs(60)),
        ..DisconnectStrategy::default()
    });
    let unknown_at = Utc.with_ymd_and_hms(2026, 1, 1, 12, 0, 0).unwrap();
    alloc.client_status = ClientStatus::Unknown;
    alloc.append_state_at(AllocStateField::ClientStatus, "unknown", unknown_at);

    assert!(!alloc.expired(add_duration(unknown_at, Duration::from_secs(30))));
    assert!(alloc.expired(add_duration(unknown_at, Duration::from_secs(61))));
}

#[test]
fn test_plan_commit_roundtrip_through_log_entry() {
    let job = Arc::new(mock::job());
    let running = mock::alloc_for_job(job.clone());
    let placed = mock::alloc_for_job(job.clone());

    let mut plan = Plan {
        priority: job.priority,
        job_tuple: Some(job.tuple()),
        ..Plan::default()
    };
    plan.append_stopped_alloc(&running, "alloc not needed", None, None);
    plan.append_alloc(placed.clone(), None);
    assert_eq!(plan.placement_count(), 1);

    let stopped = &plan.node_update[&running.node_id][0];
    assert_eq!(stopped.desired_status, DesiredStatus::Stop);
    assert!(stopped.job.is_none());

    plan.normalize_allocations();
    let entry = message::encode(MessageType::ApplyPlanResults, &plan).unwrap();
    let (tag, body) = message::decode_header(&entry).unwrap();
    assert_eq!(tag, RawMessageType::Known(MessageType::ApplyPlanResults));
    let decoded: Plan = message::decode_body(body).unwrap();
    assert_eq!(decoded.node_update[&running.node_id][0].id, running.id);

    let result = PlanResult {
        node_allocation: decoded.node_allocation.clone(),
        node_update: decoded.node_update.clone(),
        alloc_index: 1001,
        ..PlanResult::default()
    };
    assert_eq!(result.full_commit(&plan), (true, 1, 1));
}

#[test]
fn test_deployment_for_mock_job() {
    let deployment = mock::deployment();
    assert_eq!(deployment.status, DeploymentStatus::Running);
    assert!(deployment.active());
    assert!(!deployment.requires_promotion());
    assert_eq!(deployment.task_groups["web"].desired_total, 10);
}

#[test]
fn test_batch_alloc_without_failure_is_not_rescheduled() {
    let job = Arc::new(mock::batch_job());
    assert_eq!(job.job_type, JobType::Batch);
    let mut alloc = mock::alloc_for_job(job);
    alloc.client_status = ClientStatus::Complete;

    let (_, eligible) = alloc.next_reschedule_time();
    assert!(!eligible);
}
