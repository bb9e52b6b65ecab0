use super::*;
use crate::testing::{allocation, stub, FakeScheduler};
use tokio::time::Instant;

const JOB: &str = "ws-1";
const TASK: &str = "ws-1";

fn running(id: &str) -> FakeScheduler {
    FakeScheduler::default()
        .with_allocation_lists([Some(vec![stub(id, "running")])])
        .with_allocation(allocation(id, TASK, "running"))
}

#[tokio::test(start_paused = true)]
async fn test_ready_after_probe_passes_on_third_poll() {
    let scheduler = running("a1").with_exec_results([Some(1), Some(1), Some(0)]);
    let cancel = CancellationToken::new();
    let start = Instant::now();

    let ready = ReadinessPoller::new(&scheduler)
        .wait(JOB, TASK, &cancel)
        .await
        .unwrap();

    assert_eq!(ready.id, "a1");
    assert_eq!(ready.attempts, 3);
    assert_eq!(start.elapsed(), Duration::from_secs(6));

    let calls = scheduler.exec_calls();
    assert_eq!(calls.len(), 3);
    assert!(calls.iter().all(|c| c.alloc_id == "a1"));
}

#[tokio::test(start_paused = true)]
async fn test_probe_runs_marker_check_without_tty() {
    let scheduler = running("a1");
    let cancel = CancellationToken::new();

    ReadinessPoller::new(&scheduler)
        .wait(JOB, TASK, &cancel)
        .await
        .unwrap();

    let call = &scheduler.exec_calls()[0];
    assert_eq!(call.task, TASK);
    assert_eq!(call.command, vec!["/bin/sh", "-c", "test -f /tmp/.devpod-ready"]);
    assert!(!call.tty);
}

#[tokio::test(start_paused = true)]
async fn test_waits_through_empty_allocation_lists() {
    let scheduler = FakeScheduler::default()
        .with_allocation_lists([Some(vec![]), Some(vec![]), Some(vec![stub("a1", "running")])])
        .with_allocation(allocation("a1", TASK, "running"));
    let cancel = CancellationToken::new();

    let ready = ReadinessPoller::new(&scheduler)
        .wait(JOB, TASK, &cancel)
        .await
        .unwrap();
    assert_eq!(ready.attempts, 3);
    assert_eq!(scheduler.exec_calls().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_skips_allocations_that_are_not_running() {
    let scheduler = FakeScheduler::default()
        .with_allocation_lists([Some(vec![stub("a0", "pending"), stub("a1", "running")])])
        .with_allocation(allocation("a0", TASK, "running"))
        .with_allocation(allocation("a1", TASK, "running"));
    let cancel = CancellationToken::new();

    let ready = ReadinessPoller::new(&scheduler)
        .wait(JOB, TASK, &cancel)
        .await
        .unwrap();
    assert_eq!(ready.id, "a1");
    assert!(scheduler.exec_calls().iter().all(|c| c.alloc_id == "a1"));
}

#[tokio::test(start_paused = true)]
async fn test_first_ready_allocation_wins() {
    let scheduler = FakeScheduler::default()
        .with_allocation_lists([Some(vec![stub("old", "running"), stub("new", "running")])])
        .with_allocation(allocation("old", TASK, "running"))
        .with_allocation(allocation("new", TASK, "running"));
    let cancel = CancellationToken::new();

    let ready = ReadinessPoller::new(&scheduler)
        .wait(JOB, TASK, &cancel)
        .await
        .unwrap();
    assert_eq!(ready.id, "old");
    assert_eq!(scheduler.exec_calls().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_task_not_running_moves_to_next_allocation() {
    let scheduler = FakeScheduler::default()
        .with_allocation_lists([Some(vec![stub("a1", "running"), stub("a2", "running")])])
        .with_allocation(allocation("a1", TASK, "pending"))
        .with_allocation(allocation("a2", TASK, "running"));
    let cancel = CancellationToken::new();

    let ready = ReadinessPoller::new(&scheduler)
        .wait(JOB, TASK, &cancel)
        .await
        .unwrap();
    assert_eq!(ready.id, "a2");
    let calls = scheduler.exec_calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].alloc_id, "a2");
}

#[tokio::test(start_paused = true)]
async fn test_missing_allocation_detail_is_skipped() {
    let scheduler = FakeScheduler::default()
        .with_allocation_lists([Some(vec![stub("gone", "running"), stub("a1", "running")])])
        .with_allocation(allocation("a1", TASK, "running"));
    let cancel = CancellationToken::new();

    let ready = ReadinessPoller::new(&scheduler)
        .wait(JOB, TASK, &cancel)
        .await
        .unwrap();
    assert_eq!(ready.id, "a1");
}

#[tokio::test(start_paused = true)]
async fn test_listing_errors_are_retried() {
    let scheduler = FakeScheduler::default()
        .with_allocation_lists([None, None, Some(vec![stub("a1", "running")])])
        .with_allocation(allocation("a1", TASK, "running"));
    let cancel = CancellationToken::new();

    let ready = ReadinessPoller::new(&scheduler)
        .wait(JOB, TASK, &cancel)
        .await
        .unwrap();
    assert_eq!(ready.attempts, 3);
    assert_eq!(scheduler.allocation_list_calls(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_probe_errors_are_retried() {
    let scheduler = running("a1").with_exec_results([None, Some(0)]);
    let cancel = CancellationToken::new();

    let ready = ReadinessPoller::new(&scheduler)
        .wait(JOB, TASK, &cancel)
        .await
        .unwrap();
    assert_eq!(ready.attempts, 2);
}

#[tokio::test(start_paused = true)]
async fn test_times_out_with_job_id() {
    let scheduler = FakeScheduler::default();
    let cancel = CancellationToken::new();
    let start = Instant::now();

    let err = ReadinessPoller::new(&scheduler)
        .wait(JOB, TASK, &cancel)
        .await
        .unwrap_err();

    match err {
        WorkspaceError::Timeout { job_id, waited } => {
            assert_eq!(job_id, JOB);
            assert_eq!(waited, POLL_DEADLINE);
        }
        other => panic!("expected timeout, got {other:?}"),
    }
    assert_eq!(start.elapsed(), POLL_DEADLINE);
    assert!(scheduler.exec_calls().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_custom_schedule() {
    let scheduler = FakeScheduler::default().unreachable();
    let cancel = CancellationToken::new();

    let err = ReadinessPoller::new(&scheduler)
        .with_schedule(PollSchedule::new(Duration::from_secs(1), Duration::from_secs(10)))
        .wait(JOB, TASK, &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, WorkspaceError::Timeout { .. }));
    assert_eq!(scheduler.allocation_list_calls(), 9);
}

#[tokio::test(start_paused = true)]
async fn test_cancellation_stops_waiting() {
    let scheduler = FakeScheduler::default();
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(5)).await;
        trigger.cancel();
    });
    let start = Instant::now();

    let err = ReadinessPoller::new(&scheduler)
        .wait(JOB, TASK, &cancel)
        .await
        .unwrap_err();
    assert!(err.is_cancelled());
    assert_eq!(start.elapsed(), Duration::from_secs(5));
}

#[test]
fn test_state_progress_order() {
    assert!(ReadinessState::Submitted < ReadinessState::AllocationPending);
    assert!(ReadinessState::AllocationPending < ReadinessState::TaskStarting);
    assert!(ReadinessState::TaskStarting < ReadinessState::TaskRunningNotReady);
    assert!(ReadinessState::TaskRunningNotReady < ReadinessState::Ready);
    assert_eq!(ReadinessState::TaskStarting.to_string(), "task starting");
}
