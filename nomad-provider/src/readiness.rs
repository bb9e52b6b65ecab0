//! Waiting for a freshly registered job to become usable.
//!
//! A job is ready once one of its allocations is running, its workspace task is
//! running, and the setup marker exists inside the task. Allocations are
//! scanned in the order the scheduler lists them and the first one that passes
//! wins. Scheduler and probe failures are logged and retried on the next tick
//! until the deadline.

use std::fmt;
use std::sync::Mutex;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::api::types::AllocationStub;
use crate::api::{ExecIo, ExecRequest, SchedulerApi};
use crate::jobspec::READY_MARKER;
use nomad_core::error::{Result, WorkspaceError};
use nomad_core::poll::{poll_until, PollOutcome, PollSchedule};
use nomad_core::CancellationToken;

pub const POLL_INTERVAL: Duration = Duration::from_secs(2);
pub const POLL_DEADLINE: Duration = Duration::from_secs(5 * 60);

pub const DEFAULT_SCHEDULE: PollSchedule = PollSchedule::new(POLL_INTERVAL, POLL_DEADLINE);

const RUNNING: &str = "running";

/// Progress of a job towards readiness, in increasing order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ReadinessState {
    Submitted,
    AllocationPending,
    TaskStarting,
    TaskRunningNotReady,
    Ready,
    TimedOut,
    Cancelled,
}

impl fmt::Display for ReadinessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ReadinessState::Submitted => "submitted",
            ReadinessState::AllocationPending => "allocation pending",
            ReadinessState::TaskStarting => "task starting",
            ReadinessState::TaskRunningNotReady => "task running, setup not finished",
            ReadinessState::Ready => "ready",
            ReadinessState::TimedOut => "timed out",
            ReadinessState::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// The allocation that passed the readiness probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadyAllocation {
    pub id: String,
    /// Poll attempt on which the allocation passed.
    pub attempts: u32,
}

/// Shell probe run inside the task; exits zero once setup has finished.
pub fn probe_command() -> Vec<String> {
    vec![
        "/bin/sh".to_string(),
        "-c".to_string(),
        format!("test -f {}", READY_MARKER),
    ]
}

struct StateTracker<'a> {
    job_id: &'a str,
    state: Mutex<ReadinessState>,
}

impl<'a> StateTracker<'a> {
    fn new(job_id: &'a str) -> Self {
        Self {
            job_id,
            state: Mutex::new(ReadinessState::Submitted),
        }
    }

    fn set(&self, next: ReadinessState) {
        let Ok(mut state) = self.state.lock() else {
            return;
        };
        if *state != next {
            info!(job_id = %self.job_id, from = %*state, to = %next, "readiness changed");
            *state = next;
        }
    }

    fn get(&self) -> ReadinessState {
        self.state
            .lock()
            .map(|state| *state)
            .unwrap_or(ReadinessState::Submitted)
    }
}

pub struct ReadinessPoller<'a> {
    scheduler: &'a dyn SchedulerApi,
    schedule: PollSchedule,
}

impl<'a> ReadinessPoller<'a> {
    pub fn new(scheduler: &'a dyn SchedulerApi) -> Self {
        Self {
            scheduler,
            schedule: DEFAULT_SCHEDULE,
        }
    }

    pub fn with_schedule(mut self, schedule: PollSchedule) -> Self {
        self.schedule = schedule;
        self
    }

    /// Poll until an allocation of `job_id` is ready.
    ///
    /// Fails with `WorkspaceError::Timeout` once the deadline passes and with
    /// `WorkspaceError::Cancelled` when `cancel` fires.
    pub async fn wait(
        &self,
        job_id: &str,
        task: &str,
        cancel: &CancellationToken,
    ) -> Result<ReadyAllocation> {
        let tracker = StateTracker::new(job_id);
        let tracker = &tracker;
        info!(job_id, task, "waiting for workspace to become ready");

        let outcome = poll_until(self.schedule, cancel, move |attempt| async move {
            self.check(job_id, task, cancel, tracker)
                .await
                .map(|id| ReadyAllocation { id, attempts: attempt })
        })
        .await;

        match outcome {
            PollOutcome::Ready(ready) => {
                tracker.set(ReadinessState::Ready);
                Ok(ready)
            }
            PollOutcome::TimedOut => {
                let last = tracker.get();
                tracker.set(ReadinessState::TimedOut);
                warn!(job_id, last_state = %last, "workspace did not become ready");
                Err(WorkspaceError::Timeout {
                    job_id: job_id.to_string(),
                    waited: self.schedule.deadline,
                })
            }
            PollOutcome::Cancelled => {
                tracker.set(ReadinessState::Cancelled);
                Err(WorkspaceError::Cancelled)
            }
        }
    }

    /// One poll tick. Returns the id of the first ready allocation.
    async fn check(
        &self,
        job_id: &str,
        task: &str,
        cancel: &CancellationToken,
        tracker: &StateTracker<'_>,
    ) -> Option<String> {
        let allocations = match self.scheduler.job_allocations(job_id).await {
            Ok(allocations) => allocations,
            Err(e) => {
                warn!(job_id, error = %e, "failed to list allocations, retrying");
                return None;
            }
        };

        let mut progress = ReadinessState::AllocationPending;
        for stub in allocations.iter().filter(|a| a.client_status == RUNNING) {
            match self.check_allocation(stub, task, cancel).await {
                Some(ReadinessState::Ready) => return Some(stub.id.clone()),
                Some(state) => progress = progress.max(state),
                None => {}
            }
        }
        tracker.set(progress);
        None
    }

    async fn check_allocation(
        &self,
        stub: &AllocationStub,
        task: &str,
        cancel: &CancellationToken,
    ) -> Option<ReadinessState> {
        let alloc = match self.scheduler.allocation(&stub.id).await {
            Ok(alloc) => alloc,
            Err(e) => {
                debug!(alloc_id = %stub.id, error = %e, "failed to read allocation");
                return None;
            }
        };
        if alloc.task_state(task) != Some(RUNNING) {
            return Some(ReadinessState::TaskStarting);
        }

        let request = ExecRequest {
            command: probe_command(),
            tty: false,
        };
        match self
            .scheduler
            .exec(&stub.id, task, request, ExecIo::discard(), cancel)
            .await
        {
            Ok(0) => Some(ReadinessState::Ready),
            Ok(code) => {
                debug!(alloc_id = %stub.id, exit_code = code, "setup not finished");
                Some(ReadinessState::TaskRunningNotReady)
            }
            Err(e) => {
                debug!(alloc_id = %stub.id, error = %e, "readiness probe failed");
                Some(ReadinessState::TaskRunningNotReady)
            }
        }
    }
}

#[cfg(test)]
#[path = "readiness_tests.rs"]
mod tests;
