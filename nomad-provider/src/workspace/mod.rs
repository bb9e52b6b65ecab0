//! Workspace-level operations composed from the lifecycle components.


use std::fmt;

use tracing::{info, warn};

use crate::api::types::JobRegisterResponse;
use crate::api::{ExecIo, SchedulerApi, SecretStore, VolumeApi};
use crate::command::{CommandChannel, CommandSpec};
use crate::jobspec::JobSpecBuilder;
use crate::readiness::DEFAULT_SCHEDULE;
use crate::volume::VolumeManager;
use nomad_config::ProviderOptions;
use nomad_core::error::{PhaseContext, Result};
use nomad_core::poll::PollSchedule;
use nomad_core::CancellationToken;

/// Workspace state as reported to the calling tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkspaceStatus {
    Running,
    Busy,
    Stopped,
    NotFound,
}

impl WorkspaceStatus {
    /// Map a Nomad job status onto a workspace status.
    pub fn from_job_status(status: &str) -> Self {
        match status {
            "running" => WorkspaceStatus::Running,
            "pending" => WorkspaceStatus::Busy,
            "complete" | "dead" => WorkspaceStatus::Stopped,
            _ => WorkspaceStatus::NotFound,
        }
    }
}

impl fmt::Display for WorkspaceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            WorkspaceStatus::Running => "Running",
            WorkspaceStatus::Busy => "Busy",
            WorkspaceStatus::Stopped => "Stopped",
            WorkspaceStatus::NotFound => "NotFound",
        };
        f.write_str(s)
    }
}

/// One workspace, identified by `options.job_id`.
pub struct Workspace<'a> {
    options: &'a ProviderOptions,
    scheduler: &'a dyn SchedulerApi,
    volumes: &'a dyn VolumeApi,
    secrets: &'a dyn SecretStore,
    schedule: PollSchedule,
}

impl<'a> Workspace<'a> {
    pub fn new(
        options: &'a ProviderOptions,
        scheduler: &'a dyn SchedulerApi,
        volumes: &'a dyn VolumeApi,
        secrets: &'a dyn SecretStore,
    ) -> Self {
        Self {
            options,
            scheduler,
            volumes,
            secrets,
            schedule: DEFAULT_SCHEDULE,
        }
    }

    pub fn with_schedule(mut self, schedule: PollSchedule) -> Self {
        self.schedule = schedule;
        self
    }

    fn volume_manager(&self) -> VolumeManager<'_> {
        VolumeManager::new(self.volumes, self.secrets, self.options)
    }

    /// Check that the scheduler is reachable with the configured credentials.
    pub async fn init(&self) -> Result<()> {
        self.scheduler
            .list_jobs()
            .await
            .phase("connect to scheduler")?;
        Ok(())
    }

    /// Ensure the volume when storage is persistent, then register the job.
    ///
    /// Registering again under the same job id updates the existing job.
    pub async fn create(&self) -> Result<JobRegisterResponse> {
        let options = self.options;
        if options.is_persistent() {
            let volume_id = options.volume_id();
            let outcome = self
                .volume_manager()
                .ensure_volume(&volume_id)
                .await
                .phase("ensure volume")?;
            info!(volume_id = %volume_id, ?outcome, "volume ready");
        }

        let job = JobSpecBuilder::new(options).build();
        let response = self
            .scheduler
            .register_job(&job)
            .await
            .phase("register job")?;
        info!(job_id = %job.id, eval_id = %response.eval_id, "job registered");
        if !response.warnings.is_empty() {
            warn!(job_id = %job.id, warnings = %response.warnings, "scheduler returned warnings");
        }
        Ok(response)
    }

    /// Purge the job, then remove the volume when storage is persistent.
    ///
    /// An absent job is not an error. Volume removal failures are logged and
    /// do not fail the delete.
    pub async fn delete(&self) -> Result<()> {
        let job_id = &self.options.job_id;
        match self.scheduler.deregister_job(job_id, true).await {
            Ok(()) => info!(job_id = %job_id, "job purged"),
            Err(e) if e.is_not_found() => info!(job_id = %job_id, "job already gone"),
            Err(e) => return Err(e.in_phase("deregister job")),
        }

        if self.options.is_persistent() {
            let volume_id = self.options.volume_id();
            if let Err(e) = self.volume_manager().destroy_volume(&volume_id).await {
                warn!(
                    volume_id = %volume_id,
                    error = %e,
                    "failed to delete volume, it may need manual cleanup"
                );
            }
        }
        Ok(())
    }

    pub async fn status(&self) -> Result<WorkspaceStatus> {
        match self.scheduler.job_info(&self.options.job_id).await {
            Ok(info) => Ok(WorkspaceStatus::from_job_status(&info.status)),
            Err(e) if e.is_not_found() => Ok(WorkspaceStatus::NotFound),
            Err(e) => Err(e.in_phase("read job status")),
        }
    }

    fn channel(&self) -> CommandChannel<'a> {
        CommandChannel::new(self.scheduler).with_schedule(self.schedule)
    }

    /// Run `command` in the workspace task, attached to this process's stdio.
    pub async fn command(&self, command: &CommandSpec, cancel: &CancellationToken) -> Result<i32> {
        self.channel()
            .run_interactive(&self.options.job_id, &self.options.task_name, command, cancel)
            .await
    }

    /// Run `command` in the workspace task over caller-supplied streams.
    pub async fn command_with_io(
        &self,
        command: &CommandSpec,
        tty: bool,
        io: ExecIo,
        cancel: &CancellationToken,
    ) -> Result<i32> {
        self.channel()
            .run(
                &self.options.job_id,
                &self.options.task_name,
                command,
                tty,
                io,
                cancel,
            )
            .await
    }
}
