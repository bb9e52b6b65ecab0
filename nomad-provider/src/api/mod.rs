//! Collaborator contracts for the scheduler, its CSI volume API and the
//! secret store, plus the HTTP/WebSocket clients that implement them.

pub mod exec;
pub mod nomad;
#[cfg(test)]
mod test_server;
pub mod types;
pub mod vault;

use async_trait::async_trait;
use indexmap::IndexMap;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;

use nomad_common::terminal::TerminalSize;
use nomad_core::error::Result;
use nomad_core::CancellationToken;

pub use self::nomad::NomadClient;
pub use self::vault::VaultClient;
use self::types::{
    Allocation, AllocationStub, CsiVolume, CsiVolumeSpec, Job, JobInfo, JobListStub,
    JobRegisterResponse,
};

/// Field map returned by a secret store read.
pub type SecretData = serde_json::Map<String, serde_json::Value>;

/// A command to run inside an allocation's task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecRequest {
    pub command: Vec<String>,
    pub tty: bool,
}

/// Streams bound to one remote execution.
pub struct ExecIo {
    /// `None` closes the remote stdin immediately.
    pub stdin: Option<Box<dyn AsyncRead + Send + Unpin>>,
    pub stdout: Box<dyn AsyncWrite + Send + Unpin>,
    pub stderr: Box<dyn AsyncWrite + Send + Unpin>,
    /// Terminal size updates; only meaningful with `tty`.
    pub resize: Option<mpsc::Receiver<TerminalSize>>,
}

impl ExecIo {
    /// No input, output discarded.
    pub fn discard() -> Self {
        Self {
            stdin: None,
            stdout: Box::new(tokio::io::sink()),
            stderr: Box::new(tokio::io::sink()),
            resize: None,
        }
    }
}

impl std::fmt::Debug for ExecIo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecIo")
            .field("stdin", &self.stdin.is_some())
            .field("resize", &self.resize.is_some())
            .finish_non_exhaustive()
    }
}

/// Job and allocation operations.
///
/// Lookups of absent objects fail with `WorkspaceError::NotFound`; every other
/// failure to reach or be accepted by the scheduler is `WorkspaceError::Transport`.
#[async_trait]
pub trait SchedulerApi: Send + Sync {
    /// List jobs. Used only as a connectivity check.
    async fn list_jobs(&self) -> Result<Vec<JobListStub>>;

    /// Register a job. Registering an existing id updates that job.
    async fn register_job(&self, job: &Job) -> Result<JobRegisterResponse>;

    async fn deregister_job(&self, job_id: &str, purge: bool) -> Result<()>;

    async fn job_info(&self, job_id: &str) -> Result<JobInfo>;

    /// Allocation stubs for a job, in the order the scheduler returns them.
    async fn job_allocations(&self, job_id: &str) -> Result<Vec<AllocationStub>>;

    async fn allocation(&self, alloc_id: &str) -> Result<Allocation>;

    /// Run a command in a task and return its exit code.
    ///
    /// A non-zero exit code is a normal result. Failing to attach, or losing
    /// the attachment, is `WorkspaceError::RemoteExec`; firing `cancel` ends the
    /// session with `WorkspaceError::Cancelled`.
    async fn exec(
        &self,
        alloc_id: &str,
        task: &str,
        request: ExecRequest,
        io: ExecIo,
        cancel: &CancellationToken,
    ) -> Result<i32>;
}

/// CSI volume operations.
#[async_trait]
pub trait VolumeApi: Send + Sync {
    async fn volume(&self, volume_id: &str) -> Result<CsiVolume>;

    async fn create_volume(&self, spec: &CsiVolumeSpec) -> Result<()>;

    async fn deregister_volume(&self, volume_id: &str, force: bool) -> Result<()>;

    /// Delete the volume in the storage backend by its external id.
    /// `secrets` are handed to the CSI plugin; empty sends none.
    async fn delete_volume(
        &self,
        external_id: &str,
        secrets: &IndexMap<String, String>,
    ) -> Result<()>;
}

/// Read-only access to a key/value secret store.
#[async_trait]
pub trait SecretStore: Send + Sync {
    /// Read the fields stored at `path`. Versioned stores nest fields under a
    /// `data` key; implementations return the inner map.
    async fn read(&self, path: &str) -> Result<SecretData>;
}
