//! In-memory collaborators for exercising the lifecycle engine without a
//! cluster. Each fake records the calls it receives and replays scripted
//! responses; when a script runs out, its last entry repeats.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use indexmap::IndexMap;
use tokio::io::AsyncWriteExt;

use crate::api::types::{
    Allocation, AllocationStub, CsiVolume, CsiVolumeSpec, Job, JobInfo, JobListStub,
    JobRegisterResponse, TaskState,
};
use crate::api::{ExecIo, ExecRequest, SchedulerApi, SecretData, SecretStore, VolumeApi};
use crate::readiness::probe_command;
use nomad_core::error::{Result, WorkspaceError};
use nomad_core::CancellationToken;

/// An allocation stub with the given client status.
pub fn stub(id: &str, client_status: &str) -> AllocationStub {
    AllocationStub {
        id: id.to_string(),
        name: format!("{}.group[0]", id),
        client_status: client_status.to_string(),
        create_index: 0,
    }
}

/// Allocation detail whose `task` is in `task_state`.
pub fn allocation(id: &str, task: &str, task_state: &str) -> Allocation {
    let mut states = HashMap::new();
    states.insert(
        task.to_string(),
        TaskState {
            state: task_state.to_string(),
        },
    );
    Allocation {
        id: id.to_string(),
        client_status: "running".to_string(),
        task_states: Some(states),
    }
}

fn next_scripted<T: Clone>(script: &mut VecDeque<T>) -> Option<T> {
    if script.len() > 1 {
        script.pop_front()
    } else {
        script.front().cloned()
    }
}

fn unreachable_error(what: &str) -> WorkspaceError {
    WorkspaceError::Transport(format!("{}: connection refused", what))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecCall {
    pub alloc_id: String,
    pub task: String,
    pub command: Vec<String>,
    pub tty: bool,
}

#[derive(Debug, Default)]
struct SchedulerState {
    /// `None` entries fail the listing with a transport error.
    allocation_lists: VecDeque<Option<Vec<AllocationStub>>>,
    allocation_list_calls: u32,
    allocations: HashMap<String, Allocation>,
    /// `None` entries fail the exec with a remote exec error.
    exec_results: VecDeque<Option<i32>>,
    exec_output: Vec<u8>,
    exec_hangs: bool,
    exec_calls: Vec<ExecCall>,
    registered: IndexMap<String, Job>,
    register_calls: usize,
    job_statuses: HashMap<String, String>,
    deregistered: Vec<(String, bool)>,
    unreachable: bool,
    fail_deregister: bool,
}

/// Scriptable [`SchedulerApi`].
#[derive(Debug, Default)]
pub struct FakeScheduler {
    state: Mutex<SchedulerState>,
}

impl FakeScheduler {
    fn with(self, f: impl FnOnce(&mut SchedulerState)) -> Self {
        if let Ok(mut state) = self.state.lock() {
            f(&mut state);
        }
        self
    }

    fn read<T>(&self, f: impl FnOnce(&SchedulerState) -> T) -> T {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        f(&state)
    }

    fn update<T>(&self, f: impl FnOnce(&mut SchedulerState) -> T) -> T {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut state)
    }

    /// Successive answers to `job_allocations`.
    pub fn with_allocation_lists(
        self,
        lists: impl IntoIterator<Item = Option<Vec<AllocationStub>>>,
    ) -> Self {
        self.with(|s| s.allocation_lists.extend(lists))
    }

    pub fn with_allocation(self, alloc: Allocation) -> Self {
        self.with(|s| {
            s.allocations.insert(alloc.id.clone(), alloc);
        })
    }

    /// Successive exit codes for `exec`. Without a script every exec exits 0.
    pub fn with_exec_results(self, results: impl IntoIterator<Item = Option<i32>>) -> Self {
        self.with(|s| s.exec_results.extend(results))
    }

    /// Bytes every exec writes to its stdout.
    pub fn with_exec_output(self, output: &[u8]) -> Self {
        self.with(|s| s.exec_output = output.to_vec())
    }

    /// Execs other than the readiness probe never finish on their own; only
    /// cancellation ends them.
    pub fn hanging_commands(self) -> Self {
        self.with(|s| s.exec_hangs = true)
    }

    pub fn with_job_status(self, job_id: &str, status: &str) -> Self {
        self.with(|s| {
            s.job_statuses
                .insert(job_id.to_string(), status.to_string());
        })
    }

    /// Every job and allocation call fails with a transport error.
    pub fn unreachable(self) -> Self {
        self.with(|s| s.unreachable = true)
    }

    pub fn failing_deregister(self) -> Self {
        self.with(|s| s.fail_deregister = true)
    }

    pub fn exec_calls(&self) -> Vec<ExecCall> {
        self.read(|s| s.exec_calls.clone())
    }

    /// Registered jobs keyed by id; re-registration replaces the entry.
    pub fn registered_jobs(&self) -> IndexMap<String, Job> {
        self.read(|s| s.registered.clone())
    }

    pub fn register_calls(&self) -> usize {
        self.read(|s| s.register_calls)
    }

    pub fn deregistered(&self) -> Vec<(String, bool)> {
        self.read(|s| s.deregistered.clone())
    }

    pub fn allocation_list_calls(&self) -> u32 {
        self.read(|s| s.allocation_list_calls)
    }
}

#[async_trait]
impl SchedulerApi for FakeScheduler {
    async fn list_jobs(&self) -> Result<Vec<JobListStub>> {
        self.read(|s| {
            if s.unreachable {
                return Err(unreachable_error("list jobs"));
            }
            Ok(s.registered
                .keys()
                .map(|id| JobListStub {
                    id: id.clone(),
                    status: s.job_statuses.get(id).cloned().unwrap_or_default(),
                })
                .collect())
        })
    }

    async fn register_job(&self, job: &Job) -> Result<JobRegisterResponse> {
        self.update(|s| {
            if s.unreachable {
                return Err(unreachable_error("register job"));
            }
            s.register_calls += 1;
            s.registered.insert(job.id.clone(), job.clone());
            s.job_statuses
                .entry(job.id.clone())
                .or_insert_with(|| "pending".to_string());
            Ok(JobRegisterResponse {
                eval_id: format!("eval-{}", s.register_calls),
                job_modify_index: s.register_calls as u64,
                warnings: String::new(),
            })
        })
    }

    async fn deregister_job(&self, job_id: &str, purge: bool) -> Result<()> {
        self.update(|s| {
            if s.unreachable || s.fail_deregister {
                return Err(unreachable_error("deregister job"));
            }
            let known = s.registered.shift_remove(job_id).is_some()
                | s.job_statuses.remove(job_id).is_some();
            if !known {
                return Err(WorkspaceError::NotFound(format!("job {}", job_id)));
            }
            s.deregistered.push((job_id.to_string(), purge));
            Ok(())
        })
    }

    async fn job_info(&self, job_id: &str) -> Result<JobInfo> {
        self.read(|s| {
            if s.unreachable {
                return Err(unreachable_error("job info"));
            }
            s.job_statuses
                .get(job_id)
                .map(|status| JobInfo {
                    id: job_id.to_string(),
                    status: status.clone(),
                })
                .ok_or_else(|| WorkspaceError::NotFound(format!("job {}", job_id)))
        })
    }

    async fn job_allocations(&self, job_id: &str) -> Result<Vec<AllocationStub>> {
        self.update(|s| {
            s.allocation_list_calls += 1;
            if s.unreachable {
                return Err(unreachable_error("list allocations"));
            }
            match next_scripted(&mut s.allocation_lists) {
                Some(Some(list)) => Ok(list),
                Some(None) => Err(unreachable_error(&format!("allocations for job {}", job_id))),
                None => Ok(Vec::new()),
            }
        })
    }

    async fn allocation(&self, alloc_id: &str) -> Result<Allocation> {
        self.read(|s| {
            s.allocations
                .get(alloc_id)
                .cloned()
                .ok_or_else(|| WorkspaceError::NotFound(format!("allocation {}", alloc_id)))
        })
    }

    async fn exec(
        &self,
        alloc_id: &str,
        task: &str,
        request: ExecRequest,
        mut io: ExecIo,
        cancel: &CancellationToken,
    ) -> Result<i32> {
        let is_probe = request.command == probe_command();
        let (hangs, output, result) = self.update(|s| {
            s.exec_calls.push(ExecCall {
                alloc_id: alloc_id.to_string(),
                task: task.to_string(),
                command: request.command.clone(),
                tty: request.tty,
            });
            (
                s.exec_hangs && !is_probe,
                s.exec_output.clone(),
                next_scripted(&mut s.exec_results).unwrap_or(Some(0)),
            )
        });

        if hangs {
            cancel.cancelled().await;
            return Err(WorkspaceError::Cancelled);
        }
        if !output.is_empty() {
            io.stdout.write_all(&output).await?;
            io.stdout.flush().await?;
        }
        result.ok_or_else(|| WorkspaceError::RemoteExec("scripted exec failure".to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VolumeCall {
    Info(String),
    Create(String),
    Deregister(String, bool),
    Delete(String),
}

#[derive(Debug, Default)]
struct VolumesState {
    volumes: IndexMap<String, CsiVolume>,
    calls: Vec<VolumeCall>,
    created: Vec<CsiVolumeSpec>,
    delete_secrets: Vec<IndexMap<String, String>>,
    fail_lookup: bool,
    fail_deregister: bool,
    fail_delete: bool,
}

/// In-memory [`VolumeApi`].
#[derive(Debug, Default)]
pub struct FakeVolumes {
    state: Mutex<VolumesState>,
}

impl FakeVolumes {
    fn with(self, f: impl FnOnce(&mut VolumesState)) -> Self {
        if let Ok(mut state) = self.state.lock() {
            f(&mut state);
        }
        self
    }

    fn update<T>(&self, f: impl FnOnce(&mut VolumesState) -> T) -> T {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut state)
    }

    pub fn with_volume(self, volume: CsiVolume) -> Self {
        self.with(|s| {
            s.volumes.insert(volume.id.clone(), volume);
        })
    }

    /// Volume lookups fail with a transport error.
    pub fn failing_lookup(self) -> Self {
        self.with(|s| s.fail_lookup = true)
    }

    pub fn failing_deregister(self) -> Self {
        self.with(|s| s.fail_deregister = true)
    }

    pub fn failing_delete(self) -> Self {
        self.with(|s| s.fail_delete = true)
    }

    pub fn calls(&self) -> Vec<VolumeCall> {
        self.update(|s| s.calls.clone())
    }

    pub fn created(&self) -> Vec<CsiVolumeSpec> {
        self.update(|s| s.created.clone())
    }

    /// Secrets sent with each backend delete, in call order.
    pub fn delete_secrets(&self) -> Vec<IndexMap<String, String>> {
        self.update(|s| s.delete_secrets.clone())
    }
}

#[async_trait]
impl VolumeApi for FakeVolumes {
    async fn volume(&self, volume_id: &str) -> Result<CsiVolume> {
        self.update(|s| {
            s.calls.push(VolumeCall::Info(volume_id.to_string()));
            if s.fail_lookup {
                return Err(unreachable_error("volume lookup"));
            }
            s.volumes
                .get(volume_id)
                .cloned()
                .ok_or_else(|| WorkspaceError::NotFound(format!("volume {}", volume_id)))
        })
    }

    async fn create_volume(&self, spec: &CsiVolumeSpec) -> Result<()> {
        self.update(|s| {
            s.calls.push(VolumeCall::Create(spec.id.clone()));
            s.created.push(spec.clone());
            s.volumes.insert(
                spec.id.clone(),
                CsiVolume {
                    id: spec.id.clone(),
                    external_id: format!("ext-{}", spec.id),
                    plugin_id: spec.plugin_id.clone(),
                },
            );
            Ok(())
        })
    }

    async fn deregister_volume(&self, volume_id: &str, force: bool) -> Result<()> {
        self.update(|s| {
            s.calls
                .push(VolumeCall::Deregister(volume_id.to_string(), force));
            if s.fail_deregister {
                return Err(unreachable_error("deregister volume"));
            }
            s.volumes
                .shift_remove(volume_id)
                .map(|_| ())
                .ok_or_else(|| WorkspaceError::NotFound(format!("volume {}", volume_id)))
        })
    }

    async fn delete_volume(
        &self,
        external_id: &str,
        secrets: &IndexMap<String, String>,
    ) -> Result<()> {
        self.update(|s| {
            s.calls.push(VolumeCall::Delete(external_id.to_string()));
            s.delete_secrets.push(secrets.clone());
            if s.fail_delete {
                return Err(unreachable_error("delete volume"));
            }
            Ok(())
        })
    }
}

/// In-memory [`SecretStore`] keyed by path.
#[derive(Debug, Default)]
pub struct FakeSecretStore {
    secrets: HashMap<String, SecretData>,
}

impl FakeSecretStore {
    /// Store `value`'s fields at `path`. Non-object values store nothing.
    pub fn with_secret(mut self, path: &str, value: serde_json::Value) -> Self {
        if let serde_json::Value::Object(map) = value {
            self.secrets.insert(path.to_string(), map);
        }
        self
    }
}

#[async_trait]
impl SecretStore for FakeSecretStore {
    async fn read(&self, path: &str) -> Result<SecretData> {
        self.secrets
            .get(path)
            .cloned()
            .ok_or_else(|| WorkspaceError::NotFound(format!("no secret found at path {}", path)))
    }
}
