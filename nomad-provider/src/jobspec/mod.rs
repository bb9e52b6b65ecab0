//! Translation of resolved provider options into a Nomad job.
//!
//! The job has exactly one task group holding exactly one docker task. The
//! group either mounts the workspace's CSI volume (persistent storage) or
//! requests ephemeral disk; never both.

mod gpu;
mod script;


// Standard library
use std::collections::HashSet;

// External crates
use indexmap::IndexMap;

// Internal imports
use crate::api::types::{
    CsiMountOptions, DockerConfig, EphemeralDisk, Job, Resources, Task, TaskGroup, Vault,
    VolumeMount, VolumeRequest,
};
use crate::templates::secret_templates;
use nomad_config::{ChangeMode, ProviderOptions, StorageMode};

pub use gpu::{gpu_device_request, gpu_job_constraints, GPU_DEVICE};
pub use script::{setup_script, READY_MARKER, SHARED_WORKSPACE_PATH};

pub const DEFAULT_IMAGE: &str = "ubuntu:22.04";
pub const DEFAULT_USER: &str = "root";

/// Name of the group-level volume request in persistent mode.
pub const WORKSPACE_VOLUME: &str = "workspace";

const DRIVER: &str = "docker";
const NETWORK_MODE: &str = "bridge";
const FS_TYPE: &str = "ext4";
const ACCESS_MODE: &str = "single-node-writer";
const ATTACHMENT_MODE: &str = "file-system";

const HOST_MOUNTS: &[&str] = &[
    "/var/run/docker.sock:/var/run/docker.sock",
    "/etc/docker/certs.d:/etc/docker/certs.d:ro",
    "/usr/local/share/ca-certificates/registry.cluster.crt:/usr/local/share/ca-certificates/registry.cluster.crt:ro",
];

/// Variables the provider sets in every workspace task. They are defaults:
/// a user-supplied value for the same key is kept.
pub const PROVIDER_ENV: &[(&str, &str)] = &[("DOCKER_HOST", "unix:///var/run/docker.sock")];

/// Merge user environment with provider defaults.
///
/// First claim wins: user entries are taken first in their given order, then
/// each provider default is added only if no user entry claimed its key.
pub fn merge_env(
    user: &IndexMap<String, String>,
    defaults: &[(&str, &str)],
) -> IndexMap<String, String> {
    let mut merged = user.clone();
    for (key, value) in defaults {
        merged
            .entry((*key).to_string())
            .or_insert_with(|| (*value).to_string());
    }
    merged
}

/// Builds the job for one workspace.
///
/// Building is pure: the same options always produce the same job, so
/// re-registering after a config change updates the existing job in place.
pub struct JobSpecBuilder<'a> {
    options: &'a ProviderOptions,
}

impl<'a> JobSpecBuilder<'a> {
    pub fn new(options: &'a ProviderOptions) -> Self {
        Self { options }
    }

    pub fn build(&self) -> Job {
        let options = self.options;
        let constraints = options
            .gpu
            .as_ref()
            .map(gpu_job_constraints)
            .unwrap_or_default();

        Job {
            id: options.job_id.clone(),
            name: options.job_id.clone(),
            job_type: "service".to_string(),
            namespace: options.namespace.clone(),
            region: options.region.clone(),
            constraints,
            task_groups: vec![self.task_group()],
            meta: self.meta(),
        }
    }

    fn task_group(&self) -> TaskGroup {
        let options = self.options;
        let mut group = TaskGroup {
            name: options.job_id.clone(),
            count: 1,
            tasks: vec![self.task()],
            volumes: IndexMap::new(),
            ephemeral_disk: None,
        };

        match options.storage_mode {
            StorageMode::Persistent => {
                group.volumes.insert(
                    WORKSPACE_VOLUME.to_string(),
                    VolumeRequest {
                        name: WORKSPACE_VOLUME.to_string(),
                        volume_type: "csi".to_string(),
                        source: options.volume_id(),
                        read_only: false,
                        access_mode: ACCESS_MODE.to_string(),
                        attachment_mode: ATTACHMENT_MODE.to_string(),
                        mount_options: Some(CsiMountOptions {
                            fs_type: FS_TYPE.to_string(),
                        }),
                    },
                );
            }
            StorageMode::Ephemeral => {
                group.ephemeral_disk = Some(EphemeralDisk {
                    size_mb: options.resources.disk_mb,
                });
            }
        }
        group
    }

    fn task(&self) -> Task {
        let options = self.options;
        let driver = options.driver.clone().unwrap_or_default();

        let user = non_empty(driver.user.as_deref()).unwrap_or(DEFAULT_USER);
        let devices = options
            .gpu
            .as_ref()
            .map(|gpu| vec![gpu_device_request(gpu)])
            .unwrap_or_default();

        let volume_mounts = if options.is_persistent() {
            vec![VolumeMount {
                volume: WORKSPACE_VOLUME.to_string(),
                destination: SHARED_WORKSPACE_PATH.to_string(),
                read_only: false,
            }]
        } else {
            Vec::new()
        };

        let (vault, templates) = if options.has_secrets() {
            let vault = &options.vault;
            (
                Some(self.vault_block()),
                secret_templates(&vault.secrets, vault.change_mode, &vault.change_signal),
            )
        } else {
            (None, Vec::new())
        };

        Task {
            name: options.task_name.clone(),
            driver: DRIVER.to_string(),
            user: user.to_string(),
            config: self.docker_config(),
            env: merge_env(&driver.env, PROVIDER_ENV),
            resources: Resources {
                cpu: options.resources.cpu,
                memory_mb: options.resources.memory_mb,
                devices,
            },
            vault,
            templates,
            volume_mounts,
        }
    }

    fn docker_config(&self) -> DockerConfig {
        let options = self.options;
        let driver = options.driver.as_ref();

        let image = driver
            .and_then(|d| non_empty(d.image.as_deref()))
            .unwrap_or(DEFAULT_IMAGE);
        let entrypoint = driver
            .and_then(|d| non_empty(d.entrypoint.as_deref()))
            .map(|e| vec![e.to_string()])
            .unwrap_or_default();
        let args = match driver.and_then(|d| d.cmd.as_ref()) {
            Some(cmd) if !cmd.is_empty() => cmd.clone(),
            _ => vec![
                "/bin/sh".to_string(),
                "-c".to_string(),
                setup_script(options.has_secrets()),
            ],
        };

        let mut volumes: Vec<String> = HOST_MOUNTS.iter().map(|m| m.to_string()).collect();
        if !options.is_persistent() {
            volumes.push(format!("{0}:{0}", SHARED_WORKSPACE_PATH));
        }

        DockerConfig {
            image: image.to_string(),
            entrypoint,
            args,
            volumes,
            privileged: true,
            network_mode: NETWORK_MODE.to_string(),
        }
    }

    fn vault_block(&self) -> Vault {
        let vault = &self.options.vault;
        Vault {
            policies: dedup(&vault.policies),
            role: vault.role.clone(),
            namespace: vault.namespace.clone(),
            change_mode: vault.change_mode.as_str().to_string(),
            change_signal: (vault.change_mode == ChangeMode::Signal)
                .then(|| vault.change_signal.clone()),
        }
    }

    fn meta(&self) -> IndexMap<String, String> {
        let options = self.options;
        let mut meta = IndexMap::new();
        meta.insert("devpod.workspace".to_string(), options.job_id.clone());
        meta.insert(
            "devpod.storage_mode".to_string(),
            options.storage_mode.as_str().to_string(),
        );
        meta.insert("devpod.gpu".to_string(), options.gpu.is_some().to_string());
        meta
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.is_empty())
}

fn dedup(values: &[String]) -> Vec<String> {
    let mut seen = HashSet::new();
    values
        .iter()
        .filter(|v| seen.insert(v.as_str()))
        .cloned()
        .collect()
}
