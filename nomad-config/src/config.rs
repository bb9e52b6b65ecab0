// Standard library imports
use std::fmt;
use std::str::FromStr;

// External crate imports
use indexmap::IndexMap;
use serde::{Deserialize, Deserializer, Serialize};

// Internal imports
use nomad_core::error::{Result, WorkspaceError};

pub const DEFAULT_JOB_ID: &str = "devpod";
pub const DEFAULT_CPU: u32 = 200;
pub const DEFAULT_MEMORY_MB: u32 = 512;
pub const DEFAULT_DISK_MB: u32 = 300;
pub const DEFAULT_VAULT_ROLE: &str = "nomad-workloads";
pub const DEFAULT_CHANGE_SIGNAL: &str = "SIGHUP";
pub const DEFAULT_CSI_PLUGIN_ID: &str = "ceph-csi";
pub const DEFAULT_CSI_POOL: &str = "nomad";
pub const DEFAULT_GPU_COUNT: u32 = 1;
pub const DEFAULT_NOMAD_ADDR: &str = "http://127.0.0.1:4646";

/// Prefix joined with the job id to name the workspace's CSI volume.
pub const VOLUME_ID_PREFIX: &str = "devpod-";

/// Fully resolved provider configuration.
///
/// Built once per invocation by [`crate::ConfigLoader`] and never mutated
/// afterwards. Settings that may legitimately be absent are `Option`s; an empty
/// environment variable or config value resolves to `None`, never to `""`.
///
/// # Examples
/// ```rust
/// use nomad_config::{ProviderOptions, StorageMode};
///
/// let options = ProviderOptions {
///     job_id: "ws-42".to_string(),
///     storage_mode: StorageMode::Persistent,
///     ..Default::default()
/// };
/// assert_eq!(options.volume_id(), "devpod-ws-42");
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderOptions {
    pub resources: Resources,

    /// Workspace identifier. Used verbatim as job id, job name and task group name.
    pub job_id: String,
    pub task_name: String,
    pub namespace: Option<String>,
    pub region: Option<String>,

    pub driver: Option<DriverOverrides>,

    pub storage_mode: StorageMode,
    pub csi: CsiOptions,

    /// Present iff GPU support is enabled.
    pub gpu: Option<GpuOptions>,

    pub vault: VaultOptions,
    pub nomad: NomadConnection,
}

impl Default for ProviderOptions {
    fn default() -> Self {
        Self {
            resources: Resources::default(),
            job_id: DEFAULT_JOB_ID.to_string(),
            task_name: DEFAULT_JOB_ID.to_string(),
            namespace: None,
            region: None,
            driver: None,
            storage_mode: StorageMode::Ephemeral,
            csi: CsiOptions::default(),
            gpu: None,
            vault: VaultOptions::default(),
            nomad: NomadConnection::default(),
        }
    }
}

impl ProviderOptions {
    /// CSI volume id for this workspace. A pure function of the job id.
    pub fn volume_id(&self) -> String {
        volume_id_for(&self.job_id)
    }

    pub fn is_persistent(&self) -> bool {
        self.storage_mode == StorageMode::Persistent
    }

    pub fn has_secrets(&self) -> bool {
        !self.vault.secrets.is_empty()
    }
}

pub fn volume_id_for(job_id: &str) -> String {
    format!("{VOLUME_ID_PREFIX}{job_id}")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resources {
    /// CPU shares in MHz.
    pub cpu: u32,
    pub memory_mb: u32,
    pub disk_mb: u32,
}

impl Default for Resources {
    fn default() -> Self {
        Self {
            cpu: DEFAULT_CPU,
            memory_mb: DEFAULT_MEMORY_MB,
            disk_mb: DEFAULT_DISK_MB,
        }
    }
}

impl Resources {
    /// Requested disk size in bytes, as CSI capacities are expressed.
    pub fn disk_bytes(&self) -> u64 {
        u64::from(self.disk_mb) * 1024 * 1024
    }
}

// Producers emit explicit `null` for empty collections.
fn null_as_default<'de, D, T>(deserializer: D) -> std::result::Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// Container overrides supplied by the devcontainer tooling as JSON in
/// `DEVCONTAINER_RUN_OPTIONS`. Unknown keys are ignored.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DriverOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entrypoint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cmd: Option<Vec<String>>,
    #[serde(
        skip_serializing_if = "IndexMap::is_empty",
        deserialize_with = "null_as_default"
    )]
    pub env: IndexMap<String, String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum StorageMode {
    #[default]
    Ephemeral,
    Persistent,
}

impl StorageMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            StorageMode::Ephemeral => "ephemeral",
            StorageMode::Persistent => "persistent",
        }
    }
}

impl FromStr for StorageMode {
    type Err = WorkspaceError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "ephemeral" => Ok(StorageMode::Ephemeral),
            "persistent" => Ok(StorageMode::Persistent),
            other => Err(WorkspaceError::Config(format!(
                "invalid NOMAD_STORAGE_MODE: {} (must be 'ephemeral' or 'persistent')",
                other
            ))),
        }
    }
}

impl fmt::Display for StorageMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CsiOptions {
    pub plugin_id: String,
    pub cluster_id: Option<String>,
    pub pool: String,
    /// Secret store path holding the backend's `userID` and `userKey`.
    pub secret_path: Option<String>,
}

impl Default for CsiOptions {
    fn default() -> Self {
        Self {
            plugin_id: DEFAULT_CSI_PLUGIN_ID.to_string(),
            cluster_id: None,
            pool: DEFAULT_CSI_POOL.to_string(),
            secret_path: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GpuOptions {
    pub count: u32,
    pub compute_capability: Option<ComputeCapability>,
}

impl Default for GpuOptions {
    fn default() -> Self {
        Self {
            count: DEFAULT_GPU_COUNT,
            compute_capability: None,
        }
    }
}

/// A CUDA compute capability such as `7.5`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ComputeCapability {
    pub major: u32,
    pub minor: u32,
}

impl FromStr for ComputeCapability {
    type Err = WorkspaceError;

    fn from_str(s: &str) -> Result<Self> {
        let parts: Vec<&str> = s.split('.').collect();
        if parts.len() != 2 {
            return Err(WorkspaceError::Config(
                "NOMAD_GPU_COMPUTE_CAPABILITY must be in X.Y format (e.g., '7.5')".to_string(),
            ));
        }
        // Plain digits without leading zeros, so the value prints back unchanged.
        let numeric = |p: &str| {
            let canonical = !p.is_empty()
                && p.bytes().all(|b| b.is_ascii_digit())
                && (p == "0" || !p.starts_with('0'));
            if !canonical {
                return Err(WorkspaceError::Config(format!(
                    "NOMAD_GPU_COMPUTE_CAPABILITY must be numeric without leading zeros (e.g., '7.5'), got '{}'",
                    s
                )));
            }
            p.parse::<u32>().map_err(|_| {
                WorkspaceError::Config(
                    "NOMAD_GPU_COMPUTE_CAPABILITY must be numeric (e.g., '7.5')".to_string(),
                )
            })
        };
        Ok(ComputeCapability {
            major: numeric(parts[0])?,
            minor: numeric(parts[1])?,
        })
    }
}

impl fmt::Display for ComputeCapability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// How a running task reacts when a rendered secret changes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ChangeMode {
    #[default]
    Restart,
    Noop,
    Signal,
}

impl ChangeMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeMode::Restart => "restart",
            ChangeMode::Noop => "noop",
            ChangeMode::Signal => "signal",
        }
    }
}

impl FromStr for ChangeMode {
    type Err = WorkspaceError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "restart" => Ok(ChangeMode::Restart),
            "noop" => Ok(ChangeMode::Noop),
            "signal" => Ok(ChangeMode::Signal),
            other => Err(WorkspaceError::Config(format!(
                "invalid VAULT_CHANGE_MODE: {} (must be restart, noop, or signal)",
                other
            ))),
        }
    }
}

impl fmt::Display for ChangeMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One secret to inject: a secret store path and the fields to export from it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretDefinition {
    pub path: String,
    /// Secret store field name -> environment variable name.
    #[serde(default, deserialize_with = "null_as_default")]
    pub fields: IndexMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VaultOptions {
    pub address: Option<String>,
    pub role: Option<String>,
    pub namespace: Option<String>,
    pub change_mode: ChangeMode,
    /// Sent with `ChangeMode::Signal` only.
    pub change_signal: String,
    pub policies: Vec<String>,
    pub secrets: Vec<SecretDefinition>,
    /// Caller's token for reading storage credentials. Never sent to the scheduler.
    pub token: Option<String>,
    pub skip_verify: bool,
}

impl Default for VaultOptions {
    fn default() -> Self {
        Self {
            address: None,
            role: Some(DEFAULT_VAULT_ROLE.to_string()),
            namespace: None,
            change_mode: ChangeMode::Restart,
            change_signal: DEFAULT_CHANGE_SIGNAL.to_string(),
            policies: Vec::new(),
            secrets: Vec::new(),
            token: None,
            skip_verify: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NomadConnection {
    pub address: String,
    pub token: Option<String>,
    pub skip_verify: bool,
}

impl Default for NomadConnection {
    fn default() -> Self {
        Self {
            address: DEFAULT_NOMAD_ADDR.to_string(),
            token: None,
            skip_verify: false,
        }
    }
}
