// Standard library imports
use std::path::{Path, PathBuf};

// External crate imports
use tracing::{debug, warn};

// Internal imports
use crate::config::{
    ChangeMode, CsiOptions, DriverOverrides, GpuOptions, NomadConnection, ProviderOptions,
    Resources, SecretDefinition, StorageMode, VaultOptions, DEFAULT_CHANGE_SIGNAL, DEFAULT_CPU,
    DEFAULT_CSI_PLUGIN_ID, DEFAULT_CSI_POOL, DEFAULT_DISK_MB, DEFAULT_GPU_COUNT, DEFAULT_JOB_ID,
    DEFAULT_MEMORY_MB, DEFAULT_NOMAD_ADDR, DEFAULT_VAULT_ROLE,
};
use crate::env::Environment;
use crate::file::{workspace_path, ConfigFile};
use crate::validate::ConfigValidator;
use nomad_core::error::{Result, WorkspaceError};

/// Resolves [`ProviderOptions`] from the environment, the workspace's
/// `.devpod/nomad.yaml`, and built-in defaults, in that order of precedence.
///
/// Resolution is a single pass. The loader never writes back to the
/// environment and the result is validated before it is returned.
pub struct ConfigLoader {
    env: Environment,
    current_dir: Option<PathBuf>,
}

impl ConfigLoader {
    pub fn new(env: Environment) -> Self {
        Self {
            env,
            current_dir: std::env::current_dir().ok(),
        }
    }

    pub fn from_process_env() -> Self {
        Self::new(Environment::from_process())
    }

    /// Override the directory searched for a config file when the workspace
    /// source is not local.
    pub fn with_current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }

    /// Locate and read the config file, resolve every setting and validate.
    pub fn load(&self) -> Result<ProviderOptions> {
        let file = match workspace_path(self.env.get("WORKSPACE_SOURCE"), self.current_dir.as_deref()) {
            Some(workspace) => self.load_file(&workspace)?,
            None => ConfigFile::default(),
        };

        let options = self.resolve(&file)?;
        ConfigValidator::new(&options).validate()?;

        debug!(
            job_id = %options.job_id,
            storage_mode = %options.storage_mode,
            gpu = options.gpu.is_some(),
            secrets = options.vault.secrets.len(),
            "resolved provider options"
        );
        Ok(options)
    }

    fn load_file(&self, workspace: &Path) -> Result<ConfigFile> {
        Ok(ConfigFile::load(workspace)?.unwrap_or_default())
    }

    /// Merge environment, file and defaults into typed options without running
    /// cross-field validation.
    pub fn resolve(&self, file: &ConfigFile) -> Result<ProviderOptions> {
        let env = &self.env;

        let resources = Resources {
            cpu: positive_or_default(
                "NOMAD_CPU",
                pick(env, "NOMAD_CPU", &file.nomad_cpu),
                DEFAULT_CPU,
            )?,
            memory_mb: positive_or_default(
                "NOMAD_MEMORYMB",
                pick(env, "NOMAD_MEMORYMB", &file.nomad_memorymb),
                DEFAULT_MEMORY_MB,
            )?,
            disk_mb: positive_or_default(
                "NOMAD_DISKMB",
                pick(env, "NOMAD_DISKMB", &file.nomad_diskmb),
                DEFAULT_DISK_MB,
            )?,
        };

        let job_id = env
            .get_owned("MACHINE_ID")
            .unwrap_or_else(|| DEFAULT_JOB_ID.to_string());

        let storage_mode = match pick(env, "NOMAD_STORAGE_MODE", &file.nomad_storage_mode) {
            Some(mode) => mode.parse()?,
            None => StorageMode::Ephemeral,
        };

        let csi = CsiOptions {
            plugin_id: pick(env, "NOMAD_CSI_PLUGIN_ID", &file.nomad_csi_plugin_id)
                .unwrap_or_else(|| DEFAULT_CSI_PLUGIN_ID.to_string()),
            cluster_id: pick(env, "NOMAD_CSI_CLUSTER_ID", &file.nomad_csi_cluster_id),
            pool: pick(env, "NOMAD_CSI_POOL", &file.nomad_csi_pool)
                .unwrap_or_else(|| DEFAULT_CSI_POOL.to_string()),
            secret_path: pick(env, "NOMAD_CSI_VAULT_PATH", &file.nomad_csi_vault_path),
        };

        let vault = self.resolve_vault(file)?;

        let nomad = NomadConnection {
            address: pick(env, "NOMAD_ADDR", &file.nomad_addr)
                .unwrap_or_else(|| DEFAULT_NOMAD_ADDR.to_string()),
            token: env.get_owned("NOMAD_TOKEN"),
            skip_verify: env.get("NOMAD_SKIP_VERIFY").map(is_truthy).unwrap_or(false),
        };

        Ok(ProviderOptions {
            resources,
            task_name: job_id.clone(),
            job_id,
            namespace: pick(env, "NOMAD_NAMESPACE", &file.nomad_namespace),
            region: pick(env, "NOMAD_REGION", &file.nomad_region),
            driver: self.resolve_driver()?,
            storage_mode,
            csi,
            gpu: self.resolve_gpu(file)?,
            vault,
            nomad,
        })
    }

    fn resolve_driver(&self) -> Result<Option<DriverOverrides>> {
        match self.env.get("DEVCONTAINER_RUN_OPTIONS") {
            None | Some("null") => Ok(None),
            Some(raw) => serde_json::from_str(raw).map(Some).map_err(|e| {
                WorkspaceError::Config(format!("unmarshal DEVCONTAINER_RUN_OPTIONS: {}", e))
            }),
        }
    }

    fn resolve_gpu(&self, file: &ConfigFile) -> Result<Option<GpuOptions>> {
        let enabled = match self.env.get("NOMAD_GPU") {
            Some(value) => is_truthy(value),
            None => file.nomad_gpu.unwrap_or(false),
        };
        if !enabled {
            return Ok(None);
        }

        // An unparsable or non-positive env count falls through to the file.
        let count = self
            .env
            .get("NOMAD_GPU_COUNT")
            .and_then(|v| v.parse::<i64>().ok())
            .filter(|n| *n > 0)
            .or(file.nomad_gpu_count)
            .unwrap_or(i64::from(DEFAULT_GPU_COUNT));
        let count = u32::try_from(count)
            .ok()
            .filter(|n| *n >= 1)
            .ok_or_else(|| WorkspaceError::Config("NOMAD_GPU_COUNT must be at least 1".to_string()))?;

        let compute_capability = pick(
            &self.env,
            "NOMAD_GPU_COMPUTE_CAPABILITY",
            &file.nomad_gpu_compute_capability,
        )
        .map(|cc| cc.parse())
        .transpose()?;

        Ok(Some(GpuOptions {
            count,
            compute_capability,
        }))
    }

    fn resolve_vault(&self, file: &ConfigFile) -> Result<VaultOptions> {
        let env = &self.env;

        let policies = match env.get("VAULT_POLICIES_JSON") {
            Some(raw) => serde_json::from_str::<Vec<String>>(raw).map_err(|e| {
                WorkspaceError::Config(format!("unmarshal VAULT_POLICIES_JSON: {}", e))
            })?,
            None => file.vault_policies.clone().unwrap_or_default(),
        };

        let secrets = match env.get("VAULT_SECRETS_JSON") {
            Some(raw) => serde_json::from_str::<Vec<SecretDefinition>>(raw).map_err(|e| {
                WorkspaceError::Config(format!("unmarshal VAULT_SECRETS_JSON: {}", e))
            })?,
            None => file.vault_secrets.clone().unwrap_or_default(),
        };

        // The change mode only matters once secrets are templated.
        let change_mode = match pick(env, "VAULT_CHANGE_MODE", &file.vault_change_mode) {
            None => ChangeMode::Restart,
            Some(raw) => match raw.parse::<ChangeMode>() {
                Ok(mode) => mode,
                Err(e) if secrets.is_empty() => {
                    warn!("ignoring {} since no vault secrets are configured", e);
                    ChangeMode::Restart
                }
                Err(e) => return Err(e),
            },
        };

        Ok(VaultOptions {
            address: pick(env, "VAULT_ADDR", &file.vault_addr),
            role: Some(
                pick(env, "VAULT_ROLE", &file.vault_role)
                    .unwrap_or_else(|| DEFAULT_VAULT_ROLE.to_string()),
            ),
            namespace: pick(env, "VAULT_NAMESPACE", &file.vault_namespace),
            change_mode,
            change_signal: pick(env, "VAULT_CHANGE_SIGNAL", &file.vault_change_signal)
                .unwrap_or_else(|| DEFAULT_CHANGE_SIGNAL.to_string()),
            policies,
            secrets,
            token: env.get_owned("DEVPOD_VAULT_TOKEN"),
            skip_verify: match env.get("VAULT_SKIP_VERIFY") {
                Some(value) => is_truthy(value),
                None => file.vault_skip_verify.unwrap_or(false),
            },
        })
    }
}

/// Environment value if set and non-empty, else the file value if non-empty.
fn pick(env: &Environment, key: &str, file_value: &Option<String>) -> Option<String> {
    env.get_owned(key).or_else(|| {
        file_value
            .as_deref()
            .filter(|v| !v.is_empty())
            .map(str::to_string)
    })
}

fn positive_or_default(key: &str, value: Option<String>, default: u32) -> Result<u32> {
    let Some(raw) = value else {
        return Ok(default);
    };
    raw.trim()
        .parse::<u32>()
        .ok()
        .filter(|n| *n > 0)
        .ok_or_else(|| {
            WorkspaceError::Config(format!("{} must be a positive integer, got '{}'", key, raw))
        })
}

fn is_truthy(value: &str) -> bool {
    value.eq_ignore_ascii_case("true") || value == "1"
}
