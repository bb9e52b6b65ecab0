//! The optional per-workspace `.devpod/nomad.yaml` file.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Deserializer};
use tracing::debug;

use crate::config::SecretDefinition;
use nomad_core::error::{Result, WorkspaceError};

pub const CONFIG_DIR: &str = ".devpod";
pub const CONFIG_FILE: &str = "nomad.yaml";

// Numeric settings are often written unquoted in YAML; accept both forms.
fn deserialize_option_string_or_number<'de, D>(
    deserializer: D,
) -> std::result::Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum StringOrNumber {
        String(String),
        Integer(i64),
        Float(f64),
    }

    Ok(
        Option::<StringOrNumber>::deserialize(deserializer)?.map(|v| match v {
            StringOrNumber::String(s) => s,
            StringOrNumber::Integer(i) => i.to_string(),
            StringOrNumber::Float(f) => f.to_string(),
        }),
    )
}

// Versions like `8.10` read as floats lose digits, so only strings are accepted.
fn deserialize_option_quoted_version<'de, D>(
    deserializer: D,
) -> std::result::Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum StringOrNumber {
        String(String),
        Number(f64),
    }

    match Option::<StringOrNumber>::deserialize(deserializer)? {
        Some(StringOrNumber::String(s)) => Ok(Some(s)),
        Some(StringOrNumber::Number(n)) => Err(serde::de::Error::custom(format!(
            "nomad_gpu_compute_capability must be quoted (e.g. \"8.6\"), got unquoted {}",
            n
        ))),
        None => Ok(None),
    }
}

/// Settings read from `.devpod/nomad.yaml`. Every key is optional; absent keys
/// fall through to the built-in default.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct ConfigFile {
    #[serde(deserialize_with = "deserialize_option_string_or_number")]
    pub nomad_cpu: Option<String>,
    #[serde(deserialize_with = "deserialize_option_string_or_number")]
    pub nomad_memorymb: Option<String>,
    #[serde(deserialize_with = "deserialize_option_string_or_number")]
    pub nomad_diskmb: Option<String>,

    pub nomad_addr: Option<String>,
    pub nomad_namespace: Option<String>,
    pub nomad_region: Option<String>,

    pub nomad_gpu: Option<bool>,
    pub nomad_gpu_count: Option<i64>,
    #[serde(deserialize_with = "deserialize_option_quoted_version")]
    pub nomad_gpu_compute_capability: Option<String>,

    pub nomad_storage_mode: Option<String>,
    pub nomad_csi_plugin_id: Option<String>,
    pub nomad_csi_cluster_id: Option<String>,
    pub nomad_csi_pool: Option<String>,
    pub nomad_csi_vault_path: Option<String>,

    pub vault_addr: Option<String>,
    pub vault_role: Option<String>,
    pub vault_namespace: Option<String>,
    pub vault_change_mode: Option<String>,
    pub vault_change_signal: Option<String>,
    pub vault_skip_verify: Option<bool>,
    pub vault_policies: Option<Vec<String>>,
    pub vault_secrets: Option<Vec<SecretDefinition>>,
}

impl ConfigFile {
    /// Read `<workspace>/.devpod/nomad.yaml`.
    ///
    /// A missing file is `Ok(None)`. A file that exists but cannot be read or
    /// parsed is a configuration error.
    pub fn load(workspace: &Path) -> Result<Option<ConfigFile>> {
        let path = config_path(workspace);
        let contents = match fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!(path = %path.display(), "no workspace config file");
                return Ok(None);
            }
            Err(e) => {
                return Err(WorkspaceError::Config(format!(
                    "failed to read {}: {}",
                    path.display(),
                    e
                )))
            }
        };

        debug!(path = %path.display(), "loading workspace config file");
        Self::parse(&contents)
            .map(Some)
            .map_err(|e| WorkspaceError::Config(format!("failed to load {}: {}", path.display(), e)))
    }

    pub fn parse(contents: &str) -> Result<ConfigFile> {
        // An empty document deserializes as unit rather than a mapping.
        if contents.trim().is_empty() {
            return Ok(ConfigFile::default());
        }
        Ok(serde_yaml_ng::from_str(contents)?)
    }
}

pub fn config_path(workspace: &Path) -> PathBuf {
    workspace.join(CONFIG_DIR).join(CONFIG_FILE)
}

/// Locate the workspace directory whose config file should be read.
///
/// A `local:<path>` workspace source wins. Otherwise the current directory is
/// used, but only when it actually contains a config file.
pub fn workspace_path(source: Option<&str>, current_dir: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = source.and_then(|s| s.strip_prefix("local:")) {
        return Some(PathBuf::from(path));
    }

    let cwd = current_dir?;
    config_path(cwd).is_file().then(|| cwd.to_path_buf())
}
