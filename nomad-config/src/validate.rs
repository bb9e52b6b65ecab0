use crate::config::{ProviderOptions, StorageMode};
use nomad_core::error::{Result, WorkspaceError};

fn config_error(msg: impl Into<String>) -> WorkspaceError {
    WorkspaceError::Config(msg.into())
}

/// Shell variable names that are safe to splice into an `export` line.
fn is_env_var_name(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c == '_' || c.is_ascii_alphabetic())
        && chars.all(|c| c == '_' || c.is_ascii_alphanumeric())
}

/// Cross-field checks on resolved options. Runs before any remote call.
pub struct ConfigValidator<'a> {
    options: &'a ProviderOptions,
}

impl<'a> ConfigValidator<'a> {
    pub fn new(options: &'a ProviderOptions) -> Self {
        Self { options }
    }

    pub fn validate(&self) -> Result<()> {
        self.validate_vault()?;
        self.validate_storage()?;
        self.validate_gpu()?;
        Ok(())
    }

    fn validate_vault(&self) -> Result<()> {
        let vault = &self.options.vault;
        if vault.secrets.is_empty() {
            return Ok(());
        }

        if vault.policies.is_empty() {
            return Err(config_error(
                "VAULT_POLICIES_JSON is required when VAULT_SECRETS_JSON is specified",
            ));
        }
        if vault.address.is_none() {
            return Err(config_error(
                "VAULT_ADDR is required when VAULT_SECRETS_JSON is specified",
            ));
        }

        for (i, secret) in vault.secrets.iter().enumerate() {
            if secret.path.is_empty() {
                return Err(config_error(format!(
                    "vault secret at index {} has empty path",
                    i
                )));
            }
            if secret.fields.is_empty() {
                return Err(config_error(format!(
                    "vault secret at index {} ({}) has no field mappings",
                    i, secret.path
                )));
            }
            for (field, env_var) in &secret.fields {
                if field.is_empty() {
                    return Err(config_error(format!(
                        "vault secret at index {} ({}) has empty field name",
                        i, secret.path
                    )));
                }
                if env_var.is_empty() {
                    return Err(config_error(format!(
                        "vault secret at index {} ({}) has empty environment variable name for field {}",
                        i, secret.path, field
                    )));
                }
                if !is_env_var_name(env_var) {
                    return Err(config_error(format!(
                        "vault secret at index {} ({}) maps field {} to invalid environment variable name '{}'",
                        i, secret.path, field, env_var
                    )));
                }
            }
        }

        Ok(())
    }

    fn validate_storage(&self) -> Result<()> {
        if self.options.storage_mode != StorageMode::Persistent {
            return Ok(());
        }

        let csi = &self.options.csi;
        if csi.cluster_id.is_none() {
            return Err(config_error(
                "NOMAD_CSI_CLUSTER_ID is required when NOMAD_STORAGE_MODE is 'persistent'",
            ));
        }
        if csi.plugin_id.is_empty() {
            return Err(config_error(
                "NOMAD_CSI_PLUGIN_ID is required when NOMAD_STORAGE_MODE is 'persistent'",
            ));
        }
        if csi.secret_path.is_none() {
            return Err(config_error(
                "NOMAD_CSI_VAULT_PATH is required when NOMAD_STORAGE_MODE is 'persistent' (Vault path containing 'userID' and 'userKey' for Ceph CSI)",
            ));
        }
        if self.options.vault.address.is_none() {
            return Err(config_error(
                "VAULT_ADDR is required when NOMAD_STORAGE_MODE is 'persistent' (needed to fetch CSI credentials)",
            ));
        }

        Ok(())
    }

    fn validate_gpu(&self) -> Result<()> {
        if let Some(gpu) = &self.options.gpu {
            if gpu.count < 1 {
                return Err(config_error("NOMAD_GPU_COUNT must be at least 1"));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CsiOptions, GpuOptions, SecretDefinition, VaultOptions};
    use indexmap::IndexMap;

    fn persistent() -> ProviderOptions {
        ProviderOptions {
            storage_mode: StorageMode::Persistent,
            csi: CsiOptions {
                cluster_id: Some("ceph-main".into()),
                secret_path: Some("secret/data/ceph/csi".into()),
                ..Default::default()
            },
            vault: VaultOptions {
                address: Some("https://vault:8200".into()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn with_secret(fields: &[(&str, &str)]) -> ProviderOptions {
        ProviderOptions {
            vault: VaultOptions {
                address: Some("https://vault:8200".into()),
                policies: vec!["devpod".into()],
                secrets: vec![SecretDefinition {
                    path: "secret/data/app".into(),
                    fields: fields
                        .iter()
                        .map(|(k, v)| (k.to_string(), v.to_string()))
                        .collect::<IndexMap<_, _>>(),
                }],
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn error_of(options: &ProviderOptions) -> String {
        ConfigValidator::new(options).validate().unwrap_err().to_string()
    }

    #[test]
    fn test_ephemeral_defaults_are_valid() {
        assert!(ConfigValidator::new(&ProviderOptions::default())
            .validate()
            .is_ok());
    }

    #[test]
    fn test_complete_persistent_is_valid() {
        assert!(ConfigValidator::new(&persistent()).validate().is_ok());
    }

    #[test]
    fn test_persistent_requires_each_setting() {
        let mut options = persistent();
        options.csi.cluster_id = None;
        assert!(error_of(&options).contains("NOMAD_CSI_CLUSTER_ID"));

        let mut options = persistent();
        options.csi.plugin_id = String::new();
        assert!(error_of(&options).contains("NOMAD_CSI_PLUGIN_ID"));

        let mut options = persistent();
        options.csi.secret_path = None;
        assert!(error_of(&options).contains("NOMAD_CSI_VAULT_PATH"));

        let mut options = persistent();
        options.vault.address = None;
        assert!(error_of(&options).contains("VAULT_ADDR is required when NOMAD_STORAGE_MODE"));
    }

    #[test]
    fn test_secrets_require_policies_and_address() {
        let mut options = with_secret(&[("api_key", "API_KEY")]);
        options.vault.policies.clear();
        assert!(error_of(&options).contains("VAULT_POLICIES_JSON is required"));

        let mut options = with_secret(&[("api_key", "API_KEY")]);
        options.vault.address = None;
        assert!(error_of(&options).contains("VAULT_ADDR is required when VAULT_SECRETS_JSON"));
    }

    #[test]
    fn test_secret_shape_errors() {
        let mut options = with_secret(&[("api_key", "API_KEY")]);
        options.vault.secrets[0].path.clear();
        assert_eq!(
            error_of(&options),
            "Configuration error: vault secret at index 0 has empty path"
        );

        assert!(error_of(&with_secret(&[])).contains("has no field mappings"));
        assert!(error_of(&with_secret(&[("", "API_KEY")])).contains("has empty field name"));
        assert!(error_of(&with_secret(&[("api_key", "")]))
            .contains("empty environment variable name for field api_key"));
    }

    #[test]
    fn test_env_var_names_must_be_shell_safe() {
        assert!(ConfigValidator::new(&with_secret(&[("k", "_OK_1")]))
            .validate()
            .is_ok());
        assert!(error_of(&with_secret(&[("k", "1BAD")])).contains("invalid environment variable"));
        assert!(error_of(&with_secret(&[("k", "A;rm")])).contains("invalid environment variable"));
    }

    #[test]
    fn test_zero_gpu_count_rejected() {
        let options = ProviderOptions {
            gpu: Some(GpuOptions {
                count: 0,
                compute_capability: None,
            }),
            ..Default::default()
        };
        assert!(error_of(&options).contains("NOMAD_GPU_COUNT must be at least 1"));
    }
}
