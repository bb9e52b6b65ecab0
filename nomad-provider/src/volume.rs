//! CSI volume lifecycle for persistent workspaces.
//!
//! The volume id is derived from the job id, so a workspace always finds its
//! own volume again. Creation is check-then-create without a lock; two
//! concurrent creates for one id rely on the storage backend rejecting the
//! duplicate name.

use indexmap::IndexMap;
use tracing::{debug, info, warn};

use crate::api::types::{CsiCapability, CsiMountOptions, CsiVolumeSpec};
use crate::api::{SecretData, SecretStore, VolumeApi};
use nomad_config::ProviderOptions;
use nomad_core::error::{Result, WorkspaceError};

const ACCESS_MODE: &str = "single-node-writer";
const ATTACHMENT_MODE: &str = "file-system";
const FS_TYPE: &str = "ext4";
const IMAGE_FEATURES: &str = "layering";

const USER_ID_FIELD: &str = "userID";
const USER_KEY_FIELD: &str = "userKey";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VolumeOutcome {
    Existing,
    Created,
}

/// Ensures and destroys the workspace's CSI volume.
pub struct VolumeManager<'a> {
    volumes: &'a dyn VolumeApi,
    secrets: &'a dyn SecretStore,
    options: &'a ProviderOptions,
}

impl<'a> VolumeManager<'a> {
    pub fn new(
        volumes: &'a dyn VolumeApi,
        secrets: &'a dyn SecretStore,
        options: &'a ProviderOptions,
    ) -> Self {
        Self {
            volumes,
            secrets,
            options,
        }
    }

    /// Create the volume unless it already exists.
    pub async fn ensure_volume(&self, volume_id: &str) -> Result<VolumeOutcome> {
        match self.volumes.volume(volume_id).await {
            Ok(_) => {
                debug!(volume_id, "volume already exists");
                return Ok(VolumeOutcome::Existing);
            }
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }

        let credentials = self.backend_credentials().await?;
        let spec = self.volume_spec(volume_id, credentials)?;

        info!(volume_id, plugin = %spec.plugin_id, bytes = spec.requested_capacity_max, "creating volume");
        self.volumes.create_volume(&spec).await?;
        Ok(VolumeOutcome::Created)
    }

    /// Remove the volume from the scheduler and the storage backend.
    ///
    /// Idempotent: an absent volume is success. Failing to deregister only
    /// warns; failing to delete from the backend is returned.
    pub async fn destroy_volume(&self, volume_id: &str) -> Result<()> {
        let volume = match self.volumes.volume(volume_id).await {
            Ok(volume) => volume,
            Err(e) if e.is_not_found() => {
                debug!(volume_id, "volume already gone");
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        match self.volumes.deregister_volume(volume_id, true).await {
            Ok(()) => debug!(volume_id, "volume deregistered"),
            Err(e) if e.is_not_found() => {}
            Err(e) => warn!(volume_id, error = %e, "failed to deregister volume, continuing"),
        }

        if volume.external_id.is_empty() {
            return Ok(());
        }
        let credentials = self.delete_credentials(volume_id).await;
        match self
            .volumes
            .delete_volume(&volume.external_id, &credentials)
            .await
        {
            Ok(()) => {
                info!(volume_id, external_id = %volume.external_id, "volume deleted");
                Ok(())
            }
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn backend_credentials(&self) -> Result<IndexMap<String, String>> {
        if self.options.vault.token.is_none() {
            return Err(WorkspaceError::Config(
                "DEVPOD_VAULT_TOKEN environment variable is required for fetching CSI secrets"
                    .to_string(),
            ));
        }
        let path = self.options.csi.secret_path.as_deref().ok_or_else(|| {
            WorkspaceError::Config("NOMAD_CSI_VAULT_PATH is required for persistent storage".into())
        })?;

        let data = self.secrets.read(path).await?;
        let mut credentials = IndexMap::new();
        for field in [USER_ID_FIELD, USER_KEY_FIELD] {
            credentials.insert(field.to_string(), string_field(&data, path, field)?);
        }
        Ok(credentials)
    }

    // Without a token or secret path the delete goes out unauthenticated.
    async fn delete_credentials(&self, volume_id: &str) -> IndexMap<String, String> {
        if self.options.vault.token.is_none() || self.options.csi.secret_path.is_none() {
            return IndexMap::new();
        }
        match self.backend_credentials().await {
            Ok(credentials) => credentials,
            Err(e) => {
                warn!(volume_id, error = %e, "could not read CSI credentials for delete");
                IndexMap::new()
            }
        }
    }

    fn volume_spec(
        &self,
        volume_id: &str,
        credentials: IndexMap<String, String>,
    ) -> Result<CsiVolumeSpec> {
        let options = self.options;
        let cluster_id = options.csi.cluster_id.clone().ok_or_else(|| {
            WorkspaceError::Config("NOMAD_CSI_CLUSTER_ID is required for persistent storage".into())
        })?;

        let mut parameters = IndexMap::new();
        parameters.insert("clusterID".to_string(), cluster_id);
        parameters.insert("pool".to_string(), options.csi.pool.clone());
        parameters.insert("fsType".to_string(), FS_TYPE.to_string());
        parameters.insert("imageFeatures".to_string(), IMAGE_FEATURES.to_string());

        let bytes = options.resources.disk_bytes();
        Ok(CsiVolumeSpec {
            id: volume_id.to_string(),
            name: volume_id.to_string(),
            namespace: options.namespace.clone(),
            plugin_id: options.csi.plugin_id.clone(),
            requested_capacity_min: bytes,
            requested_capacity_max: bytes,
            requested_capabilities: vec![CsiCapability {
                access_mode: ACCESS_MODE.to_string(),
                attachment_mode: ATTACHMENT_MODE.to_string(),
            }],
            parameters,
            secrets: credentials,
            mount_options: CsiMountOptions {
                fs_type: FS_TYPE.to_string(),
            },
        })
    }
}

fn string_field(data: &SecretData, path: &str, field: &str) -> Result<String> {
    data.get(field)
        .and_then(|v| v.as_str())
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .ok_or_else(|| {
            WorkspaceError::Config(format!("secret at {} has no string field '{}'", path, field))
        })
}
