use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use tracing::debug;

use super::{SecretData, SecretStore};
use nomad_config::VaultOptions;
use nomad_core::error::{Result, WorkspaceError};

const TOKEN_HEADER: &str = "X-Vault-Token";
const NAMESPACE_HEADER: &str = "X-Vault-Namespace";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Deserialize)]
struct SecretResponse {
    #[serde(default)]
    data: Option<SecretData>,
}

/// Pull the field map out of a logical read response. KV v2 nests the fields
/// under `data.data`; KV v1 returns them directly under `data`.
fn extract_fields(data: SecretData) -> SecretData {
    match data.get("data") {
        Some(serde_json::Value::Object(inner)) => inner.clone(),
        _ => data,
    }
}

/// Minimal Vault client for logical reads.
#[derive(Debug, Clone)]
pub struct VaultClient {
    http: Client,
    address: Option<String>,
    token: Option<String>,
    namespace: Option<String>,
}

impl VaultClient {
    /// Build a client from resolved options. Without an address the client
    /// is still built, but every read fails with a configuration error.
    pub fn new(options: &VaultOptions) -> Result<Self> {
        let http = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .danger_accept_invalid_certs(options.skip_verify)
            .build()
            .map_err(|e| WorkspaceError::Config(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            http,
            address: options
                .address
                .as_deref()
                .map(|a| a.trim_end_matches('/').to_string()),
            token: options.token.clone(),
            namespace: options.namespace.clone(),
        })
    }

    fn url(&self, path: &str) -> Result<String> {
        let address = self.address.as_deref().ok_or_else(|| {
            WorkspaceError::Config("VAULT_ADDR is required for reading Vault secrets".to_string())
        })?;
        Ok(format!("{}/v1/{}", address, path.trim_start_matches('/')))
    }
}

#[async_trait]
impl SecretStore for VaultClient {
    async fn read(&self, path: &str) -> Result<SecretData> {
        let token = self.token.as_deref().ok_or_else(|| {
            WorkspaceError::Config(
                "DEVPOD_VAULT_TOKEN environment variable is required for reading Vault secrets"
                    .to_string(),
            )
        })?;

        let url = self.url(path)?;

        debug!(path, "reading secret");
        let mut request = self.http.get(url).header(TOKEN_HEADER, token);
        if let Some(namespace) = &self.namespace {
            request = request.header(NAMESPACE_HEADER, namespace);
        }

        let response = request
            .send()
            .await
            .map_err(|e| WorkspaceError::Transport(format!("read secret {}: {}", path, e)))?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(WorkspaceError::NotFound(format!("no secret found at path {}", path)));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(WorkspaceError::Transport(format!(
                "read secret {}: {} - {}",
                path,
                status,
                body.trim()
            )));
        }

        let body: SecretResponse = response.json().await.map_err(|e| {
            WorkspaceError::Transport(format!("read secret {}: invalid response: {}", path, e))
        })?;
        let data = body
            .data
            .ok_or_else(|| WorkspaceError::NotFound(format!("no secret found at path {}", path)))?;
        Ok(extract_fields(data))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::test_server::respond_once;
    use serde_json::json;

    fn client(address: &str) -> VaultClient {
        VaultClient::new(&VaultOptions {
            address: Some(address.into()),
            token: Some("s.token".into()),
            namespace: Some("admin/team".into()),
            ..Default::default()
        })
        .unwrap()
    }

    fn object(value: serde_json::Value) -> SecretData {
        match value {
            serde_json::Value::Object(map) => map,
            _ => unreachable!("test fixture must be an object"),
        }
    }

    #[test]
    fn test_extract_kv2_fields() {
        let data = object(json!({
            "data": {"userID": "admin", "userKey": "AQD=="},
            "metadata": {"version": 3}
        }));
        let fields = extract_fields(data);
        assert_eq!(fields["userID"], "admin");
        assert!(fields.get("metadata").is_none());
    }

    #[test]
    fn test_extract_kv1_fields() {
        let data = object(json!({"userID": "admin", "userKey": "AQD=="}));
        let fields = extract_fields(data);
        assert_eq!(fields["userKey"], "AQD==");
    }

    #[test]
    fn test_url_joins_path() {
        let client = VaultClient::new(&VaultOptions {
            address: Some("https://vault.example.com:8200/".into()),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(
            client.url("/secret/data/ceph/csi").unwrap(),
            "https://vault.example.com:8200/v1/secret/data/ceph/csi"
        );
    }

    #[tokio::test]
    async fn test_read_without_address_is_config_error() {
        let client = VaultClient::new(&VaultOptions {
            token: Some("s.token".into()),
            ..Default::default()
        })
        .unwrap();
        let err = client.read("secret/data/x").await.unwrap_err();
        assert!(matches!(err, WorkspaceError::Config(_)));
    }

    #[tokio::test]
    async fn test_read_without_token_is_config_error() {
        let client = VaultClient::new(&VaultOptions {
            address: Some("https://vault.invalid:8200".into()),
            ..Default::default()
        })
        .unwrap();
        let err = client.read("secret/data/x").await.unwrap_err();
        assert!(matches!(err, WorkspaceError::Config(_)));
    }

    #[tokio::test]
    async fn test_read_unwraps_kv2_response() {
        let body = json!({
            "data": {
                "data": {"userID": "nomad", "userKey": "AQBk=="},
                "metadata": {"version": 2}
            }
        })
        .to_string();
        let server = respond_once(200, &body).await;

        let fields = client(&server.address)
            .read("secret/data/ceph/csi")
            .await
            .unwrap();
        assert_eq!(fields["userID"], "nomad");
        assert_eq!(fields["userKey"], "AQBk==");
        assert!(fields.get("metadata").is_none());

        let request = server.request().await.to_lowercase();
        assert!(request.starts_with("get /v1/secret/data/ceph/csi "));
        assert!(request.contains("x-vault-token: s.token"));
        assert!(request.contains("x-vault-namespace: admin/team"));
    }

    #[tokio::test]
    async fn test_read_missing_secret_is_not_found() {
        let server = respond_once(404, r#"{"errors":[]}"#).await;
        let err = client(&server.address)
            .read("secret/data/missing")
            .await
            .unwrap_err();
        assert!(matches!(err, WorkspaceError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_read_server_error_is_transport() {
        let server = respond_once(500, r#"{"errors":["sealed"]}"#).await;
        let err = client(&server.address)
            .read("secret/data/ceph/csi")
            .await
            .unwrap_err();
        match err {
            WorkspaceError::Transport(message) => assert!(message.contains("sealed")),
            other => panic!("expected transport error, got {:?}", other),
        }
    }
}
