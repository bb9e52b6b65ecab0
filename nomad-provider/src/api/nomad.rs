use std::time::Duration;

use async_trait::async_trait;
use indexmap::IndexMap;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use tracing::debug;
use url::Url;

use super::exec::{self, ExecTarget};
use super::types::{
    Allocation, AllocationStub, CsiVolume, CsiVolumeCreateRequest, CsiVolumeSpec, Job, JobInfo,
    JobListStub, JobRegisterRequest, JobRegisterResponse,
};
use super::{ExecIo, ExecRequest, SchedulerApi, VolumeApi};
use nomad_config::ProviderOptions;
use nomad_core::error::{Result, WorkspaceError};
use nomad_core::CancellationToken;

const TOKEN_HEADER: &str = "X-Nomad-Token";
const CSI_SECRETS_HEADER: &str = "X-Nomad-CSI-Secrets";
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

// `key=value` pairs joined with commas.
fn csi_secrets_header(secrets: &IndexMap<String, String>) -> String {
    secrets
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(",")
}

/// Nomad HTTP API client scoped to one namespace and region.
#[derive(Debug, Clone)]
pub struct NomadClient {
    http: Client,
    base: Url,
    token: Option<String>,
    namespace: Option<String>,
    region: Option<String>,
}

impl NomadClient {
    pub fn new(options: &ProviderOptions) -> Result<Self> {
        let base = Url::parse(&options.nomad.address).map_err(|e| {
            WorkspaceError::Config(format!(
                "invalid NOMAD_ADDR '{}': {}",
                options.nomad.address, e
            ))
        })?;
        if base.cannot_be_a_base() || !matches!(base.scheme(), "http" | "https") {
            return Err(WorkspaceError::Config(format!(
                "invalid NOMAD_ADDR '{}': expected an http or https URL",
                options.nomad.address
            )));
        }

        let http = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .danger_accept_invalid_certs(options.nomad.skip_verify)
            .build()
            .map_err(|e| WorkspaceError::Config(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            http,
            base,
            token: options.nomad.token.clone(),
            namespace: options.namespace.clone(),
            region: options.region.clone(),
        })
    }

    fn endpoint(&self, segments: &[&str]) -> Url {
        let mut url = self.base.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    fn scoped(&self, request: RequestBuilder) -> RequestBuilder {
        let mut request = request;
        if let Some(namespace) = &self.namespace {
            request = request.query(&[("namespace", namespace)]);
        }
        if let Some(region) = &self.region {
            request = request.query(&[("region", region)]);
        }
        if let Some(token) = &self.token {
            request = request.header(TOKEN_HEADER, token);
        }
        request
    }

    async fn send(&self, request: RequestBuilder, what: &str) -> Result<Response> {
        let response = self
            .scoped(request)
            .send()
            .await
            .map_err(|e| WorkspaceError::Transport(format!("{}: {}", what, e)))?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(WorkspaceError::NotFound(what.to_string()));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(WorkspaceError::Transport(format!(
                "{}: {} - {}",
                what,
                status,
                body.trim()
            )));
        }
        Ok(response)
    }

    async fn json<T: DeserializeOwned>(response: Response, what: &str) -> Result<T> {
        response
            .json()
            .await
            .map_err(|e| WorkspaceError::Transport(format!("{}: invalid response: {}", what, e)))
    }

    fn exec_url(&self, alloc_id: &str, task: &str, request: &ExecRequest) -> Result<Url> {
        let mut url = self.endpoint(&["v1", "client", "allocation", alloc_id, "exec"]);
        let scheme = if url.scheme() == "https" { "wss" } else { "ws" };
        url.set_scheme(scheme).map_err(|_| {
            WorkspaceError::Config(format!("cannot derive websocket URL from {}", self.base))
        })?;

        let command = serde_json::to_string(&request.command)?;
        {
            let mut query = url.query_pairs_mut();
            query
                .append_pair("task", task)
                .append_pair("tty", if request.tty { "true" } else { "false" })
                .append_pair("command", &command);
            if let Some(namespace) = &self.namespace {
                query.append_pair("namespace", namespace);
            }
            if let Some(region) = &self.region {
                query.append_pair("region", region);
            }
        }
        Ok(url)
    }
}

#[async_trait]
impl SchedulerApi for NomadClient {
    async fn list_jobs(&self) -> Result<Vec<JobListStub>> {
        let what = "list jobs";
        let response = self.send(self.http.get(self.endpoint(&["v1", "jobs"])), what).await?;
        Self::json(response, what).await
    }

    async fn register_job(&self, job: &Job) -> Result<JobRegisterResponse> {
        let what = format!("register job {}", job.id);
        debug!(job_id = %job.id, "registering job");
        let request = self
            .http
            .post(self.endpoint(&["v1", "jobs"]))
            .json(&JobRegisterRequest { job });
        let response = self.send(request, &what).await?;
        Self::json(response, &what).await
    }

    async fn deregister_job(&self, job_id: &str, purge: bool) -> Result<()> {
        let what = format!("deregister job {}", job_id);
        let request = self
            .http
            .delete(self.endpoint(&["v1", "job", job_id]))
            .query(&[("purge", purge)]);
        self.send(request, &what).await?;
        Ok(())
    }

    async fn job_info(&self, job_id: &str) -> Result<JobInfo> {
        let what = format!("job {}", job_id);
        let response = self
            .send(self.http.get(self.endpoint(&["v1", "job", job_id])), &what)
            .await?;
        Self::json(response, &what).await
    }

    async fn job_allocations(&self, job_id: &str) -> Result<Vec<AllocationStub>> {
        let what = format!("allocations for job {}", job_id);
        let url = self.endpoint(&["v1", "job", job_id, "allocations"]);
        let response = self.send(self.http.get(url), &what).await?;
        Self::json(response, &what).await
    }

    async fn allocation(&self, alloc_id: &str) -> Result<Allocation> {
        let what = format!("allocation {}", alloc_id);
        let url = self.endpoint(&["v1", "allocation", alloc_id]);
        let response = self.send(self.http.get(url), &what).await?;
        Self::json(response, &what).await
    }

    async fn exec(
        &self,
        alloc_id: &str,
        task: &str,
        request: ExecRequest,
        io: ExecIo,
        cancel: &CancellationToken,
    ) -> Result<i32> {
        let target = ExecTarget {
            url: self.exec_url(alloc_id, task, &request)?,
            token: self.token.clone(),
        };
        exec::run_session(target, io, cancel).await
    }
}

#[async_trait]
impl VolumeApi for NomadClient {
    async fn volume(&self, volume_id: &str) -> Result<CsiVolume> {
        let what = format!("volume {}", volume_id);
        let url = self.endpoint(&["v1", "volume", "csi", volume_id]);
        let response = self.send(self.http.get(url), &what).await?;
        Self::json(response, &what).await
    }

    async fn create_volume(&self, spec: &CsiVolumeSpec) -> Result<()> {
        let what = format!("create volume {}", spec.id);
        let url = self.endpoint(&["v1", "volume", "csi", &spec.id, "create"]);
        let request = self
            .http
            .put(url)
            .json(&CsiVolumeCreateRequest { volumes: [spec] });
        self.send(request, &what).await?;
        Ok(())
    }

    async fn deregister_volume(&self, volume_id: &str, force: bool) -> Result<()> {
        let what = format!("deregister volume {}", volume_id);
        let request = self
            .http
            .delete(self.endpoint(&["v1", "volume", "csi", volume_id]))
            .query(&[("force", force)]);
        self.send(request, &what).await?;
        Ok(())
    }

    async fn delete_volume(
        &self,
        external_id: &str,
        secrets: &IndexMap<String, String>,
    ) -> Result<()> {
        let what = format!("delete volume {}", external_id);
        let url = self.endpoint(&["v1", "volume", "csi", external_id, "delete"]);
        let mut request = self.http.delete(url);
        if !secrets.is_empty() {
            request = request.header(CSI_SECRETS_HEADER, csi_secrets_header(secrets));
        }
        self.send(request, &what).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::test_server::respond_once;
    use nomad_config::NomadConnection;

    fn scoped_options(address: &str) -> ProviderOptions {
        ProviderOptions {
            namespace: Some("dev team".into()),
            region: Some("eu".into()),
            nomad: NomadConnection {
                address: address.into(),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn client(address: &str) -> NomadClient {
        NomadClient::new(&scoped_options(address)).unwrap()
    }

    #[test]
    fn test_endpoint_escapes_segments() {
        let url = client("http://127.0.0.1:4646").endpoint(&["v1", "job", "ws/1"]);
        assert_eq!(url.as_str(), "http://127.0.0.1:4646/v1/job/ws%2F1");
    }

    #[test]
    fn test_endpoint_keeps_path_prefix() {
        let url = client("https://gateway.example.com/nomad/").endpoint(&["v1", "jobs"]);
        assert_eq!(url.as_str(), "https://gateway.example.com/nomad/v1/jobs");
    }

    #[test]
    fn test_exec_url_uses_websocket_scheme_and_scope() {
        let request = ExecRequest {
            command: vec!["/bin/sh".into(), "-c".into(), "echo hi".into()],
            tty: true,
        };
        let url = client("https://nomad.example.com:4646")
            .exec_url("a1b2", "ws", &request)
            .unwrap();

        assert_eq!(url.scheme(), "wss");
        assert_eq!(url.path(), "/v1/client/allocation/a1b2/exec");
        let pairs: Vec<(String, String)> = url.query_pairs().into_owned().collect();
        assert!(pairs.contains(&("task".into(), "ws".into())));
        assert!(pairs.contains(&("tty".into(), "true".into())));
        assert!(pairs.contains(&(
            "command".into(),
            r#"["/bin/sh","-c","echo hi"]"#.into()
        )));
        assert!(pairs.contains(&("namespace".into(), "dev team".into())));
        assert!(pairs.contains(&("region".into(), "eu".into())));
    }

    #[test]
    fn test_csi_secrets_header_format() {
        let mut secrets = IndexMap::new();
        secrets.insert("userID".to_string(), "nomad".to_string());
        secrets.insert("userKey".to_string(), "AQBk==".to_string());
        assert_eq!(csi_secrets_header(&secrets), "userID=nomad,userKey=AQBk==");
    }

    #[tokio::test]
    async fn test_job_info_decodes_success() {
        let server = respond_once(200, r#"{"ID":"ws-1","Status":"running"}"#).await;
        let mut options = scoped_options(&server.address);
        options.nomad.token = Some("nomad-secret".into());
        let nomad = NomadClient::new(&options).unwrap();

        let info = nomad.job_info("ws-1").await.unwrap();
        assert_eq!(info.status, "running");

        let request = server.request().await;
        assert!(request.starts_with("GET /v1/job/ws-1?"));
        assert!(request.contains("namespace=dev+team"));
        assert!(request.contains("region=eu"));
        assert!(request.to_lowercase().contains("x-nomad-token: nomad-secret"));
    }

    #[tokio::test]
    async fn test_missing_job_is_not_found() {
        let server = respond_once(404, "job not found").await;
        let err = client(&server.address).job_info("ws-1").await.unwrap_err();
        assert!(matches!(err, WorkspaceError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_deregister_missing_job_is_not_found() {
        let server = respond_once(404, "job not found").await;
        let err = client(&server.address)
            .deregister_job("ws-1", true)
            .await
            .unwrap_err();
        assert!(err.is_not_found());
        let request = server.request().await;
        assert!(request.starts_with("DELETE /v1/job/ws-1?"));
        assert!(request.contains("purge=true"));
    }

    #[tokio::test]
    async fn test_missing_volume_is_not_found() {
        let server = respond_once(404, "volume not found").await;
        let err = client(&server.address)
            .volume("devpod-ws-1")
            .await
            .unwrap_err();
        assert!(matches!(err, WorkspaceError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_server_error_is_transport() {
        let server = respond_once(500, "rpc error: no leader").await;
        let err = client(&server.address).job_info("ws-1").await.unwrap_err();
        match err {
            WorkspaceError::Transport(message) => {
                assert!(message.contains("500"));
                assert!(message.contains("no leader"));
            }
            other => panic!("expected transport error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_server_error_on_volume_is_transport() {
        let server = respond_once(500, "plugin unavailable").await;
        let err = client(&server.address)
            .volume("devpod-ws-1")
            .await
            .unwrap_err();
        assert!(matches!(err, WorkspaceError::Transport(_)));
    }

    #[tokio::test]
    async fn test_delete_volume_sends_csi_secrets() {
        let server = respond_once(200, "{}").await;
        let mut secrets = IndexMap::new();
        secrets.insert("userID".to_string(), "nomad".to_string());
        secrets.insert("userKey".to_string(), "AQBk==".to_string());

        client(&server.address)
            .delete_volume("0001-abc", &secrets)
            .await
            .unwrap();

        let request = server.request().await.to_lowercase();
        assert!(request.starts_with("delete /v1/volume/csi/0001-abc/delete"));
        assert!(request.contains("x-nomad-csi-secrets: userid=nomad,userkey=aqbk=="));
    }

    #[tokio::test]
    async fn test_delete_volume_without_secrets_omits_header() {
        let server = respond_once(200, "{}").await;
        client(&server.address)
            .delete_volume("0001-abc", &IndexMap::new())
            .await
            .unwrap();
        let request = server.request().await.to_lowercase();
        assert!(!request.contains("x-nomad-csi-secrets"));
    }

    #[test]
    fn test_rejects_non_http_address() {
        let options = ProviderOptions {
            nomad: NomadConnection {
                address: "unix:///var/run/nomad.sock".into(),
                ..Default::default()
            },
            ..Default::default()
        };
        let err = NomadClient::new(&options).unwrap_err();
        assert!(matches!(err, WorkspaceError::Config(_)));
    }
}
