//! The update server client: an out-of-scope external collaborator (§1) that
//! the daemon loop and standalone driver both need a handle to. Exposed as a
//! trait so `FakeServer` can drive the literal multi-server scenario in §8
//! (S6) without a real HTTP stack.

use std::sync::Arc;
use std::sync::RwLock;
use std::time::Duration;

use anyhow::{Context, Result};
use mender_types::artifact::UpdateInfo;
use mender_types::token::AuthToken;
use serde::{Deserialize, Serialize};

/// One server's answer to an update check.
#[derive(Debug, Clone)]
pub enum CheckResult {
    /// A new deployment is available.
    Update(UpdateInfo),
    /// No update; poll again later.
    NoUpdate,
    /// The artifact already matches what's installed.
    AlreadyInstalled,
}

/// The subset of the server API this core drives directly (update check and
/// final status report); artifact payload download is the installer's
/// concern once `UpdateFetch` has a `source_uri`.
#[async_trait::async_trait]
pub trait UpdateServerClient: Send + Sync {
    async fn check_update(&self, server: &str, device_type: &str, provides: &[(String, String)]) -> Result<CheckResult>;
    async fn report_status(&self, server: &str, deployment_id: &str, status: &str) -> Result<()>;
}

/// A scripted multi-server double for tests: each server has a queue of
/// responses consumed in call order, recording which servers were actually
/// contacted (§8 S6: "no other side effects on the first server").
pub struct FakeServer {
    responses: std::sync::Mutex<std::collections::HashMap<String, Vec<FakeResponse>>>,
    pub contacted: std::sync::Mutex<Vec<String>>,
}

pub enum FakeResponse {
    Check(Result<CheckResult, String>),
}

impl FakeServer {
    pub fn new() -> Self {
        Self { responses: std::sync::Mutex::new(std::collections::HashMap::new()), contacted: std::sync::Mutex::new(Vec::new()) }
    }

    pub fn queue_check(&self, server: &str, response: Result<CheckResult, String>) {
        self.responses.lock().unwrap().entry(server.to_string()).or_default().push(FakeResponse::Check(response));
    }
}

impl Default for FakeServer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl UpdateServerClient for FakeServer {
    async fn check_update(&self, server: &str, _device_type: &str, _provides: &[(String, String)]) -> Result<CheckResult> {
        self.contacted.lock().unwrap().push(server.to_string());
        let mut responses = self.responses.lock().unwrap();
        let queue = responses.entry(server.to_string()).or_default();
        if queue.is_empty() {
            anyhow::bail!("no fake response configured for {server}");
        }
        match queue.remove(0) {
            FakeResponse::Check(Ok(result)) => Ok(result),
            FakeResponse::Check(Err(e)) => Err(anyhow::anyhow!(e)),
        }
    }

    async fn report_status(&self, _server: &str, _deployment_id: &str, _status: &str) -> Result<()> {
        Ok(())
    }
}

/// The production update-server client (§1: HTTP transport/TLS and the
/// server API schema are out-of-scope external collaborators; only the two
/// operations this core drives directly are implemented). Grounded on
/// `mender_auth::ReqwestTransport`'s build/header/status-code shape.
///
/// The bearer token is read from a shared cell rather than owned directly —
/// the authorization manager's [`mender_auth::AuthManagerHandle`] is a
/// single, non-`Clone` owned value already held by the daemon loop, so the
/// CLI wiring subscribes to its token-change events and keeps this cell
/// updated instead of handing the client its own copy of the handle.
pub struct ReqwestServerClient {
    client: reqwest::Client,
    token: Arc<RwLock<AuthToken>>,
}

#[derive(Debug, Serialize)]
struct CheckUpdateRequest<'a> {
    device_type: &'a str,
    artifact_name: Option<&'a str>,
    #[serde(flatten)]
    provides: std::collections::BTreeMap<&'a str, &'a str>,
}

#[derive(Debug, Deserialize)]
struct CheckUpdateResponse {
    id: String,
    artifact: ResponseArtifact,
}

#[derive(Debug, Deserialize)]
struct ResponseArtifact {
    artifact_name: String,
    #[serde(default)]
    compatible_devices: Vec<String>,
    #[serde(default)]
    payload_types: Vec<String>,
    source: ResponseSource,
}

#[derive(Debug, Deserialize)]
struct ResponseSource {
    uri: String,
}

#[derive(Debug, Serialize)]
struct StatusReportRequest<'a> {
    status: &'a str,
}

impl ReqwestServerClient {
    pub fn new(token: Arc<RwLock<AuthToken>>) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(Duration::from_secs(30)).build().context("build reqwest client")?;
        Ok(Self { client, token })
    }

    fn bearer(&self) -> String {
        self.token.read().unwrap().as_bearer_header()
    }
}

#[async_trait::async_trait]
impl UpdateServerClient for ReqwestServerClient {
    async fn check_update(&self, server: &str, device_type: &str, provides: &[(String, String)]) -> Result<CheckResult> {
        let url = format!("{}/api/devices/v1/deployments/device/deployments/next", server.trim_end_matches('/'));
        let provides: std::collections::BTreeMap<&str, &str> =
            provides.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect();
        let body = CheckUpdateRequest { device_type, artifact_name: None, provides };

        let response = self
            .client
            .get(&url)
            .header("Authorization", self.bearer())
            .json(&body)
            .send()
            .await
            .with_context(|| format!("update check against {server} failed"))?;

        match response.status().as_u16() {
            200 => {
                let parsed: CheckUpdateResponse = response.json().await.context("parsing update check response")?;
                let artifact = mender_types::artifact::ArtifactInfo {
                    name: parsed.artifact.artifact_name,
                    compatible_devices: parsed.artifact.compatible_devices,
                    payload_types: parsed.artifact.payload_types,
                    ..Default::default()
                };
                let mut info = UpdateInfo::new(parsed.id, artifact);
                info.source_uri = parsed.artifact.source.uri;
                Ok(CheckResult::Update(info))
            }
            204 => Ok(CheckResult::NoUpdate),
            status => anyhow::bail!("update check against {server} returned unexpected status {status}"),
        }
    }

    async fn report_status(&self, server: &str, deployment_id: &str, status: &str) -> Result<()> {
        let url = format!(
            "{}/api/devices/v1/deployments/device/deployments/{deployment_id}/status",
            server.trim_end_matches('/')
        );
        let response = self
            .client
            .put(&url)
            .header("Authorization", self.bearer())
            .json(&StatusReportRequest { status })
            .send()
            .await
            .with_context(|| format!("status report to {server} failed"))?;

        if !response.status().is_success() {
            anyhow::bail!("status report to {server} returned {}", response.status());
        }
        Ok(())
    }
}

/// Try each server in order for an update check, stopping at the first one
/// that does not return an error (§8 S6). Mirrors `mender_auth::ServerCursor`
/// but against the update-check surface rather than authentication.
pub async fn check_update_across_servers(
    client: &dyn UpdateServerClient,
    servers: &[String],
    device_type: &str,
    provides: &[(String, String)],
) -> Result<CheckResult> {
    let mut last_error = None;
    for server in servers {
        match client.check_update(server, device_type, provides).await {
            Ok(result) => return Ok(result),
            Err(e) => last_error = Some(e),
        }
    }
    Err(last_error.unwrap_or_else(|| anyhow::anyhow!("no servers configured")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use mender_types::artifact::ArtifactInfo;

    #[tokio::test]
    async fn tries_second_server_after_first_errors() {
        let server = FakeServer::new();
        server.queue_check("https://a", Err("400 bad request".to_string()));
        server.queue_check("https://b", Ok(CheckResult::Update(UpdateInfo::new("dep-2", ArtifactInfo::default()))));

        let result = check_update_across_servers(
            &server,
            &["https://a".to_string(), "https://b".to_string()],
            "qemux86-64",
            &[],
        )
        .await
        .unwrap();

        match result {
            CheckResult::Update(info) => assert_eq!(info.deployment_id, "dep-2"),
            _ => panic!("expected an update"),
        }
        assert_eq!(*server.contacted.lock().unwrap(), vec!["https://a".to_string(), "https://b".to_string()]);
    }
}
