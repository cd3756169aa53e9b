// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 tailproxy Contributors

// Daemon client shared by the CLI and any other host

use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::{Client, Response, StatusCode};
use serde::{Deserialize, Serialize};

use crate::config::RunConfiguration;
use crate::types::{
    CommandRequest, CommandResponse, DaemonStatus, LogLevel, LogLevelRequest, TailnetStatus,
};

/// Directory name under the runtime dir
pub const RUNTIME_DIR_NAME: &str = "tailproxy";
/// Socket file name of the control API
pub const SOCKET_FILE_NAME: &str = "tailproxyd.sock";

// reqwest needs a URL even when talking over a unix socket
const UNIX_BASE_URL: &str = "http://daemon";

/// Default location of the control API socket
pub fn default_socket_path() -> Result<PathBuf> {
    let runtime_dir = dirs::runtime_dir()
        .or_else(dirs::cache_dir)
        .ok_or_else(|| anyhow::anyhow!("Could not determine runtime directory"))?;

    if runtime_dir.file_name() == Some(OsStr::new(RUNTIME_DIR_NAME)) {
        Ok(runtime_dir.join(SOCKET_FILE_NAME))
    } else {
        Ok(runtime_dir.join(RUNTIME_DIR_NAME).join(SOCKET_FILE_NAME))
    }
}

/// Client configuration for connecting to the daemon
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct DaemonClientConfig {
    /// Socket path override
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub daemon_socket: Option<PathBuf>,
}

impl DaemonClientConfig {
    pub fn socket_path(&self) -> Result<PathBuf> {
        match &self.daemon_socket {
            Some(path) if !path.as_os_str().is_empty() => Ok(path.clone()),
            _ => default_socket_path(),
        }
    }
}

/// Typed wrapper over the control API
#[derive(Debug, Clone)]
pub struct DaemonClient {
    client: Client,
    socket: PathBuf,
}

impl DaemonClient {
    pub fn new(config: &DaemonClientConfig) -> Result<Self> {
        Self::with_socket(config.socket_path()?)
    }

    pub fn with_socket(socket: impl Into<PathBuf>) -> Result<Self> {
        let socket = socket.into();
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .unix_socket(socket.clone())
            .build()
            .context("Failed to build daemon client")?;

        Ok(Self { client, socket })
    }

    pub fn socket(&self) -> &Path {
        &self.socket
    }

    fn url(path: &str) -> String {
        format!("{}{}", UNIX_BASE_URL, path)
    }

    pub async fn health(&self) -> Result<bool> {
        let resp = self
            .client
            .get(Self::url("/api/health"))
            .send()
            .await
            .with_context(|| format!("Failed to reach daemon at {}", self.socket.display()))?;
        Ok(resp.status().is_success())
    }

    pub async fn status(&self) -> Result<DaemonStatus> {
        let resp = self.send(self.client.get(Self::url("/api/status"))).await?;
        let resp = check(resp, "query status").await?;
        resp.json().await.context("Failed to parse status response")
    }

    /// Start a run; `None` uses the profile from the daemon configuration
    pub async fn start(&self, config: Option<&RunConfiguration>) -> Result<()> {
        let mut request = self.client.post(Self::url("/api/start"));
        if let Some(config) = config {
            request = request.json(config);
        }
        let resp = self.send(request).await?;
        check(resp, "start tailscaled").await?;
        Ok(())
    }

    pub async fn stop(&self) -> Result<()> {
        let resp = self.send(self.client.post(Self::url("/api/stop"))).await?;
        check(resp, "stop tailscaled").await?;
        Ok(())
    }

    pub async fn run_command(&self, command: &str) -> Result<String> {
        let body = CommandRequest {
            command: command.to_string(),
        };
        let resp = self
            .send(self.client.post(Self::url("/api/command")).json(&body))
            .await?;
        let resp = check(resp, "run command").await?;
        let output: CommandResponse = resp.json().await.context("Failed to parse command output")?;
        Ok(output.output)
    }

    pub async fn logs(&self) -> Result<String> {
        let resp = self.send(self.client.get(Self::url("/api/logs"))).await?;
        let resp = check(resp, "fetch logs").await?;
        resp.text().await.context("Failed to read logs")
    }

    pub async fn clear_logs(&self) -> Result<()> {
        let resp = self.send(self.client.delete(Self::url("/api/logs"))).await?;
        check(resp, "clear logs").await?;
        Ok(())
    }

    pub async fn set_log_level(&self, level: LogLevel) -> Result<()> {
        let body = LogLevelRequest { level };
        let resp = self
            .send(self.client.put(Self::url("/api/log-level")).json(&body))
            .await?;
        check(resp, "set log level").await?;
        Ok(())
    }

    /// Tailnet peers; `None` when tailscaled is not running
    pub async fn peers(&self) -> Result<Option<TailnetStatus>> {
        let resp = self.send(self.client.get(Self::url("/api/peers"))).await?;
        if resp.status() == StatusCode::CONFLICT {
            return Ok(None);
        }
        let resp = check(resp, "list peers").await?;
        let status = resp.json().await.context("Failed to parse peer status")?;
        Ok(Some(status))
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<Response> {
        request
            .send()
            .await
            .with_context(|| format!("Failed to reach daemon at {}", self.socket.display()))
    }
}

async fn check(resp: Response, action: &str) -> Result<Response> {
    if resp.status().is_success() {
        Ok(resp)
    } else {
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        anyhow::bail!("Failed to {}: {} - {}", action, status, body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_explicit_socket_wins() {
        let config = DaemonClientConfig {
            daemon_socket: Some(PathBuf::from("/tmp/custom.sock")),
        };
        assert_eq!(config.socket_path().unwrap(), PathBuf::from("/tmp/custom.sock"));
    }

    #[test]
    fn test_empty_socket_falls_back_to_default() {
        let config = DaemonClientConfig {
            daemon_socket: Some(PathBuf::new()),
        };
        if let Ok(path) = config.socket_path() {
            assert!(path.ends_with("tailproxy/tailproxyd.sock"));
        }
    }

    #[test]
    fn test_url_building() {
        assert_eq!(DaemonClient::url("/api/status"), "http://daemon/api/status");
    }

    #[test]
    fn test_client_keeps_socket() {
        let client = DaemonClient::with_socket("/tmp/x.sock").unwrap();
        assert_eq!(client.socket(), Path::new("/tmp/x.sock"));
    }
}
