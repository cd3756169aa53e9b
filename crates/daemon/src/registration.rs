// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 tailproxy Contributors

// Background `up` loop that registers the node once the daemon socket exists

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use tailproxy_common::{PathResolver, RegistrationOutcome, RunConfiguration};

use crate::control::ControlTool;

/// Output fragments that mean the auth key will never work
pub const FATAL_AUTH_MARKERS: &[&str] = &["invalid key", "API key does not exist"];

/// Attempt budget and pacing of the loop
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, socket misses included
    pub max_attempts: u32,
    /// Wait after the socket was not found
    pub poll_interval: Duration,
    /// Wait after a failed `up`
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 30,
            poll_interval: Duration::from_secs(1),
            backoff: Duration::from_secs(5),
        }
    }
}

/// Checks whether the control socket has appeared
#[async_trait]
pub trait SocketCheck: Send + Sync {
    async fn exists(&self, path: &Path) -> bool;
}

#[derive(Debug, Default, Clone)]
pub struct FsSocketCheck;

#[async_trait]
impl SocketCheck for FsSocketCheck {
    async fn exists(&self, path: &Path) -> bool {
        tokio::fs::try_exists(path).await.unwrap_or(false)
    }
}

/// `up --reset --timeout 15s [--auth-key K] [flags...]`
pub fn up_args(config: &RunConfiguration) -> Vec<String> {
    let mut args: Vec<String> = ["up", "--reset", "--timeout", "15s"]
        .iter()
        .map(|s| s.to_string())
        .collect();

    if let Some(key) = config.auth_key() {
        args.push("--auth-key".to_string());
        args.push(key.to_string());
    }

    args.extend(config.up_flags());
    args
}

pub fn is_fatal_auth_error(output: &str) -> bool {
    FATAL_AUTH_MARKERS.iter().any(|m| output.contains(m))
}

/// Everything one registration loop needs
pub struct Registration<'a> {
    pub tool: &'a dyn ControlTool,
    pub socket_check: &'a dyn SocketCheck,
    pub paths: &'a PathResolver,
    pub args: Vec<String>,
    pub policy: RetryPolicy,
    pub cancel: CancellationToken,
}

impl Registration<'_> {
    /// Run until success, a fatal auth error, exhaustion or cancellation
    pub async fn run(self) -> RegistrationOutcome {
        let mut count: u32 = 0;

        while count < self.policy.max_attempts {
            if self.cancel.is_cancelled() {
                return RegistrationOutcome::Cancelled;
            }

            if !self.socket_check.exists(self.paths.socket()).await {
                count += 1;
                if !self.pause(self.policy.poll_interval).await {
                    return RegistrationOutcome::Cancelled;
                }
                continue;
            }

            info!(attempt = count + 1, "Running tailscale up");

            let result = tokio::select! {
                _ = self.cancel.cancelled() => return RegistrationOutcome::Cancelled,
                result = self.tool.invoke(self.paths, &self.args) => result,
            };

            match result {
                Ok(output) if output.is_success() => {
                    info!(output = output.output.trim(), "tailscale up succeeded");
                    return RegistrationOutcome::Registered { attempts: count + 1 };
                }
                Ok(output) => {
                    let reason = output.failure.clone().unwrap_or_default();
                    warn!(output = output.output.trim(), err = %reason, "tailscale up failed");
                    if is_fatal_auth_error(&output.output) {
                        error!("Auth key rejected, check the configured key");
                        return RegistrationOutcome::InvalidCredential { attempts: count + 1 };
                    }
                }
                Err(e) => {
                    warn!(err = %format!("{:#}", e), "tailscale up could not be run");
                }
            }

            count += 1;
            if !self.pause(self.policy.backoff).await {
                return RegistrationOutcome::Cancelled;
            }
        }

        error!(
            attempts = self.policy.max_attempts,
            "Giving up on tailscale up"
        );
        RegistrationOutcome::Exhausted {
            attempts: self.policy.max_attempts,
        }
    }

    // false when cancelled while waiting
    async fn pause(&self, duration: Duration) -> bool {
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            _ = tokio::time::sleep(duration) => true,
        }
    }
}
