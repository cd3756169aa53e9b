// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 tailproxy Contributors

// Invocation of the tailscale control tool against the daemon's socket

use std::os::unix::process::ExitStatusExt;
use std::process::{ExitStatus, Stdio};

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use tailproxy_common::PathResolver;

/// Returned by `run_command` when no daemon is running
pub const NOT_RUNNING_MESSAGE: &str = "Error: Tailscaled service is not running.";

/// Captured result of one control tool invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    /// stdout followed by stderr, lossily decoded
    pub output: String,
    /// `None` on success, otherwise why the tool failed
    pub failure: Option<String>,
}

impl CommandOutput {
    pub fn success(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            failure: None,
        }
    }

    pub fn failed(output: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            failure: Some(reason.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.failure.is_none()
    }

    /// Output with `\nError: <reason>` appended on failure
    pub fn render(&self) -> String {
        match &self.failure {
            None => self.output.clone(),
            Some(reason) => format!("{}\nError: {}", self.output, reason),
        }
    }
}

/// Something that can run control tool subcommands for a run
#[async_trait]
pub trait ControlTool: Send + Sync {
    /// Run `<tool> --socket <socket> <args...>`
    async fn invoke(&self, paths: &PathResolver, args: &[String]) -> Result<CommandOutput>;
}

/// The `tailscale` symlink in the data directory
#[derive(Debug, Default, Clone)]
pub struct TailscaleCli;

#[async_trait]
impl ControlTool for TailscaleCli {
    async fn invoke(&self, paths: &PathResolver, args: &[String]) -> Result<CommandOutput> {
        let binary = paths.cli_binary();
        debug!("Running {} {:?}", binary.display(), args);

        let output = Command::new(&binary)
            .arg("--socket")
            .arg(paths.socket())
            .args(args)
            .current_dir(paths.data_dir())
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .with_context(|| format!("Failed to run {}", binary.display()))?;

        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));

        if output.status.success() {
            Ok(CommandOutput::success(combined))
        } else {
            Ok(CommandOutput::failed(combined, describe_exit(output.status)))
        }
    }
}

/// `exit status N` or `signal: N`
pub fn describe_exit(status: ExitStatus) -> String {
    match (status.code(), status.signal()) {
        (Some(code), _) => format!("exit status {}", code),
        (None, Some(signal)) => format!("signal: {}", signal),
        (None, None) => "unknown exit status".to_string(),
    }
}

/// Split free-form command text on whitespace
pub fn tokenize(text: &str) -> Vec<String> {
    text.split_whitespace().map(str::to_string).collect()
}

/// Run user supplied command text and render the result for display
pub async fn run_user_command(tool: &dyn ControlTool, paths: &PathResolver, text: &str) -> String {
    let args = tokenize(text);
    if args.is_empty() {
        return String::new();
    }

    match tool.invoke(paths, &args).await {
        Ok(output) => output.render(),
        Err(e) => format!("\nError: {:#}", e),
    }
}
