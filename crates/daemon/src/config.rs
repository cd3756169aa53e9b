// tailproxyd configuration: control socket, permissions and the autostart profile

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use tailproxy_common::{
    default_socket_path, is_loopback_listen, LogLevel, RunConfiguration, DEFAULT_SSH_LISTEN,
};

use crate::permissions;

pub const CONFIG_DIR_NAME: &str = "tailproxy";
pub const CONFIG_FILE_NAME: &str = "daemon.toml";

/// Daemon configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DaemonConfig {
    /// Control API socket; unset means `$XDG_RUNTIME_DIR/tailproxy/tailproxyd.sock`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_socket: Option<PathBuf>,

    /// Enable group access to the control socket and its directory
    /// (0770/0660 instead of 0700/0600)
    #[serde(default)]
    pub group_access: bool,

    /// Start the `[run]` profile as soon as the daemon is up
    #[serde(default)]
    pub autostart: bool,

    /// Initial verbosity of forwarded tailscaled output
    #[serde(default)]
    pub log_level: LogLevel,

    /// Allow the embedded SSH server to listen on a non-loopback address.
    /// It accepts every client without authentication.
    #[serde(default)]
    pub allow_remote_ssh: bool,

    /// Profile used by autostart and by `POST /api/start` without a body
    #[serde(default = "default_run")]
    pub run: RunConfiguration,
}

fn default_run() -> RunConfiguration {
    RunConfiguration {
        ssh_listen: DEFAULT_SSH_LISTEN.to_string(),
        ..Default::default()
    }
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            api_socket: None,
            group_access: false,
            autostart: false,
            log_level: LogLevel::default(),
            allow_remote_ssh: false,
            run: default_run(),
        }
    }
}

impl DaemonConfig {
    /// Validate the daemon configuration
    pub fn validate(&self) -> Result<()> {
        if self.autostart {
            self.run
                .validate()
                .context("autostart requires a complete [run] profile")?;
        }
        self.check_run(&self.run)
    }

    /// Reject run profiles this daemon refuses to start
    pub fn check_run(&self, run: &RunConfiguration) -> Result<()> {
        if run.ssh_enabled() && !self.allow_remote_ssh && !is_loopback_listen(&run.ssh_listen) {
            anyhow::bail!(
                "Security violation: SSH listen address {} is not loopback.\n\
                 The embedded SSH server does not authenticate clients.\n\
                 \n\
                 To fix this:\n\
                 1. Use a loopback address such as {}, OR\n\
                 2. Set allow_remote_ssh = true in daemon.toml",
                run.ssh_listen,
                DEFAULT_SSH_LISTEN
            );
        }
        Ok(())
    }

    pub fn socket_path(&self) -> Result<PathBuf> {
        match &self.api_socket {
            Some(path) if !path.as_os_str().is_empty() => Ok(path.clone()),
            _ => default_socket_path(),
        }
    }

    /// Load from the default location, writing defaults on first start
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    pub fn load_from(config_path: &Path) -> Result<Self> {
        if !config_path.exists() {
            info!("No daemon configuration found, using defaults");
            info!("Configuration will be saved to: {}", config_path.display());
            let config = Self::default();
            config.save_to(config_path)?;
            return Ok(config);
        }

        let contents = fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read {}", config_path.display()))?;

        let config: Self = toml::from_str(&contents).context("Failed to parse daemon configuration")?;

        config.validate().context("Configuration validation failed")?;

        info!("Loaded daemon configuration from: {}", config_path.display());
        Ok(config)
    }

    pub fn save_to(&self, config_path: &Path) -> Result<()> {
        if let Some(parent) = config_path.parent() {
            fs::create_dir_all(parent).context("Failed to create configuration directory")?;
        }

        let contents =
            toml::to_string_pretty(self).context("Failed to serialize daemon configuration")?;

        fs::write(config_path, contents).context("Failed to write daemon configuration")?;
        permissions::make_private(config_path)?;

        info!("Saved daemon configuration to: {}", config_path.display());
        Ok(())
    }

    /// `$XDG_CONFIG_HOME/tailproxy/daemon.toml`
    pub fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
        Ok(config_dir.join(CONFIG_DIR_NAME).join(CONFIG_FILE_NAME))
    }
}
