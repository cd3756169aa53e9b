// Common types for tailproxy

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Verbosity of the forwarded daemon output
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Default)]
#[serde(try_from = "i64", into = "i64")]
pub enum LogLevel {
    /// Everything the daemon prints
    Debug = 0,
    /// Daemon chatter filtered out
    #[default]
    Info = 1,
    /// Only daemon lines that report a failure
    Error = 2,
}

impl TryFrom<i64> for LogLevel {
    type Error = Error;

    fn try_from(value: i64) -> Result<Self, Error> {
        match value {
            0 => Ok(LogLevel::Debug),
            1 => Ok(LogLevel::Info),
            2 => Ok(LogLevel::Error),
            other => Err(Error::InvalidLogLevel(other)),
        }
    }
}

impl From<LogLevel> for i64 {
    fn from(level: LogLevel) -> Self {
        level as i64
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Error => "error",
        };
        write!(f, "{} ({})", name, *self as i64)
    }
}

/// Result of the background `up` loop for one run
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum RegistrationOutcome {
    /// Loop still running, or no run started yet
    #[default]
    Pending,
    /// `up` succeeded
    Registered { attempts: u32 },
    /// Auth key rejected, loop gave up for good
    InvalidCredential { attempts: u32 },
    /// Attempt budget used up without success
    Exhausted { attempts: u32 },
    /// Run stopped before the loop finished
    Cancelled,
}

impl RegistrationOutcome {
    pub fn is_finished(&self) -> bool {
        !matches!(self, RegistrationOutcome::Pending)
    }
}

/// Daemon status as reported by the control API
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonStatus {
    pub running: bool,
    pub ssh_listening: bool,
    pub log_level: LogLevel,
    pub registration: RegistrationOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<String>,
}

/// Body of `POST /api/command`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandRequest {
    pub command: String,
}

/// Response of `POST /api/command`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandResponse {
    pub output: String,
}

/// Body of `PUT /api/log-level`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogLevelRequest {
    pub level: LogLevel,
}

/// Subset of `tailscale status --json`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TailnetStatus {
    #[serde(rename = "Self")]
    pub self_node: PeerStatus,
    #[serde(rename = "Peer", default)]
    pub peers: Option<HashMap<String, PeerStatus>>,
    #[serde(rename = "MagicDNSSuffix", default)]
    pub magic_dns_suffix: Option<String>,
}

impl TailnetStatus {
    /// Peers sorted by host name
    pub fn sorted_peers(&self) -> Vec<&PeerStatus> {
        let mut peers: Vec<&PeerStatus> = self
            .peers
            .as_ref()
            .map(|p| p.values().collect())
            .unwrap_or_default();
        peers.sort_by(|a, b| a.host_name.cmp(&b.host_name));
        peers
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerStatus {
    #[serde(rename = "HostName")]
    pub host_name: String,
    #[serde(rename = "DNSName", default)]
    pub dns_name: Option<String>,
    #[serde(rename = "OS", default)]
    pub os: Option<String>,
    #[serde(rename = "TailscaleIPs", default)]
    pub tailscale_ips: Option<Vec<String>>,
    #[serde(rename = "Online", default)]
    pub online: Option<bool>,
    #[serde(rename = "Active", default)]
    pub active: Option<bool>,
    #[serde(rename = "Relay", default)]
    pub relay: Option<String>,
    #[serde(rename = "Direct", default)]
    pub direct: Option<bool>,
}

impl PeerStatus {
    pub fn primary_ip(&self) -> &str {
        self.tailscale_ips
            .as_ref()
            .and_then(|ips| ips.first())
            .map(String::as_str)
            .unwrap_or("Unknown IP")
    }

    pub fn is_online(&self) -> bool {
        self.online == Some(true) || self.active == Some(true)
    }
}
