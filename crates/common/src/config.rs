// Run configuration for one supervised tailscaled instance

use std::fmt;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::paths::PathResolver;

/// Default SOCKS5 listener of the daemon
pub const DEFAULT_SOCKS5_LISTEN: &str = "127.0.0.1:1055";
/// Default outbound HTTP proxy listener of the daemon
pub const DEFAULT_HTTP_PROXY_LISTEN: &str = "127.0.0.1:1057";
/// Default embedded SSH listener used by generated profiles
pub const DEFAULT_SSH_LISTEN: &str = "127.0.0.1:1056";

/// Callback fired once when the daemon of a run exits
#[derive(Clone)]
pub struct CloseHook(Arc<dyn Fn() + Send + Sync>);

impl CloseHook {
    pub fn new(f: impl Fn() + Send + Sync + 'static) -> Self {
        Self(Arc::new(f))
    }

    pub fn notify(&self) {
        (self.0)()
    }
}

impl fmt::Debug for CloseHook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("CloseHook")
    }
}

/// Everything a single start needs. Never mutated once handed to the supervisor.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunConfiguration {
    /// Embedded SSH listener; empty disables the SSH server
    #[serde(default)]
    pub ssh_listen: String,

    /// Daemon executable supplied by the host
    pub executable_path: String,

    /// Control socket of the daemon; its directory is the data directory
    pub socket_path: String,

    /// Persistent state directory of the daemon
    pub state_path: String,

    #[serde(default)]
    pub socks5_listen: String,

    #[serde(default)]
    pub http_proxy_listen: String,

    /// Pre-authorized key used by `up`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_key: Option<String>,

    #[serde(default)]
    pub up: UpOptions,

    /// Raw flags appended to `up`, split on whitespace
    #[serde(default)]
    pub extra_up_args: String,

    #[serde(skip)]
    pub on_close: Option<CloseHook>,
}

/// Typed `up` flags offered as host settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UpOptions {
    #[serde(default)]
    pub hostname: String,
    #[serde(default)]
    pub login_server: String,
    #[serde(default)]
    pub accept_routes: bool,
    #[serde(default = "default_accept_dns")]
    pub accept_dns: bool,
    #[serde(default)]
    pub exit_node: String,
    #[serde(default)]
    pub exit_node_allow_lan: bool,
    #[serde(default)]
    pub advertise_exit_node: bool,
}

fn default_accept_dns() -> bool {
    true
}

impl Default for UpOptions {
    fn default() -> Self {
        Self {
            hostname: String::new(),
            login_server: String::new(),
            accept_routes: false,
            accept_dns: default_accept_dns(),
            exit_node: String::new(),
            exit_node_allow_lan: false,
            advertise_exit_node: false,
        }
    }
}

impl UpOptions {
    /// Render as command line flags
    pub fn to_flags(&self) -> Vec<String> {
        let mut flags = Vec::new();

        if !self.hostname.is_empty() {
            flags.push(format!("--hostname={}", self.hostname));
        }
        if !self.login_server.is_empty() {
            flags.push(format!("--login-server={}", self.login_server));
        }
        if self.accept_routes {
            flags.push("--accept-routes".to_string());
        }
        if !self.accept_dns {
            flags.push("--accept-dns=false".to_string());
        }
        if !self.exit_node.is_empty() {
            flags.push(format!("--exit-node={}", self.exit_node));
            if self.exit_node_allow_lan {
                flags.push("--exit-node-allow-lan-access".to_string());
            }
        }
        if self.advertise_exit_node {
            flags.push("--advertise-exit-node".to_string());
        }

        flags
    }
}

impl RunConfiguration {
    pub fn new(
        executable_path: impl Into<String>,
        socket_path: impl Into<String>,
        state_path: impl Into<String>,
    ) -> Self {
        Self {
            executable_path: executable_path.into(),
            socket_path: socket_path.into(),
            state_path: state_path.into(),
            ..Default::default()
        }
    }

    /// Copy with empty proxy listeners replaced by their defaults
    pub fn with_defaults(mut self) -> Self {
        if self.socks5_listen.trim().is_empty() {
            self.socks5_listen = DEFAULT_SOCKS5_LISTEN.to_string();
        }
        if self.http_proxy_listen.trim().is_empty() {
            self.http_proxy_listen = DEFAULT_HTTP_PROXY_LISTEN.to_string();
        }
        self
    }

    pub fn with_close_hook(mut self, hook: CloseHook) -> Self {
        self.on_close = Some(hook);
        self
    }

    pub fn ssh_enabled(&self) -> bool {
        !self.ssh_listen.trim().is_empty()
    }

    pub fn auth_key(&self) -> Option<&str> {
        self.auth_key.as_deref().filter(|k| !k.is_empty())
    }

    /// Typed flags followed by the tokenized raw flags
    pub fn up_flags(&self) -> Vec<String> {
        let mut flags = self.up.to_flags();
        flags.extend(self.extra_up_args.split_whitespace().map(str::to_string));
        flags
    }

    pub fn paths(&self) -> PathResolver {
        PathResolver::new(&self.executable_path, &self.socket_path, &self.state_path)
    }

    /// Check that the three required paths are present
    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("executable_path", &self.executable_path),
            ("socket_path", &self.socket_path),
            ("state_path", &self.state_path),
        ] {
            if value.trim().is_empty() {
                return Err(Error::Config(format!("{} must not be empty", name)));
            }
        }
        Ok(())
    }

    /// Load a run profile from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: Self = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    #[test]
    fn test_proxy_defaults_applied_when_empty() {
        let config = RunConfiguration::new("/lib/ts.so", "/data/ts.sock", "/data/state").with_defaults();
        assert_eq!(config.socks5_listen, DEFAULT_SOCKS5_LISTEN);
        assert_eq!(config.http_proxy_listen, DEFAULT_HTTP_PROXY_LISTEN);
    }

    #[test]
    fn test_proxy_defaults_keep_explicit_values() {
        let mut config = RunConfiguration::new("/lib/ts.so", "/data/ts.sock", "/data/state");
        config.socks5_listen = "0.0.0.0:9050".to_string();
        let config = config.with_defaults();
        assert_eq!(config.socks5_listen, "0.0.0.0:9050");
        assert_eq!(config.http_proxy_listen, DEFAULT_HTTP_PROXY_LISTEN);
    }

    #[test]
    fn test_up_options_flag_order() {
        let up = UpOptions {
            hostname: "phone".to_string(),
            login_server: "https://hs.example.com".to_string(),
            accept_routes: true,
            accept_dns: false,
            exit_node: "100.64.0.7".to_string(),
            exit_node_allow_lan: true,
            advertise_exit_node: true,
        };

        assert_eq!(
            up.to_flags(),
            vec![
                "--hostname=phone",
                "--login-server=https://hs.example.com",
                "--accept-routes",
                "--accept-dns=false",
                "--exit-node=100.64.0.7",
                "--exit-node-allow-lan-access",
                "--advertise-exit-node",
            ]
        );
    }

    #[test]
    fn test_lan_access_requires_exit_node() {
        let up = UpOptions {
            exit_node_allow_lan: true,
            ..Default::default()
        };
        assert!(up.to_flags().is_empty());
    }

    #[test]
    fn test_up_flags_append_extra_args_last() {
        let mut config = RunConfiguration::new("/lib/ts.so", "/data/ts.sock", "/data/state");
        config.up.accept_routes = true;
        config.extra_up_args = "  --shields-up \t --ssh ".to_string();

        assert_eq!(
            config.up_flags(),
            vec!["--accept-routes", "--shields-up", "--ssh"]
        );
    }

    #[test]
    fn test_empty_auth_key_is_none() {
        let mut config = RunConfiguration::default();
        config.auth_key = Some(String::new());
        assert_eq!(config.auth_key(), None);
        config.auth_key = Some("tskey-abc".to_string());
        assert_eq!(config.auth_key(), Some("tskey-abc"));
    }

    #[test]
    fn test_validate_requires_paths() {
        assert!(RunConfiguration::default().validate().is_err());
        assert!(RunConfiguration::new("/a", "/b", "/c").validate().is_ok());
    }

    #[test]
    fn test_close_hook_notifies() {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = count.clone();
        let config = RunConfiguration::default().with_close_hook(CloseHook::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        if let Some(hook) = &config.on_close {
            hook.notify();
        }
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_load_profile_from_toml() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("profile.toml");
        fs::write(
            &path,
            r#"
ssh_listen = "127.0.0.1:2222"
executable_path = "/opt/ts/libtailscaled.so"
socket_path = "/var/lib/ts/tailscaled.sock"
state_path = "/var/lib/ts/state"
auth_key = "tskey-123"
extra_up_args = "--ssh"

[up]
hostname = "edge"
"#,
        )
        .unwrap();

        let config = RunConfiguration::load(&path).unwrap();
        assert!(config.ssh_enabled());
        assert_eq!(config.auth_key(), Some("tskey-123"));
        assert!(config.up.accept_dns);
        assert_eq!(config.up_flags(), vec!["--hostname=edge", "--ssh"]);
        assert_eq!(
            config.paths().data_dir(),
            Path::new("/var/lib/ts")
        );
    }
}
