// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 tailproxy Contributors

// tailproxy - Common Library
// Shared types, path derivation, run configuration and the daemon client

pub mod config;
pub mod daemon_client;
pub mod error;
pub mod network;
pub mod paths;
pub mod types;

pub use config::{
    CloseHook, RunConfiguration, UpOptions, DEFAULT_HTTP_PROXY_LISTEN, DEFAULT_SOCKS5_LISTEN,
    DEFAULT_SSH_LISTEN,
};
pub use daemon_client::{default_socket_path, DaemonClient, DaemonClientConfig};
pub use error::{Error, Result};
pub use network::{is_loopback_address, is_loopback_listen};
pub use paths::PathResolver;
pub use types::{
    CommandRequest, CommandResponse, DaemonStatus, LogLevel, LogLevelRequest, PeerStatus,
    RegistrationOutcome, TailnetStatus,
};
