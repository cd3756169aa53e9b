// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 tailproxy Contributors

// tailproxy daemon library
// Supervises tailscaled, its registration loop and the embedded SSH server

pub mod api;
pub mod config;
pub mod control;
pub mod filter;
pub mod host_key;
pub mod logbuf;
pub mod permissions;
pub mod pidfile;
pub mod process;
pub mod registration;
pub mod ssh;
pub mod supervisor;

pub use config::DaemonConfig;
pub use logbuf::{LogBuffer, LogBufferLayer};
pub use supervisor::{Supervisor, SupervisorOptions};
