// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 tailproxy Contributors

// Single-instance guard for tailproxyd

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

use tailproxy_common::daemon_client::RUNTIME_DIR_NAME;

pub const PID_FILE_NAME: &str = "tailproxyd.pid";

/// `$XDG_RUNTIME_DIR/tailproxy/tailproxyd.pid`, falling back to the cache dir
pub fn default_pid_path() -> Result<PathBuf> {
    let base = dirs::runtime_dir()
        .or_else(dirs::cache_dir)
        .context("Could not determine runtime directory")?;
    Ok(base.join(RUNTIME_DIR_NAME).join(PID_FILE_NAME))
}

/// Holds the pid file for the lifetime of the daemon and removes it on drop
#[derive(Debug)]
pub struct PidFileGuard {
    path: PathBuf,
}

impl PidFileGuard {
    /// Fails when the recorded pid belongs to a live process; stale files are replaced
    pub fn create(path: &Path) -> Result<Self> {
        match fs::read_to_string(path) {
            Ok(contents) => match contents.trim().parse::<u32>() {
                Ok(pid) if is_process_running(pid) => anyhow::bail!(
                    "tailproxyd is already running with PID {} (remove {} if that is wrong)",
                    pid,
                    path.display()
                ),
                Ok(pid) => warn!(pid, "Replacing stale PID file {}", path.display()),
                Err(_) => warn!("Replacing unreadable PID file {}", path.display()),
            },
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to read PID file {}: {}", path.display(), e),
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }

        let pid = std::process::id();
        fs::write(path, pid.to_string())
            .with_context(|| format!("Failed to write PID file {}", path.display()))?;
        info!(pid, "Wrote PID file {}", path.display());

        Ok(Self {
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// kill(pid, 0): EPERM still means the process exists
pub fn is_process_running(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    // SAFETY: signal 0 performs the permission and existence check only
    if unsafe { libc::kill(pid, 0) } == 0 {
        return true;
    }
    io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

impl Drop for PidFileGuard {
    fn drop(&mut self) {
        match fs::remove_file(&self.path) {
            Ok(()) => debug!("Removed PID file {}", self.path.display()),
            Err(e) => warn!("Failed to remove PID file {}: {}", self.path.display(), e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_second_instance_is_refused() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("run").join(PID_FILE_NAME);

        let first = PidFileGuard::create(&path).unwrap();
        assert_eq!(
            fs::read_to_string(first.path()).unwrap(),
            std::process::id().to_string()
        );

        let err = PidFileGuard::create(&path).unwrap_err();
        assert!(err.to_string().contains("already running"));

        drop(first);
        assert!(!path.exists());
        let _second = PidFileGuard::create(&path).unwrap();
    }

    #[test]
    fn test_stale_and_garbage_files_are_replaced() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(PID_FILE_NAME);

        fs::write(&path, "999999999").unwrap();
        drop(PidFileGuard::create(&path).unwrap());

        fs::write(&path, "not a pid").unwrap();
        let guard = PidFileGuard::create(&path).unwrap();
        assert_eq!(
            fs::read_to_string(guard.path()).unwrap(),
            std::process::id().to_string()
        );
    }

    #[test]
    fn test_process_liveness() {
        assert!(is_process_running(std::process::id()));
        assert!(!is_process_running(999_999_999));
        assert!(!is_process_running(u32::MAX));
    }
}
