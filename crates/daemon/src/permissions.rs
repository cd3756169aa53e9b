// File mode hardening for the control socket, its directory and config files

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use anyhow::{Context, Result};
use tracing::debug;

/// umask 077 so anything the daemon creates starts out owner-only.
/// Call before the first file is created.
pub fn set_restrictive_umask() {
    // SAFETY: umask(2) cannot fail and only touches process state
    unsafe {
        libc::umask(0o077);
    }
    debug!("umask set to 0077");
}

fn set_mode(path: &Path, mode: u32) -> Result<()> {
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
        .with_context(|| format!("Failed to set mode {:o} on {}", mode, path.display()))?;
    debug!("Mode {:o} on {}", mode, path.display());
    Ok(())
}

/// 0600, for files holding configuration or credentials
pub fn make_private(path: &Path) -> Result<()> {
    set_mode(path, 0o600)
}

/// 0700, or 0770 when the group may reach the control socket
pub fn directory_mode(group_access: bool) -> u32 {
    if group_access {
        0o770
    } else {
        0o700
    }
}

/// 0600, or 0660 when the group may use the control socket
pub fn socket_mode(group_access: bool) -> u32 {
    if group_access {
        0o660
    } else {
        0o600
    }
}

pub fn secure_socket(path: &Path, group_access: bool) -> Result<()> {
    set_mode(path, socket_mode(group_access))
}

/// Create `path` (and parents) if missing, then apply the directory mode
pub fn ensure_runtime_dir(path: &Path, group_access: bool) -> Result<()> {
    fs::create_dir_all(path)
        .with_context(|| format!("Failed to create directory {}", path.display()))?;
    set_mode(path, directory_mode(group_access))
}
