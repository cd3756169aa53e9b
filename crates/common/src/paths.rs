// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 tailproxy Contributors

// Path derivation for a tailscaled run
// Pure string/path arithmetic, never touches the filesystem

use std::path::{Path, PathBuf};

/// File name of the daemon symlink inside the data directory
pub const DAEMON_LINK_NAME: &str = "tailscaled";
/// File name of the control tool symlink inside the data directory
pub const CLI_LINK_NAME: &str = "tailscale";
/// File name of the control tool library shipped next to the daemon library
pub const CLI_LIBRARY_NAME: &str = "libtailscale.so";

/// Derived, read-only view of every path a run needs.
///
/// `exec_dir` is the directory of the executable and `data_dir` the directory
/// of the control socket. Malformed input is passed through unchanged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathResolver {
    executable: PathBuf,
    socket: PathBuf,
    state: PathBuf,
    exec_dir: PathBuf,
    data_dir: PathBuf,
}

impl PathResolver {
    pub fn new(
        executable: impl Into<PathBuf>,
        socket: impl Into<PathBuf>,
        state: impl Into<PathBuf>,
    ) -> Self {
        let executable = executable.into();
        let socket = socket.into();
        let exec_dir = dirname(&executable);
        let data_dir = dirname(&socket);

        Self {
            executable,
            socket,
            state: state.into(),
            exec_dir,
            data_dir,
        }
    }

    /// The executable as supplied by the host
    pub fn daemon_library(&self) -> &Path {
        &self.executable
    }

    /// Symlink through which the daemon is launched
    pub fn daemon_binary(&self) -> PathBuf {
        self.data_dir.join(DAEMON_LINK_NAME)
    }

    /// Control tool library shipped next to the daemon library
    pub fn cli_library(&self) -> PathBuf {
        self.exec_dir.join(CLI_LIBRARY_NAME)
    }

    /// Symlink through which the control tool is invoked
    pub fn cli_binary(&self) -> PathBuf {
        self.data_dir.join(CLI_LINK_NAME)
    }

    pub fn exec_dir(&self) -> &Path {
        &self.exec_dir
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Join components under the data directory
    pub fn data_path<I, P>(&self, components: I) -> PathBuf
    where
        I: IntoIterator<Item = P>,
        P: AsRef<Path>,
    {
        let mut path = self.data_dir.clone();
        for component in components {
            path.push(component);
        }
        path
    }

    pub fn socket(&self) -> &Path {
        &self.socket
    }

    pub fn state(&self) -> &Path {
        &self.state
    }
}

// A bare file name lives in the current directory
fn dirname(path: &Path) -> PathBuf {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    }
}
