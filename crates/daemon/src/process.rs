// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 tailproxy Contributors

// tailscaled subprocess: symlinks, launch, output pumps and signalling

use std::ffi::OsString;
use std::fs;
use std::io;
use std::path::Path;
use std::process::{ExitStatus, Stdio};

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use tailproxy_common::{PathResolver, RunConfiguration};

/// Requests delivered to the task that owns the child
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Terminate,
    Kill,
}

/// Handle to a launched daemon. The child itself lives in the waiter task.
#[derive(Debug, Clone)]
pub struct DaemonProcess {
    pid: u32,
    generation: u64,
    control: mpsc::UnboundedSender<Signal>,
}

impl DaemonProcess {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Returns false once the waiter has gone away
    pub fn signal(&self, signal: Signal) -> bool {
        self.control.send(signal).is_ok()
    }
}

/// Flags passed to tailscaled
pub fn daemon_args(paths: &PathResolver, config: &RunConfiguration) -> Vec<OsString> {
    let mut state = OsString::from("--statedir=");
    state.push(paths.state());
    let mut socket = OsString::from("--socket=");
    socket.push(paths.socket());

    vec![
        OsString::from("--tun=userspace-networking"),
        OsString::from(format!("--socks5-server={}", config.socks5_listen)),
        OsString::from(format!(
            "--outbound-http-proxy-listen={}",
            config.http_proxy_listen
        )),
        state,
        socket,
    ]
}

/// Remove whatever is at `path`, tolerating absence
pub fn force_remove(path: &Path) -> io::Result<()> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path),
        Ok(_) => fs::remove_file(path),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// Point `<dataDir>/tailscale` and `<dataDir>/tailscaled` at the executable
pub fn prepare_symlinks(paths: &PathResolver) -> Result<()> {
    let target = paths.daemon_library();
    for link in [paths.cli_binary(), paths.daemon_binary()] {
        force_remove(&link).with_context(|| format!("Failed to remove {}", link.display()))?;
        std::os::unix::fs::symlink(target, &link).with_context(|| {
            format!("Failed to link {} -> {}", link.display(), target.display())
        })?;
        debug!("Linked {} -> {}", link.display(), target.display());
    }
    Ok(())
}

pub fn remove_stale_socket(paths: &PathResolver) {
    let socket = paths.socket();
    if socket.as_os_str().is_empty() {
        return;
    }
    match fs::remove_file(socket) {
        Ok(()) => debug!("Removed stale socket {}", socket.display()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!("Failed to remove stale socket {}: {}", socket.display(), e),
    }
}

/// Spawn tailscaled with piped output. Returns the child and the control receiver.
pub fn spawn_daemon(
    paths: &PathResolver,
    config: &RunConfiguration,
    generation: u64,
) -> Result<(DaemonProcess, Child, mpsc::UnboundedReceiver<Signal>)> {
    let binary = paths.daemon_binary();
    let logs_dir = paths.data_path(["logs"]);

    let child = Command::new(&binary)
        .args(daemon_args(paths, config))
        .current_dir(paths.data_dir())
        .env("TS_LOGS_DIR", &logs_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .with_context(|| format!("Failed to start {}", binary.display()))?;

    let pid = child
        .id()
        .ok_or_else(|| anyhow::anyhow!("tailscaled exited before reporting a pid"))?;
    info!(pid, "Started tailscaled");

    let (tx, rx) = mpsc::unbounded_channel();
    let process = DaemonProcess {
        pid,
        generation,
        control: tx,
    };
    Ok((process, child, rx))
}

/// Read lines until EOF, decoding lossily
pub async fn pump_lines<R, F>(reader: R, mut on_line: F)
where
    R: AsyncRead + Unpin,
    F: FnMut(&str),
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => on_line(&String::from_utf8_lossy(&buf)),
            Err(e) => {
                debug!("Output pump stopped: {}", e);
                break;
            }
        }
    }
}

/// Own the child until it exits, applying signals as they arrive
pub async fn wait_for_exit(
    mut child: Child,
    mut control: mpsc::UnboundedReceiver<Signal>,
) -> io::Result<ExitStatus> {
    loop {
        tokio::select! {
            status = child.wait() => return status,
            Some(signal) = control.recv() => match signal {
                Signal::Terminate => {
                    if let Some(pid) = child.id() {
                        send_sigterm(pid);
                    }
                }
                Signal::Kill => {
                    debug!("Force killing tailscaled");
                    let _ = child.start_kill();
                }
            },
        }
    }
}

fn send_sigterm(pid: u32) {
    // SAFETY: plain kill(2); the pid belongs to a child we have not reaped yet
    let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
    if rc != 0 {
        debug!(
            "SIGTERM to {} failed: {}",
            pid,
            io::Error::last_os_error()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use std::time::Duration;
    use tempfile::TempDir;

    fn resolver(dir: &Path, exe: &Path) -> PathResolver {
        PathResolver::new(exe, dir.join("tailscaled.sock"), dir.join("state"))
    }

    fn write_executable(path: &Path, body: &str) {
        fs::write(path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        fs::set_permissions(path, fs::Permissions::from_mode(0o755)).unwrap();
    }

    #[test]
    fn test_daemon_args() {
        let paths = PathResolver::new("/opt/ts.so", "/data/ts.sock", "/data/state");
        let config = RunConfiguration::new("/opt/ts.so", "/data/ts.sock", "/data/state")
            .with_defaults();

        let args: Vec<String> = daemon_args(&paths, &config)
            .into_iter()
            .map(|a| a.into_string().unwrap())
            .collect();

        assert_eq!(
            args,
            vec![
                "--tun=userspace-networking",
                "--socks5-server=127.0.0.1:1055",
                "--outbound-http-proxy-listen=127.0.0.1:1057",
                "--statedir=/data/state",
                "--socket=/data/ts.sock",
            ]
        );
    }

    #[test]
    fn test_prepare_symlinks_replaces_existing() {
        let dir = TempDir::new().unwrap();
        let exe = dir.path().join("libtailscaled.so");
        write_executable(&exe, "exit 0");
        let paths = resolver(dir.path(), &exe);

        fs::write(paths.cli_binary(), b"stale").unwrap();
        fs::create_dir(paths.daemon_binary()).unwrap();

        prepare_symlinks(&paths).unwrap();
        prepare_symlinks(&paths).unwrap();

        assert_eq!(fs::read_link(paths.cli_binary()).unwrap(), exe);
        assert_eq!(fs::read_link(paths.daemon_binary()).unwrap(), exe);
    }

    #[test]
    fn test_force_remove_missing_is_ok() {
        let dir = TempDir::new().unwrap();
        assert!(force_remove(&dir.path().join("nothing")).is_ok());
    }

    #[test]
    fn test_remove_stale_socket() {
        let dir = TempDir::new().unwrap();
        let exe = dir.path().join("ts.so");
        let paths = resolver(dir.path(), &exe);
        fs::write(paths.socket(), b"").unwrap();

        remove_stale_socket(&paths);
        assert!(!paths.socket().exists());
        remove_stale_socket(&paths);
    }

    #[tokio::test]
    async fn test_pump_lines_lossy() {
        let input: &[u8] = b"first\nsec\xffond\nlast-no-newline";
        let mut lines = Vec::new();
        pump_lines(input, |l| lines.push(l.trim_end().to_string())).await;
        assert_eq!(lines, vec!["first", "sec\u{fffd}ond", "last-no-newline"]);
    }

    #[tokio::test]
    async fn test_spawn_and_terminate() {
        let dir = TempDir::new().unwrap();
        let exe = dir.path().join("libtailscaled.so");
        write_executable(
            &exe,
            r#"trap 'exit 0' TERM; echo "dir=$(pwd) logs=$TS_LOGS_DIR"; while :; do sleep 0.05; done"#,
        );
        let paths = resolver(dir.path(), &exe);
        let config = RunConfiguration::new(
            exe.to_string_lossy(),
            paths.socket().to_string_lossy(),
            paths.state().to_string_lossy(),
        )
        .with_defaults();

        prepare_symlinks(&paths).unwrap();
        let (process, mut child, rx) = spawn_daemon(&paths, &config, 7).unwrap();
        assert_eq!(process.generation(), 7);
        assert!(process.pid() > 0);

        let mut stdout = BufReader::new(child.stdout.take().unwrap());
        let mut first = String::new();
        stdout.read_line(&mut first).await.unwrap();

        let waiter = tokio::spawn(wait_for_exit(child, rx));
        assert!(process.signal(Signal::Terminate));

        let status = tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(status.success());

        assert!(first.starts_with("dir="));
        assert!(first
            .trim_end()
            .ends_with(&format!("logs={}/logs", dir.path().display())));
    }

    #[tokio::test]
    async fn test_kill_ignores_sigterm_trap() {
        let dir = TempDir::new().unwrap();
        let exe = dir.path().join("libtailscaled.so");
        write_executable(&exe, "trap '' TERM; echo ready; while :; do sleep 0.05; done");
        let paths = resolver(dir.path(), &exe);
        let config = RunConfiguration::new(
            exe.to_string_lossy(),
            paths.socket().to_string_lossy(),
            paths.state().to_string_lossy(),
        )
        .with_defaults();

        prepare_symlinks(&paths).unwrap();
        let (process, mut child, rx) = spawn_daemon(&paths, &config, 1).unwrap();

        // the trap is installed once the script has printed
        let mut stdout = BufReader::new(child.stdout.take().unwrap());
        let mut ready = String::new();
        stdout.read_line(&mut ready).await.unwrap();
        assert_eq!(ready.trim_end(), "ready");

        let waiter = tokio::spawn(wait_for_exit(child, rx));

        process.signal(Signal::Terminate);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!waiter.is_finished());

        process.signal(Signal::Kill);
        let status = tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(!status.success());
    }
}
