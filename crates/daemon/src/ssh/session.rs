// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 tailproxy Contributors

// What runs on an SSH channel once the client asked for a shell or sftp

use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::mpsc as std_mpsc;

use anyhow::{Context, Result};
use russh::server::Msg;
use russh::{Channel, ChannelMsg};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::pty::{dimension, PtyRequest, ShellPty};
use super::sftp::LocalFs;

pub const NO_PTY_MESSAGE: &str = "No PTY requested.\n";

/// Per-server facts every session needs
#[derive(Debug, Clone)]
pub struct SessionContext {
    data_dir: PathBuf,
    daemon_library: PathBuf,
}

impl SessionContext {
    pub fn new(data_dir: impl Into<PathBuf>, daemon_library: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            daemon_library: daemon_library.into(),
        }
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn daemon_library(&self) -> &Path {
        &self.daemon_library
    }
}

pub fn welcome_banner(context: &SessionContext, peer: &str) -> String {
    format!(
        "\r\nWelcome to Tailscaled SSH\r\n\tTailscaled: {}\r\n\tWork Dir: {}\r\n\tRemoteAddr: {}\r\n\r\n",
        context.daemon_library().display(),
        context.data_dir().display(),
        peer
    )
}

/// Kinds of session a channel can carry
#[derive(Debug)]
pub enum SshSession {
    /// Shell on a pty; `command` comes from an exec request
    Interactive {
        pty: PtyRequest,
        command: Option<String>,
    },
    /// sftp subsystem over the local filesystem
    FileTransfer,
}

impl SshSession {
    /// Drive the channel until the session ends
    pub async fn run(self, channel: Channel<Msg>, context: &SessionContext, peer: &str) {
        let result = match self {
            SshSession::Interactive { pty, command } => {
                run_interactive(pty, command, channel, context, peer).await
            }
            SshSession::FileTransfer => {
                run_file_transfer(channel, context, peer).await;
                Ok(())
            }
        };

        if let Err(e) = result {
            warn!(peer, "SSH session failed: {:#}", e);
        }
    }
}

/// Answer a shell or exec request that arrived without a pty
pub async fn refuse_without_pty(channel: Channel<Msg>) {
    let _ = channel.data(NO_PTY_MESSAGE.as_bytes()).await;
    let _ = channel.exit_status(1).await;
    let _ = channel.eof().await;
    let _ = channel.close().await;
}

async fn run_interactive(
    pty: PtyRequest,
    command: Option<String>,
    mut channel: Channel<Msg>,
    context: &SessionContext,
    peer: &str,
) -> Result<()> {
    channel
        .data(welcome_banner(context, peer).as_bytes())
        .await
        .context("Failed to send banner")?;

    let (shell, streams) = ShellPty::spawn(&pty, context.data_dir(), command.as_deref())?;
    let mut killer = shell.killer();
    info!(peer, pid = ?shell.pid(), term = %pty.term, "Interactive session started");

    let mut output = spawn_output_copy(streams.reader, Box::pin(channel.make_writer()));
    let input = spawn_input_copy(streams.writer);

    let hung_up = loop {
        tokio::select! {
            _ = &mut output => break false,
            msg = channel.wait() => match msg {
                Some(ChannelMsg::Data { data }) => {
                    if input.send(data.to_vec()).is_err() {
                        break false;
                    }
                }
                Some(ChannelMsg::WindowChange { col_width, row_height, .. }) => {
                    if let Err(e) = shell.resize(dimension(col_width), dimension(row_height)) {
                        debug!("{:#}", e);
                    }
                }
                Some(ChannelMsg::Eof) | Some(ChannelMsg::Close) | None => break true,
                Some(_) => {}
            },
        }
    };
    drop(input);

    if hung_up {
        if let Err(e) = killer.kill() {
            debug!("Failed to hang up shell: {}", e);
        }
    }

    let status = tokio::task::spawn_blocking(move || shell.wait())
        .await
        .context("Shell reaper panicked")?
        .context("Failed to reap shell")?;

    let _ = channel.exit_status(status).await;
    let _ = channel.eof().await;
    let _ = channel.close().await;
    info!(peer, exit_status = status, "session exit");
    Ok(())
}

// pty -> channel on a blocking thread
fn spawn_output_copy<W>(mut reader: Box<dyn Read + Send>, mut writer: W) -> JoinHandle<()>
where
    W: AsyncWrite + Send + Unpin + 'static,
{
    let runtime = tokio::runtime::Handle::current();
    tokio::task::spawn_blocking(move || {
        let mut buf = [0u8; 8192];
        loop {
            match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    if runtime.block_on(writer.write_all(&buf[..n])).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    debug!("pty read finished: {}", e);
                    break;
                }
            }
        }
    })
}

// channel -> pty; ends when the sender is dropped
fn spawn_input_copy(mut writer: Box<dyn Write + Send>) -> std_mpsc::Sender<Vec<u8>> {
    let (tx, rx) = std_mpsc::channel::<Vec<u8>>();
    tokio::task::spawn_blocking(move || {
        for chunk in rx {
            if let Err(e) = writer.write_all(&chunk).and_then(|()| writer.flush()) {
                debug!("pty write failed: {}", e);
                break;
            }
        }
    });
    tx
}

async fn run_file_transfer(channel: Channel<Msg>, context: &SessionContext, peer: &str) {
    let (done_tx, done_rx) = oneshot::channel::<()>();
    let backend = LocalFs::new(context.data_dir()).with_done_signal(done_tx);

    info!(peer, "SFTP session started");
    russh_sftp::server::run(channel.into_stream(), backend).await;
    // resolves when the backend is dropped at end of stream
    let _ = done_rx.await;
    info!(peer, "SFTP session exit");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_welcome_banner() {
        let context = SessionContext::new("/data/ts", "/app/lib/libtailscaled.so");
        let banner = welcome_banner(&context, "100.64.0.7:52144");

        assert!(banner.starts_with("\r\nWelcome to Tailscaled SSH\r\n"));
        assert!(banner.contains("\tTailscaled: /app/lib/libtailscaled.so\r\n"));
        assert!(banner.contains("\tWork Dir: /data/ts\r\n"));
        assert!(banner.contains("\tRemoteAddr: 100.64.0.7:52144\r\n"));
    }

    #[test]
    fn test_context_accessors() {
        let context = SessionContext::new("/d", "/e/ts.so");
        assert_eq!(context.data_dir(), Path::new("/d"));
        assert_eq!(context.daemon_library(), Path::new("/e/ts.so"));
    }
}
