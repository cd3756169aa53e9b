// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 tailproxy Contributors

// Embedded SSH/SFTP server rooted at the daemon's data directory

mod handler;
mod pty;
mod session;
mod sftp;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use russh::keys::PrivateKey;
use russh::server;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use tailproxy_common::is_loopback_listen;

pub use handler::SshHandler;
pub use pty::PtyRequest;
pub use session::{SessionContext, SshSession, NO_PTY_MESSAGE};
pub use sftp::LocalFs;

pub struct SshServer;

impl SshServer {
    /// Bind `listen` and serve in the background until the handle is shut down
    pub async fn bind(
        listen: &str,
        key: PrivateKey,
        context: SessionContext,
    ) -> Result<SshServerHandle> {
        let listener = TcpListener::bind(listen)
            .await
            .with_context(|| format!("Failed to bind SSH listener on {}", listen))?;
        let local_addr = listener.local_addr()?;

        if !is_loopback_listen(listen) {
            warn!(
                listen,
                "SSH server accepts clients without authentication on a non-loopback address"
            );
        }

        let config = Arc::new(server::Config {
            keys: vec![key],
            inactivity_timeout: None,
            auth_rejection_time: Duration::from_millis(100),
            auth_rejection_time_initial: Some(Duration::ZERO),
            ..Default::default()
        });

        let cancel = CancellationToken::new();
        let task = tokio::spawn(serve(listener, config, Arc::new(context), cancel.clone()));
        info!(%local_addr, "SSH server listening");

        Ok(SshServerHandle {
            local_addr,
            cancel,
            task,
        })
    }
}

/// Running accept loop. Dropping the handle leaves the loop running.
#[derive(Debug)]
pub struct SshServerHandle {
    local_addr: SocketAddr,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl SshServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting; established sessions carry on until they end
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Wait for the accept loop to exit
    pub async fn join(self) {
        if let Err(e) = self.task.await {
            warn!("SSH accept loop panicked: {}", e);
        }
    }
}

async fn serve(
    listener: TcpListener,
    config: Arc<server::Config>,
    context: Arc<SessionContext>,
    cancel: CancellationToken,
) {
    loop {
        let (stream, peer) = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    warn!("SSH accept failed: {}", e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    continue;
                }
            },
        };

        debug!(%peer, "SSH connection accepted");
        let handler = SshHandler::new(context.clone(), Some(peer));
        let config = config.clone();
        tokio::spawn(async move {
            let session = match server::run_stream(config, stream, handler).await {
                Ok(session) => session,
                Err(e) => {
                    debug!(%peer, "SSH handshake failed: {:#}", e);
                    return;
                }
            };
            match session.await {
                Ok(()) => debug!(%peer, "SSH connection closed"),
                Err(e) => debug!(%peer, "SSH connection ended: {:#}", e),
            }
        });
    }

    info!("SSH server stopped accepting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use russh::keys::ssh_key::rand_core::OsRng;
    use russh::keys::{Algorithm, PublicKey};
    use russh::ChannelMsg;
    use tempfile::TempDir;
    use tokio::io::AsyncWriteExt;

    struct TrustingClient;

    impl russh::client::Handler for TrustingClient {
        type Error = anyhow::Error;

        async fn check_server_key(&mut self, _key: &PublicKey) -> Result<bool, Self::Error> {
            Ok(true)
        }
    }

    async fn start_server(dir: &TempDir) -> SshServerHandle {
        let key = PrivateKey::random(&mut OsRng, Algorithm::Ed25519).unwrap();
        let context = SessionContext::new(dir.path(), dir.path().join("libtailscaled.so"));
        SshServer::bind("127.0.0.1:0", key, context).await.unwrap()
    }

    async fn connect(addr: SocketAddr) -> russh::client::Handle<TrustingClient> {
        let config = Arc::new(russh::client::Config::default());
        let mut client = russh::client::connect(config, addr, TrustingClient)
            .await
            .unwrap();
        let auth = client.authenticate_none("anyone").await.unwrap();
        assert!(auth.success());
        client
    }

    #[tokio::test]
    async fn test_shell_without_pty_is_refused() {
        let dir = TempDir::new().unwrap();
        let server = start_server(&dir).await;
        let client = connect(server.local_addr()).await;

        let mut channel = client.channel_open_session().await.unwrap();
        channel.request_shell(true).await.unwrap();

        let mut output = Vec::new();
        let mut exit_status = None;
        while let Some(msg) = channel.wait().await {
            match msg {
                ChannelMsg::Data { data } => output.extend_from_slice(&data),
                ChannelMsg::ExitStatus { exit_status: code } => exit_status = Some(code),
                ChannelMsg::Close => break,
                _ => {}
            }
        }

        assert_eq!(output, NO_PTY_MESSAGE.as_bytes());
        assert_eq!(exit_status, Some(1));

        server.shutdown();
        tokio::time::timeout(Duration::from_secs(5), server.join())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_interactive_shell_on_pty() {
        let dir = TempDir::new().unwrap();
        let server = start_server(&dir).await;
        let client = connect(server.local_addr()).await;

        let mut channel = client.channel_open_session().await.unwrap();
        channel
            .request_pty(true, "xterm", 80, 24, 0, 0, &[])
            .await
            .unwrap();
        channel.request_shell(true).await.unwrap();
        channel.window_change(132, 50, 0, 0).await.unwrap();
        channel
            .data(&b"stty size; echo \"T=$TERM\"; exit 3\n"[..])
            .await
            .unwrap();

        let mut output = Vec::new();
        let mut exit_status = None;
        tokio::time::timeout(Duration::from_secs(10), async {
            while let Some(msg) = channel.wait().await {
                match msg {
                    ChannelMsg::Data { data } => output.extend_from_slice(&data),
                    ChannelMsg::ExitStatus { exit_status: code } => exit_status = Some(code),
                    ChannelMsg::Close => break,
                    _ => {}
                }
            }
        })
        .await
        .unwrap();

        let text = String::from_utf8_lossy(&output);
        assert!(text.contains("Welcome to Tailscaled SSH"));
        assert!(text.contains(&format!("Work Dir: {}", dir.path().display())));
        assert!(text.contains("50 132"));
        assert!(text.contains("T=xterm"));
        assert_eq!(exit_status, Some(3));
        server.shutdown();
    }

    #[tokio::test]
    async fn test_unknown_subsystem_is_refused() {
        let dir = TempDir::new().unwrap();
        let server = start_server(&dir).await;
        let client = connect(server.local_addr()).await;

        let mut channel = client.channel_open_session().await.unwrap();
        channel.request_subsystem(true, "netconf").await.unwrap();

        let reply = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                match channel.wait().await {
                    Some(ChannelMsg::Success) => break true,
                    Some(ChannelMsg::Failure) | None => break false,
                    Some(_) => {}
                }
            }
        })
        .await
        .unwrap();
        assert!(!reply);
        server.shutdown();
    }

    #[tokio::test]
    async fn test_sftp_roots_relative_paths_at_data_dir() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("existing.txt"), b"from disk").unwrap();
        let server = start_server(&dir).await;
        let client = connect(server.local_addr()).await;

        let channel = client.channel_open_session().await.unwrap();
        channel.request_subsystem(true, "sftp").await.unwrap();
        let sftp = russh_sftp::client::SftpSession::new(channel.into_stream())
            .await
            .unwrap();

        assert_eq!(sftp.read("existing.txt").await.unwrap(), b"from disk");

        let mut file = sftp.create("uploaded.txt").await.unwrap();
        file.write_all(b"from client").await.unwrap();
        file.shutdown().await.unwrap();
        assert_eq!(
            std::fs::read(dir.path().join("uploaded.txt")).unwrap(),
            b"from client"
        );

        sftp.create_dir("nested").await.unwrap();
        assert!(dir.path().join("nested").is_dir());

        let mut names: Vec<String> = sftp
            .read_dir(".")
            .await
            .unwrap()
            .map(|entry| entry.file_name())
            .collect();
        names.sort();
        assert_eq!(names, vec!["existing.txt", "nested", "uploaded.txt"]);

        sftp.close().await.unwrap();
        server.shutdown();
    }

    #[tokio::test]
    async fn test_shutdown_stops_accepting() {
        let dir = TempDir::new().unwrap();
        let server = start_server(&dir).await;
        let addr = server.local_addr();

        server.shutdown();
        tokio::time::timeout(Duration::from_secs(5), server.join())
            .await
            .unwrap();

        assert!(tokio::net::TcpStream::connect(addr).await.is_err());
    }
}
