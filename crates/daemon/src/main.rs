// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 tailproxy Contributors

// tailproxyd - supervises tailscaled and serves the control API on a unix socket

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use hyper_util::rt::TokioIo;
use tokio::net::UnixListener;
use tower::Service;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, Layer};

use tailproxy_daemon::api::{create_router, AppState};
use tailproxy_daemon::{permissions, pidfile, DaemonConfig, LogBuffer, LogBufferLayer, Supervisor};

#[tokio::main]
async fn main() -> Result<()> {
    // Before any file is created
    permissions::set_restrictive_umask();

    let logs = LogBuffer::new();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer().with_filter(
                tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                    "tailproxy_daemon=debug,tailproxyd=debug,tailscaled=info,tower_http=info".into()
                }),
            ),
        )
        .with(LogBufferLayer::new(logs.clone()).with_filter(LogBufferLayer::default_filter()))
        .init();

    info!("tailproxyd starting...");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let _pid_guard = pidfile::PidFileGuard::create(&pidfile::default_pid_path()?)
        .context("Failed to create PID file - another daemon may already be running")?;

    let daemon_config = DaemonConfig::load()?;

    let supervisor = Supervisor::new(logs);
    supervisor.set_log_level(daemon_config.log_level);

    if daemon_config.autostart {
        info!("Autostart enabled, starting configured profile");
        supervisor.start(daemon_config.run.clone());
    }

    let socket_path = daemon_config.socket_path()?;
    let group_access = daemon_config.group_access;
    let state = Arc::new(AppState {
        supervisor: supervisor.clone(),
        config: daemon_config,
    });

    serve_unix_socket(create_router(state), &socket_path, group_access).await?;

    supervisor.shutdown().await;
    info!("Daemon shut down");
    Ok(())
}

/// Serve the control API until Ctrl+C or SIGTERM
async fn serve_unix_socket(app: axum::Router, socket_path: &Path, group_access: bool) -> Result<()> {
    if socket_path.exists() {
        std::fs::remove_file(socket_path).context("Failed to remove existing socket file")?;
    }

    if let Some(parent) = socket_path.parent() {
        permissions::ensure_runtime_dir(parent, group_access)?;
    }

    let listener = UnixListener::bind(socket_path)
        .with_context(|| format!("Failed to bind to socket: {}", socket_path.display()))?;

    // Tighten before the first client can connect
    permissions::secure_socket(socket_path, group_access)?;

    info!("Daemon listening on Unix socket: {}", socket_path.display());

    let shutdown = wait_for_shutdown();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            result = &mut shutdown => {
                if let Err(e) = result {
                    error!("Signal handling failed: {:#}", e);
                }
                info!("Shutting down server...");
                break;
            }

            accept_result = listener.accept() => {
                match accept_result {
                    Ok((stream, _addr)) => {
                        let app = app.clone();

                        tokio::spawn(async move {
                            let stream = TokioIo::new(stream);

                            let hyper_service = hyper::service::service_fn(move |request: hyper::Request<hyper::body::Incoming>| {
                                let mut app = app.clone();
                                async move {
                                    app.call(request).await
                                }
                            });

                            if let Err(err) = hyper_util::server::conn::auto::Builder::new(hyper_util::rt::TokioExecutor::new())
                                .serve_connection_with_upgrades(stream, hyper_service)
                                .await
                            {
                                let err_msg = err.to_string();
                                if err_msg.contains("connection closed") || err_msg.contains("Broken pipe") {
                                    debug!("Client disconnected: {}", err);
                                } else {
                                    error!("Error serving connection: {}", err);
                                }
                            }
                        });
                    }
                    Err(e) => {
                        error!("Failed to accept connection: {}", e);
                    }
                }
            }
        }
    }

    if let Err(e) = std::fs::remove_file(socket_path) {
        warn!("Failed to remove socket {}: {}", socket_path.display(), e);
    }

    Ok(())
}

/// Wait for Ctrl+C or SIGTERM
async fn wait_for_shutdown() -> Result<()> {
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .context("Failed to install SIGTERM handler")?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
        _ = sigterm.recv() => {
            info!("Received SIGTERM, shutting down");
        }
    };
    Ok(())
}
