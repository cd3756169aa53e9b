// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 tailproxy Contributors

// Lifecycle of one tailscaled run and everything attached to it

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use russh::keys::PrivateKey;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use tailproxy_common::{
    CloseHook, DaemonStatus, LogLevel, PathResolver, RegistrationOutcome, RunConfiguration,
    TailnetStatus,
};

use crate::control::{self, ControlTool, TailscaleCli, NOT_RUNNING_MESSAGE};
use crate::filter;
use crate::host_key;
use crate::logbuf::LogBuffer;
use crate::process::{self, DaemonProcess, Signal};
use crate::registration::{self, FsSocketCheck, Registration, RetryPolicy, SocketCheck};
use crate::ssh::{SessionContext, SshServer, SshServerHandle};

/// Timing knobs of the supervisor
#[derive(Debug, Clone)]
pub struct SupervisorOptions {
    /// Pause between stopping the previous run and launching the next
    pub settle_delay: Duration,
    /// Time a daemon gets to exit after SIGTERM before it is killed
    pub kill_grace: Duration,
    pub retry: RetryPolicy,
}

impl Default for SupervisorOptions {
    fn default() -> Self {
        Self {
            settle_delay: Duration::from_millis(500),
            kill_grace: Duration::from_secs(2),
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Default)]
struct SupervisionState {
    /// Bumped by every start and stop; work tagged with an older value is stale
    generation: u64,
    daemon: Option<DaemonProcess>,
    ssh: Option<SshServerHandle>,
    registration: Option<CancellationToken>,
    paths: Option<PathResolver>,
    log_level: LogLevel,
}

/// Resources detached from the state by a teardown
struct Detached {
    daemon: Option<DaemonProcess>,
    ssh: Option<SshServerHandle>,
    registration: Option<CancellationToken>,
}

struct Inner {
    state: Mutex<SupervisionState>,
    logs: LogBuffer,
    tool: Arc<dyn ControlTool>,
    socket_check: Arc<dyn SocketCheck>,
    tracker: TaskTracker,
    options: SupervisorOptions,
    registration: watch::Sender<RegistrationOutcome>,
}

/// Owns the daemon subprocess, the SSH server and the registration loop.
///
/// Cheap to clone; all clones drive the same run. Every method must be
/// called from within a tokio runtime.
#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<Inner>,
}

impl Supervisor {
    pub fn new(logs: LogBuffer) -> Self {
        Self::with_parts(
            logs,
            Arc::new(TailscaleCli),
            Arc::new(FsSocketCheck),
            SupervisorOptions::default(),
        )
    }

    pub fn with_parts(
        logs: LogBuffer,
        tool: Arc<dyn ControlTool>,
        socket_check: Arc<dyn SocketCheck>,
        options: SupervisorOptions,
    ) -> Self {
        let (registration, _) = watch::channel(RegistrationOutcome::Pending);
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(SupervisionState::default()),
                logs,
                tool,
                socket_check,
                tracker: TaskTracker::new(),
                options,
                registration,
            }),
        }
    }

    /// Stop the current run, then launch a new one after the settle delay.
    /// Returns immediately.
    pub fn start(&self, config: RunConfiguration) {
        let config = config.with_defaults();
        self.stop();

        let generation = {
            let mut state = self.inner.state.lock();
            state.generation += 1;
            state.generation
        };
        info!(generation, "Starting tailscaled");

        let this = self.clone();
        self.inner.tracker.spawn(async move {
            tokio::time::sleep(this.inner.options.settle_delay).await;
            this.launch(generation, config).await;
        });
    }

    /// Tear down the current run. Idempotent; state is cleared on return.
    pub fn stop(&self) {
        if let Some(detached) = self.detach(None) {
            self.release(detached);
        }
    }

    pub fn is_running(&self) -> bool {
        self.inner.state.lock().daemon.is_some()
    }

    /// Run control tool command text against the current daemon
    pub async fn run_command(&self, text: &str) -> String {
        match self.running_paths() {
            Some(paths) => control::run_user_command(self.inner.tool.as_ref(), &paths, text).await,
            None => NOT_RUNNING_MESSAGE.to_string(),
        }
    }

    /// `status --json` of the current daemon, `None` when idle
    pub async fn tailnet_status(&self) -> Result<Option<TailnetStatus>> {
        let Some(paths) = self.running_paths() else {
            return Ok(None);
        };

        let args = ["status".to_string(), "--json".to_string()];
        let output = self.inner.tool.invoke(&paths, &args).await?;
        if let Some(reason) = &output.failure {
            anyhow::bail!("tailscale status failed ({}): {}", reason, output.output.trim());
        }

        let status = serde_json::from_str(&output.output)
            .context("Failed to parse tailscale status output")?;
        Ok(Some(status))
    }

    pub fn logs(&self) -> String {
        self.inner.logs.snapshot()
    }

    pub fn clear_logs(&self) {
        self.inner.logs.clear();
    }

    pub fn set_log_level(&self, level: LogLevel) {
        self.inner.state.lock().log_level = level;
        info!("Log level set to {}", level);
    }

    pub fn log_level(&self) -> LogLevel {
        self.inner.state.lock().log_level
    }

    pub fn status(&self) -> DaemonStatus {
        let state = self.inner.state.lock();
        DaemonStatus {
            running: state.daemon.is_some(),
            ssh_listening: state.ssh.is_some(),
            log_level: state.log_level,
            registration: self.inner.registration.borrow().clone(),
            data_dir: state
                .paths
                .as_ref()
                .map(|p| p.data_dir().display().to_string()),
        }
    }

    pub fn subscribe_registration(&self) -> watch::Receiver<RegistrationOutcome> {
        self.inner.registration.subscribe()
    }

    /// Stop and wait for background tasks, bounded by the kill grace period
    pub async fn shutdown(&self) {
        self.stop();

        let tracker = &self.inner.tracker;
        tracker.close();
        let limit = self.inner.options.kill_grace + Duration::from_secs(1);
        if tokio::time::timeout(limit, tracker.wait()).await.is_err() {
            warn!(tasks = tracker.len(), "Background tasks still running at shutdown");
        }
        tracker.reopen();
    }

    async fn launch(&self, generation: u64, config: RunConfiguration) {
        let paths = config.paths();
        {
            let mut state = self.inner.state.lock();
            if state.generation != generation {
                debug!(generation, "Start superseded before launch");
                return;
            }
            state.paths = Some(paths.clone());
        }
        self.inner
            .registration
            .send_replace(RegistrationOutcome::Pending);

        process::remove_stale_socket(&paths);

        if config.ssh_enabled() {
            self.spawn_ssh(generation, config.ssh_listen.clone(), &paths);
        }

        let hook = config.on_close.clone();
        let spawned = process::prepare_symlinks(&paths)
            .and_then(|()| process::spawn_daemon(&paths, &config, generation));
        let (daemon, mut child, signals) = match spawned {
            Ok(parts) => parts,
            Err(e) => {
                error!("Failed to launch tailscaled: {:#}", e);
                if let Some(detached) = self.detach(Some(generation)) {
                    self.release(detached);
                }
                notify(hook);
                return;
            }
        };

        let pid = daemon.pid();
        let current = {
            let mut state = self.inner.state.lock();
            let current = state.generation == generation;
            if current {
                state.daemon = Some(daemon);
            }
            current
        };
        if !current {
            warn!(pid, "Run superseded during launch, killing tailscaled");
            let _ = child.start_kill();
            self.inner.tracker.spawn(async move {
                let _ = child.wait().await;
            });
            return;
        }

        if let Some(stdout) = child.stdout.take() {
            let this = self.clone();
            self.inner.tracker.spawn(async move {
                process::pump_lines(stdout, |line| filter::forward_line(this.log_level(), line))
                    .await;
            });
        }
        if let Some(stderr) = child.stderr.take() {
            let this = self.clone();
            self.inner.tracker.spawn(async move {
                process::pump_lines(stderr, |line| filter::forward_line(this.log_level(), line))
                    .await;
            });
        }

        let this = self.clone();
        self.inner.tracker.spawn(async move {
            match process::wait_for_exit(child, signals).await {
                Ok(status) => info!(pid, "tailscaled exited: {}", control::describe_exit(status)),
                Err(e) => error!(pid, "Failed to wait for tailscaled: {}", e),
            }
            this.on_daemon_exit(generation, hook);
        });

        self.spawn_registration(generation, &config, paths);
    }

    fn spawn_registration(&self, generation: u64, config: &RunConfiguration, paths: PathResolver) {
        let cancel = CancellationToken::new();
        {
            let mut state = self.inner.state.lock();
            if state.generation != generation {
                return;
            }
            state.registration = Some(cancel.clone());
        }

        let args = registration::up_args(config);
        let this = self.clone();
        self.inner.tracker.spawn(async move {
            let outcome = Registration {
                tool: this.inner.tool.as_ref(),
                socket_check: this.inner.socket_check.as_ref(),
                paths: &paths,
                args,
                policy: this.inner.options.retry.clone(),
                cancel,
            }
            .run()
            .await;

            info!(?outcome, "Registration finished");
            if this.inner.state.lock().generation == generation {
                this.inner.registration.send_replace(outcome);
            }
        });
    }

    fn spawn_ssh(&self, generation: u64, listen: String, paths: &PathResolver) {
        let context = SessionContext::new(paths.data_dir(), paths.daemon_library());
        let this = self.clone();

        self.inner.tracker.spawn(async move {
            let started = match load_host_key(&context).await {
                Ok(key) => SshServer::bind(&listen, key, context).await,
                Err(e) => Err(e),
            };
            let handle = match started {
                Ok(handle) => handle,
                Err(e) => {
                    error!("SSH server not started: {:#}", e);
                    return;
                }
            };

            let stale = {
                let mut state = this.inner.state.lock();
                if state.generation == generation {
                    state.ssh = Some(handle);
                    None
                } else {
                    Some(handle)
                }
            };
            if let Some(handle) = stale {
                debug!("Run ended while SSH server was starting");
                handle.shutdown();
            }
        });
    }

    fn on_daemon_exit(&self, generation: u64, hook: Option<CloseHook>) {
        if let Some(detached) = self.detach(Some(generation)) {
            self.release(detached);
        }
        notify(hook);
    }

    /// Take every resource out of the state, optionally only for `generation`
    fn detach(&self, generation: Option<u64>) -> Option<Detached> {
        let mut state = self.inner.state.lock();
        if generation.is_some_and(|g| g != state.generation) {
            return None;
        }

        state.generation += 1;
        state.paths = None;
        Some(Detached {
            daemon: state.daemon.take(),
            ssh: state.ssh.take(),
            registration: state.registration.take(),
        })
    }

    fn release(&self, detached: Detached) {
        if let Some(cancel) = detached.registration {
            cancel.cancel();
            self.inner.registration.send_if_modified(|outcome| {
                if outcome.is_finished() {
                    return false;
                }
                *outcome = RegistrationOutcome::Cancelled;
                true
            });
        }

        if let Some(ssh) = detached.ssh {
            ssh.shutdown();
        }

        if let Some(daemon) = detached.daemon {
            info!(pid = daemon.pid(), "Stopping tailscaled");
            if daemon.signal(Signal::Terminate) {
                let grace = self.inner.options.kill_grace;
                self.inner.tracker.spawn(async move {
                    tokio::time::sleep(grace).await;
                    if daemon.signal(Signal::Kill) {
                        debug!(pid = daemon.pid(), "Kill timer fired");
                    }
                });
            }
        }
    }

    fn running_paths(&self) -> Option<PathResolver> {
        let state = self.inner.state.lock();
        state.daemon.as_ref().and(state.paths.clone())
    }
}

fn notify(hook: Option<CloseHook>) {
    if let Some(hook) = hook {
        hook.notify();
    }
}

async fn load_host_key(context: &SessionContext) -> Result<PrivateKey> {
    let dir = context.data_dir().to_path_buf();
    tokio::task::spawn_blocking(move || {
        let data = host_key::ensure_host_key(&dir)?;
        host_key::decode_host_key(&data)
    })
    .await
    .context("Host key task panicked")?
}
