// Per-connection russh handler: accepts every client and dispatches channels

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use russh::keys::PublicKey;
use russh::server::{Auth, Msg, Session};
use russh::{Channel, ChannelId, Pty};
use tracing::{debug, warn};

use super::pty::PtyRequest;
use super::session::{refuse_without_pty, SessionContext, SshSession};

/// A session channel that has not started its shell or subsystem yet
struct PendingChannel {
    channel: Channel<Msg>,
    pty: Option<PtyRequest>,
}

pub struct SshHandler {
    context: Arc<SessionContext>,
    peer: String,
    channels: HashMap<ChannelId, PendingChannel>,
}

impl SshHandler {
    pub fn new(context: Arc<SessionContext>, peer: Option<SocketAddr>) -> Self {
        Self {
            context,
            peer: peer.map_or_else(|| "unknown".to_string(), |p| p.to_string()),
            channels: HashMap::new(),
        }
    }

    fn spawn_session(&self, kind: SshSession, channel: Channel<Msg>) {
        let context = self.context.clone();
        let peer = self.peer.clone();
        tokio::spawn(async move {
            kind.run(channel, &context, &peer).await;
        });
    }

    fn start_shell(
        &mut self,
        id: ChannelId,
        command: Option<String>,
        session: &mut Session,
    ) -> Result<()> {
        let Some(pending) = self.channels.remove(&id) else {
            session.channel_failure(id)?;
            return Ok(());
        };
        session.channel_success(id)?;

        match pending.pty {
            Some(pty) => self.spawn_session(SshSession::Interactive { pty, command }, pending.channel),
            None => {
                debug!(peer = %self.peer, "Shell requested without a pty");
                tokio::spawn(refuse_without_pty(pending.channel));
            }
        }
        Ok(())
    }
}

impl russh::server::Handler for SshHandler {
    type Error = anyhow::Error;

    async fn auth_none(&mut self, user: &str) -> Result<Auth, Self::Error> {
        debug!(user, peer = %self.peer, "Accepted none auth");
        Ok(Auth::Accept)
    }

    async fn auth_password(&mut self, user: &str, _password: &str) -> Result<Auth, Self::Error> {
        debug!(user, peer = %self.peer, "Accepted password auth");
        Ok(Auth::Accept)
    }

    async fn auth_publickey(
        &mut self,
        user: &str,
        _public_key: &PublicKey,
    ) -> Result<Auth, Self::Error> {
        debug!(user, peer = %self.peer, "Accepted public key auth");
        Ok(Auth::Accept)
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        self.channels.insert(
            channel.id(),
            PendingChannel { channel, pty: None },
        );
        Ok(true)
    }

    async fn channel_close(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.channels.remove(&channel);
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn pty_request(
        &mut self,
        channel: ChannelId,
        term: &str,
        col_width: u32,
        row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _modes: &[(Pty, u32)],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        match self.channels.get_mut(&channel) {
            Some(pending) => {
                pending.pty = Some(PtyRequest::new(term, col_width, row_height));
                session.channel_success(channel)?;
            }
            None => session.channel_failure(channel)?,
        }
        Ok(())
    }

    async fn shell_request(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.start_shell(channel, None, session)
    }

    async fn exec_request(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let command = String::from_utf8_lossy(data).into_owned();
        self.start_shell(channel, Some(command), session)
    }

    async fn subsystem_request(
        &mut self,
        channel: ChannelId,
        name: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        if name != "sftp" {
            warn!(peer = %self.peer, subsystem = name, "Refusing unknown subsystem");
            session.channel_failure(channel)?;
            return Ok(());
        }

        let Some(pending) = self.channels.remove(&channel) else {
            session.channel_failure(channel)?;
            return Ok(());
        };
        session.channel_success(channel)?;
        self.spawn_session(SshSession::FileTransfer, pending.channel);
        Ok(())
    }
}
