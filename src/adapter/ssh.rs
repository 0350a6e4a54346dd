use std::{path::PathBuf, time::Duration};

use ssh2::{Session, Sftp};
use zeroize::Zeroizing;

use crate::{
    config::{ssh::SshTarget, HostKeyPolicy},
    remote::{ChannelError, CommandOutput, ConnectionError, Connector, RemoteChannel},
};

use self::{
    connect::{authenticate, configure_session, try_connection},
    host_key::verify_host_key,
};

mod connect;
mod exec;
mod host_key;
mod transfer;

/// How the session proves who we are. Secrets are wiped from memory on drop.
pub enum Credential {
    Password(Zeroizing<String>),
    KeyFile {
        path: PathBuf,
        passphrase: Option<Zeroizing<String>>,
    },
    Agent,
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Credential::Password(_) => f.write_str("Password(<redacted>)"),
            Credential::KeyFile { path, .. } => f
                .debug_struct("KeyFile")
                .field("path", path)
                .finish_non_exhaustive(),
            Credential::Agent => f.write_str("Agent"),
        }
    }
}

/// Everything needed to open a session to the deploy target.
#[derive(Debug)]
pub struct SshConnector {
    pub target: SshTarget,
    pub user: String,
    pub credential: Credential,
    pub host_key: HostKeyPolicy,
    pub known_hosts: PathBuf,
    pub timeout: Duration,
}

impl Connector for SshConnector {
    type Channel = SSHSession;

    fn open(&self) -> Result<SSHSession, ConnectionError> {
        SSHSession::open(self)
    }
}

/// An authenticated SSH session plus its SFTP subsystem.
pub struct SSHSession {
    session: Session,
    sftp: Option<Sftp>,
    address: String,
    closed: bool,
}

impl SSHSession {
    pub fn open(connector: &SshConnector) -> Result<Self, ConnectionError> {
        let target = &connector.target;
        let address = target.address();

        let stream = try_connection(&address, connector.timeout)?;
        tracing::debug!(
            peer = %stream.peer_addr().map(|addr| addr.to_string()).unwrap_or("[host]".to_string()),
            "connected"
        );

        let mut session = Session::new().map_err(|err| ConnectionError::Handshake {
            host: address.clone(),
            message: err.to_string(),
        })?;
        configure_session(&mut session, &target.params);
        session.set_timeout(timeout_millis(connector.timeout));
        session.set_tcp_stream(stream);
        session
            .handshake()
            .map_err(|err| ConnectionError::Handshake {
                host: address.clone(),
                message: err.to_string(),
            })?;

        verify_host_key(
            &session,
            &target.host,
            target.port,
            connector.host_key,
            &connector.known_hosts,
        )?;

        authenticate(&session, &connector.user, &connector.credential)?;

        if let Some(banner) = session.banner() {
            tracing::info!(%banner, "server banner");
        }

        let sftp = session.sftp().map_err(|err| ConnectionError::Sftp {
            message: err.to_string(),
        })?;

        tracing::info!(alias = %target.alias, %address, user = %connector.user, "session established");

        Ok(Self {
            session,
            sftp: Some(sftp),
            address,
            closed: false,
        })
    }

    fn sftp(&self) -> Result<&Sftp, ChannelError> {
        if self.closed {
            return Err(ChannelError::Closed);
        }
        self.sftp.as_ref().ok_or(ChannelError::Closed)
    }
}

impl RemoteChannel for SSHSession {
    fn execute_command(&mut self, command: &str) -> Result<CommandOutput, ChannelError> {
        if self.closed {
            return Err(ChannelError::Closed);
        }
        exec::execute(&self.session, command)
    }

    fn make_directory(&mut self, path: &str) -> Result<(), ChannelError> {
        transfer::make_directory(self.sftp()?, path)
    }

    fn upload_file(
        &mut self,
        local_path: &std::path::Path,
        remote_path: &str,
    ) -> Result<u64, ChannelError> {
        transfer::upload_file(self.sftp()?, local_path, remote_path)
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        // The SFTP subsystem has to go before the session it runs on.
        drop(self.sftp.take());
        if let Err(err) = self
            .session
            .disconnect(None, "deployment finished", None)
        {
            tracing::debug!(error = %err, "disconnect failed");
        }
        tracing::debug!(address = %self.address, "session closed");
    }
}

impl Drop for SSHSession {
    fn drop(&mut self) {
        self.close();
    }
}

fn timeout_millis(timeout: Duration) -> u32 {
    timeout.as_millis().try_into().unwrap_or(u32::MAX)
}
