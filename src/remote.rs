use std::{
    ops::{Deref, DerefMut},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use thiserror::Error;

pub mod purge;
pub mod transfer;

#[cfg(test)]
pub mod testing;

/// Output of a remote command, collected after both streams reached EOF.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

#[derive(Debug, Error)]
pub enum ChannelError {
    /// The directory is already there. Callers creating directories treat this as success.
    #[error("{path} already exists")]
    AlreadyExists { path: String },

    #[error("remote I/O failed on {path}: {message}")]
    Remote { path: String, message: String },

    #[error("could not read local file {}: {source}", .path.display())]
    Local {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("remote command could not be run: {message}")]
    Command { message: String },

    #[error("the channel is already closed")]
    Closed,
}

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("could not resolve {host}: {source}")]
    Resolve {
        host: String,
        #[source]
        source: std::io::Error,
    },

    #[error("could not reach {host}")]
    Unreachable { host: String },

    #[error("SSH handshake with {host} failed: {message}")]
    Handshake { host: String, message: String },

    #[error("host key for {host} rejected: {reason}")]
    HostKey { host: String, reason: String },

    #[error("authentication as {user} failed: {message}")]
    Authentication { user: String, message: String },

    #[error("could not start the SFTP subsystem: {message}")]
    Sftp { message: String },
}

/// A single authenticated connection to the deploy target.
///
/// Implementations are not expected to be safe for concurrent use, so every method takes
/// `&mut self` and the channel is owned by exactly one deployment run.
pub trait RemoteChannel {
    fn execute_command(&mut self, command: &str) -> Result<CommandOutput, ChannelError>;

    /// Creates a single directory. Parents are not created.
    fn make_directory(&mut self, path: &str) -> Result<(), ChannelError>;

    /// Copies a local file to `remote_path`, replacing whatever is there. Returns the byte count.
    fn upload_file(&mut self, local_path: &Path, remote_path: &str) -> Result<u64, ChannelError>;

    /// Releases the connection. Calling it again is a no-op.
    fn close(&mut self);
}

/// Opens channels to one configured target.
pub trait Connector {
    type Channel: RemoteChannel;

    fn open(&self) -> Result<Self::Channel, ConnectionError>;
}

/// Scoped ownership of an open channel: the channel is closed when the lease goes away,
/// whichever way the run ends.
pub struct ChannelLease<C: RemoteChannel> {
    channel: C,
}

impl<C: RemoteChannel> ChannelLease<C> {
    pub fn new(channel: C) -> Self {
        Self { channel }
    }

    pub fn release(mut self) {
        self.channel.close();
    }
}

impl<C: RemoteChannel> Deref for ChannelLease<C> {
    type Target = C;

    fn deref(&self) -> &C {
        &self.channel
    }
}

impl<C: RemoteChannel> DerefMut for ChannelLease<C> {
    fn deref_mut(&mut self) -> &mut C {
        &mut self.channel
    }
}

impl<C: RemoteChannel> Drop for ChannelLease<C> {
    fn drop(&mut self) {
        self.channel.close();
    }
}

/// Shared flag set from the signal handler and polled between remote operations.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}
