//! A [`RemoteChannel`] backed by a local directory, used by the tests.
//!
//! Remote paths are plain absolute paths on this machine (usually inside a `TempDir`). Commands
//! go through `sh -c`, so the purge command text is exercised against the real `find`/`rm`.

use std::{
    collections::HashSet,
    fs, io,
    path::Path,
    process::Command,
    sync::{Arc, Mutex},
};

use super::{CancelToken, ChannelError, CommandOutput, ConnectionError, Connector, RemoteChannel};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Execute(String),
    MakeDirectory(String),
    Upload(String),
    Close,
}

/// Call history shared between a channel and the test that created it.
#[derive(Debug, Clone, Default)]
pub struct CallLog(Arc<Mutex<Vec<Call>>>);

impl CallLog {
    fn push(&self, call: Call) {
        self.0.lock().unwrap().push(call);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.0.lock().unwrap().clone()
    }

    pub fn close_count(&self) -> usize {
        self.calls().iter().filter(|call| **call == Call::Close).count()
    }

    pub fn position(&self, call: &Call) -> Option<usize> {
        self.calls().iter().position(|logged| logged == call)
    }

    pub fn uploads(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::Upload(path) => Some(path),
                _ => None,
            })
            .collect()
    }
}

pub struct LocalChannel {
    log: CallLog,
    failing_uploads: HashSet<String>,
    failing_directories: HashSet<String>,
    flaky_uploads: HashSet<String>,
    failing_commands: bool,
    cancel_on_upload: Option<CancelToken>,
    closed: bool,
}

impl LocalChannel {
    pub fn new() -> Self {
        Self {
            log: CallLog::default(),
            failing_uploads: HashSet::new(),
            failing_directories: HashSet::new(),
            flaky_uploads: HashSet::new(),
            failing_commands: false,
            cancel_on_upload: None,
            closed: false,
        }
    }

    pub fn with_log(mut self, log: CallLog) -> Self {
        self.log = log;
        self
    }

    pub fn log(&self) -> CallLog {
        self.log.clone()
    }

    /// Every upload to `remote_path` fails.
    pub fn fail_upload(mut self, remote_path: impl Into<String>) -> Self {
        self.failing_uploads.insert(remote_path.into());
        self
    }

    /// The first upload to `remote_path` fails, later attempts succeed.
    pub fn flaky_upload(mut self, remote_path: impl Into<String>) -> Self {
        self.flaky_uploads.insert(remote_path.into());
        self
    }

    /// Creating `remote_path` fails with something other than "already exists".
    pub fn fail_directory(mut self, remote_path: impl Into<String>) -> Self {
        self.failing_directories.insert(remote_path.into());
        self
    }

    /// Every command exits with status 1 without running.
    pub fn fail_commands(mut self) -> Self {
        self.failing_commands = true;
        self
    }

    /// The first upload goes through and then cancels `token`, as a Ctrl-C mid-run would.
    pub fn cancel_on_upload(mut self, token: CancelToken) -> Self {
        self.cancel_on_upload = Some(token);
        self
    }

    fn ensure_open(&self) -> Result<(), ChannelError> {
        if self.closed {
            return Err(ChannelError::Closed);
        }
        Ok(())
    }
}

impl RemoteChannel for LocalChannel {
    fn execute_command(&mut self, command: &str) -> Result<CommandOutput, ChannelError> {
        self.ensure_open()?;
        self.log.push(Call::Execute(command.to_string()));

        if self.failing_commands {
            return Ok(CommandOutput {
                exit_code: 1,
                stdout: String::new(),
                stderr: "Permission denied".to_string(),
            });
        }

        let output = Command::new("sh")
            .arg("-c")
            .arg(command)
            .output()
            .map_err(|err| ChannelError::Command {
                message: err.to_string(),
            })?;

        Ok(CommandOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    fn make_directory(&mut self, path: &str) -> Result<(), ChannelError> {
        self.ensure_open()?;
        self.log.push(Call::MakeDirectory(path.to_string()));

        if self.failing_directories.contains(path) {
            return Err(ChannelError::Remote {
                path: path.to_string(),
                message: "permission denied".to_string(),
            });
        }

        match fs::create_dir(path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists && Path::new(path).is_dir() => {
                Err(ChannelError::AlreadyExists {
                    path: path.to_string(),
                })
            }
            Err(err) => Err(ChannelError::Remote {
                path: path.to_string(),
                message: err.to_string(),
            }),
        }
    }

    fn upload_file(&mut self, local_path: &Path, remote_path: &str) -> Result<u64, ChannelError> {
        self.ensure_open()?;
        self.log.push(Call::Upload(remote_path.to_string()));

        if let Some(token) = self.cancel_on_upload.take() {
            token.cancel();
        }

        if self.failing_uploads.contains(remote_path) || self.flaky_uploads.remove(remote_path) {
            return Err(ChannelError::Remote {
                path: remote_path.to_string(),
                message: "connection reset".to_string(),
            });
        }

        let content = fs::read(local_path).map_err(|source| ChannelError::Local {
            path: local_path.to_path_buf(),
            source,
        })?;
        fs::write(remote_path, &content).map_err(|err| ChannelError::Remote {
            path: remote_path.to_string(),
            message: err.to_string(),
        })?;

        Ok(content.len() as u64)
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.log.push(Call::Close);
    }
}

/// Hands out [`LocalChannel`]s built by a closure, or refuses to connect.
pub struct LocalConnector<F> {
    build: Option<F>,
}

impl<F: Fn() -> LocalChannel> LocalConnector<F> {
    pub fn new(build: F) -> Self {
        Self { build: Some(build) }
    }
}

impl LocalConnector<fn() -> LocalChannel> {
    pub fn unreachable() -> Self {
        Self { build: None }
    }
}

impl<F: Fn() -> LocalChannel> Connector for LocalConnector<F> {
    type Channel = LocalChannel;

    fn open(&self) -> Result<LocalChannel, ConnectionError> {
        match &self.build {
            Some(build) => Ok(build()),
            None => Err(ConnectionError::Unreachable {
                host: "test.invalid:22".to_string(),
            }),
        }
    }
}
