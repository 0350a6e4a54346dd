use std::{
    io::{self, Read},
    thread,
    time::{Duration, Instant},
};

use ssh2::{Channel, Session};

use crate::remote::{ChannelError, CommandOutput};

const POLL_INTERVAL: Duration = Duration::from_millis(10);
const CHUNK: usize = 16 * 1024;

/// Runs `line` in an exec channel and waits for it to finish.
///
/// stdout and stderr are drained together until EOF, then the close is awaited before the exit
/// status is read. Draining one stream at a time lets the other fill the channel window and
/// stall the remote process.
pub(super) fn execute(session: &Session, line: &str) -> Result<CommandOutput, ChannelError> {
    let command_error = |err: ssh2::Error| ChannelError::Command {
        message: err.to_string(),
    };

    let mut channel = session.channel_session().map_err(command_error)?;
    channel.exec(line).map_err(command_error)?;

    let idle_limit = match session.timeout() {
        0 => None,
        millis => Some(Duration::from_millis(millis.into())),
    };

    let mut stdout = Vec::new();
    let mut stderr = Vec::new();
    session.set_blocking(false);
    let drained = drain(&mut channel, &mut stdout, &mut stderr, idle_limit);
    session.set_blocking(true);
    drained?;

    channel.wait_close().map_err(command_error)?;
    let exit_code = channel.exit_status().map_err(command_error)?;

    tracing::debug!(exit_code, "remote command finished");

    Ok(CommandOutput {
        exit_code,
        stdout: String::from_utf8_lossy(&stdout).into_owned(),
        stderr: String::from_utf8_lossy(&stderr).into_owned(),
    })
}

/// The two output streams of a running command, read without blocking.
trait OutputStreams {
    fn stdout(&mut self) -> &mut dyn Read;
    fn stderr(&mut self) -> Box<dyn Read + '_>;
    fn eof(&self) -> bool;
}

impl OutputStreams for Channel {
    fn stdout(&mut self) -> &mut dyn Read {
        self
    }

    fn stderr(&mut self) -> Box<dyn Read + '_> {
        Box::new(Channel::stderr(self))
    }

    fn eof(&self) -> bool {
        Channel::eof(self)
    }
}

fn drain(
    streams: &mut impl OutputStreams,
    stdout: &mut Vec<u8>,
    stderr: &mut Vec<u8>,
    idle_limit: Option<Duration>,
) -> Result<(), ChannelError> {
    let read_error = |err: io::Error| ChannelError::Command {
        message: format!("reading command output: {err}"),
    };
    let mut last_activity = Instant::now();

    loop {
        let read = read_available(streams.stdout(), stdout).map_err(read_error)?
            + read_available(&mut streams.stderr(), stderr).map_err(read_error)?;

        if read > 0 {
            last_activity = Instant::now();
            continue;
        }
        if streams.eof() {
            return Ok(());
        }
        if idle_limit.is_some_and(|limit| last_activity.elapsed() > limit) {
            return Err(ChannelError::Command {
                message: "timed out waiting for command output".to_string(),
            });
        }
        thread::sleep(POLL_INTERVAL);
    }
}

/// Reads whatever is buffered right now. Stops at EOF or when the read would block.
fn read_available(reader: &mut dyn Read, into: &mut Vec<u8>) -> io::Result<usize> {
    let mut buf = [0u8; CHUNK];
    let mut total = 0;

    loop {
        match reader.read(&mut buf) {
            Ok(0) => return Ok(total),
            Ok(n) => {
                into.extend_from_slice(&buf[..n]);
                total += n;
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(total),
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use super::*;

    /// Hands out chunks; an empty queue means "would block" until `closed` is set.
    #[derive(Default)]
    struct Scripted {
        chunks: VecDeque<Vec<u8>>,
        closed: bool,
    }

    impl Read for Scripted {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            match self.chunks.pop_front() {
                Some(chunk) => {
                    buf[..chunk.len()].copy_from_slice(&chunk);
                    Ok(chunk.len())
                }
                None if self.closed => Ok(0),
                None => Err(io::ErrorKind::WouldBlock.into()),
            }
        }
    }

    /// stdout produces nothing until every stderr chunk has been consumed, the way a remote
    /// process stalls once the stderr window is full.
    struct StalledOnStderr {
        stdout: Scripted,
        stderr: Scripted,
        stdout_pending: Option<Vec<u8>>,
    }

    impl OutputStreams for StalledOnStderr {
        fn stdout(&mut self) -> &mut dyn Read {
            if self.stderr.chunks.is_empty() {
                if let Some(chunk) = self.stdout_pending.take() {
                    self.stdout.chunks.push_back(chunk);
                    self.stdout.closed = true;
                    self.stderr.closed = true;
                }
            }
            &mut self.stdout
        }

        fn stderr(&mut self) -> Box<dyn Read + '_> {
            Box::new(&mut self.stderr)
        }

        fn eof(&self) -> bool {
            self.stdout.closed && self.stderr.closed
        }
    }

    #[test]
    fn stderr_is_drained_while_stdout_waits() {
        let mut streams = StalledOnStderr {
            stdout: Scripted::default(),
            stderr: Scripted {
                chunks: (0..3).map(|i| format!("rm: warning {i}\n").into_bytes()).collect(),
                closed: false,
            },
            stdout_pending: Some(b"done\n".to_vec()),
        };
        let (mut stdout, mut stderr) = (Vec::new(), Vec::new());

        drain(
            &mut streams,
            &mut stdout,
            &mut stderr,
            Some(Duration::from_secs(5)),
        )
        .unwrap();

        assert_eq!(stdout, b"done\n");
        assert_eq!(
            String::from_utf8(stderr).unwrap(),
            "rm: warning 0\nrm: warning 1\nrm: warning 2\n"
        );
    }

    #[test]
    fn silent_command_times_out() {
        let mut streams = StalledOnStderr {
            stdout: Scripted::default(),
            stderr: Scripted::default(),
            stdout_pending: None,
        };

        let err = drain(
            &mut streams,
            &mut Vec::new(),
            &mut Vec::new(),
            Some(Duration::from_millis(30)),
        )
        .unwrap_err();

        assert!(matches!(err, ChannelError::Command { .. }));
    }

    #[test]
    fn read_available_stops_when_nothing_is_buffered() {
        let mut reader = Scripted {
            chunks: VecDeque::from([b"ab".to_vec(), b"cd".to_vec()]),
            closed: false,
        };
        let mut into = Vec::new();

        assert_eq!(read_available(&mut reader, &mut into).unwrap(), 4);
        assert_eq!(into, b"abcd");
        assert_eq!(read_available(&mut reader, &mut into).unwrap(), 0);
    }
}
