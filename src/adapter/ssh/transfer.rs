use std::{
    fs::File,
    io::{self, Read, Write},
    path::Path,
};

use ssh2::Sftp;

use crate::remote::ChannelError;

const DIRECTORY_MODE: i32 = 0o755;

/// `mkdir` over SFTP. Servers disagree on the status code for an existing directory, so a
/// failure is followed by a `stat` to tell "already there" apart from real errors.
pub(super) fn make_directory(sftp: &Sftp, path: &str) -> Result<(), ChannelError> {
    let remote = Path::new(path);

    let Err(err) = sftp.mkdir(remote, DIRECTORY_MODE) else {
        return Ok(());
    };

    match sftp.stat(remote) {
        Ok(stat) if stat.is_dir() => Err(ChannelError::AlreadyExists {
            path: path.to_string(),
        }),
        _ => Err(ChannelError::Remote {
            path: path.to_string(),
            message: err.to_string(),
        }),
    }
}

/// Streams a local file into `remote_path`, truncating whatever was there.
pub(super) fn upload_file(
    sftp: &Sftp,
    local_source: &Path,
    remote_path: &str,
) -> Result<u64, ChannelError> {
    let mut local = File::open(local_source).map_err(|source| ChannelError::Local {
        path: local_source.to_path_buf(),
        source,
    })?;

    let remote_error = |message: String| ChannelError::Remote {
        path: remote_path.to_string(),
        message,
    };

    let mut remote = sftp
        .create(Path::new(remote_path))
        .map_err(|err| remote_error(err.to_string()))?;
    let written = copy_stream(&mut local, &mut remote, local_source, remote_path)?;
    remote
        .close()
        .map_err(|err| remote_error(err.to_string()))?;

    Ok(written)
}

/// `io::copy` with the two sides kept apart: read failures are local, write failures remote.
fn copy_stream(
    reader: &mut impl Read,
    writer: &mut impl Write,
    local_source: &Path,
    remote_path: &str,
) -> Result<u64, ChannelError> {
    let mut buf = [0u8; 32 * 1024];
    let mut written = 0u64;

    loop {
        let read = match reader.read(&mut buf) {
            Ok(0) => return Ok(written),
            Ok(n) => n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(source) => {
                return Err(ChannelError::Local {
                    path: local_source.to_path_buf(),
                    source,
                })
            }
        };
        writer
            .write_all(&buf[..read])
            .map_err(|err| ChannelError::Remote {
                path: remote_path.to_string(),
                message: err.to_string(),
            })?;
        written += read as u64;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Broken;

    impl Read for Broken {
        fn read(&mut self, _: &mut [u8]) -> io::Result<usize> {
            Err(io::Error::new(io::ErrorKind::Other, "input/output error"))
        }
    }

    impl Write for Broken {
        fn write(&mut self, _: &[u8]) -> io::Result<usize> {
            Err(io::Error::new(io::ErrorKind::Other, "connection lost"))
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn copies_everything_and_counts_bytes() {
        let mut remote = Vec::new();
        let written = copy_stream(
            &mut &b"hello world"[..],
            &mut remote,
            Path::new("dist/a.txt"),
            "/srv/a.txt",
        )
        .unwrap();

        assert_eq!(written, 11);
        assert_eq!(remote, b"hello world");
    }

    #[test]
    fn read_failure_is_local() {
        let err = copy_stream(
            &mut Broken,
            &mut Vec::new(),
            Path::new("dist/a.txt"),
            "/srv/a.txt",
        )
        .unwrap_err();

        match err {
            ChannelError::Local { path, .. } => assert_eq!(path, Path::new("dist/a.txt")),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn write_failure_is_remote() {
        let err = copy_stream(
            &mut &b"hello"[..],
            &mut Broken,
            Path::new("dist/a.txt"),
            "/srv/a.txt",
        )
        .unwrap_err();

        assert!(matches!(err, ChannelError::Remote { path, .. } if path == "/srv/a.txt"));
    }
}
