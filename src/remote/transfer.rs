use std::path::PathBuf;

use crate::{
    adapter::fs::{DirectoryBatch, RemotePathMapping, TransferUnit, WalkError},
    progress::ProgressView,
};

use super::{CancelToken, ChannelError, RemoteChannel};

#[derive(Debug, Clone, Copy, Default)]
pub struct UploadOptions {
    /// Extra attempts for a file whose upload failed on the remote side.
    pub retries: u32,
}

#[derive(Debug)]
pub enum FailureReason {
    Upload(ChannelError),
    /// The file's directory (or one of its ancestors) could not be created.
    MissingDirectory { remote_dir: String },
}

#[derive(Debug)]
pub struct UploadFailure {
    pub unit: TransferUnit,
    pub reason: FailureReason,
}

#[derive(Debug)]
pub struct DirectoryFailure {
    pub remote_dir: String,
    pub error: ChannelError,
}

#[derive(Debug, Default)]
pub struct UploadReport {
    pub uploaded: Vec<TransferUnit>,
    pub bytes: u64,
    pub failed: Vec<UploadFailure>,
    pub directory_failures: Vec<DirectoryFailure>,
    pub walk_errors: Vec<WalkError>,
    pub cancelled: bool,
}

impl UploadReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
            && self.directory_failures.is_empty()
            && self.walk_errors.is_empty()
            && !self.cancelled
    }
}

/// Mirrors every batch of `walk` onto the remote side.
///
/// Each directory is created before its files are sent. A directory that cannot be created takes
/// its whole subtree down with it; a file that cannot be sent is recorded and the walk goes on.
pub fn upload_tree<C, W>(
    channel: &mut C,
    mapping: &RemotePathMapping,
    walk: W,
    options: UploadOptions,
    cancel: &CancelToken,
    progress: &mut ProgressView,
) -> UploadReport
where
    C: RemoteChannel + ?Sized,
    W: IntoIterator<Item = Result<DirectoryBatch, WalkError>>,
{
    let mut report = UploadReport::default();
    let mut failed_subtrees: Vec<(PathBuf, String)> = Vec::new();

    for batch in walk {
        let batch = match batch {
            Ok(batch) => batch,
            Err(err) => {
                tracing::warn!(error = %err, "local walk error");
                report.walk_errors.push(err);
                continue;
            }
        };

        let units = batch
            .files
            .iter()
            .map(|file| mapping.transfer_unit(&batch.relative_dir, file));

        if let Some((_, remote_dir)) = failed_subtrees
            .iter()
            .find(|(relative, _)| batch.relative_dir.starts_with(relative))
        {
            report.failed.extend(units.map(|unit| UploadFailure {
                unit,
                reason: FailureReason::MissingDirectory {
                    remote_dir: remote_dir.clone(),
                },
            }));
            continue;
        }

        if cancel.is_cancelled() {
            report.cancelled = true;
            return report;
        }

        let remote_dir = mapping.remote_dir(&batch.relative_dir);
        if let Err(error) = ensure_directory(channel, &remote_dir) {
            tracing::error!(%remote_dir, %error, "could not create remote directory");
            report.failed.extend(units.map(|unit| UploadFailure {
                unit,
                reason: FailureReason::MissingDirectory {
                    remote_dir: remote_dir.clone(),
                },
            }));
            failed_subtrees.push((batch.relative_dir.clone(), remote_dir.clone()));
            report
                .directory_failures
                .push(DirectoryFailure { remote_dir, error });
            continue;
        }

        for unit in units {
            if cancel.is_cancelled() {
                report.cancelled = true;
                return report;
            }

            match upload_with_retry(channel, &unit, options.retries) {
                Ok(bytes) => {
                    tracing::debug!(remote = %unit.remote_dest, bytes, "uploaded");
                    report.bytes += bytes;
                    progress.report_intermediate(
                        report.uploaded.len() + 1,
                        Some(&unit.path_name.display().to_string()),
                    );
                    report.uploaded.push(unit);
                }
                Err(error) => {
                    tracing::error!(remote = %unit.remote_dest, %error, "upload failed");
                    report.failed.push(UploadFailure {
                        unit,
                        reason: FailureReason::Upload(error),
                    });
                }
            }
        }
    }

    report
}

fn ensure_directory<C>(channel: &mut C, remote_dir: &str) -> Result<(), ChannelError>
where
    C: RemoteChannel + ?Sized,
{
    match channel.make_directory(remote_dir) {
        Ok(()) => {
            tracing::debug!(%remote_dir, "created directory");
            Ok(())
        }
        Err(ChannelError::AlreadyExists { .. }) => {
            tracing::debug!(%remote_dir, "directory already exists");
            Ok(())
        }
        Err(err) => Err(err),
    }
}

fn upload_with_retry<C>(
    channel: &mut C,
    unit: &TransferUnit,
    retries: u32,
) -> Result<u64, ChannelError>
where
    C: RemoteChannel + ?Sized,
{
    let mut attempt = 0;
    loop {
        match channel.upload_file(&unit.local_source, &unit.remote_dest) {
            Ok(bytes) => return Ok(bytes),
            // Retrying cannot fix a local read error or a dead channel.
            Err(err @ (ChannelError::Local { .. } | ChannelError::Closed)) => return Err(err),
            Err(err) if attempt < retries => {
                attempt += 1;
                tracing::warn!(remote = %unit.remote_dest, error = %err, attempt, "retrying upload");
            }
            Err(err) => return Err(err),
        }
    }
}
