use std::{
    fmt::Display,
    path::PathBuf,
    time::{Duration, Instant},
};

use thiserror::Error;
use uuid::Uuid;

use crate::{
    adapter::fs::{walk, RemotePathMapping, WalkOptions},
    progress::ProgressView,
    remote::{
        purge::{purge, ExclusionSet, PurgeError},
        transfer::{upload_tree, UploadOptions, UploadReport},
        CancelToken, ChannelLease, ConnectionError, Connector,
    },
};

/// What one run mirrors, and how.
#[derive(Debug, Clone)]
pub struct DeployPlan {
    pub mapping: RemotePathMapping,
    pub exclusions: ExclusionSet,
    pub walk: WalkOptions,
    pub upload: UploadOptions,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Prepare,
    Connect,
    Purge,
    Upload,
}

impl Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Phase::Prepare => "prepare",
            Phase::Connect => "connect",
            Phase::Purge => "purge",
            Phase::Upload => "upload",
        })
    }
}

/// Errors that end a run before the upload phase.
#[derive(Debug, Error)]
pub enum DeployError {
    #[error("local root {} is not a directory", .path.display())]
    LocalRoot { path: PathBuf },

    #[error(transparent)]
    Connect(#[from] ConnectionError),

    #[error(transparent)]
    Purge(#[from] PurgeError),
}

impl DeployError {
    pub fn phase(&self) -> Phase {
        match self {
            DeployError::LocalRoot { .. } => Phase::Prepare,
            DeployError::Connect(_) => Phase::Connect,
            DeployError::Purge(_) => Phase::Purge,
        }
    }
}

/// Final outcome of a run. Built once when the run ends.
#[derive(Debug)]
pub struct DeploymentResult {
    pub run_id: Uuid,
    pub fatal: Option<DeployError>,
    pub report: UploadReport,
    pub elapsed: Duration,
}

impl DeploymentResult {
    pub fn is_success(&self) -> bool {
        self.fatal.is_none() && self.report.is_clean()
    }

    pub fn cancelled(&self) -> bool {
        self.report.cancelled
    }

    pub fn failed_phase(&self) -> Option<Phase> {
        if let Some(fatal) = &self.fatal {
            return Some(fatal.phase());
        }
        (!self.report.is_clean() && !self.report.cancelled).then_some(Phase::Upload)
    }

    /// 0 on success, otherwise a code telling the failing phase apart.
    pub fn exit_code(&self) -> u8 {
        if self.cancelled() {
            return 130;
        }
        match self.failed_phase() {
            None => 0,
            Some(Phase::Prepare | Phase::Connect) => 2,
            Some(Phase::Purge) => 3,
            Some(Phase::Upload) => 4,
        }
    }
}

/// Runs one deployment: connect, purge, then walk and upload.
///
/// The channel is released on every path out of here, including early returns and panics
/// unwinding through the lease.
pub fn deploy<K: Connector>(
    connector: &K,
    plan: &DeployPlan,
    cancel: &CancelToken,
    progress: &mut ProgressView,
) -> DeploymentResult {
    let run_id = Uuid::now_v7();
    let span = tracing::info_span!("deploy", %run_id, remote_root = plan.mapping.remote_root());
    let _entered = span.enter();
    let started = Instant::now();

    let finish = |fatal: Option<DeployError>, report: UploadReport| {
        if let Some(fatal) = &fatal {
            tracing::error!(phase = %fatal.phase(), error = %fatal, "deployment failed");
        }
        DeploymentResult {
            run_id,
            fatal,
            report,
            elapsed: started.elapsed(),
        }
    };
    let cancelled = || UploadReport {
        cancelled: true,
        ..UploadReport::default()
    };

    let local_root = plan.mapping.local_root();
    if !local_root.is_dir() {
        let fatal = DeployError::LocalRoot {
            path: local_root.to_path_buf(),
        };
        return finish(Some(fatal), UploadReport::default());
    }
    if cancel.is_cancelled() {
        return finish(None, cancelled());
    }

    progress.begin("Connecting to the host");
    let channel = match connector.open() {
        Ok(channel) => channel,
        Err(err) => {
            progress.failure(Some(&err.to_string()));
            return finish(Some(err.into()), UploadReport::default());
        }
    };
    let mut lease = ChannelLease::new(channel);
    progress.success(None);

    if cancel.is_cancelled() {
        lease.release();
        return finish(None, cancelled());
    }

    tracing::info!(exclusions = ?plan.exclusions, "purging remote root");
    progress.begin("Purging remote root");
    if let Err(err) = purge(&mut *lease, plan.mapping.remote_root(), &plan.exclusions) {
        progress.failure(Some(&err.to_string()));
        lease.release();
        return finish(Some(err.into()), UploadReport::default());
    }
    progress.success(None);

    tracing::info!(local_root = %local_root.display(), "uploading tree");
    progress.begin("Uploading files");
    let report = upload_tree(
        &mut *lease,
        &plan.mapping,
        walk(local_root, plan.walk),
        plan.upload,
        cancel,
        progress,
    );
    let summary = format!("{} files, {} bytes", report.uploaded.len(), report.bytes);
    if report.is_clean() {
        progress.success(Some(&summary));
    } else {
        progress.failure(Some(&summary));
    }

    lease.release();
    tracing::info!(
        uploaded = report.uploaded.len(),
        failed = report.failed.len(),
        cancelled = report.cancelled,
        "deployment finished"
    );

    finish(None, report)
}
