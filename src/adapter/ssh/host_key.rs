use std::path::Path;

use ssh2::{CheckResult, HashType, KnownHostFileKind, Session};

use crate::{config::HostKeyPolicy, remote::ConnectionError};

/// Decides whether to trust the key the server presented during the handshake.
pub(super) fn verify_host_key(
    session: &Session,
    host: &str,
    port: u16,
    policy: HostKeyPolicy,
    known_hosts_path: &Path,
) -> Result<(), ConnectionError> {
    let display_host = known_hosts_name(host, port);
    let reject = |reason: String| ConnectionError::HostKey {
        host: display_host.clone(),
        reason,
    };

    let (key, key_type) = session
        .host_key()
        .ok_or_else(|| reject("server presented no host key".to_string()))?;
    let fingerprint = session
        .host_key_hash(HashType::Sha256)
        .map(fingerprint)
        .unwrap_or_default();

    let mut known_hosts = session
        .known_hosts()
        .map_err(|err| reject(err.to_string()))?;
    if known_hosts_path.exists() {
        if let Err(err) = known_hosts.read_file(known_hosts_path, KnownHostFileKind::OpenSSH) {
            if policy != HostKeyPolicy::AcceptAny {
                return Err(reject(format!("reading {}: {err}", known_hosts_path.display())));
            }
            tracing::debug!(error = %err, "ignoring unreadable known_hosts");
        }
    }

    match decide(policy, known_hosts.check_port(host, port, key)) {
        Verdict::Trusted => {
            tracing::debug!(host = %display_host, %fingerprint, "host key verified");
            Ok(())
        }
        Verdict::Unverified => {
            tracing::warn!(host = %display_host, %fingerprint, "host key NOT verified (accept_any)");
            Ok(())
        }
        Verdict::Record => {
            known_hosts
                .add(&display_host, key, "added by mirror-deploy", key_type.into())
                .map_err(|err| reject(err.to_string()))?;
            if let Some(parent) = known_hosts_path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|err| reject(format!("creating {}: {err}", parent.display())))?;
            }
            known_hosts
                .write_file(known_hosts_path, KnownHostFileKind::OpenSSH)
                .map_err(|err| reject(format!("writing {}: {err}", known_hosts_path.display())))?;
            tracing::warn!(host = %display_host, %fingerprint, "new host key added to known_hosts");
            Ok(())
        }
        Verdict::Reject(Rejection::Mismatch) => Err(reject(format!(
            "key {fingerprint} does not match {}; the host may have been reinstalled or the connection intercepted",
            known_hosts_path.display()
        ))),
        Verdict::Reject(Rejection::Unknown) => Err(reject(format!(
            "no entry in {} (key {fingerprint}); add it with ssh-keyscan or use host_key: accept_new",
            known_hosts_path.display()
        ))),
        Verdict::Reject(Rejection::CheckFailed) => {
            Err(reject("known_hosts check failed".to_string()))
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Verdict {
    /// known_hosts vouches for the key.
    Trusted,
    /// Accepted without looking at known_hosts.
    Unverified,
    /// Accepted and appended to known_hosts.
    Record,
    Reject(Rejection),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Rejection {
    Mismatch,
    Unknown,
    CheckFailed,
}

/// What each policy does with a known_hosts lookup. A mismatch is only ever accepted by
/// `accept_any`.
fn decide(policy: HostKeyPolicy, check: CheckResult) -> Verdict {
    match (policy, check) {
        (HostKeyPolicy::AcceptAny, _) => Verdict::Unverified,
        (_, CheckResult::Match) => Verdict::Trusted,
        (_, CheckResult::Mismatch) => Verdict::Reject(Rejection::Mismatch),
        (HostKeyPolicy::AcceptNew, CheckResult::NotFound) => Verdict::Record,
        (HostKeyPolicy::Strict, CheckResult::NotFound) => Verdict::Reject(Rejection::Unknown),
        (_, CheckResult::Failure) => Verdict::Reject(Rejection::CheckFailed),
    }
}

/// OpenSSH writes non-default ports as `[host]:port`.
fn known_hosts_name(host: &str, port: u16) -> String {
    if port == 22 {
        host.to_string()
    } else {
        format!("[{host}]:{port}")
    }
}

fn fingerprint(hash: &[u8]) -> String {
    let hex: Vec<String> = hash.iter().map(|byte| format!("{byte:02x}")).collect();
    format!("SHA256:{}", hex.join(":"))
}
