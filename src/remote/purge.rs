use std::collections::BTreeSet;

use thiserror::Error;

use crate::util::shell_escape;

use super::{ChannelError, RemoteChannel};

/// Top-level names under the remote root that survive a purge.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExclusionSet(BTreeSet<String>);

impl ExclusionSet {
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(names.into_iter().map(Into::into).collect())
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }
}

#[derive(Debug, Error)]
pub enum PurgeError {
    #[error("purge command exited with status {status}: {stderr}")]
    Failed { status: i32, stderr: String },

    #[error(transparent)]
    Channel(#[from] ChannelError),
}

/// Builds the one command that removes every child of `remote_root` not named in `exclusions`.
///
/// A missing `remote_root` makes the command a no-op. `-H` lets a symlinked root be purged
/// through its target, matching what `[ -d ]` saw.
pub fn purge_command(remote_root: &str, exclusions: &ExclusionSet) -> String {
    let root = shell_escape(remote_root);
    let keep: String = exclusions
        .iter()
        .map(|name| format!(" ! -name {}", shell_escape(&escape_find_pattern(name))))
        .collect();

    format!(
        "if [ -d {root} ]; then find -H {root} -mindepth 1 -maxdepth 1{keep} -exec rm -rf -- {{}} +; fi"
    )
}

/// `find -name` takes a glob, so pattern characters are escaped to match literally.
fn escape_find_pattern(name: &str) -> String {
    let mut escaped = String::with_capacity(name.len());
    for c in name.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

pub fn purge(
    channel: &mut impl RemoteChannel,
    remote_root: &str,
    exclusions: &ExclusionSet,
) -> Result<(), PurgeError> {
    let command = purge_command(remote_root, exclusions);
    tracing::debug!(%command, "purging remote root");

    let output = channel.execute_command(&command)?;
    tracing::debug!(exit_code = output.exit_code, stdout = %output.stdout.trim(), "purge finished");
    if !output.success() {
        return Err(PurgeError::Failed {
            status: output.exit_code,
            stderr: output.stderr.trim().to_string(),
        });
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::{collections::BTreeSet, fs, path::Path};

    use tempfile::TempDir;

    use super::*;
    use crate::remote::testing::LocalChannel;

    fn entries(dir: &Path) -> BTreeSet<String> {
        fs::read_dir(dir)
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .collect()
    }

    fn populate(dir: &Path, names: &[&str]) {
        for name in names {
            if name.contains('.') {
                fs::write(dir.join(name), "x").unwrap();
            } else {
                fs::create_dir_all(dir.join(name).join("nested")).unwrap();
                fs::write(dir.join(name).join("nested").join("keep.txt"), "x").unwrap();
            }
        }
    }

    #[test]
    fn command_escapes_root_and_names() {
        let command = purge_command("/var/www/it's", &ExclusionSet::new(["api", "up loads"]));

        assert_eq!(
            command,
            "if [ -d '/var/www/it'\\''s' ]; then find -H '/var/www/it'\\''s' -mindepth 1 -maxdepth 1 \
             ! -name 'api' ! -name 'up loads' -exec rm -rf -- {} +; fi"
        );
    }

    #[test]
    fn pattern_characters_are_literal() {
        assert_eq!(escape_find_pattern("a*b?[c]"), "a\\*b\\?\\[c\\]");
    }

    #[cfg(unix)]
    #[test]
    fn survivors_are_exactly_the_excluded_entries() {
        let remote = TempDir::new().unwrap();
        populate(remote.path(), &["api", "uploads", "old_build", "index.html", "assets"]);
        let exclusions = ExclusionSet::new(["api", "uploads", "never-existed"]);

        let mut channel = LocalChannel::new();
        purge(&mut channel, &remote.path().to_string_lossy(), &exclusions).unwrap();

        assert_eq!(
            entries(remote.path()),
            BTreeSet::from(["api".to_string(), "uploads".to_string()])
        );
        assert!(remote.path().join("api/nested/keep.txt").exists());
        assert!(remote.path().exists());
    }

    #[cfg(unix)]
    #[test]
    fn empty_exclusion_set_clears_everything_but_the_root() {
        let remote = TempDir::new().unwrap();
        populate(remote.path(), &["a", "b.txt", ".hidden"]);

        let mut channel = LocalChannel::new();
        purge(&mut channel, &remote.path().to_string_lossy(), &ExclusionSet::default()).unwrap();

        assert!(entries(remote.path()).is_empty());
        assert!(remote.path().is_dir());
    }

    #[cfg(unix)]
    #[test]
    fn exclusion_matching_is_exact() {
        let remote = TempDir::new().unwrap();
        populate(remote.path(), &["api", "api-v2", "apix"]);
        fs::create_dir(remote.path().join("a*")).unwrap();

        let mut channel = LocalChannel::new();
        purge(
            &mut channel,
            &remote.path().to_string_lossy(),
            &ExclusionSet::new(["a*", "api"]),
        )
        .unwrap();

        assert_eq!(
            entries(remote.path()),
            BTreeSet::from(["a*".to_string(), "api".to_string()])
        );
    }

    #[cfg(unix)]
    #[test]
    fn symlinked_root_is_purged_through_its_target() {
        let remote = TempDir::new().unwrap();
        let release = remote.path().join("release");
        fs::create_dir(&release).unwrap();
        populate(&release, &["api", "old_build", "index.html"]);
        let site = remote.path().join("site");
        std::os::unix::fs::symlink(&release, &site).unwrap();

        let mut channel = LocalChannel::new();
        purge(&mut channel, &site.to_string_lossy(), &ExclusionSet::new(["api"])).unwrap();

        assert_eq!(entries(&release), BTreeSet::from(["api".to_string()]));
        assert!(fs::symlink_metadata(&site).unwrap().file_type().is_symlink());
    }

    #[cfg(unix)]
    #[test]
    fn missing_remote_root_is_a_no_op() {
        let remote = TempDir::new().unwrap();
        let root = remote.path().join("first-deploy");

        let mut channel = LocalChannel::new();
        purge(&mut channel, &root.to_string_lossy(), &ExclusionSet::new(["api"])).unwrap();

        assert!(!root.exists());
    }

    #[test]
    fn non_zero_exit_becomes_purge_error() {
        let mut channel = LocalChannel::new().fail_commands();
        let err = purge(&mut channel, "/srv/site", &ExclusionSet::default()).unwrap_err();

        match err {
            PurgeError::Failed { status, stderr } => {
                assert_eq!(status, 1);
                assert_eq!(stderr, "Permission denied");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn closed_channel_is_a_channel_error() {
        let mut channel = LocalChannel::new();
        channel.close();

        let err = purge(&mut channel, "/srv/site", &ExclusionSet::default()).unwrap_err();
        assert!(matches!(err, PurgeError::Channel(ChannelError::Closed)));
    }
}
