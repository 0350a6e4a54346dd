use std::{
    fs::File,
    io::BufReader,
    path::{Component, Path, PathBuf},
    time::Duration,
};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use zeroize::Zeroizing;

use crate::{
    adapter::ssh::Credential,
    remote::purge::ExclusionSet,
    util::{expand_home, read_from_stdin},
};

pub mod ssh;

pub const DEFAULT_CONFIG_FILE: &str = "./mirror.yaml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not open {}: {source}", .path.display())]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("could not parse {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("could not read credential: {0}")]
    Credential(String),
}

pub fn read_config(path: Option<PathBuf>) -> Result<ConfigContext, ConfigError> {
    let path = path.unwrap_or(DEFAULT_CONFIG_FILE.into());
    let file = File::open(&path).map_err(|source| ConfigError::Open {
        path: path.clone(),
        source,
    })?;
    let reader = BufReader::new(file);

    let config: Configuration =
        serde_yaml::from_reader(reader).map_err(|source| ConfigError::Parse {
            path: path.clone(),
            source,
        })?;

    let Configuration::Deploy(definition) = &config;
    definition.validate()?;

    Ok(ConfigContext {
        config,
        config_file: path,
    })
}

pub struct ConfigContext {
    pub config_file: PathBuf,
    pub config: Configuration,
}

impl ConfigContext {
    pub fn deploy(&self) -> &DeployDefinition {
        let Configuration::Deploy(definition) = &self.config;
        definition
    }

    /// `mirror.source`, relative paths being taken from the config file's directory.
    pub fn local_root(&self) -> PathBuf {
        let source = expand_home(&self.deploy().mirror.source);
        if source.is_absolute() {
            return source;
        }
        self.config_file
            .parent()
            .map(|dir| dir.join(&source))
            .unwrap_or(source)
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Configuration {
    #[serde(alias = "deploy")]
    Deploy(DeployDefinition),
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DeployDefinition {
    pub host: DeployHost,
    #[serde(default)]
    pub auth: AuthConfig,
    pub mirror: MirrorDefinition,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DeployHost {
    /// Hostname or `~/.ssh/config` alias.
    pub name: String,
    pub user: Option<String>,
    pub port: Option<u16>,

    #[serde(default)]
    pub host_key: HostKeyPolicy,
    pub known_hosts: Option<PathBuf>,

    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl DeployHost {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn known_hosts_path(&self) -> PathBuf {
        match &self.known_hosts {
            Some(path) => expand_home(path),
            None => expand_home(Path::new("~/.ssh/known_hosts")),
        }
    }
}

fn default_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
#[value(rename_all = "snake_case")]
pub enum HostKeyPolicy {
    /// Only hosts already in known_hosts are trusted.
    #[default]
    Strict,
    /// Unknown hosts are added to known_hosts; changed keys are still refused.
    AcceptNew,
    /// No verification at all.
    AcceptAny,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum AuthConfig {
    Password {
        /// Environment variable holding the password. Prompted for when unset.
        env: Option<String>,
    },
    Key {
        /// Falls back to the first `IdentityFile` of the ssh config.
        path: Option<PathBuf>,
        passphrase_env: Option<String>,
    },
    Agent,
}

impl Default for AuthConfig {
    fn default() -> Self {
        AuthConfig::Password { env: None }
    }
}

impl AuthConfig {
    /// Turns the configured method into a usable credential, prompting if needed.
    pub fn resolve(
        &self,
        user: &str,
        identity_files: &[PathBuf],
    ) -> Result<Credential, ConfigError> {
        self.resolve_with(user, identity_files, |name| std::env::var(name).ok(), |prompt| {
            read_from_stdin(true, prompt).map_err(|err| ConfigError::Credential(err.to_string()))
        })
    }

    fn resolve_with(
        &self,
        user: &str,
        identity_files: &[PathBuf],
        env: impl Fn(&str) -> Option<String>,
        prompt: impl Fn(&str) -> Result<Zeroizing<String>, ConfigError>,
    ) -> Result<Credential, ConfigError> {
        match self {
            AuthConfig::Password { env: variable } => {
                let password = match variable.as_deref().and_then(&env) {
                    Some(password) => Zeroizing::new(password),
                    None => prompt(&format!("[{user}] Password: "))?,
                };
                Ok(Credential::Password(password))
            }
            AuthConfig::Key {
                path,
                passphrase_env,
            } => {
                let Some(path) = path.as_deref().or(identity_files.first().map(PathBuf::as_path))
                else {
                    return Err(ConfigError::Credential(
                        "auth.path is unset and the ssh config names no IdentityFile".to_string(),
                    ));
                };
                let path = expand_home(path);
                if !path.is_file() {
                    return Err(ConfigError::Credential(format!(
                        "key file {} does not exist",
                        path.display()
                    )));
                }
                Ok(Credential::KeyFile {
                    path,
                    passphrase: passphrase_env
                        .as_deref()
                        .and_then(&env)
                        .map(Zeroizing::new),
                })
            }
            AuthConfig::Agent => Ok(Credential::Agent),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct MirrorDefinition {
    /// Local build output to mirror.
    pub source: PathBuf,
    /// Absolute remote directory whose contents get replaced.
    pub dest: String,

    #[serde(default)]
    pub preserve: Vec<String>,

    #[serde(default = "default_retries")]
    pub retries: u32,

    #[serde(default)]
    pub follow_links: bool,
}

fn default_retries() -> u32 {
    1
}

impl MirrorDefinition {
    pub fn exclusions(&self) -> ExclusionSet {
        ExclusionSet::new(self.preserve.iter().cloned())
    }
}

impl DeployDefinition {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |message: String| Err(ConfigError::Invalid(message));

        if self.host.name.trim().is_empty() {
            return invalid("host.name is empty".to_string());
        }
        if self.host.timeout_secs == 0 {
            return invalid("host.timeout_secs must be positive".to_string());
        }

        let dest = Path::new(&self.mirror.dest);
        if !self.mirror.dest.starts_with('/') {
            return invalid(format!("mirror.dest `{}` must be absolute", self.mirror.dest));
        }
        if !dest.components().any(|component| matches!(component, Component::Normal(_))) {
            return invalid("mirror.dest must not be the filesystem root".to_string());
        }
        if self.mirror.dest.split('/').any(|segment| segment == "." || segment == "..") {
            return invalid(format!(
                "mirror.dest `{}` must not contain `.` or `..`",
                self.mirror.dest
            ));
        }

        for name in &self.mirror.preserve {
            if name.is_empty() || name == "." || name == ".." || name.contains('/') {
                return invalid(format!(
                    "mirror.preserve entry `{name}` must be a single top-level name"
                ));
            }
        }

        Ok(())
    }
}
