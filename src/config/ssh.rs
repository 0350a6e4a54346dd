use std::{fs::File, io::BufReader, path::PathBuf};

use ssh2_config::{HostParams, ParseRule, SshConfig};

use crate::util::expand_home;

use super::{ConfigError, DeployHost};

/// Where to connect, after merging the deploy file with `~/.ssh/config`.
#[derive(Debug)]
pub struct SshTarget {
    pub alias: String,
    pub host: String,
    pub port: u16,
    pub user: Option<String>,
    pub identity_files: Vec<PathBuf>,
    pub params: HostParams,
}

impl SshTarget {
    /// Values set in the deploy file win over the ssh config.
    pub fn resolve(host: &DeployHost) -> Result<Self, ConfigError> {
        let params = query_ssh_config(&host.name)?;
        Ok(Self::from_params(host, params))
    }

    fn from_params(host: &DeployHost, params: HostParams) -> Self {
        let hostname = params.host_name.clone().unwrap_or_else(|| host.name.clone());
        let port = host.port.or(params.port).unwrap_or(22);

        Self {
            alias: host.name.clone(),
            host: hostname,
            port,
            user: host.user.clone().or_else(|| params.user.clone()),
            identity_files: params
                .identity_file
                .clone()
                .unwrap_or_default()
                .iter()
                .map(|path| expand_home(path))
                .collect(),
            params,
        }
    }

    pub fn address(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

fn ssh_config_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".ssh").join("config"))
}

fn query_ssh_config(alias: &str) -> Result<HostParams, ConfigError> {
    let Some(path) = ssh_config_path().filter(|path| path.is_file()) else {
        tracing::debug!("no ssh config found, using defaults");
        return Ok(SshConfig::default().query(alias));
    };

    let file = File::open(&path).map_err(|source| ConfigError::Open {
        path: path.clone(),
        source,
    })?;
    let mut reader = BufReader::new(file);

    let config = SshConfig::default()
        .parse(&mut reader, ParseRule::ALLOW_UNKNOWN_FIELDS)
        .map_err(|err| ConfigError::Invalid(format!("{}: {err}", path.display())))?;

    Ok(config.query(alias))
}
