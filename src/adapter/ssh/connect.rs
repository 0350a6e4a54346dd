use std::{
    net::{TcpStream, ToSocketAddrs},
    time::Duration,
};

use ssh2::{MethodType, Session};
use ssh2_config::HostParams;

use crate::remote::ConnectionError;

use super::Credential;

pub(super) fn try_connection(host: &str, timeout: Duration) -> Result<TcpStream, ConnectionError> {
    let addrs = host
        .to_socket_addrs()
        .map_err(|source| ConnectionError::Resolve {
            host: host.to_string(),
            source,
        })?;

    addrs
        .into_iter()
        .find_map(|addr| match TcpStream::connect_timeout(&addr, timeout) {
            Ok(stream) => Some(stream),
            Err(err) => {
                tracing::debug!(%addr, error = %err, "connection attempt failed");
                None
            }
        })
        .ok_or_else(|| ConnectionError::Unreachable {
            host: host.to_string(),
        })
}

pub(super) fn authenticate(
    session: &Session,
    user: &str,
    credential: &Credential,
) -> Result<(), ConnectionError> {
    let result = match credential {
        Credential::Password(password) => session.userauth_password(user, password),
        Credential::KeyFile { path, passphrase } => {
            session.userauth_pubkey_file(user, None, path, passphrase.as_deref().map(String::as_str))
        }
        Credential::Agent => session.userauth_agent(user),
    };

    if let Err(err) = result {
        return Err(ConnectionError::Authentication {
            user: user.to_string(),
            message: err.to_string(),
        });
    }
    if !session.authenticated() {
        return Err(ConnectionError::Authentication {
            user: user.to_string(),
            message: "server did not accept the credential".to_string(),
        });
    }

    Ok(())
}

// Used mostly the same logic to https://github.com/veeso/ssh2-config/blob/main/examples/client.rs
pub(super) fn configure_session(session: &mut Session, params: &HostParams) {
    if let Some(compress) = params.compression {
        session.set_compress(compress);
    }
    if params.tcp_keep_alive.unwrap_or(false) {
        if let Some(interval) = params.server_alive_interval {
            session.set_keepalive(true, interval.as_secs() as u32);
        }
    }

    macro_rules! report_if_fail {
        ($op: expr, $err: literal) => {{
            if let Err(err) = $op {
                tracing::warn!(error = %err, $err);
            }
        }};
    }

    // algos
    if let Some(algos) = params.kex_algorithms.as_deref() {
        report_if_fail!(
            session.method_pref(MethodType::Kex, algos.join(",").as_str()),
            "Could not set KEX algorithms"
        );
    }
    if let Some(algos) = params.host_key_algorithms.as_deref() {
        report_if_fail!(
            session.method_pref(MethodType::HostKey, algos.join(",").as_str()),
            "Could not set host key algorithms"
        );
    }
    if let Some(algos) = params.ciphers.as_deref() {
        report_if_fail!(
            session.method_pref(MethodType::CryptCs, algos.join(",").as_str()),
            "Could not set crypt algorithms (client-server)"
        );
        report_if_fail!(
            session.method_pref(MethodType::CryptSc, algos.join(",").as_str()),
            "Could not set crypt algorithms (server-client)"
        );
    }
    if let Some(algos) = params.mac.as_deref() {
        report_if_fail!(
            session.method_pref(MethodType::MacCs, algos.join(",").as_str()),
            "Could not set MAC algorithms (client-server)"
        );
        report_if_fail!(
            session.method_pref(MethodType::MacSc, algos.join(",").as_str()),
            "Could not set MAC algorithms (server-client)"
        )
    }
}
