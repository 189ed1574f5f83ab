//! LDAP connections backed by the `ldap3` crate

use crate::connection::{Connection, Connector, Directory, ResultCode};
use crate::errors::{PoolError, PoolResult};
use async_trait::async_trait;
use ldap3::{Ldap, LdapConnAsync, LdapConnSettings, LdapError, Scope, SearchEntry};
use std::time::Duration;
use tracing::debug;

/// Opens LDAP connections over plain TCP or TLS.
///
/// TLS certificates are not verified: domain controllers are commonly
/// reached by address with self-signed certificates.
#[derive(Debug, Clone)]
pub struct LdapConnector {
    connect_timeout: Duration,
    operation_timeout: Duration,
}

impl LdapConnector {
    pub fn new(connect_timeout: Duration, operation_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            operation_timeout,
        }
    }
}

#[async_trait]
impl Connector for LdapConnector {
    type Connection = LdapConnection;

    async fn connect(&self, address: &str, secure: bool) -> PoolResult<LdapConnection> {
        let scheme = if secure { "ldaps" } else { "ldap" };
        let url = format!("{scheme}://{address}");
        let settings = LdapConnSettings::new()
            .set_conn_timeout(self.connect_timeout)
            .set_no_tls_verify(true);

        let (driver, ldap) = LdapConnAsync::with_settings(settings, &url)
            .await
            .map_err(|err| PoolError::Connect {
                address: address.to_string(),
                reason: err.to_string(),
            })?;

        let server = address.to_string();
        tokio::spawn(async move {
            if let Err(err) = driver.drive().await {
                debug!(server = %server, error = %err, "LDAP connection driver stopped");
            }
        });

        debug!(server = %address, secure, "Opened LDAP connection");
        Ok(LdapConnection {
            ldap,
            address: address.to_string(),
            operation_timeout: self.operation_timeout,
        })
    }
}

/// An open LDAP connection with a per-operation timeout.
pub struct LdapConnection {
    ldap: Ldap,
    address: String,
    operation_timeout: Duration,
}

#[async_trait]
impl Connection for LdapConnection {
    /// Base-scope search of the root DSE requesting no attributes.
    async fn is_alive(&mut self) -> bool {
        self.ldap
            .with_timeout(self.operation_timeout)
            .search("", Scope::Base, "(objectClass=*)", vec!["1.1"])
            .await
            .and_then(|result| result.success())
            .is_ok()
    }

    async fn close(mut self) {
        if let Err(err) = self.ldap.unbind().await {
            debug!(server = %self.address, error = %err, "Unbind failed");
        }
    }
}

#[async_trait]
impl Directory for LdapConnection {
    async fn bind(&mut self, dn: &str, password: &str) -> PoolResult<()> {
        self.ldap
            .with_timeout(self.operation_timeout)
            .simple_bind(dn, password)
            .await
            .and_then(|result| result.success())
            .map(|_| ())
            .map_err(directory_error)
    }

    async fn search(&mut self, base: &str, filter: &str, attrs: &[&str]) -> PoolResult<Vec<String>> {
        let (entries, _) = self
            .ldap
            .with_timeout(self.operation_timeout)
            .search(base, Scope::Subtree, filter, attrs.to_vec())
            .await
            .and_then(|result| result.success())
            .map_err(directory_error)?;

        Ok(entries
            .into_iter()
            .map(|entry| SearchEntry::construct(entry).dn)
            .collect())
    }
}

/// Directory result codes pass through; anything raised by the client
/// (I/O, timeouts, a dropped connection) counts as a network failure.
fn directory_error(err: LdapError) -> PoolError {
    match err {
        LdapError::LdapResult { result } => PoolError::Directory {
            code: ResultCode(result.rc),
            message: result.to_string(),
        },
        other => PoolError::Directory {
            code: ResultCode::NETWORK,
            message: other.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ResultCoded;
    use ldap3::LdapResult;

    fn ldap_result(rc: u32) -> LdapError {
        LdapError::LdapResult {
            result: LdapResult {
                rc,
                matched: String::new(),
                text: "failed".to_string(),
                refs: Vec::new(),
                ctrls: Vec::new(),
            },
        }
    }

    #[test]
    fn test_result_code_passes_through() {
        let err = directory_error(ldap_result(49));
        assert_eq!(err.result_code(), ResultCode::INVALID_CREDENTIALS);
    }

    #[test]
    fn test_transport_error_maps_to_network() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        let err = directory_error(LdapError::Io { source: io });
        assert_eq!(err.result_code(), ResultCode::NETWORK);
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let connector = LdapConnector::new(Duration::from_millis(200), Duration::from_millis(300));
        let result = connector.connect("127.0.0.1:1", false).await;
        assert!(matches!(result, Err(PoolError::Connect { .. })));
    }
}
