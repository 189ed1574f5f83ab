//! The protocol-client boundary the pools are built against

use crate::errors::PoolResult;
use async_trait::async_trait;
use std::fmt;

/// Result code reported by a directory operation.
///
/// Values below 200 are directory result codes as sent by the server;
/// 200 and above are produced on the client side.
///
/// # Examples
///
/// ```
/// use ldap_acl_pool::ResultCode;
///
/// assert!(ResultCode::SUCCESS.is_success());
/// assert_eq!(ResultCode::INVALID_CREDENTIALS.to_string(), "49");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "metrics", derive(serde::Serialize))]
pub struct ResultCode(pub u32);

impl ResultCode {
    pub const SUCCESS: Self = Self(0);
    pub const TIME_LIMIT_EXCEEDED: Self = Self(3);
    pub const NO_SUCH_OBJECT: Self = Self(32);
    pub const INVALID_CREDENTIALS: Self = Self(49);
    pub const NETWORK: Self = Self(200);

    pub fn is_success(self) -> bool {
        self == Self::SUCCESS
    }

    /// Codes after which a connection is treated as compromised.
    pub fn default_dispose_codes() -> Vec<Self> {
        vec![
            Self::TIME_LIMIT_EXCEEDED,
            Self::NETWORK,
            Self::INVALID_CREDENTIALS,
        ]
    }
}

impl fmt::Display for ResultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Errors that carry the result code of the operation that produced them.
pub trait ResultCoded {
    fn result_code(&self) -> ResultCode;
}

impl ResultCoded for crate::errors::PoolError {
    fn result_code(&self) -> ResultCode {
        use crate::errors::PoolError;
        match self {
            PoolError::Directory { code, .. } => *code,
            _ => ResultCode::NETWORK,
        }
    }
}

/// An open protocol connection.
#[async_trait]
pub trait Connection: Send + 'static {
    /// Cheap no-op round trip to the server.
    async fn is_alive(&mut self) -> bool;

    /// Tear the connection down.
    async fn close(self);
}

/// Opens protocol connections to a server address.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    type Connection: Connection;

    async fn connect(&self, address: &str, secure: bool) -> PoolResult<Self::Connection>;
}

/// Directory operations the ACL lookups need from a connection.
///
/// Every operation reports failures as [`crate::PoolError::Directory`], whose
/// result code is what decides disposal once the connection is closed.
#[async_trait]
pub trait Directory: Connection {
    async fn bind(&mut self, dn: &str, password: &str) -> PoolResult<()>;

    /// Subtree search returning the DNs of matching entries.
    async fn search(&mut self, base: &str, filter: &str, attrs: &[&str]) -> PoolResult<Vec<String>>;
}
