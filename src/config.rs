//! Pool configuration options

use crate::connection::ResultCode;
use crate::errors::{PoolError, PoolResult};
use std::collections::HashSet;
use std::time::Duration;

/// Server selection strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Strategy {
    /// Always prefer the first server, scanning forward on failure
    Fixed,

    /// Resume scanning one past the last server returned
    #[default]
    RoundRobin,
}

impl Strategy {
    pub fn from_round_robin(round_robin: bool) -> Self {
        if round_robin {
            Self::RoundRobin
        } else {
            Self::Fixed
        }
    }
}

/// Configuration for connection pool behavior
///
/// # Examples
///
/// ```
/// use ldap_acl_pool::{PoolConfiguration, ResultCode};
/// use std::time::Duration;
///
/// let config = PoolConfiguration::new()
///     .with_initial_size(2)
///     .with_capacity(10)
///     .with_secure(true)
///     .with_dispose_codes([ResultCode::NETWORK])
///     .with_dial_timeout(Duration::from_secs(2));
///
/// assert_eq!(config.capacity, 10);
/// assert!(config.validate().is_ok());
/// assert!(config.dispose_codes.contains(&ResultCode::NETWORK));
/// ```
#[derive(Debug, Clone)]
pub struct PoolConfiguration {
    /// Connections dialed eagerly on construction
    pub initial_size: usize,

    /// Maximum number of connections kept idle in the pool
    pub capacity: usize,

    /// Dial over TLS
    pub secure: bool,

    /// Result codes that mark a connection as unusable
    pub dispose_codes: HashSet<ResultCode>,

    /// Upper bound on a single dial, server selection included.
    ///
    /// The clock starts before the selection lock is taken, so in a burst a
    /// caller queued behind a slow scan can fail with
    /// [`PoolError::Timeout`](crate::PoolError::Timeout) rather than
    /// `NoServerAvailable`.
    pub dial_timeout: Duration,

    /// Upper bound on the liveness probe of an idle connection
    pub validation_timeout: Duration,
}

impl Default for PoolConfiguration {
    fn default() -> Self {
        Self {
            initial_size: 0,
            capacity: 100,
            secure: false,
            dispose_codes: ResultCode::default_dispose_codes().into_iter().collect(),
            dial_timeout: Duration::from_secs(5),
            validation_timeout: Duration::from_millis(300),
        }
    }
}

impl PoolConfiguration {
    /// Create a new configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_initial_size(mut self, size: usize) -> Self {
        self.initial_size = size;
        self
    }

    /// Set the pool capacity
    ///
    /// # Examples
    ///
    /// ```
    /// use ldap_acl_pool::PoolConfiguration;
    ///
    /// let config = PoolConfiguration::new().with_capacity(0);
    /// assert!(config.validate().is_err());
    /// ```
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn with_secure(mut self, secure: bool) -> Self {
        self.secure = secure;
        self
    }

    /// Replace the set of disposal codes
    pub fn with_dispose_codes(mut self, codes: impl IntoIterator<Item = ResultCode>) -> Self {
        self.dispose_codes = codes.into_iter().collect();
        self
    }

    pub fn with_dial_timeout(mut self, timeout: Duration) -> Self {
        self.dial_timeout = timeout;
        self
    }

    pub fn with_validation_timeout(mut self, timeout: Duration) -> Self {
        self.validation_timeout = timeout;
        self
    }

    /// Check capacity bounds: `capacity > 0` and `initial_size <= capacity`.
    pub fn validate(&self) -> PoolResult<()> {
        if self.capacity == 0 || self.initial_size > self.capacity {
            return Err(PoolError::InvalidCapacity {
                initial: self.initial_size,
                capacity: self.capacity,
            });
        }
        Ok(())
    }
}
