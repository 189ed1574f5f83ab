//! # ldap-acl-pool
//!
//! Pooled, failover-aware directory connections for proxy external ACL
//! helpers that authorize requests by group or OU membership.
//!
//! ## Features
//!
//! - Server pool over interchangeable directory servers with fixed or
//!   round-robin preference, on-demand TCP liveness probes and backoff for
//!   dead servers
//! - Bounded connection pool that never waits for a slot: idle connections
//!   are probed before reuse, otherwise a new one is dialed
//! - Explicit checkout/return: a connection whose last operation reported a
//!   disposal code is torn down instead of recycled
//! - LDAP connector over `ldap3`
//! - Metrics and health snapshots, Prometheus export
//!
//! ## Quick Start
//!
//! ```no_run
//! use ldap_acl_pool::{ConnectionPool, LdapConnector, PoolConfiguration, ServerPool, Strategy};
//! use ldap_acl_pool::connection::Directory;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # async fn run() -> ldap_acl_pool::PoolResult<()> {
//! let servers = Arc::new(ServerPool::new(
//!     vec!["dc1.example.com:389".into(), "dc2.example.com:389".into()],
//!     Duration::from_secs(10),
//!     Duration::from_millis(200),
//!     Strategy::RoundRobin,
//! )?);
//! let connector = LdapConnector::new(Duration::from_secs(2), Duration::from_millis(300));
//! let pool = ConnectionPool::new(connector, servers, PoolConfiguration::new().with_capacity(10)).await?;
//!
//! let mut conn = pool.acquire().await?;
//! let bound = conn.bind("cn=proxy,dc=example,dc=com", "secret").await;
//! conn.track(bound)?;
//! conn.close().await; // recycled, or disposed after a disposal code
//!
//! pool.close_all().await;
//! # Ok(())
//! # }
//! ```

pub mod connection;
mod config;
mod errors;
mod health;
pub mod helper;
mod ldap;
mod metrics;
mod pool;
mod server;

pub use config::{PoolConfiguration, Strategy};
pub use connection::{Connection, Connector, Directory, ResultCode, ResultCoded};
pub use errors::{PoolError, PoolResult};
pub use health::HealthStatus;
pub use ldap::{LdapConnection, LdapConnector};
#[cfg(feature = "metrics")]
pub use metrics::MetricsExporter;
pub use metrics::PoolMetrics;
pub use pool::{ConnectionPool, PooledConnection};
pub use server::{Probe, ServerPool, ServerStatus, TcpProbe};
