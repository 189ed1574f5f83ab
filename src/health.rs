//! Health monitoring for connection pools

use crate::server::ServerStatus;

/// Health status of a connection pool and its servers
///
/// # Examples
///
/// ```
/// use ldap_acl_pool::{HealthStatus, ServerStatus};
///
/// let servers = vec![ServerStatus { address: "dc1:389".into(), alive: true }];
/// let health = HealthStatus::new(2, 1, 10, false, servers);
///
/// assert!(health.is_healthy());
/// assert_eq!(health.alive_servers, 1);
/// ```
#[derive(Debug, Clone)]
#[cfg_attr(feature = "metrics", derive(serde::Serialize))]
pub struct HealthStatus {
    /// Whether the pool is healthy
    pub is_healthy: bool,

    /// Whether the pool has been closed
    pub closed: bool,

    /// Checked-out connections relative to capacity
    pub utilization: f64,

    pub idle_connections: usize,

    pub active_connections: usize,

    pub capacity: usize,

    /// Servers whose last probe succeeded
    pub alive_servers: usize,

    pub servers: Vec<ServerStatus>,

    /// Warning messages
    pub warnings: Vec<String>,
}

impl HealthStatus {
    pub fn new(
        idle: usize,
        active: usize,
        capacity: usize,
        closed: bool,
        servers: Vec<ServerStatus>,
    ) -> Self {
        let utilization = if capacity > 0 {
            active as f64 / capacity as f64
        } else {
            0.0
        };
        let alive_servers = servers.iter().filter(|s| s.alive).count();

        let mut warnings = Vec::new();
        let mut is_healthy = true;

        if closed {
            warnings.push("Pool is closed".to_string());
            is_healthy = false;
        }

        if alive_servers == 0 {
            warnings.push("No directory server is alive".to_string());
            is_healthy = false;
        }

        // Bursts may exceed capacity; flag them without failing health
        if utilization > 0.9 {
            warnings.push(format!("High utilization: {:.1}%", utilization * 100.0));
        }

        Self {
            is_healthy,
            closed,
            utilization,
            idle_connections: idle,
            active_connections: active,
            capacity,
            alive_servers,
            servers,
            warnings,
        }
    }

    /// Check if the pool is healthy
    pub fn is_healthy(&self) -> bool {
        self.is_healthy
    }
}
