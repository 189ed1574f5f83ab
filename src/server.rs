//! Directory server selection with liveness probing and backoff

use crate::config::Strategy;
use crate::errors::{PoolError, PoolResult};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Number of full passes over the server list per selection
const SCAN_PASSES: usize = 3;

/// Checks whether a server accepts connections.
#[async_trait]
pub trait Probe: Send + Sync + 'static {
    async fn probe(&self, address: &str, timeout: Duration) -> bool;
}

/// Probe that opens, then immediately drops, a TCP connection.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpProbe;

#[async_trait]
impl Probe for TcpProbe {
    async fn probe(&self, address: &str, timeout: Duration) -> bool {
        matches!(
            tokio::time::timeout(timeout, TcpStream::connect(address)).await,
            Ok(Ok(_))
        )
    }
}

/// One configured server and its last observed health.
#[derive(Debug, Clone)]
pub struct ServerEntry {
    pub address: String,
    pub alive: bool,
    pub last_checked_at: Instant,
    pub probe_timeout: Duration,
}

impl ServerEntry {
    fn new(address: String, probe_timeout: Duration) -> Self {
        Self {
            address,
            alive: true,
            last_checked_at: Instant::now(),
            probe_timeout,
        }
    }

    /// Dead and checked within the backoff window.
    fn in_backoff(&self, now: Instant, retry_backoff: Duration) -> bool {
        !self.alive && now.saturating_duration_since(self.last_checked_at) < retry_backoff
    }
}

/// Health snapshot of a server
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "metrics", derive(serde::Serialize))]
pub struct ServerStatus {
    pub address: String,
    pub alive: bool,
}

struct Selection {
    servers: Vec<ServerEntry>,
    last_returned: Option<usize>,
}

impl Selection {
    fn start_index(&self, strategy: Strategy) -> usize {
        match (strategy, self.last_returned) {
            (Strategy::RoundRobin, Some(index)) => (index + 1) % self.servers.len(),
            _ => 0,
        }
    }
}

/// Fixed set of interchangeable directory servers.
///
/// Selections are serialized: a scan holds the selection lock for its whole
/// duration, so two concurrent callers never observe a half-updated entry and
/// round-robin order is never skipped.
pub struct ServerPool {
    selection: Mutex<Selection>,
    len: usize,
    strategy: Strategy,
    retry_backoff: Duration,
    probe: Arc<dyn Probe>,
}

impl ServerPool {
    /// Create a server pool that probes with plain TCP connects.
    pub fn new(
        addresses: Vec<String>,
        retry_backoff: Duration,
        probe_timeout: Duration,
        strategy: Strategy,
    ) -> PoolResult<Self> {
        Self::with_probe(addresses, retry_backoff, probe_timeout, strategy, TcpProbe)
    }

    /// Create a server pool with a custom liveness probe
    pub fn with_probe<P: Probe>(
        addresses: Vec<String>,
        retry_backoff: Duration,
        probe_timeout: Duration,
        strategy: Strategy,
        probe: P,
    ) -> PoolResult<Self> {
        if addresses.is_empty() {
            return Err(PoolError::EmptyServerList);
        }

        let len = addresses.len();
        let servers = addresses
            .into_iter()
            .map(|address| ServerEntry::new(address, probe_timeout))
            .collect();

        Ok(Self {
            selection: Mutex::new(Selection {
                servers,
                last_returned: None,
            }),
            len,
            strategy,
            retry_backoff,
            probe: Arc::new(probe),
        })
    }

    /// Pick the next usable server address.
    ///
    /// Scans circularly from the strategy's starting index for up to three
    /// passes. Dead servers inside the backoff window are skipped unprobed;
    /// every other candidate is probed and the first success is returned.
    pub async fn select(&self) -> PoolResult<String> {
        let mut selection = self.selection.lock().await;
        let len = self.len;
        let start = selection.start_index(self.strategy);

        for step in 0..SCAN_PASSES * len {
            let index = (start + step) % len;
            let now = Instant::now();

            let entry = &mut selection.servers[index];
            if entry.in_backoff(now, self.retry_backoff) {
                continue;
            }

            entry.last_checked_at = now;
            entry.alive = self.probe.probe(&entry.address, entry.probe_timeout).await;

            if entry.alive {
                let address = entry.address.clone();
                selection.last_returned = Some(index);
                debug!(server = %address, index, "Selected directory server");
                return Ok(address);
            }

            debug!(server = %entry.address, index, "Directory server probe failed");
        }

        warn!(servers = len, "No directory server available");
        Err(PoolError::NoServerAvailable)
    }

    /// Number of configured servers
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn strategy(&self) -> Strategy {
        self.strategy
    }

    /// Snapshot of every server's last observed health
    pub async fn statuses(&self) -> Vec<ServerStatus> {
        self.selection
            .lock()
            .await
            .servers
            .iter()
            .map(|entry| ServerStatus {
                address: entry.address.clone(),
                alive: entry.alive,
            })
            .collect()
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::Probe;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::time::Duration;

    /// Probe whose reachable set can be changed while running; records every probe.
    #[derive(Clone, Default)]
    pub struct ScriptedProbe {
        pub reachable: Arc<Mutex<HashSet<String>>>,
        pub probed: Arc<Mutex<Vec<String>>>,
    }

    impl ScriptedProbe {
        pub fn reaching(addresses: &[&str]) -> Self {
            let probe = Self::default();
            probe.set_reachable(addresses);
            probe
        }

        pub fn set_reachable(&self, addresses: &[&str]) {
            *self.reachable.lock() = addresses.iter().map(|a| a.to_string()).collect();
        }

        pub fn probes_of(&self, address: &str) -> usize {
            self.probed.lock().iter().filter(|a| *a == address).count()
        }
    }

    #[async_trait]
    impl Probe for ScriptedProbe {
        async fn probe(&self, address: &str, _timeout: Duration) -> bool {
            self.probed.lock().push(address.to_string());
            self.reachable.lock().contains(address)
        }
    }
}
