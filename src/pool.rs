//! Bounded pool of reusable directory connections

use crate::config::PoolConfiguration;
use crate::connection::{Connection, Connector, ResultCode, ResultCoded};
use crate::errors::{PoolError, PoolResult};
use crate::health::HealthStatus;
use crate::metrics::{MetricsTracker, PoolMetrics};
use crate::server::ServerPool;

use crossbeam::queue::ArrayQueue;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::HashSet;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;
use tracing::{debug, info, warn};

/// A checked-out connection.
///
/// Ownership goes back to the pool through [`PooledConnection::close`], which
/// recycles the connection unless an operation on it reported a disposal code.
pub struct PooledConnection<C: Connection> {
    conn: Option<C>,
    id: usize,
    last_code: Option<ResultCode>,
    dispose_codes: Arc<HashSet<ResultCode>>,
    shared: Weak<Shared<C>>,
}

impl<C: Connection> PooledConnection<C> {
    /// Record the result code of the operation just performed.
    pub fn report(&mut self, code: ResultCode) {
        self.last_code = Some(code);
    }

    /// Record the outcome of an operation and pass it through.
    pub fn track<T, E: ResultCoded>(&mut self, result: Result<T, E>) -> Result<T, E> {
        let code = match &result {
            Ok(_) => ResultCode::SUCCESS,
            Err(err) => err.result_code(),
        };
        self.report(code);
        result
    }

    pub fn last_code(&self) -> Option<ResultCode> {
        self.last_code
    }

    /// Whether closing this connection will tear it down.
    pub fn is_marked_for_disposal(&self) -> bool {
        self.last_code
            .is_some_and(|code| self.dispose_codes.contains(&code))
    }

    /// Hand the connection back: dispose of it when its last result code is
    /// a disposal code, otherwise return it to the pool.
    pub async fn close(mut self) {
        let Some(conn) = self.conn.take() else {
            return;
        };
        let shared = self.shared.upgrade();
        if let Some(shared) = &shared {
            shared.active.remove(&self.id);
        }

        if self.is_marked_for_disposal() {
            debug!(id = self.id, code = ?self.last_code, "Disposing connection");
            if let Some(shared) = &shared {
                MetricsTracker::increment(&shared.metrics.disposed);
            }
            conn.close().await;
            return;
        }

        match shared {
            Some(shared) => shared.release(conn).await,
            None => conn.close().await,
        }
    }

    /// Tear the connection down without returning it to the pool.
    pub async fn dispose(mut self) {
        let Some(conn) = self.conn.take() else {
            return;
        };
        if let Some(shared) = self.shared.upgrade() {
            shared.active.remove(&self.id);
            MetricsTracker::increment(&shared.metrics.disposed);
        }
        conn.close().await;
    }
}

impl<C: Connection> Deref for PooledConnection<C> {
    type Target = C;

    fn deref(&self) -> &Self::Target {
        self.conn.as_ref().expect("connection already returned")
    }
}

impl<C: Connection> DerefMut for PooledConnection<C> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.conn.as_mut().expect("connection already returned")
    }
}

impl<C: Connection> Drop for PooledConnection<C> {
    fn drop(&mut self) {
        if self.conn.is_some() {
            if let Some(shared) = self.shared.upgrade() {
                shared.active.remove(&self.id);
            }
            warn!(id = self.id, "Pooled connection dropped without close");
        }
    }
}

/// State shared between the pool and its checked-out connections.
struct Shared<C> {
    /// `None` once the pool is closed
    idle: RwLock<Option<ArrayQueue<C>>>,
    active: DashMap<usize, Instant>,
    metrics: MetricsTracker,
    capacity: usize,
}

impl<C: Connection> Shared<C> {
    fn take_idle(&self) -> PoolResult<Option<C>> {
        match self.idle.read().as_ref() {
            Some(queue) => Ok(queue.pop()),
            None => Err(PoolError::Closed),
        }
    }

    /// Put a connection into the idle buffer, handing it back when the pool
    /// is closed or full.
    fn push_idle(&self, conn: C) -> Result<(), C> {
        match self.idle.read().as_ref() {
            Some(queue) => queue.push(conn),
            None => Err(conn),
        }
    }

    async fn release(&self, conn: C) {
        match self.push_idle(conn) {
            Ok(()) => MetricsTracker::increment(&self.metrics.recycled),
            Err(conn) => {
                debug!("Idle buffer full or pool closed, closing connection");
                MetricsTracker::increment(&self.metrics.overflow_closed);
                conn.close().await;
            }
        }
    }

    fn idle_len(&self) -> usize {
        self.idle.read().as_ref().map_or(0, ArrayQueue::len)
    }

    fn is_closed(&self) -> bool {
        self.idle.read().is_none()
    }
}

/// Bounded cache of live connections spread over a [`ServerPool`].
///
/// Acquisition never waits for a slot: when no idle connection is usable a
/// new one is dialed. Capacity bounds the idle buffer, so release closes
/// surplus connections instead of blocking.
pub struct ConnectionPool<K: Connector> {
    connector: K,
    servers: Arc<ServerPool>,
    config: PoolConfiguration,
    dispose_codes: Arc<HashSet<ResultCode>>,
    shared: Arc<Shared<K::Connection>>,
    next_id: AtomicUsize,
}

impl<K: Connector> ConnectionPool<K> {
    /// Create a pool and eagerly dial `initial_size` connections.
    ///
    /// Any failed dial closes what was already opened and fails the whole
    /// construction.
    pub async fn new(
        connector: K,
        servers: Arc<ServerPool>,
        config: PoolConfiguration,
    ) -> PoolResult<Self> {
        config.validate()?;

        let pool = Self {
            connector,
            servers,
            dispose_codes: Arc::new(config.dispose_codes.clone()),
            shared: Arc::new(Shared {
                idle: RwLock::new(Some(ArrayQueue::new(config.capacity))),
                active: DashMap::new(),
                metrics: MetricsTracker::default(),
                capacity: config.capacity,
            }),
            config,
            next_id: AtomicUsize::new(0),
        };

        for _ in 0..pool.config.initial_size {
            let conn = match pool.dial().await {
                Ok(conn) => conn,
                Err(err) => {
                    warn!(error = %err, "Unable to fill the connection pool");
                    pool.close_all().await;
                    return Err(err);
                }
            };
            if let Err(conn) = pool.shared.push_idle(conn) {
                conn.close().await;
            }
        }

        info!(
            initial = pool.config.initial_size,
            capacity = pool.config.capacity,
            servers = pool.servers.len(),
            strategy = ?pool.servers.strategy(),
            "Connection pool ready"
        );
        Ok(pool)
    }

    /// Take an idle connection that passes a liveness probe, or dial a new one.
    pub async fn acquire(&self) -> PoolResult<PooledConnection<K::Connection>> {
        if let Some(mut conn) = self.shared.take_idle()? {
            let alive = tokio::time::timeout(self.config.validation_timeout, conn.is_alive())
                .await
                .unwrap_or(false);

            if alive {
                MetricsTracker::increment(&self.shared.metrics.reused);
                return Ok(self.wrap(conn));
            }

            debug!("Idle connection failed its probe, discarding");
            MetricsTracker::increment(&self.shared.metrics.discarded);
            conn.close().await;
        }

        let conn = self.dial().await?;
        Ok(self.wrap(conn))
    }

    /// Mark the pool closed and close every idle connection.
    ///
    /// Connections still checked out are closed as they come back.
    pub async fn close_all(&self) {
        let queue = self.shared.idle.write().take();
        let Some(queue) = queue else {
            return;
        };

        let mut closed = 0;
        while let Some(conn) = queue.pop() {
            conn.close().await;
            closed += 1;
        }
        info!(closed, "Connection pool closed");
    }

    /// Current idle count; informational only.
    pub fn len(&self) -> usize {
        self.shared.idle_len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    /// Get active count
    pub fn active_count(&self) -> usize {
        self.shared.active.len()
    }

    /// Get pool metrics
    pub fn get_metrics(&self) -> PoolMetrics {
        self.shared
            .metrics
            .get_metrics(self.len(), self.active_count(), self.capacity())
    }

    /// Get health status
    pub async fn get_health_status(&self) -> HealthStatus {
        HealthStatus::new(
            self.len(),
            self.active_count(),
            self.capacity(),
            self.is_closed(),
            self.servers.statuses().await,
        )
    }

    async fn dial(&self) -> PoolResult<K::Connection> {
        let timeout = self.config.dial_timeout;
        let result = tokio::time::timeout(timeout, async {
            let address = self.servers.select().await?;
            self.connector.connect(&address, self.config.secure).await
        })
        .await
        .unwrap_or(Err(PoolError::Timeout(timeout)));

        match &result {
            Ok(_) => MetricsTracker::increment(&self.shared.metrics.dialed),
            Err(err) => {
                warn!(error = %err, "Dial failed");
                MetricsTracker::increment(&self.shared.metrics.dial_failures);
            }
        }
        result
    }

    fn wrap(&self, conn: K::Connection) -> PooledConnection<K::Connection> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.shared.active.insert(id, Instant::now());

        PooledConnection {
            conn: Some(conn),
            id,
            last_code: None,
            dispose_codes: Arc::clone(&self.dispose_codes),
            shared: Arc::downgrade(&self.shared),
        }
    }
}
