//! Metrics collection and export for connection pools

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Metrics data for a connection pool
///
/// # Examples
///
/// ```
/// use ldap_acl_pool::PoolMetrics;
///
/// let metrics = PoolMetrics {
///     dialed: 3,
///     reused: 7,
///     capacity: 10,
///     idle_connections: 2,
///     ..PoolMetrics::default()
/// };
///
/// let exported = metrics.export();
/// assert_eq!(exported["reused"], "7");
/// assert_eq!(exported["idle_connections"], "2");
/// ```
#[derive(Debug, Clone, Default, PartialEq)]
#[cfg_attr(feature = "metrics", derive(serde::Serialize))]
pub struct PoolMetrics {
    /// Connections opened against a server
    pub dialed: usize,

    /// Idle connections handed out again after a successful probe
    pub reused: usize,

    /// Connections put back into the idle buffer on close
    pub recycled: usize,

    /// Connections torn down because of a disposal code
    pub disposed: usize,

    /// Idle connections that failed their takeout probe
    pub discarded: usize,

    /// Connections closed on release because the buffer was full or the pool closed
    pub overflow_closed: usize,

    /// Dials that failed or timed out
    pub dial_failures: usize,

    /// Current idle connections
    pub idle_connections: usize,

    /// Current checked-out connections
    pub active_connections: usize,

    /// Idle buffer capacity
    pub capacity: usize,
}

impl PoolMetrics {
    /// Export metrics as a HashMap
    pub fn export(&self) -> HashMap<String, String> {
        self.values()
            .into_iter()
            .map(|(name, value)| (name.to_string(), value.to_string()))
            .collect()
    }

    fn values(&self) -> [(&'static str, usize); 10] {
        [
            ("dialed", self.dialed),
            ("reused", self.reused),
            ("recycled", self.recycled),
            ("disposed", self.disposed),
            ("discarded", self.discarded),
            ("overflow_closed", self.overflow_closed),
            ("dial_failures", self.dial_failures),
            ("idle_connections", self.idle_connections),
            ("active_connections", self.active_connections),
            ("capacity", self.capacity),
        ]
    }
}

/// Metrics exporter for Prometheus format
#[cfg(feature = "metrics")]
pub struct MetricsExporter;

#[cfg(feature = "metrics")]
impl MetricsExporter {
    /// Export metrics in Prometheus exposition format
    ///
    /// # Examples
    ///
    /// ```
    /// use ldap_acl_pool::{MetricsExporter, PoolMetrics};
    /// use std::collections::HashMap;
    ///
    /// let metrics = PoolMetrics { dialed: 4, ..PoolMetrics::default() };
    ///
    /// let mut tags = HashMap::new();
    /// tags.insert("helper".to_string(), "group".to_string());
    ///
    /// let output = MetricsExporter::export_prometheus(&metrics, "ldap", Some(&tags)).unwrap();
    /// assert!(output.contains("ldappool_connections_dialed_total"));
    /// assert!(output.contains("helper=\"group\""));
    /// ```
    pub fn export_prometheus(
        metrics: &PoolMetrics,
        pool_name: &str,
        tags: Option<&HashMap<String, String>>,
    ) -> crate::errors::PoolResult<String> {
        use prometheus::{Encoder, IntCounter, IntGauge, Opts, Registry, TextEncoder};

        let registry = Registry::new();
        let opts = |name: &str, help: &str| {
            let mut opts = Opts::new(name, help).const_label("pool", pool_name);
            if let Some(tags) = tags {
                for (key, value) in tags {
                    opts = opts.const_label(key.as_str(), value.as_str());
                }
            }
            opts
        };

        let counters = [
            ("ldappool_connections_dialed_total", "Connections dialed", metrics.dialed),
            ("ldappool_connections_reused_total", "Idle connections reused", metrics.reused),
            ("ldappool_connections_recycled_total", "Connections returned to the idle buffer", metrics.recycled),
            ("ldappool_connections_disposed_total", "Connections disposed after a disposal code", metrics.disposed),
            ("ldappool_connections_discarded_total", "Idle connections that failed the takeout probe", metrics.discarded),
            ("ldappool_connections_overflow_closed_total", "Connections closed on release", metrics.overflow_closed),
            ("ldappool_dial_failures_total", "Failed dials", metrics.dial_failures),
        ];
        for (name, help, value) in counters {
            let counter = IntCounter::with_opts(opts(name, help)).map_err(metrics_error)?;
            counter.inc_by(value as u64);
            registry.register(Box::new(counter)).map_err(metrics_error)?;
        }

        let gauges = [
            ("ldappool_connections_idle", "Current idle connections", metrics.idle_connections),
            ("ldappool_connections_active", "Current checked-out connections", metrics.active_connections),
            ("ldappool_capacity", "Idle buffer capacity", metrics.capacity),
        ];
        for (name, help, value) in gauges {
            let gauge = IntGauge::with_opts(opts(name, help)).map_err(metrics_error)?;
            gauge.set(value as i64);
            registry.register(Box::new(gauge)).map_err(metrics_error)?;
        }

        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&registry.gather(), &mut buffer)
            .map_err(metrics_error)?;
        String::from_utf8(buffer).map_err(|e| crate::errors::PoolError::Metrics(e.to_string()))
    }
}

#[cfg(feature = "metrics")]
fn metrics_error(err: prometheus::Error) -> crate::errors::PoolError {
    crate::errors::PoolError::Metrics(err.to_string())
}

/// Internal metrics tracker
#[derive(Default)]
pub(crate) struct MetricsTracker {
    pub dialed: AtomicUsize,
    pub reused: AtomicUsize,
    pub recycled: AtomicUsize,
    pub disposed: AtomicUsize,
    pub discarded: AtomicUsize,
    pub overflow_closed: AtomicUsize,
    pub dial_failures: AtomicUsize,
}

impl MetricsTracker {
    pub fn increment(counter: &AtomicUsize) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get_metrics(&self, idle: usize, active: usize, capacity: usize) -> PoolMetrics {
        PoolMetrics {
            dialed: self.dialed.load(Ordering::Relaxed),
            reused: self.reused.load(Ordering::Relaxed),
            recycled: self.recycled.load(Ordering::Relaxed),
            disposed: self.disposed.load(Ordering::Relaxed),
            discarded: self.discarded.load(Ordering::Relaxed),
            overflow_closed: self.overflow_closed.load(Ordering::Relaxed),
            dial_failures: self.dial_failures.load(Ordering::Relaxed),
            idle_connections: idle,
            active_connections: active,
            capacity,
        }
    }
}
