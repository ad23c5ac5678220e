//! Counters and gauges for the proxy, published through the `metrics`
//! facade.  The binary installs a Prometheus exporter when
//! `--metrics-address` is given; without a recorder installed every call
//! here is a no-op.

use std::net::SocketAddr;

use metrics::{counter, gauge};
use metrics_exporter_prometheus::PrometheusBuilder;

/// Metric names as constants for consistency.
pub mod names {
    /// Reads served from the local cache.
    pub const CACHE_HITS_TOTAL: &str = "relay_cache_hits_total";
    /// Reads that fell through to the upstream.
    pub const CACHE_MISSES_TOTAL: &str = "relay_cache_misses_total";
    /// Keys dropped through server-pushed invalidation.
    pub const CACHE_INVALIDATIONS_TOTAL: &str = "relay_cache_invalidations_total";
    /// Pipelined round-trips sent upstream, by upstream address.
    pub const UPSTREAM_REQUESTS_TOTAL: &str = "relay_upstream_requests_total";
    /// Upstream addresses registered, by address.
    pub const UPSTREAMS_DISCOVERED_TOTAL: &str = "relay_upstreams_discovered_total";
    /// Currently connected clients.
    pub const CLIENT_CONNECTIONS: &str = "relay_client_connections";
    /// Invalidation-connection reconnects, by upstream address.
    pub const INVALIDATOR_RECONNECTS_TOTAL: &str = "relay_invalidator_reconnects_total";
    /// Pool connections opened, by upstream address.
    pub const POOL_CONNECTIONS_OPENED_TOTAL: &str = "relay_pool_connections_opened_total";
    /// Pool connections closed, by upstream address.
    pub const POOL_CONNECTIONS_CLOSED_TOTAL: &str = "relay_pool_connections_closed_total";
    /// Live pool connections, by upstream address.
    pub const POOL_OPEN_CONNECTIONS: &str = "relay_pool_open_connections";
    /// Pool connections currently checked out, by upstream address.
    pub const POOL_CHECKED_OUT_CONNECTIONS: &str = "relay_pool_checked_out_connections";
}

/// Installs the Prometheus exporter serving scrapes on `addr`.
///
/// Must be called from within the runtime; the exporter runs as a
/// background task.
pub fn install_exporter(addr: SocketAddr) -> Result<(), String> {
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|err| err.to_string())
}

pub(crate) fn cache_hit() {
    counter!(names::CACHE_HITS_TOTAL).increment(1);
}

pub(crate) fn cache_miss() {
    counter!(names::CACHE_MISSES_TOTAL).increment(1);
}

pub(crate) fn cache_invalidations(count: u64) {
    counter!(names::CACHE_INVALIDATIONS_TOTAL).increment(count);
}

pub(crate) fn upstream_request(address: &str) {
    counter!(names::UPSTREAM_REQUESTS_TOTAL, "upstream" => address.to_string()).increment(1);
}

pub(crate) fn upstream_discovered(address: &str) {
    counter!(names::UPSTREAMS_DISCOVERED_TOTAL, "upstream" => address.to_string()).increment(1);
}

pub(crate) fn client_connected() {
    gauge!(names::CLIENT_CONNECTIONS).increment(1.0);
}

pub(crate) fn client_disconnected() {
    gauge!(names::CLIENT_CONNECTIONS).decrement(1.0);
}

pub(crate) fn invalidator_reconnect(address: &str) {
    counter!(names::INVALIDATOR_RECONNECTS_TOTAL, "upstream" => address.to_string()).increment(1);
}

/// Tracks one pooled connection from initialization to drop: counts the
/// open/close pair and keeps the live-connection gauge in step.  The
/// pool itself offers no event hook, so the connection carries this
/// guard instead.
pub(crate) struct PoolConnectionGuard {
    address: String,
}

impl PoolConnectionGuard {
    pub(crate) fn new(address: &str) -> Self {
        counter!(names::POOL_CONNECTIONS_OPENED_TOTAL, "upstream" => address.to_string())
            .increment(1);
        gauge!(names::POOL_OPEN_CONNECTIONS, "upstream" => address.to_string()).increment(1.0);
        PoolConnectionGuard {
            address: address.to_string(),
        }
    }
}

impl Drop for PoolConnectionGuard {
    fn drop(&mut self) {
        counter!(names::POOL_CONNECTIONS_CLOSED_TOTAL, "upstream" => self.address.clone())
            .increment(1);
        gauge!(names::POOL_OPEN_CONNECTIONS, "upstream" => self.address.clone()).decrement(1.0);
    }
}

/// Brackets one pool checkout, so the checked-out gauge returns to zero
/// on every exit path of a round-trip.
pub(crate) struct PoolCheckoutGuard {
    address: String,
}

impl PoolCheckoutGuard {
    pub(crate) fn new(address: &str) -> Self {
        gauge!(names::POOL_CHECKED_OUT_CONNECTIONS, "upstream" => address.to_string())
            .increment(1.0);
        PoolCheckoutGuard {
            address: address.to_string(),
        }
    }
}

impl Drop for PoolCheckoutGuard {
    fn drop(&mut self) {
        gauge!(names::POOL_CHECKED_OUT_CONNECTIONS, "upstream" => self.address.clone())
            .decrement(1.0);
    }
}
