use std::collections::HashMap;
use std::sync::Arc;

use log::{error, info};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::cache::Cache;
use crate::config::{ProcessConfig, UpstreamConfig};
use crate::connection::UpstreamManager;
use crate::errors::RelayResult;
use crate::invalidator::Invalidator;
use crate::listener::{spawn_listener, LocalListener};
use crate::metrics;
use crate::types::Value;

/// One registered upstream: its pool, its local endpoint, and (when
/// caching is enabled) its invalidator.
pub struct Upstream {
    /// `host:port` of the upstream.
    pub address: String,
    /// Pooled connections, initialized by [`UpstreamManager`].
    pub pool: bb8::Pool<UpstreamManager>,
    /// Present iff cache prefixes are configured.
    pub invalidator: Option<Arc<Invalidator>>,
    /// The derived local endpoint clients connect to.
    pub local_endpoint: String,
}

/// Address-keyed map of every upstream this proxy fronts.
///
/// The initially configured address registers at startup; redirection
/// errors and topology replies register the rest at runtime.  Entries
/// live until shutdown.  The topology cross-references itself through
/// redirects, so entries never hold references to each other; everything
/// goes through this one map and its mutex.
pub struct Registry {
    upstream_config: UpstreamConfig,
    process_config: ProcessConfig,
    cache: Arc<Cache>,
    upstreams: Mutex<HashMap<String, Arc<Upstream>>>,
    quit: CancellationToken,
    kill: CancellationToken,
}

impl Registry {
    /// Creates an empty registry.  `quit` and `kill` are shared with
    /// every listener the registry spawns.
    pub fn new(
        upstream_config: UpstreamConfig,
        process_config: ProcessConfig,
        cache: Arc<Cache>,
        quit: CancellationToken,
        kill: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Registry {
            upstream_config,
            process_config,
            cache,
            upstreams: Mutex::new(HashMap::new()),
            quit,
            kill,
        })
    }

    /// The cache shared by every upstream of this proxy.
    pub fn cache(&self) -> &Arc<Cache> {
        &self.cache
    }

    /// Registers `address`, creating its invalidator, pool and local
    /// listener on first sight.  Registration is idempotent; the map
    /// mutex is held for the whole creation so concurrent observers of a
    /// new address cannot race each other.
    pub async fn ensure_upstream(self: Arc<Self>, address: &str) -> RelayResult<Arc<Upstream>> {
        let mut upstreams = self.upstreams.lock().await;
        if let Some(upstream) = upstreams.get(address) {
            return Ok(upstream.clone());
        }

        let local_endpoint = self.local_endpoint_for(address);
        info!(
            "registering upstream {address} with local endpoint {local_endpoint}",
        );

        let invalidator = if self.upstream_config.caching_enabled() {
            let invalidator = Invalidator::new(
                address.to_string(),
                self.upstream_config.cache_prefixes.clone(),
                self.cache.clone(),
                self.upstream_config.read_timeout,
                self.upstream_config.write_timeout,
            );
            tokio::spawn(invalidator.clone().run());
            Some(invalidator)
        } else {
            None
        };

        let manager = UpstreamManager::new(
            address.to_string(),
            self.upstream_config.clone(),
            invalidator.clone(),
        );
        let created: RelayResult<(bb8::Pool<UpstreamManager>, LocalListener)> = async {
            let pool = bb8::Pool::builder()
                .max_size(self.upstream_config.max_pool_size)
                .min_idle(Some(self.upstream_config.min_pool_size))
                .build(manager)
                .await?;
            let listener = LocalListener::bind(
                self.process_config.network,
                &local_endpoint,
                self.process_config.unlink,
            )
            .await?;
            Ok((pool, listener))
        }
        .await;
        let (pool, listener) = match created {
            Ok(created) => created,
            Err(err) => {
                // Don't leave the freshly spawned invalidator behind to
                // reconnect against an entry that never existed.
                if let Some(invalidator) = &invalidator {
                    invalidator.shutdown();
                }
                return Err(err);
            }
        };

        let upstream = Arc::new(Upstream {
            address: address.to_string(),
            pool,
            invalidator,
            local_endpoint,
        });
        spawn_listener(
            listener,
            upstream.clone(),
            self.clone(),
            self.quit.clone(),
            self.kill.clone(),
        );

        upstreams.insert(address.to_string(), upstream.clone());
        metrics::upstream_discovered(address);
        Ok(upstream)
    }

    /// Registration variant for addresses observed at runtime, where a
    /// creation failure must not fail the request that surfaced the
    /// address.
    pub async fn observe_upstream(self: Arc<Self>, address: &str, source: &str) {
        if let Err(err) = self.ensure_upstream(address).await {
            error!("unable to register upstream {address} observed via {source}: {err}");
        }
    }

    /// Shuts every invalidator down.  Listener tasks watch the quit and
    /// kill tokens on their own.
    pub async fn shutdown(&self) {
        let upstreams = self.upstreams.lock().await;
        for upstream in upstreams.values() {
            if let Some(invalidator) = &upstream.invalidator {
                invalidator.shutdown();
            }
        }
    }

    /// Addresses currently registered.
    pub async fn addresses(&self) -> Vec<String> {
        self.upstreams.lock().await.keys().cloned().collect()
    }

    /// Looks up a registered upstream.
    pub async fn get(&self, address: &str) -> Option<Arc<Upstream>> {
        self.upstreams.lock().await.get(address).cloned()
    }

    /// `<prefix><host>-<port>[-<db>]<suffix>`, with TCP endpoints passed
    /// through as-is by the configured prefix/suffix.
    fn local_endpoint_for(&self, address: &str) -> String {
        let mut path = format!(
            "{}{}",
            self.process_config.local_socket_prefix,
            address.replace(':', "-")
        );
        if self.upstream_config.database > -1 {
            path.push('-');
            path.push_str(&self.upstream_config.database.to_string());
        }
        path.push_str(&self.process_config.local_socket_suffix);
        path
    }
}

/// Returns the address named by a `MOVED`/`ASK` redirection error, if the
/// line is one.
pub fn redirect_address(error_line: &str) -> Option<&str> {
    if !error_line.starts_with("MOVED") && !error_line.starts_with("ASK") {
        return None;
    }
    let mut parts = error_line.split(' ');
    let _kind = parts.next()?;
    let _slot = parts.next()?;
    parts.next()
}

/// Collects every node address out of a `CLUSTER SLOTS` reply, masters
/// and replicas alike.  Malformed entries are skipped.
pub fn topology_addresses(reply: &Value) -> Vec<String> {
    let mut addresses = Vec::new();
    let items = match reply.as_sequence() {
        Some(items) => items,
        None => return addresses,
    };
    for item in items {
        let slot = match item.as_sequence() {
            Some(slot) if slot.len() >= 3 => slot,
            _ => continue,
        };
        // slot[0], slot[1] are the range bounds; nodes follow.
        for node in &slot[2..] {
            let node = match node.as_sequence() {
                Some(node) if node.len() >= 2 => node,
                _ => continue,
            };
            let host = match node[0].as_bytes() {
                Some(host) if !host.is_empty() => String::from_utf8_lossy(host).into_owned(),
                _ => continue,
            };
            let port = match node[1] {
                Value::Int(port) => port,
                _ => continue,
            };
            addresses.push(format!("{host}:{port}"));
        }
    }
    addresses
}

/// Collects node addresses out of the `CLUSTER NODES` bulk text: the
/// second whitespace-delimited field of each line, up to the `@`
/// separator.
pub fn cluster_nodes_addresses(text: &[u8]) -> Vec<String> {
    let text = String::from_utf8_lossy(text);
    let mut addresses = Vec::new();
    for line in text.split('\n') {
        let space = match line.find(' ') {
            Some(idx) => idx,
            None => continue,
        };
        let at = match line.find('@') {
            Some(idx) if idx > space => idx,
            _ => continue,
        };
        addresses.push(line[space + 1..at].to_string());
    }
    addresses
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bulk(data: &[u8]) -> Value {
        Value::BulkString(data.to_vec())
    }

    #[test]
    fn parses_redirect_errors() {
        assert_eq!(
            redirect_address("MOVED 1234 10.0.0.2:6379"),
            Some("10.0.0.2:6379")
        );
        assert_eq!(redirect_address("ASK 99 10.0.0.3:6379"), Some("10.0.0.3:6379"));
        assert_eq!(redirect_address("ERR unknown command"), None);
        assert_eq!(redirect_address("MOVED 1234"), None);
    }

    #[test]
    fn parses_cluster_slots_reply() {
        let reply = Value::Array(vec![
            Value::Array(vec![
                Value::Int(0),
                Value::Int(8191),
                Value::Array(vec![bulk(b"10.0.0.1"), Value::Int(7000), bulk(b"id-1")]),
                Value::Array(vec![bulk(b"10.0.0.2"), Value::Int(7001), bulk(b"id-2")]),
            ]),
            Value::Array(vec![
                Value::Int(8192),
                Value::Int(16383),
                Value::Array(vec![bulk(b"10.0.0.3"), Value::Int(7002), bulk(b"id-3")]),
            ]),
        ]);
        assert_eq!(
            topology_addresses(&reply),
            vec!["10.0.0.1:7000", "10.0.0.2:7001", "10.0.0.3:7002"]
        );
    }

    #[test]
    fn skips_malformed_slots() {
        let reply = Value::Array(vec![
            Value::Array(vec![Value::Int(0), Value::Int(1)]),
            bulk(b"junk"),
            Value::Array(vec![
                Value::Int(2),
                Value::Int(3),
                Value::Array(vec![bulk(b""), Value::Int(7000)]),
                Value::Array(vec![bulk(b"10.0.0.9"), Value::Int(7009)]),
            ]),
        ]);
        assert_eq!(topology_addresses(&reply), vec!["10.0.0.9:7009"]);
    }

    #[test]
    fn parses_cluster_nodes_text() {
        let text = b"07c3 10.0.0.1:7000@17000 myself,master - 0 0 1 connected 0-8191\n\
                     a9b2 10.0.0.2:7001@17001 slave 07c3 0 1 2 connected\n\
                     \n";
        assert_eq!(
            cluster_nodes_addresses(text),
            vec!["10.0.0.1:7000", "10.0.0.2:7001"]
        );
    }
}
