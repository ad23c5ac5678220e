use std::sync::Arc;
use std::time::Duration;

use log::{error, info};
use tokio_util::sync::CancellationToken;

use crate::cache::Cache;
use crate::config::{ProcessConfig, UpstreamConfig};
use crate::errors::RelayResult;
use crate::registry::{Registry, Upstream};

const RESTART_SLEEP: Duration = Duration::from_secs(1);

/// Owns everything belonging to one configured upstream: the shared
/// cache, the registry of upstreams discovered around it, and the
/// shutdown machinery.
pub struct Proxy {
    upstream_config: UpstreamConfig,
    registry: Arc<Registry>,
    quit: CancellationToken,
    kill: CancellationToken,
}

impl Proxy {
    /// Builds a proxy for one configured upstream.  Nothing is bound
    /// until [`Proxy::run`].
    pub fn new(upstream_config: UpstreamConfig, process_config: ProcessConfig) -> Arc<Self> {
        let cache = Arc::new(Cache::new(
            upstream_config.cache_max_bytes,
            upstream_config.cache_ttl,
        ));
        let quit = CancellationToken::new();
        let kill = CancellationToken::new();
        let registry = Registry::new(
            upstream_config.clone(),
            process_config,
            cache,
            quit.clone(),
            kill.clone(),
        );
        Arc::new(Proxy {
            upstream_config,
            registry,
            quit,
            kill,
        })
    }

    /// Registers the configured upstream, binding its local endpoint,
    /// and spawns the supervised main loop.  Startup failures here are
    /// the only fatal ones; later registration failures only log.
    pub async fn run(&self) -> RelayResult<()> {
        self.registry
            .clone()
            .ensure_upstream(&self.upstream_config.address)
            .await?;
        if self.upstream_config.label.is_empty() {
            info!("proxy serving upstream {}", self.upstream_config.address);
        } else {
            info!(
                "proxy serving upstream {} (cluster {})",
                self.upstream_config.address, self.upstream_config.label
            );
        }

        tokio::spawn(supervise(
            self.registry.clone(),
            self.upstream_config.address.clone(),
            self.quit.clone(),
        ));
        Ok(())
    }

    /// The registry of this proxy, for lookups and tests.
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// The registered entry of the initially configured upstream.
    pub async fn initial_upstream(&self) -> Option<Arc<Upstream>> {
        self.registry.get(&self.upstream_config.address).await
    }

    /// Stops accepting new clients and shuts the invalidators down.
    /// In-flight client connections drain until the disconnect timeout.
    /// Idempotent.
    pub async fn shutdown(&self) {
        self.registry.shutdown().await;
        self.quit.cancel();
    }

    /// `shutdown`, then drop in-flight client connections.  Idempotent.
    pub async fn kill(&self) {
        self.shutdown().await;
        self.kill.cancel();
    }
}

/// Respawns the main loop after a crash, with a pause in between so a
/// hot failure cannot spin.
async fn supervise(registry: Arc<Registry>, address: String, quit: CancellationToken) {
    loop {
        let handle = tokio::spawn(main_loop(registry.clone(), address.clone(), quit.clone()));
        match handle.await {
            Ok(()) => return,
            Err(err) if err.is_panic() => {
                error!("proxy main loop crashed: {err}");
                tokio::time::sleep(RESTART_SLEEP).await;
                info!("restarting proxy main loop");
            }
            Err(_) => return,
        }
    }
}

/// Keeps the initial upstream registered and parks until shutdown.
/// Listener and invalidator tasks run on their own and die on their own
/// I/O errors.
async fn main_loop(registry: Arc<Registry>, address: String, quit: CancellationToken) {
    if let Err(err) = registry.ensure_upstream(&address).await {
        error!("unable to register upstream {address}: {err}");
    }
    quit.cancelled().await;
}
