use std::net::SocketAddr;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use log::{error, info};

use redis_relay::{NetworkFamily, ProcessConfig, Proxy, UpstreamConfig};

#[derive(Parser, Debug)]
#[command(
    name = "redis-relay",
    version,
    about = "Connection-pooling Redis sidecar proxy with server-assisted client-side caching"
)]
struct Args {
    /// Upstream URLs, e.g. redis://10.0.0.1:6379/1?cacheprefixes=user:
    #[arg(required = true)]
    upstreams: Vec<String>,

    /// Prefix of derived local endpoint names.
    #[arg(long, default_value = "/var/tmp/redis-relay-")]
    socket_prefix: String,

    /// Suffix of derived local endpoint names.
    #[arg(long, default_value = ".sock")]
    socket_suffix: String,

    /// Stream family of local endpoints.
    #[arg(long, value_enum, default_value_t = NetworkFamily::Unix)]
    network: NetworkFamily,

    /// Remove stale socket files before binding.
    #[arg(long)]
    unlink: bool,

    /// Log level filter (error, warn, info, debug, trace).
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Serve Prometheus metrics on this address.
    #[arg(long)]
    metrics_address: Option<SocketAddr>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| args.log_level.clone().into()),
        )
        .init();

    if let Some(addr) = args.metrics_address {
        if let Err(err) = redis_relay::metrics::install_exporter(addr) {
            error!("unable to serve metrics on {addr}: {err}");
            return ExitCode::FAILURE;
        }
        info!("serving metrics on {addr}");
    }

    let process_config = ProcessConfig {
        local_socket_prefix: args.socket_prefix,
        local_socket_suffix: args.socket_suffix,
        network: args.network,
        unlink: args.unlink,
    };

    let mut proxies = Vec::new();
    for raw in &args.upstreams {
        let upstream_config: UpstreamConfig = match raw.parse() {
            Ok(config) => config,
            Err(err) => {
                error!("invalid upstream {raw}: {err}");
                return ExitCode::FAILURE;
            }
        };
        let proxy = Proxy::new(upstream_config, process_config.clone());
        // A proxy that cannot bind its initial endpoint aborts startup.
        if let Err(err) = proxy.run().await {
            error!("unable to start proxy for {raw}: {err}");
            return ExitCode::FAILURE;
        }
        proxies.push(proxy);
    }

    shutdown_signal().await;
    info!("shutdown requested, draining client connections");
    for proxy in &proxies {
        proxy.shutdown().await;
    }

    // A second signal drops in-flight connections instead of draining.
    tokio::select! {
        _ = shutdown_signal() => {
            info!("second signal, dropping in-flight connections");
            kill_all(&proxies).await;
        }
        _ = tokio::time::sleep(std::time::Duration::from_secs(10)) => {
            kill_all(&proxies).await;
        }
    }

    ExitCode::SUCCESS
}

async fn kill_all(proxies: &[Arc<Proxy>]) {
    for proxy in proxies {
        proxy.kill().await;
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = term.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await;
    }
}
