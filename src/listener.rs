use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use log::{error, warn};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, UnixListener};
use tokio::task::JoinSet;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::config::NetworkFamily;
use crate::errors::{ErrorKind, RelayResult};
use crate::interceptor::ClientSession;
use crate::registry::{Registry, Upstream};

/// How long in-flight client connections may drain after shutdown.
const DISCONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Trait alias for the two stream families local endpoints come in.
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Sync + Unpin {}
impl<S> AsyncStream for S where S: AsyncRead + AsyncWrite + Send + Sync + Unpin {}

/// A client connection accepted on a local endpoint.
pub type ClientStream = Box<dyn AsyncStream>;

/// A bound local endpoint, filesystem socket or TCP.
pub enum LocalListener {
    Tcp(TcpListener),
    Unix {
        listener: UnixListener,
        path: String,
    },
}

impl LocalListener {
    /// Binds the endpoint.  For filesystem sockets, `unlink` removes a
    /// stale socket file left behind by an earlier process.
    pub async fn bind(
        family: NetworkFamily,
        endpoint: &str,
        unlink: bool,
    ) -> RelayResult<LocalListener> {
        match family {
            NetworkFamily::Tcp => {
                let addr: SocketAddr = endpoint.parse().map_err(|_| {
                    crate::errors::RelayError::from((
                        ErrorKind::InvalidConfig,
                        "local endpoint is not a TCP address",
                        endpoint.to_string(),
                    ))
                })?;
                Ok(LocalListener::Tcp(TcpListener::bind(addr).await?))
            }
            NetworkFamily::Unix => {
                if unlink {
                    let _ = std::fs::remove_file(endpoint);
                }
                Ok(LocalListener::Unix {
                    listener: UnixListener::bind(endpoint)?,
                    path: endpoint.to_string(),
                })
            }
        }
    }

    async fn accept(&self) -> io::Result<ClientStream> {
        match self {
            LocalListener::Tcp(listener) => {
                let (stream, _) = listener.accept().await?;
                stream.set_nodelay(true)?;
                Ok(Box::new(stream))
            }
            LocalListener::Unix { listener, .. } => {
                let (stream, _) = listener.accept().await?;
                Ok(Box::new(stream))
            }
        }
    }

    fn cleanup(&self) {
        if let LocalListener::Unix { path, .. } = self {
            let _ = std::fs::remove_file(path);
        }
    }
}

/// Runs the accept loop for one upstream's local endpoint.
///
/// `quit` stops accepting and lets in-flight clients drain for up to the
/// disconnect timeout; `kill` aborts them outright.
pub fn spawn_listener(
    listener: LocalListener,
    upstream: Arc<Upstream>,
    registry: Arc<Registry>,
    quit: CancellationToken,
    kill: CancellationToken,
) {
    tokio::spawn(async move {
        let mut clients = JoinSet::new();
        loop {
            tokio::select! {
                _ = quit.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok(stream) => {
                        let session =
                            ClientSession::new(stream, upstream.clone(), registry.clone());
                        let kill = kill.clone();
                        clients.spawn(async move {
                            tokio::select! {
                                _ = kill.cancelled() => {}
                                _ = session.run() => {}
                            }
                        });
                    }
                    Err(err) => {
                        error!(
                            "accept failed on {}: {err}",
                            upstream.local_endpoint
                        );
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                }
            }
        }

        let drain = async {
            while clients.join_next().await.is_some() {}
        };
        if timeout(DISCONNECT_TIMEOUT, drain).await.is_err() {
            warn!(
                "clients of {} did not drain in time, aborting",
                upstream.local_endpoint
            );
            clients.abort_all();
            while clients.join_next().await.is_some() {}
        }
        listener.cleanup();
    });
}
