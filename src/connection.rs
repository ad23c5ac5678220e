use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use log::{debug, warn};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_util::codec::Framed;

use crate::cmd::{cmd, Cmd};
use crate::config::UpstreamConfig;
use crate::errors::{ErrorKind, RelayError, RelayResult};
use crate::invalidator::Invalidator;
use crate::metrics;
use crate::parser::ValueCodec;
use crate::types::Value;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// A single framed connection to an upstream server.
///
/// All reads and writes are bounded by the configured deadlines; once a
/// deadline fires or the stream errors the connection is marked dead and
/// its pool discards it on return.
pub struct UpstreamConnection {
    framed: Framed<TcpStream, ValueCodec>,
    read_timeout: Duration,
    write_timeout: Duration,
    // Invalidator connection id this connection last subscribed against,
    // 0 when it never subscribed.
    tracking_id: i64,
    dead: bool,
    // Set for pooled connections only; counts the open/close pair.  The
    // invalidator's connection is not pool capacity and carries none.
    pool_guard: Option<metrics::PoolConnectionGuard>,
}

impl UpstreamConnection {
    /// Dials `address` within the bounded connect timeout.
    pub async fn connect(
        address: &str,
        read_timeout: Duration,
        write_timeout: Duration,
    ) -> RelayResult<Self> {
        let stream = match timeout(CONNECT_TIMEOUT, TcpStream::connect(address)).await {
            Ok(stream) => stream?,
            Err(_) => fail!((ErrorKind::Timeout, "upstream connect timed out")),
        };
        stream.set_nodelay(true)?;
        Ok(UpstreamConnection {
            framed: Framed::new(stream, ValueCodec::default()),
            read_timeout,
            write_timeout,
            tracking_id: 0,
            dead: false,
            pool_guard: None,
        })
    }

    /// Retires the connection when `result` carries an error after which
    /// it cannot be reused.  [`RelayError::is_connection_dropped`] is the
    /// one place that decides which kinds those are.
    fn track_result<T>(&mut self, result: RelayResult<T>) -> RelayResult<T> {
        if let Err(err) = &result {
            if err.is_connection_dropped() {
                self.dead = true;
            }
        }
        result
    }

    /// Writes already packed bytes to the upstream.
    pub async fn send_bytes(&mut self, bytes: Vec<u8>) -> RelayResult<()> {
        let result = match timeout(self.write_timeout, self.framed.send(bytes)).await {
            Ok(result) => result,
            Err(_) => Err(RelayError::from((
                ErrorKind::Timeout,
                "upstream write timed out",
            ))),
        };
        self.track_result(result)
    }

    /// Reads one frame from the upstream.
    pub async fn read_response(&mut self) -> RelayResult<Value> {
        let result = match timeout(self.read_timeout, self.framed.next()).await {
            Ok(Some(result)) => result,
            Ok(None) => Err(RelayError::from((
                ErrorKind::IoError,
                "upstream closed the connection",
            ))),
            Err(_) => Err(RelayError::from((
                ErrorKind::Timeout,
                "upstream read timed out",
            ))),
        };
        self.track_result(result)
    }

    /// Sends a single proxy-originated command and reads its reply.
    pub async fn query(&mut self, command: &Cmd) -> RelayResult<Value> {
        self.send_bytes(command.get_packed_command()).await?;
        self.read_response().await
    }

    /// Writes a packed pipeline of `count` commands and reads `count`
    /// responses, in order.
    pub async fn pipeline(&mut self, packed: Vec<u8>, count: usize) -> RelayResult<Vec<Value>> {
        self.send_bytes(packed).await?;
        let mut responses = Vec::with_capacity(count);
        for _ in 0..count {
            responses.push(self.read_response().await?);
        }
        Ok(responses)
    }

    /// Invalidator connection id this connection last subscribed against.
    pub fn tracking_id(&self) -> i64 {
        self.tracking_id
    }

    pub(crate) fn set_tracking_id(&mut self, id: i64) {
        self.tracking_id = id;
    }

    /// True once this connection can no longer be trusted.
    pub fn is_dead(&self) -> bool {
        self.dead
    }

    /// Surrenders the framed stream, dropping the per-read deadlines.
    /// The invalidator uses this for its push loop, where silence between
    /// frames is normal and liveness is the heartbeat's job.
    pub(crate) fn into_inner(self) -> Framed<TcpStream, ValueCodec> {
        self.framed
    }
}

/// Pool hook that initializes every new upstream connection: dial, pin
/// the database, optionally enter read-only mode, and subscribe the
/// connection's invalidation events to the invalidator.
pub struct UpstreamManager {
    address: String,
    config: UpstreamConfig,
    invalidator: Option<Arc<Invalidator>>,
}

impl UpstreamManager {
    /// Creates the manager backing one upstream's pool.
    pub fn new(
        address: String,
        config: UpstreamConfig,
        invalidator: Option<Arc<Invalidator>>,
    ) -> Self {
        UpstreamManager {
            address,
            config,
            invalidator,
        }
    }
}

impl bb8::ManageConnection for UpstreamManager {
    type Connection = UpstreamConnection;
    type Error = RelayError;

    async fn connect(&self) -> Result<Self::Connection, Self::Error> {
        let mut conn = UpstreamConnection::connect(
            &self.address,
            self.config.read_timeout,
            self.config.write_timeout,
        )
        .await?;

        // A database index pins the connection to the right db before it
        // ever enters the pool.
        if self.config.database > -1 {
            let reply = conn
                .query(cmd("SELECT").arg(self.config.database))
                .await?;
            if let Value::Error(line) = reply {
                fail!((
                    ErrorKind::ResponseError,
                    "upstream refused to switch database",
                    line
                ));
            }
        }

        if self.config.readonly {
            let reply = conn.query(&cmd("READONLY")).await?;
            if let Value::Error(line) = reply {
                fail!((
                    ErrorKind::ResponseError,
                    "upstream refused read-only mode",
                    line
                ));
            }
        }

        if let Some(invalidator) = &self.invalidator {
            subscribe_tracking(&mut conn, invalidator).await?;
        }

        // Only a fully initialized connection counts as pool capacity;
        // the guard's drop reports the matching close.
        conn.pool_guard = Some(metrics::PoolConnectionGuard::new(&self.address));

        debug!("initialized upstream connection to {}", self.address);
        Ok(conn)
    }

    async fn is_valid(&self, conn: &mut Self::Connection) -> Result<(), Self::Error> {
        match conn.query(&cmd("PING")).await? {
            Value::SimpleString(pong) if pong == "PONG" => Ok(()),
            _ => Err((ErrorKind::ResponseError, "ping request").into()),
        }
    }

    fn has_broken(&self, conn: &mut Self::Connection) -> bool {
        conn.is_dead()
    }
}

/// Points the upstream's invalidation events for this connection at the
/// invalidator's current connection id.
///
/// When the invalidator has not published an id yet (fresh start or mid
/// reconnect) the subscription is skipped; the interceptor re-applies it
/// on the next round-trip once an id exists.
pub(crate) async fn subscribe_tracking(
    conn: &mut UpstreamConnection,
    invalidator: &Invalidator,
) -> RelayResult<()> {
    let id = invalidator.current_id();
    if id == 0 {
        warn!("invalidator has no connection id yet, tracking subscription deferred");
        return Ok(());
    }
    let reply = conn.query(&invalidator.subscribe_command()).await?;
    if let Value::Error(line) = reply {
        fail!((
            ErrorKind::ResponseError,
            "upstream refused tracking subscription",
            line
        ));
    }
    conn.set_tracking_id(id);
    Ok(())
}
