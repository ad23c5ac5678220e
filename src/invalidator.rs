use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use log::{error, info, warn};
use tokio::time::{interval, timeout, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::cache::Cache;
use crate::cmd::{cmd, Cmd};
use crate::connection::UpstreamConnection;
use crate::errors::{ErrorKind, RelayResult};
use crate::metrics;
use crate::types::{PushKind, Value};

/// Channel the upstream broadcasts invalidation events on when tracking
/// is redirected to another connection.
const INVALIDATION_CHANNEL: &str = "__redis__:invalidate";

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);
/// Three silent heartbeat intervals mark the connection dead.
const DEAD_AFTER: Duration = Duration::from_secs(15);
const RECONNECT_SLEEP: Duration = Duration::from_secs(1);

/// Owns the one upstream connection whose sole job is receiving
/// key-invalidation events and applying them to the cache.
///
/// Normal pooled connections redirect their tracking events here by id
/// (see [`Invalidator::subscribe_command`]).  Because a cache without a
/// live invalidation channel cannot be trusted, every disconnect clears
/// the whole cache before the connection is re-established under a fresh
/// id.
pub struct Invalidator {
    address: String,
    prefixes: Vec<String>,
    cache: Arc<Cache>,
    read_timeout: Duration,
    write_timeout: Duration,
    client_id: AtomicI64,
    shutdown: CancellationToken,
}

impl Invalidator {
    /// Creates the invalidator for one upstream.  [`Invalidator::run`]
    /// must be spawned separately.
    pub fn new(
        address: String,
        prefixes: Vec<String>,
        cache: Arc<Cache>,
        read_timeout: Duration,
        write_timeout: Duration,
    ) -> Arc<Self> {
        Arc::new(Invalidator {
            address,
            prefixes,
            cache,
            read_timeout,
            write_timeout,
            client_id: AtomicI64::new(0),
            shutdown: CancellationToken::new(),
        })
    }

    /// The server-assigned id of the current invalidation connection,
    /// `0` while no connection is established.
    pub fn current_id(&self) -> i64 {
        self.client_id.load(Ordering::Acquire)
    }

    /// Builds the tracking subscription a normal upstream connection must
    /// issue so that its invalidation events arrive here.
    pub fn subscribe_command(&self) -> Cmd {
        let mut command = cmd("CLIENT");
        command
            .arg("TRACKING")
            .arg("ON")
            .arg("REDIRECT")
            .arg(self.current_id())
            .arg("BCAST");
        for prefix in &self.prefixes {
            command.arg("PREFIX").arg(prefix.as_str());
        }
        command
    }

    /// Signals the run loop to exit after the current frame.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Drives the connection until shutdown: dial, subscribe, consume
    /// push frames, reconnect on any failure.
    pub async fn run(self: Arc<Self>) {
        loop {
            if let Err(err) = self.session().await {
                error!(
                    "invalidator connection to {} failed: {err}",
                    self.address
                );
            }
            // The invalidation channel is gone, so no cached entry can be
            // trusted anymore.
            self.client_id.store(0, Ordering::Release);
            self.cache.clear();

            if self.shutdown.is_cancelled() {
                return;
            }
            metrics::invalidator_reconnect(&self.address);
            tokio::select! {
                _ = self.shutdown.cancelled() => return,
                _ = tokio::time::sleep(RECONNECT_SLEEP) => {}
            }
        }
    }

    /// One connection lifetime: Dialing -> Subscribing -> Live.
    async fn session(&self) -> RelayResult<()> {
        let mut conn =
            UpstreamConnection::connect(&self.address, self.read_timeout, self.write_timeout)
                .await?;

        let id = match conn.query(cmd("CLIENT").arg("ID")).await? {
            Value::Int(id) => id,
            other => fail!((
                ErrorKind::InvalidationError,
                "unexpected CLIENT ID reply",
                format!("{other:?}")
            )),
        };

        match conn.query(cmd("SUBSCRIBE").arg(INVALIDATION_CHANNEL)).await? {
            Value::Error(line) => fail!((
                ErrorKind::InvalidationError,
                "upstream refused invalidation subscription",
                line
            )),
            _ => {}
        }

        // Publish the id only after the subscription exists; new pool
        // connections redirecting to it must never race a half-set-up
        // invalidator.
        self.client_id.store(id, Ordering::Release);
        info!(
            "invalidator for {} live with connection id {id}",
            self.address
        );

        let mut framed = conn.into_inner();
        let mut heartbeat = interval(HEARTBEAT_INTERVAL);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_frame = Instant::now();

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => return Ok(()),
                _ = heartbeat.tick() => {
                    if last_frame.elapsed() > DEAD_AFTER {
                        fail!((
                            ErrorKind::InvalidationError,
                            "invalidation connection went silent"
                        ));
                    }
                    let ping = cmd("PING").get_packed_command();
                    match timeout(self.write_timeout, framed.send(ping)).await {
                        Ok(result) => result?,
                        Err(_) => fail!((ErrorKind::Timeout, "heartbeat write timed out")),
                    }
                }
                frame = framed.next() => match frame {
                    Some(Ok(value)) => {
                        last_frame = Instant::now();
                        self.apply(value);
                    }
                    Some(Err(err)) => return Err(err),
                    None => fail!((
                        ErrorKind::IoError,
                        "invalidation connection closed by upstream"
                    )),
                }
            }
        }
    }

    /// Applies one inbound frame.  Heartbeat replies and subscription
    /// confirmations are activity, nothing more.
    fn apply(&self, value: Value) {
        let payload = match invalidation_payload(value) {
            Some(payload) => payload,
            None => return,
        };
        match payload {
            // A nil payload means the server flushed; everything goes.
            Value::Nil => {
                self.cache.clear();
                metrics::cache_invalidations(1);
            }
            Value::BulkString(key) => {
                self.cache.delete(&key);
                metrics::cache_invalidations(1);
            }
            Value::Array(keys) => {
                let mut count = 0u64;
                for key in keys {
                    if let Some(key) = key.as_bytes() {
                        self.cache.delete(key);
                        count += 1;
                    }
                }
                metrics::cache_invalidations(count);
            }
            other => warn!("unexpected invalidation payload: {other:?}"),
        }
    }
}

/// Extracts the invalidated-keys payload out of a frame, accepting both
/// the RESP2 pub/sub form and the RESP3 push form.
fn invalidation_payload(value: Value) -> Option<Value> {
    match value {
        Value::Push {
            kind: PushKind::Invalidate,
            mut data,
        } => data.pop(),
        Value::Push {
            kind: PushKind::Message,
            mut data,
        } if data.len() == 2 && data[0].as_bytes() == Some(INVALIDATION_CHANNEL.as_bytes()) => {
            data.pop()
        }
        Value::Array(mut items)
            if items.len() == 3
                && items[0].as_bytes() == Some(b"message")
                && items[1].as_bytes() == Some(INVALIDATION_CHANNEL.as_bytes()) =>
        {
            items.pop()
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bulk(data: &[u8]) -> Value {
        Value::BulkString(data.to_vec())
    }

    #[test]
    fn extracts_resp2_message_payload() {
        let frame = Value::Array(vec![
            bulk(b"message"),
            bulk(b"__redis__:invalidate"),
            Value::Array(vec![bulk(b"foo"), bulk(b"bar")]),
        ]);
        assert_eq!(
            invalidation_payload(frame),
            Some(Value::Array(vec![bulk(b"foo"), bulk(b"bar")]))
        );
    }

    #[test]
    fn extracts_resp3_push_payload() {
        let frame = Value::Push {
            kind: PushKind::Invalidate,
            data: vec![Value::Array(vec![bulk(b"foo")])],
        };
        assert_eq!(
            invalidation_payload(frame),
            Some(Value::Array(vec![bulk(b"foo")]))
        );
    }

    #[test]
    fn ignores_unrelated_frames() {
        assert_eq!(
            invalidation_payload(Value::SimpleString("PONG".to_string())),
            None
        );
        let subscribe_ack = Value::Array(vec![
            bulk(b"subscribe"),
            bulk(b"__redis__:invalidate"),
            Value::Int(1),
        ]);
        assert_eq!(invalidation_payload(subscribe_ack), None);
    }

    #[test]
    fn subscribe_command_targets_current_id() {
        let cache = Arc::new(Cache::new(1 << 20, Duration::from_secs(10)));
        let invalidator = Invalidator::new(
            "127.0.0.1:6379".to_string(),
            vec!["user:".to_string(), "session:".to_string()],
            cache,
            Duration::from_secs(5),
            Duration::from_secs(5),
        );
        invalidator.client_id.store(42, Ordering::Release);
        assert_eq!(
            invalidator.subscribe_command().get_packed_command(),
            cmd("CLIENT")
                .arg("TRACKING")
                .arg("ON")
                .arg("REDIRECT")
                .arg(42i64)
                .arg("BCAST")
                .arg("PREFIX")
                .arg("user:")
                .arg("PREFIX")
                .arg("session:")
                .get_packed_command()
        );
    }
}
