use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use log::{debug, warn};
use tokio_util::codec::Framed;

use crate::commands::{classify, command_name, CommandKind};
use crate::connection::subscribe_tracking;
use crate::errors::{ErrorKind, RelayError, RelayResult};
use crate::listener::ClientStream;
use crate::metrics;
use crate::parser::ValueCodec;
use crate::registry::{
    cluster_nodes_addresses, redirect_address, topology_addresses, Registry, Upstream,
};
use crate::types::{encode_value, write_value, Value};

/// One accepted client connection.
///
/// Reads framed requests, serves cacheable reads locally when possible,
/// forwards the rest over a pooled upstream connection, and feeds
/// topology observations back into the registry.  Responses always come
/// back in request order.
pub struct ClientSession {
    framed: Framed<ClientStream, ValueCodec>,
    upstream: Arc<Upstream>,
    registry: Arc<Registry>,
}

/// A request bound for the upstream, with what the response path needs
/// to know about it.
struct Forward {
    request: Value,
    name: Vec<u8>,
    // Present for cacheable reads: the positional key list for the fill.
    keys: Option<Vec<Vec<u8>>>,
}

enum Slot {
    // Answered locally: cache hit, synthetic error, or sentinel.
    Ready(Value),
    // Awaiting the forwarded batch, by index into it.
    Pending(usize),
}

impl ClientSession {
    pub fn new(stream: ClientStream, upstream: Arc<Upstream>, registry: Arc<Registry>) -> Self {
        ClientSession {
            framed: Framed::new(stream, ValueCodec::default()),
            upstream,
            registry,
        }
    }

    pub async fn run(mut self) {
        metrics::client_connected();
        if let Err(err) = self.serve().await {
            debug!("client session ended: {err}");
        }
        metrics::client_disconnected();
    }

    async fn serve(&mut self) -> RelayResult<()> {
        loop {
            let request = match self.framed.next().await {
                None => return Ok(()),
                Some(Err(err)) => {
                    // Framing is lost, so one last error is all this
                    // client gets.
                    let reply = Value::Error(format!("ERR protocol error: {err}"));
                    let _ = self.framed.send(encode_value(&reply)).await;
                    return Err(err);
                }
                Some(Ok(request)) => request,
            };

            match classify(&request) {
                CommandKind::PipelineBegin => {
                    let batch = self.read_batch().await?;
                    let mut responses = vec![Value::Nil];
                    responses.extend(self.process(batch, true).await);
                    responses.push(Value::Nil);
                    self.write_responses(&responses).await?;
                }
                kind => {
                    let responses = self.process(vec![(request, kind)], false).await;
                    self.write_responses(&responses).await?;
                }
            }
        }
    }

    /// Collects commands between the begin sentinel (already consumed)
    /// and the end sentinel.
    async fn read_batch(&mut self) -> RelayResult<Vec<(Value, CommandKind)>> {
        let mut batch = Vec::new();
        loop {
            let request = match self.framed.next().await {
                None => fail!((
                    ErrorKind::IoError,
                    "client disconnected inside a pipelined batch"
                )),
                Some(result) => result?,
            };
            match classify(&request) {
                CommandKind::PipelineEnd => return Ok(batch),
                kind => batch.push((request, kind)),
            }
        }
    }

    /// Produces one response per command, in order.  All forwarded
    /// commands of the batch ride a single pool checkout.
    async fn process(&mut self, commands: Vec<(Value, CommandKind)>, in_batch: bool) -> Vec<Value> {
        let caching = self.upstream.invalidator.is_some();
        let cache = self.registry.cache();

        let mut slots = Vec::with_capacity(commands.len());
        let mut forwards: Vec<Forward> = Vec::new();

        for (request, kind) in commands {
            let name = command_name(&request).unwrap_or_default();
            match kind {
                CommandKind::Disallowed(reason) => {
                    slots.push(Slot::Ready(Value::Error(reason.to_string())));
                }
                CommandKind::Transaction if !in_batch => {
                    slots.push(Slot::Ready(Value::Error(
                        "ERR transactions must ride a pipelined batch".to_string(),
                    )));
                }
                // A stray sentinel inside a batch is already framing.
                CommandKind::PipelineBegin | CommandKind::PipelineEnd => {
                    slots.push(Slot::Ready(Value::Nil));
                }
                CommandKind::CacheableRead { keys, single } if caching => {
                    match cache.get_all(&keys) {
                        Some(mut values) => {
                            let response = if single {
                                values.pop().unwrap_or(Value::Nil)
                            } else {
                                Value::Array(values)
                            };
                            slots.push(Slot::Ready(response));
                        }
                        None => {
                            slots.push(Slot::Pending(forwards.len()));
                            forwards.push(Forward {
                                request,
                                name,
                                keys: Some(keys),
                            });
                        }
                    }
                }
                CommandKind::CacheableRead { .. }
                | CommandKind::Transaction
                | CommandKind::Forward => {
                    slots.push(Slot::Pending(forwards.len()));
                    forwards.push(Forward {
                        request,
                        name,
                        keys: None,
                    });
                }
            }
        }

        let mut results = Vec::new();
        if !forwards.is_empty() {
            results = match self.round_trip(&forwards).await {
                Ok(responses) => responses,
                Err(err) => {
                    warn!(
                        "round-trip to {} failed: {err}",
                        self.upstream.address
                    );
                    let reply = Value::Error(format!("ERR relay upstream failure: {err}"));
                    vec![reply; forwards.len()]
                }
            };

            for (forward, response) in forwards.iter().zip(&results) {
                if caching {
                    if let Some(keys) = &forward.keys {
                        cache.set(keys, response);
                    }
                }
                self.observe(forward, response).await;
            }
        }

        slots
            .into_iter()
            .map(|slot| match slot {
                Slot::Ready(value) => value,
                Slot::Pending(idx) => std::mem::replace(&mut results[idx], Value::Nil),
            })
            .collect()
    }

    /// Checks out one pooled connection, repairs its tracking
    /// subscription if the invalidator reconnected since it last
    /// subscribed, and runs the forwarded commands as one pipeline.
    async fn round_trip(&self, forwards: &[Forward]) -> RelayResult<Vec<Value>> {
        let mut conn = self.upstream.pool.get().await.map_err(|err| match err {
            bb8::RunError::User(err) => err,
            bb8::RunError::TimedOut => RelayError::from((
                ErrorKind::PoolError,
                "timed out waiting for a pooled connection",
            )),
        })?;
        // Returned to the pool when this frame unwinds, on success and
        // on error alike; the gauge follows the checkout either way.
        let _checkout = metrics::PoolCheckoutGuard::new(&self.upstream.address);

        if let Some(invalidator) = &self.upstream.invalidator {
            if conn.tracking_id() != invalidator.current_id() {
                subscribe_tracking(&mut conn, invalidator).await?;
            }
        }

        let mut packed = Vec::new();
        for forward in forwards {
            write_value(&mut packed, &forward.request)?;
        }
        metrics::upstream_request(&self.upstream.address);
        conn.pipeline(packed, forwards.len()).await
    }

    /// Feeds topology signals in a response back into the registry.  The
    /// response itself is relayed unchanged either way.
    async fn observe(&self, forward: &Forward, response: &Value) {
        match forward.name.as_slice() {
            b"CLUSTER SLOTS" => {
                for address in topology_addresses(response) {
                    self.registry
                        .clone()
                        .observe_upstream(&address, "CLUSTER SLOTS")
                        .await;
                }
            }
            b"CLUSTER NODES" => {
                if let Value::BulkString(text) = response {
                    for address in cluster_nodes_addresses(text) {
                        self.registry
                            .clone()
                            .observe_upstream(&address, "CLUSTER NODES")
                            .await;
                    }
                }
            }
            _ => {}
        }

        if let Value::Error(line) = response {
            if let Some(address) = redirect_address(line) {
                self.registry
                    .clone()
                    .observe_upstream(address, "redirect")
                    .await;
            }
        }
    }

    async fn write_responses(&mut self, responses: &[Value]) -> RelayResult<()> {
        for response in responses {
            self.framed.feed(encode_value(response)).await?;
        }
        self.framed.flush().await?;
        Ok(())
    }
}
