#![allow(dead_code)]

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream, UnixStream};
use tokio::sync::mpsc::{unbounded_channel, UnboundedSender};
use tokio_util::codec::Framed;

use redis_relay::{encode_value, Value, ValueCodec};

/// A scripted stand-in for the upstream server: enough of the protocol
/// for handshakes, basic reads and writes, subscriptions and canned
/// replies, plus a request log for asserting what actually reached it.
pub struct MockUpstream {
    pub addr: String,
    state: Arc<MockState>,
}

struct MockState {
    data: Mutex<HashMap<Vec<u8>, Vec<u8>>>,
    overrides: Mutex<HashMap<String, Value>>,
    log: Mutex<Vec<(i64, String)>>,
    subscribers: Mutex<Vec<UnboundedSender<SubscriberMsg>>>,
    next_id: AtomicI64,
}

enum SubscriberMsg {
    Frame(Vec<u8>),
    Close,
}

impl MockUpstream {
    pub async fn start() -> MockUpstream {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let state = Arc::new(MockState {
            data: Mutex::new(HashMap::new()),
            overrides: Mutex::new(HashMap::new()),
            log: Mutex::new(Vec::new()),
            subscribers: Mutex::new(Vec::new()),
            next_id: AtomicI64::new(1),
        });

        let accept_state = state.clone();
        tokio::spawn(async move {
            loop {
                let (stream, _) = match listener.accept().await {
                    Ok(accepted) => accepted,
                    Err(_) => return,
                };
                let conn_state = accept_state.clone();
                let conn_id = conn_state.next_id.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(serve_connection(stream, conn_state, conn_id));
            }
        });

        MockUpstream { addr, state }
    }

    /// Seeds a key the mock serves for `GET`/`MGET`.
    pub fn set_data(&self, key: &[u8], value: &[u8]) {
        self.state
            .data
            .lock()
            .unwrap()
            .insert(key.to_vec(), value.to_vec());
    }

    /// Replies to an exact request (arguments joined with spaces) with a
    /// canned value instead of the default behavior.
    pub fn set_reply(&self, request: &str, reply: Value) {
        self.state
            .overrides
            .lock()
            .unwrap()
            .insert(request.to_string(), reply);
    }

    /// How many times an exact request was received.
    pub fn request_count(&self, request: &str) -> usize {
        self.state
            .log
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, line)| line == request)
            .count()
    }

    /// How many received requests start with the given prefix.
    pub fn request_count_prefix(&self, prefix: &str) -> usize {
        self.state
            .log
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, line)| line.starts_with(prefix))
            .count()
    }

    /// Connection ids that issued requests matching the exact line.
    pub fn connections_for(&self, request: &str) -> Vec<i64> {
        self.state
            .log
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, line)| line == request)
            .map(|(conn, _)| *conn)
            .collect()
    }

    /// Number of live invalidation subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.state.subscribers.lock().unwrap().len()
    }

    /// Broadcasts an invalidation message for `keys` to every
    /// subscriber, the way a server with broadcast tracking would.
    pub fn publish_invalidation(&self, keys: &[&[u8]]) {
        let frame = Value::Array(vec![
            Value::BulkString(b"message".to_vec()),
            Value::BulkString(b"__redis__:invalidate".to_vec()),
            Value::Array(
                keys.iter()
                    .map(|k| Value::BulkString(k.to_vec()))
                    .collect(),
            ),
        ]);
        let bytes = encode_value(&frame);
        for subscriber in self.state.subscribers.lock().unwrap().iter() {
            let _ = subscriber.send(SubscriberMsg::Frame(bytes.clone()));
        }
    }

    /// Drops every subscriber connection, simulating an upstream-side
    /// failure of the invalidation channel.
    pub fn kill_subscribers(&self) {
        let mut subscribers = self.state.subscribers.lock().unwrap();
        for subscriber in subscribers.drain(..) {
            let _ = subscriber.send(SubscriberMsg::Close);
        }
    }
}

async fn serve_connection(stream: TcpStream, state: Arc<MockState>, conn_id: i64) {
    let mut framed = Framed::new(stream, ValueCodec::default());
    let (tx, mut rx) = unbounded_channel();
    let mut subscribed = false;

    loop {
        tokio::select! {
            pushed = rx.recv(), if subscribed => match pushed {
                Some(SubscriberMsg::Frame(bytes)) => {
                    if framed.send(bytes).await.is_err() {
                        return;
                    }
                }
                Some(SubscriberMsg::Close) | None => return,
            },
            frame = framed.next() => {
                let request = match frame {
                    Some(Ok(request)) => request,
                    _ => return,
                };
                let args = match request_args(&request) {
                    Some(args) if !args.is_empty() => args,
                    _ => return,
                };
                let joined = args.join(" ");
                state.log.lock().unwrap().push((conn_id, joined.clone()));

                let canned = state.overrides.lock().unwrap().get(&joined).cloned();
                let reply = match canned {
                    Some(reply) => reply,
                    None => default_reply(&state, &args, conn_id, &mut subscribed, &tx),
                };
                if framed.send(encode_value(&reply)).await.is_err() {
                    return;
                }
            }
        }
    }
}

fn request_args(request: &Value) -> Option<Vec<String>> {
    let parts = request.as_sequence()?;
    parts
        .iter()
        .map(|part| {
            part.as_bytes()
                .map(|bytes| String::from_utf8_lossy(bytes).into_owned())
        })
        .collect()
}

fn default_reply(
    state: &MockState,
    args: &[String],
    conn_id: i64,
    subscribed: &mut bool,
    tx: &UnboundedSender<SubscriberMsg>,
) -> Value {
    let name = args[0].to_ascii_uppercase();
    match name.as_str() {
        "PING" => Value::SimpleString("PONG".to_string()),
        "SELECT" | "READONLY" | "MULTI" => Value::SimpleString("OK".to_string()),
        "EXEC" => Value::Array(vec![]),
        "CLIENT" => match args.get(1).map(|sub| sub.to_ascii_uppercase()) {
            Some(sub) if sub == "ID" => Value::Int(conn_id),
            Some(sub) if sub == "TRACKING" => Value::SimpleString("OK".to_string()),
            _ => Value::Error("ERR unknown CLIENT subcommand".to_string()),
        },
        "SUBSCRIBE" => {
            *subscribed = true;
            state.subscribers.lock().unwrap().push(tx.clone());
            Value::Array(vec![
                Value::BulkString(b"subscribe".to_vec()),
                Value::BulkString(args[1].as_bytes().to_vec()),
                Value::Int(1),
            ])
        }
        "SET" => {
            if let [_, key, value, ..] = args {
                state
                    .data
                    .lock()
                    .unwrap()
                    .insert(key.as_bytes().to_vec(), value.as_bytes().to_vec());
            }
            Value::SimpleString("OK".to_string())
        }
        "GET" => {
            let data = state.data.lock().unwrap();
            match args.get(1).and_then(|key| data.get(key.as_bytes())) {
                Some(value) => Value::BulkString(value.clone()),
                None => Value::Nil,
            }
        }
        "MGET" => {
            let data = state.data.lock().unwrap();
            Value::Array(
                args[1..]
                    .iter()
                    .map(|key| match data.get(key.as_bytes()) {
                        Some(value) => Value::BulkString(value.clone()),
                        None => Value::Nil,
                    })
                    .collect(),
            )
        }
        _ => Value::Error(format!("ERR unknown command '{}'", args[0])),
    }
}

/// A minimal proxy client speaking RESP over the local endpoint.
pub struct TestClient {
    framed: Framed<UnixStream, ValueCodec>,
}

impl TestClient {
    pub async fn connect(path: &str) -> TestClient {
        let stream = UnixStream::connect(path).await.unwrap();
        TestClient {
            framed: Framed::new(stream, ValueCodec::default()),
        }
    }

    pub async fn send(&mut self, args: &[&[u8]]) {
        let request = Value::Array(
            args.iter()
                .map(|arg| Value::BulkString(arg.to_vec()))
                .collect(),
        );
        self.framed.send(encode_value(&request)).await.unwrap();
    }

    pub async fn recv(&mut self) -> Value {
        tokio::time::timeout(Duration::from_secs(5), self.framed.next())
            .await
            .expect("timed out waiting for proxy reply")
            .expect("proxy closed the connection")
            .expect("proxy sent an unparsable frame")
    }

    pub async fn request(&mut self, args: &[&[u8]]) -> Value {
        self.send(args).await;
        self.recv().await
    }
}

/// Polls `condition` until it holds or a deadline passes.
pub async fn eventually<F, Fut>(mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while tokio::time::Instant::now() < deadline {
        if condition().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    false
}

pub fn bulk(data: &[u8]) -> Value {
    Value::BulkString(data.to_vec())
}

pub fn ok() -> Value {
    Value::SimpleString("OK".to_string())
}
