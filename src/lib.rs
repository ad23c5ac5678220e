//! redis-relay is a connection-pooling sidecar proxy for Redis.
//!
//! Many client processes on one host cannot share an in-process
//! connection pool, so the proxy exposes a local endpoint per upstream
//! and multiplexes client traffic onto a small shared pool of upstream
//! connections.
//!
//! On top of the pooling it keeps a local cache of `GET`/`MGET`
//! responses, coherent through server-assisted invalidation: a dedicated
//! invalidator connection subscribes to key-invalidation events, and
//! every pooled connection redirects its tracking events there with
//! `CLIENT TRACKING ... REDIRECT`.  Cluster topology is discovered at
//! runtime from `CLUSTER SLOTS`/`CLUSTER NODES` replies and from
//! `MOVED`/`ASK` redirection errors; each newly seen node gets its own
//! local endpoint and pool.
//!
//! # Running a proxy
//!
//! ```rust,no_run
//! use redis_relay::{Proxy, ProcessConfig, UpstreamConfig};
//!
//! # #[tokio::main]
//! # async fn main() -> redis_relay::RelayResult<()> {
//! let upstream: UpstreamConfig =
//!     "redis://127.0.0.1:6379?cacheprefixes=user:&maxpoolsize=8".parse()?;
//! let proxy = Proxy::new(upstream, ProcessConfig::default());
//! proxy.run().await?;
//! # Ok(()) }
//! ```
//!
//! # Pipelined batches
//!
//! A stateful wire protocol cannot tell the proxy where one client's
//! pipeline ends, so patched clients bracket a batch with reads of two
//! fixed sentinel keys.  Everything in between rides a single pooled
//! connection checkout, which also makes `MULTI`/`EXEC` safe inside a
//! batch.

#![deny(non_camel_case_types)]
#![warn(missing_docs)]

mod macros;

mod cache;
mod cmd;
mod commands;
mod config;
mod connection;
mod errors;
mod interceptor;
mod invalidator;
mod listener;
pub mod metrics;
mod parser;
mod proxy;
mod registry;
mod types;

pub use crate::cache::Cache;
pub use crate::cmd::{cmd, Cmd};
pub use crate::commands::{
    classify, command_name, CommandKind, PIPELINE_BEGIN_KEY, PIPELINE_END_KEY,
};
pub use crate::config::{parse_redis_url, NetworkFamily, ProcessConfig, UpstreamConfig};
pub use crate::connection::{UpstreamConnection, UpstreamManager};
pub use crate::errors::{ErrorKind, RelayError, RelayResult};
pub use crate::invalidator::Invalidator;
pub use crate::parser::{parse_value, Parser, ValueCodec};
pub use crate::proxy::Proxy;
pub use crate::registry::{
    cluster_nodes_addresses, redirect_address, topology_addresses, Registry, Upstream,
};
pub use crate::types::{encode_value, write_value, PushKind, Value, VerbatimFormat};
