use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

use crate::errors::{ErrorKind, RelayError, RelayResult};

const DEFAULT_PORT: u16 = 6379;

/// This function takes a redis URL string and parses it into a URL
/// as used by rust-url.
///
/// This is necessary as the default parser does not understand how redis
/// URLs function.
pub fn parse_redis_url(input: &str) -> Option<url::Url> {
    match url::Url::parse(input) {
        Ok(result) => match result.scheme() {
            "redis" => Some(result),
            _ => None,
        },
        Err(_) => None,
    }
}

/// Which stream family local endpoints are created on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum NetworkFamily {
    /// Filesystem sockets, the default.
    #[default]
    Unix,
    /// TCP loopback sockets.
    Tcp,
}

/// Process-wide settings shared by every proxy instance.
#[derive(Clone, Debug)]
pub struct ProcessConfig {
    /// Prepended to every derived local endpoint name.
    pub local_socket_prefix: String,
    /// Appended to every derived local endpoint name.
    pub local_socket_suffix: String,
    /// Stream family of local endpoints.
    pub network: NetworkFamily,
    /// Remove a stale socket file before binding.
    pub unlink: bool,
}

impl Default for ProcessConfig {
    fn default() -> Self {
        ProcessConfig {
            local_socket_prefix: "/var/tmp/redis-relay-".to_string(),
            local_socket_suffix: ".sock".to_string(),
            network: NetworkFamily::Unix,
            unlink: false,
        }
    }
}

/// Per-upstream settings, one per configured upstream URL.
///
/// URL format: `redis://<hostname>[:port][/db][?option=value&...]`
///
/// Recognized options: `minpoolsize`, `maxpoolsize`, `label`,
/// `readtimeout`, `writetimeout`, `cacheprefixes`, `cachesizemb`,
/// `cachettlseconds`, `readonly`.
#[derive(Clone, Debug)]
pub struct UpstreamConfig {
    /// `host:port` of the upstream server.
    pub address: String,
    /// Database index selected on every new connection, `-1` for none.
    pub database: i64,
    /// Label added to log lines for this upstream.
    pub label: String,
    /// Lower bound on the connection pool size.
    pub min_pool_size: u32,
    /// Upper bound on the connection pool size.
    pub max_pool_size: u32,
    /// Deadline for a single upstream read.
    pub read_timeout: Duration,
    /// Deadline for a single upstream write.
    pub write_timeout: Duration,
    /// Key prefixes the cache tracks.  Empty disables the cache and the
    /// invalidator for this upstream.
    pub cache_prefixes: Vec<String>,
    /// Byte cap of the cache.
    pub cache_max_bytes: usize,
    /// Ceiling on the lifetime of any cache entry.
    pub cache_ttl: Duration,
    /// Issue `READONLY` on every new connection.
    pub readonly: bool,
}

impl UpstreamConfig {
    /// True when caching (and therefore the invalidator) is enabled.
    pub fn caching_enabled(&self) -> bool {
        !self.cache_prefixes.is_empty()
    }
}

impl FromStr for UpstreamConfig {
    type Err = RelayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let url = match parse_redis_url(s) {
            Some(url) => url,
            None => fail!((
                ErrorKind::InvalidConfig,
                "upstream URL did not parse",
                s.to_string()
            )),
        };

        let host = match url.host_str() {
            Some(host) => host.to_string(),
            None => fail!((ErrorKind::InvalidConfig, "missing upstream hostname")),
        };
        let port = url.port().unwrap_or(DEFAULT_PORT);

        let database = match url.path().trim_matches('/') {
            "" => -1,
            path => path.parse::<i64>().map_err(|_| -> RelayError {
                (ErrorKind::InvalidConfig, "invalid database number").into()
            })?,
        };

        let query: HashMap<_, _> = url.query_pairs().collect();

        let min_pool_size = parse_option(&query, "minpoolsize", 1u32)?;
        let max_pool_size = parse_option(&query, "maxpoolsize", 10u32)?;
        if min_pool_size > max_pool_size {
            fail!((
                ErrorKind::InvalidConfig,
                "minpoolsize exceeds maxpoolsize"
            ));
        }

        let cache_prefixes = query
            .get("cacheprefixes")
            .map(|raw| {
                raw.split(',')
                    .filter(|p| !p.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        Ok(UpstreamConfig {
            address: format!("{host}:{port}"),
            database,
            label: query
                .get("label")
                .map(|l| l.to_string())
                .unwrap_or_default(),
            min_pool_size,
            max_pool_size,
            read_timeout: Duration::from_secs(parse_option(&query, "readtimeout", 5u64)?),
            write_timeout: Duration::from_secs(parse_option(&query, "writetimeout", 5u64)?),
            cache_prefixes,
            cache_max_bytes: parse_option(&query, "cachesizemb", 100usize)? * 1024 * 1024,
            cache_ttl: Duration::from_secs(parse_option(&query, "cachettlseconds", 360u64)?),
            readonly: parse_option(&query, "readonly", false)?,
        })
    }
}

fn parse_option<T: FromStr>(
    query: &HashMap<std::borrow::Cow<str>, std::borrow::Cow<str>>,
    name: &'static str,
    default: T,
) -> RelayResult<T> {
    match query.get(name) {
        Some(raw) => raw.parse::<T>().map_err(|_| {
            RelayError::from((
                ErrorKind::InvalidConfig,
                "invalid upstream option",
                format!("{name}={raw}"),
            ))
        }),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply() {
        let config: UpstreamConfig = "redis://127.0.0.1:6379".parse().unwrap();
        assert_eq!(config.address, "127.0.0.1:6379");
        assert_eq!(config.database, -1);
        assert_eq!(config.min_pool_size, 1);
        assert_eq!(config.max_pool_size, 10);
        assert_eq!(config.read_timeout, Duration::from_secs(5));
        assert_eq!(config.cache_max_bytes, 100 * 1024 * 1024);
        assert_eq!(config.cache_ttl, Duration::from_secs(360));
        assert!(!config.caching_enabled());
        assert!(!config.readonly);
    }

    #[test]
    fn options_override_defaults() {
        let config: UpstreamConfig = "redis://10.0.0.1:7000/2?minpoolsize=5&maxpoolsize=20\
             &label=shard-a&readtimeout=1&writetimeout=2&cacheprefixes=user:,session:\
             &cachesizemb=8&cachettlseconds=60&readonly=true"
            .parse()
            .unwrap();
        assert_eq!(config.address, "10.0.0.1:7000");
        assert_eq!(config.database, 2);
        assert_eq!(config.label, "shard-a");
        assert_eq!(config.min_pool_size, 5);
        assert_eq!(config.max_pool_size, 20);
        assert_eq!(config.read_timeout, Duration::from_secs(1));
        assert_eq!(config.write_timeout, Duration::from_secs(2));
        assert_eq!(config.cache_prefixes, vec!["user:", "session:"]);
        assert_eq!(config.cache_max_bytes, 8 * 1024 * 1024);
        assert_eq!(config.cache_ttl, Duration::from_secs(60));
        assert!(config.readonly);
    }

    #[test]
    fn default_port_is_added() {
        let config: UpstreamConfig = "redis://example.com".parse().unwrap();
        assert_eq!(config.address, "example.com:6379");
    }

    #[test]
    fn rejects_bad_urls() {
        assert!("http://127.0.0.1".parse::<UpstreamConfig>().is_err());
        assert!("redis://127.0.0.1/abc".parse::<UpstreamConfig>().is_err());
        assert!("redis://127.0.0.1?minpoolsize=nope"
            .parse::<UpstreamConfig>()
            .is_err());
        assert!("redis://127.0.0.1?minpoolsize=9&maxpoolsize=2"
            .parse::<UpstreamConfig>()
            .is_err());
    }
}
