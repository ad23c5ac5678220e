use crate::types::Value;

/// Key a patched client reads to open a pipelined batch.
pub const PIPELINE_BEGIN_KEY: &[u8] = b"__relay_pipeline_begin__";
/// Key a patched client reads to close a pipelined batch.
pub const PIPELINE_END_KEY: &[u8] = b"__relay_pipeline_end__";

/// Commands with container sub-commands, whose behavior depends on the
/// second argument as well.
const CONTAINER_COMMANDS: &[&[u8]] = &[b"CLIENT", b"CLUSTER", b"COMMAND", b"CONFIG"];

/// A client request after classification.  The wire frame itself is kept
/// untouched; this only describes how the interceptor must treat it.
#[derive(Debug, PartialEq, Eq)]
pub enum CommandKind {
    /// `GET`/`MGET`: eligible for the cache, with the extracted key list.
    CacheableRead {
        /// Keys in wire order.
        keys: Vec<Vec<u8>>,
        /// True for `GET`, whose reply is the bare element rather than an
        /// array.
        single: bool,
    },
    /// A read of the pipeline-begin sentinel key.
    PipelineBegin,
    /// A read of the pipeline-end sentinel key.
    PipelineEnd,
    /// Refused outright, with the reason relayed to the client.
    Disallowed(&'static str),
    /// `MULTI`/`EXEC`/... - only valid inside a pipelined batch.
    Transaction,
    /// Anything else: forwarded untouched.
    Forward,
}

/// Returns the upper-cased name of a request, joining the sub-command for
/// container commands (`CLUSTER SLOTS`, `CLIENT TRACKING`, ...).
pub fn command_name(request: &Value) -> Option<Vec<u8>> {
    let args = request.as_sequence()?;
    let mut name = args.first()?.as_bytes()?.to_ascii_uppercase();
    if CONTAINER_COMMANDS.contains(&name.as_slice()) {
        if let Some(sub) = args.get(1).and_then(Value::as_bytes) {
            name.push(b' ');
            name.extend(sub.to_ascii_uppercase());
        }
    }
    Some(name)
}

/// Classifies one decoded client request.
pub fn classify(request: &Value) -> CommandKind {
    let name = match command_name(request) {
        Some(name) => name,
        None => return CommandKind::Forward,
    };

    match name.as_slice() {
        b"GET" => {
            let key = request
                .as_sequence()
                .and_then(|args| args.get(1))
                .and_then(Value::as_bytes);
            match key {
                Some(PIPELINE_BEGIN_KEY) => CommandKind::PipelineBegin,
                Some(PIPELINE_END_KEY) => CommandKind::PipelineEnd,
                Some(key) => CommandKind::CacheableRead {
                    keys: vec![key.to_vec()],
                    single: true,
                },
                None => CommandKind::Forward,
            }
        }
        b"MGET" => match extract_keys(request) {
            Some(keys) if !keys.is_empty() => CommandKind::CacheableRead { keys, single: false },
            _ => CommandKind::Forward,
        },
        b"BLPOP" | b"BRPOPLPUSH" | b"BLMOVE" | b"BLMPOP" | b"BRPOP" => {
            CommandKind::Disallowed("ERR blocking commands are not supported by the proxy")
        }
        b"SUBSCRIBE" | b"PSUBSCRIBE" | b"UNSUBSCRIBE" | b"PUNSUBSCRIBE" => {
            CommandKind::Disallowed("ERR subscribe commands are not supported by the proxy")
        }
        b"WAIT" => CommandKind::Disallowed("ERR WAIT is not supported by the proxy"),
        b"SELECT" => {
            CommandKind::Disallowed("ERR SELECT is handled by proxy configuration, not clients")
        }
        b"AUTH" => CommandKind::Disallowed("ERR AUTH is not supported by the proxy"),
        b"CLIENT TRACKING" => {
            CommandKind::Disallowed("ERR CLIENT TRACKING is reserved for the proxy")
        }
        b"MULTI" | b"EXEC" | b"DISCARD" | b"WATCH" | b"UNWATCH" => CommandKind::Transaction,
        _ => CommandKind::Forward,
    }
}

/// Extracts the key list of a cacheable read, in wire order.
fn extract_keys(request: &Value) -> Option<Vec<Vec<u8>>> {
    let args = request.as_sequence()?;
    args[1..]
        .iter()
        .map(|arg| arg.as_bytes().map(<[u8]>::to_vec))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn req(parts: &[&[u8]]) -> Value {
        Value::Array(
            parts
                .iter()
                .map(|p| Value::BulkString(p.to_vec()))
                .collect(),
        )
    }

    #[test]
    fn classifies_cacheable_reads() {
        assert_eq!(
            classify(&req(&[b"GET", b"foo"])),
            CommandKind::CacheableRead {
                keys: vec![b"foo".to_vec()],
                single: true,
            }
        );
        assert_eq!(
            classify(&req(&[b"mget", b"a", b"b"])),
            CommandKind::CacheableRead {
                keys: vec![b"a".to_vec(), b"b".to_vec()],
                single: false,
            }
        );
    }

    #[test]
    fn classifies_sentinels() {
        assert_eq!(
            classify(&req(&[b"GET", PIPELINE_BEGIN_KEY])),
            CommandKind::PipelineBegin
        );
        assert_eq!(
            classify(&req(&[b"GET", PIPELINE_END_KEY])),
            CommandKind::PipelineEnd
        );
    }

    #[test]
    fn refuses_blocking_and_admin_commands() {
        for name in [
            &b"BLPOP"[..],
            b"BRPOPLPUSH",
            b"SUBSCRIBE",
            b"WAIT",
            b"SELECT",
            b"AUTH",
        ] {
            assert!(matches!(
                classify(&req(&[name, b"x"])),
                CommandKind::Disallowed(_)
            ));
        }
        assert!(matches!(
            classify(&req(&[b"CLIENT", b"tracking", b"on"])),
            CommandKind::Disallowed(_)
        ));
        // Other CLIENT sub-commands pass through.
        assert_eq!(classify(&req(&[b"CLIENT", b"GETNAME"])), CommandKind::Forward);
    }

    #[test]
    fn transactions_are_flagged() {
        assert_eq!(classify(&req(&[b"MULTI"])), CommandKind::Transaction);
        assert_eq!(classify(&req(&[b"EXEC"])), CommandKind::Transaction);
    }

    #[test]
    fn container_command_names_join_subcommand() {
        assert_eq!(
            command_name(&req(&[b"cluster", b"slots"])).unwrap(),
            b"CLUSTER SLOTS".to_vec()
        );
        assert_eq!(command_name(&req(&[b"set", b"k", b"v"])).unwrap(), b"SET");
    }
}
