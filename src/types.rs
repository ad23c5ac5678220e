use std::fmt;
use std::io;
use std::str::from_utf8;

use num_bigint::BigInt;

/// Push type of a RESP3 out-of-band message.
#[derive(PartialEq, Eq, Clone, Debug)]
pub enum PushKind {
    /// `invalidate` is received when a tracked key changes.
    Invalidate,
    /// `message` is received for pub/sub subscriptions.
    Message,
    /// `pmessage` is received for pattern subscriptions.
    PMessage,
    /// `subscribe` confirms a subscription.
    Subscribe,
    /// `unsubscribe` confirms an unsubscription.
    Unsubscribe,
    /// Any other push kind, carried verbatim.
    Other(String),
}

pub(crate) fn get_push_kind(kind: String) -> PushKind {
    match kind.as_str() {
        "invalidate" => PushKind::Invalidate,
        "message" => PushKind::Message,
        "pmessage" => PushKind::PMessage,
        "subscribe" => PushKind::Subscribe,
        "unsubscribe" => PushKind::Unsubscribe,
        _ => PushKind::Other(kind),
    }
}

/// Format of a RESP3 verbatim string.
#[derive(PartialEq, Eq, Clone, Debug)]
pub enum VerbatimFormat {
    /// Plain text.
    Text,
    /// Markdown.
    Markdown,
    /// Unknown format tag.
    Unknown(String),
}

/// A single decoded RESP frame.
///
/// Unlike a client library, a proxy never interprets a server error as a
/// failure of its own request path: errors must travel back to the client
/// byte-for-byte, and redirection errors additionally feed discovery.  They
/// are therefore ordinary values here ([`Value::Error`]), and `Err` is
/// reserved for protocol/framing failures.
#[derive(PartialEq, Clone)]
pub enum Value {
    /// A nil response.
    Nil,
    /// An integer response.
    Int(i64),
    /// An arbitrary binary string.
    BulkString(Vec<u8>),
    /// A simple (status) string such as `OK` or `PONG`.
    SimpleString(String),
    /// An error reply, with the full error line (`MOVED 1 host:port`, …).
    Error(String),
    /// An array of other values.
    Array(Vec<Value>),
    /// A RESP3 double.
    Double(f64),
    /// A RESP3 boolean.
    Boolean(bool),
    /// A RESP3 map response.
    Map(Vec<(Value, Value)>),
    /// A RESP3 set response.
    Set(Vec<Value>),
    /// A RESP3 big number.
    BigNumber(BigInt),
    /// A RESP3 verbatim string.
    VerbatimString {
        /// Format tag of the string.
        format: VerbatimFormat,
        /// The text itself.
        text: String,
    },
    /// A RESP3 out-of-band push message.
    Push {
        /// Kind of the push message.
        kind: PushKind,
        /// Data attached to the push message.
        data: Vec<Value>,
    },
}

impl Value {
    /// Returns `&[Value]` if `self` is compatible with a sequence type.
    pub fn as_sequence(&self) -> Option<&[Value]> {
        match self {
            Value::Array(items) => Some(&items[..]),
            Value::Set(items) => Some(&items[..]),
            Value::Nil => Some(&[]),
            _ => None,
        }
    }

    /// Returns true for error replies.
    pub fn is_error(&self) -> bool {
        matches!(self, Value::Error(_))
    }

    /// Returns the contents of a bulk or simple string reply.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::BulkString(data) => Some(&data[..]),
            Value::SimpleString(s) => Some(s.as_bytes()),
            _ => None,
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Value::Nil => write!(fmt, "nil"),
            Value::Int(val) => write!(fmt, "int({val:?})"),
            Value::BulkString(ref val) => match from_utf8(val) {
                Ok(x) => write!(fmt, "bulk-string('{x:?}')"),
                Err(_) => write!(fmt, "binary-data({val:?})"),
            },
            Value::SimpleString(ref s) => write!(fmt, "simple-string({s:?})"),
            Value::Error(ref s) => write!(fmt, "error({s:?})"),
            Value::Array(ref values) => write!(fmt, "array({values:?})"),
            Value::Double(val) => write!(fmt, "double({val:?})"),
            Value::Boolean(val) => write!(fmt, "boolean({val:?})"),
            Value::Map(ref values) => write!(fmt, "map({values:?})"),
            Value::Set(ref values) => write!(fmt, "set({values:?})"),
            Value::BigNumber(ref val) => write!(fmt, "big-number({val:?})"),
            Value::VerbatimString {
                ref format,
                ref text,
            } => write!(fmt, "verbatim-string({format:?}, {text:?})"),
            Value::Push { ref kind, ref data } => write!(fmt, "push({kind:?}, {data:?})"),
        }
    }
}

/// Writes the wire encoding of `value` into `out`.
///
/// Values round-trip through [`crate::parser`]: whatever the parser produced
/// re-encodes to an equivalent frame.  Nested containers recurse.
pub fn write_value(out: &mut impl io::Write, value: &Value) -> io::Result<()> {
    let mut buf = itoa::Buffer::new();
    match value {
        Value::Nil => out.write_all(b"$-1\r\n"),
        Value::Int(val) => {
            out.write_all(b":")?;
            out.write_all(buf.format(*val).as_bytes())?;
            out.write_all(b"\r\n")
        }
        Value::BulkString(data) => {
            out.write_all(b"$")?;
            out.write_all(buf.format(data.len()).as_bytes())?;
            out.write_all(b"\r\n")?;
            out.write_all(data)?;
            out.write_all(b"\r\n")
        }
        Value::SimpleString(s) => {
            out.write_all(b"+")?;
            out.write_all(s.as_bytes())?;
            out.write_all(b"\r\n")
        }
        Value::Error(line) => {
            out.write_all(b"-")?;
            out.write_all(line.as_bytes())?;
            out.write_all(b"\r\n")
        }
        Value::Array(items) => {
            out.write_all(b"*")?;
            out.write_all(buf.format(items.len()).as_bytes())?;
            out.write_all(b"\r\n")?;
            for item in items {
                write_value(out, item)?;
            }
            Ok(())
        }
        Value::Double(val) => {
            write!(out, ",{val}\r\n")
        }
        Value::Boolean(val) => {
            if *val {
                out.write_all(b"#t\r\n")
            } else {
                out.write_all(b"#f\r\n")
            }
        }
        Value::Map(pairs) => {
            out.write_all(b"%")?;
            out.write_all(buf.format(pairs.len()).as_bytes())?;
            out.write_all(b"\r\n")?;
            for (k, v) in pairs {
                write_value(out, k)?;
                write_value(out, v)?;
            }
            Ok(())
        }
        Value::Set(items) => {
            out.write_all(b"~")?;
            out.write_all(buf.format(items.len()).as_bytes())?;
            out.write_all(b"\r\n")?;
            for item in items {
                write_value(out, item)?;
            }
            Ok(())
        }
        Value::BigNumber(val) => {
            write!(out, "({val}\r\n")
        }
        Value::VerbatimString { format, text } => {
            let tag = match format {
                VerbatimFormat::Text => "txt",
                VerbatimFormat::Markdown => "mkd",
                VerbatimFormat::Unknown(tag) => tag.as_str(),
            };
            out.write_all(b"=")?;
            out.write_all(buf.format(tag.len() + 1 + text.len()).as_bytes())?;
            out.write_all(b"\r\n")?;
            out.write_all(tag.as_bytes())?;
            out.write_all(b":")?;
            out.write_all(text.as_bytes())?;
            out.write_all(b"\r\n")
        }
        Value::Push { kind, data } => {
            let kind = match kind {
                PushKind::Invalidate => "invalidate",
                PushKind::Message => "message",
                PushKind::PMessage => "pmessage",
                PushKind::Subscribe => "subscribe",
                PushKind::Unsubscribe => "unsubscribe",
                PushKind::Other(name) => name.as_str(),
            };
            out.write_all(b">")?;
            out.write_all(buf.format(data.len() + 1).as_bytes())?;
            out.write_all(b"\r\n")?;
            write_value(out, &Value::BulkString(kind.as_bytes().to_vec()))?;
            for item in data {
                write_value(out, item)?;
            }
            Ok(())
        }
    }
}

/// Encodes a value into a freshly allocated buffer.
pub fn encode_value(value: &Value) -> Vec<u8> {
    let mut out = Vec::new();
    // Writing into a Vec cannot fail.
    write_value(&mut out, value).expect("vec write");
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_simple_values() {
        assert_eq!(encode_value(&Value::Nil), b"$-1\r\n");
        assert_eq!(encode_value(&Value::Int(42)), b":42\r\n");
        assert_eq!(
            encode_value(&Value::BulkString(b"bar".to_vec())),
            b"$3\r\nbar\r\n"
        );
        assert_eq!(
            encode_value(&Value::SimpleString("OK".to_string())),
            b"+OK\r\n"
        );
        assert_eq!(
            encode_value(&Value::Error("MOVED 1234 10.0.0.2:6379".to_string())),
            b"-MOVED 1234 10.0.0.2:6379\r\n"
        );
    }

    #[test]
    fn encode_nested_array() {
        let value = Value::Array(vec![
            Value::BulkString(b"1".to_vec()),
            Value::Nil,
            Value::Array(vec![Value::Int(7)]),
        ]);
        assert_eq!(
            encode_value(&value),
            b"*3\r\n$1\r\n1\r\n$-1\r\n*1\r\n:7\r\n"
        );
    }

    #[test]
    fn error_values_are_data() {
        let value = Value::Error("ERR wrong type".to_string());
        assert!(value.is_error());
        assert_eq!(value.as_bytes(), None);
    }
}
