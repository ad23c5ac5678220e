use std::error;
use std::fmt;
use std::io;

/// An enum of all error kinds.
#[derive(PartialEq, Eq, Copy, Clone, Debug)]
#[non_exhaustive]
pub enum ErrorKind {
    /// The upstream generated an invalid response.
    ResponseError,
    /// The parser failed to parse a RESP frame.
    ParseError,
    /// An error caused by invalid proxy configuration.
    InvalidConfig,
    /// An I/O error that is not native to the protocol.
    IoError,
    /// An upstream read or write exceeded its deadline.
    Timeout,
    /// The connection pool could not produce a connection.
    PoolError,
    /// The invalidation channel is not usable.
    InvalidationError,
}

/// Represents an error raised inside the proxy.  For the most part you
/// should be using the `Error` trait to interact with this rather than
/// the actual struct.
pub struct RelayError {
    repr: ErrorRepr,
}

#[derive(Debug)]
enum ErrorRepr {
    WithDescription(ErrorKind, &'static str),
    WithDescriptionAndDetail(ErrorKind, &'static str, String),
    IoError(io::Error),
}

/// Library generic result type.
pub type RelayResult<T> = Result<T, RelayError>;

impl PartialEq for RelayError {
    fn eq(&self, other: &RelayError) -> bool {
        match (&self.repr, &other.repr) {
            (&ErrorRepr::WithDescription(kind_a, _), &ErrorRepr::WithDescription(kind_b, _)) => {
                kind_a == kind_b
            }
            (
                &ErrorRepr::WithDescriptionAndDetail(kind_a, _, _),
                &ErrorRepr::WithDescriptionAndDetail(kind_b, _, _),
            ) => kind_a == kind_b,
            _ => false,
        }
    }
}

impl From<io::Error> for RelayError {
    fn from(err: io::Error) -> RelayError {
        RelayError {
            repr: ErrorRepr::IoError(err),
        }
    }
}

impl From<(ErrorKind, &'static str)> for RelayError {
    fn from((kind, desc): (ErrorKind, &'static str)) -> RelayError {
        RelayError {
            repr: ErrorRepr::WithDescription(kind, desc),
        }
    }
}

impl From<(ErrorKind, &'static str, String)> for RelayError {
    fn from((kind, desc, detail): (ErrorKind, &'static str, String)) -> RelayError {
        RelayError {
            repr: ErrorRepr::WithDescriptionAndDetail(kind, desc, detail),
        }
    }
}

impl error::Error for RelayError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self.repr {
            ErrorRepr::IoError(ref err) => Some(err as &dyn error::Error),
            _ => None,
        }
    }
}

impl fmt::Display for RelayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.repr {
            ErrorRepr::WithDescription(kind, desc) => {
                desc.fmt(f)?;
                f.write_str(" - ")?;
                fmt::Debug::fmt(&kind, f)
            }
            ErrorRepr::WithDescriptionAndDetail(kind, desc, ref detail) => {
                desc.fmt(f)?;
                f.write_str(" - ")?;
                fmt::Debug::fmt(&kind, f)?;
                f.write_str(": ")?;
                detail.fmt(f)
            }
            ErrorRepr::IoError(ref err) => err.fmt(f),
        }
    }
}

impl fmt::Debug for RelayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl RelayError {
    /// Returns the kind of the error.
    pub fn kind(&self) -> ErrorKind {
        match self.repr {
            ErrorRepr::WithDescription(kind, _)
            | ErrorRepr::WithDescriptionAndDetail(kind, _, _) => kind,
            ErrorRepr::IoError(_) => ErrorKind::IoError,
        }
    }

    /// Returns the error detail if there is one.
    pub fn detail(&self) -> Option<&str> {
        match self.repr {
            ErrorRepr::WithDescriptionAndDetail(_, _, ref detail) => Some(detail.as_str()),
            _ => None,
        }
    }

    /// Indicates that the connection this error was observed on can no
    /// longer be trusted and must be dropped from its pool.
    pub fn is_connection_dropped(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::IoError | ErrorKind::Timeout | ErrorKind::ParseError
        )
    }
}
