use crate::config::Endpoint;
use bytes::Bytes;

/// A decoded reply value.
///
/// Covers the RESP2 reply types plus the RESP3 null and push frames. The
/// remaining RESP3 types (double, boolean, verbatim, big number, map, set,
/// attribute) are rejected by the decoder as unsupported.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// Simple String: +OK\r\n
    Simple(String),

    /// Error: -ERR message\r\n
    Error(String),

    /// Integer: :1000\r\n
    Integer(i64),

    /// Bulk String: $6\r\nfoobar\r\n or $-1\r\n for null
    Bulk(Option<Bytes>),

    /// Array: *2\r\n... or *-1\r\n for null
    Array(Option<Vec<Value>>),

    /// RESP3 out-of-band push frame: >2\r\n...
    Push(Vec<Value>),

    /// RESP3 null: _\r\n
    Null,
}

impl Value {
    pub fn simple(s: impl Into<String>) -> Self {
        Value::Simple(s.into())
    }

    pub fn error(s: impl Into<String>) -> Self {
        Value::Error(s.into())
    }

    pub fn integer(i: i64) -> Self {
        Value::Integer(i)
    }

    pub fn bulk(b: impl Into<Bytes>) -> Self {
        Value::Bulk(Some(b.into()))
    }

    pub fn null_bulk() -> Self {
        Value::Bulk(None)
    }

    pub fn array(items: Vec<Value>) -> Self {
        Value::Array(Some(items))
    }

    pub fn empty_array() -> Self {
        Value::Array(Some(Vec::new()))
    }

    pub fn null_array() -> Self {
        Value::Array(None)
    }

    pub fn ok() -> Self {
        Value::Simple("OK".to_string())
    }

    /// True for `+OK`.
    pub fn is_ok(&self) -> bool {
        matches!(self, Value::Simple(s) if s == "OK")
    }

    pub fn as_bulk(&self) -> Option<&Bytes> {
        match self {
            Value::Bulk(Some(b)) => Some(b),
            _ => None,
        }
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Value::Integer(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(Some(items)) => Some(items),
            _ => None,
        }
    }

    pub fn into_array(self) -> Option<Vec<Value>> {
        match self {
            Value::Array(Some(items)) => Some(items),
            _ => None,
        }
    }

    /// Classify an error reply by its leading keyword.
    ///
    /// Returns `None` for non-error values.
    pub fn error_kind(&self) -> Option<ErrorKind> {
        let text = match self {
            Value::Error(text) => text,
            _ => return None,
        };
        let mut parts = text.splitn(3, ' ');
        let keyword = parts.next().unwrap_or("");
        Some(match keyword {
            "MOVED" | "ASK" => {
                let slot = parts.next().and_then(|s| s.parse::<u16>().ok());
                let endpoint = parts
                    .next()
                    .and_then(|addr| Endpoint::from_host_port(addr).ok());
                match (slot, endpoint) {
                    (Some(slot), Some(endpoint)) if keyword == "MOVED" => {
                        ErrorKind::Moved { slot, endpoint }
                    }
                    (Some(slot), Some(endpoint)) => ErrorKind::Ask { slot, endpoint },
                    _ => ErrorKind::Other,
                }
            }
            "TRYAGAIN" => ErrorKind::TryAgain,
            "CLUSTERDOWN" => ErrorKind::ClusterDown,
            "NOAUTH" => ErrorKind::NoAuth,
            _ => ErrorKind::Other,
        })
    }
}

/// Recoverable error reply classification used by the router.
#[derive(Debug, Clone, PartialEq)]
pub enum ErrorKind {
    /// Slot permanently moved; the topology cache must be invalidated.
    Moved { slot: u16, endpoint: Endpoint },
    /// Slot temporarily served elsewhere; retry with an ASKING marker.
    Ask { slot: u16, endpoint: Endpoint },
    TryAgain,
    ClusterDown,
    NoAuth,
    /// Any other server error, surfaced to the caller unchanged.
    Other,
}
