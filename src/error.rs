use thiserror::Error;

#[derive(Error, Debug)]
pub enum KvError {
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("server error: {0}")]
    Server(String),

    #[error("cross-slot request: keys map to slots {0} and {1}")]
    CrossSlot(u16, u16),

    #[error("no endpoint known for slot {0}")]
    NoEndpoint(u16),

    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("wrong number of arguments for '{0}' command")]
    WrongArgCount(String),

    #[error("connection in-flight queue full")]
    QueueFull,

    #[error("connection closed")]
    ConnectionClosed,

    #[error("connection pool exhausted")]
    PoolExhausted,

    #[error("topology refresh failed: {0}")]
    TopologyUnavailable(String),
}

impl KvError {
    /// True for errors that tear down the owning connection.
    pub fn is_fatal(&self) -> bool {
        matches!(self, KvError::Transport(_) | KvError::Protocol(_))
    }
}

pub type Result<T> = std::result::Result<T, KvError>;
