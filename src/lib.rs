pub mod cluster;
pub mod command;
pub mod config;
pub mod connection;
pub mod error;
pub mod protocol;

pub use cluster::ClusterRouter;
pub use command::Request;
pub use config::{ClientConfig, Endpoint, ReplicaReads};
pub use connection::{Connection, ConnectionPool, Connector};
pub use error::{KvError, Result};
pub use protocol::Value;
