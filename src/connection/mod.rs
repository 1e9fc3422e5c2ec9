//! Connection handling
//!
//! A [`Connection`] owns one transport stream and pairs outgoing requests
//! with incoming replies in strict FIFO order. Batches are encoded into a
//! single contiguous write so pipelining is atomic from the transport's
//! perspective. A connection that has carried session state (AUTH, SELECT,
//! subscriptions) is tainted and must never be returned to the pool.

pub mod pool;

use crate::config::Endpoint;
use crate::error::{KvError, Result};
use crate::protocol::{Decoder, Value};
use crate::command::Request;
use bytes::BytesMut;
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, warn};

pub use pool::{ConnectionPool, PooledConnection};

/// Sink for out-of-band push frames (pub/sub, cache invalidation).
pub type PushSink = Arc<dyn Fn(Value) + Send + Sync>;

/// Object-safe transport stream.
pub trait Transport: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> Transport for T {}

pub type BoxedTransport = Box<dyn Transport>;

pub type ConnectFuture<'a> = Pin<Box<dyn Future<Output = Result<BoxedTransport>> + Send + 'a>>;

/// Transport factory, abstracted so tests can drive connections over
/// in-memory pipes.
pub trait Connector: Send + Sync + 'static {
    fn connect<'a>(&'a self, endpoint: &'a Endpoint) -> ConnectFuture<'a>;
}

/// Default TCP / Unix socket connector.
#[derive(Debug, Default)]
pub struct NetConnector;

impl Connector for NetConnector {
    fn connect<'a>(&'a self, endpoint: &'a Endpoint) -> ConnectFuture<'a> {
        Box::pin(async move {
            match endpoint {
                Endpoint::Tcp { host, port } => {
                    let stream = TcpStream::connect((host.as_str(), *port)).await?;
                    // Small request/reply payloads; Nagle only adds latency.
                    stream.set_nodelay(true)?;
                    Ok(Box::new(stream) as BoxedTransport)
                }
                #[cfg(unix)]
                Endpoint::Unix { path } => {
                    let stream = tokio::net::UnixStream::connect(path).await?;
                    Ok(Box::new(stream) as BoxedTransport)
                }
                #[cfg(not(unix))]
                Endpoint::Unix { .. } => Err(KvError::InvalidEndpoint(
                    "unix sockets unsupported on this platform".to_string(),
                )),
            }
        })
    }
}

/// One pending reply record in the in-flight queue.
#[derive(Debug)]
struct Pending {
    command: String,
}

/// A single client connection.
pub struct Connection {
    stream: BoxedTransport,
    endpoint: Endpoint,
    decoder: Decoder,
    write_buf: BytesMut,
    inflight: VecDeque<Pending>,
    capacity: usize,
    tainted: bool,
    closed: bool,
    expires_at: Instant,
    push_sink: Option<PushSink>,
}

impl Connection {
    pub fn new(
        stream: BoxedTransport,
        endpoint: Endpoint,
        capacity: usize,
        max_reply_depth: usize,
        idle_timeout: Duration,
    ) -> Self {
        Self {
            stream,
            endpoint,
            decoder: Decoder::new(8192, max_reply_depth),
            write_buf: BytesMut::with_capacity(512),
            inflight: VecDeque::with_capacity(capacity),
            capacity,
            tainted: false,
            closed: false,
            expires_at: Instant::now() + idle_timeout,
            push_sink: None,
        }
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn set_push_sink(&mut self, sink: PushSink) {
        self.push_sink = Some(sink);
    }

    pub fn is_tainted(&self) -> bool {
        self.tainted
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }

    /// Send one request and await its reply.
    pub async fn send(&mut self, request: &Request) -> Result<Value> {
        let mut replies = self.batch(std::slice::from_ref(request)).await?;
        Ok(replies.pop().expect("one reply per request"))
    }

    /// Pipeline a batch: one contiguous write, then replies strictly in
    /// submission order.
    ///
    /// Fails with [`KvError::QueueFull`] before writing anything if the
    /// in-flight queue cannot admit the whole batch.
    pub async fn batch(&mut self, requests: &[Request]) -> Result<Vec<Value>> {
        if self.closed {
            return Err(KvError::ConnectionClosed);
        }
        if requests.is_empty() {
            return Ok(Vec::new());
        }
        if self.inflight.len() + requests.len() > self.capacity {
            return Err(KvError::QueueFull);
        }

        self.write_buf.clear();
        for request in requests {
            request.encode_into(&mut self.write_buf);
        }

        if let Err(e) = self.write_all().await {
            self.teardown();
            return Err(e);
        }

        for request in requests {
            let command = pending_name(request);
            if request.taints() {
                debug!(endpoint = %self.endpoint, command = %command, "connection tainted");
                self.tainted = true;
            }
            self.inflight.push_back(Pending { command });
        }

        let mut replies = Vec::with_capacity(requests.len());
        while replies.len() < requests.len() {
            match self.read_reply().await {
                Ok(value) => replies.push(value),
                Err(e) => {
                    self.teardown();
                    return Err(e);
                }
            }
        }
        Ok(replies)
    }

    /// Send a raw command outside the request path (handshake, ASKING).
    /// Does not mark taint: pool handshake state is uniform per pool.
    pub async fn send_raw(&mut self, args: &[&[u8]]) -> Result<Value> {
        if self.closed {
            return Err(KvError::ConnectionClosed);
        }
        if self.inflight.len() >= self.capacity {
            return Err(KvError::QueueFull);
        }

        self.write_buf.clear();
        crate::protocol::encode_args(args, &mut self.write_buf);
        if let Err(e) = self.write_all().await {
            self.teardown();
            return Err(e);
        }
        self.inflight.push_back(Pending {
            command: String::from_utf8_lossy(args[0]).to_ascii_uppercase(),
        });

        match self.read_reply().await {
            Ok(value) => Ok(value),
            Err(e) => {
                self.teardown();
                Err(e)
            }
        }
    }

    /// Authenticate (or re-authenticate after NOAUTH) on this connection.
    pub async fn authenticate(&mut self, password: &str) -> Result<()> {
        let reply = self.send_raw(&[b"AUTH", password.as_bytes()]).await?;
        match reply {
            Value::Error(e) => Err(KvError::Server(e)),
            _ => Ok(()),
        }
    }

    /// Perform the connect-time handshake before the connection is handed
    /// out: AUTH and SELECT as configured.
    pub async fn handshake(&mut self, password: Option<&str>, db: u32) -> Result<()> {
        if let Some(password) = password {
            self.authenticate(password).await?;
        }
        if db > 0 {
            let reply = self
                .send_raw(&[b"SELECT", db.to_string().as_bytes()])
                .await?;
            if let Value::Error(e) = reply {
                return Err(KvError::Server(e));
            }
        }
        Ok(())
    }

    /// Prepare the connection for pool reuse.
    ///
    /// Succeeds only if not closed and not tainted; a tainted connection
    /// silently carries session state that would corrupt a future borrower,
    /// so the pool force-closes it instead.
    pub fn reset(&mut self, idle_timeout: Duration) -> Result<()> {
        if self.closed {
            return Err(KvError::ConnectionClosed);
        }
        if self.tainted {
            return Err(KvError::Server("tainted connection".to_string()));
        }
        self.expires_at = Instant::now() + idle_timeout;
        Ok(())
    }

    async fn write_all(&mut self) -> Result<()> {
        self.stream.write_all(&self.write_buf).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Read until the next non-push reply, delivering pushes to the sink.
    async fn read_reply(&mut self) -> Result<Value> {
        loop {
            match self.decoder.next()? {
                Some(Value::Push(items)) => {
                    // Push frames never consume an in-flight waiter.
                    if let Some(sink) = &self.push_sink {
                        sink(Value::Push(items));
                    } else {
                        debug!(endpoint = %self.endpoint, "dropping push frame without sink");
                    }
                }
                Some(value) => {
                    self.inflight.pop_front();
                    return Ok(value);
                }
                None => {
                    let n = self.stream.read_buf(self.decoder.buffer_mut()).await?;
                    if n == 0 {
                        return Err(KvError::ConnectionClosed);
                    }
                }
            }
        }
    }

    /// Tear down after a transport or protocol failure: every still-queued
    /// reply record is failed with the terminal cause.
    fn teardown(&mut self) {
        self.closed = true;
        if let Some(head) = self.inflight.front() {
            warn!(
                endpoint = %self.endpoint,
                abandoned = self.inflight.len(),
                head = %head.command,
                "connection torn down with replies outstanding"
            );
            self.inflight.clear();
        }
    }
}

fn pending_name(request: &Request) -> String {
    String::from_utf8_lossy(request.command()).to_ascii_uppercase()
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("endpoint", &self.endpoint)
            .field("inflight", &self.inflight.len())
            .field("tainted", &self.tainted)
            .field("closed", &self.closed)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use tokio::io::duplex;

    fn test_conn(server_replies: &'static [u8]) -> Connection {
        let (client, mut server) = duplex(4096);
        tokio::spawn(async move {
            let mut sink = Vec::new();
            // Drain whatever the client writes, then feed canned replies.
            let mut buf = [0u8; 1024];
            let _ = server.read(&mut buf).await;
            server.write_all(server_replies).await.unwrap();
            let _ = server.read_to_end(&mut sink).await;
        });
        Connection::new(
            Box::new(client),
            Endpoint::tcp("test", 0),
            16,
            32,
            Duration::from_secs(60),
        )
    }

    #[tokio::test]
    async fn test_send_receives_reply() {
        let mut conn = test_conn(b"$3\r\nbar\r\n");
        let req = Request::new(["GET", "foo"].map(Bytes::from)).unwrap();
        let reply = conn.send(&req).await.unwrap();
        assert_eq!(reply, Value::bulk("bar"));
        assert!(!conn.is_tainted());
        assert!(!conn.is_closed());
    }

    #[tokio::test]
    async fn test_batch_replies_in_order() {
        let mut conn = test_conn(b"+OK\r\n:1\r\n$1\r\na\r\n");
        let reqs = vec![
            Request::new(["SET", "k", "a"].map(Bytes::from)).unwrap(),
            Request::new(["INCR", "n"].map(Bytes::from)).unwrap(),
            Request::new(["GET", "k"].map(Bytes::from)).unwrap(),
        ];
        let replies = conn.batch(&reqs).await.unwrap();
        assert_eq!(
            replies,
            vec![Value::ok(), Value::integer(1), Value::bulk("a")]
        );
    }

    #[tokio::test]
    async fn test_taint_on_select() {
        let mut conn = test_conn(b"+OK\r\n");
        let req = Request::new(["SELECT", "1"].map(Bytes::from)).unwrap();
        conn.send(&req).await.unwrap();
        assert!(conn.is_tainted());
        assert!(conn.reset(Duration::from_secs(1)).is_err());
    }

    #[tokio::test]
    async fn test_queue_full_fails_before_write() {
        let (client, _server) = duplex(64);
        let mut conn = Connection::new(
            Box::new(client),
            Endpoint::tcp("test", 0),
            2,
            32,
            Duration::from_secs(60),
        );
        let reqs: Vec<Request> = (0..3)
            .map(|i| Request::new(["GET".to_string(), format!("k{}", i)].map(Bytes::from)).unwrap())
            .collect();
        assert!(matches!(
            conn.batch(&reqs).await,
            Err(KvError::QueueFull)
        ));
        // Admission failure is not fatal to the connection.
        assert!(!conn.is_closed());
    }

    #[tokio::test]
    async fn test_push_routed_to_sink() {
        let mut conn = test_conn(b">2\r\n+invalidate\r\n$1\r\nk\r\n+PONG\r\n");
        let pushes = Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink_pushes = pushes.clone();
        conn.set_push_sink(Arc::new(move |v| {
            sink_pushes.lock().unwrap().push(v);
        }));

        let req = Request::new(["PING"].map(Bytes::from)).unwrap();
        let reply = conn.send(&req).await.unwrap();
        assert_eq!(reply, Value::simple("PONG"));
        assert_eq!(pushes.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_protocol_error_closes_connection() {
        let mut conn = test_conn(b"?bogus\r\n");
        let req = Request::new(["PING"].map(Bytes::from)).unwrap();
        assert!(matches!(
            conn.send(&req).await,
            Err(KvError::Protocol(_))
        ));
        assert!(conn.is_closed());
        assert!(matches!(
            conn.send(&req).await,
            Err(KvError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_peer_close_fails_pending() {
        let (client, server) = duplex(64);
        drop(server);
        let mut conn = Connection::new(
            Box::new(client),
            Endpoint::tcp("test", 0),
            16,
            32,
            Duration::from_secs(60),
        );
        let req = Request::new(["GET", "k"].map(Bytes::from)).unwrap();
        let err = conn.send(&req).await.unwrap_err();
        assert!(matches!(
            err,
            KvError::ConnectionClosed | KvError::Transport(_)
        ));
        assert!(conn.is_closed());
    }
}
