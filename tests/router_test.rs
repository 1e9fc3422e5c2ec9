//! Router integration tests against a scripted in-memory cluster.
//!
//! Two masters: node-a owns slots 0..8191, node-b owns 8192..16383.
//! Well-known slots used below: foo = 12182, bar = 5061, foobar = 12325.

use kvlink::cluster::ClusterRouter;
use kvlink::command::Request;
use kvlink::config::{ClientConfig, Endpoint, RetryConfig};
use kvlink::connection::{BoxedTransport, ConnectFuture, Connector};
use kvlink::{KvError, Value};
use bytes::Bytes;
use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Once};
use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};
use tracing_subscriber::EnvFilter;

/// Route test logs through `RUST_LOG`, once per process.
fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

type Handler = Arc<dyn Fn(&[u8]) -> Vec<u8> + Send + Sync>;

/// Connector backed by per-endpoint reply scripts over in-memory pipes.
struct FakeCluster {
    handlers: Mutex<HashMap<Endpoint, Handler>>,
    dials: Mutex<Vec<Endpoint>>,
}

impl FakeCluster {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            handlers: Mutex::new(HashMap::new()),
            dials: Mutex::new(Vec::new()),
        })
    }

    fn node<F>(&self, endpoint: Endpoint, handler: F)
    where
        F: Fn(&[u8]) -> Vec<u8> + Send + Sync + 'static,
    {
        self.handlers
            .lock()
            .unwrap()
            .insert(endpoint, Arc::new(handler));
    }

    fn dial_count(&self) -> usize {
        self.dials.lock().unwrap().len()
    }

    fn dials_to(&self, endpoint: &Endpoint) -> usize {
        self.dials
            .lock()
            .unwrap()
            .iter()
            .filter(|e| *e == endpoint)
            .count()
    }
}

impl Connector for FakeCluster {
    fn connect<'a>(&'a self, endpoint: &'a Endpoint) -> ConnectFuture<'a> {
        Box::pin(async move {
            self.dials.lock().unwrap().push(endpoint.clone());
            let handler = self
                .handlers
                .lock()
                .unwrap()
                .get(endpoint)
                .cloned()
                .ok_or_else(|| {
                    KvError::Transport(io::Error::new(
                        io::ErrorKind::ConnectionRefused,
                        format!("no such node: {endpoint}"),
                    ))
                })?;

            let (client, mut server) = duplex(16384);
            tokio::spawn(async move {
                let mut buf = vec![0u8; 8192];
                loop {
                    match server.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => {
                            let reply = handler(&buf[..n]);
                            if server.write_all(&reply).await.is_err() {
                                return;
                            }
                        }
                    }
                }
            });
            Ok(Box::new(client) as BoxedTransport)
        })
    }
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}

fn node_a() -> Endpoint {
    Endpoint::tcp("node-a", 7000)
}

fn node_b() -> Endpoint {
    Endpoint::tcp("node-b", 7001)
}

fn node_c() -> Endpoint {
    Endpoint::tcp("node-c", 7002)
}

/// CLUSTER SLOTS reply: node-a owns 0..8191, node-b owns 8192..16383.
fn topology_reply() -> Vec<u8> {
    b"*2\r\n\
      *3\r\n:0\r\n:8191\r\n*2\r\n$6\r\nnode-a\r\n:7000\r\n\
      *3\r\n:8192\r\n:16383\r\n*2\r\n$6\r\nnode-b\r\n:7001\r\n"
        .to_vec()
}

fn config() -> ClientConfig {
    init_tracing();
    ClientConfig::new("redis://node-a:7000").with_retry(RetryConfig {
        max_hops: 5,
        backoff_base_ms: 1,
        backoff_ceiling_ms: 4,
    })
}

fn req(parts: &[&str]) -> Request {
    Request::new(parts.iter().map(|s| Bytes::from(s.to_string()))).unwrap()
}

/// Seed node answering CLUSTER SLOTS, counting queries, and delegating
/// everything else.
fn seed_node<F>(cluster: &FakeCluster, slots_queries: Arc<AtomicUsize>, rest: F)
where
    F: Fn(&[u8]) -> Vec<u8> + Send + Sync + 'static,
{
    cluster.node(node_a(), move |frame| {
        if contains(frame, b"CLUSTER") {
            slots_queries.fetch_add(1, Ordering::SeqCst);
            topology_reply()
        } else {
            rest(frame)
        }
    });
}

#[tokio::test]
async fn test_routes_single_key_to_slot_owner() {
    let cluster = FakeCluster::new();
    let slots_queries = Arc::new(AtomicUsize::new(0));
    seed_node(&cluster, slots_queries.clone(), |_| b"-ERR wrong node\r\n".to_vec());
    cluster.node(node_b(), |frame| {
        assert!(contains(frame, b"GET"));
        b"$3\r\nval\r\n".to_vec()
    });

    let router = ClusterRouter::with_connector(config(), cluster.clone()).unwrap();
    let reply = router.send(&req(&["GET", "foobar"])).await.unwrap();
    assert_eq!(reply, Value::bulk("val"));
    assert_eq!(slots_queries.load(Ordering::SeqCst), 1);
    assert_eq!(cluster.dials_to(&node_b()), 1);
}

#[tokio::test]
async fn test_moved_invalidates_and_retries_at_target() {
    let cluster = FakeCluster::new();
    let slots_queries = Arc::new(AtomicUsize::new(0));
    seed_node(&cluster, slots_queries.clone(), |_| b"-ERR wrong node\r\n".to_vec());

    let moved_sent = Arc::new(AtomicBool::new(false));
    let flag = moved_sent.clone();
    cluster.node(node_b(), move |_| {
        if !flag.swap(true, Ordering::SeqCst) {
            b"-MOVED 12325 node-c:7002\r\n".to_vec()
        } else {
            b"$3\r\nval\r\n".to_vec()
        }
    });
    cluster.node(node_c(), |_| b"$3\r\nval\r\n".to_vec());

    let router = ClusterRouter::with_connector(config(), cluster.clone()).unwrap();

    let reply = router.send(&req(&["GET", "foobar"])).await.unwrap();
    assert_eq!(reply, Value::bulk("val"));
    assert_eq!(cluster.dials_to(&node_c()), 1);
    assert_eq!(slots_queries.load(Ordering::SeqCst), 1);

    // MOVED invalidated the table: the next dispatch refreshes exactly once.
    let reply = router.send(&req(&["GET", "foobar"])).await.unwrap();
    assert_eq!(reply, Value::bulk("val"));
    assert_eq!(slots_queries.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_ask_sends_asking_without_invalidation() {
    let cluster = FakeCluster::new();
    let slots_queries = Arc::new(AtomicUsize::new(0));
    seed_node(&cluster, slots_queries.clone(), |_| b"-ERR wrong node\r\n".to_vec());
    cluster.node(node_b(), |_| b"-ASK 12325 node-c:7002\r\n".to_vec());

    let saw_asking = Arc::new(AtomicBool::new(false));
    let asking = saw_asking.clone();
    cluster.node(node_c(), move |frame| {
        if contains(frame, b"ASKING") {
            asking.store(true, Ordering::SeqCst);
            b"+OK\r\n".to_vec()
        } else {
            b"$3\r\nval\r\n".to_vec()
        }
    });

    let router = ClusterRouter::with_connector(config(), cluster.clone()).unwrap();
    let reply = router.send(&req(&["GET", "foobar"])).await.unwrap();
    assert_eq!(reply, Value::bulk("val"));
    assert!(saw_asking.load(Ordering::SeqCst));
    // ASK is transient: no topology refresh beyond the first.
    assert_eq!(slots_queries.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_tryagain_backs_off_and_retries_same_endpoint() {
    let cluster = FakeCluster::new();
    let slots_queries = Arc::new(AtomicUsize::new(0));
    seed_node(&cluster, slots_queries.clone(), |_| b"-ERR wrong node\r\n".to_vec());

    let failed_once = Arc::new(AtomicBool::new(false));
    let flag = failed_once.clone();
    cluster.node(node_b(), move |_| {
        if !flag.swap(true, Ordering::SeqCst) {
            b"-TRYAGAIN Multiple keys request during rehashing\r\n".to_vec()
        } else {
            b"$3\r\nval\r\n".to_vec()
        }
    });

    let router = ClusterRouter::with_connector(config(), cluster.clone()).unwrap();
    let reply = router.send(&req(&["GET", "foobar"])).await.unwrap();
    assert_eq!(reply, Value::bulk("val"));
    assert_eq!(slots_queries.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_hop_budget_exhaustion_surfaces_last_error() {
    let cluster = FakeCluster::new();
    let slots_queries = Arc::new(AtomicUsize::new(0));
    seed_node(&cluster, slots_queries.clone(), |_| b"-ERR wrong node\r\n".to_vec());
    // Two nodes bouncing the slot between each other forever.
    cluster.node(node_b(), |_| b"-MOVED 12325 node-c:7002\r\n".to_vec());
    cluster.node(node_c(), |_| b"-MOVED 12325 node-b:7001\r\n".to_vec());

    let router = ClusterRouter::with_connector(config(), cluster.clone()).unwrap();
    let err = router.send(&req(&["GET", "foobar"])).await.unwrap_err();
    match err {
        KvError::Server(text) => assert!(text.starts_with("MOVED")),
        other => panic!("expected server error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_cross_slot_rejected_before_any_io() {
    let cluster = FakeCluster::new();
    let router = ClusterRouter::with_connector(config(), cluster.clone()).unwrap();

    let err = router
        .send(&req(&["SMOVE", "foo", "bar", "member"]))
        .await
        .unwrap_err();
    assert!(matches!(err, KvError::CrossSlot(_, _)));

    let batch = vec![req(&["GET", "foo"]), req(&["GET", "bar"])];
    let err = router.batch(&batch).await.unwrap_err();
    assert!(matches!(err, KvError::CrossSlot(_, _)));

    // Neither rejection touched the network.
    assert_eq!(cluster.dial_count(), 0);
}

#[tokio::test]
async fn test_batch_runs_on_one_connection_in_order() {
    let cluster = FakeCluster::new();
    let slots_queries = Arc::new(AtomicUsize::new(0));
    seed_node(&cluster, slots_queries.clone(), |_| b"-ERR wrong node\r\n".to_vec());
    cluster.node(node_b(), |frame| {
        // The whole pipeline arrives as one contiguous write.
        let frames = frame.iter().filter(|&&b| b == b'*').count();
        assert_eq!(frames, 2);
        b"$1\r\na\r\n$1\r\nb\r\n".to_vec()
    });

    let router = ClusterRouter::with_connector(config(), cluster.clone()).unwrap();
    let batch = vec![
        req(&["GET", "{foobar}:1"]),
        req(&["GET", "{foobar}:2"]),
    ];
    let replies = router.batch(&batch).await.unwrap();
    assert_eq!(replies, vec![Value::bulk("a"), Value::bulk("b")]);
}

#[tokio::test]
async fn test_keyless_fanout_sums_integer_replies() {
    let cluster = FakeCluster::new();
    let slots_queries = Arc::new(AtomicUsize::new(0));
    seed_node(&cluster, slots_queries.clone(), |frame| {
        assert!(contains(frame, b"DBSIZE"));
        b":2\r\n".to_vec()
    });
    cluster.node(node_b(), |frame| {
        assert!(contains(frame, b"DBSIZE"));
        b":3\r\n".to_vec()
    });

    let router = ClusterRouter::with_connector(config(), cluster.clone()).unwrap();
    let reply = router.send(&req(&["DBSIZE"])).await.unwrap();
    assert_eq!(reply, Value::integer(5));
}

#[tokio::test]
async fn test_cross_slot_mget_splits_and_merges_in_key_order() {
    let cluster = FakeCluster::new();
    let slots_queries = Arc::new(AtomicUsize::new(0));
    // bar (5061) lives on node-a, foo (12182) on node-b.
    seed_node(&cluster, slots_queries.clone(), |frame| {
        assert!(contains(frame, b"bar"));
        b"*1\r\n$4\r\nvbar\r\n".to_vec()
    });
    cluster.node(node_b(), |frame| {
        assert!(contains(frame, b"foo"));
        b"*1\r\n$4\r\nvfoo\r\n".to_vec()
    });

    let router = ClusterRouter::with_connector(config(), cluster.clone()).unwrap();
    let reply = router.send(&req(&["MGET", "foo", "bar"])).await.unwrap();
    assert_eq!(
        reply,
        Value::array(vec![Value::bulk("vfoo"), Value::bulk("vbar")])
    );
}

#[tokio::test]
async fn test_transport_failure_refreshes_topology_once() {
    let cluster = FakeCluster::new();
    let slots_queries = Arc::new(AtomicUsize::new(0));
    seed_node(&cluster, slots_queries.clone(), |_| b"-ERR wrong node\r\n".to_vec());
    // node-b is never registered, so dialing it fails.

    let router = ClusterRouter::with_connector(config(), cluster.clone()).unwrap();
    let err = router.send(&req(&["GET", "foobar"])).await.unwrap_err();
    assert!(matches!(err, KvError::Transport(_)));
    // First refresh for routing, one more after the dial failure.
    assert_eq!(slots_queries.load(Ordering::SeqCst), 2);
}
