//! Cluster router
//!
//! Resolves the target endpoint(s) for a request or batch from its keys and
//! the replica-read policy, then drives redirection recovery: MOVED
//! invalidates the topology cache and retries at the new endpoint, ASK
//! retries behind an ASKING marker without invalidation, TRYAGAIN and
//! CLUSTERDOWN back off exponentially against the same endpoint, NOAUTH
//! re-authenticates in place. Every retry consumes one hop from a bounded
//! budget.

use crate::cluster::topology::{SlotTable, TopologyCache};
use crate::command::{FindKeys, Request};
use crate::config::{ClientConfig, Endpoint, ReplicaReads};
use crate::connection::{
    ConnectionPool, Connector, NetConnector, PooledConnection, PushSink,
};
use crate::connection::pool::PoolOptions;
use crate::error::{KvError, Result};
use crate::protocol::{ErrorKind, Value};
use bytes::Bytes;
use rand::Rng;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

/// Commands that always go to a master regardless of key analysis:
/// administrative and blocking commands.
fn force_master(name: &str) -> bool {
    matches!(
        name,
        "WAIT"
            | "SHUTDOWN"
            | "CONFIG"
            | "SCRIPT"
            | "FUNCTION"
            | "CLUSTER"
            | "CLIENT"
            | "BLPOP"
            | "BRPOP"
            | "BLMOVE"
            | "BRPOPLPUSH"
            | "BLMPOP"
            | "BZMPOP"
            | "BZPOPMIN"
            | "BZPOPMAX"
    )
}

/// How per-node or per-slot partial replies are merged.
#[derive(Debug, Clone, Copy, PartialEq)]
enum Reducer {
    /// Sum integer replies (DEL, EXISTS, DBSIZE, ...).
    IntSum,
    /// All replies must be +OK (MSET, FLUSHALL, ...).
    OkStatus,
    /// Concatenate array replies (KEYS).
    ArrayConcat,
    /// Positional merge of per-key values back into key order (MGET).
    Merge,
}

/// Reducer for keyless commands fanned out to every master.
fn fanout_reducer(name: &str) -> Option<Reducer> {
    match name {
        "DBSIZE" => Some(Reducer::IntSum),
        "KEYS" => Some(Reducer::ArrayConcat),
        "FLUSHALL" | "FLUSHDB" => Some(Reducer::OkStatus),
        _ => None,
    }
}

/// Reducer allowing a cross-slot multi-key command to be split per slot.
fn split_reducer(name: &str) -> Option<Reducer> {
    match name {
        "MGET" => Some(Reducer::Merge),
        "MSET" => Some(Reducer::OkStatus),
        "DEL" | "UNLINK" | "EXISTS" | "TOUCH" => Some(Reducer::IntSum),
        _ => None,
    }
}

/// Resolved routing decision for one request.
#[derive(Debug, Clone, PartialEq)]
enum Plan {
    Slot(u16),
    AnyNode,
    AnyMaster,
    FanOut(Reducer),
    Split(Reducer),
}

/// Where an attempt is directed.
#[derive(Debug, Clone, Copy)]
enum TargetMode {
    Slot(u16),
    AnyNode,
    AnyMaster,
}

enum Attempt<'a> {
    One(&'a Request),
    Many(&'a [Request]),
}

/// Cluster-aware request router.
pub struct ClusterRouter {
    config: ClientConfig,
    connector: Arc<dyn Connector>,
    topology: TopologyCache,
    password: Option<String>,
    db: u32,
    pools: Mutex<HashMap<Endpoint, ConnectionPool>>,
    /// Pointer identity of the last slot table seen, for pool pruning.
    last_table: Mutex<usize>,
    push_sink: Option<PushSink>,
    seeds: Vec<Endpoint>,
}

impl ClusterRouter {
    /// Build a router dialing real TCP/Unix transports.
    pub fn new(config: ClientConfig) -> Result<Self> {
        Self::with_connector(config, Arc::new(NetConnector))
    }

    /// Build a router over a custom transport factory.
    pub fn with_connector(config: ClientConfig, connector: Arc<dyn Connector>) -> Result<Self> {
        let (seeds, password, db) = config.resolve_seeds()?;
        let topology = TopologyCache::new(
            seeds.clone(),
            connector.clone(),
            password.clone(),
            db,
            config.topology_ttl(),
            config.inflight_capacity,
            config.max_reply_depth,
        );
        Ok(Self {
            config,
            connector,
            topology,
            password,
            db,
            pools: Mutex::new(HashMap::new()),
            last_table: Mutex::new(0),
            push_sink: None,
            seeds,
        })
    }

    /// Install the sink receiving out-of-band push frames on every pooled
    /// connection.
    pub fn with_push_sink(mut self, sink: PushSink) -> Self {
        self.push_sink = Some(sink);
        self
    }

    /// Route a single request and await its decoded reply.
    ///
    /// Unrecovered error replies surface as [`KvError::Server`].
    pub async fn send(&self, request: &Request) -> Result<Value> {
        let value = match self.plan(request)? {
            Plan::Slot(slot) => {
                let readonly = self.replica_eligible(request);
                let mut replies = self
                    .run(Attempt::One(request), TargetMode::Slot(slot), readonly)
                    .await?;
                replies.pop().expect("one reply")
            }
            Plan::AnyNode => {
                let mut replies = self
                    .run(Attempt::One(request), TargetMode::AnyNode, true)
                    .await?;
                replies.pop().expect("one reply")
            }
            Plan::AnyMaster => {
                let mut replies = self
                    .run(Attempt::One(request), TargetMode::AnyMaster, false)
                    .await?;
                replies.pop().expect("one reply")
            }
            Plan::FanOut(reducer) => self.fan_out(request, reducer).await?,
            Plan::Split(reducer) => self.split(request, reducer).await?,
        };
        match value {
            Value::Error(text) => Err(KvError::Server(text)),
            value => Ok(value),
        }
    }

    /// Route a pipelined batch to a single connection.
    ///
    /// The whole batch must agree on one slot; the check runs before any
    /// I/O. Replies come back in submission order, error replies included.
    pub async fn batch(&self, requests: &[Request]) -> Result<Vec<Value>> {
        if requests.is_empty() {
            return Ok(Vec::new());
        }

        let mut slot: Option<u16> = None;
        for request in requests {
            for &s in request.slots() {
                match slot {
                    None => slot = Some(s),
                    Some(first) if first != s => return Err(KvError::CrossSlot(first, s)),
                    _ => {}
                }
            }
        }

        // A batch may carry a stateful sequence, so it always executes
        // against a master.
        let mode = match slot {
            Some(slot) => TargetMode::Slot(slot),
            None => TargetMode::AnyMaster,
        };
        self.run(Attempt::Many(requests), mode, false).await
    }

    /// Decide the routing strategy for a request.
    fn plan(&self, request: &Request) -> Result<Plan> {
        let name = request
            .descriptor()
            .map(|d| d.name.to_string())
            .unwrap_or_else(|| {
                String::from_utf8_lossy(request.command()).to_ascii_uppercase()
            });

        if request.needs_master() || force_master(&name) {
            return Ok(match request.slot() {
                slot if slot >= 0 => Plan::Slot(slot as u16),
                _ => Plan::AnyMaster,
            });
        }

        let slots = request.slots();
        if slots.is_empty() {
            return Ok(match fanout_reducer(&name) {
                Some(reducer) => Plan::FanOut(reducer),
                None => Plan::AnyNode,
            });
        }

        let first = slots[0];
        if slots.iter().all(|&s| s == first) {
            return Ok(Plan::Slot(first));
        }

        let conflicting = slots.iter().copied().find(|&s| s != first).unwrap_or(first);
        match split_reducer(&name) {
            Some(reducer) => Ok(Plan::Split(reducer)),
            None => Err(KvError::CrossSlot(first, conflicting)),
        }
    }

    fn replica_eligible(&self, request: &Request) -> bool {
        request.is_readonly()
            && request.descriptor().map(|d| !d.movable).unwrap_or(false)
    }

    /// Dispatch loop with redirection recovery and a bounded hop budget.
    async fn run(
        &self,
        attempt: Attempt<'_>,
        mode: TargetMode,
        readonly: bool,
    ) -> Result<Vec<Value>> {
        let mut hops = self.config.retry.max_hops;
        let mut target: Option<Endpoint> = None;
        let mut asking = false;
        let mut backoff_attempt = 0u32;
        let mut refreshed_after_transport = false;

        loop {
            let endpoint = match &target {
                Some(endpoint) => endpoint.clone(),
                None => self.pick_endpoint(mode, readonly).await?,
            };

            let result = self
                .attempt_on(&endpoint, &attempt, asking, hops > 0)
                .await;
            asking = false;

            let replies = match result {
                Ok(replies) => replies,
                Err(e) if e.is_fatal() || matches!(e, KvError::ConnectionClosed) => {
                    // One topology refresh-and-retry on transport failure,
                    // never an unbounded loop.
                    if refreshed_after_transport {
                        return Err(e);
                    }
                    warn!(endpoint = %endpoint, error = %e, "transport failure, refreshing topology");
                    refreshed_after_transport = true;
                    self.topology.invalidate();
                    target = None;
                    continue;
                }
                Err(e) => return Err(e),
            };

            let redirect = replies
                .iter()
                .find_map(|r| match r.error_kind() {
                    Some(
                        kind @ (ErrorKind::Moved { .. }
                        | ErrorKind::Ask { .. }
                        | ErrorKind::TryAgain
                        | ErrorKind::ClusterDown),
                    ) => Some(kind),
                    _ => None,
                });

            let Some(kind) = redirect else {
                return Ok(replies);
            };
            if hops == 0 {
                // Budget exhausted: surface the last error as-is.
                return Ok(replies);
            }
            hops -= 1;

            match kind {
                ErrorKind::Moved { slot, endpoint: to } => {
                    debug!(slot, to = %to, "MOVED redirection");
                    self.topology.invalidate();
                    target = Some(to);
                }
                ErrorKind::Ask { slot, endpoint: to } => {
                    debug!(slot, to = %to, "ASK redirection");
                    target = Some(to);
                    asking = true;
                }
                ErrorKind::TryAgain | ErrorKind::ClusterDown => {
                    let delay = self.config.retry.backoff(backoff_attempt);
                    debug!(endpoint = %endpoint, delay_ms = delay.as_millis() as u64, "backing off");
                    backoff_attempt += 1;
                    tokio::time::sleep(delay).await;
                    target = Some(endpoint);
                }
                ErrorKind::NoAuth | ErrorKind::Other => {
                    unreachable!("handled in attempt_on or not a redirect")
                }
            }
        }
    }

    /// One dispatch against one endpoint: acquire a lease, optionally send
    /// the ASKING marker, send the payload, and recover NOAUTH in place.
    async fn attempt_on(
        &self,
        endpoint: &Endpoint,
        attempt: &Attempt<'_>,
        asking: bool,
        may_reauth: bool,
    ) -> Result<Vec<Value>> {
        let pool = self.pool_for(endpoint);
        let mut lease = pool.acquire().await?;

        if asking {
            let reply = lease.send_raw(&[b"ASKING"]).await?;
            if let Value::Error(e) = reply {
                return Err(KvError::Server(e));
            }
        }

        let mut replies = self.send_attempt(&mut lease, attempt).await?;

        let noauth = replies
            .iter()
            .any(|r| matches!(r.error_kind(), Some(ErrorKind::NoAuth)));
        if noauth && may_reauth {
            if let Some(password) = self.password.clone() {
                debug!(endpoint = %endpoint, "NOAUTH reply, re-authenticating");
                lease.authenticate(&password).await?;
                replies = self.send_attempt(&mut lease, attempt).await?;
            }
        }
        Ok(replies)
    }

    async fn send_attempt(
        &self,
        lease: &mut PooledConnection,
        attempt: &Attempt<'_>,
    ) -> Result<Vec<Value>> {
        match attempt {
            Attempt::One(request) => Ok(vec![lease.send(request).await?]),
            Attempt::Many(requests) => lease.batch(requests).await,
        }
    }

    /// Fan a keyless command out to every master and reduce the replies.
    async fn fan_out(&self, request: &Request, reducer: Reducer) -> Result<Value> {
        let table = self.topology.get().await?;
        self.prune_pools(&table);
        let masters = table.masters();
        if masters.is_empty() {
            return Err(KvError::TopologyUnavailable("no known masters".to_string()));
        }

        let mut partials = Vec::with_capacity(masters.len());
        for master in &masters {
            let pool = self.pool_for(master);
            let mut lease = pool.acquire().await?;
            partials.push(lease.send(request).await?);
        }
        reduce(reducer, partials)
    }

    /// Split a cross-slot multi-key command into per-slot sub-requests, run
    /// them independently, and reduce.
    async fn split(&self, request: &Request, reducer: Reducer) -> Result<Value> {
        let step = match request.descriptor().and_then(|d| d.key_spec) {
            Some((_, FindKeys::Range { step, .. })) => step,
            _ => 1,
        };
        let positions = request.key_positions();
        let slots = request.slots();
        let args = request.args();

        // Group key indexes by slot, preserving first-seen order.
        let mut groups: Vec<(u16, Vec<usize>)> = Vec::new();
        for (i, &slot) in slots.iter().enumerate() {
            match groups.iter_mut().find(|(s, _)| *s == slot) {
                Some((_, idxs)) => idxs.push(i),
                None => groups.push((slot, vec![i])),
            }
        }

        let mut partials: Vec<(Vec<usize>, Value)> = Vec::with_capacity(groups.len());
        for (slot, idxs) in &groups {
            let mut parts: Vec<Bytes> = Vec::with_capacity(1 + idxs.len() * step);
            parts.push(args[0].clone());
            for &i in idxs {
                let pos = positions[i];
                parts.extend(args[pos..pos + step].iter().cloned());
            }
            let sub = Request::new(parts)?;
            let readonly = self.replica_eligible(request);
            let mut replies = self
                .run(Attempt::One(&sub), TargetMode::Slot(*slot), readonly)
                .await?;
            match replies.pop().expect("one reply") {
                Value::Error(text) => return Err(KvError::Server(text)),
                reply => partials.push((idxs.clone(), reply)),
            }
        }

        if reducer == Reducer::Merge {
            merge_by_position(slots.len(), partials)
        } else {
            reduce(reducer, partials.into_iter().map(|(_, v)| v).collect())
        }
    }

    /// Pick an endpoint for the target mode, refreshing once if the slot is
    /// unmapped.
    async fn pick_endpoint(&self, mode: TargetMode, readonly: bool) -> Result<Endpoint> {
        for retry in [false, true] {
            let table = self.topology.get().await?;
            self.prune_pools(&table);

            let picked = match mode {
                TargetMode::Slot(slot) => table
                    .endpoints_for(slot)
                    .map(|eps| self.select_replica(eps, readonly)),
                TargetMode::AnyMaster => table.masters().first().cloned(),
                TargetMode::AnyNode => table.any_endpoint().cloned(),
            };
            match picked {
                Some(endpoint) => return Ok(endpoint),
                None if !retry => {
                    // Unmapped slot: the table may be stale.
                    self.topology.invalidate();
                }
                None => break,
            }
        }
        match mode {
            TargetMode::Slot(slot) => Err(KvError::NoEndpoint(slot)),
            _ => Err(KvError::TopologyUnavailable(
                "no known endpoints".to_string(),
            )),
        }
    }

    /// Master-vs-replica selection honoring the replica-read policy.
    fn select_replica(&self, endpoints: &[Endpoint], readonly: bool) -> Endpoint {
        if !readonly || endpoints.len() < 2 {
            return endpoints[0].clone();
        }
        match self.config.replica_reads {
            ReplicaReads::Never => endpoints[0].clone(),
            ReplicaReads::Always => {
                let i = rand::thread_rng().gen_range(1..endpoints.len());
                endpoints[i].clone()
            }
            ReplicaReads::ShareWithMaster => {
                let i = rand::thread_rng().gen_range(0..endpoints.len());
                endpoints[i].clone()
            }
        }
    }

    fn pool_for(&self, endpoint: &Endpoint) -> ConnectionPool {
        let mut pools = self.pools.lock().expect("pool map mutex poisoned");
        pools
            .entry(endpoint.clone())
            .or_insert_with(|| {
                ConnectionPool::new(
                    endpoint.clone(),
                    self.connector.clone(),
                    PoolOptions {
                        config: self.config.pool.clone(),
                        password: self.password.clone(),
                        db: self.db,
                        inflight_capacity: self.config.inflight_capacity,
                        max_reply_depth: self.config.max_reply_depth,
                        push_sink: self.push_sink.clone(),
                    },
                )
            })
            .clone()
    }

    /// Tear down pools for endpoints the slot table no longer references.
    /// Runs only when the table instance changes.
    fn prune_pools(&self, table: &Arc<SlotTable>) {
        let marker = Arc::as_ptr(table) as usize;
        {
            let mut last = self.last_table.lock().expect("table marker poisoned");
            if *last == marker {
                return;
            }
            *last = marker;
        }
        let keep = table.all_endpoints();
        let mut pools = self.pools.lock().expect("pool map mutex poisoned");
        pools.retain(|endpoint, _| {
            let kept = keep.contains(endpoint) || self.seeds.contains(endpoint);
            if !kept {
                debug!(endpoint = %endpoint, "dropping pool for departed endpoint");
            }
            kept
        });
    }
}

/// Merge per-key replies back into the original key order (MGET).
fn merge_by_position(
    total_keys: usize,
    partials: Vec<(Vec<usize>, Value)>,
) -> Result<Value> {
    let mut merged = vec![Value::Null; total_keys];
    for (idxs, value) in partials {
        let items = value
            .into_array()
            .ok_or_else(|| KvError::Protocol("expected array reply for merge".to_string()))?;
        if items.len() != idxs.len() {
            return Err(KvError::Protocol(
                "per-slot reply count mismatch".to_string(),
            ));
        }
        for (i, item) in idxs.into_iter().zip(items) {
            merged[i] = item;
        }
    }
    Ok(Value::Array(Some(merged)))
}

fn reduce(reducer: Reducer, partials: Vec<Value>) -> Result<Value> {
    match reducer {
        Reducer::IntSum => {
            let mut sum = 0i64;
            for value in &partials {
                match value {
                    Value::Integer(i) => sum += i,
                    Value::Error(e) => return Err(KvError::Server(e.clone())),
                    _ => {
                        return Err(KvError::Protocol(
                            "expected integer reply in reduction".to_string(),
                        ))
                    }
                }
            }
            Ok(Value::Integer(sum))
        }
        Reducer::OkStatus => {
            for value in &partials {
                if let Value::Error(e) = value {
                    return Err(KvError::Server(e.clone()));
                }
            }
            Ok(Value::ok())
        }
        Reducer::ArrayConcat => {
            let mut out = Vec::new();
            for value in partials {
                match value {
                    Value::Array(Some(items)) => out.extend(items),
                    Value::Array(None) => {}
                    Value::Error(e) => return Err(KvError::Server(e)),
                    _ => {
                        return Err(KvError::Protocol(
                            "expected array reply in reduction".to_string(),
                        ))
                    }
                }
            }
            Ok(Value::Array(Some(out)))
        }
        Reducer::Merge => Err(KvError::Protocol(
            "positional merge requires key indexes".to_string(),
        )),
    }
}
