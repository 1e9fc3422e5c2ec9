//! Slot table and topology cache
//!
//! The slot table maps each of the 16384 hash slots to an ordered endpoint
//! list, master first. It is immutable and replaced atomically as a whole on
//! refresh. The cache memoizes a single in-flight refresh: concurrent
//! callers that observe a refresh in progress await its result instead of
//! issuing duplicates.

use crate::command::SLOT_COUNT;
use crate::config::Endpoint;
use crate::connection::{Connection, Connector};
use crate::error::{KvError, Result};
use crate::protocol::Value;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

/// Immutable slot-to-endpoints table.
///
/// Slots without a known owner return no endpoints; the table is never
/// partially stale, only replaced whole.
#[derive(Debug, Clone, Default)]
pub struct SlotTable {
    /// Endpoint lists, master first, shared by every slot in a range.
    groups: Vec<Vec<Endpoint>>,
    /// Slot index into `groups`.
    slots: Vec<Option<u16>>,
}

impl SlotTable {
    /// Build from a cluster topology reply shaped
    /// `[[start, end, [host, port, ...], [host, port, ...], ...], ...]`,
    /// first address per range being the master.
    pub fn from_reply(reply: &Value) -> Result<Self> {
        let ranges = reply
            .as_array()
            .ok_or_else(|| KvError::Protocol("topology reply is not an array".to_string()))?;

        let mut groups: Vec<Vec<Endpoint>> = Vec::with_capacity(ranges.len());
        let mut slots: Vec<Option<u16>> = vec![None; SLOT_COUNT as usize];

        for range in ranges {
            let parts = range.as_array().ok_or_else(|| {
                KvError::Protocol("topology range is not an array".to_string())
            })?;
            if parts.len() < 3 {
                return Err(KvError::Protocol(
                    "topology range missing node addresses".to_string(),
                ));
            }
            let start = parts[0]
                .as_integer()
                .filter(|&s| (0..SLOT_COUNT as i64).contains(&s))
                .ok_or_else(|| KvError::Protocol("bad range start slot".to_string()))?;
            let end = parts[1]
                .as_integer()
                .filter(|&e| (start..SLOT_COUNT as i64).contains(&e))
                .ok_or_else(|| KvError::Protocol("bad range end slot".to_string()))?;

            let mut endpoints = Vec::with_capacity(parts.len() - 2);
            for node in &parts[2..] {
                endpoints.push(parse_node(node)?);
            }

            let group = groups.len() as u16;
            groups.push(endpoints);
            for slot in start..=end {
                slots[slot as usize] = Some(group);
            }
        }

        Ok(Self { groups, slots })
    }

    /// Ordered endpoints for a slot: `[master, replica1, ...]`.
    pub fn endpoints_for(&self, slot: u16) -> Option<&[Endpoint]> {
        let group = self.slots.get(slot as usize).copied().flatten()?;
        Some(&self.groups[group as usize])
    }

    pub fn master_for(&self, slot: u16) -> Option<&Endpoint> {
        self.endpoints_for(slot).and_then(|eps| eps.first())
    }

    /// Every distinct master, in range order.
    pub fn masters(&self) -> Vec<Endpoint> {
        let mut out = Vec::with_capacity(self.groups.len());
        for group in &self.groups {
            if let Some(master) = group.first() {
                if !out.contains(master) {
                    out.push(master.clone());
                }
            }
        }
        out
    }

    /// An arbitrary known endpoint for keyless commands.
    pub fn any_endpoint(&self) -> Option<&Endpoint> {
        self.groups.iter().find_map(|g| g.first())
    }

    /// Every distinct endpoint in the table, masters and replicas.
    pub fn all_endpoints(&self) -> Vec<Endpoint> {
        let mut out = Vec::new();
        for group in &self.groups {
            for endpoint in group {
                if !out.contains(endpoint) {
                    out.push(endpoint.clone());
                }
            }
        }
        out
    }

    /// Number of slots with a known owner.
    pub fn covered_slots(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }
}

fn parse_node(node: &Value) -> Result<Endpoint> {
    let parts = node
        .as_array()
        .ok_or_else(|| KvError::Protocol("topology node is not an array".to_string()))?;
    let host = parts
        .first()
        .and_then(|v| v.as_bulk())
        .ok_or_else(|| KvError::Protocol("topology node missing host".to_string()))?;
    let port = parts
        .get(1)
        .and_then(|v| v.as_integer())
        .filter(|&p| (0..=u16::MAX as i64).contains(&p))
        .ok_or_else(|| KvError::Protocol("topology node missing port".to_string()))?;
    Ok(Endpoint::tcp(
        String::from_utf8_lossy(host).into_owned(),
        port as u16,
    ))
}

/// Restores the cache to `Empty` and wakes waiters if the refreshing caller
/// is dropped before completing.
struct RefreshGuard<'a> {
    cache: &'a TopologyCache,
    armed: bool,
}

impl Drop for RefreshGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.cache.abort_refresh();
        }
    }
}

enum CacheState {
    Empty,
    /// A refresh is in progress; queued senders are completed when it ends.
    Refreshing(Vec<oneshot::Sender<()>>),
    Ready {
        table: Arc<SlotTable>,
        expires_at: Instant,
    },
}

/// Shared, TTL-invalidated topology cache with single-flight refresh.
pub struct TopologyCache {
    seeds: Vec<Endpoint>,
    connector: Arc<dyn Connector>,
    password: Option<String>,
    db: u32,
    ttl: Duration,
    inflight_capacity: usize,
    max_reply_depth: usize,
    state: Mutex<CacheState>,
}

impl TopologyCache {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        seeds: Vec<Endpoint>,
        connector: Arc<dyn Connector>,
        password: Option<String>,
        db: u32,
        ttl: Duration,
        inflight_capacity: usize,
        max_reply_depth: usize,
    ) -> Self {
        Self {
            seeds,
            connector,
            password,
            db,
            ttl,
            inflight_capacity,
            max_reply_depth,
            state: Mutex::new(CacheState::Empty),
        }
    }

    /// Current slot table, refreshing if absent or expired.
    ///
    /// Exactly one caller performs the refresh; the rest await its outcome.
    pub async fn get(&self) -> Result<Arc<SlotTable>> {
        loop {
            let waiter = {
                let mut state = self.state.lock().expect("topology mutex poisoned");
                match &mut *state {
                    CacheState::Ready { table, expires_at } if Instant::now() < *expires_at => {
                        return Ok(table.clone());
                    }
                    CacheState::Refreshing(waiters) => {
                        let (tx, rx) = oneshot::channel();
                        waiters.push(tx);
                        Some(rx)
                    }
                    _ => {
                        *state = CacheState::Refreshing(Vec::new());
                        None
                    }
                }
            };

            match waiter {
                Some(rx) => {
                    // Outcome doesn't matter; re-inspect the state either way.
                    let _ = rx.await;
                }
                None => {
                    let mut guard = RefreshGuard {
                        cache: self,
                        armed: true,
                    };
                    let result = self.refresh().await;
                    guard.armed = false;
                    let waiters = {
                        let mut state = self.state.lock().expect("topology mutex poisoned");
                        let waiters = match std::mem::replace(&mut *state, CacheState::Empty) {
                            CacheState::Refreshing(waiters) => waiters,
                            other => {
                                *state = other;
                                Vec::new()
                            }
                        };
                        if let Ok(table) = &result {
                            *state = CacheState::Ready {
                                table: table.clone(),
                                expires_at: Instant::now() + self.ttl,
                            };
                        }
                        waiters
                    };
                    for tx in waiters {
                        let _ = tx.send(());
                    }
                    return result;
                }
            }
        }
    }

    fn abort_refresh(&self) {
        let waiters = {
            let mut state = self.state.lock().expect("topology mutex poisoned");
            match std::mem::replace(&mut *state, CacheState::Empty) {
                CacheState::Refreshing(waiters) => waiters,
                other => {
                    *state = other;
                    Vec::new()
                }
            }
        };
        for tx in waiters {
            let _ = tx.send(());
        }
    }

    /// Drop the cached table; the next `get()` refreshes.
    pub fn invalidate(&self) {
        let mut state = self.state.lock().expect("topology mutex poisoned");
        if matches!(*state, CacheState::Ready { .. }) {
            debug!("topology cache invalidated");
            *state = CacheState::Empty;
        }
    }

    /// Query each seed in order; first success wins.
    async fn refresh(&self) -> Result<Arc<SlotTable>> {
        let mut failures = Vec::new();
        for seed in &self.seeds {
            match self.query_seed(seed).await {
                Ok(table) => {
                    info!(
                        seed = %seed,
                        covered = table.covered_slots(),
                        "topology refreshed"
                    );
                    return Ok(Arc::new(table));
                }
                Err(e) => {
                    warn!(seed = %seed, error = %e, "topology refresh failed against seed");
                    failures.push(format!("{}: {}", seed, e));
                }
            }
        }
        Err(KvError::TopologyUnavailable(failures.join("; ")))
    }

    async fn query_seed(&self, seed: &Endpoint) -> Result<SlotTable> {
        let stream = self.connector.connect(seed).await?;
        let mut conn = Connection::new(
            stream,
            seed.clone(),
            self.inflight_capacity,
            self.max_reply_depth,
            self.ttl,
        );
        conn.handshake(self.password.as_deref(), self.db).await?;
        let reply = conn.send_raw(&[b"CLUSTER", b"SLOTS"]).await?;
        if let Value::Error(e) = reply {
            return Err(KvError::Server(e));
        }
        SlotTable::from_reply(&reply)
    }
}
