//! Bounded per-endpoint connection pool
//!
//! Admission order on acquire: reuse a valid idle connection, create under
//! the size limit (handshake included), queue as a waiter if the waiting
//! queue has room, otherwise fail fast. No unbounded queuing anywhere.

use crate::config::{Endpoint, PoolConfig};
use crate::connection::{Connection, Connector, PushSink};
use crate::error::{KvError, Result};
use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// What a queued waiter receives when capacity frees up.
enum Grant {
    /// A reset connection, handed over directly.
    Conn(Connection),
    /// A freed size slot: the waiter creates its own connection.
    Slot,
}

struct PoolState {
    idle: VecDeque<Connection>,
    /// Connections alive or being created (idle + leased + connecting).
    total: usize,
    waiters: VecDeque<oneshot::Sender<Grant>>,
}

pub(crate) struct PoolShared {
    endpoint: Endpoint,
    connector: Arc<dyn Connector>,
    config: PoolConfig,
    password: Option<String>,
    db: u32,
    inflight_capacity: usize,
    max_reply_depth: usize,
    push_sink: Option<PushSink>,
    state: Mutex<PoolState>,
}

/// Per-endpoint bounded connection pool.
#[derive(Clone)]
pub struct ConnectionPool {
    shared: Arc<PoolShared>,
}

/// Options shared by every pool a router creates.
#[derive(Clone)]
pub struct PoolOptions {
    pub config: PoolConfig,
    pub password: Option<String>,
    pub db: u32,
    pub inflight_capacity: usize,
    pub max_reply_depth: usize,
    pub push_sink: Option<PushSink>,
}

impl ConnectionPool {
    pub fn new(endpoint: Endpoint, connector: Arc<dyn Connector>, options: PoolOptions) -> Self {
        let pool = Self {
            shared: Arc::new(PoolShared {
                endpoint,
                connector,
                config: options.config,
                password: options.password,
                db: options.db,
                inflight_capacity: options.inflight_capacity,
                max_reply_depth: options.max_reply_depth,
                push_sink: options.push_sink,
                state: Mutex::new(PoolState {
                    idle: VecDeque::new(),
                    total: 0,
                    waiters: VecDeque::new(),
                }),
            }),
        };
        pool.spawn_sweeper();
        pool
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.shared.endpoint
    }

    /// Acquire an exclusive connection lease.
    pub async fn acquire(&self) -> Result<PooledConnection> {
        enum Plan {
            Use(Connection),
            Create,
            Wait(oneshot::Receiver<Grant>),
            Full,
        }

        loop {
            let plan = {
                let mut state = self.shared.state.lock().expect("pool mutex poisoned");
                let mut found = None;
                while let Some(conn) = state.idle.pop_front() {
                    if conn.is_closed() || conn.is_expired() {
                        state.total -= 1;
                        continue;
                    }
                    found = Some(conn);
                    break;
                }
                match found {
                    Some(conn) => Plan::Use(conn),
                    None if state.total < self.shared.config.max_size => {
                        state.total += 1;
                        Plan::Create
                    }
                    None if state.waiters.len() < self.shared.config.max_waiting => {
                        let (tx, rx) = oneshot::channel();
                        state.waiters.push_back(tx);
                        Plan::Wait(rx)
                    }
                    None => Plan::Full,
                }
            };

            match plan {
                Plan::Use(conn) => return Ok(self.lease(conn)),
                Plan::Create => match self.connect().await {
                    Ok(conn) => return Ok(self.lease(conn)),
                    Err(e) => {
                        self.forfeit_slot();
                        return Err(e);
                    }
                },
                Plan::Wait(rx) => match rx.await {
                    Ok(Grant::Conn(conn)) => return Ok(self.lease(conn)),
                    // Slot reserved on our behalf by the releaser.
                    Ok(Grant::Slot) => match self.connect().await {
                        Ok(conn) => return Ok(self.lease(conn)),
                        Err(e) => {
                            self.forfeit_slot();
                            return Err(e);
                        }
                    },
                    Err(_) => return Err(KvError::PoolExhausted),
                },
                Plan::Full => return Err(KvError::PoolExhausted),
            }
        }
    }

    fn lease(&self, conn: Connection) -> PooledConnection {
        PooledConnection {
            shared: self.shared.clone(),
            conn: Some(conn),
        }
    }

    /// Dial and handshake a fresh connection. The size slot is already
    /// reserved by the caller.
    async fn connect(&self) -> Result<Connection> {
        let stream = self.shared.connector.connect(&self.shared.endpoint).await?;
        let mut conn = Connection::new(
            stream,
            self.shared.endpoint.clone(),
            self.shared.inflight_capacity,
            self.shared.max_reply_depth,
            self.shared.config.idle_timeout(),
        );
        if let Some(sink) = &self.shared.push_sink {
            conn.set_push_sink(sink.clone());
        }
        conn.handshake(self.shared.password.as_deref(), self.shared.db)
            .await?;
        debug!(endpoint = %self.shared.endpoint, "connection established");
        Ok(conn)
    }

    fn forfeit_slot(&self) {
        release_slot(&self.shared);
    }

    /// Number of connections currently alive or connecting.
    pub fn size(&self) -> usize {
        self.shared.state.lock().expect("pool mutex poisoned").total
    }

    /// Periodic idle sweep closing connections past their recycle timeout.
    fn spawn_sweeper(&self) {
        let weak: Weak<PoolShared> = Arc::downgrade(&self.shared);
        let interval = self.shared.config.sweep_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(shared) = weak.upgrade() else {
                    // Pool dropped; sweeper exits.
                    return;
                };
                let mut state = shared.state.lock().expect("pool mutex poisoned");
                let before = state.idle.len();
                state.idle.retain(|conn| !conn.is_expired() && !conn.is_closed());
                let removed = before - state.idle.len();
                state.total -= removed;
                if removed > 0 {
                    debug!(endpoint = %shared.endpoint, removed, "idle sweep recycled connections");
                }
            }
        });
    }
}

/// Hand a freed size slot to the oldest live waiter, or shrink the pool.
fn release_slot(shared: &Arc<PoolShared>) {
    let mut state = shared.state.lock().expect("pool mutex poisoned");
    while let Some(tx) = state.waiters.pop_front() {
        if tx.send(Grant::Slot).is_ok() {
            // Slot ownership transferred; total stays reserved.
            return;
        }
    }
    state.total -= 1;
}

/// Exclusive connection lease, returned to the pool on drop.
///
/// Release path: a clean `reset()` hands the connection to the oldest
/// waiter or back to the idle set; a tainted or closed connection is
/// dropped and its size slot freed.
pub struct PooledConnection {
    shared: Arc<PoolShared>,
    conn: Option<Connection>,
}

impl Deref for PooledConnection {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        self.conn.as_ref().expect("lease holds connection")
    }
}

impl DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut Connection {
        self.conn.as_mut().expect("lease holds connection")
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        let Some(mut conn) = self.conn.take() else {
            return;
        };

        if conn.reset(self.shared.config.idle_timeout()).is_ok() {
            let mut state = self.shared.state.lock().expect("pool mutex poisoned");
            let mut conn = conn;
            loop {
                match state.waiters.pop_front() {
                    Some(tx) => match tx.send(Grant::Conn(conn)) {
                        Ok(()) => return,
                        // Waiter gave up; try the next one.
                        Err(Grant::Conn(back)) => conn = back,
                        Err(Grant::Slot) => unreachable!("sent a connection"),
                    },
                    None => {
                        state.idle.push_back(conn);
                        return;
                    }
                }
            }
        } else {
            warn!(
                endpoint = %self.shared.endpoint,
                tainted = conn.is_tainted(),
                "discarding connection instead of pooling"
            );
            drop(conn);
            release_slot(&self.shared);
        }
    }
}
