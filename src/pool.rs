//! Connection pooling
//!
//! Maintains reusable transports keyed by server address. Instead of
//! dialing the server for every client, transports are checked out with
//! [`ConnectionPool::acquire`], returned with [`ConnectionPool::release`],
//! and torn down by a background sweeper once idle for too long.
//!
//! - Bounded: at most `max_connections_per_server` transports per
//!   address; excess `acquire` calls suspend until a slot frees
//! - Lazy: transports are dialed on first use, not eagerly
//! - Idle cleanup: a sweeper runs every `idle_check_interval` and drops
//!   transports idle longer than `terminate_idle_timeout`
//! - Graceful shutdown: `shutdown` drains checked-out connections within
//!   a grace period, then closes the pool for good

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::{RwLock, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::transport::{map_rpc_error, ActiveConnection, Connection, LedgerRpc, TransportFactory};

/// The pool contract the client facade depends on.
///
/// [`ConnectionPool`] is the standard implementation; anything honoring
/// acquire/release/shutdown semantics can stand in for it.
#[async_trait]
pub trait TransportPool: Send + Sync + 'static {
    /// Check a transport out for the given server address.
    async fn acquire(&self, address: &str) -> Result<Connection>;

    /// Return a previously acquired connection.
    async fn release(&self, conn: Connection);

    /// Drain and close the pool.
    async fn shutdown(&self);
}

/// Pool tuning knobs.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum transports handed out per server address
    pub max_connections_per_server: usize,

    /// How often the sweeper looks for idle transports
    pub idle_check_interval: Duration,

    /// Idle age after which a pooled transport is dropped
    pub terminate_idle_timeout: Duration,

    /// How long `shutdown` waits for checked-out connections
    pub shutdown_grace: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections_per_server: 4,
            idle_check_interval: Duration::from_secs(30),
            terminate_idle_timeout: Duration::from_secs(60),
            shutdown_grace: Duration::from_secs(10),
        }
    }
}

struct IdleTransport {
    rpc: Arc<dyn LedgerRpc>,
    since: Instant,
}

struct ServerSlot {
    semaphore: Arc<Semaphore>,
    idle: Mutex<Vec<IdleTransport>>,
}

/// Pool of reusable transports, keyed by server address.
pub struct ConnectionPool {
    factory: Arc<dyn TransportFactory>,
    config: PoolConfig,
    servers: Arc<RwLock<HashMap<String, Arc<ServerSlot>>>>,
    closed: Arc<AtomicBool>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionPool {
    /// Create a pool dialing through `factory`.
    pub fn new(factory: Arc<dyn TransportFactory>, config: PoolConfig) -> Self {
        Self {
            factory,
            config,
            servers: Arc::new(RwLock::new(HashMap::new())),
            closed: Arc::new(AtomicBool::new(false)),
            sweeper: Mutex::new(None),
        }
    }

    /// Check a transport out of the pool, dialing if none is idle.
    ///
    /// Suspends while the per-server limit is reached; fails with
    /// [`Error::PoolClosed`] once the pool has been shut down.
    pub async fn acquire(&self, address: &str) -> Result<Connection> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::PoolClosed);
        }
        self.ensure_sweeper();

        let slot = self.slot(address).await;
        let permit = slot
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| Error::PoolClosed)?;

        let reused = {
            let mut idle = slot.idle.lock().expect("pool lock poisoned");
            idle.pop()
        };

        let rpc = match reused {
            Some(idle) => {
                debug!(address, "reusing pooled transport");
                idle.rpc
            }
            None => {
                debug!(address, "dialing new transport");
                self.factory
                    .connect(address)
                    .await
                    .map_err(map_rpc_error)?
            }
        };

        Ok(Connection::Active(ActiveConnection {
            address: address.to_string(),
            rpc,
            permit: Some(permit),
        }))
    }

    /// Return a connection to the pool.
    ///
    /// Releasing the released sentinel is a no-op. The transport becomes
    /// eligible for teardown after the idle timeout.
    pub async fn release(&self, conn: Connection) {
        let Connection::Active(mut active) = conn else {
            return;
        };
        if !self.closed.load(Ordering::SeqCst) {
            let slot = self.slot(&active.address).await;
            let mut idle = slot.idle.lock().expect("pool lock poisoned");
            idle.push(IdleTransport {
                rpc: active.rpc,
                since: Instant::now(),
            });
        }
        // dropping the permit frees the server slot
        active.permit.take();
    }

    /// Drain the pool within the configured grace period.
    ///
    /// New `acquire` calls fail immediately. Checked-out connections are
    /// awaited until the grace boundary; whatever is still in flight at
    /// that point is cut off.
    pub async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        if let Some(handle) = self.sweeper.lock().expect("pool lock poisoned").take() {
            handle.abort();
        }

        let deadline = Instant::now() + self.config.shutdown_grace;
        let servers = self.servers.read().await;
        for (address, slot) in servers.iter() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let all = self.config.max_connections_per_server as u32;
            match tokio::time::timeout(remaining, slot.semaphore.clone().acquire_many_owned(all))
                .await
            {
                Ok(Ok(permits)) => drop(permits),
                Ok(Err(_)) => {}
                Err(_) => {
                    warn!(address = %address, "shutdown grace elapsed with connections in flight");
                }
            }
            slot.semaphore.close();
            slot.idle.lock().expect("pool lock poisoned").clear();
        }
        debug!("connection pool shut down");
    }

    /// Number of idle pooled transports for an address.
    pub async fn idle_count(&self, address: &str) -> usize {
        let servers = self.servers.read().await;
        match servers.get(address) {
            Some(slot) => slot.idle.lock().expect("pool lock poisoned").len(),
            None => 0,
        }
    }

    async fn slot(&self, address: &str) -> Arc<ServerSlot> {
        {
            let servers = self.servers.read().await;
            if let Some(slot) = servers.get(address) {
                return Arc::clone(slot);
            }
        }
        let mut servers = self.servers.write().await;
        Arc::clone(servers.entry(address.to_string()).or_insert_with(|| {
            Arc::new(ServerSlot {
                semaphore: Arc::new(Semaphore::new(self.config.max_connections_per_server)),
                idle: Mutex::new(Vec::new()),
            })
        }))
    }

    fn ensure_sweeper(&self) {
        let mut sweeper = self.sweeper.lock().expect("pool lock poisoned");
        if sweeper.is_some() {
            return;
        }

        let servers = Arc::clone(&self.servers);
        let closed = Arc::clone(&self.closed);
        let check_interval = self.config.idle_check_interval;
        let idle_timeout = self.config.terminate_idle_timeout;

        *sweeper = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(check_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                if closed.load(Ordering::SeqCst) {
                    break;
                }
                let servers = servers.read().await;
                for (address, slot) in servers.iter() {
                    let mut idle = slot.idle.lock().expect("pool lock poisoned");
                    let before = idle.len();
                    idle.retain(|t| t.since.elapsed() < idle_timeout);
                    if idle.len() < before {
                        debug!(
                            address = %address,
                            swept = before - idle.len(),
                            "swept idle transports"
                        );
                    }
                }
            }
        }));
    }
}

#[async_trait]
impl TransportPool for ConnectionPool {
    async fn acquire(&self, address: &str) -> Result<Connection> {
        ConnectionPool::acquire(self, address).await
    }

    async fn release(&self, conn: Connection) {
        ConnectionPool::release(self, conn).await
    }

    async fn shutdown(&self) {
        ConnectionPool::shutdown(self).await
    }
}

impl Drop for ConnectionPool {
    fn drop(&mut self) {
        if let Ok(mut sweeper) = self.sweeper.lock() {
            if let Some(handle) = sweeper.take() {
                handle.abort();
            }
        }
    }
}
