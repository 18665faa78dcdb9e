//! Bounded sender pool, one per destination address
//!
//! Borrow/return discipline: a lease owns its sender outright, so no sender
//! can be held by two borrowers. Senders are validated on borrow and on
//! return; a sender that fails validation is closed instead of reused. An
//! eviction task trims senders that sat idle past the configured timeout,
//! keeping a minimum warm set.

use crate::config::PoolConfig;
use crate::error::{EventError, Result};
use crate::transport::{TransportConnection, TransportSender};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;

struct IdleSender {
    sender: Box<dyn TransportSender>,
    idle_since: Instant,
}

/// A borrowed sender; return it with [`SenderPool::give_back`]
pub struct SenderLease {
    sender: Box<dyn TransportSender>,
    _permit: OwnedSemaphorePermit,
}

impl SenderLease {
    /// The leased sender
    pub fn sender(&mut self) -> &mut dyn TransportSender {
        &mut *self.sender
    }
}

impl std::fmt::Debug for SenderLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SenderLease")
            .field("valid", &self.sender.is_valid())
            .finish_non_exhaustive()
    }
}

/// Bounded pool of validated, reusable senders for one address
pub struct SenderPool {
    address: String,
    connection: Arc<dyn TransportConnection>,
    config: PoolConfig,
    idle: Mutex<Vec<IdleSender>>,
    permits: Arc<Semaphore>,
    closed: AtomicBool,
    evictor: Mutex<Option<JoinHandle<()>>>,
}

impl SenderPool {
    /// Create a pool bound to one address of a live connection
    pub fn new(
        address: impl Into<String>,
        connection: Arc<dyn TransportConnection>,
        config: PoolConfig,
    ) -> Self {
        let max_total = config.max_total.max(1);
        Self {
            address: address.into(),
            connection,
            config,
            idle: Mutex::new(Vec::new()),
            permits: Arc::new(Semaphore::new(max_total)),
            closed: AtomicBool::new(false),
            evictor: Mutex::new(None),
        }
    }

    /// Spawn the periodic idle eviction task
    pub async fn start_eviction(self: &Arc<Self>) {
        let pool = Arc::downgrade(self);
        let interval = self.config.eviction_interval;

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // immediate first tick is not an eviction run
            loop {
                ticker.tick().await;
                match pool.upgrade() {
                    Some(pool) => pool.evict_idle().await,
                    None => break,
                }
            }
        });

        *self.evictor.lock().await = Some(handle);
    }

    /// Borrow a sender, waiting up to the configured borrow wait
    pub async fn borrow(&self) -> Result<SenderLease> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(EventError::PoolClosed {
                address: self.address.clone(),
            });
        }

        let permit = tokio::time::timeout(
            self.config.borrow_wait,
            self.permits.clone().acquire_owned(),
        )
        .await
        .map_err(|_| EventError::PoolExhausted {
            address: self.address.clone(),
            waited_ms: self.config.borrow_wait.as_millis() as u64,
        })?
        .map_err(|_| EventError::PoolClosed {
            address: self.address.clone(),
        })?;

        // validate-on-borrow: reuse the first healthy idle sender,
        // destroy the stale ones along the way
        loop {
            let candidate = self.idle.lock().await.pop();
            match candidate {
                Some(idle) if idle.sender.is_valid() => {
                    return Ok(SenderLease {
                        sender: idle.sender,
                        _permit: permit,
                    });
                }
                Some(mut stale) => {
                    tracing::debug!(address = %self.address, "Destroying invalid idle sender");
                    stale.sender.close().await;
                }
                None => break,
            }
        }

        let sender = self.connection.create_sender(&self.address).await?;
        Ok(SenderLease {
            sender,
            _permit: permit,
        })
    }

    /// Return a lease; called on every publish path, success or failure
    ///
    /// A returned sender is validated again; invalid senders, and any sender
    /// returned after the pool closed, are destroyed. The capacity permit is
    /// released either way.
    pub async fn give_back(&self, lease: SenderLease) {
        let SenderLease { mut sender, _permit } = lease;

        if self.closed.load(Ordering::SeqCst) || !sender.is_valid() {
            sender.close().await;
            return;
        }

        let mut idle = self.idle.lock().await;
        if idle.len() >= self.config.max_idle {
            drop(idle);
            sender.close().await;
        } else {
            idle.push(IdleSender {
                sender,
                idle_since: Instant::now(),
            });
        }
    }

    /// Close the pool: stop eviction and destroy every idle sender
    ///
    /// Leases still out are destroyed when they come back.
    pub async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);

        if let Some(handle) = self.evictor.lock().await.take() {
            handle.abort();
        }

        let drained: Vec<IdleSender> = self.idle.lock().await.drain(..).collect();
        for mut idle in drained {
            idle.sender.close().await;
        }

        tracing::debug!(address = %self.address, "Sender pool closed");
    }

    async fn evict_idle(&self) {
        let mut evicted = Vec::new();
        {
            let mut idle = self.idle.lock().await;
            let mut kept = Vec::with_capacity(idle.len());
            for entry in idle.drain(..) {
                let expired = entry.idle_since.elapsed() >= self.config.idle_timeout;
                if !entry.sender.is_valid() || (expired && kept.len() >= self.config.min_idle) {
                    evicted.push(entry);
                } else {
                    kept.push(entry);
                }
            }
            *idle = kept;
        }

        if !evicted.is_empty() {
            tracing::debug!(
                address = %self.address,
                count = evicted.len(),
                "Evicting idle senders"
            );
        }
        for mut entry in evicted {
            entry.sender.close().await;
        }
    }

    /// Idle senders currently parked in the pool
    pub async fn idle_count(&self) -> usize {
        self.idle.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BusConfig;
    use crate::transport::memory::MemoryBroker;
    use crate::transport::Transport;
    use std::time::Duration;

    async fn pool_with(config: PoolConfig) -> (MemoryBroker, Arc<SenderPool>) {
        let broker = MemoryBroker::new();
        let connection: Arc<dyn TransportConnection> = Arc::from(
            broker.connect(&BusConfig::default()).await.unwrap(),
        );
        let pool = Arc::new(SenderPool::new("events.account", connection, config));
        (broker, pool)
    }

    fn small_config() -> PoolConfig {
        PoolConfig {
            min_idle: 0,
            max_idle: 2,
            max_total: 2,
            borrow_wait: Duration::from_millis(100),
            eviction_interval: Duration::from_secs(60),
            idle_timeout: Duration::from_secs(300),
        }
    }

    #[tokio::test]
    async fn test_borrow_and_give_back_reuses_sender() {
        let (_broker, pool) = pool_with(small_config()).await;

        let lease = pool.borrow().await.unwrap();
        pool.give_back(lease).await;
        assert_eq!(pool.idle_count().await, 1);

        let lease = pool.borrow().await.unwrap();
        assert_eq!(pool.idle_count().await, 0);
        pool.give_back(lease).await;
    }

    #[tokio::test]
    async fn test_borrow_wait_timeout() {
        let mut config = small_config();
        config.max_total = 1;
        let (_broker, pool) = pool_with(config).await;

        let held = pool.borrow().await.unwrap();
        let err = pool.borrow().await.unwrap_err();
        assert!(matches!(err, EventError::PoolExhausted { .. }));

        pool.give_back(held).await;
        // capacity is available again
        let lease = pool.borrow().await.unwrap();
        pool.give_back(lease).await;
    }

    #[tokio::test]
    async fn test_invalid_sender_destroyed_on_return() {
        let (broker, pool) = pool_with(small_config()).await;

        let lease = pool.borrow().await.unwrap();
        broker.inject_failure("connection lost");
        pool.give_back(lease).await;

        assert_eq!(pool.idle_count().await, 0);
    }

    #[tokio::test]
    async fn test_closed_pool_rejects_borrow_and_discards_returns() {
        let (_broker, pool) = pool_with(small_config()).await;

        let lease = pool.borrow().await.unwrap();
        pool.close().await;

        assert!(matches!(
            pool.borrow().await.unwrap_err(),
            EventError::PoolClosed { .. }
        ));

        // mid-use lease finishes its return, then is discarded
        pool.give_back(lease).await;
        assert_eq!(pool.idle_count().await, 0);
    }

    #[tokio::test]
    async fn test_eviction_trims_expired_idle_senders() {
        let mut config = small_config();
        config.min_idle = 1;
        config.idle_timeout = Duration::from_millis(0);
        let (_broker, pool) = pool_with(config).await;

        let a = pool.borrow().await.unwrap();
        let b = pool.borrow().await.unwrap();
        pool.give_back(a).await;
        pool.give_back(b).await;
        assert_eq!(pool.idle_count().await, 2);

        pool.evict_idle().await;
        // everything expired, but min_idle keeps one warm
        assert_eq!(pool.idle_count().await, 1);
    }

    #[tokio::test]
    async fn test_concurrent_borrowers_bounded_by_max_total() {
        let mut config = small_config();
        config.max_total = 3;
        config.borrow_wait = Duration::from_secs(1);
        let (_broker, pool) = pool_with(config).await;

        let mut tasks = Vec::new();
        for _ in 0..12 {
            let pool = pool.clone();
            tasks.push(tokio::spawn(async move {
                let mut lease = pool.borrow().await.unwrap();
                lease.sender().send(b"payload").await.unwrap();
                pool.give_back(lease).await;
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        // never more senders parked than were ever created
        assert!(pool.idle_count().await <= 3);
    }
}
