//! Per-node RPC connection pools
//!
//! One bounded pool per peer, keyed by [`NodeKey`]. Connections are lazily
//! connecting tonic channels. A borrowed connection is an RAII guard: it must
//! be handed back with [`PoolManager::release`] (or
//! [`PooledConnection::release`]); a guard dropped any other way counts as an
//! invalid return and the connection is destroyed.

use crate::common::{Error, PoolConfig, Result};
use crate::coordinator::membership::{MembershipListener, MembershipSnapshot};
use crate::coordinator::metadata::{Node, NodeKey};
use crate::proto::search_node_client::SearchNodeClient;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tonic::transport::{Channel, Endpoint};
use tracing::{debug, error, info, warn};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// A single client stub bound to one node
pub struct RpcConnection {
    id: u64,
    node: NodeKey,
    client: SearchNodeClient<Channel>,
}

impl RpcConnection {
    fn connect(node: &NodeKey, config: &PoolConfig) -> Result<Self> {
        let endpoint = Endpoint::from_shared(node.uri())?
            .connect_timeout(config.connect_timeout())
            .timeout(config.request_timeout());
        let client = SearchNodeClient::new(endpoint.connect_lazy())
            .max_decoding_message_size(config.max_message_bytes)
            .max_encoding_message_size(config.max_message_bytes);

        let id = NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed);
        debug!("Opened connection {} to {}", id, node);
        Ok(Self {
            id,
            node: node.clone(),
            client,
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn node(&self) -> &NodeKey {
        &self.node
    }

    /// Stub for one call; clones share the underlying channel.
    pub fn client(&self) -> SearchNodeClient<Channel> {
        self.client.clone()
    }

    fn close(self) {
        debug!("Closed connection {} to {}", self.id, self.node);
    }
}

struct IdleConnection {
    connection: RpcConnection,
    since: Instant,
}

/// Bounded pool of connections to one node
pub struct ConnectionPool {
    node: NodeKey,
    config: PoolConfig,
    idle: Mutex<VecDeque<IdleConnection>>,
    permits: Arc<Semaphore>,
    closed: AtomicBool,
}

impl ConnectionPool {
    fn new(node: NodeKey, config: PoolConfig) -> Result<Self> {
        let mut idle = VecDeque::with_capacity(config.max_total);
        for _ in 0..config.min_idle {
            idle.push_back(IdleConnection {
                connection: RpcConnection::connect(&node, &config)?,
                since: Instant::now(),
            });
        }
        Ok(Self {
            permits: Arc::new(Semaphore::new(config.max_total)),
            idle: Mutex::new(idle),
            node,
            config,
            closed: AtomicBool::new(false),
        })
    }

    fn idle_queue(&self) -> MutexGuard<'_, VecDeque<IdleConnection>> {
        // Queue contents stay consistent even if a holder panicked
        self.idle.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn node(&self) -> &NodeKey {
        &self.node
    }

    pub fn idle_count(&self) -> usize {
        self.idle_queue().len()
    }

    /// Connections currently lent out
    pub fn active_count(&self) -> usize {
        self.config.max_total - self.permits.available_permits()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn borrow(self: &Arc<Self>) -> Result<PooledConnection> {
        if self.is_closed() {
            return Err(Error::NodeNotLoaded(self.node.to_string()));
        }

        let permit = tokio::time::timeout(
            self.config.borrow_timeout(),
            Arc::clone(&self.permits).acquire_owned(),
        )
        .await
        .map_err(|_| {
            Error::Timeout(format!(
                "no free connection to {} after {:?}",
                self.node,
                self.config.borrow_timeout()
            ))
        })?
        .map_err(|_| Error::NodeNotLoaded(self.node.to_string()))?;

        let reused = self.idle_queue().pop_back();
        let connection = match reused {
            Some(idle) => idle.connection,
            None => RpcConnection::connect(&self.node, &self.config)?,
        };

        Ok(PooledConnection {
            connection: Some(connection),
            pool: Arc::clone(self),
            _permit: permit,
        })
    }

    fn give_back(&self, connection: RpcConnection, valid: bool) {
        if !valid {
            debug!(
                "Destroying invalid connection {} to {}",
                connection.id, self.node
            );
            connection.close();
            return;
        }
        if self.is_closed() {
            connection.close();
            return;
        }
        self.idle_queue().push_back(IdleConnection {
            connection,
            since: Instant::now(),
        });
    }

    /// Drop idle connections past the eviction time, keeping `min_idle`.
    fn evict_idle(&self) -> usize {
        let max_idle_time = self.config.idle_eviction();
        let mut idle = self.idle_queue();
        let mut evicted = 0;
        // Oldest returns sit at the front
        while idle.len() > self.config.min_idle {
            match idle.front() {
                Some(oldest) if oldest.since.elapsed() >= max_idle_time => {
                    if let Some(stale) = idle.pop_front() {
                        stale.connection.close();
                        evicted += 1;
                    }
                }
                _ => break,
            }
        }
        evicted
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.permits.close();
        for idle in self.idle_queue().drain(..) {
            idle.connection.close();
        }
    }
}

/// A connection lent out by a pool
pub struct PooledConnection {
    connection: Option<RpcConnection>,
    pool: Arc<ConnectionPool>,
    _permit: OwnedSemaphorePermit,
}

impl PooledConnection {
    fn connection(&self) -> Option<&RpcConnection> {
        self.connection.as_ref()
    }

    pub fn id(&self) -> u64 {
        self.connection().map(|c| c.id).unwrap_or_default()
    }

    pub fn node(&self) -> &NodeKey {
        &self.pool.node
    }

    pub fn client(&self) -> Result<SearchNodeClient<Channel>> {
        self.connection()
            .map(RpcConnection::client)
            .ok_or_else(|| Error::Internal("connection already released".into()))
    }

    /// Hand the connection back to the pool it came from.
    pub fn release(mut self, valid: bool) {
        if let Some(connection) = self.connection.take() {
            self.pool.give_back(connection, valid);
        }
    }

    /// Close the connection without returning it to any pool.
    fn close(mut self) {
        if let Some(connection) = self.connection.take() {
            connection.close();
        }
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(connection) = self.connection.take() {
            warn!(
                "Connection {} to {} dropped without release, destroying",
                connection.id, self.pool.node
            );
            self.pool.give_back(connection, false);
        }
    }
}

/// All peer pools of this node
pub struct PoolManager {
    pools: RwLock<HashMap<NodeKey, Arc<ConnectionPool>>>,
    config: PoolConfig,
}

impl PoolManager {
    pub fn new(config: PoolConfig) -> Self {
        Self {
            pools: RwLock::new(HashMap::new()),
            config,
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<NodeKey, Arc<ConnectionPool>>> {
        self.pools.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<NodeKey, Arc<ConnectionPool>>> {
        self.pools.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Create the pool for `node`; a no-op when it already exists.
    pub fn add_node(&self, node: &NodeKey) -> Result<()> {
        let mut pools = self.write();
        if pools.contains_key(node) {
            info!("Connection pool for {} already loaded", node);
            return Ok(());
        }
        let pool = ConnectionPool::new(node.clone(), self.config.clone())?;
        pools.insert(node.clone(), Arc::new(pool));
        info!(
            "Added connection pool for {} (min idle {}, max total {})",
            node, self.config.min_idle, self.config.max_total
        );
        Ok(())
    }

    /// Close and drop the pool for `node`. Borrowed connections close when returned.
    pub fn remove_node(&self, node: &NodeKey) -> bool {
        match self.write().remove(node) {
            Some(pool) => {
                pool.close();
                info!("Removed connection pool for {}", node);
                true
            }
            None => false,
        }
    }

    pub fn pool(&self, node: &NodeKey) -> Option<Arc<ConnectionPool>> {
        self.read().get(node).cloned()
    }

    pub fn contains(&self, node: &NodeKey) -> bool {
        self.read().contains_key(node)
    }

    pub fn nodes(&self) -> Vec<NodeKey> {
        let mut nodes: Vec<NodeKey> = self.read().keys().cloned().collect();
        nodes.sort();
        nodes
    }

    /// Borrow a connection, waiting for a free slot if the pool is exhausted.
    pub async fn borrow(&self, node: &NodeKey) -> Result<PooledConnection> {
        let pool = self
            .pool(node)
            .ok_or_else(|| Error::NodeNotLoaded(node.to_string()))?;
        pool.borrow().await
    }

    /// Return a borrowed connection. Invalid connections are destroyed.
    pub fn release(&self, connection: PooledConnection, valid: bool) {
        match self.pool(connection.node()) {
            Some(pool) if Arc::ptr_eq(&pool, &connection.pool) => connection.release(valid),
            _ => {
                error!(
                    "Pool for {} no longer exists, closing connection {}",
                    connection.node(),
                    connection.id()
                );
                connection.close();
            }
        }
    }

    /// Trim idle connections in every pool; returns how many were closed.
    pub fn evict_idle(&self) -> usize {
        let pools: Vec<Arc<ConnectionPool>> = self.read().values().cloned().collect();
        let evicted: usize = pools.iter().map(|p| p.evict_idle()).sum();
        if evicted > 0 {
            debug!("Evicted {} idle connections", evicted);
        }
        evicted
    }

    /// Periodic eviction until shutdown.
    pub fn spawn_evictor(
        self: Arc<Self>,
        every: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = interval.tick() => {
                        self.evict_idle();
                    }
                }
            }
        })
    }

    pub fn close_all(&self) {
        for (node, pool) in self.write().drain() {
            pool.close();
            debug!("Closed connection pool for {}", node);
        }
    }
}

impl MembershipListener for PoolManager {
    fn on_node_added(&self, _current: &MembershipSnapshot, node: &Node) {
        if let Err(e) = self.add_node(&node.key()) {
            error!("Failed to add connection pool for {}: {}", node.key(), e);
        }
    }

    fn on_node_removed(&self, _current: &MembershipSnapshot, node: &Node) {
        self.remove_node(&node.key());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node() -> NodeKey {
        NodeKey::new("127.0.0.1", 1)
    }

    fn manager(config: PoolConfig) -> PoolManager {
        let manager = PoolManager::new(config);
        manager.add_node(&node()).unwrap();
        manager
    }

    #[tokio::test]
    async fn test_borrow_unknown_node() {
        let manager = PoolManager::new(PoolConfig::default());
        match manager.borrow(&node()).await {
            Err(Error::NodeNotLoaded(n)) => assert_eq!(n, "127.0.0.1:1"),
            other => panic!("unexpected: {:?}", other.err()),
        }
    }

    #[tokio::test]
    async fn test_lifecycle() {
        let manager = manager(PoolConfig::default());
        let pool = manager.pool(&node()).unwrap();
        assert_eq!(pool.idle_count(), 1);

        // Adding again keeps the same pool
        manager.add_node(&node()).unwrap();
        assert!(Arc::ptr_eq(&pool, &manager.pool(&node()).unwrap()));

        let conn = manager.borrow(&node()).await.unwrap();
        assert_eq!(pool.active_count(), 1);
        assert_eq!(pool.idle_count(), 0);
        manager.release(conn, true);
        assert_eq!(pool.active_count(), 0);
        assert_eq!(pool.idle_count(), 1);

        assert!(manager.remove_node(&node()));
        assert!(!manager.remove_node(&node()));
        assert!(pool.is_closed());
        assert_eq!(pool.idle_count(), 0);
        assert!(matches!(
            manager.borrow(&node()).await,
            Err(Error::NodeNotLoaded(_))
        ));
    }

    #[tokio::test]
    async fn test_valid_connection_reused() {
        let manager = manager(PoolConfig::default());
        let conn = manager.borrow(&node()).await.unwrap();
        let id = conn.id();
        manager.release(conn, true);

        let again = manager.borrow(&node()).await.unwrap();
        assert_eq!(again.id(), id);
        manager.release(again, true);
    }

    #[tokio::test]
    async fn test_invalid_connection_never_reused() {
        let manager = manager(PoolConfig::default());
        let conn = manager.borrow(&node()).await.unwrap();
        let id = conn.id();
        manager.release(conn, false);

        let pool = manager.pool(&node()).unwrap();
        assert_eq!(pool.idle_count(), 0);
        let again = manager.borrow(&node()).await.unwrap();
        assert_ne!(again.id(), id);
        manager.release(again, true);
    }

    #[tokio::test]
    async fn test_dropped_guard_counts_as_invalid() {
        let manager = manager(PoolConfig::default());
        let pool = manager.pool(&node()).unwrap();
        let id = {
            let conn = manager.borrow(&node()).await.unwrap();
            conn.id()
        };
        assert_eq!(pool.active_count(), 0);
        assert_eq!(pool.idle_count(), 0);
        let again = manager.borrow(&node()).await.unwrap();
        assert_ne!(again.id(), id);
        manager.release(again, true);
    }

    #[tokio::test]
    async fn test_release_after_removal_closes() {
        let manager = manager(PoolConfig::default());
        let pool = manager.pool(&node()).unwrap();
        let conn = manager.borrow(&node()).await.unwrap();

        manager.remove_node(&node());
        manager.release(conn, true);
        assert_eq!(pool.idle_count(), 0);

        // A fresh pool for the same key does not adopt the old connection
        manager.add_node(&node()).unwrap();
        let fresh = manager.pool(&node()).unwrap();
        assert!(!Arc::ptr_eq(&fresh, &pool));
        assert_eq!(fresh.idle_count(), 1);
    }

    #[tokio::test]
    async fn test_exhausted_pool_waits_then_times_out() {
        let config = PoolConfig {
            max_total: 1,
            borrow_timeout_ms: 50,
            ..PoolConfig::default()
        };
        let manager = Arc::new(manager(config));
        let held = manager.borrow(&node()).await.unwrap();

        assert!(matches!(
            manager.borrow(&node()).await,
            Err(Error::Timeout(_))
        ));

        // A waiter is served as soon as the slot is returned
        let waiter = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.borrow(&node()).await.map(|c| c.id()) })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        let id = held.id();
        manager.release(held, true);
        assert_eq!(waiter.await.unwrap().unwrap(), id);
    }

    #[tokio::test]
    async fn test_evict_idle_keeps_min_idle() {
        let config = PoolConfig {
            min_idle: 1,
            idle_eviction_secs: 0,
            ..PoolConfig::default()
        };
        let manager = manager(config);
        let conns = vec![
            manager.borrow(&node()).await.unwrap(),
            manager.borrow(&node()).await.unwrap(),
            manager.borrow(&node()).await.unwrap(),
        ];
        for conn in conns {
            manager.release(conn, true);
        }
        let pool = manager.pool(&node()).unwrap();
        assert_eq!(pool.idle_count(), 3);

        assert_eq!(manager.evict_idle(), 2);
        assert_eq!(pool.idle_count(), 1);
    }

    #[tokio::test]
    async fn test_membership_listener_manages_pools() {
        let manager = PoolManager::new(PoolConfig::default());
        let peer = Node::new("127.0.0.1", 1, "0.3.0");
        let snapshot = MembershipSnapshot::default();

        manager.on_node_added(&snapshot, &peer);
        assert_eq!(manager.nodes(), vec![node()]);
        manager.on_node_removed(&snapshot, &peer);
        assert!(manager.nodes().is_empty());
    }
}
