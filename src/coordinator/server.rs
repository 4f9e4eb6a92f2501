//! Node server
//!
//! Wires one node together: registers it in the directory, starts the
//! membership monitor (which keeps a connection pool per live peer), the
//! idle-connection evictor and the gRPC server.

use crate::common::{timestamp_now_millis, Config, Result};
use crate::connection::{InternalClient, PoolManager};
use crate::coordinator::grpc::NodeGrpcService;
use crate::coordinator::manager::IndexManager;
use crate::coordinator::membership::{MembershipMonitor, MembershipSnapshot};
use crate::coordinator::metadata::{Node, NodeDirectory, NodeKey};
use crate::search::ShardEngine;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::TcpListenerStream;

/// Longest pause between two idle-connection sweeps.
const MAX_EVICTION_PERIOD: Duration = Duration::from_secs(30);

pub struct NodeServer {
    config: Config,
    directory: Arc<dyn NodeDirectory>,
    engine: Arc<dyn ShardEngine>,
}

impl NodeServer {
    pub fn new(config: Config, directory: Arc<dyn NodeDirectory>, engine: Arc<dyn ShardEngine>) -> Self {
        Self {
            config,
            directory,
            engine,
        }
    }

    /// Bind the configured RPC address.
    pub async fn bind(&self) -> Result<TcpListener> {
        let addr = format!(
            "{}:{}",
            self.config.node.server_address, self.config.node.rpc_port
        );
        Ok(TcpListener::bind(&addr).await?)
    }

    /// Serve on the configured address until `signal` resolves.
    pub async fn serve<F>(self, signal: F) -> Result<()>
    where
        F: std::future::Future<Output = ()>,
    {
        let listener = self.bind().await?;
        let handle = self.start(listener).await?;
        signal.await;
        handle.shutdown().await
    }

    /// Start every task of the node on an already bound listener.
    ///
    /// The node is identified by the listener's port, so binding port 0 works.
    pub async fn start(self, listener: TcpListener) -> Result<NodeHandle> {
        let port = listener.local_addr()?.port();
        let mut this_node = Node::new(
            self.config.node.server_address.clone(),
            port,
            self.config.node.version.clone(),
        );
        this_node.heartbeat = timestamp_now_millis();
        let key = this_node.key();

        tracing::info!("Starting node: {}", key);
        tracing::info!("  Version: {}", this_node.version);
        tracing::info!(
            "  Pool: {}..{} connections per peer",
            self.config.pool.min_idle,
            self.config.pool.max_total
        );
        tracing::info!(
            "  Membership: every {}ms, max lag {}ms",
            self.config.membership.interval_ms,
            self.config.membership.max_heartbeat_lag_ms
        );

        self.directory.register_node(this_node.clone()).await?;

        let pools = Arc::new(PoolManager::new(self.config.pool.clone()));
        let monitor = Arc::new(
            MembershipMonitor::new(self.directory.clone(), key.clone(), &self.config.membership)
                .with_listener(pools.clone()),
        );
        let membership = monitor.subscribe();

        let (shutdown, shutdown_rx) = watch::channel(false);
        let mut tasks = vec![monitor.spawn(shutdown_rx.clone())];
        let eviction_period = self
            .config
            .pool
            .idle_eviction()
            .min(MAX_EVICTION_PERIOD)
            .max(Duration::from_secs(1));
        tasks.push(pools.clone().spawn_evictor(eviction_period, shutdown_rx.clone()));

        let manager = Arc::new(IndexManager::new(
            self.directory.clone(),
            self.engine.clone(),
            InternalClient::new(pools.clone()),
            this_node,
            membership.clone(),
            &self.config.query,
        ));

        let service = NodeGrpcService::new(manager.clone()).into_server(self.config.pool.max_message_bytes);
        let mut server_shutdown = shutdown_rx;
        let server = tokio::spawn(async move {
            tonic::transport::Server::builder()
                .add_service(service)
                .serve_with_incoming_shutdown(TcpListenerStream::new(listener), async move {
                    let _ = server_shutdown.changed().await;
                })
                .await
                .map_err(crate::Error::from)
        });

        tracing::info!("✓ Node ready on {}", key);

        Ok(NodeHandle {
            key,
            manager,
            membership,
            pools,
            directory: self.directory,
            shutdown,
            server,
            tasks,
        })
    }
}

/// A running node.
pub struct NodeHandle {
    key: NodeKey,
    manager: Arc<IndexManager>,
    membership: watch::Receiver<Arc<MembershipSnapshot>>,
    pools: Arc<PoolManager>,
    directory: Arc<dyn NodeDirectory>,
    shutdown: watch::Sender<bool>,
    server: JoinHandle<Result<()>>,
    tasks: Vec<JoinHandle<()>>,
}

impl NodeHandle {
    pub fn key(&self) -> &NodeKey {
        &self.key
    }

    pub fn manager(&self) -> &Arc<IndexManager> {
        &self.manager
    }

    pub fn pools(&self) -> &Arc<PoolManager> {
        &self.pools
    }

    pub fn membership(&self) -> watch::Receiver<Arc<MembershipSnapshot>> {
        self.membership.clone()
    }

    /// Wait until at least `peers` other nodes are live.
    pub async fn wait_for_peers(&self, peers: usize, timeout: Duration) -> Result<()> {
        let mut membership = self.membership.clone();
        tokio::time::timeout(timeout, membership.wait_for(|s| s.len() >= peers)).await?
            .map_err(|_| crate::Error::Internal("membership monitor stopped".into()))?;
        Ok(())
    }

    /// Stop serving, stop background tasks, leave the directory.
    pub async fn shutdown(self) -> Result<()> {
        tracing::info!("Shutting down node {}", self.key);
        let _ = self.shutdown.send(true);

        let served = match self.server.await {
            Ok(result) => result,
            Err(e) => Err(crate::Error::Internal(format!("server task failed: {}", e))),
        };
        for task in self.tasks {
            if let Err(e) = task.await {
                tracing::warn!("Background task ended abnormally: {}", e);
            }
        }

        self.pools.close_all();
        if let Err(e) = self.directory.remove_node(&self.key).await {
            tracing::warn!("Failed to leave directory: {}", e);
        }
        served
    }
}
