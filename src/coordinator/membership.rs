//! Membership tracking
//!
//! A single background task refreshes this node's heartbeat, reads the
//! directory and decides which other nodes are live. Liveness is relative:
//! a node is live while its heartbeat trails the reference heartbeat (by
//! default the newest one observed) by less than the configured lag, so
//! clock skew between nodes does not matter. If the node with the newest
//! heartbeat stalls, the reference stalls with it and removals are delayed.
//!
//! Each tick publishes an immutable [`MembershipSnapshot`] through a `watch`
//! channel after notifying listeners of leavers, then joiners. Listeners run
//! first so connection pools exist before routing sees a new node; a
//! panicking listener is contained on its own and never blocks publication.

use crate::common::Result;
use crate::coordinator::metadata::{Node, NodeDirectory, NodeKey};
use futures_util::FutureExt;
use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

/// Live nodes other than this one, as of one tick.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MembershipSnapshot {
    live_other_nodes: BTreeMap<NodeKey, Node>,
}

impl MembershipSnapshot {
    pub fn new(live_other_nodes: BTreeMap<NodeKey, Node>) -> Self {
        Self { live_other_nodes }
    }

    pub fn get(&self, key: &NodeKey) -> Option<&Node> {
        self.live_other_nodes.get(key)
    }

    pub fn contains(&self, key: &NodeKey) -> bool {
        self.live_other_nodes.contains_key(key)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.live_other_nodes.values()
    }

    pub fn keys(&self) -> impl Iterator<Item = &NodeKey> {
        self.live_other_nodes.keys()
    }

    pub fn len(&self) -> usize {
        self.live_other_nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.live_other_nodes.is_empty()
    }
}

/// Notified when a node joins or leaves the live set.
///
/// `current` is the full live set of the tick that produced the change.
pub trait MembershipListener: Send + Sync {
    fn on_node_added(&self, current: &MembershipSnapshot, node: &Node);

    fn on_node_removed(&self, current: &MembershipSnapshot, node: &Node);
}

/// Computes the reference heartbeat from every registered node.
pub type ReferenceFn = Arc<dyn Fn(&[Node]) -> u64 + Send + Sync>;

/// Newest heartbeat observed.
pub fn latest_heartbeat(nodes: &[Node]) -> u64 {
    nodes.iter().map(|n| n.heartbeat).max().unwrap_or(0)
}

/// Nodes that joined and left during one tick
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MembershipChange {
    pub added: Vec<NodeKey>,
    pub removed: Vec<NodeKey>,
}

impl MembershipChange {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

pub struct MembershipMonitor {
    directory: Arc<dyn NodeDirectory>,
    this_node: NodeKey,
    interval: Duration,
    max_heartbeat_lag_ms: u64,
    reference: ReferenceFn,
    listeners: Vec<Arc<dyn MembershipListener>>,
    sender: watch::Sender<Arc<MembershipSnapshot>>,
}

impl MembershipMonitor {
    pub fn new(
        directory: Arc<dyn NodeDirectory>,
        this_node: NodeKey,
        config: &crate::common::MembershipConfig,
    ) -> Self {
        let (sender, _) = watch::channel(Arc::new(MembershipSnapshot::default()));
        Self {
            directory,
            this_node,
            interval: config.interval(),
            max_heartbeat_lag_ms: config.max_heartbeat_lag_ms,
            reference: Arc::new(latest_heartbeat),
            listeners: Vec::new(),
            sender,
        }
    }

    /// Replace the reference heartbeat function.
    pub fn with_reference(mut self, reference: ReferenceFn) -> Self {
        self.reference = reference;
        self
    }

    pub fn with_listener(mut self, listener: Arc<dyn MembershipListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    /// Receiver of published snapshots.
    pub fn subscribe(&self) -> watch::Receiver<Arc<MembershipSnapshot>> {
        self.sender.subscribe()
    }

    /// Most recently published snapshot.
    pub fn snapshot(&self) -> Arc<MembershipSnapshot> {
        self.sender.borrow().clone()
    }

    /// Run one membership round.
    pub async fn tick(&self) -> Result<MembershipChange> {
        self.directory
            .update_heartbeat(&self.this_node.server_address, self.this_node.rpc_port)
            .await?;

        let nodes = self.directory.get_nodes().await?;
        let latest = (self.reference)(&nodes);

        let current = MembershipSnapshot::new(
            nodes
                .into_iter()
                .filter(|n| !n.is(&self.this_node))
                .filter(|n| latest.saturating_sub(n.heartbeat) < self.max_heartbeat_lag_ms)
                .map(|n| (n.key(), n))
                .collect(),
        );

        let previous = self.snapshot();
        let mut change = MembershipChange::default();

        for (key, node) in &previous.live_other_nodes {
            if !current.contains(key) {
                info!("Node {} removed from live set", key);
                self.notify_all("removal of", key, |l| l.on_node_removed(&current, node));
                change.removed.push(key.clone());
            }
        }

        for (key, node) in &current.live_other_nodes {
            if !previous.contains(key) {
                info!("Node {} added to live set (version {})", key, node.version);
                self.notify_all("addition of", key, |l| l.on_node_added(&current, node));
                change.added.push(key.clone());
            }
        }

        self.sender.send_replace(Arc::new(current));
        Ok(change)
    }

    /// Run `notify` for every listener. A panicking listener is logged and the
    /// rest still run, so the round always reaches publication.
    fn notify_all(&self, event: &str, key: &NodeKey, notify: impl Fn(&dyn MembershipListener)) {
        for listener in &self.listeners {
            let listener = listener.as_ref();
            if let Err(panic) = std::panic::catch_unwind(AssertUnwindSafe(|| notify(listener))) {
                error!(
                    "Membership listener panicked on {} {}: {}",
                    event,
                    key,
                    panic_message(&*panic)
                );
            }
        }
    }

    /// One round with failures and panics turned into log lines.
    async fn guarded_tick(&self) {
        match AssertUnwindSafe(self.tick()).catch_unwind().await {
            Ok(Ok(change)) => {
                if !change.is_empty() {
                    debug!(
                        "Membership changed: +{} -{}",
                        change.added.len(),
                        change.removed.len()
                    );
                }
            }
            Ok(Err(e)) => error!("Membership update failed: {}", e),
            Err(panic) => error!("Membership update panicked: {}", panic_message(&*panic)),
        }
    }

    /// Background loop ticking until shutdown. The first round runs immediately.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    debug!("Membership monitor shutting down");
                    break;
                }
                _ = interval.tick() => {
                    self.guarded_tick().await;
                }
            }
        }
    }

    pub fn spawn(self: Arc<Self>, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        info!(
            "Starting membership monitor for {} (interval {:?}, max lag {}ms)",
            self.this_node, self.interval, self.max_heartbeat_lag_ms
        );
        tokio::spawn(self.run(shutdown))
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{Error, MembershipConfig};
    use crate::coordinator::metadata::MemoryDirectory;
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<String>>,
    }

    impl MembershipListener for Recorder {
        fn on_node_added(&self, current: &MembershipSnapshot, node: &Node) {
            self.events
                .lock()
                .unwrap()
                .push(format!("+{} ({})", node.key(), current.len()));
        }

        fn on_node_removed(&self, current: &MembershipSnapshot, node: &Node) {
            self.events
                .lock()
                .unwrap()
                .push(format!("-{} ({})", node.key(), current.len()));
        }
    }

    struct Cluster {
        now: Arc<AtomicU64>,
        directory: Arc<MemoryDirectory>,
        recorder: Arc<Recorder>,
        monitor: MembershipMonitor,
    }

    async fn cluster(peers: &[&str]) -> Cluster {
        let now = Arc::new(AtomicU64::new(100_000));
        let clock_now = now.clone();
        let directory = Arc::new(MemoryDirectory::with_clock(Arc::new(move || {
            clock_now.load(Ordering::SeqCst)
        })));
        for address in std::iter::once(&"self").chain(peers) {
            directory
                .register_node(Node::new(*address, 32191, "0.3.0"))
                .await
                .unwrap();
        }
        let recorder = Arc::new(Recorder::default());
        let monitor = MembershipMonitor::new(
            directory.clone(),
            NodeKey::new("self", 32191),
            &MembershipConfig::default(),
        )
        .with_listener(recorder.clone());
        Cluster {
            now,
            directory,
            recorder,
            monitor,
        }
    }

    fn key(address: &str) -> NodeKey {
        NodeKey::new(address, 32191)
    }

    #[tokio::test]
    async fn test_first_tick_adds_peers_not_self() {
        let c = cluster(&["a", "b"]).await;
        let change = c.monitor.tick().await.unwrap();

        assert_eq!(change.added, vec![key("a"), key("b")]);
        assert!(change.removed.is_empty());
        let snapshot = c.monitor.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert!(!snapshot.contains(&key("self")));
        assert_eq!(
            *c.recorder.events.lock().unwrap(),
            vec!["+a:32191 (2)", "+b:32191 (2)"]
        );
    }

    #[tokio::test]
    async fn test_stale_node_removed_exactly_once() {
        let c = cluster(&["a", "b"]).await;
        c.monitor.tick().await.unwrap();

        // "a" stops heartbeating; "self" and "b" keep going
        c.now.store(131_000, Ordering::SeqCst);
        c.directory.set_heartbeat(&key("b"), 131_000).unwrap();

        let change = c.monitor.tick().await.unwrap();
        assert_eq!(change.removed, vec![key("a")]);
        assert!(change.added.is_empty());

        let change = c.monitor.tick().await.unwrap();
        assert!(change.is_empty());

        let events = c.recorder.events.lock().unwrap().clone();
        assert_eq!(events.iter().filter(|e| e.starts_with("-a")).count(), 1);
        assert_eq!(events.last().unwrap(), "-a:32191 (1)");
    }

    #[tokio::test]
    async fn test_lag_boundary() {
        let c = cluster(&["a"]).await;
        c.monitor.tick().await.unwrap();

        // Exactly at the lag limit is no longer live
        c.now.store(129_999, Ordering::SeqCst);
        c.monitor.tick().await.unwrap();
        assert!(c.monitor.snapshot().contains(&key("a")));

        c.now.store(130_000, Ordering::SeqCst);
        c.monitor.tick().await.unwrap();
        assert!(!c.monitor.snapshot().contains(&key("a")));
    }

    #[tokio::test]
    async fn test_node_rejoins() {
        let c = cluster(&["a"]).await;
        c.monitor.tick().await.unwrap();
        c.now.store(200_000, Ordering::SeqCst);
        c.monitor.tick().await.unwrap();
        assert!(c.monitor.snapshot().is_empty());

        c.directory.set_heartbeat(&key("a"), 200_000).unwrap();
        let change = c.monitor.tick().await.unwrap();
        assert_eq!(change.added, vec![key("a")]);
    }

    #[tokio::test]
    async fn test_injected_reference() {
        let c = cluster(&["a"]).await;
        let monitor = c
            .monitor
            .with_reference(Arc::new(|_: &[Node]| 1_000_000u64));
        monitor.tick().await.unwrap();
        assert!(monitor.snapshot().is_empty());
    }

    #[tokio::test]
    async fn test_subscribers_see_new_snapshot() {
        let c = cluster(&["a"]).await;
        let mut rx = c.monitor.subscribe();
        assert!(rx.borrow().is_empty());

        c.monitor.tick().await.unwrap();
        assert!(rx.has_changed().unwrap());
        assert!(rx.borrow_and_update().contains(&key("a")));
    }

    struct Exploding {
        armed: AtomicBool,
    }

    impl MembershipListener for Exploding {
        fn on_node_added(&self, _: &MembershipSnapshot, _: &Node) {
            if self.armed.swap(false, Ordering::SeqCst) {
                panic!("listener failure");
            }
        }

        fn on_node_removed(&self, _: &MembershipSnapshot, _: &Node) {}
    }

    #[tokio::test]
    async fn test_listener_panic_does_not_repeat_removal() {
        let c = cluster(&["a", "b"]).await;
        let exploding = Arc::new(Exploding {
            armed: AtomicBool::new(false),
        });
        let monitor = c.monitor.with_listener(exploding.clone());
        monitor.guarded_tick().await;

        // "a" goes stale while "c" joins and the second listener blows up on it
        c.now.store(131_000, Ordering::SeqCst);
        c.directory.set_heartbeat(&key("b"), 131_000).unwrap();
        c.directory
            .register_node(Node::new("c", 32191, "0.3.0"))
            .await
            .unwrap();
        exploding.armed.store(true, Ordering::SeqCst);
        monitor.guarded_tick().await;
        monitor.guarded_tick().await;

        let events = c.recorder.events.lock().unwrap().clone();
        assert_eq!(events.iter().filter(|e| e.starts_with("-a")).count(), 1);
        assert_eq!(events.iter().filter(|e| e.starts_with("+c")).count(), 1);
        let snapshot = monitor.snapshot();
        assert!(!snapshot.contains(&key("a")));
        assert!(snapshot.contains(&key("b")));
        assert!(snapshot.contains(&key("c")));
    }

    #[tokio::test]
    async fn test_panicking_listener_does_not_starve_others() {
        let c = cluster(&["a"]).await;
        let late = Arc::new(Recorder::default());
        let monitor = c
            .monitor
            .with_listener(Arc::new(Exploding {
                armed: AtomicBool::new(true),
            }))
            .with_listener(late.clone());

        let change = monitor.tick().await.unwrap();
        assert_eq!(change.added, vec![key("a")]);
        assert_eq!(*late.events.lock().unwrap(), vec!["+a:32191 (1)"]);
        assert!(monitor.snapshot().contains(&key("a")));
    }

    #[tokio::test]
    async fn test_unregistered_self_fails_tick() {
        let directory = Arc::new(MemoryDirectory::new());
        let monitor = MembershipMonitor::new(
            directory,
            NodeKey::new("ghost", 1),
            &MembershipConfig::default(),
        );
        assert!(matches!(
            monitor.tick().await,
            Err(Error::NotRegistered(_))
        ));
    }

    #[tokio::test]
    async fn test_spawned_task_stops_on_shutdown() {
        let c = cluster(&["a"]).await;
        let monitor = Arc::new(c.monitor);
        let mut rx = monitor.subscribe();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = monitor.clone().spawn(shutdown_rx);
        rx.changed().await.unwrap();
        assert!(rx.borrow().contains(&key("a")));

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
