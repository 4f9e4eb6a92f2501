//! Shard routing
//!
//! A [`ShardStrategy`] answers "which node serves shard N of this index";
//! a [`RequestRouter`] turns that answer into a call, running the operation
//! in-process when the node is this one and over RPC otherwise.

use crate::common::{shard_for_key, Error, Result};
use crate::coordinator::metadata::{IndexMapping, Node, NodeKey};
use crate::coordinator::placement::{LiveNodes, ReplicaSelector};
use crate::proto::RoutingPolicy;
use async_trait::async_trait;
use tracing::debug;

/// One operation that can run against a single shard, locally or on a peer.
#[async_trait]
pub trait ShardOperation: Send + Sync {
    type Request: Send + 'static;
    type Response: Send + 'static;

    /// Name used in log lines.
    const NAME: &'static str;

    /// Run against a shard held by this process.
    async fn process_internal(
        &self,
        index_name: &str,
        shard: u32,
        request: Self::Request,
    ) -> Result<Self::Response>;

    /// Run against a shard held by `node`.
    async fn process_external(
        &self,
        node: &Node,
        index_name: &str,
        shard: u32,
        request: Self::Request,
    ) -> Result<Self::Response>;
}

/// Resolves a shard of an index to the node that should serve it.
pub trait ShardStrategy: Send + Sync {
    fn resolve(&self, index_mapping: &IndexMapping, shard: u32) -> Result<Node>;
}

/// Re-runs replica selection against the live view on every call.
pub struct SelectorStrategy {
    policy: RoutingPolicy,
    live: LiveNodes,
}

impl SelectorStrategy {
    pub fn new(policy: RoutingPolicy, live: LiveNodes) -> Self {
        Self { policy, live }
    }
}

impl ShardStrategy for SelectorStrategy {
    fn resolve(&self, index_mapping: &IndexMapping, shard: u32) -> Result<Node> {
        ReplicaSelector::select_for_shard(index_mapping, shard, self.policy, &self.live)
    }
}

/// Shard → node table fixed at construction.
///
/// Building the table selects a node for every shard up front, so one
/// fan-out sees a single consistent assignment even if membership changes
/// while it runs.
#[derive(Debug, Clone)]
pub struct ShardTable {
    index_name: String,
    nodes: Vec<Node>,
}

impl ShardTable {
    pub fn build(index_mapping: &IndexMapping, policy: RoutingPolicy, live: &LiveNodes) -> Result<Self> {
        let nodes = (0..index_mapping.number_of_shards)
            .map(|shard| ReplicaSelector::select_for_shard(index_mapping, shard, policy, live))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            index_name: index_mapping.index_name.clone(),
            nodes,
        })
    }

    pub fn node(&self, shard: u32) -> Option<&Node> {
        self.nodes.get(shard as usize)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

impl ShardStrategy for ShardTable {
    fn resolve(&self, index_mapping: &IndexMapping, shard: u32) -> Result<Node> {
        if index_mapping.index_name != self.index_name {
            return Err(Error::InvalidArgument(format!(
                "shard table for <{}> used with index <{}>",
                self.index_name, index_mapping.index_name
            )));
        }
        self.node(shard)
            .cloned()
            .ok_or_else(|| Error::ShardDoesNotExist {
                index: self.index_name.clone(),
                shard,
            })
    }
}

/// A shard paired with the node chosen to serve it.
#[derive(Debug, Clone)]
pub struct ShardTarget {
    pub shard: u32,
    pub node: Node,
    pub local: bool,
}

impl ShardTarget {
    pub fn resolve(
        index_mapping: &IndexMapping,
        shard: u32,
        strategy: &dyn ShardStrategy,
        this_node: &NodeKey,
    ) -> Result<Self> {
        let node = strategy.resolve(index_mapping, shard)?;
        let local = node.is(this_node);
        Ok(Self { shard, node, local })
    }
}

/// Run `operation` on `target`, in-process or over RPC.
pub async fn dispatch<O: ShardOperation>(
    operation: &O,
    index_name: &str,
    target: &ShardTarget,
    request: O::Request,
) -> Result<O::Response> {
    if target.local {
        debug!("{} {}/{} on this node", O::NAME, index_name, target.shard);
        operation
            .process_internal(index_name, target.shard, request)
            .await
    } else {
        debug!(
            "{} {}/{} on {}",
            O::NAME,
            index_name,
            target.shard,
            target.node.key()
        );
        operation
            .process_external(&target.node, index_name, target.shard, request)
            .await
    }
}

/// Routes one keyed request to the node serving the key's shard.
pub struct RequestRouter<'a> {
    index_mapping: &'a IndexMapping,
    target: ShardTarget,
}

impl<'a> RequestRouter<'a> {
    pub fn new(
        index_mapping: &'a IndexMapping,
        unique_id: &str,
        strategy: &dyn ShardStrategy,
        live: &LiveNodes,
    ) -> Result<Self> {
        let shard = shard_for_key(unique_id, index_mapping.number_of_shards);
        let target = ShardTarget::resolve(index_mapping, shard, strategy, &live.this_node.key())?;
        Ok(Self {
            index_mapping,
            target,
        })
    }

    pub fn shard(&self) -> u32 {
        self.target.shard
    }

    pub fn node(&self) -> &Node {
        &self.target.node
    }

    pub fn is_local(&self) -> bool {
        self.target.local
    }

    pub async fn send<O: ShardOperation>(&self, operation: &O, request: O::Request) -> Result<O::Response> {
        dispatch(operation, &self.index_mapping.index_name, &self.target, request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::membership::MembershipSnapshot;
    use std::collections::BTreeMap;
    use std::sync::Arc;

    /// Echoes where it ran.
    struct Where;

    #[async_trait]
    impl ShardOperation for Where {
        type Request = ();
        type Response = String;
        const NAME: &'static str = "where";

        async fn process_internal(&self, index_name: &str, shard: u32, _request: ()) -> Result<String> {
            Ok(format!("local {}/{}", index_name, shard))
        }

        async fn process_external(
            &self,
            node: &Node,
            index_name: &str,
            shard: u32,
            _request: (),
        ) -> Result<String> {
            Ok(format!("{} {}/{}", node.key(), index_name, shard))
        }
    }

    fn node(port: u16) -> Node {
        Node::new("127.0.0.1", port, "test")
    }

    fn cluster() -> (IndexMapping, LiveNodes) {
        let nodes: Vec<NodeKey> = (1..=3).map(|p| node(p).key()).collect();
        let mapping = IndexMapping::spread("books", 3, &nodes, 1).unwrap();
        let others: BTreeMap<NodeKey, Node> = [node(2), node(3)]
            .into_iter()
            .map(|n| (n.key(), n))
            .collect();
        let live = LiveNodes::new(node(1), Arc::new(MembershipSnapshot::new(others)));
        (mapping, live)
    }

    #[tokio::test]
    async fn test_router_runs_local_shard_in_process() {
        let (mapping, live) = cluster();
        let strategy = SelectorStrategy::new(RoutingPolicy::MasterOnly, live.clone());

        // "hello" hashes to shard 1, mastered by the second node
        let router = RequestRouter::new(&mapping, "hello", &strategy, &live).unwrap();
        assert_eq!(router.shard(), 1);
        assert!(!router.is_local());
        assert_eq!(router.send(&Where, ()).await.unwrap(), "127.0.0.1:2 books/1");

        let local_key = (0..100)
            .map(|i| format!("doc-{}", i))
            .find(|k| shard_for_key(k, 3) == 0)
            .unwrap();
        let router = RequestRouter::new(&mapping, &local_key, &strategy, &live).unwrap();
        assert!(router.is_local());
        assert_eq!(router.send(&Where, ()).await.unwrap(), "local books/0");
    }

    #[test]
    fn test_selector_strategy_fails_over() {
        let (mapping, live) = cluster();
        let alone = LiveNodes::alone(live.this_node.clone());

        // Shard 1: master is node 2, replica is node 3; neither is live
        let err = SelectorStrategy::new(RoutingPolicy::MasterPreferred, alone)
            .resolve(&mapping, 1)
            .unwrap_err();
        assert!(matches!(err, Error::ShardOffline { shard: 1, .. }));

        let replica = SelectorStrategy::new(RoutingPolicy::ReplicaOnly, live)
            .resolve(&mapping, 1)
            .unwrap();
        assert_eq!(replica.rpc_port, 3);
    }

    #[test]
    fn test_shard_table_is_fixed() {
        let (mapping, live) = cluster();
        let table = ShardTable::build(&mapping, RoutingPolicy::MasterOnly, &live).unwrap();
        assert_eq!(table.len(), 3);
        let ports: Vec<u16> = (0..3).map(|s| table.node(s).unwrap().rpc_port).collect();
        assert_eq!(ports, vec![1, 2, 3]);

        assert!(matches!(
            table.resolve(&mapping, 7),
            Err(Error::ShardDoesNotExist { shard: 7, .. })
        ));

        let other = IndexMapping::spread("films", 3, &[live.this_node.key()], 0).unwrap();
        assert!(table.resolve(&other, 0).is_err());
    }

    #[test]
    fn test_shard_table_needs_every_shard() {
        let (mapping, live) = cluster();
        let alone = LiveNodes::alone(live.this_node.clone());
        assert!(ShardTable::build(&mapping, RoutingPolicy::MasterOnly, &alone).is_err());
    }
}
