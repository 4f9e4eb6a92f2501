//! Replica selection
//!
//! Picks the node serving a shard from its mapping, a routing policy and
//! the current view of live nodes. Selection is pure and deterministic: the
//! same mapping, policy and view always yield the same node.

use crate::common::{Error, Result};
use crate::coordinator::membership::MembershipSnapshot;
use crate::coordinator::metadata::{IndexMapping, Node, NodeKey, ShardMapping};
use crate::proto::RoutingPolicy;
use std::sync::Arc;

/// This node plus every other node currently considered live.
#[derive(Debug, Clone)]
pub struct LiveNodes {
    pub this_node: Node,
    pub snapshot: Arc<MembershipSnapshot>,
}

impl LiveNodes {
    pub fn new(this_node: Node, snapshot: Arc<MembershipSnapshot>) -> Self {
        Self {
            this_node,
            snapshot,
        }
    }

    /// A view with no other live nodes.
    pub fn alone(this_node: Node) -> Self {
        Self::new(this_node, Arc::new(MembershipSnapshot::default()))
    }

    pub fn is_this_node(&self, key: &NodeKey) -> bool {
        self.this_node.is(key)
    }

    /// Resolve a key to a live node, if any.
    pub fn get(&self, key: &NodeKey) -> Option<&Node> {
        if self.is_this_node(key) {
            Some(&self.this_node)
        } else {
            self.snapshot.get(key)
        }
    }
}

pub struct ReplicaSelector;

impl ReplicaSelector {
    /// Select the node that serves `shard_mapping` under `policy`.
    pub fn select(
        shard_mapping: &ShardMapping,
        index_name: &str,
        policy: RoutingPolicy,
        live: &LiveNodes,
    ) -> Result<Node> {
        let master = || live.get(&shard_mapping.master);
        let replica = || Self::live_replica(shard_mapping, live);

        let selected = match policy {
            RoutingPolicy::MasterOnly => master(),
            RoutingPolicy::MasterPreferred => master().or_else(replica),
            RoutingPolicy::ReplicaPreferred => replica().or_else(master),
            RoutingPolicy::ReplicaOnly => replica(),
        };

        selected.cloned().ok_or_else(|| Error::ShardOffline {
            index: index_name.to_string(),
            shard: shard_mapping.shard_number,
            policy,
        })
    }

    /// Select the node for shard `shard_number` of `index_mapping`.
    pub fn select_for_shard(
        index_mapping: &IndexMapping,
        shard_number: u32,
        policy: RoutingPolicy,
        live: &LiveNodes,
    ) -> Result<Node> {
        let shard_mapping =
            index_mapping
                .shard(shard_number)
                .ok_or_else(|| Error::ShardDoesNotExist {
                    index: index_mapping.index_name.clone(),
                    shard: shard_number,
                })?;
        Self::select(shard_mapping, &index_mapping.index_name, policy, live)
    }

    /// First live replica in mapping order; this node counts as live.
    fn live_replica<'a>(shard_mapping: &ShardMapping, live: &'a LiveNodes) -> Option<&'a Node> {
        shard_mapping
            .replicas
            .iter()
            .find_map(|replica| live.get(replica))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn node(address: &str) -> Node {
        Node::new(address, 32191, "0.3.0")
    }

    fn mapping() -> ShardMapping {
        ShardMapping {
            shard_number: 0,
            master: node("m").key(),
            replicas: vec![node("r1").key(), node("r2").key()],
        }
    }

    fn view(this: &str, others: &[&str]) -> LiveNodes {
        let live: BTreeMap<NodeKey, Node> = others
            .iter()
            .map(|a| (node(a).key(), node(a)))
            .collect();
        LiveNodes::new(node(this), Arc::new(MembershipSnapshot::new(live)))
    }

    fn select(policy: RoutingPolicy, live: &LiveNodes) -> Result<Node> {
        ReplicaSelector::select(&mapping(), "books", policy, live)
    }

    #[test]
    fn test_all_live() {
        let live = view("client", &["m", "r1", "r2"]);
        assert_eq!(select(RoutingPolicy::MasterOnly, &live).unwrap(), node("m"));
        assert_eq!(select(RoutingPolicy::MasterPreferred, &live).unwrap(), node("m"));
        assert_eq!(select(RoutingPolicy::ReplicaPreferred, &live).unwrap(), node("r1"));
        assert_eq!(select(RoutingPolicy::ReplicaOnly, &live).unwrap(), node("r1"));
    }

    #[test]
    fn test_master_down() {
        let live = view("client", &["r2"]);
        assert!(matches!(
            select(RoutingPolicy::MasterOnly, &live),
            Err(Error::ShardOffline {
                shard: 0,
                policy: RoutingPolicy::MasterOnly,
                ..
            })
        ));
        assert_eq!(select(RoutingPolicy::MasterPreferred, &live).unwrap(), node("r2"));
        assert_eq!(select(RoutingPolicy::ReplicaOnly, &live).unwrap(), node("r2"));
    }

    #[test]
    fn test_replicas_down() {
        let live = view("client", &["m"]);
        assert_eq!(select(RoutingPolicy::ReplicaPreferred, &live).unwrap(), node("m"));
        assert!(select(RoutingPolicy::ReplicaOnly, &live).is_err());
    }

    #[test]
    fn test_nothing_live() {
        let live = view("client", &[]);
        for policy in [
            RoutingPolicy::MasterOnly,
            RoutingPolicy::MasterPreferred,
            RoutingPolicy::ReplicaPreferred,
            RoutingPolicy::ReplicaOnly,
        ] {
            assert!(select(policy, &live).is_err());
        }
    }

    #[test]
    fn test_local_node_counts_as_live() {
        // This node is never in its own snapshot
        let live = view("m", &[]);
        assert_eq!(select(RoutingPolicy::MasterOnly, &live).unwrap(), node("m"));
    }

    #[test]
    fn test_replicas_follow_mapping_order() {
        // Holding the second replica locally does not jump the queue
        let live = view("r2", &["m", "r1"]);
        assert_eq!(select(RoutingPolicy::ReplicaOnly, &live).unwrap(), node("r1"));
        assert_eq!(select(RoutingPolicy::ReplicaPreferred, &live).unwrap(), node("r1"));

        let live = view("r2", &["m"]);
        assert_eq!(select(RoutingPolicy::ReplicaOnly, &live).unwrap(), node("r2"));
    }

    #[test]
    fn test_deterministic() {
        let live = view("client", &["r2", "r1", "m"]);
        let first = select(RoutingPolicy::ReplicaPreferred, &live).unwrap();
        for _ in 0..10 {
            assert_eq!(select(RoutingPolicy::ReplicaPreferred, &live).unwrap(), first);
        }
    }

    #[test]
    fn test_select_for_missing_shard() {
        let index = IndexMapping {
            index_name: "books".into(),
            number_of_shards: 2,
            shard_mappings: vec![mapping()],
        };
        let live = view("client", &["m"]);
        assert!(ReplicaSelector::select_for_shard(&index, 0, RoutingPolicy::MasterOnly, &live).is_ok());
        assert!(matches!(
            ReplicaSelector::select_for_shard(&index, 1, RoutingPolicy::MasterOnly, &live),
            Err(Error::ShardDoesNotExist { shard: 1, .. })
        ));
    }
}
