//! Per-shard fan-out
//!
//! One routed request per shard, at most `concurrency` in flight, answers in
//! shard order. The first failure fails the whole call and drops the
//! requests still in flight.

use crate::common::Result;
use crate::coordinator::metadata::{IndexMapping, NodeKey};
use crate::coordinator::router::{dispatch, ShardOperation, ShardStrategy, ShardTarget};
use futures_util::stream::{self, StreamExt, TryStreamExt};

#[derive(Debug, Clone, Copy, Default)]
pub struct FanoutCoordinator {
    concurrency: Option<usize>,
}

impl FanoutCoordinator {
    /// `None` sends to every shard at once.
    pub fn new(concurrency: Option<usize>) -> Self {
        Self { concurrency }
    }

    /// Resolve every shard of `index_mapping` up front.
    pub fn targets_for(
        index_mapping: &IndexMapping,
        strategy: &dyn ShardStrategy,
        this_node: &NodeKey,
    ) -> Result<Vec<ShardTarget>> {
        (0..index_mapping.number_of_shards)
            .map(|shard| ShardTarget::resolve(index_mapping, shard, strategy, this_node))
            .collect()
    }

    pub async fn send<O, F>(
        &self,
        index_name: &str,
        targets: &[ShardTarget],
        operation: &O,
        make_request: F,
    ) -> Result<Vec<O::Response>>
    where
        O: ShardOperation,
        F: Fn(u32) -> O::Request,
    {
        let limit = self.concurrency.unwrap_or(targets.len()).max(1);
        stream::iter(0..targets.len())
            .map(|i| {
                let target = &targets[i];
                dispatch(operation, index_name, target, make_request(target.shard))
            })
            .buffered(limit)
            .try_collect()
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::Error;
    use crate::coordinator::metadata::Node;
    use crate::coordinator::placement::LiveNodes;
    use crate::coordinator::router::ShardTable;
    use crate::proto::RoutingPolicy;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Sleeps longer on low shards so completion order is reversed.
    #[derive(Default)]
    struct Slow {
        in_flight: AtomicUsize,
        peak: AtomicUsize,
        fail_shard: Option<u32>,
    }

    #[async_trait]
    impl ShardOperation for Slow {
        type Request = u32;
        type Response = u32;
        const NAME: &'static str = "slow";

        async fn process_internal(&self, _index_name: &str, shard: u32, request: u32) -> Result<u32> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(5 * (10 - shard as u64))).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            if self.fail_shard == Some(shard) {
                return Err(Error::Internal(format!("shard {} failed", shard)));
            }
            Ok(request * 10)
        }

        async fn process_external(
            &self,
            node: &Node,
            _index_name: &str,
            _shard: u32,
            _request: u32,
        ) -> Result<u32> {
            Err(Error::NodeNotLoaded(node.key().to_string()))
        }
    }

    fn local_targets(shards: u32) -> Vec<ShardTarget> {
        let this = Node::new("127.0.0.1", 1, "test");
        let mapping = IndexMapping::spread("books", shards, &[this.key()], 0).unwrap();
        let live = LiveNodes::alone(this.clone());
        let table = ShardTable::build(&mapping, RoutingPolicy::MasterOnly, &live).unwrap();
        FanoutCoordinator::targets_for(&mapping, &table, &this.key()).unwrap()
    }

    #[tokio::test]
    async fn test_results_in_shard_order() {
        let targets = local_targets(6);
        let op = Slow::default();
        let responses = FanoutCoordinator::new(None)
            .send("books", &targets, &op, |shard| shard)
            .await
            .unwrap();
        assert_eq!(responses, vec![0, 10, 20, 30, 40, 50]);
        assert_eq!(op.peak.load(Ordering::SeqCst), 6);
    }

    #[tokio::test]
    async fn test_concurrency_is_bounded() {
        let targets = local_targets(6);
        let op = Slow::default();
        FanoutCoordinator::new(Some(2))
            .send("books", &targets, &op, |shard| shard)
            .await
            .unwrap();
        assert!(op.peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_one_failure_fails_all() {
        let targets = local_targets(4);
        let op = Slow {
            fail_shard: Some(2),
            ..Default::default()
        };
        let err = FanoutCoordinator::new(None)
            .send("books", &targets, &op, |shard| shard)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("shard 2 failed"));
    }

    #[tokio::test]
    async fn test_remote_targets_use_external_path() {
        let this = Node::new("127.0.0.1", 1, "test");
        let other = Node::new("127.0.0.1", 2, "test");
        let mapping = IndexMapping::spread("books", 2, &[this.key(), other.key()], 0).unwrap();
        let targets: Vec<ShardTarget> = (0..2)
            .map(|shard| ShardTarget {
                shard,
                node: if shard == 0 { this.clone() } else { other.clone() },
                local: shard == 0,
            })
            .collect();
        assert_eq!(targets.len() as u32, mapping.number_of_shards);

        let err = FanoutCoordinator::new(None)
            .send("books", &targets, &Slow::default(), |shard| shard)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NodeNotLoaded(_)));
    }
}
