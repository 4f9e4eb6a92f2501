//! Node facade over every index it can reach
//!
//! External operations come from clients: they resolve the index mapping,
//! route keyed requests with a [`SelectorStrategy`] and fan index-wide ones
//! out over a [`ShardTable`], then combine the answers. Internal operations
//! come from peers and run against the local engine only.

use crate::common::{shard_for_key, validate_index_name, validate_key, Error, QueryConfig, Result};
use crate::connection::InternalClient;
use crate::coordinator::fanout::FanoutCoordinator;
use crate::coordinator::membership::MembershipSnapshot;
use crate::coordinator::metadata::{IndexMapping, Node, NodeDirectory};
use crate::coordinator::operations::{self, Backends};
use crate::coordinator::placement::LiveNodes;
use crate::coordinator::router::{RequestRouter, SelectorStrategy, ShardTable, ShardTarget};
use crate::proto::*;
use crate::search::{
    validate_shard_responses, FacetCountCombiner, ResultComparator, ResultMerger, ShardEngine,
    StatAggregator,
};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info};

pub struct IndexManager {
    directory: Arc<dyn NodeDirectory>,
    backends: Backends,
    this_node: Node,
    membership: watch::Receiver<Arc<MembershipSnapshot>>,
    fanout: FanoutCoordinator,
    query_timeout: Duration,
}

/// Non-positive per-shard facet limits other than `-1` mean "all facets".
fn normalize_shard_facets(shard_facets: i32) -> i32 {
    if shard_facets > 0 {
        shard_facets
    } else {
        -1
    }
}

impl IndexManager {
    pub fn new(
        directory: Arc<dyn NodeDirectory>,
        engine: Arc<dyn ShardEngine>,
        client: InternalClient,
        this_node: Node,
        membership: watch::Receiver<Arc<MembershipSnapshot>>,
        config: &QueryConfig,
    ) -> Self {
        Self {
            directory,
            backends: Backends::new(engine, client),
            this_node,
            membership,
            fanout: FanoutCoordinator::new(config.concurrency),
            query_timeout: config.timeout(),
        }
    }

    pub fn this_node(&self) -> &Node {
        &self.this_node
    }

    /// This node plus the latest published membership snapshot.
    pub fn live_nodes(&self) -> LiveNodes {
        LiveNodes::new(self.this_node.clone(), self.membership.borrow().clone())
    }

    async fn index_mapping(&self, index_name: &str) -> Result<IndexMapping> {
        validate_index_name(index_name)?;
        self.directory
            .get_index_mapping(index_name)
            .await?
            .ok_or_else(|| Error::IndexDoesNotExist(index_name.to_string()))
    }

    fn targets(&self, index_mapping: &IndexMapping, policy: RoutingPolicy) -> Result<Vec<ShardTarget>> {
        let live = self.live_nodes();
        let table = ShardTable::build(index_mapping, policy, &live)?;
        FanoutCoordinator::targets_for(index_mapping, &table, &self.this_node.key())
    }

    fn keyed<'m>(
        &self,
        index_mapping: &'m IndexMapping,
        unique_id: &str,
        policy: RoutingPolicy,
    ) -> Result<RequestRouter<'m>> {
        validate_key(unique_id)?;
        let live = self.live_nodes();
        let strategy = SelectorStrategy::new(policy, live.clone());
        RequestRouter::new(index_mapping, unique_id, &strategy, &live)
    }

    /// Shard of `unique_id` in an index, checked against its mapping.
    async fn local_shard(&self, index_name: &str, unique_id: &str) -> Result<u32> {
        validate_key(unique_id)?;
        let mapping = self.index_mapping(index_name).await?;
        Ok(shard_for_key(unique_id, mapping.number_of_shards))
    }

    async fn checked_shard(&self, index_name: &str, shard: u32) -> Result<()> {
        let mapping = self.index_mapping(index_name).await?;
        if mapping.shard(shard).is_none() {
            return Err(Error::ShardDoesNotExist {
                index: index_name.to_string(),
                shard,
            });
        }
        Ok(())
    }

    // === Keyed operations ===

    pub async fn store(&self, request: StoreRequest) -> Result<StoreResponse> {
        let mapping = self.index_mapping(&request.index_name).await?;
        let router = self.keyed(&mapping, &request.unique_id, RoutingPolicy::MasterOnly)?;
        router.send(&operations::Store(&self.backends), request).await
    }

    pub async fn delete(&self, request: DeleteRequest) -> Result<DeleteResponse> {
        let mapping = self.index_mapping(&request.index_name).await?;
        let router = self.keyed(&mapping, &request.unique_id, RoutingPolicy::MasterOnly)?;
        router.send(&operations::Delete(&self.backends), request).await
    }

    pub async fn fetch(&self, request: FetchRequest) -> Result<FetchResponse> {
        let mapping = self.index_mapping(&request.index_name).await?;
        let policy = routing_policy(request.routing_policy)?;
        let router = self.keyed(&mapping, &request.unique_id, policy)?;
        router.send(&operations::Fetch(&self.backends), request).await
    }

    // === Index-wide operations ===

    pub async fn query(&self, request: QueryRequest) -> Result<QueryResponse> {
        tokio::time::timeout(self.query_timeout, self.run_query(request)).await?
    }

    async fn run_query(&self, mut request: QueryRequest) -> Result<QueryResponse> {
        let mapping = self.index_mapping(&request.index_name).await?;
        let policy = routing_policy(request.routing_policy)?;
        let targets = self.targets(&mapping, policy)?;

        for stat_request in &mut request.stat_requests {
            stat_request.shard_facets = normalize_shard_facets(stat_request.shard_facets);
        }
        for count_request in &mut request.count_requests {
            count_request.shard_facets = normalize_shard_facets(count_request.shard_facets);
        }

        // Any shard may hold the whole page
        let shard_request = QueryRequest {
            start: 0,
            amount: request.start.saturating_add(request.amount),
            ..request.clone()
        };

        let responses = self
            .fanout
            .send(
                &mapping.index_name,
                &targets,
                &operations::Query(&self.backends),
                |_| shard_request.clone(),
            )
            .await?;
        validate_shard_responses(&mapping.index_name, mapping.number_of_shards, &responses)?;

        let total_hits: u64 = responses.iter().map(|r| r.total_hits).sum();

        let stat_groups = request
            .stat_requests
            .iter()
            .enumerate()
            .map(|(i, stat_request)| {
                let groups: Vec<ShardStatGroup> = responses
                    .iter()
                    .filter_map(|r| r.stat_groups.get(i).cloned())
                    .collect();
                StatAggregator::new(stat_request).combine(&groups)
            })
            .collect::<Result<Vec<_>>>()?;

        let facet_groups = request
            .count_requests
            .iter()
            .enumerate()
            .map(|(i, count_request)| {
                let groups: Vec<ShardFacetGroup> = responses
                    .iter()
                    .filter_map(|r| r.facet_groups.get(i).cloned())
                    .collect();
                FacetCountCombiner::new(count_request).combine(&groups)
            })
            .collect();

        let comparator = ResultComparator::new(&request.sort);
        let results = ResultMerger::merge(
            responses.into_iter().map(|r| r.results).collect(),
            &comparator,
            request.start as usize,
            request.amount as usize,
        );

        debug!(
            "Query on {} matched {} hits over {} shards",
            mapping.index_name, total_hits, mapping.number_of_shards
        );
        Ok(QueryResponse {
            total_hits,
            results,
            stat_groups,
            facet_groups,
        })
    }

    pub async fn get_number_of_docs(&self, request: GetNumberOfDocsRequest) -> Result<GetNumberOfDocsResponse> {
        let mapping = self.index_mapping(&request.index_name).await?;
        let targets = self.targets(&mapping, RoutingPolicy::MasterOnly)?;
        let shard_counts = self
            .fanout
            .send(
                &mapping.index_name,
                &targets,
                &operations::CountDocs(&self.backends),
                |_| (),
            )
            .await?;
        Ok(GetNumberOfDocsResponse {
            number_of_docs: shard_counts.iter().map(|c| c.number_of_docs).sum(),
            shard_counts,
        })
    }

    pub async fn optimize(&self, request: OptimizeRequest) -> Result<OptimizeResponse> {
        let mapping = self.index_mapping(&request.index_name).await?;
        let targets = self.targets(&mapping, RoutingPolicy::MasterOnly)?;
        let done = self
            .fanout
            .send(
                &mapping.index_name,
                &targets,
                &operations::Optimize(&self.backends),
                |_| (),
            )
            .await?;
        info!("Optimized {} shards of {}", done.len(), mapping.index_name);
        Ok(OptimizeResponse {
            shards_optimized: done.len() as u32,
        })
    }

    pub async fn clear(&self, request: ClearRequest) -> Result<ClearResponse> {
        let mapping = self.index_mapping(&request.index_name).await?;
        let targets = self.targets(&mapping, RoutingPolicy::MasterOnly)?;
        let done = self
            .fanout
            .send(
                &mapping.index_name,
                &targets,
                &operations::Clear(&self.backends),
                |_| (),
            )
            .await?;
        info!("Cleared {} shards of {}", done.len(), mapping.index_name);
        Ok(ClearResponse {
            shards_cleared: done.len() as u32,
        })
    }

    pub async fn get_field_names(&self, request: GetFieldNamesRequest) -> Result<GetFieldNamesResponse> {
        let mapping = self.index_mapping(&request.index_name).await?;
        let policy = routing_policy(request.routing_policy)?;
        let targets = self.targets(&mapping, policy)?;
        let per_shard = self
            .fanout
            .send(
                &mapping.index_name,
                &targets,
                &operations::FieldNames(&self.backends),
                |_| (),
            )
            .await?;
        let field_names: BTreeSet<String> = per_shard.into_iter().flatten().collect();
        Ok(GetFieldNamesResponse {
            field_names: field_names.into_iter().collect(),
        })
    }

    pub async fn get_terms(&self, request: GetTermsRequest) -> Result<GetTermsResponse> {
        let mapping = self.index_mapping(&request.index_name).await?;
        let policy = routing_policy(request.routing_policy)?;
        let targets = self.targets(&mapping, policy)?;
        let per_shard = self
            .fanout
            .send(
                &mapping.index_name,
                &targets,
                &operations::Terms(&self.backends),
                |_| request.clone(),
            )
            .await?;

        let mut merged: BTreeMap<String, Term> = BTreeMap::new();
        for term in per_shard.into_iter().flatten() {
            let entry = merged.entry(term.value.clone()).or_insert_with(|| Term {
                value: term.value.clone(),
                ..Default::default()
            });
            entry.doc_freq += term.doc_freq;
            entry.term_freq += term.term_freq;
        }

        let mut terms: Vec<Term> = merged
            .into_values()
            .filter(|t| t.doc_freq >= request.min_doc_freq)
            .collect();
        if request.amount > 0 {
            terms.truncate(request.amount as usize);
        }
        Ok(GetTermsResponse { terms })
    }

    // === Internal operations ===

    pub async fn internal_store(&self, request: StoreRequest) -> Result<StoreResponse> {
        let shard = self.local_shard(&request.index_name, &request.unique_id).await?;
        self.backends.engine.store(shard, request).await
    }

    pub async fn internal_delete(&self, request: DeleteRequest) -> Result<DeleteResponse> {
        let shard = self.local_shard(&request.index_name, &request.unique_id).await?;
        self.backends.engine.delete(shard, request).await
    }

    pub async fn internal_fetch(&self, request: FetchRequest) -> Result<FetchResponse> {
        let shard = self.local_shard(&request.index_name, &request.unique_id).await?;
        self.backends.engine.fetch(shard, request).await
    }

    pub async fn internal_query(&self, request: InternalQueryRequest) -> Result<ShardQueryResponse> {
        let shard = request.shard_number;
        let query = request
            .request
            .ok_or_else(|| Error::InvalidArgument("internal query without a query".into()))?;
        self.checked_shard(&query.index_name, shard).await?;
        self.backends.engine.query(shard, &query).await
    }

    pub async fn internal_optimize(&self, request: ShardRequest) -> Result<OptimizeResponse> {
        self.checked_shard(&request.index_name, request.shard_number)
            .await?;
        self.backends
            .engine
            .optimize(&request.index_name, request.shard_number)
            .await?;
        Ok(OptimizeResponse { shards_optimized: 1 })
    }

    pub async fn internal_clear(&self, request: ShardRequest) -> Result<ClearResponse> {
        self.checked_shard(&request.index_name, request.shard_number)
            .await?;
        self.backends
            .engine
            .clear(&request.index_name, request.shard_number)
            .await?;
        Ok(ClearResponse { shards_cleared: 1 })
    }

    pub async fn internal_get_number_of_docs(&self, request: ShardRequest) -> Result<ShardCountResponse> {
        self.checked_shard(&request.index_name, request.shard_number)
            .await?;
        Ok(ShardCountResponse {
            shard_number: request.shard_number,
            number_of_docs: self
                .backends
                .engine
                .number_of_docs(&request.index_name, request.shard_number)
                .await?,
        })
    }

    pub async fn internal_get_field_names(&self, request: ShardRequest) -> Result<GetFieldNamesResponse> {
        self.checked_shard(&request.index_name, request.shard_number)
            .await?;
        Ok(GetFieldNamesResponse {
            field_names: self
                .backends
                .engine
                .field_names(&request.index_name, request.shard_number)
                .await?,
        })
    }

    pub async fn internal_get_terms(&self, request: InternalGetTermsRequest) -> Result<GetTermsResponse> {
        let shard = request.shard_number;
        let terms_request = request
            .request
            .ok_or_else(|| Error::InvalidArgument("internal terms request without a request".into()))?;
        self.checked_shard(&terms_request.index_name, shard).await?;
        Ok(GetTermsResponse {
            terms: self.backends.engine.terms(shard, &terms_request).await?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::PoolConfig;
    use crate::connection::PoolManager;
    use crate::coordinator::metadata::MemoryDirectory;
    use crate::search::MemoryShardEngine;
    use serde_json::json;

    async fn single_node(shards: u32) -> IndexManager {
        let directory = Arc::new(MemoryDirectory::new());
        let this = Node::new("127.0.0.1", 7001, "test");
        directory.register_node(this.clone()).await.unwrap();
        directory
            .put_index_mapping(IndexMapping::spread("books", shards, &[this.key()], 0).unwrap())
            .await
            .unwrap();

        let (_, membership) = watch::channel(Arc::new(MembershipSnapshot::default()));
        IndexManager::new(
            directory,
            Arc::new(MemoryShardEngine::new()),
            InternalClient::new(Arc::new(PoolManager::new(PoolConfig::default()))),
            this,
            membership,
            &QueryConfig::default(),
        )
    }

    async fn store(manager: &IndexManager, id: &str, doc: serde_json::Value) {
        manager
            .store(StoreRequest {
                index_name: "books".into(),
                unique_id: id.into(),
                document: serde_json::to_vec(&doc).unwrap(),
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_keyed_operations_on_local_shards() {
        let manager = single_node(3).await;
        store(&manager, "b1", json!({"title": "Dune"})).await;

        let fetched = manager
            .fetch(FetchRequest {
                index_name: "books".into(),
                unique_id: "b1".into(),
                routing_policy: RoutingPolicy::MasterPreferred as i32,
            })
            .await
            .unwrap();
        assert!(fetched.found);

        let deleted = manager
            .delete(DeleteRequest {
                index_name: "books".into(),
                unique_id: "b1".into(),
            })
            .await
            .unwrap();
        assert!(deleted.deleted);
    }

    #[tokio::test]
    async fn test_unknown_index() {
        let manager = single_node(1).await;
        let err = manager
            .query(QueryRequest {
                index_name: "films".into(),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::IndexDoesNotExist(_)));
    }

    #[tokio::test]
    async fn test_query_over_all_shards() {
        let manager = single_node(3).await;
        for i in 0..30 {
            store(
                &manager,
                &format!("doc-{}", i),
                json!({"rank": i, "parity": if i % 2 == 0 { "even" } else { "odd" }}),
            )
            .await;
        }

        let response = manager
            .query(QueryRequest {
                index_name: "books".into(),
                query: "*".into(),
                start: 10,
                amount: 5,
                sort: vec![FieldSort {
                    field: "rank".into(),
                    direction: Direction::Ascending as i32,
                    missing_last: false,
                }],
                stat_requests: vec![StatRequest {
                    numeric_field: "rank".into(),
                    facet_field: "parity".into(),
                    shard_facets: 0,
                    max_facets: 10,
                    percentiles: vec![0.5],
                    precision: 0.01,
                }],
                count_requests: vec![CountRequest {
                    facet_field: "parity".into(),
                    max_facets: 10,
                    shard_facets: -1,
                }],
                ..Default::default()
            })
            .await
            .unwrap();

        assert_eq!(response.total_hits, 30);
        let ids: Vec<String> = response.results.iter().map(|r| r.unique_id.clone()).collect();
        let expected: Vec<String> = (10..15).map(|i| format!("doc-{}", i)).collect();
        assert_eq!(ids, expected);

        let stats = &response.stat_groups[0];
        assert_eq!(stats.global_stat.as_ref().unwrap().sum, 435.0);
        assert!(stats.facet_stats.iter().all(|f| !f.has_error));
        // Ranks 0..30 spread over three shards
        let global = stats.global_stat.as_ref().unwrap();
        let median = global.percentiles[0].value;
        assert!((13.5..=16.0).contains(&median), "median {}", median);
        assert!(global.stat_sketch.is_empty());

        let counts: Vec<(String, u64)> = response.facet_groups[0]
            .facet_counts
            .iter()
            .map(|f| (f.label.clone(), f.count))
            .collect();
        assert_eq!(counts, vec![("even".into(), 15), ("odd".into(), 15)]);
    }

    #[tokio::test]
    async fn test_index_wide_operations() {
        let manager = single_node(2).await;
        store(&manager, "a", json!({"title": "rust rust", "year": 2015})).await;
        store(&manager, "b", json!({"title": "rust go"})).await;
        store(&manager, "c", json!({"author": "x"})).await;

        let count = manager
            .get_number_of_docs(GetNumberOfDocsRequest {
                index_name: "books".into(),
            })
            .await
            .unwrap();
        assert_eq!(count.number_of_docs, 3);
        assert_eq!(count.shard_counts.len(), 2);

        let fields = manager
            .get_field_names(GetFieldNamesRequest {
                index_name: "books".into(),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(fields.field_names, vec!["author", "title", "year"]);

        let terms = manager
            .get_terms(GetTermsRequest {
                index_name: "books".into(),
                field: "title".into(),
                min_doc_freq: 2,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(terms.terms.len(), 1);
        assert_eq!(terms.terms[0].value, "rust");
        assert_eq!(terms.terms[0].doc_freq, 2);
        assert_eq!(terms.terms[0].term_freq, 3);

        let optimized = manager
            .optimize(OptimizeRequest {
                index_name: "books".into(),
            })
            .await
            .unwrap();
        assert_eq!(optimized.shards_optimized, 2);

        let cleared = manager
            .clear(ClearRequest {
                index_name: "books".into(),
            })
            .await
            .unwrap();
        assert_eq!(cleared.shards_cleared, 2);
        let count = manager
            .get_number_of_docs(GetNumberOfDocsRequest {
                index_name: "books".into(),
            })
            .await
            .unwrap();
        assert_eq!(count.number_of_docs, 0);
    }

    #[tokio::test]
    async fn test_internal_requests_check_shard() {
        let manager = single_node(2).await;
        let err = manager
            .internal_optimize(ShardRequest {
                index_name: "books".into(),
                shard_number: 5,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ShardDoesNotExist { shard: 5, .. }));

        let err = manager
            .internal_query(InternalQueryRequest {
                shard_number: 0,
                request: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }
}
