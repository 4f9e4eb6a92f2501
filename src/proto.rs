//! Wire messages for the `meshsearch.SearchNode` service
//!
//! Messages are prost structs written by hand; `build.rs` generates the
//! client and server plumbing around them.

#![allow(clippy::derive_partial_eq_without_eq)]

use serde::{Deserialize, Serialize};

include!(concat!(env!("OUT_DIR"), "/meshsearch.SearchNode.rs"));

/// Which role to prefer when several live nodes can serve a shard.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration, Serialize, Deserialize,
)]
#[repr(i32)]
pub enum RoutingPolicy {
    MasterOnly = 0,
    MasterPreferred = 1,
    ReplicaPreferred = 2,
    ReplicaOnly = 3,
}

impl std::fmt::Display for RoutingPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RoutingPolicy::MasterOnly => write!(f, "master-only"),
            RoutingPolicy::MasterPreferred => write!(f, "master-preferred"),
            RoutingPolicy::ReplicaPreferred => write!(f, "replica-preferred"),
            RoutingPolicy::ReplicaOnly => write!(f, "replica-only"),
        }
    }
}

impl std::str::FromStr for RoutingPolicy {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s.to_ascii_lowercase().replace('_', "-").as_str() {
            "master-only" => Ok(RoutingPolicy::MasterOnly),
            "master-preferred" => Ok(RoutingPolicy::MasterPreferred),
            "replica-preferred" => Ok(RoutingPolicy::ReplicaPreferred),
            "replica-only" => Ok(RoutingPolicy::ReplicaOnly),
            other => Err(crate::Error::InvalidArgument(format!(
                "unknown routing policy: {}",
                other
            ))),
        }
    }
}

/// Decode a routing policy carried as a raw enumeration value.
pub fn routing_policy(value: i32) -> crate::Result<RoutingPolicy> {
    RoutingPolicy::try_from(value)
        .map_err(|_| crate::Error::InvalidArgument(format!("unknown routing policy value {}", value)))
}

#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration, Serialize, Deserialize,
)]
#[repr(i32)]
pub enum Direction {
    Ascending = 0,
    Descending = 1,
}

// === Sorting & results ===

#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
pub struct FieldSort {
    /// Field name, or `score` for relevance.
    #[prost(string, tag = "1")]
    pub field: String,
    #[prost(enumeration = "Direction", tag = "2")]
    pub direction: i32,
    #[prost(bool, tag = "3")]
    pub missing_last: bool,
}

#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
pub struct SortValue {
    #[prost(bool, tag = "1")]
    pub exists: bool,
    #[prost(double, optional, tag = "2")]
    pub number: Option<f64>,
    #[prost(string, optional, tag = "3")]
    pub text: Option<String>,
}

impl SortValue {
    pub fn number(value: f64) -> Self {
        Self {
            exists: true,
            number: Some(value),
            text: None,
        }
    }

    pub fn text(value: impl Into<String>) -> Self {
        Self {
            exists: true,
            number: None,
            text: Some(value.into()),
        }
    }

    pub fn missing() -> Self {
        Self::default()
    }
}

#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
pub struct ScoredResult {
    #[prost(string, tag = "1")]
    pub unique_id: String,
    #[prost(string, tag = "2")]
    pub index_name: String,
    #[prost(double, tag = "3")]
    pub score: f64,
    #[prost(message, repeated, tag = "4")]
    pub sort_values: Vec<SortValue>,
    #[prost(uint32, tag = "5")]
    pub shard: u32,
    /// Stable per-shard ordinal used as the final tie-break.
    #[prost(uint32, tag = "6")]
    pub result_index: u32,
    #[prost(bytes = "vec", tag = "7")]
    pub document: Vec<u8>,
}

// === Statistics & facets ===

#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
pub struct StatRequest {
    #[prost(string, tag = "1")]
    pub numeric_field: String,
    /// Empty for a global-only statistic.
    #[prost(string, tag = "2")]
    pub facet_field: String,
    /// Facets each shard returns; -1 returns all of them.
    #[prost(int32, tag = "3")]
    pub shard_facets: i32,
    #[prost(int32, tag = "4")]
    pub max_facets: i32,
    /// Quantiles in `[0, 1]` to estimate; others are ignored.
    #[prost(double, repeated, tag = "5")]
    pub percentiles: Vec<f64>,
    /// Relative accuracy of the percentile sketches; 0 disables percentiles.
    #[prost(double, tag = "6")]
    pub precision: f64,
}

#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
pub struct Percentile {
    #[prost(double, tag = "1")]
    pub point: f64,
    #[prost(double, tag = "2")]
    pub value: f64,
}

#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
pub struct FacetStat {
    #[prost(string, tag = "1")]
    pub label: String,
    #[prost(double, tag = "2")]
    pub sum: f64,
    #[prost(double, tag = "3")]
    pub min: f64,
    #[prost(double, tag = "4")]
    pub max: f64,
    #[prost(uint64, tag = "5")]
    pub doc_count: u64,
    #[prost(uint64, tag = "6")]
    pub all_doc_count: u64,
    #[prost(uint64, tag = "7")]
    pub value_count: u64,
    /// Encoded quantile sketch of the values, only between nodes.
    #[prost(bytes = "vec", tag = "8")]
    #[serde(skip)]
    pub stat_sketch: Vec<u8>,
    #[prost(message, repeated, tag = "9")]
    pub percentiles: Vec<Percentile>,
}

#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
pub struct ShardStatGroup {
    #[prost(string, tag = "1")]
    pub numeric_field: String,
    #[prost(string, tag = "2")]
    pub facet_field: String,
    #[prost(message, optional, tag = "3")]
    pub global_stat: Option<FacetStat>,
    /// Top facets of this shard, sum descending.
    #[prost(message, repeated, tag = "4")]
    pub facet_stats: Vec<FacetStat>,
}

#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
pub struct CombinedFacetStat {
    #[prost(message, optional, tag = "1")]
    pub stat: Option<FacetStat>,
    #[prost(bool, tag = "2")]
    pub has_error: bool,
    #[prost(double, tag = "3")]
    pub max_sum_error: f64,
}

#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
pub struct CombinedStatGroup {
    #[prost(string, tag = "1")]
    pub numeric_field: String,
    #[prost(string, tag = "2")]
    pub facet_field: String,
    #[prost(message, optional, tag = "3")]
    pub global_stat: Option<FacetStat>,
    #[prost(message, repeated, tag = "4")]
    pub facet_stats: Vec<CombinedFacetStat>,
}

#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
pub struct CountRequest {
    #[prost(string, tag = "1")]
    pub facet_field: String,
    #[prost(int32, tag = "2")]
    pub max_facets: i32,
    #[prost(int32, tag = "3")]
    pub shard_facets: i32,
}

#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
pub struct FacetCount {
    #[prost(string, tag = "1")]
    pub label: String,
    #[prost(uint64, tag = "2")]
    pub count: u64,
    #[prost(uint64, tag = "3")]
    pub max_error: u64,
}

#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
pub struct ShardFacetGroup {
    #[prost(string, tag = "1")]
    pub facet_field: String,
    /// Count descending.
    #[prost(message, repeated, tag = "2")]
    pub facet_counts: Vec<FacetCount>,
}

#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
pub struct FacetGroup {
    #[prost(string, tag = "1")]
    pub facet_field: String,
    #[prost(message, repeated, tag = "2")]
    pub facet_counts: Vec<FacetCount>,
    #[prost(bool, tag = "3")]
    pub possible_missing: bool,
    #[prost(uint64, tag = "4")]
    pub max_value_possible_missing: u64,
}

// === Query ===

#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
pub struct QueryRequest {
    #[prost(string, tag = "1")]
    pub index_name: String,
    #[prost(string, tag = "2")]
    pub query: String,
    #[prost(uint32, tag = "3")]
    pub start: u32,
    #[prost(uint32, tag = "4")]
    pub amount: u32,
    #[prost(message, repeated, tag = "5")]
    pub sort: Vec<FieldSort>,
    #[prost(message, repeated, tag = "6")]
    pub stat_requests: Vec<StatRequest>,
    #[prost(message, repeated, tag = "7")]
    pub count_requests: Vec<CountRequest>,
    #[prost(enumeration = "RoutingPolicy", tag = "8")]
    pub routing_policy: i32,
    #[prost(bool, tag = "9")]
    pub fetch_documents: bool,
}

#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
pub struct QueryResponse {
    #[prost(uint64, tag = "1")]
    pub total_hits: u64,
    #[prost(message, repeated, tag = "2")]
    pub results: Vec<ScoredResult>,
    #[prost(message, repeated, tag = "3")]
    pub stat_groups: Vec<CombinedStatGroup>,
    #[prost(message, repeated, tag = "4")]
    pub facet_groups: Vec<FacetGroup>,
}

#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
pub struct InternalQueryRequest {
    #[prost(uint32, tag = "1")]
    pub shard_number: u32,
    #[prost(message, optional, tag = "2")]
    pub request: Option<QueryRequest>,
}

#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
pub struct ShardQueryResponse {
    #[prost(string, tag = "1")]
    pub index_name: String,
    #[prost(uint32, tag = "2")]
    pub shard_number: u32,
    #[prost(uint64, tag = "3")]
    pub total_hits: u64,
    #[prost(message, repeated, tag = "4")]
    pub results: Vec<ScoredResult>,
    #[prost(message, repeated, tag = "5")]
    pub stat_groups: Vec<ShardStatGroup>,
    #[prost(message, repeated, tag = "6")]
    pub facet_groups: Vec<ShardFacetGroup>,
}

// === Keyed document operations ===

#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
pub struct StoreRequest {
    #[prost(string, tag = "1")]
    pub index_name: String,
    #[prost(string, tag = "2")]
    pub unique_id: String,
    /// JSON document body.
    #[prost(bytes = "vec", tag = "3")]
    pub document: Vec<u8>,
}

#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
pub struct StoreResponse {
    #[prost(bool, tag = "1")]
    pub replaced: bool,
}

#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
pub struct DeleteRequest {
    #[prost(string, tag = "1")]
    pub index_name: String,
    #[prost(string, tag = "2")]
    pub unique_id: String,
}

#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
pub struct DeleteResponse {
    #[prost(bool, tag = "1")]
    pub deleted: bool,
}

#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
pub struct FetchRequest {
    #[prost(string, tag = "1")]
    pub index_name: String,
    #[prost(string, tag = "2")]
    pub unique_id: String,
    #[prost(enumeration = "RoutingPolicy", tag = "3")]
    pub routing_policy: i32,
}

#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
pub struct FetchResponse {
    #[prost(bool, tag = "1")]
    pub found: bool,
    #[prost(bytes = "vec", tag = "2")]
    pub document: Vec<u8>,
}

// === Index-wide operations ===

/// Internal request addressed to one shard of an index.
#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
pub struct ShardRequest {
    #[prost(string, tag = "1")]
    pub index_name: String,
    #[prost(uint32, tag = "2")]
    pub shard_number: u32,
}

#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
pub struct OptimizeRequest {
    #[prost(string, tag = "1")]
    pub index_name: String,
}

#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
pub struct OptimizeResponse {
    #[prost(uint32, tag = "1")]
    pub shards_optimized: u32,
}

#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
pub struct ClearRequest {
    #[prost(string, tag = "1")]
    pub index_name: String,
}

#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
pub struct ClearResponse {
    #[prost(uint32, tag = "1")]
    pub shards_cleared: u32,
}

#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
pub struct GetNumberOfDocsRequest {
    #[prost(string, tag = "1")]
    pub index_name: String,
}

#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
pub struct ShardCountResponse {
    #[prost(uint32, tag = "1")]
    pub shard_number: u32,
    #[prost(uint64, tag = "2")]
    pub number_of_docs: u64,
}

#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
pub struct GetNumberOfDocsResponse {
    #[prost(uint64, tag = "1")]
    pub number_of_docs: u64,
    #[prost(message, repeated, tag = "2")]
    pub shard_counts: Vec<ShardCountResponse>,
}

#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
pub struct GetFieldNamesRequest {
    #[prost(string, tag = "1")]
    pub index_name: String,
    #[prost(enumeration = "RoutingPolicy", tag = "2")]
    pub routing_policy: i32,
}

#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
pub struct GetFieldNamesResponse {
    #[prost(string, repeated, tag = "1")]
    pub field_names: Vec<String>,
}

#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
pub struct GetTermsRequest {
    #[prost(string, tag = "1")]
    pub index_name: String,
    #[prost(string, tag = "2")]
    pub field: String,
    /// Maximum terms returned; 0 returns all.
    #[prost(uint32, tag = "3")]
    pub amount: u32,
    #[prost(uint64, tag = "4")]
    pub min_doc_freq: u64,
    #[prost(enumeration = "RoutingPolicy", tag = "5")]
    pub routing_policy: i32,
}

#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
pub struct InternalGetTermsRequest {
    #[prost(uint32, tag = "1")]
    pub shard_number: u32,
    #[prost(message, optional, tag = "2")]
    pub request: Option<GetTermsRequest>,
}

#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
pub struct Term {
    #[prost(string, tag = "1")]
    pub value: String,
    #[prost(uint64, tag = "2")]
    pub doc_freq: u64,
    #[prost(uint64, tag = "3")]
    pub term_freq: u64,
}

#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
pub struct GetTermsResponse {
    #[prost(message, repeated, tag = "1")]
    pub terms: Vec<Term>,
}
