//! Search-side building blocks shared by shards and the node that merges them

pub mod engine;
pub mod facets;
pub mod merge;
pub mod stats;

pub use engine::{MemoryShardEngine, ShardEngine};
pub use facets::FacetCountCombiner;
pub use merge::{validate_shard_responses, ResultComparator, ResultMerger, SCORE_FIELD};
pub use stats::StatAggregator;
