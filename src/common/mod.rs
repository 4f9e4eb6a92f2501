//! Common utilities and types shared across meshsearch

pub mod config;
pub mod error;
pub mod hash;
pub mod utils;

pub use config::{Config, DirectoryConfig, MembershipConfig, NodeConfig, PoolConfig, QueryConfig};
pub use error::{Error, Result, ERROR_METADATA_KEY};
pub use hash::{shard_for_key, string_hash};
pub use utils::{system_clock, timestamp_now_millis, validate_index_name, validate_key, Clock};
