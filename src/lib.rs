//! # meshsearch
//!
//! The coordination core of a sharded, replicated search cluster:
//! - Deterministic shard routing of keyed requests
//! - Replica selection under master/replica routing policies
//! - Pooled gRPC connections between nodes
//! - Bounded per-shard fan-out with globally ordered merging
//! - Cross-shard facet statistics and counts with error bounds
//! - Heartbeat-based membership tracking
//!
//! ## Architecture
//!
//! ```text
//!            client
//!              │ gRPC (external)
//!        ┌─────▼──────────────┐        ┌────────────────────┐
//!        │ Node A             │ gRPC   │ Node B             │
//!        │  IndexManager      ├───────►│  IndexManager      │
//!        │  RequestRouter     │internal│  ShardEngine       │
//!        │  FanoutCoordinator │        │   (shards 1, 2)    │
//!        │  ShardEngine       │◄───────┤                    │
//!        │   (shards 0, 2)    │        │                    │
//!        └─────────┬──────────┘        └─────────┬──────────┘
//!                  │ heartbeats, index mappings  │
//!                  └──────────► Directory ◄──────┘
//! ```
//!
//! ## Usage
//!
//! ### Start two nodes sharing a directory
//! ```bash
//! meshsearch-node serve --port 32191,32192 --directory ./dir \
//!   --create-index books --shards 4 --replicas 1
//! meshsearch-node status --directory ./dir
//! ```
//!
//! ### Use the CLI
//! ```bash
//! meshsearch store books b1 '{"title": "Dune", "year": 1965}'
//! meshsearch query books 'title:Dune' --amount 10 --sort year:desc
//! meshsearch count books
//! ```

#![allow(clippy::result_large_err)]

pub mod common;
pub mod connection;
pub mod coordinator;
pub mod proto;
pub mod search;

// Re-export commonly used types
pub use common::{Config, Error, Result};
pub use coordinator::{IndexManager, NodeServer};
pub use search::{MemoryShardEngine, ShardEngine};

/// Current version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Build info
pub const BUILD_INFO: &str = concat!(env!("CARGO_PKG_VERSION"), " (", env!("CARGO_PKG_NAME"), ")");
