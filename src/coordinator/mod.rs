//! Cluster coordination
//!
//! Everything a node needs to serve its share of the cluster:
//! - Directory of nodes and index mappings
//! - Live-node tracking from heartbeats
//! - Replica selection and shard routing
//! - Per-shard fan-out and the node's gRPC surface

pub mod fanout;
pub mod grpc;
pub mod manager;
pub mod membership;
pub mod metadata;
pub mod operations;
pub mod placement;
pub mod router;
pub mod server;

pub use fanout::FanoutCoordinator;
pub use manager::IndexManager;
pub use membership::{MembershipListener, MembershipMonitor, MembershipSnapshot};
pub use metadata::{IndexMapping, MemoryDirectory, MetadataStore, Node, NodeDirectory, NodeKey, ShardMapping};
pub use placement::{LiveNodes, ReplicaSelector};
pub use router::{RequestRouter, SelectorStrategy, ShardOperation, ShardStrategy, ShardTable};
pub use server::{NodeHandle, NodeServer};
