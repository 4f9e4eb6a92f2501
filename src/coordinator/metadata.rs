//! Cluster directory
//!
//! Stores:
//! - Node registry (address:port → heartbeat, version)
//! - Index mappings (index → shard masters and replicas)
//!
//! [`NodeDirectory`] is the seam the rest of the node talks to;
//! [`MemoryDirectory`] serves tests and single-process clusters, and
//! [`MetadataStore`] persists the same records in RocksDB.

use crate::common::{timestamp_now_millis, Clock, Error, Result};
use async_trait::async_trait;
use rocksdb::{Options, DB};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

const CF_NODES: &str = "nodes";
const CF_INDEXES: &str = "indexes";

/// Node identity: `server_address:rpc_port`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeKey {
    pub server_address: String,
    pub rpc_port: u16,
}

impl NodeKey {
    pub fn new(server_address: impl Into<String>, rpc_port: u16) -> Self {
        Self {
            server_address: server_address.into(),
            rpc_port,
        }
    }

    /// `http://` URI for a tonic endpoint
    pub fn uri(&self) -> String {
        format!("http://{}:{}", self.server_address, self.rpc_port)
    }
}

impl fmt::Display for NodeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.server_address, self.rpc_port)
    }
}

impl std::str::FromStr for NodeKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (address, port) = s
            .rsplit_once(':')
            .ok_or_else(|| Error::InvalidArgument(format!("expected address:port, got {}", s)))?;
        let port = port
            .parse()
            .map_err(|_| Error::InvalidArgument(format!("invalid port in {}", s)))?;
        Ok(NodeKey::new(address, port))
    }
}

/// Registered node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub server_address: String,
    pub rpc_port: u16,
    /// Last heartbeat, unix millis
    pub heartbeat: u64,
    pub version: String,
}

impl Node {
    pub fn new(server_address: impl Into<String>, rpc_port: u16, version: impl Into<String>) -> Self {
        Self {
            server_address: server_address.into(),
            rpc_port,
            heartbeat: 0,
            version: version.into(),
        }
    }

    pub fn key(&self) -> NodeKey {
        NodeKey::new(self.server_address.clone(), self.rpc_port)
    }

    pub fn is(&self, key: &NodeKey) -> bool {
        self.rpc_port == key.rpc_port && self.server_address == key.server_address
    }
}

/// Placement of one shard
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardMapping {
    pub shard_number: u32,
    pub master: NodeKey,
    /// In preference order
    pub replicas: Vec<NodeKey>,
}

/// Placement of every shard of an index
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexMapping {
    pub index_name: String,
    pub number_of_shards: u32,
    pub shard_mappings: Vec<ShardMapping>,
}

impl IndexMapping {
    /// Spread shards round-robin over `nodes`, with up to `replicas` replicas
    /// taken from the following nodes.
    pub fn spread(
        index_name: impl Into<String>,
        number_of_shards: u32,
        nodes: &[NodeKey],
        replicas: usize,
    ) -> Result<Self> {
        if nodes.is_empty() {
            return Err(Error::InvalidArgument("cannot place shards on zero nodes".into()));
        }
        if number_of_shards == 0 {
            return Err(Error::InvalidArgument("number of shards must be positive".into()));
        }
        let replicas = replicas.min(nodes.len() - 1);
        let shard_mappings = (0..number_of_shards)
            .map(|shard| {
                let first = shard as usize % nodes.len();
                ShardMapping {
                    shard_number: shard,
                    master: nodes[first].clone(),
                    replicas: (1..=replicas)
                        .map(|offset| nodes[(first + offset) % nodes.len()].clone())
                        .collect(),
                }
            })
            .collect();
        Ok(Self {
            index_name: index_name.into(),
            number_of_shards,
            shard_mappings,
        })
    }

    pub fn shard(&self, shard_number: u32) -> Option<&ShardMapping> {
        self.shard_mappings
            .iter()
            .find(|m| m.shard_number == shard_number)
    }
}

/// Cluster directory seam
#[async_trait]
pub trait NodeDirectory: Send + Sync {
    async fn get_nodes(&self) -> Result<Vec<Node>>;

    /// Refresh the heartbeat of a registered node to now.
    async fn update_heartbeat(&self, server_address: &str, rpc_port: u16) -> Result<()>;

    async fn get_index_mapping(&self, index_name: &str) -> Result<Option<IndexMapping>>;

    async fn register_node(&self, node: Node) -> Result<()>;

    async fn remove_node(&self, key: &NodeKey) -> Result<()>;

    async fn put_index_mapping(&self, mapping: IndexMapping) -> Result<()>;

    async fn list_index_mappings(&self) -> Result<Vec<IndexMapping>>;
}

#[derive(Default)]
struct DirectoryState {
    nodes: BTreeMap<NodeKey, Node>,
    indexes: BTreeMap<String, IndexMapping>,
}

/// In-process directory
pub struct MemoryDirectory {
    state: Mutex<DirectoryState>,
    clock: Clock,
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self::with_clock(crate::common::system_clock())
    }

    pub fn with_clock(clock: Clock) -> Self {
        Self {
            state: Mutex::new(DirectoryState::default()),
            clock,
        }
    }

    fn state(&self) -> Result<MutexGuard<'_, DirectoryState>> {
        self.state
            .lock()
            .map_err(|_| Error::Internal("directory lock poisoned".into()))
    }

    /// Overwrite a node's heartbeat.
    pub fn set_heartbeat(&self, key: &NodeKey, heartbeat: u64) -> Result<()> {
        let mut state = self.state()?;
        let node = state
            .nodes
            .get_mut(key)
            .ok_or_else(|| Error::NotRegistered(key.to_string()))?;
        node.heartbeat = heartbeat;
        Ok(())
    }
}

impl Default for MemoryDirectory {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl NodeDirectory for MemoryDirectory {
    async fn get_nodes(&self) -> Result<Vec<Node>> {
        Ok(self.state()?.nodes.values().cloned().collect())
    }

    async fn update_heartbeat(&self, server_address: &str, rpc_port: u16) -> Result<()> {
        let now = (self.clock)();
        self.set_heartbeat(&NodeKey::new(server_address, rpc_port), now)
    }

    async fn get_index_mapping(&self, index_name: &str) -> Result<Option<IndexMapping>> {
        Ok(self.state()?.indexes.get(index_name).cloned())
    }

    async fn register_node(&self, mut node: Node) -> Result<()> {
        if node.heartbeat == 0 {
            node.heartbeat = (self.clock)();
        }
        self.state()?.nodes.insert(node.key(), node);
        Ok(())
    }

    async fn remove_node(&self, key: &NodeKey) -> Result<()> {
        self.state()?.nodes.remove(key);
        Ok(())
    }

    async fn put_index_mapping(&self, mapping: IndexMapping) -> Result<()> {
        self.state()?
            .indexes
            .insert(mapping.index_name.clone(), mapping);
        Ok(())
    }

    async fn list_index_mappings(&self) -> Result<Vec<IndexMapping>> {
        Ok(self.state()?.indexes.values().cloned().collect())
    }
}

/// Directory persisted in RocksDB
pub struct MetadataStore {
    db: DB,
}

impl MetadataStore {
    /// Open or create metadata store
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let db = DB::open_cf(&opts, path, vec![CF_NODES, CF_INDEXES])?;

        Ok(Self { db })
    }

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| Error::MetadataCorrupted(format!("missing column family {}", name)))
    }

    fn put<T: Serialize>(&self, cf: &str, key: &str, value: &T) -> Result<()> {
        let value = bincode::serialize(value)
            .map_err(|e| Error::Internal(format!("Serialize error: {}", e)))?;
        self.db.put_cf(self.cf(cf)?, key.as_bytes(), value)?;
        Ok(())
    }

    fn get<T: serde::de::DeserializeOwned>(&self, cf: &str, key: &str) -> Result<Option<T>> {
        match self.db.get_cf(self.cf(cf)?, key.as_bytes())? {
            Some(bytes) => {
                let value = bincode::deserialize(&bytes)
                    .map_err(|e| Error::MetadataCorrupted(e.to_string()))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    fn list<T: serde::de::DeserializeOwned>(&self, cf: &str) -> Result<Vec<T>> {
        let iter = self.db.iterator_cf(self.cf(cf)?, rocksdb::IteratorMode::Start);

        let mut values = Vec::new();
        for item in iter {
            let (_, value_bytes) = item?;
            let value = bincode::deserialize(&value_bytes)
                .map_err(|e| Error::MetadataCorrupted(e.to_string()))?;
            values.push(value);
        }

        Ok(values)
    }

    // === Node operations ===

    pub fn put_node(&self, node: &Node) -> Result<()> {
        self.put(CF_NODES, &node.key().to_string(), node)
    }

    pub fn get_node(&self, key: &NodeKey) -> Result<Option<Node>> {
        self.get(CF_NODES, &key.to_string())
    }

    pub fn delete_node(&self, key: &NodeKey) -> Result<()> {
        self.db.delete_cf(self.cf(CF_NODES)?, key.to_string().as_bytes())?;
        Ok(())
    }

    pub fn list_nodes(&self) -> Result<Vec<Node>> {
        self.list(CF_NODES)
    }

    /// Set a node's heartbeat; the node must be registered.
    pub fn touch_node(&self, key: &NodeKey, heartbeat: u64) -> Result<()> {
        let mut node = self
            .get_node(key)?
            .ok_or_else(|| Error::NotRegistered(key.to_string()))?;
        node.heartbeat = heartbeat;
        self.put_node(&node)
    }

    // === Index operations ===

    pub fn put_index(&self, mapping: &IndexMapping) -> Result<()> {
        self.put(CF_INDEXES, &mapping.index_name, mapping)
    }

    pub fn get_index(&self, index_name: &str) -> Result<Option<IndexMapping>> {
        self.get(CF_INDEXES, index_name)
    }

    pub fn list_indexes(&self) -> Result<Vec<IndexMapping>> {
        self.list(CF_INDEXES)
    }

    /// Flush to disk
    pub fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }
}

#[async_trait]
impl NodeDirectory for MetadataStore {
    async fn get_nodes(&self) -> Result<Vec<Node>> {
        self.list_nodes()
    }

    async fn update_heartbeat(&self, server_address: &str, rpc_port: u16) -> Result<()> {
        self.touch_node(&NodeKey::new(server_address, rpc_port), timestamp_now_millis())
    }

    async fn get_index_mapping(&self, index_name: &str) -> Result<Option<IndexMapping>> {
        self.get_index(index_name)
    }

    async fn register_node(&self, mut node: Node) -> Result<()> {
        if node.heartbeat == 0 {
            node.heartbeat = timestamp_now_millis();
        }
        self.put_node(&node)
    }

    async fn remove_node(&self, key: &NodeKey) -> Result<()> {
        self.delete_node(key)
    }

    async fn put_index_mapping(&self, mapping: IndexMapping) -> Result<()> {
        self.put_index(&mapping)
    }

    async fn list_index_mappings(&self) -> Result<Vec<IndexMapping>> {
        self.list_indexes()
    }
}
