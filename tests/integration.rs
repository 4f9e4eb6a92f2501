//! Integration tests for the persisted directory

use meshsearch::common::Config;
use meshsearch::coordinator::{IndexMapping, MetadataStore, NodeDirectory, NodeKey, NodeServer};
use meshsearch::proto::*;
use meshsearch::MemoryShardEngine;
use std::sync::Arc;
use tempfile::TempDir;
use tokio::net::TcpListener;

#[tokio::test]
async fn test_directory_survives_reopen() {
    let dir = TempDir::new().unwrap();
    let k1 = NodeKey::new("10.0.0.1", 32191);
    let k2 = NodeKey::new("10.0.0.2", 32191);

    {
        let store = MetadataStore::open(dir.path()).unwrap();
        store
            .put_index_mapping(IndexMapping::spread("books", 4, &[k1.clone(), k2.clone()], 1).unwrap())
            .await
            .unwrap();
        store.flush().unwrap();
    }

    let store = MetadataStore::open(dir.path()).unwrap();
    let mapping = store.get_index_mapping("books").await.unwrap().unwrap();
    assert_eq!(mapping.number_of_shards, 4);
    assert_eq!(mapping.shard(0).unwrap().master, k1);
    assert_eq!(mapping.shard(0).unwrap().replicas, vec![k2.clone()]);
    assert_eq!(mapping.shard(3).unwrap().master, k2);
    assert!(store.get_index_mapping("films").await.unwrap().is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_node_registers_and_leaves_persisted_directory() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(MetadataStore::open(dir.path()).unwrap());

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let key = NodeKey::new("127.0.0.1", listener.local_addr().unwrap().port());
    store
        .put_index_mapping(IndexMapping::spread("books", 2, &[key.clone()], 0).unwrap())
        .await
        .unwrap();

    let mut config = Config::default();
    config.node.server_address = "127.0.0.1".into();
    config.membership.interval_ms = 50;
    let node = NodeServer::new(config, store.clone(), Arc::new(MemoryShardEngine::new()))
        .start(listener)
        .await
        .unwrap();

    let registered = store.get_node(&key).unwrap().unwrap();
    assert!(registered.heartbeat > 0);

    node.manager()
        .store(StoreRequest {
            index_name: "books".into(),
            unique_id: "b1".into(),
            document: br#"{"title": "Dune"}"#.to_vec(),
        })
        .await
        .unwrap();
    let count = node
        .manager()
        .get_number_of_docs(GetNumberOfDocsRequest {
            index_name: "books".into(),
        })
        .await
        .unwrap();
    assert_eq!(count.number_of_docs, 1);

    // The membership task keeps our own heartbeat fresh
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    assert!(store.get_node(&key).unwrap().unwrap().heartbeat >= registered.heartbeat);

    node.shutdown().await.unwrap();
    assert!(store.get_node(&key).unwrap().is_none());
    assert_eq!(store.list_indexes().unwrap().len(), 1);
}
