//! Shard operations
//!
//! Each type pairs the in-process handler (the local [`ShardEngine`]) with
//! the matching internal RPC on a peer, so the router can pick either.

use crate::common::Result;
use crate::connection::InternalClient;
use crate::coordinator::metadata::Node;
use crate::coordinator::router::ShardOperation;
use crate::proto::*;
use crate::search::ShardEngine;
use async_trait::async_trait;
use std::sync::Arc;

/// Local engine plus the client used to reach peers.
#[derive(Clone)]
pub struct Backends {
    pub engine: Arc<dyn ShardEngine>,
    pub client: InternalClient,
}

impl Backends {
    pub fn new(engine: Arc<dyn ShardEngine>, client: InternalClient) -> Self {
        Self { engine, client }
    }
}

fn shard_request(index_name: &str, shard: u32) -> ShardRequest {
    ShardRequest {
        index_name: index_name.to_string(),
        shard_number: shard,
    }
}

pub struct Store<'a>(pub &'a Backends);

#[async_trait]
impl ShardOperation for Store<'_> {
    type Request = StoreRequest;
    type Response = StoreResponse;
    const NAME: &'static str = "store";

    async fn process_internal(&self, _index_name: &str, shard: u32, request: StoreRequest) -> Result<StoreResponse> {
        self.0.engine.store(shard, request).await
    }

    async fn process_external(
        &self,
        node: &Node,
        _index_name: &str,
        _shard: u32,
        request: StoreRequest,
    ) -> Result<StoreResponse> {
        self.0.client.store(&node.key(), request).await
    }
}

pub struct Delete<'a>(pub &'a Backends);

#[async_trait]
impl ShardOperation for Delete<'_> {
    type Request = DeleteRequest;
    type Response = DeleteResponse;
    const NAME: &'static str = "delete";

    async fn process_internal(&self, _index_name: &str, shard: u32, request: DeleteRequest) -> Result<DeleteResponse> {
        self.0.engine.delete(shard, request).await
    }

    async fn process_external(
        &self,
        node: &Node,
        _index_name: &str,
        _shard: u32,
        request: DeleteRequest,
    ) -> Result<DeleteResponse> {
        self.0.client.delete(&node.key(), request).await
    }
}

pub struct Fetch<'a>(pub &'a Backends);

#[async_trait]
impl ShardOperation for Fetch<'_> {
    type Request = FetchRequest;
    type Response = FetchResponse;
    const NAME: &'static str = "fetch";

    async fn process_internal(&self, _index_name: &str, shard: u32, request: FetchRequest) -> Result<FetchResponse> {
        self.0.engine.fetch(shard, request).await
    }

    async fn process_external(
        &self,
        node: &Node,
        _index_name: &str,
        _shard: u32,
        request: FetchRequest,
    ) -> Result<FetchResponse> {
        self.0.client.fetch(&node.key(), request).await
    }
}

pub struct Query<'a>(pub &'a Backends);

#[async_trait]
impl ShardOperation for Query<'_> {
    type Request = QueryRequest;
    type Response = ShardQueryResponse;
    const NAME: &'static str = "query";

    async fn process_internal(
        &self,
        _index_name: &str,
        shard: u32,
        request: QueryRequest,
    ) -> Result<ShardQueryResponse> {
        self.0.engine.query(shard, &request).await
    }

    async fn process_external(
        &self,
        node: &Node,
        _index_name: &str,
        shard: u32,
        request: QueryRequest,
    ) -> Result<ShardQueryResponse> {
        let request = InternalQueryRequest {
            shard_number: shard,
            request: Some(request),
        };
        self.0.client.query(&node.key(), request).await
    }
}

pub struct Optimize<'a>(pub &'a Backends);

#[async_trait]
impl ShardOperation for Optimize<'_> {
    type Request = ();
    type Response = ();
    const NAME: &'static str = "optimize";

    async fn process_internal(&self, index_name: &str, shard: u32, _request: ()) -> Result<()> {
        self.0.engine.optimize(index_name, shard).await
    }

    async fn process_external(&self, node: &Node, index_name: &str, shard: u32, _request: ()) -> Result<()> {
        self.0
            .client
            .optimize(&node.key(), shard_request(index_name, shard))
            .await
            .map(|_| ())
    }
}

pub struct Clear<'a>(pub &'a Backends);

#[async_trait]
impl ShardOperation for Clear<'_> {
    type Request = ();
    type Response = ();
    const NAME: &'static str = "clear";

    async fn process_internal(&self, index_name: &str, shard: u32, _request: ()) -> Result<()> {
        self.0.engine.clear(index_name, shard).await
    }

    async fn process_external(&self, node: &Node, index_name: &str, shard: u32, _request: ()) -> Result<()> {
        self.0
            .client
            .clear(&node.key(), shard_request(index_name, shard))
            .await
            .map(|_| ())
    }
}

pub struct CountDocs<'a>(pub &'a Backends);

#[async_trait]
impl ShardOperation for CountDocs<'_> {
    type Request = ();
    type Response = ShardCountResponse;
    const NAME: &'static str = "count";

    async fn process_internal(&self, index_name: &str, shard: u32, _request: ()) -> Result<ShardCountResponse> {
        Ok(ShardCountResponse {
            shard_number: shard,
            number_of_docs: self.0.engine.number_of_docs(index_name, shard).await?,
        })
    }

    async fn process_external(
        &self,
        node: &Node,
        index_name: &str,
        shard: u32,
        _request: (),
    ) -> Result<ShardCountResponse> {
        self.0
            .client
            .number_of_docs(&node.key(), shard_request(index_name, shard))
            .await
    }
}

pub struct FieldNames<'a>(pub &'a Backends);

#[async_trait]
impl ShardOperation for FieldNames<'_> {
    type Request = ();
    type Response = Vec<String>;
    const NAME: &'static str = "field names";

    async fn process_internal(&self, index_name: &str, shard: u32, _request: ()) -> Result<Vec<String>> {
        self.0.engine.field_names(index_name, shard).await
    }

    async fn process_external(&self, node: &Node, index_name: &str, shard: u32, _request: ()) -> Result<Vec<String>> {
        self.0
            .client
            .field_names(&node.key(), shard_request(index_name, shard))
            .await
            .map(|r| r.field_names)
    }
}

pub struct Terms<'a>(pub &'a Backends);

#[async_trait]
impl ShardOperation for Terms<'_> {
    type Request = GetTermsRequest;
    type Response = Vec<Term>;
    const NAME: &'static str = "terms";

    async fn process_internal(&self, _index_name: &str, shard: u32, request: GetTermsRequest) -> Result<Vec<Term>> {
        self.0.engine.terms(shard, &request).await
    }

    async fn process_external(
        &self,
        node: &Node,
        _index_name: &str,
        shard: u32,
        request: GetTermsRequest,
    ) -> Result<Vec<Term>> {
        let request = InternalGetTermsRequest {
            shard_number: shard,
            request: Some(request),
        };
        self.0
            .client
            .terms(&node.key(), request)
            .await
            .map(|r| r.terms)
    }
}
