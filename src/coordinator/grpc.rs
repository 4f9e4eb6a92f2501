//! Node gRPC service
//!
//! Exposes the external and internal halves of every operation. Failures
//! leave as statuses carrying the original message in metadata, so the
//! calling node can rebuild the error.

use crate::common::Result;
use crate::coordinator::manager::IndexManager;
use crate::proto::search_node_server::{SearchNode, SearchNodeServer};
use crate::proto::*;
use std::sync::Arc;
use tonic::{Request, Response, Status};

/// NodeGrpcService serves the `meshsearch.SearchNode` API of one node.
#[derive(Clone)]
pub struct NodeGrpcService {
    manager: Arc<IndexManager>,
}

impl NodeGrpcService {
    pub fn new(manager: Arc<IndexManager>) -> Self {
        Self { manager }
    }

    /// Converts this service into a gRPC server instance.
    pub fn into_server(self, max_message_bytes: usize) -> SearchNodeServer<Self> {
        SearchNodeServer::new(self)
            .max_decoding_message_size(max_message_bytes)
            .max_encoding_message_size(max_message_bytes)
    }
}

fn reply<T>(result: Result<T>) -> std::result::Result<Response<T>, Status> {
    result.map(Response::new).map_err(|e| {
        tracing::debug!("Request failed: {}", e);
        e.to_grpc_status()
    })
}

#[tonic::async_trait]
impl SearchNode for NodeGrpcService {
    async fn query(&self, req: Request<QueryRequest>) -> std::result::Result<Response<QueryResponse>, Status> {
        reply(self.manager.query(req.into_inner()).await)
    }

    async fn internal_query(
        &self,
        req: Request<InternalQueryRequest>,
    ) -> std::result::Result<Response<ShardQueryResponse>, Status> {
        reply(self.manager.internal_query(req.into_inner()).await)
    }

    async fn store(&self, req: Request<StoreRequest>) -> std::result::Result<Response<StoreResponse>, Status> {
        reply(self.manager.store(req.into_inner()).await)
    }

    async fn internal_store(
        &self,
        req: Request<StoreRequest>,
    ) -> std::result::Result<Response<StoreResponse>, Status> {
        reply(self.manager.internal_store(req.into_inner()).await)
    }

    async fn delete(&self, req: Request<DeleteRequest>) -> std::result::Result<Response<DeleteResponse>, Status> {
        reply(self.manager.delete(req.into_inner()).await)
    }

    async fn internal_delete(
        &self,
        req: Request<DeleteRequest>,
    ) -> std::result::Result<Response<DeleteResponse>, Status> {
        reply(self.manager.internal_delete(req.into_inner()).await)
    }

    async fn fetch(&self, req: Request<FetchRequest>) -> std::result::Result<Response<FetchResponse>, Status> {
        reply(self.manager.fetch(req.into_inner()).await)
    }

    async fn internal_fetch(
        &self,
        req: Request<FetchRequest>,
    ) -> std::result::Result<Response<FetchResponse>, Status> {
        reply(self.manager.internal_fetch(req.into_inner()).await)
    }

    async fn optimize(
        &self,
        req: Request<OptimizeRequest>,
    ) -> std::result::Result<Response<OptimizeResponse>, Status> {
        reply(self.manager.optimize(req.into_inner()).await)
    }

    async fn internal_optimize(
        &self,
        req: Request<ShardRequest>,
    ) -> std::result::Result<Response<OptimizeResponse>, Status> {
        reply(self.manager.internal_optimize(req.into_inner()).await)
    }

    async fn get_number_of_docs(
        &self,
        req: Request<GetNumberOfDocsRequest>,
    ) -> std::result::Result<Response<GetNumberOfDocsResponse>, Status> {
        reply(self.manager.get_number_of_docs(req.into_inner()).await)
    }

    async fn internal_get_number_of_docs(
        &self,
        req: Request<ShardRequest>,
    ) -> std::result::Result<Response<ShardCountResponse>, Status> {
        reply(self.manager.internal_get_number_of_docs(req.into_inner()).await)
    }

    async fn get_field_names(
        &self,
        req: Request<GetFieldNamesRequest>,
    ) -> std::result::Result<Response<GetFieldNamesResponse>, Status> {
        reply(self.manager.get_field_names(req.into_inner()).await)
    }

    async fn internal_get_field_names(
        &self,
        req: Request<ShardRequest>,
    ) -> std::result::Result<Response<GetFieldNamesResponse>, Status> {
        reply(self.manager.internal_get_field_names(req.into_inner()).await)
    }

    async fn get_terms(
        &self,
        req: Request<GetTermsRequest>,
    ) -> std::result::Result<Response<GetTermsResponse>, Status> {
        reply(self.manager.get_terms(req.into_inner()).await)
    }

    async fn internal_get_terms(
        &self,
        req: Request<InternalGetTermsRequest>,
    ) -> std::result::Result<Response<GetTermsResponse>, Status> {
        reply(self.manager.internal_get_terms(req.into_inner()).await)
    }

    async fn clear(&self, req: Request<ClearRequest>) -> std::result::Result<Response<ClearResponse>, Status> {
        reply(self.manager.clear(req.into_inner()).await)
    }

    async fn internal_clear(
        &self,
        req: Request<ShardRequest>,
    ) -> std::result::Result<Response<ClearResponse>, Status> {
        reply(self.manager.internal_clear(req.into_inner()).await)
    }
}
