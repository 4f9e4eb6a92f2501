//! Node-to-node RPC client
//!
//! Every internal call goes through [`InternalClient::execute`]: borrow a
//! pooled connection, run the call, release the connection as valid on
//! success and invalid on failure, and turn a failed status back into the
//! error the remote node raised.

use crate::common::{Error, Result};
use crate::connection::pool::PoolManager;
use crate::coordinator::metadata::NodeKey;
use crate::proto::search_node_client::SearchNodeClient;
use crate::proto::*;
use std::future::Future;
use std::sync::Arc;
use tonic::transport::Channel;
use tracing::debug;

type Stub = SearchNodeClient<Channel>;

#[derive(Clone)]
pub struct InternalClient {
    pools: Arc<PoolManager>,
}

impl InternalClient {
    pub fn new(pools: Arc<PoolManager>) -> Self {
        Self { pools }
    }

    pub fn pools(&self) -> &Arc<PoolManager> {
        &self.pools
    }

    /// Run one unary call against `node` on a pooled connection.
    pub async fn execute<Req, Resp, F, Fut>(&self, node: &NodeKey, request: Req, call: F) -> Result<Resp>
    where
        F: FnOnce(Stub, Req) -> Fut,
        Fut: Future<Output = std::result::Result<tonic::Response<Resp>, tonic::Status>>,
    {
        let connection = self.pools.borrow(node).await?;
        let stub = match connection.client() {
            Ok(stub) => stub,
            Err(e) => {
                self.pools.release(connection, false);
                return Err(e);
            }
        };

        match call(stub, request).await {
            Ok(response) => {
                self.pools.release(connection, true);
                Ok(response.into_inner())
            }
            Err(status) => {
                debug!("Call to {} failed: {}", node, status.message());
                self.pools.release(connection, false);
                Err(Error::from_status(node, status))
            }
        }
    }

    pub async fn store(&self, node: &NodeKey, request: StoreRequest) -> Result<StoreResponse> {
        self.execute(node, request, |mut c, r| async move { c.internal_store(r).await })
            .await
    }

    pub async fn delete(&self, node: &NodeKey, request: DeleteRequest) -> Result<DeleteResponse> {
        self.execute(node, request, |mut c, r| async move { c.internal_delete(r).await })
            .await
    }

    pub async fn fetch(&self, node: &NodeKey, request: FetchRequest) -> Result<FetchResponse> {
        self.execute(node, request, |mut c, r| async move { c.internal_fetch(r).await })
            .await
    }

    pub async fn query(
        &self,
        node: &NodeKey,
        request: InternalQueryRequest,
    ) -> Result<ShardQueryResponse> {
        self.execute(node, request, |mut c, r| async move { c.internal_query(r).await })
            .await
    }

    pub async fn optimize(&self, node: &NodeKey, request: ShardRequest) -> Result<OptimizeResponse> {
        self.execute(node, request, |mut c, r| async move { c.internal_optimize(r).await })
            .await
    }

    pub async fn clear(&self, node: &NodeKey, request: ShardRequest) -> Result<ClearResponse> {
        self.execute(node, request, |mut c, r| async move { c.internal_clear(r).await })
            .await
    }

    pub async fn number_of_docs(
        &self,
        node: &NodeKey,
        request: ShardRequest,
    ) -> Result<ShardCountResponse> {
        self.execute(node, request, |mut c, r| async move {
            c.internal_get_number_of_docs(r).await
        })
        .await
    }

    pub async fn field_names(
        &self,
        node: &NodeKey,
        request: ShardRequest,
    ) -> Result<GetFieldNamesResponse> {
        self.execute(node, request, |mut c, r| async move {
            c.internal_get_field_names(r).await
        })
        .await
    }

    pub async fn terms(
        &self,
        node: &NodeKey,
        request: InternalGetTermsRequest,
    ) -> Result<GetTermsResponse> {
        self.execute(node, request, |mut c, r| async move { c.internal_get_terms(r).await })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::PoolConfig;

    #[tokio::test]
    async fn test_unknown_node_not_loaded() {
        let client = InternalClient::new(Arc::new(PoolManager::new(PoolConfig::default())));
        let err = client
            .store(&NodeKey::new("10.9.9.9", 1), StoreRequest::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NodeNotLoaded(_)));
    }

    #[tokio::test]
    async fn test_failed_call_invalidates_connection() {
        let pools = Arc::new(PoolManager::new(PoolConfig::default()));
        let node = NodeKey::new("127.0.0.1", 1);
        pools.add_node(&node).unwrap();
        let client = InternalClient::new(pools.clone());

        let result: Result<StoreResponse> = client
            .execute(&node, StoreRequest::default(), |_, _| async {
                Err::<tonic::Response<StoreResponse>, _>(tonic::Status::internal("boom"))
            })
            .await;
        assert!(matches!(result, Err(Error::Grpc(_))));

        let pool = pools.pool(&node).unwrap();
        assert_eq!(pool.idle_count(), 0);
        assert_eq!(pool.active_count(), 0);
    }

    #[tokio::test]
    async fn test_successful_call_returns_connection() {
        let pools = Arc::new(PoolManager::new(PoolConfig::default()));
        let node = NodeKey::new("127.0.0.1", 1);
        pools.add_node(&node).unwrap();
        let client = InternalClient::new(pools.clone());

        let response = client
            .execute(&node, DeleteRequest::default(), |_, _| async {
                Ok::<_, tonic::Status>(tonic::Response::new(DeleteResponse { deleted: true }))
            })
            .await
            .unwrap();
        assert!(response.deleted);
        assert_eq!(pools.pool(&node).unwrap().idle_count(), 1);
    }
}
