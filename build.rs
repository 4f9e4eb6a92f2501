//! Build script generating the node-to-node gRPC service.
//!
//! Messages are hand-written prost structs in `src/proto.rs`; only the
//! client/server plumbing is generated here, so no `protoc` is required.

use tonic_build::manual::{Builder, Method, Service};

const CODEC: &str = "tonic::codec::ProstCodec";

fn unary(name: &str, route: &str, input: &str, output: &str) -> Method {
    Method::builder()
        .name(name)
        .route_name(route)
        .input_type(format!("crate::proto::{}", input))
        .output_type(format!("crate::proto::{}", output))
        .codec_path(CODEC)
        .build()
}

fn main() {
    let service = Service::builder()
        .name("SearchNode")
        .package("meshsearch")
        // query
        .method(unary("query", "Query", "QueryRequest", "QueryResponse"))
        .method(unary(
            "internal_query",
            "InternalQuery",
            "InternalQueryRequest",
            "ShardQueryResponse",
        ))
        // store
        .method(unary("store", "Store", "StoreRequest", "StoreResponse"))
        .method(unary("internal_store", "InternalStore", "StoreRequest", "StoreResponse"))
        // delete
        .method(unary("delete", "Delete", "DeleteRequest", "DeleteResponse"))
        .method(unary("internal_delete", "InternalDelete", "DeleteRequest", "DeleteResponse"))
        // fetch
        .method(unary("fetch", "Fetch", "FetchRequest", "FetchResponse"))
        .method(unary("internal_fetch", "InternalFetch", "FetchRequest", "FetchResponse"))
        // optimize
        .method(unary("optimize", "Optimize", "OptimizeRequest", "OptimizeResponse"))
        .method(unary("internal_optimize", "InternalOptimize", "ShardRequest", "OptimizeResponse"))
        // number of docs
        .method(unary(
            "get_number_of_docs",
            "GetNumberOfDocs",
            "GetNumberOfDocsRequest",
            "GetNumberOfDocsResponse",
        ))
        .method(unary(
            "internal_get_number_of_docs",
            "InternalGetNumberOfDocs",
            "ShardRequest",
            "ShardCountResponse",
        ))
        // field names
        .method(unary(
            "get_field_names",
            "GetFieldNames",
            "GetFieldNamesRequest",
            "GetFieldNamesResponse",
        ))
        .method(unary(
            "internal_get_field_names",
            "InternalGetFieldNames",
            "ShardRequest",
            "GetFieldNamesResponse",
        ))
        // terms
        .method(unary("get_terms", "GetTerms", "GetTermsRequest", "GetTermsResponse"))
        .method(unary(
            "internal_get_terms",
            "InternalGetTerms",
            "InternalGetTermsRequest",
            "GetTermsResponse",
        ))
        // clear
        .method(unary("clear", "Clear", "ClearRequest", "ClearResponse"))
        .method(unary("internal_clear", "InternalClear", "ShardRequest", "ClearResponse"))
        .build();

    Builder::new().compile(&[service]);

    println!("cargo:rerun-if-changed=build.rs");
}
