//! Error types for meshsearch

use crate::proto::RoutingPolicy;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tonic::metadata::MetadataValue;

pub type Result<T> = std::result::Result<T, Error>;

/// Binary metadata key carrying the original failure across nodes, JSON encoded.
pub const ERROR_METADATA_KEY: &str = "meshsearch-error-bin";

#[derive(Error, Debug)]
pub enum Error {
    // === I/O Errors ===
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // === Routing Errors ===
    #[error("Index <{0}> does not exist")]
    IndexDoesNotExist(String),

    #[error("Shard <{shard}> does not exist for index <{index}>")]
    ShardDoesNotExist { index: String, shard: u32 },

    #[error("Shard <{shard}> of index <{index}> is offline for policy {policy}")]
    ShardOffline {
        index: String,
        shard: u32,
        policy: RoutingPolicy,
    },

    // === Connection Errors ===
    #[error("Cannot get connection: Node <{0}> not loaded")]
    NodeNotLoaded(String),

    #[error("Node <{node}> failed: {message}")]
    Remote { node: String, message: String },

    #[error("gRPC error: {0}")]
    Grpc(#[from] tonic::Status),

    #[error("Transport error: {0}")]
    Transport(#[from] tonic::transport::Error),

    // === Merge Errors ===
    #[error("Invalid shard responses: {0}")]
    ShardResponse(String),

    // === Directory Errors ===
    #[error("Node <{0}> is not registered")]
    NotRegistered(String),

    #[error("RocksDB error: {0}")]
    RocksDb(#[from] rocksdb::Error),

    #[error("Metadata corrupted: {0}")]
    MetadataCorrupted(String),

    // === Config Errors ===
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    // === Generic ===
    #[error("Operation timeout: {0}")]
    Timeout(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Is this a retryable error?
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Timeout(_) | Error::Transport(_) | Error::ShardOffline { .. } => true,
            Error::Grpc(status) => matches!(
                status.code(),
                tonic::Code::Unavailable | tonic::Code::DeadlineExceeded
            ),
            _ => false,
        }
    }

    /// Convert to gRPC status for RPC responses.
    ///
    /// The error also travels in [`ERROR_METADATA_KEY`] so the calling node
    /// can rebuild the same variant with [`Error::from_status`].
    pub fn to_grpc_status(&self) -> tonic::Status {
        use tonic::Code;
        let code = match self {
            Error::ShardOffline { .. } | Error::NodeNotLoaded(_) => Code::Unavailable,
            Error::InvalidArgument(_) | Error::InvalidConfig(_) => Code::InvalidArgument,
            Error::IndexDoesNotExist(_) | Error::ShardDoesNotExist { .. } => Code::NotFound,
            Error::Timeout(_) => Code::DeadlineExceeded,
            Error::Grpc(status) => return status.clone(),
            _ => Code::Internal,
        };
        let mut status = tonic::Status::new(code, self.to_string());
        match serde_json::to_vec(&self.to_wire()) {
            Ok(bytes) => {
                status
                    .metadata_mut()
                    .insert_bin(ERROR_METADATA_KEY, MetadataValue::from_bytes(&bytes));
            }
            Err(e) => tracing::warn!("Cannot encode error metadata: {}", e),
        }
        status
    }

    /// Rebuild an error returned by `node`.
    ///
    /// Typed variants come back as themselves. Anything else becomes
    /// [`Error::Remote`] naming the node where it first happened, so errors
    /// forwarded through several nodes are not nested.
    pub fn from_status(node: impl std::fmt::Display, status: tonic::Status) -> Self {
        let bytes = match status
            .metadata()
            .get_bin(ERROR_METADATA_KEY)
            .and_then(|v| v.to_bytes().ok())
        {
            Some(bytes) => bytes,
            None => return Error::Grpc(status),
        };
        match serde_json::from_slice::<WireError>(&bytes) {
            Ok(wire) => wire.into_error(node),
            Err(_) => Error::Remote {
                node: node.to_string(),
                message: String::from_utf8_lossy(&bytes).into_owned(),
            },
        }
    }

    fn to_wire(&self) -> WireError {
        match self {
            Error::IndexDoesNotExist(index) => WireError::IndexDoesNotExist {
                index: index.clone(),
            },
            Error::ShardDoesNotExist { index, shard } => WireError::ShardDoesNotExist {
                index: index.clone(),
                shard: *shard,
            },
            Error::ShardOffline {
                index,
                shard,
                policy,
            } => WireError::ShardOffline {
                index: index.clone(),
                shard: *shard,
                policy: *policy,
            },
            Error::NodeNotLoaded(node) => WireError::NodeNotLoaded { node: node.clone() },
            Error::InvalidArgument(message) => WireError::InvalidArgument {
                message: message.clone(),
            },
            Error::Timeout(message) => WireError::Timeout {
                message: message.clone(),
            },
            Error::Remote { node, message } => WireError::Remote {
                node: Some(node.clone()),
                message: message.clone(),
            },
            other => WireError::Remote {
                node: None,
                message: other.to_string(),
            },
        }
    }
}

/// Error shape sent between nodes.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum WireError {
    IndexDoesNotExist {
        index: String,
    },
    ShardDoesNotExist {
        index: String,
        shard: u32,
    },
    ShardOffline {
        index: String,
        shard: u32,
        policy: RoutingPolicy,
    },
    NodeNotLoaded {
        node: String,
    },
    InvalidArgument {
        message: String,
    },
    Timeout {
        message: String,
    },
    /// `node` is set once the failure has already crossed a node boundary.
    Remote {
        node: Option<String>,
        message: String,
    },
}

impl WireError {
    fn into_error(self, from: impl std::fmt::Display) -> Error {
        match self {
            WireError::IndexDoesNotExist { index } => Error::IndexDoesNotExist(index),
            WireError::ShardDoesNotExist { index, shard } => Error::ShardDoesNotExist { index, shard },
            WireError::ShardOffline {
                index,
                shard,
                policy,
            } => Error::ShardOffline {
                index,
                shard,
                policy,
            },
            WireError::NodeNotLoaded { node } => Error::NodeNotLoaded(node),
            WireError::InvalidArgument { message } => Error::InvalidArgument(message),
            WireError::Timeout { message } => Error::Timeout(message),
            WireError::Remote { node, message } => Error::Remote {
                node: node.unwrap_or_else(|| from.to_string()),
                message,
            },
        }
    }
}

// Implement From for common error types
impl From<&str> for Error {
    fn from(s: &str) -> Self {
        Error::Other(s.to_string())
    }
}

impl From<String> for Error {
    fn from(s: String) -> Self {
        Error::Other(s)
    }
}

impl From<anyhow::Error> for Error {
    fn from(e: anyhow::Error) -> Self {
        Error::Other(e.to_string())
    }
}

impl From<config::ConfigError> for Error {
    fn from(e: config::ConfigError) -> Self {
        Error::InvalidConfig(e.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for Error {
    fn from(e: tokio::time::error::Elapsed) -> Self {
        Error::Timeout(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        let offline = Error::ShardOffline {
            index: "books".into(),
            shard: 2,
            policy: RoutingPolicy::MasterOnly,
        };
        assert_eq!(offline.to_grpc_status().code(), tonic::Code::Unavailable);
        assert!(offline.is_retryable());

        let bad = Error::InvalidArgument("amount".into());
        assert_eq!(bad.to_grpc_status().code(), tonic::Code::InvalidArgument);

        let missing = Error::IndexDoesNotExist("books".into());
        assert_eq!(missing.to_grpc_status().code(), tonic::Code::NotFound);
        assert!(!missing.is_retryable());
    }

    #[test]
    fn test_typed_error_survives_status() {
        let err = Error::ShardOffline {
            index: "books".into(),
            shard: 3,
            policy: RoutingPolicy::MasterPreferred,
        };
        let status = err.to_grpc_status();

        match Error::from_status("10.0.0.2:32191", status) {
            Error::ShardOffline {
                index,
                shard,
                policy,
            } => {
                assert_eq!(index, "books");
                assert_eq!(shard, 3);
                assert_eq!(policy, RoutingPolicy::MasterPreferred);
            }
            other => panic!("unexpected error: {:?}", other),
        }

        let missing = Error::from_status("n2:1", Error::IndexDoesNotExist("books".into()).to_grpc_status());
        assert_eq!(missing.to_string(), "Index <books> does not exist");
        assert!(!missing.is_retryable());
    }

    #[test]
    fn test_untyped_error_names_its_node() {
        let status = Error::Internal("disk full".into()).to_grpc_status();
        match Error::from_status("10.0.0.2:32191", status) {
            Error::Remote { node, message } => {
                assert_eq!(node, "10.0.0.2:32191");
                assert_eq!(message, "Internal error: disk full");
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_forwarded_error_is_not_nested() {
        // c fails, b relays it to a
        let at_b = Error::from_status("c:1", Error::Internal("disk full".into()).to_grpc_status());
        let at_a = Error::from_status("b:1", at_b.to_grpc_status());

        assert_eq!(at_a.to_string(), "Node <c:1> failed: Internal error: disk full");
        match at_a {
            Error::Remote { node, .. } => assert_eq!(node, "c:1"),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_unreadable_metadata_kept_as_text() {
        let mut status = tonic::Status::internal("boom");
        status
            .metadata_mut()
            .insert_bin(ERROR_METADATA_KEY, MetadataValue::from_bytes(b"not json"));
        match Error::from_status("n1:1", status) {
            Error::Remote { node, message } => {
                assert_eq!(node, "n1:1");
                assert_eq!(message, "not json");
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_plain_status_stays_grpc() {
        let status = tonic::Status::unavailable("connection refused");
        assert!(matches!(
            Error::from_status("n1:1", status),
            Error::Grpc(_)
        ));
    }
}
