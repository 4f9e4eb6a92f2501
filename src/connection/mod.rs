//! Pooled connections to peer nodes

pub mod client;
pub mod pool;

pub use client::InternalClient;
pub use pool::{ConnectionPool, PoolManager, PooledConnection};
