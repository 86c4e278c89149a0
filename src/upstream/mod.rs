//! Upstream inference endpoints: HTTP connections, the connection pool and
//! the dispatcher that routes requests across nodes and credentials.

pub mod client;
pub mod dispatch;
pub mod pool;

pub use client::{Connector, HttpConnector, UpstreamClient, UpstreamConfig};
pub use dispatch::{DispatchOutcome, FanOutResult, InferenceDispatcher, InferenceRequest};
pub use pool::{ConnectionPool, PoolConfig, PoolStats, PooledConnection};
