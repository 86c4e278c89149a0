//! The `fleet_router` core library.
//!
//! This crate provides the resilience and routing layer that sits in front of
//! an inference fleet: per-node circuit breakers, a pooled set of upstream
//! HTTP connections, rotation across API credentials and cluster membership
//! tracking used to pick a node for each request.

pub mod cluster;
pub mod config;
pub mod credentials;
pub mod error;
pub mod reliability;
pub mod server;
pub mod upstream;
