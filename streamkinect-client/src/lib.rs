//! # streamkinect-client
//!
//! Client library for streamkinect.
//!
//! This crate provides:
//! - Async control client for PING and WHO requests
//! - Depth stream subscriber that decodes published frames
//! - mDNS browsing for servers on the local network

pub mod connection;
pub mod discovery;
pub mod error;
pub mod subscriber;

pub use connection::{parse_endpoint_uri, ConnectionConfig, ControlClient};
pub use discovery::{browse, DiscoveredServer};
pub use error::ClientError;
pub use subscriber::DepthSubscriber;
