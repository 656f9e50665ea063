//! # streamkinect-server
//!
//! Discoverable depth streaming server.
//!
//! This crate provides:
//! - The server lifecycle state machine driven by service advertisement
//! - Control request dispatch (PING/WHO)
//! - Per-device publish endpoints fed by the compression pipeline
//! - mDNS and in-process service advertisers
//! - YAML/environment configuration

pub mod advertiser;
pub mod config;
pub mod device;
pub mod endpoint;
pub mod error;
pub mod handler;
pub mod mdns;
pub mod server;

pub use advertiser::{AdvertiserEvent, FakeAdvertiser, ServiceAdvertiser};
pub use config::{Config, ConfigError, DeviceSection, PipelineSection, ServerSection};
pub use device::{EndpointKind, ServerDevice};
pub use endpoint::PublishEndpoint;
pub use error::{AdvertiserError, ServerError};
pub use mdns::MdnsAdvertiser;
pub use server::{Server, ServerConfig, ServerEvent, ServerState, ServerStats};
