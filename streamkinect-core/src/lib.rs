//! # streamkinect-core
//!
//! Device capabilities and frame processing for streamkinect.
//!
//! This crate provides:
//! - The `DepthFrame` type and the `Device` / `DepthFrameSource` capabilities
//! - A thread-safe listener registry used for frame notifications
//! - A simulated device producing a synthetic depth pattern
//! - The bounded, drop-on-overload compression pipeline

pub mod compressor;
pub mod device;
pub mod error;
pub mod frame;
pub mod listeners;
pub mod simulated;

pub use compressor::{
    CompressedFrame, CompressionPipeline, PipelineConfig, PipelineStats, MAX_IN_FLIGHT_LIMIT,
};
pub use device::{default_device, DepthFrameSource, Device, DeviceConfig};
pub use error::{DeviceError, PipelineError};
pub use frame::DepthFrame;
pub use listeners::{ListenerId, Listeners};
pub use simulated::{SimulatedDepthFrameSource, SimulatedDevice, SimulatedSourceConfig};
