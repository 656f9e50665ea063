//! Device capabilities.
//!
//! A [`Device`] is identified by its unique id and exposes a
//! [`DepthFrameSource`]. The server only starts and stops sources; it never
//! owns the capture hardware.

use crate::error::DeviceError;
use crate::frame::DepthFrame;
use crate::listeners::Listeners;
use crate::simulated::{SimulatedDevice, SimulatedSourceConfig};
use std::sync::Arc;

/// Produces a stream of depth frames once started.
pub trait DepthFrameSource: Send + Sync {
    /// Starts frame production. Starting a running source is a no-op.
    fn start(&self) -> Result<(), DeviceError>;

    /// Stops frame production and waits for the producer to finish.
    fn stop(&self);

    fn is_running(&self) -> bool;

    /// Listeners notified with every produced frame.
    fn frames(&self) -> &Listeners<DepthFrame>;
}

/// A depth-sensing device.
pub trait Device: Send + Sync {
    fn unique_id(&self) -> &str;

    fn depth_frame_source(&self) -> Arc<dyn DepthFrameSource>;
}

/// Selects which device the composition root should create.
#[derive(Debug, Clone, Default)]
pub struct DeviceConfig {
    /// Use the simulated device.
    pub simulated: bool,
    /// Settings for the simulated source.
    pub simulated_source: SimulatedSourceConfig,
}

/// Creates the default device for this build.
///
/// No hardware driver is compiled in, so this returns the simulated device
/// when enabled and `None` otherwise.
pub fn default_device(config: &DeviceConfig) -> Option<Arc<dyn Device>> {
    if config.simulated {
        let device = SimulatedDevice::new(config.simulated_source.clone());
        tracing::info!(
            "Using simulated device {} ({}x{} @ {} fps)",
            device.unique_id(),
            config.simulated_source.width,
            config.simulated_source.height,
            config.simulated_source.fps
        );
        return Some(Arc::new(device));
    }

    tracing::info!("No depth device available (simulated device disabled)");
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_device_simulated() {
        let config = DeviceConfig {
            simulated: true,
            simulated_source: SimulatedSourceConfig::default(),
        };
        let device = default_device(&config).unwrap();
        assert!(!device.unique_id().is_empty());
        assert!(!device.depth_frame_source().is_running());
    }

    #[test]
    fn test_default_device_none() {
        assert!(default_device(&DeviceConfig::default()).is_none());
    }
}
