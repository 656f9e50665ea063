//! Simulated depth device.
//!
//! Produces a horizontal gradient (`x & 0x0FFF`) at a fixed rate on a
//! dedicated thread.

use crate::device::{DepthFrameSource, Device};
use crate::error::DeviceError;
use crate::frame::DepthFrame;
use crate::listeners::Listeners;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Settings for the simulated frame source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimulatedSourceConfig {
    pub width: u16,
    pub height: u16,
    pub fps: u32,
}

impl Default for SimulatedSourceConfig {
    fn default() -> Self {
        Self {
            width: 1920,
            height: 1080,
            fps: 60,
        }
    }
}

impl SimulatedSourceConfig {
    fn frame_interval(&self) -> Duration {
        Duration::from_secs(1) / self.fps.max(1)
    }

    fn pattern(&self) -> DepthFrame {
        let samples = (0..self.height)
            .flat_map(|_| (0..self.width).map(|x| x & 0x0FFF))
            .collect();
        DepthFrame::new(self.width, self.height, samples)
    }
}

/// Frame source generating a synthetic gradient.
pub struct SimulatedDepthFrameSource {
    config: SimulatedSourceConfig,
    running: Arc<AtomicBool>,
    thread: Mutex<Option<JoinHandle<()>>>,
    listeners: Arc<Listeners<DepthFrame>>,
}

impl SimulatedDepthFrameSource {
    pub fn new(config: SimulatedSourceConfig) -> Self {
        Self {
            config,
            running: Arc::new(AtomicBool::new(false)),
            thread: Mutex::new(None),
            listeners: Arc::new(Listeners::new()),
        }
    }

    pub fn config(&self) -> &SimulatedSourceConfig {
        &self.config
    }
}

impl DepthFrameSource for SimulatedDepthFrameSource {
    fn start(&self) -> Result<(), DeviceError> {
        let mut thread = self.thread.lock();
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let running = Arc::clone(&self.running);
        let listeners = Arc::clone(&self.listeners);
        let interval = self.config.frame_interval();
        let frame = self.config.pattern();

        let handle = thread::Builder::new()
            .name("depth-simulator".to_string())
            .spawn(move || {
                let mut next = Instant::now();
                while running.load(Ordering::SeqCst) {
                    listeners.notify(&frame);

                    next += interval;
                    let now = Instant::now();
                    if next > now {
                        thread::sleep(next - now);
                    } else {
                        // Fell behind; don't try to catch up with a burst.
                        next = now;
                    }
                }
            });

        match handle {
            Ok(handle) => {
                *thread = Some(handle);
                tracing::debug!(
                    "Simulated source started ({}x{} every {:?})",
                    self.config.width,
                    self.config.height,
                    interval
                );
                Ok(())
            }
            Err(e) => {
                self.running.store(false, Ordering::SeqCst);
                Err(DeviceError::ThreadSpawn(e))
            }
        }
    }

    fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);

        let handle = self.thread.lock().take();
        if let Some(handle) = handle {
            // A listener stopping its own source must not join itself.
            if handle.thread().id() == thread::current().id() {
                return;
            }
            if handle.join().is_err() {
                tracing::warn!("Simulated frame thread panicked");
            }
            tracing::debug!("Simulated source stopped");
        }
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn frames(&self) -> &Listeners<DepthFrame> {
        &self.listeners
    }
}

impl Drop for SimulatedDepthFrameSource {
    fn drop(&mut self) {
        self.stop();
    }
}

/// A device backed by [`SimulatedDepthFrameSource`].
pub struct SimulatedDevice {
    id: String,
    source: Arc<SimulatedDepthFrameSource>,
}

impl SimulatedDevice {
    pub fn new(config: SimulatedSourceConfig) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            source: Arc::new(SimulatedDepthFrameSource::new(config)),
        }
    }
}

impl Device for SimulatedDevice {
    fn unique_id(&self) -> &str {
        &self.id
    }

    fn depth_frame_source(&self) -> Arc<dyn DepthFrameSource> {
        self.source.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn small_config() -> SimulatedSourceConfig {
        SimulatedSourceConfig {
            width: 8,
            height: 4,
            fps: 200,
        }
    }

    #[test]
    fn test_pattern() {
        let config = SimulatedSourceConfig {
            width: 5000,
            height: 2,
            fps: 1,
        };
        let frame = config.pattern();
        assert_eq!(frame.sample_count(), 10_000);
        assert_eq!(frame.sample(10, 1), Some(10));
        assert_eq!(frame.sample(4095, 0), Some(4095));
        assert_eq!(frame.sample(4096, 0), Some(0));
        assert!(frame.samples.iter().all(|&s| s <= 0x0FFF));
    }

    #[test]
    fn test_start_produces_frames_and_stop_joins() {
        let source = SimulatedDepthFrameSource::new(small_config());
        let frames = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&frames);
        source.frames().subscribe(move |frame: &DepthFrame| {
            assert_eq!(frame.width, 8);
            assert_eq!(frame.height, 4);
            counter.fetch_add(1, Ordering::SeqCst);
        });

        source.start().unwrap();
        assert!(source.is_running());
        thread::sleep(Duration::from_millis(100));
        source.stop();
        assert!(!source.is_running());

        let produced = frames.load(Ordering::SeqCst);
        assert!(produced > 0);

        // Nothing arrives once stopped.
        thread::sleep(Duration::from_millis(30));
        assert_eq!(frames.load(Ordering::SeqCst), produced);
    }

    #[test]
    fn test_start_is_idempotent() {
        let source = SimulatedDepthFrameSource::new(small_config());
        source.start().unwrap();
        source.start().unwrap();
        source.stop();
        source.stop();
        assert!(!source.is_running());
    }

    #[test]
    fn test_simulated_devices_have_unique_ids() {
        let a = SimulatedDevice::new(small_config());
        let b = SimulatedDevice::new(small_config());
        assert_ne!(a.unique_id(), b.unique_id());
        assert_eq!(a.unique_id().len(), 36);
    }
}
