//! Bounded, drop-on-overload frame compression.
//!
//! Each admitted frame is copied and compressed on the tokio blocking pool.
//! At most `max_in_flight` compressions run at once; frames submitted while
//! every slot is busy are dropped, so the producer never blocks and no
//! backlog builds up. Completions are delivered in whatever order the
//! compressions finish.

use crate::error::PipelineError;
use crate::frame::DepthFrame;
use crate::listeners::{ListenerId, Listeners};
use bytes::Bytes;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::runtime::Handle;
use tokio::sync::Semaphore;

/// Largest usable in-flight limit. `dispose` reclaims every slot in one
/// `acquire_many`, which takes a `u32`.
pub const MAX_IN_FLIGHT_LIMIT: usize = u32::MAX as usize;

/// Pipeline configuration.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Maximum number of concurrent compressions.
    pub max_in_flight: usize,
    /// How long `dispose` waits for outstanding compressions.
    pub dispose_timeout: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_in_flight: 1,
            dispose_timeout: Duration::from_millis(500),
        }
    }
}

impl PipelineConfig {
    pub fn with_max_in_flight(mut self, max: usize) -> Self {
        self.max_in_flight = max;
        self
    }

    pub fn with_dispose_timeout(mut self, timeout: Duration) -> Self {
        self.dispose_timeout = timeout;
        self
    }
}

/// A compressed frame in depth wire encoding.
#[derive(Debug, Clone)]
pub struct CompressedFrame {
    /// Header plus LZ4 stream.
    pub data: Bytes,
    /// Number of samples in the source frame.
    pub original_sample_count: usize,
    /// Submission sequence number of the source frame.
    pub sequence: u64,
}

/// Pipeline counters.
#[derive(Debug, Default)]
pub struct PipelineStats {
    pub submitted: AtomicU64,
    pub dropped: AtomicU64,
    pub completed: AtomicU64,
    pub failed: AtomicU64,
}

struct PipelineInner {
    config: PipelineConfig,
    permits: usize,
    runtime: Handle,
    semaphore: Arc<Semaphore>,
    next_sequence: AtomicU64,
    in_flight: DashMap<u64, Instant>,
    listeners: Listeners<CompressedFrame>,
    stats: PipelineStats,
}

/// Compresses depth frames concurrently under a fixed in-flight limit.
#[derive(Clone)]
pub struct CompressionPipeline {
    inner: Arc<PipelineInner>,
}

impl CompressionPipeline {
    /// Creates a pipeline on the current tokio runtime.
    pub fn new(config: PipelineConfig) -> Result<Self, PipelineError> {
        let runtime = Handle::try_current().map_err(|_| PipelineError::NoRuntime)?;
        Ok(Self::with_handle(config, runtime))
    }

    /// Creates a pipeline that schedules work on `runtime`.
    pub fn with_handle(config: PipelineConfig, runtime: Handle) -> Self {
        let permits = config
            .max_in_flight
            .clamp(1, MAX_IN_FLIGHT_LIMIT.min(Semaphore::MAX_PERMITS));
        Self {
            inner: Arc::new(PipelineInner {
                config,
                permits,
                runtime,
                semaphore: Arc::new(Semaphore::new(permits)),
                next_sequence: AtomicU64::new(0),
                in_flight: DashMap::new(),
                listeners: Listeners::new(),
                stats: PipelineStats::default(),
            }),
        }
    }

    /// Subscribes to compressed frames.
    pub fn subscribe<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&CompressedFrame) + Send + Sync + 'static,
    {
        self.inner.listeners.subscribe(listener)
    }

    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        self.inner.listeners.unsubscribe(id)
    }

    /// Offers a frame for compression.
    ///
    /// Returns false if the frame was dropped because every slot was busy.
    /// Never blocks.
    pub fn submit(&self, frame: &DepthFrame) -> bool {
        let inner = &self.inner;
        inner.stats.submitted.fetch_add(1, Ordering::Relaxed);

        let permit = match Arc::clone(&inner.semaphore).try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                inner.stats.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(
                    "Dropping {}x{} frame: {} compressions in flight",
                    frame.width,
                    frame.height,
                    inner.in_flight.len()
                );
                return false;
            }
        };

        let sequence = inner.next_sequence.fetch_add(1, Ordering::Relaxed);
        let width = frame.width;
        let height = frame.height;
        let samples = frame.samples.clone();
        inner.in_flight.insert(sequence, Instant::now());

        let task = Arc::clone(inner);
        inner.runtime.spawn_blocking(move || {
            let sample_count = samples.len();
            match streamkinect_protocol::encode_depth_frame(width, height, &samples) {
                Ok(data) => {
                    task.listeners.notify(&CompressedFrame {
                        data,
                        original_sample_count: sample_count,
                        sequence,
                    });
                    task.stats.completed.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    task.stats.failed.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!("Compression of frame {} failed: {}", sequence, e);
                }
            }

            if let Some((_, started)) = task.in_flight.remove(&sequence) {
                tracing::trace!("Frame {} compressed in {:?}", sequence, started.elapsed());
            }
            drop(permit);
        });

        true
    }

    /// Waits up to the configured timeout for outstanding compressions.
    ///
    /// Returns true if the pipeline drained. Compressions still running after
    /// the timeout are abandoned, not cancelled; their results are still
    /// delivered to any remaining listeners. The pipeline stays usable.
    pub async fn dispose(&self) -> bool {
        let inner = &self.inner;
        let all = u32::try_from(inner.permits).unwrap_or(u32::MAX);
        let wait = inner.semaphore.acquire_many(all);

        match tokio::time::timeout(inner.config.dispose_timeout, wait).await {
            Ok(Ok(permits)) => {
                drop(permits);
                true
            }
            Ok(Err(_)) => false,
            Err(_) => {
                tracing::warn!(
                    "Abandoning {} compressions after {:?}",
                    inner.in_flight.len(),
                    inner.config.dispose_timeout
                );
                false
            }
        }
    }

    /// Returns the number of compressions currently running.
    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.len()
    }

    /// Returns the effective in-flight limit.
    pub fn max_in_flight(&self) -> usize {
        self.inner.permits
    }

    pub fn stats(&self) -> &PipelineStats {
        &self.inner.stats
    }
}
