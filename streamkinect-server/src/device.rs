//! Server-side device wrapper: frame routing and lazily created endpoints.

use crate::endpoint::{PublishEndpoint, DEFAULT_PUBLISH_CAPACITY};
use crate::error::ServerError;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Weak};
use streamkinect_core::{CompressionPipeline, Device, DeviceError, ListenerId, PipelineConfig};
use streamkinect_protocol::{DeviceRecord, CONTROL_ENDPOINT, DEPTH_ENDPOINT};
use tokio::runtime::Handle;

/// Kind of endpoint a device can expose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EndpointKind {
    Control,
    Depth,
}

impl EndpointKind {
    /// Key used for this kind in endpoint maps.
    pub fn as_str(&self) -> &'static str {
        match self {
            EndpointKind::Control => CONTROL_ENDPOINT,
            EndpointKind::Depth => DEPTH_ENDPOINT,
        }
    }
}

impl fmt::Display for EndpointKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Endpoints of a device. Once closed by a stop, none are created until the
/// device starts again.
#[derive(Default)]
struct Endpoints {
    map: HashMap<EndpointKind, PublishEndpoint>,
    closed: bool,
}

/// Owns one device, its compression pipeline and its publish endpoints.
pub struct ServerDevice {
    device: Arc<dyn Device>,
    pipeline: CompressionPipeline,
    runtime: Handle,
    bind_ip: IpAddr,
    endpoints: Mutex<Endpoints>,
    frame_listener: Mutex<Option<ListenerId>>,
}

impl ServerDevice {
    pub fn new(device: Arc<dyn Device>, pipeline: PipelineConfig, runtime: Handle) -> Arc<Self> {
        Arc::new_cyclic(|this: &Weak<ServerDevice>| {
            let pipeline = CompressionPipeline::with_handle(pipeline, runtime.clone());

            let this = this.clone();
            pipeline.subscribe(move |frame| {
                if let Some(device) = this.upgrade() {
                    device.on_compressed_frame(frame.data.clone());
                }
            });

            Self {
                device,
                pipeline,
                runtime,
                bind_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
                endpoints: Mutex::new(Endpoints::default()),
                frame_listener: Mutex::new(None),
            }
        })
    }

    pub fn id(&self) -> &str {
        self.device.unique_id()
    }

    pub fn device(&self) -> &Arc<dyn Device> {
        &self.device
    }

    pub fn pipeline(&self) -> &CompressionPipeline {
        &self.pipeline
    }

    /// Routes the device's frames into the pipeline and starts the source.
    pub fn start(&self) -> Result<(), DeviceError> {
        let source = self.device.depth_frame_source();
        self.endpoints.lock().closed = false;

        {
            let mut listener = self.frame_listener.lock();
            if listener.is_none() {
                let pipeline = self.pipeline.clone();
                *listener = Some(source.frames().subscribe(move |frame| {
                    pipeline.submit(frame);
                }));
            }
        }

        if !source.is_running() {
            if let Err(e) = source.start() {
                self.detach();
                return Err(e);
            }
            tracing::info!("Device {} started", self.id());
        }
        Ok(())
    }

    /// Stops the device, closes its endpoints and drains the pipeline.
    pub async fn stop(&self) {
        let source = self.device.depth_frame_source();
        self.detach();

        if source.is_running() {
            // Joining the frame thread blocks.
            let stopping = Arc::clone(&source);
            if let Err(e) = tokio::task::spawn_blocking(move || stopping.stop()).await {
                tracing::warn!("Device {} failed to stop cleanly: {}", self.id(), e);
            }
        }

        self.close_endpoints();

        if !self.pipeline.dispose().await {
            tracing::warn!(
                "Device {} stopped with {} compressions still running",
                self.id(),
                self.pipeline.in_flight()
            );
        }
        tracing::info!("Device {} stopped", self.id());
    }

    /// Stops the device without waiting for outstanding compressions.
    pub fn halt(&self) {
        let source = self.device.depth_frame_source();
        self.detach();
        if source.is_running() {
            source.stop();
        }
        self.close_endpoints();
    }

    fn detach(&self) {
        if let Some(id) = self.frame_listener.lock().take() {
            self.device.depth_frame_source().frames().unsubscribe(id);
        }
    }

    fn close_endpoints(&self) {
        let endpoints: Vec<(EndpointKind, PublishEndpoint)> = {
            let mut endpoints = self.endpoints.lock();
            endpoints.closed = true;
            endpoints.map.drain().collect()
        };
        for (kind, endpoint) in endpoints {
            endpoint.close();
            tracing::debug!("Closed {} endpoint {}", kind, endpoint.address());
        }
    }

    /// Returns the address of the `kind` endpoint, binding it on first use.
    ///
    /// Fails once the device has been stopped, until it is started again.
    pub fn create_endpoint_if_necessary(
        &self,
        kind: EndpointKind,
        host: &str,
    ) -> Result<String, ServerError> {
        let mut endpoints = self.endpoints.lock();
        if let Some(endpoint) = endpoints.map.get(&kind) {
            return Ok(endpoint.address().to_string());
        }
        if endpoints.closed {
            return Err(ServerError::DeviceStopped(self.id().to_string()));
        }

        let endpoint = PublishEndpoint::bind(
            &self.runtime,
            SocketAddr::new(self.bind_ip, 0),
            host,
            DEFAULT_PUBLISH_CAPACITY,
        )?;
        let address = endpoint.address().to_string();
        tracing::info!("Device {} {} endpoint at {}", self.id(), kind, address);
        endpoints.map.insert(kind, endpoint);
        Ok(address)
    }

    /// Returns the address of an existing endpoint.
    pub fn endpoint_address(&self, kind: EndpointKind) -> Option<String> {
        self.endpoints
            .lock()
            .map
            .get(&kind)
            .map(|endpoint| endpoint.address().to_string())
    }

    /// Publishes a compressed frame on the depth endpoint, if one exists.
    pub fn on_compressed_frame(&self, data: Bytes) {
        let endpoints = self.endpoints.lock();
        let Some(endpoint) = endpoints.map.get(&EndpointKind::Depth) else {
            return;
        };
        if let Err(e) = endpoint.publish(data) {
            tracing::warn!("Device {} failed to publish frame: {}", self.id(), e);
        }
    }

    /// Describes the device, creating its depth endpoint if needed.
    pub fn record(&self, host: &str) -> Result<DeviceRecord, ServerError> {
        self.create_endpoint_if_necessary(EndpointKind::Depth, host)?;

        let endpoints = self.endpoints.lock();
        let record = endpoints
            .map
            .iter()
            .fold(DeviceRecord::new(self.id()), |record, (kind, endpoint)| {
                record.with_endpoint(kind.as_str(), endpoint.address())
            });
        Ok(record)
    }
}

impl Drop for ServerDevice {
    fn drop(&mut self) {
        self.detach();
    }
}
