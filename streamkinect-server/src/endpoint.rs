//! Publish endpoints for depth streams.
//!
//! An endpoint owns a listening socket. Every accepted subscriber gets its
//! own writer task fed from a broadcast channel, so a slow subscriber lags
//! and skips messages instead of holding up publishers or other subscribers.

use crate::error::ServerError;
use bytes::Bytes;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use streamkinect_protocol::{Encoder, ProtocolError};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::runtime::Handle;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;

/// Default per-subscriber queue depth, in messages.
pub const DEFAULT_PUBLISH_CAPACITY: usize = 4;

/// A one-way publish socket bound to an ephemeral port.
pub struct PublishEndpoint {
    address: String,
    local_addr: SocketAddr,
    /// Serializes publishers.
    sender: Mutex<broadcast::Sender<Bytes>>,
    shutdown: broadcast::Sender<()>,
    subscribers: Arc<AtomicUsize>,
}

impl PublishEndpoint {
    /// Binds a new endpoint on `bind_addr` and starts accepting subscribers
    /// on `runtime`. `host` is used to build the advertised address.
    pub fn bind(
        runtime: &Handle,
        bind_addr: SocketAddr,
        host: &str,
        capacity: usize,
    ) -> Result<Self, ServerError> {
        let std_listener = std::net::TcpListener::bind(bind_addr)?;
        std_listener.set_nonblocking(true)?;
        let local_addr = std_listener.local_addr()?;

        let listener = {
            let _guard = runtime.enter();
            TcpListener::from_std(std_listener)?
        };

        let (sender, _) = broadcast::channel(capacity.max(1));
        let (shutdown, _) = broadcast::channel(1);
        let subscribers = Arc::new(AtomicUsize::new(0));

        runtime.spawn(accept_loop(
            listener,
            sender.clone(),
            shutdown.clone(),
            Arc::clone(&subscribers),
        ));

        let address = format!("tcp://{}:{}", host, local_addr.port());
        tracing::debug!("Publish endpoint listening on {} ({})", local_addr, address);

        Ok(Self {
            address,
            local_addr,
            sender: Mutex::new(sender),
            shutdown,
            subscribers,
        })
    }

    /// Returns the advertised `tcp://host:port` address.
    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    /// Returns the number of connected subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.load(Ordering::SeqCst)
    }

    /// Publishes `payload` as a single-frame message.
    ///
    /// Returns the number of subscribers the message was queued for.
    pub fn publish(&self, payload: Bytes) -> Result<usize, ProtocolError> {
        let message = Encoder::encode_single(payload)?.freeze();
        let sender = self.sender.lock();
        Ok(sender.send(message).unwrap_or(0))
    }

    /// Stops accepting and disconnects every subscriber.
    pub fn close(&self) {
        let _ = self.shutdown.send(());
    }
}

impl Drop for PublishEndpoint {
    fn drop(&mut self) {
        self.close();
    }
}

async fn accept_loop(
    listener: TcpListener,
    sender: broadcast::Sender<Bytes>,
    shutdown: broadcast::Sender<()>,
    subscribers: Arc<AtomicUsize>,
) {
    let mut shutdown_rx = shutdown.subscribe();

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, addr)) => {
                        let _ = stream.set_nodelay(true);
                        let messages = sender.subscribe();
                        let conn_shutdown = shutdown.subscribe();
                        let subscribers = Arc::clone(&subscribers);
                        subscribers.fetch_add(1, Ordering::SeqCst);
                        tracing::debug!("Subscriber connected: {}", addr);

                        tokio::spawn(async move {
                            write_loop(stream, addr, messages, conn_shutdown).await;
                            subscribers.fetch_sub(1, Ordering::SeqCst);
                            tracing::debug!("Subscriber disconnected: {}", addr);
                        });
                    }
                    Err(e) => {
                        tracing::warn!("Publish accept error: {}", e);
                    }
                }
            }
            _ = shutdown_rx.recv() => {
                break;
            }
        }
    }
}

async fn write_loop(
    mut stream: TcpStream,
    addr: SocketAddr,
    mut messages: broadcast::Receiver<Bytes>,
    mut shutdown: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            message = messages.recv() => {
                match message {
                    Ok(bytes) => {
                        if let Err(e) = stream.write_all(&bytes).await {
                            tracing::debug!("[{}] Write error: {}", addr, e);
                            return;
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::debug!("[{}] Subscriber lagging, skipped {} messages", addr, skipped);
                    }
                    Err(RecvError::Closed) => return,
                }
            }
            _ = shutdown.recv() => return,
        }
    }
}
