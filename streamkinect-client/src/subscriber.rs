//! Depth stream subscriptions.

use crate::connection::{connect_stream, ConnectionConfig};
use crate::error::ClientError;
use bytes::Bytes;
use streamkinect_protocol::{decode_depth_frame, DecodedDepthFrame, Decoder, ProtocolError};
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;

/// Receives messages published on a device's depth endpoint.
///
/// Messages published before the subscription was accepted are not seen.
/// A subscriber that reads too slowly skips messages rather than
/// receiving them late.
pub struct DepthSubscriber {
    stream: TcpStream,
    decoder: Decoder,
    buf: Vec<u8>,
}

impl DepthSubscriber {
    /// Subscribes to the depth endpoint at `uri` (`tcp://host:port`).
    pub async fn connect(uri: &str) -> Result<Self, ClientError> {
        Self::connect_with(uri, ConnectionConfig::default()).await
    }

    pub async fn connect_with(uri: &str, config: ConnectionConfig) -> Result<Self, ClientError> {
        let stream = connect_stream(uri, &config).await?;
        tracing::debug!("Subscribed to {}", uri);
        Ok(Self {
            stream,
            decoder: Decoder::new(),
            buf: vec![0u8; config.read_buffer_size],
        })
    }

    /// Waits for the next published message and returns its payload,
    /// still compressed.
    pub async fn next_message(&mut self) -> Result<Bytes, ClientError> {
        loop {
            if let Some(message) = self.decoder.decode_message()? {
                let count = message.len();
                return message.into_frames().into_iter().next().ok_or_else(|| {
                    ClientError::Protocol(ProtocolError::MalformedBody(format!(
                        "depth message has {} frames",
                        count
                    )))
                });
            }

            let n = self.stream.read(&mut self.buf).await?;
            if n == 0 {
                return Err(ClientError::ConnectionClosed);
            }
            self.decoder.extend(&self.buf[..n]);
        }
    }

    /// Waits for the next published message and decompresses it.
    pub async fn next_frame(&mut self) -> Result<DecodedDepthFrame, ClientError> {
        let payload = self.next_message().await?;
        Ok(decode_depth_frame(&payload)?)
    }
}
