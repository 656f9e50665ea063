//! Control connection.

use crate::error::ClientError;
use bytes::Bytes;
use std::time::Duration;
use streamkinect_protocol::{Decoder, Encoder, MePayload, MessageType, Multipart, Reply, Request};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

/// Default read buffer size (8 KiB).
pub const DEFAULT_READ_BUFFER_SIZE: usize = 8 * 1024;

/// Minimum read buffer size (1 KiB).
pub const MIN_READ_BUFFER_SIZE: usize = 1024;

/// Maximum read buffer size (1 MiB).
pub const MAX_READ_BUFFER_SIZE: usize = 1024 * 1024;

/// Splits an endpoint address into host and port.
///
/// Accepts both `tcp://host:port` and bare `host:port`. Bracketed IPv6
/// hosts are unwrapped.
pub fn parse_endpoint_uri(uri: &str) -> Result<(String, u16), ClientError> {
    let rest = match uri.split_once("://") {
        Some(("tcp", rest)) => rest,
        Some(_) => return Err(ClientError::InvalidEndpoint(uri.to_string())),
        None => uri,
    };

    let (host, port) = rest
        .rsplit_once(':')
        .ok_or_else(|| ClientError::InvalidEndpoint(uri.to_string()))?;
    let port: u16 = port
        .parse()
        .map_err(|_| ClientError::InvalidEndpoint(uri.to_string()))?;

    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() {
        return Err(ClientError::InvalidEndpoint(uri.to_string()));
    }

    Ok((host.to_string(), port))
}

/// Connection configuration.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Connection timeout.
    pub connect_timeout: Duration,
    /// Request timeout.
    pub request_timeout: Duration,
    /// Read buffer size for socket reads.
    pub read_buffer_size: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
        }
    }
}

impl ConnectionConfig {
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = size.clamp(MIN_READ_BUFFER_SIZE, MAX_READ_BUFFER_SIZE);
        self
    }
}

/// Opens a TCP connection to `uri` within the configured timeout.
pub(crate) async fn connect_stream(
    uri: &str,
    config: &ConnectionConfig,
) -> Result<TcpStream, ClientError> {
    let (host, port) = parse_endpoint_uri(uri)?;
    tracing::debug!("Connecting to {}:{}...", host, port);

    let stream = tokio::time::timeout(
        config.connect_timeout,
        TcpStream::connect((host.as_str(), port)),
    )
    .await
    .map_err(|_| {
        tracing::debug!("Connection timeout");
        ClientError::Timeout
    })?
    .map_err(|e| {
        tracing::debug!("Connection failed: {}", e);
        ClientError::Io(e)
    })?;

    stream.set_nodelay(true).ok();
    Ok(stream)
}

/// A request/reply connection to a server's control endpoint.
///
/// Requests are strictly sequential: each one waits for its reply before
/// the next can be sent.
pub struct ControlClient {
    config: ConnectionConfig,
    stream: TcpStream,
    decoder: Decoder,
}

impl ControlClient {
    /// Connects to a control endpoint with the default configuration.
    pub async fn connect(uri: &str) -> Result<Self, ClientError> {
        Self::connect_with(uri, ConnectionConfig::default()).await
    }

    pub async fn connect_with(uri: &str, config: ConnectionConfig) -> Result<Self, ClientError> {
        let stream = connect_stream(uri, &config).await?;
        Ok(Self {
            config,
            stream,
            decoder: Decoder::new(),
        })
    }

    /// Checks that the server is alive.
    pub async fn ping(&mut self) -> Result<(), ClientError> {
        self.exchange(MessageType::Ping, MessageType::Pong).await?;
        Ok(())
    }

    /// Asks the server to describe itself and its devices.
    pub async fn who(&mut self) -> Result<MePayload, ClientError> {
        let reply = self.exchange(MessageType::Who, MessageType::Me).await?;
        reply
            .payload_json::<MePayload>()?
            .ok_or(ClientError::MissingPayload)
    }

    /// Sends a request of the given type and returns the raw reply.
    pub async fn request(&mut self, kind: MessageType) -> Result<Reply, ClientError> {
        let encoded = Encoder::encode_request(Request::new(kind))?;
        self.round_trip(&encoded).await
    }

    /// Sends arbitrary frames and returns the raw reply.
    ///
    /// Useful for probing how the server handles malformed requests.
    pub async fn send_frames(&mut self, frames: Vec<Bytes>) -> Result<Reply, ClientError> {
        let encoded = Encoder::encode_message(&Multipart::new(frames))?;
        self.round_trip(&encoded).await
    }

    async fn exchange(
        &mut self,
        request: MessageType,
        expected: MessageType,
    ) -> Result<Reply, ClientError> {
        let reply = self.request(request).await?;
        if reply.is_error() {
            let reason = reply
                .error_reason()
                .unwrap_or_else(|| "unknown error".to_string());
            return Err(ClientError::ServerError(reason));
        }
        if reply.kind != expected {
            return Err(ClientError::UnexpectedReply {
                expected,
                actual: reply.kind,
            });
        }
        Ok(reply)
    }

    async fn round_trip(&mut self, encoded: &[u8]) -> Result<Reply, ClientError> {
        self.stream.write_all(encoded).await?;
        tracing::debug!("Request sent ({} bytes), waiting for reply...", encoded.len());

        let timeout = self.config.request_timeout;
        tokio::time::timeout(timeout, self.read_reply())
            .await
            .map_err(|_| {
                tracing::debug!("Read timeout");
                ClientError::Timeout
            })?
    }

    async fn read_reply(&mut self) -> Result<Reply, ClientError> {
        let mut buf = vec![0u8; self.config.read_buffer_size];

        loop {
            if let Some(reply) = self.decoder.decode_reply()? {
                return Ok(reply);
            }

            let n = self.stream.read(&mut buf).await?;
            if n == 0 {
                tracing::debug!("Connection closed (0 bytes)");
                return Err(ClientError::ConnectionClosed);
            }
            self.decoder.extend(&buf[..n]);
        }
    }

    /// Closes the connection.
    pub async fn close(mut self) -> Result<(), ClientError> {
        self.stream.shutdown().await?;
        Ok(())
    }
}
