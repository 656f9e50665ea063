//! Control request dispatch.

use crate::error::ServerError;
use std::sync::Arc;
use streamkinect_protocol::{MePayload, MessageType, Multipart, Reply, Request};

/// Produces the server self-description answered to WHO.
pub trait DescriptorSource: Send + Sync {
    fn describe(&self) -> Result<MePayload, ServerError>;
}

/// Validates control requests and produces exactly one reply for each.
pub struct ControlHandler {
    source: Arc<dyn DescriptorSource>,
}

impl ControlHandler {
    pub fn new(source: Arc<dyn DescriptorSource>) -> Self {
        Self { source }
    }

    /// Handles one received message.
    pub fn handle(&self, message: &Multipart) -> Reply {
        let request = match Request::parse(message) {
            Ok(request) => request,
            Err(e) => {
                tracing::debug!("Rejecting request: {}", e);
                return Reply::error(e.to_string());
            }
        };

        match request.kind {
            MessageType::Ping => Reply::new(MessageType::Pong),
            MessageType::Who => self.handle_who(),
            other => {
                tracing::debug!("Unexpected request type {}", other);
                Reply::error("Unknown message")
            }
        }
    }

    fn handle_who(&self) -> Reply {
        let descriptor = match self.source.describe() {
            Ok(descriptor) => descriptor,
            Err(e) => {
                tracing::warn!("Failed to describe server: {}", e);
                return Reply::error(e.to_string());
            }
        };

        match Reply::with_json(MessageType::Me, &descriptor) {
            Ok(reply) => reply,
            Err(e) => Reply::error(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use streamkinect_protocol::{DeviceRecord, CONTROL_ENDPOINT, DEPTH_ENDPOINT};

    struct StubSource {
        devices: usize,
        calls: AtomicUsize,
    }

    impl DescriptorSource for StubSource {
        fn describe(&self) -> Result<MePayload, ServerError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut me = MePayload::new("stub").with_endpoint(CONTROL_ENDPOINT, "tcp://stub:1");
            for i in 0..self.devices {
                me.devices.push(
                    DeviceRecord::new(format!("dev-{}", i))
                        .with_endpoint(DEPTH_ENDPOINT, format!("tcp://stub:{}", 100 + i)),
                );
            }
            Ok(me)
        }
    }

    struct FailingSource;

    impl DescriptorSource for FailingSource {
        fn describe(&self) -> Result<MePayload, ServerError> {
            Err(ServerError::InvalidState("not running"))
        }
    }

    fn handler(devices: usize) -> (ControlHandler, Arc<StubSource>) {
        let source = Arc::new(StubSource {
            devices,
            calls: AtomicUsize::new(0),
        });
        (ControlHandler::new(source.clone()), source)
    }

    fn message(frames: &[&[u8]]) -> Multipart {
        Multipart::new(frames.iter().map(|f| Bytes::copy_from_slice(f)).collect())
    }

    fn reason(reply: &Reply) -> String {
        assert_eq!(reply.kind, MessageType::Error);
        reply.error_reason().unwrap()
    }

    #[test]
    fn test_ping_replies_pong_without_payload() {
        let (handler, source) = handler(0);
        let reply = handler.handle(&message(&[&[0x01]]));
        assert_eq!(reply.kind, MessageType::Pong);
        assert!(reply.payload.is_none());
        assert_eq!(source.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_ping_with_payload_frame_still_pongs() {
        let (handler, _) = handler(0);
        let reply = handler.handle(&message(&[&[0x01], b"ignored"]));
        assert_eq!(reply.kind, MessageType::Pong);
    }

    #[test]
    fn test_who_replies_me() {
        let (handler, source) = handler(2);
        let reply = handler.handle(&message(&[&[0x03]]));
        assert_eq!(reply.kind, MessageType::Me);

        let me: MePayload = reply.payload_json().unwrap().unwrap();
        assert_eq!(me.version, 1);
        assert_eq!(me.name, "stub");
        assert_eq!(me.devices.len(), 2);
        assert_eq!(me.control_endpoint(), Some("tcp://stub:1"));
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_invalid_frame_counts() {
        let (handler, _) = handler(0);
        assert_eq!(
            reason(&handler.handle(&message(&[]))),
            "Invalid message length of 0."
        );
        assert_eq!(
            reason(&handler.handle(&message(&[&[0x01], b"a", b"b"]))),
            "Invalid message length of 3."
        );
    }

    #[test]
    fn test_invalid_type_frame_length() {
        let (handler, _) = handler(0);
        assert_eq!(
            reason(&handler.handle(&message(&[&[0x01, 0x03]]))),
            "Message type frame has invalid length: 2"
        );
    }

    #[test]
    fn test_unknown_type_byte() {
        let (handler, _) = handler(0);
        assert_eq!(
            reason(&handler.handle(&message(&[&[0x07]]))),
            "Unknown message type: 7"
        );
    }

    #[test]
    fn test_known_but_unexpected_types() {
        let (handler, _) = handler(0);
        for byte in [0x00u8, 0x02, 0x04, 0xFF] {
            let reply = handler.handle(&message(&[&[byte]]));
            assert_eq!(reason(&reply), "Unknown message");
        }
    }

    #[test]
    fn test_describe_failure_is_error_reply() {
        let handler = ControlHandler::new(Arc::new(FailingSource));
        let reply = handler.handle(&message(&[&[0x03]]));
        assert!(!reason(&reply).is_empty());
    }
}
