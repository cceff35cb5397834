//! Message ↔ frame marshalling
//!
//! A marshaller/unmarshaller pair must be round-trip inverses:
//! `unmarshal(marshal(m)) ≡ m` on UUID, payload, and non-reserved
//! headers. Publisher and subscriber must be configured with matching
//! variants.

use crate::connection::Frame;
use crate::error::{PubSubError, Result};
use crate::message::Message;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Reserved header carrying the message UUID across the wire
pub const UUID_HEADER: &str = "Pubsub-Msg-Uuid";

/// Turns an application message into a broker frame
pub trait Marshaler: Send + Sync {
    fn marshal(&self, subject: &str, msg: &Message) -> Result<Frame>;
}

/// Turns a broker frame back into an application message
pub trait Unmarshaler: Send + Sync {
    fn unmarshal(&self, frame: &Frame) -> Result<Message>;
}

/// Default marshaller: UUID in a reserved header, headers mapped natively,
/// payload verbatim
///
/// Frames arriving without the reserved header get a freshly generated
/// UUID, so foreign publishers interoperate.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeaderMarshaler;

impl Marshaler for HeaderMarshaler {
    fn marshal(&self, subject: &str, msg: &Message) -> Result<Frame> {
        let mut headers = async_nats::HeaderMap::new();
        headers.insert(UUID_HEADER, msg.uuid.as_str());
        for (key, value) in &msg.headers {
            headers.insert(key.as_str(), value.as_str());
        }

        Ok(Frame {
            subject: subject.to_string(),
            reply: None,
            headers,
            payload: msg.payload.clone(),
        })
    }
}

impl Unmarshaler for HeaderMarshaler {
    fn unmarshal(&self, frame: &Frame) -> Result<Message> {
        let uuid = frame
            .headers
            .get(UUID_HEADER)
            .map(|v| v.as_str().to_string())
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        let mut msg = Message::new(uuid, frame.payload.clone());
        for (name, values) in frame.headers.iter() {
            let name = name.to_string();
            if name == UUID_HEADER {
                continue;
            }
            if let Some(value) = values.first() {
                msg.headers.insert(name, value.as_str().to_string());
            }
        }

        Ok(msg)
    }
}

/// JSON-envelope marshaller
///
/// Serializes the whole message as a JSON object, leaving broker headers
/// untouched. Use when payloads must be inspectable with stock broker
/// tooling.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonMarshaler;

#[derive(Serialize, Deserialize)]
struct Envelope {
    uuid: String,
    #[serde(default)]
    headers: HashMap<String, String>,
    payload: Vec<u8>,
}

impl Marshaler for JsonMarshaler {
    fn marshal(&self, subject: &str, msg: &Message) -> Result<Frame> {
        let envelope = Envelope {
            uuid: msg.uuid.clone(),
            headers: msg.headers.clone(),
            payload: msg.payload.to_vec(),
        };
        let payload = serde_json::to_vec(&envelope)?;

        Ok(Frame::new(subject, payload))
    }
}

impl Unmarshaler for JsonMarshaler {
    fn unmarshal(&self, frame: &Frame) -> Result<Message> {
        let envelope: Envelope = serde_json::from_slice(&frame.payload).map_err(|e| {
            PubSubError::Marshal(format!("frame payload is not a message envelope: {}", e))
        })?;

        let mut msg = Message::new(envelope.uuid, envelope.payload);
        msg.headers = envelope.headers;
        Ok(msg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_message() -> Message {
        Message::new("3415c1c2-087e-4d32-b2d9-d62ba4f02bf7", "Hello, world!")
            .with_header("source", "checkout")
            .with_header("trace", "abc123")
    }

    #[test]
    fn header_marshaler_round_trip() {
        let msg = sample_message();
        let frame = HeaderMarshaler.marshal("orders.*", &msg).unwrap();
        assert_eq!(frame.subject, "orders.*");

        let back = HeaderMarshaler.unmarshal(&frame).unwrap();
        assert_eq!(back.uuid, msg.uuid);
        assert_eq!(back.payload, msg.payload);
        assert_eq!(back.headers, msg.headers);
    }

    #[test]
    fn header_marshaler_strips_reserved_header() {
        let msg = sample_message();
        let frame = HeaderMarshaler.marshal("t", &msg).unwrap();
        let back = HeaderMarshaler.unmarshal(&frame).unwrap();
        assert!(!back.headers.contains_key(UUID_HEADER));
    }

    #[test]
    fn header_unmarshal_generates_uuid_when_absent() {
        let frame = Frame::new("t.x", "raw bytes from a foreign publisher");
        let msg = HeaderMarshaler.unmarshal(&frame).unwrap();
        assert!(uuid::Uuid::parse_str(&msg.uuid).is_ok());
        assert_eq!(msg.payload.as_ref(), b"raw bytes from a foreign publisher");
    }

    #[test]
    fn json_marshaler_round_trip() {
        let msg = sample_message();
        let frame = JsonMarshaler.marshal("orders.*", &msg).unwrap();

        let back = JsonMarshaler.unmarshal(&frame).unwrap();
        assert_eq!(back.uuid, msg.uuid);
        assert_eq!(back.payload, msg.payload);
        assert_eq!(back.headers, msg.headers);
    }

    #[test]
    fn json_marshaler_rejects_garbage() {
        let frame = Frame::new("t.x", "not json");
        let err = JsonMarshaler.unmarshal(&frame).unwrap_err();
        assert!(matches!(err, PubSubError::Marshal(_)));
    }

    #[test]
    fn json_envelope_is_inspectable() {
        let msg = sample_message();
        let frame = JsonMarshaler.marshal("t", &msg).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&frame.payload).unwrap();
        assert_eq!(value["uuid"], msg.uuid.as_str());
        assert_eq!(value["headers"]["source"], "checkout");
    }

    #[test]
    fn empty_payload_round_trips() {
        let msg = Message::new("id-1", bytes::Bytes::new());
        for (marshal, unmarshal) in [
            (
                &HeaderMarshaler as &dyn Marshaler,
                &HeaderMarshaler as &dyn Unmarshaler,
            ),
            (
                &JsonMarshaler as &dyn Marshaler,
                &JsonMarshaler as &dyn Unmarshaler,
            ),
        ] {
            let frame = marshal.marshal("t", &msg).unwrap();
            let back = unmarshal.unmarshal(&frame).unwrap();
            assert_eq!(back.uuid, "id-1");
            assert!(back.payload.is_empty());
        }
    }
}
