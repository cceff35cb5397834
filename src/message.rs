//! Application-facing message type
//!
//! A `Message` carries a UUID, an opaque payload, string headers, a
//! settable cancellation context, and a one-shot acknowledgement pair.
//! Clones share the acknowledgement state — acking any clone settles the
//! message for all of them.

use bytes::Bytes;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// The consumer's verdict on a message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acknowledgment {
    /// Processed successfully
    Ack,
    /// Rejected; request redelivery
    Nack,
}

/// A message flowing between publisher and subscriber
///
/// The acknowledgement is one-shot and mutually exclusive: the first of
/// [`ack`](Message::ack) / [`nack`](Message::nack) wins and later calls
/// report `false`.
#[derive(Clone)]
pub struct Message {
    /// Unique message identifier
    pub uuid: String,

    /// Opaque payload bytes
    pub payload: Bytes,

    /// String headers; keys are unique, order is irrelevant
    pub headers: HashMap<String, String>,

    context: CancellationToken,
    ack: Arc<watch::Sender<Option<Acknowledgment>>>,
}

impl Message {
    /// Create a message with the given UUID and payload
    pub fn new(uuid: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        let (tx, _rx) = watch::channel(None);
        Self {
            uuid: uuid.into(),
            payload: payload.into(),
            headers: HashMap::new(),
            context: CancellationToken::new(),
            ack: Arc::new(tx),
        }
    }

    /// Create a message with a freshly generated v4 UUID
    pub fn with_generated_uuid(payload: impl Into<Bytes>) -> Self {
        Self::new(uuid::Uuid::new_v4().to_string(), payload)
    }

    /// Add a header entry
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    /// Acknowledge successful processing
    ///
    /// Returns `false` if the message was already acked or nacked.
    pub fn ack(&self) -> bool {
        self.signal(Acknowledgment::Ack)
    }

    /// Reject the message, requesting redelivery
    ///
    /// Returns `false` if the message was already acked or nacked.
    pub fn nack(&self) -> bool {
        self.signal(Acknowledgment::Nack)
    }

    /// The cancellation context attached to this message
    ///
    /// The subscriber cancels it when the per-message coordination ends,
    /// whatever the outcome.
    pub fn context(&self) -> &CancellationToken {
        &self.context
    }

    /// Replace the cancellation context
    pub fn set_context(&mut self, context: CancellationToken) {
        self.context = context;
    }

    fn signal(&self, verdict: Acknowledgment) -> bool {
        self.ack.send_if_modified(|state| {
            if state.is_none() {
                *state = Some(verdict);
                true
            } else {
                false
            }
        })
    }

    pub(crate) fn ack_handle(&self) -> AckHandle {
        AckHandle {
            rx: self.ack.subscribe(),
        }
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("uuid", &self.uuid)
            .field("payload_len", &self.payload.len())
            .field("headers", &self.headers)
            .finish()
    }
}

/// Subscriber-side observer of the acknowledgement signal
pub(crate) struct AckHandle {
    rx: watch::Receiver<Option<Acknowledgment>>,
}

impl AckHandle {
    /// Wait for the first acknowledgement signal
    ///
    /// Returns `None` when every clone of the message was dropped without
    /// a verdict.
    pub(crate) async fn wait(mut self) -> Option<Acknowledgment> {
        match self.rx.wait_for(|state| state.is_some()).await {
            Ok(state) => *state,
            Err(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_creation() {
        let msg = Message::new("id-1", "hello")
            .with_header("kind", "greeting")
            .with_header("region", "eu");

        assert_eq!(msg.uuid, "id-1");
        assert_eq!(msg.payload.as_ref(), b"hello");
        assert_eq!(msg.headers.len(), 2);
        assert_eq!(msg.headers["kind"], "greeting");
    }

    #[test]
    fn generated_uuid_is_populated() {
        let msg = Message::with_generated_uuid("x");
        assert!(!msg.uuid.is_empty());
        assert!(uuid::Uuid::parse_str(&msg.uuid).is_ok());
    }

    #[test]
    fn first_signal_wins() {
        let msg = Message::new("id", "p");
        assert!(msg.ack());
        assert!(!msg.ack());
        assert!(!msg.nack());
    }

    #[test]
    fn nack_excludes_ack() {
        let msg = Message::new("id", "p");
        assert!(msg.nack());
        assert!(!msg.ack());
    }

    #[test]
    fn clones_share_ack_state() {
        let msg = Message::new("id", "p");
        let clone = msg.clone();
        assert!(clone.ack());
        assert!(!msg.ack());
    }

    #[tokio::test]
    async fn handle_observes_ack() {
        let msg = Message::new("id", "p");
        let handle = msg.ack_handle();
        msg.ack();
        assert_eq!(handle.wait().await, Some(Acknowledgment::Ack));
    }

    #[tokio::test]
    async fn handle_observes_nack() {
        let msg = Message::new("id", "p");
        let handle = msg.ack_handle();
        msg.nack();
        assert_eq!(handle.wait().await, Some(Acknowledgment::Nack));
    }

    #[tokio::test]
    async fn handle_sees_drop_without_verdict() {
        let msg = Message::new("id", "p");
        let handle = msg.ack_handle();
        drop(msg);
        assert_eq!(handle.wait().await, None);
    }

    #[tokio::test]
    async fn handle_observes_signal_sent_before_wait() {
        let msg = Message::new("id", "p");
        msg.ack();
        let handle = msg.ack_handle();
        assert_eq!(handle.wait().await, Some(Acknowledgment::Ack));
    }
}
