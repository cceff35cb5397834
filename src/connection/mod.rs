//! Broker connection abstraction
//!
//! The subscriber and publisher talk to the broker through the
//! [`Connection`] trait: queue-subscribe, publish, drain, and (for the
//! persistent-stream variant) stream provisioning. Three implementations
//! are provided:
//!
//! - **core** — direct core-NATS connection (fire-and-forget)
//! - **jetstream** — persistent-stream connection with explicit acks
//! - **memory** — in-process broker for testing and single-process use

use crate::error::Result;
use crate::subject::Subjects;
use async_trait::async_trait;
use bytes::Bytes;
use std::time::Duration;

mod core;
mod jetstream;
mod memory;

pub use self::core::CoreConnection;
pub use self::jetstream::JetStreamConnection;
pub use self::memory::MemoryConnection;

/// A broker wire frame
///
/// An empty `reply` means the broker will not accept an acknowledgement
/// for this frame.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Broker routing key
    pub subject: String,

    /// Reply subject acknowledgements are sent to, if any
    pub reply: Option<String>,

    /// Broker headers
    pub headers: async_nats::HeaderMap,

    /// Payload bytes, verbatim
    pub payload: Bytes,
}

impl Frame {
    /// Create a frame with no reply subject and empty headers
    pub fn new(subject: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            subject: subject.into(),
            reply: None,
            headers: async_nats::HeaderMap::new(),
            payload: payload.into(),
        }
    }
}

/// Broker-native acknowledgement operations for one delivered frame
#[async_trait]
pub trait Acknowledger: Send + Sync {
    /// Redelivery counter from the frame's metadata (≥ 1 on first attempt)
    fn num_delivered(&self) -> Result<u64>;

    /// Acknowledge asynchronously
    async fn ack(&self) -> Result<()>;

    /// Acknowledge and wait for the broker to confirm receipt
    async fn ack_sync(&self) -> Result<()>;

    /// Negative-acknowledge, optionally delaying the redelivery
    async fn nak(&self, delay: Option<Duration>) -> Result<()>;

    /// Terminate delivery of this frame permanently
    async fn term(&self) -> Result<()>;
}

/// A frame delivered by the broker, with its acknowledgement handle
pub struct Delivery {
    /// The delivered frame
    pub frame: Frame,

    acker: Box<dyn Acknowledger>,
}

impl Delivery {
    /// Pair a frame with its broker-native acknowledgement operations
    pub fn new(frame: Frame, acker: Box<dyn Acknowledger>) -> Self {
        Self { frame, acker }
    }

    /// Redelivery counter from the frame's metadata
    pub fn num_delivered(&self) -> Result<u64> {
        self.acker.num_delivered()
    }

    /// Acknowledge asynchronously
    pub async fn ack(&self) -> Result<()> {
        self.acker.ack().await
    }

    /// Acknowledge and wait for broker confirmation
    pub async fn ack_sync(&self) -> Result<()> {
        self.acker.ack_sync().await
    }

    /// Negative-acknowledge, optionally delayed
    pub async fn nak(&self, delay: Option<Duration>) -> Result<()> {
        self.acker.nak(delay).await
    }

    /// Terminate delivery permanently
    pub async fn term(&self) -> Result<()> {
        self.acker.term().await
    }
}

/// A native broker subscription feeding one reader
#[async_trait]
pub trait BrokerSubscription: Send + Sync {
    /// Next delivered frame; `None` once the subscription is closed
    async fn next(&mut self) -> Option<Delivery>;

    /// Remove the subscription from the broker
    async fn unsubscribe(&mut self) -> Result<()>;
}

/// Minimal broker capability set consumed by the subscriber and publisher
#[async_trait]
pub trait Connection: Send + Sync {
    /// Install a subscription on `subject`
    ///
    /// An empty `queue_group` subscribes with normal broadcast semantics;
    /// otherwise each message is delivered to exactly one member of the
    /// group.
    async fn queue_subscribe(
        &self,
        subject: &str,
        queue_group: &str,
    ) -> Result<Box<dyn BrokerSubscription>>;

    /// Write one frame to the broker
    async fn publish(&self, frame: Frame) -> Result<()>;

    /// Ensure a stream covering `subjects` exists for `topic`
    ///
    /// Only meaningful for the persistent-stream variant; other
    /// connections report the operation as unsupported.
    async fn ensure_stream(&self, _topic: &str, _subjects: &Subjects) -> Result<()> {
        Err(crate::error::PubSubError::Unsupported("stream provisioning"))
    }

    /// Gracefully close: deliver buffered frames, then sever the connection
    async fn drain(&self) -> Result<()>;
}
