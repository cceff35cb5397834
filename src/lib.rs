//! # nats-pubsub
//!
//! Pub/sub adapter bridging a generic in-process message abstraction to
//! NATS, in both core (fire-and-forget) and JetStream
//! (persistent-streaming) modes.
//!
//! ## Overview
//!
//! Two collaborating endpoints translate between the application's
//! "message with headers, payload, acknowledgement" abstraction and the
//! broker's native frames:
//!
//! - **[`Publisher`]** — marshals messages and writes them to the
//!   subject derived from the topic
//! - **[`Subscriber`]** — fans broker deliveries into consumer-owned
//!   channels and coordinates per-message acknowledgement against the
//!   consumer, a redelivery timeout, shutdown, and cancellation
//!
//! ## Quick Start
//!
//! ```rust
//! use nats_pubsub::{
//!     Message, MemoryConnection, Publisher, PublisherConfig, Subscriber,
//!     SubscriptionConfig,
//! };
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> nats_pubsub::Result<()> {
//! // In-process broker; use Subscriber::connect / Publisher::connect
//! // against a real NATS server.
//! let conn = MemoryConnection::default();
//!
//! let subscriber =
//!     Subscriber::with_connection(Arc::new(conn.clone()), SubscriptionConfig::default())?;
//! let mut messages = subscriber
//!     .subscribe(CancellationToken::new(), "example_topic")
//!     .await?;
//!
//! let publisher = Publisher::with_connection(Arc::new(conn), PublisherConfig::default());
//! publisher
//!     .publish("example_topic", &[Message::with_generated_uuid("Hello, world!")])
//!     .await?;
//!
//! if let Some(msg) = messages.recv().await {
//!     println!("received {}: {:?}", msg.uuid, msg.payload);
//!     msg.ack();
//! }
//!
//! subscriber.close().await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - **[`Connection`]** trait — minimal broker capability set with core,
//!   JetStream, and in-memory implementations
//! - **[`SubjectCalculator`]** — topic-to-subject mapping shared by both
//!   endpoints (default: `"{topic}.*"`)
//! - **[`Marshaler`]/[`Unmarshaler`]** — round-trip message ↔ frame
//!   conversion
//! - **[`Delay`]** — negative-acknowledgement delay policies, with a
//!   [`STOP_TIME`] sentinel that terminates delivery

pub mod config;
pub mod connection;
pub mod delay;
pub mod error;
pub mod marshaler;
pub mod message;
pub mod publisher;
pub mod subject;
pub mod subscriber;

// Re-export core types
pub use config::{JetStreamConfig, PublisherConfig, SubscriberConfig, SubscriptionConfig};
pub use connection::{
    Acknowledger, BrokerSubscription, Connection, CoreConnection, Delivery, Frame,
    JetStreamConnection, MemoryConnection,
};
pub use delay::{BackoffDelay, Delay, MaxAttemptsDelay, StaticDelay, STOP_TIME};
pub use error::{PubSubError, Result};
pub use marshaler::{HeaderMarshaler, JsonMarshaler, Marshaler, Unmarshaler, UUID_HEADER};
pub use message::{Acknowledgment, Message};
pub use publisher::Publisher;
pub use subject::{DefaultSubjectCalculator, SubjectCalculator, Subjects};
pub use subscriber::Subscriber;
