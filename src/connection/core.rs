//! Core-NATS connection variant
//!
//! Fire-and-forget semantics: frames carry no redelivery metadata, and an
//! acknowledgement is only possible when the frame has a reply subject, in
//! which case it is an empty respond. Negative acknowledgement and
//! termination are not part of the core protocol.

use super::{Acknowledger, BrokerSubscription, Connection, Delivery, Frame};
use crate::error::{PubSubError, Result};
use async_trait::async_trait;
use futures::StreamExt;
use std::time::Duration;

/// Direct core-NATS connection
pub struct CoreConnection {
    client: async_nats::Client,
}

impl CoreConnection {
    /// Wrap an established client
    pub fn new(client: async_nats::Client) -> Self {
        Self { client }
    }

    /// The underlying NATS client
    pub fn client(&self) -> &async_nats::Client {
        &self.client
    }
}

#[async_trait]
impl Connection for CoreConnection {
    async fn queue_subscribe(
        &self,
        subject: &str,
        queue_group: &str,
    ) -> Result<Box<dyn BrokerSubscription>> {
        let sub = if queue_group.is_empty() {
            self.client.subscribe(subject.to_string()).await
        } else {
            self.client
                .queue_subscribe(subject.to_string(), queue_group.to_string())
                .await
        }
        .map_err(|e| PubSubError::Subscribe {
            subject: subject.to_string(),
            reason: e.to_string(),
        })?;

        Ok(Box::new(CoreSubscription {
            sub,
            client: self.client.clone(),
        }))
    }

    async fn publish(&self, frame: Frame) -> Result<()> {
        let result = if frame.headers.is_empty() {
            self.client
                .publish(frame.subject.clone(), frame.payload)
                .await
        } else {
            self.client
                .publish_with_headers(frame.subject.clone(), frame.headers, frame.payload)
                .await
        };

        result.map_err(|e| PubSubError::Publish {
            subject: frame.subject,
            reason: e.to_string(),
        })
    }

    async fn drain(&self) -> Result<()> {
        self.client
            .drain()
            .await
            .map_err(|e| PubSubError::Drain(e.to_string()))
    }
}

struct CoreSubscription {
    sub: async_nats::Subscriber,
    client: async_nats::Client,
}

#[async_trait]
impl BrokerSubscription for CoreSubscription {
    async fn next(&mut self) -> Option<Delivery> {
        let msg = self.sub.next().await?;
        let frame = frame_from(&msg);
        let acker = CoreAcker {
            client: self.client.clone(),
            reply: frame.reply.clone(),
        };
        Some(Delivery::new(frame, Box::new(acker)))
    }

    async fn unsubscribe(&mut self) -> Result<()> {
        self.sub
            .unsubscribe()
            .await
            .map_err(|e| PubSubError::Subscribe {
                subject: "<unsubscribe>".to_string(),
                reason: e.to_string(),
            })
    }
}

pub(super) fn frame_from(msg: &async_nats::Message) -> Frame {
    Frame {
        subject: msg.subject.to_string(),
        reply: msg.reply.as_ref().map(|r| r.to_string()),
        headers: msg.headers.clone().unwrap_or_default(),
        payload: msg.payload.clone(),
    }
}

struct CoreAcker {
    client: async_nats::Client,
    reply: Option<String>,
}

impl CoreAcker {
    async fn respond(&self) -> Result<()> {
        let reply = self
            .reply
            .as_ref()
            .ok_or(PubSubError::Ack("frame has no reply subject".to_string()))?;
        self.client
            .publish(reply.clone(), bytes::Bytes::new())
            .await
            .map_err(|e| PubSubError::Ack(e.to_string()))
    }
}

#[async_trait]
impl Acknowledger for CoreAcker {
    fn num_delivered(&self) -> Result<u64> {
        Err(PubSubError::Unsupported("delivery metadata"))
    }

    async fn ack(&self) -> Result<()> {
        self.respond().await
    }

    async fn ack_sync(&self) -> Result<()> {
        self.respond().await?;
        self.client
            .flush()
            .await
            .map_err(|e| PubSubError::Ack(e.to_string()))
    }

    async fn nak(&self, _delay: Option<Duration>) -> Result<()> {
        Err(PubSubError::Unsupported("negative acknowledgement"))
    }

    async fn term(&self) -> Result<()> {
        Err(PubSubError::Unsupported("terminate delivery"))
    }
}
