//! JetStream connection variant
//!
//! Composes the core client with a JetStream context. Subscriptions are
//! backed by push consumers bound to a deliver subject the core client
//! queue-subscribes to, so queue-group load balancing is handled by the
//! broker. Streams backing a topic are provisioned on demand via
//! [`ensure_stream`](JetStreamConnection::ensure_stream).

use super::core::frame_from;
use super::{Acknowledger, BrokerSubscription, Connection, Delivery, Frame};
use crate::config::JetStreamConfig;
use crate::error::{PubSubError, Result};
use crate::subject::Subjects;
use async_nats::jetstream;
use async_trait::async_trait;
use futures::StreamExt;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::RwLock;

/// Persistent-stream connection
///
/// Owns the stream-management handle used for auto-provisioning and a
/// registry mapping provisioned subjects to their stream names.
pub struct JetStreamConnection {
    client: async_nats::Client,
    context: jetstream::Context,
    config: JetStreamConfig,
    ack_wait: Duration,
    streams: RwLock<HashMap<String, String>>,
}

impl JetStreamConnection {
    /// Wrap an established client and JetStream context
    pub fn new(
        client: async_nats::Client,
        context: jetstream::Context,
        config: JetStreamConfig,
        ack_wait: Duration,
    ) -> Self {
        Self {
            client,
            context,
            config,
            ack_wait,
            streams: RwLock::new(HashMap::new()),
        }
    }

    /// The persistent-stream settings this connection was built with
    pub fn config(&self) -> &JetStreamConfig {
        &self.config
    }

    async fn resolve_stream_name(&self, subject: &str) -> String {
        if let Some(name) = self.streams.read().await.get(subject) {
            return name.clone();
        }
        // Never provisioned through this connection: fall back to the
        // deterministic topic-derived name. A missing stream surfaces as
        // a Stream error on lookup, pointing the operator at
        // subscribe_initialize.
        stream_name_for_subject(subject)
    }
}

#[async_trait]
impl Connection for JetStreamConnection {
    async fn queue_subscribe(
        &self,
        subject: &str,
        queue_group: &str,
    ) -> Result<Box<dyn BrokerSubscription>> {
        let stream_name = self.resolve_stream_name(subject).await;

        let mut stream = self
            .context
            .get_stream(stream_name.clone())
            .await
            .map_err(|e| PubSubError::Stream(format!(
                "no stream '{}' covering subject '{}' (provision it or enable auto-provision): {}",
                stream_name, subject, e
            )))?;

        let deliver_subject = if queue_group.is_empty() {
            self.client.new_inbox()
        } else {
            format!("_deliver.{}.{}", sanitize(queue_group), sanitize(subject))
        };

        // Interest on the deliver subject must exist before the push
        // consumer, or frames delivered during setup are lost.
        let sub = if queue_group.is_empty() {
            self.client.subscribe(deliver_subject.clone()).await
        } else {
            self.client
                .queue_subscribe(deliver_subject.clone(), queue_group.to_string())
                .await
        }
        .map_err(|e| PubSubError::Subscribe {
            subject: subject.to_string(),
            reason: e.to_string(),
        })?;

        let mut consumer_config = jetstream::consumer::push::Config {
            filter_subject: subject.to_string(),
            ack_policy: jetstream::consumer::AckPolicy::Explicit,
            ack_wait: self.ack_wait,
            deliver_subject,
            ..Default::default()
        };

        let (consumer_name, ephemeral) = if queue_group.is_empty() {
            let consumer = stream
                .create_consumer(consumer_config)
                .await
                .map_err(|e| PubSubError::Consumer(format!(
                    "failed to create ephemeral consumer on '{}': {}",
                    stream_name, e
                )))?;
            (consumer.cached_info().name.clone(), true)
        } else {
            let durable = sanitize(&format!("{}-{}", queue_group, subject));
            consumer_config.durable_name = Some(durable.clone());
            consumer_config.deliver_group = Some(queue_group.to_string());
            stream
                .get_or_create_consumer(&durable, consumer_config)
                .await
                .map_err(|e| PubSubError::Consumer(format!(
                    "failed to create durable consumer '{}': {}",
                    durable, e
                )))?;
            (durable, false)
        };

        tracing::debug!(
            stream = %stream_name,
            consumer = %consumer_name,
            subject = subject,
            queue_group = queue_group,
            "JetStream subscription created"
        );

        Ok(Box::new(JetStreamSubscription {
            sub,
            context: self.context.clone(),
            stream_name,
            ephemeral_consumer: ephemeral.then_some(consumer_name),
        }))
    }

    async fn publish(&self, frame: Frame) -> Result<()> {
        let ack_fut = if frame.headers.is_empty() {
            self.context
                .publish(frame.subject.clone(), frame.payload)
                .await
        } else {
            self.context
                .publish_with_headers(frame.subject.clone(), frame.headers, frame.payload)
                .await
        }
        .map_err(|e| PubSubError::Publish {
            subject: frame.subject.clone(),
            reason: e.to_string(),
        })?;

        let ack = ack_fut.await.map_err(|e| PubSubError::Publish {
            subject: frame.subject.clone(),
            reason: format!("ack failed: {}", e),
        })?;

        tracing::debug!(
            subject = %frame.subject,
            sequence = ack.sequence,
            "Frame published"
        );

        Ok(())
    }

    async fn ensure_stream(&self, topic: &str, subjects: &Subjects) -> Result<()> {
        {
            let known = self.streams.read().await;
            if subjects.all.iter().all(|s| known.contains_key(s)) {
                return Ok(());
            }
        }

        let name = sanitize(topic);
        let stream_config = jetstream::stream::Config {
            name: name.clone(),
            subjects: subjects.all.iter().map(|s| s.clone().into()).collect(),
            ..Default::default()
        };

        self.context
            .get_or_create_stream(stream_config)
            .await
            .map_err(|e| PubSubError::Stream(format!(
                "failed to create/get stream '{}': {}",
                name, e
            )))?;

        let mut known = self.streams.write().await;
        for subject in &subjects.all {
            known.insert(subject.clone(), name.clone());
        }

        tracing::info!(
            stream = %name,
            subjects = ?subjects.all,
            topic = topic,
            "JetStream stream ready"
        );

        Ok(())
    }

    async fn drain(&self) -> Result<()> {
        self.client
            .drain()
            .await
            .map_err(|e| PubSubError::Drain(e.to_string()))
    }
}

struct JetStreamSubscription {
    sub: async_nats::Subscriber,
    context: jetstream::Context,
    stream_name: String,
    ephemeral_consumer: Option<String>,
}

#[async_trait]
impl BrokerSubscription for JetStreamSubscription {
    async fn next(&mut self) -> Option<Delivery> {
        let msg = self.sub.next().await?;
        let frame = frame_from(&msg);
        let acker = JetStreamAcker {
            msg: jetstream::Message {
                message: msg,
                context: self.context.clone(),
            },
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
            })?;

        // Queue-group durables stay so the group keeps its position;
        // an ephemeral consumer is gone for good, delete it eagerly.
        if let Some(name) = self.ephemeral_consumer.take() {
            match self.context.get_stream(self.stream_name.clone()).await {
                Ok(mut stream) => {
                    if let Err(e) = stream.delete_consumer(name.as_str()).await {
                        tracing::warn!(
                            consumer = %name,
                            error = %e,
                            "Failed to delete ephemeral consumer"
                        );
                    }
                }
                Err(e) => {
                    tracing::warn!(
                        stream = %self.stream_name,
                        error = %e,
                        "Failed to look up stream during unsubscribe"
                    );
                }
            }
        }

        Ok(())
    }
}

struct JetStreamAcker {
    msg: jetstream::Message,
}

#[async_trait]
impl Acknowledger for JetStreamAcker {
    fn num_delivered(&self) -> Result<u64> {
        self.msg
            .info()
            .map(|info| info.delivered.max(1) as u64)
            .map_err(|e| PubSubError::Ack(format!("cannot parse delivery metadata: {}", e)))
    }

    async fn ack(&self) -> Result<()> {
        self.msg
            .ack()
            .await
            .map_err(|e| PubSubError::Ack(e.to_string()))
    }

    async fn ack_sync(&self) -> Result<()> {
        self.msg
            .double_ack()
            .await
            .map_err(|e| PubSubError::Ack(e.to_string()))
    }

    async fn nak(&self, delay: Option<Duration>) -> Result<()> {
        self.msg
            .ack_with(jetstream::AckKind::Nak(delay))
            .await
            .map_err(|e| PubSubError::Ack(e.to_string()))
    }

    async fn term(&self) -> Result<()> {
        self.msg
            .ack_with(jetstream::AckKind::Term)
            .await
            .map_err(|e| PubSubError::Ack(e.to_string()))
    }
}

/// Replace characters a stream or consumer name cannot carry
fn sanitize(input: &str) -> String {
    input
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Derive a stream name from a subject by dropping wildcard tokens
fn stream_name_for_subject(subject: &str) -> String {
    let tokens: Vec<&str> = subject
        .split('.')
        .filter(|t| *t != "*" && *t != ">")
        .collect();
    sanitize(&tokens.join("_"))
}
