//! The publisher — thin write-through to the broker
//!
//! Subjects come from the same calculator the subscriber uses, so both
//! sides of a topic agree on routing without coordination.

use crate::config::PublisherConfig;
use crate::connection::{Connection, CoreConnection, JetStreamConnection};
use crate::error::{PubSubError, Result};
use crate::marshaler::Marshaler;
use crate::message::Message;
use crate::subject::SubjectCalculator;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// Subject-based pub/sub publisher
pub struct Publisher {
    conn: Arc<dyn Connection>,
    marshaler: Arc<dyn Marshaler>,
    subject_calculator: Arc<dyn SubjectCalculator>,
    auto_provision: bool,
    provisioned: Mutex<HashSet<String>>,
    closed: AtomicBool,
}

impl Publisher {
    /// Connect to the broker and build a publisher
    pub async fn connect(config: PublisherConfig) -> Result<Self> {
        let marshaler = config.resolved_marshaler();
        let subject_calculator = config.resolved_subject_calculator();

        let options = config.connect_options.unwrap_or_default();
        let client = options
            .connect(&config.url)
            .await
            .map_err(|e| PubSubError::Connection(format!("{}: {}", config.url, e)))?;

        tracing::info!(url = %config.url, "Connected to NATS");

        let conn: Arc<dyn Connection> = if config.jet_stream.enabled {
            let context = match &config.jet_stream.domain {
                Some(domain) => {
                    async_nats::jetstream::with_domain(client.clone(), domain.clone())
                }
                None => async_nats::jetstream::new(client.clone()),
            };
            Arc::new(JetStreamConnection::new(
                client,
                context,
                config.jet_stream.clone(),
                Duration::from_secs(30),
            ))
        } else {
            Arc::new(CoreConnection::new(client))
        };

        Ok(Self::assemble(
            conn,
            marshaler,
            subject_calculator,
            config.jet_stream.enabled && config.jet_stream.auto_provision,
        ))
    }

    /// Build a publisher over an already-established connection
    pub fn with_connection(conn: Arc<dyn Connection>, config: PublisherConfig) -> Self {
        let marshaler = config.resolved_marshaler();
        let subject_calculator = config.resolved_subject_calculator();
        Self::assemble(
            conn,
            marshaler,
            subject_calculator,
            config.jet_stream.enabled && config.jet_stream.auto_provision,
        )
    }

    fn assemble(
        conn: Arc<dyn Connection>,
        marshaler: Arc<dyn Marshaler>,
        subject_calculator: Arc<dyn SubjectCalculator>,
        auto_provision: bool,
    ) -> Self {
        Self {
            conn,
            marshaler,
            subject_calculator,
            auto_provision,
            provisioned: Mutex::new(HashSet::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// Publish messages to a topic
    ///
    /// Each message is marshalled into a frame addressed to the
    /// calculator's primary subject and written through the connection.
    /// Broker write errors are returned as-is; earlier messages of the
    /// same call stay published.
    pub async fn publish(&self, topic: &str, messages: &[Message]) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(PubSubError::Connection("publisher is closed".to_string()));
        }

        let subjects = self.subject_calculator.subjects(topic);

        if self.auto_provision {
            let mut provisioned = self.provisioned.lock().await;
            if !provisioned.contains(topic) {
                self.conn.ensure_stream(topic, &subjects).await?;
                provisioned.insert(topic.to_string());
            }
        }

        for msg in messages {
            let frame = self.marshaler.marshal(&subjects.primary, msg)?;
            self.conn.publish(frame).await?;

            tracing::trace!(
                topic = topic,
                subject = %subjects.primary,
                message_uuid = %msg.uuid,
                "Message published"
            );
        }

        Ok(())
    }

    /// Close the publisher and drain the underlying connection
    ///
    /// Idempotent: a second call returns success without draining again.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.conn.drain().await?;
        tracing::debug!("Publisher closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::MemoryConnection;

    fn memory_publisher() -> Publisher {
        let conn = MemoryConnection::default();
        Publisher::with_connection(Arc::new(conn), PublisherConfig::default())
    }

    #[tokio::test]
    async fn publish_after_close_is_rejected() {
        let publisher = memory_publisher();
        publisher.close().await.unwrap();

        let err = publisher
            .publish("orders", &[Message::new("id", "p")])
            .await
            .unwrap_err();
        assert!(matches!(err, PubSubError::Connection(_)));
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let publisher = memory_publisher();
        assert!(publisher.close().await.is_ok());
        assert!(publisher.close().await.is_ok());
    }

    #[tokio::test]
    async fn publish_with_no_subscribers_succeeds() {
        let publisher = memory_publisher();
        publisher
            .publish("orders", &[Message::new("id", "p")])
            .await
            .unwrap();
    }
}
