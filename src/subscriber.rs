//! The subscriber — the heart of the adapter
//!
//! Fans broker deliveries into consumer-owned channels and coordinates
//! each message's acknowledgement against four concurrent signals: the
//! consumer's ack/nack, the ack-wait timer, subscriber shutdown, and
//! the subscribe call's cancellation context.

use crate::config::{SubscriberConfig, SubscriptionConfig};
use crate::connection::{BrokerSubscription, Connection, CoreConnection, Delivery, JetStreamConnection};
use crate::delay::{Delay, STOP_TIME};
use crate::error::{PubSubError, Result};
use crate::marshaler::Unmarshaler;
use crate::message::{Acknowledgment, Message};
use crate::subject::SubjectCalculator;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// Subject-based pub/sub subscriber
///
/// Each [`subscribe`](Subscriber::subscribe) call returns its own
/// delivery channel fed by `subscribers_count` concurrent native
/// subscriptions. The channel has capacity one: a slow consumer exerts
/// backpressure on the broker reader, which stops acking, which makes
/// the broker redeliver after the ack-wait — at-least-once delivery
/// falls out of the plumbing.
///
/// Delivery guarantees:
/// - messages are delivered at least once; exactly-once only with
///   `ack_sync` on top of a persistent stream
/// - order is guaranteed with a single subscriber, never across
///   subscribers
/// - core mode is not persistent: new subscribers do not receive old
///   messages
pub struct Subscriber {
    conn: Arc<dyn Connection>,
    config: SubscriptionConfig,
    unmarshaler: Arc<dyn Unmarshaler>,
    subject_calculator: Arc<dyn SubjectCalculator>,
    closed: RwLock<bool>,
    closing: CancellationToken,
    outputs: TaskTracker,
}

impl std::fmt::Debug for Subscriber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscriber")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Subscriber {
    /// Connect to the broker and build a subscriber
    ///
    /// When JetStream is enabled the connection is wrapped in the
    /// persistent-stream variant.
    pub async fn connect(config: SubscriberConfig) -> Result<Self> {
        let mut sub_config = config.subscription_config();
        sub_config.set_defaults();
        sub_config.validate()?;

        let options = config.connect_options.unwrap_or_default();
        let client = options
            .connect(&config.url)
            .await
            .map_err(|e| PubSubError::Connection(format!("{}: {}", config.url, e)))?;

        tracing::info!(url = %config.url, "Connected to NATS");

        let conn: Arc<dyn Connection> = if sub_config.jet_stream.enabled {
            let context = match &sub_config.jet_stream.domain {
                Some(domain) => {
                    async_nats::jetstream::with_domain(client.clone(), domain.clone())
                }
                None => async_nats::jetstream::new(client.clone()),
            };
            Arc::new(JetStreamConnection::new(
                client,
                context,
                sub_config.jet_stream.clone(),
                sub_config.ack_wait_timeout,
            ))
        } else {
            Arc::new(CoreConnection::new(client))
        };

        Self::build(conn, sub_config)
    }

    /// Build a subscriber over an already-established connection
    pub fn with_connection(
        conn: Arc<dyn Connection>,
        mut config: SubscriptionConfig,
    ) -> Result<Self> {
        config.set_defaults();
        config.validate()?;
        Self::build(conn, config)
    }

    fn build(conn: Arc<dyn Connection>, config: SubscriptionConfig) -> Result<Self> {
        let unmarshaler = config.resolved_unmarshaler();
        let subject_calculator = config.resolved_subject_calculator();

        Ok(Self {
            conn,
            config,
            unmarshaler,
            subject_calculator,
            closed: RwLock::new(false),
            closing: CancellationToken::new(),
            outputs: TaskTracker::new(),
        })
    }

    /// Subscribe to a topic
    ///
    /// Returns the delivery channel for this call and registers
    /// `subscribers_count` native subscriptions feeding it. The channel
    /// closes once all of them have terminated — on
    /// [`close`](Subscriber::close) or when `ctx` is cancelled.
    ///
    /// On a mid-call subscribe failure the already-registered
    /// subscriptions of this call are left running and the error is
    /// returned; call [`close`](Subscriber::close) to reclaim them.
    pub async fn subscribe(
        &self,
        ctx: CancellationToken,
        topic: &str,
    ) -> Result<mpsc::Receiver<Message>> {
        let (tx, rx) = mpsc::channel(1);
        let inner = TaskTracker::new();
        let mut subscribe_err = None;

        for i in 0..self.config.subscribers_count {
            tracing::debug!(subscriber_num = i, topic = topic, "Starting subscriber");

            if let Err(e) = self
                .start_subscription(i, topic, &ctx, tx.clone(), &inner)
                .await
            {
                subscribe_err = Some(e);
                break;
            }
        }

        inner.close();

        // The finisher ties this call into the subscriber-wide tracker
        // and owns the last sender: the channel closes exactly once,
        // after every reader of this call has exited.
        let topic_owned = topic.to_string();
        self.outputs.spawn(async move {
            inner.wait().await;
            drop(tx);
            tracing::debug!(topic = %topic_owned, "Delivery channel closed");
        });

        match subscribe_err {
            Some(e) => Err(e),
            None => Ok(rx),
        }
    }

    /// Ensure the stream backing `topic` exists (persistent mode)
    pub async fn subscribe_initialize(&self, topic: &str) -> Result<()> {
        let subjects = self.subject_calculator.subjects(topic);
        self.conn.ensure_stream(topic, &subjects).await
    }

    async fn start_subscription(
        &self,
        subscriber_num: usize,
        topic: &str,
        ctx: &CancellationToken,
        output: mpsc::Sender<Message>,
        inner: &TaskTracker,
    ) -> Result<()> {
        let subjects = self.subject_calculator.subjects(topic);

        if self.config.jet_stream.enabled && self.config.jet_stream.auto_provision {
            self.conn.ensure_stream(topic, &subjects).await?;
        }

        let sub = tokio::time::timeout(
            self.config.subscribe_timeout,
            self.conn
                .queue_subscribe(&subjects.primary, &self.config.queue_group),
        )
        .await
        .map_err(|_| PubSubError::Timeout(format!("subscribe to '{}'", subjects.primary)))??;

        let worker = SubscriptionWorker {
            sub,
            output,
            closing: self.closing.clone(),
            ctx: ctx.clone(),
            unmarshaler: self.unmarshaler.clone(),
            ack_sync: self.config.ack_sync,
            ack_wait_timeout: self.config.ack_wait_timeout,
            nak_delay: self.config.nak_delay.clone(),
            subscriber_num,
            topic: topic.to_string(),
        };
        inner.spawn(worker.run());

        Ok(())
    }

    /// Close the subscriber
    ///
    /// Blocks new deliveries, waits up to `close_timeout` for in-flight
    /// message coordinations to finish, then drains the connection.
    /// Idempotent: a second call returns success immediately.
    pub async fn close(&self) -> Result<()> {
        let mut closed = self.closed.write().await;
        if *closed {
            return Ok(());
        }
        *closed = true;

        tracing::debug!("Closing subscriber");

        self.closing.cancel();
        self.outputs.close();

        if tokio::time::timeout(self.config.close_timeout, self.outputs.wait())
            .await
            .is_err()
        {
            return Err(PubSubError::CloseTimeout(self.config.close_timeout));
        }

        self.conn.drain().await?;

        tracing::info!("Subscriber closed");
        Ok(())
    }
}

/// One native subscription's reader
///
/// Pulls deliveries and runs the per-message coordination protocol
/// serially. Never acks on the broker's behalf: every decision flows
/// through the consumer's signal, the timer, or shutdown.
struct SubscriptionWorker {
    sub: Box<dyn BrokerSubscription>,
    output: mpsc::Sender<Message>,
    closing: CancellationToken,
    ctx: CancellationToken,
    unmarshaler: Arc<dyn Unmarshaler>,
    ack_sync: bool,
    ack_wait_timeout: Duration,
    nak_delay: Option<Arc<dyn Delay>>,
    subscriber_num: usize,
    topic: String,
}

impl SubscriptionWorker {
    async fn run(mut self) {
        loop {
            tokio::select! {
                _ = self.closing.cancelled() => break,
                _ = self.ctx.cancelled() => break,
                delivery = self.sub.next() => match delivery {
                    Some(delivery) => self.process_delivery(delivery).await,
                    None => break,
                },
            }
        }

        if let Err(e) = self.sub.unsubscribe().await {
            tracing::error!(
                subscriber_num = self.subscriber_num,
                topic = %self.topic,
                error = %e,
                "Cannot unsubscribe"
            );
        }
    }

    async fn process_delivery(&self, delivery: Delivery) {
        tracing::trace!(
            subscriber_num = self.subscriber_num,
            topic = %self.topic,
            subject = %delivery.frame.subject,
            "Received frame"
        );

        let mut msg = match self.unmarshaler.unmarshal(&delivery.frame) {
            Ok(msg) => msg,
            Err(e) => {
                // No ack: the broker redelivers after its ack-wait.
                tracing::error!(
                    subscriber_num = self.subscriber_num,
                    topic = %self.topic,
                    error = %e,
                    "Cannot unmarshal message, dropping frame"
                );
                return;
            }
        };

        let uuid = msg.uuid.clone();
        tracing::trace!(
            subscriber_num = self.subscriber_num,
            topic = %self.topic,
            message_uuid = %uuid,
            "Unmarshaled message"
        );

        let child = self.ctx.child_token();
        msg.set_context(child.clone());
        let _cancel_on_exit = child.clone().drop_guard();

        let ack_handle = msg.ack_handle();
        let ack_timer = tokio::time::sleep(self.ack_wait_timeout);
        tokio::pin!(ack_timer);

        if self.closing.is_cancelled() {
            return;
        }

        // Handoff: either the consumer takes the message or shutdown or
        // cancellation discards it.
        tokio::select! {
            _ = self.closing.cancelled() => {
                tracing::trace!(message_uuid = %uuid, "Closing, message discarded");
                return;
            }
            _ = child.cancelled() => {
                tracing::trace!(message_uuid = %uuid, "Context cancelled, message discarded");
                return;
            }
            sent = self.output.send(msg) => {
                if sent.is_err() {
                    tracing::trace!(message_uuid = %uuid, "Consumer gone, message discarded");
                    return;
                }
                tracing::trace!(message_uuid = %uuid, "Message sent to consumer");
            }
        }

        // Ack: first signal wins; a fired timer or shutdown leaves the
        // frame un-acked so the broker's own redelivery takes over.
        tokio::select! {
            verdict = ack_handle.wait() => match verdict {
                Some(Acknowledgment::Ack) => self.send_ack(&delivery, &uuid).await,
                Some(Acknowledgment::Nack) => self.send_nak(&delivery, &uuid).await,
                None => {
                    tracing::trace!(message_uuid = %uuid, "Message dropped without a verdict");
                }
            },
            _ = &mut ack_timer => {
                tracing::trace!(message_uuid = %uuid, "Ack timeout");
            }
            _ = self.closing.cancelled() => {
                tracing::trace!(message_uuid = %uuid, "Closing, message discarded before ack");
            }
            _ = child.cancelled() => {
                tracing::trace!(message_uuid = %uuid, "Context cancelled before ack");
            }
        }
    }

    async fn send_ack(&self, delivery: &Delivery, uuid: &str) {
        if delivery.frame.reply.is_none() {
            tracing::trace!(message_uuid = uuid, "Ack without a reply subject is a no-op");
            return;
        }

        let result = if self.ack_sync {
            delivery.ack_sync().await
        } else {
            delivery.ack().await
        };

        match result {
            Ok(()) => tracing::trace!(message_uuid = uuid, "Message acked"),
            Err(e) => tracing::error!(
                subscriber_num = self.subscriber_num,
                topic = %self.topic,
                message_uuid = uuid,
                error = %e,
                "Cannot send ack"
            ),
        }
    }

    async fn send_nak(&self, delivery: &Delivery, uuid: &str) {
        if delivery.frame.reply.is_none() {
            tracing::trace!(message_uuid = uuid, "Ignoring nack without a reply subject");
            return;
        }

        let mut nak_delay = Duration::ZERO;
        let mut retry_num = None;

        if let Some(policy) = &self.nak_delay {
            match delivery.num_delivered() {
                Ok(num) => {
                    nak_delay = policy.wait_time(num);
                    retry_num = Some(num);
                }
                Err(e) => tracing::error!(
                    subscriber_num = self.subscriber_num,
                    topic = %self.topic,
                    message_uuid = uuid,
                    error = %e,
                    "Cannot read delivery metadata, nak without delay"
                ),
            }
        }

        if nak_delay == STOP_TIME {
            match delivery.term().await {
                Ok(()) => tracing::trace!(
                    message_uuid = uuid,
                    retry_num = retry_num,
                    "Message termed by delay policy"
                ),
                Err(e) => tracing::error!(
                    subscriber_num = self.subscriber_num,
                    topic = %self.topic,
                    message_uuid = uuid,
                    error = %e,
                    "Cannot send term"
                ),
            }
            return;
        }

        let result = if nak_delay > Duration::ZERO {
            delivery.nak(Some(nak_delay)).await
        } else {
            delivery.nak(None).await
        };

        match result {
            Ok(()) => tracing::trace!(
                message_uuid = uuid,
                delay_ms = nak_delay.as_millis() as u64,
                retry_num = retry_num,
                "Message nacked"
            ),
            Err(e) => tracing::error!(
                subscriber_num = self.subscriber_num,
                topic = %self.topic,
                message_uuid = uuid,
                error = %e,
                "Cannot send nak"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::MemoryConnection;

    fn memory_subscriber(config: SubscriptionConfig) -> Subscriber {
        let conn = MemoryConnection::new(Duration::from_secs(5));
        Subscriber::with_connection(Arc::new(conn), config).unwrap()
    }

    #[tokio::test]
    async fn construction_rejects_groupless_fanout() {
        let conn = MemoryConnection::default();
        let config = SubscriptionConfig {
            subscribers_count: 2,
            ..Default::default()
        };
        let err = Subscriber::with_connection(Arc::new(conn), config).unwrap_err();
        assert!(matches!(err, PubSubError::Config(_)));
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let sub = memory_subscriber(SubscriptionConfig::default());
        assert!(sub.close().await.is_ok());
        assert!(sub.close().await.is_ok());
    }

    #[tokio::test]
    async fn close_with_no_subscriptions_returns_quickly() {
        let sub = memory_subscriber(SubscriptionConfig {
            close_timeout: Duration::from_millis(100),
            ..Default::default()
        });
        let started = std::time::Instant::now();
        sub.close().await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn subscribe_initialize_requires_persistent_mode() {
        let sub = memory_subscriber(SubscriptionConfig::default());
        let err = sub.subscribe_initialize("orders").await.unwrap_err();
        assert!(matches!(err, PubSubError::Unsupported(_)));
    }

    #[tokio::test]
    async fn channel_closes_after_close() {
        let sub = memory_subscriber(SubscriptionConfig::default());
        let mut rx = sub
            .subscribe(CancellationToken::new(), "orders")
            .await
            .unwrap();

        sub.close().await.unwrap();
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn channel_closes_when_context_cancelled() {
        let sub = memory_subscriber(SubscriptionConfig::default());
        let ctx = CancellationToken::new();
        let mut rx = sub.subscribe(ctx.clone(), "orders").await.unwrap();

        ctx.cancel();
        assert!(rx.recv().await.is_none());

        sub.close().await.unwrap();
    }
}
