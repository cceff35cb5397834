//! Subscriber and publisher configuration
//!
//! Defaults are applied before validation: non-positive timeouts fall
//! back to 30 seconds, the subscriber count to 1, and the
//! marshaller/subject-calculator to their defaults. Validation is eager —
//! a configuration that would duplicate deliveries is rejected at
//! construction, not at runtime.

use crate::delay::Delay;
use crate::marshaler::{HeaderMarshaler, Marshaler, Unmarshaler};
use crate::subject::{DefaultSubjectCalculator, SubjectCalculator};
use crate::error::{PubSubError, Result};
use std::sync::Arc;
use std::time::Duration;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Persistent-stream settings
#[derive(Debug, Clone, Default)]
pub struct JetStreamConfig {
    /// Use JetStream instead of the core fire-and-forget protocol
    pub enabled: bool,

    /// Provision the stream backing a topic before first subscribe/publish
    pub auto_provision: bool,

    /// JetStream domain to address, if any
    pub domain: Option<String>,
}

/// Configuration for [`Subscriber::connect`](crate::Subscriber::connect)
#[derive(Default)]
pub struct SubscriberConfig {
    /// Broker URL
    pub url: String,

    /// Connection options passed to the client
    pub connect_options: Option<async_nats::ConnectOptions>,

    /// Queue group shared by the subscriptions
    ///
    /// All subscriptions with the same queue group form one delivery
    /// group: each message reaches exactly one member. Empty means
    /// broadcast semantics, which is only valid with a single subscriber.
    pub queue_group: String,

    /// How many concurrent subscriptions each subscribe call registers
    pub subscribers_count: usize,

    /// How long close waits for in-flight message coordinations
    pub close_timeout: Duration,

    /// How long the consumer has to ack before the broker redelivers
    pub ack_wait_timeout: Duration,

    /// How long a single native subscribe attempt may take
    pub subscribe_timeout: Duration,

    /// Unmarshaller turning broker frames into messages
    pub unmarshaler: Option<Arc<dyn Unmarshaler>>,

    /// Topic-to-subject mapping
    pub subject_calculator: Option<Arc<dyn SubjectCalculator>>,

    /// Wait for the broker to confirm each acknowledgement
    ///
    /// Needed for exactly-once processing on top of a persistent stream.
    pub ack_sync: bool,

    /// Delay applied before a nacked message is redelivered
    ///
    /// Without a policy, nacks request immediate redelivery.
    pub nak_delay: Option<Arc<dyn Delay>>,

    /// Persistent-stream settings
    pub jet_stream: JetStreamConfig,
}

impl SubscriberConfig {
    /// The subset needed once a connection has been established
    pub fn subscription_config(&self) -> SubscriptionConfig {
        SubscriptionConfig {
            queue_group: self.queue_group.clone(),
            subscribers_count: self.subscribers_count,
            close_timeout: self.close_timeout,
            ack_wait_timeout: self.ack_wait_timeout,
            subscribe_timeout: self.subscribe_timeout,
            unmarshaler: self.unmarshaler.clone(),
            subject_calculator: self.subject_calculator.clone(),
            ack_sync: self.ack_sync,
            nak_delay: self.nak_delay.clone(),
            jet_stream: self.jet_stream.clone(),
        }
    }
}

/// Configuration subset for individual subscribe calls
///
/// Used directly when injecting an established
/// [`Connection`](crate::connection::Connection) into
/// [`Subscriber::with_connection`](crate::Subscriber::with_connection).
#[derive(Clone, Default)]
pub struct SubscriptionConfig {
    /// See [`SubscriberConfig::queue_group`]
    pub queue_group: String,

    /// See [`SubscriberConfig::subscribers_count`]
    pub subscribers_count: usize,

    /// See [`SubscriberConfig::close_timeout`]
    pub close_timeout: Duration,

    /// See [`SubscriberConfig::ack_wait_timeout`]
    pub ack_wait_timeout: Duration,

    /// See [`SubscriberConfig::subscribe_timeout`]
    pub subscribe_timeout: Duration,

    /// See [`SubscriberConfig::unmarshaler`]
    pub unmarshaler: Option<Arc<dyn Unmarshaler>>,

    /// See [`SubscriberConfig::subject_calculator`]
    pub subject_calculator: Option<Arc<dyn SubjectCalculator>>,

    /// See [`SubscriberConfig::ack_sync`]
    pub ack_sync: bool,

    /// See [`SubscriberConfig::nak_delay`]
    pub nak_delay: Option<Arc<dyn Delay>>,

    /// See [`SubscriberConfig::jet_stream`]
    pub jet_stream: JetStreamConfig,
}

impl std::fmt::Debug for SubscriptionConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionConfig")
            .field("queue_group", &self.queue_group)
            .field("subscribers_count", &self.subscribers_count)
            .field("close_timeout", &self.close_timeout)
            .field("ack_wait_timeout", &self.ack_wait_timeout)
            .field("subscribe_timeout", &self.subscribe_timeout)
            .field("ack_sync", &self.ack_sync)
            .field("jet_stream", &self.jet_stream)
            .finish_non_exhaustive()
    }
}

impl SubscriptionConfig {
    pub(crate) fn set_defaults(&mut self) {
        if self.subscribers_count == 0 {
            self.subscribers_count = 1;
        }
        if self.close_timeout.is_zero() {
            self.close_timeout = DEFAULT_TIMEOUT;
        }
        if self.ack_wait_timeout.is_zero() {
            self.ack_wait_timeout = DEFAULT_TIMEOUT;
        }
        if self.subscribe_timeout.is_zero() {
            self.subscribe_timeout = DEFAULT_TIMEOUT;
        }
        if self.unmarshaler.is_none() {
            self.unmarshaler = Some(Arc::new(HeaderMarshaler));
        }
        if self.subject_calculator.is_none() {
            self.subject_calculator = Some(Arc::new(DefaultSubjectCalculator));
        }
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.queue_group.is_empty() && self.subscribers_count > 1 {
            return Err(PubSubError::Config(
                "subscribers_count > 1 requires a queue_group, \
                 otherwise every subscriber would receive every message"
                    .to_string(),
            ));
        }
        Ok(())
    }

    pub(crate) fn resolved_unmarshaler(&self) -> Arc<dyn Unmarshaler> {
        self.unmarshaler
            .clone()
            .unwrap_or_else(|| Arc::new(HeaderMarshaler))
    }

    pub(crate) fn resolved_subject_calculator(&self) -> Arc<dyn SubjectCalculator> {
        self.subject_calculator
            .clone()
            .unwrap_or_else(|| Arc::new(DefaultSubjectCalculator))
    }
}

/// Configuration for [`Publisher::connect`](crate::Publisher::connect)
#[derive(Default)]
pub struct PublisherConfig {
    /// Broker URL
    pub url: String,

    /// Connection options passed to the client
    pub connect_options: Option<async_nats::ConnectOptions>,

    /// Marshaller turning messages into broker frames
    pub marshaler: Option<Arc<dyn Marshaler>>,

    /// Topic-to-subject mapping; must match the subscribers'
    pub subject_calculator: Option<Arc<dyn SubjectCalculator>>,

    /// Persistent-stream settings
    pub jet_stream: JetStreamConfig,
}

impl PublisherConfig {
    pub(crate) fn resolved_marshaler(&self) -> Arc<dyn Marshaler> {
        self.marshaler
            .clone()
            .unwrap_or_else(|| Arc::new(HeaderMarshaler))
    }

    pub(crate) fn resolved_subject_calculator(&self) -> Arc<dyn SubjectCalculator> {
        self.subject_calculator
            .clone()
            .unwrap_or_else(|| Arc::new(DefaultSubjectCalculator))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_fill_non_positive_timeouts() {
        let mut config = SubscriptionConfig::default();
        config.set_defaults();

        assert_eq!(config.subscribers_count, 1);
        assert_eq!(config.close_timeout, Duration::from_secs(30));
        assert_eq!(config.ack_wait_timeout, Duration::from_secs(30));
        assert_eq!(config.subscribe_timeout, Duration::from_secs(30));
        assert!(config.unmarshaler.is_some());
        assert!(config.subject_calculator.is_some());
    }

    #[test]
    fn defaults_keep_explicit_values() {
        let mut config = SubscriptionConfig {
            subscribers_count: 4,
            queue_group: "workers".to_string(),
            close_timeout: Duration::from_secs(5),
            ..Default::default()
        };
        config.set_defaults();

        assert_eq!(config.subscribers_count, 4);
        assert_eq!(config.close_timeout, Duration::from_secs(5));
    }

    #[test]
    fn multiple_subscribers_require_queue_group() {
        let mut config = SubscriptionConfig {
            subscribers_count: 2,
            ..Default::default()
        };
        config.set_defaults();

        let err = config.validate().unwrap_err();
        assert!(matches!(err, PubSubError::Config(_)));
        assert!(err.to_string().contains("queue_group"));
    }

    #[test]
    fn queue_group_allows_multiple_subscribers() {
        let mut config = SubscriptionConfig {
            subscribers_count: 8,
            queue_group: "g".to_string(),
            ..Default::default()
        };
        config.set_defaults();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn single_subscriber_without_group_is_valid() {
        let mut config = SubscriptionConfig::default();
        config.set_defaults();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn subscription_config_mirrors_subscriber_config() {
        let config = SubscriberConfig {
            url: "nats://localhost:4222".to_string(),
            queue_group: "g".to_string(),
            subscribers_count: 3,
            ack_sync: true,
            jet_stream: JetStreamConfig {
                enabled: true,
                auto_provision: true,
                domain: None,
            },
            ..Default::default()
        };

        let sub = config.subscription_config();
        assert_eq!(sub.queue_group, "g");
        assert_eq!(sub.subscribers_count, 3);
        assert!(sub.ack_sync);
        assert!(sub.jet_stream.enabled);
        assert!(sub.jet_stream.auto_provision);
    }
}
