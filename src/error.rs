//! Error types for nats-pubsub

use std::time::Duration;
use thiserror::Error;

/// Errors that can occur in the pub/sub adapter
#[derive(Debug, Error)]
pub enum PubSubError {
    /// Broker connection failure
    #[error("Connection error: {0}")]
    Connection(String),

    /// Configuration error (reported eagerly at construction)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Subscribe failure
    #[error("Failed to subscribe to subject '{subject}': {reason}")]
    Subscribe {
        subject: String,
        reason: String,
    },

    /// Publish failure
    #[error("Failed to publish to subject '{subject}': {reason}")]
    Publish {
        subject: String,
        reason: String,
    },

    /// Stream creation or lookup error
    #[error("Stream error: {0}")]
    Stream(String),

    /// Consumer creation or management error
    #[error("Consumer error: {0}")]
    Consumer(String),

    /// Acknowledgement transport failure
    #[error("Failed to acknowledge message: {0}")]
    Ack(String),

    /// Marshalling/unmarshalling failure
    #[error("Marshaling error: {0}")]
    Marshal(String),

    /// Serialization/deserialization failure
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Operation timed out
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// In-flight subscriptions did not finish within the close timeout
    #[error("Close timed out: in-flight subscriptions did not finish within {0:?}")]
    CloseTimeout(Duration),

    /// Connection drain failure during close
    #[error("Drain error: {0}")]
    Drain(String),

    /// Operation not available on this connection variant
    #[error("{0} is not supported by this connection")]
    Unsupported(&'static str),
}

/// Result type alias for pub/sub operations
pub type Result<T> = std::result::Result<T, PubSubError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_error_display() {
        let err = PubSubError::Connection("refused".to_string());
        assert_eq!(err.to_string(), "Connection error: refused");
    }

    #[test]
    fn subscribe_error_display() {
        let err = PubSubError::Subscribe {
            subject: "orders.*".to_string(),
            reason: "permissions".to_string(),
        };
        assert!(err.to_string().contains("orders.*"));
        assert!(err.to_string().contains("permissions"));
    }

    #[test]
    fn close_timeout_display() {
        let err = PubSubError::CloseTimeout(Duration::from_secs(30));
        assert!(err.to_string().contains("30s"));
    }

    #[test]
    fn serialization_error_from() {
        let json_err = serde_json::from_str::<String>("invalid").unwrap_err();
        let err: PubSubError = json_err.into();
        assert!(matches!(err, PubSubError::Serialization(_)));
    }

    #[test]
    fn unsupported_display() {
        let err = PubSubError::Unsupported("negative acknowledgement");
        assert!(err.to_string().contains("negative acknowledgement"));
    }
}
