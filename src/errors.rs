use std::str::FromStr;

use thiserror::Error;

/// Error types for SQS listener container operations.
///
/// Only configuration and startup errors are ever returned to the caller of the
/// container. Transport and acknowledgment failures are recovered locally and
/// handler failures are turned into outcomes; those variants exist so they can be
/// logged with a consistent shape.
#[derive(Debug, Error)]
pub enum SqsListenerError {
    /// A queue name could not be resolved to a queue URL.
    #[error("invalid destination '{name}': {reason}")]
    InvalidDestination { name: String, reason: String },

    /// No registered handler accepts the payload type.
    #[error("no handler registered for payload type {0}")]
    NoMatchingHandler(String),

    /// More than one handler accepts the payload type.
    #[error("ambiguous handlers for payload type {payload_type}: {candidates} registrations match")]
    AmbiguousHandler {
        payload_type: String,
        candidates: usize,
    },

    /// The receive call against a queue failed.
    #[error("failed to receive messages from '{queue}': {source}")]
    PollTransport {
        queue: String,
        #[source]
        source: QueueServiceError,
    },

    /// A handler failed in a way that did not produce its own error (panic, join failure).
    #[error("handler invocation failed for message {message_id}: {reason}")]
    HandlerInvocation { message_id: String, reason: String },

    /// The message body could not be converted into the handler's payload type.
    #[error("failed to convert message {message_id} into {payload_type}: {source}")]
    MessageConversion {
        message_id: String,
        payload_type: String,
        #[source]
        source: serde_json::Error,
    },

    /// Deleting a message or changing its visibility failed.
    #[error("acknowledgment of message {message_id} failed: {source}")]
    Acknowledgment {
        message_id: String,
        #[source]
        source: QueueServiceError,
    },

    #[error("invalid container configuration: {0}")]
    InvalidConfiguration(String),

    #[error("queue '{0}' is not registered with this container")]
    UnknownQueue(String),

    #[error("dispatcher for queue '{0}' is closed")]
    DispatcherClosed(String),

    #[error("{0}")]
    GenericError(#[from] GenericError),
}

/// Errors reported by a [`QueueClient`](crate::client::QueueClient) implementation.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum QueueServiceError {
    #[error("queue does not exist: {0}")]
    QueueDoesNotExist(String),

    #[error("{0}")]
    Transport(String),

    #[error("response is missing field '{0}'")]
    MissingField(&'static str),
}

/// Generic error type for application-level handler failures.
#[derive(Debug, Error)]
pub struct GenericError(String);

impl GenericError {
    /// Creates a new `GenericError` with the provided message.
    pub fn new(message: String) -> Self {
        GenericError(message)
    }
}

impl std::fmt::Display for GenericError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for GenericError {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(GenericError::new(s.to_string()))
    }
}

impl From<String> for GenericError {
    fn from(s: String) -> Self {
        GenericError::new(s)
    }
}

impl From<&str> for GenericError {
    fn from(s: &str) -> Self {
        GenericError::new(s.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generic_error_converts_into_listener_error() {
        let error: SqsListenerError = GenericError::from("boom").into();
        assert_eq!(error.to_string(), "boom");
    }

    #[test]
    fn poll_transport_exposes_source() {
        let error = SqsListenerError::PollTransport {
            queue: "orders".to_string(),
            source: QueueServiceError::Transport("connection reset".to_string()),
        };
        assert_eq!(
            error.to_string(),
            "failed to receive messages from 'orders': connection reset"
        );
        assert!(std::error::Error::source(&error).is_some());
    }
}
