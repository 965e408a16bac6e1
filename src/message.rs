//! Messages as they move through the container: the wire-level [`RawMessage`], the
//! dispatcher-owned [`InFlightMessage`] and the handler-facing [`Message`].

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use crate::acknowledgment::{AckHandle, Acknowledgment, Visibility};
use crate::client::QueueClient;
use crate::container::config::QueueEndpoint;
use crate::handler::PayloadType;

/// System attribute carrying the approximate number of receives.
pub const RECEIVE_COUNT_ATTRIBUTE: &str = "ApproximateReceiveCount";

/// System attribute carrying the FIFO message group id.
pub const MESSAGE_GROUP_ID_ATTRIBUTE: &str = "MessageGroupId";

/// A message exactly as received from the queue service.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawMessage {
    pub message_id: String,
    /// Token required to delete the message or change its visibility.
    pub receipt_handle: String,
    pub body: String,
    /// System attributes such as `ApproximateReceiveCount` or `MessageGroupId`.
    pub attributes: HashMap<String, String>,
    /// String-valued user attributes.
    pub message_attributes: HashMap<String, String>,
}

impl RawMessage {
    pub fn new(
        message_id: impl Into<String>,
        receipt_handle: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        RawMessage {
            message_id: message_id.into(),
            receipt_handle: receipt_handle.into(),
            body: body.into(),
            ..Default::default()
        }
    }

    pub fn with_attribute(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(name.into(), value.into());
        self
    }

    pub fn with_message_attribute(
        mut self,
        name: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        self.message_attributes.insert(name.into(), value.into());
        self
    }

    pub fn message_attribute(&self, name: &str) -> Option<&str> {
        self.message_attributes.get(name).map(String::as_str)
    }

    pub fn receive_count(&self) -> Option<u32> {
        self.attributes
            .get(RECEIVE_COUNT_ATTRIBUTE)
            .and_then(|count| count.parse().ok())
    }

    pub fn message_group_id(&self) -> Option<&str> {
        self.attributes
            .get(MESSAGE_GROUP_ID_ATTRIBUTE)
            .map(String::as_str)
    }
}

/// Result of handling a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Outcome {
    Pending,
    Succeeded,
    Failed,
    TimedOut,
    /// Not handled because an earlier message of its FIFO group failed. The
    /// message is left for redelivery.
    Skipped,
}

/// A received message owned by the dispatcher worker processing it.
pub struct InFlightMessage {
    raw: Arc<RawMessage>,
    endpoint: Arc<QueueEndpoint>,
    received_at: Instant,
    payload_type: Option<PayloadType>,
    outcome: Outcome,
    handle: Arc<AckHandle>,
}

impl InFlightMessage {
    pub fn new(
        raw: RawMessage,
        endpoint: Arc<QueueEndpoint>,
        queue_url: Arc<str>,
        client: Arc<dyn QueueClient>,
    ) -> Self {
        let handle = Arc::new(AckHandle::new(
            client,
            queue_url,
            raw.message_id.clone(),
            raw.receipt_handle.clone(),
        ));
        InFlightMessage {
            raw: Arc::new(raw),
            endpoint,
            received_at: Instant::now(),
            payload_type: None,
            outcome: Outcome::Pending,
            handle,
        }
    }

    pub fn raw(&self) -> &RawMessage {
        &self.raw
    }

    pub fn message_id(&self) -> &str {
        &self.raw.message_id
    }

    pub fn endpoint(&self) -> &Arc<QueueEndpoint> {
        &self.endpoint
    }

    pub fn received_at(&self) -> Instant {
        self.received_at
    }

    /// The payload type resolved by the dispatcher, `None` until dispatched.
    pub fn payload_type(&self) -> Option<PayloadType> {
        self.payload_type
    }

    pub fn outcome(&self) -> Outcome {
        self.outcome
    }

    /// Whether the receipt handle has already been deleted.
    pub fn is_acknowledged(&self) -> bool {
        self.handle.is_deleted()
    }

    pub(crate) fn set_payload_type(&mut self, payload_type: PayloadType) {
        self.payload_type = Some(payload_type);
    }

    pub(crate) fn set_outcome(&mut self, outcome: Outcome) {
        self.outcome = outcome;
    }

    pub(crate) fn ack_handle(&self) -> &Arc<AckHandle> {
        &self.handle
    }

    /// Builds the handler-facing view carrying the raw body as payload.
    pub(crate) fn to_message(&self) -> Message<String> {
        Message {
            payload: self.raw.body.clone(),
            raw: Arc::clone(&self.raw),
            queue_name: Arc::clone(self.endpoint.name_arc()),
            acknowledgment: Acknowledgment::new(Arc::clone(&self.handle)),
            visibility: Visibility::new(Arc::clone(&self.handle)),
        }
    }
}

impl fmt::Debug for InFlightMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InFlightMessage")
            .field("message_id", &self.raw.message_id)
            .field("queue", &self.endpoint.name())
            .field("payload_type", &self.payload_type)
            .field("outcome", &self.outcome)
            .finish()
    }
}

/// A message handed to an application handler, with its payload converted to `T`.
pub struct Message<T> {
    payload: T,
    raw: Arc<RawMessage>,
    queue_name: Arc<str>,
    acknowledgment: Acknowledgment,
    visibility: Visibility,
}

impl<T> Message<T> {
    pub fn payload(&self) -> &T {
        &self.payload
    }

    pub fn into_payload(self) -> T {
        self.payload
    }

    pub fn message_id(&self) -> &str {
        &self.raw.message_id
    }

    pub fn raw(&self) -> &RawMessage {
        &self.raw
    }

    /// Logical name of the queue the message was received from.
    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    pub fn receive_count(&self) -> Option<u32> {
        self.raw.receive_count()
    }

    pub fn message_group_id(&self) -> Option<&str> {
        self.raw.message_group_id()
    }

    /// Handle for deleting the message manually, typically with the `NEVER` policy.
    pub fn acknowledgment(&self) -> &Acknowledgment {
        &self.acknowledgment
    }

    pub fn visibility(&self) -> &Visibility {
        &self.visibility
    }

    pub(crate) fn try_map<U, E>(self, f: impl FnOnce(T) -> Result<U, E>) -> Result<Message<U>, E> {
        Ok(Message {
            payload: f(self.payload)?,
            raw: self.raw,
            queue_name: self.queue_name,
            acknowledgment: self.acknowledgment,
            visibility: self.visibility,
        })
    }
}

impl<T: fmt::Debug> fmt::Debug for Message<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("message_id", &self.raw.message_id)
            .field("queue_name", &self.queue_name)
            .field("payload", &self.payload)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_system_attributes() {
        let message = RawMessage::new("m-1", "rh-1", "{}")
            .with_attribute(RECEIVE_COUNT_ATTRIBUTE, "3")
            .with_attribute(MESSAGE_GROUP_ID_ATTRIBUTE, "customer-7");

        assert_eq!(message.receive_count(), Some(3));
        assert_eq!(message.message_group_id(), Some("customer-7"));
    }

    #[test]
    fn unparsable_receive_count_is_none() {
        let message =
            RawMessage::new("m-1", "rh-1", "{}").with_attribute(RECEIVE_COUNT_ATTRIBUTE, "many");
        assert_eq!(message.receive_count(), None);
        assert_eq!(message.message_group_id(), None);
    }
}
