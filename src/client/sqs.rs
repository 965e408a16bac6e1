use async_trait::async_trait;
use aws_sdk_sqs::error::DisplayErrorContext;
use aws_sdk_sqs::types::{Message, MessageSystemAttributeName};
use tracing::warn;

use super::{QueueClient, ReceiveRequest};
use crate::errors::QueueServiceError;
use crate::message::RawMessage;

#[async_trait]
impl QueueClient for aws_sdk_sqs::Client {
    async fn receive_messages(
        &self,
        request: &ReceiveRequest,
    ) -> Result<Vec<RawMessage>, QueueServiceError> {
        let output = self
            .receive_message()
            .queue_url(&request.queue_url)
            .max_number_of_messages(request.max_number_of_messages)
            .wait_time_seconds(request.wait_time_seconds)
            .set_visibility_timeout(request.visibility_timeout_seconds)
            .message_system_attribute_names(MessageSystemAttributeName::All)
            .message_attribute_names("All")
            .send()
            .await
            .map_err(|e| QueueServiceError::Transport(DisplayErrorContext(&e).to_string()))?;

        Ok(output
            .messages
            .unwrap_or_default()
            .into_iter()
            .filter_map(into_raw_message)
            .collect())
    }

    async fn delete_message(
        &self,
        queue_url: &str,
        receipt_handle: &str,
    ) -> Result<(), QueueServiceError> {
        self.delete_message()
            .queue_url(queue_url)
            .receipt_handle(receipt_handle)
            .send()
            .await
            .map_err(|e| QueueServiceError::Transport(DisplayErrorContext(&e).to_string()))?;
        Ok(())
    }

    async fn change_message_visibility(
        &self,
        queue_url: &str,
        receipt_handle: &str,
        visibility_timeout_seconds: i32,
    ) -> Result<(), QueueServiceError> {
        self.change_message_visibility()
            .queue_url(queue_url)
            .receipt_handle(receipt_handle)
            .visibility_timeout(visibility_timeout_seconds)
            .send()
            .await
            .map_err(|e| QueueServiceError::Transport(DisplayErrorContext(&e).to_string()))?;
        Ok(())
    }

    async fn get_queue_url(
        &self,
        queue_name: &str,
        owner_account_id: Option<&str>,
    ) -> Result<String, QueueServiceError> {
        let output = self
            .get_queue_url()
            .queue_name(queue_name)
            .set_queue_owner_aws_account_id(owner_account_id.map(str::to_string))
            .send()
            .await
            .map_err(|e| {
                if e.as_service_error()
                    .is_some_and(|service_error| service_error.is_queue_does_not_exist())
                {
                    QueueServiceError::QueueDoesNotExist(queue_name.to_string())
                } else {
                    QueueServiceError::Transport(DisplayErrorContext(&e).to_string())
                }
            })?;

        output
            .queue_url()
            .map(str::to_string)
            .ok_or(QueueServiceError::MissingField("QueueUrl"))
    }

    async fn create_queue(&self, queue_name: &str) -> Result<String, QueueServiceError> {
        let output = self
            .create_queue()
            .queue_name(queue_name)
            .send()
            .await
            .map_err(|e| QueueServiceError::Transport(DisplayErrorContext(&e).to_string()))?;

        output
            .queue_url()
            .map(str::to_string)
            .ok_or(QueueServiceError::MissingField("QueueUrl"))
    }
}

fn into_raw_message(message: Message) -> Option<RawMessage> {
    let Some(receipt_handle) = message.receipt_handle else {
        warn!(
            message_id = message.message_id.as_deref().unwrap_or("unknown"),
            "Received a message without a receipt handle, skipping"
        );
        return None;
    };

    let attributes = message
        .attributes
        .unwrap_or_default()
        .into_iter()
        .map(|(name, value)| (name.as_str().to_string(), value))
        .collect();

    let message_attributes = message
        .message_attributes
        .unwrap_or_default()
        .into_iter()
        .filter_map(|(name, value)| value.string_value.map(|value| (name, value)))
        .collect();

    Some(RawMessage {
        message_id: message.message_id.unwrap_or_default(),
        receipt_handle,
        body: message.body.unwrap_or_default(),
        attributes,
        message_attributes,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use aws_sdk_sqs::types::MessageAttributeValue;

    #[test]
    fn converts_sdk_message() {
        let message = Message::builder()
            .message_id("m-1")
            .receipt_handle("rh-1")
            .body(r#"{"id":1}"#)
            .attributes(MessageSystemAttributeName::ApproximateReceiveCount, "2")
            .message_attributes(
                "PayloadType",
                MessageAttributeValue::builder()
                    .data_type("String")
                    .string_value("OrderCreated")
                    .build()
                    .unwrap(),
            )
            .build();

        let raw = into_raw_message(message).unwrap();
        assert_eq!(raw.message_id, "m-1");
        assert_eq!(raw.receipt_handle, "rh-1");
        assert_eq!(raw.receive_count(), Some(2));
        assert_eq!(raw.message_attribute("PayloadType"), Some("OrderCreated"));
    }

    #[test]
    fn skips_message_without_receipt_handle() {
        let message = Message::builder().message_id("m-1").body("hello").build();
        assert!(into_raw_message(message).is_none());
    }
}
