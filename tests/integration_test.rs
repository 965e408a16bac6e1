//! Tests against a real SQS queue. Run with `cargo test -- --ignored` after setting
//! `TEST_SQS_QUEUE_URL` (a FIFO queue) and AWS credentials, e.g. in a `.env` file.

use rs_sqs_listener::client;
use rs_sqs_listener::container::{ContainerOptions, SqsListenerContainer};
use rs_sqs_listener::errors::SqsListenerError;
use rs_sqs_listener::handler::HandlerRegistry;
use rs_sqs_listener::message::Message;
use serde::Deserialize;
use std::env;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::timeout;

#[derive(Clone)]
struct SharedCounter {
    count: Arc<Mutex<i32>>,
}

impl SharedCounter {
    fn new() -> Self {
        Self {
            count: Arc::new(Mutex::new(0)),
        }
    }

    async fn increment(&self) {
        let mut count = self.count.lock().await;
        *count += 1;
    }

    async fn get_count(&self) -> i32 {
        *self.count.lock().await
    }
}

#[derive(Debug, Deserialize)]
struct Greeting {
    text: String,
}

async fn raw_handler(
    message: Message<String>,
    shared: SharedCounter,
) -> Result<(), SqsListenerError> {
    println!("Received raw message: {}", message.payload());
    shared.increment().await;
    Ok(())
}

async fn greeting_handler(
    message: Message<Greeting>,
    shared: SharedCounter,
) -> Result<(), SqsListenerError> {
    println!("Received greeting: {}", message.payload().text);
    shared.increment().await;
    Ok(())
}

async fn wait_for_count(counter: &SharedCounter, expected: i32) -> Result<(), i32> {
    let waited = timeout(Duration::from_secs(30), async {
        loop {
            if counter.get_count().await >= expected {
                break;
            }
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
    })
    .await;
    match waited {
        Ok(()) => Ok(()),
        Err(_) => Err(counter.get_count().await),
    }
}

#[tokio::test]
#[ignore = "requires AWS credentials and TEST_SQS_QUEUE_URL"]
async fn test_sqs_integration() {
    dotenvy::dotenv().ok();

    let queue_url = env::var("TEST_SQS_QUEUE_URL").expect("TEST_SQS_QUEUE_URL must be set");
    let sqs_client = client::create_sqs_client_from_env().await;

    for (index, body) in ["Test message 1", r#"{"text":"hello"}"#].into_iter().enumerate() {
        let mut request = sqs_client
            .send_message()
            .queue_url(&queue_url)
            .message_body(body)
            .message_deduplication_id(format!("test-message-{index}-{}", std::process::id()))
            .message_group_id("test-group");
        if index == 1 {
            request = request.message_attributes(
                "PayloadType",
                aws_sdk_sqs::types::MessageAttributeValue::builder()
                    .data_type("String")
                    .string_value("Greeting")
                    .build()
                    .expect("valid message attribute"),
            );
        }
        request.send().await.expect("Failed to send test message");
    }
    println!("Sent 2 test messages to queue");

    let shared_counter = SharedCounter::new();
    let mut handlers = HandlerRegistry::new();
    handlers
        .add_default_handler_fn(raw_handler, shared_counter.clone())
        .add_handler_fn(greeting_handler, shared_counter.clone());

    let container = SqsListenerContainer::builder(Arc::new(sqs_client))
        .options(ContainerOptions {
            wait_time_seconds: 5,
            ..Default::default()
        })
        .add_queue(queue_url)
        .handlers(handlers)
        .build()
        .await
        .expect("Failed to start listener container");

    let result = wait_for_count(&shared_counter, 2).await;
    assert!(container.stop().await, "container should drain cleanly");

    match result {
        Ok(()) => println!(
            "Successfully processed {} messages",
            shared_counter.get_count().await
        ),
        Err(count) => panic!("Test timed out. Only processed {} messages", count),
    }
}

#[tokio::test]
#[ignore = "requires AWS credentials"]
async fn test_listener_with_auto_created_queue() {
    dotenvy::dotenv().ok();

    let queue_name = "test-queue-listener-auto-create";
    let sqs_client = client::create_sqs_client_from_env().await;

    let shared_counter = SharedCounter::new();
    let mut handlers = HandlerRegistry::new();
    handlers.add_default_handler_fn(raw_handler, shared_counter.clone());

    let container = SqsListenerContainer::builder(Arc::new(sqs_client.clone()))
        .options(ContainerOptions {
            wait_time_seconds: 5,
            auto_create_queues: true,
            ..Default::default()
        })
        .add_queue(queue_name)
        .handlers(handlers)
        .build()
        .await
        .expect("Failed to start listener container");

    let queue_url = container
        .destinations()
        .resolve(queue_name)
        .await
        .expect("queue should have been resolved");

    sqs_client
        .send_message()
        .queue_url(&queue_url)
        .message_body("Auto-create test message")
        .send()
        .await
        .expect("Failed to send test message");

    let result = wait_for_count(&shared_counter, 1).await;
    container.stop().await;

    if let Err(e) = sqs_client.purge_queue().queue_url(&queue_url).send().await {
        println!("Warning: Failed to purge queue: {}", e);
    }

    if let Err(count) = result {
        panic!("Auto-create test timed out. Only processed {} messages", count);
    }
}
