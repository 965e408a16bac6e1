//! # AWS SQS Listener
//!
//! An asynchronous listener container for AWS SQS. It long-polls one or more queues,
//! resolves the handler for each message's payload type, runs handlers with bounded
//! concurrency and acknowledges messages according to a deletion policy.
//!
//! ## Features
//!
//! - One poller per queue with backpressure: a receive is only issued when a worker is free
//! - Handlers resolved by payload type, with JSON payload conversion and a default handler
//! - Closure handlers with cloned shared resources, or trait-based handlers
//! - Single-message, FIFO message group and batch dispatch
//! - Deletion policies `ON_SUCCESS`, `ALWAYS`, `NEVER` and `NO_REDRIVE`
//! - Per-invocation handler timeouts and graceful, bounded shutdown
//! - Queue names, URLs and ARNs, resolved once and cached
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use rs_sqs_listener::client::create_sqs_client_from_env;
//! use rs_sqs_listener::container::SqsListenerContainer;
//! use rs_sqs_listener::handler::HandlerRegistry;
//! use rs_sqs_listener::message::Message;
//! use serde::Deserialize;
//!
//! #[derive(Deserialize)]
//! struct OrderCreated {
//!     id: u64,
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = create_sqs_client_from_env().await;
//!     let shared_data = "shared state".to_string();
//!
//!     let mut handlers = HandlerRegistry::new();
//!     handlers.add_handler_fn(
//!         |message: Message<OrderCreated>, shared: String| async move {
//!             println!("Processing order {} with shared: {}", message.payload().id, shared);
//!             Ok(())
//!         },
//!         shared_data,
//!     );
//!
//!     // Starts polling as soon as it is built.
//!     let container = SqsListenerContainer::builder(Arc::new(client))
//!         .add_queue("orders")
//!         .handlers(handlers)
//!         .build()
//!         .await?;
//!
//!     tokio::signal::ctrl_c().await?;
//!     container.stop().await;
//!     Ok(())
//! }
//! ```

pub mod acknowledgment;
pub mod client;
pub mod container;
pub mod destination;
pub mod errors;
pub mod handler;
pub mod message;
