//! The listener container: one poller and one dispatcher per queue endpoint.

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tracing::{error, info};

use crate::client::QueueClient;
use crate::destination::CachingDestinationResolver;
use crate::errors::SqsListenerError;
use crate::handler::{HandlerRegistry, HandlerResolver};

pub mod config;
pub mod dispatcher;
pub mod poller;

pub use config::{ContainerOptions, ListenerMode, QueueEndpoint};
pub use dispatcher::Dispatcher;
pub use poller::{PollerState, QueuePoller};

/// Supervises the pollers of every registered queue.
///
/// # Example
///
/// ```rust,no_run
/// use std::sync::Arc;
///
/// use rs_sqs_listener::client::create_sqs_client_from_env;
/// use rs_sqs_listener::container::{ContainerOptions, SqsListenerContainer};
/// use rs_sqs_listener::handler::HandlerRegistry;
/// use rs_sqs_listener::message::Message;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let client = create_sqs_client_from_env().await;
///
///     let mut handlers = HandlerRegistry::new();
///     handlers.add_default_handler_fn(
///         |message: Message<String>, _: ()| async move {
///             println!("received: {}", message.payload());
///             Ok(())
///         },
///         (),
///     );
///
///     let container = SqsListenerContainer::builder(Arc::new(client))
///         .options(ContainerOptions {
///             auto_startup: false,
///             ..Default::default()
///         })
///         .add_queue("orders")
///         .handlers(handlers)
///         .build()
///         .await?;
///
///     container
///         .run_until(async {
///             let _ = tokio::signal::ctrl_c().await;
///         })
///         .await?;
///     Ok(())
/// }
/// ```
pub struct SqsListenerContainer {
    options: ContainerOptions,
    resolver: Arc<HandlerResolver>,
    destinations: Arc<CachingDestinationResolver>,
    pollers: Vec<QueuePoller>,
}

impl SqsListenerContainer {
    pub fn builder(client: Arc<dyn QueueClient>) -> SqsListenerContainerBuilder {
        SqsListenerContainerBuilder {
            client,
            options: ContainerOptions::default(),
            queues: Vec::new(),
            handlers: HandlerRegistry::new(),
        }
    }

    pub fn options(&self) -> &ContainerOptions {
        &self.options
    }

    pub fn resolver(&self) -> &Arc<HandlerResolver> {
        &self.resolver
    }

    pub fn destinations(&self) -> &Arc<CachingDestinationResolver> {
        &self.destinations
    }

    pub fn queue_names(&self) -> impl Iterator<Item = &str> {
        self.pollers.iter().map(|poller| poller.endpoint().name())
    }

    /// Starts every poller concurrently.
    ///
    /// If any queue fails to start, the pollers started by this call are stopped
    /// again and the first error is returned. Queues that were already running
    /// keep running. Starting a running container is a no-op.
    pub async fn start(&self) -> Result<(), SqsListenerError> {
        let results = join_all(self.pollers.iter().map(|poller| poller.start_if_stopped())).await;

        let mut started = Vec::new();
        let mut first_error = None;
        for (poller, result) in self.pollers.iter().zip(results) {
            match result {
                Ok(true) => started.push(poller),
                Ok(false) => {}
                Err(e) => {
                    first_error.get_or_insert(e);
                }
            }
        }

        let Some(error) = first_error else {
            info!(queues = self.pollers.len(), "Listener container started");
            return Ok(());
        };

        error!(
            started = started.len(),
            "Listener container failed to start, stopping started queues"
        );
        join_all(
            started
                .iter()
                .map(|poller| poller.stop(poller.endpoint().options().stop_timeout())),
        )
        .await;
        Err(error)
    }

    /// Stops every poller using each endpoint's own stop timeout.
    ///
    /// Returns `true` if all in-flight work finished in time.
    pub async fn stop(&self) -> bool {
        let results = join_all(
            self.pollers
                .iter()
                .map(|poller| poller.stop(poller.endpoint().options().stop_timeout())),
        )
        .await;
        let drained = results.into_iter().all(|drained| drained);
        info!(drained, "Listener container stopped");
        drained
    }

    pub async fn stop_with_timeout(&self, timeout: Duration) -> bool {
        let results = join_all(self.pollers.iter().map(|poller| poller.stop(timeout))).await;
        let drained = results.into_iter().all(|drained| drained);
        info!(drained, "Listener container stopped");
        drained
    }

    pub async fn start_queue(&self, name: &str) -> Result<(), SqsListenerError> {
        self.poller(name)?.start().await
    }

    pub async fn stop_queue(&self, name: &str) -> Result<bool, SqsListenerError> {
        let poller = self.poller(name)?;
        Ok(poller
            .stop(poller.endpoint().options().stop_timeout())
            .await)
    }

    /// Whether the queue is registered and currently polling.
    pub fn is_running(&self, name: &str) -> bool {
        self.poller(name).is_ok_and(QueuePoller::is_running)
    }

    pub fn poller_state(&self, name: &str) -> Option<PollerState> {
        self.poller(name).ok().map(QueuePoller::state)
    }

    /// Starts the container, waits for `shutdown` and stops it again.
    ///
    /// Returns whether the stop drained cleanly.
    pub async fn run_until<F>(&self, shutdown: F) -> Result<bool, SqsListenerError>
    where
        F: Future<Output = ()>,
    {
        self.start().await?;
        shutdown.await;
        info!("Shutdown signal received, stopping listener container");
        Ok(self.stop().await)
    }

    fn poller(&self, name: &str) -> Result<&QueuePoller, SqsListenerError> {
        self.pollers
            .iter()
            .find(|poller| poller.endpoint().name() == name)
            .ok_or_else(|| SqsListenerError::UnknownQueue(name.to_string()))
    }
}

/// Collects queues, options and handlers for a [`SqsListenerContainer`].
pub struct SqsListenerContainerBuilder {
    client: Arc<dyn QueueClient>,
    options: ContainerOptions,
    queues: Vec<(String, Option<ContainerOptions>)>,
    handlers: HandlerRegistry,
}

impl SqsListenerContainerBuilder {
    /// Sets the options used by every queue added without its own options.
    pub fn options(mut self, options: ContainerOptions) -> Self {
        self.options = options;
        self
    }

    /// Adds a queue by name, URL or ARN.
    pub fn add_queue(mut self, name: impl Into<String>) -> Self {
        self.queues.push((name.into(), None));
        self
    }

    pub fn add_queue_with_options(
        mut self,
        name: impl Into<String>,
        options: ContainerOptions,
    ) -> Self {
        self.queues.push((name.into(), Some(options)));
        self
    }

    pub fn handlers(mut self, handlers: HandlerRegistry) -> Self {
        self.handlers = handlers;
        self
    }

    /// Validates the configuration and builds the container, starting it when
    /// `auto_startup` is set.
    pub async fn build(self) -> Result<SqsListenerContainer, SqsListenerError> {
        self.options.validate()?;
        if self.queues.is_empty() {
            return Err(SqsListenerError::InvalidConfiguration(
                "at least one queue must be registered".to_string(),
            ));
        }

        let resolver = Arc::new(self.handlers.build()?);
        let destinations = Arc::new(
            CachingDestinationResolver::new(Arc::clone(&self.client))
                .with_auto_create(self.options.auto_create_queues),
        );

        let mut names = HashSet::new();
        let mut pollers = Vec::with_capacity(self.queues.len());
        for (name, options) in self.queues {
            if !names.insert(name.clone()) {
                return Err(SqsListenerError::InvalidConfiguration(format!(
                    "queue '{name}' is registered more than once"
                )));
            }

            let endpoint = Arc::new(QueueEndpoint::new(
                name,
                options.unwrap_or_else(|| self.options.clone()),
            )?);
            let has_handlers = match endpoint.options().listener_mode {
                ListenerMode::Single => resolver.has_handlers(),
                ListenerMode::Batch => resolver.has_batch_handlers(),
            };
            if !has_handlers {
                return Err(SqsListenerError::InvalidConfiguration(format!(
                    "queue '{}' listens in {:?} mode but no such handlers are registered",
                    endpoint.name(),
                    endpoint.options().listener_mode
                )));
            }

            let dispatcher = Dispatcher::new(Arc::clone(&endpoint), Arc::clone(&resolver));
            pollers.push(QueuePoller::new(
                endpoint,
                Arc::clone(&self.client),
                Arc::clone(&destinations),
                dispatcher,
            ));
        }

        let container = SqsListenerContainer {
            options: self.options,
            resolver,
            destinations,
            pollers,
        };
        if container.options.auto_startup {
            container.start().await?;
        }
        Ok(container)
    }
}
