use std::path::Path;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use serde::Deserialize;

use crate::acknowledgment::{DeletionPolicy, VisibilityBackOff};
use crate::client::ReceiveRequest;
use crate::destination::CachingDestinationResolver;
use crate::errors::SqsListenerError;

/// Largest batch the queue service returns from a single receive call.
pub const MAX_MESSAGES_PER_POLL: i32 = 10;

/// Longest long-poll the queue service supports, in seconds.
pub const MAX_WAIT_TIME_SECONDS: i32 = 20;

/// Longest visibility timeout the queue service supports (12 hours).
pub const MAX_VISIBILITY_TIMEOUT_SECONDS: i32 = 43_200;

/// How handlers receive the messages of an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ListenerMode {
    /// Each message is dispatched on its own.
    #[default]
    Single,
    /// Each received batch is dispatched as one unit to a batch handler.
    Batch,
}

/// Configuration for the SQS listener container.
///
/// The container's options are the defaults for every endpoint; an endpoint may
/// be added with its own options instead.
///
/// Options can be deserialized with serde (snake_case keys, with the camelCase
/// names accepted as aliases) or loaded from a file plus environment with
/// [`ContainerOptions::load`].
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ContainerOptions {
    /// Batch size requested per receive call (1-10).
    #[serde(alias = "maxMessagesPerPoll")]
    pub max_messages_per_poll: i32,

    /// Long-poll duration in seconds (0-20).
    #[serde(alias = "waitTimeSeconds")]
    pub wait_time_seconds: i32,

    /// Visibility timeout applied to received messages instead of the queue default.
    #[serde(alias = "visibilityTimeoutSeconds")]
    pub visibility_timeout_seconds: Option<i32>,

    /// Worker permits per endpoint. Defaults to `max_messages_per_poll`.
    #[serde(alias = "concurrencyLimit")]
    pub concurrency_limit: Option<usize>,

    #[serde(alias = "deletionPolicy")]
    pub deletion_policy: DeletionPolicy,

    /// Delay before polling again after a failed receive.
    #[serde(alias = "backOffTimeMillis")]
    pub back_off_time_millis: u64,

    /// Maximum time to wait for in-flight work when stopping.
    #[serde(alias = "stopTimeoutMillis")]
    pub stop_timeout_millis: u64,

    /// Start the container as soon as it is built.
    #[serde(alias = "autoStartup")]
    pub auto_startup: bool,

    /// Per-invocation handler timeout. No timeout when unset.
    #[serde(alias = "handlerTimeoutMillis")]
    pub handler_timeout_millis: Option<u64>,

    #[serde(alias = "listenerMode")]
    pub listener_mode: ListenerMode,

    /// Create queues that do not exist instead of failing at startup. Only the
    /// container-level value is used.
    #[serde(alias = "autoCreateQueues")]
    pub auto_create_queues: bool,

    /// Visibility timeout set on failed or timed out messages that would otherwise
    /// be left to expire, computed from their receive count.
    #[serde(alias = "failureBackOff")]
    pub failure_back_off: Option<VisibilityBackOff>,

    /// Attempts for each delete or visibility change call.
    #[serde(alias = "ackMaxAttempts")]
    pub ack_max_attempts: u32,

    /// Back-off step between acknowledgment attempts.
    #[serde(alias = "ackBackOffMillis")]
    pub ack_back_off_millis: u64,

    /// Message attribute naming the payload type.
    #[serde(alias = "payloadTypeAttribute")]
    pub payload_type_attribute: String,
}

impl Default for ContainerOptions {
    fn default() -> Self {
        ContainerOptions {
            max_messages_per_poll: MAX_MESSAGES_PER_POLL,
            wait_time_seconds: MAX_WAIT_TIME_SECONDS,
            visibility_timeout_seconds: None,
            concurrency_limit: None,
            deletion_policy: DeletionPolicy::OnSuccess,
            back_off_time_millis: 10_000,
            stop_timeout_millis: 20_000,
            auto_startup: true,
            handler_timeout_millis: None,
            listener_mode: ListenerMode::Single,
            auto_create_queues: false,
            failure_back_off: None,
            ack_max_attempts: 3,
            ack_back_off_millis: 200,
            payload_type_attribute: "PayloadType".to_string(),
        }
    }
}

impl ContainerOptions {
    /// Loads options from an optional file and from environment variables named
    /// `<env_prefix>_<OPTION>`, e.g. `SQS_LISTENER_MAX_MESSAGES_PER_POLL`.
    ///
    /// Environment values override the file; unset options keep their defaults.
    /// File keys must be snake_case.
    pub fn load(file: Option<&Path>, env_prefix: &str) -> Result<Self, SqsListenerError> {
        let mut builder = config::Config::builder();
        if let Some(path) = file {
            builder = builder.add_source(config::File::from(path));
        }

        let options: ContainerOptions = builder
            .add_source(config::Environment::with_prefix(env_prefix).try_parsing(true))
            .build()
            .and_then(|settings| settings.try_deserialize())
            .map_err(|e| SqsListenerError::InvalidConfiguration(e.to_string()))?;

        options.validate()?;
        Ok(options)
    }

    pub fn validate(&self) -> Result<(), SqsListenerError> {
        let invalid = |message: String| Err(SqsListenerError::InvalidConfiguration(message));

        if !(1..=MAX_MESSAGES_PER_POLL).contains(&self.max_messages_per_poll) {
            return invalid(format!(
                "max_messages_per_poll must be between 1 and {MAX_MESSAGES_PER_POLL}, got {}",
                self.max_messages_per_poll
            ));
        }
        if !(0..=MAX_WAIT_TIME_SECONDS).contains(&self.wait_time_seconds) {
            return invalid(format!(
                "wait_time_seconds must be between 0 and {MAX_WAIT_TIME_SECONDS}, got {}",
                self.wait_time_seconds
            ));
        }
        if let Some(seconds) = self.visibility_timeout_seconds {
            if !(0..=MAX_VISIBILITY_TIMEOUT_SECONDS).contains(&seconds) {
                return invalid(format!(
                    "visibility_timeout_seconds must be between 0 and \
                     {MAX_VISIBILITY_TIMEOUT_SECONDS}, got {seconds}"
                ));
            }
        }
        if let Some(back_off) = &self.failure_back_off {
            back_off.validate().map_err(|e| {
                SqsListenerError::InvalidConfiguration(format!("failure_back_off: {e}"))
            })?;
        }
        if self.concurrency_limit == Some(0) {
            return invalid("concurrency_limit must be at least 1".to_string());
        }
        let max_concurrency = tokio::sync::Semaphore::MAX_PERMITS.min(u32::MAX as usize);
        if self.concurrency_limit() > max_concurrency {
            return invalid(format!("concurrency_limit must not exceed {max_concurrency}"));
        }
        if self.handler_timeout_millis == Some(0) {
            return invalid("handler_timeout_millis must be greater than 0".to_string());
        }
        if self.ack_max_attempts == 0 {
            return invalid("ack_max_attempts must be at least 1".to_string());
        }
        if self.payload_type_attribute.is_empty() {
            return invalid("payload_type_attribute must not be empty".to_string());
        }
        Ok(())
    }

    pub fn concurrency_limit(&self) -> usize {
        self.concurrency_limit
            .unwrap_or_else(|| usize::try_from(self.max_messages_per_poll).unwrap_or(1))
    }

    pub fn back_off_time(&self) -> Duration {
        Duration::from_millis(self.back_off_time_millis)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_millis)
    }

    pub fn handler_timeout(&self) -> Option<Duration> {
        self.handler_timeout_millis.map(Duration::from_millis)
    }
}

/// One listened queue: its logical name, options and, once started, its URL.
#[derive(Debug)]
pub struct QueueEndpoint {
    name: Arc<str>,
    options: ContainerOptions,
    url: OnceLock<Arc<str>>,
}

impl QueueEndpoint {
    pub fn new(
        name: impl Into<String>,
        options: ContainerOptions,
    ) -> Result<Self, SqsListenerError> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(SqsListenerError::InvalidConfiguration(
                "queue name must not be empty".to_string(),
            ));
        }
        options.validate()?;
        Ok(QueueEndpoint {
            name: Arc::from(name),
            options,
            url: OnceLock::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn name_arc(&self) -> &Arc<str> {
        &self.name
    }

    pub fn options(&self) -> &ContainerOptions {
        &self.options
    }

    /// The physical queue URL, once resolved.
    pub fn queue_url(&self) -> Option<Arc<str>> {
        self.url.get().cloned()
    }

    /// Resolves the queue URL on first use; later calls return the same URL.
    pub async fn resolve_url(
        &self,
        destinations: &CachingDestinationResolver,
    ) -> Result<Arc<str>, SqsListenerError> {
        if let Some(url) = self.url.get() {
            return Ok(Arc::clone(url));
        }
        let resolved = destinations.resolve(&self.name).await?;
        Ok(Arc::clone(self.url.get_or_init(|| Arc::from(resolved))))
    }

    pub fn is_fifo(&self) -> bool {
        self.name.ends_with(".fifo")
            || self
                .url
                .get()
                .is_some_and(|url| url.ends_with(".fifo"))
    }

    pub fn concurrency_limit(&self) -> usize {
        self.options.concurrency_limit()
    }

    pub(crate) fn receive_request(&self, queue_url: &str) -> ReceiveRequest {
        ReceiveRequest {
            queue_url: queue_url.to_string(),
            max_number_of_messages: self.options.max_messages_per_poll,
            wait_time_seconds: self.options.wait_time_seconds,
            visibility_timeout_seconds: self.options.visibility_timeout_seconds,
        }
    }
}
