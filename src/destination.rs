//! Resolution of logical queue names to physical queue URLs.

use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::OnceCell;
use tracing::{debug, info};

use crate::client::QueueClient;
use crate::errors::{QueueServiceError, SqsListenerError};

/// A queue reference given as an SQS ARN, `arn:<partition>:sqs:<region>:<account>:<name>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueArn<'a> {
    pub region: &'a str,
    pub account_id: &'a str,
    pub queue_name: &'a str,
}

impl<'a> QueueArn<'a> {
    pub fn parse(value: &'a str) -> Option<Self> {
        match value.split(':').collect::<Vec<_>>().as_slice() {
            &["arn", _partition, "sqs", region, account_id, queue_name]
                if !account_id.is_empty() && !queue_name.is_empty() =>
            {
                Some(QueueArn {
                    region,
                    account_id,
                    queue_name,
                })
            }
            _ => None,
        }
    }
}

fn is_queue_url(value: &str) -> bool {
    value.starts_with("https://") || value.starts_with("http://")
}

/// Resolves queue names to URLs and caches every successful resolution.
///
/// Accepted destinations are a queue URL (returned as is), a queue ARN (looked up
/// in the owning account) or a plain queue name. Concurrent first lookups of the
/// same name share a single service call. Failed lookups are not cached.
pub struct CachingDestinationResolver {
    client: Arc<dyn QueueClient>,
    auto_create: bool,
    cache: DashMap<String, Arc<OnceCell<String>>>,
}

impl CachingDestinationResolver {
    pub fn new(client: Arc<dyn QueueClient>) -> Self {
        CachingDestinationResolver {
            client,
            auto_create: false,
            cache: DashMap::new(),
        }
    }

    /// Creates missing queues instead of failing.
    pub fn with_auto_create(mut self, auto_create: bool) -> Self {
        self.auto_create = auto_create;
        self
    }

    pub async fn resolve(&self, name: &str) -> Result<String, SqsListenerError> {
        if is_queue_url(name) {
            return Ok(name.to_string());
        }

        // The cell is cloned out so no map shard lock is held across the lookup.
        let cell = Arc::clone(
            self.cache
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(OnceCell::new()))
                .value(),
        );

        let url = cell.get_or_try_init(|| self.lookup(name)).await?;
        Ok(url.clone())
    }

    /// Number of destinations resolved so far.
    pub fn cached_count(&self) -> usize {
        self.cache.iter().filter(|entry| entry.value().initialized()).count()
    }

    async fn lookup(&self, name: &str) -> Result<String, SqsListenerError> {
        let (queue_name, owner) = match QueueArn::parse(name) {
            Some(arn) => (arn.queue_name, Some(arn.account_id)),
            None => (name, None),
        };

        debug!(destination = name, "Resolving queue URL");
        match self.client.get_queue_url(queue_name, owner).await {
            Ok(url) => Ok(url),
            Err(QueueServiceError::QueueDoesNotExist(_)) if self.auto_create => {
                info!(queue = queue_name, "Queue does not exist, creating it");
                self.client
                    .create_queue(queue_name)
                    .await
                    .map_err(|e| invalid_destination(name, e))
            }
            Err(e) => Err(invalid_destination(name, e)),
        }
    }
}

fn invalid_destination(name: &str, error: QueueServiceError) -> SqsListenerError {
    SqsListenerError::InvalidDestination {
        name: name.to_string(),
        reason: error.to_string(),
    }
}

impl fmt::Debug for CachingDestinationResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CachingDestinationResolver")
            .field("auto_create", &self.auto_create)
            .field("cached", &self.cached_count())
            .finish()
    }
}
