use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, error, warn};

use super::config::{ListenerMode, QueueEndpoint};
use crate::acknowledgment::AcknowledgmentManager;
use crate::errors::SqsListenerError;
use crate::handler::{HandlerResolver, PayloadType};
use crate::message::{InFlightMessage, Outcome};

/// Bounded worker pool of one endpoint.
///
/// Every unit of work (a message, a FIFO message group or a batch) holds one
/// worker permit from submission until its acknowledgment has been applied.
/// Submitting waits for a free permit.
#[derive(Clone)]
pub struct Dispatcher {
    endpoint: Arc<QueueEndpoint>,
    resolver: Arc<HandlerResolver>,
    acknowledgments: AcknowledgmentManager,
    permits: Arc<Semaphore>,
    concurrency_limit: usize,
}

impl Dispatcher {
    pub fn new(endpoint: Arc<QueueEndpoint>, resolver: Arc<HandlerResolver>) -> Self {
        let concurrency_limit = endpoint.concurrency_limit();
        Dispatcher {
            acknowledgments: AcknowledgmentManager::from_options(endpoint.options()),
            permits: Arc::new(Semaphore::new(concurrency_limit)),
            endpoint,
            resolver,
            concurrency_limit,
        }
    }

    pub fn endpoint(&self) -> &Arc<QueueEndpoint> {
        &self.endpoint
    }

    pub fn concurrency_limit(&self) -> usize {
        self.concurrency_limit
    }

    /// Number of units currently holding a worker permit.
    pub fn in_flight(&self) -> usize {
        self.concurrency_limit
            .saturating_sub(self.permits.available_permits())
    }

    /// Resolves once at least one worker permit is free.
    pub async fn wait_for_capacity(&self) {
        // Only the poll loop acquires permits, so a free permit stays free until
        // the next submission.
        let _ = self.permits.acquire().await;
    }

    /// Dispatches a received batch according to the endpoint's listener mode.
    ///
    /// Returns the number of submitted units. Completion is observed through
    /// [`Dispatcher::drain`].
    pub async fn dispatch(
        &self,
        messages: Vec<InFlightMessage>,
    ) -> Result<usize, SqsListenerError> {
        if messages.is_empty() {
            return Ok(0);
        }
        if self.endpoint.options().listener_mode == ListenerMode::Batch {
            self.submit_batch(messages).await?;
            return Ok(1);
        }
        if !self.endpoint.is_fifo() {
            let count = messages.len();
            for message in messages {
                self.submit(message).await?;
            }
            return Ok(count);
        }

        let (groups, ungrouped) = group_by_message_group(messages);
        let count = groups.len() + ungrouped.len();
        for group in groups {
            self.submit_group(group).await?;
        }
        for message in ungrouped {
            self.submit(message).await?;
        }
        Ok(count)
    }

    /// Processes one message on its own worker.
    pub async fn submit(
        &self,
        message: InFlightMessage,
    ) -> Result<JoinHandle<Outcome>, SqsListenerError> {
        let permit = self.acquire().await?;
        let worker = self.clone();
        Ok(tokio::spawn(async move {
            let _permit = permit;
            worker.process(message).await
        }))
    }

    /// Processes messages one after another on a single worker, in order.
    ///
    /// The first message that fails or times out stops the group: the messages
    /// after it are not handled and come back as [`Outcome::Skipped`], left on the
    /// queue for redelivery.
    pub async fn submit_group(
        &self,
        messages: Vec<InFlightMessage>,
    ) -> Result<JoinHandle<Vec<Outcome>>, SqsListenerError> {
        let permit = self.acquire().await?;
        let worker = self.clone();
        Ok(tokio::spawn(async move {
            let _permit = permit;
            worker.process_group(messages).await
        }))
    }

    /// Hands a whole batch to batch handlers, grouped by payload type.
    ///
    /// Each group's outcome applies to every message in the group. Outcomes are
    /// returned in the order of `messages`.
    pub async fn submit_batch(
        &self,
        messages: Vec<InFlightMessage>,
    ) -> Result<JoinHandle<Vec<Outcome>>, SqsListenerError> {
        let permit = self.acquire().await?;
        let worker = self.clone();
        Ok(tokio::spawn(async move {
            let _permit = permit;
            worker.process_batch(messages).await
        }))
    }

    /// Waits until every permit is returned. Returns `false` if work is still in
    /// flight when `timeout` elapses.
    pub async fn drain(&self, timeout: Duration) -> bool {
        let all = u32::try_from(self.concurrency_limit).unwrap_or(u32::MAX);
        match tokio::time::timeout(timeout, self.permits.acquire_many(all)).await {
            Ok(Ok(_)) => true,
            Ok(Err(_)) => self.in_flight() == 0,
            Err(_) => false,
        }
    }

    /// Rejects further submissions with [`SqsListenerError::DispatcherClosed`].
    /// Work already submitted runs to completion.
    pub fn close(&self) {
        self.permits.close();
    }

    pub fn is_closed(&self) -> bool {
        self.permits.is_closed()
    }

    /// A dispatcher for the same endpoint with a fresh worker pool.
    pub(crate) fn reopen(&self) -> Dispatcher {
        Dispatcher::new(Arc::clone(&self.endpoint), Arc::clone(&self.resolver))
    }

    async fn acquire(&self) -> Result<OwnedSemaphorePermit, SqsListenerError> {
        Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|_| SqsListenerError::DispatcherClosed(self.endpoint.name().to_string()))
    }

    fn payload_type_of(&self, message: &InFlightMessage) -> PayloadType {
        self.resolver
            .payload_type_of(message.raw(), &self.endpoint.options().payload_type_attribute)
    }

    async fn process(&self, mut message: InFlightMessage) -> Outcome {
        let payload_type = self.payload_type_of(&message);
        message.set_payload_type(payload_type);

        let outcome = match self.resolver.resolve(payload_type) {
            Ok(handler) => {
                let view = message.to_message();
                self.run_handler(message.message_id(), async move { handler.handle(view).await })
                    .await
            }
            Err(e) => {
                error!(
                    queue = %self.endpoint.name(),
                    message_id = %message.message_id(),
                    error = %e,
                    "Cannot dispatch message"
                );
                Outcome::Failed
            }
        };

        message.set_outcome(outcome);
        self.acknowledgments.acknowledge(&message, outcome).await;
        outcome
    }

    async fn process_group(&self, messages: Vec<InFlightMessage>) -> Vec<Outcome> {
        let mut outcomes = Vec::with_capacity(messages.len());
        let mut messages = messages.into_iter();

        while let Some(message) = messages.next() {
            let message_id = message.message_id().to_string();
            let group_id = message.raw().message_group_id().map(str::to_string);
            let outcome = self.process(message).await;
            outcomes.push(outcome);
            if matches!(outcome, Outcome::Failed | Outcome::TimedOut) {
                let skipped = messages.len();
                if skipped > 0 {
                    warn!(
                        queue = %self.endpoint.name(),
                        message_group_id = ?group_id,
                        message_id = %message_id,
                        skipped,
                        "Message group stopped after a failure, leaving the rest for redelivery"
                    );
                }
                for mut message in messages.by_ref() {
                    message.set_outcome(Outcome::Skipped);
                    self.acknowledgments
                        .acknowledge(&message, Outcome::Skipped)
                        .await;
                    outcomes.push(Outcome::Skipped);
                }
            }
        }
        outcomes
    }

    async fn process_batch(&self, mut messages: Vec<InFlightMessage>) -> Vec<Outcome> {
        let mut groups: Vec<(PayloadType, Vec<usize>)> = Vec::new();
        for (index, message) in messages.iter_mut().enumerate() {
            let payload_type = self.payload_type_of(message);
            message.set_payload_type(payload_type);
            match groups.iter_mut().find(|(group_type, _)| *group_type == payload_type) {
                Some((_, indices)) => indices.push(index),
                None => groups.push((payload_type, vec![index])),
            }
        }

        let mut outcomes = vec![Outcome::Pending; messages.len()];
        for (payload_type, indices) in groups {
            let first_id = messages[indices[0]].message_id().to_string();
            let outcome = match self.resolver.resolve_batch(payload_type) {
                Ok(handler) => {
                    let views: Vec<_> = indices.iter().map(|&i| messages[i].to_message()).collect();
                    debug!(
                        queue = %self.endpoint.name(),
                        payload_type = %payload_type,
                        size = indices.len(),
                        "Dispatching batch"
                    );
                    self.run_handler(&first_id, async move { handler.handle_batch(views).await })
                        .await
                }
                Err(e) => {
                    error!(
                        queue = %self.endpoint.name(),
                        payload_type = %payload_type,
                        error = %e,
                        "Cannot dispatch batch"
                    );
                    Outcome::Failed
                }
            };
            for &index in &indices {
                messages[index].set_outcome(outcome);
                outcomes[index] = outcome;
            }
        }

        join_all(
            messages
                .iter()
                .map(|message| self.acknowledgments.acknowledge(message, message.outcome())),
        )
        .await;
        outcomes
    }

    /// Runs a handler invocation on its own task and maps the result to an outcome.
    ///
    /// A timed out invocation is detached, not cancelled: it keeps running and its
    /// result is discarded.
    async fn run_handler<F>(&self, message_id: &str, invocation: F) -> Outcome
    where
        F: Future<Output = Result<(), SqsListenerError>> + Send + 'static,
    {
        let mut task = tokio::spawn(invocation);

        let joined = match self.endpoint.options().handler_timeout() {
            Some(limit) => match tokio::time::timeout(limit, &mut task).await {
                Ok(joined) => joined,
                Err(_) => {
                    warn!(
                        queue = %self.endpoint.name(),
                        message_id = %message_id,
                        timeout_ms = limit.as_millis() as u64,
                        "Handler timed out, detaching it"
                    );
                    return Outcome::TimedOut;
                }
            },
            None => task.await,
        };

        match joined {
            Ok(Ok(())) => Outcome::Succeeded,
            Ok(Err(e)) => {
                warn!(
                    queue = %self.endpoint.name(),
                    message_id = %message_id,
                    error = %e,
                    "Handler failed"
                );
                Outcome::Failed
            }
            Err(join_error) => {
                let error = SqsListenerError::HandlerInvocation {
                    message_id: message_id.to_string(),
                    reason: describe_join_error(join_error),
                };
                error!(queue = %self.endpoint.name(), error = %error, "Handler task failed");
                Outcome::Failed
            }
        }
    }
}

fn describe_join_error(error: JoinError) -> String {
    if !error.is_panic() {
        return error.to_string();
    }
    let panic = error.into_panic();
    panic
        .downcast_ref::<String>()
        .map(String::as_str)
        .or_else(|| panic.downcast_ref::<&str>().copied())
        .unwrap_or("unknown panic")
        .to_string()
}

/// Splits a FIFO batch into message groups in order of first appearance. Messages
/// without a group id are returned separately.
fn group_by_message_group(
    messages: Vec<InFlightMessage>,
) -> (Vec<Vec<InFlightMessage>>, Vec<InFlightMessage>) {
    let mut positions: HashMap<String, usize> = HashMap::new();
    let mut groups: Vec<Vec<InFlightMessage>> = Vec::new();
    let mut ungrouped = Vec::new();

    for message in messages {
        let Some(group_id) = message.raw().message_group_id().map(str::to_string) else {
            ungrouped.push(message);
            continue;
        };
        match positions.get(&group_id) {
            Some(&position) => groups[position].push(message),
            None => {
                positions.insert(group_id, groups.len());
                groups.push(vec![message]);
            }
        }
    }
    (groups, ungrouped)
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("queue", &self.endpoint.name())
            .field("concurrency_limit", &self.concurrency_limit)
            .field("in_flight", &self.in_flight())
            .finish()
    }
}
