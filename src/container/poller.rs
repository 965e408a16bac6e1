use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::config::QueueEndpoint;
use super::dispatcher::Dispatcher;
use crate::client::QueueClient;
use crate::destination::CachingDestinationResolver;
use crate::errors::SqsListenerError;
use crate::message::InFlightMessage;

/// Lifecycle state of a [`QueuePoller`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollerState {
    Stopped,
    /// Resolving the queue URL.
    Starting,
    Polling,
    /// Stop requested; waiting for in-flight work.
    Draining,
}

struct RunningPoller {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// Long-polls one endpoint and feeds its dispatcher.
///
/// At most one receive call is outstanding at a time, and a receive is only
/// issued once the dispatcher has a free worker. Stopping closes the dispatcher;
/// starting again replaces it with a fresh one.
pub struct QueuePoller {
    endpoint: Arc<QueueEndpoint>,
    client: Arc<dyn QueueClient>,
    destinations: Arc<CachingDestinationResolver>,
    dispatcher: watch::Sender<Dispatcher>,
    state: watch::Sender<PollerState>,
    running: Mutex<Option<RunningPoller>>,
}

impl QueuePoller {
    pub fn new(
        endpoint: Arc<QueueEndpoint>,
        client: Arc<dyn QueueClient>,
        destinations: Arc<CachingDestinationResolver>,
        dispatcher: Dispatcher,
    ) -> Self {
        let (state, _) = watch::channel(PollerState::Stopped);
        let (dispatcher, _) = watch::channel(dispatcher);
        QueuePoller {
            endpoint,
            client,
            destinations,
            dispatcher,
            state,
            running: Mutex::new(None),
        }
    }

    pub fn endpoint(&self) -> &Arc<QueueEndpoint> {
        &self.endpoint
    }

    /// The dispatcher of the current (or last) run.
    pub fn dispatcher(&self) -> Dispatcher {
        self.dispatcher.borrow().clone()
    }

    pub fn state(&self) -> PollerState {
        *self.state.borrow()
    }

    pub fn is_running(&self) -> bool {
        self.state() == PollerState::Polling
    }

    /// Resolves the queue URL and starts the poll loop. Does nothing if the
    /// poller is already running.
    pub async fn start(&self) -> Result<(), SqsListenerError> {
        self.start_if_stopped().await.map(|_| ())
    }

    /// Like [`QueuePoller::start`], returning `true` only when this call started
    /// the poll loop.
    pub(crate) async fn start_if_stopped(&self) -> Result<bool, SqsListenerError> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Ok(false);
        }

        self.state.send_replace(PollerState::Starting);
        let queue_url = match self.endpoint.resolve_url(&self.destinations).await {
            Ok(url) => url,
            Err(e) => {
                self.state.send_replace(PollerState::Stopped);
                error!(queue = %self.endpoint.name(), error = %e, "Failed to start poller");
                return Err(e);
            }
        };

        let mut dispatcher = self.dispatcher();
        if dispatcher.is_closed() {
            dispatcher = dispatcher.reopen();
            self.dispatcher.send_replace(dispatcher.clone());
        }

        let (shutdown, shutdown_rx) = watch::channel(false);
        let poll_loop = PollLoop {
            endpoint: Arc::clone(&self.endpoint),
            client: Arc::clone(&self.client),
            dispatcher: dispatcher.clone(),
            queue_url: Arc::clone(&queue_url),
        };
        let task = tokio::spawn(poll_loop.run(shutdown_rx));
        *running = Some(RunningPoller { shutdown, task });
        self.state.send_replace(PollerState::Polling);

        info!(
            queue = %self.endpoint.name(),
            queue_url = %queue_url,
            max_messages = self.endpoint.options().max_messages_per_poll,
            concurrency_limit = dispatcher.concurrency_limit(),
            "Started polling"
        );
        Ok(true)
    }

    /// Stops polling and waits up to `timeout` for in-flight work.
    ///
    /// Returns `true` if everything finished in time. The poller is stopped
    /// either way.
    pub async fn stop(&self, timeout: Duration) -> bool {
        let mut running = self.running.lock().await;
        let Some(RunningPoller { shutdown, mut task }) = running.take() else {
            return true;
        };

        self.state.send_replace(PollerState::Draining);
        let deadline = Instant::now() + timeout;
        let _ = shutdown.send(true);

        let loop_stopped = match tokio::time::timeout_at(deadline, &mut task).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                error!(
                    queue = %self.endpoint.name(),
                    error = %e,
                    "Poll loop terminated abnormally"
                );
                true
            }
            Err(_) => {
                warn!(queue = %self.endpoint.name(), "Poll loop did not stop in time, aborting it");
                task.abort();
                false
            }
        };

        let dispatcher = self.dispatcher();
        let drained = dispatcher
            .drain(deadline.saturating_duration_since(Instant::now()))
            .await;
        if !drained {
            warn!(
                queue = %self.endpoint.name(),
                in_flight = dispatcher.in_flight(),
                "Stop timeout elapsed with messages still in flight"
            );
        }
        dispatcher.close();

        self.state.send_replace(PollerState::Stopped);
        info!(queue = %self.endpoint.name(), drained = loop_stopped && drained, "Stopped polling");
        loop_stopped && drained
    }
}

impl std::fmt::Debug for QueuePoller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueuePoller")
            .field("queue", &self.endpoint.name())
            .field("state", &self.state())
            .finish()
    }
}

struct PollLoop {
    endpoint: Arc<QueueEndpoint>,
    client: Arc<dyn QueueClient>,
    dispatcher: Dispatcher,
    queue_url: Arc<str>,
}

impl PollLoop {
    async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let request = self.endpoint.receive_request(&self.queue_url);
        let back_off = self.endpoint.options().back_off_time();
        let mut consecutive_errors: u32 = 0;

        loop {
            if *shutdown.borrow() {
                break;
            }

            tokio::select! {
                _ = self.dispatcher.wait_for_capacity() => {}
                _ = shutdown.changed() => break,
            }

            let received = tokio::select! {
                result = self.client.receive_messages(&request) => result,
                _ = shutdown.changed() => {
                    debug!(
                        queue = %self.endpoint.name(),
                        "Stop requested during receive, abandoning it"
                    );
                    break;
                }
            };

            match received {
                Ok(messages) => {
                    if consecutive_errors > 0 {
                        info!(
                            queue = %self.endpoint.name(),
                            previous_errors = consecutive_errors,
                            "Polling recovered after consecutive errors"
                        );
                        consecutive_errors = 0;
                    }
                    if messages.is_empty() {
                        continue;
                    }

                    debug!(
                        queue = %self.endpoint.name(),
                        message_count = messages.len(),
                        "Received messages"
                    );
                    let batch = messages
                        .into_iter()
                        .map(|raw| {
                            InFlightMessage::new(
                                raw,
                                Arc::clone(&self.endpoint),
                                Arc::clone(&self.queue_url),
                                Arc::clone(&self.client),
                            )
                        })
                        .collect();
                    if let Err(e) = self.dispatcher.dispatch(batch).await {
                        error!(
                            queue = %self.endpoint.name(),
                            error = %e,
                            "Dispatch failed, stopping poll loop"
                        );
                        break;
                    }
                }
                Err(source) => {
                    consecutive_errors = consecutive_errors.saturating_add(1);
                    let error = SqsListenerError::PollTransport {
                        queue: self.endpoint.name().to_string(),
                        source,
                    };
                    warn!(
                        queue = %self.endpoint.name(),
                        error = %error,
                        consecutive_errors,
                        back_off_ms = back_off.as_millis() as u64,
                        "Receive failed, backing off"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(back_off) => {}
                        _ = shutdown.changed() => break,
                    }
                }
            }
        }

        debug!(queue = %self.endpoint.name(), "Poll loop exited");
    }
}
