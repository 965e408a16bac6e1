#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rs_sqs_listener::client::{QueueClient, ReceiveRequest};
use rs_sqs_listener::errors::QueueServiceError;
use rs_sqs_listener::message::RawMessage;

pub const QUEUE_URL_PREFIX: &str = "https://sqs.us-east-1.amazonaws.com/000000000000/";

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn queue_url(name: &str) -> String {
    format!("{QUEUE_URL_PREFIX}{name}")
}

/// A message tagged with a payload type name.
pub fn typed_message(id: &str, payload_type: &str, body: &str) -> RawMessage {
    RawMessage::new(id, format!("rh-{id}"), body)
        .with_message_attribute("PayloadType", payload_type)
}

#[derive(Default)]
struct MockState {
    queues: HashMap<String, VecDeque<RawMessage>>,
    deleted: Vec<String>,
    visibility_changes: Vec<(String, i32)>,
    receive_calls: usize,
    get_queue_url_calls: usize,
    create_queue_calls: usize,
    owners: Vec<Option<String>>,
    failing_receives: usize,
    failing_deletes: usize,
    failing_lookups: usize,
    active_receives: usize,
    max_concurrent_receives: usize,
}

/// In-memory queue service.
///
/// Empty receives sleep for a short simulated long poll instead of the requested
/// wait time, and name lookups take a few milliseconds so concurrent callers overlap.
#[derive(Default)]
pub struct MockQueueClient {
    state: Mutex<MockState>,
}

impl MockQueueClient {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_queue(&self, name: &str) -> String {
        let url = queue_url(name);
        self.state
            .lock()
            .unwrap()
            .queues
            .entry(url.clone())
            .or_default();
        url
    }

    pub fn push(&self, name: &str, message: RawMessage) {
        self.state
            .lock()
            .unwrap()
            .queues
            .entry(queue_url(name))
            .or_default()
            .push_back(message);
    }

    pub fn deleted(&self) -> Vec<String> {
        self.state.lock().unwrap().deleted.clone()
    }

    pub fn visibility_changes(&self) -> Vec<(String, i32)> {
        self.state.lock().unwrap().visibility_changes.clone()
    }

    pub fn receive_calls(&self) -> usize {
        self.state.lock().unwrap().receive_calls
    }

    pub fn get_queue_url_calls(&self) -> usize {
        self.state.lock().unwrap().get_queue_url_calls
    }

    pub fn create_queue_calls(&self) -> usize {
        self.state.lock().unwrap().create_queue_calls
    }

    pub fn owners(&self) -> Vec<Option<String>> {
        self.state.lock().unwrap().owners.clone()
    }

    pub fn max_concurrent_receives(&self) -> usize {
        self.state.lock().unwrap().max_concurrent_receives
    }

    pub fn fail_next_receives(&self, count: usize) {
        self.state.lock().unwrap().failing_receives = count;
    }

    pub fn fail_next_deletes(&self, count: usize) {
        self.state.lock().unwrap().failing_deletes = count;
    }

    pub fn fail_next_lookups(&self, count: usize) {
        self.state.lock().unwrap().failing_lookups = count;
    }
}

struct ActiveReceive<'a>(&'a Mutex<MockState>);

impl Drop for ActiveReceive<'_> {
    fn drop(&mut self) {
        if let Ok(mut state) = self.0.lock() {
            state.active_receives -= 1;
        }
    }
}

#[async_trait]
impl QueueClient for MockQueueClient {
    async fn receive_messages(
        &self,
        request: &ReceiveRequest,
    ) -> Result<Vec<RawMessage>, QueueServiceError> {
        let (failing, messages) = {
            let mut state = self.state.lock().unwrap();
            state.receive_calls += 1;
            state.active_receives += 1;
            state.max_concurrent_receives =
                state.max_concurrent_receives.max(state.active_receives);

            if state.failing_receives > 0 {
                state.failing_receives -= 1;
                (true, Vec::new())
            } else {
                let max = request.max_number_of_messages as usize;
                let queue = state
                    .queues
                    .get_mut(&request.queue_url)
                    .ok_or_else(|| QueueServiceError::QueueDoesNotExist(request.queue_url.clone()));
                match queue {
                    Ok(queue) => {
                        let count = max.min(queue.len());
                        (false, queue.drain(..count).collect::<Vec<_>>())
                    }
                    Err(e) => {
                        state.active_receives -= 1;
                        return Err(e);
                    }
                }
            }
        };
        let _active = ActiveReceive(&self.state);

        if failing {
            tokio::time::sleep(Duration::from_millis(5)).await;
            return Err(QueueServiceError::Transport("connection reset".to_string()));
        }
        if messages.is_empty() && request.wait_time_seconds > 0 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        } else {
            tokio::task::yield_now().await;
        }
        Ok(messages)
    }

    async fn delete_message(
        &self,
        _queue_url: &str,
        receipt_handle: &str,
    ) -> Result<(), QueueServiceError> {
        let mut state = self.state.lock().unwrap();
        if state.failing_deletes > 0 {
            state.failing_deletes -= 1;
            return Err(QueueServiceError::Transport("throttled".to_string()));
        }
        state.deleted.push(receipt_handle.to_string());
        Ok(())
    }

    async fn change_message_visibility(
        &self,
        _queue_url: &str,
        receipt_handle: &str,
        visibility_timeout_seconds: i32,
    ) -> Result<(), QueueServiceError> {
        self.state
            .lock()
            .unwrap()
            .visibility_changes
            .push((receipt_handle.to_string(), visibility_timeout_seconds));
        Ok(())
    }

    async fn get_queue_url(
        &self,
        queue_name: &str,
        owner_account_id: Option<&str>,
    ) -> Result<String, QueueServiceError> {
        {
            let mut state = self.state.lock().unwrap();
            state.get_queue_url_calls += 1;
            state.owners.push(owner_account_id.map(str::to_string));
        }
        tokio::time::sleep(Duration::from_millis(10)).await;

        let mut state = self.state.lock().unwrap();
        if state.failing_lookups > 0 {
            state.failing_lookups -= 1;
            return Err(QueueServiceError::Transport("service unavailable".to_string()));
        }
        let url = queue_url(queue_name);
        if state.queues.contains_key(&url) {
            Ok(url)
        } else {
            Err(QueueServiceError::QueueDoesNotExist(queue_name.to_string()))
        }
    }

    async fn create_queue(&self, queue_name: &str) -> Result<String, QueueServiceError> {
        let mut state = self.state.lock().unwrap();
        state.create_queue_calls += 1;
        let url = queue_url(queue_name);
        state.queues.entry(url.clone()).or_default();
        Ok(url)
    }
}

/// Polls `condition` every few milliseconds until it holds or `timeout` elapses.
pub async fn eventually<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
