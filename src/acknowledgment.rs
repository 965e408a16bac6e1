//! Deletion policy and execution of acknowledgment decisions.
//!
//! "Requeue" is inaction: the message becomes visible again once its visibility
//! timeout expires and the queue's own redrive policy stays in control.

use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, error, warn};

use crate::client::QueueClient;
use crate::container::config::{ContainerOptions, MAX_VISIBILITY_TIMEOUT_SECONDS};
use crate::errors::{QueueServiceError, SqsListenerError};
use crate::message::{InFlightMessage, Outcome};

/// Rule mapping a handler outcome to the fate of the message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeletionPolicy {
    /// Delete only after successful handling.
    #[default]
    OnSuccess,
    /// Delete regardless of the outcome.
    Always,
    /// Never delete automatically; handlers acknowledge manually.
    Never,
    /// Delete regardless of the outcome, suppressing redelivery of failures.
    NoRedrive,
}

impl DeletionPolicy {
    pub fn decision(self, outcome: Outcome) -> AckDecision {
        match (self, outcome) {
            (_, Outcome::Pending | Outcome::Skipped) => AckDecision::Ignore,
            (DeletionPolicy::OnSuccess, Outcome::Succeeded) => AckDecision::Delete,
            (DeletionPolicy::OnSuccess, Outcome::Failed | Outcome::TimedOut) => {
                AckDecision::Requeue
            }
            (DeletionPolicy::Always | DeletionPolicy::NoRedrive, _) => AckDecision::Delete,
            (DeletionPolicy::Never, _) => AckDecision::Requeue,
        }
    }
}

impl FromStr for DeletionPolicy {
    type Err = SqsListenerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().replace('-', "_").as_str() {
            "ON_SUCCESS" => Ok(DeletionPolicy::OnSuccess),
            "ALWAYS" => Ok(DeletionPolicy::Always),
            "NEVER" => Ok(DeletionPolicy::Never),
            "NO_REDRIVE" => Ok(DeletionPolicy::NoRedrive),
            _ => Err(SqsListenerError::InvalidConfiguration(format!(
                "unknown deletion policy '{s}'"
            ))),
        }
    }
}

/// Visibility timeout applied to a failed message, derived from how often it has
/// been received.
///
/// Timeouts never exceed the queue service maximum of 12 hours.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(tag = "strategy", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VisibilityBackOff {
    /// The same timeout on every failure.
    Fixed { seconds: i32 },
    /// `initial_seconds + increment_seconds * (receive_count - 1)`.
    Linear {
        initial_seconds: i32,
        increment_seconds: i32,
        max_seconds: i32,
    },
    /// `initial_seconds * multiplier ^ (receive_count - 1)`.
    Exponential {
        initial_seconds: i32,
        multiplier: f64,
        max_seconds: i32,
    },
}

impl VisibilityBackOff {
    pub const DEFAULT_INITIAL_SECONDS: i32 = 100;
    pub const DEFAULT_INCREMENT_SECONDS: i32 = 2;
    pub const DEFAULT_MULTIPLIER: f64 = 2.0;

    pub fn linear() -> Self {
        VisibilityBackOff::Linear {
            initial_seconds: Self::DEFAULT_INITIAL_SECONDS,
            increment_seconds: Self::DEFAULT_INCREMENT_SECONDS,
            max_seconds: MAX_VISIBILITY_TIMEOUT_SECONDS,
        }
    }

    pub fn exponential() -> Self {
        VisibilityBackOff::Exponential {
            initial_seconds: Self::DEFAULT_INITIAL_SECONDS,
            multiplier: Self::DEFAULT_MULTIPLIER,
            max_seconds: MAX_VISIBILITY_TIMEOUT_SECONDS,
        }
    }

    /// Visibility timeout for a message received `receive_count` times. A count
    /// of zero is treated as the first receive.
    pub fn timeout_for(&self, receive_count: u32) -> i32 {
        let retries = receive_count.saturating_sub(1);
        let seconds = match *self {
            VisibilityBackOff::Fixed { seconds } => seconds,
            VisibilityBackOff::Linear {
                initial_seconds,
                increment_seconds,
                max_seconds,
            } => {
                let increase = i64::from(increment_seconds) * i64::from(retries);
                let seconds = (i64::from(initial_seconds) + increase).min(i64::from(max_seconds));
                i32::try_from(seconds).unwrap_or(max_seconds)
            }
            VisibilityBackOff::Exponential {
                initial_seconds,
                multiplier,
                max_seconds,
            } => {
                if initial_seconds <= 0 {
                    0
                } else {
                    let seconds = f64::from(initial_seconds) * multiplier.powf(f64::from(retries));
                    seconds.min(f64::from(max_seconds)) as i32
                }
            }
        };
        seconds.clamp(0, MAX_VISIBILITY_TIMEOUT_SECONDS)
    }

    /// Checks the parameters, returning a description of the first invalid one.
    pub fn validate(&self) -> Result<(), String> {
        let in_range = |name: &str, seconds: i32| {
            if (0..=MAX_VISIBILITY_TIMEOUT_SECONDS).contains(&seconds) {
                Ok(())
            } else {
                Err(format!(
                    "{name} must be between 0 and {MAX_VISIBILITY_TIMEOUT_SECONDS}, got {seconds}"
                ))
            }
        };

        match *self {
            VisibilityBackOff::Fixed { seconds } => in_range("seconds", seconds),
            VisibilityBackOff::Linear {
                initial_seconds,
                increment_seconds,
                max_seconds,
            } => {
                in_range("initial_seconds", initial_seconds)?;
                in_range("max_seconds", max_seconds)?;
                if increment_seconds < 1 {
                    return Err(format!(
                        "increment_seconds must be at least 1, got {increment_seconds}"
                    ));
                }
                ordered(initial_seconds, max_seconds)
            }
            VisibilityBackOff::Exponential {
                initial_seconds,
                multiplier,
                max_seconds,
            } => {
                in_range("initial_seconds", initial_seconds)?;
                in_range("max_seconds", max_seconds)?;
                if !multiplier.is_finite() || multiplier < 1.0 {
                    return Err(format!("multiplier must be at least 1, got {multiplier}"));
                }
                ordered(initial_seconds, max_seconds)
            }
        }
    }
}

fn ordered(initial_seconds: i32, max_seconds: i32) -> Result<(), String> {
    if initial_seconds > max_seconds {
        return Err(format!(
            "initial_seconds ({initial_seconds}) must not exceed max_seconds ({max_seconds})"
        ));
    }
    Ok(())
}

/// What happens to a message once its outcome is known.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckDecision {
    Delete,
    /// Leave the message alone; it is redelivered after its visibility timeout.
    Requeue,
    ExtendVisibility(i32),
    /// Nothing to do, e.g. the handler already acknowledged the message.
    Ignore,
}

/// Computes and executes acknowledgment decisions for one endpoint.
///
/// Delete and visibility calls are retried a bounded number of times with a
/// linear back-off. A call that still fails is logged and dropped: it never
/// reaches the handler or the poller.
#[derive(Debug, Clone)]
pub struct AcknowledgmentManager {
    policy: DeletionPolicy,
    failure_back_off: Option<VisibilityBackOff>,
    max_attempts: u32,
    back_off: Duration,
}

impl AcknowledgmentManager {
    pub fn new(policy: DeletionPolicy) -> Self {
        AcknowledgmentManager {
            policy,
            failure_back_off: None,
            max_attempts: 3,
            back_off: Duration::from_millis(200),
        }
    }

    pub fn from_options(options: &ContainerOptions) -> Self {
        Self::new(options.deletion_policy)
            .with_failure_back_off(options.failure_back_off)
            .with_retries(
                options.ack_max_attempts,
                Duration::from_millis(options.ack_back_off_millis),
            )
    }

    /// Turns requeues caused by failures or timeouts into a visibility change.
    pub fn with_failure_back_off(mut self, back_off: Option<VisibilityBackOff>) -> Self {
        self.failure_back_off = back_off;
        self
    }

    pub fn with_retries(mut self, max_attempts: u32, back_off: Duration) -> Self {
        self.max_attempts = max_attempts.max(1);
        self.back_off = back_off;
        self
    }

    pub fn policy(&self) -> DeletionPolicy {
        self.policy
    }

    pub fn decide(&self, message: &InFlightMessage, outcome: Outcome) -> AckDecision {
        if message.is_acknowledged() {
            return AckDecision::Ignore;
        }
        match (self.policy.decision(outcome), outcome) {
            (AckDecision::Requeue, Outcome::Failed | Outcome::TimedOut) => {
                match self.failure_back_off {
                    Some(back_off) => {
                        let receive_count = message.raw().receive_count().unwrap_or(1);
                        AckDecision::ExtendVisibility(back_off.timeout_for(receive_count))
                    }
                    None => AckDecision::Requeue,
                }
            }
            (decision, _) => decision,
        }
    }

    /// Decides the fate of `message` and carries the decision out.
    pub async fn acknowledge(&self, message: &InFlightMessage, outcome: Outcome) -> AckDecision {
        let decision = self.decide(message, outcome);
        debug!(
            message_id = %message.message_id(),
            queue = %message.endpoint().name(),
            outcome = ?outcome,
            decision = ?decision,
            "Applying acknowledgment decision"
        );

        let handle = message.ack_handle();
        let result = match decision {
            AckDecision::Delete => {
                self.call_with_retries(handle, "delete", || async move {
                    handle.delete().await.map(|_| ())
                })
                .await
            }
            AckDecision::ExtendVisibility(seconds) => {
                self.call_with_retries(handle, "change visibility", || async move {
                    handle.change_visibility(seconds).await
                })
                .await
            }
            AckDecision::Requeue | AckDecision::Ignore => Ok(()),
        };

        if let Err(e) = result {
            error!(
                message_id = %message.message_id(),
                queue = %message.endpoint().name(),
                decision = ?decision,
                attempts = self.max_attempts,
                error = %e,
                "Acknowledgment failed, dropping it; the message will be redelivered"
            );
        }
        decision
    }

    async fn call_with_retries<F, Fut>(
        &self,
        handle: &AckHandle,
        operation: &'static str,
        mut call: F,
    ) -> Result<(), SqsListenerError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<(), QueueServiceError>>,
    {
        let mut attempt: u32 = 1;
        loop {
            match call().await {
                Ok(()) => return Ok(()),
                Err(source) if attempt >= self.max_attempts => {
                    return Err(SqsListenerError::Acknowledgment {
                        message_id: handle.message_id().to_string(),
                        source,
                    });
                }
                Err(source) => {
                    warn!(
                        message_id = %handle.message_id(),
                        operation,
                        attempt,
                        error = %source,
                        "Acknowledgment call failed, retrying"
                    );
                    tokio::time::sleep(self.back_off * attempt).await;
                    attempt += 1;
                }
            }
        }
    }
}

/// Receipt handle of one received message, deleted at most once.
pub(crate) struct AckHandle {
    client: Arc<dyn QueueClient>,
    queue_url: Arc<str>,
    message_id: String,
    receipt_handle: String,
    deleted: AtomicBool,
}

impl AckHandle {
    pub(crate) fn new(
        client: Arc<dyn QueueClient>,
        queue_url: Arc<str>,
        message_id: String,
        receipt_handle: String,
    ) -> Self {
        AckHandle {
            client,
            queue_url,
            message_id,
            receipt_handle,
            deleted: AtomicBool::new(false),
        }
    }

    pub(crate) fn message_id(&self) -> &str {
        &self.message_id
    }

    pub(crate) fn is_deleted(&self) -> bool {
        self.deleted.load(Ordering::Acquire)
    }

    /// Deletes the message. Returns `Ok(false)` without a service call when the
    /// handle was already deleted.
    pub(crate) async fn delete(&self) -> Result<bool, QueueServiceError> {
        if self.deleted.swap(true, Ordering::AcqRel) {
            return Ok(false);
        }
        match self
            .client
            .delete_message(&self.queue_url, &self.receipt_handle)
            .await
        {
            Ok(()) => Ok(true),
            Err(e) => {
                self.deleted.store(false, Ordering::Release);
                Err(e)
            }
        }
    }

    pub(crate) async fn change_visibility(&self, seconds: i32) -> Result<(), QueueServiceError> {
        self.client
            .change_message_visibility(&self.queue_url, &self.receipt_handle, seconds)
            .await
    }
}

impl fmt::Debug for AckHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AckHandle")
            .field("queue_url", &self.queue_url)
            .field("message_id", &self.message_id)
            .field("deleted", &self.is_deleted())
            .finish()
    }
}

/// Lets a handler delete its message manually.
///
/// Once acknowledged, the automatic deletion policy leaves the message alone.
#[derive(Debug, Clone)]
pub struct Acknowledgment {
    handle: Arc<AckHandle>,
}

impl Acknowledgment {
    pub(crate) fn new(handle: Arc<AckHandle>) -> Self {
        Acknowledgment { handle }
    }

    pub async fn acknowledge(&self) -> Result<(), SqsListenerError> {
        self.handle
            .delete()
            .await
            .map(|_| ())
            .map_err(|source| SqsListenerError::Acknowledgment {
                message_id: self.handle.message_id().to_string(),
                source,
            })
    }

    pub fn is_acknowledged(&self) -> bool {
        self.handle.is_deleted()
    }
}

/// Lets a handler change the visibility timeout of its message.
#[derive(Debug, Clone)]
pub struct Visibility {
    handle: Arc<AckHandle>,
}

impl Visibility {
    pub(crate) fn new(handle: Arc<AckHandle>) -> Self {
        Visibility { handle }
    }

    /// Makes the message invisible for `seconds` from now.
    pub async fn change_to(&self, seconds: i32) -> Result<(), SqsListenerError> {
        self.handle
            .change_visibility(seconds)
            .await
            .map_err(|source| SqsListenerError::Acknowledgment {
                message_id: self.handle.message_id().to_string(),
                source,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn policy_table() {
        use AckDecision::{Delete, Requeue};
        use Outcome::{Failed, Succeeded, TimedOut};

        let expected = [
            (DeletionPolicy::OnSuccess, [Delete, Requeue, Requeue]),
            (DeletionPolicy::Always, [Delete, Delete, Delete]),
            (DeletionPolicy::Never, [Requeue, Requeue, Requeue]),
            (DeletionPolicy::NoRedrive, [Delete, Delete, Delete]),
        ];

        for (policy, decisions) in expected {
            for (outcome, decision) in [Succeeded, Failed, TimedOut].into_iter().zip(decisions) {
                assert_eq!(
                    policy.decision(outcome),
                    decision,
                    "{policy:?} with {outcome:?}"
                );
            }
        }
    }

    #[test]
    fn pending_and_skipped_outcomes_are_ignored() {
        for policy in [DeletionPolicy::Always, DeletionPolicy::NoRedrive] {
            assert_eq!(policy.decision(Outcome::Pending), AckDecision::Ignore);
            assert_eq!(policy.decision(Outcome::Skipped), AckDecision::Ignore);
        }
    }

    #[test]
    fn linear_back_off_grows_by_increment() {
        let back_off = VisibilityBackOff::linear();
        let timeouts: Vec<i32> = [1, 2, 3, 5, 7, 11, 13]
            .into_iter()
            .map(|count| back_off.timeout_for(count))
            .collect();
        assert_eq!(timeouts, vec![100, 102, 104, 108, 112, 120, 124]);
        assert_eq!(back_off.timeout_for(21_551), MAX_VISIBILITY_TIMEOUT_SECONDS);
    }

    #[test]
    fn exponential_back_off_doubles_until_the_maximum() {
        let back_off = VisibilityBackOff::exponential();
        let timeouts: Vec<i32> = [1, 2, 3, 5, 7]
            .into_iter()
            .map(|count| back_off.timeout_for(count))
            .collect();
        assert_eq!(timeouts, vec![100, 200, 400, 1600, 6400]);
        assert_eq!(back_off.timeout_for(11), MAX_VISIBILITY_TIMEOUT_SECONDS);
        assert_eq!(back_off.timeout_for(u32::MAX), MAX_VISIBILITY_TIMEOUT_SECONDS);
    }

    #[test]
    fn back_off_respects_its_own_maximum() {
        let back_off = VisibilityBackOff::Exponential {
            initial_seconds: 500,
            multiplier: 2.0,
            max_seconds: 501,
        };
        assert_eq!(back_off.timeout_for(1), 500);
        assert_eq!(back_off.timeout_for(2), 501);
        assert_eq!(back_off.timeout_for(0), 500);

        let fixed = VisibilityBackOff::Fixed { seconds: 30 };
        assert_eq!(fixed.timeout_for(9), 30);
    }

    #[test]
    fn rejects_invalid_back_off() {
        let too_small_multiplier = VisibilityBackOff::Exponential {
            initial_seconds: 10,
            multiplier: 0.5,
            max_seconds: 100,
        };
        let inverted = VisibilityBackOff::Linear {
            initial_seconds: 200,
            increment_seconds: 1,
            max_seconds: 100,
        };
        let too_long = VisibilityBackOff::Fixed { seconds: 50_000 };

        assert!(too_small_multiplier.validate().is_err());
        assert!(inverted.validate().is_err());
        assert!(too_long.validate().is_err());
        assert!(VisibilityBackOff::linear().validate().is_ok());
        assert!(VisibilityBackOff::exponential().validate().is_ok());
    }

    #[test]
    fn deserializes_back_off_strategy() {
        let back_off: VisibilityBackOff = serde_json::from_str(
            r#"{"strategy":"LINEAR","initial_seconds":10,"increment_seconds":5,"max_seconds":60}"#,
        )
        .unwrap();
        assert_eq!(
            back_off,
            VisibilityBackOff::Linear {
                initial_seconds: 10,
                increment_seconds: 5,
                max_seconds: 60,
            }
        );
    }

    #[test]
    fn parses_policy_names() {
        assert_eq!(
            "ON_SUCCESS".parse::<DeletionPolicy>().unwrap(),
            DeletionPolicy::OnSuccess
        );
        assert_eq!(
            "no-redrive".parse::<DeletionPolicy>().unwrap(),
            DeletionPolicy::NoRedrive
        );
        assert!("SOMETIMES".parse::<DeletionPolicy>().is_err());
    }

    #[test]
    fn deserializes_policy() {
        let policy: DeletionPolicy = serde_json::from_str(r#""NEVER""#).unwrap();
        assert_eq!(policy, DeletionPolicy::Never);
    }
}
