//! Intent execution with timeouts and bounded retries.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

use crate::axis::{Axis, AxisValue};
use crate::backoff::Backoff;
use crate::error::{AppResult, DriverError};
use crate::record::{IntentFailure, IntentOutcome, RetryNote};
use crate::scan::{Intent, Operation};

/// How transient driver failures are retried.
///
/// Only [`crate::error::DaqError::Driver`] failures are retried. Capability and
/// validation failures are returned after the first attempt.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Delay before each retry
    #[serde(default)]
    pub backoff: Backoff,
}

fn default_max_retries() -> u32 {
    3
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            backoff: Backoff::default(),
        }
    }
}

impl RetryPolicy {
    /// Never retry.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            backoff: Backoff::default(),
        }
    }

    /// Retry up to `max_retries` times on the default curve.
    pub fn with_max_retries(max_retries: u32) -> Self {
        Self {
            max_retries,
            ..Self::default()
        }
    }
}

/// One attempt, bounded by `timeout`.
async fn attempt(axis: &Axis, intent: &Intent, timeout: Option<Duration>) -> AppResult<AxisValue> {
    let op = async {
        match &intent.operation {
            Operation::Read => axis.read().await,
            Operation::Write(value) => axis.write(value).await,
        }
    };

    match timeout {
        None => op.await,
        Some(limit) => match tokio::time::timeout(limit, op).await {
            Ok(result) => result,
            Err(_) => Err(DriverError::timeout(
                axis.driver_type(),
                format!("{} of '{}' did not complete within {:?}", intent.op(), axis.path(), limit),
            )
            .into()),
        },
    }
}

/// Execute `intent` against `axis`, retrying transient failures.
///
/// Never fails: the final error, if any, is captured in the outcome together
/// with a note for every retried attempt.
pub async fn execute_intent(
    axis: &Axis,
    intent: &Intent,
    policy: &RetryPolicy,
    timeout: Option<Duration>,
) -> IntentOutcome {
    let started_at = Utc::now();
    let mut retries = Vec::new();
    let mut attempts = 0u32;

    let result = loop {
        attempts += 1;
        match attempt(axis, intent, timeout).await {
            Ok(value) => break Ok(value),
            Err(err) if err.is_transient() && attempts <= policy.max_retries => {
                let delay = policy.backoff.delay_for(attempts - 1);
                warn!(
                    axis = %intent.axis,
                    op = %intent.op(),
                    attempt = attempts,
                    retry_in = ?delay,
                    error = %err,
                    "transient failure, retrying"
                );
                retries.push(RetryNote {
                    attempt: attempts,
                    error: err.to_string(),
                    at: Utc::now(),
                });
                tokio::time::sleep(delay).await;
            }
            Err(err) => break Err(err),
        }
    };

    let (resolved, failure) = match result {
        Ok(value) => {
            debug!(axis = %intent.axis, op = %intent.op(), value = %value, attempts, "intent done");
            (Some(value), None)
        }
        Err(err) => (None, Some(IntentFailure::from_error(&err))),
    };

    IntentOutcome {
        axis: intent.axis.clone(),
        op: intent.op(),
        requested: intent.requested().cloned(),
        resolved,
        started_at,
        finished_at: Utc::now(),
        attempts,
        retries,
        failure,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::axis::MockAxisDriver;
    use crate::error::FailureKind;
    use std::sync::Arc;

    fn axis(driver: MockAxisDriver) -> Axis {
        Axis::builder("mc.x").driver(Arc::new(driver)).build().unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_are_retried() {
        let axis = axis(MockAxisDriver::new(1.0).failing_reads(2));
        let outcome =
            execute_intent(&axis, &Intent::read("mc.x"), &RetryPolicy::default(), None).await;

        assert!(outcome.succeeded());
        assert_eq!(outcome.attempts, 3);
        assert_eq!(outcome.retries.len(), 2);
        assert_eq!(outcome.retries[0].attempt, 1);
        assert_eq!(outcome.resolved, Some(AxisValue::Float(1.0)));
    }

    #[tokio::test(start_paused = true)]
    async fn retry_budget_is_bounded() {
        let axis = axis(MockAxisDriver::new(1.0).failing_reads(5));
        let policy = RetryPolicy::with_max_retries(2);
        let outcome = execute_intent(&axis, &Intent::read("mc.x"), &policy, None).await;

        assert_eq!(outcome.attempts, 3);
        assert_eq!(outcome.retries.len(), 2);
        assert_eq!(outcome.failure.unwrap().kind, FailureKind::Driver);
    }

    #[tokio::test]
    async fn validation_failures_are_not_retried() {
        let axis = Axis::builder("mc.x")
            .limits(0.0, 1.0)
            .driver(Arc::new(MockAxisDriver::new(0.0)))
            .build()
            .unwrap();
        let outcome = execute_intent(
            &axis,
            &Intent::write("mc.x", 5.0),
            &RetryPolicy::default(),
            None,
        )
        .await;

        assert_eq!(outcome.attempts, 1);
        assert!(outcome.retries.is_empty());
        assert_eq!(outcome.failure.unwrap().kind, FailureKind::Validation);
        assert_eq!(outcome.requested, Some(AxisValue::Float(5.0)));
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_is_a_transient_driver_error() {
        let axis = axis(MockAxisDriver::new(0.0).with_latency(Duration::from_secs(5)));
        let outcome = execute_intent(
            &axis,
            &Intent::read("mc.x"),
            &RetryPolicy::with_max_retries(1),
            Some(Duration::from_millis(100)),
        )
        .await;

        assert_eq!(outcome.attempts, 2);
        let failure = outcome.failure.unwrap();
        assert_eq!(failure.kind, FailureKind::Driver);
        assert!(failure.message.contains("did not complete"));
    }
}
