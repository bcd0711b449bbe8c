//! Error/retry policy applied around fallible operations.
//!
//! A policy is resolved in priority order: the step's own `on_error`, then
//! the pipeline's default, then a global default of fail. The same runner
//! wraps gateway calls made by the executor and by the tool layer.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{FlowgateError, config::Limits};

#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq, strum::AsRefStr, strum::EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum PolicyAction {
    /// Propagate the error and halt the run.
    #[default]
    Fail,
    /// Record the error on the step's output and proceed with an empty
    /// result; dependents detect it via the output's error flag.
    Continue,
    /// Re-invoke up to `retry_count` additional attempts, then behave as
    /// fail unless a fallback is configured.
    Retry,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct ErrorPolicy {
    #[serde(default)]
    pub action: PolicyAction,
    #[serde(default)]
    pub retry_count: Option<u64>,
    #[serde(default)]
    pub retry_delay_seconds: Option<u64>,
    /// Double the delay on every further attempt.
    #[serde(default)]
    pub retry_backoff: bool,
    /// Behavior once retries are exhausted; defaults to fail.
    #[serde(default)]
    pub fallback: Option<PolicyAction>,
}

impl ErrorPolicy {
    pub fn fail() -> Self {
        Self::default()
    }

    pub fn retry(
        count: u64,
        delay_seconds: u64,
    ) -> Self {
        Self {
            action: PolicyAction::Retry,
            retry_count: Some(count),
            retry_delay_seconds: Some(delay_seconds),
            retry_backoff: false,
            fallback: None,
        }
    }

    /// Resolve the effective policy: step override, then pipeline default,
    /// then the global default of fail.
    pub fn resolve(
        step: Option<&ErrorPolicy>,
        pipeline_default: Option<&ErrorPolicy>,
    ) -> ErrorPolicy {
        step.or(pipeline_default).cloned().unwrap_or_default()
    }
}

/// Outcome of running an operation under a policy.
#[derive(Debug, Clone)]
pub enum Attempted<T> {
    /// The operation succeeded; `attempts` counts every invocation made.
    Done {
        value: T,
        attempts: u64,
    },
    /// The operation failed but the policy absorbs it.
    Continued {
        error: FlowgateError,
        attempts: u64,
    },
    /// The operation failed and the failure propagates.
    Failed {
        error: FlowgateError,
        attempts: u64,
    },
}

/// Run an operation under a policy. The closure receives the 1-based attempt
/// number and must issue a fresh request per invocation, so every attempt
/// carries its own request id.
pub async fn run_with_policy<T, F, Fut>(
    policy: &ErrorPolicy,
    limits: &Limits,
    op: F,
) -> Attempted<T>
where
    F: Fn(u64) -> Fut,
    Fut: Future<Output = crate::Result<T>>,
{
    let retries = match policy.action {
        PolicyAction::Retry => policy.retry_count.unwrap_or(limits.default_retry_count),
        _ => 0,
    };
    let base_delay = policy.retry_delay_seconds.unwrap_or(limits.default_retry_delay_seconds);

    let mut attempts: u64 = 0;
    loop {
        attempts += 1;
        match op(attempts).await {
            Ok(value) => {
                return Attempted::Done {
                    value,
                    attempts,
                };
            }
            Err(error) => {
                let used_retries = attempts - 1;
                if policy.action == PolicyAction::Retry && used_retries < retries && error.is_retryable() {
                    if base_delay > 0 {
                        let delay = if policy.retry_backoff {
                            base_delay.saturating_mul(1 << used_retries.min(16))
                        } else {
                            base_delay
                        };
                        tokio::time::sleep(Duration::from_secs(delay)).await;
                    }
                    continue;
                }

                let absorbed = match policy.action {
                    PolicyAction::Continue => true,
                    PolicyAction::Retry => policy.fallback == Some(PolicyAction::Continue),
                    PolicyAction::Fail => false,
                };
                if absorbed {
                    return Attempted::Continued {
                        error,
                        attempts,
                    };
                }
                return Attempted::Failed {
                    error,
                    attempts,
                };
            }
        }
    }
}
