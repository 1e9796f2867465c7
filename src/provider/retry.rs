use std::time::Duration;

use crate::config::RetryPolicy;
use crate::error::{RlmError, RlmResult};
use crate::types::{AgentPrompt, AgentReply};

use super::ReasoningAgent;

/// Call the agent, retrying transient failures with exponential backoff.
///
/// Makes at most `policy.max_retries + 1` attempts. A rate-limit hint
/// replaces the computed delay when it is longer (still capped at
/// `max_delay_ms`). Permanent errors stop immediately. Every failure that
/// ends the call is reported as `RlmError::UpstreamUnavailable`, except
/// `RlmError::Cancelled`, which passes through.
pub async fn complete_with_retry(
    agent: &dyn ReasoningAgent,
    prompt: &AgentPrompt,
    policy: &RetryPolicy,
) -> RlmResult<AgentReply> {
    let mut attempt: u32 = 0;
    loop {
        match agent.complete(prompt).await {
            Ok(reply) => return Ok(reply),
            Err(RlmError::Cancelled) => return Err(RlmError::Cancelled),
            Err(err) if err.is_transient() && attempt < policy.max_retries => {
                let mut delay = policy.backoff(attempt);
                if let Some(hint) = err.retry_after_ms() {
                    delay = delay.max(Duration::from_millis(hint.min(policy.max_delay_ms)));
                }
                tracing::warn!(
                    attempt = attempt + 1,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "reasoning agent call failed, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => {
                return Err(RlmError::UpstreamUnavailable {
                    attempts: attempt + 1,
                    last_error: err.to_string(),
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct Flaky {
        failures: Mutex<Vec<RlmError>>,
        calls: Mutex<u32>,
    }

    impl Flaky {
        fn new(failures: Vec<RlmError>) -> Self {
            Self {
                failures: Mutex::new(failures),
                calls: Mutex::new(0),
            }
        }

        fn calls(&self) -> u32 {
            *self.calls.lock().unwrap()
        }
    }

    #[async_trait]
    impl ReasoningAgent for Flaky {
        async fn complete(&self, _prompt: &AgentPrompt) -> RlmResult<AgentReply> {
            *self.calls.lock().unwrap() += 1;
            let mut failures = self.failures.lock().unwrap();
            if failures.is_empty() {
                Ok(AgentReply::new("print(1)", ""))
            } else {
                Err(failures.remove(0))
            }
        }
    }

    fn prompt() -> AgentPrompt {
        AgentPrompt {
            system: String::new(),
            messages: Vec::new(),
        }
    }

    fn fast_policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            base_delay_ms: 1,
            max_delay_ms: 5,
        }
    }

    #[tokio::test]
    async fn succeeds_after_transient_failures() {
        let agent = Flaky::new(vec![
            RlmError::Provider("502".into()),
            RlmError::RateLimited {
                provider: "mock".into(),
                retry_after_ms: 2,
            },
        ]);
        let reply = complete_with_retry(&agent, &prompt(), &fast_policy(3))
            .await
            .unwrap();
        assert_eq!(reply.program, "print(1)");
        assert_eq!(agent.calls(), 3);
    }

    #[tokio::test]
    async fn gives_up_after_max_retries() {
        let agent = Flaky::new((0..10).map(|_| RlmError::Provider("down".into())).collect());
        let err = complete_with_retry(&agent, &prompt(), &fast_policy(2))
            .await
            .unwrap_err();
        match err {
            RlmError::UpstreamUnavailable {
                attempts,
                last_error,
            } => {
                assert_eq!(attempts, 3);
                assert!(last_error.contains("down"));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(agent.calls(), 3);
    }

    #[tokio::test]
    async fn permanent_errors_are_not_retried() {
        let agent = Flaky::new(vec![RlmError::Auth("bad key".into())]);
        let err = complete_with_retry(&agent, &prompt(), &fast_policy(5))
            .await
            .unwrap_err();
        assert!(matches!(err, RlmError::UpstreamUnavailable { attempts: 1, .. }));
        assert_eq!(agent.calls(), 1);
    }

    #[tokio::test]
    async fn zero_retries_means_one_attempt() {
        let agent = Flaky::new(vec![RlmError::Provider("x".into())]);
        let err = complete_with_retry(&agent, &prompt(), &RetryPolicy::none())
            .await
            .unwrap_err();
        assert!(matches!(err, RlmError::UpstreamUnavailable { attempts: 1, .. }));
    }

    #[tokio::test]
    async fn cancellation_passes_through() {
        let agent = Flaky::new(vec![RlmError::Cancelled]);
        let err = complete_with_retry(&agent, &prompt(), &fast_policy(3))
            .await
            .unwrap_err();
        assert!(matches!(err, RlmError::Cancelled));
    }
}
