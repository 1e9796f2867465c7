use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{RlmError, RlmResult};
use crate::types::RecursionBudget;

/// Per-child overrides for sub-session budgets. `None` inherits the parent's value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChildLimits {
    pub max_iterations: Option<usize>,
    pub max_context_chars: Option<usize>,
}

/// Bounded retry around the reasoning agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 500,
            max_delay_ms: 10_000,
        }
    }
}

impl RetryPolicy {
    /// No retries at all.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Delay before retry number `attempt` (0-based): `base * 2^attempt`, capped.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u64.saturating_pow(attempt);
        let ms = self.base_delay_ms.saturating_mul(factor).min(self.max_delay_ms);
        Duration::from_millis(ms)
    }
}

/// Configuration for an orchestrator and every session it runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RlmConfig {
    pub max_iterations: usize,
    /// Absolute ceiling on session depth; the root is depth 0.
    pub max_depth: usize,
    /// Cap on the characters of rendered history sent to the agent.
    pub max_context_chars: usize,
    #[serde(with = "duration_ms")]
    pub execution_timeout: Duration,
    pub max_output_chars: usize,
    pub child: ChildLimits,
    #[serde(with = "opt_duration_ms", skip_serializing_if = "Option::is_none")]
    pub session_timeout: Option<Duration>,
    pub retry: RetryPolicy,
    pub workers: usize,
    pub max_queue_depth: usize,
    pub event_buffer: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_prompt_override: Option<String>,
}

impl Default for RlmConfig {
    fn default() -> Self {
        Self {
            max_iterations: 10,
            max_depth: 3,
            max_context_chars: 100_000,
            execution_timeout: Duration::from_secs(10),
            max_output_chars: 8_000,
            child: ChildLimits::default(),
            session_timeout: None,
            retry: RetryPolicy::default(),
            workers: 4,
            max_queue_depth: 16,
            event_buffer: 256,
            system_prompt_override: None,
        }
    }
}

impl RlmConfig {
    pub fn from_json(json: &str) -> RlmResult<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults with `RLM_*` environment overrides applied.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_overrides(|key| std::env::var(key).ok());
        config
    }

    /// Apply overrides from a key lookup. Unparseable or non-positive values are ignored.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let positive = |key: &str| -> Option<usize> {
            lookup(key)
                .and_then(|v| v.trim().parse::<usize>().ok())
                .filter(|v| *v > 0)
        };

        if let Some(v) = positive("RLM_MAX_ITERATIONS") {
            self.max_iterations = v;
        }
        if let Some(v) = positive("RLM_MAX_DEPTH") {
            self.max_depth = v;
        }
        if let Some(v) = positive("RLM_MAX_CONTEXT_CHARS") {
            self.max_context_chars = v;
        }
        if let Some(v) = positive("RLM_EXECUTION_TIMEOUT_MS") {
            self.execution_timeout = Duration::from_millis(v as u64);
        }
        if let Some(v) = positive("RLM_MAX_OUTPUT_CHARS") {
            self.max_output_chars = v;
        }
        if let Some(v) = positive("RLM_WORKERS") {
            self.workers = v;
        }
        if let Some(v) = positive("RLM_MAX_QUEUE_DEPTH") {
            self.max_queue_depth = v;
        }
    }

    pub fn validate(&self) -> RlmResult<()> {
        if self.max_iterations == 0 {
            return Err(RlmError::Config("max_iterations must be at least 1".into()));
        }
        if self.child.max_iterations == Some(0) {
            return Err(RlmError::Config(
                "child.max_iterations must be at least 1".into(),
            ));
        }
        if self.workers == 0 {
            return Err(RlmError::Config("workers must be at least 1".into()));
        }
        if self.execution_timeout.is_zero() {
            return Err(RlmError::Config("execution_timeout must be non-zero".into()));
        }
        if self.max_output_chars == 0 {
            return Err(RlmError::Config("max_output_chars must be non-zero".into()));
        }
        if self.event_buffer == 0 {
            return Err(RlmError::Config("event_buffer must be non-zero".into()));
        }
        Ok(())
    }

    /// Budget for a root session.
    pub fn budget(&self) -> RecursionBudget {
        RecursionBudget {
            max_iterations: self.max_iterations,
            max_depth: self.max_depth,
            max_context_chars: self.max_context_chars,
        }
    }

    pub fn with_max_iterations(mut self, n: usize) -> Self {
        self.max_iterations = n;
        self
    }

    pub fn with_max_depth(mut self, n: usize) -> Self {
        self.max_depth = n;
        self
    }

    pub fn with_max_context_chars(mut self, n: usize) -> Self {
        self.max_context_chars = n;
        self
    }

    pub fn with_execution_timeout(mut self, timeout: Duration) -> Self {
        self.execution_timeout = timeout;
        self
    }

    pub fn with_max_output_chars(mut self, n: usize) -> Self {
        self.max_output_chars = n;
        self
    }

    pub fn with_child_limits(mut self, child: ChildLimits) -> Self {
        self.child = child;
        self
    }

    pub fn with_session_timeout(mut self, timeout: Duration) -> Self {
        self.session_timeout = Some(timeout);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_workers(mut self, workers: usize, max_queue_depth: usize) -> Self {
        self.workers = workers;
        self.max_queue_depth = max_queue_depth;
        self
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt_override = Some(prompt.into());
        self
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

mod opt_duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match d {
            Some(d) => s.serialize_some(&(d.as_millis() as u64)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(d)?.map(Duration::from_millis))
    }
}
