use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RlmError {
    #[error("Provider error: {0}")]
    Provider(String),

    #[error("Provider rate limited: {provider}, retry after {retry_after_ms}ms")]
    RateLimited {
        provider: String,
        retry_after_ms: u64,
    },

    #[error("Auth error: {0}")]
    Auth(String),

    #[error("Invalid provider response: {0}")]
    InvalidResponse(String),

    #[error("Upstream unavailable after {attempts} attempt(s): {last_error}")]
    UpstreamUnavailable { attempts: u32, last_error: String },

    #[error("RecursionDepthExceeded: requested depth {requested} exceeds max_depth {max_depth}")]
    RecursionDepthExceeded { requested: usize, max_depth: usize },

    #[error("Capacity exceeded: {in_flight} sessions in flight, capacity {capacity}")]
    CapacityExceeded { in_flight: usize, capacity: usize },

    #[error("Session cancelled")]
    Cancelled,

    #[error("Config error: {0}")]
    Config(String),

    #[error("Session error: {0}")]
    Session(String),

    /// A session ended `Failed`; `class` says why.
    #[error("Session failed ({class}): {message}")]
    Failed { class: FaultClass, message: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type RlmResult<T> = Result<T, RlmError>;

/// Closed classification of everything that can go wrong (or run out) while
/// answering a question. Callers branch on this instead of parsing messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultClass {
    /// Program failed the safety policy. Recoverable, fed back to the agent.
    SandboxRejected,
    /// Program raised while executing. Recoverable, fed back verbatim.
    SandboxRuntimeFault,
    /// Program exceeded its time budget. Recoverable.
    SandboxTimedOut,
    /// A `recurse` call asked for a depth beyond `max_depth`. Surfaced to the program.
    RecursionDepthExceeded,
    /// Iteration ceiling reached without an answer. Terminal, not an error.
    BudgetExhausted,
    /// Reasoning agent unreachable after retries. Terminal `Failed`.
    UpstreamUnavailable,
    /// Admission control refused a new top-level request.
    CapacityExceeded,
    /// The owner cancelled the session.
    Cancelled,
    /// Anything else (configuration, serialization, internal).
    Internal,
}

impl std::fmt::Display for FaultClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            FaultClass::SandboxRejected => "sandbox_rejected",
            FaultClass::SandboxRuntimeFault => "sandbox_runtime_fault",
            FaultClass::SandboxTimedOut => "sandbox_timed_out",
            FaultClass::RecursionDepthExceeded => "recursion_depth_exceeded",
            FaultClass::BudgetExhausted => "budget_exhausted",
            FaultClass::UpstreamUnavailable => "upstream_unavailable",
            FaultClass::CapacityExceeded => "capacity_exceeded",
            FaultClass::Cancelled => "cancelled",
            FaultClass::Internal => "internal",
        };
        write!(f, "{s}")
    }
}

impl RlmError {
    /// Whether a reasoning-agent call that failed with this error may be retried.
    pub fn is_transient(&self) -> bool {
        matches!(self, RlmError::Provider(_) | RlmError::RateLimited { .. })
    }

    /// Server-provided delay hint, if any.
    pub fn retry_after_ms(&self) -> Option<u64> {
        match self {
            RlmError::RateLimited { retry_after_ms, .. } => Some(*retry_after_ms),
            _ => None,
        }
    }

    pub fn class(&self) -> FaultClass {
        match self {
            RlmError::Provider(_)
            | RlmError::RateLimited { .. }
            | RlmError::Auth(_)
            | RlmError::InvalidResponse(_)
            | RlmError::UpstreamUnavailable { .. } => FaultClass::UpstreamUnavailable,
            RlmError::RecursionDepthExceeded { .. } => FaultClass::RecursionDepthExceeded,
            RlmError::CapacityExceeded { .. } => FaultClass::CapacityExceeded,
            RlmError::Cancelled => FaultClass::Cancelled,
            RlmError::Failed { class, .. } => *class,
            RlmError::Config(_) | RlmError::Session(_) | RlmError::Serialization(_) => {
                FaultClass::Internal
            }
        }
    }
}
