use async_trait::async_trait;
use serde_json::json;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{FaultClass, RlmError};
use crate::runlog::{LogEntry, LogLevel};
use crate::sandbox::RecursionHandler;
use crate::trace::Trace;
use crate::types::{Corpus, RecursionBudget, SessionId, SessionStatus};

use super::{Session, SessionRuntime, EXHAUSTED_SENTINEL};

/// Serves `recurse(question, text)` for one iteration of a parent session.
///
/// Each call runs a child session to completion before returning, so
/// siblings never overlap. Child traces are collected in call order and
/// handed to the parent's trace when the iteration ends.
pub struct SubSessionDispatcher {
    runtime: SessionRuntime,
    parent_id: SessionId,
    parent_depth: usize,
    budget: RecursionBudget,
    cancel: CancellationToken,
    deadline: Option<Instant>,
    children: Vec<Trace>,
}

impl SubSessionDispatcher {
    pub(crate) fn new(
        runtime: SessionRuntime,
        parent_id: SessionId,
        parent_depth: usize,
        budget: RecursionBudget,
        cancel: CancellationToken,
        deadline: Option<Instant>,
    ) -> Self {
        Self {
            runtime,
            parent_id,
            parent_depth,
            budget,
            cancel,
            deadline,
            children: Vec::new(),
        }
    }

    pub fn spawned(&self) -> usize {
        self.children.len()
    }

    pub fn into_children(self) -> Vec<Trace> {
        self.children
    }

    fn log(&self, level: LogLevel, message: String, payload: serde_json::Value) {
        self.runtime.logger.log(
            &LogEntry::new(level, "dispatcher", message)
                .with_session(&self.parent_id, self.parent_depth)
                .with_payload(payload),
        );
    }
}

#[async_trait]
impl RecursionHandler for SubSessionDispatcher {
    async fn recurse(&mut self, question: String, text: String) -> Result<String, RlmError> {
        let requested = self.parent_depth + 1;
        if requested > self.budget.max_depth {
            self.log(
                LogLevel::Warn,
                format!(
                    "recursion refused: depth {requested} exceeds max_depth {}",
                    self.budget.max_depth
                ),
                json!({ "requested": requested, "max_depth": self.budget.max_depth }),
            );
            return Err(RlmError::RecursionDepthExceeded {
                requested,
                max_depth: self.budget.max_depth,
            });
        }
        if self.cancel.is_cancelled() {
            return Err(RlmError::Cancelled);
        }

        let child = Session::child(
            self.runtime.clone(),
            self.parent_id.clone(),
            requested,
            question,
            Corpus::from(text),
            self.budget.for_child(&self.runtime.config.child),
            self.cancel.child_token(),
            self.deadline,
        );
        self.log(
            LogLevel::Info,
            format!("spawning sub-session {}", child.id()),
            json!({ "child": child.id().as_str(), "depth": requested }),
        );

        // Boxed so the parent's future does not contain the child's.
        let report = Box::pin(child.run()).await;
        let status = report.status;
        let answer = report.answer.clone();
        let failure = report.failure.clone();
        self.children.push(report.trace);

        match status {
            SessionStatus::Answered => Ok(answer.unwrap_or_default()),
            SessionStatus::Exhausted => Ok(EXHAUSTED_SENTINEL.to_string()),
            _ => match failure {
                Some(failure) if failure.class == FaultClass::Cancelled => Err(RlmError::Cancelled),
                Some(failure) => Ok(format!("sub-session failed: {}", failure.message)),
                None => Ok("sub-session failed".to_string()),
            },
        }
    }
}
