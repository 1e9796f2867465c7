//! Session: one root-or-sub reasoning loop.
//!
//! Each pass of the loop prompts the agent, classifies the returned program
//! with the safety policy, runs it in the sandbox, records the iteration and
//! asks the completion detector whether the session is done:
//!
//! ```text
//!  ┌─▶ budget / deadline / cancel check ──▶ Exhausted | Failed
//!  │         │
//!  │   prompt ─▶ agent ──(error)──▶ Failed
//!  │         │
//!  │   policy ─▶ Rejected ─┐
//!  │         │             │
//!  │   executor ─▶ outcome ┤   recurse() ─▶ child Session (nested)
//!  │                       ▼
//!  │             record + event
//!  │                       │
//!  └──── Continue ◀─ detector ─▶ Answered
//! ```
//!
//! A session is driven by exactly one task and its state is never shared.

mod completion;
mod dispatcher;
mod prompt;

pub use completion::{CompletionDetector, Detection};
pub use dispatcher::SubSessionDispatcher;
pub use prompt::{PromptBuilder, SYSTEM_PROMPT};

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::RlmConfig;
use crate::error::{FaultClass, RlmError};
use crate::events::{EventSink, SessionEvent};
use crate::provider::{complete_with_retry, ReasoningAgent};
use crate::runlog::{LogEntry, LogLevel, RunLogger};
use crate::sandbox::{SafetyPolicy, SandboxExecutor, Scratch, Verdict};
use crate::trace::{Trace, TraceRecorder};
use crate::types::{
    AgentReply, Corpus, ExecutionOutcome, IterationRecord, RecursionBudget, SessionId,
    SessionStatus,
};

/// Result text of a session that ran out of iterations.
pub const EXHAUSTED_SENTINEL: &str = "budget exhausted without a final answer";

/// Everything a session tree shares: the agent, configuration, logging and
/// the event channel. Cloning is cheap.
#[derive(Clone)]
pub struct SessionRuntime {
    pub agent: Arc<dyn ReasoningAgent>,
    pub config: Arc<RlmConfig>,
    pub logger: Arc<RunLogger>,
    pub events: EventSink,
    policy: SafetyPolicy,
    executor: SandboxExecutor,
}

impl SessionRuntime {
    pub fn new(
        agent: Arc<dyn ReasoningAgent>,
        config: Arc<RlmConfig>,
        logger: Arc<RunLogger>,
        events: EventSink,
    ) -> Self {
        let executor = SandboxExecutor::new(config.execution_timeout, config.max_output_chars);
        Self {
            agent,
            config,
            logger,
            events,
            policy: SafetyPolicy::new(),
            executor,
        }
    }
}

/// Why a session ended in `Failed`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Failure {
    pub class: FaultClass,
    pub message: String,
}

impl Failure {
    pub fn cancelled() -> Self {
        Self {
            class: FaultClass::Cancelled,
            message: RlmError::Cancelled.to_string(),
        }
    }

    pub fn from_error(err: &RlmError) -> Self {
        Self {
            class: err.class(),
            message: err.to_string(),
        }
    }

    /// Convert back into the error surfaced to callers, keeping the class.
    pub fn into_error(self) -> RlmError {
        match self.class {
            FaultClass::Cancelled => RlmError::Cancelled,
            class => RlmError::Failed {
                class,
                message: self.message,
            },
        }
    }
}

/// Final result of a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionReport {
    pub session_id: SessionId,
    pub depth: usize,
    pub status: SessionStatus,
    /// The detected answer, or [`EXHAUSTED_SENTINEL`] for exhausted sessions.
    pub answer: Option<String>,
    pub iteration_count: usize,
    pub trace: Trace,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<Failure>,
}

impl SessionReport {
    pub fn is_answered(&self) -> bool {
        self.status == SessionStatus::Answered
    }

    /// Answer for `Answered`/`Exhausted`, the failure as an error otherwise.
    pub fn into_answer(self) -> Result<String, RlmError> {
        match (self.status, self.answer, self.failure) {
            (SessionStatus::Answered | SessionStatus::Exhausted, Some(answer), _) => Ok(answer),
            (_, _, Some(failure)) => Err(failure.into_error()),
            (status, _, None) => Err(RlmError::Session(format!(
                "session ended {status} without a result"
            ))),
        }
    }

    /// Report for a request cancelled before its session ever ran.
    pub(crate) fn cancelled_before_start(
        session_id: SessionId,
        question: &str,
        corpus: &Corpus,
    ) -> Self {
        let trace = TraceRecorder::new(session_id.clone(), None, 0, question, corpus.char_len())
            .finish(SessionStatus::Failed, None);
        Self {
            session_id,
            depth: 0,
            status: SessionStatus::Failed,
            answer: None,
            iteration_count: 0,
            trace,
            failure: Some(Failure::cancelled()),
        }
    }
}

enum Ending {
    Answered(String),
    Exhausted,
    Failed(Failure),
}

pub struct Session {
    id: SessionId,
    parent_id: Option<SessionId>,
    depth: usize,
    question: String,
    corpus: Corpus,
    budget: RecursionBudget,
    iteration_count: usize,
    history: Vec<IterationRecord>,
    status: SessionStatus,
    scratch: Scratch,
    recorder: TraceRecorder,
    prompts: PromptBuilder,
    detector: CompletionDetector,
    runtime: SessionRuntime,
    cancel: CancellationToken,
    deadline: Option<Instant>,
}

impl Session {
    /// A top-level session at depth 0 under the runtime's configured budget.
    pub fn root(
        runtime: SessionRuntime,
        id: SessionId,
        question: impl Into<String>,
        corpus: Corpus,
        cancel: CancellationToken,
    ) -> Self {
        let budget = runtime.config.budget();
        Self::build(runtime, id, None, 0, question.into(), corpus, budget, cancel, None)
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn child(
        runtime: SessionRuntime,
        parent_id: SessionId,
        depth: usize,
        question: String,
        corpus: Corpus,
        budget: RecursionBudget,
        cancel: CancellationToken,
        deadline: Option<Instant>,
    ) -> Self {
        Self::build(
            runtime,
            SessionId::new(),
            Some(parent_id),
            depth,
            question,
            corpus,
            budget,
            cancel,
            deadline,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn build(
        runtime: SessionRuntime,
        id: SessionId,
        parent_id: Option<SessionId>,
        depth: usize,
        question: String,
        corpus: Corpus,
        budget: RecursionBudget,
        cancel: CancellationToken,
        deadline: Option<Instant>,
    ) -> Self {
        let recorder = TraceRecorder::new(
            id.clone(),
            parent_id.clone(),
            depth,
            question.clone(),
            corpus.char_len(),
        );
        let prompts = PromptBuilder::new(
            runtime.config.system_prompt_override.as_deref(),
            budget.max_context_chars,
        );
        Self {
            id,
            parent_id,
            depth,
            question,
            corpus,
            budget,
            iteration_count: 0,
            history: Vec::new(),
            status: SessionStatus::Running,
            scratch: Scratch::default(),
            recorder,
            prompts,
            detector: CompletionDetector::new(),
            runtime,
            cancel,
            deadline,
        }
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    pub fn iteration_count(&self) -> usize {
        self.iteration_count
    }

    /// Drive the loop to a terminal status.
    pub async fn run(mut self) -> SessionReport {
        if self.depth == 0 {
            if let Some(timeout) = self.runtime.config.session_timeout {
                self.deadline = Some(Instant::now() + timeout);
            }
        }
        self.runtime.events.publish(SessionEvent::SessionStarted {
            session_id: self.id.clone(),
            parent_id: self.parent_id.clone(),
            depth: self.depth,
            question: self.question.clone(),
        });
        self.log(
            LogLevel::Info,
            format!("session started: {}", self.question),
            json!({
                "corpus_chars": self.corpus.char_len(),
                "max_iterations": self.budget.max_iterations,
                "max_depth": self.budget.max_depth,
            }),
        );

        let ending = self.drive().await;
        self.finish(ending)
    }

    async fn drive(&mut self) -> Ending {
        loop {
            if self.iteration_count >= self.budget.max_iterations {
                return Ending::Exhausted;
            }
            if self.deadline_passed() {
                self.log(
                    LogLevel::Warn,
                    "session deadline reached".to_string(),
                    json!({ "iterations": self.iteration_count }),
                );
                return Ending::Exhausted;
            }
            if self.cancel.is_cancelled() {
                return Ending::Failed(Failure::cancelled());
            }

            let prompt = self.prompts.build(
                &self.question,
                &self.corpus,
                self.depth,
                &self.budget,
                &self.history,
            );
            let deadline = self.deadline;
            let reply = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Ending::Failed(Failure::cancelled()),
                _ = sleep_until_deadline(deadline) => {
                    self.log(
                        LogLevel::Warn,
                        "session deadline reached while waiting on the agent".to_string(),
                        json!({ "iterations": self.iteration_count }),
                    );
                    return Ending::Exhausted;
                }
                result = complete_with_retry(
                    self.runtime.agent.as_ref(),
                    &prompt,
                    &self.runtime.config.retry,
                ) => result,
            };
            let reply = match reply {
                Ok(reply) => reply,
                Err(RlmError::Cancelled) => return Ending::Failed(Failure::cancelled()),
                Err(err) => return Ending::Failed(Failure::from_error(&err)),
            };

            let (outcome, children) = self.execute(&reply).await;
            let record = IterationRecord {
                index: self.iteration_count,
                submitted_program: reply.program.clone(),
                execution_outcome: outcome,
                agent_free_text: reply.free_text.clone(),
                timestamp: Utc::now(),
            };
            self.iteration_count += 1;
            self.commit(record, children);

            let latest = &self.history[self.history.len() - 1];
            if let Detection::Answered(answer) = self
                .detector
                .detect(&latest.execution_outcome, &latest.agent_free_text)
            {
                return Ending::Answered(answer);
            }
        }
    }

    /// Classify and run one program. Returns the outcome and the traces of
    /// any sub-sessions it spawned.
    async fn execute(&mut self, reply: &AgentReply) -> (ExecutionOutcome, Vec<Trace>) {
        let program = match self.runtime.policy.check(&reply.program) {
            Verdict::Approved(program) => program,
            Verdict::Rejected(rejection) => {
                self.log(
                    LogLevel::Warn,
                    format!("program rejected: {rejection}"),
                    json!({ "category": rejection.category.to_string() }),
                );
                return (ExecutionOutcome::Rejected(rejection.to_string()), Vec::new());
            }
        };

        let mut dispatcher = SubSessionDispatcher::new(
            self.runtime.clone(),
            self.id.clone(),
            self.depth,
            self.budget,
            self.cancel.clone(),
            self.deadline,
        );
        let outcome = self
            .runtime
            .executor
            .execute(
                &program,
                &self.corpus,
                &mut self.scratch,
                &mut dispatcher,
                &self.cancel,
            )
            .await;

        if matches!(outcome, ExecutionOutcome::TimedOut) {
            self.log(
                LogLevel::Warn,
                format!(
                    "program timed out after {} ms",
                    self.runtime.executor.timeout().as_millis()
                ),
                json!({ "sub_sessions": dispatcher.spawned() }),
            );
        }
        (outcome, dispatcher.into_children())
    }

    /// Append a completed iteration to history and trace, then announce it.
    fn commit(&mut self, record: IterationRecord, children: Vec<Trace>) {
        self.log(
            LogLevel::Debug,
            format!("iteration {} completed", record.index),
            json!({
                "index": record.index,
                "outcome": record.execution_outcome.kind(),
                "sub_sessions": children.len(),
            }),
        );
        self.runtime.events.publish(SessionEvent::IterationCompleted {
            session_id: self.id.clone(),
            depth: self.depth,
            iteration_index: record.index,
            program: record.submitted_program.clone(),
            outcome: record.execution_outcome.clone(),
            free_text: record.agent_free_text.clone(),
        });
        self.recorder.record(record.clone(), children);
        self.history.push(record);
    }

    fn finish(mut self, ending: Ending) -> SessionReport {
        let (status, answer, failure) = match ending {
            Ending::Answered(answer) => (SessionStatus::Answered, Some(answer), None),
            Ending::Exhausted => (
                SessionStatus::Exhausted,
                Some(EXHAUSTED_SENTINEL.to_string()),
                None,
            ),
            Ending::Failed(failure) => (SessionStatus::Failed, None, Some(failure)),
        };
        self.status = status;

        match &failure {
            Some(failure) => self.log(
                LogLevel::Error,
                format!("session failed: {}", failure.message),
                json!({ "class": failure.class, "iterations": self.iteration_count }),
            ),
            None => self.log(
                LogLevel::Info,
                format!("session {status}"),
                json!({ "iterations": self.iteration_count }),
            ),
        }

        self.runtime.events.publish(SessionEvent::SessionFinished {
            session_id: self.id.clone(),
            depth: self.depth,
            status,
            answer: answer.clone(),
            iteration_count: self.iteration_count,
        });

        let trace = self.recorder.finish(status, answer.clone());
        SessionReport {
            session_id: self.id,
            depth: self.depth,
            status,
            answer,
            iteration_count: self.iteration_count,
            trace,
            failure,
        }
    }

    fn deadline_passed(&self) -> bool {
        self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    fn log(&self, level: LogLevel, message: String, payload: serde_json::Value) {
        self.runtime.logger.log(
            &LogEntry::new(level, "session", message)
                .with_session(&self.id, self.depth)
                .with_payload(payload),
        );
    }
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
