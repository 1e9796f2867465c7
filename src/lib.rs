//! # rlm-core
//!
//! Recursive sandboxed-execution orchestrator for answering questions about
//! corpora too large for a reasoning agent's context window.
//!
//! The agent never sees the whole corpus. It writes small programs in a
//! restricted language; each program is checked by a static safety policy,
//! run in a sandbox with the corpus bound to `context`, and its output is fed
//! back. Programs can call `recurse(question, text)` to hand a slice of the
//! corpus to a fresh sub-agent and use its answer.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use rlm_core::{Corpus, Orchestrator, RlmConfig};
//! # use rlm_core::{AgentPrompt, AgentReply, ReasoningAgent, RlmResult};
//! # struct MyAgent;
//! # #[async_trait::async_trait]
//! # impl ReasoningAgent for MyAgent {
//! #     async fn complete(&self, _: &AgentPrompt) -> RlmResult<AgentReply> {
//! #         Ok(AgentReply::new("final(len(context))", ""))
//! #     }
//! # }
//!
//! # async fn demo() -> RlmResult<()> {
//! let orchestrator = Orchestrator::new(Arc::new(MyAgent), RlmConfig::default())?;
//! let corpus = Corpus::from_documents([("src/main.rs", "fn main() {}")]);
//! let answer = orchestrator.ask("What does main do?", corpus).await?;
//! println!("{answer}");
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`orchestrator`] | Facade: `ask`, streaming `start`, cancellation, per-request config |
//! | [`pool`] | Admission control: bounded workers plus a FIFO queue |
//! | [`session`] | Iteration state machine, prompting, completion detection, sub-session dispatch |
//! | [`sandbox`] | Script language, safety policy, interpreter and time-limited executor |
//! | [`provider`] | Reasoning-agent trait, program extraction, retry with backoff |
//! | [`trace`] | Append-only trace tree with JSON export and text rendering |
//! | [`events`] | Broadcast event stream for a session tree |
//! | [`runlog`] | Structured run logging with pluggable sinks |
//! | [`config`] | `RlmConfig` with defaults, JSON and environment overrides |
//! | [`types`] | Corpus, ids, statuses, outcomes, prompts and replies |
//! | [`error`] | `RlmError` and the `FaultClass` taxonomy |
//!
//! ## Session lifecycle
//!
//! A session runs at most `max_iterations` passes and ends in exactly one of
//! `Answered` (the agent signalled `FINAL_ANSWER:`), `Exhausted` (the budget
//! ran out; the result is [`EXHAUSTED_SENTINEL`]) or `Failed` (the agent was
//! unreachable after retries, or the session was cancelled). Rejected,
//! faulted and timed-out programs are fed back and cost one iteration each.

pub mod config;
pub mod error;
pub mod events;
pub mod orchestrator;
pub mod pool;
pub mod provider;
pub mod runlog;
pub mod sandbox;
pub mod session;
pub mod trace;
pub mod types;

pub use config::{ChildLimits, RetryPolicy, RlmConfig};
pub use error::{FaultClass, RlmError, RlmResult};
pub use events::{EventSink, SessionEvent};
pub use orchestrator::{CorpusProvider, Orchestrator, SessionHandle};
pub use provider::{CompletionModel, ExtractingAgent, ReasoningAgent};
pub use session::{Failure, SessionReport, EXHAUSTED_SENTINEL};
pub use trace::{Trace, TraceEntry};
pub use types::*;
