//! Reasoning-agent interface.
//!
//! The orchestrator never talks to a model API directly. It hands an
//! [`AgentPrompt`] to a [`ReasoningAgent`] and gets back an [`AgentReply`]:
//! a program to run plus free-text reasoning. Text-only backends implement
//! [`CompletionModel`] and are wrapped in [`ExtractingAgent`], which pulls
//! fenced `rlm` blocks out of the completion.

mod retry;

pub use retry::complete_with_retry;

use async_trait::async_trait;

use crate::error::RlmResult;
use crate::types::{AgentPrompt, AgentReply};

/// External policy that proposes the next program for a session.
///
/// Implementations report transient upstream trouble as
/// `RlmError::Provider` or `RlmError::RateLimited` so it can be retried;
/// anything else is treated as permanent.
#[async_trait]
pub trait ReasoningAgent: Send + Sync {
    async fn complete(&self, prompt: &AgentPrompt) -> RlmResult<AgentReply>;
}

/// A backend that only produces raw completion text.
#[async_trait]
pub trait CompletionModel: Send + Sync {
    async fn complete_text(&self, prompt: &AgentPrompt) -> RlmResult<String>;
}

/// Adapts a [`CompletionModel`] into a [`ReasoningAgent`].
pub struct ExtractingAgent<M> {
    model: M,
}

impl<M: CompletionModel> ExtractingAgent<M> {
    pub fn new(model: M) -> Self {
        Self { model }
    }

    pub fn model(&self) -> &M {
        &self.model
    }
}

#[async_trait]
impl<M: CompletionModel> ReasoningAgent for ExtractingAgent<M> {
    async fn complete(&self, prompt: &AgentPrompt) -> RlmResult<AgentReply> {
        let raw = self.model.complete_text(prompt).await?;
        Ok(AgentReply::from_completion(&raw))
    }
}

#[async_trait]
impl<T: ReasoningAgent + ?Sized> ReasoningAgent for std::sync::Arc<T> {
    async fn complete(&self, prompt: &AgentPrompt) -> RlmResult<AgentReply> {
        (**self).complete(prompt).await
    }
}
