use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::ChildLimits;
use crate::error::FaultClass;

// ─── Corpus ─────────────────────────────────────────────────────────────────

/// The immutable text a session reasons over.
///
/// Cloning is cheap: every clone shares the same allocation, so a whole
/// session tree can hold the root corpus without copying it.
#[derive(Clone, PartialEq, Eq)]
pub struct Corpus {
    text: Arc<str>,
}

impl Corpus {
    pub fn new(text: impl Into<Arc<str>>) -> Self {
        Self { text: text.into() }
    }

    /// Concatenate named documents into one corpus with `=== File: <name> ===`
    /// section markers, the layout programs are told to expect.
    pub fn from_documents<I, N, T>(documents: I) -> Self
    where
        I: IntoIterator<Item = (N, T)>,
        N: AsRef<str>,
        T: AsRef<str>,
    {
        let mut text = String::new();
        for (name, body) in documents {
            text.push_str("=== File: ");
            text.push_str(name.as_ref());
            text.push_str(" ===\n");
            text.push_str(body.as_ref());
            if !body.as_ref().ends_with('\n') {
                text.push('\n');
            }
        }
        Self::new(text)
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }

    /// Shared handle to the underlying text.
    pub fn shared(&self) -> Arc<str> {
        Arc::clone(&self.text)
    }

    /// Length in bytes.
    pub fn len(&self) -> usize {
        self.text.len()
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }

    /// Length in characters.
    pub fn char_len(&self) -> usize {
        self.text.chars().count()
    }

    pub fn line_count(&self) -> usize {
        self.text.lines().count()
    }

    /// The first `max_chars` characters.
    pub fn preview(&self, max_chars: usize) -> &str {
        match self.text.char_indices().nth(max_chars) {
            Some((byte, _)) => &self.text[..byte],
            None => &self.text,
        }
    }
}

impl std::fmt::Debug for Corpus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Corpus").field("bytes", &self.text.len()).finish()
    }
}

impl From<String> for Corpus {
    fn from(text: String) -> Self {
        Self::new(text)
    }
}

impl From<&str> for Corpus {
    fn from(text: &str) -> Self {
        Self::new(text)
    }
}

impl From<Arc<str>> for Corpus {
    fn from(text: Arc<str>) -> Self {
        Self { text }
    }
}

// ─── Session identity & status ──────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle of a session. `Running` moves to exactly one terminal state,
/// and terminal states never change afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Running,
    Answered,
    Exhausted,
    Failed,
}

impl SessionStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, SessionStatus::Running)
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionStatus::Running => write!(f, "running"),
            SessionStatus::Answered => write!(f, "answered"),
            SessionStatus::Exhausted => write!(f, "exhausted"),
            SessionStatus::Failed => write!(f, "failed"),
        }
    }
}

// ─── Iterations ─────────────────────────────────────────────────────────────

/// Result of one execution attempt. Exactly one variant per attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum ExecutionOutcome {
    /// Printed output plus the final expression value, capped.
    Output(String),
    /// The safety policy refused the program; the reason is fed back.
    Rejected(String),
    /// The program raised; the fault description is fed back verbatim.
    RuntimeFault { message: String, class: FaultClass },
    /// The program ran past its wall-clock limit and was stopped.
    TimedOut,
}

impl ExecutionOutcome {
    /// A plain runtime fault.
    pub fn runtime_fault(message: impl Into<String>) -> Self {
        Self::runtime_fault_of(FaultClass::SandboxRuntimeFault, message)
    }

    pub fn runtime_fault_of(class: FaultClass, message: impl Into<String>) -> Self {
        ExecutionOutcome::RuntimeFault {
            message: message.into(),
            class,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ExecutionOutcome::Output(_) => "output",
            ExecutionOutcome::Rejected(_) => "rejected",
            ExecutionOutcome::RuntimeFault { .. } => "runtime_fault",
            ExecutionOutcome::TimedOut => "timed_out",
        }
    }

    pub fn fault_class(&self) -> Option<FaultClass> {
        match self {
            ExecutionOutcome::Output(_) => None,
            ExecutionOutcome::Rejected(_) => Some(FaultClass::SandboxRejected),
            ExecutionOutcome::RuntimeFault { class, .. } => Some(*class),
            ExecutionOutcome::TimedOut => Some(FaultClass::SandboxTimedOut),
        }
    }

    pub fn is_output(&self) -> bool {
        matches!(self, ExecutionOutcome::Output(_))
    }
}

/// One completed iteration of a session. Never modified after it is appended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IterationRecord {
    pub index: usize,
    pub submitted_program: String,
    pub execution_outcome: ExecutionOutcome,
    pub agent_free_text: String,
    pub timestamp: DateTime<Utc>,
}

// ─── Budget ─────────────────────────────────────────────────────────────────

/// Limits a session runs under. `max_depth` is absolute across the whole
/// session tree; the other two are per session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecursionBudget {
    pub max_iterations: usize,
    pub max_depth: usize,
    pub max_context_chars: usize,
}

impl RecursionBudget {
    /// Budget for a child session. Depth stays absolute; iteration and
    /// context limits come from `limits` when set.
    pub fn for_child(&self, limits: &ChildLimits) -> Self {
        Self {
            max_iterations: limits.max_iterations.unwrap_or(self.max_iterations),
            max_depth: self.max_depth,
            max_context_chars: limits.max_context_chars.unwrap_or(self.max_context_chars),
        }
    }
}

// ─── Prompt types ───────────────────────────────────────────────────────────

/// Role in a conversation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::System => write!(f, "system"),
            Role::User => write!(f, "user"),
            Role::Assistant => write!(f, "assistant"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }
}

/// Everything sent to the reasoning agent for one iteration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentPrompt {
    pub system: String,
    pub messages: Vec<Message>,
}

impl AgentPrompt {
    /// Flatten into a single string for endpoints that take plain text.
    pub fn render(&self) -> String {
        let mut out = format!("[system]\n{}\n", self.system);
        for message in &self.messages {
            out.push_str(&format!("\n[{}]\n{}\n", message.role, message.content));
        }
        out
    }

    /// Most recent user message, if any.
    pub fn last_user_message(&self) -> Option<&str> {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.as_str())
    }
}

/// What the reasoning agent produced for one iteration: an optional program
/// and its accompanying free-text reasoning.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentReply {
    /// Program text. Empty when the reply contained no code.
    pub program: String,
    pub free_text: String,
}

impl AgentReply {
    pub fn new(program: impl Into<String>, free_text: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            free_text: free_text.into(),
        }
    }

    /// Split a raw completion into program and free text.
    ///
    /// Every fenced ```` ```rlm ```` block is part of the program (blocks are
    /// joined in order); everything outside the fences is free text. An
    /// unterminated fence runs to the end of the completion.
    pub fn from_completion(raw: &str) -> Self {
        let mut blocks: Vec<String> = Vec::new();
        let mut free_text = String::new();
        let mut current = String::new();
        let mut in_block = false;

        for line in raw.lines() {
            let trimmed = line.trim();
            if !in_block && trimmed.starts_with("```rlm") {
                in_block = true;
                current.clear();
            } else if in_block && trimmed == "```" {
                in_block = false;
                if !current.trim().is_empty() {
                    blocks.push(current.trim_end().to_string());
                }
            } else if in_block {
                current.push_str(line);
                current.push('\n');
            } else {
                free_text.push_str(line);
                free_text.push('\n');
            }
        }
        if in_block && !current.trim().is_empty() {
            blocks.push(current.trim_end().to_string());
        }

        Self {
            program: blocks.join("\n"),
            free_text: free_text.trim().to_string(),
        }
    }

    pub fn has_program(&self) -> bool {
        !self.program.trim().is_empty()
    }
}
