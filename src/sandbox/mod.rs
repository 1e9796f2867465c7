//! Sandbox: the restricted language agent programs are written in.
//!
//! A program passes through three stages:
//!
//! 1. [`SafetyPolicy::check`] lexes, scans and parses the text and walks the
//!    tree against a whitelist. Nothing runs. The result is either a
//!    [`Rejection`] or an [`ApprovedProgram`].
//! 2. [`SandboxExecutor::execute`] runs an `ApprovedProgram` on a blocking
//!    worker with a wall-clock deadline, against a copy of the session's
//!    [`Scratch`] variables.
//! 3. The printed output (capped) becomes an `ExecutionOutcome`.
//!
//! Programs see exactly one bound value, `context`, plus the whitelisted
//! functions in [`policy::ALLOWED_FUNCTIONS`]. `recurse(question, text)`
//! reaches back into the host through a [`RecursionHandler`].

pub mod executor;
pub mod interpreter;
pub mod lexer;
pub mod parser;
pub mod policy;

pub use executor::{NoRecursion, RecursionHandler, SandboxExecutor, FINAL_ANSWER_MARKER};
pub use interpreter::{Fault, FaultKind, Scratch, Value};
pub use policy::{ApprovedProgram, Rejection, RejectionCategory, SafetyPolicy, Verdict};
