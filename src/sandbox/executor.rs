use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::RlmError;
use crate::types::{Corpus, ExecutionOutcome};

use super::interpreter::{Completion, Fault, FaultKind, Interpreter, RuntimeHooks, Scratch};
use super::policy::ApprovedProgram;

/// Line prefix that marks a program's final answer in its output.
pub const FINAL_ANSWER_MARKER: &str = "FINAL_ANSWER:";

/// Serves `recurse(question, text)` calls made by a running program.
#[async_trait]
pub trait RecursionHandler: Send {
    async fn recurse(&mut self, question: String, text: String) -> Result<String, RlmError>;
}

/// Handler for contexts where recursion is unavailable.
pub struct NoRecursion;

#[async_trait]
impl RecursionHandler for NoRecursion {
    async fn recurse(&mut self, _question: String, _text: String) -> Result<String, RlmError> {
        Err(RlmError::RecursionDepthExceeded {
            requested: 1,
            max_depth: 0,
        })
    }
}

struct RecurseRequest {
    question: String,
    text: String,
    reply: oneshot::Sender<Result<String, Fault>>,
}

/// Hooks handed to the interpreter thread: recursion goes out as a message,
/// and the shared flag tells the program to stop.
struct BridgeHooks {
    requests: mpsc::UnboundedSender<RecurseRequest>,
    stop: Arc<AtomicBool>,
}

impl RuntimeHooks for BridgeHooks {
    fn recurse(&self, question: &str, text: &str) -> Result<String, Fault> {
        let (reply, response) = oneshot::channel();
        self.requests
            .send(RecurseRequest {
                question: question.to_string(),
                text: text.to_string(),
                reply,
            })
            .map_err(|_| Fault::new(FaultKind::Interrupted, "execution stopped"))?;
        response
            .blocking_recv()
            .map_err(|_| Fault::new(FaultKind::Interrupted, "execution stopped"))?
    }

    fn should_stop(&self) -> bool {
        self.stop.load(Ordering::Relaxed)
    }
}

/// Sets the flag when dropped so an abandoned interpreter thread winds down.
struct StopOnDrop(Arc<AtomicBool>);

impl Drop for StopOnDrop {
    fn drop(&mut self) {
        self.0.store(true, Ordering::Relaxed);
    }
}

fn recursion_fault(err: RlmError) -> Fault {
    match err {
        RlmError::RecursionDepthExceeded {
            requested,
            max_depth,
        } => Fault::new(
            FaultKind::RecursionDepthExceeded,
            format!("requested depth {requested} exceeds max_depth {max_depth}"),
        ),
        RlmError::Cancelled => Fault::new(FaultKind::Interrupted, "session cancelled"),
        other => Fault::new(FaultKind::RecursionError, other.to_string()),
    }
}

/// Runs approved programs against a corpus under a wall-clock limit.
#[derive(Debug, Clone)]
pub struct SandboxExecutor {
    timeout: Duration,
    max_output_chars: usize,
}

impl SandboxExecutor {
    pub fn new(timeout: Duration, max_output_chars: usize) -> Self {
        Self {
            timeout,
            max_output_chars,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Execute `program` with `context` bound to the corpus.
    ///
    /// The program runs on a copy of `scratch`; the copy replaces it when the
    /// program finishes or faults, and is thrown away on timeout. Time spent
    /// inside `recursion` extends the deadline.
    pub async fn execute(
        &self,
        program: &ApprovedProgram,
        corpus: &Corpus,
        scratch: &mut Scratch,
        recursion: &mut dyn RecursionHandler,
        cancel: &CancellationToken,
    ) -> ExecutionOutcome {
        let (requests, mut incoming) = mpsc::unbounded_channel::<RecurseRequest>();
        let stop = Arc::new(AtomicBool::new(false));
        let _stop_guard = StopOnDrop(Arc::clone(&stop));

        let parsed = program.program();
        let working = scratch.clone();
        let context = corpus.shared();
        let cap = self.max_output_chars;
        let hooks = BridgeHooks {
            requests,
            stop: Arc::clone(&stop),
        };
        let mut task = tokio::task::spawn_blocking(move || {
            Interpreter::new(working, context, cap, &hooks).run(&parsed)
        });

        let mut deadline = Instant::now() + self.timeout;
        loop {
            tokio::select! {
                biased;
                joined = &mut task => {
                    let execution = match joined {
                        Ok(execution) => execution,
                        Err(err) => {
                            return ExecutionOutcome::runtime_fault(format!(
                                "RecursionError: sandbox worker failed: {err}"
                            ));
                        }
                    };
                    let rendered = execution.output.render();
                    *scratch = execution.scratch;
                    return match execution.completion {
                        Completion::Finished => ExecutionOutcome::Output(rendered),
                        Completion::Final(answer) => {
                            let mut text = rendered;
                            if !text.is_empty() && !text.ends_with('\n') {
                                text.push('\n');
                            }
                            text.push_str(FINAL_ANSWER_MARKER);
                            text.push(' ');
                            text.push_str(&answer);
                            ExecutionOutcome::Output(text)
                        }
                        Completion::Faulted(fault) => {
                            let message = if rendered.is_empty() {
                                fault.to_string()
                            } else {
                                format!("{fault}\n--- output before the fault ---\n{rendered}")
                            };
                            ExecutionOutcome::runtime_fault_of(fault.kind.class(), message)
                        }
                    };
                }
                _ = cancel.cancelled() => {
                    stop.store(true, Ordering::Relaxed);
                    return ExecutionOutcome::runtime_fault(
                        "Interrupted: session cancelled during execution",
                    );
                }
                Some(request) = incoming.recv() => {
                    let started = Instant::now();
                    let reply = recursion
                        .recurse(request.question, request.text)
                        .await
                        .map_err(recursion_fault);
                    deadline += started.elapsed();
                    let _ = request.reply.send(reply);
                }
                _ = tokio::time::sleep_until(deadline) => {
                    stop.store(true, Ordering::Relaxed);
                    return ExecutionOutcome::TimedOut;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::policy::{SafetyPolicy, Verdict};
    use crate::sandbox::interpreter::Value;

    fn approve(src: &str) -> ApprovedProgram {
        match SafetyPolicy::new().check(src) {
            Verdict::Approved(p) => p,
            Verdict::Rejected(r) => panic!("rejected: {r}"),
        }
    }

    struct Recorder {
        calls: Vec<(String, String)>,
        delay: Duration,
    }

    #[async_trait]
    impl RecursionHandler for Recorder {
        async fn recurse(&mut self, question: String, text: String) -> Result<String, RlmError> {
            tokio::time::sleep(self.delay).await;
            self.calls.push((question.clone(), text));
            Ok(format!("child says: {question}"))
        }
    }

    async fn execute(src: &str, corpus: &str, scratch: &mut Scratch) -> ExecutionOutcome {
        SandboxExecutor::new(Duration::from_secs(5), 1_000)
            .execute(
                &approve(src),
                &Corpus::from(corpus),
                scratch,
                &mut NoRecursion,
                &CancellationToken::new(),
            )
            .await
    }

    #[tokio::test]
    async fn output_and_commit() {
        let mut scratch = Scratch::new();
        let outcome = execute("let n = len(context)\nprint(n)", "hello", &mut scratch).await;
        assert_eq!(outcome, ExecutionOutcome::Output("5\n".into()));
        assert_eq!(scratch.get("n"), Some(&Value::Int(5)));
    }

    #[tokio::test]
    async fn final_appends_marker_after_output() {
        let mut scratch = Scratch::new();
        let outcome = execute("print('checking')\nfinal('42')", "", &mut scratch).await;
        assert_eq!(
            outcome,
            ExecutionOutcome::Output("checking\nFINAL_ANSWER: 42".into())
        );
    }

    #[tokio::test]
    async fn fault_is_reported_and_bindings_kept() {
        let mut scratch = Scratch::new();
        let outcome = execute("let a = 1\nprint('hi')\nundefined_thing", "", &mut scratch).await;
        match outcome {
            ExecutionOutcome::RuntimeFault { message: text, .. } => {
                assert!(text.starts_with("NameError: undefined name 'undefined_thing' (line 3)"));
                assert!(text.contains("hi"));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(scratch.get("a"), Some(&Value::Int(1)));
    }

    #[tokio::test]
    async fn output_is_truncated_before_marker() {
        let mut scratch = Scratch::new();
        let outcome = SandboxExecutor::new(Duration::from_secs(5), 10)
            .execute(
                &approve("print('abcdefghijklmnopqrstuvwxyz')\nfinal('x')"),
                &Corpus::from(""),
                &mut scratch,
                &mut NoRecursion,
                &CancellationToken::new(),
            )
            .await;
        match outcome {
            ExecutionOutcome::Output(text) => {
                assert!(text.starts_with("abcdefghij\n... (output truncated to 10/27 characters)"));
                assert!(text.ends_with("\nFINAL_ANSWER: x"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn timeout_discards_scratch() {
        let mut scratch = Scratch::new();
        scratch.set("kept", Value::Int(7));
        let outcome = SandboxExecutor::new(Duration::from_millis(100), 1_000)
            .execute(
                &approve(
                    "let kept = 0\nlet xs = range(1000000)\nfor a in xs { for b in xs { kept = kept + 1 } }",
                ),
                &Corpus::from(""),
                &mut scratch,
                &mut NoRecursion,
                &CancellationToken::new(),
            )
            .await;
        assert_eq!(outcome, ExecutionOutcome::TimedOut);
        assert_eq!(scratch.get("kept"), Some(&Value::Int(7)));
        assert!(!scratch.contains("xs"));
    }

    #[tokio::test]
    async fn recursion_time_extends_deadline() {
        let mut scratch = Scratch::new();
        let mut recorder = Recorder {
            calls: Vec::new(),
            delay: Duration::from_millis(300),
        };
        let outcome = SandboxExecutor::new(Duration::from_millis(200), 1_000)
            .execute(
                &approve("let a = recurse('first?', context[:3])\nlet b = recurse('second?', 'x')\nprint(a)\nprint(b)"),
                &Corpus::from("abcdef"),
                &mut scratch,
                &mut recorder,
                &CancellationToken::new(),
            )
            .await;
        assert_eq!(
            outcome,
            ExecutionOutcome::Output("child says: first?\nchild says: second?\n".into())
        );
        assert_eq!(recorder.calls.len(), 2);
        assert_eq!(recorder.calls[0], ("first?".to_string(), "abc".to_string()));
    }

    #[tokio::test]
    async fn recursion_refusal_becomes_fault() {
        let mut scratch = Scratch::new();
        let outcome = execute("recurse('q', context)", "abc", &mut scratch).await;
        match &outcome {
            ExecutionOutcome::RuntimeFault { message: text, .. } => {
                assert!(text.starts_with(
                    "RecursionDepthExceeded: requested depth 1 exceeds max_depth 0 (line 1)"
                ));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(
            outcome.fault_class(),
            Some(crate::error::FaultClass::RecursionDepthExceeded)
        );
    }

    #[tokio::test]
    async fn cancellation_interrupts_execution() {
        let mut scratch = Scratch::new();
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });
        let outcome = SandboxExecutor::new(Duration::from_secs(30), 1_000)
            .execute(
                &approve("let xs = range(1000000)\nfor a in xs { for b in xs { let n = 1 } }"),
                &Corpus::from(""),
                &mut scratch,
                &mut NoRecursion,
                &cancel,
            )
            .await;
        match outcome {
            ExecutionOutcome::RuntimeFault { message: text, .. } => assert!(text.contains("cancelled")),
            other => panic!("unexpected {other:?}"),
        }
    }
}
