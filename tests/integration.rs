use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use rlm_core::runlog::{MemorySink, RunLogger};
use rlm_core::*;

// ─── Mock Agent ─────────────────────────────────────────────────────────────

/// Canned replies keyed by the question a session was asked. Each session
/// pops its replies in order; the last one repeats.
struct ScriptedAgent {
    scripts: Mutex<HashMap<String, Vec<AgentReply>>>,
    prompts: Mutex<Vec<(String, AgentPrompt)>>,
    delay: Duration,
}

impl ScriptedAgent {
    fn new() -> Self {
        Self {
            scripts: Mutex::new(HashMap::new()),
            prompts: Mutex::new(Vec::new()),
            delay: Duration::ZERO,
        }
    }

    fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    fn script(self, question: &str, programs: &[&str]) -> Self {
        let replies = programs.iter().map(|p| AgentReply::new(*p, "")).collect();
        self.scripts.lock().unwrap().insert(question.to_string(), replies);
        self
    }

    fn script_replies(self, question: &str, replies: Vec<AgentReply>) -> Self {
        self.scripts.lock().unwrap().insert(question.to_string(), replies);
        self
    }

    fn calls(&self) -> usize {
        self.prompts.lock().unwrap().len()
    }

    fn calls_for(&self, question: &str) -> usize {
        self.prompts
            .lock()
            .unwrap()
            .iter()
            .filter(|(q, _)| q == question)
            .count()
    }

    fn prompts_for(&self, question: &str) -> Vec<AgentPrompt> {
        self.prompts
            .lock()
            .unwrap()
            .iter()
            .filter(|(q, _)| q == question)
            .map(|(_, p)| p.clone())
            .collect()
    }
}

fn question_of(prompt: &AgentPrompt) -> String {
    let opening = prompt
        .messages
        .first()
        .map(|m| m.content.as_str())
        .unwrap_or_default();
    opening
        .strip_prefix("Question: ")
        .and_then(|rest| rest.split("\n\n").next())
        .unwrap_or_default()
        .to_string()
}

#[async_trait]
impl ReasoningAgent for ScriptedAgent {
    async fn complete(&self, prompt: &AgentPrompt) -> RlmResult<AgentReply> {
        let question = question_of(prompt);
        self.prompts
            .lock()
            .unwrap()
            .push((question.clone(), prompt.clone()));
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let mut scripts = self.scripts.lock().unwrap();
        let replies = scripts
            .get_mut(&question)
            .ok_or_else(|| RlmError::InvalidResponse(format!("no script for {question:?}")))?;
        if replies.len() > 1 {
            Ok(replies.remove(0))
        } else {
            replies
                .first()
                .cloned()
                .ok_or_else(|| RlmError::InvalidResponse("empty script".into()))
        }
    }
}

/// Always fails with a transient error.
struct DownAgent {
    calls: Mutex<usize>,
}

#[async_trait]
impl ReasoningAgent for DownAgent {
    async fn complete(&self, _prompt: &AgentPrompt) -> RlmResult<AgentReply> {
        *self.calls.lock().unwrap() += 1;
        Err(RlmError::Provider("503 service unavailable".into()))
    }
}

fn config() -> RlmConfig {
    RlmConfig::default()
        .with_max_iterations(5)
        .with_execution_timeout(Duration::from_secs(5))
        .with_retry(RetryPolicy::none())
}

fn orchestrator(agent: Arc<ScriptedAgent>, config: RlmConfig) -> Orchestrator {
    Orchestrator::new(agent, config)
        .unwrap()
        .with_logger(RunLogger::new())
}

const CORPUS: &str = "=== File: src/main.rs ===\nfn main() {\n    tokio::spawn(work());\n}\n";

// ─── Scenarios ──────────────────────────────────────────────────────────────

#[tokio::test]
async fn scenario_a_filesystem_read_is_rejected_and_costs_one_iteration() {
    let agent = Arc::new(
        ScriptedAgent::new().script("Q", &["let data = open('/etc/passwd')", "final('gave up on files')"]),
    );
    let report = orchestrator(agent.clone(), config())
        .run("Q", CORPUS)
        .await
        .unwrap();

    assert_eq!(report.status, SessionStatus::Answered);
    assert_eq!(report.iteration_count, 2);
    match &report.trace.entries[0].record.execution_outcome {
        ExecutionOutcome::Rejected(reason) => assert!(reason.contains("filesystem"), "{reason}"),
        other => panic!("expected rejection, got {other:?}"),
    }
    assert_eq!(
        report.trace.entries[0].record.execution_outcome.fault_class(),
        Some(FaultClass::SandboxRejected)
    );

    let second = &agent.prompts_for("Q")[1];
    assert!(second.last_user_message().unwrap().contains("rejected"));
}

#[tokio::test]
async fn scenario_b_undefined_name_fault_is_fed_back_verbatim() {
    let agent = Arc::new(ScriptedAgent::new().script("Q", &["print(undefined_thing)", "final('ok')"]));
    let report = orchestrator(agent.clone(), config())
        .run("Q", CORPUS)
        .await
        .unwrap();

    assert_eq!(report.status, SessionStatus::Answered);
    let fault = match &report.trace.entries[0].record.execution_outcome {
        ExecutionOutcome::RuntimeFault { message, .. } => message.clone(),
        other => panic!("expected fault, got {other:?}"),
    };
    assert!(fault.starts_with("NameError"), "{fault}");
    assert!(fault.contains("undefined_thing"));

    let second = &agent.prompts_for("Q")[1];
    assert!(second.last_user_message().unwrap().contains(&fault));
}

#[tokio::test]
async fn scenario_c_no_marker_exhausts_at_exactly_max_iterations() {
    let agent = Arc::new(ScriptedAgent::new().script("Q", &["print(len(context))"]));
    let orchestrator = orchestrator(agent.clone(), config());

    let report = orchestrator.run("Q", CORPUS).await.unwrap();
    assert_eq!(report.status, SessionStatus::Exhausted);
    assert_eq!(report.iteration_count, 5);
    assert_eq!(report.trace.iteration_count(), 5);
    assert_eq!(report.answer.as_deref(), Some(EXHAUSTED_SENTINEL));
    assert_eq!(agent.calls(), 5);

    let answer = orchestrator.ask("Q", CORPUS).await.unwrap();
    assert_eq!(answer, "budget exhausted without a final answer");
}

#[tokio::test]
async fn scenario_d_recursion_at_max_depth_faults_without_a_child() {
    let agent = Arc::new(
        ScriptedAgent::new()
            .script("Q", &["let r = recurse('deeper', context)\nprint(r)", "final('fine')"])
            .script("deeper", &["final('should never run')"]),
    );
    let report = orchestrator(agent.clone(), config().with_max_depth(0))
        .run("Q", CORPUS)
        .await
        .unwrap();

    assert_eq!(report.status, SessionStatus::Answered);
    assert_eq!(report.iteration_count, 2);
    let first = &report.trace.entries[0];
    match &first.record.execution_outcome {
        ExecutionOutcome::RuntimeFault { message, .. } => {
            assert!(message.starts_with("RecursionDepthExceeded"), "{message}")
        }
        other => panic!("expected fault, got {other:?}"),
    }
    assert_eq!(
        first.record.execution_outcome.fault_class(),
        Some(FaultClass::RecursionDepthExceeded)
    );
    assert!(first.children.is_empty());
    assert_eq!(report.trace.session_count(), 1);
    assert_eq!(agent.calls_for("deeper"), 0);
}

#[tokio::test]
async fn scenario_d_depth_limit_applies_inside_a_child() {
    let agent = Arc::new(
        ScriptedAgent::new()
            .script("Q", &["final(recurse('child', context))"])
            .script("child", &["recurse('grandchild', context)", "final('child answer')"])
            .script("grandchild", &["final('unreachable')"]),
    );
    let report = orchestrator(agent.clone(), config().with_max_depth(1))
        .run("Q", CORPUS)
        .await
        .unwrap();

    assert_eq!(report.answer.as_deref(), Some("child answer"));
    assert_eq!(report.iteration_count, 1);
    let child = &report.trace.entries[0].children[0];
    assert_eq!(child.depth, 1);
    assert_eq!(child.iteration_count(), 2);
    assert!(child.entries[0].children.is_empty());
    assert_eq!(agent.calls_for("grandchild"), 0);
    assert!(report.trace.max_depth() <= 1);
}

#[tokio::test]
async fn scenario_e_answer_propagates_through_three_levels() {
    let agent = Arc::new(
        ScriptedAgent::new()
            .script("Q", &["final(recurse('level 1', context))"])
            .script("level 1", &["final(recurse('level 2', context))"])
            .script("level 2", &["final(recurse('level 3', context))"])
            .script("level 3", &["final('innermost')"]),
    );
    let report = orchestrator(agent, config().with_max_depth(3))
        .run("Q", CORPUS)
        .await
        .unwrap();

    assert_eq!(report.status, SessionStatus::Answered);
    assert_eq!(report.answer.as_deref(), Some("innermost"));
    assert_eq!(report.iteration_count, 1);

    let mut trace = &report.trace;
    for depth in 0..=3 {
        assert_eq!(trace.depth, depth);
        assert_eq!(trace.iteration_count(), 1);
        assert_eq!(trace.status, SessionStatus::Answered);
        assert_eq!(trace.answer.as_deref(), Some("innermost"));
        if depth < 3 {
            trace = &trace.entries[0].children[0];
        }
    }
    assert_eq!(report.trace.max_depth(), 3);
    assert_eq!(report.trace.session_count(), 4);
    assert_eq!(report.trace.total_iterations(), 4);
}

#[tokio::test]
async fn child_iterations_do_not_count_against_the_parent() {
    let agent = Arc::new(
        ScriptedAgent::new()
            .script("Q", &["let a = recurse('slow child', context)\nprint(a)", "final('parent done')"])
            .script(
                "slow child",
                &["print(1)", "print(2)", "print(3)", "final('child done')"],
            ),
    );
    let report = orchestrator(agent, config().with_max_iterations(2))
        .run("Q", CORPUS)
        .await
        .unwrap();

    // The child has its own budget; max_iterations applies to it too.
    let child = &report.trace.entries[0].children[0];
    assert_eq!(child.status, SessionStatus::Exhausted);
    assert_eq!(child.iteration_count(), 2);
    assert_eq!(report.iteration_count, 2);
    assert_eq!(report.answer.as_deref(), Some("parent done"));
    match &report.trace.entries[0].record.execution_outcome {
        ExecutionOutcome::Output(text) => assert!(text.contains(EXHAUSTED_SENTINEL)),
        other => panic!("unexpected {other:?}"),
    }
}

#[tokio::test]
async fn child_limits_override_iteration_budget() {
    let agent = Arc::new(
        ScriptedAgent::new()
            .script("Q", &["final(recurse('child', context))"])
            .script("child", &["print('still looking')"]),
    );
    let config = config().with_child_limits(ChildLimits {
        max_iterations: Some(1),
        max_context_chars: None,
    });
    let report = orchestrator(agent.clone(), config).run("Q", CORPUS).await.unwrap();
    assert_eq!(report.answer.as_deref(), Some(EXHAUSTED_SENTINEL));
    assert_eq!(agent.calls_for("child"), 1);
}

// ─── Sandbox limits ─────────────────────────────────────────────────────────

#[tokio::test]
async fn runaway_program_times_out_and_session_continues() {
    let agent = Arc::new(ScriptedAgent::new().script(
        "Q",
        &[
            "let xs = range(1000000)\nfor a in xs { for b in xs { print(a) } }",
            "final('recovered')",
        ],
    ));
    let config = config()
        .with_execution_timeout(Duration::from_millis(200))
        .with_max_output_chars(100);
    let report = orchestrator(agent.clone(), config).run("Q", CORPUS).await.unwrap();

    assert_eq!(report.answer.as_deref(), Some("recovered"));
    assert_eq!(
        report.trace.entries[0].record.execution_outcome,
        ExecutionOutcome::TimedOut
    );
    let second = &agent.prompts_for("Q")[1];
    assert!(second.last_user_message().unwrap().contains("timed out"));
}

#[tokio::test]
async fn self_nesting_list_faults_without_taking_down_the_host() {
    let agent = Arc::new(ScriptedAgent::new().script(
        "Q",
        &[
            "let xs = []\nfor i in range(1000000) { xs = [xs] }\nprint(len(xs))",
            "final('survived')",
        ],
    ));
    let report = orchestrator(agent.clone(), config()).run("Q", CORPUS).await.unwrap();

    assert_eq!(report.answer.as_deref(), Some("survived"));
    match &report.trace.entries[0].record.execution_outcome {
        ExecutionOutcome::RuntimeFault { message, .. } => {
            assert!(message.starts_with("LimitError: "), "{message}");
        }
        other => panic!("unexpected {other:?}"),
    }
    let second = &agent.prompts_for("Q")[1];
    assert!(second.last_user_message().unwrap().contains("LimitError"));
}

#[tokio::test]
async fn output_is_truncated_to_the_cap() {
    let agent = Arc::new(ScriptedAgent::new().script("Q", &["print(context * 50)"]));
    let config = config().with_max_iterations(1).with_max_output_chars(64);
    let report = orchestrator(agent, config).run("Q", CORPUS).await.unwrap();
    match &report.trace.entries[0].record.execution_outcome {
        ExecutionOutcome::Output(text) => {
            assert!(text.contains("output truncated to 64/"), "{text}");
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[tokio::test]
async fn free_text_marker_ends_the_session() {
    let agent = Arc::new(ScriptedAgent::new().script_replies(
        "Q",
        vec![
            AgentReply::new("print(len(lines(context)))", "Counting lines first."),
            AgentReply::new("", "The corpus has one file.\nFINAL_ANSWER: one file, spawning one task"),
        ],
    ));
    let answer = orchestrator(agent, config()).ask("Q", CORPUS).await.unwrap();
    assert_eq!(answer, "one file, spawning one task");
}

// ─── Failures ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn upstream_outage_fails_the_session() {
    let agent = Arc::new(DownAgent {
        calls: Mutex::new(0),
    });
    let config = config().with_retry(RetryPolicy {
        max_retries: 2,
        base_delay_ms: 1,
        max_delay_ms: 2,
    });
    let orchestrator = Orchestrator::new(agent.clone(), config)
        .unwrap()
        .with_logger(RunLogger::new());

    let report = orchestrator.run("Q", CORPUS).await.unwrap();
    assert_eq!(report.status, SessionStatus::Failed);
    assert_eq!(report.iteration_count, 0);
    let failure = report.failure.clone().unwrap();
    assert_eq!(failure.class, FaultClass::UpstreamUnavailable);
    assert!(failure.message.contains("3 attempt"), "{}", failure.message);
    assert_eq!(*agent.calls.lock().unwrap(), 3);

    let err = orchestrator.ask("Q", CORPUS).await.unwrap_err();
    assert_eq!(err.class(), FaultClass::UpstreamUnavailable);
    assert!(matches!(
        err,
        RlmError::Failed {
            class: FaultClass::UpstreamUnavailable,
            ..
        }
    ));
}

#[tokio::test]
async fn invalid_config_is_refused() {
    let agent = Arc::new(ScriptedAgent::new());
    assert!(matches!(
        Orchestrator::new(agent.clone(), RlmConfig::default().with_max_iterations(0)),
        Err(RlmError::Config(_))
    ));

    let orchestrator = orchestrator(agent, config());
    let err = orchestrator
        .ask_with("Q", CORPUS, config().with_workers(0, 0))
        .await
        .unwrap_err();
    assert!(matches!(err, RlmError::Config(_)));
}

// ─── Concurrency ────────────────────────────────────────────────────────────

#[tokio::test]
async fn cancel_stops_a_running_session() {
    let agent = Arc::new(
        ScriptedAgent::new()
            .script("Q", &["print(1)"])
            .with_delay(Duration::from_secs(30)),
    );
    let orchestrator = orchestrator(agent, config());
    let handle = orchestrator.start("Q", CORPUS).unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    handle.cancel();

    let report = tokio::time::timeout(Duration::from_secs(5), handle.wait())
        .await
        .expect("cancelled session should finish promptly")
        .unwrap();
    assert_eq!(report.status, SessionStatus::Failed);
    assert_eq!(report.failure.unwrap().class, FaultClass::Cancelled);
    assert_eq!(report.iteration_count, 0);
}

#[tokio::test]
async fn cancel_propagates_into_sub_sessions() {
    let agent = Arc::new(
        ScriptedAgent::new()
            .script("Q", &["final(recurse('slow', context))"])
            .script("slow", &["print(1)"])
            .with_delay(Duration::from_millis(200)),
    );
    let orchestrator = orchestrator(agent.clone(), config());
    let handle = orchestrator.start("Q", CORPUS).unwrap();
    // Root's agent call takes 200ms; the child's first call is then in flight.
    tokio::time::sleep(Duration::from_millis(300)).await;
    handle.cancel();

    let report = tokio::time::timeout(Duration::from_secs(5), handle.wait())
        .await
        .expect("cancelled tree should finish promptly")
        .unwrap();
    assert_eq!(report.status, SessionStatus::Failed);
    assert_eq!(report.failure.unwrap().class, FaultClass::Cancelled);

    let child = &report.trace.entries[0].children[0];
    assert_eq!(child.status, SessionStatus::Failed);
    assert_eq!(child.iteration_count(), 0);
    assert_eq!(agent.calls_for("slow"), 1);
}

#[tokio::test]
async fn dropping_an_ask_future_cancels_its_session() {
    let agent = Arc::new(
        ScriptedAgent::new()
            .script("Q", &["print(1)"])
            .with_delay(Duration::from_millis(50)),
    );
    let orchestrator = orchestrator(agent.clone(), config().with_max_iterations(100));

    let abandoned =
        tokio::time::timeout(Duration::from_millis(60), orchestrator.ask("Q", CORPUS)).await;
    assert!(abandoned.is_err());

    tokio::time::sleep(Duration::from_millis(100)).await;
    let calls_after_drop = agent.calls();
    assert!(calls_after_drop <= 3, "{calls_after_drop}");
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(agent.calls(), calls_after_drop);
    assert_eq!(orchestrator.admission().in_flight(), 0);
}

#[tokio::test]
async fn dropping_a_handle_cancels_but_detach_does_not() {
    let agent = Arc::new(
        ScriptedAgent::new()
            .script("Q", &["print(1)", "final('done')"])
            .with_delay(Duration::from_millis(20)),
    );
    let orchestrator = orchestrator(agent.clone(), config());

    let handle = orchestrator.start("Q", CORPUS).unwrap();
    let token = handle.cancellation_token();
    drop(handle);
    assert!(token.is_cancelled());

    let report = orchestrator
        .start("Q", CORPUS)
        .unwrap()
        .detach()
        .await
        .unwrap();
    assert!(report.is_answered());
    assert_eq!(report.answer.as_deref(), Some("done"));
}

#[tokio::test]
async fn admission_refuses_when_pool_and_queue_are_full() {
    let agent = Arc::new(
        ScriptedAgent::new()
            .script("Q", &["print(1)"])
            .with_delay(Duration::from_secs(30)),
    );
    let orchestrator = orchestrator(agent, config().with_workers(1, 1));

    let running = orchestrator.start("Q", CORPUS).unwrap();
    let queued = orchestrator.start("Q", CORPUS).unwrap();
    match orchestrator.start("Q", CORPUS) {
        Err(RlmError::CapacityExceeded {
            in_flight,
            capacity,
        }) => {
            assert_eq!(in_flight, 2);
            assert_eq!(capacity, 2);
        }
        Err(other) => panic!("unexpected error {other}"),
        Ok(_) => panic!("third request should be refused"),
    }
    assert_eq!(orchestrator.admission().in_flight(), 2);

    running.cancel();
    queued.cancel();
    running.wait().await.unwrap();
    queued.wait().await.unwrap();
    assert_eq!(orchestrator.admission().in_flight(), 0);
    assert!(orchestrator.start("Q", CORPUS).map(|h| h.cancel()).is_ok());
}

#[tokio::test]
async fn cancelling_a_queued_request_never_runs_it() {
    let agent = Arc::new(
        ScriptedAgent::new()
            .script("Q", &["print(1)"])
            .with_delay(Duration::from_secs(30)),
    );
    let orchestrator = orchestrator(agent.clone(), config().with_workers(1, 4));

    let running = orchestrator.start("Q", CORPUS).unwrap();
    let mut queued = orchestrator.start("Q", CORPUS).unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(orchestrator.admission().queued(), 1);

    queued.cancel();
    let mut saw_finish = false;
    while let Some(event) = queued.next_event().await {
        if event.is_root_finish() {
            saw_finish = true;
        }
    }
    assert!(saw_finish);
    let report = queued.wait().await.unwrap();
    assert_eq!(report.status, SessionStatus::Failed);
    assert_eq!(report.failure.unwrap().class, FaultClass::Cancelled);
    assert_eq!(report.iteration_count, 0);
    assert_eq!(agent.calls(), 1);

    running.cancel();
    running.wait().await.unwrap();
}

#[tokio::test]
async fn independent_sessions_run_concurrently() {
    let agent = Arc::new(
        ScriptedAgent::new()
            .script("A", &["final(len(context))"])
            .script("B", &["final(upper(context))"])
            .with_delay(Duration::from_millis(100)),
    );
    let orchestrator = orchestrator(agent, config().with_workers(2, 0));

    let started = std::time::Instant::now();
    let (a, b) = tokio::join!(orchestrator.ask("A", "abcd"), orchestrator.ask("B", "xy"));
    assert_eq!(a.unwrap(), "4");
    assert_eq!(b.unwrap(), "XY");
    assert!(started.elapsed() < Duration::from_millis(190));
}

#[tokio::test]
async fn session_timeout_exhausts_the_session() {
    let agent = Arc::new(
        ScriptedAgent::new()
            .script("Q", &["print(1)"])
            .with_delay(Duration::from_millis(40)),
    );
    let config = config()
        .with_max_iterations(1_000)
        .with_session_timeout(Duration::from_millis(150));
    let report = orchestrator(agent, config).run("Q", CORPUS).await.unwrap();
    assert_eq!(report.status, SessionStatus::Exhausted);
    assert!(report.iteration_count < 10, "{}", report.iteration_count);
}

// ─── Streaming & trace export ───────────────────────────────────────────────

#[tokio::test]
async fn event_stream_covers_the_whole_tree() {
    let agent = Arc::new(
        ScriptedAgent::new()
            .script("Q", &["let s = recurse('sub', context)\nprint(s)", "final('done')"])
            .script("sub", &["final('sub answer')"]),
    );
    let orchestrator = orchestrator(agent, config());
    let mut handle = orchestrator.start("Q", CORPUS).unwrap();
    let root_id = handle.id().clone();

    let mut events = Vec::new();
    while let Some(event) = handle.next_event().await {
        events.push(event);
    }
    let report = handle.wait().await.unwrap();

    assert!(matches!(
        events.first(),
        Some(SessionEvent::SessionStarted { depth: 0, .. })
    ));
    assert!(events.last().unwrap().is_root_finish());

    let root_iterations: Vec<usize> = events
        .iter()
        .filter_map(|e| match e {
            SessionEvent::IterationCompleted {
                session_id,
                iteration_index,
                ..
            } if *session_id == root_id => Some(*iteration_index),
            _ => None,
        })
        .collect();
    assert_eq!(root_iterations, vec![0, 1]);

    let child_started = events.iter().position(|e| {
        matches!(e, SessionEvent::SessionStarted { depth: 1, parent_id: Some(p), .. } if *p == root_id)
    });
    let child_finished = events
        .iter()
        .position(|e| matches!(e, SessionEvent::SessionFinished { depth: 1, .. }));
    let root_first_iteration = events.iter().position(|e| {
        matches!(e, SessionEvent::IterationCompleted { depth: 0, iteration_index: 0, .. })
    });
    assert!(child_started < child_finished);
    assert!(child_finished < root_first_iteration);

    let iteration_events = events
        .iter()
        .filter(|e| matches!(e, SessionEvent::IterationCompleted { .. }))
        .count();
    assert_eq!(iteration_events, report.trace.total_iterations());

    match events.last() {
        Some(SessionEvent::SessionFinished { status, answer, .. }) => {
            assert_eq!(*status, SessionStatus::Answered);
            assert_eq!(answer.as_deref(), Some("done"));
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[tokio::test]
async fn extra_subscribers_see_live_events() {
    let agent = Arc::new(
        ScriptedAgent::new()
            .script("Q", &["print(1)", "final(2)"])
            .with_delay(Duration::from_millis(30)),
    );
    let orchestrator = orchestrator(agent, config());
    let handle = orchestrator.start("Q", CORPUS).unwrap();
    let mut observer = handle.subscribe();

    let mut finished = false;
    while let Ok(event) = observer.recv().await {
        if event.is_root_finish() {
            finished = true;
        }
    }
    assert!(finished);
    assert!(handle.wait().await.unwrap().is_answered());
}

#[tokio::test]
async fn trace_exports_as_json_and_text() {
    let agent = Arc::new(
        ScriptedAgent::new()
            .script("Q", &["let s = recurse('sub', context[:20])\nprint(s)", "final('done')"])
            .script("sub", &["open('x')", "final('sub answer')"]),
    );
    let report = orchestrator(agent, config()).run("Q", CORPUS).await.unwrap();

    let json = report.trace.to_json().unwrap();
    let back = Trace::from_json(&json).unwrap();
    assert_eq!(back, report.trace);
    assert_eq!(back.total_iterations(), report.trace.total_iterations());

    let text = report.trace.render();
    assert!(text.contains("(depth 0) [answered]"));
    assert!(text.contains("  == session "));
    assert!(text.contains("(depth 1) [answered]"));
    assert!(text.contains("rejected:"));
    assert!(text.contains("  | sub answer"));
    assert!(text.ends_with("result: done\n"));
}

// ─── Facade variants ────────────────────────────────────────────────────────

struct FencedModel;

#[async_trait]
impl CompletionModel for FencedModel {
    async fn complete_text(&self, _prompt: &AgentPrompt) -> RlmResult<String> {
        Ok("Let me count the files.\n```rlm\nlet files = grep(context, '^=== File:')\nfinal(len(files))\n```".into())
    }
}

#[tokio::test]
async fn extracting_agent_drives_a_session() {
    let orchestrator = Orchestrator::new(Arc::new(ExtractingAgent::new(FencedModel)), config())
        .unwrap()
        .with_logger(RunLogger::new());
    let corpus = Corpus::from_documents([("a.rs", "fn a() {}"), ("b.rs", "fn b() {}")]);
    let answer = orchestrator.ask("How many files?", corpus).await.unwrap();
    assert_eq!(answer, "2");
}

#[tokio::test]
async fn per_request_config_and_corpus_provider() {
    let agent = Arc::new(ScriptedAgent::new().script("Q", &["print('nothing yet')"]));
    let orchestrator = orchestrator(agent.clone(), config());

    let answer = orchestrator
        .ask_with("Q", CORPUS, config().with_max_iterations(2))
        .await
        .unwrap();
    assert_eq!(answer, EXHAUSTED_SENTINEL);
    assert_eq!(agent.calls(), 2);

    let provided = Corpus::new(CORPUS);
    let answer = orchestrator.ask_from("Q", &provided).await.unwrap();
    assert_eq!(answer, EXHAUSTED_SENTINEL);
    assert_eq!(agent.calls(), 7);
}

#[tokio::test]
async fn run_log_records_the_tree() {
    let sink = Arc::new(MemorySink::new());
    let agent = Arc::new(
        ScriptedAgent::new()
            .script("Q", &["final(recurse('sub', context))"])
            .script("sub", &["final('x')"]),
    );
    let orchestrator = Orchestrator::new(agent, config().with_max_depth(1))
        .unwrap()
        .with_logger(RunLogger::new().with_sink(sink.clone()));
    orchestrator.ask("Q", CORPUS).await.unwrap();

    assert_eq!(sink.matching("session started").len(), 2);
    assert_eq!(sink.matching("spawning sub-session").len(), 1);
    let depths: Vec<Option<usize>> = sink
        .matching("session answered")
        .iter()
        .map(|e| e.depth)
        .collect();
    assert_eq!(depths, vec![Some(1), Some(0)]);
}
