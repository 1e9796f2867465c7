//! Trace tree: the durable record of a session and every session it spawned.
//!
//! A [`TraceRecorder`] owns one session's [`Trace`] while it runs. It appends
//! exactly one [`TraceEntry`] per completed iteration and hangs the traces of
//! child sessions spawned during that iteration under the entry. Nothing is
//! edited once appended; the recorder only grows the tree and stamps the
//! terminal status.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::RlmResult;
use crate::types::{ExecutionOutcome, IterationRecord, SessionId, SessionStatus};

/// One iteration plus the traces of any child sessions it spawned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceEntry {
    #[serde(flatten)]
    pub record: IterationRecord,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<Trace>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trace {
    pub session_id: SessionId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<SessionId>,
    pub depth: usize,
    pub question: String,
    pub corpus_chars: usize,
    pub entries: Vec<TraceEntry>,
    pub status: SessionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub answer: Option<String>,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl Trace {
    pub fn iteration_count(&self) -> usize {
        self.entries.len()
    }

    /// Iterations across this session and all descendants.
    pub fn total_iterations(&self) -> usize {
        self.entries
            .iter()
            .map(|e| 1 + e.children.iter().map(Trace::total_iterations).sum::<usize>())
            .sum()
    }

    /// Deepest session depth in the tree.
    pub fn max_depth(&self) -> usize {
        self.entries
            .iter()
            .flat_map(|e| e.children.iter())
            .map(Trace::max_depth)
            .max()
            .unwrap_or(self.depth)
            .max(self.depth)
    }

    /// Number of sessions in the tree, this one included.
    pub fn session_count(&self) -> usize {
        1 + self
            .entries
            .iter()
            .flat_map(|e| e.children.iter())
            .map(Trace::session_count)
            .sum::<usize>()
    }

    pub fn to_json(&self) -> RlmResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(json: &str) -> RlmResult<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Indented text rendering: one block per iteration, children nested.
    pub fn render(&self) -> String {
        let mut out = String::new();
        self.render_into(&mut out, 0);
        out
    }

    fn render_into(&self, out: &mut String, indent: usize) {
        let pad = "  ".repeat(indent);
        out.push_str(&format!(
            "{pad}== session {} (depth {}) [{}] ==\n",
            self.session_id, self.depth, self.status
        ));
        out.push_str(&format!("{pad}question: {}\n", self.question));
        out.push_str(&format!("{pad}corpus: {} chars\n", self.corpus_chars));

        for entry in &self.entries {
            let record = &entry.record;
            out.push_str(&format!(
                "{pad}-- iteration {} @ {} --\n",
                record.index,
                record.timestamp.format("%H:%M:%S%.3f")
            ));
            if !record.agent_free_text.is_empty() {
                push_block(out, &pad, "reasoning", &record.agent_free_text);
            }
            push_block(out, &pad, "program", &record.submitted_program);
            let (label, body) = match &record.execution_outcome {
                ExecutionOutcome::Output(text) => ("output", text.as_str()),
                ExecutionOutcome::Rejected(reason) => ("rejected", reason.as_str()),
                ExecutionOutcome::RuntimeFault { message, .. } => ("fault", message.as_str()),
                ExecutionOutcome::TimedOut => ("timed out", ""),
            };
            push_block(out, &pad, label, body);
            for child in &entry.children {
                child.render_into(out, indent + 1);
            }
        }

        match &self.answer {
            Some(answer) => out.push_str(&format!("{pad}result: {answer}\n")),
            None => out.push_str(&format!("{pad}result: (none)\n")),
        }
    }
}

fn push_block(out: &mut String, pad: &str, label: &str, body: &str) {
    out.push_str(&format!("{pad}{label}:\n"));
    for line in body.lines() {
        out.push_str(&format!("{pad}  | {line}\n"));
    }
}

/// Append-only writer for one session's trace.
#[derive(Debug)]
pub struct TraceRecorder {
    trace: Trace,
}

impl TraceRecorder {
    pub fn new(
        session_id: SessionId,
        parent_id: Option<SessionId>,
        depth: usize,
        question: impl Into<String>,
        corpus_chars: usize,
    ) -> Self {
        Self {
            trace: Trace {
                session_id,
                parent_id,
                depth,
                question: question.into(),
                corpus_chars,
                entries: Vec::new(),
                status: SessionStatus::Running,
                answer: None,
                started_at: Utc::now(),
                finished_at: None,
            },
        }
    }

    pub fn record(&mut self, record: IterationRecord, children: Vec<Trace>) {
        self.trace.entries.push(TraceEntry { record, children });
    }

    pub fn len(&self) -> usize {
        self.trace.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.trace.entries.is_empty()
    }

    /// Records in append order.
    pub fn records(&self) -> impl Iterator<Item = &IterationRecord> {
        self.trace.entries.iter().map(|e| &e.record)
    }

    pub fn snapshot(&self) -> &Trace {
        &self.trace
    }

    /// Stamp the terminal status and hand over the finished trace.
    pub fn finish(mut self, status: SessionStatus, answer: Option<String>) -> Trace {
        self.trace.status = status;
        self.trace.answer = answer;
        self.trace.finished_at = Some(Utc::now());
        self.trace
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(index: usize, outcome: ExecutionOutcome) -> IterationRecord {
        IterationRecord {
            index,
            submitted_program: format!("print({index})"),
            execution_outcome: outcome,
            agent_free_text: format!("step {index}"),
            timestamp: Utc::now(),
        }
    }

    fn child_trace(parent: &SessionId, depth: usize, iterations: usize) -> Trace {
        let mut rec = TraceRecorder::new(SessionId::new(), Some(parent.clone()), depth, "sub", 10);
        for i in 0..iterations {
            rec.record(record(i, ExecutionOutcome::Output("x".into())), Vec::new());
        }
        rec.finish(SessionStatus::Answered, Some("sub answer".into()))
    }

    #[test]
    fn recorder_appends_in_order() {
        let mut rec = TraceRecorder::new(SessionId::new(), None, 0, "q", 100);
        assert!(rec.is_empty());
        rec.record(record(0, ExecutionOutcome::TimedOut), Vec::new());
        rec.record(record(1, ExecutionOutcome::Rejected("no".into())), Vec::new());
        let indices: Vec<usize> = rec.records().map(|r| r.index).collect();
        assert_eq!(indices, vec![0, 1]);
        assert_eq!(rec.snapshot().status, SessionStatus::Running);

        let trace = rec.finish(SessionStatus::Exhausted, None);
        assert_eq!(trace.iteration_count(), 2);
        assert!(trace.finished_at.is_some());
    }

    #[test]
    fn tree_metrics() {
        let root_id = SessionId::new();
        let mut rec = TraceRecorder::new(root_id.clone(), None, 0, "q", 100);
        let mut grandchild_parent = child_trace(&root_id, 1, 1);
        let grandchild = child_trace(&grandchild_parent.session_id, 2, 2);
        grandchild_parent.entries[0].children.push(grandchild);

        rec.record(
            record(0, ExecutionOutcome::Output("a".into())),
            vec![grandchild_parent, child_trace(&root_id, 1, 3)],
        );
        let trace = rec.finish(SessionStatus::Answered, Some("done".into()));

        assert_eq!(trace.iteration_count(), 1);
        assert_eq!(trace.total_iterations(), 1 + 1 + 2 + 3);
        assert_eq!(trace.max_depth(), 2);
        assert_eq!(trace.session_count(), 4);
    }

    #[test]
    fn json_export_round_trips_tree() {
        let root_id = SessionId::new();
        let mut rec = TraceRecorder::new(root_id.clone(), None, 0, "q", 5);
        rec.record(
            record(0, ExecutionOutcome::runtime_fault("NameError: x (line 1)")),
            vec![child_trace(&root_id, 1, 1)],
        );
        let trace = rec.finish(SessionStatus::Answered, Some("42".into()));

        let json = trace.to_json().unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["entries"][0]["index"], 0);
        assert_eq!(value["entries"][0]["execution_outcome"]["kind"], "runtime_fault");
        assert_eq!(value["entries"][0]["children"][0]["depth"], 1);
        assert!(value.get("parent_id").is_none());

        let back = Trace::from_json(&json).unwrap();
        assert_eq!(back, trace);
    }

    #[test]
    fn render_nests_children() {
        let root_id = SessionId::new();
        let mut rec = TraceRecorder::new(root_id.clone(), None, 0, "what is it?", 5);
        rec.record(
            record(0, ExecutionOutcome::Output("line one\nline two".into())),
            vec![child_trace(&root_id, 1, 1)],
        );
        let text = rec.finish(SessionStatus::Answered, Some("it".into())).render();

        assert!(text.contains("(depth 0) [answered]"));
        assert!(text.contains("question: what is it?"));
        assert!(text.contains("  | line two"));
        assert!(text.contains("\n  == session "));
        assert!(text.contains("(depth 1)"));
        assert!(text.ends_with("result: it\n"));
    }
}
