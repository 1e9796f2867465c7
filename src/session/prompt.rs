use crate::types::{AgentPrompt, Corpus, ExecutionOutcome, IterationRecord, Message, RecursionBudget};

/// Characters of the corpus shown to the agent on the first iteration.
const PREVIEW_CHARS: usize = 500;

pub const SYSTEM_PROMPT: &str = r#"You are answering a question about a text corpus that is too large to read at once. The corpus is bound to the variable `context`. You inspect it by writing small programs in ```rlm``` code blocks; each block you send is run and its printed output is returned to you.

## Language
- `let name = expr` binds a variable; `name = expr` reassigns it. Variables persist between your turns.
- `if cond { ... } else { ... }`, `for item in list { ... }`. Statements end at a newline or `;`. `#` starts a comment.
- Values: integers, strings ('single' or "double" quoted), lists `[a, b]`, `true`, `false`, `none`.
- Operators: `+ - * / %`, `== != < <= > >=`, `in`, `not in`, `and`, `or`, `not`, indexing `x[i]` and slicing `x[a:b]`.
- Indices and lengths count characters.

## Functions
- `print(...)`, `len(x)`, `str(x)`, `int(x)`, `range(n)`, `min(...)`, `max(...)`, `show_vars()`
- `lines(text)`, `split(text, sep)`, `join(list, sep)`, `slice(x, start, end)`
- `chunk(text, chars)`, `chunk_lines(text, n)` split text into pieces
- `grep(text, regex)` matching lines, `search(text, regex)` matches, `split_regex(text, regex)`
- `find`, `count`, `contains`, `startswith`, `endswith`, `replace`, `upper`, `lower`, `strip`
- Text methods: `s.split(sep)`, `s.lines()`, `s.find(x)`, `s.count(x)`, `s.contains(x)`, `s.replace(a, b)`, `s.upper()`, `s.lower()`, `s.strip()`, `sep.join(list)`
- `recurse(question, text)` asks a fresh sub-agent `question` about `text` and returns its answer as a string. Use it on pieces of the corpus that are too large to read directly.
- `final(value)` ends the program and submits `value` as your answer.

Nothing else is available: no files, no network, no imports. `context` and the function names cannot be rebound.

## Finishing
When you know the answer, call `final(answer)` in a program, or write a line starting with `FINAL_ANSWER:` followed by the answer.

## Example
```rlm
let parts = chunk_lines(context, 200)
let notes = []
for part in parts {
    notes = notes + [recurse("Which functions spawn tasks here?", part)]
}
final(join(notes, "\n"))
```

Act immediately rather than planning at length, and check intermediate results with print."#;

/// Builds the prompt for each iteration from the session's question, corpus
/// and history.
#[derive(Debug, Clone)]
pub struct PromptBuilder {
    system: String,
    max_context_chars: usize,
}

impl PromptBuilder {
    pub fn new(system_override: Option<&str>, max_context_chars: usize) -> Self {
        Self {
            system: system_override.unwrap_or(SYSTEM_PROMPT).to_string(),
            max_context_chars,
        }
    }

    pub fn system(&self) -> &str {
        &self.system
    }

    pub fn build(
        &self,
        question: &str,
        corpus: &Corpus,
        depth: usize,
        budget: &RecursionBudget,
        history: &[IterationRecord],
    ) -> AgentPrompt {
        let (kept, elided) = self.fit_history(history);

        let mut opening = opening_message(question, corpus, depth, budget);
        if elided > 0 {
            opening.push_str(&format!(
                "\n\n[{elided} earlier iteration(s) omitted to stay within {} characters of history]",
                self.max_context_chars
            ));
        }

        let mut messages = vec![Message::user(opening)];
        let remaining_at = |index: usize| budget.max_iterations.saturating_sub(index + 1);
        for record in &history[history.len() - kept..] {
            messages.push(Message::assistant(agent_turn(record)));
            messages.push(Message::user(format!(
                "{}\n\nIterations remaining: {}",
                feedback(&record.execution_outcome),
                remaining_at(record.index)
            )));
        }

        AgentPrompt {
            system: self.system.clone(),
            messages,
        }
    }

    /// How many of the newest records fit in the history budget, and how
    /// many older ones were left out. The newest record is always kept.
    fn fit_history(&self, history: &[IterationRecord]) -> (usize, usize) {
        let mut used = 0usize;
        let mut kept = 0usize;
        for record in history.iter().rev() {
            let size = agent_turn(record).chars().count()
                + feedback(&record.execution_outcome).chars().count();
            if kept > 0 && used + size > self.max_context_chars {
                break;
            }
            used += size;
            kept += 1;
        }
        (kept, history.len() - kept)
    }
}

fn opening_message(question: &str, corpus: &Corpus, depth: usize, budget: &RecursionBudget) -> String {
    let preview = corpus.preview(PREVIEW_CHARS);
    let mut text = format!(
        "Question: {question}\n\n\
         The corpus is bound to `context`: {} characters, {} lines.",
        corpus.char_len(),
        corpus.line_count()
    );
    if !preview.is_empty() {
        let shown = preview.chars().count();
        text.push_str(&format!("\nFirst {shown} characters:\n---\n{preview}\n---"));
    }
    if depth > 0 {
        text.push_str(&format!("\n\nYou are a sub-agent at depth {depth}."));
    }
    let recursion = if depth < budget.max_depth {
        "`recurse` is available."
    } else {
        "`recurse` is not available at this depth."
    };
    text.push_str(&format!(
        "\n\nYou have {} iterations. {recursion} Write your first ```rlm``` block now.",
        budget.max_iterations
    ));
    text
}

fn agent_turn(record: &IterationRecord) -> String {
    let mut turn = String::new();
    if !record.agent_free_text.is_empty() {
        turn.push_str(&record.agent_free_text);
        turn.push_str("\n\n");
    }
    turn.push_str("```rlm\n");
    turn.push_str(&record.submitted_program);
    turn.push_str("\n```");
    turn
}

fn feedback(outcome: &ExecutionOutcome) -> String {
    match outcome {
        ExecutionOutcome::Output(text) if text.trim().is_empty() => {
            "Program ran with no output.".to_string()
        }
        ExecutionOutcome::Output(text) => format!("Output:\n{text}"),
        ExecutionOutcome::Rejected(reason) => format!(
            "Program rejected before running: {reason}\nUse only the functions listed in the instructions."
        ),
        ExecutionOutcome::RuntimeFault { message, .. } => format!("Program failed:\n{message}"),
        ExecutionOutcome::TimedOut => {
            "Program timed out and was stopped. Variables it set were discarded. Work on smaller pieces."
                .to_string()
        }
    }
}
