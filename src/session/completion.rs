use crate::sandbox::FINAL_ANSWER_MARKER;
use crate::types::ExecutionOutcome;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Detection {
    Continue,
    Answered(String),
}

/// Decides whether an iteration produced a final answer.
///
/// The marker `FINAL_ANSWER:` must start a line (leading whitespace is
/// allowed). Everything after it, to the end of the text, is the answer.
/// A marker in the program's output wins over one in the free text; within
/// output the last marker counts, within free text the first.
#[derive(Debug, Clone, Copy, Default)]
pub struct CompletionDetector;

impl CompletionDetector {
    pub fn new() -> Self {
        Self
    }

    pub fn detect(&self, outcome: &ExecutionOutcome, free_text: &str) -> Detection {
        if let ExecutionOutcome::Output(output) = outcome {
            if let Some(answer) = find_marker(output, Occurrence::Last) {
                return Detection::Answered(answer);
            }
        }
        match find_marker(free_text, Occurrence::First) {
            Some(answer) => Detection::Answered(answer),
            None => Detection::Continue,
        }
    }
}

#[derive(Clone, Copy)]
enum Occurrence {
    First,
    Last,
}

/// Answer following a line-leading marker, or `None` if absent or empty.
fn find_marker(text: &str, which: Occurrence) -> Option<String> {
    let mut offset = 0;
    let mut found = None;
    for line in text.split_inclusive('\n') {
        let trimmed = line.trim_start();
        if trimmed.starts_with(FINAL_ANSWER_MARKER) {
            let start = offset + (line.len() - trimmed.len()) + FINAL_ANSWER_MARKER.len();
            found = Some(start);
            if matches!(which, Occurrence::First) {
                break;
            }
        }
        offset += line.len();
    }
    let answer = text[found?..].trim();
    if answer.is_empty() {
        None
    } else {
        Some(answer.to_string())
    }
}
