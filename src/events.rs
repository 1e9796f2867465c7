use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::types::{ExecutionOutcome, SessionId, SessionStatus};

/// Progress notifications for a session tree. Child sessions publish into
/// their root's channel; `depth` and `parent_id` tell them apart.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    SessionStarted {
        session_id: SessionId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        parent_id: Option<SessionId>,
        depth: usize,
        question: String,
    },
    IterationCompleted {
        session_id: SessionId,
        depth: usize,
        iteration_index: usize,
        program: String,
        outcome: ExecutionOutcome,
        free_text: String,
    },
    SessionFinished {
        session_id: SessionId,
        depth: usize,
        status: SessionStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        answer: Option<String>,
        iteration_count: usize,
    },
}

impl SessionEvent {
    pub fn session_id(&self) -> &SessionId {
        match self {
            SessionEvent::SessionStarted { session_id, .. }
            | SessionEvent::IterationCompleted { session_id, .. }
            | SessionEvent::SessionFinished { session_id, .. } => session_id,
        }
    }

    pub fn depth(&self) -> usize {
        match self {
            SessionEvent::SessionStarted { depth, .. }
            | SessionEvent::IterationCompleted { depth, .. }
            | SessionEvent::SessionFinished { depth, .. } => *depth,
        }
    }

    /// Terminal event of the root session: nothing follows it.
    pub fn is_root_finish(&self) -> bool {
        matches!(self, SessionEvent::SessionFinished { depth: 0, .. })
    }
}

/// Publishing side of a session tree's event channel. Cheap to clone;
/// publishing never blocks and never fails the session.
#[derive(Debug, Clone, Default)]
pub struct EventSink {
    sender: Option<broadcast::Sender<SessionEvent>>,
}

impl EventSink {
    /// A sink with nobody listening.
    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn channel(capacity: usize) -> (Self, broadcast::Receiver<SessionEvent>) {
        let (sender, receiver) = broadcast::channel(capacity.max(1));
        (
            Self {
                sender: Some(sender),
            },
            receiver,
        )
    }

    pub fn publish(&self, event: SessionEvent) {
        if let Some(sender) = &self.sender {
            // No receivers is fine.
            let _ = sender.send(event);
        }
    }

    /// New receiver; sees events published from now on.
    pub fn subscribe(&self) -> Option<broadcast::Receiver<SessionEvent>> {
        self.sender.as_ref().map(|s| s.subscribe())
    }

    pub fn is_enabled(&self) -> bool {
        self.sender.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn finished(depth: usize) -> SessionEvent {
        SessionEvent::SessionFinished {
            session_id: SessionId::new(),
            depth,
            status: SessionStatus::Answered,
            answer: Some("42".into()),
            iteration_count: 1,
        }
    }

    #[test]
    fn event_serializes_with_type_tag() {
        let event = SessionEvent::IterationCompleted {
            session_id: SessionId::new(),
            depth: 1,
            iteration_index: 3,
            program: "print(1)".into(),
            outcome: ExecutionOutcome::Output("1\n".into()),
            free_text: String::new(),
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "iteration_completed");
        assert_eq!(value["iteration_index"], 3);
        assert_eq!(value["outcome"]["kind"], "output");

        let back: SessionEvent = serde_json::from_value(value).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn root_finish_detection() {
        assert!(finished(0).is_root_finish());
        assert!(!finished(1).is_root_finish());
        assert_eq!(finished(2).depth(), 2);
    }

    #[tokio::test]
    async fn fan_out_to_subscribers() {
        let (sink, mut first) = EventSink::channel(8);
        let mut second = sink.subscribe().unwrap();
        sink.publish(finished(0));
        assert!(first.recv().await.unwrap().is_root_finish());
        assert!(second.recv().await.unwrap().is_root_finish());
    }

    #[test]
    fn disabled_sink_drops_silently() {
        let sink = EventSink::disabled();
        assert!(!sink.is_enabled());
        assert!(sink.subscribe().is_none());
        sink.publish(finished(0));
    }
}
