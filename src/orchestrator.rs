//! Orchestration facade: the entry point for asking questions.
//!
//! [`Orchestrator::ask`] returns the final answer; [`Orchestrator::start`]
//! returns a [`SessionHandle`] that streams [`SessionEvent`]s while the
//! session runs and can cancel it. Every top-level request passes through
//! the same [`AdmissionControl`].

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::{CancellationToken, DropGuard};

use crate::config::RlmConfig;
use crate::error::{RlmError, RlmResult};
use crate::events::{EventSink, SessionEvent};
use crate::pool::AdmissionControl;
use crate::provider::ReasoningAgent;
use crate::runlog::{LogEntry, LogLevel, RunLogger};
use crate::session::{Failure, Session, SessionReport, SessionRuntime};
use crate::types::{Corpus, SessionId, SessionStatus};

/// Supplies the corpus for a question. Acquisition (cloning, fetching,
/// concatenating files) lives behind this trait.
#[async_trait]
pub trait CorpusProvider: Send + Sync {
    async fn load(&self) -> RlmResult<Corpus>;
}

#[async_trait]
impl CorpusProvider for Corpus {
    async fn load(&self) -> RlmResult<Corpus> {
        Ok(self.clone())
    }
}

pub struct Orchestrator {
    agent: Arc<dyn ReasoningAgent>,
    config: Arc<RlmConfig>,
    logger: Arc<RunLogger>,
    admission: AdmissionControl,
}

impl Orchestrator {
    pub fn new(agent: Arc<dyn ReasoningAgent>, config: RlmConfig) -> RlmResult<Self> {
        config.validate()?;
        let admission = AdmissionControl::new(config.workers, config.max_queue_depth);
        Ok(Self {
            agent,
            config: Arc::new(config),
            logger: Arc::new(RunLogger::tracing()),
            admission,
        })
    }

    pub fn with_logger(mut self, logger: RunLogger) -> Self {
        self.logger = Arc::new(logger);
        self
    }

    pub fn config(&self) -> &RlmConfig {
        &self.config
    }

    pub fn admission(&self) -> &AdmissionControl {
        &self.admission
    }

    /// Admit a question and start its session in the background.
    ///
    /// Fails immediately with `CapacityExceeded` when the pool and its queue
    /// are full; no session is created in that case. Must be called from
    /// within a tokio runtime.
    pub fn start(
        &self,
        question: impl Into<String>,
        corpus: impl Into<Corpus>,
    ) -> RlmResult<SessionHandle> {
        self.start_with(question.into(), corpus.into(), Arc::clone(&self.config))
    }

    fn start_with(
        &self,
        question: String,
        corpus: Corpus,
        config: Arc<RlmConfig>,
    ) -> RlmResult<SessionHandle> {
        let reservation = match self.admission.reserve() {
            Ok(reservation) => reservation,
            Err(err) => {
                self.logger.log(
                    &LogEntry::new(LogLevel::Warn, "orchestrator", format!("request refused: {err}"))
                        .with_payload(json!({ "capacity": self.admission.capacity() })),
                );
                return Err(err);
            }
        };

        let id = SessionId::new();
        let (events, receiver) = EventSink::channel(config.event_buffer);
        let cancel = CancellationToken::new();
        let runtime = SessionRuntime::new(
            Arc::clone(&self.agent),
            config,
            Arc::clone(&self.logger),
            events.clone(),
        );
        let logger = Arc::clone(&self.logger);
        logger.log(
            &LogEntry::new(LogLevel::Debug, "orchestrator", "request admitted")
                .with_session(&id, 0)
                .with_payload(json!({
                    "in_flight": self.admission.in_flight(),
                    "running": self.admission.running(),
                })),
        );

        let session = Session::root(runtime, id.clone(), question.clone(), corpus.clone(), cancel.clone());
        let task_cancel = cancel.clone();
        let task_id = id.clone();
        let task = tokio::spawn(async move {
            let slot = tokio::select! {
                biased;
                _ = task_cancel.cancelled() => Err(RlmError::Cancelled),
                slot = reservation.acquire() => slot,
            };
            let report = match slot {
                Ok(slot) => {
                    let report = session.run().await;
                    drop(slot);
                    report
                }
                Err(err) => {
                    let mut report =
                        SessionReport::cancelled_before_start(task_id, &question, &corpus);
                    if !matches!(err, RlmError::Cancelled) {
                        report.failure = Some(Failure::from_error(&err));
                    }
                    events.publish(SessionEvent::SessionFinished {
                        session_id: report.session_id.clone(),
                        depth: 0,
                        status: SessionStatus::Failed,
                        answer: None,
                        iteration_count: 0,
                    });
                    logger.log(
                        &LogEntry::new(LogLevel::Info, "orchestrator", "request ended before it started")
                            .with_session(&report.session_id, 0),
                    );
                    report
                }
            };
            logger.flush();
            report
        });

        Ok(SessionHandle {
            id,
            events: receiver,
            guard: cancel.clone().drop_guard(),
            cancel,
            task,
        })
    }

    /// Run a question to completion and return the full report.
    pub async fn run(
        &self,
        question: impl Into<String>,
        corpus: impl Into<Corpus>,
    ) -> RlmResult<SessionReport> {
        self.start(question, corpus)?.wait().await
    }

    /// The final answer, or the exhaustion sentinel. Failed sessions and
    /// refused requests are errors.
    pub async fn ask(
        &self,
        question: impl Into<String>,
        corpus: impl Into<Corpus>,
    ) -> RlmResult<String> {
        self.run(question, corpus).await?.into_answer()
    }

    /// [`ask`](Self::ask) with configuration for this request only. Worker
    /// pool limits stay those of the orchestrator.
    pub async fn ask_with(
        &self,
        question: impl Into<String>,
        corpus: impl Into<Corpus>,
        config: RlmConfig,
    ) -> RlmResult<String> {
        config.validate()?;
        self.start_with(question.into(), corpus.into(), Arc::new(config))?
            .wait()
            .await?
            .into_answer()
    }

    /// [`ask`](Self::ask) over a corpus loaded from `provider`.
    pub async fn ask_from(
        &self,
        question: impl Into<String>,
        provider: &dyn CorpusProvider,
    ) -> RlmResult<String> {
        let corpus = provider.load().await?;
        self.ask(question, corpus).await
    }
}

/// A running top-level session.
///
/// Dropping the handle, or a `wait()` future that has not completed,
/// cancels the session tree. Use [`detach`](Self::detach) to let it run on.
pub struct SessionHandle {
    id: SessionId,
    events: broadcast::Receiver<SessionEvent>,
    guard: DropGuard,
    cancel: CancellationToken,
    task: JoinHandle<SessionReport>,
}

impl SessionHandle {
    pub fn id(&self) -> &SessionId {
        &self.id
    }

    /// Receiver subscribed before the session started; sees every event
    /// unless it falls more than `event_buffer` events behind.
    pub fn events(&mut self) -> &mut broadcast::Receiver<SessionEvent> {
        &mut self.events
    }

    /// An additional receiver that sees events from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.resubscribe()
    }

    /// Next event, skipping over any lost to lag. `None` once the session
    /// tree has finished and the channel is drained.
    pub async fn next_event(&mut self) -> Option<SessionEvent> {
        loop {
            match self.events.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Cancel the session and every sub-session under it.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    pub async fn wait(self) -> RlmResult<SessionReport> {
        let SessionHandle { guard, task, .. } = self;
        let joined = task.await;
        guard.disarm();
        joined.map_err(|err| RlmError::Session(format!("session task failed: {err}")))
    }

    /// Give up the handle without cancelling; the session runs to its end.
    pub fn detach(self) -> JoinHandle<SessionReport> {
        let SessionHandle { guard, task, .. } = self;
        guard.disarm();
        task
    }
}
