//! Progress events and the guarded emitter that writes them to the client.

use async_trait::async_trait;
use axum::response::sse::Event;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::pipeline::state::{RunState, Stage};
use crate::pipeline::TailoringResult;

#[derive(Debug, Clone, Serialize)]
pub struct StatusUpdate {
    pub stage: Stage,
    pub message: String,
    pub progress: u8,
}

#[derive(Debug, Clone, Serialize)]
pub struct SectionChunk {
    pub index: usize,
    pub title: String,
    pub content: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorPayload {
    pub error: String,
    pub can_retry: bool,
}

#[derive(Debug, Clone)]
pub enum PipelineEvent {
    Status(StatusUpdate),
    Section(SectionChunk),
    Complete(Box<TailoringResult>),
    Error(ErrorPayload),
}

const ENCODE_FAILURE: &str = r#"{"error":"Failed to encode event","canRetry":false}"#;

impl PipelineEvent {
    pub fn name(&self) -> &'static str {
        match self {
            PipelineEvent::Status(_) => "status",
            PipelineEvent::Section(_) => "section",
            PipelineEvent::Complete(_) => "complete",
            PipelineEvent::Error(_) => "error",
        }
    }

    pub fn data(&self) -> String {
        let encoded = match self {
            PipelineEvent::Status(s) => serde_json::to_string(s),
            PipelineEvent::Section(s) => serde_json::to_string(s),
            PipelineEvent::Complete(r) => serde_json::to_string(r),
            PipelineEvent::Error(e) => serde_json::to_string(e),
        };
        encoded.unwrap_or_else(|e| {
            error!("Failed to encode {} event: {e}", self.name());
            ENCODE_FAILURE.to_string()
        })
    }

    pub fn to_sse(&self) -> Event {
        Event::default().event(self.name()).data(self.data())
    }
}

#[derive(Debug, Error)]
#[error("event stream closed")]
pub struct TransportClosed;

/// Where a run's events go. Closing is how a client disconnect shows up.
#[async_trait]
pub trait EventTransport: Send {
    fn is_closed(&self) -> bool;

    async fn deliver(&mut self, event: PipelineEvent) -> Result<(), TransportClosed>;
}

#[async_trait]
impl EventTransport for mpsc::Sender<PipelineEvent> {
    fn is_closed(&self) -> bool {
        mpsc::Sender::is_closed(self)
    }

    async fn deliver(&mut self, event: PipelineEvent) -> Result<(), TransportClosed> {
        self.send(event).await.map_err(|_| TransportClosed)
    }
}

/// Writes events for one run, enforcing the run state machine.
///
/// Every write first checks the transport; once it is closed the run is
/// aborted and all later writes are no-ops. At most one terminal event is
/// written, and it is always the last.
pub struct RunEmitter<T> {
    transport: T,
    state: RunState,
}

impl<T: EventTransport> RunEmitter<T> {
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            state: RunState::default(),
        }
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    /// True while the run is active and the client is still listening.
    pub fn is_open(&mut self) -> bool {
        if !self.state.is_active() {
            return false;
        }
        if self.transport.is_closed() {
            self.mark_aborted();
            return false;
        }
        true
    }

    /// Emits a `status` event. Returns whether the stream is still open.
    pub async fn status(&mut self, stage: Stage, progress: u8, message: &str) -> bool {
        if !self.is_open() {
            return false;
        }
        if let Err(e) = self.state.advance(stage, progress) {
            warn!("Skipping status event: {e}");
            return true;
        }
        self.deliver(PipelineEvent::Status(StatusUpdate {
            stage,
            message: message.to_string(),
            progress: self.state.progress(),
        }))
        .await
    }

    pub async fn section(&mut self, index: usize, title: &str, content: &str) -> bool {
        if !self.is_open() {
            return false;
        }
        self.deliver(PipelineEvent::Section(SectionChunk {
            index,
            title: title.to_string(),
            content: content.to_string(),
        }))
        .await
    }

    pub async fn complete(&mut self, result: TailoringResult) -> bool {
        if !self.is_open() {
            return false;
        }
        let delivered = self
            .deliver(PipelineEvent::Complete(Box::new(result)))
            .await;
        if delivered {
            let _ = self.state.complete();
        }
        delivered
    }

    pub async fn fail(&mut self, message: &str, can_retry: bool) -> bool {
        if !self.is_open() {
            return false;
        }
        let delivered = self
            .deliver(PipelineEvent::Error(ErrorPayload {
                error: message.to_string(),
                can_retry,
            }))
            .await;
        if delivered {
            let _ = self.state.fail();
        }
        delivered
    }

    async fn deliver(&mut self, event: PipelineEvent) -> bool {
        match self.transport.deliver(event).await {
            Ok(()) => true,
            Err(TransportClosed) => {
                self.mark_aborted();
                false
            }
        }
    }

    fn mark_aborted(&mut self) {
        if self.state.abort().is_ok() {
            info!("Client disconnected; halting event emission");
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex};

    /// Records every delivered event. Closes itself after `close_after`
    /// deliveries, or whenever the test flips `closed`.
    #[derive(Clone, Default)]
    pub(crate) struct MockTransport {
        pub events: Arc<Mutex<Vec<PipelineEvent>>>,
        pub closed: Arc<AtomicBool>,
        pub close_after: Option<usize>,
    }

    impl MockTransport {
        pub fn closing_after(n: usize) -> Self {
            Self {
                close_after: Some(n),
                ..Self::default()
            }
        }

        pub fn names(&self) -> Vec<&'static str> {
            self.events.lock().unwrap().iter().map(|e| e.name()).collect()
        }

        pub fn progress_values(&self) -> Vec<u8> {
            self.events
                .lock()
                .unwrap()
                .iter()
                .filter_map(|e| match e {
                    PipelineEvent::Status(s) => Some(s.progress),
                    _ => None,
                })
                .collect()
        }
    }

    #[async_trait]
    impl EventTransport for MockTransport {
        fn is_closed(&self) -> bool {
            self.closed.load(Ordering::SeqCst)
        }

        async fn deliver(&mut self, event: PipelineEvent) -> Result<(), TransportClosed> {
            if self.is_closed() {
                return Err(TransportClosed);
            }
            let mut events = self.events.lock().unwrap();
            events.push(event);
            if self.close_after.is_some_and(|n| events.len() >= n) {
                self.closed.store(true, Ordering::SeqCst);
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_status_events_carry_stage_and_progress() {
        let transport = MockTransport::default();
        let mut emitter = RunEmitter::new(transport.clone());
        assert!(emitter.status(Stage::Preprocessing, 10, "Analyzing").await);
        assert!(emitter.status(Stage::Scoring, 20, "Scoring").await);
        assert_eq!(transport.progress_values(), vec![10, 20]);
    }

    #[tokio::test]
    async fn test_backwards_status_is_dropped() {
        let transport = MockTransport::default();
        let mut emitter = RunEmitter::new(transport.clone());
        emitter.status(Stage::Generating, 40, "Generating").await;
        assert!(emitter.status(Stage::Scoring, 20, "Scoring").await);
        assert_eq!(transport.progress_values(), vec![40]);
    }

    #[tokio::test]
    async fn test_no_writes_after_abort() {
        let transport = MockTransport::default();
        let mut emitter = RunEmitter::new(transport.clone());
        emitter.status(Stage::Preprocessing, 10, "Analyzing").await;

        transport.closed.store(true, Ordering::SeqCst);

        assert!(!emitter.status(Stage::Scoring, 20, "Scoring").await);
        assert!(!emitter.section(0, "Experience", "...").await);
        assert!(!emitter.fail("boom", false).await);
        assert_eq!(transport.names(), vec!["status"]);
        assert_eq!(emitter.state(), RunState::Aborted);
    }

    #[tokio::test]
    async fn test_single_terminal_event() {
        let transport = MockTransport::default();
        let mut emitter = RunEmitter::new(transport.clone());
        assert!(emitter.fail("first", true).await);
        assert!(!emitter.fail("second", true).await);
        assert!(!emitter.status(Stage::Processing, 60, "late").await);
        assert_eq!(transport.names(), vec!["error"]);
        assert_eq!(emitter.state(), RunState::Failed);
    }

    #[tokio::test]
    async fn test_channel_transport_reports_dropped_receiver() {
        let (tx, rx) = mpsc::channel(4);
        let mut emitter = RunEmitter::new(tx);
        assert!(emitter.status(Stage::Preprocessing, 10, "Analyzing").await);
        drop(rx);
        assert!(!emitter.is_open());
        assert_eq!(emitter.state(), RunState::Aborted);
    }

    #[test]
    fn test_error_payload_wire_format() {
        let event = PipelineEvent::Error(ErrorPayload {
            error: "Generation failed".to_string(),
            can_retry: true,
        });
        assert_eq!(event.name(), "error");
        assert_eq!(
            event.data(),
            r#"{"error":"Generation failed","canRetry":true}"#
        );
    }

    #[test]
    fn test_status_wire_format() {
        let event = PipelineEvent::Status(StatusUpdate {
            stage: Stage::PostScoring,
            message: "Validating".to_string(),
            progress: 80,
        });
        assert_eq!(
            event.data(),
            r#"{"stage":"scoring","message":"Validating","progress":80}"#
        );
    }
}
