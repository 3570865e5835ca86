//! Progress event types and the channel handle used to emit them.
//!
//! The coordinator and orchestrator push [`ProgressEvent`]s onto a tokio
//! channel; whatever drains it (the CLI, a websocket forwarder) is outside
//! the core. Event JSON is tagged with a `type` field.

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::artifacts::ArtifactPaths;
use crate::types::{QuestionCategory, SummaryReport};

/// The four externally visible pipeline modules, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineModule {
    QuestionGen,
    FormatConvert,
    Retrieval,
    Evaluation,
}

impl PipelineModule {
    /// Stage execution order.
    pub fn sequence() -> [PipelineModule; 4] {
        [
            PipelineModule::QuestionGen,
            PipelineModule::FormatConvert,
            PipelineModule::Retrieval,
            PipelineModule::Evaluation,
        ]
    }
}

impl std::fmt::Display for PipelineModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PipelineModule::QuestionGen => write!(f, "question_gen"),
            PipelineModule::FormatConvert => write!(f, "format_convert"),
            PipelineModule::Retrieval => write!(f, "retrieval"),
            PipelineModule::Evaluation => write!(f, "evaluation"),
        }
    }
}

/// Status carried by a `module_progress` event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModuleStatus {
    Start,
    Progress,
    Complete,
    Skipped,
}

/// Events emitted by the pipeline to its consumer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProgressEvent {
    /// The run has started.
    Start { run_id: Uuid, total_questions: usize },
    /// One question reached a terminal retrieval state. `current` only ever
    /// increases within a run.
    Progress {
        current: usize,
        total: usize,
        question_id: Uuid,
        succeeded: bool,
    },
    /// Every question of one category reached a terminal state.
    CategoryComplete {
        category: QuestionCategory,
        completed: usize,
        failed: usize,
    },
    /// A pipeline stage changed status.
    ModuleProgress {
        module: PipelineModule,
        status: ModuleStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<serde_json::Value>,
    },
    /// Terminal success. `summary` is present whenever evaluation ran.
    Complete {
        summary: Option<Box<SummaryReport>>,
        artifacts: ArtifactPaths,
    },
    /// Terminal failure.
    Error { message: String },
}

/// Cloneable handle for pushing progress events.
///
/// Emission is best-effort: a send into a closed channel is dropped, never an
/// error. The coordinator checks [`EventSink::is_connected`] before
/// scheduling more work so a departed consumer cancels the remainder of the
/// batch without losing finished records.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: Option<mpsc::UnboundedSender<ProgressEvent>>,
}

impl EventSink {
    pub fn new(tx: mpsc::UnboundedSender<ProgressEvent>) -> Self {
        Self { tx: Some(tx) }
    }

    /// A sink with no consumer at all. Events are dropped and the run is
    /// never treated as cancelled.
    pub fn noop() -> Self {
        Self { tx: None }
    }

    /// Convenience constructor for a sink plus its receiving end.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<ProgressEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx), rx)
    }

    pub fn emit(&self, event: ProgressEvent) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(event);
        }
    }

    /// False only when a consumer existed and has gone away.
    pub fn is_connected(&self) -> bool {
        match &self.tx {
            Some(tx) => !tx.is_closed(),
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(event: &ProgressEvent) -> serde_json::Value {
        let json = serde_json::to_string(event).unwrap();
        let _restored: ProgressEvent = serde_json::from_str(&json).unwrap();
        serde_json::from_str(&json).unwrap()
    }

    #[test]
    fn test_start_event_tag() {
        let value = round_trip(&ProgressEvent::Start {
            run_id: Uuid::new_v4(),
            total_questions: 30,
        });
        assert_eq!(value["type"], "start");
        assert_eq!(value["total_questions"], 30);
    }

    #[test]
    fn test_progress_event_tag() {
        let value = round_trip(&ProgressEvent::Progress {
            current: 3,
            total: 10,
            question_id: Uuid::new_v4(),
            succeeded: true,
        });
        assert_eq!(value["type"], "progress");
        assert_eq!(value["current"], 3);
        assert_eq!(value["total"], 10);
    }

    #[test]
    fn test_category_complete_event_tag() {
        let value = round_trip(&ProgressEvent::CategoryComplete {
            category: QuestionCategory::S6,
            completed: 4,
            failed: 1,
        });
        assert_eq!(value["type"], "category_complete");
        assert_eq!(value["category"], "S6");
    }

    #[test]
    fn test_module_progress_event_tag() {
        let value = round_trip(&ProgressEvent::ModuleProgress {
            module: PipelineModule::Retrieval,
            status: ModuleStatus::Skipped,
            data: Some(serde_json::json!({"reason": "existing artifact reused"})),
        });
        assert_eq!(value["type"], "module_progress");
        assert_eq!(value["module"], "retrieval");
        assert_eq!(value["status"], "skipped");
        assert_eq!(value["data"]["reason"], "existing artifact reused");
    }

    #[test]
    fn test_error_event_tag() {
        let value = round_trip(&ProgressEvent::Error {
            message: "retrieval stage failed: service unreachable".into(),
        });
        assert_eq!(value["type"], "error");
        assert!(value["message"].as_str().unwrap().contains("unreachable"));
    }

    #[test]
    fn test_module_sequence_order() {
        let sequence = PipelineModule::sequence();
        assert_eq!(sequence[0], PipelineModule::QuestionGen);
        assert_eq!(sequence[3], PipelineModule::Evaluation);
        assert_eq!(sequence[2].to_string(), "retrieval");
    }

    #[tokio::test]
    async fn test_sink_delivers_events() {
        let (sink, mut rx) = EventSink::channel();
        sink.emit(ProgressEvent::Error {
            message: "boom".into(),
        });
        match rx.recv().await {
            Some(ProgressEvent::Error { message }) => assert_eq!(message, "boom"),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_emit_wakes_pending_receiver() {
        let (sink, mut rx) = EventSink::channel();
        let mut recv = tokio_test::task::spawn(rx.recv());
        tokio_test::assert_pending!(recv.poll());

        sink.emit(ProgressEvent::Error {
            message: "wake".into(),
        });
        assert!(recv.is_woken());
        match tokio_test::assert_ready!(recv.poll()) {
            Some(ProgressEvent::Error { message }) => assert_eq!(message, "wake"),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_sink_disconnect_detection() {
        let (sink, rx) = EventSink::channel();
        assert!(sink.is_connected());
        drop(rx);
        assert!(!sink.is_connected());
        // Emission after disconnect is silently dropped.
        sink.emit(ProgressEvent::Error {
            message: "late".into(),
        });
    }

    #[test]
    fn test_noop_sink_stays_connected() {
        let sink = EventSink::noop();
        assert!(sink.is_connected());
        sink.emit(ProgressEvent::Error {
            message: "dropped".into(),
        });
    }
}
