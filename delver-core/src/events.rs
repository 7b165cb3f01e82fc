//! Run events and their server-sent-event framing.
//!
//! The coordinator emits events in causal order on an unbounded channel;
//! consumers may drop events but never see them reordered. Each event
//! serializes to one SSE frame: `data: <json>\n\n`, with non-ASCII characters
//! left unescaped. A stream terminates with the `end` frame.

use crate::state::ResearchState;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Category attached to `error` events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Input,
    Model,
    Provider,
    Citation,
    Cancelled,
    Deadline,
}

/// Events emitted by the run coordinator to external observers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunEvent {
    /// A stage has started executing.
    StageStart { name: String },
    /// A stage has finished.
    StageEnd { name: String, duration_ms: u64 },
    /// One analyzer thought, emitted once per research iteration.
    Thought { text: String },
    /// A finding was appended to the state.
    FindingAdded { url: String },
    /// A streamed token from the Writer.
    PartialReportToken { text: String },
    /// The run finished; carries the final (possibly partial) state.
    Done { state: Box<ResearchState> },
    /// A recoverable or terminal error occurred.
    Error { kind: ErrorKind, detail: String },
    /// Stream terminator.
    End,
}

impl RunEvent {
    /// Encode this event as one SSE frame.
    pub fn to_sse_frame(&self) -> String {
        // serde_json writes non-ASCII characters verbatim, as required.
        let json = serde_json::to_string(self)
            .unwrap_or_else(|_| r#"{"type":"error","kind":"model","detail":"encode"}"#.into());
        format!("data: {json}\n\n")
    }
}

/// Sender half of the run event channel.
///
/// Emission never blocks and never fails the run: if the receiver is gone
/// the event is dropped.
#[derive(Debug, Clone)]
pub struct EventSender {
    tx: mpsc::UnboundedSender<RunEvent>,
}

impl EventSender {
    /// Create a connected sender/receiver pair.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<RunEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Emit an event; drops it silently if no consumer is listening.
    pub fn emit(&self, event: RunEvent) {
        let _ = self.tx.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sse_frame_format() {
        let frame = RunEvent::StageStart {
            name: "planner".into(),
        }
        .to_sse_frame();
        assert_eq!(
            frame,
            "data: {\"type\":\"stage_start\",\"name\":\"planner\"}\n\n"
        );
    }

    #[test]
    fn test_sse_end_frame() {
        assert_eq!(RunEvent::End.to_sse_frame(), "data: {\"type\":\"end\"}\n\n");
    }

    #[test]
    fn test_sse_non_ascii_unescaped() {
        let frame = RunEvent::PartialReportToken {
            text: "요약 résumé".into(),
        }
        .to_sse_frame();
        assert!(frame.contains("요약 résumé"));
        assert!(!frame.contains("\\u"));
    }

    #[test]
    fn test_error_kind_tagging() {
        let frame = RunEvent::Error {
            kind: ErrorKind::Deadline,
            detail: "180000ms".into(),
        }
        .to_sse_frame();
        assert!(frame.contains("\"kind\":\"deadline\""));
    }

    #[tokio::test]
    async fn test_emit_preserves_order() {
        let (tx, mut rx) = EventSender::channel();
        tx.emit(RunEvent::StageStart {
            name: "clarify".into(),
        });
        tx.emit(RunEvent::StageEnd {
            name: "clarify".into(),
            duration_ms: 3,
        });
        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert!(matches!(first, RunEvent::StageStart { .. }));
        assert!(matches!(second, RunEvent::StageEnd { .. }));
    }

    #[tokio::test]
    async fn test_emit_without_consumer_is_silent() {
        let (tx, rx) = EventSender::channel();
        drop(rx);
        // Must not panic or error
        tx.emit(RunEvent::End);
    }
}
