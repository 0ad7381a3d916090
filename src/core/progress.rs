//! Typed progress stream for one in-flight job.
//!
//! The processing server pushes JSON status snapshots for a remote task.
//! `ProgressChannel` turns those raw payloads into `ProgressEvent`s and
//! guarantees that at most one terminal event is ever handed out: after a
//! terminal status or a failure the channel is closed and yields nothing more.

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::mpsc;

use super::models::{JobResult, Progress};
use super::transport::TransportError;

/// Source of raw event payloads (one JSON document per event).
#[async_trait]
pub trait EventSource: Send {
    /// Next payload, or `Ok(None)` once the stream has ended.
    async fn next_event(&mut self) -> Result<Option<String>, TransportError>;
}

/// `EventSource` fed from an in-process channel. Used by the simulated
/// transport and by tests.
pub struct ChannelEventSource {
    rx: mpsc::Receiver<String>,
}

impl ChannelEventSource {
    pub fn new(rx: mpsc::Receiver<String>) -> Self {
        Self { rx }
    }
}

#[async_trait]
impl EventSource for ChannelEventSource {
    async fn next_event(&mut self) -> Result<Option<String>, TransportError> {
        Ok(self.rx.recv().await)
    }
}

/// Status carried by one progress update.
#[derive(Debug, Clone, PartialEq)]
pub enum ProgressStatus {
    Processing,
    Complete(JobResult),
    Error,
    Cancelled,
}

impl ProgressStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ProgressStatus::Processing)
    }
}

/// One typed update for a job.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressEvent {
    pub status: ProgressStatus,
    pub message: String,
    pub percent: u8,
}

impl ProgressEvent {
    pub fn progress(&self) -> Progress {
        Progress::new(self.percent, self.message.clone())
    }
}

/// The channel failed before a terminal status arrived.
#[derive(Debug, thiserror::Error)]
pub enum ProgressError {
    #[error("connection lost: stream ended before the task finished")]
    Disconnected,
    #[error("connection lost: {0}")]
    Transport(#[from] TransportError),
    #[error("connection lost: malformed progress update: {0}")]
    Malformed(String),
}

#[derive(Deserialize)]
struct RawUpdate {
    status: String,
    #[serde(default)]
    message: String,
    #[serde(default)]
    percent: f64,
    #[serde(default)]
    data: Option<JobResult>,
}

/// Parse one raw payload into a typed event.
pub fn parse_update(payload: &str) -> Result<ProgressEvent, ProgressError> {
    let raw: RawUpdate =
        serde_json::from_str(payload).map_err(|e| ProgressError::Malformed(e.to_string()))?;

    let status = match raw.status.as_str() {
        // `paused` is a badge only; the server keeps the task alive.
        "starting" | "processing" | "paused" => ProgressStatus::Processing,
        "complete" => ProgressStatus::Complete(raw.data.unwrap_or_default()),
        "error" => ProgressStatus::Error,
        "cancelled" => ProgressStatus::Cancelled,
        other => return Err(ProgressError::Malformed(format!("unknown status {:?}", other))),
    };

    let percent = if raw.percent.is_finite() {
        raw.percent.clamp(0.0, 100.0).round() as u8
    } else {
        0
    };

    Ok(ProgressEvent {
        status,
        message: raw.message,
        percent,
    })
}

/// Ordered progress updates for a single remote task.
pub struct ProgressChannel {
    source: Option<Box<dyn EventSource>>,
}

impl ProgressChannel {
    pub fn new(source: impl EventSource + 'static) -> Self {
        Self {
            source: Some(Box::new(source)),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.source.is_none()
    }

    /// Drop the underlying stream. Idempotent.
    pub fn close(&mut self) {
        self.source = None;
    }

    /// Next update. After a terminal event or an error the channel closes and
    /// every later call returns `None`.
    pub async fn next(&mut self) -> Option<Result<ProgressEvent, ProgressError>> {
        let source = self.source.as_mut()?;

        let item = match source.next_event().await {
            Ok(Some(payload)) => parse_update(&payload),
            Ok(None) => Err(ProgressError::Disconnected),
            Err(e) => Err(ProgressError::Transport(e)),
        };

        match &item {
            Ok(event) if !event.status.is_terminal() => {}
            _ => self.close(),
        }
        Some(item)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel(payloads: &[&str]) -> ProgressChannel {
        let (tx, rx) = mpsc::channel(payloads.len().max(1));
        for p in payloads {
            tx.try_send(p.to_string()).unwrap();
        }
        ProgressChannel::new(ChannelEventSource::new(rx))
    }

    #[test]
    fn parses_known_statuses() {
        let e = parse_update(r#"{"status":"starting","message":"Starting process...","percent":0}"#)
            .unwrap();
        assert_eq!(e.status, ProgressStatus::Processing);

        let e = parse_update(r#"{"status":"paused","message":"paused","percent":30}"#).unwrap();
        assert_eq!(e.status, ProgressStatus::Processing);
        assert_eq!(e.percent, 30);

        let e = parse_update(
            r#"{"status":"complete","message":"done","percent":100,"data":{"pptx_url":"/o/a.pptx"}}"#,
        )
        .unwrap();
        match e.status {
            ProgressStatus::Complete(result) => {
                assert_eq!(result.pptx_url.as_deref(), Some("/o/a.pptx"))
            }
            other => panic!("expected complete, got {:?}", other),
        }

        let e = parse_update(r#"{"status":"error","message":"quota exceeded","percent":0}"#)
            .unwrap();
        assert_eq!(e.status, ProgressStatus::Error);
        assert_eq!(e.message, "quota exceeded");
    }

    #[test]
    fn rejects_unknown_status_and_bad_json() {
        assert!(matches!(
            parse_update(r#"{"status":"exploded"}"#),
            Err(ProgressError::Malformed(_))
        ));
        assert!(matches!(
            parse_update("not json"),
            Err(ProgressError::Malformed(_))
        ));
    }

    #[test]
    fn percent_is_clamped() {
        let e = parse_update(r#"{"status":"processing","percent":140.2}"#).unwrap();
        assert_eq!(e.percent, 100);
        let e = parse_update(r#"{"status":"processing","percent":-3}"#).unwrap();
        assert_eq!(e.percent, 0);
    }

    #[tokio::test]
    async fn closes_after_terminal_event() {
        let mut ch = channel(&[
            r#"{"status":"processing","message":"step 1","percent":40}"#,
            r#"{"status":"complete","message":"done","percent":100,"data":{}}"#,
            r#"{"status":"error","message":"late","percent":0}"#,
        ]);

        let first = ch.next().await.unwrap().unwrap();
        assert_eq!(first.percent, 40);
        assert!(!ch.is_closed());

        let second = ch.next().await.unwrap().unwrap();
        assert!(matches!(second.status, ProgressStatus::Complete(_)));
        assert!(ch.is_closed());

        assert!(ch.next().await.is_none());
    }

    #[tokio::test]
    async fn stream_end_before_terminal_is_a_failure() {
        let (tx, rx) = mpsc::channel(1);
        tx.send(r#"{"status":"processing","percent":10}"#.to_string())
            .await
            .unwrap();
        drop(tx);
        let mut ch = ProgressChannel::new(ChannelEventSource::new(rx));

        assert!(ch.next().await.unwrap().is_ok());
        let err = ch.next().await.unwrap().unwrap_err();
        assert!(matches!(err, ProgressError::Disconnected));
        assert!(err.to_string().starts_with("connection lost"));
        assert!(ch.next().await.is_none());
    }

    #[tokio::test]
    async fn malformed_update_closes_channel() {
        let mut ch = channel(&["{", r#"{"status":"complete"}"#]);
        assert!(ch.next().await.unwrap().is_err());
        assert!(ch.next().await.is_none());
    }
}
