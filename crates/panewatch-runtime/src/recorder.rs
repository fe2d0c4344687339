use std::io::Write;
use std::path::Path;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::messages::SessionTransition;

/// One line of the transition log.
#[derive(Debug, Serialize, Deserialize)]
pub struct RecordedTransition {
    /// Wall-clock time the line was written.
    pub ts: String,
    #[serde(flatten)]
    pub transition: SessionTransition,
}

/// Appends every status transition to a JSONL file.
pub struct Recorder {
    writer: std::fs::File,
    rx: broadcast::Receiver<SessionTransition>,
    cancel: CancellationToken,
}

impl Recorder {
    pub fn new(
        path: &Path,
        rx: broadcast::Receiver<SessionTransition>,
        cancel: CancellationToken,
    ) -> std::io::Result<Self> {
        let writer = std::fs::OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self { writer, rx, cancel })
    }

    /// Write one JSON line per transition until cancelled or the channel
    /// closes.
    pub async fn run(mut self) {
        loop {
            tokio::select! {
                result = self.rx.recv() => {
                    match result {
                        Ok(transition) => self.write(transition),
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            tracing::warn!(skipped = n, "recorder lagged, dropped transitions");
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            tracing::info!("recorder: transition channel closed, stopping");
                            break;
                        }
                    }
                }
                _ = self.cancel.cancelled() => {
                    tracing::info!("recorder: cancellation requested, shutting down");
                    break;
                }
            }
        }
    }

    fn write(&mut self, transition: SessionTransition) {
        let record = RecordedTransition {
            ts: Utc::now().to_rfc3339(),
            transition,
        };
        match serde_json::to_string(&record) {
            Ok(line) => {
                if let Err(e) = writeln!(self.writer, "{line}") {
                    tracing::error!("recorder write failed: {e}");
                }
                if let Err(e) = self.writer.flush() {
                    tracing::error!("recorder flush failed: {e}");
                }
            }
            Err(e) => tracing::error!("recorder serialization failed: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use panewatch_core::{Confidence, SessionStatus};

    fn transition(pane: &str, to: SessionStatus) -> SessionTransition {
        SessionTransition {
            pane_id: pane.into(),
            session_id: Some("s1".into()),
            from: SessionStatus::Idle,
            to,
            confidence: Confidence::Definite,
            reason: "hook".into(),
            at: Utc::now(),
        }
    }

    #[test]
    fn record_line_is_flat() {
        let record = RecordedTransition {
            ts: "2026-02-23T12:00:00+00:00".into(),
            transition: transition("%1", SessionStatus::Working),
        };
        let json = serde_json::to_string(&record).expect("should serialize");
        assert!(json.contains("\"ts\":\"2026-02-23T12:00:00+00:00\""));
        assert!(json.contains("\"pane_id\":\"%1\""));
        assert!(json.contains("\"to\":\"working\""));
    }

    #[tokio::test]
    async fn writes_one_line_per_transition_and_appends() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("transitions.jsonl");
        std::fs::write(&path, "{\"existing\":true}\n").expect("seed");

        let (tx, rx) = broadcast::channel(16);
        let cancel = CancellationToken::new();
        let recorder = Recorder::new(&path, rx, cancel.clone()).expect("open");
        let handle = tokio::spawn(recorder.run());

        tx.send(transition("%1", SessionStatus::Working)).expect("send");
        tx.send(transition("%2", SessionStatus::Waiting)).expect("send");
        drop(tx);
        handle.await.expect("recorder task");

        let content = std::fs::read_to_string(&path).expect("read");
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 3);
        let second: RecordedTransition = serde_json::from_str(lines[2]).expect("parse");
        assert_eq!(second.transition.pane_id, "%2");
        assert_eq!(second.transition.to, SessionStatus::Waiting);
    }

    #[tokio::test]
    async fn stops_on_cancel() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (_tx, rx) = broadcast::channel::<SessionTransition>(4);
        let cancel = CancellationToken::new();
        let recorder = Recorder::new(&dir.path().join("t.jsonl"), rx, cancel.clone()).expect("open");
        let handle = tokio::spawn(recorder.run());
        cancel.cancel();
        tokio::time::timeout(std::time::Duration::from_secs(1), handle)
            .await
            .expect("stopped")
            .expect("join");
    }
}
