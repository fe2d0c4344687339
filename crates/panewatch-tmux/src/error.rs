//! Error types for the tmux backend.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetKind {
    Pane,
    Window,
    Session,
}

impl fmt::Display for TargetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Pane => "pane",
            Self::Window => "window",
            Self::Session => "session",
        })
    }
}

#[derive(Debug, Error)]
pub enum TmuxError {
    /// The target no longer exists. Expected when a pane closes between a
    /// topology poll and a capture.
    #[error("{kind} not found: {detail}")]
    NotFound { kind: TargetKind, detail: String },

    #[error("tmux {command} timed out after {after:?}")]
    Timeout { command: String, after: Duration },

    /// No server, unreachable socket or missing binary.
    #[error("tmux unavailable: {0}")]
    Unavailable(String),

    #[error("tmux command failed: {0}")]
    CommandFailed(String),

    #[error("failed to parse list-panes line {line_num}: {detail}")]
    ParseError { line_num: usize, detail: String },

    #[error("tmux io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Stable, client-facing failure classes. Raw tmux stderr never leaves the
/// daemon; clients only ever see one of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    PaneGone,
    SessionGone,
    WindowGone,
    MultiplexerUnreachable,
    SendFailed,
}

impl ErrorCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::PaneGone => "pane_gone",
            Self::SessionGone => "session_gone",
            Self::WindowGone => "window_gone",
            Self::MultiplexerUnreachable => "multiplexer_unreachable",
            Self::SendFailed => "send_failed",
        }
    }

    /// Human-readable message safe to show in a dashboard.
    pub fn message(self) -> &'static str {
        match self {
            Self::PaneGone => "the pane no longer exists",
            Self::SessionGone => "the session no longer exists",
            Self::WindowGone => "the window no longer exists",
            Self::MultiplexerUnreachable => "tmux is not reachable",
            Self::SendFailed => "the command could not be delivered",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TmuxError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::NotFound { kind: TargetKind::Pane, .. } => ErrorCategory::PaneGone,
            Self::NotFound { kind: TargetKind::Window, .. } => ErrorCategory::WindowGone,
            Self::NotFound { kind: TargetKind::Session, .. } => ErrorCategory::SessionGone,
            Self::Timeout { .. } | Self::Unavailable(_) => ErrorCategory::MultiplexerUnreachable,
            Self::CommandFailed(_) | Self::ParseError { .. } | Self::Io(_) => ErrorCategory::SendFailed,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Map tmux stderr to a typed error using the substrings tmux prints.
    pub fn from_stderr(stderr: &str, exit_code: Option<i32>) -> Self {
        let lower = stderr.to_ascii_lowercase();
        let detail = stderr.trim().to_string();
        if lower.contains("can't find pane") || lower.contains("no such pane") {
            Self::NotFound { kind: TargetKind::Pane, detail }
        } else if lower.contains("can't find window") || lower.contains("no such window") {
            Self::NotFound { kind: TargetKind::Window, detail }
        } else if lower.contains("can't find session") || lower.contains("no such session") {
            Self::NotFound { kind: TargetKind::Session, detail }
        } else if lower.contains("no server running")
            || lower.contains("failed to connect to server")
            || lower.contains("error connecting to")
            || lower.contains("server exited")
        {
            Self::Unavailable(detail)
        } else {
            Self::CommandFailed(format!("exit code {}: {detail}", exit_code.unwrap_or(-1)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stderr_mapping() {
        let cases = [
            ("can't find pane: %99", ErrorCategory::PaneGone),
            ("can't find window: @7", ErrorCategory::WindowGone),
            ("can't find session: work", ErrorCategory::SessionGone),
            ("no server running on /tmp/tmux-1000/default", ErrorCategory::MultiplexerUnreachable),
            ("error connecting to /tmp/x (No such file or directory)", ErrorCategory::MultiplexerUnreachable),
            ("unknown command: frobnicate", ErrorCategory::SendFailed),
        ];
        for (stderr, expected) in cases {
            assert_eq!(TmuxError::from_stderr(stderr, Some(1)).category(), expected, "{stderr}");
        }
    }

    #[test]
    fn timeout_is_unreachable() {
        let err = TmuxError::Timeout {
            command: "capture-pane".into(),
            after: Duration::from_secs(1),
        };
        assert_eq!(err.category(), ErrorCategory::MultiplexerUnreachable);
    }

    #[test]
    fn category_serializes_snake_case() {
        let v = serde_json::to_value(ErrorCategory::MultiplexerUnreachable).expect("serialize");
        assert_eq!(v, "multiplexer_unreachable");
        for c in [
            ErrorCategory::PaneGone,
            ErrorCategory::SessionGone,
            ErrorCategory::WindowGone,
            ErrorCategory::SendFailed,
        ] {
            assert_eq!(serde_json::to_value(c).expect("serialize"), c.as_str());
        }
    }

    #[test]
    fn client_message_never_contains_stderr() {
        let err = TmuxError::from_stderr("can't find pane: %secret-path", Some(1));
        assert!(!err.category().message().contains("secret"));
    }
}
