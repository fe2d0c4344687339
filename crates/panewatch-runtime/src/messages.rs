//! Client wire protocol: JSON text frames.
//!
//! Server messages carry a `type` discriminator and a `priority` class.
//! Client requests carry an `id` (echoed in the reply) and an `op`.

use chrono::{DateTime, Utc};
use panewatch_core::{Confidence, HookEvent, SessionState, SessionStatus};
use panewatch_tmux::{SplitDirection, Window};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Delivery class under backpressure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// Dropped while the client is paused.
    Low,
    /// Withheld while paused; only the newest per key is kept.
    Normal,
    /// Always delivered.
    High,
}

/// A status change, as published to clients and to the recorder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionTransition {
    pub pane_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub from: SessionStatus,
    pub to: SessionStatus,
    pub confidence: Confidence,
    pub reason: String,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundMessage {
    /// Full snapshot sent once on connect.
    Hello {
        version: &'static str,
        windows: Vec<Window>,
        sessions: Vec<SessionState>,
    },
    /// Topology plus the status of every bound pane.
    Windows {
        windows: Vec<Window>,
        sessions: Vec<SessionState>,
    },
    Session {
        session: SessionState,
    },
    Transition {
        #[serde(flatten)]
        transition: SessionTransition,
    },
    PaneRemoved {
        pane_id: String,
    },
    /// Tool failure or a failed client operation on a pane.
    PaneError {
        pane_id: String,
        category: String,
        message: String,
    },
    Terminal {
        pane_id: String,
        fingerprint: String,
        content: String,
    },
    /// Echo of an accepted hook event.
    Hook {
        event: HookEvent,
    },
    Ack {
        id: Value,
        #[serde(skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
    },
    Error {
        id: Value,
        category: String,
        message: String,
    },
}

impl OutboundMessage {
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Hello { .. } => "hello",
            Self::Windows { .. } => "windows",
            Self::Session { .. } => "session",
            Self::Transition { .. } => "transition",
            Self::PaneRemoved { .. } => "pane_removed",
            Self::PaneError { .. } => "pane_error",
            Self::Terminal { .. } => "terminal",
            Self::Hook { .. } => "hook",
            Self::Ack { .. } => "ack",
            Self::Error { .. } => "error",
        }
    }

    pub fn priority(&self) -> Priority {
        match self {
            Self::PaneRemoved { .. } | Self::PaneError { .. } | Self::Ack { .. } | Self::Error { .. } => {
                Priority::High
            }
            Self::Hello { .. } | Self::Windows { .. } | Self::Session { .. } | Self::Transition { .. } => {
                Priority::Normal
            }
            Self::Terminal { .. } | Self::Hook { .. } => Priority::Low,
        }
    }

    /// Normal-priority messages with the same key supersede each other.
    pub fn supersede_key(&self) -> String {
        match self {
            Self::Session { session } => format!("session:{}", session.pane_id),
            Self::Transition { transition } => format!("transition:{}", transition.pane_id),
            other => other.type_name().to_string(),
        }
    }

    /// Pane the message is scoped to, when terminal subscriptions apply.
    pub fn terminal_pane(&self) -> Option<&str> {
        match self {
            Self::Terminal { pane_id, .. } => Some(pane_id),
            _ => None,
        }
    }

    /// Serialize with the `priority` field added.
    pub fn encode(&self) -> serde_json::Result<String> {
        let mut value = serde_json::to_value(self)?;
        if let Value::Object(map) = &mut value {
            map.insert("priority".into(), serde_json::to_value(self.priority())?);
        }
        serde_json::to_string(&value)
    }
}

// ─── Client requests ──────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct ClientRequest {
    #[serde(default)]
    pub id: Value,
    #[serde(flatten)]
    pub op: ClientOp,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ClientOp {
    SendText {
        pane_id: String,
        text: String,
        #[serde(default)]
        submit: bool,
    },
    SendKeys {
        pane_id: String,
        keys: Vec<String>,
    },
    Interrupt {
        pane_id: String,
    },
    Dismiss {
        pane_id: String,
    },
    /// Leave copy mode and re-send the pane's content.
    Refresh {
        pane_id: String,
    },
    SplitPane {
        pane_id: String,
        #[serde(default)]
        cwd: Option<String>,
        #[serde(default)]
        direction: SplitDirection,
    },
    NewWindow {
        session: String,
        #[serde(default)]
        cwd: Option<String>,
        #[serde(default)]
        name: Option<String>,
    },
    KillPane {
        pane_id: String,
    },
    KillWindow {
        window_id: String,
    },
    SubscribeTerminal {
        pane_id: String,
    },
    UnsubscribeTerminal {
        pane_id: String,
    },
}

impl ClientOp {
    pub fn name(&self) -> &'static str {
        match self {
            Self::SendText { .. } => "send_text",
            Self::SendKeys { .. } => "send_keys",
            Self::Interrupt { .. } => "interrupt",
            Self::Dismiss { .. } => "dismiss",
            Self::Refresh { .. } => "refresh",
            Self::SplitPane { .. } => "split_pane",
            Self::NewWindow { .. } => "new_window",
            Self::KillPane { .. } => "kill_pane",
            Self::KillWindow { .. } => "kill_window",
            Self::SubscribeTerminal { .. } => "subscribe_terminal",
            Self::UnsubscribeTerminal { .. } => "unsubscribe_terminal",
        }
    }
}
