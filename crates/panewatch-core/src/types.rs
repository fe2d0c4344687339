use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

// ─── Session status ───────────────────────────────────────────────

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    #[default]
    Idle,
    Typing,
    Working,
    Waiting,
    Error,
}

impl SessionStatus {
    pub const ALL: [Self; 5] = [
        Self::Idle,
        Self::Typing,
        Self::Working,
        Self::Waiting,
        Self::Error,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Typing => "typing",
            Self::Working => "working",
            Self::Waiting => "waiting",
            Self::Error => "error",
        }
    }

    /// Statuses where the agent is expected to produce output soon.
    pub fn is_engaged(self) -> bool {
        matches!(self, Self::Working | Self::Waiting)
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SessionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "idle" => Ok(Self::Idle),
            "typing" => Ok(Self::Typing),
            "working" => Ok(Self::Working),
            "waiting" => Ok(Self::Waiting),
            "error" => Ok(Self::Error),
            _ => Err(format!("unknown session status: {s}")),
        }
    }
}

// ─── Confidence ───────────────────────────────────────────────────

/// How much a transition can be trusted. Hooks are `Definite`; everything
/// derived from terminal text is `Probable` or `Heuristic`.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    #[default]
    Heuristic,
    Probable,
    Definite,
}

impl Confidence {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Heuristic => "heuristic",
            Self::Probable => "probable",
            Self::Definite => "definite",
        }
    }
}

impl fmt::Display for Confidence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ─── Structured prompts ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptOption {
    pub label: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl PromptOption {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            description: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Question {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub header: Option<String>,
    pub question: String,
    #[serde(default)]
    pub options: Vec<PromptOption>,
    #[serde(default)]
    pub multi_select: bool,
}

/// What the agent is currently asking the user for, if anything.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PromptKind {
    #[default]
    None,
    Permission {
        options: Vec<PromptOption>,
    },
    Question {
        questions: Vec<Question>,
        multi_select: bool,
    },
    PlanApproval {
        options: Vec<PromptOption>,
    },
}

impl PromptKind {
    pub fn is_none(&self) -> bool {
        matches!(self, Self::None)
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Permission { .. } => "permission",
            Self::Question { .. } => "question",
            Self::PlanApproval { .. } => "plan_approval",
        }
    }

    /// Compare by variant only. Details parsed from the terminal never match
    /// hook-supplied details exactly, so they don't count as a change.
    pub fn same_kind(&self, other: &Self) -> bool {
        std::mem::discriminant(self) == std::mem::discriminant(other)
    }
}

/// Where the current structured prompt came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PromptSource {
    Hook,
    Content,
}

// ─── Hook events ──────────────────────────────────────────────────

/// Closed union of lifecycle events. Unknown upstream names land in
/// `Unrecognized` so schema drift never rejects a payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum HookKind {
    PreToolUse {
        tool_name: String,
        #[serde(default)]
        tool_input: serde_json::Value,
    },
    PostToolUse {
        tool_name: String,
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    UserPromptSubmit {
        prompt: String,
    },
    Stop,
    SubagentStop {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        agent_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        description: Option<String>,
    },
    Notification {
        message: String,
    },
    SessionStart {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        source: Option<String>,
    },
    SessionEnd {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    Unrecognized {
        name: String,
    },
}

impl HookKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::PreToolUse { .. } => "pre_tool_use",
            Self::PostToolUse { .. } => "post_tool_use",
            Self::UserPromptSubmit { .. } => "user_prompt_submit",
            Self::Stop => "stop",
            Self::SubagentStop { .. } => "subagent_stop",
            Self::Notification { .. } => "notification",
            Self::SessionStart { .. } => "session_start",
            Self::SessionEnd { .. } => "session_end",
            Self::Unrecognized { .. } => "unrecognized",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HookEvent {
    #[serde(flatten)]
    pub kind: HookKind,
    pub session_id: String,
    /// Absent when the agent runs outside the multiplexer or the forwarder
    /// could not see `TMUX_PANE`; resolved later through `target` or the
    /// session binding.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pane_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_use_id: Option<String>,
    /// Sub-task that produced this event, when the agent says so.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin_agent: Option<String>,
    /// Explicit delivery id, used for dedup when there is no tool-use id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_id: Option<String>,
    pub timestamp: DateTime<Utc>,
}

// ─── Reconciliation outcome ───────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconcileOutcome {
    pub changed: bool,
    pub previous: SessionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<SessionStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<PromptKind>,
    pub confidence: Confidence,
    pub reason: String,
}

impl ReconcileOutcome {
    pub fn unchanged(previous: SessionStatus, confidence: Confidence, reason: impl Into<String>) -> Self {
        Self {
            changed: false,
            previous,
            status: None,
            prompt: None,
            confidence,
            reason: reason.into(),
        }
    }

    /// Status moved (not just a detail field).
    pub fn status_changed(&self) -> bool {
        self.status.is_some_and(|s| s != self.previous)
    }
}
