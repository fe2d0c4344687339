//! Per-session state machine.
//!
//! `SessionState` is owned by the reconciler and mutated only through
//! [`SessionState::apply_hook`] (definite) and [`SessionState::apply_content`]
//! (heuristic). Both are synchronous and total: malformed or unexpected input
//! yields an unchanged outcome, never an error.
//!
//! Timers live outside: `apply_hook` returns a [`GuardAction`] telling the
//! caller to arm or cancel the stop-guard recovery timer, and the timer calls
//! [`SessionState::force_recover`] when it fires.

use crate::patterns::PatternSet;
use crate::types::{
    Confidence, HookEvent, HookKind, PromptKind, PromptOption, PromptSource, Question,
    ReconcileOutcome, SessionStatus,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

// ─── Rules ────────────────────────────────────────────────────────

/// Tool names and limits the hook path depends on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HookRules {
    /// Tools that put a structured question to the user.
    pub ask_user_tools: Vec<String>,
    /// Tools that spawn a sub-task whose lifecycle hooks echo into ours.
    pub subtask_tools: Vec<String>,
    /// Tools that end plan mode by asking for approval.
    pub plan_tools: Vec<String>,
    pub prompt_max_chars: usize,
    /// Sub-tasks older than this are the first to go on an unmatched
    /// subagent-stop.
    pub stale_subtask_secs: u64,
}

impl Default for HookRules {
    fn default() -> Self {
        Self {
            ask_user_tools: vec!["AskUserQuestion".into()],
            subtask_tools: vec!["Task".into(), "Agent".into()],
            plan_tools: vec!["ExitPlanMode".into()],
            prompt_max_chars: 200,
            stale_subtask_secs: 600,
        }
    }
}

impl HookRules {
    fn is_ask_user(&self, tool: &str) -> bool {
        self.ask_user_tools.iter().any(|t| t == tool)
    }

    fn is_subtask(&self, tool: &str) -> bool {
        self.subtask_tools.iter().any(|t| t == tool)
    }

    fn is_plan(&self, tool: &str) -> bool {
        self.plan_tools.iter().any(|t| t == tool)
    }
}

const PLAN_OPTIONS: [&str; 3] = [
    "Yes, and auto-accept edits",
    "Yes, and manually approve edits",
    "No, keep planning",
];

// ─── State ────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subtask {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionError {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool: Option<String>,
    pub message: String,
    pub at: DateTime<Utc>,
}

/// What the caller must do with the pane's stop-guard timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardAction {
    None,
    /// Start the recovery timer unless one is already running.
    Arm,
    /// A legitimate transition superseded the deferred stop.
    Cancel,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HookApplied {
    pub outcome: ReconcileOutcome,
    pub guard: GuardAction,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionState {
    pub pane_id: String,
    pub session_id: Option<String>,
    pub status: SessionStatus,
    pub current_tool: Option<String>,
    pub current_file: Option<String>,
    pub last_prompt: Option<String>,
    pub last_error: Option<SessionError>,
    pub subtasks: Vec<Subtask>,
    pub prompt: PromptKind,
    pub prompt_source: Option<PromptSource>,
    pub last_activity: DateTime<Utc>,
    /// A stop arrived while sub-tasks were active and is waiting on the
    /// recovery timer.
    pub stop_deferred: bool,
    #[serde(skip)]
    last_hook_at: Option<DateTime<Utc>>,
    #[serde(skip)]
    last_content_change: Option<DateTime<Utc>>,
}

/// Fields whose change is worth a snapshot broadcast.
#[derive(PartialEq)]
struct Observable {
    status: SessionStatus,
    prompt: PromptKind,
    current_tool: Option<String>,
    current_file: Option<String>,
    has_error: bool,
    subtasks: usize,
    session_id: Option<String>,
}

impl SessionState {
    pub fn new(pane_id: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            pane_id: pane_id.into(),
            session_id: None,
            status: SessionStatus::Idle,
            current_tool: None,
            current_file: None,
            last_prompt: None,
            last_error: None,
            subtasks: Vec::new(),
            prompt: PromptKind::None,
            prompt_source: None,
            last_activity: now,
            stop_deferred: false,
            last_hook_at: None,
            last_content_change: None,
        }
    }

    pub fn has_pending_prompt(&self) -> bool {
        !self.prompt.is_none()
    }

    pub fn last_hook_at(&self) -> Option<DateTime<Utc>> {
        self.last_hook_at
    }

    fn observable(&self) -> Observable {
        Observable {
            status: self.status,
            prompt: self.prompt.clone(),
            current_tool: self.current_tool.clone(),
            current_file: self.current_file.clone(),
            has_error: self.last_error.is_some(),
            subtasks: self.subtasks.len(),
            session_id: self.session_id.clone(),
        }
    }

    fn outcome(&self, before: Observable, confidence: Confidence, reason: String) -> ReconcileOutcome {
        let after = self.observable();
        ReconcileOutcome {
            changed: before != after,
            previous: before.status,
            status: (after.status != before.status).then_some(after.status),
            prompt: (after.prompt != before.prompt).then(|| after.prompt.clone()),
            confidence,
            reason,
        }
    }

    /// Fresh baseline for a new agent run in this pane.
    fn reset(&mut self) {
        self.status = SessionStatus::Idle;
        self.current_tool = None;
        self.current_file = None;
        self.last_prompt = None;
        self.last_error = None;
        self.subtasks.clear();
        self.clear_prompt();
        self.stop_deferred = false;
    }

    fn clear_prompt(&mut self) {
        self.prompt = PromptKind::None;
        self.prompt_source = None;
    }

    // ─── Hook channel ─────────────────────────────────────────────

    /// Apply one normalized hook event. Idempotent for re-delivered events:
    /// sub-tasks are keyed by id and every assignment is absolute.
    pub fn apply_hook(&mut self, ev: &HookEvent, rules: &HookRules) -> HookApplied {
        let before = self.observable();
        let mut guard = GuardAction::None;
        if ev.timestamp > self.last_activity {
            self.last_activity = ev.timestamp;
        }
        self.last_hook_at = Some(ev.timestamp);

        // A hook from a different agent session in the same pane is either a
        // restarted agent or a nested run echoing into ours.
        let foreign = !ev.session_id.is_empty()
            && self.session_id.as_deref().is_some_and(|sid| sid != ev.session_id);
        let echo = foreign && !self.subtasks.is_empty();
        if foreign && !echo {
            self.reset();
            guard = GuardAction::Cancel;
        }
        if !echo && !ev.session_id.is_empty() {
            self.session_id = Some(ev.session_id.clone());
        }

        // Ongoing activity of our own agent means the deferred stop was an
        // echo; the recovery timer must not force idle over it.
        if !echo
            && matches!(
                ev.kind,
                HookKind::PreToolUse { .. } | HookKind::PostToolUse { .. } | HookKind::Notification { .. }
            )
        {
            self.supersede_deferred_stop(&mut guard);
        }

        let reason = match &ev.kind {
            HookKind::PreToolUse { tool_name, tool_input } => {
                self.last_error = None;
                self.current_tool = Some(tool_name.clone());
                self.current_file = file_from_input(tool_input);
                if rules.is_subtask(tool_name) {
                    self.add_subtask(ev, tool_input, rules);
                }
                if rules.is_ask_user(tool_name) {
                    self.status = SessionStatus::Waiting;
                    self.prompt = question_from_input(tool_input);
                    self.prompt_source = Some(PromptSource::Hook);
                    format!("{tool_name} asked the user")
                } else if rules.is_plan(tool_name) {
                    self.status = SessionStatus::Waiting;
                    self.prompt = PromptKind::PlanApproval {
                        options: PLAN_OPTIONS.iter().map(|l| PromptOption::new(*l)).collect(),
                    };
                    self.prompt_source = Some(PromptSource::Hook);
                    format!("{tool_name} requested plan approval")
                } else {
                    self.status = SessionStatus::Working;
                    if self.prompt_source == Some(PromptSource::Content) {
                        self.clear_prompt();
                    }
                    format!("pre_tool_use {tool_name}")
                }
            }

            HookKind::PostToolUse { tool_name, success, error } => {
                self.current_tool = None;
                self.current_file = None;
                if rules.is_subtask(tool_name) {
                    if let Some(id) = &ev.tool_use_id {
                        self.subtasks.retain(|t| &t.id != id);
                    }
                }
                if *success {
                    let had_prompt = self.has_pending_prompt();
                    self.clear_prompt();
                    self.status = SessionStatus::Working;
                    if had_prompt {
                        format!("{tool_name} answered")
                    } else {
                        format!("post_tool_use {tool_name}")
                    }
                } else {
                    let message = error.clone().unwrap_or_else(|| "tool failed".to_string());
                    self.clear_prompt();
                    self.status = SessionStatus::Error;
                    self.last_error = Some(SessionError {
                        tool: Some(tool_name.clone()),
                        message: message.clone(),
                        at: ev.timestamp,
                    });
                    format!("{tool_name} failed: {message}")
                }
            }

            HookKind::UserPromptSubmit { prompt } => {
                self.status = SessionStatus::Working;
                self.last_error = None;
                self.last_prompt = Some(truncate(prompt, rules.prompt_max_chars));
                self.clear_prompt();
                self.stop_deferred = false;
                guard = GuardAction::Cancel;
                "user prompt submitted".to_string()
            }

            HookKind::Stop => {
                if self.subtasks.is_empty() && !echo {
                    self.status = SessionStatus::Idle;
                    self.current_tool = None;
                    self.current_file = None;
                    self.clear_prompt();
                    self.stop_deferred = false;
                    guard = GuardAction::Cancel;
                    "stop".to_string()
                } else {
                    self.stop_deferred = true;
                    guard = GuardAction::Arm;
                    format!("stop deferred: {} active sub-task(s)", self.subtasks.len())
                }
            }

            HookKind::SubagentStop { agent_id, description } => {
                match self.match_subtask(ev, agent_id.as_deref(), description.as_deref(), rules) {
                    Some((idx, how)) => {
                        let removed = self.subtasks.remove(idx);
                        if self.subtasks.is_empty() {
                            self.supersede_deferred_stop(&mut guard);
                        }
                        format!("sub-task {} finished ({how})", removed.id)
                    }
                    None => "subagent_stop with no active sub-task".to_string(),
                }
            }

            HookKind::Notification { message } => {
                if self.status == SessionStatus::Working || self.status == SessionStatus::Waiting {
                    format!("notification ignored while {}", self.status)
                } else {
                    self.status = SessionStatus::Waiting;
                    format!("notification: {}", truncate(message, rules.prompt_max_chars))
                }
            }

            HookKind::SessionStart { .. } | HookKind::SessionEnd { .. } => {
                let name = ev.kind.name();
                if self.subtasks.is_empty() && !echo {
                    self.reset();
                    self.session_id = (!ev.session_id.is_empty()).then(|| ev.session_id.clone());
                    guard = GuardAction::Cancel;
                    format!("{name}: reset")
                } else {
                    self.stop_deferred = true;
                    guard = GuardAction::Arm;
                    format!("{name} deferred: {} active sub-task(s)", self.subtasks.len())
                }
            }

            HookKind::Unrecognized { name } => format!("ignored unrecognized hook {name}"),
        };

        HookApplied {
            outcome: self.outcome(before, Confidence::Definite, reason),
            guard,
        }
    }

    fn supersede_deferred_stop(&mut self, guard: &mut GuardAction) {
        if self.stop_deferred {
            self.stop_deferred = false;
            *guard = GuardAction::Cancel;
        }
    }

    fn add_subtask(&mut self, ev: &HookEvent, tool_input: &Value, rules: &HookRules) {
        let id = ev
            .tool_use_id
            .clone()
            .unwrap_or_else(|| format!("subtask-{}", ev.timestamp.timestamp_millis()));
        if self.subtasks.iter().any(|t| t.id == id) {
            return;
        }
        let description = str_field(tool_input, &["description", "subagent_type", "prompt"])
            .map(|d| truncate(&d, rules.prompt_max_chars));
        self.subtasks.push(Subtask {
            id,
            description,
            started_at: ev.timestamp,
        });
    }

    /// Pick the sub-task a subagent-stop refers to: explicit id, then a stale
    /// entry, then prefix/description match, then the oldest entry.
    fn match_subtask(
        &self,
        ev: &HookEvent,
        agent_id: Option<&str>,
        description: Option<&str>,
        rules: &HookRules,
    ) -> Option<(usize, &'static str)> {
        if self.subtasks.is_empty() {
            return None;
        }
        let ids: Vec<&str> = [agent_id, ev.tool_use_id.as_deref(), ev.origin_agent.as_deref()]
            .into_iter()
            .flatten()
            .filter(|s| !s.is_empty())
            .collect();

        if let Some(i) = self.subtasks.iter().position(|t| ids.contains(&t.id.as_str())) {
            return Some((i, "id"));
        }

        let stale_after = chrono::Duration::seconds(rules.stale_subtask_secs as i64);
        if let Some(i) = self
            .subtasks
            .iter()
            .position(|t| ev.timestamp - t.started_at > stale_after)
        {
            return Some((i, "stale"));
        }

        let desc = description.map(str::to_lowercase).filter(|d| !d.is_empty());
        if let Some(i) = self.subtasks.iter().position(|t| {
            let prefix = ids
                .iter()
                .any(|id| t.id.starts_with(id) || id.starts_with(t.id.as_str()));
            let described = match (&desc, &t.description) {
                (Some(d), Some(td)) => {
                    let td = td.to_lowercase();
                    td.contains(d.as_str()) || d.contains(td.as_str())
                }
                _ => false,
            };
            prefix || described
        }) {
            return Some((i, "fuzzy"));
        }

        self.subtasks
            .iter()
            .enumerate()
            .min_by_key(|(_, t)| t.started_at)
            .map(|(i, _)| (i, "oldest"))
    }

    /// Stop-guard expiry: no matching subagent-stop arrived in time.
    pub fn force_recover(&mut self, now: DateTime<Utc>) -> ReconcileOutcome {
        let before = self.observable();
        if !self.stop_deferred {
            return ReconcileOutcome::unchanged(self.status, Confidence::Probable, "stop-guard already superseded");
        }
        let outstanding = self.subtasks.len();
        self.subtasks.clear();
        self.status = SessionStatus::Idle;
        self.current_tool = None;
        self.current_file = None;
        self.clear_prompt();
        self.stop_deferred = false;
        self.last_activity = now;
        self.outcome(
            before,
            Confidence::Probable,
            format!("stop-guard expired with {outstanding} sub-task(s) outstanding"),
        )
    }

    // ─── Content channel ──────────────────────────────────────────

    /// Re-classify pane text and correct the status if no recent hook
    /// explains the frame. `fresh` marks text that just changed on screen, as
    /// opposed to a periodic recheck of cached text.
    pub fn apply_content(
        &mut self,
        text: &str,
        patterns: &PatternSet,
        now: DateTime<Utc>,
        grace: Duration,
        fresh: bool,
    ) -> ReconcileOutcome {
        if fresh {
            self.last_content_change = Some(now);
        }
        let before = self.observable();

        if let Some(h) = self.last_hook_at {
            if (now - h).to_std().unwrap_or_default() < grace {
                return ReconcileOutcome::unchanged(self.status, Confidence::Heuristic, "recent hook explains frame");
            }
        }

        let detected = patterns.classify(text);
        if !detected.same_kind(&self.prompt) {
            if self.prompt_source == Some(PromptSource::Hook) {
                return ReconcileOutcome::unchanged(
                    self.status,
                    Confidence::Heuristic,
                    format!("screen shows {} but hook prompt is pending", detected.label()),
                );
            }
            let reason = if detected.is_none() {
                let label = self.prompt.label();
                self.clear_prompt();
                if self.status == SessionStatus::Waiting {
                    self.status = SessionStatus::Idle;
                }
                format!("{label} prompt cleared from screen")
            } else {
                let label = detected.label();
                self.prompt = detected;
                self.prompt_source = Some(PromptSource::Content);
                self.status = SessionStatus::Waiting;
                format!("{label} prompt on screen")
            };
            return self.outcome(before, Confidence::Heuristic, reason);
        }

        // Same kind: refresh details drawn since the last look.
        if self.prompt_source == Some(PromptSource::Content) && detected != self.prompt {
            self.prompt = detected;
        }

        let last_seen = match self.last_content_change {
            Some(c) if c > self.last_activity => c,
            _ => self.last_activity,
        };
        let quiet = (now - last_seen).to_std().unwrap_or_default();
        let Some(c) = patterns.corroborate(text, self.status, quiet) else {
            return self.outcome(before, Confidence::Heuristic, "no corroborating signal".to_string());
        };

        match c.implies {
            SessionStatus::Error => {
                self.last_error = Some(SessionError {
                    tool: self.current_tool.clone(),
                    message: c.evidence.clone(),
                    at: now,
                });
            }
            SessionStatus::Idle => {
                self.current_tool = None;
                self.current_file = None;
                if self.prompt_source == Some(PromptSource::Content) {
                    self.clear_prompt();
                }
            }
            SessionStatus::Working | SessionStatus::Typing | SessionStatus::Waiting => {}
        }
        self.status = c.implies;
        self.outcome(before, c.confidence, format!("{}: {}", c.rule, c.evidence))
    }
}

// ─── Payload helpers ──────────────────────────────────────────────

fn str_field(v: &Value, keys: &[&str]) -> Option<String> {
    keys.iter()
        .find_map(|k| v.get(k).and_then(Value::as_str))
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn file_from_input(input: &Value) -> Option<String> {
    str_field(input, &["file_path", "notebook_path", "path"])
}

fn question_from_input(input: &Value) -> PromptKind {
    let parse_options = |q: &Value| -> Vec<PromptOption> {
        q.get("options")
            .and_then(Value::as_array)
            .map(|opts| {
                opts.iter()
                    .filter_map(|o| match o {
                        Value::String(s) => Some(PromptOption::new(s.as_str())),
                        _ => str_field(o, &["label"]).map(|label| PromptOption {
                            label,
                            description: str_field(o, &["description"]),
                        }),
                    })
                    .collect()
            })
            .unwrap_or_default()
    };

    let questions: Vec<Question> = match input.get("questions").and_then(Value::as_array) {
        Some(items) => items
            .iter()
            .map(|q| Question {
                header: str_field(q, &["header"]),
                question: str_field(q, &["question"]).unwrap_or_default(),
                options: parse_options(q),
                multi_select: q
                    .get("multiSelect")
                    .or_else(|| q.get("multi_select"))
                    .and_then(Value::as_bool)
                    .unwrap_or(false),
            })
            .collect(),
        None => str_field(input, &["question"])
            .map(|question| {
                vec![Question {
                    header: None,
                    question,
                    options: parse_options(input),
                    multi_select: false,
                }]
            })
            .unwrap_or_default(),
    };
    let multi_select = questions.iter().any(|q| q.multi_select);
    PromptKind::Question {
        questions,
        multi_select,
    }
}

/// Cut `s` to at most `max` characters, marking the cut with an ellipsis.
pub fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    let mut out: String = s.chars().take(max.saturating_sub(1)).collect();
    out.push('…');
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).single().expect("valid time")
    }

    fn at(secs: i64) -> DateTime<Utc> {
        t0() + chrono::Duration::seconds(secs)
    }

    fn ev(kind: HookKind, secs: i64) -> HookEvent {
        HookEvent {
            kind,
            session_id: "sess-1".into(),
            pane_id: Some("%1".into()),
            target: None,
            tool_use_id: None,
            origin_agent: None,
            event_id: None,
            timestamp: at(secs),
        }
    }

    fn pre(tool: &str, input: Value, secs: i64) -> HookEvent {
        ev(
            HookKind::PreToolUse {
                tool_name: tool.into(),
                tool_input: input,
            },
            secs,
        )
    }

    fn post(tool: &str, success: bool, error: Option<&str>, secs: i64) -> HookEvent {
        ev(
            HookKind::PostToolUse {
                tool_name: tool.into(),
                success,
                error: error.map(str::to_string),
            },
            secs,
        )
    }

    fn task(id: &str, desc: &str, secs: i64) -> HookEvent {
        let mut e = pre("Task", json!({"description": desc, "prompt": "do it"}), secs);
        e.tool_use_id = Some(id.into());
        e
    }

    fn subagent_stop(agent_id: Option<&str>, description: Option<&str>, secs: i64) -> HookEvent {
        ev(
            HookKind::SubagentStop {
                agent_id: agent_id.map(str::to_string),
                description: description.map(str::to_string),
            },
            secs,
        )
    }

    fn session() -> SessionState {
        SessionState::new("%1", t0())
    }

    #[test]
    fn bash_failure_then_next_tool_clears_error() {
        let rules = HookRules::default();
        let mut s = session();

        let r = s.apply_hook(&pre("Bash", json!({"command": "cargo test"}), 1), &rules);
        assert_eq!(s.status, SessionStatus::Working);
        assert_eq!(s.current_tool.as_deref(), Some("Bash"));
        assert_eq!(r.outcome.status, Some(SessionStatus::Working));
        assert_eq!(r.outcome.confidence, Confidence::Definite);

        s.apply_hook(&post("Bash", false, Some("exit code 101"), 2), &rules);
        assert_eq!(s.status, SessionStatus::Error);
        assert_eq!(s.current_tool, None);
        let err = s.last_error.as_ref().expect("error recorded");
        assert_eq!(err.tool.as_deref(), Some("Bash"));
        assert_eq!(err.message, "exit code 101");

        s.apply_hook(&pre("Read", json!({"file_path": "/src/lib.rs"}), 3), &rules);
        assert_eq!(s.status, SessionStatus::Working);
        assert!(s.last_error.is_none());
        assert_eq!(s.current_file.as_deref(), Some("/src/lib.rs"));
    }

    #[test]
    fn ask_user_question_waits_then_answer_resumes() {
        let rules = HookRules::default();
        let mut s = session();
        let input = json!({
            "questions": [{
                "question": "Which database?",
                "header": "DB",
                "multiSelect": false,
                "options": [
                    {"label": "Postgres", "description": "relational"},
                    {"label": "SQLite"}
                ]
            }]
        });
        let r = s.apply_hook(&pre("AskUserQuestion", input, 1), &rules);
        assert_eq!(s.status, SessionStatus::Waiting);
        match &s.prompt {
            PromptKind::Question { questions, multi_select } => {
                assert!(!multi_select);
                assert_eq!(questions[0].question, "Which database?");
                assert_eq!(questions[0].header.as_deref(), Some("DB"));
                assert_eq!(questions[0].options.len(), 2);
                assert_eq!(questions[0].options[0].description.as_deref(), Some("relational"));
            }
            other => panic!("expected question prompt, got {other:?}"),
        }
        assert!(r.outcome.prompt.is_some());

        let r = s.apply_hook(&post("AskUserQuestion", true, None, 5), &rules);
        assert_eq!(s.status, SessionStatus::Working);
        assert!(s.prompt.is_none());
        assert_eq!(r.outcome.prompt, Some(PromptKind::None));
    }

    #[test]
    fn duplicate_subtask_start_is_idempotent() {
        let rules = HookRules::default();
        let mut s = session();
        let first = s.apply_hook(&task("tu-1", "explore", 1), &rules);
        let second = s.apply_hook(&task("tu-1", "explore", 1), &rules);
        assert_eq!(s.subtasks.len(), 1);
        assert!(first.outcome.changed);
        assert!(!second.outcome.changed);
    }

    #[test]
    fn stop_with_active_subtask_is_deferred_then_recovered() {
        let rules = HookRules::default();
        let mut s = session();
        s.apply_hook(&task("tu-1", "explore", 1), &rules);

        let r = s.apply_hook(&ev(HookKind::Stop, 2), &rules);
        assert_eq!(r.guard, GuardAction::Arm);
        assert_eq!(s.status, SessionStatus::Working);
        assert!(r.outcome.status.is_none());
        assert!(s.stop_deferred);

        let out = s.force_recover(at(7));
        assert_eq!(s.status, SessionStatus::Idle);
        assert!(s.subtasks.is_empty());
        assert!(!s.stop_deferred);
        assert_eq!(out.status, Some(SessionStatus::Idle));
        assert_eq!(out.confidence, Confidence::Probable);
    }

    #[test]
    fn stop_without_subtasks_goes_idle_and_cancels_guard() {
        let rules = HookRules::default();
        let mut s = session();
        s.apply_hook(&pre("Edit", json!({"file_path": "a.rs"}), 1), &rules);
        let r = s.apply_hook(&ev(HookKind::Stop, 2), &rules);
        assert_eq!(r.guard, GuardAction::Cancel);
        assert_eq!(s.status, SessionStatus::Idle);
        assert_eq!(s.current_tool, None);
        assert_eq!(s.current_file, None);
    }

    #[test]
    fn superseded_guard_does_not_force_idle() {
        let rules = HookRules::default();
        let mut s = session();
        s.apply_hook(&task("tu-1", "explore", 1), &rules);
        s.apply_hook(&ev(HookKind::Stop, 2), &rules);
        let r = s.apply_hook(&ev(HookKind::UserPromptSubmit { prompt: "next".into() }, 3), &rules);
        assert_eq!(r.guard, GuardAction::Cancel);
        let out = s.force_recover(at(8));
        assert!(!out.changed);
        assert_eq!(s.status, SessionStatus::Working);
        assert_eq!(s.subtasks.len(), 1);
    }

    #[test]
    fn tool_activity_after_deferred_stop_cancels_guard() {
        let rules = HookRules::default();
        let mut s = session();
        s.apply_hook(&task("tu-t", "explore", 1), &rules);
        s.apply_hook(&ev(HookKind::Stop, 2), &rules);
        assert!(s.stop_deferred);

        let r = s.apply_hook(&pre("Bash", json!({"command": "ls"}), 3), &rules);
        assert_eq!(r.guard, GuardAction::Cancel);
        assert!(!s.stop_deferred);

        let out = s.force_recover(at(8));
        assert!(!out.changed);
        assert_eq!(s.status, SessionStatus::Working);
        assert_eq!(s.current_tool.as_deref(), Some("Bash"));
    }

    #[test]
    fn last_subagent_stop_disarms_deferred_stop() {
        let rules = HookRules::default();
        let mut s = session();
        s.apply_hook(&task("tu-a", "explore", 1), &rules);
        s.apply_hook(&task("tu-b", "write tests", 1), &rules);
        s.apply_hook(&ev(HookKind::Stop, 2), &rules);

        let r = s.apply_hook(&subagent_stop(Some("tu-a"), None, 3), &rules);
        assert_eq!(r.guard, GuardAction::None);
        assert!(s.stop_deferred);

        let r = s.apply_hook(&subagent_stop(Some("tu-b"), None, 4), &rules);
        assert_eq!(r.guard, GuardAction::Cancel);
        assert!(!s.stop_deferred);
        assert!(!s.force_recover(at(9)).changed);
    }

    #[test]
    fn subagent_stop_never_changes_parent_status() {
        let rules = HookRules::default();
        let mut s = session();
        s.apply_hook(&task("tu-1", "explore", 1), &rules);
        let r = s.apply_hook(&subagent_stop(Some("tu-1"), None, 2), &rules);
        assert!(s.subtasks.is_empty());
        assert_eq!(s.status, SessionStatus::Working);
        assert!(r.outcome.status.is_none());
        assert!(r.outcome.reason.contains("(id)"));
    }

    #[test]
    fn subagent_stop_match_order() {
        let rules = HookRules::default();
        let mut s = session();
        s.apply_hook(&task("tu-old", "ancient", 0), &rules);
        s.apply_hook(&task("tu-a", "Search the codebase", 700), &rules);
        s.apply_hook(&task("tu-b", "Write tests", 701), &rules);

        // Explicit id wins over staleness.
        s.apply_hook(&subagent_stop(Some("tu-b"), None, 702), &rules);
        assert_eq!(
            s.subtasks.iter().map(|t| t.id.as_str()).collect::<Vec<_>>(),
            vec!["tu-old", "tu-a"]
        );

        // No id: the stale entry goes before a description match.
        let r = s.apply_hook(&subagent_stop(None, Some("search the codebase"), 703), &rules);
        assert!(r.outcome.reason.contains("(stale)"));
        assert_eq!(s.subtasks.len(), 1);
        assert_eq!(s.subtasks[0].id, "tu-a");

        s.apply_hook(&task("tu-c", "Refactor parser", 704), &rules);
        let r = s.apply_hook(&subagent_stop(None, Some("refactor"), 705), &rules);
        assert!(r.outcome.reason.contains("(fuzzy)"));
        assert_eq!(s.subtasks[0].id, "tu-a");

        let r = s.apply_hook(&subagent_stop(Some("unknown"), None, 706), &rules);
        assert!(r.outcome.reason.contains("(oldest)"));
        assert!(s.subtasks.is_empty());
    }

    #[test]
    fn subtask_post_tool_use_removes_it() {
        let rules = HookRules::default();
        let mut s = session();
        s.apply_hook(&task("tu-1", "explore", 1), &rules);
        let mut done = post("Task", true, None, 9);
        done.tool_use_id = Some("tu-1".into());
        s.apply_hook(&done, &rules);
        assert!(s.subtasks.is_empty());
    }

    #[test]
    fn notification_never_downgrades_working() {
        let rules = HookRules::default();
        let mut s = session();
        s.apply_hook(&pre("Bash", json!({}), 1), &rules);
        let note = ev(HookKind::Notification { message: "Claude needs your permission".into() }, 2);
        let r = s.apply_hook(&note, &rules);
        assert_eq!(s.status, SessionStatus::Working);
        assert!(!r.outcome.changed);

        let mut idle = session();
        idle.apply_hook(&note, &rules);
        assert_eq!(idle.status, SessionStatus::Waiting);
    }

    #[test]
    fn user_prompt_is_truncated() {
        let rules = HookRules {
            prompt_max_chars: 10,
            ..HookRules::default()
        };
        let mut s = session();
        s.apply_hook(&ev(HookKind::UserPromptSubmit { prompt: "please refactor everything".into() }, 1), &rules);
        assert_eq!(s.last_prompt.as_deref(), Some("please re…"));
        assert_eq!(s.last_prompt.as_ref().map(|p| p.chars().count()), Some(10));
    }

    #[test]
    fn session_start_resets_unless_guarded() {
        let rules = HookRules::default();
        let mut s = session();
        s.apply_hook(&post("Bash", false, Some("boom"), 1), &rules);
        s.apply_hook(&ev(HookKind::SessionStart { source: Some("clear".into()) }, 2), &rules);
        assert_eq!(s.status, SessionStatus::Idle);
        assert!(s.last_error.is_none());

        s.apply_hook(&task("tu-1", "explore", 3), &rules);
        let r = s.apply_hook(&ev(HookKind::SessionEnd { reason: None }, 4), &rules);
        assert_eq!(r.guard, GuardAction::Arm);
        assert_eq!(s.subtasks.len(), 1);
        assert_eq!(s.status, SessionStatus::Working);
    }

    #[test]
    fn new_agent_session_in_same_pane_rebinds() {
        let rules = HookRules::default();
        let mut s = session();
        s.apply_hook(&post("Bash", false, Some("boom"), 1), &rules);
        let mut other = pre("Read", json!({}), 2);
        other.session_id = "sess-2".into();
        s.apply_hook(&other, &rules);
        assert_eq!(s.session_id.as_deref(), Some("sess-2"));
        assert!(s.last_error.is_none());
        assert_eq!(s.status, SessionStatus::Working);
    }

    #[test]
    fn nested_session_stop_is_treated_as_echo() {
        let rules = HookRules::default();
        let mut s = session();
        s.apply_hook(&task("tu-1", "explore", 1), &rules);
        let mut child_stop = ev(HookKind::Stop, 2);
        child_stop.session_id = "child".into();
        let r = s.apply_hook(&child_stop, &rules);
        assert_eq!(r.guard, GuardAction::Arm);
        assert_eq!(s.session_id.as_deref(), Some("sess-1"));
        assert_eq!(s.status, SessionStatus::Working);
    }

    #[test]
    fn unrecognized_hook_is_ignored() {
        let rules = HookRules::default();
        let mut s = session();
        let r = s.apply_hook(&ev(HookKind::Unrecognized { name: "PreCompact".into() }, 1), &rules);
        assert!(!r.outcome.changed || r.outcome.status.is_none());
        assert_eq!(s.status, SessionStatus::Idle);
        assert_eq!(r.guard, GuardAction::None);
    }

    #[test]
    fn plan_tool_waits_for_approval() {
        let rules = HookRules::default();
        let mut s = session();
        s.apply_hook(&pre("ExitPlanMode", json!({"plan": "1. do"}), 1), &rules);
        assert_eq!(s.status, SessionStatus::Waiting);
        assert!(matches!(&s.prompt, PromptKind::PlanApproval { options } if options.len() == 3));
    }

    const PERMISSION: &str = " Do you want to proceed?\n ❯ 1. Yes\n   2. No, and tell Claude what to do differently (esc)\n\n Esc to cancel\n";

    #[test]
    fn content_prompt_appears_and_clears() {
        let rules = HookRules::default();
        let patterns = PatternSet::builtin();
        let grace = Duration::from_millis(1500);
        let mut s = session();
        s.apply_hook(&pre("Bash", json!({"command": "rm -rf x"}), 0), &rules);

        // Within grace of the hook: skipped.
        let r = s.apply_content(PERMISSION, &patterns, at(1), grace, true);
        assert!(!r.changed);
        assert_eq!(s.status, SessionStatus::Working);

        let r = s.apply_content(PERMISSION, &patterns, at(3), grace, false);
        assert!(r.changed);
        assert_eq!(r.confidence, Confidence::Heuristic);
        assert_eq!(s.status, SessionStatus::Waiting);
        assert!(matches!(s.prompt, PromptKind::Permission { .. }));

        let r = s.apply_content("⏺ Removed x\n\n> \n", &patterns, at(5), grace, true);
        assert!(r.changed);
        assert!(s.prompt.is_none());
        assert_eq!(s.status, SessionStatus::Idle);
    }

    #[test]
    fn content_cannot_clear_hook_prompt() {
        let rules = HookRules::default();
        let patterns = PatternSet::builtin();
        let mut s = session();
        s.apply_hook(
            &pre("AskUserQuestion", json!({"questions": [{"question": "A or B?", "options": ["A", "B"]}]}), 0),
            &rules,
        );
        let r = s.apply_content("unrelated output\n", &patterns, at(10), Duration::from_millis(1500), true);
        assert!(!r.changed);
        assert_eq!(s.status, SessionStatus::Waiting);
        assert!(s.has_pending_prompt());
    }

    #[test]
    fn corroboration_marks_stale_working_session_errored() {
        let rules = HookRules::default();
        let patterns = PatternSet::builtin();
        let grace = Duration::from_millis(1500);
        let mut s = session();
        s.apply_hook(&ev(HookKind::UserPromptSubmit { prompt: "go".into() }, 0), &rules);

        let screen = "⏺ Thinking\n  ⎿  API Error: 500 {\"type\":\"api_error\"}\n";
        let r = s.apply_content(screen, &patterns, at(2), grace, true);
        assert!(!r.changed, "not quiet long enough yet");

        let r = s.apply_content(screen, &patterns, at(10), grace, false);
        assert_eq!(r.status, Some(SessionStatus::Error));
        assert_eq!(r.confidence, Confidence::Probable);
        assert!(r.reason.starts_with("api-error-banner"));
        assert!(s.last_error.as_ref().is_some_and(|e| e.message.contains("API Error: 500")));
    }

    #[test]
    fn truncate_keeps_short_strings() {
        assert_eq!(truncate("abc", 5), "abc");
        assert_eq!(truncate("abcdef", 4), "abc…");
    }
}
