//! Raw hook payload → [`HookEvent`].
//!
//! Agents and forwarders disagree on field names: Claude Code sends
//! `hook_event_name` / `session_id` / `tool_use_id`, already-normalized
//! producers send `type` / `sessionId` / `toolUseId`, and some wrap the body
//! in `data`. Every field lookup tries each spelling at the top level and then
//! inside `data`.

use crate::error::HookError;
use chrono::{DateTime, Utc};
use panewatch_core::session::truncate;
use panewatch_core::types::{HookEvent, HookKind};
use serde_json::Value;

const KIND_KEYS: &[&str] = &["hook_event_name", "hookEventName", "hook_type", "hookType", "type", "event"];
const SESSION_KEYS: &[&str] = &["session_id", "sessionId"];
const PANE_KEYS: &[&str] = &["pane_id", "paneId", "tmux_pane", "TMUX_PANE"];
const TARGET_KEYS: &[&str] = &["target", "pane_target", "paneTarget"];
const TOOL_USE_KEYS: &[&str] = &["tool_use_id", "toolUseId"];
const EVENT_ID_KEYS: &[&str] = &["hook_id", "hookId", "event_id", "eventId"];
const ORIGIN_KEYS: &[&str] = &["agent_id", "agentId", "parent_tool_use_id", "parentToolUseId"];
const TOOL_NAME_KEYS: &[&str] = &["tool_name", "toolName", "tool"];
const TOOL_INPUT_KEYS: &[&str] = &["tool_input", "toolInput", "input"];
const TOOL_RESPONSE_KEYS: &[&str] = &["tool_response", "toolResponse", "response"];

const ERROR_MAX_CHARS: usize = 500;

fn lookup<'a>(raw: &'a Value, keys: &[&str]) -> Option<&'a Value> {
    let data = raw.get("data").filter(|d| d.is_object());
    keys.iter()
        .find_map(|k| raw.get(*k).filter(|v| !v.is_null()))
        .or_else(|| data.and_then(|d| keys.iter().find_map(|k| d.get(*k).filter(|v| !v.is_null()))))
}

fn string(raw: &Value, keys: &[&str]) -> Option<String> {
    lookup(raw, keys)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Lowercase, separators removed: `PreToolUse`, `pre_tool_use` and
/// `pre-tool-use` all become `pretooluse`.
fn canonical(name: &str) -> String {
    name.chars()
        .filter(|c| !matches!(c, '_' | '-' | '.' | ' '))
        .flat_map(char::to_lowercase)
        .collect()
}

/// Parse one JSON line and normalize it.
pub fn normalize_line(line: &str, now: DateTime<Utc>) -> Result<HookEvent, HookError> {
    let raw: Value = serde_json::from_str(line)?;
    normalize(&raw, now)
}

/// Normalize a raw payload. `now` becomes the event timestamp; the agent's
/// own clock is not trusted for ordering.
pub fn normalize(raw: &Value, now: DateTime<Utc>) -> Result<HookEvent, HookError> {
    if !raw.is_object() {
        return Err(HookError::NotAnObject);
    }

    let session_id = string(raw, SESSION_KEYS).unwrap_or_default();
    let pane_id = string(raw, PANE_KEYS);
    if session_id.is_empty() && pane_id.is_none() {
        return Err(HookError::Unroutable);
    }

    let name = string(raw, KIND_KEYS).unwrap_or_else(|| "unknown".to_string());
    let kind = kind_from(&name, raw);

    Ok(HookEvent {
        kind,
        session_id,
        pane_id,
        target: string(raw, TARGET_KEYS),
        tool_use_id: string(raw, TOOL_USE_KEYS),
        origin_agent: string(raw, ORIGIN_KEYS),
        event_id: string(raw, EVENT_ID_KEYS),
        timestamp: now,
    })
}

fn kind_from(name: &str, raw: &Value) -> HookKind {
    let tool_name = || string(raw, TOOL_NAME_KEYS).unwrap_or_else(|| "unknown".to_string());
    match canonical(name).as_str() {
        "pretooluse" | "toolstart" => HookKind::PreToolUse {
            tool_name: tool_name(),
            tool_input: lookup(raw, TOOL_INPUT_KEYS).cloned().unwrap_or(Value::Null),
        },
        "posttooluse" | "toolend" => {
            let error = tool_failure(raw);
            HookKind::PostToolUse {
                tool_name: tool_name(),
                success: error.is_none(),
                error,
            }
        }
        "posttoolusefailure" | "toolerror" => HookKind::PostToolUse {
            tool_name: tool_name(),
            success: false,
            error: Some(tool_failure(raw).unwrap_or_else(|| "tool failed".to_string())),
        },
        "userpromptsubmit" | "userprompt" | "promptsubmit" => HookKind::UserPromptSubmit {
            prompt: string(raw, &["prompt", "text", "message"]).unwrap_or_default(),
        },
        "stop" => HookKind::Stop,
        "subagentstop" => HookKind::SubagentStop {
            agent_id: string(raw, &["agent_id", "agentId"]),
            description: string(raw, &["description", "agent_description", "subagent_type"]),
        },
        "notification" => HookKind::Notification {
            message: string(raw, &["message", "text"]).unwrap_or_default(),
        },
        "sessionstart" => HookKind::SessionStart {
            source: string(raw, &["source"]),
        },
        "sessionend" => HookKind::SessionEnd {
            reason: string(raw, &["reason"]),
        },
        _ => HookKind::Unrecognized {
            name: name.to_string(),
        },
    }
}

/// Error message if the payload reports a failed tool call, else `None`.
fn tool_failure(raw: &Value) -> Option<String> {
    let response = lookup(raw, TOOL_RESPONSE_KEYS);
    let scopes = [Some(raw), response];

    let message = || {
        scopes
            .iter()
            .flatten()
            .find_map(|v| string(v, &["error", "error_message", "errorMessage", "stderr"]))
            .or_else(|| response.and_then(Value::as_str).map(str::to_string))
            .map(|m| truncate(&m, ERROR_MAX_CHARS))
            .unwrap_or_else(|| "tool failed".to_string())
    };

    for scope in scopes.iter().flatten() {
        if scope.get("success").and_then(Value::as_bool) == Some(false) {
            return Some(message());
        }
        for key in ["is_error", "isError"] {
            if scope.get(key).and_then(Value::as_bool) == Some(true) {
                return Some(message());
            }
        }
    }
    // A bare error string counts as failure even without a flag.
    scopes
        .iter()
        .flatten()
        .find_map(|v| string(v, &["error", "error_message", "errorMessage"]))
        .map(|m| truncate(&m, ERROR_MAX_CHARS))
}
