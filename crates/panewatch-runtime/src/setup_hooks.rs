//! Install `panewatch hook <Event>` commands into the agent's settings.json.

use std::path::{Path, PathBuf};

use serde_json::{Map, Value, json};

use crate::cli::SetupHooksOpts;

/// Hook events the daemon understands.
pub const HOOK_EVENTS: &[&str] = &[
    "PreToolUse",
    "PostToolUse",
    "UserPromptSubmit",
    "Stop",
    "SubagentStop",
    "Notification",
    "SessionStart",
    "SessionEnd",
];

/// Resolve the settings.json path based on scope.
pub fn settings_path(scope: &str) -> anyhow::Result<PathBuf> {
    match scope {
        "project" => Ok(PathBuf::from(".claude/settings.json")),
        "user" => {
            let home = std::env::var("HOME").map_err(|_| anyhow::anyhow!("HOME not set; cannot resolve user scope"))?;
            Ok(PathBuf::from(home).join(".claude/settings.json"))
        }
        _ => anyhow::bail!("invalid scope: {scope:?} (expected \"project\" or \"user\")"),
    }
}

/// The binary hooks should call: explicit `--binary`, else this executable.
pub fn resolve_binary(explicit: Option<&str>) -> anyhow::Result<String> {
    if let Some(path) = explicit {
        return Ok(path.to_string());
    }
    let exe = std::env::current_exe()?;
    Ok(exe.to_string_lossy().into_owned())
}

/// Wrap in single quotes if the path contains whitespace, quotes, or
/// backslashes. Single quotes inside become `'\''`.
fn shell_quote(path: &str) -> String {
    if path.contains(|c: char| c.is_whitespace() || c == '\'' || c == '"' || c == '\\') {
        format!("'{}'", path.replace('\'', "'\\''"))
    } else {
        path.to_string()
    }
}

pub fn hook_command(binary: &str, event: &str) -> String {
    format!("{} hook {event}", shell_quote(binary))
}

fn is_ours(entry: &Value, event: &str) -> bool {
    let suffix = format!(" hook {event}");
    entry["hooks"]
        .as_array()
        .is_some_and(|hooks| hooks.iter().any(|h| h["command"].as_str().is_some_and(|c| c.ends_with(&suffix))))
}

/// Merge our hook entries into `settings`. Entries from other tools are
/// kept; a previous panewatch entry for the same event is replaced.
pub fn merge_hooks(settings: &mut Value, binary: &str) -> anyhow::Result<()> {
    let obj = settings
        .as_object_mut()
        .ok_or_else(|| anyhow::anyhow!("settings.json is not a JSON object"))?;
    let hooks = obj.entry("hooks").or_insert_with(|| Value::Object(Map::new()));
    let hooks = hooks
        .as_object_mut()
        .ok_or_else(|| anyhow::anyhow!("settings.json \"hooks\" is not a JSON object"))?;

    for event in HOOK_EVENTS {
        let entries = hooks.entry(*event).or_insert_with(|| Value::Array(Vec::new()));
        let entries = entries
            .as_array_mut()
            .ok_or_else(|| anyhow::anyhow!("settings.json hooks.{event} is not an array"))?;
        entries.retain(|e| !is_ours(e, event));
        entries.push(json!({
            "matcher": "",
            "hooks": [{ "type": "command", "command": hook_command(binary, event) }],
        }));
    }
    Ok(())
}

/// Read, merge and write back the settings file at `path`.
pub fn apply_hooks_at(path: &Path, binary: &str) -> anyhow::Result<()> {
    let mut settings: Value = if path.exists() {
        let content = std::fs::read_to_string(path)?;
        serde_json::from_str(&content)?
    } else {
        json!({})
    };
    merge_hooks(&mut settings, binary)?;

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let output = serde_json::to_string_pretty(&settings)?;
    std::fs::write(path, format!("{output}\n"))?;
    Ok(())
}

pub fn apply_hooks(opts: &SetupHooksOpts) -> anyhow::Result<PathBuf> {
    let path = settings_path(&opts.scope)?;
    let binary = resolve_binary(opts.binary.as_deref())?;
    apply_hooks_at(&path, &binary)?;
    Ok(path)
}

// ─── Tests ────────────────────────────────────────────────────────
