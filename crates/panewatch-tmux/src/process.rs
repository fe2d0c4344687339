//! Pane process classification.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// What is running in a pane, as far as the daemon cares.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessKind {
    /// The monitored coding agent.
    Agent,
    /// An interactive shell at its prompt.
    Shell,
    /// Some other foreground program (vim, cargo, node, ...).
    Other,
    /// Dead pane or nothing reported.
    #[default]
    Idle,
}

impl ProcessKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Agent => "agent",
            Self::Shell => "shell",
            Self::Other => "other",
            Self::Idle => "idle",
        }
    }
}

/// One entry from `ps -eo pid=,ppid=,args=`.
#[derive(Debug, Clone)]
pub struct ProcessInfo {
    pub pid: u32,
    pub ppid: u32,
    pub args: String,
}

/// Snapshot of all running processes on the host, keyed by PID.
pub type ProcessMap = HashMap<u32, ProcessInfo>;

const SHELL_CMDS: &[&str] = &[
    "zsh", "bash", "fish", "sh", "csh", "tcsh", "ksh", "dash", "nu", "pwsh",
];

/// Scan all running processes. Returns an empty map on failure (non-fatal:
/// classification falls back to the pane command).
pub fn scan_all_processes() -> ProcessMap {
    let output = match std::process::Command::new("ps")
        .args(["-eo", "pid=,ppid=,args="])
        .output()
    {
        Ok(o) => o,
        Err(_) => return ProcessMap::new(),
    };
    match String::from_utf8(output.stdout) {
        Ok(s) => parse_ps_output(&s),
        Err(_) => ProcessMap::new(),
    }
}

fn parse_ps_output(output: &str) -> ProcessMap {
    output
        .lines()
        .filter_map(parse_ps_line)
        .map(|info| (info.pid, info))
        .collect()
}

fn parse_ps_line(line: &str) -> Option<ProcessInfo> {
    let s = line.trim();
    if s.is_empty() {
        return None;
    }
    let ws = s.find(|c: char| c.is_ascii_whitespace())?;
    let pid: u32 = s[..ws].parse().ok()?;
    let s = s[ws..].trim_start();
    let ws = s.find(|c: char| c.is_ascii_whitespace()).unwrap_or(s.len());
    let ppid: u32 = s[..ws].parse().ok()?;
    let args = s[ws..].trim_start().to_string();
    Some(ProcessInfo { pid, ppid, args })
}

fn is_agent_argv(args: &str) -> bool {
    let lower = args.to_ascii_lowercase();
    lower.contains("claude") && !lower.contains("claude_desktop") && !lower.contains("claude-desktop")
}

/// Claude Code renames its process to its own version ("2.0.14").
fn looks_like_version(cmd: &str) -> bool {
    let parts: Vec<&str> = cmd.split('.').collect();
    parts.len() == 3 && parts.iter().all(|p| !p.is_empty() && p.bytes().all(|b| b.is_ascii_digit()))
}

/// Classify a pane from its current command, and when that is inconclusive,
/// from the argv of the pane process and its direct children.
pub fn classify_process(
    current_cmd: &str,
    dead: bool,
    pane_pid: Option<u32>,
    processes: Option<&ProcessMap>,
) -> ProcessKind {
    let cmd = current_cmd.trim();
    if dead || cmd.is_empty() {
        return ProcessKind::Idle;
    }
    let lower = cmd.to_ascii_lowercase();
    if is_agent_argv(&lower) || looks_like_version(&lower) {
        return ProcessKind::Agent;
    }
    if SHELL_CMDS.iter().any(|&s| lower == s || lower.strip_prefix('-') == Some(s)) {
        return ProcessKind::Shell;
    }

    if let (Some(pid), Some(map)) = (pane_pid, processes) {
        let hit = std::iter::once(pid)
            .chain(map.values().filter(|p| p.ppid == pid).map(|p| p.pid))
            .filter_map(|p| map.get(&p))
            .any(|info| is_agent_argv(&info.args));
        if hit {
            return ProcessKind::Agent;
        }
    }
    ProcessKind::Other
}
