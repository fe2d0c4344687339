//! Window/pane listing: format string, parser and grouping.

use crate::error::TmuxError;
use crate::executor::{STRUCTURAL_TIMEOUT, TmuxCommandRunner};
use crate::process::{ProcessKind, ProcessMap, classify_process};
use serde::{Deserialize, Serialize};

/// Tab-delimited format string for `tmux list-panes -a -F`.
pub const LIST_PANES_FORMAT: &str = "#{session_id}\t#{session_name}\t#{window_id}\t#{window_index}\t#{window_name}\t#{window_active}\t#{pane_id}\t#{pane_index}\t#{pane_current_command}\t#{pane_current_path}\t#{pane_title}\t#{pane_width}\t#{pane_height}\t#{pane_active}\t#{pane_dead}\t#{pane_pid}";

const MIN_FIELDS: usize = 14;

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Pane {
    /// Stable tmux id, e.g. `%3`.
    pub id: String,
    /// Human-addressable target, `session:window.pane`.
    pub target: String,
    pub index: u32,
    pub window_id: String,
    pub cwd: String,
    pub command: String,
    pub title: String,
    pub width: u16,
    pub height: u16,
    pub active: bool,
    pub dead: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    pub process: ProcessKind,
}

impl Pane {
    /// Liveness: tmux still runs a process in it.
    pub fn is_alive(&self) -> bool {
        !self.dead
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Window {
    pub id: String,
    pub index: u32,
    pub name: String,
    pub session_id: String,
    pub session_name: String,
    pub active: bool,
    pub panes: Vec<Pane>,
}

impl Window {
    pub fn pane_ids(&self) -> impl Iterator<Item = &str> {
        self.panes.iter().map(|p| p.id.as_str())
    }
}

/// Execute `tmux list-panes -a` and group the panes into windows, in tmux
/// order. Process classification here uses the pane command only; pass a
/// process map to [`refine_processes`] for child inspection.
pub fn list_topology(runner: &impl TmuxCommandRunner) -> Result<Vec<Window>, TmuxError> {
    let output = runner.run(&["list-panes", "-a", "-F", LIST_PANES_FORMAT], STRUCTURAL_TIMEOUT)?;
    let panes = parse_list_panes_output(&output)?;
    Ok(group_windows(panes))
}

/// Re-classify non-agent panes using the host process table.
pub fn refine_processes(windows: &mut [Window], processes: &ProcessMap) {
    for pane in windows.iter_mut().flat_map(|w| w.panes.iter_mut()) {
        if pane.process == ProcessKind::Other {
            pane.process = classify_process(&pane.command, pane.dead, pane.pid, Some(processes));
        }
    }
}

/// One parsed line carries its window's fields too.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaneLine {
    pub session_id: String,
    pub session_name: String,
    pub window_id: String,
    pub window_index: u32,
    pub window_name: String,
    pub window_active: bool,
    pub pane: Pane,
}

/// Parse the raw output of `tmux list-panes -a -F <FORMAT>`.
///
/// Malformed lines are logged and skipped; the listing fails only when
/// there were lines and none of them parsed.
pub fn parse_list_panes_output(output: &str) -> Result<Vec<PaneLine>, TmuxError> {
    let mut panes = Vec::new();
    let mut first_err = None;
    for (idx, line) in output.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match parse_line(line, idx + 1) {
            Ok(pane) => panes.push(pane),
            Err(e) => {
                tracing::warn!(error = %e, "skipping malformed list-panes line");
                first_err.get_or_insert(e);
            }
        }
    }
    match first_err {
        Some(e) if panes.is_empty() => Err(e),
        _ => Ok(panes),
    }
}

fn parse_line(line: &str, line_num: usize) -> Result<PaneLine, TmuxError> {
    let parts: Vec<&str> = line.trim_end_matches(['\r', '\n']).split('\t').collect();
    if parts.len() < MIN_FIELDS {
        return Err(TmuxError::ParseError {
            line_num,
            detail: format!(
                "expected at least {MIN_FIELDS} tab-separated fields, got {}",
                parts.len()
            ),
        });
    }
    if !parts[6].starts_with('%') {
        return Err(TmuxError::ParseError {
            line_num,
            detail: format!("invalid pane id {:?}", parts[6]),
        });
    }

    let window_index = parts[3].parse::<u32>().unwrap_or(0);
    let pane_index = parts[7].parse::<u32>().unwrap_or(0);
    let dead = parts.get(14).is_some_and(|s| parse_bool(s));
    let pid: Option<u32> = parts.get(15).and_then(|s| s.trim().parse().ok());
    let command = parts[8].to_string();

    Ok(PaneLine {
        session_id: parts[0].to_string(),
        session_name: parts[1].to_string(),
        window_id: parts[2].to_string(),
        window_index,
        window_name: parts[4].to_string(),
        window_active: parse_bool(parts[5]),
        pane: Pane {
            id: parts[6].to_string(),
            target: format!("{}:{window_index}.{pane_index}", parts[1]),
            index: pane_index,
            window_id: parts[2].to_string(),
            cwd: parts[9].to_string(),
            process: classify_process(&command, dead, None, None),
            command,
            title: parts[10].to_string(),
            width: parts[11].parse::<u16>().unwrap_or(80),
            height: parts[12].parse::<u16>().unwrap_or(24),
            active: parse_bool(parts[13]),
            dead,
            pid,
        },
    })
}

fn parse_bool(s: &str) -> bool {
    matches!(s.trim(), "1" | "true")
}

fn group_windows(lines: Vec<PaneLine>) -> Vec<Window> {
    let mut windows: Vec<Window> = Vec::new();
    for line in lines {
        match windows.iter_mut().find(|w| w.id == line.window_id) {
            Some(w) => w.panes.push(line.pane),
            None => windows.push(Window {
                id: line.window_id,
                index: line.window_index,
                name: line.window_name,
                session_id: line.session_id,
                session_name: line.session_name,
                active: line.window_active,
                panes: vec![line.pane],
            }),
        }
    }
    windows
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::ProcessInfo;
    use std::time::Duration;

    fn line(pane: &str, window: &str, cmd: &str) -> String {
        format!("$0\tmain\t{window}\t1\tdev\t1\t{pane}\t0\t{cmd}\t  /home/user\tclaude code\t200\t50\t1\t0\t4242")
    }

    #[test]
    fn parse_single_line() {
        let parsed = parse_line(&line("%0", "@0", "zsh"), 1).expect("should parse");
        assert_eq!(parsed.session_name, "main");
        assert_eq!(parsed.window_id, "@0");
        assert_eq!(parsed.window_index, 1);
        let p = parsed.pane;
        assert_eq!(p.id, "%0");
        assert_eq!(p.target, "main:1.0");
        assert_eq!(p.command, "zsh");
        assert_eq!(p.cwd, "  /home/user");
        assert_eq!(p.title, "claude code");
        assert_eq!((p.width, p.height), (200, 50));
        assert!(p.active);
        assert!(!p.dead);
        assert_eq!(p.pid, Some(4242));
        assert_eq!(p.process, ProcessKind::Shell);
    }

    #[test]
    fn dead_pane_is_idle() {
        let l = "$0\tmain\t@0\t0\tdev\t1\t%5\t0\tclaude\t/tmp\tt\t80\t24\t0\t1\t";
        let p = parse_line(l, 1).expect("should parse").pane;
        assert!(p.dead);
        assert!(!p.is_alive());
        assert_eq!(p.process, ProcessKind::Idle);
        assert_eq!(p.pid, None);
    }

    #[test]
    fn too_few_fields_error() {
        assert!(matches!(
            parse_line("$0\tmain\t@0", 7),
            Err(TmuxError::ParseError { line_num: 7, .. })
        ));
    }

    #[test]
    fn malformed_line_is_skipped_not_fatal() {
        // A tab in the window name shifts every later field.
        let bad = "$0\tmain\t@1\t2\tmy\tname\t1\t%7\t0\tzsh\t/h\tt\t80\t24\t1\t0\t1";
        let output = [line("%1", "@0", "claude"), bad.to_string()].join("\n");
        let panes = parse_list_panes_output(&output).expect("good line survives");
        assert_eq!(panes.len(), 1);
        assert_eq!(panes[0].pane.id, "%1");
    }

    #[test]
    fn only_malformed_lines_is_an_error() {
        assert!(matches!(
            parse_list_panes_output("garbage\nmore garbage"),
            Err(TmuxError::ParseError { line_num: 1, .. })
        ));
    }

    #[test]
    fn invalid_dimensions_default() {
        let l = "$0\tmain\t@0\t0\tdev\t1\t%0\t0\tzsh\t/h\tt\tXX\tYY\t1";
        let p = parse_line(l, 1).expect("should parse").pane;
        assert_eq!((p.width, p.height), (80, 24));
    }

    struct MockRunner(String);

    impl TmuxCommandRunner for MockRunner {
        fn run(&self, args: &[&str], _timeout: Duration) -> Result<String, TmuxError> {
            assert_eq!(&args[..3], &["list-panes", "-a", "-F"]);
            Ok(self.0.clone())
        }
    }

    #[test]
    fn groups_panes_by_window_in_order() {
        let output = [
            line("%0", "@0", "zsh"),
            line("%1", "@1", "claude"),
            line("%2", "@0", "vim"),
        ]
        .join("\n");
        let windows = list_topology(&MockRunner(output)).expect("should list");
        assert_eq!(windows.len(), 2);
        assert_eq!(windows[0].id, "@0");
        assert_eq!(windows[0].pane_ids().collect::<Vec<_>>(), vec!["%0", "%2"]);
        assert_eq!(windows[1].panes[0].process, ProcessKind::Agent);
    }

    #[test]
    fn empty_output_is_empty_topology() {
        assert!(list_topology(&MockRunner(String::new())).expect("should list").is_empty());
    }

    #[test]
    fn refine_upgrades_node_running_claude() {
        let mut windows = list_topology(&MockRunner(line("%0", "@0", "node"))).expect("should list");
        assert_eq!(windows[0].panes[0].process, ProcessKind::Other);
        let pm: ProcessMap = [(
            4243,
            ProcessInfo {
                pid: 4243,
                ppid: 4242,
                args: "node /opt/claude/cli.js".into(),
            },
        )]
        .into_iter()
        .collect();
        refine_processes(&mut windows, &pm);
        assert_eq!(windows[0].panes[0].process, ProcessKind::Agent);
    }
}
