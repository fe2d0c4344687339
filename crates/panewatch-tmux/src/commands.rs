//! Pane and window commands forwarded from clients.

use crate::error::TmuxError;
use crate::executor::{CAPTURE_TIMEOUT, STRUCTURAL_TIMEOUT, TmuxCommandRunner};
use serde::{Deserialize, Serialize};

/// What to type into a pane.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SendPayload {
    /// Literal text, optionally followed by Enter.
    Text { text: String, submit: bool },
    /// tmux key names (`Enter`, `C-c`, `Down`, ...).
    Keys { keys: Vec<String> },
    /// Ctrl-C.
    Interrupt,
    /// Escape, which cancels the agent's pending prompt.
    Dismiss,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SplitDirection {
    #[default]
    Horizontal,
    Vertical,
}

impl SplitDirection {
    fn flag(self) -> &'static str {
        match self {
            Self::Horizontal => "-h",
            Self::Vertical => "-v",
        }
    }
}

pub fn send_keys(runner: &impl TmuxCommandRunner, target: &str, payload: &SendPayload) -> Result<(), TmuxError> {
    match payload {
        SendPayload::Text { text, submit } => {
            if !text.is_empty() {
                // `-l` sends the text literally; `--` keeps a leading dash
                // from being read as a flag.
                runner.run(&["send-keys", "-t", target, "-l", "--", text.as_str()], CAPTURE_TIMEOUT)?;
            }
            if *submit {
                runner.run(&["send-keys", "-t", target, "Enter"], CAPTURE_TIMEOUT)?;
            }
        }
        SendPayload::Keys { keys } => {
            if keys.is_empty() {
                return Ok(());
            }
            let mut args = vec!["send-keys", "-t", target];
            args.extend(keys.iter().map(String::as_str));
            runner.run(&args, CAPTURE_TIMEOUT)?;
        }
        SendPayload::Interrupt => {
            runner.run(&["send-keys", "-t", target, "C-c"], CAPTURE_TIMEOUT)?;
        }
        SendPayload::Dismiss => {
            runner.run(&["send-keys", "-t", target, "Escape"], CAPTURE_TIMEOUT)?;
        }
    }
    Ok(())
}

/// Split `target`, starting the new pane in `cwd` when given. Returns the new
/// pane id.
pub fn split_pane(
    runner: &impl TmuxCommandRunner,
    target: &str,
    cwd: Option<&str>,
    direction: SplitDirection,
) -> Result<String, TmuxError> {
    let mut args = vec!["split-window", direction.flag(), "-t", target, "-P", "-F", "#{pane_id}"];
    if let Some(dir) = cwd.filter(|d| !d.is_empty()) {
        args.extend(["-c", dir]);
    }
    Ok(runner.run(&args, STRUCTURAL_TIMEOUT)?.trim().to_string())
}

/// Create a window in `session`. Returns the new pane id.
pub fn new_window(
    runner: &impl TmuxCommandRunner,
    session: &str,
    cwd: Option<&str>,
    name: Option<&str>,
) -> Result<String, TmuxError> {
    // Trailing colon targets the session rather than a window index.
    let session_target = format!("{}:", session.trim_end_matches(':'));
    let mut args = vec!["new-window", "-t", session_target.as_str(), "-P", "-F", "#{pane_id}"];
    if let Some(dir) = cwd.filter(|d| !d.is_empty()) {
        args.extend(["-c", dir]);
    }
    if let Some(n) = name.filter(|n| !n.is_empty()) {
        args.extend(["-n", n]);
    }
    Ok(runner.run(&args, STRUCTURAL_TIMEOUT)?.trim().to_string())
}

pub fn kill_pane(runner: &impl TmuxCommandRunner, target: &str) -> Result<(), TmuxError> {
    runner.run(&["kill-pane", "-t", target], STRUCTURAL_TIMEOUT)?;
    Ok(())
}

pub fn kill_window(runner: &impl TmuxCommandRunner, target: &str) -> Result<(), TmuxError> {
    runner.run(&["kill-window", "-t", target], STRUCTURAL_TIMEOUT)?;
    Ok(())
}

/// Leave copy mode so the pane scrolls back to the live bottom. A pane that
/// is not in copy mode is fine.
pub fn exit_copy_mode(runner: &impl TmuxCommandRunner, target: &str) -> Result<(), TmuxError> {
    match runner.run(&["send-keys", "-t", target, "-X", "cancel"], CAPTURE_TIMEOUT) {
        Ok(_) => Ok(()),
        Err(TmuxError::CommandFailed(msg)) if msg.contains("not in a mode") => Ok(()),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<Vec<String>>>,
        reply: String,
        fail_with: Option<&'static str>,
    }

    impl Recorder {
        fn calls(&self) -> Vec<Vec<String>> {
            self.calls.lock().expect("lock").clone()
        }
    }

    impl TmuxCommandRunner for Recorder {
        fn run(&self, args: &[&str], _timeout: Duration) -> Result<String, TmuxError> {
            self.calls
                .lock()
                .expect("lock")
                .push(args.iter().map(|s| s.to_string()).collect());
            match self.fail_with {
                Some(stderr) => Err(TmuxError::from_stderr(stderr, Some(1))),
                None => Ok(self.reply.clone()),
            }
        }
    }

    #[test]
    fn send_text_literal_then_enter() {
        let r = Recorder::default();
        let payload = SendPayload::Text {
            text: "-rf is fine".into(),
            submit: true,
        };
        send_keys(&r, "%1", &payload).expect("send");
        assert_eq!(
            r.calls(),
            vec![
                vec!["send-keys", "-t", "%1", "-l", "--", "-rf is fine"],
                vec!["send-keys", "-t", "%1", "Enter"],
            ]
        );
    }

    #[test]
    fn control_payloads() {
        let r = Recorder::default();
        send_keys(&r, "%1", &SendPayload::Interrupt).expect("send");
        send_keys(&r, "%1", &SendPayload::Dismiss).expect("send");
        send_keys(&r, "%1", &SendPayload::Keys { keys: vec!["Down".into(), "Enter".into()] }).expect("send");
        send_keys(&r, "%1", &SendPayload::Keys { keys: vec![] }).expect("send");
        assert_eq!(
            r.calls(),
            vec![
                vec!["send-keys", "-t", "%1", "C-c"],
                vec!["send-keys", "-t", "%1", "Escape"],
                vec!["send-keys", "-t", "%1", "Down", "Enter"],
            ]
        );
    }

    #[test]
    fn split_returns_new_pane_id() {
        let r = Recorder {
            reply: "%12\n".into(),
            ..Recorder::default()
        };
        let id = split_pane(&r, "%1", Some("/work"), SplitDirection::Vertical).expect("split");
        assert_eq!(id, "%12");
        assert_eq!(
            r.calls()[0],
            vec!["split-window", "-v", "-t", "%1", "-P", "-F", "#{pane_id}", "-c", "/work"]
        );
    }

    #[test]
    fn new_window_targets_session() {
        let r = Recorder {
            reply: "%20\n".into(),
            ..Recorder::default()
        };
        assert_eq!(new_window(&r, "main", None, Some("logs")).expect("new window"), "%20");
        assert_eq!(
            r.calls()[0],
            vec!["new-window", "-t", "main:", "-P", "-F", "#{pane_id}", "-n", "logs"]
        );
    }

    #[test]
    fn kill_gone_pane_is_typed() {
        let r = Recorder {
            fail_with: Some("can't find pane: %4"),
            ..Recorder::default()
        };
        let err = kill_pane(&r, "%4").expect_err("pane is gone");
        assert_eq!(err.category(), crate::error::ErrorCategory::PaneGone);
        let err = kill_window(&Recorder { fail_with: Some("can't find window: @4"), ..Recorder::default() }, "@4")
            .expect_err("window is gone");
        assert_eq!(err.category(), crate::error::ErrorCategory::WindowGone);
    }

    #[test]
    fn exit_copy_mode_tolerates_normal_pane() {
        let r = Recorder {
            fail_with: Some("not in a mode"),
            ..Recorder::default()
        };
        exit_copy_mode(&r, "%1").expect("not in copy mode is fine");
    }
}
