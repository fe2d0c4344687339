//! Pane content capture.

use crate::error::TmuxError;
use crate::executor::{CAPTURE_TIMEOUT, TmuxCommandRunner};

/// How much history to capture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureRange {
    /// The last N lines of history plus the visible screen.
    Lines(u32),
    /// Entire scrollback.
    Full,
}

impl CaptureRange {
    fn start_arg(self) -> String {
        match self {
            Self::Lines(n) => format!("-{n}"),
            Self::Full => "-".to_string(),
        }
    }
}

/// Capture plain text. Wrapped lines are joined (`-J`) so the text matches
/// what a human reads; leading whitespace is kept as-is.
pub fn capture(runner: &impl TmuxCommandRunner, target: &str, range: CaptureRange) -> Result<String, TmuxError> {
    run_capture(runner, target, range, false)
}

/// Capture with SGR escapes (`-e`) for clients that render color.
pub fn capture_styled(
    runner: &impl TmuxCommandRunner,
    target: &str,
    range: CaptureRange,
) -> Result<String, TmuxError> {
    run_capture(runner, target, range, true)
}

fn run_capture(
    runner: &impl TmuxCommandRunner,
    target: &str,
    range: CaptureRange,
    escapes: bool,
) -> Result<String, TmuxError> {
    let start = range.start_arg();
    let mut args = vec!["capture-pane", "-p", "-J"];
    if escapes {
        args.push("-e");
    }
    args.extend(["-t", target, "-S", start.as_str()]);
    let output = runner.run(&args, CAPTURE_TIMEOUT)?;
    Ok(trim_trailing_blank_lines(&output).to_string())
}

/// tmux pads the visible screen with empty rows; they carry no content and
/// only churn the fingerprint when the pane is resized.
fn trim_trailing_blank_lines(s: &str) -> &str {
    let trimmed = s.trim_end();
    if trimmed.is_empty() {
        return "";
    }
    // Keep the last line intact up to its newline so trailing spaces on a
    // content line still count.
    let last_nl = trimmed.rfind('\n').map_or(0, |i| i + 1);
    let line_end = s[last_nl..].find('\n').map_or(s.len(), |i| last_nl + i);
    &s[..line_end]
}
