//! panewatch-tmux: tmux IO boundary.
//! Subprocess execution with timeouts, topology listing, capture, pane and
//! window commands, and the control-mode line parser. No session logic.

pub mod capture;
pub mod commands;
pub mod control_mode;
pub mod error;
pub mod executor;
pub mod process;
pub mod topology;

pub use capture::{CaptureRange, capture, capture_styled};
pub use commands::{
    SendPayload, SplitDirection, exit_copy_mode, kill_pane, kill_window, new_window, send_keys,
    split_pane,
};
pub use control_mode::{ControlEvent, parse_line};
pub use error::{ErrorCategory, TargetKind, TmuxError};
pub use executor::{CAPTURE_TIMEOUT, STRUCTURAL_TIMEOUT, TmuxCommandRunner, TmuxExecutor};
pub use process::{ProcessInfo, ProcessKind, ProcessMap, classify_process, scan_all_processes};
pub use topology::{
    LIST_PANES_FORMAT, Pane, PaneLine, Window, list_topology, parse_list_panes_output,
    refine_processes,
};
