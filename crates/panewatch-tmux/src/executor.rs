//! TmuxCommandRunner trait and TmuxExecutor (sync subprocess wrapper with a
//! deadline). Callers on an async runtime go through `spawn_blocking`.

use crate::error::TmuxError;
use std::io::Read;
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

/// Deadline for `capture-pane`.
pub const CAPTURE_TIMEOUT: Duration = Duration::from_secs(1);
/// Deadline for listing and structural commands (split, kill, new-window).
pub const STRUCTURAL_TIMEOUT: Duration = Duration::from_secs(3);

const POLL_STEP: Duration = Duration::from_millis(5);

/// Trait for executing tmux commands. Enables mock injection for testing.
pub trait TmuxCommandRunner: Send + Sync {
    fn run(&self, args: &[&str], timeout: Duration) -> Result<String, TmuxError>;
}

impl<T: TmuxCommandRunner + ?Sized> TmuxCommandRunner for &T {
    fn run(&self, args: &[&str], timeout: Duration) -> Result<String, TmuxError> {
        (**self).run(args, timeout)
    }
}

impl<T: TmuxCommandRunner + ?Sized> TmuxCommandRunner for std::sync::Arc<T> {
    fn run(&self, args: &[&str], timeout: Duration) -> Result<String, TmuxError> {
        (**self).run(args, timeout)
    }
}

/// Real tmux executor using `std::process::Command`.
#[derive(Debug, Clone)]
pub struct TmuxExecutor {
    tmux_bin: String,
    socket_path: Option<String>,
    socket_name: Option<String>,
}

impl TmuxExecutor {
    pub fn new(tmux_bin: impl Into<String>) -> Self {
        Self {
            tmux_bin: tmux_bin.into(),
            socket_path: None,
            socket_name: None,
        }
    }

    #[must_use]
    pub fn with_socket_path(mut self, path: impl Into<String>) -> Self {
        self.socket_path = Some(path.into());
        self
    }

    #[must_use]
    pub fn with_socket_name(mut self, name: impl Into<String>) -> Self {
        self.socket_name = Some(name.into());
        self
    }

    pub fn tmux_bin(&self) -> &str {
        &self.tmux_bin
    }

    /// Global arguments selecting the server socket. Socket path takes
    /// precedence over socket name.
    pub fn socket_args(&self) -> Vec<String> {
        if let Some(ref path) = self.socket_path {
            vec!["-S".into(), path.clone()]
        } else if let Some(ref name) = self.socket_name {
            vec!["-L".into(), name.clone()]
        } else {
            Vec::new()
        }
    }
}

impl Default for TmuxExecutor {
    fn default() -> Self {
        Self::new("tmux")
    }
}

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> thread::JoinHandle<Vec<u8>> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(mut p) = pipe {
            let _ = p.read_to_end(&mut buf);
        }
        buf
    })
}

impl TmuxCommandRunner for TmuxExecutor {
    fn run(&self, args: &[&str], timeout: Duration) -> Result<String, TmuxError> {
        let mut cmd = Command::new(&self.tmux_bin);
        cmd.args(self.socket_args());
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = cmd.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                TmuxError::Unavailable(format!("{} not found", self.tmux_bin))
            } else {
                TmuxError::Io(e)
            }
        })?;

        // Pipes are read on their own threads so a chatty child can't block
        // on a full pipe while we wait for it.
        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());

        let deadline = Instant::now() + timeout;
        let status = loop {
            if let Some(status) = child.try_wait()? {
                break status;
            }
            if Instant::now() >= deadline {
                let _ = child.kill();
                let _ = child.wait();
                return Err(TmuxError::Timeout {
                    command: args.first().copied().unwrap_or_default().to_string(),
                    after: timeout,
                });
            }
            thread::sleep(POLL_STEP);
        };

        let stdout = stdout.join().unwrap_or_default();
        let stderr = stderr.join().unwrap_or_default();
        if !status.success() {
            return Err(TmuxError::from_stderr(&String::from_utf8_lossy(&stderr), status.code()));
        }
        Ok(String::from_utf8_lossy(&stdout).into_owned())
    }
}
