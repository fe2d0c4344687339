//! Read-only tmux control-mode client.
//!
//! `tmux -C attach -r` streams `%`-notifications. Pane output pulls that
//! pane's next capture forward; structural notifications wake the topology
//! poller immediately. While attached the poller drops to its slow interval.
//! The client is restarted with capped exponential backoff when tmux goes
//! away, and the daemon keeps working on polling alone in the meantime.

use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use panewatch_tmux::{ControlEvent, TmuxExecutor, parse_line as parse_control_line};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::capture_scheduler::CaptureHints;

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

pub struct ControlMonitor {
    tmux_bin: String,
    socket_args: Vec<String>,
    hints: Arc<CaptureHints>,
    topology_wake: Arc<Notify>,
    active: Arc<AtomicBool>,
}

/// Why a stream ended.
#[derive(Debug, PartialEq, Eq)]
pub enum StreamEnd {
    Exit(String),
    Eof,
    Cancelled,
}

impl ControlMonitor {
    pub fn new(
        executor: &TmuxExecutor,
        hints: Arc<CaptureHints>,
        topology_wake: Arc<Notify>,
        active: Arc<AtomicBool>,
    ) -> Self {
        Self {
            tmux_bin: executor.tmux_bin().to_string(),
            socket_args: executor.socket_args(),
            hints,
            topology_wake,
            active,
        }
    }

    pub async fn run(self, cancel: CancellationToken) {
        let mut backoff = INITIAL_BACKOFF;
        loop {
            match self.attach_once(&cancel).await {
                Ok(StreamEnd::Cancelled) => break,
                Ok(end) => {
                    tracing::info!(?end, "control mode: stream ended");
                    backoff = INITIAL_BACKOFF;
                }
                Err(e) => {
                    tracing::debug!(error = %e, "control mode: attach failed");
                }
            }
            self.active.store(false, Ordering::Relaxed);

            tokio::select! {
                _ = tokio::time::sleep(backoff) => {}
                _ = cancel.cancelled() => break,
            }
            backoff = (backoff * 2).min(MAX_BACKOFF);
        }
        self.active.store(false, Ordering::Relaxed);
        tracing::info!("control mode: shutting down");
    }

    async fn attach_once(&self, cancel: &CancellationToken) -> std::io::Result<StreamEnd> {
        let mut child = Command::new(&self.tmux_bin)
            .args(&self.socket_args)
            .args(["-C", "attach", "-r"])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()?;
        // Closing stdin detaches the client, so keep it for the lifetime of the child.
        let _stdin = child.stdin.take();
        let Some(stdout) = child.stdout.take() else {
            return Err(std::io::Error::other("control mode stdout not captured"));
        };

        tracing::info!("control mode: attached");
        self.active.store(true, Ordering::Relaxed);
        // Anything may have changed while detached.
        self.topology_wake.notify_one();

        let end = consume(BufReader::new(stdout), &self.hints, &self.topology_wake, cancel).await?;
        let _ = child.start_kill();
        let _ = child.wait().await;
        Ok(end)
    }
}

/// Route control-mode lines until exit, EOF or cancellation.
pub async fn consume<Rd: AsyncBufRead + Unpin>(
    reader: Rd,
    hints: &CaptureHints,
    topology_wake: &Notify,
    cancel: &CancellationToken,
) -> std::io::Result<StreamEnd> {
    let mut lines = reader.lines();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = cancel.cancelled() => return Ok(StreamEnd::Cancelled),
        };
        let Some(line) = line else {
            return Ok(StreamEnd::Eof);
        };
        match parse_control_line(&line) {
            Some(ControlEvent::Output { pane_id }) => hints.mark_active(&pane_id),
            Some(ControlEvent::Exit { reason }) => return Ok(StreamEnd::Exit(reason)),
            Some(ev) if ev.is_structural() => {
                tracing::debug!(?ev, "control mode: structural change");
                topology_wake.notify_one();
            }
            Some(_) | None => {}
        }
    }
}
