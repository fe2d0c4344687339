//! Periodic window/pane listing with structural diffing.
//!
//! The poller only broadcasts `windows` when the structural hash moves or a
//! pane disappeared. Pane titles and terminal content are deliberately not
//! hashed: the agent animates its title while working.

use std::collections::{BTreeSet, HashSet};
use std::fmt::Write as _;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use panewatch_core::SessionState;
use panewatch_core::fingerprint::digest;
use panewatch_tmux::{
    ProcessKind, TmuxCommandRunner, TmuxError, Window, list_topology, refine_processes,
    scan_all_processes,
};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::broadcast::Broadcaster;
use crate::config::TopologyConfig;
use crate::messages::OutboundMessage;
use crate::reconciler::Reconciler;

#[derive(Debug, Default, PartialEq, Eq)]
pub struct TickReport {
    pub removed: Vec<String>,
    pub broadcast: bool,
}

pub struct TopologyPoller<R> {
    runner: Arc<R>,
    reconciler: Arc<Reconciler>,
    broadcaster: Arc<Broadcaster>,
    config: TopologyConfig,
    control_active: Arc<AtomicBool>,
    wake: Arc<Notify>,
    previous: HashSet<String>,
    hash: Option<u64>,
}

impl<R: TmuxCommandRunner + 'static> TopologyPoller<R> {
    pub fn new(
        runner: Arc<R>,
        reconciler: Arc<Reconciler>,
        broadcaster: Arc<Broadcaster>,
        config: TopologyConfig,
    ) -> Self {
        Self {
            runner,
            reconciler,
            broadcaster,
            config,
            control_active: Arc::new(AtomicBool::new(false)),
            wake: Arc::new(Notify::new()),
            previous: HashSet::new(),
            hash: None,
        }
    }

    /// Notified to poll immediately (structural control-mode event, pane
    /// vanished under a capture).
    pub fn wake_handle(&self) -> Arc<Notify> {
        Arc::clone(&self.wake)
    }

    /// Set while a control-mode client is attached; slows polling down.
    pub fn control_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.control_active)
    }

    pub async fn tick(&mut self) -> anyhow::Result<TickReport> {
        let runner = Arc::clone(&self.runner);
        let windows = tokio::task::spawn_blocking(move || fetch_windows(&*runner)).await??;

        let current: HashSet<String> = windows
            .iter()
            .flat_map(|w| w.pane_ids())
            .map(str::to_string)
            .collect();
        self.reconciler.set_windows(windows.clone()).await;

        let removed: BTreeSet<String> = self.previous.difference(&current).cloned().collect();
        // Sessions bound to panes no listing ever showed (a hook from another
        // tmux server) are purged without telling clients about a pane they
        // never saw.
        for pane_id in self.reconciler.retain_panes(&current).await {
            if !removed.contains(&pane_id) {
                tracing::debug!(pane_id = %pane_id, "topology: dropped session for unlisted pane");
                self.broadcaster.forget_pane(&pane_id);
            }
        }
        for pane_id in &removed {
            tracing::info!(pane_id = %pane_id, "topology: pane removed");
            self.broadcaster.forget_pane(pane_id);
            self.broadcaster.broadcast(&OutboundMessage::PaneRemoved {
                pane_id: pane_id.clone(),
            });
        }

        let sessions = self.reconciler.sessions().await;
        let hash = structural_hash(&windows, &sessions);
        let changed = self.hash != Some(hash);
        let broadcast = changed || !removed.is_empty();
        if broadcast {
            tracing::debug!(
                panes = current.len(),
                windows = windows.len(),
                hash = format_args!("{hash:016x}"),
                "topology: broadcasting windows"
            );
            self.broadcaster.broadcast(&OutboundMessage::Windows { windows, sessions });
        }
        self.hash = Some(hash);
        self.previous = current;

        Ok(TickReport {
            removed: removed.into_iter().collect(),
            broadcast,
        })
    }

    pub async fn run(mut self, cancel: CancellationToken) {
        loop {
            if let Err(e) = self.tick().await {
                tracing::warn!(error = %e, "topology tick failed");
            }
            let interval = self.config.interval(self.control_active.load(Ordering::Relaxed));
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = self.wake.notified() => tracing::trace!("topology: woken early"),
                _ = cancel.cancelled() => {
                    tracing::info!("topology poller: cancellation requested, shutting down");
                    break;
                }
            }
        }
    }
}

/// List panes; a missing server means there are no panes.
fn fetch_windows(runner: &impl TmuxCommandRunner) -> Result<Vec<Window>, TmuxError> {
    let mut windows = match list_topology(runner) {
        Ok(w) => w,
        Err(TmuxError::Unavailable(detail)) => {
            tracing::debug!(detail = %detail, "topology: tmux unavailable, treating as empty");
            Vec::new()
        }
        Err(e) => return Err(e),
    };
    let ambiguous = windows
        .iter()
        .flat_map(|w| w.panes.iter())
        .any(|p| p.process == ProcessKind::Other);
    if ambiguous {
        refine_processes(&mut windows, &scan_all_processes());
    }
    Ok(windows)
}

/// Hash of everything a dashboard lays out: window and pane identity,
/// process kind and command, and the session fields shown next to a pane.
pub fn structural_hash(windows: &[Window], sessions: &[SessionState]) -> u64 {
    let mut buf = String::new();
    for w in windows {
        let _ = writeln!(buf, "w\t{}\t{}\t{}\t{}", w.id, w.index, w.name, w.session_name);
        for p in &w.panes {
            let _ = writeln!(
                buf,
                "p\t{}\t{}\t{}\t{}\t{}\t{}",
                p.id,
                p.target,
                p.cwd,
                p.process.as_str(),
                p.command,
                p.dead
            );
        }
    }
    for s in sessions {
        let _ = writeln!(
            buf,
            "s\t{}\t{}\t{}\t{}\t{}",
            s.pane_id,
            s.status,
            s.current_tool.as_deref().unwrap_or_default(),
            s.has_pending_prompt(),
            s.last_error.is_some()
        );
    }
    digest(buf.as_bytes())
}
