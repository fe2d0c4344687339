//! Adaptive per-pane capture.
//!
//! The scheduler ticks at the shortest interval and captures a pane only
//! when its own interval has elapsed:
//!
//! | condition                                   | interval  |
//! |---------------------------------------------|-----------|
//! | more than `backoff_after` unchanged captures | backoff   |
//! | changed within `active_window_ms`           | active    |
//! | session working or waiting                  | normal    |
//! | otherwise                                   | idle      |
//!
//! Only agent panes, panes with a session and panes somebody watches are
//! captured at all. An unchanged fingerprint stops there; a new one goes to
//! the broadcaster as raw content and to the reconciler for re-classification.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::future::join_all;
use panewatch_core::{SessionStatus, fingerprint};
use panewatch_tmux::{CaptureRange, ErrorCategory, ProcessKind, TmuxCommandRunner, TmuxError, capture_styled};
use tokio::sync::Notify;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::broadcast::Broadcaster;
use crate::config::{CaptureConfig, ms};
use crate::messages::OutboundMessage;
use crate::reconciler::Reconciler;

/// Out-of-band nudges: control-mode output and client refreshes.
#[derive(Default)]
pub struct CaptureHints {
    inner: Mutex<HintSet>,
}

#[derive(Default)]
struct HintSet {
    active: HashSet<String>,
    forced: HashSet<String>,
}

impl CaptureHints {
    /// The pane printed something; use the active interval next tick.
    pub fn mark_active(&self, pane_id: &str) {
        self.lock().active.insert(pane_id.to_string());
    }

    /// Capture on the next tick and re-send even if unchanged.
    pub fn force(&self, pane_id: &str) {
        self.lock().forced.insert(pane_id.to_string());
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HintSet> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn take(&self) -> HintSet {
        std::mem::take(&mut *self.lock())
    }
}

#[derive(Debug, Clone, Default)]
pub struct PaneSchedule {
    pub last_capture: Option<Instant>,
    pub last_change: Option<Instant>,
    pub unchanged: u32,
    pub fingerprint: Option<String>,
}

pub struct CaptureScheduler<R> {
    runner: Arc<R>,
    reconciler: Arc<Reconciler>,
    broadcaster: Arc<Broadcaster>,
    config: CaptureConfig,
    hints: Arc<CaptureHints>,
    topology_wake: Arc<Notify>,
    panes: HashMap<String, PaneSchedule>,
}

impl<R: TmuxCommandRunner + 'static> CaptureScheduler<R> {
    pub fn new(
        runner: Arc<R>,
        reconciler: Arc<Reconciler>,
        broadcaster: Arc<Broadcaster>,
        config: CaptureConfig,
        topology_wake: Arc<Notify>,
    ) -> Self {
        Self {
            runner,
            reconciler,
            broadcaster,
            config,
            hints: Arc::new(CaptureHints::default()),
            topology_wake,
            panes: HashMap::new(),
        }
    }

    pub fn hints(&self) -> Arc<CaptureHints> {
        Arc::clone(&self.hints)
    }

    #[cfg(test)]
    pub fn schedule(&self, pane_id: &str) -> Option<&PaneSchedule> {
        self.panes.get(pane_id)
    }

    pub fn next_interval(&self, sched: &PaneSchedule, status: Option<SessionStatus>, now: Instant) -> Duration {
        let c = &self.config;
        if sched.unchanged > c.backoff_after {
            ms(c.backoff_interval_ms)
        } else if sched
            .last_change
            .is_some_and(|t| now.saturating_duration_since(t) < ms(c.active_window_ms))
        {
            ms(c.active_interval_ms)
        } else if matches!(status, Some(SessionStatus::Working | SessionStatus::Waiting)) {
            ms(c.normal_interval_ms)
        } else {
            ms(c.idle_interval_ms)
        }
    }

    /// Capture every due pane once. Returns how many captures changed.
    pub async fn tick(&mut self) -> usize {
        let now = Instant::now();
        let windows = self.reconciler.windows().await;
        let statuses = self.reconciler.statuses().await;
        let hints = self.hints.take();

        let live: HashSet<&str> = windows.iter().flat_map(|w| w.pane_ids()).collect();
        self.panes.retain(|id, _| live.contains(id.as_str()));

        let mut due: Vec<(String, bool)> = Vec::new();
        for pane in windows.iter().flat_map(|w| w.panes.iter()).filter(|p| p.is_alive()) {
            let status = statuses.get(&pane.id).copied();
            let reconcile = pane.process == ProcessKind::Agent || status.is_some();
            if !reconcile && !self.broadcaster.has_terminal_subscribers(&pane.id) {
                continue;
            }
            let mut sched = self.panes.remove(&pane.id).unwrap_or_default();
            if hints.forced.contains(&pane.id) {
                sched.last_capture = None;
                sched.fingerprint = None;
            }
            let interval = if hints.active.contains(&pane.id) {
                ms(self.config.active_interval_ms)
            } else {
                self.next_interval(&sched, status, now)
            };
            let is_due = sched
                .last_capture
                .is_none_or(|t| now.saturating_duration_since(t) >= interval);
            if is_due {
                sched.last_capture = Some(now);
                due.push((pane.id.clone(), reconcile));
            }
            self.panes.insert(pane.id.clone(), sched);
        }

        let lines = self.config.lines;
        let captures = due.iter().map(|(pane_id, _)| {
            let runner = Arc::clone(&self.runner);
            let pane_id = pane_id.clone();
            tokio::task::spawn_blocking(move || capture_styled(&*runner, &pane_id, CaptureRange::Lines(lines)))
        });
        let results = join_all(captures).await;

        let mut changed = 0;
        for ((pane_id, reconcile), result) in due.into_iter().zip(results) {
            match result {
                Ok(Ok(text)) => {
                    if self.on_capture(&pane_id, text, reconcile, now).await {
                        changed += 1;
                    }
                }
                Ok(Err(e)) => self.on_capture_failed(&pane_id, &e),
                Err(e) => tracing::warn!(pane_id = %pane_id, error = %e, "capture task failed"),
            }
        }
        changed
    }

    async fn on_capture(&mut self, pane_id: &str, text: String, reconcile: bool, now: Instant) -> bool {
        let text = trim_head(text, self.config.max_snapshot_bytes);
        let fp = fingerprint(&text);
        let Some(sched) = self.panes.get_mut(pane_id) else {
            return false;
        };
        if sched.fingerprint.as_deref() == Some(fp.as_str()) {
            sched.unchanged = sched.unchanged.saturating_add(1);
            return false;
        }
        sched.unchanged = 0;
        sched.last_change = Some(now);
        sched.fingerprint = Some(fp.clone());

        self.broadcaster.broadcast(&OutboundMessage::Terminal {
            pane_id: pane_id.to_string(),
            fingerprint: fp,
            content: text.clone(),
        });
        if reconcile {
            self.reconciler.ingest_content(pane_id, text).await;
        }
        true
    }

    fn on_capture_failed(&mut self, pane_id: &str, e: &TmuxError) {
        match e.category() {
            ErrorCategory::PaneGone | ErrorCategory::WindowGone | ErrorCategory::SessionGone => {
                tracing::debug!(pane_id = %pane_id, "capture: pane vanished, waking topology poller");
                self.panes.remove(pane_id);
                self.topology_wake.notify_one();
            }
            ErrorCategory::MultiplexerUnreachable => {
                tracing::debug!(pane_id = %pane_id, error = %e, "capture: tmux unreachable");
            }
            ErrorCategory::SendFailed => {
                tracing::warn!(pane_id = %pane_id, error = %e, "capture failed");
            }
        }
    }

    pub async fn run(mut self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(ms(self.config.active_interval_ms));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.tick().await;
                }
                _ = cancel.cancelled() => {
                    tracing::info!("capture scheduler: cancellation requested, shutting down");
                    break;
                }
            }
        }
    }
}

/// Keep at most `max` bytes from the end of `text`, starting on a line
/// boundary when one is available.
pub fn trim_head(text: String, max: usize) -> String {
    if text.len() <= max {
        return text;
    }
    let mut cut = text.len() - max;
    while !text.is_char_boundary(cut) {
        cut += 1;
    }
    if let Some(nl) = text[cut..].find('\n') {
        cut += nl + 1;
    }
    text[cut..].to_string()
}
