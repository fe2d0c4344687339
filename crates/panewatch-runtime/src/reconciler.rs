//! Concurrent owner of every pane's `SessionState`.
//!
//! Each pane has its own cell behind a `tokio::sync::Mutex`, so a hook and a
//! capture for the same pane serialize while different panes never block
//! each other. Multiplexer IO never happens under a cell lock: callers
//! capture first and hand the text in.
//!
//! Changes are published while the cell lock is held, which keeps the order
//! of snapshots for one pane identical to the order they were applied in.
//! Publishing never awaits.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use panewatch_core::{
    GuardAction, HookEvent, HookKind, HookRules, PatternRegistry, ReconcileOutcome, SessionState,
    SessionStatus,
};
use panewatch_source_hooks::DedupWindow;
use panewatch_tmux::Window;
use tokio::sync::{Mutex, RwLock, broadcast};
use tokio_util::sync::CancellationToken;

use crate::broadcast::Broadcaster;
use crate::config::{DaemonConfig, ms};
use crate::messages::{OutboundMessage, SessionTransition};

/// Result of handing one hook event to the reconciler.
#[derive(Debug, Clone, PartialEq)]
pub enum HookIngest {
    Applied {
        pane_id: String,
        outcome: ReconcileOutcome,
    },
    /// Same dedup key seen inside the window; nothing was applied.
    Duplicate,
    /// No pane id, no resolvable target and no bound session.
    Unroutable,
}

struct SessionCell {
    state: SessionState,
    /// Last captured text, kept for periodic rechecks.
    snapshot: Option<String>,
}

struct Guard {
    seq: u64,
    token: CancellationToken,
}

pub struct Reconciler {
    cells: RwLock<HashMap<String, Arc<Mutex<SessionCell>>>>,
    windows: RwLock<Vec<Window>>,
    patterns: Arc<PatternRegistry>,
    rules: HookRules,
    hook_grace: Duration,
    stop_guard: Duration,
    dedup: StdMutex<DedupWindow>,
    guards: StdMutex<HashMap<String, Guard>>,
    guard_seq: AtomicU64,
    broadcaster: Arc<Broadcaster>,
    transitions: broadcast::Sender<SessionTransition>,
}

impl Reconciler {
    pub fn new(config: &DaemonConfig, patterns: Arc<PatternRegistry>, broadcaster: Arc<Broadcaster>) -> Self {
        let (transitions, _) = broadcast::channel(256);
        Self {
            cells: RwLock::new(HashMap::new()),
            windows: RwLock::new(Vec::new()),
            patterns,
            rules: config.hooks.clone(),
            hook_grace: ms(config.reconcile.hook_grace_ms),
            stop_guard: ms(config.reconcile.stop_guard_ms),
            dedup: StdMutex::new(DedupWindow::new(&config.dedup)),
            guards: StdMutex::new(HashMap::new()),
            guard_seq: AtomicU64::new(0),
            broadcaster,
            transitions,
        }
    }

    /// Status transitions for collaborators (recorder, external consumers).
    pub fn subscribe_transitions(&self) -> broadcast::Receiver<SessionTransition> {
        self.transitions.subscribe()
    }

    pub fn patterns(&self) -> &PatternRegistry {
        &self.patterns
    }

    // ─── Topology view ────────────────────────────────────────────

    pub async fn set_windows(&self, windows: Vec<Window>) {
        *self.windows.write().await = windows;
    }

    pub async fn windows(&self) -> Vec<Window> {
        self.windows.read().await.clone()
    }

    /// Map a pane target (`sess:win.pane`) or id to the pane id.
    pub async fn pane_for_target(&self, target: &str) -> Option<String> {
        self.windows
            .read()
            .await
            .iter()
            .flat_map(|w| w.panes.iter())
            .find(|p| p.target == target || p.id == target)
            .map(|p| p.id.clone())
    }

    // ─── Cells ────────────────────────────────────────────────────

    async fn cell(&self, pane_id: &str) -> Arc<Mutex<SessionCell>> {
        if let Some(c) = self.cells.read().await.get(pane_id) {
            return Arc::clone(c);
        }
        let mut cells = self.cells.write().await;
        let cell = cells.entry(pane_id.to_string()).or_insert_with(|| {
            Arc::new(Mutex::new(SessionCell {
                state: SessionState::new(pane_id, Utc::now()),
                snapshot: None,
            }))
        });
        Arc::clone(cell)
    }

    fn all_cells(cells: &HashMap<String, Arc<Mutex<SessionCell>>>) -> Vec<Arc<Mutex<SessionCell>>> {
        cells.values().cloned().collect()
    }

    #[cfg(test)]
    pub async fn has_session(&self, pane_id: &str) -> bool {
        self.cells.read().await.contains_key(pane_id)
    }

    pub async fn statuses(&self) -> HashMap<String, SessionStatus> {
        let cells = Self::all_cells(&*self.cells.read().await);
        let mut out = HashMap::with_capacity(cells.len());
        for cell in cells {
            let c = cell.lock().await;
            out.insert(c.state.pane_id.clone(), c.state.status);
        }
        out
    }

    /// Snapshot of every session, ordered by pane id.
    pub async fn sessions(&self) -> Vec<SessionState> {
        let cells = Self::all_cells(&*self.cells.read().await);
        let mut out = Vec::with_capacity(cells.len());
        for cell in cells {
            out.push(cell.lock().await.state.clone());
        }
        out.sort_by(|a, b| a.pane_id.cmp(&b.pane_id));
        out
    }

    pub async fn session(&self, pane_id: &str) -> Option<SessionState> {
        let cell = self.cells.read().await.get(pane_id).cloned()?;
        let state = cell.lock().await.state.clone();
        Some(state)
    }

    /// Purge all derived state for a pane. Returns whether it had any.
    #[cfg(test)]
    pub async fn remove_pane(&self, pane_id: &str) -> bool {
        self.cancel_guard(pane_id);
        self.cells.write().await.remove(pane_id).is_some()
    }

    /// Drop sessions whose pane is not in `live`. Returns the dropped ids.
    pub async fn retain_panes(&self, live: &HashSet<String>) -> Vec<String> {
        let removed: Vec<String> = {
            let mut cells = self.cells.write().await;
            let gone: Vec<String> = cells.keys().filter(|id| !live.contains(*id)).cloned().collect();
            for id in &gone {
                cells.remove(id);
            }
            gone
        };
        for id in &removed {
            self.cancel_guard(id);
        }
        removed
    }

    // ─── Hook channel ─────────────────────────────────────────────

    async fn resolve_pane(&self, ev: &HookEvent) -> Option<String> {
        if let Some(id) = &ev.pane_id {
            return Some(id.clone());
        }
        if let Some(target) = &ev.target {
            if let Some(id) = self.pane_for_target(target).await {
                return Some(id);
            }
        }
        if ev.session_id.is_empty() {
            return None;
        }
        let cells = Self::all_cells(&*self.cells.read().await);
        for cell in cells {
            let c = cell.lock().await;
            if c.state.session_id.as_deref() == Some(ev.session_id.as_str()) {
                return Some(c.state.pane_id.clone());
            }
        }
        None
    }

    /// Dedup, route and apply one hook event, then arm or cancel the pane's
    /// stop-guard as the state machine asks.
    pub async fn ingest_hook(self: &Arc<Self>, ev: HookEvent) -> HookIngest {
        let fresh = self
            .dedup
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .check_and_insert(&ev, ev.timestamp);
        if !fresh {
            tracing::debug!(kind = ev.kind.name(), session_id = %ev.session_id, "hook: duplicate delivery ignored");
            return HookIngest::Duplicate;
        }
        let Some(pane_id) = self.resolve_pane(&ev).await else {
            tracing::warn!(kind = ev.kind.name(), session_id = %ev.session_id, "hook: cannot resolve pane, dropping");
            return HookIngest::Unroutable;
        };
        if let HookKind::Unrecognized { name } = &ev.kind {
            tracing::warn!(pane_id = %pane_id, name = %name, "hook: unrecognized kind ignored");
        }

        let cell = self.cell(&pane_id).await;
        let outcome = {
            let mut c = cell.lock().await;
            let applied = c.state.apply_hook(&ev, &self.rules);
            match applied.guard {
                GuardAction::Arm => self.arm_guard(&pane_id),
                GuardAction::Cancel => self.cancel_guard(&pane_id),
                GuardAction::None => {}
            }
            tracing::debug!(
                pane_id = %pane_id,
                kind = ev.kind.name(),
                changed = applied.outcome.changed,
                status = %c.state.status,
                reason = %applied.outcome.reason,
                "hook applied"
            );
            self.publish(&c.state, &applied.outcome, ev.timestamp);
            applied.outcome
        };

        self.broadcaster.broadcast(&OutboundMessage::Hook { event: ev });
        HookIngest::Applied { pane_id, outcome }
    }

    // ─── Stop-guard ───────────────────────────────────────────────

    fn guards(&self) -> MutexGuard<'_, HashMap<String, Guard>> {
        self.guards.lock().unwrap_or_else(|p| p.into_inner())
    }

    #[cfg(test)]
    pub fn guard_armed(&self, pane_id: &str) -> bool {
        self.guards().get(pane_id).is_some_and(|g| !g.token.is_cancelled())
    }

    /// Start the recovery timer. An already running timer is not extended.
    fn arm_guard(self: &Arc<Self>, pane_id: &str) {
        let mut guards = self.guards();
        if guards.get(pane_id).is_some_and(|g| !g.token.is_cancelled()) {
            return;
        }
        let seq = self.guard_seq.fetch_add(1, Ordering::Relaxed);
        let token = CancellationToken::new();
        guards.insert(
            pane_id.to_string(),
            Guard {
                seq,
                token: token.clone(),
            },
        );
        drop(guards);

        tracing::debug!(pane_id = %pane_id, after = ?self.stop_guard, "stop-guard armed");
        let this = Arc::clone(self);
        let pane_id = pane_id.to_string();
        let after = self.stop_guard;
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(after) => this.fire_guard(&pane_id, seq).await,
                _ = token.cancelled() => {}
            }
        });
    }

    fn cancel_guard(&self, pane_id: &str) {
        if let Some(g) = self.guards().remove(pane_id) {
            g.token.cancel();
            tracing::debug!(pane_id = %pane_id, "stop-guard cancelled");
        }
    }

    async fn fire_guard(&self, pane_id: &str, seq: u64) {
        {
            let mut guards = self.guards();
            match guards.get(pane_id) {
                Some(g) if g.seq == seq => {
                    guards.remove(pane_id);
                }
                _ => return,
            }
        }
        let Some(cell) = self.cells.read().await.get(pane_id).cloned() else {
            return;
        };
        let mut c = cell.lock().await;
        let now = Utc::now();
        let outcome = c.state.force_recover(now);
        if outcome.changed {
            tracing::info!(
                pane_id = %pane_id,
                confidence = %outcome.confidence,
                reason = %outcome.reason,
                "stop-guard recovery"
            );
        }
        self.publish(&c.state, &outcome, now);
    }

    // ─── Content channel ──────────────────────────────────────────

    /// Re-classify freshly captured text for a pane and keep it for rechecks.
    pub async fn ingest_content(&self, pane_id: &str, text: String) -> ReconcileOutcome {
        let cell = self.cell(pane_id).await;
        let mut c = cell.lock().await;
        let outcome = self.apply_content(&mut c, &text, true);
        c.snapshot = Some(text);
        outcome
    }

    /// Re-run the content path over every cached snapshot. Returns how many
    /// sessions changed.
    pub async fn recheck(&self) -> usize {
        let cells = Self::all_cells(&*self.cells.read().await);
        let mut changed = 0;
        for cell in cells {
            let mut c = cell.lock().await;
            let Some(text) = c.snapshot.take() else { continue };
            if self.apply_content(&mut c, &text, false).changed {
                changed += 1;
            }
            c.snapshot = Some(text);
        }
        changed
    }

    /// Periodic [`Reconciler::recheck`] until cancelled.
    pub async fn run_recheck(self: Arc<Self>, every: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(every);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let changed = self.recheck().await;
                    if changed > 0 {
                        tracing::debug!(changed, "recheck updated sessions");
                    }
                }
                _ = cancel.cancelled() => break,
            }
        }
    }

    fn apply_content(&self, c: &mut SessionCell, text: &str, fresh: bool) -> ReconcileOutcome {
        let patterns = self.patterns.current();
        let now = Utc::now();
        let outcome = c.state.apply_content(text, &patterns, now, self.hook_grace, fresh);
        if outcome.changed {
            tracing::info!(
                pane_id = %c.state.pane_id,
                from = %outcome.previous,
                to = %c.state.status,
                confidence = %outcome.confidence,
                reason = %outcome.reason,
                patterns = %patterns.name(),
                "content reconciliation"
            );
        }
        self.publish(&c.state, &outcome, now);
        outcome
    }

    // ─── Publication ──────────────────────────────────────────────

    fn publish(&self, state: &SessionState, outcome: &ReconcileOutcome, at: DateTime<Utc>) {
        if !outcome.changed {
            return;
        }
        self.broadcaster.broadcast(&OutboundMessage::Session { session: state.clone() });
        if !outcome.status_changed() {
            return;
        }
        let transition = SessionTransition {
            pane_id: state.pane_id.clone(),
            session_id: state.session_id.clone(),
            from: outcome.previous,
            to: state.status,
            confidence: outcome.confidence,
            reason: outcome.reason.clone(),
            at,
        };
        // No receivers is fine.
        let _ = self.transitions.send(transition.clone());
        self.broadcaster.broadcast(&OutboundMessage::Transition { transition });
        if state.status == SessionStatus::Error {
            if let Some(err) = &state.last_error {
                self.broadcaster.broadcast(&OutboundMessage::PaneError {
                    pane_id: state.pane_id.clone(),
                    category: "tool_failed".into(),
                    message: err.message.clone(),
                });
            }
        }
    }
}
