//! Bounded duplicate suppression for hook deliveries.
//!
//! Key = (kind, session id, tool-use id). Events without a tool-use id fall
//! back to an explicit delivery id, and failing that to a digest of the
//! kind payload under a much shorter window so that legitimately repeated
//! events (two `Stop`s a minute apart) are not swallowed.
//!
//! Eviction is approximate LRU: once the map grows past `capacity`, expired
//! keys are purged and, if that is not enough, the oldest half is dropped.

use chrono::{DateTime, Utc};
use panewatch_core::fingerprint::digest;
use panewatch_core::types::HookEvent;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DedupConfig {
    pub window_secs: u64,
    pub capacity: usize,
    pub untagged_window_ms: u64,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            window_secs: 300,
            capacity: 1000,
            untagged_window_ms: 2000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DedupKey {
    kind: &'static str,
    session_id: String,
    id: DedupId,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum DedupId {
    ToolUse(String),
    Delivery(String),
    Content(u64),
}

impl DedupKey {
    pub fn for_event(ev: &HookEvent) -> Self {
        let id = match (&ev.tool_use_id, &ev.event_id) {
            (Some(t), _) => DedupId::ToolUse(t.clone()),
            (None, Some(e)) => DedupId::Delivery(e.clone()),
            (None, None) => {
                let body = serde_json::to_vec(&ev.kind).unwrap_or_default();
                let pane = ev.pane_id.as_deref().unwrap_or_default();
                DedupId::Content(digest(&body) ^ digest(pane.as_bytes()).rotate_left(1))
            }
        };
        Self {
            kind: ev.kind.name(),
            session_id: ev.session_id.clone(),
            id,
        }
    }

    fn is_untagged(&self) -> bool {
        matches!(self.id, DedupId::Content(_))
    }
}

#[derive(Debug)]
pub struct DedupWindow {
    seen: HashMap<DedupKey, DateTime<Utc>>,
    window: chrono::Duration,
    untagged_window: chrono::Duration,
    capacity: usize,
}

impl DedupWindow {
    pub fn new(config: &DedupConfig) -> Self {
        let to_chrono = |d: Duration| chrono::Duration::from_std(d).unwrap_or(chrono::Duration::MAX);
        Self {
            seen: HashMap::new(),
            window: to_chrono(Duration::from_secs(config.window_secs)),
            untagged_window: to_chrono(Duration::from_millis(config.untagged_window_ms)),
            capacity: config.capacity.max(2),
        }
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    /// Record `ev` and return `true` if it is new, `false` if it is a
    /// re-delivery inside the window. A duplicate does not extend the window.
    pub fn check_and_insert(&mut self, ev: &HookEvent, now: DateTime<Utc>) -> bool {
        let key = DedupKey::for_event(ev);
        let window = if key.is_untagged() { self.untagged_window } else { self.window };
        if let Some(seen_at) = self.seen.get(&key) {
            if now - *seen_at < window {
                return false;
            }
        }
        self.seen.insert(key, now);
        if self.seen.len() > self.capacity {
            self.evict(now);
        }
        true
    }

    fn evict(&mut self, now: DateTime<Utc>) {
        let (window, untagged) = (self.window, self.untagged_window);
        self.seen.retain(|k, t| {
            let w = if k.is_untagged() { untagged } else { window };
            now - *t < w
        });
        if self.seen.len() <= self.capacity {
            return;
        }
        let mut by_age: Vec<(DateTime<Utc>, DedupKey)> =
            self.seen.iter().map(|(k, t)| (*t, k.clone())).collect();
        by_age.sort_by_key(|(t, _)| *t);
        let drop = by_age.len() / 2;
        for (_, key) in by_age.into_iter().take(drop) {
            self.seen.remove(&key);
        }
    }
}
