//! Per-client fan-out with byte-count backpressure.
//!
//! Each client owns an unbounded queue drained by its socket writer, plus a
//! counter of bytes queued but not yet written. Once the counter passes the
//! high-water mark the client is paused: high-priority messages still go
//! through, normal-priority ones are parked (newest per supersede key) and
//! low-priority ones are dropped. A resume check runs every
//! `resume_check_ms` until the counter falls under the low-water mark, then
//! flushes the parked messages in arrival order.
//!
//! `broadcast` never awaits, so a slow client cannot stall the others.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::{BackpressureConfig, ms};
use crate::messages::{OutboundMessage, Priority};

pub type ClientId = u64;

/// Receiving half handed to the client's writer task.
pub struct ClientReceiver {
    rx: mpsc::UnboundedReceiver<String>,
    buffered: Arc<AtomicUsize>,
}

impl ClientReceiver {
    pub async fn recv(&mut self) -> Option<String> {
        self.rx.recv().await
    }

    /// Report `bytes` as written to the socket.
    pub fn ack(&self, bytes: usize) {
        let _ = self
            .buffered
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |b| Some(b.saturating_sub(bytes)));
    }
}

#[derive(Default)]
struct ClientState {
    paused: bool,
    /// Parked normal-priority frames, in arrival order, one per key.
    withheld: Vec<(String, String)>,
    terminals: HashSet<String>,
    dropped: u64,
    /// Frames broadcast before the client's first message went out.
    pending: Option<Vec<String>>,
}

struct Client {
    id: ClientId,
    tx: mpsc::UnboundedSender<String>,
    buffered: Arc<AtomicUsize>,
    state: Mutex<ClientState>,
    cancel: CancellationToken,
}

impl Client {
    fn lock(&self) -> MutexGuard<'_, ClientState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn push(&self, frame: String) -> bool {
        let len = frame.len();
        self.buffered.fetch_add(len, Ordering::AcqRel);
        if self.tx.send(frame).is_err() {
            self.buffered.fetch_sub(len, Ordering::AcqRel);
            return false;
        }
        true
    }

    fn buffered(&self) -> usize {
        self.buffered.load(Ordering::Acquire)
    }

    /// Unpause once the backlog is under `low` and flush the parked frames.
    /// The flush happens under the state lock so no concurrent `offer` can
    /// slip a newer frame ahead of them. Returns the number flushed.
    fn try_resume(&self, low: usize) -> Option<usize> {
        if self.buffered() >= low {
            return None;
        }
        let mut st = self.lock();
        st.paused = false;
        let withheld = std::mem::take(&mut st.withheld);
        let flushed = withheld.len();
        for (_, frame) in withheld {
            self.push(frame);
        }
        Some(flushed)
    }
}

pub struct Broadcaster {
    clients: Mutex<HashMap<ClientId, Arc<Client>>>,
    next_id: AtomicU64,
    config: BackpressureConfig,
}

impl Broadcaster {
    pub fn new(config: BackpressureConfig) -> Self {
        Self {
            clients: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            config,
        }
    }

    fn clients(&self) -> MutexGuard<'_, HashMap<ClientId, Arc<Client>>> {
        self.clients.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn client(&self, id: ClientId) -> Option<Arc<Client>> {
        self.clients().get(&id).cloned()
    }

    pub fn register(&self) -> (ClientId, ClientReceiver) {
        self.register_with(ClientState::default())
    }

    /// Register a client whose broadcasts are held back until [`Broadcaster::start`]
    /// delivers its first message, so a snapshot built after registering
    /// still reaches the client before any update.
    pub fn register_deferred(&self) -> (ClientId, ClientReceiver) {
        self.register_with(ClientState {
            pending: Some(Vec::new()),
            ..ClientState::default()
        })
    }

    /// Send `first` to a deferred client, then everything held back for it.
    pub fn start(&self, id: ClientId, first: &OutboundMessage) {
        let Some(client) = self.client(id) else { return };
        let frame = match first.encode() {
            Ok(f) => f,
            Err(e) => {
                tracing::error!(client = id, error = %e, "broadcast: failed to encode first message");
                return;
            }
        };
        let mut st = client.lock();
        client.push(frame);
        for held in st.pending.take().unwrap_or_default() {
            client.push(held);
        }
    }

    fn register_with(&self, state: ClientState) -> (ClientId, ClientReceiver) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        let buffered = Arc::new(AtomicUsize::new(0));
        let client = Arc::new(Client {
            id,
            tx,
            buffered: Arc::clone(&buffered),
            state: Mutex::new(state),
            cancel: CancellationToken::new(),
        });
        self.clients().insert(id, client);
        tracing::debug!(client = id, "broadcast: client registered");
        (id, ClientReceiver { rx, buffered })
    }

    /// Forget a client and stop its resume check.
    pub fn unregister(&self, id: ClientId) {
        if let Some(client) = self.clients().remove(&id) {
            client.cancel.cancel();
            let dropped = client.lock().dropped;
            tracing::debug!(client = id, dropped, "broadcast: client unregistered");
        }
    }

    pub fn client_count(&self) -> usize {
        self.clients().len()
    }

    pub fn subscribe_terminal(&self, id: ClientId, pane_id: &str) {
        if let Some(c) = self.client(id) {
            c.lock().terminals.insert(pane_id.to_string());
        }
    }

    pub fn unsubscribe_terminal(&self, id: ClientId, pane_id: &str) {
        if let Some(c) = self.client(id) {
            c.lock().terminals.remove(pane_id);
        }
    }

    pub fn has_terminal_subscribers(&self, pane_id: &str) -> bool {
        let clients: Vec<_> = self.clients().values().cloned().collect();
        clients.iter().any(|c| c.lock().terminals.contains(pane_id))
    }

    /// Drop terminal subscriptions for a pane that no longer exists.
    pub fn forget_pane(&self, pane_id: &str) {
        let clients: Vec<_> = self.clients().values().cloned().collect();
        for c in clients {
            c.lock().terminals.remove(pane_id);
        }
    }

    #[cfg(test)]
    pub fn is_paused(&self, id: ClientId) -> bool {
        self.client(id).is_some_and(|c| c.lock().paused)
    }

    /// Deliver to every client, subject to terminal subscriptions and each
    /// client's backpressure state.
    pub fn broadcast(&self, msg: &OutboundMessage) {
        let frame = match msg.encode() {
            Ok(f) => f,
            Err(e) => {
                tracing::error!(kind = msg.type_name(), error = %e, "broadcast: failed to encode message");
                return;
            }
        };
        let clients: Vec<_> = self.clients().values().cloned().collect();
        for client in clients {
            if let Some(pane) = msg.terminal_pane() {
                if !client.lock().terminals.contains(pane) {
                    continue;
                }
            }
            self.offer(&client, msg, frame.clone());
        }
    }

    /// Deliver to a single client (replies, the connect snapshot).
    pub fn send_to(&self, id: ClientId, msg: &OutboundMessage) {
        let Some(client) = self.client(id) else { return };
        match msg.encode() {
            Ok(frame) => self.offer(&client, msg, frame),
            Err(e) => tracing::error!(client = id, error = %e, "broadcast: failed to encode reply"),
        }
    }

    fn offer(&self, client: &Arc<Client>, msg: &OutboundMessage, frame: String) {
        let priority = msg.priority();
        let mut st = client.lock();
        if let Some(pending) = st.pending.as_mut() {
            pending.push(frame);
            return;
        }
        if !st.paused && client.buffered() > self.config.high_water_bytes {
            st.paused = true;
            tracing::debug!(client = client.id, buffered = client.buffered(), "broadcast: client paused");
            self.spawn_resume_check(Arc::clone(client));
        }
        // Push while holding the lock so frames keep their order relative
        // to a resume flush.
        if !st.paused {
            client.push(frame);
            return;
        }
        match priority {
            Priority::High => {
                client.push(frame);
            }
            Priority::Normal => {
                let key = msg.supersede_key();
                match st.withheld.iter_mut().find(|(k, _)| *k == key) {
                    Some(slot) => slot.1 = frame,
                    None => st.withheld.push((key, frame)),
                }
            }
            Priority::Low => st.dropped += 1,
        }
    }

    fn spawn_resume_check(&self, client: Arc<Client>) {
        let low = self.config.low_water_bytes;
        let period = ms(self.config.resume_check_ms);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = client.cancel.cancelled() => return,
                }
                if let Some(flushed) = client.try_resume(low) {
                    tracing::debug!(client = client.id, flushed, "broadcast: client resumed");
                    return;
                }
            }
        });
    }
}
