//! Hook ingestion socket.
//!
//! Unix stream socket, newline-delimited JSON. Every non-empty line gets one
//! acknowledgement line back:
//!
//! ```text
//! {"ok":true}
//! {"ok":true,"duplicate":true}
//! {"ok":false,"error":"..."}
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use panewatch_source_hooks::normalize_line;
use serde_json::json;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio_util::sync::CancellationToken;

use crate::reconciler::{HookIngest, Reconciler};

pub struct HookServer {
    socket_path: PathBuf,
    reconciler: Arc<Reconciler>,
}

impl HookServer {
    pub fn new(socket_path: PathBuf, reconciler: Arc<Reconciler>) -> Self {
        Self { socket_path, reconciler }
    }

    /// Bind the socket, replacing a stale one.
    pub async fn bind(&self) -> anyhow::Result<UnixListener> {
        if let Some(parent) = self.socket_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        if self.socket_path.exists() {
            tokio::fs::remove_file(&self.socket_path).await?;
        }
        let listener = UnixListener::bind(&self.socket_path)?;
        tracing::info!(path = %self.socket_path.display(), "hook socket listening");
        Ok(listener)
    }

    pub async fn serve(self, listener: UnixListener, cancel: CancellationToken) {
        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, _addr)) => {
                        let reconciler = Arc::clone(&self.reconciler);
                        let cancel = cancel.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(stream, reconciler, cancel).await {
                                tracing::debug!(error = %e, "hook connection ended with error");
                            }
                        });
                    }
                    Err(e) => tracing::warn!("hook accept error: {e}"),
                },
                _ = cancel.cancelled() => break,
            }
        }
        remove_socket(&self.socket_path);
    }
}

pub fn remove_socket(path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!(path = %path.display(), "failed to remove hook socket: {e}");
        }
    }
}

async fn handle_connection(
    stream: UnixStream,
    reconciler: Arc<Reconciler>,
    cancel: CancellationToken,
) -> std::io::Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = cancel.cancelled() => return Ok(()),
        };
        let Some(line) = line else { return Ok(()) };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let reply = ingest_line(&reconciler, line).await;
        let mut out = reply.to_string();
        out.push('\n');
        write_half.write_all(out.as_bytes()).await?;
    }
}

async fn ingest_line(reconciler: &Arc<Reconciler>, line: &str) -> serde_json::Value {
    let event = match normalize_line(line, Utc::now()) {
        Ok(ev) => ev,
        Err(e) => {
            tracing::debug!(error = %e, "dropping malformed hook payload");
            return json!({"ok": false, "error": e.to_string()});
        }
    };
    match reconciler.ingest_hook(event).await {
        HookIngest::Applied { .. } => json!({"ok": true}),
        HookIngest::Duplicate => json!({"ok": true, "duplicate": true}),
        HookIngest::Unroutable => json!({"ok": false, "error": "no pane for event"}),
    }
}
