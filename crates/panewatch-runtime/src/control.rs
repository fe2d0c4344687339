//! Client operations against tmux.
//!
//! Every request is validated before tmux sees it. Tmux failures are reported
//! by stable category only; stderr stays in the log.

use std::sync::Arc;

use panewatch_tmux::{
    SendPayload, TmuxCommandRunner, TmuxError, exit_copy_mode, kill_pane, kill_window, new_window,
    send_keys, split_pane,
};
use serde_json::{Value, json};
use tokio::sync::Notify;

use crate::broadcast::{Broadcaster, ClientId};
use crate::capture_scheduler::CaptureHints;
use crate::messages::{ClientOp, OutboundMessage};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpError {
    pub category: String,
    pub message: String,
}

impl OpError {
    fn invalid(message: impl Into<String>) -> Self {
        Self {
            category: "invalid_request".into(),
            message: message.into(),
        }
    }
}

impl From<&TmuxError> for OpError {
    fn from(e: &TmuxError) -> Self {
        let category = e.category();
        Self {
            category: category.as_str().into(),
            message: category.message().into(),
        }
    }
}

/// A tmux pane id looks like `%12`.
pub fn validate_pane_id(pane_id: &str) -> bool {
    pane_id.len() >= 2 && pane_id.starts_with('%') && pane_id[1..].bytes().all(|b| b.is_ascii_digit())
}

/// A tmux window id looks like `@3`.
pub fn validate_window_id(window_id: &str) -> bool {
    window_id.len() >= 2 && window_id.starts_with('@') && window_id[1..].bytes().all(|b| b.is_ascii_digit())
}

pub struct Controller<R> {
    runner: Arc<R>,
    broadcaster: Arc<Broadcaster>,
    hints: Arc<CaptureHints>,
    topology_wake: Arc<Notify>,
}

impl<R: TmuxCommandRunner + 'static> Controller<R> {
    pub fn new(
        runner: Arc<R>,
        broadcaster: Arc<Broadcaster>,
        hints: Arc<CaptureHints>,
        topology_wake: Arc<Notify>,
    ) -> Self {
        Self {
            runner,
            broadcaster,
            hints,
            topology_wake,
        }
    }

    /// Run one client request. `Ok(Some(_))` carries a result payload for
    /// the ack.
    pub async fn execute(&self, client: ClientId, op: ClientOp) -> Result<Option<Value>, OpError> {
        let name = op.name();
        match op {
            ClientOp::SendText { pane_id, text, submit } => {
                self.send(pane_id, SendPayload::Text { text, submit }).await
            }
            ClientOp::SendKeys { pane_id, keys } => {
                if keys.iter().any(|k| k.is_empty()) {
                    return Err(OpError::invalid("empty key name"));
                }
                self.send(pane_id, SendPayload::Keys { keys }).await
            }
            ClientOp::Interrupt { pane_id } => self.send(pane_id, SendPayload::Interrupt).await,
            ClientOp::Dismiss { pane_id } => self.send(pane_id, SendPayload::Dismiss).await,
            ClientOp::Refresh { pane_id } => {
                check_pane(&pane_id)?;
                let target = pane_id.clone();
                self.tmux(&pane_id, name, move |r| exit_copy_mode(r, &target)).await?;
                self.hints.force(&pane_id);
                Ok(None)
            }
            ClientOp::SplitPane { pane_id, cwd, direction } => {
                check_pane(&pane_id)?;
                let target = pane_id.clone();
                let new_pane = self
                    .tmux(&pane_id, name, move |r| split_pane(r, &target, cwd.as_deref(), direction))
                    .await?;
                self.topology_wake.notify_one();
                Ok(Some(json!({ "pane_id": new_pane })))
            }
            ClientOp::NewWindow { session, cwd, name: window_name } => {
                if session.trim().is_empty() {
                    return Err(OpError::invalid("session must not be empty"));
                }
                let runner = Arc::clone(&self.runner);
                let result = tokio::task::spawn_blocking(move || {
                    new_window(&*runner, &session, cwd.as_deref(), window_name.as_deref())
                })
                .await;
                let new_pane = match flatten(result) {
                    Ok(id) => id,
                    Err(e) => {
                        tracing::warn!(op = name, error = %e, "client operation failed");
                        return Err(OpError::from(&e));
                    }
                };
                self.topology_wake.notify_one();
                Ok(Some(json!({ "pane_id": new_pane })))
            }
            ClientOp::KillPane { pane_id } => {
                check_pane(&pane_id)?;
                let target = pane_id.clone();
                self.tmux(&pane_id, name, move |r| kill_pane(r, &target)).await?;
                self.topology_wake.notify_one();
                Ok(None)
            }
            ClientOp::KillWindow { window_id } => {
                if !validate_window_id(&window_id) {
                    return Err(OpError::invalid(format!("invalid window id {window_id:?}")));
                }
                let runner = Arc::clone(&self.runner);
                let result = tokio::task::spawn_blocking(move || kill_window(&*runner, &window_id)).await;
                if let Err(e) = flatten(result) {
                    tracing::warn!(op = name, error = %e, "client operation failed");
                    return Err(OpError::from(&e));
                }
                self.topology_wake.notify_one();
                Ok(None)
            }
            ClientOp::SubscribeTerminal { pane_id } => {
                check_pane(&pane_id)?;
                self.broadcaster.subscribe_terminal(client, &pane_id);
                // Current content goes out on the next capture tick.
                self.hints.force(&pane_id);
                Ok(None)
            }
            ClientOp::UnsubscribeTerminal { pane_id } => {
                check_pane(&pane_id)?;
                self.broadcaster.unsubscribe_terminal(client, &pane_id);
                Ok(None)
            }
        }
    }

    async fn send(&self, pane_id: String, payload: SendPayload) -> Result<Option<Value>, OpError> {
        check_pane(&pane_id)?;
        let target = pane_id.clone();
        self.tmux(&pane_id, "send_keys", move |r| send_keys(r, &target, &payload))
            .await?;
        self.hints.mark_active(&pane_id);
        Ok(None)
    }

    /// Run a pane-scoped tmux call off the async runtime. Failures are also
    /// broadcast as a high-priority pane error.
    async fn tmux<T, F>(&self, pane_id: &str, op: &'static str, f: F) -> Result<T, OpError>
    where
        T: Send + 'static,
        F: FnOnce(&R) -> Result<T, TmuxError> + Send + 'static,
    {
        let runner = Arc::clone(&self.runner);
        let result = tokio::task::spawn_blocking(move || f(&runner)).await;
        flatten(result).map_err(|e| {
            tracing::warn!(pane_id = %pane_id, op, error = %e, "client operation failed");
            let err = OpError::from(&e);
            self.broadcaster.broadcast(&OutboundMessage::PaneError {
                pane_id: pane_id.to_string(),
                category: err.category.clone(),
                message: err.message.clone(),
            });
            err
        })
    }
}

fn check_pane(pane_id: &str) -> Result<(), OpError> {
    if validate_pane_id(pane_id) {
        Ok(())
    } else {
        Err(OpError::invalid(format!("invalid pane id {pane_id:?}")))
    }
}

fn flatten<T>(result: Result<Result<T, TmuxError>, tokio::task::JoinError>) -> Result<T, TmuxError> {
    result.map_err(|e| TmuxError::Io(std::io::Error::other(e)))?
}
