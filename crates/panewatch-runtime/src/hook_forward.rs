//! `panewatch hook <Event>`: relay one agent hook payload to the daemon.
//!
//! The agent blocks on its hooks, so this never fails loudly: a missing
//! daemon, bad input or a timeout all end in exit 0 with nothing on stdout.

use std::path::Path;
use std::time::Duration;

use serde_json::{Map, Value};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;

const STDIN_TIMEOUT: Duration = Duration::from_secs(2);
const SOCKET_TIMEOUT: Duration = Duration::from_secs(2);

/// Attach the event name and the tmux pane to the agent's payload.
pub fn prepare_payload(raw: &str, event: &str, tmux_pane: Option<&str>) -> Value {
    let mut obj = match serde_json::from_str::<Value>(raw) {
        Ok(Value::Object(map)) => map,
        _ => Map::new(),
    };
    if !obj.contains_key("hook_event_name") {
        obj.insert("hook_event_name".into(), Value::from(event));
    }
    if let Some(pane) = tmux_pane.filter(|p| !p.is_empty()) {
        obj.entry("pane_id").or_insert_with(|| Value::from(pane));
    }
    Value::Object(obj)
}

/// Send one payload line and return the daemon's acknowledgement line.
pub async fn send(socket: &Path, payload: &Value) -> anyhow::Result<String> {
    let exchange = async {
        let mut stream = UnixStream::connect(socket).await?;
        let mut line = serde_json::to_string(payload)?;
        line.push('\n');
        stream.write_all(line.as_bytes()).await?;
        let mut ack = String::new();
        BufReader::new(stream).read_line(&mut ack).await?;
        anyhow::Ok(ack.trim().to_string())
    };
    tokio::time::timeout(SOCKET_TIMEOUT, exchange)
        .await
        .map_err(|_| anyhow::anyhow!("hook socket timed out"))?
}

pub async fn run_hook(event: &str, socket: &Path) {
    let mut raw = String::new();
    let read = tokio::time::timeout(STDIN_TIMEOUT, tokio::io::stdin().read_to_string(&mut raw)).await;
    if !matches!(read, Ok(Ok(_))) {
        raw.clear();
    }
    let pane = std::env::var("TMUX_PANE").ok();
    let payload = prepare_payload(&raw, event, pane.as_deref());
    // Errors are swallowed; the agent must not notice the daemon is down.
    let _ = send(socket, &payload).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::net::UnixListener;

    #[test]
    fn payload_gets_event_and_pane() {
        let v = prepare_payload(r#"{"session_id":"s1","tool_name":"Bash"}"#, "PreToolUse", Some("%3"));
        assert_eq!(v["hook_event_name"], "PreToolUse");
        assert_eq!(v["pane_id"], "%3");
        assert_eq!(v["tool_name"], "Bash");
    }

    #[test]
    fn existing_fields_win() {
        let v = prepare_payload(r#"{"hook_event_name":"Stop","pane_id":"%1"}"#, "Notification", Some("%9"));
        assert_eq!(v["hook_event_name"], "Stop");
        assert_eq!(v["pane_id"], "%1");
    }

    #[test]
    fn garbage_input_still_forwards_event() {
        let v = prepare_payload("not json", "Stop", None);
        assert_eq!(v, json!({"hook_event_name": "Stop"}));
        let v = prepare_payload("[1,2]", "Stop", Some(""));
        assert_eq!(v, json!({"hook_event_name": "Stop"}));
    }

    #[tokio::test]
    async fn send_returns_ack_line() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("hook.sock");
        let listener = UnixListener::bind(&path).expect("bind");
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.expect("accept");
            let (r, mut w) = stream.into_split();
            let mut line = String::new();
            BufReader::new(r).read_line(&mut line).await.expect("read");
            assert!(line.contains("\"hook_event_name\":\"Stop\""));
            w.write_all(b"{\"ok\":true}\n").await.expect("write");
        });

        let ack = send(&path, &json!({"hook_event_name": "Stop", "pane_id": "%1"}))
            .await
            .expect("ack");
        assert_eq!(ack, r#"{"ok":true}"#);
    }

    #[tokio::test]
    async fn missing_daemon_is_an_error_not_a_hang() {
        let dir = tempfile::tempdir().expect("tempdir");
        let result = send(&dir.path().join("absent.sock"), &json!({})).await;
        assert!(result.is_err());
    }
}
